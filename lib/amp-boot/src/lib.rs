// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot coordination for the two cores.
//!
//! The primary core drives the sequence: claim the shared pool, create the
//! IPC primitives, publish their whereabouts, launch the secondary core, and
//! wait for it to report in. The secondary's side is much smaller: attach to
//! the boot block the primary placed at the base of the shared region, load
//! the hand-off record, and signal readiness.
//!
//! Readiness is a bitmask with one bit per core. Each core sets only its own
//! bit, with release ordering so that everything the core did before
//! signaling is visible to whoever observes the bit with an acquire load.
//! The boot "state machine" (`PrimaryReady` → `SecondaryLaunching` →
//! `BothReady`) is derived from that mask plus the launch bookkeeping — it
//! is observed, never stored.
//!
//! Every error here is fatal to the boot sequence. A timeout or a
//! wrong-core call means the configuration is broken; the caller should
//! abort startup, not retry.

#![cfg_attr(not(test), no_std)]

mod handoff;

pub use handoff::{HandoffData, HandoffError, HandoffHeader, HANDOFF_AREA};

use abi::{CoreId, LaunchError, Platform, Timeout, CORE_COUNT};
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use counters::{Count, Counter};
use serde::Deserialize;
use shmem::SharedPool;
use static_assertions::const_assert;

/// Shared state at the base of the pool. `ready` carries the per-core
/// readiness bits; `launched` records which cores the primary has requested
/// a start for; `handoff_seq` gates readers of the hand-off area.
#[repr(C)]
struct BootBlock {
    ready: AtomicU32,
    launched: AtomicU32,
    handoff_seq: AtomicU32,
    handoff: [u8; HANDOFF_AREA],
}

// The block is part of the cross-core memory contract; keep its size where a
// hexdump reader expects it.
const_assert!(size_of::<BootBlock>() == 256);

/// Boot progress, derived from shared state on every call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootState {
    /// No core has signaled; `init` has not completed.
    Uninitialized,
    /// The primary is up, no launch requested yet.
    PrimaryReady,
    /// A launch was requested but the target has not signaled.
    SecondaryLaunching,
    /// Both readiness bits are set; the primitives may now be used from
    /// both cores.
    BothReady,
}

/// Error returned by the boot operations. All of these are fatal to the
/// sequence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootError {
    /// `init` was called somewhere other than the primary core.
    WrongCore,
    /// The core id is out of range, or names the primary where only a
    /// secondary makes sense.
    InvalidCore,
    /// `wait_ready` exhausted its budget.
    Timeout,
    /// The pool could not fit the boot block.
    OutOfSpace,
    /// The platform's launch sequence failed.
    Launch(LaunchError),
}

impl From<LaunchError> for BootError {
    fn from(e: LaunchError) -> Self {
        BootError::Launch(e)
    }
}

impl From<shmem::AllocError> for BootError {
    fn from(_: shmem::AllocError) -> Self {
        BootError::OutOfSpace
    }
}

/// Boot-phase events, counted for post-mortem visibility.
#[derive(Copy, Clone, Debug)]
enum BootEvent {
    Initialized,
    LaunchRequested,
    ReadySignaled,
    WaitTimedOut,
}

struct BootEventCounts {
    initialized: Counter,
    launch_requested: Counter,
    ready_signaled: Counter,
    wait_timed_out: Counter,
}

impl Count for BootEvent {
    type Counters = BootEventCounts;

    const NEW_COUNTERS: BootEventCounts = BootEventCounts {
        initialized: Counter::new(),
        launch_requested: Counter::new(),
        ready_signaled: Counter::new(),
        wait_timed_out: Counter::new(),
    };

    fn count(&self, counters: &BootEventCounts) {
        match self {
            BootEvent::Initialized => counters.initialized.incr(),
            BootEvent::LaunchRequested => counters.launch_requested.incr(),
            BootEvent::ReadySignaled => counters.ready_signaled.incr(),
            BootEvent::WaitTimedOut => counters.wait_timed_out.incr(),
        }
    }
}

counters::counters!(BOOT_EVENTS, BootEvent);

/// Per-core view of the boot handshake.
///
/// The primary obtains one from [`BootCoordinator::init`]; the secondary
/// from [`BootCoordinator::join`]. After that the operations are symmetric
/// where they can be (`signal_ready`, `wait_ready`, `state`) and
/// role-checked where they cannot (`init`, `launch`).
pub struct BootCoordinator<P: Platform> {
    platform: P,
    block: NonNull<BootBlock>,
}

// Safety: `block` points into the shared region, which is valid at the same
// address from any core; all mutable state in it is atomic or gated by the
// publish sequence.
unsafe impl<P: Platform + Send> Send for BootCoordinator<P> {}

impl<P: Platform> BootCoordinator<P> {
    /// Starts the boot sequence on the primary core.
    ///
    /// Allocates the boot block as the pool's first allocation (so its
    /// address equals the region base both cores agree on), clears the
    /// readiness mask, and sets the primary's own bit.
    ///
    /// Fails with [`BootError::WrongCore`] anywhere but the primary core.
    pub fn init(
        platform: P,
        pool: &mut SharedPool,
    ) -> Result<Self, BootError> {
        if !platform.current_core().is_primary() {
            return Err(BootError::WrongCore);
        }
        // The secondary finds the block at the region base; allocating it
        // anywhere else breaks `join`.
        debug_assert_eq!(pool.region().allocated, 0);

        let mem = pool.alloc(size_of::<BootBlock>())?;
        let block = mem.as_ptr().cast::<BootBlock>();
        // Safety: fresh 8-aligned pool memory, sized by the alloc above.
        unsafe {
            block.write(BootBlock {
                ready: AtomicU32::new(0),
                launched: AtomicU32::new(0),
                handoff_seq: AtomicU32::new(0),
                handoff: [0; HANDOFF_AREA],
            });
        }
        let this = Self {
            platform,
            block: unsafe { NonNull::new_unchecked(block) },
        };
        this.block()
            .ready
            .fetch_or(CoreId::PRIMARY.bit(), Ordering::Release);
        BootEvent::Initialized.count(&BOOT_EVENTS);
        Ok(this)
    }

    /// Attaches to a boot block the primary already initialized at `base`
    /// (the shared region base). This is the secondary core's entry point.
    ///
    /// # Safety
    ///
    /// `base` must be the base address of the shared region, on which the
    /// primary core has already completed [`BootCoordinator::init`].
    pub unsafe fn join(platform: P, base: *mut u8) -> Self {
        Self {
            platform,
            block: unsafe { NonNull::new_unchecked(base.cast()) },
        }
    }

    fn block(&self) -> &BootBlock {
        // Safety: points into the shared region for the program's life.
        unsafe { self.block.as_ref() }
    }

    /// Requests that the platform start `core` at `entry`/`stack`.
    ///
    /// Success means the request was issued, not that the core is up — poll
    /// [`wait_ready`](Self::wait_ready) for that. Fails with
    /// [`BootError::InvalidCore`] for the primary or an out-of-range id.
    pub fn launch(
        &mut self,
        core: CoreId,
        entry: u32,
        stack: u32,
    ) -> Result<(), BootError> {
        if !core.is_valid() || core.is_primary() {
            return Err(BootError::InvalidCore);
        }
        self.platform.launch_core(core, entry, stack)?;
        self.block().launched.fetch_or(core.bit(), Ordering::Relaxed);
        BootEvent::LaunchRequested.count(&BOOT_EVENTS);
        Ok(())
    }

    /// Sets the invoking core's own readiness bit.
    ///
    /// The release ordering makes everything this core wrote beforehand
    /// visible to a core that observes the bit.
    pub fn signal_ready(&self) {
        let me = self.platform.current_core();
        self.block().ready.fetch_or(me.bit(), Ordering::Release);
        BootEvent::ReadySignaled.count(&BOOT_EVENTS);
    }

    /// Checks `core`'s readiness bit without waiting.
    pub fn is_ready(&self, core: CoreId) -> bool {
        core.is_valid()
            && self.block().ready.load(Ordering::Acquire) & core.bit() != 0
    }

    /// Polls until `core`'s readiness bit is set or `timeout` expires.
    ///
    /// Returns immediately if the bit is already set.
    pub fn wait_ready(
        &self,
        core: CoreId,
        timeout: Timeout,
    ) -> Result<(), BootError> {
        if !core.is_valid() {
            return Err(BootError::InvalidCore);
        }
        let bit = core.bit();
        if self.block().ready.load(Ordering::Acquire) & bit != 0 {
            return Ok(());
        }
        let deadline = timeout.deadline_from(self.platform.now_ms());
        loop {
            if self.block().ready.load(Ordering::Acquire) & bit != 0 {
                return Ok(());
            }
            if let Some(d) = deadline {
                if self.platform.now_ms() >= d {
                    BootEvent::WaitTimedOut.count(&BOOT_EVENTS);
                    return Err(BootError::Timeout);
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Derives the boot state from the shared masks.
    pub fn state(&self) -> BootState {
        let ready = self.block().ready.load(Ordering::Acquire);
        let launched = self.block().launched.load(Ordering::Relaxed);
        let all = (1u32 << CORE_COUNT) - 1;
        if ready & all == all {
            BootState::BothReady
        } else if ready & CoreId::PRIMARY.bit() == 0 {
            BootState::Uninitialized
        } else if launched != 0 {
            BootState::SecondaryLaunching
        } else {
            BootState::PrimaryReady
        }
    }

    /// Publishes a hand-off record for the other core to
    /// [`load`](Self::load).
    ///
    /// Later publishes replace earlier ones; the record must fit the
    /// hand-off area ([`HandoffError::TooBig`] otherwise).
    pub fn publish<T: HandoffData>(
        &mut self,
        value: &T,
    ) -> Result<(), HandoffError> {
        // Safety: the area is written only here, through &mut self, and
        // readers on the other core gate on the sequence number released
        // below.
        let area = unsafe {
            core::slice::from_raw_parts_mut(
                core::ptr::addr_of_mut!((*self.block.as_ptr()).handoff)
                    .cast::<u8>(),
                HANDOFF_AREA,
            )
        };
        handoff::publish_into(area, value)?;
        self.block().handoff_seq.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Loads the published hand-off record, validating its header.
    ///
    /// Fails with [`HandoffError::Missing`] if nothing has been published.
    pub fn load<T>(&self) -> Result<T, HandoffError>
    where
        T: HandoffData,
        for<'d> T: Deserialize<'d>,
    {
        // Acquire pairs with the publisher's release: a nonzero sequence
        // means the bytes below are the published ones.
        if self.block().handoff_seq.load(Ordering::Acquire) == 0 {
            return Err(HandoffError::Missing);
        }
        let area = unsafe {
            core::slice::from_raw_parts(
                core::ptr::addr_of!((*self.block.as_ptr()).handoff)
                    .cast::<u8>(),
                HANDOFF_AREA,
            )
        };
        handoff::load_from(area)
    }

    /// The injected platform, for callers that need the clock or core id.
    pub fn platform(&self) -> &P {
        &self.platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::Monotonic;
    use hubpack::SerializedSize;
    use serde::Serialize;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    fn test_pool(bytes: usize) -> SharedPool {
        let words = bytes.div_ceil(8);
        let b: &'static mut [u64] =
            Box::leak(vec![0u64; words].into_boxed_slice());
        unsafe { SharedPool::init(b.as_mut_ptr().cast(), words * 8) }.unwrap()
    }

    struct FakePlatform {
        core: CoreId,
        clock: AtomicU64,
        launches: Mutex<Vec<(CoreId, u32, u32)>>,
        fail_launch: bool,
    }

    impl FakePlatform {
        fn on(core: CoreId) -> Self {
            Self {
                core,
                clock: AtomicU64::new(0),
                launches: Mutex::new(Vec::new()),
                fail_launch: false,
            }
        }
    }

    impl Monotonic for FakePlatform {
        fn now_ms(&self) -> u64 {
            // Advance a millisecond per reading so bounded waits terminate.
            self.clock.fetch_add(1, Ordering::Relaxed)
        }
    }

    impl Platform for FakePlatform {
        fn current_core(&self) -> CoreId {
            self.core
        }

        fn launch_core(
            &self,
            core: CoreId,
            entry: u32,
            stack: u32,
        ) -> Result<(), LaunchError> {
            if self.fail_launch {
                return Err(LaunchError::Failed);
            }
            self.launches.lock().unwrap().push((core, entry, stack));
            Ok(())
        }
    }

    #[derive(Serialize, Deserialize, SerializedSize, Debug, PartialEq)]
    struct HandleTable {
        mailbox_rx: u64,
        semaphore: u64,
    }

    impl HandoffData for HandleTable {
        const VERSION: u32 = 1;
        const MAGIC: [u8; 8] = *b"AMPTABLE";
    }

    #[test]
    fn init_rejects_secondary_core() {
        let mut pool = test_pool(512);
        let err = BootCoordinator::init(
            FakePlatform::on(CoreId::SECONDARY),
            &mut pool,
        )
        .map(|_| ())
        .unwrap_err();
        assert_eq!(err, BootError::WrongCore);
    }

    #[test]
    fn init_out_of_space() {
        let mut pool = test_pool(64);
        let err = BootCoordinator::init(
            FakePlatform::on(CoreId::PRIMARY),
            &mut pool,
        )
        .map(|_| ())
        .unwrap_err();
        assert_eq!(err, BootError::OutOfSpace);
    }

    #[test]
    fn init_marks_primary_ready() {
        let mut pool = test_pool(512);
        let boot =
            BootCoordinator::init(FakePlatform::on(CoreId::PRIMARY), &mut pool)
                .unwrap();
        assert!(boot.is_ready(CoreId::PRIMARY));
        assert!(!boot.is_ready(CoreId::SECONDARY));
        assert_eq!(boot.state(), BootState::PrimaryReady);
        // wait_ready on an already-set bit returns immediately.
        boot.wait_ready(CoreId::PRIMARY, Timeout::from_millis(0))
            .unwrap();
    }

    #[test]
    fn launch_validation_and_delegation() {
        let mut pool = test_pool(512);
        let mut boot =
            BootCoordinator::init(FakePlatform::on(CoreId::PRIMARY), &mut pool)
                .unwrap();

        assert_eq!(
            boot.launch(CoreId::PRIMARY, 0x1000, 0x2000),
            Err(BootError::InvalidCore)
        );
        assert_eq!(
            boot.launch(CoreId(7), 0x1000, 0x2000),
            Err(BootError::InvalidCore)
        );

        boot.launch(CoreId::SECONDARY, 0x1000, 0x2000).unwrap();
        assert_eq!(
            boot.platform().launches.lock().unwrap().as_slice(),
            &[(CoreId::SECONDARY, 0x1000, 0x2000)]
        );
        // Launch only requests; the state reflects that nothing signaled.
        assert_eq!(boot.state(), BootState::SecondaryLaunching);
    }

    #[test]
    fn launch_failure_propagates() {
        let mut pool = test_pool(512);
        let mut platform = FakePlatform::on(CoreId::PRIMARY);
        platform.fail_launch = true;
        let mut boot = BootCoordinator::init(platform, &mut pool).unwrap();
        assert_eq!(
            boot.launch(CoreId::SECONDARY, 0, 0),
            Err(BootError::Launch(LaunchError::Failed))
        );
        // A failed request is not a launch.
        assert_eq!(boot.state(), BootState::PrimaryReady);
    }

    #[test]
    fn wait_ready_times_out() {
        let mut pool = test_pool(512);
        let boot =
            BootCoordinator::init(FakePlatform::on(CoreId::PRIMARY), &mut pool)
                .unwrap();
        assert_eq!(
            boot.wait_ready(CoreId::SECONDARY, Timeout::from_millis(10)),
            Err(BootError::Timeout)
        );
        assert_eq!(
            boot.wait_ready(CoreId(3), Timeout::from_millis(10)),
            Err(BootError::InvalidCore)
        );
    }

    #[test]
    fn join_and_signal_completes_handshake() {
        let mut pool = test_pool(512);
        let base = pool.base().as_ptr();
        let boot =
            BootCoordinator::init(FakePlatform::on(CoreId::PRIMARY), &mut pool)
                .unwrap();

        let secondary = unsafe {
            BootCoordinator::join(FakePlatform::on(CoreId::SECONDARY), base)
        };
        assert_eq!(secondary.state(), BootState::PrimaryReady);
        secondary.signal_ready();

        boot.wait_ready(CoreId::SECONDARY, Timeout::from_millis(10))
            .unwrap();
        assert_eq!(boot.state(), BootState::BothReady);
        assert_eq!(secondary.state(), BootState::BothReady);
    }

    #[test]
    fn handoff_round_trip() {
        let mut pool = test_pool(512);
        let base = pool.base().as_ptr();
        let mut boot =
            BootCoordinator::init(FakePlatform::on(CoreId::PRIMARY), &mut pool)
                .unwrap();

        let table = HandleTable {
            mailbox_rx: 0xdead_beef,
            semaphore: 0x1234_5678,
        };
        boot.publish(&table).unwrap();

        let secondary = unsafe {
            BootCoordinator::join(FakePlatform::on(CoreId::SECONDARY), base)
        };
        assert_eq!(secondary.load::<HandleTable>().unwrap(), table);
    }

    #[test]
    fn load_before_publish_is_missing() {
        let mut pool = test_pool(512);
        let boot =
            BootCoordinator::init(FakePlatform::on(CoreId::PRIMARY), &mut pool)
                .unwrap();
        assert_eq!(
            boot.load::<HandleTable>().err(),
            Some(HandoffError::Missing)
        );
    }

    #[test]
    fn handoff_rejects_wrong_magic_and_version() {
        #[derive(Serialize, Deserialize, SerializedSize, Debug, PartialEq)]
        struct OtherTable {
            x: u32,
        }
        impl HandoffData for OtherTable {
            const VERSION: u32 = 1;
            const MAGIC: [u8; 8] = *b"OTHERTBL";
        }

        #[derive(Serialize, Deserialize, SerializedSize, Debug, PartialEq)]
        struct TableV2 {
            mailbox_rx: u64,
            semaphore: u64,
        }
        impl HandoffData for TableV2 {
            const VERSION: u32 = 2;
            const MAGIC: [u8; 8] = *b"AMPTABLE";
        }

        let mut pool = test_pool(512);
        let mut boot =
            BootCoordinator::init(FakePlatform::on(CoreId::PRIMARY), &mut pool)
                .unwrap();
        boot.publish(&HandleTable {
            mailbox_rx: 1,
            semaphore: 2,
        })
        .unwrap();

        assert_eq!(
            boot.load::<OtherTable>().err(),
            Some(HandoffError::BadMagic)
        );
        assert_eq!(
            boot.load::<TableV2>().err(),
            Some(HandoffError::UnexpectedVersion(1))
        );
    }

    #[test]
    fn handoff_rejects_oversized_records() {
        #[derive(Serialize, Deserialize, SerializedSize)]
        struct Big {
            // 320 bytes serialized, comfortably past the 244-byte area.
            data: [[u8; 32]; 10],
        }
        impl HandoffData for Big {
            const VERSION: u32 = 1;
            const MAGIC: [u8; 8] = *b"TOOBIG!!";
        }

        let mut pool = test_pool(512);
        let mut boot =
            BootCoordinator::init(FakePlatform::on(CoreId::PRIMARY), &mut pool)
                .unwrap();
        assert_eq!(
            boot.publish(&Big {
                data: [[0; 32]; 10]
            })
            .err(),
            Some(HandoffError::TooBig)
        );
    }

    /// End-to-end shape of a real boot: the primary claims the pool, builds
    /// a mailbox, publishes the receiver's address, and "launches" the
    /// secondary (a thread here); the secondary joins, loads the table,
    /// reconstructs its role, signals ready, and drains the traffic.
    #[test]
    fn two_core_boot_and_exchange() {
        #[derive(Serialize, Deserialize, SerializedSize, Debug, PartialEq)]
        struct RxTable {
            mailbox_rx: u64,
        }
        impl HandoffData for RxTable {
            const VERSION: u32 = 1;
            const MAGIC: [u8; 8] = *b"RXTABLE0";
        }

        let mut pool = test_pool(4096);
        let base = pool.base().as_ptr() as usize;

        let mut boot =
            BootCoordinator::init(FakePlatform::on(CoreId::PRIMARY), &mut pool)
                .unwrap();
        let (mut tx, rx) = mailbox::create(&mut pool, 4, 8).unwrap();
        boot.publish(&RxTable {
            mailbox_rx: rx.into_raw().as_ptr() as u64,
        })
        .unwrap();

        let secondary = std::thread::spawn(move || {
            let boot = unsafe {
                BootCoordinator::join(
                    FakePlatform::on(CoreId::SECONDARY),
                    base as *mut u8,
                )
            };
            let table = boot.load::<RxTable>().unwrap();
            let mut rx = unsafe {
                mailbox::Receiver::from_raw(
                    NonNull::new(table.mailbox_rx as *mut u8).unwrap(),
                )
            };
            boot.signal_ready();

            let mut out = [0u8; 4];
            let mut received = Vec::new();
            for _ in 0..100 {
                while rx.try_recv(&mut out).is_err() {
                    std::hint::spin_loop();
                }
                received.push(u32::from_le_bytes(out));
            }
            received
        });

        boot.wait_ready(CoreId::SECONDARY, Timeout::FOREVER).unwrap();
        assert_eq!(boot.state(), BootState::BothReady);

        for i in 0u32..100 {
            while tx.try_send(&i.to_le_bytes()).is_err() {
                std::hint::spin_loop();
            }
        }

        let received = secondary.join().unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }
}
