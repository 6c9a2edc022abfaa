// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphore in shared memory.
//!
//! This is the one primitive in the runtime built for genuine multi-core
//! contention: any number of contexts may call [`Semaphore::try_wait`] and
//! [`Semaphore::post`] on the same instance concurrently. Correctness comes
//! from compare-and-swap retry loops on the count, so the handle is freely
//! `Copy` — there are no writer/reader roles to keep apart, unlike the
//! mailbox and byte pipe.
//!
//! The CAS loop is lock-free: a loser of a race retries with the value it
//! observed. It is not bounded-wait under contention, which is an accepted
//! property of the design, not a bug.

#![cfg_attr(not(test), no_std)]

use abi::{Monotonic, TimedOut, Timeout};
use core::sync::atomic::{AtomicU32, Ordering};
use shmem::SharedPool;

/// Shared state, living in the pool. `max` is written once at create time,
/// before the handle can have crossed to another core, and never changes.
#[repr(C)]
struct SemHeader {
    count: AtomicU32,
    max: u32,
}

/// Error returned by [`Semaphore::create`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateError {
    /// `max == 0` or `initial > max`.
    InvalidCount,
    /// The shared pool could not satisfy the allocation.
    OutOfSpace,
}

/// Error returned by [`Semaphore::try_wait`] when the count is zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Unavailable;

/// Error returned by [`Semaphore::post`] when the count is already at max.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Overflow;

/// Handle to a semaphore in shared memory.
///
/// Copy it, send it across cores, wait and post from both sides. All methods
/// take `&self`; the atomics do the coordination.
#[derive(Copy, Clone)]
pub struct Semaphore {
    hdr: &'static SemHeader,
}

impl Semaphore {
    /// Allocates a semaphore from the pool with `count = initial`.
    ///
    /// Fails with [`CreateError::InvalidCount`] if `max == 0` or
    /// `initial > max`.
    pub fn create(
        pool: &mut SharedPool,
        initial: u32,
        max: u32,
    ) -> Result<Self, CreateError> {
        if max == 0 || initial > max {
            return Err(CreateError::InvalidCount);
        }
        let mem = pool
            .alloc(core::mem::size_of::<SemHeader>())
            .map_err(|_| CreateError::OutOfSpace)?;
        let ptr = mem.as_ptr().cast::<SemHeader>();
        // Safety: the pool hands out 8-aligned, unaliased memory that lives
        // for the rest of the program, so writing the header and keeping a
        // 'static shared reference to it is sound.
        unsafe {
            ptr.write(SemHeader {
                count: AtomicU32::new(initial),
                max,
            });
            Ok(Self { hdr: &*ptr })
        }
    }

    /// Takes one unit if any are available, without blocking.
    pub fn try_wait(&self) -> Result<(), Unavailable> {
        let mut cur = self.hdr.count.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return Err(Unavailable);
            }
            match self.hdr.count.compare_exchange(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                // Lost a race with the other core; retry from what it left.
                Err(seen) => cur = seen,
            }
        }
    }

    /// Takes one unit, polling until one is available or `timeout` expires.
    pub fn wait(
        &self,
        timeout: Timeout,
        clock: &impl Monotonic,
    ) -> Result<(), TimedOut> {
        let deadline = timeout.deadline_from(clock.now_ms());
        loop {
            if self.try_wait().is_ok() {
                return Ok(());
            }
            if let Some(d) = deadline {
                if clock.now_ms() >= d {
                    return Err(TimedOut);
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Returns one unit. Fails with [`Overflow`] if the count is already at
    /// its maximum.
    pub fn post(&self) -> Result<(), Overflow> {
        let mut cur = self.hdr.count.load(Ordering::Relaxed);
        loop {
            if cur >= self.hdr.max {
                return Err(Overflow);
            }
            match self.hdr.count.compare_exchange(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Snapshot of the count, for diagnostics only. By the time the caller
    /// looks at the value, the other core may already have changed it; do not
    /// build synchronization on this.
    pub fn count(&self) -> u32 {
        self.hdr.count.load(Ordering::Relaxed)
    }

    /// The configured maximum count.
    pub fn max_count(&self) -> u32 {
        self.hdr.max
    }

    /// Address of the shared state, for out-of-band handle distribution.
    pub fn as_ptr(&self) -> *const u8 {
        (self.hdr as *const SemHeader).cast()
    }

    /// Reconstructs a handle from an address published by the creating core.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Semaphore::as_ptr`] on a semaphore created in
    /// the same shared region, mapped at the same address on this core.
    pub unsafe fn from_raw(ptr: *const u8) -> Self {
        unsafe {
            Self {
                hdr: &*ptr.cast::<SemHeader>(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn test_pool() -> SharedPool {
        let b: &'static mut [u64] =
            Box::leak(vec![0u64; 64].into_boxed_slice());
        unsafe { SharedPool::init(b.as_mut_ptr().cast(), 512) }.unwrap()
    }

    /// Clock that advances one millisecond per reading, so bounded waits
    /// terminate without real time passing.
    struct TickingClock(AtomicU64);

    impl Monotonic for TickingClock {
        fn now_ms(&self) -> u64 {
            self.0.fetch_add(1, Ordering::Relaxed)
        }
    }

    #[test]
    fn create_validation() {
        let mut pool = test_pool();
        assert_eq!(
            Semaphore::create(&mut pool, 0, 0).err(),
            Some(CreateError::InvalidCount)
        );
        assert_eq!(
            Semaphore::create(&mut pool, 3, 2).err(),
            Some(CreateError::InvalidCount)
        );
        let sem = Semaphore::create(&mut pool, 2, 4).unwrap();
        assert_eq!(sem.count(), 2);
        assert_eq!(sem.max_count(), 4);
    }

    #[test]
    fn create_out_of_space() {
        let b: &'static mut [u64] = Box::leak(vec![0u64; 1].into_boxed_slice());
        let mut pool =
            unsafe { SharedPool::init(b.as_mut_ptr().cast(), 8) }.unwrap();
        pool.alloc(8).unwrap();
        assert_eq!(
            Semaphore::create(&mut pool, 0, 1).err(),
            Some(CreateError::OutOfSpace)
        );
    }

    #[test]
    fn wait_post_bounds() {
        let mut pool = test_pool();
        let sem = Semaphore::create(&mut pool, 1, 2).unwrap();

        sem.try_wait().unwrap();
        assert_eq!(sem.try_wait().err(), Some(Unavailable));

        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.post().err(), Some(Overflow));
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn wait_times_out() {
        let mut pool = test_pool();
        let sem = Semaphore::create(&mut pool, 0, 1).unwrap();
        let clock = TickingClock(AtomicU64::new(0));

        assert_eq!(
            sem.wait(Timeout::from_millis(5), &clock),
            Err(TimedOut)
        );
    }

    #[test]
    fn wait_succeeds_immediately_when_available() {
        let mut pool = test_pool();
        let sem = Semaphore::create(&mut pool, 1, 1).unwrap();
        let clock = TickingClock(AtomicU64::new(0));

        sem.wait(Timeout::from_millis(0), &clock).unwrap();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn raw_round_trip() {
        let mut pool = test_pool();
        let sem = Semaphore::create(&mut pool, 1, 1).unwrap();
        let other = unsafe { Semaphore::from_raw(sem.as_ptr()) };
        other.try_wait().unwrap();
        assert_eq!(sem.count(), 0);
    }

    /// Two contexts hammer the same semaphore. The count must never escape
    /// [0, max], and the number of successful waits can never exceed the
    /// initial count plus successful posts.
    #[test]
    fn two_context_contention() {
        const ROUNDS: usize = 10_000;

        let mut pool = test_pool();
        let sem = Semaphore::create(&mut pool, 4, 8).unwrap();

        let worker = std::thread::spawn(move || {
            let mut waits = 0u32;
            let mut posts = 0u32;
            for _ in 0..ROUNDS {
                if sem.try_wait().is_ok() {
                    waits += 1;
                }
                if sem.post().is_ok() {
                    posts += 1;
                }
                assert!(sem.count() <= sem.max_count());
            }
            (waits, posts)
        });

        let mut waits = 0u32;
        let mut posts = 0u32;
        for _ in 0..ROUNDS {
            if sem.post().is_ok() {
                posts += 1;
            }
            if sem.try_wait().is_ok() {
                waits += 1;
            }
            assert!(sem.count() <= sem.max_count());
        }

        let (w2, p2) = worker.join().unwrap();
        waits += w2;
        posts += p2;

        // Conservation: every successful wait consumed either an initial
        // unit or a successfully posted one.
        assert!(waits <= 4 + posts);
        assert_eq!(sem.count(), 4 + posts - waits);
        assert!(sem.count() <= 8);
    }
}
