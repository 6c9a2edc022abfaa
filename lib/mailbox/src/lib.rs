// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded mailbox for discrete fixed-size messages between cores.
//!
//! One producer, one consumer, per instance. Rather than asking callers to
//! uphold that by convention, the roles are separate types:
//! [`create`] returns a `(Sender, Receiver)` pair, neither of which is
//! `Clone`, and every mutating operation takes `&mut self` — a second writer
//! on the same instance does not compile. Bidirectional traffic takes two
//! mailboxes, one per direction.
//!
//! The queue discipline is the classic power-of-two ring: `write_idx` and
//! `read_idx` are free-running 32-bit counters that never reset, occupancy is
//! `write_idx - read_idx` in wrapping arithmetic, and slot selection masks
//! with `slot_count - 1`. Payload bytes are copied before the owning index is
//! published with a release store; the other side acquires that index before
//! trusting the bytes. Those two orderings are the entire memory model — no
//! cache coherence is assumed underneath.

#![cfg_attr(not(test), no_std)]

use abi::{Monotonic, Timeout};
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use shmem::SharedPool;

/// Header at the front of the mailbox's pool allocation; slot storage
/// follows it directly.
#[repr(C)]
struct Header {
    write_idx: AtomicU32,
    read_idx: AtomicU32,
    slot_size: u32,
    slot_count: u32,
    mask: u32,
}

const HEADER_SIZE: usize = size_of::<Header>();

/// Error returned by [`create`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateError {
    /// `slot_size` or `slot_count` was zero.
    ZeroSize,
    /// The slot arithmetic overflowed the index width; no realistic shared
    /// region holds such a mailbox anyway.
    TooBig,
    /// The shared pool could not satisfy the allocation.
    OutOfSpace,
}

/// Error returned by [`Sender::try_send`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendError {
    /// Occupancy equals capacity; nothing was copied.
    Full,
    /// The message is not exactly `slot_size` bytes.
    BadLength,
}

/// Error returned by [`Receiver::try_recv`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecvError {
    /// Occupancy is zero; nothing was copied.
    Empty,
    /// The output buffer is not exactly `slot_size` bytes.
    BadLength,
}

/// Error returned by the blocking [`Sender::send`] / [`Receiver::recv`]
/// wrappers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitError {
    /// The caller's buffer is not exactly `slot_size` bytes; waiting would
    /// never fix that, so it is reported before any polling.
    BadLength,
    /// The timeout budget ran out.
    TimedOut,
}

/// Indices may not exceed half the counter range, or the wrapping occupancy
/// arithmetic stops being unambiguous.
const MAX_SLOTS: usize = 1 << 16;

/// Creates a mailbox in the pool and returns its two role handles.
///
/// `slot_count` is rounded up to the next power of two (query the result
/// with [`Sender::capacity`]). `slot_size` is taken as given.
pub fn create(
    pool: &mut SharedPool,
    slot_size: usize,
    slot_count: usize,
) -> Result<(Sender, Receiver), CreateError> {
    if slot_size == 0 || slot_count == 0 {
        return Err(CreateError::ZeroSize);
    }
    if slot_count > MAX_SLOTS {
        return Err(CreateError::TooBig);
    }
    let slots = slot_count.next_power_of_two();
    let bytes = slot_size
        .checked_mul(slots)
        .and_then(|b| b.checked_add(HEADER_SIZE))
        .ok_or(CreateError::TooBig)?;
    let mem = pool.alloc(bytes).map_err(|e| match e {
        shmem::AllocError::OutOfSpace => CreateError::OutOfSpace,
        shmem::AllocError::ZeroSize => CreateError::ZeroSize,
    })?;

    let hdr = mem.as_ptr().cast::<Header>();
    // Safety: the allocation is 8-aligned, big enough for the header plus
    // slot storage, and unaliased; see `SharedPool::alloc`.
    unsafe {
        hdr.write(Header {
            write_idx: AtomicU32::new(0),
            read_idx: AtomicU32::new(0),
            slot_size: slot_size as u32,
            slot_count: slots as u32,
            mask: (slots - 1) as u32,
        });
    }
    let shared = Shared {
        hdr: unsafe { NonNull::new_unchecked(hdr) },
    };
    Ok((Sender { shared }, Receiver { shared }))
}

/// The part of the handle both roles share: a pointer to the header, with
/// the slot storage at a fixed offset behind it.
#[derive(Copy, Clone)]
struct Shared {
    hdr: NonNull<Header>,
}

impl Shared {
    fn hdr(&self) -> &Header {
        // Safety: the header lives in the pool for the rest of the program,
        // and all mutable state within it is atomic.
        unsafe { self.hdr.as_ref() }
    }

    /// Raw pointer to slot `n`'s storage. Offsets are derived from the
    /// original allocation pointer, not from a header reference, so the
    /// provenance covers the whole allocation.
    fn slot_ptr(&self, n: usize) -> *mut u8 {
        let base = self.hdr.as_ptr().cast::<u8>();
        // Safety: n < slot_count, checked by the callers' occupancy math.
        unsafe { base.add(HEADER_SIZE + n * self.hdr().slot_size as usize) }
    }

    fn occupancy(&self) -> u32 {
        let h = self.hdr();
        h.write_idx
            .load(Ordering::Relaxed)
            .wrapping_sub(h.read_idx.load(Ordering::Relaxed))
    }
}

/// The producer role. Exactly one exists per mailbox.
pub struct Sender {
    shared: Shared,
}

/// The consumer role. Exactly one exists per mailbox.
pub struct Receiver {
    shared: Shared,
}

// Safety: the handles only reach shared state through atomics and raw byte
// copies ordered by them; each role mutates only its own index. Moving a
// handle to the other core is exactly the intended use. Neither handle is
// Sync: a role belongs to one context at a time.
unsafe impl Send for Sender {}
unsafe impl Send for Receiver {}

macro_rules! observers {
    ($handle:ident) => {
        impl $handle {
            /// Number of message slots (the rounded-up `slot_count`).
            pub fn capacity(&self) -> usize {
                self.shared.hdr().slot_count as usize
            }

            /// Size of every message, in bytes.
            pub fn slot_size(&self) -> usize {
                self.shared.hdr().slot_size as usize
            }

            /// Messages currently queued. Diagnostic: the other role may
            /// move this before the caller acts on it.
            pub fn len(&self) -> usize {
                self.shared.occupancy() as usize
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn is_full(&self) -> bool {
                self.len() == self.capacity()
            }

            /// Address of the shared state, for out-of-band distribution of
            /// this role to the other core.
            pub fn into_raw(self) -> NonNull<u8> {
                self.shared.hdr.cast()
            }

            /// Reconstructs this role from an address produced by
            /// [`Self::into_raw`].
            ///
            /// # Safety
            ///
            /// `ptr` must come from `into_raw` on the same role of a mailbox
            /// in the same shared region, and the original handle must no
            /// longer be in use — this resurrects it, and two live copies of
            /// one role break the single-writer contract.
            pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
                Self {
                    shared: Shared { hdr: ptr.cast() },
                }
            }
        }
    };
}

observers!(Sender);
observers!(Receiver);

impl Sender {
    /// Queues one message without blocking.
    ///
    /// `msg` must be exactly `slot_size` bytes. Fails with
    /// [`SendError::Full`] when occupancy equals capacity.
    pub fn try_send(&mut self, msg: &[u8]) -> Result<(), SendError> {
        let h = self.shared.hdr();
        if msg.len() != h.slot_size as usize {
            return Err(SendError::BadLength);
        }

        // Own index can be read relaxed (only this role writes it); the
        // opposing index needs acquire so the slot we are about to overwrite
        // has really been drained on the other core.
        let w = h.write_idx.load(Ordering::Relaxed);
        let r = h.read_idx.load(Ordering::Acquire);
        if w.wrapping_sub(r) == h.slot_count {
            return Err(SendError::Full);
        }

        let slot = (w & h.mask) as usize;
        // Safety: the occupancy check guarantees the slot is not visible to
        // the receiver until the release store below.
        unsafe {
            core::ptr::copy_nonoverlapping(
                msg.as_ptr(),
                self.shared.slot_ptr(slot),
                msg.len(),
            );
        }
        h.write_idx.store(w.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Queues one message, polling until a slot frees up or `timeout`
    /// expires.
    pub fn send(
        &mut self,
        msg: &[u8],
        timeout: Timeout,
        clock: &impl Monotonic,
    ) -> Result<(), WaitError> {
        let deadline = timeout.deadline_from(clock.now_ms());
        loop {
            match self.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(SendError::BadLength) => {
                    return Err(WaitError::BadLength)
                }
                Err(SendError::Full) => {}
            }
            if let Some(d) = deadline {
                if clock.now_ms() >= d {
                    return Err(WaitError::TimedOut);
                }
            }
            core::hint::spin_loop();
        }
    }
}

impl Receiver {
    /// Dequeues one message without blocking.
    ///
    /// `out` must be exactly `slot_size` bytes. Fails with
    /// [`RecvError::Empty`] when occupancy is zero.
    pub fn try_recv(&mut self, out: &mut [u8]) -> Result<(), RecvError> {
        let h = self.shared.hdr();
        if out.len() != h.slot_size as usize {
            return Err(RecvError::BadLength);
        }

        let r = h.read_idx.load(Ordering::Relaxed);
        // Acquire pairs with the sender's release: once we observe the
        // advanced write index, the payload bytes are visible too.
        let w = h.write_idx.load(Ordering::Acquire);
        if w == r {
            return Err(RecvError::Empty);
        }

        let slot = (r & h.mask) as usize;
        // Safety: occupancy > 0, so the sender has finished writing this
        // slot and will not touch it again until we release the index.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.shared.slot_ptr(slot),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        h.read_idx.store(r.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeues one message, polling until one arrives or `timeout` expires.
    pub fn recv(
        &mut self,
        out: &mut [u8],
        timeout: Timeout,
        clock: &impl Monotonic,
    ) -> Result<(), WaitError> {
        let deadline = timeout.deadline_from(clock.now_ms());
        loop {
            match self.try_recv(out) {
                Ok(()) => return Ok(()),
                Err(RecvError::BadLength) => {
                    return Err(WaitError::BadLength)
                }
                Err(RecvError::Empty) => {}
            }
            if let Some(d) = deadline {
                if clock.now_ms() >= d {
                    return Err(WaitError::TimedOut);
                }
            }
            core::hint::spin_loop();
        }
    }
}
