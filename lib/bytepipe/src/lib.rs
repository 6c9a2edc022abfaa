// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-producer/single-consumer streaming byte ring between cores.
//!
//! Same index discipline as the mailbox — free-running 32-bit counters,
//! power-of-two capacity, occupancy by wrapping subtraction — but byte
//! granular and with a deliberately different error surface: there isn't
//! one. [`Writer::write`] and [`Reader::read`] clamp to the space or data
//! actually available and report how many bytes moved. A full pipe yields a
//! short (possibly zero) write; an empty pipe yields a short read. That is
//! the native contract of a streaming channel, not a failure.
//!
//! A transfer touches at most two contiguous spans of backing storage (the
//! run up to the end of the ring, then the wrapped remainder), so bulk moves
//! are slice copies rather than a byte-at-a-time loop.
//!
//! Unlike the mailbox there is no silent rounding: `create` demands a
//! power-of-two capacity up front.

#![cfg_attr(not(test), no_std)]

use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use shmem::SharedPool;

/// Header at the front of the pipe's pool allocation; the byte storage
/// follows it directly.
#[repr(C)]
struct Header {
    write_idx: AtomicU32,
    read_idx: AtomicU32,
    capacity: u32,
    mask: u32,
}

const HEADER_SIZE: usize = size_of::<Header>();

/// Capacity must leave the wrapping occupancy arithmetic unambiguous.
const MAX_CAPACITY: usize = 1 << 31;

/// Error returned by [`create`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateError {
    /// `capacity` was zero or not a power of two.
    NotPowerOfTwo,
    /// `capacity` exceeds what 32-bit indices can track.
    TooBig,
    /// The shared pool could not satisfy the allocation.
    OutOfSpace,
}

/// Creates a byte pipe in the pool and returns its two role handles.
pub fn create(
    pool: &mut SharedPool,
    capacity: usize,
) -> Result<(Writer, Reader), CreateError> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(CreateError::NotPowerOfTwo);
    }
    if capacity > MAX_CAPACITY {
        return Err(CreateError::TooBig);
    }
    let bytes = capacity
        .checked_add(HEADER_SIZE)
        .ok_or(CreateError::TooBig)?;
    let mem = pool
        .alloc(bytes)
        .map_err(|_| CreateError::OutOfSpace)?;

    let hdr = mem.as_ptr().cast::<Header>();
    // Safety: the allocation is 8-aligned and big enough for the header plus
    // `capacity` bytes of storage.
    unsafe {
        hdr.write(Header {
            write_idx: AtomicU32::new(0),
            read_idx: AtomicU32::new(0),
            capacity: capacity as u32,
            mask: (capacity - 1) as u32,
        });
    }
    let shared = Shared {
        hdr: unsafe { NonNull::new_unchecked(hdr) },
    };
    Ok((Writer { shared }, Reader { shared }))
}

#[derive(Copy, Clone)]
struct Shared {
    hdr: NonNull<Header>,
}

impl Shared {
    fn hdr(&self) -> &Header {
        // Safety: lives in the pool for the rest of the program; mutable
        // state is atomic.
        unsafe { self.hdr.as_ref() }
    }

    fn storage(&self) -> *mut u8 {
        // Safety: storage begins directly after the header inside the same
        // allocation.
        unsafe { self.hdr.as_ptr().cast::<u8>().add(HEADER_SIZE) }
    }

    fn available(&self) -> u32 {
        let h = self.hdr();
        h.write_idx
            .load(Ordering::Acquire)
            .wrapping_sub(h.read_idx.load(Ordering::Relaxed))
    }
}

/// The producer role. Exactly one exists per pipe.
pub struct Writer {
    shared: Shared,
}

/// The consumer role. Exactly one exists per pipe.
pub struct Reader {
    shared: Shared,
}

// Safety: same reasoning as the mailbox handles — shared state is reached
// only through atomics and the copies they order, each role owns one index,
// and shipping a role to the other core is the point.
unsafe impl Send for Writer {}
unsafe impl Send for Reader {}

macro_rules! observers {
    ($handle:ident) => {
        impl $handle {
            /// Total capacity in bytes.
            pub fn capacity(&self) -> usize {
                self.shared.hdr().capacity as usize
            }

            /// Bytes written but not yet read.
            pub fn available(&self) -> usize {
                self.shared.available() as usize
            }

            /// Bytes that can be written before the pipe is full.
            pub fn free_space(&self) -> usize {
                self.capacity() - self.available()
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
            /// `ptr` must come from `into_raw` on the same role of a pipe in
            /// the same shared region, and the original handle must be gone;
            /// two live copies of one role break the SPSC contract.
            pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
                Self {
                    shared: Shared { hdr: ptr.cast() },
                }
            }
        }
    };
}

observers!(Writer);
observers!(Reader);

/// Copies `n` bytes between `data` and ring storage starting at logical
/// index `idx`, splitting at the wrap point. `INTO_RING` selects direction:
/// true writes into the ring (`data` is only read), false reads out of it.
fn ring_copy<const INTO_RING: bool>(
    storage: *mut u8,
    capacity: usize,
    idx: u32,
    mask: u32,
    data: *mut u8,
    n: usize,
) {
    let start = (idx & mask) as usize;
    let first = n.min(capacity - start);
    let second = n - first;
    // Safety: callers clamp `n` so both spans stay inside the ring, and the
    // occupancy protocol guarantees the other role is not touching them.
    unsafe {
        if INTO_RING {
            core::ptr::copy_nonoverlapping(data, storage.add(start), first);
            core::ptr::copy_nonoverlapping(data.add(first), storage, second);
        } else {
            core::ptr::copy_nonoverlapping(storage.add(start), data, first);
            core::ptr::copy_nonoverlapping(storage, data.add(first), second);
        }
    }
}

impl Writer {
    /// Writes as much of `data` as fits and returns the number of bytes
    /// actually transferred. Never fails; zero is a legitimate result.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let h = self.shared.hdr();
        let w = h.write_idx.load(Ordering::Relaxed);
        // Acquire: bytes we are about to overwrite must really have been
        // consumed on the other core.
        let r = h.read_idx.load(Ordering::Acquire);
        let free = h.capacity - w.wrapping_sub(r);
        let n = data.len().min(free as usize);
        if n == 0 {
            return 0;
        }

        ring_copy::<true>(
            self.shared.storage(),
            h.capacity as usize,
            w,
            h.mask,
            data.as_ptr() as *mut u8,
            n,
        );
        // Publish the payload before advertising it.
        h.write_idx.store(w.wrapping_add(n as u32), Ordering::Release);
        n
    }
}

impl Reader {
    /// Reads up to `buf.len()` bytes and returns the number actually
    /// transferred. Never fails; zero means the pipe was empty.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let h = self.shared.hdr();
        let r = h.read_idx.load(Ordering::Relaxed);
        // Acquire pairs with the writer's release store.
        let w = h.write_idx.load(Ordering::Acquire);
        let n = buf.len().min(w.wrapping_sub(r) as usize);
        if n == 0 {
            return 0;
        }

        ring_copy::<false>(
            self.shared.storage(),
            h.capacity as usize,
            r,
            h.mask,
            buf.as_mut_ptr(),
            n,
        );
        h.read_idx.store(r.wrapping_add(n as u32), Ordering::Release);
        n
    }

    /// Discards everything currently unread. The reader owns the read
    /// index, which is why this lives here and not on the writer.
    pub fn clear(&mut self) {
        let h = self.shared.hdr();
        let w = h.write_idx.load(Ordering::Acquire);
        h.read_idx.store(w, Ordering::Release);
    }
}
