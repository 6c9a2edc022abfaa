// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bump allocator for the shared memory region between cores.
//!
//! Both cores see one contiguous extent of uncached RAM, agreed on out of
//! band. The primary core claims it exactly once with [`SharedPool::init`],
//! which zero-fills the whole region, and then carves it up with
//! [`SharedPool::alloc`] while the secondary core is still held in reset.
//! Nothing is ever freed: the offset only moves forward, which is what makes
//! it safe for the IPC primitives to hand out `'static` views of their
//! headers.
//!
//! Because the pool is an owned value rather than a global, allocation is
//! single-context by construction: every `create` in the runtime takes
//! `&mut SharedPool`, and the pool stops being touched before the secondary
//! core is given any work.

#![cfg_attr(not(test), no_std)]

use core::ptr::NonNull;

/// Every allocation is rounded up to this boundary, so primitive headers can
/// put atomics and `u32` fields at their natural alignment without thinking
/// about it.
pub const ALIGN: usize = 8;

/// Error returned when [`SharedPool::init`] is handed an unusable region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BadRegion;

/// Error returned by [`SharedPool::alloc`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocError {
    /// Zero-byte allocations are rejected rather than handing back a
    /// dangling-but-valid pointer nobody can use.
    ZeroSize,
    /// The request does not fit in the unallocated remainder of the region.
    OutOfSpace,
}

/// Diagnostic snapshot of the pool, for the "does this pointer belong to us"
/// style of debugging.
#[derive(Copy, Clone, Debug)]
pub struct RegionInfo {
    pub base: *const u8,
    pub size: usize,
    pub allocated: usize,
}

/// The shared region, owned by whichever context performed `init`.
pub struct SharedPool {
    base: NonNull<u8>,
    size: usize,
    allocated: usize,
}

impl SharedPool {
    /// Claims the region `[base, base + size)` and zero-fills it.
    ///
    /// The zero fill is load-bearing: primitives created later rely on their
    /// freshly allocated headers reading as zero (empty queue indices, a
    /// cleared readiness mask) without separate clearing code.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `size` bytes for the rest
    /// of the program's life, must not alias memory used for anything else,
    /// and the region must be visible to both cores at the same address.
    /// `init` must be called at most once per region, on the primary core,
    /// before the secondary core is started.
    pub unsafe fn init(
        base: *mut u8,
        size: usize,
    ) -> Result<Self, BadRegion> {
        if base.is_null() || size == 0 {
            return Err(BadRegion);
        }
        // Misaligned bases would silently break the 8-byte alignment promise
        // made to every caller of `alloc`.
        if (base as usize) % ALIGN != 0 {
            return Err(BadRegion);
        }
        unsafe {
            core::ptr::write_bytes(base, 0, size);
            Ok(Self {
                base: NonNull::new_unchecked(base),
                size,
                allocated: 0,
            })
        }
    }

    /// Carves `n` bytes (rounded up to [`ALIGN`]) out of the unallocated
    /// remainder.
    ///
    /// The returned memory is zeroed, 8-aligned, and never reclaimed.
    pub fn alloc(&mut self, n: usize) -> Result<NonNull<u8>, AllocError> {
        if n == 0 {
            return Err(AllocError::ZeroSize);
        }
        let n = n
            .checked_add(ALIGN - 1)
            .ok_or(AllocError::OutOfSpace)?
            & !(ALIGN - 1);
        if n > self.size - self.allocated {
            return Err(AllocError::OutOfSpace);
        }
        // Safety: allocated + n <= size, so the offset stays inside the
        // region claimed by `init`.
        let ptr = unsafe { self.base.as_ptr().add(self.allocated) };
        self.allocated += n;
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Checks whether `ptr` lies within the allocated prefix of the region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.allocated
    }

    /// Returns a diagnostic snapshot of the pool.
    pub fn region(&self) -> RegionInfo {
        RegionInfo {
            base: self.base.as_ptr(),
            size: self.size,
            allocated: self.allocated,
        }
    }

    /// Bytes still available for allocation.
    pub fn remaining(&self) -> usize {
        self.size - self.allocated
    }

    /// Base address of the region, as handed to `init`. Both cores agree on
    /// this address out of band; the boot coordinator uses it to find the
    /// boot block from the secondary side.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }
}
