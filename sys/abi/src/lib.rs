// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared ABI definitions for the AMP runtime.
//!
//! Everything here is consumed by both cores: core identity, the platform
//! capability interface that the runtime is handed at initialization, and the
//! timeout model used by every bounded-wait operation.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};

/// Number of hardware execution contexts this runtime manages. The whole
/// design assumes exactly two; the type exists so the `1 << core` arithmetic
/// reads as what it means.
pub const CORE_COUNT: usize = 2;

/// Names one of the cores.
///
/// Core 0 is always the primary: it runs first, owns the shared pool during
/// initialization, and is the only core allowed to start the boot sequence.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CoreId(pub u8);

impl CoreId {
    /// The core that boots first and owns initialization.
    pub const PRIMARY: Self = Self(0);
    /// The core that must be launched by the primary.
    pub const SECONDARY: Self = Self(1);

    /// Checks whether this is the designated primary core.
    pub const fn is_primary(self) -> bool {
        self.0 == 0
    }

    /// Checks whether this id names a core that actually exists.
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < CORE_COUNT
    }

    /// Position of this core's flag in the readiness bitmask.
    pub const fn bit(self) -> u32 {
        1 << self.0
    }
}

/// A monotonic time source, in milliseconds from an arbitrary epoch.
///
/// Only differences between readings are meaningful. The runtime never sleeps
/// on this clock; it is read inside busy-poll loops to decide when a bounded
/// wait has run out of budget.
pub trait Monotonic {
    fn now_ms(&self) -> u64;
}

/// Error from the platform's core-launch sequence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LaunchError {
    /// The platform has no mechanism to start the requested core.
    Unsupported,
    /// The launch handshake with the target core failed.
    Failed,
}

/// The capabilities the runtime needs from platform-specific code.
///
/// An implementation of this trait is injected at initialization instead of
/// being resolved through link-time symbol overriding. The runtime never
/// touches hardware directly; everything target-specific funnels through
/// here.
pub trait Platform: Monotonic {
    /// Reports which core is executing the caller.
    fn current_core(&self) -> CoreId;

    /// Requests that `core` begin executing at `entry` with its stack pointer
    /// set to `stack`.
    ///
    /// This only *requests* the start; it makes no claim that the core has
    /// actually come up. Callers learn that through the readiness handshake.
    fn launch_core(
        &self,
        core: CoreId,
        entry: u32,
        stack: u32,
    ) -> Result<(), LaunchError>;
}

/// A caller-supplied bound on how long a blocking operation may poll.
///
/// There is no magic "zero means forever" value: [`Timeout::FOREVER`] waits
/// without bound, and `Timeout::from_millis(n)` expires once the monotonic
/// clock has advanced `n` milliseconds past the start of the wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timeout(Option<u64>);

impl Timeout {
    /// Wait without bound.
    pub const FOREVER: Self = Self(None);

    /// Wait at most `ms` milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        Self(Some(ms))
    }

    /// Converts this budget into an absolute deadline for a wait starting at
    /// `now`, or `None` for an unbounded wait.
    pub fn deadline_from(self, now: u64) -> Option<u64> {
        self.0.map(|ms| now.saturating_add(ms))
    }
}

/// Error returned by every deadline-bounded wait in the runtime once its
/// budget is exhausted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimedOut;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_identity() {
        assert!(CoreId::PRIMARY.is_primary());
        assert!(!CoreId::SECONDARY.is_primary());
        assert!(CoreId::PRIMARY.is_valid());
        assert!(CoreId::SECONDARY.is_valid());
        assert!(!CoreId(2).is_valid());
        assert_eq!(CoreId::PRIMARY.bit(), 1);
        assert_eq!(CoreId::SECONDARY.bit(), 2);
    }

    #[test]
    fn timeout_deadlines() {
        assert_eq!(Timeout::FOREVER.deadline_from(1234), None);
        assert_eq!(Timeout::from_millis(10).deadline_from(90), Some(100));
        // A saturating deadline must not wrap around and expire instantly.
        assert_eq!(
            Timeout::from_millis(u64::MAX).deadline_from(5),
            Some(u64::MAX)
        );
    }
}
