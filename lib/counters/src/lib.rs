// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event counters for diagnostics.
//!
//! On a no-OS target the observability story is a handful of static counters
//! that a debugger (or a post-mortem memory dump) can read out: one atomic
//! per interesting event, bumped from wherever the event happens. This crate
//! provides the [`Counter`] cell, the [`Count`] trait that maps an event enum
//! onto a struct of counters, and the [`counters!`] macro that declares the
//! static.
//!
//! Counting an event is a single relaxed `fetch_add`; it establishes no
//! ordering and costs nothing worth thinking about, so counting in hot paths
//! is fine.
//!
//! ```ignore
//! counters!(BOOT_EVENTS, BootEvent);
//!
//! BootEvent::ReadySignaled.count(&BOOT_EVENTS);
//! ```

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU32, Ordering};

/// A single event counter.
///
/// Wraps on overflow; four billion occurrences of the same event is a
/// diagnosis all by itself.
#[derive(Debug, Default)]
pub struct Counter(AtomicU32);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Records one occurrence.
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads the current value. Diagnostic only; unsynchronized with the
    /// events being counted.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A countable event.
///
/// Implemented by hand for each event enum: `Counters` is a struct with one
/// [`Counter`] per variant, `NEW_COUNTERS` is its all-zero initializer, and
/// `count` bumps the matching field.
pub trait Count {
    /// Struct holding one counter per event variant.
    type Counters;

    /// All-zero initializer for the counters struct.
    const NEW_COUNTERS: Self::Counters;

    /// Records one occurrence of this event.
    fn count(&self, counters: &Self::Counters);
}

/// Declares a static set of counters for an event type.
///
/// `counters!(NAME, Type)` declares `static NAME`, counting occurrences of
/// `Type`; with the name omitted it declares `__COUNTERS`, which covers the
/// common one-set-per-module case.
#[macro_export]
macro_rules! counters {
    ($name:ident, $Type:ty) => {
        #[used]
        static $name: <$Type as $crate::Count>::Counters =
            <$Type as $crate::Count>::NEW_COUNTERS;
    };
    ($Type:ty) => {
        $crate::counters!(__COUNTERS, $Type);
    };
}
