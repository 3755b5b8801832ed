//! Monotonic, read-only diagnostic counters.
//!
//! This is the hosted-process counterpart of Hubris's `counters` crate: that
//! crate declares a static set of zero-cost ring-buffer counters for a
//! single-threaded `no_std` task image. This crate's counters are read by
//! more than one thread (a caller thread inspecting engine health while the
//! receive loop is incrementing counters), so each field is a plain
//! `AtomicU32` rather than a ring-buffer slot, and the declaration macro
//! below builds a `Default`-able, `Sync` struct instead of a static.

use std::sync::atomic::{AtomicU32, Ordering};

/// Declares a struct of named, independently-incrementable `u32` counters.
///
/// ```
/// growth_counters::counters! {
///     pub struct EngineCounters {
///         discarded_received_commands,
///         discarded_malformed_packets,
///     }
/// }
/// let c = EngineCounters::default();
/// c.discarded_received_commands.inc();
/// assert_eq!(c.discarded_received_commands.get(), 1);
/// ```
#[macro_export]
macro_rules! counters {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($field_vis:vis $field:ident),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Default)]
        $vis struct $name {
            $($field_vis $field: $crate::Counter),*
        }
    };
}

/// A single monotonic counter, safe to increment from any thread.
#[derive(Debug, Default)]
pub struct Counter(AtomicU32);

impl Counter {
    pub const fn new() -> Self {
        Counter(AtomicU32::new(0))
    }

    /// Increments the counter, saturating rather than wrapping at `u32::MAX`
    /// -- wraparound would make a long-running counter look like it reset.
    pub fn inc(&self) {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(1))
            })
            .ok();
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    counters! {
        #[derive(Debug)]
        struct Demo {
            pub a,
            pub b,
        }
    }

    #[test]
    fn independent_fields() {
        let d = Demo::default();
        d.a.inc();
        d.a.inc();
        d.b.inc();
        assert_eq!(d.a.get(), 2);
        assert_eq!(d.b.get(), 1);
    }

    #[test]
    fn saturates_instead_of_wrapping() {
        let c = Counter::new();
        c.0.store(u32::MAX, Ordering::Relaxed);
        c.inc();
        assert_eq!(c.get(), u32::MAX);
    }
}
