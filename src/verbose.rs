// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Operator facing verbosity.
//!
//! The level is a small bitmask chosen once per invocation; it decides
//! which recoverable events are reported, on top of the `log` level.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

bitflags! {
    pub struct VerboseFlags: u64 {
        /// Progress of the dump, one line per phase.
        const PROGRESS = 0x1;
        /// Report every recoverable read failure.
        const NONQUIET = 0x2;
        /// Report pages that could not be read.
        const PAGEFAULT = 0x4;
    }
}

pub const VERBOSE_DEFAULT_LEVEL: VerboseFlags = VerboseFlags::PAGEFAULT;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerbosityError {
    #[error("verbose level {level} is out of range (max 7)")]
    OutOfRange { level: u64 },
}

/// Current verbose level.
#[derive(Debug)]
pub struct Verbosity {
    level: AtomicU64,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity {
            level: AtomicU64::new(VERBOSE_DEFAULT_LEVEL.bits()),
        }
    }
}

impl Verbosity {
    /// Set the verbose level; anything above the max level is rejected and
    /// the current level is kept.
    pub fn set(&self, level: u64) -> Result<(), VerbosityError> {
        let flags = VerboseFlags::from_bits(level).ok_or(VerbosityError::OutOfRange { level })?;
        self.level.store(flags.bits(), Ordering::SeqCst);
        Ok(())
    }

    pub fn set_default(&self) {
        self.level
            .store(VERBOSE_DEFAULT_LEVEL.bits(), Ordering::SeqCst);
    }

    pub fn get(&self) -> VerboseFlags {
        VerboseFlags::from_bits_truncate(self.level.load(Ordering::SeqCst))
    }

    pub fn progress(&self) -> bool {
        self.get().contains(VerboseFlags::PROGRESS)
    }

    pub fn nonquiet(&self) -> bool {
        self.get().contains(VerboseFlags::NONQUIET)
    }

    pub fn pagefault(&self) -> bool {
        self.get().contains(VerboseFlags::PAGEFAULT)
    }
}

/// Log a progress line if the PROGRESS verbose flag is set.
macro_rules! progressf {
    ($verbosity:expr, $($arg:tt)+) => {{
        if $verbosity.progress() {
            log::info!($($arg)+);
        }
    }};
}

/// Log a page fault notice if the PAGEFAULT verbose flag is set.
macro_rules! pagefaultf {
    ($verbosity:expr, $($arg:tt)+) => {{
        if $verbosity.pagefault() {
            log::warn!($($arg)+);
        }
    }};
}

/// Log a recoverable read failure if the NONQUIET verbose flag is set.
macro_rules! nonquietf {
    ($verbosity:expr, $($arg:tt)+) => {{
        if $verbosity.nonquiet() {
            log::warn!($($arg)+);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_pagefault() {
        let verbosity = Verbosity::default();
        assert!(verbosity.pagefault());
        assert!(!verbosity.progress());
        assert!(!verbosity.nonquiet());
    }

    #[test]
    fn accepts_every_level_up_to_max() {
        let verbosity = Verbosity::default();
        for level in 0..=7 {
            assert_eq!(Ok(()), verbosity.set(level));
            assert_eq!(level, verbosity.get().bits());
        }
    }

    #[test]
    fn rejects_out_of_range_without_change() {
        let verbosity = Verbosity::default();
        verbosity.set(3).unwrap();
        assert_eq!(
            Err(VerbosityError::OutOfRange { level: 8 }),
            verbosity.set(8)
        );
        assert_eq!(3, verbosity.get().bits());
        verbosity.set_default();
        assert_eq!(VERBOSE_DEFAULT_LEVEL, verbosity.get());
    }
}
