/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Swappable diagnostic console, shared by every `runtime-*` crate.
//!
//! Mirrors `machine::console`/`machine::macros`: a single global sink behind a
//! trait object, registered once by whichever task owns the real serial port,
//! with a `NullConsole` default so hosted tests print nothing.

#![no_std]

use core::cell::UnsafeCell;

/// Console interfaces.
pub mod interface {
    use core::fmt;

    /// Write a Rust format string to the console.
    pub trait Write {
        /// Write a formatted string.
        fn write_fmt(&self, args: fmt::Arguments) -> fmt::Result;
    }
}

/// A pseudo-lock for teaching purposes, identical in spirit to `machine::sync::NullLock`.
///
/// `runtime-sync` is built on top of this crate, so this crate cannot depend on
/// `runtime-sync` itself; the single global console slot below only ever needs
/// single-writer-at-registration-time semantics, which this lock provides.
struct NullLock<T>
where
    T: ?Sized,
{
    data: UnsafeCell<T>,
}

unsafe impl<T> Send for NullLock<T> where T: ?Sized + Send {}
unsafe impl<T> Sync for NullLock<T> where T: ?Sized + Send {}

impl<T> NullLock<T> {
    const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let data = unsafe { &mut *self.data.get() };
        f(data)
    }
}

/// A console that discards everything written to it.
pub struct NullConsole;

/// The single global console instance.
pub static NULL_CONSOLE: NullConsole = NullConsole;

impl interface::Write for NullConsole {
    fn write_fmt(&self, _args: core::fmt::Arguments) -> core::fmt::Result {
        Ok(())
    }
}

static CONSOLE: NullLock<&'static (dyn interface::Write + Sync)> = NullLock::new(&NULL_CONSOLE);

/// Register a new console as the global sink for the print macros below.
pub fn register_console(new_console: &'static (dyn interface::Write + Sync)) {
    CONSOLE.with(|con| *con = new_console);
}

/// Return a reference to the currently registered console.
pub fn console() -> &'static dyn interface::Write {
    CONSOLE.with(|con| *con)
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    let _ = console().write_fmt(args);
}

/// Print a formatted line without a level tag.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Print an info-level line.
#[macro_export]
macro_rules! info {
    ($string:expr) => ($crate::_print(format_args!(concat!("[I] ", $string))));
    ($format_string:expr, $($arg:tt)*) => (
        $crate::_print(format_args!(concat!("[I] ", $format_string), $($arg)*))
    );
}

/// Print a warning-level line.
#[macro_export]
macro_rules! warn {
    ($string:expr) => ($crate::_print(format_args!(concat!("[W] ", $string))));
    ($format_string:expr, $($arg:tt)*) => (
        $crate::_print(format_args!(concat!("[W] ", $format_string), $($arg)*))
    );
}

/// Print an error-level line. Always precedes a `Fatal` error being returned.
#[macro_export]
macro_rules! error {
    ($string:expr) => ($crate::_print(format_args!(concat!("[E] ", $string))));
    ($format_string:expr, $($arg:tt)*) => (
        $crate::_print(format_args!(concat!("[E] ", $format_string), $($arg)*))
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt;

    struct CapturingConsole;
    impl interface::Write for CapturingConsole {
        fn write_fmt(&self, _args: fmt::Arguments) -> fmt::Result {
            Ok(())
        }
    }
    static CAPTURING: CapturingConsole = CapturingConsole;

    #[test]
    fn default_console_discards_output() {
        crate::info!("hello {}", 1);
    }

    #[test]
    fn register_console_swaps_sink() {
        register_console(&CAPTURING);
        crate::warn!("swapped");
        register_console(&NULL_CONSOLE);
    }
}
