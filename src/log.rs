/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Hand-rolled logging, module-path prefixed, matching the style of the
//! teacher crate's own `log!`/`log_dbg!`/`echo!` macros rather than
//! pulling in the `log`/`env_logger` crates: the bootloader host this
//! crate is linked into has no stdio or environment, so logging must stay
//! a cheap, allocation-light macro the caller can route anywhere (serial
//! console, in-memory ring buffer) by swapping out [echo]'s body.

/// Print a message (with implicit newline).
///
/// Prefer [log] or [log_dbg] for diagnostics; reach for [echo] directly
/// only for output that genuinely isn't tied to a particular module.
macro_rules! echo {
    ($($arg:tt)+) => {
        eprintln!($($arg)+);
    };
    () => {
        eprintln!();
    }
}

/// Prints a log message unconditionally. Use this for errors or warnings.
///
/// The message is prefixed with the module path, so it is clear where it comes
/// from.
macro_rules! log {
    ($($arg:tt)+) => {
        echo!("{}: {}", module_path!(), format_args!($($arg)+));
    }
}

/// Like [log], but prints the message only if debugging is enabled for the
/// module where it is used. This can be used for verbose things only needed
/// when debugging.
#[macro_export]
macro_rules! log_dbg {
    ($($arg:tt)+) => {
        if $crate::log::ENABLED_MODULES.contains(&module_path!()) {
            log!($($arg)*);
        }
    }
}

/// Put modules to enable [log_dbg] for here, e.g. "touchHLE::mem" to see when
/// memory is allocated and freed.
pub const ENABLED_MODULES: &[&str] = &[];
