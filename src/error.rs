/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The error taxonomy shared by every component in this crate.
//!
//! Each variant carries enough context (bundle identifier, operation name,
//! offset window) for a caller to report a useful diagnostic without the
//! crate needing to format a human-readable string up front.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input bytes don't match the format we expect at this point
    /// (bad magic, truncated header, impossible size field).
    #[error("malformed input while {operation}: {detail}")]
    InputMalformed { operation: &'static str, detail: String },

    /// We understood the format but not this particular feature of it
    /// (an encryption scheme, a load command, a relocation kind).
    #[error("unsupported feature while {operation}: {feature}")]
    UnsupportedFeature { operation: &'static str, feature: String },

    /// An arithmetic computation (size, offset, address) would not fit.
    #[error("overflow while {operation} at offset {offset:#x}")]
    Overflow { operation: &'static str, offset: u64 },

    /// A kext declares a dependency that isn't present in the image.
    #[error("kext {bundle_id:?} is missing dependency {dependency:?}")]
    MissingDependency { bundle_id: String, dependency: String },

    /// Two kexts (or a kext and an existing entry) share a bundle identifier.
    #[error("duplicate bundle identifier {bundle_id:?}")]
    DuplicateBundleId { bundle_id: String },

    /// The working buffer's reserved capacity was exceeded.
    #[error("capacity exceeded while {operation}: needed {needed} bytes, have {available}")]
    CapacityExceeded { operation: &'static str, needed: usize, available: usize },

    /// A patch's search pattern was not found within its search window.
    #[error("patch {comment:?} not found (target {bundle_id:?})")]
    PatchNotFound { comment: String, bundle_id: String },

    /// The detected kernel version falls outside a quirk's supported range.
    #[error("kernel version {found} is not in the supported range {min}..={max} for {operation}")]
    UnsupportedKernelVersion { operation: &'static str, found: String, min: String, max: String },

    /// A call was made out of the required sequence (see the ordering model).
    #[error("invalid state: {operation} called {when}")]
    InvalidState { operation: &'static str, when: &'static str },
}

/// A byte offset window, used purely for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub len: usize,
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.start + self.len)
    }
}
