/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! `machprelink` is the prelinked-kernel / kernel-collection patching and
//! kext-injection engine at the heart of a UEFI bootloader's macOS
//! compatibility layer.
//!
//! Given a macOS prelinked kernel (a Mach-O kernel image with a bundle of
//! kexts linked into `__PRELINK_TEXT`, plus an XML property-list catalog
//! embedded in `__PRELINK_INFO`), or a kernel collection (the macOS 11+
//! single-file fixup-chained variant), this crate:
//!
//! 1. Decompresses the kernel file into an in-memory buffer sized for
//!    later growth ([envelope]).
//! 2. Parses the Mach-O load commands and the embedded property-list
//!    catalog ([macho], [plist]).
//! 3. Injects additional kexts, linking their executables against symbols
//!    and vtables exported by kexts already present ([resolver],
//!    [linker]).
//! 4. Applies byte-level patches to the kernel or to specific resident
//!    kexts ([patcher]).
//! 5. Applies named, kernel-version-scoped "quirks" ([quirks]).
//! 6. Repacks the image into a new byte buffer ready for the kernel to
//!    jump into ([prelinked]).
//!
//! The entry point callers use is [prelinked::Prelinked]: construct one
//! with [prelinked::Prelinked::context_init], reserve space for planned
//! injections, call [prelinked::Prelinked::inject_prepare], then any mix
//! of [prelinked::Prelinked::inject_kext],
//! [prelinked::Prelinked::apply_generic_patch] and
//! [prelinked::Prelinked::apply_quirk] in caller order, and finish with
//! [prelinked::Prelinked::inject_complete].

#[macro_use]
mod log;

pub mod byteview;
pub mod envelope;
pub mod error;
pub mod linker;
pub mod macho;
pub mod patcher;
pub mod plist;
pub mod prelinked;
pub mod quirks;
pub mod resolver;
pub mod version;

pub use error::{Error, Result};
pub use prelinked::{Kext, KextStatus, Mode, Prelinked};
