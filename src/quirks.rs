/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Named, version-scoped quirks: higher-level fixups built on top of
//! [crate::patcher::apply_generic_patch].
//!
//! The catalog is plain data built by [catalog], not a `&'static` slice:
//! [crate::patcher::Patch] owns its pattern bytes (`Vec<u8>`/`String`),
//! which can't be assembled in a `const`/`static` initializer, so unlike
//! the quirk dispatch table in the original (a fixed array of function
//! pointers), this crate's catalog is built fresh each time it's needed —
//! cheap, since it's a handful of small allocations, and it keeps
//! `Prelinked::apply_quirk` taking plain data instead of function pointers.

pub mod kernel;
pub mod kext;

use crate::patcher::Patch;
use crate::version::VersionRange;

/// A single named quirk: a version range it applies within, the target it
/// patches (`None` = the kernel itself; `Some(bundle_id)` = a specific
/// resident kext), the patches that make it up, and whether failing to
/// apply any one of those patches should abort the whole operation or be
/// silently skipped (matches the original's split between quirks the
/// bootloader treats as mandatory and those it treats as best-effort).
pub struct Quirk {
    pub name: &'static str,
    pub target: Option<&'static str>,
    pub range: VersionRange,
    pub patches: Vec<Patch>,
    pub optional: bool,
}

/// The full catalog of quirks this crate ships, combining
/// [kernel::quirks] and [kext::quirks].
pub fn catalog() -> Vec<Quirk> {
    let mut all = kernel::quirks();
    all.extend(kext::quirks());
    all
}

pub fn find<'a>(catalog: &'a [Quirk], name: &str) -> Option<&'a Quirk> {
    catalog.iter().find(|q| q.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_unique_names() {
        let all = catalog();
        let mut names: Vec<&str> = all.iter().map(|q| q.name).collect();
        names.sort_unstable();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
    }

    #[test]
    fn find_locates_known_quirk() {
        let all = catalog();
        assert!(find(&all, "AppleCpuPmCfgLock").is_some());
        assert!(find(&all, "ThirdPartyDrives").is_some());
    }
}
