/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Kernel (Darwin) version detection and range matching, as used to scope
//! quirks to the macOS releases they apply to.
//!
//! Grounded on `OcKernelReadDarwinVersion`, referenced by
//! `Utilities/TestKextInject/KextInject.c`'s `wrap_main`: the prelinked
//! kernel's version string is read from its `__const`/version section and
//! parsed into the `Darwin <major>.<minor>.<patch>` triple that the quirks
//! catalog matches against.

use crate::error::{Error, Result};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DarwinVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl DarwinVersion {
    pub const MIN: DarwinVersion = DarwinVersion { major: 0, minor: 0, patch: 0 };
    pub const MAX: DarwinVersion = DarwinVersion { major: u32::MAX, minor: u32::MAX, patch: u32::MAX };

    /// Parse a string like `"Darwin Kernel Version 20.6.0: ..."` or a bare
    /// `"20.6.0"`, taking the first `major.minor.patch` triple found.
    pub fn parse(version_string: &str) -> Result<DarwinVersion> {
        const OP: &str = "parsing kernel version string";
        let digits_and_dots = version_string
            .split(|c: char| !c.is_ascii_digit() && c != '.')
            .find(|s| s.chars().filter(|c| *c == '.').count() == 2)
            .ok_or_else(|| Error::InputMalformed {
                operation: OP,
                detail: format!("no major.minor.patch triple found in {version_string:?}"),
            })?;

        let mut parts = digits_and_dots.splitn(3, '.');
        let parse_part = |s: Option<&str>| -> Result<u32> {
            s.and_then(|s| s.parse().ok()).ok_or_else(|| Error::InputMalformed {
                operation: OP,
                detail: format!("malformed version component in {version_string:?}"),
            })
        };
        Ok(DarwinVersion {
            major: parse_part(parts.next())?,
            minor: parse_part(parts.next())?,
            patch: parse_part(parts.next())?,
        })
    }
}

impl std::fmt::Display for DarwinVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// An inclusive version range, `min..=max`. `VersionRange::ANY` matches
/// every version; used by quirks that apply regardless of kernel release.
#[derive(Debug, Clone, Copy)]
pub struct VersionRange {
    pub min: DarwinVersion,
    pub max: DarwinVersion,
}

impl VersionRange {
    pub const ANY: VersionRange = VersionRange { min: DarwinVersion::MIN, max: DarwinVersion::MAX };

    pub fn contains(&self, version: DarwinVersion) -> bool {
        matches!(version.cmp(&self.min), Ordering::Greater | Ordering::Equal)
            && matches!(version.cmp(&self.max), Ordering::Less | Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_triple() {
        assert_eq!(DarwinVersion::parse("20.6.0").unwrap(), DarwinVersion { major: 20, minor: 6, patch: 0 });
    }

    #[test]
    fn parses_embedded_in_banner_string() {
        let banner = "Darwin Kernel Version 21.6.0: Mon Aug 22 20:19:52 PDT 2022; root:xnu-8020.240.7~1/RELEASE_X86_64";
        assert_eq!(DarwinVersion::parse(banner).unwrap(), DarwinVersion { major: 21, minor: 6, patch: 0 });
    }

    #[test]
    fn range_containment() {
        let range = VersionRange { min: DarwinVersion { major: 19, minor: 0, patch: 0 }, max: DarwinVersion { major: 21, minor: 99, patch: 99 } };
        assert!(range.contains(DarwinVersion { major: 20, minor: 6, patch: 0 }));
        assert!(!range.contains(DarwinVersion { major: 22, minor: 0, patch: 0 }));
    }

    #[test]
    fn any_range_contains_everything() {
        assert!(VersionRange::ANY.contains(DarwinVersion { major: 9, minor: 9, patch: 9 }));
    }
}
