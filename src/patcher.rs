/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Generic byte-level patching: find/replace with optional wildcard masks,
//! symbol-anchored search bases, and kext blocking.
//!
//! Grounded directly on `PATCHER_GENERIC_PATCH` (see
//! `OcAppleKernelLib.h`) and the two example patches in
//! `Utilities/TestKextInject/KextInject.c`:
//! `DisableIOAHCIPatch` (symbol-anchored, `Count = 1`) and
//! `DisableIoLogPatch` (whole-function search, `Count = 1`).

use crate::byteview::ByteViewMut;
use crate::error::{Error, Result};

/// What to search for. [Pattern::Masked] generalizes the original's
/// parallel `Mask`/`ReplaceMask` byte arrays into a single enum variant per
/// the REDESIGN FLAG carried over from the distilled spec.
#[derive(Debug, Clone)]
pub enum Pattern {
    Exact(Vec<u8>),
    Masked { bytes: Vec<u8>, mask: Vec<u8> },
}

impl Pattern {
    fn len(&self) -> usize {
        match self {
            Pattern::Exact(b) => b.len(),
            Pattern::Masked { bytes, .. } => bytes.len(),
        }
    }

    fn matches_at(&self, haystack: &[u8]) -> bool {
        match self {
            Pattern::Exact(bytes) => haystack == bytes.as_slice(),
            Pattern::Masked { bytes, mask } => haystack
                .iter()
                .zip(bytes.iter())
                .zip(mask.iter())
                .all(|((h, b), m)| (h & m) == (b & m)),
        }
    }
}

/// A single generic patch descriptor.
#[derive(Debug, Clone)]
pub struct Patch {
    pub comment: String,
    /// Search/replace window base: a fixed offset from the start of the
    /// target (kernel buffer or kext body). When [Patch::base_symbol] is
    /// set, this is added to the resolved symbol's file offset instead of
    /// counting from offset zero, the same relationship `PatcherApplyGenericPatch`
    /// keeps between its `Base` pointer and its caller-supplied symbol.
    pub base: usize,
    /// If set, `base` is resolved relative to this symbol's file offset
    /// within the target's Mach-O rather than from the start of the target
    /// (the "symbol-anchored" half of the original's `Base`/`Symbol` pair).
    /// `None` searches from offset zero, i.e. "anywhere in target".
    pub base_symbol: Option<&'static str>,
    pub find: Pattern,
    /// Replacement bytes. A [Pattern::Masked] replacement only overwrites
    /// the bytes selected by its own mask, leaving the rest of the matched
    /// window untouched — this lets a patch flip a handful of bits inside
    /// an instruction without needing to know its other operand bytes.
    pub replace: Pattern,
    /// How many bytes after `base` to search within. `0` means search to
    /// the end of the region (see the distilled spec's resolution of the
    /// zero-count ambiguity, reused here for the search window itself).
    pub limit: usize,
    /// How many leading matches to skip before the first replacement is
    /// made (a count of matches, not a byte offset).
    pub skip: usize,
    /// Maximum number of matches to replace. `0` means unlimited ("replace
    /// all occurrences"), matching §9(b) of the design notes.
    pub count: usize,
}

/// Apply `patch` to `buffer`, returning the number of replacements made.
/// Errors with [Error::PatchNotFound] if zero matches are found — every
/// registered patch is expected to hit, so a silent no-op would hide a
/// quirk going stale across kernel versions.
pub fn apply_generic_patch(buffer: &mut [u8], bundle_id: &str, patch: &Patch) -> Result<usize> {
    const OP: &str = "applying generic patch";
    let find_len = patch.find.len();
    if find_len == 0 {
        return Err(Error::InputMalformed { operation: OP, detail: "patch find pattern is empty".into() });
    }
    if patch.replace.len() != find_len {
        return Err(Error::InputMalformed {
            operation: OP,
            detail: format!("find pattern is {} bytes but replace pattern is {}", find_len, patch.replace.len()),
        });
    }

    let region_start = patch.base;
    let region_len = if patch.limit == 0 {
        buffer.len().saturating_sub(region_start)
    } else {
        patch.limit
    };
    let region_end = region_start.checked_add(region_len).ok_or(Error::Overflow { operation: OP, offset: region_start as u64 })?;
    let region = buffer.get(region_start..region_end.min(buffer.len())).ok_or_else(|| Error::InputMalformed {
        operation: OP,
        detail: format!("search region {:#x}..{:#x} out of bounds", region_start, region_end),
    })?;

    // First pass (read-only): collect every match offset in the region,
    // then drop the first `skip` of them and keep at most `count`. This is
    // the "scratch" half of the scratch-then-commit transaction — nothing
    // is written until we know the whole operation can succeed.
    let mut all_offsets = Vec::new();
    if region.len() >= find_len {
        let mut i = 0;
        while i + find_len <= region.len() {
            if patch.find.matches_at(&region[i..i + find_len]) {
                all_offsets.push(region_start + i);
                i += find_len;
            } else {
                i += 1;
            }
        }
    }

    let max_matches = if patch.count == 0 { usize::MAX } else { patch.count };
    let match_offsets: Vec<usize> = all_offsets.into_iter().skip(patch.skip).take(max_matches).collect();

    if match_offsets.is_empty() {
        return Err(Error::PatchNotFound { comment: patch.comment.clone(), bundle_id: bundle_id.to_string() });
    }

    // Second pass: commit. Since every offset was validated in-bounds
    // above, this cannot fail.
    let mut view = ByteViewMut::new(buffer);
    for offset in &match_offsets {
        match &patch.replace {
            Pattern::Exact(bytes) => view.write_bytes(OP, *offset, bytes)?,
            Pattern::Masked { bytes, mask } => {
                let window = view.slice_mut(OP, *offset, bytes.len())?;
                for ((w, b), m) in window.iter_mut().zip(bytes.iter()).zip(mask.iter()) {
                    *w = (*w & !m) | (b & m);
                }
            }
        }
    }

    Ok(match_offsets.len())
}

/// Block a kext from loading by invalidating its bundle identifier in the
/// prelink catalog entry, the same outcome `PatcherBlockKext`/the test
/// harness's blocking of `com.apple.iokit.IOHIDFamily` achieves: the kext's
/// Mach-O body stays resident (so offsets elsewhere in the image don't
/// shift) but the kernel's bundle loader can no longer find it by name.
pub fn block_kext_identifier(bundle_id: &str) -> String {
    format!("{bundle_id}.disabled-by-patcher")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_single_replace() {
        let mut buf = vec![0x55, 0x89, 0xe5, 0xc9, 0xc3];
        let patch = Patch {
            comment: "ret early".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0xc9, 0xc3]),
            replace: Pattern::Exact(vec![0x90, 0x90]),
            limit: 0,
            skip: 0,
            count: 1,
        };
        let n = apply_generic_patch(&mut buf, "com.example.test", &patch).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf, vec![0x55, 0x89, 0xe5, 0x90, 0x90]);
    }

    #[test]
    fn masked_replace_only_touches_masked_bits() {
        let mut buf = vec![0xff, 0xab];
        let patch = Patch {
            comment: "clear low nibble".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Masked { bytes: vec![0x00, 0xab], mask: vec![0x00, 0xff] },
            replace: Pattern::Masked { bytes: vec![0x00, 0x00], mask: vec![0x00, 0x0f] },
            limit: 0,
            skip: 0,
            count: 1,
        };
        apply_generic_patch(&mut buf, "com.example.test", &patch).unwrap();
        assert_eq!(buf, vec![0xff, 0xa0]);
    }

    #[test]
    fn zero_count_replaces_all_occurrences() {
        let mut buf = vec![0xaa, 0xbb, 0xaa, 0xbb, 0xaa, 0xbb];
        let patch = Patch {
            comment: "replace all".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0xaa, 0xbb]),
            replace: Pattern::Exact(vec![0x00, 0x00]),
            limit: 0,
            skip: 0,
            count: 0,
        };
        let n = apply_generic_patch(&mut buf, "com.example.test", &patch).unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, vec![0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn find_equal_replace_is_a_no_op() {
        // §8 testable property: a patch whose find and replace bytes are
        // identical (with or without masks) must leave the buffer
        // byte-for-byte unchanged, even though it reports a match.
        let original = vec![0x48, 0x89, 0xe5, 0xc3, 0x48, 0x89, 0xe5];
        let mut buf = original.clone();
        let patch = Patch {
            comment: "identity".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Masked { bytes: vec![0x48, 0x89, 0xe5], mask: vec![0xff, 0xff, 0x00] },
            replace: Pattern::Masked { bytes: vec![0x48, 0x89, 0xe5], mask: vec![0xff, 0xff, 0x00] },
            limit: 0,
            skip: 0,
            count: 0,
        };
        let n = apply_generic_patch(&mut buf, "com.example.test", &patch).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf, original);
    }

    #[test]
    fn not_found_is_reported() {
        let mut buf = vec![0x00, 0x01, 0x02];
        let patch = Patch {
            comment: "missing".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0xff, 0xff]),
            replace: Pattern::Exact(vec![0x00, 0x00]),
            limit: 0,
            skip: 0,
            count: 1,
        };
        assert!(matches!(
            apply_generic_patch(&mut buf, "com.example.test", &patch),
            Err(Error::PatchNotFound { .. })
        ));
    }
}
