/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Kext linking: placement, symbol binding, relocation application and
//! vtable patching.
//!
//! Where the ancestor project's `dyld.rs` links a guest app's references
//! against host-implemented frameworks (see `Dyld::do_non_lazy_linking`),
//! this module links a newly-injected kext's undefined references against
//! the kexts already resident in the prelinked image, using
//! [crate::resolver]'s dependency closure in exactly the same "first match
//! in search order wins" shape.

use crate::byteview::ByteViewMut;
use crate::error::{Error, Result};
use crate::macho::MachO;
use crate::resolver::{self, ExportTable, Vtable, VtableSlot};
use std::collections::BTreeMap;

/// Where a kext's Mach-O body was placed once linked into the working
/// buffer: the base virtual address it was relocated to, and the file
/// offset range it occupies so the catalog/fixup-chain builder can find it
/// again.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub vm_base: u64,
    pub file_offset: usize,
    pub file_size: usize,
}

/// Choose where to place a newly-linked kext: immediately after the
/// current end of the working image's `__PRELINK_TEXT` region, page
/// aligned, mirroring `KcGetKextSize`'s page-rounding of kext bodies so
/// that two kexts never share a page (and so a later kext's fixups cannot
/// accidentally straddle into this one's bytes).
pub fn place_kext(current_end_vm: u64, current_end_file_offset: usize, size: usize) -> Placement {
    const PAGE_SIZE: u64 = 0x1000;
    let vm_base = (current_end_vm + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let file_offset = (current_end_file_offset + 0xfff) & !0xfff;
    Placement { vm_base, file_offset, file_size: size }
}

/// Link `macho`'s undefined external symbols against `closure`, returning
/// `(file_offset_within_macho, resolved_address)` pairs ready to be
/// written into the working buffer at `placement.file_offset + offset`.
///
/// A symbol that cannot be resolved aborts the whole link (this function
/// does not perform partial binding): the caller's transaction is expected
/// to discard the scratch buffer entirely on error, per the ordering
/// model's "all or nothing" requirement for `inject_kext`.
pub fn bind_external_relocations(
    bundle_id: &str,
    macho: &MachO,
    closure: &[ExportTable],
) -> Result<Vec<(u64, u64)>> {
    let mut bindings = Vec::with_capacity(macho.external_relocations.len());
    for &(addr, sym_idx) in &macho.external_relocations {
        let symbol = macho.symbols.get(sym_idx as usize).ok_or_else(|| Error::InputMalformed {
            operation: "binding external relocations",
            detail: format!("relocation references out-of-range symbol index {sym_idx}"),
        })?;
        let (_, resolved) = resolver::resolve_symbol(closure, &symbol.name).ok_or_else(|| Error::MissingDependency {
            bundle_id: bundle_id.to_string(),
            dependency: symbol.name.clone(),
        })?;
        bindings.push((addr, resolved));
    }
    Ok(bindings)
}

/// One vtable together with the file offset (within the kext's own
/// executable bytes, before placement) its first slot sits at, so
/// [apply_vtable_writes] can find it again once the kext has a
/// [Placement].
pub struct LinkedVtable {
    pub vtable: Vtable,
    pub file_offset: usize,
}

fn read_u64_le_at(bytes: &[u8], offset: usize) -> Result<u64> {
    const OP: &str = "reading vtable slot";
    crate::byteview::ByteView::new(bytes).read_u64_le(OP, offset)
}

/// Collect every vtable a kext defines (any `__ZTV`-prefixed defined
/// symbol), derive its real slot layout from the section bytes at
/// `sym.value`, and resolve any slot that carries an external relocation
/// against the dependency closure. A slot with no relocation already holds
/// a fixed value (a local override, or RTTI/offset-to-top bookkeeping) and
/// is carried through unchanged.
///
/// A symbol's slot count is derived the way a linker infers an implicit
/// symbol size in the absence of an explicit one: the gap to the next
/// defined symbol in the same section, or the section's own end if this is
/// the last one.
pub fn link_vtables(bundle_id: &str, macho: &MachO, closure: &[ExportTable]) -> Result<Vec<LinkedVtable>> {
    const OP: &str = "linking vtables";
    let mut out = Vec::new();

    for sym in macho.defined_symbols() {
        let Some(class_name) = resolver::vtable_class_name(&sym.name) else { continue };
        let crate::macho::SymbolKind::Defined { section_index } = sym.kind else { continue };
        let section = macho
            .section_by_index(section_index)
            .ok_or_else(|| Error::InputMalformed { operation: OP, detail: format!("vtable symbol {} names an out-of-range section", sym.name) })?;

        let next_va = macho
            .defined_symbols()
            .filter_map(|other| match other.kind {
                crate::macho::SymbolKind::Defined { section_index: si } if si == section_index && other.value > sym.value => Some(other.value),
                _ => None,
            })
            .min()
            .unwrap_or(section.addr + section.size);
        let slot_count = next_va.saturating_sub(sym.value) / 8;

        let file_offset = macho
            .va_to_file_offset(sym.value)
            .ok_or_else(|| Error::InputMalformed { operation: OP, detail: format!("vtable symbol {} has no mapped file offset", sym.name) })?;

        let mut slots = Vec::with_capacity(slot_count as usize);
        for i in 0..slot_count {
            let slot_offset = file_offset + i * 8;
            match macho.external_relocations.iter().find(|&&(addr, _)| addr == slot_offset) {
                Some(&(_, sym_idx)) => {
                    let target = macho.symbols.get(sym_idx as usize).ok_or_else(|| Error::InputMalformed {
                        operation: OP,
                        detail: format!("vtable relocation references out-of-range symbol index {sym_idx}"),
                    })?;
                    slots.push(VtableSlot::Unresolved(target.name.clone()));
                }
                None => slots.push(VtableSlot::Resolved(read_u64_le_at(macho.as_bytes(), slot_offset as usize)?)),
            }
        }

        let mut vtable = Vtable { class_name: class_name.to_string(), slots };
        let unresolved = vtable.resolve_all(closure);
        if let Some(first) = unresolved.into_iter().next() {
            return Err(Error::MissingDependency { bundle_id: bundle_id.to_string(), dependency: first });
        }
        out.push(LinkedVtable { vtable, file_offset: file_offset as usize });
    }
    Ok(out)
}

/// Write every vtable's resolved slots back into the working buffer at
/// `placement`, per the requirement that a vtable's slots land in the
/// kext's own `__DATA.__const` bytes once linked.
pub fn apply_vtable_writes(buffer: &mut [u8], placement: Placement, vtables: &[LinkedVtable]) -> Result<()> {
    const OP: &str = "writing vtable slots";
    let mut view = ByteViewMut::new(buffer.get_mut(placement.file_offset..placement.file_offset + placement.file_size).ok_or_else(|| {
        Error::InputMalformed { operation: OP, detail: "kext placement out of bounds".into() }
    })?);
    for lv in vtables {
        for (i, slot) in lv.vtable.slots.iter().enumerate() {
            if let VtableSlot::Resolved(addr) = slot {
                view.write_u64_le(OP, lv.file_offset + i * 8, *addr)?;
            }
        }
    }
    Ok(())
}

/// Write resolved relocations into the working buffer at `placement`.
/// Classic-mode only: kernel-collection mode binds through
/// [link_chained_fixups] instead, since its loader walks a fixup chain
/// rather than trusting baked-in absolute pointers.
pub fn apply_bindings(buffer: &mut [u8], placement: Placement, bindings: &[(u64, u64)]) -> Result<()> {
    const OP: &str = "applying kext bindings";
    let mut view = ByteViewMut::new(buffer.get_mut(placement.file_offset..placement.file_offset + placement.file_size).ok_or_else(|| {
        Error::InputMalformed { operation: OP, detail: "kext placement out of bounds".into() }
    })?);
    for &(addr, value) in bindings {
        let offset: usize = addr.try_into().map_err(|_| Error::Overflow { operation: OP, offset: addr })?;
        view.write_u64_le(OP, offset, value)?;
    }
    Ok(())
}

/// `DYLD_CHAINED_PTR_64_KERNEL_CACHE`, mirrored from [crate::macho]'s reader
/// so the two stay in lockstep.
const DYLD_CHAINED_PTR_64_KERNEL_CACHE: u16 = 12;
const CHAINED_PTR_START_NONE: u16 = 0xffff;
const CHAINED_PTR_GRANULE: u64 = 4;
/// `dyld_chained_starts_in_segment.page_size` this crate always builds
/// with: the standard 4KiB x86_64 page, matching the rest of this module's
/// page-alignment conventions (see [place_kext]).
pub const FIXUP_PAGE_SIZE: u64 = 0x1000;

/// Bind `bindings` by emitting a `dyld_chained_starts_in_segment`-shaped
/// rebase chain instead of writing resolved absolute pointers in place
/// (kernel-collection mode's loader threads this chain itself at boot, see
/// §4.G step 4). Each bound slot's raw bytes become a
/// `DYLD_CHAINED_PTR_64_KERNEL_CACHE` rebase word (`target`/`next`, no
/// binds/imports: every slot here is already resolved to a fixed target
/// address, so this is a pure rebase chain); this function returns the
/// serialized per-segment header+page-starts bytes for this kext alone.
/// `Prelinked::inject_complete` is responsible for folding every injected
/// kext's chain into one combined `LC_DYLD_CHAINED_FIXUPS` payload.
///
/// `virtual_base` is the image-wide reference point `target` is measured
/// from (this crate always uses the lowest segment's own `vmaddr`, see
/// `Prelinked::context_init`); it plays the role `VirtualBase` plays in the
/// ancestor library's `PRELINKED_CONTEXT`.
pub fn link_chained_fixups(buffer: &mut [u8], placement: Placement, virtual_base: u64, bindings: &[(u64, u64)]) -> Result<Vec<u8>> {
    const OP: &str = "writing chained fixups";
    if bindings.is_empty() {
        return Ok(Vec::new());
    }

    let mut by_page: BTreeMap<u64, Vec<(u64, u64)>> = BTreeMap::new();
    for &(local_offset, target_va) in bindings {
        by_page.entry(local_offset / FIXUP_PAGE_SIZE).or_default().push((local_offset, target_va));
    }
    let page_count = *by_page.keys().next_back().expect("by_page is non-empty") as usize + 1;
    let mut page_starts = vec![CHAINED_PTR_START_NONE; page_count];

    {
        let mut view = ByteViewMut::new(buffer.get_mut(placement.file_offset..placement.file_offset + placement.file_size).ok_or_else(|| {
            Error::InputMalformed { operation: OP, detail: "kext placement out of bounds".into() }
        })?);

        for (page, mut slots) in by_page {
            slots.sort_by_key(|&(offset, _)| offset);
            page_starts[page as usize] = (slots[0].0 % FIXUP_PAGE_SIZE) as u16;
            for i in 0..slots.len() {
                let (local_offset, target_va) = slots[i];
                let next_granules = if i + 1 < slots.len() { (slots[i + 1].0 - local_offset) / CHAINED_PTR_GRANULE } else { 0 };
                let target_granule = target_va.checked_sub(virtual_base).ok_or(Error::Overflow { operation: OP, offset: target_va })? / CHAINED_PTR_GRANULE;
                if target_granule > 0x3fff_ffff || next_granules > 0xfff {
                    return Err(Error::Overflow { operation: OP, offset: target_va });
                }
                let word = (target_granule & 0x3fff_ffff) | ((next_granules & 0xfff) << 51);
                view.write_u64_le(OP, local_offset as usize, word)?;
            }
        }
    }

    let mut out = Vec::with_capacity(24 + page_starts.len() * 2);
    out.extend_from_slice(&(24u32 + page_starts.len() as u32 * 2).to_le_bytes()); // size
    out.extend_from_slice(&(FIXUP_PAGE_SIZE as u16).to_le_bytes()); // page_size
    out.extend_from_slice(&DYLD_CHAINED_PTR_64_KERNEL_CACHE.to_le_bytes()); // pointer_format
    out.extend_from_slice(&placement.vm_base.to_le_bytes()); // segment_offset
    out.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // max_valid_pointer (unused, 64-bit)
    out.extend_from_slice(&(page_starts.len() as u16).to_le_bytes()); // page_count
    for p in page_starts {
        out.extend_from_slice(&p.to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_is_page_aligned() {
        let p = place_kext(0x1001, 0x1001, 0x2000);
        assert_eq!(p.vm_base % 0x1000, 0);
        assert_eq!(p.file_offset % 0x1000, 0);
    }

    #[test]
    fn placement_does_not_move_already_aligned_base() {
        let p = place_kext(0x2000, 0x2000, 0x1000);
        assert_eq!(p.vm_base, 0x2000);
        assert_eq!(p.file_offset, 0x2000);
    }

    #[test]
    fn chained_fixups_thread_a_single_page_in_order() {
        let mut buffer = vec![0u8; 0x3000];
        let placement = Placement { vm_base: 0x2000, file_offset: 0x2000, file_size: 0x1000 };
        let virtual_base = 0x1000u64;
        // Two slots in the same page, resolving to targets 0x40 and 0x80
        // granules past virtual_base.
        let bindings = vec![(0u64, virtual_base + 0x100), (16u64, virtual_base + 0x200)];

        let header = link_chained_fixups(&mut buffer, placement, virtual_base, &bindings).unwrap();
        assert!(!header.is_empty());

        let word0 = u64::from_le_bytes(buffer[0x2000..0x2008].try_into().unwrap());
        assert_eq!(word0 & 0x3fff_ffff, 0x100 / 4);
        assert_eq!((word0 >> 51) & 0xfff, 16 / 4); // next slot is 16 bytes -> 4 granules away

        let word1 = u64::from_le_bytes(buffer[0x2010..0x2018].try_into().unwrap());
        assert_eq!(word1 & 0x3fff_ffff, 0x200 / 4);
        assert_eq!((word1 >> 51) & 0xfff, 0); // end of chain

        // header: size(4) page_size(2) pointer_format(2) segment_offset(8)
        // max_valid_pointer(4) page_count(2) page_start[1](2)
        assert_eq!(header.len(), 24 + 2);
        let page_size = u16::from_le_bytes(header[4..6].try_into().unwrap());
        assert_eq!(page_size, FIXUP_PAGE_SIZE as u16);
        let segment_offset = u64::from_le_bytes(header[8..16].try_into().unwrap());
        assert_eq!(segment_offset, placement.vm_base);
        let page_start = u16::from_le_bytes(header[22..24].try_into().unwrap());
        assert_eq!(page_start, 0);
    }

    #[test]
    fn chained_fixups_empty_bindings_produce_no_header() {
        let mut buffer = vec![0u8; 0x1000];
        let placement = Placement { vm_base: 0, file_offset: 0, file_size: 0x1000 };
        assert!(link_chained_fixups(&mut buffer, placement, 0, &[]).unwrap().is_empty());
    }
}
