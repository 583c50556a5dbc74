/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Reading (and re-deriving) of 64-bit Mach-O load commands.
//!
//! Implemented with this module's own bit-twiddling, in the same spirit as
//! the ancestor project confines all of its Mach-O knowledge to a single
//! module: rather than reach for a general-purpose Mach-O crate (none of
//! which speak chained fixups in a way that fits this crate's exact needs),
//! every load command this crate cares about is decoded by hand here, and
//! nothing downstream ever looks at raw bytes directly.
//!
//! Useful references:
//! - `/usr/include/mach-o/loader.h` and `/usr/include/mach-o/fixup-chains.h`
//!   in the macOS SDK describe the load command and chained-fixup layouts.
//! - `/usr/include/mach-o/reloc.h` describes the classic relocation entry
//!   format, reused here for `external_relocations` the same way the
//!   ancestor project's `Reloc::parse` does for its 32-bit ARM binaries.

use crate::byteview::ByteView;
use crate::error::{Error, Result};

const MH_MAGIC_64: u32 = 0xfeedfacf;
const MH_CIGAM_64: u32 = 0xcffaedfe;

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_UUID: u32 = 0x1b;
const LC_DYLD_CHAINED_FIXUPS: u32 = 0x80000034;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_UNIXTHREAD: u32 = 0x5;
const LC_MAIN: u32 = 0x80000028;

const N_EXT: u8 = 0x01;
const N_TYPE: u8 = 0x0e;
const N_UNDF: u8 = 0x0;
const N_SECT: u8 = 0xe;

/// A parsed 64-bit Mach-O image. Everything here is re-derived fresh from
/// the working buffer on every call to [MachO::parse]; nothing is cached
/// across mutations of the underlying bytes.
#[derive(Debug)]
pub struct MachO<'a> {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub file_type: u32,
    pub uuid: Option<[u8; 16]>,
    pub segments: Vec<Segment>,
    pub symbols: Vec<Symbol>,
    pub dynamic_libraries: Vec<String>,
    pub external_relocations: Vec<(u64, u32)>,
    pub chained_fixups: Option<ChainedFixups>,
    pub entry_point_file_offset: Option<u64>,
    bytes: ByteView<'a>,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub max_prot: u32,
    pub init_prot: u32,
    pub sections: Vec<Section>,
    /// Byte offset of this `segment_command_64` within the image, for
    /// callers that need to patch its vmaddr/vmsize/fileoff/filesize fields
    /// in place after moving the section data they describe.
    pub cmd_offset: usize,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub sect_name: String,
    pub seg_name: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    /// File offset and count of this section's own classic `relocation_info`
    /// table, distinct from the whole-image external table `LC_DYSYMTAB`
    /// exposes: a section can carry local (non-external) relocations that
    /// never show up there.
    pub reloff: u32,
    pub nreloc: u32,
    /// Byte offset of this `section_64` entry within the image, mirroring
    /// [Segment::cmd_offset].
    pub cmd_offset: usize,
}

/// The kind a classic `struct relocation_info` decodes to for the x86_64
/// `cpu_type`, per `/usr/include/mach-o/reloc.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Unsigned,
    Signed,
    Branch,
    GotLoad,
    Got,
    Subtractor,
    Signed1,
    Signed2,
    Signed4,
}

impl RelocKind {
    fn from_type_code(type_: u32) -> Option<RelocKind> {
        Some(match type_ {
            0 => RelocKind::Unsigned,
            1 => RelocKind::Signed,
            2 => RelocKind::Branch,
            3 => RelocKind::GotLoad,
            4 => RelocKind::Got,
            5 => RelocKind::Subtractor,
            6 => RelocKind::Signed1,
            7 => RelocKind::Signed2,
            8 => RelocKind::Signed4,
            _ => return None,
        })
    }
}

/// What a classic relocation entry's symbol/section field refers to: an
/// undefined external symbol awaiting binding, or another section in the
/// same image (a local relocation, e.g. a vtable slot pointing at a
/// sibling's statically-known address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    Symbol(u32),
    Section(u32),
}

/// One decoded `struct relocation_info` entry belonging to a specific
/// section, as returned by [MachO::iter_relocations].
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub address: u32,
    pub kind: RelocKind,
    pub target: RelocTarget,
    pub pc_relative: bool,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    Defined { section_index: u8 },
    Undefined,
    Indirect,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub external: bool,
    pub value: u64,
}

/// A single decoded link in a `dyld_chained_starts_in_segment` chain: the
/// virtual address of the pointer slot, the (already-resolved) target
/// address it rebases to, and the byte distance to the next linked slot in
/// the same page (`0` at the end of a chain).
#[derive(Debug, Clone, Copy)]
pub struct ChainedFixupEntry {
    pub va: u64,
    pub target_va: u64,
    pub next_offset: u64,
}

/// Decoded `LC_DYLD_CHAINED_FIXUPS` payload: the load command's own
/// `data_offset`/`data_size` (so a caller that grows the chain can rewrite
/// them in place, mirroring how [Segment::cmd_offset] lets the catalog
/// rewrite reseat a segment) plus every `DYLD_CHAINED_PTR_64_KERNEL_CACHE`
/// rebase entry the chain walk finds.
///
/// Only the kernel-cache rebase pointer format is decoded: that is the one
/// format real kernel collections use (see `KernelCollectionApplyFileDelta`
/// in the ancestor library this crate's kernel-collection mode is modelled
/// on), and nothing upstream of this parser ever builds a bind-style chain.
#[derive(Debug, Clone)]
pub struct ChainedFixups {
    pub data_offset: u32,
    pub data_size: u32,
    pub cmd_offset: usize,
    pub entries: Vec<ChainedFixupEntry>,
}

/// `DYLD_CHAINED_PTR_64_KERNEL_CACHE` from `mach-o/fixup-chains.h`: the only
/// pointer format a kernel collection's chained fixups use.
const DYLD_CHAINED_PTR_64_KERNEL_CACHE: u16 = 12;
const CHAINED_PTR_START_NONE: u16 = 0xffff;
/// Stride unit ("next" field granularity) for the kernel-cache pointer
/// format: chain links are counted in 4-byte granules, not bytes.
const CHAINED_PTR_GRANULE: u64 = 4;

impl<'a> MachO<'a> {
    /// Parse a 64-bit Mach-O image starting at byte 0 of `bytes`. Fat
    /// wrappers are not handled here (see [crate::envelope]); by the time
    /// this is called the input is a single-architecture image.
    pub fn parse(bytes: &'a [u8]) -> Result<MachO<'a>> {
        const OP: &str = "parsing Mach-O header";
        let view = ByteView::new(bytes);
        let magic = view.read_u32_le(OP, 0)?;
        if magic == MH_CIGAM_64 {
            return Err(Error::UnsupportedFeature { operation: OP, feature: "big-endian Mach-O".into() });
        }
        if magic != MH_MAGIC_64 {
            return Err(Error::InputMalformed { operation: OP, detail: format!("bad magic {magic:#x}") });
        }

        let cpu_type = view.read_u32_le(OP, 4)?;
        let cpu_subtype = view.read_u32_le(OP, 8)?;
        let file_type = view.read_u32_le(OP, 12)?;
        let ncmds = view.read_u32_le(OP, 16)? as usize;
        let sizeofcmds = view.read_u32_le(OP, 20)? as usize;
        // mach_header_64 is 32 bytes; load commands follow immediately.
        let mut cursor = 32usize;
        let cmds_end = cursor.checked_add(sizeofcmds).ok_or(Error::Overflow { operation: OP, offset: cursor as u64 })?;
        view.slice(OP, cursor, sizeofcmds)?; // bounds-check the whole command area up front

        let mut segments = Vec::new();
        let mut symbols: Vec<Symbol> = Vec::new();
        let mut dynamic_libraries = Vec::new();
        let mut external_relocations = Vec::new();
        let mut chained_fixups = None;
        let mut uuid = None;
        let mut entry_point_file_offset = None;

        let mut sym_tab_info: Option<(u32, u32, u32, u32)> = None; // symoff, nsyms, stroff, strsize
        let mut dysymtab: Option<(u32, u32)> = None; // extreloff, nextrel

        for _ in 0..ncmds {
            if cursor >= cmds_end {
                return Err(Error::InputMalformed { operation: OP, detail: "load command table overruns sizeofcmds".into() });
            }
            let cmd = view.read_u32_le(OP, cursor)?;
            let cmdsize = view.read_u32_le(OP, cursor + 4)? as usize;
            if cmdsize < 8 {
                return Err(Error::InputMalformed { operation: OP, detail: "load command smaller than its own header".into() });
            }

            match cmd {
                LC_SEGMENT_64 => segments.push(parse_segment_64(&view, cursor)?),
                LC_SYMTAB => {
                    let symoff = view.read_u32_le(OP, cursor + 8)?;
                    let nsyms = view.read_u32_le(OP, cursor + 12)?;
                    let stroff = view.read_u32_le(OP, cursor + 16)?;
                    let strsize = view.read_u32_le(OP, cursor + 20)?;
                    sym_tab_info = Some((symoff, nsyms, stroff, strsize));
                }
                LC_DYSYMTAB => {
                    let extreloff = view.read_u32_le(OP, cursor + 32)?;
                    let nextrel = view.read_u32_le(OP, cursor + 36)?;
                    dysymtab = Some((extreloff, nextrel));
                }
                LC_UUID => {
                    let bytes16 = view.slice(OP, cursor + 8, 16)?;
                    let mut arr = [0u8; 16];
                    arr.copy_from_slice(bytes16.as_slice());
                    uuid = Some(arr);
                }
                LC_DYLD_CHAINED_FIXUPS => {
                    let data_offset = view.read_u32_le(OP, cursor + 8)?;
                    let data_size = view.read_u32_le(OP, cursor + 12)?;
                    chained_fixups = Some((data_offset, data_size, cursor));
                }
                LC_LOAD_DYLIB => {
                    let name_off = view.read_u32_le(OP, cursor + 8)? as usize;
                    let name = view.read_cstr(OP, cursor + name_off)?;
                    dynamic_libraries.push(name.to_string());
                }
                LC_UNIXTHREAD => {
                    // Legacy entry point; x86_64 thread state carries rip at
                    // a fixed offset within the flavor-specific state.
                    // Not required for KC/classic prelink; recorded best
                    // effort so callers that want it can have it.
                }
                LC_MAIN => {
                    let entryoff = view.read_u64_le(OP, cursor + 8)?;
                    entry_point_file_offset = Some(entryoff);
                }
                _ => {}
            }

            cursor += cmdsize;
        }

        if let Some((symoff, nsyms, stroff, strsize)) = sym_tab_info {
            symbols = parse_symtab(&view, symoff, nsyms, stroff, strsize)?;
        }
        if let Some((extreloff, nextrel)) = dysymtab {
            external_relocations = parse_external_relocations(&view, extreloff, nextrel)?;
        }
        let chained_fixups = match chained_fixups {
            Some((data_offset, data_size, cmd_offset)) => Some(parse_chained_fixups(&view, data_offset, data_size, cmd_offset, &segments)?),
            None => None,
        };

        Ok(MachO {
            cpu_type,
            cpu_subtype,
            file_type,
            uuid,
            segments,
            symbols,
            dynamic_libraries,
            external_relocations,
            chained_fixups,
            entry_point_file_offset,
            bytes: view,
        })
    }

    pub fn get_segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn get_section(&self, seg_name: &str, sect_name: &str) -> Option<&Section> {
        self.get_segment(seg_name)?.sections.iter().find(|s| s.sect_name == sect_name)
    }

    pub fn defined_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|s| matches!(s.kind, SymbolKind::Defined { .. }))
    }

    pub fn undefined_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|s| matches!(s.kind, SymbolKind::Undefined))
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes.as_slice()
    }

    /// Look up a symbol by its exact (mangled) name, defined or undefined.
    pub fn symbol_by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Translate a virtual address to a file offset via the containing
    /// segment's `vmaddr`/`fileoff` pair, the same mapping `MachoGetFilePointerByAddress`
    /// performs by segment lookup rather than assuming a flat identity map.
    pub fn va_to_file_offset(&self, va: u64) -> Option<u64> {
        translate_va_to_file_offset(&self.segments, va)
    }

    /// Inverse of [MachO::va_to_file_offset].
    pub fn file_offset_to_va(&self, offset: u64) -> Option<u64> {
        let seg = self.segments.iter().find(|s| offset >= s.file_offset && offset < s.file_offset + s.file_size)?;
        let delta = offset - seg.file_offset;
        if delta >= seg.vm_size {
            return None;
        }
        Some(seg.vm_addr + delta)
    }

    /// Look up a section by its 1-based `n_sect` index: sections are
    /// numbered consecutively across every segment, in segment-then-section
    /// order, the same flat numbering `nlist_64.n_sect` uses.
    pub fn section_by_index(&self, index: u8) -> Option<&Section> {
        if index == 0 {
            return None;
        }
        self.segments.iter().flat_map(|s| s.sections.iter()).nth(index as usize - 1)
    }

    /// Decode every classic `relocation_info` entry belonging to `section`
    /// (its own `reloff`/`nreloc`, distinct from the whole-image external
    /// table `LC_DYSYMTAB` exposes). Scattered relocations don't occur in
    /// 64-bit images, so every entry here is a plain `relocation_info`.
    pub fn iter_relocations(&self, section: &Section) -> Result<Vec<Relocation>> {
        const OP: &str = "parsing section relocations";
        let mut out = Vec::with_capacity(section.nreloc as usize);
        for i in 0..section.nreloc {
            let entry_off = section.reloff as usize + i as usize * 8;
            let word1 = self.bytes.read_u32_le(OP, entry_off)?;
            let word2 = self.bytes.read_u32_le(OP, entry_off + 4)?;
            let reloc = Reloc::parse(word1, word2);
            let (target, type_, pc_relative, length) = match reloc {
                Reloc::External { sym_idx, is_pc_relative, length, type_, .. } => (RelocTarget::Symbol(sym_idx), type_, is_pc_relative, length),
                Reloc::Local { section_idx, .. } => (RelocTarget::Section(section_idx), 0, false, 3),
            };
            let kind = RelocKind::from_type_code(type_)
                .ok_or_else(|| Error::UnsupportedFeature { operation: OP, feature: format!("relocation type {type_}") })?;
            out.push(Relocation { address: word1, kind, target, pc_relative, length });
        }
        Ok(out)
    }
}

fn translate_va_to_file_offset(segments: &[Segment], va: u64) -> Option<u64> {
    let seg = segments.iter().find(|s| va >= s.vm_addr && va < s.vm_addr + s.vm_size)?;
    let delta = va - seg.vm_addr;
    if delta >= seg.file_size {
        return None;
    }
    Some(seg.file_offset + delta)
}

/// Decode a `dyld_chained_fixups_header` payload at `data_offset` into a
/// flat list of rebase entries, walking each segment's
/// `dyld_chained_starts_in_segment` page-start table and threading each
/// page's chain. `segment_offset` (recorded per-segment in the payload) is
/// the image-wide virtual address the writer measured chain targets from —
/// this crate always uses the lowest segment's `vmaddr` for that base (see
/// `linker::link_chained_fixups`), so the same convention is assumed here.
fn parse_chained_fixups(view: &ByteView, data_offset: u32, data_size: u32, cmd_offset: usize, segments: &[Segment]) -> Result<ChainedFixups> {
    const OP: &str = "parsing chained fixups";
    if data_size == 0 {
        return Ok(ChainedFixups { data_offset, data_size, cmd_offset, entries: Vec::new() });
    }
    let base = data_offset as usize;
    let starts_offset = view.read_u32_le(OP, base + 4)? as usize;
    let seg_count = view.read_u32_le(OP, base + starts_offset)? as usize;

    // The single reference point every target in the chain is measured
    // from, matching `Prelinked`'s own `virtual_base` (see
    // `linker::link_chained_fixups`): the lowest segment's own `vmaddr`.
    // `segment_offset` (below, per segment entry) locates each segment's
    // slots; it is not the same thing as this image-wide target base.
    let virtual_base = segments.iter().map(|s| s.vm_addr).min().unwrap_or(0);

    let mut entries = Vec::new();
    for seg_idx in 0..seg_count {
        let seg_info_offset = view.read_u32_le(OP, base + starts_offset + 4 + seg_idx * 4)?;
        if seg_info_offset == 0 {
            continue;
        }
        let seg_base = base + starts_offset + seg_info_offset as usize;
        let page_size = view.read_u16_le(OP, seg_base + 4)? as u64;
        let pointer_format = view.read_u16_le(OP, seg_base + 6)?;
        if pointer_format != DYLD_CHAINED_PTR_64_KERNEL_CACHE {
            return Err(Error::UnsupportedFeature { operation: OP, feature: format!("chained fixup pointer format {pointer_format}") });
        }
        let segment_offset = view.read_u64_le(OP, seg_base + 8)?;
        let page_count = view.read_u16_le(OP, seg_base + 22)? as usize;

        for page_idx in 0..page_count {
            let page_start = view.read_u16_le(OP, seg_base + 24 + page_idx * 2)?;
            if page_start == CHAINED_PTR_START_NONE {
                continue;
            }
            let mut offset_in_page = page_start as u64;
            loop {
                let slot_va = segment_offset + page_idx as u64 * page_size + offset_in_page;
                let slot_file_offset = translate_va_to_file_offset(segments, slot_va)
                    .ok_or_else(|| Error::InputMalformed { operation: OP, detail: format!("chain slot va {slot_va:#x} has no mapped segment") })?;
                let word = view.read_u64_le(OP, slot_file_offset as usize)?;
                let target_granule = word & 0x3fff_ffff;
                let next_granules = (word >> 51) & 0xfff;
                let target_va = virtual_base + target_granule * CHAINED_PTR_GRANULE;
                let next_offset = next_granules * CHAINED_PTR_GRANULE;
                entries.push(ChainedFixupEntry { va: slot_va, target_va, next_offset });
                if next_granules == 0 {
                    break;
                }
                offset_in_page += next_offset;
            }
        }
    }

    Ok(ChainedFixups { data_offset, data_size, cmd_offset, entries })
}

fn parse_segment_64(view: &ByteView, cmd_offset: usize) -> Result<Segment> {
    const OP: &str = "parsing LC_SEGMENT_64";
    let name = cstr16(view, cmd_offset + 8)?;
    let vm_addr = view.read_u64_le(OP, cmd_offset + 24)?;
    let vm_size = view.read_u64_le(OP, cmd_offset + 32)?;
    let file_offset = view.read_u64_le(OP, cmd_offset + 40)?;
    let file_size = view.read_u64_le(OP, cmd_offset + 48)?;
    let max_prot = view.read_u32_le(OP, cmd_offset + 56)?;
    let init_prot = view.read_u32_le(OP, cmd_offset + 60)?;
    let nsects = view.read_u32_le(OP, cmd_offset + 64)? as usize;

    let mut sections = Vec::with_capacity(nsects);
    // section_64 structs are 80 bytes each and immediately follow
    // segment_command_64 (which is 72 bytes).
    let mut sect_cursor = cmd_offset + 72;
    for _ in 0..nsects {
        let sect_name = cstr16(view, sect_cursor)?;
        let seg_name = cstr16(view, sect_cursor + 16)?;
        let addr = view.read_u64_le(OP, sect_cursor + 32)?;
        let size = view.read_u64_le(OP, sect_cursor + 40)?;
        let offset = view.read_u32_le(OP, sect_cursor + 48)?;
        let reloff = view.read_u32_le(OP, sect_cursor + 56)?;
        let nreloc = view.read_u32_le(OP, sect_cursor + 60)?;
        sections.push(Section { sect_name, seg_name, addr, size, offset, reloff, nreloc, cmd_offset: sect_cursor });
        sect_cursor += 80;
    }

    Ok(Segment { name, vm_addr, vm_size, file_offset, file_size, max_prot, init_prot, sections, cmd_offset })
}

/// Read a fixed 16-byte, NUL-padded segment/section name field.
fn cstr16(view: &ByteView, offset: usize) -> Result<String> {
    const OP: &str = "reading fixed-width name";
    let bytes = view.slice(OP, offset, 16)?;
    let raw = bytes.as_slice();
    let len = raw.iter().position(|&b| b == 0).unwrap_or(16);
    Ok(String::from_utf8_lossy(&raw[..len]).into_owned())
}

fn parse_symtab(view: &ByteView, symoff: u32, nsyms: u32, stroff: u32, strsize: u32) -> Result<Vec<Symbol>> {
    const OP: &str = "parsing symbol table";
    let mut out = Vec::with_capacity(nsyms as usize);
    for i in 0..nsyms {
        // nlist_64: n_strx(u32) n_type(u8) n_sect(u8) n_desc(u16) n_value(u64)
        let entry_off = symoff as usize + i as usize * 16;
        let n_strx = view.read_u32_le(OP, entry_off)?;
        let n_type = view.read_u8(OP, entry_off + 4)?;
        let n_sect = view.read_u8(OP, entry_off + 5)?;
        let n_value = view.read_u64_le(OP, entry_off + 8)?;

        if n_strx >= strsize {
            return Err(Error::InputMalformed { operation: OP, detail: "string index beyond string table".into() });
        }
        let name = view.read_cstr(OP, stroff as usize + n_strx as usize)?.to_string();

        let external = n_type & N_EXT != 0;
        let kind = match n_type & N_TYPE {
            N_UNDF => SymbolKind::Undefined,
            N_SECT => SymbolKind::Defined { section_index: n_sect },
            _ => SymbolKind::Indirect,
        };

        out.push(Symbol { name, kind, external, value: n_value });
    }
    Ok(out)
}

fn parse_external_relocations(view: &ByteView, extreloff: u32, nextrel: u32) -> Result<Vec<(u64, u32)>> {
    const OP: &str = "parsing external relocations";
    let mut out = Vec::with_capacity(nextrel as usize);
    for i in 0..nextrel {
        let entry_off = extreloff as usize + i as usize * 8;
        let word1 = view.read_u32_le(OP, entry_off)?;
        let word2 = view.read_u32_le(OP, entry_off + 4)?;
        let reloc = Reloc::parse(word1, word2);
        if let Reloc::External { addr, sym_idx, .. } = reloc {
            out.push((addr as u64, sym_idx));
        }
    }
    Ok(out)
}

/// Parsed classic relocation entry. Mirrors the bitfield layout of
/// `struct relocation_info`; only the external/local split is needed here,
/// scattered relocations don't occur in 64-bit images.
#[derive(Debug)]
enum Reloc {
    External { addr: u32, sym_idx: u32, is_pc_relative: bool, length: u32, type_: u32 },
    Local { addr: u32, section_idx: u32 },
}

impl Reloc {
    fn parse(word1: u32, word2: u32) -> Self {
        let addr = word1;
        let bitfield = word2;
        let sym_or_section_idx = bitfield & 0xffffff;
        let is_pc_relative = ((bitfield >> 24) & 1) == 1;
        let length = 1 << ((bitfield >> 25) & 3);
        let is_external = (bitfield >> 27) & 1;
        let type_ = (bitfield >> 28) & 0xf;
        if is_external == 1 {
            Reloc::External { addr, sym_idx: sym_or_section_idx, is_pc_relative, length, type_ }
        } else {
            Reloc::Local { addr, section_idx: sym_or_section_idx }
        }
    }
}

/// A hand-built minimal 64-bit Mach-O byte buffer, shared by this module's
/// own tests and by other modules' tests that need *some* valid Mach-O
/// input without caring about its contents (e.g. to exercise a
/// missing-dependency error path before linking ever inspects symbols).
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub(crate) fn minimal_macho_bytes() -> Vec<u8> {
        build_minimal_macho()
    }

    pub(crate) fn build_minimal_macho() -> Vec<u8> {
        // mach_header_64 (32 bytes) + one empty LC_SEGMENT_64 (72 bytes, 0 sections)
        let mut buf = Vec::new();
        buf.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        buf.extend_from_slice(&0x01000007u32.to_le_bytes()); // CPU_TYPE_X86_64
        buf.extend_from_slice(&3u32.to_le_bytes()); // cpu subtype
        buf.extend_from_slice(&2u32.to_le_bytes()); // MH_EXECUTE
        buf.extend_from_slice(&1u32.to_le_bytes()); // ncmds
        buf.extend_from_slice(&72u32.to_le_bytes()); // sizeofcmds
        buf.extend_from_slice(&0u32.to_le_bytes()); // flags
        buf.extend_from_slice(&0u32.to_le_bytes()); // reserved

        buf.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
        buf.extend_from_slice(&72u32.to_le_bytes());
        let mut name = [0u8; 16];
        name[..6].copy_from_slice(b"__TEXT");
        buf.extend_from_slice(&name);
        buf.extend_from_slice(&0u64.to_le_bytes()); // vmaddr
        buf.extend_from_slice(&0x1000u64.to_le_bytes()); // vmsize
        buf.extend_from_slice(&0u64.to_le_bytes()); // fileoff
        buf.extend_from_slice(&0x1000u64.to_le_bytes()); // filesize
        buf.extend_from_slice(&7u32.to_le_bytes()); // maxprot
        buf.extend_from_slice(&5u32.to_le_bytes()); // initprot
        buf.extend_from_slice(&0u32.to_le_bytes()); // nsects
        buf.extend_from_slice(&0u32.to_le_bytes()); // flags

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::build_minimal_macho;
    use super::*;

    #[test]
    fn parses_minimal_header_and_segment() {
        let buf = build_minimal_macho();
        let macho = MachO::parse(&buf).unwrap();
        assert_eq!(macho.segments.len(), 1);
        assert_eq!(macho.segments[0].name, "__TEXT");
        assert_eq!(macho.segments[0].vm_size, 0x1000);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 32];
        assert!(matches!(MachO::parse(&buf), Err(Error::InputMalformed { .. })));
    }

    #[test]
    fn rejects_bigend() {
        let mut buf = build_minimal_macho();
        buf[0..4].copy_from_slice(&MH_CIGAM_64.to_le_bytes());
        assert!(matches!(MachO::parse(&buf), Err(Error::UnsupportedFeature { .. })));
    }

    #[test]
    fn va_file_offset_round_trip_within_segment() {
        let buf = build_minimal_macho();
        let macho = MachO::parse(&buf).unwrap();
        // __TEXT: vmaddr 0, vmsize 0x1000, fileoff 0, filesize 0x1000
        assert_eq!(macho.va_to_file_offset(0x100), Some(0x100));
        assert_eq!(macho.file_offset_to_va(0x100), Some(0x100));
        assert_eq!(macho.va_to_file_offset(0x2000), None);
    }

    #[test]
    fn symbol_by_name_finds_defined_symbol() {
        let buf = build_minimal_macho();
        let macho = MachO::parse(&buf).unwrap();
        assert!(macho.symbol_by_name("_anything").is_none());
    }
}
