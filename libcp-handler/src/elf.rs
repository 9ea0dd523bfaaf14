// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! Streaming ELF64 core parser. Walks the program header table to find the
//! `PT_NOTE` segment, extracts `NT_PRSTATUS` registers and the `NT_FILE`
//! region table, then mirrors the remainder of the core to the archive via
//! [`crate::archive::Archive::read_all`]. Every offset used here is a
//! kernel-ABI constant (glibc's `struct elf_prstatus` / `user_regs_struct`
//! layout), not a choice made by this crate — they must not drift.

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("the core parser only supports x86_64 and aarch64 targets");

use crate::archive::Archive;
use libcp_common::error::CrashpipeError;
use thiserror::Error;

const PT_NOTE: u32 = 4;
const PT_LOAD: u32 = 1;
const NT_PRSTATUS: u32 = 1;
/// `linux/elfcore.h`: note type for the `NT_FILE` mapped-file table.
const NT_FILE: u32 = 0x46494c45;

/// Offset of `pr_reg` inside `struct elf_prstatus` on a 64-bit Linux target:
/// `elf_siginfo`(12) padded to 16, `pr_sigpend`/`pr_sighold`(16),
/// `pr_pid..pr_sid`(16), four `timeval`s (64) = 112 bytes before the
/// register set begins. Identical on x86_64 and aarch64.
const PR_REG_OFFSET: usize = 112;

#[cfg(target_arch = "x86_64")]
mod reg_offsets {
    // Index into `user_regs_struct` (each slot 8 bytes).
    pub const RBP_INDEX: usize = 4;
    pub const RIP_INDEX: usize = 16;

    /// Highest register slot index this module reads, for bounds checks.
    pub const fn max_index() -> usize {
        if RBP_INDEX > RIP_INDEX { RBP_INDEX } else { RIP_INDEX }
    }
}

#[cfg(target_arch = "aarch64")]
mod reg_offsets {
    // `struct user_pt_regs`: regs[31], sp, pc, pstate (each slot 8 bytes).
    pub const LR_INDEX: usize = 30;
    pub const PC_INDEX: usize = 31 + 1; // past regs[] and sp

    /// Highest register slot index this module reads, for bounds checks.
    pub const fn max_index() -> usize {
        if LR_INDEX > PC_INDEX { LR_INDEX } else { PC_INDEX }
    }
}

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("malformed ELF header or program header table")]
    MalformedElf,
    #[error("note walk overran the note segment")]
    NoteParseFailed,
    #[error("no PT_NOTE program header present")]
    NoNotes,
    #[error("no NT_FILE region contains address 0x{0:x}")]
    RegionNotFound(u64),
    #[error(transparent)]
    Io(#[from] CrashpipeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    #[cfg(target_arch = "x86_64")]
    pub rip: u64,
    #[cfg(target_arch = "x86_64")]
    pub rbp: u64,
    #[cfg(target_arch = "aarch64")]
    pub pc: u64,
    #[cfg(target_arch = "aarch64")]
    pub lr: u64,
}

impl Registers {
    /// The instruction pointer used for fingerprinting: `rip` on x86-64,
    /// `pc` on aarch64.
    pub fn ip(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        return self.rip;
        #[cfg(target_arch = "aarch64")]
        return self.pc;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtFileRegion {
    pub vaddr_start: u64,
    pub vaddr_end: u64,
    pub file_offset_pages: u64,
    pub module_name: String,
}

#[derive(Debug, Clone)]
struct ProgramHeader {
    p_type: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NtFileTable {
    pub elf_vma_page_size: u64,
    pub regions: Vec<NtFileRegion>,
}

impl NtFileTable {
    /// Linear scan for the region containing `addr`, as the original does.
    pub fn find(&self, addr: u64) -> Option<&NtFileRegion> {
        self.regions
            .iter()
            .find(|r| addr >= r.vaddr_start && addr < r.vaddr_end)
    }
}

pub struct ParsedCore {
    pub registers: Registers,
    pub nt_file: NtFileTable,
    program_headers: Vec<ProgramHeader>,
}

impl ParsedCore {
    /// Resolves a virtual address to its owning `PT_LOAD` segment, returning
    /// the corresponding file offset (`p_offset + (addr - p_vaddr)`).
    pub fn vaddr_to_file_offset(&self, addr: u64) -> Option<u64> {
        self.program_headers
            .iter()
            .find(|p| p.p_type == PT_LOAD && addr >= p.p_vaddr && addr < p.p_vaddr + p.p_memsz)
            .map(|p| p.p_offset + (addr - p.p_vaddr))
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().expect("4-byte slice"))
}
fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().expect("8-byte slice"))
}

const ELF_EHDR_SIZE: usize = 64;
const ELF_PHDR_SIZE: usize = 56;

/// Reads the ELF64 header, the program header table, the `PT_NOTE` segment,
/// and extracts registers + the `NT_FILE` table. Leaves the archive
/// positioned right after the note segment; the caller is responsible for
/// `read_all()`-ing the remainder.
pub fn parse(archive: &mut Archive) -> Result<ParsedCore, ElfError> {
    let mut ehdr = [0u8; ELF_EHDR_SIZE];
    archive.read(&mut ehdr)?;
    if &ehdr[0..4] != b"\x7FELF" {
        return Err(ElfError::MalformedElf);
    }
    let e_phoff = read_u64(&ehdr, 0x20);
    let e_phnum = read_u16(&ehdr, 0x38) as usize;

    if e_phnum == 0 {
        return Err(ElfError::NoNotes);
    }

    archive.move_to_offset(e_phoff).map_err(ElfError::Io)?;
    let mut phdr_bytes = vec![0u8; ELF_PHDR_SIZE * e_phnum];
    archive.read(&mut phdr_bytes)?;

    let mut program_headers = Vec::with_capacity(e_phnum);
    for i in 0..e_phnum {
        let base = i * ELF_PHDR_SIZE;
        program_headers.push(ProgramHeader {
            p_type: read_u32(&phdr_bytes, base),
            p_offset: read_u64(&phdr_bytes, base + 8),
            p_vaddr: read_u64(&phdr_bytes, base + 16),
            p_filesz: read_u64(&phdr_bytes, base + 32),
            p_memsz: read_u64(&phdr_bytes, base + 40),
        });
    }

    let note_hdr = program_headers
        .iter()
        .find(|p| p.p_type == PT_NOTE)
        .cloned()
        .ok_or(ElfError::NoNotes)?;

    archive
        .move_to_offset(note_hdr.p_offset)
        .map_err(ElfError::Io)?;
    let mut notes = vec![0u8; note_hdr.p_filesz as usize];
    archive.read(&mut notes)?;

    let registers = walk_prstatus(&notes).ok_or(ElfError::NoteParseFailed)?;
    let nt_file = walk_nt_file(&notes)?;

    Ok(ParsedCore {
        registers,
        nt_file,
        program_headers,
    })
}

fn align4(n: u32) -> u32 {
    (n + 3) & !3
}

/// One note's total on-wire size: the 12-byte `{n_namesz, n_descsz, n_type}`
/// header, the name padded to 4 bytes, and the descriptor **unpadded** (this
/// layout's one deviation from the generic ELF note format).
fn note_total_size(n_namesz: u32, n_descsz: u32) -> usize {
    12 + align4(n_namesz) as usize + n_descsz as usize
}

fn walk_prstatus(notes: &[u8]) -> Option<Registers> {
    let mut offset = 0usize;
    while offset + 12 <= notes.len() {
        let n_namesz = read_u32(notes, offset);
        let n_descsz = read_u32(notes, offset + 4);
        let n_type = read_u32(notes, offset + 8);
        let desc_start = offset + 12 + align4(n_namesz) as usize;

        let pr_reg_end = desc_start + PR_REG_OFFSET + reg_offsets::max_index() * 8 + 8;
        if n_type == NT_PRSTATUS && pr_reg_end <= notes.len() {
            let pr_reg = desc_start + PR_REG_OFFSET;
            #[cfg(target_arch = "x86_64")]
            {
                let rbp = read_u64(notes, pr_reg + reg_offsets::RBP_INDEX * 8);
                let rip = read_u64(notes, pr_reg + reg_offsets::RIP_INDEX * 8);
                return Some(Registers { rip, rbp });
            }
            #[cfg(target_arch = "aarch64")]
            {
                let lr = read_u64(notes, pr_reg + reg_offsets::LR_INDEX * 8);
                let pc = read_u64(notes, pr_reg + reg_offsets::PC_INDEX * 8);
                return Some(Registers { pc, lr });
            }
        }

        offset += note_total_size(n_namesz, n_descsz);
    }
    None
}

fn walk_nt_file(notes: &[u8]) -> Result<NtFileTable, ElfError> {
    let mut offset = 0usize;
    while offset + 12 <= notes.len() {
        let n_namesz = read_u32(notes, offset);
        let n_descsz = read_u32(notes, offset + 4);
        let n_type = read_u32(notes, offset + 8);
        let desc_start = offset + 12 + align4(n_namesz) as usize;
        let desc_end = desc_start + n_descsz as usize;

        if n_type == NT_FILE {
            if desc_end > notes.len() || desc_start + 16 > notes.len() {
                return Err(ElfError::NoteParseFailed);
            }
            let num_regions = read_u64(notes, desc_start);
            let page_size = read_u64(notes, desc_start + 8);
            let mut pos = desc_start + 16;

            let mut regions = Vec::with_capacity(num_regions as usize);
            for _ in 0..num_regions {
                if pos + 24 > notes.len() {
                    return Err(ElfError::NoteParseFailed);
                }
                let vaddr_start = read_u64(notes, pos);
                let vaddr_end = read_u64(notes, pos + 8);
                let file_offset_pages = read_u64(notes, pos + 16);
                pos += 24;
                regions.push(NtFileRegion {
                    vaddr_start,
                    vaddr_end,
                    file_offset_pages,
                    module_name: String::new(),
                });
            }

            let strtab_start = pos;
            let mut cursor = strtab_start;
            for region in regions.iter_mut() {
                let end = notes[cursor..desc_end]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|p| cursor + p)
                    .unwrap_or(desc_end);
                region.module_name =
                    String::from_utf8_lossy(&notes[cursor..end]).into_owned();
                cursor = (end + 1).min(desc_end);
            }

            return Ok(NtFileTable {
                elf_vma_page_size: page_size,
                regions,
            });
        }

        offset += note_total_size(n_namesz, n_descsz);
    }
    // No NT_FILE note is not fatal: spec.md §8 boundary case (zero-length
    // region table, fingerprint falls back to register-only form).
    Ok(NtFileTable::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use std::io::Cursor;

    /// Builds a minimal synthetic ELF64 core: one `PT_NOTE` segment holding
    /// an `NT_PRSTATUS` note (with the real `elf_prstatus` byte layout) and
    /// an `NT_FILE` note with a single region, followed by padding bytes
    /// standing in for the rest of the core image.
    fn build_synthetic_core(ip: u64, bp_or_lr: u64) -> Vec<u8> {
        let mut prstatus_desc = vec![0u8; PR_REG_OFFSET + 256];
        #[cfg(target_arch = "x86_64")]
        {
            prstatus_desc[PR_REG_OFFSET + reg_offsets::RBP_INDEX * 8..][..8]
                .copy_from_slice(&bp_or_lr.to_le_bytes());
            prstatus_desc[PR_REG_OFFSET + reg_offsets::RIP_INDEX * 8..][..8]
                .copy_from_slice(&ip.to_le_bytes());
        }
        #[cfg(target_arch = "aarch64")]
        {
            prstatus_desc[PR_REG_OFFSET + reg_offsets::LR_INDEX * 8..][..8]
                .copy_from_slice(&bp_or_lr.to_le_bytes());
            prstatus_desc[PR_REG_OFFSET + reg_offsets::PC_INDEX * 8..][..8]
                .copy_from_slice(&ip.to_le_bytes());
        }

        let mut prstatus_note = Vec::new();
        prstatus_note.extend_from_slice(&4u32.to_le_bytes()); // n_namesz
        prstatus_note.extend_from_slice(&(prstatus_desc.len() as u32).to_le_bytes());
        prstatus_note.extend_from_slice(&NT_PRSTATUS.to_le_bytes());
        prstatus_note.extend_from_slice(b"CORE"); // name, already 4-aligned
        prstatus_note.extend_from_slice(&prstatus_desc);

        let name = b"crashy\0\0"; // 8 bytes, one region's module name (nul-terminated)
        let mut nt_file_desc = Vec::new();
        nt_file_desc.extend_from_slice(&1u64.to_le_bytes()); // num_regions
        nt_file_desc.extend_from_slice(&4096u64.to_le_bytes()); // page_size
        nt_file_desc.extend_from_slice(&0x400000u64.to_le_bytes()); // vaddr_start
        nt_file_desc.extend_from_slice(&0x410000u64.to_le_bytes()); // vaddr_end
        nt_file_desc.extend_from_slice(&0u64.to_le_bytes()); // file_offset_pages
        nt_file_desc.extend_from_slice(name);

        let mut nt_file_note = Vec::new();
        nt_file_note.extend_from_slice(&4u32.to_le_bytes());
        nt_file_note.extend_from_slice(&(nt_file_desc.len() as u32).to_le_bytes());
        nt_file_note.extend_from_slice(&NT_FILE.to_le_bytes());
        nt_file_note.extend_from_slice(b"CORE");
        nt_file_note.extend_from_slice(&nt_file_desc);

        let mut notes = prstatus_note;
        notes.extend_from_slice(&nt_file_note);

        let phdr_offset = ELF_EHDR_SIZE as u64;
        let note_offset = phdr_offset + ELF_PHDR_SIZE as u64;

        let mut core = vec![0u8; ELF_EHDR_SIZE];
        core[0..4].copy_from_slice(b"\x7FELF");
        core[0x20..0x28].copy_from_slice(&phdr_offset.to_le_bytes());
        core[0x38..0x3A].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        let mut phdr = vec![0u8; ELF_PHDR_SIZE];
        phdr[0..4].copy_from_slice(&PT_NOTE.to_le_bytes());
        phdr[8..16].copy_from_slice(&note_offset.to_le_bytes());
        phdr[32..40].copy_from_slice(&(notes.len() as u64).to_le_bytes());
        core.extend_from_slice(&phdr);
        core.extend_from_slice(&notes);
        core.extend_from_slice(&[0xAAu8; 256]); // trailing core bytes

        core
    }

    fn parse_synthetic(core: Vec<u8>) -> ParsedCore {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::create(&dir.path().join("t.cdh.tar.gz")).unwrap();
        archive.stream_open_reader(Box::new(Cursor::new(core)));
        parse(&mut archive).unwrap()
    }

    #[test]
    fn extracts_registers_and_single_nt_file_region() {
        let core = build_synthetic_core(0x401234, 0x7ffffff0);
        let parsed = parse_synthetic(core);
        assert_eq!(parsed.registers.ip(), 0x401234);
        assert_eq!(parsed.nt_file.elf_vma_page_size, 4096);
        let region = parsed.nt_file.find(0x401234).unwrap();
        assert_eq!(region.module_name, "crashy");
        assert_eq!(region.vaddr_start, 0x400000);
    }

    #[test]
    fn zero_phnum_fails_fast_with_no_notes() {
        let mut core = vec![0u8; ELF_EHDR_SIZE];
        core[0..4].copy_from_slice(b"\x7FELF");
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::create(&dir.path().join("t.cdh.tar.gz")).unwrap();
        archive.stream_open_reader(Box::new(Cursor::new(core)));
        assert!(matches!(parse(&mut archive), Err(ElfError::NoNotes)));
    }

    #[test]
    fn address_outside_every_region_is_not_found() {
        let core = build_synthetic_core(0x401234, 0x7ffffff0);
        let parsed = parse_synthetic(core);
        assert!(parsed.nt_file.find(0x999999).is_none());
    }

    #[test]
    fn bounds_check_covers_the_full_register_read_extent_not_just_its_start() {
        // A `notes` buffer that ends just past `desc_start + PR_REG_OFFSET`
        // must not panic inside `read_u64` when the register slots
        // themselves fall beyond the buffer.
        let core = build_synthetic_core(0x401234, 0x7ffffff0);
        let truncate_at = {
            let phdr_offset = ELF_EHDR_SIZE;
            let note_offset = phdr_offset + ELF_PHDR_SIZE;
            note_offset + 12 + 4 /* "CORE" */ + PR_REG_OFFSET + 4
        };
        let mut truncated = core.clone();
        truncated.truncate(truncate_at.min(core.len()));
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::create(&dir.path().join("t.cdh.tar.gz")).unwrap();
        archive.stream_open_reader(Box::new(Cursor::new(truncated)));
        assert!(matches!(parse(&mut archive), Err(ElfError::NoteParseFailed)));
    }

    /// Builds the same note layout as [`build_synthetic_core`] plus a second
    /// `PT_LOAD` program header covering the stack slot at `rbp + 8`, holding
    /// a return address inside the `NT_FILE` region — the shape `spec.md`'s
    /// "happy path on x86-64" scenario describes end to end. Built from
    /// scratch rather than by editing `build_synthetic_core`'s output, since
    /// inserting a second program header after the fact would shift the
    /// note data out from under the offsets already baked into the first.
    #[cfg(target_arch = "x86_64")]
    fn build_synthetic_core_with_return_address(ip: u64, rbp: u64, return_address: u64) -> Vec<u8> {
        let mut prstatus_desc = vec![0u8; PR_REG_OFFSET + 256];
        prstatus_desc[PR_REG_OFFSET + reg_offsets::RBP_INDEX * 8..][..8].copy_from_slice(&rbp.to_le_bytes());
        prstatus_desc[PR_REG_OFFSET + reg_offsets::RIP_INDEX * 8..][..8].copy_from_slice(&ip.to_le_bytes());

        let mut prstatus_note = Vec::new();
        prstatus_note.extend_from_slice(&4u32.to_le_bytes());
        prstatus_note.extend_from_slice(&(prstatus_desc.len() as u32).to_le_bytes());
        prstatus_note.extend_from_slice(&NT_PRSTATUS.to_le_bytes());
        prstatus_note.extend_from_slice(b"CORE");
        prstatus_note.extend_from_slice(&prstatus_desc);

        let name = b"crashy\0\0";
        let mut nt_file_desc = Vec::new();
        nt_file_desc.extend_from_slice(&1u64.to_le_bytes());
        nt_file_desc.extend_from_slice(&4096u64.to_le_bytes());
        nt_file_desc.extend_from_slice(&0x400000u64.to_le_bytes());
        nt_file_desc.extend_from_slice(&0x410000u64.to_le_bytes());
        nt_file_desc.extend_from_slice(&0u64.to_le_bytes());
        nt_file_desc.extend_from_slice(name);

        let mut nt_file_note = Vec::new();
        nt_file_note.extend_from_slice(&4u32.to_le_bytes());
        nt_file_note.extend_from_slice(&(nt_file_desc.len() as u32).to_le_bytes());
        nt_file_note.extend_from_slice(&NT_FILE.to_le_bytes());
        nt_file_note.extend_from_slice(b"CORE");
        nt_file_note.extend_from_slice(&nt_file_desc);

        let mut notes = prstatus_note;
        notes.extend_from_slice(&nt_file_note);

        let phdr_offset = ELF_EHDR_SIZE as u64;
        let note_offset = phdr_offset + 2 * ELF_PHDR_SIZE as u64;
        let load_vaddr = rbp & !0xfffu64;
        let load_memsz = 0x2000u64;
        let load_offset = note_offset + notes.len() as u64;
        let mut load_data = vec![0u8; load_memsz as usize];
        let slot = (rbp + 8 - load_vaddr) as usize;
        load_data[slot..slot + 8].copy_from_slice(&return_address.to_le_bytes());

        let mut core = vec![0u8; ELF_EHDR_SIZE];
        core[0..4].copy_from_slice(b"\x7FELF");
        core[0x20..0x28].copy_from_slice(&phdr_offset.to_le_bytes());
        core[0x38..0x3A].copy_from_slice(&2u16.to_le_bytes()); // e_phnum

        let mut note_phdr = vec![0u8; ELF_PHDR_SIZE];
        note_phdr[0..4].copy_from_slice(&PT_NOTE.to_le_bytes());
        note_phdr[8..16].copy_from_slice(&note_offset.to_le_bytes());
        note_phdr[32..40].copy_from_slice(&(notes.len() as u64).to_le_bytes());

        let mut load_phdr = vec![0u8; ELF_PHDR_SIZE];
        load_phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        load_phdr[8..16].copy_from_slice(&load_offset.to_le_bytes());
        load_phdr[16..24].copy_from_slice(&load_vaddr.to_le_bytes());
        load_phdr[32..40].copy_from_slice(&load_memsz.to_le_bytes());
        load_phdr[40..48].copy_from_slice(&load_memsz.to_le_bytes());

        core.extend_from_slice(&note_phdr);
        core.extend_from_slice(&load_phdr);
        core.extend_from_slice(&notes);
        core.extend_from_slice(&load_data);
        core
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn pins_the_documented_crash_id_literal_for_the_x86_64_happy_path() {
        let core = build_synthetic_core_with_return_address(0x401234, 0x7ffffff0, 0x405000);
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::create(&dir.path().join("crashy.4242.1700000000.cdh.tar.gz")).unwrap();
        archive.stream_open_reader(Box::new(Cursor::new(core)));

        let (_parsed, fp) = crate::fingerprint::parse_and_derive("crashy", &mut archive).unwrap();

        assert_eq!(fp.crash_id, "9BD5CB7CB1E559E9");
    }
}
