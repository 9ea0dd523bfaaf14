// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! `CrashID`/`VectorID` derivation from parsed registers and the `NT_FILE`
//! region table. The confidence-tag bit assignment and threshold values are
//! pinned to the bitmask the original observable behavior produces (see
//! DESIGN.md); this module does not guess at intent, only reproduces it.

use crate::archive::Archive;
use crate::elf::{ElfError, ParsedCore, Registers};
use libcp_common::jenkins::{hash_to_hex16, jenkins64};

const RETURN_ADDRESS: u8 = 1 << 0;
const IP_FILE_OFFSET: u8 = 1 << 1;
const RA_FILE_OFFSET: u8 = 1 << 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub crash_id: String,
    pub vector_id: String,
    pub confidence: Confidence,
    pub ip_file_offset: Option<u64>,
    pub ip_module: Option<String>,
    pub ra_file_offset: Option<u64>,
    pub ra_module: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    fn from_bits(bits: u8) -> Self {
        if bits > 6 {
            Self::High
        } else if bits < 2 {
            Self::Low
        } else {
            Self::Medium
        }
    }
}

/// Reads the 8-byte return address word at `rbp + 8` via the owning
/// `PT_LOAD` segment. Must run before `read_all()` drains the rest of the
/// core, since the stream is forward-only.
#[cfg(target_arch = "x86_64")]
fn read_return_address_x86_64(
    archive: &mut Archive,
    parsed: &ParsedCore,
    rbp: u64,
) -> Option<u64> {
    let addr = rbp.checked_add(8)?;
    let file_off = parsed.vaddr_to_file_offset(addr)?;
    archive.move_to_offset(file_off).ok()?;
    let mut buf = [0u8; 8];
    archive.read(&mut buf).ok()?;
    Some(u64::from_le_bytes(buf))
}

pub fn derive(name: &str, archive: &mut Archive, parsed: &ParsedCore) -> Fingerprint {
    let mut bits: u8 = 0;

    #[cfg(target_arch = "x86_64")]
    let ra = {
        let ra = read_return_address_x86_64(archive, parsed, parsed.registers.rbp);
        if ra.is_some() {
            bits |= RETURN_ADDRESS;
        }
        ra
    };
    #[cfg(target_arch = "aarch64")]
    let ra = {
        bits |= RETURN_ADDRESS;
        Some(parsed.registers.lr)
    };

    let ip = parsed.registers.ip();
    let ip_region = parsed.nt_file.find(ip);
    let (ip_file_offset, ip_module) = match ip_region {
        Some(r) => {
            bits |= IP_FILE_OFFSET;
            (
                Some(ip - r.vaddr_start + r.file_offset_pages * parsed.nt_file.elf_vma_page_size),
                Some(r.module_name.clone()),
            )
        }
        None => (None, None),
    };

    let (ra_file_offset, ra_module) = match ra.and_then(|addr| parsed.nt_file.find(addr).map(|r| (addr, r))) {
        Some((addr, r)) => {
            bits |= RA_FILE_OFFSET;
            (
                Some(addr - r.vaddr_start + r.file_offset_pages * parsed.nt_file.elf_vma_page_size),
                Some(r.module_name.clone()),
            )
        }
        None => (None, None),
    };

    let crash_id_input = match (&ip_file_offset, &ip_module, &ra_module) {
        (Some(off), Some(ip_mod), Some(ra_mod)) => format!("{name}{off:x}{ip_mod}{ra_mod}"),
        (Some(off), Some(ip_mod), None) => format!("{name}{off:x}{ip_mod}"),
        _ => format!("{name}{ip:x}"),
    };

    let crash_id = hash_to_hex16(jenkins64(crash_id_input.as_bytes()));

    let vector_id = if bits & RA_FILE_OFFSET != 0 {
        let vid_input = format!(
            "{name}{:x}{}",
            ip_file_offset.unwrap_or_default(),
            ra_module.as_deref().unwrap_or("")
        );
        hash_to_hex16(jenkins64(vid_input.as_bytes()))
    } else {
        crash_id.clone()
    };

    Fingerprint {
        crash_id,
        vector_id,
        confidence: Confidence::from_bits(bits),
        ip_file_offset,
        ip_module,
        ra_file_offset,
        ra_module,
    }
}

/// Convenience wrapper matching `spec.md` §4.3's step ordering: parse, then
/// derive. Propagates `NoteParseFailed`/`NoNotes` from the parse stage only;
/// fingerprinting itself never fails (absent data degrades confidence).
pub fn parse_and_derive(
    name: &str,
    archive: &mut Archive,
) -> Result<(ParsedCore, Fingerprint), ElfError> {
    let parsed = crate::elf::parse(archive)?;
    let fp = derive(name, archive, &parsed);
    Ok((parsed, fp))
}
