// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Helpers to manipulate the ELF file structs and bytes.

use std::io;

use crate::linux::{Prpsinfo, Prstatus, UserRegs};
use crate::write_elf::{Elf64Ehdr, Elf64Nhdr, Elf64Phdr, Elf64Shdr};

/// Round up a value to 4's.
///
/// This allows for address alignment at 4-byte intervals for the ELF structures.
pub const fn align_4(addr: usize) -> usize {
    ((addr) + 3) & (!3)
}

/// Round up a value to the next multiple of `align`, which must be a power of two.
pub const fn align_to(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

/// Pad output contents to 4-bytes wide
pub fn pad_to_4(written: usize, output: &mut impl io::Write) -> Result<(), std::io::Error> {
    let to_write = align_4(written) - written;
    for _ in 0..to_write {
        output.write_all(&[0_u8])?;
    }

    Ok(())
}

/// Read a little-endian u64 out of a byte slice at `offset`, if it fits.
pub fn u64_at(bytes: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(8)?;
    let raw: [u8; 8] = bytes.get(offset..end)?.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

/// Represent a Elf64Ehdr as bytes for ELF file.
///
/// This is a view over the underlying struct.
pub fn ehdr_to_bytes(ehdr: &Elf64Ehdr) -> &[u8] {
    unsafe { any_as_u8_slice(ehdr) }
}

/// Represent a Elf64Nhdr as bytes for ELF file.
pub fn nhdr_to_bytes(nhdr: &Elf64Nhdr) -> &[u8] {
    unsafe { any_as_u8_slice(nhdr) }
}

/// Represent a Elf64Phdr as bytes for ELF file.
pub fn phdr_to_bytes(phdr: &Elf64Phdr) -> &[u8] {
    unsafe { any_as_u8_slice(phdr) }
}

/// Represent a Elf64Shdr as bytes for ELF file.
pub fn shdr_to_bytes(shdr: &Elf64Shdr) -> &[u8] {
    unsafe { any_as_u8_slice(shdr) }
}

/// Represent a prstatus as bytes for ELF file.
pub fn prstatus_to_bytes(prstatus: &Prstatus) -> &[u8] {
    unsafe { any_as_u8_slice(prstatus) }
}

/// Represent a prpsinfo as bytes for ELF file.
pub fn prpsinfo_to_bytes(prpsinfo: &Prpsinfo) -> &[u8] {
    unsafe { any_as_u8_slice(prpsinfo) }
}

/// Represent the general purpose register block as bytes for ELF file.
pub fn user_regs_to_bytes(regs: &UserRegs) -> &[u8] {
    unsafe { any_as_u8_slice(regs) }
}

/// Convert any struct value to the &[u8] read-only slice representation
/// of the value in raw memory.
///
/// This allows for a constructed value to be written out to disk precisely as
/// it appears in memory. Of course, the memory layout needs to be correct,
/// which is why every type passed here is `#[repr(C)]` with its padding
/// spelled out as explicit fields.
unsafe fn any_as_u8_slice<T: Sized>(p: &T) -> &[u8] {
    // https://stackoverflow.com/a/42186553
    ::std::slice::from_raw_parts((p as *const T) as *const u8, ::std::mem::size_of::<T>())
}
