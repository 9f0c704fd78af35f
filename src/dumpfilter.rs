// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Decide how much of each memory mapping goes into the core file.
//!
//! The filter bits follow the `/proc/<pid>/coredump_filter` convention of
//! the Linux kernel, so a mask that works for a live core dump works here.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::snapshot::{MemoryError, UserSpace};
use crate::verbose::Verbosity;
use crate::vma::{MappingFlags, MemoryMappingView};

bitflags! {
    pub struct FilterBits: u64 {
        const ANON_PRIVATE = 0x1;
        const ANON_SHARED = 0x2;
        const MAPPED_PRIVATE = 0x4;
        const MAPPED_SHARED = 0x8;
        const ELF_HEADERS = 0x10;
        const HUGETLB_PRIVATE = 0x20;
        const HUGETLB_SHARED = 0x40;
    }
}

pub const FILTER_DEFAULT: FilterBits = FilterBits::from_bits_truncate(
    FilterBits::ANON_PRIVATE.bits()
        | FilterBits::ANON_SHARED.bits()
        | FilterBits::HUGETLB_PRIVATE.bits(),
);

const ELF_MAGIC: [u8; 4] = [
    elf::abi::ELFMAG0 as u8,
    elf::abi::ELFMAG1 as u8,
    elf::abi::ELFMAG2 as u8,
    elf::abi::ELFMAG3 as u8,
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterError {
    #[error("dump filter {mask:#x} has bits outside of {max:#x}")]
    Invalid { mask: u64, max: u64 },
}

/// The dump filter mask in effect.
#[derive(Debug)]
pub struct DumpFilter {
    mask: AtomicU64,
}

impl Default for DumpFilter {
    fn default() -> Self {
        DumpFilter {
            mask: AtomicU64::new(FILTER_DEFAULT.bits()),
        }
    }
}

impl DumpFilter {
    /// Replace the mask; an invalid mask leaves the current one in place.
    pub fn set(&self, mask: u64) -> Result<(), FilterError> {
        let bits = FilterBits::from_bits(mask).ok_or(FilterError::Invalid {
            mask,
            max: FilterBits::all().bits(),
        })?;
        self.mask.store(bits.bits(), Ordering::SeqCst);
        Ok(())
    }

    pub fn reset(&self) {
        self.mask.store(FILTER_DEFAULT.bits(), Ordering::SeqCst);
    }

    /// Read the mask once; a dump uses the returned value throughout.
    pub fn mask(&self) -> FilterBits {
        FilterBits::from_bits_truncate(self.mask.load(Ordering::SeqCst))
    }
}

/// Reads the first bytes of a mapping, to look for an ELF header.
pub trait HeaderProbe {
    fn read_magic(&self, vaddr: u64) -> Result<[u8; 4], MemoryError>;
}

impl HeaderProbe for UserSpace<'_> {
    fn read_magic(&self, vaddr: u64) -> Result<[u8; 4], MemoryError> {
        let mut magic = [0; 4];
        self.read_user(vaddr, &mut magic)?;
        Ok(magic)
    }
}

/// Number of bytes of `mapping` to write to the core file.
///
/// Either the whole mapping, nothing, or a single page holding the ELF
/// header of a mapped executable or library.
pub fn dump_size(
    mask: FilterBits,
    mapping: &MemoryMappingView,
    probe: &impl HeaderProbe,
    page_size: u64,
    verbosity: &Verbosity,
) -> u64 {
    let whole = mapping.end.saturating_sub(mapping.start);
    let flags = mapping.flags;

    if flags.contains(MappingFlags::ALWAYSDUMP) {
        return whole;
    }

    if flags.contains(MappingFlags::HUGETLB) {
        let wanted = if flags.contains(MappingFlags::SHARED) {
            FilterBits::HUGETLB_SHARED
        } else {
            FilterBits::HUGETLB_PRIVATE
        };
        return if mask.contains(wanted) { whole } else { 0 };
    }

    if flags.intersects(MappingFlags::IO | MappingFlags::RESERVED) {
        return 0;
    }

    if flags.contains(MappingFlags::SHARED) {
        let linked = mapping.file.as_ref().map_or(false, |file| file.nlink > 0);
        let wanted = if linked {
            FilterBits::MAPPED_SHARED
        } else {
            FilterBits::ANON_SHARED
        };
        return if mask.contains(wanted) { whole } else { 0 };
    }

    if mapping.has_anon && mask.contains(FilterBits::ANON_PRIVATE) {
        return whole;
    }

    if mapping.file.is_none() {
        return 0;
    }

    if mask.contains(FilterBits::MAPPED_PRIVATE) {
        return whole;
    }

    if mask.contains(FilterBits::ELF_HEADERS)
        && mapping.pgoff == 0
        && flags.contains(MappingFlags::READ)
    {
        match probe.read_magic(mapping.start) {
            Ok(magic) if magic == ELF_MAGIC => return page_size,
            Ok(_) => {}
            Err(e) => {
                pagefaultf!(verbosity, "page fault at {:#x}: {}", mapping.start, e);
            }
        }
    }

    0
}
