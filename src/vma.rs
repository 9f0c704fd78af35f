// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Memory mappings of a process, from its `vm_area_struct` list.

use bitflags::bitflags;
use log::{debug, trace};
use std::fmt;

use crate::fields::Field;
use crate::kernel::{Kernel, KernelError, VmFlagLayout};
use crate::snapshot::PAGE_SIZE;
use crate::task::Task;
use crate::verbose::Verbosity;

/// Most mappings one address space can hold, the default vm.max_map_count.
const MAX_MAP_COUNT: u64 = 65530;
/// Deepest directory nesting followed when naming a mapped file.
const MAX_PATH_DEPTH: usize = 256;
const MAX_NAME_LEN: usize = 255;

bitflags! {
    pub struct MappingFlags: u64 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
        const SHARED = 0x8;
        const IO = 0x10;
        const RESERVED = 0x20;
        const HUGETLB = 0x40;
        const ALWAYSDUMP = 0x80;
    }
}

impl MappingFlags {
    /// Translate kernel `vm_flags` into mapping flags.
    pub fn from_vm_flags(vm_flags: u64, layout: &VmFlagLayout) -> Self {
        let mut flags = MappingFlags::empty();
        for (bit, flag) in [
            (layout.read, MappingFlags::READ),
            (layout.write, MappingFlags::WRITE),
            (layout.exec, MappingFlags::EXEC),
            (layout.shared, MappingFlags::SHARED),
            (layout.io, MappingFlags::IO),
            (layout.reserved, MappingFlags::RESERVED),
            (layout.hugetlb, MappingFlags::HUGETLB),
            (layout.alwaysdump, MappingFlags::ALWAYSDUMP),
        ] {
            if bit != 0 && vm_flags & bit != 0 {
                flags |= flag;
            }
        }
        flags
    }

    /// ELF program header flags for a mapping.
    pub fn p_flags(&self) -> u32 {
        let mut p_flags = 0;
        if self.contains(MappingFlags::READ) {
            p_flags |= elf::abi::PF_R as u32;
        }
        if self.contains(MappingFlags::WRITE) {
            p_flags |= elf::abi::PF_W as u32;
        }
        if self.contains(MappingFlags::EXEC) {
            p_flags |= elf::abi::PF_X as u32;
        }
        p_flags
    }
}

/// The file behind a mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileBacking {
    pub file: u64,
    /// Link count of the inode; 0 for deleted files and shared memory.
    pub nlink: u64,
    pub path: String,
}

/// One memory mapping of the dumped process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryMappingView {
    pub vma: u64,
    pub start: u64,
    pub end: u64,
    pub flags: MappingFlags,
    /// File offset, in pages
    pub pgoff: u64,
    pub file: Option<FileBacking>,
    /// The mapping has anonymous pages, i.e. it has been written to
    pub has_anon: bool,
}

impl MemoryMappingView {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// A non-empty range of whole pages.
    fn is_well_formed(&self) -> bool {
        self.start < self.end && self.start % PAGE_SIZE == 0 && self.end % PAGE_SIZE == 0
    }
}

impl fmt::Display for MemoryMappingView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let perm = |flag, c| if self.flags.contains(flag) { c } else { '-' };
        write!(
            f,
            "{:x}-{:x} {}{}{}{} {:08x} {}",
            self.start,
            self.end,
            perm(MappingFlags::READ, 'r'),
            perm(MappingFlags::WRITE, 'w'),
            perm(MappingFlags::EXEC, 'x'),
            if self.flags.contains(MappingFlags::SHARED) {
                's'
            } else {
                'p'
            },
            self.pgoff.wrapping_mul(PAGE_SIZE),
            self.file.as_ref().map_or("", |file| file.path.as_str())
        )
    }
}

/// Read the mappings of the address space of `task`, in list order.
///
/// Mappings that cannot be read are left out. A list that cannot be
/// followed ends the walk, keeping what was read up to that point.
pub fn read_mappings(
    kernel: &Kernel,
    task: &Task,
    verbosity: &Verbosity,
) -> Vec<MemoryMappingView> {
    let mut mappings = Vec::new();
    let mut vma = match kernel.read_field_u64(task.mm, Field::MmStructMmap) {
        Ok(vma) => vma,
        Err(e) => {
            nonquietf!(verbosity, "unable to find the mapping list: {}", e);
            return mappings;
        }
    };
    let map_count = kernel
        .read_field_uint(task.mm, Field::MmStructMapCount)
        .unwrap_or_else(|e| {
            nonquietf!(verbosity, "unable to read map_count: {}", e);
            MAX_MAP_COUNT
        })
        .min(MAX_MAP_COUNT);

    let mut walked = 0;
    while vma != 0 && walked < map_count {
        walked += 1;
        match read_mapping(kernel, vma, verbosity) {
            Ok(mapping) if mapping.is_well_formed() => {
                trace!("mapping {}", mapping);
                mappings.push(mapping);
            }
            Ok(mapping) => nonquietf!(verbosity, "skipping malformed mapping {}", mapping),
            Err(e) => nonquietf!(verbosity, "skipping mapping {:#x}: {}", vma, e),
        }
        vma = match kernel.read_field_u64(vma, Field::VmAreaStructVmNext) {
            Ok(next) => next,
            Err(e) => {
                nonquietf!(verbosity, "mapping list broken after {:#x}: {}", vma, e);
                break;
            }
        };
    }

    if vma != 0 && walked >= map_count {
        debug!("mapping list longer than map_count {}, stopped", map_count);
    }
    debug!("read {} mappings", mappings.len());
    mappings
}

/// Read one `vm_area_struct`; only its range and flags are required.
fn read_mapping(
    kernel: &Kernel,
    vma: u64,
    verbosity: &Verbosity,
) -> Result<MemoryMappingView, KernelError> {
    let start = kernel.read_field_u64(vma, Field::VmAreaStructVmStart)?;
    let end = kernel.read_field_u64(vma, Field::VmAreaStructVmEnd)?;
    let vm_flags = kernel.read_field_u64(vma, Field::VmAreaStructVmFlags)?;
    let flags = MappingFlags::from_vm_flags(vm_flags, &kernel.params.vm);

    // without anon_vma, assume a private writable mapping was written
    let guess_anon = flags.contains(MappingFlags::WRITE) && !flags.contains(MappingFlags::SHARED);
    let has_anon = if kernel.fields.is_present(Field::VmAreaStructAnonVma) {
        kernel
            .read_field_u64(vma, Field::VmAreaStructAnonVma)
            .map(|anon_vma| anon_vma != 0)
            .unwrap_or_else(|e| {
                nonquietf!(verbosity, "unable to read anon_vma of {:#x}: {}", vma, e);
                guess_anon
            })
    } else {
        guess_anon
    };

    let pgoff = kernel
        .read_field_u64(vma, Field::VmAreaStructVmPgoff)
        .unwrap_or_else(|e| {
            nonquietf!(verbosity, "unable to read offset of {:#x}: {}", vma, e);
            0
        });

    let file = match kernel.read_field_u64(vma, Field::VmAreaStructVmFile) {
        Ok(0) => None,
        Ok(file) => Some(read_file_backing(kernel, file, verbosity)),
        Err(e) => {
            nonquietf!(verbosity, "unable to read file of {:#x}: {}", vma, e);
            None
        }
    };

    Ok(MemoryMappingView {
        vma,
        start,
        end,
        flags,
        pgoff,
        file,
        has_anon,
    })
}

/// Dentry of an open file.
fn file_dentry(kernel: &Kernel, file: u64) -> Result<u64, KernelError> {
    if kernel.fields.is_present(Field::FileFPath) {
        let path = kernel.field_addr(file, Field::FileFPath)?;
        kernel.read_field_u64(path, Field::PathDentry)
    } else {
        kernel.read_field_u64(file, Field::FileFDentry)
    }
}

fn read_file_backing(kernel: &Kernel, file: u64, verbosity: &Verbosity) -> FileBacking {
    let dentry = file_dentry(kernel, file);

    // a file whose link count cannot be read is treated as a linked file
    let nlink = dentry
        .as_ref()
        .map_err(|e| e.to_string())
        .and_then(|dentry| {
            kernel
                .read_field_u64(*dentry, Field::DentryDInode)
                .and_then(|inode| kernel.read_field_uint(inode, Field::InodeINlink))
                .map_err(|e| e.to_string())
        })
        .unwrap_or_else(|e| {
            nonquietf!(verbosity, "unable to read link count of file {:#x}: {}", file, e);
            1
        });

    let path = dentry
        .and_then(|dentry| dentry_path(kernel, dentry))
        .unwrap_or_else(|e| {
            nonquietf!(verbosity, "unable to read path of file {:#x}: {}", file, e);
            String::new()
        });

    FileBacking { file, nlink, path }
}

/// Path of a dentry, walking up its parents to the root of its mount.
fn dentry_path(kernel: &Kernel, dentry: u64) -> Result<String, KernelError> {
    let mut names = Vec::new();
    let mut current = dentry;

    for _ in 0..MAX_PATH_DEPTH {
        let parent = kernel.read_field_u64(current, Field::DentryDParent)?;
        if parent == current || parent == 0 {
            break;
        }
        let qstr = kernel.field_addr(current, Field::DentryDName)?;
        let name = kernel.read_field_u64(qstr, Field::QstrName)?;
        names.push(kernel.mem.read_cstring(name, MAX_NAME_LEN)?);
        current = parent;
    }

    if names.is_empty() {
        return Ok("/".to_string());
    }
    names.reverse();
    Ok(names.iter().fold(String::new(), |path, name| path + "/" + name))
}
