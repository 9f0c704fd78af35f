// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Field resolution table.
//!
//! Kernel structure layouts move around between versions, configs and
//! distribution builds. Everything in this tool addresses kernel memory as
//! "member M of structure S" through this table, which is populated once
//! from the layout of the kernel being inspected and is read-only after.
//!
//! A slot is either a non-negative byte offset, or absent (-1) when the
//! inspected kernel does not have that member at all.

use log::{debug, trace};
use once_cell::sync::OnceCell;
use std::fmt::{self, Display};
use thiserror::Error;

use crate::layout::TypeInfo;

/// Offset sentinel for a member the inspected kernel does not have.
const ABSENT: i64 = -1;

static FIELD_TABLE: OnceCell<FieldTable> = OnceCell::new();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("{field} is not present in the inspected kernel")]
    Missing { field: Field },

    #[error("size of {size} is not known for the inspected kernel")]
    MissingSize { size: Size },

    #[error("field table already installed")]
    AlreadyInstalled,
}

/// Declares the `Field` catalog: one variant per (structure, member) pair,
/// with the member names to try in order, newest kernels first.
macro_rules! field_catalog {
    ($($id:ident => $structure:literal [$($member:literal),+ $(,)?]),* $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Field {
            $($id),*
        }

        impl Field {
            pub const ALL: &'static [Field] = &[$(Field::$id),*];

            /// Structure the member lives in.
            pub fn structure(self) -> &'static str {
                match self {
                    $(Field::$id => $structure),*
                }
            }

            /// Candidate member names, first match wins.
            pub fn members(self) -> &'static [&'static str] {
                match self {
                    $(Field::$id => &[$($member),+]),*
                }
            }
        }
    };
}

field_catalog! {
    TaskStructStack => "task_struct" ["stack"],
    TaskStructState => "task_struct" ["__state", "state"],
    TaskStructFlags => "task_struct" ["flags"],
    TaskStructMm => "task_struct" ["mm"],
    TaskStructPid => "task_struct" ["pid"],
    TaskStructTgid => "task_struct" ["tgid"],
    TaskStructRealParent => "task_struct" ["real_parent"],
    TaskStructGroupLeader => "task_struct" ["group_leader"],
    TaskStructThreadGroup => "task_struct" ["thread_group"],
    TaskStructComm => "task_struct" ["comm"],
    TaskStructCred => "task_struct" ["real_cred", "cred"],
    TaskStructUid => "task_struct" ["uid"],
    TaskStructGid => "task_struct" ["gid"],
    TaskStructSignal => "task_struct" ["signal"],
    TaskStructPending => "task_struct" ["pending"],
    TaskStructBlocked => "task_struct" ["blocked"],
    TaskStructUtime => "task_struct" ["utime"],
    TaskStructStime => "task_struct" ["stime"],
    TaskStructStaticPrio => "task_struct" ["static_prio"],
    TaskStructThreadPid => "task_struct" ["thread_pid"],
    TaskStructPids => "task_struct" ["pids"],
    TaskStructUsedMath => "task_struct" ["used_math"],
    TaskStructThread => "task_struct" ["thread"],

    SigpendingSignal => "sigpending" ["signal"],

    SignalStructPids => "signal_struct" ["pids"],
    SignalStructPgrp => "signal_struct" ["pgrp", "__pgrp"],
    SignalStructSession => "signal_struct" ["session", "__session"],
    SignalStructUtime => "signal_struct" ["utime"],
    SignalStructStime => "signal_struct" ["stime"],
    SignalStructCutime => "signal_struct" ["cutime"],
    SignalStructCstime => "signal_struct" ["cstime"],

    CredUid => "cred" ["uid"],
    CredGid => "cred" ["gid"],

    PidNumbers => "pid" ["numbers"],
    UpidNr => "upid" ["nr"],
    PidLinkPid => "pid_link" ["pid"],

    MmStructMmap => "mm_struct" ["mmap"],
    MmStructPgd => "mm_struct" ["pgd"],
    MmStructMapCount => "mm_struct" ["map_count"],
    MmStructArgStart => "mm_struct" ["arg_start"],
    MmStructArgEnd => "mm_struct" ["arg_end"],
    MmStructSavedAuxv => "mm_struct" ["saved_auxv"],

    VmAreaStructVmStart => "vm_area_struct" ["vm_start"],
    VmAreaStructVmEnd => "vm_area_struct" ["vm_end"],
    VmAreaStructVmNext => "vm_area_struct" ["vm_next"],
    VmAreaStructVmFlags => "vm_area_struct" ["vm_flags"],
    VmAreaStructVmFile => "vm_area_struct" ["vm_file"],
    VmAreaStructVmPgoff => "vm_area_struct" ["vm_pgoff"],
    VmAreaStructAnonVma => "vm_area_struct" ["anon_vma"],

    FileFPath => "file" ["f_path"],
    FileFDentry => "file" ["f_dentry"],
    PathDentry => "path" ["dentry"],
    DentryDInode => "dentry" ["d_inode"],
    DentryDParent => "dentry" ["d_parent"],
    DentryDName => "dentry" ["d_name"],
    QstrName => "qstr" ["name"],
    InodeINlink => "inode" ["i_nlink", "__i_nlink"],

    ThreadStructFsbase => "thread_struct" ["fsbase", "fs"],
    ThreadStructGsbase => "thread_struct" ["gsbase", "gs"],
    ThreadStructFsindex => "thread_struct" ["fsindex"],
    ThreadStructGsindex => "thread_struct" ["gsindex"],
    ThreadStructDs => "thread_struct" ["ds"],
    ThreadStructEs => "thread_struct" ["es"],
    ThreadStructFpu => "thread_struct" ["fpu"],
    ThreadStructXstate => "thread_struct" ["xstate"],
    ThreadStructI387 => "thread_struct" ["i387"],
    ThreadStructIoBitmapPtr => "thread_struct" ["io_bitmap_ptr"],
    ThreadStructIoBitmapMax => "thread_struct" ["io_bitmap_max"],

    FpuState => "fpu" ["state"],
    FpuFpstate => "fpu" ["fpstate"],
    FpuFpstateActive => "fpu" ["fpstate_active", "initialized"],
    FpstateRegs => "fpstate" ["regs"],

    PtRegsR15 => "pt_regs" ["r15"],
    PtRegsR14 => "pt_regs" ["r14"],
    PtRegsR13 => "pt_regs" ["r13"],
    PtRegsR12 => "pt_regs" ["r12"],
    PtRegsBp => "pt_regs" ["bp", "rbp"],
    PtRegsBx => "pt_regs" ["bx", "rbx"],
    PtRegsR11 => "pt_regs" ["r11"],
    PtRegsR10 => "pt_regs" ["r10"],
    PtRegsR9 => "pt_regs" ["r9"],
    PtRegsR8 => "pt_regs" ["r8"],
    PtRegsAx => "pt_regs" ["ax", "rax"],
    PtRegsCx => "pt_regs" ["cx", "rcx"],
    PtRegsDx => "pt_regs" ["dx", "rdx"],
    PtRegsSi => "pt_regs" ["si", "rsi"],
    PtRegsDi => "pt_regs" ["di", "rdi"],
    PtRegsOrigAx => "pt_regs" ["orig_ax", "orig_rax"],
    PtRegsIp => "pt_regs" ["ip", "rip"],
    PtRegsCs => "pt_regs" ["cs"],
    PtRegsFlags => "pt_regs" ["flags", "eflags"],
    PtRegsSp => "pt_regs" ["sp", "rsp"],
    PtRegsSs => "pt_regs" ["ss"],
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.structure(), self.members()[0])
    }
}

/// Where the value of a size slot comes from.
#[derive(Clone, Copy, Debug)]
enum SizeSource {
    Struct(&'static str),
    Constant(&'static str),
}

/// Sizes of whole structures, and layout-dependent lengths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Size {
    PtRegs,
    PidLink,
    ThreadSize,
    XstateArea,
}

impl Size {
    pub const ALL: &'static [Size] = &[
        Size::PtRegs,
        Size::PidLink,
        Size::ThreadSize,
        Size::XstateArea,
    ];

    fn sources(self) -> &'static [SizeSource] {
        use SizeSource::*;
        match self {
            Size::PtRegs => &[Struct("pt_regs")],
            Size::PidLink => &[Struct("pid_link")],
            Size::ThreadSize => &[Constant("THREAD_SIZE")],
            Size::XstateArea => &[Constant("XSTATE_SIZE"), Struct("thread_xstate")],
        }
    }
}

impl Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sources()[0] {
            SizeSource::Struct(name) => write!(f, "struct {name}"),
            SizeSource::Constant(name) => write!(f, "{name}"),
        }
    }
}

/// One resolved structure member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSlot {
    offset: i64,
    size: Option<u64>,
}

impl FieldSlot {
    const fn absent() -> Self {
        FieldSlot {
            offset: ABSENT,
            size: None,
        }
    }
}

/// Offsets and sizes of every kernel structure member the tool knows about,
/// resolved against one kernel build.
#[derive(Clone, Debug)]
pub struct FieldTable {
    fields: Vec<FieldSlot>,
    sizes: Vec<Option<u64>>,
}

impl Default for FieldTable {
    fn default() -> Self {
        FieldTable {
            fields: vec![FieldSlot::absent(); Field::ALL.len()],
            sizes: vec![None; Size::ALL.len()],
        }
    }
}

impl FieldTable {
    /// Resolve every known field against a kernel layout.
    ///
    /// Members the layout does not know are left absent; that is normal,
    /// since no kernel build has all of them.
    pub fn populate(info: &impl TypeInfo) -> Self {
        let mut table = FieldTable::default();

        for &field in Field::ALL {
            let structure = field.structure();
            let found = field.members().iter().find_map(|member| {
                info.member_offset(structure, member)
                    .map(|offset| (offset, info.member_size(structure, member)))
            });

            match found {
                Some((offset, size)) => match i64::try_from(offset) {
                    Ok(offset) => {
                        trace!("field {} at {:#x}", field, offset);
                        table.fields[field as usize] = FieldSlot { offset, size };
                    }
                    Err(_) => debug!("field {} has an unusable offset {:#x}", field, offset),
                },
                None => debug!("field {} not found in layout", field),
            }
        }

        for &size in Size::ALL {
            let found = size.sources().iter().find_map(|source| match *source {
                SizeSource::Struct(name) => info.struct_size(name),
                SizeSource::Constant(name) => info.constant(name),
            });

            match found {
                Some(value) => table.sizes[size as usize] = Some(value),
                None => debug!("size of {} not found in layout", size),
            }
        }

        table
    }

    /// Byte offset of `field` within its structure.
    pub fn resolve(&self, field: Field) -> Result<u64, FieldError> {
        let slot = &self.fields[field as usize];
        if slot.offset == ABSENT {
            return Err(FieldError::Missing { field });
        }
        assert!(slot.offset >= 0, "corrupt offset for {field}");
        Ok(slot.offset as u64)
    }

    /// Size of the member behind `field`.
    pub fn member_size(&self, field: Field) -> Result<u64, FieldError> {
        self.fields[field as usize]
            .size
            .ok_or(FieldError::Missing { field })
    }

    /// Resolve a structure size or layout length.
    pub fn resolve_size(&self, size: Size) -> Result<u64, FieldError> {
        self.sizes[size as usize].ok_or(FieldError::MissingSize { size })
    }

    /// Whether the inspected kernel has `field`.
    pub fn is_present(&self, field: Field) -> bool {
        self.fields[field as usize].offset != ABSENT
    }

    /// Number of fields resolved to an offset.
    pub fn count_present(&self) -> usize {
        Field::ALL.iter().filter(|f| self.is_present(**f)).count()
    }
}

/// Install the process-wide field table.
///
/// This happens once, before any dump; the table is shared read-only after.
pub fn install(table: FieldTable) -> Result<&'static FieldTable, FieldError> {
    FIELD_TABLE
        .set(table)
        .map_err(|_| FieldError::AlreadyInstalled)?;
    FIELD_TABLE.get().ok_or(FieldError::AlreadyInstalled)
}
