// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Register sets: the per-thread machine state written as ELF notes.
//!
//! A machine describes its state as an ordered list of regset descriptors,
//! grouped in a view. Each descriptor knows how large its note is, whether
//! a thread has that state at all, and how to fetch it from the snapshot.
//! Adding a new category of state is adding a descriptor.

use log::{debug, info, trace};
use once_cell::sync::OnceCell;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::fields::{FieldError, Size};
use crate::kernel::{Kernel, KernelError};
use crate::linux::{Prstatus, NT_PRSTATUS};
use crate::snapshot::MemoryError;
use crate::task::Task;
use crate::verbose::Verbosity;
use crate::write_elf::ElfNote;

static VIEW_OVERRIDE: OnceCell<&'static RegsetView> = OnceCell::new();

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("register layout")]
    Field(#[from] FieldError),

    #[error("register memory")]
    Memory(#[from] MemoryError),

    #[error("fetched {got} bytes, note needs {expected}")]
    Size { expected: usize, got: usize },
}

impl From<KernelError> for FetchError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::Field(e) => FetchError::Field(e),
            KernelError::Memory(e) => FetchError::Memory(e),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ViewError {
    #[error("no register view for machine {0}")]
    Unsupported(String),

    #[error("register view {view} is for {view_machine}, inspected kernel is {machine}")]
    Mismatch {
        view: &'static str,
        view_machine: Machine,
        machine: Machine,
    },

    #[error("a register view override is already registered")]
    OverrideAlreadySet,

    #[error("unknown register view {0}")]
    UnknownView(String),
}

/// Machines a register view can be written for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Machine {
    X86_64,
}

impl Machine {
    pub const fn e_machine(self) -> u16 {
        match self {
            Machine::X86_64 => elf::abi::EM_X86_64 as u16,
        }
    }
}

impl FromStr for Machine {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "x86-64" | "amd64" => Ok(Machine::X86_64),
            _ => Err(ViewError::Unsupported(s.to_string())),
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Machine::X86_64 => write!(f, "x86_64"),
        }
    }
}

/// Whether a thread has this state. Never fails; unsure is inactive.
pub type ActiveFn = fn(&Kernel, &Task) -> bool;
/// Copy exactly `size` bytes of this state out of the snapshot.
pub type FetchFn = fn(&Kernel, &Task, usize) -> Result<Vec<u8>, FetchError>;
/// Flush cached register state before fetching, on live sources.
pub type WritebackFn = fn(&Kernel, &Task) -> Result<(), FetchError>;
/// Amend the thread's notes once this descriptor's note is collected.
pub type PostProcessFn = fn(&mut ThreadCoreInfo, &RegsetDescriptor);

/// Size of a regset note.
#[derive(Clone, Copy, Debug)]
pub enum NoteSize {
    Fixed(usize),
    /// Depends on the inspected kernel and CPU.
    Slot(Size),
}

/// One category of per-thread state, written as one ELF note.
pub struct RegsetDescriptor {
    pub name: &'static str,
    pub note_name: &'static [u8; 8],
    pub note_type: u32,
    pub size: NoteSize,
    pub fetch: FetchFn,
    pub active: ActiveFn,
    pub writeback: Option<WritebackFn>,
    pub post_process: Option<PostProcessFn>,
}

impl RegsetDescriptor {
    pub fn note_size(&self, kernel: &Kernel) -> Result<usize, FieldError> {
        match self.size {
            NoteSize::Fixed(size) => Ok(size),
            NoteSize::Slot(slot) => Ok(kernel.fields.resolve_size(slot)? as usize),
        }
    }

    /// Fetch this regset for `task`, checking its length.
    pub fn collect(&self, kernel: &Kernel, task: &Task) -> Result<Vec<u8>, FetchError> {
        let size = self.note_size(kernel)?;
        if let Some(writeback) = self.writeback {
            writeback(kernel, task)?;
        }
        let bytes = (self.fetch)(kernel, task, size)?;
        if bytes.len() != size {
            return Err(FetchError::Size {
                expected: size,
                got: bytes.len(),
            });
        }
        Ok(bytes)
    }
}

impl fmt::Debug for RegsetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegsetDescriptor")
            .field("name", &self.name)
            .field("note_type", &self.note_type)
            .field("size", &self.size)
            .finish()
    }
}

/// The ordered regsets of one machine, plus what goes in the ELF header.
#[derive(Debug)]
pub struct RegsetView {
    pub name: &'static str,
    pub machine: Machine,
    pub regsets: &'static [RegsetDescriptor],
    pub e_machine: u16,
    pub e_flags: u32,
    pub ei_osabi: u8,
}

/// Built-in views, the default view of each machine first.
static VIEWS: &[&RegsetView] = &[
    &crate::regset_x86_64::X86_64_VIEW,
    &crate::regset_x86_64::X86_64_LEGACY_VIEW,
];

/// Find a built-in view by name.
pub fn find_view(name: &str) -> Result<&'static RegsetView, ViewError> {
    VIEWS
        .iter()
        .copied()
        .find(|view| view.name == name)
        .ok_or_else(|| ViewError::UnknownView(name.to_string()))
}

/// Replace the built-in view of the view's machine. Only once, at startup.
pub fn register_view_override(view: &'static RegsetView) -> Result<(), ViewError> {
    VIEW_OVERRIDE
        .set(view)
        .map_err(|_| ViewError::OverrideAlreadySet)?;
    info!("register view override {}", view.name);
    Ok(())
}

/// View for the machine of the inspected kernel.
pub fn select_view(machine: Machine) -> Result<&'static RegsetView, ViewError> {
    if let Some(view) = VIEW_OVERRIDE.get() {
        if view.machine != machine {
            return Err(ViewError::Mismatch {
                view: view.name,
                view_machine: view.machine,
                machine,
            });
        }
        return Ok(view);
    }

    VIEWS
        .iter()
        .copied()
        .find(|view| view.machine == machine)
        .ok_or_else(|| ViewError::Unsupported(machine.to_string()))
}

/// Notes of one thread, in the order they go in the core file.
#[derive(Debug)]
pub struct ThreadCoreInfo {
    pub task: Task,
    pub prstatus: Prstatus,
    pub notes: Vec<ElfNote>,
}

impl ThreadCoreInfo {
    pub fn new(task: Task, prstatus: Prstatus) -> Self {
        ThreadCoreInfo {
            task,
            prstatus,
            notes: Vec::new(),
        }
    }

    pub fn note(&self, note_type: u32) -> Option<&ElfNote> {
        self.notes.iter().find(|note| note.note_type == note_type)
    }

    /// The NT_PRSTATUS note, built from the final prstatus.
    pub fn prstatus_note(&self) -> ElfNote {
        ElfNote {
            note_name: crate::write_elf::NOTE_NAME_CORE,
            note_type: NT_PRSTATUS,
            description: self.prstatus.to_bytes(),
            friendly: "thread prstatus",
        }
    }

    /// The NT_PRSTATUS note, then every other collected note.
    pub fn into_notes(self) -> Vec<ElfNote> {
        let mut notes = vec![self.prstatus_note()];
        notes.extend(
            self.notes
                .into_iter()
                .filter(|note| note.note_type != NT_PRSTATUS),
        );
        notes
    }
}

/// Collect every active regset of `task`.
///
/// A regset that cannot be read is left out of the thread's notes; the
/// prstatus note is always there, with whatever could be filled in.
pub fn collect_thread(
    view: &RegsetView,
    kernel: &Kernel,
    task: &Task,
    prstatus: Prstatus,
    verbosity: &Verbosity,
) -> ThreadCoreInfo {
    let mut info = ThreadCoreInfo::new(task.clone(), prstatus);

    for regset in view.regsets {
        if !(regset.active)(kernel, task) {
            trace!("regset {} not active for {}", regset.name, task.pid);
            continue;
        }

        let description = match regset.collect(kernel, task) {
            Ok(bytes) => bytes,
            Err(e) => {
                nonquietf!(
                    verbosity,
                    "skipping regset {} of thread {}: {}",
                    regset.name,
                    task.pid,
                    e
                );
                continue;
            }
        };

        info.notes.push(ElfNote {
            note_name: regset.note_name,
            note_type: regset.note_type,
            description,
            friendly: regset.name,
        });

        if let Some(post_process) = regset.post_process {
            post_process(&mut info, regset);
        }
    }

    debug!(
        "collected {} regset notes for thread {}",
        info.notes.len(),
        task.pid
    );
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldTable;
    use crate::kernel::KernelParams;
    use crate::layout::Layout;
    use crate::snapshot::{BufferMemory, DirectMap, KernelMemory};
    use crate::write_elf::NOTE_NAME_CORE;

    fn always(_: &Kernel, _: &Task) -> bool {
        true
    }

    fn never(_: &Kernel, _: &Task) -> bool {
        false
    }

    fn fetch_ones(_: &Kernel, _: &Task, size: usize) -> Result<Vec<u8>, FetchError> {
        Ok(vec![1; size])
    }

    fn fetch_short(_: &Kernel, _: &Task, size: usize) -> Result<Vec<u8>, FetchError> {
        Ok(vec![1; size - 1])
    }

    fn fetch_fault(_: &Kernel, _: &Task, _: usize) -> Result<Vec<u8>, FetchError> {
        Err(MemoryError::Unmapped { vaddr: 0x1000 }.into())
    }

    fn mark_fpvalid(info: &mut ThreadCoreInfo, _: &RegsetDescriptor) {
        info.prstatus.pr_fpvalid = 1;
    }

    const fn regset(note_type: u32, fetch: FetchFn, active: ActiveFn) -> RegsetDescriptor {
        RegsetDescriptor {
            name: "test",
            note_name: NOTE_NAME_CORE,
            note_type,
            size: NoteSize::Fixed(16),
            fetch,
            active,
            writeback: None,
            post_process: None,
        }
    }

    static TEST_REGSETS: [RegsetDescriptor; 5] = [
        regset(0x10, fetch_ones, always),
        regset(0x11, fetch_ones, never),
        regset(0x12, fetch_short, always),
        regset(0x13, fetch_fault, always),
        RegsetDescriptor {
            post_process: Some(mark_fpvalid),
            ..regset(0x14, fetch_ones, always)
        },
    ];

    static TEST_VIEW: RegsetView = RegsetView {
        name: "test",
        machine: Machine::X86_64,
        regsets: &TEST_REGSETS,
        e_machine: 62,
        e_flags: 0,
        ei_osabi: 0,
    };

    fn task() -> Task {
        Task {
            addr: 0xffff_8880_0002_0000,
            pid: 1234,
            tgid: 1234,
            mm: 0,
        }
    }

    #[test]
    fn collects_active_fetchable_regsets() {
        let phys = BufferMemory::new(vec![0; 0x1000]);
        let fields = FieldTable::default();
        let mem = KernelMemory::new(&phys, Box::new(DirectMap::new(0)));
        let kernel = Kernel::new(mem, &fields, KernelParams::from_type_info(&Layout::default()));

        let info = collect_thread(
            &TEST_VIEW,
            &kernel,
            &task(),
            Prstatus::default(),
            &Verbosity::default(),
        );

        let types: Vec<u32> = info.notes.iter().map(|n| n.note_type).collect();
        assert_eq!(vec![0x10, 0x14], types);
        assert_eq!(1, info.prstatus.pr_fpvalid);
        assert!(info.note(0x13).is_none());

        let notes = info.into_notes();
        assert_eq!(NT_PRSTATUS, notes[0].note_type);
        assert_eq!(336, notes[0].description.len());
        assert_eq!(3, notes.len());
    }

    #[test]
    fn slot_sized_regset_needs_the_slot() {
        let phys = BufferMemory::new(vec![0; 0x1000]);
        let fields = FieldTable::default();
        let mem = KernelMemory::new(&phys, Box::new(DirectMap::new(0)));
        let kernel = Kernel::new(mem, &fields, KernelParams::from_type_info(&Layout::default()));

        let sized = RegsetDescriptor {
            size: NoteSize::Slot(Size::XstateArea),
            ..regset(0x15, fetch_ones, always)
        };
        assert!(matches!(
            sized.collect(&kernel, &task()),
            Err(FetchError::Field(FieldError::MissingSize { .. }))
        ));
        assert!(matches!(
            regset(0x12, fetch_short, always).collect(&kernel, &task()),
            Err(FetchError::Size {
                expected: 16,
                got: 15
            })
        ));
    }

    #[test]
    fn machine_names() {
        assert_eq!(Ok(Machine::X86_64), "x86_64".parse());
        assert_eq!(
            Err(ViewError::Unsupported("aarch64".to_string())),
            "aarch64".parse::<Machine>()
        );
    }

    #[test]
    fn finds_views_by_name_and_machine() -> Result<(), ViewError> {
        assert_eq!("x86_64", find_view("x86_64")?.name);
        assert_eq!("x86_64-legacy", find_view("x86_64-legacy")?.name);
        assert!(matches!(find_view("ppc64"), Err(ViewError::UnknownView(_))));
        assert_eq!(62, select_view(Machine::X86_64)?.e_machine);
        Ok(())
    }
}
