// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Assemble the core file of one process.

use log::{debug, info};
use std::io;
use thiserror::Error;

use crate::dumpfilter::{dump_size, DumpFilter};
use crate::fields::Field;
use crate::kernel::{Kernel, KernelError};
use crate::linux::{NT_AUXV, NT_FILE, NT_PRPSINFO};
use crate::regset::{collect_thread, RegsetView};
use crate::snapshot::PAGE_SIZE;
use crate::task::{self, ProcessIds, Task, TaskError};
use crate::verbose::Verbosity;
use crate::vma;
use crate::write_elf::{self, CoreWriteError, ElfNote, LoadSegment, NOTE_NAME_CORE};

#[derive(Error, Debug)]
pub enum CoredumpError {
    #[error("unable to load task")]
    Task(#[from] TaskError),

    #[error("unable to read the address space")]
    AddressSpace(#[source] KernelError),

    #[error("unable to write core headers")]
    Io(#[from] io::Error),

    #[error("unable to write core contents")]
    Write(#[from] CoreWriteError),
}

/// Settings a dump runs with.
#[derive(Debug, Default)]
pub struct DumpConfig {
    pub filter: DumpFilter,
    pub verbosity: Verbosity,
}

/// What was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DumpSummary {
    pub threads: usize,
    pub segments: usize,
    pub notes: usize,
    pub bytes: u64,
    pub faulted_pages: u64,
}

/// Write the core file of the process `task_addr` belongs to.
///
/// Only failing to read the task itself or its page table root stops the
/// dump; anything else that cannot be read is left out of the core file.
pub fn coredump(
    kernel: &Kernel,
    view: &RegsetView,
    config: &DumpConfig,
    task_addr: u64,
    output: &mut impl io::Write,
) -> Result<DumpSummary, CoredumpError> {
    let mask = config.filter.mask();
    let verbosity = &config.verbosity;
    progressf!(verbosity, "dump filter {:#x}", mask.bits());

    let task = Task::load(kernel, task_addr)?;
    if task.mm == 0 {
        return Err(TaskError::NoMm { task: task.addr }.into());
    }
    info!("dumping pid {} (tgid {})", task.pid, task.tgid);

    let threads = task::thread_group(kernel, &task, verbosity);
    let leader = leader_of(kernel, &task, &threads);
    progressf!(verbosity, "found {} threads", threads.len());

    let user = kernel
        .mem
        .user_space(
            kernel
                .read_field_u64(task.mm, Field::MmStructPgd)
                .map_err(CoredumpError::AddressSpace)?,
        )
        .map_err(|e| CoredumpError::AddressSpace(e.into()))?;

    let mappings = vma::read_mappings(kernel, &task, verbosity);
    let segments: Vec<LoadSegment> = mappings
        .iter()
        .map(|mapping| {
            let filesz = dump_size(mask, mapping, &user, PAGE_SIZE, verbosity);
            debug!("{} dump size {:#x}", mapping, filesz);
            LoadSegment::new(mapping, filesz)
        })
        .collect();
    progressf!(verbosity, "found {} memory mappings", segments.len());

    let ids = ProcessIds::load(kernel, &leader, verbosity);
    let mut thread_notes = threads.iter().map(|thread| {
        let prstatus = task::fill_prstatus(kernel, thread, &threads, &ids, verbosity);
        collect_thread(view, kernel, thread, prstatus, verbosity).into_notes()
    });

    // first thread's prstatus, then the process notes, then its other notes
    let mut notes: Vec<ElfNote> = Vec::new();
    let mut first = thread_notes.next().unwrap_or_default().into_iter();
    notes.extend(first.next());

    let psinfo = task::fill_psinfo(kernel, &user, &leader, &ids, verbosity);
    notes.push(ElfNote {
        note_name: NOTE_NAME_CORE,
        note_type: NT_PRPSINFO,
        description: psinfo.to_bytes(),
        friendly: "process psinfo",
    });

    match task::read_auxv(kernel, &task) {
        Ok(auxv) => notes.push(ElfNote {
            note_name: NOTE_NAME_CORE,
            note_type: NT_AUXV,
            description: auxv,
            friendly: "process auxv",
        }),
        Err(e) => nonquietf!(verbosity, "skipping auxv: {}", e),
    }

    notes.push(ElfNote {
        note_name: NOTE_NAME_CORE,
        note_type: NT_FILE,
        description: write_elf::mapped_files_description(&mappings),
        friendly: "mapped files",
    });

    notes.extend(first);
    notes.extend(thread_notes.flatten());
    progressf!(verbosity, "collected {} notes", notes.len());

    let layout = write_elf::write_headers_and_notes(view, &notes, &segments, output)?;
    let faulted_pages = write_elf::write_load_sections(&segments, &user, verbosity, output)?;
    output.flush()?;

    let summary = DumpSummary {
        threads: threads.len(),
        segments: segments.len(),
        notes: notes.len(),
        bytes: segments
            .iter()
            .fold(layout.data_offset, |total, s| total.saturating_add(s.filesz)),
        faulted_pages,
    };
    progressf!(verbosity, "wrote {} bytes", summary.bytes);
    Ok(summary)
}

/// The thread group leader, or the dumped task if it cannot be read.
fn leader_of(kernel: &Kernel, task: &Task, threads: &[Task]) -> Task {
    if let Some(leader) = threads.iter().find(|t| t.is_group_leader()) {
        return leader.clone();
    }
    match kernel.read_field_u64(task.addr, Field::TaskStructGroupLeader) {
        Ok(addr) if addr != 0 => Task::load(kernel, addr).unwrap_or_else(|e| {
            debug!("unable to load group leader: {}", e);
            task.clone()
        }),
        _ => task.clone(),
    }
}
