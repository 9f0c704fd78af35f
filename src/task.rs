// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Process and thread information, read from kernel task structures.

use log::{debug, trace};
use std::collections::HashSet;
use thiserror::Error;

use crate::fields::{Field, Size};
use crate::kernel::{Kernel, KernelError};
use crate::linux::{ElfTimeval, Prpsinfo, Prstatus};
use crate::snapshot::{MemoryError, UserSpace};
use crate::verbose::Verbosity;

/// Upper bound on threads walked in one thread group.
const MAX_THREADS: usize = 65536;

const TASK_COMM_LEN: usize = 16;
const ELF_PRARGSZ: usize = 80;
const AT_NULL: u64 = 0;
/// Entries in `mm_struct.saved_auxv` when the layout does not say.
const AT_VECTOR_SIZE: u64 = 46;
const NICE_BASE_PRIO: i64 = 120;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("unable to read task {task:#x}")]
    Read {
        task: u64,
        #[source]
        source: KernelError,
    },

    #[error("task {task:#x} has no user address space")]
    NoMm { task: u64 },
}

/// A kernel task, the unit the kernel schedules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub addr: u64,
    pub pid: i32,
    pub tgid: i32,
    pub mm: u64,
}

impl Task {
    pub fn load(kernel: &Kernel, addr: u64) -> Result<Task, TaskError> {
        let read = |field| {
            kernel
                .read_field_uint(addr, field)
                .map_err(|source| TaskError::Read { task: addr, source })
        };

        let task = Task {
            addr,
            pid: read(Field::TaskStructPid)? as i32,
            tgid: read(Field::TaskStructTgid)? as i32,
            mm: read(Field::TaskStructMm)?,
        };
        trace!("loaded task {:x?}", task);
        Ok(task)
    }

    pub fn is_group_leader(&self) -> bool {
        self.pid == self.tgid
    }

    /// Kernel stack of the task
    pub fn stack(&self, kernel: &Kernel) -> Result<u64, KernelError> {
        kernel.read_field_u64(self.addr, Field::TaskStructStack)
    }

    /// Thread struct embedded in the task
    pub fn thread_struct(&self, kernel: &Kernel) -> Result<u64, KernelError> {
        Ok(kernel.field_addr(self.addr, Field::TaskStructThread)?)
    }
}

/// Every thread of the thread group of `task`, with `task` itself first.
///
/// A broken or looping list ends the walk; the threads found before the
/// break are still returned.
pub fn thread_group(kernel: &Kernel, task: &Task, verbosity: &Verbosity) -> Vec<Task> {
    let mut threads = vec![task.clone()];
    let list_offset = match kernel.fields.resolve(Field::TaskStructThreadGroup) {
        Ok(offset) => offset,
        Err(_) => {
            debug!("no task_struct.thread_group, dumping a single thread");
            return threads;
        }
    };

    let head = task.addr.wrapping_add(list_offset);
    let mut seen = HashSet::from([head]);
    let mut link = head;
    loop {
        let next = match kernel.mem.read_u64(link) {
            Ok(next) => next,
            Err(e) => {
                nonquietf!(
                    verbosity,
                    "thread list of task {:#x} broken at {:#x}: {}",
                    task.addr,
                    link,
                    e
                );
                break;
            }
        };
        if next == head {
            break;
        }
        if !seen.insert(next) {
            nonquietf!(
                verbosity,
                "thread list of task {:#x} loops at {:#x}",
                task.addr,
                next
            );
            break;
        }
        if threads.len() >= MAX_THREADS {
            nonquietf!(
                verbosity,
                "thread group of task {:#x} exceeds {} threads",
                task.addr,
                MAX_THREADS
            );
            break;
        }
        match Task::load(kernel, next.wrapping_sub(list_offset)) {
            Ok(thread) => {
                trace!("thread group member {} at {:#x}", thread.pid, thread.addr);
                threads.push(thread);
            }
            Err(e) => {
                nonquietf!(verbosity, "skipping the rest of the thread group: {}", e);
                break;
            }
        }
        link = next;
    }

    threads
}

/// Process wide identifiers shared by all threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessIds {
    pub ppid: i32,
    pub pgrp: i32,
    pub sid: i32,
}

impl ProcessIds {
    pub fn load(kernel: &Kernel, task: &Task, verbosity: &Verbosity) -> Self {
        let ppid = kernel
            .read_field_u64(task.addr, Field::TaskStructRealParent)
            .and_then(|parent| kernel.read_field_uint(parent, Field::TaskStructTgid));
        ProcessIds {
            ppid: or_zero(ppid, "parent pid", verbosity) as i32,
            pgrp: or_zero(
                group_pid(kernel, task, kernel.params.pidtype_pgid, Field::SignalStructPgrp),
                "process group",
                verbosity,
            ) as i32,
            sid: or_zero(
                group_pid(kernel, task, kernel.params.pidtype_sid, Field::SignalStructSession),
                "session",
                verbosity,
            ) as i32,
        }
    }
}

/// Global number of the process group or session of `task`.
///
/// Newer kernels keep these as `struct pid` references, either in
/// `signal_struct.pids` or in the leader's `task_struct.pids` links; the
/// oldest ones keep plain numbers in `signal_struct`.
fn group_pid(
    kernel: &Kernel,
    task: &Task,
    pid_type: u64,
    legacy: Field,
) -> Result<u64, KernelError> {
    let fields = kernel.fields;
    let signal = kernel.read_field_u64(task.addr, Field::TaskStructSignal)?;

    let pid = if fields.is_present(Field::SignalStructPids) {
        let pids = kernel.field_addr(signal, Field::SignalStructPids)?;
        kernel.mem.read_u64(array_entry(pids, pid_type, 8)?)?
    } else if fields.is_present(Field::TaskStructPids) {
        let leader = kernel.read_field_u64(task.addr, Field::TaskStructGroupLeader)?;
        let link_size = fields.resolve_size(Size::PidLink)?;
        let pids = kernel.field_addr(leader, Field::TaskStructPids)?;
        kernel.read_field_u64(array_entry(pids, pid_type, link_size)?, Field::PidLinkPid)?
    } else {
        return kernel.read_field_uint(signal, legacy);
    };

    if pid == 0 {
        return Ok(0);
    }
    pid_nr(kernel, pid)
}

/// Address of entry `index` of an array of `size` byte entries at `base`.
fn array_entry(base: u64, index: u64, size: u64) -> Result<u64, KernelError> {
    index
        .checked_mul(size)
        .and_then(|offset| base.checked_add(offset))
        .ok_or(KernelError::Memory(MemoryError::Unmapped { vaddr: base }))
}

/// Number of a `struct pid` in the initial namespace.
fn pid_nr(kernel: &Kernel, pid: u64) -> Result<u64, KernelError> {
    let numbers = kernel.field_addr(pid, Field::PidNumbers)?;
    kernel.read_field_uint(numbers, Field::UpidNr)
}

/// Real user and group id of the task.
fn credentials(kernel: &Kernel, task: &Task) -> Result<(u32, u32), KernelError> {
    if kernel.fields.is_present(Field::TaskStructCred) {
        let cred = kernel.read_field_u64(task.addr, Field::TaskStructCred)?;
        Ok((
            kernel.read_field_uint(cred, Field::CredUid)? as u32,
            kernel.read_field_uint(cred, Field::CredGid)? as u32,
        ))
    } else {
        Ok((
            kernel.read_field_uint(task.addr, Field::TaskStructUid)? as u32,
            kernel.read_field_uint(task.addr, Field::TaskStructGid)? as u32,
        ))
    }
}

/// Convert a kernel cputime value to nanoseconds.
fn cputime_to_nanos(kernel: &Kernel, cputime: u64) -> u64 {
    if kernel.params.cputime_nsec {
        return cputime;
    }
    let hz = kernel.params.hz;
    let tick_nsec = (1_000_000_000 + hz / 2) / hz;
    cputime.saturating_mul(tick_nsec)
}

fn task_cputime(kernel: &Kernel, task: &Task) -> Result<(u64, u64), KernelError> {
    Ok((
        kernel.read_field_u64(task.addr, Field::TaskStructUtime)?,
        kernel.read_field_u64(task.addr, Field::TaskStructStime)?,
    ))
}

/// User and system time of a thread, or of the whole group for its leader.
fn cputime(kernel: &Kernel, task: &Task, group: &[Task]) -> Result<(u64, u64), KernelError> {
    if !task.is_group_leader() {
        return task_cputime(kernel, task);
    }

    // exited threads are accounted in the signal struct
    let signal = kernel.read_field_u64(task.addr, Field::TaskStructSignal)?;
    let mut utime = kernel.read_field_u64(signal, Field::SignalStructUtime)?;
    let mut stime = kernel.read_field_u64(signal, Field::SignalStructStime)?;
    for thread in group {
        let (u, s) = task_cputime(kernel, thread)?;
        utime = utime.wrapping_add(u);
        stime = stime.wrapping_add(s);
    }
    Ok((utime, stime))
}

fn children_cputime(kernel: &Kernel, task: &Task) -> Result<(u64, u64), KernelError> {
    let signal = kernel.read_field_u64(task.addr, Field::TaskStructSignal)?;
    Ok((
        kernel.read_field_u64(signal, Field::SignalStructCutime)?,
        kernel.read_field_u64(signal, Field::SignalStructCstime)?,
    ))
}

fn or_zero<T: Default>(result: Result<T, KernelError>, what: &str, verbosity: &Verbosity) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            nonquietf!(verbosity, "unable to read {}: {}", what, e);
            T::default()
        }
    }
}

/// Fill everything in NT_PRSTATUS but the registers.
pub fn fill_prstatus(
    kernel: &Kernel,
    task: &Task,
    group: &[Task],
    ids: &ProcessIds,
    verbosity: &Verbosity,
) -> Prstatus {
    let pending = kernel
        .field_addr(task.addr, Field::TaskStructPending)
        .map_err(KernelError::from)
        .and_then(|pending| kernel.read_field_u64(pending, Field::SigpendingSignal));
    let blocked = kernel.read_field_u64(task.addr, Field::TaskStructBlocked);

    let (utime, stime) = or_zero(cputime(kernel, task, group), "cputime", verbosity);
    let (cutime, cstime) = or_zero(children_cputime(kernel, task), "children cputime", verbosity);

    Prstatus {
        pr_sigpend: or_zero(pending, "pending signals", verbosity),
        pr_sighold: or_zero(blocked, "blocked signals", verbosity),
        pr_pid: task.pid,
        pr_ppid: ids.ppid,
        pr_pgrp: ids.pgrp,
        pr_sid: ids.sid,
        pr_utime: ElfTimeval::from_nanos(cputime_to_nanos(kernel, utime)),
        pr_stime: ElfTimeval::from_nanos(cputime_to_nanos(kernel, stime)),
        pr_cutime: ElfTimeval::from_nanos(cputime_to_nanos(kernel, cutime)),
        pr_cstime: ElfTimeval::from_nanos(cputime_to_nanos(kernel, cstime)),
        ..Default::default()
    }
}

/// Single letter state, from the lowest set bit of the task state.
fn state_index(state: u64) -> u8 {
    if state == 0 {
        0
    } else {
        state.trailing_zeros() as u8 + 1
    }
}

fn state_letter(index: u8) -> u8 {
    b"RSDTZW".get(index as usize).copied().unwrap_or(b'.')
}

/// Command line of the process as the kernel shows it in a core file.
fn psargs(kernel: &Kernel, user: &UserSpace, task: &Task) -> Result<[u8; ELF_PRARGSZ], KernelError> {
    let mut psargs = [0_u8; ELF_PRARGSZ];
    let start = kernel.read_field_u64(task.mm, Field::MmStructArgStart)?;
    let end = kernel.read_field_u64(task.mm, Field::MmStructArgEnd)?;

    let len = (end.saturating_sub(start) as usize).min(ELF_PRARGSZ - 1);
    user.read_user(start, &mut psargs[..len])?;
    for byte in psargs[..len].iter_mut() {
        if *byte == 0 {
            *byte = b' ';
        }
    }
    Ok(psargs)
}

/// Build NT_PRPSINFO for the process led by `leader`.
pub fn fill_psinfo(
    kernel: &Kernel,
    user: &UserSpace,
    leader: &Task,
    ids: &ProcessIds,
    verbosity: &Verbosity,
) -> Prpsinfo {
    let state = or_zero(
        kernel.read_field_uint(leader.addr, Field::TaskStructState),
        "task state",
        verbosity,
    );
    let index = state_index(state);
    let sname = state_letter(index);

    let static_prio = or_zero(
        kernel.read_field_uint(leader.addr, Field::TaskStructStaticPrio),
        "static priority",
        verbosity,
    );
    let (uid, gid) = or_zero(credentials(kernel, leader), "credentials", verbosity);

    let mut psinfo = Prpsinfo {
        pr_state: index,
        pr_sname: sname,
        pr_zomb: (sname == b'Z') as u8,
        pr_nice: (static_prio as i64 - NICE_BASE_PRIO) as i8,
        pr_flag: or_zero(
            kernel.read_field_uint(leader.addr, Field::TaskStructFlags),
            "task flags",
            verbosity,
        ),
        pr_uid: uid,
        pr_gid: gid,
        pr_pid: leader.pid,
        pr_ppid: ids.ppid,
        pr_pgrp: ids.pgrp,
        pr_sid: ids.sid,
        ..Default::default()
    };

    let comm = kernel.read_field_bytes(leader.addr, Field::TaskStructComm, TASK_COMM_LEN);
    psinfo.pr_fname = or_zero(
        comm.map(|bytes| {
            let mut fname = [0; TASK_COMM_LEN];
            fname.copy_from_slice(&bytes);
            fname[TASK_COMM_LEN - 1] = 0;
            fname
        }),
        "command name",
        verbosity,
    );

    match psargs(kernel, user, leader) {
        Ok(args) => psinfo.pr_psargs = args,
        Err(e) => nonquietf!(verbosity, "unable to read arguments: {}", e),
    }

    psinfo
}

/// Saved auxiliary vector, up to and including its AT_NULL entry.
pub fn read_auxv(kernel: &Kernel, task: &Task) -> Result<Vec<u8>, KernelError> {
    let size = kernel
        .fields
        .member_size(Field::MmStructSavedAuxv)
        .unwrap_or(AT_VECTOR_SIZE * 8);
    let mut auxv = kernel.read_field_bytes(task.mm, Field::MmStructSavedAuxv, size as usize)?;

    let end = auxv
        .chunks_exact(16)
        .position(|entry| entry[..8] == AT_NULL.to_le_bytes())
        .map(|idx| (idx + 1) * 16)
        .unwrap_or(auxv.len() / 16 * 16);
    auxv.truncate(end);
    Ok(auxv)
}
