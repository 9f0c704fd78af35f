// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! x86_64 register sets.
//!
//! The user mode registers of a sleeping thread are the `pt_regs` frame at
//! the top of its kernel stack; segment bases and selectors live in its
//! `thread_struct`. FPU state lives in memory the kernel layout has moved
//! around a few times, hence the chain of lookups in [`fpu_area`].

use log::trace;

use crate::byte_helpers::{u64_at, user_regs_to_bytes};
use crate::fields::{Field, FieldError, Size};
use crate::kernel::{Kernel, KernelError};
use crate::linux::{UserRegs, NT_386_IOPERM, NT_PRFPREG, NT_PRSTATUS, NT_X86_XSTATE};
use crate::snapshot::MemoryError;
use crate::regset::{
    FetchError, Machine, NoteSize, RegsetDescriptor, RegsetView, ThreadCoreInfo,
};
use crate::task::Task;
use crate::write_elf::{NOTE_NAME_CORE, NOTE_NAME_LINUX};

/// Size of `struct user_regs_struct`.
const USER_REGS_SIZE: usize = 216;
/// Size of the FXSAVE area, `struct user_i387_struct`.
const FXSAVE_SIZE: usize = 512;
/// Size of the I/O permission bitmap.
const IO_BITMAP_BYTES: usize = 65536 / 8;

/// Software reserved bytes of the FXSAVE area where the kernel exports XCR0.
const XSTATE_XCR0_OFFSET: usize = 464;
/// `xstate_bv` of the XSAVE header.
const XSTATE_BV_OFFSET: usize = 512;

const PT_REGS_ORDER: [Field; 21] = [
    Field::PtRegsR15,
    Field::PtRegsR14,
    Field::PtRegsR13,
    Field::PtRegsR12,
    Field::PtRegsBp,
    Field::PtRegsBx,
    Field::PtRegsR11,
    Field::PtRegsR10,
    Field::PtRegsR9,
    Field::PtRegsR8,
    Field::PtRegsAx,
    Field::PtRegsCx,
    Field::PtRegsDx,
    Field::PtRegsSi,
    Field::PtRegsDi,
    Field::PtRegsOrigAx,
    Field::PtRegsIp,
    Field::PtRegsCs,
    Field::PtRegsFlags,
    Field::PtRegsSp,
    Field::PtRegsSs,
];

static X86_64_REGSETS: [RegsetDescriptor; 4] = [GENERAL, FP, XSTATE, IOPERM];
static X86_64_LEGACY_REGSETS: [RegsetDescriptor; 2] = [GENERAL, FP];

const GENERAL: RegsetDescriptor = RegsetDescriptor {
    name: "general registers",
    note_name: NOTE_NAME_CORE,
    note_type: NT_PRSTATUS,
    size: NoteSize::Fixed(USER_REGS_SIZE),
    fetch: fetch_general,
    active: always_active,
    writeback: None,
    post_process: Some(general_to_prstatus),
};

const FP: RegsetDescriptor = RegsetDescriptor {
    name: "floating point registers",
    note_name: NOTE_NAME_CORE,
    note_type: NT_PRFPREG,
    size: NoteSize::Fixed(FXSAVE_SIZE),
    fetch: fetch_fxsave,
    active: fpu_active,
    writeback: None,
    post_process: Some(mark_fpvalid),
};

const XSTATE: RegsetDescriptor = RegsetDescriptor {
    name: "extended state",
    note_name: NOTE_NAME_LINUX,
    note_type: NT_X86_XSTATE,
    size: NoteSize::Slot(Size::XstateArea),
    fetch: fetch_xstate,
    active: xstate_active,
    writeback: None,
    post_process: None,
};

const IOPERM: RegsetDescriptor = RegsetDescriptor {
    name: "io permission bitmap",
    note_name: NOTE_NAME_LINUX,
    note_type: NT_386_IOPERM,
    size: NoteSize::Fixed(IO_BITMAP_BYTES),
    fetch: fetch_ioperm,
    active: ioperm_active,
    writeback: None,
    post_process: None,
};

pub static X86_64_VIEW: RegsetView = RegsetView {
    name: "x86_64",
    machine: Machine::X86_64,
    regsets: &X86_64_REGSETS,
    e_machine: Machine::X86_64.e_machine(),
    e_flags: 0,
    ei_osabi: elf::abi::ELFOSABI_NONE as u8,
};

/// For kernels without XSAVE support.
pub static X86_64_LEGACY_VIEW: RegsetView = RegsetView {
    name: "x86_64-legacy",
    machine: Machine::X86_64,
    regsets: &X86_64_LEGACY_REGSETS,
    e_machine: Machine::X86_64.e_machine(),
    e_flags: 0,
    ei_osabi: elf::abi::ELFOSABI_NONE as u8,
};

fn always_active(_kernel: &Kernel, _task: &Task) -> bool {
    true
}

/// Address of the user register frame saved on the kernel stack.
fn task_pt_regs(kernel: &Kernel, task: &Task) -> Result<u64, KernelError> {
    let stack = task.stack(kernel)?;
    let thread_size = kernel.fields.resolve_size(Size::ThreadSize)?;
    let pt_regs_size = kernel.fields.resolve_size(Size::PtRegs)?;
    stack
        .checked_add(thread_size)
        .and_then(|top| top.checked_sub(pt_regs_size))
        .ok_or(KernelError::Memory(MemoryError::Unmapped { vaddr: stack }))
}

fn fetch_general(kernel: &Kernel, task: &Task, size: usize) -> Result<Vec<u8>, FetchError> {
    let regs_addr = task_pt_regs(kernel, task)?;
    trace!("thread {} pt_regs at {:#x}", task.pid, regs_addr);

    let mut frame = [0_u64; PT_REGS_ORDER.len()];
    for (slot, field) in frame.iter_mut().zip(PT_REGS_ORDER) {
        *slot = kernel.read_field_u64(regs_addr, field)?;
    }
    let [r15, r14, r13, r12, rbp, rbx, r11, r10, r9, r8, rax, rcx, rdx, rsi, rdi, orig_rax, rip, cs, eflags, rsp, ss] =
        frame;

    let thread = task.thread_struct(kernel)?;
    let fs = kernel.read_optional_uint(thread, Field::ThreadStructFsindex)?;
    let gs = kernel.read_optional_uint(thread, Field::ThreadStructGsindex)?;

    let regs = UserRegs {
        r15,
        r14,
        r13,
        r12,
        rbp,
        rbx,
        r11,
        r10,
        r9,
        r8,
        rax,
        rcx,
        rdx,
        rsi,
        rdi,
        orig_rax,
        rip,
        cs,
        eflags,
        rsp,
        ss,
        fs_base: kernel.read_optional_uint(thread, Field::ThreadStructFsbase)?,
        gs_base: kernel.read_optional_uint(thread, Field::ThreadStructGsbase)?,
        ds: kernel.read_optional_uint(thread, Field::ThreadStructDs)?,
        es: kernel.read_optional_uint(thread, Field::ThreadStructEs)?,
        fs,
        gs,
    };

    let mut bytes = user_regs_to_bytes(&regs).to_vec();
    bytes.truncate(size);
    Ok(bytes)
}

fn general_to_prstatus(info: &mut ThreadCoreInfo, regset: &RegsetDescriptor) {
    let regs = info
        .note(regset.note_type)
        .and_then(|note| UserRegs::from_bytes(&note.description));
    if let Some(regs) = regs {
        info.prstatus.pr_reg = regs;
    }
}

/// Address of the FXSAVE area of the thread.
fn fpu_area(kernel: &Kernel, task: &Task) -> Result<u64, KernelError> {
    let fields = kernel.fields;
    let thread = task.thread_struct(kernel)?;

    if fields.is_present(Field::ThreadStructFpu) {
        let fpu = kernel.field_addr(thread, Field::ThreadStructFpu)?;
        if fields.is_present(Field::FpuFpstate) {
            let fpstate = kernel.read_field_u64(fpu, Field::FpuFpstate)?;
            return Ok(kernel.field_addr(fpstate, Field::FpstateRegs)?);
        }
        // a pointer before the state was embedded in struct fpu
        if fields.member_size(Field::FpuState) == Ok(8) {
            return kernel.read_field_u64(fpu, Field::FpuState);
        }
        return Ok(kernel.field_addr(fpu, Field::FpuState)?);
    }

    if fields.is_present(Field::ThreadStructXstate) {
        return kernel.read_field_u64(thread, Field::ThreadStructXstate);
    }

    if fields.is_present(Field::ThreadStructI387) {
        return Ok(kernel.field_addr(thread, Field::ThreadStructI387)?);
    }

    Err(FieldError::Missing {
        field: Field::ThreadStructFpu,
    }
    .into())
}

fn fpu_active(kernel: &Kernel, task: &Task) -> bool {
    let fields = kernel.fields;
    let active = if fields.is_present(Field::TaskStructUsedMath) {
        kernel
            .read_field_uint(task.addr, Field::TaskStructUsedMath)
            .map(|used| used != 0)
    } else if fields.is_present(Field::FpuFpstateActive) {
        task.thread_struct(kernel)
            .and_then(|thread| Ok(kernel.field_addr(thread, Field::ThreadStructFpu)?))
            .and_then(|fpu| kernel.read_field_uint(fpu, Field::FpuFpstateActive))
            .map(|active| active != 0)
    } else if fields.is_present(Field::FpuFpstate) {
        // every user thread has FPU state
        Ok(true)
    } else {
        Ok(task.mm != 0)
    };
    active.unwrap_or(false)
}

fn fetch_fxsave(kernel: &Kernel, task: &Task, size: usize) -> Result<Vec<u8>, FetchError> {
    let area = fpu_area(kernel, task)?;
    trace!("thread {} fpu state at {:#x}", task.pid, area);
    Ok(kernel.mem.read_kernel_vec(area, size)?)
}

fn mark_fpvalid(info: &mut ThreadCoreInfo, _regset: &RegsetDescriptor) {
    info.prstatus.pr_fpvalid = 1;
}

fn xstate_active(kernel: &Kernel, task: &Task) -> bool {
    kernel.fields.resolve_size(Size::XstateArea).is_ok() && fpu_active(kernel, task)
}

fn fetch_xstate(kernel: &Kernel, task: &Task, size: usize) -> Result<Vec<u8>, FetchError> {
    let area = fpu_area(kernel, task)?;
    let mut bytes = kernel.mem.read_kernel_vec(area, size)?;

    // the kernel reports the enabled features where user space expects them
    let xcr0 = kernel
        .params
        .xfeatures_mask
        .or_else(|| u64_at(&bytes, XSTATE_BV_OFFSET));
    if let (Some(xcr0), Some(slot)) = (
        xcr0,
        bytes.get_mut(XSTATE_XCR0_OFFSET..XSTATE_XCR0_OFFSET + 8),
    ) {
        slot.copy_from_slice(&xcr0.to_le_bytes());
    }

    Ok(bytes)
}

fn ioperm_active(kernel: &Kernel, task: &Task) -> bool {
    if !kernel.fields.is_present(Field::ThreadStructIoBitmapPtr) {
        return false;
    }
    task.thread_struct(kernel)
        .and_then(|thread| kernel.read_optional_uint(thread, Field::ThreadStructIoBitmapMax))
        .map_or(false, |max| max != 0)
}

fn fetch_ioperm(kernel: &Kernel, task: &Task, size: usize) -> Result<Vec<u8>, FetchError> {
    let thread = task.thread_struct(kernel)?;
    let bitmap = kernel.read_field_u64(thread, Field::ThreadStructIoBitmapPtr)?;
    if bitmap == 0 {
        return Err(FetchError::Memory(MemoryError::Unmapped {
            vaddr: bitmap,
        }));
    }
    Ok(kernel.mem.read_kernel_vec(bitmap, size)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldTable;
    use crate::kernel::KernelParams;
    use crate::layout::Layout;
    use crate::snapshot::{BufferMemory, DirectMap, KernelMemory};

    const PAGE_OFFSET: u64 = 0xffff_8880_0000_0000;
    const TASK: u64 = 0x1000;
    const STACK: u64 = 0x4000;
    const FPSTATE: u64 = 0x2000;
    const WRAPPING_TASK: u64 = 0x3000;

    const LAYOUT: &str = "\
        arch x86_64\n\
        const THREAD_SIZE 0x4000\n\
        const XSTATE_SIZE 576\n\
        struct pt_regs 168\n\
        member task_struct stack 0x8 8\n\
        member task_struct pid 0x10 4\n\
        member task_struct tgid 0x14 4\n\
        member task_struct mm 0x18 8\n\
        member task_struct thread 0x100 0x80\n\
        member thread_struct fsbase 0x10 8\n\
        member thread_struct gsbase 0x18 8\n\
        member thread_struct fsindex 0x20 2\n\
        member thread_struct fpu 0x40 0x40\n\
        member fpu fpstate 0x8 8\n\
        member fpstate regs 0x40 576\n\
        member pt_regs r15 0 8\n\
        member pt_regs r14 8 8\n\
        member pt_regs r13 16 8\n\
        member pt_regs r12 24 8\n\
        member pt_regs bp 32 8\n\
        member pt_regs bx 40 8\n\
        member pt_regs r11 48 8\n\
        member pt_regs r10 56 8\n\
        member pt_regs r9 64 8\n\
        member pt_regs r8 72 8\n\
        member pt_regs ax 80 8\n\
        member pt_regs cx 88 8\n\
        member pt_regs dx 96 8\n\
        member pt_regs si 104 8\n\
        member pt_regs di 112 8\n\
        member pt_regs orig_ax 120 8\n\
        member pt_regs ip 128 8\n\
        member pt_regs cs 136 8\n\
        member pt_regs flags 144 8\n\
        member pt_regs sp 152 8\n\
        member pt_regs ss 160 8\n";

    fn put_u64(bytes: &mut [u8], at: u64, value: u64) {
        bytes[at as usize..at as usize + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn image() -> BufferMemory {
        let mut bytes = vec![0_u8; 0x10000];
        put_u64(&mut bytes, TASK + 0x8, PAGE_OFFSET + STACK);
        put_u64(&mut bytes, TASK + 0x18, PAGE_OFFSET + 0x9000);
        // thread_struct
        put_u64(&mut bytes, TASK + 0x100 + 0x10, 0x7f00_0000_1000);
        put_u64(&mut bytes, TASK + 0x100 + 0x20, 0x2b);
        put_u64(&mut bytes, TASK + 0x100 + 0x40 + 0x8, PAGE_OFFSET + FPSTATE);
        // pt_regs at the top of the stack
        let regs = STACK + 0x4000 - 168;
        put_u64(&mut bytes, regs + 80, 0x3c);
        put_u64(&mut bytes, regs + 128, 0x40_0123);
        put_u64(&mut bytes, regs + 152, 0x7ffc_0000_0000);
        // fxsave area and xstate_bv
        bytes[(FPSTATE + 0x40) as usize] = 0x7f;
        put_u64(&mut bytes, FPSTATE + 0x40 + 512, 0x7);
        // stack whose top lies past the end of the address space
        put_u64(&mut bytes, WRAPPING_TASK + 0x8, 0xffff_ffff_ffff_e000);
        BufferMemory::new(bytes)
    }

    fn with_kernel(check: impl FnOnce(&Kernel, &Task)) {
        let layout = Layout::parse(LAYOUT.lines().map(|l| Ok(l.trim().to_string()))).unwrap();
        let fields = FieldTable::populate(&layout);
        let phys = image();
        let mem = KernelMemory::new(&phys, Box::new(DirectMap::new(PAGE_OFFSET)));
        let kernel = Kernel::new(mem, &fields, KernelParams::from_type_info(&layout));
        let task = Task {
            addr: PAGE_OFFSET + TASK,
            pid: 1234,
            tgid: 1234,
            mm: PAGE_OFFSET + 0x9000,
        };
        check(&kernel, &task);
    }

    #[test]
    fn general_registers_from_stack_frame() {
        with_kernel(|kernel, task| {
            let bytes = GENERAL.collect(kernel, task).unwrap();
            let regs = UserRegs::from_bytes(&bytes).unwrap();
            assert_eq!(0x40_0123, regs.rip);
            assert_eq!(0x3c, regs.rax);
            assert_eq!(0x7ffc_0000_0000, regs.rsp);
            assert_eq!(0x7f00_0000_1000, regs.fs_base);
            assert_eq!(0x2b, regs.fs);
            // not in this layout
            assert_eq!(0, regs.gs);
            assert_eq!(0, regs.ds);
        });
    }

    #[test]
    fn fpu_state_through_fpstate_pointer() {
        with_kernel(|kernel, task| {
            assert!(fpu_active(kernel, task));
            let bytes = FP.collect(kernel, task).unwrap();
            assert_eq!(512, bytes.len());
            assert_eq!(0x7f, bytes[0]);
        });
    }

    #[test]
    fn xstate_exports_features() {
        with_kernel(|kernel, task| {
            assert!(xstate_active(kernel, task));
            let bytes = XSTATE.collect(kernel, task).unwrap();
            assert_eq!(576, bytes.len());
            assert_eq!(Some(7), u64_at(&bytes, XSTATE_XCR0_OFFSET));
        });
    }

    #[test]
    fn stack_at_address_space_end_is_an_error() {
        with_kernel(|kernel, task| {
            let wrapping = Task {
                addr: PAGE_OFFSET + WRAPPING_TASK,
                ..task.clone()
            };
            assert!(task_pt_regs(kernel, &wrapping).is_err());
            assert!(GENERAL.collect(kernel, &wrapping).is_err());
        });
    }

    #[test]
    fn ioperm_inactive_without_bitmap() {
        with_kernel(|kernel, task| {
            assert!(!ioperm_active(kernel, task));
        });
    }

    #[test]
    fn view_order_and_header_values() {
        let types: Vec<u32> = X86_64_VIEW.regsets.iter().map(|r| r.note_type).collect();
        assert_eq!(vec![NT_PRSTATUS, NT_PRFPREG, NT_X86_XSTATE, NT_386_IOPERM], types);
        assert_eq!(62, X86_64_VIEW.e_machine);
        assert_eq!(2, X86_64_LEGACY_VIEW.regsets.len());
    }
}
