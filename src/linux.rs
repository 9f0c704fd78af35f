// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Core file note structures of the x86_64 Linux ABI.
//!
//! These mirror `struct elf_prstatus` and `struct elf_prpsinfo` as the
//! kernel writes them, with every padding byte spelled out so the structs
//! can be written to the core file as they sit in memory.
//!
//! There is no formal documentation for the core file data structure, it is
//! only verifiable by comparing to output from gdb.

use crate::byte_helpers::{prpsinfo_to_bytes, prstatus_to_bytes};

// Note types
pub const NT_PRSTATUS: u32 = 1;
pub const NT_PRFPREG: u32 = 2;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;
pub const NT_FILE: u32 = 0x4649_4c45;
pub const NT_386_IOPERM: u32 = 0x201;
pub const NT_X86_XSTATE: u32 = 0x202;

// typedef struct elf_siginfo {    /* Information about signal (unused)         */
//   int32_t si_signo;             /* Signal number                             */
//   int32_t si_code;              /* Extra code                                */
//   int32_t si_errno;             /* Errno                                     */
// } elf_siginfo;
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ElfSiginfo {
    pub si_signo: i32,
    pub si_code: i32,
    pub si_errno: i32,
}

// typedef struct elf_timeval {    /* Time value with microsecond resolution    */
//   long tv_sec;                  /* Seconds                                   */
//   long tv_usec;                 /* Microseconds                              */
// } elf_timeval;
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ElfTimeval {
    pub tv_sec: i64,
    pub tv_usec: i64,
}

impl ElfTimeval {
    pub fn from_nanos(nanos: u64) -> Self {
        const NANOS_PER_SEC: u64 = 1_000_000_000;
        ElfTimeval {
            tv_sec: (nanos / NANOS_PER_SEC) as i64,
            tv_usec: ((nanos % NANOS_PER_SEC) / 1000) as i64,
        }
    }
}

// struct user_regs_struct, the general register block of NT_PRSTATUS
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl UserRegs {
    /// Rebuild the register block from its note bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != std::mem::size_of::<UserRegs>() {
            return None;
        }
        let mut words = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]));
        let mut next = || words.next().unwrap_or(0);
        Some(UserRegs {
            r15: next(),
            r14: next(),
            r13: next(),
            r12: next(),
            rbp: next(),
            rbx: next(),
            r11: next(),
            r10: next(),
            r9: next(),
            r8: next(),
            rax: next(),
            rcx: next(),
            rdx: next(),
            rsi: next(),
            rdi: next(),
            orig_rax: next(),
            rip: next(),
            cs: next(),
            eflags: next(),
            rsp: next(),
            ss: next(),
            fs_base: next(),
            gs_base: next(),
            ds: next(),
            es: next(),
            fs: next(),
            gs: next(),
        })
    }
}

// typedef struct prstatus {       /* Information about thread; includes CPU reg*/
//   elf_siginfo    pr_info;       /* Info associated with signal               */
//   uint32_t       pr_cursig;     /* Current signal                            */
//   unsigned long  pr_sigpend;    /* Set of pending signals                    */
//   unsigned long  pr_sighold;    /* Set of held signals                       */
//   pid_t          pr_pid;        /* Process ID                                */
//   pid_t          pr_ppid;       /* Parent's process ID                       */
//   pid_t          pr_pgrp;       /* Group ID                                  */
//   pid_t          pr_sid;        /* Session ID                                */
//   elf_timeval    pr_utime;      /* User time                                 */
//   elf_timeval    pr_stime;      /* System time                               */
//   elf_timeval    pr_cutime;     /* Cumulative user time                      */
//   elf_timeval    pr_cstime;     /* Cumulative system time                    */
//   regs           pr_reg;        /* CPU registers                             */
//   uint32_t       pr_fpvalid;    /* True if math co-processor being used      */
// } prstatus;
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Prstatus {
    pub pr_info: ElfSiginfo,
    pub pr_cursig: u32,
    pub pr_sigpend: u64,
    pub pr_sighold: u64,
    pub pr_pid: i32,
    pub pr_ppid: i32,
    pub pr_pgrp: i32,
    pub pr_sid: i32,
    pub pr_utime: ElfTimeval,
    pub pr_stime: ElfTimeval,
    pub pr_cutime: ElfTimeval,
    pub pr_cstime: ElfTimeval,
    pub pr_reg: UserRegs,
    pub pr_fpvalid: u32,
    pub _pad: u32,
}

impl Prstatus {
    pub fn to_bytes(&self) -> Vec<u8> {
        prstatus_to_bytes(self).to_vec()
    }
}

// typedef struct prpsinfo {       /* Information about process                 */
//   unsigned char  pr_state;      /* Numeric process state                     */
//   char           pr_sname;      /* Char for pr_state                         */
//   unsigned char  pr_zomb;       /* Zombie                                    */
//   signed char    pr_nice;       /* Nice val                                  */
//   unsigned long  pr_flag;       /* Flags                                     */
//   uint32_t       pr_uid;        /* User ID                                   */
//   uint32_t       pr_gid;        /* Group ID                                  */
//   pid_t          pr_pid;        /* Process ID                                */
//   pid_t          pr_ppid;       /* Parent's process ID                       */
//   pid_t          pr_pgrp;       /* Group ID                                  */
//   pid_t          pr_sid;        /* Session ID                                */
//   char           pr_fname[16];  /* Filename of executable                    */
//   char           pr_psargs[80]; /* Initial part of arg list                  */
// } prpsinfo;
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Prpsinfo {
    pub pr_state: u8,
    pub pr_sname: u8,
    pub pr_zomb: u8,
    pub pr_nice: i8,
    pub _pad: [u8; 4],
    pub pr_flag: u64,
    pub pr_uid: u32,
    pub pr_gid: u32,
    pub pr_pid: i32,
    pub pr_ppid: i32,
    pub pr_pgrp: i32,
    pub pr_sid: i32,
    pub pr_fname: [u8; 16],
    pub pr_psargs: [u8; 80],
}

impl Default for Prpsinfo {
    fn default() -> Self {
        Prpsinfo {
            pr_state: 0,
            pr_sname: 0,
            pr_zomb: 0,
            pr_nice: 0,
            _pad: [0; 4],
            pr_flag: 0,
            pr_uid: 0,
            pr_gid: 0,
            pr_pid: 0,
            pr_ppid: 0,
            pr_pgrp: 0,
            pr_sid: 0,
            pr_fname: [0; 16],
            pr_psargs: [0; 80],
        }
    }
}

impl Prpsinfo {
    pub fn to_bytes(&self) -> Vec<u8> {
        prpsinfo_to_bytes(self).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn structures_match_kernel_sizes() {
        assert_eq!(216, size_of::<UserRegs>());
        assert_eq!(336, size_of::<Prstatus>());
        assert_eq!(136, size_of::<Prpsinfo>());
    }

    #[test]
    fn prstatus_fields_at_kernel_offsets() {
        let mut prstatus = Prstatus {
            pr_pid: 0x1234,
            pr_fpvalid: 1,
            ..Default::default()
        };
        prstatus.pr_reg.rip = 0x40_0123;
        let bytes = prstatus.to_bytes();
        assert_eq!(0x1234_u32.to_le_bytes(), bytes[32..36]);
        assert_eq!(0x40_0123_u64.to_le_bytes(), bytes[240..248]);
        assert_eq!(1_u32.to_le_bytes(), bytes[328..332]);
    }

    #[test]
    fn prpsinfo_fields_at_kernel_offsets() {
        let mut psinfo = Prpsinfo {
            pr_nice: -5,
            pr_flag: 0x40_0100,
            ..Default::default()
        };
        psinfo.pr_fname[..4].copy_from_slice(b"prog");
        let bytes = psinfo.to_bytes();
        assert_eq!(0xfb, bytes[3]);
        assert_eq!(0x40_0100_u64.to_le_bytes(), bytes[8..16]);
        assert_eq!(b"prog", &bytes[40..44]);
    }

    #[test]
    fn timeval_from_nanos() {
        assert_eq!(
            ElfTimeval {
                tv_sec: 3,
                tv_usec: 250_000
            },
            ElfTimeval::from_nanos(3_250_000_999)
        );
    }

    #[test]
    fn user_regs_from_bytes() {
        let mut bytes = vec![0_u8; 216];
        bytes[128..136].copy_from_slice(&0x40_0123_u64.to_le_bytes());
        let regs = UserRegs::from_bytes(&bytes).unwrap();
        assert_eq!(0x40_0123, regs.rip);
        assert!(UserRegs::from_bytes(&bytes[..8]).is_none());
    }
}
