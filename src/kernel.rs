// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Access to kernel data structures of the inspected machine.
//!
//! Couples the snapshot memory with the field table, so callers read
//! "member M of the structure at address A" without knowing its offset.

use log::debug;
use thiserror::Error;

use crate::fields::{Field, FieldError, FieldTable};
use crate::layout::TypeInfo;
use crate::snapshot::{KernelMemory, MemoryError};

/// Default kernel linear map base on x86_64 without KASLR.
const DEFAULT_PAGE_OFFSET: u64 = 0xffff_8880_0000_0000;
const DEFAULT_HZ: u64 = 250;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("kernel structure layout")]
    Field(#[from] FieldError),

    #[error("kernel memory")]
    Memory(#[from] MemoryError),
}

/// `vm_area_struct.vm_flags` bits of the inspected kernel.
///
/// A bit set to 0 by the layout is a flag the kernel does not have.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmFlagLayout {
    pub read: u64,
    pub write: u64,
    pub exec: u64,
    pub shared: u64,
    pub io: u64,
    pub reserved: u64,
    pub hugetlb: u64,
    pub alwaysdump: u64,
}

impl Default for VmFlagLayout {
    fn default() -> Self {
        VmFlagLayout {
            read: 0x1,
            write: 0x2,
            exec: 0x4,
            shared: 0x8,
            io: 0x4000,
            reserved: 0x8_0000,
            hugetlb: 0x40_0000,
            alwaysdump: 0x400_0000,
        }
    }
}

/// Kernel build parameters that are not structure members.
#[derive(Clone, Debug)]
pub struct KernelParams {
    pub page_offset: u64,
    pub hz: u64,
    /// cputime is kept in nanoseconds rather than jiffies
    pub cputime_nsec: bool,
    /// XCR0 features enabled by the kernel, if known
    pub xfeatures_mask: Option<u64>,
    pub pidtype_pgid: u64,
    pub pidtype_sid: u64,
    pub vm: VmFlagLayout,
}

impl KernelParams {
    pub fn from_type_info(info: &impl TypeInfo) -> Self {
        let defaults = VmFlagLayout::default();
        let flag = |name: &str, default: u64| info.constant(name).unwrap_or(default);

        // signal_struct.pids exists once PIDTYPE_TGID was added in between
        let (pgid, sid) = if info.member_offset("signal_struct", "pids").is_some() {
            (2, 3)
        } else {
            (1, 2)
        };

        let params = KernelParams {
            page_offset: info
                .constant("PAGE_OFFSET")
                .unwrap_or(DEFAULT_PAGE_OFFSET),
            hz: info.constant("HZ").filter(|hz| *hz > 0).unwrap_or(DEFAULT_HZ),
            cputime_nsec: info.constant("CPUTIME_NSEC").map_or(false, |v| v != 0),
            xfeatures_mask: info.constant("XFEATURES_MASK"),
            pidtype_pgid: info.constant("PIDTYPE_PGID").unwrap_or(pgid),
            pidtype_sid: info.constant("PIDTYPE_SID").unwrap_or(sid),
            vm: VmFlagLayout {
                read: flag("VM_READ", defaults.read),
                write: flag("VM_WRITE", defaults.write),
                exec: flag("VM_EXEC", defaults.exec),
                shared: flag("VM_SHARED", defaults.shared),
                io: flag("VM_IO", defaults.io),
                reserved: flag("VM_RESERVED", defaults.reserved),
                hugetlb: flag("VM_HUGETLB", defaults.hugetlb),
                alwaysdump: flag("VM_ALWAYSDUMP", defaults.alwaysdump),
            },
        };
        debug!("kernel parameters {:x?}", params);
        params
    }
}

/// The inspected kernel.
pub struct Kernel<'a> {
    pub mem: KernelMemory<'a>,
    pub fields: &'a FieldTable,
    pub params: KernelParams,
}

impl<'a> Kernel<'a> {
    pub fn new(mem: KernelMemory<'a>, fields: &'a FieldTable, params: KernelParams) -> Self {
        Kernel {
            mem,
            fields,
            params,
        }
    }

    /// Address of `field` within the structure at `base`
    pub fn field_addr(&self, base: u64, field: Field) -> Result<u64, FieldError> {
        Ok(base.wrapping_add(self.fields.resolve(field)?))
    }

    pub fn read_field_u64(&self, base: u64, field: Field) -> Result<u64, KernelError> {
        Ok(self.mem.read_u64(self.field_addr(base, field)?)?)
    }

    /// Read an integer member using its own size, 8 bytes if not known.
    pub fn read_field_uint(&self, base: u64, field: Field) -> Result<u64, KernelError> {
        let addr = self.field_addr(base, field)?;
        let size = self.fields.member_size(field).unwrap_or(8).min(8);
        Ok(self.mem.read_uint(addr, size as usize)?)
    }

    pub fn read_field_bytes(
        &self,
        base: u64,
        field: Field,
        len: usize,
    ) -> Result<Vec<u8>, KernelError> {
        Ok(self.mem.read_kernel_vec(self.field_addr(base, field)?, len)?)
    }

    /// Read an integer member, or 0 if this kernel does not have it.
    pub fn read_optional_uint(&self, base: u64, field: Field) -> Result<u64, KernelError> {
        if !self.fields.is_present(field) {
            return Ok(0);
        }
        self.read_field_uint(base, field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::snapshot::{BufferMemory, DirectMap};

    const PAGE_OFFSET: u64 = 0xffff_8880_0000_0000;

    fn layout(lines: &[&str]) -> Layout {
        Layout::parse(lines.iter().map(|l| Ok(l.to_string()))).unwrap()
    }

    #[test]
    fn params_default_to_x86_64_values() {
        let params = KernelParams::from_type_info(&Layout::default());
        assert_eq!(PAGE_OFFSET, params.page_offset);
        assert_eq!(250, params.hz);
        assert!(!params.cputime_nsec);
        assert_eq!(None, params.xfeatures_mask);
        assert_eq!((1, 2), (params.pidtype_pgid, params.pidtype_sid));
        assert_eq!(VmFlagLayout::default(), params.vm);
    }

    #[test]
    fn params_follow_layout() {
        let params = KernelParams::from_type_info(&layout(&[
            "const HZ 1000",
            "const CPUTIME_NSEC 1",
            "const VM_ALWAYSDUMP 0",
            "const XFEATURES_MASK 0x7",
            "member signal_struct pids 0x170 32",
        ]));
        assert_eq!(1000, params.hz);
        assert!(params.cputime_nsec);
        assert_eq!(0, params.vm.alwaysdump);
        assert_eq!(0x40_0000, params.vm.hugetlb);
        assert_eq!(Some(7), params.xfeatures_mask);
        assert_eq!((2, 3), (params.pidtype_pgid, params.pidtype_sid));
    }

    #[test]
    fn reads_members_by_their_size() -> Result<(), KernelError> {
        let layout = layout(&[
            "member task_struct pid 0x10 4",
            "member task_struct stack 0x18 8",
        ]);
        let fields = FieldTable::populate(&layout);

        let mut bytes = vec![0_u8; 0x100];
        bytes[0x10..0x18].copy_from_slice(&0xdead_0000_0000_04d2_u64.to_le_bytes());
        bytes[0x18..0x20].copy_from_slice(&0x1234_u64.to_le_bytes());
        let phys = BufferMemory::new(bytes);
        let mem = KernelMemory::new(&phys, Box::new(DirectMap::new(PAGE_OFFSET)));
        let kernel = Kernel::new(mem, &fields, KernelParams::from_type_info(&layout));

        assert_eq!(1234, kernel.read_field_uint(PAGE_OFFSET, Field::TaskStructPid)?);
        assert_eq!(0x1234, kernel.read_field_u64(PAGE_OFFSET, Field::TaskStructStack)?);
        assert_eq!(0, kernel.read_optional_uint(PAGE_OFFSET, Field::TaskStructTgid)?);
        assert!(matches!(
            kernel.read_field_u64(PAGE_OFFSET, Field::TaskStructMm),
            Err(KernelError::Field(FieldError::Missing { .. }))
        ));
        Ok(())
    }
}
