// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Read memory out of a frozen snapshot of the inspected machine.
//!
//! The snapshot is a raw physical memory image. Kernel virtual addresses are
//! translated either through the kernel's own page tables (when the root
//! table is known) or through the linear direct map; user addresses of the
//! dumped process always go through the process' page tables.
//!
//! Every read can fault: the page is not in the image, or the address is
//! not mapped. Callers recover at the granularity of what they were reading.

use fallible_streaming_iterator::FallibleStreamingIterator;
use log::trace;
use nix::sys::uio::pread;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use thiserror::Error;

use crate::verbose::Verbosity;

/// x86_64 page size, used for user space reads and for ELF alignment.
pub const PAGE_SIZE: u64 = 4096;

// page table entry bits
const PTE_PRESENT: u64 = 1 << 0;
const PTE_PAGE_SIZE: u64 = 1 << 7;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("virtual address {vaddr:#x} is not mapped")]
    Unmapped { vaddr: u64 },

    #[error("physical range {paddr:#x}+{len:#x} is outside of the image")]
    OutOfRange { paddr: u64, len: usize },

    #[error("did not read correct length at {paddr:#x}, wanted {wanted:?}, got {got:?}")]
    ReadLength {
        paddr: u64,
        wanted: usize,
        got: usize,
    },

    #[error("error performing IO on memory image")]
    Io(#[from] io::Error),

    #[error("error calling pread")]
    Pread(#[from] nix::errno::Errno),
}

/// Raw access to the physical memory of the inspected machine.
pub trait PhysicalMemory {
    fn phys_read_raw_into(&self, paddr: u64, out: &mut [u8]) -> Result<(), MemoryError>;

    fn phys_read_u64(&self, paddr: u64) -> Result<u64, MemoryError> {
        let mut bytes = [0; 8];
        self.phys_read_raw_into(paddr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Translation of a virtual address to a physical one.
pub trait VirtualTranslate {
    fn virt_to_phys(&self, mem: &dyn PhysicalMemory, vaddr: u64) -> Result<u64, MemoryError>;
}

/// A raw physical memory image file, offset 0 being physical address 0.
pub struct PhysicalImage {
    file: File,
    size: u64,
}

impl PhysicalImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        trace!("opened physical image, {} bytes", size);
        Ok(PhysicalImage { file, size })
    }
}

impl PhysicalMemory for PhysicalImage {
    fn phys_read_raw_into(&self, paddr: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let end = paddr.checked_add(out.len() as u64);
        if end.map_or(true, |end| end > self.size) {
            return Err(MemoryError::OutOfRange {
                paddr,
                len: out.len(),
            });
        }

        let mut done = 0;
        while done < out.len() {
            let got = pread(
                self.file.as_raw_fd(),
                &mut out[done..],
                (paddr + done as u64) as libc::off_t,
            )?;
            if got == 0 {
                return Err(MemoryError::ReadLength {
                    paddr,
                    wanted: out.len(),
                    got: done,
                });
            }
            done += got;
        }

        Ok(())
    }
}

/// A physical memory image held in memory.
#[cfg(test)]
pub struct BufferMemory {
    bytes: Vec<u8>,
}

#[cfg(test)]
impl BufferMemory {
    pub fn new(bytes: Vec<u8>) -> Self {
        BufferMemory { bytes }
    }
}

#[cfg(test)]
impl PhysicalMemory for BufferMemory {
    fn phys_read_raw_into(&self, paddr: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let range = usize::try_from(paddr)
            .ok()
            .and_then(|start| Some(start..start.checked_add(out.len())?))
            .filter(|range| range.end <= self.bytes.len())
            .ok_or(MemoryError::OutOfRange {
                paddr,
                len: out.len(),
            })?;
        out.copy_from_slice(&self.bytes[range]);
        Ok(())
    }
}

/// Four level x86_64 page table walk, honouring 2M and 1G pages.
#[derive(Clone, Copy, Debug)]
pub struct X64PageWalk {
    root: u64,
}

impl X64PageWalk {
    /// `root` is the physical address of the top level table (CR3).
    pub fn new(root: u64) -> Self {
        X64PageWalk {
            root: root & PTE_ADDR_MASK,
        }
    }
}

impl VirtualTranslate for X64PageWalk {
    fn virt_to_phys(&self, mem: &dyn PhysicalMemory, vaddr: u64) -> Result<u64, MemoryError> {
        let mut table = self.root;

        // level 3 is the PML4, level 0 the last level page table
        for level in (0..4).rev() {
            let shift = 12 + 9 * level;
            let index = (vaddr >> shift) & 0x1ff;
            let entry = mem.phys_read_u64(table + index * 8)?;

            if entry & PTE_PRESENT == 0 {
                return Err(MemoryError::Unmapped { vaddr });
            }

            let is_large = (level == 1 || level == 2) && entry & PTE_PAGE_SIZE != 0;
            if is_large || level == 0 {
                let offset_mask = (1_u64 << shift) - 1;
                return Ok((entry & PTE_ADDR_MASK & !offset_mask) | (vaddr & offset_mask));
            }

            table = entry & PTE_ADDR_MASK;
        }

        Err(MemoryError::Unmapped { vaddr })
    }
}

/// Linear map of all physical memory at a fixed kernel virtual offset.
#[derive(Clone, Copy, Debug)]
pub struct DirectMap {
    page_offset: u64,
}

impl DirectMap {
    pub fn new(page_offset: u64) -> Self {
        DirectMap { page_offset }
    }
}

impl VirtualTranslate for DirectMap {
    fn virt_to_phys(&self, _mem: &dyn PhysicalMemory, vaddr: u64) -> Result<u64, MemoryError> {
        vaddr
            .checked_sub(self.page_offset)
            .ok_or(MemoryError::Unmapped { vaddr })
    }
}

/// Memory of the inspected machine as seen from its kernel.
pub struct KernelMemory<'a> {
    phys: &'a dyn PhysicalMemory,
    kernel: Box<dyn VirtualTranslate + 'a>,
}

impl<'a> KernelMemory<'a> {
    pub fn new(phys: &'a dyn PhysicalMemory, kernel: Box<dyn VirtualTranslate + 'a>) -> Self {
        KernelMemory { phys, kernel }
    }

    /// Translate a kernel virtual address
    pub fn kvtop(&self, vaddr: u64) -> Result<u64, MemoryError> {
        self.kernel.virt_to_phys(self.phys, vaddr)
    }

    /// Read from kernel virtual memory, page by page
    pub fn read_kernel(&self, vaddr: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        read_virtual(self.phys, self.kernel.as_ref(), vaddr, out)
    }

    pub fn read_kernel_vec(&self, vaddr: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buffer = vec![0; len];
        self.read_kernel(vaddr, &mut buffer)?;
        Ok(buffer)
    }

    pub fn read_u64(&self, vaddr: u64) -> Result<u64, MemoryError> {
        let mut bytes = [0; 8];
        self.read_kernel(vaddr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read an unsigned integer of 1, 2, 4 or 8 bytes, zero extended
    pub fn read_uint(&self, vaddr: u64, size: usize) -> Result<u64, MemoryError> {
        let mut bytes = [0; 8];
        self.read_kernel(vaddr, &mut bytes[..size.min(8)])?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read a NUL terminated string of at most `max` bytes
    pub fn read_cstring(&self, vaddr: u64, max: usize) -> Result<String, MemoryError> {
        let mut bytes = Vec::new();
        let mut chunk = [0_u8; 64];
        while bytes.len() < max {
            let want = chunk.len().min(max - bytes.len());
            let addr = vaddr
                .checked_add(bytes.len() as u64)
                .ok_or(MemoryError::Unmapped { vaddr })?;
            self.read_kernel(addr, &mut chunk[..want])?;
            match chunk[..want].iter().position(|&b| b == 0) {
                Some(nul) => {
                    bytes.extend_from_slice(&chunk[..nul]);
                    break;
                }
                None => bytes.extend_from_slice(&chunk[..want]),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Address space of a process, given the kernel virtual address of its
    /// top level page table.
    pub fn user_space(&self, pgd: u64) -> Result<UserSpace<'_>, MemoryError> {
        let root = self.kvtop(pgd)?;
        trace!("user space pgd {:#x} at physical {:#x}", pgd, root);
        Ok(UserSpace {
            phys: self.phys,
            walk: X64PageWalk::new(root),
        })
    }
}

/// Memory of one process of the inspected machine.
pub struct UserSpace<'a> {
    phys: &'a dyn PhysicalMemory,
    walk: X64PageWalk,
}

impl<'a> UserSpace<'a> {
    pub fn read_user(&self, vaddr: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        read_virtual(self.phys, &self.walk, vaddr, out)
    }
}

/// A FallibleStreamingIterator over the pages of a user memory range.
///
/// Pages that are not present in the snapshot are handed out as zero pages,
/// so the output keeps its layout.
pub struct UserPages<'a> {
    user: &'a UserSpace<'a>,
    verbosity: &'a Verbosity,
    next: u64,
    end: u64,
    buffer: Vec<u8>,
    faulted: u64,
    done: bool,
}

impl<'a> UserPages<'a> {
    /// Iterate over `[start, start + length)`; `start` must be page aligned.
    pub fn new(user: &'a UserSpace<'a>, start: u64, length: u64, verbosity: &'a Verbosity) -> Self {
        UserPages {
            user,
            verbosity,
            next: start,
            end: start.saturating_add(length),
            buffer: vec![0; PAGE_SIZE as usize],
            faulted: 0,
            done: false,
        }
    }

    /// Number of pages handed out as zeros so far.
    pub fn faulted(&self) -> u64 {
        self.faulted
    }
}

impl FallibleStreamingIterator for UserPages<'_> {
    type Item = [u8];
    type Error = MemoryError;

    fn advance(&mut self) -> Result<(), Self::Error> {
        if self.done || self.next >= self.end {
            self.done = true;
            return Ok(());
        }

        let length = PAGE_SIZE.min(self.end - self.next) as usize;
        self.buffer.resize(length, 0);

        if let Err(e) = self.user.read_user(self.next, &mut self.buffer) {
            pagefaultf!(self.verbosity, "page fault at {:#x}: {}", self.next, e);
            self.buffer.fill(0);
            self.faulted += 1;
        }

        self.next += length as u64;
        Ok(())
    }

    fn get(&self) -> Option<&Self::Item> {
        if self.done {
            None
        } else {
            Some(self.buffer.as_slice())
        }
    }
}

/// Read virtual memory, translating each page separately
fn read_virtual(
    phys: &dyn PhysicalMemory,
    translate: &dyn VirtualTranslate,
    vaddr: u64,
    out: &mut [u8],
) -> Result<(), MemoryError> {
    let mut done = 0;
    while done < out.len() {
        let addr = vaddr
            .checked_add(done as u64)
            .ok_or(MemoryError::Unmapped { vaddr })?;
        let in_page = (PAGE_SIZE - (addr % PAGE_SIZE)) as usize;
        let length = in_page.min(out.len() - done);

        let paddr = translate.virt_to_phys(phys, addr)?;
        phys.phys_read_raw_into(paddr, &mut out[done..done + length])?;

        done += length;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_OFFSET: u64 = 0xffff_8880_0000_0000;

    fn put_u64(bytes: &mut [u8], paddr: u64, value: u64) {
        let at = paddr as usize;
        bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// 64K image: tables at 0x1000.., 0x4000 page mapped at 0x7000_0000_1000,
    /// a 2M page at 0x7000_0020_0000 (pointing at physical 0).
    fn image() -> BufferMemory {
        let mut bytes = vec![0_u8; 0x10000];
        // PML4[0xe0] -> PDPT at 0x2000
        put_u64(&mut bytes, 0x1000 + 0xe0 * 8, 0x2000 | PTE_PRESENT);
        // PDPT[0] -> PD at 0x3000
        put_u64(&mut bytes, 0x2000, 0x3000 | PTE_PRESENT);
        // PD[0] -> PT at 0x5000; PD[1] is a 2M page
        put_u64(&mut bytes, 0x3000, 0x5000 | PTE_PRESENT);
        put_u64(&mut bytes, 0x3000 + 8, PTE_PRESENT | PTE_PAGE_SIZE);
        // PT[1] -> page at 0x4000; PT[2] present bit clear
        put_u64(&mut bytes, 0x5000 + 8, 0x4000 | PTE_PRESENT);
        put_u64(&mut bytes, 0x5000 + 16, 0x6000);
        bytes[0x4000..0x4004].copy_from_slice(b"\x7fELF");
        bytes[0x4ffe] = 0xaa;
        bytes[0x4fff] = 0xbb;
        BufferMemory::new(bytes)
    }

    #[test]
    fn walks_four_levels() -> Result<(), MemoryError> {
        let mem = image();
        let walk = X64PageWalk::new(0x1000);
        assert_eq!(0x4000, walk.virt_to_phys(&mem, 0x7000_0000_1000)?);
        assert_eq!(0x4123, walk.virt_to_phys(&mem, 0x7000_0000_1123)?);
        Ok(())
    }

    #[test]
    fn walks_large_pages() -> Result<(), MemoryError> {
        let mem = image();
        let walk = X64PageWalk::new(0x1000);
        assert_eq!(0x1234, walk.virt_to_phys(&mem, 0x7000_0020_1234)?);
        Ok(())
    }

    #[test]
    fn reports_unmapped() {
        let mem = image();
        let walk = X64PageWalk::new(0x1000);
        assert!(matches!(
            walk.virt_to_phys(&mem, 0x7000_0000_2000),
            Err(MemoryError::Unmapped {
                vaddr: 0x7000_0000_2000
            })
        ));
        assert!(matches!(
            walk.virt_to_phys(&mem, 0x1000),
            Err(MemoryError::Unmapped { .. })
        ));
    }

    #[test]
    fn buffer_rejects_out_of_range() {
        let mem = image();
        let mut out = [0; 16];
        assert!(matches!(
            mem.phys_read_raw_into(0xfff8, &mut out),
            Err(MemoryError::OutOfRange { paddr: 0xfff8, .. })
        ));
    }

    #[test]
    fn reads_through_direct_map() -> Result<(), MemoryError> {
        let mem = image();
        let kernel = KernelMemory::new(&mem, Box::new(DirectMap::new(PAGE_OFFSET)));
        assert_eq!(0x4000, kernel.kvtop(PAGE_OFFSET + 0x4000)?);
        assert_eq!(0x464c457f, kernel.read_uint(PAGE_OFFSET + 0x4000, 4)?);
        assert_eq!(0x2000 | PTE_PRESENT, kernel.read_uint(PAGE_OFFSET + 0x1700, 8)?);
        assert_eq!(0x7f, kernel.read_uint(PAGE_OFFSET + 0x4000, 1)?);
        assert!(kernel.kvtop(0x1000).is_err());
        Ok(())
    }

    #[test]
    fn reads_cstring() -> Result<(), MemoryError> {
        let mem = image();
        let kernel = KernelMemory::new(&mem, Box::new(DirectMap::new(PAGE_OFFSET)));
        assert_eq!("\u{7f}ELF", kernel.read_cstring(PAGE_OFFSET + 0x4000, 16)?);
        assert_eq!("\u{7f}E", kernel.read_cstring(PAGE_OFFSET + 0x4000, 2)?);
        Ok(())
    }

    #[test]
    fn user_reads_split_across_pages() -> Result<(), MemoryError> {
        let mem = image();
        let kernel = KernelMemory::new(&mem, Box::new(DirectMap::new(PAGE_OFFSET)));
        let user = kernel.user_space(PAGE_OFFSET + 0x1000)?;

        let mut out = [0; 2];
        user.read_user(0x7000_0000_1ffe, &mut out)?;
        assert_eq!([0xaa, 0xbb], out);

        // second page is not present, so a read crossing into it faults
        let mut out = [0; 4];
        assert!(user.read_user(0x7000_0000_2ffe, &mut out).is_err());
        assert!(user.read_user(0x7000_0000_1ffe, &mut out).is_err());
        Ok(())
    }

    #[test]
    fn reads_past_address_space_end_fails() {
        let mem = image();
        let kernel = KernelMemory::new(&mem, Box::new(DirectMap::new(PAGE_OFFSET)));
        let mut out = [0; 16];
        assert!(matches!(
            kernel.read_kernel(u64::MAX - 3, &mut out),
            Err(MemoryError::Unmapped { .. }) | Err(MemoryError::OutOfRange { .. })
        ));
        assert!(kernel.read_cstring(u64::MAX - 3, 64).is_err());
    }

    #[test]
    fn user_pages_zero_fill_faults() -> Result<(), MemoryError> {
        let mem = image();
        let kernel = KernelMemory::new(&mem, Box::new(DirectMap::new(PAGE_OFFSET)));
        let user = kernel.user_space(PAGE_OFFSET + 0x1000)?;
        let verbosity = Verbosity::default();

        let mut pages = UserPages::new(&user, 0x7000_0000_1000, 2 * PAGE_SIZE, &verbosity);
        let mut seen = Vec::new();
        while let Some(page) = pages.next()? {
            seen.push(page.to_vec());
        }

        assert_eq!(2, seen.len());
        assert_eq!(b"\x7fELF", &seen[0][..4]);
        assert_eq!([0xaa, 0xbb], seen[0][0xffe..]);
        assert!(seen[1].iter().all(|b| *b == 0));
        assert_eq!(1, pages.faulted());
        Ok(())
    }
}
