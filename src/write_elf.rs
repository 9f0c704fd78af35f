// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Support for writing ELF core files to an output.
//!
//! Layout of the output, in order:
//! - ELF header
//! - program headers: one PT_NOTE, then one PT_LOAD per mapping
//! - one section header, only when there are too many program headers
//! - notes
//! - padding to the next page
//! - mapping contents, page by page

use std::io::{self, BufWriter, Read, Write};
use std::mem::size_of;

use crate::byte_helpers::*;
use crate::regset::RegsetView;
use crate::snapshot::{MemoryError, UserPages, UserSpace, PAGE_SIZE};
use crate::verbose::Verbosity;
use crate::vma::MemoryMappingView;
use elf::abi::{
    ELFCLASS64, ELFDATA2LSB, ELFMAG0, ELFMAG1, ELFMAG2, ELFMAG3, ET_CORE, EV_CURRENT, PF_R,
    PT_LOAD, PT_NOTE,
};
use fallible_streaming_iterator::FallibleStreamingIterator;
use log::{debug, info, trace};
use thiserror::Error;

// Special ELF-file text values
pub const NOTE_NAME_CORE: &[u8; 8] = b"CORE\0\0\0\0";
pub const NOTE_NAME_LINUX: &[u8; 8] = b"LINUX\0\0\0";

/// e_phnum value meaning "see sh_info of section header 0"
const PN_XNUM: u16 = 0xffff;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Elf64Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Elf64Nhdr {
    pub n_namesz: u32,
    pub n_descsz: u32,
    pub n_type: u32,
}

#[derive(Error, Debug)]
pub enum CoreWriteError {
    #[error("error writing core file")]
    Io(#[from] io::Error),

    #[error("error reading mapping contents")]
    Memory(#[from] MemoryError),
}

/// Determine the size for a note name;
///
/// Whilst the note name field is 8 bytes long, the size is also
/// emitted and needs to include the optional null terminator
const fn note_name_size(name: &[u8; 8]) -> u32 {
    // this is done painfully since it is a const function

    // clunky to allow for null terminator
    let mut idx = 0;
    let mut count_non_zero = 0;
    while idx < name.len() {
        if name[idx] != 0 {
            count_non_zero += 1;
        }
        idx += 1;
    }

    // allow for the null terminator
    count_non_zero + 1
}

/// A note, ready to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfNote {
    pub note_name: &'static [u8; 8],
    pub note_type: u32,
    pub description: Vec<u8>,
    pub friendly: &'static str,
}

impl ElfNote {
    /// Bytes this note takes in the notes segment
    pub fn size(&self) -> usize {
        size_of::<Elf64Nhdr>() + self.note_name.len() + align_4(self.description.len())
    }

    pub fn write(&self, output: &mut impl io::Write) -> Result<(), io::Error> {
        trace!(
            "writing note {} ({} bytes)",
            self.friendly,
            self.description.len()
        );
        write_simple_note(self.note_name, self.note_type, &self.description, output)
    }
}

/// Write a simple structured ELF note, including header, contents, and padding.
fn write_simple_note(
    note_name: &[u8; 8],
    note_type: u32,
    note_description: &[u8],
    output: &mut impl io::Write,
) -> Result<(), std::io::Error> {
    output.write_all(nhdr_to_bytes(&Elf64Nhdr {
        n_namesz: note_name_size(note_name),
        n_descsz: note_description.len() as u32,
        n_type: note_type,
    }))?;
    output.write_all(note_name)?;
    output.write_all(note_description)?;
    pad_to_4(note_description.len(), output)?;

    Ok(())
}

/// Build the NT_FILE description for file backed mappings
pub fn mapped_files_description(mappings: &[MemoryMappingView]) -> Vec<u8> {
    //
    // https://github.com/torvalds/linux/blob/master/fs/binfmt_elf.c#L1593-L1603
    // Format of NT_FILE note:
    //
    // long count     -- how many files are mapped
    // long page_size -- units for file_ofs
    // array of [COUNT] elements of
    //   long start
    //   long end
    //   long file_ofs
    // followed by COUNT filenames in ASCII: "FILE1" NUL "FILE2" NUL...
    //
    let files: Vec<_> = mappings
        .iter()
        .filter_map(|m| m.file.as_ref().map(|file| (m, file)))
        .collect();

    let mut description = Vec::new();
    description.extend((files.len() as u64).to_le_bytes());
    description.extend(PAGE_SIZE.to_le_bytes());

    for (mapping, _) in files.iter() {
        description.extend(mapping.start.to_le_bytes());
        description.extend(mapping.end.to_le_bytes());
        description.extend(mapping.pgoff.to_le_bytes());
    }

    for (_, file) in files.iter() {
        description.extend(file.path.as_bytes());
        description.push(0);
    }

    description
}

/// One PT_LOAD segment of the core file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub memsz: u64,
    pub filesz: u64,
    pub flags: u32,
}

impl LoadSegment {
    pub fn new(mapping: &MemoryMappingView, filesz: u64) -> Self {
        LoadSegment {
            vaddr: mapping.start,
            memsz: mapping.len(),
            filesz,
            flags: mapping.flags.p_flags(),
        }
    }
}

/// Offsets of every part of the core file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreLayout {
    pub phnum: usize,
    pub extended_numbering: bool,
    pub notes_offset: u64,
    pub notes_size: u64,
    pub data_offset: u64,
}

impl CoreLayout {
    pub fn new(notes: &[ElfNote], segments: &[LoadSegment]) -> Self {
        let phnum = segments.len() + 1;
        let extended_numbering = phnum >= PN_XNUM as usize;

        let mut offset = (size_of::<Elf64Ehdr>() + phnum * size_of::<Elf64Phdr>()) as u64;
        if extended_numbering {
            offset += size_of::<Elf64Shdr>() as u64;
        }
        let notes_size = notes.iter().map(|n| n.size() as u64).sum::<u64>();

        CoreLayout {
            phnum,
            extended_numbering,
            notes_offset: offset,
            notes_size,
            data_offset: align_to(offset + notes_size, PAGE_SIZE),
        }
    }
}

/// Write an ELF Ehdr
fn write_elf_header(
    view: &RegsetView,
    layout: &CoreLayout,
    output: &mut impl io::Write,
) -> Result<(), std::io::Error> {
    let mut ident = [0_u8; 16];
    ident[..4].copy_from_slice(&[ELFMAG0 as u8, ELFMAG1 as u8, ELFMAG2 as u8, ELFMAG3 as u8]);
    ident[4] = ELFCLASS64 as u8;
    ident[5] = ELFDATA2LSB as u8;
    ident[6] = EV_CURRENT as u8;
    ident[7] = view.ei_osabi;

    let (e_phnum, e_shoff, e_shentsize, e_shnum) = if layout.extended_numbering {
        (
            PN_XNUM,
            (size_of::<Elf64Ehdr>() + layout.phnum * size_of::<Elf64Phdr>()) as u64,
            size_of::<Elf64Shdr>() as u16,
            1,
        )
    } else {
        (layout.phnum as u16, 0, 0, 0)
    };

    let ehdr = Elf64Ehdr {
        e_ident: ident,
        e_type: ET_CORE as u16,
        e_machine: view.e_machine,
        e_version: EV_CURRENT as u32,
        e_entry: 0,
        e_phoff: size_of::<Elf64Ehdr>() as u64, /* start immediately after Ehdr */
        e_shoff,
        e_flags: view.e_flags,
        e_ehsize: size_of::<Elf64Ehdr>() as u16,
        e_phentsize: size_of::<Elf64Phdr>() as u16,
        e_phnum,
        e_shentsize,
        e_shnum,
        e_shstrndx: 0,
    };

    output.write_all(ehdr_to_bytes(&ehdr))?;

    Ok(())
}

/// Write all ELF program headers in a block, and the extended numbering
/// section header if needed
fn write_program_headers(
    layout: &CoreLayout,
    segments: &[LoadSegment],
    output: &mut impl io::Write,
) -> Result<(), std::io::Error> {
    let note = Elf64Phdr {
        p_type: PT_NOTE as u32,
        p_flags: PF_R as u32,
        p_offset: layout.notes_offset,
        p_filesz: layout.notes_size,
        p_align: 4,
        ..Default::default()
    };
    output.write_all(phdr_to_bytes(&note))?;

    let mut offset = layout.data_offset;
    for segment in segments {
        let phdr = Elf64Phdr {
            p_type: PT_LOAD as u32,
            p_flags: segment.flags,
            p_offset: offset,
            p_vaddr: segment.vaddr,
            p_paddr: 0,
            p_filesz: segment.filesz,
            p_memsz: segment.memsz,
            p_align: PAGE_SIZE,
        };
        output.write_all(phdr_to_bytes(&phdr))?;
        offset = offset.saturating_add(segment.filesz);
    }

    if layout.extended_numbering {
        let shdr = Elf64Shdr {
            sh_info: layout.phnum as u32,
            ..Default::default()
        };
        output.write_all(shdr_to_bytes(&shdr))?;
    }

    Ok(())
}

/// Write everything up to the first mapping's contents
pub fn write_headers_and_notes(
    view: &RegsetView,
    notes: &[ElfNote],
    segments: &[LoadSegment],
    output: &mut impl io::Write,
) -> Result<CoreLayout, std::io::Error> {
    let layout = CoreLayout::new(notes, segments);
    debug!(
        "core layout: {} program headers, notes at {:#x} ({} bytes), data at {:#x}",
        layout.phnum, layout.notes_offset, layout.notes_size, layout.data_offset
    );

    write_elf_header(view, &layout, output)?;
    write_program_headers(&layout, segments, output)?;
    for note in notes {
        note.write(output)?;
    }

    let padding = layout.data_offset - (layout.notes_offset + layout.notes_size);
    io::copy(&mut io::repeat(0).take(padding), output)?;

    Ok(layout)
}

/// Write the ELF load section contents out to the file
///
/// They will be emitted in the same order as the segments; pages that
/// cannot be read are written as zeros. Returns the number of such pages.
pub fn write_load_sections(
    segments: &[LoadSegment],
    user: &UserSpace,
    verbosity: &Verbosity,
    output: &mut impl io::Write,
) -> Result<u64, CoreWriteError> {
    info!(
        "writing load sections: total={}, eligible={}, load section bytes={}",
        segments.len(),
        segments.iter().filter(|s| s.filesz > 0).count(),
        segments.iter().fold(0_u64, |total, s| total.saturating_add(s.filesz))
    );

    // pre-flush
    output.flush()?;

    let mut buff_out = BufWriter::with_capacity(64 * 1024, output);
    let mut faulted = 0;

    for segment in segments.iter().filter(|s| s.filesz > 0) {
        trace!(
            ".. writing load section: {:#x}, {} bytes",
            segment.vaddr,
            segment.filesz
        );

        let mut pages = UserPages::new(user, segment.vaddr, segment.filesz, verbosity);
        while let Some(page) = pages.next()? {
            buff_out.write_all(page)?;
        }
        faulted += pages.faulted();
    }

    trace!("flushing load section");
    buff_out.flush()?;

    debug!("load sections complete, {} pages unreadable", faulted);
    Ok(faulted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regset_x86_64::X86_64_VIEW;
    use crate::vma::{FileBacking, MappingFlags};
    use elf::endian::AnyEndian;
    use elf::ElfBytes;

    fn note(len: usize) -> ElfNote {
        ElfNote {
            note_name: NOTE_NAME_CORE,
            note_type: 1,
            description: vec![0xab; len],
            friendly: "test",
        }
    }

    fn mapping(start: u64, end: u64, path: Option<&str>) -> MemoryMappingView {
        MemoryMappingView {
            vma: 0,
            start,
            end,
            flags: MappingFlags::READ | MappingFlags::WRITE,
            pgoff: 2,
            file: path.map(|path| FileBacking {
                file: 1,
                nlink: 1,
                path: path.to_string(),
            }),
            has_anon: false,
        }
    }

    #[test]
    fn test_note_size_calculator() {
        assert_eq!(5, note_name_size(NOTE_NAME_CORE));
        assert_eq!(6, note_name_size(NOTE_NAME_LINUX));
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(64, size_of::<Elf64Ehdr>());
        assert_eq!(56, size_of::<Elf64Phdr>());
        assert_eq!(64, size_of::<Elf64Shdr>());
        assert_eq!(12, size_of::<Elf64Nhdr>());
    }

    #[test]
    fn test_note_padding() -> Result<(), io::Error> {
        let mut out = Vec::new();
        let n = note(5);
        n.write(&mut out)?;
        assert_eq!(n.size(), out.len());
        assert_eq!(12 + 8 + 8, out.len());
        assert_eq!(5_u32.to_le_bytes(), out[0..4]);
        assert_eq!(5_u32.to_le_bytes(), out[4..8]);
        Ok(())
    }

    #[test]
    fn test_mapped_files_description() {
        let mappings = [
            mapping(0x1000, 0x3000, Some("/lib/a.so")),
            mapping(0x5000, 0x6000, None),
            mapping(0x7000, 0x8000, Some("/b")),
        ];
        let desc = mapped_files_description(&mappings);
        assert_eq!(Some(2), u64_at(&desc, 0));
        assert_eq!(Some(4096), u64_at(&desc, 8));
        assert_eq!(Some(0x1000), u64_at(&desc, 16));
        assert_eq!(Some(0x3000), u64_at(&desc, 24));
        assert_eq!(Some(2), u64_at(&desc, 32));
        assert_eq!(Some(0x7000), u64_at(&desc, 40));
        assert_eq!(b"/lib/a.so\0/b\0", &desc[64..]);
    }

    #[test]
    fn test_layout_pads_to_page() {
        let notes = [note(336), note(136)];
        let segments = [LoadSegment {
            vaddr: 0x1000,
            memsz: 0x2000,
            filesz: 0x2000,
            flags: PF_R as u32,
        }];
        let layout = CoreLayout::new(&notes, &segments);
        assert_eq!(64 + 2 * 56, layout.notes_offset);
        assert_eq!((20 + 336 + 20 + 136) as u64, layout.notes_size);
        assert_eq!(4096, layout.data_offset);
        assert!(!layout.extended_numbering);
    }

    #[test]
    fn test_extended_numbering() {
        let segments = vec![
            LoadSegment {
                vaddr: 0,
                memsz: 0x1000,
                filesz: 0,
                flags: PF_R as u32,
            };
            0xffff
        ];
        let layout = CoreLayout::new(&[], &segments);
        assert!(layout.extended_numbering);
        assert_eq!(0x10000, layout.phnum);

        let mut out = Vec::new();
        write_headers_and_notes(&X86_64_VIEW, &[], &segments, &mut out).unwrap();
        // e_phnum, e_shnum
        assert_eq!(0xffff_u16.to_le_bytes(), out[56..58]);
        assert_eq!(1_u16.to_le_bytes(), out[60..62]);
        let shdr = 64 + 0x10000 * 56;
        assert_eq!(Some(shdr as u64), u64_at(&out, 40));
        // sh_info of section 0
        assert_eq!(0x10000_u32.to_le_bytes(), out[shdr + 44..shdr + 48]);
    }

    #[test]
    fn test_headers_parse_back() {
        let notes = [note(336)];
        let segments = [
            LoadSegment {
                vaddr: 0x40_0000,
                memsz: 0x2000,
                filesz: 0x1000,
                flags: PF_R as u32,
            },
            LoadSegment {
                vaddr: 0x60_0000,
                memsz: 0x1000,
                filesz: 0,
                flags: PF_R as u32,
            },
        ];
        let mut out = Vec::new();
        let layout = write_headers_and_notes(&X86_64_VIEW, &notes, &segments, &mut out).unwrap();
        assert_eq!(layout.data_offset as usize, out.len());
        out.resize(out.len() + 0x1000, 0);

        let file = ElfBytes::<AnyEndian>::minimal_parse(&out).unwrap();
        assert_eq!(ET_CORE as u16, file.ehdr.e_type);
        assert_eq!(elf::abi::EM_X86_64 as u16, file.ehdr.e_machine);

        let phdrs: Vec<_> = file.segments().unwrap().iter().collect();
        assert_eq!(3, phdrs.len());
        assert_eq!(PT_NOTE as u32, phdrs[0].p_type);
        assert_eq!(PT_LOAD as u32, phdrs[1].p_type);
        assert_eq!(4096, phdrs[1].p_offset);
        assert_eq!(0x1000, phdrs[1].p_filesz);
        assert_eq!(0x2000, phdrs[1].p_memsz);
        assert_eq!(0x2000, phdrs[2].p_offset);
        assert_eq!(0, phdrs[2].p_filesz);
    }
}
