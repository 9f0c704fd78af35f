// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
//! Parsing for structure layout files.
//!
//! A layout file is what the debug information of the inspected kernel says
//! about the structures and constants this tool needs. It is produced
//! offline (from vmlinux DWARF, a crash session, etc.) and is the only place
//! where kernel-version specific numbers enter the tool.
//!
//! arch x86_64
//! struct pt_regs 168
//! member task_struct stack 0x20 8
//! const THREAD_SIZE 0x4000
//!
//! Numbers are decimal or `0x` prefixed hex; `#` starts a comment.

use log::{debug, trace};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::io::BufRead;
use std::num::ParseIntError;
use std::path::Path;
use thiserror::Error;

/// Source of structure layout knowledge for the inspected kernel.
///
/// Every lookup answers `None` when the kernel build being inspected does
/// not have the structure, member or constant.
pub trait TypeInfo {
    /// Architecture name the layout was generated for, e.g. `x86_64`.
    fn arch(&self) -> Option<&str>;

    fn struct_size(&self, structure: &str) -> Option<u64>;

    fn member_offset(&self, structure: &str, member: &str) -> Option<u64>;

    fn member_size(&self, structure: &str, member: &str) -> Option<u64>;

    fn constant(&self, name: &str) -> Option<u64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MemberLayout {
    offset: u64,
    size: u64,
}

/// An in-memory layout description, usually read from a layout file.
#[derive(Default, Debug)]
pub struct Layout {
    arch: Option<String>,
    structs: HashMap<String, u64>,
    members: HashMap<String, HashMap<String, MemberLayout>>,
    constants: HashMap<String, u64>,
}

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("unable performing IO on layout file")]
    Io(#[from] io::Error),

    #[error("unable to parse layout line {line_no}: {reason:?}")]
    Line { line_no: usize, reason: String },

    #[error("unable to parse number in layout line {line_no}")]
    Number {
        line_no: usize,
        #[source]
        source: ParseIntError,
    },
}

/// Parse a decimal or `0x` prefixed hexadecimal number.
pub fn parse_number(value: &str) -> Result<u64, ParseIntError> {
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    }
}

impl Layout {
    /// Read a layout description from a file
    pub fn read_file(path: impl AsRef<Path>) -> Result<Self, LayoutError> {
        debug!("read_layout_file {}", path.as_ref().display());
        let file = fs::File::open(path)?;
        let reader = io::BufReader::new(file);

        Self::parse(reader.lines())
    }

    /// Parse layout file contents
    pub fn parse(
        layout_lines: impl Iterator<Item = Result<String, io::Error>>,
    ) -> Result<Self, LayoutError> {
        trace!("parsing layout");
        let mut layout = Layout::default();

        for (idx, line_wrapped) in layout_lines.enumerate() {
            let line = line_wrapped?;
            layout.parse_line(idx + 1, &line)?;
        }

        debug!(
            "parse_layout, found {} structs, {} members, {} constants",
            layout.structs.len(),
            layout.members.values().map(|m| m.len()).sum::<usize>(),
            layout.constants.len()
        );
        Ok(layout)
    }

    /// Add a member to the layout
    pub fn insert_member(&mut self, structure: &str, member: &str, offset: u64, size: u64) {
        self.members
            .entry(structure.to_string())
            .or_default()
            .insert(member.to_string(), MemberLayout { offset, size });
    }

    fn parse_line(&mut self, line_no: usize, line: &str) -> Result<(), LayoutError> {
        let content = match line.split_once('#') {
            Some((before, _)) => before,
            None => line,
        }
        .trim();

        let number = |value: Option<String>, what: &str| -> Result<u64, LayoutError> {
            let value = value.ok_or_else(|| LayoutError::Line {
                line_no,
                reason: format!("{what} not parsed"),
            })?;
            parse_number(&value).map_err(|source| LayoutError::Number { line_no, source })
        };
        let word = |value: Option<String>, what: &str| -> Result<String, LayoutError> {
            value.ok_or_else(|| LayoutError::Line {
                line_no,
                reason: format!("{what} not parsed"),
            })
        };

        match detect_line_type(content) {
            LineType::Blank => {}
            LineType::Arch => {
                let arch = scan_fmt_some!(content, "arch {}", String);
                self.arch = Some(word(arch, "arch")?);
            }
            LineType::Struct => {
                let (name, size) = scan_fmt_some!(content, "struct {} {}", String, String);
                let name = word(name, "struct name")?;
                self.structs.insert(name, number(size, "struct size")?);
            }
            LineType::Member => {
                let (structure, member, offset, size) =
                    scan_fmt_some!(content, "member {} {} {} {}", String, String, String, String);
                let structure = word(structure, "structure")?;
                let member = word(member, "member")?;
                let offset = number(offset, "offset")?;
                let size = number(size, "size")?;
                self.insert_member(&structure, &member, offset, size);
            }
            LineType::Const => {
                let (name, value) = scan_fmt_some!(content, "const {} {}", String, String);
                let name = word(name, "constant name")?;
                self.constants.insert(name, number(value, "constant value")?);
            }
            LineType::Unknown => {
                return Err(LayoutError::Line {
                    line_no,
                    reason: format!("unknown directive: {content}"),
                })
            }
        }

        Ok(())
    }
}

impl TypeInfo for Layout {
    fn arch(&self) -> Option<&str> {
        self.arch.as_deref()
    }

    fn struct_size(&self, structure: &str) -> Option<u64> {
        self.structs.get(structure).copied()
    }

    fn member_offset(&self, structure: &str, member: &str) -> Option<u64> {
        self.members
            .get(structure)?
            .get(member)
            .map(|m| m.offset)
    }

    fn member_size(&self, structure: &str, member: &str) -> Option<u64> {
        self.members.get(structure)?.get(member).map(|m| m.size)
    }

    fn constant(&self, name: &str) -> Option<u64> {
        self.constants.get(name).copied()
    }
}

/// Directives that can appear in a layout file.
enum LineType {
    Blank,
    Arch,
    Struct,
    Member,
    Const,
    Unknown,
}

/// Detect the LineType for a given (comment stripped) line.
fn detect_line_type(line: &str) -> LineType {
    match line.split_whitespace().next() {
        None => LineType::Blank,
        Some("arch") => LineType::Arch,
        Some("struct") => LineType::Struct,
        Some("member") => LineType::Member,
        Some("const") => LineType::Const,
        Some(_) => LineType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn parse_str(input: &str) -> Result<Layout, LayoutError> {
        Layout::parse(input.lines().map(|l| Ok(l.to_string())))
    }

    #[test]
    fn parses_numbers() {
        assert_eq!(Ok(16), parse_number("16"));
        assert_eq!(Ok(0x4000), parse_number("0x4000"));
        assert_eq!(Ok(0xff), parse_number("0XFF"));
        assert!(parse_number("0xzz").is_err());
        assert!(parse_number("-1").is_err());
    }

    #[test]
    fn parses_member_line() -> Result<(), LayoutError> {
        let layout = parse_str("member vm_area_struct vm_flags 0x50 8")?;
        assert_eq!(Some(0x50), layout.member_offset("vm_area_struct", "vm_flags"));
        assert_eq!(Some(8), layout.member_size("vm_area_struct", "vm_flags"));
        assert_eq!(None, layout.member_offset("vm_area_struct", "anon_vma"));
        assert_eq!(None, layout.member_offset("mm_struct", "vm_flags"));
        Ok(())
    }

    #[test]
    fn parses_struct_const_and_arch() -> Result<(), LayoutError> {
        let layout = parse_str(
            "arch x86_64\n\
             struct pt_regs 168   # user register frame\n\
             \n\
             # HZ of the inspected kernel\n\
             const HZ 250\n",
        )?;
        assert_eq!(Some("x86_64"), layout.arch());
        assert_eq!(Some(168), layout.struct_size("pt_regs"));
        assert_eq!(Some(250), layout.constant("HZ"));
        assert_eq!(None, layout.constant("THREAD_SIZE"));
        Ok(())
    }

    #[test]
    fn rejects_unknown_directive() {
        let result = parse_str("struct pt_regs 168\nenum pid_type 4");
        assert!(matches!(result, Err(LayoutError::Line { line_no: 2, .. })));
    }

    #[test]
    fn rejects_truncated_member() {
        let result = parse_str("member task_struct stack 0x20");
        assert!(matches!(result, Err(LayoutError::Line { line_no: 1, .. })));
    }

    #[test]
    fn rejects_bad_number() {
        let result = parse_str("const HZ twohundred");
        assert!(matches!(result, Err(LayoutError::Number { line_no: 1, .. })));
    }

    #[test]
    fn parses() -> Result<(), LayoutError> {
        let cargo_toml_root =
            env::var("CARGO_MANIFEST_DIR").expect("should have CARGO_MANIFEST_DIR set");
        let layout = Layout::read_file(format!("{cargo_toml_root}/resources/test/layout.txt"))?;

        assert_eq!(Some("x86_64"), layout.arch());
        assert_eq!(Some(0x28), layout.member_offset("task_struct", "stack"));
        assert_eq!(Some(4), layout.member_size("task_struct", "__state"));
        assert_eq!(Some(168), layout.struct_size("pt_regs"));
        assert_eq!(Some(0x4000), layout.constant("THREAD_SIZE"));
        assert_eq!(None, layout.member_offset("vm_area_struct", "anon_vma"));
        Ok(())
    }
}
