//! Segment index (component C): a read-only, already-parsed view over a
//! Mach-O's `LC_SEGMENT`/`LC_SEGMENT_64` commands.

use std::ops::Range;

use num_derive::FromPrimitive;

use crate::helpers::string_upto_null_terminator;

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const NONE = 0x00;
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
    }
}

impl Protection {
    pub fn parse(bytes: &[u8]) -> nom::IResult<&[u8], Protection> {
        let (bytes, prot) = nom::number::complete::le_u32(bytes)?;
        Ok((bytes, Protection::from_bits_truncate(prot)))
    }
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SGFlags: u32 {
        const SG_HIGHVM = 0x1;
        const SG_FVMLIB = 0x2;
        const SG_NORELOC = 0x4;
        const SG_PROTECTED_VERSION_1 = 0x8;
        const SG_READ_ONLY = 0x10;
    }
}

impl SGFlags {
    pub fn parse(bytes: &[u8]) -> nom::IResult<&[u8], SGFlags> {
        let (bytes, flags) = nom::number::complete::le_u32(bytes)?;
        Ok((bytes, SGFlags::from_bits_truncate(flags)))
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SectionType {
    SRegular = 0x0,
    SZeroFill = 0x1,
    SCstringLiterals = 0x2,
    S4ByteLiterals = 0x3,
    S8ByteLiterals = 0x4,
    SLiteralPointers = 0x5,
    SNonLazySymbolPointers = 0x6,
    SLazySymbolPointers = 0x7,
    SSymbolStubs = 0x8,
    SModInitFuncPointers = 0x9,
    SModTermFuncPointers = 0xa,
    SCoalesced = 0xb,
    SGbZeroFill = 0xc,
    SInterposing = 0xd,
    S16ByteLiterals = 0xe,
    SDtraceDof = 0xf,
    SLazyDylibSymbolPointers = 0x10,
    SThreadLocalRegular = 0x11,
    SThreadLocalZeroFill = 0x12,
    SThreadLocalVariables = 0x13,
    SThreadLocalVariablePointers = 0x14,
    SThreadLocalInitFunctionPointers = 0x15,
    SInitFuncOffsets = 0x16,
}

impl SectionType {
    pub const SECTION_TYPE_MASK: u32 = 0x000000ff;

    pub fn parse(bytes: &[u8]) -> nom::IResult<&[u8], SectionType> {
        let (bytes, sectype) = nom::number::complete::le_u32(bytes)?;
        match num::FromPrimitive::from_u32(sectype & Self::SECTION_TYPE_MASK) {
            Some(sectype) => Ok((bytes, sectype)),
            None => Err(nom::Err::Failure(nom::error::Error::new(
                bytes,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionAttributes: u32 {
        const S_ATTR_PURE_INSTRUCTIONS = 0x80000000;
        const S_ATTR_NO_TOC = 0x40000000;
        const S_ATTR_STRIP_STATIC_SYMS = 0x20000000;
        const S_ATTR_NO_DEAD_STRIP = 0x10000000;
        const S_ATTR_LIVE_SUPPORT = 0x08000000;
        const S_ATTR_SELF_MODIFYING_CODE = 0x04000000;
        const S_ATTR_DEBUG = 0x02000000;
        const S_ATTR_SOME_INSTRUCTIONS = 0x00000400;
        const S_ATTR_EXT_RELOC = 0x00000200;
        const S_ATTR_LOC_RELOC = 0x00000100;
    }
}

impl SectionAttributes {
    pub const SECTION_ATTRIBUTES_USR_MASK: u32 = 0xff000000;
    pub const SECTION_ATTRIBUTES_SYS_MASK: u32 = 0x00ffff00;
    pub const SECTION_ATTRIBUTES_MASK: u32 = SectionAttributes::SECTION_ATTRIBUTES_USR_MASK
        | SectionAttributes::SECTION_ATTRIBUTES_SYS_MASK;

    pub fn parse(bytes: &[u8]) -> nom::IResult<&[u8], SectionAttributes> {
        let (bytes, secattrs) = nom::number::complete::le_u32(bytes)?;
        Ok((
            bytes,
            SectionAttributes::from_bits_truncate(secattrs & Self::SECTION_ATTRIBUTES_MASK),
        ))
    }
}

/// A single `__SEGMENT,__section` entry, already resolved to file and VM
/// ranges (32-bit sections are widened to `u64` on load).
#[derive(Debug, Clone)]
pub struct Section {
    pub sectname: String,
    pub segname: String,
    pub vm_range: Range<u64>,
    pub file_range: Range<u64>,
    pub flags_sectype: SectionType,
    pub flags_secattrs: SectionAttributes,
}

impl Section {
    pub fn parse64<'a>(bytes: &'a [u8]) -> nom::IResult<&'a [u8], Self> {
        let (bytes, sectname) = nom::bytes::complete::take(16usize)(bytes)?;
        let (_, sectname) = string_upto_null_terminator(sectname)?;
        let (bytes, segname) = nom::bytes::complete::take(16usize)(bytes)?;
        let (_, segname) = string_upto_null_terminator(segname)?;

        let (bytes, (addr, size, offset, _align, _reloff, _nreloc)) = nom::sequence::tuple((
            nom::number::complete::le_u64,
            nom::number::complete::le_u64,
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
        ))(bytes)?;

        let (_, flags_sectype) = SectionType::parse(bytes)?;
        let (bytes, flags_secattrs) = SectionAttributes::parse(bytes)?;

        let (bytes, (_reserved1, _reserved2, _reserved3)) = nom::sequence::tuple((
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
        ))(bytes)?;

        Ok((
            bytes,
            Section {
                sectname,
                segname,
                vm_range: addr..addr + size,
                file_range: offset as u64..offset as u64 + size,
                flags_sectype,
                flags_secattrs,
            },
        ))
    }

    pub fn parse32<'a>(bytes: &'a [u8]) -> nom::IResult<&'a [u8], Self> {
        let (bytes, sectname) = nom::bytes::complete::take(16usize)(bytes)?;
        let (_, sectname) = string_upto_null_terminator(sectname)?;
        let (bytes, segname) = nom::bytes::complete::take(16usize)(bytes)?;
        let (_, segname) = string_upto_null_terminator(segname)?;

        let (bytes, (addr, size, offset, _align, _reloff, _nreloc)) = nom::sequence::tuple((
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
        ))(bytes)?;

        let (_, flags_sectype) = SectionType::parse(bytes)?;
        let (bytes, flags_secattrs) = SectionAttributes::parse(bytes)?;

        let (bytes, (_reserved1, _reserved2)) = nom::sequence::tuple((
            nom::number::complete::le_u32,
            nom::number::complete::le_u32,
        ))(bytes)?;

        Ok((
            bytes,
            Section {
                sectname,
                segname,
                vm_range: addr as u64..addr as u64 + size as u64,
                file_range: offset as u64..offset as u64 + size as u64,
                flags_sectype,
                flags_secattrs,
            },
        ))
    }
}

/// A single `LC_SEGMENT`/`LC_SEGMENT_64`, resolved to file and VM ranges.
#[derive(Debug, Clone)]
pub struct Segment {
    pub segname: String,
    pub vm_range: Range<u64>,
    pub file_range: Range<u64>,
    pub maxprot: Protection,
    pub initprot: Protection,
    pub flags: SGFlags,
    pub sections: Vec<Section>,
}

impl Segment {
    pub fn section(&self, sectname: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.sectname == sectname)
    }
}

/// Read-only mapping from segment index to `Segment` (component C).
#[derive(Debug, Clone, Default)]
pub struct SegmentIndex {
    segments: Vec<Segment>,
}

impl SegmentIndex {
    pub fn new(segments: Vec<Segment>) -> Self {
        SegmentIndex { segments }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Segment)> {
        self.segments.iter().enumerate()
    }

    pub fn named(&self, segname: &str) -> Option<(usize, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, s)| s.segname == segname)
    }

    /// Finds the segment whose VM range contains `addr`, if any.
    pub fn segment_for_vm(&self, addr: u64) -> Option<(usize, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, s)| s.vm_range.contains(&addr))
    }

    /// Finds the section named `(segname, sectname)`, if present.
    pub fn section_named(&self, segname: &str, sectname: &str) -> Option<&Section> {
        self.named(segname).and_then(|(_, seg)| seg.section(sectname))
    }
}
