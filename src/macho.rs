//! Thin Mach-O front end (ambient scaffolding, not one of the core
//! components): parses just enough of a single, non-fat Mach-O image to
//! hand the core engines a [`SegmentIndex`] and the byte ranges of the
//! `LC_DYLD_INFO(_ONLY)`, `LC_DYLD_EXPORTS_TRIE` and `LC_DYLD_CHAINED_FIXUPS`
//! commands. It does not validate command sizes defensively and does not
//! parse the symbol table or any other load command; that parsing belongs
//! to a full Mach-O library, not this crate's core.

use crate::error::MachOError;
use crate::flags::LCLoadCommand;
use crate::header::MachHeader;
use crate::segment::{Protection, SGFlags, Section, Segment, SegmentIndex};

/// A `(offset, size)` byte range lifted straight off a load command, not
/// yet bounds-checked against the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileRange {
    pub offset: u32,
    pub size: u32,
}

impl FileRange {
    fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bytes<'a>(&self, image: &'a [u8]) -> Option<&'a [u8]> {
        if self.is_empty() {
            return Some(&[]);
        }
        let start = self.offset as usize;
        let end = start.checked_add(self.size as usize)?;
        image.get(start..end)
    }
}

/// The five sub-ranges of `LC_DYLD_INFO`/`LC_DYLD_INFO_ONLY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DyldInfoRanges {
    pub rebase: FileRange,
    pub bind: FileRange,
    pub weak_bind: FileRange,
    pub lazy_bind: FileRange,
    pub export: FileRange,
}

/// The parsed subset of a Mach-O image this crate's core engines need:
/// header, segment/section table, and the handful of `LC_DYLD_*` ranges.
#[derive(Debug)]
pub struct MachOImage {
    pub header: MachHeader,
    pub segments: SegmentIndex,
    pub dyld_info: Option<DyldInfoRanges>,
    pub exports_trie: Option<FileRange>,
    pub chained_fixups: Option<FileRange>,
}

struct LoadCommandHeader {
    cmd: u32,
    cmdsize: u32,
}

impl LoadCommandHeader {
    fn parse(bytes: &[u8]) -> Result<Self, MachOError> {
        let cmd = bytes
            .get(0..4)
            .ok_or(MachOError::Parse { what: "load command cmd" })?;
        let cmdsize = bytes
            .get(4..8)
            .ok_or(MachOError::Parse { what: "load command cmdsize" })?;
        Ok(LoadCommandHeader {
            cmd: u32::from_le_bytes(cmd.try_into().unwrap()),
            cmdsize: u32::from_le_bytes(cmdsize.try_into().unwrap()),
        })
    }
}

impl MachOImage {
    /// Parses `image` as a single-architecture Mach-O file: header, then
    /// walks `ncmds` load commands, fully parsing `LC_SEGMENT`/
    /// `LC_SEGMENT_64` into [`Segment`]s and recording the byte ranges of
    /// the `LC_DYLD_*` commands the core consumes. Every other load
    /// command is skipped over via its `cmdsize`.
    pub fn parse(image: &[u8]) -> Result<Self, MachOError> {
        let magic_bytes = image
            .get(0..4)
            .ok_or(MachOError::Parse { what: "magic" })?;
        let magic = u32::from_le_bytes(magic_bytes.try_into().unwrap());

        let (_, header) = MachHeader::parse(image).map_err(|_| MachOError::BadMagic(magic))?;

        let mut offset = header.size();
        let mut segments = Vec::new();
        let mut dyld_info = None;
        let mut exports_trie = None;
        let mut chained_fixups = None;

        for index in 0..header.ncmds() {
            let cmd_bytes = image
                .get(offset..)
                .ok_or(MachOError::Parse { what: "load command" })?;
            let lc = LoadCommandHeader::parse(cmd_bytes)?;
            let body = cmd_bytes
                .get(8..lc.cmdsize as usize)
                .ok_or(MachOError::CommandOverrun { index, cmdsize: lc.cmdsize })?;

            match LCLoadCommand::try_from_cmd(lc.cmd) {
                Some(LCLoadCommand::LcSegment) => {
                    segments.push(parse_segment_command32(body)?);
                }
                Some(LCLoadCommand::LcSegment64) => {
                    segments.push(parse_segment_command64(body)?);
                }
                Some(LCLoadCommand::LcDyldInfo) | Some(LCLoadCommand::LcDyldInfoOnly) => {
                    dyld_info = Some(parse_dyld_info_command(body)?);
                }
                Some(LCLoadCommand::LcDyldExportsTrie) => {
                    exports_trie = Some(parse_linkedit_data_command(body)?);
                }
                Some(LCLoadCommand::LcDyldChainedFixups) => {
                    chained_fixups = Some(parse_linkedit_data_command(body)?);
                }
                _ => {}
            }

            offset += lc.cmdsize as usize;
        }

        Ok(MachOImage {
            header,
            segments: SegmentIndex::new(segments),
            dyld_info,
            exports_trie,
            chained_fixups,
        })
    }
}

impl LCLoadCommand {
    /// `LCLoadCommand`'s `Nom` derive reads big-endian (matching
    /// `FatMagic`'s on-disk byte order); load command `cmd` fields are
    /// little-endian, so this matches the handful of variants this front
    /// end cares about directly instead of going through that derive.
    fn try_from_cmd(cmd: u32) -> Option<LCLoadCommand> {
        match cmd {
            0x1 => Some(LCLoadCommand::LcSegment),
            0x19 => Some(LCLoadCommand::LcSegment64),
            0x22 => Some(LCLoadCommand::LcDyldInfo),
            x if x == 0x22 | LCLoadCommand::LC_REQ_DYLD => Some(LCLoadCommand::LcDyldInfoOnly),
            x if x == 0x33 | LCLoadCommand::LC_REQ_DYLD => Some(LCLoadCommand::LcDyldExportsTrie),
            x if x == 0x34 | LCLoadCommand::LC_REQ_DYLD => Some(LCLoadCommand::LcDyldChainedFixups),
            _ => None,
        }
    }
}

fn parse_u32(bytes: &[u8], off: usize) -> Result<u32, MachOError> {
    bytes
        .get(off..off + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or(MachOError::Parse { what: "u32 field" })
}

fn parse_u64(bytes: &[u8], off: usize) -> Result<u64, MachOError> {
    bytes
        .get(off..off + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or(MachOError::Parse { what: "u64 field" })
}

fn parse_segname(bytes: &[u8], off: usize) -> Result<String, MachOError> {
    let raw = bytes
        .get(off..off + 16)
        .ok_or(MachOError::Parse { what: "segname" })?;
    let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..nul]).into_owned())
}

/// `segment_command_64` body (after the 8-byte `cmd`/`cmdsize` header):
/// segname[16] vmaddr(8) vmsize(8) fileoff(8) filesize(8) maxprot(4)
/// initprot(4) nsects(4) flags(4), followed by `nsects` `section_64`s.
fn parse_segment_command64(body: &[u8]) -> Result<Segment, MachOError> {
    let segname = parse_segname(body, 0)?;
    let vmaddr = parse_u64(body, 16)?;
    let vmsize = parse_u64(body, 24)?;
    let fileoff = parse_u64(body, 32)?;
    let filesize = parse_u64(body, 40)?;
    let maxprot = Protection::from_bits_truncate(parse_u32(body, 48)?);
    let initprot = Protection::from_bits_truncate(parse_u32(body, 52)?);
    let nsects = parse_u32(body, 56)?;
    let flags = SGFlags::from_bits_truncate(parse_u32(body, 60)?);

    let mut sections = Vec::with_capacity(nsects as usize);
    let mut cursor = body
        .get(64..)
        .ok_or(MachOError::Parse { what: "section_64 table" })?;
    for _ in 0..nsects {
        let (rest, section) = Section::parse64(cursor).map_err(|_| MachOError::Parse {
            what: "section_64",
        })?;
        sections.push(section);
        cursor = rest;
    }

    Ok(Segment {
        segname,
        vm_range: vmaddr..vmaddr + vmsize,
        file_range: fileoff..fileoff + filesize,
        maxprot,
        initprot,
        flags,
        sections,
    })
}

/// `segment_command` (32-bit) body: segname[16] vmaddr(4) vmsize(4)
/// fileoff(4) filesize(4) maxprot(4) initprot(4) nsects(4) flags(4),
/// followed by `nsects` `section`s.
fn parse_segment_command32(body: &[u8]) -> Result<Segment, MachOError> {
    let segname = parse_segname(body, 0)?;
    let vmaddr = parse_u32(body, 16)? as u64;
    let vmsize = parse_u32(body, 20)? as u64;
    let fileoff = parse_u32(body, 24)? as u64;
    let filesize = parse_u32(body, 28)? as u64;
    let maxprot = Protection::from_bits_truncate(parse_u32(body, 32)?);
    let initprot = Protection::from_bits_truncate(parse_u32(body, 36)?);
    let nsects = parse_u32(body, 40)?;
    let flags = SGFlags::from_bits_truncate(parse_u32(body, 44)?);

    let mut sections = Vec::with_capacity(nsects as usize);
    let mut cursor = body
        .get(48..)
        .ok_or(MachOError::Parse { what: "section table" })?;
    for _ in 0..nsects {
        let (rest, section) = Section::parse32(cursor).map_err(|_| MachOError::Parse {
            what: "section",
        })?;
        sections.push(section);
        cursor = rest;
    }

    Ok(Segment {
        segname,
        vm_range: vmaddr..vmaddr + vmsize,
        file_range: fileoff..fileoff + filesize,
        maxprot,
        initprot,
        flags,
        sections,
    })
}

/// `dyld_info_command` body: five `(offset, size)` `u32` pairs, in the
/// order rebase/bind/weak_bind/lazy_bind/export.
fn parse_dyld_info_command(body: &[u8]) -> Result<DyldInfoRanges, MachOError> {
    let field = |off: usize| -> Result<FileRange, MachOError> {
        Ok(FileRange {
            offset: parse_u32(body, off)?,
            size: parse_u32(body, off + 4)?,
        })
    };
    Ok(DyldInfoRanges {
        rebase: field(0)?,
        bind: field(8)?,
        weak_bind: field(16)?,
        lazy_bind: field(24)?,
        export: field(32)?,
    })
}

/// `linkedit_data_command` body: `(dataoff, datasize)` as `u32`s.
fn parse_linkedit_data_command(body: &[u8]) -> Result<FileRange, MachOError> {
    Ok(FileRange {
        offset: parse_u32(body, 0)?,
        size: parse_u32(body, 4)?,
    })
}
