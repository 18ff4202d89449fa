//! Rebase opcode iterator and rebase action iterator (component G). Same
//! shape as the bind iterators in `bind.rs`, minus symbols and dylib
//! ordinals.

use crate::config::{BindVmConfig, PointerSize};
use crate::error::{RebaseError, RebaseOpcodeError};
use crate::leb::{read_sleb128, read_uleb128};
use crate::opcode::OpcodeByte;
use crate::segment::SegmentIndex;

pub use crate::bind::WriteKind;

const OP_DONE: u8 = 0x00;
const OP_SET_KIND_IMM: u8 = 0x10;
const OP_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const OP_ADD_ADDR_ULEB: u8 = 0x30;
const OP_ADD_ADDR_IMM_SCALED: u8 = 0x40;
const OP_DO_REBASE_IMM_TIMES: u8 = 0x50;
const OP_DO_REBASE_ULEB_TIMES: u8 = 0x60;
const OP_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
const OP_DO_REBASE_ULEB_TIMES_SKIP_ULEB: u8 = 0x80;

/// One decoded event from the rebase opcode stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RebaseOpcodeKind {
    Done,
    SetKind(WriteKind),
    SetSegmentAndOffset { segment_index: u8, offset: u64 },
    AddAddr(i64),
    /// Raw, unscaled immediate; the action iterator multiplies by
    /// `pointer_size.bytes()` (spec §4.3: "advance offset by
    /// `immediate * pointer_size`").
    AddAddrScaled(i64),
    DoRebaseImmTimes(u8),
    DoRebaseUlebTimes(u64),
    DoRebaseAddAddr(i64),
    DoRebaseUlebTimesSkipUleb { count: u64, skip: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebaseOpcodeEvent {
    pub raw_byte: u8,
    pub kind: RebaseOpcodeKind,
}

/// Single-pass decoder over a rebase byte range (component G, opcode half).
pub struct RebaseOpcodeIterator<'a> {
    bytes: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> RebaseOpcodeIterator<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        RebaseOpcodeIterator {
            bytes,
            pos: 0,
            done: false,
        }
    }

    fn read_u8(&mut self) -> Result<u8, RebaseOpcodeError> {
        let b = *self.bytes.get(self.pos).ok_or(RebaseOpcodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_uleb(&mut self) -> Result<u64, RebaseOpcodeError> {
        let (v, used) = read_uleb128(&self.bytes[self.pos..])?;
        self.pos += used;
        Ok(v)
    }

    fn read_sleb(&mut self) -> Result<i64, RebaseOpcodeError> {
        let (v, used) = read_sleb128(&self.bytes[self.pos..])?;
        self.pos += used;
        Ok(v)
    }

    fn step(&mut self, ob: OpcodeByte) -> Result<RebaseOpcodeKind, RebaseOpcodeError> {
        match ob.opcode {
            OP_DONE => Ok(RebaseOpcodeKind::Done),
            OP_SET_KIND_IMM => {
                let kind = match ob.immediate {
                    0 => WriteKind::Pointer,
                    1 => WriteKind::TextAbs32,
                    2 => WriteKind::TextPCRel32,
                    other => return Err(RebaseOpcodeError::UnrecognizedRebaseWriteKind(other)),
                };
                Ok(RebaseOpcodeKind::SetKind(kind))
            }
            OP_SET_SEGMENT_AND_OFFSET_ULEB => {
                let offset = self.read_uleb()?;
                Ok(RebaseOpcodeKind::SetSegmentAndOffset {
                    segment_index: ob.immediate,
                    offset,
                })
            }
            OP_ADD_ADDR_ULEB => Ok(RebaseOpcodeKind::AddAddr(self.read_sleb()?)),
            OP_ADD_ADDR_IMM_SCALED => Ok(RebaseOpcodeKind::AddAddrScaled(ob.immediate as i64)),
            OP_DO_REBASE_IMM_TIMES => Ok(RebaseOpcodeKind::DoRebaseImmTimes(ob.immediate)),
            OP_DO_REBASE_ULEB_TIMES => Ok(RebaseOpcodeKind::DoRebaseUlebTimes(self.read_uleb()?)),
            OP_DO_REBASE_ADD_ADDR_ULEB => {
                Ok(RebaseOpcodeKind::DoRebaseAddAddr(self.read_sleb()?))
            }
            OP_DO_REBASE_ULEB_TIMES_SKIP_ULEB => {
                let count = self.read_uleb()?;
                let skip = self.read_sleb()?;
                Ok(RebaseOpcodeKind::DoRebaseUlebTimesSkipUleb { count, skip })
            }
            op => Err(RebaseOpcodeError::UnrecognizedRebaseOpcode(op)),
        }
    }
}

impl<'a> Iterator for RebaseOpcodeIterator<'a> {
    type Item = Result<RebaseOpcodeEvent, RebaseOpcodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.bytes.len() {
            return None;
        }
        let byte = match self.read_u8() {
            Ok(b) => b,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let ob = OpcodeByte::parse(byte);
        match self.step(ob) {
            Ok(kind) => {
                if kind == RebaseOpcodeKind::Done {
                    self.done = true;
                }
                Some(Ok(RebaseOpcodeEvent {
                    raw_byte: byte,
                    kind,
                }))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A concrete rebase action: "at this VM address, rebase the stored
/// pointer/offset by the image's slide".
#[derive(Debug, Clone, PartialEq)]
pub struct RebaseAction {
    pub write_kind: WriteKind,
    pub segment_index: u8,
    pub addr_in_seg: u64,
}

impl RebaseAction {
    pub fn vm_address(&self, segments: &SegmentIndex) -> Option<u64> {
        let seg = segments.get(self.segment_index as usize)?;
        Some(seg.vm_range.start + self.addr_in_seg)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PendingRepeat {
    remaining: u64,
    stride: i64,
    active: bool,
}

/// Folds rebase opcode events into rebase actions (component G, action
/// half). Mirrors `bind::BindActionIterator`'s deferred-error pattern.
pub struct RebaseActionIterator<'a> {
    opcodes: RebaseOpcodeIterator<'a>,
    segments: &'a SegmentIndex,
    pointer_size: PointerSize,

    write_kind: Option<WriteKind>,
    segment_index: Option<u8>,
    segment_offset: u64,

    pending: PendingRepeat,
    finished: bool,
    pending_error: Option<RebaseError>,
}

impl<'a> RebaseActionIterator<'a> {
    pub fn new(bytes: &'a [u8], segments: &'a SegmentIndex, config: BindVmConfig) -> Self {
        RebaseActionIterator {
            opcodes: RebaseOpcodeIterator::new(bytes),
            segments,
            pointer_size: config.pointer_size,
            write_kind: None,
            segment_index: None,
            segment_offset: 0,
            pending: PendingRepeat::default(),
            finished: false,
            pending_error: None,
        }
    }

    fn emit_and_advance(&mut self, stride: i64) -> Option<Result<RebaseAction, RebaseError>> {
        let result = self.emit();
        if let Err(e) = self.advance_offset(stride) {
            self.pending_error = Some(e);
        }
        Some(result.map_err(|e| {
            self.finished = !e.is_recoverable();
            e
        }))
    }

    fn advance_offset(&mut self, delta: i64) -> Result<(), RebaseError> {
        let new_offset = if delta >= 0 {
            self.segment_offset.checked_add(delta as u64)
        } else {
            self.segment_offset.checked_sub((-delta) as u64)
        }
        .ok_or(RebaseError::OutOfBoundsSegmentAddr)?;
        self.check_in_bounds(new_offset)?;
        self.segment_offset = new_offset;
        Ok(())
    }

    fn check_in_bounds(&self, offset: u64) -> Result<(), RebaseError> {
        let idx = self.segment_index.ok_or(RebaseError::NoSegmentIndex)?;
        let seg = self
            .segments
            .get(idx as usize)
            .ok_or(RebaseError::InvalidSegmentIndex(idx))?;
        let size = seg.file_range.end - seg.file_range.start;
        let end = offset
            .checked_add(self.pointer_size.bytes())
            .ok_or(RebaseError::OutOfBoundsSegmentAddr)?;
        if end > size {
            return Err(RebaseError::OutOfBoundsSegmentAddr);
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<RebaseAction, RebaseError> {
        let idx = self.segment_index.ok_or(RebaseError::NoSegmentIndex)?;
        let write_kind = self.write_kind.ok_or(RebaseError::NoWriteKind)?;
        self.check_in_bounds(self.segment_offset)?;
        Ok(RebaseAction {
            write_kind,
            segment_index: idx,
            addr_in_seg: self.segment_offset,
        })
    }
}

impl<'a> Iterator for RebaseActionIterator<'a> {
    type Item = Result<RebaseAction, RebaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            self.finished = !e.is_recoverable();
            return Some(Err(e));
        }
        if self.finished {
            return None;
        }

        if self.pending.active {
            let result = self.emit();
            self.pending.remaining -= 1;
            if self.pending.remaining == 0 {
                self.pending.active = false;
            } else if let Err(e) = self.advance_offset(self.pending.stride) {
                self.pending_error = Some(e);
            }
            return Some(result.map_err(|e| {
                self.finished = !e.is_recoverable();
                e
            }));
        }

        loop {
            let event = match self.opcodes.next() {
                Some(Ok(e)) => e,
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(RebaseError::Opcode(e)));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            };

            use RebaseOpcodeKind::*;
            match event.kind {
                Done => {
                    self.finished = true;
                    return None;
                }
                SetKind(k) => self.write_kind = Some(k),
                SetSegmentAndOffset {
                    segment_index,
                    offset,
                } => {
                    self.segment_index = Some(segment_index);
                    self.segment_offset = offset;
                }
                AddAddr(delta) => {
                    if let Err(e) = self.advance_offset(delta) {
                        let recoverable = e.is_recoverable();
                        self.finished = !recoverable;
                        return Some(Err(e));
                    }
                }
                AddAddrScaled(imm) => {
                    let delta = imm * self.pointer_size.bytes() as i64;
                    if let Err(e) = self.advance_offset(delta) {
                        let recoverable = e.is_recoverable();
                        self.finished = !recoverable;
                        return Some(Err(e));
                    }
                }
                DoRebaseImmTimes(count) => {
                    if count == 0 {
                        continue;
                    }
                    let stride = self.pointer_size.bytes() as i64;
                    let result = self.emit();
                    self.pending = PendingRepeat {
                        remaining: count as u64 - 1,
                        stride,
                        active: count > 1,
                    };
                    if let Err(e) = self.advance_offset(stride) {
                        self.pending_error = Some(e);
                    }
                    return Some(result.map_err(|e| {
                        self.finished = !e.is_recoverable();
                        e
                    }));
                }
                DoRebaseUlebTimes(count) => {
                    if count == 0 {
                        continue;
                    }
                    let stride = self.pointer_size.bytes() as i64;
                    let result = self.emit();
                    self.pending = PendingRepeat {
                        remaining: count - 1,
                        stride,
                        active: count > 1,
                    };
                    if let Err(e) = self.advance_offset(stride) {
                        self.pending_error = Some(e);
                    }
                    return Some(result.map_err(|e| {
                        self.finished = !e.is_recoverable();
                        e
                    }));
                }
                DoRebaseAddAddr(extra) => {
                    let stride = self.pointer_size.bytes() as i64 + extra;
                    return self.emit_and_advance(stride);
                }
                DoRebaseUlebTimesSkipUleb { count, skip } => {
                    if count == 0 {
                        continue;
                    }
                    let stride = self.pointer_size.bytes() as i64 + skip;
                    let result = self.emit();
                    self.pending = PendingRepeat {
                        remaining: count - 1,
                        stride,
                        active: count > 1,
                    };
                    if let Err(e) = self.advance_offset(stride) {
                        self.pending_error = Some(e);
                    }
                    return Some(result.map_err(|e| {
                        self.finished = !e.is_recoverable();
                        e
                    }));
                }
            }
        }
    }
}
