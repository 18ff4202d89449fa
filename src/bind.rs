//! Bind opcode iterator (component E) and bind action iterator (component
//! F), including the ARM64e threaded sub-machine.

use crate::config::{BindVmConfig, PointerSize};
use crate::error::{BindActionError, BindOpcodeError};
use crate::leb::{read_sleb128, read_uleb128};
use crate::opcode::{sign_extend_special_ordinal, OpcodeByte};
use crate::segment::SegmentIndex;

/// Which of the three bind bytecodes is being interpreted. Lazy fixes the
/// write kind to `Pointer` and is a concatenation of per-symbol streams
/// separated by `Done`; Weak forbids setting a dylib ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindKind {
    Normal,
    Lazy,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Pointer = 0,
    TextAbs32 = 1,
    TextPCRel32 = 2,
}

impl WriteKind {
    fn from_immediate(imm: u8) -> Option<Self> {
        match imm {
            0 => Some(WriteKind::Pointer),
            1 => Some(WriteKind::TextAbs32),
            2 => Some(WriteKind::TextPCRel32),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindSymbolFlags: u8 {
        const WEAK_IMPORT = 0x1;
        const NON_WEAK_DEFINITION = 0x8;
    }
}

const OP_DONE: u8 = 0x00;
const OP_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const OP_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
const OP_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const OP_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const OP_SET_KIND_IMM: u8 = 0x50;
const OP_SET_ADDEND_SLEB: u8 = 0x60;
const OP_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const OP_ADD_ADDR_ULEB: u8 = 0x80;
const OP_DO_BIND: u8 = 0x90;
const OP_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
const OP_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
const OP_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
const OP_THREADED: u8 = 0xD0;

const THREADED_SET_ORDINAL_TABLE_SIZE: u8 = 0x0;
const THREADED_APPLY: u8 = 0x1;

/// One decoded event from the bind opcode stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BindOpcodeKind {
    Done,
    SetDylibOrdinal(i64),
    SetSymbol { name: String, flags: BindSymbolFlags },
    SetKind(WriteKind),
    SetAddend(i64),
    SetSegmentAndOffset { segment_index: u8, offset: u64 },
    AddAddr(i64),
    DoBind,
    DoBindAddAddr(i64),
    DoBindAddAddrImmScaled(u8),
    DoBindUlebTimesSkippingUleb { count: u64, skip: i64 },
    ThreadedSetOrdinalTableSize(u64),
    ThreadedApply,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindOpcodeEvent {
    pub raw_byte: u8,
    pub kind: BindOpcodeKind,
}

/// Single-pass decoder over a bind byte range (component E).
pub struct BindOpcodeIterator<'a> {
    bytes: &'a [u8],
    pos: usize,
    stream_kind: BindKind,
    done: bool,
}

impl<'a> BindOpcodeIterator<'a> {
    pub fn new(bytes: &'a [u8], stream_kind: BindKind) -> Self {
        BindOpcodeIterator {
            bytes,
            pos: 0,
            stream_kind,
            done: false,
        }
    }

    fn read_u8(&mut self) -> Result<u8, BindOpcodeError> {
        let b = *self.bytes.get(self.pos).ok_or(BindOpcodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_uleb(&mut self) -> Result<u64, BindOpcodeError> {
        let (v, used) = read_uleb128(&self.bytes[self.pos..])?;
        self.pos += used;
        Ok(v)
    }

    fn read_sleb(&mut self) -> Result<i64, BindOpcodeError> {
        let (v, used) = read_sleb128(&self.bytes[self.pos..])?;
        self.pos += used;
        Ok(v)
    }

    fn read_cstr(&mut self) -> Result<String, BindOpcodeError> {
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(BindOpcodeError::InvalidString)?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }

    fn require(&self, cond: bool, opcode: u8) -> Result<(), BindOpcodeError> {
        if cond {
            Ok(())
        } else {
            Err(BindOpcodeError::IllegalBindOpcode(opcode))
        }
    }

    fn step(&mut self, ob: OpcodeByte) -> Result<BindOpcodeKind, BindOpcodeError> {
        use BindKind::*;
        match ob.opcode {
            OP_DONE => Ok(BindOpcodeKind::Done),
            OP_SET_DYLIB_ORDINAL_IMM => {
                self.require(self.stream_kind != Weak, ob.opcode)?;
                Ok(BindOpcodeKind::SetDylibOrdinal(ob.immediate as i64))
            }
            OP_SET_DYLIB_ORDINAL_ULEB => {
                self.require(self.stream_kind != Weak, ob.opcode)?;
                let v = self.read_uleb()?;
                Ok(BindOpcodeKind::SetDylibOrdinal(v as i64))
            }
            OP_SET_DYLIB_SPECIAL_IMM => {
                self.require(self.stream_kind != Weak, ob.opcode)?;
                let ordinal = sign_extend_special_ordinal(ob.immediate);
                if crate::opcode::SpecialDylibOrdinal::from_ordinal(ordinal).is_none() {
                    return Err(BindOpcodeError::UnrecognizedSpecialDylibOrdinal(ordinal));
                }
                Ok(BindOpcodeKind::SetDylibOrdinal(ordinal))
            }
            OP_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let name = self.read_cstr()?;
                if name.is_empty() {
                    return Err(BindOpcodeError::EmptySymbol);
                }
                Ok(BindOpcodeKind::SetSymbol {
                    name,
                    flags: BindSymbolFlags::from_bits_truncate(ob.immediate),
                })
            }
            OP_SET_KIND_IMM => {
                self.require(self.stream_kind != Lazy, ob.opcode)?;
                let kind = WriteKind::from_immediate(ob.immediate)
                    .ok_or(BindOpcodeError::UnrecognizedBindWriteKind(ob.immediate))?;
                Ok(BindOpcodeKind::SetKind(kind))
            }
            OP_SET_ADDEND_SLEB => Ok(BindOpcodeKind::SetAddend(self.read_sleb()?)),
            OP_SET_SEGMENT_AND_OFFSET_ULEB => {
                let offset = self.read_uleb()?;
                Ok(BindOpcodeKind::SetSegmentAndOffset {
                    segment_index: ob.immediate,
                    offset,
                })
            }
            OP_ADD_ADDR_ULEB => {
                self.require(self.stream_kind != Lazy, ob.opcode)?;
                Ok(BindOpcodeKind::AddAddr(self.read_sleb()?))
            }
            OP_DO_BIND => Ok(BindOpcodeKind::DoBind),
            OP_DO_BIND_ADD_ADDR_ULEB => {
                self.require(self.stream_kind != Lazy, ob.opcode)?;
                Ok(BindOpcodeKind::DoBindAddAddr(self.read_sleb()?))
            }
            OP_DO_BIND_ADD_ADDR_IMM_SCALED => {
                self.require(self.stream_kind != Lazy, ob.opcode)?;
                Ok(BindOpcodeKind::DoBindAddAddrImmScaled(ob.immediate))
            }
            OP_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                self.require(self.stream_kind != Lazy, ob.opcode)?;
                let count = self.read_uleb()?;
                let skip = self.read_sleb()?;
                Ok(BindOpcodeKind::DoBindUlebTimesSkippingUleb { count, skip })
            }
            OP_THREADED => match ob.immediate {
                THREADED_SET_ORDINAL_TABLE_SIZE => {
                    let size = self.read_uleb()?;
                    Ok(BindOpcodeKind::ThreadedSetOrdinalTableSize(size))
                }
                THREADED_APPLY => Ok(BindOpcodeKind::ThreadedApply),
                sub => Err(BindOpcodeError::UnrecognizedBindSubOpcode(sub)),
            },
            op => Err(BindOpcodeError::UnrecognizedBindOpcode(op)),
        }
    }
}

impl<'a> Iterator for BindOpcodeIterator<'a> {
    type Item = Result<BindOpcodeEvent, BindOpcodeError>;

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
                if kind == BindOpcodeKind::Done && self.stream_kind != BindKind::Lazy {
                    self.done = true;
                }
                Some(Ok(BindOpcodeEvent {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{Protection, SGFlags, Segment};

    fn one_segment(file_size: u64) -> SegmentIndex {
        SegmentIndex::new(vec![Segment {
            segname: "__DATA".into(),
            vm_range: 0x1000..0x1000 + file_size,
            file_range: 0..file_size,
            maxprot: Protection::READ | Protection::WRITE,
            initprot: Protection::READ | Protection::WRITE,
            flags: SGFlags::empty(),
            sections: Vec::new(),
        }])
    }

    fn byte_cstr(name: &str) -> Vec<u8> {
        let mut v = name.as_bytes().to_vec();
        v.push(0);
        v
    }

    /// A single normal bind: set ordinal, symbol, pointer kind, segment and
    /// offset, then bind once.
    #[test]
    fn single_bind_emits_one_action() {
        let segs = one_segment(0x40);
        let image = vec![0u8; 0x40];
        let mut bytes = vec![
            OpcodeByte::pack(OP_SET_DYLIB_ORDINAL_IMM, 1),
            OpcodeByte::pack(OP_SET_SYMBOL_TRAILING_FLAGS_IMM, 0),
        ];
        bytes.extend(byte_cstr("foo"));
        bytes.push(OpcodeByte::pack(OP_SET_KIND_IMM, 0));
        bytes.push(OpcodeByte::pack(OP_SET_SEGMENT_AND_OFFSET_ULEB, 0));
        bytes.push(0x10);
        bytes.push(OpcodeByte::pack(OP_DO_BIND, 0));
        bytes.push(OpcodeByte::pack(OP_DONE, 0));

        let config = BindVmConfig::default();
        let mut it = BindActionIterator::new(&bytes, BindKind::Normal, &segs, &image, config);
        let action = it.next().unwrap().unwrap();
        assert_eq!(action.symbol, "foo");
        assert_eq!(action.dylib_ordinal, 1);
        assert_eq!(action.segment_index, 0);
        assert_eq!(action.addr_in_seg, 0x10);
        assert_eq!(action.write_kind, WriteKind::Pointer);
        assert!(it.next().is_none());
    }

    /// A repeated bind lays down `count` actions spaced `8 + skip` bytes
    /// apart.
    #[test]
    fn repeat_bind_emits_count_actions_with_skip() {
        let segs = one_segment(0x40);
        let image = vec![0u8; 0x40];
        let mut bytes = vec![
            OpcodeByte::pack(OP_SET_DYLIB_ORDINAL_IMM, 1),
            OpcodeByte::pack(OP_SET_SYMBOL_TRAILING_FLAGS_IMM, 0),
        ];
        bytes.extend(byte_cstr("bar"));
        bytes.push(OpcodeByte::pack(OP_SET_KIND_IMM, 0));
        bytes.push(OpcodeByte::pack(OP_SET_SEGMENT_AND_OFFSET_ULEB, 0));
        bytes.push(0x00);
        bytes.push(OpcodeByte::pack(OP_DO_BIND_ULEB_TIMES_SKIPPING_ULEB, 0));
        bytes.push(3); // count
        bytes.push(4); // skip
        bytes.push(OpcodeByte::pack(OP_DONE, 0));

        let config = BindVmConfig::default();
        let it = BindActionIterator::new(&bytes, BindKind::Normal, &segs, &image, config);
        let actions: Vec<BindAction> = it.map(Result::unwrap).collect();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].addr_in_seg, 0);
        assert_eq!(actions[1].addr_in_seg, 12);
        assert_eq!(actions[2].addr_in_seg, 24);
    }

    /// A malformed `SET_SEGMENT_AND_OFFSET_ULEB` operand near `u64::MAX`
    /// must surface as `OutOfBoundsSegmentAddr`, not panic on overflow when
    /// bounds-checking `offset + pointer_size`.
    #[test]
    fn huge_segment_offset_does_not_panic() {
        let segs = one_segment(0x40);
        let image = vec![0u8; 0x40];
        let mut bytes = vec![
            OpcodeByte::pack(OP_SET_DYLIB_ORDINAL_IMM, 1),
            OpcodeByte::pack(OP_SET_SYMBOL_TRAILING_FLAGS_IMM, 0),
        ];
        bytes.extend(byte_cstr("foo"));
        bytes.push(OpcodeByte::pack(OP_SET_KIND_IMM, 0));
        bytes.push(OpcodeByte::pack(OP_SET_SEGMENT_AND_OFFSET_ULEB, 0));
        // ULEB128 encoding of u64::MAX.
        bytes.extend([0xff; 9]);
        bytes.push(0x01);
        bytes.push(OpcodeByte::pack(OP_DO_BIND, 0));
        bytes.push(OpcodeByte::pack(OP_DONE, 0));

        let config = BindVmConfig::default();
        let mut it = BindActionIterator::new(&bytes, BindKind::Normal, &segs, &image, config);
        let err = it.next().unwrap().unwrap_err();
        assert_eq!(err, BindActionError::OutOfBoundsSegmentAddr);
    }

    /// Weak bind streams may not set a dylib ordinal.
    #[test]
    fn weak_stream_rejects_set_dylib_ordinal() {
        let segs = one_segment(0x40);
        let image = vec![0u8; 0x40];
        let bytes = vec![OpcodeByte::pack(OP_SET_DYLIB_ORDINAL_IMM, 1)];

        let config = BindVmConfig::default();
        let mut it = BindActionIterator::new(&bytes, BindKind::Weak, &segs, &image, config);
        let err = it.next().unwrap().unwrap_err();
        assert!(matches!(
            err,
            BindActionError::Opcode(BindOpcodeError::IllegalBindOpcode(_))
        ));
    }

    /// A bind that lands exactly at the end of the segment succeeds; the
    /// advance past it is deferred to the following call, not discarded.
    #[test]
    fn out_of_bounds_advance_is_deferred_after_successful_emit() {
        let segs = one_segment(0x20);
        let image = vec![0u8; 0x20];
        let mut bytes = vec![
            OpcodeByte::pack(OP_SET_DYLIB_ORDINAL_IMM, 1),
            OpcodeByte::pack(OP_SET_SYMBOL_TRAILING_FLAGS_IMM, 0),
        ];
        bytes.extend(byte_cstr("baz"));
        bytes.push(OpcodeByte::pack(OP_SET_KIND_IMM, 0));
        bytes.push(OpcodeByte::pack(OP_SET_SEGMENT_AND_OFFSET_ULEB, 0));
        bytes.push(0x18);
        bytes.push(OpcodeByte::pack(OP_DO_BIND, 0));
        bytes.push(OpcodeByte::pack(OP_DONE, 0));

        let config = BindVmConfig::default();
        let mut it = BindActionIterator::new(&bytes, BindKind::Normal, &segs, &image, config);
        let action = it.next().unwrap().unwrap();
        assert_eq!(action.addr_in_seg, 0x18);
        let err = it.next().unwrap().unwrap_err();
        assert_eq!(err, BindActionError::OutOfBoundsSegmentAddr);
        assert!(it.next().is_none());
    }

    /// The ARM64e threaded sub-machine: fill the ordinal table via repeated
    /// `DoBind`s, then walk an in-image chain of two binds.
    #[test]
    fn threaded_bind_fills_table_then_walks_chain() {
        let segs = one_segment(0x40);
        let mut image = vec![0u8; 0x40];
        let word1: u64 = (1u64 << 62) | (1u64 << 51); // is_bind, stride 1, ordinal 0
        let word2: u64 = (1u64 << 62) | 1; // is_bind, stride 0, ordinal 1
        image[0x10..0x18].copy_from_slice(&word1.to_le_bytes());
        image[0x18..0x20].copy_from_slice(&word2.to_le_bytes());

        let mut bytes = vec![
            OpcodeByte::pack(OP_THREADED, THREADED_SET_ORDINAL_TABLE_SIZE),
            2,
            OpcodeByte::pack(OP_SET_SYMBOL_TRAILING_FLAGS_IMM, 0),
        ];
        bytes.extend(byte_cstr("sym0"));
        bytes.push(OpcodeByte::pack(OP_SET_DYLIB_ORDINAL_IMM, 5));
        bytes.push(OpcodeByte::pack(OP_DO_BIND, 0));
        bytes.push(OpcodeByte::pack(OP_SET_SYMBOL_TRAILING_FLAGS_IMM, 0));
        bytes.extend(byte_cstr("sym1"));
        bytes.push(OpcodeByte::pack(OP_SET_DYLIB_ORDINAL_IMM, 6));
        bytes.push(OpcodeByte::pack(OP_DO_BIND, 0));
        bytes.push(OpcodeByte::pack(OP_SET_SEGMENT_AND_OFFSET_ULEB, 0));
        bytes.push(0x10);
        bytes.push(OpcodeByte::pack(OP_THREADED, THREADED_APPLY));
        bytes.push(OpcodeByte::pack(OP_DONE, 0));

        let config = BindVmConfig::default();
        let mut it = BindActionIterator::new(&bytes, BindKind::Normal, &segs, &image, config);

        let a0 = it.next().unwrap().unwrap();
        assert_eq!(a0.symbol, "sym0");
        assert_eq!(a0.dylib_ordinal, 5);
        assert_eq!(a0.addr_in_seg, 0x10);

        let a1 = it.next().unwrap().unwrap();
        assert_eq!(a1.symbol, "sym1");
        assert_eq!(a1.dylib_ordinal, 6);
        assert_eq!(a1.addr_in_seg, 0x18);

        assert!(it.next().is_none());
    }

    /// Weak bind streams never carry a dylib ordinal opcode; the emitted
    /// action still succeeds, defaulting the ordinal to 0.
    #[test]
    fn weak_bind_succeeds_without_dylib_ordinal() {
        let segs = one_segment(0x40);
        let image = vec![0u8; 0x40];
        let mut bytes = vec![OpcodeByte::pack(OP_SET_SYMBOL_TRAILING_FLAGS_IMM, 0)];
        bytes.extend(byte_cstr("weak_sym"));
        bytes.push(OpcodeByte::pack(OP_SET_KIND_IMM, 0));
        bytes.push(OpcodeByte::pack(OP_SET_SEGMENT_AND_OFFSET_ULEB, 0));
        bytes.push(0x10);
        bytes.push(OpcodeByte::pack(OP_DO_BIND, 0));
        bytes.push(OpcodeByte::pack(OP_DONE, 0));

        let config = BindVmConfig::default();
        let mut it = BindActionIterator::new(&bytes, BindKind::Weak, &segs, &image, config);
        let action = it.next().unwrap().unwrap();
        assert_eq!(action.symbol, "weak_sym");
        assert_eq!(action.dylib_ordinal, 0);
    }

    /// `ThreadedApply` before the table is full is a fatal error.
    #[test]
    fn threaded_apply_before_table_full_is_fatal() {
        let segs = one_segment(0x40);
        let image = vec![0u8; 0x40];
        let bytes = vec![
            OpcodeByte::pack(OP_THREADED, THREADED_SET_ORDINAL_TABLE_SIZE),
            2,
            OpcodeByte::pack(OP_SET_SEGMENT_AND_OFFSET_ULEB, 0),
            0x10,
            OpcodeByte::pack(OP_THREADED, THREADED_APPLY),
        ];

        let config = BindVmConfig::default();
        let mut it = BindActionIterator::new(&bytes, BindKind::Normal, &segs, &image, config);
        let err = it.next().unwrap().unwrap_err();
        assert_eq!(err, BindActionError::NotEnoughThreadedBinds);
        assert!(it.next().is_none());
    }
}

/// A concrete bind action: "at this VM address, store the runtime address
/// of `symbol` from dylib `dylib_ordinal`".
#[derive(Debug, Clone, PartialEq)]
pub struct BindAction {
    pub kind: BindKind,
    pub write_kind: WriteKind,
    pub segment_index: u8,
    pub addr_in_seg: u64,
    pub dylib_ordinal: i64,
    pub symbol: String,
    pub addend: i64,
    pub flags: BindSymbolFlags,
}

impl BindAction {
    /// The VM address this action writes to, given the owning segment.
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

#[derive(Debug, Clone)]
struct ThreadedOrdinalEntry {
    symbol: String,
    dylib_ordinal: i64,
    addend: i64,
    flags: BindSymbolFlags,
}

/// Folds bind opcode events into bind actions (component F), including the
/// ARM64e threaded sub-machine.
pub struct BindActionIterator<'a> {
    opcodes: BindOpcodeIterator<'a>,
    kind: BindKind,
    segments: &'a SegmentIndex,
    image: &'a [u8],
    pointer_size: PointerSize,

    dylib_ordinal: Option<i64>,
    write_kind: Option<WriteKind>,
    segment_index: Option<u8>,
    segment_offset: u64,
    symbol: Option<String>,
    flags: BindSymbolFlags,
    addend: i64,

    pending: PendingRepeat,

    threaded_table: Option<Vec<ThreadedOrdinalEntry>>,
    threaded_table_capacity: usize,
    threaded_chain_active: bool,
    finished: bool,
    /// An error discovered while advancing the cursor *after* a successful
    /// emit (spec S4: the action is still surfaced; the error surfaces on
    /// the following call to `next`).
    pending_error: Option<BindActionError>,
}

impl<'a> BindActionIterator<'a> {
    pub fn new(
        bytes: &'a [u8],
        kind: BindKind,
        segments: &'a SegmentIndex,
        image: &'a [u8],
        config: BindVmConfig,
    ) -> Self {
        BindActionIterator {
            opcodes: BindOpcodeIterator::new(bytes, kind),
            kind,
            segments,
            image,
            pointer_size: config.pointer_size,
            dylib_ordinal: None,
            write_kind: if kind == BindKind::Lazy {
                Some(WriteKind::Pointer)
            } else {
                None
            },
            segment_index: None,
            segment_offset: 0,
            symbol: None,
            flags: BindSymbolFlags::empty(),
            addend: 0,
            pending: PendingRepeat::default(),
            threaded_table: None,
            threaded_table_capacity: 0,
            threaded_chain_active: false,
            finished: false,
            pending_error: None,
        }
    }

    /// Emits the current action, then advances the cursor by `stride`. If
    /// the advance fails, the action is still returned; the error is
    /// deferred to the next call to `next`.
    fn emit_and_advance(&mut self, stride: i64) -> Option<Result<BindAction, BindActionError>> {
        let result = self.emit();
        if let Err(e) = self.advance_offset(stride) {
            self.pending_error = Some(e);
        }
        Some(result.map_err(|e| {
            self.finished = !e.is_recoverable();
            e
        }))
    }

    fn advance_offset(&mut self, delta: i64) -> Result<(), BindActionError> {
        let new_offset = if delta >= 0 {
            self.segment_offset.checked_add(delta as u64)
        } else {
            self.segment_offset.checked_sub((-delta) as u64)
        }
        .ok_or(BindActionError::OutOfBoundsSegmentAddr)?;
        self.check_in_bounds(new_offset)?;
        self.segment_offset = new_offset;
        Ok(())
    }

    fn check_in_bounds(&self, offset: u64) -> Result<(), BindActionError> {
        let idx = self.segment_index.ok_or(BindActionError::NoSegmentIndex)?;
        let seg = self
            .segments
            .get(idx as usize)
            .ok_or(BindActionError::InvalidSegmentIndex(idx))?;
        let size = seg.file_range.end - seg.file_range.start;
        let end = offset
            .checked_add(self.pointer_size.bytes())
            .ok_or(BindActionError::OutOfBoundsSegmentAddr)?;
        if end > size {
            return Err(BindActionError::OutOfBoundsSegmentAddr);
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<BindAction, BindActionError> {
        let idx = self.segment_index.ok_or(BindActionError::NoSegmentIndex)?;
        // Weak streams never set a dylib ordinal (the opcode is illegal for
        // them); the invariant requiring one is waived in that case.
        let ordinal = if self.kind == BindKind::Weak {
            self.dylib_ordinal.unwrap_or(0)
        } else {
            self.dylib_ordinal.ok_or(BindActionError::NoDylibOrdinal)?
        };
        let write_kind = self.write_kind.ok_or(BindActionError::NoWriteKind)?;
        let symbol = self.symbol.clone().unwrap_or_default();
        self.check_in_bounds(self.segment_offset)?;
        Ok(BindAction {
            kind: self.kind,
            write_kind,
            segment_index: idx,
            addr_in_seg: self.segment_offset,
            dylib_ordinal: ordinal,
            symbol,
            addend: self.addend,
            flags: self.flags,
        })
    }

    /// During threaded-bind table fill, a plain `DoBind` pushes the
    /// accumulated `(symbol, ordinal, addend, flags)` tuple into the
    /// ordinal table instead of emitting an action at a VM address.
    fn push_threaded_ordinal_entry(&mut self) -> Result<(), BindActionError> {
        let ordinal = self.dylib_ordinal.ok_or(BindActionError::NoDylibOrdinal)?;
        let symbol = self.symbol.clone().unwrap_or_default();
        let table = self.threaded_table.as_mut().expect("checked by caller");
        if table.len() >= self.threaded_table_capacity {
            return Err(BindActionError::TooManyThreadedBinds);
        }
        table.push(ThreadedOrdinalEntry {
            symbol,
            dylib_ordinal: ordinal,
            addend: self.addend,
            flags: self.flags,
        });
        Ok(())
    }

    fn read_chain_word(&self, vm_offset_in_seg: u64) -> Option<u64> {
        let idx = self.segment_index?;
        let seg = self.segments.get(idx as usize)?;
        let file_off = seg.file_range.start + vm_offset_in_seg;
        let end = file_off + 8;
        if end > self.image.len() as u64 {
            return None;
        }
        let bytes = &self.image[file_off as usize..end as usize];
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    fn step_threaded_chain(&mut self) -> Option<Result<BindAction, BindActionError>> {
        let word = match self.read_chain_word(self.segment_offset) {
            Some(w) => w,
            None => return Some(Err(BindActionError::OutOfBoundsSegmentAddr)),
        };
        let is_bind = (word >> 62) & 0x1 != 0;
        let stride_words = (word & 0x3FF8_0000_0000_0000) >> 51;
        let payload = word & 0x0007_FFFF_FFFF_FFFF;

        let result = if is_bind {
            let ordinal = payload & 0xFFFF;
            let table = self.threaded_table.as_ref();
            match table.and_then(|t| t.get(ordinal as usize)) {
                Some(entry) => {
                    let action = BindAction {
                        kind: self.kind,
                        write_kind: WriteKind::Pointer,
                        segment_index: self.segment_index.unwrap(),
                        addr_in_seg: self.segment_offset,
                        dylib_ordinal: entry.dylib_ordinal,
                        symbol: entry.symbol.clone(),
                        addend: entry.addend,
                        flags: entry.flags,
                    };
                    Some(Ok(action))
                }
                None => Some(Err(BindActionError::InvalidThreadOrdinal(ordinal))),
            }
        } else {
            None
        };

        if stride_words == 0 {
            self.threaded_chain_active = false;
        } else {
            self.segment_offset += stride_words * self.pointer_size.bytes();
        }
        result
    }
}

impl<'a> Iterator for BindActionIterator<'a> {
    type Item = Result<BindAction, BindActionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            self.finished = !e.is_recoverable();
            return Some(Err(e));
        }
        if self.finished {
            return None;
        }

        if self.threaded_chain_active {
            match self.step_threaded_chain() {
                Some(item) => return Some(item),
                None if self.threaded_chain_active => return self.next(),
                None => {} // chain ended on a non-bind entry; resume opcode decoding
            }
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
                    return Some(Err(BindActionError::Opcode(e)));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            };

            use BindOpcodeKind::*;
            match event.kind {
                Done => {
                    if self.kind != BindKind::Lazy {
                        self.finished = true;
                        return None;
                    }
                    self.dylib_ordinal = None;
                    self.symbol = None;
                    self.addend = 0;
                    self.flags = BindSymbolFlags::empty();
                    continue;
                }
                SetDylibOrdinal(o) => self.dylib_ordinal = Some(o),
                SetSymbol { name, flags } => {
                    self.symbol = Some(name);
                    self.flags = flags;
                }
                SetKind(k) => self.write_kind = Some(k),
                SetAddend(a) => self.addend = a,
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
                DoBind => {
                    if self.threaded_table.is_some() {
                        if let Err(e) = self.push_threaded_ordinal_entry() {
                            self.finished = true;
                            return Some(Err(e));
                        }
                        continue;
                    }
                    let stride = self.pointer_size.bytes() as i64;
                    return self.emit_and_advance(stride);
                }
                DoBindAddAddr(extra) => {
                    let stride = self.pointer_size.bytes() as i64 + extra;
                    return self.emit_and_advance(stride);
                }
                DoBindAddAddrImmScaled(imm) => {
                    let stride = self.pointer_size.bytes() as i64 * (imm as i64 + 1);
                    return self.emit_and_advance(stride);
                }
                DoBindUlebTimesSkippingUleb { count, skip } => {
                    if count == 0 {
                        continue;
                    }
                    let result = self.emit();
                    self.pending = PendingRepeat {
                        remaining: count - 1,
                        stride: self.pointer_size.bytes() as i64 + skip,
                        active: count > 1,
                    };
                    if let Err(e) = self.advance_offset(self.pointer_size.bytes() as i64 + skip) {
                        self.pending_error = Some(e);
                    }
                    return Some(result.map_err(|e| {
                        self.finished = !e.is_recoverable();
                        e
                    }));
                }
                ThreadedSetOrdinalTableSize(size) => {
                    self.threaded_table_capacity = size as usize;
                    self.threaded_table = Some(Vec::with_capacity(size as usize));
                }
                ThreadedApply => {
                    let full = self
                        .threaded_table
                        .as_ref()
                        .map(|t| t.len() == self.threaded_table_capacity)
                        .unwrap_or(false);
                    if !full {
                        self.finished = true;
                        return Some(Err(BindActionError::NotEnoughThreadedBinds));
                    }
                    self.threaded_chain_active = true;
                    return self.next();
                }
            }

        }
    }
}
