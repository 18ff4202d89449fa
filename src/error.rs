use thiserror::Error;

/// Errors from the ULEB128/SLEB128 reader (component A).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum LebError {
    #[error("leb128 value ran past the end of the buffer")]
    Truncated,
    #[error("leb128 value exceeds 64 bits")]
    Overflow,
}

/// Errors from a bind or rebase opcode stream (components E, G).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BindOpcodeError {
    #[error("invalid leb128 operand: {0}")]
    InvalidLeb128(#[from] LebError),
    #[error("string operand is not null terminated")]
    InvalidString,
    #[error("bind symbol name was empty")]
    EmptySymbol,
    #[error("opcode 0x{0:02x} is illegal for this stream kind")]
    IllegalBindOpcode(u8),
    #[error("unrecognized write kind {0}")]
    UnrecognizedBindWriteKind(u8),
    #[error("unrecognized special dylib ordinal {0}")]
    UnrecognizedSpecialDylibOrdinal(i64),
    #[error("unrecognized threaded sub-opcode {0}")]
    UnrecognizedBindSubOpcode(u8),
    #[error("unrecognized bind opcode 0x{0:02x}")]
    UnrecognizedBindOpcode(u8),
    #[error("opcode stream ended mid-instruction")]
    Truncated,
}

/// Errors from folding bind opcode events into bind actions (component F).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BindActionError {
    #[error(transparent)]
    Opcode(#[from] BindOpcodeError),
    #[error("segment index {0} out of range")]
    InvalidSegmentIndex(u8),
    #[error("computed address is outside its segment's bounds")]
    OutOfBoundsSegmentAddr,
    #[error("no dylib ordinal was set before a bind opcode")]
    NoDylibOrdinal,
    #[error("no segment index was set before an address-advancing opcode")]
    NoSegmentIndex,
    #[error("no write kind was set before a bind opcode")]
    NoWriteKind,
    #[error("threaded bind table was not full before ThreadedApply")]
    NotEnoughThreadedBinds,
    #[error("threaded bind table overflowed its declared capacity")]
    TooManyThreadedBinds,
    #[error("threaded bind chain referenced ordinal {0} outside the table")]
    InvalidThreadOrdinal(u64),
}

impl BindActionError {
    /// True for states the action iterator can skip past and resume,
    /// matching the "ignorable" bucket in the opcode taxonomy (spec §4.2).
    pub fn is_recoverable(&self) -> bool {
        match self {
            BindActionError::Opcode(BindOpcodeError::EmptySymbol) => true,
            BindActionError::Opcode(_) => false,
            BindActionError::OutOfBoundsSegmentAddr
            | BindActionError::InvalidSegmentIndex(_)
            | BindActionError::NoDylibOrdinal
            | BindActionError::NoSegmentIndex
            | BindActionError::NoWriteKind
            | BindActionError::NotEnoughThreadedBinds
            | BindActionError::TooManyThreadedBinds
            | BindActionError::InvalidThreadOrdinal(_) => true,
        }
    }
}

/// Errors from a rebase opcode stream (component G).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RebaseOpcodeError {
    #[error("invalid leb128 operand: {0}")]
    InvalidLeb128(#[from] LebError),
    #[error("unrecognized rebase opcode 0x{0:02x}")]
    UnrecognizedRebaseOpcode(u8),
    #[error("unrecognized write kind {0}")]
    UnrecognizedRebaseWriteKind(u8),
    #[error("opcode stream ended mid-instruction")]
    Truncated,
}

/// Errors from folding rebase opcode events into rebase actions (component
/// G's action iterator).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RebaseError {
    #[error(transparent)]
    Opcode(#[from] RebaseOpcodeError),
    #[error("segment index {0} out of range")]
    InvalidSegmentIndex(u8),
    #[error("no segment index was set before an address-advancing opcode")]
    NoSegmentIndex,
    #[error("no write kind was set before a rebase opcode")]
    NoWriteKind,
    #[error("computed address is outside its segment's bounds")]
    OutOfBoundsSegmentAddr,
}

impl RebaseError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RebaseError::OutOfBoundsSegmentAddr
                | RebaseError::InvalidSegmentIndex(_)
                | RebaseError::NoSegmentIndex
                | RebaseError::NoWriteKind
        )
    }
}

/// Errors from walking the export trie (component H).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ExportTrieError {
    #[error("invalid leb128 operand: {0}")]
    Leb(#[from] LebError),
    #[error("node offset {0} is outside the trie data")]
    InvalidFormat(u64),
    #[error("edge string is not null terminated")]
    UnterminatedString,
    #[error("the decoded byte range for a node overlaps a previously visited range")]
    OverlappingRanges,
    #[error("terminal node at the root has an empty export name")]
    EmptyExport,
    #[error("trie depth exceeded the configured maximum of {0}")]
    TooDeep(u32),
    #[error("export flags encode an unrecognized kind")]
    UnrecognizedExportKind(u64),
}

/// Errors from folding bind actions into a collection (component I).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CollectionError {
    #[error(transparent)]
    Action(#[from] BindActionError),
    #[error("address 0x{0:x} received structurally different binds from two streams")]
    MultipleBindsForAddress(u64),
}

/// Errors from the Objective-C reconstructor (component J).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ObjcError {
    #[error("no recognizable Objective-C metadata section was found")]
    NoObjcData,
    #[error("section length is not a multiple of the pointer size")]
    UnalignedSection,
    #[error("read at address 0x{0:x} ran past its containing section")]
    DataOutOfBounds(u64),
    #[error("address 0x{0:x} does not resolve to any mapped segment")]
    InvalidAddress(u64),
}

/// Errors from the thin Mach-O front end (header/segment/command walk).
#[derive(Debug, Error)]
pub enum MachOError {
    #[error("unrecognized Mach-O magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("nom parse error while reading {what}")]
    Parse { what: &'static str },
    #[error("load command {index} claims cmdsize {cmdsize}, which runs past the command area")]
    CommandOverrun { index: u32, cmdsize: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
