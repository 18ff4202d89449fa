//! Bind action collection (component I): folds the normal/lazy/weak bind
//! action streams into an address-keyed table with interned symbol
//! strings.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::bind::{BindAction, BindKind, BindSymbolFlags, WriteKind};
use crate::error::{BindActionError, CollectionError};
use crate::segment::SegmentIndex;

/// A folded bind action with its symbol interned against the collection's
/// symbol table.
#[derive(Debug, Clone)]
pub struct CollectedBind {
    pub kind: BindKind,
    pub write_kind: WriteKind,
    pub segment_index: u8,
    pub addr_in_seg: u64,
    pub dylib_ordinal: i64,
    pub symbol: Rc<str>,
    pub addend: i64,
    pub flags: BindSymbolFlags,
}

impl CollectedBind {
    /// Whether two collected binds describe the same write, ignoring which
    /// stream (`kind`) produced them.
    fn structurally_equal(&self, other: &CollectedBind) -> bool {
        self.write_kind == other.write_kind
            && self.segment_index == other.segment_index
            && self.addr_in_seg == other.addr_in_seg
            && self.dylib_ordinal == other.dylib_ordinal
            && self.symbol == other.symbol
            && self.addend == other.addend
            && self.flags == other.flags
    }
}

/// Address-keyed fold of bind actions from the normal, lazy and weak
/// streams, with symbol strings interned once per distinct name.
#[derive(Debug, Default)]
pub struct BindActionCollection {
    symbols: HashSet<Rc<str>>,
    actions: HashMap<u64, CollectedBind>,
}

impl BindActionCollection {
    pub fn new() -> Self {
        BindActionCollection {
            symbols: HashSet::new(),
            actions: HashMap::new(),
        }
    }

    fn intern(&mut self, name: &str) -> Rc<str> {
        if let Some(existing) = self.symbols.get(name) {
            return existing.clone();
        }
        let rc: Rc<str> = Rc::from(name);
        self.symbols.insert(rc.clone());
        rc
    }

    /// Folds one bind action stream (normal, lazy, or weak) into the
    /// collection. Stops at the first fatal error from the stream or a
    /// `MultipleBindsForAddress` collision.
    pub fn fold<I>(&mut self, stream: I, segments: &SegmentIndex) -> Result<(), CollectionError>
    where
        I: Iterator<Item = Result<BindAction, BindActionError>>,
    {
        for item in stream {
            let action = item?;
            let vm = action
                .vm_address(segments)
                .ok_or(BindActionError::InvalidSegmentIndex(action.segment_index))?;
            let symbol = self.intern(&action.symbol);
            let collected = CollectedBind {
                kind: action.kind,
                write_kind: action.write_kind,
                segment_index: action.segment_index,
                addr_in_seg: action.addr_in_seg,
                dylib_ordinal: action.dylib_ordinal,
                symbol,
                addend: action.addend,
                flags: action.flags,
            };
            match self.actions.get(&vm) {
                None => {
                    self.actions.insert(vm, collected);
                }
                Some(existing) if existing.structurally_equal(&collected) => {
                    // Same write observed from another stream; keep the first.
                }
                Some(_) => return Err(CollectionError::MultipleBindsForAddress(vm)),
            }
        }
        Ok(())
    }

    pub fn info_for_address(&self, vm: u64) -> Option<&CollectedBind> {
        self.actions.get(&vm)
    }

    pub fn symbol_for_address(&self, vm: u64) -> Option<&str> {
        self.actions.get(&vm).map(|a| a.symbol.as_ref())
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &CollectedBind)> {
        self.actions.iter()
    }
}
