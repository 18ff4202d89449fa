//! Export trie iterator (component H): a depth-first walk of a
//! prefix-compressed trie, yielding every terminal (export) with its
//! accumulated symbol string.

use std::ops::Range;

use crate::config::ExportTrieConfig;
use crate::error::ExportTrieError;
use crate::leb::read_uleb128;

const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

/// Which structural shape a terminal node's payload takes. Weak-definition
/// is orthogonal and lives in `ExportEntry::flags`, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Regular,
    Absolute,
    ThreadLocal,
    Reexport,
    StubAndResolver,
}

/// One exported symbol: the accumulated path from the trie root plus its
/// terminal payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportEntry {
    pub symbol: String,
    pub kind: ExportKind,
    pub flags: u64,
    pub image_offset: Option<u64>,
    pub reexport_dylib_ordinal: Option<u64>,
    pub reexport_import_name: Option<String>,
    pub resolver_stub_address: Option<u64>,
    pub resolver_address: Option<u64>,
}

impl ExportEntry {
    pub fn is_weak_definition(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0
    }
}

struct Terminal {
    kind: ExportKind,
    flags: u64,
    image_offset: Option<u64>,
    reexport_dylib_ordinal: Option<u64>,
    reexport_import_name: Option<String>,
    resolver_stub_address: Option<u64>,
    resolver_address: Option<u64>,
}

fn parse_terminal(bytes: &[u8]) -> Result<Terminal, ExportTrieError> {
    let (flags, used) = read_uleb128(bytes)?;
    let mut pos = used;

    if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
        let (ordinal, used) = read_uleb128(&bytes[pos..])?;
        pos += used;
        let rest = &bytes[pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ExportTrieError::UnterminatedString)?;
        let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
        return Ok(Terminal {
            kind: ExportKind::Reexport,
            flags,
            image_offset: None,
            reexport_dylib_ordinal: Some(ordinal),
            reexport_import_name: Some(name),
            resolver_stub_address: None,
            resolver_address: None,
        });
    }

    if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
        let (stub, used) = read_uleb128(&bytes[pos..])?;
        pos += used;
        let (resolver, _used) = read_uleb128(&bytes[pos..])?;
        return Ok(Terminal {
            kind: ExportKind::StubAndResolver,
            flags,
            image_offset: None,
            reexport_dylib_ordinal: None,
            reexport_import_name: None,
            resolver_stub_address: Some(stub),
            resolver_address: Some(resolver),
        });
    }

    let (offset, _used) = read_uleb128(&bytes[pos..])?;
    let kind = match flags & EXPORT_SYMBOL_FLAGS_KIND_MASK {
        EXPORT_SYMBOL_FLAGS_KIND_REGULAR => ExportKind::Regular,
        EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL => ExportKind::ThreadLocal,
        EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE => ExportKind::Absolute,
        other => return Err(ExportTrieError::UnrecognizedExportKind(other)),
    };
    Ok(Terminal {
        kind,
        flags,
        image_offset: Some(offset),
        reexport_dylib_ordinal: None,
        reexport_import_name: None,
        resolver_stub_address: None,
        resolver_address: None,
    })
}

struct Frame {
    edges: Vec<(String, u64)>,
    next_edge: usize,
    name_buf_len: usize,
}

/// Depth-first walk over a prefix-compressed export trie (component H).
pub struct ExportTrieIterator<'a> {
    bytes: &'a [u8],
    stack: Vec<Frame>,
    name_buf: String,
    visited_ranges: Vec<Range<usize>>,
    max_depth: u32,
    started: bool,
    done: bool,
}

impl<'a> ExportTrieIterator<'a> {
    pub fn new(bytes: &'a [u8], config: ExportTrieConfig) -> Self {
        ExportTrieIterator {
            bytes,
            stack: Vec::new(),
            name_buf: String::new(),
            visited_ranges: Vec::new(),
            max_depth: config.max_depth,
            started: false,
            done: false,
        }
    }

    fn push_node(&mut self, offset: usize) -> Result<Option<ExportEntry>, ExportTrieError> {
        if self.stack.len() as u32 >= self.max_depth {
            return Err(ExportTrieError::TooDeep(self.max_depth));
        }

        let mut pos = offset;
        let header = self
            .bytes
            .get(pos..)
            .ok_or(ExportTrieError::InvalidFormat(offset as u64))?;
        let (terminal_size, used) = read_uleb128(header)?;
        pos += used;

        let mut terminal = None;
        if terminal_size != 0 {
            let term_end = pos
                .checked_add(terminal_size as usize)
                .ok_or(ExportTrieError::InvalidFormat(offset as u64))?;
            let term_bytes = self
                .bytes
                .get(pos..term_end)
                .ok_or(ExportTrieError::InvalidFormat(offset as u64))?;
            terminal = Some(parse_terminal(term_bytes)?);
            pos = term_end;
        }

        let child_count = *self
            .bytes
            .get(pos)
            .ok_or(ExportTrieError::InvalidFormat(offset as u64))?;
        pos += 1;

        let mut edges = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            let rest = self
                .bytes
                .get(pos..)
                .ok_or(ExportTrieError::InvalidFormat(offset as u64))?;
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(ExportTrieError::UnterminatedString)?;
            let label = String::from_utf8_lossy(&rest[..nul]).into_owned();
            pos += nul + 1;
            let (child_offset, used) = read_uleb128(
                self.bytes
                    .get(pos..)
                    .ok_or(ExportTrieError::InvalidFormat(offset as u64))?,
            )?;
            pos += used;
            edges.push((label, child_offset));
        }

        if terminal.is_none() && child_count == 0 {
            return Err(ExportTrieError::InvalidFormat(offset as u64));
        }

        let range = offset..pos;
        if self
            .visited_ranges
            .iter()
            .any(|r| r.start < range.end && range.start < r.end)
        {
            return Err(ExportTrieError::OverlappingRanges);
        }
        self.visited_ranges.push(range);

        let entry = terminal.map(|t| {
            // An empty on-wire import name means "same name as the export".
            let reexport_import_name = t.reexport_import_name.map(|name| {
                if name.is_empty() {
                    self.name_buf.clone()
                } else {
                    name
                }
            });
            ExportEntry {
                symbol: self.name_buf.clone(),
                kind: t.kind,
                flags: t.flags,
                image_offset: t.image_offset,
                reexport_dylib_ordinal: t.reexport_dylib_ordinal,
                reexport_import_name,
                resolver_stub_address: t.resolver_stub_address,
                resolver_address: t.resolver_address,
            }
        });
        if let Some(e) = &entry {
            if e.symbol.is_empty() {
                return Err(ExportTrieError::EmptyExport);
            }
        }

        let name_buf_len = self.name_buf.len();
        self.stack.push(Frame {
            edges,
            next_edge: 0,
            name_buf_len,
        });
        Ok(entry)
    }

    /// One DFS step: `Ok(Some(entry))` when the visited node has terminal
    /// data, `Ok(None)` for an interior node, and `Ok(..)` wrapped in
    /// `None` at the `Iterator` layer once the stack empties.
    fn step(&mut self) -> Result<Option<Option<ExportEntry>>, ExportTrieError> {
        if self.stack.is_empty() {
            if !self.started {
                self.started = true;
                return Ok(Some(self.push_node(0)?));
            }
            return Ok(None);
        }

        let name_buf_len = self.stack.last().unwrap().name_buf_len;
        self.name_buf.truncate(name_buf_len);

        let has_more = {
            let frame = self.stack.last().unwrap();
            frame.next_edge < frame.edges.len()
        };
        if !has_more {
            self.stack.pop();
            return self.step();
        }

        let (label, child_offset) = {
            let frame = self.stack.last_mut().unwrap();
            let edge = frame.edges[frame.next_edge].clone();
            frame.next_edge += 1;
            edge
        };
        self.name_buf.push_str(&label);
        Ok(Some(self.push_node(child_offset as usize)?))
    }
}

impl<'a> Iterator for ExportTrieIterator<'a> {
    type Item = Result<ExportEntry, ExportTrieError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.step() {
                Ok(Some(Some(entry))) => return Some(Ok(entry)),
                Ok(Some(None)) => continue,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Convenience wrapper over [`ExportTrieIterator`] — interior nodes are
/// already skipped by the base iterator, so this is just a type alias in
/// practice, kept as a named entry point for callers who only want exports.
pub fn exports_only<'a>(bytes: &'a [u8], config: ExportTrieConfig) -> ExportTrieIterator<'a> {
    ExportTrieIterator::new(bytes, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(mut v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
        out
    }

    fn cstr(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    /// Builds `root_prefix ++ uleb(child_offset) ++ child_node`, solving for
    /// the self-referential `child_offset` (the uleb encoding's own length
    /// affects the offset it encodes) by fixed-point iteration.
    fn node_with_one_child(root_prefix: &[u8], child_node: &[u8]) -> Vec<u8> {
        let mut offset_guess = root_prefix.len() + 1;
        loop {
            let enc = uleb(offset_guess as u64);
            let total_prefix = root_prefix.len() + enc.len();
            if total_prefix == offset_guess {
                let mut bytes = root_prefix.to_vec();
                bytes.extend(enc);
                bytes.extend(child_node);
                return bytes;
            }
            offset_guess = total_prefix;
        }
    }

    /// Root -> "foo" -> terminal (regular export at offset 0x100).
    #[test]
    fn single_regular_export() {
        let mut terminal = uleb(0); // flags = regular
        terminal.extend(uleb(0x100)); // image_offset
        let mut foo_node = uleb(terminal.len() as u64);
        foo_node.extend(&terminal);
        foo_node.push(0); // no children

        let mut root_prefix = uleb(0); // terminal_size = 0 (no export at root)
        root_prefix.push(1); // child_count
        root_prefix.extend(cstr("foo"));

        let bytes = node_with_one_child(&root_prefix, &foo_node);

        let config = ExportTrieConfig::default();
        let entries: Vec<ExportEntry> = ExportTrieIterator::new(&bytes, config)
            .map(Result::unwrap)
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].symbol, "foo");
        assert_eq!(entries[0].kind, ExportKind::Regular);
        assert_eq!(entries[0].image_offset, Some(0x100));
    }

    #[test]
    fn reexport_carries_dylib_ordinal_and_import_name() {
        let mut terminal = uleb(EXPORT_SYMBOL_FLAGS_REEXPORT);
        terminal.extend(uleb(3)); // dylib ordinal
        terminal.extend(cstr("_orig"));
        let mut node = uleb(terminal.len() as u64);
        node.extend(&terminal);
        node.push(0);

        let mut root_prefix = uleb(0);
        root_prefix.push(1);
        root_prefix.extend(cstr("bar"));

        let bytes = node_with_one_child(&root_prefix, &node);

        let config = ExportTrieConfig::default();
        let entries: Vec<ExportEntry> = ExportTrieIterator::new(&bytes, config)
            .map(Result::unwrap)
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].symbol, "bar");
        assert_eq!(entries[0].kind, ExportKind::Reexport);
        assert_eq!(entries[0].reexport_dylib_ordinal, Some(3));
        assert_eq!(entries[0].reexport_import_name.as_deref(), Some("_orig"));
    }

    /// S6: an empty on-wire re-export import name means "same name as the
    /// export" and must surface as the accumulated export path, not `""`.
    #[test]
    fn reexport_with_empty_import_name_uses_export_symbol() {
        let mut terminal = uleb(EXPORT_SYMBOL_FLAGS_REEXPORT);
        terminal.extend(uleb(1)); // dylib ordinal
        terminal.extend(cstr("")); // empty import name on the wire
        let mut node = uleb(terminal.len() as u64);
        node.extend(&terminal);
        node.push(0);

        let mut root_prefix = uleb(0);
        root_prefix.push(1);
        root_prefix.extend(cstr("_CFRelease"));

        let bytes = node_with_one_child(&root_prefix, &node);

        let config = ExportTrieConfig::default();
        let entries: Vec<ExportEntry> = ExportTrieIterator::new(&bytes, config)
            .map(Result::unwrap)
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].symbol, "_CFRelease");
        assert_eq!(
            entries[0].reexport_import_name.as_deref(),
            Some("_CFRelease")
        );
    }

    #[test]
    fn empty_root_export_is_rejected() {
        let mut bytes = uleb(1); // terminal_size = 1
        bytes.push(0); // flags = 0 (regular, but missing the uleb image_offset -> truncated)
        bytes.push(0); // child_count
        let config = ExportTrieConfig::default();
        let mut it = ExportTrieIterator::new(&bytes, config);
        assert!(it.next().unwrap().is_err());
    }

    #[test]
    fn depth_cap_is_enforced() {
        let config = ExportTrieConfig { max_depth: 0 };
        let bytes = uleb(0)
            .into_iter()
            .chain(std::iter::once(0u8))
            .collect::<Vec<u8>>();
        let mut it = ExportTrieIterator::new(&bytes, config);
        let err = it.next().unwrap().unwrap_err();
        assert_eq!(err, ExportTrieError::TooDeep(0));
    }
}
