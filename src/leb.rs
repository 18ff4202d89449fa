//! ULEB128/SLEB128 readers shared by the bind, rebase and export-trie
//! opcode streams.

use crate::error::LebError;

/// Reads a ULEB128-encoded value from the front of `bytes`.
///
/// Returns the decoded value and the number of bytes consumed. Rejects
/// encodings that would overflow a `u64` (more than 10 continuation groups
/// contributing non-zero bits above bit 63).
pub fn read_uleb128(bytes: &[u8]) -> Result<(u64, usize), LebError> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    let mut count = 0usize;

    for &byte in bytes {
        count += 1;
        let low7 = (byte & 0x7f) as u64;
        if shift >= 64 || (shift == 63 && low7 > 1) {
            return Err(LebError::Overflow);
        }
        result |= low7 << shift;
        if byte & 0x80 == 0 {
            return Ok((result, count));
        }
        shift += 7;
    }
    Err(LebError::Truncated)
}

/// Reads a SLEB128-encoded value from the front of `bytes`.
pub fn read_sleb128(bytes: &[u8]) -> Result<(i64, usize), LebError> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut count = 0usize;
    let mut byte = 0u8;

    for &b in bytes {
        byte = b;
        count += 1;
        if shift >= 64 {
            return Err(LebError::Overflow);
        }
        result |= ((byte & 0x7f) as i64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            break;
        }
    }
    if count == 0 || (byte & 0x80) != 0 {
        return Err(LebError::Truncated);
    }
    if shift < 64 && (byte & 0x40) != 0 {
        result |= -1i64 << shift;
    }
    Ok((result, count))
}
