//! De-virtualizer (component D): turns a VM address back into a pointer
//! into the mapped image, honoring segment (and optionally section)
//! boundaries.

use crate::segment::SegmentIndex;

/// Borrows the mapped image and a segment index to answer
/// `vmaddr -> file bytes` queries. Does not own the image.
#[derive(Debug, Clone, Copy)]
pub struct DeVirtualizer<'a> {
    image: &'a [u8],
    segments: &'a SegmentIndex,
}

impl<'a> DeVirtualizer<'a> {
    pub fn new(image: &'a [u8], segments: &'a SegmentIndex) -> Self {
        DeVirtualizer { image, segments }
    }

    pub fn segments(&self) -> &'a SegmentIndex {
        self.segments
    }

    fn file_offset_for_vm(&self, addr: u64) -> Option<u64> {
        let (_, seg) = self.segments.segment_for_vm(addr)?;
        let delta = addr - seg.vm_range.start;
        let offset = seg.file_range.start + delta;
        if offset < seg.file_range.end {
            Some(offset)
        } else {
            None
        }
    }

    /// Resolves `addr` to a `size`-byte slice of the mapped image, bounded
    /// by the owning segment's file range.
    pub fn ptr_for_vm(&self, addr: u64, size: u64) -> Option<&'a [u8]> {
        let (_, seg) = self.segments.segment_for_vm(addr)?;
        let delta = addr.checked_sub(seg.vm_range.start)?;
        let offset = seg.file_range.start.checked_add(delta)?;
        let end = offset.checked_add(size)?;
        if end > seg.file_range.end {
            return None;
        }
        self.image.get(offset as usize..end as usize)
    }

    /// Same as [`Self::ptr_for_vm`] but bounded by a specific
    /// `(segname, sectname)` section rather than the whole segment.
    pub fn ptr_for_vm_in_section(
        &self,
        segname: &str,
        sectname: &str,
        addr: u64,
        size: u64,
    ) -> Option<&'a [u8]> {
        let section = self.segments.section_named(segname, sectname)?;
        if !section.vm_range.contains(&addr) {
            return None;
        }
        let delta = addr - section.vm_range.start;
        let offset = section.file_range.start + delta;
        let end = offset.checked_add(size)?;
        if end > section.file_range.end {
            return None;
        }
        self.image.get(offset as usize..end as usize)
    }

    /// Reads a NUL-terminated string at `addr`, bounded by the containing
    /// section if one can be found, otherwise by the containing segment.
    pub fn string_at(&self, addr: u64) -> Option<&'a str> {
        let (_, seg) = self.segments.segment_for_vm(addr)?;
        let bound_end = seg
            .sections
            .iter()
            .find(|s| s.vm_range.contains(&addr))
            .map(|s| s.file_range.end)
            .unwrap_or(seg.file_range.end);

        let start = self.file_offset_for_vm(addr)?;
        let haystack = self.image.get(start as usize..bound_end as usize)?;
        let nul = haystack.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&haystack[..nul]).ok()
    }

    pub fn u64_at(&self, addr: u64) -> Option<u64> {
        let bytes = self.ptr_for_vm(addr, 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn u32_at(&self, addr: u64) -> Option<u32> {
        let bytes = self.ptr_for_vm(addr, 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }
}
