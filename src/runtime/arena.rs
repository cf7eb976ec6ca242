//! Contiguous buffer arena.
//!
//! One block is reserved up front and sliced into fixed-size segments.
//! Each segment is a disjoint view into the same allocation, so handing
//! segments to I/O contexts never allocates and never copies.

use crate::error::{Error, Result};
use bytes::BytesMut;

/// A fixed-size slice of the arena, loaned permanently to one I/O context.
#[derive(Debug)]
pub struct Segment {
    /// Byte offset of this segment within the arena block.
    offset: usize,
    /// View over `[offset, offset + len)` of the block.
    buf: BytesMut,
}

impl Segment {
    /// Offset of the segment within the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the segment in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Start address, used to verify segments are carved from one block.
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }
}

/// One owned byte block, issued sequentially as fixed-size segments.
///
/// Segments are never returned individually; they live as long as the
/// contexts that hold them.
#[derive(Debug)]
pub struct BufferArena {
    /// Not-yet-issued tail of the block.
    unissued: BytesMut,
    /// Size of each segment.
    segment_size: usize,
    /// Total number of segments in the block.
    count: usize,
    /// Segments handed out so far.
    issued: usize,
}

impl BufferArena {
    /// Reserve a block of `count * segment_size` bytes.
    ///
    /// Fails with [`Error::Capacity`] when the size is zero or exceeds the
    /// largest allocation the platform can address.
    pub fn allocate(count: usize, segment_size: usize) -> Result<Self> {
        let total = count
            .checked_mul(segment_size)
            .filter(|&total| total > 0 && total <= isize::MAX as usize)
            .ok_or(Error::Capacity {
                count,
                segment_size,
            })?;

        Ok(Self {
            unissued: BytesMut::zeroed(total),
            segment_size,
            count,
            issued: 0,
        })
    }

    /// Hand out the next unused segment.
    ///
    /// Returns [`Error::Exhausted`] once every segment has been issued.
    pub fn issue_segment(&mut self) -> Result<Segment> {
        if self.issued == self.count {
            return Err(Error::Exhausted {
                issued: self.issued,
            });
        }

        let offset = self.issued * self.segment_size;
        let buf = self.unissued.split_to(self.segment_size);
        self.issued += 1;

        Ok(Segment { offset, buf })
    }

    /// Size of each segment.
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Total number of segments.
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Segments not yet issued.
    pub fn remaining(&self) -> usize {
        self.count - self.issued
    }

    /// Size of the whole block in bytes.
    pub fn total_bytes(&self) -> usize {
        self.count * self.segment_size
    }
}
