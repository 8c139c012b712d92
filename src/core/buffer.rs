//! # Wire Buffer
//!
//! A growable byte queue made of fixed-size blocks.
//!
//! Blocks live in an arena (`Vec<Block>`) and the live chain is a queue of
//! arena indices, so appending at the tail and consuming from the head are
//! both O(1) amortized and never move previously written bytes. A block that
//! is fully drained goes back to a free list and is reused by later writes.
//!
//! ## Invariant
//! `size() == Σ(block.write − block.read)` over the live chain, and a live
//! block is never empty except transiently inside a single call.
//!
//! ## Usage
//! ```rust
//! use peer_link::core::buffer::WireBuffer;
//!
//! let mut buf = WireBuffer::with_block_size(8);
//! buf.write(b"hello, world");
//! assert_eq!(buf.size(), 12);
//!
//! let mut head = [0u8; 5];
//! buf.read(&mut head).unwrap();
//! assert_eq!(&head, b"hello");
//! assert_eq!(buf.size(), 7);
//! ```

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Default capacity of a single block (4KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

#[derive(Debug)]
struct Block {
    data: Box<[u8]>,
    read: usize,
    write: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.write - self.read
    }

    #[inline]
    fn space(&self) -> usize {
        self.data.len() - self.write
    }

    #[inline]
    fn readable(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

/// Chained block buffer with independent per-block read/write offsets.
#[derive(Debug)]
pub struct WireBuffer {
    blocks: Vec<Block>,
    chain: VecDeque<usize>,
    free: Vec<usize>,
    block_size: usize,
    size: usize,
}

impl Default for WireBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl WireBuffer {
    /// Create an empty buffer with the default block size
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Create an empty buffer whose blocks hold `block_size` bytes each
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            chain: VecDeque::new(),
            free: Vec::new(),
            block_size: block_size.max(1),
            size: 0,
        }
    }

    /// Create a buffer pre-filled with `data`, held in a single block
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::with_block_size(data.len());
        buf.write(data);
        buf
    }

    /// Number of readable bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks currently linked into the chain
    pub fn block_count(&self) -> usize {
        self.chain.len()
    }

    /// Number of drained blocks parked for reuse
    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    fn acquire_block(&mut self) -> usize {
        match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.blocks.push(Block::new(self.block_size));
                self.blocks.len() - 1
            }
        }
    }

    /// Index of a tail block with room for at least one byte, linking a new
    /// block if the current tail is full.
    fn writable_tail(&mut self) -> usize {
        if let Some(&idx) = self.chain.back() {
            if self.blocks[idx].space() > 0 {
                return idx;
            }
        }
        let idx = self.acquire_block();
        self.chain.push_back(idx);
        idx
    }

    fn recycle_head(&mut self) {
        if let Some(idx) = self.chain.pop_front() {
            self.blocks[idx].reset();
            self.free.push(idx);
        }
    }

    /// Append `data`, growing the chain as needed. Never fails.
    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let idx = self.writable_tail();
            let block = &mut self.blocks[idx];
            let n = block.space().min(data.len());
            block.data[block.write..block.write + n].copy_from_slice(&data[..n]);
            block.write += n;
            self.size += n;
            data = &data[n..];
        }
    }

    /// Advance the write cursor by `n` zeroed bytes and return the logical
    /// position of the first reserved byte, for a later [`overwrite`](Self::overwrite).
    ///
    /// Positions are relative to the current read cursor; consuming bytes
    /// before patching shifts them.
    pub fn reserve(&mut self, mut n: usize) -> usize {
        let pos = self.size;
        while n > 0 {
            let idx = self.writable_tail();
            let block = &mut self.blocks[idx];
            let step = block.space().min(n);
            block.data[block.write..block.write + step].fill(0);
            block.write += step;
            self.size += step;
            n -= step;
        }
        pos
    }

    /// Replace already written bytes starting at logical position `pos`.
    pub fn overwrite(&mut self, pos: usize, data: &[u8]) -> Result<()> {
        let end = pos.checked_add(data.len()).unwrap_or(usize::MAX);
        if end > self.size {
            return Err(ProtocolError::BufferOverflow {
                requested: end,
                limit: self.size,
            });
        }

        let mut skip = pos;
        let mut data = data;
        for &idx in &self.chain {
            if data.is_empty() {
                break;
            }
            let block = &mut self.blocks[idx];
            let len = block.len();
            if skip >= len {
                skip -= len;
                continue;
            }
            let start = block.read + skip;
            let n = (len - skip).min(data.len());
            block.data[start..start + n].copy_from_slice(&data[..n]);
            data = &data[n..];
            skip = 0;
        }
        Ok(())
    }

    #[inline]
    fn check_available(&self, n: usize) -> Result<()> {
        if n > self.size {
            return Err(ProtocolError::BufferUnderrun {
                requested: n,
                available: self.size,
            });
        }
        Ok(())
    }

    /// Remove `dest.len()` bytes from the front into `dest`.
    pub fn read(&mut self, dest: &mut [u8]) -> Result<()> {
        self.check_available(dest.len())?;

        let mut filled = 0;
        while filled < dest.len() {
            let Some(&idx) = self.chain.front() else {
                break;
            };
            let block = &mut self.blocks[idx];
            let n = block.len().min(dest.len() - filled);
            dest[filled..filled + n].copy_from_slice(&block.data[block.read..block.read + n]);
            block.read += n;
            filled += n;
            if block.len() == 0 {
                self.recycle_head();
            }
        }
        self.size -= filled;
        Ok(())
    }

    /// Copy `dest.len()` bytes from the front without consuming them.
    pub fn copy(&self, dest: &mut [u8]) -> Result<()> {
        self.check_available(dest.len())?;

        let mut filled = 0;
        for chunk in self.chunks() {
            if filled == dest.len() {
                break;
            }
            let n = chunk.len().min(dest.len() - filled);
            dest[filled..filled + n].copy_from_slice(&chunk[..n]);
            filled += n;
        }
        Ok(())
    }

    /// Discard `n` bytes from the front.
    pub fn skip(&mut self, mut n: usize) -> Result<()> {
        self.check_available(n)?;

        self.size -= n;
        while n > 0 {
            let Some(&idx) = self.chain.front() else {
                break;
            };
            let block = &mut self.blocks[idx];
            let step = block.len().min(n);
            block.read += step;
            n -= step;
            if block.len() == 0 {
                self.recycle_head();
            }
        }
        Ok(())
    }

    /// Remove `n` bytes from the front as a contiguous `Bytes`.
    pub fn take(&mut self, n: usize) -> Result<Bytes> {
        self.check_available(n)?;
        let mut out = BytesMut::zeroed(n);
        self.read(&mut out)?;
        Ok(out.freeze())
    }

    /// Remove everything into a contiguous `Bytes`.
    pub fn take_all(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.size);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        self.clear();
        out.freeze()
    }

    /// Consume the buffer into a contiguous `Bytes`. A single block filled
    /// from start to end is handed over without copying.
    pub fn into_bytes(mut self) -> Bytes {
        if self.chain.len() == 1 {
            let idx = self.chain[0];
            let block = &self.blocks[idx];
            if block.read == 0 && block.write == block.data.len() {
                return Bytes::from(std::mem::take(&mut self.blocks[idx].data));
            }
        }
        self.take_all()
    }

    /// Offset of the first `byte` within the first `max` readable bytes.
    pub fn find(&self, byte: u8, max: usize) -> Option<usize> {
        let mut seen = 0;
        for chunk in self.chunks() {
            if seen >= max {
                break;
            }
            let window = &chunk[..chunk.len().min(max - seen)];
            if let Some(i) = window.iter().position(|&b| b == byte) {
                return Some(seen + i);
            }
            seen += window.len();
        }
        None
    }

    /// Readable slices in order, one per live block.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.chain.iter().map(move |&idx| self.blocks[idx].readable())
    }

    /// Drop all readable bytes, keeping allocated blocks for reuse.
    pub fn clear(&mut self) {
        while !self.chain.is_empty() {
            self.recycle_head();
        }
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_sum(buf: &WireBuffer) -> usize {
        buf.chunks().map(|c| c.len()).sum()
    }

    #[test]
    fn test_write_read_across_blocks() {
        let mut buf = WireBuffer::with_block_size(4);
        buf.write(b"abcdefghij");
        assert_eq!(buf.size(), 10);
        assert_eq!(buf.block_count(), 3);

        let mut out = [0u8; 6];
        buf.read(&mut out).unwrap();
        assert_eq!(&out, b"abcdef");
        assert_eq!(buf.size(), 4);
        assert_eq!(buf.block_count(), 2);
        assert_eq!(live_sum(&buf), buf.size());
    }

    #[test]
    fn test_exact_block_boundary_leaves_no_empty_block() {
        let mut buf = WireBuffer::with_block_size(4);
        buf.write(b"abcd");
        assert_eq!(buf.block_count(), 1);
        buf.write(b"efgh");
        assert_eq!(buf.block_count(), 2);
        buf.write(b"");
        assert_eq!(buf.block_count(), 2);
    }

    #[test]
    fn test_reading_last_byte_recycles_block() {
        let mut buf = WireBuffer::with_block_size(4);
        buf.write(b"abcd");
        let mut out = [0u8; 4];
        buf.read(&mut out).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.block_count(), 0);
        assert_eq!(buf.free_blocks(), 1);

        // recycled block is reused rather than allocating
        buf.write(b"xy");
        assert_eq!(buf.free_blocks(), 0);
        assert_eq!(buf.block_count(), 1);
    }

    #[test]
    fn test_underrun_does_not_mutate() {
        let mut buf = WireBuffer::with_block_size(4);
        buf.write(b"abc");
        let mut out = [0u8; 4];
        let err = buf.read(&mut out).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BufferUnderrun {
                requested: 4,
                available: 3
            }
        ));
        assert_eq!(buf.size(), 3);
        assert!(buf.skip(4).is_err());
        assert!(buf.copy(&mut out).is_err());
        assert_eq!(buf.size(), 3);
    }

    #[test]
    fn test_copy_is_a_peek() {
        let mut buf = WireBuffer::with_block_size(3);
        buf.write(b"hello");
        let mut out = [0u8; 4];
        buf.copy(&mut out).unwrap();
        assert_eq!(&out, b"hell");
        assert_eq!(buf.size(), 5);
        assert_eq!(buf.take_all().as_ref(), b"hello");
    }

    #[test]
    fn test_skip_across_blocks() {
        let mut buf = WireBuffer::with_block_size(2);
        buf.write(b"0123456");
        buf.skip(5).unwrap();
        assert_eq!(buf.size(), 2);
        assert_eq!(buf.take(2).unwrap().as_ref(), b"56");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reserve_and_overwrite() {
        let mut buf = WireBuffer::with_block_size(3);
        buf.write(b"a");
        let pos = buf.reserve(4);
        buf.write(b"z");
        assert_eq!(pos, 1);
        assert_eq!(buf.size(), 6);

        buf.overwrite(pos, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buf.take_all().as_ref(), &[b'a', 1, 2, 3, 4, b'z']);
    }

    #[test]
    fn test_overwrite_out_of_range() {
        let mut buf = WireBuffer::new();
        buf.write(b"ab");
        assert!(matches!(
            buf.overwrite(1, b"xy"),
            Err(ProtocolError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_find_respects_max() {
        let mut buf = WireBuffer::with_block_size(2);
        buf.write(b"abc\0def");
        assert_eq!(buf.find(0, 10), Some(3));
        assert_eq!(buf.find(0, 3), None);
        assert_eq!(buf.find(b'z', 10), None);
    }

    #[test]
    fn test_clear_keeps_blocks() {
        let mut buf = WireBuffer::with_block_size(2);
        buf.write(b"abcdef");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.block_count(), 0);
        assert_eq!(buf.free_blocks(), 3);
    }

    #[test]
    fn test_from_slice_uses_one_block() {
        let data = vec![7u8; 10_000];
        let buf = WireBuffer::from_slice(&data);
        assert_eq!(buf.block_count(), 1);
        assert_eq!(buf.size(), data.len());
        assert_eq!(WireBuffer::from_slice(&[]).block_count(), 0);
    }

    #[test]
    fn test_into_bytes_full_and_partial_blocks() {
        let mut exact = WireBuffer::with_block_size(4);
        exact.write(b"abcd");
        assert_eq!(exact.into_bytes().as_ref(), b"abcd");

        let mut spread = WireBuffer::with_block_size(4);
        spread.write(b"abcdef");
        assert_eq!(spread.into_bytes().as_ref(), b"abcdef");

        let mut consumed = WireBuffer::with_block_size(4);
        consumed.write(b"abcd");
        consumed.skip(1).unwrap();
        assert_eq!(consumed.into_bytes().as_ref(), b"bcd");
    }
}
