// # I/O Buffers
//
// One `IoBuffer` describes one block transfer. It owns its backing
// memory and moves by value along the I/O path: caller → device →
// completion queue → sink → (for reads) a stream's block cache. Being
// on one queue at a time is therefore guaranteed by ownership.

use crate::error::{IoError, Result};
use bytes::BytesMut;
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// The operation a buffer is carrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOp {
    None,
    Read,
    Write,
    Connect,
    Accept,
}

/// Backing storage with an explicit alignment guarantee.
///
/// File media requires page-aligned transfers, which the general heap
/// does not promise; this allocates through `std::alloc` with an
/// explicit layout.
pub struct AlignedBuf {
    ptr: *mut u8,
    size: usize,
    layout: Layout,
}

impl AlignedBuf {
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), alignment.max(1))
            .map_err(|_| IoError::InvalidArg("bad buffer layout".to_string()))?;

        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(IoError::OutOfMemory);
        }

        Ok(Self { ptr, size, layout })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }
}

// Safety: AlignedBuf uniquely owns its allocation.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

enum Backing {
    Heap(BytesMut),
    Aligned(AlignedBuf),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Heap(b) => b.as_ref(),
            Backing::Aligned(b) => b.as_slice(),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Backing::Heap(b) => b.as_mut(),
            Backing::Aligned(b) => b.as_mut_slice(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::Heap(b) => b.len(),
            Backing::Aligned(b) => b.len(),
        }
    }
}

/// One unit of block I/O.
///
/// The physical region is `capacity()` bytes; the logical window
/// (`window_start .. window_start + valid_bytes`) is the live data.
/// Protocol code narrows the window to hide framing prefixes without
/// copying.
pub struct IoBuffer {
    op: BufferOp,

    /// Completion status, recorded by `finish_io`.
    pub err: Result<()>,

    backing: Backing,
    window_start: usize,
    valid_bytes: usize,

    /// Position in the medium, for seekable devices.
    pub media_pos: u64,

    /// First byte of the window already written out; lets one buffer be
    /// flushed across several partial writes.
    pub start_write_offset: usize,

    has_valid_data: bool,
    dirty: bool,
}

impl IoBuffer {
    /// Allocate a buffer backed by the general heap.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut storage = BytesMut::with_capacity(capacity);
        storage.resize(capacity, 0);
        Self::from_backing(Backing::Heap(storage))
    }

    /// Allocate a buffer with an explicit alignment (file media).
    pub fn with_alignment(capacity: usize, alignment: usize) -> Result<Self> {
        Ok(Self::from_backing(Backing::Aligned(AlignedBuf::new(
            capacity, alignment,
        )?)))
    }

    fn from_backing(backing: Backing) -> Self {
        Self {
            op: BufferOp::None,
            err: Ok(()),
            backing,
            window_start: 0,
            valid_bytes: 0,
            media_pos: 0,
            start_write_offset: 0,
            has_valid_data: false,
            dirty: false,
        }
    }

    #[inline]
    pub fn op(&self) -> BufferOp {
        self.op
    }

    pub(crate) fn set_op(&mut self, op: BufferOp) {
        self.op = op;
    }

    /// Size of the physical region.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.backing.len()
    }

    /// Bytes of valid data in the logical window.
    #[inline]
    pub fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    /// Capacity left in the window past the valid data.
    #[inline]
    pub fn window_capacity(&self) -> usize {
        self.capacity() - self.window_start
    }

    #[inline]
    pub fn window_start(&self) -> usize {
        self.window_start
    }

    /// The valid data in the window.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.backing.as_slice()[self.window_start..self.window_start + self.valid_bytes]
    }

    /// The whole window, valid or not.
    #[inline]
    pub fn window_mut(&mut self) -> &mut [u8] {
        let start = self.window_start;
        &mut self.backing.as_mut_slice()[start..]
    }

    /// Mutable view of the valid data.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let (start, valid) = (self.window_start, self.valid_bytes);
        &mut self.backing.as_mut_slice()[start..start + valid]
    }

    /// Narrow the logical window. `start + len` must fit the region.
    pub fn set_window(&mut self, start: usize, len: usize) -> Result<()> {
        if start + len > self.capacity() {
            return Err(IoError::InvalidArg(format!(
                "window {}+{} exceeds capacity {}",
                start,
                len,
                self.capacity()
            )));
        }
        self.window_start = start;
        self.valid_bytes = len;
        self.has_valid_data = len > 0;
        Ok(())
    }

    /// Mark `len` bytes of the window valid (e.g. after a read).
    pub fn set_valid_bytes(&mut self, len: usize) {
        debug_assert!(self.window_start + len <= self.capacity());
        self.valid_bytes = len.min(self.window_capacity());
        self.has_valid_data = self.valid_bytes > 0;
    }

    /// Copy `src` into the window and mark it valid.
    pub fn fill_from(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.window_capacity() {
            return Err(IoError::InvalidArg("data exceeds buffer window".to_string()));
        }
        let start = self.window_start;
        self.backing.as_mut_slice()[start..start + src.len()].copy_from_slice(src);
        self.valid_bytes = src.len();
        self.has_valid_data = true;
        Ok(())
    }

    #[inline]
    pub fn has_valid_data(&self) -> bool {
        self.has_valid_data
    }

    /// Unflushed local modifications.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// First media position past the valid data.
    #[inline]
    pub fn end_pos(&self) -> u64 {
        self.media_pos + self.valid_bytes as u64
    }

    /// Splice `len` bytes out of the valid data at `offset`, shifting
    /// the tail down. Used to erase framing (chunk headers) in place.
    pub fn remove_range(&mut self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.valid_bytes {
            return Err(IoError::InvalidArg("splice outside valid data".to_string()));
        }
        let valid = self.valid_bytes;
        self.data_mut().copy_within(offset + len..valid, offset);
        self.valid_bytes -= len;
        self.has_valid_data = self.valid_bytes > 0;
        Ok(())
    }

    /// Reset to an idle, empty state for reuse.
    pub fn recycle(&mut self) {
        self.op = BufferOp::None;
        self.err = Ok(());
        self.window_start = 0;
        self.valid_bytes = 0;
        self.media_pos = 0;
        self.start_write_offset = 0;
        self.has_valid_data = false;
        self.dirty = false;
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("op", &self.op)
            .field("err", &self.err)
            .field("capacity", &self.capacity())
            .field("window_start", &self.window_start)
            .field("valid_bytes", &self.valid_bytes)
            .field("media_pos", &self.media_pos)
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_allocation() {
        let buf = AlignedBuf::new(4096, 4096).unwrap();
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_slice().as_ptr() as usize % 4096, 0);
        // Zeroed on allocation.
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_window_bounds() {
        let mut buf = IoBuffer::with_capacity(128);
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.valid_bytes(), 0);

        buf.set_window(16, 32).unwrap();
        assert_eq!(buf.window_start(), 16);
        assert_eq!(buf.valid_bytes(), 32);
        assert_eq!(buf.data().len(), 32);

        assert!(buf.set_window(100, 100).is_err());
    }

    #[test]
    fn test_fill_and_recycle() {
        let mut buf = IoBuffer::with_capacity(8);
        buf.fill_from(b"hello").unwrap();
        assert!(buf.has_valid_data());
        assert_eq!(buf.data(), b"hello");
        assert!(buf.fill_from(b"far too long for this").is_err());

        buf.media_pos = 512;
        assert_eq!(buf.end_pos(), 517);

        buf.recycle();
        assert_eq!(buf.op(), BufferOp::None);
        assert_eq!(buf.valid_bytes(), 0);
        assert!(!buf.has_valid_data());
    }

    #[test]
    fn test_remove_range_splices_tail_down() {
        let mut buf = IoBuffer::with_capacity(32);
        buf.fill_from(b"5\r\nHello world").unwrap();
        buf.remove_range(0, 3).unwrap();
        assert_eq!(buf.data(), b"Hello world");

        buf.remove_range(5, 1).unwrap();
        assert_eq!(buf.data(), b"Helloworld");

        assert!(buf.remove_range(8, 10).is_err());
    }

    #[test]
    fn test_window_hides_prefix() {
        let mut buf = IoBuffer::with_capacity(16);
        buf.fill_from(b"HDRpayload").unwrap();
        // Narrow past a 3-byte framing prefix without copying.
        buf.set_window(3, 7).unwrap();
        assert_eq!(buf.data(), b"payload");
    }
}
