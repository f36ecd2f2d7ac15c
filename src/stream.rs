// # Buffered Asynchronous Streams
//
// A byte-granular positioned cursor over a block device. Loaded blocks
// form a sparse, ordered cache keyed by media position; reads pull
// missing blocks through the device, writes dirty cached blocks and
// `flush` pushes them back out. On seekable media byte operations wait
// for their blocks; on network media they return what has arrived and
// the caller re-arms with `listen_for_more_bytes`.

use crate::chartype;
use crate::error::{IoError, Result};
use crate::ioblock::{
    AsyncBlockIo, BlockIoExt, BlockIoSink, BufferOp, IoBuffer, IoSystem, OpenOptions,
};
use crate::url::ParsedUrl;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How long a byte-level operation will wait for its block I/O.
const IO_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller-supplied event sink for a stream.
///
/// Events fire on job-queue worker threads, or inline from within a
/// stream call on synchronous devices.
pub trait StreamEvents: Send + Sync {
    /// More bytes are available (or the data ended: `Err(Eof)`).
    fn on_ready_to_read(&self, result: Result<()>, total_available: u64, stream: Arc<AsyncIoStream>);

    /// A `flush` finished.
    fn on_flush(&self, result: Result<()>, stream: Arc<AsyncIoStream>);

    /// The underlying device finished opening.
    fn on_open(&self, result: Result<()>, stream: Arc<AsyncIoStream>);

    /// The peer closed a connection we expected to stay up.
    fn on_stream_disconnect(&self, result: Result<()>, stream: Arc<AsyncIoStream>);
}

struct StreamState {
    device: Option<Arc<dyn AsyncBlockIo>>,
    position: u64,
    data_length: u64,
    /// Loaded blocks, disjoint, ordered by media position.
    cache: Vec<IoBuffer>,
    /// Block positions with a device read outstanding.
    pending_reads: Vec<u64>,
    writes_in_flight: usize,
    flush_pending: bool,
    last_error: Option<IoError>,
    /// Network media: the peer finished sending.
    eof_seen: bool,
    /// Surface EOF as a disconnect event (keep-alive connections).
    eof_is_disconnect: bool,
    /// One-shot arm for on_ready_to_read.
    listening: bool,
    /// Network media: where the next arriving block lands.
    append_pos: u64,
}

/// Deferred event calls, fired after the state lock is released.
enum Notice {
    ReadyToRead(Result<()>, u64),
    Flush(Result<()>),
    Disconnect(Result<()>),
}

/// A positioned byte stream over one block device.
pub struct AsyncIoStream {
    state: Mutex<StreamState>,
    changed: Condvar,
    events: Mutex<Option<Arc<dyn StreamEvents>>>,
    self_ref: Weak<AsyncIoStream>,
}

impl AsyncIoStream {
    /// Create a stream and open its device through `system`. The
    /// events sink's `on_open` fires when the device is ready —
    /// inline for memory and file media, from a worker thread for
    /// network media.
    pub fn open(
        system: &Arc<dyn IoSystem>,
        url: &ParsedUrl,
        options: OpenOptions,
        events: Arc<dyn StreamEvents>,
    ) -> Result<Arc<AsyncIoStream>> {
        let stream = Arc::new_cyclic(|weak| AsyncIoStream {
            state: Mutex::new(StreamState {
                device: None,
                position: 0,
                data_length: 0,
                cache: Vec::new(),
                pending_reads: Vec::new(),
                writes_in_flight: 0,
                flush_pending: false,
                last_error: None,
                eof_seen: false,
                eof_is_disconnect: false,
                listening: false,
                append_pos: 0,
            }),
            changed: Condvar::new(),
            events: Mutex::new(Some(events)),
            self_ref: weak.clone(),
        });

        let sink: Arc<dyn BlockIoSink> = stream.clone();
        system.open_block_io(url, options, sink)?;
        Ok(stream)
    }

    fn me(&self) -> Option<Arc<AsyncIoStream>> {
        self.self_ref.upgrade()
    }

    fn fire(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let events = self.events.lock().clone();
        let (Some(events), Some(me)) = (events, self.me()) else {
            return;
        };
        for notice in notices {
            match notice {
                Notice::ReadyToRead(result, total) => {
                    events.on_ready_to_read(result, total, me.clone())
                }
                Notice::Flush(result) => events.on_flush(result, me.clone()),
                Notice::Disconnect(result) => events.on_stream_disconnect(result, me.clone()),
            }
        }
    }

    /// Replace the event sink (connection reuse hands a stream to a
    /// new owner).
    pub fn change_events(&self, events: Arc<dyn StreamEvents>) {
        *self.events.lock() = Some(events);
    }

    /// The device under this stream, once open.
    pub fn device(&self) -> Option<Arc<dyn AsyncBlockIo>> {
        self.state.lock().device.clone()
    }

    pub fn get_position(&self) -> u64 {
        self.state.lock().position
    }

    /// Total bytes addressable right now (cached writes included).
    pub fn get_data_length(&self) -> u64 {
        self.state.lock().data_length
    }

    /// Move the cursor. Positions past the current data fail with Eof.
    pub fn set_position(&self, pos: u64) -> Result<()> {
        let mut st = self.state.lock();
        if pos > st.data_length {
            return Err(IoError::Eof);
        }
        st.position = pos;
        Ok(())
    }

    /// Treat peer EOF as a disconnect event instead of end-of-data.
    pub fn set_eof_is_disconnect(&self, value: bool) {
        self.state.lock().eof_is_disconnect = value;
    }

    /// Forget all cached data and reset the cursor. The caller is
    /// re-arming a connection for a fresh exchange; dirty blocks must
    /// already be flushed.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        if st.cache.iter().any(|b| b.is_dirty()) {
            warn!("stream reset discarding unflushed data");
        }
        st.cache.clear();
        st.position = 0;
        st.data_length = 0;
        st.append_pos = 0;
        st.eof_seen = false;
        st.last_error = None;
        st.listening = false;
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Copy up to `dst.len()` bytes from the cursor, pulling blocks
    /// from the device as needed. Seekable media waits for its blocks;
    /// network media returns what has arrived. Err(Eof) when the
    /// cursor is at the end and nothing was copied.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let mut copied = 0usize;

        loop {
            let mut st = self.state.lock();
            if let Some(err) = st.last_error.take() {
                return Err(err);
            }

            copied += Self::copy_from_cache(&mut st, &mut dst[copied..]);
            if copied == dst.len() {
                return Ok(copied);
            }

            let device = st.device.clone().ok_or(IoError::Fail)?;
            let seekable = device.core().is_seekable();

            if st.position >= st.data_length {
                if copied > 0 {
                    return Ok(copied);
                }
                return Err(IoError::Eof);
            }

            if !seekable {
                // Bytes between position and data_length are always
                // cached on network media; missing data means it has
                // not arrived yet.
                return Ok(copied);
            }

            let pos = st.position;
            self.load_block_at(&mut st, &device, pos)?;
            // Loop re-checks the cache; the block may have landed
            // inline (synchronous device) or will arrive from a
            // worker.
            self.wait_for_block(&mut st, pos)?;
        }
    }

    /// Read exactly `dst.len()` bytes or fail.
    pub fn read_exact(&self, dst: &mut [u8]) -> Result<()> {
        let n = self.read(dst)?;
        if n != dst.len() {
            return Err(IoError::Eof);
        }
        Ok(())
    }

    pub fn get_byte(&self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    pub fn peek_byte(&self) -> Result<u8> {
        let byte = self.get_byte()?;
        self.unget_byte()?;
        Ok(byte)
    }

    /// Step the cursor back one byte.
    pub fn unget_byte(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.position == 0 {
            return Err(IoError::InvalidArg("unget at stream start".to_string()));
        }
        st.position -= 1;
        Ok(())
    }

    /// Advance the cursor while bytes match `mask`. Returns the number
    /// of bytes skipped.
    pub fn skip_while_char_type(&self, mask: u16) -> Result<u64> {
        self.skip_span(mask, true)
    }

    /// Advance the cursor up to the first byte matching `mask`.
    pub fn skip_until_char_type(&self, mask: u16) -> Result<u64> {
        self.skip_span(mask, false)
    }

    fn skip_span(&self, mask: u16, while_matching: bool) -> Result<u64> {
        let mut skipped = 0u64;
        loop {
            let mut st = self.state.lock();
            let pos = st.position;
            if pos >= st.data_length {
                return Ok(skipped);
            }
            let Some(idx) = Self::find_block(&st, pos) else {
                // Not cached; seekable media loads it through read().
                drop(st);
                let mut probe = [0u8; 1];
                let n = self.read(&mut probe)?;
                if n == 0 {
                    return Ok(skipped);
                }
                let matched = chartype::is_byte(probe[0], mask);
                if matched != while_matching {
                    self.unget_byte()?;
                    return Ok(skipped);
                }
                skipped += 1;
                continue;
            };

            let block = &st.cache[idx];
            let offset = (pos - block.media_pos) as usize;
            let bytes = &block.data()[offset..];
            let run_len = bytes.len();
            let span = if while_matching {
                chartype::span_while(bytes, mask)
            } else {
                chartype::span_until(bytes, mask)
            };
            st.position += span as u64;
            skipped += span as u64;
            if span < run_len {
                return Ok(skipped);
            }
        }
    }

    /// Copy cached bytes at `pos` without moving the cursor. Only
    /// cached data is consulted; the copy may be short.
    pub fn read_at(&self, pos: u64, dst: &mut [u8]) -> Result<usize> {
        let st = self.state.lock();
        let mut copied = 0usize;
        let mut cursor = pos;
        while copied < dst.len() {
            let Some(idx) = Self::find_block(&st, cursor) else {
                break;
            };
            let block = &st.cache[idx];
            let offset = (cursor - block.media_pos) as usize;
            let n = (block.valid_bytes() - offset).min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&block.data()[offset..offset + n]);
            copied += n;
            cursor += n as u64;
        }
        if copied == 0 && !dst.is_empty() {
            return Err(IoError::Eof);
        }
        Ok(copied)
    }

    /// Run `f` over the longest contiguous cached run starting at
    /// `pos`, at most `len` bytes, without copying. The closure runs
    /// under the stream lock and must not call back into the stream.
    pub fn with_slice<R>(&self, pos: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let st = self.state.lock();
        let idx = Self::find_block(&st, pos).ok_or(IoError::Eof)?;
        let block = &st.cache[idx];
        let offset = (pos - block.media_pos) as usize;
        let available = (block.valid_bytes() - offset).min(len);
        Ok(f(&block.data()[offset..offset + available]))
    }

    /// Splice `count` bytes out of the stream at `pos`. Later data
    /// shifts down; the cursor follows the same mapping.
    pub fn remove_n_bytes(&self, pos: u64, count: u64) -> Result<()> {
        let mut st = self.state.lock();
        if pos + count > st.data_length {
            return Err(IoError::InvalidArg("splice past end of data".to_string()));
        }

        let cut_end = pos + count;
        let mut retained = Vec::with_capacity(st.cache.len());
        for mut block in std::mem::take(&mut st.cache) {
            let start = block.media_pos;
            let end = block.end_pos();
            if end <= pos {
                retained.push(block);
                continue;
            }
            if start >= cut_end {
                block.media_pos = start - count;
                retained.push(block);
                continue;
            }

            let cut_from = start.max(pos);
            let cut_to = end.min(cut_end);
            block.remove_range((cut_from - start) as usize, (cut_to - cut_from) as usize)?;
            if block.valid_bytes() == 0 {
                continue;
            }
            if start > pos {
                // Only a suffix survived; it now sits right at the cut.
                block.media_pos = pos;
            }
            retained.push(block);
        }
        st.cache = retained;
        st.data_length -= count;
        if st.append_pos >= cut_end {
            st.append_pos -= count;
        } else if st.append_pos > pos {
            st.append_pos = pos;
        }
        if st.position >= cut_end {
            st.position -= count;
        } else if st.position > pos {
            st.position = pos;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Copy `src` into the stream at the cursor, dirtying cache blocks.
    /// Data reaches the device on `flush`.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        let mut written = 0usize;

        while written < src.len() {
            let mut st = self.state.lock();
            if let Some(err) = st.last_error.take() {
                return Err(err);
            }
            let device = st.device.clone().ok_or(IoError::Fail)?;
            let pos = st.position;

            // The rightmost block whose capacity range covers the
            // cursor absorbs the write.
            let target = st
                .cache
                .iter()
                .rposition(|b| b.media_pos <= pos && ((pos - b.media_pos) as usize) < b.window_capacity());

            if let Some(idx) = target {
                // Never grow a block into its successor's range.
                let next_start = st.cache.get(idx + 1).map(|b| b.media_pos);
                let block = &mut st.cache[idx];
                let offset = (pos - block.media_pos) as usize;

                if offset > block.valid_bytes() {
                    // The cursor was moved past the valid data; the
                    // skipped bytes read back as zeros.
                    let valid = block.valid_bytes();
                    block.window_mut()[valid..offset].fill(0);
                }

                let mut room = block.window_capacity() - offset;
                if let Some(next_start) = next_start {
                    room = room.min((next_start - pos) as usize);
                }
                let n = room.min(src.len() - written);
                let new_valid = block.valid_bytes().max(offset + n);
                block.window_mut()[offset..offset + n]
                    .copy_from_slice(&src[written..written + n]);
                block.set_valid_bytes(new_valid);
                block.set_dirty(true);
                st.position += n as u64;
                if st.position > st.data_length {
                    st.data_length = st.position;
                }
                written += n;
                continue;
            }

            let seekable = device.core().is_seekable();
            let block_start = device.core().system().io_start_position(pos);

            if seekable
                && pos < device.core().media_size()
                && Self::find_block(&st, block_start).is_none()
            {
                // Overwriting persisted data mid-block: pull the block
                // in first.
                self.load_block_at(&mut st, &device, block_start)?;
                self.wait_for_block(&mut st, block_start)?;
                continue;
            }

            // Fresh block; a write landing past the block start leaves
            // a zeroed gap.
            let mut block = device.core().system().alloc_io_buffer(0)?;
            block.media_pos = block_start;
            block.set_valid_bytes((pos - block_start) as usize);
            Self::insert_block(&mut st, block);
        }

        Ok(written)
    }

    pub fn put_byte(&self, byte: u8) -> Result<()> {
        self.write(&[byte]).map(|_| ())
    }

    /// Formatted write at the cursor.
    pub fn printf(&self, args: std::fmt::Arguments<'_>) -> Result<()> {
        let text = args.to_string();
        self.write(text.as_bytes()).map(|_| ())
    }

    /// Push dirty blocks to the device. Completion is reported through
    /// `on_flush`: inline before this returns for synchronous devices,
    /// from a worker thread otherwise.
    pub fn flush(&self) -> Result<()> {
        let (device, buffers) = {
            let mut st = self.state.lock();
            let device = st.device.clone().ok_or(IoError::Fail)?;
            let buffers = self.take_dirty_copies(&mut st, &device)?;
            if buffers.is_empty() {
                drop(st);
                self.fire(vec![Notice::Flush(Ok(()))]);
                return Ok(());
            }
            st.writes_in_flight += buffers.len();
            st.flush_pending = true;
            (device, buffers)
        };

        trace!(blocks = buffers.len(), "flushing stream");
        for buffer in buffers {
            device.write_block(buffer, 0);
        }
        Ok(())
    }

    /// Flush and wait for the writes to land on the medium.
    pub fn flush_blocking(&self) -> Result<()> {
        self.flush()?;
        let device = {
            let mut st = self.state.lock();
            while st.writes_in_flight > 0 {
                if self
                    .changed
                    .wait_for(&mut st, IO_WAIT_TIMEOUT)
                    .timed_out()
                {
                    return Err(IoError::Timeout);
                }
            }
            if let Some(err) = st.last_error.take() {
                return Err(err);
            }
            st.device.clone()
        };
        match device {
            Some(device) => device.flush_native(),
            None => Ok(()),
        }
    }

    /// Clone the dirty blocks into write buffers and mark them clean.
    fn take_dirty_copies(
        &self,
        st: &mut StreamState,
        device: &Arc<dyn AsyncBlockIo>,
    ) -> Result<Vec<IoBuffer>> {
        let mut buffers = Vec::new();
        for block in st.cache.iter_mut().filter(|b| b.is_dirty()) {
            let mut copy = device
                .core()
                .system()
                .alloc_io_buffer(block.valid_bytes().max(1))?;
            copy.fill_from(block.data())?;
            copy.media_pos = block.media_pos;
            block.set_dirty(false);
            buffers.push(copy);
        }
        Ok(buffers)
    }

    /// Copy bytes from this stream's cursor into `dst`'s cursor.
    /// With `no_copy`, whole cached blocks are moved across instead of
    /// copied when the geometry lines up.
    pub fn copy_stream(&self, dst: &Arc<AsyncIoStream>, count: u64, no_copy: bool) -> Result<u64> {
        let mut moved = 0u64;

        if no_copy {
            moved += self.move_whole_blocks(dst, count)?;
        }

        let mut scratch = [0u8; 4096];
        while moved < count {
            let want = scratch.len().min((count - moved) as usize);
            let n = match self.read(&mut scratch[..want]) {
                Ok(0) | Err(IoError::Eof) => break,
                Ok(n) => n,
                Err(err) => return Err(err),
            };
            dst.write(&scratch[..n])?;
            moved += n as u64;
        }
        Ok(moved)
    }

    /// Hand fully-covered cached blocks to `dst` without copying.
    fn move_whole_blocks(&self, dst: &Arc<AsyncIoStream>, count: u64) -> Result<u64> {
        let mut moved = 0u64;
        loop {
            let mut st = self.state.lock();
            let pos = st.position;
            let Some(idx) = Self::find_block(&st, pos) else {
                return Ok(moved);
            };
            let block = &st.cache[idx];
            // Only whole blocks from their first byte qualify.
            if block.media_pos != pos || block.valid_bytes() as u64 > count - moved {
                return Ok(moved);
            }
            let mut block = st.cache.remove(idx);
            let len = block.valid_bytes() as u64;
            st.position += len;
            drop(st);

            let mut dst_state = dst.state.lock();
            block.media_pos = dst_state.position;
            block.set_dirty(true);
            dst_state.position += len;
            if dst_state.position > dst_state.data_length {
                dst_state.data_length = dst_state.position;
            }
            Self::insert_block(&mut dst_state, block);
            moved += len;
            if moved == count {
                return Ok(moved);
            }
        }
    }

    /// Arm a one-shot notification for the next data arrival. On
    /// network media this keeps a device read posted; on seekable
    /// media already-available data notifies immediately.
    pub fn listen_for_more_bytes(&self) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut st = self.state.lock();
            let device = st.device.clone().ok_or(IoError::Fail)?;
            st.listening = true;

            if device.core().is_seekable() {
                if st.data_length > st.position {
                    st.listening = false;
                    notices.push(Notice::ReadyToRead(Ok(()), st.data_length));
                }
            } else if st.eof_seen {
                st.listening = false;
                notices.push(Notice::ReadyToRead(Err(IoError::Eof), st.data_length));
            } else {
                self.post_network_read(&mut st, &device)?;
            }
        }
        self.fire(notices);
        Ok(())
    }

    /// Close the underlying device but keep the cached data readable.
    /// Used when a connection is done but its document is still being
    /// consumed.
    pub fn close_device(&self) {
        let device = self.state.lock().device.clone();
        if let Some(device) = device {
            device.close();
        }
        self.changed.notify_all();
    }

    /// Close the stream and its device.
    pub fn close(&self) {
        let device = {
            let mut st = self.state.lock();
            st.cache.clear();
            st.device.take()
        };
        self.events.lock().take();
        if let Some(device) = device {
            device.close();
        }
        self.changed.notify_all();
    }

    // ------------------------------------------------------------------
    // Cache plumbing (all under the state lock)
    // ------------------------------------------------------------------

    fn find_block(st: &StreamState, pos: u64) -> Option<usize> {
        st.cache
            .iter()
            .position(|b| b.media_pos <= pos && pos < b.end_pos())
    }

    fn insert_block(st: &mut StreamState, block: IoBuffer) {
        let at = st
            .cache
            .iter()
            .position(|b| b.media_pos > block.media_pos)
            .unwrap_or(st.cache.len());
        debug_assert!(
            at == 0 || st.cache[at - 1].end_pos() <= block.media_pos,
            "cache blocks must stay disjoint"
        );
        st.cache.insert(at, block);
    }

    fn copy_from_cache(st: &mut StreamState, dst: &mut [u8]) -> usize {
        let mut copied = 0usize;
        while copied < dst.len() {
            let pos = st.position;
            let Some(idx) = Self::find_block(st, pos) else {
                break;
            };
            let block = &st.cache[idx];
            let offset = (pos - block.media_pos) as usize;
            let n = (block.valid_bytes() - offset).min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&block.data()[offset..offset + n]);
            copied += n;
            st.position += n as u64;
        }
        copied
    }

    /// Issue a device read for the block containing `pos` unless one
    /// is cached or already in flight. Drops and retakes the lock
    /// around the device call.
    fn load_block_at(
        &self,
        st: &mut parking_lot::MutexGuard<'_, StreamState>,
        device: &Arc<dyn AsyncBlockIo>,
        pos: u64,
    ) -> Result<()> {
        let block_start = device.core().system().io_start_position(pos);
        if Self::find_block(st, block_start).is_some()
            || st.pending_reads.contains(&block_start)
        {
            return Ok(());
        }

        let mut buffer = device.core().system().alloc_io_buffer(0)?;
        buffer.media_pos = block_start;
        st.pending_reads.push(block_start);

        // The device may complete inline (synchronous media), which
        // re-enters on_io_event and takes this lock.
        parking_lot::MutexGuard::unlocked(st, || {
            device.read_block(buffer);
        });
        Ok(())
    }

    /// Wait until the block containing `pos` is cached, its read
    /// failed, or nothing remains in flight.
    fn wait_for_block(
        &self,
        st: &mut parking_lot::MutexGuard<'_, StreamState>,
        pos: u64,
    ) -> Result<()> {
        loop {
            if st.last_error.is_some() || Self::find_block(st, pos).is_some() {
                return Ok(());
            }
            let block_start = st
                .device
                .as_ref()
                .map(|d| d.core().system().io_start_position(pos))
                .unwrap_or(pos);
            if !st.pending_reads.contains(&block_start) {
                return Ok(());
            }
            if self.changed.wait_for(st, IO_WAIT_TIMEOUT).timed_out() {
                return Err(IoError::Timeout);
            }
        }
    }

    /// Keep one read posted on a network device.
    fn post_network_read(
        &self,
        st: &mut parking_lot::MutexGuard<'_, StreamState>,
        device: &Arc<dyn AsyncBlockIo>,
    ) -> Result<()> {
        if !st.pending_reads.is_empty() || st.eof_seen {
            return Ok(());
        }
        let buffer = device.core().system().alloc_io_buffer(0)?;
        st.pending_reads.push(u64::MAX);
        parking_lot::MutexGuard::unlocked(st, || {
            device.read_block(buffer);
        });
        Ok(())
    }

    fn integrate_read(&self, mut buffer: IoBuffer) -> Vec<Notice> {
        let mut notices = Vec::new();
        let mut st = self.state.lock();

        let seekable = st
            .device
            .as_ref()
            .map(|d| d.core().is_seekable())
            .unwrap_or(true);

        if seekable {
            st.pending_reads.retain(|&p| p != buffer.media_pos);
        } else {
            st.pending_reads.clear();
        }

        match &buffer.err {
            Ok(()) => {
                buffer.set_op(BufferOp::None);
                if !seekable {
                    buffer.media_pos = st.append_pos;
                    st.append_pos += buffer.valid_bytes() as u64;
                    st.data_length = st.append_pos;
                }
                trace!(
                    pos = buffer.media_pos,
                    len = buffer.valid_bytes(),
                    "block arrived"
                );
                if buffer.valid_bytes() > 0 {
                    Self::insert_block(&mut st, buffer);
                }
                if st.listening {
                    st.listening = false;
                    notices.push(Notice::ReadyToRead(Ok(()), st.data_length));
                }
            }
            Err(IoError::Eof) if !seekable => {
                // Peer finished sending.
                st.eof_seen = true;
                if st.device.as_ref().map(|d| !d.core().is_open()).unwrap_or(true) {
                    // Lost the race with a local close; stay quiet.
                } else if st.eof_is_disconnect {
                    notices.push(Notice::Disconnect(Err(IoError::PeerDisconnected)));
                } else if st.listening {
                    st.listening = false;
                    notices.push(Notice::ReadyToRead(Err(IoError::Eof), st.data_length));
                }
            }
            Err(err) => {
                debug!(%err, "stream read failed");
                st.last_error = Some(err.clone());
                if st.listening {
                    st.listening = false;
                    notices.push(Notice::ReadyToRead(Err(err.clone()), st.data_length));
                }
            }
        }

        self.changed.notify_all();
        notices
    }

    fn integrate_write(&self, buffer: IoBuffer) -> Vec<Notice> {
        let mut notices = Vec::new();
        let mut st = self.state.lock();

        if let Err(err) = &buffer.err {
            debug!(%err, "stream write failed");
            st.last_error = Some(err.clone());
        }
        st.writes_in_flight = st.writes_in_flight.saturating_sub(1);
        if st.writes_in_flight == 0 && st.flush_pending {
            st.flush_pending = false;
            let result = match &st.last_error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
            notices.push(Notice::Flush(result));
        }
        self.changed.notify_all();
        notices
    }
}

impl BlockIoSink for AsyncIoStream {
    fn on_io_event(&self, buffer: IoBuffer) {
        let notices = match buffer.op() {
            BufferOp::Read => self.integrate_read(buffer),
            BufferOp::Write => self.integrate_write(buffer),
            _ => Vec::new(),
        };
        self.fire(notices);
    }

    fn on_open(&self, result: Result<()>, device: Arc<dyn AsyncBlockIo>) {
        {
            let mut st = self.state.lock();
            st.data_length = device.core().media_size();
            st.device = Some(device);
        }
        let events = self.events.lock().clone();
        if let (Some(events), Some(me)) = (events, self.me()) {
            events.on_open(result, me);
        }
        self.changed.notify_all();
    }

    fn on_accept(&self, _result: Result<()>, device: Arc<dyn AsyncBlockIo>) {
        // Streams are point-to-point; inbound connections belong to a
        // server loop, not here.
        debug!(url = %device.core().url(), "stream ignoring accepted connection");
    }
}

impl Drop for AsyncIoStream {
    fn drop(&mut self) {
        let device = self.state.lock().device.take();
        if let Some(device) = device {
            if device.core().is_open() {
                device.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioblock::{IoSystem, MemoryIoSystem};
    use crate::jobs::JobQueue;

    struct QuietEvents;

    impl StreamEvents for QuietEvents {
        fn on_ready_to_read(&self, _r: Result<()>, _t: u64, _s: Arc<AsyncIoStream>) {}
        fn on_flush(&self, _r: Result<()>, _s: Arc<AsyncIoStream>) {}
        fn on_open(&self, _r: Result<()>, _s: Arc<AsyncIoStream>) {}
        fn on_stream_disconnect(&self, _r: Result<()>, _s: Arc<AsyncIoStream>) {}
    }

    fn memory_stream(len: usize) -> Arc<AsyncIoStream> {
        let queue = JobQueue::with_threads(1).unwrap();
        let system: Arc<dyn IoSystem> = MemoryIoSystem::new(queue);
        let url = ParsedUrl::for_new_memory_store(len);
        AsyncIoStream::open(&system, &url, OpenOptions::create(), Arc::new(QuietEvents)).unwrap()
    }

    #[test]
    fn test_write_read_round_trip() {
        let stream = memory_stream(8192);
        stream.write(b"the quick brown fox").unwrap();
        assert_eq!(stream.get_data_length(), 19);

        stream.set_position(0).unwrap();
        let mut buf = [0u8; 19];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"the quick brown fox");
    }

    #[test]
    fn test_byte_primitives() {
        let stream = memory_stream(64);
        stream.write(b"ab").unwrap();
        stream.set_position(0).unwrap();

        assert_eq!(stream.peek_byte().unwrap(), b'a');
        assert_eq!(stream.get_byte().unwrap(), b'a');
        assert_eq!(stream.get_byte().unwrap(), b'b');
        assert_eq!(stream.get_byte(), Err(IoError::Eof));

        stream.unget_byte().unwrap();
        assert_eq!(stream.get_byte().unwrap(), b'b');
    }

    #[test]
    fn test_skip_char_classes() {
        let stream = memory_stream(128);
        stream.write(b"   123abc\r\nrest").unwrap();
        stream.set_position(0).unwrap();

        assert_eq!(
            stream.skip_while_char_type(chartype::WHITESPACE_CHAR).unwrap(),
            3
        );
        assert_eq!(stream.skip_while_char_type(chartype::DIGIT_CHAR).unwrap(), 3);
        assert_eq!(stream.skip_until_char_type(chartype::NEWLINE_CHAR).unwrap(), 3);
        assert_eq!(stream.get_position(), 9);
    }

    #[test]
    fn test_remove_n_bytes_splices() {
        let stream = memory_stream(256);
        stream.write(b"7\r\nchunk-a7\r\nchunk-b").unwrap();
        // Erase both framing headers, back to front.
        stream.remove_n_bytes(10, 3).unwrap();
        stream.remove_n_bytes(0, 3).unwrap();

        stream.set_position(0).unwrap();
        let mut buf = [0u8; 14];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"chunk-achunk-b");
        assert_eq!(stream.get_data_length(), 14);
    }

    #[test]
    fn test_positions_follow_splice() {
        let stream = memory_stream(256);
        stream.write(b"abcdefghij").unwrap();
        stream.set_position(8).unwrap();
        stream.remove_n_bytes(2, 4).unwrap();
        // Cursor was past the cut, shifts down with the data.
        assert_eq!(stream.get_position(), 4);
        assert_eq!(stream.get_data_length(), 6);

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ij");
    }

    #[test]
    fn test_printf_formats_into_stream() {
        let stream = memory_stream(256);
        stream
            .printf(format_args!("GET {} HTTP/{}.{}\r\n", "/index.html", 1, 1))
            .unwrap();
        stream.set_position(0).unwrap();
        let mut buf = [0u8; 26];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], b"GET /index.html HTTP/1.1\r\n");
    }

    #[test]
    fn test_flush_persists_to_device() {
        let stream = memory_stream(4096);
        stream.write(b"persist me").unwrap();
        stream.flush_blocking().unwrap();

        let device = stream.device().unwrap();
        assert_eq!(device.core().media_size(), 10);
    }

    #[test]
    fn test_copy_stream() {
        let src = memory_stream(4096);
        let dst = memory_stream(4096);
        src.write(b"copied payload bytes").unwrap();
        src.set_position(0).unwrap();

        let moved = src.copy_stream(&dst, 20, false).unwrap();
        assert_eq!(moved, 20);

        dst.set_position(0).unwrap();
        let mut buf = [0u8; 20];
        dst.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"copied payload bytes");
    }

    #[test]
    fn test_cache_blocks_stay_ordered_and_disjoint() {
        let stream = memory_stream(8192);
        // Touch several non-adjacent block-sized regions.
        for start in [4096u64, 0, 2048] {
            stream.set_position(0).unwrap();
            stream
                .write(&vec![0xAB; (start + 16) as usize])
                .unwrap();
        }
        let st = stream.state.lock();
        for pair in st.cache.windows(2) {
            assert!(pair[0].media_pos < pair[1].media_pos);
            assert!(pair[0].end_pos() <= pair[1].media_pos);
        }
    }

    #[test]
    fn test_read_past_end_is_eof() {
        let stream = memory_stream(64);
        stream.write(b"tiny").unwrap();
        stream.set_position(4).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf), Err(IoError::Eof));
        assert!(stream.set_position(400).is_err());
    }
}
