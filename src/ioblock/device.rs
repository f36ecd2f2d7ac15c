// # Block Device Core
//
// State and completion plumbing shared by every media backend. The
// ordering contract: completions for one device reach the sink in the
// order `finish_io` recorded them, delivered by exactly one worker
// thread at a time.

use super::buffer::{BufferOp, IoBuffer};
use super::system::IoSystem;
use super::{MediaKind, OpenOptions};
use crate::error::{IoError, Result};
use crate::jobs::{Job, JobQueue, JobState};
use crate::url::ParsedUrl;
use crossbeam::queue::SegQueue;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// The per-device callback sink.
///
/// One sink spans every operation on the device: solicited completions
/// (read, write), connection establishment, and unsolicited events such
/// as inbound connections. Synchronous devices invoke the sink inline
/// from within the caller's own read/write call; sinks must tolerate
/// that reentrancy.
pub trait BlockIoSink: Send + Sync {
    /// A read or write finished; the buffer carries data and status.
    fn on_io_event(&self, buffer: IoBuffer);

    /// The device finished opening (or connecting).
    fn on_open(&self, result: Result<()>, device: Arc<dyn AsyncBlockIo>);

    /// A listening device produced a new connected device.
    fn on_accept(&self, result: Result<()>, device: Arc<dyn AsyncBlockIo>);
}

/// An entry on a device's completed queue, awaiting sink delivery.
pub enum CompletionEvent {
    Io(IoBuffer),
    Open(Result<()>),
    Accept(Result<()>, Arc<dyn AsyncBlockIo>),
}

struct CoreState {
    open: bool,
    options: OpenOptions,
    media_size: u64,
    active_reads: u32,
    active_writes: u32,
    /// Exactly one dispatch job is pending on the job queue.
    sent_to_job_queue: bool,
    /// A worker thread is currently delivering this device's events.
    thread_processing_job: bool,
}

/// Shared state embedded in every media backend.
pub struct BlockIoCore {
    media: MediaKind,
    seekable: bool,
    synchronous: bool,
    url: ParsedUrl,
    system: Arc<dyn IoSystem>,
    queue: Arc<JobQueue>,
    state: Mutex<CoreState>,
    completions: SegQueue<CompletionEvent>,
    sink: Mutex<Option<Arc<dyn BlockIoSink>>>,
    job_state: JobState,
    self_ref: OnceCell<Weak<dyn AsyncBlockIo>>,
}

impl BlockIoCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        media: MediaKind,
        seekable: bool,
        synchronous: bool,
        url: ParsedUrl,
        system: Arc<dyn IoSystem>,
        queue: Arc<JobQueue>,
        options: OpenOptions,
        media_size: u64,
        sink: Arc<dyn BlockIoSink>,
    ) -> Self {
        Self {
            media,
            seekable,
            synchronous,
            url,
            system,
            queue,
            state: Mutex::new(CoreState {
                open: true,
                options,
                media_size,
                active_reads: 0,
                active_writes: 0,
                sent_to_job_queue: false,
                thread_processing_job: false,
            }),
            completions: SegQueue::new(),
            sink: Mutex::new(Some(sink)),
            job_state: JobState::new(),
            self_ref: OnceCell::new(),
        }
    }

    /// Install the device's own handle. Called once by the owning
    /// system right after construction.
    pub(crate) fn bind(&self, device: Weak<dyn AsyncBlockIo>) {
        let _ = self.self_ref.set(device);
    }

    /// Upgrade the self reference. None once the device is being torn
    /// down.
    pub fn device(&self) -> Option<Arc<dyn AsyncBlockIo>> {
        self.self_ref.get().and_then(|w| w.upgrade())
    }

    #[inline]
    pub fn media(&self) -> MediaKind {
        self.media
    }

    #[inline]
    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    /// Synchronous devices deliver completions inline instead of
    /// through the job queue.
    #[inline]
    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    #[inline]
    pub fn url(&self) -> &ParsedUrl {
        &self.url
    }

    #[inline]
    pub fn system(&self) -> &Arc<dyn IoSystem> {
        &self.system
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn options(&self) -> OpenOptions {
        self.state.lock().options
    }

    /// Logical length of the medium.
    pub fn media_size(&self) -> u64 {
        self.state.lock().media_size
    }

    pub(crate) fn set_media_size(&self, size: u64) {
        self.state.lock().media_size = size;
    }

    /// Extend the recorded media size after a write past the end.
    pub(crate) fn grow_media_size(&self, end: u64) {
        let mut st = self.state.lock();
        if end > st.media_size {
            st.media_size = end;
        }
    }

    /// (active reads, active writes) — for state checks and tests.
    pub fn active_io_counts(&self) -> (u32, u32) {
        let st = self.state.lock();
        (st.active_reads, st.active_writes)
    }

    /// Completions recorded but not yet delivered.
    pub fn pending_completions(&self) -> usize {
        self.completions.len()
    }

    pub(crate) fn job_state(&self) -> &JobState {
        &self.job_state
    }

    pub(crate) fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

/// A block device: one open resource accepting block-granular requests.
///
/// Media backends implement the `*_impl` operations; callers use the
/// validated wrappers from [`BlockIoExt`].
pub trait AsyncBlockIo: Send + Sync {
    fn core(&self) -> &BlockIoCore;

    /// Start the media-specific read. The buffer's op tag and counters
    /// are already set; the implementation must end with `finish_io`.
    fn read_block_impl(self: Arc<Self>, buffer: IoBuffer);

    /// Start the media-specific write. Same contract as reads.
    fn write_block_impl(self: Arc<Self>, buffer: IoBuffer);

    /// Truncate or extend the medium. Synchronous.
    fn resize(&self, new_len: u64) -> Result<()>;

    /// Release the native handle. Called once, from `close`.
    fn close_native(&self);

    /// Push buffered state to the medium (file sync etc.).
    fn flush_native(&self) -> Result<()> {
        Ok(())
    }

    /// Arm an operation timeout. Only meaningful for network media.
    fn start_timeout(&self, _op: BufferOp) {}

    /// Disarm an operation timeout. Only meaningful for network media.
    fn cancel_timeout(&self, _op: BufferOp) {}

    /// This device as a schedulable dispatch job.
    fn as_job(self: Arc<Self>) -> Arc<dyn Job>;
}

/// Validated request entry points and the completion machinery, shared
/// by every backend. Implemented for `Arc<ConcreteDevice>` and
/// `Arc<dyn AsyncBlockIo>` alike.
pub trait BlockIoExt {
    /// Read one block at `buffer.media_pos`. Completion arrives at the
    /// sink, inline for synchronous devices.
    fn read_block(&self, buffer: IoBuffer);

    /// Write the buffer's valid data at `buffer.media_pos`, starting
    /// `start_offset` bytes into the window.
    fn write_block(&self, buffer: IoBuffer, start_offset: usize);

    /// Record a completed transfer. Called by media backends.
    fn finish_io(&self, buffer: IoBuffer, result: Result<()>, bytes_done: usize);

    /// Record a completed open/connect.
    fn finish_open(&self, result: Result<()>);

    /// Record an accepted connection.
    fn finish_accept(&self, result: Result<()>, accepted: Arc<dyn AsyncBlockIo>);

    /// Deliver queued completions in order. Runs on a job-queue worker;
    /// extra workers finding delivery already in progress return at
    /// once.
    fn process_completions(&self);

    /// Replace the device's sink.
    fn change_sink(&self, sink: Arc<dyn BlockIoSink>);

    /// Current sink, if any.
    fn sink(&self) -> Option<Arc<dyn BlockIoSink>>;

    /// Close the device: drop the sink, detach from the owning system,
    /// release the native handle. Outstanding buffers still deliver
    /// terminal events.
    fn close(&self);
}

impl<T: AsyncBlockIo + ?Sized> BlockIoExt for Arc<T> {
    fn read_block(&self, mut buffer: IoBuffer) {
        let core = self.core();
        let fault = {
            let mut st = core.state.lock();
            let fault = validate_read(core, &st, &buffer);
            buffer.set_op(BufferOp::Read);
            buffer.set_valid_bytes(0);
            st.active_reads += 1;
            fault
        };

        if let Some(msg) = fault {
            warn!(url = %core.url, "rejected read: {}", msg);
            self.finish_io(buffer, Err(IoError::InvalidArg(msg.to_string())), 0);
            return;
        }

        trace!(url = %core.url, pos = buffer.media_pos, "start block read");
        Arc::clone(self).read_block_impl(buffer);
    }

    fn write_block(&self, mut buffer: IoBuffer, start_offset: usize) {
        let core = self.core();
        let fault = {
            let mut st = core.state.lock();
            let fault = validate_write(core, &st, &buffer, start_offset);
            buffer.set_op(BufferOp::Write);
            buffer.start_write_offset = start_offset;
            buffer.set_dirty(false);
            st.active_writes += 1;
            fault
        };

        if let Some(msg) = fault {
            warn!(url = %core.url, "rejected write: {}", msg);
            self.finish_io(buffer, Err(IoError::InvalidArg(msg.to_string())), 0);
            return;
        }

        trace!(
            url = %core.url,
            pos = buffer.media_pos,
            len = buffer.valid_bytes(),
            "start block write"
        );
        Arc::clone(self).write_block_impl(buffer);
    }

    fn finish_io(&self, mut buffer: IoBuffer, result: Result<()>, bytes_done: usize) {
        let core = self.core();
        if let Err(err) = &result {
            debug!(url = %core.url, %err, "io finished with error");
        }

        buffer.err = result;
        if buffer.op() == BufferOp::Read {
            buffer.set_valid_bytes(bytes_done);
        }

        let st = {
            let mut st = core.state.lock();
            match buffer.op() {
                BufferOp::Read => st.active_reads = st.active_reads.saturating_sub(1),
                BufferOp::Write => st.active_writes = st.active_writes.saturating_sub(1),
                _ => {}
            }
            st
        };

        if core.synchronous {
            // Inline delivery: the caller is still on its own thread,
            // outside any worker. Drop the device lock first so the
            // sink can issue follow-up I/O.
            drop(st);
            let sink = core.sink.lock().clone();
            if let Some(sink) = sink {
                match buffer.op() {
                    BufferOp::Read | BufferOp::Write => sink.on_io_event(buffer),
                    _ => warn!(url = %core.url, "unexpected op on synchronous completion"),
                }
            }
        } else {
            // Queue order is sink delivery order. Packet N+1 must not
            // pass packet N.
            core.completions.push(CompletionEvent::Io(buffer));
            submit_dispatch(self, st);
        }
    }

    fn finish_open(&self, result: Result<()>) {
        let core = self.core();
        if core.synchronous {
            let sink = core.sink.lock().clone();
            if let (Some(sink), Some(device)) = (sink, core.device()) {
                sink.on_open(result, device);
            }
        } else {
            let st = core.state.lock();
            core.completions.push(CompletionEvent::Open(result));
            submit_dispatch(self, st);
        }
    }

    fn finish_accept(&self, result: Result<()>, accepted: Arc<dyn AsyncBlockIo>) {
        let core = self.core();
        let st = core.state.lock();
        core.completions.push(CompletionEvent::Accept(result, accepted));
        submit_dispatch(self, st);
    }

    fn process_completions(&self) {
        let core = self.core();
        {
            let mut st = core.state.lock();
            // Another worker is already the dispatcher for this device;
            // it will drain the queue, including whatever submission
            // woke us.
            if st.thread_processing_job {
                return;
            }
            st.thread_processing_job = true;
        }

        loop {
            let event = {
                let mut st = core.state.lock();
                match core.completions.pop() {
                    Some(event) => Some(event),
                    None => {
                        st.sent_to_job_queue = false;
                        st.thread_processing_job = false;
                        None
                    }
                }
            };
            let Some(event) = event else { break };

            // Snapshot the sink per event; a delivered event may change
            // the sink.
            let sink = core.sink.lock().clone();
            match event {
                CompletionEvent::Io(buffer) => {
                    if let Some(sink) = sink {
                        sink.on_io_event(buffer);
                    }
                }
                CompletionEvent::Open(result) => {
                    if let (Some(sink), Some(device)) = (sink, core.device()) {
                        sink.on_open(result, device);
                    }
                }
                CompletionEvent::Accept(result, accepted) => {
                    if let Some(sink) = sink {
                        sink.on_accept(result, accepted);
                    }
                }
            }
        }
    }

    fn change_sink(&self, sink: Arc<dyn BlockIoSink>) {
        *self.core().sink.lock() = Some(sink);
    }

    fn sink(&self) -> Option<Arc<dyn BlockIoSink>> {
        self.core().sink.lock().clone()
    }

    fn close(&self) {
        let core = self.core();
        {
            let mut st = core.state.lock();
            if !st.open {
                return;
            }
            st.open = false;
        }
        debug!(url = %core.url, "closing block device");

        self.cancel_timeout(BufferOp::Read);
        self.cancel_timeout(BufferOp::Write);
        core.sink.lock().take();
        if let Some(device) = core.device() {
            core.system.registry().detach(&device);
        }
        self.close_native();
    }
}

fn validate_read(core: &BlockIoCore, st: &CoreState, buffer: &IoBuffer) -> Option<&'static str> {
    if !st.open {
        Some("device not open")
    } else if !st.options.read {
        Some("no read access")
    } else if buffer.op() != BufferOp::None {
        Some("buffer already in flight")
    } else if buffer.media_pos != core.system.io_start_position(buffer.media_pos) {
        Some("read position not block aligned")
    } else {
        None
    }
}

fn validate_write(
    core: &BlockIoCore,
    st: &CoreState,
    buffer: &IoBuffer,
    start_offset: usize,
) -> Option<&'static str> {
    if !st.open {
        Some("device not open")
    } else if !st.options.write {
        Some("no write access")
    } else if buffer.op() != BufferOp::None {
        Some("buffer already in flight")
    } else if !buffer.has_valid_data() || buffer.valid_bytes() > buffer.capacity() {
        Some("write buffer has no valid data")
    } else if start_offset > buffer.valid_bytes() {
        Some("write offset past valid data")
    } else if buffer.media_pos != core.system.io_start_position(buffer.media_pos) {
        Some("write position not block aligned")
    } else {
        None
    }
}

/// With a completion freshly queued: post the single dispatch job if
/// none is pending. The flag is set before `submit_job` because the
/// queue may run the job before `submit_job` returns.
fn submit_dispatch<T: AsyncBlockIo + ?Sized>(device: &Arc<T>, mut st: MutexGuard<'_, CoreState>) {
    let core = device.core();
    if st.sent_to_job_queue {
        return;
    }
    st.sent_to_job_queue = true;
    drop(st);

    let submitted = core
        .device()
        .map(|d| core.queue.submit_job(d.as_job()).is_ok())
        .unwrap_or(false);
    if !submitted {
        core.state.lock().sent_to_job_queue = false;
    }
}
