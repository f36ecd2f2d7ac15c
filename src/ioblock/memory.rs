// # Memory Media
//
// Block devices over in-process byte stores. Memory devices are
// synchronous: completions are delivered inline from within the
// caller's read/write call.

use super::buffer::IoBuffer;
use super::device::{AsyncBlockIo, BlockIoCore, BlockIoExt, BlockIoSink};
use super::system::{DeviceRegistry, IoSystem};
use super::{MediaKind, OpenOptions, MEMORY_BYTES_PER_BLOCK};
use crate::error::{IoError, Result};
use crate::jobs::{Job, JobQueue, JobState};
use crate::url::{ParsedUrl, UrlScheme};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Upper bound on a single memory store.
pub const MAX_SANE_MEMORY_STORE_SIZE: usize = 10_000_000;

enum MemoryStore {
    /// Store allocated and owned by the device.
    Owned(Vec<u8>),
    /// Caller-provided region named by a memory URL. The URL's author
    /// guarantees the region outlives the device and is not aliased
    /// while the device is open.
    Foreign { ptr: *mut u8, len: usize },
}

// Safety: Foreign regions are exclusively ours by the memory-URL
// contract above; Owned is a plain Vec.
unsafe impl Send for MemoryStore {}

impl MemoryStore {
    fn len(&self) -> usize {
        match self {
            MemoryStore::Owned(v) => v.len(),
            MemoryStore::Foreign { len, .. } => *len,
        }
    }

    fn slice(&self) -> &[u8] {
        match self {
            MemoryStore::Owned(v) => v.as_slice(),
            MemoryStore::Foreign { ptr, len } => unsafe {
                std::slice::from_raw_parts(*ptr, *len)
            },
        }
    }

    fn slice_mut(&mut self) -> &mut [u8] {
        match self {
            MemoryStore::Owned(v) => v.as_mut_slice(),
            MemoryStore::Foreign { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(*ptr, *len)
            },
        }
    }
}

/// A block device over one memory store.
pub struct MemoryBlockIo {
    core: BlockIoCore,
    store: Mutex<MemoryStore>,
}

impl MemoryBlockIo {
    fn read_store(&self, buffer: &mut IoBuffer) -> Result<usize> {
        let store = self.store.lock();
        let data = store.slice();
        let pos = buffer.media_pos as usize;
        if pos >= data.len() {
            return Err(IoError::Eof);
        }

        let n = buffer.window_capacity().min(data.len() - pos);
        buffer.window_mut()[..n].copy_from_slice(&data[pos..pos + n]);
        Ok(n)
    }

    fn write_store(&self, buffer: &IoBuffer) -> Result<usize> {
        let src = &buffer.data()[buffer.start_write_offset..];
        let pos = buffer.media_pos as usize + buffer.start_write_offset;
        let end = pos + src.len();

        let mut store = self.store.lock();
        if end > store.len() {
            match &mut *store {
                MemoryStore::Owned(v)
                    if self.core.options().resizable && end <= MAX_SANE_MEMORY_STORE_SIZE =>
                {
                    v.resize(end, 0);
                }
                _ => return Err(IoError::Fail),
            }
        }
        store.slice_mut()[pos..end].copy_from_slice(src);
        drop(store);

        self.core.grow_media_size(end as u64);
        Ok(src.len())
    }
}

impl AsyncBlockIo for MemoryBlockIo {
    fn core(&self) -> &BlockIoCore {
        &self.core
    }

    fn read_block_impl(self: Arc<Self>, mut buffer: IoBuffer) {
        match self.read_store(&mut buffer) {
            Ok(n) => self.finish_io(buffer, Ok(()), n),
            Err(err) => self.finish_io(buffer, Err(err), 0),
        }
    }

    fn write_block_impl(self: Arc<Self>, buffer: IoBuffer) {
        match self.write_store(&buffer) {
            Ok(n) => self.finish_io(buffer, Ok(()), n),
            Err(err) => self.finish_io(buffer, Err(err), 0),
        }
    }

    fn resize(&self, new_len: u64) -> Result<()> {
        if !self.core.is_open() {
            return Err(IoError::Fail);
        }
        if new_len as usize > MAX_SANE_MEMORY_STORE_SIZE {
            return Err(IoError::InvalidArg("memory store too large".to_string()));
        }

        let mut store = self.store.lock();
        match &mut *store {
            MemoryStore::Owned(v) if self.core.options().resizable => {
                v.resize(new_len as usize, 0);
            }
            _ => return Err(IoError::NotImpl),
        }
        drop(store);

        self.core.set_media_size(new_len);
        Ok(())
    }

    fn close_native(&self) {}

    fn as_job(self: Arc<Self>) -> Arc<dyn Job> {
        self
    }
}

impl Job for MemoryBlockIo {
    fn job_state(&self) -> &JobState {
        self.core.job_state()
    }

    fn process_job(&self) {
        if let Some(device) = self.core.device() {
            device.process_completions();
        }
    }
}

/// The memory-media system.
pub struct MemoryIoSystem {
    registry: DeviceRegistry,
    queue: Arc<JobQueue>,
    self_ref: Weak<MemoryIoSystem>,
}

impl MemoryIoSystem {
    pub fn new(queue: Arc<JobQueue>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry: DeviceRegistry::new(),
            queue,
            self_ref: weak.clone(),
        })
    }

    fn as_system(&self) -> Result<Arc<dyn IoSystem>> {
        self.self_ref
            .upgrade()
            .map(|s| s as Arc<dyn IoSystem>)
            .ok_or(IoError::Fail)
    }
}

impl IoSystem for MemoryIoSystem {
    fn media(&self) -> MediaKind {
        MediaKind::Memory
    }

    fn default_bytes_per_block(&self) -> usize {
        MEMORY_BYTES_PER_BLOCK
    }

    fn buffer_alignment(&self) -> usize {
        0
    }

    fn open_block_io(
        &self,
        url: &ParsedUrl,
        options: OpenOptions,
        sink: Arc<dyn BlockIoSink>,
    ) -> Result<Arc<dyn AsyncBlockIo>> {
        if url.scheme != UrlScheme::Memory {
            return Err(IoError::InvalidUrl(format!("not a memory url: {}", url)));
        }
        if url.mem_len > MAX_SANE_MEMORY_STORE_SIZE {
            return Err(IoError::InvalidArg("memory store too large".to_string()));
        }

        let (store, media_size) = if options.create_new_store || url.mem_base == 0 {
            (MemoryStore::Owned(Vec::with_capacity(url.mem_len)), 0)
        } else {
            (
                MemoryStore::Foreign {
                    ptr: url.mem_base as *mut u8,
                    len: url.mem_len,
                },
                url.mem_len as u64,
            )
        };

        let device = Arc::new(MemoryBlockIo {
            core: BlockIoCore::new(
                MediaKind::Memory,
                true,
                true,
                url.clone(),
                self.as_system()?,
                Arc::clone(&self.queue),
                options,
                media_size,
                sink,
            ),
            store: Mutex::new(store),
        });

        let dyn_device: Arc<dyn AsyncBlockIo> = device.clone();
        device.core.bind(Arc::downgrade(&dyn_device));
        self.registry.attach(dyn_device.clone());

        // Memory opens complete on the caller's thread.
        dyn_device.finish_open(Ok(()));
        Ok(dyn_device)
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioblock::BufferOp;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        events: Mutex<Vec<IoBuffer>>,
        opens: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                opens: AtomicUsize::new(0),
            })
        }
    }

    impl BlockIoSink for RecordingSink {
        fn on_io_event(&self, buffer: IoBuffer) {
            self.events.lock().push(buffer);
        }
        fn on_open(&self, result: Result<()>, _device: Arc<dyn AsyncBlockIo>) {
            assert!(result.is_ok());
            self.opens.fetch_add(1, Ordering::SeqCst);
        }
        fn on_accept(&self, _result: Result<()>, _device: Arc<dyn AsyncBlockIo>) {}
    }

    fn open_new_store(len: usize) -> (Arc<dyn AsyncBlockIo>, Arc<RecordingSink>) {
        let queue = JobQueue::with_threads(1).unwrap();
        let system = MemoryIoSystem::new(queue);
        let sink = RecordingSink::new();
        let url = ParsedUrl::for_new_memory_store(len);
        let device = system
            .open_block_io(&url, OpenOptions::create(), sink.clone())
            .unwrap();
        (device, sink)
    }

    #[test]
    fn test_open_fires_on_open_inline() {
        let (_device, sink) = open_new_store(4096);
        assert_eq!(sink.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (device, sink) = open_new_store(4096);

        let mut buffer = IoBuffer::with_capacity(1024);
        buffer.fill_from(b"forty-two bytes of distinctly testable text").unwrap();
        buffer.media_pos = 0;
        device.write_block(buffer, 0);

        let completed = sink.events.lock().pop().unwrap();
        assert_eq!(completed.op(), BufferOp::Write);
        assert!(completed.err.is_ok());
        assert_eq!(device.core().media_size(), 43);

        let mut read_buf = IoBuffer::with_capacity(1024);
        read_buf.media_pos = 0;
        device.read_block(read_buf);

        let completed = sink.events.lock().pop().unwrap();
        assert!(completed.err.is_ok());
        assert_eq!(
            completed.data(),
            b"forty-two bytes of distinctly testable text".as_slice()
        );
    }

    #[test]
    fn test_read_past_end_is_eof() {
        let (device, sink) = open_new_store(64);
        let mut buffer = IoBuffer::with_capacity(64);
        buffer.media_pos = 4096;
        device.read_block(buffer);

        let completed = sink.events.lock().pop().unwrap();
        assert_eq!(completed.err, Err(IoError::Eof));
        assert_eq!(completed.valid_bytes(), 0);
    }

    #[test]
    fn test_resize_preserves_prefix() {
        let (device, sink) = open_new_store(64);
        let mut buffer = IoBuffer::with_capacity(64);
        buffer.fill_from(b"prefix").unwrap();
        device.write_block(buffer, 0);
        sink.events.lock().clear();

        device.resize(32).unwrap();
        assert_eq!(device.core().media_size(), 32);

        let mut read_buf = IoBuffer::with_capacity(64);
        read_buf.media_pos = 0;
        device.read_block(read_buf);
        let completed = sink.events.lock().pop().unwrap();
        assert_eq!(&completed.data()[..6], b"prefix");
        assert_eq!(completed.valid_bytes(), 32);
    }

    #[test]
    fn test_non_resizable_store_rejects_growth() {
        let queue = JobQueue::with_threads(1).unwrap();
        let system = MemoryIoSystem::new(queue);
        let sink = RecordingSink::new();
        let url = ParsedUrl::for_new_memory_store(16);
        let mut options = OpenOptions::read_write();
        options.create_new_store = true;
        let device = system.open_block_io(&url, options, sink.clone()).unwrap();

        // Writing inside the (empty, non-resizable) store fails.
        let mut buffer = IoBuffer::with_capacity(64);
        buffer.fill_from(b"this will not fit").unwrap();
        device.write_block(buffer, 0);

        let completed = sink.events.lock().pop().unwrap();
        assert!(completed.err.is_err());
        assert!(device.resize(128).is_err());
    }

    #[test]
    fn test_close_detaches_from_registry() {
        let queue = JobQueue::with_threads(1).unwrap();
        let system = MemoryIoSystem::new(queue);
        let sink = RecordingSink::new();
        let url = ParsedUrl::for_new_memory_store(64);
        let device = system
            .open_block_io(&url, OpenOptions::create(), sink)
            .unwrap();
        assert_eq!(system.registry().len(), 1);

        device.close();
        assert!(!device.core().is_open());
        assert_eq!(system.registry().len(), 0);
    }
}
