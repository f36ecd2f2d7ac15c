// End-to-end block I/O scenarios across memory and file media.

use parking_lot::{Condvar, Mutex};
use polystream::error::{IoError, Result};
use polystream::ioblock::{
    AsyncBlockIo, BlockIoExt, BlockIoSink, FileIoSystem, IoBuffer, IoSystem, MemoryIoSystem,
    OpenOptions,
};
use polystream::jobs::JobQueue;
use polystream::stream::{AsyncIoStream, StreamEvents};
use polystream::url::ParsedUrl;
use std::sync::Arc;
use std::time::{Duration, Instant};

const STORE_SIZE: usize = 10_300;

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

struct QuietEvents;

impl StreamEvents for QuietEvents {
    fn on_ready_to_read(&self, _r: Result<()>, _t: u64, _s: Arc<AsyncIoStream>) {}
    fn on_flush(&self, _r: Result<()>, _s: Arc<AsyncIoStream>) {}
    fn on_open(&self, _r: Result<()>, _s: Arc<AsyncIoStream>) {}
    fn on_stream_disconnect(&self, _r: Result<()>, _s: Arc<AsyncIoStream>) {}
}

/// Sink that records completed buffers and wakes waiters.
struct CollectingSink {
    events: Mutex<Vec<IoBuffer>>,
    signal: Condvar,
}

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            signal: Condvar::new(),
        })
    }

    fn wait_for(&self, count: usize) -> Vec<IoBuffer> {
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut events = self.events.lock();
        while events.len() < count {
            assert!(
                !self
                    .signal
                    .wait_until(&mut events, deadline)
                    .timed_out(),
                "timed out waiting for {} completions (got {})",
                count,
                events.len()
            );
        }
        std::mem::take(&mut *events)
    }
}

impl BlockIoSink for CollectingSink {
    fn on_io_event(&self, buffer: IoBuffer) {
        self.events.lock().push(buffer);
        self.signal.notify_all();
    }
    fn on_open(&self, _result: Result<()>, _device: Arc<dyn AsyncBlockIo>) {}
    fn on_accept(&self, _result: Result<()>, _device: Arc<dyn AsyncBlockIo>) {}
}

#[test]
fn test_memory_round_trip() {
    let queue = JobQueue::with_threads(2).unwrap();
    let system: Arc<dyn IoSystem> = MemoryIoSystem::new(queue.clone());
    let url = ParsedUrl::for_new_memory_store(STORE_SIZE);
    let stream =
        AsyncIoStream::open(&system, &url, OpenOptions::create(), Arc::new(QuietEvents)).unwrap();

    let data = pattern(12, STORE_SIZE);
    assert_eq!(stream.write(&data).unwrap(), STORE_SIZE);

    stream.set_position(0).unwrap();
    let mut read_back = vec![0u8; STORE_SIZE];
    stream.read_exact(&mut read_back).unwrap();
    assert_eq!(read_back, data);

    stream.close();
    queue.shutdown();
}

#[test]
fn test_file_grow_and_shrink() {
    let queue = JobQueue::with_threads(4).unwrap();
    let system: Arc<dyn IoSystem> = FileIoSystem::new(queue.clone());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow_shrink.bin");
    let url = ParsedUrl::for_file(path.to_str().unwrap());

    // Create and fill with pattern(12).
    let stream =
        AsyncIoStream::open(&system, &url, OpenOptions::create(), Arc::new(QuietEvents)).unwrap();
    let first = pattern(12, STORE_SIZE);
    stream.write(&first).unwrap();
    stream.flush_blocking().unwrap();

    let device = stream.device().unwrap();
    device.resize(2 * STORE_SIZE as u64).unwrap();
    assert_eq!(device.core().media_size(), 2 * STORE_SIZE as u64);

    // The original prefix survives the grow.
    stream.set_position(0).unwrap();
    let mut read_back = vec![0u8; STORE_SIZE];
    stream.read_exact(&mut read_back).unwrap();
    assert_eq!(read_back, first);

    // Overwrite the whole enlarged store, then shrink it.
    let second = pattern(37, 2 * STORE_SIZE);
    stream.set_position(0).unwrap();
    stream.write(&second).unwrap();
    stream.flush_blocking().unwrap();
    device.resize(STORE_SIZE as u64 / 2).unwrap();
    stream.close();

    // Reopen: the truncated prefix still reads pattern(37).
    let stream = AsyncIoStream::open(
        &system,
        &url,
        OpenOptions::read_write(),
        Arc::new(QuietEvents),
    )
    .unwrap();
    assert_eq!(stream.get_data_length(), STORE_SIZE as u64 / 2);
    let mut read_back = vec![0u8; STORE_SIZE / 2];
    stream.read_exact(&mut read_back).unwrap();
    assert_eq!(read_back, &second[..STORE_SIZE / 2]);

    stream.close();
    queue.shutdown();
}

#[test]
fn test_read_past_file_eof() {
    let queue = JobQueue::with_threads(2).unwrap();
    let system: Arc<dyn IoSystem> = FileIoSystem::new(queue.clone());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eof.bin");
    let url = ParsedUrl::for_file(path.to_str().unwrap());

    let stream =
        AsyncIoStream::open(&system, &url, OpenOptions::create(), Arc::new(QuietEvents)).unwrap();
    stream.write(&pattern(12, STORE_SIZE)).unwrap();
    stream.flush_blocking().unwrap();
    stream.close();

    // Read a block well past the end of the file.
    let sink = CollectingSink::new();
    let device = system
        .open_block_io(&url, OpenOptions::read_only(), sink.clone())
        .unwrap();
    let mut buffer = system.alloc_io_buffer(0).unwrap();
    buffer.media_pos = system.io_start_position((STORE_SIZE + 4096 + 4096) as u64);
    device.read_block(buffer);

    let completed = sink.wait_for(1).pop().unwrap();
    assert_eq!(completed.err, Err(IoError::Eof));
    assert_eq!(completed.valid_bytes(), 0);

    let (reads, writes) = device.core().active_io_counts();
    assert_eq!((reads, writes), (0, 0));

    device.close();
    queue.shutdown();
}

#[test]
fn test_event_order_under_load() {
    let queue = JobQueue::with_threads(4).unwrap();
    let system: Arc<dyn IoSystem> = FileIoSystem::new(queue.clone());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ordering.bin");
    let url = ParsedUrl::for_file(path.to_str().unwrap());

    let sink = CollectingSink::new();
    let device = system
        .open_block_io(&url, OpenOptions::create(), sink.clone())
        .unwrap();

    // Record 1,000 completions in submission order while four workers
    // dispatch them.
    const COUNT: usize = 1_000;
    for i in 0..COUNT {
        let mut buffer = IoBuffer::with_capacity(16);
        buffer.media_pos = i as u64;
        device.finish_io(buffer, Ok(()), 0);
    }

    let events = sink.wait_for(COUNT);
    let observed: Vec<u64> = events.iter().map(|b| b.media_pos).collect();
    let expected: Vec<u64> = (0..COUNT as u64).collect();
    assert_eq!(observed, expected, "completions must arrive in order");

    assert_eq!(device.core().pending_completions(), 0);

    device.close();
    queue.shutdown();
}

#[test]
fn test_synchronous_file_device_completes_inline() {
    let queue = JobQueue::with_threads(1).unwrap();
    let system: Arc<dyn IoSystem> = FileIoSystem::new(queue.clone());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.bin");
    let url = ParsedUrl::for_file(path.to_str().unwrap());

    let sink = CollectingSink::new();
    let device = system
        .open_block_io(
            &url,
            OpenOptions::create().with_synchronous_io(),
            sink.clone(),
        )
        .unwrap();

    let mut buffer = system.alloc_io_buffer(0).unwrap();
    buffer.fill_from(b"inline completion").unwrap();
    buffer.media_pos = 0;
    device.write_block(buffer, 0);

    // No waiting: the event was delivered on this thread.
    let events = std::mem::take(&mut *sink.events.lock());
    assert_eq!(events.len(), 1);
    assert!(events[0].err.is_ok());
    assert_eq!(device.core().media_size(), 17);

    device.close();
    queue.shutdown();
}

#[test]
fn test_listener_delivers_accepted_connections() {
    use polystream::ioblock::NetIoSystem;

    struct AcceptSink {
        accepted: Mutex<Vec<Arc<dyn AsyncBlockIo>>>,
        signal: Condvar,
    }

    impl BlockIoSink for AcceptSink {
        fn on_io_event(&self, _buffer: IoBuffer) {}
        fn on_open(&self, _result: Result<()>, _device: Arc<dyn AsyncBlockIo>) {}
        fn on_accept(&self, result: Result<()>, device: Arc<dyn AsyncBlockIo>) {
            result.unwrap();
            self.accepted.lock().push(device);
            self.signal.notify_all();
        }
    }

    let queue = JobQueue::with_threads(3).unwrap();
    let system = NetIoSystem::new(
        queue.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    );
    let sink = Arc::new(AcceptSink {
        accepted: Mutex::new(Vec::new()),
        signal: Condvar::new(),
    });

    let listener = system.open_listener(0, sink.clone()).unwrap();
    let port = listener.local_addr().unwrap().port();

    let _client_a = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    let _client_b = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut accepted = sink.accepted.lock();
    while accepted.len() < 2 {
        assert!(
            !sink.signal.wait_until(&mut accepted, deadline).timed_out(),
            "accept events never arrived"
        );
    }
    for device in accepted.iter() {
        assert!(device.core().is_open());
    }
    drop(accepted);

    listener.close();
    queue.shutdown();
}

#[test]
fn test_registry_drains_on_system_shutdown() {
    let queue = JobQueue::with_threads(1).unwrap();
    let system: Arc<dyn IoSystem> = MemoryIoSystem::new(queue.clone());
    let sink = CollectingSink::new();

    for len in [64usize, 128, 256] {
        let url = ParsedUrl::for_new_memory_store(len);
        system
            .open_block_io(&url, OpenOptions::create(), sink.clone())
            .unwrap();
    }
    assert_eq!(system.registry().len(), 3);

    system.shutdown();
    assert_eq!(system.registry().len(), 0);
    queue.shutdown();
}
