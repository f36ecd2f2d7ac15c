// Stream-layer behavior over real devices: block-aligned file loads,
// splicing, whole-block transfer, chunked-framing removal.

use polystream::error::Result;
use polystream::ioblock::{FileIoSystem, IoSystem, MemoryIoSystem, OpenOptions};
use polystream::jobs::JobQueue;
use polystream::stream::{AsyncIoStream, StreamEvents};
use polystream::url::ParsedUrl;
use std::sync::Arc;

struct QuietEvents;

impl StreamEvents for QuietEvents {
    fn on_ready_to_read(&self, _r: Result<()>, _t: u64, _s: Arc<AsyncIoStream>) {}
    fn on_flush(&self, _r: Result<()>, _s: Arc<AsyncIoStream>) {}
    fn on_open(&self, _r: Result<()>, _s: Arc<AsyncIoStream>) {}
    fn on_stream_disconnect(&self, _r: Result<()>, _s: Arc<AsyncIoStream>) {}
}

fn memory_stream(queue: &Arc<JobQueue>, len: usize) -> Arc<AsyncIoStream> {
    let system: Arc<dyn IoSystem> = MemoryIoSystem::new(queue.clone());
    let url = ParsedUrl::for_new_memory_store(len);
    AsyncIoStream::open(&system, &url, OpenOptions::create(), Arc::new(QuietEvents)).unwrap()
}

#[test]
fn test_file_stream_reads_from_unaligned_positions() {
    let queue = JobQueue::with_threads(2).unwrap();
    let system: Arc<dyn IoSystem> = FileIoSystem::new(queue.clone());
    let dir = tempfile::tempdir().unwrap();
    let url = ParsedUrl::for_file(dir.path().join("aligned.bin").to_str().unwrap());

    let stream =
        AsyncIoStream::open(&system, &url, OpenOptions::create(), Arc::new(QuietEvents)).unwrap();
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    stream.write(&data).unwrap();
    stream.flush_blocking().unwrap();
    stream.close();

    // A fresh stream must round the device read down to the block
    // boundary and still hand back the right bytes.
    let stream = AsyncIoStream::open(
        &system,
        &url,
        OpenOptions::read_only(),
        Arc::new(QuietEvents),
    )
    .unwrap();
    stream.set_position(5_000).unwrap();
    let mut chunk = [0u8; 100];
    stream.read_exact(&mut chunk).unwrap();
    assert_eq!(&chunk[..], &data[5_000..5_100]);

    stream.close();
    queue.shutdown();
}

#[test]
fn test_chunked_framing_removal_is_lossless() {
    // The chunked-decode law: splicing framing out of a stream leaves
    // exactly the payload.
    let queue = JobQueue::with_threads(1).unwrap();
    let stream = memory_stream(&queue, 4096);

    let payload = b"Hello world!";
    let framed = b"6\r\nHello \r\n6\r\nworld!\r\n0\r\n\r\n";
    stream.write(framed).unwrap();

    // Walk the frame the way the chunk decoder does: header, data,
    // trailing CRLF, next header.
    stream.remove_n_bytes(0, 3).unwrap(); // "6\r\n"
    stream.remove_n_bytes(6, 5).unwrap(); // "\r\n6\r\n"
    stream.remove_n_bytes(12, framed.len() as u64 - 3 - 5 - 12).unwrap();

    assert_eq!(stream.get_data_length(), payload.len() as u64);
    stream.set_position(0).unwrap();
    let mut decoded = vec![0u8; payload.len()];
    stream.read_exact(&mut decoded).unwrap();
    assert_eq!(decoded, payload);

    stream.close();
    queue.shutdown();
}

#[test]
fn test_copy_stream_moves_whole_blocks() {
    let queue = JobQueue::with_threads(1).unwrap();
    let src = memory_stream(&queue, 8192);
    let dst = memory_stream(&queue, 8192);

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 127) as u8).collect();
    src.write(&data).unwrap();
    src.set_position(0).unwrap();

    let moved = src.copy_stream(&dst, data.len() as u64, true).unwrap();
    assert_eq!(moved, data.len() as u64);

    dst.set_position(0).unwrap();
    let mut copied = vec![0u8; data.len()];
    dst.read_exact(&mut copied).unwrap();
    assert_eq!(copied, data);

    src.close();
    dst.close();
    queue.shutdown();
}

#[test]
fn test_sparse_write_reads_back_zero_gap() {
    let queue = JobQueue::with_threads(1).unwrap();
    let stream = memory_stream(&queue, 4096);

    stream.write(b"head").unwrap();
    stream.set_position(10).unwrap();
    stream.write(b"tail").unwrap();

    stream.set_position(0).unwrap();
    let mut all = vec![0u8; 14];
    stream.read_exact(&mut all).unwrap();
    assert_eq!(&all[..4], b"head");
    assert_eq!(&all[4..10], &[0u8; 6]);
    assert_eq!(&all[10..], b"tail");

    stream.close();
    queue.shutdown();
}

#[test]
fn test_read_at_spans_blocks() {
    let queue = JobQueue::with_threads(1).unwrap();
    let stream = memory_stream(&queue, 8192);

    // More than one 1 KB memory block.
    let data: Vec<u8> = (0..2500u32).map(|i| (i % 241) as u8).collect();
    stream.write(&data).unwrap();

    let mut window = vec![0u8; 600];
    let n = stream.read_at(900, &mut window).unwrap();
    assert_eq!(n, 600);
    assert_eq!(window, &data[900..1500]);
    // read_at must not disturb the cursor.
    assert_eq!(stream.get_position(), 2500);

    stream.close();
    queue.shutdown();
}
