// # Engine Runtime
//
// Process-wide singletons: the worker pool and the three media
// systems. Initialized once at startup, torn down at process end.

use crate::config::Settings;
use crate::error::{IoError, Result};
use crate::ioblock::{
    AsyncBlockIo, BlockIoSink, FileIoSystem, IoSystem, MemoryIoSystem, NetIoSystem, OpenOptions,
};
use crate::jobs::JobQueue;
use crate::stream::{AsyncIoStream, StreamEvents};
use crate::url::{ParsedUrl, UrlScheme};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

struct Runtime {
    settings: Settings,
    job_queue: Arc<JobQueue>,
    memory_io: Arc<MemoryIoSystem>,
    file_io: Arc<FileIoSystem>,
    net_io: Arc<NetIoSystem>,
    down: AtomicBool,
}

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

fn build(settings: Settings) -> Result<Runtime> {
    let threads = settings.worker_thread_count();
    let job_queue = JobQueue::with_threads(threads)?;
    info!(threads, "runtime starting");

    Ok(Runtime {
        memory_io: MemoryIoSystem::new(Arc::clone(&job_queue)),
        file_io: FileIoSystem::new(Arc::clone(&job_queue)),
        net_io: NetIoSystem::new(
            Arc::clone(&job_queue),
            Duration::from_secs(settings.connect_timeout_secs),
            Duration::from_secs(settings.io_timeout_secs),
        ),
        settings,
        job_queue,
        down: AtomicBool::new(false),
    })
}

/// Bring up the job queue and the three I/O systems.
///
/// Call once at process start; a second call fails.
pub fn init(settings: Settings) -> Result<()> {
    let mut fresh = false;
    RUNTIME.get_or_try_init(|| {
        fresh = true;
        build(settings)
    })?;
    if fresh {
        Ok(())
    } else {
        Err(IoError::Fail)
    }
}

/// Initialize with defaults if nobody has yet. Safe to call from many
/// places; only the first call does the work.
pub fn ensure_init() -> Result<()> {
    RUNTIME
        .get_or_try_init(|| build(Settings::default()))
        .map(|_| ())
}

fn runtime() -> Result<&'static Runtime> {
    let rt = RUNTIME.get().ok_or(IoError::Fail)?;
    if rt.down.load(Ordering::Acquire) {
        return Err(IoError::Fail);
    }
    Ok(rt)
}

/// Close every open device and stop the worker pool. Defensive: safe
/// to call more than once, or without `init`.
pub fn shutdown() {
    let Some(rt) = RUNTIME.get() else {
        return;
    };
    if rt.down.swap(true, Ordering::AcqRel) {
        return;
    }
    info!("runtime shutting down");
    rt.net_io.shutdown();
    rt.file_io.shutdown();
    rt.memory_io.shutdown();
    rt.job_queue.shutdown();
}

pub fn settings() -> Result<&'static Settings> {
    Ok(&runtime()?.settings)
}

pub fn job_queue() -> Result<Arc<JobQueue>> {
    Ok(Arc::clone(&runtime()?.job_queue))
}

pub fn memory_io_system() -> Result<Arc<dyn IoSystem>> {
    Ok(runtime()?.memory_io.clone() as Arc<dyn IoSystem>)
}

pub fn file_io_system() -> Result<Arc<dyn IoSystem>> {
    Ok(runtime()?.file_io.clone() as Arc<dyn IoSystem>)
}

pub fn net_io_system() -> Result<Arc<dyn IoSystem>> {
    Ok(runtime()?.net_io.clone() as Arc<dyn IoSystem>)
}

/// The network system as its concrete type (listener support).
pub fn net_io_system_concrete() -> Result<Arc<NetIoSystem>> {
    Ok(Arc::clone(&runtime()?.net_io))
}

/// Pick the system for a URL's scheme.
pub fn io_system_for(url: &ParsedUrl) -> Result<Arc<dyn IoSystem>> {
    match url.scheme {
        UrlScheme::Memory => memory_io_system(),
        UrlScheme::File => file_io_system(),
        UrlScheme::Http => net_io_system(),
        UrlScheme::Https => Err(IoError::HttpsRequired),
        UrlScheme::Urn => Err(IoError::InvalidUrl("urn names are not openable".to_string())),
    }
}

/// Open a block device by URL, whatever the medium.
pub fn open_block_io(
    url: &ParsedUrl,
    options: OpenOptions,
    sink: Arc<dyn BlockIoSink>,
) -> Result<Arc<dyn AsyncBlockIo>> {
    io_system_for(url)?.open_block_io(url, options, sink)
}

/// Open a buffered stream by URL, whatever the medium.
pub fn open_io_stream(
    url: &ParsedUrl,
    options: OpenOptions,
    events: Arc<dyn StreamEvents>,
) -> Result<Arc<AsyncIoStream>> {
    let system = io_system_for(url)?;
    AsyncIoStream::open(&system, url, options, events)
}
