// # File Media
//
// Block devices over local files. Transfers run as one-shot jobs on
// the worker pool (positional read/write, no shared cursor); a device
// opened with `use-synchronous-io` runs them inline on the caller's
// thread instead.

use super::buffer::{BufferOp, IoBuffer};
use super::device::{AsyncBlockIo, BlockIoCore, BlockIoExt, BlockIoSink};
use super::system::{DeviceRegistry, IoSystem};
use super::{MediaKind, OpenOptions, FILE_BYTES_PER_BLOCK};
use crate::error::{IoError, Result};
use crate::jobs::{Job, JobQueue, JobState};
use crate::url::{ParsedUrl, UrlScheme};
use parking_lot::Mutex;
use std::fs::File;
use std::sync::{Arc, Weak};
use tracing::debug;

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, pos)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, pos)
}

#[cfg(unix)]
fn pwrite_all(file: &File, buf: &[u8], pos: u64) -> std::io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, pos)
}

#[cfg(windows)]
fn pwrite_all(file: &File, mut buf: &[u8], mut pos: u64) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = std::os::windows::fs::FileExt::seek_write(file, buf, pos)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "file write made no progress",
            ));
        }
        buf = &buf[n..];
        pos += n as u64;
    }
    Ok(())
}

/// Runs one queued transfer on a worker thread.
struct FileTransferJob {
    state: JobState,
    device: Arc<FileBlockIo>,
    buffer: Mutex<Option<IoBuffer>>,
}

impl Job for FileTransferJob {
    fn job_state(&self) -> &JobState {
        &self.state
    }

    fn process_job(&self) {
        if let Some(buffer) = self.buffer.lock().take() {
            self.device.execute_transfer(buffer);
        }
    }
}

/// A block device over one open file.
pub struct FileBlockIo {
    core: BlockIoCore,
    file: Mutex<Option<File>>,
}

impl FileBlockIo {
    /// Perform the blocking transfer and report it. Runs on a worker
    /// thread, or on the caller's thread for synchronous devices.
    fn execute_transfer(&self, mut buffer: IoBuffer) {
        let result = match buffer.op() {
            BufferOp::Read => self.transfer_read(&mut buffer),
            BufferOp::Write => self.transfer_write(&buffer),
            _ => Err(IoError::Fail),
        };
        let Some(device) = self.core.device() else {
            return;
        };
        match result {
            Ok(n) => device.finish_io(buffer, Ok(()), n),
            Err(err) => device.finish_io(buffer, Err(err), 0),
        }
    }

    fn transfer_read(&self, buffer: &mut IoBuffer) -> Result<usize> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(IoError::Fail)?;

        let pos = buffer.media_pos;
        let window = buffer.window_mut();
        let mut filled = 0usize;
        while filled < window.len() {
            let n = pread(file, &mut window[filled..], pos + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            Err(IoError::Eof)
        } else {
            Ok(filled)
        }
    }

    fn transfer_write(&self, buffer: &IoBuffer) -> Result<usize> {
        let src = &buffer.data()[buffer.start_write_offset..];
        let pos = buffer.media_pos + buffer.start_write_offset as u64;

        {
            let guard = self.file.lock();
            let file = guard.as_ref().ok_or(IoError::Fail)?;
            pwrite_all(file, src, pos)?;
        }

        self.core.grow_media_size(pos + src.len() as u64);
        Ok(src.len())
    }

    fn submit_transfer(self: Arc<Self>, buffer: IoBuffer) {
        if self.core.is_synchronous() {
            self.execute_transfer(buffer);
            return;
        }

        let queue = Arc::clone(self.core.queue());
        let job = Arc::new(FileTransferJob {
            state: JobState::new(),
            device: Arc::clone(&self),
            buffer: Mutex::new(Some(buffer)),
        });
        if queue.submit_job(job.clone()).is_err() {
            if let Some(buffer) = job.buffer.lock().take() {
                self.finish_io(buffer, Err(IoError::Fail), 0);
            }
        }
    }
}

impl AsyncBlockIo for FileBlockIo {
    fn core(&self) -> &BlockIoCore {
        &self.core
    }

    fn read_block_impl(self: Arc<Self>, buffer: IoBuffer) {
        self.submit_transfer(buffer);
    }

    fn write_block_impl(self: Arc<Self>, buffer: IoBuffer) {
        self.submit_transfer(buffer);
    }

    fn resize(&self, new_len: u64) -> Result<()> {
        if !self.core.is_open() || !self.core.options().write {
            return Err(IoError::Fail);
        }

        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(IoError::Fail)?;
        file.set_len(new_len)?;
        drop(guard);

        self.core.set_media_size(new_len);
        Ok(())
    }

    fn flush_native(&self) -> Result<()> {
        let guard = self.file.lock();
        if let Some(file) = guard.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn close_native(&self) {
        self.file.lock().take();
    }

    fn as_job(self: Arc<Self>) -> Arc<dyn Job> {
        self
    }
}

impl Job for FileBlockIo {
    fn job_state(&self) -> &JobState {
        self.core.job_state()
    }

    fn process_job(&self) {
        if let Some(device) = self.core.device() {
            device.process_completions();
        }
    }
}

/// The file-media system.
pub struct FileIoSystem {
    registry: DeviceRegistry,
    queue: Arc<JobQueue>,
    self_ref: Weak<FileIoSystem>,
}

impl FileIoSystem {
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

impl IoSystem for FileIoSystem {
    fn media(&self) -> MediaKind {
        MediaKind::File
    }

    fn default_bytes_per_block(&self) -> usize {
        FILE_BYTES_PER_BLOCK
    }

    fn buffer_alignment(&self) -> usize {
        FILE_BYTES_PER_BLOCK
    }

    /// File transfers start at the containing block boundary.
    fn io_start_position(&self, pos: u64) -> u64 {
        pos & !(FILE_BYTES_PER_BLOCK as u64 - 1)
    }

    fn open_block_io(
        &self,
        url: &ParsedUrl,
        options: OpenOptions,
        sink: Arc<dyn BlockIoSink>,
    ) -> Result<Arc<dyn AsyncBlockIo>> {
        if url.scheme != UrlScheme::File {
            return Err(IoError::InvalidUrl(format!("not a file url: {}", url)));
        }

        let mut open_options = std::fs::OpenOptions::new();
        open_options.read(options.read).write(options.write);
        if options.create_new_store {
            open_options.create(true).truncate(true);
        }
        let file = open_options.open(&url.path)?;
        let media_size = file.metadata()?.len();

        debug!(path = %url.path, media_size, "opened file device");

        let device = Arc::new(FileBlockIo {
            core: BlockIoCore::new(
                MediaKind::File,
                true,
                options.synchronous,
                url.clone(),
                self.as_system()?,
                Arc::clone(&self.queue),
                options,
                media_size,
                sink,
            ),
            file: Mutex::new(Some(file)),
        });

        let dyn_device: Arc<dyn AsyncBlockIo> = device.clone();
        device.core.bind(Arc::downgrade(&dyn_device));
        self.registry.attach(dyn_device.clone());

        dyn_device.finish_open(Ok(()));
        Ok(dyn_device)
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }
}
