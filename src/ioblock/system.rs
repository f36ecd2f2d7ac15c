// # I/O Systems
//
// One `IoSystem` per medium. A system is the factory for block devices
// over URLs of its scheme, owns the per-medium sizing defaults, and
// tracks its open devices so shutdown can drain them.

use super::buffer::IoBuffer;
use super::device::{AsyncBlockIo, BlockIoSink};
use super::{MediaKind, OpenOptions};
use crate::error::Result;
use crate::url::ParsedUrl;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// List of the open devices a system has created.
///
/// An open device is held alive by this list; `close()` detaches it,
/// breaking the system→device cycle.
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<dyn AsyncBlockIo>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, device: Arc<dyn AsyncBlockIo>) {
        self.devices.lock().push(device);
    }

    pub fn detach(&self, device: &Arc<dyn AsyncBlockIo>) {
        self.devices
            .lock()
            .retain(|d| !Arc::ptr_eq(d, device));
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the open devices.
    pub fn snapshot(&self) -> Vec<Arc<dyn AsyncBlockIo>> {
        self.devices.lock().clone()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A medium: factory for block devices plus the medium's sizing policy.
pub trait IoSystem: Send + Sync {
    fn media(&self) -> MediaKind;

    /// Default transfer size for devices of this medium.
    fn default_bytes_per_block(&self) -> usize;

    /// Required buffer alignment; 0 means none.
    fn buffer_alignment(&self) -> usize;

    /// Round a position down to the start of its containing block, for
    /// media that cannot start a transfer mid-block.
    fn io_start_position(&self, pos: u64) -> u64 {
        pos
    }

    /// Open (or create) the resource named by `url`. The returned
    /// device is already attached to this system; the sink's `on_open`
    /// fires when the open completes — possibly before this returns,
    /// possibly from a worker thread.
    fn open_block_io(
        &self,
        url: &ParsedUrl,
        options: OpenOptions,
        sink: Arc<dyn BlockIoSink>,
    ) -> Result<Arc<dyn AsyncBlockIo>>;

    fn registry(&self) -> &DeviceRegistry;

    /// Allocate a transfer buffer sized and aligned for this medium.
    /// `size` of 0 means the medium's default block size.
    fn alloc_io_buffer(&self, size: usize) -> Result<IoBuffer> {
        let size = if size == 0 {
            self.default_bytes_per_block()
        } else {
            size
        };
        let alignment = self.buffer_alignment();
        if alignment > 0 {
            IoBuffer::with_alignment(size.max(alignment), alignment)
        } else {
            Ok(IoBuffer::with_capacity(size))
        }
    }

    /// Close every open device. Called from runtime teardown.
    fn shutdown(&self) {
        use super::device::BlockIoExt;

        let devices = self.registry().snapshot();
        if !devices.is_empty() {
            debug!(
                media = ?self.media(),
                count = devices.len(),
                "io system shutdown closing devices"
            );
        }
        for device in devices {
            device.close();
        }
    }
}
