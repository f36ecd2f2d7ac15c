// # Asynchronous Block I/O
//
// One open resource (a memory region, a file, a network endpoint) is a
// block device: it accepts block-granular read and write requests and
// reports every completion through a single per-device callback sink.
//
// ```text
// ┌─────────────────────────────────────────────────┐
// │        AsyncIoStream / HTTP engine (callers)    │
// ├─────────────────────────────────────────────────┤
// │   AsyncBlockIo + BlockIoCore (this module)      │
// ├─────────────────────────────────────────────────┤
// │   memory / file / network media backends        │
// ├─────────────────────────────────────────────────┤
// │   JobQueue worker threads (completion dispatch) │
// └─────────────────────────────────────────────────┘
// ```
//
// A single sink per device, rather than one callback per operation,
// keeps unsolicited events (inbound packets, inbound connections, peer
// close) in the same delivery path as request completions. Completions
// for one device are delivered strictly in arrival order no matter how
// many worker threads drain the queue.

mod buffer;
mod device;
mod file;
mod memory;
mod net;
mod system;

pub use buffer::{AlignedBuf, BufferOp, IoBuffer};
pub use device::{AsyncBlockIo, BlockIoCore, BlockIoExt, BlockIoSink, CompletionEvent};
pub use file::FileIoSystem;
pub use memory::{MemoryIoSystem, MAX_SANE_MEMORY_STORE_SIZE};
pub use net::{NetBlockIo, NetIoSystem, MAX_OPEN_SOCKETS};
pub use system::{DeviceRegistry, IoSystem};

/// Kind of medium behind a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Memory,
    File,
    Network,
}

/// Options for opening a block device.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub resizable: bool,
    pub create_new_store: bool,
    pub synchronous: bool,
}

impl OpenOptions {
    /// Read-only access to an existing store.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Read/write access to an existing store.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Create a new resizable store with read/write access.
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            resizable: true,
            create_new_store: true,
            ..Default::default()
        }
    }

    pub fn with_synchronous_io(mut self) -> Self {
        self.synchronous = true;
        self
    }

    pub fn with_resizable(mut self) -> Self {
        self.resizable = true;
        self
    }
}

/// Default block size for memory media.
pub const MEMORY_BYTES_PER_BLOCK: usize = 1024;

/// Default block size and buffer alignment for file media.
pub const FILE_BYTES_PER_BLOCK: usize = 4096;

/// Default block size for network media.
pub const NET_BYTES_PER_BLOCK: usize = 2048;
