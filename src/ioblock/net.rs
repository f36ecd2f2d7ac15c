// # Network Media
//
// Block devices over TCP endpoints. Positions are meaningless here:
// reads surface whatever the peer sent next, and unsolicited arrivals
// (data, inbound connections, peer close) flow through the same sink
// as requested completions.
//
// All blocking socket work runs on job-queue workers: one-shot jobs
// for connect/read/write, and a standing poll job that accepts inbound
// connections while a listener is open.

use super::buffer::{BufferOp, IoBuffer};
use super::device::{AsyncBlockIo, BlockIoCore, BlockIoExt, BlockIoSink};
use super::system::{DeviceRegistry, IoSystem};
use super::{MediaKind, OpenOptions, NET_BYTES_PER_BLOCK};
use crate::error::{IoError, Result};
use crate::jobs::{Job, JobQueue, JobState};
use crate::url::{ParsedUrl, UrlScheme};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Soft cap on sockets open through one system.
pub const MAX_OPEN_SOCKETS: usize = 1024;

/// Poll interval for the listener accept loop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A block device over one TCP socket (or one listening socket).
pub struct NetBlockIo {
    core: BlockIoCore,
    socket: Mutex<Option<TcpStream>>,
    listener: Mutex<Option<TcpListener>>,
    io_timeout: Duration,
}

impl NetBlockIo {
    /// Local address, once bound or connected. Mainly useful for
    /// listeners opened on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(listener) = self.listener.lock().as_ref() {
            return listener.local_addr().ok();
        }
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    fn cloned_socket(&self) -> Result<TcpStream> {
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or(IoError::PeerDisconnected)?;
        socket.try_clone().map_err(IoError::from)
    }

    fn install_socket(&self, socket: TcpStream) -> Result<()> {
        let _ = socket.set_nodelay(true);
        socket.set_read_timeout(Some(self.io_timeout))?;
        socket.set_write_timeout(Some(self.io_timeout))?;
        *self.socket.lock() = Some(socket);
        Ok(())
    }
}

impl AsyncBlockIo for NetBlockIo {
    fn core(&self) -> &BlockIoCore {
        &self.core
    }

    fn read_block_impl(self: Arc<Self>, buffer: IoBuffer) {
        let job = Arc::new(SocketTransferJob {
            state: JobState::new(),
            device: Arc::clone(&self),
            buffer: Mutex::new(Some(buffer)),
        });
        if self.core.queue().submit_job(job.clone()).is_err() {
            if let Some(buffer) = job.buffer.lock().take() {
                self.finish_io(buffer, Err(IoError::Fail), 0);
            }
        }
    }

    fn write_block_impl(self: Arc<Self>, buffer: IoBuffer) {
        // Same transfer job; it dispatches on the buffer's op tag.
        self.read_block_impl(buffer);
    }

    fn resize(&self, _new_len: u64) -> Result<()> {
        Err(IoError::NotImpl)
    }

    fn start_timeout(&self, op: BufferOp) {
        let guard = self.socket.lock();
        if let Some(socket) = guard.as_ref() {
            let timeout = Some(self.io_timeout);
            let _ = match op {
                BufferOp::Read => socket.set_read_timeout(timeout),
                BufferOp::Write => socket.set_write_timeout(timeout),
                _ => Ok(()),
            };
        }
    }

    fn cancel_timeout(&self, op: BufferOp) {
        let guard = self.socket.lock();
        if let Some(socket) = guard.as_ref() {
            let _ = match op {
                BufferOp::Read => socket.set_read_timeout(None),
                BufferOp::Write => socket.set_write_timeout(None),
                _ => Ok(()),
            };
        }
    }

    fn close_native(&self) {
        if let Some(socket) = self.socket.lock().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.listener.lock().take();
    }

    fn as_job(self: Arc<Self>) -> Arc<dyn Job> {
        self
    }
}

impl Job for NetBlockIo {
    fn job_state(&self) -> &JobState {
        self.core.job_state()
    }

    fn process_job(&self) {
        if let Some(device) = self.core.device() {
            device.process_completions();
        }
    }
}

/// Resolves and connects on a worker thread, then reports `on_open`.
struct ConnectJob {
    state: JobState,
    device: Arc<NetBlockIo>,
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl Job for ConnectJob {
    fn job_state(&self) -> &JobState {
        &self.state
    }

    fn process_job(&self) {
        let result = self.connect();
        if let Err(err) = &result {
            debug!(host = %self.host, port = self.port, %err, "connect failed");
        }
        self.device.finish_open(result);
    }
}

impl ConnectJob {
    fn connect(&self) -> Result<()> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| IoError::NoHostAddress)?
            .collect();
        if addrs.is_empty() {
            return Err(IoError::NoHostAddress);
        }

        let mut last_err = IoError::NoResponse;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(socket) => {
                    trace!(host = %self.host, %addr, "connected");
                    return self.device.install_socket(socket);
                }
                Err(err) => last_err = IoError::from_os(&err),
            }
        }
        Err(last_err)
    }
}

/// Runs one socket read or write on a worker thread.
struct SocketTransferJob {
    state: JobState,
    device: Arc<NetBlockIo>,
    buffer: Mutex<Option<IoBuffer>>,
}

impl Job for SocketTransferJob {
    fn job_state(&self) -> &JobState {
        &self.state
    }

    fn process_job(&self) {
        let Some(mut buffer) = self.buffer.lock().take() else {
            return;
        };

        let result = match buffer.op() {
            BufferOp::Read => self.read_some(&mut buffer),
            BufferOp::Write => self.write_all(&buffer),
            _ => Err(IoError::Fail),
        };
        match result {
            Ok(n) => self.device.finish_io(buffer, Ok(()), n),
            Err(err) => self.device.finish_io(buffer, Err(err), 0),
        }
    }
}

impl SocketTransferJob {
    fn read_some(&self, buffer: &mut IoBuffer) -> Result<usize> {
        let mut socket = self.device.cloned_socket()?;
        let n = socket.read(buffer.window_mut())?;
        if n == 0 {
            // Orderly peer close.
            return Err(IoError::Eof);
        }
        Ok(n)
    }

    fn write_all(&self, buffer: &IoBuffer) -> Result<usize> {
        let src = &buffer.data()[buffer.start_write_offset..];
        let mut socket = self.device.cloned_socket()?;
        socket.write_all(src)?;
        Ok(src.len())
    }
}

/// Standing job polling a listener for inbound connections. Occupies
/// one worker thread while the listener is open.
struct AcceptJob {
    state: JobState,
    device: Arc<NetBlockIo>,
    system: Weak<NetIoSystem>,
}

impl Job for AcceptJob {
    fn job_state(&self) -> &JobState {
        &self.state
    }

    fn process_job(&self) {
        let listener = {
            let guard = self.device.listener.lock();
            match guard.as_ref().and_then(|l| l.try_clone().ok()) {
                Some(l) => l,
                None => return,
            }
        };

        while self.device.core.is_open() {
            match listener.accept() {
                Ok((socket, peer)) => {
                    trace!(%peer, "accepted connection");
                    match self.install_accepted(socket, peer) {
                        Ok(device) => {
                            let accepted: Arc<dyn AsyncBlockIo> = device;
                            self.device.finish_accept(Ok(()), accepted);
                        }
                        Err(err) => {
                            // Report the failure against the listener itself.
                            let listener: Arc<dyn AsyncBlockIo> = Arc::clone(&self.device) as Arc<dyn AsyncBlockIo>;
                            self.device.finish_accept(Err(err), listener);
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => {
                    if self.device.core.is_open() {
                        warn!(%err, "listener accept failed");
                    }
                    break;
                }
            }
        }
    }
}

impl AcceptJob {
    fn install_accepted(&self, socket: TcpStream, peer: SocketAddr) -> Result<Arc<NetBlockIo>> {
        let system = self.system.upgrade().ok_or(IoError::Fail)?;
        if system.registry.len() >= MAX_OPEN_SOCKETS {
            return Err(IoError::TooManySockets);
        }

        let url = ParsedUrl::parse(&format!("http://{}:{}/", peer.ip(), peer.port()))?;
        let sink = self
            .device
            .sink()
            .ok_or(IoError::Fail)?;
        let device = system.build_device(url, OpenOptions::read_write(), sink)?;
        device.install_socket(socket)?;
        Ok(device)
    }
}

/// The network-media system.
pub struct NetIoSystem {
    registry: DeviceRegistry,
    queue: Arc<JobQueue>,
    self_ref: Weak<NetIoSystem>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl NetIoSystem {
    pub fn new(queue: Arc<JobQueue>, connect_timeout: Duration, io_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry: DeviceRegistry::new(),
            queue,
            self_ref: weak.clone(),
            connect_timeout,
            io_timeout,
        })
    }

    fn as_system(&self) -> Result<Arc<dyn IoSystem>> {
        self.self_ref
            .upgrade()
            .map(|s| s as Arc<dyn IoSystem>)
            .ok_or(IoError::Fail)
    }

    fn build_device(
        &self,
        url: ParsedUrl,
        options: OpenOptions,
        sink: Arc<dyn BlockIoSink>,
    ) -> Result<Arc<NetBlockIo>> {
        let device = Arc::new(NetBlockIo {
            core: BlockIoCore::new(
                MediaKind::Network,
                false,
                false,
                url,
                self.as_system()?,
                Arc::clone(&self.queue),
                options,
                0,
                sink,
            ),
            socket: Mutex::new(None),
            listener: Mutex::new(None),
            io_timeout: self.io_timeout,
        });
        let dyn_device: Arc<dyn AsyncBlockIo> = device.clone();
        device.core.bind(Arc::downgrade(&dyn_device));
        self.registry.attach(dyn_device);
        Ok(device)
    }

    /// Open a listening device on `port` (0 picks a free port). Every
    /// inbound connection arrives at the sink as `on_accept` with a
    /// fresh connected device.
    pub fn open_listener(
        &self,
        port: u16,
        sink: Arc<dyn BlockIoSink>,
    ) -> Result<Arc<NetBlockIo>> {
        if self.registry.len() >= MAX_OPEN_SOCKETS {
            return Err(IoError::TooManySockets);
        }

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
        socket.bind(&bind_addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();

        let local = listener.local_addr()?;
        debug!(%local, "listener open");

        let url = ParsedUrl::parse(&format!("http://0.0.0.0:{}/", local.port()))?;
        let device = self.build_device(url, OpenOptions::read_write(), sink)?;
        *device.listener.lock() = Some(listener);

        let job = Arc::new(AcceptJob {
            state: JobState::new(),
            device: Arc::clone(&device),
            system: self.self_ref.clone(),
        });
        self.queue.submit_job(job)?;
        Ok(device)
    }
}

impl IoSystem for NetIoSystem {
    fn media(&self) -> MediaKind {
        MediaKind::Network
    }

    fn default_bytes_per_block(&self) -> usize {
        NET_BYTES_PER_BLOCK
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
        match url.scheme {
            UrlScheme::Http => {}
            UrlScheme::Https => return Err(IoError::HttpsRequired),
            _ => return Err(IoError::InvalidUrl(format!("not a network url: {}", url))),
        }
        if self.registry.len() >= MAX_OPEN_SOCKETS {
            return Err(IoError::TooManySockets);
        }

        let device = self.build_device(url.clone(), options, sink)?;

        let job = Arc::new(ConnectJob {
            state: JobState::new(),
            device: Arc::clone(&device),
            host: url.host.clone(),
            port: url.port,
            connect_timeout: self.connect_timeout,
        });
        self.queue.submit_job(job)?;

        Ok(device)
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }
}
