// Polystream - cross-media asynchronous block I/O and HTTP streaming
// engine. One callback-driven model over memory, file and network
// media, with a buffered stream layer and an HTTP/1.1 client on top.

pub mod chartype;
pub mod config;
pub mod error;
pub mod http;
pub mod ioblock;
pub mod jobs;
pub mod runtime;
pub mod stream;
pub mod url;

pub use config::Settings;
pub use error::{IoError, Result};
pub use ioblock::{
    AsyncBlockIo, BlockIoExt, BlockIoSink, BufferOp, IoBuffer, IoSystem, MediaKind, OpenOptions,
};
pub use stream::{AsyncIoStream, StreamEvents};
pub use url::{ParsedUrl, UrlScheme};
