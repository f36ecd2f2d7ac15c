// # HTTP/1.1 Client Engine
//
// Request/response framing over the buffered stream layer: header
// parse and emission, chunked transfer decoding, redirection,
// connection reuse, content typing, and the three accepted date
// formats.

mod content_type;
mod date;
mod message;
mod names;
mod stream;

pub use content_type::{parse_content_type, ContentKind, ContentSubtype, MediaType};
pub use date::{format_http_date, parse_http_date};
pub use message::{
    is_followed_redirect, is_informational_status, is_redirect_status, is_success_status,
    HeaderBlock, HeaderLine, HeaderValue, HttpMethod, STATUS_MOVED_PERMANENTLY,
    STATUS_MOVED_TEMPORARILY, STATUS_NOT_MODIFIED, STATUS_OK, STATUS_SEE_OTHER,
    STATUS_SWITCH_PROXY, STATUS_USE_PROXY,
};
pub use names::{global_names, NameId, NameTable, BUILT_IN_NAMES};
pub use stream::{HttpCallback, HttpStream, MAX_CHUNK_HEADER_SIZE, MAX_REASONABLE_REDIRECTS};
