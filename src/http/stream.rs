// # HTTP Request Engine
//
// The client-side HTTP/1.1 state machine over a buffered network
// stream: request emission, header parse, chunked decode, redirects,
// connection reuse. One logical request runs at a time; the terminal
// callback fires exactly once per request.

use super::content_type::{parse_content_type, MediaType};
use super::message::{
    is_followed_redirect, HeaderBlock, HttpMethod, STATUS_OK,
};
use crate::chartype::{self, HEX_CHAR, NEWLINE_CHAR, WHITESPACE_CHAR};
use crate::error::{IoError, Result};
use crate::ioblock::OpenOptions;
use crate::runtime;
use crate::stream::{AsyncIoStream, StreamEvents};
use crate::url::{ParsedUrl, UrlScheme};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// A chunk header (hex size + extension + CRLF) larger than this
/// aborts the transfer.
pub const MAX_CHUNK_HEADER_SIZE: usize = 128;

/// Redirect hops beyond this fail with NoResponse.
pub const MAX_REASONABLE_REDIRECTS: u32 = 5;

/// Terminal per-document callback.
pub trait HttpCallback: Send + Sync {
    fn on_read_http_document(&self, result: Result<()>, http: Arc<HttpStream>);
    fn on_write_http_document(&self, result: Result<()>, http: Arc<HttpStream>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Connecting,
    WritingRequest,
    ReadingHeader,
    ReadingBody,
    ReadingChunk,
    Done,
}

/// What a body-reading step decided.
enum ReadAction {
    GetMoreData,
    FinishedDocument,
}

enum HeaderProgress {
    NeedMore,
    Complete,
}

#[derive(Clone)]
struct PostBody {
    stream: Arc<AsyncIoStream>,
    media: MediaType,
    content_length: u64,
}

struct HttpInner {
    url: Option<ParsedUrl>,
    method: HttpMethod,
    status_code: u16,
    major: u8,
    minor: u8,
    headers: HeaderBlock,
    state: EngineState,
    keep_alive: bool,
    connected: bool,
    read_last_chunk_header: bool,
    writing_document: bool,
    content_length: Option<u64>,
    current_chunk: u32,
    next_chunk_pos: u64,
    header_end: u64,
    bytes_processed: u64,
    endline: [u8; 4],
    endline_count: usize,
    redirects: u32,
    stream: Option<Arc<AsyncIoStream>>,
    callback: Option<Arc<dyn HttpCallback>>,
    document_done: bool,
    post_body: Option<PostBody>,
}

/// One HTTP client conversation.
pub struct HttpStream {
    inner: Mutex<HttpInner>,
    self_ref: Weak<HttpStream>,
}

impl HttpStream {
    pub fn new() -> Arc<HttpStream> {
        Arc::new_cyclic(|weak| HttpStream {
            inner: Mutex::new(HttpInner {
                url: None,
                method: HttpMethod::Get,
                status_code: 0,
                major: 1,
                minor: 1,
                headers: HeaderBlock::new(),
                state: EngineState::Idle,
                keep_alive: false,
                connected: false,
                read_last_chunk_header: false,
                writing_document: false,
                content_length: None,
                current_chunk: 0,
                next_chunk_pos: 0,
                header_end: 0,
                bytes_processed: 0,
                endline: [0; 4],
                endline_count: 0,
                redirects: 0,
                stream: None,
                callback: None,
                document_done: false,
                post_body: None,
            }),
            self_ref: weak.clone(),
        })
    }

    fn me(&self) -> Option<Arc<HttpStream>> {
        self.self_ref.upgrade()
    }

    /// Fetch the document at `url` with GET. The callback's
    /// `on_read_http_document` fires exactly once when the document
    /// completes or fails.
    pub fn read_http_document(
        &self,
        url: &ParsedUrl,
        callback: Arc<dyn HttpCallback>,
    ) -> Result<()> {
        self.start_request(HttpMethod::Get, url, callback, None)
    }

    /// POST `content_length` bytes from `body` to `url`.
    pub fn send_http_post(
        &self,
        url: &ParsedUrl,
        body: Arc<AsyncIoStream>,
        media: MediaType,
        content_length: u64,
        callback: Arc<dyn HttpCallback>,
    ) -> Result<()> {
        self.start_request(
            HttpMethod::Post,
            url,
            callback,
            Some(PostBody {
                stream: body,
                media,
                content_length,
            }),
        )
    }

    fn start_request(
        &self,
        method: HttpMethod,
        url: &ParsedUrl,
        callback: Arc<dyn HttpCallback>,
        post_body: Option<PostBody>,
    ) -> Result<()> {
        if url.scheme == UrlScheme::Https {
            return Err(IoError::HttpsRequired);
        }
        if url.scheme != UrlScheme::Http {
            return Err(IoError::InvalidUrl(format!("not an http url: {}", url)));
        }

        let reuse = {
            let mut inner = self.inner.lock();
            match inner.state {
                EngineState::Idle | EngineState::Done => {}
                _ => return Err(IoError::Fail),
            }

            let reusable = inner.connected
                && inner.stream.is_some()
                && inner
                    .url
                    .as_ref()
                    .map(|prev| prev.host == url.host && prev.port == url.port)
                    .unwrap_or(false);

            inner.url = Some(url.clone());
            inner.method = method;
            inner.callback = Some(callback);
            inner.writing_document = post_body.is_some();
            inner.post_body = post_body;
            inner.status_code = 0;
            inner.major = 1;
            inner.minor = 1;
            inner.headers.clear();
            inner.keep_alive = false;
            inner.read_last_chunk_header = false;
            inner.content_length = None;
            inner.current_chunk = 0;
            inner.next_chunk_pos = 0;
            inner.header_end = 0;
            inner.bytes_processed = 0;
            inner.endline_count = 0;
            inner.redirects = 0;
            inner.document_done = false;

            if reusable {
                inner.state = EngineState::WritingRequest;
                inner.stream.clone()
            } else {
                if let Some(stale) = inner.stream.take() {
                    stale.close();
                }
                inner.connected = false;
                None
            }
        };

        match reuse {
            Some(stream) => {
                trace!(url = %url, "reusing connection");
                self.send_request(stream);
                Ok(())
            }
            None => self.open_connection(url),
        }
    }

    fn open_connection(&self, url: &ParsedUrl) -> Result<()> {
        let settings = runtime::settings()?;
        let connect_url = match (&settings.proxy_host, settings.use_proxy) {
            (Some(proxy), true) => {
                ParsedUrl::parse(&format!("http://{}:{}/", proxy, settings.proxy_port))?
            }
            _ => url.clone(),
        };

        debug!(url = %url, via = %connect_url.host, "connecting");
        let system = runtime::net_io_system()?;
        let events: Arc<dyn StreamEvents> = self.me().ok_or(IoError::Fail)?;

        // The connect completion races this call; the state must be
        // set before the worker can deliver on_open.
        self.inner.lock().state = EngineState::Connecting;
        let stream = AsyncIoStream::open(&system, &connect_url, OpenOptions::read_write(), events)?;

        let mut inner = self.inner.lock();
        if inner.stream.is_none() {
            inner.stream = Some(stream);
        }
        Ok(())
    }

    /// Emit the request line, headers and optional body, then flush.
    /// The flush completion moves the machine to header reading.
    fn send_request(&self, stream: Arc<AsyncIoStream>) {
        if let Err(err) = self.write_request_to_stream(&stream) {
            self.finish(Err(err));
        }
    }

    fn write_request_to_stream(&self, stream: &Arc<AsyncIoStream>) -> Result<()> {
        let settings = runtime::settings()?;
        stream.reset();

        let (method, url, post) = {
            let mut inner = self.inner.lock();
            inner.state = EngineState::WritingRequest;
            let url = inner.url.clone().ok_or(IoError::Fail)?;
            // Cloned, not taken: a redirect re-sends the same body.
            let post = inner.post_body.clone();
            (inner.method, url, post)
        };

        stream.printf(format_args!("{} ", method.as_str()))?;

        // Through a proxy the request line carries the absolute URL.
        if settings.use_proxy && !url.host.is_empty() {
            stream.printf(format_args!("http://{}", url.host))?;
            if !url.is_default_port() {
                stream.printf(format_args!(":{}", url.port))?;
            }
        }
        if url.path.is_empty() && method == HttpMethod::Options {
            stream.put_byte(b'*')?;
        } else {
            stream.write(url.path_and_query().as_bytes())?;
        }
        stream.printf(format_args!(" HTTP/1.1\r\n"))?;

        stream.printf(format_args!("Host: {}", url.host))?;
        if !url.is_default_port() {
            stream.printf(format_args!(":{}", url.port))?;
        }
        stream.write(b"\r\n")?;
        stream.printf(format_args!(
            "User-Agent: {}\r\n",
            settings.client_software_name
        ))?;
        stream.write(b"Accept: */*\r\n")?;
        stream.write(b"Accept-Language: en\r\n")?;

        if let Some(post) = &post {
            stream.printf(format_args!(
                "Content-Type: {}\r\n",
                post.media.to_header_value()
            ))?;
            stream.printf(format_args!("Content-Length: {}\r\n", post.content_length))?;
        }
        stream.write(b"\r\n")?;

        if let Some(post) = post {
            post.stream.set_position(0)?;
            let moved = post.stream.copy_stream(stream, post.content_length, false)?;
            if moved != post.content_length {
                return Err(IoError::InvalidArg("post body shorter than declared".to_string()));
            }
        }

        stream.flush()
    }

    /// Exactly-once document completion.
    fn finish(&self, result: Result<()>) {
        let (callback, writing, device_to_close) = {
            let mut inner = self.inner.lock();
            if inner.document_done {
                return;
            }
            inner.document_done = true;
            inner.state = EngineState::Done;

            let keep = result.is_ok() && inner.keep_alive;
            let to_close = if keep {
                None
            } else {
                inner.connected = false;
                inner.stream.clone()
            };
            (inner.callback.take(), inner.writing_document, to_close)
        };

        if let Err(err) = &result {
            debug!(%err, "http document failed");
        }
        // The connection goes away, but the parsed document stays
        // readable from the stream cache.
        if let Some(stream) = device_to_close {
            stream.close_device();
        }

        if let Some(callback) = callback {
            let Some(me) = self.me() else { return };
            if writing {
                callback.on_write_http_document(result, me);
            } else {
                callback.on_read_http_document(result, me);
            }
        }
    }

    // ------------------------------------------------------------------
    // Response state machine
    // ------------------------------------------------------------------

    fn drive(&self, result: Result<()>, stream: &Arc<AsyncIoStream>) {
        let hit_eof = matches!(result, Err(IoError::Eof));
        loop {
            let state = self.inner.lock().state;
            match state {
                EngineState::ReadingHeader => match self.receive_header_data(stream) {
                    Ok(HeaderProgress::NeedMore) => {
                        // The peer hung up mid-header.
                        if hit_eof {
                            self.finish(Err(IoError::NoResponse));
                            return;
                        }
                        if let Err(err) = stream.listen_for_more_bytes() {
                            self.finish(Err(err));
                        }
                        return;
                    }
                    Ok(HeaderProgress::Complete) => match self.after_header(stream) {
                        // Redirect or method quirk may have ended the
                        // exchange or restarted it.
                        Ok(true) => continue,
                        Ok(false) => return,
                        Err(err) => {
                            self.finish(Err(err));
                            return;
                        }
                    },
                    Err(err) => {
                        self.finish(Err(err));
                        return;
                    }
                },

                EngineState::ReadingBody => {
                    match self.read_body_data(&result, stream) {
                        Ok(ReadAction::FinishedDocument) => {
                            self.finish(Ok(()));
                            return;
                        }
                        Ok(ReadAction::GetMoreData) => {
                            if let Err(err) = stream.listen_for_more_bytes() {
                                self.finish(Err(err));
                            }
                            return;
                        }
                        Err(err) => {
                            self.finish(Err(err));
                            return;
                        }
                    }
                }

                EngineState::ReadingChunk => match self.read_chunks(&result, stream) {
                    Ok(ReadAction::FinishedDocument) => {
                        self.finish(Ok(()));
                        return;
                    }
                    Ok(ReadAction::GetMoreData) => {
                        if let Err(err) = stream.listen_for_more_bytes() {
                            self.finish(Err(err));
                        }
                        return;
                    }
                    Err(err) => {
                        self.finish(Err(err));
                        return;
                    }
                },

                // Stale event after completion or before sending.
                _ => return,
            }
        }
    }

    /// Scan newly arrived bytes for the header terminator; parse the
    /// header once it is complete.
    fn receive_header_data(&self, stream: &Arc<AsyncIoStream>) -> Result<HeaderProgress> {
        let mut inner = self.inner.lock();
        let total = stream.get_data_length();

        while inner.bytes_processed < total {
            let pos = inner.bytes_processed;

            // The first bytes decide what this message is. A response
            // starts with "HTTP"; anything else from a server we sent
            // a request to is an HTTP/0.9 body.
            if pos == 0 {
                if total < 4 {
                    return Ok(HeaderProgress::NeedMore);
                }
                let mut prefix = [0u8; 4];
                stream.read_at(0, &mut prefix)?;
                if !prefix.eq_ignore_ascii_case(b"HTTP") {
                    debug!("response has no header; assuming http/0.9");
                    inner.status_code = STATUS_OK;
                    inner.major = 0;
                    inner.minor = 9;
                    inner.header_end = 0;
                    inner.keep_alive = false;
                    inner.content_length = None;
                    inner.state = EngineState::ReadingBody;
                    return Ok(HeaderProgress::Complete);
                }
            }

            let mut found_body_start = None;
            let scan_result = stream.with_slice(pos, usize::MAX, |bytes| {
                for (i, &b) in bytes.iter().enumerate() {
                    if chartype::is_byte(b, NEWLINE_CHAR) {
                        if inner.endline_count < 4 {
                            let idx = inner.endline_count;
                            inner.endline[idx] = b;
                            inner.endline_count += 1;
                        }
                        let e = &inner.endline;
                        let n = inner.endline_count;
                        let double = (n == 2 && e[0] == b'\n' && e[1] == b'\n')
                            || (n == 4
                                && e[0] == b'\n'
                                && e[1] == b'\r'
                                && e[2] == b'\n'
                                && e[3] == b'\r')
                            || (n == 4
                                && e[0] == b'\r'
                                && e[1] == b'\n'
                                && e[2] == b'\r'
                                && e[3] == b'\n');
                        if double {
                            found_body_start = Some(pos + i as u64 + 1);
                            return i + 1;
                        }
                    } else {
                        inner.endline_count = 0;
                    }
                }
                bytes.len()
            });
            let scanned = match scan_result {
                Ok(n) => n,
                // A gap at the scan position just means the bytes have
                // not arrived yet.
                Err(IoError::Eof) => return Ok(HeaderProgress::NeedMore),
                Err(err) => return Err(err),
            };
            inner.bytes_processed = pos + scanned as u64;

            if let Some(body_start) = found_body_start {
                inner.header_end = body_start;
                drop(inner);
                self.parse_response_header(stream)?;
                return Ok(HeaderProgress::Complete);
            }
        }

        Ok(HeaderProgress::NeedMore)
    }

    /// Parse the status line and header lines into span headers.
    fn parse_response_header(&self, stream: &Arc<AsyncIoStream>) -> Result<()> {
        let mut inner = self.inner.lock();
        let head_len = inner.header_end as usize;
        let mut head = vec![0u8; head_len];
        let got = stream.read_at(0, &mut head)?;
        if got < head_len {
            return Err(IoError::InvalidHttpHeader("header not fully buffered".to_string()));
        }

        let mut i = 0usize;

        // Status line: HTTP[/maj.min] SP code SP reason
        i += 4; // the "HTTP" prefix was classified already
        if i < head.len() && head[i] == b'/' {
            i += 1;
            let major_len = chartype::span_while(&head[i..], chartype::DIGIT_CHAR);
            inner.major = parse_digits(&head[i..i + major_len])? as u8;
            i += major_len;
            if i < head.len() && head[i] == b'.' {
                i += 1;
                let minor_len = chartype::span_while(&head[i..], chartype::DIGIT_CHAR);
                inner.minor = parse_digits(&head[i..i + minor_len])? as u8;
                i += minor_len;
            }
        }
        i += chartype::span_while(&head[i..], WHITESPACE_CHAR);
        let code_len = chartype::span_while(&head[i..], chartype::DIGIT_CHAR);
        if code_len == 0 {
            return Err(IoError::InvalidHttpHeader("missing status code".to_string()));
        }
        inner.status_code = parse_digits(&head[i..i + code_len])? as u16;
        i += code_len;
        // Reason phrase is ignored.
        i += chartype::span_until(&head[i..], NEWLINE_CHAR);
        i += eat_line_ending(&head[i..]);

        // Header lines until the blank terminator.
        while i < head.len() {
            if chartype::is_byte(head[i], NEWLINE_CHAR) {
                break;
            }

            if chartype::is_byte(head[i], WHITESPACE_CHAR) {
                // Continuation line extends the previous value's span.
                let line_len = chartype::span_until(&head[i..], NEWLINE_CHAR);
                let end = rtrim_end(&head, i + line_len);
                inner.headers.extend_last_span(end as u64);
                i += line_len;
                i += eat_line_ending(&head[i..]);
                continue;
            }

            let name_len = head[i..]
                .iter()
                .position(|&b| b == b':' || chartype::is_byte(b, NEWLINE_CHAR))
                .unwrap_or(head.len() - i);
            if i + name_len >= head.len() || head[i + name_len] != b':' {
                return Err(IoError::InvalidHttpHeader("header line without colon".to_string()));
            }
            let name = String::from_utf8_lossy(&head[i..i + name_len]).trim().to_string();
            i += name_len + 1;

            i += chartype::span_while(&head[i..], WHITESPACE_CHAR);
            let value_start = i;
            let value_len = chartype::span_until(&head[i..], NEWLINE_CHAR);
            let value_end = rtrim_end(&head, value_start + value_len);
            inner
                .headers
                .add_span(&name, value_start as u64, value_end.saturating_sub(value_start));
            i = value_start + value_len;
            i += eat_line_ending(&head[i..]);
        }

        trace!(
            status = inner.status_code,
            headers = inner.headers.len(),
            "parsed response header"
        );
        Ok(())
    }

    /// Act on the parsed header. Returns true when the caller should
    /// keep driving the state machine.
    fn after_header(&self, stream: &Arc<AsyncIoStream>) -> Result<bool> {
        let redirect;
        {
            let mut inner = self.inner.lock();

            if let Some(connection) = inner.headers.get_string("Connection", Some(stream.as_ref()))? {
                if connection.eq_ignore_ascii_case("keep-alive") {
                    inner.keep_alive = true;
                } else if connection.eq_ignore_ascii_case("close") {
                    inner.keep_alive = false;
                }
            }

            redirect = is_followed_redirect(inner.status_code);
            if !redirect {
                let length = inner.headers.get_integer("Content-Length", Some(stream.as_ref()))?;
                if let Some(length) = length {
                    if length < 0 {
                        return Err(IoError::InvalidHttpHeader(
                            "negative content length".to_string(),
                        ));
                    }
                    inner.content_length = Some(length as u64);
                }

                let chunked = inner
                    .headers
                    .get_string("Transfer-Encoding", Some(stream.as_ref()))?
                    .map(|enc| enc.to_ascii_lowercase().contains("chunked"))
                    .unwrap_or(false);

                if chunked {
                    inner.state = EngineState::ReadingChunk;
                    inner.next_chunk_pos = inner.header_end;
                    inner.current_chunk = 0;
                    inner.read_last_chunk_header = false;
                } else {
                    inner.state = EngineState::ReadingBody;
                }

                let keep_alive = inner.keep_alive;
                let head_only = inner.method == HttpMethod::Head;
                drop(inner);
                stream.set_eof_is_disconnect(keep_alive);

                if head_only {
                    self.finish(Ok(()));
                    return Ok(false);
                }
                return Ok(true);
            }
        }

        self.follow_redirection(stream)?;
        Ok(false)
    }

    fn read_body_data(
        &self,
        result: &Result<()>,
        stream: &Arc<AsyncIoStream>,
    ) -> Result<ReadAction> {
        let inner = self.inner.lock();
        let max_doc = runtime::settings()?.max_http_doc_size as u64;
        let total = stream.get_data_length();
        let body_len = total.saturating_sub(inner.header_end);
        if body_len > max_doc {
            return Err(IoError::HttpDocTooLarge);
        }

        match inner.content_length {
            Some(length) => {
                if total >= inner.header_end + length {
                    Ok(ReadAction::FinishedDocument)
                } else if matches!(result, Err(IoError::Eof)) {
                    // The peer hung up short of the declared length.
                    Err(IoError::PeerDisconnected)
                } else {
                    Ok(ReadAction::GetMoreData)
                }
            }
            None => {
                if matches!(result, Err(IoError::Eof)) {
                    Ok(ReadAction::FinishedDocument)
                } else {
                    Ok(ReadAction::GetMoreData)
                }
            }
        }
    }

    /// Decode chunked framing in place: each chunk header (and the
    /// trailing CRLF of the previous chunk) is spliced out of the
    /// stream so the body reads contiguously.
    fn read_chunks(&self, result: &Result<()>, stream: &Arc<AsyncIoStream>) -> Result<ReadAction> {
        let mut inner = self.inner.lock();
        let max_doc = runtime::settings()?.max_http_doc_size as u64;

        if matches!(result, Err(IoError::Eof)) {
            // The peer is done sending; whatever arrived is the
            // document.
            return Ok(ReadAction::FinishedDocument);
        }

        loop {
            if inner.next_chunk_pos.saturating_sub(inner.header_end) > max_doc {
                return Err(IoError::HttpDocTooLarge);
            }
            if stream.set_position(inner.next_chunk_pos) == Err(IoError::Eof) {
                return Ok(ReadAction::GetMoreData);
            }

            let mut scratch = [0u8; MAX_CHUNK_HEADER_SIZE];
            let avail = (stream.get_data_length() - inner.next_chunk_pos)
                .min(MAX_CHUNK_HEADER_SIZE as u64) as usize;
            if avail == 0 {
                return Ok(ReadAction::GetMoreData);
            }
            let n = match stream.read_at(inner.next_chunk_pos, &mut scratch[..avail]) {
                Ok(n) => n,
                Err(IoError::Eof) => return Ok(ReadAction::GetMoreData),
                Err(err) => return Err(err),
            };
            let bytes = &scratch[..n];

            // After the zero-size chunk only the trailer's terminal
            // blank line matters.
            if inner.read_last_chunk_header {
                for i in 0..n.saturating_sub(1) {
                    if chartype::is_byte(bytes[i], NEWLINE_CHAR)
                        && chartype::is_byte(bytes[i + 1], NEWLINE_CHAR)
                    {
                        let trailer = (i + 2) as u64;
                        stream.remove_n_bytes(inner.next_chunk_pos, trailer)?;
                        return Ok(ReadAction::FinishedDocument);
                    }
                }
                return Ok(ReadAction::GetMoreData);
            }

            let hex_len = chartype::span_while(bytes, HEX_CHAR);
            if hex_len == 0 {
                return Err(IoError::InvalidHttpHeader("chunk size is not hex".to_string()));
            }
            let hex_text = std::str::from_utf8(&bytes[..hex_len])
                .map_err(|_| IoError::InvalidHttpHeader("chunk size is not hex".to_string()))?;
            let chunk_size = u64::from_str_radix(hex_text, 16)
                .map_err(|_| IoError::InvalidHttpHeader("chunk size overflow".to_string()))?;

            // Skip the transfer extension; the header ends at CRLF.
            let mut j = hex_len;
            j += chartype::span_until(&bytes[j..], NEWLINE_CHAR);
            let mut found_entire_header = false;
            if j + 2 <= n {
                found_entire_header = true;
                if chartype::is_byte(bytes[j], NEWLINE_CHAR) {
                    j += 1;
                }
                if j < n && chartype::is_byte(bytes[j], NEWLINE_CHAR) {
                    j += 1;
                }
            }

            if !found_entire_header {
                if n >= MAX_CHUNK_HEADER_SIZE {
                    return Err(IoError::InvalidHttpHeader("chunk header too long".to_string()));
                }
                return Ok(ReadAction::GetMoreData);
            }

            let header_len = j as u64;
            // From the second chunk on, the previous chunk's trailing
            // CRLF goes too, so the payload stays seamless.
            let strip_previous: u64 = if inner.current_chunk > 0 { 2 } else { 0 };
            stream.remove_n_bytes(
                inner.next_chunk_pos - strip_previous,
                header_len + strip_previous,
            )?;

            trace!(chunk = inner.current_chunk, size = chunk_size, "decoded chunk header");
            inner.current_chunk += 1;
            inner.next_chunk_pos += chunk_size;
            if chunk_size > 0 {
                inner.next_chunk_pos += 2;
            }
            inner.next_chunk_pos -= strip_previous;

            if chunk_size == 0 {
                inner.read_last_chunk_header = true;
            }
        }
    }

    fn follow_redirection(&self, stream: &Arc<AsyncIoStream>) -> Result<()> {
        let new_url = {
            let mut inner = self.inner.lock();
            let location = inner
                .headers
                .get_string("Location", Some(stream.as_ref()))?
                .ok_or(IoError::NoResponse)?;
            let current = inner.url.clone().ok_or(IoError::Fail)?;
            let new_url = current.resolve(&location)?;

            if new_url.host.is_empty() {
                return Err(IoError::NoResponse);
            }
            // Cyclic or runaway redirects end the request.
            if new_url.same_document(&current) || inner.redirects >= MAX_REASONABLE_REDIRECTS {
                return Err(IoError::NoResponse);
            }
            inner.redirects += 1;
            debug!(from = %current, to = %new_url, hop = inner.redirects, "following redirect");

            inner.url = Some(new_url.clone());
            inner.headers.clear();
            inner.status_code = 0;
            inner.keep_alive = false;
            inner.content_length = None;
            inner.read_last_chunk_header = false;
            inner.current_chunk = 0;
            inner.next_chunk_pos = 0;
            inner.header_end = 0;
            inner.bytes_processed = 0;
            inner.endline_count = 0;
            inner.connected = false;

            if let Some(old) = inner.stream.take() {
                old.close();
            }
            new_url
        };

        self.open_connection(&new_url)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn url(&self) -> Option<ParsedUrl> {
        self.inner.lock().url.clone()
    }

    pub fn status_code(&self) -> u16 {
        self.inner.lock().status_code
    }

    pub fn http_version(&self) -> (u8, u8) {
        let inner = self.inner.lock();
        (inner.major, inner.minor)
    }

    pub fn redirect_count(&self) -> u32 {
        self.inner.lock().redirects
    }

    pub fn is_keep_alive(&self) -> bool {
        self.inner.lock().keep_alive
    }

    /// Resolve a response header to text.
    pub fn header_value(&self, name: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        let stream = inner.stream.clone();
        inner.headers.get_string(name, stream.as_deref())
    }

    /// The parsed Content-Type, if the response carried one.
    pub fn content_type(&self) -> Result<Option<MediaType>> {
        Ok(self.header_value("Content-Type")?.map(|v| parse_content_type(&v)))
    }

    /// First stream position of the (decoded) body.
    pub fn body_start(&self) -> u64 {
        self.inner.lock().header_end
    }

    /// The response stream, positioned at the body start. Chunk
    /// framing has already been spliced out.
    pub fn get_io_stream(&self) -> Result<Arc<AsyncIoStream>> {
        let inner = self.inner.lock();
        let stream = inner.stream.clone().ok_or(IoError::Fail)?;
        stream.set_position(inner.header_end)?;
        Ok(stream)
    }

    /// Read the whole decoded body out of the cache.
    pub fn read_body(&self) -> Result<Vec<u8>> {
        let stream = self.get_io_stream()?;
        let total = stream.get_data_length();
        let start = self.body_start();
        let mut body = vec![0u8; (total - start) as usize];
        if !body.is_empty() {
            let n = stream.read_at(start, &mut body)?;
            body.truncate(n);
        }
        Ok(body)
    }

    /// Drop the conversation and its connection.
    pub fn close(&self) {
        let stream = {
            let mut inner = self.inner.lock();
            inner.connected = false;
            inner.callback = None;
            inner.state = EngineState::Idle;
            inner.stream.take()
        };
        if let Some(stream) = stream {
            stream.close();
        }
    }
}

impl StreamEvents for HttpStream {
    fn on_ready_to_read(&self, result: Result<()>, _total: u64, stream: Arc<AsyncIoStream>) {
        let Some(me) = self.me() else { return };
        match result {
            Ok(()) | Err(IoError::Eof) => me.drive(result, &stream),
            Err(err) => me.finish(Err(err)),
        }
    }

    fn on_flush(&self, result: Result<()>, stream: Arc<AsyncIoStream>) {
        let Some(me) = self.me() else { return };
        if let Err(err) = result {
            me.finish(Err(err));
            return;
        }

        {
            let mut inner = me.inner.lock();
            if inner.state != EngineState::WritingRequest {
                return;
            }
            inner.state = EngineState::ReadingHeader;
            inner.bytes_processed = 0;
            inner.endline_count = 0;
        }
        // The request bytes are on the wire; reuse the position space
        // for the response.
        stream.reset();
        if let Err(err) = stream.listen_for_more_bytes() {
            me.finish(Err(err));
        }
    }

    fn on_open(&self, result: Result<()>, stream: Arc<AsyncIoStream>) {
        let Some(me) = self.me() else { return };
        match result {
            Ok(()) => {
                me.inner.lock().connected = true;
                me.send_request(stream);
            }
            Err(err) => me.finish(Err(err)),
        }
    }

    fn on_stream_disconnect(&self, _result: Result<()>, _stream: Arc<AsyncIoStream>) {
        let Some(me) = self.me() else { return };
        warn!("peer disconnected mid-document");
        me.finish(Err(IoError::PeerDisconnected));
    }
}

fn parse_digits(bytes: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| IoError::InvalidHttpHeader("bad number".to_string()))?;
    text.parse()
        .map_err(|_| IoError::InvalidHttpHeader(format!("bad number '{}'", text)))
}

/// Consume one line terminator: CRLF, LFCR, LF or CR.
fn eat_line_ending(bytes: &[u8]) -> usize {
    match bytes {
        [b'\r', b'\n', ..] => 2,
        [b'\n', b'\r', ..] => 2,
        [b'\r', ..] | [b'\n', ..] => 1,
        _ => 0,
    }
}

/// Index just past the last non-whitespace byte before `end`.
fn rtrim_end(bytes: &[u8], mut end: usize) -> usize {
    while end > 0
        && (chartype::is_byte(bytes[end - 1], WHITESPACE_CHAR)
            || chartype::is_byte(bytes[end - 1], NEWLINE_CHAR))
    {
        end -= 1;
    }
    end
}
