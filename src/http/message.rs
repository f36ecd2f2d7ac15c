// # HTTP Message Vocabulary
//
// Methods, status-code classes, and header-line storage. Header values
// parsed off the wire are kept as (position, length) spans into the
// receiving stream's cache; values added locally are owned strings.

use super::names::{global_names, NameId};
use crate::error::{IoError, Result};
use crate::stream::AsyncIoStream;

/// Request methods the engine recognizes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Link,
    Options,
    Trace,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Link => "LINK",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
        }
    }

    pub const ALL: [HttpMethod; 8] = [
        HttpMethod::Get,
        HttpMethod::Head,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Delete,
        HttpMethod::Link,
        HttpMethod::Options,
        HttpMethod::Trace,
    ];

    /// Match a method token at the start of `bytes`.
    pub fn parse_token(bytes: &[u8]) -> Option<HttpMethod> {
        Self::ALL.into_iter().find(|m| {
            let token = m.as_str().as_bytes();
            bytes.len() > token.len()
                && bytes[..token.len()].eq_ignore_ascii_case(token)
                && bytes[token.len()] == b' '
        })
    }
}

pub const STATUS_CONTINUE: u16 = 100;
pub const STATUS_OK: u16 = 200;
pub const STATUS_MOVED_PERMANENTLY: u16 = 301;
pub const STATUS_MOVED_TEMPORARILY: u16 = 302;
pub const STATUS_SEE_OTHER: u16 = 303;
pub const STATUS_NOT_MODIFIED: u16 = 304;
pub const STATUS_USE_PROXY: u16 = 305;
pub const STATUS_SWITCH_PROXY: u16 = 306;

pub fn is_informational_status(code: u16) -> bool {
    (100..=199).contains(&code)
}

pub fn is_success_status(code: u16) -> bool {
    (200..=299).contains(&code)
}

pub fn is_redirect_status(code: u16) -> bool {
    (300..=399).contains(&code)
}

/// The redirect codes the engine actually follows.
pub fn is_followed_redirect(code: u16) -> bool {
    matches!(
        code,
        STATUS_MOVED_PERMANENTLY | STATUS_MOVED_TEMPORARILY | STATUS_USE_PROXY | STATUS_SWITCH_PROXY
    )
}

/// A header value: either owned text, or a span into the stream the
/// header arrived on.
#[derive(Debug, Clone)]
pub enum HeaderValue {
    Owned(String),
    Span { pos: u64, len: usize },
}

/// One header line.
#[derive(Debug, Clone)]
pub struct HeaderLine {
    pub name: NameId,
    pub value: HeaderValue,
}

/// An ordered header block. Names are interned through the global
/// dictionary; duplicate names are kept in arrival order.
#[derive(Debug, Default)]
pub struct HeaderBlock {
    lines: Vec<HeaderLine>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[HeaderLine] {
        &self.lines
    }

    pub fn add_string(&mut self, name: &str, value: impl Into<String>) {
        self.lines.push(HeaderLine {
            name: global_names().intern(name),
            value: HeaderValue::Owned(value.into()),
        });
    }

    pub fn add_integer(&mut self, name: &str, value: i64) {
        self.add_string(name, value.to_string());
    }

    pub fn add_span(&mut self, name: &str, pos: u64, len: usize) {
        self.lines.push(HeaderLine {
            name: global_names().intern(name),
            value: HeaderValue::Span { pos, len },
        });
    }

    /// Extend the last header's span (a continuation line).
    pub fn extend_last_span(&mut self, new_end: u64) {
        if let Some(line) = self.lines.last_mut() {
            if let HeaderValue::Span { pos, len } = &mut line.value {
                if new_end > *pos {
                    *len = (new_end - *pos) as usize;
                }
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&HeaderLine> {
        let id = global_names().find(name)?;
        self.lines.iter().find(|line| line.name == id)
    }

    /// Resolve a header's text, reading span values out of `stream`.
    pub fn get_string(&self, name: &str, stream: Option<&AsyncIoStream>) -> Result<Option<String>> {
        let Some(line) = self.find(name) else {
            return Ok(None);
        };
        match &line.value {
            HeaderValue::Owned(text) => Ok(Some(text.clone())),
            HeaderValue::Span { pos, len } => {
                let stream = stream.ok_or_else(|| {
                    IoError::InvalidArg("span header needs its stream".to_string())
                })?;
                let mut bytes = vec![0u8; *len];
                let n = stream.read_at(*pos, &mut bytes)?;
                bytes.truncate(n);
                let text = String::from_utf8_lossy(&bytes).trim().to_string();
                Ok(Some(text))
            }
        }
    }

    /// Resolve a header and parse it as an integer.
    pub fn get_integer(&self, name: &str, stream: Option<&AsyncIoStream>) -> Result<Option<i64>> {
        match self.get_string(name, stream)? {
            None => Ok(None),
            Some(text) => text
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| IoError::InvalidHttpHeader(format!("{} is not a number", name))),
        }
    }
}
