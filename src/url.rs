// # URL Parsing
//
// Addressable names for block I/O stores. A URL selects the medium via
// its scheme and carries the medium-specific address: a path for files,
// host and port for network endpoints, and a (base pointer, length) pair
// for in-process memory stores.

use crate::chartype::{self, URL_HOST_CHAR};
use crate::error::{IoError, Result};
use std::fmt;

/// Default port for http URLs.
pub const DEFAULT_PORT_HTTP: u16 = 80;

/// Default port for https URLs.
pub const DEFAULT_PORT_HTTPS: u16 = 443;

/// Recognized URL schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlScheme {
    Memory,
    File,
    Http,
    Https,
    Urn,
}

impl UrlScheme {
    fn as_str(&self) -> &'static str {
        match self {
            UrlScheme::Memory => "memory",
            UrlScheme::File => "file",
            UrlScheme::Http => "http",
            UrlScheme::Https => "https",
            UrlScheme::Urn => "urn",
        }
    }
}

/// A parsed URL.
///
/// Memory URLs have the form `memory:<hex-base>/<decimal-length>/`; a
/// zero base pointer names a store that does not exist yet.
#[derive(Debug, Clone)]
pub struct ParsedUrl {
    pub scheme: UrlScheme,
    pub host: String,
    pub port: u16,
    /// Absolute path, including the leading `/` (may be empty for urn
    /// and memory URLs).
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
    /// Memory scheme only: base address of an existing store, 0 if none.
    pub mem_base: usize,
    /// Memory scheme only: store length in bytes.
    pub mem_len: usize,
}

impl ParsedUrl {
    /// Parse an absolute URL.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(IoError::InvalidUrl("empty url".to_string()));
        }

        let (scheme, rest) = match text.split_once(':') {
            Some((s, rest)) => (s, rest),
            None => return Err(IoError::InvalidUrl(format!("no scheme in '{}'", text))),
        };

        match scheme.to_ascii_lowercase().as_str() {
            "memory" => Self::parse_memory(rest),
            "file" => Ok(Self::for_file(rest.strip_prefix("//").unwrap_or(rest))),
            "http" => Self::parse_authority(UrlScheme::Http, rest, DEFAULT_PORT_HTTP),
            "https" => Self::parse_authority(UrlScheme::Https, rest, DEFAULT_PORT_HTTPS),
            "urn" => Ok(Self {
                scheme: UrlScheme::Urn,
                host: String::new(),
                port: 0,
                path: rest.to_string(),
                query: None,
                fragment: None,
                mem_base: 0,
                mem_len: 0,
            }),
            other => Err(IoError::InvalidUrl(format!("unknown scheme '{}'", other))),
        }
    }

    /// Build a URL naming a new memory store of `len` bytes.
    pub fn for_new_memory_store(len: usize) -> Self {
        Self {
            scheme: UrlScheme::Memory,
            host: String::new(),
            port: 0,
            path: format!("0/{}/", len),
            query: None,
            fragment: None,
            mem_base: 0,
            mem_len: len,
        }
    }

    /// Build a URL for a local file path.
    pub fn for_file(path: &str) -> Self {
        Self {
            scheme: UrlScheme::File,
            host: String::new(),
            port: 0,
            path: path.to_string(),
            query: None,
            fragment: None,
            mem_base: 0,
            mem_len: 0,
        }
    }

    fn parse_memory(rest: &str) -> Result<Self> {
        // memory:<hex-base>/<decimal-length>/
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let mut parts = rest.split('/').filter(|s| !s.is_empty());
        let base_text = parts
            .next()
            .ok_or_else(|| IoError::InvalidUrl("memory url missing base".to_string()))?;
        let len_text = parts
            .next()
            .ok_or_else(|| IoError::InvalidUrl("memory url missing length".to_string()))?;

        let base_text = base_text
            .strip_prefix("0x")
            .or_else(|| base_text.strip_prefix("0X"))
            .unwrap_or(base_text);
        let mem_base = usize::from_str_radix(base_text, 16)
            .map_err(|_| IoError::InvalidUrl(format!("bad memory base '{}'", base_text)))?;
        let mem_len: usize = len_text
            .parse()
            .map_err(|_| IoError::InvalidUrl(format!("bad memory length '{}'", len_text)))?;

        Ok(Self {
            scheme: UrlScheme::Memory,
            host: String::new(),
            port: 0,
            path: format!("{:x}/{}/", mem_base, mem_len),
            query: None,
            fragment: None,
            mem_base,
            mem_len,
        })
    }

    fn parse_authority(scheme: UrlScheme, rest: &str, default_port: u16) -> Result<Self> {
        let rest = rest
            .strip_prefix("//")
            .ok_or_else(|| IoError::InvalidUrl(format!("{} url missing authority", scheme.as_str())))?;

        let host_len = chartype::span_while(rest.as_bytes(), URL_HOST_CHAR);
        let host = &rest[..host_len];
        if host.is_empty() {
            return Err(IoError::InvalidUrl("empty host".to_string()));
        }
        let mut remainder = &rest[host_len..];

        let mut port = default_port;
        if let Some(after_colon) = remainder.strip_prefix(':') {
            let digits = chartype::span_while(after_colon.as_bytes(), chartype::DIGIT_CHAR);
            if digits == 0 {
                return Err(IoError::InvalidUrl("empty port".to_string()));
            }
            port = after_colon[..digits]
                .parse()
                .map_err(|_| IoError::InvalidUrl("bad port".to_string()))?;
            remainder = &after_colon[digits..];
        }

        let (path_and_query, fragment) = match remainder.split_once('#') {
            Some((p, f)) => (p, Some(f.to_string())),
            None => (remainder, None),
        };
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };

        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            path,
            query,
            fragment,
            mem_base: 0,
            mem_len: 0,
        })
    }

    /// Resolve a possibly-relative reference (e.g. a Location header)
    /// against this URL.
    pub fn resolve(&self, reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(IoError::InvalidUrl("empty reference".to_string()));
        }

        // Absolute references stand alone.
        if reference.contains("://") || reference.starts_with("urn:") || reference.starts_with("memory:") {
            return Self::parse(reference);
        }

        let mut resolved = self.clone();
        resolved.fragment = None;

        let (path_and_query, fragment) = match reference.split_once('#') {
            Some((p, f)) => (p, Some(f.to_string())),
            None => (reference, None),
        };
        let (raw_path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (path_and_query, None),
        };

        if raw_path.starts_with('/') {
            resolved.path = raw_path.to_string();
        } else if raw_path.is_empty() {
            // Query-only reference keeps the base path.
        } else {
            // Splice onto the base directory.
            let dir_end = self.path.rfind('/').map(|i| i + 1).unwrap_or(0);
            resolved.path = format!("{}{}", &self.path[..dir_end], raw_path);
            if !resolved.path.starts_with('/') {
                resolved.path.insert(0, '/');
            }
        }

        resolved.query = query;
        resolved.fragment = fragment;
        Ok(resolved)
    }

    /// Compare scheme, authority, path and query. Hosts compare
    /// case-insensitively (they are stored lowercased).
    pub fn same_document(&self, other: &ParsedUrl) -> bool {
        self.scheme == other.scheme
            && self.host == other.host
            && self.port == other.port
            && self.effective_path() == other.effective_path()
            && self.query == other.query
    }

    /// The request path, with `/` standing in for an empty path.
    pub fn effective_path(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }

    /// Path plus query string, as sent on an HTTP request line.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.effective_path(), q),
            None => self.effective_path().to_string(),
        }
    }

    /// True if the port is the scheme's default.
    pub fn is_default_port(&self) -> bool {
        match self.scheme {
            UrlScheme::Http => self.port == DEFAULT_PORT_HTTP,
            UrlScheme::Https => self.port == DEFAULT_PORT_HTTPS,
            _ => true,
        }
    }
}

impl fmt::Display for ParsedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            UrlScheme::Memory => write!(f, "memory:{:x}/{}/", self.mem_base, self.mem_len),
            UrlScheme::File => write!(f, "file://{}", self.path),
            UrlScheme::Urn => write!(f, "urn:{}", self.path),
            UrlScheme::Http | UrlScheme::Https => {
                write!(f, "{}://{}", self.scheme.as_str(), self.host)?;
                if !self.is_default_port() {
                    write!(f, ":{}", self.port)?;
                }
                write!(f, "{}", self.effective_path())?;
                if let Some(q) = &self.query {
                    write!(f, "?{}", q)?;
                }
                if let Some(frag) = &self.fragment {
                    write!(f, "#{}", frag)?;
                }
                Ok(())
            }
        }
    }
}
