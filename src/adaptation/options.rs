//! Capability record for one adaptation service.
//!
//! Built by an external OPTIONS decoder; owned and replaced wholesale by
//! the service on every successful fetch. Freshness is judged against the
//! loop's monotonic timeline, onto which the decoder has already mapped
//! the response timestamp.

use std::time::Duration;

/// Which message side a service adapts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    None,
    Reqmod,
    Respmod,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::None => "NONE",
            Method::Reqmod => "REQMOD",
            Method::Respmod => "RESPMOD",
        }
    }
}

/// Adaptation disposition for one URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Do not send this URL to the service at all.
    Ignore,
    /// Send a preview first; the service commits or bypasses.
    Preview,
    /// Send the complete message.
    Complete,
}

/// Decoded OPTIONS response.
///
/// `error` carries the decode problem when the wire format did not parse;
/// such a record is kept (for `status()` and logging) but never usable.
#[derive(Debug, Clone)]
pub struct Options {
    /// Methods the service declared, possibly empty.
    pub methods: Vec<Method>,
    /// Loop-time at which the response was generated (per its date header).
    pub timestamp: Duration,
    /// Declared freshness lifetime; None falls back to the default.
    pub ttl: Option<Duration>,
    /// Bytes the service wants to preview before committing, if any.
    pub preview: Option<usize>,
    /// Whether the service may answer "no modification needed".
    pub allow_204: bool,
    /// Filename extensions the service wants previewed.
    pub transfer_preview: Vec<String>,
    /// Extensions the service never wants to see.
    pub transfer_ignore: Vec<String>,
    /// Extensions the service wants complete.
    pub transfer_complete: Vec<String>,
    /// Disposition for extensions not on any list.
    pub default_transfer: Transfer,
    pub error: Option<String>,
}

impl Options {
    /// Applied when the response declares no TTL.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    /// A minimal valid record stamped at `timestamp`; decoders fill in the
    /// declared fields.
    pub fn new(timestamp: Duration) -> Self {
        Options {
            methods: Vec::new(),
            timestamp,
            ttl: None,
            preview: None,
            allow_204: true,
            transfer_preview: Vec::new(),
            transfer_ignore: Vec::new(),
            transfer_complete: Vec::new(),
            default_transfer: Transfer::Complete,
            error: None,
        }
    }

    /// Whether the wire format parsed successfully.
    pub fn valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl.unwrap_or(Self::DEFAULT_TTL)
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn expire(&self) -> Duration {
        self.timestamp + self.ttl()
    }

    /// Current until `expire()` has passed.
    pub fn fresh(&self, now: Duration) -> bool {
        now <= self.expire()
    }

    /// Absolute distance between the response timestamp and "now"; a skew
    /// beyond the TTL is worth a warning but not invalidation.
    pub fn clock_skew(&self, now: Duration) -> Duration {
        if self.timestamp > now {
            self.timestamp - now
        } else {
            now - self.timestamp
        }
    }

    /// Disposition for a URL path, decided by its filename extension.
    pub fn transfer_kind(&self, url_path: &str) -> Transfer {
        let ext = extension_of(url_path);
        if let Some(ext) = ext {
            if list_has(&self.transfer_ignore, ext) {
                return Transfer::Ignore;
            }
            if list_has(&self.transfer_preview, ext) {
                return Transfer::Preview;
            }
            if list_has(&self.transfer_complete, ext) {
                return Transfer::Complete;
            }
        }
        self.default_transfer
    }
}

fn list_has(list: &[String], ext: &str) -> bool {
    list.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

/// Extension of the last path segment, ignoring any query string.
fn extension_of(url_path: &str) -> Option<&str> {
    let path = url_path.split(['?', '#']).next().unwrap_or(url_path);
    let segment = path.rsplit('/').next().unwrap_or(path);
    let dot = segment.rfind('.')?;
    let ext = &segment[dot + 1..];
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}
