//! Error types shared by the fetcher and the rewriter.

use std::path::PathBuf;

use thiserror::Error;

/// Why a single resource could not be localized.
///
/// Stored in the downloaded set and handed back to every later caller for
/// the same URL, so it is `Clone` and keeps only rendered messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// `data:`, `javascript:`, `mailto:` or any non-http(s) URL.
    #[error("unfetchable URL: {url}")]
    Unfetchable { url: String },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// Connection reset/refused or a body stream cut short.
    #[error("connection interrupted fetching {url}: {message}")]
    Interrupted { url: String, message: String },

    /// DNS failure, TLS failure, malformed response and the like.
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("I/O error writing {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl FetchError {
    /// Classifies a transport error from `reqwest`.
    pub(crate) fn from_transport(url: &str, err: &reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            return Self::Timeout { url };
        }
        if is_interruption(err) || err.is_body() {
            return Self::Interrupted {
                url,
                message: err.to_string(),
            };
        }
        Self::Network {
            url,
            message: err.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Walks the source chain for an I/O error that signals a dropped
/// connection rather than an unreachable host.
fn is_interruption(err: &reqwest::Error) -> bool {
    use std::error::Error as _;
    use std::io::ErrorKind;

    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::TimedOut
            );
        }
        source = inner.source();
    }
    false
}

/// Failure to rewrite a document; the page is skipped rather than saved.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("markup could not be rewritten: {0}")]
    Markup(#[from] lol_html::errors::RewritingError),

    #[error("document URL {0} cannot serve as a base for references")]
    InvalidBase(String),
}
