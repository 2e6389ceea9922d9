//! The closed set of error kinds the proxy can produce.
//!
//! Every kind is recovered at the [`crate::handler`] boundary: it terminates
//! the one connection that produced it and nothing else (see spec §7).

use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with the [`ProxyError`] type.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// A generic "error" for the proxy's protocol and I/O layers.
#[derive(Error, Diagnostic, Debug)]
pub enum ProxyError {
    /// The client or origin sent bytes that do not form a valid HTTP
    /// message (bad start-line, conflicting `Content-Length` headers, a
    /// header block over 64 KiB, a status code outside `[100, 599]`, ...).
    #[error("malformed message: {detail}")]
    #[diagnostic(code(proxy_cache::malformed))]
    Malformed {
        /// Human-readable detail, used verbatim in the `ERROR <reason>` log line.
        detail: String,
    },

    /// DNS resolution of the request target failed.
    #[error("could not resolve {host}: {detail}")]
    #[diagnostic(code(proxy_cache::resolve_fail))]
    ResolveFail {
        /// The host that failed to resolve.
        host: String,
        /// Underlying resolver detail.
        detail: String,
    },

    /// A TCP connect to the origin failed after DNS resolved.
    #[error("could not connect to {host}:{port}: {detail}")]
    #[diagnostic(code(proxy_cache::connect_fail))]
    ConnectFail {
        /// The host connected to.
        host: String,
        /// The port connected to.
        port: u16,
        /// Underlying connect detail.
        detail: String,
    },

    /// A read or write exceeded the idle budget.
    #[error("idle timeout")]
    #[diagnostic(code(proxy_cache::io_timeout))]
    IoTimeout,

    /// The peer closed the connection mid-message.
    #[error("peer closed connection unexpectedly")]
    #[diagnostic(code(proxy_cache::peer_closed))]
    PeerClosed,

    /// Catch-all for failures that don't fit the other kinds.
    #[error(transparent)]
    #[diagnostic(code(proxy_cache::internal))]
    Internal(#[from] anyhow::Error),
}

impl From<std::io::Error> for ProxyError {
    /// Classifies a raw I/O error into the closed error-kind set (spec §7).
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProxyError::IoTimeout,
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => ProxyError::PeerClosed,
            ErrorKind::ConnectionRefused => ProxyError::ConnectFail {
                host: String::new(),
                port: 0,
                detail: err.to_string(),
            },
            _ => ProxyError::Internal(anyhow::Error::new(err)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::IoTimeout
    }
}

impl ProxyError {
    /// Builds a [`ProxyError::Malformed`] from a `&str` or `String` detail.
    pub fn malformed(detail: impl Into<String>) -> Self {
        ProxyError::Malformed { detail: detail.into() }
    }

    /// The short reason string used in the `ERROR <reason>` log event.
    pub fn reason(&self) -> String {
        match self {
            ProxyError::Malformed { detail } => format!("MALFORMED {detail}"),
            ProxyError::ResolveFail { host, .. } => {
                format!("RESOLVE_FAIL {host}")
            }
            ProxyError::ConnectFail { host, port, .. } => {
                format!("CONNECT_FAIL {host}:{port}")
            }
            ProxyError::IoTimeout => "IO_TIMEOUT".to_string(),
            ProxyError::PeerClosed => "PEER_CLOSED".to_string(),
            ProxyError::Internal(e) => format!("INTERNAL {e}"),
        }
    }

    /// The status the client should see for this error, if headers haven't
    /// already gone out (spec §7, user-visible behavior table).
    pub fn client_status(&self) -> Option<u16> {
        match self {
            ProxyError::Malformed { .. } => Some(400),
            ProxyError::ResolveFail { .. } | ProxyError::ConnectFail { .. } => {
                Some(502)
            }
            ProxyError::IoTimeout
            | ProxyError::PeerClosed
            | ProxyError::Internal(_) => None,
        }
    }
}
