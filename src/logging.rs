//! The closed log-event vocabulary (spec §6) and the `Logger` seam that
//! emits it, grounded in the same trait-plus-production-impl shape as
//! [`crate::runtime::Listener`].

use crate::error::ProxyError;

/// One of the fixed set of events the proxy logs per connection, each
/// rendered as `"<id>: <event> [<detail>]"` (spec §6).
#[derive(Debug, Clone)]
pub enum Event<'a> {
    /// A new connection was accepted and its first request parsed.
    NewRequest { method: &'a str, target: &'a str },
    /// No cache entry exists for this key.
    NotInCache,
    /// A cache entry exists and is fresh.
    InCacheValid,
    /// A cache entry exists but needs revalidation.
    InCacheRequiresValidation,
    /// A conditional request is being sent to the origin.
    Revalidating,
    /// The origin replied `304 Not Modified`.
    NotModified,
    /// The origin replied with a new representation.
    ModifiedReplyNew,
    /// The request is being forwarded to the origin (POST, or GET cache miss).
    Forwarding,
    /// A response is being written back to the client.
    Responding { status: u16 },
    /// A CONNECT tunnel was established.
    TunnelOpen { target: &'a str },
    /// A CONNECT tunnel closed.
    TunnelClose,
    /// The connection ended in an error.
    Error(&'a ProxyError),
}

impl<'a> Event<'a> {
    fn render(&self) -> String {
        match self {
            Event::NewRequest { method, target } => format!("new request [{method} {target}]"),
            Event::NotInCache => "not in cache".to_string(),
            Event::InCacheValid => "in cache, valid".to_string(),
            Event::InCacheRequiresValidation => "in cache, requires validation".to_string(),
            Event::Revalidating => "revalidating".to_string(),
            Event::NotModified => "not modified".to_string(),
            Event::ModifiedReplyNew => "modified, reply new".to_string(),
            Event::Forwarding => "forwarding".to_string(),
            Event::Responding { status } => format!("responding [{status}]"),
            Event::TunnelOpen { target } => format!("tunnel open [{target}]"),
            Event::TunnelClose => "tunnel close".to_string(),
            Event::Error(err) => format!("ERROR {}", err.reason()),
        }
    }
}

/// Emits per-connection [`Event`]s, identified by the connection's id.
pub trait Logger: Send + Sync {
    /// Logs `event` for connection `id`.
    fn log(&self, id: u64, event: Event<'_>);
}

/// A [`Logger`] that writes through the `log` crate at `info` level (`error`
/// for [`Event::Error`]), for `env_logger` to format and filter via
/// `RUST_LOG` (spec §2 item 7).
#[derive(Debug, Clone, Copy, Default)]
pub struct StdLogger;

impl Logger for StdLogger {
    fn log(&self, id: u64, event: Event<'_>) {
        let line = format!("{id}: {}", event.render());
        match event {
            Event::Error(_) => log::error!("{line}"),
            _ => log::info!("{line}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_new_request_with_method_and_target() {
        let event = Event::NewRequest { method: "GET", target: "http://example.test/" };
        assert_eq!(event.render(), "new request [GET http://example.test/]");
    }

    #[test]
    fn renders_error_with_reason() {
        let err = ProxyError::malformed("bad request-line");
        let event = Event::Error(&err);
        assert_eq!(event.render(), "ERROR MALFORMED bad request-line");
    }

    #[test]
    fn renders_responding_with_status() {
        let event = Event::Responding { status: 200 };
        assert_eq!(event.render(), "responding [200]");
    }
}
