//! Collaborator seams (spec §2 item 9: test tooling) so the Handler and
//! Acceptor can be driven against real sockets in production and loopback
//! or in-memory streams in tests.
//!
//! Grounded in the cache crate's feature-gated rate-limiter trait
//! (`CacheAwareRateLimiter`, implemented once for production use and once
//! for tests): the pattern here is the same, trait plus a single real
//! implementation, generalized from rate limiting to socket acceptance and
//! time.

use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;

/// Anything the Handler can read an HTTP message from and write a response
/// to: a real `TcpStream` in production, a `tokio::io::duplex` half or a
/// loopback socket in tests.
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

/// A source of accepted connections, abstracting over `TcpListener` so
/// tests can drive the Acceptor without binding a real port.
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    /// The connection type this listener produces.
    type Conn: ClientStream + 'static;

    /// Accepts the next connection, returning it along with a
    /// human-readable peer address for logging.
    async fn accept(&self) -> Result<(Self::Conn, String)>;
}

/// A [`Listener`] backed by a real `tokio::net::TcpListener`.
pub struct TcpListenerAdapter {
    inner: TcpListener,
}

impl TcpListenerAdapter {
    /// Binds to `addr` (e.g. `"0.0.0.0:12345"`).
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    /// The locally bound address, useful for tests that bind port `0`.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait::async_trait]
impl Listener for TcpListenerAdapter {
    type Conn = TcpStream;

    async fn accept(&self) -> Result<(TcpStream, String)> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true).ok();
        Ok((stream, addr.to_string()))
    }
}

/// A source of the current time, abstracted so cache-freshness tests can
/// fix `now` instead of racing the wall clock.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> SystemTime;
}

/// A [`Clock`] backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
