//! A forward HTTP/1.1 caching proxy: parses client requests, forwards
//! GET/POST to origin servers, tunnels CONNECT opaquely, and maintains an
//! in-memory response cache with RFC-7234-style freshness and revalidation.

pub mod acceptor;
pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod headers;
pub mod logging;
pub mod message;
pub mod parser;
pub mod runtime;
pub mod wire;

pub use cache::Cache;
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
