//! Process configuration (spec §2 item 6, §6): a `clap`-derived CLI parsed
//! once in `main` and threaded through as a plain struct.

use std::time::Duration;

use clap::Parser;

/// Command-line arguments accepted by the proxy binary.
#[derive(Debug, Parser)]
#[command(name = "proxy-cache", about = "A forward HTTP/1.1 caching proxy")]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 12345)]
    pub port: u16,

    /// Seconds of inactivity on a client or origin socket before the
    /// connection is aborted with `IO_TIMEOUT`.
    #[arg(long, default_value_t = 30)]
    pub idle_timeout_secs: u64,
}

/// The resolved runtime configuration (spec §6), derived from [`Cli`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// The address to bind, e.g. `0.0.0.0:12345`.
    pub bind_addr: String,
    /// Idle-socket timeout applied to every blocking read/write.
    pub idle_timeout: Duration,
}

impl From<Cli> for ProxyConfig {
    fn from(cli: Cli) -> Self {
        ProxyConfig {
            bind_addr: format!("0.0.0.0:{}", cli.port),
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig { bind_addr: "0.0.0.0:12345".to_string(), idle_timeout: Duration::from_secs(30) }
    }
}
