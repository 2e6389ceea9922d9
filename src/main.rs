//! Binary entry point: parses the CLI, installs logging, binds the
//! listening socket, and runs the accept loop until Ctrl-C (spec §6).

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use proxy_cache::acceptor;
use proxy_cache::cache::Cache;
use proxy_cache::config::{Cli, ProxyConfig};
use proxy_cache::logging::{Event, Logger, StdLogger};
use proxy_cache::runtime::{SystemClock, TcpListenerAdapter};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let config: ProxyConfig = cli.into();

    let listener = match TcpListenerAdapter::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            let logger = StdLogger;
            logger.log(0, Event::Error(&err));
            return ExitCode::FAILURE;
        }
    };

    let cache = Arc::new(Cache::new());
    let clock = Arc::new(SystemClock);
    let logger = Arc::new(StdLogger);

    acceptor::run(
        listener,
        cache,
        clock,
        logger,
        config.idle_timeout,
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
    )
    .await;

    ExitCode::SUCCESS
}
