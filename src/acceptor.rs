//! The connection acceptor (spec §4.4): binds a listening socket, accepts
//! in a loop, and dispatches each connection to an independent worker.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::handler::{handle_connection, IdCounter};
use crate::logging::{Event, Logger};
use crate::runtime::{Clock, Listener};

/// Runs the accept loop until `shutdown` resolves. Never returns an error:
/// accept failures are logged and the loop continues (spec §4.4).
pub async fn run<L, C, G>(
    listener: L,
    cache: Arc<Cache>,
    clock: Arc<C>,
    logger: Arc<G>,
    idle_timeout: Duration,
    shutdown: impl std::future::Future<Output = ()>,
) where
    L: Listener,
    L::Conn: 'static,
    C: Clock + 'static,
    G: Logger + 'static,
{
    let ids = IdCounter::new();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let id = ids.next();
                        let cache = Arc::clone(&cache);
                        let clock = Arc::clone(&clock);
                        let logger = Arc::clone(&logger);
                        tokio::spawn(async move {
                            handle_connection(id, stream, &cache, logger.as_ref(), clock.as_ref(), idle_timeout).await;
                        });
                    }
                    Err(err) => {
                        logger.log(0, Event::Error(&err));
                    }
                }
            }
        }
    }
}
