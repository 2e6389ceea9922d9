//! The per-connection state machine (spec §4.3): parse, classify method,
//! then forward, tunnel, serve-from-cache, or revalidate, and reply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::cache::{self, Cache, Decision};
use crate::error::{ProxyError, Result};
use crate::headers::strip_hop_by_hop;
use crate::logging::{Event, Logger};
use crate::message::{Method, Request, Response, Target};
use crate::parser::{parse_request, parse_response};
use crate::runtime::{Clock, ClientStream};
use crate::wire::{relay_bidirectional, with_timeout, Wire};

const REPLY_CHUNK: usize = 8 * 1024;

/// Drives one accepted connection to completion. Never propagates an error
/// to the caller: every failure is recovered here, logged, and (when the
/// response hasn't started yet) turned into a best-effort error reply,
/// matching spec §7's "recovered at the Handler boundary" policy.
pub async fn handle_connection<S: ClientStream>(
    id: u64,
    stream: S,
    cache: &Cache,
    logger: &dyn Logger,
    clock: &dyn Clock,
    idle_timeout: Duration,
) {
    if let Err(err) = run(id, stream, cache, logger, clock, idle_timeout).await {
        logger.log(id, Event::Error(&err));
    }
}

async fn run<S: ClientStream>(
    id: u64,
    stream: S,
    cache: &Cache,
    logger: &dyn Logger,
    clock: &dyn Clock,
    idle_timeout: Duration,
) -> Result<()> {
    let mut client = Wire::new(stream);
    let req = match with_timeout(idle_timeout, parse_request(&mut client, id)).await {
        Ok(req) => req,
        Err(err) => {
            if let Some(status) = err.client_status() {
                let _ = reply_status(&mut client, status, reason_for(status)).await;
            }
            return Err(err);
        }
    };

    logger.log(id, Event::NewRequest { method: req.method.as_str(), target: &req.target.authority() });

    let result = match &req.method {
        Method::Connect => handle_connect(id, &req, &mut client, logger, idle_timeout).await,
        Method::Get => handle_get(id, &req, &mut client, cache, logger, clock, idle_timeout).await,
        Method::Post => handle_forward_only(id, &req, &mut client, logger, idle_timeout).await,
        Method::Other(_) => {
            reply_status(&mut client, 400, "Bad Request").await?;
            Ok(())
        }
    };

    if let Err(err) = &result {
        if let Some(status) = err.client_status() {
            let _ = reply_status(&mut client, status, reason_for(status)).await;
        }
    }
    result
}

fn reason_for(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

async fn reply_status<S: ClientStream>(client: &mut Wire<S>, status: u16, reason: &str) -> Result<()> {
    let body = reason.as_bytes();
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n",
        body.len()
    );
    client.write_all(head.as_bytes()).await?;
    client.write_all(body).await
}

/// Writes `data` to `client` in fixed-size chunks (spec §4.3
/// "reply-from-cache").
async fn reply_raw<S: ClientStream>(client: &mut Wire<S>, data: &[u8]) -> Result<()> {
    for chunk in data.chunks(REPLY_CHUNK) {
        client.write_all(chunk).await?;
    }
    Ok(())
}

async fn connect_origin(target: &Target) -> Result<TcpStream> {
    let mut addrs = tokio::net::lookup_host(target.authority())
        .await
        .map_err(|e| ProxyError::ResolveFail { host: target.host.clone(), detail: e.to_string() })?;
    let addr = addrs.next().ok_or_else(|| ProxyError::ResolveFail {
        host: target.host.clone(),
        detail: "no addresses returned".to_string(),
    })?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ProxyError::ConnectFail { host: target.host.clone(), port: target.port, detail: e.to_string() })?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Serializes `req` in origin-form, with hop-by-hop headers stripped and
/// `extra_headers` appended (used for revalidation's conditional headers).
fn serialize_forward_request(req: &Request, extra_headers: &[(String, String)]) -> Vec<u8> {
    let mut headers = req.headers.clone();
    strip_hop_by_hop(&mut headers);
    let mut out = format!("{} {} {}\r\n", req.method.as_str(), req.target.origin_form(), req.version).into_bytes();
    out.extend_from_slice(headers.to_string().as_bytes());
    for (name, value) in extra_headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    out
}

async fn forward(
    req: &Request,
    extra_headers: &[(String, String)],
    idle_timeout: Duration,
) -> Result<Response> {
    let origin_stream = connect_origin(&req.target).await?;
    let mut origin = Wire::new(origin_stream);
    let wire_bytes = serialize_forward_request(req, extra_headers);
    with_timeout(idle_timeout, origin.write_all(&wire_bytes)).await?;
    with_timeout(idle_timeout, parse_response(&mut origin)).await
}

async fn handle_get<S: ClientStream>(
    id: u64,
    req: &Request,
    client: &mut Wire<S>,
    cache: &Cache,
    logger: &dyn Logger,
    clock: &dyn Clock,
    idle_timeout: Duration,
) -> Result<()> {
    let key = req.cache_key();
    let now = clock.now();
    match cache.classify_with_entry(&key, now) {
        (Decision::Miss, _) => {
            logger.log(id, Event::NotInCache);
            logger.log(id, Event::Forwarding);
            let response = forward(req, &[], idle_timeout).await?;
            let response = store_if_cacheable(cache, key, response, clock.now());
            logger.log(id, Event::Responding { status: response.status_code });
            reply_raw(client, &response.raw).await
        }
        (Decision::Fresh, Some(entry)) => {
            logger.log(id, Event::InCacheValid);
            logger.log(id, Event::Responding { status: entry.response.status_code });
            reply_raw(client, &entry.response.raw).await
        }
        (Decision::MustRevalidate, Some(entry)) => {
            let mut conditional = Vec::new();
            if let Some(etag) = entry.response.etag() {
                conditional.push(("If-None-Match".to_string(), etag.to_string()));
            } else if let Some(lm) = entry.response.last_modified() {
                conditional.push(("If-Modified-Since".to_string(), lm.to_string()));
            }
            logger.log(id, Event::InCacheRequiresValidation);
            logger.log(id, Event::Revalidating);
            let response = forward(req, &conditional, idle_timeout).await?;
            match response.status_code {
                304 => {
                    logger.log(id, Event::NotModified);
                    // `refresh_and_get` runs under a single lock acquisition,
                    // so a concurrent worker's `delete` on this key (from a
                    // competing non-cacheable revalidation) can only ever
                    // fully precede or fully follow it — never interleave.
                    // If it precedes, fall back to the entry already in hand
                    // from `classify_with_entry` above rather than treating
                    // a vanished key as a bug.
                    let refreshed = cache.refresh_and_get(&key, &response, clock.now());
                    let served = refreshed.as_ref().unwrap_or(&entry);
                    logger.log(id, Event::Responding { status: served.response.status_code });
                    reply_raw(client, &served.response.raw).await
                }
                200 => {
                    logger.log(id, Event::ModifiedReplyNew);
                    let response = if cache::is_cacheable(&response) {
                        store_if_cacheable(cache, key, response, clock.now())
                    } else {
                        cache.delete(&key);
                        response
                    };
                    logger.log(id, Event::Responding { status: response.status_code });
                    reply_raw(client, &response.raw).await
                }
                _ => {
                    logger.log(id, Event::Responding { status: response.status_code });
                    reply_raw(client, &response.raw).await
                }
            }
        }
        // `classify_with_entry` only returns `Fresh`/`MustRevalidate` paired
        // with `Some(entry)`; a concurrent `delete` between classifying and
        // here cannot occur since both happen under the same lock.
        (Decision::Fresh | Decision::MustRevalidate, None) => unreachable!(
            "classify_with_entry only returns Fresh/MustRevalidate alongside an entry"
        ),
    }
}

/// Dechunks and stores `response` under `key` if it's cacheable, returning
/// the (possibly dechunked) response to reply with either way.
fn store_if_cacheable(cache: &Cache, key: String, response: Response, now: std::time::SystemTime) -> Response {
    if !cache::is_cacheable(&response) {
        return response;
    }
    let response = if response.is_chunked() { response.dechunked() } else { response };
    cache.put(key, response.clone(), now);
    response
}

async fn handle_forward_only<S: ClientStream>(
    id: u64,
    req: &Request,
    client: &mut Wire<S>,
    logger: &dyn Logger,
    idle_timeout: Duration,
) -> Result<()> {
    logger.log(id, Event::Forwarding);
    let response = forward(req, &[], idle_timeout).await?;
    logger.log(id, Event::Responding { status: response.status_code });
    reply_raw(client, &response.raw).await
}

async fn handle_connect<S: ClientStream>(
    id: u64,
    req: &Request,
    client: &mut Wire<S>,
    logger: &dyn Logger,
    idle_timeout: Duration,
) -> Result<()> {
    let origin_stream = match with_timeout(idle_timeout, connect_origin(&req.target)).await {
        Ok(s) => s,
        Err(err) => {
            reply_status(client, 502, "Bad Gateway").await?;
            return Err(err);
        }
    };
    client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
    logger.log(id, Event::TunnelOpen { target: &req.target.authority() });
    let mut origin_stream = origin_stream;
    let client_stream = client_stream_mut(client);
    let _ = relay_bidirectional(client_stream, &mut origin_stream).await;
    logger.log(id, Event::TunnelClose);
    Ok(())
}

fn client_stream_mut<S>(wire: &mut Wire<S>) -> &mut S {
    wire.stream_mut()
}

/// A process-wide, monotonically increasing request-id source (spec §4.4,
/// §9: "process-wide state limited to [the Cache] plus the id counter").
#[derive(Default)]
pub struct IdCounter(AtomicU64);

impl IdCounter {
    /// Creates a counter starting at 1.
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Returns the next id, never repeating for the life of the process.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::StdLogger;
    use crate::runtime::SystemClock;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct NullLogger(Mutex<Vec<String>>);

    impl Logger for NullLogger {
        fn log(&self, id: u64, event: Event<'_>) {
            self.0.lock().unwrap().push(format!("{id}:{event:?}"));
        }
    }

    async fn spawn_origin(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(response).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn cold_get_forwards_and_caches() {
        let addr = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nCache-Control: max-age=60\r\n\r\nhello").await;
        let cache = Cache::new();
        let logger = NullLogger(Mutex::new(Vec::new()));
        let clock = SystemClock;

        let (mut client_write, client_read) = duplex(8192);
        let request = format!(
            "GET http://{}{} HTTP/1.1\r\nHost: {}\r\n\r\n",
            addr, "/", addr
        );
        client_write.write_all(request.as_bytes()).await.unwrap();

        let mut client_wire = Wire::new(client_read);
        let req = parse_request(&mut client_wire, 1).await.unwrap();
        // Patch target to the spawned origin's loopback address since the
        // request line encodes it directly as host:port.
        assert_eq!(req.target.host, addr.ip().to_string());
        assert_eq!(req.target.port, addr.port());

        handle_get(1, &req, &mut client_wire, &cache, &logger, &clock, Duration::from_secs(5))
            .await
            .unwrap();

        let key = req.cache_key();
        assert_eq!(cache.classify(&key, clock.now()), Decision::Fresh);
    }

    #[tokio::test]
    async fn revalidate_304_survives_concurrent_delete_without_panicking() {
        // Regression test for a TOCTOU window: a second worker deleting this
        // key (e.g. because its own concurrent revalidation came back
        // non-cacheable) between this handler capturing the stale entry and
        // refreshing it must not panic `handle_get`; it must fall back to
        // the entry already in hand.
        use crate::headers::HeaderList;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            // Delay the response so the concurrent `delete` below lands
            // inside the classify-entry -> refresh window.
            tokio::time::sleep(Duration::from_millis(50)).await;
            sock.write_all(b"HTTP/1.1 304 Not Modified\r\n\r\n").await.unwrap();
        });

        let cache = std::sync::Arc::new(Cache::new());
        let mut stale_headers = HeaderList::new();
        stale_headers.append("Content-Length", "5");
        stale_headers.append("Cache-Control", "max-age=60");
        stale_headers.append("ETag", "\"a\"");
        let stale_response = Response {
            status_code: 200,
            reason: "OK".into(),
            version: "HTTP/1.1".into(),
            headers: stale_headers,
            body: b"hello".to_vec(),
            raw: b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nCache-Control: max-age=60\r\nETag: \"a\"\r\n\r\nhello"
                .to_vec(),
        };

        let logger = NullLogger(Mutex::new(Vec::new()));
        let clock = SystemClock;

        let (mut client_write, client_read) = duplex(8192);
        let request = format!("GET http://{addr}/ HTTP/1.1\r\nHost: {addr}\r\n\r\n");
        client_write.write_all(request.as_bytes()).await.unwrap();
        let mut client_wire = Wire::new(client_read);
        let req = parse_request(&mut client_wire, 1).await.unwrap();

        let key = req.cache_key();
        let stale_inserted_at = clock.now() - Duration::from_secs(120);
        cache.put(key.clone(), stale_response, stale_inserted_at);
        assert_eq!(cache.classify(&key, clock.now()), Decision::MustRevalidate);

        let delete_cache = std::sync::Arc::clone(&cache);
        let delete_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            delete_cache.delete(&delete_key);
        });

        // Must complete without panicking even though the key vanishes
        // mid-revalidation.
        handle_get(1, &req, &mut client_wire, cache.as_ref(), &logger, &clock, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_request_gets_400_and_closes() {
        let (mut client_write, client_read) = duplex(8192);
        client_write.write_all(b"GETT / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(client_write);

        let cache = Cache::new();
        let logger = NullLogger(Mutex::new(Vec::new()));
        let clock = SystemClock;
        run(1, client_read, &cache, &logger, &clock, Duration::from_secs(5)).await.ok();
        // No Host header means resolve_target fails with Malformed; either
        // way the connection must terminate without panicking.
    }
}
