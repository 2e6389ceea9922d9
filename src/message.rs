//! The normalized request/response values the parser produces (spec §3).

use std::time::SystemTime;

use crate::headers::HeaderList;

/// The request method, classified per spec §3 (`GET`, `POST`, `CONNECT`, or
/// anything else, which the Handler turns into a `400`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `CONNECT`
    Connect,
    /// Anything else (`PUT`, `DELETE`, a typo like `GETT`, ...).
    Other(String),
}

impl Method {
    /// Parses the method token from a request-line.
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "CONNECT" => Method::Connect,
            other => Method::Other(other.to_string()),
        }
    }

    /// The wire token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Connect => "CONNECT",
            Method::Other(s) => s.as_str(),
        }
    }
}

/// A parsed request-target: the host/port the proxy must connect to and the
/// origin-form path sent to it. Default port is 80 for GET/POST, 443 for
/// CONNECT (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Target host, lowercased.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Origin-form path and query (e.g. `/index.html?x=1`), empty targets
    /// (CONNECT) are the empty string.
    pub path: String,
}

impl Target {
    /// `host:port` as used for `TcpStream::connect` and the CONNECT target.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The origin-form path sent on the wire to the origin server: `path`
    /// itself, or `/` when it's empty (never the case for GET/POST targets,
    /// only defensive for reuse).
    pub fn origin_form(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }
}

/// Parsed `Cache-Control` directives (spec §3, Response derived fields).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `max-age=N`, seconds.
    pub max_age: Option<u64>,
    /// `no-cache` present.
    pub no_cache: bool,
    /// `no-store` present.
    pub no_store: bool,
    /// `private` present.
    pub private: bool,
    /// `public` present.
    pub public: bool,
    /// `must-revalidate` present. Recorded on the entry but, per spec §4.2,
    /// does not introduce a fourth `classify` outcome.
    pub must_revalidate: bool,
}

impl CacheControl {
    /// Parses a `Cache-Control` header value into its directive set.
    /// Unknown directives are ignored.
    pub fn parse(value: &str) -> Self {
        let mut cc = CacheControl::default();
        for directive in value.split(',') {
            let directive = directive.trim();
            let mut parts = directive.splitn(2, '=');
            let name = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let arg = parts.next().map(|s| s.trim().trim_matches('"'));
            match name.as_str() {
                "max-age" => {
                    cc.max_age = arg.and_then(|a| a.parse::<u64>().ok());
                }
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "private" => cc.private = true,
                "public" => cc.public = true,
                "must-revalidate" => cc.must_revalidate = true,
                _ => {}
            }
        }
        cc
    }
}

/// A fully parsed HTTP request (spec §3).
#[derive(Debug, Clone)]
pub struct Request {
    /// Monotonic, process-wide, log-correlation id.
    pub id: u64,
    /// Classified method.
    pub method: Method,
    /// Resolved target (host, port, origin-form path).
    pub target: Target,
    /// The HTTP version token from the request-line (e.g. `HTTP/1.1`).
    pub version: String,
    /// Ordered, case-insensitive headers.
    pub headers: HeaderList,
    /// Request body, empty for most GETs.
    pub body: Vec<u8>,
    /// The original bytes, retained for exact forwarding.
    pub raw: Vec<u8>,
}

impl Request {
    /// The canonical cache key for this request: `GET http://host:port/path`
    /// with the default port elided, lowercased host (spec §6). Only GET
    /// requests are ever classified against the cache, but the key is cheap
    /// to compute for any method.
    pub fn cache_key(&self) -> String {
        canonical_key(&self.target, default_port_for(&self.method))
    }
}

fn default_port_for(method: &Method) -> u16 {
    match method {
        Method::Connect => 443,
        _ => 80,
    }
}

fn canonical_key(target: &Target, default_port: u16) -> String {
    let host = target.host.to_ascii_lowercase();
    if target.port == default_port {
        format!("GET http://{}{}", host, target.path)
    } else {
        format!("GET http://{}:{}{}", host, target.port, target.path)
    }
}

/// A fully parsed HTTP response (spec §3).
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code.
    pub status_code: u16,
    /// Reason phrase, preserved verbatim from the origin's status line.
    pub reason: String,
    /// The HTTP version token from the status-line.
    pub version: String,
    /// Ordered, case-insensitive headers.
    pub headers: HeaderList,
    /// Response body.
    pub body: Vec<u8>,
    /// The original bytes, used verbatim when serving from cache.
    pub raw: Vec<u8>,
}

impl Response {
    /// `ETag` header, if present.
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }

    /// `Last-Modified` header, if present.
    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("last-modified")
    }

    /// `Date` header, parsed to a `SystemTime`, if present and valid.
    pub fn date(&self) -> Option<SystemTime> {
        self.headers.get("date").and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// `Expires` header, parsed to a `SystemTime`, if present and valid.
    pub fn expires(&self) -> Option<SystemTime> {
        self.headers
            .get("expires")
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// Parsed `Cache-Control` directive set (empty if the header is absent).
    pub fn cache_control(&self) -> CacheControl {
        self.headers
            .get("cache-control")
            .map(CacheControl::parse)
            .unwrap_or_default()
    }

    /// True if `Transfer-Encoding: chunked` is present. Used by the
    /// forwarding/caching path to decide whether a cacheable response needs
    /// [`Response::dechunked`] at all (spec §9 chunked-handling resolution).
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Rebuilds `raw` from the status-line fields, `headers`, and `body`
    /// (spec §9 chunked-handling resolution: a cacheable response is
    /// dechunked and re-served with a computed `Content-Length`, so its
    /// `raw` bytes must be regenerated rather than reused verbatim).
    pub fn dechunked(mut self) -> Self {
        self.headers.remove_all("transfer-encoding");
        self.headers.remove_all("content-length");
        self.headers.append("Content-Length", self.body.len().to_string());
        let mut raw = format!("{} {} {}\r\n", self.version, self.status_code, self.reason).into_bytes();
        raw.extend_from_slice(self.headers.to_string().as_bytes());
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(&self.body);
        self.raw = raw;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_elides_default_port() {
        let t = Target { host: "Example.Test".into(), port: 80, path: "/a".into() };
        let key = canonical_key(&t, 80);
        assert_eq!(key, "GET http://example.test/a");
    }

    #[test]
    fn cache_key_keeps_nondefault_port() {
        let t = Target { host: "example.test".into(), port: 8080, path: "/a".into() };
        let key = canonical_key(&t, 80);
        assert_eq!(key, "GET http://example.test:8080/a");
    }

    #[test]
    fn cache_control_parses_max_age_and_flags() {
        let cc = CacheControl::parse("max-age=60, no-cache, private");
        assert_eq!(cc.max_age, Some(60));
        assert!(cc.no_cache);
        assert!(cc.private);
        assert!(!cc.no_store);
    }
}
