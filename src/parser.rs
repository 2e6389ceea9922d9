//! The HTTP message parser (spec §4.1): turns wire bytes into a
//! [`Request`]/[`Response`] or a `MALFORMED` parse failure.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ProxyError, Result};
use crate::headers::HeaderList;
use crate::message::{Method, Request, Response, Target};
use crate::wire::Wire;

enum Framing {
    Chunked,
    ContentLength(u64),
    Empty,
    ReadToClose,
}

fn split_head_lines(head: &[u8]) -> Result<Vec<String>> {
    let text = String::from_utf8_lossy(head);
    // `head` ends in "\r\n\r\n"; splitting on "\r\n" yields the start-line,
    // each header line, then two trailing empty strings for the blank line.
    let mut lines: Vec<String> = text.split("\r\n").map(|s| s.to_string()).collect();
    // Drop the two trailing empty entries produced by the terminator.
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return Err(ProxyError::malformed("empty start-line"));
    }
    Ok(lines)
}

fn parse_headers(lines: &[String]) -> Result<HeaderList> {
    let mut headers = HeaderList::new();
    for line in lines {
        let idx = line.find(':').ok_or_else(|| {
            ProxyError::malformed(format!("header line missing ':': {line:?}"))
        })?;
        let name = line[..idx].trim().to_string();
        let value = line[idx + 1..].trim().to_string();
        headers.append(name, value);
    }
    check_content_length_consistency(&headers)?;
    Ok(headers)
}

fn check_content_length_consistency(headers: &HeaderList) -> Result<()> {
    let mut values: Vec<&str> = headers.get_all("content-length").collect();
    values.dedup();
    if values.len() > 1 {
        return Err(ProxyError::malformed(
            "multiple Content-Length headers with differing values",
        ));
    }
    Ok(())
}

fn framing_of(headers: &HeaderList, is_request: bool) -> Result<Framing> {
    if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Ok(Framing::Chunked);
    }
    if let Some(cl) = headers.get("content-length") {
        let n: u64 = cl
            .trim()
            .parse()
            .map_err(|_| ProxyError::malformed(format!("bad Content-Length: {cl:?}")))?;
        return Ok(Framing::ContentLength(n));
    }
    Ok(if is_request { Framing::Empty } else { Framing::ReadToClose })
}

/// Resolves the request-target (origin-form, absolute-form, or
/// authority-form) to a [`Target`] (spec §4.1 edge cases).
fn resolve_target(method: &Method, raw_target: &str, headers: &HeaderList) -> Result<Target> {
    if matches!(method, Method::Connect) {
        let (host, port) = raw_target.rsplit_once(':').ok_or_else(|| {
            ProxyError::malformed(format!("CONNECT target missing port: {raw_target:?}"))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::malformed(format!("bad CONNECT port: {port:?}")))?;
        return Ok(Target { host: host.to_ascii_lowercase(), port, path: String::new() });
    }

    if raw_target.starts_with("http://") || raw_target.starts_with("https://") {
        let url = url::Url::parse(raw_target)
            .map_err(|e| ProxyError::malformed(format!("bad absolute-form target: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::malformed("absolute-form target missing host"))?
            .to_ascii_lowercase();
        let port = url.port_or_known_default().unwrap_or(80);
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        return Ok(Target { host, port, path });
    }

    if let Some(path) = raw_target.strip_prefix('/').map(|_| raw_target.to_string()) {
        let host_header = headers
            .get("host")
            .ok_or_else(|| ProxyError::malformed("origin-form request missing Host header"))?;
        let (host, port) = match host_header.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                (h, p.parse().unwrap_or(80))
            }
            _ => (host_header, 80),
        };
        return Ok(Target { host: host.to_ascii_lowercase(), port, path });
    }

    Err(ProxyError::malformed(format!("unsupported request-target: {raw_target:?}")))
}

/// Parses a full HTTP request off `wire` (spec §4.1). `id` is stamped onto
/// the result for log correlation.
pub async fn parse_request<S: AsyncRead + AsyncWrite + Unpin>(
    wire: &mut Wire<S>,
    id: u64,
) -> Result<Request> {
    let head = wire.read_head().await?;
    let lines = split_head_lines(&head)?;
    let start_tokens: Vec<&str> = lines[0].split_whitespace().collect();
    if start_tokens.len() != 3 {
        return Err(ProxyError::malformed(format!(
            "bad request-line: {:?}",
            lines[0]
        )));
    }
    let method = Method::parse(start_tokens[0]);
    let raw_target = start_tokens[1];
    let version = start_tokens[2].to_string();
    let headers = parse_headers(&lines[1..])?;
    let target = resolve_target(&method, raw_target, &headers)?;

    let (body, raw_body) = match framing_of(&headers, true)? {
        Framing::Chunked => wire.read_chunked().await?,
        Framing::ContentLength(n) => {
            let b = wire.read_exact_n(n as usize).await?;
            (b.clone(), b)
        }
        Framing::Empty => (Vec::new(), Vec::new()),
        Framing::ReadToClose => {
            let b = wire.read_to_close().await?;
            (b.clone(), b)
        }
    };

    let mut raw = head;
    raw.extend_from_slice(&raw_body);

    Ok(Request { id, method, target, version, headers, body, raw })
}

/// Parses a full HTTP response off `wire` (spec §4.1).
pub async fn parse_response<S: AsyncRead + AsyncWrite + Unpin>(
    wire: &mut Wire<S>,
) -> Result<Response> {
    let head = wire.read_head().await?;
    let lines = split_head_lines(&head)?;
    let mut tokens = lines[0].splitn(3, ' ');
    let version = tokens
        .next()
        .ok_or_else(|| ProxyError::malformed("empty status-line"))?
        .to_string();
    let status_str = tokens
        .next()
        .ok_or_else(|| ProxyError::malformed(format!("bad status-line: {:?}", lines[0])))?;
    let status_code: u16 = status_str
        .parse()
        .map_err(|_| ProxyError::malformed(format!("bad status code: {status_str:?}")))?;
    if !(100..=599).contains(&status_code) {
        return Err(ProxyError::malformed(format!(
            "status code out of range: {status_code}"
        )));
    }
    let reason = tokens.next().unwrap_or("").to_string();
    let headers = parse_headers(&lines[1..])?;

    let (body, raw_body) = match framing_of(&headers, false)? {
        Framing::Chunked => wire.read_chunked().await?,
        Framing::ContentLength(n) => {
            let b = wire.read_exact_n(n as usize).await?;
            (b.clone(), b)
        }
        Framing::Empty => (Vec::new(), Vec::new()),
        Framing::ReadToClose => {
            let b = wire.read_to_close().await?;
            (b.clone(), b)
        }
    };

    let mut raw = head;
    raw.extend_from_slice(&raw_body);

    Ok(Response { status_code, reason, version, headers, body, raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wire_of(data: &[u8]) -> Wire<Cursor<Vec<u8>>> {
        Wire::new(Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn parses_absolute_form_get() {
        let mut w = wire_of(b"GET http://example.test/a?x=1 HTTP/1.1\r\nHost: example.test\r\n\r\n");
        let req = parse_request(&mut w, 1).await.unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target.host, "example.test");
        assert_eq!(req.target.port, 80);
        assert_eq!(req.target.path, "/a?x=1");
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn parses_origin_form_with_host_header() {
        let mut w = wire_of(b"POST /submit HTTP/1.1\r\nHost: example.test:8081\r\nContent-Length: 4\r\n\r\nBODY");
        let req = parse_request(&mut w, 2).await.unwrap();
        assert_eq!(req.target.host, "example.test");
        assert_eq!(req.target.port, 8081);
        assert_eq!(req.target.path, "/submit");
        assert_eq!(req.body, b"BODY");
    }

    #[tokio::test]
    async fn parses_connect_authority_form() {
        let mut w = wire_of(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n");
        let req = parse_request(&mut w, 3).await.unwrap();
        assert_eq!(req.method, Method::Connect);
        assert_eq!(req.target.host, "example.test");
        assert_eq!(req.target.port, 443);
    }

    #[tokio::test]
    async fn malformed_request_line_rejected() {
        let mut w = wire_of(b"GET /\r\n\r\n");
        let err = parse_request(&mut w, 4).await.unwrap_err();
        assert!(matches!(err, ProxyError::Malformed { .. }));
    }

    #[tokio::test]
    async fn origin_form_without_host_header_is_malformed() {
        let mut w = wire_of(b"GET / HTTP/1.1\r\n\r\n");
        let err = parse_request(&mut w, 5).await.unwrap_err();
        assert!(matches!(err, ProxyError::Malformed { .. }));
    }

    #[tokio::test]
    async fn other_method_parses_but_is_not_get_or_post() {
        let mut w = wire_of(b"GETT / HTTP/1.1\r\nHost: example.test\r\n\r\n");
        let req = parse_request(&mut w, 6).await.unwrap();
        assert_eq!(req.method, Method::Other("GETT".to_string()));
    }

    #[tokio::test]
    async fn duplicate_differing_content_length_is_malformed() {
        let mut w = wire_of(
            b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\nABCDE",
        );
        let err = parse_request(&mut w, 7).await.unwrap_err();
        assert!(matches!(err, ProxyError::Malformed { .. }));
    }

    #[tokio::test]
    async fn parses_status_line_and_body() {
        let mut w = wire_of(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let res = parse_response(&mut w).await.unwrap();
        assert_eq!(res.status_code, 200);
        assert_eq!(res.reason, "OK");
        assert_eq!(res.body, b"hello");
    }

    #[tokio::test]
    async fn status_code_out_of_range_is_malformed() {
        let mut w = wire_of(b"HTTP/1.1 999 Nope\r\n\r\n");
        let err = parse_response(&mut w).await.unwrap_err();
        assert!(matches!(err, ProxyError::Malformed { .. }));
    }

    #[tokio::test]
    async fn chunked_response_decodes_body() {
        let mut w =
            wire_of(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n");
        let res = parse_response(&mut w).await.unwrap();
        assert_eq!(res.body, b"hello");
    }
}
