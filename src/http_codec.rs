// src/http_codec.rs
use crate::buffer::Buffer;
use crate::message::{HttpRequest, HttpResponse, Method};
use log::warn;
use std::net::SocketAddr;
use std::time::SystemTime;

const SERVER_NAME: &str = "mazurka";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Stateless HTTP/1.1 framing: requests out of a [`Buffer`], responses into
/// bytes. All per-request state lives in the buffer cursors, so a partial
/// request simply stays buffered until the next read.
pub struct HttpCodec;

impl HttpCodec {
    /// Decode every complete request currently buffered (pipelining).
    ///
    /// The head section is parsed against the UTF-8-safe prefix, so a
    /// multi-byte character split across reads never corrupts a header.
    /// Bodies are raw bytes and are measured against everything readable.
    /// A malformed head is a soft failure: a warning is logged and the
    /// bytes stay buffered, exactly as if the request were incomplete.
    pub fn decode(buf: &mut Buffer, peer: Option<SocketAddr>) -> Vec<HttpRequest> {
        let mut requests = Vec::new();

        loop {
            let safe_len = buf.utf8_safe_len();
            let head_end = match find_terminator(&buf.peek()[..safe_len]) {
                Some(pos) => pos,
                None => break,
            };

            let head = match std::str::from_utf8(&buf.peek()[..head_end]) {
                Ok(s) => s,
                Err(_) => {
                    warn!("request head is not valid UTF-8");
                    break;
                }
            };

            let mut req = match parse_head(head) {
                Some(req) => req,
                None => {
                    warn!("malformed request head");
                    break;
                }
            };
            req.peer = peer;

            if req
                .get_header("transfer-encoding")
                .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
            {
                // Recognized but not decoded; framing falls back to
                // Content-Length (usually absent, so an empty body).
                warn!("chunked transfer encoding not supported");
            }

            let body_len = req
                .get_header("content-length")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);

            let total = head_end + HEADER_TERMINATOR.len() + body_len;
            if buf.readable_bytes() < total {
                // Head complete but body still in flight.
                break;
            }

            buf.retrieve(head_end + HEADER_TERMINATOR.len());
            req.body = buf.retrieve_as_bytes(body_len);
            requests.push(req);
        }

        requests
    }

    /// Serialize a response. Date, Server, Content-Length, and Connection
    /// are auto-injected only when the handler did not set them itself; an
    /// explicit response `Connection` overrides the request-derived default.
    pub fn encode(resp: &HttpResponse, keep_alive: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + resp.body.len());
        out.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                resp.status.code(),
                resp.status.reason()
            )
            .as_bytes(),
        );

        if resp.get_header("date").is_none() {
            let date = httpdate::fmt_http_date(SystemTime::now());
            out.extend_from_slice(format!("Date: {}\r\n", date).as_bytes());
        }
        if resp.get_header("server").is_none() {
            out.extend_from_slice(format!("Server: {}\r\n", SERVER_NAME).as_bytes());
        }
        if resp.get_header("content-length").is_none() {
            out.extend_from_slice(
                format!("Content-Length: {}\r\n", resp.body.len()).as_bytes(),
            );
        }
        if resp.get_header("connection").is_none() {
            let conn = if keep_alive { "keep-alive" } else { "close" };
            out.extend_from_slice(format!("Connection: {}\r\n", conn).as_bytes());
        }

        for (name, value) in &resp.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&resp.body);
        out
    }

    /// Serialize a request, for clients and tests. No auto-injection beyond
    /// Content-Length when a body is present.
    pub fn encode_request(req: &HttpRequest) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + req.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", req.method.as_str(), req.path, req.version).as_bytes(),
        );
        for (name, value) in &req.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if !req.body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&req.body);
        out
    }
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

/// Parse the request line and header lines (everything before the blank
/// line). Returns None on any structural violation.
fn parse_head(head: &str) -> Option<HttpRequest> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;

    let mut parts = request_line.split(' ');
    let method = Method::from_bytes(parts.next()?.as_bytes());
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return None;
    }

    let mut req = HttpRequest::new();
    req.method = method;
    req.version = version.to_string();

    match target.split_once('?') {
        Some((path, query)) => {
            req.path = path.to_string();
            for pair in query.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    req.params.insert(k.to_string(), v.to_string());
                } else if !pair.is_empty() {
                    req.params.insert(pair.to_string(), String::new());
                }
            }
        }
        None => req.path = target.to_string(),
    }
    if req.path.is_empty() {
        return None;
    }

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        // Names are kept exactly as received; lookups are case-insensitive.
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("cookie") {
            for pair in value.split(';') {
                if let Some((k, v)) = pair.split_once('=') {
                    req.cookies.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }
        req.headers.insert(name, value);
    }

    Some(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;

    fn buf_from(data: &[u8]) -> Buffer {
        let mut buf = Buffer::new();
        buf.append(data);
        buf
    }

    #[test]
    fn test_decode_simple_get() {
        let mut buf = buf_from(b"GET /hello?name=ada HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let reqs = HttpCodec::decode(&mut buf, None);
        assert_eq!(reqs.len(), 1);
        let req = &reqs[0];
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/hello");
        assert_eq!(req.get_param("name"), Some("ada"));
        assert_eq!(req.get_header("host"), Some("example.com"));
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_decode_post_with_body() {
        let mut buf = buf_from(
            b"POST /msg HTTP/1.1\r\nContent-Length: 11\r\nContent-Type: text/plain\r\n\r\nhello world",
        );
        let reqs = HttpCodec::decode(&mut buf, None);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].body, b"hello world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_decode_binary_body_survives() {
        let mut head = b"POST /blob HTTP/1.1\r\nContent-Length: 4\r\n\r\n".to_vec();
        head.extend_from_slice(&[0x00, 0xFF, 0x80, 0x7F]);
        let mut buf = buf_from(&head);
        let reqs = HttpCodec::decode(&mut buf, None);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].body, vec![0x00, 0xFF, 0x80, 0x7F]);
    }

    #[test]
    fn test_decode_pipelined_pair() {
        let mut buf = buf_from(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let reqs = HttpCodec::decode(&mut buf, None);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].path, "/a");
        assert_eq!(reqs[1].path, "/b");
    }

    #[test]
    fn test_decode_incremental_byte_by_byte() {
        let raw = b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut buf = Buffer::new();
        for (i, byte) in raw.iter().enumerate() {
            buf.append(&[*byte]);
            let reqs = HttpCodec::decode(&mut buf, None);
            if i < raw.len() - 1 {
                assert!(reqs.is_empty(), "decoded early at byte {}", i);
            } else {
                assert_eq!(reqs.len(), 1);
                assert_eq!(reqs[0].path, "/slow");
            }
        }
    }

    #[test]
    fn test_decode_body_waits_for_remaining_bytes() {
        let mut buf = buf_from(b"POST /m HTTP/1.1\r\nContent-Length: 5\r\n\r\nab");
        assert!(HttpCodec::decode(&mut buf, None).is_empty());
        buf.append(b"cde");
        let reqs = HttpCodec::decode(&mut buf, None);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].body, b"abcde");
    }

    #[test]
    fn test_decode_split_utf8_in_head_waits() {
        // "/héllo" with the é (C3 A9) cut after C3.
        let mut buf = buf_from(b"GET /h\xC3");
        assert!(HttpCodec::decode(&mut buf, None).is_empty());
        assert_eq!(buf.readable_bytes(), 7);

        buf.append(b"\xA9llo HTTP/1.1\r\n\r\n");
        let reqs = HttpCodec::decode(&mut buf, None);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].path, "/héllo");
    }

    #[test]
    fn test_decode_malformed_request_line_is_soft_failure() {
        let raw = b"NOT A REQUEST AT ALL\r\n\r\n";
        let mut buf = buf_from(raw);
        let reqs = HttpCodec::decode(&mut buf, None);
        assert!(reqs.is_empty());
        // Bytes stay buffered, as with an incomplete request.
        assert_eq!(buf.readable_bytes(), raw.len());
    }

    #[test]
    fn test_decode_unparseable_content_length_means_no_body() {
        let mut buf = buf_from(b"POST /m HTTP/1.1\r\nContent-Length: zero\r\n\r\n");
        let reqs = HttpCodec::decode(&mut buf, None);
        assert_eq!(reqs.len(), 1);
        assert!(reqs[0].body.is_empty());
    }

    #[test]
    fn test_header_names_kept_as_received() {
        let mut buf = buf_from(
            b"GET / HTTP/1.1\r\nX-Request-ID: abc\r\ncOnTeNt-TyPe: text/plain\r\n\r\n",
        );
        let reqs = HttpCodec::decode(&mut buf, None);
        let req = &reqs[0];
        // Stored verbatim, looked up case-insensitively.
        assert!(req.headers.contains_key("X-Request-ID"));
        assert!(req.headers.contains_key("cOnTeNt-TyPe"));
        assert!(!req.headers.contains_key("x-request-id"));
        assert_eq!(req.get_header("x-request-id"), Some("abc"));
        assert_eq!(req.get_header("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn test_decode_cookies() {
        let mut buf = buf_from(b"GET / HTTP/1.1\r\nCookie: sid=abc; theme=dark\r\n\r\n");
        let reqs = HttpCodec::decode(&mut buf, None);
        assert_eq!(reqs[0].get_cookie("sid"), Some("abc"));
        assert_eq!(reqs[0].get_cookie("theme"), Some("dark"));
    }

    #[test]
    fn test_encode_has_framing_headers() {
        let mut resp = HttpResponse::html("<h1>hi</h1>");
        resp.set_header("X-Custom", "yes");
        let bytes = HttpCodec::encode(&resp, true);
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.contains("Server: mazurka\r\n"));
        assert!(text.contains("X-Custom: yes\r\n"));
        assert!(text.ends_with("\r\n\r\n<h1>hi</h1>"));
    }

    #[test]
    fn test_encode_handler_connection_header_wins() {
        let mut resp = HttpResponse::ok();
        resp.set_header("Connection", "close");
        // keep_alive=true would normally say keep-alive; the explicit
        // header must win and appear exactly once.
        let text = String::from_utf8(HttpCodec::encode(&resp, true)).unwrap();
        assert!(text.contains("Connection: close\r\n"));
        assert_eq!(text.matches("Connection:").count(), 1);
    }

    #[test]
    fn test_encode_no_duplicate_content_length() {
        let mut resp = HttpResponse::ok();
        resp.body = b"12345".to_vec();
        resp.set_header("Content-Length", "5");
        let text = String::from_utf8(HttpCodec::encode(&resp, true)).unwrap();
        assert_eq!(text.matches("Content-Length:").count(), 1);
    }

    #[test]
    fn test_encode_close_connection() {
        let resp = HttpResponse::new(StatusCode::NotFound);
        let bytes = HttpCodec::encode(&resp, false);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn test_request_round_trip() {
        let mut req = HttpRequest::new();
        req.method = Method::Post;
        req.path = "/echo".to_string();
        req.version = "HTTP/1.1".to_string();
        req.headers.insert("host".to_string(), "localhost".to_string());
        req.body = b"payload".to_vec();

        let bytes = HttpCodec::encode_request(&req);
        let mut buf = buf_from(&bytes);
        let decoded = HttpCodec::decode(&mut buf, None);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].method, Method::Post);
        assert_eq!(decoded[0].path, "/echo");
        assert_eq!(decoded[0].body, b"payload");
    }
}
