// src/message.rs
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Unknown,
}

impl Method {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    Created = 201,
    NoContent = 204,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    InternalServerError = 500,
    ServiceUnavailable = 503,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::NoContent => "No Content",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// A parsed HTTP/1.1 request. Header names are stored exactly as received;
/// `get_header` matches case-insensitively. Query and path parameters land
/// in `params` (path parameters are filled in during routing).
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: Vec<u8>,
    pub peer: Option<SocketAddr>,
    /// Descriptor of the connection this arrived on; -1 until routed
    /// through a live connection. Lets handlers address the session.
    pub fd: i32,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            method: Method::Unknown,
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            params: HashMap::new(),
            cookies: HashMap::new(),
            body: Vec::new(),
            peer: None,
            fd: -1,
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn get_cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// HTTP/1.1 defaults to keep-alive; only an explicit `Connection: close`
    /// (or an HTTP/1.0 request without keep-alive) drops it.
    pub fn keep_alive(&self) -> bool {
        match self.get_header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version != "HTTP/1.0",
        }
    }

    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// When set, the body is served from this file instead of `body`.
    pub file_path: Option<String>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            file_path: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok)
    }

    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        let mut resp = Self::ok();
        resp.set_header("Content-Type", "application/json; charset=utf-8");
        resp.body = body.into();
        resp
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        let mut resp = Self::ok();
        resp.set_header("Content-Type", "text/html; charset=utf-8");
        resp.body = body.into();
        resp
    }

    /// Set a header, replacing any existing value under the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Cookies may repeat, so they always append.
    pub fn set_cookie(&mut self, name: &str, value: &str, attributes: &str) {
        let cookie = if attributes.is_empty() {
            format!("{}={}", name, value)
        } else {
            format!("{}={}; {}", name, value, attributes)
        };
        self.headers.push(("Set-Cookie".to_string(), cookie));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsOpcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl WsOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x0 => Some(WsOpcode::Continuation),
            0x1 => Some(WsOpcode::Text),
            0x2 => Some(WsOpcode::Binary),
            0x8 => Some(WsOpcode::Close),
            0x9 => Some(WsOpcode::Ping),
            0xA => Some(WsOpcode::Pong),
            _ => None,
        }
    }
}

/// A single RFC 6455 frame. `payload` is always stored unmasked; the
/// masking key is kept so an echoed frame can prove it was client-sent.
#[derive(Debug, Clone)]
pub struct WebSocketFrame {
    pub fin: bool,
    pub opcode: WsOpcode,
    pub masked: bool,
    pub masking_key: [u8; 4],
    pub payload: Vec<u8>,
}

impl WebSocketFrame {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            fin: true,
            opcode: WsOpcode::Text,
            masked: false,
            masking_key: [0; 4],
            payload: payload.into().into_bytes(),
        }
    }

    pub fn binary(payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode: WsOpcode::Binary,
            masked: false,
            masking_key: [0; 4],
            payload,
        }
    }

    pub fn close() -> Self {
        Self {
            fin: true,
            opcode: WsOpcode::Close,
            masked: false,
            masking_key: [0; 4],
            payload: Vec::new(),
        }
    }

    pub fn payload_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Everything a codec can produce or a dispatcher can consume. Closed on
/// purpose: a protocol addition is a new variant here, not a trait impl
/// somewhere else.
#[derive(Debug, Clone)]
pub enum Message {
    Request(HttpRequest),
    Response(HttpResponse),
    WebSocketFrame(WebSocketFrame),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_round_trip() {
        assert_eq!(Method::from_bytes(b"GET"), Method::Get);
        assert_eq!(Method::from_bytes(b"PATCH"), Method::Patch);
        assert_eq!(Method::from_bytes(b"BREW"), Method::Unknown);
        assert_eq!(Method::Post.as_str(), "POST");
    }

    #[test]
    fn test_keep_alive_defaults() {
        let mut req = HttpRequest::new();
        req.version = "HTTP/1.1".to_string();
        assert!(req.keep_alive());

        req.headers.insert("connection".to_string(), "close".to_string());
        assert!(!req.keep_alive());

        let mut old = HttpRequest::new();
        old.version = "HTTP/1.0".to_string();
        assert!(!old.keep_alive());
        old.headers
            .insert("connection".to_string(), "keep-alive".to_string());
        assert!(old.keep_alive());
    }

    #[test]
    fn test_set_header_replaces() {
        let mut resp = HttpResponse::ok();
        resp.set_header("Content-Type", "text/plain");
        resp.set_header("content-type", "application/json");
        assert_eq!(resp.get_header("Content-Type"), Some("application/json"));
        assert_eq!(
            resp.headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case("content-type"))
                .count(),
            1
        );
    }

    #[test]
    fn test_set_cookie_appends() {
        let mut resp = HttpResponse::ok();
        resp.set_cookie("sid", "abc", "HttpOnly; Path=/");
        resp.set_cookie("theme", "dark", "");
        let cookies: Vec<_> = resp
            .headers
            .iter()
            .filter(|(n, _)| n == "Set-Cookie")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(cookies, vec!["sid=abc; HttpOnly; Path=/", "theme=dark"]);
    }
}
