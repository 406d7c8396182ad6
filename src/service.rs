// src/service.rs
use crate::buffer::Buffer;
use crate::config::Config;
use crate::connection::ConnRef;
use crate::dispatcher::{Dispatcher, Handler};
use crate::error::{MazurkaError, MazurkaResult};
use crate::http_codec::HttpCodec;
use crate::message::{HttpRequest, HttpResponse, Method, StatusCode, WebSocketFrame, WsOpcode};
use crate::session::SessionManager;
use crate::syscalls;
use crate::worker_pool::WorkerPool;
use crate::ws_codec::WebSocketCodec;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Everything the application shares across threads. Built once at startup
/// and passed down explicitly; there are no global singletons.
pub struct ServerContext {
    pub dispatcher: Dispatcher,
    pub sessions: SessionManager,
    pub workers: WorkerPool,
    pub config: Config,
}

impl ServerContext {
    pub fn new(dispatcher: Dispatcher, config: Config) -> Arc<Self> {
        let workers = WorkerPool::with_size(config.worker_count());
        Arc::new(Self {
            dispatcher,
            sessions: SessionManager::new(),
            workers,
            config,
        })
    }
}

/// Encoded bytes a worker wants delivered to a connection. Replies cross
/// back to the loop thread through [`ReplySender`]; only the loop thread
/// touches connections.
pub struct Reply {
    pub fd: i32,
    pub data: Vec<u8>,
    pub close_after: bool,
}

/// Thread-safe handle workers use to queue replies and wake the loop.
#[derive(Clone)]
pub struct ReplySender {
    queue: Arc<Mutex<Vec<Reply>>>,
    event_fd: i32,
}

impl ReplySender {
    pub fn new(queue: Arc<Mutex<Vec<Reply>>>, event_fd: i32) -> Self {
        Self { queue, event_fd }
    }

    pub fn send(&self, reply: Reply) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(reply);
        }
        syscalls::eventfd_signal(self.event_fd);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Http,
    WebSocket,
}

/// Protocol front-end for the reactor: decodes on the loop thread, hands
/// the decoded batch to the worker pool, and never blocks the loop.
pub struct HttpService {
    ctx: Arc<ServerContext>,
    replies: ReplySender,
    /// Wire protocol per fd. Loop-thread only.
    protocols: RefCell<HashMap<i32, Protocol>>,
}

impl HttpService {
    pub fn new(ctx: Arc<ServerContext>, replies: ReplySender) -> Self {
        Self {
            ctx,
            replies,
            protocols: RefCell::new(HashMap::new()),
        }
    }

    /// Message callback for every connection. Decoding happens here so
    /// partial bytes stay in the connection's input buffer; dispatch and
    /// encoding go to the pool as one job per batch, which keeps responses
    /// within a batch ordered.
    pub fn on_message(&self, conn: &ConnRef, buf: &mut Buffer) {
        let (fd, peer) = {
            let c = conn.borrow();
            (c.fd(), c.peer_addr())
        };
        let protocol = *self
            .protocols
            .borrow()
            .get(&fd)
            .unwrap_or(&Protocol::Http);

        match protocol {
            Protocol::Http => {
                let mut requests = HttpCodec::decode(buf, Some(peer));
                if requests.is_empty() {
                    return;
                }
                for req in &mut requests {
                    req.fd = fd;
                }

                // An Upgrade request flips the framing for everything that
                // arrives after it. Handshake negotiation is up to the
                // application handler.
                if requests.iter().any(is_upgrade_request) {
                    debug!("fd {} switching to websocket framing", fd);
                    self.protocols.borrow_mut().insert(fd, Protocol::WebSocket);
                }

                let ctx = Arc::clone(&self.ctx);
                let replies = self.replies.clone();
                self.ctx.workers.detach(move || {
                    for mut req in requests {
                        let keep_alive = req.keep_alive();
                        let mut resp = ctx.dispatcher.dispatch(&mut req, &ctx.sessions);
                        resolve_file_body(&mut resp);
                        let data = HttpCodec::encode(&resp, keep_alive);
                        replies.send(Reply {
                            fd,
                            data,
                            close_after: !keep_alive,
                        });
                    }
                });
            }
            Protocol::WebSocket => {
                let frames = WebSocketCodec::decode(buf);
                if frames.is_empty() {
                    return;
                }

                let ctx = Arc::clone(&self.ctx);
                let replies = self.replies.clone();
                self.ctx.workers.detach(move || {
                    for frame in frames {
                        match frame.opcode {
                            WsOpcode::Ping => {
                                replies.send(Reply {
                                    fd,
                                    data: WebSocketCodec::encode(&pong_for(&frame)),
                                    close_after: false,
                                });
                            }
                            WsOpcode::Close => {
                                replies.send(Reply {
                                    fd,
                                    data: WebSocketCodec::encode(&WebSocketFrame::close()),
                                    close_after: true,
                                });
                            }
                            _ => {
                                let out =
                                    ctx.dispatcher.dispatch_websocket(&frame, fd, &ctx.sessions);
                                for (target_fd, out_frame) in out {
                                    replies.send(Reply {
                                        fd: target_fd,
                                        data: WebSocketCodec::encode(&out_frame),
                                        close_after: false,
                                    });
                                }
                            }
                        }
                    }
                });
            }
        }
    }

    /// Close callback bookkeeping.
    pub fn on_close(&self, fd: i32) {
        self.protocols.borrow_mut().remove(&fd);
    }
}

/// Answer a Ping with its payload echoed back. Server frames are never
/// masked (RFC 6455 §5.1), whatever the incoming frame looked like.
fn pong_for(ping: &WebSocketFrame) -> WebSocketFrame {
    WebSocketFrame {
        fin: true,
        opcode: WsOpcode::Pong,
        masked: false,
        masking_key: [0; 4],
        payload: ping.payload.clone(),
    }
}

fn is_upgrade_request(req: &HttpRequest) -> bool {
    req.get_header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// A handler may answer with a file path instead of in-memory bytes; the
/// read happens here, on a worker thread, never on the loop.
fn resolve_file_body(resp: &mut HttpResponse) {
    let Some(path) = resp.file_path.take() else {
        return;
    };
    match fs::read(&path) {
        Ok(bytes) => resp.body = bytes,
        Err(e) => {
            warn!("cannot read {}: {}", path, e);
            *resp = Dispatcher::not_found();
        }
    }
}

/// Serves files below a root directory. Registered by the application when
/// a static root is configured.
pub struct StaticFileHandler {
    root: PathBuf,
}

impl StaticFileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { root: root.into() })
    }
}

impl Handler for StaticFileHandler {
    fn name(&self) -> &str {
        "static-files"
    }

    fn supported_methods(&self) -> Vec<Method> {
        vec![Method::Get]
    }

    fn path_patterns(&self) -> Vec<String> {
        vec!["/*".to_string()]
    }

    fn handle_http(
        &self,
        req: &HttpRequest,
        _sessions: &SessionManager,
    ) -> MazurkaResult<HttpResponse> {
        if req.path.contains("..") {
            return Ok(HttpResponse::new(StatusCode::Forbidden));
        }

        let relative = match req.path.as_str() {
            "/" => "index.html",
            p => p.trim_start_matches('/'),
        };
        let full = self.root.join(relative);
        if !full.is_file() {
            return Ok(Dispatcher::not_found());
        }

        let mut resp = HttpResponse::ok();
        resp.set_header("Content-Type", mime_for(&full));
        resp.set_header("Cache-Control", "max-age=3600");
        resp.file_path = full
            .to_str()
            .map(str::to_string)
            .ok_or_else(|| MazurkaError::Other("non-UTF-8 static path".to_string()))?
            .into();
        Ok(resp)
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_table() {
        assert_eq!(mime_for(Path::new("a/site.HTML")), "text/html; charset=utf-8");
        assert_eq!(mime_for(Path::new("a/app.js")), "application/javascript; charset=utf-8");
        assert_eq!(mime_for(Path::new("a/logo.png")), "image/png");
        assert_eq!(mime_for(Path::new("a/blob.bin")), "application/octet-stream");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_static_handler_rejects_traversal() {
        let handler = StaticFileHandler::new("/tmp");
        let sessions = SessionManager::new();
        let mut req = HttpRequest::new();
        req.method = Method::Get;
        req.path = "/../etc/passwd".to_string();
        let resp = handler.handle_http(&req, &sessions).unwrap();
        assert_eq!(resp.status, StatusCode::Forbidden);
    }

    #[test]
    fn test_static_handler_serves_existing_file() {
        let dir = std::env::temp_dir().join("mazurka_static_test");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("index.html"), "<h1>home</h1>").unwrap();

        let handler = StaticFileHandler::new(&dir);
        let sessions = SessionManager::new();
        let mut req = HttpRequest::new();
        req.method = Method::Get;
        req.path = "/".to_string();

        let mut resp = handler.handle_http(&req, &sessions).unwrap();
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(resp.get_header("Content-Type"), Some("text/html; charset=utf-8"));
        assert_eq!(resp.get_header("Cache-Control"), Some("max-age=3600"));

        resolve_file_body(&mut resp);
        assert_eq!(resp.body, b"<h1>home</h1>");
        assert!(resp.file_path.is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_static_handler_missing_file_is_404() {
        let handler = StaticFileHandler::new(std::env::temp_dir());
        let sessions = SessionManager::new();
        let mut req = HttpRequest::new();
        req.method = Method::Get;
        req.path = "/no_such_file_anywhere.css".to_string();
        let resp = handler.handle_http(&req, &sessions).unwrap();
        assert_eq!(resp.status, StatusCode::NotFound);
    }

    #[test]
    fn test_pong_is_never_masked() {
        let ping = WebSocketFrame {
            fin: true,
            opcode: WsOpcode::Ping,
            masked: true,
            masking_key: [0x11, 0x22, 0x33, 0x44],
            payload: b"are you there".to_vec(),
        };
        let pong = pong_for(&ping);
        assert_eq!(pong.opcode, WsOpcode::Pong);
        assert!(!pong.masked);
        assert_eq!(pong.payload, ping.payload);

        let bytes = crate::ws_codec::WebSocketCodec::encode(&pong);
        assert_eq!(bytes[1] & 0x80, 0, "mask bit must be clear");
        assert_eq!(&bytes[2..], b"are you there");
    }

    #[test]
    fn test_upgrade_request_detection() {
        let mut req = HttpRequest::new();
        assert!(!is_upgrade_request(&req));
        req.headers
            .insert("upgrade".to_string(), "WebSocket".to_string());
        assert!(is_upgrade_request(&req));
    }
}
