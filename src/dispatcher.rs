// src/dispatcher.rs
use crate::error::MazurkaResult;
use crate::message::{HttpRequest, HttpResponse, Method, StatusCode, WebSocketFrame};
use crate::session::SessionManager;
use log::{debug, error};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Cache entries are keyed by concrete path, which clients choose; a full
/// cache stops admitting rather than growing without bound.
const ROUTE_CACHE_MAX: usize = 1024;

/// An application endpoint. Implementations must be thread-safe: dispatch
/// runs on worker threads.
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    fn supported_methods(&self) -> Vec<Method>;

    /// Patterns this handler owns. Three forms:
    /// - exact: `/login`
    /// - prefix: `/static/*` (matches everything below the prefix)
    /// - parameterized: `/rooms/{id}/messages` (each `{name}` captures one
    ///   non-empty segment into the request's params)
    fn path_patterns(&self) -> Vec<String>;

    fn handle_http(
        &self,
        req: &HttpRequest,
        sessions: &SessionManager,
    ) -> MazurkaResult<HttpResponse>;

    /// Frames to deliver, keyed by target fd, so a handler can broadcast.
    /// Default: ignore the frame.
    fn handle_websocket(
        &self,
        _frame: &WebSocketFrame,
        _fd: i32,
        _sessions: &SessionManager,
    ) -> Vec<(i32, WebSocketFrame)> {
        Vec::new()
    }
}

/// Adapter so simple routes can be closures instead of trait impls.
pub struct FnHandler<F> {
    name: String,
    methods: Vec<Method>,
    patterns: Vec<String>,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&HttpRequest, &SessionManager) -> MazurkaResult<HttpResponse> + Send + Sync,
{
    pub fn new(name: &str, methods: Vec<Method>, patterns: Vec<&str>, func: F) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            methods,
            patterns: patterns.into_iter().map(str::to_string).collect(),
            func,
        })
    }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&HttpRequest, &SessionManager) -> MazurkaResult<HttpResponse> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_methods(&self) -> Vec<Method> {
        self.methods.clone()
    }

    fn path_patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    fn handle_http(
        &self,
        req: &HttpRequest,
        sessions: &SessionManager,
    ) -> MazurkaResult<HttpResponse> {
        (self.func)(req, sessions)
    }
}

/// Routes requests to handlers. Matching is path-first: a path that some
/// handler owns but with the wrong method yields 405 with an Allow header,
/// not 404.
pub struct Dispatcher {
    handlers: Vec<Arc<dyn Handler>>,
    /// Runs when no pattern matches the path; absent, a plain 404 page is
    /// synthesized.
    default_404: Option<Arc<dyn Handler>>,
    /// `path_METHOD` -> resolved handler index plus the path params that
    /// matching produced. The key holds the concrete path, so cached params
    /// are exact. Bounded: parameterized routes make the key space
    /// client-controlled.
    route_cache: Mutex<HashMap<String, (usize, HashMap<String, String>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            default_404: None,
            route_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        debug!("registered handler '{}'", handler.name());
        self.handlers.push(handler);
    }

    pub fn set_default_404(&mut self, handler: Arc<dyn Handler>) {
        debug!("registered default-404 handler '{}'", handler.name());
        self.default_404 = Some(handler);
    }

    /// Route and run. Handler failures and panics both become 500s; the
    /// server never dies on a bad handler.
    pub fn dispatch(&self, req: &mut HttpRequest, sessions: &SessionManager) -> HttpResponse {
        let cache_key = format!("{}_{}", req.path, req.method.as_str());
        let cached = self
            .route_cache
            .lock()
            .ok()
            .and_then(|c| c.get(&cache_key).cloned());

        let (idx, params) = match cached {
            Some(hit) => hit,
            None => match self.find_handler(req) {
                RouteMatch::Found { idx, params } => {
                    if let Ok(mut cache) = self.route_cache.lock() {
                        if cache.len() < ROUTE_CACHE_MAX {
                            cache.insert(cache_key, (idx, params.clone()));
                        }
                    }
                    (idx, params)
                }
                RouteMatch::WrongMethod { allowed } => {
                    let mut resp = HttpResponse::new(StatusCode::MethodNotAllowed);
                    resp.set_header("Allow", &allowed.join(", "));
                    return resp;
                }
                RouteMatch::NotFound => {
                    return match &self.default_404 {
                        Some(handler) => run_guarded(handler.name(), || {
                            handler.handle_http(req, sessions)
                        }),
                        None => Self::not_found(),
                    };
                }
            },
        };

        req.params.extend(params);
        let handler = &self.handlers[idx];
        run_guarded(handler.name(), || handler.handle_http(req, sessions))
    }

    /// Route a frame to every handler that supports WebSocket traffic and
    /// collect the outbound frames they produce.
    pub fn dispatch_websocket(
        &self,
        frame: &WebSocketFrame,
        fd: i32,
        sessions: &SessionManager,
    ) -> Vec<(i32, WebSocketFrame)> {
        let mut out = Vec::new();
        for handler in &self.handlers {
            let produced = panic::catch_unwind(AssertUnwindSafe(|| {
                handler.handle_websocket(frame, fd, sessions)
            }));
            match produced {
                Ok(frames) => out.extend(frames),
                Err(_) => error!("handler '{}' panicked on websocket frame", handler.name()),
            }
        }
        out
    }

    fn find_handler(&self, req: &HttpRequest) -> RouteMatch {
        let mut allowed: Vec<&'static str> = Vec::new();
        let mut path_matched = false;

        for (idx, handler) in self.handlers.iter().enumerate() {
            for pattern in handler.path_patterns() {
                let mut params = HashMap::new();
                if !match_pattern(&pattern, &req.path, &mut params) {
                    continue;
                }
                path_matched = true;
                let methods = handler.supported_methods();
                if methods.contains(&req.method) {
                    return RouteMatch::Found { idx, params };
                }
                for m in methods {
                    if !allowed.contains(&m.as_str()) {
                        allowed.push(m.as_str());
                    }
                }
            }
        }

        if path_matched {
            RouteMatch::WrongMethod {
                allowed: allowed.into_iter().map(str::to_string).collect(),
            }
        } else {
            RouteMatch::NotFound
        }
    }

    pub fn not_found() -> HttpResponse {
        let mut resp = HttpResponse::new(StatusCode::NotFound);
        resp.set_header("Content-Type", "text/html; charset=utf-8");
        resp.body = b"<html><head><title>404 Not Found</title></head>\
                      <body><h1>404 Not Found</h1></body></html>"
            .to_vec();
        resp
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

enum RouteMatch {
    Found {
        idx: usize,
        params: HashMap<String, String>,
    },
    WrongMethod {
        allowed: Vec<String>,
    },
    NotFound,
}

fn run_guarded<F>(name: &str, f: F) -> HttpResponse
where
    F: FnOnce() -> MazurkaResult<HttpResponse>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            error!("handler '{}' failed: {}", name, e);
            let mut resp = HttpResponse::new(StatusCode::InternalServerError);
            resp.set_header("Content-Type", "text/plain; charset=utf-8");
            resp.body = format!("internal error: {}", e).into_bytes();
            resp
        }
        Err(_) => {
            error!("handler '{}' panicked", name);
            let mut resp = HttpResponse::new(StatusCode::InternalServerError);
            resp.set_header("Content-Type", "text/plain; charset=utf-8");
            resp.body = b"internal error".to_vec();
            resp
        }
    }
}

/// Segment-wise pattern match. `{name}` captures one non-empty segment; a
/// trailing `*` matches any remainder (including none).
fn match_pattern(pattern: &str, path: &str, params: &mut HashMap<String, String>) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path.starts_with(prefix)
            && (path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/');
    }

    let mut pat_segs = pattern.split('/');
    let mut path_segs = path.split('/');

    loop {
        match (pat_segs.next(), path_segs.next()) {
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
            (Some(p), Some(s)) => {
                if let Some(name) = p.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                    if s.is_empty() {
                        return false;
                    }
                    params.insert(name.to_string(), s.to_string());
                } else if p != s {
                    return false;
                }
            }
        }
    }
}
