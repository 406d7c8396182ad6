//! Demo chat server: HTTP endpoints for health and login, a broadcast
//! WebSocket room, and optional static file serving.

use log::{error, info};
use mazurka::{
    Bootstrap, Config, Dispatcher, FnHandler, Handler, HttpRequest, HttpResponse, MazurkaError,
    MazurkaResult, Method, ServerContext, SessionManager, StaticFileHandler, WebSocketFrame,
};
use serde_json::json;
use std::process;
use std::sync::Arc;

/// Broadcasts every text frame to all connected sessions, prefixed with the
/// sender's user id when the session is authenticated.
struct ChatRoomHandler;

impl Handler for ChatRoomHandler {
    fn name(&self) -> &str {
        "chat-room"
    }

    fn supported_methods(&self) -> Vec<Method> {
        vec![Method::Get]
    }

    fn path_patterns(&self) -> Vec<String> {
        vec!["/chat".to_string()]
    }

    fn handle_http(
        &self,
        _req: &HttpRequest,
        sessions: &SessionManager,
    ) -> MazurkaResult<HttpResponse> {
        Ok(HttpResponse::json(
            json!({ "online": sessions.len() }).to_string(),
        ))
    }

    fn handle_websocket(
        &self,
        frame: &WebSocketFrame,
        fd: i32,
        sessions: &SessionManager,
    ) -> Vec<(i32, WebSocketFrame)> {
        let Some(text) = frame.payload_as_str() else {
            return Vec::new();
        };
        let sender = sessions
            .get(fd)
            .and_then(|s| s.lock().ok().and_then(|s| s.user_id()));
        let line = match sender {
            Some(uid) => format!("{}: {}", uid, text),
            None => format!("anonymous: {}", text),
        };
        sessions
            .all_fds()
            .into_iter()
            .map(|target| (target, WebSocketFrame::text(line.clone())))
            .collect()
    }
}

fn build_dispatcher(config: &Config) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();

    dispatcher.register(FnHandler::new(
        "ping",
        vec![Method::Get],
        vec!["/ping"],
        |_req, _sessions| Ok(HttpResponse::html("pong")),
    ));

    dispatcher.register(FnHandler::new(
        "login",
        vec![Method::Post],
        vec!["/login"],
        |req, sessions| {
            let body: serde_json::Value = serde_json::from_slice(&req.body)
                .map_err(|e| MazurkaError::Handler(format!("invalid login body: {}", e)))?;
            let user_id = body["user_id"]
                .as_i64()
                .ok_or_else(|| MazurkaError::Handler("missing user_id".to_string()))?;
            if sessions.bind_user(req.fd, user_id) {
                Ok(HttpResponse::json(
                    json!({ "ok": true, "user_id": user_id }).to_string(),
                ))
            } else {
                Err(MazurkaError::Handler("no session for connection".to_string()))
            }
        },
    ));

    dispatcher.register(Arc::new(ChatRoomHandler));

    if !config.static_root.is_empty() {
        dispatcher.register(StaticFileHandler::new(config.static_root.clone()));
    }

    dispatcher
}

fn run() -> MazurkaResult<()> {
    let config_path = std::env::args().nth(1);
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => match Config::load("config.json") {
            Ok(config) => config,
            Err(e) => {
                // Logger is not up yet; this has to go to stderr directly.
                eprintln!("chatd: {}; using defaults", e);
                Config::default()
            }
        },
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.log_level),
    )
    .init();

    let dispatcher = build_dispatcher(&config);
    let ctx = ServerContext::new(dispatcher, config);
    let bootstrap = Bootstrap::new(ctx)?;

    let quit = bootstrap.quit_handle();
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        quit.stop();
    })
    .map_err(|e| MazurkaError::Other(format!("cannot install signal handler: {}", e)))?;

    bootstrap.start();
    info!("bye");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("fatal: {}", e);
        eprintln!("chatd: {}", e);
        process::exit(1);
    }
}
