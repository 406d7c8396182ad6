//! mazurka is a from-scratch, single-threaded epoll reactor with HTTP/1.1
//! and WebSocket framing, built for chat-style servers.
//!
//! The engine is layered bottom-up:
//! - [`syscalls`] wraps the raw libc surface (sockets, epoll, eventfd).
//! - [`buffer`] is the elastic read/write buffer every connection owns.
//! - [`channel`], [`event_loop`], [`acceptor`], [`connection`] form the
//!   reactor: one thread, level-triggered epoll, callbacks per readiness.
//! - [`http_codec`] and [`ws_codec`] turn buffered bytes into messages and
//!   back, tolerating arbitrarily fragmented input.
//! - [`dispatcher`] routes requests to [`dispatcher::Handler`]s;
//!   [`session`] tracks per-connection and per-user state.
//! - [`worker_pool`], [`resource_pool`], [`config`], [`service`] and
//!   [`bootstrap`] wrap the reactor into a runnable server: blocking work
//!   runs on the pool, replies marshal back over an eventfd.

pub mod acceptor;
pub mod bootstrap;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod http_codec;
pub mod message;
pub mod resource_pool;
pub mod service;
pub mod session;
pub mod syscalls;
pub mod worker_pool;
pub mod ws_codec;

pub use bootstrap::Bootstrap;
pub use buffer::Buffer;
pub use config::Config;
pub use dispatcher::{Dispatcher, FnHandler, Handler};
pub use error::{MazurkaError, MazurkaResult};
pub use event_loop::QuitHandle;
pub use http_codec::HttpCodec;
pub use message::{
    HttpRequest, HttpResponse, Message, Method, StatusCode, WebSocketFrame, WsOpcode,
};
pub use resource_pool::{PoolGuard, PoolOptions, ResourcePool};
pub use service::{HttpService, Reply, ReplySender, ServerContext, StaticFileHandler};
pub use session::{Session, SessionManager, SessionRef};
pub use worker_pool::WorkerPool;
pub use ws_codec::WebSocketCodec;
