// src/bootstrap.rs
use crate::acceptor::Acceptor;
use crate::channel::{Channel, ChannelRef};
use crate::connection::{self, Connection, ConnRef};
use crate::error::MazurkaResult;
use crate::event_loop::{EventLoop, QuitHandle};
use crate::service::{HttpService, Reply, ReplySender, ServerContext};
use crate::syscalls;
use log::{debug, info};
use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

/// Assembles the whole engine: event loop, acceptor, connection table,
/// service, and the worker→loop reply path. Lives entirely on the loop
/// thread (it is not `Send`); only [`QuitHandle`] and the context escape.
pub struct Bootstrap {
    event_loop: EventLoop,
    acceptor: Acceptor,
    connections: Rc<RefCell<HashMap<i32, ConnRef>>>,
    reply_channel: ChannelRef,
    reply_event_fd: i32,
}

impl Bootstrap {
    pub fn new(ctx: Arc<ServerContext>) -> MazurkaResult<Self> {
        let event_loop = EventLoop::new()?;
        let poller = event_loop.poller();

        let reply_event_fd = syscalls::create_eventfd()?;
        let reply_queue: Arc<Mutex<Vec<Reply>>> = Arc::new(Mutex::new(Vec::new()));
        let replies = ReplySender::new(Arc::clone(&reply_queue), reply_event_fd);

        let service = Rc::new(HttpService::new(Arc::clone(&ctx), replies));
        let connections: Rc<RefCell<HashMap<i32, ConnRef>>> =
            Rc::new(RefCell::new(HashMap::new()));

        // Accept path: connection + session in, wired to the service.
        let host = ctx.config.host.clone();
        let port = ctx.config.port;
        let acceptor = {
            let poller = Rc::clone(&poller);
            let connections = Rc::clone(&connections);
            let ctx = Arc::clone(&ctx);
            let service = Rc::clone(&service);
            Acceptor::new(
                &host,
                port,
                event_loop.poller(),
                Rc::new(move |fd, peer| {
                    let conn = Connection::new(fd, peer, Rc::clone(&poller));
                    ctx.sessions.add(fd, peer);
                    {
                        let service = Rc::clone(&service);
                        conn.borrow_mut().set_message_callback(Rc::new(
                            move |c: &ConnRef, buf: &mut crate::buffer::Buffer| {
                                service.on_message(c, buf);
                            },
                        ));
                    }
                    {
                        let connections = Rc::clone(&connections);
                        let ctx = Arc::clone(&ctx);
                        let service = Rc::clone(&service);
                        conn.borrow_mut().set_close_callback(Box::new(move |c| {
                            let fd = c.borrow().fd();
                            ctx.sessions.remove(fd);
                            service.on_close(fd);
                            connections.borrow_mut().remove(&fd);
                        }));
                    }
                    connections.borrow_mut().insert(fd, Rc::clone(&conn));
                    connection::establish(&conn);
                }),
            )?
        };

        // Reply path: eventfd wakes the loop, which drains the queue and
        // delivers each reply to its connection.
        let reply_channel = Channel::new(reply_event_fd, poller);
        {
            let connections = Rc::clone(&connections);
            reply_channel.borrow_mut().set_read_callback(Rc::new(move || {
                syscalls::eventfd_drain(reply_event_fd);
                let batch = match reply_queue.lock() {
                    Ok(mut queue) => mem::take(&mut *queue),
                    Err(_) => return,
                };
                for reply in batch {
                    let conn = connections.borrow().get(&reply.fd).cloned();
                    match conn {
                        Some(conn) => {
                            connection::send(&conn, &reply.data);
                            if reply.close_after {
                                connection::shutdown(&conn);
                            }
                        }
                        None => debug!("reply for dead fd {} dropped", reply.fd),
                    }
                }
            }));
        }
        reply_channel.borrow_mut().enable_reading();

        info!("listening on {}:{}", host, acceptor.port());

        Ok(Self {
            event_loop,
            acceptor,
            connections,
            reply_channel,
            reply_event_fd,
        })
    }

    /// The bound port (useful when configured with port 0).
    pub fn port(&self) -> u16 {
        self.acceptor.port()
    }

    pub fn quit_handle(&self) -> QuitHandle {
        self.event_loop.quit_handle()
    }

    /// Run the event loop until the quit handle fires, then drop all live
    /// connections.
    pub fn start(&self) {
        self.event_loop.run();
        let n = self.connections.borrow().len();
        if n > 0 {
            debug!("dropping {} live connections on shutdown", n);
        }
        self.connections.borrow_mut().clear();
    }
}

impl Drop for Bootstrap {
    fn drop(&mut self) {
        self.reply_channel.borrow_mut().remove_from_poller();
        syscalls::close_fd(self.reply_event_fd);
    }
}
