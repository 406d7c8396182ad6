// src/acceptor.rs
use crate::channel::{Channel, ChannelRef};
use crate::error::MazurkaResult;
use crate::event_loop::Poller;
use crate::syscalls;
use log::{debug, warn};
use std::net::SocketAddr;
use std::rc::Rc;

pub type NewConnectionCallback = Rc<dyn Fn(i32, SocketAddr)>;

/// Owns the listening socket and hands accepted descriptors to the server
/// through the new-connection callback.
pub struct Acceptor {
    listen_fd: i32,
    channel: ChannelRef,
    port: u16,
}

impl Acceptor {
    pub fn new(
        host: &str,
        port: u16,
        poller: Rc<Poller>,
        on_new_connection: NewConnectionCallback,
    ) -> MazurkaResult<Self> {
        let listen_fd = syscalls::create_listen_socket(host, port)?;
        let bound_port = syscalls::local_port(listen_fd)?;
        debug!("listening on {}:{} (fd {})", host, bound_port, listen_fd);

        let channel = Channel::new(listen_fd, poller);
        channel.borrow_mut().set_read_callback(Rc::new(move || {
            accept_one(listen_fd, &on_new_connection);
        }));
        channel.borrow_mut().enable_reading();

        Ok(Self {
            listen_fd,
            channel,
            port: bound_port,
        })
    }

    /// The port actually bound; differs from the requested one when that
    /// was 0.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Accept a single pending connection. Level-triggered polling re-notifies
/// when more are queued, so one accept per readiness keeps the loop fair
/// under an accept storm.
fn accept_one(listen_fd: i32, on_new_connection: &NewConnectionCallback) {
    match syscalls::accept_connection(listen_fd) {
        Ok(Some((fd, peer))) => {
            debug!("accepted fd {} from {}", fd, peer);
            on_new_connection(fd, peer);
        }
        Ok(None) => {}
        Err(e) => {
            // Transient (EMFILE, ECONNABORTED, ...): log and keep serving.
            warn!("accept on fd {} failed: {}", listen_fd, e);
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.borrow_mut().remove_from_poller();
        syscalls::close_fd(self.listen_fd);
    }
}
