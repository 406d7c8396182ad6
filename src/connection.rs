// src/connection.rs
use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelRef};
use crate::event_loop::Poller;
use crate::syscalls;
use log::{debug, trace, warn};
use std::cell::RefCell;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::rc::Rc;

pub type ConnRef = Rc<RefCell<Connection>>;

/// Runs when a read produces buffered bytes. Receives the connection and its
/// input buffer (moved out for the duration of the call).
pub type MessageCallback = Rc<dyn Fn(&ConnRef, &mut Buffer)>;

/// Runs exactly once when the connection closes, before the fd is released.
pub type CloseCallback = Box<dyn FnOnce(&ConnRef)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

/// One accepted TCP connection: fd, channel, elastic buffers, and a small
/// state machine.
///
/// All methods that react to readiness are associated functions over
/// [`ConnRef`] rather than `&mut self`, because a callback running inside a
/// borrow must not re-enter it.
pub struct Connection {
    fd: i32,
    peer: SocketAddr,
    state: ConnState,
    channel: ChannelRef,
    input: Buffer,
    output: Buffer,
    message_cb: Option<MessageCallback>,
    close_cb: Option<CloseCallback>,
}

impl Connection {
    pub fn new(fd: i32, peer: SocketAddr, poller: Rc<Poller>) -> ConnRef {
        let channel = Channel::new(fd, poller);
        let conn = Rc::new(RefCell::new(Connection {
            fd,
            peer,
            state: ConnState::Connecting,
            channel,
            input: Buffer::new(),
            output: Buffer::new(),
            message_cb: None,
            close_cb: None,
        }));

        {
            let weak = Rc::downgrade(&conn);
            conn.borrow().channel.borrow_mut().set_read_callback(Rc::new(move || {
                if let Some(c) = weak.upgrade() {
                    handle_read(&c);
                }
            }));
        }
        {
            let weak = Rc::downgrade(&conn);
            conn.borrow().channel.borrow_mut().set_write_callback(Rc::new(move || {
                if let Some(c) = weak.upgrade() {
                    handle_write(&c);
                }
            }));
        }

        conn
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.message_cb = Some(cb);
    }

    pub fn set_close_callback(&mut self, cb: CloseCallback) {
        self.close_cb = Some(cb);
    }
}

/// Complete the handshake into `Connected` and start watching for input.
pub fn establish(conn: &ConnRef) {
    let mut c = conn.borrow_mut();
    debug_assert_eq!(c.state, ConnState::Connecting);
    c.state = ConnState::Connected;
    c.channel.borrow_mut().enable_reading();
    trace!("fd {} established ({})", c.fd, c.peer);
}

/// Queue `data` for delivery. Tries a direct write first when nothing is
/// already queued; whatever the kernel does not take is buffered and the
/// channel armed for writability. No-op unless `Connected`.
pub fn send(conn: &ConnRef, data: &[u8]) {
    let mut c = conn.borrow_mut();
    if c.state != ConnState::Connected {
        trace!("fd {} send dropped in state {:?}", c.fd, c.state);
        return;
    }

    let mut written = 0;
    if c.output.readable_bytes() == 0 {
        match syscalls::write_nonblocking(c.fd, data) {
            Ok(n) => written = n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("fd {} write failed: {}", c.fd, e);
                drop(c);
                handle_close(conn);
                return;
            }
        }
    }

    if written < data.len() {
        c.output.append(&data[written..]);
        c.channel.borrow_mut().enable_writing();
    }
}

/// Begin a graceful close: stop accepting sends, drain the output buffer,
/// then half-close the write side so the peer sees EOF.
pub fn shutdown(conn: &ConnRef) {
    let mut c = conn.borrow_mut();
    if c.state != ConnState::Connected {
        return;
    }
    c.state = ConnState::Disconnecting;
    if c.output.readable_bytes() == 0 {
        syscalls::shutdown_write(c.fd);
    }
    // Otherwise handle_write sends the FIN once the buffer drains.
}

/// Readability: pull bytes into the input buffer and run the message
/// callback. Read of 0 means the peer closed; errors other than
/// WouldBlock/Interrupted also tear the connection down.
pub fn handle_read(conn: &ConnRef) {
    let fd = conn.borrow().fd;
    let res = {
        let mut c = conn.borrow_mut();
        let mut input = mem::take(&mut c.input);
        let res = input.read_fd(fd);
        c.input = input;
        res
    };

    match res {
        Ok(0) => {
            trace!("fd {} peer closed", fd);
            handle_close(conn);
        }
        Ok(n) => {
            trace!("fd {} read {} bytes", fd, n);
            let cb = conn.borrow().message_cb.clone();
            if let Some(cb) = cb {
                // Move the buffer out so the callback can borrow the
                // connection freely; partial bytes survive the round trip.
                let mut input = mem::take(&mut conn.borrow_mut().input);
                cb(conn, &mut input);
                conn.borrow_mut().input = input;
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => {
            warn!("fd {} read failed: {}", fd, e);
            handle_close(conn);
        }
    }
}

/// Writability: flush the output buffer. When it drains, stop watching for
/// writability; if a shutdown was pending, send the FIN now.
pub fn handle_write(conn: &ConnRef) {
    let fd = conn.borrow().fd;
    let res = {
        let mut c = conn.borrow_mut();
        let mut output = mem::take(&mut c.output);
        let res = output.write_fd(fd);
        c.output = output;
        res
    };

    match res {
        Ok(n) => {
            trace!("fd {} flushed {} bytes", fd, n);
            let mut c = conn.borrow_mut();
            if c.output.readable_bytes() == 0 {
                c.channel.borrow_mut().disable_writing();
                if c.state == ConnState::Disconnecting {
                    syscalls::shutdown_write(c.fd);
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => {
            warn!("fd {} flush failed: {}", fd, e);
            handle_close(conn);
        }
    }
}

/// Tear the connection down: unregister from the poller and fire the close
/// callback once. Idempotent; the fd itself is released by Drop when the
/// last `ConnRef` goes away.
pub fn handle_close(conn: &ConnRef) {
    let close_cb = {
        let mut c = conn.borrow_mut();
        if c.state == ConnState::Closed {
            return;
        }
        debug!("fd {} closing ({})", c.fd, c.peer);
        c.state = ConnState::Closed;
        c.channel.borrow_mut().remove_from_poller();
        c.close_cb.take()
    };
    if let Some(cb) = close_cb {
        cb(conn);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.channel.borrow_mut().remove_from_poller();
        syscalls::close_fd(self.fd);
        trace!("fd {} released", self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::Poller;
    use std::cell::Cell;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::IntoRawFd;

    fn socket_pair() -> (i32, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server.into_raw_fd(), client, peer)
    }

    #[test]
    fn test_send_before_establish_is_dropped() {
        let poller = Poller::new().unwrap();
        let (fd, mut client, peer) = socket_pair();
        let conn = Connection::new(fd, peer, poller);

        send(&conn, b"too early");
        drop(conn);

        client.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 32];
        // Peer must not receive the dropped payload, only EOF or WouldBlock.
        match client.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
        }
    }

    #[test]
    fn test_send_direct_write_reaches_peer() {
        let poller = Poller::new().unwrap();
        let (fd, mut client, peer) = socket_pair();
        let conn = Connection::new(fd, peer, poller);
        establish(&conn);
        assert_eq!(conn.borrow().state(), ConnState::Connected);

        send(&conn, b"hello");
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_close_callback_fires_once() {
        let poller = Poller::new().unwrap();
        let (fd, _client, peer) = socket_pair();
        let conn = Connection::new(fd, peer, poller);
        establish(&conn);

        let closed = Rc::new(Cell::new(0u32));
        {
            let closed = Rc::clone(&closed);
            conn.borrow_mut()
                .set_close_callback(Box::new(move |_| closed.set(closed.get() + 1)));
        }

        handle_close(&conn);
        handle_close(&conn);
        assert_eq!(closed.get(), 1);
        assert_eq!(conn.borrow().state(), ConnState::Closed);
    }

    #[test]
    fn test_message_callback_sees_read_bytes() {
        use std::io::Write;

        let poller = Poller::new().unwrap();
        let (fd, mut client, peer) = socket_pair();
        let conn = Connection::new(fd, peer, poller);
        establish(&conn);

        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            conn.borrow_mut()
                .set_message_callback(Rc::new(move |_, buf: &mut Buffer| {
                    seen.borrow_mut()
                        .extend_from_slice(&buf.retrieve_all_as_bytes());
                }));
        }

        client.write_all(b"inbound data").unwrap();
        // Give the kernel a beat to make the bytes readable.
        std::thread::sleep(std::time::Duration::from_millis(50));
        handle_read(&conn);
        assert_eq!(seen.borrow().as_slice(), b"inbound data");
    }

    #[test]
    fn test_shutdown_sends_fin_when_drained() {
        let poller = Poller::new().unwrap();
        let (fd, mut client, peer) = socket_pair();
        let conn = Connection::new(fd, peer, poller);
        establish(&conn);

        shutdown(&conn);
        assert_eq!(conn.borrow().state(), ConnState::Disconnecting);

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }
}
