// src/channel.rs
use crate::event_loop::Poller;
use log::warn;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

pub type ChannelRef = Rc<RefCell<Channel>>;

pub type EventCallback = Rc<dyn Fn()>;

/// Per-descriptor registration: which events we want, which fired last poll,
/// and what to run for each. One Channel per fd, owned by whoever owns the
/// fd (Acceptor, Connection, the reply-queue eventfd).
///
/// The poller only keeps a `Weak` back-reference, so dropping the owner
/// unregisters the descriptor without any explicit bookkeeping beyond
/// `remove_from_poller`.
pub struct Channel {
    fd: i32,
    events: u32,
    revents: u32,
    read_cb: Option<EventCallback>,
    write_cb: Option<EventCallback>,
    poller: Rc<Poller>,
    self_weak: Weak<RefCell<Channel>>,
    registered: bool,
}

impl Channel {
    pub fn new(fd: i32, poller: Rc<Poller>) -> ChannelRef {
        Rc::new_cyclic(|weak| {
            RefCell::new(Channel {
                fd,
                events: 0,
                revents: 0,
                read_cb: None,
                write_cb: None,
                poller,
                self_weak: weak.clone(),
                registered: false,
            })
        })
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn events(&self) -> u32 {
        self.events
    }

    pub fn set_revents(&mut self, revents: u32) {
        self.revents = revents;
    }

    pub fn set_read_callback(&mut self, cb: EventCallback) {
        self.read_cb = Some(cb);
    }

    pub fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_cb = Some(cb);
    }

    pub fn enable_reading(&mut self) {
        self.update_events(self.events | libc::EPOLLIN as u32);
    }

    pub fn disable_reading(&mut self) {
        self.update_events(self.events & !(libc::EPOLLIN as u32));
    }

    pub fn enable_writing(&mut self) {
        self.update_events(self.events | libc::EPOLLOUT as u32);
    }

    pub fn disable_writing(&mut self) {
        self.update_events(self.events & !(libc::EPOLLOUT as u32));
    }

    pub fn is_writing(&self) -> bool {
        self.events & libc::EPOLLOUT as u32 != 0
    }

    /// Drop the descriptor from the epoll set. Idempotent; called before the
    /// owning connection closes its fd.
    pub fn remove_from_poller(&mut self) {
        if self.registered {
            self.poller.remove_channel(self.fd);
            self.registered = false;
            self.events = 0;
        }
    }

    fn update_events(&mut self, new_events: u32) {
        if self.registered && new_events == self.events {
            return;
        }
        self.events = new_events;
        self.poller
            .update_channel(self.fd, self.self_weak.clone(), new_events);
        self.registered = true;
    }
}

/// Dispatch the ready events recorded by the last poll.
///
/// Callbacks are cloned out of the borrow before they run, so a callback is
/// free to re-borrow the channel (to disable writing, say) without
/// panicking.
pub fn handle_event(ch: &ChannelRef) {
    let (fd, revents, read_cb, write_cb) = {
        let c = ch.borrow();
        (c.fd, c.revents, c.read_cb.clone(), c.write_cb.clone())
    };

    // Errors and hangups surface through the read path: the next read
    // returns 0 or an error and the connection tears down from there.
    let readable = libc::EPOLLIN as u32 | libc::EPOLLERR as u32 | libc::EPOLLHUP as u32;

    if revents & readable != 0 {
        match read_cb {
            Some(cb) => cb(),
            None => warn!("fd {} readable but no read callback set", fd),
        }
    }

    if revents & libc::EPOLLOUT as u32 != 0 {
        match write_cb {
            Some(cb) => cb(),
            None => warn!("fd {} writable but no write callback set", fd),
        }
    }
}
