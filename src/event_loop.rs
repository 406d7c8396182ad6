// src/event_loop.rs
use crate::channel::{self, ChannelRef};
use crate::error::MazurkaResult;
use crate::syscalls::{self, Epoll};
use log::{debug, error, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const MAX_EVENTS: usize = 1024;
const POLL_TIMEOUT_MS: i32 = 1000;

/// Thin wrapper over the epoll set plus an fd-keyed channel table.
///
/// The table holds `Weak` references: channels are owned by their
/// Acceptor/Connection, and a stale entry (owner dropped without an explicit
/// removal) is simply skipped and purged when its fd next fires.
pub struct Poller {
    epoll: Epoll,
    channels: RefCell<HashMap<i32, Weak<RefCell<channel::Channel>>>>,
}

impl Poller {
    pub fn new() -> MazurkaResult<Rc<Self>> {
        Ok(Rc::new(Self {
            epoll: Epoll::new()?,
            channels: RefCell::new(HashMap::new()),
        }))
    }

    /// Register or re-register a channel's interest set. The epoll token is
    /// the fd itself.
    pub fn update_channel(&self, fd: i32, ch: Weak<RefCell<channel::Channel>>, events: u32) {
        let known = self.channels.borrow().contains_key(&fd);
        let res = if known {
            self.epoll.modify(fd, fd as u64, events)
        } else {
            self.epoll.add(fd, fd as u64, events)
        };
        if let Err(e) = res {
            error!("epoll_ctl failed for fd {}: {}", fd, e);
            return;
        }
        self.channels.borrow_mut().insert(fd, ch);
    }

    pub fn remove_channel(&self, fd: i32) {
        if self.channels.borrow_mut().remove(&fd).is_some() {
            if let Err(e) = self.epoll.delete(fd) {
                error!("epoll_ctl(DEL) failed for fd {}: {}", fd, e);
            }
        }
    }

    /// Block up to `timeout_ms` and collect the channels whose descriptors
    /// are ready, with their `revents` set.
    pub fn poll(&self, timeout_ms: i32) -> MazurkaResult<Vec<ChannelRef>> {
        let mut events = vec![syscalls::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = self.epoll.wait(&mut events, timeout_ms)?;

        let mut active = Vec::with_capacity(n);
        let mut stale = Vec::new();
        {
            let channels = self.channels.borrow();
            for ev in &events[..n] {
                let fd = ev.u64 as i32;
                match channels.get(&fd).and_then(Weak::upgrade) {
                    Some(ch) => {
                        ch.borrow_mut().set_revents(ev.events);
                        active.push(ch);
                    }
                    None => {
                        trace!("dropping event for stale fd {}", fd);
                        stale.push(fd);
                    }
                }
            }
        }
        for fd in stale {
            self.remove_channel(fd);
        }
        Ok(active)
    }
}

/// Shared stop flag for an [`EventLoop`]. Cloneable and thread-safe, so a
/// signal handler or another thread can ask the loop to wind down.
#[derive(Clone)]
pub struct QuitHandle {
    quit: Arc<AtomicBool>,
}

impl QuitHandle {
    pub fn stop(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }
}

/// Single-threaded poll-and-dispatch loop. All channel callbacks run on the
/// thread that calls [`run`](EventLoop::run).
pub struct EventLoop {
    poller: Rc<Poller>,
    quit: Arc<AtomicBool>,
}

impl EventLoop {
    pub fn new() -> MazurkaResult<Self> {
        Ok(Self {
            poller: Poller::new()?,
            quit: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn poller(&self) -> Rc<Poller> {
        Rc::clone(&self.poller)
    }

    pub fn quit_handle(&self) -> QuitHandle {
        QuitHandle {
            quit: Arc::clone(&self.quit),
        }
    }

    /// Run until the quit flag is set. The bounded poll timeout keeps the
    /// flag check responsive even when the server is idle.
    pub fn run(&self) {
        debug!("event loop started");
        while !self.quit.load(Ordering::SeqCst) {
            let ready = match self.poller.poll(POLL_TIMEOUT_MS) {
                Ok(ready) => ready,
                Err(e) => {
                    error!("poll failed: {}", e);
                    continue;
                }
            };
            for ch in &ready {
                channel::handle_event(ch);
            }
        }
        debug!("event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::syscalls;
    use std::cell::Cell;

    #[test]
    fn test_poll_reports_readable_eventfd() {
        let poller = Poller::new().unwrap();
        let efd = syscalls::create_eventfd().unwrap();

        let ch = Channel::new(efd, Rc::clone(&poller));
        let fired = Rc::new(Cell::new(false));
        {
            let fired = Rc::clone(&fired);
            ch.borrow_mut().set_read_callback(Rc::new(move || {
                fired.set(true);
            }));
        }
        ch.borrow_mut().enable_reading();

        // Nothing pending yet.
        let ready = poller.poll(0).unwrap();
        assert!(ready.is_empty());

        syscalls::eventfd_signal(efd);
        let ready = poller.poll(0).unwrap();
        assert_eq!(ready.len(), 1);
        for r in &ready {
            channel::handle_event(r);
        }
        assert!(fired.get());

        ch.borrow_mut().remove_from_poller();
        syscalls::close_fd(efd);
    }

    #[test]
    fn test_stale_channel_is_purged() {
        let poller = Poller::new().unwrap();
        let efd = syscalls::create_eventfd().unwrap();

        {
            let ch = Channel::new(efd, Rc::clone(&poller));
            ch.borrow_mut().enable_reading();
            // Owner dropped without remove_from_poller.
        }

        syscalls::eventfd_signal(efd);
        let ready = poller.poll(0).unwrap();
        assert!(ready.is_empty());
        assert!(poller.channels.borrow().is_empty());

        syscalls::close_fd(efd);
    }

    #[test]
    fn test_quit_handle_stops_loop() {
        let event_loop = EventLoop::new().unwrap();
        let quit = event_loop.quit_handle();
        quit.stop();
        // Returns immediately instead of blocking on the poll timeout.
        event_loop.run();
    }
}
