// src/session.rs
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

/// Per-connection application state. Holds the connection's fd rather than
/// the connection itself, so sessions can cross threads and never keep a
/// dead connection alive.
pub struct Session {
    fd: i32,
    peer: SocketAddr,
    user_id: Option<i64>,
    data: HashMap<String, Value>,
}

impl Session {
    pub fn new(fd: i32, peer: SocketAddr) -> Self {
        Self {
            fd,
            peer,
            user_id: None,
            data: HashMap::new(),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }
}

pub type SessionRef = Arc<Mutex<Session>>;

struct Inner {
    by_fd: HashMap<i32, SessionRef>,
    /// A user may be logged in from several connections. Entries are weak
    /// and pruned lazily on lookup, so a closed connection costs nothing
    /// at removal time.
    by_user: HashMap<i64, Vec<Weak<Mutex<Session>>>>,
}

/// Registry of live sessions, shared between the loop thread (add/remove on
/// connect/close) and worker threads (lookups during dispatch).
pub struct SessionManager {
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_fd: HashMap::new(),
                by_user: HashMap::new(),
            }),
        }
    }

    pub fn add(&self, fd: i32, peer: SocketAddr) -> SessionRef {
        let session = Arc::new(Mutex::new(Session::new(fd, peer)));
        if let Ok(mut inner) = self.inner.lock() {
            inner.by_fd.insert(fd, Arc::clone(&session));
        }
        debug!("session added for fd {}", fd);
        session
    }

    /// Drop the session for `fd` and scrub it out of its user's bucket.
    pub fn remove(&self, fd: i32) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let Some(session) = inner.by_fd.remove(&fd) else {
            return;
        };
        let user_id = session.lock().ok().and_then(|s| s.user_id());
        if let Some(uid) = user_id {
            if let Some(bucket) = inner.by_user.get_mut(&uid) {
                bucket.retain(|w| {
                    w.upgrade()
                        .is_some_and(|s| !Arc::ptr_eq(&s, &session))
                });
                if bucket.is_empty() {
                    inner.by_user.remove(&uid);
                }
            }
        }
        debug!("session removed for fd {}", fd);
    }

    pub fn get(&self, fd: i32) -> Option<SessionRef> {
        self.inner.lock().ok()?.by_fd.get(&fd).cloned()
    }

    /// Attach a user identity to the session on `fd` and index it for
    /// user-wide lookups (e.g. delivering a message to all of a user's
    /// open connections). Rebinding moves the session between user buckets;
    /// binding the same identity again is a no-op for the index.
    pub fn bind_user(&self, fd: i32, user_id: i64) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let Some(session) = inner.by_fd.get(&fd).cloned() else {
            return false;
        };

        let prior = session.lock().ok().and_then(|s| s.user_id());
        if let Some(old_id) = prior {
            if old_id != user_id {
                if let Some(bucket) = inner.by_user.get_mut(&old_id) {
                    bucket.retain(|w| {
                        w.upgrade().is_some_and(|s| !Arc::ptr_eq(&s, &session))
                    });
                    if bucket.is_empty() {
                        inner.by_user.remove(&old_id);
                    }
                }
            }
        }

        if let Ok(mut s) = session.lock() {
            s.user_id = Some(user_id);
        }
        let bucket = inner.by_user.entry(user_id).or_default();
        let already_indexed = bucket
            .iter()
            .any(|w| w.upgrade().is_some_and(|s| Arc::ptr_eq(&s, &session)));
        if !already_indexed {
            bucket.push(Arc::downgrade(&session));
        }
        true
    }

    /// All live sessions for `user_id`. Dead weak entries are pruned as a
    /// side effect; an emptied bucket is removed entirely.
    pub fn sessions_by_user(&self, user_id: i64) -> Vec<SessionRef> {
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };
        let Some(bucket) = inner.by_user.get_mut(&user_id) else {
            return Vec::new();
        };
        bucket.retain(|w| w.strong_count() > 0);
        let live: Vec<SessionRef> = bucket.iter().filter_map(Weak::upgrade).collect();
        if bucket.is_empty() {
            inner.by_user.remove(&user_id);
        }
        live
    }

    /// Fds of every live session, for broadcasts.
    pub fn all_fds(&self) -> Vec<i32> {
        match self.inner.lock() {
            Ok(inner) => inner.by_fd.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.by_fd.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
