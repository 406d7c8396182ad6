// src/resource_pool.rs
use crate::error::{MazurkaError, MazurkaResult};
use log::{debug, warn};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Entries the producer keeps warm at all times.
    pub min_size: usize,
    /// Hard cap on live entries, checked out or idle.
    pub max_size: usize,
    /// How long `acquire` waits before giving up.
    pub acquire_timeout: Duration,
    /// Idle entries older than this are reaped, down to `min_size`.
    pub max_idle: Duration,
    /// Reaper wake-up period.
    pub reap_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 8,
            acquire_timeout: Duration::from_secs(5),
            max_idle: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
        }
    }
}

struct IdleEntry<T> {
    resource: T,
    parked_at: Instant,
}

struct Inner<T> {
    idle: VecDeque<IdleEntry<T>>,
    total: usize,
    /// Acquirers currently blocked; drives on-demand production.
    waiting: usize,
    closed: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    /// Woken when an entry is returned or produced.
    ready: Condvar,
    /// Woken when the producer should top the pool up.
    demand: Condvar,
    options: PoolOptions,
}

/// Generic pool of expensive-to-create resources (database connections,
/// and the like). A background producer keeps `min_size` entries warm and
/// fills demand up to `max_size`; a reaper retires entries idle too long.
pub struct ResourcePool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    threads: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new<F>(options: PoolOptions, factory: F) -> Self
    where
        F: Fn() -> MazurkaResult<T> + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                total: 0,
                waiting: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            demand: Condvar::new(),
            options,
        });

        let mut threads = Vec::with_capacity(2);

        {
            let shared = Arc::clone(&shared);
            let factory = Arc::new(factory);
            if let Ok(h) = thread::Builder::new()
                .name("pool-producer".to_string())
                .spawn(move || producer_main(shared, factory))
            {
                threads.push(h);
            }
        }
        {
            let shared = Arc::clone(&shared);
            if let Ok(h) = thread::Builder::new()
                .name("pool-reaper".to_string())
                .spawn(move || reaper_main(shared))
            {
                threads.push(h);
            }
        }

        Self { shared, threads }
    }

    /// Check an entry out, waiting up to `acquire_timeout` for one to become
    /// available. The guard returns it to the pool on drop.
    pub fn acquire(&self) -> MazurkaResult<PoolGuard<T>> {
        let deadline = Instant::now() + self.shared.options.acquire_timeout;
        let mut inner = self
            .shared
            .inner
            .lock()
            .map_err(|_| MazurkaError::PoolClosed)?;

        loop {
            if inner.closed {
                return Err(MazurkaError::PoolClosed);
            }
            if let Some(entry) = inner.idle.pop_front() {
                return Ok(PoolGuard {
                    resource: Some(entry.resource),
                    shared: Arc::clone(&self.shared),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(MazurkaError::PoolTimeout);
            }
            inner.waiting += 1;
            self.shared.demand.notify_one();
            let waited = self
                .shared
                .ready
                .wait_timeout(inner, deadline - now)
                .map_err(|_| MazurkaError::PoolClosed);
            let (guard, timed_out) = match waited {
                Ok(pair) => pair,
                Err(e) => return Err(e),
            };
            inner = guard;
            inner.waiting -= 1;
            if timed_out.timed_out() && inner.idle.is_empty() {
                return Err(MazurkaError::PoolTimeout);
            }
        }
    }

    pub fn idle_count(&self) -> usize {
        self.shared.inner.lock().map(|i| i.idle.len()).unwrap_or(0)
    }

    /// Shut the pool down: fail pending and future acquires, drop idle
    /// entries, stop the background threads. Runs automatically on drop.
    pub fn close(&mut self) {
        {
            let Ok(mut inner) = self.shared.inner.lock() else {
                return;
            };
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.idle.clear();
        }
        self.shared.ready.notify_all();
        self.shared.demand.notify_all();
        for h in self.threads.drain(..) {
            let _ = h.join();
        }
        debug!("resource pool closed");
    }
}

impl<T: Send + 'static> Drop for ResourcePool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Checked-out pool entry. Dereferences to the resource; drop returns it.
pub struct PoolGuard<T: Send + 'static> {
    resource: Option<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Send + 'static> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let Ok(mut inner) = self.shared.inner.lock() else {
            return;
        };
        if inner.closed {
            inner.total = inner.total.saturating_sub(1);
            return;
        }
        inner.idle.push_back(IdleEntry {
            resource,
            parked_at: Instant::now(),
        });
        self.shared.ready.notify_one();
    }
}

fn producer_main<T, F>(shared: Arc<Shared<T>>, factory: Arc<F>)
where
    T: Send + 'static,
    F: Fn() -> MazurkaResult<T> + Send + Sync + 'static,
{
    loop {
        let need = {
            let Ok(mut inner) = shared.inner.lock() else {
                return;
            };
            loop {
                if inner.closed {
                    return;
                }
                let opts = &shared.options;
                // Top up to min_size, or produce one more on demand while
                // under the cap and nothing is idle.
                if inner.total < opts.min_size {
                    break opts.min_size - inner.total;
                }
                if inner.waiting > 0 && inner.idle.is_empty() && inner.total < opts.max_size {
                    break 1;
                }
                inner = match shared.demand.wait(inner) {
                    Ok(g) => g,
                    Err(_) => return,
                };
            }
        };

        for _ in 0..need {
            match factory() {
                Ok(resource) => {
                    let Ok(mut inner) = shared.inner.lock() else {
                        return;
                    };
                    if inner.closed {
                        return;
                    }
                    inner.total += 1;
                    inner.idle.push_back(IdleEntry {
                        resource,
                        parked_at: Instant::now(),
                    });
                    shared.ready.notify_one();
                }
                Err(e) => {
                    warn!("resource factory failed: {}", e);
                    // Back off so a dead backend does not spin the producer.
                    thread::sleep(Duration::from_millis(500));
                    break;
                }
            }
        }
    }
}

fn reaper_main<T: Send + 'static>(shared: Arc<Shared<T>>) {
    loop {
        thread::sleep(shared.options.reap_interval);
        let Ok(mut inner) = shared.inner.lock() else {
            return;
        };
        if inner.closed {
            return;
        }
        let min_size = shared.options.min_size;
        let max_idle = shared.options.max_idle;
        let now = Instant::now();
        let mut reaped = 0;
        while inner.total > min_size {
            match inner.idle.front() {
                Some(entry) if now.duration_since(entry.parked_at) > max_idle => {
                    inner.idle.pop_front();
                    inner.total -= 1;
                    reaped += 1;
                }
                _ => break,
            }
        }
        if reaped > 0 {
            debug!("reaped {} idle pool entries", reaped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_options() -> PoolOptions {
        PoolOptions {
            min_size: 1,
            max_size: 2,
            acquire_timeout: Duration::from_millis(500),
            max_idle: Duration::from_secs(60),
            reap_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let pool = ResourcePool::new(quick_options(), move || {
            Ok(c.fetch_add(1, Ordering::SeqCst))
        });

        let first = pool.acquire().unwrap();
        let id = *first;
        drop(first);

        // Returned entry is reused rather than recreated.
        let second = pool.acquire().unwrap();
        assert_eq!(*second, id);
    }

    #[test]
    fn test_acquire_times_out_when_exhausted() {
        let pool = ResourcePool::new(quick_options(), || Ok(()));
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();

        match pool.acquire() {
            Err(MazurkaError::PoolTimeout) => {}
            other => panic!("expected PoolTimeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_acquire_after_close_fails() {
        let mut pool = ResourcePool::new(quick_options(), || Ok(5u32));
        pool.close();
        match pool.acquire() {
            Err(MazurkaError::PoolClosed) => {}
            other => panic!("expected PoolClosed, got {:?}", other.map(|_| ())),
        }
    }
}
