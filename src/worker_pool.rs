// src/worker_pool.rs
use log::{debug, error};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<PoolState>,
    available: Condvar,
}

struct PoolState {
    jobs: VecDeque<Job>,
    shutting_down: bool,
}

/// Fixed-size thread pool for blocking work (dispatch, file I/O, database
/// calls) so the event loop thread never stalls.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Pool sized to the machine's logical CPUs.
    pub fn new() -> Self {
        Self::with_size(num_cpus::get())
    }

    pub fn with_size(size: usize) -> Self {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                shutting_down: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker_main(id, shared));
            match handle {
                Ok(h) => workers.push(h),
                Err(e) => error!("failed to spawn worker-{}: {}", id, e),
            }
        }

        debug!("worker pool started with {} threads", workers.len());
        Self { shared, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Fire-and-forget.
    pub fn detach<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Box::new(job));
    }

    /// Run `job` on the pool and hand back a receiver for its result. A
    /// dropped receiver just discards the result; a job that panics leaves
    /// the receiver disconnected.
    pub fn submit<F, T>(&self, job: F) -> mpsc::Receiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.push(Box::new(move || {
            let _ = tx.send(job());
        }));
        rx
    }

    fn push(&self, job: Job) {
        let Ok(mut state) = self.shared.queue.lock() else {
            return;
        };
        if state.shutting_down {
            debug!("job dropped: pool is shutting down");
            return;
        }
        state.jobs.push_back(job);
        self.shared.available.notify_one();
    }

    /// Finish queued jobs, then stop. Runs automatically on drop.
    pub fn shutdown(&mut self) {
        {
            let Ok(mut state) = self.shared.queue.lock() else {
                return;
            };
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("worker pool stopped");
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(id: usize, shared: Arc<Shared>) {
    loop {
        let job = {
            let Ok(mut state) = shared.queue.lock() else {
                return;
            };
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.shutting_down {
                    return;
                }
                state = match shared.available.wait(state) {
                    Ok(s) => s,
                    Err(_) => return,
                };
            }
        };

        // A panicking job must not take the worker thread down with it.
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("job panicked on worker-{}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_submit_returns_result() {
        let pool = WorkerPool::with_size(2);
        let rx = pool.submit(|| 21 * 2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_detach_runs_all_jobs() {
        let pool = WorkerPool::with_size(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.detach(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool); // joins after draining the queue
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_panicking_job_does_not_kill_pool() {
        let pool = WorkerPool::with_size(1);
        pool.detach(|| panic!("bad job"));
        let rx = pool.submit(|| "still alive");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "still alive"
        );
    }

    #[test]
    fn test_size_floor_is_one() {
        let pool = WorkerPool::with_size(0);
        assert_eq!(pool.size(), 1);
    }
}
