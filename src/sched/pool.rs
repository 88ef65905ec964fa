//! The shared async pool.
//!
//! K plain OS threads run nothing but phase-2 exec bodies. The pool is
//! shared by every scheduler; each submitted task carries its
//! home-scheduler inbox, so completion events route themselves back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::sched::async_task::AsyncHandle;

struct Shared {
    queue: Mutex<VecDeque<AsyncHandle>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// The pool of threads running async phase-2 bodies.
pub struct AsyncPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for AsyncPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl AsyncPool {
    /// Start a pool with the given number of worker threads.
    pub fn new(threads: usize) -> crate::Result<Arc<AsyncPool>> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(threads.max(1));
        for n in 0..threads.max(1) {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("plumber-async-{}", n))
                .spawn(move || worker(worker_shared));
            match spawned {
                Ok(join) => workers.push(join),
                Err(err) => {
                    // release any workers that did start
                    shared.shutdown.store(true, Ordering::Release);
                    shared.available.notify_all();
                    for join in workers {
                        let _ = join.join();
                    }
                    return Err(Error::new_io(err));
                }
            }
        }
        Ok(Arc::new(AsyncPool { shared, workers }))
    }

    /// Post a task's exec phase to the pool.
    pub(crate) fn submit(&self, task: AsyncHandle) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(task);
        drop(queue);
        self.shared.available.notify_one();
    }
}

impl Drop for AsyncPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        task.run_exec();
    }
}
