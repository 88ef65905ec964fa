//! Request scheduling.
//!
//! Requests are admitted to a [`Scheduler`], a single-threaded
//! cooperative loop over a private task table. Servlet executions for one
//! request run as tasks that become dispatchable when every input edge
//! has either connected or cancelled; async servlets split into three
//! phases, with the blocking middle phase on a shared [`AsyncPool`].

use std::fmt;
use std::sync::Arc;

pub(crate) mod async_task;
pub(crate) mod eventloop;
pub(crate) mod pool;
pub(crate) mod registry;
pub(crate) mod task;

pub use self::async_task::AsyncHandle;
pub use self::eventloop::{RequestDone, Scheduler, SchedulerHandle};
pub use self::pool::AsyncPool;
pub use self::registry::Registry;

/// Identifies a scheduler within the process.
pub type SchedId = u32;

/// A 64-bit request identifier, monotonically increasing within its
/// scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    /// The raw request number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Rebuild a request id from its raw number, e.g. one read back from
    /// a log line or a drain notification.
    pub fn from_u64(raw: u64) -> RequestId {
        RequestId(raw)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Configures schedulers and their shared async pool.
#[derive(Debug, Clone)]
pub struct Builder {
    pool_threads: usize,
    ready_batch: usize,
}

impl Builder {
    /// Defaults: two async-pool threads, sixteen ready tasks per loop
    /// iteration.
    pub fn new() -> Builder {
        Builder {
            pool_threads: 2,
            ready_batch: 16,
        }
    }

    /// Number of threads running async phase-2 bodies.
    pub fn pool_threads(mut self, threads: usize) -> Builder {
        self.pool_threads = threads;
        self
    }

    /// Upper bound on ready tasks dispatched per loop iteration, before
    /// the inbox is drained again.
    pub fn ready_batch(mut self, batch: usize) -> Builder {
        self.ready_batch = batch;
        self
    }

    /// Create the shared async pool for this configuration. Fails when
    /// the OS refuses to spawn the worker threads.
    pub fn pool(&self) -> crate::Result<Arc<AsyncPool>> {
        AsyncPool::new(self.pool_threads)
    }

    /// Create one scheduler and its admission handle. Drive the returned
    /// [`Scheduler`] on its owning thread; it resolves once every handle
    /// is dropped and the last request has drained.
    pub fn scheduler(
        &self,
        id: SchedId,
        pool: Arc<AsyncPool>,
    ) -> (Scheduler, SchedulerHandle) {
        Scheduler::new(id, pool, self.ready_batch)
    }

    /// Spawn `n` scheduler threads, each driving its loop on a
    /// current-thread runtime, and return the running runtime.
    #[cfg(feature = "runtime")]
    pub fn spawn(&self, schedulers: usize) -> crate::Result<Runtime> {
        let pool = self.pool()?;
        let registry = Arc::new(Registry::new());
        let mut joins = Vec::with_capacity(schedulers.max(1));
        for id in 0..schedulers.max(1) as SchedId {
            let (scheduler, handle) = self.scheduler(id, Arc::clone(&pool));
            registry.insert(handle);
            let join = std::thread::Builder::new()
                .name(format!("plumber-sched-{}", id))
                .spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .build()
                        .map_err(crate::error::Error::new_io)?;
                    rt.block_on(scheduler)
                })
                .map_err(crate::error::Error::new_io)?;
            joins.push(join);
        }
        Ok(Runtime {
            registry,
            _pool: pool,
            joins,
            next: std::sync::atomic::AtomicUsize::new(0),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running set of scheduler threads behind a shared registry.
#[cfg(feature = "runtime")]
#[derive(Debug)]
pub struct Runtime {
    registry: Arc<Registry>,
    _pool: Arc<AsyncPool>,
    joins: Vec<std::thread::JoinHandle<crate::Result<()>>>,
    next: std::sync::atomic::AtomicUsize,
}

#[cfg(feature = "runtime")]
impl Runtime {
    /// The scheduler registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// A handle picked round-robin, for request admission.
    pub fn handle(&self) -> SchedulerHandle {
        let handles = self.registry.handles();
        let n = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        handles[n % handles.len()].clone()
    }

    /// Release the admission handles and wait for every scheduler to
    /// drain. Any handle cloned out of the registry must be dropped
    /// first.
    pub fn shutdown(mut self) -> crate::Result<()> {
        self.registry.clear();
        for join in self.joins.drain(..) {
            match join.join() {
                Ok(result) => result?,
                Err(_) => return Err(crate::error::Error::new_programming("scheduler panicked")),
            }
        }
        Ok(())
    }
}
