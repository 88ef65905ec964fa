//! The async task lifecycle.
//!
//! One logical async execution is split across three phases: `setup` on
//! the scheduler thread, `exec` on an async-pool thread, `cleanup` back on
//! the scheduler thread. The [`AsyncHandle`] is the identity that spans
//! all three: it carries the status word, the wait bit, the async buffer
//! that flows from setup to exec, and the exactly-once completion guard
//! that posts the done event to the home scheduler's inbox.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use futures_channel::mpsc;
use parking_lot::Mutex;

use crate::error::Error;
use crate::graph::NodeId;
use crate::sched::eventloop::Event;
use crate::sched::RequestId;
use crate::servlet::AsyncExecFn;

pub(crate) struct AsyncInner {
    status: AtomicI32,
    wait: AtomicBool,
    cancelled: AtomicBool,
    completed: AtomicBool,
    buf: Mutex<Vec<u8>>,
    exec: Option<AsyncExecFn>,
    home: mpsc::UnboundedSender<Event>,
    key: usize,
    request: RequestId,
    node: NodeId,
}

/// The identity of one async task execution, valid across its three
/// phases. Clonable and sendable: wait-mode reactors keep a clone and
/// complete the task from wherever the external event lands.
#[derive(Clone)]
pub struct AsyncHandle {
    inner: Arc<AsyncInner>,
}

impl AsyncHandle {
    pub(crate) fn new(
        buf_size: usize,
        exec: Option<AsyncExecFn>,
        home: mpsc::UnboundedSender<Event>,
        key: usize,
        request: RequestId,
        node: NodeId,
    ) -> AsyncHandle {
        AsyncHandle {
            inner: Arc::new(AsyncInner {
                status: AtomicI32::new(0),
                wait: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                buf: Mutex::new(vec![0u8; buf_size]),
                exec,
                home,
                key,
                request,
                node,
            }),
        }
    }

    /// Defer the completion event until [`AsyncHandle::notify_wait`] is
    /// called by an external reactor. Only meaningful from phase 1.
    pub fn set_wait(&self) {
        self.inner.wait.store(true, Ordering::Release);
    }

    /// Skip the exec phase and move straight to cleanup with the given
    /// status code. Only meaningful from phase 1.
    pub fn cancel(&self, status: i32) {
        self.inner.status.store(status, Ordering::Release);
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// The task's status code, as cleanup observes it.
    pub fn retcode(&self) -> i32 {
        self.inner.status.load(Ordering::Acquire)
    }

    /// Complete a wait-mode task with the given status. Exactly one call
    /// takes effect; a second is a programming error.
    pub fn notify_wait(&self, status: i32) -> crate::Result<()> {
        self.inner.status.store(status, Ordering::Release);
        if !self.post_completion() {
            return Err(Error::new_programming("notify_wait after completion"));
        }
        Ok(())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn with_buf<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buf = self.inner.buf.lock();
        f(&mut buf)
    }

    /// Phase 2, on a pool thread. Runs the exec body (an absent body is
    /// an immediate success, which is what wait-mode servlets use) and,
    /// unless wait mode deferred it, posts the completion event.
    pub(crate) fn run_exec(&self) {
        let status = match self.inner.exec {
            Some(exec) => {
                let mut buf = self.inner.buf.lock();
                match exec(self, &mut buf) {
                    Ok(status) => status,
                    Err(err) => {
                        tracing::debug!(error = %err, "async exec failed");
                        -1
                    }
                }
            }
            None => 0,
        };
        if self.inner.wait.load(Ordering::Acquire) {
            // wait mode: the status word belongs to notify_wait
            return;
        }
        self.inner.status.store(status, Ordering::Release);
        self.post_completion();
    }

    /// Post the async-done event to the home scheduler exactly once.
    /// Returns false when completion had already been posted.
    pub(crate) fn post_completion(&self) -> bool {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let event = Event::AsyncDone {
            key: self.inner.key,
            request: self.inner.request,
            node: self.inner.node,
            status: self.retcode(),
        };
        if self.inner.home.unbounded_send(event).is_err() {
            tracing::error!("async completion after scheduler shutdown");
        }
        true
    }
}

impl fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("request", &self.inner.request)
            .field("node", &self.inner.node)
            .field("status", &self.retcode())
            .finish()
    }
}
