//! Request-local object store.
//!
//! A [`Scope`] owns heterogeneous, refcounted objects for the lifetime of a
//! single request and names them with short [`ScopeToken`]s that can travel
//! across pipes. The point of the indirection is zero-copy: a servlet that
//! produced a large object (file contents, a rendered buffer) writes the
//! *token* downstream, and the consumer — usually the transport write path —
//! opens the object as a byte stream and drains it directly, with no
//! intermediate copy of the payload.
//!
//! Object capabilities are explicit values, not method-missing: destruction
//! is the only required capability (`Drop`), while `copy` and `open` return
//! `Option` so absence is observable and checkable by callers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;

/// A 32-bit name for an object inside one request's scope.
///
/// Tokens are unique within their scope and are never reused, so a stale
/// token is always detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeToken(pub(crate) u32);

impl ScopeToken {
    /// The raw 32-bit value, as written through a typed header field.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Rebuild a token from its raw value read out of a typed header.
    pub fn from_u32(raw: u32) -> ScopeToken {
        ScopeToken(raw)
    }
}

/// Readiness registration for an event-driven scope stream.
///
/// `read == false && write == false` means "unregister".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// The file descriptor readiness is reported on.
    pub fd: i32,
    /// Treat ready-for-read as stream readiness.
    pub read: bool,
    /// Treat ready-for-write as stream readiness.
    pub write: bool,
    /// Time limit in milliseconds before the token counts as timed out.
    pub timeout_ms: i32,
}

/// An object that can live in a request scope.
///
/// Destruction is implicit via `Drop` and is the only required capability.
/// The optional capabilities return `Option`: `None` means the object does
/// not support the operation, which is an ordinary answer rather than an
/// error.
pub trait ScopeObject: Send + Sync {
    /// Deep-copy the object, if it supports copying.
    fn copy(&self) -> Option<Box<dyn ScopeObject>> {
        None
    }

    /// Open the object as a byte stream, if it has a serialized form.
    fn open(&self) -> Option<Box<dyn ScopeStream>> {
        None
    }
}

/// The byte-stream representation of a scope object.
///
/// Closing is implicit via `Drop`.
pub trait ScopeStream: Send {
    /// Read bytes from the stream. A return of 0 may mean "not ready yet";
    /// combine with [`ScopeStream::eos`] to distinguish the end of stream.
    fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize>;

    /// Whether the stream has reached its end.
    fn eos(&self) -> crate::Result<bool>;

    /// The event that should be registered to learn about stream
    /// readiness, for transports doing event-driven zero-copy forwarding.
    /// `None` means no event needs to be registered.
    fn ready_event(&mut self) -> crate::Result<Option<ReadyEvent>> {
        Ok(None)
    }
}

/// A stream opened out of a scope. Keeps the scope's open-stream accounting
/// correct by decrementing on drop.
pub struct StreamHandle {
    inner: Box<dyn ScopeStream>,
    open_streams: Arc<AtomicUsize>,
}

impl StreamHandle {
    /// Read bytes from the stream.
    pub fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        self.inner.read(buf)
    }

    /// Whether the stream has reached its end.
    pub fn eos(&self) -> crate::Result<bool> {
        self.inner.eos()
    }

    /// Readiness registration for event-driven draining.
    pub fn ready_event(&mut self) -> crate::Result<Option<ReadyEvent>> {
        self.inner.ready_event()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.open_streams.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").finish()
    }
}

struct Entry {
    object: Box<dyn ScopeObject>,
    refs: u32,
}

/// The set of refcounted objects alive for one request.
pub struct Scope {
    entries: HashMap<u32, Entry>,
    next_token: u32,
    open_streams: Arc<AtomicUsize>,
    increfs: u64,
    decrefs: u64,
}

impl Scope {
    pub(crate) fn new() -> Scope {
        Scope {
            entries: HashMap::new(),
            next_token: 1,
            open_streams: Arc::new(AtomicUsize::new(0)),
            increfs: 0,
            decrefs: 0,
        }
    }

    /// Insert an object, transferring ownership to the scope. The returned
    /// token starts with a refcount of 1.
    pub fn insert(&mut self, object: Box<dyn ScopeObject>) -> crate::Result<ScopeToken> {
        let token = self.next_token;
        self.next_token = self
            .next_token
            .checked_add(1)
            .ok_or_else(|| Error::new_exhausted("scope token space"))?;
        self.entries.insert(token, Entry { object, refs: 1 });
        self.increfs += 1;
        tracing::trace!(token, "scope insert");
        Ok(ScopeToken(token))
    }

    /// Borrow the object named by `token` without transferring ownership.
    pub fn acquire(&self, token: ScopeToken) -> crate::Result<&dyn ScopeObject> {
        self.entries
            .get(&token.0)
            .map(|e| &*e.object)
            .ok_or_else(|| Error::new_invalid_arg("scope acquire: unknown token"))
    }

    /// Increment the token's refcount.
    pub fn incref(&mut self, token: ScopeToken) -> crate::Result<()> {
        let entry = match self.entries.get_mut(&token.0) {
            Some(e) => e,
            None => return Err(Error::new_programming("scope incref on dead token")),
        };
        entry.refs += 1;
        self.increfs += 1;
        Ok(())
    }

    /// Decrement the token's refcount; at zero the object is dropped.
    ///
    /// Any stream handles opened from the object must already be closed
    /// when the last reference goes away.
    pub fn decref(&mut self, token: ScopeToken) -> crate::Result<()> {
        let entry = match self.entries.get_mut(&token.0) {
            Some(e) => e,
            None => return Err(Error::new_programming("scope decref on dead token")),
        };
        self.decrefs += 1;
        entry.refs -= 1;
        if entry.refs == 0 {
            tracing::trace!(token = token.0, "scope object released");
            self.entries.remove(&token.0);
        }
        Ok(())
    }

    /// Open the object named by `token` as a byte stream.
    ///
    /// Fails with an unsupported-operation error when the object has no
    /// `open` capability; callers are expected to check for that case.
    pub fn open_stream(&self, token: ScopeToken) -> crate::Result<StreamHandle> {
        let object = self.acquire(token)?;
        let inner = object
            .open()
            .ok_or_else(|| Error::new_unsupported("scope open stream"))?;
        self.open_streams.fetch_add(1, Ordering::AcqRel);
        Ok(StreamHandle {
            inner,
            open_streams: Arc::clone(&self.open_streams),
        })
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the scope holds no objects.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Streams opened out of this scope and not yet dropped.
    pub fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::Acquire)
    }

    /// Total incref activity minus decref activity, counting the implicit
    /// reference taken by `insert`. Used by lifetime accounting tests.
    pub fn ref_balance(&self) -> i64 {
        self.increfs as i64 - self.decrefs as i64
    }

    /// Dispose the scope at the end of its request. Every remaining object
    /// is dropped; open streams at this point are a programming error.
    pub(crate) fn finalize(&mut self) {
        let open = self.open_stream_count();
        if open != 0 {
            debug_assert!(false, "scope finalized with {} open streams", open);
            tracing::error!(open, "scope finalized with open streams");
        }
        tracing::trace!(remaining = self.entries.len(), "scope finalize");
        self.entries.clear();
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("objects", &self.entries.len())
            .field("open_streams", &self.open_stream_count())
            .finish()
    }
}

/// A scope object backed by an in-memory byte buffer.
///
/// Supports both `copy` and `open`; handy for servlets that build a payload
/// in memory and hand it downstream by token.
pub struct BufferObject {
    bytes: Bytes,
}

impl BufferObject {
    /// Wrap a byte buffer as a scope object.
    pub fn new(bytes: Bytes) -> BufferObject {
        BufferObject { bytes }
    }

    /// The wrapped bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ScopeObject for BufferObject {
    fn copy(&self) -> Option<Box<dyn ScopeObject>> {
        Some(Box::new(BufferObject {
            bytes: self.bytes.clone(),
        }))
    }

    fn open(&self) -> Option<Box<dyn ScopeStream>> {
        Some(Box::new(BufferStream {
            bytes: self.bytes.clone(),
            pos: 0,
        }))
    }
}

struct BufferStream {
    bytes: Bytes,
    pos: usize,
}

impl ScopeStream for BufferStream {
    fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        let n = std::cmp::min(buf.len(), self.bytes.len() - self.pos);
        buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn eos(&self) -> crate::Result<bool> {
        Ok(self.pos >= self.bytes.len())
    }
}
