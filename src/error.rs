//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have plumber `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while driving a service graph.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    op: Option<&'static str>,
    detail: Option<String>,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Null where non-null required, out-of-range id. The call fails
    /// without touching any state.
    InvalidArg,
    /// Allocation failure or a table reaching its hard limit.
    Exhausted,
    /// An I/O error from a transport module read or write.
    Io,
    /// A type-system violation discovered at resolution time. Fatal at
    /// graph startup.
    TypeSystem,
    /// The service graph is malformed (cycle, unreachable node, bad wiring).
    Graph,
    /// A programming error: double free, counter overflow, pop without
    /// push. Aborts in debug builds.
    Programming,
    /// A capability or operation the target object does not implement.
    /// Callers are expected to check for this case.
    Unsupported,
    /// A required servlet callback was not provided.
    Unimplemented,
    /// A scheduler inbox or completion channel is closed.
    ChannelClosed,
    /// An error raised by servlet code.
    Servlet,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                op: None,
                detail: None,
                cause: None,
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn op(mut self, op: &'static str) -> Error {
        self.inner.op = Some(op);
        self
    }

    pub(crate) fn detail<S: Into<String>>(mut self, detail: S) -> Error {
        self.inner.detail = Some(detail.into());
        self
    }

    pub(crate) fn new_invalid_arg(op: &'static str) -> Error {
        Error::new(Kind::InvalidArg).op(op)
    }

    pub(crate) fn new_exhausted(op: &'static str) -> Error {
        Error::new(Kind::Exhausted).op(op)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_type_system<S: Into<String>>(detail: S) -> Error {
        Error::new(Kind::TypeSystem).detail(detail)
    }

    pub(crate) fn new_graph<S: Into<String>>(detail: S) -> Error {
        Error::new(Kind::Graph).detail(detail)
    }

    /// A programming error. In debug builds this aborts on the spot; in
    /// release builds it is logged and surfaced as a recoverable error.
    pub(crate) fn new_programming(op: &'static str) -> Error {
        debug_assert!(false, "programming error: {}", op);
        tracing::error!(op, "programming error");
        Error::new(Kind::Programming).op(op)
    }

    pub(crate) fn new_unsupported(op: &'static str) -> Error {
        Error::new(Kind::Unsupported).op(op)
    }

    pub(crate) fn new_unimplemented(op: &'static str) -> Error {
        Error::new(Kind::Unimplemented).op(op)
    }

    pub(crate) fn new_channel_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    /// Wrap an arbitrary cause as a servlet error.
    ///
    /// This is the constructor servlet implementations use to report
    /// their own failures; the runtime converts them into cancellation
    /// of the task's downstream.
    pub fn servlet<E>(cause: E) -> Error
    where
        E: Into<Cause>,
    {
        Error::new(Kind::Servlet).with(cause.into())
    }

    /// Returns true if this error was raised by servlet code.
    pub fn is_servlet(&self) -> bool {
        matches!(self.inner.kind, Kind::Servlet)
    }

    /// Returns true if the call was rejected without touching state.
    pub fn is_invalid_arg(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidArg)
    }

    /// Returns true if this was caused by resource exhaustion.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::Exhausted)
    }

    /// Returns true if this was caused by transport I/O.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if this is a type-system violation.
    pub fn is_type_system(&self) -> bool {
        matches!(self.inner.kind, Kind::TypeSystem)
    }

    /// Returns true if the service graph failed validation.
    pub fn is_graph(&self) -> bool {
        matches!(self.inner.kind, Kind::Graph)
    }

    /// Returns true if this is a detected programming error.
    pub fn is_programming(&self) -> bool {
        matches!(self.inner.kind, Kind::Programming)
    }

    /// Returns true if the target lacks the requested capability.
    pub fn is_unsupported(&self) -> bool {
        matches!(self.inner.kind, Kind::Unsupported)
    }

    /// Returns true if a required servlet callback was missing.
    pub fn is_unimplemented(&self) -> bool {
        matches!(self.inner.kind, Kind::Unimplemented)
    }

    /// Returns true if a scheduler channel is closed.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::InvalidArg => "invalid argument",
            Kind::Exhausted => "resource exhausted",
            Kind::Io => "transport error",
            Kind::TypeSystem => "type system violation",
            Kind::Graph => "invalid service graph",
            Kind::Programming => "programming error",
            Kind::Unsupported => "operation not supported",
            Kind::Unimplemented => "callback not implemented",
            Kind::ChannelClosed => "channel closed",
            Kind::Servlet => "servlet error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("plumber::Error");
        f.field(&self.inner.kind);
        if let Some(op) = self.inner.op {
            f.field(&op);
        }
        if let Some(ref detail) = self.inner.detail {
            f.field(detail);
        }
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())?;
        if let Some(op) = self.inner.op {
            write!(f, " ({})", op)?;
        }
        if let Some(ref detail) = self.inner.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}
