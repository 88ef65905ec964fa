#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # plumber
//!
//! plumber is a dataflow service runtime: operators called *servlets*
//! are wired into a directed acyclic *service graph*, and the runtime
//! drives per-request execution across that graph with typed
//! inter-operator *pipes*, request-scoped resources, and both
//! synchronous and asynchronous servlets.
//!
//! The pieces fit together like this:
//!
//! - [`scope`] — each request owns a [`Scope`](scope::Scope) of
//!   refcounted objects named by short tokens, so large payloads travel
//!   across pipes as 32-bit names instead of copies.
//! - [`pipe`] — one edge of the graph, instantiated per request; a
//!   [`PipeHandle`](pipe::PipeHandle) wraps a transport-module endpoint
//!   with flags, typed-header accounting, and a generic control surface.
//! - [`proto`] — servlets declare field-level header access against a
//!   [`Schema`](proto::Schema) without knowing concrete types; the graph
//!   resolves every declaration to offsets at link time.
//! - [`graph`] — builds and validates the immutable service graph,
//!   inferring the concrete type of every edge.
//! - [`servlet`] — the operator ABI: lifecycle callbacks plus the
//!   runtime API a running servlet sees.
//! - [`sched`] — per-thread schedulers drive task tables keyed by
//!   `(request, node)`; async servlets run their blocking phase on a
//!   shared pool and complete back on their home scheduler.
//!
//! Transport modules (TCP, TLS, shared memory) live behind the
//! [`pipe::TransportModule`] seam; the built-in [`pipe::mem`] module is
//! the loopback transport and the one the test suites drive.

pub mod error;
pub mod graph;
pub mod pipe;
pub mod proto;
pub mod scope;
pub mod sched;
pub mod servlet;

pub use crate::error::{Error, Result};
pub use crate::graph::ServiceGraph;
pub use crate::pipe::{Pipe, PipeFlags, PipeHandle};
pub use crate::proto::{Schema, TypeModel};
pub use crate::scope::{Scope, ScopeToken};
pub use crate::sched::{Scheduler, SchedulerHandle};
pub use crate::servlet::{Servlet, ServletMode};
