//! The servlet ABI.
//!
//! A servlet is one operator of the service graph. Its `init` runs once
//! per instance when the graph is built, defines the instance's pipe
//! slots and typed-header declarations, and reports whether the servlet
//! is synchronous or asynchronous. Sync servlets implement [`Servlet::exec`];
//! async servlets implement the three-phase lifecycle (`async_setup` on a
//! worker thread, an isolated `async_exec` body on the shared pool,
//! `async_cleanup` back on the worker).
//!
//! Phase-2 isolation is enforced by construction: [`Servlet::async_exec`]
//! hands back a plain `fn` pointer, which cannot capture the servlet
//! instance — the async buffer and the task handle are all it can see.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::pipe::{ModuleRegistry, Pipe, PipeFlags, PipeId};
use crate::proto::TypeModel;
use crate::sched::AsyncHandle;

mod context;

pub use self::context::{DataRequest, TaskContext};

/// What `init` reports about a servlet's execution style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServletMode {
    /// `exec` runs once per request, straight through on the scheduler
    /// thread.
    Sync,
    /// The three-phase async lifecycle applies; `async_setup` is
    /// required.
    Async,
}

/// The phase-2 body of an async servlet.
///
/// Runs on an async-pool thread with access to nothing but the task
/// handle and the async buffer; the return value becomes the task's
/// status code unless wait mode overrides it.
pub type AsyncExecFn = fn(&AsyncHandle, &mut [u8]) -> crate::Result<i32>;

/// One operator of a service graph.
pub trait Servlet: Send {
    /// Called once when the graph is built. Defines pipes and type-model
    /// declarations through `env` and reports the execution mode.
    fn init(&mut self, args: &[&str], env: &mut ServletInit<'_>) -> crate::Result<ServletMode>;

    /// The body of a sync servlet, called once per request.
    fn exec(&mut self, ctx: &mut TaskContext<'_>) -> crate::Result<()> {
        let _ = ctx;
        Err(Error::new_unimplemented("exec"))
    }

    /// Size of the buffer carried from `async_setup` to `async_exec`.
    fn async_buf_size(&self) -> usize {
        0
    }

    /// Phase 1 of an async execution, on the scheduler thread. May read
    /// input pipes, may cancel the task, may enter wait mode. Whatever it
    /// stores into `buf` is the only state phase 2 will see.
    fn async_setup(
        &mut self,
        task: &AsyncHandle,
        buf: &mut [u8],
        ctx: &mut TaskContext<'_>,
    ) -> crate::Result<()> {
        let _ = (task, buf, ctx);
        Err(Error::new_unimplemented("async_setup"))
    }

    /// The phase-2 body. `None` is legitimate for wait-mode servlets
    /// whose completion arrives from an external reactor.
    fn async_exec(&self) -> Option<AsyncExecFn> {
        None
    }

    /// Phase 3, back on the scheduler thread, with both the async buffer
    /// and the servlet instance in reach. Converts results into pipe
    /// writes and scope-token emissions.
    fn async_cleanup(
        &mut self,
        task: &AsyncHandle,
        buf: &mut [u8],
        ctx: &mut TaskContext<'_>,
    ) -> crate::Result<()> {
        let _ = (task, buf, ctx);
        Ok(())
    }

    /// Called exactly once at graph teardown.
    fn unload(&mut self) -> crate::Result<()> {
        Ok(())
    }

    /// A one-line description of the operator.
    fn desc(&self) -> &str {
        ""
    }

    /// The runtime API version the servlet was written against.
    fn version(&self) -> u32 {
        0
    }
}

/// One pipe slot declared by a servlet's `init`.
pub(crate) struct SlotDef {
    pub(crate) name: String,
    pub(crate) flags: PipeFlags,
    pub(crate) type_expr: Option<String>,
    /// Concrete type filled by the graph's type inferrer.
    pub(crate) concrete: Option<String>,
    /// Whether a still-disabled shadow cancels its downstream (the
    /// default) or delivers an empty pipe instead.
    pub(crate) propagate_disabled: bool,
}

/// A run of slots defined from one pattern.
#[derive(Debug, Clone)]
pub struct PipeArray {
    pipes: Vec<Pipe>,
}

impl PipeArray {
    /// The slot at the given position.
    pub fn get(&self, n: usize) -> crate::Result<Pipe> {
        self.pipes
            .get(n)
            .copied()
            .ok_or_else(|| Error::new_invalid_arg("pipe array index out of range"))
    }

    /// Number of slots in the array.
    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }
}

/// The definition surface handed to [`Servlet::init`].
pub struct ServletInit<'a> {
    pub(crate) slots: &'a mut Vec<SlotDef>,
    pub(crate) model: &'a mut TypeModel,
    pub(crate) registry: &'a Arc<ModuleRegistry>,
}

impl fmt::Debug for ServletInit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServletInit")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl<'a> ServletInit<'a> {
    /// Define a named pipe slot. `type_expr` is the slot's type
    /// expression: a concrete type name, `$name` to take the concrete
    /// type of the same servlet's input slot `name`, or `None` for an
    /// untyped pipe.
    ///
    /// Shadow slots must carry `SHADOW | OUTPUT` and name a previously
    /// defined output slot of this servlet in their target bits.
    pub fn define(
        &mut self,
        name: &str,
        flags: PipeFlags,
        type_expr: Option<&str>,
    ) -> crate::Result<Pipe> {
        if name.is_empty() {
            return Err(Error::new_invalid_arg("empty pipe name"));
        }
        if self.slots.iter().any(|s| s.name == name) {
            return Err(Error::new_invalid_arg("duplicate pipe name"));
        }
        if self.slots.len() > usize::from(PipeId::MAX) {
            return Err(Error::new_exhausted("pipe slots"));
        }
        if flags.is_shadow() {
            if flags.is_input() {
                return Err(Error::new_invalid_arg("shadow pipes are outputs"));
            }
            let target = usize::from(flags.target());
            let valid = self
                .slots
                .get(target)
                .map(|t| t.flags.is_output() && !t.flags.is_shadow())
                .unwrap_or(false);
            if !valid {
                return Err(Error::new_invalid_arg(
                    "shadow target must be an existing output slot",
                ));
            }
        }
        let id = self.slots.len() as PipeId;
        self.slots.push(SlotDef {
            name: name.to_owned(),
            flags,
            type_expr: type_expr.map(str::to_owned),
            concrete: None,
            propagate_disabled: true,
        });
        tracing::trace!(name, id, "pipe defined");
        Ok(Pipe::from_id(id))
    }

    /// Define a pipe with a formatted name.
    pub fn define_pattern(
        &mut self,
        name: fmt::Arguments<'_>,
        flags: PipeFlags,
        type_expr: Option<&str>,
    ) -> crate::Result<Pipe> {
        self.define(&name.to_string(), flags, type_expr)
    }

    /// Define a run of slots: each `#` in the pattern is replaced with
    /// the serial number (`##` escapes a literal `#`).
    pub fn define_array(
        &mut self,
        pattern: &str,
        flags: PipeFlags,
        type_expr: Option<&str>,
        serials: std::ops::Range<u32>,
    ) -> crate::Result<PipeArray> {
        let mut pipes = Vec::with_capacity(serials.len());
        for serial in serials {
            let mut name = String::with_capacity(pattern.len() + 4);
            let mut chars = pattern.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '#' {
                    if chars.peek() == Some(&'#') {
                        chars.next();
                        name.push('#');
                    } else {
                        name.push_str(&serial.to_string());
                    }
                } else {
                    name.push(c);
                }
            }
            pipes.push(self.define(&name, flags, type_expr)?);
        }
        Ok(PipeArray { pipes })
    }

    /// The servlet's type model, for accessor and constant declarations.
    pub fn model(&mut self) -> &mut TypeModel {
        self.model
    }

    /// Hook called when the pipe's concrete type is determined by the
    /// graph's type inferrer; failure aborts startup.
    pub fn set_type_hook<F>(&mut self, pipe: Pipe, hook: F) -> crate::Result<()>
    where
        F: Fn(PipeId, &str) -> crate::Result<()> + Send + Sync + 'static,
    {
        self.model.assert_type(pipe, hook)
    }

    /// Resolve a module service function to a virtual slot.
    pub fn get_module_func(&self, module_path: &str, func: &str) -> crate::Result<Pipe> {
        self.registry.get_module_func(module_path, func)
    }

    /// Open a module instance by its exact path.
    pub fn mod_open(&self, path: &str) -> crate::Result<u8> {
        self.registry.mod_open(path)
    }

    /// The cntl-opcode prefix shared by module instances under `path`;
    /// `None` when no instance lives there (callers use the NOP opcode).
    pub fn mod_cntl_prefix(&self, path: &str) -> crate::Result<Option<u8>> {
        self.registry.mod_cntl_prefix(path)
    }

    /// The runtime version string.
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
