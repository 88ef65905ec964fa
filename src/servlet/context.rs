//! The runtime API handed to a running servlet.
//!
//! A [`TaskContext`] is built by the scheduler around one task execution
//! (or one async phase running on the scheduler thread) and exposes the
//! address-table surface: pipe I/O, typed-header access through the
//! node's resolved type model, the request scope, and module lookups.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;
use crate::pipe::{
    DirectBuf, ModuleRegistry, Opcode, Pipe, PipeFlags, PipeHandle, PipeId,
};
use crate::proto::instance::PipeAccess;
use crate::proto::{Accessor, TypeInstance, TypeModel};
use crate::scope::{Scope, ScopeToken};
use crate::servlet::SlotDef;

/// Asks `write_scope_token` to deliver the first bytes of the token's
/// stream to the caller before the zero-copy drain starts, so a small
/// preamble and a large streamed body can share one transport write.
pub struct DataRequest<'h> {
    /// How many bytes the caller wants to see.
    pub size: usize,
    /// Receives chunks until `size` bytes were offered, it returns
    /// `Ok(0)`, or it errors. Returns how many of the offered bytes it
    /// consumed; unconsumed bytes go to the pipe. An error stops the
    /// preamble but never the drain.
    pub handler: &'h mut dyn FnMut(&[u8]) -> crate::Result<usize>,
}

struct TaskPipes<'a> {
    pipes: &'a mut [Option<PipeHandle>],
}

impl PipeAccess for TaskPipes<'_> {
    fn pipe(&mut self, id: PipeId) -> crate::Result<&mut PipeHandle> {
        self.pipes
            .get_mut(usize::from(id))
            .and_then(|p| p.as_mut())
            .ok_or_else(|| Error::new_invalid_arg("slot has no pipe"))
    }
}

/// The runtime API for one servlet execution.
pub struct TaskContext<'a> {
    pub(crate) slots: &'a [SlotDef],
    pub(crate) pipes: &'a mut [Option<PipeHandle>],
    pub(crate) scope: &'a mut Scope,
    pub(crate) model: &'a TypeModel,
    pub(crate) instance: &'a mut Option<TypeInstance>,
    pub(crate) registry: &'a Arc<ModuleRegistry>,
}

impl std::fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl std::fmt::Debug for DataRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRequest").field("size", &self.size).finish()
    }
}

impl<'a> TaskContext<'a> {
    fn handle(&mut self, pipe: Pipe) -> crate::Result<&mut PipeHandle> {
        let id = pipe.id()?;
        if usize::from(id) >= self.slots.len() {
            return Err(Error::new_invalid_arg("pipe id out of range"));
        }
        self.pipes
            .get_mut(usize::from(id))
            .and_then(|p| p.as_mut())
            .ok_or_else(|| Error::new_invalid_arg("slot has no pipe"))
    }

    /// Read data-body bytes from an input pipe.
    pub fn read(&mut self, pipe: Pipe, buf: &mut [u8]) -> crate::Result<usize> {
        self.handle(pipe)?.read(buf)
    }

    /// Write data-body bytes to an output pipe.
    pub fn write(&mut self, pipe: Pipe, data: &[u8]) -> crate::Result<usize> {
        self.handle(pipe)?.write(data)
    }

    /// Whether the pipe definitely has no more data.
    pub fn eof(&mut self, pipe: Pipe) -> crate::Result<bool> {
        self.handle(pipe)?.eof()
    }

    /// Report end-of-message at `offset` within the last buffer read.
    pub fn eom(&mut self, pipe: Pipe, offset: u64) -> crate::Result<()> {
        self.handle(pipe)?.eom(offset)
    }

    /// The pipe's current flag bits.
    pub fn get_flags(&mut self, pipe: Pipe) -> crate::Result<PipeFlags> {
        Ok(self.handle(pipe)?.flags())
    }

    /// Set flag bits on the pipe, for this request only.
    pub fn set_flag(&mut self, pipe: Pipe, flags: PipeFlags) -> crate::Result<()> {
        self.handle(pipe)?.set_flag(flags);
        Ok(())
    }

    /// Clear flag bits on the pipe, for this request only.
    pub fn clr_flag(&mut self, pipe: Pipe, flags: PipeFlags) -> crate::Result<()> {
        self.handle(pipe)?.clr_flag(flags);
        Ok(())
    }

    /// Streamed typed-header read.
    pub fn read_hdr(&mut self, pipe: Pipe, buf: &mut [u8]) -> crate::Result<usize> {
        self.handle(pipe)?.read_hdr(buf)
    }

    /// Streamed typed-header write.
    pub fn write_hdr(&mut self, pipe: Pipe, data: &[u8]) -> crate::Result<usize> {
        self.handle(pipe)?.write_hdr(data)
    }

    /// The direct typed-header buffer, when the module can expose one.
    pub fn get_hdr_buf(&mut self, pipe: Pipe, nbytes: usize) -> crate::Result<Option<Bytes>> {
        self.handle(pipe)?.get_hdr_buf(nbytes)
    }

    /// A direct data-body buffer, when the module can expose one.
    pub fn get_data_buf(
        &mut self,
        pipe: Pipe,
        requested: usize,
    ) -> crate::Result<Option<DirectBuf>> {
        self.handle(pipe)?.get_data_buf(requested)
    }

    /// Release an undetermined-size data region with its actual size.
    pub fn put_data_buf(&mut self, pipe: Pipe, actual: usize) -> crate::Result<()> {
        self.handle(pipe)?.put_data_buf(actual)
    }

    /// Attach a state object to the pipe; `cleanup` runs when the handle
    /// is disposed.
    pub fn push_state(
        &mut self,
        pipe: Pipe,
        state: Box<dyn Any + Send>,
        cleanup: Option<Box<dyn FnOnce(Box<dyn Any + Send>) + Send>>,
    ) -> crate::Result<()> {
        self.handle(pipe)?.push_state(state, cleanup);
        Ok(())
    }

    /// Detach the most recently attached state object.
    pub fn pop_state(&mut self, pipe: Pipe) -> crate::Result<Box<dyn Any + Send>> {
        self.handle(pipe)?.pop_state()
    }

    /// Module-private control operation on the pipe. The NOP opcode
    /// succeeds without doing anything.
    pub fn cntl(&mut self, pipe: Pipe, opcode: Opcode, arg: &mut dyn Any) -> crate::Result<()> {
        if pipe.is_virtual() {
            if opcode == Opcode::INVOKE {
                return self.registry.invoke(pipe, arg);
            }
            return Err(Error::new_invalid_arg("cntl on a virtual slot"));
        }
        self.handle(pipe)?.cntl(opcode, arg)
    }

    /// Invoke a module service function through its virtual slot.
    pub fn invoke(&self, pipe: Pipe, arg: &mut dyn Any) -> crate::Result<()> {
        self.registry.invoke(pipe, arg)
    }

    /// The request's scope.
    pub fn scope(&self) -> &Scope {
        self.scope
    }

    /// The request's scope, mutably (insert, incref, decref).
    pub fn scope_mut(&mut self) -> &mut Scope {
        self.scope
    }

    /// The node's resolved type model.
    pub fn model(&self) -> &TypeModel {
        self.model
    }

    /// Read a typed-header field through its accessor.
    pub fn read_field(&mut self, accessor: Accessor, out: &mut [u8]) -> crate::Result<usize> {
        let TaskContext {
            model,
            instance,
            pipes,
            ..
        } = self;
        let instance = instance.get_or_insert_with(|| TypeInstance::new(model));
        let mut pipes = TaskPipes { pipes: &mut **pipes };
        instance.read(model, &mut pipes, accessor, out)
    }

    /// Write a typed-header field through its accessor.
    pub fn write_field(&mut self, accessor: Accessor, data: &[u8]) -> crate::Result<usize> {
        let TaskContext {
            model,
            instance,
            pipes,
            ..
        } = self;
        let instance = instance.get_or_insert_with(|| TypeInstance::new(model));
        let mut pipes = TaskPipes { pipes: &mut **pipes };
        instance.write(model, &mut pipes, accessor, data)
    }

    /// The resolved byte size of an accessor's field; 0 while unresolved.
    pub fn field_size(&self, accessor: Accessor) -> usize {
        self.model.field_size(accessor)
    }

    /// Write the full content of a scope token's stream to an output
    /// pipe.
    ///
    /// With a [`DataRequest`], up to `size` bytes from the head of the
    /// stream are offered to the caller's handler first (they do not
    /// reach the pipe); everything the handler declines — and the entire
    /// remainder of the stream — is drained to the pipe in bounded
    /// chunks, with no payload-sized intermediate buffer.
    pub fn write_scope_token(
        &mut self,
        pipe: Pipe,
        token: ScopeToken,
        data_req: Option<DataRequest<'_>>,
    ) -> crate::Result<()> {
        let id = pipe.id()?;
        let mut stream = self.scope.open_stream(token)?;
        let handle = self
            .pipes
            .get_mut(usize::from(id))
            .and_then(|p| p.as_mut())
            .ok_or_else(|| Error::new_invalid_arg("slot has no pipe"))?;

        let mut preamble = data_req;
        let mut remaining = preamble.as_ref().map(|r| r.size).unwrap_or(0);

        let mut chunk = [0u8; 8192];
        loop {
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                if stream.eos()? {
                    break;
                }
                return Err(Error::new_io(std::io::ErrorKind::WouldBlock.into()));
            }
            let mut off = 0;
            if let Some(ref mut req) = preamble {
                while off < n && remaining > 0 {
                    let offer = std::cmp::min(n - off, remaining);
                    match (req.handler)(&chunk[off..off + offer]) {
                        Ok(0) => {
                            remaining = 0;
                        }
                        Ok(handled) => {
                            let handled = std::cmp::min(handled, offer);
                            off += handled;
                            remaining -= handled;
                        }
                        Err(_) => {
                            // the handler gave up; the drain still runs
                            remaining = 0;
                        }
                    }
                }
                if remaining == 0 {
                    preamble = None;
                }
            }
            while off < n {
                let written = handle.write(&chunk[off..n])?;
                if written == 0 {
                    return Err(Error::new_io(std::io::ErrorKind::WriteZero.into()));
                }
                off += written;
            }
        }
        Ok(())
    }

    /// Resolve a module service function to a virtual slot.
    pub fn get_module_func(&self, module_path: &str, func: &str) -> crate::Result<Pipe> {
        self.registry.get_module_func(module_path, func)
    }

    /// Open a module instance by its exact path.
    pub fn mod_open(&self, path: &str) -> crate::Result<u8> {
        self.registry.mod_open(path)
    }

    /// The cntl-opcode prefix shared by module instances under `path`.
    pub fn mod_cntl_prefix(&self, path: &str) -> crate::Result<Option<u8>> {
        self.registry.mod_cntl_prefix(path)
    }

    /// Hand control back to the framework at a numbered trap point.
    ///
    /// Traps are observation hooks: the runtime records them for
    /// diagnostics and resumes the servlet immediately.
    pub fn trap(&self, id: u32) {
        tracing::debug!(trap = id, "servlet trap");
    }

    /// The runtime version string.
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
