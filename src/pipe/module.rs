//! The transport module seam.
//!
//! Everything that moves bytes — TCP, TLS, shared memory — lives behind
//! [`TransportModule`]. The runtime core only ever sees module *instances*
//! registered under dotted paths (`pipe.mem.test0`) and per-edge endpoint
//! objects ([`ModulePort`]) those instances hand out.
//!
//! Several instances may be created from the same module *binary* with
//! different parameters (two TLS listeners on different ports, say).
//! Module-private cntl opcodes are namespaced by an 8-bit instance id, and
//! [`ModuleRegistry::mod_cntl_prefix`] resolves a path prefix to one
//! representative instance of a binary, so servlet code can stay
//! transport-transparent.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;
use crate::pipe::Pipe;

/// A borrowed view of a module's internal data-body buffer.
///
/// `lower == upper` means the module knows exactly where the body ends.
/// `lower == 0` means the end is undetermined: the reader must scan, and
/// every further read on the handle is blocked until
/// [`PipeHandle::put_data_buf`](crate::pipe::PipeHandle::put_data_buf)
/// establishes the actual size.
#[derive(Debug, Clone)]
pub struct DirectBuf {
    /// The exposed bytes. At most the requested size.
    pub bytes: Bytes,
    /// The smallest size the region is known to be.
    pub lower: usize,
    /// The largest size the region may be.
    pub upper: usize,
}

/// One endpoint of one pipe, produced by a transport module.
pub trait ModulePort: Send {
    /// Read bytes into `buf`. Returning 0 means no bytes are available
    /// right now; pair with [`ModulePort::eof`] to detect the stream end.
    fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize>;

    /// Write bytes from `data`, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> crate::Result<usize>;

    /// Whether the pipe definitely has no more data.
    fn eof(&self) -> crate::Result<bool>;

    /// End-of-message marker at `offset` within the last buffer read.
    fn eom(&mut self, offset: u64) -> crate::Result<()> {
        let _ = offset;
        Ok(())
    }

    /// Expose a contiguous internal buffer of exactly `nbytes`, advancing
    /// the read position. `None` when fragmented, unsupported, or not
    /// enough contiguous bytes are available.
    fn get_contiguous(&mut self, nbytes: usize) -> crate::Result<Option<Bytes>> {
        let _ = nbytes;
        Ok(None)
    }

    /// Expose an internal buffer covering up to `requested` bytes of the
    /// data body. See [`DirectBuf`] for the size-range contract.
    fn get_buf(&mut self, requested: usize) -> crate::Result<Option<DirectBuf>> {
        let _ = requested;
        Ok(None)
    }

    /// Establish the actual size of an undetermined-size region handed out
    /// by [`ModulePort::get_buf`]. Ignored when no such region is
    /// outstanding.
    fn put_buf(&mut self, actual: usize) -> crate::Result<()> {
        let _ = actual;
        Ok(())
    }

    /// Fork a second read view over the same bytes. Only meaningful on
    /// read ends; write ends refuse.
    fn fork(&self) -> crate::Result<Box<dyn ModulePort>>;

    /// The persist hint. Default: ignored, as allowed by the contract.
    fn set_persist(&mut self, on: bool) {
        let _ = on;
    }

    /// Module-private per-endpoint control operation.
    fn cntl(&mut self, op: u32, arg: &mut dyn Any) -> crate::Result<()> {
        let _ = (op, arg);
        Err(Error::new_unsupported("module port cntl"))
    }
}

/// A transport module binary: a factory for pipes plus the module-scoped
/// service entry points.
pub trait TransportModule: Send + Sync {
    /// The binary name shared by all instances created from this module
    /// implementation, e.g. `pipe.mem`.
    fn binary(&self) -> &str;

    /// Create a new pipe, returning its write and read endpoints.
    fn open_pipe(&self) -> crate::Result<(Box<dyn ModulePort>, Box<dyn ModulePort>)>;

    /// Module-scoped control operation (as opposed to per-endpoint cntl).
    fn cntl(&self, op: u32, arg: &mut dyn Any) -> crate::Result<()> {
        let _ = (op, arg);
        Err(Error::new_unsupported("module cntl"))
    }

    /// Look up a module service function by name, returning the opcode a
    /// virtual pipe slot should carry. `None` when the module exports no
    /// such function.
    fn service_opcode(&self, func: &str) -> Option<u32> {
        let _ = func;
        None
    }

    /// Invoke a module service function through a virtual slot.
    fn service_call(&self, op: u32, arg: &mut dyn Any) -> crate::Result<()> {
        let _ = (op, arg);
        Err(Error::new_unsupported("module service call"))
    }
}

/// A registered module instance.
struct Instance {
    path: String,
    module: Arc<dyn TransportModule>,
}

/// The set of module instances available to a process.
///
/// Instance ids are 8 bits; id `0xFF` is reserved for the runtime-generic
/// opcode space and is never assigned.
pub struct ModuleRegistry {
    instances: Vec<Instance>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            instances: Vec::new(),
        }
    }

    /// Register a module instance under the given dotted path, returning
    /// its instance id.
    pub fn register(
        &mut self,
        path: &str,
        module: Arc<dyn TransportModule>,
    ) -> crate::Result<u8> {
        if path.is_empty() {
            return Err(Error::new_invalid_arg("module register: empty path"));
        }
        if self.instances.len() >= usize::from(u8::MAX) {
            return Err(Error::new_exhausted("module instance ids"));
        }
        if self.instances.iter().any(|i| i.path == path) {
            return Err(Error::new_invalid_arg("module register: duplicate path"));
        }
        let id = self.instances.len() as u8;
        tracing::debug!(path, id, binary = module.binary(), "module registered");
        self.instances.push(Instance {
            path: path.to_owned(),
            module,
        });
        Ok(id)
    }

    /// Open a module by its exact instance path.
    pub fn mod_open(&self, path: &str) -> crate::Result<u8> {
        self.instances
            .iter()
            .position(|i| i.path == path)
            .map(|p| p as u8)
            .ok_or_else(|| Error::new_invalid_arg("mod_open: no such module"))
    }

    /// The module instance with the given id.
    pub fn get(&self, id: u8) -> Option<&Arc<dyn TransportModule>> {
        self.instances.get(usize::from(id)).map(|i| &i.module)
    }

    /// The instance path for a module id.
    pub fn path(&self, id: u8) -> Option<&str> {
        self.instances.get(usize::from(id)).map(|i| i.path.as_str())
    }

    /// Resolve a path prefix to the representative instance id of the one
    /// module binary instantiated under it.
    ///
    /// `Ok(None)` means no instance lives under the prefix — the caller
    /// translates that into [`Opcode::NOP`](crate::pipe::Opcode::NOP)
    /// rather than an error. Instances from two different binaries under
    /// the same prefix are an error, because their opcode spaces differ.
    pub fn mod_cntl_prefix(&self, path: &str) -> crate::Result<Option<u8>> {
        let mut found: Option<(u8, &str)> = None;
        for (idx, inst) in self.instances.iter().enumerate() {
            let matches = inst.path == path
                || (inst.path.len() > path.len()
                    && inst.path.starts_with(path)
                    && inst.path.as_bytes()[path.len()] == b'.');
            if !matches {
                continue;
            }
            match found {
                None => found = Some((idx as u8, inst.module.binary())),
                Some((_, binary)) => {
                    if binary != inst.module.binary() {
                        return Err(Error::new_invalid_arg(
                            "mod_cntl_prefix: mixed module binaries under prefix",
                        ));
                    }
                }
            }
        }
        Ok(found.map(|(id, _)| id))
    }

    /// Resolve a module service function to a virtual pipe slot.
    pub fn get_module_func(&self, path: &str, func: &str) -> crate::Result<Pipe> {
        let id = self.mod_open(path)?;
        let module = &self.instances[usize::from(id)].module;
        let op = module
            .service_opcode(func)
            .ok_or_else(|| Error::new_invalid_arg("get_module_func: no such function"))?;
        Ok(Pipe::virtual_slot(id, op))
    }

    /// Invoke a virtual slot previously returned by
    /// [`ModuleRegistry::get_module_func`].
    pub fn invoke(&self, pipe: Pipe, arg: &mut dyn Any) -> crate::Result<()> {
        if !pipe.is_virtual() {
            return Err(Error::new_invalid_arg("invoke: not a virtual slot"));
        }
        let module = self
            .get(pipe.virtual_module())
            .ok_or_else(|| Error::new_invalid_arg("invoke: unknown module"))?;
        module.service_call(pipe.virtual_opcode(), arg)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("instances", &self.instances.len())
            .finish()
    }
}

/// A port wired to nothing: reads are at EOF, writes are discarded.
///
/// Used for optional slots the service graph left unwired.
pub(crate) struct NullPort;

impl ModulePort for NullPort {
    fn read(&mut self, _buf: &mut [u8]) -> crate::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> crate::Result<usize> {
        Ok(data.len())
    }

    fn eof(&self) -> crate::Result<bool> {
        Ok(true)
    }

    fn fork(&self) -> crate::Result<Box<dyn ModulePort>> {
        Ok(Box::new(NullPort))
    }
}
