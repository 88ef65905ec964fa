//! Pipe handles and the transport seam.
//!
//! A pipe is one edge of the service graph, instantiated per request. Each
//! endpoint is a [`PipeHandle`]: a thin wrapper over a transport-module
//! port that adds the flag word, the typed-header accounting, the state
//! stack, and the generic control surface. Handles are owned by exactly
//! one task at a time; shadow handles are extra read views over an
//! existing edge and own no transport state of their own.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;

pub(crate) mod cntl;
pub(crate) mod flags;
pub mod mem;
pub(crate) mod module;

pub use self::cntl::Opcode;
pub use self::flags::PipeFlags;
pub use self::module::{DirectBuf, ModulePort, ModuleRegistry, TransportModule};

/// The servlet-local identifier of one pipe slot.
pub type PipeId = u16;

/// A 32-bit pipe slot value.
///
/// Two layouts share the representation: a *real* pipe has `0xFF` in the
/// top byte and the pipe id in the low 16 bits; anything else is a
/// *virtual* slot naming a module service function — the top byte selects
/// the module instance and the low 24 bits are its opcode.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pipe(u32);

impl Pipe {
    const REAL_MASK: u32 = 0xff00_0000;

    /// A real pipe slot from its id.
    pub fn from_id(id: PipeId) -> Pipe {
        Pipe(Self::REAL_MASK | u32::from(id))
    }

    /// A virtual slot naming a module service function.
    pub fn virtual_slot(module: u8, opcode: u32) -> Pipe {
        Pipe((u32::from(module) << 24) | (opcode & 0x00ff_ffff))
    }

    /// Whether this slot refers to a module function rather than a pipe.
    pub fn is_virtual(self) -> bool {
        self.0 & Self::REAL_MASK != Self::REAL_MASK
    }

    /// The pipe id of a real slot.
    pub fn id(self) -> crate::Result<PipeId> {
        if self.is_virtual() {
            return Err(Error::new_invalid_arg("virtual slot used as a pipe"));
        }
        Ok((self.0 & 0xffff) as PipeId)
    }

    /// The module instance of a virtual slot.
    pub fn virtual_module(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The opcode of a virtual slot.
    pub fn virtual_opcode(self) -> u32 {
        self.0 & 0x00ff_ffff
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_virtual() {
            write!(
                f,
                "Pipe(virtual, module={}, op={:#x})",
                self.virtual_module(),
                self.virtual_opcode()
            )
        } else {
            write!(f, "Pipe({})", self.0 & 0xffff)
        }
    }
}

type StateCleanup = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

struct StateEntry {
    state: Box<dyn Any + Send>,
    cleanup: Option<StateCleanup>,
}

/// One endpoint of one instantiated edge.
pub struct PipeHandle {
    port: Box<dyn ModulePort>,
    flags: PipeFlags,
    module: u8,
    module_path: Arc<str>,
    /// Size of the typed-header prefix declared by the edge's type.
    hdr_size: usize,
    hdr_read: usize,
    hdr_written: usize,
    states: Vec<StateEntry>,
}

impl PipeHandle {
    /// Wrap a transport port as a pipe handle.
    ///
    /// The runtime builds handles when it instantiates edges; transports
    /// and tests build external handles directly.
    pub fn new(
        port: Box<dyn ModulePort>,
        flags: PipeFlags,
        hdr_size: usize,
    ) -> PipeHandle {
        PipeHandle {
            port,
            flags,
            module: Opcode::GENERIC_MODULE,
            module_path: Arc::from(""),
            hdr_size,
            hdr_read: 0,
            hdr_written: 0,
            states: Vec::new(),
        }
    }

    /// Attach the owning module's instance id and path, used by cntl
    /// dispatch and `mod_path`.
    pub fn with_module(mut self, module: u8, path: Arc<str>) -> PipeHandle {
        self.module = module;
        self.module_path = path;
        self
    }

    /// The current flag bits.
    pub fn flags(&self) -> PipeFlags {
        self.flags
    }

    /// Set flag bits (the target id is not affected).
    pub fn set_flag(&mut self, f: PipeFlags) {
        self.flags.insert(f);
        if f.contains(PipeFlags::PERSIST) {
            self.port.set_persist(true);
        }
    }

    /// Clear flag bits (the target id is not affected).
    pub fn clr_flag(&mut self, f: PipeFlags) {
        self.flags.remove(f);
        if f.contains(PipeFlags::PERSIST) {
            self.port.set_persist(false);
        }
    }

    /// The declared typed-header size of this edge.
    pub fn hdr_size(&self) -> usize {
        self.hdr_size
    }

    /// The owning module instance id.
    pub fn module_id(&self) -> u8 {
        self.module
    }

    /// The underlying module instance path.
    pub fn mod_path(&self) -> &str {
        &self.module_path
    }

    /// Read data-body bytes. Any unconsumed typed-header bytes are skipped
    /// first, so reading the body directly is how a servlet ignores the
    /// header section.
    pub fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if self.flags.is_output() {
            return Err(Error::new_invalid_arg("read on an output pipe"));
        }
        if !self.skip_header()? {
            return Ok(0);
        }
        self.port.read(buf)
    }

    /// Write data-body bytes. If the typed header has not been fully
    /// written yet, the remainder is zero-filled first so the header
    /// region always occupies its declared size on the wire.
    pub fn write(&mut self, data: &[u8]) -> crate::Result<usize> {
        if self.flags.is_input() {
            return Err(Error::new_invalid_arg("write on an input pipe"));
        }
        self.pad_header()?;
        self.port.write(data)
    }

    /// Streamed typed-header read. Reads at most the unconsumed part of
    /// the declared header region.
    pub fn read_hdr(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if self.flags.is_output() {
            return Err(Error::new_invalid_arg("read_hdr on an output pipe"));
        }
        let remaining = self.hdr_size - self.hdr_read;
        let n = std::cmp::min(buf.len(), remaining);
        if n == 0 {
            return Ok(0);
        }
        let got = self.port.read(&mut buf[..n])?;
        self.hdr_read += got;
        Ok(got)
    }

    /// Streamed typed-header write. Bytes beyond the declared header size
    /// are silently dropped; the full input length is reported as
    /// accepted so callers' flush loops terminate.
    pub fn write_hdr(&mut self, data: &[u8]) -> crate::Result<usize> {
        if self.flags.is_input() {
            return Err(Error::new_invalid_arg("write_hdr on an input pipe"));
        }
        let remaining = self.hdr_size - self.hdr_written;
        let n = std::cmp::min(data.len(), remaining);
        if n > 0 {
            let mut off = 0;
            while off < n {
                let written = self.port.write(&data[off..n])?;
                if written == 0 {
                    return Err(Error::new_io(std::io::ErrorKind::WriteZero.into()));
                }
                off += written;
            }
            self.hdr_written += n;
        }
        Ok(data.len())
    }

    /// Request a contiguous internal buffer holding at least `nbytes` of
    /// the typed header, advancing the read position past it.
    ///
    /// Defined only while no header byte has been consumed yet; after a
    /// partial `read_hdr` the call reports `None` and the caller must
    /// stay on the streamed path. `None` is also the answer when the
    /// module cannot produce a contiguous region; it is not an error.
    pub fn get_hdr_buf(&mut self, nbytes: usize) -> crate::Result<Option<Bytes>> {
        if self.flags.is_output() {
            return Err(Error::new_invalid_arg("get_hdr_buf on an output pipe"));
        }
        if self.hdr_read != 0 || nbytes > self.hdr_size {
            return Ok(None);
        }
        match self.port.get_contiguous(nbytes)? {
            Some(bytes) => {
                debug_assert!(bytes.len() >= nbytes);
                self.hdr_read = nbytes;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Request an internal buffer covering up to `requested` bytes of the
    /// data body. See [`DirectBuf`] for the size-range contract; a
    /// `lower` of 0 blocks further reads until [`PipeHandle::put_data_buf`].
    pub fn get_data_buf(&mut self, requested: usize) -> crate::Result<Option<DirectBuf>> {
        if self.flags.is_output() {
            return Err(Error::new_invalid_arg("get_data_buf on an output pipe"));
        }
        if !self.skip_header()? {
            return Ok(None);
        }
        self.port.get_buf(requested)
    }

    /// Establish the actual size of an undetermined-size data region.
    pub fn put_data_buf(&mut self, actual: usize) -> crate::Result<()> {
        self.port.put_buf(actual)
    }

    /// Whether the pipe definitely has no more data.
    pub fn eof(&self) -> crate::Result<bool> {
        self.port.eof()
    }

    /// Tell the module end-of-message was found at `offset` within the
    /// last buffer read.
    pub fn eom(&mut self, offset: u64) -> crate::Result<()> {
        self.port.eom(offset)
    }

    /// Attach a state object to the handle. `cleanup` runs if the state
    /// is still attached when the handle is disposed.
    pub fn push_state(
        &mut self,
        state: Box<dyn Any + Send>,
        cleanup: Option<StateCleanup>,
    ) {
        self.states.push(StateEntry { state, cleanup });
    }

    /// Detach and return the most recently attached state object.
    pub fn pop_state(&mut self) -> crate::Result<Box<dyn Any + Send>> {
        match self.states.pop() {
            Some(entry) => Ok(entry.state),
            None => Err(Error::new_programming("pop_state without push_state")),
        }
    }

    /// Module-private control operation. The opcode's top byte must match
    /// this handle's module; the NOP sentinel succeeds without doing
    /// anything.
    pub fn cntl(&mut self, opcode: Opcode, arg: &mut dyn Any) -> crate::Result<()> {
        if opcode.is_nop() {
            return Ok(());
        }
        if opcode.module_id() == Opcode::GENERIC_MODULE {
            return Err(Error::new_invalid_arg(
                "generic opcodes map to PipeHandle methods",
            ));
        }
        if opcode.module_id() != self.module {
            return Err(Error::new_invalid_arg("cntl opcode for another module"));
        }
        self.port.cntl(opcode.mod_spec(), arg)
    }

    /// Fork a shadow view of this (read) endpoint: a second read end over
    /// the same edge, carrying `SHADOW | INPUT`, the mirrored slot in the
    /// target bits, and only the shared flags of the original.
    pub(crate) fn fork_shadow(
        &self,
        target: PipeId,
        disabled: bool,
    ) -> crate::Result<PipeHandle> {
        if self.flags.is_output() {
            return Err(Error::new_invalid_arg("shadow fork of an output pipe"));
        }
        let port = self.port.fork()?;
        let mut flags = (PipeFlags::INPUT | PipeFlags::SHADOW | self.flags.shared())
            .with_target(target);
        if disabled {
            flags.insert(PipeFlags::DISABLED);
        }
        Ok(PipeHandle {
            port,
            flags,
            module: self.module,
            module_path: Arc::clone(&self.module_path),
            hdr_size: self.hdr_size,
            hdr_read: 0,
            hdr_written: 0,
            states: Vec::new(),
        })
    }

    /// Consume any typed-header bytes not yet read, so body operations see
    /// only body bytes. Returns false when the header could not be fully
    /// skipped yet (no data available).
    fn skip_header(&mut self) -> crate::Result<bool> {
        let mut scratch = [0u8; 64];
        while self.hdr_read < self.hdr_size {
            let want = std::cmp::min(scratch.len(), self.hdr_size - self.hdr_read);
            let got = self.port.read(&mut scratch[..want])?;
            if got == 0 {
                if self.port.eof()? {
                    // short header stream: nothing more will arrive
                    self.hdr_read = self.hdr_size;
                    return Ok(true);
                }
                return Ok(false);
            }
            self.hdr_read += got;
        }
        Ok(true)
    }

    /// Zero-fill the unwritten remainder of the header region.
    fn pad_header(&mut self) -> crate::Result<()> {
        let zeros = [0u8; 64];
        while self.hdr_written < self.hdr_size {
            let n = std::cmp::min(zeros.len(), self.hdr_size - self.hdr_written);
            let written = self.port.write(&zeros[..n])?;
            if written == 0 {
                return Err(Error::new_io(std::io::ErrorKind::WriteZero.into()));
            }
            self.hdr_written += written;
        }
        Ok(())
    }
}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        while let Some(entry) = self.states.pop() {
            if let Some(cleanup) = entry.cleanup {
                cleanup(entry.state);
            }
        }
    }
}

impl fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeHandle")
            .field("flags", &self.flags)
            .field("module", &self.module)
            .field("hdr_size", &self.hdr_size)
            .finish()
    }
}
