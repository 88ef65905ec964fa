//! The in-memory transport module.
//!
//! `pipe.mem` is the loopback transport: the write end accumulates bytes
//! into a single buffer and, once closed, readers consume a frozen
//! zero-copy snapshot of it. Forked read views (shadow pipes) clone the
//! snapshot handle, never the bytes, so broadcasting a payload costs one
//! transport write no matter how many consumers see it.
//!
//! The module doubles as the test transport: it counts writes, can be
//! configured to refuse contiguous-buffer requests (forcing the streamed
//! header fallback), and can report undetermined body sizes (exercising
//! the put-buffer protocol).

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::Error;
use crate::pipe::module::{DirectBuf, ModulePort, TransportModule};

/// Module service opcode: report the number of transport writes so far.
pub const FUNC_WRITE_COUNT: u32 = 1;

/// Module-private endpoint cntl: read back the recorded end-of-message
/// offset into an `&mut Option<u64>`.
pub const CNTL_EOM_OFFSET: u32 = 1;

/// Counters shared by every pipe a [`MemModule`] instance creates.
#[derive(Debug, Default)]
pub struct MemStats {
    writes: AtomicUsize,
    pipes: AtomicUsize,
}

impl MemStats {
    /// Transport-level write calls across all pipes of the instance.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// Pipes opened by the instance.
    pub fn pipes(&self) -> usize {
        self.pipes.load(Ordering::Acquire)
    }
}

/// The in-memory transport module.
pub struct MemModule {
    stats: Arc<MemStats>,
    fragmented: bool,
    unsized_data: bool,
}

impl MemModule {
    /// A memory module with default behaviour.
    pub fn new() -> MemModule {
        MemModule {
            stats: Arc::new(MemStats::default()),
            fragmented: false,
            unsized_data: false,
        }
    }

    /// Refuse every contiguous-buffer request, forcing readers onto the
    /// streamed fallback path.
    pub fn fragmented(mut self, on: bool) -> MemModule {
        self.fragmented = on;
        self
    }

    /// Report data-body buffers with an undetermined end, so readers must
    /// scan and release them explicitly.
    pub fn unsized_data(mut self, on: bool) -> MemModule {
        self.unsized_data = on;
        self
    }

    /// The instance's shared counters.
    pub fn stats(&self) -> Arc<MemStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for MemModule {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemModule")
            .field("fragmented", &self.fragmented)
            .field("unsized_data", &self.unsized_data)
            .finish()
    }
}

impl TransportModule for MemModule {
    fn binary(&self) -> &str {
        "pipe.mem"
    }

    fn open_pipe(&self) -> crate::Result<(Box<dyn ModulePort>, Box<dyn ModulePort>)> {
        self.stats.pipes.fetch_add(1, Ordering::AcqRel);
        let core = Arc::new(Core {
            state: Mutex::new(CoreState {
                data: BytesMut::new(),
                frozen: None,
                closed: false,
                eom: None,
            }),
        });
        let tx = MemTx {
            core: Arc::clone(&core),
            stats: Arc::clone(&self.stats),
        };
        let rx = MemRx {
            core,
            pos: 0,
            outstanding: None,
            fragmented: self.fragmented,
            unsized_data: self.unsized_data,
        };
        Ok((Box::new(tx), Box::new(rx)))
    }

    fn service_opcode(&self, func: &str) -> Option<u32> {
        match func {
            "write_count" => Some(FUNC_WRITE_COUNT),
            _ => None,
        }
    }

    fn service_call(&self, op: u32, arg: &mut dyn Any) -> crate::Result<()> {
        match op {
            FUNC_WRITE_COUNT => {
                let out = arg
                    .downcast_mut::<usize>()
                    .ok_or_else(|| Error::new_invalid_arg("write_count: expects &mut usize"))?;
                *out = self.stats.writes();
                Ok(())
            }
            _ => Err(Error::new_unsupported("mem service call")),
        }
    }
}

struct CoreState {
    data: BytesMut,
    frozen: Option<Bytes>,
    closed: bool,
    eom: Option<u64>,
}

struct Core {
    state: Mutex<CoreState>,
}

struct MemTx {
    core: Arc<Core>,
    stats: Arc<MemStats>,
}

impl ModulePort for MemTx {
    fn read(&mut self, _buf: &mut [u8]) -> crate::Result<usize> {
        Err(Error::new_invalid_arg("read on a write endpoint"))
    }

    fn write(&mut self, data: &[u8]) -> crate::Result<usize> {
        let mut state = self.core.state.lock();
        if state.closed {
            return Err(Error::new_io(std::io::ErrorKind::BrokenPipe.into()));
        }
        state.data.extend_from_slice(data);
        self.stats.writes.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(len = data.len(), "mem pipe write");
        Ok(data.len())
    }

    fn eof(&self) -> crate::Result<bool> {
        Ok(false)
    }

    fn fork(&self) -> crate::Result<Box<dyn ModulePort>> {
        Err(Error::new_invalid_arg("fork on a write endpoint"))
    }
}

impl Drop for MemTx {
    fn drop(&mut self) {
        let mut state = self.core.state.lock();
        let data = state.data.split().freeze();
        tracing::trace!(len = data.len(), "mem pipe closed");
        state.frozen = Some(data);
        state.closed = true;
    }
}

struct MemRx {
    core: Arc<Core>,
    pos: usize,
    /// Base position and length of an undetermined-size region handed out
    /// by `get_buf`, blocking further reads until released.
    outstanding: Option<(usize, usize)>,
    fragmented: bool,
    unsized_data: bool,
}

impl MemRx {
    fn snapshot(&self) -> Option<Bytes> {
        self.core.state.lock().frozen.clone()
    }
}

impl ModulePort for MemRx {
    fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if self.outstanding.is_some() {
            return Ok(0);
        }
        let data = match self.snapshot() {
            Some(data) => data,
            None => return Ok(0),
        };
        let n = std::cmp::min(buf.len(), data.len() - self.pos.min(data.len()));
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, _data: &[u8]) -> crate::Result<usize> {
        Err(Error::new_invalid_arg("write on a read endpoint"))
    }

    fn eof(&self) -> crate::Result<bool> {
        let state = self.core.state.lock();
        match state.frozen {
            Some(ref data) => Ok(self.pos >= data.len() && self.outstanding.is_none()),
            None => Ok(false),
        }
    }

    fn eom(&mut self, offset: u64) -> crate::Result<()> {
        self.core.state.lock().eom = Some(offset);
        Ok(())
    }

    fn get_contiguous(&mut self, nbytes: usize) -> crate::Result<Option<Bytes>> {
        if self.fragmented || self.outstanding.is_some() {
            return Ok(None);
        }
        let data = match self.snapshot() {
            Some(data) => data,
            None => return Ok(None),
        };
        if data.len() - self.pos < nbytes {
            return Ok(None);
        }
        let out = data.slice(self.pos..self.pos + nbytes);
        self.pos += nbytes;
        Ok(Some(out))
    }

    fn get_buf(&mut self, requested: usize) -> crate::Result<Option<DirectBuf>> {
        if self.fragmented || self.outstanding.is_some() {
            return Ok(None);
        }
        let data = match self.snapshot() {
            Some(data) => data,
            None => return Ok(None),
        };
        let avail = data.len() - self.pos.min(data.len());
        if avail == 0 {
            return Ok(None);
        }
        let take = std::cmp::min(requested, avail);
        let bytes = data.slice(self.pos..self.pos + take);
        if self.unsized_data {
            self.outstanding = Some((self.pos, take));
            Ok(Some(DirectBuf {
                bytes,
                lower: 0,
                upper: take,
            }))
        } else {
            self.pos += take;
            Ok(Some(DirectBuf {
                bytes,
                lower: take,
                upper: take,
            }))
        }
    }

    fn put_buf(&mut self, actual: usize) -> crate::Result<()> {
        if let Some((base, len)) = self.outstanding.take() {
            self.pos = base + std::cmp::min(actual, len);
        }
        Ok(())
    }

    fn fork(&self) -> crate::Result<Box<dyn ModulePort>> {
        Ok(Box::new(MemRx {
            core: Arc::clone(&self.core),
            pos: 0,
            outstanding: None,
            fragmented: self.fragmented,
            unsized_data: self.unsized_data,
        }))
    }

    fn cntl(&mut self, op: u32, arg: &mut dyn Any) -> crate::Result<()> {
        match op {
            CNTL_EOM_OFFSET => {
                let out = arg
                    .downcast_mut::<Option<u64>>()
                    .ok_or_else(|| Error::new_invalid_arg("eom_offset: expects &mut Option<u64>"))?;
                *out = self.core.state.lock().eom;
                Ok(())
            }
            _ => Err(Error::new_unsupported("mem endpoint cntl")),
        }
    }
}
