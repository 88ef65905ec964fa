//! The per-execution typed-header scratch buffer.
//!
//! One [`TypeInstance`] is created for each servlet execution. It lazily
//! buffers the header bytes of every slot the servlet actually touches —
//! preferring a zero-copy direct buffer from the transport when the module
//! can produce one, falling back to streamed header reads otherwise — and
//! flushes the written header regions of output slots back to their pipes
//! when the task finishes.

use bytes::Bytes;

use crate::error::Error;
use crate::pipe::{PipeHandle, PipeId};
use crate::proto::model::{Accessor, TypeModel};

/// Looks up the pipe handle wired to a slot for the running task.
pub(crate) trait PipeAccess {
    fn pipe(&mut self, id: PipeId) -> crate::Result<&mut PipeHandle>;
}

#[derive(Default)]
struct SlotBuf {
    /// Bytes of the inline region that hold valid header data.
    valid: usize,
    /// A direct transport buffer captured instead of inline data.
    direct: Option<Bytes>,
}

/// The scratch buffer holding header bytes for all of a servlet's slots
/// during one execution.
pub struct TypeInstance {
    buf: Vec<u8>,
    slots: Vec<SlotBuf>,
}

impl std::fmt::Debug for TypeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInstance")
            .field("buf_len", &self.buf.len())
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl TypeInstance {
    /// A fresh instance sized for the given model.
    pub(crate) fn new(model: &TypeModel) -> TypeInstance {
        let mut slots = Vec::with_capacity(model.slot_count());
        slots.resize_with(model.slot_count(), SlotBuf::default);
        TypeInstance {
            buf: vec![0u8; model.instance_buf_size()],
            slots,
        }
    }

    /// Read a field through its accessor into `out`, returning the bytes
    /// copied. An accessor whose slot was never wired reads 0 bytes.
    pub(crate) fn read(
        &mut self,
        model: &TypeModel,
        pipes: &mut dyn PipeAccess,
        accessor: Accessor,
        out: &mut [u8],
    ) -> crate::Result<usize> {
        let entry = model.accessor_entry(accessor)?;
        if !entry.resolved {
            return Ok(0);
        }
        let n = std::cmp::min(out.len(), entry.size as usize);
        if n == 0 {
            return Ok(0);
        }
        let (slot, offset) = (entry.slot, entry.offset as usize);
        self.ensure_read(model, pipes, slot, offset + n, true)?;

        let info = model.slot(slot).expect("resolved slot has info");
        let state = &self.slots[usize::from(slot)];
        if let Some(ref direct) = state.direct {
            out[..n].copy_from_slice(&direct[offset..offset + n]);
        } else if state.valid > 0 {
            let begin = info.buf_begin + offset;
            out[..n].copy_from_slice(&self.buf[begin..begin + n]);
        } else {
            // the upstream produced no header bytes at all
            return Ok(0);
        }
        Ok(n)
    }

    /// Write a field through its accessor, returning the bytes accepted.
    /// An accessor whose slot was never wired accepts 0 bytes.
    pub(crate) fn write(
        &mut self,
        model: &TypeModel,
        pipes: &mut dyn PipeAccess,
        accessor: Accessor,
        data: &[u8],
    ) -> crate::Result<usize> {
        let entry = model.accessor_entry(accessor)?;
        if !entry.resolved {
            return Ok(0);
        }
        let n = std::cmp::min(data.len(), entry.size as usize);
        if n == 0 {
            return Ok(0);
        }
        let (slot, offset) = (entry.slot, entry.offset as usize);
        self.ensure_write(model, pipes, slot, offset + n)?;

        let info = model.slot(slot).expect("resolved slot has info");
        let begin = info.buf_begin + offset;
        self.buf[begin..begin + n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Flush every output slot's written header region to its pipe.
    /// A copy-declared slot that was never written pulls its source's
    /// bytes first, so undisturbed headers pass through unchanged.
    pub(crate) fn flush(
        &mut self,
        model: &TypeModel,
        pipes: &mut dyn PipeAccess,
    ) -> crate::Result<()> {
        for id in 0..model.slot_count() as u16 {
            let info = match model.slot(id) {
                Some(info) if info.resolved => info,
                _ => continue,
            };
            if self.slots[usize::from(id)].valid == 0 && info.copy_from.is_some() {
                let copied = self.copy_header_data(model, pipes, id)?;
                if !copied && info.used_size == 0 {
                    continue;
                }
            }
            let state = &self.slots[usize::from(id)];
            if state.valid == 0 {
                continue;
            }
            let pipe = pipes.pipe(id)?;
            if pipe.flags().is_input() {
                continue;
            }
            let begin = info.buf_begin;
            let valid = state.valid;
            pipe.write_hdr(&self.buf[begin..begin + valid])?;
            tracing::trace!(slot = id, bytes = valid, "header flushed");
        }
        Ok(())
    }

    /// Make sure the first `nbytes` of the slot's header are buffered,
    /// trying the direct-buffer shortcut first when nothing has been read
    /// yet. With `strict`, a stream that ends after some but not all of
    /// the requested bytes is an error; without it, the short prefix is
    /// kept (the copy path zero-fills the remainder).
    fn ensure_read(
        &mut self,
        model: &TypeModel,
        pipes: &mut dyn PipeAccess,
        slot: PipeId,
        nbytes: usize,
        strict: bool,
    ) -> crate::Result<()> {
        let info = model
            .slot(slot)
            .ok_or_else(|| Error::new_invalid_arg("accessor on unknown slot"))?;
        let state = &self.slots[usize::from(slot)];
        if state.direct.is_some() {
            return Ok(());
        }
        let used = info.used_size as usize;
        let mut valid = state.valid;
        if valid >= nbytes {
            return Ok(());
        }

        let pipe = pipes.pipe(slot)?;
        if valid == 0 {
            if let Some(buf) = pipe.get_hdr_buf(used)? {
                tracing::trace!(slot, "direct header buffer acquired");
                self.slots[usize::from(slot)].direct = Some(buf);
                return Ok(());
            }
        }

        let begin = info.buf_begin;
        while valid < nbytes {
            let got = pipe.read_hdr(&mut self.buf[begin + valid..begin + used])?;
            if got == 0 {
                if pipe.eof()? {
                    if strict && valid > 0 {
                        return Err(Error::new_io(
                            std::io::ErrorKind::UnexpectedEof.into(),
                        ));
                    }
                    // a short (or empty) header stream ends here
                    break;
                }
                return Err(Error::new_io(std::io::ErrorKind::WouldBlock.into()));
            }
            valid += got;
        }
        self.slots[usize::from(slot)].valid = valid;
        Ok(())
    }

    /// Make sure the slot's header is initialised up to `nbytes`: pull the
    /// copy source if one is declared and untouched, then zero-fill any
    /// remaining gap.
    fn ensure_write(
        &mut self,
        model: &TypeModel,
        pipes: &mut dyn PipeAccess,
        slot: PipeId,
        nbytes: usize,
    ) -> crate::Result<()> {
        let info = model
            .slot(slot)
            .ok_or_else(|| Error::new_invalid_arg("accessor on unknown slot"))?;
        if self.slots[usize::from(slot)].valid >= nbytes {
            return Ok(());
        }
        if info.copy_from.is_some() && self.slots[usize::from(slot)].valid == 0 {
            if self.copy_header_data(model, pipes, slot)? {
                return Ok(());
            }
        }
        // the gap is already zeroed: the buffer starts zero-filled and
        // writes never shrink valid
        let state = &mut self.slots[usize::from(slot)];
        state.valid = state.valid.max(nbytes);
        Ok(())
    }

    /// Copy the source slot's observed header bytes into `slot`. Returns
    /// false when the source has no data.
    fn copy_header_data(
        &mut self,
        model: &TypeModel,
        pipes: &mut dyn PipeAccess,
        slot: PipeId,
    ) -> crate::Result<bool> {
        let info = model.slot(slot).expect("copy slot has info");
        let source = info.copy_from.expect("copy slot has a source");
        let needed = info.used_size as usize;
        let dst_begin = info.buf_begin;

        let src_state = &self.slots[usize::from(source)];
        if src_state.valid == 0 && src_state.direct.is_none() && pipes.pipe(source)?.eof()? {
            return Ok(false);
        }
        self.ensure_read(model, pipes, source, needed, false)?;

        let src_info = model.slot(source).expect("resolved source slot");
        let src_state = &self.slots[usize::from(source)];
        let n = std::cmp::min(
            needed,
            match src_state.direct {
                Some(ref direct) => direct.len(),
                None => src_state.valid,
            },
        );
        if n == 0 {
            return Ok(false);
        }
        match src_state.direct {
            Some(ref direct) => {
                let bytes = direct.slice(0..n);
                self.buf[dst_begin..dst_begin + n].copy_from_slice(&bytes);
            }
            None => {
                let src_begin = src_info.buf_begin;
                self.buf.copy_within(src_begin..src_begin + n, dst_begin);
            }
        }
        // anything past the source's observed bytes stays zero
        self.slots[usize::from(slot)].valid = needed;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::mem::MemModule;
    use crate::pipe::{Pipe, PipeFlags, TransportModule};
    use crate::proto::schema::{FieldKind, Schema, TypeBuilder};

    struct Fixture {
        pipes: Vec<Option<PipeHandle>>,
    }

    impl PipeAccess for Fixture {
        fn pipe(&mut self, id: PipeId) -> crate::Result<&mut PipeHandle> {
            self.pipes
                .get_mut(usize::from(id))
                .and_then(|p| p.as_mut())
                .ok_or_else(|| Error::new_invalid_arg("unwired slot"))
        }
    }

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema
            .define(
                TypeBuilder::new("Header")
                    .field("status", FieldKind::Unsigned(2))
                    .field("length", FieldKind::Unsigned(4)),
            )
            .unwrap();
        schema
    }

    fn wired_pair(module: &MemModule, hdr: usize) -> (PipeHandle, PipeHandle) {
        let (tx, rx) = module.open_pipe().unwrap();
        (
            PipeHandle::new(tx, PipeFlags::OUTPUT, hdr),
            PipeHandle::new(rx, PipeFlags::INPUT, hdr),
        )
    }

    /// Writes through one instance on the output slot, reads through a
    /// second instance on the input slot, the way two adjacent tasks do.
    fn round_trip(module: MemModule) -> u16 {
        let schema = schema();
        let (tx, rx) = wired_pair(&module, 6);

        // producer side: slot 0 is the output
        let mut wmodel = TypeModel::new();
        let status = wmodel.accessor(Pipe::from_id(0), "status").unwrap();
        wmodel.resolve(0, "Header", &schema).unwrap();
        let mut wfix = Fixture {
            pipes: vec![Some(tx)],
        };
        let mut winst = TypeInstance::new(&wmodel);
        let n = winst
            .write(&wmodel, &mut wfix, status, &404u16.to_le_bytes())
            .unwrap();
        assert_eq!(n, 2);
        winst.flush(&wmodel, &mut wfix).unwrap();
        drop(wfix);

        // consumer side: slot 0 is the input
        let mut rmodel = TypeModel::new();
        let status = rmodel.accessor(Pipe::from_id(0), "status").unwrap();
        rmodel.resolve(0, "Header", &schema).unwrap();
        let mut rfix = Fixture {
            pipes: vec![Some(rx)],
        };
        let mut rinst = TypeInstance::new(&rmodel);
        let mut out = [0u8; 2];
        let n = rinst.read(&rmodel, &mut rfix, status, &mut out).unwrap();
        assert_eq!(n, 2);
        u16::from_le_bytes(out)
    }

    #[test]
    fn field_round_trip_via_direct_buffer() {
        assert_eq!(round_trip(MemModule::new()), 404);
    }

    #[test]
    fn field_round_trip_via_streamed_fallback() {
        // a fragmented module refuses direct buffers; the observable
        // bytes must be identical
        assert_eq!(round_trip(MemModule::new().fragmented(true)), 404);
    }

    #[test]
    fn unresolved_accessor_reads_and_writes_nothing() {
        let mut model = TypeModel::new();
        let acc = model.accessor(Pipe::from_id(0), "status").unwrap();
        let mut fix = Fixture { pipes: vec![None] };
        let mut inst = TypeInstance::new(&model);
        let mut buf = [0u8; 2];
        assert_eq!(inst.read(&model, &mut fix, acc, &mut buf).unwrap(), 0);
        assert_eq!(inst.write(&model, &mut fix, acc, &buf).unwrap(), 0);
    }

    #[test]
    fn empty_upstream_reads_zero_bytes() {
        let schema = schema();
        let module = MemModule::new();
        let (tx, rx) = wired_pair(&module, 6);
        drop(tx); // close with no bytes at all

        let mut model = TypeModel::new();
        let status = model.accessor(Pipe::from_id(0), "status").unwrap();
        model.resolve(0, "Header", &schema).unwrap();
        let mut fix = Fixture {
            pipes: vec![Some(rx)],
        };
        let mut inst = TypeInstance::new(&model);
        let mut out = [0u8; 2];
        assert_eq!(inst.read(&model, &mut fix, status, &mut out).unwrap(), 0);
    }

    #[test]
    fn copy_pipe_data_passes_headers_through() {
        let schema = schema();
        let module = MemModule::new();

        // upstream writes a header into the edge feeding slot 0
        let (up_tx, up_rx) = wired_pair(&module, 6);
        let mut upfix = Fixture {
            pipes: vec![Some(up_tx)],
        };
        let mut upmodel = TypeModel::new();
        let status = upmodel.accessor(Pipe::from_id(0), "status").unwrap();
        let length = upmodel.accessor(Pipe::from_id(0), "length").unwrap();
        upmodel.resolve(0, "Header", &schema).unwrap();
        let mut upinst = TypeInstance::new(&upmodel);
        upinst
            .write(&upmodel, &mut upfix, status, &200u16.to_le_bytes())
            .unwrap();
        upinst
            .write(&upmodel, &mut upfix, length, &7u32.to_le_bytes())
            .unwrap();
        upinst.flush(&upmodel, &mut upfix).unwrap();
        drop(upfix);

        // the middle servlet declares copy(0 -> 1) and writes nothing
        let (mid_tx, mid_rx) = wired_pair(&module, 6);
        let mut model = TypeModel::new();
        model
            .copy_pipe_data(Pipe::from_id(0), Pipe::from_id(1))
            .unwrap();
        model.resolve(0, "Header", &schema).unwrap();
        model.resolve(1, "Header", &schema).unwrap();
        let mut fix = Fixture {
            pipes: vec![Some(up_rx), Some(mid_tx)],
        };
        let mut inst = TypeInstance::new(&model);
        inst.flush(&model, &mut fix).unwrap();
        drop(fix);

        // downstream observes the source's exact bytes
        let mut dmodel = TypeModel::new();
        let status = dmodel.accessor(Pipe::from_id(0), "status").unwrap();
        let length = dmodel.accessor(Pipe::from_id(0), "length").unwrap();
        dmodel.resolve(0, "Header", &schema).unwrap();
        let mut dfix = Fixture {
            pipes: vec![Some(mid_rx)],
        };
        let mut dinst = TypeInstance::new(&dmodel);
        let mut s = [0u8; 2];
        let mut l = [0u8; 4];
        dinst.read(&dmodel, &mut dfix, status, &mut s).unwrap();
        dinst.read(&dmodel, &mut dfix, length, &mut l).unwrap();
        assert_eq!(u16::from_le_bytes(s), 200);
        assert_eq!(u32::from_le_bytes(l), 7);
    }
}
