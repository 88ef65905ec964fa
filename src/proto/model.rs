//! Per-servlet typed-header declarations.
//!
//! A servlet does not know the concrete type of its pipes at load time:
//! the service graph decides that when the edges are wired. The
//! [`TypeModel`] records everything a servlet wants from its headers —
//! field accessors, field-property requests, compile-time constants, and
//! header copies between slots — and resolves all of it against the
//! [`Schema`](crate::proto::Schema) exactly once, when the graph's type
//! inferrer reports each slot's concrete type.

use std::fmt;

use crate::error::Error;
use crate::pipe::{Pipe, PipeId};
use crate::proto::schema::{FieldInfo, Schema};

/// Identifies one recorded field accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accessor(pub(crate) u32);

/// Identifies one field-information request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldReq(pub(crate) u32);

/// Identifies one captured compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstReq(pub(crate) u32);

type TypeAssertion = Box<dyn Fn(PipeId, &str) -> crate::Result<()> + Send + Sync>;

pub(crate) struct SlotInfo {
    pub(crate) concrete: Option<String>,
    pub(crate) full_size: u32,
    pub(crate) used_size: u32,
    pub(crate) buf_begin: usize,
    pub(crate) copy_from: Option<PipeId>,
    copy_checked: bool,
    pub(crate) resolved: bool,
    accessors: Vec<u32>,
    field_reqs: Vec<u32>,
    consts: Vec<u32>,
    assertions: Vec<TypeAssertion>,
}

impl SlotInfo {
    fn new() -> SlotInfo {
        SlotInfo {
            concrete: None,
            full_size: 0,
            used_size: 0,
            buf_begin: 0,
            copy_from: None,
            copy_checked: false,
            resolved: false,
            accessors: Vec::new(),
            field_reqs: Vec::new(),
            consts: Vec::new(),
            assertions: Vec::new(),
        }
    }
}

pub(crate) struct AccessorEntry {
    pub(crate) slot: PipeId,
    field: String,
    pub(crate) offset: u32,
    pub(crate) size: u32,
    pub(crate) resolved: bool,
}

struct FieldReqEntry {
    field: String,
    info: Option<FieldInfo>,
}

struct ConstEntry {
    field: String,
    is_signed: bool,
    is_real: bool,
    width: u32,
    value: Option<Vec<u8>>,
}

/// The typed-header declarations of one servlet instance.
pub struct TypeModel {
    slots: Vec<SlotInfo>,
    accessors: Vec<AccessorEntry>,
    field_reqs: Vec<FieldReqEntry>,
    consts: Vec<ConstEntry>,
}

impl TypeModel {
    /// An empty type model, with no slots, accessors, or requests recorded.
    pub fn new() -> TypeModel {
        TypeModel {
            slots: Vec::new(),
            accessors: Vec::new(),
            field_reqs: Vec::new(),
            consts: Vec::new(),
        }
    }

    fn slot_mut(&mut self, pipe: Pipe) -> crate::Result<(PipeId, &mut SlotInfo)> {
        let id = pipe.id()?;
        let idx = usize::from(id);
        while self.slots.len() <= idx {
            self.slots.push(SlotInfo::new());
        }
        Ok((id, &mut self.slots[idx]))
    }

    /// Record a pending field lookup on a slot. The offset and size stay
    /// unresolved until the slot's concrete type is known.
    ///
    /// Encapsulated (`*`-prefixed) paths do not support accessors.
    pub fn accessor(&mut self, pipe: Pipe, field_expr: &str) -> crate::Result<Accessor> {
        if field_expr.starts_with('*') {
            return Err(Error::new_invalid_arg(
                "accessor on an encapsulated field path",
            ));
        }
        if field_expr.is_empty() {
            return Err(Error::new_invalid_arg("empty field expression"));
        }
        let id = self.accessors.len() as u32;
        let (slot, info) = self.slot_mut(pipe)?;
        info.accessors.push(id);
        self.accessors.push(AccessorEntry {
            slot,
            field: field_expr.to_owned(),
            offset: 0,
            size: 0,
            resolved: false,
        });
        Ok(Accessor(id))
    }

    /// Ask for a field's numeric/signed/float/token/compound properties
    /// and placement, delivered at resolution time.
    pub fn field_info(&mut self, pipe: Pipe, field_expr: &str) -> crate::Result<FieldReq> {
        let id = self.field_reqs.len() as u32;
        let (_, info) = self.slot_mut(pipe)?;
        info.field_reqs.push(id);
        self.field_reqs.push(FieldReqEntry {
            field: field_expr.to_owned(),
            info: None,
        });
        Ok(FieldReq(id))
    }

    /// Capture a compile-time constant from the type definition, checked
    /// at resolution for signedness and width, with sign extension for
    /// integer widening and 32/64-bit float conversion.
    pub fn constant(
        &mut self,
        pipe: Pipe,
        field_expr: &str,
        is_signed: bool,
        is_real: bool,
        width: u32,
    ) -> crate::Result<ConstReq> {
        if width == 0 || width > 8 {
            return Err(Error::new_invalid_arg("constant width out of range"));
        }
        let id = self.consts.len() as u32;
        let (_, info) = self.slot_mut(pipe)?;
        info.consts.push(id);
        self.consts.push(ConstEntry {
            field: field_expr.to_owned(),
            is_signed,
            is_real,
            width,
            value: None,
        });
        Ok(ConstReq(id))
    }

    /// Declare that `to`'s header bytes are copied from `from` at runtime
    /// unless written explicitly. Checked at resolution: `from`'s concrete
    /// type must be a subtype of `to`'s (their common ancestor must be
    /// `to`'s type).
    pub fn copy_pipe_data(&mut self, from: Pipe, to: Pipe) -> crate::Result<()> {
        let from_id = from.id()?;
        let (_, info) = self.slot_mut(to)?;
        info.copy_from = Some(from_id);
        // make sure the source slot exists so resolution visits it
        let _ = self.slot_mut(from)?;
        Ok(())
    }

    /// Register an assertion evaluated when the slot's concrete type is
    /// determined. Failure aborts graph startup.
    pub fn assert_type<F>(&mut self, pipe: Pipe, assertion: F) -> crate::Result<()>
    where
        F: Fn(PipeId, &str) -> crate::Result<()> + Send + Sync + 'static,
    {
        let (_, info) = self.slot_mut(pipe)?;
        info.assertions.push(Box::new(assertion));
        Ok(())
    }

    /// Resolve every declaration on `slot` against its concrete type.
    /// Called once per typed slot by the graph type inferrer.
    pub(crate) fn resolve(
        &mut self,
        slot: PipeId,
        concrete: &str,
        schema: &Schema,
    ) -> crate::Result<()> {
        let idx = usize::from(slot);
        while self.slots.len() <= idx {
            self.slots.push(SlotInfo::new());
        }
        if self.slots[idx].resolved {
            return Err(Error::new_programming("slot resolved twice"));
        }

        let full_size = schema.type_size(concrete)?;

        for assertion in &self.slots[idx].assertions {
            assertion(slot, concrete)?;
        }

        for &req in &self.slots[idx].field_reqs.clone() {
            let entry = &self.field_reqs[req as usize];
            let info = schema.resolve_field(concrete, &entry.field)?;
            self.field_reqs[req as usize].info = Some(info);
        }

        for &cid in &self.slots[idx].consts.clone() {
            let entry = &self.consts[cid as usize];
            let (info, default) = schema.field_default(concrete, &entry.field)?;
            let default = default.ok_or_else(|| {
                Error::new_type_system(format!("field {} has no constant value", entry.field))
            })?;
            let value = convert_constant(&info, &default, entry.is_signed, entry.is_real, entry.width)?;
            self.consts[cid as usize].value = Some(value);
        }

        let mut used = 0u32;
        for &aid in &self.slots[idx].accessors.clone() {
            let entry = &self.accessors[aid as usize];
            let info = schema.resolve_field(concrete, &entry.field)?;
            let entry = &mut self.accessors[aid as usize];
            entry.offset = info.offset;
            entry.size = info.size;
            entry.resolved = true;
            used = used.max(info.offset + info.size);
        }

        let info = &mut self.slots[idx];
        info.concrete = Some(concrete.to_owned());
        info.full_size = full_size;
        info.used_size = info.used_size.max(used);
        info.resolved = true;
        tracing::debug!(slot, concrete, full_size, used, "slot type resolved");

        self.check_copy_pairs(schema)?;
        self.recompute_layout();
        Ok(())
    }

    /// Verify newly resolvable copy pairs and widen their buffered
    /// regions to the destination's full header size.
    fn check_copy_pairs(&mut self, schema: &Schema) -> crate::Result<()> {
        for dst in 0..self.slots.len() {
            let src = match self.slots[dst].copy_from {
                Some(src) if !self.slots[dst].copy_checked => usize::from(src),
                _ => continue,
            };
            if src >= self.slots.len() || !self.slots[src].resolved || !self.slots[dst].resolved {
                continue;
            }
            let from_type = self.slots[src]
                .concrete
                .clone()
                .expect("resolved slot has a concrete type");
            let to_type = self.slots[dst]
                .concrete
                .clone()
                .expect("resolved slot has a concrete type");
            match schema.common_ancestor(&from_type, &to_type) {
                Some(common) if common == to_type.split(' ').next().unwrap_or(&to_type) => {}
                _ => {
                    return Err(Error::new_type_system(format!(
                        "invalid pipe data copy: from {} to {}",
                        from_type, to_type
                    )));
                }
            }
            let required = self.slots[dst].full_size;
            self.slots[src].used_size = self.slots[src].used_size.max(required);
            self.slots[dst].used_size = self.slots[dst].used_size.max(required);
            self.slots[dst].copy_checked = true;
        }
        Ok(())
    }

    fn recompute_layout(&mut self) {
        let mut begin = 0usize;
        for slot in &mut self.slots {
            slot.buf_begin = begin;
            begin += slot.used_size as usize;
        }
    }

    /// The resolved properties of a field-information request, or `None`
    /// when the slot was never wired.
    pub fn resolved_field(&self, req: FieldReq) -> Option<&FieldInfo> {
        self.field_reqs
            .get(req.0 as usize)
            .and_then(|e| e.info.as_ref())
    }

    /// The captured bytes of a constant, or `None` when the slot was
    /// never wired.
    pub fn constant_bytes(&self, req: ConstReq) -> Option<&[u8]> {
        self.consts
            .get(req.0 as usize)
            .and_then(|e| e.value.as_deref())
    }

    /// A captured constant as a `u32`.
    pub fn constant_u32(&self, req: ConstReq) -> Option<u32> {
        let bytes = self.constant_bytes(req)?;
        let mut buf = [0u8; 4];
        buf[..bytes.len().min(4)].copy_from_slice(&bytes[..bytes.len().min(4)]);
        Some(u32::from_le_bytes(buf))
    }

    /// A captured constant as a `u64`.
    pub fn constant_u64(&self, req: ConstReq) -> Option<u64> {
        let bytes = self.constant_bytes(req)?;
        let mut buf = [0u8; 8];
        buf[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        Some(u64::from_le_bytes(buf))
    }

    /// A captured constant as an `f64` (the constant must have been
    /// requested with width 8 and `is_real`).
    pub fn constant_f64(&self, req: ConstReq) -> Option<f64> {
        let bytes = self.constant_bytes(req)?;
        if bytes.len() != 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(f64::from_le_bytes(buf))
    }

    /// The resolved byte size of an accessor's field; 0 while unresolved.
    pub fn field_size(&self, accessor: Accessor) -> usize {
        match self.accessors.get(accessor.0 as usize) {
            Some(e) if e.resolved => e.size as usize,
            _ => 0,
        }
    }

    pub(crate) fn accessor_entry(&self, accessor: Accessor) -> crate::Result<&AccessorEntry> {
        self.accessors
            .get(accessor.0 as usize)
            .ok_or_else(|| Error::new_invalid_arg("unknown accessor"))
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, id: PipeId) -> Option<&SlotInfo> {
        self.slots.get(usize::from(id))
    }

    /// Total scratch-buffer size a per-execution instance needs.
    pub(crate) fn instance_buf_size(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.used_size as usize)
            .sum()
    }
}

impl fmt::Debug for TypeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeModel")
            .field("slots", &self.slots.len())
            .field("accessors", &self.accessors.len())
            .finish()
    }
}

fn convert_constant(
    info: &FieldInfo,
    default: &[u8],
    is_signed: bool,
    is_real: bool,
    width: u32,
) -> crate::Result<Vec<u8>> {
    if !info.is_numeric {
        return Err(Error::new_type_system(
            "numeric type expected for a constant",
        ));
    }
    if !info.is_float {
        if is_real {
            return Err(Error::new_type_system(
                "integer value expected, but floating point requested",
            ));
        }
        if info.is_signed != is_signed {
            return Err(Error::new_type_system("signedness mismatch"));
        }
        if default.len() > width as usize {
            return Err(Error::new_type_system(
                "the integer constant would be truncated",
            ));
        }
        let mut out = vec![0u8; width as usize];
        out[..default.len()].copy_from_slice(default);
        // two's complement sign extension for widened signed values
        if is_signed && default.last().map_or(false, |b| b & 0x80 != 0) {
            for byte in out.iter_mut().skip(default.len()) {
                *byte = 0xff;
            }
        }
        Ok(out)
    } else {
        if !is_real {
            return Err(Error::new_type_system(
                "floating point value expected, but integer requested",
            ));
        }
        let value = match default.len() {
            4 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(default);
                f64::from(f32::from_le_bytes(b))
            }
            8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(default);
                f64::from_le_bytes(b)
            }
            _ => return Err(Error::new_type_system("bad float constant width")),
        };
        match width {
            4 => Ok((value as f32).to_le_bytes().to_vec()),
            8 => Ok(value.to_le_bytes().to_vec()),
            _ => Err(Error::new_type_system("bad float constant width")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::schema::{FieldKind, TypeBuilder};

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema
            .define(
                TypeBuilder::new("Response")
                    .field("status_code", FieldKind::Unsigned(2))
                    .constant(
                        "BODY_SIZE_UNKNOWN",
                        FieldKind::Unsigned(4),
                        &0xffff_ffffu32.to_le_bytes(),
                    )
                    .field("body_size", FieldKind::Unsigned(8)),
            )
            .unwrap();
        schema
            .define(
                TypeBuilder::new("Signed8")
                    .constant("MINUS_TWO", FieldKind::Signed(1), &[0xfe]),
            )
            .unwrap();
        schema
    }

    #[test]
    fn unresolved_accessor_has_zero_size() {
        let mut model = TypeModel::new();
        let acc = model.accessor(Pipe::from_id(0), "status_code").unwrap();
        assert_eq!(model.field_size(acc), 0);
    }

    #[test]
    fn resolution_fills_offsets_and_used_size() {
        let schema = schema();
        let mut model = TypeModel::new();
        let status = model.accessor(Pipe::from_id(0), "status_code").unwrap();
        let body = model.accessor(Pipe::from_id(0), "body_size").unwrap();
        model.resolve(0, "Response", &schema).unwrap();

        assert_eq!(model.field_size(status), 2);
        assert_eq!(model.field_size(body), 8);
        let slot = model.slot(0).unwrap();
        assert_eq!(slot.used_size, 2 + 4 + 8);
        assert_eq!(slot.full_size, 14);
    }

    #[test]
    fn constant_capture_and_widening() {
        let schema = schema();
        let mut model = TypeModel::new();
        let c = model
            .constant(Pipe::from_id(0), "BODY_SIZE_UNKNOWN", false, false, 4)
            .unwrap();
        model.resolve(0, "Response", &schema).unwrap();
        assert_eq!(model.constant_u32(c), Some(0xffff_ffff));
    }

    #[test]
    fn signed_constants_sign_extend() {
        let schema = schema();
        let mut model = TypeModel::new();
        let c = model
            .constant(Pipe::from_id(0), "MINUS_TWO", true, false, 8)
            .unwrap();
        model.resolve(0, "Signed8", &schema).unwrap();
        let v = model.constant_u64(c).unwrap() as i64;
        assert_eq!(v, -2);
    }

    #[test]
    fn signedness_mismatch_is_fatal() {
        let schema = schema();
        let mut model = TypeModel::new();
        model
            .constant(Pipe::from_id(0), "BODY_SIZE_UNKNOWN", true, false, 4)
            .unwrap();
        let err = model.resolve(0, "Response", &schema).unwrap_err();
        assert!(err.is_type_system());
    }

    #[test]
    fn accessors_reject_encapsulated_paths() {
        let mut model = TypeModel::new();
        let err = model.accessor(Pipe::from_id(0), "*field").unwrap_err();
        assert!(err.is_invalid_arg());
    }

    #[test]
    fn layout_packs_slots_in_id_order() {
        let schema = schema();
        let mut model = TypeModel::new();
        model.accessor(Pipe::from_id(0), "status_code").unwrap();
        model.accessor(Pipe::from_id(1), "body_size").unwrap();
        model.resolve(0, "Response", &schema).unwrap();
        model.resolve(1, "Response", &schema).unwrap();

        let a = model.slot(0).unwrap();
        let b = model.slot(1).unwrap();
        assert_eq!(a.buf_begin, 0);
        assert_eq!(b.buf_begin, a.used_size as usize);
    }
}
