//! The metaschema: named typed-header layouts.
//!
//! A [`Schema`] is the registry the graph type inferrer consults when an
//! edge's concrete type is known: it maps a type name to a packed field
//! layout, resolves dotted/subscripted field paths to `(offset, size)`
//! pairs, answers subtype and common-ancestor queries (a child type's
//! layout is a byte-prefix extension of its parent), and stores the
//! compile-time constants captured by servlets at init.

use std::collections::HashMap;
use std::fmt;

use crate::error::Error;

/// Properties and placement of one resolved field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Byte offset of the field inside the header.
    pub offset: u32,
    /// Byte size of the addressed region.
    pub size: u32,
    /// The field holds a number.
    pub is_numeric: bool,
    /// The number is signed.
    pub is_signed: bool,
    /// The number is a float.
    pub is_float: bool,
    /// The field holds a scope token.
    pub is_token: bool,
    /// The token names a primitive scope object.
    pub is_primitive_token: bool,
    /// The field is itself a structured type.
    pub is_compound: bool,
}

/// The kind of a field being declared.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Unsigned integer of the given byte width.
    Unsigned(u32),
    /// Signed integer of the given byte width.
    Signed(u32),
    /// IEEE float of the given byte width (4 or 8).
    Float(u32),
    /// A 32-bit scope token.
    Token,
    /// A 32-bit token naming a primitive scope object.
    PrimitiveToken,
    /// A nested header type, by name. The type must already be defined.
    Compound(String),
    /// A fixed-size array of the inner kind.
    Array(Box<FieldKind>, u32),
}

#[derive(Debug, Clone)]
enum Leaf {
    Unsigned(u32),
    Signed(u32),
    Float(u32),
    Token,
    PrimitiveToken,
    Compound(String),
}

#[derive(Debug, Clone)]
struct FieldDesc {
    name: String,
    offset: u32,
    /// Array dimensions, outermost first; empty for scalars.
    dims: Vec<u32>,
    leaf: Leaf,
    elem_size: u32,
    total_size: u32,
    default: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct TypeDesc {
    parent: Option<String>,
    size: u32,
    fields: Vec<FieldDesc>,
}

/// Declares one header type for [`Schema::define`].
#[derive(Debug)]
pub struct TypeBuilder {
    name: String,
    parent: Option<String>,
    fields: Vec<(String, FieldKind, Option<Vec<u8>>)>,
}

impl TypeBuilder {
    /// Start declaring a type.
    pub fn new(name: &str) -> TypeBuilder {
        TypeBuilder {
            name: name.to_owned(),
            parent: None,
            fields: Vec::new(),
        }
    }

    /// Extend a previously defined type; its layout becomes this type's
    /// byte prefix.
    pub fn extends(mut self, parent: &str) -> TypeBuilder {
        self.parent = Some(parent.to_owned());
        self
    }

    /// Declare a field.
    pub fn field(mut self, name: &str, kind: FieldKind) -> TypeBuilder {
        self.fields.push((name.to_owned(), kind, None));
        self
    }

    /// Declare a field carrying a compile-time constant (its default
    /// value), capturable through the type model's constant interface.
    pub fn constant(mut self, name: &str, kind: FieldKind, value: &[u8]) -> TypeBuilder {
        self.fields.push((name.to_owned(), kind, Some(value.to_vec())));
        self
    }
}

/// The registry of typed-header layouts.
pub struct Schema {
    types: HashMap<String, TypeDesc>,
}

impl Schema {
    /// An empty schema.
    pub fn new() -> Schema {
        Schema {
            types: HashMap::new(),
        }
    }

    /// Define a type. Referenced parent and compound types must already
    /// exist.
    pub fn define(&mut self, builder: TypeBuilder) -> crate::Result<()> {
        if self.types.contains_key(&builder.name) {
            return Err(Error::new_type_system(format!(
                "type {} already defined",
                builder.name
            )));
        }
        let base = match builder.parent {
            Some(ref parent) => {
                self.types
                    .get(parent)
                    .ok_or_else(|| {
                        Error::new_type_system(format!("unknown parent type {}", parent))
                    })?
                    .size
            }
            None => 0,
        };
        let mut fields = Vec::with_capacity(builder.fields.len());
        let mut offset = base;
        for (name, kind, default) in builder.fields {
            let (dims, leaf) = flatten_kind(kind);
            let elem_size = self.leaf_size(&leaf)?;
            let total_size = dims.iter().product::<u32>().max(1) * elem_size;
            if let Some(ref value) = default {
                if value.len() as u32 != total_size {
                    return Err(Error::new_type_system(format!(
                        "constant {}.{} is {} bytes, field is {}",
                        builder.name,
                        name,
                        value.len(),
                        total_size
                    )));
                }
            }
            fields.push(FieldDesc {
                name,
                offset,
                dims,
                leaf,
                elem_size,
                total_size,
                default,
            });
            offset += total_size;
        }
        self.types.insert(
            builder.name,
            TypeDesc {
                parent: builder.parent,
                size: offset,
                fields,
            },
        );
        Ok(())
    }

    fn leaf_size(&self, leaf: &Leaf) -> crate::Result<u32> {
        Ok(match *leaf {
            Leaf::Unsigned(w) | Leaf::Signed(w) | Leaf::Float(w) => w,
            Leaf::Token | Leaf::PrimitiveToken => 4,
            Leaf::Compound(ref name) => {
                self.types
                    .get(name)
                    .ok_or_else(|| {
                        Error::new_type_system(format!("unknown compound type {}", name))
                    })?
                    .size
            }
        })
    }

    /// Total header size of the named type. The name may be a full
    /// concrete type string with encapsulation words; only the first word
    /// counts.
    pub fn type_size(&self, type_name: &str) -> crate::Result<u32> {
        let name = first_word(type_name);
        self.types
            .get(name)
            .map(|t| t.size)
            .ok_or_else(|| Error::new_type_system(format!("unknown type {}", name)))
    }

    /// Whether the named type exists.
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(first_word(type_name))
    }

    /// Resolve a field expression against a concrete type string,
    /// handling any leading `*` encapsulation prefix.
    pub fn resolve_field(
        &self,
        concrete: &str,
        field_expr: &str,
    ) -> crate::Result<FieldInfo> {
        let (effective_type, expr) = effective_field(concrete, field_expr)?;
        self.resolve(effective_type, expr).map(|(info, _)| info)
    }

    /// The default value of a field, together with its resolved info.
    /// `None` when the field declares no default.
    pub fn field_default(
        &self,
        concrete: &str,
        field_expr: &str,
    ) -> crate::Result<(FieldInfo, Option<Vec<u8>>)> {
        let (effective_type, expr) = effective_field(concrete, field_expr)?;
        let (info, default) = self.resolve(effective_type, expr)?;
        Ok((info, default))
    }

    fn resolve(
        &self,
        type_name: &str,
        expr: &str,
    ) -> crate::Result<(FieldInfo, Option<Vec<u8>>)> {
        let mut current = type_name;
        let mut base = 0u32;
        let mut segments = expr.split('.').peekable();
        loop {
            let segment = segments
                .next()
                .ok_or_else(|| Error::new_type_system("empty field expression"))?;
            let (name, subscripts) = parse_segment(segment)?;
            let field = self.find_field(current, name)?;

            let mut offset = base + field.offset;
            let mut size = field.total_size;
            let mut dims = &field.dims[..];
            for idx in subscripts {
                let dim = *dims.first().ok_or_else(|| {
                    Error::new_type_system(format!("{} subscripted past its rank", name))
                })?;
                if idx >= dim {
                    return Err(Error::new_type_system(format!(
                        "index {} out of range for {}[{}]",
                        idx, name, dim
                    )));
                }
                let stride = size / dim;
                offset += idx * stride;
                size = stride;
                dims = &dims[1..];
            }

            if segments.peek().is_some() {
                if !dims.is_empty() {
                    return Err(Error::new_type_system(format!(
                        "cannot descend into array field {}",
                        name
                    )));
                }
                match field.leaf {
                    Leaf::Compound(ref nested) => {
                        current = nested;
                        base = offset;
                    }
                    _ => {
                        return Err(Error::new_type_system(format!(
                            "field {} is not compound",
                            name
                        )));
                    }
                }
                continue;
            }

            let info = leaf_info(&field.leaf, !dims.is_empty(), offset, size);
            return Ok((info, field.default.clone()));
        }
    }

    fn find_field(&self, type_name: &str, field: &str) -> crate::Result<&FieldDesc> {
        let mut current = Some(type_name);
        while let Some(name) = current {
            let desc = self
                .types
                .get(name)
                .ok_or_else(|| Error::new_type_system(format!("unknown type {}", name)))?;
            if let Some(f) = desc.fields.iter().find(|f| f.name == field) {
                return Ok(f);
            }
            current = desc.parent.as_deref();
        }
        Err(Error::new_type_system(format!(
            "type {} has no field {}",
            type_name, field
        )))
    }

    fn ancestor_chain<'a>(&'a self, type_name: &'a str) -> Vec<&'a str> {
        let mut chain = Vec::new();
        let mut current = Some(first_word(type_name));
        while let Some(name) = current {
            chain.push(name);
            current = self.types.get(name).and_then(|t| t.parent.as_deref());
        }
        chain.reverse();
        chain
    }

    /// The deepest type both arguments descend from, or `None` when the
    /// chains never meet.
    pub fn common_ancestor<'a>(&'a self, a: &'a str, b: &'a str) -> Option<&'a str> {
        let ca = self.ancestor_chain(a);
        let cb = self.ancestor_chain(b);
        let mut common = None;
        for (x, y) in ca.iter().zip(cb.iter()) {
            if x == y {
                common = Some(*x);
            } else {
                break;
            }
        }
        common
    }

    /// Whether `sub` is `ancestor` or a descendant of it.
    pub fn is_subtype(&self, sub: &str, ancestor: &str) -> bool {
        self.ancestor_chain(sub).contains(&first_word(ancestor))
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("types", &self.types.len())
            .finish()
    }
}

fn flatten_kind(kind: FieldKind) -> (Vec<u32>, Leaf) {
    match kind {
        FieldKind::Array(inner, n) => {
            let (mut dims, leaf) = flatten_kind(*inner);
            dims.insert(0, n);
            (dims, leaf)
        }
        FieldKind::Unsigned(w) => (Vec::new(), Leaf::Unsigned(w)),
        FieldKind::Signed(w) => (Vec::new(), Leaf::Signed(w)),
        FieldKind::Float(w) => (Vec::new(), Leaf::Float(w)),
        FieldKind::Token => (Vec::new(), Leaf::Token),
        FieldKind::PrimitiveToken => (Vec::new(), Leaf::PrimitiveToken),
        FieldKind::Compound(name) => (Vec::new(), Leaf::Compound(name)),
    }
}

fn leaf_info(leaf: &Leaf, is_array: bool, offset: u32, size: u32) -> FieldInfo {
    let mut info = FieldInfo {
        offset,
        size,
        is_numeric: false,
        is_signed: false,
        is_float: false,
        is_token: false,
        is_primitive_token: false,
        is_compound: false,
    };
    match *leaf {
        Leaf::Unsigned(_) => info.is_numeric = true,
        Leaf::Signed(_) => {
            info.is_numeric = true;
            info.is_signed = true;
        }
        Leaf::Float(_) => {
            info.is_numeric = true;
            info.is_signed = true;
            info.is_float = true;
        }
        Leaf::Token => info.is_token = true,
        Leaf::PrimitiveToken => {
            info.is_token = true;
            info.is_primitive_token = true;
        }
        Leaf::Compound(_) => info.is_compound = true,
    }
    if is_array {
        info.is_compound = true;
    }
    info
}

fn first_word(concrete: &str) -> &str {
    concrete.split(' ').next().unwrap_or(concrete)
}

/// Strip a `*` encapsulation prefix: each star steps one level into the
/// space-separated encapsulated type list recorded after the concrete
/// type's first word.
pub(crate) fn effective_field<'a>(
    concrete: &'a str,
    field_expr: &'a str,
) -> crate::Result<(&'a str, &'a str)> {
    let stars = field_expr.bytes().take_while(|&b| b == b'*').count();
    let mut words = concrete.split(' ');
    let master = words
        .next()
        .ok_or_else(|| Error::new_type_system("empty concrete type"))?;
    if stars == 0 {
        return Ok((master, field_expr));
    }
    let inner = words
        .nth(stars - 1)
        .ok_or_else(|| Error::new_type_system("not an encapsulated type"))?;
    Ok((inner, &field_expr[stars..]))
}

fn parse_segment(segment: &str) -> crate::Result<(&str, Vec<u32>)> {
    let open = segment.find('[');
    let name = &segment[..open.unwrap_or(segment.len())];
    if name.is_empty() {
        return Err(Error::new_type_system("empty field name"));
    }
    let mut subscripts = Vec::new();
    let mut rest = &segment[open.unwrap_or(segment.len())..];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(Error::new_type_system(format!(
                "malformed subscript in {}",
                segment
            )));
        }
        let close = rest
            .find(']')
            .ok_or_else(|| Error::new_type_system(format!("unclosed subscript in {}", segment)))?;
        let idx = rest[1..close]
            .parse::<u32>()
            .map_err(|_| Error::new_type_system(format!("bad subscript in {}", segment)))?;
        subscripts.push(idx);
        rest = &rest[close + 1..];
    }
    Ok((name, subscripts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema
            .define(
                TypeBuilder::new("Point")
                    .field("x", FieldKind::Signed(4))
                    .field("y", FieldKind::Signed(4)),
            )
            .unwrap();
        schema
            .define(
                TypeBuilder::new("Shape")
                    .field("kind", FieldKind::Unsigned(2))
                    .field("points", FieldKind::Array(Box::new(FieldKind::Compound("Point".into())), 4)),
            )
            .unwrap();
        schema
            .define(
                TypeBuilder::new("ShapeEx")
                    .extends("Shape")
                    .field("color", FieldKind::Unsigned(4)),
            )
            .unwrap();
        schema
    }

    #[test]
    fn packed_layout() {
        let schema = schema();
        assert_eq!(schema.type_size("Point").unwrap(), 8);
        assert_eq!(schema.type_size("Shape").unwrap(), 2 + 4 * 8);
        assert_eq!(schema.type_size("ShapeEx").unwrap(), 2 + 4 * 8 + 4);
    }

    #[test]
    fn dotted_and_subscripted_paths() {
        let schema = schema();
        let info = schema.resolve_field("Shape", "points[2].y").unwrap();
        assert_eq!(info.offset, 2 + 2 * 8 + 4);
        assert_eq!(info.size, 4);
        assert!(info.is_numeric);
        assert!(info.is_signed);
    }

    #[test]
    fn inherited_fields_keep_their_offsets() {
        let schema = schema();
        let parent = schema.resolve_field("Shape", "kind").unwrap();
        let child = schema.resolve_field("ShapeEx", "kind").unwrap();
        assert_eq!(parent.offset, child.offset);

        let own = schema.resolve_field("ShapeEx", "color").unwrap();
        assert_eq!(own.offset, schema.type_size("Shape").unwrap());
    }

    #[test]
    fn subscript_out_of_range_is_a_type_error() {
        let schema = schema();
        assert!(schema.resolve_field("Shape", "points[4].x").unwrap_err().is_type_system());
        assert!(schema.resolve_field("Shape", "kind[0]").unwrap_err().is_type_system());
    }

    #[test]
    fn ancestor_queries() {
        let schema = schema();
        assert_eq!(schema.common_ancestor("ShapeEx", "Shape"), Some("Shape"));
        assert_eq!(schema.common_ancestor("Shape", "Point"), None);
        assert!(schema.is_subtype("ShapeEx", "Shape"));
        assert!(!schema.is_subtype("Shape", "ShapeEx"));
    }

    #[test]
    fn encapsulation_prefix_picks_the_inner_type() {
        let (ty, expr) = effective_field("Outer Inner1 Inner2", "**x").unwrap();
        assert_eq!(ty, "Inner2");
        assert_eq!(expr, "x");

        let (ty, expr) = effective_field("Outer Inner1", "x.y").unwrap();
        assert_eq!(ty, "Outer");
        assert_eq!(expr, "x.y");

        assert!(effective_field("Outer", "*x").is_err());
    }
}
