//! The typed-header type system.
//!
//! Pipes carry a fixed-layout header prefix described by a [`Schema`].
//! Servlets declare field-level reads and writes against those headers
//! through a [`TypeModel`] without knowing the concrete types at load
//! time; the service graph resolves every declaration to numeric offsets
//! when the edges are typed, and a per-execution [`TypeInstance`] buffers
//! the header bytes with a zero-copy shortcut where the transport allows
//! one.

pub(crate) mod instance;
pub(crate) mod model;
pub(crate) mod schema;

pub use self::instance::TypeInstance;
pub use self::model::{Accessor, ConstReq, FieldReq, TypeModel};
pub use self::schema::{FieldInfo, FieldKind, Schema, TypeBuilder};
