//! Module registry behaviour: prefix resolution, the NOP sentinel, and
//! module service functions through virtual slots.

mod support;

use std::sync::Arc;

use plumber::pipe::mem::{MemModule, FUNC_WRITE_COUNT};
use plumber::pipe::{
    ModulePort, ModuleRegistry, Opcode, PipeFlags, PipeHandle, TransportModule,
};

/// A second module binary, to prove mixed prefixes are rejected.
struct OtherModule;

impl TransportModule for OtherModule {
    fn binary(&self) -> &str {
        "pipe.other"
    }

    fn open_pipe(&self) -> plumber::Result<(Box<dyn ModulePort>, Box<dyn ModulePort>)> {
        MemModule::new().open_pipe()
    }
}

#[test]
fn prefix_resolves_to_one_binary() {
    let mut registry = ModuleRegistry::new();
    let a = registry
        .register("pipe.mem.a", Arc::new(MemModule::new()))
        .unwrap();
    registry
        .register("pipe.mem.b", Arc::new(MemModule::new()))
        .unwrap();

    // two instances, one binary: the representative id comes back
    assert_eq!(registry.mod_cntl_prefix("pipe.mem").unwrap(), Some(a));

    // an exact instance path works too
    assert_eq!(registry.mod_cntl_prefix("pipe.mem.b").unwrap(), Some(1));
}

#[test]
fn mixed_binaries_under_a_prefix_are_an_error() {
    let mut registry = ModuleRegistry::new();
    registry
        .register("pipe.mem.a", Arc::new(MemModule::new()))
        .unwrap();
    registry
        .register("pipe.mem.weird", Arc::new(OtherModule))
        .unwrap();

    let err = registry.mod_cntl_prefix("pipe.mem").unwrap_err();
    assert!(err.is_invalid_arg());
}

#[test]
fn prefix_miss_becomes_nop_not_an_error() {
    let mut registry = ModuleRegistry::new();
    registry
        .register("pipe.mem.a", Arc::new(MemModule::new()))
        .unwrap();

    // no instance lives here; callers translate None into NOP
    let missing = registry.mod_cntl_prefix("pipe.tls").unwrap();
    assert_eq!(missing, None);

    // and NOP on a handle is an accepted no-op, not a failure
    let module = MemModule::new();
    let (_tx, rx) = module.open_pipe().unwrap();
    let mut handle = PipeHandle::new(rx, PipeFlags::INPUT, 0);
    handle.cntl(Opcode::NOP, &mut ()).unwrap();
}

#[test]
fn prefix_must_match_whole_path_segments() {
    let mut registry = ModuleRegistry::new();
    registry
        .register("pipe.memory.a", Arc::new(MemModule::new()))
        .unwrap();

    // "pipe.mem" is not a segment prefix of "pipe.memory.a"
    assert_eq!(registry.mod_cntl_prefix("pipe.mem").unwrap(), None);
}

#[test]
fn module_functions_go_through_virtual_slots() {
    let module = Arc::new(MemModule::new());
    let mut registry = ModuleRegistry::new();
    registry
        .register("pipe.mem.main", Arc::clone(&module) as Arc<dyn TransportModule>)
        .unwrap();

    let slot = registry
        .get_module_func("pipe.mem.main", "write_count")
        .unwrap();
    assert!(slot.is_virtual());
    assert_eq!(slot.virtual_opcode(), FUNC_WRITE_COUNT);

    // write some bytes, then ask the module through the virtual slot
    let (mut tx, _rx) = module.open_pipe().unwrap();
    tx.write(b"hello").unwrap();

    let mut count = 0usize;
    registry.invoke(slot, &mut count).unwrap();
    assert_eq!(count, 1);

    // unknown functions are an invalid-argument failure
    assert!(registry
        .get_module_func("pipe.mem.main", "no_such_func")
        .unwrap_err()
        .is_invalid_arg());
}

#[test]
fn module_cntl_for_the_wrong_module_is_rejected() {
    let module = MemModule::new();
    let (_tx, rx) = module.open_pipe().unwrap();
    let mut handle = PipeHandle::new(rx, PipeFlags::INPUT, 0).with_module(3, Arc::from("pipe.mem.x"));

    let err = handle.cntl(Opcode::module(4, 1), &mut ()).unwrap_err();
    assert!(err.is_invalid_arg());
    assert_eq!(handle.mod_path(), "pipe.mem.x");
}
