#![allow(dead_code)]

use std::sync::Arc;

use plumber::pipe::mem::MemModule;
use plumber::pipe::{ModuleRegistry, PipeFlags, PipeHandle, TransportModule};
use plumber::proto::Schema;

pub fn init_log() {
    let _ = pretty_env_logger::try_init();
}

/// A module registry with one `pipe.mem` instance, plus a typed handle
/// onto the instance for its counters.
pub fn mem_registry(module: MemModule) -> (Arc<ModuleRegistry>, Arc<MemModule>) {
    let module = Arc::new(module);
    let mut registry = ModuleRegistry::new();
    registry
        .register("pipe.mem.test", Arc::clone(&module) as Arc<dyn TransportModule>)
        .expect("register mem module");
    (Arc::new(registry), module)
}

pub fn empty_schema() -> Arc<Schema> {
    Arc::new(Schema::new())
}

/// An external pipe: the write end stays with the test (or the runtime),
/// the read end is handed to whoever consumes it.
pub fn external_pipe(module: &MemModule, hdr: usize) -> (PipeHandle, PipeHandle) {
    let (tx, rx) = module.open_pipe().expect("open external pipe");
    (
        PipeHandle::new(tx, PipeFlags::OUTPUT, hdr),
        PipeHandle::new(rx, PipeFlags::INPUT, hdr),
    )
}

/// Read an external output pipe to its end.
pub fn drain_pipe(rx: &mut PipeHandle) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = rx.read(&mut buf).expect("drain external pipe");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}
