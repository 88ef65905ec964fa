//! Scope tokens and the zero-copy stream drain, including the
//! data-request preamble.

mod support;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future;
use plumber::graph::ServiceGraph;
use plumber::pipe::{Pipe, PipeFlags};
use plumber::scope::BufferObject;
use plumber::sched;
use plumber::servlet::{DataRequest, Servlet, ServletInit, ServletMode, TaskContext};

const PAYLOAD_LEN: usize = 10 * 1024 * 1024;

fn payload() -> Bytes {
    let mut data = Vec::with_capacity(PAYLOAD_LEN);
    for n in 0..PAYLOAD_LEN {
        data.push((n % 251) as u8);
    }
    Bytes::from(data)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    /// Consume the full preamble.
    Consume,
    /// Decline immediately.
    Decline,
    /// Fail on the first chunk.
    Fail,
}

struct Emitter {
    out: Option<Pipe>,
    kind: HandlerKind,
    preamble: Arc<Mutex<Vec<u8>>>,
}

impl Servlet for Emitter {
    fn init(&mut self, _args: &[&str], env: &mut ServletInit<'_>) -> plumber::Result<ServletMode> {
        env.define("in", PipeFlags::INPUT, None)?;
        self.out = Some(env.define("out", PipeFlags::OUTPUT, None)?);
        Ok(ServletMode::Sync)
    }

    fn exec(&mut self, ctx: &mut TaskContext<'_>) -> plumber::Result<()> {
        let token = ctx
            .scope_mut()
            .insert(Box::new(BufferObject::new(payload())))?;
        let kind = self.kind;
        let preamble = Arc::clone(&self.preamble);
        let mut handler = move |chunk: &[u8]| -> plumber::Result<usize> {
            match kind {
                HandlerKind::Consume => {
                    preamble.lock().unwrap().extend_from_slice(chunk);
                    Ok(chunk.len())
                }
                HandlerKind::Decline => Ok(0),
                HandlerKind::Fail => Err(plumber::Error::servlet("handler gave up")),
            }
        };
        ctx.write_scope_token(
            self.out.unwrap(),
            token,
            Some(DataRequest {
                size: 16,
                handler: &mut handler,
            }),
        )?;
        Ok(())
    }
}

fn run_emitter(kind: HandlerKind) -> (Vec<u8>, Vec<u8>) {
    support::init_log();
    let (registry, module) = support::mem_registry(plumber::pipe::mem::MemModule::new());
    let schema = support::empty_schema();
    let preamble = Arc::new(Mutex::new(Vec::new()));

    let mut builder = ServiceGraph::builder(schema, registry);
    let emitter = builder.node(
        Box::new(Emitter {
            out: None,
            kind,
            preamble: Arc::clone(&preamble),
        }),
        &[],
    );
    builder.input(emitter, "in").output(emitter, "out");
    let graph = builder.build().expect("graph builds");

    let (client_tx, input) = support::external_pipe(&module, 0);
    let (output, mut client_rx) = support::external_pipe(&module, 0);
    drop(client_tx);

    let sched = sched::Builder::new().pool_threads(1);
    let (scheduler, handle) = sched.scheduler(0, sched.pool().expect("async pool spawns"));
    let done = handle.new_request(&graph, input, output).unwrap();
    drop(handle);

    let (run, done) = futures_executor::block_on(future::join(scheduler, done));
    run.unwrap();
    done.unwrap();

    let preamble = preamble.lock().unwrap().clone();
    (preamble, support::drain_pipe(&mut client_rx))
}

#[test]
fn preamble_handler_gets_the_head_and_the_drain_gets_the_rest() {
    let (preamble, drained) = run_emitter(HandlerKind::Consume);
    let expected = payload();
    assert_eq!(&preamble[..], &expected[..16]);
    assert_eq!(drained.len(), PAYLOAD_LEN - 16);
    assert_eq!(&drained[..], &expected[16..]);
}

#[test]
fn declining_handler_still_drains_everything() {
    let (preamble, drained) = run_emitter(HandlerKind::Decline);
    assert!(preamble.is_empty());
    assert_eq!(drained.len(), PAYLOAD_LEN);
    assert_eq!(&drained[..], &payload()[..]);
}

#[test]
fn failing_handler_still_drains_everything() {
    let (preamble, drained) = run_emitter(HandlerKind::Fail);
    assert!(preamble.is_empty());
    assert_eq!(drained.len(), PAYLOAD_LEN);
}
