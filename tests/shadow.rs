//! Shadow outputs: broadcast without copying, and the disabled bit as a
//! zero-cost conditional route.

mod support;

use std::sync::{Arc, Mutex};

use futures_util::future;
use plumber::graph::ServiceGraph;
use plumber::pipe::{Pipe, PipeFlags};
use plumber::sched;
use plumber::servlet::{Servlet, ServletInit, ServletMode, TaskContext};

/// Emits one payload on `out`; `out_copy` shadows it. When `enable` is
/// set the servlet clears the shadow's disabled bit before finishing.
struct Producer {
    out: Option<Pipe>,
    copy: Option<Pipe>,
    disabled_at_define: bool,
    enable: bool,
}

impl Servlet for Producer {
    fn init(&mut self, _args: &[&str], env: &mut ServletInit<'_>) -> plumber::Result<ServletMode> {
        env.define("in", PipeFlags::INPUT, None)?;
        let out = env.define("out", PipeFlags::OUTPUT, None)?;
        let mut flags =
            (PipeFlags::OUTPUT | PipeFlags::SHADOW).with_target(out.id()?);
        if self.disabled_at_define {
            flags.insert(PipeFlags::DISABLED);
        }
        self.copy = Some(env.define("out_copy", flags, None)?);
        self.out = Some(out);
        Ok(ServletMode::Sync)
    }

    fn exec(&mut self, ctx: &mut TaskContext<'_>) -> plumber::Result<()> {
        ctx.write(self.out.unwrap(), b"payload")?;
        if self.enable {
            ctx.clr_flag(self.copy.unwrap(), PipeFlags::DISABLED)?;
        }
        Ok(())
    }
}

struct Consumer {
    input: Option<Pipe>,
    seen: Arc<Mutex<Vec<u8>>>,
    ran: Arc<Mutex<bool>>,
    forward: bool,
    out: Option<Pipe>,
}

impl Servlet for Consumer {
    fn init(&mut self, _args: &[&str], env: &mut ServletInit<'_>) -> plumber::Result<ServletMode> {
        self.input = Some(env.define("in", PipeFlags::INPUT, None)?);
        if self.forward {
            self.out = Some(env.define("out", PipeFlags::OUTPUT, None)?);
        }
        Ok(ServletMode::Sync)
    }

    fn exec(&mut self, ctx: &mut TaskContext<'_>) -> plumber::Result<()> {
        *self.ran.lock().unwrap() = true;
        let mut buf = [0u8; 64];
        loop {
            let n = ctx.read(self.input.unwrap(), &mut buf)?;
            if n == 0 {
                break;
            }
            self.seen.lock().unwrap().extend_from_slice(&buf[..n]);
        }
        if let Some(out) = self.out {
            ctx.write(out, b".")?;
        }
        Ok(())
    }
}

struct Fixture {
    a_seen: Arc<Mutex<Vec<u8>>>,
    b_seen: Arc<Mutex<Vec<u8>>>,
    a_ran: Arc<Mutex<bool>>,
    b_ran: Arc<Mutex<bool>>,
    module: Arc<plumber::pipe::mem::MemModule>,
}

fn run_shadow_graph(disabled_at_define: bool, enable: bool) -> Fixture {
    run_shadow_graph_with(disabled_at_define, enable, true)
}

fn run_shadow_graph_with(disabled_at_define: bool, enable: bool, propagate: bool) -> Fixture {
    support::init_log();
    let (registry, module) = support::mem_registry(plumber::pipe::mem::MemModule::new());
    let schema = support::empty_schema();
    let fixture = Fixture {
        a_seen: Arc::new(Mutex::new(Vec::new())),
        b_seen: Arc::new(Mutex::new(Vec::new())),
        a_ran: Arc::new(Mutex::new(false)),
        b_ran: Arc::new(Mutex::new(false)),
        module,
    };

    let mut builder = ServiceGraph::builder(schema, registry);
    let producer = builder.node(
        Box::new(Producer {
            out: None,
            copy: None,
            disabled_at_define,
            enable,
        }),
        &[],
    );
    let a = builder.node(
        Box::new(Consumer {
            input: None,
            seen: Arc::clone(&fixture.a_seen),
            ran: Arc::clone(&fixture.a_ran),
            forward: true,
            out: None,
        }),
        &[],
    );
    let b = builder.node(
        Box::new(Consumer {
            input: None,
            seen: Arc::clone(&fixture.b_seen),
            ran: Arc::clone(&fixture.b_ran),
            forward: false,
            out: None,
        }),
        &[],
    );
    builder.edge(producer, "out", a, "in");
    builder.edge(producer, "out_copy", b, "in");
    builder.input(producer, "in").output(a, "out");
    if !propagate {
        builder.shadow_propagate_disabled(producer, "out_copy", false);
    }
    let graph = builder.build().expect("graph builds");

    let (client_tx, input) = support::external_pipe(&fixture.module, 0);
    let (output, _client_rx) = support::external_pipe(&fixture.module, 0);
    drop(client_tx);

    let sched = sched::Builder::new().pool_threads(1);
    let (scheduler, handle) = sched.scheduler(0, sched.pool().expect("async pool spawns"));
    let done = handle.new_request(&graph, input, output).unwrap();
    drop(handle);

    let (run, done) = futures_executor::block_on(future::join(scheduler, done));
    run.unwrap();
    done.unwrap();
    fixture
}

#[test]
fn shadow_broadcasts_identical_bytes_without_extra_writes() {
    let fixture = run_shadow_graph(false, false);
    assert_eq!(&*fixture.a_seen.lock().unwrap(), b"payload");
    assert_eq!(&*fixture.b_seen.lock().unwrap(), b"payload");
    // one write for the payload, one for A's forward to the external
    // output; the broadcast itself added none
    assert_eq!(fixture.module.stats().writes(), 2);
}

#[test]
fn disabled_shadow_cancels_its_consumer() {
    let fixture = run_shadow_graph(true, false);
    assert_eq!(&*fixture.a_seen.lock().unwrap(), b"payload");
    assert!(!*fixture.b_ran.lock().unwrap(), "B's task was cancelled");
    assert!(fixture.b_seen.lock().unwrap().is_empty());
}

#[test]
fn clearing_disabled_before_completion_routes_the_data() {
    let fixture = run_shadow_graph(true, true);
    assert!(*fixture.a_ran.lock().unwrap());
    assert!(*fixture.b_ran.lock().unwrap());
    assert_eq!(&*fixture.b_seen.lock().unwrap(), b"payload");
}

#[test]
fn non_propagating_disabled_shadow_delivers_an_empty_stream() {
    // with propagation off, the consumer still runs; it just sees no
    // bytes instead of being cancelled
    let fixture = run_shadow_graph_with(true, false, false);
    assert!(*fixture.b_ran.lock().unwrap(), "B ran on an empty pipe");
    assert!(fixture.b_seen.lock().unwrap().is_empty());
    assert_eq!(&*fixture.a_seen.lock().unwrap(), b"payload");
}
