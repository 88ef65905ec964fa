//! Typed headers end to end: accessors resolved at graph link time,
//! constants captured from the schema, direct-buffer reads with their
//! streamed fallback, and header pass-through via copy declarations.

mod support;

use std::sync::{Arc, Mutex};

use futures_util::future;
use plumber::graph::ServiceGraph;
use plumber::pipe::mem::MemModule;
use plumber::pipe::{Pipe, PipeFlags};
use plumber::proto::{Accessor, ConstReq, FieldKind, Schema, TypeBuilder};
use plumber::sched;
use plumber::servlet::{Servlet, ServletInit, ServletMode, TaskContext};

const RESPONSE_TYPE: &str = "http.Response";

fn response_schema() -> Arc<Schema> {
    let mut schema = Schema::new();
    schema
        .define(
            TypeBuilder::new(RESPONSE_TYPE)
                .field("status_code", FieldKind::Unsigned(2))
                .constant(
                    "BODY_SIZE_UNKNOWN",
                    FieldKind::Unsigned(4),
                    &0xffff_ffffu32.to_le_bytes(),
                ),
        )
        .unwrap();
    schema.into()
}

struct Writer {
    out: Option<Pipe>,
    status: Option<Accessor>,
    unknown: Option<ConstReq>,
    captured: Arc<Mutex<Option<u32>>>,
}

impl Servlet for Writer {
    fn init(&mut self, _args: &[&str], env: &mut ServletInit<'_>) -> plumber::Result<ServletMode> {
        env.define("in", PipeFlags::INPUT, None)?;
        let out = env.define("out", PipeFlags::OUTPUT, Some(RESPONSE_TYPE))?;
        self.status = Some(env.model().accessor(out, "status_code")?);
        self.unknown = Some(env.model().constant(out, "BODY_SIZE_UNKNOWN", false, false, 4)?);
        self.out = Some(out);
        Ok(ServletMode::Sync)
    }

    fn exec(&mut self, ctx: &mut TaskContext<'_>) -> plumber::Result<()> {
        *self.captured.lock().unwrap() = ctx.model().constant_u32(self.unknown.unwrap());
        ctx.write_field(self.status.unwrap(), &404u16.to_le_bytes())?;
        Ok(())
    }
}

struct RawReader {
    input: Option<Pipe>,
    out: Option<Pipe>,
    header: Arc<Mutex<Vec<u8>>>,
}

impl Servlet for RawReader {
    fn init(&mut self, _args: &[&str], env: &mut ServletInit<'_>) -> plumber::Result<ServletMode> {
        self.input = Some(env.define("in", PipeFlags::INPUT, Some(RESPONSE_TYPE))?);
        self.out = Some(env.define("out", PipeFlags::OUTPUT, None)?);
        Ok(ServletMode::Sync)
    }

    fn exec(&mut self, ctx: &mut TaskContext<'_>) -> plumber::Result<()> {
        let mut hdr = [0u8; 6];
        let mut got = 0;
        while got < hdr.len() {
            let n = ctx.read_hdr(self.input.unwrap(), &mut hdr[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        self.header.lock().unwrap().extend_from_slice(&hdr[..got]);
        ctx.write(self.out.unwrap(), &hdr[..2])?;
        Ok(())
    }
}

fn run_status_graph(module: MemModule) -> (Vec<u8>, Option<u32>) {
    support::init_log();
    let (registry, module) = support::mem_registry(module);
    let schema = response_schema();
    let captured = Arc::new(Mutex::new(None));
    let header = Arc::new(Mutex::new(Vec::new()));

    let mut builder = ServiceGraph::builder(schema, registry);
    let writer = builder.node(
        Box::new(Writer {
            out: None,
            status: None,
            unknown: None,
            captured: Arc::clone(&captured),
        }),
        &[],
    );
    let reader = builder.node(
        Box::new(RawReader {
            input: None,
            out: None,
            header: Arc::clone(&header),
        }),
        &[],
    );
    builder.edge(writer, "out", reader, "in");
    builder.input(writer, "in").output(reader, "out");
    let graph = builder.build().expect("typed graph builds");

    let (client_tx, input) = support::external_pipe(&module, 0);
    let (output, _client_rx) = support::external_pipe(&module, 0);
    drop(client_tx);

    let sched = sched::Builder::new().pool_threads(1);
    let (scheduler, handle) = sched.scheduler(0, sched.pool().expect("async pool spawns"));
    let done = handle.new_request(&graph, input, output).unwrap();
    drop(handle);

    let (run, done) = futures_executor::block_on(future::join(scheduler, done));
    run.unwrap();
    done.unwrap();

    let header = header.lock().unwrap().clone();
    let captured = *captured.lock().unwrap();
    (header, captured)
}

#[test]
fn status_code_bytes_and_constant_capture() {
    let (header, captured) = run_status_graph(MemModule::new());
    // status_code sits at offset 0: little-endian 404; the writer only
    // touched that field, so only its bytes reached the wire
    assert_eq!(header, vec![0x94, 0x01]);
    assert_eq!(captured, Some(0xffff_ffff));
}

#[test]
fn fragmented_transport_reads_the_same_bytes() {
    // the module refuses contiguous buffers, forcing the streamed
    // header path; observable bytes must not change
    let (header, captured) = run_status_graph(MemModule::new().fragmented(true));
    assert_eq!(header, vec![0x94, 0x01]);
    assert_eq!(captured, Some(0xffff_ffff));
}

/// A middle stage that declares copy_pipe_data and writes nothing: the
/// downstream must observe the upstream's header bytes unchanged.
struct PassThrough {
    input: Option<Pipe>,
    out: Option<Pipe>,
}

impl Servlet for PassThrough {
    fn init(&mut self, _args: &[&str], env: &mut ServletInit<'_>) -> plumber::Result<ServletMode> {
        let input = env.define("in", PipeFlags::INPUT, Some(RESPONSE_TYPE))?;
        let out = env.define("out", PipeFlags::OUTPUT, Some(RESPONSE_TYPE))?;
        env.model().copy_pipe_data(input, out)?;
        self.input = Some(input);
        self.out = Some(out);
        Ok(ServletMode::Sync)
    }

    fn exec(&mut self, _ctx: &mut TaskContext<'_>) -> plumber::Result<()> {
        Ok(())
    }
}

#[test]
fn copy_pipe_data_passes_the_header_through() {
    support::init_log();
    let (registry, module) = support::mem_registry(MemModule::new());
    let schema = response_schema();
    let captured = Arc::new(Mutex::new(None));
    let header = Arc::new(Mutex::new(Vec::new()));

    let mut builder = ServiceGraph::builder(schema, registry);
    let writer = builder.node(
        Box::new(Writer {
            out: None,
            status: None,
            unknown: None,
            captured,
        }),
        &[],
    );
    let middle = builder.node(Box::new(PassThrough { input: None, out: None }), &[]);
    let reader = builder.node(
        Box::new(RawReader {
            input: None,
            out: None,
            header: Arc::clone(&header),
        }),
        &[],
    );
    builder.edge(writer, "out", middle, "in");
    builder.edge(middle, "out", reader, "in");
    builder.input(writer, "in").output(reader, "out");
    let graph = builder.build().unwrap();

    let (client_tx, input) = support::external_pipe(&module, 0);
    let (output, _client_rx) = support::external_pipe(&module, 0);
    drop(client_tx);

    let sched = sched::Builder::new().pool_threads(1);
    let (scheduler, handle) = sched.scheduler(0, sched.pool().expect("async pool spawns"));
    let done = handle.new_request(&graph, input, output).unwrap();
    drop(handle);

    let (run, done) = futures_executor::block_on(future::join(scheduler, done));
    run.unwrap();
    done.unwrap();

    let header = header.lock().unwrap().clone();
    assert_eq!(&header[..2], &[0x94, 0x01], "status passed through untouched");
    assert_eq!(&header[2..6], &[0, 0, 0, 0]);
}

#[test]
fn field_size_is_zero_until_linked() {
    // a model outside any graph never resolves
    let mut model = plumber::proto::TypeModel::new();
    let acc = model.accessor(Pipe::from_id(0), "status_code").unwrap();
    assert_eq!(model.field_size(acc), 0);
}
