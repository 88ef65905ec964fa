//! The per-thread scheduler loop.
//!
//! Each scheduler owns a private task table and an inbox. One loop
//! iteration drains the inbox (new requests, async completions, external
//! cancels), pops a bounded batch of ready tasks and runs them —
//! materializing output pipes on dispatch and delivering them downstream
//! on completion — then finalizes drained requests. The loop is a
//! hand-written `Future`: it returns `Pending` only when nothing
//! progressed, and resolves once every external handle is gone and the
//! last request has drained. Tasks never migrate; a request is sticky to
//! the scheduler that accepted it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_channel::mpsc;
use futures_core::Stream;
use futures_util::task::AtomicWaker;
use pin_project_lite::pin_project;

use crate::error::Error;
use crate::graph::{NodeId, ServiceGraph};
use crate::pipe::module::NullPort;
use crate::pipe::{PipeFlags, PipeHandle, PipeId};
use crate::proto::instance::PipeAccess;
use crate::scope::Scope;
use crate::sched::async_task::AsyncHandle;
use crate::sched::pool::AsyncPool;
use crate::sched::task::{CancelOutcome, InputStage, TaskState, TaskTable};
use crate::sched::{RequestId, SchedId};
use crate::servlet::{ServletMode, TaskContext};

pub(crate) enum Event {
    NewRequest {
        graph: Arc<ServiceGraph>,
        input: PipeHandle,
        output: PipeHandle,
        done: Option<tokio::sync::oneshot::Sender<RequestId>>,
    },
    AsyncDone {
        key: usize,
        request: RequestId,
        node: NodeId,
        status: i32,
    },
    Cancel {
        request: RequestId,
    },
}

/// Wakes the scheduler when the last external handle goes away.
struct Alive {
    waker: AtomicWaker,
}

struct HandleAlive {
    shared: Arc<Alive>,
}

impl Drop for HandleAlive {
    fn drop(&mut self) {
        self.shared.waker.wake();
    }
}

/// Admits work into a [`Scheduler`] from any thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    id: SchedId,
    tx: mpsc::UnboundedSender<Event>,
    alive: Arc<HandleAlive>,
}

impl SchedulerHandle {
    /// The owning scheduler's id.
    pub fn id(&self) -> SchedId {
        self.id
    }

    /// Admit a request: the external input handle enters at the graph's
    /// input node, the external output handle will be wired to its
    /// output node. The returned future resolves when the request has
    /// fully drained.
    pub fn new_request(
        &self,
        graph: &Arc<ServiceGraph>,
        input: PipeHandle,
        output: PipeHandle,
    ) -> crate::Result<RequestDone> {
        let (done, rx) = tokio::sync::oneshot::channel();
        self.tx
            .unbounded_send(Event::NewRequest {
                graph: Arc::clone(graph),
                input,
                output,
                done: Some(done),
            })
            .map_err(|_| Error::new_channel_closed())?;
        Ok(RequestDone { rx })
    }

    /// Cancel a request's remaining work.
    pub fn cancel_request(&self, request: RequestId) -> crate::Result<()> {
        self.tx
            .unbounded_send(Event::Cancel { request })
            .map_err(|_| Error::new_channel_closed())
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle").field("id", &self.id).finish()
    }
}

pin_project! {
    /// Resolves with the request id once the request has drained.
    pub struct RequestDone {
        #[pin]
        rx: tokio::sync::oneshot::Receiver<RequestId>,
    }
}

impl fmt::Debug for RequestDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDone").finish()
    }
}

impl Future for RequestDone {
    type Output = crate::Result<RequestId>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project()
            .rx
            .poll(cx)
            .map(|res| res.map_err(|_| Error::new_channel_closed()))
    }
}

struct RequestState {
    scope: Scope,
    tasks: usize,
    output: Option<PipeHandle>,
    done: Option<tokio::sync::oneshot::Sender<RequestId>>,
    cancelled: bool,
}

/// One delivery owed to a downstream task once the producer completes.
struct Delivery {
    dst_node: NodeId,
    dst_slot: PipeId,
    handle: PipeHandle,
}

struct PipesOf<'a>(&'a mut [Option<PipeHandle>]);

impl PipeAccess for PipesOf<'_> {
    fn pipe(&mut self, id: PipeId) -> crate::Result<&mut PipeHandle> {
        self.0
            .get_mut(usize::from(id))
            .and_then(|p| p.as_mut())
            .ok_or_else(|| Error::new_invalid_arg("slot has no pipe"))
    }
}

/// A per-thread cooperative scheduler loop.
pub struct Scheduler {
    id: SchedId,
    rx: mpsc::UnboundedReceiver<Event>,
    tx: mpsc::UnboundedSender<Event>,
    alive: Weak<HandleAlive>,
    alive_signal: Arc<Alive>,
    table: TaskTable,
    requests: HashMap<RequestId, RequestState>,
    next_request: u64,
    pool: Arc<AsyncPool>,
    ready_batch: usize,
}

impl Scheduler {
    pub(crate) fn new(
        id: SchedId,
        pool: Arc<AsyncPool>,
        ready_batch: usize,
    ) -> (Scheduler, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded();
        let alive_signal = Arc::new(Alive {
            waker: AtomicWaker::new(),
        });
        let handle_alive = Arc::new(HandleAlive {
            shared: Arc::clone(&alive_signal),
        });
        let scheduler = Scheduler {
            id,
            rx,
            tx: tx.clone(),
            alive: Arc::downgrade(&handle_alive),
            alive_signal,
            table: TaskTable::new(),
            requests: HashMap::new(),
            next_request: 0,
            pool,
            ready_batch: ready_batch.max(1),
        };
        let handle = SchedulerHandle {
            id,
            tx,
            alive: handle_alive,
        };
        (scheduler, handle)
    }

    /// This scheduler's id.
    pub fn id(&self) -> SchedId {
        self.id
    }

    /// Whether the scheduler still holds tasks for the request.
    pub fn request_status(&self, request: RequestId) -> bool {
        self.requests.contains_key(&request)
    }

    /// Number of live requests.
    pub fn num_concurrent_requests(&self) -> usize {
        self.requests.len()
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::NewRequest {
                graph,
                input,
                output,
                done,
            } => {
                let request = RequestId(self.next_request);
                self.next_request += 1;
                tracing::debug!(%request, sched = self.id, "request accepted");
                self.requests.insert(
                    request,
                    RequestState {
                        scope: Scope::new(),
                        tasks: 0,
                        output: Some(output),
                        done,
                        cancelled: false,
                    },
                );
                let (node, slot) = graph.input();
                self.deliver(request, &graph, node, slot, Some(input), InputStage::Sync);
            }
            Event::AsyncDone {
                key,
                request,
                node,
                status,
            } => {
                let valid = self.table.get(key).map_or(false, |t| {
                    t.request == request && t.node == node && t.state == TaskState::AsyncWaiting
                });
                if !valid {
                    tracing::debug!(%request, node, "stale async completion dropped");
                    return;
                }
                self.complete_async(key, status);
            }
            Event::Cancel { request } => self.cancel_request_now(request),
        }
    }

    /// Deliver a pipe-arrival notification to `(request, node, slot)`.
    fn deliver(
        &mut self,
        request: RequestId,
        graph: &Arc<ServiceGraph>,
        node: NodeId,
        slot: PipeId,
        handle: Option<PipeHandle>,
        stage: InputStage,
    ) {
        let cancelled = self
            .requests
            .get(&request)
            .map_or(true, |state| state.cancelled);
        if cancelled {
            return;
        }
        match self.table.input_pipe(graph, request, node, slot, handle, stage) {
            Ok((_, created)) => {
                if created {
                    if let Some(state) = self.requests.get_mut(&request) {
                        state.tasks += 1;
                    }
                }
            }
            Err(err) => {
                tracing::error!(%request, node, error = %err, "input delivery failed");
                self.cancel_at(request, graph, node);
            }
        }
    }

    /// Deliver a cancellation to `(request, node)`, cascading through
    /// every output edge of a task whose whole input set cancels.
    fn cancel_at(&mut self, request: RequestId, graph: &Arc<ServiceGraph>, node: NodeId) {
        let cancelled = self
            .requests
            .get(&request)
            .map_or(true, |state| state.cancelled);
        if cancelled {
            return;
        }
        let mut worklist = vec![node];
        while let Some(node) = worklist.pop() {
            let (key, created) = self.table.pending_task(graph, request, node);
            if created {
                if let Some(state) = self.requests.get_mut(&request) {
                    state.tasks += 1;
                }
            }
            match self.table.input_cancelled(key) {
                Ok(CancelOutcome::Cancelled) => {
                    // the task will never run; its output edges cancel
                    // trivially, including disabled shadows
                    for edge_id in graph.node(node).out_edges.iter().flatten() {
                        worklist.push(graph.edge(*edge_id).dst.0);
                    }
                    self.free_task(key);
                }
                Ok(CancelOutcome::BecameReady) | Ok(CancelOutcome::Pending) => {}
                Err(err) => {
                    tracing::error!(%request, node, error = %err, "cancellation failed");
                }
            }
        }
    }

    fn free_task(&mut self, key: usize) {
        if let Ok(task) = self.table.free(key) {
            if let Some(state) = self.requests.get_mut(&task.request) {
                state.tasks -= 1;
            }
        }
    }

    fn cancel_request_now(&mut self, request: RequestId) {
        let state = match self.requests.get_mut(&request) {
            Some(state) => state,
            None => return,
        };
        tracing::debug!(%request, "request cancelled");
        state.cancelled = true;
        for key in self.table.request_tasks(request) {
            let disposable = self.table.get(key).map_or(false, |t| {
                matches!(t.state, TaskState::Pending | TaskState::Ready)
            });
            if disposable {
                self.free_task(key);
            }
        }
    }

    /// Dispatch one ready task.
    fn run_task(&mut self, key: usize) {
        let (request, node_id, graph) = match self.table.get(key) {
            Some(task) => (task.request, task.node, Arc::clone(&task.graph)),
            None => return,
        };
        if self.requests.get(&request).map_or(true, |s| s.cancelled) {
            self.free_task(key);
            return;
        }

        let mut deliveries = Vec::new();
        if let Err(err) = self.materialize(key, &graph, request, node_id, &mut deliveries) {
            tracing::error!(%request, node = node_id, error = %err, "output materialization failed");
            self.fail_task(key, &graph, request, node_id);
            return;
        }

        match graph.node(node_id).mode {
            ServletMode::Sync => {
                let ok = self.exec_sync(key, &graph, node_id);
                self.complete_task(key, &graph, request, node_id, ok, deliveries, false);
            }
            ServletMode::Async => {
                let node = graph.node(node_id);
                let exec = node.servlet.lock().async_exec();
                let handle = AsyncHandle::new(
                    node.async_buf_size,
                    exec,
                    self.tx.clone(),
                    key,
                    request,
                    node_id,
                );
                let setup_ok = self.exec_async_setup(key, &graph, node_id, &handle);
                if !setup_ok {
                    self.fail_task(key, &graph, request, node_id);
                    return;
                }
                // stage 1: attach the downstream pipe arrays without
                // marking them ready
                for delivery in deliveries.drain(..) {
                    self.deliver(
                        request,
                        &graph,
                        delivery.dst_node,
                        delivery.dst_slot,
                        Some(delivery.handle),
                        InputStage::Attach,
                    );
                }
                if let Some(task) = self.table.get_mut(key) {
                    task.state = TaskState::AsyncWaiting;
                    task.async_handle = Some(handle.clone());
                }
                if handle.is_cancelled() {
                    // setup cancelled the task: skip exec, go straight
                    // to cleanup
                    self.complete_async(key, handle.retcode());
                } else {
                    self.pool.submit(handle);
                }
            }
        }
    }

    /// Create the task's output pipe handles: real edges get fresh
    /// transport pipes, shadow slots get forked read views, unwired
    /// slots get discarding pipes, and the graph's output slot receives
    /// the request's external handle.
    fn materialize(
        &mut self,
        key: usize,
        graph: &Arc<ServiceGraph>,
        request: RequestId,
        node_id: NodeId,
        deliveries: &mut Vec<Delivery>,
    ) -> crate::Result<()> {
        let node = graph.node(node_id);
        let mut rx_by_slot: HashMap<PipeId, usize> = HashMap::new();
        for slot_idx in 0..node.slots.len() {
            let slot = slot_idx as PipeId;
            let def = &node.slots[slot_idx];
            if def.flags.is_input() {
                let task = self
                    .table
                    .get_mut(key)
                    .ok_or_else(|| Error::new_invalid_arg("unknown task"))?;
                if task.pipes[slot_idx].is_none() {
                    // optional input the graph left unwired
                    task.pipes[slot_idx] =
                        Some(PipeHandle::new(Box::new(NullPort), PipeFlags::INPUT, 0));
                }
                continue;
            }

            if (node_id, slot) == graph.output() {
                let handle = self
                    .requests
                    .get_mut(&request)
                    .and_then(|state| state.output.take())
                    .ok_or_else(|| {
                        Error::new_programming("external output handle already consumed")
                    })?;
                self.table.output_pipe(key, slot, handle)?;
                continue;
            }

            if def.flags.is_shadow() {
                let target = def.flags.target();
                let disabled = def.flags.is_disabled();
                let fork = match rx_by_slot.get(&target) {
                    Some(&idx) => deliveries[idx].handle.fork_shadow(target, disabled)?,
                    None => {
                        // mirrored slot is unwired: the shadow sees an
                        // empty stream
                        let mut flags =
                            (PipeFlags::INPUT | PipeFlags::SHADOW).with_target(target);
                        if disabled {
                            flags.insert(PipeFlags::DISABLED);
                        }
                        PipeHandle::new(Box::new(NullPort), flags, 0)
                    }
                };
                self.table.output_shadow(key, slot, fork)?;
                continue;
            }

            if let Some(edge_id) = node.out_edges[slot_idx] {
                let edge = graph.edge(edge_id);
                let (tx_port, rx_port) = graph.transport.open_pipe()?;
                let mut tx = PipeHandle::new(tx_port, def.flags, edge.hdr_size)
                    .with_module(graph.transport_id, Arc::clone(&graph.transport_path));
                if def.flags.is_persist() {
                    tx.set_flag(PipeFlags::PERSIST);
                }
                let rx_flags =
                    (PipeFlags::INPUT | def.flags.shared()).with_target(edge.dst.1);
                let rx = PipeHandle::new(rx_port, rx_flags, edge.hdr_size)
                    .with_module(graph.transport_id, Arc::clone(&graph.transport_path));
                self.table.output_pipe(key, slot, tx)?;
                rx_by_slot.insert(slot, deliveries.len());
                deliveries.push(Delivery {
                    dst_node: edge.dst.0,
                    dst_slot: edge.dst.1,
                    handle: rx,
                });
            } else {
                // unwired output: writes are discarded
                self.table
                    .output_pipe(key, slot, PipeHandle::new(Box::new(NullPort), def.flags, 0))?;
            }
        }
        Ok(())
    }

    /// Run a sync servlet's exec and flush its type instance. Returns
    /// whether the task succeeded.
    fn exec_sync(&mut self, key: usize, graph: &Arc<ServiceGraph>, node_id: NodeId) -> bool {
        let Scheduler {
            ref mut table,
            ref mut requests,
            ..
        } = *self;
        let task = match table.get_mut(key) {
            Some(task) => task,
            None => return false,
        };
        let state = match requests.get_mut(&task.request) {
            Some(state) => state,
            None => return false,
        };
        let node = graph.node(node_id);
        let mut servlet = node.servlet.lock();
        let result = {
            let mut ctx = TaskContext {
                slots: &node.slots,
                pipes: &mut task.pipes,
                scope: &mut state.scope,
                model: &node.model,
                instance: &mut task.instance,
                registry: &graph.registry,
            };
            servlet.exec(&mut ctx)
        };
        match result {
            Ok(()) => flush_instance(task, graph, node_id),
            Err(err) => {
                tracing::debug!(request = %task.request, node = node_id, error = %err, "exec failed");
                false
            }
        }
    }

    /// Run an async servlet's setup phase. Returns whether it succeeded.
    fn exec_async_setup(
        &mut self,
        key: usize,
        graph: &Arc<ServiceGraph>,
        node_id: NodeId,
        handle: &AsyncHandle,
    ) -> bool {
        let Scheduler {
            ref mut table,
            ref mut requests,
            ..
        } = *self;
        let task = match table.get_mut(key) {
            Some(task) => task,
            None => return false,
        };
        let state = match requests.get_mut(&task.request) {
            Some(state) => state,
            None => return false,
        };
        let node = graph.node(node_id);
        let mut servlet = node.servlet.lock();
        let result = handle.with_buf(|buf| {
            let mut ctx = TaskContext {
                slots: &node.slots,
                pipes: &mut task.pipes,
                scope: &mut state.scope,
                model: &node.model,
                instance: &mut task.instance,
                registry: &graph.registry,
            };
            servlet.async_setup(handle, buf, &mut ctx)
        });
        if let Err(err) = result {
            tracing::debug!(request = %task.request, node = node_id, error = %err, "async setup failed");
            return false;
        }
        true
    }

    /// Phase 3 of an async task, plus downstream stage-2 notifications.
    fn complete_async(&mut self, key: usize, status: i32) {
        let (request, node_id, graph, handle) = match self.table.get(key) {
            Some(task) => (
                task.request,
                task.node,
                Arc::clone(&task.graph),
                task.async_handle.clone(),
            ),
            None => return,
        };
        let handle = match handle {
            Some(handle) => handle,
            None => return,
        };
        if let Some(task) = self.table.get_mut(key) {
            task.state = TaskState::Running;
        }

        let cleanup_ok = {
            let Scheduler {
                ref mut table,
                ref mut requests,
                ..
            } = *self;
            let task = table.get_mut(key).expect("running task");
            let state = match requests.get_mut(&task.request) {
                Some(state) => state,
                None => return,
            };
            let node = graph.node(node_id);
            let mut servlet = node.servlet.lock();
            let result = handle.with_buf(|buf| {
                let mut ctx = TaskContext {
                    slots: &node.slots,
                    pipes: &mut task.pipes,
                    scope: &mut state.scope,
                    model: &node.model,
                    instance: &mut task.instance,
                    registry: &graph.registry,
                };
                servlet.async_cleanup(&handle, buf, &mut ctx)
            });
            match result {
                Ok(()) => flush_instance(task, &graph, node_id),
                Err(err) => {
                    tracing::debug!(%request, node = node_id, error = %err, "async cleanup failed");
                    false
                }
            }
        };

        let ok = status >= 0 && cleanup_ok;
        self.complete_task(key, &graph, request, node_id, ok, Vec::new(), true);
    }

    /// A task failed before producing anything: cancel every output edge
    /// and dispose it.
    fn fail_task(
        &mut self,
        key: usize,
        graph: &Arc<ServiceGraph>,
        request: RequestId,
        node_id: NodeId,
    ) {
        let downstream: Vec<NodeId> = graph
            .node(node_id)
            .out_edges
            .iter()
            .flatten()
            .map(|&edge| graph.edge(edge).dst.0)
            .collect();
        for node in downstream {
            self.cancel_at(request, graph, node);
        }
        self.free_task(key);
    }

    /// Finish a task: close its transport writes, then notify or cancel
    /// each downstream edge. `ready_only` distinguishes async stage-2
    /// notifications (handles were attached at stage 1) from sync
    /// deliveries that still carry the read handles.
    fn complete_task(
        &mut self,
        key: usize,
        graph: &Arc<ServiceGraph>,
        request: RequestId,
        node_id: NodeId,
        ok: bool,
        deliveries: Vec<Delivery>,
        ready_only: bool,
    ) {
        let node = graph.node(node_id);

        // dropping the write handles freezes the edges so readers see
        // the complete byte stream; shadow views are extracted first
        let mut shadows: Vec<(usize, PipeHandle)> = Vec::new();
        if let Some(task) = self.table.get_mut(key) {
            for (slot_idx, def) in node.slots.iter().enumerate() {
                if !def.flags.is_output() {
                    continue;
                }
                if def.flags.is_shadow() {
                    if let Some(handle) = task.pipes[slot_idx].take() {
                        shadows.push((slot_idx, handle));
                    }
                } else {
                    task.pipes[slot_idx] = None;
                }
            }
        }

        let cancelled = self
            .requests
            .get(&request)
            .map_or(true, |state| state.cancelled);
        if cancelled {
            self.free_task(key);
            return;
        }

        if ok {
            if ready_only {
                for (slot_idx, def) in node.slots.iter().enumerate() {
                    if !def.flags.is_output() || def.flags.is_shadow() {
                        continue;
                    }
                    if (node_id, slot_idx as PipeId) == graph.output() {
                        continue;
                    }
                    if let Some(edge_id) = node.out_edges[slot_idx] {
                        let (dst_node, dst_slot) = graph.edge(edge_id).dst;
                        self.deliver(request, graph, dst_node, dst_slot, None, InputStage::Ready);
                    }
                }
            } else {
                for delivery in deliveries {
                    self.deliver(
                        request,
                        graph,
                        delivery.dst_node,
                        delivery.dst_slot,
                        Some(delivery.handle),
                        InputStage::Sync,
                    );
                }
            }
            for (slot_idx, handle) in shadows {
                let def = &node.slots[slot_idx];
                let edge_id = match node.out_edges[slot_idx] {
                    Some(edge) => edge,
                    None => continue,
                };
                let (dst_node, dst_slot) = graph.edge(edge_id).dst;
                if !handle.flags().is_disabled() {
                    self.deliver(
                        request,
                        graph,
                        dst_node,
                        dst_slot,
                        Some(handle),
                        InputStage::Sync,
                    );
                } else if def.propagate_disabled {
                    drop(handle);
                    self.cancel_at(request, graph, dst_node);
                } else {
                    // deliver an empty stream instead of cancelling
                    drop(handle);
                    let flags = (PipeFlags::INPUT | PipeFlags::SHADOW)
                        .with_target(def.flags.target());
                    let empty = PipeHandle::new(Box::new(NullPort), flags, 0);
                    self.deliver(request, graph, dst_node, dst_slot, Some(empty), InputStage::Sync);
                }
            }
        } else {
            drop(deliveries);
            drop(shadows);
            let downstream: Vec<NodeId> = node
                .out_edges
                .iter()
                .flatten()
                .map(|&edge| graph.edge(edge).dst.0)
                .collect();
            for dst in downstream {
                self.cancel_at(request, graph, dst);
            }
        }
        if let Some(task) = self.table.get_mut(key) {
            task.state = TaskState::Completed;
        }
        self.free_task(key);
    }

    /// Release every request whose last task has been freed.
    fn finalize_requests(&mut self) {
        let drained: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, state)| state.tasks == 0)
            .map(|(&request, _)| request)
            .collect();
        for request in drained {
            let mut state = self.requests.remove(&request).expect("drained request");
            debug_assert!(!self.table.request_live(request));
            state.scope.finalize();
            drop(state.output);
            if let Some(done) = state.done.take() {
                let _ = done.send(request);
            }
            tracing::debug!(%request, sched = self.id, "request released");
        }
    }
}

impl Future for Scheduler {
    type Output = crate::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = &mut *self;
        me.alive_signal.waker.register(cx.waker());
        loop {
            let mut progressed = false;

            // 1. drain the inbox
            loop {
                match Pin::new(&mut me.rx).poll_next(cx) {
                    Poll::Ready(Some(event)) => {
                        me.handle_event(event);
                        progressed = true;
                    }
                    Poll::Ready(None) | Poll::Pending => break,
                }
            }

            // 2. dispatch up to one batch of ready tasks
            let mut ran = 0;
            while ran < me.ready_batch {
                match me.table.next_ready_task() {
                    Some(key) => {
                        me.run_task(key);
                        ran += 1;
                    }
                    None => break,
                }
            }
            if ran > 0 {
                progressed = true;
            }

            // 3. release drained requests
            me.finalize_requests();

            if !progressed {
                if me.alive.strong_count() == 0 && me.requests.is_empty() {
                    tracing::debug!(sched = me.id, "scheduler drained");
                    return Poll::Ready(Ok(()));
                }
                return Poll::Pending;
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("requests", &self.requests.len())
            .finish()
    }
}

/// Flush the task's type instance into its output pipes; reports success.
fn flush_instance(
    task: &mut crate::sched::task::Task,
    graph: &Arc<ServiceGraph>,
    node_id: NodeId,
) -> bool {
    let instance = match task.instance.as_mut() {
        Some(instance) => instance,
        None => return true,
    };
    let node = graph.node(node_id);
    let mut pipes = PipesOf(&mut task.pipes);
    match instance.flush(&node.model, &mut pipes) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(request = %task.request, node = node_id, error = %err, "header flush failed");
            false
        }
    }
}
