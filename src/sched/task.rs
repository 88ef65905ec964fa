//! The per-scheduler task table.
//!
//! For every live request the table keeps, per service-graph node, the
//! task in progress and its readiness arithmetic. Tasks live in an arena
//! (`slab`), so they never pin each other; the `(request, node)` index
//! finds the pending task an arriving pipe belongs to, and the ready
//! queue hands tasks out in the FIFO order their last input arrived.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use slab::Slab;

use crate::error::Error;
use crate::graph::{NodeId, ServiceGraph};
use crate::pipe::{PipeFlags, PipeHandle, PipeId};
use crate::proto::TypeInstance;
use crate::sched::async_task::AsyncHandle;
use crate::sched::RequestId;

/// Delivery mode for [`TaskTable::input_pipe`].
///
/// A sync upstream attaches the handle and marks the input ready in one
/// step. An async upstream splits the two: the handle is attached when
/// the async task launches (stage 1), readiness arrives only after its
/// cleanup completes (stage 2), so the downstream cannot be dispatched
/// while the async task is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputStage {
    /// Attach the handle and mark ready.
    Sync,
    /// Attach the handle only.
    Attach,
    /// Mark the pre-populated slot ready.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Pending,
    Ready,
    Running,
    AsyncWaiting,
    Completed,
    Cancelled,
}

pub(crate) struct Task {
    pub(crate) request: RequestId,
    pub(crate) node: NodeId,
    pub(crate) graph: Arc<ServiceGraph>,
    pub(crate) pipes: Vec<Option<PipeHandle>>,
    pub(crate) instance: Option<TypeInstance>,
    pub(crate) ready_count: u32,
    pub(crate) cancelled_count: u32,
    pub(crate) state: TaskState,
    pub(crate) async_handle: Option<AsyncHandle>,
}

impl Task {
    fn new(request: RequestId, node: NodeId, graph: Arc<ServiceGraph>) -> Task {
        let slots = graph.node(node).slots.len();
        let mut pipes = Vec::with_capacity(slots);
        pipes.resize_with(slots, || None);
        Task {
            request,
            node,
            graph,
            pipes,
            instance: None,
            ready_count: 0,
            cancelled_count: 0,
            state: TaskState::Pending,
            async_handle: None,
        }
    }

    fn in_degree(&self) -> u32 {
        self.graph.in_degree(self.node)
    }
}

/// Outcome of one cancellation notification.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// The task still waits for other inputs.
    Pending,
    /// Partial cancellation completed the input set; the task will run.
    BecameReady,
    /// Every input is cancelled; the caller must propagate to the task's
    /// output edges and free it.
    Cancelled,
}

pub(crate) struct TaskTable {
    tasks: Slab<Task>,
    index: HashMap<(RequestId, NodeId), usize>,
    /// FIFO of `(key, request, node)`; the identity pair guards against
    /// arena keys reused after an external cancel.
    ready: VecDeque<(usize, RequestId, NodeId)>,
}

impl TaskTable {
    pub(crate) fn new() -> TaskTable {
        TaskTable {
            tasks: Slab::new(),
            index: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Find the pending task for `(request, node)`, creating it if this
    /// is the first pipe to arrive. The bool reports creation.
    pub(crate) fn pending_task(
        &mut self,
        graph: &Arc<ServiceGraph>,
        request: RequestId,
        node: NodeId,
    ) -> (usize, bool) {
        if let Some(&key) = self.index.get(&(request, node)) {
            return (key, false);
        }
        let key = self.tasks.insert(Task::new(request, node, Arc::clone(graph)));
        self.index.insert((request, node), key);
        tracing::trace!(%request, node, key, "task created");
        (key, true)
    }

    /// Record that a pipe handle arrived at `(request, node, slot)`.
    /// Returns the task key and whether a new task was created.
    pub(crate) fn input_pipe(
        &mut self,
        graph: &Arc<ServiceGraph>,
        request: RequestId,
        node: NodeId,
        slot: PipeId,
        handle: Option<PipeHandle>,
        stage: InputStage,
    ) -> crate::Result<(usize, bool)> {
        let (key, created) = self.pending_task(graph, request, node);
        if let Some(handle) = handle {
            let task = &mut self.tasks[key];
            let entry = task
                .pipes
                .get_mut(usize::from(slot))
                .ok_or_else(|| Error::new_invalid_arg("input slot out of range"))?;
            if entry.is_some() {
                return Err(Error::new_programming("input pipe delivered twice"));
            }
            *entry = Some(handle);
        }
        match stage {
            InputStage::Sync => self.pipe_ready(key)?,
            InputStage::Attach => {}
            InputStage::Ready => self.pipe_ready(key)?,
        }
        Ok((key, created))
    }

    /// Record a newly created output handle; ownership transfers to the
    /// task.
    pub(crate) fn output_pipe(
        &mut self,
        key: usize,
        slot: PipeId,
        handle: PipeHandle,
    ) -> crate::Result<()> {
        let task = self
            .tasks
            .get_mut(key)
            .ok_or_else(|| Error::new_invalid_arg("unknown task"))?;
        let entry = task
            .pipes
            .get_mut(usize::from(slot))
            .ok_or_else(|| Error::new_invalid_arg("output slot out of range"))?;
        if entry.is_some() {
            return Err(Error::new_programming("output pipe materialized twice"));
        }
        *entry = Some(handle);
        Ok(())
    }

    /// Record a shadow output: a forked read view of a sibling edge. The
    /// handle must carry `SHADOW | INPUT`; the underlying transport stays
    /// owned by the mirrored edge's real endpoints.
    pub(crate) fn output_shadow(
        &mut self,
        key: usize,
        slot: PipeId,
        handle: PipeHandle,
    ) -> crate::Result<()> {
        let flags = handle.flags();
        if !flags.is_shadow() || !flags.contains(PipeFlags::INPUT) || flags.is_output() {
            return Err(Error::new_invalid_arg(
                "shadow output must carry SHADOW | INPUT",
            ));
        }
        self.output_pipe(key, slot, handle)
    }

    /// One of the task's inputs became ready. Enqueues the task when the
    /// input set is complete.
    pub(crate) fn pipe_ready(&mut self, key: usize) -> crate::Result<()> {
        let task = self
            .tasks
            .get_mut(key)
            .ok_or_else(|| Error::new_invalid_arg("unknown task"))?;
        let indeg = task.in_degree();
        if task.ready_count + task.cancelled_count >= indeg {
            return Err(Error::new_programming("readiness counter overflow"));
        }
        task.ready_count += 1;
        if task.ready_count + task.cancelled_count == indeg {
            task.state = TaskState::Ready;
            self.ready.push_back((key, task.request, task.node));
            tracing::trace!(key, "task ready");
        }
        Ok(())
    }

    /// One of the task's inputs was cancelled. See [`CancelOutcome`] for
    /// what the caller must do next.
    pub(crate) fn input_cancelled(&mut self, key: usize) -> crate::Result<CancelOutcome> {
        let task = self
            .tasks
            .get_mut(key)
            .ok_or_else(|| Error::new_invalid_arg("unknown task"))?;
        let indeg = task.in_degree();
        if task.ready_count + task.cancelled_count >= indeg {
            return Err(Error::new_programming("cancellation counter overflow"));
        }
        task.cancelled_count += 1;
        if task.cancelled_count == indeg {
            task.state = TaskState::Cancelled;
            tracing::trace!(key, "task cancelled");
            return Ok(CancelOutcome::Cancelled);
        }
        if task.ready_count + task.cancelled_count == indeg {
            task.state = TaskState::Ready;
            self.ready.push_back((key, task.request, task.node));
            return Ok(CancelOutcome::BecameReady);
        }
        Ok(CancelOutcome::Pending)
    }

    /// Pop the next ready task, marking it running.
    pub(crate) fn next_ready_task(&mut self) -> Option<usize> {
        while let Some((key, request, node)) = self.ready.pop_front() {
            if let Some(task) = self.tasks.get_mut(key) {
                if task.state == TaskState::Ready && task.request == request && task.node == node {
                    task.state = TaskState::Running;
                    return Some(key);
                }
            }
        }
        None
    }

    pub(crate) fn get(&self, key: usize) -> Option<&Task> {
        self.tasks.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: usize) -> Option<&mut Task> {
        self.tasks.get_mut(key)
    }

    /// Dispose a task.
    pub(crate) fn free(&mut self, key: usize) -> crate::Result<Task> {
        if !self.tasks.contains(key) {
            return Err(Error::new_invalid_arg("free of unknown task"));
        }
        let task = self.tasks.remove(key);
        self.index.remove(&(task.request, task.node));
        tracing::trace!(request = %task.request, node = task.node, "task freed");
        Ok(task)
    }

    /// The pending-task key for `(request, node)`, if one exists.
    pub(crate) fn lookup(&self, request: RequestId, node: NodeId) -> Option<usize> {
        self.index.get(&(request, node)).copied()
    }

    /// Whether any task of the request is still held.
    pub(crate) fn request_live(&self, request: RequestId) -> bool {
        self.tasks.iter().any(|(_, t)| t.request == request)
    }

    /// Keys of every task belonging to the request.
    pub(crate) fn request_tasks(&self, request: RequestId) -> Vec<usize> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.request == request)
            .map(|(k, _)| k)
            .collect()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ServiceGraph;
    use crate::pipe::mem::MemModule;
    use crate::pipe::module::NullPort;
    use crate::pipe::{ModuleRegistry, PipeFlags, PipeHandle};
    use crate::proto::Schema;
    use crate::servlet::{Servlet, ServletInit, ServletMode};

    struct TwoOut;

    impl Servlet for TwoOut {
        fn init(
            &mut self,
            _args: &[&str],
            env: &mut ServletInit<'_>,
        ) -> crate::Result<ServletMode> {
            env.define("in", PipeFlags::INPUT, None)?;
            env.define("left", PipeFlags::OUTPUT, None)?;
            env.define("right", PipeFlags::OUTPUT, None)?;
            Ok(ServletMode::Sync)
        }
    }

    struct TwoIn;

    impl Servlet for TwoIn {
        fn init(
            &mut self,
            _args: &[&str],
            env: &mut ServletInit<'_>,
        ) -> crate::Result<ServletMode> {
            env.define("a", PipeFlags::INPUT, None)?;
            env.define("b", PipeFlags::INPUT, None)?;
            env.define("out", PipeFlags::OUTPUT, None)?;
            Ok(ServletMode::Sync)
        }
    }

    /// A two-node graph whose second node has in-degree 2.
    fn join_graph() -> Arc<ServiceGraph> {
        let mut registry = ModuleRegistry::new();
        registry
            .register("pipe.mem.test", Arc::new(MemModule::new()))
            .unwrap();
        let mut builder =
            ServiceGraph::builder(Arc::new(Schema::new()), Arc::new(registry));
        let head = builder.node(Box::new(TwoOut), &[]);
        let join = builder.node(Box::new(TwoIn), &[]);
        builder.edge(head, "left", join, "a");
        builder.edge(head, "right", join, "b");
        builder.input(head, "in").output(join, "out");
        builder.build().unwrap()
    }

    fn null_input() -> PipeHandle {
        PipeHandle::new(Box::new(NullPort), PipeFlags::INPUT, 0)
    }

    const JOIN: NodeId = 1;

    #[test]
    fn ready_needs_the_whole_input_set() {
        let graph = join_graph();
        let mut table = TaskTable::new();
        let request = RequestId(1);

        let (key, created) = table
            .input_pipe(&graph, request, JOIN, 0, Some(null_input()), InputStage::Sync)
            .unwrap();
        assert!(created);
        assert_eq!(table.ready_len(), 0, "1 of 2 inputs is not enough");

        let (same, created) = table
            .input_pipe(&graph, request, JOIN, 1, Some(null_input()), InputStage::Sync)
            .unwrap();
        assert!(!created);
        assert_eq!(same, key);
        assert_eq!(table.ready_len(), 1);
        assert_eq!(table.next_ready_task(), Some(key));
    }

    #[test]
    fn attach_stage_defers_readiness() {
        let graph = join_graph();
        let mut table = TaskTable::new();
        let request = RequestId(2);

        table
            .input_pipe(&graph, request, JOIN, 0, Some(null_input()), InputStage::Attach)
            .unwrap();
        table
            .input_pipe(&graph, request, JOIN, 1, Some(null_input()), InputStage::Attach)
            .unwrap();
        assert_eq!(table.ready_len(), 0, "attached but not ready");

        // stage 2 flips the pre-populated slots to ready
        let (key, _) = table
            .input_pipe(&graph, request, JOIN, 0, None, InputStage::Ready)
            .unwrap();
        table
            .input_pipe(&graph, request, JOIN, 1, None, InputStage::Ready)
            .unwrap();
        assert_eq!(table.next_ready_task(), Some(key));
    }

    #[test]
    fn ready_queue_is_fifo_across_requests() {
        let graph = join_graph();
        let mut table = TaskTable::new();

        let mut keys = Vec::new();
        for raw in 0..3u64 {
            let request = RequestId(raw);
            table
                .input_pipe(&graph, request, JOIN, 0, Some(null_input()), InputStage::Sync)
                .unwrap();
            let (key, _) = table
                .input_pipe(&graph, request, JOIN, 1, Some(null_input()), InputStage::Sync)
                .unwrap();
            keys.push(key);
        }
        for expected in keys {
            assert_eq!(table.next_ready_task(), Some(expected));
        }
        assert_eq!(table.next_ready_task(), None);
    }

    #[test]
    fn partial_cancellation_still_runs_the_task() {
        let graph = join_graph();
        let mut table = TaskTable::new();
        let request = RequestId(3);

        let (key, _) = table.pending_task(&graph, request, JOIN);
        assert_eq!(table.input_cancelled(key).unwrap(), CancelOutcome::Pending);
        assert_eq!(
            table.input_cancelled(key).unwrap(),
            CancelOutcome::Cancelled,
            "all inputs cancelled"
        );

        let request = RequestId(4);
        let (key, _) = table.pending_task(&graph, request, JOIN);
        assert_eq!(table.input_cancelled(key).unwrap(), CancelOutcome::Pending);
        table
            .input_pipe(&graph, request, JOIN, 0, Some(null_input()), InputStage::Sync)
            .unwrap();
        assert_eq!(
            table.get(key).unwrap().state,
            TaskState::Ready,
            "ready + cancelled reached the in-degree"
        );
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "programming error")]
    fn counter_overflow_is_detected() {
        let graph = join_graph();
        let mut table = TaskTable::new();
        let request = RequestId(5);

        let (key, _) = table.pending_task(&graph, request, JOIN);
        table.pipe_ready(key).unwrap();
        table.pipe_ready(key).unwrap();
        let _ = table.pipe_ready(key);
    }

    #[test]
    fn free_releases_the_index_entry() {
        let graph = join_graph();
        let mut table = TaskTable::new();
        let request = RequestId(6);

        let (key, _) = table.pending_task(&graph, request, JOIN);
        assert_eq!(table.lookup(request, JOIN), Some(key));
        assert!(table.request_live(request));

        table.free(key).unwrap();
        assert_eq!(table.lookup(request, JOIN), None);
        assert!(!table.request_live(request));
        assert!(table.is_empty());
    }
}
