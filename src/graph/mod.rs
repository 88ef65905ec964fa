//! The service graph.
//!
//! A graph wires servlet instances into a DAG of typed edges. The
//! [`Builder`] runs every servlet's `init`, checks the wiring, infers the
//! concrete type of each edge (downstream slots may inherit the upstream
//! type, `$name` expressions take the type of a sibling input slot), and
//! resolves every type-model declaration against the schema. Any failure
//! aborts startup; a built graph is immutable and shared behind an `Arc`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::pipe::{ModuleRegistry, PipeId, TransportModule};
use crate::proto::{Schema, TypeModel};
use crate::servlet::{Servlet, ServletInit, ServletMode, SlotDef};

/// Identifies a node of the service graph.
pub type NodeId = usize;

pub(crate) type EdgeId = usize;

pub(crate) struct Node {
    pub(crate) servlet: Mutex<Box<dyn Servlet>>,
    pub(crate) mode: ServletMode,
    pub(crate) async_buf_size: usize,
    pub(crate) model: TypeModel,
    pub(crate) slots: Vec<SlotDef>,
    /// Per-slot outgoing edge, if the slot is wired.
    pub(crate) out_edges: Vec<Option<EdgeId>>,
    pub(crate) in_degree: u32,
}

pub(crate) struct Edge {
    pub(crate) src: (NodeId, PipeId),
    pub(crate) dst: (NodeId, PipeId),
    /// Typed-header size on the wire: the source type's full size.
    pub(crate) hdr_size: usize,
}

/// An immutable, runnable service graph.
pub struct ServiceGraph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) input: (NodeId, PipeId),
    pub(crate) output: (NodeId, PipeId),
    pub(crate) registry: Arc<ModuleRegistry>,
    pub(crate) transport: Arc<dyn TransportModule>,
    pub(crate) transport_id: u8,
    pub(crate) transport_path: Arc<str>,
}

impl ServiceGraph {
    /// Start building a graph against the given schema and module
    /// registry.
    pub fn builder(schema: Arc<Schema>, registry: Arc<ModuleRegistry>) -> Builder {
        Builder {
            schema,
            registry,
            transport: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            input: None,
            output: None,
            shadow_overrides: Vec::new(),
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub(crate) fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id]
    }

    /// The node and slot a new request's external input attaches to.
    pub fn input(&self) -> (NodeId, PipeId) {
        self.input
    }

    /// The node and slot the external output handle attaches to.
    pub fn output(&self) -> (NodeId, PipeId) {
        self.output
    }

    /// The typed-header size the external input handle must declare.
    pub fn input_hdr_size(&self) -> usize {
        let (node, slot) = self.input;
        self.slot_hdr_size(node, slot)
    }

    /// The typed-header size the external output handle must declare.
    pub fn output_hdr_size(&self) -> usize {
        let (node, slot) = self.output;
        self.slot_hdr_size(node, slot)
    }

    fn slot_hdr_size(&self, node: NodeId, slot: PipeId) -> usize {
        let typed = self.nodes[node]
            .slots
            .get(usize::from(slot))
            .map_or(false, |s| s.concrete.is_some());
        if !typed {
            return 0;
        }
        self.nodes[node]
            .model
            .slot(slot)
            .map(|i| i.full_size as usize)
            .unwrap_or(0)
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn in_degree(&self, node: NodeId) -> u32 {
        self.nodes[node].in_degree
    }
}

impl Drop for ServiceGraph {
    fn drop(&mut self) {
        for (id, node) in self.nodes.iter().enumerate() {
            if let Err(err) = node.servlet.lock().unload() {
                tracing::error!(node = id, error = %err, "servlet unload failed");
            }
        }
    }
}

impl fmt::Debug for ServiceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceGraph")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

struct NodeBuild {
    servlet: Box<dyn Servlet>,
    args: Vec<String>,
}

struct EdgeBuild {
    src: NodeId,
    src_slot: String,
    dst: NodeId,
    dst_slot: String,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("graph::Builder")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

/// Builds and validates a [`ServiceGraph`].
pub struct Builder {
    schema: Arc<Schema>,
    registry: Arc<ModuleRegistry>,
    transport: Option<u8>,
    nodes: Vec<NodeBuild>,
    edges: Vec<EdgeBuild>,
    input: Option<(NodeId, String)>,
    output: Option<(NodeId, String)>,
    shadow_overrides: Vec<(NodeId, String, bool)>,
}

impl Builder {
    /// Add a servlet instance as a graph node.
    pub fn node(&mut self, servlet: Box<dyn Servlet>, args: &[&str]) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(NodeBuild {
            servlet,
            args: args.iter().map(|s| (*s).to_owned()).collect(),
        });
        id
    }

    /// Wire an edge from an output slot to an input slot, by slot name.
    pub fn edge(&mut self, src: NodeId, src_slot: &str, dst: NodeId, dst_slot: &str) -> &mut Builder {
        self.edges.push(EdgeBuild {
            src,
            src_slot: src_slot.to_owned(),
            dst,
            dst_slot: dst_slot.to_owned(),
        });
        self
    }

    /// Mark the slot new requests' external input attaches to.
    pub fn input(&mut self, node: NodeId, slot: &str) -> &mut Builder {
        self.input = Some((node, slot.to_owned()));
        self
    }

    /// Mark the slot the external output handle attaches to.
    pub fn output(&mut self, node: NodeId, slot: &str) -> &mut Builder {
        self.output = Some((node, slot.to_owned()));
        self
    }

    /// Pick the transport module instance used for internal edges.
    /// Defaults to the first registered instance.
    pub fn transport(&mut self, path: &str) -> crate::Result<&mut Builder> {
        self.transport = Some(self.registry.mod_open(path)?);
        Ok(self)
    }

    /// Whether a still-disabled shadow slot cancels its downstream at
    /// task completion (the default) or delivers an empty pipe instead.
    pub fn shadow_propagate_disabled(
        &mut self,
        node: NodeId,
        slot: &str,
        propagate: bool,
    ) -> &mut Builder {
        self.shadow_overrides.push((node, slot.to_owned(), propagate));
        self
    }

    /// Run every servlet's `init`, validate the wiring, infer edge types,
    /// and resolve all type-model declarations.
    pub fn build(self) -> crate::Result<Arc<ServiceGraph>> {
        let Builder {
            schema,
            registry,
            transport,
            nodes: node_builds,
            edges: edge_builds,
            input,
            output,
            shadow_overrides,
        } = self;

        let transport_id = match transport {
            Some(id) => id,
            None => registry
                .get(0)
                .map(|_| 0)
                .ok_or_else(|| Error::new_graph("no transport module registered"))?,
        };
        let transport = Arc::clone(
            registry
                .get(transport_id)
                .ok_or_else(|| Error::new_graph("unknown transport module"))?,
        );
        let transport_path: Arc<str> =
            Arc::from(registry.path(transport_id).unwrap_or(""));

        // run every servlet's init, collecting slot tables and models
        let mut nodes = Vec::with_capacity(node_builds.len());
        for (id, mut build) in node_builds.into_iter().enumerate() {
            let mut slots = Vec::new();
            let mut model = TypeModel::new();
            let mode = {
                let mut env = ServletInit {
                    slots: &mut slots,
                    model: &mut model,
                    registry: &registry,
                };
                let args: Vec<&str> = build.args.iter().map(String::as_str).collect();
                build.servlet.init(&args, &mut env).map_err(|err| {
                    tracing::error!(node = id, error = %err, "servlet init failed");
                    err
                })?
            };
            let async_buf_size = build.servlet.async_buf_size();
            let out_edges = vec![None; slots.len()];
            nodes.push(Node {
                servlet: Mutex::new(build.servlet),
                mode,
                async_buf_size,
                model,
                slots,
                out_edges,
                in_degree: 0,
            });
        }

        for (node, slot, propagate) in shadow_overrides {
            let slot = find_slot(&nodes, node, &slot)?;
            if !nodes[node].slots[usize::from(slot)].flags.is_shadow() {
                return Err(Error::new_graph("propagate override on a non-shadow slot"));
            }
            nodes[node].slots[usize::from(slot)].propagate_disabled = propagate;
        }

        // resolve the external endpoints
        let (in_node, in_slot_name) =
            input.ok_or_else(|| Error::new_graph("no input node designated"))?;
        let in_slot = find_slot(&nodes, in_node, &in_slot_name)?;
        if !nodes[in_node].slots[usize::from(in_slot)].flags.is_input() {
            return Err(Error::new_graph("graph input must be an input slot"));
        }
        let (out_node, out_slot_name) =
            output.ok_or_else(|| Error::new_graph("no output node designated"))?;
        let out_slot = find_slot(&nodes, out_node, &out_slot_name)?;
        let out_flags = nodes[out_node].slots[usize::from(out_slot)].flags;
        if !out_flags.is_output() || out_flags.is_shadow() {
            return Err(Error::new_graph(
                "graph output must be a non-shadow output slot",
            ));
        }

        // wire the edges
        let mut edges: Vec<Edge> = Vec::with_capacity(edge_builds.len());
        let mut dst_wired = vec![Vec::new(); nodes.len()];
        for build in edge_builds {
            let src_slot = find_slot(&nodes, build.src, &build.src_slot)?;
            let dst_slot = find_slot(&nodes, build.dst, &build.dst_slot)?;
            let src_def = &nodes[build.src].slots[usize::from(src_slot)];
            let dst_def = &nodes[build.dst].slots[usize::from(dst_slot)];
            if !src_def.flags.is_output() {
                return Err(Error::new_graph("edge source must be an output slot"));
            }
            if !dst_def.flags.is_input() || dst_def.flags.is_shadow() {
                return Err(Error::new_graph("edge destination must be an input slot"));
            }
            if (build.dst, dst_slot) == (in_node, in_slot) {
                return Err(Error::new_graph("edge into the external input slot"));
            }
            if (build.src, src_slot) == (out_node, out_slot) {
                return Err(Error::new_graph("edge out of the external output slot"));
            }
            if nodes[build.src].out_edges[usize::from(src_slot)].is_some() {
                return Err(Error::new_graph("output slot wired twice"));
            }
            if dst_wired[build.dst].contains(&dst_slot) {
                return Err(Error::new_graph("input slot wired twice"));
            }
            let id = edges.len();
            nodes[build.src].out_edges[usize::from(src_slot)] = Some(id);
            dst_wired[build.dst].push(dst_slot);
            nodes[build.dst].in_degree += 1;
            edges.push(Edge {
                src: (build.src, src_slot),
                dst: (build.dst, dst_slot),
                hdr_size: 0,
            });
        }
        nodes[in_node].in_degree += 1;

        let order = topo_order(&nodes, &edges)?;
        check_reachable(&nodes, &edges, in_node)?;

        // infer concrete types along the topological order and resolve
        // every wired, typed slot
        let mut edge_types: Vec<Option<String>> = vec![None; edges.len()];
        let mut in_types: Vec<Vec<Option<String>>> = nodes
            .iter()
            .map(|n| vec![None; n.slots.len()])
            .collect();
        for &node_id in &order {
            // inputs first: either inherited from upstream or declared
            for slot in 0..nodes[node_id].slots.len() as u16 {
                let incoming: Option<&str> = edges
                    .iter()
                    .position(|e| e.dst == (node_id, slot))
                    .and_then(|e| edge_types[e].as_deref());
                let def = &nodes[node_id].slots[usize::from(slot)];
                if !def.flags.is_input() {
                    continue;
                }
                let external = (node_id, slot) == (in_node, in_slot);
                let wired = external || edges.iter().any(|e| e.dst == (node_id, slot));
                if !wired {
                    continue;
                }
                let concrete = match (def.type_expr.as_deref(), incoming) {
                    (Some(declared), Some(upstream)) => {
                        if !schema.is_subtype(upstream, declared) {
                            return Err(Error::new_type_system(format!(
                                "edge type {} is not a subtype of declared {}",
                                upstream, declared
                            )));
                        }
                        Some(declared.to_owned())
                    }
                    (Some(declared), None) => Some(declared.to_owned()),
                    (None, Some(upstream)) => Some(upstream.to_owned()),
                    (None, None) => None,
                };
                in_types[node_id][usize::from(slot)] = concrete;
            }
            // then outputs, which may reference the inputs via `$name`
            for slot in 0..nodes[node_id].slots.len() as u16 {
                let def = &nodes[node_id].slots[usize::from(slot)];
                if !def.flags.is_output() {
                    continue;
                }
                let concrete = if let Some(target) = def
                    .flags
                    .is_shadow()
                    .then(|| def.flags.target())
                {
                    slot_concrete(&nodes, &in_types, node_id, target)
                } else {
                    match def.type_expr.as_deref() {
                        Some(expr) if expr.starts_with('$') => {
                            let name = &expr[1..];
                            let referenced = find_slot(&nodes, node_id, name)?;
                            slot_concrete(&nodes, &in_types, node_id, referenced)
                        }
                        Some(expr) => Some(expr.to_owned()),
                        None => None,
                    }
                };
                if let Some(edge) = nodes[node_id].out_edges[usize::from(slot)] {
                    edge_types[edge] = concrete.clone();
                }
                if let Some(concrete) = concrete {
                    set_concrete(&mut nodes[node_id], slot, &concrete, &schema)?;
                }
            }
            // record and resolve the wired input types
            for slot in 0..nodes[node_id].slots.len() as u16 {
                if let Some(concrete) = in_types[node_id][usize::from(slot)].clone() {
                    set_concrete(&mut nodes[node_id], slot, &concrete, &schema)?;
                }
            }
        }

        // edge header sizes follow the source type
        for (id, edge) in edges.iter_mut().enumerate() {
            if let Some(ref concrete) = edge_types[id] {
                edge.hdr_size = schema.type_size(concrete)? as usize;
            }
        }

        tracing::debug!(
            nodes = nodes.len(),
            edges = edges.len(),
            "service graph built"
        );
        Ok(Arc::new(ServiceGraph {
            nodes,
            edges,
            input: (in_node, in_slot),
            output: (out_node, out_slot),
            registry,
            transport,
            transport_id,
            transport_path,
        }))
    }
}

fn find_slot(nodes: &[Node], node: NodeId, name: &str) -> crate::Result<PipeId> {
    let node_ref = nodes
        .get(node)
        .ok_or_else(|| Error::new_graph("unknown node id"))?;
    node_ref
        .slots
        .iter()
        .position(|s| s.name == name)
        .map(|p| p as PipeId)
        .ok_or_else(|| Error::new_graph(format!("node has no slot named {}", name)))
}

fn slot_concrete(
    nodes: &[Node],
    in_types: &[Vec<Option<String>>],
    node: NodeId,
    slot: PipeId,
) -> Option<String> {
    nodes[node]
        .slots
        .get(usize::from(slot))
        .and_then(|def| {
            def.concrete
                .clone()
                .or_else(|| in_types[node][usize::from(slot)].clone())
        })
}

fn set_concrete(
    node: &mut Node,
    slot: PipeId,
    concrete: &str,
    schema: &Schema,
) -> crate::Result<()> {
    let def = &mut node.slots[usize::from(slot)];
    if def.concrete.as_deref() == Some(concrete) {
        return Ok(());
    }
    def.concrete = Some(concrete.to_owned());
    node.model.resolve(slot, concrete, schema)
}

fn topo_order(nodes: &[Node], edges: &[Edge]) -> crate::Result<Vec<NodeId>> {
    let mut indeg = vec![0u32; nodes.len()];
    for edge in edges {
        indeg[edge.dst.0] += 1;
    }
    let mut queue: VecDeque<NodeId> = indeg
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = queue.pop_front() {
        order.push(node);
        for edge in edges.iter().filter(|e| e.src.0 == node) {
            indeg[edge.dst.0] -= 1;
            if indeg[edge.dst.0] == 0 {
                queue.push_back(edge.dst.0);
            }
        }
    }
    if order.len() != nodes.len() {
        return Err(Error::new_graph("service graph contains a cycle"));
    }
    Ok(order)
}

fn check_reachable(nodes: &[Node], edges: &[Edge], input: NodeId) -> crate::Result<()> {
    let mut seen = vec![false; nodes.len()];
    let mut queue = VecDeque::new();
    seen[input] = true;
    queue.push_back(input);
    while let Some(node) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.src.0 == node) {
            if !seen[edge.dst.0] {
                seen[edge.dst.0] = true;
                queue.push_back(edge.dst.0);
            }
        }
    }
    if let Some(node) = seen.iter().position(|&s| !s) {
        return Err(Error::new_graph(format!(
            "node {} is unreachable from the input node",
            node
        )));
    }
    Ok(())
}
