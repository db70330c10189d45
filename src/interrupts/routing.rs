//! Routing graph construction.
//!
//! The topology graph relates whole domains; the routing graph explodes
//! them into one node per line. A node is a (domain, index) pair — the
//! index of an emitter for a pure emitter ("device node"), the index of
//! a receiver otherwise ("input node"). Routing is a function, so every
//! node has at most one outgoing edge, and edges must satisfy connector
//! reachability, trigger-type compatibility, exclusive ownership, and
//! the source domain's own routing rule.

use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::fmt;

use ahash::RandomState;
use hashbrown::HashMap;
use thiserror::Error;

use super::domain::{DomainRef, RoutingRule};
use super::topology::TopologySnapshot;

/// Trigger discipline of a routing node, propagated along paths.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriggerType {
	Edge,
	Level,
	Undetermined,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeType {
	/// Pure emitter; the index names one of its output lines.
	Device,
	/// Receiver-bearing domain; the index names one of its input lines.
	Input,
}

/// A (domain, line-index) pair naming one routing node.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RoutingNode {
	pub domain: DomainRef,
	pub index: usize,
}

impl RoutingNode {
	pub fn new(domain: DomainRef, index: usize) -> Self {
		Self { domain, index }
	}
}

impl fmt::Debug for RoutingNode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.domain.name(), self.index)
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RoutingVertexId(u32);

impl RoutingVertexId {
	pub fn index(self) -> usize {
		self.0 as usize
	}
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum RoutingError {
	#[error("edge violates a routing constraint")]
	EdgeNotAllowed,
	#[error("unknown routing node")]
	UnknownNode,
}

struct NodeState {
	label: RoutingNode,
	node_type: NodeType,
	trigger: Cell<TriggerType>,
	owner: RefCell<Option<DomainRef>>,
	out_edge: Cell<Option<RoutingVertexId>>,
}

/// Incrementally assembled routing graph, constrained on every edge.
pub struct RoutingGraphBuilder {
	snapshot: TopologySnapshot,
	nodes: Vec<NodeState>,
	by_label: HashMap<RoutingNode, RoutingVertexId, RandomState>,
}

impl RoutingGraphBuilder {
	/// Explode the topology into routing nodes, seed trigger types from
	/// configurable-activation domains and owners from exclusive
	/// connectors, and pre-install the forced edges of fixed routing
	/// domains and pure emitters.
	pub fn new(snapshot: TopologySnapshot) -> Self {
		let mut nodes = Vec::new();
		let mut by_label: HashMap<RoutingNode, RoutingVertexId, RandomState> =
			HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0));

		let graph = snapshot.graph.clone();
		for vertex in graph.vertices() {
			let domain = graph.vertex(vertex).clone();
			if let Some(receiver) = domain.as_receiver() {
				let config = domain.as_activation_config();
				for index in 0..receiver.receiver_count() {
					let trigger = match config.and_then(|c| c.activation_type(index)) {
						Some(activation) if activation.is_level_triggered() => TriggerType::Level,
						Some(_) => TriggerType::Edge,
						None => TriggerType::Undetermined,
					};
					let owner = snapshot
						.exclusive_owner(&domain, index)
						.map(|connector| connector.source());
					let label = RoutingNode::new(domain.clone(), index);
					let id = RoutingVertexId(nodes.len() as u32);
					by_label.insert(label.clone(), id);
					nodes.push(NodeState {
						label,
						node_type: NodeType::Input,
						trigger: Cell::new(trigger),
						owner: RefCell::new(owner),
						out_edge: Cell::new(None),
					});
				}
			} else if let Some(emitter) = domain.as_emitter() {
				// Pure emitters have no configurable trigger of their
				// own; they inherit one from the path they end up on.
				for index in 0..emitter.emitter_count() {
					let label = RoutingNode::new(domain.clone(), index);
					let id = RoutingVertexId(nodes.len() as u32);
					by_label.insert(label.clone(), id);
					nodes.push(NodeState {
						label,
						node_type: NodeType::Device,
						trigger: Cell::new(TriggerType::Undetermined),
						owner: RefCell::new(None),
						out_edge: Cell::new(None),
					});
				}
			} else {
				unreachable!("domain is neither receiver nor emitter");
			}
		}

		let mut builder = Self {
			snapshot,
			nodes,
			by_label,
		};
		builder.install_forced_edges();
		builder
	}

	fn install_forced_edges(&mut self) {
		let graph = self.snapshot.graph.clone();
		for vertex in graph.vertices() {
			let domain = graph.vertex(vertex).clone();

			let fixed_emitter_for = |receiver_index: usize| -> Option<usize> {
				let routable = domain.as_routable()?;
				match routable.routing_rule() {
					RoutingRule::Fixed(fixed) => Some(fixed.emitter_for(receiver_index)),
					_ => None,
				}
			};

			let is_fixed = domain
				.as_routable()
				.is_some_and(|r| matches!(r.routing_rule(), RoutingRule::Fixed(_)));
			let is_device = domain.as_receiver().is_none();

			if !is_fixed && !is_device {
				continue;
			}

			let line_count = if is_device {
				domain.as_emitter().unwrap().emitter_count()
			} else {
				domain.as_receiver().unwrap().receiver_count()
			};

			for topo_edge in graph.out_edges(vertex) {
				let connector = graph.edge(*topo_edge).clone();
				let target_domain = graph.vertex(graph.target(*topo_edge)).clone();
				for source_index in 0..line_count {
					let emitter_index = if is_device {
						source_index
					} else {
						match fixed_emitter_for(source_index) {
							Some(e) => e,
							None => continue,
						}
					};
					let Some(target_index) = connector.from_output(emitter_index) else {
						continue;
					};
					let source = self
						.vertex_by_label(&RoutingNode::new(domain.clone(), source_index))
						.expect("routing node for every line");
					let target = self
						.vertex_by_label(&RoutingNode::new(target_domain.clone(), target_index))
						.expect("routing node for every line");
					// Forced edges can collide when several connectors
					// reach the same emitter; first one wins, exactly as
					// an explicit add would resolve it.
					let _ = self.add_edge(source, target);
				}
			}
		}
	}

	pub fn snapshot(&self) -> &TopologySnapshot {
		&self.snapshot
	}

	pub fn node_count(&self) -> usize {
		self.nodes.len()
	}

	pub fn vertices(&self) -> impl Iterator<Item = RoutingVertexId> + '_ {
		(0..self.nodes.len() as u32).map(RoutingVertexId)
	}

	pub fn vertex_by_label(&self, label: &RoutingNode) -> Option<RoutingVertexId> {
		self.by_label.get(label).copied()
	}

	pub fn label(&self, vertex: RoutingVertexId) -> &RoutingNode {
		&self.nodes[vertex.index()].label
	}

	pub fn node_type(&self, vertex: RoutingVertexId) -> NodeType {
		self.nodes[vertex.index()].node_type
	}

	pub fn trigger(&self, vertex: RoutingVertexId) -> TriggerType {
		self.nodes[vertex.index()].trigger.get()
	}

	pub fn out_edge(&self, vertex: RoutingVertexId) -> Option<RoutingVertexId> {
		self.nodes[vertex.index()].out_edge.get()
	}

	pub fn has_edge(&self, source: RoutingVertexId, target: RoutingVertexId) -> bool {
		self.out_edge(source) == Some(target)
	}

	pub fn edges(&self) -> impl Iterator<Item = (RoutingVertexId, RoutingVertexId)> + '_ {
		self.vertices()
			.filter_map(|v| self.out_edge(v).map(|t| (v, t)))
	}

	/// Trigger type of the chain this node feeds into, resolved by
	/// walking downstream until a determined node is found. The result
	/// is cached on the queried node.
	pub fn component_trigger(&self, vertex: RoutingVertexId) -> TriggerType {
		let original = vertex;
		let mut current = vertex;
		let mut trigger = self.trigger(current);
		while trigger == TriggerType::Undetermined {
			let Some(next) = self.out_edge(current) else {
				break;
			};
			current = next;
			trigger = self.trigger(current);
		}
		self.nodes[original.index()].trigger.set(trigger);
		trigger
	}

	fn set_component_trigger(&self, vertex: RoutingVertexId, trigger: TriggerType) {
		let mut current = vertex;
		loop {
			self.nodes[current.index()].trigger.set(trigger);
			match self.out_edge(current) {
				Some(next) => current = next,
				None => break,
			}
		}
	}

	/// Owner this node inherits from exclusive connectors downstream of
	/// it (or set on it directly). A path below an exclusively claimed
	/// input may only be fed by the claiming domain.
	pub fn effective_owner(&self, vertex: RoutingVertexId) -> Option<DomainRef> {
		let state = &self.nodes[vertex.index()];
		if let Some(owner) = state.owner.borrow().clone() {
			return Some(owner);
		}
		let next = state.out_edge.get()?;
		let child_owner = self.effective_owner(next)?;
		if child_owner == state.label.domain {
			// The ownership constraint is already satisfied by this
			// domain sitting on the path; it does not propagate above.
			return None;
		}
		*state.owner.borrow_mut() = Some(child_owner.clone());
		Some(child_owner)
	}

	fn is_edge_allowed_impl(
		&self,
		source: RoutingVertexId,
		target: RoutingVertexId,
		check_trigger: bool,
	) -> bool {
		if let Some(existing) = self.out_edge(source) {
			// Out-degree is at most one; only re-asserting the same
			// edge is accepted.
			return existing == target;
		}

		let source_label = self.label(source).clone();
		let target_label = self.label(target).clone();
		let source_domain = source_label.domain.clone();

		if check_trigger {
			let source_trigger = self.component_trigger(source);
			let target_trigger = self.component_trigger(target);
			match target_trigger {
				TriggerType::Level => {
					// A device with no inherent trigger type may attach
					// under a level-triggered path; it then inherits
					// level. Anything else must already be level.
					if source_trigger != TriggerType::Level
						&& source_domain.as_receiver().is_some()
					{
						return false;
					}
				}
				TriggerType::Edge => {
					if source_trigger == TriggerType::Level {
						return false;
					}
				}
				TriggerType::Undetermined => {}
			}
		}

		let Some(source_vertex) = self.snapshot.vertex_of(&source_domain) else {
			return false;
		};
		let Some(target_vertex) = self.snapshot.vertex_of(&target_label.domain) else {
			return false;
		};
		let Some(topo_edge) = self.snapshot.graph.find_edge(source_vertex, target_vertex) else {
			return false;
		};
		let connector = self.snapshot.graph.edge(topo_edge);

		let Some(emitter_index) = connector.from_input(target_label.index) else {
			return false;
		};
		let Some(emitter) = source_domain.as_emitter() else {
			return false;
		};
		assert!(
			emitter_index < emitter.emitter_count(),
			"connector produced an out-of-range emitter index"
		);

		if self.node_type(source) == NodeType::Device {
			return connector.from_output(source_label.index) == Some(target_label.index);
		}

		let Some(routable) = source_domain.as_routable() else {
			unimplemented!("interrupt domain is both receiver and emitter, but not routable");
		};
		if let Some(owner) = self.effective_owner(target) {
			if owner != source_domain {
				return false;
			}
		}
		match routable.routing_rule() {
			RoutingRule::Free => true,
			RoutingRule::ContextIndependent(rule) => {
				rule.is_routing_allowed(source_label.index, emitter_index)
			}
			RoutingRule::ContextDependent(rule) => {
				rule.is_routing_allowed(source_label.index, emitter_index, self)
			}
			RoutingRule::Fixed(rule) => {
				connector.from_output(rule.emitter_for(source_label.index))
					== Some(target_label.index)
			}
		}
	}

	/// Legality oracle for a prospective edge.
	pub fn is_edge_allowed(&self, source: RoutingVertexId, target: RoutingVertexId) -> bool {
		self.is_edge_allowed_impl(source, target, true)
	}

	/// Like [`is_edge_allowed`](Self::is_edge_allowed), but skips
	/// trigger-type compatibility and never accepts an existing edge.
	pub fn is_edge_allowed_ignoring_trigger_type(
		&self,
		source: RoutingVertexId,
		target: RoutingVertexId,
	) -> bool {
		if self.has_edge(source, target) {
			return false;
		}
		self.is_edge_allowed_impl(source, target, false)
	}

	/// All targets this node could legally route to right now.
	pub fn valid_edges_from(&self, source: RoutingVertexId) -> Vec<RoutingVertexId> {
		let mut candidates = Vec::new();
		let source_domain = self.label(source).domain.clone();
		let Some(source_vertex) = self.snapshot.vertex_of(&source_domain) else {
			return candidates;
		};
		let graph = self.snapshot.graph.clone();
		for topo_edge in graph.out_edges(source_vertex) {
			let target_domain = graph.vertex(graph.target(*topo_edge)).clone();
			let receiver_count = target_domain
				.as_receiver()
				.expect("connector target must be a receiver")
				.receiver_count();
			for index in 0..receiver_count {
				let Some(target) =
					self.vertex_by_label(&RoutingNode::new(target_domain.clone(), index))
				else {
					continue;
				};
				if self.is_edge_allowed(source, target) {
					candidates.push(target);
				}
			}
		}
		candidates
	}

	/// All sources that could legally route to this node right now.
	pub fn valid_edges_to(&self, target: RoutingVertexId) -> Vec<RoutingVertexId> {
		let mut candidates = Vec::new();
		let target_domain = self.label(target).domain.clone();
		let Some(target_vertex) = self.snapshot.vertex_of(&target_domain) else {
			return candidates;
		};
		let graph = self.snapshot.graph.clone();
		for topo_edge in graph.in_edges(target_vertex) {
			let source_domain = graph.vertex(graph.source(*topo_edge)).clone();
			let line_count = match source_domain.as_receiver() {
				Some(receiver) => receiver.receiver_count(),
				None => source_domain
					.as_emitter()
					.expect("connector source must be an emitter")
					.emitter_count(),
			};
			for index in 0..line_count {
				let Some(source) =
					self.vertex_by_label(&RoutingNode::new(source_domain.clone(), index))
				else {
					continue;
				};
				if self.is_edge_allowed(source, target) {
					candidates.push(source);
				}
			}
		}
		candidates
	}

	/// Install an edge, propagating a determined source trigger type
	/// down an undetermined target chain.
	pub fn add_edge(
		&mut self,
		source: RoutingVertexId,
		target: RoutingVertexId,
	) -> Result<(), RoutingError> {
		if !self.is_edge_allowed(source, target) {
			return Err(RoutingError::EdgeNotAllowed);
		}
		if self.has_edge(source, target) {
			return Ok(());
		}

		let source_trigger = self.trigger(source);
		let target_trigger = self.component_trigger(target);
		self.nodes[source.index()].out_edge.set(Some(target));
		if target_trigger == TriggerType::Undetermined && source_trigger != TriggerType::Undetermined
		{
			self.set_component_trigger(target, source_trigger);
		}
		Ok(())
	}

	/// Finalize: one backward pass over the topological order makes
	/// every routed node inherit its successor's color, so a routed
	/// device ends up with the definite trigger type of its path.
	pub fn build(self) -> RoutingGraph {
		let order = self.snapshot.order.clone();
		for domain in order.domains().iter().rev() {
			let line_count = match domain.as_receiver() {
				Some(receiver) => receiver.receiver_count(),
				None => domain
					.as_emitter()
					.expect("domain is neither receiver nor emitter")
					.emitter_count(),
			};
			for index in 0..line_count {
				let vertex = self
					.vertex_by_label(&RoutingNode::new(domain.clone(), index))
					.expect("routing node for every line");
				if let Some(next) = self.out_edge(vertex) {
					let next_state = &self.nodes[next.index()];
					let trigger = next_state.trigger.get();
					let owner = next_state.owner.borrow().clone();
					let state = &self.nodes[vertex.index()];
					state.trigger.set(trigger);
					*state.owner.borrow_mut() = owner;
				}
			}
		}

		let nodes = self
			.nodes
			.into_iter()
			.map(|state| RoutingGraphNode {
				label: state.label,
				node_type: state.node_type,
				trigger: state.trigger.get(),
				out_edge: state.out_edge.get(),
			})
			.collect();
		RoutingGraph {
			snapshot: self.snapshot,
			nodes,
			by_label: self.by_label,
		}
	}
}

pub struct RoutingGraphNode {
	label: RoutingNode,
	node_type: NodeType,
	trigger: TriggerType,
	out_edge: Option<RoutingVertexId>,
}

/// Built routing plan: an immutable DAG with out-degree at most one.
pub struct RoutingGraph {
	snapshot: TopologySnapshot,
	nodes: Vec<RoutingGraphNode>,
	by_label: HashMap<RoutingNode, RoutingVertexId, RandomState>,
}

impl RoutingGraph {
	pub fn snapshot(&self) -> &TopologySnapshot {
		&self.snapshot
	}

	pub fn node_count(&self) -> usize {
		self.nodes.len()
	}

	pub fn vertices(&self) -> impl Iterator<Item = RoutingVertexId> + '_ {
		(0..self.nodes.len() as u32).map(RoutingVertexId)
	}

	pub fn vertex_by_label(&self, label: &RoutingNode) -> Option<RoutingVertexId> {
		self.by_label.get(label).copied()
	}

	pub fn label(&self, vertex: RoutingVertexId) -> &RoutingNode {
		&self.nodes[vertex.index()].label
	}

	pub fn node_type(&self, vertex: RoutingVertexId) -> NodeType {
		self.nodes[vertex.index()].node_type
	}

	pub fn trigger(&self, vertex: RoutingVertexId) -> TriggerType {
		self.nodes[vertex.index()].trigger
	}

	pub fn out_edge(&self, vertex: RoutingVertexId) -> Option<RoutingVertexId> {
		self.nodes[vertex.index()].out_edge
	}

	pub fn edges(&self) -> impl Iterator<Item = (RoutingVertexId, RoutingVertexId)> + '_ {
		self.vertices()
			.filter_map(|v| self.out_edge(v).map(|t| (v, t)))
	}
}
