//! Routing materialization and interrupt dispatch.
//!
//! Once a routing graph is built, this module programs the routable
//! domains, derives the final vector number of every routed source,
//! fills the per-vector handler table, masks every maskable receiver
//! that ended up unrouted, and precomputes the per-vector EOI chains.
//! Delivery then reduces to two table lookups.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ahash::RandomState;
use hashbrown::HashMap;

use super::domain::DomainRef;
use super::policy::{GreedyRoutingPolicy, RoutingPolicy};
use super::routing::{
	NodeType, RoutingGraph, RoutingGraphBuilder, RoutingNode, RoutingVertexId, TriggerType,
};
use super::{CPU_INTERRUPT_COUNT, InterruptFrame, topology};
use crate::synch::{InterruptSpinMutex, RwSpinlock};

/// Handle naming an interrupt source for handler registration: the
/// routing node of a device emitter line.
pub type InterruptSourceHandle = RoutingNode;

pub type InterruptHandler = Box<dyn Fn(&InterruptFrame) + Send + Sync>;

/// Shared indirection slot for one source's handler.
///
/// The per-vector handler lists reference slots, not handlers, so
/// re-registering a handler replaces it in place and is visible to
/// dispatch without re-materializing any table.
pub struct HandlerSlot(RwSpinlock<Option<InterruptHandler>>);

impl HandlerSlot {
	fn new(handler: Option<InterruptHandler>) -> Self {
		Self(RwSpinlock::new(handler))
	}

	fn invoke(&self, frame: &InterruptFrame) {
		if let Some(handler) = &*self.0.read() {
			handler(frame);
		}
	}
}

/// Ordered end-of-interrupt chain shared between vectors with identical
/// behavior.
pub struct EoiChain {
	domains: Vec<DomainRef>,
}

impl EoiChain {
	pub fn domains(&self) -> &[DomainRef] {
		&self.domains
	}
}

#[derive(Clone)]
struct EoiBehavior {
	trigger: TriggerType,
	chain: Arc<EoiChain>,
}

/// The tables interrupt delivery reads.
pub(crate) struct DispatchTables {
	handlers_by_vector: Vec<Option<Arc<Vec<Arc<HandlerSlot>>>>>,
	eoi_table: Vec<EoiBehavior>,
	vector_of_source: HashMap<RoutingNode, usize, RandomState>,
}

impl DispatchTables {
	const fn empty() -> Self {
		Self {
			handlers_by_vector: Vec::new(),
			eoi_table: Vec::new(),
			vector_of_source: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
		}
	}

	pub(crate) fn vector_of(&self, source: &RoutingNode) -> Option<usize> {
		self.vector_of_source.get(source).copied()
	}

	pub(crate) fn eoi_chain(&self, vector: usize) -> &[DomainRef] {
		self.eoi_table
			.get(vector)
			.map(|behavior| behavior.chain.domains())
			.unwrap_or_default()
	}

	pub(crate) fn eoi_trigger(&self, vector: usize) -> Option<TriggerType> {
		self.eoi_table.get(vector).map(|behavior| behavior.trigger)
	}

	pub(crate) fn handler_count(&self, vector: usize) -> usize {
		self.handlers_by_vector
			.get(vector)
			.and_then(|slot| slot.as_ref())
			.map_or(0, |slots| slots.len())
	}

	pub(crate) fn invoke_vector(&self, frame: &InterruptFrame) {
		if let Some(Some(handlers)) = self.handlers_by_vector.get(frame.vector as usize) {
			for slot in handlers.iter() {
				slot.invoke(frame);
			}
		}
	}
}

struct DispatchState {
	registered: HashMap<RoutingNode, Arc<HandlerSlot>, RandomState>,
	tables: DispatchTables,
}

static DISPATCH: InterruptSpinMutex<DispatchState> = InterruptSpinMutex::new(DispatchState {
	registered: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
	tables: DispatchTables::empty(),
});

static POLICY: InterruptSpinMutex<Option<Box<dyn RoutingPolicy>>> = InterruptSpinMutex::new(None);

/// Replace the routing policy used by [`update_routing`].
pub fn set_routing_policy(policy: Box<dyn RoutingPolicy>) {
	*POLICY.lock() = Some(policy);
}

/// Register (or replace in place) the handler for an interrupt source.
pub fn register_handler(source: &InterruptSourceHandle, handler: InterruptHandler) {
	let mut state = DISPATCH.lock();
	match state.registered.get(source) {
		Some(slot) => {
			*slot.0.write() = Some(handler);
		}
		None => {
			state
				.registered
				.insert(source.clone(), Arc::new(HandlerSlot::new(Some(handler))));
		}
	}
}

/// Final CPU vector a source was routed to, if the current routing plan
/// reaches the vector file from it.
pub fn vector_for_source(source: &InterruptSourceHandle) -> Option<usize> {
	DISPATCH.lock().tables.vector_of_source.get(source).copied()
}

/// Rebuild the routing plan from the registered topology and swap in
/// fresh dispatch tables. Runs with interrupts disabled on the calling
/// CPU; idempotent as long as the topology has not changed.
pub fn update_routing() {
	let _disabler = crate::arch::irq::InterruptDisabler::new();
	let snapshot = topology::snapshot();
	let builder = RoutingGraphBuilder::new(snapshot);
	let graph = {
		let mut policy = POLICY.lock();
		let policy = policy.get_or_insert_with(|| Box::new(GreedyRoutingPolicy));
		policy.build_routing_graph(builder)
	};
	let mut state = DISPATCH.lock();
	let state = &mut *state;
	state.tables = materialize(&graph, &mut state.registered);
}

/// Deliver the interrupt for `frame.vector`: issue the EOI chain in
/// stored (topological) order, then run every registered handler.
pub fn dispatch_interrupt(frame: &InterruptFrame) {
	let vector = frame.vector as usize;
	let (behavior, handlers) = {
		let state = DISPATCH.lock();
		(
			state.tables.eoi_table.get(vector).cloned(),
			state
				.tables
				.handlers_by_vector
				.get(vector)
				.and_then(|slot| slot.clone()),
		)
	};

	if let Some(behavior) = behavior {
		match behavior.trigger {
			TriggerType::Edge | TriggerType::Undetermined => {
				for domain in behavior.chain.domains() {
					domain
						.as_eoi()
						.expect("EOI chain entries implement the EOI capability")
						.issue_eoi(frame);
				}
			}
			TriggerType::Level => {
				unimplemented!("no support for level-triggered interrupt EOIs yet");
			}
		}
	}

	if let Some(handlers) = handlers {
		for slot in handlers.iter() {
			// Sources routed to this vector may not have a handler
			// registered yet; their slots stay empty.
			slot.invoke(frame);
		}
	}
}

/// Program hardware and compute the dispatch tables for a routing plan.
pub(crate) fn materialize(
	graph: &RoutingGraph,
	registered: &mut HashMap<RoutingNode, Arc<HandlerSlot>, RandomState>,
) -> DispatchTables {
	configure_routable_domains(graph);
	let vectors = compute_final_vector_numbers(graph);
	let handlers_by_vector = populate_handler_table(graph, &vectors, registered);
	enable_only_mapped_interrupts(graph);
	let eoi_table = populate_eoi_table(graph, &vectors);

	let mut vector_of_source = HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0));
	for vertex in graph.vertices() {
		if let Some(vector) = vectors[vertex.index()] {
			vector_of_source.insert(graph.label(vertex).clone(), vector);
		}
	}

	DispatchTables {
		handlers_by_vector,
		eoi_table,
		vector_of_source,
	}
}

/// Invoke `route_interrupt` on every routed routable domain.
fn configure_routable_domains(graph: &RoutingGraph) {
	let topology_graph = graph.snapshot().graph.clone();
	for (source, target) in graph.edges() {
		let source_label = graph.label(source);
		let target_label = graph.label(target);
		let Some(routable) = source_label.domain.as_routable() else {
			continue;
		};

		let source_vertex = graph
			.snapshot()
			.vertex_of(&source_label.domain)
			.expect("routing source exists in topology");
		let target_vertex = graph
			.snapshot()
			.vertex_of(&target_label.domain)
			.expect("routing target exists in topology");
		let topo_edge = topology_graph
			.find_edge(source_vertex, target_vertex)
			.expect("routing edge follows a connector");
		let emitter_index = topology_graph
			.edge(topo_edge)
			.from_input(target_label.index)
			.expect("connector resolves the routed input");
		routable.route_interrupt(source_label.index, emitter_index);
	}
}

/// Walk every edge into the vector file and fuse the vector number
/// backward along the routed paths.
fn compute_final_vector_numbers(graph: &RoutingGraph) -> Vec<Option<usize>> {
	let order = graph.snapshot().order.clone();

	let mut edges: Vec<(RoutingVertexId, RoutingVertexId)> = graph.edges().collect();
	// Targets nearest the vector file first: descending topological
	// order of the target domain, index as the deterministic tiebreak.
	edges.sort_by(|&(_, t1), &(_, t2)| {
		let l1 = graph.label(t1);
		let l2 = graph.label(t2);
		if l1.domain == l2.domain {
			l1.index.cmp(&l2.index)
		} else {
			order.position(&l2.domain).cmp(&order.position(&l1.domain))
		}
	});

	let mut vectors: Vec<Option<usize>> = vec![None; graph.node_count()];
	for (source, target) in edges {
		let target_label = graph.label(target);
		if target_label.domain.is_vector_file() {
			vectors[target.index()] = Some(target_label.index);
		}
		vectors[source.index()] = vectors[target.index()];
	}

	for vertex in graph.vertices() {
		if graph.node_type(vertex) == NodeType::Device && vectors[vertex.index()].is_none() {
			warn!(
				"{:?} was not routed to an interrupt vector",
				graph.label(vertex)
			);
		}
	}

	vectors
}

fn populate_handler_table(
	graph: &RoutingGraph,
	vectors: &[Option<usize>],
	registered: &mut HashMap<RoutingNode, Arc<HandlerSlot>, RandomState>,
) -> Vec<Option<Arc<Vec<Arc<HandlerSlot>>>>> {
	let mut table: Vec<Vec<Arc<HandlerSlot>>> = Vec::new();
	table.resize_with(CPU_INTERRUPT_COUNT, Vec::new);

	for vertex in graph.vertices() {
		if graph.node_type(vertex) != NodeType::Device {
			continue;
		}
		let Some(vector) = vectors[vertex.index()] else {
			continue;
		};
		if vector >= CPU_INTERRUPT_COUNT {
			continue;
		}
		let slot = registered
			.entry(graph.label(vertex).clone())
			.or_insert_with(|| Arc::new(HandlerSlot::new(None)))
			.clone();
		table[vector].push(slot);
	}

	table
		.into_iter()
		.map(|slots| {
			if slots.is_empty() {
				None
			} else {
				Some(Arc::new(slots))
			}
		})
		.collect()
}

/// Mask every maskable receiver without a downstream edge; unmask the
/// rest.
fn enable_only_mapped_interrupts(graph: &RoutingGraph) {
	let topology_graph = graph.snapshot().graph.clone();
	for vertex in topology_graph.vertices() {
		let domain = topology_graph.vertex(vertex);
		let Some(maskable) = domain.as_maskable() else {
			continue;
		};
		let Some(receiver) = domain.as_receiver() else {
			continue;
		};
		for index in 0..receiver.receiver_count() {
			let routing_vertex = graph
				.vertex_by_label(&RoutingNode::new(domain.clone(), index))
				.expect("routing node for every receiver");
			maskable.set_receiver_mask(index, graph.out_edge(routing_vertex).is_none());
		}
	}
}

fn populate_eoi_table(graph: &RoutingGraph, vectors: &[Option<usize>]) -> Vec<EoiBehavior> {
	let order = graph.snapshot().order.clone();

	// Collect the EOI domains on every routed device path, per final
	// vector.
	let mut domains_by_vector: Vec<Vec<DomainRef>> = Vec::new();
	domains_by_vector.resize_with(CPU_INTERRUPT_COUNT, Vec::new);
	for vertex in graph.vertices() {
		if graph.node_type(vertex) != NodeType::Device {
			continue;
		}
		let Some(vector) = vectors[vertex.index()] else {
			continue;
		};
		if vector >= CPU_INTERRUPT_COUNT {
			continue;
		}
		let mut current = vertex;
		loop {
			let domain = &graph.label(current).domain;
			if domain.as_eoi().is_some() && !domains_by_vector[vector].contains(domain) {
				domains_by_vector[vector].push(domain.clone());
			}
			match graph.out_edge(current) {
				Some(next) => current = next,
				None => break,
			}
		}
	}

	// Sort each chain into topological order (innermost controller
	// acknowledges first) and share identical chains between vectors.
	let empty_chain = Arc::new(EoiChain {
		domains: Vec::new(),
	});
	let mut chains: HashMap<Vec<DomainRef>, Arc<EoiChain>, RandomState> =
		HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0));

	let vector_file = graph
		.snapshot()
		.order
		.domains()
		.iter()
		.find(|d| d.is_vector_file())
		.cloned();

	(0..CPU_INTERRUPT_COUNT)
		.map(|vector| {
			let mut domains = core::mem::take(&mut domains_by_vector[vector]);
			domains.sort_by_key(|d| order.position(d));
			let chain = if domains.is_empty() {
				empty_chain.clone()
			} else {
				chains
					.entry(domains.clone())
					.or_insert_with(|| Arc::new(EoiChain { domains }))
					.clone()
			};

			let trigger = vector_file
				.as_ref()
				.and_then(|vf| graph.vertex_by_label(&RoutingNode::new(vf.clone(), vector)))
				.map_or(TriggerType::Undetermined, |v| graph.trigger(v));

			EoiBehavior { trigger, chain }
		})
		.collect()
}

#[cfg(test)]
pub(crate) fn replace_in_slot(slot: &Arc<HandlerSlot>, handler: InterruptHandler) {
	*slot.0.write() = Some(handler);
}
