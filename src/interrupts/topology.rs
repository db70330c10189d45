//! Interrupt topology registry.
//!
//! Adapters describe their hardware by registering domains and the
//! connectors between them during boot. The registry accumulates a
//! [`GraphBuilder`] and hands out a memoized immutable [`TopologyGraph`]
//! plus its topological order; any mutation invalidates both caches.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ahash::RandomState;
use hashbrown::HashMap;

use super::domain::{ConnectorRef, DomainRef};
use crate::graph::{self, Graph, GraphBuilder, Structure, VertexId};
use crate::synch::InterruptSpinMutex;

pub type TopologyGraph = Graph<DomainRef, ConnectorRef>;

/// Topologically sorted domains plus the inverse position map.
pub struct TopologyOrder {
	domains: Vec<DomainRef>,
	positions: HashMap<DomainRef, usize, RandomState>,
}

impl TopologyOrder {
	pub fn domains(&self) -> &[DomainRef] {
		&self.domains
	}

	pub fn position(&self, domain: &DomainRef) -> usize {
		self.positions[domain]
	}
}

/// Shared read-only view of the topology, taken once per routing pass.
#[derive(Clone)]
pub struct TopologySnapshot {
	pub graph: Arc<TopologyGraph>,
	pub order: Arc<TopologyOrder>,
	vertex_of: Arc<HashMap<DomainRef, VertexId, RandomState>>,
	exclusive: Arc<HashMap<(DomainRef, usize), ConnectorRef, RandomState>>,
}

impl TopologySnapshot {
	pub fn vertex_of(&self, domain: &DomainRef) -> Option<VertexId> {
		self.vertex_of.get(domain).copied()
	}

	/// Connector owning the given receiver input exclusively, if any.
	pub fn exclusive_owner(&self, domain: &DomainRef, input: usize) -> Option<&ConnectorRef> {
		self.exclusive.get(&(domain.clone(), input))
	}
}

pub struct InterruptTopology {
	builder: GraphBuilder<DomainRef, ConnectorRef>,
	vertex_of: HashMap<DomainRef, VertexId, RandomState>,
	exclusive: HashMap<(DomainRef, usize), ConnectorRef, RandomState>,
	cached_graph: Option<Arc<TopologyGraph>>,
	cached_order: Option<Arc<TopologyOrder>>,
}

impl InterruptTopology {
	pub const fn new() -> Self {
		Self {
			builder: GraphBuilder::new(Structure::DirectedAcyclic),
			vertex_of: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
			exclusive: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
			cached_graph: None,
			cached_order: None,
		}
	}

	fn invalidate(&mut self) {
		self.cached_graph = None;
		self.cached_order = None;
	}

	pub fn register_domain(&mut self, domain: DomainRef) {
		assert!(
			domain.as_emitter().is_some() || domain.as_receiver().is_some(),
			"interrupt domain must be at least an emitter or a receiver"
		);
		assert!(
			!self.vertex_of.contains_key(&domain),
			"interrupt domain registered twice"
		);
		let vertex = self.builder.add_vertex(domain.clone());
		self.vertex_of.insert(domain, vertex);
		self.invalidate();
	}

	fn connector_endpoints(&self, connector: &ConnectorRef) -> (VertexId, VertexId) {
		let source = self
			.vertex_of
			.get(&connector.source())
			.copied()
			.expect("connector endpoints must be registered before the connector");
		let target = self
			.vertex_of
			.get(&connector.target())
			.copied()
			.expect("connector endpoints must be registered before the connector");
		assert!(
			connector.source().as_emitter().is_some(),
			"connector source must be an interrupt emitter"
		);
		assert!(
			connector.target().as_receiver().is_some(),
			"connector target must be an interrupt receiver"
		);
		(source, target)
	}

	pub fn register_connector(&mut self, connector: ConnectorRef) {
		let (source, target) = self.connector_endpoints(&connector);
		self.builder.add_edge(source, target, connector);
		self.invalidate();
	}

	/// Register a connector that claims exclusive ownership of every
	/// target input it maps to. Fails without modifying the registry if
	/// any of those inputs is already owned.
	pub fn register_exclusive_connector(&mut self, connector: ConnectorRef) -> bool {
		let (source, target) = self.connector_endpoints(&connector);
		let emitter_count = connector
			.source()
			.as_emitter()
			.map(|e| e.emitter_count())
			.unwrap();

		let target_domain = connector.target();
		let mut claims = Vec::new();
		for output in 0..emitter_count {
			let Some(input) = connector.from_output(output) else {
				continue;
			};
			let key = (target_domain.clone(), input);
			if self.exclusive.contains_key(&key) {
				return false;
			}
			claims.push(key);
		}

		for key in claims {
			self.exclusive.insert(key, connector.clone());
		}
		self.builder.add_edge(source, target, connector);
		self.invalidate();
		true
	}

	/// Build (or return the memoized) topology graph.
	pub fn graph(&mut self) -> Arc<TopologyGraph> {
		if self.cached_graph.is_none() {
			let graph = self
				.builder
				.build()
				.expect("interrupt topology must be a simple DAG");
			self.cached_graph = Some(Arc::new(graph));
		}
		self.cached_graph.as_ref().unwrap().clone()
	}

	pub fn order(&mut self) -> Arc<TopologyOrder> {
		if self.cached_order.is_none() {
			let graph = self.graph();
			let sorted = graph::algo::topological_sort(&graph)
				.expect("interrupt topology must be acyclic");
			let mut domains = Vec::with_capacity(sorted.len());
			let mut positions = HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0));
			for (i, vertex) in sorted.iter().enumerate() {
				let domain = graph.vertex(*vertex).clone();
				positions.insert(domain.clone(), i);
				domains.push(domain);
			}
			self.cached_order = Some(Arc::new(TopologyOrder { domains, positions }));
		}
		self.cached_order.as_ref().unwrap().clone()
	}

	pub fn snapshot(&mut self) -> TopologySnapshot {
		TopologySnapshot {
			graph: self.graph(),
			order: self.order(),
			vertex_of: Arc::new(self.vertex_of.clone()),
			exclusive: Arc::new(self.exclusive.clone()),
		}
	}

	pub fn domain_count(&self) -> usize {
		self.builder.vertex_count()
	}
}

impl Default for InterruptTopology {
	fn default() -> Self {
		Self::new()
	}
}

static TOPOLOGY: InterruptSpinMutex<InterruptTopology> =
	InterruptSpinMutex::new(InterruptTopology::new());

/// Register a domain with the boot topology.
pub fn register_domain(domain: DomainRef) {
	TOPOLOGY.lock().register_domain(domain);
}

/// Register a connector with the boot topology.
pub fn register_connector(connector: ConnectorRef) {
	TOPOLOGY.lock().register_connector(connector);
}

/// Register an exclusive connector with the boot topology.
pub fn register_exclusive_connector(connector: ConnectorRef) -> bool {
	TOPOLOGY.lock().register_exclusive_connector(connector)
}

pub(crate) fn snapshot() -> TopologySnapshot {
	TOPOLOGY.lock().snapshot()
}

#[cfg(test)]
mod tests {
	use alloc::sync::Arc;

	use super::super::domain::{
		AffineConnector, CpuVectorFile, InterruptDomain, InterruptEmitter,
	};
	use super::*;

	struct Device;

	impl InterruptDomain for Device {
		fn name(&self) -> &'static str {
			"test-device"
		}

		fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
			Some(self)
		}
	}

	impl InterruptEmitter for Device {
		fn emitter_count(&self) -> usize {
			2
		}
	}

	#[test]
	fn graph_matches_registrations() {
		let mut topology = InterruptTopology::new();
		let device = DomainRef::new(Device);
		let vectors = DomainRef::new(CpuVectorFile::new(16));
		topology.register_domain(device.clone());
		topology.register_domain(vectors.clone());
		topology.register_connector(Arc::new(AffineConnector::new(
			device.clone(),
			vectors.clone(),
			4,
			0,
			2,
		)));

		let graph = topology.graph();
		assert_eq!(graph.vertex_count(), 2);
		assert_eq!(graph.edge_count(), 1);
		let order = topology.order();
		assert!(order.position(&device) < order.position(&vectors));
	}

	#[test]
	fn duplicate_exclusive_claim_is_rejected_atomically() {
		let mut topology = InterruptTopology::new();
		let first = DomainRef::new(Device);
		let second = DomainRef::new(Device);
		let vectors = DomainRef::new(CpuVectorFile::new(16));
		topology.register_domain(first.clone());
		topology.register_domain(second.clone());
		topology.register_domain(vectors.clone());

		assert!(topology.register_exclusive_connector(Arc::new(AffineConnector::new(
			first.clone(),
			vectors.clone(),
			0,
			0,
			2,
		))));
		let edges_before = topology.graph().edge_count();
		// Overlaps input 1 of the vector file: must fail and leave the
		// registry untouched.
		assert!(!topology.register_exclusive_connector(Arc::new(AffineConnector::new(
			second.clone(),
			vectors.clone(),
			1,
			0,
			2,
		))));
		assert_eq!(topology.graph().edge_count(), edges_before);
		assert!(
			topology
				.snapshot()
				.exclusive_owner(&vectors, 1)
				.is_some_and(|c| c.source() == first)
		);
	}
}
