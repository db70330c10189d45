//! Interrupt topology, routing, and dispatch.
//!
//! Boot flow: adapters register domains and connectors with the
//! [`topology`] registry, then [`update_routing`] computes a routing
//! plan (via the current [`policy::RoutingPolicy`]), programs the
//! hardware, and builds the dispatch tables. At run time the
//! architecture's vector stubs call [`dispatch_interrupt`].

pub mod dispatch;
pub mod domain;
pub mod policy;
pub mod routing;
pub mod topology;

use hermit_sync::OnceCell;

pub use self::dispatch::{
	InterruptHandler, InterruptSourceHandle, dispatch_interrupt, register_handler,
	set_routing_policy, update_routing, vector_for_source,
};
pub use self::domain::{ActivationType, CpuVectorFile, DomainRef};
pub use self::routing::{RoutingNode, TriggerType};
pub use self::topology::{register_connector, register_domain, register_exclusive_connector};

/// Width of the CPU interrupt vector file.
pub const CPU_INTERRUPT_COUNT: usize = 256;

/// State passed to every interrupt handler.
///
/// The architecture's entry stubs fill this from the saved trap frame;
/// the core only interprets the vector index.
#[derive(Clone, Copy, Debug)]
pub struct InterruptFrame {
	pub vector: u8,
}

static VECTOR_FILE: OnceCell<DomainRef> = OnceCell::new();

/// Create and register the CPU vector file with the boot topology.
/// Returns `false` if it was already set up.
pub fn setup_cpu_interrupt_vector_file(size: usize) -> bool {
	let domain = DomainRef::new(CpuVectorFile::new(size));
	if VECTOR_FILE.set(domain.clone()).is_err() {
		return false;
	}
	topology::register_domain(domain);
	true
}

/// The singleton vector file registered by
/// [`setup_cpu_interrupt_vector_file`].
pub fn cpu_interrupt_vectors() -> DomainRef {
	VECTOR_FILE
		.get()
		.expect("CPU interrupt vector file not set up")
		.clone()
}

#[cfg(test)]
mod tests {
	use alloc::boxed::Box;
	use alloc::sync::Arc;
	use alloc::vec::Vec;
	use core::sync::atomic::{AtomicUsize, Ordering};

	use ahash::RandomState;
	use hashbrown::HashMap;
	use hermit_sync::SpinMutex;

	use super::dispatch::{self, HandlerSlot};
	use super::domain::*;
	use super::policy::{GreedyRoutingPolicy, RoutingPolicy};
	use super::routing::*;
	use super::topology::InterruptTopology;
	use super::*;
	use crate::collections::Bimap;

	struct MockDevice {
		name: &'static str,
		emitters: usize,
	}

	impl InterruptDomain for MockDevice {
		fn name(&self) -> &'static str {
			self.name
		}

		fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
			Some(self)
		}
	}

	impl InterruptEmitter for MockDevice {
		fn emitter_count(&self) -> usize {
			self.emitters
		}
	}

	/// Free-routable interrupt controller in the shape of an I/O APIC:
	/// maskable, activation-configurable, lines in, vectors out.
	struct MockIoApic {
		name: &'static str,
		lines: usize,
		vectors: usize,
		masked: SpinMutex<Vec<bool>>,
		activation: SpinMutex<Vec<Option<ActivationType>>>,
		routed: SpinMutex<Vec<Option<usize>>>,
	}

	impl MockIoApic {
		fn new(name: &'static str, lines: usize, vectors: usize) -> Self {
			Self {
				name,
				lines,
				vectors,
				masked: SpinMutex::new(vec![true; lines]),
				activation: SpinMutex::new(vec![None; lines]),
				routed: SpinMutex::new(vec![None; lines]),
			}
		}
	}

	impl InterruptDomain for MockIoApic {
		fn name(&self) -> &'static str {
			self.name
		}

		fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
			Some(self)
		}

		fn as_receiver(&self) -> Option<&dyn InterruptReceiver> {
			Some(self)
		}

		fn as_routable(&self) -> Option<&dyn RoutableDomain> {
			Some(self)
		}

		fn as_maskable(&self) -> Option<&dyn MaskableDomain> {
			Some(self)
		}

		fn as_activation_config(&self) -> Option<&dyn ConfigurableActivationTypeDomain> {
			Some(self)
		}
	}

	impl InterruptEmitter for MockIoApic {
		fn emitter_count(&self) -> usize {
			self.vectors
		}
	}

	impl InterruptReceiver for MockIoApic {
		fn receiver_count(&self) -> usize {
			self.lines
		}
	}

	impl RoutableDomain for MockIoApic {
		fn routing_rule(&self) -> RoutingRule<'_> {
			RoutingRule::Free
		}

		fn route_interrupt(&self, from_receiver: usize, to_emitter: usize) -> bool {
			self.routed.lock()[from_receiver] = Some(to_emitter);
			true
		}
	}

	impl MaskableDomain for MockIoApic {
		fn set_receiver_mask(&self, receiver: usize, masked: bool) {
			self.masked.lock()[receiver] = masked;
		}

		fn is_receiver_masked(&self, receiver: usize) -> bool {
			self.masked.lock()[receiver]
		}
	}

	impl ConfigurableActivationTypeDomain for MockIoApic {
		fn set_activation_type(&self, receiver: usize, activation: ActivationType) {
			self.activation.lock()[receiver] = Some(activation);
		}

		fn activation_type(&self, receiver: usize) -> Option<ActivationType> {
			self.activation.lock()[receiver]
		}
	}

	/// Fixed identity router with EOI, in the shape of a local APIC.
	struct MockLapic {
		width: usize,
		eois: AtomicUsize,
	}

	impl InterruptDomain for MockLapic {
		fn name(&self) -> &'static str {
			"mock-lapic"
		}

		fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
			Some(self)
		}

		fn as_receiver(&self) -> Option<&dyn InterruptReceiver> {
			Some(self)
		}

		fn as_routable(&self) -> Option<&dyn RoutableDomain> {
			Some(self)
		}

		fn as_eoi(&self) -> Option<&dyn EoiDomain> {
			Some(self)
		}
	}

	impl InterruptEmitter for MockLapic {
		fn emitter_count(&self) -> usize {
			self.width
		}
	}

	impl InterruptReceiver for MockLapic {
		fn receiver_count(&self) -> usize {
			self.width
		}
	}

	impl RoutableDomain for MockLapic {
		fn routing_rule(&self) -> RoutingRule<'_> {
			RoutingRule::Fixed(self)
		}

		fn route_interrupt(&self, _from_receiver: usize, _to_emitter: usize) -> bool {
			true
		}
	}

	impl FixedRouting for MockLapic {
		fn emitter_for(&self, receiver: usize) -> usize {
			receiver
		}
	}

	impl EoiDomain for MockLapic {
		fn issue_eoi(&self, _frame: &InterruptFrame) {
			self.eois.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Fixed-routing legacy IRQ demultiplexer with a surjective
	/// receiver-to-emitter map.
	struct MockIrqDomain {
		map: [usize; 16],
		emitters: usize,
	}

	impl InterruptDomain for MockIrqDomain {
		fn name(&self) -> &'static str {
			"mock-irq"
		}

		fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
			Some(self)
		}

		fn as_receiver(&self) -> Option<&dyn InterruptReceiver> {
			Some(self)
		}

		fn as_routable(&self) -> Option<&dyn RoutableDomain> {
			Some(self)
		}
	}

	impl InterruptEmitter for MockIrqDomain {
		fn emitter_count(&self) -> usize {
			self.emitters
		}
	}

	impl InterruptReceiver for MockIrqDomain {
		fn receiver_count(&self) -> usize {
			16
		}
	}

	impl RoutableDomain for MockIrqDomain {
		fn routing_rule(&self) -> RoutingRule<'_> {
			RoutingRule::Fixed(self)
		}

		fn route_interrupt(&self, _from_receiver: usize, _to_emitter: usize) -> bool {
			true
		}
	}

	impl FixedRouting for MockIrqDomain {
		fn emitter_for(&self, receiver: usize) -> usize {
			self.map[receiver]
		}
	}

	struct BimapConnector {
		source: DomainRef,
		target: DomainRef,
		map: Bimap<usize, usize>,
	}

	impl Connector for BimapConnector {
		fn source(&self) -> DomainRef {
			self.source.clone()
		}

		fn target(&self) -> DomainRef {
			self.target.clone()
		}

		fn from_output(&self, output: usize) -> Option<usize> {
			self.map.get_left(&output).copied()
		}

		fn from_input(&self, input: usize) -> Option<usize> {
			self.map.get_right(&input).copied()
		}
	}

	/// Context-independent router in the shape of the HPET comparator
	/// block: each comparator may only reach a subset of output lines.
	struct MockComparatorRouter {
		comparators: usize,
		lines: usize,
		allowed: Vec<u32>,
		routed: SpinMutex<Vec<Option<usize>>>,
	}

	impl InterruptDomain for MockComparatorRouter {
		fn name(&self) -> &'static str {
			"mock-comparator-router"
		}

		fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
			Some(self)
		}

		fn as_receiver(&self) -> Option<&dyn InterruptReceiver> {
			Some(self)
		}

		fn as_routable(&self) -> Option<&dyn RoutableDomain> {
			Some(self)
		}
	}

	impl InterruptEmitter for MockComparatorRouter {
		fn emitter_count(&self) -> usize {
			self.lines
		}
	}

	impl InterruptReceiver for MockComparatorRouter {
		fn receiver_count(&self) -> usize {
			self.comparators
		}
	}

	impl RoutableDomain for MockComparatorRouter {
		fn routing_rule(&self) -> RoutingRule<'_> {
			RoutingRule::ContextIndependent(self)
		}

		fn route_interrupt(&self, from_receiver: usize, to_emitter: usize) -> bool {
			self.routed.lock()[from_receiver] = Some(to_emitter);
			true
		}
	}

	impl ContextIndependentRouting for MockComparatorRouter {
		fn is_routing_allowed(&self, from_receiver: usize, to_emitter: usize) -> bool {
			self.allowed[from_receiver] & (1 << to_emitter) != 0
		}
	}

	struct Fixture {
		topology: InterruptTopology,
		vectors: DomainRef,
		lapic: DomainRef,
	}

	/// Vector file + identity LAPIC, the trunk every scenario shares.
	fn trunk(width: usize) -> Fixture {
		let mut topology = InterruptTopology::new();
		let vectors = DomainRef::new(CpuVectorFile::new(width));
		let lapic = DomainRef::new(MockLapic {
			width,
			eois: AtomicUsize::new(0),
		});
		topology.register_domain(vectors.clone());
		topology.register_domain(lapic.clone());
		topology.register_connector(Arc::new(AffineConnector::new(
			lapic.clone(),
			vectors.clone(),
			0,
			0,
			width,
		)));
		Fixture {
			topology,
			vectors,
			lapic,
		}
	}

	fn route(topology: &mut InterruptTopology) -> RoutingGraph {
		let builder = RoutingGraphBuilder::new(topology.snapshot());
		GreedyRoutingPolicy.build_routing_graph(builder)
	}

	fn registered_map() -> HashMap<RoutingNode, Arc<HandlerSlot>, RandomState> {
		HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0))
	}

	/// Legacy IRQ demultiplexer in front of two I/O APICs with a source
	/// override mapping IRQ 0 to GSI 2 (edge, active high) and identity
	/// for everything else.
	#[test]
	fn legacy_irq_override_routes_through_first_ioapic() {
		let mut fixture = trunk(256);
		let ioapic1_inner = Arc::new(MockIoApic::new("ioapic-1", 24, 239));
		let ioapic1 = DomainRef::from_arc(ioapic1_inner.clone());
		let ioapic2_inner = Arc::new(MockIoApic::new("ioapic-2", 24, 239));
		let ioapic2 = DomainRef::from_arc(ioapic2_inner.clone());
		fixture.topology.register_domain(ioapic1.clone());
		fixture.topology.register_domain(ioapic2.clone());
		for ioapic in [&ioapic1, &ioapic2] {
			fixture.topology.register_connector(Arc::new(AffineConnector::new(
				ioapic.clone(),
				fixture.lapic.clone(),
				0x10,
				0,
				239,
			)));
		}

		// MADT source override: IRQ 0 -> GSI 2, edge-triggered, active
		// high. Remaining IRQs map to their identity GSI; IRQ 2 shares
		// the emitter created for the override.
		let mut map = [0usize; 16];
		let mut bimap = Bimap::new();
		bimap.insert(0usize, 2usize);
		ioapic1_inner.set_activation_type(2, ActivationType::EdgeHigh);
		let mut next_emitter = 1;
		for irq in 1..16 {
			if irq == 2 {
				map[irq] = 0;
				continue;
			}
			map[irq] = next_emitter;
			bimap.insert(next_emitter, irq);
			next_emitter += 1;
		}
		let irq_domain = DomainRef::new(MockIrqDomain {
			map,
			emitters: next_emitter,
		});
		fixture.topology.register_domain(irq_domain.clone());
		fixture
			.topology
			.register_connector(Arc::new(BimapConnector {
				source: irq_domain.clone(),
				target: ioapic1.clone(),
				map: bimap,
			}));

		// Two devices: a timer on IRQ 0 and one more on IRQ 5.
		let timer = DomainRef::new(MockDevice {
			name: "timer",
			emitters: 1,
		});
		let uart = DomainRef::new(MockDevice {
			name: "uart",
			emitters: 1,
		});
		fixture.topology.register_domain(timer.clone());
		fixture.topology.register_domain(uart.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			timer.clone(),
			irq_domain.clone(),
			0,
			0,
			1,
		)));
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			uart.clone(),
			irq_domain.clone(),
			5,
			0,
			1,
		)));

		let graph = route(&mut fixture.topology);
		let mut registered = registered_map();
		let tables = dispatch::materialize(&graph, &mut registered);

		// IRQ 0 must come out on IOAPIC 1 line 2, and the override's
		// activation type must be what the firmware said.
		let irq0 = graph
			.vertex_by_label(&RoutingNode::new(irq_domain.clone(), 0))
			.unwrap();
		let line2 = graph
			.vertex_by_label(&RoutingNode::new(ioapic1.clone(), 2))
			.unwrap();
		assert_eq!(graph.out_edge(irq0), Some(line2));
		assert_eq!(
			ioapic1_inner.activation_type(2),
			Some(ActivationType::EdgeHigh)
		);

		// The untouched legacy IRQs keep their identity mapping.
		let irq5 = graph
			.vertex_by_label(&RoutingNode::new(irq_domain.clone(), 5))
			.unwrap();
		let line5 = graph
			.vertex_by_label(&RoutingNode::new(ioapic1.clone(), 5))
			.unwrap();
		assert_eq!(graph.out_edge(irq5), Some(line5));

		// Both devices end up on CPU vectors in the routable range.
		let timer_vector = tables
			.vector_of(&RoutingNode::new(timer.clone(), 0))
			.unwrap();
		assert!(timer_vector >= 0x10);
		assert!(
			tables
				.vector_of(&RoutingNode::new(uart.clone(), 0))
				.unwrap() >= 0x10
		);

		// Only the loaded lines are live; everything else is masked.
		for line in 0..24 {
			let expect_live = line == 2 || line == 5;
			assert_eq!(ioapic1_inner.is_receiver_masked(line), !expect_live);
			assert!(ioapic2_inner.is_receiver_masked(line));
		}

		// The mock IOAPIC was actually programmed for the routed lines.
		assert_eq!(
			ioapic1_inner.routed.lock()[2],
			Some(timer_vector - 0x10),
			"line 2 must be programmed with the vector-file-relative emitter"
		);
	}

	/// A comparator that may only use lines {2, 8, 11} takes the one
	/// with the lowest current load.
	#[test]
	fn constrained_router_picks_lightest_line() {
		let mut fixture = trunk(256);
		let ioapic_inner = Arc::new(MockIoApic::new("ioapic", 24, 239));
		let ioapic = DomainRef::from_arc(ioapic_inner.clone());
		fixture.topology.register_domain(ioapic.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			ioapic.clone(),
			fixture.lapic.clone(),
			0x10,
			0,
			239,
		)));

		// Pre-load lines 2 and 11 with one device each.
		for line in [2usize, 11] {
			let device = DomainRef::new(MockDevice {
				name: "loader",
				emitters: 1,
			});
			fixture.topology.register_domain(device.clone());
			fixture.topology.register_connector(Arc::new(AffineConnector::new(
				device,
				ioapic.clone(),
				line,
				0,
				1,
			)));
		}

		let router_inner = Arc::new(MockComparatorRouter {
			comparators: 3,
			lines: 24,
			allowed: vec![0, 0, (1 << 2) | (1 << 8) | (1 << 11)],
			routed: SpinMutex::new(vec![None; 3]),
		});
		let router = DomainRef::from_arc(router_inner.clone());
		// Only comparator 2 is wired up to the I/O APIC.
		let comparators = DomainRef::new(MockDevice {
			name: "comparators",
			emitters: 1,
		});
		fixture.topology.register_domain(router.clone());
		fixture.topology.register_domain(comparators.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			comparators.clone(),
			router.clone(),
			2,
			0,
			1,
		)));
		// Router emitter i feeds IOAPIC line i.
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			router.clone(),
			ioapic.clone(),
			0,
			0,
			24,
		)));

		let graph = route(&mut fixture.topology);
		let mut registered = registered_map();
		let _tables = dispatch::materialize(&graph, &mut registered);

		let routed = router_inner.routed.lock()[2];
		assert_eq!(routed, Some(8), "comparator 2 must take the unloaded line");
		let comparator2 = graph
			.vertex_by_label(&RoutingNode::new(router.clone(), 2))
			.unwrap();
		let line8 = graph
			.vertex_by_label(&RoutingNode::new(ioapic.clone(), 8))
			.unwrap();
		assert_eq!(graph.out_edge(comparator2), Some(line8));
	}

	#[test]
	fn routing_is_a_function_with_legal_edges() {
		let mut fixture = trunk(64);
		let ioapic = DomainRef::from_arc(Arc::new(MockIoApic::new("ioapic", 8, 16)));
		fixture.topology.register_domain(ioapic.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			ioapic.clone(),
			fixture.lapic.clone(),
			0x10,
			0,
			16,
		)));
		for line in 0..4 {
			let device = DomainRef::new(MockDevice {
				name: "dev",
				emitters: 1,
			});
			fixture.topology.register_domain(device.clone());
			fixture.topology.register_connector(Arc::new(AffineConnector::new(
				device,
				ioapic.clone(),
				line,
				0,
				1,
			)));
		}

		let graph = route(&mut fixture.topology);

		let mut out_degree = vec![0usize; graph.node_count()];
		for (source, _) in graph.edges() {
			out_degree[source.index()] += 1;
		}
		assert!(out_degree.iter().all(|&d| d <= 1));

		// Every device's unique path ends at exactly one vector-file
		// node.
		for vertex in graph.vertices() {
			if graph.node_type(vertex) != NodeType::Device {
				continue;
			}
			let mut current = vertex;
			while let Some(next) = graph.out_edge(current) {
				current = next;
			}
			assert!(graph.label(current).domain.is_vector_file());
		}
	}

	#[test]
	fn level_source_cannot_feed_edge_path() {
		let mut fixture = trunk(64);
		let ioapic_inner = Arc::new(MockIoApic::new("ioapic", 8, 16));
		let ioapic = DomainRef::from_arc(ioapic_inner.clone());
		// Line 0 is level-triggered, line 1 edge-triggered.
		ioapic_inner.set_activation_type(0, ActivationType::LevelLow);
		ioapic_inner.set_activation_type(1, ActivationType::EdgeHigh);
		fixture.topology.register_domain(ioapic.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			ioapic.clone(),
			fixture.lapic.clone(),
			0x10,
			0,
			16,
		)));

		let mut builder = RoutingGraphBuilder::new(fixture.topology.snapshot());
		let line0 = builder
			.vertex_by_label(&RoutingNode::new(ioapic.clone(), 0))
			.unwrap();
		let line1 = builder
			.vertex_by_label(&RoutingNode::new(ioapic.clone(), 1))
			.unwrap();
		let lapic16 = builder
			.vertex_by_label(&RoutingNode::new(fixture.lapic.clone(), 0x10))
			.unwrap();
		let lapic17 = builder
			.vertex_by_label(&RoutingNode::new(fixture.lapic.clone(), 0x11))
			.unwrap();

		// Feed the edge line into vector 0x11; its chain becomes edge.
		builder.add_edge(line1, lapic17).unwrap();
		assert_eq!(builder.component_trigger(lapic17), TriggerType::Edge);

		// A level line must not join that edge chain, but is free to
		// claim an undetermined one (which then turns level).
		assert!(!builder.is_edge_allowed(line0, lapic17));
		builder.add_edge(line0, lapic16).unwrap();
		assert_eq!(builder.component_trigger(lapic16), TriggerType::Level);
	}

	#[test]
	fn device_under_level_path_inherits_level() {
		let mut fixture = trunk(64);
		let ioapic_inner = Arc::new(MockIoApic::new("ioapic", 8, 16));
		let ioapic = DomainRef::from_arc(ioapic_inner.clone());
		ioapic_inner.set_activation_type(3, ActivationType::LevelHigh);
		fixture.topology.register_domain(ioapic.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			ioapic.clone(),
			fixture.lapic.clone(),
			0x10,
			0,
			16,
		)));
		let device = DomainRef::new(MockDevice {
			name: "level-dev",
			emitters: 1,
		});
		fixture.topology.register_domain(device.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			device.clone(),
			ioapic.clone(),
			3,
			0,
			1,
		)));

		let graph = route(&mut fixture.topology);
		let dev = graph
			.vertex_by_label(&RoutingNode::new(device.clone(), 0))
			.unwrap();
		assert_eq!(graph.trigger(dev), TriggerType::Level);

		// The whole routed path carries the level color.
		for (source, target) in graph.edges() {
			assert!(
				!(graph.trigger(source) == TriggerType::Edge
					&& graph.trigger(target) == TriggerType::Level)
			);
		}
	}

	#[test]
	fn eoi_chain_is_topologically_sorted_subset() {
		let mut fixture = trunk(64);
		let ioapic = DomainRef::from_arc(Arc::new(MockIoApic::new("ioapic", 8, 16)));
		fixture.topology.register_domain(ioapic.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			ioapic.clone(),
			fixture.lapic.clone(),
			0x10,
			0,
			16,
		)));
		let device = DomainRef::new(MockDevice {
			name: "dev",
			emitters: 1,
		});
		fixture.topology.register_domain(device.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			device.clone(),
			ioapic.clone(),
			0,
			0,
			1,
		)));

		let graph = route(&mut fixture.topology);
		let mut registered = registered_map();
		let tables = dispatch::materialize(&graph, &mut registered);

		let vector = tables.vector_of(&RoutingNode::new(device.clone(), 0)).unwrap();
		let chain = tables.eoi_chain(vector);
		assert_eq!(chain.len(), 1);
		assert_eq!(chain[0], fixture.lapic);
		assert_eq!(tables.eoi_trigger(vector), Some(TriggerType::Undetermined));

		// Unrouted vectors share the empty chain.
		assert!(tables.eoi_chain(0).is_empty());
	}

	#[test]
	fn handler_replacement_is_in_place() {
		let mut fixture = trunk(64);
		let device = DomainRef::new(MockDevice {
			name: "dev",
			emitters: 1,
		});
		fixture.topology.register_domain(device.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			device.clone(),
			fixture.lapic.clone(),
			0x20,
			0,
			1,
		)));

		let graph = route(&mut fixture.topology);
		let mut registered = registered_map();
		let tables = dispatch::materialize(&graph, &mut registered);
		let handle = RoutingNode::new(device.clone(), 0);
		let vector = tables.vector_of(&handle).unwrap();
		assert_eq!(tables.handler_count(vector), 1);

		static FIRST: AtomicUsize = AtomicUsize::new(0);
		static SECOND: AtomicUsize = AtomicUsize::new(0);
		let slot = registered.get(&handle).unwrap().clone();
		crate::interrupts::dispatch::replace_in_slot(
			&slot,
			Box::new(|_| {
				FIRST.fetch_add(1, Ordering::Relaxed);
			}),
		);
		let frame = InterruptFrame {
			vector: vector as u8,
		};
		tables.invoke_vector(&frame);
		assert_eq!(FIRST.load(Ordering::Relaxed), 1);

		// Replacing through the same slot is visible without
		// re-materializing the tables.
		crate::interrupts::dispatch::replace_in_slot(
			&slot,
			Box::new(|_| {
				SECOND.fetch_add(1, Ordering::Relaxed);
			}),
		);
		tables.invoke_vector(&frame);
		assert_eq!(FIRST.load(Ordering::Relaxed), 1);
		assert_eq!(SECOND.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn rerouting_unchanged_topology_is_idempotent() {
		let mut fixture = trunk(64);
		let ioapic = DomainRef::from_arc(Arc::new(MockIoApic::new("ioapic", 8, 16)));
		fixture.topology.register_domain(ioapic.clone());
		fixture.topology.register_connector(Arc::new(AffineConnector::new(
			ioapic.clone(),
			fixture.lapic.clone(),
			0x10,
			0,
			16,
		)));
		for line in 0..3 {
			let device = DomainRef::new(MockDevice {
				name: "dev",
				emitters: 1,
			});
			fixture.topology.register_domain(device.clone());
			fixture.topology.register_connector(Arc::new(AffineConnector::new(
				device,
				ioapic.clone(),
				line,
				0,
				1,
			)));
		}

		let graph_a = route(&mut fixture.topology);
		let graph_b = route(&mut fixture.topology);
		for vertex in graph_a.vertices() {
			let label = graph_a.label(vertex).clone();
			let other = graph_b.vertex_by_label(&label).unwrap();
			assert_eq!(
				graph_a.out_edge(vertex).map(|t| graph_a.label(t).clone()),
				graph_b.out_edge(other).map(|t| graph_b.label(t).clone())
			);
			assert_eq!(graph_a.trigger(vertex), graph_b.trigger(other));
		}
	}

	#[test]
	fn exclusive_owner_rejects_other_sources() {
		let mut fixture = trunk(64);
		// The spurious emitter exclusively owns vector 0x3f.
		let spurious = DomainRef::new(MockDevice {
			name: "spurious",
			emitters: 1,
		});
		fixture.topology.register_domain(spurious.clone());
		assert!(fixture.topology.register_exclusive_connector(Arc::new(
			AffineConnector::new(spurious.clone(), fixture.vectors.clone(), 0x3f, 0, 1,)
		)));

		let builder = RoutingGraphBuilder::new(fixture.topology.snapshot());
		let lapic_last = builder
			.vertex_by_label(&RoutingNode::new(fixture.lapic.clone(), 0x3f))
			.unwrap();
		let owned_vector = builder
			.vertex_by_label(&RoutingNode::new(fixture.vectors.clone(), 0x3f))
			.unwrap();
		assert!(!builder.is_edge_allowed(lapic_last, owned_vector));
	}
}
