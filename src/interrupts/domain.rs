//! Interrupt domains and domain connectors.
//!
//! A domain is a piece of hardware (or a purely logical construct) that
//! emits and/or receives interrupt lines. Capabilities are modeled as
//! separately queryable facets on the base trait so that a cast is O(1)
//! and a domain can implement any subset; the routable refinements form
//! a sum type, [`RoutingRule`], dispatched on by the routing core.

use alloc::sync::Arc;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::ops::Deref;

use super::InterruptFrame;
use super::routing::RoutingGraphBuilder;

/// How an interrupt line is signaled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ActivationType {
	EdgeHigh,
	EdgeLow,
	LevelHigh,
	LevelLow,
}

impl ActivationType {
	pub fn from_level_and_polarity(level_triggered: bool, active_low: bool) -> Self {
		match (level_triggered, active_low) {
			(false, false) => Self::EdgeHigh,
			(false, true) => Self::EdgeLow,
			(true, false) => Self::LevelHigh,
			(true, true) => Self::LevelLow,
		}
	}

	pub fn is_level_triggered(self) -> bool {
		matches!(self, Self::LevelHigh | Self::LevelLow)
	}

	pub fn is_active_low(self) -> bool {
		matches!(self, Self::EdgeLow | Self::LevelLow)
	}
}

/// Base trait of every interrupt domain.
///
/// The `as_*` accessors return the capability facets this domain
/// implements. The default implementations declare nothing; adapters
/// override exactly the facets their hardware has.
pub trait InterruptDomain: Send + Sync {
	fn name(&self) -> &'static str;

	fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
		None
	}

	fn as_receiver(&self) -> Option<&dyn InterruptReceiver> {
		None
	}

	fn as_routable(&self) -> Option<&dyn RoutableDomain> {
		None
	}

	fn as_maskable(&self) -> Option<&dyn MaskableDomain> {
		None
	}

	fn as_eoi(&self) -> Option<&dyn EoiDomain> {
		None
	}

	fn as_activation_config(&self) -> Option<&dyn ConfigurableActivationTypeDomain> {
		None
	}

	/// Whether this domain is the CPU interrupt vector file, the
	/// receiver at the top of every routing path.
	fn is_vector_file(&self) -> bool {
		false
	}
}

/// The domain drives `emitter_count` output lines, indexed from 0.
pub trait InterruptEmitter {
	fn emitter_count(&self) -> usize;
}

/// The domain accepts `receiver_count` input lines, indexed from 0.
pub trait InterruptReceiver {
	fn receiver_count(&self) -> usize;
}

/// A receiver-and-emitter domain that can map inputs to outputs.
pub trait RoutableDomain: InterruptEmitter + InterruptReceiver {
	fn routing_rule(&self) -> RoutingRule<'_>;

	/// Program the hardware to forward `from_receiver` to `to_emitter`.
	fn route_interrupt(&self, from_receiver: usize, to_emitter: usize) -> bool;
}

/// The legality model of a routable domain.
pub enum RoutingRule<'a> {
	/// Any (input, output) pair is legal.
	Free,
	/// Legality of each pair is independent of other routing choices.
	ContextIndependent(&'a dyn ContextIndependentRouting),
	/// Legality may depend on the routing decisions made so far.
	ContextDependent(&'a dyn ContextDependentRouting),
	/// The mapping is a baked-in function of the input index.
	Fixed(&'a dyn FixedRouting),
}

pub trait ContextIndependentRouting {
	fn is_routing_allowed(&self, from_receiver: usize, to_emitter: usize) -> bool;
}

pub trait ContextDependentRouting {
	fn is_routing_allowed(
		&self,
		from_receiver: usize,
		to_emitter: usize,
		routing: &RoutingGraphBuilder,
	) -> bool;
}

pub trait FixedRouting {
	fn emitter_for(&self, receiver: usize) -> usize;
}

/// Per-receiver masking.
pub trait MaskableDomain {
	fn set_receiver_mask(&self, receiver: usize, masked: bool);
	fn is_receiver_masked(&self, receiver: usize) -> bool;
}

/// The domain participates in end-of-interrupt signaling.
pub trait EoiDomain {
	fn issue_eoi(&self, frame: &InterruptFrame);
}

/// Per-receiver activation type configuration.
pub trait ConfigurableActivationTypeDomain {
	fn set_activation_type(&self, receiver: usize, activation: ActivationType);
	/// `None` when the line has not been configured yet.
	fn activation_type(&self, receiver: usize) -> Option<ActivationType>;
}

/// Shared, cheaply clonable handle to a registered domain.
///
/// Equality and hashing are by identity: two handles are equal exactly
/// when they refer to the same domain instance.
#[derive(Clone)]
pub struct DomainRef(Arc<dyn InterruptDomain>);

impl DomainRef {
	pub fn new<D: InterruptDomain + 'static>(domain: D) -> Self {
		Self(Arc::new(domain))
	}

	pub fn from_arc(domain: Arc<dyn InterruptDomain>) -> Self {
		Self(domain)
	}

	fn addr(&self) -> usize {
		Arc::as_ptr(&self.0).cast::<()>() as usize
	}
}

impl Deref for DomainRef {
	type Target = dyn InterruptDomain;

	fn deref(&self) -> &Self::Target {
		&*self.0
	}
}

impl PartialEq for DomainRef {
	fn eq(&self, other: &Self) -> bool {
		self.addr() == other.addr()
	}
}

impl Eq for DomainRef {}

impl Hash for DomainRef {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.addr().hash(state);
	}
}

impl fmt::Debug for DomainRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{:#x}", self.0.name(), self.addr())
	}
}

/// Connects a source domain's emitter side to a target domain's
/// receiver side through two partial index maps.
pub trait Connector: Send + Sync {
	fn source(&self) -> DomainRef;
	fn target(&self) -> DomainRef;

	/// Target input reached by the given source output, if any.
	fn from_output(&self, output: usize) -> Option<usize>;

	/// Source output feeding the given target input, if any.
	fn from_input(&self, input: usize) -> Option<usize>;
}

pub type ConnectorRef = Arc<dyn Connector>;

/// Connector mapping outputs `[start, start + width)` to inputs offset
/// by a constant.
pub struct AffineConnector {
	source: DomainRef,
	target: DomainRef,
	offset: usize,
	start: usize,
	width: usize,
}

impl AffineConnector {
	pub fn new(source: DomainRef, target: DomainRef, offset: usize, start: usize, width: usize) -> Self {
		let emitter = source.as_emitter().expect("connector source must be an emitter");
		let receiver = target
			.as_receiver()
			.expect("connector target must be a receiver");
		assert!(
			start + offset + width <= receiver.receiver_count(),
			"connector offset out of bounds"
		);
		assert!(
			start + width <= emitter.emitter_count(),
			"connector too wide"
		);
		Self {
			source,
			target,
			offset,
			start,
			width,
		}
	}
}

impl Connector for AffineConnector {
	fn source(&self) -> DomainRef {
		self.source.clone()
	}

	fn target(&self) -> DomainRef {
		self.target.clone()
	}

	fn from_output(&self, output: usize) -> Option<usize> {
		if output < self.start || output >= self.start + self.width {
			return None;
		}
		Some(output + self.offset)
	}

	fn from_input(&self, input: usize) -> Option<usize> {
		let output = input.checked_sub(self.offset)?;
		if output < self.start || output >= self.start + self.width {
			return None;
		}
		Some(output)
	}
}

/// The receiver at the top of every routing path: one input per CPU
/// interrupt vector.
pub struct CpuVectorFile {
	width: usize,
}

impl CpuVectorFile {
	pub fn new(width: usize) -> Self {
		Self { width }
	}
}

impl InterruptDomain for CpuVectorFile {
	fn name(&self) -> &'static str {
		"cpu-vector-file"
	}

	fn as_receiver(&self) -> Option<&dyn InterruptReceiver> {
		Some(self)
	}

	fn is_vector_file(&self) -> bool {
		true
	}
}

impl InterruptReceiver for CpuVectorFile {
	fn receiver_count(&self) -> usize {
		self.width
	}
}
