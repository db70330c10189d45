//! CPU-side interrupt plumbing: the vector file, the exception vector
//! domain, per-vector statistics, and the dispatch entry point the IDT
//! stubs call into.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;

use crate::interrupts::domain::{AffineConnector, InterruptDomain, InterruptEmitter};
use crate::interrupts::{self, CPU_INTERRUPT_COUNT, DomainRef, InterruptFrame};
use crate::synch::InterruptSpinMutex;

/// Vectors 0..32 are architectural exceptions.
pub const EXCEPTION_VECTOR_COUNT: usize = 32;

/// Pure emitter covering the CPU exception vectors. Registered with an
/// exclusive connector so no routing policy can hand a device one of
/// the low 32 vectors.
pub struct ExceptionVectorDomain {
	vector_count: usize,
}

impl InterruptDomain for ExceptionVectorDomain {
	fn name(&self) -> &'static str {
		"cpu-exceptions"
	}

	fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
		Some(self)
	}
}

impl InterruptEmitter for ExceptionVectorDomain {
	fn emitter_count(&self) -> usize {
		self.vector_count
	}
}

/// Set up the vector file and claim the exception vectors. Called once
/// during boot, before any other domain registers.
pub fn install_vector_file() {
	assert!(
		interrupts::setup_cpu_interrupt_vector_file(CPU_INTERRUPT_COUNT),
		"vector file set up twice"
	);
	let exceptions = DomainRef::new(ExceptionVectorDomain {
		vector_count: EXCEPTION_VECTOR_COUNT,
	});
	interrupts::register_domain(exceptions.clone());
	let claimed = interrupts::register_exclusive_connector(Arc::new(AffineConnector::new(
		exceptions,
		interrupts::cpu_interrupt_vectors(),
		0,
		0,
		EXCEPTION_VECTOR_COUNT,
	)));
	assert!(claimed, "exception vectors already claimed");
}

/// Per-vector delivery counters.
#[repr(align(64))]
pub struct IrqStatistics {
	counters: [AtomicU64; CPU_INTERRUPT_COUNT],
}

impl IrqStatistics {
	const fn new() -> Self {
		#[allow(clippy::declare_interior_mutable_const)]
		const ZERO: AtomicU64 = AtomicU64::new(0);
		Self {
			counters: [ZERO; CPU_INTERRUPT_COUNT],
		}
	}

	pub fn inc(&self, vector: usize) {
		self.counters[vector].fetch_add(1, Ordering::Relaxed);
	}

	pub fn get(&self, vector: usize) -> u64 {
		self.counters[vector].load(Ordering::Relaxed)
	}
}

pub static IRQ_COUNTERS: IrqStatistics = IrqStatistics::new();

pub fn increment_irq_counter(vector: u8) {
	IRQ_COUNTERS.inc(vector as usize);
}

static IRQ_NAMES: InterruptSpinMutex<Option<HashMap<u8, &'static str, RandomState>>> =
	InterruptSpinMutex::new(None);

pub fn add_irq_name(vector: u8, name: &'static str) {
	debug!("Register name \"{name}\" for interrupt {vector}");
	IRQ_NAMES
		.lock()
		.get_or_insert_with(|| HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)))
		.insert(vector, name);
}

pub fn get_irq_name(vector: u8) -> Option<&'static str> {
	IRQ_NAMES.lock().as_ref()?.get(&vector).copied()
}

/// Entry point for the IDT stubs: count the delivery and hand the frame
/// to the routed dispatch path.
pub fn dispatch(vector: u8) {
	increment_irq_counter(vector);
	let frame = InterruptFrame { vector };
	interrupts::dispatch_interrupt(&frame);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn statistics_count_per_vector() {
		let stats = IrqStatistics::new();
		stats.inc(0x21);
		stats.inc(0x21);
		stats.inc(0xff);
		assert_eq!(stats.get(0x21), 2);
		assert_eq!(stats.get(0xff), 1);
		assert_eq!(stats.get(0x20), 0);
	}

	#[test]
	fn irq_names_round_trip() {
		add_irq_name(0x31, "test-uart");
		assert_eq!(get_irq_name(0x31), Some("test-uart"));
		assert_eq!(get_irq_name(0x32), None);
	}
}
