//! Processor identity.
//!
//! The SMP bring-up code owns the per-CPU data area; this module only
//! needs to know how many logical processors exist and which one is
//! executing. Both are provided by boot glue.

use core::mem;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Guaranteed upper bound on the number of logical processors.
pub const MAX_PROCESSOR_COUNT: usize = 256;

static PROCESSOR_COUNT: AtomicU32 = AtomicU32::new(1);
static CORE_ID_PROVIDER: AtomicUsize = AtomicUsize::new(0);

/// Number of logical processors, as reported by boot glue.
#[inline]
pub fn processor_count() -> u32 {
	PROCESSOR_COUNT.load(Ordering::Relaxed)
}

pub fn set_processor_count(count: u32) {
	assert!(count >= 1 && count as usize <= MAX_PROCESSOR_COUNT);
	PROCESSOR_COUNT.store(count, Ordering::Relaxed);
}

/// Id of the executing processor, in `0..processor_count()`.
///
/// Before SMP bring-up registers a provider, everything runs on the boot
/// processor and the id is 0.
#[inline]
pub fn core_id() -> u32 {
	let raw = CORE_ID_PROVIDER.load(Ordering::Relaxed);
	if raw == 0 {
		return 0;
	}
	let provider: fn() -> u32 = unsafe { mem::transmute(raw) };
	provider()
}

pub fn set_core_id_provider(provider: fn() -> u32) {
	CORE_ID_PROVIDER.store(provider as usize, Ordering::Relaxed);
}
