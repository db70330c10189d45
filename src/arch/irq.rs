//! Interrupt-flag manipulation.
//!
//! On hosted targets (where the unit tests run) the interrupt flag is
//! simulated by an atomic so that the interrupt-masking locks work
//! unchanged.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
	pub use x86_64::instructions::hlt;
	pub use x86_64::instructions::interrupts::{are_enabled, disable, enable, enable_and_hlt};
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
	use core::sync::atomic::{AtomicBool, Ordering};

	static ENABLED: AtomicBool = AtomicBool::new(true);

	pub fn are_enabled() -> bool {
		ENABLED.load(Ordering::Relaxed)
	}

	pub fn enable() {
		ENABLED.store(true, Ordering::Relaxed);
	}

	pub fn disable() {
		ENABLED.store(false, Ordering::Relaxed);
	}

	pub fn enable_and_hlt() {
		enable();
		core::hint::spin_loop();
	}

	pub fn hlt() {
		core::hint::spin_loop();
	}
}

pub use imp::{are_enabled, disable, enable};

/// Disable interrupts, returning whether they were enabled before.
#[inline]
pub fn nested_disable() -> bool {
	let was_enabled = imp::are_enabled();
	imp::disable();
	was_enabled
}

/// Restore the interrupt flag saved by [`nested_disable`].
#[inline]
pub fn nested_enable(was_enabled: bool) {
	if was_enabled {
		imp::enable();
	}
}

/// Enable interrupts and wait for the next one.
#[inline]
pub fn enable_and_wait() {
	imp::enable_and_hlt();
}

/// Wait for the next interrupt without touching the interrupt flag.
#[inline]
pub fn halt() {
	imp::hlt();
}

/// RAII guard that masks interrupts for its lifetime.
pub struct InterruptDisabler {
	was_enabled: bool,
}

impl InterruptDisabler {
	#[allow(clippy::new_without_default)]
	pub fn new() -> Self {
		Self {
			was_enabled: nested_disable(),
		}
	}
}

impl Drop for InterruptDisabler {
	fn drop(&mut self) {
		nested_enable(self.was_enabled);
	}
}
