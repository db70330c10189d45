//! Monotonic timing.
//!
//! Adapters register their clock and event sources during boot;
//! [`initialize`] calibrates every stable-but-uncalibrated source
//! transitively against the best already-calibrated one and selects the
//! sources the rest of the kernel uses. [`enqueue_event`] and friends
//! sit on top of the [`queue::TimerQueue`] driving the selected per-CPU
//! one-shot event source.

pub mod clock;
pub mod queue;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use hermit_sync::OnceCell;

pub use clock::{
	ClockSource, ClockSourceFlags, EventCallback, EventSource, EventSourceFlags, FrequencyData,
	SourceState,
};
pub use queue::{EXPIRED_EVENT, EventHandle, TimerCallback, TimerQueue};

use crate::arch::irq;
use crate::synch::InterruptSpinMutex;

/// Minimum reference ticks a calibration comparison must span.
/// 100k ticks keeps the measurement in the microsecond range for every
/// plausible reference while staying far from a counter wrap.
pub const CALIBRATION_PRECISION: u64 = 100_000;

static CLOCK_SOURCES: InterruptSpinMutex<Vec<Arc<dyn ClockSource>>> =
	InterruptSpinMutex::new(Vec::new());
static EVENT_SOURCES: InterruptSpinMutex<Vec<Arc<dyn EventSource>>> =
	InterruptSpinMutex::new(Vec::new());

static BEST_CLOCK: InterruptSpinMutex<Option<Arc<dyn ClockSource>>> =
	InterruptSpinMutex::new(None);
static WATCHDOG_CLOCK: InterruptSpinMutex<Option<Arc<dyn ClockSource>>> =
	InterruptSpinMutex::new(None);
static BEST_EVENT_SOURCE: InterruptSpinMutex<Option<Arc<dyn EventSource>>> =
	InterruptSpinMutex::new(None);

pub fn register_clock_source(source: Arc<dyn ClockSource>) {
	debug!("registering clock source {}", source.name());
	CLOCK_SOURCES.lock().push(source);
}

pub fn register_event_source(source: Arc<dyn EventSource>) {
	debug!("registering event source {}", source.name());
	EVENT_SOURCES.lock().push(source);
}

struct TickComparison {
	reference_delta: u64,
	target_delta: u64,
}

fn past_minimum(value: u64, min_ticks: u64, init_ticks: u64, overflows: bool) -> bool {
	value >= min_ticks && (value < init_ticks || !overflows)
}

/// Sample both counters until each has advanced at least `min_ticks`,
/// accounting for a single wrap of either.
fn compare_timer_ticks(
	reference: &dyn ClockSource,
	target: &dyn ClockSource,
	min_ticks: u64,
) -> TickComparison {
	let _disabler = irq::InterruptDisabler::new();
	assert!(
		min_ticks < (reference.mask() >> 1),
		"min_ticks too large, risk of double wrap"
	);
	assert!(
		min_ticks < (target.mask() >> 1),
		"min_ticks too large, risk of double wrap"
	);

	let reference_init = reference.read();
	let target_init = target.read();
	let reference_min = reference_init.wrapping_add(min_ticks) & reference.mask();
	let target_min = target_init.wrapping_add(min_ticks) & target.mask();
	let reference_overflows = reference_min < reference_init;
	let target_overflows = target_min < target_init;

	let mut reference_value;
	let mut target_value;
	loop {
		reference_value = reference.read();
		target_value = target.read();
		if past_minimum(
			reference_value,
			reference_min,
			reference_init,
			reference_overflows,
		) && past_minimum(target_value, target_min, target_init, target_overflows)
		{
			break;
		}
		core::hint::spin_loop();
	}

	TickComparison {
		reference_delta: reference_value.wrapping_sub(reference_init) & reference.mask(),
		target_delta: target_value.wrapping_sub(target_init) & target.mask(),
	}
}

/// Transfer the reference's calibration onto `target` by measuring the
/// tick ratio between the two counters.
pub fn calibrate_clock_source(reference: &dyn ClockSource, target: &dyn ClockSource) {
	assert!(
		reference.has_stable_frequency(),
		"cannot calibrate off an unstable clock source"
	);
	assert!(
		reference.is_calibrated(),
		"cannot calibrate off an uncalibrated clock source"
	);
	let comparison = compare_timer_ticks(reference, target, CALIBRATION_PRECISION);
	let calibration = reference
		.calibration()
		.scaled_frequency(comparison.target_delta, comparison.reference_delta);
	target.set_calibration(calibration);
	debug!("calibrated clock source {}", target.name());
}

fn find_bootstrap_clock() -> Option<Arc<dyn ClockSource>> {
	let sources = CLOCK_SOURCES.lock();
	let mut best: Option<&Arc<dyn ClockSource>> = None;
	for source in sources.iter() {
		if source.is_calibrated() && source.has_stable_frequency() {
			if best.is_none_or(|b| source.quality() > b.quality()) {
				best = Some(source);
			}
		}
	}
	best.cloned()
}

fn find_best_watchdog_clock() -> Arc<dyn ClockSource> {
	let sources = CLOCK_SOURCES.lock();
	let mut best: Option<&Arc<dyn ClockSource>> = None;
	for source in sources.iter() {
		if source.has_stable_frequency() && best.is_none_or(|b| source.quality() > b.quality()) {
			best = Some(source);
		}
	}
	best.cloned().expect("no stable clock source found")
}

fn initialize_watchdog_clock() {
	let bootstrap = find_bootstrap_clock().expect("no bootstrap clock source found");
	let watchdog = find_best_watchdog_clock();
	if !watchdog.is_calibrated() {
		calibrate_clock_source(&*bootstrap, &*watchdog);
	}
	*WATCHDOG_CLOCK.lock() = Some(watchdog);
}

fn initialize_best_clock_source() {
	let best = {
		let sources = CLOCK_SOURCES.lock();
		let mut best: Option<&Arc<dyn ClockSource>> = None;
		for source in sources.iter() {
			if best.is_none_or(|b| source.quality() > b.quality()) {
				best = Some(source);
			}
		}
		best.cloned().expect("no clock source found")
	};
	if !best.is_calibrated() {
		let watchdog = WATCHDOG_CLOCK.lock().clone().unwrap();
		calibrate_clock_source(&*watchdog, &*best);
	}
	info!("selected clock source {}", best.name());
	*BEST_CLOCK.lock() = Some(best);
}

fn initialize_event_source() {
	let best = {
		let sources = EVENT_SOURCES.lock();
		let mut best: Option<&Arc<dyn EventSource>> = None;
		for source in sources.iter() {
			let better = match best {
				None => true,
				Some(b) => {
					source.quality() > b.quality() || (source.is_per_cpu() && !b.is_per_cpu())
				}
			};
			if better {
				best = Some(source);
			}
		}
		best.cloned().expect("no event source found")
	};
	info!("selected event source {}", best.name());
	*BEST_EVENT_SOURCE.lock() = Some(best);
}

/// Calibrate and select the system timing sources.
pub fn initialize() {
	initialize_watchdog_clock();
	initialize_best_clock_source();
	initialize_event_source();
}

pub fn clock_source() -> Arc<dyn ClockSource> {
	BEST_CLOCK
		.lock()
		.clone()
		.expect("timing not initialized")
}

pub fn event_source() -> Arc<dyn EventSource> {
	BEST_EVENT_SOURCE
		.lock()
		.clone()
		.expect("timing not initialized")
}

/// Monotonic time in nanoseconds since the selected clock's zero.
pub fn mono_time_ns() -> u64 {
	clock_source().read_ns()
}

pub fn mono_time_ms() -> u64 {
	mono_time_ns() / 1_000_000
}

/// Nanosecond stopwatch over the monotonic clock.
pub struct Stopwatch {
	start: u64,
}

impl Stopwatch {
	#[allow(clippy::new_without_default)]
	pub fn new() -> Self {
		Self {
			start: mono_time_ns(),
		}
	}

	pub fn elapsed_ns(&self) -> u64 {
		mono_time_ns() - self.start
	}

	pub fn elapsed_us(&self) -> u64 {
		self.elapsed_ns() / 1_000
	}

	pub fn elapsed_ms(&self) -> u64 {
		self.elapsed_ns() / 1_000_000
	}

	pub fn reset(&mut self) {
		self.start = mono_time_ns();
	}

	pub fn lap(&mut self) -> u64 {
		let elapsed = self.elapsed_ns();
		self.start += elapsed;
		elapsed
	}
}

static TIMER_QUEUE: OnceCell<TimerQueue> = OnceCell::new();

fn timer_queue_tick() {
	if let Some(queue) = TIMER_QUEUE.get() {
		queue.flush_expired_events();
	}
}

/// Create the global timer queue on the selected sources and hook it to
/// the event source's interrupt.
pub fn init_timer_queue() {
	let source = event_source();
	source.register_callback(timer_queue_tick);
	TIMER_QUEUE
		.set(TimerQueue::new(clock_source(), source))
		.ok()
		.expect("timer queue initialized twice");
}

fn timer_queue() -> &'static TimerQueue {
	TIMER_QUEUE.get().expect("timer queue not initialized")
}

/// Default coalescing slack for [`enqueue_event`]: callbacks may fire
/// up to 100 µs past their preferred deadline.
pub const DEFAULT_LATE_TOLERANCE_NS: u64 = 100_000;

/// Queue `callback` to run after `delay_ms` milliseconds, within the
/// given tolerances (in nanoseconds, the queue's native unit). Events
/// whose windows overlap are coalesced onto one hardware deadline.
pub fn enqueue_event_with_tolerance(
	callback: TimerCallback,
	delay_ms: u64,
	late_tolerance_ns: u64,
	early_tolerance_ns: u64,
) -> EventHandle {
	let queue = timer_queue();
	queue.enqueue(
		callback,
		queue.now_ns() + delay_ms * 1_000_000,
		late_tolerance_ns,
		early_tolerance_ns,
	)
}

pub fn enqueue_event(callback: TimerCallback, delay_ms: u64) -> EventHandle {
	enqueue_event_with_tolerance(callback, delay_ms, DEFAULT_LATE_TOLERANCE_NS, 0)
}

pub fn cancel_event(handle: EventHandle) -> bool {
	timer_queue().cancel(handle)
}

/// Halt the CPU until at least `ms` milliseconds have passed.
pub fn blocking_sleep(ms: u64) {
	let sleeping = Arc::new(AtomicBool::new(true));
	let flag = Arc::clone(&sleeping);
	enqueue_event(
		alloc::boxed::Box::new(move || flag.store(false, Ordering::Release)),
		ms,
	);
	while sleeping.load(Ordering::Acquire) {
		irq::enable_and_wait();
	}
}

/// Busy-wait for `ns` nanoseconds.
pub fn sleep_ns(ns: u64) {
	let deadline = mono_time_ns() + ns;
	while mono_time_ns() < deadline {
		core::hint::spin_loop();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicU64, Ordering};

	use super::clock::*;
	use super::*;

	/// A counter that advances by a fixed step on every read, so a
	/// calibration comparison terminates deterministically.
	struct SteppingClock {
		value: AtomicU64,
		step: u64,
		mask: u64,
		calibration: SourceState,
		flags: ClockSourceFlags,
	}

	impl SteppingClock {
		fn new(step: u64, calibration: Option<FrequencyData>) -> Arc<Self> {
			let state = match calibration {
				Some(data) => SourceState::calibrated(data),
				None => SourceState::new(),
			};
			Arc::new(Self {
				value: AtomicU64::new(0),
				step,
				mask: u64::MAX,
				calibration: state,
				flags: ClockSourceFlags::FIXED_FREQUENCY,
			})
		}
	}

	impl ClockSource for SteppingClock {
		fn name(&self) -> &'static str {
			"stepping-clock"
		}

		fn mask(&self) -> u64 {
			self.mask
		}

		fn flags(&self) -> ClockSourceFlags {
			self.flags
		}

		fn quality(&self) -> u16 {
			100
		}

		fn calibration(&self) -> FrequencyData {
			self.calibration.calibration()
		}

		fn set_calibration(&self, data: FrequencyData) {
			self.calibration.set_calibration(data);
		}

		fn read(&self) -> u64 {
			self.value.fetch_add(self.step, Ordering::Relaxed) & self.mask
		}
	}

	#[test]
	fn calibration_transfers_the_tick_ratio() {
		// Reference at 1 GHz; the target counts three ticks for each
		// reference tick, so it must calibrate to ~3 GHz.
		let reference = SteppingClock::new(64, Some(FrequencyData::from_ghz(1)));
		let target = SteppingClock::new(192, None);
		assert!(!target.is_calibrated());

		calibrate_clock_source(&*reference, &*target);
		assert!(target.is_calibrated());

		let measured = target.calibration().nanos_to_ticks(1_000_000);
		let expected = 3_000_000;
		let error = measured.abs_diff(expected);
		assert!(
			error <= expected / 1000,
			"ratio off by more than 0.1%: {measured}"
		);
	}

	#[test]
	fn comparison_tolerates_a_counter_wrap() {
		let reference = SteppingClock::new(1000, Some(FrequencyData::from_ghz(1)));
		// 24-bit target counter positioned just before its wrap.
		let target = Arc::new(SteppingClock {
			value: AtomicU64::new((1 << 24) - 50_000),
			step: 1000,
			mask: (1 << 24) - 1,
			calibration: SourceState::new(),
			flags: ClockSourceFlags::FIXED_FREQUENCY,
		});

		calibrate_clock_source(&*reference, &*target);
		let measured = target.calibration().nanos_to_ticks(1_000_000);
		let error = measured.abs_diff(1_000_000);
		assert!(error <= 2_000, "wrap mishandled: {measured}");
	}
}
