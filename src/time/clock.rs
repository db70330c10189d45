//! Clock and event sources.
//!
//! A clock source is a monotonically counting register; an event source
//! can fire an interrupt after a programmed delay. Both carry quality
//! and stability metadata so the registry can pick the best available
//! hardware and calibrate the rest transitively.

use bitflags::bitflags;
use hermit_sync::SpinMutex;

/// Fixed-point frequency representation: `freq` is `hz << 64 / 1e9`
/// (ticks per nanosecond, Q64), `period` its reciprocal. Conversions
/// are a multiply keeping the high 64 bits.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct FrequencyData {
	freq: u128,
	period: u128,
}

impl FrequencyData {
	pub const fn uncalibrated() -> Self {
		Self { freq: 0, period: 0 }
	}

	fn from_scaled(freq: u128) -> Self {
		assert!(freq != 0, "zero frequency");
		// 2^128 / freq, computed without overflowing u128.
		let period = (1u128 << 127) / (freq >> 1);
		Self { freq, period }
	}

	pub fn from_hz(hz: u64) -> Self {
		Self::from_scaled(((hz as u128) << 64) / 1_000_000_000)
	}

	pub fn from_khz(khz: u64) -> Self {
		Self::from_scaled(((khz as u128) << 64) / 1_000_000)
	}

	pub fn from_mhz(mhz: u64) -> Self {
		Self::from_scaled(((mhz as u128) << 64) / 1_000)
	}

	pub fn from_ghz(ghz: u64) -> Self {
		Self::from_scaled((ghz as u128) << 64)
	}

	/// From a period in femtoseconds (the HPET reports its period this
	/// way).
	pub fn from_period_fs(fs: u64) -> Self {
		Self::from_scaled(((1_000_000u128) << 64) / fs as u128)
	}

	pub fn from_period_ns(ns: u64) -> Self {
		Self::from_scaled((1u128 << 64) / ns as u128)
	}

	pub fn is_populated(&self) -> bool {
		self.freq != 0
	}

	pub fn nanos_to_ticks(&self, nanos: u64) -> u64 {
		((nanos as u128 * self.freq) >> 64) as u64
	}

	pub fn ticks_to_nanos(&self, ticks: u64) -> u64 {
		((ticks as u128 * self.period) >> 64) as u64
	}

	/// This frequency scaled by `num / denom`, for transferring a
	/// calibration across a measured tick ratio.
	pub fn scaled_frequency(&self, num: u64, denom: u64) -> Self {
		let bits_used = 128 - (num as u128).leading_zeros() + 128 - self.freq.leading_zeros();
		assert!(bits_used < 127, "calibration might overflow");
		Self::from_scaled(self.freq * num as u128 / denom as u128)
	}
}

bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct ClockSourceFlags: u8 {
		const FIXED_FREQUENCY = 1 << 0;
		const PER_CPU = 1 << 1;
		/// Frequency is stable but still needs calibration (e.g. the
		/// LAPIC timer).
		const KNOWN_STABLE = 1 << 2;
	}
}

bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct EventSourceFlags: u8 {
		const FIXED_FREQUENCY = 1 << 0;
		const PER_CPU = 1 << 1;
		const KNOWN_STABLE = 1 << 2;
		const ONESHOT = 1 << 3;
		const PERIODIC = 1 << 4;
		/// Stops counting in C3 or deeper sleep states.
		const STOPS_IN_SLEEP = 1 << 5;
		/// `ticks_elapsed` is implemented.
		const TRACKS_INTERMEDIATE_TIME = 1 << 6;
	}
}

pub trait ClockSource: Send + Sync {
	fn name(&self) -> &'static str;

	/// Counter width mask (`u64::MAX` for a full 64-bit counter).
	fn mask(&self) -> u64;

	fn flags(&self) -> ClockSourceFlags;

	fn quality(&self) -> u16;

	fn calibration(&self) -> FrequencyData;

	fn set_calibration(&self, data: FrequencyData);

	/// Raw monotonic counter value.
	fn read(&self) -> u64;

	fn has_stable_frequency(&self) -> bool {
		self.flags()
			.intersects(ClockSourceFlags::FIXED_FREQUENCY | ClockSourceFlags::KNOWN_STABLE)
	}

	fn is_per_cpu(&self) -> bool {
		self.flags().contains(ClockSourceFlags::PER_CPU)
	}

	fn is_calibrated(&self) -> bool {
		self.calibration().is_populated()
	}

	fn read_ns(&self) -> u64 {
		self.calibration().ticks_to_nanos(self.read() & self.mask())
	}
}

/// Callback invoked from the event source's interrupt handler.
pub type EventCallback = fn();

pub trait EventSource: Send + Sync {
	fn name(&self) -> &'static str;

	fn flags(&self) -> EventSourceFlags;

	fn quality(&self) -> u16;

	fn calibration(&self) -> FrequencyData;

	fn set_calibration(&self, data: FrequencyData);

	fn register_callback(&self, callback: EventCallback);

	fn arm_oneshot(&self, delta_ticks: u64);

	fn arm_periodic(&self, period_ticks: u64);

	fn disarm(&self);

	/// Ticks since the last arm, for sources that track it.
	fn ticks_elapsed(&self) -> u64;

	fn max_oneshot_delay(&self) -> u64;

	fn max_period(&self) -> u64;

	fn supports_oneshot(&self) -> bool {
		self.flags().contains(EventSourceFlags::ONESHOT)
	}

	fn supports_periodic(&self) -> bool {
		self.flags().contains(EventSourceFlags::PERIODIC)
	}

	fn is_per_cpu(&self) -> bool {
		self.flags().contains(EventSourceFlags::PER_CPU)
	}

	fn has_stable_frequency(&self) -> bool {
		self.flags()
			.intersects(EventSourceFlags::FIXED_FREQUENCY | EventSourceFlags::KNOWN_STABLE)
	}

	fn is_calibrated(&self) -> bool {
		self.calibration().is_populated()
	}
}

/// Interior-mutable bookkeeping shared by the source adapters.
pub struct SourceState {
	calibration: SpinMutex<FrequencyData>,
	callback: SpinMutex<Option<EventCallback>>,
}

impl SourceState {
	pub const fn new() -> Self {
		Self {
			calibration: SpinMutex::new(FrequencyData::uncalibrated()),
			callback: SpinMutex::new(None),
		}
	}

	pub fn calibrated(data: FrequencyData) -> Self {
		Self {
			calibration: SpinMutex::new(data),
			callback: SpinMutex::new(None),
		}
	}

	pub fn calibration(&self) -> FrequencyData {
		*self.calibration.lock()
	}

	pub fn set_calibration(&self, data: FrequencyData) {
		*self.calibration.lock() = data;
	}

	pub fn set_callback(&self, callback: EventCallback) {
		*self.callback.lock() = Some(callback);
	}

	pub fn invoke_callback(&self) {
		let callback = *self.callback.lock();
		if let Some(callback) = callback {
			callback();
		}
	}
}

impl Default for SourceState {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ghz_conversions_are_exact() {
		let freq = FrequencyData::from_ghz(1);
		assert_eq!(freq.nanos_to_ticks(1000), 1000);
		assert_eq!(freq.ticks_to_nanos(1000), 1000);

		let freq = FrequencyData::from_hz(1_000_000_000);
		assert_eq!(freq.nanos_to_ticks(12_345), 12_345);
	}

	#[test]
	fn round_trip_error_is_bounded() {
		// 24 MHz: 1 tick ~ 41.67 ns.
		let freq = FrequencyData::from_mhz(24);
		for ticks in [1u64, 7, 1000, 123_456_789] {
			let ns = freq.ticks_to_nanos(ticks);
			let back = freq.nanos_to_ticks(ns);
			assert!(back <= ticks);
			assert!(ticks - back <= 1, "error exceeds a tick: {ticks} -> {back}");
		}
	}

	#[test]
	fn period_and_frequency_agree() {
		// HPET at 100 ns period = 10 MHz.
		let by_period = FrequencyData::from_period_fs(100_000_000);
		let by_freq = FrequencyData::from_mhz(10);
		assert_eq!(by_period.nanos_to_ticks(1_000_000), by_freq.nanos_to_ticks(1_000_000));
	}

	#[test]
	fn scaling_transfers_a_ratio() {
		let reference = FrequencyData::from_ghz(1);
		// Target ran 3 ticks per reference tick.
		let target = reference.scaled_frequency(300, 100);
		assert_eq!(target.nanos_to_ticks(1000), 3000);
	}
}
