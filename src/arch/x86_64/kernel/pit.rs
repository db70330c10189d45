//! Programmable interval timer (8253/8254) event source.
//!
//! The PIT is the calibration workhorse: fixed 1.193182 MHz input, so
//! it needs no calibration itself and anchors the transitive
//! calibration chain when the HPET is absent.

use alloc::sync::Arc;

use hermit_sync::SpinMutex;
use x86_64::instructions::port::Port;

use super::apic;
use crate::interrupts::domain::{AffineConnector, InterruptDomain, InterruptEmitter};
use crate::interrupts::{self, DomainRef, InterruptSourceHandle};
use crate::time::{
	self, EventCallback, EventSource, EventSourceFlags, FrequencyData, SourceState,
};

pub const PIT_FREQUENCY_HZ: u64 = 1_193_182;

const PIT_CHANNEL0_DATA_PORT: u16 = 0x40;
const PIT_COMMAND_PORT: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, interrupt-on-terminal-count.
const PIT_ONESHOT_COMMAND: u8 = 0x30;
/// Channel 0, lobyte/hibyte access, rate generator.
const PIT_PERIODIC_COMMAND: u8 = 0x34;
/// Latch channel 0.
const PIT_LATCH_COMMAND: u8 = 0x00;

const PIT_MAX_RELOAD: u64 = 0x1_0000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum PitMode {
	Uninitialized,
	Oneshot,
	Periodic,
}

struct PitRegs {
	mode: PitMode,
	reload: u64,
}

/// Pure emitter for the PIT output line, wired into the legacy IRQ
/// domain at IRQ 0.
pub struct PitInterruptDomain;

impl InterruptDomain for PitInterruptDomain {
	fn name(&self) -> &'static str {
		"pit"
	}

	fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
		Some(self)
	}
}

impl InterruptEmitter for PitInterruptDomain {
	fn emitter_count(&self) -> usize {
		1
	}
}

pub struct PitEventSource {
	state: SourceState,
	regs: SpinMutex<PitRegs>,
}

impl PitEventSource {
	const FLAGS: EventSourceFlags = EventSourceFlags::FIXED_FREQUENCY
		.union(EventSourceFlags::KNOWN_STABLE)
		.union(EventSourceFlags::ONESHOT)
		.union(EventSourceFlags::PERIODIC)
		.union(EventSourceFlags::TRACKS_INTERMEDIATE_TIME);

	fn new() -> Self {
		Self {
			state: SourceState::calibrated(FrequencyData::from_hz(PIT_FREQUENCY_HZ)),
			regs: SpinMutex::new(PitRegs {
				mode: PitMode::Uninitialized,
				reload: 0,
			}),
		}
	}

	fn ensure_mode(regs: &mut PitRegs, mode: PitMode) {
		assert!(mode != PitMode::Uninitialized);
		if regs.mode == mode {
			return;
		}
		let command = if mode == PitMode::Oneshot {
			PIT_ONESHOT_COMMAND
		} else {
			PIT_PERIODIC_COMMAND
		};
		unsafe {
			Port::<u8>::new(PIT_COMMAND_PORT).write(command);
		}
		regs.mode = mode;
	}

	fn set_reload(regs: &mut PitRegs, value: u64) {
		assert!(value <= PIT_MAX_RELOAD, "PIT reload value out of range");
		regs.reload = value;
		// A reload of 0x10000 is programmed as 0.
		let raw = (value & 0xffff) as u16;
		let mut data = Port::<u8>::new(PIT_CHANNEL0_DATA_PORT);
		unsafe {
			data.write(raw as u8);
			data.write((raw >> 8) as u8);
		}
	}
}

impl EventSource for PitEventSource {
	fn name(&self) -> &'static str {
		"PIT"
	}

	fn flags(&self) -> EventSourceFlags {
		Self::FLAGS
	}

	fn quality(&self) -> u16 {
		100
	}

	fn calibration(&self) -> FrequencyData {
		self.state.calibration()
	}

	fn set_calibration(&self, data: FrequencyData) {
		self.state.set_calibration(data);
	}

	fn register_callback(&self, callback: EventCallback) {
		self.state.set_callback(callback);
	}

	fn arm_oneshot(&self, delta_ticks: u64) {
		let mut regs = self.regs.lock();
		Self::ensure_mode(&mut regs, PitMode::Oneshot);
		Self::set_reload(&mut regs, delta_ticks.min(PIT_MAX_RELOAD));
	}

	fn arm_periodic(&self, period_ticks: u64) {
		let mut regs = self.regs.lock();
		Self::ensure_mode(&mut regs, PitMode::Periodic);
		Self::set_reload(&mut regs, period_ticks.min(PIT_MAX_RELOAD));
	}

	fn disarm(&self) {
		// The PIT has no disable bit; parking it in one-shot mode with
		// the maximum reload keeps it quiet for ~55 ms at a time, which
		// the spurious-delivery path tolerates.
		let mut regs = self.regs.lock();
		Self::ensure_mode(&mut regs, PitMode::Oneshot);
		Self::set_reload(&mut regs, PIT_MAX_RELOAD);
	}

	fn ticks_elapsed(&self) -> u64 {
		let regs = self.regs.lock();
		unsafe {
			Port::<u8>::new(PIT_COMMAND_PORT).write(PIT_LATCH_COMMAND);
		}
		let mut data = Port::<u8>::new(PIT_CHANNEL0_DATA_PORT);
		let low = unsafe { data.read() } as u64;
		let high = unsafe { data.read() } as u64;
		let mut count = low | (high << 8);
		if count == 0 {
			count = PIT_MAX_RELOAD;
		}
		regs.reload.saturating_sub(count)
	}

	fn max_oneshot_delay(&self) -> u64 {
		PIT_MAX_RELOAD
	}

	fn max_period(&self) -> u64 {
		PIT_MAX_RELOAD
	}
}

/// Register the PIT: its emitter domain, the connector into the legacy
/// IRQ domain, its interrupt handler, and the event source itself.
pub fn init_pit() {
	let domain = DomainRef::new(PitInterruptDomain);
	interrupts::register_domain(domain.clone());
	let irq_domain = apic::irq_domain();
	interrupts::register_connector(Arc::new(AffineConnector::new(
		domain.clone(),
		irq_domain,
		0,
		0,
		1,
	)));

	let source = Arc::new(PitEventSource::new());
	let for_handler = Arc::clone(&source);
	interrupts::register_handler(
		&InterruptSourceHandle::new(domain, 0),
		alloc::boxed::Box::new(move |_frame| for_handler.state.invoke_callback()),
	);
	time::register_event_source(source);
}
