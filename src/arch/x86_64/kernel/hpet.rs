//! High-precision event timer.
//!
//! The HPET contributes three things: a stable fixed-frequency clock
//! source (the main counter), one event source per comparator that can
//! reach the I/O APIC, and a context-independent routing domain
//! describing which I/O APIC lines each comparator may use (its
//! interrupt route capabilities mask).

use alloc::sync::Arc;
use alloc::vec::Vec;

use hermit_sync::SpinMutex;
use memory_addresses::{PhysAddr, VirtAddr};

use super::{MmioMapper, apic};
use crate::interrupts::domain::{
	AffineConnector, Connector, InterruptDomain, InterruptEmitter, InterruptReceiver,
	RoutableDomain, RoutingRule,
};
use crate::interrupts::{self, DomainRef, InterruptSourceHandle};
use crate::time::{
	self, ClockSource, ClockSourceFlags, EventCallback, EventSource, EventSourceFlags,
	FrequencyData, SourceState,
};

/// Parsed ACPI HPET table contents.
#[derive(Clone, Copy, Debug)]
pub struct HpetInfo {
	pub base_address: u64,
	/// Address-space flag: the base must sit in system memory.
	pub in_system_memory: bool,
}

/// Largest legal main-counter period (100 ns) in femtoseconds.
const MAXIMUM_CLOCK_PERIOD_FS: u32 = 0x05f5_e100;

const REG_DEVICE_INFO: usize = 0x00;
const REG_CLOCK_PERIOD: usize = 0x04;
const REG_GENERAL_CONFIG: usize = 0x10;
const REG_INTERRUPT_STATUS: usize = 0x20;
const REG_MAIN_COUNTER: usize = 0xf0;
const COMPARATOR_BASE: usize = 0x100;
const COMPARATOR_STRIDE: usize = 0x20;
const COMPARATOR_CONFIG: usize = 0x00;
const COMPARATOR_ROUTE_CAPS: usize = 0x04;
const COMPARATOR_VALUE: usize = 0x08;

const GENERAL_ENABLE: u64 = 1 << 0;

bitflags::bitflags! {
	/// Comparator configuration-and-capabilities register (low dword).
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct ComparatorFlags: u32 {
		const LEVEL_TRIGGERED = 1 << 1;
		const INTERRUPT_ENABLE = 1 << 2;
		const PERIODIC_ENABLE = 1 << 3;
		const PERIODIC_CAPABLE = 1 << 4;
		const COUNTER_64BIT_CAPABLE = 1 << 5;
		const WRITABLE_ACCUMULATOR = 1 << 6;
		const FORCE_32BIT = 1 << 8;
		const IOAPIC_ROUTE = 0x1f << 9;
		const FSB_ENABLE = 1 << 14;
		const FSB_CAPABLE = 1 << 15;
	}
}

const IOAPIC_ROUTE_SHIFT: u32 = 9;

/// Raw register window of one HPET block.
pub struct HpetRegs {
	base: *mut u8,
}

unsafe impl Send for HpetRegs {}
unsafe impl Sync for HpetRegs {}

impl HpetRegs {
	/// # Safety
	///
	/// `mmio` must map the HPET register block.
	pub unsafe fn new(mmio: VirtAddr) -> Self {
		Self {
			base: mmio.as_u64() as *mut u8,
		}
	}

	fn read_u32(&self, offset: usize) -> u32 {
		unsafe { self.base.add(offset).cast::<u32>().read_volatile() }
	}

	fn write_u32(&self, offset: usize, value: u32) {
		unsafe {
			self.base.add(offset).cast::<u32>().write_volatile(value);
		}
	}

	fn read_u64(&self, offset: usize) -> u64 {
		unsafe { self.base.add(offset).cast::<u64>().read_volatile() }
	}

	fn write_u64(&self, offset: usize, value: u64) {
		unsafe {
			self.base.add(offset).cast::<u64>().write_volatile(value);
		}
	}

	pub fn comparator_count(&self) -> usize {
		(((self.read_u32(REG_DEVICE_INFO) >> 8) & 0x1f) + 1) as usize
	}

	pub fn long_counter_supported(&self) -> bool {
		(self.read_u32(REG_DEVICE_INFO) >> 8) & 0x20 != 0
	}

	pub fn clock_period_fs(&self) -> u32 {
		self.read_u32(REG_CLOCK_PERIOD)
	}

	pub fn enabled(&self) -> bool {
		self.read_u64(REG_GENERAL_CONFIG) & GENERAL_ENABLE != 0
	}

	pub fn enable(&self, enabled: bool) {
		let mut config = self.read_u64(REG_GENERAL_CONFIG);
		config = (config & !GENERAL_ENABLE) | u64::from(enabled);
		self.write_u64(REG_GENERAL_CONFIG, config);
	}

	pub fn main_counter(&self) -> u64 {
		self.read_u64(REG_MAIN_COUNTER)
	}

	fn comparator_reg(&self, index: usize, offset: usize) -> usize {
		COMPARATOR_BASE + index * COMPARATOR_STRIDE + offset
	}

	pub fn comparator_flags(&self, index: usize) -> ComparatorFlags {
		ComparatorFlags::from_bits_retain(
			self.read_u32(self.comparator_reg(index, COMPARATOR_CONFIG)),
		)
	}

	fn update_comparator_flags(&self, index: usize, clear: ComparatorFlags, set: ComparatorFlags) {
		let reg = self.comparator_reg(index, COMPARATOR_CONFIG);
		let mut value = self.read_u32(reg);
		value &= !clear.bits();
		value |= set.bits();
		self.write_u32(reg, value);
	}

	pub fn comparator_route_capabilities(&self, index: usize) -> u32 {
		self.read_u32(self.comparator_reg(index, COMPARATOR_ROUTE_CAPS))
	}

	pub fn set_comparator_route(&self, index: usize, pin: usize) {
		assert!(
			self.comparator_route_capabilities(index) & (1 << pin) != 0,
			"comparator cannot route to that I/O APIC line"
		);
		self.update_comparator_flags(
			index,
			ComparatorFlags::IOAPIC_ROUTE,
			ComparatorFlags::from_bits_retain((pin as u32) << IOAPIC_ROUTE_SHIFT),
		);
	}

	pub fn set_comparator_value(&self, index: usize, value: u64) {
		self.write_u64(self.comparator_reg(index, COMPARATOR_VALUE), value);
	}

	pub fn comparator_raised_interrupt(&self, index: usize) -> bool {
		self.read_u64(REG_INTERRUPT_STATUS) & (1 << index) != 0
	}

	pub fn acknowledge_comparator_interrupt(&self, index: usize) {
		self.write_u64(REG_INTERRUPT_STATUS, 1 << index);
	}

	pub fn comparator_uses_32bit(&self, index: usize) -> bool {
		let flags = self.comparator_flags(index);
		flags.contains(ComparatorFlags::FORCE_32BIT)
			|| !flags.contains(ComparatorFlags::COUNTER_64BIT_CAPABLE)
	}
}

/// Sorted set of small integers with O(1)-ish bidirectional lookup.
///
/// Comparators and I/O APIC lines are compacted into dense indices;
/// both populations are expected to be contiguous intervals, so an
/// interpolated probe usually lands exactly.
pub(crate) struct MonotonicBimap {
	values: Vec<u8>,
}

impl MonotonicBimap {
	pub fn new() -> Self {
		Self { values: Vec::new() }
	}

	pub fn insert(&mut self, value: u8) {
		self.values.push(value);
	}

	pub fn finalize(&mut self) {
		self.values.sort_unstable();
		self.values.shrink_to_fit();
	}

	pub fn len(&self) -> usize {
		self.values.len()
	}

	pub fn value_for_index(&self, index: usize) -> u8 {
		self.values[index]
	}

	pub fn index_for_value(&self, value: u8) -> Option<usize> {
		let (first, last) = match (self.values.first(), self.values.last()) {
			(Some(&first), Some(&last)) => (first, last),
			_ => return None,
		};
		if value < first || value > last {
			return None;
		}
		if first == last {
			return (value == first).then_some(0);
		}

		let mut probe = (value - first) as usize * (self.values.len() - 1) / (last - first) as usize;
		probe = probe.min(self.values.len() - 1);
		while probe > 0 && self.values[probe] > value {
			probe -= 1;
		}
		while probe < self.values.len() - 1 && self.values[probe] < value {
			probe += 1;
		}
		(self.values[probe] == value).then_some(probe)
	}
}

/// Pure emitters, one per comparator that reaches the I/O APIC.
pub struct HpetComparatorSourceDomain {
	comparator_count: usize,
}

impl InterruptDomain for HpetComparatorSourceDomain {
	fn name(&self) -> &'static str {
		"hpet-comparators"
	}

	fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
		Some(self)
	}
}

impl InterruptEmitter for HpetComparatorSourceDomain {
	fn emitter_count(&self) -> usize {
		self.comparator_count
	}
}

/// Context-independent router: each comparator may only reach the
/// I/O APIC lines its route-capabilities mask admits.
pub struct HpetRoutingDomain {
	regs: Arc<HpetRegs>,
	comparators: Arc<MonotonicBimap>,
	lines: Arc<MonotonicBimap>,
}

impl InterruptDomain for HpetRoutingDomain {
	fn name(&self) -> &'static str {
		"hpet-routing"
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

impl InterruptEmitter for HpetRoutingDomain {
	fn emitter_count(&self) -> usize {
		self.lines.len()
	}
}

impl InterruptReceiver for HpetRoutingDomain {
	fn receiver_count(&self) -> usize {
		self.comparators.len()
	}
}

impl RoutableDomain for HpetRoutingDomain {
	fn routing_rule(&self) -> RoutingRule<'_> {
		RoutingRule::ContextIndependent(self)
	}

	fn route_interrupt(&self, from_receiver: usize, to_emitter: usize) -> bool {
		use crate::interrupts::domain::ContextIndependentRouting;

		if !self.is_routing_allowed(from_receiver, to_emitter) {
			return false;
		}
		let comparator = self.comparators.value_for_index(from_receiver) as usize;
		let pin = self.lines.value_for_index(to_emitter) as usize;
		self.regs.set_comparator_route(comparator, pin);
		true
	}
}

impl crate::interrupts::domain::ContextIndependentRouting for HpetRoutingDomain {
	fn is_routing_allowed(&self, from_receiver: usize, to_emitter: usize) -> bool {
		let comparator = self.comparators.value_for_index(from_receiver) as usize;
		let pin = self.lines.value_for_index(to_emitter);
		self.regs.comparator_route_capabilities(comparator) & (1 << pin) != 0
	}
}

/// Connector from the routing domain's compacted line emitters to the
/// first I/O APIC's physical lines.
pub struct HpetConnector {
	source: DomainRef,
	target: DomainRef,
	lines: Arc<MonotonicBimap>,
}

impl Connector for HpetConnector {
	fn source(&self) -> DomainRef {
		self.source.clone()
	}

	fn target(&self) -> DomainRef {
		self.target.clone()
	}

	fn from_output(&self, output: usize) -> Option<usize> {
		(output < self.lines.len()).then(|| self.lines.value_for_index(output) as usize)
	}

	fn from_input(&self, input: usize) -> Option<usize> {
		self.lines.index_for_value(input as u8)
	}
}

fn comparator_event_flags(regs: &HpetRegs, index: usize) -> EventSourceFlags {
	let base = EventSourceFlags::KNOWN_STABLE
		| EventSourceFlags::FIXED_FREQUENCY
		| EventSourceFlags::ONESHOT
		| EventSourceFlags::TRACKS_INTERMEDIATE_TIME;
	if regs
		.comparator_flags(index)
		.contains(ComparatorFlags::PERIODIC_CAPABLE)
	{
		base | EventSourceFlags::PERIODIC
	} else {
		base
	}
}

struct ComparatorConfig {
	interrupts_enabled: bool,
	periodic: bool,
	level_triggered: bool,
}

/// One HPET comparator as a one-shot (and possibly periodic) event
/// source.
pub struct HpetComparatorEventSource {
	regs: Arc<HpetRegs>,
	index: usize,
	flags: EventSourceFlags,
	state: SourceState,
	config: SpinMutex<ComparatorConfig>,
}

impl HpetComparatorEventSource {
	fn new(regs: Arc<HpetRegs>, index: usize) -> Self {
		let flags = comparator_event_flags(&regs, index);
		let calibration = FrequencyData::from_period_fs(regs.clock_period_fs() as u64);
		let source = Self {
			regs,
			index,
			flags,
			state: SourceState::calibrated(calibration),
			config: SpinMutex::new(ComparatorConfig {
				interrupts_enabled: false,
				periodic: false,
				level_triggered: false,
			}),
		};
		source
			.regs
			.update_comparator_flags(index, ComparatorFlags::LEVEL_TRIGGERED, ComparatorFlags::empty());
		source
	}

	fn ensure_interrupts_enabled(&self, config: &mut ComparatorConfig, enabled: bool) {
		if config.interrupts_enabled == enabled {
			return;
		}
		config.interrupts_enabled = enabled;
		if enabled {
			self.regs.update_comparator_flags(
				self.index,
				ComparatorFlags::empty(),
				ComparatorFlags::INTERRUPT_ENABLE,
			);
		} else {
			self.regs.update_comparator_flags(
				self.index,
				ComparatorFlags::INTERRUPT_ENABLE,
				ComparatorFlags::empty(),
			);
		}
	}

	fn ensure_periodic(&self, config: &mut ComparatorConfig, periodic: bool) {
		if config.periodic == periodic {
			return;
		}
		config.periodic = periodic;
		if periodic {
			self.regs.update_comparator_flags(
				self.index,
				ComparatorFlags::empty(),
				ComparatorFlags::PERIODIC_ENABLE,
			);
		} else {
			self.regs.update_comparator_flags(
				self.index,
				ComparatorFlags::PERIODIC_ENABLE,
				ComparatorFlags::empty(),
			);
		}
	}

	fn handle_interrupt(&self) {
		let level_triggered = self.config.lock().level_triggered;
		if level_triggered {
			if !self.regs.comparator_raised_interrupt(self.index) {
				return;
			}
			self.regs.acknowledge_comparator_interrupt(self.index);
		}
		self.state.invoke_callback();
	}
}

impl EventSource for HpetComparatorEventSource {
	fn name(&self) -> &'static str {
		"HPET comparator"
	}

	fn flags(&self) -> EventSourceFlags {
		self.flags
	}

	fn quality(&self) -> u16 {
		200
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
		let mut config = self.config.lock();
		self.ensure_interrupts_enabled(&mut config, false);
		self.regs
			.set_comparator_value(self.index, self.regs.main_counter() + delta_ticks);
		self.ensure_periodic(&mut config, false);
		self.ensure_interrupts_enabled(&mut config, true);
	}

	fn arm_periodic(&self, period_ticks: u64) {
		let mut config = self.config.lock();
		// Halt the counter so the accumulator write cannot race it.
		let was_enabled = self.regs.enabled();
		self.regs.enable(false);
		self.ensure_periodic(&mut config, true);
		self.ensure_interrupts_enabled(&mut config, true);
		self.regs.update_comparator_flags(
			self.index,
			ComparatorFlags::empty(),
			ComparatorFlags::WRITABLE_ACCUMULATOR,
		);
		self.regs.set_comparator_value(self.index, period_ticks);
		self.regs.enable(was_enabled);
	}

	fn disarm(&self) {
		let mut config = self.config.lock();
		self.ensure_interrupts_enabled(&mut config, false);
	}

	fn ticks_elapsed(&self) -> u64 {
		0
	}

	fn max_oneshot_delay(&self) -> u64 {
		if self.regs.comparator_uses_32bit(self.index) {
			u32::MAX as u64
		} else {
			u64::MAX
		}
	}

	fn max_period(&self) -> u64 {
		self.max_oneshot_delay()
	}
}

/// The main counter as a clock source.
pub struct HpetClockSource {
	regs: Arc<HpetRegs>,
	mask: u64,
	state: SourceState,
}

impl ClockSource for HpetClockSource {
	fn name(&self) -> &'static str {
		"HPET"
	}

	fn mask(&self) -> u64 {
		self.mask
	}

	fn flags(&self) -> ClockSourceFlags {
		ClockSourceFlags::FIXED_FREQUENCY | ClockSourceFlags::KNOWN_STABLE
	}

	fn quality(&self) -> u16 {
		200
	}

	fn calibration(&self) -> FrequencyData {
		self.state.calibration()
	}

	fn set_calibration(&self, data: FrequencyData) {
		self.state.set_calibration(data);
	}

	fn read(&self) -> u64 {
		self.regs.main_counter()
	}
}

/// Map the HPET, register its interrupt topology, its comparator event
/// sources, and its clock source. Returns `false` when the firmware
/// reported no HPET.
pub fn init_hpet(info: Option<&HpetInfo>, map_mmio: MmioMapper) -> bool {
	let Some(info) = info else {
		return false;
	};
	assert!(
		info.in_system_memory,
		"the HPET must be mapped in system memory"
	);
	info!("Found HPET at {:#x}", info.base_address);
	let regs = Arc::new(unsafe { HpetRegs::new(map_mmio(PhysAddr::new(info.base_address))) });
	assert!(
		regs.clock_period_fs() <= MAXIMUM_CLOCK_PERIOD_FS,
		"HPET clock period too large"
	);

	// The HPET is conventionally wired to the first I/O APIC; compact
	// the usable comparators and lines into dense indices.
	let first_ioapic = apic::first_ioapic();
	let line_mask = if first_ioapic.line_count() >= 32 {
		u32::MAX
	} else {
		(1u32 << first_ioapic.line_count()) - 1
	};
	let mut comparators = MonotonicBimap::new();
	let mut lines = MonotonicBimap::new();
	let mut reachable_lines = 0u32;
	for index in 0..regs.comparator_count() {
		let capabilities = regs.comparator_route_capabilities(index) & line_mask;
		if capabilities != 0 {
			comparators.insert(index as u8);
			reachable_lines |= capabilities;
		} else if !regs
			.comparator_flags(index)
			.contains(ComparatorFlags::FSB_CAPABLE)
		{
			warn!(
				"HPET comparator {index} supports neither FSB routing nor the I/O APIC; this is strange"
			);
		}
	}
	let mut line = 0u8;
	while reachable_lines != 0 {
		if reachable_lines & 1 != 0 {
			lines.insert(line);
		}
		reachable_lines >>= 1;
		line += 1;
	}
	comparators.finalize();
	lines.finalize();

	let comparators = Arc::new(comparators);
	let lines = Arc::new(lines);

	let routing = DomainRef::new(HpetRoutingDomain {
		regs: regs.clone(),
		comparators: comparators.clone(),
		lines: lines.clone(),
	});
	let sources = DomainRef::new(HpetComparatorSourceDomain {
		comparator_count: comparators.len(),
	});
	interrupts::register_domain(routing.clone());
	interrupts::register_domain(sources.clone());
	interrupts::register_connector(Arc::new(HpetConnector {
		source: routing.clone(),
		target: DomainRef::from_arc(first_ioapic as Arc<dyn InterruptDomain>),
		lines: lines.clone(),
	}));
	interrupts::register_connector(Arc::new(AffineConnector::new(
		sources.clone(),
		routing,
		0,
		0,
		comparators.len(),
	)));

	// One event source per reachable comparator.
	for linear in 0..comparators.len() {
		let comparator = comparators.value_for_index(linear) as usize;
		let source = Arc::new(HpetComparatorEventSource::new(regs.clone(), comparator));
		let for_handler = Arc::clone(&source);
		interrupts::register_handler(
			&InterruptSourceHandle::new(sources.clone(), linear),
			alloc::boxed::Box::new(move |_frame| for_handler.handle_interrupt()),
		);
		time::register_event_source(source);
	}

	let mask = if regs.long_counter_supported() {
		u64::MAX
	} else {
		u32::MAX as u64
	};
	let clock = Arc::new(HpetClockSource {
		mask,
		state: SourceState::calibrated(FrequencyData::from_period_fs(
			regs.clock_period_fs() as u64
		)),
		regs: regs.clone(),
	});
	time::register_clock_source(clock);

	regs.enable(true);
	true
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn monotonic_bimap_round_trips() {
		let mut bimap = MonotonicBimap::new();
		for value in [11u8, 2, 8] {
			bimap.insert(value);
		}
		bimap.finalize();

		assert_eq!(bimap.len(), 3);
		assert_eq!(bimap.value_for_index(0), 2);
		assert_eq!(bimap.value_for_index(1), 8);
		assert_eq!(bimap.value_for_index(2), 11);
		assert_eq!(bimap.index_for_value(8), Some(1));
		assert_eq!(bimap.index_for_value(2), Some(0));
		assert_eq!(bimap.index_for_value(11), Some(2));
		assert_eq!(bimap.index_for_value(3), None);
		assert_eq!(bimap.index_for_value(12), None);
		assert_eq!(bimap.index_for_value(0), None);
	}

	#[test]
	fn monotonic_bimap_handles_contiguous_intervals() {
		let mut bimap = MonotonicBimap::new();
		for value in 2..=23u8 {
			bimap.insert(value);
		}
		bimap.finalize();
		for value in 2..=23u8 {
			assert_eq!(bimap.index_for_value(value), Some((value - 2) as usize));
		}
	}

	#[test]
	fn comparator_flag_bits_match_the_register_layout() {
		assert_eq!(ComparatorFlags::LEVEL_TRIGGERED.bits(), 1 << 1);
		assert_eq!(ComparatorFlags::INTERRUPT_ENABLE.bits(), 1 << 2);
		assert_eq!(ComparatorFlags::PERIODIC_ENABLE.bits(), 1 << 3);
		assert_eq!(ComparatorFlags::PERIODIC_CAPABLE.bits(), 1 << 4);
		assert_eq!(ComparatorFlags::COUNTER_64BIT_CAPABLE.bits(), 1 << 5);
		assert_eq!(ComparatorFlags::WRITABLE_ACCUMULATOR.bits(), 1 << 6);
		assert_eq!(ComparatorFlags::FORCE_32BIT.bits(), 1 << 8);
		assert_eq!(ComparatorFlags::FSB_ENABLE.bits(), 1 << 14);
		assert_eq!(ComparatorFlags::FSB_CAPABLE.bits(), 1 << 15);
	}
}
