//! Local APIC and I/O APIC interrupt domains.
//!
//! The MADT (parsed by the ACPI collaborator into [`MadtInfo`]) drives
//! construction: one routable, maskable, activation-configurable domain
//! per I/O APIC; one fixed identity-routing EOI domain for the local
//! APIC; a fixed-routing legacy IRQ demultiplexer in front of the first
//! I/O APIC; the spurious vector's exclusive claim; and the LAPIC's
//! local-device LVT file with its timer event source.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hermit_sync::{OnceCell, SpinMutex};
use memory_addresses::{PhysAddr, VirtAddr};

use super::MmioMapper;
use crate::collections::Bimap;
use crate::interrupts::domain::{
	ActivationType, AffineConnector, ConfigurableActivationTypeDomain, Connector, EoiDomain,
	FixedRouting, InterruptDomain, InterruptEmitter, InterruptReceiver, MaskableDomain,
	RoutableDomain, RoutingRule,
};
use crate::interrupts::{
	self, CPU_INTERRUPT_COUNT, DomainRef, InterruptFrame, InterruptSourceHandle,
};
use crate::time::{
	self, EventCallback, EventSource, EventSourceFlags, FrequencyData, SourceState,
};

/// Parsed MADT contents, handed over by the ACPI collaborator.
#[derive(Clone, Debug, Default)]
pub struct MadtInfo {
	pub lapic_address: u64,
	pub processors: Vec<ProcessorLocalApic>,
	pub ioapics: Vec<IoApicRecord>,
	pub overrides: Vec<SourceOverride>,
}

#[derive(Clone, Copy, Debug)]
pub struct ProcessorLocalApic {
	pub acpi_processor_id: u8,
	pub apic_id: u8,
	pub enabled: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct IoApicRecord {
	pub id: u8,
	pub address: u64,
	pub gsi_base: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct SourceOverride {
	pub bus: u8,
	pub irq: u8,
	pub gsi: u32,
	pub active_low: bool,
	pub level_triggered: bool,
}

/// Vector the spurious-interrupt emitter exclusively owns.
pub const SPURIOUS_INTERRUPT_VECTOR: usize = 0xff;

/// First CPU vector the I/O APIC hands interrupts to; 0x00..0x10 are
/// reserved by the architecture.
pub const IOAPIC_VECTOR_MAPPING_BASE: usize = 0x10;

const IOAPIC_REG_VERSION: u8 = 0x01;
const IOAPIC_REG_REDIRECT_TABLE_BASE: u8 = 0x10;

bitflags::bitflags! {
	/// Low dword of an I/O APIC redirection entry.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct RedirectionFlags: u32 {
		const VECTOR = 0xff;
		const DELIVERY_MODE = 0b111 << 8;
		const POLARITY_LOW = 1 << 13;
		const LEVEL_TRIGGERED = 1 << 15;
		const MASKED = 1 << 16;
	}
}

/// One I/O APIC: `line_count` input lines, routable onto the CPU
/// vectors `0x10..=0xfe` through the local APIC.
pub struct IoApic {
	id: u8,
	select: *mut u32,
	window: *mut u32,
	gsi_base: u32,
	line_count: usize,
	activation: SpinMutex<Vec<Option<ActivationType>>>,
}

unsafe impl Send for IoApic {}
unsafe impl Sync for IoApic {}

impl IoApic {
	/// # Safety
	///
	/// `mmio` must map the I/O APIC register window.
	pub unsafe fn new(id: u8, mmio: VirtAddr, gsi_base: u32) -> Self {
		let base = mmio.as_u64() as *mut u32;
		let mut ioapic = Self {
			id,
			select: base,
			window: unsafe { base.add(4) },
			gsi_base,
			line_count: 0,
			activation: SpinMutex::new(Vec::new()),
		};
		let version = ioapic.reg_read(IOAPIC_REG_VERSION);
		ioapic.line_count = ((version >> 16) & 0xff) as usize + 1;
		*ioapic.activation.lock() = vec![None; ioapic.line_count];
		ioapic
	}

	fn reg_read(&self, index: u8) -> u32 {
		unsafe {
			self.select.write_volatile(index as u32);
			self.window.read_volatile()
		}
	}

	fn reg_write(&self, index: u8, value: u32) {
		unsafe {
			self.select.write_volatile(index as u32);
			self.window.write_volatile(value);
		}
	}

	fn redirection_reg(line: usize) -> u8 {
		IOAPIC_REG_REDIRECT_TABLE_BASE + (line as u8) * 2
	}

	pub fn id(&self) -> u8 {
		self.id
	}

	pub fn gsi_base(&self) -> u32 {
		self.gsi_base
	}

	pub fn line_count(&self) -> usize {
		self.line_count
	}

	pub fn set_activation_type_by_gsi(&self, gsi: u32, activation: ActivationType) {
		self.set_activation_type((gsi - self.gsi_base) as usize, activation);
	}

	/// Configure every line the firmware said nothing about.
	pub fn set_uninitialized_activation_types(&self, activation: ActivationType) {
		for line in 0..self.line_count {
			if self.activation.lock()[line].is_none() {
				self.set_activation_type(line, activation);
			}
		}
	}
}

impl InterruptDomain for IoApic {
	fn name(&self) -> &'static str {
		"ioapic"
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

impl InterruptReceiver for IoApic {
	fn receiver_count(&self) -> usize {
		self.line_count
	}
}

impl InterruptEmitter for IoApic {
	fn emitter_count(&self) -> usize {
		// Vectors 0x10..=0xfe are legal targets.
		(CPU_INTERRUPT_COUNT - 2) - IOAPIC_VECTOR_MAPPING_BASE + 1
	}
}

impl RoutableDomain for IoApic {
	fn routing_rule(&self) -> RoutingRule<'_> {
		RoutingRule::Free
	}

	fn route_interrupt(&self, from_receiver: usize, to_emitter: usize) -> bool {
		let vector = to_emitter + IOAPIC_VECTOR_MAPPING_BASE;
		if !(IOAPIC_VECTOR_MAPPING_BASE..=0xfe).contains(&vector) || from_receiver >= self.line_count
		{
			return false;
		}
		let reg = Self::redirection_reg(from_receiver);
		let mut value = self.reg_read(reg);
		value &= !RedirectionFlags::VECTOR.bits();
		value |= vector as u32;
		self.reg_write(reg, value);
		true
	}
}

impl MaskableDomain for IoApic {
	fn set_receiver_mask(&self, receiver: usize, masked: bool) {
		assert!(receiver < self.line_count);
		let reg = Self::redirection_reg(receiver);
		let mut value = self.reg_read(reg);
		if masked {
			value |= RedirectionFlags::MASKED.bits();
		} else {
			value &= !RedirectionFlags::MASKED.bits();
		}
		self.reg_write(reg, value);
	}

	fn is_receiver_masked(&self, receiver: usize) -> bool {
		assert!(receiver < self.line_count);
		self.reg_read(Self::redirection_reg(receiver)) & RedirectionFlags::MASKED.bits() != 0
	}
}

impl ConfigurableActivationTypeDomain for IoApic {
	fn set_activation_type(&self, receiver: usize, activation: ActivationType) {
		assert!(receiver < self.line_count, "gsi out of range");
		let reg = Self::redirection_reg(receiver);
		let mut value = self.reg_read(reg);
		value &= !(RedirectionFlags::POLARITY_LOW | RedirectionFlags::LEVEL_TRIGGERED).bits();
		if activation.is_level_triggered() {
			value |= RedirectionFlags::LEVEL_TRIGGERED.bits();
		}
		if activation.is_active_low() {
			value |= RedirectionFlags::POLARITY_LOW.bits();
		}
		self.reg_write(reg, value);
		self.activation.lock()[receiver] = Some(activation);
	}

	fn activation_type(&self, receiver: usize) -> Option<ActivationType> {
		self.activation.lock().get(receiver).copied().flatten()
	}
}

const LAPIC_REG_ID: usize = 0x20;
const LAPIC_REG_EOI: usize = 0xb0;
const LAPIC_REG_SPURIOUS: usize = 0xf0;
const LAPIC_SPURIOUS_ENABLE: u32 = 0x100;
const LAPIC_REG_TIMER_LVT: usize = 0x320;
const LAPIC_REG_TIMER_INITIAL_COUNT: usize = 0x380;
const LAPIC_REG_TIMER_CURRENT_COUNT: usize = 0x390;
const LAPIC_REG_TIMER_DIVIDE_CONFIG: usize = 0x3e0;
const LAPIC_LVT_MASK_BIT: u32 = 1 << 16;
const LAPIC_TIMER_MODE_SHIFT: u32 = 17;

/// LVT entries exposed by the local-device router: CMCI, timer,
/// thermal, performance, LINT0, LINT1, error.
pub const LVT_ENTRY_COUNT: usize = 7;
const LVT_OFFSETS: [usize; LVT_ENTRY_COUNT] = [0x2f0, 0x320, 0x330, 0x340, 0x350, 0x360, 0x370];
/// Index of the timer entry within the LVT file.
pub const LVT_TIMER_INDEX: usize = 1;

/// The local APIC: identity fixed-routing from its inputs onto the CPU
/// vector file, and the innermost EOI domain of every APIC-delivered
/// interrupt.
pub struct Lapic {
	mmio: *mut u32,
}

unsafe impl Send for Lapic {}
unsafe impl Sync for Lapic {}

impl Lapic {
	/// # Safety
	///
	/// `mmio` must map the local APIC register page.
	pub unsafe fn new(mmio: VirtAddr) -> Self {
		let lapic = Self {
			mmio: mmio.as_u64() as *mut u32,
		};
		lapic.reg_write(
			LAPIC_REG_SPURIOUS,
			LAPIC_SPURIOUS_ENABLE | SPURIOUS_INTERRUPT_VECTOR as u32,
		);
		lapic
	}

	fn reg_read(&self, offset: usize) -> u32 {
		unsafe { self.mmio.add(offset / 4).read_volatile() }
	}

	fn reg_write(&self, offset: usize, value: u32) {
		unsafe {
			self.mmio.add(offset / 4).write_volatile(value);
		}
	}

	pub fn id(&self) -> u32 {
		(self.reg_read(LAPIC_REG_ID) >> 24) & 0xff
	}

	pub fn eoi(&self) {
		self.reg_write(LAPIC_REG_EOI, 0);
	}
}

impl InterruptDomain for Lapic {
	fn name(&self) -> &'static str {
		"lapic"
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

impl InterruptEmitter for Lapic {
	fn emitter_count(&self) -> usize {
		CPU_INTERRUPT_COUNT
	}
}

impl InterruptReceiver for Lapic {
	fn receiver_count(&self) -> usize {
		CPU_INTERRUPT_COUNT
	}
}

impl RoutableDomain for Lapic {
	fn routing_rule(&self) -> RoutingRule<'_> {
		RoutingRule::Fixed(self)
	}

	fn route_interrupt(&self, _from_receiver: usize, _to_emitter: usize) -> bool {
		// The identity mapping is wired in hardware.
		true
	}
}

impl FixedRouting for Lapic {
	fn emitter_for(&self, receiver: usize) -> usize {
		receiver
	}
}

impl EoiDomain for Lapic {
	fn issue_eoi(&self, _frame: &InterruptFrame) {
		self.eoi();
	}
}

/// Pure emitter behind the spurious vector's exclusive claim.
pub struct SpuriousInterruptDomain;

impl InterruptDomain for SpuriousInterruptDomain {
	fn name(&self) -> &'static str {
		"lapic-spurious"
	}

	fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
		Some(self)
	}
}

impl InterruptEmitter for SpuriousInterruptDomain {
	fn emitter_count(&self) -> usize {
		1
	}
}

/// The local APIC's LVT file as a freely routable domain: any of the
/// seven local device lines can be pointed at any CPU vector.
pub struct LapicLvtRouter {
	lapic: Arc<Lapic>,
}

impl LapicLvtRouter {
	pub fn new(lapic: Arc<Lapic>) -> Self {
		let router = Self { lapic };
		for entry in 0..LVT_ENTRY_COUNT {
			router.mask_entry(entry, true);
		}
		router
	}

	pub fn mask_entry(&self, entry: usize, masked: bool) {
		assert!(entry < LVT_ENTRY_COUNT);
		let mut value = self.lapic.reg_read(LVT_OFFSETS[entry]);
		if masked {
			value |= LAPIC_LVT_MASK_BIT;
		} else {
			value &= !LAPIC_LVT_MASK_BIT;
		}
		self.lapic.reg_write(LVT_OFFSETS[entry], value);
	}
}

impl InterruptDomain for LapicLvtRouter {
	fn name(&self) -> &'static str {
		"lapic-lvt"
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

	fn as_activation_config(&self) -> Option<&dyn ConfigurableActivationTypeDomain> {
		Some(self)
	}
}

impl InterruptEmitter for LapicLvtRouter {
	fn emitter_count(&self) -> usize {
		CPU_INTERRUPT_COUNT
	}
}

impl InterruptReceiver for LapicLvtRouter {
	fn receiver_count(&self) -> usize {
		LVT_ENTRY_COUNT
	}
}

impl RoutableDomain for LapicLvtRouter {
	fn routing_rule(&self) -> RoutingRule<'_> {
		RoutingRule::Free
	}

	fn route_interrupt(&self, from_receiver: usize, to_emitter: usize) -> bool {
		assert!(from_receiver < LVT_ENTRY_COUNT);
		let mut value = self.lapic.reg_read(LVT_OFFSETS[from_receiver]);
		value &= !0xff;
		value |= (to_emitter & 0xff) as u32;
		self.lapic.reg_write(LVT_OFFSETS[from_receiver], value);
		true
	}
}

impl EoiDomain for LapicLvtRouter {
	fn issue_eoi(&self, _frame: &InterruptFrame) {
		self.lapic.eoi();
	}
}

impl ConfigurableActivationTypeDomain for LapicLvtRouter {
	fn set_activation_type(&self, _receiver: usize, _activation: ActivationType) {
		// Local device lines are edge-triggered as configured.
	}

	fn activation_type(&self, _receiver: usize) -> Option<ActivationType> {
		Some(ActivationType::EdgeHigh)
	}
}

/// Pure emitters feeding the LVT file (one per local device line).
pub struct LapicLocalEmitters;

impl InterruptDomain for LapicLocalEmitters {
	fn name(&self) -> &'static str {
		"lapic-local-devices"
	}

	fn as_emitter(&self) -> Option<&dyn InterruptEmitter> {
		Some(self)
	}
}

impl InterruptEmitter for LapicLocalEmitters {
	fn emitter_count(&self) -> usize {
		LVT_ENTRY_COUNT
	}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LapicTimerMode {
	Oneshot = 0,
	Periodic = 1,
}

struct LapicTimerRegs {
	mode: LapicTimerMode,
	disarmed: bool,
	last_arm: u64,
}

/// The per-CPU LAPIC timer. Frequency is stable but unknown, so the
/// registry calibrates it off the selected stable clock.
pub struct LapicTimer {
	lapic: Arc<Lapic>,
	router: Arc<LapicLvtRouter>,
	state: SourceState,
	regs: SpinMutex<LapicTimerRegs>,
}

impl LapicTimer {
	const FLAGS: EventSourceFlags = EventSourceFlags::KNOWN_STABLE
		.union(EventSourceFlags::ONESHOT)
		.union(EventSourceFlags::PERIODIC)
		.union(EventSourceFlags::PER_CPU)
		.union(EventSourceFlags::TRACKS_INTERMEDIATE_TIME);

	pub fn new(lapic: Arc<Lapic>, router: Arc<LapicLvtRouter>) -> Self {
		// One-shot, divide by 1.
		let lvt = lapic.reg_read(LAPIC_REG_TIMER_LVT);
		lapic.reg_write(LAPIC_REG_TIMER_LVT, lvt & !(0b11 << LAPIC_TIMER_MODE_SHIFT));
		lapic.reg_write(LAPIC_REG_TIMER_DIVIDE_CONFIG, 0b1011);
		Self {
			lapic,
			router,
			state: SourceState::new(),
			regs: SpinMutex::new(LapicTimerRegs {
				mode: LapicTimerMode::Oneshot,
				disarmed: true,
				last_arm: 0,
			}),
		}
	}

	fn ensure_mode(&self, regs: &mut LapicTimerRegs, mode: LapicTimerMode) {
		if regs.mode == mode {
			return;
		}
		let mut value = self.lapic.reg_read(LAPIC_REG_TIMER_LVT);
		value &= !(0b11 << LAPIC_TIMER_MODE_SHIFT);
		value |= (mode as u32) << LAPIC_TIMER_MODE_SHIFT;
		self.lapic.reg_write(LAPIC_REG_TIMER_LVT, value);
		regs.mode = mode;
	}

	fn ensure_armed(&self, regs: &mut LapicTimerRegs, armed: bool) {
		if regs.disarmed != armed {
			return;
		}
		regs.disarmed = !armed;
		self.router.mask_entry(LVT_TIMER_INDEX, !armed);
	}
}

impl EventSource for LapicTimer {
	fn name(&self) -> &'static str {
		"LAPIC"
	}

	fn flags(&self) -> EventSourceFlags {
		Self::FLAGS
	}

	fn quality(&self) -> u16 {
		300
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
		self.ensure_mode(&mut regs, LapicTimerMode::Oneshot);
		self.ensure_armed(&mut regs, true);
		let count = delta_ticks.min(u32::MAX as u64) as u32;
		regs.last_arm = count as u64;
		self.lapic.reg_write(LAPIC_REG_TIMER_INITIAL_COUNT, count);
	}

	fn arm_periodic(&self, period_ticks: u64) {
		let mut regs = self.regs.lock();
		self.ensure_mode(&mut regs, LapicTimerMode::Periodic);
		self.ensure_armed(&mut regs, true);
		let count = period_ticks.min(u32::MAX as u64) as u32;
		regs.last_arm = count as u64;
		self.lapic.reg_write(LAPIC_REG_TIMER_INITIAL_COUNT, count);
	}

	fn disarm(&self) {
		let mut regs = self.regs.lock();
		self.ensure_armed(&mut regs, false);
	}

	fn ticks_elapsed(&self) -> u64 {
		let regs = self.regs.lock();
		regs.last_arm
			.saturating_sub(self.lapic.reg_read(LAPIC_REG_TIMER_CURRENT_COUNT) as u64)
	}

	fn max_oneshot_delay(&self) -> u64 {
		u32::MAX as u64
	}

	fn max_period(&self) -> u64 {
		u32::MAX as u64
	}
}

/// Fixed-routing demultiplexer for the 16 legacy IRQs. The map is
/// surjective: source overrides can alias two IRQs onto one emitter.
pub struct IrqDomain {
	map: [usize; 16],
	emitter_count: usize,
}

impl IrqDomain {
	pub fn new(map: [usize; 16]) -> Self {
		let emitter_count = map.iter().copied().max().unwrap() + 1;
		Self { map, emitter_count }
	}
}

impl InterruptDomain for IrqDomain {
	fn name(&self) -> &'static str {
		"legacy-irqs"
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

impl InterruptEmitter for IrqDomain {
	fn emitter_count(&self) -> usize {
		self.emitter_count
	}
}

impl InterruptReceiver for IrqDomain {
	fn receiver_count(&self) -> usize {
		16
	}
}

impl RoutableDomain for IrqDomain {
	fn routing_rule(&self) -> RoutingRule<'_> {
		RoutingRule::Fixed(self)
	}

	fn route_interrupt(&self, _from_receiver: usize, _to_emitter: usize) -> bool {
		// The demultiplexing is a property of the board wiring.
		true
	}
}

impl FixedRouting for IrqDomain {
	fn emitter_for(&self, receiver: usize) -> usize {
		self.map[receiver]
	}
}

/// Connector from the IRQ domain's emitters to one I/O APIC's lines.
pub struct IrqToIoapicConnector {
	source: DomainRef,
	target: DomainRef,
	emitter_to_line: Bimap<usize, usize>,
}

impl Connector for IrqToIoapicConnector {
	fn source(&self) -> DomainRef {
		self.source.clone()
	}

	fn target(&self) -> DomainRef {
		self.target.clone()
	}

	fn from_output(&self, output: usize) -> Option<usize> {
		self.emitter_to_line.get_left(&output).copied()
	}

	fn from_input(&self, input: usize) -> Option<usize> {
		self.emitter_to_line.get_right(&input).copied()
	}
}

/// Board-independent plan for the legacy IRQ domain, computed from the
/// MADT's source overrides and the I/O APICs' GSI spans.
pub(crate) struct IrqPlan {
	pub map: [usize; 16],
	/// Per I/O APIC (by span index): emitter -> line.
	pub per_ioapic: Vec<Bimap<usize, usize>>,
	/// (span index, line, activation) settings from source overrides.
	pub activations: Vec<(usize, usize, ActivationType)>,
}

fn span_for_gsi(spans: &[(u32, usize)], gsi: u32) -> Option<(usize, usize)> {
	for (index, &(base, lines)) in spans.iter().enumerate() {
		if gsi >= base && gsi < base + lines as u32 {
			return Some((index, (gsi - base) as usize));
		}
	}
	None
}

pub(crate) fn plan_legacy_irqs(overrides: &[SourceOverride], spans: &[(u32, usize)]) -> IrqPlan {
	let mut irq_to_emitter: [Option<usize>; 16] = [None; 16];
	let mut emitter_max = 0usize;
	let mut per_ioapic: Vec<Bimap<usize, usize>> =
		spans.iter().map(|_| Bimap::new()).collect();
	let mut activations = Vec::new();
	let mut mapped: u16 = 0;

	let mut add_mapping = |irq_to_emitter: &mut [Option<usize>; 16],
	                       per_ioapic: &mut Vec<Bimap<usize, usize>>,
	                       emitter_max: &mut usize,
	                       irq: usize,
	                       gsi: u32|
	 -> usize {
		let (span, line) = span_for_gsi(spans, gsi).expect("no I/O APIC covers the GSI");
		if let Some(&emitter) = per_ioapic[span].get_right(&line) {
			// The GSI already has an emitter; alias the IRQ onto it.
			irq_to_emitter[irq] = Some(emitter);
			return span;
		}
		let emitter = *emitter_max;
		*emitter_max += 1;
		irq_to_emitter[irq] = Some(emitter);
		per_ioapic[span].insert(emitter, line);
		span
	};

	for source_override in overrides {
		if source_override.bus != 0 {
			warn!("MADT source override lists non-ISA bus source; skipping");
			continue;
		}
		let irq = source_override.irq as usize;
		if irq >= 16 {
			warn!("MADT source override lists IRQ {irq} out of range; skipping");
			continue;
		}
		if mapped & (1 << irq) != 0 {
			warn!("MADT source override lists duplicate interrupt source; skipping");
			continue;
		}
		let span = add_mapping(
			&mut irq_to_emitter,
			&mut per_ioapic,
			&mut emitter_max,
			irq,
			source_override.gsi,
		);
		let (_, line) = span_for_gsi(spans, source_override.gsi).unwrap();
		activations.push((
			span,
			line,
			ActivationType::from_level_and_polarity(
				source_override.level_triggered,
				source_override.active_low,
			),
		));
		mapped |= 1 << irq;
	}

	for irq in 0..16u32 {
		if mapped & (1 << irq) != 0 {
			continue;
		}
		add_mapping(
			&mut irq_to_emitter,
			&mut per_ioapic,
			&mut emitter_max,
			irq as usize,
			irq,
		);
	}

	let mut map = [0usize; 16];
	for (irq, emitter) in irq_to_emitter.iter().enumerate() {
		map[irq] = emitter.expect("every legacy IRQ has an emitter");
	}

	IrqPlan {
		map,
		per_ioapic,
		activations,
	}
}

static LAPIC: OnceCell<Arc<Lapic>> = OnceCell::new();
static LAPIC_DOMAIN: OnceCell<DomainRef> = OnceCell::new();
static LVT_ROUTER: OnceCell<Arc<LapicLvtRouter>> = OnceCell::new();
static LOCAL_EMITTERS: OnceCell<DomainRef> = OnceCell::new();
static IOAPICS: OnceCell<Vec<Arc<IoApic>>> = OnceCell::new();
static FIRST_IOAPIC: OnceCell<Arc<IoApic>> = OnceCell::new();
static IRQ_DOMAIN: OnceCell<DomainRef> = OnceCell::new();

pub fn lapic() -> Arc<Lapic> {
	LAPIC.get().expect("APIC not set up").clone()
}

pub fn lapic_domain() -> DomainRef {
	LAPIC_DOMAIN.get().expect("APIC not set up").clone()
}

pub fn irq_domain() -> DomainRef {
	IRQ_DOMAIN.get().expect("APIC not set up").clone()
}

/// I/O APIC with the lowest GSI base. The HPET is conventionally wired
/// to this one.
pub fn first_ioapic() -> Arc<IoApic> {
	FIRST_IOAPIC.get().expect("APIC not set up").clone()
}

/// Handle naming the LAPIC timer's interrupt source.
pub fn lapic_timer_source() -> InterruptSourceHandle {
	InterruptSourceHandle::new(
		LOCAL_EMITTERS.get().expect("APIC not set up").clone(),
		LVT_TIMER_INDEX,
	)
}

#[cfg(target_os = "none")]
mod msr {
	use x86_64::registers::model_specific::Msr;

	const IA32_APIC_BASE: u32 = 0x1b;
	const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;

	fn lapic_base_mask() -> u64 {
		let bits = raw_cpuid::CpuId::new()
			.get_processor_capacity_ext_info()
			.map(|info| u64::from(info.physical_address_bits()))
			.unwrap_or(36);
		((1 << bits) - 1) & !0xfff
	}

	pub fn lapic_base() -> u64 {
		unsafe { Msr::new(IA32_APIC_BASE).read() & lapic_base_mask() }
	}

	pub fn enable_apic() {
		let mut msr = Msr::new(IA32_APIC_BASE);
		let value = unsafe { msr.read() };
		debug!("Enabling APIC, writing MSR value {value:#x}");
		unsafe {
			msr.write(lapic_base() | IA32_APIC_BASE_ENABLE);
		}
	}
}

/// Build and register the full APIC topology from the MADT.
#[cfg(target_os = "none")]
pub fn setup_apics(madt: &MadtInfo, map_mmio: MmioMapper) {
	msr::enable_apic();
	let lapic_base = PhysAddr::new(msr::lapic_base());
	let lapic = Arc::new(unsafe { Lapic::new(map_mmio(lapic_base)) });
	LAPIC.set(lapic.clone()).ok().expect("APIC set up twice");

	register_apic_domains(madt, lapic, map_mmio);
	info!("Enabled APIC");
}

/// The MSR-free part of APIC bring-up.
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
fn register_apic_domains(madt: &MadtInfo, lapic: Arc<Lapic>, map_mmio: MmioMapper) {
	let vectors = interrupts::cpu_interrupt_vectors();

	let lapic_domain = DomainRef::from_arc(lapic.clone() as Arc<dyn InterruptDomain>);
	LAPIC_DOMAIN.set(lapic_domain.clone()).ok().unwrap();
	interrupts::register_domain(lapic_domain.clone());
	interrupts::register_connector(Arc::new(AffineConnector::new(
		lapic_domain.clone(),
		vectors.clone(),
		0,
		0,
		CPU_INTERRUPT_COUNT,
	)));

	let spurious = DomainRef::new(SpuriousInterruptDomain);
	interrupts::register_domain(spurious.clone());
	let claimed = interrupts::register_exclusive_connector(Arc::new(AffineConnector::new(
		spurious,
		vectors.clone(),
		SPURIOUS_INTERRUPT_VECTOR,
		0,
		1,
	)));
	assert!(claimed, "spurious vector already claimed");

	let router = Arc::new(LapicLvtRouter::new(lapic.clone()));
	LVT_ROUTER.set(router.clone()).ok().unwrap();
	let router_domain = DomainRef::from_arc(router.clone() as Arc<dyn InterruptDomain>);
	let local_emitters = DomainRef::new(LapicLocalEmitters);
	LOCAL_EMITTERS.set(local_emitters.clone()).ok().unwrap();
	interrupts::register_domain(local_emitters.clone());
	interrupts::register_domain(router_domain.clone());
	interrupts::register_connector(Arc::new(AffineConnector::new(
		local_emitters,
		router_domain.clone(),
		0,
		0,
		LVT_ENTRY_COUNT,
	)));
	interrupts::register_connector(Arc::new(AffineConnector::new(
		router_domain,
		vectors,
		0,
		0,
		CPU_INTERRUPT_COUNT,
	)));

	// I/O APICs, sorted by GSI base.
	let mut ioapics: Vec<Arc<IoApic>> = madt
		.ioapics
		.iter()
		.map(|record| {
			let mmio = map_mmio(PhysAddr::new(record.address));
			debug!(
				"Mapping IOAPIC {} at {:#x} to virtual address {:#x}",
				record.id, record.address, mmio
			);
			Arc::new(unsafe { IoApic::new(record.id, mmio, record.gsi_base) })
		})
		.collect();
	ioapics.sort_by_key(|ioapic| ioapic.gsi_base());

	for ioapic in &ioapics {
		let domain = DomainRef::from_arc(ioapic.clone() as Arc<dyn InterruptDomain>);
		interrupts::register_domain(domain.clone());
		interrupts::register_connector(Arc::new(AffineConnector::new(
			domain,
			lapic_domain.clone(),
			IOAPIC_VECTOR_MAPPING_BASE,
			0,
			ioapic.emitter_count(),
		)));
	}
	if let Some(first) = ioapics.first() {
		FIRST_IOAPIC.set(first.clone()).ok().unwrap();
	}

	// Legacy IRQ demultiplexer per the source overrides.
	let spans: Vec<(u32, usize)> = ioapics
		.iter()
		.map(|ioapic| (ioapic.gsi_base(), ioapic.line_count()))
		.collect();
	let plan = plan_legacy_irqs(&madt.overrides, &spans);
	for &(span, line, activation) in &plan.activations {
		ioapics[span].set_activation_type(line, activation);
	}

	let irq_domain = DomainRef::new(IrqDomain::new(plan.map));
	IRQ_DOMAIN.set(irq_domain.clone()).ok().unwrap();
	interrupts::register_domain(irq_domain.clone());
	for (span, bimap) in plan.per_ioapic.into_iter().enumerate() {
		if bimap.is_empty() {
			continue;
		}
		interrupts::register_connector(Arc::new(IrqToIoapicConnector {
			source: irq_domain.clone(),
			target: DomainRef::from_arc(ioapics[span].clone() as Arc<dyn InterruptDomain>),
			emitter_to_line: bimap,
		}));
	}

	// Every line the firmware said nothing about defaults to
	// edge-triggered, active high.
	for ioapic in &ioapics {
		ioapic.set_uninitialized_activation_types(ActivationType::from_level_and_polarity(
			false, false,
		));
	}
	IOAPICS.set(ioapics).ok().unwrap();

	// The LAPIC timer fires through LVT entry 1.
	let timer = Arc::new(LapicTimer::new(lapic, router));
	let timer_state = Arc::clone(&timer);
	interrupts::register_handler(
		&lapic_timer_source(),
		alloc::boxed::Box::new(move |_frame| timer_state.state.invoke_callback()),
	);
	time::register_event_source(timer);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn override_maps_irq_zero_to_gsi_two() {
		let overrides = [SourceOverride {
			bus: 0,
			irq: 0,
			gsi: 2,
			active_low: false,
			level_triggered: false,
		}];
		let spans = [(0u32, 24usize), (24, 24)];
		let plan = plan_legacy_irqs(&overrides, &spans);

		// IRQ 0 and IRQ 2 share the emitter wired to line 2 of the
		// first I/O APIC.
		assert_eq!(plan.map[0], plan.map[2]);
		assert_eq!(plan.per_ioapic[0].get_left(&plan.map[0]), Some(&2));
		// Everything else is identity onto the first I/O APIC.
		for irq in (1..16).filter(|&irq| irq != 2) {
			assert_eq!(plan.per_ioapic[0].get_left(&plan.map[irq]), Some(&irq));
		}
		assert!(plan.per_ioapic[1].is_empty());
		assert_eq!(plan.activations.len(), 1);
		assert_eq!(plan.activations[0], (0, 2, ActivationType::EdgeHigh));
	}

	#[test]
	fn non_isa_and_duplicate_overrides_are_skipped() {
		let overrides = [
			SourceOverride {
				bus: 1,
				irq: 4,
				gsi: 9,
				active_low: false,
				level_triggered: false,
			},
			SourceOverride {
				bus: 0,
				irq: 5,
				gsi: 10,
				active_low: true,
				level_triggered: true,
			},
			SourceOverride {
				bus: 0,
				irq: 5,
				gsi: 11,
				active_low: false,
				level_triggered: false,
			},
		];
		let spans = [(0u32, 24usize)];
		let plan = plan_legacy_irqs(&overrides, &spans);

		// The non-ISA override is ignored: IRQ 4 stays identity.
		assert_eq!(plan.per_ioapic[0].get_left(&plan.map[4]), Some(&4));
		// The first IRQ 5 override wins; the duplicate is dropped.
		assert_eq!(plan.per_ioapic[0].get_left(&plan.map[5]), Some(&10));
		assert_eq!(plan.activations.len(), 1);
		assert_eq!(plan.activations[0], (0, 10, ActivationType::LevelLow));
	}

	#[test]
	fn gsis_spanning_two_ioapics_resolve() {
		let spans = [(0u32, 24usize), (24, 24)];
		assert_eq!(span_for_gsi(&spans, 0), Some((0, 0)));
		assert_eq!(span_for_gsi(&spans, 23), Some((0, 23)));
		assert_eq!(span_for_gsi(&spans, 24), Some((1, 0)));
		assert_eq!(span_for_gsi(&spans, 47), Some((1, 23)));
		assert_eq!(span_for_gsi(&spans, 48), None);
	}
}
