//! amd64 hardware adapters: the thin layer between device registers and
//! the core contracts.

pub mod apic;
pub mod hpet;
pub mod interrupts;
pub mod pit;

use memory_addresses::{PhysAddr, VirtAddr};

/// MMIO mapping collaborator. The virtual memory subsystem owns the
/// actual page-table programming; adapters receive a function that maps
/// one device page uncached and returns where it landed.
pub type MmioMapper = fn(PhysAddr) -> VirtAddr;

/// Bring up the interrupt and timing hardware from the parsed firmware
/// tables: vector file, APICs, HPET (if present), PIT, one routing
/// pass, then timing calibration and the timer queue.
#[cfg(target_os = "none")]
pub fn init(madt: &apic::MadtInfo, hpet_table: Option<&hpet::HpetInfo>, map_mmio: MmioMapper) {
	interrupts::install_vector_file();
	apic::setup_apics(madt, map_mmio);
	if !hpet::init_hpet(hpet_table, map_mmio) {
		info!("No HPET present; timing falls back to the PIT");
	}
	pit::init_pit();
	crate::interrupts::update_routing();
	crate::time::initialize();
	crate::time::init_timer_queue();
}
