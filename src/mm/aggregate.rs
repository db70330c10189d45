//! Cross-range allocation.
//!
//! The aggregate allocator owns every [`RangeAllocator`] and routes
//! requests between them: allocations go to the range advertising the
//! most slack (ties broken by range index), frees go to the range whose
//! augmented search tree subtree contains the page's address. A free
//! whose address no range covers is a hard fault.

use alloc::vec::Vec;

use hermit_sync::OnceCell;
use memory_addresses::PhysAddr;

use super::pressure::{Pressure, PressureBitmap};
use super::range_alloc::RangeAllocator;
use super::{
	AllocError, MemoryStatistics, PageRef, PhysMemoryRange, SMALL_PAGE_SIZE,
	SMALL_PAGES_PER_BIG_PAGE,
};
use crate::collections::rbtree::{NodeId, RbTree, RbValue};

struct RangeEntry {
	start: u64,
	end: u64,
	index: usize,
}

#[derive(Clone, PartialEq)]
struct SubtreeRange {
	min_start: u64,
	max_end: u64,
}

impl RbValue for RangeEntry {
	type Key = u64;
	type Aug = SubtreeRange;

	fn key(&self) -> u64 {
		self.start
	}

	fn augment(
		_node: NodeId,
		value: &Self,
		left: Option<&SubtreeRange>,
		right: Option<&SubtreeRange>,
	) -> SubtreeRange {
		SubtreeRange {
			min_start: left.map_or(value.start, |l| l.min_start),
			max_end: right.map_or(value.end, |r| r.max_end.max(value.end)),
		}
	}
}

pub struct AggregateAllocator {
	ranges: Vec<RangeAllocator>,
	tree: RbTree<RangeEntry>,
	pressure: PressureBitmap,
}

impl AggregateAllocator {
	pub fn new(ranges: Vec<RangeAllocator>) -> Self {
		let mut tree = RbTree::new();
		let pressure = PressureBitmap::new(ranges.len());
		for (index, allocator) in ranges.iter().enumerate() {
			let range = allocator.range();
			tree.insert(RangeEntry {
				start: range.start.as_u64(),
				end: range.end.as_u64(),
				index,
			});
			pressure.set(index, allocator.range_pressure());
		}
		Self {
			ranges,
			tree,
			pressure,
		}
	}

	pub fn range_count(&self) -> usize {
		self.ranges.len()
	}

	pub fn range(&self, index: usize) -> &RangeAllocator {
		&self.ranges[index]
	}

	fn refresh_pressure(&self, index: usize) {
		self.pressure.set(index, self.ranges[index].range_pressure());
	}

	/// Range whose region contains `addr`, found through the augmented
	/// search tree.
	fn range_containing(&self, addr: PhysAddr) -> Option<usize> {
		let addr = addr.as_u64();
		let mut current = self.tree.root();
		while let Some(node) = current {
			let aug = self.tree.aug(node);
			if addr < aug.min_start || addr >= aug.max_end {
				return None;
			}
			let entry = self.tree.get(node);
			if addr >= entry.start && addr < entry.end {
				return Some(entry.index);
			}
			current = if addr < entry.start {
				self.tree.left(node)
			} else {
				// Ranges never overlap, so anything past this entry's
				// start lives in the right subtree.
				self.tree.right(node)
			};
		}
		None
	}

	/// Ranges in preference order: most slack first, index as the tie
	/// break within a level.
	fn ranges_by_preference(&self) -> impl Iterator<Item = usize> + '_ {
		Pressure::all()
			.into_iter()
			.flat_map(|level| self.pressure.keys_at(level))
	}

	pub fn allocate_small_page(&self, color: Option<u8>) -> Option<PhysAddr> {
		for index in self.ranges_by_preference() {
			if let Some(addr) = self.ranges[index].allocate_small_page(color) {
				self.refresh_pressure(index);
				return Some(addr);
			}
		}
		None
	}

	pub fn allocate_big_page(&self) -> Option<PhysAddr> {
		for index in self.ranges_by_preference() {
			if let Some(addr) = self.ranges[index].allocate_big_page() {
				self.refresh_pressure(index);
				return Some(addr);
			}
		}
		None
	}

	fn allocate_small_run(&self, count: usize) -> Option<PageRef> {
		for index in self.ranges_by_preference() {
			if let Some(run) = self.ranges[index].allocate_small_run(count) {
				self.refresh_pressure(index);
				return Some(run);
			}
		}
		None
	}

	/// Allocate at least `bytes` of physical memory as a mix of big
	/// pages and small-page runs. On failure everything acquired so far
	/// is returned.
	pub fn allocate_pages(&self, bytes: usize) -> Result<Vec<PageRef>, AllocError> {
		let mut pages = Vec::new();
		let mut remaining = bytes.div_ceil(SMALL_PAGE_SIZE);

		while remaining >= SMALL_PAGES_PER_BIG_PAGE {
			match self.allocate_big_page() {
				Some(addr) => {
					pages.push(PageRef::big(addr));
					remaining -= SMALL_PAGES_PER_BIG_PAGE;
				}
				None => break,
			}
		}
		if remaining > 0 {
			if let Some(run) = self.allocate_small_run(remaining) {
				pages.push(run);
				remaining = 0;
			}
		}
		while remaining > 0 {
			match self.allocate_small_page(None) {
				Some(addr) => {
					pages.push(PageRef::small(addr));
					remaining -= 1;
				}
				None => {
					self.free_pages(&pages);
					return Err(AllocError::OutOfMemory);
				}
			}
		}
		Ok(pages)
	}

	/// Free a batch, routing each run to its owning range. Freeing an
	/// address outside every range is a hard fault.
	pub fn free_pages(&self, refs: &[PageRef]) {
		let mut i = 0;
		while i < refs.len() {
			let index = self
				.range_containing(refs[i].addr())
				.unwrap_or_else(|| {
					panic!("free of unmanaged physical address {:#x}", refs[i].addr())
				});
			let mut j = i + 1;
			while j < refs.len() && self.range_containing(refs[j].addr()) == Some(index) {
				j += 1;
			}
			self.ranges[index].free_pages(&refs[i..j]);
			self.refresh_pressure(index);
			i = j;
		}
	}

	/// Reserve an address range (e.g. the kernel image) in every range
	/// it overlaps.
	pub fn reserve_physical_range(&self, reserve: PhysMemoryRange) {
		for (index, allocator) in self.ranges.iter().enumerate() {
			let range = allocator.range();
			if reserve.start < range.end && reserve.end > range.start {
				allocator.reserve_physical_range(reserve);
				self.refresh_pressure(index);
			}
		}
	}

	pub fn statistics(&self) -> MemoryStatistics {
		let mut stats = MemoryStatistics::default();
		for allocator in &self.ranges {
			let pools = allocator.pool_count();
			stats.free_big_page_count.push(
				(0..pools)
					.map(|pool| allocator.pool_free_big_pages(pool))
					.collect(),
			);
			stats.free_small_page_count.push(
				(0..pools)
					.map(|pool| allocator.pool_free_small_pages(pool))
					.collect(),
			);
			stats
				.global_pool_size
				.push(allocator.pool_free_big_pages(allocator.global_pool()));
		}
		stats
	}
}

/// One usable region plus the pre-reserved, zeroed metadata buffer boot
/// glue carved out for it (sized by
/// [`RangeAllocator::required_metadata_size`]).
pub struct RangeSeed {
	pub range: PhysMemoryRange,
	pub metadata: *mut u8,
}

static PAGE_ALLOCATOR: OnceCell<AggregateAllocator> = OnceCell::new();

/// Initialize the system-wide page allocator.
///
/// # Safety
///
/// Every seed's metadata buffer must satisfy the contract of
/// [`RangeAllocator::new`].
pub unsafe fn init(seeds: &[RangeSeed], cpu_count: usize) {
	let ranges = seeds
		.iter()
		.map(|seed| unsafe { RangeAllocator::new(seed.range, cpu_count, seed.metadata) })
		.collect();
	PAGE_ALLOCATOR
		.set(AggregateAllocator::new(ranges))
		.ok()
		.expect("page allocator initialized twice");
	info!("page allocator initialized with {} ranges", seeds.len());
}

fn instance() -> &'static AggregateAllocator {
	PAGE_ALLOCATOR.get().expect("page allocator not initialized")
}

pub fn allocate_pages(bytes: usize) -> Result<Vec<PageRef>, AllocError> {
	instance().allocate_pages(bytes)
}

pub fn free_pages(refs: &[PageRef]) {
	instance().free_pages(refs);
}

pub fn reserve_physical_range(range: PhysMemoryRange) {
	instance().reserve_physical_range(range);
}

pub fn memory_statistics() -> MemoryStatistics {
	instance().statistics()
}

#[cfg(test)]
mod tests {
	use std::vec::Vec;

	use super::super::range_alloc::RangeAllocator;
	use super::super::BIG_PAGE_SIZE;
	use super::*;

	struct TestBuffer {
		_storage: Vec<u64>,
		ptr: *mut u8,
	}

	fn seed_range(start: u64, size: u64, cpu_count: usize) -> (RangeAllocator, TestBuffer) {
		let range = PhysMemoryRange::new(PhysAddr::new(start), PhysAddr::new(start + size));
		let bytes = RangeAllocator::required_metadata_size(range, cpu_count);
		let mut storage = vec![0u64; bytes.div_ceil(8)];
		let ptr = storage.as_mut_ptr().cast::<u8>();
		let allocator = unsafe { RangeAllocator::new(range, cpu_count, ptr) };
		(
			allocator,
			TestBuffer {
				_storage: storage,
				ptr,
			},
		)
	}

	fn two_range_aggregate() -> (AggregateAllocator, Vec<TestBuffer>) {
		// Range 0 is small enough to sit below its comfort threshold;
		// range 1 has plenty of slack.
		let (a, buf_a) = seed_range(0x20_0000, 5 * BIG_PAGE_SIZE as u64, 1);
		let (b, buf_b) = seed_range(0x1_0000_0000, 64 * BIG_PAGE_SIZE as u64, 1);
		(AggregateAllocator::new(vec![a, b]), vec![buf_a, buf_b])
	}

	#[test]
	fn frees_route_to_the_owning_range() {
		let (aggregate, _buffers) = two_range_aggregate();
		let small = aggregate.allocate_small_page(None).unwrap();
		let big = aggregate.allocate_big_page().unwrap();

		let owner_small = aggregate.range_containing(small).unwrap();
		let owner_big = aggregate.range_containing(big).unwrap();
		aggregate.free_pages(&[PageRef::small(small), PageRef::big(big)]);

		assert_eq!(
			aggregate.range(owner_small).free_small_page_count(),
			aggregate.range(owner_small).big_page_count() * SMALL_PAGES_PER_BIG_PAGE
		);
		assert_eq!(
			aggregate.range(owner_big).free_big_page_count(),
			aggregate.range(owner_big).big_page_count()
		);
	}

	#[test]
	fn allocation_prefers_the_range_with_more_slack() {
		let (aggregate, _buffers) = two_range_aggregate();
		// Range 0 is small (16 big pages => comfortable at best);
		// range 1 is surplus. Allocations must go there first.
		let addr = aggregate.allocate_big_page().unwrap();
		assert_eq!(aggregate.range_containing(addr), Some(1));
		aggregate.free_pages(&[PageRef::big(addr)]);
	}

	#[test]
	fn bulk_allocation_covers_the_request() {
		let (aggregate, _buffers) = two_range_aggregate();
		let bytes = 3 * BIG_PAGE_SIZE + 5 * SMALL_PAGE_SIZE;
		let pages = aggregate.allocate_pages(bytes).unwrap();
		let total: usize = pages.iter().map(|p| p.size_in_bytes()).sum();
		assert!(total >= bytes);
		aggregate.free_pages(&pages);
	}

	#[test]
	#[should_panic(expected = "unmanaged physical address")]
	fn freeing_an_uncovered_address_faults() {
		let (aggregate, _buffers) = two_range_aggregate();
		aggregate.free_pages(&[PageRef::small(PhysAddr::new(0x9_0000_0000))]);
	}

	#[test]
	fn containment_queries_use_the_tree() {
		let (aggregate, _buffers) = two_range_aggregate();
		assert_eq!(aggregate.range_containing(PhysAddr::new(0x20_0000)), Some(0));
		assert_eq!(
			aggregate.range_containing(PhysAddr::new(0x1_0000_0000)),
			Some(1)
		);
		assert_eq!(aggregate.range_containing(PhysAddr::new(0x10_0000)), None);
		assert_eq!(
			aggregate.range_containing(PhysAddr::new(0x8000_0000)),
			None
		);
	}
}
