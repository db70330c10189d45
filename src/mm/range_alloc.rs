//! Per-range physical page allocator.
//!
//! A range allocator owns one contiguous physical region. The big pages
//! fully contained in the region are partitioned into per-CPU pools plus
//! one global pool; each pool tracks its pages in intrusive free,
//! partial, and full lists (links stored inside the per-page metadata,
//! arena-indexed) and per-color lists for cache-color-aware placement.
//! Small pages are carved out of big pages through a forward-and-
//! backward permutation with lazy initialization.
//!
//! Locking: a pool's lists and counters are guarded by the pool's
//! priority spinlock (normal flavor from the owning CPU, priority flavor
//! for cross-CPU traffic). Each big page additionally carries its own
//! priority spinlock guarding the embedded small-page allocator;
//! stealing takes it with bounded retries and gives up on contention
//! rather than blocking.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use align_address::Align;
use memory_addresses::PhysAddr;
use smallvec::SmallVec;

use super::pressure::{Pressure, PressureBitmap};
use super::{BIG_PAGE_SIZE, PageRef, PhysMemoryRange, SMALL_PAGE_SIZE, SMALL_PAGES_PER_BIG_PAGE};
use crate::arch::{cpu, irq};
use crate::synch::MpmcRingBuffer;
use crate::synch::spinlock::RawPrioritySpinlock;

pub const MAX_BATCH_SIZE: usize = 32;
pub const LOCK_RETRY_COUNT: usize = 4;
pub const LOCK_DELAY_ITERATIONS: usize = 100;
pub const MAX_COLOR_COUNT: usize = 0x20;
pub const MODERATE_THRESHOLD_MINIMUM: usize = 4;

const DEFERRED_QUEUE_CAPACITY: usize = 2 * MAX_BATCH_SIZE;

const NO_INDEX: u32 = u32::MAX;
const NO_COLOR: u8 = u8::MAX;
const UNCOLORED_LIST: usize = MAX_COLOR_COUNT;

/// How hard the caller is willing to fight for memory. Escalated one
/// step at a time on failure; only the final step may block on remote
/// pool locks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Desperation {
	Relaxed,
	Moderate,
	Desperate,
}

impl Desperation {
	fn steal_levels(self) -> &'static [Pressure] {
		match self {
			Self::Relaxed => &[Pressure::Surplus],
			Self::Moderate => &[Pressure::Surplus, Pressure::Comfortable],
			Self::Desperate => &[Pressure::Surplus, Pressure::Comfortable, Pressure::Moderate],
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PageState {
	Free,
	Partial,
	Full,
}

struct BigPageMeta {
	state: PageState,
	big_allocation: bool,
	pool: u16,
	color: u8,
	prev: u32,
	next: u32,
	color_prev: u32,
	color_next: u32,
	occupied_start: u16,
	initialized: u16,
}

struct PoolInner {
	free_head: u32,
	partial_head: u32,
	full_head: u32,
	color_partial_heads: [u32; MAX_COLOR_COUNT + 1],
	color_free_heads: [u32; MAX_COLOR_COUNT + 1],
	free_big_pages: usize,
	free_small_pages: usize,
}

impl PoolInner {
	fn new() -> Self {
		Self {
			free_head: NO_INDEX,
			partial_head: NO_INDEX,
			full_head: NO_INDEX,
			color_partial_heads: [NO_INDEX; MAX_COLOR_COUNT + 1],
			color_free_heads: [NO_INDEX; MAX_COLOR_COUNT + 1],
			free_big_pages: 0,
			free_small_pages: 0,
		}
	}
}

struct Pool {
	lock: RawPrioritySpinlock,
	inner: UnsafeCell<PoolInner>,
	/// Frees arriving from other CPUs, handled at this pool's next lock
	/// acquisition.
	deferred: MpmcRingBuffer<PageRef>,
}

#[derive(Clone, Copy, Debug)]
pub struct Thresholds {
	pub surplus: usize,
	pub comfort: usize,
	pub moderate: usize,
}

impl Thresholds {
	fn for_range(big_count: usize, cpu_count: usize) -> Self {
		let per_cpu = big_count / cpu_count;
		Self {
			surplus: (per_cpu / 2).max(4 * MODERATE_THRESHOLD_MINIMUM),
			comfort: (per_cpu / 4).max(2 * MODERATE_THRESHOLD_MINIMUM),
			moderate: (per_cpu / 8).max(MODERATE_THRESHOLD_MINIMUM),
		}
	}

	fn classify(&self, free_big_pages: usize) -> Pressure {
		if free_big_pages == 0 {
			Pressure::Desperate
		} else if free_big_pages < self.moderate {
			Pressure::Moderate
		} else if free_big_pages < self.comfort {
			Pressure::Comfortable
		} else {
			Pressure::Surplus
		}
	}
}

/// Allocator for the big pages fully contained in one physical region.
pub struct RangeAllocator {
	range: PhysMemoryRange,
	big_base: PhysAddr,
	big_count: usize,
	cpu_pools: usize,
	thresholds: Thresholds,
	pools: Box<[Pool]>,
	pressure: PressureBitmap,
	total_free_big: AtomicUsize,
	meta: *mut BigPageMeta,
	page_locks: *const RawPrioritySpinlock,
	perm: *mut u16,
}

unsafe impl Send for RangeAllocator {}
unsafe impl Sync for RangeAllocator {}

fn contained_big_pages(range: PhysMemoryRange) -> (PhysAddr, usize) {
	let base = PhysAddr::new(range.start.as_u64().align_up(BIG_PAGE_SIZE as u64));
	let end = range.end.as_u64().align_down(BIG_PAGE_SIZE as u64);
	let count = end.saturating_sub(base.as_u64()) as usize / BIG_PAGE_SIZE;
	(base, count)
}

const fn align_up_usize(value: usize, align: usize) -> usize {
	(value + align - 1) & !(align - 1)
}

impl RangeAllocator {
	/// Bytes of pre-reserved, zeroed metadata [`Self::new`] needs for
	/// this range. Boot glue carves this out of the range itself before
	/// the allocator exists.
	pub fn required_metadata_size(range: PhysMemoryRange, _cpu_count: usize) -> usize {
		let (_, big_count) = contained_big_pages(range);
		let mut size = 0usize;
		size = align_up_usize(size, mem::align_of::<BigPageMeta>());
		size += big_count * mem::size_of::<BigPageMeta>();
		size = align_up_usize(size, mem::align_of::<RawPrioritySpinlock>());
		size += big_count * mem::size_of::<RawPrioritySpinlock>();
		size = align_up_usize(size, mem::align_of::<u16>());
		size += big_count * 2 * SMALL_PAGES_PER_BIG_PAGE * mem::size_of::<u16>();
		size + 64
	}

	/// Create the allocator over `range` with `cpu_count` per-CPU pools
	/// plus the global pool.
	///
	/// # Safety
	///
	/// `buffer` must point to at least
	/// [`required_metadata_size`](Self::required_metadata_size) zeroed
	/// bytes, 8-byte aligned, exclusively owned by this allocator for
	/// the rest of its lifetime.
	pub unsafe fn new(range: PhysMemoryRange, cpu_count: usize, buffer: *mut u8) -> Self {
		assert!(cpu_count >= 1);
		let (big_base, big_count) = contained_big_pages(range);
		assert!(big_count > 0, "range too small for a big page");

		let mut offset = 0usize;
		offset = align_up_usize(offset, mem::align_of::<BigPageMeta>());
		let meta = unsafe { buffer.add(offset) }.cast::<BigPageMeta>();
		offset += big_count * mem::size_of::<BigPageMeta>();
		offset = align_up_usize(offset, mem::align_of::<RawPrioritySpinlock>());
		let page_locks = unsafe { buffer.add(offset) }.cast::<RawPrioritySpinlock>();
		offset += big_count * mem::size_of::<RawPrioritySpinlock>();
		offset = align_up_usize(offset, mem::align_of::<u16>());
		let perm = unsafe { buffer.add(offset) }.cast::<u16>();

		let mut pools = Vec::with_capacity(cpu_count + 1);
		for _ in 0..=cpu_count {
			pools.push(Pool {
				lock: RawPrioritySpinlock::new(),
				inner: UnsafeCell::new(PoolInner::new()),
				deferred: MpmcRingBuffer::new(DEFERRED_QUEUE_CAPACITY),
			});
		}

		let allocator = Self {
			range,
			big_base,
			big_count,
			cpu_pools: cpu_count,
			thresholds: Thresholds::for_range(big_count, cpu_count),
			pools: pools.into_boxed_slice(),
			pressure: PressureBitmap::new(cpu_count + 1),
			total_free_big: AtomicUsize::new(big_count),
			meta,
			page_locks,
			perm,
		};

		// Distribute the big pages over the CPU pools in contiguous
		// chunks; the global pool starts empty and fills through frees
		// and rebalancing.
		for page in 0..big_count as u32 {
			let pool = (page as usize * cpu_count / big_count) as u16;
			unsafe {
				allocator.meta.add(page as usize).write(BigPageMeta {
					state: PageState::Free,
					big_allocation: false,
					pool,
					color: NO_COLOR,
					prev: NO_INDEX,
					next: NO_INDEX,
					color_prev: NO_INDEX,
					color_next: NO_INDEX,
					occupied_start: 0,
					initialized: 0,
				});
				allocator
					.page_locks
					.add(page as usize)
					.cast_mut()
					.write(RawPrioritySpinlock::new());
			}
		}
		for page in 0..big_count as u32 {
			let pool = unsafe { (*allocator.meta.add(page as usize)).pool } as usize;
			let inner = unsafe { &mut *allocator.pools[pool].inner.get() };
			unsafe {
				allocator.attach(inner, page);
			}
			inner.free_big_pages += 1;
			inner.free_small_pages += SMALL_PAGES_PER_BIG_PAGE;
		}
		for pool in 0..=cpu_count {
			let free = unsafe { &*allocator.pools[pool].inner.get() }.free_big_pages;
			allocator
				.pressure
				.set(pool, allocator.thresholds.classify(free));
		}

		allocator
	}

	pub fn range(&self) -> PhysMemoryRange {
		self.range
	}

	pub fn big_page_count(&self) -> usize {
		self.big_count
	}

	pub fn pool_count(&self) -> usize {
		self.cpu_pools + 1
	}

	pub fn global_pool(&self) -> usize {
		self.cpu_pools
	}

	pub fn thresholds(&self) -> Thresholds {
		self.thresholds
	}

	pub fn contains(&self, addr: PhysAddr) -> bool {
		self.range.contains(addr)
	}

	/// Free big pages across all pools; may be momentarily stale.
	pub fn total_free_big_pages(&self) -> usize {
		self.total_free_big.load(Ordering::Relaxed)
	}

	/// Pressure of the whole range, classified against the pool
	/// thresholds scaled to the pool count.
	pub fn range_pressure(&self) -> Pressure {
		let scaled = Thresholds {
			surplus: self.thresholds.surplus * self.cpu_pools,
			comfort: self.thresholds.comfort * self.cpu_pools,
			moderate: self.thresholds.moderate * self.cpu_pools,
		};
		scaled.classify(self.total_free_big_pages())
	}

	pub fn pool_pressure(&self, pool: usize) -> Pressure {
		self.pressure.get(pool)
	}

	fn current_pool(&self) -> usize {
		(cpu::core_id() as usize).min(self.cpu_pools - 1)
	}

	// --- metadata and permutation plumbing ---
	//
	// All raw accesses below require the corresponding pool and/or page
	// lock; the allocator never hands the references out.

	#[allow(clippy::mut_from_ref)]
	unsafe fn page_meta(&self, page: u32) -> &mut BigPageMeta {
		debug_assert!((page as usize) < self.big_count);
		unsafe { &mut *self.meta.add(page as usize) }
	}

	fn page_lock(&self, page: u32) -> &RawPrioritySpinlock {
		unsafe { &*self.page_locks.add(page as usize) }
	}

	unsafe fn fw(&self, page: u32) -> *mut u16 {
		unsafe {
			self.perm
				.add(page as usize * 2 * SMALL_PAGES_PER_BIG_PAGE)
		}
	}

	unsafe fn bw(&self, page: u32) -> *mut u16 {
		unsafe { self.fw(page).add(SMALL_PAGES_PER_BIG_PAGE) }
	}

	fn page_addr(&self, page: u32) -> PhysAddr {
		self.big_base + (page as u64) * BIG_PAGE_SIZE as u64
	}

	fn page_of(&self, addr: PhysAddr) -> u32 {
		debug_assert!(addr >= self.big_base);
		let page = (addr.as_u64() - self.big_base.as_u64()) / BIG_PAGE_SIZE as u64;
		debug_assert!((page as usize) < self.big_count);
		page as u32
	}

	/// Materialize identity entries of the lazy permutation up to and
	/// including `index`.
	unsafe fn small_ensure_init(&self, page: u32, index: u16) {
		let initialized = unsafe { self.page_meta(page) }.initialized;
		if initialized > index {
			return;
		}
		let fw = unsafe { self.fw(page) };
		let bw = unsafe { self.bw(page) };
		for i in initialized..=index {
			unsafe {
				fw.add(i as usize).write(i);
				bw.add(i as usize).write(i);
			}
		}
		unsafe { self.page_meta(page) }.initialized = index + 1;
	}

	/// Take the small page at the free/occupied boundary.
	unsafe fn small_alloc(&self, page: u32) -> u16 {
		let pos = unsafe { self.page_meta(page) }.occupied_start;
		debug_assert!((pos as usize) < SMALL_PAGES_PER_BIG_PAGE);
		unsafe { self.small_ensure_init(page, pos) };
		let index = unsafe { self.fw(page).add(pos as usize).read() };
		unsafe { self.page_meta(page) }.occupied_start = pos + 1;
		index
	}

	/// Allocate one specific small page, wherever it sits in the free
	/// region.
	unsafe fn small_alloc_specific(&self, page: u32, index: u16) {
		unsafe { self.small_ensure_init(page, index) };
		let occupied = unsafe { self.page_meta(page) }.occupied_start;
		let pos = unsafe { self.bw(page).add(index as usize).read() };
		assert!(pos >= occupied, "small page is already allocated");
		unsafe { self.small_swap(page, pos, occupied) };
		unsafe { self.page_meta(page) }.occupied_start = occupied + 1;
	}

	unsafe fn small_free(&self, page: u32, index: u16) {
		let meta = unsafe { self.page_meta(page) };
		assert!(meta.occupied_start > 0, "free of an unallocated small page");
		let pos = unsafe { self.bw(page).add(index as usize).read() };
		assert!(
			pos < meta.occupied_start,
			"double free of a small page"
		);
		meta.occupied_start -= 1;
		let last = meta.occupied_start;
		unsafe { self.small_swap(page, pos, last) };
	}

	unsafe fn small_swap(&self, page: u32, a: u16, b: u16) {
		if a == b {
			return;
		}
		let fw = unsafe { self.fw(page) };
		let bw = unsafe { self.bw(page) };
		unsafe {
			let ea = fw.add(a as usize).read();
			let eb = fw.add(b as usize).read();
			fw.add(a as usize).write(eb);
			fw.add(b as usize).write(ea);
			bw.add(ea as usize).write(b);
			bw.add(eb as usize).write(a);
		}
	}

	fn small_free_count(&self, occupied_start: u16) -> u16 {
		SMALL_PAGES_PER_BIG_PAGE as u16 - occupied_start
	}

	// --- intrusive list plumbing ---

	unsafe fn list_push_front(&self, head: &mut u32, page: u32) {
		let old = *head;
		{
			let meta = unsafe { self.page_meta(page) };
			meta.prev = NO_INDEX;
			meta.next = old;
		}
		if old != NO_INDEX {
			unsafe { self.page_meta(old) }.prev = page;
		}
		*head = page;
	}

	unsafe fn list_remove(&self, head: &mut u32, page: u32) {
		let (prev, next) = {
			let meta = unsafe { self.page_meta(page) };
			(meta.prev, meta.next)
		};
		if prev != NO_INDEX {
			unsafe { self.page_meta(prev) }.next = next;
		} else {
			debug_assert_eq!(*head, page);
			*head = next;
		}
		if next != NO_INDEX {
			unsafe { self.page_meta(next) }.prev = prev;
		}
		let meta = unsafe { self.page_meta(page) };
		meta.prev = NO_INDEX;
		meta.next = NO_INDEX;
	}

	unsafe fn clist_push_front(&self, head: &mut u32, page: u32) {
		let old = *head;
		{
			let meta = unsafe { self.page_meta(page) };
			meta.color_prev = NO_INDEX;
			meta.color_next = old;
		}
		if old != NO_INDEX {
			unsafe { self.page_meta(old) }.color_prev = page;
		}
		*head = page;
	}

	unsafe fn clist_remove(&self, head: &mut u32, page: u32) {
		let (prev, next) = {
			let meta = unsafe { self.page_meta(page) };
			(meta.color_prev, meta.color_next)
		};
		if prev != NO_INDEX {
			unsafe { self.page_meta(prev) }.color_next = next;
		} else {
			debug_assert_eq!(*head, page);
			*head = next;
		}
		if next != NO_INDEX {
			unsafe { self.page_meta(next) }.color_prev = prev;
		}
		let meta = unsafe { self.page_meta(page) };
		meta.color_prev = NO_INDEX;
		meta.color_next = NO_INDEX;
	}

	fn color_list_index(color: u8) -> usize {
		if color == NO_COLOR {
			UNCOLORED_LIST
		} else {
			color as usize
		}
	}

	/// Unlink a page from the lists matching its current state.
	unsafe fn detach(&self, inner: &mut PoolInner, page: u32) {
		let (state, color) = {
			let meta = unsafe { self.page_meta(page) };
			(meta.state, meta.color)
		};
		let color_list = Self::color_list_index(color);
		match state {
			PageState::Free => unsafe {
				self.list_remove(&mut inner.free_head, page);
				self.clist_remove(&mut inner.color_free_heads[color_list], page);
			},
			PageState::Partial => unsafe {
				self.list_remove(&mut inner.partial_head, page);
				self.clist_remove(&mut inner.color_partial_heads[color_list], page);
			},
			PageState::Full => unsafe {
				self.list_remove(&mut inner.full_head, page);
			},
		}
	}

	/// Link a page into the lists matching its current state.
	unsafe fn attach(&self, inner: &mut PoolInner, page: u32) {
		let (state, color) = {
			let meta = unsafe { self.page_meta(page) };
			(meta.state, meta.color)
		};
		let color_list = Self::color_list_index(color);
		match state {
			PageState::Free => unsafe {
				self.list_push_front(&mut inner.free_head, page);
				self.clist_push_front(&mut inner.color_free_heads[color_list], page);
			},
			PageState::Partial => unsafe {
				self.list_push_front(&mut inner.partial_head, page);
				self.clist_push_front(&mut inner.color_partial_heads[color_list], page);
			},
			PageState::Full => unsafe {
				self.list_push_front(&mut inner.full_head, page);
			},
		}
	}

	fn state_for(&self, occupied_start: u16, big_allocation: bool) -> PageState {
		if big_allocation || occupied_start as usize == SMALL_PAGES_PER_BIG_PAGE {
			PageState::Full
		} else if occupied_start == 0 {
			PageState::Free
		} else {
			PageState::Partial
		}
	}

	fn update_pressure(&self, pool: usize, inner: &PoolInner) {
		self.pressure
			.set(pool, self.thresholds.classify(inner.free_big_pages));
	}

	// --- pool locking ---

	fn lock_pool(&self, pool: usize, priority: bool) -> bool {
		let was_enabled = irq::nested_disable();
		if priority {
			self.pools[pool].lock.lock_priority();
		} else {
			self.pools[pool].lock.lock();
		}
		was_enabled
	}

	fn try_lock_pool(&self, pool: usize) -> Option<bool> {
		let was_enabled = irq::nested_disable();
		if self.pools[pool]
			.lock
			.try_lock_priority_with_retries(LOCK_RETRY_COUNT, LOCK_DELAY_ITERATIONS)
		{
			Some(was_enabled)
		} else {
			irq::nested_enable(was_enabled);
			None
		}
	}

	fn unlock_pool(&self, pool: usize, was_enabled: bool) {
		self.pools[pool].lock.unlock();
		irq::nested_enable(was_enabled);
	}

	fn unlock_pool_priority(&self, pool: usize, was_enabled: bool) {
		self.pools[pool].lock.unlock_priority();
		irq::nested_enable(was_enabled);
	}

	#[allow(clippy::mut_from_ref)]
	unsafe fn pool_inner(&self, pool: usize) -> &mut PoolInner {
		unsafe { &mut *self.pools[pool].inner.get() }
	}

	/// Apply frees other CPUs queued for this pool. Called with the
	/// pool lock held.
	unsafe fn drain_deferred(&self, pool: usize, inner: &mut PoolInner) {
		loop {
			let mut batch: SmallVec<[PageRef; MAX_BATCH_SIZE]> = SmallVec::new();
			let drained = self.pools[pool]
				.deferred
				.bulk_read_best_effort(MAX_BATCH_SIZE, |_, page_ref| batch.push(page_ref));
			for page_ref in &batch {
				unsafe {
					self.apply_free(pool, inner, *page_ref);
				}
			}
			if drained < MAX_BATCH_SIZE {
				break;
			}
		}
	}

	// --- allocation ---

	/// Allocate one small page, optionally from a specific color class.
	pub fn allocate_small_page(&self, color: Option<u8>) -> Option<PhysAddr> {
		if let Some(color) = color {
			assert!((color as usize) < MAX_COLOR_COUNT);
		}
		let pool = self.current_pool();
		for desperation in [
			Desperation::Relaxed,
			Desperation::Moderate,
			Desperation::Desperate,
		] {
			if let Some(addr) = self.try_allocate_small_local(pool, color, desperation) {
				return Some(addr);
			}
			if self.try_steal_big_page(pool, desperation) {
				if let Some(addr) = self.try_allocate_small_local(pool, color, desperation) {
					return Some(addr);
				}
			}
		}
		None
	}

	fn try_allocate_small_local(
		&self,
		pool: usize,
		color: Option<u8>,
		desperation: Desperation,
	) -> Option<PhysAddr> {
		let was_enabled = self.lock_pool(pool, false);
		let inner = unsafe { self.pool_inner(pool) };
		unsafe {
			self.drain_deferred(pool, inner);
		}

		let Some(page) = self.select_page(inner, color, desperation) else {
			self.unlock_pool(pool, was_enabled);
			return None;
		};

		self.page_lock(page).lock();
		unsafe {
			self.detach(inner, page);
		}
		let old_state = unsafe { self.page_meta(page) }.state;
		if let Some(color) = color {
			let meta = unsafe { self.page_meta(page) };
			if meta.color == NO_COLOR {
				// An uncolored page joins the color class of its first
				// colored allocation.
				meta.color = color;
			}
		}
		let index = unsafe { self.small_alloc(page) };
		{
			let occupied = unsafe { self.page_meta(page) }.occupied_start;
			let new_state = self.state_for(occupied, false);
			unsafe { self.page_meta(page) }.state = new_state;
		}
		unsafe {
			self.attach(inner, page);
		}
		inner.free_small_pages -= 1;
		if old_state == PageState::Free {
			inner.free_big_pages -= 1;
			self.total_free_big.fetch_sub(1, Ordering::Relaxed);
		}
		self.page_lock(page).unlock();
		self.update_pressure(pool, inner);
		let addr = self.page_addr(page) + (index as u64) * SMALL_PAGE_SIZE as u64;
		self.unlock_pool(pool, was_enabled);
		Some(addr)
	}

	fn select_page(
		&self,
		inner: &PoolInner,
		color: Option<u8>,
		desperation: Desperation,
	) -> Option<u32> {
		let head = |h: u32| (h != NO_INDEX).then_some(h);
		match color {
			Some(color) => head(inner.color_partial_heads[color as usize])
				.or_else(|| head(inner.color_free_heads[color as usize]))
				.or_else(|| head(inner.color_free_heads[UNCOLORED_LIST]))
				.or_else(|| {
					// Color misses only fall back to foreign colors
					// under real memory pressure.
					(desperation >= Desperation::Desperate)
						.then(|| head(inner.partial_head).or_else(|| head(inner.free_head)))
						.flatten()
				}),
			None => head(inner.partial_head).or_else(|| head(inner.free_head)),
		}
	}

	/// Allocate one whole big page.
	pub fn allocate_big_page(&self) -> Option<PhysAddr> {
		let pool = self.current_pool();
		for desperation in [
			Desperation::Relaxed,
			Desperation::Moderate,
			Desperation::Desperate,
		] {
			if let Some(addr) = self.try_allocate_big_local(pool) {
				return Some(addr);
			}
			if self.try_steal_big_page(pool, desperation) {
				if let Some(addr) = self.try_allocate_big_local(pool) {
					return Some(addr);
				}
			}
		}
		None
	}

	fn try_allocate_big_local(&self, pool: usize) -> Option<PhysAddr> {
		let was_enabled = self.lock_pool(pool, false);
		let inner = unsafe { self.pool_inner(pool) };
		unsafe {
			self.drain_deferred(pool, inner);
		}

		// Spare colored pages if an uncolored one is available.
		let page = if inner.color_free_heads[UNCOLORED_LIST] != NO_INDEX {
			inner.color_free_heads[UNCOLORED_LIST]
		} else if inner.free_head != NO_INDEX {
			inner.free_head
		} else {
			self.unlock_pool(pool, was_enabled);
			return None;
		};

		self.page_lock(page).lock();
		unsafe {
			self.detach(inner, page);
		}
		{
			let meta = unsafe { self.page_meta(page) };
			debug_assert_eq!(meta.state, PageState::Free);
			meta.state = PageState::Full;
			meta.big_allocation = true;
		}
		unsafe {
			self.attach(inner, page);
		}
		inner.free_big_pages -= 1;
		inner.free_small_pages -= SMALL_PAGES_PER_BIG_PAGE;
		self.total_free_big.fetch_sub(1, Ordering::Relaxed);
		self.page_lock(page).unlock();
		self.update_pressure(pool, inner);
		let addr = self.page_addr(page);
		self.unlock_pool(pool, was_enabled);
		Some(addr)
	}

	/// Allocate `count` physically consecutive small pages as one run.
	/// Only pristine big pages can satisfy this; returns `None` when
	/// the caller should fall back to single pages.
	pub fn allocate_small_run(&self, count: usize) -> Option<PageRef> {
		assert!(count >= 1 && count <= SMALL_PAGES_PER_BIG_PAGE);
		let pool = self.current_pool();
		let was_enabled = self.lock_pool(pool, false);
		let inner = unsafe { self.pool_inner(pool) };
		unsafe {
			self.drain_deferred(pool, inner);
		}

		// A never-touched permutation is the identity, so the first
		// `count` allocations from it are consecutive.
		let mut candidate = inner.free_head;
		let mut pristine = None;
		let mut scanned = 0;
		while candidate != NO_INDEX && scanned < 8 {
			let meta = unsafe { self.page_meta(candidate) };
			if meta.initialized == 0 && meta.occupied_start == 0 {
				pristine = Some(candidate);
				break;
			}
			candidate = meta.next;
			scanned += 1;
		}
		let Some(page) = pristine else {
			self.unlock_pool(pool, was_enabled);
			return None;
		};

		self.page_lock(page).lock();
		unsafe {
			self.detach(inner, page);
		}
		for _ in 0..count {
			let _ = unsafe { self.small_alloc(page) };
		}
		{
			let occupied = unsafe { self.page_meta(page) }.occupied_start;
			let new_state = self.state_for(occupied, false);
			unsafe { self.page_meta(page) }.state = new_state;
		}
		unsafe {
			self.attach(inner, page);
		}
		inner.free_big_pages -= 1;
		inner.free_small_pages -= count;
		self.total_free_big.fetch_sub(1, Ordering::Relaxed);
		self.page_lock(page).unlock();
		self.update_pressure(pool, inner);
		let addr = self.page_addr(page);
		self.unlock_pool(pool, was_enabled);
		Some(PageRef::small_run(addr, count))
	}

	// --- stealing ---

	/// Move one free big page from a pool advertising enough slack into
	/// `to_pool`. The victim's pool lock is never held across the
	/// transfer; the page's own lock bridges the two critical sections.
	fn try_steal_big_page(&self, to_pool: usize, desperation: Desperation) -> bool {
		for &level in desperation.steal_levels() {
			for victim in self.pressure.keys_at(level) {
				if victim == to_pool {
					continue;
				}
				if let Some(page) = self.grab_free_page(victim, desperation) {
					// Page lock is still held; the page is invisible to
					// both pools until it lands in ours.
					let was_enabled = self.lock_pool(to_pool, false);
					let inner = unsafe { self.pool_inner(to_pool) };
					{
						let meta = unsafe { self.page_meta(page) };
						meta.pool = to_pool as u16;
					}
					unsafe {
						self.attach(inner, page);
					}
					inner.free_big_pages += 1;
					inner.free_small_pages += SMALL_PAGES_PER_BIG_PAGE;
					self.update_pressure(to_pool, inner);
					self.page_lock(page).unlock_priority();
					self.unlock_pool(to_pool, was_enabled);
					return true;
				}
			}
		}
		false
	}

	fn grab_free_page(&self, victim: usize, desperation: Desperation) -> Option<u32> {
		let was_enabled = if desperation == Desperation::Desperate {
			self.lock_pool(victim, true)
		} else {
			self.try_lock_pool(victim)?
		};
		let inner = unsafe { self.pool_inner(victim) };

		let page = inner.free_head;
		if page == NO_INDEX {
			self.unlock_pool_priority(victim, was_enabled);
			return None;
		}
		if !self
			.page_lock(page)
			.try_lock_priority_with_retries(LOCK_RETRY_COUNT, LOCK_DELAY_ITERATIONS)
		{
			// Contended page; give up and let the caller try the next
			// candidate pool.
			self.unlock_pool_priority(victim, was_enabled);
			return None;
		}
		unsafe {
			self.detach(inner, page);
		}
		inner.free_big_pages -= 1;
		inner.free_small_pages -= SMALL_PAGES_PER_BIG_PAGE;
		self.update_pressure(victim, inner);
		self.unlock_pool_priority(victim, was_enabled);
		Some(page)
	}

	// --- freeing ---

	/// Free a batch of page references. Consecutive references into the
	/// same big page are coalesced under one lock acquisition; pages
	/// owned by other pools are deferred to them unless the local pool
	/// is desperate (or the owner's queue is full), in which case the
	/// free blocks on the owner's lock.
	pub fn free_pages(&self, refs: &[PageRef]) {
		let local = self.current_pool();
		let mut i = 0;
		while i < refs.len() {
			let page = self.page_of(refs[i].addr());
			let mut j = i + 1;
			while j < refs.len() && self.page_of(refs[j].addr()) == page {
				j += 1;
			}
			let group = &refs[i..j];
			let owner = unsafe { self.page_meta(page) }.pool as usize;

			if owner == local {
				let was_enabled = self.lock_pool(owner, false);
				let inner = unsafe { self.pool_inner(owner) };
				unsafe {
					self.drain_deferred(owner, inner);
				}
				for page_ref in group {
					unsafe {
						self.apply_free(owner, inner, *page_ref);
					}
				}
				self.unlock_pool(owner, was_enabled);
			} else {
				let desperate = self.pool_pressure(local) == Pressure::Desperate;
				let queued = !desperate
					&& self.pools[owner]
						.deferred
						.try_bulk_write(group.len(), |k| group[k]);
				if !queued {
					let was_enabled = self.lock_pool(owner, true);
					let inner = unsafe { self.pool_inner(owner) };
					for page_ref in group {
						unsafe {
							self.apply_free(owner, inner, *page_ref);
						}
					}
					self.unlock_pool_priority(owner, was_enabled);
				}
			}
			i = j;
		}
	}

	pub fn free_small_page(&self, addr: PhysAddr) {
		self.free_pages(&[PageRef::small(addr)]);
	}

	pub fn free_big_page(&self, addr: PhysAddr) {
		self.free_pages(&[PageRef::big(addr)]);
	}

	/// Return pages to their owning pool. Called with the pool lock
	/// held.
	unsafe fn apply_free(&self, pool: usize, inner: &mut PoolInner, page_ref: PageRef) {
		let page = self.page_of(page_ref.addr());
		debug_assert_eq!(unsafe { self.page_meta(page) }.pool as usize, pool);

		self.page_lock(page).lock();
		if page_ref.is_big() {
			{
				let meta = unsafe { self.page_meta(page) };
				assert!(
					meta.big_allocation,
					"big free of a page not allocated as a big page"
				);
			}
			unsafe {
				self.detach(inner, page);
			}
			{
				let meta = unsafe { self.page_meta(page) };
				meta.big_allocation = false;
				meta.state = PageState::Free;
			}
			unsafe {
				self.attach(inner, page);
			}
			inner.free_big_pages += 1;
			inner.free_small_pages += SMALL_PAGES_PER_BIG_PAGE;
			self.total_free_big.fetch_add(1, Ordering::Relaxed);
		} else {
			let base_index =
				((page_ref.addr().as_u64() % BIG_PAGE_SIZE as u64) / SMALL_PAGE_SIZE as u64) as u16;
			let old_state = unsafe { self.page_meta(page) }.state;
			unsafe {
				self.detach(inner, page);
			}
			for k in 0..page_ref.run_length() as u16 {
				unsafe {
					self.small_free(page, base_index + k);
				}
			}
			let new_state = {
				let meta = unsafe { self.page_meta(page) };
				let state = self.state_for(meta.occupied_start, meta.big_allocation);
				meta.state = state;
				state
			};
			unsafe {
				self.attach(inner, page);
			}
			inner.free_small_pages += page_ref.run_length();
			if old_state != PageState::Free && new_state == PageState::Free {
				inner.free_big_pages += 1;
				self.total_free_big.fetch_add(1, Ordering::Relaxed);
			}
		}
		self.page_lock(page).unlock();
		self.update_pressure(pool, inner);
	}

	// --- reservation ---

	/// Carve an address range (e.g. the kernel image) out of the free
	/// pages. Must run before any allocation can have handed the pages
	/// out.
	pub fn reserve_physical_range(&self, reserve: PhysMemoryRange) {
		let managed_end = self.big_base + (self.big_count * BIG_PAGE_SIZE) as u64;
		let start = reserve.start.max(self.big_base);
		let end = reserve.end.min(managed_end);
		if start >= end {
			return;
		}

		let first_page = self.page_of(PhysAddr::new(
			start.as_u64().align_down(BIG_PAGE_SIZE as u64),
		));
		let last_page = self.page_of(PhysAddr::new(
			(end.as_u64() - 1).align_down(BIG_PAGE_SIZE as u64),
		));

		for page in first_page..=last_page {
			let page_start = self.page_addr(page);
			let page_end = page_start + BIG_PAGE_SIZE as u64;
			let overlap_start = start.max(page_start);
			let overlap_end = end.min(page_end);

			let owner = unsafe { self.page_meta(page) }.pool as usize;
			let was_enabled = self.lock_pool(owner, false);
			let inner = unsafe { self.pool_inner(owner) };
			self.page_lock(page).lock();

			if overlap_start == page_start && overlap_end == page_end {
				let state = unsafe { self.page_meta(page) }.state;
				assert_eq!(
					state,
					PageState::Free,
					"reserved range overlaps allocated memory"
				);
				unsafe {
					self.detach(inner, page);
				}
				{
					let meta = unsafe { self.page_meta(page) };
					meta.state = PageState::Full;
					meta.big_allocation = true;
				}
				unsafe {
					self.attach(inner, page);
				}
				inner.free_big_pages -= 1;
				inner.free_small_pages -= SMALL_PAGES_PER_BIG_PAGE;
				self.total_free_big.fetch_sub(1, Ordering::Relaxed);
			} else {
				let first_small = ((overlap_start.as_u64() - page_start.as_u64())
					/ SMALL_PAGE_SIZE as u64) as u16;
				let last_small = ((overlap_end.as_u64() - page_start.as_u64())
					.div_ceil(SMALL_PAGE_SIZE as u64)) as u16;
				let old_state = unsafe { self.page_meta(page) }.state;
				unsafe {
					self.detach(inner, page);
				}
				for index in first_small..last_small {
					unsafe {
						self.small_alloc_specific(page, index);
					}
				}
				{
					let meta = unsafe { self.page_meta(page) };
					let state = self.state_for(meta.occupied_start, false);
					meta.state = state;
				}
				unsafe {
					self.attach(inner, page);
				}
				inner.free_small_pages -= (last_small - first_small) as usize;
				if old_state == PageState::Free {
					inner.free_big_pages -= 1;
					self.total_free_big.fetch_sub(1, Ordering::Relaxed);
				}
			}

			self.page_lock(page).unlock();
			self.update_pressure(owner, inner);
			self.unlock_pool(owner, was_enabled);
		}
	}

	// --- accounting ---

	pub fn pool_free_big_pages(&self, pool: usize) -> usize {
		let was_enabled = self.lock_pool(pool, false);
		let free = unsafe { self.pool_inner(pool) }.free_big_pages;
		self.unlock_pool(pool, was_enabled);
		free
	}

	pub fn pool_free_small_pages(&self, pool: usize) -> usize {
		let was_enabled = self.lock_pool(pool, false);
		let free = unsafe { self.pool_inner(pool) }.free_small_pages;
		self.unlock_pool(pool, was_enabled);
		free
	}

	pub fn free_big_page_count(&self) -> usize {
		(0..self.pool_count())
			.map(|pool| self.pool_free_big_pages(pool))
			.sum()
	}

	pub fn free_small_page_count(&self) -> usize {
		(0..self.pool_count())
			.map(|pool| self.pool_free_small_pages(pool))
			.sum()
	}

	/// Walk every pool and cross-check the intrusive lists against the
	/// counters. Diagnostic; takes every pool lock in turn.
	pub fn validate_accounting(&self) -> bool {
		for pool in 0..self.pool_count() {
			let was_enabled = self.lock_pool(pool, false);
			let inner = unsafe { self.pool_inner(pool) };

			let mut free_count = 0usize;
			let mut cursor = inner.free_head;
			while cursor != NO_INDEX {
				let meta = unsafe { self.page_meta(cursor) };
				if meta.state != PageState::Free || meta.pool as usize != pool {
					self.unlock_pool(pool, was_enabled);
					return false;
				}
				free_count += 1;
				cursor = meta.next;
			}

			let mut partial_small = 0usize;
			let mut cursor = inner.partial_head;
			while cursor != NO_INDEX {
				let meta = unsafe { self.page_meta(cursor) };
				if meta.state != PageState::Partial || meta.pool as usize != pool {
					self.unlock_pool(pool, was_enabled);
					return false;
				}
				partial_small += self.small_free_count(meta.occupied_start) as usize;
				cursor = meta.next;
			}

			let counts_ok = free_count == inner.free_big_pages
				&& free_count * SMALL_PAGES_PER_BIG_PAGE + partial_small
					== inner.free_small_pages;
			let pressure_ok =
				self.pressure.get(pool) == self.thresholds.classify(inner.free_big_pages);
			self.unlock_pool(pool, was_enabled);
			if !counts_ok || !pressure_ok {
				return false;
			}
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use std::vec::Vec;

	use super::*;

	struct TestBuffer {
		_storage: Vec<u64>,
		ptr: *mut u8,
	}

	fn metadata_buffer(range: PhysMemoryRange, cpu_count: usize) -> TestBuffer {
		let size = RangeAllocator::required_metadata_size(range, cpu_count);
		let mut storage = vec![0u64; size.div_ceil(8)];
		let ptr = storage.as_mut_ptr().cast::<u8>();
		TestBuffer {
			_storage: storage,
			ptr,
		}
	}

	fn make_allocator(start: u64, size: u64, cpu_count: usize) -> (RangeAllocator, TestBuffer) {
		let range = PhysMemoryRange::new(PhysAddr::new(start), PhysAddr::new(start + size));
		let buffer = metadata_buffer(range, cpu_count);
		let allocator = unsafe { RangeAllocator::new(range, cpu_count, buffer.ptr) };
		(allocator, buffer)
	}

	#[test]
	fn small_then_big_then_free_all() {
		// 128 MiB, single CPU: 64 big pages.
		let (allocator, _buffer) = make_allocator(0x20_0000, 0x1000_0000, 1);
		assert_eq!(allocator.big_page_count(), 64);
		assert!(allocator.validate_accounting());

		let mut small = Vec::new();
		for _ in 0..SMALL_PAGES_PER_BIG_PAGE {
			small.push(allocator.allocate_small_page(None).unwrap());
		}
		let big = allocator.allocate_big_page().unwrap();
		assert_eq!(big.as_u64() % BIG_PAGE_SIZE as u64, 0);
		assert!(allocator.validate_accounting());

		let mut refs: Vec<PageRef> = small.iter().map(|&addr| PageRef::small(addr)).collect();
		refs.push(PageRef::big(big));
		allocator.free_pages(&refs);

		assert_eq!(allocator.free_big_page_count(), 64);
		assert_eq!(
			allocator.free_small_page_count(),
			64 * SMALL_PAGES_PER_BIG_PAGE
		);
		assert_eq!(allocator.pool_pressure(0), Pressure::Surplus);
		assert!(allocator.validate_accounting());
	}

	#[test]
	fn small_pages_within_one_big_page_are_distinct() {
		let (allocator, _buffer) = make_allocator(0, 0x1000_0000, 1);
		let mut seen = Vec::new();
		for _ in 0..SMALL_PAGES_PER_BIG_PAGE {
			let addr = allocator.allocate_small_page(None).unwrap();
			assert_eq!(addr.as_u64() % SMALL_PAGE_SIZE as u64, 0);
			assert!(!seen.contains(&addr), "duplicate small page handed out");
			seen.push(addr);
		}
		// All from the same big page.
		let base = seen[0].as_u64().align_down(BIG_PAGE_SIZE as u64);
		assert!(
			seen.iter()
				.all(|a| a.as_u64().align_down(BIG_PAGE_SIZE as u64) == base)
		);
		assert!(allocator.validate_accounting());
	}

	#[test]
	fn freed_small_pages_are_reused() {
		let (allocator, _buffer) = make_allocator(0, 0x80_0000, 1);
		let a = allocator.allocate_small_page(None).unwrap();
		let b = allocator.allocate_small_page(None).unwrap();
		allocator.free_small_page(a);
		let c = allocator.allocate_small_page(None).unwrap();
		// The partial page keeps being used; the freed slot comes back.
		assert_ne!(b, c);
		allocator.free_pages(&[PageRef::small(b), PageRef::small(c)]);
		assert!(allocator.validate_accounting());
	}

	#[test]
	fn colored_allocations_stay_in_their_class() {
		let (allocator, _buffer) = make_allocator(0, 0x1000_0000, 1);
		let red = allocator.allocate_small_page(Some(3)).unwrap();
		let blue = allocator.allocate_small_page(Some(7)).unwrap();
		// Different colors must not share a big page.
		assert_ne!(
			red.as_u64().align_down(BIG_PAGE_SIZE as u64),
			blue.as_u64().align_down(BIG_PAGE_SIZE as u64)
		);
		// Another red allocation lands in the red page.
		let red2 = allocator.allocate_small_page(Some(3)).unwrap();
		assert_eq!(
			red.as_u64().align_down(BIG_PAGE_SIZE as u64),
			red2.as_u64().align_down(BIG_PAGE_SIZE as u64)
		);
		allocator.free_pages(&[
			PageRef::small(red),
			PageRef::small(blue),
			PageRef::small(red2),
		]);
		assert!(allocator.validate_accounting());
	}

	#[test]
	fn exhausting_the_local_pool_steals_from_the_neighbor() {
		// Two CPU pools with 16 big pages each; the test runs on CPU 0.
		let (allocator, _buffer) = make_allocator(0, 32 * BIG_PAGE_SIZE as u64, 2);
		assert_eq!(allocator.pool_free_big_pages(0), 16);
		assert_eq!(allocator.pool_free_big_pages(1), 16);

		let mut pages = Vec::new();
		for _ in 0..20 {
			pages.push(allocator.allocate_big_page().unwrap());
		}
		// Pool 0 ran dry after 16; the rest were stolen from pool 1.
		assert!(allocator.pool_free_big_pages(1) <= 12);
		assert!(allocator.validate_accounting());

		let refs: Vec<PageRef> = pages.iter().map(|&a| PageRef::big(a)).collect();
		allocator.free_pages(&refs);
		assert_eq!(allocator.free_big_page_count(), 32);
		assert!(allocator.validate_accounting());
	}

	#[test]
	fn run_allocation_is_contiguous() {
		let (allocator, _buffer) = make_allocator(0, 0x1000_0000, 1);
		let run = allocator.allocate_small_run(16).unwrap();
		assert_eq!(run.run_length(), 16);
		assert_eq!(run.addr().as_u64() % BIG_PAGE_SIZE as u64, 0);
		allocator.free_pages(&[run]);
		assert_eq!(
			allocator.free_small_page_count(),
			allocator.big_page_count() * SMALL_PAGES_PER_BIG_PAGE
		);
		assert!(allocator.validate_accounting());
	}

	#[test]
	fn reservation_carves_pages_out() {
		let (allocator, _buffer) = make_allocator(0, 0x1000_0000, 1);
		let total_small = allocator.big_page_count() * SMALL_PAGES_PER_BIG_PAGE;

		// Reserve one full big page plus three small pages of the next.
		allocator.reserve_physical_range(PhysMemoryRange::new(
			PhysAddr::new(BIG_PAGE_SIZE as u64),
			PhysAddr::new(2 * BIG_PAGE_SIZE as u64 + 3 * SMALL_PAGE_SIZE as u64),
		));
		assert_eq!(
			allocator.free_small_page_count(),
			total_small - SMALL_PAGES_PER_BIG_PAGE - 3
		);
		assert_eq!(allocator.free_big_page_count(), allocator.big_page_count() - 2);
		assert!(allocator.validate_accounting());
	}

	#[test]
	fn metadata_measuring_pass_is_stable() {
		let range = PhysMemoryRange::new(PhysAddr::new(0), PhysAddr::new(0x1000_0000));
		let a = RangeAllocator::required_metadata_size(range, 4);
		let b = RangeAllocator::required_metadata_size(range, 4);
		assert_eq!(a, b);
		assert!(a >= 128 * mem::size_of::<BigPageMeta>());
	}
}
