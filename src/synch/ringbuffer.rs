//! Bounded lock-free MPMC ring buffers.
//!
//! All head counters are monotonically increasing logical positions,
//! mapped to physical slots via `head % capacity`. This sidesteps ABA in
//! the CAS loops and makes generation tracking trivial; 64-bit counters
//! do not wrap in any realistic lifetime.
//!
//! Completion heads (`written` on the write side, `read` on the read
//! side) can be advanced in one of two modes:
//!
//! - *Ordered*: each finisher spin-waits until the head reaches the start
//!   of its batch, then CAS-advances past it. Cheap, but an out-of-order
//!   finisher stalls until its predecessors complete.
//! - *Scan-on-complete*: each finisher stores per-slot generation tags
//!   and attempts a single CAS; the winner scans forward across
//!   contiguous completed generations and coalesces multiple finished
//!   batches into one head advancement. The tag stores, tag loads, and
//!   head CASes all use `SeqCst`: the scanner's tag reads must be totally
//!   ordered against every other finisher's failed CAS, otherwise a
//!   scanner can miss a completed batch and strand it forever.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

/// Completion mode for a ring buffer's write/read completion heads.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Completion {
	/// Finishers advance the completion head strictly in claim order.
	#[default]
	Ordered,
	/// Finishers tag their slots and the CAS winner scans forward.
	ScanOnComplete,
}

fn advance_completion_head(head: &AtomicUsize, expected: usize, desired: usize) {
	let backoff = Backoff::new();
	loop {
		match head.compare_exchange(expected, desired, Ordering::Release, Ordering::Relaxed) {
			Ok(_) => return,
			Err(observed) => {
				// Another finisher has already advanced past our range.
				if observed >= desired {
					return;
				}
				backoff.spin();
			}
		}
	}
}

fn advance_completion_head_with_scan(
	head: &AtomicUsize,
	gen_counters: &[AtomicUsize],
	cap: usize,
	expected: usize,
	mut desired: usize,
) {
	let mut current = expected;
	loop {
		match head.compare_exchange(current, desired, Ordering::SeqCst, Ordering::SeqCst) {
			Ok(_) => break,
			Err(observed) => {
				if observed >= desired {
					return;
				}
				if observed < expected {
					// No scanner has entered our range; our tags are
					// published, a later scanner will pick them up.
					return;
				}
				// A scanner partially consumed our batch; retry from the
				// updated position to push the head past the rest of it.
				current = observed;
			}
		}
	}

	// We advanced the head; scan ahead for batches that completed out of
	// order and fold them into further advancements.
	let mut scan_pos = desired;
	loop {
		loop {
			let slot = scan_pos % cap;
			let expected_gen = scan_pos / cap + 1;
			if gen_counters[slot].load(Ordering::SeqCst) < expected_gen {
				break;
			}
			scan_pos += 1;
		}

		if scan_pos == desired {
			break;
		}

		if head
			.compare_exchange(desired, scan_pos, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			// Someone else took over the scan.
			break;
		}
		desired = scan_pos;
	}
}

struct Storage<T> {
	slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Storage<T> {
	fn new(capacity: usize) -> Self {
		assert!(capacity > 0, "ring buffer capacity must be nonzero");
		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
		Self {
			slots: slots.into_boxed_slice(),
		}
	}

	unsafe fn write(&self, logical: usize, value: T) {
		let slot = logical % self.slots.len();
		unsafe {
			(*self.slots[slot].get()).write(value);
		}
	}

	unsafe fn read(&self, logical: usize) -> T {
		let slot = logical % self.slots.len();
		unsafe { (*self.slots[slot].get()).assume_init_read() }
	}

	unsafe fn peek(&self, logical: usize) -> &T {
		let slot = logical % self.slots.len();
		unsafe { (*self.slots[slot].get()).assume_init_ref() }
	}
}

fn gen_counters(capacity: usize, completion: Completion) -> Option<Box<[AtomicUsize]>> {
	match completion {
		Completion::Ordered => None,
		Completion::ScanOnComplete => {
			let mut counters = Vec::with_capacity(capacity);
			counters.resize_with(capacity, || AtomicUsize::new(0));
			Some(counters.into_boxed_slice())
		}
	}
}

fn complete(
	head: &AtomicUsize,
	gen_counters: Option<&[AtomicUsize]>,
	cap: usize,
	claimed: usize,
	count: usize,
) {
	match gen_counters {
		Some(counters) => {
			for logical in claimed..claimed + count {
				counters[logical % cap].store(logical / cap + 1, Ordering::SeqCst);
			}
			advance_completion_head_with_scan(head, counters, cap, claimed, claimed + count);
		}
		None => advance_completion_head(head, claimed, claimed + count),
	}
}

/// Three-head MPMC ring buffer for callers with a structural guarantee
/// against overflow.
///
/// Heads: `write` (next slot to claim for writing), `written` (published
/// writes), `read` (next slot to claim for reading). A read claim frees
/// the slot immediately, so nothing stops a fast producer from lapping a
/// reader that claimed but has not yet copied out; the caller must make
/// that impossible structurally.
pub struct SimpleMpmcRingBuffer<T> {
	storage: Storage<T>,
	cap: usize,
	write_head: CachePadded<AtomicUsize>,
	written_head: CachePadded<AtomicUsize>,
	read_head: CachePadded<AtomicUsize>,
	write_gen: Option<Box<[AtomicUsize]>>,
}

unsafe impl<T: Send> Send for SimpleMpmcRingBuffer<T> {}
unsafe impl<T: Send> Sync for SimpleMpmcRingBuffer<T> {}

impl<T> SimpleMpmcRingBuffer<T> {
	pub fn new(capacity: usize) -> Self {
		Self::with_completion(capacity, Completion::Ordered)
	}

	pub fn with_completion(capacity: usize, completion: Completion) -> Self {
		Self {
			storage: Storage::new(capacity),
			cap: capacity,
			write_head: CachePadded::new(AtomicUsize::new(0)),
			written_head: CachePadded::new(AtomicUsize::new(0)),
			read_head: CachePadded::new(AtomicUsize::new(0)),
			write_gen: gen_counters(capacity, completion),
		}
	}

	pub fn capacity(&self) -> usize {
		self.cap
	}

	pub fn available_to_write(&self) -> usize {
		self.cap - (self.write_head.load(Ordering::Acquire) - self.read_head.load(Ordering::Acquire))
	}

	pub fn available_to_read(&self) -> usize {
		self.written_head.load(Ordering::Acquire) - self.read_head.load(Ordering::Acquire)
	}

	pub fn is_empty(&self) -> bool {
		self.available_to_read() == 0
	}

	pub fn is_full(&self) -> bool {
		self.available_to_write() == 0
	}

	fn try_claim_write(&self, count: usize) -> Option<usize> {
		loop {
			let claimed = self.write_head.load(Ordering::Acquire);
			let read = self.read_head.load(Ordering::Acquire);
			if self.cap - (claimed - read) < count {
				return None;
			}
			if self
				.write_head
				.compare_exchange(claimed, claimed + count, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				return Some(claimed);
			}
		}
	}

	fn claim_best_effort_write(&self, max_count: usize) -> Option<(usize, usize)> {
		loop {
			let claimed = self.write_head.load(Ordering::Acquire);
			let read = self.read_head.load(Ordering::Acquire);
			let available = self.cap - (claimed - read);
			let count = max_count.min(available);
			if count == 0 {
				return None;
			}
			if self
				.write_head
				.compare_exchange(claimed, claimed + count, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				return Some((claimed, count));
			}
		}
	}

	fn execute_write(&self, claimed: usize, count: usize, mut produce: impl FnMut(usize) -> T) {
		for i in 0..count {
			unsafe {
				self.storage.write(claimed + i, produce(i));
			}
		}
		complete(
			&self.written_head,
			self.write_gen.as_deref(),
			self.cap,
			claimed,
			count,
		);
	}

	fn try_claim_read(&self, count: usize) -> Option<usize> {
		loop {
			let claimed = self.read_head.load(Ordering::Acquire);
			let written = self.written_head.load(Ordering::Acquire);
			if written - claimed < count {
				return None;
			}
			if self
				.read_head
				.compare_exchange(claimed, claimed + count, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				return Some(claimed);
			}
		}
	}

	/// All-or-nothing write of `count` elements. Fails if the buffer
	/// lacks space right now.
	pub fn try_bulk_write(&self, count: usize, produce: impl FnMut(usize) -> T) -> bool {
		let Some(claimed) = self.try_claim_write(count) else {
			return false;
		};
		self.execute_write(claimed, count, produce);
		true
	}

	/// Write up to `count` elements; returns how many were written.
	pub fn bulk_write_best_effort(&self, count: usize, produce: impl FnMut(usize) -> T) -> usize {
		let Some((claimed, actual)) = self.claim_best_effort_write(count) else {
			return 0;
		};
		self.execute_write(claimed, actual, produce);
		actual
	}

	/// All-or-nothing read of `count` elements.
	pub fn try_bulk_read(&self, count: usize, mut consume: impl FnMut(usize, T)) -> bool {
		let Some(claimed) = self.try_claim_read(count) else {
			return false;
		};
		for i in 0..count {
			consume(i, unsafe { self.storage.read(claimed + i) });
		}
		true
	}

	/// Read up to `count` elements; returns how many were read.
	pub fn bulk_read_best_effort(&self, count: usize, mut consume: impl FnMut(usize, T)) -> usize {
		loop {
			let claimed = self.read_head.load(Ordering::Acquire);
			let written = self.written_head.load(Ordering::Acquire);
			let count = count.min(written - claimed);
			if count == 0 {
				return 0;
			}
			if self
				.read_head
				.compare_exchange(claimed, claimed + count, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				for i in 0..count {
					consume(i, unsafe { self.storage.read(claimed + i) });
				}
				return count;
			}
		}
	}
}

impl<T> Drop for SimpleMpmcRingBuffer<T> {
	fn drop(&mut self) {
		let read = self.read_head.load(Ordering::Relaxed);
		let written = self.written_head.load(Ordering::Relaxed);
		for logical in read..written {
			unsafe {
				drop(self.storage.read(logical));
			}
		}
	}
}

/// Four-head MPMC ring buffer that is safe against overflow.
///
/// Adds a `reading` head strictly between `written` and `read`: readers
/// claim on `reading` and only advance `read` once the copy-out is done,
/// so a producer can tell when a slot is truly reusable. `bulk_write`
/// claims optimistically against `reading` and then spin-waits per slot
/// for `read` to pass the previous occupant.
pub struct MpmcRingBuffer<T> {
	storage: Storage<T>,
	cap: usize,
	write_head: CachePadded<AtomicUsize>,
	written_head: CachePadded<AtomicUsize>,
	reading_head: CachePadded<AtomicUsize>,
	read_head: CachePadded<AtomicUsize>,
	write_gen: Option<Box<[AtomicUsize]>>,
	read_gen: Option<Box<[AtomicUsize]>>,
}

unsafe impl<T: Send> Send for MpmcRingBuffer<T> {}
unsafe impl<T: Send> Sync for MpmcRingBuffer<T> {}

impl<T> MpmcRingBuffer<T> {
	pub fn new(capacity: usize) -> Self {
		Self::with_completion(capacity, Completion::Ordered)
	}

	pub fn with_completion(capacity: usize, completion: Completion) -> Self {
		Self {
			storage: Storage::new(capacity),
			cap: capacity,
			write_head: CachePadded::new(AtomicUsize::new(0)),
			written_head: CachePadded::new(AtomicUsize::new(0)),
			reading_head: CachePadded::new(AtomicUsize::new(0)),
			read_head: CachePadded::new(AtomicUsize::new(0)),
			write_gen: gen_counters(capacity, completion),
			read_gen: gen_counters(capacity, completion),
		}
	}

	pub fn capacity(&self) -> usize {
		self.cap
	}

	pub fn available_to_write(&self) -> usize {
		self.cap - (self.write_head.load(Ordering::Acquire) - self.read_head.load(Ordering::Acquire))
	}

	pub fn available_to_read(&self) -> usize {
		self.written_head.load(Ordering::Acquire) - self.reading_head.load(Ordering::Acquire)
	}

	pub fn is_empty(&self) -> bool {
		self.available_to_read() == 0
	}

	pub fn is_full(&self) -> bool {
		self.available_to_write() == 0
	}

	fn wait_for_slot_reusable(&self, logical: usize) {
		if logical < self.cap {
			return;
		}
		let required = logical - self.cap + 1;
		let backoff = Backoff::new();
		while self.read_head.load(Ordering::Acquire) < required {
			backoff.spin();
		}
	}

	/// All-or-nothing write that may wait for readers to release slots.
	/// Fails only if the buffer lacks space even counting in-flight
	/// reads.
	pub fn bulk_write(&self, count: usize, mut produce: impl FnMut(usize) -> T) -> bool {
		// Optimistic claim against the reading head.
		let claimed = loop {
			let claimed = self.write_head.load(Ordering::Acquire);
			let reading = self.reading_head.load(Ordering::Acquire);
			if self.cap - (claimed - reading) < count {
				return false;
			}
			if self
				.write_head
				.compare_exchange(claimed, claimed + count, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				break claimed;
			}
		};
		for i in 0..count {
			self.wait_for_slot_reusable(claimed + i);
			unsafe {
				self.storage.write(claimed + i, produce(i));
			}
		}
		complete(
			&self.written_head,
			self.write_gen.as_deref(),
			self.cap,
			claimed,
			count,
		);
		true
	}

	/// Non-blocking all-or-nothing write (conservative space check
	/// against fully released slots).
	pub fn try_bulk_write(&self, count: usize, mut produce: impl FnMut(usize) -> T) -> bool {
		let claimed = loop {
			let claimed = self.write_head.load(Ordering::Acquire);
			let read = self.read_head.load(Ordering::Acquire);
			if self.cap - (claimed - read) < count {
				return false;
			}
			if self
				.write_head
				.compare_exchange(claimed, claimed + count, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				break claimed;
			}
		};
		for i in 0..count {
			unsafe {
				self.storage.write(claimed + i, produce(i));
			}
		}
		complete(
			&self.written_head,
			self.write_gen.as_deref(),
			self.cap,
			claimed,
			count,
		);
		true
	}

	/// Write up to `count` elements without blocking; returns how many
	/// were written.
	pub fn bulk_write_best_effort(&self, count: usize, mut produce: impl FnMut(usize) -> T) -> usize {
		let (claimed, actual) = loop {
			let claimed = self.write_head.load(Ordering::Acquire);
			let read = self.read_head.load(Ordering::Acquire);
			let available = self.cap - (claimed - read);
			let actual = count.min(available);
			if actual == 0 {
				return 0;
			}
			if self
				.write_head
				.compare_exchange(claimed, claimed + actual, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				break (claimed, actual);
			}
		};
		for i in 0..actual {
			unsafe {
				self.storage.write(claimed + i, produce(i));
			}
		}
		complete(
			&self.written_head,
			self.write_gen.as_deref(),
			self.cap,
			claimed,
			actual,
		);
		actual
	}

	fn execute_read(&self, claimed: usize, count: usize, mut consume: impl FnMut(usize, T)) {
		for i in 0..count {
			consume(i, unsafe { self.storage.read(claimed + i) });
		}
		complete(
			&self.read_head,
			self.read_gen.as_deref(),
			self.cap,
			claimed,
			count,
		);
	}

	/// All-or-nothing read of `count` elements.
	pub fn try_bulk_read(&self, count: usize, consume: impl FnMut(usize, T)) -> bool {
		let claimed = loop {
			let claimed = self.reading_head.load(Ordering::Acquire);
			let written = self.written_head.load(Ordering::Acquire);
			if written - claimed < count {
				return false;
			}
			if self
				.reading_head
				.compare_exchange(claimed, claimed + count, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				break claimed;
			}
		};
		self.execute_read(claimed, count, consume);
		true
	}

	/// Read up to `count` elements; returns how many were read.
	pub fn bulk_read_best_effort(&self, count: usize, consume: impl FnMut(usize, T)) -> usize {
		let (claimed, actual) = loop {
			let claimed = self.reading_head.load(Ordering::Acquire);
			let written = self.written_head.load(Ordering::Acquire);
			let actual = count.min(written - claimed);
			if actual == 0 {
				return 0;
			}
			if self
				.reading_head
				.compare_exchange(claimed, claimed + actual, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				break (claimed, actual);
			}
		};
		self.execute_read(claimed, actual, consume);
		actual
	}
}

impl<T> Drop for MpmcRingBuffer<T> {
	fn drop(&mut self) {
		let reading = self.reading_head.load(Ordering::Relaxed);
		let written = self.written_head.load(Ordering::Relaxed);
		for logical in reading..written {
			unsafe {
				drop(self.storage.read(logical));
			}
		}
	}
}

const fn pack_ack(generation: u32, count: u32) -> u64 {
	((generation as u64) << 32) | count as u64
}

const fn ack_generation(packed: u64) -> u32 {
	(packed >> 32) as u32
}

const fn ack_count(packed: u64) -> u32 {
	packed as u32
}

/// Broadcast ring buffer: every registered consumer must read each item
/// before its slot is reused.
///
/// Wraps the simple buffer for the write path. Each consumer owns one
/// read head (single-writer, so a plain load/store suffices); a per-slot
/// ack counter packs `{generation:32, count:32}`. The generation
/// disambiguates physical-slot reuse across logical positions, with
/// wraparound handled by unsigned modular equality — the maximum
/// generation lag for any slot is one, so aliasing cannot occur.
pub struct BroadcastRingBuffer<T> {
	inner: SimpleMpmcRingBuffer<T>,
	read_heads: Box<[CachePadded<AtomicUsize>]>,
	ack_counters: Box<[AtomicU64]>,
	consumer_count: usize,
}

impl<T> BroadcastRingBuffer<T> {
	pub fn new(capacity: usize, consumer_count: usize) -> Self {
		assert!(consumer_count > 0);
		let mut read_heads = Vec::with_capacity(consumer_count);
		read_heads.resize_with(consumer_count, || CachePadded::new(AtomicUsize::new(0)));
		let mut ack_counters = Vec::with_capacity(capacity);
		ack_counters.resize_with(capacity, || AtomicU64::new(pack_ack(0, 0)));
		Self {
			inner: SimpleMpmcRingBuffer::new(capacity),
			read_heads: read_heads.into_boxed_slice(),
			ack_counters: ack_counters.into_boxed_slice(),
			consumer_count,
		}
	}

	pub fn capacity(&self) -> usize {
		self.inner.capacity()
	}

	pub fn consumer_count(&self) -> usize {
		self.consumer_count
	}

	pub fn try_bulk_write(&self, count: usize, produce: impl FnMut(usize) -> T) -> bool {
		self.inner.try_bulk_write(count, produce)
	}

	pub fn bulk_write_best_effort(&self, count: usize, produce: impl FnMut(usize) -> T) -> usize {
		self.inner.bulk_write_best_effort(count, produce)
	}

	fn ack_slot(&self, logical: usize) {
		let cap = self.inner.capacity();
		let slot = logical % cap;
		let expected_gen = (logical / cap) as u32;

		loop {
			let val = self.ack_counters[slot].load(Ordering::Acquire);
			let new_val = if ack_generation(val) == expected_gen {
				pack_ack(expected_gen, ack_count(val) + 1)
			} else {
				// First ack of this generation; the previous generation
				// was fully acked or the slot could not have been reused,
				// so this store implicitly resets the counter.
				pack_ack(expected_gen, 1)
			};
			if self.ack_counters[slot]
				.compare_exchange(val, new_val, Ordering::Release, Ordering::Acquire)
				.is_ok()
			{
				if ack_count(new_val) == self.consumer_count as u32 {
					self.try_advance_read_head();
				}
				return;
			}
		}
	}

	fn try_advance_read_head(&self) {
		let cap = self.inner.capacity();
		loop {
			let current = self.inner.read_head.load(Ordering::Acquire);
			let val = self.ack_counters[current % cap].load(Ordering::Acquire);
			let expected_gen = (current / cap) as u32;
			if ack_generation(val) != expected_gen || ack_count(val) != self.consumer_count as u32 {
				return;
			}
			// Fully acked; advance (or retry from whoever beat us to it).
			let _ = self.inner.read_head.compare_exchange(
				current,
				current + 1,
				Ordering::Release,
				Ordering::Relaxed,
			);
		}
	}

	/// All-or-nothing read of `count` items for one consumer. Each
	/// `head_number` must be driven by exactly one thread.
	pub fn try_bulk_read(
		&self,
		head_number: usize,
		count: usize,
		mut consume: impl FnMut(usize, &T),
	) -> bool {
		let my_head = self.read_heads[head_number].load(Ordering::Relaxed);
		let written = self.inner.written_head.load(Ordering::Acquire);
		if count > written - my_head {
			return false;
		}

		for i in 0..count {
			consume(i, unsafe { self.inner.storage.peek(my_head + i) });
		}
		self.read_heads[head_number].store(my_head + count, Ordering::Release);
		for i in 0..count {
			self.ack_slot(my_head + i);
		}
		true
	}

	/// Read up to `count` items for one consumer; returns how many were
	/// read.
	pub fn bulk_read_best_effort(
		&self,
		head_number: usize,
		count: usize,
		mut consume: impl FnMut(usize, &T),
	) -> usize {
		let my_head = self.read_heads[head_number].load(Ordering::Relaxed);
		let written = self.inner.written_head.load(Ordering::Acquire);
		let actual = count.min(written - my_head);
		if actual == 0 {
			return 0;
		}

		for i in 0..actual {
			consume(i, unsafe { self.inner.storage.peek(my_head + i) });
		}
		self.read_heads[head_number].store(my_head + actual, Ordering::Release);
		for i in 0..actual {
			self.ack_slot(my_head + i);
		}
		actual
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::thread;
	use std::vec::Vec;

	use super::*;

	#[test]
	fn simple_fill_and_drain() {
		let rb = SimpleMpmcRingBuffer::new(8);
		assert!(rb.try_bulk_write(8, |i| i as u32));
		assert!(!rb.try_bulk_write(1, |_| 0));
		assert!(rb.is_full());

		let mut out = Vec::new();
		assert!(rb.try_bulk_read(8, |_, v| out.push(v)));
		assert_eq!(out, (0..8).collect::<Vec<u32>>());
		assert!(rb.is_empty());
	}

	#[test]
	fn oversized_writes_are_rejected_or_truncated() {
		let rb = MpmcRingBuffer::new(8);
		assert!(!rb.try_bulk_write(9, |i| i));
		assert_eq!(rb.bulk_write_best_effort(9, |i| i), 8);
		assert_eq!(rb.bulk_write_best_effort(1, |i| i), 0);
	}

	#[test]
	fn head_invariants_hold() {
		let rb = MpmcRingBuffer::new(4);
		assert!(rb.try_bulk_write(3, |i| i));
		assert_eq!(rb.available_to_read(), 3);
		let mut n = 0;
		assert!(rb.try_bulk_read(2, |_, _| n += 1));
		assert_eq!(n, 2);
		assert_eq!(rb.available_to_read(), 1);
		assert!(rb.available_to_write() >= 1);
	}

	#[test]
	fn batches_do_not_interleave() {
		// Two producers write a batch of 4 each into a capacity-8 buffer;
		// a consumer must observe each batch contiguously.
		for _ in 0..64 {
			let rb = Arc::new(SimpleMpmcRingBuffer::new(8));
			let a = {
				let rb = Arc::clone(&rb);
				thread::spawn(move || {
					assert!(rb.try_bulk_write(4, |i| 100 + i as u32));
				})
			};
			let b = {
				let rb = Arc::clone(&rb);
				thread::spawn(move || {
					assert!(rb.try_bulk_write(4, |i| 200 + i as u32));
				})
			};
			a.join().unwrap();
			b.join().unwrap();

			let mut out = Vec::new();
			assert!(rb.try_bulk_read(8, |_, v| out.push(v)));
			let first = out[0];
			assert!(first == 100 || first == 200);
			let (lo, hi) = if first == 100 { (100, 200) } else { (200, 100) };
			assert_eq!(out[..4], [lo, lo + 1, lo + 2, lo + 3]);
			assert_eq!(out[4..], [hi, hi + 1, hi + 2, hi + 3]);
		}
	}

	#[test]
	fn scan_on_complete_publishes_everything() {
		let rb = Arc::new(SimpleMpmcRingBuffer::with_completion(
			64,
			Completion::ScanOnComplete,
		));
		let writers: Vec<_> = (0..4)
			.map(|p| {
				let rb = Arc::clone(&rb);
				thread::spawn(move || {
					for _ in 0..4 {
						assert!(rb.try_bulk_write(4, |i| p * 100 + i));
					}
				})
			})
			.collect();
		for w in writers {
			w.join().unwrap();
		}
		let mut total = 0;
		while rb.bulk_read_best_effort(8, |_, _| total += 1) > 0 {}
		assert_eq!(total, 64);
	}

	#[test]
	fn broadcast_waits_for_all_consumers() {
		let rb = BroadcastRingBuffer::new(2, 2);
		assert!(rb.try_bulk_write(2, |i| i));
		// Only consumer 0 has read; slots must not be reusable yet.
		assert!(rb.try_bulk_read(0, 2, |_, _| {}));
		assert!(!rb.try_bulk_write(1, |i| i));
		// After consumer 1 catches up the producer may lap.
		assert!(rb.try_bulk_read(1, 2, |_, _| {}));
		assert!(rb.try_bulk_write(2, |i| i));
	}

	#[test]
	fn broadcast_generation_tracking_survives_wraparound_of_slots() {
		let rb = BroadcastRingBuffer::new(2, 1);
		for round in 0u32..10 {
			assert!(rb.try_bulk_write(2, |i| round * 2 + i as u32));
			let mut seen = Vec::new();
			assert!(rb.try_bulk_read(0, 2, |_, v| seen.push(*v)));
			assert_eq!(seen, [round * 2, round * 2 + 1]);
		}
	}
}
