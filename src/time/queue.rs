//! Coalescing timer queue.
//!
//! Events are keyed on their expiration time in an augmented red–black
//! tree; each node carries every callback whose acceptance window
//! covers the node's deadline, so one hardware interrupt serves them
//! all. The augmented bounds (`earliest`/`latest` expiration below a
//! node, plus the leftmost descendant) prune the coalescing search and
//! make "next deadline" O(1).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ahash::RandomState;
use hashbrown::HashMap;

use super::clock::{ClockSource, EventSource};
use crate::collections::rbtree::{NodeId, RbTree, RbValue};
use crate::synch::InterruptSpinMutex;

/// Handle to a queued (not yet fired) timer event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EventHandle {
	pub id: u64,
}

/// Returned when the deadline had already arrived and the callback ran
/// synchronously.
pub const EXPIRED_EVENT: EventHandle = EventHandle { id: u64::MAX };

pub type TimerCallback = Box<dyn FnOnce() + Send>;

struct CallbackWithHandle {
	callback: TimerCallback,
	handle: EventHandle,
}

struct TimerEvent {
	expiration: u64,
	callbacks: Vec<CallbackWithHandle>,
}

#[derive(Clone, PartialEq)]
struct TimerAug {
	/// Leftmost descendant: the next event of this subtree.
	next: NodeId,
	earliest: u64,
	latest: u64,
}

impl RbValue for TimerEvent {
	type Key = u64;
	type Aug = TimerAug;

	fn key(&self) -> u64 {
		self.expiration
	}

	fn augment(
		node: NodeId,
		value: &Self,
		left: Option<&TimerAug>,
		right: Option<&TimerAug>,
	) -> TimerAug {
		TimerAug {
			next: left.map_or(node, |l| l.next),
			earliest: left.map_or(value.expiration, |l| l.earliest),
			latest: right.map_or(value.expiration, |r| r.latest),
		}
	}
}

struct QueueInner {
	tree: RbTree<TimerEvent>,
	by_id: HashMap<u64, NodeId, RandomState>,
	next_id: u64,
}

impl QueueInner {
	/// A node whose deadline falls inside `[early, late]`, preferring
	/// earlier nodes. Subtrees whose bounds cannot intersect the window
	/// are pruned.
	fn find_coalescable(&self, node: Option<NodeId>, early: u64, late: u64) -> Option<NodeId> {
		let node = node?;
		let aug = self.tree.aug(node);
		if aug.latest < early || aug.earliest > late {
			return None;
		}
		if let Some(found) = self.find_coalescable(self.tree.left(node), early, late) {
			return Some(found);
		}
		let expiration = self.tree.key(node);
		if early <= expiration && expiration <= late {
			return Some(node);
		}
		self.find_coalescable(self.tree.right(node), early, late)
	}

	fn next_deadline(&self) -> Option<(NodeId, u64)> {
		let root = self.tree.root()?;
		let next = self.tree.aug(root).next;
		Some((next, self.tree.key(next)))
	}
}

/// Timer queue driving one one-shot event source.
pub struct TimerQueue {
	inner: InterruptSpinMutex<QueueInner>,
	clock: Arc<dyn ClockSource>,
	event_source: Arc<dyn EventSource>,
}

impl TimerQueue {
	pub fn new(clock: Arc<dyn ClockSource>, event_source: Arc<dyn EventSource>) -> Self {
		assert!(
			event_source.supports_oneshot(),
			"the timer queue needs a one-shot capable event source"
		);
		Self {
			inner: InterruptSpinMutex::new(QueueInner {
				tree: RbTree::new(),
				by_id: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
				next_id: 0,
			}),
			clock,
			event_source,
		}
	}

	pub fn now_ns(&self) -> u64 {
		self.clock.read_ns()
	}

	/// Queue `callback` to fire once in `[expiration - early_tolerance,
	/// expiration + late_tolerance]` (absolute nanoseconds). If that
	/// window has already opened, the callback runs synchronously and
	/// [`EXPIRED_EVENT`] is returned.
	pub fn enqueue(
		&self,
		callback: TimerCallback,
		expiration_ns: u64,
		late_tolerance_ns: u64,
		early_tolerance_ns: u64,
	) -> EventHandle {
		let early = expiration_ns.saturating_sub(early_tolerance_ns);
		let late = expiration_ns.saturating_add(late_tolerance_ns);

		if self.now_ns() >= early {
			callback();
			return EXPIRED_EVENT;
		}

		let handle;
		{
			let mut inner = self.inner.lock();
			handle = EventHandle { id: inner.next_id };
			inner.next_id += 1;
			let entry = CallbackWithHandle { callback, handle };
			match inner.find_coalescable(inner.tree.root(), early, late) {
				Some(node) => {
					inner.tree.get_mut(node).callbacks.push(entry);
					inner.by_id.insert(handle.id, node);
				}
				None => {
					let node = inner.tree.insert(TimerEvent {
						expiration: expiration_ns,
						callbacks: vec![entry],
					});
					inner.by_id.insert(handle.id, node);
				}
			}
		}
		self.flush_expired_events();
		handle
	}

	/// Cancel a queued event. Returns `false` if the handle no longer
	/// names anything (already fired, cancelled, or [`EXPIRED_EVENT`]).
	pub fn cancel(&self, handle: EventHandle) -> bool {
		let removed_node;
		{
			let mut inner = self.inner.lock();
			let Some(node) = inner.by_id.remove(&handle.id) else {
				return false;
			};
			let event = inner.tree.get_mut(node);
			if event.callbacks.len() == 1 {
				debug_assert_eq!(event.callbacks[0].handle, handle);
				inner.tree.remove(node);
				removed_node = true;
			} else {
				let index = event
					.callbacks
					.iter()
					.position(|entry| entry.handle == handle)
					.expect("id map points at a node holding the handle");
				event.callbacks.remove(index);
				removed_node = false;
			}
		}
		if removed_node {
			// The head deadline may have moved; reprogram the source.
			self.flush_expired_events();
		}
		true
	}

	pub fn pending_events(&self) -> usize {
		self.inner.lock().tree.len()
	}

	/// Fire everything due, then arm the event source for the next
	/// deadline (or disarm it). Callbacks run outside the queue lock
	/// and must not synchronously re-enter the queue on this CPU except
	/// through `enqueue`.
	pub fn flush_expired_events(&self) {
		loop {
			let mut fired: Vec<TimerCallback> = Vec::new();
			{
				let mut inner = self.inner.lock();
				while let Some((node, expiration)) = inner.next_deadline() {
					if self.now_ns() < expiration {
						break;
					}
					let event = inner.tree.remove(node);
					for entry in event.callbacks {
						inner.by_id.remove(&entry.handle.id);
						fired.push(entry.callback);
					}
				}
			}
			for callback in fired {
				callback();
			}

			let inner = self.inner.lock();
			match inner.next_deadline() {
				None => {
					self.event_source.disarm();
					return;
				}
				Some((_, expiration)) => {
					let now = self.now_ns();
					if now >= expiration {
						// Raced with the clock; drain again.
						continue;
					}
					let calibration = self.event_source.calibration();
					let ticks = calibration
						.nanos_to_ticks(expiration - now)
						.clamp(1, self.event_source.max_oneshot_delay());
					self.event_source.arm_oneshot(ticks);
					return;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
	use std::sync::{Arc, Mutex};
	use std::vec::Vec;

	use super::super::clock::*;
	use super::*;

	struct MockClock {
		now: AtomicU64,
	}

	impl MockClock {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				now: AtomicU64::new(0),
			})
		}

		fn advance_ms(&self, ms: u64) {
			self.now.fetch_add(ms * 1_000_000, Ordering::SeqCst);
		}
	}

	impl ClockSource for MockClock {
		fn name(&self) -> &'static str {
			"mock-clock"
		}

		fn mask(&self) -> u64 {
			u64::MAX
		}

		fn flags(&self) -> ClockSourceFlags {
			ClockSourceFlags::FIXED_FREQUENCY
		}

		fn quality(&self) -> u16 {
			100
		}

		fn calibration(&self) -> FrequencyData {
			FrequencyData::from_ghz(1)
		}

		fn set_calibration(&self, _data: FrequencyData) {}

		fn read(&self) -> u64 {
			self.now.load(Ordering::SeqCst)
		}
	}

	#[derive(Default)]
	struct MockEventSource {
		armed: Mutex<Option<u64>>,
		disarmed: AtomicUsize,
	}

	impl EventSource for MockEventSource {
		fn name(&self) -> &'static str {
			"mock-events"
		}

		fn flags(&self) -> EventSourceFlags {
			EventSourceFlags::FIXED_FREQUENCY | EventSourceFlags::ONESHOT
		}

		fn quality(&self) -> u16 {
			100
		}

		fn calibration(&self) -> FrequencyData {
			FrequencyData::from_ghz(1)
		}

		fn set_calibration(&self, _data: FrequencyData) {}

		fn register_callback(&self, _callback: EventCallback) {}

		fn arm_oneshot(&self, delta_ticks: u64) {
			*self.armed.lock().unwrap() = Some(delta_ticks);
		}

		fn arm_periodic(&self, _period_ticks: u64) {
			unreachable!("queue must not use periodic mode");
		}

		fn disarm(&self) {
			self.disarmed.fetch_add(1, Ordering::SeqCst);
			*self.armed.lock().unwrap() = None;
		}

		fn ticks_elapsed(&self) -> u64 {
			0
		}

		fn max_oneshot_delay(&self) -> u64 {
			u64::MAX
		}

		fn max_period(&self) -> u64 {
			u64::MAX
		}
	}

	fn queue() -> (TimerQueue, Arc<MockClock>, Arc<MockEventSource>) {
		let clock = MockClock::new();
		let events = Arc::new(MockEventSource::default());
		let queue = TimerQueue::new(clock.clone(), events.clone());
		(queue, clock, events)
	}

	fn recorder(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> TimerCallback {
		let log = Arc::clone(log);
		Box::new(move || log.lock().unwrap().push(tag))
	}

	#[test]
	fn events_fire_in_deadline_order() {
		let (queue, clock, _events) = queue();
		let log = Arc::new(Mutex::new(Vec::new()));

		for (tag, delay_ms) in [(3u32, 3000u64), (1, 1000), (2, 2000)] {
			queue.enqueue(recorder(&log, tag), delay_ms * 1_000_000, 100_000_000, 0);
		}
		assert_eq!(queue.pending_events(), 3);

		for _ in 0..3 {
			clock.advance_ms(1000);
			queue.flush_expired_events();
		}
		assert_eq!(*log.lock().unwrap(), [1, 2, 3]);
		assert_eq!(queue.pending_events(), 0);
	}

	#[test]
	fn overlapping_windows_coalesce() {
		let (queue, _clock, _events) = queue();
		let log = Arc::new(Mutex::new(Vec::new()));

		let ms = 1_000_000u64;
		queue.enqueue(recorder(&log, 1), 1000 * ms, 100 * ms, 0);
		queue.enqueue(recorder(&log, 2), 2000 * ms, 100 * ms, 0);
		queue.enqueue(recorder(&log, 3), 3000 * ms, 100 * ms, 0);
		assert_eq!(queue.pending_events(), 3);

		// 2050 ms, with an acceptance window reaching back to the
		// 2000 ms node: attaches there instead of growing the tree.
		queue.enqueue(recorder(&log, 4), 2050 * ms, 100 * ms, 100 * ms);
		assert_eq!(queue.pending_events(), 3);

		// A disjoint window creates a fourth node.
		queue.enqueue(recorder(&log, 5), 5000 * ms, 10 * ms, 0);
		assert_eq!(queue.pending_events(), 4);
	}

	#[test]
	fn coalesced_callbacks_fire_in_insertion_order() {
		let (queue, clock, _events) = queue();
		let log = Arc::new(Mutex::new(Vec::new()));
		let ms = 1_000_000u64;

		queue.enqueue(recorder(&log, 1), 1000 * ms, 100 * ms, 0);
		queue.enqueue(recorder(&log, 2), 1050 * ms, 100 * ms, 100 * ms);
		queue.enqueue(recorder(&log, 3), 1010 * ms, 100 * ms, 100 * ms);
		assert_eq!(queue.pending_events(), 1);

		clock.advance_ms(1100);
		queue.flush_expired_events();
		assert_eq!(*log.lock().unwrap(), [1, 2, 3]);
	}

	#[test]
	fn due_enqueue_fires_synchronously() {
		let (queue, _clock, _events) = queue();
		let log = Arc::new(Mutex::new(Vec::new()));
		let handle = queue.enqueue(recorder(&log, 7), 0, 0, 0);
		assert_eq!(handle, EXPIRED_EVENT);
		assert_eq!(*log.lock().unwrap(), [7]);
		assert_eq!(queue.pending_events(), 0);
	}

	#[test]
	fn single_event_fires_exactly_once_in_window() {
		let (queue, clock, events) = queue();
		let fired = Arc::new(Mutex::new(Vec::new()));
		let ms = 1_000_000u64;
		queue.enqueue(recorder(&fired, 1), 500 * ms, 50 * ms, 0);

		// Armed for the deadline.
		assert!(events.armed.lock().unwrap().is_some());

		clock.advance_ms(499);
		queue.flush_expired_events();
		assert!(fired.lock().unwrap().is_empty());

		clock.advance_ms(1);
		queue.flush_expired_events();
		assert_eq!(*fired.lock().unwrap(), [1]);

		// Nothing left: the source is disarmed.
		assert!(events.armed.lock().unwrap().is_none());
		clock.advance_ms(1000);
		queue.flush_expired_events();
		assert_eq!(*fired.lock().unwrap(), [1]);
	}

	#[test]
	fn cancellation_by_handle() {
		let (queue, clock, _events) = queue();
		let log = Arc::new(Mutex::new(Vec::new()));
		let ms = 1_000_000u64;

		let lone = queue.enqueue(recorder(&log, 1), 1000 * ms, 10 * ms, 0);
		let shared_a = queue.enqueue(recorder(&log, 2), 2000 * ms, 100 * ms, 0);
		let shared_b = queue.enqueue(recorder(&log, 3), 2050 * ms, 100 * ms, 100 * ms);
		assert_eq!(queue.pending_events(), 2);

		// Cancelling the only entry of a node removes the node.
		assert!(queue.cancel(lone));
		assert_eq!(queue.pending_events(), 1);
		// Cancelling one of two entries keeps the node.
		assert!(queue.cancel(shared_a));
		assert_eq!(queue.pending_events(), 1);
		// Stale handles report failure.
		assert!(!queue.cancel(lone));
		assert!(!queue.cancel(EXPIRED_EVENT));

		clock.advance_ms(2200);
		queue.flush_expired_events();
		assert_eq!(*log.lock().unwrap(), [3]);
		let _ = shared_b;
	}
}
