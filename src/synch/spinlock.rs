use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
#[cfg(debug_assertions)]
use core::sync::atomic::AtomicU32;

use crossbeam_utils::Backoff;

use crate::arch::irq;

const NORMAL_ACQUIRED: u64 = 1 << 0;
const NORMAL_QUEUED: u64 = 1 << 1;
const NORMAL_MASK: u64 = NORMAL_ACQUIRED | NORMAL_QUEUED;
const PRIORITY_ACQUIRED: u64 = 1 << 2;

#[cfg(debug_assertions)]
const NO_OWNER: u32 = u32::MAX;

/// A two-flavor spinlock with the same shape as [`RwSpinlock`]'s
/// writer path, except that the "reader" side (the priority flavor) is
/// exclusive too.
///
/// Both flavors are mutually exclusive with each other and with
/// themselves; the difference is precedence. A normal acquirer
/// announces itself through a queued bit that stalls new priority
/// acquisitions, then waits for the in-flight priority holder to
/// drain, so the owning CPU cannot be starved by a stream of cross-CPU
/// priority traffic; priority acquirers back off through their
/// bounded-retry entry points instead.
///
/// The allocator takes a pool's lock in the normal flavor from its own
/// CPU and in the priority flavor when stealing from or freeing to a
/// remote pool.
///
/// [`RwSpinlock`]: super::RwSpinlock
pub struct RawPrioritySpinlock {
	state: AtomicU64,
	#[cfg(debug_assertions)]
	owner: AtomicU32,
}

impl RawPrioritySpinlock {
	pub const fn new() -> Self {
		Self {
			state: AtomicU64::new(0),
			#[cfg(debug_assertions)]
			owner: AtomicU32::new(NO_OWNER),
		}
	}

	#[cfg(debug_assertions)]
	fn debug_check_not_owned(&self) {
		let core = crate::arch::cpu::core_id();
		assert_ne!(
			self.owner.load(Ordering::Relaxed),
			core,
			"spinlock reacquired on CPU {core}: deadlock"
		);
	}

	#[cfg(debug_assertions)]
	fn debug_set_owner(&self) {
		self.owner
			.store(crate::arch::cpu::core_id(), Ordering::Relaxed);
	}

	#[cfg(debug_assertions)]
	fn debug_clear_owner(&self) {
		self.owner.store(NO_OWNER, Ordering::Relaxed);
	}

	#[cfg(not(debug_assertions))]
	fn debug_check_not_owned(&self) {}
	#[cfg(not(debug_assertions))]
	fn debug_set_owner(&self) {}
	#[cfg(not(debug_assertions))]
	fn debug_clear_owner(&self) {}

	/// Acquire in the normal flavor: claim the queued bit first (a flag
	/// priority acquirers respect), then wait for the in-flight priority
	/// holder and the previous normal holder to drain.
	pub fn lock(&self) {
		self.debug_check_not_owned();
		let backoff = Backoff::new();
		// Phase 1: signal intent; new priority acquisitions stall on it.
		loop {
			let state = self.state.load(Ordering::Relaxed);
			if state & NORMAL_QUEUED != 0 {
				backoff.spin();
				continue;
			}
			if self
				.state
				.compare_exchange_weak(
					state,
					state | NORMAL_QUEUED,
					Ordering::Acquire,
					Ordering::Relaxed,
				)
				.is_ok()
			{
				break;
			}
			backoff.spin();
		}
		// Phase 2: wait for the holder to let go, then trade the queued
		// bit for the acquired bit.
		let backoff = Backoff::new();
		loop {
			if self
				.state
				.compare_exchange_weak(
					NORMAL_QUEUED,
					NORMAL_ACQUIRED,
					Ordering::Acquire,
					Ordering::Relaxed,
				)
				.is_ok()
			{
				self.debug_set_owner();
				return;
			}
			backoff.spin();
		}
	}

	/// Acquire in the priority flavor: wait until no normal acquirer is
	/// queued or holding and no other priority holder is in flight.
	pub fn lock_priority(&self) {
		self.debug_check_not_owned();
		let backoff = Backoff::new();
		loop {
			let state = self.state.load(Ordering::Relaxed);
			if state & (NORMAL_MASK | PRIORITY_ACQUIRED) == 0
				&& self
					.state
					.compare_exchange_weak(
						state,
						state | PRIORITY_ACQUIRED,
						Ordering::Acquire,
						Ordering::Relaxed,
					)
					.is_ok()
			{
				self.debug_set_owner();
				return;
			}
			backoff.spin();
		}
	}

	/// One attempt to acquire in the priority flavor.
	pub fn try_lock_priority(&self) -> bool {
		let state = self.state.load(Ordering::Relaxed);
		if state & (NORMAL_MASK | PRIORITY_ACQUIRED) != 0 {
			return false;
		}
		let ok = self
			.state
			.compare_exchange(
				state,
				state | PRIORITY_ACQUIRED,
				Ordering::Acquire,
				Ordering::Relaxed,
			)
			.is_ok();
		if ok {
			self.debug_set_owner();
		}
		ok
	}

	/// Bounded-retry priority acquisition, the allocator's only form of
	/// timeout. Spins `delay_iterations` hints between attempts.
	pub fn try_lock_priority_with_retries(&self, retries: usize, delay_iterations: usize) -> bool {
		for _ in 0..=retries {
			if self.try_lock_priority() {
				return true;
			}
			for _ in 0..delay_iterations {
				core::hint::spin_loop();
			}
		}
		false
	}

	/// Release a normal-flavor acquisition.
	pub fn unlock(&self) {
		self.debug_clear_owner();
		self.state.fetch_and(!NORMAL_ACQUIRED, Ordering::Release);
	}

	/// Release a priority-flavor acquisition.
	pub fn unlock_priority(&self) {
		self.debug_clear_owner();
		self.state.fetch_and(!PRIORITY_ACQUIRED, Ordering::Release);
	}
}

impl Default for RawPrioritySpinlock {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
	Normal,
	Priority,
}

/// Data-carrying wrapper around [`RawPrioritySpinlock`].
///
/// `lock`/`lock_priority` mask interrupts for the critical section; the
/// `_plain` variants are for callers already running with interrupts
/// disabled.
pub struct PrioritySpinMutex<T: ?Sized> {
	raw: RawPrioritySpinlock,
	data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for PrioritySpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for PrioritySpinMutex<T> {}

pub struct PrioritySpinMutexGuard<'a, T: ?Sized> {
	mutex: &'a PrioritySpinMutex<T>,
	flavor: Flavor,
	saved_irq: Option<bool>,
}

impl<T> PrioritySpinMutex<T> {
	pub const fn new(data: T) -> Self {
		Self {
			raw: RawPrioritySpinlock::new(),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: ?Sized> PrioritySpinMutex<T> {
	fn guard(&self, flavor: Flavor, saved_irq: Option<bool>) -> PrioritySpinMutexGuard<'_, T> {
		PrioritySpinMutexGuard {
			mutex: self,
			flavor,
			saved_irq,
		}
	}

	pub fn lock(&self) -> PrioritySpinMutexGuard<'_, T> {
		let was_enabled = irq::nested_disable();
		self.raw.lock();
		self.guard(Flavor::Normal, Some(was_enabled))
	}

	pub fn lock_priority(&self) -> PrioritySpinMutexGuard<'_, T> {
		let was_enabled = irq::nested_disable();
		self.raw.lock_priority();
		self.guard(Flavor::Priority, Some(was_enabled))
	}

	pub fn lock_plain(&self) -> PrioritySpinMutexGuard<'_, T> {
		self.raw.lock();
		self.guard(Flavor::Normal, None)
	}

	pub fn lock_priority_plain(&self) -> PrioritySpinMutexGuard<'_, T> {
		self.raw.lock_priority();
		self.guard(Flavor::Priority, None)
	}

	pub fn try_lock_priority_with_retries(
		&self,
		retries: usize,
		delay_iterations: usize,
	) -> Option<PrioritySpinMutexGuard<'_, T>> {
		let was_enabled = irq::nested_disable();
		if self.raw.try_lock_priority_with_retries(retries, delay_iterations) {
			Some(self.guard(Flavor::Priority, Some(was_enabled)))
		} else {
			irq::nested_enable(was_enabled);
			None
		}
	}
}

impl<T: ?Sized> Deref for PrioritySpinMutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.mutex.data.get() }
	}
}

impl<T: ?Sized> DerefMut for PrioritySpinMutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.mutex.data.get() }
	}
}

impl<T: ?Sized> Drop for PrioritySpinMutexGuard<'_, T> {
	fn drop(&mut self) {
		match self.flavor {
			Flavor::Normal => self.mutex.raw.unlock(),
			Flavor::Priority => self.mutex.raw.unlock_priority(),
		}
		if let Some(was_enabled) = self.saved_irq {
			irq::nested_enable(was_enabled);
		}
	}
}

/// Plain interrupt-masking spinlock for the boot-initialized global
/// tables that interrupt delivery reads.
pub struct InterruptSpinMutex<T: ?Sized> {
	raw: RawPrioritySpinlock,
	data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for InterruptSpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for InterruptSpinMutex<T> {}

pub struct InterruptSpinMutexGuard<'a, T: ?Sized> {
	mutex: &'a InterruptSpinMutex<T>,
	was_enabled: bool,
}

impl<T> InterruptSpinMutex<T> {
	pub const fn new(data: T) -> Self {
		Self {
			raw: RawPrioritySpinlock::new(),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: ?Sized> InterruptSpinMutex<T> {
	pub fn lock(&self) -> InterruptSpinMutexGuard<'_, T> {
		let was_enabled = irq::nested_disable();
		self.raw.lock();
		InterruptSpinMutexGuard {
			mutex: self,
			was_enabled,
		}
	}
}

impl<T: ?Sized> Deref for InterruptSpinMutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.mutex.data.get() }
	}
}

impl<T: ?Sized> DerefMut for InterruptSpinMutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.mutex.data.get() }
	}
}

impl<T: ?Sized> Drop for InterruptSpinMutexGuard<'_, T> {
	fn drop(&mut self) {
		self.mutex.raw.unlock();
		irq::nested_enable(self.was_enabled);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normal_lock_round_trip() {
		let mutex = PrioritySpinMutex::new(0);
		{
			let mut guard = mutex.lock();
			*guard = 2;
		}
		assert_eq!(*mutex.lock(), 2);
	}

	#[test]
	fn flavors_exclude_each_other_and_themselves() {
		let raw = RawPrioritySpinlock::new();
		raw.lock();
		assert!(!raw.try_lock_priority());
		raw.unlock();
		assert!(raw.try_lock_priority());
		assert!(!raw.try_lock_priority());
		raw.unlock_priority();
		raw.lock();
		raw.unlock();
	}

	#[test]
	fn priority_guard_releases_its_own_bit() {
		let mutex = PrioritySpinMutex::new(3);
		{
			let guard = mutex
				.try_lock_priority_with_retries(0, 0)
				.expect("idle lock must be acquirable");
			assert_eq!(*guard, 3);
		}
		// Both flavors must see the lock idle again.
		assert!(mutex.raw.try_lock_priority());
		mutex.raw.unlock_priority();
		drop(mutex.lock());
	}

	#[test]
	fn bounded_retry_gives_up() {
		let raw = RawPrioritySpinlock::new();
		raw.lock();
		assert!(!raw.try_lock_priority_with_retries(4, 10));
		raw.unlock();
		assert!(raw.try_lock_priority_with_retries(4, 10));
		raw.unlock_priority();
	}

	#[test]
	fn guard_releases_on_drop() {
		let mutex = InterruptSpinMutex::new(5);
		drop(mutex.lock());
		assert_eq!(*mutex.lock(), 5);
	}
}
