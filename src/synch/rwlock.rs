use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use crate::arch::irq;

const WRITER_ACQUIRED: u64 = 1 << 0;
const WRITER_QUEUED: u64 = 1 << 1;
const WRITER_MASK: u64 = WRITER_ACQUIRED | WRITER_QUEUED;
const READER_UNIT: u64 = 1 << 2;

/// Interrupt-masking reader/writer spinlock with writer priority.
///
/// A single 64-bit word packs the writer-acquired bit, the writer-queued
/// bit, and a 62-bit reader count. A writer announces itself through the
/// queued bit before waiting for readers to drain, so a steady stream of
/// readers cannot starve it.
pub struct RwSpinlock<T: ?Sized> {
	state: AtomicU64,
	data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwSpinlock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwSpinlock<T> {}

pub struct RwSpinlockReadGuard<'a, T: ?Sized> {
	lock: &'a RwSpinlock<T>,
	was_enabled: bool,
}

pub struct RwSpinlockWriteGuard<'a, T: ?Sized> {
	lock: &'a RwSpinlock<T>,
	was_enabled: bool,
}

impl<T> RwSpinlock<T> {
	pub const fn new(data: T) -> Self {
		Self {
			state: AtomicU64::new(0),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: ?Sized> RwSpinlock<T> {
	pub fn read(&self) -> RwSpinlockReadGuard<'_, T> {
		let was_enabled = irq::nested_disable();
		let backoff = Backoff::new();
		loop {
			let state = self.state.load(Ordering::Relaxed);
			if state & WRITER_MASK == 0
				&& self
					.state
					.compare_exchange_weak(
						state,
						state + READER_UNIT,
						Ordering::Acquire,
						Ordering::Relaxed,
					)
					.is_ok()
			{
				return RwSpinlockReadGuard {
					lock: self,
					was_enabled,
				};
			}
			backoff.spin();
		}
	}

	pub fn try_read(&self) -> Option<RwSpinlockReadGuard<'_, T>> {
		let was_enabled = irq::nested_disable();
		let state = self.state.load(Ordering::Relaxed);
		if state & WRITER_MASK == 0
			&& self
				.state
				.compare_exchange(state, state + READER_UNIT, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
		{
			return Some(RwSpinlockReadGuard {
				lock: self,
				was_enabled,
			});
		}
		irq::nested_enable(was_enabled);
		None
	}

	pub fn write(&self) -> RwSpinlockWriteGuard<'_, T> {
		let was_enabled = irq::nested_disable();
		let backoff = Backoff::new();
		// Phase 1: claim the queued bit, respected by later writers too.
		loop {
			let state = self.state.load(Ordering::Relaxed);
			if state & WRITER_QUEUED != 0 {
				backoff.spin();
				continue;
			}
			if self
				.state
				.compare_exchange_weak(
					state,
					state | WRITER_QUEUED,
					Ordering::Acquire,
					Ordering::Relaxed,
				)
				.is_ok()
			{
				break;
			}
			backoff.spin();
		}
		// Phase 2: wait for readers and the previous writer to drain.
		let backoff = Backoff::new();
		loop {
			if self
				.state
				.compare_exchange_weak(
					WRITER_QUEUED,
					WRITER_ACQUIRED,
					Ordering::Acquire,
					Ordering::Relaxed,
				)
				.is_ok()
			{
				return RwSpinlockWriteGuard {
					lock: self,
					was_enabled,
				};
			}
			backoff.spin();
		}
	}

	pub fn try_write(&self) -> Option<RwSpinlockWriteGuard<'_, T>> {
		let was_enabled = irq::nested_disable();
		if self
			.state
			.compare_exchange(0, WRITER_ACQUIRED, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
		{
			return Some(RwSpinlockWriteGuard {
				lock: self,
				was_enabled,
			});
		}
		irq::nested_enable(was_enabled);
		None
	}
}

impl<T: ?Sized> Deref for RwSpinlockReadGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T: ?Sized> Drop for RwSpinlockReadGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.state.fetch_sub(READER_UNIT, Ordering::Release);
		irq::nested_enable(self.was_enabled);
	}
}

impl<T: ?Sized> Deref for RwSpinlockWriteGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T: ?Sized> DerefMut for RwSpinlockWriteGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T: ?Sized> Drop for RwSpinlockWriteGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.state.fetch_and(!WRITER_ACQUIRED, Ordering::Release);
		irq::nested_enable(self.was_enabled);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn readers_share_writers_exclude() {
		let lock = RwSpinlock::new(7);
		let r1 = lock.read();
		let r2 = lock.read();
		assert_eq!(*r1 + *r2, 14);
		assert!(lock.try_write().is_none());
		drop(r1);
		assert!(lock.try_write().is_none());
		drop(r2);
		let mut w = lock.try_write().expect("writer must win on idle lock");
		*w = 8;
		assert!(lock.try_read().is_none());
		drop(w);
		assert_eq!(*lock.read(), 8);
	}
}
