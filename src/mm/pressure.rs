use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::collections::AtomicBitmap;

/// Discrete memory-pressure level of a pool (or of a whole range).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Pressure {
	Surplus = 0,
	Comfortable = 1,
	Moderate = 2,
	Desperate = 3,
}

impl Pressure {
	pub const COUNT: usize = 4;

	pub fn from_index(index: usize) -> Self {
		match index {
			0 => Self::Surplus,
			1 => Self::Comfortable,
			2 => Self::Moderate,
			3 => Self::Desperate,
			_ => unreachable!("invalid pressure index"),
		}
	}

	/// All levels, from most to least free memory.
	pub fn all() -> [Self; Self::COUNT] {
		[
			Self::Surplus,
			Self::Comfortable,
			Self::Moderate,
			Self::Desperate,
		]
	}
}

/// One bitmap per pressure level over a fixed key space.
///
/// For every key exactly one bit is set across the four bitmaps; a
/// transition sets the new level's bit before clearing the old one, so
/// a concurrent reader may transiently see a key at two levels but
/// never at none. Allocation decisions tolerate the staleness and
/// re-check under the pool lock.
pub struct PressureBitmap {
	levels: [AtomicBitmap; Pressure::COUNT],
	current: Box<[AtomicU8]>,
}

impl PressureBitmap {
	/// All keys start out [`Pressure::Desperate`]: a fresh pool holds
	/// nothing.
	pub fn new(keys: usize) -> Self {
		let levels = [
			AtomicBitmap::new(keys),
			AtomicBitmap::new(keys),
			AtomicBitmap::new(keys),
			AtomicBitmap::new(keys),
		];
		let mut current = Vec::with_capacity(keys);
		for key in 0..keys {
			levels[Pressure::Desperate as usize].set(key);
			current.push(AtomicU8::new(Pressure::Desperate as u8));
		}
		Self {
			levels,
			current: current.into_boxed_slice(),
		}
	}

	pub fn len(&self) -> usize {
		self.current.len()
	}

	pub fn is_empty(&self) -> bool {
		self.current.is_empty()
	}

	pub fn get(&self, key: usize) -> Pressure {
		Pressure::from_index(self.current[key].load(Ordering::Acquire) as usize)
	}

	pub fn set(&self, key: usize, pressure: Pressure) {
		let old = self.current[key].swap(pressure as u8, Ordering::AcqRel);
		if old != pressure as u8 {
			self.levels[pressure as usize].set(key);
			self.levels[old as usize].clear(key);
		}
	}

	/// All keys currently at `pressure`, in ascending key order.
	pub fn keys_at(&self, pressure: Pressure) -> impl Iterator<Item = usize> + '_ {
		self.levels[pressure as usize].iter_set()
	}
}

#[cfg(test)]
mod tests {
	use std::vec::Vec;

	use super::*;

	#[test]
	fn exactly_one_level_per_key() {
		let bitmap = PressureBitmap::new(8);
		bitmap.set(3, Pressure::Surplus);
		bitmap.set(5, Pressure::Moderate);
		bitmap.set(3, Pressure::Comfortable);

		for key in 0..8 {
			let set_count = Pressure::all()
				.iter()
				.filter(|&&level| bitmap.keys_at(level).any(|k| k == key))
				.count();
			assert_eq!(set_count, 1, "key {key} must sit at exactly one level");
		}
		assert_eq!(bitmap.get(3), Pressure::Comfortable);
	}

	#[test]
	fn iteration_is_ascending_per_level() {
		let bitmap = PressureBitmap::new(16);
		for key in [9, 1, 12] {
			bitmap.set(key, Pressure::Surplus);
		}
		let surplus: Vec<_> = bitmap.keys_at(Pressure::Surplus).collect();
		assert_eq!(surplus, [1, 9, 12]);
		let desperate: Vec<_> = bitmap.keys_at(Pressure::Desperate).collect();
		assert_eq!(desperate, [0, 2, 3, 4, 5, 6, 7, 8, 10, 11, 13, 14, 15]);
	}
}
