use core::hash::Hash;

use ahash::RandomState;
use hashbrown::HashMap;

/// A bidirectional map over two hashable key spaces.
///
/// Used for sparse index translations, e.g. legacy IRQ emitters to
/// I/O APIC input lines.
pub struct Bimap<L, R> {
	forward: HashMap<L, R, RandomState>,
	backward: HashMap<R, L, RandomState>,
}

impl<L, R> Bimap<L, R>
where
	L: Eq + Hash + Clone,
	R: Eq + Hash + Clone,
{
	pub fn new() -> Self {
		Self {
			forward: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
			backward: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
		}
	}

	pub fn len(&self) -> usize {
		self.forward.len()
	}

	pub fn is_empty(&self) -> bool {
		self.forward.is_empty()
	}

	/// Insert a pairing; both keys must be fresh.
	pub fn insert(&mut self, left: L, right: R) {
		let stale_left = self.forward.insert(left.clone(), right.clone());
		let stale_right = self.backward.insert(right, left);
		assert!(
			stale_left.is_none() && stale_right.is_none(),
			"bimap keys must be unique on both sides"
		);
	}

	pub fn contains_left(&self, left: &L) -> bool {
		self.forward.contains_key(left)
	}

	pub fn contains_right(&self, right: &R) -> bool {
		self.backward.contains_key(right)
	}

	pub fn get_left(&self, left: &L) -> Option<&R> {
		self.forward.get(left)
	}

	pub fn get_right(&self, right: &R) -> Option<&L> {
		self.backward.get(right)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&L, &R)> {
		self.forward.iter()
	}
}

impl<L, R> Default for Bimap<L, R>
where
	L: Eq + Hash + Clone,
	R: Eq + Hash + Clone,
{
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips() {
		let mut map = Bimap::new();
		map.insert(0usize, 2usize);
		map.insert(1, 9);
		assert_eq!(map.get_left(&0), Some(&2));
		assert_eq!(map.get_right(&9), Some(&1));
		assert!(map.contains_right(&2));
		assert!(!map.contains_left(&2));
	}
}
