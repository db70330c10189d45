//! Arena-backed augmented red–black tree.
//!
//! Nodes live in a slab of stable `u32` indices instead of individually
//! heap-allocated linked records, so clients can keep [`NodeId`] handles
//! in side tables (the timer queue's id map does). Each node carries a
//! client-defined augmentation that is recomputed bottom-up whenever the
//! subtree contents under a node change; rotations recompute the two
//! pivots locally, which suffices because the augmentation is a function
//! of subtree contents and rotations preserve those.

use alloc::vec::Vec;

/// Stable handle to a tree node. Valid until the node is removed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
	pub fn index(self) -> usize {
		self.0 as usize
	}
}

/// A value storable in an [`RbTree`].
///
/// The key must stay fixed while the value is in the tree; mutate values
/// through [`RbTree::get_mut`] only in ways that keep `key()` and
/// `augment()` outputs unchanged for the value itself.
pub trait RbValue {
	type Key: Ord + Copy;
	type Aug: Clone + PartialEq;

	fn key(&self) -> Self::Key;

	/// Recompute the augmented data for the subtree rooted at this
	/// value's node from the node itself and its children's data.
	fn augment(node: NodeId, value: &Self, left: Option<&Self::Aug>, right: Option<&Self::Aug>)
	-> Self::Aug;
}

struct Node<T: RbValue> {
	value: T,
	aug: T::Aug,
	parent: Option<NodeId>,
	left: Option<NodeId>,
	right: Option<NodeId>,
	red: bool,
}

pub struct RbTree<T: RbValue> {
	nodes: Vec<Option<Node<T>>>,
	free: Vec<u32>,
	root: Option<NodeId>,
	len: usize,
}

impl<T: RbValue> RbTree<T> {
	pub const fn new() -> Self {
		Self {
			nodes: Vec::new(),
			free: Vec::new(),
			root: None,
			len: 0,
		}
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn root(&self) -> Option<NodeId> {
		self.root
	}

	fn node(&self, id: NodeId) -> &Node<T> {
		self.nodes[id.index()].as_ref().expect("stale node id")
	}

	fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
		self.nodes[id.index()].as_mut().expect("stale node id")
	}

	pub fn get(&self, id: NodeId) -> &T {
		&self.node(id).value
	}

	/// Mutable access to a stored value. The mutation must not change
	/// the value's key or its own contribution to the augmentation.
	pub fn get_mut(&mut self, id: NodeId) -> &mut T {
		&mut self.node_mut(id).value
	}

	pub fn key(&self, id: NodeId) -> T::Key {
		self.node(id).value.key()
	}

	pub fn aug(&self, id: NodeId) -> &T::Aug {
		&self.node(id).aug
	}

	pub fn left(&self, id: NodeId) -> Option<NodeId> {
		self.node(id).left
	}

	pub fn right(&self, id: NodeId) -> Option<NodeId> {
		self.node(id).right
	}

	pub fn is_red(&self, id: NodeId) -> bool {
		self.node(id).red
	}

	/// Node with the smallest key.
	pub fn first(&self) -> Option<NodeId> {
		let mut current = self.root?;
		while let Some(left) = self.node(current).left {
			current = left;
		}
		Some(current)
	}

	fn red(&self, id: Option<NodeId>) -> bool {
		id.is_some_and(|id| self.node(id).red)
	}

	fn parent(&self, id: NodeId) -> Option<NodeId> {
		self.node(id).parent
	}

	fn minimum(&self, mut id: NodeId) -> NodeId {
		while let Some(left) = self.node(id).left {
			id = left;
		}
		id
	}

	fn recompute_aug(&mut self, id: NodeId) -> bool {
		let node = self.node(id);
		let left = node.left.map(|l| &self.node(l).aug);
		let right = node.right.map(|r| &self.node(r).aug);
		let aug = T::augment(id, &node.value, left, right);
		if aug == self.node(id).aug {
			false
		} else {
			self.node_mut(id).aug = aug;
			true
		}
	}

	fn update_aug_upward(&mut self, from: Option<NodeId>) {
		let mut current = from;
		while let Some(id) = current {
			self.recompute_aug(id);
			current = self.node(id).parent;
		}
	}

	fn rotate_left(&mut self, x: NodeId) {
		let y = self.node(x).right.expect("rotate_left without right child");
		let y_left = self.node(y).left;

		self.node_mut(x).right = y_left;
		if let Some(yl) = y_left {
			self.node_mut(yl).parent = Some(x);
		}

		let x_parent = self.node(x).parent;
		self.node_mut(y).parent = x_parent;
		match x_parent {
			None => self.root = Some(y),
			Some(p) => {
				if self.node(p).left == Some(x) {
					self.node_mut(p).left = Some(y);
				} else {
					self.node_mut(p).right = Some(y);
				}
			}
		}

		self.node_mut(y).left = Some(x);
		self.node_mut(x).parent = Some(y);

		self.recompute_aug(x);
		self.recompute_aug(y);
	}

	fn rotate_right(&mut self, x: NodeId) {
		let y = self.node(x).left.expect("rotate_right without left child");
		let y_right = self.node(y).right;

		self.node_mut(x).left = y_right;
		if let Some(yr) = y_right {
			self.node_mut(yr).parent = Some(x);
		}

		let x_parent = self.node(x).parent;
		self.node_mut(y).parent = x_parent;
		match x_parent {
			None => self.root = Some(y),
			Some(p) => {
				if self.node(p).left == Some(x) {
					self.node_mut(p).left = Some(y);
				} else {
					self.node_mut(p).right = Some(y);
				}
			}
		}

		self.node_mut(y).right = Some(x);
		self.node_mut(x).parent = Some(y);

		self.recompute_aug(x);
		self.recompute_aug(y);
	}

	fn allocate(&mut self, node: Node<T>) -> NodeId {
		match self.free.pop() {
			Some(index) => {
				self.nodes[index as usize] = Some(node);
				NodeId(index)
			}
			None => {
				let index = self.nodes.len() as u32;
				self.nodes.push(Some(node));
				NodeId(index)
			}
		}
	}

	pub fn insert(&mut self, value: T) -> NodeId {
		let key = value.key();
		let id = self.allocate(Node {
			aug: T::augment(NodeId(u32::MAX), &value, None, None),
			value,
			parent: None,
			left: None,
			right: None,
			red: true,
		});
		// The placeholder id passed above never leaks: recomputed below.

		let mut parent = None;
		let mut current = self.root;
		while let Some(c) = current {
			parent = Some(c);
			current = if key < self.node(c).value.key() {
				self.node(c).left
			} else {
				self.node(c).right
			};
		}

		self.node_mut(id).parent = parent;
		match parent {
			None => self.root = Some(id),
			Some(p) => {
				if key < self.node(p).value.key() {
					self.node_mut(p).left = Some(id);
				} else {
					self.node_mut(p).right = Some(id);
				}
			}
		}

		self.update_aug_upward(Some(id));
		self.insert_fixup(id);
		self.len += 1;
		id
	}

	fn insert_fixup(&mut self, mut z: NodeId) {
		while self.red(self.parent(z)) {
			let p = self.parent(z).unwrap();
			// A red parent is never the root, so the grandparent exists.
			let g = self.parent(p).unwrap();
			if Some(p) == self.node(g).left {
				let uncle = self.node(g).right;
				if self.red(uncle) {
					self.node_mut(p).red = false;
					self.node_mut(uncle.unwrap()).red = false;
					self.node_mut(g).red = true;
					z = g;
				} else {
					if Some(z) == self.node(p).right {
						z = p;
						self.rotate_left(z);
					}
					let p = self.parent(z).unwrap();
					let g = self.parent(p).unwrap();
					self.node_mut(p).red = false;
					self.node_mut(g).red = true;
					self.rotate_right(g);
				}
			} else {
				let uncle = self.node(g).left;
				if self.red(uncle) {
					self.node_mut(p).red = false;
					self.node_mut(uncle.unwrap()).red = false;
					self.node_mut(g).red = true;
					z = g;
				} else {
					if Some(z) == self.node(p).left {
						z = p;
						self.rotate_right(z);
					}
					let p = self.parent(z).unwrap();
					let g = self.parent(p).unwrap();
					self.node_mut(p).red = false;
					self.node_mut(g).red = true;
					self.rotate_left(g);
				}
			}
		}
		let root = self.root.unwrap();
		self.node_mut(root).red = false;
	}

	/// Replace the subtree rooted at `u` with the one rooted at `v`.
	fn transplant(&mut self, u: NodeId, v: Option<NodeId>) {
		let u_parent = self.node(u).parent;
		match u_parent {
			None => self.root = v,
			Some(p) => {
				if self.node(p).left == Some(u) {
					self.node_mut(p).left = v;
				} else {
					self.node_mut(p).right = v;
				}
			}
		}
		if let Some(v) = v {
			self.node_mut(v).parent = u_parent;
		}
	}

	pub fn remove(&mut self, z: NodeId) -> T {
		let mut removed_red = self.node(z).red;
		let fix_start;
		let fix_parent;

		let z_left = self.node(z).left;
		let z_right = self.node(z).right;

		if z_left.is_none() {
			fix_start = z_right;
			fix_parent = self.node(z).parent;
			self.transplant(z, z_right);
		} else if z_right.is_none() {
			fix_start = z_left;
			fix_parent = self.node(z).parent;
			self.transplant(z, z_left);
		} else {
			let y = self.minimum(z_right.unwrap());
			removed_red = self.node(y).red;
			fix_start = self.node(y).right;
			if self.node(y).parent == Some(z) {
				fix_parent = Some(y);
			} else {
				fix_parent = self.node(y).parent;
				self.transplant(y, self.node(y).right);
				let zr = self.node(z).right;
				self.node_mut(y).right = zr;
				self.node_mut(zr.unwrap()).parent = Some(y);
			}
			self.transplant(z, Some(y));
			let zl = self.node(z).left;
			self.node_mut(y).left = zl;
			self.node_mut(zl.unwrap()).parent = Some(y);
			let z_red = self.node(z).red;
			self.node_mut(y).red = z_red;
		}

		self.update_aug_upward(fix_parent);
		if !removed_red {
			self.remove_fixup(fix_start, fix_parent);
		}

		self.len -= 1;
		self.free.push(z.0);
		let node = self.nodes[z.index()].take().expect("stale node id");
		node.value
	}

	fn remove_fixup(&mut self, mut x: Option<NodeId>, mut parent: Option<NodeId>) {
		while x != self.root && !self.red(x) {
			let Some(p) = parent else {
				break;
			};
			if x == self.node(p).left {
				// The doubled-black node has a sibling: the removed node
				// was black, so the black heights force one.
				let mut w = self.node(p).right.unwrap();
				if self.node(w).red {
					self.node_mut(w).red = false;
					self.node_mut(p).red = true;
					self.rotate_left(p);
					w = self.node(p).right.unwrap();
				}
				if !self.red(self.node(w).left) && !self.red(self.node(w).right) {
					self.node_mut(w).red = true;
					x = Some(p);
					parent = self.node(p).parent;
				} else {
					if !self.red(self.node(w).right) {
						let wl = self.node(w).left.unwrap();
						self.node_mut(wl).red = false;
						self.node_mut(w).red = true;
						self.rotate_right(w);
						w = self.node(p).right.unwrap();
					}
					let p_red = self.node(p).red;
					self.node_mut(w).red = p_red;
					self.node_mut(p).red = false;
					let wr = self.node(w).right.unwrap();
					self.node_mut(wr).red = false;
					self.rotate_left(p);
					x = self.root;
					parent = None;
				}
			} else {
				let mut w = self.node(p).left.unwrap();
				if self.node(w).red {
					self.node_mut(w).red = false;
					self.node_mut(p).red = true;
					self.rotate_right(p);
					w = self.node(p).left.unwrap();
				}
				if !self.red(self.node(w).left) && !self.red(self.node(w).right) {
					self.node_mut(w).red = true;
					x = Some(p);
					parent = self.node(p).parent;
				} else {
					if !self.red(self.node(w).left) {
						let wr = self.node(w).right.unwrap();
						self.node_mut(wr).red = false;
						self.node_mut(w).red = true;
						self.rotate_left(w);
						w = self.node(p).left.unwrap();
					}
					let p_red = self.node(p).red;
					self.node_mut(w).red = p_red;
					self.node_mut(p).red = false;
					let wl = self.node(w).left.unwrap();
					self.node_mut(wl).red = false;
					self.rotate_right(p);
					x = self.root;
					parent = None;
				}
			}
		}
		if let Some(x) = x {
			self.node_mut(x).red = false;
		}
	}

	/// In-order traversal of all node ids.
	pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
		let mut stack = Vec::new();
		let mut current = self.root;
		core::iter::from_fn(move || {
			while let Some(c) = current {
				stack.push(c);
				current = self.node(c).left;
			}
			let next = stack.pop()?;
			current = self.node(next).right;
			Some(next)
		})
	}
}

impl<T: RbValue> Default for RbTree<T> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::vec::Vec;

	use super::*;

	struct Item(u64);

	#[derive(Clone, PartialEq, Debug)]
	struct MinMax {
		min: u64,
		max: u64,
		leftmost: NodeId,
	}

	impl RbValue for Item {
		type Key = u64;
		type Aug = MinMax;

		fn key(&self) -> u64 {
			self.0
		}

		fn augment(
			node: NodeId,
			value: &Self,
			left: Option<&MinMax>,
			right: Option<&MinMax>,
		) -> MinMax {
			MinMax {
				min: left.map_or(value.0, |l| l.min),
				max: right.map_or(value.0, |r| r.max),
				leftmost: left.map_or(node, |l| l.leftmost),
			}
		}
	}

	fn check_node(tree: &RbTree<Item>, id: NodeId, parent: Option<NodeId>) -> usize {
		let left = tree.left(id);
		let right = tree.right(id);
		assert_eq!(tree.node(id).parent, parent, "broken parent link");
		if tree.is_red(id) {
			assert!(!tree.red(left) && !tree.red(right), "red-red violation");
		}

		let mut min = tree.key(id);
		let mut max = tree.key(id);
		let mut leftmost = id;
		let mut left_black_height = 1;
		if let Some(l) = left {
			assert!(tree.key(l) <= tree.key(id), "order violation");
			left_black_height = check_node(tree, l, Some(id));
			min = tree.aug(l).min;
			leftmost = tree.aug(l).leftmost;
		}
		let mut right_black_height = 1;
		if let Some(r) = right {
			assert!(tree.key(r) >= tree.key(id), "order violation");
			right_black_height = check_node(tree, r, Some(id));
			max = tree.aug(r).max;
		}
		assert_eq!(left_black_height, right_black_height, "black height violation");
		assert_eq!(
			tree.aug(id),
			&MinMax { min, max, leftmost },
			"stale augmentation"
		);
		left_black_height + usize::from(!tree.is_red(id))
	}

	fn check(tree: &RbTree<Item>) {
		if let Some(root) = tree.root() {
			assert!(!tree.is_red(root), "red root");
			check_node(tree, root, None);
		}
	}

	#[test]
	fn insert_remove_random_order() {
		let mut tree = RbTree::new();
		// Deterministic pseudo-random insertion order.
		let mut keys = Vec::new();
		let mut state = 0x2545_f491_4f6c_dd1d_u64;
		for _ in 0..200 {
			state ^= state << 13;
			state ^= state >> 7;
			state ^= state << 17;
			keys.push(state % 1000);
		}

		let mut ids = Vec::new();
		for &k in &keys {
			ids.push(tree.insert(Item(k)));
			check(&tree);
		}
		assert_eq!(tree.len(), 200);

		let inorder: Vec<u64> = tree.iter().map(|id| tree.key(id)).collect();
		let mut sorted = keys.clone();
		sorted.sort_unstable();
		assert_eq!(inorder, sorted);

		// Remove in an interleaved order.
		for chunk in ids.chunks(3) {
			for &id in chunk.iter().rev() {
				tree.remove(id);
				check(&tree);
			}
		}
		assert!(tree.is_empty());
	}

	#[test]
	fn first_and_leftmost_agree() {
		let mut tree = RbTree::new();
		for k in [50, 20, 70, 10, 30, 60, 80] {
			tree.insert(Item(k));
		}
		let first = tree.first().unwrap();
		assert_eq!(tree.key(first), 10);
		let root = tree.root().unwrap();
		assert_eq!(tree.aug(root).leftmost, first);
		assert_eq!(tree.aug(root).min, 10);
		assert_eq!(tree.aug(root).max, 80);
	}
}
