//! Containers shared across the subsystems.

pub mod bimap;
pub mod bitmap;
pub mod permutation;
pub mod rbtree;

pub use bimap::Bimap;
pub use bitmap::AtomicBitmap;
pub use permutation::Permutation;
pub use rbtree::{NodeId, RbTree, RbValue};
