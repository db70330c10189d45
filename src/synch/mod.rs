//! Synchronization primitives shared by all subsystems.
//!
//! Everything here spins; there is no scheduler to block on. The
//! interrupt-masking variants save and restore the interrupt flag so they
//! are safe to take from code that also runs in interrupt context.

pub mod ringbuffer;
pub mod rwlock;
pub mod spinlock;

pub use ringbuffer::{BroadcastRingBuffer, MpmcRingBuffer, SimpleMpmcRingBuffer};
pub use rwlock::RwSpinlock;
pub use spinlock::{InterruptSpinMutex, PrioritySpinMutex, RawPrioritySpinlock};
