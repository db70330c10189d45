use hermit_sync::{OnceCell, SpinMutex};

/// A cell for iteratively initializing a `OnceCell`.
///
/// Boot code builds the value up in place through [`InitCell::with`];
/// the first reader finalizes it, after which the value is immutable.
pub struct InitCell<T> {
	init: SpinMutex<Option<T>>,
	once: OnceCell<T>,
}

impl<T> InitCell<T> {
	pub const fn new(val: T) -> Self {
		Self {
			init: SpinMutex::new(Some(val)),
			once: OnceCell::new(),
		}
	}

	pub fn with(&self, f: impl FnOnce(Option<&mut T>)) {
		let mut guard = self.init.lock();
		f((*guard).as_mut());
	}

	pub fn get(&self) -> Option<&T> {
		self.once.get()
	}

	pub fn finalize(&self) -> &T {
		self.once.get_or_init(|| self.init.lock().take().unwrap())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builds_up_then_freezes() {
		let cell = InitCell::new(alloc::vec::Vec::new());
		cell.with(|v| v.unwrap().push(1));
		cell.with(|v| v.unwrap().push(2));
		assert!(cell.get().is_none());

		assert_eq!(cell.finalize().as_slice(), [1, 2]);
		assert_eq!(cell.get().map(|v| v.len()), Some(2));
		// Post-finalize mutation attempts see no staging value.
		cell.with(|v| assert!(v.is_none()));
	}
}
