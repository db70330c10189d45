//! Byte sink for the kernel log.
//!
//! The actual output device (serial port, framebuffer, ...) lives outside
//! this crate; boot glue installs a sink before enabling logging.

use core::fmt;

use crate::synch::InterruptSpinMutex;

/// A function consuming one chunk of console output.
pub type ConsoleSink = fn(&[u8]);

pub(crate) struct Console {
	sink: Option<ConsoleSink>,
}

impl Console {
	const fn new() -> Self {
		Self { sink: None }
	}
}

impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		if let Some(sink) = self.sink {
			sink(s.as_bytes());
		}
		Ok(())
	}
}

pub(crate) static CONSOLE: InterruptSpinMutex<Console> = InterruptSpinMutex::new(Console::new());

/// Install the byte sink that receives all console output.
pub fn install_sink(sink: ConsoleSink) {
	CONSOLE.lock().sink = Some(sink);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
	use core::fmt::Write;

	CONSOLE.lock().write_fmt(args).ok();
}
