use core::fmt;

use anstyle::AnsiColor;
use log::{Level, LevelFilter, Metadata, Record};

/// Data structure to filter kernel messages
struct KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
		true
	}

	fn flush(&self) {}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			let core_id = crate::arch::cpu::core_id();
			let level = ColorLevel(record.level());
			println!("[{core_id}][{level}] {}", record.args());
		}
	}
}

struct ColorLevel(Level);

impl fmt::Display for ColorLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let level = self.0;

		let color = match level {
			Level::Trace => AnsiColor::Magenta,
			Level::Debug => AnsiColor::Blue,
			Level::Info => AnsiColor::Green,
			Level::Warn => AnsiColor::Yellow,
			Level::Error => AnsiColor::Red,
		};

		let style = anstyle::Style::new().bold().fg_color(Some(color.into()));
		write!(f, "{style}{level}{style:#}")
	}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger.
///
/// Must be called exactly once, after a console sink is available.
pub fn init(level: LevelFilter) {
	log::set_logger(&LOGGER).expect("logger already installed");
	log::set_max_level(level);
}
