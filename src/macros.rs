/// Print formatted text to the kernel console.
macro_rules! print {
	($($arg:tt)+) => {
		$crate::console::_print(format_args!($($arg)+))
	};
}

/// Print formatted text to the kernel console, followed by a newline.
macro_rules! println {
	() => {
		print!("\n")
	};
	($($arg:tt)+) => {
		print!("{}\n", format_args!($($arg)+))
	};
}
