//! Kernel print utilities.
//!
//! Diagnostics go to the host's standard output; the `QUIET` switch mutes
//! the leveled macros without touching plain `print!`. Process-visible
//! output (console writes, the termination message) does not come through
//! here; it goes to the kernel's [`crate::teletype::Teletype`] device.

/// Mutes `info!`/`warning!`/`debug!` when set.
pub static QUIET: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    use std::io::Write;
    let stdout = std::io::stdout();
    let mut guard = stdout.lock();
    let _ = guard.write_fmt(fmt);
}

/// Prints out the message.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => (if !$crate::kprint::QUIET.load(core::sync::atomic::Ordering::SeqCst) {
        $crate::print!("[INFO] {}\n", format_args!($($arg)*))
    });
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => (if !$crate::kprint::QUIET.load(core::sync::atomic::Ordering::SeqCst) {
        $crate::print!("[WARN] {}\n", format_args!($($arg)*))
    });
}

/// Display a debug message.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => (if !$crate::kprint::QUIET.load(core::sync::atomic::Ordering::SeqCst) {
        $crate::print!("[DEBUG] {}\n", format_args!($($arg)*))
    });
}
