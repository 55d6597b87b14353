//! Console sink shared by the logger and the `kprint!` macros.
//!
//! The platform registers one console at boot. Until then, output is dropped.

use alloc::boxed::Box;
use core::fmt;
use spin::Mutex;

/// A text console: anything that can take formatted output and be wiped.
pub trait Console: fmt::Write + Send {
    fn clear(&mut self) {}
}

static CONSOLE: Mutex<Option<Box<dyn Console>>> = Mutex::new(None);

/// Installs `console` as the kernel console and returns the previous one.
pub fn register(console: Box<dyn Console>) -> Option<Box<dyn Console>> {
    CONSOLE.lock().replace(console)
}

pub fn is_registered() -> bool {
    CONSOLE.lock().is_some()
}

/// Runs `f` on the registered console, if any.
pub fn with_console<R>(f: impl FnOnce(&mut dyn Console) -> R) -> Option<R> {
    CONSOLE.lock().as_mut().map(|console| f(console.as_mut()))
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // nowhere left to report a failing console
    let _ = with_console(|console| console.write_fmt(args));
}

/// Prints formatted text to the kernel console.
///
/// # Examples
/// ```
/// mlkernel::kprint!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::devices::console::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the kernel console, followed by a newline.
///
/// # Examples
/// ```
/// mlkernel::kprintln!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

/// Console that keeps everything written to it, for tests and for capturing
/// command output.
#[derive(Debug, Default)]
pub struct BufferConsole {
    pub output: alloc::string::String,
}

impl fmt::Write for BufferConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.output.push_str(s);
        Ok(())
    }
}

impl Console for BufferConsole {
    fn clear(&mut self) {
        self.output.clear();
    }
}
