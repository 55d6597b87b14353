//! Console devices.
//!
//! - `console`: the sink every log line and command response goes to
//! - `serial`: COM1 through a UART 16550

pub mod console;
#[cfg(target_arch = "x86_64")]
pub mod serial;

/// Makes COM1 the kernel console.
#[cfg(target_arch = "x86_64")]
pub fn init_serial_console() {
    console::register(alloc::boxed::Box::new(serial::SerialConsole));
}
