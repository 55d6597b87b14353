//! Serial port interface for UART 16550 communication.

use crate::constants::ports::SERIAL_PORT;
use core::fmt::{self, Write as _};
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

use super::console::Console;

lazy_static! {
    /// Thread-safe wrapper around the first serial port (COM1).
    /// Initializes the port on first access.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(SERIAL_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Kernel console on COM1. Only meaningful on the real machine: the port is
/// programmed with `in`/`out` instructions.
pub struct SerialConsole;

impl fmt::Write for SerialConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        SERIAL1.lock().write_str(s)
    }
}

impl Console for SerialConsole {
    fn clear(&mut self) {
        // ANSI erase display, cursor home
        let _ = SERIAL1.lock().write_str("\x1b[2J\x1b[H");
    }
}
