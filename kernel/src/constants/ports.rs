//! I/O port definitions.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;
