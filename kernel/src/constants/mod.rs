//! System-wide constants and fixed layout values.

pub mod filesys;
pub mod memory;
pub mod ports;
pub mod processes;
