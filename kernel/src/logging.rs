//! Kernel logging facility
//!
//! Routes the `log` facade to the registered console as `[LEVEL] message`
//! lines. Records logged before a console exists are dropped.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::devices::console;

pub static LOGGER: Logger = Logger;

/// Console-backed logger. Each record is written while holding the console
/// lock, so lines from different callers never interleave.
pub struct Logger;

/// Debug builds log everything down to `Debug`, release builds stop at `Info`.
pub const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Writes one log line in the kernel's format.
pub fn format_record(
    out: &mut (impl Write + ?Sized),
    level: Level,
    args: &fmt::Arguments,
) -> fmt::Result {
    writeln!(out, "[{}] {}", level, args)
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = console::with_console(|console| {
            format_record(console, record.level(), record.args())
        });
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`]. Only the first call has any effect.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(default_level());
    }
}
