//! Supervisor logger
//!
//! Line-oriented console logging with level colouring. Installed once
//! at boot; the runtime crates only use the facade.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let (color, name) = match record.level() {
            Level::Error => ("\x1b[31m", "ERROR"),
            Level::Warn => ("\x1b[33m", "WARN "),
            Level::Info => ("\x1b[34m", "INFO "),
            Level::Debug => ("\x1b[36m", "DEBUG"),
            Level::Trace => ("\x1b[35m", "TRACE"),
        };
        let mut out = std::io::stderr().lock();
        let _ = writeln!(out, "{color}[aegis] {name}\x1b[0m {}", record.args());
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Install the logger with the given verbosity.
pub fn init(level: LevelFilter) {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level)).ok();
}
