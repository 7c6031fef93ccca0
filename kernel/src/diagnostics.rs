//! Kernel logging over the serial port.

use core::fmt::Write;

pub struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let mut com1 = crate::globals::COM1.lock();
            let lvl_char = level_prefix(record.level());
            writeln!(com1, "[{}] {}", lvl_char, record.args()).unwrap_or(());
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Trace))
        .unwrap_or(());
}

fn level_prefix(level: log::Level) -> char {
    match level {
        log::Level::Trace => 'T',
        log::Level::Debug => 'D',
        log::Level::Info => 'I',
        log::Level::Warn => 'W',
        log::Level::Error => 'E',
    }
}
