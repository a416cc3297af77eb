//! Logger for the score
//!
//! Routes the `log` facade to a console sink provided by the board support
//! code. Records are formatted into a fixed stack buffer, no allocation.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record};
use spin::Once;

/// Byte sink receiving one formatted line per record
pub type ConsoleSink = fn(&[u8]);

const LINE_CAPACITY: usize = 512;

struct ConsoleLogger {
    sink: ConsoleSink,
    level: LevelFilter,
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut buf = [0u8; LINE_CAPACITY];
            let len = format_record(&mut buf, record.level(), *record.args());
            (self.sink)(&buf[..len]);
        }
    }

    fn flush(&self) {}
}

/// Format: [LEVEL] message
pub fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Format one record into `buffer`, truncating, and return the length used
pub fn format_record(buffer: &mut [u8], level: Level, args: fmt::Arguments<'_>) -> usize {
    let mut writer = BufferWriter { buffer, pos: 0 };
    let _ = write!(writer, "[{}] {}\n", level_tag(level), args);
    writer.pos
}

/// Simple buffer writer for formatting without alloc
pub struct BufferWriter<'a> {
    pub buffer: &'a mut [u8],
    pub pos: usize,
}

impl<'a> Write for BufferWriter<'a> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buffer.len() - self.pos;
        let to_write = bytes.len().min(remaining);

        if to_write > 0 {
            self.buffer[self.pos..self.pos + to_write].copy_from_slice(&bytes[..to_write]);
            self.pos += to_write;
        }

        Ok(())
    }
}

static LOGGER: Once<ConsoleLogger> = Once::new();

/// Install the logger
///
/// Only the first call installs; later calls return `false` and leave the
/// existing sink in place.
pub fn init(sink: ConsoleSink, level: LevelFilter) -> bool {
    let mut installed = false;
    let logger = LOGGER.call_once(|| {
        installed = true;
        ConsoleLogger { sink, level }
    });
    if !installed {
        return false;
    }
    match log::set_logger(logger) {
        Ok(()) => {
            log::set_max_level(level);
            true
        }
        Err(_) => false,
    }
}
