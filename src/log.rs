use alloc::collections::VecDeque;
use core::fmt::{self, Write};

use spin::Mutex;

/// In-memory log of recent records, newest last.
pub static LOG: Mutex<Option<Log>> = Mutex::new(None);

pub fn init() {
    *LOG.lock() = Some(Log::new(64 * 1024));
}

pub struct Log {
    data: VecDeque<u8>,
    size: usize,
}

impl Log {
    pub fn new(size: usize) -> Log {
        Log {
            data: VecDeque::with_capacity(size),
            size,
        }
    }

    pub fn read(&self) -> (&[u8], &[u8]) {
        self.data.as_slices()
    }

    pub fn write(&mut self, buf: &[u8]) {
        for &b in buf {
            while self.data.len() + 1 >= self.size {
                self.data.pop_front();
            }
            self.data.push_back(b);
        }
    }
}

impl Write for Log {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Log::write(self, s.as_bytes());
        Ok(())
    }
}

struct RingLogger;

impl ::log::Log for RingLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= ::log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if let Some(ref mut log) = *LOG.lock() {
            let _ = writeln!(
                log,
                "{:<5} {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: RingLogger = RingLogger;

/// Routes `log` records into [`LOG`]. Returns false if another logger was
/// installed first.
pub fn init_logger(level: ::log::LevelFilter) -> bool {
    if LOG.lock().is_none() {
        init();
    }
    match ::log::set_logger(&LOGGER) {
        Ok(()) => {
            ::log::set_max_level(level);
            ::log::info!("Logger initialized.");
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(log: &Log) -> Vec<u8> {
        let (a, b) = log.read();
        [a, b].concat()
    }

    #[test]
    fn oldest_bytes_are_dropped_when_full() {
        let mut log = Log::new(8);
        log.write(b"abcdef");
        log.write(b"ghij");
        assert_eq!(contents(&log), b"defghij");
    }

    #[test]
    fn formatted_writes_land_in_buffer() {
        let mut log = Log::new(64);
        write!(log, "key {} -> {}", 3, "enabled").unwrap();
        assert_eq!(contents(&log), b"key 3 -> enabled");
    }

    #[test]
    fn records_are_formatted_into_the_ring() {
        init();
        ::log::Log::log(
            &LOGGER,
            &log::Record::builder()
                .args(format_args!("key {} flipped", 7))
                .level(log::Level::Debug)
                .target("jump_label::system")
                .build(),
        );

        let text = LOG
            .lock()
            .as_ref()
            .map(|log| String::from_utf8_lossy(&contents(log)).into_owned())
            .unwrap_or_default();
        assert!(text.contains("DEBUG jump_label::system: key 7 flipped\n"));

        // Only one logger per process, whichever came first.
        let _ = init_logger(log::LevelFilter::Debug);
        assert!(!init_logger(log::LevelFilter::Debug));
    }
}
