//! Serial-backed log sink
//!
//! Routes the `log` facade to the serial console. Installed once at boot;
//! the level can be raised with the `verbose` feature.

use conquer_once::spin::OnceCell;
use log::{LevelFilter, Log, Metadata, Record};

static LOGGER: OnceCell<SerialLogger> = OnceCell::uninit();

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        crate::serial_println!(
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

pub fn init() {
    let logger = LOGGER.get_or_init(|| SerialLogger);
    log::set_logger(logger).expect("logger already installed");

    let level = if cfg!(feature = "verbose") {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    log::set_max_level(level);

    log::info!("Serial logger initialized ({})", level);
}
