#![cfg_attr(not(test), no_std)]

use core::fmt;

use log::{self, Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

/// 日志的最终输出，内核里是控制台，测试里是 stderr
pub type Sink = fn(fmt::Arguments<'_>);

/// a simple logger
struct SimpleLogger {
    clog: LevelFilter,
    sink: Sink,
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.clog >= metadata.level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        (self.sink)(format_args!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m\n",
            color,
            record.level(),
            record.args(),
        ));
    }

    fn flush(&self) {}
}

/// 由 `KERNEL_CLOG` 在编译期决定日志等级
pub fn level_from_env() -> LevelFilter {
    match option_env!("KERNEL_CLOG") {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

static LOGGER: Once<SimpleLogger> = Once::new();

/// initiate logger
///
/// 可以重复调用，只有第一次生效
pub fn init(sink: Sink) {
    let mut first = false;
    let logger = LOGGER.call_once(|| {
        first = true;
        SimpleLogger {
            clog: level_from_env(),
            sink,
        }
    });
    if first && log::set_logger(logger).is_ok() {
        log::set_max_level(logger.clog);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discard(_args: fmt::Arguments<'_>) {}

    #[test]
    fn init_twice_keeps_first_logger() {
        init(discard);
        init(|args| eprint!("{args}"));
        assert_eq!(log::max_level(), level_from_env());
        log::info!("logger still works after a second init");
    }
}
