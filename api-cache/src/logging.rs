use std::{fmt, sync::Arc};

use log::{Level, Log, Record};

const TARGET: &str = "api_cache";

/// Logging capability handed to every component at construction.
///
/// The default handle forwards to whatever logger is installed through the
/// `log` facade. A handle built with [`Logger::new`] writes to its own sink
/// instead, which lets tests capture records without touching global state.
#[derive(Clone, Default)]
pub struct Logger {
    sink: Option<Arc<dyn Log>>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Logger")
            .field("global", &self.sink.is_none())
            .finish()
    }
}

impl Logger {
    /// A handle that forwards to the process-wide `log` logger.
    pub fn global() -> Self {
        Self::default()
    }

    /// A handle that writes every record to `sink`.
    pub fn new(sink: Arc<dyn Log>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Emits one record at `level`.
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        match &self.sink {
            Some(sink) => {
                let record = Record::builder()
                    .level(level)
                    .target(TARGET)
                    .args(args)
                    .build();
                if sink.enabled(record.metadata()) {
                    sink.log(&record);
                }
            }
            None => log::log!(target: TARGET, level, "{}", args),
        }
    }
}

macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log(::log::Level::Debug, format_args!($($arg)+))
    };
}

macro_rules! log_info {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log(::log::Level::Info, format_args!($($arg)+))
    };
}

macro_rules! log_warn {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log(::log::Level::Warn, format_args!($($arg)+))
    };
}

macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log(::log::Level::Error, format_args!($($arg)+))
    };
}
