//! Logging setup
//!
//! Records go to stderr through `env_logger` and are also kept in a bounded
//! in-process buffer so a shell can show the log of the current run.

use std::sync::{Mutex, OnceLock};

use chrono::Local;
use log::{Metadata, Record};

const MAX_CAPTURED_LINES: usize = 1000;

static LOG_BUFFER: OnceLock<Mutex<Vec<String>>> = OnceLock::new();

fn log_buffer() -> &'static Mutex<Vec<String>> {
    LOG_BUFFER.get_or_init(|| Mutex::new(Vec::new()))
}

fn append_line(message: String) {
    if let Ok(mut buffer) = log_buffer().lock() {
        buffer.push(message);
        if buffer.len() > MAX_CAPTURED_LINES {
            let excess = buffer.len() - MAX_CAPTURED_LINES;
            buffer.drain(0..excess);
        }
    }
}

/// Lines captured since start-up (or the last [`clear_captured`]).
pub fn captured_lines() -> Vec<String> {
    match log_buffer().lock() {
        Ok(buffer) => buffer.clone(),
        Err(_) => Vec::new(),
    }
}

pub fn clear_captured() {
    if let Ok(mut buffer) = log_buffer().lock() {
        buffer.clear();
    }
}

pub struct DualLogger {
    env_logger: env_logger::Logger,
}

impl DualLogger {
    pub fn new(env_logger: env_logger::Logger) -> Self {
        Self { env_logger }
    }

    /// Install the logger. `RUST_LOG` overrides the default `focusstack=info`.
    pub fn init() -> Result<(), log::SetLoggerError> {
        let env_logger = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("focusstack=info"),
        )
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Seconds))
        .build();

        let max_level = env_logger.filter();
        log::set_boxed_logger(Box::new(DualLogger::new(env_logger)))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl log::Log for DualLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.env_logger.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.env_logger.matches(record) {
            self.env_logger.log(record);

            let message = format!(
                "[{}] {:5} {} - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            );
            append_line(message);
        }
    }

    fn flush(&self) {
        self.env_logger.flush();
    }
}

/// Convenience wrapper used by the binary.
pub fn init() {
    if let Err(e) = DualLogger::init() {
        eprintln!("Logger already initialised: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_buffer_is_bounded() {
        clear_captured();
        for i in 0..(MAX_CAPTURED_LINES + 25) {
            append_line(format!("line {}", i));
        }
        let lines = captured_lines();
        assert_eq!(lines.len(), MAX_CAPTURED_LINES);
        assert_eq!(lines[0], "line 25");
        clear_captured();
    }
}
