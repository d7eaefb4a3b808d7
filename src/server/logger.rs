//! Per-server log filtering on top of the `log` facade.

use std::fmt;

use log::{Level, LevelFilter};

const TARGET: &str = "microserve";

/// Forwards to the global logger, dropping records above its own level.
///
/// Two servers in one process can run with different verbosity this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logger {
    level: LevelFilter,
}

impl Logger {
    pub fn new(level: LevelFilter) -> Self {
        Self { level }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            log::log!(target: TARGET, level, "{args}");
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LevelFilter::Info)
    }
}
