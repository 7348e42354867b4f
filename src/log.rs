//! Injected logging sink
//!
//! Long-lived components receive a [`LogSink`] at construction instead of
//! reading a process-wide level. The sink carries the component name and its
//! own level; events above that level are dropped before they reach `tracing`.

use std::fmt::Display;
use std::str::FromStr;

use tracing::Level;

/// Logging handle owned by one component
#[derive(Debug, Clone)]
pub struct LogSink {
    component: &'static str,
    level: Level,
}

impl LogSink {
    pub fn new(component: &'static str, level: Level) -> Self {
        Self { component, level }
    }

    /// Sink for a sub-component sharing this sink's level
    pub fn child(&self, component: &'static str) -> Self {
        Self {
            component,
            level: self.level,
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn set_level(&mut self, level: Level) {
        self.level = level;
    }

    /// `tracing` orders levels by verbosity, so ERROR is the smallest
    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    pub fn error(&self, message: impl Display) {
        if self.enabled(Level::ERROR) {
            tracing::error!(component = self.component, "{}", message);
        }
    }

    pub fn warn(&self, message: impl Display) {
        if self.enabled(Level::WARN) {
            tracing::warn!(component = self.component, "{}", message);
        }
    }

    pub fn info(&self, message: impl Display) {
        if self.enabled(Level::INFO) {
            tracing::info!(component = self.component, "{}", message);
        }
    }

    pub fn debug(&self, message: impl Display) {
        if self.enabled(Level::DEBUG) {
            tracing::debug!(component = self.component, "{}", message);
        }
    }

    pub fn trace(&self, message: impl Display) {
        if self.enabled(Level::TRACE) {
            tracing::trace!(component = self.component, "{}", message);
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("host", Level::INFO)
    }
}

/// Parse a level name, falling back to INFO
pub fn parse_level(value: &str) -> Level {
    Level::from_str(value.trim()).unwrap_or(Level::INFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filtering() {
        let sink = LogSink::new("registry", Level::WARN);
        assert!(sink.enabled(Level::ERROR));
        assert!(sink.enabled(Level::WARN));
        assert!(!sink.enabled(Level::INFO));
        assert!(!sink.enabled(Level::TRACE));
    }

    #[test]
    fn test_child_keeps_level() {
        let sink = LogSink::new("host", Level::DEBUG);
        let child = sink.child("map");
        assert_eq!(child.component(), "map");
        assert_eq!(child.level(), Level::DEBUG);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level(" DEBUG "), Level::DEBUG);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }
}
