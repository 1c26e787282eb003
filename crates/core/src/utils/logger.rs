use std::fmt::Display;

use chrono::Local;

#[derive(Clone, Copy)]
enum Level {
    Info,
    Debug,
    Error,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Error => "ERROR",
        }
    }

    fn short(self) -> &'static str {
        match self {
            Level::Info => "",
            Level::Debug => "d",
            Level::Error => "e",
        }
    }
}

/// Line logger with two render modes: `verbose` prefixes a timestamp and
/// level (long-running services), `compact` keeps one-shot tool output
/// short.
pub struct Logger {
    service: &'static str,
    compact: bool,
}

impl Logger {
    pub const fn verbose(service: &'static str) -> Self {
        Self {
            service,
            compact: false,
        }
    }

    pub const fn compact(service: &'static str) -> Self {
        Self {
            service,
            compact: true,
        }
    }

    fn render(&self, level: Level, msg: impl Display) -> String {
        if self.compact {
            format!("{}[{}] {}", level.short(), self.service, msg)
        } else {
            format!(
                "[{}] {} {}: {}",
                self.service,
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                level.label(),
                msg
            )
        }
    }

    pub fn info(&self, msg: impl Display) {
        println!("{}", self.render(Level::Info, msg));
    }

    pub fn debug(&self, msg: impl Display) {
        println!("{}", self.render(Level::Debug, msg));
    }

    pub fn error(&self, msg: impl Display) {
        println!("{}", self.render(Level::Error, msg));
    }
}
