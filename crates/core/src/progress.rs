use std::fmt;

use crate::utils::Logger;

/// Terminal and in-flight states of one download, rendered exactly as the
/// presentation layer expects to parse them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Integer percent, 0..=100.
    Percent(u8),
    Completed,
    FileNotFound,
    Error,
    Incomplete,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Percent(p) => write!(f, "{}%", p),
            DownloadStatus::Completed => write!(f, "Completed"),
            DownloadStatus::FileNotFound => write!(f, "File Not Found"),
            DownloadStatus::Error => write!(f, "Error"),
            DownloadStatus::Incomplete => write!(f, "Incomplete"),
        }
    }
}

/// Where the node reports narrative lines and per-file download progress.
/// Implementations are called from download workers and service threads
/// concurrently.
pub trait ProgressSink: Send + Sync {
    fn log(&self, message: &str);
    fn update_progress(&self, file_name: &str, status: DownloadStatus);
}

/// Progress sink that writes through a [`Logger`].
pub struct LoggerSink {
    logger: &'static Logger,
}

impl LoggerSink {
    pub const fn new(logger: &'static Logger) -> Self {
        Self { logger }
    }
}

impl ProgressSink for LoggerSink {
    fn log(&self, message: &str) {
        self.logger.info(message);
    }

    fn update_progress(&self, file_name: &str, status: DownloadStatus) {
        self.logger.info(format!("{} -> {}", file_name, status));
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(DownloadStatus::Percent(0).to_string(), "0%");
        assert_eq!(DownloadStatus::Percent(33).to_string(), "33%");
        assert_eq!(DownloadStatus::Percent(100).to_string(), "100%");
        assert_eq!(DownloadStatus::Completed.to_string(), "Completed");
        assert_eq!(DownloadStatus::FileNotFound.to_string(), "File Not Found");
        assert_eq!(DownloadStatus::Error.to_string(), "Error");
        assert_eq!(DownloadStatus::Incomplete.to_string(), "Incomplete");
    }
}
