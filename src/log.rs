use crate::output::truncate_chars;
use serde::{Deserialize, Serialize};

/// Longest console line kept, in characters
pub const MAX_LOG_TEXT_CHARS: usize = 2_000;

/// Log event from guest console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

/// Console levels the host accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(LogLevel::Log),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded console capture for one run
#[derive(Debug, Default)]
pub struct LogBuffer {
    max_lines: usize,
    events: Vec<LogEvent>,
    dropped: u64,
}

impl LogBuffer {
    pub fn new(max_lines: u64) -> Self {
        Self {
            max_lines: usize::try_from(max_lines).unwrap_or(usize::MAX),
            events: Vec::new(),
            dropped: 0,
        }
    }

    /// Append a line; returns false when it was dropped for lack of room
    pub fn push(&mut self, level: LogLevel, text: &str) -> bool {
        if self.events.len() >= self.max_lines {
            self.dropped += 1;
            return false;
        }
        self.events.push(LogEvent {
            level,
            message: truncate_chars(text, MAX_LOG_TEXT_CHARS),
        });
        true
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn into_events(self) -> Vec<LogEvent> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("info".parse::<LogLevel>().is_err());
        assert!("LOG".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn test_buffer_drops_beyond_capacity() {
        let mut logs = LogBuffer::new(2);
        assert!(logs.push(LogLevel::Log, "a"));
        assert!(logs.push(LogLevel::Warn, "b"));
        assert!(!logs.push(LogLevel::Error, "c"));

        assert_eq!(logs.dropped(), 1);
        let events = logs.into_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].message, "b");
    }

    #[test]
    fn test_buffer_truncates_text() {
        let mut logs = LogBuffer::new(1);
        logs.push(LogLevel::Log, &"z".repeat(MAX_LOG_TEXT_CHARS + 10));
        assert_eq!(logs.into_events()[0].message.len(), MAX_LOG_TEXT_CHARS);
    }
}
