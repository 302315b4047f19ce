/// Structured event log for launcher activity.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Entries kept in memory for display.
const TAIL_CAPACITY: usize = 500;

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
}

impl LogEntry {
    /// One line for on-screen display.
    pub fn display_line(&self) -> String {
        format!(
            "{} [{:?}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

pub struct EventLog {
    writer: Mutex<Option<BufWriter<File>>>,
    tail: Mutex<VecDeque<LogEntry>>,
}

impl EventLog {
    /// An empty `log_path` keeps events in memory only.
    pub fn new(log_path: &str) -> Result<Self> {
        let writer = if !log_path.is_empty() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(EventLog {
            writer: Mutex::new(writer),
            tail: Mutex::new(VecDeque::with_capacity(TAIL_CAPACITY)),
        })
    }

    pub fn info(&self, msg: &str) {
        info!("{}", msg);
        self.record(EventLevel::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        warn!("{}", msg);
        self.record(EventLevel::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        error!("{}", msg);
        self.record(EventLevel::Error, msg);
    }

    /// Most recent entries, oldest first.
    pub fn recent(&self) -> Vec<LogEntry> {
        match self.tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn record(&self, level: EventLevel, msg: &str) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: msg.to_string(),
        };
        match serde_json::to_string(&entry) {
            Ok(line) => self.write_line(&line),
            Err(e) => error!("Failed to serialize LogEntry: {}", e),
        }
        if let Ok(mut tail) = self.tail.lock() {
            if tail.len() == TAIL_CAPACITY {
                tail.pop_front();
            }
            tail.push_back(entry);
        }
    }

    fn write_line(&self, line: &str) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(ref mut w) = *guard {
                let _ = writeln!(w, "{}", line);
                let _ = w.flush();
            }
        }
    }
}
