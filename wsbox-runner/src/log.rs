//! Combined process log format.
//!
//! Both output streams of a tracked process are written to one file, one
//! record per line: seconds since start (monotonic, six decimals), the stream
//! name, and the text, separated by tabs.

use std::fmt;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

/// Which output stream a log record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdout" => Some(LogStream::Stdout),
            "stderr" => Some(LogStream::Stderr),
            _ => None,
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured output line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub elapsed: Duration,
    pub stream: LogStream,
    pub text: String,
}

impl LogRecord {
    pub fn new(elapsed: Duration, stream: LogStream, text: impl Into<String>) -> Self {
        Self {
            elapsed,
            stream,
            text: text.into(),
        }
    }

    /// Serialized form, newline included.
    pub fn to_line(&self) -> String {
        format!(
            "{:.6}\t{}\t{}\n",
            self.elapsed.as_secs_f64(),
            self.stream,
            self.text
        )
    }
}

/// A record read back from a log file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLogLine {
    pub timestamp: f64,
    pub stream: LogStream,
    pub text: String,
}

/// Parse one line of a log file. Lines that do not follow the format are
/// returned as stdout text with a zero timestamp.
pub fn parse_log_line(line: &str) -> ParsedLogLine {
    let mut parts = line.splitn(3, '\t');
    let parsed = match (parts.next(), parts.next(), parts.next()) {
        (Some(ts), Some(stream), Some(text)) => ts
            .parse::<f64>()
            .ok()
            .zip(LogStream::parse(stream))
            .map(|(timestamp, stream)| ParsedLogLine {
                timestamp,
                stream,
                text: text.to_string(),
            }),
        _ => None,
    };
    parsed.unwrap_or_else(|| ParsedLogLine {
        timestamp: 0.0,
        stream: LogStream::Stdout,
        text: line.to_string(),
    })
}

/// Append-only destination for a tracked process's log.
#[derive(Debug)]
pub struct LogSink {
    file: File,
    max_line_bytes: usize,
}

impl LogSink {
    pub fn new(file: File, max_line_bytes: usize) -> Self {
        Self {
            file,
            max_line_bytes,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    /// Write and flush one record so readers see it immediately.
    pub async fn write_record(&mut self, record: &LogRecord) -> std::io::Result<()> {
        self.file.write_all(record.to_line().as_bytes()).await?;
        self.file.flush().await
    }

    /// Write records until every sender is dropped.
    pub async fn drain(mut self, mut records: mpsc::Receiver<LogRecord>) {
        while let Some(record) = records.recv().await {
            if let Err(error) = self.write_record(&record).await {
                warn!(%error, "failed to append process log record");
                break;
            }
        }
        if let Err(error) = self.file.sync_data().await {
            warn!(%error, "failed to sync process log");
        }
    }
}
