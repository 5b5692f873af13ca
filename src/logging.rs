//! Module related to creating the loggers of a node and reading back the logs they produce.

// Lint options for this module
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

use crate::{AodvError, AodvErrorKind};
use slog::{Drain, Key, Logger, Record, Serializer, Value, KV};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::BufRead;
use std::net::Ipv4Addr;
use std::path::Path;

/// Directory name for where the logs will be placed.
pub const LOG_DIR_NAME: &str = "log";
const LOG_CHANNEL_SIZE: usize = 512; //Default is 128
const LOG_THREAD_NAME: &str = "LoggerThread";

/// Enum that represents the possible status of a message as it moves through the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// The message has reached its destination.
    ACCEPTED,
    /// The message has been dropped. The *reason* field should provide more data.
    DROPPED,
    /// The message has reached an intermediate node and will be forwarded.
    FORWARDING,
    /// A new message has been transmitted
    SENT,
    /// The message has been queued. This usually indicates a pending route operation.
    QUEUED,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MessageStatus::ACCEPTED => write!(f, "ACCEPTED"),
            MessageStatus::DROPPED => write!(f, "DROPPED"),
            MessageStatus::FORWARDING => write!(f, "FORWARDING"),
            MessageStatus::SENT => write!(f, "SENT"),
            MessageStatus::QUEUED => write!(f, "QUEUED"),
        }
    }
}

impl Value for MessageStatus {
    fn serialize(&self, _rec: &Record, key: Key, serializer: &mut dyn Serializer) -> slog::Result {
        serializer.emit_str(key, &self.to_string())
    }
}

/// Struct that encapsulates a log entry
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogEntry {
    /// Main log message
    pub msg: String,
    /// Logging level
    pub level: String,
    /// Timestamp of the event
    pub ts: String,
    /// Packet status
    pub status: Option<String>,
    /// Reason for status
    pub reason: Option<String>,
    /// Type of message
    pub msg_type: Option<String>,
    /// Neighbor the message came from
    pub source: Option<String>,
    /// Neighbor or broadcast address the message was sent to
    pub destination: Option<String>,
}

/// Logs the outcome of processing a control message received from `sender`.
pub fn log_handle_message<T: KV>(
    logger: &Logger,
    sender: Ipv4Addr,
    status: MessageStatus,
    reason: Option<&str>,
    action: Option<&str>,
    msg: &T,
) {
    info!(
        logger,
        "Received message";
        msg,
        "source"=>%sender,
        "action"=>action.unwrap_or(""),
        "reason"=>reason.unwrap_or(""),
        "status"=>status,
    );
}

/// Logs a control message leaving this node.
pub fn log_sent_message<T: KV>(logger: &Logger, destination: Ipv4Addr, ttl: u8, msg: &T) {
    info!(
        logger,
        "Message sent";
        msg,
        "destination"=>%destination,
        "ttl"=>ttl,
        "status"=>MessageStatus::SENT,
    );
}

///Loads a log file and produces an array of log records for processing.
pub fn get_log_records_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<LogEntry>, io::Error> {
    let file = File::open(path)?;
    let mut records = Vec::new();
    let reader = io::BufReader::new(file);

    for line in reader.lines() {
        let data = line?;
        let u: LogEntry = serde_json::from_str(&data)?;
        records.push(u);
    }

    Ok(records)
}

///Returns the first log record whose message matches `msg`.
pub fn find_record_by_msg<'a>(msg: &str, records: &'a [LogEntry]) -> Option<&'a LogEntry> {
    records.iter().find(|rec| rec.msg == msg)
}

/// Create a duplicate logger for the terminal and the file passed as parameter.
pub fn create_logger<P: AsRef<Path>>(log_file_name: P, log_term: bool) -> Result<Logger, AodvError> {
    //Make sure the full path is valid
    if let Some(parent) = log_file_name.as_ref().parent() {
        std::fs::create_dir_all(parent).map_err(|e| AodvError {
            kind: AodvErrorKind::Configuration(String::from("Could not create log directory structure")),
            cause: Some(Box::new(e)),
        })?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_file_name.as_ref())
        .map_err(|e| {
            let err_msg = format!("Could not open log file {}", log_file_name.as_ref().display());
            AodvError {
                kind: AodvErrorKind::Configuration(err_msg),
                cause: Some(Box::new(e)),
            }
        })?;

    if log_term {
        Ok(create_term_and_file_logger(log_file))
    } else {
        Ok(create_file_logger(log_file))
    }
}

fn create_file_logger(log_file: File) -> Logger {
    let d2 = slog_json::Json::new(log_file)
        .add_default_keys()
        .build()
        .fuse();
    let d2 = slog_async::Async::new(d2)
        .chan_size(LOG_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Drop)
        .thread_name(format!("File{}", LOG_THREAD_NAME))
        .build()
        .fuse();

    Logger::root(d2, o!())
}

fn create_term_and_file_logger(log_file: File) -> Logger {
    //Create the terminal drain
    let decorator = slog_term::TermDecorator::new().build();
    let d1 = slog_term::CompactFormat::new(decorator).build().fuse();
    let d1 = slog_async::Async::new(d1)
        .chan_size(LOG_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Drop)
        .thread_name(format!("Term{}", LOG_THREAD_NAME))
        .build()
        .fuse();

    //Create the file drain
    let d2 = slog_json::Json::new(log_file)
        .add_default_keys()
        .build()
        .fuse();
    let d2 = slog_async::Async::new(d2)
        .chan_size(LOG_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Drop)
        .thread_name(format!("File{}", LOG_THREAD_NAME))
        .build()
        .fuse();

    //Fuse the drains and create the logger
    Logger::root(slog::Duplicate::new(d1, d2).fuse(), o!())
}

/// Creates a logger that discards all records. Used for tests that don't need logs.
pub fn create_discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
