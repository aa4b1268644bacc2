// src/logs/mod.rs

//! Task-run logs: records ([`entry`]) and the fan-out hub ([`hub`]).

pub mod entry;
pub mod hub;

pub use entry::{LogEntry, LogLevel, SequencedEntry};
pub use hub::{LogEvent, LogHub, LogSubscription};
