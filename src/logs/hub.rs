// src/logs/hub.rs

//! Append-only per-task logs with live fan-out.
//!
//! Each task run owns a history vector and, while the task is live, a
//! `tokio::sync::broadcast` sender. The broadcast ring is the bounded
//! per-subscriber buffer: a subscriber that falls behind loses the oldest
//! entries and is told how many via [`LogEvent::Gap`]. Appenders never wait
//! on subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, trace};

use crate::errors::{PipeflowError, Result};
use crate::logs::entry::{LogEntry, SequencedEntry};
use crate::types::TaskRunId;

/// What a subscriber sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Entry(SequencedEntry),
    /// The subscriber's buffer overflowed; `missed` entries were dropped.
    Gap { missed: u64 },
}

#[derive(Debug)]
struct TaskLog {
    entries: Vec<LogEntry>,
    /// `None` once the task reached a terminal state.
    sender: Option<broadcast::Sender<SequencedEntry>>,
}

#[derive(Debug)]
pub struct LogHub {
    buffer: usize,
    tasks: Mutex<HashMap<TaskRunId, TaskLog>>,
}

impl LogHub {
    /// `buffer` is the per-subscriber capacity (clamped to at least 1).
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskRunId, TaskLog>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty, open log for a task run. Registering twice is a no-op.
    pub fn register(&self, task_run_id: TaskRunId) {
        let mut tasks = self.lock();
        tasks.entry(task_run_id).or_insert_with(|| TaskLog {
            entries: Vec::new(),
            sender: Some(broadcast::channel(self.buffer).0),
        });
    }

    /// Install a persisted history. `open` controls whether live
    /// subscribers can still attach.
    pub fn restore(&self, task_run_id: TaskRunId, entries: Vec<LogEntry>, open: bool) {
        let sender = open.then(|| broadcast::channel(self.buffer).0);
        self.lock().insert(task_run_id, TaskLog { entries, sender });
    }

    /// Append an entry and fan it out; returns its sequence number.
    ///
    /// Appending to a closed log still extends the history.
    pub fn append(&self, task_run_id: TaskRunId, entry: LogEntry) -> Result<u64> {
        let mut tasks = self.lock();
        let log = tasks
            .get_mut(&task_run_id)
            .ok_or(PipeflowError::TaskRunNotFound(task_run_id))?;

        let seq = log.entries.len() as u64;
        log.entries.push(entry.clone());

        if let Some(sender) = &log.sender {
            // No receivers is fine.
            let _ = sender.send(SequencedEntry { seq, entry });
        }

        trace!(task_run_id = %task_run_id, seq, "log entry appended");
        Ok(seq)
    }

    /// History from `from` (inclusive) to the end.
    pub fn read(&self, task_run_id: TaskRunId, from: u64) -> Result<Vec<SequencedEntry>> {
        let tasks = self.lock();
        let log = tasks
            .get(&task_run_id)
            .ok_or(PipeflowError::TaskRunNotFound(task_run_id))?;
        Ok(suffix(&log.entries, from).collect())
    }

    pub fn len(&self, task_run_id: TaskRunId) -> Option<usize> {
        self.lock().get(&task_run_id).map(|l| l.entries.len())
    }

    pub fn is_open(&self, task_run_id: TaskRunId) -> bool {
        self.lock()
            .get(&task_run_id)
            .is_some_and(|l| l.sender.is_some())
    }

    /// Receive every entry appended after this call.
    pub fn subscribe(&self, task_run_id: TaskRunId) -> Result<LogSubscription> {
        let tasks = self.lock();
        let log = tasks
            .get(&task_run_id)
            .ok_or(PipeflowError::TaskRunNotFound(task_run_id))?;

        Ok(LogSubscription {
            replay: VecDeque::new(),
            live: log.sender.as_ref().map(|s| s.subscribe()),
        })
    }

    /// Replay history from `from`, then follow live appends.
    ///
    /// Snapshot and attach happen under one lock, so nothing is duplicated
    /// or lost at the seam.
    pub fn subscribe_from(&self, task_run_id: TaskRunId, from: u64) -> Result<LogSubscription> {
        let tasks = self.lock();
        let log = tasks
            .get(&task_run_id)
            .ok_or(PipeflowError::TaskRunNotFound(task_run_id))?;

        Ok(LogSubscription {
            replay: suffix(&log.entries, from).collect(),
            live: log.sender.as_ref().map(|s| s.subscribe()),
        })
    }

    /// End live delivery for a task; subscribers drain and then see the end.
    pub fn close(&self, task_run_id: TaskRunId) {
        let mut tasks = self.lock();
        if let Some(log) = tasks.get_mut(&task_run_id) {
            if log.sender.take().is_some() {
                debug!(task_run_id = %task_run_id, "log stream closed");
            }
        }
    }
}

fn suffix(entries: &[LogEntry], from: u64) -> impl Iterator<Item = SequencedEntry> + '_ {
    entries
        .iter()
        .enumerate()
        .skip(from as usize)
        .map(|(i, e)| SequencedEntry {
            seq: i as u64,
            entry: e.clone(),
        })
}

/// A subscriber's view of one task log.
#[derive(Debug)]
pub struct LogSubscription {
    replay: VecDeque<SequencedEntry>,
    live: Option<broadcast::Receiver<SequencedEntry>>,
}

impl LogSubscription {
    /// Next event, or `None` once the log is closed and drained.
    pub async fn next(&mut self) -> Option<LogEvent> {
        if let Some(entry) = self.replay.pop_front() {
            return Some(LogEvent::Entry(entry));
        }

        let rx = self.live.as_mut()?;
        match rx.recv().await {
            Ok(entry) => Some(LogEvent::Entry(entry)),
            Err(RecvError::Lagged(missed)) => Some(LogEvent::Gap { missed }),
            Err(RecvError::Closed) => {
                self.live = None;
                None
            }
        }
    }

    /// Non-blocking variant of [`next`](Self::next); `None` when nothing is
    /// ready right now or the stream ended.
    pub fn try_next(&mut self) -> Option<LogEvent> {
        if let Some(entry) = self.replay.pop_front() {
            return Some(LogEvent::Entry(entry));
        }

        let rx = self.live.as_mut()?;
        match rx.try_recv() {
            Ok(entry) => Some(LogEvent::Entry(entry)),
            Err(TryRecvError::Lagged(missed)) => Some(LogEvent::Gap { missed }),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => {
                self.live = None;
                None
            }
        }
    }

    /// True once the stream ended and nothing is left to replay.
    pub fn is_finished(&self) -> bool {
        self.replay.is_empty() && self.live.is_none()
    }
}
