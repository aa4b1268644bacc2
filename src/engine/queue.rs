// src/engine/queue.rs

//! One-active-run-per-category queue.
//!
//! Pure data structure; the engine wraps one per category in a
//! `tokio::sync::Mutex` so promotions for the same category are serialized
//! while different categories proceed in parallel.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::RunId;

/// Result of offering a new run to its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The run took the free slot (position 0).
    Active,
    /// The run waits at this 1-based position.
    Queued(usize),
}

#[derive(Debug, Clone)]
pub struct CategoryQueue {
    category: String,
    active: Option<RunId>,
    /// Waiting runs, ordered by creation time (FIFO among equal times).
    waiting: VecDeque<(DateTime<Utc>, RunId)>,
}

impl CategoryQueue {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            active: None,
            waiting: VecDeque::new(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn active(&self) -> Option<RunId> {
        self.active
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.waiting.is_empty()
    }

    pub fn contains(&self, run: RunId) -> bool {
        self.active == Some(run) || self.waiting.iter().any(|(_, id)| *id == run)
    }

    /// Offer a new run. Re-admitting a known run reports its current place.
    pub fn admit(&mut self, run: RunId, created_at: DateTime<Utc>) -> Admission {
        if let Some(pos) = self.position(run) {
            return if pos == 0 {
                Admission::Active
            } else {
                Admission::Queued(pos)
            };
        }

        let idx = self
            .waiting
            .iter()
            .position(|(t, _)| *t > created_at)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(idx, (created_at, run));

        if self.promote() == Some(run) {
            return Admission::Active;
        }

        let pos = self.position(run).unwrap_or(self.waiting.len());
        debug!(category = %self.category, run_id = %run, position = pos, "run queued behind active run");
        Admission::Queued(pos)
    }

    /// Fill a free slot with the oldest waiting run.
    pub fn promote(&mut self) -> Option<RunId> {
        if self.active.is_some() {
            return None;
        }
        let (_, next) = self.waiting.pop_front()?;
        self.active = Some(next);
        debug!(category = %self.category, run_id = %next, "run promoted to active slot");
        Some(next)
    }

    /// Remove `run` from the category. When it held the slot, the oldest
    /// waiting run is promoted and returned.
    pub fn release(&mut self, run: RunId) -> Option<RunId> {
        if self.active == Some(run) {
            self.active = None;
            return self.promote();
        }
        self.remove(run);
        None
    }

    /// Drop a waiting run. Returns false if it was not waiting.
    pub fn remove(&mut self, run: RunId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|(_, id)| *id != run);
        before != self.waiting.len()
    }

    /// 0 for the active run, 1..N for waiting runs.
    pub fn position(&self, run: RunId) -> Option<usize> {
        if self.active == Some(run) {
            return Some(0);
        }
        self.waiting
            .iter()
            .position(|(_, id)| *id == run)
            .map(|i| i + 1)
    }

    /// All positions, active run first.
    pub fn positions(&self) -> Vec<(RunId, usize)> {
        self.active
            .map(|id| (id, 0))
            .into_iter()
            .chain(self.waiting.iter().enumerate().map(|(i, (_, id))| (*id, i + 1)))
            .collect()
    }
}
