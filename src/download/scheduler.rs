//! FIFO download scheduler with prioritize/discard/drive-cancel semantics.
//! A download manager might track per-download control flags in a
//! `Mutex`-guarded map; here the queue itself is the single mutex-guarded
//! shared state, so there's no global singleton outside the process-wide
//! router.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Driving,
    Discarded,
}

#[derive(Clone, Debug)]
pub struct DownloadItem {
    pub id: String,
    pub cave_id: String,
    pub status: DownloadStatus,
    pub total_bytes: u64,
    pub done_bytes: u64,
}

pub struct Progress {
    pub download_id: String,
    pub done_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: f64,
}

struct SchedulerState {
    queue: VecDeque<DownloadItem>,
    driving: Option<(String, CancelToken)>,
}

/// A FIFO queue with at most one item `Driving` at a time. `prioritize`
/// reorders the queue without
/// touching an in-flight driver; `discard` removes a queued item outright;
/// `drive_cancel` only interrupts the current driver.
pub struct DownloadScheduler {
    state: Mutex<SchedulerState>,
    last_progress_emit: Mutex<Option<Instant>>,
}

impl Default for DownloadScheduler {
    fn default() -> Self {
        Self {
            state: Mutex::new(SchedulerState { queue: VecDeque::new(), driving: None }),
            last_progress_emit: Mutex::new(None),
        }
    }
}

impl DownloadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, item: DownloadItem) {
        self.state.lock().unwrap().queue.push_back(item);
    }

    /// Moves a queued item to the front without touching an in-flight
    /// driver.
    pub fn prioritize(&self, download_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.queue.iter().position(|d| d.id == download_id) {
            let item = state.queue.remove(pos).unwrap();
            state.queue.push_front(item);
            true
        } else {
            false
        }
    }

    /// Removes a queued-but-not-driving item outright. Returns `false` if
    /// the item is currently driving or unknown.
    pub fn discard(&self, download_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.driving.as_ref().map(|(id, _)| id == download_id).unwrap_or(false) {
            return false;
        }
        if let Some(pos) = state.queue.iter().position(|d| d.id == download_id) {
            state.queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Pops the next queued item and marks it `Driving`, returning its
    /// token so the caller can check cancellation. Enforces the
    /// single-driver invariant: fails if something is already driving.
    pub fn start_next(&self) -> Option<(DownloadItem, CancelToken)> {
        let mut state = self.state.lock().unwrap();
        if state.driving.is_some() {
            return None;
        }
        let mut item = state.queue.pop_front()?;
        item.status = DownloadStatus::Driving;
        let token = CancelToken::new();
        state.driving = Some((item.id.clone(), token.clone()));
        Some((item, token))
    }

    /// Interrupts the current driver without changing queue order.
    pub fn drive_cancel(&self) {
        let state = self.state.lock().unwrap();
        if let Some((_, token)) = &state.driving {
            token.fire();
        }
    }

    pub fn finish_driving(&self, download_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.driving.as_ref().map(|(id, _)| id == download_id).unwrap_or(false) {
            state.driving = None;
        }
    }

    pub fn snapshot(&self) -> Vec<DownloadItem> {
        self.state.lock().unwrap().queue.iter().cloned().collect()
    }

    /// Rate-limits progress emission to at most once per second: the
    /// driver emits progress and speed estimates at a bounded rate, ≤ 1 Hz.
    /// Returns `true` if the caller should actually emit now.
    pub fn should_emit_progress(&self) -> bool {
        let mut last = self.last_progress_emit.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < Duration::from_secs(1) => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

pub type SharedScheduler = Arc<DownloadScheduler>;
