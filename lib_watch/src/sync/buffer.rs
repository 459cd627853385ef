//! Per-source frame buffer with monotonic index enforcement.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// One buffered frame for a source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFrame {
    pub index: u64,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Bounded, strictly-ordered buffer for one logical source. Created lazily on
/// the first frame; only the synchronizer mutates it.
pub(crate) struct StreamBuffer {
    frames: VecDeque<SourceFrame>,
    max_frames: usize,
    last_index: Option<u64>,
    dropped_total: u64,
    /// Trailing record of accept/drop outcomes used for the quality score.
    window: VecDeque<(Instant, bool)>,
    window_len: Duration,
    last_activity: Instant,
}

impl StreamBuffer {
    pub fn new(max_frames: usize, window_len: Duration) -> Self {
        Self {
            frames: VecDeque::with_capacity(max_frames.min(64)),
            max_frames: max_frames.max(1),
            last_index: None,
            dropped_total: 0,
            window: VecDeque::new(),
            window_len,
            last_activity: Instant::now(),
        }
    }

    /// Accepts the frame if its index is strictly greater than the last
    /// accepted one; otherwise counts a drop. Oldest frames are evicted once
    /// the buffer is full.
    pub fn push(&mut self, index: u64, payload: serde_json::Value) -> bool {
        let now = Instant::now();
        self.last_activity = now;
        self.prune(now);

        let accepted = match self.last_index {
            Some(last) => index > last,
            None => true,
        };
        self.window.push_back((now, accepted));

        if !accepted {
            self.dropped_total += 1;
            return false;
        }

        self.last_index = Some(index);
        if self.frames.len() == self.max_frames {
            self.frames.pop_front();
        }
        self.frames.push_back(SourceFrame {
            index,
            payload,
            received_at: Utc::now(),
        });
        true
    }

    pub fn latest(&self) -> Option<&SourceFrame> {
        self.frames.back()
    }

    /// Newest buffered frame whose index does not exceed `position`.
    pub fn frame_at_or_before(&self, position: u64) -> Option<&SourceFrame> {
        self.frames.iter().rev().find(|f| f.index <= position)
    }

    pub fn last_index(&self) -> Option<u64> {
        self.last_index
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Drops the oldest half of the buffer. Used by the memory_cleanup
    /// recovery action.
    pub fn trim_half(&mut self) {
        let keep = self.frames.len() / 2;
        while self.frames.len() > keep {
            self.frames.pop_front();
        }
    }

    /// (accepted, dropped) within the trailing window.
    pub fn window_counts(&mut self, now: Instant) -> (u64, u64) {
        self.prune(now);
        let mut accepted = 0;
        let mut dropped = 0;
        for (_, ok) in &self.window {
            if *ok {
                accepted += 1;
            } else {
                dropped += 1;
            }
        }
        (accepted, dropped)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > self.window_len {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}
