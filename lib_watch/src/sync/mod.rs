//! # Stream Synchronizer
//!
//! Buffers frames per logical source (camera), keeps sources aligned to a
//! shared frame index and target rate, counts drops, and scores
//! synchronization quality over a trailing window.
//!
//! Frames are rejected rather than reordered: a frame whose index is not
//! strictly greater than the source's last accepted index is dropped and
//! counted. All state lives under one lock so `reset()` is atomic relative
//! to readers — no caller ever observes a half-cleared synchronizer.

pub mod buffer;
pub mod playback;

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::{Fault, FaultKind, Severity};
use buffer::{SourceFrame, StreamBuffer};
use playback::PlaybackCursor;

/// Component name used for faults raised by the synchronizer.
pub const SYNC_COMPONENT: &str = "sync";

/// Lowest rate quality_reduction is allowed to throttle down to.
const MIN_TARGET_FPS: u32 = 5;

struct SyncInner {
    buffers: HashMap<String, StreamBuffer>,
    cursor: PlaybackCursor,
    target_fps: u32,
}

pub struct StreamSynchronizer {
    cfg: SyncConfig,
    inner: Mutex<SyncInner>,
    faults: mpsc::UnboundedSender<Fault>,
}

impl StreamSynchronizer {
    pub fn new(cfg: SyncConfig, faults: mpsc::UnboundedSender<Fault>) -> Self {
        let inner = SyncInner {
            buffers: HashMap::new(),
            cursor: PlaybackCursor::new(),
            target_fps: cfg.target_fps,
        };
        Self {
            cfg,
            inner: Mutex::new(inner),
            faults,
        }
    }

    /// Ingests one frame. Returns true if the frame was accepted and
    /// buffered. Never blocks on I/O.
    pub fn ingest(&self, source: &str, frame_index: u64, payload: serde_json::Value) -> bool {
        let accepted = {
            let mut inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
            let max_buffer = self.cfg.max_buffer;
            let window = self.cfg.drop_window();
            let buf = inner
                .buffers
                .entry(source.to_string())
                .or_insert_with(|| StreamBuffer::new(max_buffer, window));
            let accepted = buf.push(frame_index, payload);
            if accepted {
                inner.cursor.follow(frame_index);
            }
            accepted
        };
        if !accepted {
            log::debug!(
                "Rejected stale/duplicate frame {} for source '{}'",
                frame_index,
                source
            );
            let _ = self.faults.send(Fault::new(
                FaultKind::FrameProcessingError,
                Severity::Low,
                SYNC_COMPONENT,
                format!("stale or duplicate frame for source {}", source),
            ));
        }
        accepted
    }

    /// Most recently accepted frame for the source, if any.
    pub fn current_frame(&self, source: &str) -> Option<SourceFrame> {
        let inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        inner.buffers.get(source).and_then(|b| b.latest().cloned())
    }

    /// Buffered frame at or below the playback cursor, for scrubbing.
    pub fn scrub_frame(&self, source: &str) -> Option<SourceFrame> {
        let inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        let position = inner.cursor.position();
        inner
            .buffers
            .get(source)
            .and_then(|b| b.frame_at_or_before(position).cloned())
    }

    pub fn play(&self) {
        let mut inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        inner.cursor.play();
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        inner.cursor.pause();
    }

    pub fn next_frame(&self) {
        let mut inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        inner.cursor.step_forward();
    }

    pub fn previous_frame(&self) {
        let mut inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        inner.cursor.step_back();
    }

    pub fn is_playing(&self) -> bool {
        self.inner
            .lock()
            .expect("StreamSynchronizer lock poisoned")
            .cursor
            .is_playing()
    }

    pub fn cursor_position(&self) -> u64 {
        self.inner
            .lock()
            .expect("StreamSynchronizer lock poisoned")
            .cursor
            .position()
    }

    pub fn target_fps(&self) -> u32 {
        self.inner
            .lock()
            .expect("StreamSynchronizer lock poisoned")
            .target_fps
    }

    /// Halves the target rate down to a floor. Used by the quality_reduction
    /// recovery action; restored on reset.
    pub fn reduce_target_rate(&self) -> u32 {
        let mut inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        inner.target_fps = (inner.target_fps / 2).max(MIN_TARGET_FPS);
        log::info!("Target rate reduced to {} fps", inner.target_fps);
        inner.target_fps
    }

    /// Drops the oldest half of every buffer. Used by the memory_cleanup
    /// recovery action.
    pub fn trim_buffers(&self) {
        let mut inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        for buf in inner.buffers.values_mut() {
            buf.trim_half();
        }
        log::info!("Trimmed stream buffers under memory pressure.");
    }

    /// Aggregate sync quality in [0, 1]: accepted / (accepted + dropped) over
    /// the trailing window, averaged across sources with recent activity.
    /// Sources without recent frames are excluded rather than dragging the
    /// score to zero. No active sources scores 1.0.
    pub fn sync_quality(&self) -> f64 {
        let mut inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        let now = Instant::now();
        let stale_after = self.cfg.stale_source_after();
        let mut scores = Vec::new();
        for buf in inner.buffers.values_mut() {
            if buf.idle_for(now) > stale_after {
                continue;
            }
            let (accepted, dropped) = buf.window_counts(now);
            let total = accepted + dropped;
            if total > 0 {
                scores.push(accepted as f64 / total as f64);
            }
        }
        if scores.is_empty() {
            return 1.0;
        }
        scores.iter().sum::<f64>() / scores.len() as f64
    }

    /// Total drop count per source since creation or last reset.
    pub fn drop_counts(&self) -> HashMap<String, u64> {
        let inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        inner
            .buffers
            .iter()
            .map(|(k, b)| (k.clone(), b.dropped_total()))
            .collect()
    }

    pub fn source_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        inner.buffers.keys().cloned().collect()
    }

    /// Clears all buffers, counters and the cursor in one step. Readers see
    /// either the old state or the empty state, never something in between.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("StreamSynchronizer lock poisoned");
        inner.buffers.clear();
        inner.cursor = PlaybackCursor::new();
        inner.target_fps = self.cfg.target_fps;
        log::info!("Stream synchronizer reset.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn synchronizer() -> (StreamSynchronizer, mpsc::UnboundedReceiver<Fault>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamSynchronizer::new(SyncConfig::default(), tx), rx)
    }

    #[tokio::test]
    async fn accepted_indices_are_strictly_increasing() {
        let (sync, mut faults) = synchronizer();
        assert!(sync.ingest("cam-01", 1, json!({"track": 1})));
        assert!(sync.ingest("cam-01", 2, json!({"track": 2})));
        assert!(!sync.ingest("cam-01", 2, json!({"dup": true})));
        assert!(!sync.ingest("cam-01", 1, json!({"stale": true})));

        assert_eq!(sync.current_frame("cam-01").unwrap().index, 2);
        assert_eq!(sync.drop_counts()["cam-01"], 2);

        // Each rejection produced a classified fault.
        assert_eq!(faults.recv().await.unwrap().kind, FaultKind::FrameProcessingError);
        assert_eq!(faults.recv().await.unwrap().kind, FaultKind::FrameProcessingError);
    }

    #[tokio::test]
    async fn sources_are_independent() {
        let (sync, _faults) = synchronizer();
        assert!(sync.ingest("cam-01", 10, json!(1)));
        // A lower index on another source is fine.
        assert!(sync.ingest("cam-02", 3, json!(2)));
        assert_eq!(sync.current_frame("cam-01").unwrap().index, 10);
        assert_eq!(sync.current_frame("cam-02").unwrap().index, 3);
        assert!(sync.current_frame("cam-03").is_none());
    }

    #[tokio::test]
    async fn playback_cursor_follows_live_edge_only_while_playing() {
        let (sync, _faults) = synchronizer();
        sync.play();
        sync.ingest("cam-01", 5, json!(5));
        assert_eq!(sync.cursor_position(), 5);

        sync.pause();
        sync.ingest("cam-01", 9, json!(9));
        assert_eq!(sync.cursor_position(), 5);

        sync.next_frame();
        sync.next_frame();
        assert_eq!(sync.cursor_position(), 7);
        sync.previous_frame();
        assert_eq!(sync.cursor_position(), 6);

        assert_eq!(sync.scrub_frame("cam-01").unwrap().index, 5);
        assert_eq!(sync.current_frame("cam-01").unwrap().index, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn quality_excludes_sources_without_recent_frames() {
        let (sync, _faults) = synchronizer();
        // cam-01: 3 accepted, 1 dropped -> 0.75.
        sync.ingest("cam-01", 1, json!(1));
        sync.ingest("cam-01", 2, json!(2));
        sync.ingest("cam-01", 3, json!(3));
        sync.ingest("cam-01", 3, json!(3));
        // cam-02: clean.
        sync.ingest("cam-02", 1, json!(1));
        let q = sync.sync_quality();
        assert!((q - 0.875).abs() < 1e-9, "got {}", q);

        // Let cam-02 go stale, keep cam-01 active.
        tokio::time::sleep(Duration::from_secs(6)).await;
        sync.ingest("cam-01", 4, json!(4));
        let q = sync.sync_quality();
        assert!((q - 0.8).abs() < 1e-9, "got {}", q);
    }

    #[tokio::test]
    async fn reset_clears_everything_atomically() {
        let (sync, _faults) = synchronizer();
        sync.ingest("cam-01", 1, json!(1));
        sync.ingest("cam-01", 1, json!(1));
        sync.play();
        sync.reduce_target_rate();

        sync.reset();
        assert!(sync.source_keys().is_empty());
        assert!(sync.current_frame("cam-01").is_none());
        assert!(sync.drop_counts().is_empty());
        assert!(!sync.is_playing());
        assert_eq!(sync.cursor_position(), 0);
        assert_eq!(sync.target_fps(), SyncConfig::default().target_fps);
        // After reset the index space starts over.
        assert!(sync.ingest("cam-01", 1, json!(1)));
    }

    #[tokio::test]
    async fn reduce_target_rate_halves_down_to_the_floor() {
        let (sync, _faults) = synchronizer();
        assert_eq!(sync.reduce_target_rate(), 15);
        assert_eq!(sync.reduce_target_rate(), 7);
        assert_eq!(sync.reduce_target_rate(), 5);
        assert_eq!(sync.reduce_target_rate(), 5);
    }
}
