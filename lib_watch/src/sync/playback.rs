//! Shared playback cursor for historical scrubbing.

/// Cursor over the shared frame index, independent of per-source ingestion.
/// While playing it follows the newest accepted index; paused it only moves
/// through the step operations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlaybackCursor {
    playing: bool,
    position: u64,
}

impl PlaybackCursor {
    pub fn new() -> Self {
        Self {
            playing: false,
            position: 0,
        }
    }

    pub fn play(&mut self) {
        self.playing = true;
    }

    pub fn pause(&mut self) {
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn step_forward(&mut self) {
        self.position = self.position.saturating_add(1);
    }

    pub fn step_back(&mut self) {
        self.position = self.position.saturating_sub(1);
    }

    /// Called on ingest; a playing cursor tracks the live edge.
    pub fn follow(&mut self, index: u64) {
        if self.playing && index > self.position {
            self.position = index;
        }
    }
}
