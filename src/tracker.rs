//! Beat-driven score pointer.
//!
//! An external metronome reports beat numbers; each beat is turned into
//! elapsed performance time and looked up in the expected-note timeline to
//! find the current note, its system and a horizontal position inside that
//! system's frame.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scoring::timeline::{clamp_tempo, Timeline};
use crate::scoring::types::{Frame, PositionState};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Beats per frame when the timeline has no notes to follow.
    pub fallback_beats_per_frame: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            fallback_beats_per_frame: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScorePositionTracker {
    config: TrackerConfig,
    timeline: Timeline,
    frames: Vec<Frame>,
    custom_frames: bool,
    seconds_per_beat: f64,
    /// Beat number and elapsed seconds the current tempo is measured from.
    anchor_beat: u64,
    anchor_secs: f64,
    last_beat: u64,
    state: PositionState,
    /// Highest system already reported as completed.
    completed_system: Option<usize>,
}

impl ScorePositionTracker {
    pub fn new(config: TrackerConfig, timeline: Timeline) -> Self {
        ScorePositionTracker {
            config,
            frames: timeline.system_frames(),
            custom_frames: false,
            seconds_per_beat: timeline.seconds_per_beat(),
            timeline,
            anchor_beat: 1,
            anchor_secs: 0.0,
            last_beat: 0,
            state: PositionState::default(),
            completed_system: None,
        }
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Elapsed performance time of the last accepted beat.
    pub fn elapsed_secs(&self) -> f64 {
        self.secs_at(self.last_beat.max(1))
    }

    fn secs_at(&self, beat: u64) -> f64 {
        self.anchor_secs + beat.saturating_sub(self.anchor_beat) as f64 * self.seconds_per_beat
    }

    /// Replaces the timeline (after a rebuild or a tempo rescale) without
    /// moving the pointer backwards.
    pub fn set_timeline(&mut self, timeline: Timeline) {
        if !self.custom_frames {
            self.frames = timeline.system_frames();
        }
        self.timeline = timeline;
    }

    /// Overrides the per-system frames, e.g. with the host's layout.
    pub fn set_frames(&mut self, frames: Vec<Frame>) {
        self.custom_frames = !frames.is_empty();
        self.frames = if self.custom_frames {
            frames
        } else {
            self.timeline.system_frames()
        };
    }

    /// Switches tempo from the last beat on, so elapsed time stays
    /// continuous.
    pub fn set_tempo(&mut self, tempo_bpm: f64) {
        let beat = self.last_beat.max(1);
        self.anchor_secs = self.secs_at(beat);
        self.anchor_beat = beat;
        self.seconds_per_beat = 60.0 / clamp_tempo(tempo_bpm);
        debug!(beat, tempo = tempo_bpm, "tracker re-anchored");
    }

    /// Advances to `beat`. Beats that are non-positive or not newer than the
    /// last one are ignored.
    pub fn on_beat(&mut self, beat: i64) -> Option<PositionState> {
        if beat <= 0 || beat as u64 <= self.last_beat {
            return None;
        }
        let beat = beat as u64;
        self.last_beat = beat;

        self.state = if self.timeline.is_empty() {
            self.free_running(beat)
        } else {
            self.follow_timeline(beat)
        };
        Some(self.state)
    }

    fn free_running(&self, beat: u64) -> PositionState {
        let per_frame = self.config.fallback_beats_per_frame.max(1) as u64;
        let step = beat - 1;
        PositionState {
            note_index: 0,
            system_index: (step / per_frame) as usize,
            position: (step % per_frame) as f64 / per_frame as f64 * 100.0,
            system_completed: step % per_frame == per_frame - 1,
        }
    }

    fn follow_timeline(&mut self, beat: u64) -> PositionState {
        let elapsed = self.secs_at(beat);
        let found = self.timeline.note_index_at(elapsed).unwrap_or(0);
        let note_index = found.max(self.state.note_index).min(self.timeline.notes.len() - 1);
        let note = &self.timeline.notes[note_index];
        let system_index = note.system_index;

        let position = match self.frames.get(system_index) {
            Some(frame) if frame.right > frame.left => {
                ((note.time_secs - frame.left) / (frame.right - frame.left) * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };

        // A system is done once its last note is reached, or once the pointer
        // has moved past it without a beat landing on that note.
        let passed = if self.timeline.last_note_of_system(system_index) == Some(note_index) {
            Some(system_index)
        } else {
            system_index.checked_sub(1)
        };
        let system_completed = match (passed, self.completed_system) {
            (Some(done), Some(reported)) => done > reported,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if system_completed {
            self.completed_system = passed;
            debug!(system = ?passed, beat, "system completed");
        }

        PositionState {
            note_index,
            system_index,
            position,
            system_completed,
        }
    }

    /// Resets the pointer to the start of the piece.
    pub fn stop(&mut self) -> PositionState {
        self.state = PositionState::default();
        self.last_beat = 0;
        self.anchor_beat = 1;
        self.anchor_secs = 0.0;
        self.seconds_per_beat = self.timeline.seconds_per_beat();
        self.completed_system = None;
        self.state
    }
}
