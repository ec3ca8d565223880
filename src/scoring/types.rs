use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

// Score model

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSignature {
    pub beats: u8,
    pub beat_type: u8,
}

impl TimeSignature {
    /// Length of one measure in quarter-note beats.
    pub fn measure_beats(&self) -> f64 {
        if self.beat_type == 0 {
            return self.beats as f64;
        }
        self.beats as f64 * 4.0 / self.beat_type as f64
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        TimeSignature {
            beats: 4,
            beat_type: 4,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeySignature {
    pub fifths: i32,
    pub mode: String,
}

impl Default for KeySignature {
    fn default() -> Self {
        KeySignature {
            fifths: 0,
            mode: "major".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Connection {
    Start,
    Stop,
    Continue,
}

impl Connection {
    pub fn from_attr(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Connection::Start),
            "stop" => Some(Connection::Stop),
            "continue" => Some(Connection::Continue),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Note {
    pub id: String,
    /// Scientific pitch notation as written, e.g. "C4", "F#5", "Bb3".
    pub pitch: String,
    pub midi: i32,
    pub duration_beats: f64,
    pub beat_offset: f64,
    pub measure_number: u32,
    pub system_index: usize,
    pub staff: u8,
    pub voice: u8,
    pub is_chord: bool,
    pub stem: Option<String>,
    pub accidental: Option<String>,
    pub tie: Option<Connection>,
    pub slur: Option<Connection>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Measure {
    pub number: u32,
    pub system_index: usize,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub time_signature: TimeSignature,
    pub notes: Vec<Note>,
}

impl Measure {
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct System {
    pub index: usize,
    pub measure_numbers: Vec<u32>,
    pub start_beat: f64,
    pub end_beat: f64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransposeInfo {
    pub chromatic: i32,
    pub diatonic: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Score {
    pub title: Option<String>,
    pub composer: Option<String>,
    pub time_signature: TimeSignature,
    pub key: KeySignature,
    pub tempo: f64,
    pub divisions: f64,
    pub measures: Vec<Measure>,
    pub systems: Vec<System>,
    pub notes: Vec<Note>,
    pub total_beats: f64,
    pub transpose: Option<TransposeInfo>,
}

impl Score {
    pub fn measure(&self, number: u32) -> Option<&Measure> {
        self.measures.iter().find(|m| m.number == number)
    }
}

// Timeline

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExpectedNote {
    pub bar: u32,
    pub index_in_bar: usize,
    pub pitch: String,
    pub midi: i32,
    /// Concert pitch the microphone should hear.
    pub frequency_hz: f64,
    pub time_secs: f64,
    pub duration_secs: f64,
    pub system_index: usize,
}

impl ExpectedNote {
    pub fn end_secs(&self) -> f64 {
        self.time_secs + self.duration_secs
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct MeasureSpan {
    pub number: u32,
    pub system_index: usize,
    pub start_secs: f64,
    pub end_secs: f64,
}

// Feedback

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    Correct,
    SlightlyOff,
    Wrong,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Issue {
    #[serde(rename = "Slightly flat")]
    SlightlyFlat,
    #[serde(rename = "Slightly sharp")]
    SlightlySharp,
    #[serde(rename = "Flat note")]
    FlatNote,
    #[serde(rename = "Sharp note")]
    SharpNote,
    #[serde(rename = "Wrong note")]
    WrongNote,
    #[serde(rename = "Missed entry")]
    MissedEntry,
    #[serde(rename = "Late")]
    Late,
    #[serde(rename = "Early")]
    Early,
    #[serde(rename = "Rushing")]
    Rushing,
    #[serde(rename = "Dragging")]
    Dragging,
}

impl Issue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Issue::SlightlyFlat => "Slightly flat",
            Issue::SlightlySharp => "Slightly sharp",
            Issue::FlatNote => "Flat note",
            Issue::SharpNote => "Sharp note",
            Issue::WrongNote => "Wrong note",
            Issue::MissedEntry => "Missed entry",
            Issue::Late => "Late",
            Issue::Early => "Early",
            Issue::Rushing => "Rushing",
            Issue::Dragging => "Dragging",
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pitch verdict for a single analysis window.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NoteResult {
    pub detected_hz: Option<f64>,
    pub accuracy: Accuracy,
    pub issues: BTreeSet<Issue>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NoteFeedback {
    pub bar: u32,
    pub note_index: usize,
    pub expected_pitch: String,
    pub expected_hz: f64,
    pub detected_pitch: Option<String>,
    pub detected_hz: Option<f64>,
    pub accuracy: Accuracy,
    pub issues: BTreeSet<Issue>,
    pub timing_offset_ms: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RangeFeedback {
    pub notes: Vec<NoteFeedback>,
    /// Worst accuracy seen in each measure.
    pub measures: BTreeMap<u32, Accuracy>,
    pub session_issues: BTreeSet<Issue>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PitchTendency {
    Sharp,
    Flat,
    Accurate,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimingTendency {
    Rushing,
    Dragging,
    Steady,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PerformanceSummary {
    pub total_notes: u32,
    pub notes_correct: u32,
    pub notes_slightly_off: u32,
    pub notes_wrong: u32,
    pub notes_missed: u32,
    pub percent_correct: f64,
    pub avg_pitch_error_cents: f64,
    pub avg_timing_offset_ms: f64,
    pub pitch_tendency: PitchTendency,
    pub timing_tendency: TimingTendency,
    pub session_issues: BTreeSet<Issue>,
    pub feedback: Vec<String>,
    pub overall_score: f64, // 0-100
}

// Position

/// Horizontal bounds of one system on the caller's layout, in the same unit
/// as note times (seconds).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Frame {
    pub left: f64,
    pub right: f64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct PositionState {
    pub note_index: usize,
    pub system_index: usize,
    /// Horizontal position within the current system frame, 0-100.
    pub position: f64,
    pub system_completed: bool,
}
