//! Expected-note timeline: where every notated note should sound, in seconds
//! from the start of the performance, for one chosen tempo.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::scoring::fallback::fallback_score;
use crate::scoring::types::{ExpectedNote, Frame, MeasureSpan, Score, TransposeInfo};
use crate::transposition::concert_frequency;

pub const MIN_TEMPO: f64 = 20.0;
pub const MAX_TEMPO: f64 = 400.0;
const DEFAULT_TEMPO: f64 = 120.0;

pub fn clamp_tempo(tempo_bpm: f64) -> f64 {
    if tempo_bpm.is_finite() {
        tempo_bpm.clamp(MIN_TEMPO, MAX_TEMPO)
    } else {
        DEFAULT_TEMPO
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Timeline {
    /// Tempo in force for material after the last tempo change.
    pub tempo: f64,
    pub notes: Vec<ExpectedNote>,
    pub measures: Vec<MeasureSpan>,
    pub transpose: Option<TransposeInfo>,
    pub is_fallback: bool,
}

impl Timeline {
    /// Builds the timeline for `score` at `tempo_bpm`. Without a usable score
    /// the built-in fallback tune is used so the timeline is never empty.
    pub fn build(score: Option<&Score>, tempo_bpm: f64, max_measures: Option<usize>) -> Self {
        match score {
            Some(score) if score.notes.is_empty() => {
                warn!("score has no pitched notes, using fallback timeline");
                Self::fallback(tempo_bpm, max_measures)
            }
            Some(score) => Self::from_score(score, tempo_bpm, max_measures, false),
            None => Self::fallback(tempo_bpm, max_measures),
        }
    }

    pub fn fallback(tempo_bpm: f64, max_measures: Option<usize>) -> Self {
        Self::from_score(&fallback_score(), tempo_bpm, max_measures, true)
    }

    fn from_score(score: &Score, tempo_bpm: f64, max_measures: Option<usize>, is_fallback: bool) -> Self {
        let tempo = clamp_tempo(tempo_bpm);
        let seconds_per_beat = 60.0 / tempo;
        let transpose = score.transpose;

        let mut notes = Vec::new();
        let mut measures = Vec::new();

        for measure in score.measures.iter().take(max_measures.unwrap_or(usize::MAX)) {
            measures.push(MeasureSpan {
                number: measure.number,
                system_index: measure.system_index,
                start_secs: measure.start_beat * seconds_per_beat,
                end_secs: measure.end_beat() * seconds_per_beat,
            });

            let mut sorted: Vec<_> = measure.notes.iter().collect();
            sorted.sort_by(|a, b| {
                a.beat_offset
                    .partial_cmp(&b.beat_offset)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            for (index_in_bar, note) in sorted.into_iter().enumerate() {
                notes.push(ExpectedNote {
                    bar: measure.number,
                    index_in_bar,
                    pitch: note.pitch.clone(),
                    midi: note.midi,
                    frequency_hz: concert_frequency(note.midi, transpose.as_ref()),
                    time_secs: note.beat_offset * seconds_per_beat,
                    duration_secs: note.duration_beats * seconds_per_beat,
                    system_index: measure.system_index,
                });
            }
        }

        debug!(
            tempo,
            notes = notes.len(),
            measures = measures.len(),
            is_fallback,
            "built expected-note timeline"
        );

        Timeline {
            tempo,
            notes,
            measures,
            transpose,
            is_fallback,
        }
    }

    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.tempo
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.measures.last().map_or(0.0, |m| m.end_secs)
    }

    /// Returns a new timeline for a tempo change at `at_secs`. Anything that
    /// starts at or before the change keeps its time; later material is
    /// stretched by `old_tempo / new_tempo` relative to the change instant. A
    /// note or measure that spans the change keeps its elapsed part and only
    /// the remainder is rescaled.
    pub fn rescaled(&self, at_secs: f64, old_tempo: f64, new_tempo: f64) -> Self {
        let old_tempo = clamp_tempo(old_tempo);
        let new_tempo = clamp_tempo(new_tempo);
        let ratio = old_tempo / new_tempo;
        let map = |t: f64| {
            if t <= at_secs {
                t
            } else {
                at_secs + (t - at_secs) * ratio
            }
        };

        let notes = self
            .notes
            .iter()
            .map(|n| {
                let start = map(n.time_secs);
                let end = map(n.end_secs());
                ExpectedNote {
                    time_secs: start,
                    duration_secs: end - start,
                    ..n.clone()
                }
            })
            .collect();
        let measures = self
            .measures
            .iter()
            .map(|m| MeasureSpan {
                start_secs: map(m.start_secs),
                end_secs: map(m.end_secs),
                ..*m
            })
            .collect();

        debug!(at_secs, old_tempo, new_tempo, "rescaled timeline after tempo change");

        Timeline {
            tempo: new_tempo,
            notes,
            measures,
            transpose: self.transpose,
            is_fallback: self.is_fallback,
        }
    }

    pub fn measure_span(&self, number: u32) -> Option<&MeasureSpan> {
        self.measures.iter().find(|m| m.number == number)
    }

    pub fn notes_in_measure(&self, number: u32) -> Vec<ExpectedNote> {
        self.notes.iter().filter(|n| n.bar == number).cloned().collect()
    }

    /// Index of the note whose `[time, next_time)` interval contains `secs`.
    /// Chord notes share a start time, so the last note of a chord is the one
    /// that owns the interval. `None` before the first note.
    pub fn note_index_at(&self, secs: f64) -> Option<usize> {
        let after = self.notes.partition_point(|n| n.time_secs <= secs);
        after.checked_sub(1)
    }

    pub fn note_at(&self, secs: f64) -> Option<&ExpectedNote> {
        self.note_index_at(secs).map(|i| &self.notes[i])
    }

    pub fn system_count(&self) -> usize {
        self.measures.last().map_or(0, |m| m.system_index + 1)
    }

    /// Time bounds of each system, indexed by system index.
    pub fn system_frames(&self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = Vec::with_capacity(self.system_count());
        for span in &self.measures {
            while frames.len() <= span.system_index {
                frames.push(Frame {
                    left: span.start_secs,
                    right: span.end_secs,
                });
            }
            let frame = &mut frames[span.system_index];
            frame.left = frame.left.min(span.start_secs);
            frame.right = frame.right.max(span.end_secs);
        }
        frames
    }

    /// Index of the last note belonging to `system_index`.
    pub fn last_note_of_system(&self, system_index: usize) -> Option<usize> {
        self.notes.iter().rposition(|n| n.system_index == system_index)
    }

    /// Distinct notated concert frequencies, ascending.
    pub fn pitch_palette(&self) -> Vec<f64> {
        let mut midis: Vec<i32> = self.notes.iter().map(|n| n.midi).collect();
        midis.sort_unstable();
        midis.dedup();
        midis
            .into_iter()
            .map(|m| concert_frequency(m, self.transpose.as_ref()))
            .collect()
    }
}
