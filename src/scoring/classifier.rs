//! Pitch and timing classification of captured audio against expected notes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::Samples;
use crate::pitch::{midi_to_name, PitchDetector};
use crate::scoring::timeline::Timeline;
use crate::scoring::types::{
    Accuracy, ExpectedNote, Issue, NoteFeedback, NoteResult, RangeFeedback, TransposeInfo,
};
use crate::transposition::freq_to_written_midi;

// The estimator searches wider than the accepted range so that out-of-range
// input is recognised instead of folded onto a harmonic.
const SEARCH_MIN_HZ: f32 = 60.0;
const SEARCH_MAX_HZ: f32 = 2400.0;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Analysis window length in samples.
    pub window_size: usize,
    /// Shortest window worth analysing at the end of a recording.
    pub min_window: usize,
    pub min_hz: f64,
    pub max_hz: f64,
    /// Relative frequency error still counted as correct.
    pub correct_tolerance: f64,
    /// Relative frequency error still counted as slightly off.
    pub slight_tolerance: f64,
    pub timing_tolerance_ms: f64,
    pub silence_rms: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            window_size: 2048,
            min_window: 512,
            min_hz: 100.0,
            max_hz: 2000.0,
            correct_tolerance: 0.02,
            slight_tolerance: 0.05,
            timing_tolerance_ms: 100.0,
            silence_rms: 0.02,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PitchClassifier {
    config: ClassifierConfig,
    /// Notated concert frequencies of the piece, used to tell a wrong note
    /// from an out-of-tune one.
    palette: Vec<f64>,
    transpose: Option<TransposeInfo>,
}

fn missed() -> NoteResult {
    NoteResult {
        detected_hz: None,
        accuracy: Accuracy::Wrong,
        issues: BTreeSet::from([Issue::MissedEntry]),
    }
}

impl PitchClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        PitchClassifier {
            config,
            palette: Vec::new(),
            transpose: None,
        }
    }

    pub fn for_timeline(config: ClassifierConfig, timeline: &Timeline) -> Self {
        PitchClassifier {
            config,
            palette: timeline.pitch_palette(),
            transpose: timeline.transpose,
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classifies an already estimated frequency against the expected one.
    pub fn classify_frequency(&self, detected_hz: Option<f64>, expected_hz: f64) -> NoteResult {
        let cfg = &self.config;
        let Some(hz) = detected_hz.filter(|hz| hz.is_finite() && *hz >= cfg.min_hz && *hz <= cfg.max_hz) else {
            return missed();
        };

        let diff = (hz - expected_hz) / expected_hz;
        let flat = diff < 0.0;
        let mut issues = BTreeSet::new();

        let accuracy = if diff.abs() < cfg.correct_tolerance {
            Accuracy::Correct
        } else if diff.abs() < cfg.slight_tolerance {
            issues.insert(if flat { Issue::SlightlyFlat } else { Issue::SlightlySharp });
            Accuracy::SlightlyOff
        } else {
            let issue = if self.matches_other_pitch(hz, expected_hz) {
                Issue::WrongNote
            } else if flat {
                Issue::FlatNote
            } else {
                Issue::SharpNote
            };
            issues.insert(issue);
            Accuracy::Wrong
        };

        NoteResult {
            detected_hz: Some(hz),
            accuracy,
            issues,
        }
    }

    fn matches_other_pitch(&self, hz: f64, expected_hz: f64) -> bool {
        let relative = |a: f64, b: f64| ((a - b) / b).abs();
        let nearest = self
            .palette
            .iter()
            .copied()
            .min_by(|a, b| {
                relative(hz, *a)
                    .partial_cmp(&relative(hz, *b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        match nearest {
            Some(candidate) => {
                relative(hz, candidate) < self.config.correct_tolerance
                    && relative(candidate, expected_hz) >= self.config.correct_tolerance
            }
            None => false,
        }
    }

    /// Estimates the fundamental of `window` and classifies it. Estimator
    /// failures count as a missed entry.
    pub fn classify_note(&self, window: &[f32], sample_rate: u32, expected_hz: f64) -> NoteResult {
        let mut detector = PitchDetector::new(sample_rate as f32, SEARCH_MIN_HZ, SEARCH_MAX_HZ, window.len())
            .with_silence_rms(self.config.silence_rms);
        match detector.try_detect(window) {
            Ok(result) => self.classify_frequency(result.frequency().map(f64::from), expected_hz),
            Err(e) => {
                debug!(error = %e, "pitch estimator failed");
                missed()
            }
        }
    }

    /// Classifies every expected note that falls inside `samples`.
    pub fn classify_range(&self, samples: &Samples, expected: &[ExpectedNote]) -> RangeFeedback {
        let mut feedback = RangeFeedback::default();
        let sample_rate = samples.sample_rate as f64;
        let len = samples.samples.len();
        let window = self.config.window_size.min(len);

        let (mut early, mut late) = (0u32, 0u32);

        for note in expected {
            let wanted = ((note.time_secs - samples.offset_secs) * sample_rate).round().max(0.0) as usize;

            let (result, timing_offset_ms) = if window < self.config.min_window || wanted >= len {
                (missed(), 0.0)
            } else {
                // Shift back so a full window fits when the capture ends early
                let start = wanted.min(len - window);
                let actual_secs = samples.offset_secs + start as f64 / sample_rate;
                let offset_ms = (actual_secs - note.time_secs) * 1000.0;
                let slice = &samples.samples[start..start + window];
                (self.classify_note(slice, samples.sample_rate, note.frequency_hz), offset_ms)
            };

            let mut issues = result.issues;
            if !issues.contains(&Issue::MissedEntry) && timing_offset_ms.abs() > self.config.timing_tolerance_ms {
                if timing_offset_ms > 0.0 {
                    issues.insert(Issue::Late);
                    late += 1;
                } else {
                    issues.insert(Issue::Early);
                    early += 1;
                }
            }

            feedback
                .measures
                .entry(note.bar)
                .and_modify(|worst| *worst = (*worst).max(result.accuracy))
                .or_insert(result.accuracy);

            let detected_pitch = result
                .detected_hz
                .map(|hz| midi_to_name(freq_to_written_midi(hz, self.transpose.as_ref()).round() as i32));

            feedback.notes.push(NoteFeedback {
                bar: note.bar,
                note_index: note.index_in_bar,
                expected_pitch: note.pitch.clone(),
                expected_hz: note.frequency_hz,
                detected_pitch,
                detected_hz: result.detected_hz,
                accuracy: result.accuracy,
                issues,
                timing_offset_ms,
            });
        }

        if early > late {
            feedback.session_issues.insert(Issue::Rushing);
        } else if late > early {
            feedback.session_issues.insert(Issue::Dragging);
        }

        debug!(
            notes = feedback.notes.len(),
            measures = feedback.measures.len(),
            "classified audio range"
        );
        feedback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    const SR: u32 = 44100;

    fn sine(freq: f32, secs: f32) -> Vec<f32> {
        let n = (SR as f32 * secs) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / SR as f32).sin())
            .collect()
    }

    fn expected(bar: u32, index: usize, pitch: &str, hz: f64, time: f64) -> ExpectedNote {
        ExpectedNote {
            bar,
            index_in_bar: index,
            pitch: pitch.to_string(),
            midi: 60,
            frequency_hz: hz,
            time_secs: time,
            duration_secs: 0.5,
            system_index: 0,
        }
    }

    fn samples(data: Vec<f32>, offset_secs: f64) -> Samples {
        Samples {
            samples: data,
            sample_rate: SR,
            offset_secs,
        }
    }

    #[test]
    fn test_exact_frequency_is_correct() {
        let classifier = PitchClassifier::default();
        let result = classifier.classify_frequency(Some(261.63), 261.63);
        assert_eq!(result.accuracy, Accuracy::Correct);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn test_three_percent_sharp_is_slightly_off() {
        let classifier = PitchClassifier::default();
        let result = classifier.classify_frequency(Some(269.5), 261.63);
        assert_eq!(result.accuracy, Accuracy::SlightlyOff);
        assert!(result.issues.contains(&Issue::SlightlySharp));

        let result = classifier.classify_frequency(Some(253.8), 261.63);
        assert!(result.issues.contains(&Issue::SlightlyFlat));
    }

    #[test]
    fn test_fifteen_percent_sharp_is_wrong() {
        let classifier = PitchClassifier::default();
        let result = classifier.classify_frequency(Some(300.0), 261.63);
        assert_eq!(result.accuracy, Accuracy::Wrong);
        assert!(result.issues.contains(&Issue::SharpNote));

        let result = classifier.classify_frequency(Some(220.0), 261.63);
        assert!(result.issues.contains(&Issue::FlatNote));
    }

    #[test]
    fn test_other_notated_pitch_is_wrong_note() {
        let timeline = Timeline::build(None, 100.0, None);
        let classifier = PitchClassifier::for_timeline(ClassifierConfig::default(), &timeline);
        // Played G4 where C4 was expected; G4 is part of the tune
        let result = classifier.classify_frequency(Some(392.0), 261.63);
        assert_eq!(result.accuracy, Accuracy::Wrong);
        assert_eq!(result.issues, BTreeSet::from([Issue::WrongNote]));
    }

    #[test]
    fn test_out_of_range_is_missed() {
        let classifier = PitchClassifier::default();
        for hz in [None, Some(50.0), Some(2500.0), Some(f64::NAN)] {
            let result = classifier.classify_frequency(hz, 261.63);
            assert_eq!(result.accuracy, Accuracy::Wrong);
            assert_eq!(result.issues, BTreeSet::from([Issue::MissedEntry]));
        }
    }

    #[test]
    fn test_classify_note_on_audio() {
        let classifier = PitchClassifier::default();
        let window = &sine(440.0, 0.1)[..2048];
        let result = classifier.classify_note(window, SR, 440.0);
        assert_eq!(result.accuracy, Accuracy::Correct);

        let silence = vec![0.0; 2048];
        let result = classifier.classify_note(&silence, SR, 440.0);
        assert_eq!(result.issues, BTreeSet::from([Issue::MissedEntry]));

        let result = classifier.classify_note(&[], SR, 440.0);
        assert_eq!(result.accuracy, Accuracy::Wrong);
    }

    #[test]
    fn test_classify_range_per_note() {
        // One second of A4 then one second of silence
        let mut data = sine(440.0, 1.0);
        data.extend(vec![0.0; SR as usize]);
        let notes = vec![
            expected(1, 0, "A4", 440.0, 0.0),
            expected(1, 1, "A4", 440.0, 0.5),
            expected(2, 0, "C5", 523.25, 1.2),
        ];
        let classifier = PitchClassifier::default();
        let feedback = classifier.classify_range(&samples(data, 0.0), &notes);

        assert_eq!(feedback.notes.len(), 3);
        assert_eq!(feedback.notes[0].accuracy, Accuracy::Correct);
        assert_eq!(feedback.notes[0].detected_pitch.as_deref(), Some("A4"));
        assert!(feedback.notes[0].timing_offset_ms.abs() < 1.0);
        assert!(feedback.notes[1].issues.is_empty());
        assert_eq!(feedback.notes[2].issues, BTreeSet::from([Issue::MissedEntry]));
        assert_eq!(feedback.measures[&1], Accuracy::Correct);
        assert_eq!(feedback.measures[&2], Accuracy::Wrong);
        assert!(feedback.session_issues.is_empty());
    }

    #[test]
    fn test_classify_range_with_offset_samples() {
        // Range extracted from 2.0s onwards
        let data = sine(392.0, 0.5);
        let notes = vec![expected(3, 0, "G4", 392.0, 2.1)];
        let feedback = PitchClassifier::default().classify_range(&samples(data, 2.0), &notes);
        assert_eq!(feedback.notes[0].accuracy, Accuracy::Correct);
        assert!(feedback.notes[0].timing_offset_ms.abs() < 1.0);
    }

    #[test]
    fn test_window_shifted_back_is_early() {
        // Capture ends 10ms after the note starts, so a long window is pulled back
        let data = sine(440.0, 0.3);
        let notes = vec![expected(1, 0, "A4", 440.0, 0.29)];
        let classifier = PitchClassifier::new(ClassifierConfig {
            window_size: 8192,
            ..ClassifierConfig::default()
        });
        let feedback = classifier.classify_range(&samples(data, 0.0), &notes);
        let note = &feedback.notes[0];
        assert!(note.timing_offset_ms < -100.0, "offset {}", note.timing_offset_ms);
        assert!(note.issues.contains(&Issue::Early));
        assert!(feedback.session_issues.contains(&Issue::Rushing));
    }

    #[test]
    fn test_note_beyond_capture_is_missed() {
        let data = sine(440.0, 0.5);
        let notes = vec![expected(4, 0, "A4", 440.0, 3.0)];
        let feedback = PitchClassifier::default().classify_range(&samples(data, 0.0), &notes);
        assert_eq!(feedback.notes[0].issues, BTreeSet::from([Issue::MissedEntry]));
        assert_eq!(feedback.notes[0].timing_offset_ms, 0.0);
    }

    #[test]
    fn test_worst_accuracy_per_measure() {
        let mut data = sine(440.0, 0.5);
        data.extend(sine(452.0, 0.5)); // ~2.7% sharp
        let notes = vec![
            expected(1, 0, "A4", 440.0, 0.0),
            expected(1, 1, "A4", 440.0, 0.6),
        ];
        let feedback = PitchClassifier::default().classify_range(&samples(data, 0.0), &notes);
        assert_eq!(feedback.notes[1].accuracy, Accuracy::SlightlyOff);
        assert_eq!(feedback.measures[&1], Accuracy::SlightlyOff);
    }
}
