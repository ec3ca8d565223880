use std::collections::BTreeSet;

use crate::scoring::types::{
    Accuracy, Issue, NoteFeedback, PerformanceSummary, PitchTendency, RangeFeedback, TimingTendency,
};

fn cents_between(detected_hz: f64, expected_hz: f64) -> f64 {
    1200.0 * (detected_hz / expected_hz).log2()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn is_missed(note: &NoteFeedback) -> bool {
    note.issues.contains(&Issue::MissedEntry)
}

impl PerformanceSummary {
    /// Rolls per-note feedback of a whole performance into counts,
    /// tendencies and a 0-100 score.
    pub fn from_feedback(feedback: &RangeFeedback) -> Self {
        let notes = &feedback.notes;
        let total_notes = notes.len() as u32;

        if total_notes == 0 {
            return PerformanceSummary {
                total_notes: 0,
                notes_correct: 0,
                notes_slightly_off: 0,
                notes_wrong: 0,
                notes_missed: 0,
                percent_correct: 0.0,
                avg_pitch_error_cents: 0.0,
                avg_timing_offset_ms: 0.0,
                pitch_tendency: PitchTendency::Accurate,
                timing_tendency: TimingTendency::Steady,
                session_issues: BTreeSet::new(),
                feedback: vec!["No notes were analyzed.".to_string()],
                overall_score: 0.0,
            };
        }

        let count = |accuracy: Accuracy| notes.iter().filter(|n| n.accuracy == accuracy).count() as u32;
        let notes_missed = notes.iter().filter(|n| is_missed(n)).count() as u32;
        let notes_correct = count(Accuracy::Correct);
        let notes_slightly_off = count(Accuracy::SlightlyOff);
        let notes_wrong = count(Accuracy::Wrong) - notes_missed;

        // A different note says nothing about intonation
        let pitch_errors: Vec<f64> = notes
            .iter()
            .filter(|n| !n.issues.contains(&Issue::WrongNote))
            .filter_map(|n| n.detected_hz.map(|hz| cents_between(hz, n.expected_hz)))
            .collect();
        let timing_offsets: Vec<f64> = notes
            .iter()
            .filter(|n| !is_missed(n))
            .map(|n| n.timing_offset_ms)
            .collect();

        let avg_pitch_error_cents = mean(&pitch_errors);
        let avg_timing_offset_ms = mean(&timing_offsets);
        let abs_pitch_error = mean(&pitch_errors.iter().map(|e| e.abs()).collect::<Vec<_>>());

        let pitch_tendency = if avg_pitch_error_cents > 10.0 {
            PitchTendency::Sharp
        } else if avg_pitch_error_cents < -10.0 {
            PitchTendency::Flat
        } else {
            PitchTendency::Accurate
        };

        let early = notes.iter().filter(|n| n.issues.contains(&Issue::Early)).count();
        let late = notes.iter().filter(|n| n.issues.contains(&Issue::Late)).count();
        let timing_tendency = if early > late {
            TimingTendency::Rushing
        } else if late > early {
            TimingTendency::Dragging
        } else {
            TimingTendency::Steady
        };

        let mut session_issues = feedback.session_issues.clone();
        match timing_tendency {
            TimingTendency::Rushing => {
                session_issues.insert(Issue::Rushing);
            }
            TimingTendency::Dragging => {
                session_issues.insert(Issue::Dragging);
            }
            TimingTendency::Steady => {}
        }

        let percent_correct = notes_correct as f64 / total_notes as f64 * 100.0;

        let mut messages: Vec<String> = Vec::new();
        if percent_correct >= 90.0 {
            messages.push(format!("Excellent! You nailed {:.0}% of the notes.", percent_correct));
        } else if percent_correct >= 70.0 {
            messages.push(format!("Good job! You got {:.0}% of the notes right.", percent_correct));
        } else if percent_correct >= 50.0 {
            messages.push(format!(
                "Keep practicing! You hit {:.0}% of the notes correctly.",
                percent_correct
            ));
        } else {
            messages.push(format!(
                "This one's tough! You got {:.0}% correct. Try slowing down the tempo.",
                percent_correct
            ));
        }

        if notes_missed > 0 {
            messages.push(format!(
                "You missed {} note{}. Make sure to play through the whole piece.",
                notes_missed,
                if notes_missed == 1 { "" } else { "s" }
            ));
        }

        if abs_pitch_error > 30.0 {
            match pitch_tendency {
                PitchTendency::Sharp => messages.push(format!(
                    "Your pitch is consistently {:.0} cents sharp. Listen for the reference and bring it down.",
                    avg_pitch_error_cents
                )),
                PitchTendency::Flat => messages.push(format!(
                    "Your pitch is consistently {:.0} cents flat. Listen for the reference and lift it up.",
                    avg_pitch_error_cents.abs()
                )),
                PitchTendency::Accurate => {}
            }
        }

        match timing_tendency {
            TimingTendency::Dragging => messages.push(
                "You tend to come in late. Try anticipating the beat.".to_string(),
            ),
            TimingTendency::Rushing => messages.push(
                "You tend to rush ahead. Try listening to the beat and holding back slightly.".to_string(),
            ),
            TimingTendency::Steady => {}
        }

        let weak_bars: Vec<String> = feedback
            .measures
            .iter()
            .filter(|(_, accuracy)| **accuracy == Accuracy::Wrong)
            .map(|(bar, _)| bar.to_string())
            .collect();
        if !weak_bars.is_empty() && weak_bars.len() < feedback.measures.len() {
            messages.push(format!(
                "Bar{} {} need{} the most work.",
                if weak_bars.len() == 1 { "" } else { "s" },
                weak_bars.join(", "),
                if weak_bars.len() == 1 { "s" } else { "" }
            ));
        }

        // Overall score: weighted combination of pitch accuracy and note hit rate
        let hit_rate = (total_notes - notes_missed) as f64 / total_notes as f64;
        let correct_rate = notes_correct as f64 / total_notes as f64;
        let pitch_score = if pitch_errors.is_empty() {
            0.0
        } else {
            (1.0 - (abs_pitch_error / 100.0).min(1.0)) * 100.0
        };
        let overall_score = (correct_rate * 60.0 + hit_rate * 20.0 + pitch_score * 0.2).min(100.0);

        PerformanceSummary {
            total_notes,
            notes_correct,
            notes_slightly_off,
            notes_wrong,
            notes_missed,
            percent_correct,
            avg_pitch_error_cents,
            avg_timing_offset_ms,
            pitch_tendency,
            timing_tendency,
            session_issues,
            feedback: messages,
            overall_score,
        }
    }
}
