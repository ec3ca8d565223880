//! Built-in score used whenever no piece could be parsed, so the analysis
//! pipeline always has notes to follow.

use crate::parser::musicxml::{group_systems, midi_from_pitch, pitch_name};
use crate::scoring::types::{KeySignature, Measure, Note, Score, TimeSignature};

pub const FALLBACK_TEMPO: f64 = 100.0;
const MEASURES_PER_SYSTEM: usize = 2;
const BEATS_PER_MEASURE: f64 = 4.0;

/// "Twinkle, Twinkle" in C: (step, octave, beats) per measure.
const TUNE: [&[(char, i32, f64)]; 4] = [
    &[('C', 4, 1.0), ('C', 4, 1.0), ('G', 4, 1.0), ('G', 4, 1.0)],
    &[('A', 4, 1.0), ('A', 4, 1.0), ('G', 4, 2.0)],
    &[('F', 4, 1.0), ('F', 4, 1.0), ('E', 4, 1.0), ('E', 4, 1.0)],
    &[('D', 4, 1.0), ('D', 4, 1.0), ('C', 4, 2.0)],
];

fn make_note(step: char, octave: i32, beat_offset: f64, duration_beats: f64, measure: u32, index: usize) -> Note {
    Note {
        id: format!("m{}-{}", measure, index),
        pitch: pitch_name(step, 0, octave),
        midi: midi_from_pitch(step, 0, octave),
        duration_beats,
        beat_offset,
        measure_number: measure,
        system_index: (measure as usize - 1) / MEASURES_PER_SYSTEM,
        staff: 1,
        voice: 1,
        is_chord: false,
        stem: None,
        accidental: None,
        tie: None,
        slur: None,
    }
}

pub fn fallback_score() -> Score {
    let mut measures = Vec::new();
    let mut beat = 0.0;

    for (i, bar) in TUNE.iter().enumerate() {
        let number = i as u32 + 1;
        let start_beat = beat;
        let notes: Vec<Note> = bar
            .iter()
            .enumerate()
            .map(|(index, &(step, octave, beats))| {
                let note = make_note(step, octave, beat, beats, number, index);
                beat += beats;
                note
            })
            .collect();
        measures.push(Measure {
            number,
            system_index: i / MEASURES_PER_SYSTEM,
            start_beat,
            duration_beats: BEATS_PER_MEASURE,
            time_signature: TimeSignature::default(),
            notes,
        });
    }

    let notes = measures.iter().flat_map(|m| m.notes.iter().cloned()).collect();
    let systems = group_systems(&measures);

    Score {
        title: Some("Twinkle, Twinkle, Little Star".to_string()),
        composer: Some("Traditional".to_string()),
        time_signature: TimeSignature::default(),
        key: KeySignature::default(),
        tempo: FALLBACK_TEMPO,
        divisions: 1.0,
        measures,
        systems,
        notes,
        total_beats: beat,
        transpose: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_shape() {
        let score = fallback_score();
        assert_eq!(score.measures.len(), 4);
        assert_eq!(score.notes.len(), 14);
        assert_eq!(score.total_beats, 16.0);
        assert_eq!(score.systems.len(), 2);
        assert_eq!(score.systems[1].measure_numbers, vec![3, 4]);
        assert_eq!(score.notes[0].pitch, "C4");
        assert_eq!(score.notes[2].midi, 67);
    }

    #[test]
    fn test_fallback_is_deterministic() {
        assert_eq!(fallback_score(), fallback_score());
    }

    #[test]
    fn test_measures_are_contiguous() {
        let score = fallback_score();
        for pair in score.measures.windows(2) {
            assert_eq!(pair[1].start_beat, pair[0].end_beat());
        }
        for measure in &score.measures {
            let filled: f64 = measure.notes.iter().map(|n| n.duration_beats).sum();
            assert_eq!(filled, measure.duration_beats);
        }
    }
}
