//! Written vs. sounding pitch for transposing instruments.
//!
//! Scores are notated in written pitch; the microphone hears concert pitch.
//! `chromatic` is the MusicXML `<transpose>` offset in semitones from written
//! to sounding, e.g. -2 for a B-flat instrument.

use crate::pitch::{hz_to_midi, midi_to_hz};
use crate::scoring::types::TransposeInfo;

pub fn written_to_concert(midi_written: i32, transpose: &TransposeInfo) -> i32 {
    midi_written + transpose.chromatic
}

/// Frequency the microphone should hear for a written note.
pub fn concert_frequency(midi_written: i32, transpose: Option<&TransposeInfo>) -> f64 {
    let sounding = transpose.map_or(midi_written, |t| written_to_concert(midi_written, t));
    midi_to_hz(sounding as f64)
}

/// Fractional written-pitch MIDI value of a detected (sounding) frequency.
pub fn freq_to_written_midi(freq_hz: f64, transpose: Option<&TransposeInfo>) -> f64 {
    hz_to_midi(freq_hz) - transpose.map_or(0, |t| t.chromatic) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const B_FLAT: TransposeInfo = TransposeInfo {
        chromatic: -2,
        diatonic: -1,
    };

    #[test]
    fn test_written_c_sounds_b_flat() {
        assert_eq!(written_to_concert(60, &B_FLAT), 58);
        assert!((concert_frequency(60, Some(&B_FLAT)) - 233.08).abs() < 0.01);
    }

    #[test]
    fn test_untransposed_frequency() {
        assert!((concert_frequency(69, None) - 440.0).abs() < 1e-9);
    }

    #[test]
    fn test_detected_frequency_to_written() {
        // Sounding A4 is written B4
        assert!((freq_to_written_midi(440.0, Some(&B_FLAT)) - 71.0).abs() < 1e-9);
        assert!((freq_to_written_midi(440.0, None) - 69.0).abs() < 1e-9);
    }
}
