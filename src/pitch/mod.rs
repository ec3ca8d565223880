pub mod yin;

pub use yin::{PitchDetector, PitchResult};

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

pub fn midi_to_hz(midi: f64) -> f64 {
    440.0 * 2f64.powf((midi - 69.0) / 12.0)
}

pub fn hz_to_midi(hz: f64) -> f64 {
    69.0 + 12.0 * (hz / 440.0).log2()
}

pub fn midi_to_name(midi: i32) -> String {
    let name = NOTE_NAMES[(midi.rem_euclid(12)) as usize];
    let octave = midi.div_euclid(12) - 1;
    format!("{}{}", name, octave)
}
