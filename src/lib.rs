use wasm_bindgen::prelude::*;

pub mod capture;
pub mod config;
pub mod error;
pub mod feedback;
pub mod parser;
pub mod pitch;
pub mod scoring;
pub mod session;
pub mod tracker;
pub mod transposition;

pub use capture::{AudioCaptureSession, CaptureConfig, CaptureDevice, CaptureReader, Samples};
pub use config::EngineConfig;
pub use error::{
    AnalysisError, CaptureError, ClassificationError, ConfigError, ExtractError, ParseError, SessionError,
};
pub use feedback::{MeasureFeedbackScheduler, MeasureFeedbackState, SchedulerConfig};
pub use scoring::classifier::{ClassifierConfig, PitchClassifier};
pub use scoring::timeline::Timeline;
pub use scoring::types::{
    Accuracy, ExpectedNote, Issue, NoteFeedback, PerformanceSummary, PositionState, RangeFeedback, Score,
};
pub use session::{PerformanceReport, PerformanceSession};
pub use tracker::{ScorePositionTracker, TrackerConfig};

use std::cell::RefCell;

thread_local! {
    static DETECTOR: RefCell<Option<pitch::PitchDetector>> = RefCell::new(None);
}

fn to_js<T: serde::Serialize>(value: &T) -> Result<JsValue, JsValue> {
    serde_wasm_bindgen::to_value(value).map_err(|e| JsValue::from_str(&e.to_string()))
}

fn from_js<T: serde::de::DeserializeOwned>(value: JsValue) -> Result<T, JsValue> {
    serde_wasm_bindgen::from_value(value).map_err(|e| JsValue::from_str(&e.to_string()))
}

fn is_absent(value: &JsValue) -> bool {
    value.is_null() || value.is_undefined()
}

#[wasm_bindgen]
pub fn parse_musicxml(xml: &str) -> Result<JsValue, JsValue> {
    let score = parser::musicxml::parse_musicxml(xml).map_err(|e| JsValue::from_str(&e.to_string()))?;
    to_js(&score)
}

/// Expected-note timeline for a parsed score at `tempo`. A null score
/// gives the built-in tune.
#[wasm_bindgen]
pub fn build_timeline(score_js: JsValue, tempo: f64, max_measures: Option<usize>) -> Result<JsValue, JsValue> {
    let score: Option<Score> = if is_absent(&score_js) {
        None
    } else {
        Some(from_js(score_js)?)
    };
    to_js(&Timeline::build(score.as_ref(), tempo, max_measures))
}

/// Detector over the classifier's default frequency range and silence gate.
fn live_detector(sample_rate: f32) -> pitch::PitchDetector {
    let config = ClassifierConfig::default();
    pitch::PitchDetector::new(sample_rate, config.min_hz as f32, config.max_hz as f32, config.window_size)
        .with_silence_rms(config.silence_rms)
}

fn detect_live(samples: &[f32], sample_rate: f32) -> pitch::PitchResult {
    DETECTOR.with(|cell| {
        let mut borrow = cell.borrow_mut();
        if borrow.as_ref().map_or(false, |d| d.sample_rate() != sample_rate) {
            *borrow = None;
        }
        borrow
            .get_or_insert_with(|| live_detector(sample_rate))
            .detect(samples)
    })
}

/// YIN-based pitch detection returning Float64Array [hz, confidence, midi_float].
/// Reuses a thread-local detector between calls.
#[wasm_bindgen]
pub fn detect_pitch(samples: &[f32], sample_rate: f32) -> js_sys::Float64Array {
    let result = detect_live(samples, sample_rate);

    let arr = js_sys::Float64Array::new_with_length(3);
    arr.set_index(0, result.hz as f64);
    arr.set_index(1, result.confidence as f64);
    arr.set_index(2, result.midi_float as f64);
    arr
}

/// Classifies decoded audio against the notes of `timeline_js`. The first
/// sample sits at `offset_secs` into the performance. Returns the per-note
/// feedback, worst accuracy per measure and a summary.
#[wasm_bindgen]
pub fn classify_performance(
    samples: &[f32],
    sample_rate: u32,
    offset_secs: f64,
    timeline_js: JsValue,
    config_js: JsValue,
) -> Result<JsValue, JsValue> {
    let timeline: Timeline = from_js(timeline_js)?;
    let config: ClassifierConfig = if is_absent(&config_js) {
        ClassifierConfig::default()
    } else {
        from_js(config_js)?
    };

    let audio = Samples {
        samples: samples.to_vec(),
        sample_rate,
        offset_secs,
    };
    let end_secs = audio.end_secs();
    let notes: Vec<ExpectedNote> = timeline
        .notes
        .iter()
        .filter(|n| n.time_secs >= offset_secs && n.time_secs < end_secs)
        .cloned()
        .collect();

    let classifier = PitchClassifier::for_timeline(config, &timeline);
    let feedback = classifier.classify_range(&audio, &notes);
    let summary = PerformanceSummary::from_feedback(&feedback);

    #[derive(serde::Serialize)]
    struct Classified {
        feedback: RangeFeedback,
        summary: PerformanceSummary,
    }
    to_js(&Classified { feedback, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn tone(hz: f32, sample_rate: f32) -> Vec<f32> {
        (0..4096)
            .map(|i| 0.5 * (2.0 * PI * hz * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn test_live_detection_covers_classifier_range() {
        // Above the old 1200 Hz ceiling
        let result = detect_live(&tone(1500.0, 44100.0), 44100.0);
        assert!((result.hz - 1500.0).abs() < 30.0, "got {}", result.hz);

        let result = detect_live(&tone(110.0, 48000.0), 48000.0);
        assert!((result.hz - 110.0).abs() < 2.0, "got {}", result.hz);
    }

    #[test]
    fn test_live_detection_gates_silence() {
        assert_eq!(detect_live(&vec![0.0; 2048], 44100.0).frequency(), None);
    }
}
