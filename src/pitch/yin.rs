//! YIN fundamental-frequency estimator (de Cheveigné & Kawahara, 2002).

use serde::Serialize;

use crate::error::ClassificationError;

const THRESHOLD: f32 = 0.15;
const DEFAULT_SILENCE_RMS: f32 = 0.02;
/// Global-minimum fallback is rejected above this aperiodicity.
const MAX_APERIODICITY: f32 = 0.5;

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PitchResult {
    pub hz: f32,
    /// 1 minus the aperiodicity at the chosen lag.
    pub confidence: f32,
    pub midi_float: f32,
}

impl PitchResult {
    pub fn silence() -> Self {
        PitchResult {
            hz: 0.0,
            confidence: 0.0,
            midi_float: 0.0,
        }
    }

    fn at(hz: f32, aperiodicity: f32) -> Self {
        PitchResult {
            hz,
            confidence: 1.0 - aperiodicity.min(1.0),
            midi_float: 69.0 + 12.0 * (hz / 440.0).log2(),
        }
    }

    /// `None` for silence and unpitched input.
    pub fn frequency(&self) -> Option<f32> {
        (self.hz > 0.0).then_some(self.hz)
    }
}

/// Reusable estimator; lag buffers grow to the largest window seen.
#[derive(Debug, Clone)]
pub struct PitchDetector {
    sample_rate: f32,
    min_freq: f32,
    max_freq: f32,
    silence_rms: f32,
    difference: Vec<f32>,
    normalized: Vec<f32>,
}

impl PitchDetector {
    pub fn new(sample_rate: f32, min_freq: f32, max_freq: f32, window_size: usize) -> Self {
        let lags = window_size / 2 + 1;
        PitchDetector {
            sample_rate,
            min_freq,
            max_freq,
            silence_rms: DEFAULT_SILENCE_RMS,
            difference: vec![0.0; lags],
            normalized: vec![0.0; lags],
        }
    }

    pub fn with_silence_rms(mut self, silence_rms: f32) -> Self {
        self.silence_rms = silence_rms;
        self
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Like [`PitchDetector::try_detect`], treating invalid input as silence.
    pub fn detect(&mut self, window: &[f32]) -> PitchResult {
        self.try_detect(window).unwrap_or_else(|_| PitchResult::silence())
    }

    pub fn try_detect(&mut self, window: &[f32]) -> Result<PitchResult, ClassificationError> {
        if !(self.sample_rate > 0.0) {
            return Err(ClassificationError::InvalidSampleRate(self.sample_rate));
        }
        if window.len() < 2 {
            return Err(ClassificationError::WindowTooShort(window.len()));
        }
        if rms(window) < self.silence_rms {
            return Ok(PitchResult::silence());
        }

        let shortest = (self.sample_rate / self.max_freq).ceil() as usize;
        let longest = ((self.sample_rate / self.min_freq).floor() as usize).min(window.len() / 2);
        if shortest >= longest || longest < 2 {
            return Ok(PitchResult::silence());
        }

        self.fill_difference(window, longest);
        self.normalize(longest);

        let Some(lag) = self.pick_lag(shortest, longest) else {
            return Ok(PitchResult::silence());
        };
        let period = self.refine(lag, longest);
        if period <= 0.0 {
            return Ok(PitchResult::silence());
        }
        Ok(PitchResult::at(self.sample_rate / period, self.normalized[lag]))
    }

    /// Squared difference of the first half of the window against itself
    /// shifted by each lag.
    fn fill_difference(&mut self, window: &[f32], longest: usize) {
        if self.difference.len() <= longest {
            self.difference.resize(longest + 1, 0.0);
            self.normalized.resize(longest + 1, 0.0);
        }
        let half = window.len() / 2;
        for lag in 1..=longest {
            self.difference[lag] = window[..half]
                .iter()
                .zip(&window[lag..lag + half])
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
        }
    }

    /// Cumulative mean normalised difference.
    fn normalize(&mut self, longest: usize) {
        self.normalized[0] = 1.0;
        let mut total = 0.0f32;
        for lag in 1..=longest {
            total += self.difference[lag];
            self.normalized[lag] = if total > 0.0 {
                self.difference[lag] * lag as f32 / total
            } else {
                1.0
            };
        }
    }

    /// First lag under the threshold, followed down to the bottom of its
    /// dip. Without one, the global minimum if it is periodic enough.
    fn pick_lag(&self, shortest: usize, longest: usize) -> Option<usize> {
        let d = &self.normalized;
        if let Some(mut lag) = (shortest..=longest).find(|&lag| d[lag] < THRESHOLD) {
            while lag < longest && d[lag + 1] < d[lag] {
                lag += 1;
            }
            return Some(lag);
        }

        let (lag, value) = (shortest..=longest)
            .map(|lag| (lag, d[lag]))
            .fold((0, f32::MAX), |best, cur| if cur.1 < best.1 { cur } else { best });
        (lag > 0 && value <= MAX_APERIODICITY).then_some(lag)
    }

    /// Parabolic interpolation around `lag` for a sub-sample period.
    fn refine(&self, lag: usize, longest: usize) -> f32 {
        if lag == 0 || lag >= longest {
            return lag as f32;
        }
        let (left, mid, right) = (self.normalized[lag - 1], self.normalized[lag], self.normalized[lag + 1]);
        let curvature = 2.0 * (2.0 * mid - left - right);
        if curvature.abs() > 1e-10 {
            lag as f32 + (left - right) / curvature
        } else {
            lag as f32
        }
    }
}

fn rms(window: &[f32]) -> f32 {
    let mean = window.iter().sum::<f32>() / window.len() as f32;
    let energy: f32 = window.iter().map(|&s| (s - mean) * (s - mean)).sum();
    (energy / window.len() as f32).sqrt()
}
