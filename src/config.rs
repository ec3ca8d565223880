//! Engine configuration.
//!
//! Every section has defaults, so a host only needs to spell out what it
//! changes, e.g. `{"scheduler": {"max_attempts": 5}}`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::error::ConfigError;
use crate::feedback::SchedulerConfig;
use crate::parser::musicxml::ParseOptions;
use crate::scoring::classifier::ClassifierConfig;
use crate::tracker::TrackerConfig;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub parse: ParseOptions,
    pub capture: CaptureConfig,
    pub classifier: ClassifierConfig,
    pub scheduler: SchedulerConfig,
    pub tracker: TrackerConfig,
    /// Only the first `max_measures` measures are followed, when set.
    pub max_measures: Option<usize>,
    /// Timeout for the full-performance pass after recording stops.
    pub final_pass_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            parse: ParseOptions::default(),
            capture: CaptureConfig::default(),
            classifier: ClassifierConfig::default(),
            scheduler: SchedulerConfig::default(),
            tracker: TrackerConfig::default(),
            max_measures: None,
            final_pass_timeout_ms: 30_000,
        }
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            invalid("path", format!("failed to read {:?}: {}", path.as_ref(), e))
        })?;
        Self::from_json(&contents)
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.sample_rate < 8000 {
            return Err(invalid("capture.sample_rate", "must be at least 8000 Hz"));
        }
        if self.capture.chunk_size == 0 {
            return Err(invalid("capture.chunk_size", "must be positive"));
        }

        let c = &self.classifier;
        if c.window_size < 64 {
            return Err(invalid("classifier.window_size", "must be at least 64 samples"));
        }
        if c.min_window > c.window_size {
            return Err(invalid("classifier.min_window", "must not exceed window_size"));
        }
        if !(c.min_hz > 0.0 && c.min_hz < c.max_hz) {
            return Err(invalid("classifier.min_hz", "must be positive and below max_hz"));
        }
        if !(c.correct_tolerance > 0.0 && c.correct_tolerance < c.slight_tolerance) {
            return Err(invalid(
                "classifier.correct_tolerance",
                "must be positive and below slight_tolerance",
            ));
        }
        if c.timing_tolerance_ms < 0.0 {
            return Err(invalid("classifier.timing_tolerance_ms", "must not be negative"));
        }

        if self.scheduler.poll_interval_ms == 0 {
            return Err(invalid("scheduler.poll_interval_ms", "must be positive"));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(invalid("scheduler.max_attempts", "must be at least 1"));
        }
        if self.tracker.fallback_beats_per_frame == 0 {
            return Err(invalid("tracker.fallback_beats_per_frame", "must be positive"));
        }
        if self.parse.measures_per_system == Some(0) {
            return Err(invalid("parse.measures_per_system", "must be positive"));
        }
        Ok(())
    }
}
