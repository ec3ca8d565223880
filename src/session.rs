//! Host-facing glue: one piece, one tempo, one recording at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::capture::{decode_full, AudioCaptureSession, CaptureDevice};
use crate::config::EngineConfig;
use crate::error::{AnalysisError, CaptureError, ParseError, SessionError};
use crate::feedback::{spawn_poller, MeasureFeedbackScheduler, MeasureFeedbackState};
use crate::parser::musicxml::parse_musicxml_with;
use crate::scoring::classifier::PitchClassifier;
use crate::scoring::fallback::FALLBACK_TEMPO;
use crate::scoring::timeline::{clamp_tempo, Timeline};
use crate::scoring::types::{Frame, PerformanceSummary, PositionState, RangeFeedback, Score};
use crate::tracker::ScorePositionTracker;

/// Result of the full pass over a finished recording.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PerformanceReport {
    pub feedback: RangeFeedback,
    pub summary: PerformanceSummary,
    pub duration_secs: f64,
    /// Sealed WAV recording.
    #[serde(skip)]
    pub recording: Vec<u8>,
}

pub struct PerformanceSession {
    config: EngineConfig,
    score: Option<Score>,
    tempo: f64,
    timeline: Timeline,
    capture: AudioCaptureSession,
    scheduler: Arc<Mutex<MeasureFeedbackScheduler>>,
    poller: Option<JoinHandle<()>>,
    tracker: ScorePositionTracker,
    started: Option<Instant>,
}

impl PerformanceSession {
    pub fn new(config: EngineConfig) -> Self {
        let timeline = Timeline::build(None, FALLBACK_TEMPO, config.max_measures);
        let scheduler = MeasureFeedbackScheduler::new(config.scheduler.clone(), config.classifier.clone());
        PerformanceSession {
            capture: AudioCaptureSession::new(config.capture.clone()),
            scheduler: Arc::new(Mutex::new(scheduler)),
            poller: None,
            tracker: ScorePositionTracker::new(config.tracker.clone(), timeline.clone()),
            score: None,
            tempo: FALLBACK_TEMPO,
            timeline,
            started: None,
            config,
        }
    }

    pub fn score(&self) -> Option<&Score> {
        self.score.as_ref()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    pub fn position(&self) -> PositionState {
        self.tracker.state()
    }

    /// Elapsed recording time, zero when not recording.
    pub fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |s| s.elapsed())
    }

    /// Loads a new piece. Any recording in progress is discarded. On a parse
    /// failure the built-in tune is followed and the error is returned.
    pub async fn load_score(&mut self, xml: &str) -> Result<&Score, ParseError> {
        if self.is_recording() {
            warn!("piece changed while recording, recording discarded");
            self.halt().await;
        }

        match parse_musicxml_with(xml, &self.config.parse) {
            Ok(score) => {
                self.tempo = clamp_tempo(score.tempo);
                self.timeline = Timeline::build(Some(&score), self.tempo, self.config.max_measures);
                self.tracker.set_timeline(self.timeline.clone());
                self.tracker.stop();
                info!(
                    title = score.title.as_deref().unwrap_or("untitled"),
                    tempo = self.tempo,
                    "score loaded"
                );
                Ok(self.score.insert(score))
            }
            Err(e) => {
                warn!(error = %e, "score could not be parsed, following the built-in tune");
                self.score = None;
                self.timeline = Timeline::build(None, self.tempo, self.config.max_measures);
                self.tracker.set_timeline(self.timeline.clone());
                self.tracker.stop();
                Err(e)
            }
        }
    }

    /// Changes tempo. While recording, material that has not been played
    /// yet is rescaled and the tracker keeps counting from its last beat.
    pub async fn set_tempo(&mut self, tempo_bpm: f64) {
        let tempo = clamp_tempo(tempo_bpm);
        if self.is_recording() {
            let at = self.elapsed().as_secs_f64();
            self.timeline = self.timeline.rescaled(at, self.tempo, tempo);
            self.scheduler.lock().await.change_tempo(at, tempo);
            self.tracker.set_tempo(tempo);
            self.tracker.set_timeline(self.timeline.clone());
        } else {
            self.timeline = Timeline::build(self.score.as_ref(), tempo, self.config.max_measures);
            self.tracker.set_timeline(self.timeline.clone());
            self.tracker.stop();
        }
        self.tempo = tempo;
        info!(tempo, recording = self.is_recording(), "tempo changed");
    }

    pub fn set_frames(&mut self, frames: Vec<Frame>) {
        self.tracker.set_frames(frames);
    }

    /// Starts recording from `device` and begins per-measure feedback.
    pub async fn start_recording(&mut self, device: Box<dyn CaptureDevice>) -> Result<(), CaptureError> {
        self.capture.start(device)?;
        let reader = self.capture.reader().ok_or(CaptureError::NotRecording)?;

        self.scheduler.lock().await.begin(reader, self.timeline.clone());
        self.tracker.stop();

        let started = Instant::now();
        self.started = Some(started);
        self.poller = Some(spawn_poller(Arc::clone(&self.scheduler), started));
        Ok(())
    }

    pub fn on_beat(&mut self, beat: i64) -> Option<PositionState> {
        self.tracker.on_beat(beat)
    }

    /// Runs a scheduling step now and returns every measure's state.
    pub async fn poll_feedback(&mut self) -> BTreeMap<u32, MeasureFeedbackState> {
        let elapsed = self.elapsed();
        let mut scheduler = self.scheduler.lock().await;
        if self.started.is_some() {
            scheduler.poll(elapsed);
        }
        scheduler.states()
    }

    async fn halt(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if self.capture.is_recording() {
            if let Err(e) = self.capture.stop() {
                warn!(error = %e, "recording could not be sealed");
            }
        }
        self.scheduler.lock().await.cancel();
        self.started = None;

        // Drop any rescale made while the take was running
        self.timeline = Timeline::build(self.score.as_ref(), self.tempo, self.config.max_measures);
        self.tracker.set_timeline(self.timeline.clone());
        self.tracker.stop();
    }

    /// Stops recording and analyses the whole sealed recording against the
    /// timeline as it was performed.
    pub async fn stop_recording(&mut self) -> Result<PerformanceReport, SessionError> {
        let sealed = self.capture.stop();
        let timeline = self.timeline.clone();
        self.halt().await;
        let recording = sealed?;

        let classifier = PitchClassifier::for_timeline(self.config.classifier.clone(), &timeline);
        let blob = recording.clone();
        let timeout_ms = self.config.final_pass_timeout_ms;

        let work = tokio::task::spawn_blocking(move || -> Result<(RangeFeedback, f64), AnalysisError> {
            let samples = decode_full(&blob)?;
            Ok((classifier.classify_range(&samples, &timeline.notes), samples.duration_secs()))
        });
        let (feedback, duration_secs) = match tokio::time::timeout(Duration::from_millis(timeout_ms), work).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => return Err(AnalysisError::Aborted(join_err.to_string()).into()),
            Err(_) => return Err(AnalysisError::Timeout(timeout_ms).into()),
        };

        let summary = PerformanceSummary::from_feedback(&feedback);
        info!(
            notes = summary.total_notes,
            correct = summary.notes_correct,
            score = summary.overall_score,
            duration_secs,
            "performance analysed"
        );
        Ok(PerformanceReport {
            feedback,
            summary,
            duration_secs,
            recording,
        })
    }
}

impl Drop for PerformanceSession {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BufferDevice, HostFeed};

    #[tokio::test]
    async fn test_bad_score_falls_back() {
        let mut session = PerformanceSession::new(EngineConfig::default());
        assert!(session.load_score("<score-partwise><part>").await.is_err());
        assert!(session.score().is_none());
        assert!(session.timeline().is_fallback);
        assert_eq!(session.timeline().notes.len(), 14);
    }

    #[tokio::test]
    async fn test_tempo_rebuilds_timeline_when_idle() {
        let mut session = PerformanceSession::new(EngineConfig::default());
        session.set_tempo(60.0).await;
        assert_eq!(session.tempo(), 60.0);
        assert_eq!(session.timeline().notes[1].time_secs, 1.0);

        session.set_tempo(1000.0).await;
        assert_eq!(session.tempo(), 400.0);
    }

    #[tokio::test]
    async fn test_recording_state_errors() {
        let mut session = PerformanceSession::new(EngineConfig::default());
        assert_eq!(
            session.stop_recording().await,
            Err(SessionError::Capture(CaptureError::NotRecording))
        );

        session.start_recording(Box::new(HostFeed::default())).await.unwrap();
        assert_eq!(
            session.start_recording(Box::new(HostFeed::default())).await,
            Err(CaptureError::AlreadyRecording)
        );
    }

    #[tokio::test]
    async fn test_tempo_change_while_recording_is_not_kept() {
        let mut session = PerformanceSession::new(EngineConfig::default());
        session.start_recording(Box::new(HostFeed::default())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.set_tempo(50.0).await;
        assert_ne!(session.timeline(), &Timeline::build(None, 50.0, None));

        // Empty take
        let _ = session.stop_recording().await;
        assert!(!session.is_recording());
        assert_eq!(session.tempo(), 50.0);
        assert_eq!(session.timeline(), &Timeline::build(None, 50.0, None));
        assert!((session.timeline().notes[1].time_secs - 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_stop_still_ends_feedback() {
        let mut session = PerformanceSession::new(EngineConfig::default());
        session.start_recording(Box::new(HostFeed::default())).await.unwrap();
        assert!(session.scheduler.lock().await.is_active());

        // The device is already gone when the session stops
        session.capture.stop().unwrap();
        assert_eq!(
            session.stop_recording().await,
            Err(SessionError::Capture(CaptureError::NotRecording))
        );
        assert!(session.poller.is_none());
        assert!(session.started.is_none());
        assert!(!session.scheduler.lock().await.is_active());
    }

    #[tokio::test]
    async fn test_silent_recording_reports_missed_notes() {
        let mut session = PerformanceSession::new(EngineConfig::default());
        let silence = vec![0.0; 44100 * 10];
        session.start_recording(Box::new(BufferDevice::new(silence, 4096))).await.unwrap();
        assert!(session.is_recording());
        session.on_beat(1);

        let report = session.stop_recording().await.unwrap();
        assert!(!session.is_recording());
        assert_eq!(session.position(), PositionState::default());
        assert_eq!(report.summary.total_notes, 14);
        assert_eq!(report.summary.notes_missed, 14);
        assert!((report.duration_secs - 10.0).abs() < 1e-9);
    }
}
