//! Per-measure feedback while recording.
//!
//! A poll compares elapsed recording time against the measure boundary table
//! and launches one analysis task per measure that has finished. Tasks run on
//! the blocking pool under a timeout and report back over a channel; every
//! report carries the generation it was launched in so results from an
//! abandoned recording are never applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::CaptureReader;
use crate::error::AnalysisError;
use crate::scoring::classifier::{ClassifierConfig, PitchClassifier};
use crate::scoring::timeline::Timeline;
use crate::scoring::types::{MeasureSpan, RangeFeedback};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub analysis_timeout_ms: u64,
    /// How long a failure stays visible before the measure is retried.
    pub failed_display_ms: u64,
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            poll_interval_ms: 100,
            analysis_timeout_ms: 5000,
            failed_display_ms: 3000,
            max_attempts: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MeasureFeedbackState {
    Pending,
    Analyzing,
    Ready { feedback: RangeFeedback },
    Failed { reason: String },
}

#[derive(Debug)]
struct MeasureEntry {
    state: MeasureFeedbackState,
    attempts: u32,
    failed_at: Option<Duration>,
}

impl Default for MeasureEntry {
    fn default() -> Self {
        MeasureEntry {
            state: MeasureFeedbackState::Pending,
            attempts: 0,
            failed_at: None,
        }
    }
}

#[derive(Debug)]
struct Completion {
    generation: u64,
    measure: u32,
    result: Result<RangeFeedback, AnalysisError>,
}

pub struct MeasureFeedbackScheduler {
    config: SchedulerConfig,
    classifier_config: ClassifierConfig,
    generation: u64,
    reader: Option<CaptureReader>,
    timeline: Option<Timeline>,
    classifier: Arc<PitchClassifier>,
    entries: BTreeMap<u32, MeasureEntry>,
    tasks: HashMap<u32, JoinHandle<()>>,
    last_elapsed: Duration,
    tx: UnboundedSender<Completion>,
    rx: UnboundedReceiver<Completion>,
}

impl MeasureFeedbackScheduler {
    pub fn new(config: SchedulerConfig, classifier_config: ClassifierConfig) -> Self {
        let (tx, rx) = unbounded_channel();
        MeasureFeedbackScheduler {
            config,
            classifier: Arc::new(PitchClassifier::new(classifier_config.clone())),
            classifier_config,
            generation: 0,
            reader: None,
            timeline: None,
            entries: BTreeMap::new(),
            tasks: HashMap::new(),
            last_elapsed: Duration::ZERO,
            tx,
            rx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.timeline.is_some()
    }

    pub fn timeline(&self) -> Option<&Timeline> {
        self.timeline.as_ref()
    }

    /// Starts a new recording generation. In-flight analyses of the previous
    /// one are aborted and all measure state is cleared.
    pub fn begin(&mut self, reader: CaptureReader, timeline: Timeline) {
        self.reset();
        self.classifier = Arc::new(PitchClassifier::for_timeline(self.classifier_config.clone(), &timeline));
        self.entries = timeline
            .measures
            .iter()
            .map(|m| (m.number, MeasureEntry::default()))
            .collect();
        info!(
            generation = self.generation,
            measures = self.entries.len(),
            "measure feedback started"
        );
        self.reader = Some(reader);
        self.timeline = Some(timeline);
    }

    /// Stops scheduling and invalidates any in-flight analysis.
    pub fn cancel(&mut self) {
        self.reset();
        debug!(generation = self.generation, "measure feedback cancelled");
    }

    fn reset(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        while self.rx.try_recv().is_ok() {}
        self.generation += 1;
        self.entries.clear();
        self.reader = None;
        self.timeline = None;
        self.last_elapsed = Duration::ZERO;
    }

    /// Rescales measures that have not finished by `at_secs` to `new_tempo`.
    /// The generation is kept: in-flight analyses cover measures that
    /// already ended and are unaffected.
    pub fn change_tempo(&mut self, at_secs: f64, new_tempo: f64) {
        if let Some(timeline) = self.timeline.as_mut() {
            let rescaled = timeline.rescaled(at_secs, timeline.tempo, new_tempo);
            *timeline = rescaled;
            info!(generation = self.generation, at_secs, tempo = new_tempo, "measure boundaries rescaled");
        }
    }

    pub fn state(&self, measure: u32) -> Option<&MeasureFeedbackState> {
        self.entries.get(&measure).map(|e| &e.state)
    }

    pub fn states(&self) -> BTreeMap<u32, MeasureFeedbackState> {
        self.entries.iter().map(|(n, e)| (*n, e.state.clone())).collect()
    }

    pub fn attempts(&self, measure: u32) -> u32 {
        self.entries.get(&measure).map_or(0, |e| e.attempts)
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Feedback of every measure analysed so far, merged in measure order.
    pub fn ready_feedback(&self) -> RangeFeedback {
        let mut merged = RangeFeedback::default();
        for entry in self.entries.values() {
            if let MeasureFeedbackState::Ready { feedback } = &entry.state {
                merged.notes.extend(feedback.notes.iter().cloned());
                merged.measures.extend(feedback.measures.iter().map(|(n, a)| (*n, *a)));
                merged.session_issues.extend(feedback.session_issues.iter().copied());
            }
        }
        merged
    }

    /// One scheduling step at `elapsed` recording time: apply finished
    /// analyses, expire old failures, launch analyses for finished measures.
    pub fn poll(&mut self, elapsed: Duration) {
        self.last_elapsed = elapsed;
        self.apply_completions();
        self.expire_failures(elapsed);

        let Some(timeline) = self.timeline.as_ref() else {
            return;
        };
        let elapsed_secs = elapsed.as_secs_f64();
        let due: Vec<MeasureSpan> = timeline
            .measures
            .iter()
            .filter(|span| span.end_secs <= elapsed_secs)
            .filter(|span| {
                self.entries.get(&span.number).map_or(true, |e| {
                    e.state == MeasureFeedbackState::Pending && e.attempts < self.config.max_attempts
                })
            })
            .copied()
            .collect();

        for span in due {
            self.launch(span);
        }
    }

    fn launch(&mut self, span: MeasureSpan) {
        let (Some(reader), Some(timeline)) = (self.reader.clone(), self.timeline.as_ref()) else {
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(measure = span.number, "no async runtime, measure analysis skipped");
                return;
            }
        };

        let notes = timeline.notes_in_measure(span.number);
        let classifier = Arc::clone(&self.classifier);
        let tx = self.tx.clone();
        let generation = self.generation;
        let measure = span.number;
        let timeout_ms = self.config.analysis_timeout_ms;

        let entry = self.entries.entry(measure).or_default();
        entry.state = MeasureFeedbackState::Analyzing;
        entry.attempts += 1;
        entry.failed_at = None;
        debug!(measure, generation, attempt = entry.attempts, "measure analysis launched");

        let task = handle.spawn(async move {
            let work = tokio::task::spawn_blocking(move || -> Result<RangeFeedback, AnalysisError> {
                let samples = reader.get_range(span.start_secs, span.end_secs)?;
                Ok(classifier.classify_range(&samples, &notes))
            });
            let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), work).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(AnalysisError::Aborted(join_err.to_string())),
                Err(_) => Err(AnalysisError::Timeout(timeout_ms)),
            };
            let _ = tx.send(Completion {
                generation,
                measure,
                result,
            });
        });
        self.tasks.insert(measure, task);
    }

    fn apply_completions(&mut self) {
        while let Ok(completion) = self.rx.try_recv() {
            self.apply(completion);
        }
    }

    fn apply(&mut self, completion: Completion) {
        let Completion {
            generation,
            measure,
            result,
        } = completion;

        if generation != self.generation {
            debug!(measure, generation, current = self.generation, "stale measure result dropped");
            return;
        }
        let Some(entry) = self.entries.get_mut(&measure) else {
            return;
        };
        if entry.state != MeasureFeedbackState::Analyzing {
            debug!(measure, "result for measure not being analysed dropped");
            return;
        }
        self.tasks.remove(&measure);

        match result {
            Ok(feedback) => {
                debug!(measure, generation, notes = feedback.notes.len(), "measure feedback ready");
                entry.state = MeasureFeedbackState::Ready { feedback };
            }
            Err(e) => {
                warn!(measure, generation, attempt = entry.attempts, error = %e, "measure analysis failed");
                entry.state = MeasureFeedbackState::Failed { reason: e.to_string() };
                entry.failed_at = Some(self.last_elapsed);
            }
        }
    }

    fn expire_failures(&mut self, elapsed: Duration) {
        let display = Duration::from_millis(self.config.failed_display_ms);
        let max_attempts = self.config.max_attempts;
        for (measure, entry) in self.entries.iter_mut() {
            let expired = matches!(entry.failed_at, Some(at) if elapsed.saturating_sub(at) >= display);
            // Measures out of attempts keep showing the failure
            if expired && entry.attempts < max_attempts {
                debug!(measure = *measure, "failed measure cleared for retry");
                entry.state = MeasureFeedbackState::Pending;
                entry.failed_at = None;
            }
        }
    }

    /// Waits for every in-flight analysis and applies the results.
    pub async fn settle(&mut self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.drain().map(|(_, task)| task).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.apply_completions();
    }
}

/// Drives `scheduler.poll` on a fixed interval, with elapsed time measured
/// from `started`. Abort the returned handle to stop polling.
pub fn spawn_poller(
    scheduler: Arc<Mutex<MeasureFeedbackScheduler>>,
    started: tokio::time::Instant,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(scheduler.lock().await.config().poll_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            scheduler.lock().await.poll(started.elapsed());
        }
    })
}
