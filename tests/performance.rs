//! End-to-end tests: score parsing, timeline, capture, live measure feedback,
//! the final pass and the position tracker working together.

use std::f32::consts::PI;
use std::time::Duration;

use scorefollow_rs::capture::{BufferDevice, HostFeed};
use scorefollow_rs::parser::musicxml::parse_musicxml;
use scorefollow_rs::scoring::types::TransposeInfo;
use scorefollow_rs::{
    Accuracy, AudioCaptureSession, CaptureConfig, ClassifierConfig, EngineConfig, Issue,
    MeasureFeedbackScheduler, MeasureFeedbackState, PerformanceSession, SchedulerConfig,
    ScorePositionTracker, Timeline, TrackerConfig,
};

const ETUDE: &str = include_str!("fixtures/etude_bb.musicxml");
const SR: u32 = 44100;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A performer playing every note of `timeline` at `frequency(index)`.
fn render_with(timeline: &Timeline, secs: f64, frequency: impl Fn(usize) -> f64) -> Vec<f32> {
    let total = (secs * SR as f64) as usize;
    let mut out = vec![0.0f32; total];
    for (index, note) in timeline.notes.iter().enumerate() {
        let hz = frequency(index) as f32;
        let start = (note.time_secs * SR as f64) as usize;
        let end = ((note.end_secs() * SR as f64) as usize).min(total);
        for i in start..end {
            let t = (i - start) as f32 / SR as f32;
            out[i] = 0.5 * (2.0 * PI * hz * t).sin();
        }
    }
    out
}

fn render(timeline: &Timeline, secs: f64) -> Vec<f32> {
    render_with(timeline, secs, |i| timeline.notes[i].frequency_hz)
}

#[test]
fn test_fixture_parses() {
    let score = parse_musicxml(ETUDE).unwrap();
    assert_eq!(score.title.as_deref(), Some("Etude in C"));
    assert_eq!(score.composer.as_deref(), Some("J. Arban"));
    assert_eq!(score.tempo, 90.0);
    assert_eq!(score.measures.len(), 3);
    assert_eq!(score.systems.len(), 2);
    assert_eq!(score.notes.len(), 8);
    assert_eq!(
        score.transpose,
        Some(TransposeInfo {
            chromatic: -2,
            diatonic: -1
        })
    );
    assert_eq!(score.notes[0].pitch, "C4");
    assert_eq!(score.total_beats, 12.0);
}

#[test]
fn test_fixture_timeline_is_concert_pitch() {
    let score = parse_musicxml(ETUDE).unwrap();
    let timeline = Timeline::build(Some(&score), score.tempo, None);
    assert_eq!(timeline.notes.len(), 8);
    // Written C4 sounds as B-flat 3
    assert!((timeline.notes[0].frequency_hz - 233.08).abs() < 0.01);
    // Second G4 sits on beat 7 of the piece
    assert!((timeline.notes[5].time_secs - 7.0 * 60.0 / 90.0).abs() < 1e-9);
    assert_eq!(timeline.notes[6].system_index, 1);
    assert!((timeline.duration_secs() - 8.0).abs() < 1e-9);
    assert_eq!(timeline, Timeline::build(Some(&score), score.tempo, None));
}

#[tokio::test]
async fn test_perfect_performance_report() {
    init_tracing();
    let mut session = PerformanceSession::new(EngineConfig::default());
    session.load_score(ETUDE).await.unwrap();
    assert_eq!(session.tempo(), 90.0);

    let audio = render(session.timeline(), 8.5);
    session
        .start_recording(Box::new(BufferDevice::new(audio, 4096)))
        .await
        .unwrap();
    let report = session.stop_recording().await.unwrap();

    assert_eq!(report.feedback.notes.len(), 8);
    for note in &report.feedback.notes {
        assert_eq!(note.accuracy, Accuracy::Correct, "bar {} note {}", note.bar, note.note_index);
        assert!(note.issues.is_empty());
        // Detected pitch is reported as written
        assert_eq!(note.detected_pitch.as_deref(), Some(note.expected_pitch.as_str()));
    }
    assert!(report.feedback.measures.values().all(|a| *a == Accuracy::Correct));
    assert_eq!(report.summary.percent_correct, 100.0);
    assert!(report.summary.overall_score > 95.0);
    assert!(!report.recording.is_empty());
}

#[tokio::test]
async fn test_wrong_and_missing_notes() {
    let score = parse_musicxml(ETUDE).unwrap();
    let timeline = Timeline::build(Some(&score), score.tempo, None);

    // Third note played a tone low (the sound of the written D), last note never played
    let audio = render_with(&timeline, 6.6, |i| match i {
        2 => timeline.notes[1].frequency_hz,
        _ => timeline.notes[i].frequency_hz,
    });

    let mut session = PerformanceSession::new(EngineConfig::default());
    session.load_score(ETUDE).await.unwrap();
    session
        .start_recording(Box::new(BufferDevice::new(audio, 4096)))
        .await
        .unwrap();
    let report = session.stop_recording().await.unwrap();

    let third = &report.feedback.notes[2];
    assert_eq!(third.accuracy, Accuracy::Wrong);
    assert!(third.issues.contains(&Issue::WrongNote));
    assert_eq!(third.detected_pitch.as_deref(), Some("D4"));

    let last = &report.feedback.notes[7];
    assert_eq!(last.issues.iter().copied().collect::<Vec<_>>(), vec![Issue::MissedEntry]);

    assert_eq!(report.feedback.measures[&1], Accuracy::Wrong);
    assert_eq!(report.feedback.measures[&2], Accuracy::Correct);
    assert_eq!(report.summary.notes_missed, 1);
    assert_eq!(report.summary.notes_correct, 6);
}

#[tokio::test]
async fn test_live_feedback_across_tempo_change() {
    init_tracing();
    let score = parse_musicxml(ETUDE).unwrap();
    let timeline = Timeline::build(Some(&score), score.tempo, None);

    let feed = HostFeed::default();
    let mut capture = AudioCaptureSession::new(CaptureConfig::default());
    capture.start(Box::new(feed.clone())).unwrap();

    let mut scheduler = MeasureFeedbackScheduler::new(SchedulerConfig::default(), ClassifierConfig::default());
    scheduler.begin(capture.reader().unwrap(), timeline.clone());

    // First measure ends at 2.667s
    let first = render(&timeline, 2.7);
    feed.push(&first);
    scheduler.poll(Duration::from_millis(2700));
    assert_eq!(scheduler.state(1), Some(&MeasureFeedbackState::Analyzing));
    scheduler.settle().await;
    match scheduler.state(1) {
        Some(MeasureFeedbackState::Ready { feedback }) => {
            assert_eq!(feedback.measures[&1], Accuracy::Correct);
        }
        other => panic!("measure 1 not ready: {:?}", other),
    }

    // Slow down to half speed at 3s
    scheduler.change_tempo(3.0, 45.0);
    let rescaled = scheduler.timeline().unwrap().clone();
    assert_eq!(rescaled.measures[0], timeline.measures[0]);
    let measure2_end = rescaled.measure_span(2).unwrap().end_secs;
    assert!((measure2_end - (3.0 + (16.0 / 3.0 - 3.0) * 2.0)).abs() < 1e-9);

    let rest = render(&rescaled, measure2_end + 0.1);
    feed.push(&rest[first.len()..]);

    // Old boundary has passed but the rescaled one has not
    scheduler.poll(Duration::from_secs_f64(5.5));
    assert_eq!(scheduler.state(2), Some(&MeasureFeedbackState::Pending));

    scheduler.poll(Duration::from_secs_f64(measure2_end + 0.05));
    scheduler.settle().await;
    match scheduler.state(2) {
        Some(MeasureFeedbackState::Ready { feedback }) => {
            assert_eq!(feedback.notes.len(), 2);
            assert_eq!(feedback.measures[&2], Accuracy::Correct);
        }
        other => panic!("measure 2 not ready: {:?}", other),
    }
    assert_eq!(scheduler.state(3), Some(&MeasureFeedbackState::Pending));
}

#[test]
fn test_tracker_follows_fixture_systems() {
    let score = parse_musicxml(ETUDE).unwrap();
    let timeline = Timeline::build(Some(&score), score.tempo, None);
    let mut tracker = ScorePositionTracker::new(TrackerConfig::default(), timeline);

    let states: Vec<_> = (1..=12).filter_map(|beat| tracker.on_beat(beat)).collect();
    assert_eq!(states.len(), 12);

    // Beat 8 reaches the second G, the last note of the first system
    assert_eq!(states[7].note_index, 5);
    assert!(states[7].system_completed);
    assert_eq!(states[8].system_index, 1);
    assert_eq!(states[8].note_index, 6);
    assert!(states.windows(2).all(|w| w[0].note_index <= w[1].note_index));

    let reset = tracker.stop();
    assert_eq!((reset.note_index, reset.system_index), (0, 0));
}
