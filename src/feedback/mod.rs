pub mod scheduler;

pub use scheduler::{spawn_poller, MeasureFeedbackScheduler, MeasureFeedbackState, SchedulerConfig};
