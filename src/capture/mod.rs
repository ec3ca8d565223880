//! Audio capture: an append-only log of encoded chunks that can be sliced by
//! time while recording is still running.

pub mod codec;
pub mod device;
pub mod session;

use serde::{Deserialize, Serialize};

pub use codec::decode_full;
#[cfg(feature = "device")]
pub use device::CpalDevice;
pub use device::{BufferDevice, CaptureDevice, HostFeed};
pub use session::{AudioCaptureSession, CaptureReader, ChunkWriter};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Largest chunk stored in the capture log, in samples.
    pub chunk_size: usize,
    /// Shortest slice `get_range` will return.
    pub min_range_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            sample_rate: 44100,
            chunk_size: 4096,
            min_range_samples: 512,
        }
    }
}

/// Decoded mono audio. `offset_secs` is the time of the first sample
/// relative to the start of the recording.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Samples {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub offset_secs: f64,
}

impl Samples {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end_secs(&self) -> f64 {
        self.offset_secs + self.duration_secs()
    }
}
