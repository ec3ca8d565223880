use std::sync::{Arc, Mutex};

use crate::capture::session::ChunkWriter;
use crate::error::CaptureError;

/// Source of mono audio for a recording. Implementations push chunks into
/// the writer until `stop` is called.
pub trait CaptureDevice {
    fn start(&mut self, writer: ChunkWriter) -> Result<(), CaptureError>;
    fn stop(&mut self);
}

/// Replays a prepared buffer in fixed-size chunks as soon as it is started.
pub struct BufferDevice {
    samples: Vec<f32>,
    chunk_size: usize,
}

impl BufferDevice {
    pub fn new(samples: Vec<f32>, chunk_size: usize) -> Self {
        BufferDevice {
            samples,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl CaptureDevice for BufferDevice {
    fn start(&mut self, writer: ChunkWriter) -> Result<(), CaptureError> {
        for chunk in self.samples.chunks(self.chunk_size) {
            writer.push(chunk);
        }
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Device for hosts that capture audio themselves and forward it with
/// [`HostFeed::push`]. Clones share the same recording.
#[derive(Clone, Default)]
pub struct HostFeed {
    writer: Arc<Mutex<Option<ChunkWriter>>>,
}

impl HostFeed {
    /// Appends samples to the active recording. Returns false when no
    /// recording is running.
    pub fn push(&self, samples: &[f32]) -> bool {
        match self.writer.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(writer) => {
                    writer.push(samples);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

impl CaptureDevice for HostFeed {
    fn start(&mut self, writer: ChunkWriter) -> Result<(), CaptureError> {
        let mut slot = self
            .writer
            .lock()
            .map_err(|_| CaptureError::Stream("host feed lock poisoned".to_string()))?;
        *slot = Some(writer);
        Ok(())
    }

    fn stop(&mut self) {
        if let Ok(mut slot) = self.writer.lock() {
            *slot = None;
        }
    }
}

/// Default system input through cpal, downmixed to mono.
#[cfg(feature = "device")]
pub struct CpalDevice {
    stream: Option<cpal::Stream>,
}

#[cfg(feature = "device")]
impl CpalDevice {
    pub fn new() -> Self {
        CpalDevice { stream: None }
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        writer: ChunkWriter,
    ) -> Result<cpal::Stream, CaptureError>
    where
        T: cpal::Sample + cpal::SizedSample,
        f32: cpal::FromSample<T>,
    {
        use cpal::traits::DeviceTrait;
        use cpal::Sample;

        let channels = config.channels.max(1) as usize;
        let mut mono: Vec<f32> = Vec::new();
        let err_fn = |err: cpal::StreamError| tracing::error!(error = %err, "input stream error");

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    mono.extend(data.chunks_exact(channels).map(|frame| {
                        frame.iter().fold(0.0f32, |acc, s| acc + s.to_sample::<f32>()) / channels as f32
                    }));
                    writer.push(&mono);
                },
                err_fn,
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => CaptureError::NoDevice,
                other => CaptureError::Stream(other.to_string()),
            })
    }
}

#[cfg(feature = "device")]
impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "device")]
impl CaptureDevice for CpalDevice {
    fn start(&mut self, writer: ChunkWriter) -> Result<(), CaptureError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
        let supported = device
            .default_input_config()
            .map_err(|e| CaptureError::Stream(format!("Failed to get default config: {}", e)))?;

        let config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(writer.sample_rate()),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, writer)?,
            cpal::SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, writer)?,
            cpal::SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, writer)?,
            f => return Err(CaptureError::Stream(format!("unsupported sample format {}", f))),
        };
        stream.play().map_err(|e| CaptureError::Stream(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping the stream closes the device
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioCaptureSession, CaptureConfig};

    #[test]
    fn test_buffer_device_chunks() {
        let mut capture = AudioCaptureSession::new(CaptureConfig::default());
        capture.start(Box::new(BufferDevice::new(vec![0.1; 10], 4))).unwrap();
        assert_eq!(capture.reader().unwrap().chunk_count(), 3);
    }

    #[test]
    fn test_host_feed_only_writes_while_started() {
        let feed = HostFeed::default();
        assert!(!feed.push(&[0.1; 8]));

        let mut capture = AudioCaptureSession::new(CaptureConfig::default());
        capture.start(Box::new(feed.clone())).unwrap();
        assert!(feed.push(&[0.1; 8]));
        capture.stop().unwrap();
        assert!(!feed.push(&[0.1; 8]));
        assert_eq!(capture.reader().unwrap().chunk_count(), 1);
    }
}
