use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use crate::capture::codec::{decode_chunks, encode_chunk, seal_wav};
use crate::capture::device::CaptureDevice;
use crate::capture::{CaptureConfig, Samples};
use crate::error::{CaptureError, ExtractError};

struct DecodeCache {
    chunk_count: usize,
    samples: Arc<Vec<f32>>,
}

/// Append-only chunk log shared by the writer side (device callback) and any
/// number of readers.
struct ChunkLog {
    sample_rate: u32,
    chunk_size: usize,
    min_range_samples: usize,
    chunks: RwLock<Vec<Arc<[u8]>>>,
    cache: Mutex<Option<DecodeCache>>,
}

impl ChunkLog {
    fn new(config: &CaptureConfig) -> Self {
        ChunkLog {
            sample_rate: config.sample_rate,
            chunk_size: config.chunk_size.max(1),
            min_range_samples: config.min_range_samples,
            chunks: RwLock::new(Vec::new()),
            cache: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> Vec<Arc<[u8]>> {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Write handle given to a capture device.
#[derive(Clone)]
pub struct ChunkWriter {
    log: Arc<ChunkLog>,
}

impl ChunkWriter {
    pub fn sample_rate(&self) -> u32 {
        self.log.sample_rate
    }

    /// Encodes `samples` and appends them, split into chunks of at most
    /// `chunk_size` samples.
    pub fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let encoded: Vec<Arc<[u8]>> = samples
            .chunks(self.log.chunk_size)
            .map(|part| encode_chunk(part).into())
            .collect();
        self.log
            .chunks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(encoded);
    }
}

/// Cheap, clonable read handle; usable from any thread while capture runs.
#[derive(Clone)]
pub struct CaptureReader {
    log: Arc<ChunkLog>,
}

impl CaptureReader {
    pub fn sample_rate(&self) -> u32 {
        self.log.sample_rate
    }

    pub fn chunk_count(&self) -> usize {
        self.log.chunks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn captured_secs(&self) -> f64 {
        let bytes: usize = self
            .log
            .chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.len())
            .sum();
        (bytes / 2) as f64 / self.log.sample_rate as f64
    }

    /// Decodes the whole log. The last decode is reused until a chunk is
    /// appended.
    pub fn decode(&self) -> Result<Arc<Vec<f32>>, ExtractError> {
        let chunks = self.log.snapshot();

        if let Ok(cache) = self.log.cache.lock() {
            if let Some(cached) = cache.as_ref().filter(|c| c.chunk_count == chunks.len()) {
                return Ok(Arc::clone(&cached.samples));
            }
        }

        let samples = Arc::new(decode_chunks(chunks.iter().map(|c| &c[..]))?);
        if let Ok(mut cache) = self.log.cache.lock() {
            *cache = Some(DecodeCache {
                chunk_count: chunks.len(),
                samples: Arc::clone(&samples),
            });
        }
        Ok(samples)
    }

    /// Returns the samples in `[start_secs, end_secs)`, truncated to what has
    /// been captured so far.
    pub fn get_range(&self, start_secs: f64, end_secs: f64) -> Result<Samples, ExtractError> {
        let decoded = self.decode()?;
        let sample_rate = self.log.sample_rate as f64;
        let available_secs = decoded.len() as f64 / sample_rate;
        let out_of_range = || ExtractError::OutOfRange {
            start_secs,
            end_secs,
            available_secs,
        };

        if !(start_secs.is_finite() && end_secs.is_finite()) || end_secs <= start_secs {
            return Err(out_of_range());
        }

        let start = (start_secs.max(0.0) * sample_rate).round() as usize;
        let end = ((end_secs * sample_rate).round() as usize).min(decoded.len());
        if start >= decoded.len() || end < start + self.log.min_range_samples {
            return Err(out_of_range());
        }

        Ok(Samples {
            samples: decoded[start..end].to_vec(),
            sample_rate: self.log.sample_rate,
            offset_secs: start as f64 / sample_rate,
        })
    }
}

/// One recording at a time: owns the device and the chunk log it writes to.
pub struct AudioCaptureSession {
    config: CaptureConfig,
    log: Option<Arc<ChunkLog>>,
    device: Option<Box<dyn CaptureDevice>>,
}

impl AudioCaptureSession {
    pub fn new(config: CaptureConfig) -> Self {
        AudioCaptureSession {
            config,
            log: None,
            device: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.device.is_some()
    }

    /// Starts a new recording on `device`, discarding the previous one.
    pub fn start(&mut self, mut device: Box<dyn CaptureDevice>) -> Result<(), CaptureError> {
        if self.is_recording() {
            return Err(CaptureError::AlreadyRecording);
        }
        let log = Arc::new(ChunkLog::new(&self.config));
        device.start(ChunkWriter { log: Arc::clone(&log) })?;
        info!(sample_rate = self.config.sample_rate, "recording started");
        self.log = Some(log);
        self.device = Some(device);
        Ok(())
    }

    /// Releases the device and seals everything captured into a WAV blob.
    /// The log stays readable until the next `start`.
    pub fn stop(&mut self) -> Result<Vec<u8>, CaptureError> {
        let mut device = self.device.take().ok_or(CaptureError::NotRecording)?;
        device.stop();
        let log = self.log.as_ref().ok_or(CaptureError::NotRecording)?;
        let chunks = log.snapshot();
        let blob = seal_wav(chunks.iter().map(|c| &c[..]), log.sample_rate)?;
        debug!(chunks = chunks.len(), bytes = blob.len(), "recording sealed");
        Ok(blob)
    }

    pub fn reader(&self) -> Option<CaptureReader> {
        self.log.as_ref().map(|log| CaptureReader { log: Arc::clone(log) })
    }

    pub fn get_range(&self, start_secs: f64, end_secs: f64) -> Result<Samples, ExtractError> {
        match self.reader() {
            Some(reader) => reader.get_range(start_secs, end_secs),
            None => Err(ExtractError::OutOfRange {
                start_secs,
                end_secs,
                available_secs: 0.0,
            }),
        }
    }
}

impl Drop for AudioCaptureSession {
    fn drop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::codec::decode_full;
    use crate::capture::{BufferDevice, HostFeed};

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i % 100) as f32 / 200.0).collect()
    }

    fn session() -> AudioCaptureSession {
        AudioCaptureSession::new(CaptureConfig::default())
    }

    #[test]
    fn test_get_range_slices_by_time() {
        let mut capture = session();
        capture.start(Box::new(BufferDevice::new(ramp(44100), 4096))).unwrap();

        let range = capture.get_range(0.25, 0.5).unwrap();
        assert_eq!(range.sample_rate, 44100);
        assert_eq!(range.samples.len(), 11025);
        assert!((range.offset_secs - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_range_truncated_to_captured_audio() {
        let mut capture = session();
        capture.start(Box::new(BufferDevice::new(ramp(44100), 4096))).unwrap();
        let range = capture.get_range(0.5, 2.0).unwrap();
        assert_eq!(range.samples.len(), 22050);
    }

    #[test]
    fn test_range_beyond_capture_is_out_of_range() {
        let mut capture = session();
        capture.start(Box::new(BufferDevice::new(ramp(44100), 4096))).unwrap();

        let err = capture.get_range(1.5, 2.0).unwrap_err();
        assert_eq!(
            err,
            ExtractError::OutOfRange {
                start_secs: 1.5,
                end_secs: 2.0,
                available_secs: 1.0,
            }
        );
        // Fewer than 512 samples left
        assert!(capture.get_range(0.995, 2.0).is_err());
        assert!(capture.get_range(0.5, 0.5).is_err());
    }

    #[test]
    fn test_reader_sees_appends_while_recording() {
        let feed = HostFeed::default();
        let mut capture = session();
        capture.start(Box::new(feed.clone())).unwrap();
        let reader = capture.reader().unwrap();

        assert!(reader.get_range(0.0, 0.1).is_err());
        assert!(feed.push(&ramp(4410)));
        assert_eq!(reader.get_range(0.0, 0.1).unwrap().samples.len(), 4410);

        let first = reader.decode().unwrap();
        let again = reader.decode().unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        assert!(feed.push(&ramp(4410)));
        assert_eq!(reader.decode().unwrap().len(), 8820);
        assert!((reader.captured_secs() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_pushes_are_split_into_chunks() {
        let feed = HostFeed::default();
        let mut capture = AudioCaptureSession::new(CaptureConfig {
            chunk_size: 1000,
            ..CaptureConfig::default()
        });
        capture.start(Box::new(feed.clone())).unwrap();
        let reader = capture.reader().unwrap();

        assert!(feed.push(&ramp(2500)));
        assert_eq!(reader.chunk_count(), 3);
        assert_eq!(reader.decode().unwrap().len(), 2500);
    }

    #[test]
    fn test_reader_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CaptureReader>();
        assert_send_sync::<ChunkWriter>();
    }

    #[test]
    fn test_stop_seals_wav() {
        let mut capture = session();
        capture.start(Box::new(BufferDevice::new(ramp(10000), 4096))).unwrap();
        assert!(capture.is_recording());
        let blob = capture.stop().unwrap();
        assert!(!capture.is_recording());

        let decoded = decode_full(&blob).unwrap();
        assert_eq!(decoded.samples.len(), 10000);
        // Still readable after stop
        assert!(capture.get_range(0.0, 0.1).is_ok());
    }

    #[test]
    fn test_start_stop_state_errors() {
        let mut capture = session();
        assert_eq!(capture.stop(), Err(CaptureError::NotRecording));
        assert!(capture.get_range(0.0, 1.0).is_err());

        capture.start(Box::new(HostFeed::default())).unwrap();
        assert_eq!(
            capture.start(Box::new(HostFeed::default())),
            Err(CaptureError::AlreadyRecording)
        );
    }

    #[test]
    fn test_new_recording_discards_previous() {
        let mut capture = session();
        capture.start(Box::new(BufferDevice::new(ramp(44100), 4096))).unwrap();
        capture.stop().unwrap();
        capture.start(Box::new(HostFeed::default())).unwrap();
        assert_eq!(capture.reader().unwrap().chunk_count(), 0);
    }
}
