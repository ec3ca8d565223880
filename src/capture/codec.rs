//! Chunk and recording encodings.
//!
//! Live chunks are raw 16-bit little-endian mono PCM. A sealed recording is a
//! single WAV file written with `hound`.

use std::io::Cursor;

use crate::capture::Samples;
use crate::error::{CaptureError, ExtractError};

const I16_SCALE: f32 = 32768.0;

pub fn encode_chunk(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&to_i16(s).to_le_bytes());
    }
    bytes
}

fn to_i16(sample: f32) -> i16 {
    let s = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
    (s * (I16_SCALE - 1.0)).round() as i16
}

/// Appends the decoded samples of one chunk to `out`.
pub fn decode_chunk(bytes: &[u8], out: &mut Vec<f32>) -> Result<(), ExtractError> {
    if bytes.len() % 2 != 0 {
        return Err(ExtractError::Decode(format!(
            "chunk of {} bytes is not whole 16-bit samples",
            bytes.len()
        )));
    }
    out.reserve(bytes.len() / 2);
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / I16_SCALE),
    );
    Ok(())
}

pub fn decode_chunks<'a, I>(chunks: I) -> Result<Vec<f32>, ExtractError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    for chunk in chunks {
        decode_chunk(chunk, &mut out)?;
    }
    Ok(out)
}

/// Writes the chunk log as one mono 16-bit WAV file.
pub fn seal_wav<'a, I>(chunks: I, sample_rate: u32) -> Result<Vec<u8>, CaptureError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let wav = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let seal_err = |e: hound::Error| CaptureError::Seal(e.to_string());

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, wav).map_err(seal_err)?;
    for chunk in chunks {
        if chunk.len() % 2 != 0 {
            return Err(CaptureError::Seal(format!("chunk of {} bytes is not whole samples", chunk.len())));
        }
        for pair in chunk.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(seal_err)?;
        }
    }
    writer.finalize().map_err(seal_err)?;
    Ok(cursor.into_inner())
}

/// Decodes a sealed recording, downmixing to mono.
pub fn decode_full(blob: &[u8]) -> Result<Samples, ExtractError> {
    let decode_err = |e: hound::Error| ExtractError::Decode(e.to_string());
    let mut reader = hound::WavReader::new(Cursor::new(blob)).map_err(decode_err)?;
    let wav = reader.spec();
    let channels = wav.channels.max(1) as usize;

    let interleaved: Vec<f32> = match wav.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(decode_err)?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (wav.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(decode_err)?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(Samples {
        samples,
        sample_rate: wav.sample_rate,
        offset_secs: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_encoding_is_s16le() {
        let bytes = encode_chunk(&[0.0, 1.0, -1.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &[0, 0]);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), -32767);
    }

    #[test]
    fn test_out_of_range_samples_are_clamped() {
        let bytes = encode_chunk(&[4.0, f32::NAN]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 0);
    }

    #[test]
    fn test_decode_preserves_signal_within_quantization() {
        let input: Vec<f32> = (0..100).map(|i| (i as f32 / 50.0) - 1.0).collect();
        let a = encode_chunk(&input[..40]);
        let b = encode_chunk(&input[40..]);
        let decoded = decode_chunks([a.as_slice(), b.as_slice()]).unwrap();
        assert_eq!(decoded.len(), 100);
        for (x, y) in input.iter().zip(&decoded) {
            assert!((x - y).abs() < 1e-3);
        }
    }

    #[test]
    fn test_odd_chunk_is_decode_error() {
        let mut out = Vec::new();
        assert!(matches!(decode_chunk(&[1, 2, 3], &mut out), Err(ExtractError::Decode(_))));
    }

    #[test]
    fn test_sealed_wav_decodes() {
        let chunk = encode_chunk(&vec![0.25; 441]);
        let blob = seal_wav([chunk.as_slice(), chunk.as_slice()], 44100).unwrap();
        assert_eq!(&blob[0..4], b"RIFF");

        let decoded = decode_full(&blob).unwrap();
        assert_eq!(decoded.sample_rate, 44100);
        assert_eq!(decoded.samples.len(), 882);
        assert!((decoded.samples[0] - 0.25).abs() < 1e-3);
        assert!((decoded.duration_secs() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_garbage_blob_is_decode_error() {
        assert!(matches!(decode_full(b"not a wav file"), Err(ExtractError::Decode(_))));
    }
}
