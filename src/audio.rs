//! Thin wrappers around WAV reading and writing. The rest of the crate works on `i16` sample
//! slices; this is the only module that should touch `hound` directly.
use crate::WAV_SPEC;
use anyhow::Context;
use hound::{WavReader, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::warn;

/// Read a mono 16-bit WAV into samples. Files at other rates are accepted with a warning, the
/// caller gets whatever rate was recorded.
pub fn read_wav_samples(path: impl AsRef<Path>) -> anyhow::Result<Vec<i16>> {
    let path = path.as_ref();
    let mut reader =
        WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != WAV_SPEC.channels || spec.sample_rate != WAV_SPEC.sample_rate {
        warn!(
            "{} is {} channel(s) at {} Hz, expected mono at {} Hz",
            path.display(),
            spec.channels,
            spec.sample_rate,
            WAV_SPEC.sample_rate
        );
    }
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<i16>, _>>()
        .with_context(|| format!("reading samples from {}", path.display()))?;
    Ok(samples)
}

pub fn create_wav_writer(output: &Path) -> anyhow::Result<WavWriter<BufWriter<File>>> {
    let w = WavWriter::create(output, WAV_SPEC)
        .with_context(|| format!("creating {}", output.display()))?;
    Ok(w)
}

/// Reinterpret little-endian PCM bytes as samples. Chunks arrive from capture sources as opaque
/// byte buffers; a trailing odd byte is a caller bug.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    assert!(bytes.len() % 2 == 0, "PCM byte buffer has odd length");
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(bytes_to_samples(&bytes), samples);
    }

    #[test]
    #[should_panic]
    fn odd_byte_buffer_panics() {
        bytes_to_samples(&[0u8, 1, 2]);
    }
}
