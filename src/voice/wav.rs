//! WAV container for raw PCM
//!
//! Some external players only accept self-describing files, so raw PCM is
//! wrapped with the canonical 44-byte header.

use super::PcmFormat;
use crate::error::{Error, Result};

/// Length of the canonical PCM WAV header
pub const WAV_HEADER_LEN: usize = 44;

/// Wrap signed 16-bit little-endian PCM in a WAV container
///
/// A trailing odd byte is dropped.
///
/// # Errors
///
/// Returns `Error::Playback` if the format is not 16-bit or encoding fails
pub fn pcm_to_wav(format: PcmFormat, pcm: &[u8]) -> Result<Vec<u8>> {
    if format.bits_per_sample != 16 {
        return Err(Error::Playback(format!(
            "unsupported sample width: {} bits",
            format.bits_per_sample
        )));
    }

    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + pcm.len()));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::Playback(format!("failed to start wav: {e}")))?;

        for sample in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
                .map_err(|e| Error::Playback(format!("failed to write sample: {e}")))?;
        }

        writer
            .finalize()
            .map_err(|e| Error::Playback(format!("failed to finish wav: {e}")))?;
    }

    Ok(cursor.into_inner())
}
