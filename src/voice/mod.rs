//! Voice processing module
//!
//! Handles microphone capture, output buffering and playback for live sessions.

mod buffer;
mod capture;
mod playback;
mod wav;

pub use buffer::{DEFAULT_FLUSH_DELAY, DEFAULT_MIN_FLUSH_BYTES, OutputBuffer};
pub use capture::{
    CaptureEvent, CaptureSource, CaptureStream, CommandSource, CpalSource, DEFAULT_FRAME_BYTES,
    MicCapture, capture_source_by_name, default_capture_sources,
};
pub use playback::{
    CommandRenderer, CpalRenderer, PlaybackQueue, Renderer, SinkChain, WavFileRenderer,
    default_renderers, renderer_by_name,
};
pub use wav::{WAV_HEADER_LEN, pcm_to_wav};

/// Raw PCM layout (always signed little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Samples per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Bits per sample
    pub bits_per_sample: u16,
}

/// Microphone audio sent to the model: 16 kHz, 16-bit, mono
pub const INPUT_FORMAT: PcmFormat = PcmFormat {
    sample_rate: 16_000,
    channels: 1,
    bits_per_sample: 16,
};

/// Model audio received for playback: 24 kHz, 16-bit, mono
pub const OUTPUT_FORMAT: PcmFormat = PcmFormat {
    sample_rate: 24_000,
    channels: 1,
    bits_per_sample: 16,
};

impl PcmFormat {
    /// Bytes per sample frame (all channels)
    #[must_use]
    pub const fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    /// Bytes per second of audio
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }
}

/// Decode signed 16-bit little-endian PCM into `[-1.0, 1.0]` samples
#[must_use]
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect()
}

/// Encode `[-1.0, 1.0]` samples as signed 16-bit little-endian PCM
#[must_use]
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// RMS energy of 16-bit PCM, normalized to `[0.0, 1.0]`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(pcm: &[u8]) -> f32 {
    let samples = pcm16_to_f32(pcm);
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
