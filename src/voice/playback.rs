//! Audio playback to speakers
//!
//! Combined output chunks are rendered one at a time through an ordered chain
//! of backends. A backend failure advances to the next one; if every backend
//! fails the chunk is dropped and the queue moves on.

use std::collections::VecDeque;
use std::io::Write as _;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{PcmFormat, pcm16_to_f32, pcm_to_wav};
use crate::{Error, Result};

/// A way of making PCM audible
///
/// Dropping the `render` future must stop any playback in flight.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Backend name, for logs and config
    fn name(&self) -> &str;

    /// Render the whole chunk, resolving once it has finished playing
    async fn render(&self, pcm: &[u8], format: PcmFormat) -> Result<()>;
}

/// Ordered list of renderers tried until one succeeds
pub struct SinkChain {
    renderers: Vec<Arc<dyn Renderer>>,
}

impl SinkChain {
    /// Create a chain from renderers in priority order
    #[must_use]
    pub fn new(renderers: Vec<Arc<dyn Renderer>>) -> Self {
        Self { renderers }
    }

    /// Names of the configured backends
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.renderers.iter().map(|r| r.name()).collect()
    }

    /// Render through the first backend that succeeds
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if every backend fails
    pub async fn render(&self, pcm: &[u8], format: PcmFormat) -> Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for renderer in &self.renderers {
            match renderer.render(pcm, format).await {
                Ok(()) => {
                    tracing::trace!(backend = renderer.name(), bytes = pcm.len(), "chunk rendered");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(
                        backend = renderer.name(),
                        error = %e,
                        "playback backend failed"
                    );
                    failures.push(format!("{}: {e}", renderer.name()));
                }
            }
        }

        Err(Error::Playback(if failures.is_empty() {
            "no playback backends configured".to_string()
        } else {
            format!("all playback backends failed ({})", failures.join("; "))
        }))
    }
}

/// FIFO of flushed chunks, drained strictly one at a time
///
/// The chunk at the front stays queued until its render attempt settles.
pub struct PlaybackQueue {
    chain: Arc<SinkChain>,
    format: PcmFormat,
    queue: VecDeque<Arc<[u8]>>,
    active: Option<JoinHandle<Result<()>>>,
}

impl PlaybackQueue {
    /// Create an idle queue rendering through `chain`
    #[must_use]
    pub const fn new(chain: Arc<SinkChain>, format: PcmFormat) -> Self {
        Self {
            chain,
            format,
            queue: VecDeque::new(),
            active: None,
        }
    }

    /// Queue a chunk, starting playback if idle
    pub fn enqueue(&mut self, chunk: Vec<u8>) {
        tracing::debug!(bytes = chunk.len(), queued = self.queue.len(), "queueing output chunk");
        self.queue.push_back(chunk.into());
        self.start_next();
    }

    /// Wait for the in-flight render to settle, then start the next chunk
    ///
    /// Returns `None` immediately when nothing is rendering. Cancel-safe.
    pub async fn settle(&mut self) -> Option<Result<()>> {
        let handle = self.active.as_mut()?;
        let outcome = handle.await;
        self.active = None;
        self.queue.pop_front();

        let result = match outcome {
            Ok(result) => result,
            Err(e) => Err(Error::Playback(format!("render task failed: {e}"))),
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "dropping output chunk");
        }

        self.start_next();
        Some(result)
    }

    /// Cancel the in-flight render and drop everything queued
    pub fn clear(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.abort();
        }
        if !self.queue.is_empty() {
            tracing::debug!(chunks = self.queue.len(), "cleared playback queue");
        }
        self.queue.clear();
    }

    /// Whether a render is in flight
    #[must_use]
    pub const fn is_rendering(&self) -> bool {
        self.active.is_some()
    }

    /// Whether nothing is playing or waiting to play
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// Chunks queued, including the one rendering
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn start_next(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(chunk) = self.queue.front().map(Arc::clone) else {
            return;
        };
        let chain = Arc::clone(&self.chain);
        let format = self.format;
        self.active = Some(tokio::spawn(async move { chain.render(&chunk, format).await }));
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Plays raw PCM through an external program reading stdin
///
/// `{rate}` and `{channels}` in the arguments are replaced with the chunk format.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    /// Create a renderer for `program` with argument template `args`
    #[must_use]
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            name: program.to_string(),
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    /// `PipeWire` client
    #[must_use]
    pub fn pw_play() -> Self {
        Self::new(
            "pw-play",
            &["--format", "s16", "--rate", "{rate}", "--channels", "{channels}", "-"],
        )
    }

    /// `PulseAudio` client
    #[must_use]
    pub fn paplay() -> Self {
        Self::new("paplay", &["--raw", "--format=s16le", "--rate={rate}", "--channels={channels}"])
    }

    /// ALSA client
    #[must_use]
    pub fn aplay() -> Self {
        Self::new(
            "aplay",
            &["-q", "-t", "raw", "-f", "S16_LE", "-r", "{rate}", "-c", "{channels}", "-"],
        )
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn render(&self, pcm: &[u8], format: PcmFormat) -> Result<()> {
        let program = which::which(&self.program)
            .map_err(|_| Error::Playback(format!("{} not found", self.program)))?;

        let args = expand_args(&self.args, format, None);
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Playback(format!("failed to spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(pcm)
                .await
                .map_err(|e| Error::Playback(format!("failed to write to {}: {e}", self.program)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Playback(format!("{} failed: {e}", self.program)))?;
        check_exit(&self.program, &output)
    }
}

/// Plays a temporary WAV file through an external player
///
/// `{path}` in the arguments is replaced with the file path; without it the
/// path is appended.
#[derive(Debug, Clone)]
pub struct WavFileRenderer {
    name: String,
    program: String,
    args: Vec<String>,
}

impl WavFileRenderer {
    /// Create a renderer for `program` with argument template `args`
    #[must_use]
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            name: program.to_string(),
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    /// macOS built-in player
    #[must_use]
    pub fn afplay() -> Self {
        Self::new("afplay", &[])
    }

    /// `FFmpeg` player
    #[must_use]
    pub fn ffplay() -> Self {
        Self::new("ffplay", &["-nodisp", "-autoexit", "-loglevel", "quiet", "{path}"])
    }

    /// `SoX` player
    #[must_use]
    pub fn sox_play() -> Self {
        Self::new("play", &["-q", "{path}"])
    }

    /// Windows `SoundPlayer` via `PowerShell`
    #[must_use]
    pub fn powershell() -> Self {
        Self::new(
            "powershell",
            &["-NoProfile", "-Command", "(New-Object Media.SoundPlayer '{path}').PlaySync()"],
        )
    }
}

#[async_trait]
impl Renderer for WavFileRenderer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn render(&self, pcm: &[u8], format: PcmFormat) -> Result<()> {
        let program = which::which(&self.program)
            .map_err(|_| Error::Playback(format!("{} not found", self.program)))?;

        let mut file = tempfile::Builder::new()
            .prefix("beacon-live-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| Error::Playback(format!("failed to create temp file: {e}")))?;
        let wav = pcm_to_wav(format, pcm)?;
        file.write_all(&wav)
            .and_then(|()| file.flush())
            .map_err(|e| Error::Playback(format!("failed to write temp file: {e}")))?;

        let path = file.path().to_string_lossy().to_string();
        let args = expand_args(&self.args, format, Some(&path));

        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Playback(format!("failed to run {}: {e}", self.program)))?;

        // Temp file is removed when `file` drops, after the player exits
        drop(file);
        check_exit(&self.program, &output)
    }
}

fn expand_args(template: &[String], format: PcmFormat, path: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = template
        .iter()
        .map(|a| {
            let a = a
                .replace("{rate}", &format.sample_rate.to_string())
                .replace("{channels}", &format.channels.to_string());
            match path {
                Some(p) => a.replace("{path}", p),
                None => a,
            }
        })
        .collect();

    if let Some(p) = path {
        if !template.iter().any(|a| a.contains("{path}")) {
            args.push(p.to_string());
        }
    }
    args
}

fn check_exit(program: &str, output: &std::process::Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(Error::Playback(format!(
        "{program} exited with {}: {}",
        output.status,
        stderr.trim()
    )))
}

/// Plays through the default output device in-process
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalRenderer;

#[async_trait]
impl Renderer for CpalRenderer {
    fn name(&self) -> &str {
        "cpal"
    }

    async fn render(&self, pcm: &[u8], format: PcmFormat) -> Result<()> {
        let samples = pcm16_to_f32(pcm);
        let stop = Arc::new(AtomicBool::new(false));
        let _guard = StopOnDrop(Arc::clone(&stop));

        tokio::task::spawn_blocking(move || play_blocking(&samples, format, &stop))
            .await
            .map_err(|e| Error::Playback(format!("playback thread failed: {e}")))?
    }
}

/// Signals the blocking playback thread when the render future is dropped
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn play_blocking(samples: &[f32], format: PcmFormat, stop: &AtomicBool) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

    let rate = SampleRate(format.sample_rate);
    let supported = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
    };
    let config = supported(1)
        .or_else(|| supported(2))
        .ok_or_else(|| Error::Playback("no suitable output config found".to_string()))?
        .with_sample_rate(rate)
        .config();
    let channels = usize::from(config.channels);

    let samples: Arc<[f32]> = samples.into();
    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let finished = Arc::clone(&finished);
        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let pos = position.load(Ordering::Relaxed);
                        let sample = if pos < samples.len() {
                            position.store(pos + 1, Ordering::Relaxed);
                            samples[pos]
                        } else {
                            finished.store(true, Ordering::Relaxed);
                            0.0
                        };
                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Playback(e.to_string()))?
    };

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let sample_count = u64::try_from(samples.len()).unwrap_or(u64::MAX);
    let per_second = u64::from(format.sample_rate.max(1));
    let duration = Duration::from_millis(sample_count.saturating_mul(1000) / per_second);
    let deadline = std::time::Instant::now() + duration + Duration::from_millis(500);

    while !finished.load(Ordering::Relaxed) && !stop.load(Ordering::SeqCst) {
        if std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    drop(stream);
    tracing::trace!(samples = samples.len(), "cpal playback complete");
    Ok(())
}

/// Platform default playback chain
#[must_use]
pub fn default_renderers() -> Vec<Arc<dyn Renderer>> {
    let mut chain: Vec<Arc<dyn Renderer>> = vec![Arc::new(CpalRenderer)];

    if cfg!(target_os = "macos") {
        chain.push(Arc::new(WavFileRenderer::afplay()));
    } else if cfg!(target_os = "windows") {
        chain.push(Arc::new(WavFileRenderer::powershell()));
    } else {
        chain.push(Arc::new(CommandRenderer::pw_play()));
        chain.push(Arc::new(CommandRenderer::paplay()));
        chain.push(Arc::new(CommandRenderer::aplay()));
    }
    chain.push(Arc::new(WavFileRenderer::ffplay()));
    chain.push(Arc::new(WavFileRenderer::sox_play()));
    chain
}

/// Look up a playback backend by config name
#[must_use]
pub fn renderer_by_name(name: &str) -> Option<Arc<dyn Renderer>> {
    let renderer: Arc<dyn Renderer> = match name {
        "cpal" => Arc::new(CpalRenderer),
        "pw-play" => Arc::new(CommandRenderer::pw_play()),
        "paplay" => Arc::new(CommandRenderer::paplay()),
        "aplay" => Arc::new(CommandRenderer::aplay()),
        "afplay" => Arc::new(WavFileRenderer::afplay()),
        "ffplay" => Arc::new(WavFileRenderer::ffplay()),
        "play" | "sox" => Arc::new(WavFileRenderer::sox_play()),
        "powershell" => Arc::new(WavFileRenderer::powershell()),
        _ => return None,
    };
    Some(renderer)
}
