//! Audio capture from microphone
//!
//! A capture source produces a continuous raw byte stream (16 kHz, 16-bit,
//! mono). [`MicCapture`] re-frames it into fixed 100 ms frames. Pausing only
//! suppresses frames: the source keeps running so the device stays owned.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{PcmFormat, f32_to_pcm16};
use crate::{Error, Result};

/// 100 ms of 16 kHz 16-bit mono audio
pub const DEFAULT_FRAME_BYTES: usize = 3_200;

/// How long an external recorder may take to produce its first bytes
const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Read size for external recorder stdout
const READ_CHUNK: usize = 4096;

/// Byte chunks buffered between a source and the pipeline
const STREAM_CAPACITY: usize = 256;

/// Something captured by the microphone pipeline
#[derive(Debug)]
pub enum CaptureEvent {
    /// One full frame of PCM
    Frame(Vec<u8>),
    /// The source failed; capture has stopped
    Error(Error),
}

/// Running byte stream from a capture source
///
/// Dropping it stops the source.
pub struct CaptureStream {
    rx: mpsc::Receiver<Result<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
    _stop: Option<oneshot::Sender<()>>,
}

impl CaptureStream {
    /// Wrap a receiver fed by some external producer
    #[must_use]
    pub const fn from_receiver(rx: mpsc::Receiver<Result<Vec<u8>>>) -> Self {
        Self {
            rx,
            task: None,
            _stop: None,
        }
    }

    /// Stream whose producer is a task aborted on drop
    #[must_use]
    pub const fn with_task(rx: mpsc::Receiver<Result<Vec<u8>>>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
            _stop: None,
        }
    }

    /// Stream whose producer watches `stop` and exits once it is dropped
    #[must_use]
    pub const fn with_stop_signal(
        rx: mpsc::Receiver<Result<Vec<u8>>>,
        stop: oneshot::Sender<()>,
    ) -> Self {
        Self {
            rx,
            task: None,
            _stop: Some(stop),
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A platform strategy for opening the microphone
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Strategy name, for logs and config
    fn name(&self) -> &str;

    /// Start producing raw PCM in `format`
    async fn open(&self, format: PcmFormat) -> Result<CaptureStream>;
}

/// Microphone capture pipeline
pub struct MicCapture {
    sources: Vec<Arc<dyn CaptureSource>>,
    format: PcmFormat,
    frame_bytes: usize,
    rolling: Vec<u8>,
    ready: VecDeque<Vec<u8>>,
    paused: bool,
    stream: Option<CaptureStream>,
    source: Option<String>,
}

impl MicCapture {
    /// Create a stopped pipeline over sources in priority order
    #[must_use]
    pub fn new(
        sources: Vec<Arc<dyn CaptureSource>>,
        format: PcmFormat,
        frame_bytes: usize,
    ) -> Self {
        Self {
            sources,
            format,
            frame_bytes: frame_bytes.max(1),
            rolling: Vec::new(),
            ready: VecDeque::new(),
            paused: false,
            stream: None,
            source: None,
        }
    }

    /// Open the first capture source that works
    ///
    /// # Errors
    ///
    /// Returns `Error::Capture` if every source fails
    pub async fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for source in &self.sources {
            match source.open(self.format).await {
                Ok(stream) => {
                    tracing::info!(source = source.name(), "microphone capture started");
                    self.stream = Some(stream);
                    self.source = Some(source.name().to_string());
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(source = source.name(), error = %e, "capture source failed");
                    failures.push(format!("{}: {e}", source.name()));
                }
            }
        }

        Err(Error::Capture(if failures.is_empty() {
            "no capture sources configured".to_string()
        } else {
            format!("no usable microphone ({})", failures.join("; "))
        }))
    }

    /// Next unpaused frame, or the error that stopped capture
    ///
    /// Returns `None` when capture is not running. Cancel-safe.
    pub async fn recv(&mut self) -> Option<CaptureEvent> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(CaptureEvent::Frame(frame));
            }

            let stream = self.stream.as_mut()?;
            match stream.rx.recv().await {
                Some(Ok(bytes)) => self.ingest(&bytes),
                Some(Err(e)) => {
                    self.stop();
                    return Some(CaptureEvent::Error(e));
                }
                None => {
                    self.stop();
                    return Some(CaptureEvent::Error(Error::Capture(
                        "capture source ended".to_string(),
                    )));
                }
            }
        }
    }

    /// Suppress outgoing frames without releasing the device
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.ready.clear();
        tracing::debug!("microphone paused");
    }

    /// Resume emitting frames
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        tracing::debug!("microphone resumed");
    }

    /// Stop the source and clear all buffered audio
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(source = ?self.source, "microphone capture stopped");
        }
        self.source = None;
        self.rolling.clear();
        self.ready.clear();
        self.paused = false;
    }

    /// Whether a source is running
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether frames are currently suppressed
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Name of the running source
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Frame size in bytes
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.rolling.extend_from_slice(bytes);

        while self.rolling.len() >= self.frame_bytes {
            let frame: Vec<u8> = self.rolling.drain(..self.frame_bytes).collect();
            if self.paused {
                tracing::trace!("dropping frame while paused");
            } else {
                self.ready.push_back(frame);
            }
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Captures via an external recorder writing raw PCM to stdout
///
/// `{rate}` and `{channels}` in the arguments are replaced with the format.
#[derive(Debug, Clone)]
pub struct CommandSource {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandSource {
    /// Create a source for `program` with argument template `args`
    #[must_use]
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            name: program.to_string(),
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    /// `PipeWire` recorder
    #[must_use]
    pub fn pw_record() -> Self {
        Self::new(
            "pw-record",
            &["--format", "s16", "--rate", "{rate}", "--channels", "{channels}", "-"],
        )
    }

    /// `PulseAudio` recorder
    #[must_use]
    pub fn parec() -> Self {
        Self::new("parec", &["--raw", "--format=s16le", "--rate={rate}", "--channels={channels}"])
    }

    /// ALSA recorder
    #[must_use]
    pub fn arecord() -> Self {
        Self::new(
            "arecord",
            &["-q", "-t", "raw", "-f", "S16_LE", "-r", "{rate}", "-c", "{channels}", "-"],
        )
    }

    /// `SoX` recorder on the default device
    #[must_use]
    pub fn sox() -> Self {
        Self::new(
            "sox",
            &[
                "-q", "-d", "-t", "raw", "-b", "16", "-e", "signed-integer", "-L", "-r", "{rate}",
                "-c", "{channels}", "-",
            ],
        )
    }

    /// `FFmpeg` recorder on the macOS default input
    #[must_use]
    pub fn ffmpeg_avfoundation() -> Self {
        Self::new(
            "ffmpeg",
            &[
                "-hide_banner", "-loglevel", "error", "-f", "avfoundation", "-i", ":0", "-ac",
                "{channels}", "-ar", "{rate}", "-f", "s16le", "-",
            ],
        )
    }

    fn args(&self, format: PcmFormat) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{rate}", &format.sample_rate.to_string())
                    .replace("{channels}", &format.channels.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl CaptureSource for CommandSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, format: PcmFormat) -> Result<CaptureStream> {
        let program = which::which(&self.program)
            .map_err(|_| Error::Capture(format!("{} not found", self.program)))?;

        let mut child = Command::new(program)
            .args(self.args(format))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Capture(format!("failed to spawn {}: {e}", self.program)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Capture(format!("{} has no stdout", self.program)))?;

        // A recorder that cannot open its device exits before producing audio
        let mut first = vec![0u8; READ_CHUNK];
        let n = tokio::time::timeout(FIRST_READ_TIMEOUT, stdout.read(&mut first))
            .await
            .map_err(|_| Error::Capture(format!("{} produced no audio", self.program)))?
            .map_err(|e| Error::Capture(format!("{} read failed: {e}", self.program)))?;
        if n == 0 {
            return Err(Error::Capture(format!("{} exited without audio", self.program)));
        }
        first.truncate(n);

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let program = self.program.clone();
        let task = tokio::spawn(async move {
            // Owning the child here keeps the recorder alive until abort
            let _child = child;
            if tx.send(Ok(first)).await.is_err() {
                return;
            }
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => {
                        let _ = tx
                            .send(Err(Error::Capture(format!("{program} stopped producing audio"))))
                            .await;
                        return;
                    }
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::Capture(format!("{program} read failed: {e}"))))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(CaptureStream::with_task(rx, task))
    }
}

/// Captures in-process from the first usable input device
///
/// Devices are enumerated default-first; the first one offering the format
/// (mono, or stereo downmixed) is used.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSource;

#[async_trait]
impl CaptureSource for CpalSource {
    fn name(&self) -> &str {
        "cpal"
    }

    async fn open(&self, format: PcmFormat) -> Result<CaptureStream> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        // cpal streams are not Send; the stream lives on its own thread
        std::thread::Builder::new()
            .name("beacon-live-capture".to_string())
            .spawn(move || run_cpal_capture(format, tx, ready_tx, stop_rx))
            .map_err(|e| Error::Capture(format!("failed to spawn capture thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| Error::Capture("capture thread exited".to_string()))??;

        Ok(CaptureStream::with_stop_signal(rx, stop_tx))
    }
}

fn run_cpal_capture(
    format: PcmFormat,
    tx: mpsc::Sender<Result<Vec<u8>>>,
    ready: oneshot::Sender<Result<()>>,
    stop: oneshot::Receiver<()>,
) {
    let stream = match build_cpal_input(format, tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(Error::Capture(e.to_string())));
        return;
    }
    if ready.send(Ok(())).is_err() {
        return;
    }

    // Resolves when the CaptureStream holding the sender is dropped
    let _ = stop.blocking_recv();
    drop(stream);
}

fn build_cpal_input(format: PcmFormat, tx: mpsc::Sender<Result<Vec<u8>>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let rate = SampleRate(format.sample_rate);

    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let mut devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| Error::Capture(e.to_string()))?
        .collect();
    devices.sort_by_key(|d| d.name().ok() != default_name);

    for device in devices {
        let name = device.name().unwrap_or_default();
        let Some(range) = device.supported_input_configs().ok().and_then(|mut configs| {
            configs.find(|c| {
                (c.channels() == 1 || c.channels() == 2)
                    && c.sample_format() == SampleFormat::F32
                    && c.min_sample_rate() <= rate
                    && c.max_sample_rate() >= rate
            })
        }) else {
            tracing::debug!(device = %name, "input device lacks a usable config");
            continue;
        };

        let config = range.with_sample_rate(rate).config();
        let channels = usize::from(config.channels);
        let scale = 1.0 / f32::from(config.channels.max(1));
        let data_tx = tx.clone();
        let err_tx = tx.clone();

        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = if channels == 1 {
                    data.to_vec()
                } else {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() * scale)
                        .collect()
                };
                if data_tx.try_send(Ok(f32_to_pcm16(&mono))).is_err() {
                    tracing::trace!("capture channel full, dropping samples");
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                let _ = err_tx.try_send(Err(Error::Capture(err.to_string())));
            },
            None,
        );

        match stream {
            Ok(stream) => {
                tracing::debug!(
                    device = %name,
                    sample_rate = format.sample_rate,
                    channels,
                    "audio capture initialized"
                );
                return Ok(stream);
            }
            Err(e) => tracing::debug!(device = %name, error = %e, "failed to open input device"),
        }
    }

    Err(Error::Capture("no input device supports the capture format".to_string()))
}

/// Platform default capture chain
#[must_use]
pub fn default_capture_sources() -> Vec<Arc<dyn CaptureSource>> {
    let mut chain: Vec<Arc<dyn CaptureSource>> = vec![Arc::new(CpalSource)];

    if cfg!(target_os = "macos") {
        chain.push(Arc::new(CommandSource::ffmpeg_avfoundation()));
    } else if cfg!(target_os = "linux") {
        chain.push(Arc::new(CommandSource::pw_record()));
        chain.push(Arc::new(CommandSource::parec()));
        chain.push(Arc::new(CommandSource::arecord()));
    }
    chain.push(Arc::new(CommandSource::sox()));
    chain
}

/// Look up a capture source by config name
#[must_use]
pub fn capture_source_by_name(name: &str) -> Option<Arc<dyn CaptureSource>> {
    let source: Arc<dyn CaptureSource> = match name {
        "cpal" => Arc::new(CpalSource),
        "pw-record" => Arc::new(CommandSource::pw_record()),
        "parec" => Arc::new(CommandSource::parec()),
        "arecord" => Arc::new(CommandSource::arecord()),
        "sox" => Arc::new(CommandSource::sox()),
        "ffmpeg" => Arc::new(CommandSource::ffmpeg_avfoundation()),
        _ => return None,
    };
    Some(source)
}
