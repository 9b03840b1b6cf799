use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use beacon_live::live::{FunctionCall, WebSocketConnector};
use beacon_live::voice::{
    self, CaptureEvent, INPUT_FORMAT, MicCapture, OUTPUT_FORMAT, OutputBuffer, PlaybackQueue,
    SinkChain,
};
use beacon_live::{
    Config, Coordinator, Error, LiveSession, ManifestTools, Mode, NoTools, ToolExecutor,
    TurnObserver,
};

/// Beacon Live - talk to a live model through your microphone and speakers
#[derive(Parser)]
#[command(name = "beacon-live", version, about)]
struct Cli {
    /// Session mode: text, voice or both
    #[arg(short, long, env = "BEACON_LIVE_MODE")]
    mode: Option<Mode>,

    /// Live model identifier
    #[arg(long, env = "BEACON_LIVE_MODEL")]
    model: Option<String>,

    /// Prebuilt voice name
    #[arg(long, env = "BEACON_LIVE_VOICE")]
    voice: Option<String>,

    /// Tool manifest (TOML)
    #[arg(long, env = "BEACON_LIVE_TOOLS")]
    tools: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// List the tools offered to the model
    Tools,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_live=info",
        1 => "info,beacon_live=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(model) = cli.model {
        config.live.model = model;
    }
    if let Some(voice) = cli.voice {
        config.live.voice = voice;
    }
    if cli.tools.is_some() {
        config.tools_manifest = cli.tools;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, output } => {
                test_mic(&config, duration, output.as_deref()).await
            }
            Command::TestSpeaker => test_speaker(&config).await,
            Command::Tools => list_tools(&config).await,
        };
    }

    run_session(config).await
}

/// Run a live session until Ctrl-C or the connection ends
async fn run_session(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        mode = %config.mode,
        model = %config.live.model,
        voice = %config.live.voice,
        "starting beacon live"
    );
    tracing::debug!(?config, "loaded configuration");

    if config.live.api_key.is_none() {
        tracing::warn!(
            "no API key configured (set GEMINI_API_KEY); the server will likely refuse the session"
        );
    }

    let tools = load_tools(&config)?;
    let connector = Arc::new(WebSocketConnector::new(
        &config.live.url,
        config.live.api_key.as_deref(),
    ));
    let session = LiveSession::new(connector).with_setup_timeout(config.live.setup_timeout);

    let renderers = if config.mode.listens() {
        config.audio.renderers()?
    } else {
        Vec::new()
    };
    let chain = Arc::new(SinkChain::new(renderers));
    tracing::debug!(backends = ?chain.names(), "playback chain");
    let playback = PlaybackQueue::new(chain, OUTPUT_FORMAT);
    let output = OutputBuffer::new(config.audio.min_flush_bytes, config.audio.flush_delay);

    let capture = if config.mode.listens() {
        Some(MicCapture::new(
            config.audio.capture_sources()?,
            INPUT_FORMAT,
            config.audio.frame_bytes,
        ))
    } else {
        None
    };

    let mut coordinator = Coordinator::new(
        session,
        tools,
        output,
        playback,
        capture,
        config.audio.timing,
    )
    .with_observer(Box::new(ConsoleObserver::default()));

    coordinator.connect(config.setup_params()).await?;
    if let Some(params) = coordinator.session().params() {
        tracing::debug!(
            model = %params.model,
            modality = ?params.modality,
            tools = params.tools.len(),
            "session negotiated"
        );
    }

    let listening = coordinator.is_listening();
    if config.mode.listens() && !listening {
        tracing::warn!("no microphone, falling back to typed input");
    }

    let (input_tx, input_rx) = mpsc::channel(16);
    if config.mode.reads_input() || !listening {
        tokio::spawn(read_stdin_lines(input_tx));
    } else {
        drop(input_tx);
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    if listening {
        tracing::info!("beacon live ready - start talking");
    } else {
        tracing::info!("beacon live ready - type a message");
    }

    coordinator.run(input_rx, &mut shutdown_rx).await?;
    tracing::info!(turns = coordinator.session().turns_completed(), "session ended");
    Ok(())
}

/// Forward stdin lines until EOF
async fn read_stdin_lines(tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stdin");
                break;
            }
        }
    }
}

fn load_tools(config: &Config) -> anyhow::Result<Arc<dyn ToolExecutor>> {
    Ok(match &config.tools_manifest {
        Some(path) => Arc::new(ManifestTools::load(path)?),
        None => Arc::new(NoTools),
    })
}

/// Prints the conversation to stdout
#[derive(Default)]
struct ConsoleObserver {
    mid_line: bool,
}

impl ConsoleObserver {
    fn stream(&mut self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
        self.mid_line = true;
    }

    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

impl TurnObserver for ConsoleObserver {
    fn on_output_text(&mut self, text: &str) {
        self.stream(text);
    }

    fn on_input_transcription(&mut self, text: &str) {
        self.end_line();
        println!("you: {}", text.trim());
    }

    fn on_output_transcription(&mut self, text: &str) {
        self.stream(text);
    }

    fn on_tool_call(&mut self, calls: &[FunctionCall]) {
        self.end_line();
        for call in calls {
            println!("[tool] {}({})", call.name, call.args);
        }
    }

    fn on_turn_complete(&mut self) {
        self.end_line();
    }

    fn on_interrupted(&mut self) {
        self.end_line();
        println!("[interrupted]");
    }

    fn on_server_error(&mut self, error: &Value) {
        self.end_line();
        eprintln!("server error: {error}");
    }

    fn on_capture_error(&mut self, error: &Error) {
        self.end_line();
        eprintln!("microphone error: {error}");
    }
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64, output: Option<&Path>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = MicCapture::new(
        config.audio.capture_sources()?,
        INPUT_FORMAT,
        config.audio.frame_bytes,
    );
    capture.start().await?;

    println!(
        "Source: {} ({} Hz, {} frames of {} bytes)",
        capture.source().unwrap_or("unknown"),
        INPUT_FORMAT.sample_rate,
        if INPUT_FORMAT.channels == 1 { "mono" } else { "multichannel" },
        capture.frame_bytes()
    );
    println!("---");

    let mut writer = output
        .map(|path| {
            hound::WavWriter::create(
                path,
                hound::WavSpec {
                    channels: INPUT_FORMAT.channels,
                    sample_rate: INPUT_FORMAT.sample_rate,
                    bits_per_sample: INPUT_FORMAT.bits_per_sample,
                    sample_format: hound::SampleFormat::Int,
                },
            )
        })
        .transpose()?;

    #[allow(clippy::cast_possible_truncation)]
    let second_bytes = INPUT_FORMAT.byte_rate() as usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut window = Vec::with_capacity(second_bytes);
    let mut seconds = 0;

    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, capture.recv()).await {
        let frame = match event {
            CaptureEvent::Frame(frame) => frame,
            CaptureEvent::Error(e) => return Err(e.into()),
        };

        if let Some(writer) = writer.as_mut() {
            for sample in frame.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
            }
        }

        window.extend_from_slice(&frame);
        if window.len() >= second_bytes {
            seconds += 1;
            print_meter(seconds, &window);
            window.clear();
        }
    }

    capture.stop();

    if let (Some(writer), Some(path)) = (writer, output) {
        writer.finalize()?;
        println!("\nWrote {}", path.display());
    }

    println!("\n---");
    println!("A flat meter near 0 means the source is silent: check levels with pavucontrol,");
    println!(
        "or pick another source with `capture = [\"arecord\"]` under [audio] in the config file."
    );

    Ok(())
}

fn print_meter(second: u64, pcm: &[u8]) {
    let energy = voice::rms(pcm);
    let peak = voice::pcm16_to_f32(pcm)
        .iter()
        .map(|s| s.abs())
        .fold(0.0f32, f32::max);

    // Visual meter
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let meter_len = (energy * 100.0).min(50.0) as usize;
    let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

    println!("[{second:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]");
}

/// Test speaker output with a sine wave
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let chain = SinkChain::new(config.audio.renderers()?);
    println!("Backends: {}", chain.names().join(", "));

    let sample_rate = OUTPUT_FORMAT.sample_rate;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_possible_truncation)]
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    chain.render(&voice::f32_to_pcm16(&samples), OUTPUT_FORMAT).await?;

    println!("\n---");
    println!(
        "No tone? Pick another backend with `playback = [\"paplay\"]` under [audio] in the config."
    );

    Ok(())
}

/// Print the tool declarations offered at setup
async fn list_tools(config: &Config) -> anyhow::Result<()> {
    let tools = load_tools(config)?;
    let declarations = tools.list_tools().await?;

    if declarations.is_empty() {
        println!("No tools configured (set BEACON_LIVE_TOOLS or [tools] manifest)");
        return Ok(());
    }

    for decl in declarations {
        println!("{} - {}", decl.name, decl.description);
        if let Some(params) = decl.parameters {
            println!("    parameters: {params}");
        }
    }
    Ok(())
}
