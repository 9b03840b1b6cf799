//! Shared test utilities
//!
//! In-memory stand-ins for the network, speakers, microphone and tools.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use beacon_live::coordinator::{Coordinator, TurnObserver, TurnTiming};
use beacon_live::error::ConnectionError;
use beacon_live::live::{Connector, FunctionCall, LiveSession, Modality, SetupParams, Transport};
use beacon_live::voice::{
    CaptureSource, CaptureStream, INPUT_FORMAT, MicCapture, OUTPUT_FORMAT, OutputBuffer,
    PcmFormat, PlaybackQueue, Renderer, SinkChain,
};
use beacon_live::{Error, Result, ToolDeclaration, ToolExecutor};

/// Server side of one mock connection
pub struct MockServer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockServer {
    /// Push a raw payload to the client
    pub fn send_raw(&self, raw: &str) {
        let _ = self.to_client.send(raw.to_string());
    }

    /// Push a JSON payload to the client
    pub fn send(&self, value: &Value) {
        self.send_raw(&value.to_string());
    }

    /// Acknowledge the setup handshake
    pub fn ack(&self) {
        self.send(&json!({ "setupComplete": {} }));
    }

    /// One output-audio fragment of `len` bytes
    pub fn send_audio(&self, len: usize) {
        use base64::Engine as _;
        let data = base64::engine::general_purpose::STANDARD.encode(vec![1u8; len]);
        self.send(&json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": data } }
                ] }
            }
        }));
    }

    pub fn send_turn_complete(&self) {
        self.send(&json!({ "serverContent": { "turnComplete": true } }));
    }

    pub fn send_interrupted(&self) {
        self.send(&json!({ "serverContent": { "interrupted": true } }));
    }

    /// Next message from the client, parsed
    pub async fn next_json(&mut self) -> Option<Value> {
        let raw = self.from_client.recv().await?;
        Some(serde_json::from_str(&raw).expect("client sent invalid JSON"))
    }

    /// Next message from the client, or `None` if nothing arrives in `wait`
    pub async fn next_within(&mut self, wait: Duration) -> Option<Value> {
        tokio::time::timeout(wait, self.next_json()).await.ok().flatten()
    }

    /// Next client message whose top-level key is `kind`, skipping others
    pub async fn next_of_kind(&mut self, kind: &str, wait: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.next_json())
                .await
                .ok()
                .flatten()?;
            if msg.get(kind).is_some() {
                return Some(msg);
            }
        }
    }

    /// Drop everything the client has sent so far
    pub fn drain(&mut self) -> Vec<Value> {
        let mut drained = Vec::new();
        while let Ok(raw) = self.from_client.try_recv() {
            drained.push(serde_json::from_str(&raw).expect("client sent invalid JSON"));
        }
        drained
    }
}

struct MockTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, payload: String) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(ConnectionError::Closed)?;
        tx.send(payload)
            .map_err(|_| Error::from(ConnectionError::Transport("server gone".to_string())))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

/// Hands a fresh [`MockServer`] to the test for every connect
pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        self.servers
            .send(MockServer {
                to_client,
                from_client,
            })
            .map_err(|_| Error::from(ConnectionError::Transport("no server".to_string())))?;
        Ok(Box::new(MockTransport {
            tx: Some(client_tx),
            rx: client_rx,
        }))
    }
}

pub fn mock_connector() -> (Arc<MockConnector>, mpsc::UnboundedReceiver<MockServer>) {
    let (servers, rx) = mpsc::unbounded_channel();
    (Arc::new(MockConnector { servers }), rx)
}

pub fn setup_params() -> SetupParams {
    SetupParams {
        model: "models/test-live".to_string(),
        voice: "Puck".to_string(),
        system_instruction: Some("Be brief.".to_string()),
        tools: Vec::new(),
        modality: Modality::Audio,
    }
}

/// Speaker that records chunk sizes and takes `delay` to play each one
#[derive(Clone, Default)]
pub struct RecordingRenderer {
    pub started: Arc<Mutex<Vec<usize>>>,
    pub finished: Arc<Mutex<Vec<usize>>>,
    pub delay: Duration,
}

impl RecordingRenderer {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn started(&self) -> Vec<usize> {
        self.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<usize> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl Renderer for RecordingRenderer {
    fn name(&self) -> &str {
        "recording"
    }

    async fn render(&self, pcm: &[u8], _format: PcmFormat) -> Result<()> {
        self.started.lock().unwrap().push(pcm.len());
        tokio::time::sleep(self.delay).await;
        self.finished.lock().unwrap().push(pcm.len());
        Ok(())
    }
}

/// Microphone fed by the test through a channel
pub struct ChannelSource {
    rx: Mutex<Option<mpsc::Receiver<Result<Vec<u8>>>>>,
}

impl ChannelSource {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Result<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                rx: Mutex::new(Some(rx)),
            }),
            tx,
        )
    }
}

#[async_trait]
impl CaptureSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn open(&self, _format: PcmFormat) -> Result<CaptureStream> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Capture("already opened".to_string()))?;
        Ok(CaptureStream::from_receiver(rx))
    }
}

/// Tools that succeed unless their name starts with "fail"
#[derive(Clone, Default)]
pub struct ScriptedTools {
    pub calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ToolExecutor for ScriptedTools {
    async fn list_tools(&self) -> Result<Vec<ToolDeclaration>> {
        Ok(vec![
            ToolDeclaration {
                name: "get_time".to_string(),
                description: "Current time".to_string(),
                parameters: None,
            },
            ToolDeclaration {
                name: "fail_always".to_string(),
                description: "Always fails".to_string(),
                parameters: None,
            },
        ])
    }

    async fn execute(&self, name: &str, args: Value) -> Result<Value> {
        self.calls.lock().unwrap().push(name.to_string());
        if name.starts_with("fail") {
            return Err(Error::Tool(format!("{name} broke")));
        }
        Ok(json!({ "tool": name, "args": args }))
    }
}

/// Records observer callbacks as short strings
#[derive(Clone, Default)]
pub struct RecordingObserver {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl TurnObserver for RecordingObserver {
    fn on_output_text(&mut self, text: &str) {
        self.push(format!("text:{text}"));
    }

    fn on_input_transcription(&mut self, text: &str) {
        self.push(format!("heard:{text}"));
    }

    fn on_tool_call(&mut self, calls: &[FunctionCall]) {
        self.push(format!("tool_call:{}", calls.len()));
    }

    fn on_turn_complete(&mut self) {
        self.push("turn_complete".to_string());
    }

    fn on_interrupted(&mut self) {
        self.push("interrupted".to_string());
    }

    fn on_capture_error(&mut self, error: &Error) {
        self.push(format!("capture_error:{error}"));
    }
}

/// A connected coordinator with its mock peers
pub struct Harness {
    pub server: MockServer,
    pub mic: Option<mpsc::Sender<Result<Vec<u8>>>>,
    pub renderer: RecordingRenderer,
    pub tools: ScriptedTools,
    pub observer: RecordingObserver,
    pub input: mpsc::Sender<String>,
    pub shutdown: mpsc::Sender<()>,
    pub run: tokio::task::JoinHandle<(Coordinator, Result<()>)>,
    pub setup: Value,
}

/// Connect a coordinator (with microphone when `listen`) and start its loop
pub async fn start_coordinator(renderer: RecordingRenderer, listen: bool) -> Harness {
    let (connector, mut servers) = mock_connector();
    let session = LiveSession::new(connector);
    let tools = ScriptedTools::default();
    let observer = RecordingObserver::default();

    let chain = Arc::new(SinkChain::new(vec![Arc::new(renderer.clone()) as Arc<dyn Renderer>]));
    let playback = PlaybackQueue::new(chain, OUTPUT_FORMAT);

    let (capture, mic) = if listen {
        let (source, tx) = ChannelSource::new();
        let capture = MicCapture::new(vec![source as Arc<dyn CaptureSource>], INPUT_FORMAT, 3_200);
        (Some(capture), Some(tx))
    } else {
        (None, None)
    };

    let mut coordinator = Coordinator::new(
        session,
        Arc::new(tools.clone()),
        OutputBuffer::default(),
        playback,
        capture,
        TurnTiming::default(),
    )
    .with_observer(Box::new(observer.clone()));

    let (connected, (server, setup)) = tokio::join!(coordinator.connect(setup_params()), async {
        let mut server = servers.recv().await.expect("no connection attempt");
        let setup = server.next_json().await.expect("no setup message");
        server.ack();
        (server, setup)
    });
    connected.expect("connect failed");

    let (input, input_rx) = mpsc::channel(8);
    let (shutdown, mut shutdown_rx) = mpsc::channel(1);
    let run = tokio::spawn(async move {
        let result = coordinator.run(input_rx, &mut shutdown_rx).await;
        (coordinator, result)
    });

    Harness {
        server,
        mic,
        renderer,
        tools,
        observer,
        input,
        shutdown,
        run,
        setup,
    }
}

/// Let the coordinator drain everything that is already ready
pub async fn settle_briefly() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
