//! Half-duplex turn coordinator
//!
//! Binds the live session, output buffer, playback queue and microphone into a
//! single dispatch loop. Every transport event, mic frame, timer and tool
//! result is handled on this loop, so pause flags, buffers and queues have one
//! owner and need no locks.
//!
//! Turn-taking rules:
//! - output audio pauses the mic before the fragment is buffered
//! - tool calls run off-loop; their results go back as one bundle, after which
//!   a failsafe timer force-resumes the mic if no follow-on audio arrives
//! - turn completion flushes the buffer and, once playback has drained,
//!   resumes the mic after a settle delay

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::error::ProtocolError;
use crate::live::{FunctionCall, FunctionResponse, LiveSession, ServerEvent, SetupParams};
use crate::tools::ToolExecutor;
use crate::voice::{CaptureEvent, MicCapture, OutputBuffer, PlaybackQueue};
use crate::{Error, Result};

/// Delay before resuming the mic once playback has drained
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Bound on how long the mic stays paused after a tool-response bundle
pub const DEFAULT_FAILSAFE_RESUME: Duration = Duration::from_millis(2_000);

/// Timer settings for turn-taking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTiming {
    /// Settle delay after playback drains
    pub settle_delay: Duration,
    /// Failsafe resume after tool responses
    pub failsafe_resume: Duration,
}

impl Default for TurnTiming {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            failsafe_resume: DEFAULT_FAILSAFE_RESUME,
        }
    }
}

/// Receives what happens during a turn
///
/// One method per event kind; all default to doing nothing. Called on the
/// dispatch loop, so implementations must not block.
pub trait TurnObserver: Send {
    fn on_output_text(&mut self, _text: &str) {}
    fn on_input_transcription(&mut self, _text: &str) {}
    fn on_output_transcription(&mut self, _text: &str) {}
    fn on_tool_call(&mut self, _calls: &[FunctionCall]) {}
    fn on_tool_results(&mut self, _responses: &[FunctionResponse]) {}
    fn on_turn_complete(&mut self) {}
    fn on_interrupted(&mut self) {}
    fn on_server_error(&mut self, _error: &Value) {}
    fn on_capture_error(&mut self, _error: &Error) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl TurnObserver for SilentObserver {}

/// Results of one tool-call message
#[derive(Debug)]
struct ToolBatch {
    exchange: u64,
    responses: Vec<FunctionResponse>,
}

/// Bookkeeping for the open tool-call exchange of the current turn
#[derive(Debug)]
struct ToolExchange {
    id: u64,
    outstanding: usize,
}

/// Orchestrates one live session
pub struct Coordinator {
    session: LiveSession,
    tools: Arc<dyn ToolExecutor>,
    output: OutputBuffer,
    playback: PlaybackQueue,
    capture: Option<MicCapture>,
    observer: Box<dyn TurnObserver>,
    timing: TurnTiming,
    turn_produced_audio: bool,
    resume_pending: bool,
    settle_at: Option<Instant>,
    failsafe_at: Option<Instant>,
    exchange: Option<ToolExchange>,
    next_exchange: u64,
    tool_tasks: JoinSet<ToolBatch>,
}

impl Coordinator {
    /// Assemble a coordinator; `capture` is `None` for text-only sessions
    #[must_use]
    pub fn new(
        session: LiveSession,
        tools: Arc<dyn ToolExecutor>,
        output: OutputBuffer,
        playback: PlaybackQueue,
        capture: Option<MicCapture>,
        timing: TurnTiming,
    ) -> Self {
        Self {
            session,
            tools,
            output,
            playback,
            capture,
            observer: Box::new(SilentObserver),
            timing,
            turn_produced_audio: false,
            resume_pending: false,
            settle_at: None,
            failsafe_at: None,
            exchange: None,
            next_exchange: 0,
            tool_tasks: JoinSet::new(),
        }
    }

    /// Route turn events to `observer`
    #[must_use]
    pub fn with_observer(mut self, observer: Box<dyn TurnObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Connect the session with the executor's tools declared, then start
    /// the microphone
    ///
    /// A microphone failure is reported to the observer and leaves the
    /// session running without listening.
    ///
    /// # Errors
    ///
    /// Returns a `ConnectionError` if the session cannot be established
    pub async fn connect(&mut self, mut params: SetupParams) -> Result<()> {
        match self.tools.list_tools().await {
            Ok(tools) => params.tools.extend(tools),
            Err(e) => tracing::warn!(error = %e, "failed to list tools, continuing without them"),
        }

        self.session.connect(params).await?;

        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.start().await {
                tracing::error!(error = %e, "microphone unavailable, listening disabled");
                self.observer.on_capture_error(&e);
            }
        }
        Ok(())
    }

    /// Run the dispatch loop until shutdown, connection loss, or end of
    /// input for sessions that are not listening
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::NotReady` if called before [`Self::connect`],
    /// or the `ConnectionError` that ended the session
    pub async fn run(
        &mut self,
        mut input: mpsc::Receiver<String>,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> Result<()> {
        if !self.session.is_ready() {
            return Err(ProtocolError::NotReady(self.session.state()).into());
        }

        let mut input_open = true;

        let outcome = loop {
            let listening = self.capture.as_ref().is_some_and(MicCapture::is_running);

            // Nothing left to feed the session once typed input and the mic are both gone
            if !input_open
                && !listening
                && !self.session.turn_in_progress()
                && self.playback.is_idle()
            {
                tracing::debug!("input closed and turn finished");
                break Ok(());
            }

            tokio::select! {
                biased;

                Some(()) = shutdown.recv() => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                event = self.session.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(e) if e.is_fatal() => break Err(e),
                    Err(e) => tracing::warn!(error = %e, "live session error"),
                },
                Some(joined) = self.tool_tasks.join_next(), if !self.tool_tasks.is_empty() => {
                    if let Err(e) = self.finish_tool_batch(joined).await {
                        break Err(e);
                    }
                }
                Some(_) = self.playback.settle(), if self.playback.is_rendering() => {
                    self.schedule_resume_if_drained();
                }
                () = sleep_until(self.output.deadline()) => {
                    if let Some(chunk) = self.output.on_deadline() {
                        self.playback.enqueue(chunk);
                    }
                }
                () = sleep_until(self.settle_at) => {
                    self.settle_at = None;
                    self.resume_mic("settle");
                }
                () = sleep_until(self.failsafe_at) => {
                    self.failsafe_at = None;
                    self.resume_mic("failsafe");
                }
                Some(event) = recv_capture(&mut self.capture), if listening => {
                    if let Err(e) = self.handle_capture(event).await {
                        break Err(e);
                    }
                }
                line = input.recv(), if input_open => match line {
                    Some(text) => {
                        if let Err(e) = self.send_text(&text).await {
                            break Err(e);
                        }
                    }
                    None => input_open = false,
                },
            }
        };

        self.disconnect().await;
        outcome
    }

    /// Send a user text turn
    ///
    /// # Errors
    ///
    /// Returns a `ConnectionError` if the session is gone
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        tracing::debug!(chars = text.len(), "sending text turn");
        let sent = self.session.send_text(text, true).await;
        check_send(sent)
    }

    /// Stop capture, drop buffered output, cancel timers and tool calls, and
    /// close the session
    pub async fn disconnect(&mut self) {
        if let Some(capture) = self.capture.as_mut() {
            capture.stop();
        }
        self.output.discard();
        self.playback.clear();
        self.settle_at = None;
        self.failsafe_at = None;
        self.resume_pending = false;
        self.turn_produced_audio = false;
        self.exchange = None;
        self.tool_tasks.abort_all();
        self.session.disconnect().await;
    }

    /// The live session
    #[must_use]
    pub const fn session(&self) -> &LiveSession {
        &self.session
    }

    /// Whether the microphone is currently suppressed
    #[must_use]
    pub fn is_mic_paused(&self) -> bool {
        self.capture.as_ref().is_some_and(MicCapture::is_paused)
    }

    /// Whether the microphone source is running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.capture.as_ref().is_some_and(MicCapture::is_running)
    }

    fn handle_event(&mut self, event: ServerEvent) {
        tracing::trace!(kind = event.kind(), "server event");
        match event {
            ServerEvent::SetupAck => tracing::debug!("ignoring repeated setup acknowledgment"),
            ServerEvent::OutputAudio(pcm) => self.on_output_audio(pcm),
            ServerEvent::OutputText(text) => self.observer.on_output_text(&text),
            ServerEvent::InputTranscription(text) => self.observer.on_input_transcription(&text),
            ServerEvent::OutputTranscription(text) => self.observer.on_output_transcription(&text),
            ServerEvent::ToolCall(calls) => self.on_tool_call(calls),
            ServerEvent::TurnComplete => self.on_turn_complete(),
            ServerEvent::Interrupted => self.on_interrupted(),
            ServerEvent::Error(error) => {
                tracing::warn!(%error, "server reported an error");
                self.observer.on_server_error(&error);
            }
        }
    }

    fn on_output_audio(&mut self, pcm: Vec<u8>) {
        if let Some(capture) = self.capture.as_mut() {
            if capture.is_running() && !capture.is_paused() {
                capture.pause();
            }
        }
        self.turn_produced_audio = true;

        // Follow-on audio arrived: the failsafe and any pending resume are moot
        self.failsafe_at = None;
        self.settle_at = None;
        self.resume_pending = false;

        if let Some(chunk) = self.output.push(pcm) {
            self.playback.enqueue(chunk);
        }
    }

    fn on_tool_call(&mut self, calls: Vec<FunctionCall>) {
        self.observer.on_tool_call(&calls);
        if calls.is_empty() {
            tracing::warn!("tool call without function calls");
            return;
        }

        let exchange = self.exchange.get_or_insert_with(|| {
            self.next_exchange += 1;
            tracing::debug!(exchange = self.next_exchange, "opened tool-call exchange");
            ToolExchange {
                id: self.next_exchange,
                outstanding: 0,
            }
        });
        exchange.outstanding += 1;
        let id = exchange.id;

        tracing::info!(
            exchange = id,
            calls = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "executing tool calls"
        );

        let tools = Arc::clone(&self.tools);
        self.tool_tasks.spawn(async move {
            ToolBatch {
                exchange: id,
                responses: execute_calls(tools.as_ref(), calls).await,
            }
        });
    }

    async fn finish_tool_batch(
        &mut self,
        joined: std::result::Result<ToolBatch, JoinError>,
    ) -> Result<()> {
        let batch = match joined {
            Ok(batch) => batch,
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "tool task failed");
                return Ok(());
            }
        };

        match self.exchange.as_mut() {
            Some(open) if open.id == batch.exchange => {
                open.outstanding = open.outstanding.saturating_sub(1);
            }
            _ => tracing::debug!(exchange = batch.exchange, "tool results outlived their turn"),
        }

        self.observer.on_tool_results(&batch.responses);
        let count = batch.responses.len();
        let sent = self.session.send_tool_responses(batch.responses).await;
        check_send(sent)?;
        tracing::debug!(exchange = batch.exchange, responses = count, "sent tool responses");

        self.failsafe_at = Some(Instant::now() + self.timing.failsafe_resume);
        Ok(())
    }

    fn on_turn_complete(&mut self) {
        if let Some(chunk) = self.output.force_flush() {
            self.playback.enqueue(chunk);
        }

        if self.turn_produced_audio || self.is_mic_paused() {
            self.resume_pending = true;
            self.schedule_resume_if_drained();
        }
        self.turn_produced_audio = false;

        if let Some(exchange) = self.exchange.take() {
            tracing::debug!(
                exchange = exchange.id,
                outstanding = exchange.outstanding,
                "closed tool-call exchange"
            );
        }

        self.observer.on_turn_complete();
    }

    fn on_interrupted(&mut self) {
        tracing::debug!("model interrupted its output");
        self.output.discard();
        self.playback.clear();
        self.schedule_resume_if_drained();
        self.observer.on_interrupted();
    }

    fn schedule_resume_if_drained(&mut self) {
        if self.resume_pending && self.playback.is_idle() && self.output.is_empty() {
            self.resume_pending = false;
            self.settle_at = Some(Instant::now() + self.timing.settle_delay);
        }
    }

    fn resume_mic(&mut self, reason: &str) {
        if let Some(capture) = self.capture.as_mut() {
            if capture.is_paused() {
                capture.resume();
                tracing::debug!(reason, "microphone resumed");
            }
        }
    }

    async fn handle_capture(&mut self, event: CaptureEvent) -> Result<()> {
        match event {
            CaptureEvent::Frame(pcm) => {
                let sent = self.session.send_audio_chunk(&pcm).await;
                check_send(sent)
            }
            CaptureEvent::Error(e) => {
                tracing::error!(error = %e, "microphone capture failed, listening disabled");
                self.observer.on_capture_error(&e);
                Ok(())
            }
        }
    }
}

/// Run every call of one tool-call message, preserving order
async fn execute_calls(
    tools: &dyn ToolExecutor,
    calls: Vec<FunctionCall>,
) -> Vec<FunctionResponse> {
    join_all(calls.into_iter().map(|call| async move {
        match tools.execute(&call.name, call.args).await {
            Ok(payload) => FunctionResponse::success(call.id, call.name, payload),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                FunctionResponse::failure(call.id, call.name, &e.to_string())
            }
        }
    }))
    .await
}

/// Non-fatal send errors are logged; connection errors end the loop
fn check_send(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "send rejected");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

async fn recv_capture(capture: &mut Option<MicCapture>) -> Option<CaptureEvent> {
    match capture {
        Some(capture) => capture.recv().await,
        None => None,
    }
}
