//! Live session state machine
//!
//! `Disconnected → Connecting → AwaitingSetupAck → Ready → Closed`. A failed
//! connect returns the session to `Disconnected` so it can be retried; `Closed`
//! sessions may also be reconnected.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::messages::{self, ClientMessage, FunctionResponse, ServerEvent, SetupParams};
use super::transport::{Connector, Transport};
use crate::error::{ConnectionError, ProtocolError};
use crate::{Error, Result};

/// Default bound on the setup handshake
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state of a [`LiveSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingSetupAck,
    Ready,
    Closed,
}

/// One live connection to the remote model
pub struct LiveSession {
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    state: SessionState,
    params: Option<SetupParams>,
    setup_timeout: Duration,
    turn_in_progress: bool,
    turns_completed: u64,
    pending: VecDeque<ServerEvent>,
    id: Option<Uuid>,
}

impl LiveSession {
    /// Create a disconnected session
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            transport: None,
            state: SessionState::Disconnected,
            params: None,
            setup_timeout: SETUP_TIMEOUT,
            turn_in_progress: false,
            turns_completed: 0,
            pending: VecDeque::new(),
            id: None,
        }
    }

    /// Override the setup acknowledgment timeout
    #[must_use]
    pub const fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Open the transport, send the setup handshake and wait for its acknowledgment
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Timeout` if no acknowledgment arrives within the
    /// setup timeout, or `ConnectionError::Transport` on socket failure. The
    /// session is left `Disconnected` and may be connected again.
    pub async fn connect(&mut self, params: SetupParams) -> Result<()> {
        if self.transport.is_some() {
            self.disconnect().await;
        }
        self.pending.clear();
        self.turn_in_progress = false;

        let setup = ClientMessage::setup(&params).to_json()?;
        let id = Uuid::new_v4();
        self.state = SessionState::Connecting;
        tracing::info!(
            session = %id,
            model = %params.model,
            voice = %params.voice,
            "connecting live session"
        );

        let mut transport = match self.connector.connect().await {
            Ok(t) => t,
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(e);
            }
        };

        if let Err(e) = transport.send(setup).await {
            transport.close().await;
            self.state = SessionState::Disconnected;
            return Err(e);
        }
        self.state = SessionState::AwaitingSetupAck;

        let acked =
            tokio::time::timeout(self.setup_timeout, await_setup_ack(transport.as_mut())).await;

        match acked {
            Ok(Ok(trailing)) => {
                self.pending.extend(trailing);
                self.transport = Some(transport);
                self.params = Some(params);
                self.id = Some(id);
                self.state = SessionState::Ready;
                tracing::info!(session = %id, "live session ready");
                Ok(())
            }
            Ok(Err(e)) => {
                transport.close().await;
                self.state = SessionState::Disconnected;
                Err(e)
            }
            Err(_) => {
                transport.close().await;
                self.state = SessionState::Disconnected;
                tracing::warn!(
                    session = %id,
                    timeout = ?self.setup_timeout,
                    "setup acknowledgment timed out"
                );
                Err(ConnectionError::Timeout(self.setup_timeout).into())
            }
        }
    }

    /// Send a user text turn
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::NotReady` unless the session is ready
    pub async fn send_text(&mut self, text: &str, end_turn: bool) -> Result<()> {
        self.send(ClientMessage::text(text, end_turn)).await?;
        self.turn_in_progress = true;
        Ok(())
    }

    /// Forward one already-framed microphone chunk
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::NotReady` unless the session is ready
    pub async fn send_audio_chunk(&mut self, pcm: &[u8]) -> Result<()> {
        self.send(ClientMessage::audio(pcm)).await
    }

    /// Send all tool results of an exchange as one bundled message
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::NotReady` unless the session is ready
    pub async fn send_tool_responses(&mut self, responses: Vec<FunctionResponse>) -> Result<()> {
        self.send(ClientMessage::tool_responses(responses)).await
    }

    /// Next inbound event
    ///
    /// Malformed payloads are logged and dropped. Cancel-safe.
    ///
    /// # Errors
    ///
    /// Returns a `ConnectionError` once the transport fails or closes
    pub async fn recv(&mut self) -> Result<ServerEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event == ServerEvent::TurnComplete {
                    self.turn_in_progress = false;
                    self.turns_completed += 1;
                }
                return Ok(event);
            }

            self.ensure_ready()?;
            let Some(transport) = self.transport.as_mut() else {
                return Err(ConnectionError::Closed.into());
            };

            match transport.recv().await {
                None => {
                    tracing::info!(session = ?self.id, "live session closed by server");
                    self.mark_closed();
                    return Err(ConnectionError::Closed.into());
                }
                Some(Err(Error::Protocol(e))) => {
                    tracing::warn!(error = %e, "dropping inbound message");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "live transport failed");
                    self.mark_closed();
                    return Err(e);
                }
                Some(Ok(raw)) => match messages::classify(&raw) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => tracing::warn!(error = %e, "dropping inbound message"),
                },
            }
        }
    }

    /// Close the transport; later sends fail with `ConnectionError::Closed`
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
            tracing::info!(session = ?self.id, "live session disconnected");
        }
        self.mark_closed();
    }

    /// Current connection state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session accepts sends
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Whether a turn has been started and not yet completed
    #[must_use]
    pub const fn turn_in_progress(&self) -> bool {
        self.turn_in_progress
    }

    /// Number of turns completed on this connection
    #[must_use]
    pub const fn turns_completed(&self) -> u64 {
        self.turns_completed
    }

    /// Parameters negotiated by the last successful connect
    #[must_use]
    pub const fn params(&self) -> Option<&SetupParams> {
        self.params.as_ref()
    }

    /// Identifier of the current connection
    #[must_use]
    pub const fn id(&self) -> Option<Uuid> {
        self.id
    }

    async fn send(&mut self, message: ClientMessage) -> Result<()> {
        self.ensure_ready()?;
        let payload = message.to_json()?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(ConnectionError::Closed.into());
        };
        if let Err(e) = transport.send(payload).await {
            tracing::error!(error = %e, "live send failed");
            self.mark_closed();
            return Err(e);
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(ConnectionError::Closed.into()),
            state => Err(ProtocolError::NotReady(state).into()),
        }
    }

    fn mark_closed(&mut self) {
        self.transport = None;
        self.state = SessionState::Closed;
        self.pending.clear();
        self.turn_in_progress = false;
    }
}

/// Read until the setup acknowledgment, returning events that shared its payload
async fn await_setup_ack(transport: &mut dyn Transport) -> Result<Vec<ServerEvent>> {
    loop {
        let raw = match transport.recv().await {
            None => {
                return Err(ConnectionError::Transport(
                    "connection closed before setup acknowledgment".to_string(),
                )
                .into());
            }
            Some(Err(Error::Protocol(e))) => {
                tracing::warn!(error = %e, "dropping inbound message during setup");
                continue;
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(raw)) => raw,
        };

        match messages::classify(&raw) {
            Ok(events) => {
                if let Some(pos) = events.iter().position(|e| *e == ServerEvent::SetupAck) {
                    return Ok(events.into_iter().skip(pos + 1).collect());
                }
                tracing::debug!(
                    count = events.len(),
                    "ignoring events before setup acknowledgment"
                );
            }
            Err(e) => tracing::warn!(error = %e, "dropping inbound message during setup"),
        }
    }
}
