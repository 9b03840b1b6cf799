//! Live session protocol client
//!
//! Owns the bidirectional transport to the remote model: the setup handshake,
//! outbound text/audio/tool-response messages, and classification of inbound
//! traffic into typed [`ServerEvent`]s.

mod messages;
mod session;
mod transport;

pub use messages::{
    ClientMessage, FunctionCall, FunctionResponse, INPUT_AUDIO_MIME, Modality, ServerEvent,
    SetupParams, classify,
};
pub use session::{LiveSession, SETUP_TIMEOUT, SessionState};
pub use transport::{Connector, Transport, WebSocketConnector, WebSocketTransport};
