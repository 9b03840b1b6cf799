//! Beacon Live - real-time voice sessions with a live model
//!
//! This library provides the client side of a live, bidirectional model
//! session:
//! - Live session protocol (setup handshake, typed inbound events)
//! - Output audio buffering and playback with backend fallback
//! - Microphone capture framed into fixed-size chunks
//! - Half-duplex turn-taking so the model never hears itself
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Turn Coordinator                    │
//! │   one dispatch loop: events, frames, timers, tools  │
//! └───────┬──────────────┬──────────────┬───────────────┘
//!         │              │              │
//! ┌───────▼──────┐ ┌─────▼──────┐ ┌─────▼──────────────┐
//! │ Live Session │ │ Mic Capture│ │ Output Buffer →    │
//! │  (WebSocket) │ │  (framer)  │ │ Playback Queue →   │
//! │              │ │            │ │ Sink Chain         │
//! └──────────────┘ └────────────┘ └────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod live;
pub mod tools;
pub mod voice;

pub use config::{Config, Mode};
pub use coordinator::{Coordinator, SilentObserver, TurnObserver, TurnTiming};
pub use error::{ConnectionError, Error, ProtocolError, Result};
pub use live::{LiveSession, ServerEvent, SessionState, SetupParams};
pub use tools::{ManifestTools, NoTools, ToolDeclaration, ToolExecutor};
