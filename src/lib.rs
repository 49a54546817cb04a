//! Real-time voice session against a live conversational service.
//!
//! Microphone audio is captured at 16 kHz mono, sent as base64 PCM16 over a
//! WebSocket, and the synthesized replies are scheduled back-to-back on the
//! output clock so variable-size network chunks play without gaps.

pub mod audio;
pub mod config;
pub mod error;
pub mod net_link;
pub mod protocol;
pub mod session;

pub use audio::{AlsaBackend, AudioBackend};
pub use config::Config;
pub use error::{LiveError, LiveResult};
pub use net_link::{ConnectionState, NetEvent, Transport};
pub use session::{SessionHandle, SessionStatus, open};
