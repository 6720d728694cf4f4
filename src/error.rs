//! Error taxonomy for the voice pipeline.
//!
//! Per-chunk decode failures and malformed control frames are recovered
//! locally and never abort a session; everything else is surfaced to the
//! session controller, which tears the session down. No variant is fatal to
//! the hosting process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Microphone permission denied, device missing, or the stream could not
    /// be opened.
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    /// WebSocket connect/handshake failure or a mid-session drop.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single inbound chunk failed to decode. Non-fatal; the playback
    /// driver skips the chunk.
    #[error("chunk {sequence} failed to decode: {reason}")]
    Decode { sequence: u64, reason: String },

    /// The bootstrap collaborator rejected or failed a session setup call.
    #[error("session setup failed: {0}")]
    SessionSetup(String),

    /// A text frame arrived that is not a recognizable control message.
    /// Logged and dropped at the demux layer; carried here so callers that
    /// decode frames directly can classify it.
    #[error("malformed control frame: {0}")]
    Protocol(String),
}

impl PipelineError {
    /// True for errors the pipeline absorbs without ending the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Decode { .. } | PipelineError::Protocol(_)
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
