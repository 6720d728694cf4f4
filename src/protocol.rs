//! Wire types for the duplex voice connection.
//!
//! The connection carries two kinds of frames: JSON text frames for control
//! messages and binary frames holding one encoded audio chunk each. The
//! handshake is always the first frame a client sends.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

pub const EVENT_END_AUDIO: &str = "end_audio";
pub const EVENT_AUTO_INTRO: &str = "__auto_intro_request__";

/// Which party an utterance or control message belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    Human,
    Agent,
}

/// Container format of a chunk's bytes. The wire treats chunks as opaque;
/// the tag only matters to the local encoder and playback decoder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkEncoding {
    Wav,
    /// Anything received from the remote party; format is discovered at
    /// decode time.
    Remote,
}

/// One discrete unit of encoded audio, outbound (captured) or inbound
/// (synthesized reply). Immutable once built; ownership moves from producer
/// to the socket or playback queue.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub sequence: u64,
    pub encoding: ChunkEncoding,
}

impl AudioChunk {
    pub fn new(bytes: Vec<u8>, sequence: u64, encoding: ChunkEncoding) -> Self {
        Self {
            bytes,
            sequence,
            encoding,
        }
    }
}

/// Control messages exchanged as JSON text frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// First frame on every connection; binds it to a session and identity.
    Handshake {
        session_id: String,
        participant_id: String,
        role: SpeakerRole,
    },
    /// Sent after the last chunk of a clip to close the utterance.
    EndOfAudio,
    /// One-shot request for the agent's opening line.
    AutoIntroRequest,
    /// The named speaker's turn is complete; for the agent this re-arms
    /// capture.
    TurnFinal { speaker: SpeakerRole, message: String },
    /// Interim transcript of an in-progress turn. Informational only.
    TurnPartial { speaker: SpeakerRole, message: String },
}

/// Serde shapes for the three outbound frame layouts and the inbound
/// transcript frames. Kept private; `ControlMessage` is the crate-facing
/// type.
#[derive(Serialize, Deserialize)]
struct HandshakeFrame {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "participantId")]
    participant_id: String,
    role: SpeakerRole,
}

#[derive(Serialize, Deserialize)]
struct EventFrame {
    event: String,
}

#[derive(Serialize, Deserialize)]
struct TranscriptFrame {
    ws_message_type: String,
    #[serde(rename = "type")]
    speaker: SpeakerRole,
    message: String,
}

impl ControlMessage {
    pub fn to_json(&self) -> String {
        let value = match self {
            ControlMessage::Handshake {
                session_id,
                participant_id,
                role,
            } => serde_json::to_value(HandshakeFrame {
                session_id: session_id.clone(),
                participant_id: participant_id.clone(),
                role: *role,
            }),
            ControlMessage::EndOfAudio => serde_json::to_value(EventFrame {
                event: EVENT_END_AUDIO.to_string(),
            }),
            ControlMessage::AutoIntroRequest => serde_json::to_value(EventFrame {
                event: EVENT_AUTO_INTRO.to_string(),
            }),
            ControlMessage::TurnFinal { speaker, message } => {
                serde_json::to_value(TranscriptFrame {
                    ws_message_type: "final".to_string(),
                    speaker: *speaker,
                    message: message.clone(),
                })
            }
            ControlMessage::TurnPartial { speaker, message } => {
                serde_json::to_value(TranscriptFrame {
                    ws_message_type: "partial".to_string(),
                    speaker: *speaker,
                    message: message.clone(),
                })
            }
        };
        // The frame structs contain nothing that can fail to serialize.
        value
            .and_then(|v| serde_json::to_string(&v))
            .unwrap_or_default()
    }

    /// Classify an inbound text frame. Unknown or malformed frames map to
    /// `Protocol`, which the demux layer logs and drops.
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        if let Ok(frame) = serde_json::from_str::<TranscriptFrame>(text) {
            return match frame.ws_message_type.as_str() {
                "final" => Ok(ControlMessage::TurnFinal {
                    speaker: frame.speaker,
                    message: frame.message,
                }),
                "partial" | "interim" => Ok(ControlMessage::TurnPartial {
                    speaker: frame.speaker,
                    message: frame.message,
                }),
                other => Err(PipelineError::Protocol(format!(
                    "unknown ws_message_type '{other}'"
                ))),
            };
        }
        if let Ok(frame) = serde_json::from_str::<EventFrame>(text) {
            return match frame.event.as_str() {
                EVENT_END_AUDIO => Ok(ControlMessage::EndOfAudio),
                EVENT_AUTO_INTRO => Ok(ControlMessage::AutoIntroRequest),
                other => Err(PipelineError::Protocol(format!(
                    "unknown event '{other}'"
                ))),
            };
        }
        if let Ok(frame) = serde_json::from_str::<HandshakeFrame>(text) {
            return Ok(ControlMessage::Handshake {
                session_id: frame.session_id,
                participant_id: frame.participant_id,
                role: frame.role,
            });
        }
        Err(PipelineError::Protocol(format!(
            "unrecognized control frame: {}",
            text.chars().take(120).collect::<String>()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_serializes_with_camel_case_keys() {
        let msg = ControlMessage::Handshake {
            session_id: "s1".into(),
            participant_id: "p1".into(),
            role: SpeakerRole::Human,
        };
        let json = msg.to_json();
        assert!(json.contains("\"sessionId\":\"s1\""));
        assert!(json.contains("\"participantId\":\"p1\""));
        assert!(json.contains("\"role\":\"human\""));
    }

    #[test]
    fn event_frames_round_trip() {
        assert_eq!(
            ControlMessage::parse(&ControlMessage::EndOfAudio.to_json()).unwrap(),
            ControlMessage::EndOfAudio
        );
        assert_eq!(
            ControlMessage::parse(&ControlMessage::AutoIntroRequest.to_json()).unwrap(),
            ControlMessage::AutoIntroRequest
        );
    }

    #[test]
    fn parses_inbound_final_transcript() {
        let text = r#"{"ws_message_type":"final","type":"agent","message":"Hello there."}"#;
        match ControlMessage::parse(text).unwrap() {
            ControlMessage::TurnFinal { speaker, message } => {
                assert_eq!(speaker, SpeakerRole::Agent);
                assert_eq!(message, "Hello there.");
            }
            other => panic!("expected TurnFinal, got {other:?}"),
        }
    }

    #[test]
    fn parses_interim_variant_as_partial() {
        let text = r#"{"ws_message_type":"interim","type":"human","message":"hel"}"#;
        assert!(matches!(
            ControlMessage::parse(text).unwrap(),
            ControlMessage::TurnPartial { .. }
        ));
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        for bad in [
            "not json at all",
            "{}",
            r#"{"event":"made_up"}"#,
            r#"{"ws_message_type":"bogus","type":"agent","message":"x"}"#,
        ] {
            let err = ControlMessage::parse(bad).unwrap_err();
            assert!(err.is_recoverable(), "'{bad}' should be recoverable");
        }
    }
}
