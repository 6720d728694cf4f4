//! Session lifecycle: bootstrap, arming, capture, send, reply, playback.
//!
//! The controller owns every collaborator for exactly one conversation and
//! multiplexes their event channels in a single loop. There is one valid
//! path through the states and every failure funnels into teardown, which
//! releases the microphone, the speaker, and the connection no matter how
//! the session ends.

use crate::bootstrap::BootstrapClient;
use crate::capture::{CaptureEvent, CaptureSource, Clip};
use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::playback::{PlaybackEvent, PlaybackQueue};
use crate::protocol::{ControlMessage, SpeakerRole};
use crate::stream::{StreamClient, StreamEvent};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Bootstrapping,
    Unlocking,
    Armed,
    Recording,
    Sending,
    WaitingForReply,
    Playing,
    TornDown,
}

/// Requests from the frontend (key handler, signal handler, tests).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    StartRecording,
    StopRecording,
    Shutdown,
}

/// Observable progress, for the UI layer and for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    StateChanged(SessionState),
    SpeakingChanged(bool),
    Transcript {
        speaker: SpeakerRole,
        message: String,
        is_final: bool,
    },
    ChunkPlayed(u64),
    ChunkSkipped { sequence: u64, reason: String },
}

/// Identity material produced by bootstrap and consumed by the stream
/// handshake.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub participant_id: String,
    pub voice_url: String,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub auto_intro: bool,
    pub hands_free: bool,
}

/// Resolve the agent, create a session around it, and join as a named
/// participant. The agent reload is best effort; a stale definition is
/// better than no conversation.
pub async fn establish_session(
    cfg: &AppConfig,
    notices: &UnboundedSender<SessionNotice>,
) -> PipelineResult<SessionIdentity> {
    let _ = notices.send(SessionNotice::StateChanged(SessionState::Bootstrapping));
    let client = BootstrapClient::new(&cfg.api_url)?;
    let agent = client.lookup_agent(&cfg.agent).await?;
    info!(agent_id = %agent.id, name = %agent.name, "resolved agent");

    let session_id = client.initiate_swarm(&[&agent.id]).await?;
    let participant_id = client.join_swarm(&session_id, &cfg.join_name).await?;
    info!(%session_id, %participant_id, "joined session");

    if let Err(err) = client.reload_agent(&session_id, &agent.id).await {
        warn!(error = %err, "agent reload failed, continuing with cached definition");
    }

    Ok(SessionIdentity {
        session_id,
        participant_id,
        voice_url: client.voice_url(),
    })
}

pub struct SessionController<C: CaptureSource> {
    state: SessionState,
    options: SessionOptions,
    capture: C,
    capture_events: UnboundedReceiver<CaptureEvent>,
    playback: PlaybackQueue,
    playback_events: UnboundedReceiver<PlaybackEvent>,
    stream: StreamClient,
    stream_events: UnboundedReceiver<StreamEvent>,
    commands: UnboundedReceiver<SessionCommand>,
    notices: UnboundedSender<SessionNotice>,
    auto_intro_sent: bool,
}

impl<C: CaptureSource> SessionController<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: SessionOptions,
        capture: C,
        capture_events: UnboundedReceiver<CaptureEvent>,
        playback: PlaybackQueue,
        playback_events: UnboundedReceiver<PlaybackEvent>,
        stream: StreamClient,
        stream_events: UnboundedReceiver<StreamEvent>,
        commands: UnboundedReceiver<SessionCommand>,
        notices: UnboundedSender<SessionNotice>,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            options,
            capture,
            capture_events,
            playback,
            playback_events,
            stream,
            stream_events,
            commands,
            notices,
            auto_intro_sent: false,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "session state");
            self.state = state;
            let _ = self.notices.send(SessionNotice::StateChanged(state));
        }
    }

    /// Drive the session to completion. Returns the first fatal error, after
    /// teardown has run either way.
    pub async fn run(mut self) -> PipelineResult<()> {
        let result = self.drive().await;
        self.teardown().await;
        result
    }

    async fn drive(&mut self) -> PipelineResult<()> {
        self.set_state(SessionState::Unlocking);
        self.capture.warm_up()?;
        self.set_state(SessionState::Armed);

        // One shot, on the first arrival in Armed. The session stays armed
        // so the human can still start talking if the agent never answers.
        if self.options.auto_intro && !self.auto_intro_sent {
            self.auto_intro_sent = true;
            self.stream
                .send_control(&ControlMessage::AutoIntroRequest)
                .await?;
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::StartRecording) => self.handle_start_request()?,
                        Some(SessionCommand::StopRecording) => self.capture.stop_recording(),
                        Some(SessionCommand::Shutdown) | None => return Ok(()),
                    }
                }
                event = self.capture_events.recv() => {
                    match event {
                        Some(CaptureEvent::SpeakingChanged(speaking)) => {
                            let _ = self.notices.send(SessionNotice::SpeakingChanged(speaking));
                        }
                        Some(CaptureEvent::ClipReady(clip)) => self.handle_clip(clip).await?,
                        Some(CaptureEvent::Failed(reason)) => {
                            return Err(PipelineError::DeviceUnavailable(reason));
                        }
                        None => return Err(PipelineError::DeviceUnavailable(
                            "capture event channel closed".into(),
                        )),
                    }
                }
                event = self.stream_events.recv() => {
                    match event {
                        Some(StreamEvent::Audio(chunk)) => {
                            // Reply audio can also land while Armed, for
                            // instance in response to the intro request.
                            if matches!(
                                self.state,
                                SessionState::WaitingForReply | SessionState::Armed
                            ) {
                                self.set_state(SessionState::Playing);
                            }
                            self.playback.enqueue(chunk);
                        }
                        Some(StreamEvent::Control(message)) => self.handle_control(message)?,
                        Some(StreamEvent::Closed(reason)) => {
                            return Err(PipelineError::Connection(
                                reason.unwrap_or_else(|| "connection closed".into()),
                            ));
                        }
                        None => {
                            return Err(PipelineError::Connection("connection closed".into()));
                        }
                    }
                }
                event = self.playback_events.recv() => {
                    match event {
                        Some(PlaybackEvent::Finished { sequence }) => {
                            let _ = self.notices.send(SessionNotice::ChunkPlayed(sequence));
                        }
                        Some(PlaybackEvent::Skipped { sequence, reason }) => {
                            let _ = self.notices.send(SessionNotice::ChunkSkipped {
                                sequence,
                                reason,
                            });
                        }
                        Some(PlaybackEvent::Started { .. }) | None => {}
                    }
                }
            }
        }
    }

    fn handle_start_request(&mut self) -> PipelineResult<()> {
        if self.state != SessionState::Armed {
            debug!(state = ?self.state, "ignoring start request outside Armed");
            return Ok(());
        }
        self.capture.start_recording()?;
        self.set_state(SessionState::Recording);
        Ok(())
    }

    /// Transmit a finished clip: every chunk in capture order, then the
    /// end-of-audio marker.
    async fn handle_clip(&mut self, clip: Clip) -> PipelineResult<()> {
        if clip.chunks.is_empty() {
            debug!("discarding empty clip");
            self.set_state(SessionState::Armed);
            return Ok(());
        }
        self.set_state(SessionState::Sending);
        info!(
            chunks = clip.chunks.len(),
            duration_ms = clip.duration.as_millis() as u64,
            cause = ?clip.stop_cause,
            "sending clip"
        );
        for chunk in &clip.chunks {
            self.stream.send_audio(chunk).await?;
        }
        self.stream.send_control(&ControlMessage::EndOfAudio).await?;
        self.set_state(SessionState::WaitingForReply);
        Ok(())
    }

    fn handle_control(&mut self, message: ControlMessage) -> PipelineResult<()> {
        match message {
            ControlMessage::TurnFinal { speaker, message } => {
                let _ = self.notices.send(SessionNotice::Transcript {
                    speaker,
                    message,
                    is_final: true,
                });
                if speaker == SpeakerRole::Agent {
                    self.rearm()?;
                }
            }
            ControlMessage::TurnPartial { speaker, message } => {
                let _ = self.notices.send(SessionNotice::Transcript {
                    speaker,
                    message,
                    is_final: false,
                });
            }
            other => {
                debug!(?other, "ignoring control frame");
            }
        }
        Ok(())
    }

    /// The agent's turn is over. In hands-free mode the next recording
    /// starts immediately; otherwise we wait for a start request.
    fn rearm(&mut self) -> PipelineResult<()> {
        self.set_state(SessionState::Armed);
        if self.options.hands_free {
            self.handle_start_request()?;
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        self.capture.release();
        // Pending reply audio dies with the session.
        self.playback.clear();
        self.playback.close_async().await;
        self.stream.close().await;
        self.set_state(SessionState::TornDown);
    }
}
