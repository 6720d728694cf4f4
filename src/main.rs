use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};
use voicewire::capture::CaptureUnit;
use voicewire::config::AppConfig;
use voicewire::init_logging;
use voicewire::playback::PlaybackQueue;
use voicewire::protocol::{ControlMessage, SpeakerRole};
use voicewire::session::{
    establish_session, SessionCommand, SessionController, SessionNotice, SessionOptions,
    SessionState,
};
use voicewire::stream::StreamClient;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::parse_args()?;

    if config.list_input_devices {
        let devices = CaptureUnit::list_devices()?;
        if devices.is_empty() {
            println!("No audio input devices detected.");
        } else {
            for name in devices {
                println!("{name}");
            }
        }
        return Ok(());
    }

    init_logging();
    run(config).await
}

async fn run(config: AppConfig) -> Result<()> {
    // The session stops recordings on its own (cap, trailing silence), so
    // the Enter toggle follows the reported state instead of a local flag.
    let recording = Arc::new(AtomicBool::new(false));

    let (notice_tx, notice_rx) = unbounded_channel();
    tokio::spawn(print_notices(notice_rx, recording.clone()));

    let identity = establish_session(&config, &notice_tx).await?;
    let handshake = ControlMessage::Handshake {
        session_id: identity.session_id.clone(),
        participant_id: identity.participant_id.clone(),
        role: SpeakerRole::Human,
    };
    let (stream, stream_events) = StreamClient::connect(&identity.voice_url, handshake).await?;
    info!(url = %identity.voice_url, "connected");

    let (playback_tx, playback_rx) = unbounded_channel();
    let playback = PlaybackQueue::open(playback_tx)?;

    let (capture_tx, capture_rx) = unbounded_channel();
    let capture = CaptureUnit::new(
        config.voice_loop_config(),
        config.input_device.clone(),
        capture_tx,
    );

    let (command_tx, command_rx) = unbounded_channel();
    spawn_input_task(command_tx.clone(), recording);
    spawn_signal_task(command_tx);

    let options = SessionOptions {
        auto_intro: config.auto_intro,
        hands_free: config.hands_free,
    };
    let controller = SessionController::new(
        options,
        capture,
        capture_rx,
        playback,
        playback_rx,
        stream,
        stream_events,
        command_rx,
        notice_tx,
    );
    controller.run().await?;
    Ok(())
}

/// Map one line of input to a command, given whether a recording is live.
fn line_command(line: &str, recording: bool) -> SessionCommand {
    match line.trim() {
        "q" | "quit" | "exit" => SessionCommand::Shutdown,
        _ if recording => SessionCommand::StopRecording,
        _ => SessionCommand::StartRecording,
    }
}

/// Enter toggles recording; 'q' ends the session.
fn spawn_input_task(commands: UnboundedSender<SessionCommand>, recording: Arc<AtomicBool>) {
    tokio::spawn(async move {
        println!("Press Enter to start or stop recording, 'q' then Enter to quit.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let command = line_command(&line, recording.load(Ordering::Acquire));
            let stop = command == SessionCommand::Shutdown;
            if commands.send(command).is_err() || stop {
                break;
            }
        }
    });
}

fn spawn_signal_task(commands: UnboundedSender<SessionCommand>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = commands.send(SessionCommand::Shutdown);
        }
    });
}

async fn print_notices(mut notices: UnboundedReceiver<SessionNotice>, recording: Arc<AtomicBool>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            SessionNotice::StateChanged(state) => {
                recording.store(state == SessionState::Recording, Ordering::Release);
                match state {
                    SessionState::Armed => println!("(ready - press Enter to talk)"),
                    SessionState::Recording => println!("(recording)"),
                    SessionState::WaitingForReply => println!("(waiting for reply)"),
                    _ => {}
                }
                debug!(?state, "state");
            }
            SessionNotice::Transcript {
                speaker,
                message,
                is_final: true,
            } => {
                let label = match speaker {
                    SpeakerRole::Agent => "agent",
                    SpeakerRole::Human => "you",
                };
                println!("{label}: {message}");
            }
            SessionNotice::Transcript { .. } => {}
            SessionNotice::SpeakingChanged(speaking) => {
                debug!(speaking, "vad");
            }
            SessionNotice::ChunkPlayed(sequence) => {
                debug!(sequence, "chunk played");
            }
            SessionNotice::ChunkSkipped { sequence, reason } => {
                info!(sequence, %reason, "skipped unplayable chunk");
            }
        }
    }
}
