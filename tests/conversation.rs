//! Full conversation loop against an in-process server: handshake, clip
//! transmission, reply playback, and re-arming across turns.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use voicewire::capture::{CaptureEvent, CaptureSource, Clip, StopCause};
use voicewire::error::PipelineResult;
use voicewire::playback::{ChunkPlayer, PlaybackQueue};
use voicewire::protocol::{AudioChunk, ChunkEncoding, ControlMessage, SpeakerRole};
use voicewire::session::{
    SessionCommand, SessionController, SessionNotice, SessionOptions, SessionState,
};
use voicewire::stream::StreamClient;

const WAIT: Duration = Duration::from_secs(5);

/// True once an Armed transition has been observed after WaitingForReply,
/// distinguishing the re-arm from the initial arming at session start.
fn rearmed(seen: &[SessionNotice]) -> bool {
    match seen
        .iter()
        .position(|n| *n == SessionNotice::StateChanged(SessionState::WaitingForReply))
    {
        Some(at) => seen[at..]
            .iter()
            .any(|n| *n == SessionNotice::StateChanged(SessionState::Armed)),
        None => false,
    }
}

struct FakeCapture;

impl CaptureSource for FakeCapture {
    fn warm_up(&mut self) -> PipelineResult<()> {
        Ok(())
    }
    fn start_recording(&mut self) -> PipelineResult<()> {
        Ok(())
    }
    fn stop_recording(&mut self) {}
    fn release(&mut self) {}
}

/// Plays with jittered latency so ordering is actually exercised, and fails
/// on request to simulate undecodable chunks.
struct TestPlayer {
    played: Arc<Mutex<Vec<u64>>>,
    fail_sequences: Vec<u64>,
}

impl ChunkPlayer for TestPlayer {
    fn play(&mut self, chunk: &AudioChunk) -> PipelineResult<()> {
        let latency = rand::thread_rng().gen_range(1..12);
        std::thread::sleep(Duration::from_millis(latency));
        if self.fail_sequences.contains(&chunk.sequence) {
            return Err(voicewire::PipelineError::Decode {
                sequence: chunk.sequence,
                reason: "bad container".into(),
            });
        }
        self.played.lock().unwrap().push(chunk.sequence);
        Ok(())
    }
}

/// One agent reply: the chunks to stream back, then a final transcript.
struct ServerReply {
    chunks: Vec<Vec<u8>>,
    transcript: &'static str,
}

struct Harness {
    capture_tx: UnboundedSender<CaptureEvent>,
    command_tx: UnboundedSender<SessionCommand>,
    notice_rx: UnboundedReceiver<SessionNotice>,
    server_seen_rx: UnboundedReceiver<Message>,
    played: Arc<Mutex<Vec<u64>>>,
    controller: JoinHandle<PipelineResult<()>>,
}

impl Harness {
    /// Stand up a scripted server and a fully wired controller. The server
    /// answers each end-of-audio with the next reply in `replies` and
    /// forwards every frame it receives for inspection.
    async fn start(replies: Vec<ServerReply>, fail_sequences: Vec<u64>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server_seen_tx, server_seen_rx) = unbounded_channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let handshake = socket.next().await.unwrap().unwrap();
            server_seen_tx.send(handshake).unwrap();

            for reply in replies {
                loop {
                    let frame = socket.next().await.unwrap().unwrap();
                    let is_end = matches!(
                        &frame,
                        Message::Text(text)
                            if matches!(
                                ControlMessage::parse(text),
                                Ok(ControlMessage::EndOfAudio)
                            )
                    );
                    server_seen_tx.send(frame).unwrap();
                    if is_end {
                        break;
                    }
                }
                for chunk in reply.chunks {
                    socket.send(Message::Binary(chunk)).await.unwrap();
                }
                let transcript = serde_json::json!({
                    "ws_message_type": "final",
                    "type": "agent",
                    "message": reply.transcript,
                });
                socket
                    .send(Message::Text(transcript.to_string()))
                    .await
                    .unwrap();
            }

            while let Some(Ok(frame)) = socket.next().await {
                if frame.is_close() {
                    break;
                }
                let _ = server_seen_tx.send(frame);
            }
        });

        let handshake = ControlMessage::Handshake {
            session_id: "s1".into(),
            participant_id: "p1".into(),
            role: SpeakerRole::Human,
        };
        let (stream, stream_events) = StreamClient::connect(&format!("ws://{addr}"), handshake)
            .await
            .unwrap();

        let played = Arc::new(Mutex::new(Vec::new()));
        let played_clone = played.clone();
        let (playback_tx, playback_rx) = unbounded_channel();
        let playback = PlaybackQueue::spawn(
            move || {
                Ok(TestPlayer {
                    played: played_clone,
                    fail_sequences,
                })
            },
            playback_tx,
        )
        .unwrap();

        let (capture_tx, capture_rx) = unbounded_channel();
        let (command_tx, command_rx) = unbounded_channel();
        let (notice_tx, notice_rx) = unbounded_channel();

        let controller = SessionController::new(
            SessionOptions {
                auto_intro: false,
                hands_free: false,
            },
            FakeCapture,
            capture_rx,
            playback,
            playback_rx,
            stream,
            stream_events,
            command_rx,
            notice_tx,
        );
        let controller = tokio::spawn(controller.run());

        Self {
            capture_tx,
            command_tx,
            notice_rx,
            server_seen_rx,
            played,
            controller,
        }
    }

    fn send_clip(&self, payloads: &[&[u8]]) {
        let chunks = payloads
            .iter()
            .enumerate()
            .map(|(i, bytes)| AudioChunk::new(bytes.to_vec(), i as u64, ChunkEncoding::Wav))
            .collect();
        self.capture_tx
            .send(CaptureEvent::ClipReady(Clip {
                chunks,
                duration: Duration::from_millis(500),
                stop_cause: StopCause::Manual,
            }))
            .unwrap();
    }

    async fn next_server_frame(&mut self) -> Message {
        tokio::time::timeout(WAIT, self.server_seen_rx.recv())
            .await
            .expect("timed out waiting for server frame")
            .expect("server task ended early")
    }

    /// Playback, transcript, and state notices interleave in real time, so
    /// waiting for them one by one would drop whichever arrives early.
    /// Collect everything until the given condition holds over the whole
    /// prefix, then let the caller assert on it.
    async fn collect_notices_until<F>(&mut self, what: &str, mut done: F) -> Vec<SessionNotice>
    where
        F: FnMut(&[SessionNotice]) -> bool,
    {
        let mut seen = Vec::new();
        while !done(&seen) {
            let notice = tokio::time::timeout(WAIT, self.notice_rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
                .expect("notice channel closed");
            seen.push(notice);
        }
        seen
    }

    async fn shutdown(self) -> PipelineResult<()> {
        let _ = self.command_tx.send(SessionCommand::Shutdown);
        tokio::time::timeout(WAIT, self.controller)
            .await
            .expect("controller did not stop")
            .expect("controller task panicked")
    }
}

#[tokio::test]
async fn conversation_round_trip_and_rearm() {
    let mut harness = Harness::start(
        vec![
            ServerReply {
                chunks: vec![vec![10], vec![11], vec![12]],
                transcript: "Hello there.",
            },
            ServerReply {
                chunks: vec![vec![20]],
                transcript: "Anything else?",
            },
        ],
        vec![],
    )
    .await;

    // The handshake is the first frame on the wire and carries the session
    // identity.
    match harness.next_server_frame().await {
        Message::Text(text) => match ControlMessage::parse(&text).unwrap() {
            ControlMessage::Handshake {
                session_id,
                participant_id,
                role,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(participant_id, "p1");
                assert_eq!(role, SpeakerRole::Human);
            }
            other => panic!("expected handshake, got {other:?}"),
        },
        other => panic!("expected text handshake, got {other:?}"),
    }

    // First turn: two chunks, then end-of-audio, in that order.
    harness.command_tx.send(SessionCommand::StartRecording).unwrap();
    harness.send_clip(&[&[1], &[2]]);

    assert!(matches!(
        harness.next_server_frame().await,
        Message::Binary(b) if b == vec![1]
    ));
    assert!(matches!(
        harness.next_server_frame().await,
        Message::Binary(b) if b == vec![2]
    ));
    match harness.next_server_frame().await {
        Message::Text(text) => assert_eq!(
            ControlMessage::parse(&text).unwrap(),
            ControlMessage::EndOfAudio
        ),
        other => panic!("expected end-of-audio, got {other:?}"),
    }

    // The reply plays to completion in order, the transcript surfaces, and
    // the session re-arms after waiting for the reply.
    let seen = harness
        .collect_notices_until("first reply to finish", |seen| {
            seen.contains(&SessionNotice::ChunkPlayed(2))
                && seen.iter().any(|n| {
                    matches!(
                        n,
                        SessionNotice::Transcript { speaker: SpeakerRole::Agent, message, is_final: true }
                            if message == "Hello there."
                    )
                })
                && rearmed(seen)
        })
        .await;
    let played_notices: Vec<u64> = seen
        .iter()
        .filter_map(|n| match n {
            SessionNotice::ChunkPlayed(s) => Some(*s),
            _ => None,
        })
        .collect();
    assert_eq!(played_notices, vec![0, 1, 2]);

    // Second turn proves the loop: record again, get the next reply.
    harness.command_tx.send(SessionCommand::StartRecording).unwrap();
    harness.send_clip(&[&[3]]);
    assert!(matches!(
        harness.next_server_frame().await,
        Message::Binary(b) if b == vec![3]
    ));
    match harness.next_server_frame().await {
        Message::Text(text) => assert_eq!(
            ControlMessage::parse(&text).unwrap(),
            ControlMessage::EndOfAudio
        ),
        other => panic!("expected end-of-audio, got {other:?}"),
    }
    // Inbound sequences keep counting across turns.
    harness
        .collect_notices_until("second reply to finish", |seen| {
            seen.contains(&SessionNotice::ChunkPlayed(3))
                && seen.contains(&SessionNotice::StateChanged(SessionState::Armed))
        })
        .await;

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn undecodable_reply_chunk_is_skipped_not_fatal() {
    let mut harness = Harness::start(
        vec![ServerReply {
            chunks: vec![vec![10], vec![11], vec![12]],
            transcript: "Done.",
        }],
        vec![0],
    )
    .await;

    let _ = harness.next_server_frame().await; // handshake

    harness.command_tx.send(SessionCommand::StartRecording).unwrap();
    harness.send_clip(&[&[1]]);
    for _ in 0..2 {
        let _ = harness.next_server_frame().await; // chunk + end-of-audio
    }

    let seen = harness
        .collect_notices_until("skip and recovery", |seen| {
            seen.iter()
                .any(|n| matches!(n, SessionNotice::ChunkSkipped { sequence: 0, .. }))
                && seen.contains(&SessionNotice::ChunkPlayed(2))
                && rearmed(seen)
        })
        .await;
    assert!(!seen.contains(&SessionNotice::ChunkPlayed(0)));

    assert_eq!(*harness.played.lock().unwrap(), vec![1, 2]);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn server_disconnect_tears_the_session_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let _ = socket.next().await; // handshake
        let _ = socket.close(None).await;
    });

    let handshake = ControlMessage::Handshake {
        session_id: "s1".into(),
        participant_id: "p1".into(),
        role: SpeakerRole::Human,
    };
    let (stream, stream_events) = StreamClient::connect(&format!("ws://{addr}"), handshake)
        .await
        .unwrap();

    let played = Arc::new(Mutex::new(Vec::new()));
    let played_clone = played.clone();
    let (playback_tx, playback_rx) = unbounded_channel();
    let playback = PlaybackQueue::spawn(
        move || {
            Ok(TestPlayer {
                played: played_clone,
                fail_sequences: vec![],
            })
        },
        playback_tx,
    )
    .unwrap();

    let (_capture_tx, capture_rx) = unbounded_channel();
    let (_command_tx, command_rx) = unbounded_channel();
    let (notice_tx, mut notice_rx) = unbounded_channel();

    let controller = SessionController::new(
        SessionOptions {
            auto_intro: false,
            hands_free: false,
        },
        FakeCapture,
        capture_rx,
        playback,
        playback_rx,
        stream,
        stream_events,
        command_rx,
        notice_tx,
    );

    let result = tokio::time::timeout(WAIT, controller.run())
        .await
        .expect("controller did not stop");
    assert!(matches!(
        result,
        Err(voicewire::PipelineError::Connection(_))
    ));

    let mut saw_torn_down = false;
    while let Ok(notice) = notice_rx.try_recv() {
        if notice == SessionNotice::StateChanged(SessionState::TornDown) {
            saw_torn_down = true;
        }
    }
    assert!(saw_torn_down);
}
