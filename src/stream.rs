//! Duplex WebSocket transport for a voice session.
//!
//! The client connects, sends the handshake before anything else, and then
//! splits the socket: outbound frames go through `send_audio`/`send_control`
//! in call order, while a reader task demuxes inbound traffic into a single
//! event stream. Binary frames are audio; text frames are JSON control
//! messages. There is no automatic reconnect: a drop ends the session.

use crate::error::{PipelineError, PipelineResult};
use crate::protocol::{AudioChunk, ChunkEncoding, ControlMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Everything the connection can hand the session controller.
#[derive(Debug)]
pub enum StreamEvent {
    Control(ControlMessage),
    Audio(AudioChunk),
    /// The peer closed or the transport failed. Terminal.
    Closed(Option<String>),
}

pub struct StreamClient {
    writer: WsWriter,
    reader_task: JoinHandle<()>,
}

impl StreamClient {
    /// Connect and bind the socket to a session. The handshake goes out
    /// before this returns, so no audio can ever precede it.
    pub async fn connect(
        url: &str,
        handshake: ControlMessage,
    ) -> PipelineResult<(Self, UnboundedReceiver<StreamEvent>)> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| PipelineError::Connection(format!("connect to {url}: {e}")))?;
        let (mut writer, reader) = socket.split();

        writer
            .send(Message::Text(handshake.to_json()))
            .await
            .map_err(|e| PipelineError::Connection(format!("handshake: {e}")))?;

        let (events_tx, events_rx) = unbounded_channel();
        let reader_task = tokio::spawn(read_loop(reader, events_tx));

        Ok((
            Self {
                writer,
                reader_task,
            },
            events_rx,
        ))
    }

    /// Send one encoded chunk as a binary frame. Frames leave in call order.
    pub async fn send_audio(&mut self, chunk: &AudioChunk) -> PipelineResult<()> {
        self.writer
            .send(Message::Binary(chunk.bytes.clone()))
            .await
            .map_err(|e| PipelineError::Connection(format!("send chunk {}: {e}", chunk.sequence)))
    }

    /// Send one control message as a text frame.
    pub async fn send_control(&mut self, message: &ControlMessage) -> PipelineResult<()> {
        self.writer
            .send(Message::Text(message.to_json()))
            .await
            .map_err(|e| PipelineError::Connection(format!("send control: {e}")))
    }

    /// Close the connection and stop the reader. Idempotent in effect; the
    /// peer sees at most one close frame.
    pub async fn close(&mut self) {
        let _ = self.writer.send(Message::Close(None)).await;
        let _ = self.writer.close().await;
        self.reader_task.abort();
    }
}

/// Demux inbound frames until the socket ends. Inbound chunks are stamped
/// with a local arrival sequence so playback order is observable downstream.
async fn read_loop(mut reader: WsReader, events: UnboundedSender<StreamEvent>) {
    let mut next_sequence: u64 = 0;
    loop {
        match reader.next().await {
            Some(Ok(Message::Binary(bytes))) => {
                let chunk = AudioChunk::new(bytes, next_sequence, ChunkEncoding::Remote);
                next_sequence += 1;
                if events.send(StreamEvent::Audio(chunk)).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Text(text))) => match ControlMessage::parse(&text) {
                Ok(message) => {
                    if events.send(StreamEvent::Control(message)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "dropping malformed control frame");
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.to_string());
                debug!(?reason, "peer closed connection");
                let _ = events.send(StreamEvent::Closed(reason));
                break;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(err)) => {
                let _ = events.send(StreamEvent::Closed(Some(err.to_string())));
                break;
            }
            None => {
                let _ = events.send(StreamEvent::Closed(None));
                break;
            }
        }
    }
}
