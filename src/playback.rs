//! Ordered playback of inbound audio chunks.
//!
//! Chunks play strictly in arrival order, one at a time. Enqueueing never
//! blocks the caller: chunks cross into a dedicated driver thread that owns
//! the output device and renders serially. A chunk that fails to decode is
//! skipped with a warning and the queue moves on.

use crate::error::{PipelineError, PipelineResult};
use crate::protocol::AudioChunk;
use crossbeam_channel::{unbounded, Sender};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Progress events emitted by the driver thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { sequence: u64 },
    Finished { sequence: u64 },
    /// The chunk could not be decoded or rendered and was dropped.
    Skipped { sequence: u64, reason: String },
}

/// Renders one chunk to completion. Implementations own whatever device
/// state they need; the driver thread calls them serially.
pub trait ChunkPlayer {
    fn play(&mut self, chunk: &AudioChunk) -> PipelineResult<()>;
}

/// Speaker output through rodio. Built on the driver thread because the
/// underlying output stream cannot move between threads.
pub struct RodioPlayer {
    _stream: rodio::OutputStream,
    handle: rodio::OutputStreamHandle,
}

impl RodioPlayer {
    pub fn open() -> PipelineResult<Self> {
        let (stream, handle) = rodio::OutputStream::try_default()
            .map_err(|e| PipelineError::DeviceUnavailable(format!("audio output: {e}")))?;
        Ok(Self {
            _stream: stream,
            handle,
        })
    }
}

impl ChunkPlayer for RodioPlayer {
    fn play(&mut self, chunk: &AudioChunk) -> PipelineResult<()> {
        let source = rodio::Decoder::new(Cursor::new(chunk.bytes.clone())).map_err(|e| {
            PipelineError::Decode {
                sequence: chunk.sequence,
                reason: e.to_string(),
            }
        })?;
        let sink = rodio::Sink::try_new(&self.handle)
            .map_err(|e| PipelineError::DeviceUnavailable(format!("audio output: {e}")))?;
        sink.append(source);
        sink.sleep_until_end();
        Ok(())
    }
}

struct QueuedChunk {
    chunk: AudioChunk,
    epoch: u64,
}

/// Handle to the playback driver. Dropping it (or calling `close`) shuts the
/// driver down after the chunk currently rendering.
pub struct PlaybackQueue {
    sender: Option<Sender<QueuedChunk>>,
    epoch: Arc<AtomicU64>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PlaybackQueue {
    /// Spawn the driver thread with a player built by `make_player`. The
    /// factory runs on the driver thread, so players that are not `Send`
    /// (like the rodio output) work too.
    pub fn spawn<F, P>(
        make_player: F,
        events: UnboundedSender<PlaybackEvent>,
    ) -> PipelineResult<Self>
    where
        F: FnOnce() -> PipelineResult<P> + Send + 'static,
        P: ChunkPlayer,
    {
        let (sender, receiver) = unbounded::<QueuedChunk>();
        let epoch = Arc::new(AtomicU64::new(0));
        let epoch_clone = epoch.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<PipelineResult<()>>(1);

        let worker = thread::spawn(move || {
            let mut player = match make_player() {
                Ok(player) => {
                    let _ = ready_tx.send(Ok(()));
                    player
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            while let Ok(queued) = receiver.recv() {
                // Anything enqueued before the last clear is stale.
                if queued.epoch != epoch_clone.load(Ordering::Acquire) {
                    debug!(sequence = queued.chunk.sequence, "dropping stale chunk");
                    continue;
                }
                let sequence = queued.chunk.sequence;
                let _ = events.send(PlaybackEvent::Started { sequence });
                match player.play(&queued.chunk) {
                    Ok(()) => {
                        let _ = events.send(PlaybackEvent::Finished { sequence });
                    }
                    Err(err) => {
                        warn!(sequence, error = %err, "skipping unplayable chunk");
                        let _ = events.send(PlaybackEvent::Skipped {
                            sequence,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                sender: Some(sender),
                epoch,
                worker: Some(worker),
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => Err(PipelineError::DeviceUnavailable(
                "playback driver died during startup".to_string(),
            )),
        }
    }

    /// Spawn with speaker output. Opening the output stream here doubles as
    /// the one-time audio unlock.
    pub fn open(events: UnboundedSender<PlaybackEvent>) -> PipelineResult<Self> {
        Self::spawn(RodioPlayer::open, events)
    }

    /// Add a chunk to the tail of the queue. Never blocks.
    pub fn enqueue(&self, chunk: AudioChunk) {
        let epoch = self.epoch.load(Ordering::Acquire);
        if let Some(sender) = &self.sender {
            let _ = sender.send(QueuedChunk { chunk, epoch });
        }
    }

    /// Drop every queued chunk. The chunk currently rendering finishes.
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Stop accepting chunks, drain what is already queued, and wait for
    /// the driver to finish. Call `clear` first to drop pending chunks
    /// instead.
    pub fn close(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Async close: the driver may still be rendering a chunk, so the join
    /// runs on the blocking pool instead of stalling the runtime.
    pub async fn close_async(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.close();
    }
}
