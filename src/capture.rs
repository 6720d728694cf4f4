//! Microphone ownership, recording state machine, and clip assembly.
//!
//! The unit moves Cold -> Warm when the input device is acquired, Warm ->
//! Recording while a worker drains device frames, and back to Warm when the
//! clip is finalized. cpal delivers samples on its own callback thread;
//! frames cross into the capture loop through a bounded channel so the
//! callback never blocks and the loop keeps ownership of the audio.

use crate::config::VoiceLoopConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::protocol::{AudioChunk, ChunkEncoding};
use crate::resample;
use crate::vad::{frame_rms, VadEdge, VoiceActivityDetector};
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Why a recording ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// Explicit stop request.
    Manual,
    /// The hard duration cap force-stopped the recording.
    Cap,
    /// Hands-free mode detected trailing silence after speech.
    Silence,
    /// The device stream went away mid-recording.
    DeviceLost,
}

/// A finalized utterance: encoded chunks in capture order.
#[derive(Debug, Clone)]
pub struct Clip {
    pub chunks: Vec<AudioChunk>,
    pub duration: Duration,
    pub stop_cause: StopCause,
}

/// Events the unit emits on its outbound channel.
#[derive(Debug)]
pub enum CaptureEvent {
    /// VAD transition, for UI feedback and hands-free arming.
    SpeakingChanged(bool),
    /// A recording finished and its chunks are ready to send.
    ClipReady(Clip),
    /// The device failed mid-recording; the session should tear down.
    Failed(String),
}

/// The microphone side of the pipeline as the session controller sees it.
/// Results of recording arrive on the event channel handed to the
/// implementation at construction.
pub trait CaptureSource {
    fn warm_up(&mut self) -> PipelineResult<()>;
    fn start_recording(&mut self) -> PipelineResult<()>;
    fn stop_recording(&mut self);
    fn release(&mut self);
}

pub struct CaptureUnit {
    cfg: VoiceLoopConfig,
    preferred_device: Option<String>,
    events: UnboundedSender<CaptureEvent>,
    device: Option<cpal::Device>,
    stop_flag: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CaptureUnit {
    pub fn new(
        cfg: VoiceLoopConfig,
        preferred_device: Option<String>,
        events: UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            cfg,
            preferred_device,
            events,
            device: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            recording: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// List microphone names so the CLI can expose a human-friendly selector.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().context("no input devices available")?;
        let mut names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Acquire the input device. Idempotent: a second call while Warm or
    /// Recording is a no-op.
    fn acquire_device(&mut self) -> PipelineResult<()> {
        if self.device.is_some() {
            return Ok(());
        }
        let host = cpal::default_host();
        let device = match self.preferred_device.as_deref() {
            Some(name) => host
                .input_devices()
                .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| {
                    PipelineError::DeviceUnavailable(format!("input device '{name}' not found"))
                })?,
            None => host.default_input_device().ok_or_else(|| {
                PipelineError::DeviceUnavailable("no default input device".to_string())
            })?,
        };
        debug!(device = %device.name().unwrap_or_else(|_| "unknown".into()), "input device acquired");
        self.device = Some(device);
        Ok(())
    }
}

impl CaptureSource for CaptureUnit {
    fn warm_up(&mut self) -> PipelineResult<()> {
        self.acquire_device()
    }

    /// Begin buffering a new utterance. Valid only from Warm; a no-op while
    /// already Recording.
    fn start_recording(&mut self) -> PipelineResult<()> {
        let device = match self.device.as_ref() {
            Some(d) => d.clone(),
            None => {
                return Err(PipelineError::DeviceUnavailable(
                    "capture unit is cold; call warm_up first".to_string(),
                ))
            }
        };
        if self.recording.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::Release);

        let cfg = self.cfg.clone();
        let events = self.events.clone();
        let stop_flag = self.stop_flag.clone();
        let recording = self.recording.clone();
        // The cpal stream is !Send, so the worker thread builds and owns it.
        self.worker = Some(thread::spawn(move || {
            match record_clip(&device, &cfg, &stop_flag, &events) {
                Ok(clip) => {
                    let _ = events.send(CaptureEvent::ClipReady(clip));
                }
                Err(err) => {
                    let _ = events.send(CaptureEvent::Failed(format!("{err:#}")));
                }
            }
            recording.store(false, Ordering::Release);
        }));
        Ok(())
    }

    /// Request the running recording to finalize. The clip arrives on the
    /// event channel once the worker drains its last frame.
    fn stop_recording(&mut self) {
        if self.recording.load(Ordering::Acquire) {
            self.stop_flag.store(true, Ordering::Release);
        }
    }

    /// Stop any recording and drop the device handle on every exit path.
    fn release(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.device = None;
    }
}

impl Drop for CaptureUnit {
    fn drop(&mut self) {
        self.release();
    }
}

/// Open a device stream, pump frames through the capture loop, and finalize
/// the clip. The stream is paused and dropped before this returns, so device
/// handles never outlive a recording.
fn record_clip(
    device: &cpal::Device,
    cfg: &VoiceLoopConfig,
    stop_flag: &AtomicBool,
    events: &UnboundedSender<CaptureEvent>,
) -> Result<Clip> {
    let default_config = device
        .default_input_config()
        .context("failed to read input device config")?;
    let format = default_config.sample_format();
    let device_config: StreamConfig = default_config.into();
    let device_rate = device_config.sample_rate.0;
    let channels = usize::from(device_config.channels.max(1));
    let frame_samples = ((device_rate as u64 * cfg.frame_ms) / 1000).max(1) as usize;

    let (sender, receiver) = bounded::<Vec<f32>>(cfg.channel_capacity.max(1));
    let mut dispatcher = FrameDispatcher::new(frame_samples, sender);

    let err_fn = |err| warn!(error = %err, "audio stream error");
    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &device_config,
            move |data: &[f32], _| dispatcher.push(data, channels, |s| s),
            err_fn,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &device_config,
            move |data: &[i16], _| {
                dispatcher.push(data, channels, |s| s as f32 / 32_768.0)
            },
            err_fn,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &device_config,
            move |data: &[u16], _| {
                dispatcher.push(data, channels, |s| (s as f32 - 32_768.0) / 32_768.0)
            },
            err_fn,
            None,
        )?,
        other => return Err(anyhow!("unsupported sample format: {other:?}")),
    };
    stream.play()?;

    let outcome = run_capture_loop(&receiver, cfg, stop_flag, events);

    if let Err(err) = stream.pause() {
        debug!(error = %err, "failed to pause audio stream");
    }
    drop(stream);

    finalize_recording(outcome, device_rate, cfg)
}

pub(crate) struct CaptureOutcome {
    pub pcm: Vec<f32>,
    pub cause: StopCause,
    pub duration: Duration,
}

/// The recording state machine, separated from the device so it can run
/// against synthetic frame sources. Stops on explicit request, the hard
/// duration cap, hands-free trailing silence, or frame-source loss.
pub(crate) fn run_capture_loop(
    frames: &Receiver<Vec<f32>>,
    cfg: &VoiceLoopConfig,
    stop_flag: &AtomicBool,
    events: &UnboundedSender<CaptureEvent>,
) -> CaptureOutcome {
    let mut vad = VoiceActivityDetector::new(cfg.vad_threshold, cfg.silence_window);
    let mut pcm: Vec<f32> = Vec::new();
    let mut heard_speech = false;
    let started = Instant::now();
    let wait = Duration::from_millis(cfg.frame_ms);

    let cause = loop {
        if stop_flag.load(Ordering::Acquire) {
            break StopCause::Manual;
        }
        if started.elapsed() >= cfg.max_recording {
            break StopCause::Cap;
        }
        match frames.recv_timeout(wait) {
            Ok(frame) => {
                match vad.update_at(frame_rms(&frame), Instant::now()) {
                    Some(VadEdge::StartedSpeaking) => {
                        heard_speech = true;
                        let _ = events.send(CaptureEvent::SpeakingChanged(true));
                    }
                    Some(VadEdge::StoppedSpeaking) => {
                        let _ = events.send(CaptureEvent::SpeakingChanged(false));
                        if cfg.hands_free && heard_speech {
                            pcm.extend(frame);
                            break StopCause::Silence;
                        }
                    }
                    None => {}
                }
                pcm.extend(frame);
            }
            // The cap check at the top of the loop covers idle periods.
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break StopCause::DeviceLost,
        }
    };

    CaptureOutcome {
        pcm,
        cause,
        duration: started.elapsed(),
    }
}

/// Convert a finished recording from the device rate to the configured
/// capture rate, then chunk it.
pub(crate) fn finalize_recording(
    outcome: CaptureOutcome,
    device_rate: u32,
    cfg: &VoiceLoopConfig,
) -> Result<Clip> {
    let pcm = resample::to_rate(&outcome.pcm, device_rate, cfg.sample_rate)
        .context("failed to resample recording")?;
    Ok(finish_clip(pcm, cfg.sample_rate, cfg, outcome.cause, outcome.duration))
}

/// Split captured PCM into chunk-sized WAV segments in capture order.
pub(crate) fn finish_clip(
    pcm: Vec<f32>,
    sample_rate: u32,
    cfg: &VoiceLoopConfig,
    stop_cause: StopCause,
    duration: Duration,
) -> Clip {
    let chunk_samples = ((sample_rate as u64 * cfg.chunk_ms) / 1000).max(1) as usize;
    let chunks = pcm
        .chunks(chunk_samples)
        .enumerate()
        .map(|(i, samples)| {
            AudioChunk::new(encode_wav(samples, sample_rate), i as u64, ChunkEncoding::Wav)
        })
        .collect();
    Clip {
        chunks,
        duration,
        stop_cause,
    }
}

/// Encode one chunk of mono f32 PCM as a standalone 16-bit WAV segment.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        // Writing to an in-memory cursor cannot fail.
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .expect("wav header write to memory buffer");
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * 32_767.0) as i16;
            writer.write_sample(value).expect("wav sample write");
        }
        writer.finalize().expect("wav finalize");
    }
    cursor.into_inner()
}

/// Accumulates callback buffers into fixed-size analysis frames and hands
/// them to the capture loop without ever blocking the audio thread.
struct FrameDispatcher {
    frame_samples: usize,
    pending: Vec<f32>,
    scratch: Vec<f32>,
    sender: Sender<Vec<f32>>,
}

impl FrameDispatcher {
    fn new(frame_samples: usize, sender: Sender<Vec<f32>>) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
            scratch: Vec::new(),
            sender,
        }
    }

    fn push<T, F>(&mut self, data: &[T], channels: usize, convert: F)
    where
        T: Copy,
        F: FnMut(T) -> f32,
    {
        self.scratch.clear();
        append_downmixed(&mut self.scratch, data, channels, convert);
        self.pending.extend_from_slice(&self.scratch);

        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            match self.sender.try_send(frame) {
                Ok(()) => {}
                // Dropping a frame under backpressure beats stalling the
                // device callback.
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }
}

/// Downmix interleaved multi-channel input to mono while converting to f32.
fn append_downmixed<T, F>(buf: &mut Vec<f32>, data: &[T], channels: usize, mut convert: F)
where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }
    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}
