//! Loudness-based voice activity detection with hysteresis.
//!
//! One detector instance lives per capture session and is fed one RMS sample
//! per analysis frame. A rising edge fires as soon as a frame crosses the
//! threshold; a falling edge only fires after the signal has stayed below the
//! threshold for the full silence window, so brief dips never flap the state.

use std::time::{Duration, Instant};

/// Reported when a call to `update` flips the speaking state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VadEdge {
    StartedSpeaking,
    StoppedSpeaking,
}

pub struct VoiceActivityDetector {
    threshold: f32,
    silence_window: Duration,
    speaking: bool,
    last_voice: Instant,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f32, silence_window: Duration) -> Self {
        Self {
            threshold,
            silence_window,
            speaking: false,
            last_voice: Instant::now(),
        }
    }

    /// Feed one RMS sample using the wall clock; returns the current state.
    pub fn update(&mut self, rms: f32) -> bool {
        self.update_at(rms, Instant::now());
        self.speaking
    }

    /// Feed one RMS sample with an explicit timestamp. Returns the edge if
    /// this sample flipped the state, `None` if the state held.
    pub fn update_at(&mut self, rms: f32, now: Instant) -> Option<VadEdge> {
        if rms > self.threshold {
            self.last_voice = now;
            if !self.speaking {
                self.speaking = true;
                return Some(VadEdge::StartedSpeaking);
            }
        } else if self.speaking
            && now.duration_since(self.last_voice) > self.silence_window
        {
            self.speaking = false;
            return Some(VadEdge::StoppedSpeaking);
        }
        None
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn time_since_last_speech(&self) -> Duration {
        self.last_voice.elapsed()
    }

    /// Forget everything; called when capture restarts.
    pub fn reset(&mut self) {
        self.speaking = false;
        self.last_voice = Instant::now();
    }
}

/// RMS of one analysis frame of mono PCM.
pub fn frame_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    energy.sqrt()
}
