use duplex_domain::{Config, VadConfig};

/// Energy-threshold voice activity detector with a cooldown window that
/// suppresses self-triggering immediately after TTS playback begins.
///
/// Consumes raw 16-bit signed mono PCM frames. Sample rate is a host
/// concern — the gate only reasons about relative energy and frame counts.
#[derive(Debug, Clone, Copy)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    consecutive_speech_frames: u32,
    cooldown_remaining: u32,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            consecutive_speech_frames: 0,
            cooldown_remaining: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.vad)
    }

    /// Feeds one PCM frame. Returns true once `min_speech_frames`
    /// consecutive frames have exceeded the energy threshold, outside of
    /// an active cooldown window.
    pub fn detect(&mut self, frame: &[i16]) -> bool {
        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            self.consecutive_speech_frames = 0;
            return false;
        }

        if self.rms_energy(frame) > self.config.energy_threshold {
            self.consecutive_speech_frames += 1;
        } else {
            self.consecutive_speech_frames = 0;
        }

        self.consecutive_speech_frames >= self.config.min_speech_frames
    }

    /// Arms the self-trigger cooldown and resets the speech counter. Call
    /// this immediately before each outgoing speech act so the detector
    /// doesn't mistake our own TTS for user speech.
    pub fn start_tts_cooldown(&mut self) {
        self.consecutive_speech_frames = 0;
        self.cooldown_remaining = self.config.tts_cooldown_frames;
    }

    pub fn reset(&mut self) {
        self.consecutive_speech_frames = 0;
        self.cooldown_remaining = 0;
    }

    /// RMS energy of a 16-bit PCM frame, normalized to `[-1.0, 1.0]`.
    fn rms_energy(&self, frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = frame
            .iter()
            .map(|&s| {
                let normalized = s as f64 / i16::MAX as f64;
                normalized * normalized
            })
            .sum();
        ((sum_sq / frame.len() as f64).sqrt()) as f32
    }
}
