//! Simple energy-based Voice Activity Detection (VAD).
//!
//! [`VadDetector`] answers two questions for the push-to-talk recorder:
//!
//! * is this chunk voiced?  (drives the hybrid-mode silence clock), and
//! * does a finished recording contain speech at all?  (`speech_detected`).
//!
//! ## Algorithm
//!
//! Audio is split into 30 ms frames.  A frame is classified as *voice* when
//! its RMS amplitude exceeds the threshold.  A recording contains speech when
//! at least [`MIN_SPEECH_MS`] worth of frames are voiced.
//!
//! ## Aggressiveness
//!
//! Like WebRTC VAD, aggressiveness runs from `0` (most permissive) to `3`
//! (most eager to call a frame silence); it selects the RMS threshold.

/// Minimum voiced audio, in milliseconds, for a recording to count as speech.
pub const MIN_SPEECH_MS: u32 = 90;

/// Frame length used for classification.
const FRAME_MS: u32 = 30;

/// RMS thresholds indexed by aggressiveness.
const THRESHOLDS: [f32; 4] = [0.005, 0.01, 0.02, 0.035];

// ---------------------------------------------------------------------------
// VadDetector
// ---------------------------------------------------------------------------

/// Energy-based speech detector.
///
/// # Example
///
/// ```rust
/// use ptt_voice::audio::VadDetector;
///
/// let vad = VadDetector::from_aggressiveness(2);
///
/// let silence = vec![0.0_f32; 16_000];
/// assert!(!vad.contains_speech(&silence, 16_000));
///
/// let voice = vec![0.3_f32; 16_000];
/// assert!(vad.contains_speech(&voice, 16_000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDetector {
    /// RMS amplitude threshold; frames below this are considered silence.
    rms_threshold: f32,
}

impl VadDetector {
    /// Create a [`VadDetector`] with an explicit RMS threshold in `[0.0, 1.0]`.
    pub fn new(rms_threshold: f32) -> Self {
        Self { rms_threshold }
    }

    /// Create a detector from a `0..=3` aggressiveness level.  Larger values
    /// are clamped to `3`.
    pub fn from_aggressiveness(level: u8) -> Self {
        Self::new(THRESHOLDS[usize::from(level.min(3))])
    }

    /// RMS threshold currently in use.
    pub fn threshold(&self) -> f32 {
        self.rms_threshold
    }

    /// Root-mean-square amplitude of `samples` (`0.0` when empty).
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let mean_sq: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
        mean_sq.sqrt()
    }

    /// Returns `true` when the chunk's energy is above the threshold.
    pub fn is_voice(&self, chunk: &[f32]) -> bool {
        !chunk.is_empty() && Self::rms(chunk) > self.rms_threshold
    }

    /// Returns `true` when at least [`MIN_SPEECH_MS`] of `audio` is voiced.
    pub fn contains_speech(&self, audio: &[f32], sample_rate: u32) -> bool {
        if audio.is_empty() || sample_rate == 0 {
            return false;
        }
        let frame_size = ((sample_rate * FRAME_MS) / 1_000).max(1) as usize;
        let needed = MIN_SPEECH_MS.div_ceil(FRAME_MS) as usize;

        audio
            .chunks(frame_size)
            .filter(|frame| self.is_voice(frame))
            .take(needed)
            .count()
            >= needed
    }
}

impl Default for VadDetector {
    fn default() -> Self {
        Self::from_aggressiveness(2)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggressiveness_selects_threshold_and_clamps() {
        assert!((VadDetector::from_aggressiveness(0).threshold() - 0.005).abs() < 1e-7);
        assert!((VadDetector::from_aggressiveness(3).threshold() - 0.035).abs() < 1e-7);
        assert_eq!(
            VadDetector::from_aggressiveness(9),
            VadDetector::from_aggressiveness(3)
        );
    }

    #[test]
    fn rms_of_constant_signal() {
        assert!((VadDetector::rms(&[0.5; 100]) - 0.5).abs() < 1e-6);
        assert_eq!(VadDetector::rms(&[]), 0.0);
    }

    #[test]
    fn short_blip_is_not_speech() {
        // 30 ms of voice inside a second of silence.
        let mut audio = vec![0.0_f32; 16_000];
        audio[8_000..8_480].iter_mut().for_each(|s| *s = 0.5);
        assert!(!VadDetector::default().contains_speech(&audio, 16_000));
    }

    #[test]
    fn sustained_voice_is_speech() {
        let mut audio = vec![0.0_f32; 16_000];
        audio[4_000..8_000].iter_mut().for_each(|s| *s = 0.2);
        assert!(VadDetector::default().contains_speech(&audio, 16_000));
    }

    #[test]
    fn quiet_voice_depends_on_aggressiveness() {
        let audio = vec![0.015_f32; 16_000];
        assert!(VadDetector::from_aggressiveness(1).contains_speech(&audio, 16_000));
        assert!(!VadDetector::from_aggressiveness(3).contains_speech(&audio, 16_000));
    }

    #[test]
    fn empty_or_zero_rate_is_not_speech() {
        let vad = VadDetector::default();
        assert!(!vad.contains_speech(&[], 16_000));
        assert!(!vad.contains_speech(&[0.5; 100], 0));
    }
}
