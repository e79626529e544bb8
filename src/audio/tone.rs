//! Diagnostic sine tone for checking the output path without the model

use std::f32::consts::PI;

pub const TEST_TONE_HZ: f32 = 440.0;

/// Interleaved sine at `frequency` Hz, same value on every channel
pub fn sine_tone(frequency: f32, duration_secs: f32, sample_rate: u32, channels: u16, amplitude: f32) -> Vec<f32> {
    let frames = (duration_secs.max(0.0) * sample_rate as f32) as usize;
    let channels = usize::from(channels.max(1));
    let step = 2.0 * PI * frequency / sample_rate.max(1) as f32;

    let mut samples = Vec::with_capacity(frames * channels);
    for i in 0..frames {
        let value = (i as f32 * step).sin() * amplitude;
        samples.extend(std::iter::repeat(value).take(channels));
    }
    samples
}

/// The 440 Hz test tone at 30% level
pub fn test_tone(duration_secs: f32, sample_rate: u32, channels: u16) -> Vec<f32> {
    sine_tone(TEST_TONE_HZ, duration_secs, sample_rate, channels, 0.3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_shape() {
        let tone = test_tone(0.5, 48_000, 2);
        assert_eq!(tone.len(), 24_000 * 2);
        assert!(tone.iter().all(|s| s.abs() <= 0.3 + f32::EPSILON));
        // Channels carry the same signal
        assert!(tone.chunks_exact(2).all(|f| f[0] == f[1]));
    }

    #[test]
    fn test_negative_duration_is_empty() {
        assert!(sine_tone(440.0, -1.0, 48_000, 1, 1.0).is_empty());
    }
}
