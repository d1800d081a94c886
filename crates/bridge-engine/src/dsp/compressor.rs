//! Feed-forward dynamics compressor (§4.5 "Compressor"): threshold/ratio/attack/release
//! with soft knee, optional stereo link, makeup gain, ±1 soft-clip on the output.
//! Grounded on the teacher's dead `dsp/compressor.rs` (RMS envelope, attack/release
//! coefficients, soft-knee gain reduction), generalized here from a fixed preset to the
//! full `CompressorConfig` and to f32.

use crate::pcm::soft_clip;
use bridge_core::CompressorConfig;

pub struct CompressorEngine {
    config: CompressorConfig,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: Vec<f32>,
}

impl CompressorEngine {
    pub fn new(config: CompressorConfig, sample_rate: u32, channels: u16) -> Self {
        let attack_coeff = ms_to_coeff(config.attack_ms, sample_rate);
        let release_coeff = ms_to_coeff(config.release_ms, sample_rate);
        let envelope_channels = if config.link_stereo { 1 } else { channels.max(1) as usize };
        Self { config, attack_coeff, release_coeff, envelope: vec![0.0; envelope_channels] }
    }

    pub fn process(&mut self, samples: &mut [f32], channels: u16) {
        if !self.config.enabled {
            return;
        }
        let channels = channels.max(1) as usize;
        let frames = samples.len() / channels;

        for frame in 0..frames {
            let base = frame * channels;

            let detector_level = if self.config.link_stereo {
                samples[base..base + channels].iter().map(|s| s.abs()).fold(0.0_f32, f32::max)
            } else {
                0.0
            };

            for ch in 0..channels {
                let env_idx = if self.config.link_stereo { 0 } else { ch };
                let x = samples[base + ch];
                let level = if self.config.link_stereo { detector_level } else { x.abs() };

                let squared = level * level;
                let env = &mut self.envelope[env_idx];
                if squared > *env {
                    *env = self.attack_coeff * *env + (1.0 - self.attack_coeff) * squared;
                } else {
                    *env = self.release_coeff * *env + (1.0 - self.release_coeff) * squared;
                }

                let rms = env.sqrt();
                let level_db = if rms > 1e-6 { 20.0 * rms.log10() } else { -120.0 };
                let gain_db = self.gain_reduction_db(level_db) + self.config.makeup_db;
                let gain = 10_f32.powf(gain_db / 20.0);
                samples[base + ch] = x * gain;
            }
        }

        soft_clip(&mut samples[..frames * channels]);
    }

    /// Soft-knee gain reduction in dB: a quadratic blend over `knee_db` centered on the
    /// threshold, falling back to a hard knee above/below the knee window.
    fn gain_reduction_db(&self, level_db: f32) -> f32 {
        let threshold = self.config.threshold_db;
        let ratio = self.config.ratio.max(1.0);
        let knee = self.config.knee_db.max(0.0);

        if knee <= 0.0 {
            return if level_db > threshold { -(level_db - threshold) * (1.0 - 1.0 / ratio) } else { 0.0 };
        }

        let lower = threshold - knee / 2.0;
        let upper = threshold + knee / 2.0;

        if level_db < lower {
            0.0
        } else if level_db > upper {
            -(level_db - threshold) * (1.0 - 1.0 / ratio)
        } else {
            let delta = level_db - lower;
            let slope = (1.0 - 1.0 / ratio) / (2.0 * knee);
            -(slope * delta * delta)
        }
    }
}

fn ms_to_coeff(ms: f32, sample_rate: u32) -> f32 {
    if ms <= 0.0 {
        return 0.0;
    }
    (-1.0 / (ms / 1000.0 * sample_rate as f32)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> CompressorConfig {
        CompressorConfig {
            enabled: true,
            threshold_db: -18.0,
            ratio: 4.0,
            attack_ms: 5.0,
            release_ms: 50.0,
            makeup_db: 0.0,
            knee_db: 6.0,
            link_stereo: true,
        }
    }

    #[test]
    fn disabled_is_identity() {
        let mut config = enabled_config();
        config.enabled = false;
        let mut eng = CompressorEngine::new(config, 48000, 2);
        let original = vec![0.9_f32, 0.9, -0.9, -0.9];
        let mut samples = original.clone();
        eng.process(&mut samples, 2);
        assert_eq!(samples, original);
    }

    #[test]
    fn loud_signal_is_attenuated_over_time() {
        let mut eng = CompressorEngine::new(enabled_config(), 48000, 1);
        let sample_rate = 48000.0_f32;
        let mut samples: Vec<f32> =
            (0..4800).map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / sample_rate).sin() * 0.9).collect();
        let input_peak = samples.iter().cloned().fold(0.0_f32, f32::max);
        eng.process(&mut samples, 1);
        let output_peak = samples.iter().cloned().fold(0.0_f32, f32::max);
        assert!(output_peak < input_peak);
    }

    #[test]
    fn quiet_signal_below_threshold_is_unaffected() {
        let mut eng = CompressorEngine::new(enabled_config(), 48000, 1);
        let sample_rate = 48000.0_f32;
        let samples: Vec<f32> =
            (0..4800).map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / sample_rate).sin() * 0.01).collect();
        let mut processed = samples.clone();
        eng.process(&mut processed, 1);
        for (a, b) in samples.iter().zip(processed.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }
}
