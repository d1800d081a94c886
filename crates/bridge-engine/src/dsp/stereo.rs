//! Mid/side stereo enhancer (§4.5 "Stereo"): independent mid/side gain plus an optional
//! Haas delay on the side channel, mono passthrough. Grounded on the teacher's dead
//! `dsp/stereo_width.rs` (single `width` scalar M/S matrix), generalized here to
//! independent `mid_gain_db`/`side_gain_db` and a short delay line for the Haas effect.

use bridge_core::StereoConfig;
use std::collections::VecDeque;

pub struct StereoEngine {
    config: StereoConfig,
    mid_gain: f32,
    side_gain: f32,
    haas_delay: VecDeque<f32>,
}

impl StereoEngine {
    pub fn new(config: StereoConfig, sample_rate: u32) -> Self {
        let mid_gain = db_to_linear(config.mid_gain_db);
        let side_gain = db_to_linear(config.side_gain_db);
        let delay_frames = (config.haas_ms.max(0.0) / 1000.0 * sample_rate as f32) as usize;
        Self { config, mid_gain, side_gain, haas_delay: VecDeque::from(vec![0.0_f32; delay_frames.max(1)]) }
    }

    /// `channels == 1` is a pass-through; the mid/side matrix only applies to stereo.
    pub fn process(&mut self, samples: &mut [f32], channels: u16) {
        if !self.config.enabled || channels != 2 {
            return;
        }

        for chunk in samples.chunks_exact_mut(2) {
            let left = chunk[0];
            let right = chunk[1];

            let mid = (left + right) * 0.5 * self.mid_gain;
            let mut side = (left - right) * 0.5 * self.side_gain;

            if self.config.haas_ms > 0.0 {
                self.haas_delay.push_back(side);
                side = self.haas_delay.pop_front().unwrap_or(0.0);
            }

            chunk[0] = mid + side;
            chunk[1] = mid - side;
        }
    }
}

fn db_to_linear(db: f32) -> f32 {
    10_f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StereoConfig {
        StereoConfig { enabled: true, mid_gain_db: 0.0, side_gain_db: 0.0, haas_ms: 0.0 }
    }

    #[test]
    fn mono_signal_is_unchanged() {
        let mut eng = StereoEngine::new(config(), 44100);
        let mut samples = vec![0.5_f32, 0.5, -0.3, -0.3];
        let original = samples.clone();
        eng.process(&mut samples, 2);
        assert_eq!(samples, original);
    }

    #[test]
    fn zero_side_gain_collapses_to_mono() {
        let mut cfg = config();
        cfg.side_gain_db = -96.0;
        let mut eng = StereoEngine::new(cfg, 44100);
        let mut samples = vec![1.0_f32, 0.2];
        eng.process(&mut samples, 2);
        assert!((samples[0] - samples[1]).abs() < 1e-3);
    }

    #[test]
    fn disabled_bypasses_matrix() {
        let mut cfg = config();
        cfg.enabled = false;
        cfg.side_gain_db = -96.0;
        let mut eng = StereoEngine::new(cfg, 44100);
        let original = vec![1.0_f32, 0.2];
        let mut samples = original.clone();
        eng.process(&mut samples, 2);
        assert_eq!(samples, original);
    }
}
