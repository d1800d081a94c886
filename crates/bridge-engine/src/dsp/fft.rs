//! Overlap-block FFT EQ engine (§4.5 "FFT"): frequency-domain mask computed from the
//! band curve, applied to the spectrum of each fixed-size block. Latency is exactly one
//! block (`block_size / sample_rate`, ~50 ms at 2048 @ 44.1 kHz). No teacher counterpart
//! (`dsp/mod.rs` wires only dither/eq/headroom/resampler) — new, grounded in the same
//! band-curve math as `iir.rs` via `biquad_math` so the two engines agree.

use super::biquad_math::band_curve_magnitude;
use super::EqEngine;
use bridge_core::EqConfig;
use rustfft::{num_complex::Complex32, Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::Arc;

const DEFAULT_BLOCK_SIZE: usize = 2048;

pub struct FftEq {
    block_size: usize,
    mask: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    input_buf: Vec<Vec<f32>>,
    output_queue: Vec<VecDeque<f32>>,
}

impl FftEq {
    pub fn new(config: &EqConfig, sample_rate: u32, channels: u16) -> Self {
        let block_size = config.block_size.unwrap_or(DEFAULT_BLOCK_SIZE).max(16);
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(block_size);
        let ifft = planner.plan_fft_inverse(block_size);

        let mask = build_mask(&config.bands, block_size, sample_rate as f32);

        let channels = channels.max(1) as usize;
        Self {
            block_size,
            mask,
            fft,
            ifft,
            input_buf: vec![Vec::with_capacity(block_size); channels],
            output_queue: vec![VecDeque::new(); channels],
        }
    }

    fn process_block(&self, block: &[f32]) -> Vec<f32> {
        let mut spectrum: Vec<Complex32> = block.iter().map(|&s| Complex32::new(s, 0.0)).collect();
        self.fft.process(&mut spectrum);

        for (bin, sample) in spectrum.iter_mut().enumerate() {
            *sample *= self.mask[bin];
        }

        self.ifft.process(&mut spectrum);
        let norm = self.block_size as f32;
        spectrum.iter().map(|c| c.re / norm).collect()
    }
}

/// Build a real, conjugate-symmetric (phase-zero) magnitude mask from the band curve.
/// Symmetry is exactly what keeps the filter linear-phase per §4.5.
fn build_mask(bands: &[bridge_core::EqBand], block_size: usize, sample_rate: f32) -> Vec<f32> {
    let mut mask = vec![1.0_f32; block_size];
    let half = block_size / 2;
    for bin in 0..=half {
        let freq_hz = bin as f32 * sample_rate / block_size as f32;
        let gain = band_curve_magnitude(bands, freq_hz, sample_rate);
        mask[bin] = gain;
        if bin != 0 && bin != half {
            mask[block_size - bin] = gain;
        }
    }
    mask
}

impl EqEngine for FftEq {
    fn process(&mut self, samples: &mut [f32], channels: u16) {
        let channels = channels.max(1) as usize;
        let frames = samples.len() / channels;

        for frame in 0..frames {
            for ch in 0..channels {
                self.input_buf[ch].push(samples[frame * channels + ch]);
            }
        }

        for ch in 0..channels {
            while self.input_buf[ch].len() >= self.block_size {
                let block: Vec<f32> = self.input_buf[ch].drain(..self.block_size).collect();
                let processed = self.process_block(&block);
                self.output_queue[ch].extend(processed);
            }
        }

        for frame in 0..frames {
            for ch in 0..channels {
                samples[frame * channels + ch] = self.output_queue[ch].pop_front().unwrap_or(0.0);
            }
        }
    }

    fn latency_frames(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{EqConfig, EqEngineKind};

    fn flat_config(block_size: usize) -> EqConfig {
        EqConfig { engine: EqEngineKind::Fft, bands: vec![], block_size: Some(block_size), taps: None }
    }

    #[test]
    fn flat_mask_is_identity_after_latency() {
        let block_size = 64;
        let mut eq = FftEq::new(&flat_config(block_size), 44100, 1);

        let total_frames = block_size * 3;
        let input: Vec<f32> = (0..total_frames).map(|i| ((i as f32) * 0.1).sin() * 0.3).collect();
        let mut samples = input.clone();
        eq.process(&mut samples, 1);

        // After one block of latency, output should match the delayed input closely.
        for i in 0..block_size {
            let delayed_idx = i;
            let out_idx = i + block_size;
            assert!((samples[out_idx] - input[delayed_idx]).abs() < 1e-3);
        }
    }
}
