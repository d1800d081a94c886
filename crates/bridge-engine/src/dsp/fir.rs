//! Direct-form linear-phase FIR EQ engine (§4.5 "FIR"): highest quality, highest CPU,
//! latency = (taps-1)/2 / sample_rate. Taps are derived from the same frequency-domain
//! mask the FFT engine uses, via the window method (inverse DFT + Hamming window), then
//! applied as ordinary time-domain convolution. No teacher counterpart — new, grounded
//! in `biquad_math` for the mask and in `fft.rs`'s `rustfft` usage for the IDFT.

use super::biquad_math::band_curve_magnitude;
use super::EqEngine;
use bridge_core::{EqBand, EqConfig};
use rustfft::{num_complex::Complex32, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;

const DEFAULT_TAPS: usize = 255;

pub struct FirEq {
    taps: Vec<f32>,
    history: Vec<VecDeque<f32>>,
}

impl FirEq {
    pub fn new(config: &EqConfig, sample_rate: u32, channels: u16) -> Self {
        let num_taps = odd(config.taps.unwrap_or(DEFAULT_TAPS).max(3));
        let taps = design_taps(&config.bands, num_taps, sample_rate as f32);

        let channels = channels.max(1) as usize;
        let history = (0..channels).map(|_| VecDeque::from(vec![0.0_f32; num_taps])).collect();

        Self { taps, history }
    }
}

fn odd(n: usize) -> usize {
    if n % 2 == 0 {
        n + 1
    } else {
        n
    }
}

/// Window-method FIR design: sample the band curve at `num_taps` bins, IDFT to a
/// circular impulse response, fftshift to center it, then apply a Hamming window.
fn design_taps(bands: &[EqBand], num_taps: usize, sample_rate: f32) -> Vec<f32> {
    let n = num_taps;
    let mut spectrum: Vec<Complex32> = (0..n)
        .map(|k| {
            let bin = if k <= n / 2 { k } else { n - k };
            let freq_hz = bin as f32 * sample_rate / n as f32;
            Complex32::new(band_curve_magnitude(bands, freq_hz, sample_rate), 0.0)
        })
        .collect();

    let mut planner = FftPlanner::<f32>::new();
    let ifft = planner.plan_fft_inverse(n);
    ifft.process(&mut spectrum);

    let center = n / 2;
    let mut taps = vec![0.0_f32; n];
    for i in 0..n {
        let circ_idx = (i + n - center) % n;
        let windowed = spectrum[circ_idx].re / n as f32;
        let hamming = 0.54 - 0.46 * (2.0 * PI * i as f32 / (n as f32 - 1.0)).cos();
        taps[i] = windowed * hamming;
    }
    taps
}

impl EqEngine for FirEq {
    fn process(&mut self, samples: &mut [f32], channels: u16) {
        let channels = channels.max(1) as usize;
        let frames = samples.len() / channels;

        for frame in 0..frames {
            for ch in 0..channels {
                let idx = frame * channels + ch;
                let history = &mut self.history[ch];
                history.pop_front();
                history.push_back(samples[idx]);

                let mut acc = 0.0_f32;
                for (h, x) in self.taps.iter().zip(history.iter()) {
                    acc += h * x;
                }
                samples[idx] = acc;
            }
        }
    }

    fn latency_frames(&self) -> usize {
        self.taps.len() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{EqConfig, EqEngineKind};

    fn flat_config(taps: usize) -> EqConfig {
        EqConfig { engine: EqEngineKind::Fir, bands: vec![], block_size: None, taps: Some(taps) }
    }

    #[test]
    fn flat_mask_is_delayed_identity() {
        let taps = 31;
        let mut eq = FirEq::new(&flat_config(taps), 44100, 1);
        let latency = eq.latency_frames();

        let input: Vec<f32> = (0..200).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect();
        let mut samples = input.clone();
        eq.process(&mut samples, 1);

        for i in 0..(input.len() - latency) {
            assert!(
                (samples[i + latency] - input[i]).abs() < 0.05,
                "mismatch at {i}: {} vs {}",
                samples[i + latency],
                input[i]
            );
        }
    }
}
