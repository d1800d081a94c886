//! Cascaded-biquad EQ engine (§4.5 "IIR"): zero added latency, phase distortion, cost
//! scales linearly with band count. Grounded directly on the teacher's
//! `dsp/eq.rs::BiquadFilter` (Direct Form II transposed, RBJ cookbook coefficients),
//! generalized here to peaking/low-shelf/high-shelf per band and to f32.

use super::biquad_math::{coeffs_for_band, BiquadCoeffs};
use super::EqEngine;
use bridge_core::EqConfig;

struct Section {
    c: BiquadCoeffs,
    z1: Vec<f32>,
    z2: Vec<f32>,
}

impl Section {
    fn new(c: BiquadCoeffs, channels: usize) -> Self {
        Self { c, z1: vec![0.0; channels], z2: vec![0.0; channels] }
    }

    #[inline]
    fn process_sample(&mut self, sample: f32, channel: usize) -> f32 {
        let output = self.c.b0 * sample + self.z1[channel];
        self.z1[channel] = self.c.b1 * sample - self.c.a1 * output + self.z2[channel];
        self.z2[channel] = self.c.b2 * sample - self.c.a2 * output;
        output
    }
}

pub struct IirEq {
    sections: Vec<Section>,
}

impl IirEq {
    pub fn new(config: &EqConfig, sample_rate: u32, channels: u16) -> Self {
        let sections = config
            .bands
            .iter()
            .map(|band| Section::new(coeffs_for_band(band, sample_rate as f32), channels as usize))
            .collect();
        Self { sections }
    }
}

impl EqEngine for IirEq {
    fn process(&mut self, samples: &mut [f32], channels: u16) {
        if self.sections.is_empty() {
            return;
        }
        let channels = channels as usize;
        for (i, sample) in samples.iter_mut().enumerate() {
            let ch = i % channels;
            let mut s = *sample;
            for section in &mut self.sections {
                s = section.process_sample(s, ch);
            }
            *sample = s;
        }
    }

    fn latency_frames(&self) -> usize {
        0
    }
}
