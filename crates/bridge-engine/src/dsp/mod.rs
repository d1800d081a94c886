//! DSP chain (§4.5): EQ → Compressor → Stereo, each stage independently bypassable.
//! Built around `EqEngine`, a polymorphic trait dispatched on `EqEngineKind` so the
//! caller (the Virtual Device pipeline) never needs to know which of IIR/FFT/FIR is
//! active — the teacher's "capability set" design note (§9) generalized from sinks to
//! EQ realizations.

pub mod biquad_math;
pub mod compressor;
pub mod fft;
pub mod fir;
pub mod iir;
pub mod stereo;

use bridge_core::{DspConfig, EqEngineKind};
use compressor::CompressorEngine;
use fft::FftEq;
use fir::FirEq;
use iir::IirEq;
use stereo::StereoEngine;

/// One EQ realization: cascaded biquads, block FFT, or linear-phase FIR (§4.5). All three
/// are built from the same band curve (`biquad_math`) so swapping engines at runtime
/// changes latency and CPU cost, not the target frequency response.
pub trait EqEngine: Send {
    fn process(&mut self, samples: &mut [f32], channels: u16);
    fn latency_frames(&self) -> usize;
}

pub fn build_eq_engine(config: &DspConfig, sample_rate: u32, channels: u16) -> Box<dyn EqEngine> {
    match config.eq.engine {
        EqEngineKind::Iir => Box::new(IirEq::new(&config.eq, sample_rate, channels)),
        EqEngineKind::Fft => Box::new(FftEq::new(&config.eq, sample_rate, channels)),
        EqEngineKind::Fir => Box::new(FirEq::new(&config.eq, sample_rate, channels)),
    }
}

/// The full per-device processing chain (§4.5). Rebuilt wholesale whenever the device's
/// `DspConfig` changes (SetDsp/ResetDsp) rather than mutated in place, since engine kind
/// and band count can change between calls.
pub struct DspChain {
    eq: Box<dyn EqEngine>,
    compressor: CompressorEngine,
    stereo: StereoEngine,
}

impl DspChain {
    pub fn new(config: &DspConfig, sample_rate: u32, channels: u16) -> Self {
        Self {
            eq: build_eq_engine(config, sample_rate, channels),
            compressor: CompressorEngine::new(config.compressor, sample_rate, channels),
            stereo: StereoEngine::new(config.stereo, sample_rate),
        }
    }

    pub fn process(&mut self, samples: &mut [f32], channels: u16) {
        self.eq.process(samples, channels);
        self.compressor.process(samples, channels);
        self.stereo.process(samples, channels);
    }

    /// Total added latency in frames, the EQ stage's contribution only (§4.5: compressor
    /// and stereo stages add no buffering delay).
    pub fn latency_frames(&self) -> usize {
        self.eq.latency_frames()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{CompressorConfig, EqConfig, StereoConfig};

    fn bypass_config() -> DspConfig {
        DspConfig {
            eq: EqConfig { engine: EqEngineKind::Iir, bands: vec![], block_size: None, taps: None },
            compressor: CompressorConfig { enabled: false, ..CompressorConfig::default() },
            stereo: StereoConfig { enabled: false, ..StereoConfig::default() },
        }
    }

    #[test]
    fn fully_bypassed_chain_is_identity() {
        let mut chain = DspChain::new(&bypass_config(), 44100, 2);
        let original = vec![0.1_f32, -0.2, 0.3, -0.4];
        let mut samples = original.clone();
        chain.process(&mut samples, 2);
        assert_eq!(samples, original);
    }

    #[test]
    fn iir_engine_has_zero_added_latency() {
        let chain = DspChain::new(&bypass_config(), 44100, 2);
        assert_eq!(chain.latency_frames(), 0);
    }

    #[test]
    fn fft_engine_reports_block_latency() {
        let mut config = bypass_config();
        config.eq.engine = EqEngineKind::Fft;
        config.eq.block_size = Some(512);
        let chain = DspChain::new(&config, 44100, 2);
        assert_eq!(chain.latency_frames(), 512);
    }
}
