//! PCM block representation and format conversion at the chain boundary (§4.5).
//!
//! The DSP chain always works in interleaved f32 in [-1, 1]; the Decoder and Sink
//! boundary convert in and out of whatever the external tool / device wants (S16LE or
//! F32LE per §4.3/§4.4).

/// Interleaved PCM, channels-major-last (`frames[i*channels + c]`).
#[derive(Clone, Debug)]
pub struct PcmBlock {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self { samples, sample_rate, channels }
    }

    pub fn silence(num_frames: usize, sample_rate: u32, channels: u16) -> Self {
        Self { samples: vec![0.0; num_frames * channels as usize], sample_rate, channels }
    }

    pub fn num_frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn is_valid(&self) -> bool {
        self.channels > 0 && self.samples.len() % self.channels as usize == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S16LE,
    F32LE,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16LE => 2,
            SampleFormat::F32LE => 4,
        }
    }

    pub fn bit_depth(&self) -> u16 {
        match self {
            SampleFormat::S16LE => 16,
            SampleFormat::F32LE => 32,
        }
    }
}

/// Decode raw bytes off the Decoder's stdout pipe into a float PCM block (entry
/// conversion of §4.5).
pub fn bytes_to_pcm(bytes: &[u8], format: SampleFormat, sample_rate: u32, channels: u16) -> PcmBlock {
    let samples = match format {
        SampleFormat::F32LE => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        SampleFormat::S16LE => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect(),
    };
    PcmBlock { samples, sample_rate, channels }
}

/// Encode a float PCM block back to bytes for a Sink that wants a fixed wire format
/// (exit conversion of §4.5). Dithers before integer truncation, the same TPDF approach
/// the teacher's convert.rs uses for bit-depth reduction.
pub fn pcm_to_bytes(block: &PcmBlock, format: SampleFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.samples.len() * format.bytes_per_sample());
    match format {
        SampleFormat::F32LE => {
            for &s in &block.samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
        SampleFormat::S16LE => {
            for &s in &block.samples {
                let dithered = apply_tpdf_dither(s, 16);
                let clamped = dithered.clamp(-1.0, 1.0);
                let i = (clamped * 32767.0) as i16;
                out.extend_from_slice(&i.to_le_bytes());
            }
        }
    }
    out
}

fn apply_tpdf_dither(sample: f32, bit_depth: u32) -> f32 {
    let lsb = 1.0 / (1u32 << (bit_depth - 1)) as f32;
    let r1 = fastrand::f32();
    let r2 = fastrand::f32();
    sample + (r1 - r2) * lsb
}

/// Soft-clip a block at +-1 using tanh, the compressor's required output stage (§4.5).
pub fn soft_clip(samples: &mut [f32]) {
    for s in samples.iter_mut() {
        if s.abs() > 1.0 {
            *s = s.signum() * s.abs().tanh();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s16_round_trip_within_quantization_noise() {
        let samples = vec![0.5_f32, -0.25, 0.0, 0.999];
        let block = PcmBlock::new(samples.clone(), 44100, 2);
        let bytes = pcm_to_bytes(&block, SampleFormat::S16LE);
        let back = bytes_to_pcm(&bytes, SampleFormat::S16LE, 44100, 2);
        for (a, b) in samples.iter().zip(back.samples.iter()) {
            assert!((a - b).abs() < 1.0 / 32767.0 + 1.0 / 16384.0, "{a} vs {b}");
        }
    }

    #[test]
    fn f32_round_trip_exact() {
        let samples = vec![0.12345_f32, -0.98765];
        let block = PcmBlock::new(samples.clone(), 48000, 2);
        let bytes = pcm_to_bytes(&block, SampleFormat::F32LE);
        let back = bytes_to_pcm(&bytes, SampleFormat::F32LE, 48000, 2);
        assert_eq!(samples, back.samples);
    }

    #[test]
    fn soft_clip_bounds_output() {
        let mut samples = vec![1.5_f32, -2.0, 0.3];
        soft_clip(&mut samples);
        for s in samples {
            assert!(s.abs() <= 1.0);
        }
    }
}
