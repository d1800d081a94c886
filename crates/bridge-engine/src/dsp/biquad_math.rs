//! Shared RBJ cookbook biquad coefficient math and frequency-response evaluation, used
//! by all three EQ engines so they agree on the same band curve (§8 "EQ engine
//! consistency": IIR/FFT/FIR built from the same band spec must match within ±1 dB).

use bridge_core::{BandType, EqBand};
use std::f32::consts::PI;

#[derive(Debug, Clone, Copy)]
pub struct BiquadCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

pub fn coeffs_for_band(band: &EqBand, sample_rate: f32) -> BiquadCoeffs {
    match band.band_type {
        BandType::Peaking => peaking(band.freq_hz, band.gain_db, band.q, sample_rate),
        BandType::LowShelf => low_shelf(band.freq_hz, band.gain_db, band.q, sample_rate),
        BandType::HighShelf => high_shelf(band.freq_hz, band.gain_db, band.q, sample_rate),
    }
}

pub fn peaking(freq: f32, gain_db: f32, q: f32, sample_rate: f32) -> BiquadCoeffs {
    let a = 10_f32.powf(gain_db / 40.0);
    let w0 = 2.0 * PI * freq / sample_rate;
    let (sin_w0, cos_w0) = w0.sin_cos();
    let alpha = sin_w0 / (2.0 * q);

    let a0 = 1.0 + alpha / a;
    BiquadCoeffs {
        b0: (1.0 + alpha * a) / a0,
        b1: (-2.0 * cos_w0) / a0,
        b2: (1.0 - alpha * a) / a0,
        a1: (-2.0 * cos_w0) / a0,
        a2: (1.0 - alpha / a) / a0,
    }
}

pub fn low_shelf(freq: f32, gain_db: f32, q: f32, sample_rate: f32) -> BiquadCoeffs {
    let a = 10_f32.powf(gain_db / 40.0);
    let w0 = 2.0 * PI * freq / sample_rate;
    let (sin_w0, cos_w0) = w0.sin_cos();
    let alpha = sin_w0 / (2.0 * q);
    let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

    let a0 = (a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha;
    BiquadCoeffs {
        b0: a * ((a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha) / a0,
        b1: 2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0) / a0,
        b2: a * ((a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha) / a0,
        a1: -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0) / a0,
        a2: ((a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha) / a0,
    }
}

pub fn high_shelf(freq: f32, gain_db: f32, q: f32, sample_rate: f32) -> BiquadCoeffs {
    let a = 10_f32.powf(gain_db / 40.0);
    let w0 = 2.0 * PI * freq / sample_rate;
    let (sin_w0, cos_w0) = w0.sin_cos();
    let alpha = sin_w0 / (2.0 * q);
    let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

    let a0 = (a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha;
    BiquadCoeffs {
        b0: a * ((a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha) / a0,
        b1: -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0) / a0,
        b2: a * ((a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha) / a0,
        a1: 2.0 * ((a - 1.0) - (a + 1.0) * cos_w0) / a0,
        a2: ((a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha) / a0,
    }
}

/// |H(e^jw)| for one biquad section at angular frequency `w` (radians/sample).
pub fn magnitude_at(c: &BiquadCoeffs, w: f32) -> f32 {
    let (sin_w, cos_w) = w.sin_cos();
    let (sin_2w, cos_2w) = (2.0 * w).sin_cos();

    let num_re = c.b0 + c.b1 * cos_w + c.b2 * cos_2w;
    let num_im = -(c.b1 * sin_w + c.b2 * sin_2w);
    let den_re = 1.0 + c.a1 * cos_w + c.a2 * cos_2w;
    let den_im = -(c.a1 * sin_w + c.a2 * sin_2w);

    let num_mag = (num_re * num_re + num_im * num_im).sqrt();
    let den_mag = (den_re * den_re + den_im * den_im).sqrt();
    if den_mag < 1e-12 {
        1.0
    } else {
        num_mag / den_mag
    }
}

/// Combined linear-gain response of every band in a curve at `freq_hz`, the same curve
/// the IIR engine realizes as a cascade.
pub fn band_curve_magnitude(bands: &[EqBand], freq_hz: f32, sample_rate: f32) -> f32 {
    let w = 2.0 * PI * freq_hz / sample_rate;
    bands
        .iter()
        .map(|band| magnitude_at(&coeffs_for_band(band, sample_rate), w))
        .product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::BandType;

    #[test]
    fn flat_curve_is_unity_everywhere() {
        let bands: Vec<EqBand> = vec![];
        for freq in [40.0, 1000.0, 16000.0] {
            assert!((band_curve_magnitude(&bands, freq, 44100.0) - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn peaking_boost_peaks_near_center_frequency() {
        let bands = vec![EqBand { freq_hz: 1000.0, gain_db: 6.0, q: 1.0, band_type: BandType::Peaking }];
        let at_center = band_curve_magnitude(&bands, 1000.0, 44100.0);
        let far_away = band_curve_magnitude(&bands, 40.0, 44100.0);
        assert!(at_center > far_away);
        let db_at_center = 20.0 * at_center.log10();
        assert!((db_at_center - 6.0).abs() < 0.5);
    }
}
