//! Delay estimation between microphone and reference, used to pre-align the
//! reference before cancellation.

use num_complex::Complex32;
use rustfft::FftPlanner;

use crate::complex::ZERO;

/// Estimates how far `mic` lags `reference`.
pub trait DelayEstimator: Send + Sync {
    /// Delay in seconds; positive when the microphone lags the reference.
    fn estimate(&self, mic: &[f32], reference: &[f32], sample_rate: u32) -> f32;
}

/// Generalised cross-correlation with phase transform.
#[derive(Debug, Clone, Copy)]
pub struct GccPhat {
    /// Upsampling factor of the correlation, for sub-sample resolution.
    pub interp: usize,
    /// Largest delay searched, in seconds. `None` searches every lag.
    pub max_delay: Option<f32>,
}

impl Default for GccPhat {
    fn default() -> Self {
        Self {
            interp: 1,
            max_delay: None,
        }
    }
}

impl GccPhat {
    /// Whitened cross-correlation, indexed by lag modulo its length.
    fn correlation(&self, mic: &[f32], reference: &[f32]) -> Vec<f32> {
        let n = mic.len() + reference.len();
        let m = n * self.interp.max(1);
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n);
        let ifft = planner.plan_fft_inverse(m);

        let spectrum = |signal: &[f32]| {
            let mut buf: Vec<Complex32> = signal.iter().map(|&s| Complex32::new(s, 0.0)).collect();
            buf.resize(n, ZERO);
            fft.process(&mut buf);
            buf
        };
        let sig = spectrum(mic);
        let refsig = spectrum(reference);

        let mut cross = vec![ZERO; m];
        for k in 0..=n / 2 {
            let r = sig[k] * refsig[k].conj();
            let magnitude = r.norm();
            let whitened = if magnitude > f32::EPSILON { r / magnitude } else { ZERO };
            cross[k] = whitened;
            if k > 0 {
                if m - k == k {
                    cross[k].im = 0.0;
                } else {
                    cross[m - k] = whitened.conj();
                }
            }
        }
        cross[0].im = 0.0;
        ifft.process(&mut cross);
        cross.iter().map(|c| c.re / m as f32).collect()
    }
}

impl DelayEstimator for GccPhat {
    fn estimate(&self, mic: &[f32], reference: &[f32], sample_rate: u32) -> f32 {
        if mic.is_empty() || reference.is_empty() || sample_rate == 0 {
            return 0.0;
        }
        let interp = self.interp.max(1);
        let cc = self.correlation(mic, reference);
        let m = cc.len() as isize;

        let mut max_shift = m / 2;
        if let Some(max_delay) = self.max_delay {
            let limit = (interp as f32 * sample_rate as f32 * max_delay) as isize;
            max_shift = max_shift.min(limit.max(0));
        }

        let mut best_lag = 0isize;
        let mut best = cc[0].abs();
        for lag in -max_shift..=max_shift {
            let value = cc[lag.rem_euclid(m) as usize].abs();
            if value > best {
                best = value;
                best_lag = lag;
            }
        }
        best_lag as f32 / (interp as f32 * sample_rate as f32)
    }
}

/// Converts an estimated delay into the number of leading zeros to put in
/// front of the reference, backing off one millisecond so the filter sees the
/// echo onset.
pub fn delay_samples(delay_seconds: f32, sample_rate: u32) -> usize {
    let samples = (delay_seconds - 0.001) * sample_rate as f32;
    if samples > 0.0 {
        samples as usize
    } else {
        0
    }
}

/// Prepends `delay` zeros to `reference` and cuts the result to `len` samples.
pub fn delay_reference(reference: &[f32], delay: usize, len: usize) -> Vec<f32> {
    std::iter::repeat(0.0)
        .take(delay)
        .chain(reference.iter().copied())
        .take(len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()
    }

    fn delayed(signal: &[f32], delay: usize) -> Vec<f32> {
        delay_reference(signal, delay, signal.len())
    }

    #[test]
    fn finds_positive_delay() {
        let reference = noise(8000, 1);
        let mic: Vec<f32> = delayed(&reference, 80).iter().map(|s| s * 0.6).collect();
        let tau = GccPhat::default().estimate(&mic, &reference, 16000);
        assert!((tau - 80.0 / 16000.0).abs() < 1e-7, "tau {tau}");
    }

    #[test]
    fn finds_negative_delay() {
        let mic = noise(4000, 2);
        let reference = delayed(&mic, 25);
        let tau = GccPhat::default().estimate(&mic, &reference, 8000);
        assert!((tau + 25.0 / 8000.0).abs() < 1e-7, "tau {tau}");
    }

    #[test]
    fn interpolation_keeps_integer_delay() {
        let reference = noise(2000, 3);
        let mic = delayed(&reference, 12);
        let estimator = GccPhat {
            interp: 4,
            max_delay: Some(0.01),
        };
        let tau = estimator.estimate(&mic, &reference, 16000);
        assert!((tau - 12.0 / 16000.0).abs() < 1.0 / 64000.0, "tau {tau}");
    }

    #[test]
    fn max_delay_limits_search() {
        let reference = noise(4000, 4);
        let mic = delayed(&reference, 400);
        let estimator = GccPhat {
            interp: 1,
            max_delay: Some(0.005),
        };
        let tau = estimator.estimate(&mic, &reference, 16000);
        assert!(tau.abs() <= 0.005);
    }

    #[test]
    fn silent_input_reports_no_delay() {
        let zeros = vec![0.0; 1000];
        assert_eq!(GccPhat::default().estimate(&zeros, &zeros, 16000), 0.0);
        assert_eq!(GccPhat::default().estimate(&[], &zeros, 16000), 0.0);
    }

    #[test]
    fn delay_is_converted_and_applied() {
        assert_eq!(delay_samples(0.00503, 16000), 64);
        assert_eq!(delay_samples(0.0005, 16000), 0);
        assert_eq!(delay_samples(-0.01, 16000), 0);
        assert_eq!(delay_reference(&[1.0, 2.0, 3.0], 2, 4), vec![0.0, 0.0, 1.0, 2.0]);
        assert_eq!(delay_reference(&[1.0], 0, 3), vec![1.0]);
    }
}
