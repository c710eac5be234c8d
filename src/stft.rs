//! Short-time Fourier analysis and overlap-add synthesis.
//!
//! Framing is centred: the signal is reflect-padded by `frame_size / 2` on
//! both sides, so frame `t` is centred on sample `t * hop_size` and a signal of
//! `N` samples yields `1 + N / hop_size` frames (for even frame sizes).
//! Synthesis divides by the summed squared window, which makes
//! `synthesize(analyze(x), x.len())` reproduce `x` for any window whose
//! envelope stays non-zero over the signal.

use nalgebra::DMatrix;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::complex::ZERO;
use crate::config::StftConfig;
use crate::error::{AecError, Result};

/// Envelope values at or below this are treated as uncovered.
const ENVELOPE_FLOOR: f32 = 1e-11;

/// Complex time-frequency matrix, one column per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    data: DMatrix<Complex32>,
}

impl Spectrogram {
    pub fn zeros(num_bins: usize, num_frames: usize) -> Self {
        Self {
            data: DMatrix::from_element(num_bins, num_frames, ZERO),
        }
    }

    pub fn from_matrix(data: DMatrix<Complex32>) -> Self {
        Self { data }
    }

    pub fn num_bins(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_frames(&self) -> usize {
        self.data.ncols()
    }

    #[inline]
    pub fn get(&self, bin: usize, frame: usize) -> Complex32 {
        self.data[(bin, frame)]
    }

    /// All bins of one frame.
    pub fn frame(&self, frame: usize) -> &[Complex32] {
        let bins = self.num_bins();
        &self.data.as_slice()[frame * bins..(frame + 1) * bins]
    }

    pub fn frame_mut(&mut self, frame: usize) -> &mut [Complex32] {
        let bins = self.num_bins();
        &mut self.data.as_mut_slice()[frame * bins..(frame + 1) * bins]
    }

    pub fn as_matrix(&self) -> &DMatrix<Complex32> {
        &self.data
    }

    pub fn into_matrix(self) -> DMatrix<Complex32> {
        self.data
    }
}

/// Forward/inverse spectral transform with fixed configuration.
pub struct Stft {
    config: StftConfig,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(config: StftConfig) -> Result<Self> {
        config.validate()?;
        let mut fft_planner = FftPlanner::new();
        let fft = fft_planner.plan_fft_forward(config.frame_size);
        let ifft = fft_planner.plan_fft_inverse(config.frame_size);

        Ok(Self {
            config,
            window: config.window.coefficients(config.frame_size),
            fft,
            ifft,
        })
    }

    pub fn config(&self) -> &StftConfig {
        &self.config
    }

    pub fn num_bins(&self) -> usize {
        self.config.num_bins()
    }

    fn pad(&self) -> usize {
        self.config.frame_size / 2
    }

    /// Number of frames `analyze` produces for a signal of `len` samples.
    pub fn num_frames(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let padded = len + 2 * self.pad();
        1 + padded.saturating_sub(self.config.frame_size) / self.config.hop_size
    }

    /// Transforms `signal` into a `(num_bins, num_frames)` spectrogram.
    pub fn analyze(&self, signal: &[f32]) -> Spectrogram {
        let n = self.config.frame_size;
        let hop = self.config.hop_size;
        let pad = self.pad() as isize;
        let frames = self.num_frames(signal.len());
        let mut spec = Spectrogram::zeros(self.num_bins(), frames);
        let mut buffer = vec![ZERO; n];

        for t in 0..frames {
            let start = (t * hop) as isize - pad;
            for (k, (slot, &w)) in buffer.iter_mut().zip(&self.window).enumerate() {
                let sample = signal[reflect_index(start + k as isize, signal.len())];
                *slot = Complex32::new(sample * w, 0.0);
            }
            self.fft.process(&mut buffer);
            spec.frame_mut(t).copy_from_slice(&buffer[..self.num_bins()]);
        }

        spec
    }

    /// Overlap-adds `spec` back into `length` time-domain samples.
    ///
    /// Samples past the last frame's coverage are zero; surplus samples are
    /// dropped.
    pub fn synthesize(&self, spec: &Spectrogram, length: usize) -> Result<Vec<f32>> {
        let bins = self.num_bins();
        if spec.num_bins() != bins {
            return Err(AecError::ColumnLength {
                expected: bins,
                actual: spec.num_bins(),
            });
        }
        let n = self.config.frame_size;
        let hop = self.config.hop_size;
        let frames = spec.num_frames();
        if frames == 0 {
            return Ok(vec![0.0; length]);
        }

        let span = n + hop * (frames - 1);
        let mut ola = vec![0.0f32; span];
        let mut envelope = vec![0.0f32; span];
        let mut buffer = vec![ZERO; n];
        let scale = 1.0 / n as f32;

        for t in 0..frames {
            let column = spec.frame(t);
            buffer[0] = Complex32::new(column[0].re, 0.0);
            for k in 1..n {
                buffer[k] = if k < bins {
                    column[k]
                } else {
                    column[n - k].conj()
                };
            }
            // Real inverse transform ignores the imaginary Nyquist part.
            if n % 2 == 0 {
                buffer[n / 2].im = 0.0;
            }
            self.ifft.process(&mut buffer);

            let offset = t * hop;
            for (k, (c, &w)) in buffer.iter().zip(&self.window).enumerate() {
                ola[offset + k] += c.re * scale * w;
                envelope[offset + k] += w * w;
            }
        }

        let pad = self.pad();
        Ok((0..length)
            .map(|i| {
                let p = pad + i;
                if p < span && envelope[p] > ENVELOPE_FLOOR {
                    ola[p] / envelope[p]
                } else {
                    0.0
                }
            })
            .collect())
    }
}

/// Maps an index outside `0..len` back inside by mirroring about the end
/// samples (edge samples are not repeated), repeating as often as needed.
fn reflect_index(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let m = i.rem_euclid(period);
    if m >= len as isize {
        (period - m) as usize
    } else {
        m as usize
    }
}
