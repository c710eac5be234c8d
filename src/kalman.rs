//! Per-bin Kalman-style recursion with a predicted gain.
//!
//! Every frequency bin runs its own filter: a window of the last `L` reference
//! coefficients, prior and posterior tap vectors, and the gain predictor's
//! recurrent state. Bins never exchange data, so one frame is processed across
//! bins in parallel while frames stay strictly sequential.

use log::debug;
use num_complex::Complex32;
use rayon::prelude::*;
use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::complex::{dot, mean_magnitude, CVector, ZERO};
use crate::error::{AecError, Result};
use crate::gain::GainPredictor;
use crate::stft::Spectrogram;

/// Adaptive taps of one bin before (`prior`) and after (`posterior`) the most
/// recent update.
#[derive(Debug, Clone, PartialEq)]
pub struct TapState {
    pub prior: CVector,
    pub posterior: CVector,
}

impl TapState {
    pub fn zeros(filter_order: usize) -> Self {
        Self {
            prior: CVector::zeros(filter_order),
            posterior: CVector::zeros(filter_order),
        }
    }
}

/// Everything one bin carries from frame to frame.
#[derive(Debug, Clone)]
pub struct BinState<S> {
    /// Last `L` reference coefficients, oldest first.
    pub window: CVector,
    pub taps: TapState,
    pub network: S,
}

impl<S> BinState<S> {
    pub fn new(filter_order: usize, network: S) -> Self {
        Self {
            window: CVector::zeros(filter_order),
            taps: TapState::zeros(filter_order),
            network,
        }
    }
}

/// Result of one bin step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinOutput {
    pub echo: Complex32,
    /// The reference window was silent and the state was held.
    pub gated: bool,
}

/// Advances one bin by one frame.
///
/// `reference` and `mic` are this frame's coefficients for the bin. When the
/// mean magnitude of the reference window falls below `gate_threshold` the
/// taps and network state are left untouched, the predictor is not called and
/// the echo estimate is zero.
pub fn step_bin<P: GainPredictor>(
    predictor: &P,
    bin: &mut BinState<P::State>,
    reference: Complex32,
    mic: Complex32,
    gate_threshold: f32,
) -> BinOutput {
    let order = bin.window.len();
    bin.window.as_mut_slice().copy_within(1.., 0);
    bin.window[order - 1] = reference;

    if mean_magnitude(&bin.window) < gate_threshold {
        return BinOutput {
            echo: ZERO,
            gated: true,
        };
    }

    let taps = &mut bin.taps;
    let dh = &taps.posterior - &taps.prior;
    taps.prior.copy_from(&taps.posterior);
    let error = mic - dot(&bin.window, &taps.prior);

    let feature = CVector::from_iterator(
        2 * order + 1,
        bin.window
            .iter()
            .copied()
            .chain(iter::once(error))
            .chain(dh.iter().copied()),
    );
    let gain = predictor.step(&feature, &mut bin.network);
    debug_assert_eq!(gain.len(), order);

    taps.posterior = &taps.prior + gain * error;
    BinOutput {
        echo: dot(&bin.window, &taps.posterior),
        gated: false,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecursionStats {
    pub frames: usize,
    /// Bin steps that ran the predictor.
    pub updated: usize,
    /// Bin steps held by the silence gate.
    pub gated: usize,
}

/// Filter state for a whole spectrum, kept across calls for streaming use.
#[derive(Debug, Clone)]
pub struct StreamState<S> {
    bins: Vec<BinState<S>>,
    stats: RecursionStats,
}

impl<S> StreamState<S> {
    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn bin(&self, bin: usize) -> &BinState<S> {
        &self.bins[bin]
    }

    pub fn bins(&self) -> &[BinState<S>] {
        &self.bins
    }

    pub fn stats(&self) -> RecursionStats {
        self.stats
    }
}

/// One processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutput {
    pub echo: Vec<Complex32>,
    pub residual: Vec<Complex32>,
}

/// Echo estimate for a whole buffer.
#[derive(Debug, Clone)]
pub struct EchoEstimate {
    /// Same shape as the microphone spectrogram; frames past
    /// `frames_processed` are zero.
    pub echo: Spectrogram,
    pub frames_processed: usize,
    pub cancelled: bool,
}

/// Drives [`step_bin`] over every bin of every frame.
pub struct KalmanRecursion<'p, P> {
    predictor: &'p P,
    num_bins: usize,
    gate_threshold: f32,
}

impl<'p, P: GainPredictor> KalmanRecursion<'p, P> {
    pub fn new(predictor: &'p P, num_bins: usize, gate_threshold: f32) -> Self {
        Self {
            predictor,
            num_bins,
            gate_threshold,
        }
    }

    pub fn filter_order(&self) -> usize {
        self.predictor.filter_order()
    }

    /// Zeroed taps and fresh network state for every bin.
    pub fn new_state(&self) -> StreamState<P::State> {
        let order = self.filter_order();
        StreamState {
            bins: (0..self.num_bins)
                .map(|_| BinState::new(order, self.predictor.initial_state()))
                .collect(),
            stats: RecursionStats::default(),
        }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.num_bins {
            return Err(AecError::ColumnLength {
                expected: self.num_bins,
                actual: len,
            });
        }
        Ok(())
    }

    /// Runs one frame and returns its echo estimate and residual.
    pub fn push_frame(
        &self,
        state: &mut StreamState<P::State>,
        mic: &[Complex32],
        reference: &[Complex32],
    ) -> Result<FrameOutput> {
        self.check_len(mic.len())?;
        self.check_len(reference.len())?;
        self.check_len(state.bins.len())?;

        let outputs = self.step_frame(state, mic, reference);
        let echo: Vec<Complex32> = outputs.iter().map(|o| o.echo).collect();
        let residual = mic.iter().zip(&echo).map(|(y, e)| y - e).collect();
        Ok(FrameOutput { echo, residual })
    }

    fn step_frame(
        &self,
        state: &mut StreamState<P::State>,
        mic: &[Complex32],
        reference: &[Complex32],
    ) -> Vec<BinOutput> {
        let outputs: Vec<BinOutput> = state
            .bins
            .par_iter_mut()
            .zip(reference.par_iter())
            .zip(mic.par_iter())
            .map(|((bin, &x), &y)| step_bin(self.predictor, bin, x, y, self.gate_threshold))
            .collect();

        let gated = outputs.iter().filter(|o| o.gated).count();
        state.stats.frames += 1;
        state.stats.gated += gated;
        state.stats.updated += outputs.len() - gated;
        outputs
    }

    /// Runs the recursion over `min(mic frames, reference frames)` frames.
    ///
    /// `cancel` is checked before every frame; once set, the remaining frames
    /// keep a zero echo estimate.
    pub fn run(
        &self,
        state: &mut StreamState<P::State>,
        mic: &Spectrogram,
        reference: &Spectrogram,
        cancel: Option<&AtomicBool>,
    ) -> Result<EchoEstimate> {
        self.check_len(mic.num_bins())?;
        self.check_len(reference.num_bins())?;
        self.check_len(state.bins.len())?;

        let frames = mic.num_frames().min(reference.num_frames());
        let mut echo = Spectrogram::zeros(mic.num_bins(), mic.num_frames());
        let mut frames_processed = 0;
        let mut cancelled = false;

        for t in 0..frames {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                cancelled = true;
                break;
            }
            let outputs = self.step_frame(state, mic.frame(t), reference.frame(t));
            for (slot, output) in echo.frame_mut(t).iter_mut().zip(&outputs) {
                *slot = output.echo;
            }
            frames_processed += 1;
        }

        debug!(
            "recursion: {}/{} frames, {} bin steps updated, {} gated{}",
            frames_processed,
            frames,
            state.stats.updated,
            state.stats.gated,
            if cancelled { ", cancelled" } else { "" }
        );
        Ok(EchoEstimate {
            echo,
            frames_processed,
            cancelled,
        })
    }
}
