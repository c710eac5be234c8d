//! Configuration for the spectral transform and the neural Kalman filter.
//!
//! Defaults reproduce the reference model: 1024-point frames, 256-sample hop,
//! periodic Hann window, filter order 4 and an 18-wide gain network.

use serde::{Deserialize, Serialize};

use crate::error::{AecError, Result};

/// Default frame (FFT) size in samples.
pub const DEFAULT_FRAME_SIZE: usize = 1024;
/// Default hop between successive frames in samples.
pub const DEFAULT_HOP_SIZE: usize = 256;
/// Default number of taps per frequency bin.
pub const DEFAULT_FILTER_ORDER: usize = 4;
/// Default width of the dense layers in the gain network.
pub const DEFAULT_FC_DIM: usize = 18;
/// Default hidden width of the recurrent cell.
pub const DEFAULT_RNN_DIM: usize = 18;
/// Mean reference-window magnitude below which a bin holds its state.
pub const DEFAULT_GATE_THRESHOLD: f32 = 1e-5;

/// Analysis/synthesis window shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Periodic Hann window.
    #[default]
    Hann,
    /// Periodic Hamming window.
    Hamming,
    Rectangular,
}

impl WindowKind {
    /// Returns `len` window coefficients.
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        let n = len as f32;
        (0..len)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / n;
                match self {
                    WindowKind::Hann => 0.5 - 0.5 * phase.cos(),
                    WindowKind::Hamming => 0.54 - 0.46 * phase.cos(),
                    WindowKind::Rectangular => 1.0,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StftConfig {
    pub frame_size: usize,
    pub hop_size: usize,
    pub window: WindowKind,
}

impl Default for StftConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            hop_size: DEFAULT_HOP_SIZE,
            window: WindowKind::Hann,
        }
    }
}

impl StftConfig {
    /// Number of one-sided frequency bins.
    pub fn num_bins(&self) -> usize {
        self.frame_size / 2 + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_size == 0 {
            return Err(AecError::Config("frame_size must be positive".into()));
        }
        if self.hop_size == 0 {
            return Err(AecError::Config("hop_size must be positive".into()));
        }
        // Overlap-add leaves gaps when the hop exceeds the frame.
        if self.hop_size > self.frame_size {
            return Err(AecError::Config(format!(
                "hop_size {} exceeds frame_size {}",
                self.hop_size, self.frame_size
            )));
        }
        Ok(())
    }
}

/// Full model configuration.
///
/// The network dimensions must match the weight blob the model is built from;
/// a mismatch is reported when the weights are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NkfConfig {
    /// Taps per frequency bin (`L`).
    pub filter_order: usize,
    pub fc_dim: usize,
    pub rnn_dim: usize,
    pub rnn_layers: usize,
    pub gate_threshold: f32,
    pub stft: StftConfig,
}

impl Default for NkfConfig {
    fn default() -> Self {
        Self {
            filter_order: DEFAULT_FILTER_ORDER,
            fc_dim: DEFAULT_FC_DIM,
            rnn_dim: DEFAULT_RNN_DIM,
            rnn_layers: 1,
            gate_threshold: DEFAULT_GATE_THRESHOLD,
            stft: StftConfig::default(),
        }
    }
}

impl NkfConfig {
    /// Length of the feature vector fed to the gain predictor (`2L + 1`).
    pub fn feature_len(&self) -> usize {
        2 * self.filter_order + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.filter_order == 0 {
            return Err(AecError::InvalidFilterOrder);
        }
        if self.fc_dim == 0 || self.rnn_dim == 0 || self.rnn_layers == 0 {
            return Err(AecError::Config(format!(
                "network dims must be positive (fc_dim {}, rnn_dim {}, rnn_layers {})",
                self.fc_dim, self.rnn_dim, self.rnn_layers
            )));
        }
        if !self.gate_threshold.is_finite() || self.gate_threshold < 0.0 {
            return Err(AecError::Config(format!(
                "gate_threshold must be finite and non-negative, got {}",
                self.gate_threshold
            )));
        }
        self.stft.validate()
    }
}
