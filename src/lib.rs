//! # nkf-aec
//!
//! Acoustic echo cancellation with a neural Kalman filter.
//!
//! Both signals are taken to the short-time Fourier domain. Every frequency
//! bin then runs a short adaptive filter over the last `L` reference
//! coefficients; instead of deriving the Kalman gain analytically, a small
//! complex recurrent network predicts it from the reference window, the
//! prediction error and the last tap update. The accumulated echo estimate is
//! subtracted from the microphone spectrum and the residual is resynthesised.
//!
//! ```text
//! mic, ref ──► Stft::analyze ──► per-bin KalmanRecursion ◄── GainPredictor
//!                                          │
//!                       mic spectrum − echo estimate ──► Stft::synthesize ──► output
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use nkf_aec::{AudioBuffer, EchoCanceller, JsonWeightStore, NkfConfig};
//!
//! let store = JsonWeightStore::new("resources/weights");
//! let aec = EchoCanceller::from_store(&store, "nkf_epoch70", NkfConfig::default())?;
//! let cleaned = aec.process(&mic, &reference, false)?;
//! ```
//!
//! Without trained weights, [`NlmsGain`] turns the same recursion into a
//! per-bin NLMS filter:
//!
//! ```ignore
//! let aec = EchoCanceller::with_predictor(NlmsGain::new(4, 0.5)?, NkfConfig::default())?;
//! ```
//!
//! ## Streaming
//!
//! [`EchoCanceller::recursion`] and [`EchoCanceller::new_stream`] expose the
//! frame-level recursion; the returned [`StreamState`] holds all filter state
//! and can be kept between calls.
//!
//! ## Logging
//!
//! Diagnostics go through the `log` facade; install whichever logger the
//! application uses.

pub mod align;
pub mod canceller;
pub mod complex;
pub mod config;
pub mod error;
pub mod gain;
pub mod kalman;
pub mod stft;
pub mod weights;

pub use align::{DelayEstimator, GccPhat};
pub use canceller::{AudioBuffer, EchoCanceller, Processed};
pub use config::{NkfConfig, StftConfig, WindowKind};
pub use error::{AecError, Result};
pub use gain::{GainNetworkState, GainPredictor, KgNet, NlmsGain};
pub use kalman::{KalmanRecursion, RecursionStats, StreamState, TapState};
pub use stft::{Spectrogram, Stft};
pub use weights::{JsonWeightStore, Tensor, TensorMap, WeightStore};
