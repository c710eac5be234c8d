//! End-to-end echo cancellation over whole buffers.

use log::{debug, info, warn};
use std::sync::atomic::AtomicBool;

use crate::align::{delay_reference, delay_samples, DelayEstimator, GccPhat};
use crate::config::NkfConfig;
use crate::error::{AecError, Result};
use crate::gain::{GainPredictor, KgNet};
use crate::kalman::{KalmanRecursion, RecursionStats, StreamState};
use crate::stft::{Spectrogram, Stft};
use crate::weights::{TensorMap, WeightStore};

/// Seconds of audio the delay estimator looks at.
const ALIGN_WINDOW_SECS: usize = 10;

/// Mono PCM samples with their sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Outcome of a cancellable run.
#[derive(Debug, Clone)]
pub struct Processed {
    pub audio: AudioBuffer,
    pub stats: RecursionStats,
    pub frames_processed: usize,
    /// Frames the recursion would have covered without cancellation.
    pub total_frames: usize,
    pub cancelled: bool,
}

/// Loaded model plus configuration; the context every processing call runs in.
///
/// Processing takes `&self` and allocates fresh filter state per call, so one
/// canceller can serve concurrent calls from several threads.
pub struct EchoCanceller<P = KgNet> {
    predictor: P,
    config: NkfConfig,
    stft: Stft,
    aligner: Box<dyn DelayEstimator>,
}

impl EchoCanceller<KgNet> {
    /// Loads weight blob `id` from `store`.
    pub fn from_store<S: WeightStore + ?Sized>(store: &S, id: &str, config: NkfConfig) -> Result<Self> {
        Self::with_predictor(KgNet::load(store, id, &config)?, config)
    }

    pub fn from_tensors(tensors: &TensorMap, config: NkfConfig) -> Result<Self> {
        Self::with_predictor(KgNet::from_tensors(tensors, &config)?, config)
    }
}

impl<P: GainPredictor> EchoCanceller<P> {
    pub fn with_predictor(predictor: P, config: NkfConfig) -> Result<Self> {
        config.validate()?;
        if predictor.filter_order() != config.filter_order {
            return Err(AecError::Config(format!(
                "predictor produces {} taps, config expects {}",
                predictor.filter_order(),
                config.filter_order
            )));
        }
        Ok(Self {
            predictor,
            stft: Stft::new(config.stft)?,
            config,
            aligner: Box::new(GccPhat::default()),
        })
    }

    /// Replaces the delay estimator used when alignment is requested.
    pub fn with_delay_estimator(mut self, estimator: impl DelayEstimator + 'static) -> Self {
        self.aligner = Box::new(estimator);
        self
    }

    pub fn config(&self) -> &NkfConfig {
        &self.config
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    pub fn stft(&self) -> &Stft {
        &self.stft
    }

    /// Frame-level recursion over this canceller's bins, for streaming callers.
    pub fn recursion(&self) -> KalmanRecursion<'_, P> {
        KalmanRecursion::new(&self.predictor, self.stft.num_bins(), self.config.gate_threshold)
    }

    /// Fresh, zeroed state for [`Self::recursion`].
    pub fn new_stream(&self) -> StreamState<P::State> {
        self.recursion().new_state()
    }

    /// Removes the echo of `reference` from `mic`.
    ///
    /// The output has the microphone's length and sample rate.
    pub fn process(&self, mic: &AudioBuffer, reference: &AudioBuffer, align: bool) -> Result<AudioBuffer> {
        if mic.sample_rate != reference.sample_rate {
            return Err(AecError::SampleRateMismatch {
                mic: mic.sample_rate,
                reference: reference.sample_rate,
            });
        }
        let samples = self.process_samples(&mic.samples, &reference.samples, mic.sample_rate, align)?;
        Ok(AudioBuffer::new(samples, mic.sample_rate))
    }

    /// [`Self::process`] on raw slices sharing one sample rate.
    pub fn process_samples(&self, mic: &[f32], reference: &[f32], sample_rate: u32, align: bool) -> Result<Vec<f32>> {
        Ok(self
            .run(mic, reference, sample_rate, align, None)?
            .audio
            .samples)
    }

    /// Like [`Self::process`], but stops at the next frame boundary once
    /// `cancel` is set. Frames not reached pass through unprocessed.
    pub fn process_cancellable(
        &self,
        mic: &AudioBuffer,
        reference: &AudioBuffer,
        align: bool,
        cancel: &AtomicBool,
    ) -> Result<Processed> {
        if mic.sample_rate != reference.sample_rate {
            return Err(AecError::SampleRateMismatch {
                mic: mic.sample_rate,
                reference: reference.sample_rate,
            });
        }
        self.run(&mic.samples, &reference.samples, mic.sample_rate, align, Some(cancel))
    }

    fn run(
        &self,
        mic: &[f32],
        reference: &[f32],
        sample_rate: u32,
        align: bool,
        cancel: Option<&AtomicBool>,
    ) -> Result<Processed> {
        validate_signal("mic", mic)?;
        validate_signal("reference", reference)?;
        if sample_rate == 0 {
            return Err(AecError::Config("sample rate must be positive".into()));
        }

        let aligned;
        let reference = if align {
            aligned = self.align(mic, reference, sample_rate);
            aligned.as_slice()
        } else {
            reference
        };

        let mic_spec = self.stft.analyze(mic);
        let ref_spec = self.stft.analyze(reference);
        if ref_spec.num_frames() < mic_spec.num_frames() {
            warn!(
                "reference covers {} of {} mic frames; trailing frames pass through",
                ref_spec.num_frames(),
                mic_spec.num_frames()
            );
        }

        let recursion = self.recursion();
        let mut state = recursion.new_state();
        let estimate = recursion.run(&mut state, &mic_spec, &ref_spec, cancel)?;

        let residual = Spectrogram::from_matrix(mic_spec.as_matrix() - estimate.echo.as_matrix());
        let samples = self.stft.synthesize(&residual, mic.len())?;
        debug!(
            "processed {} samples at {} Hz ({} frames)",
            samples.len(),
            sample_rate,
            estimate.frames_processed
        );

        Ok(Processed {
            audio: AudioBuffer::new(samples, sample_rate),
            stats: state.stats(),
            frames_processed: estimate.frames_processed,
            total_frames: mic_spec.num_frames().min(ref_spec.num_frames()),
            cancelled: estimate.cancelled,
        })
    }

    /// Delays the reference by the estimated echo path delay.
    fn align(&self, mic: &[f32], reference: &[f32], sample_rate: u32) -> Vec<f32> {
        let window = sample_rate as usize * ALIGN_WINDOW_SECS;
        let tau = self.aligner.estimate(
            &mic[..mic.len().min(window)],
            &reference[..reference.len().min(window)],
            sample_rate,
        );
        let delay = delay_samples(tau, sample_rate);
        info!("estimated echo delay {:.4} s, shifting reference by {} samples", tau, delay);
        delay_reference(reference, delay, mic.len())
    }
}

fn validate_signal(name: &'static str, samples: &[f32]) -> Result<()> {
    if samples.is_empty() {
        return Err(AecError::EmptySignal(name));
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err(AecError::NonFiniteSamples(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gain::NlmsGain;
    use crate::weights::Tensor;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn nlms_canceller() -> EchoCanceller<NlmsGain> {
        EchoCanceller::with_predictor(NlmsGain::new(4, 0.5).unwrap(), NkfConfig::default()).unwrap()
    }

    fn noise(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.random::<f32>() * 0.6 - 0.3).collect()
    }

    fn random_tensors(config: &NkfConfig) -> TensorMap {
        let mut rng = StdRng::seed_from_u64(99);
        let mut map = TensorMap::new();
        for (name, shape) in KgNet::parameter_shapes(config) {
            let len = shape.iter().product();
            let data = (0..len).map(|_| rng.random::<f32>() * 0.2 - 0.1).collect();
            map.insert(name, Tensor::new(shape, data));
        }
        map
    }

    #[test]
    fn rejects_invalid_inputs_before_processing() {
        let aec = nlms_canceller();
        let ok = AudioBuffer::new(vec![0.1; 1000], 16000);

        let other_rate = AudioBuffer::new(vec![0.1; 1000], 8000);
        assert!(matches!(
            aec.process(&ok, &other_rate, false),
            Err(AecError::SampleRateMismatch {
                mic: 16000,
                reference: 8000
            })
        ));

        let empty = AudioBuffer::new(Vec::new(), 16000);
        assert!(matches!(aec.process(&empty, &ok, false), Err(AecError::EmptySignal("mic"))));

        let mut bad = ok.clone();
        bad.samples[10] = f32::NAN;
        assert!(matches!(
            aec.process(&ok, &bad, false),
            Err(AecError::NonFiniteSamples("reference"))
        ));
    }

    #[test]
    fn predictor_and_config_must_agree_on_filter_order() {
        let config = NkfConfig {
            filter_order: 6,
            ..Default::default()
        };
        let result = EchoCanceller::with_predictor(NlmsGain::new(4, 0.5).unwrap(), config);
        assert!(matches!(result, Err(AecError::Config(_))));
    }

    #[test]
    fn output_matches_mic_length_and_rate() {
        let aec = nlms_canceller();
        for (mic_len, ref_len) in [(16000, 16000), (12345, 16000), (16000, 9000), (300, 300)] {
            let mic = AudioBuffer::new(noise(mic_len, 1), 16000);
            let reference = AudioBuffer::new(noise(ref_len, 2), 16000);
            let out = aec.process(&mic, &reference, false).unwrap();
            assert_eq!(out.len(), mic_len);
            assert_eq!(out.sample_rate, 16000);
            assert!(out.samples.iter().all(|s| s.is_finite()));
        }
    }

    #[test]
    fn silent_reference_passes_mic_through() {
        let aec = nlms_canceller();
        let mic = noise(8000, 3);
        let out = aec.process_samples(&mic, &vec![0.0; 8000], 16000, false).unwrap();
        for (a, b) in mic.iter().zip(&out) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn learned_model_loads_from_store_and_runs() {
        let config = NkfConfig::default();
        let mut store = HashMap::new();
        store.insert("nkf".to_string(), random_tensors(&config));

        let aec = EchoCanceller::from_store(&store, "nkf", config).unwrap();
        assert_eq!(aec.predictor().num_params(), 5302);
        let reference = noise(4000, 4);
        let mic: Vec<f32> = reference.iter().map(|s| s * 0.5).collect();
        let out = aec.process_samples(&mic, &reference, 16000, false).unwrap();
        assert_eq!(out.len(), 4000);
        assert!(out.iter().all(|s| s.is_finite()));

        assert!(matches!(
            EchoCanceller::from_store(&store, "missing", config),
            Err(AecError::WeightsNotFound(_))
        ));
    }

    #[test]
    fn alignment_shifts_reference() {
        struct Fixed(f32);
        impl DelayEstimator for Fixed {
            fn estimate(&self, _: &[f32], _: &[f32], _: u32) -> f32 {
                self.0
            }
        }
        let aec = nlms_canceller().with_delay_estimator(Fixed(0.0115));
        let reference = noise(1000, 5);
        let shifted = aec.align(&reference, &reference, 1000);
        assert_eq!(shifted.len(), 1000);
        assert!(shifted[..10].iter().all(|&s| s == 0.0));
        assert_eq!(&shifted[10..], &reference[..990]);
    }

    #[test]
    fn cancelled_run_reports_partial_progress() {
        let aec = nlms_canceller();
        let mic = AudioBuffer::new(noise(16000, 6), 16000);
        let reference = AudioBuffer::new(noise(16000, 7), 16000);
        let cancel = AtomicBool::new(true);

        let processed = aec.process_cancellable(&mic, &reference, false, &cancel).unwrap();
        assert!(processed.cancelled);
        assert_eq!(processed.frames_processed, 0);
        assert_eq!(processed.total_frames, 63);
        // Nothing was estimated, so the mic comes back unchanged.
        for (a, b) in mic.samples.iter().zip(&processed.audio.samples) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
