//! Gain predictors: the learned complex recurrent network and an NLMS baseline.
//!
//! A predictor maps one bin's feature vector `[xt (L), e (1), dh (L)]` and that
//! bin's recurrent state to a complex gain of length `L`. Predictors are
//! read-only after construction; all per-bin state lives in `Self::State`,
//! which the caller owns and threads through successive calls.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::complex::{combine, split, CVector};
use crate::config::NkfConfig;
use crate::error::{AecError, Result};
use crate::weights::{TensorMap, WeightStore};

pub trait GainPredictor: Send + Sync {
    /// Per-bin recurrent state.
    type State: Clone + Send;

    /// Number of filter taps `L` the predictor produces gains for.
    fn filter_order(&self) -> usize;

    /// Fresh state for one frequency bin.
    fn initial_state(&self) -> Self::State;

    /// Predicts the gain for one bin and one time step, advancing `state`.
    ///
    /// `feature` has length `2L + 1`; the returned gain has length `L`.
    fn step(&self, feature: &CVector, state: &mut Self::State) -> CVector;
}

/// Affine map `W x + b`.
#[derive(Debug, Clone)]
struct Linear {
    weight: DMatrix<f32>,
    bias: DVector<f32>,
}

impl Linear {
    fn load(tensors: &TensorMap, prefix: &str, inputs: usize, outputs: usize) -> Result<Self> {
        Ok(Self {
            weight: tensors.matrix(&format!("{prefix}.weight"), outputs, inputs)?,
            bias: tensors.vector(&format!("{prefix}.bias"), outputs)?,
        })
    }

    fn forward(&self, x: &DVector<f32>) -> DVector<f32> {
        &self.weight * x + &self.bias
    }
}

/// Separate real-valued projections of the real and imaginary parts.
#[derive(Debug, Clone)]
struct ComplexDense {
    real: Linear,
    imag: Linear,
}

impl ComplexDense {
    fn load(tensors: &TensorMap, prefix: &str, inputs: usize, outputs: usize) -> Result<Self> {
        Ok(Self {
            real: Linear::load(tensors, &format!("{prefix}.linear_real"), inputs, outputs)?,
            imag: Linear::load(tensors, &format!("{prefix}.linear_imag"), inputs, outputs)?,
        })
    }

    fn forward(&self, re: &DVector<f32>, im: &DVector<f32>) -> (DVector<f32>, DVector<f32>) {
        (self.real.forward(re), self.imag.forward(im))
    }
}

/// PReLU with one learned slope shared by both parts.
#[derive(Debug, Clone, Copy)]
struct ComplexPrelu {
    slope: f32,
}

impl ComplexPrelu {
    fn load(tensors: &TensorMap, prefix: &str) -> Result<Self> {
        Ok(Self {
            slope: tensors.scalar(&format!("{prefix}.prelu.weight"))?,
        })
    }

    fn apply(&self, v: &mut DVector<f32>) {
        v.apply(|x| {
            if *x < 0.0 {
                *x *= self.slope
            }
        });
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// One GRU layer with gates stacked `[reset, update, new]`.
#[derive(Debug, Clone)]
struct GruCell {
    w_ih: DMatrix<f32>,
    w_hh: DMatrix<f32>,
    b_ih: DVector<f32>,
    b_hh: DVector<f32>,
}

impl GruCell {
    fn load(tensors: &TensorMap, prefix: &str, layer: usize, inputs: usize, hidden: usize) -> Result<Self> {
        Ok(Self {
            w_ih: tensors.matrix(&format!("{prefix}.weight_ih_l{layer}"), 3 * hidden, inputs)?,
            w_hh: tensors.matrix(&format!("{prefix}.weight_hh_l{layer}"), 3 * hidden, hidden)?,
            b_ih: tensors.vector(&format!("{prefix}.bias_ih_l{layer}"), 3 * hidden)?,
            b_hh: tensors.vector(&format!("{prefix}.bias_hh_l{layer}"), 3 * hidden)?,
        })
    }

    fn hidden_size(&self) -> usize {
        self.w_hh.ncols()
    }

    /// `h' = (1 - z) * n + z * h`, with `n = tanh(W_in x + b_in + r * (W_hn h + b_hn))`.
    fn forward(&self, x: &DVector<f32>, h: &DVector<f32>) -> DVector<f32> {
        let hidden = self.hidden_size();
        let gi = &self.w_ih * x + &self.b_ih;
        let gh = &self.w_hh * h + &self.b_hh;
        DVector::from_fn(hidden, |j, _| {
            let r = sigmoid(gi[j] + gh[j]);
            let z = sigmoid(gi[hidden + j] + gh[hidden + j]);
            let n = (gi[2 * hidden + j] + r * gh[2 * hidden + j]).tanh();
            (1.0 - z) * n + z * h[j]
        })
    }
}

/// Stacked GRU; layer `k > 0` consumes layer `k - 1`'s output.
#[derive(Debug, Clone)]
struct Gru {
    layers: Vec<GruCell>,
}

impl Gru {
    fn load(tensors: &TensorMap, prefix: &str, inputs: usize, config: &NkfConfig) -> Result<Self> {
        let layers = (0..config.rnn_layers)
            .map(|layer| {
                let width = if layer == 0 { inputs } else { config.rnn_dim };
                GruCell::load(tensors, prefix, layer, width, config.rnn_dim)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Advances every layer's hidden state and returns the top layer's output.
    fn forward(&self, x: &DVector<f32>, hidden: &mut [DVector<f32>]) -> DVector<f32> {
        let mut input = x.clone();
        for (cell, h) in self.layers.iter().zip(hidden.iter_mut()) {
            *h = cell.forward(&input, h);
            input = h.clone();
        }
        input
    }
}

/// Hidden state of the complex GRU for one frequency bin.
///
/// Each field holds one vector per layer: `rr`/`ir` belong to the real-weight
/// GRU fed the real/imaginary input parts, `ri`/`ii` to the imaginary-weight
/// GRU.
#[derive(Debug, Clone, PartialEq)]
pub struct GainNetworkState {
    pub rr: Vec<DVector<f32>>,
    pub ir: Vec<DVector<f32>>,
    pub ri: Vec<DVector<f32>>,
    pub ii: Vec<DVector<f32>>,
}

impl GainNetworkState {
    pub fn zeros(layers: usize, hidden: usize) -> Self {
        let zeros = vec![DVector::zeros(hidden); layers];
        Self {
            rr: zeros.clone(),
            ir: zeros.clone(),
            ri: zeros.clone(),
            ii: zeros,
        }
    }

    pub fn is_zero(&self) -> bool {
        [&self.rr, &self.ir, &self.ri, &self.ii]
            .iter()
            .all(|layers| layers.iter().all(|h| h.iter().all(|&v| v == 0.0)))
    }
}

/// Complex recurrent cell assembled from two real GRUs by the
/// complex-multiplication rule.
#[derive(Debug, Clone)]
struct ComplexGru {
    gru_r: Gru,
    gru_i: Gru,
}

impl ComplexGru {
    fn forward(
        &self,
        re: &DVector<f32>,
        im: &DVector<f32>,
        state: &mut GainNetworkState,
    ) -> (DVector<f32>, DVector<f32>) {
        let f_rr = self.gru_r.forward(re, &mut state.rr);
        let f_ir = self.gru_r.forward(im, &mut state.ir);
        let f_ri = self.gru_i.forward(re, &mut state.ri);
        let f_ii = self.gru_i.forward(im, &mut state.ii);
        (f_rr - f_ii, f_ri + f_ir)
    }
}

/// Learned Kalman-gain network.
///
/// `ComplexDense -> PReLU -> ComplexGRU -> ComplexDense -> PReLU -> ComplexDense`,
/// taking the `2L + 1` feature vector to an `L`-tap gain.
#[derive(Debug, Clone)]
pub struct KgNet {
    filter_order: usize,
    rnn_layers: usize,
    rnn_dim: usize,
    fc_in: ComplexDense,
    fc_in_act: ComplexPrelu,
    rnn: ComplexGru,
    fc_hidden: ComplexDense,
    fc_hidden_act: ComplexPrelu,
    fc_out: ComplexDense,
    num_params: usize,
}

impl KgNet {
    /// Builds the network from its tensors, checking every shape against
    /// `config`. Any missing or mis-shaped tensor fails the whole build.
    pub fn from_tensors(tensors: &TensorMap, config: &NkfConfig) -> Result<Self> {
        config.validate()?;
        let features = config.feature_len();
        let fc = config.fc_dim;
        let hidden = config.rnn_dim;
        let shapes = Self::parameter_shapes(config);

        let net = Self {
            filter_order: config.filter_order,
            rnn_layers: config.rnn_layers,
            rnn_dim: hidden,
            fc_in: ComplexDense::load(tensors, "kg_net.fc_in.0", features, fc)?,
            fc_in_act: ComplexPrelu::load(tensors, "kg_net.fc_in.1")?,
            rnn: ComplexGru {
                gru_r: Gru::load(tensors, "kg_net.complex_gru.gru_r", fc, config)?,
                gru_i: Gru::load(tensors, "kg_net.complex_gru.gru_i", fc, config)?,
            },
            fc_hidden: ComplexDense::load(tensors, "kg_net.fc_out.0", hidden, fc)?,
            fc_hidden_act: ComplexPrelu::load(tensors, "kg_net.fc_out.1")?,
            fc_out: ComplexDense::load(tensors, "kg_net.fc_out.2", fc, config.filter_order)?,
            num_params: shapes
                .iter()
                .map(|(_, shape)| shape.iter().product::<usize>())
                .sum(),
        };

        debug!(
            "gain network ready: L={}, fc_dim={}, rnn_dim={}x{}, {} parameters",
            config.filter_order, fc, hidden, config.rnn_layers, net.num_params
        );
        if tensors.len() > shapes.len() {
            debug!(
                "weight blob carries {} tensors, {} unused",
                tensors.len(),
                tensors.len() - shapes.len()
            );
        }
        Ok(net)
    }

    /// Loads blob `id` from `store` and builds the network.
    pub fn load<S: WeightStore + ?Sized>(store: &S, id: &str, config: &NkfConfig) -> Result<Self> {
        let tensors = store.load(id)?;
        Self::from_tensors(&tensors, config)
    }

    /// Names and shapes of every tensor the network reads for `config`.
    pub fn parameter_shapes(config: &NkfConfig) -> Vec<(String, Vec<usize>)> {
        let features = config.feature_len();
        let fc = config.fc_dim;
        let hidden = config.rnn_dim;
        let mut shapes = Vec::new();

        let mut dense = |prefix: &str, inputs: usize, outputs: usize| {
            for part in ["linear_real", "linear_imag"] {
                shapes.push((format!("{prefix}.{part}.weight"), vec![outputs, inputs]));
                shapes.push((format!("{prefix}.{part}.bias"), vec![outputs]));
            }
        };
        dense("kg_net.fc_in.0", features, fc);
        dense("kg_net.fc_out.0", hidden, fc);
        dense("kg_net.fc_out.2", fc, config.filter_order);

        shapes.push(("kg_net.fc_in.1.prelu.weight".into(), vec![1]));
        shapes.push(("kg_net.fc_out.1.prelu.weight".into(), vec![1]));

        for gru in ["gru_r", "gru_i"] {
            for layer in 0..config.rnn_layers {
                let width = if layer == 0 { fc } else { hidden };
                let prefix = format!("kg_net.complex_gru.{gru}");
                shapes.push((format!("{prefix}.weight_ih_l{layer}"), vec![3 * hidden, width]));
                shapes.push((format!("{prefix}.weight_hh_l{layer}"), vec![3 * hidden, hidden]));
                shapes.push((format!("{prefix}.bias_ih_l{layer}"), vec![3 * hidden]));
                shapes.push((format!("{prefix}.bias_hh_l{layer}"), vec![3 * hidden]));
            }
        }
        shapes
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }
}

impl GainPredictor for KgNet {
    type State = GainNetworkState;

    fn filter_order(&self) -> usize {
        self.filter_order
    }

    fn initial_state(&self) -> GainNetworkState {
        GainNetworkState::zeros(self.rnn_layers, self.rnn_dim)
    }

    fn step(&self, feature: &CVector, state: &mut GainNetworkState) -> CVector {
        debug_assert_eq!(feature.len(), 2 * self.filter_order + 1);
        let (re, im) = split(feature);

        let (mut re, mut im) = self.fc_in.forward(&re, &im);
        self.fc_in_act.apply(&mut re);
        self.fc_in_act.apply(&mut im);

        let (re, im) = self.rnn.forward(&re, &im, state);

        let (mut re, mut im) = self.fc_hidden.forward(&re, &im);
        self.fc_hidden_act.apply(&mut re);
        self.fc_hidden_act.apply(&mut im);

        let (re, im) = self.fc_out.forward(&re, &im);
        combine(&re, &im)
    }
}

/// Normalised-LMS gain `mu * conj(xt) / (|xt|^2 + delta)`.
///
/// Needs no weights; the recursion under this gain is a per-bin NLMS filter.
#[derive(Debug, Clone, Copy)]
pub struct NlmsGain {
    filter_order: usize,
    step_size: f32,
    regularization: f32,
}

impl NlmsGain {
    pub fn new(filter_order: usize, step_size: f32) -> Result<Self> {
        if filter_order == 0 {
            return Err(AecError::InvalidFilterOrder);
        }
        if !step_size.is_finite() || step_size <= 0.0 {
            return Err(AecError::Config(format!(
                "step_size must be positive, got {step_size}"
            )));
        }
        Ok(Self {
            filter_order,
            step_size,
            regularization: 1e-6,
        })
    }

    pub fn with_regularization(mut self, regularization: f32) -> Self {
        self.regularization = regularization;
        self
    }
}

impl GainPredictor for NlmsGain {
    type State = ();

    fn filter_order(&self) -> usize {
        self.filter_order
    }

    fn initial_state(&self) -> Self::State {}

    fn step(&self, feature: &CVector, _state: &mut ()) -> CVector {
        let xt = feature.rows(0, self.filter_order);
        let energy: f32 = xt.iter().map(|c| c.norm_sqr()).sum();
        let scale = self.step_size / (energy + self.regularization);
        xt.map(|c| c.conj() * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complex::dot;
    use crate::weights::Tensor;
    use num_complex::Complex32;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_tensors(config: &NkfConfig, seed: u64) -> TensorMap {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut map = TensorMap::new();
        for (name, shape) in KgNet::parameter_shapes(config) {
            let len = shape.iter().product();
            let data = (0..len).map(|_| rng.random::<f32>() * 0.6 - 0.3).collect();
            map.insert(name, Tensor::new(shape, data));
        }
        map
    }

    fn zero_tensors(config: &NkfConfig) -> TensorMap {
        let mut map = TensorMap::new();
        for (name, shape) in KgNet::parameter_shapes(config) {
            map.insert(name, Tensor::zeros(shape));
        }
        map
    }

    fn random_feature(len: usize, seed: u64) -> CVector {
        let mut rng = StdRng::seed_from_u64(seed);
        CVector::from_fn(len, |_, _| {
            Complex32::new(rng.random::<f32>() - 0.5, rng.random::<f32>() - 0.5)
        })
    }

    #[test]
    fn reference_model_has_expected_parameter_count() {
        let config = NkfConfig::default();
        let net = KgNet::from_tensors(&random_tensors(&config, 1), &config).unwrap();
        assert_eq!(net.num_params(), 5302);
        assert_eq!(net.filter_order(), 4);
    }

    #[test]
    fn gain_has_filter_order_length() {
        for filter_order in [1, 4, 7] {
            let config = NkfConfig {
                filter_order,
                rnn_layers: 2,
                ..Default::default()
            };
            let net = KgNet::from_tensors(&random_tensors(&config, 2), &config).unwrap();
            let mut state = net.initial_state();
            let gain = net.step(&random_feature(config.feature_len(), 3), &mut state);
            assert_eq!(gain.len(), filter_order);
            assert!(gain.iter().all(|c| c.re.is_finite() && c.im.is_finite()));
            assert_eq!(state.rr.len(), 2);
        }
    }

    #[test]
    fn zero_weights_give_zero_gain_and_keep_zero_state() {
        let config = NkfConfig::default();
        let net = KgNet::from_tensors(&zero_tensors(&config), &config).unwrap();
        let mut state = net.initial_state();
        let gain = net.step(&random_feature(9, 4), &mut state);
        assert!(gain.iter().all(|c| *c == Complex32::new(0.0, 0.0)));
        assert!(state.is_zero());
    }

    #[test]
    fn step_is_deterministic_and_advances_state() {
        let config = NkfConfig::default();
        let net = KgNet::from_tensors(&random_tensors(&config, 5), &config).unwrap();
        let feature = random_feature(9, 6);

        let mut a = net.initial_state();
        let mut b = net.initial_state();
        let first_a = net.step(&feature, &mut a);
        let first_b = net.step(&feature, &mut b);
        assert_eq!(first_a, first_b);
        assert_eq!(a, b);
        assert!(!a.is_zero());

        // Same input, different history, different gain.
        let second = net.step(&feature, &mut a);
        assert_ne!(first_a, second);
    }

    #[test]
    fn gru_cell_follows_reset_update_new_layout() {
        let cell = GruCell {
            w_ih: DMatrix::from_column_slice(3, 1, &[0.1, 0.2, 0.3]),
            w_hh: DMatrix::from_column_slice(3, 1, &[0.4, 0.5, 0.6]),
            b_ih: DVector::from_vec(vec![0.0, 0.0, 0.0]),
            b_hh: DVector::from_vec(vec![0.0, 0.0, 0.1]),
        };
        let x = DVector::from_vec(vec![1.0]);
        let h = DVector::from_vec(vec![0.5]);

        let r = sigmoid(0.1 + 0.4 * 0.5);
        let z = sigmoid(0.2 + 0.5 * 0.5);
        let n = (0.3 + r * (0.6 * 0.5 + 0.1)).tanh();
        let expected = (1.0 - z) * n + z * 0.5;

        let out = cell.forward(&x, &h);
        assert!((out[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn complex_gru_combines_by_complex_multiplication_rule() {
        let config = NkfConfig {
            fc_dim: 3,
            rnn_dim: 2,
            ..Default::default()
        };
        let tensors = random_tensors(&config, 8);
        let gru_r = Gru::load(&tensors, "kg_net.complex_gru.gru_r", 3, &config).unwrap();
        let gru_i = Gru::load(&tensors, "kg_net.complex_gru.gru_i", 3, &config).unwrap();
        let rnn = ComplexGru {
            gru_r: gru_r.clone(),
            gru_i: gru_i.clone(),
        };

        let re = DVector::from_vec(vec![0.3, -0.2, 0.9]);
        let im = DVector::from_vec(vec![-0.5, 0.1, 0.4]);
        let mut state = GainNetworkState::zeros(1, 2);
        let (out_re, out_im) = rnn.forward(&re, &im, &mut state);

        let zero = || vec![DVector::zeros(2)];
        let f_rr = gru_r.forward(&re, &mut zero());
        let f_ir = gru_r.forward(&im, &mut zero());
        let f_ri = gru_i.forward(&re, &mut zero());
        let f_ii = gru_i.forward(&im, &mut zero());
        assert_eq!(out_re, &f_rr - &f_ii);
        assert_eq!(out_im, &f_ri + &f_ir);
        assert_eq!(state.rr[0], f_rr);
        assert_eq!(state.ii[0], f_ii);
    }

    #[test]
    fn complex_dense_projects_parts_independently() {
        let dense = ComplexDense {
            real: Linear {
                weight: DMatrix::from_row_slice(1, 2, &[1.0, 2.0]),
                bias: DVector::from_vec(vec![0.5]),
            },
            imag: Linear {
                weight: DMatrix::from_row_slice(1, 2, &[-1.0, 0.0]),
                bias: DVector::from_vec(vec![0.0]),
            },
        };
        let (re, im) = dense.forward(
            &DVector::from_vec(vec![1.0, 1.0]),
            &DVector::from_vec(vec![3.0, 7.0]),
        );
        assert_eq!(re[0], 3.5);
        assert_eq!(im[0], -3.0);
    }

    #[test]
    fn prelu_scales_only_negative_values() {
        let act = ComplexPrelu { slope: 0.25 };
        let mut v = DVector::from_vec(vec![-4.0, 0.0, 2.0]);
        act.apply(&mut v);
        assert_eq!(v.as_slice(), &[-1.0, 0.0, 2.0]);
    }

    #[test]
    fn mismatched_weights_abort_construction() {
        let trained = NkfConfig::default();
        let tensors = random_tensors(&trained, 9);
        let wider = NkfConfig {
            filter_order: 6,
            ..Default::default()
        };
        assert!(matches!(
            KgNet::from_tensors(&tensors, &wider),
            Err(AecError::TensorShape { .. })
        ));

        let mut partial = TensorMap::new();
        for name in tensors.names().filter(|n| !n.contains("gru_i")) {
            partial.insert(name, tensors.get(name).unwrap().clone());
        }
        assert!(matches!(
            KgNet::from_tensors(&partial, &trained),
            Err(AecError::MissingTensor(name)) if name.contains("gru_i")
        ));
    }

    #[test]
    fn nlms_gain_cancels_error_along_window() {
        let gain = NlmsGain::new(4, 1.0).unwrap().with_regularization(0.0);
        let feature = random_feature(9, 10);
        let kg = gain.step(&feature, &mut ());
        assert_eq!(kg.len(), 4);
        // With mu = 1 the updated taps reproduce the error exactly: xt . kg == 1.
        let xt = CVector::from_iterator(4, feature.iter().take(4).copied());
        let projected = dot(&xt, &kg);
        assert!((projected - Complex32::new(1.0, 0.0)).norm() < 1e-5);
    }

    #[test]
    fn nlms_rejects_bad_parameters() {
        assert!(matches!(NlmsGain::new(0, 0.5), Err(AecError::InvalidFilterOrder)));
        assert!(matches!(NlmsGain::new(4, 0.0), Err(AecError::Config(_))));
    }
}
