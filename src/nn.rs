//! Components to build a neural network

use std::{
    collections::BTreeMap,
    sync::atomic::{self, AtomicBool, AtomicUsize},
};

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::values::Value;

/// Errors for the neural network
#[derive(Debug, Error, PartialEq)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected}, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("Invalid architecture: {0}")]
    InvalidArchitecture(String),
    #[error("Parameter `{0}` is missing from the state dict")]
    MissingKey(String),
    #[error("Unexpected parameter `{0}` in the state dict")]
    UnexpectedKey(String),
    #[error("Shape mismatch for `{key}`: model expects {expected:?}, state dict has {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Parameter `{key}` has shape {shape:?} but holds {len} values")]
    CorruptTensor {
        key: String,
        shape: Vec<usize>,
        len: usize,
    },
}

/// Plain, serializable copy of a parameter tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    /// row-major values
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn from_values<'a>(shape: Vec<usize>, values: impl IntoIterator<Item = &'a Value>) -> Self {
        Self {
            shape,
            data: values.into_iter().map(|v| v.data()).collect(),
        }
    }

    /// Number of elements implied by the shape
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Named parameter tensors of a module, the `state_dict` of PyTorch
pub type StateDict = BTreeMap<String, TensorData>;

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    /// Forward pass for a single sample
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError>;

    fn forward_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<Vec<Value>>, NNError> {
        batch.iter().map(|sample| self.forward(sample)).collect()
    }

    fn parameters(&self) -> Vec<Value>;

    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    /// Puts the module in training mode
    fn train(&self) {}

    /// Puts the module in evaluation mode (e.g. disables dropout)
    fn eval(&self) {}

    fn state_dict(&self) -> StateDict;

    /// Copies parameter values from `state`. Nothing is written unless every
    /// key and shape matches.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), NNError>;
}

/// Checks that `loaded` has exactly the keys and shapes of `expected`
pub fn check_state_dict(expected: &StateDict, loaded: &StateDict) -> Result<(), NNError> {
    for (key, tensor) in loaded.iter() {
        if tensor.data.len() != tensor.numel() {
            return Err(NNError::CorruptTensor {
                key: key.clone(),
                shape: tensor.shape.clone(),
                len: tensor.data.len(),
            });
        }
    }
    for (key, expected_tensor) in expected.iter() {
        let Some(tensor) = loaded.get(key) else {
            return Err(NNError::MissingKey(key.clone()));
        };
        if tensor.shape != expected_tensor.shape {
            return Err(NNError::ShapeMismatch {
                key: key.clone(),
                expected: expected_tensor.shape.clone(),
                got: tensor.shape.clone(),
            });
        }
    }
    if let Some(key) = loaded.keys().find(|k| !expected.contains_key(*k)) {
        return Err(NNError::UnexpectedKey(key.clone()));
    }
    Ok(())
}

/// Prepends `prefix.` to every key
pub fn prefixed(prefix: &str, state: StateDict) -> StateDict {
    state
        .into_iter()
        .map(|(k, v)| (format!("{}.{}", prefix, k), v))
        .collect()
}

/// Entries under `prefix.`, with the prefix stripped
pub fn sub_state_dict(prefix: &str, state: &StateDict) -> StateDict {
    let prefix = format!("{}.", prefix);
    state
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|k| (k.to_string(), v.clone())))
        .collect()
}

/// Fully connected layer computing `weight · x + bias`
pub struct Linear {
    /// `out_features` rows of `in_features` weights
    weight: Vec<Vec<Value>>,
    bias: Vec<Value>,
    in_features: usize,
    n_output_nans: AtomicUsize,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::from_rng(in_features, out_features, &mut rand::rng())
    }

    pub fn from_rng<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        // He initialization keeps the activation variance stable through ReLU layers,
        // larger weights make the exponentials in (log-)softmax overflow
        let std_dev = (2.0 / in_features.max(1) as f32).sqrt();
        let mut sample = || {
            let z: f32 = rng.sample(StandardNormal);
            Value::new(z * std_dev)
        };
        let weight: Vec<Vec<Value>> = (0..out_features)
            .map(|_| (0..in_features).map(|_| sample()).collect::<Vec<_>>())
            .collect();
        let bias: Vec<Value> = (0..out_features).map(|_| sample()).collect();
        Self {
            weight,
            bias,
            in_features,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    // Testing utility for a deterministic and simple layer
    #[cfg(test)]
    pub(crate) fn new_ones(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: (0..out_features)
                .map(|_| (0..in_features).map(|_| Value::new(1.0)).collect::<Vec<_>>())
                .collect(),
            bias: (0..out_features).map(|_| Value::new(1.0)).collect(),
            in_features,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.bias.len()
    }

    /// `[out_features, in_features]`, as in PyTorch
    pub fn weight_shape(&self) -> Vec<usize> {
        vec![self.out_features(), self.in_features]
    }

    /// Number of NaN outputs seen in the last forward pass
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Module for Linear {
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        if inputs.len() != self.in_features {
            return Err(NNError::InputSizeMismatch {
                expected: self.in_features,
                got: inputs.len(),
            });
        }
        let outputs = self
            .weight
            .iter()
            .zip(self.bias.iter())
            .map(|(row, b)| {
                let dot = row.iter().zip(inputs).map(|(w, x)| w * x).sum::<Value>();
                &dot + b
            })
            .collect::<Vec<_>>();
        let n_output_nans = outputs.iter().filter(|v| v.data().is_nan()).count();
        if n_output_nans > 0 {
            log::debug!("n_output_nans: {}", n_output_nans);
        }
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        Ok(outputs)
    }

    fn parameters(&self) -> Vec<Value> {
        self.weight
            .iter()
            .flatten()
            .chain(self.bias.iter())
            .cloned()
            .collect()
    }

    fn state_dict(&self) -> StateDict {
        StateDict::from([
            (
                "weight".to_string(),
                TensorData::from_values(self.weight_shape(), self.weight.iter().flatten()),
            ),
            (
                "bias".to_string(),
                TensorData::from_values(vec![self.out_features()], self.bias.iter()),
            ),
        ])
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), NNError> {
        check_state_dict(&self.state_dict(), state)?;
        // keys were checked above
        let (weight, bias) = (&state["weight"], &state["bias"]);
        for (param, v) in self.weight.iter_mut().flatten().zip(weight.data.iter()) {
            param.set_data(*v);
        }
        for (param, v) in self.bias.iter_mut().zip(bias.data.iter()) {
            param.set_data(*v);
        }
        Ok(())
    }
}

/// Applies ReLU to a set of values, works for arbitrary number of inputs
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the element-wise ReLU of the input values
    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        let n_dead_neurons = inputs.iter().filter(|v| v.data() <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        inputs.iter().map(|v| v.relu()).collect()
    }

    /// Returns the number of dead neurons in the last forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

/// Inverted dropout: zeroes each input with probability `p` in training mode
/// and scales the survivors by `1 / (1 - p)`
pub struct Dropout {
    p: f32,
    training: AtomicBool,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self, NNError> {
        if !(0.0..1.0).contains(&p) {
            return Err(NNError::InvalidArchitecture(format!(
                "dropout probability must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Self {
            p,
            training: AtomicBool::new(true),
        })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, atomic::Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(atomic::Ordering::Relaxed)
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        self.forward_with_rng(inputs, &mut rand::rng())
    }

    pub fn forward_with_rng<R: Rng + ?Sized>(&self, inputs: &[Value], rng: &mut R) -> Vec<Value> {
        if !self.is_training() || self.p == 0.0 {
            return inputs.to_vec();
        }
        let scale = 1.0 / (1.0 - self.p);
        inputs
            .iter()
            .map(|v| {
                let mask = if rng.random::<f32>() < self.p { 0.0 } else { scale };
                v * &Value::new(mask)
            })
            .collect()
    }
}

/// Applies softmax to a set of values
#[derive(Default)]
pub struct Softmax {}

impl Softmax {
    pub fn new() -> Self {
        Self {}
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        let shifted = shift_by_max(inputs);
        let exps = shifted.iter().map(|v| v.exp()).collect::<Vec<_>>();
        let exp_sum = exps.iter().cloned().sum::<Value>();
        exps.iter().map(|e| e / &exp_sum).collect()
    }
}

/// Log of the softmax, computed as `x - max - ln(sum(exp(x - max)))`
#[derive(Default)]
pub struct LogSoftmax {}

impl LogSoftmax {
    pub fn new() -> Self {
        Self {}
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        if inputs.is_empty() {
            return vec![];
        }
        let shifted = shift_by_max(inputs);
        let log_sum_exp = shifted.iter().map(|v| v.exp()).sum::<Value>().ln();
        shifted.iter().map(|v| v - &log_sum_exp).collect()
    }
}

// Subtracting a constant leaves softmax unchanged, the max keeps exp() from overflowing
fn shift_by_max(inputs: &[Value]) -> Vec<Value> {
    let max = inputs
        .iter()
        .map(|v| v.data())
        .fold(f32::NEG_INFINITY, f32::max);
    let max = Value::new(max);
    inputs.iter().map(|v| v - &max).collect()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_linear_forward() {
        let layer = Linear::new_ones(2, 3);
        let inputs = vec![Value::new(1.0), Value::new(2.0)];
        let outputs = layer.forward(&inputs).unwrap();
        assert_eq!(outputs.len(), 3);
        assert!(outputs.iter().all(|o| o.data() == 4.0));
        assert_eq!(layer.parameters().len(), 9);
    }

    #[test]
    fn test_dim_mismatch() {
        let layer = Linear::new_ones(2, 3);
        let inputs = vec![Value::new(1.0)];
        let err = layer.forward(&inputs).unwrap_err();
        assert_eq!(
            err,
            NNError::InputSizeMismatch {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_linear_gradients() {
        let layer = Linear::new_ones(2, 1);
        let inputs = vec![Value::new(3.0), Value::new(-2.0)];
        let out = layer.forward(&inputs).unwrap();
        out[0].backward();
        let params = layer.parameters();
        // d out / d w_i = x_i, d out / d b = 1
        assert_eq!(params[0].grad(), 3.0);
        assert_eq!(params[1].grad(), -2.0);
        assert_eq!(params[2].grad(), 1.0);
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let a = Linear::from_rng(4, 3, &mut Pcg64Mcg::seed_from_u64(7));
        let b = Linear::from_rng(4, 3, &mut Pcg64Mcg::seed_from_u64(7));
        assert_eq!(a.state_dict(), b.state_dict());
    }

    #[test]
    fn test_linear_state_dict_shapes() {
        let layer = Linear::new(5, 2);
        let state = layer.state_dict();
        assert_eq!(state["weight"].shape, vec![2, 5]);
        assert_eq!(state["weight"].data.len(), 10);
        assert_eq!(state["bias"].shape, vec![2]);
    }

    #[test]
    fn test_linear_load_state_dict() {
        let source = Linear::new(3, 2);
        let mut target = Linear::new_ones(3, 2);
        let handles = target.parameters();
        target.load_state_dict(&source.state_dict()).unwrap();
        assert_eq!(target.state_dict(), source.state_dict());
        // values are written in place, existing handles see the new data
        assert_eq!(handles[0].data(), source.parameters()[0].data());
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let source = Linear::new(4, 2);
        let mut target = Linear::new_ones(3, 2);
        let err = target.load_state_dict(&source.state_dict()).unwrap_err();
        assert_eq!(
            err,
            NNError::ShapeMismatch {
                key: "weight".to_string(),
                expected: vec![2, 3],
                got: vec![2, 4],
            }
        );
        // untouched
        assert!(target.parameters().iter().all(|p| p.data() == 1.0));
    }

    #[test]
    fn test_load_rejects_missing_and_unexpected_keys() {
        let mut target = Linear::new_ones(2, 2);
        let mut state = target.state_dict();
        state.remove("bias");
        assert_eq!(
            target.load_state_dict(&state).unwrap_err(),
            NNError::MissingKey("bias".to_string())
        );

        let mut state = target.state_dict();
        state.insert(
            "extra".to_string(),
            TensorData {
                shape: vec![1],
                data: vec![0.0],
            },
        );
        assert_eq!(
            target.load_state_dict(&state).unwrap_err(),
            NNError::UnexpectedKey("extra".to_string())
        );
    }

    #[test]
    fn test_load_rejects_corrupt_tensor() {
        let mut target = Linear::new_ones(2, 2);
        let mut state = target.state_dict();
        state.get_mut("bias").unwrap().data.push(3.0);
        assert!(matches!(
            target.load_state_dict(&state),
            Err(NNError::CorruptTensor { len: 3, .. })
        ));
    }

    #[test]
    fn test_prefix_helpers() {
        let state = prefixed("output", Linear::new_ones(1, 1).state_dict());
        assert!(state.contains_key("output.weight"));
        assert!(state.contains_key("output.bias"));
        let inner = sub_state_dict("output", &state);
        assert_eq!(inner, Linear::new_ones(1, 1).state_dict());
        assert!(sub_state_dict("out", &state).is_empty());
    }

    #[test]
    fn test_softmax() {
        let softmax = Softmax::new();
        let inputs = vec![Value::new(1.0), Value::new(2.0)];
        let mut outputs = softmax.forward(&inputs);
        assert_eq!(outputs.len(), 2);
        assert_eq_float!(outputs[0].data(), 0.2689414);
        assert_eq_float!(outputs[1].data(), 0.7310585);

        // d s1 / dx1 = s1 * (1 - s1)
        // d s1 / dx2 = -s1 * s2
        outputs[0].backward();
        let s1 = outputs[0].data();
        let s2 = outputs[1].data();
        assert_eq_float!(inputs[0].grad(), s1 * (1.0 - s1));
        assert_eq_float!(inputs[1].grad(), -s1 * s2);

        // zeroing the leaves alone would leave stale intermediate gradients
        outputs[0].zero_grad();
        outputs[1].backward();
        assert_eq_float!(inputs[0].grad(), -s1 * s2);
        assert_eq_float!(inputs[1].grad(), s2 * (1.0 - s2));
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let inputs = vec![Value::new(0.5), Value::new(-1.0), Value::new(2.0)];
        let probs = Softmax::new().forward(&inputs);
        let log_probs = LogSoftmax::new().forward(&inputs);
        for (p, lp) in probs.iter().zip(log_probs.iter()) {
            assert_eq_float!(p.data().ln(), lp.data());
        }
    }

    #[test]
    fn test_log_softmax_gradient() {
        let inputs = vec![Value::new(1.0), Value::new(2.0)];
        let log_probs = LogSoftmax::new().forward(&inputs);
        log_probs[0].backward();
        let s1 = log_probs[0].data().exp();
        let s2 = log_probs[1].data().exp();
        // d log s1 / dx1 = 1 - s1, d log s1 / dx2 = -s2
        assert_eq_float!(inputs[0].grad(), 1.0 - s1);
        assert_eq_float!(inputs[1].grad(), -s2);
    }

    #[test]
    fn test_log_softmax_large_inputs_are_finite() {
        let inputs = vec![Value::new(1000.0), Value::new(999.0)];
        let log_probs = LogSoftmax::new().forward(&inputs);
        assert!(log_probs.iter().all(|v| v.data().is_finite()));
        assert!(LogSoftmax::new().forward(&[]).is_empty());
    }

    #[test]
    fn test_relu_dead_neurons() {
        let relu = ReLU::new();
        let out = relu.forward(&[Value::new(-1.0), Value::new(0.0), Value::new(3.0)]);
        assert_eq!(relu.n_dead_neurons(), 2);
        assert_eq!(out[2].data(), 3.0);
    }

    #[test]
    fn test_dropout() {
        let dropout = Dropout::new(0.5).unwrap();
        let inputs = (0..200).map(|_| Value::new(1.0)).collect::<Vec<_>>();
        let out = dropout.forward_with_rng(&inputs, &mut Pcg64Mcg::seed_from_u64(3));
        assert!(out.iter().all(|v| v.data() == 0.0 || v.data() == 2.0));
        let n_dropped = out.iter().filter(|v| v.data() == 0.0).count();
        assert!(n_dropped > 50 && n_dropped < 150);

        dropout.set_training(false);
        let out = dropout.forward(&inputs);
        assert!(out.iter().all(|v| v.data() == 1.0));
    }

    #[test]
    fn test_dropout_rejects_invalid_probability() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
        assert!(Dropout::new(0.0).is_ok());
    }
}
