//! Feed-forward classifier with an arbitrary stack of hidden layers

use rand::Rng;

use crate::{
    nn::{
        Dropout, Linear, LogSoftmax, Module, NNError, ReLU, StateDict, check_state_dict,
        prefixed, sub_state_dict,
    },
    values::Value,
};

/// Dropout probability used when none is specified
pub const DEFAULT_DROP_P: f32 = 0.5;

/// A fully connected network: `hidden_layers` of `Linear -> ReLU -> Dropout`, then an output
/// `Linear` followed by `LogSoftmax`. The outputs are log-probabilities of each class.
pub struct Network {
    input_size: usize,
    output_size: usize,
    hidden_layers: Vec<Linear>,
    output: Linear,
    relu: ReLU,
    dropout: Dropout,
    log_softmax: LogSoftmax,
}

impl Network {
    /// Builds a network with one hidden layer per entry of `hidden_layers`, each entry being
    /// that layer's width
    pub fn new(
        input_size: usize,
        output_size: usize,
        hidden_layers: &[usize],
        drop_p: f32,
    ) -> Result<Self, NNError> {
        Self::from_rng(input_size, output_size, hidden_layers, drop_p, &mut rand::rng())
    }

    pub fn from_rng<R: Rng + ?Sized>(
        input_size: usize,
        output_size: usize,
        hidden_layers: &[usize],
        drop_p: f32,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        if input_size == 0 || output_size == 0 {
            return Err(NNError::InvalidArchitecture(format!(
                "input and output sizes must be positive, got {} and {}",
                input_size, output_size
            )));
        }
        if let Some(idx) = hidden_layers.iter().position(|&w| w == 0) {
            return Err(NNError::InvalidArchitecture(format!(
                "hidden layer {} has zero width",
                idx
            )));
        }
        let dropout = Dropout::new(drop_p)?;

        // each layer consumes the previous layer's width
        let mut in_features = input_size;
        let mut layers = Vec::with_capacity(hidden_layers.len());
        for &width in hidden_layers {
            layers.push(Linear::from_rng(in_features, width, rng));
            in_features = width;
        }
        let output = Linear::from_rng(in_features, output_size, rng);

        Ok(Self {
            input_size,
            output_size,
            hidden_layers: layers,
            output,
            relu: ReLU::new(),
            dropout,
            log_softmax: LogSoftmax::new(),
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Widths of the hidden layers, in order
    pub fn hidden_sizes(&self) -> Vec<usize> {
        self.hidden_layers.iter().map(|l| l.out_features()).collect()
    }

    pub fn n_hidden_layers(&self) -> usize {
        self.hidden_layers.len()
    }

    /// `(in_features, out_features)` of hidden layer `idx`
    pub fn hidden_layer_shape(&self, idx: usize) -> Option<(usize, usize)> {
        self.hidden_layers
            .get(idx)
            .map(|l| (l.in_features(), l.out_features()))
    }

    pub fn drop_p(&self) -> f32 {
        self.dropout.p()
    }

    pub fn is_training(&self) -> bool {
        self.dropout.is_training()
    }

    /// Raw scores of the output layer, before `LogSoftmax`
    pub fn logits(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let mut x = inputs.to_vec();
        for layer in self.hidden_layers.iter() {
            x = layer.forward(&x)?;
            x = self.relu.forward(&x);
            x = self.dropout.forward(&x);
        }
        log::trace!("dead neurons in last hidden layer: {}", self.relu.n_dead_neurons());
        self.output.forward(&x)
    }
}

impl Module for Network {
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let logits = self.logits(inputs)?;
        Ok(self.log_softmax.forward(&logits))
    }

    fn parameters(&self) -> Vec<Value> {
        self.hidden_layers
            .iter()
            .chain(std::iter::once(&self.output))
            .flat_map(|l| l.parameters())
            .collect()
    }

    fn train(&self) {
        self.dropout.set_training(true);
    }

    fn eval(&self) {
        self.dropout.set_training(false);
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for (idx, layer) in self.hidden_layers.iter().enumerate() {
            state.extend(prefixed(&format!("hidden_layers.{}", idx), layer.state_dict()));
        }
        state.extend(prefixed("output", self.output.state_dict()));
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), NNError> {
        // validate everything first so a bad dict leaves the network untouched
        check_state_dict(&self.state_dict(), state)?;
        for (idx, layer) in self.hidden_layers.iter_mut().enumerate() {
            layer.load_state_dict(&sub_state_dict(&format!("hidden_layers.{}", idx), state))?;
        }
        self.output.load_state_dict(&sub_state_dict("output", state))
    }
}
