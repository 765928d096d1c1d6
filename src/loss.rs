//! Loss functions for classification

use thiserror::Error;

use crate::{nn::LogSoftmax, values::Value};

#[derive(Debug, Error, PartialEq)]
pub enum LossError {
    #[error("Cannot compute a loss over an empty batch")]
    EmptyBatch,
    #[error("Batch has {outputs} outputs but {targets} targets")]
    BatchSizeMismatch { outputs: usize, targets: usize },
    #[error("Target class {target} is out of range for {n_classes} classes")]
    TargetOutOfRange { target: usize, n_classes: usize },
}

/// Negative log likelihood over a batch of log-probabilities, averaged over the batch
/// <https://pytorch.org/docs/stable/generated/torch.nn.NLLLoss.html>
pub struct NLLLoss;

impl NLLLoss {
    pub fn call<T>(log_probs: &[T], targets: &[usize]) -> Result<Value, LossError>
    where
        T: AsRef<[Value]>,
    {
        if log_probs.is_empty() {
            return Err(LossError::EmptyBatch);
        }
        if log_probs.len() != targets.len() {
            return Err(LossError::BatchSizeMismatch {
                outputs: log_probs.len(),
                targets: targets.len(),
            });
        }
        let picked = log_probs
            .iter()
            .zip(targets.iter())
            .map(|(sample, &target)| {
                let sample = sample.as_ref();
                sample
                    .get(target)
                    .cloned()
                    .ok_or(LossError::TargetOutOfRange {
                        target,
                        n_classes: sample.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let total = picked.into_iter().sum::<Value>();
        Ok(-&(total / Value::new(targets.len() as f32)))
    }
}

/// `LogSoftmax` followed by `NLLLoss`, takes raw logits
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn call<T>(logits: &[T], targets: &[usize]) -> Result<Value, LossError>
    where
        T: AsRef<[Value]>,
    {
        let log_softmax = LogSoftmax::new();
        let log_probs = logits
            .iter()
            .map(|l| log_softmax.forward(l.as_ref()))
            .collect::<Vec<_>>();
        NLLLoss::call(&log_probs, targets)
    }
}
