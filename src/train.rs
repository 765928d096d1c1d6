//! Training loop and evaluation helpers

use std::cmp::Ordering;

use thiserror::Error;

use crate::{
    dataloader::DataLoader,
    loss::{LossError, NLLLoss},
    nn::{Module, NNError},
    optim::Optim,
    values::Value,
};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Network(#[from] NNError),
    #[error(transparent)]
    Loss(#[from] LossError),
}

/// How long to train and how often to report
#[derive(Debug, Clone, Copy)]
pub struct TrainConfig {
    pub epochs: usize,
    /// Run validation every `print_every` optimizer steps
    pub print_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 2,
            print_every: 40,
        }
    }
}

/// Metrics over a held-out dataset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationReport {
    pub epoch: usize,
    pub step: usize,
    /// training loss averaged over the steps since the previous report
    pub train_loss: f32,
    /// mean of the per-batch losses
    pub test_loss: f32,
    /// fraction of samples whose most likely class is the label
    pub accuracy: f32,
}

/// Trains `model` for `config.epochs` passes over `trainloader`.
///
/// Each batch runs zero_grad, forward, loss, backward, step. Every `print_every` steps the
/// model is evaluated on `testloader` in eval mode and a report is logged and recorded.
pub fn train<M: Module + ?Sized>(
    model: &M,
    trainloader: &DataLoader,
    testloader: &DataLoader,
    optimizer: &mut dyn Optim,
    config: TrainConfig,
) -> Result<Vec<ValidationReport>, TrainError> {
    let mut reports = vec![];
    let mut steps = 0;
    let mut running_loss = 0.0;
    let print_every = config.print_every.max(1);
    model.train();

    for epoch in 0..config.epochs {
        for (inputs, labels) in trainloader.iter() {
            steps += 1;
            optimizer.zero_grad();

            let output = model.forward_batch(&inputs)?;
            let loss = NLLLoss::call(&output, &labels)?;
            loss.backward();
            optimizer.step();

            running_loss += loss.data();

            if steps % print_every == 0 {
                model.eval();
                let (test_loss, accuracy) = validation(model, testloader)?;
                let report = ValidationReport {
                    epoch: epoch + 1,
                    step: steps,
                    train_loss: running_loss / print_every as f32,
                    test_loss,
                    accuracy,
                };
                log::info!(
                    "Epoch: {}/{}.. Training Loss: {:.3}.. Test Loss: {:.3}.. Test Accuracy: {:.3}",
                    report.epoch,
                    config.epochs,
                    report.train_loss,
                    report.test_loss,
                    report.accuracy
                );
                reports.push(report);
                running_loss = 0.0;
                model.train();
            }
        }
        log::debug!("finished epoch {} after {} steps", epoch + 1, steps);
    }
    Ok(reports)
}

/// Returns `(mean batch loss, accuracy)` of `model` over `loader`.
///
/// The model is not switched to eval mode here, callers decide.
pub fn validation<M: Module + ?Sized>(
    model: &M,
    loader: &DataLoader,
) -> Result<(f32, f32), TrainError> {
    let mut test_loss = 0.0;
    let mut n_batches = 0;
    let mut n_correct = 0;
    let mut n_samples = 0;
    for (inputs, labels) in loader.iter() {
        let output = model.forward_batch(&inputs)?;
        test_loss += NLLLoss::call(&output, &labels)?.data();
        n_batches += 1;
        n_correct += output
            .iter()
            .zip(labels.iter())
            .filter(|(out, label)| argmax(out) == Some(**label))
            .count();
        n_samples += labels.len();
    }
    if n_samples == 0 {
        return Ok((0.0, 0.0));
    }
    Ok((
        test_loss / n_batches as f32,
        n_correct as f32 / n_samples as f32,
    ))
}

/// Index of the largest value, `None` for an empty slice
pub fn argmax(values: &[Value]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.data().partial_cmp(&b.data()).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i)
}

/// Class probabilities for one input, computed in eval mode
///
/// The model is expected to output log-probabilities. It is left in eval mode.
pub fn predict_proba<M: Module + ?Sized>(model: &M, input: &[f32]) -> Result<Vec<f32>, NNError> {
    model.eval();
    let input = input.iter().map(|x| Value::new(*x)).collect::<Vec<_>>();
    let log_probs = model.forward(&input)?;
    Ok(log_probs.iter().map(|v| v.data().exp()).collect())
}

/// The `k` most likely `(class, probability)` pairs, most likely first
pub fn top_k(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked = probs.iter().copied().enumerate().collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::{
        assert_eq_float,
        datasets::{Dataset, load_dataset},
        network::Network,
        optim::{Adam, SGD},
    };

    use super::*;

    fn loaders(dataset: Dataset, seed: u64) -> (DataLoader, DataLoader) {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let (train_x, train_y) = load_dataset(dataset, 60, &mut rng);
        let (test_x, test_y) = load_dataset(dataset, 20, &mut rng);
        (
            DataLoader::new(train_x, train_y, 16, true).unwrap(),
            DataLoader::new(test_x, test_y, 16, false).unwrap(),
        )
    }

    #[test]
    fn test_training_reduces_loss() {
        let (trainloader, testloader) = loaders(Dataset::Line, 11);
        let model =
            Network::from_rng(2, 2, &[8], 0.0, &mut Pcg64Mcg::seed_from_u64(5)).unwrap();
        let (initial_loss, _) = validation(&model, &testloader).unwrap();

        let mut optimizer = Adam::new(model.parameters(), 0.01);
        let config = TrainConfig {
            epochs: 20,
            print_every: 8,
        };
        let reports = train(&model, &trainloader, &testloader, &mut optimizer, config).unwrap();

        // 120 samples in batches of 16 is 8 steps per epoch
        assert_eq!(reports.len(), 20);
        assert_eq!(reports[0].step, 8);
        let last = reports.last().unwrap();
        assert_eq!(last.epoch, 20);
        assert!(last.test_loss < initial_loss);
        assert!(last.accuracy > 0.8, "accuracy {}", last.accuracy);
        assert!(model.is_training());
    }

    #[test]
    fn test_manual_gradient_step() {
        let model =
            Network::from_rng(2, 3, &[4], 0.0, &mut Pcg64Mcg::seed_from_u64(3)).unwrap();
        let mut optimizer = SGD::new(model.parameters(), 0.01, 0.0);
        let params = model.parameters();
        let before = params.iter().map(|p| p.data()).collect::<Vec<_>>();

        let inputs = vec![vec![Value::new(0.5), Value::new(-1.5)]];
        optimizer.zero_grad();
        let output = model.forward_batch(&inputs).unwrap();
        let loss = NLLLoss::call(&output, &[1]).unwrap();
        loss.backward();
        let grads = params.iter().map(|p| p.grad()).collect::<Vec<_>>();
        assert!(grads.iter().any(|g| *g != 0.0));
        optimizer.step();

        for ((p, b), g) in params.iter().zip(before).zip(grads) {
            assert_eq_float!(p.data(), b - 0.01 * g);
        }
    }

    #[test]
    fn test_validation_counts_correct_predictions() {
        let (_, testloader) = loaders(Dataset::XOR, 2);
        let model = Network::new(2, 2, &[4], 0.0).unwrap();
        let (loss, accuracy) = validation(&model, &testloader).unwrap();
        assert!(loss > 0.0);
        assert!((0.0..=1.0).contains(&accuracy));

        let empty = DataLoader::new(vec![], vec![], 4, false).unwrap();
        assert_eq!(validation(&model, &empty).unwrap(), (0.0, 0.0));
    }

    #[test]
    fn test_validation_propagates_shape_errors() {
        let (_, testloader) = loaders(Dataset::Moon, 4);
        let model = Network::new(3, 2, &[4], 0.0).unwrap();
        assert!(matches!(
            validation(&model, &testloader),
            Err(TrainError::Network(NNError::InputSizeMismatch { .. }))
        ));
    }

    #[test]
    fn test_predict_proba_and_top_k() {
        let model = Network::new(2, 3, &[5], 0.5).unwrap();
        let probs = predict_proba(&model, &[0.1, 0.2]).unwrap();
        assert!(!model.is_training());
        assert_eq!(probs.len(), 3);
        assert_eq_float!(probs.iter().sum::<f32>(), 1.0);

        let ranked = top_k(&[0.1, 0.6, 0.3], 2);
        assert_eq!(ranked, vec![(1, 0.6), (2, 0.3)]);
        assert_eq!(top_k(&[0.5], 3).len(), 1);
    }

    #[test]
    fn test_argmax() {
        let values = [Value::new(0.1), Value::new(2.0), Value::new(-1.0)];
        assert_eq!(argmax(&values), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
