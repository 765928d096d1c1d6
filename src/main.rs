//! Trains a feed-forward classifier with `fc_classifier`, saves it to a checkpoint, then
//! reloads the checkpoint and checks that the restored network scores the same
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! RUST_LOG=info cargo run -- --dataset spiral --hidden-layers 32,16
//! RUST_LOG=info cargo run -- --train-images train-images-idx3-ubyte --train-labels train-labels-idx1-ubyte \
//!     --test-images t10k-images-idx3-ubyte --test-labels t10k-labels-idx1-ubyte --hidden-layers 256,128,64
//! ```
//!
//! Without IDX files a synthetic 2D dataset is generated.

use std::{error::Error, path::PathBuf};

use clap::{Parser, ValueEnum};
use fc_classifier::{
    checkpoint::{Checkpoint, load_checkpoint, save_checkpoint},
    dataloader::DataLoader,
    datasets::{Dataset, load_dataset, load_idx_dataset, normalize},
    network::Network,
    nn::Module,
    optim::{Adam, Optim, SGD},
    train::{TrainConfig, predict_proba, top_k, train, validation},
};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OptimizerKind {
    Sgd,
    Adam,
}

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Dataset::Spiral)]
    dataset: Dataset,
    /// Training samples per class of the synthetic dataset
    #[clap(short, long, default_value_t = 100)]
    class_size: usize,
    #[clap(short, long, default_value_t = 32)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 30)]
    epochs: usize,
    #[clap(long, value_enum, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,
    #[clap(short, long, default_value_t = 0.01)]
    lr: f32,
    /// Only used by SGD
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    /// Comma separated widths of the hidden layers
    #[clap(long, value_delimiter = ',', default_value = "32,16")]
    hidden_layers: Vec<usize>,
    #[clap(long, default_value_t = 0.2)]
    drop_p: f32,
    /// Validate every N optimizer steps
    #[clap(short, long, default_value_t = 40)]
    print_every: usize,
    #[clap(long)]
    seed: Option<u64>,
    #[clap(long, default_value = "checkpoint.json")]
    checkpoint: PathBuf,
    /// Continue training from this checkpoint instead of a fresh network
    #[clap(long)]
    resume: Option<PathBuf>,
    #[clap(long, requires_all = ["train_labels", "test_images", "test_labels"])]
    train_images: Option<PathBuf>,
    #[clap(long)]
    train_labels: Option<PathBuf>,
    #[clap(long)]
    test_images: Option<PathBuf>,
    #[clap(long)]
    test_labels: Option<PathBuf>,
}

type Split = (Vec<Vec<f32>>, Vec<usize>);

/// Train and test splits, read from IDX files when given, generated otherwise
fn load_data(args: &Args, rng: &mut Pcg64Mcg) -> Result<(Split, Split), Box<dyn Error>> {
    match (
        &args.train_images,
        &args.train_labels,
        &args.test_images,
        &args.test_labels,
    ) {
        (Some(train_images), Some(train_labels), Some(test_images), Some(test_labels)) => {
            let (mut train_x, train_y) = load_idx_dataset(train_images, train_labels)?;
            let (mut test_x, test_y) = load_idx_dataset(test_images, test_labels)?;
            normalize(&mut train_x, 0.5, 0.5);
            normalize(&mut test_x, 0.5, 0.5);
            log::info!(
                "Loaded {} training and {} test images",
                train_x.len(),
                test_x.len()
            );
            Ok(((train_x, train_y), (test_x, test_y)))
        }
        _ => {
            let train_split = load_dataset(args.dataset, args.class_size, rng);
            let test_split = load_dataset(args.dataset, (args.class_size / 4).max(1), rng);
            log::info!(
                "Generated {} dataset: {} training and {} test samples",
                args.dataset,
                train_split.0.len(),
                test_split.0.len()
            );
            Ok((train_split, test_split))
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let seed = args.seed.unwrap_or_else(rand::random);
    log::info!("seed: {}", seed);
    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    let ((train_x, train_y), (test_x, test_y)) = load_data(&args, &mut rng)?;
    let input_size = train_x.first().map(|x| x.len()).ok_or("training set is empty")?;
    let n_classes = train_y
        .iter()
        .chain(test_y.iter())
        .max()
        .map_or(0, |max| max + 1);
    let sample = test_x.first().cloned();

    let model = match &args.resume {
        Some(path) => Checkpoint::load(path)?.to_network(args.drop_p)?,
        None => Network::from_rng(
            input_size,
            n_classes,
            &args.hidden_layers,
            args.drop_p,
            &mut rng,
        )?,
    };
    log::info!(
        "Network: {} -> {:?} -> {}, {} parameters",
        model.input_size(),
        model.hidden_sizes(),
        model.output_size(),
        model.parameters().len()
    );

    let trainloader = DataLoader::new(train_x, train_y, args.batch_size, true)?;
    let testloader = DataLoader::new(test_x, test_y, args.batch_size, false)?;
    let mut optimizer: Box<dyn Optim> = match args.optimizer {
        OptimizerKind::Sgd => Box::new(SGD::new(model.parameters(), args.lr, args.momentum)),
        OptimizerKind::Adam => Box::new(Adam::new(model.parameters(), args.lr)),
    };
    let config = TrainConfig {
        epochs: args.epochs,
        print_every: args.print_every,
    };
    train(
        &model,
        &trainloader,
        &testloader,
        optimizer.as_mut(),
        config,
    )?;

    model.eval();
    let (test_loss, accuracy) = validation(&model, &testloader)?;
    log::info!(
        "Final Test Loss: {:.3}.. Test Accuracy: {:.3}",
        test_loss,
        accuracy
    );

    save_checkpoint(&model, &args.checkpoint)?;
    let restored = load_checkpoint(&args.checkpoint)?;
    restored.eval();
    let (restored_loss, restored_accuracy) = validation(&restored, &testloader)?;
    log::info!(
        "Restored Test Loss: {:.3}.. Test Accuracy: {:.3}",
        restored_loss,
        restored_accuracy
    );
    if restored_accuracy != accuracy {
        log::warn!("restored network does not score like the trained one");
    }

    if let Some(sample) = sample {
        let probs = predict_proba(&restored, &sample)?;
        for (class, p) in top_k(&probs, 3) {
            log::info!("class {}: {:.3}", class, p);
        }
    }
    Ok(())
}
