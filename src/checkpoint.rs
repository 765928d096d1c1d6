//! Saving and restoring trained networks
//!
//! A checkpoint holds the architecture (`input_size`, `output_size`, `hidden_layers`) next to
//! the `state_dict` of learned parameters, so a fresh network of the right shape can be built
//! before the parameters are copied into it. It is written as a single JSON document.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    network::{DEFAULT_DROP_P, Network},
    nn::{Module, NNError, StateDict},
};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to access checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse checkpoint {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Parameter `{key}` holds a non-finite value, the network diverged")]
    NonFinite { key: String },
    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Checkpoint does not describe a valid network: {0}")]
    Architecture(#[from] NNError),
}

/// Architecture and learned parameters of a `Network`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub input_size: usize,
    pub output_size: usize,
    pub hidden_layers: Vec<usize>,
    pub state_dict: StateDict,
}

impl Checkpoint {
    pub fn from_network(network: &Network) -> Self {
        Self {
            input_size: network.input_size(),
            output_size: network.output_size(),
            hidden_layers: network.hidden_sizes(),
            state_dict: network.state_dict(),
        }
    }

    /// Writes the checkpoint next to `path` first and renames it into place, so a failed
    /// write never leaves a half-written checkpoint behind
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        // JSON has no NaN or infinity, serde_json would write them as null
        if let Some((key, _)) = self
            .state_dict
            .iter()
            .find(|(_, tensor)| tensor.data.iter().any(|v| !v.is_finite()))
        {
            return Err(CheckpointError::NonFinite { key: key.clone() });
        }
        let json = serde_json::to_string(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        if let Err(source) = fs::write(&tmp, json) {
            let _ = fs::remove_file(&tmp);
            return Err(CheckpointError::Io { path: tmp, source });
        }
        if let Err(source) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(CheckpointError::Io { path: tmp, source });
        }
        log::info!(
            "Saved checkpoint ({} parameter tensors) to '{}'",
            self.state_dict.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| CheckpointError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Builds a network from the recorded architecture and loads the parameters into it.
    ///
    /// Fails if `hidden_layers` does not agree with the stored tensors.
    pub fn to_network(&self, drop_p: f32) -> Result<Network, CheckpointError> {
        let mut network = Network::new(
            self.input_size,
            self.output_size,
            &self.hidden_layers,
            drop_p,
        )?;
        network.load_state_dict(&self.state_dict)?;
        Ok(network)
    }
}

/// Saves the architecture and parameters of `network` to `path`
pub fn save_checkpoint(network: &Network, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
    Checkpoint::from_network(network).save(path)
}

/// Rebuilds a network saved with `save_checkpoint`, with the default dropout probability
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Network, CheckpointError> {
    let path = path.as_ref();
    let checkpoint = Checkpoint::load(path)?;
    let network = checkpoint.to_network(DEFAULT_DROP_P)?;
    log::info!(
        "Loaded network {} -> {:?} -> {} from '{}'",
        network.input_size(),
        network.hidden_sizes(),
        network.output_size(),
        path.display()
    );
    Ok(network)
}
