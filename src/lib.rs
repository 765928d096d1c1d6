//! A small library for building, training and checkpointing feed-forward classifiers
//! using a PyTorch-like API on top of a scalar autograd engine.

pub mod backprop_fns;
pub mod checkpoint;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod network;
pub mod nn;
pub mod optim;
pub mod train;
pub mod values;
