//! Neural network layers written as pairs of forward and backward functions over
//! `ndarray` arrays.
//!
//! Every `*_forward` returns its output together with a cache, and the matching
//! `*_backward` turns an upstream gradient and that cache into gradients for the inputs
//! and parameters. Models ([`cnn`], [`rnn`]) chain these layers, and a [`solver::Solver`]
//! trains them with an optimizer from [`optim`].

pub mod cnn;
pub mod conv;
pub mod dataloader;
pub mod datasets;
pub mod gradient_check;
pub mod layers;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod rnn;
pub mod rnn_layers;
pub mod solver;
