//! Shared types for layers and models: errors, train/test mode and named parameters

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    str::FromStr,
};

use ndarray::{Array, Array2, ArrayD, ArrayView, Axis, Dimension, IntoDimension};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

/// Errors for the layers and networks
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Index {index} out of range for {what} of size {size}")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        size: usize,
    },
    #[error("Invalid value for {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("Invalid mode \"{0}\", expected \"train\" or \"test\"")]
    InvalidMode(String),
    #[error("Missing parameter {0}")]
    MissingParam(String),
    #[error("Empty batch")]
    EmptyBatch,
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// Whether a layer runs with training behaviour (batch statistics, dropout masks)
/// or inference behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Test,
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Mode {
    type Err = NNError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Mode::Train),
            "test" => Ok(Mode::Test),
            other => Err(NNError::InvalidMode(other.to_string())),
        }
    }
}

/// Named parameters (or their gradients) of a network, e.g. `"W1"`, `"b1"`
pub type Params = BTreeMap<String, ArrayD<f64>>;

/// Looks up a parameter and views it with a fixed dimensionality
pub fn param_view<'a, D: Dimension>(
    params: &'a Params,
    name: &str,
) -> Result<ArrayView<'a, f64, D>, NNError> {
    let p = params
        .get(name)
        .ok_or_else(|| NNError::MissingParam(name.to_string()))?;
    Ok(p.view().into_dimensionality::<D>()?)
}

/// Samples a parameter from a zero mean Gaussian with standard deviation `scale`
pub(crate) fn init_normal<Sh: IntoDimension, R: Rng>(
    shape: Sh,
    scale: f64,
    rng: &mut R,
) -> Result<ArrayD<f64>, NNError> {
    if !(scale >= 0.0 && scale.is_finite()) {
        return Err(NNError::InvalidParameter {
            name: "weight scale",
            reason: format!("must be finite and non-negative, got {}", scale),
        });
    }
    let normal = Normal::new(0.0, scale).map_err(|e| NNError::InvalidParameter {
        name: "weight scale",
        reason: e.to_string(),
    })?;
    Ok(Array::from_shape_simple_fn(shape.into_dimension(), || normal.sample(&mut *rng)).into_dyn())
}

/// Returns an error unless `got` equals `expected`
pub(crate) fn check_shape(
    what: &'static str,
    expected: &[usize],
    got: &[usize],
) -> Result<(), NNError> {
    if expected != got {
        return Err(NNError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        });
    }
    Ok(())
}

/// A network which can compute its loss and the gradient of the loss for every parameter.
/// Loosely analogous to torch.nn.Module, except gradients come from chaining the
/// hand-derived `*_backward` functions rather than from an autograd graph.
pub trait Model {
    type Input;
    type Target;

    fn params(&self) -> &Params;
    fn params_mut(&mut self) -> &mut Params;

    /// Computes the loss and a gradient entry for every key of [`Model::params`]
    fn loss(&self, input: &Self::Input, target: &Self::Target) -> Result<(f64, Params), NNError>;
}

/// A model that produces class scores of shape (N, C)
pub trait Classifier: Model {
    fn scores(&self, input: &Self::Input) -> Result<Array2<f64>, NNError>;

    /// Returns the index of the highest score for every example
    fn predict(&self, input: &Self::Input) -> Result<Vec<usize>, NNError> {
        let scores = self.scores(input)?;
        Ok(argmax_rows(&scores))
    }
}

/// Index of the maximum entry along each row, first index wins on ties
pub fn argmax_rows(scores: &Array2<f64>) -> Vec<usize> {
    scores
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 { (i, v) } else { best }
                })
                .0
        })
        .collect()
}
