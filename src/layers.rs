//! Fully connected layer primitives
//!
//! Every layer is a pair of functions: `*_forward` computes the output together with a cache
//! of whatever the backward pass needs, and `*_backward` takes the upstream derivative and
//! the cache and returns the gradients with respect to the layer inputs.

use ndarray::{Array, Array1, Array2, ArrayView, ArrayView1, ArrayView2, Axis, Dimension, Zip};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

use crate::nn::{Mode, NNError, check_shape};

/// Flattens every example of a batch `(N, d_1, ..., d_k)` into a row of `(N, D)`
pub(crate) fn flatten_batch<D: Dimension>(x: &ArrayView<f64, D>) -> Result<Array2<f64>, NNError> {
    if x.ndim() == 0 {
        return Err(NNError::ShapeMismatch {
            what: "batch input",
            expected: vec![0, 0],
            got: vec![],
        });
    }
    let n = x.shape()[0];
    let d = x.shape()[1..].iter().product::<usize>();
    Ok(x.to_shape((n, d))?.into_owned())
}

/// Values from [`affine_forward`] needed by [`affine_backward`]
#[derive(Debug, Clone)]
pub struct AffineCache<D: Dimension> {
    x: Array<f64, D>,
    w: Array2<f64>,
}

/// Forward pass of an affine (fully connected) layer.
///
/// `x` has shape (N, d_1, ..., d_k) and is reshaped to (N, D) with D = d_1 * ... * d_k,
/// `w` has shape (D, M) and `b` has shape (M,). Returns an output of shape (N, M).
pub fn affine_forward<D: Dimension>(
    x: ArrayView<f64, D>,
    w: ArrayView2<f64>,
    b: ArrayView1<f64>,
) -> Result<(Array2<f64>, AffineCache<D>), NNError> {
    let x2 = flatten_batch(&x)?;
    check_shape("affine input features", &[w.nrows()], &[x2.ncols()])?;
    check_shape("affine bias", &[w.ncols()], b.shape())?;

    let out = x2.dot(&w) + &b;
    let cache = AffineCache {
        x: x.to_owned(),
        w: w.to_owned(),
    };
    Ok((out, cache))
}

/// Backward pass of an affine layer. Returns `(dx, dw, db)` with `dx` in the original input shape
pub fn affine_backward<D: Dimension>(
    dout: ArrayView2<f64>,
    cache: &AffineCache<D>,
) -> Result<(Array<f64, D>, Array2<f64>, Array1<f64>), NNError> {
    let x2 = flatten_batch(&cache.x.view())?;
    check_shape("affine upstream gradient", &[x2.nrows(), cache.w.ncols()], dout.shape())?;

    let dx = dout.dot(&cache.w.t()).into_shape_with_order(cache.x.raw_dim())?;
    let dw = x2.t().dot(&dout);
    let db = dout.sum_axis(Axis(0));
    Ok((dx, dw, db))
}

/// Values from [`relu_forward`] needed by [`relu_backward`]
#[derive(Debug, Clone)]
pub struct ReluCache<D: Dimension> {
    x: Array<f64, D>,
}

/// Element-wise `max(0, x)` for inputs of any shape
pub fn relu_forward<D: Dimension>(x: ArrayView<f64, D>) -> (Array<f64, D>, ReluCache<D>) {
    if log::log_enabled!(log::Level::Debug) {
        let n_dead = x.iter().filter(|&&v| v <= 0.0).count();
        log::debug!("relu: {} of {} units inactive", n_dead, x.len());
    }
    let out = x.mapv(|v| v.max(0.0));
    (out, ReluCache { x: x.to_owned() })
}

/// Passes the upstream gradient through wherever the input was positive
pub fn relu_backward<D: Dimension>(
    dout: ArrayView<f64, D>,
    cache: &ReluCache<D>,
) -> Result<Array<f64, D>, NNError> {
    check_shape("relu upstream gradient", cache.x.shape(), dout.shape())?;
    let mut dx = dout.to_owned();
    Zip::from(&mut dx).and(&cache.x).for_each(|d, &x| {
        if x <= 0.0 {
            *d = 0.0;
        }
    });
    Ok(dx)
}

/// Hyperparameters and running statistics of a batch normalization layer.
///
/// The running averages are updated in place by [`batchnorm_forward`] in training mode and
/// are used instead of batch statistics in test mode. They start out as zeros.
#[derive(Debug, Clone)]
pub struct BatchNormParam {
    pub mode: Mode,
    /// added to the variance for numeric stability
    pub eps: f64,
    /// weight of the old running statistics in the exponential moving average
    pub momentum: f64,
    pub running_mean: Option<Array1<f64>>,
    pub running_var: Option<Array1<f64>>,
}

impl Default for BatchNormParam {
    fn default() -> Self {
        Self {
            mode: Mode::Train,
            eps: 1e-5,
            momentum: 0.9,
            running_mean: None,
            running_var: None,
        }
    }
}

impl BatchNormParam {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Intermediates of [`batchnorm_forward`]
#[derive(Debug, Clone)]
pub struct BatchNormCache {
    mode: Mode,
    /// x minus the mean that was used for normalization
    x_centered: Array2<f64>,
    /// 1 / sqrt(var + eps)
    inv_std: Array1<f64>,
    x_hat: Array2<f64>,
    gamma: Array1<f64>,
}

/// Forward pass of batch normalization over a batch of shape (N, D).
///
/// In training mode the batch mean and (uncorrected) variance normalize the data and the
/// running averages in `bn_param` are updated as
/// `running = momentum * running + (1 - momentum) * batch_stat`.
/// In test mode the running averages normalize the data.
pub fn batchnorm_forward(
    x: ArrayView2<f64>,
    gamma: ArrayView1<f64>,
    beta: ArrayView1<f64>,
    bn_param: &mut BatchNormParam,
) -> Result<(Array2<f64>, BatchNormCache), NNError> {
    let (n, d) = x.dim();
    check_shape("batchnorm gamma", &[d], gamma.shape())?;
    check_shape("batchnorm beta", &[d], beta.shape())?;

    let running_mean = bn_param
        .running_mean
        .clone()
        .unwrap_or_else(|| Array1::zeros(d));
    let running_var = bn_param
        .running_var
        .clone()
        .unwrap_or_else(|| Array1::zeros(d));
    check_shape("batchnorm running mean", &[d], running_mean.shape())?;
    check_shape("batchnorm running variance", &[d], running_var.shape())?;

    let (mean, var) = match bn_param.mode {
        Mode::Train => {
            if n == 0 {
                return Err(NNError::EmptyBatch);
            }
            let mean = x.mean_axis(Axis(0)).ok_or(NNError::EmptyBatch)?;
            let var = x.var_axis(Axis(0), 0.0);
            let m = bn_param.momentum;
            bn_param.running_mean = Some(&running_mean * m + &mean * (1.0 - m));
            bn_param.running_var = Some(&running_var * m + &var * (1.0 - m));
            (mean, var)
        }
        Mode::Test => (running_mean, running_var),
    };

    let inv_std = var.mapv(|v| 1.0 / (v + bn_param.eps).sqrt());
    let x_centered = &x - &mean;
    let x_hat = &x_centered * &inv_std;
    let out = &x_hat * &gamma + &beta;

    let cache = BatchNormCache {
        mode: bn_param.mode,
        x_centered,
        inv_std,
        x_hat,
        gamma: gamma.to_owned(),
    };
    Ok((out, cache))
}

fn batchnorm_param_grads(
    dout: &ArrayView2<f64>,
    cache: &BatchNormCache,
) -> Result<(Array1<f64>, Array1<f64>), NNError> {
    check_shape("batchnorm upstream gradient", cache.x_hat.shape(), dout.shape())?;
    let dgamma = (dout * &cache.x_hat).sum_axis(Axis(0));
    let dbeta = dout.sum_axis(Axis(0));
    Ok((dgamma, dbeta))
}

/// Backward pass of batch normalization, walking the computation graph
/// `x -> x - mean -> (x - mean) / sqrt(var + eps) -> gamma * x_hat + beta` node by node.
///
/// Returns `(dx, dgamma, dbeta)`.
pub fn batchnorm_backward(
    dout: ArrayView2<f64>,
    cache: &BatchNormCache,
) -> Result<(Array2<f64>, Array1<f64>, Array1<f64>), NNError> {
    let (dgamma, dbeta) = batchnorm_param_grads(&dout, cache)?;
    let dx_hat = &dout * &cache.gamma;

    if cache.mode == Mode::Test {
        // statistics are constants at test time
        return Ok((dx_hat * &cache.inv_std, dgamma, dbeta));
    }

    let n = dout.nrows() as f64;
    let xmu = &cache.x_centered;
    let ivar = &cache.inv_std;

    // x_hat = xmu * ivar
    let divar = (&dx_hat * xmu).sum_axis(Axis(0));
    let dxmu1 = &dx_hat * ivar;
    // ivar = 1 / sqrtvar
    let sqrtvar = ivar.mapv(|v| 1.0 / v);
    let dsqrtvar = -&divar / &sqrtvar.mapv(|v| v * v);
    // sqrtvar = sqrt(var + eps)
    let dvar = &dsqrtvar * 0.5 * ivar;
    // var = mean(xmu^2)
    let dsq = &dvar / n;
    let dxmu2 = xmu * &dsq * 2.0;
    // xmu = x - mu
    let dx1 = dxmu1 + dxmu2;
    let dmu = -dx1.sum_axis(Axis(0));
    // mu = mean(x)
    let dx = dx1 + &(dmu / n);

    Ok((dx, dgamma, dbeta))
}

/// Backward pass of batch normalization using the simplified closed form
/// `dx = gamma / (N * std) * (N * dout - sum(dout) - x_hat * sum(dout * x_hat))`.
///
/// Expects the same cache as [`batchnorm_backward`] and gives the same results.
pub fn batchnorm_backward_alt(
    dout: ArrayView2<f64>,
    cache: &BatchNormCache,
) -> Result<(Array2<f64>, Array1<f64>, Array1<f64>), NNError> {
    let (dgamma, dbeta) = batchnorm_param_grads(&dout, cache)?;
    if cache.mode == Mode::Test {
        return Ok((&dout * &cache.gamma * &cache.inv_std, dgamma, dbeta));
    }
    let n = dout.nrows() as f64;
    let scale = &cache.gamma * &cache.inv_std / n;
    let dx = (&dout * n - &dbeta - &cache.x_hat * &dgamma) * &scale;
    Ok((dx, dgamma, dbeta))
}

/// Configuration of an (inverted) dropout layer
#[derive(Debug, Clone, Copy)]
pub struct DropoutParam {
    /// probability of dropping each unit
    pub p: f64,
    pub mode: Mode,
    /// makes the mask deterministic, used for gradient checking
    pub seed: Option<u64>,
}

impl DropoutParam {
    pub fn new(p: f64, mode: Mode) -> Self {
        Self { p, mode, seed: None }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Mask from [`dropout_forward`], `None` in test mode
#[derive(Debug, Clone)]
pub struct DropoutCache<D: Dimension> {
    param: DropoutParam,
    mask: Option<Array<f64, D>>,
}

impl<D: Dimension> DropoutCache<D> {
    pub fn mask(&self) -> Option<&Array<f64, D>> {
        self.mask.as_ref()
    }
}

fn dropout_mask<D: Dimension, R: Rng>(shape: D, p: f64, rng: &mut R) -> Array<f64, D> {
    let keep = 1.0 / (1.0 - p);
    Array::from_shape_simple_fn(shape, || {
        if rng.random::<f64>() > p { keep } else { 0.0 }
    })
}

/// Inverted dropout: in training mode every unit is zeroed with probability `p` and the
/// survivors are scaled by `1 / (1 - p)`, so test mode is the identity
pub fn dropout_forward<D: Dimension>(
    x: ArrayView<f64, D>,
    param: DropoutParam,
) -> Result<(Array<f64, D>, DropoutCache<D>), NNError> {
    if !(0.0..1.0).contains(&param.p) {
        return Err(NNError::InvalidParameter {
            name: "dropout p",
            reason: format!("must be in [0, 1), got {}", param.p),
        });
    }
    match param.mode {
        Mode::Train => {
            let mask = match param.seed {
                Some(seed) => dropout_mask(x.raw_dim(), param.p, &mut Pcg64Mcg::seed_from_u64(seed)),
                None => dropout_mask(x.raw_dim(), param.p, &mut rand::rng()),
            };
            let kept = mask.iter().filter(|&&m| m > 0.0).count();
            log::debug!("dropout: kept {} of {} units", kept, mask.len());
            let out = &x * &mask;
            Ok((
                out,
                DropoutCache {
                    param,
                    mask: Some(mask),
                },
            ))
        }
        Mode::Test => Ok((x.to_owned(), DropoutCache { param, mask: None })),
    }
}

/// Backward pass of inverted dropout
pub fn dropout_backward<D: Dimension>(
    dout: ArrayView<f64, D>,
    cache: &DropoutCache<D>,
) -> Result<Array<f64, D>, NNError> {
    match (cache.param.mode, &cache.mask) {
        (Mode::Train, Some(mask)) => {
            check_shape("dropout upstream gradient", mask.shape(), dout.shape())?;
            Ok(&dout * mask)
        }
        _ => Ok(dout.to_owned()),
    }
}

/// Cache of an affine layer followed by a ReLU
pub type AffineReluCache<D> = (AffineCache<D>, ReluCache<ndarray::Ix2>);

/// Affine transform followed by a ReLU
pub fn affine_relu_forward<D: Dimension>(
    x: ArrayView<f64, D>,
    w: ArrayView2<f64>,
    b: ArrayView1<f64>,
) -> Result<(Array2<f64>, AffineReluCache<D>), NNError> {
    let (a, fc_cache) = affine_forward(x, w, b)?;
    let (out, relu_cache) = relu_forward(a.view());
    Ok((out, (fc_cache, relu_cache)))
}

/// Backward pass for [`affine_relu_forward`]
pub fn affine_relu_backward<D: Dimension>(
    dout: ArrayView2<f64>,
    cache: &AffineReluCache<D>,
) -> Result<(Array<f64, D>, Array2<f64>, Array1<f64>), NNError> {
    let (fc_cache, relu_cache) = cache;
    let da = relu_backward(dout, relu_cache)?;
    affine_backward(da.view(), fc_cache)
}
