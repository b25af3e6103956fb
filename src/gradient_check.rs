//! Finite difference utilities to verify analytic gradients

use ndarray::{Array, ArrayBase, Data, Dimension, IntoDimension};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Samples an array of standard normal values
pub fn randn<Sh: IntoDimension, R: Rng>(shape: Sh, rng: &mut R) -> Array<f64, Sh::Dim> {
    Array::from_shape_simple_fn(shape.into_dimension(), || StandardNormal.sample(&mut *rng))
}

/// Returns a copy of `x` with the `i`-th element (in logical order) shifted by `delta`
fn perturbed<D: Dimension>(x: &Array<f64, D>, i: usize, delta: f64) -> Array<f64, D> {
    let mut y = x.clone();
    if let Some(v) = y.iter_mut().nth(i) {
        *v += delta;
    }
    y
}

/// Numerical gradient of a scalar valued function `f` at `x` using centered differences
pub fn eval_numerical_gradient<D, F>(mut f: F, x: &Array<f64, D>, h: f64) -> Array<f64, D>
where
    D: Dimension,
    F: FnMut(&Array<f64, D>) -> f64,
{
    let mut grad = Array::zeros(x.raw_dim());
    for (i, g) in grad.iter_mut().enumerate() {
        let fxph = f(&perturbed(x, i, h));
        let fxmh = f(&perturbed(x, i, -h));
        *g = (fxph - fxmh) / (2.0 * h);
        log::trace!("numerical gradient at {}: {}", i, *g);
    }
    grad
}

/// Numerical gradient of an array valued function `f` at `x`, contracted with the
/// upstream derivative `df` (i.e. the gradient of `sum(f(x) * df)`)
pub fn eval_numerical_gradient_array<D, E, F>(
    mut f: F,
    x: &Array<f64, D>,
    df: &Array<f64, E>,
    h: f64,
) -> Array<f64, D>
where
    D: Dimension,
    E: Dimension,
    F: FnMut(&Array<f64, D>) -> Array<f64, E>,
{
    let mut grad = Array::zeros(x.raw_dim());
    for (i, g) in grad.iter_mut().enumerate() {
        let pos = f(&perturbed(x, i, h));
        let neg = f(&perturbed(x, i, -h));
        *g = ((pos - neg) * df).sum() / (2.0 * h);
    }
    grad
}

/// Compares the analytic gradient against the numerical one on `num_checks` randomly
/// sampled entries, returning the relative error of each sample
pub fn grad_check_sparse<D, F, R>(
    mut f: F,
    x: &Array<f64, D>,
    analytic_grad: &Array<f64, D>,
    num_checks: usize,
    h: f64,
    rng: &mut R,
) -> Vec<f64>
where
    D: Dimension,
    F: FnMut(&Array<f64, D>) -> f64,
    R: Rng,
{
    if x.is_empty() {
        return vec![];
    }
    (0..num_checks)
        .map(|_| {
            let i = rng.random_range(0..x.len());
            let numerical = (f(&perturbed(x, i, h)) - f(&perturbed(x, i, -h))) / (2.0 * h);
            let analytic = analytic_grad.iter().nth(i).copied().unwrap_or(0.0);
            let err = rel_error_scalar(numerical, analytic);
            log::debug!(
                "entry {}: numerical {}, analytic {}, relative error {:e}",
                i,
                numerical,
                analytic,
                err
            );
            err
        })
        .collect()
}

/// Maximum element-wise relative error between two arrays
pub fn rel_error<S1, S2, D>(x: &ArrayBase<S1, D>, y: &ArrayBase<S2, D>) -> f64
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    x.iter()
        .zip(y.iter())
        .map(|(&a, &b)| rel_error_scalar(a, b))
        .fold(0.0, f64::max)
}

/// Relative error between two numbers, guarded against division by zero
pub fn rel_error_scalar(a: f64, b: f64) -> f64 {
    (a - b).abs() / (a.abs() + b.abs()).max(1e-8)
}
