//! Optimizer(s)

use std::collections::BTreeMap;

use ndarray::{ArrayD, Zip};

use crate::nn::{NNError, Params, check_shape};

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step, updating every parameter with its gradient
    fn step(&mut self, params: &mut Params, grads: &Params) -> Result<(), NNError>;
    fn lr(&self) -> f64;
    /// Overrides the learning rate, e.g. for decay between epochs
    fn set_lr(&mut self, lr: f64);
}

fn grad_for<'a>(
    grads: &'a Params,
    name: &str,
    param: &ArrayD<f64>,
) -> Result<&'a ArrayD<f64>, NNError> {
    let grad = grads
        .get(name)
        .ok_or_else(|| NNError::MissingParam(name.to_string()))?;
    check_shape("gradient", param.shape(), grad.shape())?;
    Ok(grad)
}

/// Checks every gradient up front so a failed step leaves the parameters untouched
fn check_grads(params: &Params, grads: &Params) -> Result<(), NNError> {
    for (name, param) in params {
        grad_for(grads, name, param)?;
    }
    Ok(())
}

/// Per-parameter state, created lazily with the shape of the parameter
fn state_for<'a>(
    state: &'a mut BTreeMap<String, ArrayD<f64>>,
    name: &str,
    param: &ArrayD<f64>,
) -> &'a mut ArrayD<f64> {
    state
        .entry(name.to_string())
        .or_insert_with(|| ArrayD::zeros(param.raw_dim()))
}

/// SGD with momentum
pub struct SGD {
    lr: f64,
    momentum: f64,
    // velocity per parameter
    velocity: BTreeMap<String, ArrayD<f64>>,
}

impl SGD {
    pub fn new(lr: f64, momentum: f64) -> Self {
        Self {
            lr,
            momentum,
            velocity: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    fn velocity(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.velocity.get(name)
    }
}

impl Optim for SGD {
    fn step(&mut self, params: &mut Params, grads: &Params) -> Result<(), NNError> {
        check_grads(params, grads)?;
        let (lr, momentum) = (self.lr, self.momentum);
        for (name, param) in params.iter_mut() {
            let grad = grad_for(grads, name, param)?;
            // v = momentum * v - lr * grad, w += v
            let velocity = state_for(&mut self.velocity, name, param);
            velocity.mapv_inplace(|v| momentum * v);
            velocity.scaled_add(-lr, grad);
            *param += &*velocity;
        }
        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Adam: momentum on the gradient and a per-element step size from running averages
/// of the squared gradient, both bias corrected
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: i32,
    m: BTreeMap<String, ArrayD<f64>>,
    v: BTreeMap<String, ArrayD<f64>>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self::with_betas(lr, 0.9, 0.999)
    }

    pub fn with_betas(lr: f64, beta1: f64, beta2: f64) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps: 1e-8,
            t: 0,
            m: BTreeMap::new(),
            v: BTreeMap::new(),
        }
    }
}

impl Optim for Adam {
    fn step(&mut self, params: &mut Params, grads: &Params) -> Result<(), NNError> {
        check_grads(params, grads)?;
        self.t += 1;
        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);
        let m_correction = 1.0 - beta1.powi(self.t);
        let v_correction = 1.0 - beta2.powi(self.t);

        for (name, param) in params.iter_mut() {
            let grad = grad_for(grads, name, param)?;
            let m = state_for(&mut self.m, name, param);
            m.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
            let v = state_for(&mut self.v, name, param);
            v.zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

            let (m, v) = (&self.m[name.as_str()], &self.v[name.as_str()]);
            Zip::from(param).and(m).and(v).for_each(|w, &m, &v| {
                *w -= lr * (m / m_correction) / ((v / v_correction).sqrt() + eps);
            });
        }
        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr0, array};

    use super::*;
    use crate::{assert_close, assert_eq_float};

    /// Parameters a = 1, b = 2, c = 3 whose gradients are all 1
    fn scalar_params() -> (Params, Params) {
        let mut params = Params::new();
        let mut grads = Params::new();
        for (name, value) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            params.insert(name.to_string(), arr0(value).into_dyn());
            grads.insert(name.to_string(), arr0(1.0).into_dyn());
        }
        (params, grads)
    }

    fn value(params: &Params, name: &str) -> f64 {
        params[name].iter().copied().next().unwrap()
    }

    #[test]
    fn test_sgd_no_momentum() {
        let (mut params, grads) = scalar_params();
        let mut optim = SGD::new(0.1, 0.0);
        optim.step(&mut params, &grads).unwrap();
        assert_eq_float!(value(&params, "a"), 0.9);
        assert_eq_float!(value(&params, "b"), 1.9);
        assert_eq_float!(value(&params, "c"), 2.9);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let (mut params, grads) = scalar_params();
        let mut optim = SGD::new(0.1, 0.9);
        optim.step(&mut params, &grads).unwrap();
        assert_eq_float!(value(&params, "a"), 0.9);
        assert_eq_float!(value(&params, "b"), 1.9);
        assert_eq_float!(value(&params, "c"), 2.9);
        for name in ["a", "b", "c"] {
            assert_eq_float!(optim.velocity(name).unwrap().sum(), -0.1);
        }
        optim.step(&mut params, &grads).unwrap();
        assert_eq_float!(value(&params, "a"), 0.71);
        assert_eq_float!(value(&params, "b"), 1.71);
        assert_eq_float!(value(&params, "c"), 2.71);
        for name in ["a", "b", "c"] {
            assert_eq_float!(optim.velocity(name).unwrap().sum(), -0.19);
        }
    }

    #[test]
    fn test_sgd_errors() {
        let (mut params, mut grads) = scalar_params();
        grads.remove("b");
        let mut optim = SGD::new(0.1, 0.9);
        assert!(matches!(
            optim.step(&mut params, &grads),
            Err(NNError::MissingParam(name)) if name == "b"
        ));

        grads.insert("b".to_string(), array![1.0, 2.0].into_dyn());
        assert!(matches!(
            optim.step(&mut params, &grads),
            Err(NNError::ShapeMismatch { .. })
        ));
        assert_eq_float!(value(&params, "a"), 1.0);
    }

    #[test]
    fn test_adam() {
        let mut params = Params::new();
        params.insert("w".to_string(), array![1.0, -2.0, 0.5].into_dyn());
        let mut grads = Params::new();
        grads.insert("w".to_string(), array![0.5, -3.0, 1e-3].into_dyn());

        // bias correction makes every early step move each weight by ~lr against its gradient
        let mut optim = Adam::new(0.01);
        optim.step(&mut params, &grads).unwrap();
        assert_close!(params["w"], array![0.99, -1.99, 0.49].into_dyn(), 1e-6);
        optim.step(&mut params, &grads).unwrap();
        assert_close!(params["w"], array![0.98, -1.98, 0.48].into_dyn(), 1e-6);
    }

    #[test]
    fn test_set_lr() {
        let mut optim = SGD::new(0.1, 0.9);
        optim.set_lr(optim.lr() * 0.5);
        assert_eq_float!(optim.lr(), 0.05);
        let mut adam = Adam::new(1e-3);
        adam.set_lr(1e-4);
        assert_eq_float!(adam.lr(), 1e-4);
    }
}
