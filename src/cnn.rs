//! Convolutional classifier assembled from the layer primitives

use ndarray::{Array2, Array4, ArrayD, Ix1, Ix2, Ix4};
use rand::Rng;

use crate::{
    conv::{
        ConvParam, ConvReluPoolCache, PoolParam, conv_relu_pool_backward, conv_relu_pool_forward,
    },
    layers::{
        AffineCache, AffineReluCache, affine_backward, affine_forward, affine_relu_backward,
        affine_relu_forward,
    },
    loss::softmax_loss,
    nn::{Classifier, Model, NNError, Params, check_shape, init_normal, param_view},
};

/// Hyperparameters of a [`ThreeLayerConvNet`]
#[derive(Debug, Clone, PartialEq)]
pub struct ThreeLayerConvNetConfig {
    /// (C, H, W) of a single input image
    pub input_dim: (usize, usize, usize),
    pub num_filters: usize,
    /// Height and width of the square filters
    pub filter_size: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    /// Standard deviation of the initial weights
    pub weight_scale: f64,
    /// L2 regularization strength
    pub reg: f64,
}

impl Default for ThreeLayerConvNetConfig {
    fn default() -> Self {
        Self {
            input_dim: (3, 32, 32),
            num_filters: 32,
            filter_size: 7,
            hidden_dim: 100,
            num_classes: 10,
            weight_scale: 1e-3,
            reg: 0.0,
        }
    }
}

type ConvNetCache = (ConvReluPoolCache, AffineReluCache<Ix4>, AffineCache<Ix2>);

/// conv - relu - 2x2 max pool - affine - relu - affine - softmax
///
/// Operates on minibatches of shape (N, C, H, W). The convolution keeps the spatial
/// size for odd filter sizes.
#[derive(Debug, Clone)]
pub struct ThreeLayerConvNet {
    config: ThreeLayerConvNetConfig,
    params: Params,
}

impl ThreeLayerConvNet {
    /// Creates a network with Gaussian weights and zero biases
    pub fn new<R: Rng>(config: ThreeLayerConvNetConfig, rng: &mut R) -> Result<Self, NNError> {
        let (c, h, w) = config.input_dim;
        let fs = config.filter_size;
        let pad = fs.saturating_sub(1) / 2;
        if fs == 0 || fs > h + 2 * pad || fs > w + 2 * pad {
            return Err(NNError::InvalidParameter {
                name: "filter size",
                reason: format!("{} does not fit an input of {}x{}", fs, h, w),
            });
        }
        // conv with stride 1, then 2x2 pooling with stride 2
        let pooled = |len: usize| (len + 2 * pad - fs + 1) / 2;
        let (h_pool, w_pool) = (pooled(h), pooled(w));
        if h_pool == 0 || w_pool == 0 {
            return Err(NNError::InvalidParameter {
                name: "input dim",
                reason: format!("{}x{} is too small to pool", h, w),
            });
        }

        let scale = config.weight_scale;
        let (f, hidden, classes) = (config.num_filters, config.hidden_dim, config.num_classes);
        let mut params = Params::new();
        params.insert("W1".to_string(), init_normal((f, c, fs, fs), scale, rng)?);
        params.insert("b1".to_string(), ArrayD::zeros(vec![f]));
        params.insert(
            "W2".to_string(),
            init_normal((f * h_pool * w_pool, hidden), scale, rng)?,
        );
        params.insert("b2".to_string(), ArrayD::zeros(vec![hidden]));
        params.insert("W3".to_string(), init_normal((hidden, classes), scale, rng)?);
        params.insert("b3".to_string(), ArrayD::zeros(vec![classes]));
        log::debug!(
            "three layer convnet with {} parameters",
            params.values().map(|p| p.len()).sum::<usize>()
        );

        Ok(Self { config, params })
    }

    pub fn config(&self) -> &ThreeLayerConvNetConfig {
        &self.config
    }

    fn conv_param(&self) -> ConvParam {
        ConvParam::new(1, (self.config.filter_size - 1) / 2)
    }

    fn forward(&self, x: &Array4<f64>) -> Result<(Array2<f64>, ConvNetCache), NNError> {
        let (c, h, w) = self.config.input_dim;
        check_shape("convnet input", &[x.shape()[0], c, h, w], x.shape())?;

        let w1 = param_view::<Ix4>(&self.params, "W1")?;
        let b1 = param_view::<Ix1>(&self.params, "b1")?;
        let w2 = param_view::<Ix2>(&self.params, "W2")?;
        let b2 = param_view::<Ix1>(&self.params, "b2")?;
        let w3 = param_view::<Ix2>(&self.params, "W3")?;
        let b3 = param_view::<Ix1>(&self.params, "b3")?;

        let (pooled, conv_cache) =
            conv_relu_pool_forward(x.view(), w1, b1, self.conv_param(), PoolParam::default())?;
        let (hidden, hidden_cache) = affine_relu_forward(pooled.view(), w2, b2)?;
        let (scores, scores_cache) = affine_forward(hidden.view(), w3, b3)?;
        Ok((scores, (conv_cache, hidden_cache, scores_cache)))
    }
}

impl Model for ThreeLayerConvNet {
    type Input = Array4<f64>;
    type Target = Vec<usize>;

    fn params(&self) -> &Params {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    fn loss(&self, x: &Array4<f64>, y: &Vec<usize>) -> Result<(f64, Params), NNError> {
        let (scores, (conv_cache, hidden_cache, scores_cache)) = self.forward(x)?;
        let (mut loss, dscores) = softmax_loss(scores.view(), y)?;

        let (dhidden, dw3, db3) = affine_backward(dscores.view(), &scores_cache)?;
        let (dpooled, dw2, db2) = affine_relu_backward(dhidden.view(), &hidden_cache)?;
        let (_, dw1, db1) = conv_relu_pool_backward(dpooled.view(), &conv_cache)?;

        let mut grads = Params::new();
        grads.insert("W1".to_string(), dw1.into_dyn());
        grads.insert("b1".to_string(), db1.into_dyn());
        grads.insert("W2".to_string(), dw2.into_dyn());
        grads.insert("b2".to_string(), db2.into_dyn());
        grads.insert("W3".to_string(), dw3.into_dyn());
        grads.insert("b3".to_string(), db3.into_dyn());

        let reg = self.config.reg;
        if reg > 0.0 {
            for name in ["W1", "W2", "W3"] {
                let w = self
                    .params
                    .get(name)
                    .ok_or_else(|| NNError::MissingParam(name.to_string()))?;
                loss += 0.5 * reg * w.mapv(|v| v * v).sum();
                if let Some(dw) = grads.get_mut(name) {
                    dw.scaled_add(reg, w);
                }
            }
        }
        Ok((loss, grads))
    }
}

impl Classifier for ThreeLayerConvNet {
    fn scores(&self, x: &Array4<f64>) -> Result<Array2<f64>, NNError> {
        Ok(self.forward(x)?.0)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{
        assert_close, assert_eq_float,
        gradient_check::{eval_numerical_gradient, randn},
    };

    fn small_config() -> ThreeLayerConvNetConfig {
        ThreeLayerConvNetConfig {
            input_dim: (3, 8, 8),
            num_filters: 3,
            filter_size: 3,
            hidden_dim: 7,
            num_classes: 10,
            weight_scale: 0.1,
            reg: 0.0,
        }
    }

    #[test]
    fn test_param_shapes() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let model = ThreeLayerConvNet::new(ThreeLayerConvNetConfig::default(), &mut rng).unwrap();
        let shape = |name: &str| model.params()[name].shape().to_vec();
        assert_eq!(shape("W1"), vec![32, 3, 7, 7]);
        assert_eq!(shape("b1"), vec![32]);
        assert_eq!(shape("W2"), vec![32 * 16 * 16, 100]);
        assert_eq!(shape("W3"), vec![100, 10]);
        assert!(model.params()["b3"].iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_invalid_config() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let config = ThreeLayerConvNetConfig {
            weight_scale: -1.0,
            ..small_config()
        };
        assert!(matches!(
            ThreeLayerConvNet::new(config, &mut rng),
            Err(NNError::InvalidParameter { .. })
        ));
        let config = ThreeLayerConvNetConfig {
            input_dim: (3, 1, 1),
            filter_size: 1,
            ..small_config()
        };
        assert!(ThreeLayerConvNet::new(config, &mut rng).is_err());
    }

    #[test]
    fn test_initial_loss() {
        let mut rng = Pcg64Mcg::seed_from_u64(231);
        let config = ThreeLayerConvNetConfig {
            weight_scale: 1e-3,
            ..small_config()
        };
        let x = randn((4, 3, 8, 8), &mut rng);
        let y = vec![0, 3, 5, 9];

        // tiny weights give uniform scores
        let model = ThreeLayerConvNet::new(config.clone(), &mut rng).unwrap();
        let (loss, _) = model.loss(&x, &y).unwrap();
        assert_eq_float!(loss, 10f64.ln(), 1e-3);

        let model = ThreeLayerConvNet::new(ThreeLayerConvNetConfig { reg: 0.5, ..config }, &mut rng)
            .unwrap();
        let (reg_loss, _) = model.loss(&x, &y).unwrap();
        assert!(reg_loss > loss);
    }

    #[test]
    fn test_gradients() {
        let mut rng = Pcg64Mcg::seed_from_u64(231);
        for reg in [0.0, 0.3] {
            let config = ThreeLayerConvNetConfig {
                reg,
                ..small_config()
            };
            let model = ThreeLayerConvNet::new(config, &mut rng).unwrap();
            let x = randn((2, 3, 8, 8), &mut rng);
            let y = vec![1, 7];

            let (_, grads) = model.loss(&x, &y).unwrap();
            assert_eq!(grads.len(), model.params().len());
            for (name, param) in model.params() {
                let num = eval_numerical_gradient(
                    |p| {
                        let mut m = model.clone();
                        m.params_mut().insert(name.clone(), p.clone());
                        m.loss(&x, &y).unwrap().0
                    },
                    param,
                    1e-5,
                );
                assert_close!(grads[name], num, 1e-2);
            }
        }
    }

    #[test]
    fn test_predict() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let model = ThreeLayerConvNet::new(small_config(), &mut rng).unwrap();
        let x = randn((5, 3, 8, 8), &mut rng);
        let scores = model.scores(&x).unwrap();
        assert_eq!(scores.dim(), (5, 10));
        let preds = model.predict(&x).unwrap();
        assert_eq!(preds.len(), 5);
        assert!(preds.iter().all(|&p| p < 10));

        let wrong = randn((5, 1, 8, 8), &mut rng);
        assert!(matches!(
            model.scores(&wrong),
            Err(NNError::ShapeMismatch { .. })
        ));
    }
}
