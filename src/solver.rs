//! Minibatch training loop shared by all models

use crate::{
    dataloader::{Batch, DataLoader},
    nn::{Classifier, Model, NNError, check_shape},
    optim::Optim,
};

/// Settings for [`Solver`]
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    pub epochs: usize,
    /// Multiplies the learning rate after every epoch
    pub lr_decay: f64,
    /// Log the running loss every this many iterations
    pub print_every: usize,
    /// Seeds the shuffle of each epoch when set
    pub seed: Option<u64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            lr_decay: 1.0,
            print_every: 10,
            seed: None,
        }
    }
}

/// Trains a [`Model`] with an [`Optim`] over the batches of a [`DataLoader`]
pub struct Solver<M, O> {
    model: M,
    optim: O,
    config: SolverConfig,
    epoch: usize,
    loss_history: Vec<f64>,
}

impl<M, O> Solver<M, O>
where
    M: Model,
    M::Input: Batch,
    M::Target: Batch,
    O: Optim,
{
    pub fn new(model: M, optim: O, config: SolverConfig) -> Self {
        Self {
            model,
            optim,
            config,
            epoch: 0,
            loss_history: vec![],
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn optim(&self) -> &O {
        &self.optim
    }

    /// Loss of every iteration so far
    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    /// Number of completed epochs
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// One pass over the data, then learning rate decay.
    /// Returns the average loss of the epoch.
    pub fn train_epoch(
        &mut self,
        loader: &DataLoader<M::Input, M::Target>,
    ) -> Result<f64, NNError> {
        let batches = match self.config.seed {
            Some(seed) => loader.seeded_iter(seed.wrapping_add(self.epoch as u64)),
            None => loader.iter(),
        };

        let mut epoch_loss = 0.0;
        let mut n_batches = 0;
        for (x, y) in batches {
            let (loss, grads) = self.model.loss(&x, &y)?;
            self.optim.step(self.model.params_mut(), &grads)?;
            self.loss_history.push(loss);
            epoch_loss += loss;
            n_batches += 1;

            let iteration = self.loss_history.len();
            if self.config.print_every > 0 && iteration % self.config.print_every == 0 {
                log::debug!("iteration: {}, loss: {}", iteration, loss);
            }
        }
        if n_batches == 0 {
            return Err(NNError::EmptyBatch);
        }

        self.epoch += 1;
        self.optim.set_lr(self.optim.lr() * self.config.lr_decay);
        let avg_loss = epoch_loss / n_batches as f64;
        log::info!(
            "epoch: {}, average loss: {}, lr: {:e}",
            self.epoch,
            avg_loss,
            self.optim.lr()
        );
        Ok(avg_loss)
    }

    /// Runs [`Solver::train_epoch`] for the configured number of epochs
    pub fn train(&mut self, loader: &DataLoader<M::Input, M::Target>) -> Result<(), NNError> {
        for _ in 0..self.config.epochs {
            self.train_epoch(loader)?;
        }
        Ok(())
    }
}

impl<M, O> Solver<M, O>
where
    M: Classifier,
    M::Input: Batch,
    M::Target: Batch,
    O: Optim,
{
    /// Fraction of examples whose highest scoring class is the label, evaluated in
    /// chunks of `batch_size`
    pub fn check_accuracy(
        &self,
        x: &M::Input,
        y: &[usize],
        batch_size: usize,
    ) -> Result<f64, NNError> {
        let n = x.len();
        if n == 0 {
            return Err(NNError::EmptyBatch);
        }
        check_shape("accuracy labels", &[n], &[y.len()])?;

        let indices = (0..n).collect::<Vec<_>>();
        let mut correct = 0;
        for chunk in indices.chunks(batch_size.max(1)) {
            let preds = self.model.predict(&x.select(chunk))?;
            correct += preds
                .iter()
                .zip(chunk)
                .filter(|&(&pred, &i)| pred == y[i])
                .count();
        }
        Ok(correct as f64 / n as f64)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Ix1, Ix2};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{
        assert_eq_float,
        layers::{affine_backward, affine_forward},
        loss::softmax_loss,
        nn::{Params, param_view},
        optim::SGD,
    };

    /// Linear classifier with a softmax loss
    struct SoftmaxRegression {
        params: Params,
    }

    impl SoftmaxRegression {
        fn new(dim: usize, classes: usize) -> Self {
            let mut params = Params::new();
            params.insert("W".to_string(), Array2::zeros((dim, classes)).into_dyn());
            params.insert("b".to_string(), ndarray::Array1::zeros(classes).into_dyn());
            Self { params }
        }
    }

    impl Model for SoftmaxRegression {
        type Input = Array2<f64>;
        type Target = Vec<usize>;

        fn params(&self) -> &Params {
            &self.params
        }

        fn params_mut(&mut self) -> &mut Params {
            &mut self.params
        }

        fn loss(&self, x: &Array2<f64>, y: &Vec<usize>) -> Result<(f64, Params), NNError> {
            let w = param_view::<Ix2>(&self.params, "W")?;
            let b = param_view::<Ix1>(&self.params, "b")?;
            let (scores, cache) = affine_forward(x.view(), w, b)?;
            let (loss, dscores) = softmax_loss(scores.view(), y)?;
            let (_, dw, db) = affine_backward(dscores.view(), &cache)?;
            let mut grads = Params::new();
            grads.insert("W".to_string(), dw.into_dyn());
            grads.insert("b".to_string(), db.into_dyn());
            Ok((loss, grads))
        }
    }

    impl Classifier for SoftmaxRegression {
        fn scores(&self, x: &Array2<f64>) -> Result<Array2<f64>, NNError> {
            let w = param_view::<Ix2>(&self.params, "W")?;
            let b = param_view::<Ix1>(&self.params, "b")?;
            Ok(affine_forward(x.view(), w, b)?.0)
        }
    }

    /// Two well separated clusters in the plane
    fn blobs(n: usize, rng: &mut Pcg64Mcg) -> (Array2<f64>, Vec<usize>) {
        let y: Vec<usize> = (0..n).map(|i| i % 2).collect();
        let x = Array2::from_shape_fn((n, 2), |(i, _)| {
            let center = if y[i] == 0 { -2.0 } else { 2.0 };
            center + rng.random_range(-1.0..1.0)
        });
        (x, y)
    }

    #[test]
    fn test_solver_learns_blobs() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let (x, y) = blobs(100, &mut rng);
        let loader = DataLoader::new(x.clone(), y.clone(), 16, true).unwrap();
        let config = SolverConfig {
            epochs: 20,
            lr_decay: 0.95,
            seed: Some(1),
            ..SolverConfig::default()
        };
        let mut solver = Solver::new(SoftmaxRegression::new(2, 2), SGD::new(0.1, 0.9), config);

        assert_eq_float!(solver.check_accuracy(&x, &y, 30).unwrap(), 0.5);
        solver.train(&loader).unwrap();

        assert_eq!(solver.epoch(), 20);
        assert_eq!(solver.loss_history().len(), 20 * loader.num_batches());
        let first = solver.loss_history()[0];
        let last = *solver.loss_history().last().unwrap();
        assert_eq_float!(first, 2f64.ln());
        assert!(last < first / 4.0);
        assert_eq_float!(solver.optim().lr(), 0.1 * 0.95f64.powi(20), 1e-12);
        assert_eq_float!(solver.check_accuracy(&x, &y, 30).unwrap(), 1.0);
    }

    #[test]
    fn test_seeded_training_is_reproducible() {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let (x, y) = blobs(40, &mut rng);
        let loader = DataLoader::new(x, y, 8, true).unwrap();
        let config = SolverConfig {
            epochs: 3,
            seed: Some(11),
            ..SolverConfig::default()
        };
        let run = || {
            let mut solver =
                Solver::new(SoftmaxRegression::new(2, 2), SGD::new(0.05, 0.9), config.clone());
            solver.train(&loader).unwrap();
            solver.loss_history().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_check_accuracy_errors() {
        let solver = Solver::new(
            SoftmaxRegression::new(2, 2),
            SGD::new(0.1, 0.0),
            SolverConfig::default(),
        );
        let x = Array2::zeros((3, 2));
        assert!(matches!(
            solver.check_accuracy(&x, &[0, 1], 2),
            Err(NNError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            solver.check_accuracy(&Array2::zeros((0, 2)), &[], 2),
            Err(NNError::EmptyBatch)
        ));
    }
}
