//! Classification losses over class scores of shape (N, C)

use ndarray::{Array2, ArrayView2, Axis};

use crate::nn::{NNError, check_shape};

fn check_labels(x: &ArrayView2<f64>, y: &[usize]) -> Result<(), NNError> {
    let (n, c) = x.dim();
    check_shape("labels", &[n], &[y.len()])?;
    if n == 0 {
        return Err(NNError::EmptyBatch);
    }
    if let Some(&label) = y.iter().find(|&&label| label >= c) {
        return Err(NNError::IndexOutOfRange {
            what: "class scores",
            index: label,
            size: c,
        });
    }
    Ok(())
}

/// Multiclass SVM (hinge) loss with a margin of 1, averaged over the batch.
///
/// `x[i, j]` is the score of class `j` for example `i` and `y[i]` is the correct class.
/// Returns the loss and its gradient with respect to `x`.
pub fn svm_loss(x: ArrayView2<f64>, y: &[usize]) -> Result<(f64, Array2<f64>), NNError> {
    check_labels(&x, y)?;
    let n = x.nrows() as f64;

    let mut dx = Array2::zeros(x.raw_dim());
    let mut loss = 0.0;
    for ((scores, mut grad), &label) in x
        .axis_iter(Axis(0))
        .zip(dx.axis_iter_mut(Axis(0)))
        .zip(y.iter())
    {
        let correct = scores[label];
        let mut n_positive = 0.0;
        for (j, &s) in scores.iter().enumerate() {
            if j == label {
                continue;
            }
            let margin = s - correct + 1.0;
            if margin > 0.0 {
                loss += margin;
                grad[j] = 1.0;
                n_positive += 1.0;
            }
        }
        grad[label] = -n_positive;
    }
    dx /= n;
    Ok((loss / n, dx))
}

/// Softmax cross entropy loss averaged over the batch. Scores are shifted by their row maximum
/// before exponentiating so large scores cannot overflow.
///
/// Returns the loss and its gradient with respect to `x`.
pub fn softmax_loss(x: ArrayView2<f64>, y: &[usize]) -> Result<(f64, Array2<f64>), NNError> {
    check_labels(&x, y)?;
    let n = x.nrows() as f64;

    let mut probs = x.to_owned();
    let mut loss = 0.0;
    for (mut row, &label) in probs.axis_iter_mut(Axis(0)).zip(y.iter()) {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| v - max);
        let log_z = row.mapv(f64::exp).sum().ln();
        loss -= row[label] - log_z;
        row.mapv_inplace(|v| (v - log_z).exp());
    }

    let mut dx = probs;
    for (mut row, &label) in dx.axis_iter_mut(Axis(0)).zip(y.iter()) {
        row[label] -= 1.0;
    }
    dx /= n;
    Ok((loss / n, dx))
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{
        assert_close, assert_eq_float,
        gradient_check::{eval_numerical_gradient, randn},
    };

    #[test]
    fn test_svm_loss() {
        let x = array![[1.0, 2.0, 3.0], [3.0, 1.0, 0.5]];
        let y = [0, 0];
        let (loss, dx) = svm_loss(x.view(), &y).unwrap();
        // first example: margins 2 and 3, second example: no violations
        assert_eq_float!(loss, 2.5);
        assert_close!(dx, array![[-1.0, 0.5, 0.5], [0.0, 0.0, 0.0]], 1e-12);
    }

    #[test]
    fn test_softmax_loss_uniform() {
        // equal scores give a loss of ln(C)
        let x = Array2::<f64>::zeros((4, 10));
        let (loss, _) = softmax_loss(x.view(), &[0, 3, 5, 9]).unwrap();
        assert_eq_float!(loss, 10f64.ln());
    }

    #[test]
    fn test_softmax_loss_large_scores() {
        let x = array![[1000.0, 0.0], [0.0, 1000.0]];
        let (loss, dx) = softmax_loss(x.view(), &[0, 1]).unwrap();
        assert!(loss.is_finite());
        assert_eq_float!(loss, 0.0);
        assert!(dx.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_losses_gradient() {
        let mut rng = Pcg64Mcg::seed_from_u64(231);
        let (num_classes, num_inputs) = (10, 50);
        let x = randn((num_inputs, num_classes), &mut rng) * 0.001;
        let y: Vec<usize> = (0..num_inputs)
            .map(|_| rng.random_range(0..num_classes))
            .collect();

        let dx_num =
            eval_numerical_gradient(|x| svm_loss(x.view(), &y).unwrap().0, &x, 1e-5);
        let (loss, dx) = svm_loss(x.view(), &y).unwrap();
        // with tiny scores every margin is ~1
        assert_eq_float!(loss, 9.0, 1e-2);
        assert_close!(dx, dx_num, 1e-6);

        let dx_num =
            eval_numerical_gradient(|x| softmax_loss(x.view(), &y).unwrap().0, &x, 1e-5);
        let (loss, dx) = softmax_loss(x.view(), &y).unwrap();
        assert_eq_float!(loss, 10f64.ln(), 1e-2);
        assert_close!(dx, dx_num, 1e-6);
    }

    #[test]
    fn test_invalid_labels() {
        let x = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            softmax_loss(x.view(), &[0, 3]),
            Err(NNError::IndexOutOfRange { index: 3, size: 3, .. })
        ));
        assert!(matches!(
            svm_loss(x.view(), &[0]),
            Err(NNError::ShapeMismatch { .. })
        ));
        let empty = Array2::<f64>::zeros((0, 3));
        assert!(matches!(softmax_loss(empty.view(), &[]), Err(NNError::EmptyBatch)));
    }
}
