//! Layer primitives for recurrent networks over minibatches of sequences.
//!
//! Sequences are laid out as (N, T, D): N sequences of T timesteps with D features each.
//! Hidden states have size H.

use ndarray::{
    Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s,
};

use crate::nn::{NNError, check_shape};

/// Gradients of a single recurrent step
#[derive(Debug, Clone)]
pub struct RnnStepGrads {
    pub dx: Array2<f64>,
    pub dprev_h: Array2<f64>,
    pub dwx: Array2<f64>,
    pub dwh: Array2<f64>,
    pub db: Array1<f64>,
}

/// Gradients of a recurrent layer unrolled over a whole sequence
#[derive(Debug, Clone)]
pub struct RnnGrads {
    /// (N, T, D)
    pub dx: Array3<f64>,
    /// (N, H)
    pub dh0: Array2<f64>,
    pub dwx: Array2<f64>,
    pub dwh: Array2<f64>,
    pub db: Array1<f64>,
}

/// Validates the shapes of a recurrent step where the weights project to `gates * H` units.
/// `(n, d)` is the batch size and input dimension of a single timestep.
fn check_recurrent_shapes(
    (n, d): (usize, usize),
    prev_h: &ArrayView2<f64>,
    wx: &ArrayView2<f64>,
    wh: &ArrayView2<f64>,
    b: &ArrayView1<f64>,
    gates: usize,
) -> Result<(), NNError> {
    let h = prev_h.ncols();
    check_shape("previous hidden state", &[n, h], prev_h.shape())?;
    check_shape("input-to-hidden weights", &[d, gates * h], wx.shape())?;
    check_shape("hidden-to-hidden weights", &[h, gates * h], wh.shape())?;
    check_shape("recurrent bias", &[gates * h], b.shape())?;
    Ok(())
}

fn rnn_step(
    x: &ArrayView2<f64>,
    prev_h: &ArrayView2<f64>,
    wx: &ArrayView2<f64>,
    wh: &ArrayView2<f64>,
    b: &ArrayView1<f64>,
) -> Array2<f64> {
    (x.dot(wx) + prev_h.dot(wh) + b).mapv(f64::tanh)
}

fn rnn_step_grads(
    dnext_h: &ArrayView2<f64>,
    x: &ArrayView2<f64>,
    prev_h: &ArrayView2<f64>,
    wx: &ArrayView2<f64>,
    wh: &ArrayView2<f64>,
    next_h: &ArrayView2<f64>,
) -> RnnStepGrads {
    // d tanh(a) / da = 1 - tanh(a)^2
    let da = dnext_h * &next_h.mapv(|h| 1.0 - h * h);
    RnnStepGrads {
        dx: da.dot(&wx.t()),
        dprev_h: da.dot(&wh.t()),
        dwx: x.t().dot(&da),
        dwh: prev_h.t().dot(&da),
        db: da.sum_axis(Axis(0)),
    }
}

/// Values from [`rnn_step_forward`] needed by [`rnn_step_backward`]
#[derive(Debug, Clone)]
pub struct RnnStepCache {
    x: Array2<f64>,
    prev_h: Array2<f64>,
    wx: Array2<f64>,
    wh: Array2<f64>,
    next_h: Array2<f64>,
}

/// A single timestep of a vanilla RNN: `next_h = tanh(x Wx + prev_h Wh + b)`.
///
/// `x` is (N, D), `prev_h` is (N, H), `wx` is (D, H), `wh` is (H, H) and `b` is (H,).
pub fn rnn_step_forward(
    x: ArrayView2<f64>,
    prev_h: ArrayView2<f64>,
    wx: ArrayView2<f64>,
    wh: ArrayView2<f64>,
    b: ArrayView1<f64>,
) -> Result<(Array2<f64>, RnnStepCache), NNError> {
    check_recurrent_shapes(x.dim(), &prev_h, &wx, &wh, &b, 1)?;
    let next_h = rnn_step(&x, &prev_h, &wx, &wh, &b);
    let cache = RnnStepCache {
        x: x.to_owned(),
        prev_h: prev_h.to_owned(),
        wx: wx.to_owned(),
        wh: wh.to_owned(),
        next_h: next_h.clone(),
    };
    Ok((next_h, cache))
}

/// Backward pass of a single vanilla RNN timestep
pub fn rnn_step_backward(
    dnext_h: ArrayView2<f64>,
    cache: &RnnStepCache,
) -> Result<RnnStepGrads, NNError> {
    check_shape("rnn upstream gradient", cache.next_h.shape(), dnext_h.shape())?;
    Ok(rnn_step_grads(
        &dnext_h,
        &cache.x.view(),
        &cache.prev_h.view(),
        &cache.wx.view(),
        &cache.wh.view(),
        &cache.next_h.view(),
    ))
}

/// Values from [`rnn_forward`] needed by [`rnn_backward`]
#[derive(Debug, Clone)]
pub struct RnnCache {
    x: Array3<f64>,
    h0: Array2<f64>,
    wx: Array2<f64>,
    wh: Array2<f64>,
    h: Array3<f64>,
}

/// Runs a vanilla RNN over a whole sequence `x` of shape (N, T, D) starting from the hidden
/// state `h0` of shape (N, H). Returns the hidden states of every timestep, (N, T, H).
pub fn rnn_forward(
    x: ArrayView3<f64>,
    h0: ArrayView2<f64>,
    wx: ArrayView2<f64>,
    wh: ArrayView2<f64>,
    b: ArrayView1<f64>,
) -> Result<(Array3<f64>, RnnCache), NNError> {
    let (n, t_len, d) = x.dim();
    check_recurrent_shapes((n, d), &h0, &wx, &wh, &b, 1)?;
    if t_len == 0 {
        return Err(NNError::EmptyBatch);
    }

    let mut h = Array3::zeros((n, t_len, h0.ncols()));
    for t in 0..t_len {
        let x_t = x.index_axis(Axis(1), t);
        let next_h = {
            let prev_h = if t == 0 {
                h0.view()
            } else {
                h.index_axis(Axis(1), t - 1)
            };
            rnn_step(&x_t, &prev_h, &wx, &wh, &b)
        };
        h.index_axis_mut(Axis(1), t).assign(&next_h);
    }

    let cache = RnnCache {
        x: x.to_owned(),
        h0: h0.to_owned(),
        wx: wx.to_owned(),
        wh: wh.to_owned(),
        h: h.clone(),
    };
    Ok((h, cache))
}

/// Backpropagation through time for a vanilla RNN. `dh` (N, T, H) holds the upstream
/// gradient of every hidden state; the gradient flowing into the previous timestep is
/// added to it on the way back.
pub fn rnn_backward(dh: ArrayView3<f64>, cache: &RnnCache) -> Result<RnnGrads, NNError> {
    check_shape("rnn upstream gradient", cache.h.shape(), dh.shape())?;
    let (_, t_len, _) = dh.dim();

    let mut dx = Array3::zeros(cache.x.raw_dim());
    let mut dwx = Array2::zeros(cache.wx.raw_dim());
    let mut dwh = Array2::zeros(cache.wh.raw_dim());
    let mut db = Array1::zeros(cache.wh.ncols());
    let mut dprev_h = Array2::zeros(cache.h0.raw_dim());

    for t in (0..t_len).rev() {
        let dnext_h = &dh.index_axis(Axis(1), t) + &dprev_h;
        let prev_h = if t == 0 {
            cache.h0.view()
        } else {
            cache.h.index_axis(Axis(1), t - 1)
        };
        let step = rnn_step_grads(
            &dnext_h.view(),
            &cache.x.index_axis(Axis(1), t),
            &prev_h,
            &cache.wx.view(),
            &cache.wh.view(),
            &cache.h.index_axis(Axis(1), t),
        );
        dx.index_axis_mut(Axis(1), t).assign(&step.dx);
        dwx += &step.dwx;
        dwh += &step.dwh;
        db += &step.db;
        dprev_h = step.dprev_h;
    }

    Ok(RnnGrads {
        dx,
        dh0: dprev_h,
        dwx,
        dwh,
        db,
    })
}

/// Values from [`word_embedding_forward`] needed by [`word_embedding_backward`]
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    x: Array2<usize>,
    vocab_size: usize,
    dim: usize,
}

/// Looks up the word vector of every index in `x` (N, T) from the embedding matrix `w`
/// of shape (V, D), giving (N, T, D)
pub fn word_embedding_forward(
    x: ArrayView2<usize>,
    w: ArrayView2<f64>,
) -> Result<(Array3<f64>, EmbeddingCache), NNError> {
    let (n, t_len) = x.dim();
    let (vocab_size, dim) = w.dim();
    if let Some(&idx) = x.iter().find(|&&idx| idx >= vocab_size) {
        return Err(NNError::IndexOutOfRange {
            what: "vocabulary",
            index: idx,
            size: vocab_size,
        });
    }

    let mut out = Array3::zeros((n, t_len, dim));
    for ((i, t), &idx) in x.indexed_iter() {
        out.slice_mut(s![i, t, ..]).assign(&w.row(idx));
    }
    let cache = EmbeddingCache {
        x: x.to_owned(),
        vocab_size,
        dim,
    };
    Ok((out, cache))
}

/// Gradient of the embedding matrix (V, D). Words are integers, so there is no gradient
/// with respect to `x`; rows of repeated words accumulate.
pub fn word_embedding_backward(
    dout: ArrayView3<f64>,
    cache: &EmbeddingCache,
) -> Result<Array2<f64>, NNError> {
    let (n, t_len) = cache.x.dim();
    check_shape("embedding upstream gradient", &[n, t_len, cache.dim], dout.shape())?;
    let mut dw = Array2::zeros((cache.vocab_size, cache.dim));
    for ((i, t), &idx) in cache.x.indexed_iter() {
        let mut row = dw.row_mut(idx);
        row += &dout.slice(s![i, t, ..]);
    }
    Ok(dw)
}

/// Logistic function that never exponentiates a positive number
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Gradients of a single LSTM step
#[derive(Debug, Clone)]
pub struct LstmStepGrads {
    pub dx: Array2<f64>,
    pub dprev_h: Array2<f64>,
    pub dprev_c: Array2<f64>,
    pub dwx: Array2<f64>,
    pub dwh: Array2<f64>,
    pub db: Array1<f64>,
}

/// Gate activations of one LSTM step, each (N, H)
#[derive(Debug, Clone)]
struct LstmGates {
    input: Array2<f64>,
    forget: Array2<f64>,
    output: Array2<f64>,
    cell: Array2<f64>,
    /// tanh of the new cell state
    tanh_c: Array2<f64>,
}

/// Returns `(next_h, next_c, gates)`.
/// The pre-activations are split in the order input, forget, output, cell candidate.
fn lstm_step(
    x: &ArrayView2<f64>,
    prev_h: &ArrayView2<f64>,
    prev_c: &ArrayView2<f64>,
    wx: &ArrayView2<f64>,
    wh: &ArrayView2<f64>,
    b: &ArrayView1<f64>,
) -> (Array2<f64>, Array2<f64>, LstmGates) {
    let h = prev_h.ncols();
    let a = x.dot(wx) + prev_h.dot(wh) + b;
    let input = a.slice(s![.., ..h]).mapv(sigmoid);
    let forget = a.slice(s![.., h..2 * h]).mapv(sigmoid);
    let output = a.slice(s![.., 2 * h..3 * h]).mapv(sigmoid);
    let cell = a.slice(s![.., 3 * h..]).mapv(f64::tanh);

    let next_c = &forget * prev_c + &input * &cell;
    let tanh_c = next_c.mapv(f64::tanh);
    let next_h = &output * &tanh_c;
    let gates = LstmGates {
        input,
        forget,
        output,
        cell,
        tanh_c,
    };
    (next_h, next_c, gates)
}

#[allow(clippy::too_many_arguments)]
fn lstm_step_grads(
    dnext_h: &ArrayView2<f64>,
    dnext_c: &ArrayView2<f64>,
    x: &ArrayView2<f64>,
    prev_h: &ArrayView2<f64>,
    prev_c: &ArrayView2<f64>,
    wx: &ArrayView2<f64>,
    wh: &ArrayView2<f64>,
    gates: &LstmGates,
) -> LstmStepGrads {
    let LstmGates {
        input,
        forget,
        output,
        cell,
        tanh_c,
    } = gates;
    let (n, h) = input.dim();

    let doutput = dnext_h * tanh_c;
    let dc = dnext_c + &(dnext_h * output * &tanh_c.mapv(|t| 1.0 - t * t));
    let dprev_c = &dc * forget;
    let dforget = &dc * prev_c;
    let dinput = &dc * cell;
    let dcell = &dc * input;

    // back through the gate nonlinearities into the stacked pre-activations
    let sigmoid_grad = |s: &Array2<f64>| s.mapv(|v| v * (1.0 - v));
    let mut da = Array2::zeros((n, 4 * h));
    da.slice_mut(s![.., ..h])
        .assign(&(dinput * sigmoid_grad(input)));
    da.slice_mut(s![.., h..2 * h])
        .assign(&(dforget * sigmoid_grad(forget)));
    da.slice_mut(s![.., 2 * h..3 * h])
        .assign(&(doutput * sigmoid_grad(output)));
    da.slice_mut(s![.., 3 * h..])
        .assign(&(dcell * cell.mapv(|g| 1.0 - g * g)));

    LstmStepGrads {
        dx: da.dot(&wx.t()),
        dprev_h: da.dot(&wh.t()),
        dprev_c,
        dwx: x.t().dot(&da),
        dwh: prev_h.t().dot(&da),
        db: da.sum_axis(Axis(0)),
    }
}

/// Values from [`lstm_step_forward`] needed by [`lstm_step_backward`]
#[derive(Debug, Clone)]
pub struct LstmStepCache {
    x: Array2<f64>,
    prev_h: Array2<f64>,
    prev_c: Array2<f64>,
    wx: Array2<f64>,
    wh: Array2<f64>,
    gates: LstmGates,
}

/// A single LSTM timestep. `wx` is (D, 4H), `wh` is (H, 4H) and `b` is (4H,).
///
/// Returns `(next_h, next_c, cache)` with both states of shape (N, H).
pub fn lstm_step_forward(
    x: ArrayView2<f64>,
    prev_h: ArrayView2<f64>,
    prev_c: ArrayView2<f64>,
    wx: ArrayView2<f64>,
    wh: ArrayView2<f64>,
    b: ArrayView1<f64>,
) -> Result<(Array2<f64>, Array2<f64>, LstmStepCache), NNError> {
    check_recurrent_shapes(x.dim(), &prev_h, &wx, &wh, &b, 4)?;
    check_shape("previous cell state", prev_h.shape(), prev_c.shape())?;
    let (next_h, next_c, gates) = lstm_step(&x, &prev_h, &prev_c, &wx, &wh, &b);
    let cache = LstmStepCache {
        x: x.to_owned(),
        prev_h: prev_h.to_owned(),
        prev_c: prev_c.to_owned(),
        wx: wx.to_owned(),
        wh: wh.to_owned(),
        gates,
    };
    Ok((next_h, next_c, cache))
}

/// Backward pass of a single LSTM timestep
pub fn lstm_step_backward(
    dnext_h: ArrayView2<f64>,
    dnext_c: ArrayView2<f64>,
    cache: &LstmStepCache,
) -> Result<LstmStepGrads, NNError> {
    check_shape("lstm hidden gradient", cache.prev_h.shape(), dnext_h.shape())?;
    check_shape("lstm cell gradient", cache.prev_c.shape(), dnext_c.shape())?;
    Ok(lstm_step_grads(
        &dnext_h,
        &dnext_c,
        &cache.x.view(),
        &cache.prev_h.view(),
        &cache.prev_c.view(),
        &cache.wx.view(),
        &cache.wh.view(),
        &cache.gates,
    ))
}

/// Values from [`lstm_forward`] needed by [`lstm_backward`]
#[derive(Debug, Clone)]
pub struct LstmCache {
    x: Array3<f64>,
    h0: Array2<f64>,
    wx: Array2<f64>,
    wh: Array2<f64>,
    h: Array3<f64>,
    c: Array3<f64>,
    gates: Vec<LstmGates>,
}

/// Runs an LSTM over a whole sequence (N, T, D) from the hidden state `h0` (N, H).
/// The initial cell state is zero and cell states are not returned.
pub fn lstm_forward(
    x: ArrayView3<f64>,
    h0: ArrayView2<f64>,
    wx: ArrayView2<f64>,
    wh: ArrayView2<f64>,
    b: ArrayView1<f64>,
) -> Result<(Array3<f64>, LstmCache), NNError> {
    let (n, t_len, d) = x.dim();
    check_recurrent_shapes((n, d), &h0, &wx, &wh, &b, 4)?;
    if t_len == 0 {
        return Err(NNError::EmptyBatch);
    }
    let hidden = h0.ncols();
    let c0 = Array2::zeros((n, hidden));

    let mut h = Array3::zeros((n, t_len, hidden));
    let mut c = Array3::zeros((n, t_len, hidden));
    let mut gates = Vec::with_capacity(t_len);
    for t in 0..t_len {
        let (next_h, next_c, step_gates) = {
            let (prev_h, prev_c) = if t == 0 {
                (h0.view(), c0.view())
            } else {
                (h.index_axis(Axis(1), t - 1), c.index_axis(Axis(1), t - 1))
            };
            lstm_step(&x.index_axis(Axis(1), t), &prev_h, &prev_c, &wx, &wh, &b)
        };
        h.index_axis_mut(Axis(1), t).assign(&next_h);
        c.index_axis_mut(Axis(1), t).assign(&next_c);
        gates.push(step_gates);
    }

    let cache = LstmCache {
        x: x.to_owned(),
        h0: h0.to_owned(),
        wx: wx.to_owned(),
        wh: wh.to_owned(),
        h: h.clone(),
        c,
        gates,
    };
    Ok((h, cache))
}

/// Backpropagation through time for an LSTM
pub fn lstm_backward(dh: ArrayView3<f64>, cache: &LstmCache) -> Result<RnnGrads, NNError> {
    check_shape("lstm upstream gradient", cache.h.shape(), dh.shape())?;
    let (_, t_len, _) = dh.dim();

    let c0 = Array2::zeros(cache.h0.raw_dim());
    let mut dx = Array3::zeros(cache.x.raw_dim());
    let mut dwx = Array2::zeros(cache.wx.raw_dim());
    let mut dwh = Array2::zeros(cache.wh.raw_dim());
    let mut db = Array1::zeros(cache.wh.ncols());
    let mut dprev_h = Array2::zeros(cache.h0.raw_dim());
    let mut dprev_c = Array2::zeros(cache.h0.raw_dim());

    for t in (0..t_len).rev() {
        let dnext_h = &dh.index_axis(Axis(1), t) + &dprev_h;
        let (prev_h, prev_c) = if t == 0 {
            (cache.h0.view(), c0.view())
        } else {
            (
                cache.h.index_axis(Axis(1), t - 1),
                cache.c.index_axis(Axis(1), t - 1),
            )
        };
        let step = lstm_step_grads(
            &dnext_h.view(),
            &dprev_c.view(),
            &cache.x.index_axis(Axis(1), t),
            &prev_h,
            &prev_c,
            &cache.wx.view(),
            &cache.wh.view(),
            &cache.gates[t],
        );
        dx.index_axis_mut(Axis(1), t).assign(&step.dx);
        dwx += &step.dwx;
        dwh += &step.dwh;
        db += &step.db;
        dprev_h = step.dprev_h;
        dprev_c = step.dprev_c;
    }

    Ok(RnnGrads {
        dx,
        dh0: dprev_h,
        dwx,
        dwh,
        db,
    })
}

/// Values from [`temporal_affine_forward`] needed by [`temporal_affine_backward`]
#[derive(Debug, Clone)]
pub struct TemporalAffineCache {
    x: Array3<f64>,
    w: Array2<f64>,
}

/// Applies the same affine map `w` (D, M), `b` (M,) to every timestep of (N, T, D)
pub fn temporal_affine_forward(
    x: ArrayView3<f64>,
    w: ArrayView2<f64>,
    b: ArrayView1<f64>,
) -> Result<(Array3<f64>, TemporalAffineCache), NNError> {
    let (n, t_len, d) = x.dim();
    check_shape("temporal affine weights", &[d, b.len()], w.shape())?;
    let out = x.to_shape((n * t_len, d))?.dot(&w) + &b;
    let out = out.into_shape_with_order((n, t_len, b.len()))?;
    let cache = TemporalAffineCache {
        x: x.to_owned(),
        w: w.to_owned(),
    };
    Ok((out, cache))
}

/// Backward pass of the temporal affine layer. Returns `(dx, dw, db)`
pub fn temporal_affine_backward(
    dout: ArrayView3<f64>,
    cache: &TemporalAffineCache,
) -> Result<(Array3<f64>, Array2<f64>, Array1<f64>), NNError> {
    let (n, t_len, d) = cache.x.dim();
    let m = cache.w.ncols();
    check_shape("temporal affine upstream gradient", &[n, t_len, m], dout.shape())?;
    let dout2 = dout.to_shape((n * t_len, m))?;
    let x2 = cache.x.to_shape((n * t_len, d))?;

    let dx = dout2
        .dot(&cache.w.t())
        .into_shape_with_order((n, t_len, d))?;
    let dw = x2.t().dot(&dout2);
    let db = dout2.sum_axis(Axis(0));
    Ok((dx, dw, db))
}

/// Softmax cross entropy at every timestep of (N, T, V) scores, summed over time and
/// averaged over the N sequences. Timesteps where `mask` is false (padding) contribute
/// neither loss nor gradient.
pub fn temporal_softmax_loss(
    x: ArrayView3<f64>,
    y: ArrayView2<usize>,
    mask: ArrayView2<bool>,
) -> Result<(f64, Array3<f64>), NNError> {
    let (n, t_len, vocab) = x.dim();
    check_shape("temporal labels", &[n, t_len], y.shape())?;
    check_shape("temporal mask", &[n, t_len], mask.shape())?;
    if n == 0 {
        return Err(NNError::EmptyBatch);
    }
    if let Some(&label) = y.iter().find(|&&label| label >= vocab) {
        return Err(NNError::IndexOutOfRange {
            what: "vocabulary scores",
            index: label,
            size: vocab,
        });
    }

    let mut loss = 0.0;
    let mut dx = Array3::zeros(x.raw_dim());
    for ((i, t), &label) in y.indexed_iter() {
        if !mask[[i, t]] {
            continue;
        }
        let scores = x.slice(s![i, t, ..]);
        let max = scores.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        let shifted = scores.mapv(|v| v - max);
        let log_z = shifted.mapv(f64::exp).sum().ln();
        loss -= shifted[label] - log_z;

        let mut grad = dx.slice_mut(s![i, t, ..]);
        grad.assign(&shifted.mapv(|v| (v - log_z).exp()));
        grad[label] -= 1.0;
    }
    dx /= n as f64;
    Ok((loss / n as f64, dx))
}
