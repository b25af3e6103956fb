//! Convolutional layer primitives over image batches of shape (N, C, H, W)

use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView4, Axis, Zip, s};

use crate::{
    layers::{
        BatchNormCache, BatchNormParam, ReluCache, batchnorm_backward, batchnorm_forward,
        relu_backward, relu_forward,
    },
    nn::{NNError, check_shape},
};

/// Stride and zero padding of a convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParam {
    /// pixels between adjacent receptive fields, both horizontally and vertically
    pub stride: usize,
    /// zero padding added on every side of the input
    pub pad: usize,
}

impl Default for ConvParam {
    fn default() -> Self {
        Self { stride: 1, pad: 0 }
    }
}

impl ConvParam {
    pub fn new(stride: usize, pad: usize) -> Self {
        Self { stride, pad }
    }
}

/// Window size and stride of a max pooling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParam {
    pub pool_height: usize,
    pub pool_width: usize,
    pub stride: usize,
}

impl Default for PoolParam {
    fn default() -> Self {
        Self {
            pool_height: 2,
            pool_width: 2,
            stride: 2,
        }
    }
}

/// Number of window positions along one axis, `1 + (size - window) / stride`
fn sliding_windows(
    what: &'static str,
    size: usize,
    window: usize,
    stride: usize,
) -> Result<usize, NNError> {
    if stride == 0 {
        return Err(NNError::InvalidParameter {
            name: "stride",
            reason: "must be positive".to_string(),
        });
    }
    if window == 0 || window > size {
        return Err(NNError::InvalidParameter {
            name: what,
            reason: format!("window of {} does not fit into {}", window, size),
        });
    }
    Ok(1 + (size - window) / stride)
}

/// Checks the shapes of a convolution and returns the output height and width
fn conv_output_dims(
    x_dim: (usize, usize, usize, usize),
    w_dim: (usize, usize, usize, usize),
    param: ConvParam,
) -> Result<(usize, usize), NNError> {
    let (_, c, h, wd) = x_dim;
    let (_, wc, hh, ww) = w_dim;
    check_shape("conv filter channels", &[c], &[wc])?;
    let h_out = sliding_windows("conv filter height", h + 2 * param.pad, hh, param.stride)?;
    let w_out = sliding_windows("conv filter width", wd + 2 * param.pad, ww, param.stride)?;
    Ok((h_out, w_out))
}

fn zero_pad(x: &ArrayView4<f64>, pad: usize) -> Array4<f64> {
    let (n, c, h, w) = x.dim();
    let mut xp = Array4::zeros((n, c, h + 2 * pad, w + 2 * pad));
    xp.slice_mut(s![.., .., pad..pad + h, pad..pad + w]).assign(x);
    xp
}

fn strip_pad(xp: &Array4<f64>, pad: usize) -> Array4<f64> {
    let (_, _, hp, wp) = xp.dim();
    xp.slice(s![.., .., pad..hp - pad, pad..wp - pad]).to_owned()
}

/// Values from the convolution forward passes needed by the backward passes
#[derive(Debug, Clone)]
pub struct ConvCache {
    x: Array4<f64>,
    w: Array4<f64>,
    param: ConvParam,
}

/// Straightforward convolution: every filter is slid over every padded input image.
///
/// `x` has shape (N, C, H, W), the filters `w` have shape (F, C, HH, WW) and `b` has shape (F,).
/// The output has shape (N, F, H', W') with `H' = 1 + (H + 2 * pad - HH) / stride` and
/// `W' = 1 + (W + 2 * pad - WW) / stride`, rounded down.
pub fn conv_forward_naive(
    x: ArrayView4<f64>,
    w: ArrayView4<f64>,
    b: ArrayView1<f64>,
    param: ConvParam,
) -> Result<(Array4<f64>, ConvCache), NNError> {
    let (h_out, w_out) = conv_output_dims(x.dim(), w.dim(), param)?;
    check_shape("conv bias", &[w.dim().0], b.shape())?;
    let (n, _, _, _) = x.dim();
    let (f, _, hh, ww) = w.dim();
    let st = param.stride;
    let xp = zero_pad(&x, param.pad);

    let mut out = Array4::zeros((n, f, h_out, w_out));
    for ni in 0..n {
        for fi in 0..f {
            let filter = w.slice(s![fi, .., .., ..]);
            for i in 0..h_out {
                for j in 0..w_out {
                    let window = xp.slice(s![ni, .., i * st..i * st + hh, j * st..j * st + ww]);
                    out[[ni, fi, i, j]] = (&window * &filter).sum() + b[fi];
                }
            }
        }
    }

    let cache = ConvCache {
        x: x.to_owned(),
        w: w.to_owned(),
        param,
    };
    Ok((out, cache))
}

/// Backward pass for [`conv_forward_naive`]. Returns `(dx, dw, db)`
pub fn conv_backward_naive(
    dout: ArrayView4<f64>,
    cache: &ConvCache,
) -> Result<(Array4<f64>, Array4<f64>, Array1<f64>), NNError> {
    let ConvCache { x, w, param } = cache;
    let (h_out, w_out) = conv_output_dims(x.dim(), w.dim(), *param)?;
    let (n, _, _, _) = x.dim();
    let (f, _, hh, ww) = w.dim();
    check_shape("conv upstream gradient", &[n, f, h_out, w_out], dout.shape())?;
    let st = param.stride;
    let xp = zero_pad(&x.view(), param.pad);

    let mut dxp = Array4::zeros(xp.raw_dim());
    let mut dw = Array4::zeros(w.raw_dim());
    let db = dout.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0));

    for ni in 0..n {
        for fi in 0..f {
            let filter = w.slice(s![fi, .., .., ..]);
            for i in 0..h_out {
                for j in 0..w_out {
                    let g = dout[[ni, fi, i, j]];
                    let rows = i * st..i * st + hh;
                    let cols = j * st..j * st + ww;
                    let window = xp.slice(s![ni, .., rows.clone(), cols.clone()]);
                    dw.slice_mut(s![fi, .., .., ..]).scaled_add(g, &window);
                    dxp.slice_mut(s![ni, .., rows, cols]).scaled_add(g, &filter);
                }
            }
        }
    }

    Ok((strip_pad(&dxp, param.pad), dw, db))
}

/// Unrolls every receptive field of the padded input into a column of a
/// (C * HH * WW, N * H' * W') matrix
fn im2col(
    xp: &Array4<f64>,
    hh: usize,
    ww: usize,
    stride: usize,
    h_out: usize,
    w_out: usize,
) -> Result<Array2<f64>, NNError> {
    let (n, c, _, _) = xp.dim();
    let field = c * hh * ww;
    let mut cols = Array2::zeros((field, n * h_out * w_out));
    for ni in 0..n {
        for i in 0..h_out {
            for j in 0..w_out {
                let patch = xp.slice(s![
                    ni,
                    ..,
                    i * stride..i * stride + hh,
                    j * stride..j * stride + ww
                ]);
                let col = (ni * h_out + i) * w_out + j;
                cols.column_mut(col).assign(&patch.to_shape(field)?);
            }
        }
    }
    Ok(cols)
}

/// Inverse of [`im2col`]: scatter-adds every column back into its receptive field
fn col2im(
    dcols: &Array2<f64>,
    padded_dim: (usize, usize, usize, usize),
    hh: usize,
    ww: usize,
    stride: usize,
    h_out: usize,
    w_out: usize,
) -> Result<Array4<f64>, NNError> {
    let (n, c, _, _) = padded_dim;
    let mut dxp = Array4::zeros(padded_dim);
    for ni in 0..n {
        for i in 0..h_out {
            for j in 0..w_out {
                let col = (ni * h_out + i) * w_out + j;
                let patch = dcols.column(col);
                let patch = patch.to_shape((c, hh, ww))?;
                let mut field = dxp.slice_mut(s![
                    ni,
                    ..,
                    i * stride..i * stride + hh,
                    j * stride..j * stride + ww
                ]);
                field += &patch;
            }
        }
    }
    Ok(dxp)
}

/// Cache of [`conv_forward_im2col`], holding the unrolled input
#[derive(Debug, Clone)]
pub struct Im2ColCache {
    conv: ConvCache,
    cols: Array2<f64>,
}

/// Convolution expressed as a single matrix product over the unrolled input.
/// Same inputs and outputs as [`conv_forward_naive`].
pub fn conv_forward_im2col(
    x: ArrayView4<f64>,
    w: ArrayView4<f64>,
    b: ArrayView1<f64>,
    param: ConvParam,
) -> Result<(Array4<f64>, Im2ColCache), NNError> {
    let (h_out, w_out) = conv_output_dims(x.dim(), w.dim(), param)?;
    check_shape("conv bias", &[w.dim().0], b.shape())?;
    let (n, _, _, _) = x.dim();
    let (f, c, hh, ww) = w.dim();
    let xp = zero_pad(&x, param.pad);
    let cols = im2col(&xp, hh, ww, param.stride, h_out, w_out)?;

    let w_mat = w.to_shape((f, c * hh * ww))?;
    let out = w_mat.dot(&cols) + &b.insert_axis(Axis(1));
    let out = out
        .into_shape_with_order((f, n, h_out, w_out))?
        .permuted_axes([1, 0, 2, 3])
        .as_standard_layout()
        .into_owned();
    log::debug!(
        "conv: {:?} * {:?} -> {:?}",
        x.shape(),
        w.shape(),
        out.shape()
    );

    let cache = Im2ColCache {
        conv: ConvCache {
            x: x.to_owned(),
            w: w.to_owned(),
            param,
        },
        cols,
    };
    Ok((out, cache))
}

/// Backward pass for [`conv_forward_im2col`]. Returns `(dx, dw, db)`
pub fn conv_backward_im2col(
    dout: ArrayView4<f64>,
    cache: &Im2ColCache,
) -> Result<(Array4<f64>, Array4<f64>, Array1<f64>), NNError> {
    let ConvCache { x, w, param } = &cache.conv;
    let (n, _, h, wd) = x.dim();
    let (f, c, hh, ww) = w.dim();
    let (h_out, w_out) = conv_output_dims(x.dim(), w.dim(), *param)?;
    check_shape("conv upstream gradient", &[n, f, h_out, w_out], dout.shape())?;

    let dout_mat = dout
        .permuted_axes([1, 0, 2, 3])
        .to_shape((f, n * h_out * w_out))?
        .into_owned();
    let db = dout_mat.sum_axis(Axis(1));
    let dw = dout_mat
        .dot(&cache.cols.t())
        .into_shape_with_order((f, c, hh, ww))?;

    let w_mat = w.to_shape((f, c * hh * ww))?;
    let dcols = w_mat.t().dot(&dout_mat);
    let padded_dim = (n, c, h + 2 * param.pad, wd + 2 * param.pad);
    let dxp = col2im(&dcols, padded_dim, hh, ww, param.stride, h_out, w_out)?;

    Ok((strip_pad(&dxp, param.pad), dw, db))
}

/// Values from [`max_pool_forward_naive`] needed by [`max_pool_backward_naive`]
#[derive(Debug, Clone)]
pub struct PoolCache {
    x: Array4<f64>,
    param: PoolParam,
}

fn pool_output_dims(x: &ArrayView4<f64>, param: PoolParam) -> Result<(usize, usize), NNError> {
    let (_, _, h, w) = x.dim();
    let h_out = sliding_windows("pool height", h, param.pool_height, param.stride)?;
    let w_out = sliding_windows("pool width", w, param.pool_width, param.stride)?;
    Ok((h_out, w_out))
}

/// Max pooling over (N, C, H, W) with output `(N, C, 1 + (H - ph) / stride, 1 + (W - pw) / stride)`
pub fn max_pool_forward_naive(
    x: ArrayView4<f64>,
    param: PoolParam,
) -> Result<(Array4<f64>, PoolCache), NNError> {
    let (h_out, w_out) = pool_output_dims(&x, param)?;
    let (n, c, _, _) = x.dim();
    let (ph, pw, st) = (param.pool_height, param.pool_width, param.stride);

    let mut out = Array4::zeros((n, c, h_out, w_out));
    for ((ni, ci, i, j), o) in out.indexed_iter_mut() {
        let window = x.slice(s![ni, ci, i * st..i * st + ph, j * st..j * st + pw]);
        *o = window.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    }

    let cache = PoolCache {
        x: x.to_owned(),
        param,
    };
    Ok((out, cache))
}

/// Backward pass of max pooling. The upstream gradient of a window flows to every input
/// equal to the window maximum.
pub fn max_pool_backward_naive(
    dout: ArrayView4<f64>,
    cache: &PoolCache,
) -> Result<Array4<f64>, NNError> {
    let PoolCache { x, param } = cache;
    let (h_out, w_out) = pool_output_dims(&x.view(), *param)?;
    let (n, c, _, _) = x.dim();
    check_shape("pool upstream gradient", &[n, c, h_out, w_out], dout.shape())?;
    let (ph, pw, st) = (param.pool_height, param.pool_width, param.stride);

    let mut dx = Array4::zeros(x.raw_dim());
    for ((ni, ci, i, j), &g) in dout.indexed_iter() {
        let rows = i * st..i * st + ph;
        let cols = j * st..j * st + pw;
        let window = x.slice(s![ni, ci, rows.clone(), cols.clone()]);
        let max = window.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        Zip::from(dx.slice_mut(s![ni, ci, rows, cols]))
            .and(&window)
            .for_each(|d, &v| {
                if v == max {
                    *d += g;
                }
            });
    }
    Ok(dx)
}

/// Cache of [`spatial_batchnorm_forward`]
#[derive(Debug, Clone)]
pub struct SpatialBatchNormCache {
    bn: BatchNormCache,
    dim: (usize, usize, usize, usize),
}

/// Moves channels last and flattens to (N * H * W, C)
fn channels_to_columns(x: ArrayView4<f64>) -> Result<Array2<f64>, NNError> {
    let (n, c, h, w) = x.dim();
    Ok(x.permuted_axes([0, 2, 3, 1])
        .to_shape((n * h * w, c))?
        .into_owned())
}

/// Inverse of [`channels_to_columns`]
fn columns_to_channels(
    x: Array2<f64>,
    (n, c, h, w): (usize, usize, usize, usize),
) -> Result<Array4<f64>, NNError> {
    Ok(x.into_shape_with_order((n, h, w, c))?
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned())
}

/// Batch normalization of every channel of (N, C, H, W) using statistics over N, H and W.
/// `gamma` and `beta` have shape (C,).
pub fn spatial_batchnorm_forward(
    x: ArrayView4<f64>,
    gamma: ArrayView1<f64>,
    beta: ArrayView1<f64>,
    bn_param: &mut BatchNormParam,
) -> Result<(Array4<f64>, SpatialBatchNormCache), NNError> {
    let dim = x.dim();
    let flat = channels_to_columns(x)?;
    let (out, bn) = batchnorm_forward(flat.view(), gamma, beta, bn_param)?;
    Ok((columns_to_channels(out, dim)?, SpatialBatchNormCache { bn, dim }))
}

/// Backward pass of spatial batch normalization. Returns `(dx, dgamma, dbeta)`
pub fn spatial_batchnorm_backward(
    dout: ArrayView4<f64>,
    cache: &SpatialBatchNormCache,
) -> Result<(Array4<f64>, Array1<f64>, Array1<f64>), NNError> {
    let (n, c, h, w) = cache.dim;
    check_shape("spatial batchnorm upstream gradient", &[n, c, h, w], dout.shape())?;
    let flat = channels_to_columns(dout)?;
    let (dx, dgamma, dbeta) = batchnorm_backward(flat.view(), &cache.bn)?;
    Ok((columns_to_channels(dx, cache.dim)?, dgamma, dbeta))
}

pub type ConvReluCache = (Im2ColCache, ReluCache<ndarray::Ix4>);

/// Convolution followed by a ReLU
pub fn conv_relu_forward(
    x: ArrayView4<f64>,
    w: ArrayView4<f64>,
    b: ArrayView1<f64>,
    param: ConvParam,
) -> Result<(Array4<f64>, ConvReluCache), NNError> {
    let (a, conv_cache) = conv_forward_im2col(x, w, b, param)?;
    let (out, relu_cache) = relu_forward(a.view());
    Ok((out, (conv_cache, relu_cache)))
}

/// Backward pass for [`conv_relu_forward`]
pub fn conv_relu_backward(
    dout: ArrayView4<f64>,
    cache: &ConvReluCache,
) -> Result<(Array4<f64>, Array4<f64>, Array1<f64>), NNError> {
    let (conv_cache, relu_cache) = cache;
    let da = relu_backward(dout, relu_cache)?;
    conv_backward_im2col(da.view(), conv_cache)
}

pub type ConvReluPoolCache = (Im2ColCache, ReluCache<ndarray::Ix4>, PoolCache);

/// Convolution, ReLU, then max pooling
pub fn conv_relu_pool_forward(
    x: ArrayView4<f64>,
    w: ArrayView4<f64>,
    b: ArrayView1<f64>,
    conv_param: ConvParam,
    pool_param: PoolParam,
) -> Result<(Array4<f64>, ConvReluPoolCache), NNError> {
    let (a, conv_cache) = conv_forward_im2col(x, w, b, conv_param)?;
    let (s, relu_cache) = relu_forward(a.view());
    let (out, pool_cache) = max_pool_forward_naive(s.view(), pool_param)?;
    Ok((out, (conv_cache, relu_cache, pool_cache)))
}

/// Backward pass for [`conv_relu_pool_forward`]
pub fn conv_relu_pool_backward(
    dout: ArrayView4<f64>,
    cache: &ConvReluPoolCache,
) -> Result<(Array4<f64>, Array4<f64>, Array1<f64>), NNError> {
    let (conv_cache, relu_cache, pool_cache) = cache;
    let ds = max_pool_backward_naive(dout, pool_cache)?;
    let da = relu_backward(ds.view(), relu_cache)?;
    conv_backward_im2col(da.view(), conv_cache)
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{
        assert_close, assert_eq_float,
        gradient_check::{
            eval_numerical_gradient_array, randn, rel_error, tests::linspace,
        },
        nn::Mode,
    };

    #[test]
    fn test_conv_forward_naive() {
        let x = linspace(-0.1, 0.5, (2, 3, 4, 4));
        let w = linspace(-0.2, 0.3, (3, 3, 4, 4));
        let b = Array1::linspace(-0.1, 0.2, 3);
        let (out, _) = conv_forward_naive(x.view(), w.view(), b.view(), ConvParam::new(2, 1)).unwrap();
        let correct = array![
            [
                [[-0.08759809, -0.10987781], [-0.18387192, -0.2109216]],
                [[0.21027089, 0.21661097], [0.22847626, 0.23004637]],
                [[0.50813986, 0.54309974], [0.64082444, 0.67101435]]
            ],
            [
                [[-0.98053589, -1.03143541], [-1.19128892, -1.24695841]],
                [[0.69108355, 0.66880383], [0.59480972, 0.56776003]],
                [[2.36270298, 2.36904306], [2.38090835, 2.38247847]]
            ]
        ];
        assert_close!(out, correct, 1e-7);
    }

    #[test]
    fn test_conv_output_size() {
        let x = Array4::<f64>::zeros((1, 1, 5, 5));
        let w = Array4::<f64>::zeros((2, 1, 3, 3));
        let b = Array1::<f64>::zeros(2);
        // (5 + 0 - 3) / 2 + 1 = 2
        let (out, _) = conv_forward_naive(x.view(), w.view(), b.view(), ConvParam::new(2, 0)).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 2]);
        // (5 + 2 - 3) / 1 + 1 = 5
        let (out, _) = conv_forward_im2col(x.view(), w.view(), b.view(), ConvParam::new(1, 1)).unwrap();
        assert_eq!(out.shape(), &[1, 2, 5, 5]);
    }

    #[test]
    fn test_conv_invalid_params() {
        let x = Array4::<f64>::zeros((1, 2, 3, 3));
        let w = Array4::<f64>::zeros((2, 3, 3, 3));
        let b = Array1::<f64>::zeros(2);
        assert!(matches!(
            conv_forward_naive(x.view(), w.view(), b.view(), ConvParam::default()),
            Err(NNError::ShapeMismatch { .. })
        ));
        let w = Array4::<f64>::zeros((2, 2, 5, 5));
        assert!(matches!(
            conv_forward_naive(x.view(), w.view(), b.view(), ConvParam::default()),
            Err(NNError::InvalidParameter { .. })
        ));
        let w = Array4::<f64>::zeros((2, 2, 3, 3));
        assert!(matches!(
            conv_forward_naive(x.view(), w.view(), b.view(), ConvParam::new(0, 0)),
            Err(NNError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_conv_backward_naive() {
        let mut rng = Pcg64Mcg::seed_from_u64(231);
        let x: Array4<f64> = randn((4, 3, 5, 5), &mut rng);
        let w: Array4<f64> = randn((2, 3, 3, 3), &mut rng);
        let b: Array1<f64> = randn(2, &mut rng);
        let dout: Array4<f64> = randn((4, 2, 5, 5), &mut rng);
        let param = ConvParam::new(1, 1);

        let f = |x: &Array4<f64>, w: &Array4<f64>, b: &Array1<f64>| {
            conv_forward_naive(x.view(), w.view(), b.view(), param).unwrap().0
        };
        let dx_num = eval_numerical_gradient_array(|x| f(x, &w, &b), &x, &dout, 1e-5);
        let dw_num = eval_numerical_gradient_array(|w| f(&x, w, &b), &w, &dout, 1e-5);
        let db_num = eval_numerical_gradient_array(|b| f(&x, &w, b), &b, &dout, 1e-5);

        let (_, cache) = conv_forward_naive(x.view(), w.view(), b.view(), param).unwrap();
        let (dx, dw, db) = conv_backward_naive(dout.view(), &cache).unwrap();
        assert_close!(dx, dx_num, 1e-5);
        assert_close!(dw, dw_num, 1e-5);
        assert_close!(db, db_num, 1e-5);
    }

    #[test]
    fn test_conv_im2col_matches_naive() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let x: Array4<f64> = randn((2, 3, 7, 6), &mut rng);
        let w: Array4<f64> = randn((4, 3, 3, 2), &mut rng);
        let b: Array1<f64> = randn(4, &mut rng);
        let param = ConvParam::new(2, 1);

        let (out_naive, cache_naive) =
            conv_forward_naive(x.view(), w.view(), b.view(), param).unwrap();
        let (out_fast, cache_fast) =
            conv_forward_im2col(x.view(), w.view(), b.view(), param).unwrap();
        assert!(rel_error(&out_naive, &out_fast) < 1e-10);

        let dout: Array4<f64> = randn(out_naive.raw_dim(), &mut rng);
        let (dx_n, dw_n, db_n) = conv_backward_naive(dout.view(), &cache_naive).unwrap();
        let (dx_f, dw_f, db_f) = conv_backward_im2col(dout.view(), &cache_fast).unwrap();
        assert!(rel_error(&dx_n, &dx_f) < 1e-10);
        assert!(rel_error(&dw_n, &dw_f) < 1e-10);
        assert!(rel_error(&db_n, &db_f) < 1e-10);
    }

    #[test]
    fn test_max_pool_forward_naive() {
        let x = linspace(-0.3, 0.4, (2, 3, 4, 4));
        let (out, _) = max_pool_forward_naive(x.view(), PoolParam::default()).unwrap();
        let correct = array![
            [
                [[-0.26315789, -0.24842105], [-0.20421053, -0.18947368]],
                [[-0.14526316, -0.13052632], [-0.08631579, -0.07157895]],
                [[-0.02736842, -0.01263158], [0.03157895, 0.04631579]]
            ],
            [
                [[0.09052632, 0.10526316], [0.14947368, 0.16421053]],
                [[0.20842105, 0.22315789], [0.26736842, 0.28210526]],
                [[0.32631579, 0.34105263], [0.38526316, 0.4]]
            ]
        ];
        assert_close!(out, correct, 1e-6);
    }

    #[test]
    fn test_max_pool_backward_naive() {
        let mut rng = Pcg64Mcg::seed_from_u64(231);
        let x: Array4<f64> = randn((3, 2, 8, 8), &mut rng);
        let dout: Array4<f64> = randn((3, 2, 4, 4), &mut rng);
        let param = PoolParam::default();

        let dx_num = eval_numerical_gradient_array(
            |x| max_pool_forward_naive(x.view(), param).unwrap().0,
            &x,
            &dout,
            1e-5,
        );
        let (_, cache) = max_pool_forward_naive(x.view(), param).unwrap();
        let dx = max_pool_backward_naive(dout.view(), &cache).unwrap();
        assert_close!(dx, dx_num, 1e-5);
    }

    #[test]
    fn test_max_pool_ties() {
        let x = Array4::<f64>::ones((1, 1, 2, 2));
        let (_, cache) = max_pool_forward_naive(x.view(), PoolParam::default()).unwrap();
        let dout = Array4::from_elem((1, 1, 1, 1), 2.0);
        let dx = max_pool_backward_naive(dout.view(), &cache).unwrap();
        assert_eq!(dx, Array4::from_elem((1, 1, 2, 2), 2.0));
    }

    #[test]
    fn test_spatial_batchnorm_forward() {
        let mut rng = Pcg64Mcg::seed_from_u64(231);
        let x: Array4<f64> = randn((2, 3, 4, 5), &mut rng) * 4.0 + 10.0;
        let gamma = array![3.0, 4.0, 5.0];
        let beta = array![6.0, 7.0, 8.0];
        let mut bn_param = BatchNormParam::new(Mode::Train);
        let (out, _) =
            spatial_batchnorm_forward(x.view(), gamma.view(), beta.view(), &mut bn_param).unwrap();
        for c in 0..3 {
            let channel = out.index_axis(Axis(1), c);
            assert_eq_float!(channel.mean().unwrap(), beta[c], 1e-8);
            assert_eq_float!(channel.std(0.0), gamma[c], 1e-3);
        }
    }

    #[test]
    fn test_spatial_batchnorm_backward() {
        let mut rng = Pcg64Mcg::seed_from_u64(231);
        let x: Array4<f64> = randn((2, 3, 4, 5), &mut rng) * 5.0 + 12.0;
        let gamma: Array1<f64> = randn(3, &mut rng);
        let beta: Array1<f64> = randn(3, &mut rng);
        let dout: Array4<f64> = randn((2, 3, 4, 5), &mut rng);

        let f = |x: &Array4<f64>, gamma: &Array1<f64>, beta: &Array1<f64>| {
            let mut bn_param = BatchNormParam::new(Mode::Train);
            spatial_batchnorm_forward(x.view(), gamma.view(), beta.view(), &mut bn_param)
                .unwrap()
                .0
        };
        let dx_num = eval_numerical_gradient_array(|x| f(x, &gamma, &beta), &x, &dout, 1e-5);
        let dgamma_num = eval_numerical_gradient_array(|g| f(&x, g, &beta), &gamma, &dout, 1e-5);
        let dbeta_num = eval_numerical_gradient_array(|b| f(&x, &gamma, b), &beta, &dout, 1e-5);

        let mut bn_param = BatchNormParam::new(Mode::Train);
        let (_, cache) =
            spatial_batchnorm_forward(x.view(), gamma.view(), beta.view(), &mut bn_param).unwrap();
        let (dx, dgamma, dbeta) = spatial_batchnorm_backward(dout.view(), &cache).unwrap();
        assert_close!(dx, dx_num, 1e-5);
        assert_close!(dgamma, dgamma_num, 1e-6);
        assert_close!(dbeta, dbeta_num, 1e-6);
    }

    #[test]
    fn test_conv_relu_pool_backward() {
        let mut rng = Pcg64Mcg::seed_from_u64(231);
        let x: Array4<f64> = randn((2, 3, 8, 8), &mut rng);
        let w: Array4<f64> = randn((3, 3, 3, 3), &mut rng);
        let b: Array1<f64> = randn(3, &mut rng);
        let dout: Array4<f64> = randn((2, 3, 4, 4), &mut rng);
        let conv_param = ConvParam::new(1, 1);
        let pool_param = PoolParam::default();

        let f = |x: &Array4<f64>, w: &Array4<f64>, b: &Array1<f64>| {
            conv_relu_pool_forward(x.view(), w.view(), b.view(), conv_param, pool_param)
                .unwrap()
                .0
        };
        let dx_num = eval_numerical_gradient_array(|x| f(x, &w, &b), &x, &dout, 1e-5);
        let dw_num = eval_numerical_gradient_array(|w| f(&x, w, &b), &w, &dout, 1e-5);
        let db_num = eval_numerical_gradient_array(|b| f(&x, &w, b), &b, &dout, 1e-5);

        let (_, cache) =
            conv_relu_pool_forward(x.view(), w.view(), b.view(), conv_param, pool_param).unwrap();
        let (dx, dw, db) = conv_relu_pool_backward(dout.view(), &cache).unwrap();
        assert_close!(dx, dx_num, 1e-5);
        assert_close!(dw, dw_num, 1e-5);
        assert_close!(db, db_num, 1e-5);
    }

    #[test]
    fn test_conv_relu_backward() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let x: Array4<f64> = randn((2, 3, 6, 6), &mut rng);
        let w: Array4<f64> = randn((3, 3, 3, 3), &mut rng);
        let b: Array1<f64> = randn(3, &mut rng);
        let dout: Array4<f64> = randn((2, 3, 6, 6), &mut rng);
        let param = ConvParam::new(1, 1);

        let dx_num = eval_numerical_gradient_array(
            |x| conv_relu_forward(x.view(), w.view(), b.view(), param).unwrap().0,
            &x,
            &dout,
            1e-5,
        );
        let dw_num = eval_numerical_gradient_array(
            |w| conv_relu_forward(x.view(), w.view(), b.view(), param).unwrap().0,
            &w,
            &dout,
            1e-5,
        );
        let db_num = eval_numerical_gradient_array(
            |b| conv_relu_forward(x.view(), w.view(), b.view(), param).unwrap().0,
            &b,
            &dout,
            1e-5,
        );
        let (_, cache) = conv_relu_forward(x.view(), w.view(), b.view(), param).unwrap();
        let (dx, dw, db) = conv_relu_backward(dout.view(), &cache).unwrap();
        assert_close!(dx, dx_num, 1e-5);
        assert_close!(dw, dw_num, 1e-5);
        assert_close!(db, db_num, 1e-5);
    }
}
