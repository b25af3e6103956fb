//! Trains small networks built from the layer primitives of `backprop_rs`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- cnn --dataset quadrants
//! cargo run -- caption --cell-type lstm
//! RUST_LOG=info cargo run -- gradcheck
//! ```
//!
//! Training logs the loss per epoch and writes a plot of the loss history to the output directory.

use std::{error::Error, fs};

use backprop_rs::{
    cnn::{ThreeLayerConvNet, ThreeLayerConvNetConfig},
    conv::{
        ConvParam, PoolParam, conv_backward_im2col, conv_backward_naive, conv_forward_im2col,
        conv_forward_naive, max_pool_backward_naive, max_pool_forward_naive,
        spatial_batchnorm_backward, spatial_batchnorm_forward,
    },
    dataloader::DataLoader,
    datasets::{Dataset, ImageSpec, counting_captions, load_dataset, plot_loss_history},
    gradient_check::{eval_numerical_gradient_array, randn, rel_error},
    layers::{
        BatchNormParam, DropoutParam, affine_backward, affine_forward, batchnorm_backward,
        batchnorm_backward_alt, batchnorm_forward, dropout_backward, dropout_forward,
        relu_backward, relu_forward,
    },
    loss::{softmax_loss, svm_loss},
    nn::{Mode, NNError},
    optim::{Adam, Optim, SGD},
    rnn::{CaptioningRnn, CaptioningRnnConfig, CellType},
    rnn_layers::{
        lstm_backward, lstm_forward, rnn_backward, rnn_forward, temporal_affine_backward,
        temporal_affine_forward, temporal_softmax_loss, word_embedding_backward,
        word_embedding_forward,
    },
    solver::{Solver, SolverConfig},
};
use clap::{Parser, Subcommand, ValueEnum};
use ndarray::{Array, Array0, Array1, Array2, Array3, Array4, Dimension, arr0, s};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,
    #[clap(short, long, global = true, default_value_t = 0)]
    seed: u64,
    #[clap(short, long, global = true, default_value_t = format!("output"))]
    output_dir: String,
}

#[derive(Subcommand)]
enum Command {
    /// Trains a three layer convnet on a synthetic image dataset
    Cnn(CnnArgs),
    /// Trains a captioning RNN on counting captions
    Caption(CaptionArgs),
    /// Compares the analytic gradient of every layer with a numerical estimate
    Gradcheck,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OptimKind {
    Sgd,
    Adam,
}

#[derive(clap::Args)]
struct CnnArgs {
    #[clap(short, long, default_value_t = Dataset::Quadrants)]
    dataset: Dataset,
    #[clap(short, long, default_value_t = 100)]
    class_size: usize,
    #[clap(long, default_value_t = 16)]
    image_size: usize,
    #[clap(short, long, default_value_t = 50)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 5)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.01)]
    lr: f64,
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f64,
    #[clap(long, default_value_t = 0.95)]
    lr_decay: f64,
    #[clap(long, value_enum, default_value_t = OptimKind::Sgd)]
    optim: OptimKind,
    #[clap(long, default_value_t = 8)]
    num_filters: usize,
    #[clap(long, default_value_t = 5)]
    filter_size: usize,
    #[clap(long, default_value_t = 32)]
    hidden_dim: usize,
    #[clap(long, default_value_t = 1e-2)]
    weight_scale: f64,
    #[clap(long, default_value_t = 1e-3)]
    reg: f64,
}

#[derive(clap::Args)]
struct CaptionArgs {
    #[clap(long, default_value_t = CellType::Lstm)]
    cell_type: CellType,
    #[clap(short, long, default_value_t = 500)]
    num_examples: usize,
    #[clap(long, default_value_t = 4)]
    max_words: usize,
    #[clap(long, default_value_t = 16)]
    wordvec_dim: usize,
    #[clap(long, default_value_t = 32)]
    hidden_dim: usize,
    #[clap(short, long, default_value_t = 25)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 30)]
    epochs: usize,
    #[clap(short, long, default_value_t = 5e-3)]
    lr: f64,
    #[clap(long, default_value_t = 0.95)]
    lr_decay: f64,
    /// Number of captions to sample after training
    #[clap(long, default_value_t = 5)]
    samples: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    match &args.command {
        Command::Cnn(cnn) => train_cnn(cnn, &args, &mut rng),
        Command::Caption(caption) => train_captioning(caption, &args, &mut rng),
        Command::Gradcheck => gradcheck(&mut rng),
    }
}

fn train_cnn(cnn: &CnnArgs, args: &Args, rng: &mut Pcg64Mcg) -> Result<(), Box<dyn Error>> {
    let spec = ImageSpec {
        size: cnn.image_size,
        ..ImageSpec::default()
    };
    let (x_train, y_train) = load_dataset(cnn.dataset, cnn.class_size, spec, rng)?;
    let (x_val, y_val) = load_dataset(cnn.dataset, (cnn.class_size / 5).max(1), spec, rng)?;

    let config = ThreeLayerConvNetConfig {
        input_dim: (spec.channels, spec.size, spec.size),
        num_filters: cnn.num_filters,
        filter_size: cnn.filter_size,
        hidden_dim: cnn.hidden_dim,
        num_classes: cnn.dataset.num_classes(),
        weight_scale: cnn.weight_scale,
        reg: cnn.reg,
    };
    let model = ThreeLayerConvNet::new(config, rng)?;
    let loader = DataLoader::new(x_train, y_train, cnn.batch_size, true)?;
    let solver_config = SolverConfig {
        epochs: cnn.epochs,
        lr_decay: cnn.lr_decay,
        seed: Some(args.seed),
        ..SolverConfig::default()
    };
    let val = (&x_val, y_val.as_slice());
    let history = match cnn.optim {
        OptimKind::Sgd => {
            let optim = SGD::new(cnn.lr, cnn.momentum);
            train_classifier(model, optim, solver_config, &loader, val)?
        }
        OptimKind::Adam => {
            let optim = Adam::new(cnn.lr);
            train_classifier(model, optim, solver_config, &loader, val)?
        }
    };

    fs::create_dir_all(&args.output_dir)?;
    plot_loss_history(
        &history,
        &format!("{}/loss_cnn_{}.png", args.output_dir, cnn.dataset),
        &format!("ThreeLayerConvNet on {}", cnn.dataset),
    )?;
    Ok(())
}

/// Trains epoch by epoch, logging train and validation accuracy. Returns the loss history.
fn train_classifier<O: Optim>(
    model: ThreeLayerConvNet,
    optim: O,
    config: SolverConfig,
    loader: &DataLoader<Array4<f64>, Vec<usize>>,
    (x_val, y_val): (&Array4<f64>, &[usize]),
) -> Result<Vec<f64>, NNError> {
    let epochs = config.epochs;
    let mut solver = Solver::new(model, optim, config);
    for _ in 0..epochs {
        solver.train_epoch(loader)?;
        let train_acc = solver.check_accuracy(loader.data(), loader.labels(), 100)?;
        let val_acc = solver.check_accuracy(x_val, y_val, 100)?;
        log::info!(
            "epoch: {}, train accuracy: {:.3}, val accuracy: {:.3}",
            solver.epoch(),
            train_acc,
            val_acc
        );
    }
    Ok(solver.loss_history().to_vec())
}

fn train_captioning(
    caption: &CaptionArgs,
    args: &Args,
    rng: &mut Pcg64Mcg,
) -> Result<(), Box<dyn Error>> {
    let data = counting_captions(caption.num_examples, caption.max_words, rng)?;
    let config = CaptioningRnnConfig {
        input_dim: data.features.ncols(),
        wordvec_dim: caption.wordvec_dim,
        hidden_dim: caption.hidden_dim,
        cell_type: caption.cell_type,
    };
    let model = CaptioningRnn::new(&data.vocab, config, rng)?;
    let loader = DataLoader::new(
        data.features.clone(),
        data.captions.clone(),
        caption.batch_size,
        true,
    )?;
    let solver_config = SolverConfig {
        epochs: caption.epochs,
        lr_decay: caption.lr_decay,
        seed: Some(args.seed),
        ..SolverConfig::default()
    };
    let mut solver = Solver::new(model, Adam::new(caption.lr), solver_config);
    solver.train(&loader)?;

    let n = caption.samples.min(data.features.nrows());
    let features = data.features.slice(s![..n, ..]).to_owned();
    let sampled = solver.model().sample(&features, caption.max_words + 1)?;
    for (truth, sample) in data.captions.outer_iter().zip(sampled.outer_iter()) {
        log::info!(
            "truth: {:<40} sample: {}",
            data.vocab.decode(&truth.to_vec()),
            data.vocab.decode(&sample.to_vec())
        );
    }

    fs::create_dir_all(&args.output_dir)?;
    plot_loss_history(
        solver.loss_history(),
        &format!("{}/loss_caption_{}.png", args.output_dir, caption.cell_type),
        &format!("Captioning {}", caption.cell_type),
    )?;
    Ok(())
}

/// Numerically checks the gradient of `f` at `x` against `analytic` and logs the relative
/// error. `df` is the upstream gradient the analytic result was computed with.
fn check<D, E, F>(
    name: &str,
    analytic: &Array<f64, D>,
    mut f: F,
    x: &Array<f64, D>,
    df: &Array<f64, E>,
) -> Result<f64, NNError>
where
    D: Dimension,
    E: Dimension,
    F: FnMut(&Array<f64, D>) -> Result<Array<f64, E>, NNError>,
{
    let mut failure = None;
    let numeric = eval_numerical_gradient_array(
        |x| {
            f(x).unwrap_or_else(|e| {
                failure.get_or_insert(e);
                Array::zeros(df.raw_dim())
            })
        },
        x,
        df,
        1e-5,
    );
    if let Some(e) = failure {
        return Err(e);
    }
    let err = rel_error(analytic, &numeric);
    log::info!("{:<32} relative error {:.2e}", name, err);
    Ok(err)
}

fn gradcheck(rng: &mut Pcg64Mcg) -> Result<(), Box<dyn Error>> {
    type Out2 = Result<Array2<f64>, NNError>;
    type Out3 = Result<Array3<f64>, NNError>;
    type Out4 = Result<Array4<f64>, NNError>;
    type Scalar = Result<Array0<f64>, NNError>;

    let mut errors = vec![];
    let one = arr0(1.0);

    // affine
    let x = randn((4, 2, 3), rng);
    let w = randn((6, 5), rng);
    let b = randn(5, rng);
    let (out, cache) = affine_forward(x.view(), w.view(), b.view())?;
    let dout = randn(out.raw_dim(), rng);
    let (dx, dw, db) = affine_backward(dout.view(), &cache)?;
    let affine = |x: &Array3<f64>, w: &Array2<f64>, b: &Array1<f64>| -> Out2 {
        Ok(affine_forward(x.view(), w.view(), b.view())?.0)
    };
    errors.push(check("affine dx", &dx, |x| affine(x, &w, &b), &x, &dout)?);
    errors.push(check("affine dw", &dw, |w| affine(&x, w, &b), &w, &dout)?);
    errors.push(check("affine db", &db, |b| affine(&x, &w, b), &b, &dout)?);

    // relu
    let x = randn((5, 6), rng);
    let (out, cache) = relu_forward(x.view());
    let dout = randn(out.raw_dim(), rng);
    let dx = relu_backward(dout.view(), &cache)?;
    let relu = |x: &Array2<f64>| -> Out2 { Ok(relu_forward(x.view()).0) };
    errors.push(check("relu dx", &dx, relu, &x, &dout)?);

    // batchnorm
    let x = randn((8, 5), rng) * 2.0 + 3.0;
    let gamma = randn(5, rng);
    let beta = randn(5, rng);
    let bn = |x: &Array2<f64>, gamma: &Array1<f64>, beta: &Array1<f64>| -> Out2 {
        let mut param = BatchNormParam::new(Mode::Train);
        Ok(batchnorm_forward(x.view(), gamma.view(), beta.view(), &mut param)?.0)
    };
    let mut param = BatchNormParam::new(Mode::Train);
    let (out, cache) = batchnorm_forward(x.view(), gamma.view(), beta.view(), &mut param)?;
    let dout = randn(out.raw_dim(), rng);
    let (dx, dgamma, dbeta) = batchnorm_backward(dout.view(), &cache)?;
    let (dx_alt, _, _) = batchnorm_backward_alt(dout.view(), &cache)?;
    errors.push(check("batchnorm dx", &dx, |x| bn(x, &gamma, &beta), &x, &dout)?);
    errors.push(check(
        "batchnorm dx (simplified)",
        &dx_alt,
        |x| bn(x, &gamma, &beta),
        &x,
        &dout,
    )?);
    errors.push(check("batchnorm dgamma", &dgamma, |g| bn(&x, g, &beta), &gamma, &dout)?);
    errors.push(check("batchnorm dbeta", &dbeta, |b| bn(&x, &gamma, b), &beta, &dout)?);

    // dropout with a fixed mask
    let x = randn((10, 10), rng) + 10.0;
    let param = DropoutParam::new(0.2, Mode::Train).with_seed(rng.random());
    let (out, cache) = dropout_forward(x.view(), param)?;
    let dout = randn(out.raw_dim(), rng);
    let dx = dropout_backward(dout.view(), &cache)?;
    let dropout = |x: &Array2<f64>| -> Out2 { Ok(dropout_forward(x.view(), param)?.0) };
    errors.push(check("dropout dx", &dx, dropout, &x, &dout)?);

    // convolution, both implementations
    let x = randn((2, 3, 7, 7), rng);
    let w = randn((4, 3, 3, 3), rng);
    let b = randn(4, rng);
    let conv_param = ConvParam::new(2, 1);
    let (out, cache) = conv_forward_im2col(x.view(), w.view(), b.view(), conv_param)?;
    let dout = randn(out.raw_dim(), rng);
    let (dx, dw, db) = conv_backward_im2col(dout.view(), &cache)?;
    let (_, naive_cache) = conv_forward_naive(x.view(), w.view(), b.view(), conv_param)?;
    let (dx_naive, _, _) = conv_backward_naive(dout.view(), &naive_cache)?;
    let conv = |x: &Array4<f64>, w: &Array4<f64>, b: &Array1<f64>| -> Out4 {
        Ok(conv_forward_naive(x.view(), w.view(), b.view(), conv_param)?.0)
    };
    errors.push(check("conv dx", &dx, |x| conv(x, &w, &b), &x, &dout)?);
    errors.push(check("conv dx (naive)", &dx_naive, |x| conv(x, &w, &b), &x, &dout)?);
    errors.push(check("conv dw", &dw, |w| conv(&x, w, &b), &w, &dout)?);
    errors.push(check("conv db", &db, |b| conv(&x, &w, b), &b, &dout)?);

    // max pooling
    let x = randn((3, 2, 8, 8), rng);
    let pool_param = PoolParam::default();
    let (out, cache) = max_pool_forward_naive(x.view(), pool_param)?;
    let dout = randn(out.raw_dim(), rng);
    let dx = max_pool_backward_naive(dout.view(), &cache)?;
    let pool = |x: &Array4<f64>| -> Out4 { Ok(max_pool_forward_naive(x.view(), pool_param)?.0) };
    errors.push(check("max pool dx", &dx, pool, &x, &dout)?);

    // spatial batchnorm
    let x = randn((2, 3, 4, 5), rng) * 4.0 + 10.0;
    let gamma = randn(3, rng);
    let beta = randn(3, rng);
    let sbn = |x: &Array4<f64>, gamma: &Array1<f64>, beta: &Array1<f64>| -> Out4 {
        let mut param = BatchNormParam::new(Mode::Train);
        Ok(spatial_batchnorm_forward(x.view(), gamma.view(), beta.view(), &mut param)?.0)
    };
    let mut param = BatchNormParam::new(Mode::Train);
    let (out, cache) =
        spatial_batchnorm_forward(x.view(), gamma.view(), beta.view(), &mut param)?;
    let dout = randn(out.raw_dim(), rng);
    let (dx, dgamma, dbeta) = spatial_batchnorm_backward(dout.view(), &cache)?;
    errors.push(check("spatial batchnorm dx", &dx, |x| sbn(x, &gamma, &beta), &x, &dout)?);
    errors.push(check(
        "spatial batchnorm dgamma",
        &dgamma,
        |g| sbn(&x, g, &beta),
        &gamma,
        &dout,
    )?);
    errors.push(check(
        "spatial batchnorm dbeta",
        &dbeta,
        |b| sbn(&x, &gamma, b),
        &beta,
        &dout,
    )?);

    // recurrent layers
    let (n, t, d, h) = (2, 4, 3, 5);
    let x = randn((n, t, d), rng);
    let h0 = randn((n, h), rng);
    let dout = randn((n, t, h), rng);
    for cell in [CellType::Rnn, CellType::Lstm] {
        let gates = cell.gates();
        let wx = randn((d, gates * h), rng);
        let wh = randn((h, gates * h), rng);
        let b = randn(gates * h, rng);
        let forward = |x: &Array3<f64>,
                       h0: &Array2<f64>,
                       wx: &Array2<f64>,
                       wh: &Array2<f64>,
                       b: &Array1<f64>|
         -> Out3 {
            let (x, h0, wx, wh, b) = (x.view(), h0.view(), wx.view(), wh.view(), b.view());
            Ok(match cell {
                CellType::Rnn => rnn_forward(x, h0, wx, wh, b)?.0,
                CellType::Lstm => lstm_forward(x, h0, wx, wh, b)?.0,
            })
        };
        let (xv, h0v, wxv, whv, bv) = (x.view(), h0.view(), wx.view(), wh.view(), b.view());
        let grads = match cell {
            CellType::Rnn => rnn_backward(dout.view(), &rnn_forward(xv, h0v, wxv, whv, bv)?.1)?,
            CellType::Lstm => {
                lstm_backward(dout.view(), &lstm_forward(xv, h0v, wxv, whv, bv)?.1)?
            }
        };
        let name = |grad: &str| format!("{} {}", cell, grad);
        let dx_f = |x: &Array3<f64>| forward(x, &h0, &wx, &wh, &b);
        let dh0_f = |h0: &Array2<f64>| forward(&x, h0, &wx, &wh, &b);
        let dwx_f = |wx: &Array2<f64>| forward(&x, &h0, wx, &wh, &b);
        let dwh_f = |wh: &Array2<f64>| forward(&x, &h0, &wx, wh, &b);
        let db_f = |b: &Array1<f64>| forward(&x, &h0, &wx, &wh, b);
        errors.push(check(&name("dx"), &grads.dx, dx_f, &x, &dout)?);
        errors.push(check(&name("dh0"), &grads.dh0, dh0_f, &h0, &dout)?);
        errors.push(check(&name("dwx"), &grads.dwx, dwx_f, &wx, &dout)?);
        errors.push(check(&name("dwh"), &grads.dwh, dwh_f, &wh, &dout)?);
        errors.push(check(&name("db"), &grads.db, db_f, &b, &dout)?);
    }

    // word embedding
    let (vocab_size, dim) = (6, 4);
    let words = Array2::from_shape_simple_fn((3, 5), || rng.random_range(0..vocab_size));
    let w = randn((vocab_size, dim), rng);
    let (out, cache) = word_embedding_forward(words.view(), w.view())?;
    let dout = randn(out.raw_dim(), rng);
    let dw = word_embedding_backward(dout.view(), &cache)?;
    let embed = |w: &Array2<f64>| -> Out3 { Ok(word_embedding_forward(words.view(), w.view())?.0) };
    errors.push(check("word embedding dw", &dw, embed, &w, &dout)?);

    // temporal affine
    let x = randn((2, 3, 4), rng);
    let w = randn((4, 6), rng);
    let b = randn(6, rng);
    let (out, cache) = temporal_affine_forward(x.view(), w.view(), b.view())?;
    let dout = randn(out.raw_dim(), rng);
    let (dx, dw, db) = temporal_affine_backward(dout.view(), &cache)?;
    let temporal = |x: &Array3<f64>, w: &Array2<f64>, b: &Array1<f64>| -> Out3 {
        Ok(temporal_affine_forward(x.view(), w.view(), b.view())?.0)
    };
    errors.push(check("temporal affine dx", &dx, |x| temporal(x, &w, &b), &x, &dout)?);
    errors.push(check("temporal affine dw", &dw, |w| temporal(&x, w, &b), &w, &dout)?);
    errors.push(check("temporal affine db", &db, |b| temporal(&x, &w, b), &b, &dout)?);

    // losses
    let scores = randn((8, 5), rng);
    let labels: Vec<usize> = (0..8).map(|_| rng.random_range(0..5)).collect();
    let (_, dx) = softmax_loss(scores.view(), &labels)?;
    let softmax = |x: &Array2<f64>| -> Scalar { Ok(arr0(softmax_loss(x.view(), &labels)?.0)) };
    errors.push(check("softmax loss dx", &dx, softmax, &scores, &one)?);
    let (_, dx) = svm_loss(scores.view(), &labels)?;
    let svm = |x: &Array2<f64>| -> Scalar { Ok(arr0(svm_loss(x.view(), &labels)?.0)) };
    errors.push(check("svm loss dx", &dx, svm, &scores, &one)?);

    let scores = randn((3, 4, 5), rng);
    let targets = Array2::from_shape_simple_fn((3, 4), || rng.random_range(0..5));
    let mask = Array2::from_shape_simple_fn((3, 4), || rng.random_bool(0.7));
    let (_, dx) = temporal_softmax_loss(scores.view(), targets.view(), mask.view())?;
    let temporal_loss = |x: &Array3<f64>| -> Scalar {
        Ok(arr0(temporal_softmax_loss(x.view(), targets.view(), mask.view())?.0))
    };
    errors.push(check("temporal softmax loss dx", &dx, temporal_loss, &scores, &one)?);

    let worst = errors.iter().copied().fold(0.0, f64::max);
    if worst > 1e-5 {
        log::warn!("largest relative error {:.2e} over {} checks", worst, errors.len());
    } else {
        log::info!("largest relative error {:.2e} over {} checks", worst, errors.len());
    }
    Ok(())
}
