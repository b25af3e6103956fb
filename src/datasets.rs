//! Generates small synthetic datasets for the models and plots training curves
//!
//! Image datasets are (N, C, H, W) with labels in `0..num_classes`. Caption data pairs
//! feature vectors with word id sequences.

use std::{
    error::Error,
    fmt::{self, Display},
};

use clap::ValueEnum;
use ndarray::{Array2, Array4, s};
use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, IntoDrawingArea, LineSeries},
    style::{BLUE, WHITE},
};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{nn::NNError, rnn::Vocab};

/// Toggles between image dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    /// Horizontal (0) or vertical (1) stripes
    Stripes,
    /// The bright quadrant is the label: top left, top right, bottom left, bottom right
    Quadrants,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Stripes => write!(f, "stripes"),
            Dataset::Quadrants => write!(f, "quadrants"),
        }
    }
}

impl Dataset {
    pub fn num_classes(self) -> usize {
        match self {
            Dataset::Stripes => 2,
            Dataset::Quadrants => 4,
        }
    }
}

/// Image shape and noise level of a generated dataset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageSpec {
    pub channels: usize,
    /// Height and width
    pub size: usize,
    /// Standard deviation of the Gaussian pixel noise
    pub noise: f64,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            channels: 3,
            size: 16,
            noise: 0.3,
        }
    }
}

/// Generates `class_size` images per class, interleaved so that consecutive examples
/// cycle through the classes
pub fn load_dataset<R: Rng>(
    dataset: Dataset,
    class_size: usize,
    spec: ImageSpec,
    rng: &mut R,
) -> Result<(Array4<f64>, Vec<usize>), NNError> {
    if spec.size < 2 {
        return Err(NNError::InvalidParameter {
            name: "image size",
            reason: format!("{} is smaller than 2", spec.size),
        });
    }
    if !(spec.noise >= 0.0 && spec.noise.is_finite()) {
        return Err(NNError::InvalidParameter {
            name: "noise",
            reason: format!("must be finite and non-negative, got {}", spec.noise),
        });
    }
    let noise = Normal::new(0.0, spec.noise).map_err(|e| NNError::InvalidParameter {
        name: "noise",
        reason: e.to_string(),
    })?;

    let classes = dataset.num_classes();
    let n = classes * class_size;
    let labels: Vec<usize> = (0..n).map(|i| i % classes).collect();
    let mut images = Array4::zeros((n, spec.channels, spec.size, spec.size));
    for (mut image, &label) in images.outer_iter_mut().zip(labels.iter()) {
        match dataset {
            Dataset::Stripes => {
                // random phase so the class is not given away by a single pixel
                let phase = rng.random_range(0..2);
                for ((_, i, j), v) in image.indexed_iter_mut() {
                    let line = if label == 0 { i } else { j };
                    *v = if (line + phase) % 2 == 0 { 1.0 } else { -1.0 };
                }
            }
            Dataset::Quadrants => {
                let half = spec.size / 2;
                let (row, col) = (label / 2 * half, label % 2 * half);
                image
                    .slice_mut(s![.., row..row + half, col..col + half])
                    .fill(1.0);
            }
        }
        image.mapv_inplace(|v| v + noise.sample(&mut *rng));
    }
    log::debug!(
        "generated {} {} images of size {}x{}",
        n,
        dataset,
        spec.size,
        spec.size
    );
    Ok((images, labels))
}

const DIGITS: [&str; 10] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
];

/// Features, captions and vocabulary for a captioning task
#[derive(Debug, Clone)]
pub struct CaptionData {
    pub vocab: Vocab,
    /// (N, 10 + max_words)
    pub features: Array2<f64>,
    /// (N, max_words + 2)
    pub captions: Array2<usize>,
}

/// Counting captions: the features one-hot encode a start digit and a count, and the
/// caption counts up from the start digit (wrapping after nine), e.g.
/// `<START> seven eight nine zero <END>`.
pub fn counting_captions<R: Rng>(
    n: usize,
    max_words: usize,
    rng: &mut R,
) -> Result<CaptionData, NNError> {
    if max_words == 0 {
        return Err(NNError::InvalidParameter {
            name: "max words",
            reason: "captions need at least one word".to_string(),
        });
    }
    let vocab = Vocab::new(DIGITS);
    let digit_ids: Vec<usize> = DIGITS
        .iter()
        .map(|d| vocab.index_of(d).unwrap_or(vocab.null()))
        .collect();

    let mut features = Array2::zeros((n, DIGITS.len() + max_words));
    let mut captions = Array2::from_elem((n, max_words + 2), vocab.null());
    for i in 0..n {
        let start = rng.random_range(0..DIGITS.len());
        let count = rng.random_range(1..=max_words);
        features[[i, start]] = 1.0;
        features[[i, DIGITS.len() + count - 1]] = 1.0;

        captions[[i, 0]] = vocab.start();
        for k in 0..count {
            captions[[i, k + 1]] = digit_ids[(start + k) % DIGITS.len()];
        }
        captions[[i, count + 1]] = vocab.end();
    }
    Ok(CaptionData {
        vocab,
        features,
        captions,
    })
}

/// Plots the loss of every training iteration
pub fn plot_loss_history(
    loss_history: &[f64],
    file_name: &str,
    title: &str,
) -> Result<(), Box<dyn Error>> {
    if loss_history.is_empty() {
        return Err("no losses to plot".into());
    }
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let max_loss = loss_history.iter().copied().fold(f64::MIN, f64::max);
    let min_loss = loss_history.iter().copied().fold(f64::MAX, f64::min);
    let mut chart = ChartBuilder::on(&root_area)
        .caption(title, ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(0..loss_history.len(), min_loss.min(0.0)..max_loss * 1.05)?;

    chart
        .configure_mesh()
        .x_desc("iteration")
        .y_desc("loss")
        .draw()?;
    chart.draw_series(LineSeries::new(
        loss_history.iter().copied().enumerate(),
        &BLUE,
    ))?;

    root_area.present()?;
    log::info!("Loss plot has been saved to '{}'.", file_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::Axis;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    #[test]
    fn test_stripes() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let spec = ImageSpec {
            channels: 1,
            size: 4,
            noise: 0.0,
        };
        let (x, y) = load_dataset(Dataset::Stripes, 3, spec, &mut rng).unwrap();
        assert_eq!(x.dim(), (6, 1, 4, 4));
        assert_eq!(y, vec![0, 1, 0, 1, 0, 1]);
        for (image, &label) in x.outer_iter().zip(y.iter()) {
            let image = image.index_axis(Axis(0), 0);
            // horizontal stripes are constant along rows, vertical along columns
            let along = if label == 0 { Axis(1) } else { Axis(0) };
            for lane in image.lanes(along) {
                assert!(lane.iter().all(|&v| v == lane[0]));
            }
        }
    }

    #[test]
    fn test_quadrants() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let spec = ImageSpec {
            noise: 0.1,
            ..ImageSpec::default()
        };
        let (x, y) = load_dataset(Dataset::Quadrants, 5, spec, &mut rng).unwrap();
        assert_eq!(x.dim(), (20, 3, 16, 16));
        for (image, &label) in x.outer_iter().zip(y.iter()) {
            let quadrant_means: Vec<f64> = [(0, 0), (0, 8), (8, 0), (8, 8)]
                .iter()
                .map(|&(r, c)| {
                    image
                        .slice(s![.., r..r + 8, c..c + 8])
                        .mean()
                        .unwrap_or(0.0)
                })
                .collect();
            let brightest = crate::nn::argmax_rows(
                &Array2::from_shape_vec((1, 4), quadrant_means).unwrap(),
            )[0];
            assert_eq!(brightest, label);
        }
    }

    #[test]
    fn test_invalid_spec() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        for noise in [-1.0, f64::NAN] {
            let spec = ImageSpec {
                noise,
                ..ImageSpec::default()
            };
            assert!(matches!(
                load_dataset(Dataset::Stripes, 2, spec, &mut rng),
                Err(NNError::InvalidParameter { name: "noise", .. })
            ));
        }
        let spec = ImageSpec {
            size: 1,
            ..ImageSpec::default()
        };
        assert!(load_dataset(Dataset::Quadrants, 2, spec, &mut rng).is_err());
    }

    #[test]
    fn test_counting_captions() {
        let mut rng = Pcg64Mcg::seed_from_u64(4);
        let data = counting_captions(50, 4, &mut rng).unwrap();
        assert_eq!(data.features.dim(), (50, 14));
        assert_eq!(data.captions.dim(), (50, 6));
        assert_eq!(data.vocab.len(), 13);

        for (features, caption) in data.features.outer_iter().zip(data.captions.outer_iter()) {
            assert_eq!(caption[0], data.vocab.start());
            assert_eq!(features.sum(), 2.0);
            let start = (0..10).find(|&d| features[d] == 1.0).unwrap();
            let count = (0..4).find(|&k| features[10 + k] == 1.0).unwrap() + 1;

            let text = data.vocab.decode(&caption.to_vec());
            let words: Vec<&str> = text.split(' ').collect();
            assert_eq!(words.len(), count);
            assert_eq!(words[0], DIGITS[start]);
            assert_eq!(words[count - 1], DIGITS[(start + count - 1) % 10]);
        }
    }

    #[test]
    fn test_plot_empty_history() {
        assert!(plot_loss_history(&[], "unused.png", "loss").is_err());
    }
}
