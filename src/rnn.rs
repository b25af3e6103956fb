//! Recurrent sequence model that generates captions from feature vectors

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use clap::ValueEnum;
use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2, s};
use rand::Rng;

use crate::{
    layers::{affine_backward, affine_forward},
    nn::{Model, NNError, Params, argmax_rows, init_normal, param_view},
    rnn_layers::{
        LstmCache, RnnCache, RnnGrads, lstm_backward, lstm_forward, lstm_step_forward,
        rnn_backward, rnn_forward, rnn_step_forward, temporal_affine_backward,
        temporal_affine_forward, temporal_softmax_loss, word_embedding_backward,
        word_embedding_forward,
    },
};

pub const NULL_TOKEN: &str = "<NULL>";
pub const START_TOKEN: &str = "<START>";
pub const END_TOKEN: &str = "<END>";

/// Mapping between words and their integer ids. The padding, start and end tokens
/// always take ids 0, 1 and 2.
#[derive(Debug, Clone)]
pub struct Vocab {
    words: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocab {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self {
            words: vec![],
            index: HashMap::new(),
        };
        for word in [NULL_TOKEN, START_TOKEN, END_TOKEN] {
            vocab.push(word.to_string());
        }
        for word in words {
            vocab.push(word.into());
        }
        vocab
    }

    fn push(&mut self, word: String) {
        if !self.index.contains_key(&word) {
            self.index.insert(word.clone(), self.words.len());
            self.words.push(word);
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn null(&self) -> usize {
        0
    }

    pub fn start(&self) -> usize {
        1
    }

    pub fn end(&self) -> usize {
        2
    }

    pub fn index_of(&self, word: &str) -> Option<usize> {
        self.index.get(word).copied()
    }

    pub fn word(&self, idx: usize) -> Option<&str> {
        self.words.get(idx).map(String::as_str)
    }

    /// Encodes `<START> words... <END>` padded with `<NULL>` to `len` ids
    pub fn encode(&self, words: &[&str], len: usize) -> Result<Vec<usize>, NNError> {
        let mut ids = Vec::with_capacity(len);
        ids.push(self.start());
        for word in words {
            let id = self
                .index_of(word)
                .ok_or_else(|| NNError::InvalidParameter {
                    name: "caption",
                    reason: format!("unknown word \"{}\"", word),
                })?;
            ids.push(id);
        }
        ids.push(self.end());
        if ids.len() > len {
            return Err(NNError::InvalidParameter {
                name: "caption",
                reason: format!("{} tokens do not fit in {}", ids.len(), len),
            });
        }
        ids.resize(len, self.null());
        Ok(ids)
    }

    /// Turns ids back into text, skipping `<NULL>` and `<START>` and stopping at `<END>`
    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter()
            .take_while(|&&id| id != self.end())
            .filter(|&&id| id != self.null() && id != self.start())
            .map(|&id| self.word(id).unwrap_or("<UNK>"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Recurrence used by a [`CaptioningRnn`]
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellType {
    #[default]
    Rnn,
    Lstm,
}

impl Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellType::Rnn => write!(f, "rnn"),
            CellType::Lstm => write!(f, "lstm"),
        }
    }
}

impl CellType {
    /// Number of gate blocks packed into the recurrent weights
    pub fn gates(self) -> usize {
        match self {
            CellType::Rnn => 1,
            CellType::Lstm => 4,
        }
    }
}

/// Sizes of a [`CaptioningRnn`]
#[derive(Debug, Clone, PartialEq)]
pub struct CaptioningRnnConfig {
    /// Dimension of the input feature vectors
    pub input_dim: usize,
    pub wordvec_dim: usize,
    pub hidden_dim: usize,
    pub cell_type: CellType,
}

impl Default for CaptioningRnnConfig {
    fn default() -> Self {
        Self {
            input_dim: 512,
            wordvec_dim: 128,
            hidden_dim: 128,
            cell_type: CellType::Rnn,
        }
    }
}

enum RecurrentCache {
    Rnn(RnnCache),
    Lstm(LstmCache),
}

/// Projects a feature vector to the initial hidden state, then predicts the next word of
/// the caption at every timestep.
#[derive(Debug, Clone)]
pub struct CaptioningRnn {
    config: CaptioningRnnConfig,
    vocab_size: usize,
    null: usize,
    start: usize,
    params: Params,
}

impl CaptioningRnn {
    pub fn new<R: Rng>(
        vocab: &Vocab,
        config: CaptioningRnnConfig,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        let v = vocab.len();
        let (d, w, h) = (config.input_dim, config.wordvec_dim, config.hidden_dim);
        let gates = config.cell_type.gates();
        let fan_in = |n: usize| 1.0 / (n.max(1) as f64).sqrt();

        let mut params = Params::new();
        params.insert("W_embed".to_string(), init_normal((v, w), 0.01, rng)?);
        params.insert("W_proj".to_string(), init_normal((d, h), fan_in(d), rng)?);
        params.insert("b_proj".to_string(), ArrayD::zeros(vec![h]));
        params.insert("Wx".to_string(), init_normal((w, gates * h), fan_in(w), rng)?);
        params.insert("Wh".to_string(), init_normal((h, gates * h), fan_in(h), rng)?);
        params.insert("b".to_string(), ArrayD::zeros(vec![gates * h]));
        params.insert("W_vocab".to_string(), init_normal((h, v), fan_in(h), rng)?);
        params.insert("b_vocab".to_string(), ArrayD::zeros(vec![v]));
        log::debug!("{} captioning model over {} words", config.cell_type, v);

        Ok(Self {
            config,
            vocab_size: v,
            null: vocab.null(),
            start: vocab.start(),
            params,
        })
    }

    pub fn config(&self) -> &CaptioningRnnConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Greedily decodes captions of `max_length` words for features of shape (N, D).
    /// Every sequence starts from `<START>`; words after an `<END>` are still produced
    /// and are dropped by [`Vocab::decode`].
    pub fn sample(
        &self,
        features: &Array2<f64>,
        max_length: usize,
    ) -> Result<Array2<usize>, NNError> {
        let w_proj = param_view::<Ix2>(&self.params, "W_proj")?;
        let b_proj = param_view::<Ix1>(&self.params, "b_proj")?;
        let w_embed = param_view::<Ix2>(&self.params, "W_embed")?;
        let wx = param_view::<Ix2>(&self.params, "Wx")?;
        let wh = param_view::<Ix2>(&self.params, "Wh")?;
        let b = param_view::<Ix1>(&self.params, "b")?;
        let w_vocab = param_view::<Ix2>(&self.params, "W_vocab")?;
        let b_vocab = param_view::<Ix1>(&self.params, "b_vocab")?;

        let n = features.nrows();
        let (mut h, _) = affine_forward(features.view(), w_proj, b_proj)?;
        let mut c = Array2::zeros(h.raw_dim());
        let mut words = vec![self.start; n];
        let mut captions = Array2::from_elem((n, max_length), self.null);

        for t in 0..max_length {
            let x = w_embed.select(Axis(0), &words);
            h = match self.config.cell_type {
                CellType::Rnn => rnn_step_forward(x.view(), h.view(), wx, wh, b)?.0,
                CellType::Lstm => {
                    let (next_h, next_c, _) =
                        lstm_step_forward(x.view(), h.view(), c.view(), wx, wh, b)?;
                    c = next_c;
                    next_h
                }
            };
            let scores = h.dot(&w_vocab) + &b_vocab;
            words = argmax_rows(&scores);
            captions.column_mut(t).assign(&Array1::from(words.clone()));
        }
        Ok(captions)
    }
}

impl Model for CaptioningRnn {
    /// Feature vectors (N, D)
    type Input = Array2<f64>;
    /// Word ids (N, T + 1) starting with `<START>` and padded with `<NULL>`
    type Target = Array2<usize>;

    fn params(&self) -> &Params {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// The model reads `captions[:, :-1]` and is scored against `captions[:, 1:]`.
    /// Targets equal to `<NULL>` are masked out of the loss.
    fn loss(
        &self,
        features: &Array2<f64>,
        captions: &Array2<usize>,
    ) -> Result<(f64, Params), NNError> {
        if captions.ncols() < 2 {
            return Err(NNError::InvalidParameter {
                name: "captions",
                reason: format!("need at least 2 tokens per caption, got {}", captions.ncols()),
            });
        }
        let captions_in = captions.slice(s![.., ..-1]);
        let captions_out = captions.slice(s![.., 1..]);
        let mask = captions_out.mapv(|word| word != self.null);

        let w_proj = param_view::<Ix2>(&self.params, "W_proj")?;
        let b_proj = param_view::<Ix1>(&self.params, "b_proj")?;
        let w_embed = param_view::<Ix2>(&self.params, "W_embed")?;
        let wx = param_view::<Ix2>(&self.params, "Wx")?;
        let wh = param_view::<Ix2>(&self.params, "Wh")?;
        let b = param_view::<Ix1>(&self.params, "b")?;
        let w_vocab = param_view::<Ix2>(&self.params, "W_vocab")?;
        let b_vocab = param_view::<Ix1>(&self.params, "b_vocab")?;

        let (h0, proj_cache) = affine_forward(features.view(), w_proj, b_proj)?;
        let (embedded, embed_cache) = word_embedding_forward(captions_in, w_embed)?;
        let (hs, recurrent_cache) = match self.config.cell_type {
            CellType::Rnn => {
                let (hs, cache) = rnn_forward(embedded.view(), h0.view(), wx, wh, b)?;
                (hs, RecurrentCache::Rnn(cache))
            }
            CellType::Lstm => {
                let (hs, cache) = lstm_forward(embedded.view(), h0.view(), wx, wh, b)?;
                (hs, RecurrentCache::Lstm(cache))
            }
        };
        let (scores, vocab_cache) = temporal_affine_forward(hs.view(), w_vocab, b_vocab)?;
        let (loss, dscores) = temporal_softmax_loss(scores.view(), captions_out, mask.view())?;

        let (dhs, dw_vocab, db_vocab) = temporal_affine_backward(dscores.view(), &vocab_cache)?;
        let RnnGrads {
            dx: dembedded,
            dh0,
            dwx,
            dwh,
            db,
        } = match &recurrent_cache {
            RecurrentCache::Rnn(cache) => rnn_backward(dhs.view(), cache)?,
            RecurrentCache::Lstm(cache) => lstm_backward(dhs.view(), cache)?,
        };
        let dw_embed = word_embedding_backward(dembedded.view(), &embed_cache)?;
        let (_, dw_proj, db_proj) = affine_backward(dh0.view(), &proj_cache)?;

        let mut grads = Params::new();
        grads.insert("W_proj".to_string(), dw_proj.into_dyn());
        grads.insert("b_proj".to_string(), db_proj.into_dyn());
        grads.insert("W_embed".to_string(), dw_embed.into_dyn());
        grads.insert("Wx".to_string(), dwx.into_dyn());
        grads.insert("Wh".to_string(), dwh.into_dyn());
        grads.insert("b".to_string(), db.into_dyn());
        grads.insert("W_vocab".to_string(), dw_vocab.into_dyn());
        grads.insert("b_vocab".to_string(), db_vocab.into_dyn());
        Ok((loss, grads))
    }
}
