//! Autoregressive decoding for encoder-decoder checkpoints: greedy or
//! sampled when `num_beams == 1`, beam search otherwise.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use log::debug;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::HashMap;

const LOG_TARGET: &str = "generation";
const INITIAL_WORST_SCORE: f32 = 1e9;

fn default_max_length() -> usize {
    20
}

fn default_num_beams() -> usize {
    1
}

fn default_length_penalty() -> f64 {
    1.0
}

fn default_temperature() -> f64 {
    1.0
}

fn default_eos_token_id() -> u32 {
    1
}

fn default_seed() -> u64 {
    299792458
}

/// Decoding settings, read from the generation keys of a checkpoint's
/// `config.json`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub min_length: usize,
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f64,
    #[serde(default)]
    pub no_repeat_ngram_size: usize,
    #[serde(default)]
    pub early_stopping: bool,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    #[serde(default)]
    pub decoder_start_token_id: Option<u32>,
    #[serde(default)]
    pub forced_eos_token_id: Option<u32>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            min_length: 0,
            num_beams: default_num_beams(),
            length_penalty: default_length_penalty(),
            no_repeat_ngram_size: 0,
            early_stopping: false,
            do_sample: false,
            temperature: default_temperature(),
            top_k: None,
            top_p: None,
            pad_token_id: 0,
            eos_token_id: default_eos_token_id(),
            decoder_start_token_id: None,
            forced_eos_token_id: None,
            seed: default_seed(),
        }
    }
}

impl GenerationConfig {
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_num_beams(mut self, num_beams: usize) -> Self {
        self.num_beams = num_beams;
        self
    }

    /// Decoding starts from the pad token unless the checkpoint names another.
    pub fn start_token(&self) -> u32 {
        self.decoder_start_token_id.unwrap_or(self.pad_token_id)
    }

    /// Token forced at the last position; Pegasus checkpoints end on EOS.
    pub fn forced_eos(&self) -> u32 {
        self.forced_eos_token_id.unwrap_or(self.eos_token_id)
    }

    /// Rows the decoder has to hold for a batch.
    pub fn rows(&self, batch_size: usize) -> usize {
        batch_size * self.num_beams.max(1)
    }

    fn sampling(&self) -> Sampling {
        if !self.do_sample || self.temperature <= 0. {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        match (self.top_k, self.top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }
}

/// A decoder that produces next-token logits one position at a time.
pub trait StepDecoder {
    /// Logits `(rows, vocab)` after feeding each row's latest token at
    /// `position`.
    fn step(&mut self, tokens: &[u32], position: usize) -> Result<Tensor>;

    /// Rearranges cached state so row `i` continues from row `rows[i]`.
    fn reorder(&mut self, rows: &[usize]) -> Result<()>;
}

/// Tokens that would repeat an n-gram already present in `sequence`.
pub fn banned_ngram_tokens(sequence: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || sequence.len() + 1 < n {
        return vec![];
    }
    let mut seen: HashMap<&[u32], Vec<u32>> = HashMap::new();
    for ngram in sequence.windows(n) {
        seen.entry(&ngram[..n - 1]).or_default().push(ngram[n - 1]);
    }
    let suffix = &sequence[sequence.len() + 1 - n..];
    seen.get(suffix).cloned().unwrap_or_default()
}

/// Indices and values of the `k` largest scores, best first.
fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    let by_score = |a: &(usize, f32), b: &(usize, f32)| b.1.total_cmp(&a.1);
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k, by_score);
        indexed.truncate(k);
    }
    indexed.sort_by(by_score);
    indexed
}

fn log_softmax_rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    let logits = logits.to_dtype(DType::F32)?;
    let scores = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    Ok(scores.to_vec2::<f32>()?)
}

/// Length-normalised finished hypotheses of one batch item.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    num_beams: usize,
    length_penalty: f64,
    early_stopping: bool,
    beams: Vec<(f32, Vec<u32>)>,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(num_beams: usize, length_penalty: f64, early_stopping: bool) -> Self {
        Self {
            num_beams,
            length_penalty,
            early_stopping,
            beams: vec![],
            worst_score: INITIAL_WORST_SCORE,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    fn normalise(&self, sum_logprobs: f32, length: usize) -> f32 {
        sum_logprobs / (length as f32).powf(self.length_penalty as f32)
    }

    pub fn add(&mut self, hypothesis: Vec<u32>, sum_logprobs: f32) {
        let score = self.normalise(sum_logprobs, hypothesis.len());
        if self.len() < self.num_beams || score > self.worst_score {
            self.beams.push((score, hypothesis));
            if self.len() > self.num_beams {
                let mut ranked: Vec<(f32, usize)> = self
                    .beams
                    .iter()
                    .enumerate()
                    .map(|(i, (s, _))| (*s, i))
                    .collect();
                ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
                self.beams.remove(ranked[0].1);
                self.worst_score = ranked[1].0;
            } else {
                self.worst_score = score.min(self.worst_score);
            }
        }
    }

    /// No pending beam can still beat the worst kept hypothesis.
    pub fn is_done(&self, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.len() < self.num_beams {
            false
        } else if self.early_stopping {
            true
        } else {
            self.worst_score >= self.normalise(best_sum_logprobs, cur_len)
        }
    }

    pub fn best(&self) -> Option<&Vec<u32>> {
        self.beams
            .iter()
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
            .map(|(_, h)| h)
    }
}

/// Applies length constraints and n-gram bans to one row of log-probs.
fn process_scores(config: &GenerationConfig, sequence: &[u32], scores: &mut [f32]) {
    let cur_len = sequence.len();
    let eos = config.eos_token_id as usize;

    if cur_len < config.min_length && eos < scores.len() {
        scores[eos] = f32::NEG_INFINITY;
    }

    for banned in banned_ngram_tokens(sequence, config.no_repeat_ngram_size) {
        if let Some(s) = scores.get_mut(banned as usize) {
            *s = f32::NEG_INFINITY;
        }
    }

    let forced = config.forced_eos() as usize;
    if cur_len + 1 == config.max_length && forced < scores.len() {
        scores.fill(f32::NEG_INFINITY);
        scores[forced] = 0.;
    }
}

/// Decodes `batch_size` inputs the decoder was prepared for. Returned
/// sequences start with the decoder start token.
pub fn generate<D: StepDecoder>(
    decoder: &mut D,
    config: &GenerationConfig,
    batch_size: usize,
) -> Result<Vec<Vec<u32>>> {
    if config.max_length < 1 {
        bail!("🐔 max_length must be at least 1");
    }
    if batch_size == 0 {
        return Ok(vec![]);
    }
    if config.num_beams > 1 {
        beam_search(decoder, config, batch_size)
    } else {
        greedy_search(decoder, config, batch_size)
    }
}

fn greedy_search<D: StepDecoder>(
    decoder: &mut D,
    config: &GenerationConfig,
    batch_size: usize,
) -> Result<Vec<Vec<u32>>> {
    let mut logits_processor = LogitsProcessor::from_sampling(config.seed, config.sampling());
    let mut sequences = vec![vec![config.start_token()]; batch_size];
    let mut finished = vec![false; batch_size];

    while sequences[0].len() < config.max_length {
        let cur_len = sequences[0].len();
        let tokens: Vec<u32> = sequences
            .iter()
            .zip(&finished)
            .map(|(s, done)| if *done { config.pad_token_id } else { s[cur_len - 1] })
            .collect();
        let scores = log_softmax_rows(&decoder.step(&tokens, cur_len - 1)?)?;

        for (row, mut row_scores) in scores.into_iter().enumerate() {
            if finished[row] {
                sequences[row].push(config.pad_token_id);
                continue;
            }
            process_scores(config, &sequences[row], &mut row_scores);
            let row_scores = Tensor::new(row_scores.as_slice(), &Device::Cpu)?;
            let next = logits_processor.sample(&row_scores)?;
            sequences[row].push(next);
            finished[row] = next == config.eos_token_id;
        }

        if finished.iter().all(|f| *f) {
            break;
        }
    }

    for sequence in sequences.iter_mut() {
        if let Some(eos) = sequence.iter().position(|t| *t == config.eos_token_id) {
            sequence.truncate(eos + 1);
        }
    }
    Ok(sequences)
}

fn beam_search<D: StepDecoder>(
    decoder: &mut D,
    config: &GenerationConfig,
    batch_size: usize,
) -> Result<Vec<Vec<u32>>> {
    let num_beams = config.num_beams;
    let rows = config.rows(batch_size);
    let eos = config.eos_token_id;

    let mut sequences = vec![vec![config.start_token()]; rows];
    // only the first beam is live until the first step fans it out
    let mut beam_scores: Vec<f32> = (0..rows)
        .map(|row| if row % num_beams == 0 { 0. } else { -1e9 })
        .collect();
    let mut hypotheses: Vec<BeamHypotheses> = (0..batch_size)
        .map(|_| BeamHypotheses::new(num_beams, config.length_penalty, config.early_stopping))
        .collect();
    let mut done = vec![false; batch_size];

    let mut cur_len = 1;
    while cur_len < config.max_length {
        let tokens: Vec<u32> = sequences.iter().map(|s| s[cur_len - 1]).collect();
        let mut scores = log_softmax_rows(&decoder.step(&tokens, cur_len - 1)?)?;

        let mut next_tokens = Vec::with_capacity(rows);
        let mut next_scores = Vec::with_capacity(rows);
        let mut next_rows = Vec::with_capacity(rows);

        for batch in 0..batch_size {
            let first_row = batch * num_beams;
            if done[batch] {
                for beam in 0..num_beams {
                    next_tokens.push(config.pad_token_id);
                    next_scores.push(0.);
                    next_rows.push(first_row + beam);
                }
                continue;
            }

            let mut candidates: Vec<(f32, usize, u32)> = vec![];
            for row in first_row..first_row + num_beams {
                process_scores(config, &sequences[row], &mut scores[row]);
                for (token, score) in top_k(&scores[row], 2 * num_beams) {
                    candidates.push((score + beam_scores[row], row, token as u32));
                }
            }
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates.truncate(2 * num_beams);

            let mut picked = 0;
            for (rank, (score, row, token)) in candidates.iter().copied().enumerate() {
                if token == eos {
                    if rank >= num_beams {
                        continue;
                    }
                    hypotheses[batch].add(sequences[row].clone(), score);
                } else {
                    next_tokens.push(token);
                    next_scores.push(score);
                    next_rows.push(row);
                    picked += 1;
                }
                if picked == num_beams {
                    break;
                }
            }
            if picked < num_beams {
                bail!("🐔 beam search ran out of candidates for batch item {batch}");
            }

            let best = candidates.first().map_or(f32::NEG_INFINITY, |c| c.0);
            done[batch] = hypotheses[batch].is_done(best, cur_len);
        }

        if done.iter().all(|d| *d) {
            debug!(target: LOG_TARGET, "all beams finished at length {}", cur_len);
            break;
        }

        sequences = next_rows
            .iter()
            .zip(&next_tokens)
            .map(|(row, token)| {
                let mut s = sequences[*row].clone();
                s.push(*token);
                s
            })
            .collect();
        beam_scores = next_scores;
        decoder.reorder(&next_rows)?;
        cur_len += 1;
    }

    let mut outputs = Vec::with_capacity(batch_size);
    for (batch, hyps) in hypotheses.iter_mut().enumerate() {
        if !done[batch] {
            for row in batch * num_beams..(batch + 1) * num_beams {
                hyps.add(sequences[row].clone(), beam_scores[row]);
            }
        }
        let mut best = hyps.best().cloned().unwrap_or_default();
        if best.len() < config.max_length {
            best.push(eos);
        }
        outputs.push(best);
    }
    Ok(outputs)
}
