use crate::common::{hf_hub_get, ResultExt};
use crate::hub::{RemoteTokenizerMeta, TOKENIZER_CONFIG_FILE, UNBOUNDED_LENGTH};
use anyhow::Result;
use candle_core::{Device, Tensor};
use log::{debug, warn};
use tokenizers::{Encoding, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

pub const TOKENIZER_FILE: &str = "tokenizer.json";

#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    /// Cut inputs at `max_length`, or at the tokenizer ceiling without one.
    pub truncation: bool,
    pub max_length: Option<usize>,
    /// Pad every row to the longest one in the batch.
    pub padding: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchEncoding {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

impl BatchEncoding {
    /// `(rows, longest row)`
    pub fn shape(&self) -> (usize, usize) {
        let width = self.input_ids.iter().map(Vec::len).max().unwrap_or(0);
        (self.input_ids.len(), width)
    }

    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let (rows, width) = self.shape();
        if self.input_ids.iter().any(|ids| ids.len() != width) {
            anyhow::bail!("🐔 batch rows differ in length, encode with padding");
        }
        let ids: Vec<u32> = self.input_ids.iter().flatten().copied().collect();
        let mask: Vec<u32> = self.attention_mask.iter().flatten().copied().collect();
        let ids = Tensor::from_vec(ids, (rows, width), device)?;
        let mask = Tensor::from_vec(mask, (rows, width), device)?;
        Ok((ids, mask))
    }
}

#[derive(Clone)]
pub struct TokenizerWrapper {
    pub tokenizer: Tokenizer,
    pub model_max_length: usize,
}

impl TokenizerWrapper {
    pub fn new(tokenizer: Tokenizer, model_max_length: usize) -> Self {
        Self {
            tokenizer,
            model_max_length,
        }
    }

    pub fn from_hub(
        repo_id: &str,
        tokenizer_file: Option<&str>,
        revision: Option<String>,
        hf_token: Option<String>,
    ) -> Result<Self> {
        let file = tokenizer_file.unwrap_or(TOKENIZER_FILE);
        let bytes = hf_hub_get(repo_id, file, hf_token.clone(), revision.clone())?;
        let tokenizer = Tokenizer::from_bytes(bytes).map_anyhow_err()?;

        let tokenizer_config = match hf_hub_get(repo_id, TOKENIZER_CONFIG_FILE, hf_token, revision)
        {
            Ok(bytes) => Some(serde_json::from_slice::<serde_json::Value>(&bytes)?),
            Err(e) => {
                warn!(target: "tokenizers", "no {} for {}: {}", TOKENIZER_CONFIG_FILE, repo_id, e);
                None
            }
        };
        let meta = RemoteTokenizerMeta::resolve(repo_id, tokenizer_config.as_ref());
        debug!(target: "tokenizers", "🤗 {} model_max_length {}", repo_id, meta.model_max_length);

        Ok(Self::new(tokenizer, meta.model_max_length))
    }

    pub fn encode(&self, text: &str) -> Result<Encoding, tokenizers::Error> {
        self.tokenizer.encode(text, true)
    }

    pub fn count(&self, text: &str) -> Result<usize, tokenizers::Error> {
        let encoding = self.encode(text)?;
        Ok(encoding.len())
    }

    pub fn encode_batch(&self, texts: &[String], options: EncodeOptions) -> Result<BatchEncoding> {
        let mut tokenizer = self.tokenizer.clone();

        let max_length = match (options.truncation, options.max_length) {
            (false, _) => None,
            (true, Some(max_length)) => Some(max_length),
            (true, None) if self.model_max_length != UNBOUNDED_LENGTH => {
                Some(self.model_max_length)
            }
            (true, None) => None,
        };
        let truncation = max_length.map(|max_length| TruncationParams {
            max_length,
            ..Default::default()
        });
        tokenizer.with_truncation(truncation).map_anyhow_err()?;

        if options.padding {
            if let Some(pp) = tokenizer.get_padding_mut() {
                pp.strategy = PaddingStrategy::BatchLongest
            } else {
                let pad_id = tokenizer.token_to_id("<pad>").unwrap_or(0);
                let pp = PaddingParams {
                    strategy: PaddingStrategy::BatchLongest,
                    pad_id,
                    pad_token: "<pad>".to_string(),
                    ..Default::default()
                };
                tokenizer.with_padding(Some(pp));
            }
        } else {
            tokenizer.with_padding(None);
        }

        let encodings = tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_anyhow_err()?;

        Ok(BatchEncoding {
            input_ids: encodings.iter().map(|e| e.get_ids().to_vec()).collect(),
            attention_mask: encodings
                .iter()
                .map(|e| e.get_attention_mask().to_vec())
                .collect(),
        })
    }

    pub fn decode_batch(
        &self,
        sequences: &[Vec<u32>],
        skip_special_tokens: bool,
    ) -> Result<Vec<String>> {
        let sequences: Vec<&[u32]> = sequences.iter().map(Vec::as_slice).collect();
        self.tokenizer
            .decode_batch(&sequences, skip_special_tokens)
            .map_anyhow_err()
    }
}
