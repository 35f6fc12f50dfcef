pub mod generation;
pub mod pegasus;

use crate::common::{hf_hub_get, hf_hub_get_path, parse_device, parse_dtype, ResultExt};
use crate::hub::{CONFIG_FILE, UNBOUNDED_LENGTH};
use crate::tokenizers::{BatchEncoding, EncodeOptions, TokenizerWrapper};
use anyhow::{bail, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use generation::{generate, GenerationConfig};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use pegasus::{DecodingSession, PegasusForConditionalGeneration};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

static SEQ2SEQ_INSTANCES: OnceCell<Mutex<HashMap<String, Arc<Mutex<Seq2SeqModel>>>>> =
    OnceCell::new();

pub const DEFAULT_CHECKPOINT: &str = "google/pegasus-xsum";
pub const SAFETENSORS_FILE: &str = "model.safetensors";
pub const PYTORCH_FILE: &str = "pytorch_model.bin";

const LOG_TARGET: &str = "seq2seq";

#[derive(Clone, Debug)]
pub struct Seq2SeqSpec {
    pub name: String,
    pub model_id: Option<String>,
    pub revision: Option<String>,
    pub device: Option<String>,
    pub dtype: Option<String>,
    /// Comma separated local weight files; resolved on the hub when unset.
    pub model_file: Option<String>,
    pub tokenizer_file: Option<String>,
    pub hf_token: Option<String>,
}

impl Default for Seq2SeqSpec {
    fn default() -> Self {
        Self {
            name: DEFAULT_CHECKPOINT.to_string(),
            model_id: None,
            revision: None,
            device: None,
            dtype: None,
            model_file: None,
            tokenizer_file: None,
            hf_token: None,
        }
    }
}

impl Seq2SeqSpec {
    pub fn new(name: &str, model_id: &str) -> Self {
        Self {
            name: name.to_string(),
            model_id: Some(model_id.to_string()),
            ..Default::default()
        }
    }

    pub fn model_id(&self) -> &str {
        self.model_id.as_deref().unwrap_or(DEFAULT_CHECKPOINT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WeightsFormat {
    Safetensors,
    Pytorch,
}

fn weights_format(weights: &[PathBuf]) -> Result<WeightsFormat> {
    let is_ext = |ext: &str| {
        weights
            .iter()
            .all(|p| p.extension().is_some_and(|e| e == ext))
    };
    match weights {
        [] => bail!("🐔 no weight files"),
        _ if is_ext("safetensors") => Ok(WeightsFormat::Safetensors),
        [_] if is_ext("bin") || is_ext("pth") || is_ext("pt") => Ok(WeightsFormat::Pytorch),
        _ => bail!("🐔 unsupported weight files: {:?}", weights),
    }
}

fn var_builder(weights: &[PathBuf], dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = match weights_format(weights)? {
        WeightsFormat::Safetensors => unsafe {
            VarBuilder::from_mmaped_safetensors(weights, dtype, device)?
        },
        WeightsFormat::Pytorch => VarBuilder::from_pth(&weights[0], dtype, device)?,
    };
    Ok(vb)
}

fn resolve_weights(spec: &Seq2SeqSpec) -> Result<Vec<PathBuf>> {
    if let Some(files) = &spec.model_file {
        return Ok(files.split(',').map(PathBuf::from).collect());
    }

    let model_id = spec.model_id();
    let get = |file: &str| {
        hf_hub_get_path(model_id, file, spec.hf_token.clone(), spec.revision.clone())
    };
    match get(SAFETENSORS_FILE) {
        Ok(path) => Ok(vec![path]),
        Err(e) => {
            warn!(target: LOG_TARGET, "🤗 no {} for {} ({}), trying {}", SAFETENSORS_FILE, model_id, e, PYTORCH_FILE);
            Ok(vec![get(PYTORCH_FILE)?])
        }
    }
}

pub struct Seq2SeqModel {
    pub spec: Seq2SeqSpec,
    pub model: PegasusForConditionalGeneration,
    pub tokenizer: TokenizerWrapper,
    pub config: pegasus::Config,
    pub generation: GenerationConfig,
    pub device: Device,
    pub dtype: DType,
    weights: Vec<PathBuf>,
}

impl Seq2SeqModel {
    pub fn load(spec: Seq2SeqSpec) -> Result<Seq2SeqModel> {
        let device = parse_device(spec.device.clone())?;
        let dtype = parse_dtype(spec.dtype.as_deref())?;
        let model_id = spec.model_id().to_string();

        let config_bytes = hf_hub_get(
            &model_id,
            CONFIG_FILE,
            spec.hf_token.clone(),
            spec.revision.clone(),
        )?;
        let config: pegasus::Config = serde_json::from_slice(&config_bytes)?;
        let generation: GenerationConfig = serde_json::from_slice(&config_bytes)?;

        let tokenizer = TokenizerWrapper::from_hub(
            &model_id,
            spec.tokenizer_file.as_deref(),
            spec.revision.clone(),
            spec.hf_token.clone(),
        )?;

        let weights = resolve_weights(&spec)?;
        debug!(target: LOG_TARGET, "🤗 {} weights {:?}", model_id, weights);
        let vb = var_builder(&weights, dtype, &device)?;
        let model = PegasusForConditionalGeneration::load(vb, &config)?;
        info!(target: LOG_TARGET, "loaded {} as {:?} on {:?}", model_id, dtype, device);

        Ok(Self::from_parts(
            spec, model, tokenizer, config, generation, weights,
        ))
    }

    pub(crate) fn from_parts(
        spec: Seq2SeqSpec,
        model: PegasusForConditionalGeneration,
        tokenizer: TokenizerWrapper,
        config: pegasus::Config,
        generation: GenerationConfig,
        weights: Vec<PathBuf>,
    ) -> Self {
        Self {
            device: model.device().clone(),
            dtype: model.dtype(),
            spec,
            model,
            tokenizer,
            config,
            generation,
            weights,
        }
    }

    pub fn lazy(spec: Seq2SeqSpec) -> Result<Arc<Mutex<Seq2SeqModel>>> {
        let name = spec.name.clone();
        let map = SEQ2SEQ_INSTANCES.get_or_init(|| Mutex::new(HashMap::new()));
        {
            let guard = map.lock().map_anyhow_err()?;
            if let Some(existing) = guard.get(&name) {
                return Ok(existing.clone());
            }
        }

        let seq2seq_model = Seq2SeqModel::load(spec)?;
        let arc = Arc::new(Mutex::new(seq2seq_model));
        let mut guard = map.lock().map_anyhow_err()?;
        // another caller may have loaded it meanwhile
        let arc = guard.entry(name).or_insert(arc).clone();
        Ok(arc)
    }

    /// Reloads the weights in `dtype`. Only safe on checkpoints whose
    /// activations fit the target range.
    pub fn to_dtype(&mut self, dtype: DType) -> Result<()> {
        if dtype == self.dtype {
            return Ok(());
        }
        let vb = var_builder(&self.weights, dtype, &self.device)?;
        self.model = PegasusForConditionalGeneration::load(vb, &self.config)?;
        self.dtype = dtype;
        info!(target: LOG_TARGET, "{} converted to {:?}", self.spec.model_id(), dtype);
        Ok(())
    }

    /// Longest input the model accepts, bounded by the tokenizer ceiling.
    pub fn max_input_length(&self) -> usize {
        match self.tokenizer.model_max_length {
            UNBOUNDED_LENGTH => self.config.max_position_embeddings,
            n => n.min(self.config.max_position_embeddings),
        }
    }

    /// Output ids per input, starting with the decoder start token.
    pub fn generate(
        &self,
        batch: &BatchEncoding,
        config: Option<GenerationConfig>,
    ) -> Result<Vec<Vec<u32>>> {
        if batch.input_ids.is_empty() {
            return Ok(vec![]);
        }
        let config = config.unwrap_or_else(|| self.generation.clone());
        let (input_ids, attention_mask) = batch.to_tensors(&self.device)?;
        let (batch_size, _) = input_ids.dims2()?;

        let mut model = self.model.clone();
        let mut session =
            DecodingSession::new(&mut model, &input_ids, &attention_mask, config.num_beams)?;
        generate(&mut session, &config, batch_size)
    }

    pub fn summarize(&self, texts: &[String], max_length: Option<usize>) -> Result<Vec<String>> {
        let batch = self.tokenizer.encode_batch(
            texts,
            EncodeOptions {
                truncation: true,
                max_length: Some(max_length.unwrap_or(self.max_input_length())),
                padding: true,
            },
        )?;
        debug!(target: LOG_TARGET, "summarizing batch of shape {:?}", batch.shape());
        let outputs = self.generate(&batch, None)?;
        self.tokenizer.decode_batch(&outputs, true)
    }
}
