use crate::common::hf_token_or_env;
use crate::config::CheckSettings;
use log::debug;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
pub const DEFAULT_REVISION: &str = "main";
pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Used when `config.json` does not declare `max_length`.
pub const DEFAULT_MAX_LENGTH: usize = 20;
/// Used when `config.json` does not declare `max_position_embeddings`.
pub const DEFAULT_MAX_POSITION_EMBEDDINGS: usize = 1024;
/// A tokenizer without a declared ceiling never truncates.
pub const UNBOUNDED_LENGTH: usize = usize::MAX;

/// Input sizes known for checkpoints whose tokenizer config predates
/// `model_max_length`.
const PRETRAINED_INPUT_SIZES: &[(&str, usize)] = &[("google/pegasus-xsum", 512)];

const LOG_TARGET: &str = "hub";

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

fn default_max_position_embeddings() -> usize {
    DEFAULT_MAX_POSITION_EMBEDDINGS
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub length_penalty: Option<f64>,
    #[serde(default)]
    pub num_beams: Option<usize>,
    #[serde(default)]
    pub task_specific_params: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTokenizerMeta {
    pub model_max_length: usize,
}

impl RemoteTokenizerMeta {
    /// Resolves the effective ceiling from a `tokenizer_config.json` body,
    /// `None` when the checkpoint ships no such file.
    pub fn resolve(id: &str, tokenizer_config: Option<&Value>) -> Self {
        let declared = tokenizer_config
            .and_then(|c| c.get("model_max_length"))
            .filter(|v| !v.is_null());

        let model_max_length = match declared {
            // huge sentinels such as 1e30 come through as floats
            Some(v) => v.as_u64().map_or(UNBOUNDED_LENGTH, |n| n as usize),
            None => PRETRAINED_INPUT_SIZES
                .iter()
                .find(|(name, _)| *name == id)
                .map_or(UNBOUNDED_LENGTH, |(_, size)| *size),
        };

        Self { model_max_length }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("🐔 {file} not found for {id}")]
    NotFound { id: String, file: String },
    #[error("🐔 fetching {file} for {id} failed: {reason}")]
    Network {
        id: String,
        file: String,
        reason: String,
    },
    #[error("🐔 {file} for {id} is malformed: {source}")]
    Malformed {
        id: String,
        file: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

/// Where checkpoint metadata comes from.
pub trait MetadataSource {
    fn fetch_config(&self, id: &str) -> Result<RemoteConfig, FetchError>;

    fn fetch_tokenizer(&self, id: &str) -> Result<RemoteTokenizerMeta, FetchError>;
}

pub struct HubClient {
    client: Client,
    endpoint: String,
    revision: String,
    hf_token: Option<String>,
}

impl HubClient {
    pub fn new(endpoint: &str, revision: &str, hf_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            revision: revision.to_string(),
            hf_token: hf_token_or_env(hf_token),
        }
    }

    pub fn from_settings(settings: &CheckSettings) -> Self {
        Self::new(
            &settings.endpoint,
            &settings.revision,
            settings.hf_token.clone(),
        )
    }

    pub fn file_url(&self, id: &str, file: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint,
            id,
            self.revision.replace('/', "%2F"),
            file
        )
    }

    fn fetch_json(&self, id: &str, file: &str) -> Result<Value, FetchError> {
        let url = self.file_url(id, file);
        debug!(target: LOG_TARGET, "🤗 GET {}", url);

        let network = |reason: String| FetchError::Network {
            id: id.to_string(),
            file: file.to_string(),
            reason,
        };

        let mut request = self.client.get(&url);
        if let Some(token) = &self.hf_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().map_err(|e| network(e.to_string()))?;

        match response.status() {
            // the hub answers 401 for repositories that do not exist
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => {
                return Err(FetchError::NotFound {
                    id: id.to_string(),
                    file: file.to_string(),
                })
            }
            status if !status.is_success() => return Err(network(format!("status {status}"))),
            _ => {}
        }

        let body = response.bytes().map_err(|e| network(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Malformed {
            id: id.to_string(),
            file: file.to_string(),
            source,
        })
    }
}

impl MetadataSource for HubClient {
    fn fetch_config(&self, id: &str) -> Result<RemoteConfig, FetchError> {
        let value = self.fetch_json(id, CONFIG_FILE)?;
        serde_json::from_value(value).map_err(|source| FetchError::Malformed {
            id: id.to_string(),
            file: CONFIG_FILE.to_string(),
            source,
        })
    }

    fn fetch_tokenizer(&self, id: &str) -> Result<RemoteTokenizerMeta, FetchError> {
        let tokenizer_config = match self.fetch_json(id, TOKENIZER_CONFIG_FILE) {
            Ok(value) => Some(value),
            Err(FetchError::NotFound { .. }) => {
                debug!(target: LOG_TARGET, "🤗 no {} for {}", TOKENIZER_CONFIG_FILE, id);
                None
            }
            Err(e) => return Err(e),
        };
        Ok(RemoteTokenizerMeta::resolve(id, tokenizer_config.as_ref()))
    }
}
