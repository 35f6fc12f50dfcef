//! Published generation and input lengths of the Pegasus fine-tuned checkpoints.

use crate::config::read_config;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

pub const PEGASUS_PREFIX: &str = "google/pegasus-";
pub const PEGASUS_LARGE: &str = "google/pegasus-large";
pub const TASK_PARAMS_PREFIX: &str = "summarization_";

const DEFAULT_LENGTH_PENALTY: f64 = 0.8;

fn default_length_penalty() -> f64 {
    DEFAULT_LENGTH_PENALTY
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatasetLengths {
    pub name: String,
    /// Longest summary the checkpoint is configured to generate.
    pub max_gen_length: usize,
    /// Longest input the checkpoint was fine-tuned on.
    pub max_model_length: usize,
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f64,
}

impl DatasetLengths {
    pub fn new(
        name: &str,
        max_gen_length: usize,
        max_model_length: usize,
        length_penalty: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            max_gen_length,
            max_model_length,
            length_penalty,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LengthSpecError {
    #[error("🐔 dataset {0} listed more than once")]
    Duplicate(String),
}

/// Ordered dataset table. Iteration follows insertion order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "Vec<DatasetLengths>", into = "Vec<DatasetLengths>")]
pub struct DatasetLengthSpec {
    entries: Vec<DatasetLengths>,
}

impl TryFrom<Vec<DatasetLengths>> for DatasetLengthSpec {
    type Error = LengthSpecError;

    fn try_from(entries: Vec<DatasetLengths>) -> Result<Self, Self::Error> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(LengthSpecError::Duplicate(entry.name.clone()));
            }
        }
        Ok(Self { entries })
    }
}

impl From<DatasetLengthSpec> for Vec<DatasetLengths> {
    fn from(spec: DatasetLengthSpec) -> Self {
        spec.entries
    }
}

impl DatasetLengthSpec {
    pub fn pegasus() -> Self {
        let entries = vec![
            DatasetLengths::new("xsum", 64, 512, 0.8),
            DatasetLengths::new("cnn_dailymail", 128, 1024, 0.8),
            DatasetLengths::new("newsroom", 128, 512, 0.8),
            DatasetLengths::new("wikihow", 256, 512, 0.6),
            DatasetLengths::new("multi_news", 256, 1024, 0.8),
            DatasetLengths::new("reddit_tifu", 128, 512, 0.6),
            DatasetLengths::new("big_patent", 256, 1024, 0.7),
            DatasetLengths::new("arxiv", 256, 1024, 0.8),
            DatasetLengths::new("pubmed", 256, 1024, 0.8),
            DatasetLengths::new("gigaword", 32, 128, 0.6),
            DatasetLengths::new("aeslc", 32, 512, 0.6),
            DatasetLengths::new("billsum", 256, 1024, 0.6),
            // not a fine-tuned checkpoint, the base model
            DatasetLengths::new("large", 256, 1024, 0.8),
        ];
        Self { entries }
    }

    /// Loads a bare dataset list from YAML or JSON, path or URL.
    pub fn from_file(path: &String) -> anyhow::Result<Self> {
        read_config(path, Some(true))
    }

    pub fn get(&self, name: &str) -> Option<&DatasetLengths> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatasetLengths> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `task_specific_params` block a base Pegasus config publishes for
    /// these datasets.
    pub fn task_specific_params(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|e| {
                (
                    format!("{TASK_PARAMS_PREFIX}{}", e.name),
                    json!({
                        "length_penalty": e.length_penalty,
                        "max_length": e.max_gen_length,
                        "max_position_embeddings": e.max_model_length,
                    }),
                )
            })
            .collect()
    }
}

pub fn checkpoint_id(prefix: &str, dataset: &str) -> String {
    format!("{prefix}{dataset}")
}
