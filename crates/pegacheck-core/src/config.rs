use crate::common::HF_ENDPOINT_ENV;
use crate::hub::{DEFAULT_ENDPOINT, DEFAULT_REVISION};
use crate::lengths::{DatasetLengthSpec, PEGASUS_LARGE, PEGASUS_PREFIX};
use anyhow::bail;
use anyhow::Result;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::env;
use std::fs;
use url::Url;

pub fn read_config_str(path: &String, replace_env: Option<bool>) -> Result<String> {
    let configuration_str = if Url::parse(path).is_ok() {
        reqwest::blocking::get(path)?.error_for_status()?.text()?
    } else {
        fs::read_to_string(path)?
    };

    if let Some(true) = replace_env {
        ReplaceTokens::replace(&configuration_str)
    } else {
        Ok(configuration_str)
    }
}

pub fn read_config<T>(path: &String, replace_env: Option<bool>) -> Result<T>
where
    T: DeserializeOwned,
{
    let config = read_config_str(path, replace_env)?;

    let o: T = if path.ends_with(".yaml") || path.ends_with(".yml") {
        serde_yaml::from_str(&config)?
    } else if path.ends_with(".json") {
        serde_json::from_str(&config)?
    } else {
        bail!("Unsupported file format");
    };

    Ok(o)
}

#[derive(thiserror::Error, Debug)]
enum ReplaceTokensError {
    #[error("Environment variable: {0} not set")]
    NoEnv(String),
}

pub struct ReplaceTokens {}

impl ReplaceTokens {
    pub fn replace(template: &str) -> Result<String> {
        let mut text = template.to_owned();
        let tokens = Self::find_tokens(template)?;
        for token in tokens {
            let from = format!("${{{}}}", &token);
            let to = match env::var(token) {
                Ok(v) => v,
                Err(_) => bail!(ReplaceTokensError::NoEnv(token.to_string())),
            };
            text = text.replace(&from, &to);
        }
        Ok(text)
    }

    fn find_tokens(text: &str) -> Result<Vec<&str>> {
        let re = Regex::new(r"\$\{(?P<token>[a-zA-Z0-9_\-]+)\}")?;
        let tokens: Vec<&str> = re
            .captures_iter(text)
            .filter_map(|x| x.name("token"))
            .map(|m| m.as_str())
            .collect();
        Ok(tokens)
    }
}

fn default_prefix() -> String {
    PEGASUS_PREFIX.to_string()
}

fn default_revision() -> String {
    DEFAULT_REVISION.to_string()
}

/// `HF_ENDPOINT` wins over the public hub, with or without a settings file.
fn default_endpoint() -> String {
    env::var(HF_ENDPOINT_ENV)
        .ok()
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
}

fn default_large_checkpoint() -> String {
    PEGASUS_LARGE.to_string()
}

/// Settings for a checkpoint metadata run.
///
/// Every field is optional in the file. An absent `datasets` list means the
/// built-in Pegasus table.
#[derive(Deserialize, Debug, Clone)]
pub struct CheckSettings {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub hf_token: Option<String>,
    #[serde(default = "default_large_checkpoint")]
    pub large_checkpoint: String,
    #[serde(default)]
    pub datasets: Option<DatasetLengthSpec>,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            revision: default_revision(),
            endpoint: default_endpoint(),
            hf_token: None,
            large_checkpoint: default_large_checkpoint(),
            datasets: None,
        }
    }
}

impl CheckSettings {
    pub fn load(path: &String) -> Result<Self> {
        read_config(path, Some(true))
    }

    pub fn lengths(&self) -> DatasetLengthSpec {
        self.datasets.clone().unwrap_or_else(DatasetLengthSpec::pegasus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_replace_tokens() -> Result<()> {
        env::set_var("PEGACHECK_Q_1", "TOKEN1");
        env::set_var("PEGACHECK_Q_2", "TOKEN2");
        let mut text = "${PEGACHECK_Q_1} ${PEGACHECK_Q_2}".to_string();
        text = ReplaceTokens::replace(&text)?;
        env::remove_var("PEGACHECK_Q_1");
        env::remove_var("PEGACHECK_Q_2");

        assert_eq!(text, "TOKEN1 TOKEN2");

        Ok(())
    }

    #[test]
    fn test_replace_tokens_missing_env() {
        let result = ReplaceTokens::replace("${PEGACHECK_SURELY_NOT_SET}");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_yaml_settings() -> Result<()> {
        env::set_var("PEGACHECK_TEST_TOKEN", "hf_secret");
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        writeln!(
            file,
            r#"
prefix: "acme/pegasus-"
hf_token: "${{PEGACHECK_TEST_TOKEN}}"
datasets:
  - name: xsum
    max_gen_length: 64
    max_model_length: 512
  - name: gigaword
    max_gen_length: 32
    max_model_length: 128
    length_penalty: 0.6
"#
        )?;
        let path = file.path().to_string_lossy().to_string();
        let settings = CheckSettings::load(&path)?;
        env::remove_var("PEGACHECK_TEST_TOKEN");

        assert_eq!(settings.prefix, "acme/pegasus-");
        assert_eq!(settings.revision, "main");
        assert_eq!(settings.hf_token.as_deref(), Some("hf_secret"));
        let lengths = settings.lengths();
        assert_eq!(lengths.len(), 2);
        assert_eq!(lengths.get("gigaword").map(|d| d.max_model_length), Some(128));
        Ok(())
    }

    #[test]
    fn test_json_settings_default_to_pegasus_table() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
        writeln!(file, r#"{{"revision": "refs/pr/1"}}"#)?;
        let path = file.path().to_string_lossy().to_string();
        let settings: CheckSettings = read_config(&path, None)?;

        assert_eq!(settings.revision, "refs/pr/1");
        assert_eq!(settings.prefix, PEGASUS_PREFIX);
        assert_eq!(settings.lengths(), DatasetLengthSpec::pegasus());
        Ok(())
    }

    #[test]
    fn test_endpoint_env_applies_to_settings_file() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
        writeln!(file, r#"{{"prefix": "google/pegasus-"}}"#)?;
        let path = file.path().to_string_lossy().to_string();

        env::set_var(HF_ENDPOINT_ENV, "https://mirror.example");
        let from_file = CheckSettings::load(&path);
        let defaults = CheckSettings::default();
        env::remove_var(HF_ENDPOINT_ENV);

        assert_eq!(from_file?.endpoint, "https://mirror.example");
        assert_eq!(defaults.endpoint, "https://mirror.example");
        Ok(())
    }

    #[test]
    fn test_explicit_endpoint_beats_env() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
        writeln!(file, r#"{{"endpoint": "https://hub.internal"}}"#)?;
        let path = file.path().to_string_lossy().to_string();
        let settings = CheckSettings::load(&path)?;
        assert_eq!(settings.endpoint, "https://hub.internal");
        Ok(())
    }

    #[test]
    fn test_unsupported_extension() -> Result<()> {
        let file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        let path = file.path().to_string_lossy().to_string();
        assert!(read_config::<CheckSettings>(&path, None).is_err());
        Ok(())
    }
}
