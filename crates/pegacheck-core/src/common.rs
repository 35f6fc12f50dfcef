use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device};
use std::{env, fs, path::PathBuf};

pub const HF_TOKEN_ENV: &str = "HF_TOKEN";
pub const HF_ENDPOINT_ENV: &str = "HF_ENDPOINT";

pub trait OptionToResult<T> {
    fn ok_or_err(self, name: &str) -> Result<T>;
}

impl<T> OptionToResult<T> for Option<T> {
    fn ok_or_err(self, name: &str) -> Result<T> {
        self.ok_or(anyhow!("🐔 {:?} - value not found", name))
    }
}

pub trait ResultExt<T, E> {
    fn map_anyhow_err(self) -> Result<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T, E> for Result<T, E> {
    fn map_anyhow_err(self) -> Result<T> {
        self.map_err(|e| anyhow!("{:?}", e))
    }
}

pub fn hf_hub_get_path(
    hf_repo_id: &str,
    filename: &str,
    hf_token: Option<String>,
    revision: Option<String>,
) -> Result<PathBuf> {
    use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};

    let mut api_builder = ApiBuilder::new();

    if let Some(token) = hf_token {
        api_builder = api_builder.with_token(Some(token));
    }

    let repo = if let Some(rev) = revision {
        Repo::with_revision(hf_repo_id.to_string(), RepoType::Model, rev)
    } else {
        Repo::new(hf_repo_id.to_string(), RepoType::Model)
    };

    let api = api_builder.build()?.repo(repo);
    let path = api.get(filename)?;

    Ok(path)
}

pub fn hf_hub_get(
    hf_repo_id: &str,
    filename: &str,
    hf_token: Option<String>,
    revision: Option<String>,
) -> Result<Vec<u8>> {
    let path = hf_hub_get_path(hf_repo_id, filename, hf_token, revision)?;
    let data = fs::read(path)?;
    Ok(data)
}

/// Token passed explicitly wins over `HF_TOKEN`.
pub fn hf_token_or_env(token: Option<String>) -> Option<String> {
    token.or_else(|| env::var(HF_TOKEN_ENV).ok().filter(|t| !t.is_empty()))
}

pub fn parse_device(device: Option<String>) -> Result<Device> {
    let device = match device.as_deref() {
        None | Some("cpu") => Device::Cpu,
        Some("cuda") => Device::new_cuda(0)?,
        Some("metal") => Device::new_metal(0)?,
        Some(other) => match other.strip_prefix("cuda:") {
            Some(ordinal) => Device::new_cuda(ordinal.parse()?)?,
            None => bail!("🐔 unsupported device: {}", other),
        },
    };
    Ok(device)
}

pub fn parse_dtype(dtype: Option<&str>) -> Result<DType> {
    let dtype = match dtype {
        None | Some("f32") => DType::F32,
        Some("f16") => DType::F16,
        Some("bf16") => DType::BF16,
        Some(other) => bail!("🐔 unsupported dtype: {}", other),
    };
    Ok(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_cpu() -> Result<()> {
        assert!(parse_device(None)?.is_cpu());
        assert!(parse_device(Some("cpu".to_string()))?.is_cpu());
        Ok(())
    }

    #[test]
    fn test_parse_device_unknown() {
        assert!(parse_device(Some("tpu".to_string())).is_err());
    }

    #[test]
    fn test_parse_dtype() -> Result<()> {
        assert_eq!(parse_dtype(None)?, DType::F32);
        assert_eq!(parse_dtype(Some("f16"))?, DType::F16);
        assert!(parse_dtype(Some("f8")).is_err());
        Ok(())
    }

    #[test]
    fn test_explicit_token_wins() {
        assert_eq!(
            hf_token_or_env(Some("abc".to_string())),
            Some("abc".to_string())
        );
    }

    #[test]
    fn test_ok_or_err_message() {
        let missing: Option<u32> = None;
        let err = missing.ok_or_err("max_length").unwrap_err();
        assert!(err.to_string().contains("max_length"));
    }
}
