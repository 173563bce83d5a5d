//! File resolution and loading for the base model and adapter artifacts.
//!
//! Both the base model and the adapter can come from a local directory or a
//! hub repository; gated repositories are accessed with the `HF_TOKEN`
//! environment variable.

use std::path::{Path, PathBuf};

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use super::LlmCfg;
use crate::error::{Error, Result};

const REVISION: &str = "main";

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        tracing::info!("no accelerator available, running on CPU");
        Ok(Device::Cpu)
    }
}

pub fn dtype(name: Option<&str>) -> Result<DType> {
    match name {
        Some("f16") => Ok(DType::F16),
        Some("bf16") => Ok(DType::BF16),
        Some("f32") => Ok(DType::F32),
        Some(other) => Err(Error::msg(format!("unsupported dtype {other}"))),
        None => Ok(DType::F16),
    }
}

/// Resolved on-disk locations of everything needed to build the base model.
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// Resolve base model files from a local directory or a hub repo id.
pub fn fetch_base(model_id: &str) -> Result<ModelFiles> {
    let dir = Path::new(model_id);
    if dir.is_dir() {
        let weights = crate::utility::find_files_with_extension(dir, "safetensors")?;
        if weights.is_empty() {
            return Err(Error::msg(format!("no safetensors files under {model_id}")));
        }
        return Ok(ModelFiles {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights,
        });
    }

    tracing::info!(model_id, "fetching base model from the hub");
    let repo = hub_api()?.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        REVISION.to_string(),
    ));
    let tokenizer = repo.get("tokenizer.json")?;
    let config = repo.get("config.json")?;
    let weights = match repo.get("model.safetensors") {
        Ok(single) => vec![single],
        Err(_) => sharded_weights(&repo)?,
    };
    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

fn hub_api() -> Result<Api> {
    let token = std::env::var("HF_TOKEN").ok();
    Ok(ApiBuilder::new().with_token(token).build()?)
}

fn sharded_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    let index = repo.get("model.safetensors.index.json")?;
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index)?)?;
    let weight_map = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| Error::msg("no weight_map in safetensors index"))?;
    let mut names: Vec<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    names.into_iter().map(|name| Ok(repo.get(name)?)).collect()
}

/// The persisted adapter hyperparameters, written by the trainer and read
/// back at inference time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

impl AdapterConfig {
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }
}

pub struct AdapterFiles {
    pub weights: PathBuf,
    pub config: PathBuf,
}

/// Resolve the adapter artifact from the configured deployment mode:
/// a local artifact directory or a hub repository.
pub fn fetch_adapter(cfg: &LlmCfg) -> Result<AdapterFiles> {
    match (&cfg.adapter_dir, &cfg.adapter_repo) {
        (Some(_), Some(_)) => Err(Error::msg(
            "both adapter_dir and adapter_repo are set, pick one",
        )),
        (None, None) => Err(Error::msg(
            "no adapter configured, set adapter_dir or adapter_repo",
        )),
        (Some(dir), None) => {
            let dir = Path::new(dir);
            let weights = dir.join("adapter_model.safetensors");
            if !weights.is_file() {
                return Err(Error::msg(format!("adapter weights not found: {weights:?}")));
            }
            Ok(AdapterFiles {
                weights,
                config: dir.join("adapter_config.json"),
            })
        }
        (None, Some(repo_id)) => {
            tracing::info!(repo_id, "fetching adapter from the hub");
            let repo = hub_api()?.repo(Repo::with_revision(
                repo_id.to_string(),
                RepoType::Model,
                REVISION.to_string(),
            ));
            Ok(AdapterFiles {
                weights: repo.get("adapter_model.safetensors")?,
                config: repo.get("adapter_config.json")?,
            })
        }
    }
}

pub fn read_adapter_config(path: &Path) -> Result<AdapterConfig> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|e| Error::Tokenizer(e.to_string()))
}
