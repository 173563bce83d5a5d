pub mod load_llm;
pub mod models;
pub mod predict;
pub mod prompt;
pub mod train;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::error::Result;
use models::llama::{Config, Llama, LoraSpec};
use predict::GenerateCfg;

/// Model configuration section of the settings file. The base model and the
/// adapter each resolve from a local directory or a hub repository; exactly
/// one of the adapter fields must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmCfg {
    pub model_id: String,
    pub adapter_dir: Option<String>,
    pub adapter_repo: Option<String>,
    #[serde(default)]
    pub use_cpu: bool,
    pub dtype: Option<String>,
    #[serde(default)]
    pub generate: GenerateCfg,
}

/// The process-wide chat model: base weights plus the trained adapter, loaded
/// once at startup and held for the process lifetime.
pub struct ChatLlm {
    pub device: Device,
    pub dtype: DType,
    pub model: Llama,
    pub config: Config,
    pub tokenizer: Tokenizer,
    pub eos_token_id: Option<u32>,
    pub generate: GenerateCfg,
}

impl ChatLlm {
    pub fn load(cfg: &LlmCfg) -> Result<Self> {
        let device = load_llm::device(cfg.use_cpu)?;
        let dtype = load_llm::dtype(cfg.dtype.as_deref())?;

        let files = load_llm::fetch_base(&cfg.model_id)?;
        let config: models::llama::LlamaConfig =
            serde_json::from_slice(&std::fs::read(&files.config)?)?;
        let config = config.into_config();
        let tokenizer = load_llm::load_tokenizer(&files.tokenizer)?;

        let adapter = load_llm::fetch_adapter(cfg)?;
        let adapter_cfg = load_llm::read_adapter_config(&adapter.config)?;

        tracing::info!(model_id = %cfg.model_id, ?dtype, "initializing model");
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let lora_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(
                std::slice::from_ref(&adapter.weights),
                DType::F32,
                &device,
            )?
        };
        let spec = LoraSpec {
            vb: lora_vb,
            rank: adapter_cfg.r,
            scale: adapter_cfg.scaling(),
            dropout: adapter_cfg.lora_dropout,
            targets: adapter_cfg.target_modules.clone(),
            train: false,
        };
        let model = Llama::load(vb, Some(&spec), &config, false)?;

        let eos_token_id = eos_token(&tokenizer);
        tracing::info!("model ready");
        Ok(Self {
            device,
            dtype,
            model,
            config,
            tokenizer,
            eos_token_id,
            generate: cfg.generate.clone(),
        })
    }
}

fn eos_token(tokenizer: &Tokenizer) -> Option<u32> {
    ["</s>", "<|endoftext|>", "<eos>", "<|end_of_text|>"]
        .iter()
        .find_map(|t| tokenizer.token_to_id(t))
}
