//! Supervised fine-tuning of the low-rank adapter.
//!
//! The base model is loaded with 4-bit frozen projections; only the LoRA
//! matrices live in the trainable `VarMap`. One formatted training string per
//! example, next-token cross entropy, AdamW with gradient accumulation. No
//! gradient clipping, no validation split, no checkpointing: a failed run
//! starts over.

use std::path::Path;

use candle_core::{DType, Tensor};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::Deserialize;

use super::load_llm::{self, AdapterConfig};
use super::models::llama::{Cache, Llama, LlamaConfig, LoraSpec};
use super::{prompt, LlmCfg};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct TrainCfg {
    pub data: String,
    pub output_dir: String,
    #[serde(default = "default_rank")]
    pub rank: usize,
    #[serde(default = "default_alpha")]
    pub lora_alpha: f64,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_targets")]
    pub target_modules: Vec<String>,
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation: usize,
    #[serde(default = "default_lr")]
    pub learning_rate: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
}

fn default_rank() -> usize {
    8
}
fn default_alpha() -> f64 {
    16.0
}
fn default_dropout() -> f32 {
    0.05
}
fn default_targets() -> Vec<String> {
    vec!["q_proj".to_string(), "v_proj".to_string()]
}
fn default_grad_accum() -> usize {
    4
}
fn default_lr() -> f64 {
    2e-4
}
fn default_epochs() -> usize {
    3
}
fn default_max_seq_len() -> usize {
    512
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingExample {
    pub instruction: String,
    pub response: String,
}

/// Read the dataset: a JSON array of `{instruction, response}` records.
/// Unlike the like-store, a malformed dataset is a hard error.
pub fn load_examples<P: AsRef<Path>>(path: P) -> Result<Vec<TrainingExample>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

pub fn run(llm_cfg: &LlmCfg, cfg: &TrainCfg) -> Result<()> {
    let device = load_llm::device(llm_cfg.use_cpu)?;
    let examples = load_examples(&cfg.data)?;
    if examples.is_empty() {
        return Err(Error::msg(format!("no training examples in {}", cfg.data)));
    }
    tracing::info!(examples = examples.len(), epochs = cfg.epochs, "starting fine-tuning");

    let files = load_llm::fetch_base(&llm_cfg.model_id)?;
    let config: LlamaConfig = serde_json::from_slice(&std::fs::read(&files.config)?)?;
    let config = config.into_config();
    let tokenizer = load_llm::load_tokenizer(&files.tokenizer)?;
    let eos_token_id = super::eos_token(&tokenizer);

    // Frozen 4-bit base, trainable f32 adapter weights.
    let base_vb =
        unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, DType::F32, &device)? };
    let varmap = VarMap::new();
    let spec = LoraSpec {
        vb: VarBuilder::from_varmap(&varmap, DType::F32, &device),
        rank: cfg.rank,
        scale: cfg.lora_alpha / cfg.rank as f64,
        dropout: cfg.dropout,
        targets: cfg.target_modules.clone(),
        train: true,
    };
    let model = Llama::load(base_vb, Some(&spec), &config, true)?;
    tracing::info!(trainable = varmap.all_vars().len(), "adapter attached");

    let params = ParamsAdamW {
        lr: cfg.learning_rate,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), params)?;

    for epoch in 1..=cfg.epochs {
        let mut window = LossWindow::new();
        for (step, example) in examples.iter().enumerate() {
            let text = prompt::training_text(&example.instruction, &example.response);
            let mut tokens = tokenizer
                .encode(text.as_str(), true)
                .map_err(|e| Error::Tokenizer(e.to_string()))?
                .get_ids()
                .to_vec();
            if let Some(eos) = eos_token_id {
                tokens.push(eos);
            }
            tokens.truncate(cfg.max_seq_len);
            if tokens.len() < 2 {
                continue;
            }

            let inputs = Tensor::new(&tokens[..tokens.len() - 1], &device)?.unsqueeze(0)?;
            let targets = Tensor::new(&tokens[1..], &device)?;
            let cache = Cache::new(false, DType::F32, &config, &device)?;
            let logits = model.forward(&inputs, 0, &cache)?.squeeze(0)?;
            let step_loss = loss::cross_entropy(&logits, &targets)?;

            window.push(step_loss, step)?;
            if window.len() == cfg.gradient_accumulation {
                if let Some((sum, n, last)) = window.take() {
                    apply_step(&mut optimizer, sum, n, epoch, last)?;
                }
            }
        }
        if let Some((sum, n, last)) = window.take() {
            apply_step(&mut optimizer, sum, n, epoch, last)?;
        }
    }

    save_adapter(&varmap, cfg, &files.tokenizer)?;
    tracing::info!(output = %cfg.output_dir, "fine-tuning completed");
    Ok(())
}

/// Accumulated losses for one optimizer step. Remembers the index of the last
/// example that actually contributed, since short examples can be skipped
/// between contributions.
struct LossWindow {
    sum: Option<Tensor>,
    count: usize,
    last_step: usize,
}

impl LossWindow {
    fn new() -> Self {
        Self {
            sum: None,
            count: 0,
            last_step: 0,
        }
    }

    fn push(&mut self, loss: Tensor, step: usize) -> Result<()> {
        self.sum = Some(match self.sum.take() {
            None => loss,
            Some(sum) => (sum + loss)?,
        });
        self.count += 1;
        self.last_step = step;
        Ok(())
    }

    fn len(&self) -> usize {
        self.count
    }

    /// Drain the window: `(loss sum, contribution count, last step index)`.
    /// `None` when nothing accumulated since the last drain.
    fn take(&mut self) -> Option<(Tensor, usize, usize)> {
        let sum = self.sum.take()?;
        let count = self.count;
        self.count = 0;
        Some((sum, count, self.last_step))
    }
}

fn apply_step(
    optimizer: &mut AdamW,
    loss_sum: Tensor,
    window: usize,
    epoch: usize,
    step: usize,
) -> Result<()> {
    let loss = loss_sum.affine(1.0 / window as f64, 0.0)?;
    optimizer.backward_step(&loss)?;
    let loss = loss.to_scalar::<f32>()?;
    tracing::info!(epoch, step, loss, "optimizer step");
    Ok(())
}

/// Write the adapter artifact: weights, hyperparameters, and the tokenizer
/// the adapter was trained with.
fn save_adapter(varmap: &VarMap, cfg: &TrainCfg, tokenizer_file: &Path) -> Result<()> {
    let out = Path::new(&cfg.output_dir);
    std::fs::create_dir_all(out)?;
    varmap.save(out.join("adapter_model.safetensors"))?;
    let adapter = AdapterConfig {
        r: cfg.rank,
        lora_alpha: cfg.lora_alpha,
        lora_dropout: cfg.dropout,
        target_modules: cfg.target_modules.clone(),
        peft_type: "LORA".to_string(),
    };
    std::fs::write(
        out.join("adapter_config.json"),
        serde_json::to_string_pretty(&adapter)?,
    )?;
    if tokenizer_file.is_file() {
        std::fs::copy(tokenizer_file, out.join("tokenizer.json"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_instruction_response_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r#"[{"instruction": "a", "response": "b"}, {"instruction": "c", "response": "d"}]"#,
        )
        .unwrap();
        let examples = load_examples(&path).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[1].instruction, "c");
        assert_eq!(examples[1].response, "d");
    }

    #[test]
    fn malformed_dataset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, "not json at all").unwrap();
        assert!(load_examples(&path).is_err());
    }

    #[test]
    fn loss_window_reports_last_contributing_step() {
        let device = candle_core::Device::Cpu;
        let loss = |v: f32| Tensor::new(v, &device).unwrap();

        let mut window = LossWindow::new();
        window.push(loss(1.0), 0).unwrap();
        window.push(loss(3.0), 1).unwrap();
        // a too-short example at step 2 contributes nothing

        let (sum, n, last) = window.take().unwrap();
        assert_eq!(n, 2);
        assert_eq!(last, 1);
        assert_eq!(sum.to_scalar::<f32>().unwrap(), 4.0);
        assert!(window.take().is_none());
    }

    #[test]
    fn training_text_carries_the_inference_template() {
        let ex = TrainingExample {
            instruction: "say hi".into(),
            response: "hi".into(),
        };
        let text = prompt::training_text(&ex.instruction, &ex.response);
        assert_eq!(text, "### Instruction:\nsay hi\n\n### Response:\nhi");
    }
}
