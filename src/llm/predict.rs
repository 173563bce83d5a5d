//! Prompt formatting and the sampling loop.

use candle_core::{IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;
use rand::Rng;
use serde::Deserialize;

use super::models::llama::Cache;
use super::{prompt, ChatLlm};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateCfg {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,
}

fn default_max_new_tokens() -> usize {
    150
}
fn default_temperature() -> f64 {
    0.7
}
fn default_top_p() -> f64 {
    0.9
}
fn default_repeat_penalty() -> f32 {
    1.2
}
fn default_repeat_last_n() -> usize {
    64
}

impl Default for GenerateCfg {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
        }
    }
}

/// Token-sequence decoder, factored out so the continuation stripping can be
/// tested without a real tokenizer.
pub trait Decode {
    fn decode_ids(&self, ids: &[u32]) -> Result<String>;
}

impl Decode for tokenizers::Tokenizer {
    fn decode_ids(&self, ids: &[u32]) -> Result<String> {
        self.decode(ids, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }
}

/// Generate a response for a raw instruction. Sampling is seeded fresh per
/// call, so identical prompts yield different continuations.
pub fn run(message: &str, llm: &ChatLlm) -> Result<String> {
    let formatted = prompt::inference_prompt(message);
    let mut tokens = llm
        .tokenizer
        .encode(formatted.as_str(), true)
        .map_err(|e| Error::Tokenizer(e.to_string()))?
        .get_ids()
        .to_vec();
    let prompt_len = tokens.len();

    let gen = &llm.generate;
    let cache = Cache::new(true, llm.dtype, &llm.config, &llm.device)?;
    let seed = rand::thread_rng().gen();
    let mut logits_processor = LogitsProcessor::new(seed, Some(gen.temperature), Some(gen.top_p));

    let mut index_pos = 0;
    for index in 0..gen.max_new_tokens {
        let (context_size, context_index) = if index > 0 {
            (1, index_pos)
        } else {
            (tokens.len(), 0)
        };
        let ctxt = &tokens[tokens.len() - context_size..];
        let input = Tensor::new(ctxt, &llm.device)?.unsqueeze(0)?;
        let logits = llm.model.forward(&input, context_index, &cache)?;
        let seq_len = logits.dim(1)?;
        let logits = logits.i((0, seq_len - 1))?;
        let logits = if gen.repeat_penalty == 1. {
            logits
        } else {
            let start_at = tokens.len().saturating_sub(gen.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                gen.repeat_penalty,
                &tokens[start_at..],
            )?
        };
        index_pos += ctxt.len();

        let next_token = logits_processor.sample(&logits)?;
        if Some(next_token) == llm.eos_token_id {
            break;
        }
        tokens.push(next_token);
    }

    decode_continuation(&llm.tokenizer, &tokens, prompt_len)
}

/// Decode only the freshly generated suffix, dropping the prompt echo and
/// surrounding whitespace.
fn decode_continuation<D: Decode>(decoder: &D, tokens: &[u32], prompt_len: usize) -> Result<String> {
    let text = decoder.decode_ids(&tokens[prompt_len..])?;
    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decoder with a fixed id -> word table.
    struct TableDecoder(Vec<&'static str>);

    impl Decode for TableDecoder {
        fn decode_ids(&self, ids: &[u32]) -> Result<String> {
            Ok(ids
                .iter()
                .map(|&id| self.0[id as usize])
                .collect::<Vec<_>>()
                .join(""))
        }
    }

    #[test]
    fn continuation_excludes_prompt_tokens() {
        let decoder = TableDecoder(vec![
            "### Instruction:\n",
            "hello",
            "\n\n### Response:\n",
            " the",
            " answer",
            "\n",
        ]);
        // ids 0..=2 are the prompt, the rest is generated
        let tokens = [0, 1, 2, 3, 4, 5];
        let out = decode_continuation(&decoder, &tokens, 3).unwrap();
        assert_eq!(out, "the answer");
        assert!(!out.contains("### Instruction:"));
        assert!(!out.contains("### Response:"));
    }

    #[test]
    fn continuation_is_whitespace_trimmed() {
        let decoder = TableDecoder(vec!["ignored", "  hi  "]);
        let out = decode_continuation(&decoder, &[0, 1], 1).unwrap();
        assert_eq!(out, "hi");
    }

    #[test]
    fn empty_continuation_is_empty_string() {
        let decoder = TableDecoder(vec!["prompt"]);
        let out = decode_continuation(&decoder, &[0], 1).unwrap();
        assert_eq!(out, "");
    }
}
