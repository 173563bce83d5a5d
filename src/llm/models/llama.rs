//! Llama-family causal LM with optional low-rank adapters.
//!
//! The base projections can be held in 4-bit quantized form (frozen, for
//! adapter training) or as plain linears (inference). LoRA matrices are
//! attached to the projections named in the adapter config; everything else
//! stays untouched base weights.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Embedding, Linear, Module, VarBuilder};
use serde::Deserialize;

pub const MAX_SEQ_LEN: usize = 4096;

#[derive(Debug, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope")]
    pub rope_theta: f32,
}

fn default_rope() -> f32 {
    10_000.0
}

impl LlamaConfig {
    pub fn into_config(self) -> Config {
        Config {
            hidden_size: self.hidden_size,
            intermediate_size: self.intermediate_size,
            vocab_size: self.vocab_size,
            num_hidden_layers: self.num_hidden_layers,
            num_attention_heads: self.num_attention_heads,
            num_key_value_heads: self.num_key_value_heads.unwrap_or(self.num_attention_heads),
            rms_norm_eps: self.rms_norm_eps,
            rope_theta: self.rope_theta,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f32,
}

/// Where the trainable/loaded LoRA tensors come from and how they are scoped.
///
/// The builder paths mirror the base weight names, so an adapter tensor for
/// the first layer's query projection ends up as
/// `model.layers.0.self_attn.q_proj.lora_a.weight`.
pub struct LoraSpec<'a> {
    pub vb: VarBuilder<'a>,
    pub rank: usize,
    pub scale: f64,
    pub dropout: f32,
    pub targets: Vec<String>,
    pub train: bool,
}

impl<'a> LoraSpec<'a> {
    fn pp<S: ToString>(&self, s: S) -> LoraSpec<'a> {
        LoraSpec {
            vb: self.vb.pp(s),
            rank: self.rank,
            scale: self.scale,
            dropout: self.dropout,
            targets: self.targets.clone(),
            train: self.train,
        }
    }

    fn targets(&self, name: &str) -> bool {
        self.targets.iter().any(|t| t == name)
    }
}

#[derive(Clone)]
pub struct Cache {
    masks: Arc<Mutex<HashMap<usize, Tensor>>>,
    pub use_kv_cache: bool,
    #[allow(clippy::type_complexity)]
    kvs: Arc<Mutex<Vec<Option<(Tensor, Tensor)>>>>,
    cos: Tensor,
    sin: Tensor,
    device: Device,
}

impl Cache {
    pub fn new(use_kv_cache: bool, dtype: DType, config: &Config, device: &Device) -> Result<Self> {
        // precompute freqs_cis
        let n_elem = config.hidden_size / config.num_attention_heads;
        let theta: Vec<_> = (0..n_elem)
            .step_by(2)
            .map(|i| 1f32 / config.rope_theta.powf(i as f32 / n_elem as f32))
            .collect();
        let theta = Tensor::new(theta.as_slice(), device)?;
        let idx_theta = Tensor::arange(0, MAX_SEQ_LEN as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((MAX_SEQ_LEN, 1))?
            .matmul(&theta.reshape((1, theta.elem_count()))?)?;
        let idx_theta = Tensor::cat(&[&idx_theta, &idx_theta], D::Minus1)?;
        let cos = idx_theta.cos()?.to_dtype(dtype)?;
        let sin = idx_theta.sin()?.to_dtype(dtype)?;
        Ok(Self {
            masks: Arc::new(Mutex::new(HashMap::new())),
            use_kv_cache,
            kvs: Arc::new(Mutex::new(vec![None; config.num_hidden_layers])),
            cos,
            sin,
            device: device.clone(),
        })
    }

    fn mask(&self, t: usize) -> Result<Tensor> {
        let mut masks = self.masks.lock().expect("mask cache poisoned");
        if let Some(mask) = masks.get(&t) {
            Ok(mask.clone())
        } else {
            let mask: Vec<_> = (0..t)
                .flat_map(|i| (0..t).map(move |j| u8::from(j > i)))
                .collect();
            let mask = Tensor::from_slice(&mask, (t, t), &self.device)?;
            masks.insert(t, mask.clone());
            Ok(mask)
        }
    }
}

/// Frozen base projection: either a plain linear or a 4-bit tensor that is
/// dequantized on the fly (the adapter-training configuration).
#[derive(Clone)]
enum BaseLinear {
    Full(Linear),
    Quant(Arc<QTensor>),
}

impl BaseLinear {
    fn load(in_dim: usize, out_dim: usize, quant: bool, vb: VarBuilder) -> Result<Self> {
        let inner = candle_nn::linear_no_bias(in_dim, out_dim, vb)?;
        if quant {
            let q = QTensor::quantize(inner.weight(), GgmlDType::Q4_0)?;
            Ok(Self::Quant(Arc::new(q)))
        } else {
            Ok(Self::Full(inner))
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Full(inner) => inner.forward(x),
            Self::Quant(q) => {
                let weight = q.dequantize(x.device())?;
                Linear::new(weight, None).forward(x)
            }
        }
    }
}

#[derive(Clone)]
struct LowRank {
    a: Linear,
    b: Linear,
    scale: f64,
    dropout: f32,
    train: bool,
}

#[derive(Clone)]
pub struct LlamaLinear {
    base: BaseLinear,
    lora: Option<LowRank>,
    span: tracing::Span,
}

impl LlamaLinear {
    fn load(
        in_dim: usize,
        out_dim: usize,
        quant: bool,
        vb: VarBuilder,
        lora: Option<LoraSpec>,
    ) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "linear");
        let base = BaseLinear::load(in_dim, out_dim, quant, vb)?;
        let lora = match lora {
            None => None,
            Some(spec) => {
                let a = spec.vb.get_with_hints(
                    (spec.rank, in_dim),
                    "lora_a.weight",
                    candle_nn::init::DEFAULT_KAIMING_NORMAL,
                )?;
                let b = spec.vb.get_with_hints(
                    (out_dim, spec.rank),
                    "lora_b.weight",
                    candle_nn::init::ZERO,
                )?;
                Some(LowRank {
                    a: Linear::new(a, None),
                    b: Linear::new(b, None),
                    scale: spec.scale,
                    dropout: spec.dropout,
                    train: spec.train,
                })
            }
        };
        Ok(Self { base, lora, span })
    }
}

impl Module for LlamaLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let base = self.base.forward(x)?;
        let lora = match &self.lora {
            None => return Ok(base),
            Some(lora) => lora,
        };
        // LoRA matrices stay in their own dtype (f32), cast around them.
        let xs = if x.dtype() != lora.a.weight().dtype() {
            x.to_dtype(lora.a.weight().dtype())?
        } else {
            x.clone()
        };
        let xs = if lora.train && lora.dropout > 0. {
            candle_nn::ops::dropout(&xs, lora.dropout)?
        } else {
            xs
        };
        let delta = lora
            .b
            .forward(&lora.a.forward(&xs)?)?
            .affine(lora.scale, 0.0)?
            .to_dtype(base.dtype())?;
        base + delta
    }
}

#[derive(Clone)]
struct RmsNorm {
    inner: candle_nn::RmsNorm,
    span: tracing::Span,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "rms-norm");
        let inner = candle_nn::rms_norm(size, eps, vb)?;
        Ok(Self { inner, span })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(x)
    }
}

#[derive(Clone)]
struct CausalSelfAttention {
    q_proj: LlamaLinear,
    k_proj: LlamaLinear,
    v_proj: LlamaLinear,
    o_proj: LlamaLinear,
    num_attention_heads: usize,
    num_key_value_heads: usize,
    head_dim: usize,
    span: tracing::Span,
    span_rot: tracing::Span,
}

impl CausalSelfAttention {
    fn apply_rotary_emb(&self, x: &Tensor, index_pos: usize, cache: &Cache) -> Result<Tensor> {
        let _enter = self.span_rot.enter();
        let (b_sz, _, seq_len, hidden_size) = x.dims4()?;
        let cos = cache.cos.narrow(0, index_pos, seq_len)?;
        let sin = cache.sin.narrow(0, index_pos, seq_len)?;
        let cos = cos.broadcast_as((b_sz, 1, seq_len, hidden_size))?;
        let sin = sin.broadcast_as((b_sz, 1, seq_len, hidden_size))?;
        let x1 = x.narrow(D::Minus1, 0, hidden_size / 2)?;
        let x2 = x.narrow(D::Minus1, hidden_size / 2, hidden_size / 2)?;
        let rotate_x = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
        let rope = (x.broadcast_mul(&cos)? + rotate_x.broadcast_mul(&sin)?)?;
        Ok(rope)
    }

    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        block_idx: usize,
        cache: &Cache,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, seq_len, hidden_size) = x.dims3()?;
        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((b_sz, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b_sz, seq_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?;
        let mut v = v
            .reshape((b_sz, seq_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = self.apply_rotary_emb(&q, index_pos, cache)?;
        let mut k = self.apply_rotary_emb(&k, index_pos, cache)?;

        if cache.use_kv_cache {
            let mut kvs = cache.kvs.lock().expect("kv cache poisoned");
            if let Some((cache_k, cache_v)) = &kvs[block_idx] {
                k = Tensor::cat(&[cache_k, &k], 2)?.contiguous()?;
                v = Tensor::cat(&[cache_v, &v], 2)?.contiguous()?;
            }
            kvs[block_idx] = Some((k.clone(), v.clone()));
        }

        let k = self.repeat_kv(k)?;
        let v = self.repeat_kv(v)?;

        let in_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;
        let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let att = if seq_len == 1 {
            att
        } else {
            let mask = cache.mask(seq_len)?.broadcast_as(att.shape())?;
            masked_fill(&att, &mask, f32::NEG_INFINITY)?
        };
        let att = candle_nn::ops::softmax(&att, D::Minus1)?;
        // matmul needs contiguous rhs for the strided case
        let y = att.matmul(&v.contiguous()?)?.to_dtype(in_dtype)?;
        let y = y.transpose(1, 2)?.reshape(&[b_sz, seq_len, hidden_size])?;
        self.o_proj.forward(&y)
    }

    fn repeat_kv(&self, x: Tensor) -> Result<Tensor> {
        let n_rep = self.num_attention_heads / self.num_key_value_heads;
        if n_rep == 1 {
            Ok(x)
        } else {
            let (b_sz, n_kv_head, seq_len, head_dim) = x.dims4()?;
            let x = x
                .unsqueeze(2)?
                .expand((b_sz, n_kv_head, n_rep, seq_len, head_dim))?
                .reshape((b_sz, n_kv_head * n_rep, seq_len, head_dim))?;
            Ok(x)
        }
    }

    fn load(vb: VarBuilder, lora: Option<&LoraSpec>, cfg: &Config, quant: bool) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "attn");
        let span_rot = tracing::span!(tracing::Level::TRACE, "attn-rot");
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        let size_in = cfg.hidden_size;
        let size_q = head_dim * cfg.num_attention_heads;
        let size_kv = head_dim * cfg.num_key_value_heads;
        let lora_for = |name: &str| {
            lora.filter(|spec| spec.targets(name))
                .map(|spec| spec.pp(name))
        };
        let q_proj = LlamaLinear::load(size_in, size_q, quant, vb.pp("q_proj"), lora_for("q_proj"))?;
        let k_proj =
            LlamaLinear::load(size_in, size_kv, quant, vb.pp("k_proj"), lora_for("k_proj"))?;
        let v_proj =
            LlamaLinear::load(size_in, size_kv, quant, vb.pp("v_proj"), lora_for("v_proj"))?;
        let o_proj = LlamaLinear::load(size_q, size_in, quant, vb.pp("o_proj"), lora_for("o_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_attention_heads: cfg.num_attention_heads,
            num_key_value_heads: cfg.num_key_value_heads,
            head_dim,
            span,
            span_rot,
        })
    }
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = mask.shape();
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

#[derive(Clone)]
struct Mlp {
    c_fc1: LlamaLinear,
    c_fc2: LlamaLinear,
    c_proj: LlamaLinear,
    span: tracing::Span,
}

impl Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = (candle_nn::ops::silu(&self.c_fc1.forward(x)?)? * self.c_fc2.forward(x)?)?;
        self.c_proj.forward(&x)
    }

    fn load(vb: VarBuilder, lora: Option<&LoraSpec>, cfg: &Config, quant: bool) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "mlp");
        let h_size = cfg.hidden_size;
        let i_size = cfg.intermediate_size;
        let lora_for = |name: &str| {
            lora.filter(|spec| spec.targets(name))
                .map(|spec| spec.pp(name))
        };
        let c_fc1 =
            LlamaLinear::load(h_size, i_size, quant, vb.pp("gate_proj"), lora_for("gate_proj"))?;
        let c_fc2 = LlamaLinear::load(h_size, i_size, quant, vb.pp("up_proj"), lora_for("up_proj"))?;
        let c_proj =
            LlamaLinear::load(i_size, h_size, quant, vb.pp("down_proj"), lora_for("down_proj"))?;
        Ok(Self {
            c_fc1,
            c_fc2,
            c_proj,
            span,
        })
    }
}

#[derive(Clone)]
struct Block {
    rms_1: RmsNorm,
    attn: CausalSelfAttention,
    rms_2: RmsNorm,
    mlp: Mlp,
    span: tracing::Span,
}

impl Block {
    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        block_idx: usize,
        cache: &Cache,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let residual = x;
        let x = self.rms_1.forward(x)?;
        let x = (self.attn.forward(&x, index_pos, block_idx, cache)? + residual)?;
        let residual = &x;
        let x = (self.mlp.forward(&self.rms_2.forward(&x)?)? + residual)?;
        Ok(x)
    }

    fn load(vb: VarBuilder, lora: Option<&LoraSpec>, cfg: &Config, quant: bool) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "block");
        let attn_lora = lora.map(|spec| spec.pp("self_attn"));
        let attn = CausalSelfAttention::load(vb.pp("self_attn"), attn_lora.as_ref(), cfg, quant)?;
        let mlp_lora = lora.map(|spec| spec.pp("mlp"));
        let mlp = Mlp::load(vb.pp("mlp"), mlp_lora.as_ref(), cfg, quant)?;
        let rms_1 = RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let rms_2 = RmsNorm::load(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            rms_1,
            attn,
            rms_2,
            mlp,
            span,
        })
    }
}

#[derive(Clone)]
pub struct Llama {
    wte: Embedding,
    blocks: Vec<Block>,
    ln_f: RmsNorm,
    lm_head: Linear,
}

impl Llama {
    /// Full-sequence logits, `(batch, seq, vocab)` in f32.
    pub fn forward(&self, x: &Tensor, index_pos: usize, cache: &Cache) -> Result<Tensor> {
        let mut x = self.wte.forward(x)?;
        for (block_idx, block) in self.blocks.iter().enumerate() {
            x = block.forward(&x, index_pos, block_idx, cache)?;
        }
        let x = self.ln_f.forward(&x)?;
        let logits = self.lm_head.forward(&x)?;
        logits.to_dtype(DType::F32)
    }

    /// Build the model. `quant` stores the frozen base projections in 4-bit
    /// form (training); `lora` attaches adapters to the named projections.
    pub fn load(
        vb: VarBuilder,
        lora: Option<&LoraSpec>,
        cfg: &Config,
        quant: bool,
    ) -> Result<Self> {
        let embeddings = vb
            .pp("model.embed_tokens")
            .get((cfg.vocab_size, cfg.hidden_size), "weight")?;
        let wte = Embedding::new(embeddings, cfg.hidden_size);
        let lm_head = candle_nn::linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?;
        let ln_f = RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("model.norm"))?;
        let blocks = (0..cfg.num_hidden_layers)
            .map(|i| {
                let block_lora = lora.map(|spec| spec.pp(format!("model.layers.{i}")));
                Block::load(
                    vb.pp(format!("model.layers.{i}")),
                    block_lora.as_ref(),
                    cfg,
                    quant,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            wte,
            blocks,
            ln_f,
            lm_head,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> Config {
        Config {
            hidden_size: 64,
            intermediate_size: 128,
            vocab_size: 97,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.0,
        }
    }

    fn input(device: &Device) -> Tensor {
        Tensor::new(&[[1u32, 5, 9, 2, 7]], device).unwrap()
    }

    #[test]
    fn forward_shape() {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Llama::load(vb, None, &cfg, false).unwrap();
        let cache = Cache::new(false, DType::F32, &cfg, &device).unwrap();
        let logits = model.forward(&input(&device), 0, &cache).unwrap();
        assert_eq!(logits.dims(), &[1, 5, 97]);
    }

    #[test]
    fn quantized_base_builds_and_runs() {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Llama::load(vb, None, &cfg, true).unwrap();
        let cache = Cache::new(false, DType::F32, &cfg, &device).unwrap();
        let logits = model.forward(&input(&device), 0, &cache).unwrap();
        assert_eq!(logits.dims(), &[1, 5, 97]);
    }

    #[test]
    fn zero_initialized_adapter_matches_base_output() {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let base_map = VarMap::new();
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &device);

        let plain = Llama::load(base_vb.clone(), None, &cfg, false).unwrap();

        let lora_map = VarMap::new();
        let spec = LoraSpec {
            vb: VarBuilder::from_varmap(&lora_map, DType::F32, &device),
            rank: 4,
            scale: 2.0,
            dropout: 0.05,
            targets: vec!["q_proj".to_string(), "v_proj".to_string()],
            train: false,
        };
        let adapted = Llama::load(base_vb, Some(&spec), &cfg, false).unwrap();

        let x = input(&device);
        let cache_a = Cache::new(false, DType::F32, &cfg, &device).unwrap();
        let cache_b = Cache::new(false, DType::F32, &cfg, &device).unwrap();
        let a = plain
            .forward(&x, 0, &cache_a)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let b = adapted
            .forward(&x, 0, &cache_b)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        // lora_b starts at zero, so the adapter contributes nothing yet
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn adapter_vars_only_cover_targets() {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let base_map = VarMap::new();
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &device);
        let lora_map = VarMap::new();
        let spec = LoraSpec {
            vb: VarBuilder::from_varmap(&lora_map, DType::F32, &device),
            rank: 4,
            scale: 2.0,
            dropout: 0.0,
            targets: vec!["q_proj".to_string(), "v_proj".to_string()],
            train: true,
        };
        let _model = Llama::load(base_vb, Some(&spec), &cfg, false).unwrap();
        // 2 layers * 2 targets * (lora_a + lora_b)
        assert_eq!(lora_map.all_vars().len(), 8);
        let data = lora_map.data().lock().unwrap();
        assert!(data.contains_key("model.layers.0.self_attn.q_proj.lora_a.weight"));
        assert!(data.contains_key("model.layers.1.self_attn.v_proj.lora_b.weight"));
        assert!(!data.keys().any(|k| k.contains("k_proj")));
    }
}
