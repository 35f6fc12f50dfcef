//! Pegasus encoder-decoder: sinusoidal positions, pre-norm layers with a
//! final layer norm on both stacks, LM head tied to the shared embeddings.

use super::generation::StepDecoder;
use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Activation, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

fn default_max_position_embeddings() -> usize {
    1024
}

fn default_activation() -> Activation {
    Activation::Relu
}

fn default_true() -> bool {
    true
}

fn default_eos_token_id() -> u32 {
    1
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub decoder_ffn_dim: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_activation")]
    pub activation_function: Activation,
    #[serde(default = "default_true")]
    pub scale_embedding: bool,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl Config {
    fn embed_scale(&self) -> f64 {
        if self.scale_embedding {
            (self.d_model as f64).sqrt()
        } else {
            1.0
        }
    }
}

/// Fixed table: sines of every even frequency first, then cosines.
pub fn sinusoidal_positions(
    num_positions: usize,
    dim: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let sin_width = dim.div_ceil(2);
    let mut table = vec![0f32; num_positions * dim];
    for pos in 0..num_positions {
        let row = &mut table[pos * dim..(pos + 1) * dim];
        for j in 0..dim {
            let pair = if j < sin_width { j } else { j - sin_width };
            let angle = pos as f64 / 10000f64.powf((2 * pair) as f64 / dim as f64);
            row[j] = if j < sin_width {
                angle.sin() as f32
            } else {
                angle.cos() as f32
            };
        }
    }
    Tensor::from_vec(table, (num_positions, dim), device)?.to_dtype(dtype)
}

/// Additive mask `(batch, 1, 1, src)` hiding padded encoder positions.
pub fn padding_mask(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, src) = attention_mask.dims2()?;
    let values: Vec<f32> = attention_mask
        .to_dtype(DType::U32)?
        .flatten_all()?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|m| if m == 0 { f32::NEG_INFINITY } else { 0. })
        .collect();
    Tensor::from_vec(values, (batch, 1, 1, src), attention_mask.device())?.to_dtype(dtype)
}

fn causal_mask(q_len: usize, past_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let k_len = past_len + q_len;
    let values: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..k_len).map(move |j| {
                if j > past_len + i {
                    f32::NEG_INFINITY
                } else {
                    0.
                }
            })
        })
        .collect();
    Tensor::from_vec(values, (1, 1, q_len, k_len), device)?.to_dtype(dtype)
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
    is_decoder: bool,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn new(d_model: usize, num_heads: usize, is_decoder: bool, vb: VarBuilder) -> Result<Self> {
        let head_dim = d_model / num_heads;
        Ok(Self {
            q_proj: linear(d_model, d_model, vb.pp("q_proj"))?,
            k_proj: linear(d_model, d_model, vb.pp("k_proj"))?,
            v_proj: linear(d_model, d_model, vb.pp("v_proj"))?,
            out_proj: linear(d_model, d_model, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
            is_decoder,
            kv_cache: None,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq, _) = xs.dims3()?;
        xs.reshape((b, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Self-attention when `kv_states` is `None`, cross-attention otherwise.
    fn forward(
        &mut self,
        xs: &Tensor,
        kv_states: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, q_len, d_model) = xs.dims3()?;
        let q = self.split_heads(&(self.q_proj.forward(xs)? * self.scaling)?)?;

        let (k, v) = match kv_states {
            None => {
                let k = self.split_heads(&self.k_proj.forward(xs)?)?;
                let v = self.split_heads(&self.v_proj.forward(xs)?)?;
                let (k, v) = match (&self.kv_cache, self.is_decoder) {
                    (Some((past_k, past_v)), true) => (
                        Tensor::cat(&[past_k, &k], 2)?,
                        Tensor::cat(&[past_v, &v], 2)?,
                    ),
                    _ => (k, v),
                };
                if self.is_decoder {
                    self.kv_cache = Some((k.clone(), v.clone()));
                }
                (k, v)
            }
            Some(kv_states) => match &self.kv_cache {
                // encoder states do not change between steps
                Some((k, v)) => (k.clone(), v.clone()),
                None => {
                    let k = self.split_heads(&self.k_proj.forward(kv_states)?)?;
                    let v = self.split_heads(&self.v_proj.forward(kv_states)?)?;
                    self.kv_cache = Some((k.clone(), v.clone()));
                    (k, v)
                }
            },
        };

        let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(&v)?;
        let out = out.transpose(1, 2)?.reshape((b, q_len, d_model))?;
        self.out_proj.forward(&out)
    }

    fn past_len(&self) -> usize {
        self.kv_cache
            .as_ref()
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }

    fn reorder_cache(&mut self, rows: &Tensor) -> Result<()> {
        if let Some((k, v)) = &self.kv_cache {
            self.kv_cache = Some((k.index_select(rows, 0)?, v.index_select(rows, 0)?));
        }
        Ok(())
    }

    fn clear_cache(&mut self) {
        self.kv_cache = None
    }
}

#[derive(Debug, Clone)]
struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl FeedForward {
    fn new(d_model: usize, ffn_dim: usize, activation: Activation, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(d_model, ffn_dim, vb.pp("fc1"))?,
            fc2: linear(ffn_dim, d_model, vb.pp("fc2"))?,
            activation,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.activation.forward(&self.fc1.forward(xs)?)?;
        self.fc2.forward(&xs)
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(
                cfg.d_model,
                cfg.encoder_attention_heads,
                false,
                vb.pp("self_attn"),
            )?,
            self_attn_layer_norm: layer_norm(
                cfg.d_model,
                cfg.layer_norm_eps,
                vb.pp("self_attn_layer_norm"),
            )?,
            ffn: FeedForward::new(
                cfg.d_model,
                cfg.encoder_ffn_dim,
                cfg.activation_function,
                &vb,
            )?,
            final_layer_norm: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let h = self.self_attn_layer_norm.forward(xs)?;
        let xs = (xs + self.self_attn.forward(&h, None, mask)?)?;
        let h = self.final_layer_norm.forward(&xs)?;
        &xs + self.ffn.forward(&h)?
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let heads = cfg.decoder_attention_heads;
        Ok(Self {
            self_attn: Attention::new(cfg.d_model, heads, true, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(
                cfg.d_model,
                cfg.layer_norm_eps,
                vb.pp("self_attn_layer_norm"),
            )?,
            encoder_attn: Attention::new(cfg.d_model, heads, true, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: layer_norm(
                cfg.d_model,
                cfg.layer_norm_eps,
                vb.pp("encoder_attn_layer_norm"),
            )?,
            ffn: FeedForward::new(
                cfg.d_model,
                cfg.decoder_ffn_dim,
                cfg.activation_function,
                &vb,
            )?,
            final_layer_norm: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        encoder_xs: &Tensor,
        self_mask: Option<&Tensor>,
        encoder_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let h = self.self_attn_layer_norm.forward(xs)?;
        let xs = (xs + self.self_attn.forward(&h, None, self_mask)?)?;
        let h = self.encoder_attn_layer_norm.forward(&xs)?;
        let xs = (&xs + self.encoder_attn.forward(&h, Some(encoder_xs), encoder_mask)?)?;
        let h = self.final_layer_norm.forward(&xs)?;
        &xs + self.ffn.forward(&h)?
    }
}

fn embed(
    embed_tokens: &Embedding,
    embed_positions: &Tensor,
    embed_scale: f64,
    input_ids: &Tensor,
    past_len: usize,
) -> Result<Tensor> {
    let (_, seq) = input_ids.dims2()?;
    let capacity = embed_positions.dim(0)?;
    if past_len + seq > capacity {
        bail!(
            "position {} is out of range for {} position embeddings",
            past_len + seq - 1,
            capacity
        );
    }
    let xs = (embed_tokens.forward(input_ids)? * embed_scale)?;
    xs.broadcast_add(&embed_positions.narrow(0, past_len, seq)?)
}

#[derive(Debug, Clone)]
struct Encoder {
    embed_tokens: Embedding,
    embed_positions: Tensor,
    embed_scale: f64,
    layers: Vec<EncoderLayer>,
    layer_norm: LayerNorm,
}

impl Encoder {
    fn new(cfg: &Config, shared: Embedding, positions: Tensor, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.encoder_layers)
            .map(|i| EncoderLayer::new(cfg, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: shared,
            embed_positions: positions,
            embed_scale: cfg.embed_scale(),
            layers,
            layer_norm: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
        })
    }

    fn forward(&mut self, input_ids: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let mut xs = embed(
            &self.embed_tokens,
            &self.embed_positions,
            self.embed_scale,
            input_ids,
            0,
        )?;
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, mask)?;
        }
        self.layer_norm.forward(&xs)
    }
}

#[derive(Debug, Clone)]
struct Decoder {
    embed_tokens: Embedding,
    embed_positions: Tensor,
    embed_scale: f64,
    layers: Vec<DecoderLayer>,
    layer_norm: LayerNorm,
}

impl Decoder {
    fn new(cfg: &Config, shared: Embedding, positions: Tensor, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.decoder_layers)
            .map(|i| DecoderLayer::new(cfg, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: shared,
            embed_positions: positions,
            embed_scale: cfg.embed_scale(),
            layers,
            layer_norm: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
        })
    }

    fn past_len(&self) -> usize {
        self.layers.first().map_or(0, |l| l.self_attn.past_len())
    }

    fn forward(
        &mut self,
        input_ids: &Tensor,
        encoder_xs: &Tensor,
        encoder_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let past_len = self.past_len();
        let (_, seq) = input_ids.dims2()?;
        let mut xs = embed(
            &self.embed_tokens,
            &self.embed_positions,
            self.embed_scale,
            input_ids,
            past_len,
        )?;
        let self_mask = if seq > 1 {
            Some(causal_mask(seq, past_len, xs.dtype(), xs.device())?)
        } else {
            None
        };
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, encoder_xs, self_mask.as_ref(), encoder_mask)?;
        }
        self.layer_norm.forward(&xs)
    }

    /// Cross-attention caches are shared by every beam of an input and are
    /// left in place.
    fn reorder_cache(&mut self, rows: &Tensor) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.self_attn.reorder_cache(rows)?;
        }
        Ok(())
    }

    fn clear_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.clear_cache();
            layer.encoder_attn.clear_cache();
        }
    }
}

#[derive(Debug, Clone)]
pub struct PegasusForConditionalGeneration {
    encoder: Encoder,
    decoder: Decoder,
    lm_head: Linear,
    final_logits_bias: Tensor,
    dtype: DType,
    device: Device,
}

impl PegasusForConditionalGeneration {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let shared = embedding(cfg.vocab_size, cfg.d_model, vb.pp("model.shared"))?;
        let positions =
            sinusoidal_positions(cfg.max_position_embeddings, cfg.d_model, vb.dtype(), vb.device())?;
        let encoder = Encoder::new(cfg, shared.clone(), positions.clone(), vb.pp("model.encoder"))?;
        let decoder = Decoder::new(cfg, shared.clone(), positions, vb.pp("model.decoder"))?;
        let final_logits_bias = if vb.contains_tensor("final_logits_bias") {
            vb.get((1, cfg.vocab_size), "final_logits_bias")?
        } else {
            Tensor::zeros((1, cfg.vocab_size), vb.dtype(), vb.device())?
        };
        let lm_head = Linear::new(shared.embeddings().clone(), None);

        Ok(Self {
            encoder,
            decoder,
            lm_head,
            final_logits_bias,
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encode(&mut self, input_ids: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        self.encoder.forward(input_ids, mask)
    }

    /// Logits `(batch, seq, vocab)` for decoder inputs following whatever is
    /// already cached.
    pub fn decode(
        &mut self,
        decoder_input_ids: &Tensor,
        encoder_xs: &Tensor,
        encoder_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let xs = self
            .decoder
            .forward(decoder_input_ids, encoder_xs, encoder_mask)?;
        self.lm_head.forward(&xs)?.broadcast_add(&self.final_logits_bias)
    }

    pub fn reorder_cache(&mut self, rows: &Tensor) -> Result<()> {
        self.decoder.reorder_cache(rows)
    }

    pub fn clear_kv_cache(&mut self) {
        self.decoder.clear_cache()
    }
}

/// One generation run over an encoded batch, each input repeated once per
/// beam.
pub struct DecodingSession<'a> {
    model: &'a mut PegasusForConditionalGeneration,
    encoder_xs: Tensor,
    encoder_mask: Tensor,
}

impl<'a> DecodingSession<'a> {
    pub fn new(
        model: &'a mut PegasusForConditionalGeneration,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        num_beams: usize,
    ) -> Result<Self> {
        model.clear_kv_cache();
        let dtype = model.dtype();
        let mask = padding_mask(attention_mask, dtype)?;
        let encoder_xs = model.encode(input_ids, Some(&mask))?;

        let (batch, _) = input_ids.dims2()?;
        let rows: Vec<u32> = (0..batch as u32)
            .flat_map(|b| std::iter::repeat(b).take(num_beams.max(1)))
            .collect();
        let rows = Tensor::new(rows.as_slice(), model.device())?;

        Ok(Self {
            encoder_xs: encoder_xs.index_select(&rows, 0)?,
            encoder_mask: mask.index_select(&rows, 0)?,
            model,
        })
    }
}

impl StepDecoder for DecodingSession<'_> {
    fn step(&mut self, tokens: &[u32], _position: usize) -> anyhow::Result<Tensor> {
        let input = Tensor::new(tokens, self.model.device())?.unsqueeze(1)?;
        let logits = self
            .model
            .decode(&input, &self.encoder_xs, Some(&self.encoder_mask))?;
        Ok(logits.squeeze(1)?)
    }

    fn reorder(&mut self, rows: &[usize]) -> anyhow::Result<()> {
        let rows: Vec<u32> = rows.iter().map(|r| *r as u32).collect();
        let rows = Tensor::new(rows.as_slice(), self.model.device())?;
        self.model.reorder_cache(&rows)?;
        Ok(())
    }
}

impl Drop for DecodingSession<'_> {
    fn drop(&mut self) {
        self.model.clear_kv_cache()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::seq2seq::generation::{generate, GenerationConfig};
    use candle_nn::VarMap;

    pub(crate) fn tiny_config() -> Config {
        serde_json::from_str(
            r#"{
                "vocab_size": 12,
                "d_model": 8,
                "encoder_layers": 2,
                "decoder_layers": 2,
                "encoder_attention_heads": 2,
                "decoder_attention_heads": 2,
                "encoder_ffn_dim": 16,
                "decoder_ffn_dim": 16,
                "max_position_embeddings": 16,
                "activation_function": "relu",
                "scale_embedding": true
            }"#,
        )
        .expect("tiny config")
    }

    fn tiny_model() -> Result<PegasusForConditionalGeneration> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        PegasusForConditionalGeneration::load(vb, &tiny_config())
    }

    #[test]
    fn test_config_defaults() {
        let cfg = tiny_config();
        assert_eq!(cfg.activation_function, Activation::Relu);
        assert_eq!(cfg.eos_token_id, 1);
        assert_eq!(cfg.layer_norm_eps, 1e-5);
        assert_eq!(cfg.embed_scale(), 8f64.sqrt());
    }

    #[test]
    fn test_sinusoidal_positions_layout() -> Result<()> {
        let table = sinusoidal_positions(3, 4, DType::F32, &Device::Cpu)?.to_vec2::<f32>()?;
        // position 0: sin(0) = 0 then cos(0) = 1
        assert_eq!(table[0], vec![0., 0., 1., 1.]);
        let expected = [1f64.sin(), 0.01f64.sin(), 1f64.cos(), 0.01f64.cos()];
        for (got, want) in table[1].iter().zip(expected) {
            assert!((*got as f64 - want).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_padding_mask() -> Result<()> {
        let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu)?;
        let additive = padding_mask(&mask, DType::F32)?;
        assert_eq!(additive.dims(), &[1, 1, 1, 3]);
        let values = additive.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values[..2], [0., 0.]);
        assert!(values[2].is_infinite());
        Ok(())
    }

    #[test]
    fn test_causal_mask_with_past() -> Result<()> {
        let mask = causal_mask(2, 1, DType::F32, &Device::Cpu)?
            .squeeze(0)?
            .squeeze(0)?
            .to_vec2::<f32>()?;
        assert_eq!(mask[0][..2], [0., 0.]);
        assert!(mask[0][2].is_infinite());
        assert_eq!(mask[1], vec![0., 0., 0.]);
        Ok(())
    }

    #[test]
    fn test_decode_shapes_and_cache() -> Result<()> {
        let mut model = tiny_model()?;
        let input_ids = Tensor::new(&[[4u32, 5, 6, 1], [7, 1, 0, 0]], &Device::Cpu)?;
        let mask = Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 0, 0]], &Device::Cpu)?;
        let additive = padding_mask(&mask, DType::F32)?;
        let encoded = model.encode(&input_ids, Some(&additive))?;
        assert_eq!(encoded.dims(), &[2, 4, 8]);

        let start = Tensor::new(&[[0u32], [0]], &Device::Cpu)?;
        let logits = model.decode(&start, &encoded, Some(&additive))?;
        assert_eq!(logits.dims(), &[2, 1, 12]);
        assert_eq!(model.decoder.past_len(), 1);

        let next = Tensor::new(&[[3u32], [3]], &Device::Cpu)?;
        model.decode(&next, &encoded, Some(&additive))?;
        assert_eq!(model.decoder.past_len(), 2);

        model.clear_kv_cache();
        assert_eq!(model.decoder.past_len(), 0);
        Ok(())
    }

    #[test]
    fn test_positions_out_of_range() -> Result<()> {
        let mut model = tiny_model()?;
        let input_ids = Tensor::zeros((1, 17), DType::U32, &Device::Cpu)?;
        let err = model.encode(&input_ids, None).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        Ok(())
    }

    #[test]
    fn test_session_generates_with_beams() -> anyhow::Result<()> {
        let mut model = tiny_model()?;
        let input_ids = Tensor::new(&[[4u32, 5, 1], [6, 1, 0]], &Device::Cpu)?;
        let mask = Tensor::new(&[[1u32, 1, 1], [1, 1, 0]], &Device::Cpu)?;
        let config = GenerationConfig::default()
            .with_max_length(5)
            .with_num_beams(3);

        let outputs = {
            let mut session = DecodingSession::new(&mut model, &input_ids, &mask, 3)?;
            generate(&mut session, &config, 2)?
        };
        assert_eq!(outputs.len(), 2);
        for output in outputs {
            assert_eq!(output[0], 0);
            assert!(output.len() <= 5);
        }
        assert_eq!(model.decoder.past_len(), 0);
        Ok(())
    }
}
