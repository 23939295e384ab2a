//! ViLT for visual question answering, on candle.
//!
//! Weight names follow the `ViltForQuestionAnswering` checkpoints published on
//! the hub, so `pytorch_model.bin` and `model.safetensors` load as they are.

use crate::error::VqaError;
use candle_core::{DType, IndexOp, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

/// Classifier-head layer norm, a plain `nn.LayerNorm` upstream.
const HEAD_LAYER_NORM_EPS: f64 = 1e-5;

/// Additive attention bias for masked positions.
const MASKED_BIAS: f64 = -10000.0;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    Gelu,
    #[serde(alias = "gelu_new")]
    GeluApproximate,
    Relu,
}

impl HiddenAct {
    fn forward(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            HiddenAct::Gelu => xs.gelu_erf(),
            HiddenAct::GeluApproximate => xs.gelu(),
            HiddenAct::Relu => xs.relu(),
        }
    }
}

/// Architecture hyper-parameters read from a model `config.json`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViltConfig {
    pub vocab_size: usize,
    pub type_vocab_size: usize,
    pub modality_type_vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: HiddenAct,
    pub max_position_embeddings: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    pub layer_norm_eps: f64,
}

impl Default for ViltConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            type_vocab_size: 2,
            modality_type_vocab_size: 2,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: HiddenAct::Gelu,
            max_position_embeddings: 40,
            image_size: 384,
            patch_size: 32,
            num_channels: 3,
            layer_norm_eps: 1e-12,
        }
    }
}

impl ViltConfig {
    pub fn from_json(json: &str) -> Result<Self, String> {
        let config: Self = serde_json::from_str(json).map_err(|e| e.to_string())?;
        if config.num_attention_heads == 0 || config.hidden_size % config.num_attention_heads != 0
        {
            return Err(format!(
                "hidden_size {} is not divisible by {} attention heads",
                config.hidden_size, config.num_attention_heads
            ));
        }
        if config.patch_size == 0 || config.image_size < config.patch_size {
            return Err(format!(
                "image_size {} smaller than patch_size {}",
                config.image_size, config.patch_size
            ));
        }
        Ok(config)
    }

    /// Side of the square patch grid the position embeddings were trained on.
    pub fn patch_grid(&self) -> usize {
        self.image_size / self.patch_size
    }
}

struct TextEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl TextEmbeddings {
    fn new(config: &ViltConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            word_embeddings: candle_nn::embedding(
                config.vocab_size,
                hidden,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: candle_nn::embedding(
                config.max_position_embeddings,
                hidden,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: candle_nn::embedding(
                config.type_vocab_size,
                hidden,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: candle_nn::layer_norm(hidden, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor) -> candle_core::Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;

        let embeddings = self.word_embeddings.forward(input_ids)?;
        let embeddings = (embeddings + self.token_type_embeddings.forward(token_type_ids)?)?;
        let embeddings = (embeddings + self.position_embeddings.forward(&position_ids)?)?;
        self.layer_norm.forward(&embeddings)
    }
}

struct PatchEmbeddings {
    projection: Conv2d,
    cls_token: Tensor,
    position_embeddings: Tensor,
    patch_size: usize,
    patch_grid: usize,
}

impl PatchEmbeddings {
    fn new(config: &ViltConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        let patch_grid = config.patch_grid();
        let conv = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        Ok(Self {
            projection: candle_nn::conv2d(
                config.num_channels,
                hidden,
                config.patch_size,
                conv,
                vb.pp("patch_embeddings").pp("projection"),
            )?,
            cls_token: vb.get((1, 1, hidden), "cls_token")?,
            position_embeddings: vb.get(
                (1, patch_grid * patch_grid + 1, hidden),
                "position_embeddings",
            )?,
            patch_size: config.patch_size,
            patch_grid,
        })
    }

    /// `[1, 1 + patches, hidden]`: the image class token followed by every
    /// valid patch in raster order, position embeddings added.
    fn forward(&self, pixel_values: &Tensor, pixel_mask: &Tensor) -> Result<Tensor, VqaError> {
        let patches = self.projection.forward(pixel_values)?;
        let (_, hidden, rows, cols) = patches.dims4()?;
        let (valid_rows, valid_cols) = valid_patch_grid(pixel_mask, self.patch_size, rows, cols)?;

        let patches = patches
            .narrow(2, 0, valid_rows)?
            .narrow(3, 0, valid_cols)?
            .flatten_from(2)?
            .transpose(1, 2)?;

        let grid = self.position_embeddings.i((0, 1..))?.to_vec2::<f32>()?;
        let positions = interpolate_positions(&grid, self.patch_grid, valid_rows, valid_cols);
        let positions = Tensor::from_vec(
            positions,
            (1, valid_rows * valid_cols, hidden),
            patches.device(),
        )?;
        let patches = (patches + positions)?;

        let cls = (&self.cls_token + self.position_embeddings.i((.., 0..1, ..))?)?;
        Ok(Tensor::cat(&[&cls, &patches], 1)?)
    }
}

/// Rows and columns of patches covered by real pixels.
///
/// Padding only ever sits at the bottom and right, so the valid patches form
/// the top-left block. Each patch is sampled at its top-left pixel.
pub fn valid_patch_grid(
    pixel_mask: &Tensor,
    patch_size: usize,
    rows: usize,
    cols: usize,
) -> Result<(usize, usize), VqaError> {
    let mask = pixel_mask.i(0)?.to_vec2::<u32>()?;
    let at = |r: usize, c: usize| {
        mask.get(r * patch_size)
            .and_then(|row| row.get(c * patch_size))
            .is_some_and(|&m| m != 0)
    };

    let valid_rows = (0..rows).take_while(|&r| at(r, 0)).count();
    let valid_cols = (0..cols).take_while(|&c| at(0, c)).count();

    if valid_rows == 0 || valid_cols == 0 {
        return Err(VqaError::Shape("pixel mask has no valid patch".to_string()));
    }
    Ok((valid_rows, valid_cols))
}

/// Bilinear resampling (corner-aligned) of a square `grid x grid` table of
/// position embeddings to `rows x cols`, flattened row-major.
pub fn interpolate_positions(
    table: &[Vec<f32>],
    grid: usize,
    rows: usize,
    cols: usize,
) -> Vec<f32> {
    let dim = table.first().map_or(0, Vec::len);
    let source = |i: usize, out: usize| {
        if out > 1 && grid > 1 {
            i as f32 * (grid - 1) as f32 / (out - 1) as f32
        } else {
            0.0
        }
    };

    let mut out = Vec::with_capacity(rows * cols * dim);
    for r in 0..rows {
        let sy = source(r, rows);
        let y0 = (sy.floor() as usize).min(grid - 1);
        let y1 = (y0 + 1).min(grid - 1);
        let fy = sy - y0 as f32;

        for c in 0..cols {
            let sx = source(c, cols);
            let x0 = (sx.floor() as usize).min(grid - 1);
            let x1 = (x0 + 1).min(grid - 1);
            let fx = sx - x0 as f32;

            let (a, b) = (&table[y0 * grid + x0], &table[y0 * grid + x1]);
            let (d, e) = (&table[y1 * grid + x0], &table[y1 * grid + x1]);
            out.extend((0..dim).map(|k| {
                a[k] * (1.0 - fy) * (1.0 - fx)
                    + b[k] * (1.0 - fy) * fx
                    + d[k] * fy * (1.0 - fx)
                    + e[k] * fy * fx
            }));
        }
    }
    out
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(config: &ViltConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        let inner = vb.pp("attention");
        Ok(Self {
            query: candle_nn::linear(hidden, hidden, inner.pp("query"))?,
            key: candle_nn::linear(hidden, hidden, inner.pp("key"))?,
            value: candle_nn::linear(hidden, hidden, inner.pp("value"))?,
            output: candle_nn::linear(hidden, hidden, vb.pp("output").pp("dense"))?,
            num_heads: config.num_attention_heads,
            head_dim: hidden / config.num_attention_heads,
        })
    }

    fn forward(&self, xs: &Tensor, bias: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq_len, hidden) = xs.dims3()?;
        let heads = |t: Tensor| {
            t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };

        let q = heads(self.query.forward(xs)?)?;
        let k = heads(self.key.forward(xs)?)?;
        let v = heads(self.value.forward(xs)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores.broadcast_add(bias)?)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, hidden))?;
        self.output.forward(&context)
    }
}

struct EncoderLayer {
    layernorm_before: LayerNorm,
    attention: SelfAttention,
    layernorm_after: LayerNorm,
    intermediate: Linear,
    output: Linear,
    act: HiddenAct,
}

impl EncoderLayer {
    fn new(config: &ViltConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let (hidden, eps) = (config.hidden_size, config.layer_norm_eps);
        Ok(Self {
            layernorm_before: candle_nn::layer_norm(hidden, eps, vb.pp("layernorm_before"))?,
            attention: SelfAttention::new(config, vb.pp("attention"))?,
            layernorm_after: candle_nn::layer_norm(hidden, eps, vb.pp("layernorm_after"))?,
            intermediate: candle_nn::linear(
                hidden,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: candle_nn::linear(
                config.intermediate_size,
                hidden,
                vb.pp("output").pp("dense"),
            )?,
            act: config.hidden_act,
        })
    }

    // pre-norm block
    fn forward(&self, xs: &Tensor, bias: &Tensor) -> candle_core::Result<Tensor> {
        let attended = self
            .attention
            .forward(&self.layernorm_before.forward(xs)?, bias)?;
        let xs = (attended + xs)?;

        let hidden = self.intermediate.forward(&self.layernorm_after.forward(&xs)?)?;
        let hidden = self.output.forward(&self.act.forward(&hidden)?)?;
        hidden + xs
    }
}

/// Inputs of one forward pass, batch size one.
pub struct ViltInputs<'a> {
    pub input_ids: &'a Tensor,
    pub attention_mask: &'a Tensor,
    pub token_type_ids: &'a Tensor,
    pub pixel_values: &'a Tensor,
    pub pixel_mask: &'a Tensor,
}

/// Transformer over question tokens and image patches with an answer
/// classifier on the pooled first token.
pub struct ViltForQuestionAnswering {
    text_embeddings: TextEmbeddings,
    patch_embeddings: PatchEmbeddings,
    modality_embeddings: Embedding,
    layers: Vec<EncoderLayer>,
    layernorm: LayerNorm,
    pooler: Linear,
    head_in: Linear,
    head_norm: LayerNorm,
    head_out: Linear,
    num_labels: usize,
}

impl ViltForQuestionAnswering {
    pub fn new(config: &ViltConfig, num_labels: usize, vb: VarBuilder) -> Result<Self, VqaError> {
        let hidden = config.hidden_size;
        let vilt = vb.pp("vilt");
        let embeddings = vilt.pp("embeddings");
        let encoder = vilt.pp("encoder").pp("layer");
        let head = vb.pp("classifier");

        let layers = (0..config.num_hidden_layers)
            .map(|i| EncoderLayer::new(config, encoder.pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            text_embeddings: TextEmbeddings::new(config, embeddings.pp("text_embeddings"))?,
            patch_embeddings: PatchEmbeddings::new(config, embeddings.clone())?,
            modality_embeddings: candle_nn::embedding(
                config.modality_type_vocab_size,
                hidden,
                embeddings.pp("token_type_embeddings"),
            )?,
            layers,
            layernorm: candle_nn::layer_norm(hidden, config.layer_norm_eps, vilt.pp("layernorm"))?,
            pooler: candle_nn::linear(hidden, hidden, vilt.pp("pooler").pp("dense"))?,
            head_in: candle_nn::linear(hidden, hidden * 2, head.pp("0"))?,
            head_norm: candle_nn::layer_norm(hidden * 2, HEAD_LAYER_NORM_EPS, head.pp("1"))?,
            head_out: candle_nn::linear(hidden * 2, num_labels, head.pp("3"))?,
            num_labels,
        })
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Answer logits, `[1, num_labels]`.
    pub fn forward(&self, inputs: &ViltInputs) -> Result<Tensor, VqaError> {
        let text = self
            .text_embeddings
            .forward(inputs.input_ids, inputs.token_type_ids)?;
        let image = self
            .patch_embeddings
            .forward(inputs.pixel_values, inputs.pixel_mask)?;

        // modality 0 is text, 1 is image
        let modality = self.modality_embeddings.embeddings();
        let text = text.broadcast_add(&modality.i(0)?)?;
        let image = image.broadcast_add(&modality.i(1)?)?;

        let (batch, image_len, _) = image.dims3()?;
        let mask = Tensor::cat(
            &[
                &inputs.attention_mask.to_dtype(DType::F32)?,
                &Tensor::ones((batch, image_len), DType::F32, image.device())?,
            ],
            1,
        )?;
        let bias = mask
            .affine(-MASKED_BIAS, MASKED_BIAS)?
            .unsqueeze(1)?
            .unsqueeze(1)?;

        let mut hidden = Tensor::cat(&[&text, &image], 1)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &bias)?;
        }
        let hidden = self.layernorm.forward(&hidden)?;

        let pooled = self.pooler.forward(&hidden.i((.., 0))?)?.tanh()?;
        let head = self.head_norm.forward(&self.head_in.forward(&pooled)?)?;
        Ok(self.head_out.forward(&head.gelu_erf()?)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    /// A ViLT small enough to build with random weights in a test.
    pub(crate) fn tiny_config() -> ViltConfig {
        ViltConfig {
            vocab_size: 11,
            hidden_size: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            intermediate_size: 16,
            image_size: 64,
            patch_size: 32,
            ..Default::default()
        }
    }

    #[test]
    fn parses_hub_config() {
        let json = r#"{"architectures": ["ViltForQuestionAnswering"], "hidden_act": "gelu",
                       "hidden_size": 768, "image_size": 384, "max_position_embeddings": 40,
                       "modality_type_vocab_size": 2, "num_attention_heads": 12,
                       "num_hidden_layers": 12, "patch_size": 32, "max_image_length": -1,
                       "id2label": {"0": "net"}}"#;
        assert_eq!(ViltConfig::from_json(json).unwrap(), ViltConfig::default());
        assert!(ViltConfig::from_json(r#"{"hidden_size": 10, "num_attention_heads": 3}"#).is_err());
    }

    #[test]
    fn interpolation_keeps_the_trained_grid() {
        let table: Vec<Vec<f32>> = (0..4).map(|i| vec![i as f32, 10.0 * i as f32]).collect();
        let same = interpolate_positions(&table, 2, 2, 2);
        assert_eq!(same, vec![0.0, 0.0, 1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);
    }

    #[test]
    fn interpolation_blends_between_corners() {
        // [[0, 1], [2, 3]] resampled to one row of three columns
        let table: Vec<Vec<f32>> = (0..4).map(|i| vec![i as f32]).collect();
        assert_eq!(interpolate_positions(&table, 2, 1, 3), vec![0.0, 0.5, 1.0]);
        assert_eq!(interpolate_positions(&table, 2, 3, 1), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn valid_grid_follows_the_pixel_mask() {
        let full = Tensor::ones((1, 64, 96), DType::U32, &Device::Cpu).unwrap();
        assert_eq!(valid_patch_grid(&full, 32, 2, 3).unwrap(), (2, 3));

        let mut values = vec![0u32; 64 * 96];
        for r in 0..64 {
            for c in 0..40 {
                values[r * 96 + c] = 1;
            }
        }
        let padded = Tensor::from_vec(values, (1, 64, 96), &Device::Cpu).unwrap();
        assert_eq!(valid_patch_grid(&padded, 32, 2, 3).unwrap(), (2, 2));

        let empty = Tensor::zeros((1, 64, 96), DType::U32, &Device::Cpu).unwrap();
        assert!(valid_patch_grid(&empty, 32, 2, 3).is_err());
    }

    #[test]
    fn forward_yields_one_score_per_label() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ViltForQuestionAnswering::new(&tiny_config(), 5, vb).unwrap();

        let ids = Tensor::new(&[[2u32, 4, 5, 9, 3]], &Device::Cpu).unwrap();
        let ones = Tensor::ones((1, 5), DType::U32, &Device::Cpu).unwrap();
        let types = Tensor::zeros((1, 5), DType::U32, &Device::Cpu).unwrap();
        let pixels = Tensor::zeros((1, 3, 64, 96), DType::F32, &Device::Cpu).unwrap();
        let pixel_mask = Tensor::ones((1, 64, 96), DType::U32, &Device::Cpu).unwrap();

        let logits = model
            .forward(&ViltInputs {
                input_ids: &ids,
                attention_mask: &ones,
                token_type_ids: &types,
                pixel_values: &pixels,
                pixel_mask: &pixel_mask,
            })
            .unwrap();

        assert_eq!(logits.dims(), &[1, 5]);
        let scores = logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(scores.iter().all(|s| s.is_finite()));
    }
}
