//! Encodes an (image, question) pair into the inputs of a ViLT model.

use crate::{error::VqaError, source::RgbImage};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use serde::Deserialize;
use std::path::Path;
use tokenizers::{Tokenizer, TruncationParams};

/// Longest-edge cap relative to the shortest edge, as in the DETR-style resize.
const MAX_EDGE_RATIO: f32 = 1333.0 / 800.0;

/// `size` in a preprocessor config is either a number or `{"shortest_edge": n}`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(untagged)]
enum ConfigSize {
    Edge(u32),
    Shortest { shortest_edge: u32 },
}

impl ConfigSize {
    fn shortest_edge(self) -> u32 {
        match self {
            ConfigSize::Edge(edge) | ConfigSize::Shortest { shortest_edge: edge } => edge,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawImageConfig {
    #[serde(default)]
    size: Option<ConfigSize>,
    #[serde(default)]
    size_divisor: Option<u32>,
    #[serde(default)]
    image_mean: Option<[f32; 3]>,
    #[serde(default)]
    image_std: Option<[f32; 3]>,
    #[serde(default)]
    rescale_factor: Option<f32>,
    #[serde(default)]
    do_normalize: Option<bool>,
    #[serde(default)]
    resample: Option<u8>,
}

/// Image preprocessing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ViltImageConfig {
    pub shortest_edge: u32,
    pub size_divisor: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub rescale_factor: f32,
    pub normalize: bool,
    pub filter: FilterType,
}

impl Default for ViltImageConfig {
    fn default() -> Self {
        Self {
            shortest_edge: 384,
            size_divisor: 32,
            mean: [0.5; 3],
            std: [0.5; 3],
            rescale_factor: 1.0 / 255.0,
            normalize: true,
            filter: FilterType::CatmullRom,
        }
    }
}

impl ViltImageConfig {
    /// Reads a `preprocessor_config.json`; absent keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VqaError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|reason| VqaError::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        let raw: RawImageConfig = serde_json::from_str(json).map_err(|e| e.to_string())?;
        let defaults = Self::default();

        let config = Self {
            shortest_edge: raw
                .size
                .map(ConfigSize::shortest_edge)
                .unwrap_or(defaults.shortest_edge),
            size_divisor: raw.size_divisor.unwrap_or(defaults.size_divisor),
            mean: raw.image_mean.unwrap_or(defaults.mean),
            std: raw.image_std.unwrap_or(defaults.std),
            rescale_factor: raw.rescale_factor.unwrap_or(defaults.rescale_factor),
            normalize: raw.do_normalize.unwrap_or(defaults.normalize),
            filter: raw.resample.map(filter_from_pil).unwrap_or(defaults.filter),
        };

        if config.shortest_edge == 0 || config.size_divisor == 0 {
            return Err("size and size_divisor must be positive".to_string());
        }
        if config.std.iter().any(|&s| s == 0.0) {
            return Err("image_std must be non-zero".to_string());
        }

        Ok(config)
    }

    /// Output `(width, height)` for an input of the given size.
    ///
    /// The shortest edge is scaled to `shortest_edge`, the longest edge is
    /// capped at `shortest_edge * 1333 / 800`, and both sides are floored to a
    /// multiple of `size_divisor`.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        let edge = self.shortest_edge as f32;
        let max_edge = (edge * MAX_EDGE_RATIO).trunc();

        let scale = edge / w.min(h);
        let (mut new_w, mut new_h) = if h < w {
            (scale * w, edge)
        } else {
            (edge, scale * h)
        };

        let longest = new_w.max(new_h);
        if longest > max_edge {
            let shrink = max_edge / longest;
            new_w *= shrink;
            new_h *= shrink;
        }

        let divisor = self.size_divisor;
        let snap = |side: f32| {
            let rounded = (side + 0.5) as u32;
            (rounded / divisor * divisor).max(divisor)
        };

        (snap(new_w), snap(new_h))
    }
}

/// PIL resampling codes used in preprocessor configs.
fn filter_from_pil(code: u8) -> FilterType {
    match code {
        0 => FilterType::Nearest,
        1 => FilterType::Lanczos3,
        2 => FilterType::Triangle,
        _ => FilterType::CatmullRom,
    }
}

/// Model-ready tensors for one (image, question) pair, on the CPU.
#[derive(Debug, Clone)]
pub struct ViltEncoding {
    /// `[1, seq]` u32 token ids.
    pub input_ids: Tensor,
    /// `[1, seq]` u32, one for every real token.
    pub attention_mask: Tensor,
    /// `[1, seq]` u32 segment ids.
    pub token_type_ids: Tensor,
    /// `[1, 3, H, W]` f32, normalized.
    pub pixel_values: Tensor,
    /// `[1, H, W]` u32, one for every real pixel.
    pub pixel_mask: Tensor,
}

/// Pixel side of the encoding.
#[derive(Debug, Clone)]
pub struct PixelEncoding {
    pub pixel_values: Tensor,
    pub pixel_mask: Tensor,
}

/// Text side of the encoding.
#[derive(Debug, Clone)]
pub struct TextEncoding {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub token_type_ids: Tensor,
}

/// Joint image and text preprocessor for ViLT.
pub struct ViltProcessor {
    tokenizer: Tokenizer,
    image_config: ViltImageConfig,
}

impl ViltProcessor {
    /// Wraps a tokenizer, truncating questions to `max_text_len` tokens and
    /// disabling any padding stored in the tokenizer file.
    pub fn new(
        mut tokenizer: Tokenizer,
        image_config: ViltImageConfig,
        max_text_len: usize,
    ) -> Result<Self, VqaError> {
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_text_len,
                ..Default::default()
            }))
            .map_err(|e| VqaError::Tokenizer(e.to_string()))?;
        tokenizer.with_padding(None);

        Ok(Self {
            tokenizer,
            image_config,
        })
    }

    pub fn image_config(&self) -> &ViltImageConfig {
        &self.image_config
    }

    pub fn encode(&self, image: &RgbImage, question: &str) -> Result<ViltEncoding, VqaError> {
        let text = self.encode_text(question)?;
        let pixels = self.encode_image(image)?;

        Ok(ViltEncoding {
            input_ids: text.input_ids,
            attention_mask: text.attention_mask,
            token_type_ids: text.token_type_ids,
            pixel_values: pixels.pixel_values,
            pixel_mask: pixels.pixel_mask,
        })
    }

    pub fn encode_text(&self, question: &str) -> Result<TextEncoding, VqaError> {
        let encoding = self
            .tokenizer
            .encode(question, true)
            .map_err(|e| VqaError::Tokenizer(e.to_string()))?;

        let len = encoding.get_ids().len();
        let row = |values: &[u32]| Tensor::from_vec(values.to_vec(), (1, len), &Device::Cpu);

        Ok(TextEncoding {
            input_ids: row(encoding.get_ids())?,
            attention_mask: row(encoding.get_attention_mask())?,
            token_type_ids: row(encoding.get_type_ids())?,
        })
    }

    pub fn encode_image(&self, image: &RgbImage) -> Result<PixelEncoding, VqaError> {
        preprocess_image(image, &self.image_config)
    }
}

/// Resizes and normalizes an image into a `[1, 3, H, W]` tensor plus its
/// all-ones `[1, H, W]` pixel mask.
pub fn preprocess_image(
    image: &RgbImage,
    config: &ViltImageConfig,
) -> Result<PixelEncoding, VqaError> {
    let (width, height) = (image.width() as u32, image.height() as u32);
    if width == 0 || height == 0 {
        return Err(VqaError::Shape(format!("empty image {width}x{height}")));
    }

    let rgb = image::RgbImage::from_raw(width, height, image.as_slice().to_vec())
        .ok_or_else(|| VqaError::Shape(format!("buffer does not match {width}x{height}")))?;

    let (out_w, out_h) = config.output_size(width, height);
    log::debug!("Resizing image {width}x{height} -> {out_w}x{out_h}");

    let resized = image::imageops::resize(&rgb, out_w, out_h, config.filter);

    // channel-major layout
    let (w, h) = (out_w as usize, out_h as usize);
    let mut values = vec![0f32; 3 * h * w];
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let mut value = pixel[c] as f32 * config.rescale_factor;
            if config.normalize {
                value = (value - config.mean[c]) / config.std[c];
            }
            values[(c * h + y as usize) * w + x as usize] = value;
        }
    }

    Ok(PixelEncoding {
        pixel_values: Tensor::from_vec(values, (1, 3, h, w), &Device::Cpu)?,
        pixel_mask: Tensor::ones((1, h, w), DType::U32, &Device::Cpu)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kornia_image::{ImageSize, allocator::CpuAllocator};
    use std::str::FromStr;

    pub(crate) const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": {
            "type": "BertProcessing",
            "sep": ["[SEP]", 3],
            "cls": ["[CLS]", 2]
        },
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {
                "[PAD]": 0, "[UNK]": 1, "[CLS]": 2, "[SEP]": 3,
                "what": 4, "is": 5, "the": 6, "brand": 7, "of": 8,
                "drink": 9, "?": 10
            },
            "unk_token": "[UNK]"
        }
    }"#;

    pub(crate) fn solid_image(width: usize, height: usize, value: u8) -> RgbImage {
        RgbImage::new(
            ImageSize { width, height },
            vec![value; width * height * 3],
            CpuAllocator,
        )
        .unwrap()
    }

    fn processor(max_text_len: usize) -> ViltProcessor {
        let tokenizer = Tokenizer::from_str(TOKENIZER_JSON).unwrap();
        ViltProcessor::new(tokenizer, ViltImageConfig::default(), max_text_len).unwrap()
    }

    fn ids(tensor: &Tensor) -> Vec<u32> {
        tensor.flatten_all().unwrap().to_vec1::<u32>().unwrap()
    }

    #[test]
    fn resize_rule_matches_vilt() {
        let config = ViltImageConfig::default();
        // landscape 640x480: short edge -> 384, long edge 512
        assert_eq!(config.output_size(640, 480), (512, 384));
        // portrait
        assert_eq!(config.output_size(480, 640), (384, 512));
        // very wide images hit the 639 cap and are floored to the divisor
        assert_eq!(config.output_size(2000, 500), (608, 160));
        // square
        assert_eq!(config.output_size(100, 100), (384, 384));
    }

    #[test]
    fn output_size_is_multiple_of_divisor() {
        let config = ViltImageConfig::default();
        for (w, h) in [(1, 1), (333, 777), (1024, 3), (401, 299)] {
            let (ow, oh) = config.output_size(w, h);
            assert_eq!(ow % 32, 0);
            assert_eq!(oh % 32, 0);
            assert!(ow >= 32 && oh >= 32);
            assert!(ow <= 639 && oh <= 639);
        }
    }

    #[test]
    fn parses_preprocessor_config() {
        let json = r#"{"do_normalize": true, "do_resize": true,
                       "feature_extractor_type": "ViltFeatureExtractor",
                       "image_mean": [0.5, 0.5, 0.5], "image_std": [0.5, 0.5, 0.5],
                       "resample": 3, "size": 384, "size_divisor": 32}"#;
        assert_eq!(
            ViltImageConfig::from_json(json).unwrap(),
            ViltImageConfig::default()
        );

        let config = ViltImageConfig::from_json(r#"{"size": {"shortest_edge": 224}}"#).unwrap();
        assert_eq!(config.shortest_edge, 224);
        assert_eq!(config.size_divisor, 32);

        assert!(ViltImageConfig::from_json(r#"{"image_std": [0.0, 1.0, 1.0]}"#).is_err());
    }

    #[test]
    fn normalizes_into_unit_range() {
        let config = ViltImageConfig::default();
        let white = preprocess_image(&solid_image(64, 48, 255), &config).unwrap();
        assert_eq!(white.pixel_values.dims(), &[1, 3, 384, 512]);
        assert_eq!(white.pixel_mask.dims(), &[1, 384, 512]);
        let values = white.pixel_values.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| (v - 1.0).abs() < 1e-5));
        assert!(ids(&white.pixel_mask).iter().all(|&m| m == 1));

        let black = preprocess_image(&solid_image(64, 48, 0), &config).unwrap();
        let values = black.pixel_values.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| (v + 1.0).abs() < 1e-5));
    }

    #[test]
    fn encodes_question_with_special_tokens() {
        let text = processor(40).encode_text("what is the brand of the drink ?").unwrap();
        assert_eq!(ids(&text.input_ids), [2, 4, 5, 6, 7, 8, 6, 9, 10, 3]);
        assert!(ids(&text.attention_mask).iter().all(|&m| m == 1));
        assert!(ids(&text.token_type_ids).iter().all(|&t| t == 0));
    }

    #[test]
    fn empty_question_still_encodes() {
        let text = processor(40).encode_text("").unwrap();
        assert_eq!(ids(&text.input_ids), [2, 3]);
    }

    #[test]
    fn truncates_long_questions() {
        let question = "what is the brand ".repeat(20);
        let text = processor(8).encode_text(&question).unwrap();
        assert_eq!(text.input_ids.dims(), &[1, 8]);
        let ids = ids(&text.input_ids);
        assert_eq!((ids[0], ids[7]), (2, 3));
    }

    #[test]
    fn joint_encoding_shapes() {
        let encoding = processor(40)
            .encode(&solid_image(30, 60, 128), "what is the drink ?")
            .unwrap();
        assert_eq!(encoding.input_ids.dims(), &[1, 7]);
        assert_eq!(encoding.pixel_values.dims(), &[1, 3, 608, 320]);
        assert_eq!(encoding.pixel_mask.dims(), &[1, 608, 320]);
    }
}
