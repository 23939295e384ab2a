use crate::{
    InfernumModel, RequestMetadata,
    artifacts::ModelArtifacts,
    error::VqaError,
    labels::{self, LabelMap},
    processor::{ViltImageConfig, ViltProcessor},
    source::RgbImage,
    vilt::{ViltConfig, ViltForQuestionAnswering, ViltInputs},
};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use kornia_image::ImageSize;
use std::path::Path;
use tokenizers::Tokenizer;

/// A question about one image.
pub struct VqaRequest {
    pub question: String,
    pub image: RgbImage,
}

/// What is kept of a request once the model has consumed the image.
#[derive(Debug, Clone, PartialEq)]
pub struct VqaMetadata {
    pub question: String,
    pub image_size: ImageSize,
}

impl RequestMetadata for VqaRequest {
    type Metadata = VqaMetadata;

    fn metadata(&self) -> Self::Metadata {
        VqaMetadata {
            question: self.question.clone(),
            image_size: self.image.size(),
        }
    }
}

/// One candidate answer.
#[derive(Debug, Clone, PartialEq)]
pub struct VqaCandidate {
    pub label: String,
    pub index: usize,
    pub logit: f32,
    /// Sigmoid of the logit.
    pub score: f32,
}

/// The predicted answer plus the runners-up, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct VqaAnswer {
    pub best: VqaCandidate,
    pub candidates: Vec<VqaCandidate>,
}

impl VqaAnswer {
    /// Picks the argmax of `logits` and resolves it, with up to `top_k`
    /// candidates (at least the best one).
    pub fn from_logits(logits: &[f32], labels: &LabelMap, top_k: usize) -> Result<Self, VqaError> {
        let idx = labels::argmax(logits)
            .ok_or_else(|| VqaError::Shape("logits are empty or NaN".to_string()))?;

        let candidate = |index: usize, logit: f32| {
            labels
                .label(index)
                .map(|label| VqaCandidate {
                    label: label.to_string(),
                    index,
                    logit,
                    score: labels::sigmoid(logit),
                })
                .ok_or(VqaError::UnknownLabel(index))
        };

        let best = candidate(idx, logits[idx])?;
        let candidates = labels::top_k(logits, top_k.max(1))
            .into_iter()
            .map(|(index, logit)| candidate(index, logit))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { best, candidates })
    }

    pub fn label(&self) -> &str {
        &self.best.label
    }
}

/// ViLT question answering on candle.
pub struct ViltModel {
    network: ViltForQuestionAnswering,
    processor: ViltProcessor,
    labels: LabelMap,
    device: Device,
    top_k: usize,
}

impl std::fmt::Debug for ViltModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViltModel")
            .field("num_labels", &self.labels.len())
            .field("image_config", self.processor.image_config())
            .field("device", &self.device)
            .field("top_k", &self.top_k)
            .finish_non_exhaustive()
    }
}

impl ViltModel {
    /// Loads the weights, tokenizer, preprocessor and label table.
    pub fn load(artifacts: &ModelArtifacts) -> Result<Self, VqaError> {
        for path in [&artifacts.weights, &artifacts.tokenizer, &artifacts.config] {
            if !path.is_file() {
                return Err(VqaError::ModelNotFound(path.clone()));
            }
        }

        let config_json = std::fs::read_to_string(&artifacts.config)?;
        let config_err = |reason: String| VqaError::Config {
            path: artifacts.config.clone(),
            reason,
        };
        let config = ViltConfig::from_json(&config_json).map_err(config_err)?;
        let labels = LabelMap::from_config_json(&config_json).map_err(config_err)?;

        let image_config = match &artifacts.preprocessor {
            Some(path) => ViltImageConfig::from_file(path)?,
            None => ViltImageConfig::default(),
        };

        let tokenizer = Tokenizer::from_file(&artifacts.tokenizer)
            .map_err(|e| VqaError::Tokenizer(e.to_string()))?;
        let processor = ViltProcessor::new(tokenizer, image_config, config.max_position_embeddings)?;

        let device = select_device();
        let vb = load_weights(&artifacts.weights, &device)?;
        let network = ViltForQuestionAnswering::new(&config, labels.len(), vb)?;

        log::info!(
            "Loaded ViLT model from {} ({} answers, {} layers)",
            artifacts.weights.display(),
            labels.len(),
            config.num_hidden_layers
        );

        Self::new(network, processor, labels, device)
    }

    /// Assembles a model from already built parts. The classifier width must
    /// match the label table.
    pub fn new(
        network: ViltForQuestionAnswering,
        processor: ViltProcessor,
        labels: LabelMap,
        device: Device,
    ) -> Result<Self, VqaError> {
        if network.num_labels() != labels.len() {
            return Err(VqaError::Shape(format!(
                "classifier has {} outputs for {} labels",
                network.num_labels(),
                labels.len()
            )));
        }

        Ok(Self {
            network,
            processor,
            labels,
            device,
            top_k: 1,
        })
    }

    /// Number of candidates reported next to the best answer.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// The answer vocabulary, indexed by classifier output.
    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    fn logits(&self, request: &VqaRequest) -> Result<Vec<f32>, VqaError> {
        let encoding = self.processor.encode(&request.image, &request.question)?;
        log::debug!(
            "Encoded {} tokens, pixel values {:?}",
            encoding.input_ids.dim(1)?,
            encoding.pixel_values.dims()
        );

        let on_device = |t: &Tensor| t.to_device(&self.device);
        let input_ids = on_device(&encoding.input_ids)?;
        let attention_mask = on_device(&encoding.attention_mask)?;
        let token_type_ids = on_device(&encoding.token_type_ids)?;
        let pixel_values = on_device(&encoding.pixel_values)?;
        let pixel_mask = on_device(&encoding.pixel_mask)?;

        let logits = self.network.forward(&ViltInputs {
            input_ids: &input_ids,
            attention_mask: &attention_mask,
            token_type_ids: &token_type_ids,
            pixel_values: &pixel_values,
            pixel_mask: &pixel_mask,
        })?;
        check_logits_shape(logits.dims(), self.labels.len())?;

        Ok(logits.flatten_all()?.to_vec1::<f32>()?)
    }
}

impl InfernumModel for ViltModel {
    type Request = VqaRequest;
    type Response = VqaAnswer;
    type Error = VqaError;

    fn run(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error> {
        let logits = self.logits(&request)?;
        VqaAnswer::from_logits(&logits, &self.labels, self.top_k)
    }
}

/// Logits must be one row with a score per label.
pub fn check_logits_shape(dims: &[usize], num_labels: usize) -> Result<(), VqaError> {
    match dims {
        [1, n] if *n == num_labels => Ok(()),
        _ => Err(VqaError::Shape(format!(
            "logits {dims:?}, expected [1, {num_labels}]"
        ))),
    }
}

/// Reads safetensors directly, anything else as a PyTorch checkpoint.
fn load_weights(path: &Path, device: &Device) -> Result<VarBuilder<'static>, VqaError> {
    let is_safetensors = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));

    if is_safetensors {
        let tensors = candle_core::safetensors::load(path, device)?;
        Ok(VarBuilder::from_tensors(tensors, DType::F32, device))
    } else {
        Ok(VarBuilder::from_pth(path, DType::F32, device)?)
    }
}

#[cfg(feature = "cuda")]
fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => {
            log::info!("Running on {device:?}");
            device
        }
        Err(e) => {
            log::warn!("CUDA device unavailable ({e}), falling back to CPU");
            Device::Cpu
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn select_device() -> Device {
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        processor::tests::{TOKENIZER_JSON, solid_image},
        vilt::tests::tiny_config,
    };
    use candle_nn::VarMap;
    use std::str::FromStr;

    fn labels() -> LabelMap {
        LabelMap::new(vec!["no".into(), "yes".into(), "coca cola".into()])
    }

    #[test]
    fn answer_is_argmax_label() {
        let answer = VqaAnswer::from_logits(&[-2.0, 1.5, 4.0], &labels(), 1).unwrap();
        assert_eq!(answer.label(), "coca cola");
        assert_eq!(answer.best.index, 2);
        assert!(answer.best.score > 0.98);
        assert_eq!(answer.candidates.len(), 1);
    }

    #[test]
    fn reports_top_candidates() {
        let answer = VqaAnswer::from_logits(&[-2.0, 1.5, 4.0], &labels(), 5).unwrap();
        let ranked: Vec<_> = answer.candidates.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(ranked, ["coca cola", "yes", "no"]);
    }

    #[test]
    fn index_outside_label_table_fails() {
        assert!(matches!(
            VqaAnswer::from_logits(&[0.0, 0.0, 0.0, 9.0], &labels(), 1),
            Err(VqaError::UnknownLabel(3))
        ));
        assert!(matches!(
            VqaAnswer::from_logits(&[], &labels(), 1),
            Err(VqaError::Shape(_))
        ));
    }

    #[test]
    fn load_requires_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ModelArtifacts {
            weights: dir.path().join("model.safetensors"),
            tokenizer: dir.path().join("tokenizer.json"),
            config: dir.path().join("config.json"),
            preprocessor: None,
        };
        assert!(matches!(
            ViltModel::load(&artifacts),
            Err(VqaError::ModelNotFound(_))
        ));
    }

    #[test]
    fn logits_must_be_one_row_per_label() {
        assert!(check_logits_shape(&[1, 3], 3).is_ok());
        assert!(matches!(check_logits_shape(&[3], 3), Err(VqaError::Shape(_))));
        assert!(matches!(check_logits_shape(&[1, 4], 3), Err(VqaError::Shape(_))));
        assert!(matches!(check_logits_shape(&[2, 3], 3), Err(VqaError::Shape(_))));
    }

    /// Writes a randomly initialised tiny ViLT laid out like a hub checkpoint.
    fn write_tiny_checkpoint(dir: &Path) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        ViltForQuestionAnswering::new(&tiny_config(), 3, vb).unwrap();
        varmap.save(dir.join("model.safetensors")).unwrap();

        let config = serde_json::json!({
            "architectures": ["ViltForQuestionAnswering"],
            "vocab_size": 11,
            "hidden_size": 8,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "intermediate_size": 16,
            "image_size": 64,
            "patch_size": 32,
            "max_position_embeddings": 40,
            "id2label": {"0": "no", "1": "yes", "2": "coca cola"}
        });
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
        std::fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
        std::fs::write(
            dir.join("preprocessor_config.json"),
            r#"{"size": 64, "size_divisor": 32}"#,
        )
        .unwrap();
    }

    #[test]
    fn loaded_checkpoint_answers_from_its_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_checkpoint(dir.path());

        let artifacts = ModelArtifacts::from_dir(dir.path(), None).unwrap();
        let mut model = ViltModel::load(&artifacts).unwrap().with_top_k(3);
        assert_eq!(model.labels().len(), 3);

        // 100x60 resizes to 96x64, a 2x3 patch grid off the trained 2x2 one
        let request = || VqaRequest {
            question: "what is the brand of the drink ?".to_string(),
            image: solid_image(100, 60, 200),
        };
        let first = model.run(request()).unwrap();
        let second = model.run(request()).unwrap();

        assert!(model.labels().contains(first.label()));
        assert_eq!(first.candidates.len(), 3);
        assert_eq!(first.label(), second.label());
        assert_eq!(first.best.logit, second.best.logit);
    }

    #[test]
    fn classifier_width_must_match_labels() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = ViltForQuestionAnswering::new(&tiny_config(), 4, vb).unwrap();
        let tokenizer = Tokenizer::from_str(TOKENIZER_JSON).unwrap();
        let processor = ViltProcessor::new(tokenizer, ViltImageConfig::default(), 40).unwrap();

        assert!(matches!(
            ViltModel::new(network, processor, labels(), Device::Cpu),
            Err(VqaError::Shape(_))
        ));
    }

    #[test]
    #[ignore = "downloads the pretrained checkpoint and image"]
    fn pretrained_model_answers_the_default_question() {
        let answer = crate::run_inference(&crate::VqaConfig::default()).unwrap();
        assert!(!answer.label().is_empty());
    }
}
