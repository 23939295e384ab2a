use crate::source::ImageSource;
use std::path::PathBuf;

// defaults for a run
pub const DEFAULT_IMAGE_URL: &str = "https://static.ifood-static.com.br/image/upload/t_medium/pratos/ff7bf962-bccc-445c-9829-1f974561a4ff/202308230625_bojydjt65o.png";
pub const DEFAULT_QUESTION: &str = "What is the brand of the drink?";
pub const DEFAULT_MODEL_ID: &str = "dandelin/vilt-b32-finetuned-vqa";
pub const DEFAULT_REVISION: &str = "main";
pub const DEFAULT_TOP_K: usize = 1;

/// Everything one question-answering run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct VqaConfig {
    /// Where the image comes from, a URL or a local file.
    pub image: ImageSource,
    /// Asked verbatim, even when empty.
    pub question: String,
    /// Hub identifier of the pretrained model.
    pub model_id: String,
    /// Branch, tag or commit of `model_id`.
    pub revision: String,
    /// Checkpoint file to load. `model.safetensors` then `pytorch_model.bin`
    /// are tried when unset.
    pub weights_file: Option<String>,
    /// Local checkpoint directory used instead of the hub when set.
    pub model_dir: Option<PathBuf>,
    /// Candidates logged next to the answer.
    pub top_k: usize,
}

impl Default for VqaConfig {
    fn default() -> Self {
        Self {
            image: ImageSource::Url(DEFAULT_IMAGE_URL.to_string()),
            question: DEFAULT_QUESTION.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: DEFAULT_REVISION.to_string(),
            weights_file: None,
            model_dir: None,
            top_k: DEFAULT_TOP_K,
        }
    }
}
