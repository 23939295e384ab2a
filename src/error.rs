use std::path::PathBuf;

/// Errors raised while answering a question about an image.
#[derive(Debug, thiserror::Error)]
pub enum VqaError {
    /// The image could not be downloaded.
    #[error("failed to fetch image from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The image bytes could not be decoded into a bitmap.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// The local image file has an extension we cannot read.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// A required model file is missing.
    #[error("model artifact not found: {0}")]
    ModelNotFound(PathBuf),

    /// The model registry lookup failed.
    #[error("model hub lookup failed for {model_id}: {source}")]
    Hub {
        model_id: String,
        #[source]
        source: hf_hub::api::sync::ApiError,
    },

    /// The tokenizer could not be loaded or rejected the question.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// A model or preprocessor config file is malformed.
    #[error("invalid config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// A tensor operation failed while loading weights or running the model.
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// A tensor does not have the shape the model expects.
    #[error("unexpected tensor shape: {0}")]
    Shape(String),

    /// The predicted class index has no entry in the label table.
    #[error("no label for class index {0}")]
    UnknownLabel(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
