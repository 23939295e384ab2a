use crate::{
    InfernumModel, InfernumResponse,
    artifacts::ModelArtifacts,
    config::VqaConfig,
    error::VqaError,
    model::{VqaAnswer, VqaMetadata, VqaRequest, ViltModel},
    source::{ImageSource, RgbImage},
};

/// Fetches the image, then runs the model on (image, question).
///
/// Everything runs on the calling thread.
pub struct VqaPipeline<M> {
    model: M,
}

impl<M> VqaPipeline<M>
where
    M: InfernumModel<Request = VqaRequest, Response = VqaAnswer>,
    VqaError: From<M::Error>,
{
    /// Wraps a loaded model.
    pub fn new(model: M) -> Self {
        Self { model }
    }

    /// The wrapped model, e.g. to read its label table.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Answers `question` about the image at `source`.
    ///
    /// The image is loaded before the model is touched, so a bad source fails
    /// without running inference. The question is not validated.
    pub fn answer(
        &mut self,
        source: &ImageSource,
        question: &str,
    ) -> Result<InfernumResponse<VqaMetadata, VqaAnswer>, VqaError> {
        log::info!("Loading image from {source}");
        let image = source.load()?;
        log::debug!("Decoded image {}x{}", image.width(), image.height());

        self.answer_image(image, question)
    }

    /// Answers `question` about an already decoded image.
    pub fn answer_image(
        &mut self,
        image: RgbImage,
        question: &str,
    ) -> Result<InfernumResponse<VqaMetadata, VqaAnswer>, VqaError> {
        let response = crate::run_timed(
            &mut self.model,
            VqaRequest {
                question: question.to_string(),
                image,
            },
        )?;

        log::info!(
            "Answered {:?} with {:?} in {:?}",
            response.request_metadata.question,
            response.response.label(),
            response.duration
        );
        for candidate in &response.response.candidates {
            log::info!(
                "  {:>6.4} {} (#{})",
                candidate.score,
                candidate.label,
                candidate.index
            );
        }

        Ok(response)
    }
}

/// Loads the model named by `config` and answers its question about its image.
pub fn run_inference(config: &VqaConfig) -> Result<VqaAnswer, VqaError> {
    log::info!("Loading image from {}", config.image);
    let image = config.image.load()?;

    let artifacts = match &config.model_dir {
        Some(dir) => ModelArtifacts::from_dir(dir, config.weights_file.as_deref())?,
        None => ModelArtifacts::from_hub(
            &config.model_id,
            &config.revision,
            config.weights_file.as_deref(),
        )?,
    };
    let model = ViltModel::load(&artifacts)?.with_top_k(config.top_k);

    let mut pipeline = VqaPipeline::new(model);
    let response = pipeline.answer_image(image, &config.question)?;

    Ok(response.response)
}

/// The single line printed for an answer.
pub fn format_answer(label: &str) -> String {
    format!("Predicted answer: {label}")
}
