use std::time::{Duration, Instant};

pub mod artifacts;
pub mod config;
pub mod error;
pub mod labels;
pub mod model;
pub mod pipeline;
pub mod processor;
pub mod source;
pub mod vilt;

pub use artifacts::ModelArtifacts;
pub use config::VqaConfig;
pub use error::VqaError;
pub use labels::LabelMap;
pub use model::{VqaAnswer, VqaCandidate, VqaMetadata, VqaRequest, ViltModel, check_logits_shape};
pub use pipeline::{VqaPipeline, format_answer, run_inference};
pub use source::{ImageSource, RgbImage};
pub use vilt::{ViltConfig, ViltForQuestionAnswering};

/// Trait for implementing inference models that can be driven by a [`VqaPipeline`].
///
/// Users implement this trait to define their custom model behavior, including
/// the request and response types and the inference logic.
pub trait InfernumModel {
    /// The request type that the model accepts for inference.
    type Request;
    /// The response type that the model returns after inference.
    type Response;
    /// The error type that can be returned during inference.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs inference on the given request and returns a response or error.
    fn run(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error>;
}

/// Trait for extracting lightweight metadata from inference requests.
///
/// This allows the pipeline to keep essential information (like the question)
/// without cloning heavy data (like images) for telemetry and debugging purposes.
pub trait RequestMetadata {
    /// The lightweight metadata type that represents the request.
    type Metadata;

    /// Extracts lightweight metadata from the request.
    /// This should avoid cloning heavy data like images.
    fn metadata(&self) -> Self::Metadata;
}

/// Response of a single inference run together with its telemetry.
#[derive(Debug, Clone)]
pub struct InfernumResponse<Metadata, Res> {
    /// Timestamp when the inference started.
    pub start_time: Instant,
    /// Total time taken for the inference.
    pub duration: Duration,
    /// Lightweight metadata extracted from the original request.
    pub request_metadata: Metadata,
    /// The actual response from the model.
    pub response: Res,
}

/// Runs `request` through `model`, timing the call.
pub fn run_timed<M>(
    model: &mut M,
    request: M::Request,
) -> Result<InfernumResponse<<M::Request as RequestMetadata>::Metadata, M::Response>, M::Error>
where
    M: InfernumModel,
    M::Request: RequestMetadata,
{
    // Extract lightweight metadata before consuming the request
    let request_metadata = request.metadata();

    log::debug!("Running inference");
    let start_time = Instant::now();
    let response = model.run(request)?;
    let duration = start_time.elapsed();
    log::debug!("Inference completed in {duration:?}");

    Ok(InfernumResponse {
        start_time,
        duration,
        request_metadata,
        response,
    })
}
