use argh::FromArgs;
use infernum_vqa::{
    ImageSource, VqaConfig,
    config::{
        DEFAULT_IMAGE_URL, DEFAULT_MODEL_ID, DEFAULT_QUESTION, DEFAULT_REVISION, DEFAULT_TOP_K,
    },
    format_answer, run_inference,
};
use std::path::PathBuf;

#[derive(FromArgs)]
/// Answers a question about an image with a pretrained ViLT model.
struct VqaArgs {
    /// the image to ask about, an http(s) url or a local jpeg/png path
    #[argh(option, short = 'i', default = "ImageSource::Url(DEFAULT_IMAGE_URL.to_string())")]
    image: ImageSource,

    /// the question to ask
    #[argh(option, short = 'q', default = "DEFAULT_QUESTION.to_string()")]
    question: String,

    /// the model identifier on the hub
    #[argh(option, short = 'm', default = "DEFAULT_MODEL_ID.to_string()")]
    model: String,

    /// the model revision on the hub
    #[argh(option, default = "DEFAULT_REVISION.to_string()")]
    revision: String,

    /// the checkpoint file to load, model.safetensors or pytorch_model.bin by default
    #[argh(option)]
    weights_file: Option<String>,

    /// a local checkpoint directory to use instead of the hub
    #[argh(option)]
    model_dir: Option<PathBuf>,

    /// how many candidate answers to log
    #[argh(option, short = 'k', default = "DEFAULT_TOP_K")]
    top_k: usize,
}

impl From<VqaArgs> for VqaConfig {
    fn from(args: VqaArgs) -> Self {
        VqaConfig {
            image: args.image,
            question: args.question,
            model_id: args.model,
            revision: args.revision,
            weights_file: args.weights_file,
            model_dir: args.model_dir,
            top_k: args.top_k,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: VqaArgs = argh::from_env();

    let answer = run_inference(&args.into())?;

    println!("{}", format_answer(answer.label()));

    Ok(())
}
