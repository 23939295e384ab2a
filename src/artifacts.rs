use crate::error::VqaError;
use hf_hub::{Repo, RepoType, api::sync::Api};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const PREPROCESSOR_FILE: &str = "preprocessor_config.json";

/// Weight files tried in order when none is named explicitly.
pub const WEIGHT_FILES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];

/// Repo whose fast tokenizer ViLT checkpoints reuse when they only ship
/// `vocab.txt`.
pub const FALLBACK_TOKENIZER_REPO: &str = "bert-base-uncased";

/// Local paths of everything needed to run a pretrained VQA model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    /// Checkpoint, either safetensors or a PyTorch pickle.
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
    /// Model config, carries the architecture and the `id2label` table.
    pub config: PathBuf,
    /// Image preprocessing config; defaults apply when absent.
    pub preprocessor: Option<PathBuf>,
}

impl ModelArtifacts {
    /// Resolves the artifacts of `model_id` on the Hugging Face hub.
    ///
    /// Files are downloaded once and served from the hub cache afterwards.
    pub fn from_hub(
        model_id: &str,
        revision: &str,
        weights_file: Option<&str>,
    ) -> Result<Self, VqaError> {
        log::info!("Resolving {model_id}@{revision} on the model hub");

        let hub_err = |source| VqaError::Hub {
            model_id: model_id.to_string(),
            source,
        };

        let api = Api::new().map_err(hub_err)?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let config = repo.get(CONFIG_FILE).map_err(hub_err)?;

        let weights = match weights_file {
            Some(name) => repo.get(name).map_err(hub_err)?,
            None => {
                let mut found = Err(VqaError::ModelNotFound(PathBuf::from(WEIGHT_FILES[0])));
                for name in WEIGHT_FILES {
                    match repo.get(name) {
                        Ok(path) => {
                            found = Ok(path);
                            break;
                        }
                        Err(e) => {
                            log::debug!("{model_id} has no {name}: {e}");
                            found = Err(hub_err(e));
                        }
                    }
                }
                found?
            }
        };

        let tokenizer = match repo.get(TOKENIZER_FILE) {
            Ok(path) => path,
            Err(e) => {
                log::warn!(
                    "No {TOKENIZER_FILE} for {model_id} ({e}), using {FALLBACK_TOKENIZER_REPO}"
                );
                api.model(FALLBACK_TOKENIZER_REPO.to_string())
                    .get(TOKENIZER_FILE)
                    .map_err(|source| VqaError::Hub {
                        model_id: FALLBACK_TOKENIZER_REPO.to_string(),
                        source,
                    })?
            }
        };

        let preprocessor = match repo.get(PREPROCESSOR_FILE) {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("No {PREPROCESSOR_FILE} for {model_id} ({e}), using defaults");
                None
            }
        };

        Ok(Self {
            weights,
            tokenizer,
            config,
            preprocessor,
        })
    }

    /// Uses a local checkpoint directory laid out like a hub repo.
    pub fn from_dir(dir: impl AsRef<Path>, weights_file: Option<&str>) -> Result<Self, VqaError> {
        let dir = dir.as_ref();
        let required = |name: &str| {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(VqaError::ModelNotFound(path))
            }
        };

        let weights = match weights_file {
            Some(name) => required(name)?,
            None => WEIGHT_FILES
                .iter()
                .map(|name| dir.join(name))
                .find(|path| path.is_file())
                .ok_or_else(|| VqaError::ModelNotFound(dir.join(WEIGHT_FILES[0])))?,
        };

        let preprocessor = Some(dir.join(PREPROCESSOR_FILE)).filter(|p| p.is_file());

        Ok(Self {
            weights,
            tokenizer: required(TOKENIZER_FILE)?,
            config: required(CONFIG_FILE)?,
            preprocessor,
        })
    }
}
