use crate::error::VqaError;
use serde::Deserialize;
use std::{collections::HashMap, path::Path};

/// Index-to-label table shipped with a classification model.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    labels: Vec<String>,
}

#[derive(Deserialize)]
struct Id2LabelConfig {
    id2label: HashMap<String, String>,
}

impl LabelMap {
    /// Builds a label map from labels ordered by class index.
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    /// Reads the `id2label` table of a model `config.json`.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, VqaError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_config_json(&json).map_err(|reason| VqaError::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parses the `id2label` table out of a model config document.
    ///
    /// Keys are decimal class indices. The table must be dense: every index
    /// from zero up to the number of entries has to be present.
    pub fn from_config_json(json: &str) -> Result<Self, String> {
        let config: Id2LabelConfig = serde_json::from_str(json).map_err(|e| e.to_string())?;

        let mut labels = vec![None; config.id2label.len()];
        for (key, label) in config.id2label {
            let idx: usize = key
                .parse()
                .map_err(|_| format!("id2label key is not an index: {key:?}"))?;
            let slot = labels
                .get_mut(idx)
                .ok_or_else(|| format!("id2label index {idx} out of range"))?;
            *slot = Some(label);
        }

        let labels = labels
            .into_iter()
            .enumerate()
            .map(|(idx, label)| label.ok_or_else(|| format!("id2label has no entry for {idx}")))
            .collect::<Result<Vec<_>, _>>()?;

        if labels.is_empty() {
            return Err("id2label is empty".to_string());
        }

        Ok(Self { labels })
    }

    pub fn label(&self, idx: usize) -> Option<&str> {
        self.labels.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Index of the highest score, ties resolved to the lowest index.
///
/// NaN scores never win. Returns `None` when no score is comparable.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (idx, &score)| match best {
            Some((_, b)) if b >= score => best,
            _ => Some((idx, score)),
        })
        .map(|(idx, _)| idx)
}

/// The `k` highest scores with their indices, highest first.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(k);
    ranked
}

/// Logistic function, the answer head is trained with a per-class sigmoid.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_first_maximum() {
        assert_eq!(argmax(&[0.1, 3.0, -1.0, 3.0]), Some(1));
        assert_eq!(argmax(&[-5.0]), Some(0));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn argmax_skips_nan() {
        assert_eq!(argmax(&[f32::NAN, 0.5, 0.2]), Some(1));
        assert_eq!(argmax(&[f32::NAN]), None);
    }

    #[test]
    fn top_k_is_sorted_descending() {
        let ranked = top_k(&[0.2, 0.9, 0.5, 0.9], 3);
        assert_eq!(ranked, vec![(1, 0.9), (3, 0.9), (2, 0.5)]);
        assert_eq!(top_k(&[1.0, 2.0], 10).len(), 2);
    }

    #[test]
    fn parses_id2label() {
        let json = r#"{"architectures":["ViltForQuestionAnswering"],
                       "id2label":{"1":"yes","0":"net","2":"coca cola"}}"#;
        let labels = LabelMap::from_config_json(json).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.label(0), Some("net"));
        assert_eq!(labels.label(2), Some("coca cola"));
        assert_eq!(labels.label(3), None);
        assert!(labels.contains("yes"));
    }

    #[test]
    fn rejects_sparse_or_bad_tables() {
        assert!(LabelMap::from_config_json(r#"{"id2label":{"0":"a","2":"b"}}"#).is_err());
        assert!(LabelMap::from_config_json(r#"{"id2label":{"x":"a"}}"#).is_err());
        assert!(LabelMap::from_config_json(r#"{"id2label":{}}"#).is_err());
        assert!(LabelMap::from_config_json(r#"{"num_labels":3}"#).is_err());
    }

    #[test]
    fn sigmoid_is_centered() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.99);
    }
}
