//! The resolved, immutable description of one evaluation run.

use crate::error::EvalError;
use crate::taxonomy::{ClassId, DatasetCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Taxonomy in which predictions and ground truth are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalTaxonomy {
    /// The unified label space the model predicts.
    Universal,
    /// The held-out dataset's native label space.
    TestDataset,
    /// Union of dataset label spaces without merging.
    Naive,
}

impl EvalTaxonomy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Universal => "universal",
            Self::TestDataset => "test_dataset",
            Self::Naive => "naive",
        }
    }
}

impl fmt::Display for EvalTaxonomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvalTaxonomy {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "universal" => Ok(Self::Universal),
            "test_dataset" | "test" => Ok(Self::TestDataset),
            "naive" => Ok(Self::Naive),
            other => Err(EvalError::config(format!(
                "unknown evaluation taxonomy '{other}' (expected universal, test_dataset or naive)"
            ))),
        }
    }
}

/// What the model identifier says about how the model was trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelFamily {
    /// Trained on the unified label set.
    Unified {
        /// Whether it was trained on relabeled ground truth.
        relabeled: bool,
    },
    Other,
}

impl ModelFamily {
    /// Parse the naming convention once: `mseg` marks the unified family and
    /// `unrelabeled` marks a variant trained without relabeled ground truth.
    pub fn from_model_name(model_name: &str) -> Self {
        let name = model_name.to_lowercase();
        if name.contains("mseg") {
            Self::Unified {
                relabeled: !name.contains("unrelabeled"),
            }
        } else {
            Self::Other
        }
    }
}

/// Ground truth the predictions are scored against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum GroundTruth {
    /// The dataset's own annotations, remapped as needed.
    Original,
    /// Annotations re-made directly in the universal taxonomy.
    Relabeled { dataset: String },
}

/// Immutable result of taxonomy resolution, shared by every later stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub dataset: String,
    pub model_name: String,
    pub model_family: ModelFamily,
    pub category: DatasetCategory,
    pub eval_taxonomy: EvalTaxonomy,
    pub ground_truth: GroundTruth,
    /// Evaluation-taxonomy ids left out of scoring.
    pub excluded_ids: BTreeSet<ClassId>,
    /// Class names of the evaluation taxonomy, indexed by id.
    pub class_names: Vec<String>,
    pub ignore_label: ClassId,
}

impl EvaluationContext {
    pub fn relabel_required(&self) -> bool {
        matches!(self.ground_truth, GroundTruth::Relabeled { .. })
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_family_parsing() {
        assert_eq!(
            ModelFamily::from_model_name("mseg-3m"),
            ModelFamily::Unified { relabeled: true }
        );
        assert_eq!(
            ModelFamily::from_model_name("mseg-3m-unrelabeled"),
            ModelFamily::Unified { relabeled: false }
        );
        assert_eq!(
            ModelFamily::from_model_name("cityscapes-oracle-1m"),
            ModelFamily::Other
        );
    }

    #[test]
    fn test_eval_taxonomy_from_str() {
        assert_eq!(
            "universal".parse::<EvalTaxonomy>().unwrap(),
            EvalTaxonomy::Universal
        );
        assert_eq!(
            "test-dataset".parse::<EvalTaxonomy>().unwrap(),
            EvalTaxonomy::TestDataset
        );
        assert!("oracle".parse::<EvalTaxonomy>().is_err());
    }

    #[test]
    fn test_ground_truth_serde() {
        let gt = GroundTruth::Relabeled {
            dataset: "voc2012-relabeled".into(),
        };
        let json = serde_json::to_string(&gt).unwrap();
        assert_eq!(json, r#"{"source":"relabeled","dataset":"voc2012-relabeled"}"#);
    }
}
