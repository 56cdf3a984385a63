//! Error types for the segtax-core crate.

use crate::taxonomy::ClassId;
use thiserror::Error;

/// Branches that are recognized but intentionally not implemented yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unimplemented {
    /// Evaluation in the naive (union-of-datasets) taxonomy.
    NaiveTaxonomy,
    /// Scoring against ground truth re-annotated in the universal taxonomy.
    RelabeledGroundTruth,
}

impl std::fmt::Display for Unimplemented {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NaiveTaxonomy => write!(f, "evaluation in the naive taxonomy"),
            Self::RelabeledGroundTruth => write!(f, "evaluation against relabeled ground truth"),
        }
    }
}

/// Failures of a single remap lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemapError {
    #[error("label {id} has no entry in mapping {mapping}")]
    Unmapped { id: ClassId, mapping: String },

    #[error("label {id} at index {index} has no entry in mapping {mapping}")]
    UnmappedAt {
        id: ClassId,
        index: usize,
        mapping: String,
    },

    #[error("label {id} maps to {targets} classes in mapping {mapping}; a dense label array needs exactly one")]
    Ambiguous {
        id: ClassId,
        targets: usize,
        mapping: String,
    },
}

impl RemapError {
    /// The source id that failed to remap.
    pub fn id(&self) -> ClassId {
        match self {
            Self::Unmapped { id, .. } | Self::UnmappedAt { id, .. } | Self::Ambiguous { id, .. } => {
                *id
            }
        }
    }
}

/// Top-level error type for evaluation runs.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Unknown dataset: {0} is neither a training nor a test dataset")]
    UnknownDataset(String),

    #[error("Unmapped label: {0}")]
    UnmappedLabel(RemapError),

    #[error("Ambiguous label: {0}")]
    AmbiguousLabel(RemapError),

    #[error("Not implemented: {0}")]
    NotImplemented(Unimplemented),

    #[error("Taxonomy mismatch: {0}")]
    TaxonomyMismatch(String),

    #[error("Invalid taxonomy table: {0}")]
    InvalidTaxonomy(String),

    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Dataset registry error: {0}")]
    Dataset(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<RemapError> for EvalError {
    fn from(err: RemapError) -> Self {
        match err {
            RemapError::Ambiguous { .. } => Self::AmbiguousLabel(err),
            _ => Self::UnmappedLabel(err),
        }
    }
}

impl EvalError {
    pub fn unknown_dataset(name: impl Into<String>) -> Self {
        Self::UnknownDataset(name.into())
    }

    pub fn invalid_taxonomy(msg: impl Into<String>) -> Self {
        Self::InvalidTaxonomy(msg.into())
    }

    pub fn invalid_label(msg: impl Into<String>) -> Self {
        Self::InvalidLabel(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
