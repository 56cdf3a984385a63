//! # segtax-core: cross-taxonomy evaluation of segmentation models
//!
//! Models trained in a single universal taxonomy are scored against datasets
//! that each carry their own label set. This crate decides which taxonomy a
//! (dataset, model) pair is scored in, remaps labels between taxonomies, and
//! aggregates confusion counts into per-class IoU, mIoU and pixel accuracy.
//!
//! ## Pipeline
//!
//! 1. [`TaxonomyResolver`] turns a dataset and model into an [`EvaluationContext`]
//! 2. an [`InferenceCollaborator`] streams label pairs in the evaluation taxonomy
//! 3. [`AccuracyAggregator`] folds them into confusion counts
//! 4. [`EvaluationReport`] is built from the counts and written to disk
//!
//! [`EvaluationOrchestrator`] wires the stages together.

// Foundation
pub mod config;
pub mod error;

// Taxonomies and label remapping
pub mod remap;
pub mod taxonomy;

// Evaluation
pub mod accuracy;
pub mod context;
pub mod dataset;
pub mod inference;
pub mod orchestrator;
pub mod resolver;

// Results
pub mod persistence;
pub mod report;

// Re-exports
pub use accuracy::{AccuracyAggregator, ConfusionAccumulator};
pub use config::{ConfigOverrides, EvalConfig, load_config};
pub use context::{EvalTaxonomy, EvaluationContext, GroundTruth, ModelFamily};
pub use dataset::{DataItem, DatasetInfo, DatasetRegistry, FileDatasetRegistry};
pub use error::{EvalError, RemapError, Unimplemented};
pub use inference::{InferenceCollaborator, LabelBatch, LabelCacheSource};
pub use orchestrator::{EvaluationOrchestrator, EvaluationOutcome};
pub use remap::UnmappedPolicy;
pub use report::EvaluationReport;
pub use resolver::TaxonomyResolver;
pub use taxonomy::{ClassId, Taxonomy, TaxonomyMapping, TaxonomyRegistry};
