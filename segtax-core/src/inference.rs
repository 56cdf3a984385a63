//! Inference collaborator boundary.
//!
//! A collaborator turns a resolved [`EvaluationContext`] and a split list into
//! a lazy, finite, non-restartable stream of [`LabelBatch`]es whose labels are
//! already expressed in the evaluation taxonomy.

use crate::context::{EvalTaxonomy, EvaluationContext};
use crate::dataset::DataItem;
use crate::error::{EvalError, Unimplemented};
use crate::remap::{UnmappedPolicy, remap_label_map};
use crate::taxonomy::{ClassId, TaxonomyMapping, TaxonomyRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Aligned prediction and ground-truth labels of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelBatch {
    pub item: String,
    pub predicted: Vec<ClassId>,
    pub target: Vec<ClassId>,
    /// Pixels set to the ignore label because a label had no mapping.
    pub dropped: usize,
}

pub type LabelBatches<'a> = Box<dyn Iterator<Item = Result<LabelBatch, EvalError>> + 'a>;

/// Produces evaluation-taxonomy label pairs for a list of items.
pub trait InferenceCollaborator {
    fn label_batches<'a>(
        &'a mut self,
        context: &'a EvaluationContext,
        items: &'a [DataItem],
    ) -> Result<LabelBatches<'a>, EvalError>;
}

/// One cached record: the model's universal-taxonomy prediction and the
/// dataset's native ground truth for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLabels {
    pub image: String,
    pub predicted: Vec<ClassId>,
    pub target: Vec<ClassId>,
}

/// How a cached record is brought into the evaluation taxonomy.
#[derive(Debug, Clone, Copy)]
enum Conversion<'a> {
    /// Ground truth native → universal; predictions already universal.
    TargetToUniversal(&'a TaxonomyMapping),
    /// Predictions universal → native; ground truth already native.
    PredictionToDataset(&'a TaxonomyMapping),
}

/// Replays label maps cached by an earlier inference pass and remaps them
/// into the evaluation taxonomy.
pub struct LabelCacheSource {
    path: PathBuf,
    registry: Arc<TaxonomyRegistry>,
    policy: UnmappedPolicy,
}

impl LabelCacheSource {
    pub fn new(path: impl Into<PathBuf>, registry: Arc<TaxonomyRegistry>, policy: UnmappedPolicy) -> Self {
        Self {
            path: path.into(),
            registry,
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InferenceCollaborator for LabelCacheSource {
    fn label_batches<'a>(
        &'a mut self,
        context: &'a EvaluationContext,
        items: &'a [DataItem],
    ) -> Result<LabelBatches<'a>, EvalError> {
        if context.relabel_required() {
            return Err(EvalError::NotImplemented(Unimplemented::RelabeledGroundTruth));
        }
        let conversion = match context.eval_taxonomy {
            EvalTaxonomy::Universal => {
                Conversion::TargetToUniversal(self.registry.to_universal(&context.dataset)?)
            }
            EvalTaxonomy::TestDataset => {
                Conversion::PredictionToDataset(self.registry.from_universal(&context.dataset)?)
            }
            EvalTaxonomy::Naive => {
                return Err(EvalError::NotImplemented(Unimplemented::NaiveTaxonomy));
            }
        };

        let file = File::open(&self.path).map_err(|e| {
            EvalError::inference(format!(
                "cannot open label cache {}: {e}",
                self.path.display()
            ))
        })?;
        tracing::debug!(
            items = items.len(),
            "Replaying cached labels from {}",
            self.path.display()
        );

        Ok(Box::new(CacheReplay {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            pending: items.iter().map(DataItem::key).collect(),
            conversion,
            ignore_label: context.ignore_label,
            policy: self.policy,
            finished: false,
        }))
    }
}

struct CacheReplay<'a> {
    lines: Lines<BufReader<File>>,
    line_no: usize,
    /// Requested items not yet seen in the cache.
    pending: HashSet<String>,
    conversion: Conversion<'a>,
    ignore_label: ClassId,
    policy: UnmappedPolicy,
    finished: bool,
}

impl CacheReplay<'_> {
    fn convert(&self, record: CachedLabels) -> Result<LabelBatch, EvalError> {
        if record.predicted.len() != record.target.len() {
            return Err(EvalError::ShapeMismatch(format!(
                "{}: {} predicted labels for {} ground-truth labels",
                record.image,
                record.predicted.len(),
                record.target.len()
            )));
        }

        match self.conversion {
            Conversion::TargetToUniversal(mapping) => {
                let target =
                    remap_label_map(&record.target, mapping, self.ignore_label, self.policy)?;
                Ok(LabelBatch {
                    item: record.image,
                    predicted: record.predicted,
                    target: target.labels,
                    dropped: target.dropped,
                })
            }
            Conversion::PredictionToDataset(mapping) => {
                let predicted =
                    remap_label_map(&record.predicted, mapping, self.ignore_label, self.policy)?;
                let mut target = record.target;
                // A prediction with no counterpart cannot be scored either way.
                for (p, t) in predicted.labels.iter().zip(target.iter_mut()) {
                    if *p == self.ignore_label {
                        *t = self.ignore_label;
                    }
                }
                Ok(LabelBatch {
                    item: record.image,
                    predicted: predicted.labels,
                    target,
                    dropped: predicted.dropped,
                })
            }
        }
    }
}

impl Iterator for CacheReplay<'_> {
    type Item = Result<LabelBatch, EvalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let Some(line) = self.lines.next() else {
                self.finished = true;
                if self.pending.is_empty() {
                    return None;
                }
                let mut missing: Vec<&String> = self.pending.iter().collect();
                missing.sort();
                return Some(Err(EvalError::inference(format!(
                    "label cache has no entry for {} item(s), first: {}",
                    missing.len(),
                    missing[0]
                ))));
            };
            self.line_no += 1;

            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let record: CachedLabels = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    self.finished = true;
                    tracing::warn!(line = self.line_no, "Malformed label cache record");
                    return Some(Err(e.into()));
                }
            };
            if !self.pending.remove(&record.image) {
                tracing::trace!(image = %record.image, "Skipping cached labels outside the split");
                continue;
            }

            let batch = self.convert(record);
            if batch.is_err() {
                self.finished = true;
            }
            return Some(batch);
        }
    }
}
