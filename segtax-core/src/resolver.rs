//! Decides how a (dataset, model) pair is evaluated.
//!
//! Training datasets are scored in the universal taxonomy, restricted to the
//! universal classes the dataset can express. Held-out test datasets are scored
//! in their own taxonomy. Anything else is rejected.

use crate::context::{EvalTaxonomy, EvaluationContext, GroundTruth, ModelFamily};
use crate::error::{EvalError, Unimplemented};
use crate::taxonomy::{ClassId, DatasetCategory, IGNORE_LABEL, TaxonomyRegistry};
use std::collections::BTreeSet;

const RELABELED_SUFFIX: &str = "-relabeled";

pub struct TaxonomyResolver<'a> {
    registry: &'a TaxonomyRegistry,
    ignore_label: ClassId,
}

impl<'a> TaxonomyResolver<'a> {
    pub fn new(registry: &'a TaxonomyRegistry) -> Self {
        Self {
            registry,
            ignore_label: IGNORE_LABEL,
        }
    }

    pub fn with_ignore_label(mut self, ignore_label: ClassId) -> Self {
        self.ignore_label = ignore_label;
        self
    }

    /// Resolve with the taxonomy chosen from the dataset's category.
    pub fn resolve(&self, dataset: &str, model_name: &str) -> Result<EvaluationContext, EvalError> {
        self.resolve_requested(dataset, model_name, None)
    }

    /// Resolve, optionally checking an explicitly requested taxonomy against
    /// the one the dataset's category implies.
    pub fn resolve_requested(
        &self,
        dataset: &str,
        model_name: &str,
        requested: Option<EvalTaxonomy>,
    ) -> Result<EvaluationContext, EvalError> {
        let category = self
            .registry
            .category(dataset)
            .ok_or_else(|| EvalError::unknown_dataset(dataset))?;

        let eval_taxonomy = match category {
            DatasetCategory::Training => EvalTaxonomy::Universal,
            DatasetCategory::Test => EvalTaxonomy::TestDataset,
        };
        match requested {
            Some(EvalTaxonomy::Naive) => {
                return Err(EvalError::NotImplemented(Unimplemented::NaiveTaxonomy));
            }
            Some(other) if other != eval_taxonomy => {
                return Err(EvalError::TaxonomyMismatch(format!(
                    "{dataset} is a {category:?} dataset and is evaluated in the {eval_taxonomy} taxonomy, not {other}"
                )));
            }
            _ => {}
        }

        let model_family = ModelFamily::from_model_name(model_name);
        let ground_truth = match (eval_taxonomy, model_family) {
            (EvalTaxonomy::Universal, ModelFamily::Unified { relabeled: true }) => {
                GroundTruth::Relabeled {
                    dataset: relabeled_dataset_name(dataset),
                }
            }
            _ => GroundTruth::Original,
        };

        let (class_names, excluded_ids) = match eval_taxonomy {
            EvalTaxonomy::Universal => (
                self.registry.universal().class_names().to_vec(),
                self.excluded_ids(dataset)?,
            ),
            _ => (
                self.registry
                    .require(dataset)?
                    .taxonomy()
                    .class_names()
                    .to_vec(),
                BTreeSet::new(),
            ),
        };

        if (self.ignore_label as usize) < class_names.len() {
            return Err(EvalError::invalid_label(format!(
                "ignore label {} collides with a class id of the {} taxonomy ({} classes)",
                self.ignore_label,
                eval_taxonomy,
                class_names.len()
            )));
        }

        tracing::info!(
            dataset,
            model = model_name,
            taxonomy = %eval_taxonomy,
            relabel = matches!(ground_truth, GroundTruth::Relabeled { .. }),
            excluded = excluded_ids.len(),
            classes = class_names.len(),
            "Resolved evaluation taxonomy"
        );

        Ok(EvaluationContext {
            dataset: dataset.to_string(),
            model_name: model_name.to_string(),
            model_family,
            category,
            eval_taxonomy,
            ground_truth,
            excluded_ids,
            class_names,
            ignore_label: self.ignore_label,
        })
    }

    /// Universal ids a training dataset cannot express. Empty for test
    /// datasets, which are never scored in the universal taxonomy.
    pub fn excluded_ids(&self, dataset: &str) -> Result<BTreeSet<ClassId>, EvalError> {
        let entry = self.registry.require(dataset)?;
        if entry.category() != DatasetCategory::Training {
            return Ok(BTreeSet::new());
        }
        let reachable = entry.to_universal().reachable();
        let excluded: BTreeSet<ClassId> = self
            .registry
            .universal()
            .ids()
            .filter(|id| !reachable.contains(id))
            .collect();
        tracing::debug!(
            dataset,
            reachable = reachable.len(),
            excluded = excluded.len(),
            "Computed exclusion set"
        );
        Ok(excluded)
    }
}

/// Name of the dataset holding universal-taxonomy re-annotations of `dataset`.
pub fn relabeled_dataset_name(dataset: &str) -> String {
    if dataset.ends_with(RELABELED_SUFFIX) {
        dataset.to_string()
    } else {
        format!("{dataset}{RELABELED_SUFFIX}")
    }
}
