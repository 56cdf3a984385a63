//! Final evaluation reports and where they are stored.

use crate::accuracy::AccuracyAggregator;
use crate::context::{EvalTaxonomy, EvaluationContext};
use crate::taxonomy::ClassId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the report inside a results directory.
pub const REPORT_FILE: &str = "report.json";

/// File name of the cached label maps inside a results directory.
pub const LABEL_CACHE_FILE: &str = "label_cache.jsonl";

/// Scoring state of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassStatus {
    Scored,
    /// Neither predicted nor present in the ground truth.
    NoData,
    /// Outside the classes the training dataset can express.
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassResult {
    pub id: ClassId,
    pub name: String,
    pub status: ClassStatus,
    pub iou: Option<f64>,
    pub accuracy: Option<f64>,
    /// Ground-truth units of this class.
    pub support: u64,
}

/// Counters gathered while consuming the label stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub images: usize,
    /// Units replaced with the ignore label because a label had no mapping.
    pub dropped_units: u64,
}

impl RunStats {
    pub fn merge(&mut self, other: RunStats) {
        self.images += other.images;
        self.dropped_units += other.dropped_units;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub dataset: String,
    pub model_name: String,
    pub eval_taxonomy: EvalTaxonomy,
    pub relabeled: bool,
    pub base_size: u32,
    pub excluded_ids: Vec<ClassId>,
    pub classes: Vec<ClassResult>,
    pub mean_iou: Option<f64>,
    pub mean_accuracy: Option<f64>,
    pub pixel_accuracy: Option<f64>,
    pub scored_units: u64,
    pub skipped_units: u64,
    pub stats: RunStats,
    /// Rows are ground-truth classes, columns predicted classes.
    pub confusion: Vec<Vec<u64>>,
}

impl EvaluationReport {
    pub fn build(
        context: &EvaluationContext,
        aggregator: &AccuracyAggregator,
        base_size: u32,
        stats: RunStats,
    ) -> Self {
        let iou = aggregator.per_class_iou();
        let accuracy = aggregator.per_class_accuracy();

        let classes = context
            .class_names
            .iter()
            .enumerate()
            .map(|(id, name)| {
                let id = id as ClassId;
                let class_iou = iou.get(&id).copied().flatten();
                let status = if context.excluded_ids.contains(&id) {
                    ClassStatus::Excluded
                } else if class_iou.is_some() {
                    ClassStatus::Scored
                } else {
                    ClassStatus::NoData
                };
                ClassResult {
                    id,
                    name: name.clone(),
                    status,
                    iou: class_iou,
                    accuracy: accuracy.get(&id).copied().flatten(),
                    support: aggregator.support(id),
                }
            })
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            dataset: context.dataset.clone(),
            model_name: context.model_name.clone(),
            eval_taxonomy: context.eval_taxonomy,
            relabeled: context.relabel_required(),
            base_size,
            excluded_ids: context.excluded_ids.iter().copied().collect(),
            classes,
            mean_iou: aggregator.mean_iou(),
            mean_accuracy: aggregator.mean_accuracy(),
            pixel_accuracy: aggregator.pixel_accuracy(),
            scored_units: aggregator.scored_units(),
            skipped_units: aggregator.skipped_units(),
            stats,
            confusion: aggregator.confusion().rows(),
        }
    }

    pub fn scored_classes(&self) -> impl Iterator<Item = &ClassResult> {
        self.classes
            .iter()
            .filter(|c| c.status == ClassStatus::Scored)
    }

    /// Plain-text table of the per-class results followed by the summary.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} | {} | {} taxonomy | base size {}",
            self.model_name, self.dataset, self.eval_taxonomy, self.base_size
        );
        let _ = writeln!(out, "{:>4}  {:<28} {:>8} {:>8} {:>12}", "id", "class", "IoU", "Acc", "support");
        for class in &self.classes {
            let _ = writeln!(
                out,
                "{:>4}  {:<28} {:>8} {:>8} {:>12}",
                class.id,
                truncate(&class.name, 28),
                format_metric(class.iou, class.status),
                format_metric(class.accuracy, class.status),
                class.support
            );
        }
        let _ = writeln!(
            out,
            "mIoU {} | mAcc {} | allAcc {} | {} of {} classes scored",
            format_metric(self.mean_iou, ClassStatus::Scored),
            format_metric(self.mean_accuracy, ClassStatus::Scored),
            format_metric(self.pixel_accuracy, ClassStatus::Scored),
            self.scored_classes().count(),
            self.classes.len()
        );
        out
    }

    /// Emit the per-class results and the summary through `tracing`.
    pub fn log_summary(&self) {
        for class in &self.classes {
            tracing::info!(
                "Class_{} result: iou/accuracy {}/{}, name: {}",
                class.id,
                format_metric(class.iou, class.status),
                format_metric(class.accuracy, class.status),
                class.name
            );
        }
        tracing::info!(
            dataset = %self.dataset,
            taxonomy = %self.eval_taxonomy,
            "Eval result: mIoU/mAcc/allAcc {}/{}/{}",
            format_metric(self.mean_iou, ClassStatus::Scored),
            format_metric(self.mean_accuracy, ClassStatus::Scored),
            format_metric(self.pixel_accuracy, ClassStatus::Scored),
        );
    }
}

fn format_metric(value: Option<f64>, status: ClassStatus) -> String {
    match (value, status) {
        (_, ClassStatus::Excluded) => "excluded".to_string(),
        (Some(v), _) => format!("{v:.4}"),
        (None, _) => "no data".to_string(),
    }
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        name.to_string()
    } else {
        let mut short: String = name.chars().take(width - 1).collect();
        short.push('~');
        short
    }
}

/// Directory for the results of one configuration:
/// `<root>/<model stem>/<dataset>[_universal[_relabeled]]/<base_size>`.
///
/// `root` defaults to the directory holding the model weights.
pub fn results_dir(
    model_path: &Path,
    results_root: Option<&Path>,
    context: &EvaluationContext,
    base_size: u32,
) -> PathBuf {
    let root = results_root
        .map(Path::to_path_buf)
        .or_else(|| model_path.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let stem = model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| context.model_name.clone());

    let leaf = match (context.eval_taxonomy, context.relabel_required()) {
        (EvalTaxonomy::Universal, true) => format!("{}_universal_relabeled", context.dataset),
        (EvalTaxonomy::Universal, false) => format!("{}_universal", context.dataset),
        (EvalTaxonomy::Naive, _) => format!("{}_naive", context.dataset),
        (EvalTaxonomy::TestDataset, _) => context.dataset.clone(),
    };

    root.join(stem).join(leaf).join(base_size.to_string())
}
