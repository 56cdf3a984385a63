//! Confusion-matrix accumulation and segmentation metrics.
//!
//! Counts are indexed `[true][predicted]`. A class whose union is empty has no
//! IoU at all (`None`), which keeps it out of every mean instead of scoring it
//! as zero.

use crate::context::EvaluationContext;
use crate::error::EvalError;
use crate::taxonomy::ClassId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Dense `num_classes × num_classes` count matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionAccumulator {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionAccumulator {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    /// Build from explicit rows; every row must have `rows.len()` entries.
    pub fn from_rows(rows: &[Vec<u64>]) -> Result<Self, EvalError> {
        let n = rows.len();
        let mut confusion = Self::new(n);
        for (t, row) in rows.iter().enumerate() {
            if row.len() != n {
                return Err(EvalError::ShapeMismatch(format!(
                    "confusion row {t} has {} entries, expected {n}",
                    row.len()
                )));
            }
            confusion.counts[t * n..(t + 1) * n].copy_from_slice(row);
        }
        Ok(confusion)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Count of units with true class `truth` predicted as `predicted`;
    /// `None` if either id is outside the taxonomy.
    pub fn get(&self, truth: ClassId, predicted: ClassId) -> Option<u64> {
        let n = self.num_classes;
        ((truth as usize) < n && (predicted as usize) < n).then(|| self.count(truth, predicted))
    }

    /// Unchecked lookup for ids already known to be in range.
    fn count(&self, truth: ClassId, predicted: ClassId) -> u64 {
        self.counts[truth as usize * self.num_classes + predicted as usize]
    }

    fn increment(&mut self, truth: ClassId, predicted: ClassId) {
        self.counts[truth as usize * self.num_classes + predicted as usize] += 1;
    }

    /// Counts of one ground-truth class by predicted class; `None` if `truth`
    /// is outside the taxonomy.
    pub fn row(&self, truth: ClassId) -> Option<&[u64]> {
        if truth as usize >= self.num_classes {
            return None;
        }
        let start = truth as usize * self.num_classes;
        Some(&self.counts[start..start + self.num_classes])
    }

    pub fn rows(&self) -> Vec<Vec<u64>> {
        self.counts
            .chunks(self.num_classes.max(1))
            .map(<[u64]>::to_vec)
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Add another accumulator's counts into this one.
    pub fn merge(&mut self, other: &Self) -> Result<(), EvalError> {
        if other.num_classes != self.num_classes {
            return Err(EvalError::ShapeMismatch(format!(
                "cannot merge a {0}x{0} confusion matrix into a {1}x{1} one",
                other.num_classes, self.num_classes
            )));
        }
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
        Ok(())
    }
}

/// Accumulates `(predicted, true)` observations in the evaluation taxonomy and
/// derives metrics on demand.
#[derive(Debug, Clone)]
pub struct AccuracyAggregator {
    confusion: ConfusionAccumulator,
    excluded: BTreeSet<ClassId>,
    ignore_label: ClassId,
    scored_units: u64,
    skipped_units: u64,
}

impl AccuracyAggregator {
    pub fn new(
        num_classes: usize,
        excluded: BTreeSet<ClassId>,
        ignore_label: ClassId,
    ) -> Result<Self, EvalError> {
        Self::with_confusion(ConfusionAccumulator::new(num_classes), excluded, ignore_label)
    }

    /// Aggregator sized and configured for a resolved evaluation run.
    pub fn for_context(context: &EvaluationContext) -> Result<Self, EvalError> {
        Self::new(
            context.class_names.len(),
            context.excluded_ids.clone(),
            context.ignore_label,
        )
    }

    /// Wrap an existing confusion matrix, e.g. one restored from a report.
    pub fn with_confusion(
        confusion: ConfusionAccumulator,
        excluded: BTreeSet<ClassId>,
        ignore_label: ClassId,
    ) -> Result<Self, EvalError> {
        let n = confusion.num_classes();
        if (ignore_label as usize) < n {
            return Err(EvalError::invalid_label(format!(
                "ignore label {ignore_label} collides with a class id of a {n}-class taxonomy"
            )));
        }
        if let Some(id) = excluded.iter().find(|id| **id as usize >= n) {
            return Err(EvalError::invalid_label(format!(
                "excluded id {id} is outside a {n}-class taxonomy"
            )));
        }
        Ok(Self {
            confusion,
            excluded,
            ignore_label,
            scored_units: 0,
            skipped_units: 0,
        })
    }

    /// Record one unit. Units whose true label is ignored or excluded are
    /// skipped; anything else must be a valid id on both sides.
    pub fn accumulate(&mut self, predicted: ClassId, truth: ClassId) -> Result<(), EvalError> {
        if truth == self.ignore_label || self.excluded.contains(&truth) {
            self.skipped_units += 1;
            return Ok(());
        }
        let n = self.confusion.num_classes();
        if truth as usize >= n || predicted as usize >= n {
            return Err(EvalError::invalid_label(format!(
                "pair (predicted {predicted}, true {truth}) is outside a {n}-class taxonomy"
            )));
        }
        self.confusion.increment(truth, predicted);
        self.scored_units += 1;
        Ok(())
    }

    /// Record aligned prediction and ground-truth label maps.
    pub fn accumulate_batch(
        &mut self,
        predicted: &[ClassId],
        truth: &[ClassId],
    ) -> Result<(), EvalError> {
        if predicted.len() != truth.len() {
            return Err(EvalError::ShapeMismatch(format!(
                "{} predictions for {} ground-truth labels",
                predicted.len(),
                truth.len()
            )));
        }
        for (p, t) in predicted.iter().zip(truth) {
            self.accumulate(*p, *t)?;
        }
        Ok(())
    }

    /// Fold a worker's aggregator into this one.
    pub fn merge(&mut self, other: &Self) -> Result<(), EvalError> {
        if other.excluded != self.excluded || other.ignore_label != self.ignore_label {
            return Err(EvalError::ShapeMismatch(
                "cannot merge aggregators with different exclusion sets or ignore labels".into(),
            ));
        }
        self.confusion.merge(&other.confusion)?;
        self.scored_units += other.scored_units;
        self.skipped_units += other.skipped_units;
        Ok(())
    }

    pub fn confusion(&self) -> &ConfusionAccumulator {
        &self.confusion
    }

    pub fn excluded(&self) -> &BTreeSet<ClassId> {
        &self.excluded
    }

    pub fn scored_units(&self) -> u64 {
        self.scored_units
    }

    pub fn skipped_units(&self) -> u64 {
        self.skipped_units
    }

    fn scored_classes(&self) -> impl Iterator<Item = ClassId> + '_ {
        (0..self.confusion.num_classes())
            .map(|c| c as ClassId)
            .filter(|c| !self.excluded.contains(c))
    }

    /// Ground-truth count of a class; 0 for ids outside the taxonomy.
    pub fn support(&self, class: ClassId) -> u64 {
        self.confusion
            .row(class)
            .map_or(0, |row| row.iter().sum())
    }

    /// Predicted count of a class over scored ground-truth rows; 0 for ids
    /// outside the taxonomy.
    pub fn predicted_count(&self, class: ClassId) -> u64 {
        self.scored_classes()
            .filter_map(|truth| self.confusion.get(truth, class))
            .sum()
    }

    /// IoU of every non-excluded class; `None` where the union is empty.
    pub fn per_class_iou(&self) -> BTreeMap<ClassId, Option<f64>> {
        self.scored_classes()
            .map(|c| {
                let intersection = self.confusion.count(c, c);
                let union = self.support(c) + self.predicted_count(c) - intersection;
                let iou = (union > 0).then(|| intersection as f64 / union as f64);
                (c, iou)
            })
            .collect()
    }

    /// Recall of every non-excluded class; `None` where it has no ground truth.
    pub fn per_class_accuracy(&self) -> BTreeMap<ClassId, Option<f64>> {
        self.scored_classes()
            .map(|c| {
                let support = self.support(c);
                let accuracy =
                    (support > 0).then(|| self.confusion.count(c, c) as f64 / support as f64);
                (c, accuracy)
            })
            .collect()
    }

    pub fn mean_iou(&self) -> Option<f64> {
        mean_defined(self.per_class_iou().into_values())
    }

    pub fn mean_accuracy(&self) -> Option<f64> {
        mean_defined(self.per_class_accuracy().into_values())
    }

    /// Correct units over all units with a scored ground-truth class.
    pub fn pixel_accuracy(&self) -> Option<f64> {
        let (correct, total) = self.scored_classes().fold((0u64, 0u64), |(correct, total), c| {
            (correct + self.confusion.count(c, c), total + self.support(c))
        });
        (total > 0).then(|| correct as f64 / total as f64)
    }
}

fn mean_defined(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IGNORE: ClassId = 255;

    fn reference_matrix() -> ConfusionAccumulator {
        ConfusionAccumulator::from_rows(&[vec![10, 2, 0], vec![1, 8, 1], vec![0, 0, 5]]).unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_per_class_iou_hand_computed() {
        let agg =
            AccuracyAggregator::with_confusion(reference_matrix(), BTreeSet::new(), IGNORE).unwrap();
        let iou = agg.per_class_iou();
        // class 1: row 10 + column 10 - diagonal 8
        assert!(close(iou[&0].unwrap(), 10.0 / 13.0));
        assert!(close(iou[&1].unwrap(), 8.0 / 12.0));
        assert!(close(iou[&2].unwrap(), 5.0 / 6.0));

        let expected_mean = (10.0 / 13.0 + 8.0 / 12.0 + 5.0 / 6.0) / 3.0;
        assert!(close(agg.mean_iou().unwrap(), expected_mean));
        assert!(close(agg.pixel_accuracy().unwrap(), 23.0 / 27.0));
    }

    #[test]
    fn test_per_class_accuracy() {
        let agg =
            AccuracyAggregator::with_confusion(reference_matrix(), BTreeSet::new(), IGNORE).unwrap();
        let acc = agg.per_class_accuracy();
        assert!(close(acc[&0].unwrap(), 10.0 / 12.0));
        assert!(close(acc[&1].unwrap(), 8.0 / 10.0));
        assert!(close(acc[&2].unwrap(), 1.0));
    }

    #[test]
    fn test_exclusion_removes_class_everywhere() {
        let agg = AccuracyAggregator::with_confusion(
            reference_matrix(),
            BTreeSet::from([2]),
            IGNORE,
        )
        .unwrap();
        let iou = agg.per_class_iou();
        assert!(!iou.contains_key(&2));
        assert_eq!(iou.len(), 2);

        let expected_mean = (10.0 / 13.0 + 8.0 / 12.0) / 2.0;
        assert!(close(agg.mean_iou().unwrap(), expected_mean));
        // rows 0 and 1 only: diagonal 18 of 22 units
        assert!(close(agg.pixel_accuracy().unwrap(), 18.0 / 22.0));
    }

    #[test]
    fn test_absent_class_is_no_data_not_zero() {
        let mut agg = AccuracyAggregator::new(3, BTreeSet::new(), IGNORE).unwrap();
        agg.accumulate(0, 0).unwrap();
        agg.accumulate(1, 1).unwrap();
        agg.accumulate(1, 0).unwrap();

        let iou = agg.per_class_iou();
        assert_eq!(iou[&2], None);
        assert!(close(iou[&0].unwrap(), 0.5));
        assert!(close(iou[&1].unwrap(), 0.5));
        assert!(close(agg.mean_iou().unwrap(), 0.5));
        assert_eq!(agg.per_class_accuracy()[&2], None);
    }

    #[test]
    fn test_empty_aggregator_has_no_metrics() {
        let agg = AccuracyAggregator::new(4, BTreeSet::new(), IGNORE).unwrap();
        assert_eq!(agg.mean_iou(), None);
        assert_eq!(agg.pixel_accuracy(), None);
        assert_eq!(agg.mean_accuracy(), None);
    }

    #[test]
    fn test_ignored_and_excluded_labels_are_skipped() {
        let mut agg = AccuracyAggregator::new(3, BTreeSet::from([1]), IGNORE).unwrap();
        agg.accumulate(0, IGNORE).unwrap();
        agg.accumulate(0, 1).unwrap();
        agg.accumulate(2, 2).unwrap();
        assert_eq!(agg.confusion().total(), 1);
        assert_eq!(agg.scored_units(), 1);
        assert_eq!(agg.skipped_units(), 2);
    }

    #[test]
    fn test_out_of_range_labels_are_rejected() {
        let mut agg = AccuracyAggregator::new(3, BTreeSet::new(), IGNORE).unwrap();
        assert!(matches!(
            agg.accumulate(7, 0),
            Err(EvalError::InvalidLabel(_))
        ));
        assert!(matches!(
            agg.accumulate(0, 9),
            Err(EvalError::InvalidLabel(_))
        ));
    }

    #[test]
    fn test_accessors_outside_taxonomy() {
        let mut agg = AccuracyAggregator::new(3, BTreeSet::new(), IGNORE).unwrap();
        agg.accumulate_batch(&[0, 1, 2], &[0, 1, 2]).unwrap();

        assert_eq!(agg.confusion().get(3, 0), None);
        assert_eq!(agg.confusion().get(0, 3), None);
        assert_eq!(agg.confusion().row(3), None);
        assert_eq!(agg.confusion().row(2), Some(&[0, 0, 1][..]));
        assert_eq!(agg.support(IGNORE), 0);
        assert_eq!(agg.predicted_count(IGNORE), 0);
    }

    #[test]
    fn test_ignore_label_must_not_be_a_class() {
        assert!(AccuracyAggregator::new(300, BTreeSet::new(), 255).is_err());
        assert!(AccuracyAggregator::new(3, BTreeSet::from([3]), 255).is_err());
    }

    #[test]
    fn test_accumulate_batch_shape_check() {
        let mut agg = AccuracyAggregator::new(3, BTreeSet::new(), IGNORE).unwrap();
        assert!(matches!(
            agg.accumulate_batch(&[0, 1], &[0]),
            Err(EvalError::ShapeMismatch(_))
        ));
        agg.accumulate_batch(&[0, 1, 2], &[0, 1, 1]).unwrap();
        assert_eq!(agg.confusion().get(1, 2), Some(1));
    }

    #[test]
    fn test_merge_equals_sequential() {
        let pairs = [(0, 0), (1, 0), (2, 2), (1, 1), (0, 2), (2, 1)];
        let mut sequential = AccuracyAggregator::new(3, BTreeSet::new(), IGNORE).unwrap();
        for (p, t) in pairs {
            sequential.accumulate(p, t).unwrap();
        }

        let mut left = AccuracyAggregator::new(3, BTreeSet::new(), IGNORE).unwrap();
        let mut right = AccuracyAggregator::new(3, BTreeSet::new(), IGNORE).unwrap();
        for (p, t) in &pairs[..2] {
            left.accumulate(*p, *t).unwrap();
        }
        for (p, t) in &pairs[2..] {
            right.accumulate(*p, *t).unwrap();
        }
        left.merge(&right).unwrap();

        assert_eq!(left.confusion(), sequential.confusion());
        assert_eq!(left.scored_units(), 6);
    }

    #[test]
    fn test_merge_rejects_different_shapes() {
        let mut a = AccuracyAggregator::new(3, BTreeSet::new(), IGNORE).unwrap();
        let b = AccuracyAggregator::new(4, BTreeSet::new(), IGNORE).unwrap();
        assert!(a.merge(&b).is_err());
        let c = AccuracyAggregator::new(3, BTreeSet::from([0]), IGNORE).unwrap();
        assert!(a.merge(&c).is_err());
    }

    #[test]
    fn test_metrics_are_idempotent() {
        let agg =
            AccuracyAggregator::with_confusion(reference_matrix(), BTreeSet::new(), IGNORE).unwrap();
        assert_eq!(agg.per_class_iou(), agg.per_class_iou());
        assert_eq!(agg.mean_iou(), agg.mean_iou());
    }
}
