//! Label remapping between taxonomies.
//!
//! All functions are pure lookups into a [`TaxonomyMapping`]. An id without
//! an entry is never given a default target; callers pick what happens through
//! [`UnmappedPolicy`].

use crate::error::RemapError;
use crate::taxonomy::{ClassId, TaxonomyMapping};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What to do with a pixel whose label has no mapping entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedPolicy {
    /// Replace the label with the ignore label so the unit is not scored.
    #[default]
    Ignore,
    /// Abort the run with `UnmappedLabel`.
    Fail,
}

/// Target ids of `id`.
pub fn remap(id: ClassId, mapping: &TaxonomyMapping) -> Result<&BTreeSet<ClassId>, RemapError> {
    mapping.get(id).ok_or_else(|| RemapError::Unmapped {
        id,
        mapping: mapping.label(),
    })
}

/// Target id of `id` when the mapping relates it to exactly one class.
pub fn remap_unique(id: ClassId, mapping: &TaxonomyMapping) -> Result<ClassId, RemapError> {
    let targets = remap(id, mapping)?;
    match targets.iter().next() {
        Some(target) if targets.len() == 1 => Ok(*target),
        _ => Err(RemapError::Ambiguous {
            id,
            targets: targets.len(),
            mapping: mapping.label(),
        }),
    }
}

/// Remap a dense label array, failing on the first element that cannot be
/// remapped. The output has the same length and order as the input.
pub fn remap_array(ids: &[ClassId], mapping: &TaxonomyMapping) -> Result<Vec<ClassId>, RemapError> {
    ids.iter()
        .enumerate()
        .map(|(index, id)| {
            remap_unique(*id, mapping).map_err(|err| match err {
                RemapError::Unmapped { id, mapping } => RemapError::UnmappedAt { id, index, mapping },
                other => other,
            })
        })
        .collect()
}

/// Remap a dense label array, reporting every element's outcome separately.
pub fn remap_array_status(
    ids: &[ClassId],
    mapping: &TaxonomyMapping,
) -> Vec<Result<ClassId, RemapError>> {
    ids.iter().map(|id| remap_unique(*id, mapping)).collect()
}

/// Result of remapping a label map under an [`UnmappedPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemappedLabels {
    pub labels: Vec<ClassId>,
    /// Elements replaced with the ignore label because they were unmapped.
    pub dropped: usize,
}

/// Remap a label map as stored on disk: `ignore_label` passes through
/// untouched and unmapped ids follow `policy`. Ambiguous ids always fail.
pub fn remap_label_map(
    ids: &[ClassId],
    mapping: &TaxonomyMapping,
    ignore_label: ClassId,
    policy: UnmappedPolicy,
) -> Result<RemappedLabels, RemapError> {
    let mut labels = Vec::with_capacity(ids.len());
    let mut dropped = 0;
    for (index, id) in ids.iter().copied().enumerate() {
        if id == ignore_label {
            labels.push(ignore_label);
            continue;
        }
        match remap_unique(id, mapping) {
            Ok(target) => labels.push(target),
            Err(RemapError::Unmapped { id, mapping }) => match policy {
                UnmappedPolicy::Ignore => {
                    labels.push(ignore_label);
                    dropped += 1;
                }
                UnmappedPolicy::Fail => {
                    return Err(RemapError::UnmappedAt { id, index, mapping });
                }
            },
            Err(other) => return Err(other),
        }
    }
    Ok(RemappedLabels { labels, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> TaxonomyMapping {
        // 0 -> 10, 1 -> 10, 2 -> {11, 12}, 3 unmapped
        TaxonomyMapping::from_pairs("src", "dst", [(0, 10), (1, 10), (2, 11), (2, 12)])
    }

    #[test]
    fn test_remap_returns_target_set() {
        let m = mapping();
        assert_eq!(remap(0, &m).unwrap(), &BTreeSet::from([10]));
        assert_eq!(remap(2, &m).unwrap(), &BTreeSet::from([11, 12]));
    }

    #[test]
    fn test_remap_unmapped_is_error() {
        let m = mapping();
        let err = remap(3, &m).unwrap_err();
        assert_eq!(
            err,
            RemapError::Unmapped {
                id: 3,
                mapping: "src->dst".into()
            }
        );
    }

    #[test]
    fn test_remap_unique_rejects_one_to_many() {
        let m = mapping();
        assert_eq!(remap_unique(1, &m).unwrap(), 10);
        assert!(matches!(
            remap_unique(2, &m),
            Err(RemapError::Ambiguous { targets: 2, .. })
        ));
    }

    #[test]
    fn test_remap_array_preserves_shape() {
        let m = mapping();
        assert_eq!(remap_array(&[1, 0, 1, 0], &m).unwrap(), vec![10, 10, 10, 10]);
        assert!(remap_array(&[], &m).unwrap().is_empty());
    }

    #[test]
    fn test_remap_array_fails_fast_with_index() {
        let m = mapping();
        let err = remap_array(&[0, 1, 3, 3], &m).unwrap_err();
        assert!(matches!(err, RemapError::UnmappedAt { id: 3, index: 2, .. }));
    }

    #[test]
    fn test_remap_array_status_per_element() {
        let m = mapping();
        let status = remap_array_status(&[0, 3, 2], &m);
        assert_eq!(status.len(), 3);
        assert_eq!(status[0], Ok(10));
        assert!(matches!(status[1], Err(RemapError::Unmapped { id: 3, .. })));
        assert!(matches!(status[2], Err(RemapError::Ambiguous { id: 2, .. })));
    }

    #[test]
    fn test_label_map_ignore_policy() {
        let m = mapping();
        let out = remap_label_map(&[0, 255, 3, 1], &m, 255, UnmappedPolicy::Ignore).unwrap();
        assert_eq!(out.labels, vec![10, 255, 255, 10]);
        assert_eq!(out.dropped, 1);
    }

    #[test]
    fn test_label_map_fail_policy() {
        let m = mapping();
        let err = remap_label_map(&[0, 255, 3], &m, 255, UnmappedPolicy::Fail).unwrap_err();
        assert!(matches!(err, RemapError::UnmappedAt { id: 3, index: 2, .. }));
    }

    #[test]
    fn test_one_to_one_round_trip() {
        let forward = TaxonomyMapping::from_pairs("a", "b", [(0, 2), (1, 0), (2, 1)]);
        let backward = forward.inverse();
        for id in 0..3 {
            let there = remap_unique(id, &forward).unwrap();
            assert_eq!(remap_unique(there, &backward).unwrap(), id);
        }
    }
}
