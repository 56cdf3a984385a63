//! Label taxonomies and the id relations between them.
//!
//! A [`Taxonomy`] is an ordered list of class names whose position is the
//! class id. A [`TaxonomyMapping`] relates the ids of one taxonomy to sets of
//! ids of another, which covers many-to-one, one-to-many and partial
//! correspondences. The [`TaxonomyRegistry`] holds the universal taxonomy and
//! every dataset taxonomy together with their mappings.

pub mod master;
pub mod registry;

pub use master::MasterTable;
pub use registry::{DatasetCategory, DatasetTaxonomy, TaxonomyRegistry, TaxonomyRegistryBuilder};

use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Dense class id within one taxonomy.
pub type ClassId = u16;

/// Label value marking a pixel that is not scored.
pub const IGNORE_LABEL: ClassId = 255;

/// Name of the unified taxonomy column in mapping tables.
pub const UNIVERSAL_TAXONOMY: &str = "universal";

/// Datasets the universal model is trained on.
pub const DEFAULT_TRAIN_DATASETS: &[&str] = &[
    "ade20k-150-relabeled",
    "bdd-relabeled",
    "cityscapes-19-relabeled",
    "coco-panoptic-133-relabeled",
    "idd-39-relabeled",
    "mapillary-public65-relabeled",
    "sunrgbd-37-relabeled",
];

/// Held-out datasets never seen during training.
pub const TEST_DATASETS: &[&str] = &[
    "camvid-11",
    "kitti-19",
    "pascal-context-60",
    "scannet-20",
    "voc2012",
    "wilddash-19",
];

/// A named, ordered set of classes with ids `0..num_classes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Taxonomy {
    name: String,
    class_names: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, ClassId>,
}

impl Taxonomy {
    /// Build a taxonomy, rejecting empty, duplicated or oversized class lists.
    pub fn new(name: impl Into<String>, class_names: Vec<String>) -> Result<Self, EvalError> {
        let name = name.into();
        if class_names.is_empty() {
            return Err(EvalError::invalid_taxonomy(format!(
                "taxonomy {name} has no classes"
            )));
        }
        if class_names.len() > ClassId::MAX as usize {
            return Err(EvalError::invalid_taxonomy(format!(
                "taxonomy {name} has {} classes, more than a label id can hold",
                class_names.len()
            )));
        }

        let mut index = HashMap::with_capacity(class_names.len());
        for (id, class) in class_names.iter().enumerate() {
            if index.insert(class.clone(), id as ClassId).is_some() {
                return Err(EvalError::invalid_taxonomy(format!(
                    "taxonomy {name} lists class '{class}' twice"
                )));
            }
        }

        Ok(Self {
            name,
            class_names,
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn class_name(&self, id: ClassId) -> Option<&str> {
        self.class_names.get(id as usize).map(String::as_str)
    }

    /// Id of a class by name.
    pub fn id_of(&self, class: &str) -> Option<ClassId> {
        self.index.get(class).copied()
    }

    pub fn contains(&self, id: ClassId) -> bool {
        (id as usize) < self.class_names.len()
    }

    /// All ids of this taxonomy in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ClassId> + '_ {
        (0..self.class_names.len()).map(|id| id as ClassId)
    }
}

/// Directed relation from the ids of one taxonomy to sets of ids of another.
///
/// A source id without an entry is *unmapped*. Entries are never empty: an id
/// is either absent or maps to at least one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyMapping {
    source: String,
    target: String,
    entries: BTreeMap<ClassId, BTreeSet<ClassId>>,
}

impl TaxonomyMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Build a mapping from `(source, target)` id pairs.
    pub fn from_pairs(
        source: impl Into<String>,
        target: impl Into<String>,
        pairs: impl IntoIterator<Item = (ClassId, ClassId)>,
    ) -> Self {
        let mut mapping = Self::new(source, target);
        for (from, to) in pairs {
            mapping.insert(from, to);
        }
        mapping
    }

    /// Relate `from` to `to`, keeping any targets already recorded for `from`.
    pub fn insert(&mut self, from: ClassId, to: ClassId) {
        self.entries.entry(from).or_default().insert(to);
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Human-readable `source->target` label used in errors and logs.
    pub fn label(&self) -> String {
        format!("{}->{}", self.source, self.target)
    }

    pub fn get(&self, id: ClassId) -> Option<&BTreeSet<ClassId>> {
        self.entries.get(&id)
    }

    pub fn is_mapped(&self, id: ClassId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &BTreeSet<ClassId>)> {
        self.entries.iter().map(|(id, targets)| (*id, targets))
    }

    /// Every target id reachable from some source id.
    pub fn reachable(&self) -> BTreeSet<ClassId> {
        self.entries.values().flatten().copied().collect()
    }

    /// The same relation with source and target swapped.
    pub fn inverse(&self) -> Self {
        let mut inverse = Self::new(self.target.clone(), self.source.clone());
        for (from, targets) in &self.entries {
            for to in targets {
                inverse.insert(*to, *from);
            }
        }
        inverse
    }

    /// Check that every id on both sides exists in the given taxonomies.
    pub fn validate(&self, source: &Taxonomy, target: &Taxonomy) -> Result<(), EvalError> {
        for (from, targets) in &self.entries {
            if !source.contains(*from) {
                return Err(EvalError::invalid_taxonomy(format!(
                    "mapping {} uses source id {from} outside {} ({} classes)",
                    self.label(),
                    source.name(),
                    source.num_classes()
                )));
            }
            if let Some(to) = targets.iter().find(|to| !target.contains(**to)) {
                return Err(EvalError::invalid_taxonomy(format!(
                    "mapping {} uses target id {to} outside {} ({} classes)",
                    self.label(),
                    target.name(),
                    target.num_classes()
                )));
            }
        }
        Ok(())
    }
}
