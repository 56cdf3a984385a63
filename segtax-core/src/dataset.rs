//! Dataset registry: class names, data roots and evaluation split lists.

use crate::error::EvalError;
use crate::taxonomy::registry::read_class_names;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One evaluation sample, with paths relative to the dataset's data root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataItem {
    pub image: PathBuf,
    pub label: PathBuf,
}

impl DataItem {
    /// Key under which cached label maps for this item are stored.
    pub fn key(&self) -> String {
        self.image.to_string_lossy().replace('\\', "/")
    }
}

/// Everything the evaluator needs to know about one dataset.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub name: String,
    /// Native class names in id order.
    pub class_names: Vec<String>,
    pub data_root: PathBuf,
    /// Items of the evaluation (validation) split.
    pub items: Vec<DataItem>,
}

/// Source of dataset descriptions.
pub trait DatasetRegistry {
    fn dataset(&self, name: &str) -> Result<DatasetInfo, EvalError>;
}

/// Registry backed by a fixed set of descriptions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatasetRegistry {
    datasets: BTreeMap<String, DatasetInfo>,
}

impl InMemoryDatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: DatasetInfo) {
        self.datasets.insert(info.name.clone(), info);
    }
}

impl DatasetRegistry for InMemoryDatasetRegistry {
    fn dataset(&self, name: &str) -> Result<DatasetInfo, EvalError> {
        self.datasets
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::dataset(format!("no registry entry for {name}")))
    }
}

/// One `[datasets.<name>]` table of the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub data_root: PathBuf,
    /// Split list of the validation set.
    pub val_list: PathBuf,
    /// Class-name file; defaults to `<names_dir>/<name>_names.txt`.
    #[serde(default)]
    pub names: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    datasets: BTreeMap<String, DatasetEntry>,
}

/// Registry described by a TOML manifest. Relative paths in the manifest are
/// resolved against the manifest's directory; files are read on lookup.
#[derive(Debug, Clone)]
pub struct FileDatasetRegistry {
    base_dir: PathBuf,
    names_dir: PathBuf,
    entries: BTreeMap<String, DatasetEntry>,
}

impl FileDatasetRegistry {
    pub fn load(manifest_path: &Path, names_dir: &Path) -> Result<Self, EvalError> {
        let text = std::fs::read_to_string(manifest_path).map_err(|e| {
            EvalError::dataset(format!(
                "cannot read dataset manifest {}: {e}",
                manifest_path.display()
            ))
        })?;
        let manifest: Manifest = toml::from_str(&text).map_err(|e| {
            EvalError::dataset(format!(
                "invalid dataset manifest {}: {e}",
                manifest_path.display()
            ))
        })?;
        let base_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        tracing::debug!(
            datasets = manifest.datasets.len(),
            "Loaded dataset manifest {}",
            manifest_path.display()
        );
        Ok(Self {
            base_dir,
            names_dir: names_dir.to_path_buf(),
            entries: manifest.datasets,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl DatasetRegistry for FileDatasetRegistry {
    fn dataset(&self, name: &str) -> Result<DatasetInfo, EvalError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| EvalError::dataset(format!("no manifest entry for {name}")))?;

        let names_path = match &entry.names {
            Some(path) => self.resolve(path),
            None => self.names_dir.join(format!("{name}_names.txt")),
        };
        let class_names = read_class_names(&names_path)?;
        let items = read_split_list(&self.resolve(&entry.val_list))?;

        Ok(DatasetInfo {
            name: name.to_string(),
            class_names,
            data_root: self.resolve(&entry.data_root),
            items,
        })
    }
}

/// Read a split list: one `<image> <label>` pair per line, `#` comments and
/// blank lines skipped.
pub fn read_split_list(path: &Path) -> Result<Vec<DataItem>, EvalError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EvalError::dataset(format!("cannot read split list {}: {e}", path.display()))
    })?;

    let mut items = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(image), Some(label), None) => items.push(DataItem {
                image: PathBuf::from(image),
                label: PathBuf::from(label),
            }),
            _ => {
                return Err(EvalError::dataset(format!(
                    "{}:{}: expected '<image> <label>'",
                    path.display(),
                    line_no + 1
                )));
            }
        }
    }
    Ok(items)
}
