//! Registry of the universal taxonomy and every dataset taxonomy.

use crate::error::EvalError;
use crate::taxonomy::master::MasterTable;
use crate::taxonomy::{ClassId, Taxonomy, TaxonomyMapping, UNIVERSAL_TAXONOMY};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Role a dataset plays relative to the universal model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetCategory {
    /// Part of the universal model's training mix.
    Training,
    /// Held out; evaluated in its own taxonomy.
    Test,
}

/// A dataset's native taxonomy and its relation to the universal one.
#[derive(Debug, Clone)]
pub struct DatasetTaxonomy {
    taxonomy: Taxonomy,
    category: DatasetCategory,
    to_universal: TaxonomyMapping,
    from_universal: TaxonomyMapping,
}

impl DatasetTaxonomy {
    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn category(&self) -> DatasetCategory {
        self.category
    }

    /// Native ids → universal ids.
    pub fn to_universal(&self) -> &TaxonomyMapping {
        &self.to_universal
    }

    /// Universal ids → native ids.
    pub fn from_universal(&self) -> &TaxonomyMapping {
        &self.from_universal
    }
}

/// Static mapping tables between the universal taxonomy and dataset taxonomies.
#[derive(Debug, Clone)]
pub struct TaxonomyRegistry {
    universal: Taxonomy,
    datasets: BTreeMap<String, DatasetTaxonomy>,
}

impl TaxonomyRegistry {
    pub fn builder(universal: Taxonomy) -> TaxonomyRegistryBuilder {
        TaxonomyRegistryBuilder {
            universal,
            datasets: Vec::new(),
        }
    }

    /// Build a registry from a parsed master table.
    ///
    /// `categories` selects which dataset columns are registered and in which
    /// role; `class_names` supplies each dataset's native class list in id
    /// order. Columns not named in `categories` are ignored.
    pub fn from_master_table<F>(
        table: &MasterTable,
        categories: &BTreeMap<String, DatasetCategory>,
        mut class_names: F,
    ) -> Result<Self, EvalError>
    where
        F: FnMut(&str) -> Result<Vec<String>, EvalError>,
    {
        let universal = Taxonomy::new(UNIVERSAL_TAXONOMY, table.universal_classes().to_vec())?;
        let mut builder = Self::builder(universal);

        for (dataset, category) in categories {
            let column = table.column(dataset).ok_or_else(|| {
                EvalError::invalid_taxonomy(format!(
                    "dataset {dataset} has no column in the master table"
                ))
            })?;
            let taxonomy = Taxonomy::new(dataset.clone(), class_names(dataset)?)?;

            let mut to_universal = TaxonomyMapping::new(dataset.clone(), UNIVERSAL_TAXONOMY);
            for (universal_id, cell) in column.cells.iter().enumerate() {
                for class in cell {
                    let native_id = taxonomy.id_of(class).ok_or_else(|| {
                        EvalError::invalid_taxonomy(format!(
                            "class '{class}' in column {dataset} is not a {dataset} class"
                        ))
                    })?;
                    to_universal.insert(native_id, universal_id as ClassId);
                }
            }

            tracing::debug!(
                dataset = %dataset,
                ?category,
                classes = taxonomy.num_classes(),
                mapped = to_universal.len(),
                "Registered dataset taxonomy"
            );
            builder = builder.dataset(taxonomy, *category, to_universal);
        }

        let skipped: Vec<&str> = table
            .datasets()
            .filter(|d| !categories.contains_key(*d))
            .collect();
        if !skipped.is_empty() {
            tracing::debug!(?skipped, "Master table columns without a dataset role");
        }

        builder.build()
    }

    /// Load the master table at `master_path` and the `<dataset>_names.txt`
    /// class-name files found in `names_dir`.
    pub fn load(
        master_path: &Path,
        names_dir: &Path,
        train_datasets: &[String],
        test_datasets: &[String],
    ) -> Result<Self, EvalError> {
        let text = std::fs::read_to_string(master_path).map_err(|e| {
            EvalError::invalid_taxonomy(format!(
                "cannot read master table {}: {e}",
                master_path.display()
            ))
        })?;
        let table = MasterTable::parse(&text)?;

        let mut categories = BTreeMap::new();
        for dataset in train_datasets {
            categories.insert(dataset.clone(), DatasetCategory::Training);
        }
        for dataset in test_datasets {
            if categories
                .insert(dataset.clone(), DatasetCategory::Test)
                .is_some()
            {
                return Err(EvalError::config(format!(
                    "dataset {dataset} is listed as both a training and a test dataset"
                )));
            }
        }

        let registry = Self::from_master_table(&table, &categories, |dataset| {
            read_class_names(&names_dir.join(format!("{dataset}_names.txt")))
        })?;
        tracing::info!(
            universal_classes = registry.universal.num_classes(),
            datasets = registry.datasets.len(),
            "Loaded taxonomy registry from {}",
            master_path.display()
        );
        Ok(registry)
    }

    pub fn universal(&self) -> &Taxonomy {
        &self.universal
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetTaxonomy> {
        self.datasets.get(name)
    }

    /// Look up a dataset, failing with `UnknownDataset` when it is not registered.
    pub fn require(&self, name: &str) -> Result<&DatasetTaxonomy, EvalError> {
        self.dataset(name)
            .ok_or_else(|| EvalError::unknown_dataset(name))
    }

    pub fn category(&self, name: &str) -> Option<DatasetCategory> {
        self.dataset(name).map(DatasetTaxonomy::category)
    }

    /// Names of all datasets in the given role, sorted.
    pub fn datasets_in(&self, category: DatasetCategory) -> Vec<&str> {
        self.datasets
            .iter()
            .filter(|(_, d)| d.category == category)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn to_universal(&self, name: &str) -> Result<&TaxonomyMapping, EvalError> {
        self.require(name).map(DatasetTaxonomy::to_universal)
    }

    pub fn from_universal(&self, name: &str) -> Result<&TaxonomyMapping, EvalError> {
        self.require(name).map(DatasetTaxonomy::from_universal)
    }

    /// Universal ids a dataset's native classes can be expressed as.
    pub fn reachable_universal_ids(&self, name: &str) -> Result<BTreeSet<ClassId>, EvalError> {
        Ok(self.to_universal(name)?.reachable())
    }
}

/// Incremental construction of a [`TaxonomyRegistry`].
#[derive(Debug)]
pub struct TaxonomyRegistryBuilder {
    universal: Taxonomy,
    datasets: Vec<(Taxonomy, DatasetCategory, TaxonomyMapping)>,
}

impl TaxonomyRegistryBuilder {
    /// Register a dataset with its native→universal mapping. The reverse
    /// mapping is derived from it.
    pub fn dataset(
        mut self,
        taxonomy: Taxonomy,
        category: DatasetCategory,
        to_universal: TaxonomyMapping,
    ) -> Self {
        self.datasets.push((taxonomy, category, to_universal));
        self
    }

    pub fn build(self) -> Result<TaxonomyRegistry, EvalError> {
        let mut datasets = BTreeMap::new();
        for (taxonomy, category, to_universal) in self.datasets {
            let name = taxonomy.name().to_string();
            if name == UNIVERSAL_TAXONOMY {
                return Err(EvalError::invalid_taxonomy(
                    "a dataset cannot be named after the universal taxonomy",
                ));
            }
            if to_universal.source() != name || to_universal.target() != UNIVERSAL_TAXONOMY {
                return Err(EvalError::invalid_taxonomy(format!(
                    "mapping {} registered for dataset {name}",
                    to_universal.label()
                )));
            }
            to_universal.validate(&taxonomy, &self.universal)?;

            let from_universal = to_universal.inverse();
            let entry = DatasetTaxonomy {
                taxonomy,
                category,
                to_universal,
                from_universal,
            };
            if datasets.insert(name.clone(), entry).is_some() {
                return Err(EvalError::invalid_taxonomy(format!(
                    "dataset {name} registered twice"
                )));
            }
        }

        Ok(TaxonomyRegistry {
            universal: self.universal,
            datasets,
        })
    }
}

/// Read a class-name file: one name per line, blank lines skipped.
pub fn read_class_names(path: &Path) -> Result<Vec<String>, EvalError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EvalError::invalid_taxonomy(format!("cannot read class names {}: {e}", path.display()))
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
