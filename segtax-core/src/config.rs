//! Configuration for evaluation runs.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> config
//! file -> environment -> CLI overrides. The loaded [`EvalConfig`] is treated
//! as read-only by every stage after validation.

use crate::context::EvalTaxonomy;
use crate::error::EvalError;
use crate::remap::UnmappedPolicy;
use crate::taxonomy::{ClassId, DEFAULT_TRAIN_DATASETS, IGNORE_LABEL, TEST_DATASETS};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The only split with ground truth labels.
pub const EVAL_SPLIT: &str = "val";

/// Top-level configuration for one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Dataset to evaluate on.
    #[serde(default)]
    pub dataset: String,
    /// Model identifier; its naming convention selects the model family.
    #[serde(default)]
    pub model_name: String,
    /// Path to the model weights. Results are stored next to it.
    #[serde(default)]
    pub model_path: PathBuf,
    /// Resize target of the shorter image side at inference.
    #[serde(default = "default_base_size")]
    pub base_size: u32,
    /// Crop height used at inference. Passed through to the inference
    /// collaborator and recorded in the effective configuration.
    #[serde(default = "default_crop")]
    pub test_h: u32,
    /// Crop width used at inference. Passed through like `test_h`.
    #[serde(default = "default_crop")]
    pub test_w: u32,
    /// Multi-scale inference factors, passed through to the inference
    /// collaborator.
    #[serde(default = "default_scales")]
    pub scales: Vec<f64>,
    /// Split to score. Only `val` carries ground truth; anything else is
    /// rejected by [`EvalConfig::validate`].
    #[serde(default = "default_split")]
    pub split: String,
    /// GPU device ids handed to the inference collaborator. Scoring itself
    /// never touches them.
    #[serde(default = "default_test_gpu")]
    pub test_gpu: Vec<u32>,
    /// Explicit evaluation taxonomy; chosen from the dataset when unset.
    #[serde(default)]
    pub eval_taxonomy: Option<EvalTaxonomy>,
    /// Label value for pixels that are never scored.
    #[serde(default = "default_ignore_label")]
    pub ignore_label: ClassId,
    /// Handling of labels without a mapping entry.
    #[serde(default)]
    pub unmapped_policy: UnmappedPolicy,
    /// Number of evaluation workers, each with its own accumulator.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Log progress every this many images.
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,
    /// Cached label maps to score; defaults to `label_cache.jsonl` in the
    /// results directory.
    #[serde(default)]
    pub prediction_cache: Option<PathBuf>,
    /// Root for result directories; defaults to the model's directory.
    #[serde(default)]
    pub results_root: Option<PathBuf>,
    /// Taxonomy table configuration.
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,
    /// Dataset registry manifest.
    #[serde(default = "default_datasets_manifest")]
    pub datasets_manifest: PathBuf,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            dataset: String::new(),
            model_name: String::new(),
            model_path: PathBuf::new(),
            base_size: default_base_size(),
            test_h: default_crop(),
            test_w: default_crop(),
            scales: default_scales(),
            split: default_split(),
            test_gpu: default_test_gpu(),
            eval_taxonomy: None,
            ignore_label: default_ignore_label(),
            unmapped_policy: UnmappedPolicy::default(),
            workers: default_workers(),
            print_freq: default_print_freq(),
            prediction_cache: None,
            results_root: None,
            taxonomy: TaxonomyConfig::default(),
            datasets_manifest: default_datasets_manifest(),
        }
    }
}

impl EvalConfig {
    /// Reject configurations no run could succeed with.
    pub fn validate(&self) -> Result<(), EvalError> {
        if self.dataset.trim().is_empty() || self.dataset == "default" {
            return Err(EvalError::config("a dataset must be specified"));
        }
        if self.model_name.trim().is_empty() {
            return Err(EvalError::config("a model name must be specified"));
        }
        if self.model_path.as_os_str().is_empty() {
            return Err(EvalError::config("a model path must be specified"));
        }
        if self.base_size == 0 || self.test_h == 0 || self.test_w == 0 {
            return Err(EvalError::config(
                "base size and crop dimensions must be positive",
            ));
        }
        if self.scales.is_empty() || self.scales.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(EvalError::config(
                "scales must be a non-empty list of positive factors",
            ));
        }
        if self.workers == 0 {
            return Err(EvalError::config("at least one worker is required"));
        }
        if self.split != EVAL_SPLIT {
            return Err(EvalError::config(format!(
                "cannot evaluate the {} split: only the {EVAL_SPLIT} split has ground truth labels",
                self.split
            )));
        }
        Ok(())
    }
}

fn default_base_size() -> u32 {
    360
}

fn default_crop() -> u32 {
    713
}

fn default_scales() -> Vec<f64> {
    vec![1.0]
}

fn default_split() -> String {
    EVAL_SPLIT.to_string()
}

fn default_test_gpu() -> Vec<u32> {
    vec![0]
}

fn default_ignore_label() -> ClassId {
    IGNORE_LABEL
}

fn default_workers() -> usize {
    1
}

fn default_print_freq() -> usize {
    300
}

fn default_datasets_manifest() -> PathBuf {
    PathBuf::from("datasets.toml")
}

/// Location of the taxonomy tables and the dataset roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyConfig {
    /// Tab-separated master mapping table.
    #[serde(default = "default_master_table")]
    pub master_table: PathBuf,
    /// Directory of `<dataset>_names.txt` files.
    #[serde(default = "default_names_dir")]
    pub names_dir: PathBuf,
    /// Datasets the universal model was trained on.
    #[serde(default = "default_train_datasets")]
    pub train_datasets: Vec<String>,
    /// Held-out test datasets.
    #[serde(default = "default_test_datasets")]
    pub test_datasets: Vec<String>,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            master_table: default_master_table(),
            names_dir: default_names_dir(),
            train_datasets: default_train_datasets(),
            test_datasets: default_test_datasets(),
        }
    }
}

fn default_master_table() -> PathBuf {
    PathBuf::from("taxonomy/MSeg_master.tsv")
}

fn default_names_dir() -> PathBuf {
    PathBuf::from("taxonomy/names")
}

fn default_train_datasets() -> Vec<String> {
    DEFAULT_TRAIN_DATASETS.iter().map(|s| s.to_string()).collect()
}

fn default_test_datasets() -> Vec<String> {
    TEST_DATASETS.iter().map(|s| s.to_string()).collect()
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_taxonomy: Option<EvalTaxonomy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unmapped_policy: Option<UnmappedPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction_cache: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_root: Option<PathBuf>,
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "segtax", "segtax")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (command-line values)
/// 2. Environment variables (prefixed with `SEGTAX_`)
/// 3. The given config file
/// 4. User config (`~/.config/segtax/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<EvalConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EvalConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    // SEGTAX_DATASET, SEGTAX_TAXONOMY__MASTER_TABLE, etc.
    figment = figment.merge(Env::prefixed("SEGTAX_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EvalConfig {
        EvalConfig {
            dataset: "camvid-11".into(),
            model_name: "mseg-3m".into(),
            model_path: PathBuf::from("/models/mseg-3m.pth"),
            ..EvalConfig::default()
        }
    }

    #[test]
    fn test_default_eval_config() {
        let config = EvalConfig::default();
        assert_eq!(config.base_size, 360);
        assert_eq!(config.ignore_label, 255);
        assert_eq!(config.unmapped_policy, UnmappedPolicy::Ignore);
        assert_eq!(config.taxonomy.train_datasets.len(), 7);
        assert_eq!(config.taxonomy.test_datasets.len(), 6);
        assert!(config.eval_taxonomy.is_none());
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(EvalConfig::default().validate().is_err());

        let mut bad = valid();
        bad.dataset = "default".into();
        assert!(bad.validate().is_err());

        let mut bad = valid();
        bad.scales = vec![1.0, -0.5];
        assert!(bad.validate().is_err());

        let mut bad = valid();
        bad.workers = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unlabeled_split() {
        let mut config = valid();
        config.split = "test".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EvalError::Config(_)));
        assert!(err.to_string().contains("test split"));
    }

    #[test]
    fn test_load_config_layers() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("camvid.toml");
        std::fs::write(
            &path,
            r#"
dataset = "camvid-11"
model_name = "mseg-3m"
model_path = "/models/mseg-3m.pth"
base_size = 1080
unmapped_policy = "fail"

[taxonomy]
master_table = "tables/master.tsv"
"#,
        )
        .unwrap();

        let overrides = ConfigOverrides {
            base_size: Some(720),
            ..ConfigOverrides::default()
        };
        let config = load_config(Some(&path), Some(&overrides)).unwrap();
        assert_eq!(config.dataset, "camvid-11");
        assert_eq!(config.base_size, 720);
        assert_eq!(config.unmapped_policy, UnmappedPolicy::Fail);
        assert_eq!(
            config.taxonomy.master_table,
            PathBuf::from("tables/master.tsv")
        );
        // untouched nested defaults survive
        assert_eq!(config.taxonomy.names_dir, PathBuf::from("taxonomy/names"));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = valid();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EvalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.dataset, config.dataset);
        assert_eq!(parsed.test_gpu, config.test_gpu);
    }
}
