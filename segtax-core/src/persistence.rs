//! Report persistence: atomic JSON writes and loads.
//!
//! A report is written to a `.tmp` sibling and renamed into place, so a
//! results directory holds either a complete report or none at all.

use crate::error::EvalError;
use crate::report::{EvaluationReport, REPORT_FILE};
use std::io;
use std::path::{Path, PathBuf};

/// Atomically write JSON data to a file, creating parent directories.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file; `Ok(None)` if it does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Write `report` as `report.json` inside `dir` and return the file path.
pub fn write_report(dir: &Path, report: &EvaluationReport) -> Result<PathBuf, EvalError> {
    let path = dir.join(REPORT_FILE);
    atomic_write_json(&path, report)?;
    tracing::info!(run_id = %report.run_id, "Wrote evaluation report to {}", path.display());
    Ok(path)
}

/// Read a report written by [`write_report`]. Accepts the report file itself
/// or the results directory containing it.
pub fn read_report(path: &Path) -> Result<EvaluationReport, EvalError> {
    let file = if path.is_dir() {
        path.join(REPORT_FILE)
    } else {
        path.to_path_buf()
    };
    load_json(&file)?.ok_or_else(|| {
        EvalError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no report at {}", file.display()),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accuracy::AccuracyAggregator;
    use crate::context::{EvalTaxonomy, EvaluationContext, GroundTruth, ModelFamily};
    use crate::report::RunStats;
    use crate::taxonomy::DatasetCategory;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn report() -> EvaluationReport {
        let ctx = EvaluationContext {
            dataset: "voc2012".into(),
            model_name: "mseg-3m".into(),
            model_family: ModelFamily::Unified { relabeled: true },
            category: DatasetCategory::Test,
            eval_taxonomy: EvalTaxonomy::TestDataset,
            ground_truth: GroundTruth::Original,
            excluded_ids: BTreeSet::new(),
            class_names: vec!["background".into(), "person".into()],
            ignore_label: 255,
        };
        let mut agg = AccuracyAggregator::for_context(&ctx).unwrap();
        agg.accumulate_batch(&[0, 1, 1], &[0, 1, 0]).unwrap();
        EvaluationReport::build(&ctx, &agg, 360, RunStats::default())
    }

    #[test]
    fn test_write_and_read_report() {
        let dir = TempDir::new().unwrap();
        let results = dir.path().join("mseg-3m").join("voc2012").join("360");
        let report = report();

        let path = write_report(&results, &report).unwrap();
        assert_eq!(path, results.join(REPORT_FILE));
        assert!(!path.with_extension("tmp").exists());

        let loaded = read_report(&results).unwrap();
        assert_eq!(loaded.run_id, report.run_id);
        assert_eq!(loaded.confusion, vec![vec![1, 1], vec![0, 1]]);
        assert_eq!(loaded.classes.len(), 2);
        assert_eq!(read_report(&path).unwrap().run_id, report.run_id);
    }

    #[test]
    fn test_read_missing_report() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            read_report(&dir.path().join("absent.json")),
            Err(EvalError::Io(_))
        ));
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<EvaluationReport>> =
            load_json(Path::new("/nonexistent/report.json"));
        assert!(result.unwrap().is_none());
    }
}
