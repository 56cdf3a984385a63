//! End-to-end evaluation runs over the fixture taxonomy tables.

use pretty_assertions::assert_eq;
use segtax_core::inference::CachedLabels;
use segtax_core::persistence::read_report;
use segtax_core::report::ClassStatus;
use segtax_core::taxonomy::DatasetCategory;
use segtax_core::{
    EvalConfig, EvalError, EvalTaxonomy, EvaluationOrchestrator, FileDatasetRegistry,
    LabelCacheSource, TaxonomyRegistry, TaxonomyResolver, Unimplemented, UnmappedPolicy,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn registry() -> Arc<TaxonomyRegistry> {
    Arc::new(
        TaxonomyRegistry::load(
            &fixtures().join("master.tsv"),
            &fixtures().join("names"),
            &["city-relabeled".to_string()],
            &["street".to_string()],
        )
        .unwrap(),
    )
}

struct Workspace {
    dir: TempDir,
    datasets: FileDatasetRegistry,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("city_val.txt"),
            "city/c.png city/c_gt.png\ncity/d.png city/d_gt.png\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("street_val.txt"),
            "# street validation split\nstreet/a.png street/a_gt.png\nstreet/b.png street/b_gt.png\n",
        )
        .unwrap();
        let manifest = dir.path().join("datasets.toml");
        std::fs::write(
            &manifest,
            "[datasets.city-relabeled]\n\
             data_root = \"city\"\n\
             val_list = \"city_val.txt\"\n\
             \n\
             [datasets.street]\n\
             data_root = \"street\"\n\
             val_list = \"street_val.txt\"\n",
        )
        .unwrap();
        let datasets = FileDatasetRegistry::load(&manifest, &fixtures().join("names")).unwrap();
        Self { dir, datasets }
    }

    fn cache(&self, records: &[CachedLabels]) -> PathBuf {
        let path = self.dir.path().join("label_cache.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record).unwrap()).unwrap();
        }
        path
    }

    fn config(&self, dataset: &str, model: &str) -> EvalConfig {
        EvalConfig {
            dataset: dataset.into(),
            model_name: model.into(),
            model_path: self.dir.path().join("models").join(format!("{model}.pth")),
            ..EvalConfig::default()
        }
    }
}

fn record(image: &str, predicted: &[u16], target: &[u16]) -> CachedLabels {
    CachedLabels {
        image: image.into(),
        predicted: predicted.to_vec(),
        target: target.to_vec(),
    }
}

fn street_records() -> Vec<CachedLabels> {
    vec![
        // sky has no street class; that pixel is dropped on both sides
        record("street/a.png", &[0, 2, 3, 4, 5, 6], &[0, 1, 1, 2, 0, 3]),
        // sidewalk is dropped, the ignore label passes through
        record("street/b.png", &[0, 1, 2, 255], &[3, 0, 1, 3]),
    ]
}

#[test]
fn test_dataset_is_scored_in_its_own_taxonomy() {
    let ws = Workspace::new();
    let registry = registry();
    let config = ws.config("street", "mseg-3m");
    let mut source = LabelCacheSource::new(
        ws.cache(&street_records()),
        Arc::clone(&registry),
        UnmappedPolicy::Ignore,
    );

    let outcome = EvaluationOrchestrator::new(&config, &registry, &ws.datasets)
        .run(&mut source)
        .unwrap();
    let report = outcome.report;

    assert_eq!(report.eval_taxonomy, EvalTaxonomy::TestDataset);
    assert!(!report.relabeled);
    assert_eq!(report.excluded_ids, Vec::<u16>::new());
    assert_eq!(
        report.confusion,
        vec![
            vec![1, 0, 0, 0],
            vec![0, 3, 0, 0],
            vec![0, 0, 1, 0],
            vec![1, 0, 0, 1],
        ]
    );
    assert_eq!(report.stats.images, 2);
    assert_eq!(report.stats.dropped_units, 2);
    assert_eq!(report.scored_units, 7);
    assert_eq!(report.skipped_units, 3);
    assert_eq!(report.mean_iou, Some(0.75));
    assert_eq!(report.pixel_accuracy, Some(6.0 / 7.0));

    let names: Vec<&str> = report.classes.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["road", "vehicle", "pedestrian", "building"]);
    assert_eq!(report.classes[0].iou, Some(0.5));
    assert_eq!(report.classes[3].accuracy, Some(0.5));

    assert_eq!(
        outcome.report_path,
        ws.dir.path().join("models/mseg-3m/street/360/report.json")
    );
    assert_eq!(read_report(&outcome.report_path).unwrap().confusion, report.confusion);
}

#[test]
fn training_dataset_is_scored_in_universal_taxonomy() {
    let ws = Workspace::new();
    let registry = registry();
    let config = ws.config("city-relabeled", "mseg-3m-unrelabeled");
    let mut source = LabelCacheSource::new(
        ws.cache(&[
            // rider has no universal class
            record(
                "city/c.png",
                &[0, 1, 1, 2, 3, 4, 5, 6],
                &[0, 1, 2, 3, 4, 5, 6, 7],
            ),
            // road predicted as building, which city cannot express
            record("city/d.png", &[6, 2], &[0, 3]),
            record("city/not-in-split.png", &[0], &[0]),
        ]),
        Arc::clone(&registry),
        UnmappedPolicy::Ignore,
    );

    let outcome = EvaluationOrchestrator::new(&config, &registry, &ws.datasets)
        .run(&mut source)
        .unwrap();
    let report = outcome.report;

    assert_eq!(report.eval_taxonomy, EvalTaxonomy::Universal);
    assert_eq!(report.excluded_ids, vec![6]);
    assert_eq!(report.classes.len(), 7);
    assert_eq!(report.classes[6].status, ClassStatus::Excluded);
    assert_eq!(report.classes[6].iou, None);
    assert_eq!(report.stats.dropped_units, 1);
    assert_eq!(report.scored_units, 9);
    assert_eq!(report.skipped_units, 1);
    assert_eq!(report.classes[0].iou, Some(0.5));
    assert_eq!(report.mean_iou, Some(5.5 / 6.0));
    assert_eq!(report.pixel_accuracy, Some(8.0 / 9.0));
    assert!(
        outcome
            .report_path
            .ends_with("mseg-3m-unrelabeled/city-relabeled_universal/360/report.json")
    );
}

#[test]
fn relabeled_model_on_training_dataset_is_not_implemented() {
    let ws = Workspace::new();
    let registry = registry();

    let context = TaxonomyResolver::new(&registry)
        .resolve("city-relabeled", "mseg-3m")
        .unwrap();
    assert!(context.relabel_required());

    let config = ws.config("city-relabeled", "mseg-3m");
    let mut source = LabelCacheSource::new(
        ws.cache(&[]),
        Arc::clone(&registry),
        UnmappedPolicy::Ignore,
    );
    let err = EvaluationOrchestrator::new(&config, &registry, &ws.datasets)
        .run(&mut source)
        .unwrap_err();
    assert!(matches!(
        err,
        EvalError::NotImplemented(Unimplemented::RelabeledGroundTruth)
    ));
    assert!(!ws.dir.path().join("models").exists());
}

#[test]
fn fail_policy_aborts_without_writing_a_report() {
    let ws = Workspace::new();
    let registry = registry();
    let config = EvalConfig {
        unmapped_policy: UnmappedPolicy::Fail,
        ..ws.config("street", "hrnet-w48")
    };
    let mut source = LabelCacheSource::new(
        ws.cache(&street_records()),
        Arc::clone(&registry),
        config.unmapped_policy,
    );

    let err = EvaluationOrchestrator::new(&config, &registry, &ws.datasets)
        .run(&mut source)
        .unwrap_err();
    match err {
        EvalError::UnmappedLabel(inner) => assert_eq!(inner.id(), 5),
        other => panic!("expected an unmapped label, got {other:?}"),
    }
    assert!(!ws.dir.path().join("models").exists());
}

#[test]
fn missing_cached_item_fails_the_run() {
    let ws = Workspace::new();
    let registry = registry();
    let config = ws.config("street", "hrnet-w48");
    let mut source = LabelCacheSource::new(
        ws.cache(&street_records()[..1]),
        Arc::clone(&registry),
        UnmappedPolicy::Ignore,
    );

    let err = EvaluationOrchestrator::new(&config, &registry, &ws.datasets)
        .run(&mut source)
        .unwrap_err();
    assert!(matches!(err, EvalError::Inference(_)));
}

#[test]
fn sharded_run_reads_the_same_cache() {
    let ws = Workspace::new();
    let registry = registry();
    let cache = ws.cache(&street_records());

    let config = ws.config("street", "mseg-3m");
    let sequential = EvaluationOrchestrator::new(&config, &registry, &ws.datasets)
        .run(&mut LabelCacheSource::new(
            cache.clone(),
            Arc::clone(&registry),
            UnmappedPolicy::Ignore,
        ))
        .unwrap();

    let sharded_config = EvalConfig {
        workers: 2,
        ..config.clone()
    };
    let sharded = EvaluationOrchestrator::new(&sharded_config, &registry, &ws.datasets)
        .run_sharded(|_| {
            Ok(LabelCacheSource::new(
                cache.clone(),
                Arc::clone(&registry),
                UnmappedPolicy::Ignore,
            ))
        })
        .unwrap();

    assert_eq!(sharded.report.confusion, sequential.report.confusion);
    assert_eq!(sharded.report.stats, sequential.report.stats);
}

#[test]
fn registry_roles_follow_configuration() {
    let registry = registry();
    assert_eq!(
        registry.datasets_in(DatasetCategory::Training),
        vec!["city-relabeled"]
    );
    assert_eq!(registry.datasets_in(DatasetCategory::Test), vec!["street"]);
    assert!(registry.dataset("unused-column").is_none());

    let err = TaxonomyResolver::new(&registry)
        .resolve("unused-column", "mseg-3m")
        .unwrap_err();
    assert!(matches!(err, EvalError::UnknownDataset(_)));

    let err = TaxonomyResolver::new(&registry)
        .resolve_requested("street", "mseg-3m", Some(EvalTaxonomy::Universal))
        .unwrap_err();
    assert!(matches!(err, EvalError::TaxonomyMismatch(_)));
}
