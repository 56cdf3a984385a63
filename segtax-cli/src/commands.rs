//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::RunArgs;
use crate::TaxonomyAction;
use segtax_core::persistence::read_report;
use segtax_core::report::results_dir;
use segtax_core::taxonomy::DatasetCategory;
use segtax_core::{
    ConfigOverrides, EvalConfig, EvaluationOrchestrator, FileDatasetRegistry, LabelCacheSource,
    TaxonomyRegistry, TaxonomyResolver,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Evaluate(args) => handle_evaluate(&args, config_path),
        Commands::Resolve(args) => handle_resolve(&args, config_path),
        Commands::Taxonomy { action } => handle_taxonomy(action, config_path),
        Commands::Show { path, json } => handle_show(&path, json),
        Commands::Config { action } => handle_config(action, config_path),
    }
}

fn load(config_path: Option<&Path>, overrides: Option<&ConfigOverrides>) -> anyhow::Result<EvalConfig> {
    segtax_core::load_config(config_path, overrides)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn load_registry(config: &EvalConfig) -> anyhow::Result<TaxonomyRegistry> {
    let taxonomy = &config.taxonomy;
    Ok(TaxonomyRegistry::load(
        &taxonomy.master_table,
        &taxonomy.names_dir,
        &taxonomy.train_datasets,
        &taxonomy.test_datasets,
    )?)
}

fn handle_evaluate(args: &RunArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(config_path, Some(&args.overrides()))?;
    let registry = Arc::new(load_registry(&config)?);
    let datasets =
        FileDatasetRegistry::load(&config.datasets_manifest, &config.taxonomy.names_dir)?;

    let orchestrator = EvaluationOrchestrator::new(&config, &registry, &datasets);
    let context = orchestrator.resolve()?;
    let cache = orchestrator.prediction_cache(&context);
    let policy = config.unmapped_policy;
    tracing::info!("Scoring cached labels from {}", cache.display());

    let outcome = if config.workers > 1 {
        orchestrator.run_sharded_resolved(&context, |_| {
            Ok(LabelCacheSource::new(
                cache.clone(),
                Arc::clone(&registry),
                policy,
            ))
        })?
    } else {
        let mut source = LabelCacheSource::new(cache, Arc::clone(&registry), policy);
        orchestrator.run_resolved(&context, &mut source)?
    };

    print!("{}", outcome.report.render_table());
    println!("Report written to {}", outcome.report_path.display());
    Ok(())
}

fn handle_resolve(args: &RunArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(config_path, Some(&args.overrides()))?;
    let registry = load_registry(&config)?;
    let context = TaxonomyResolver::new(&registry)
        .with_ignore_label(config.ignore_label)
        .resolve_requested(&config.dataset, &config.model_name, config.eval_taxonomy)?;

    let results = (!config.model_path.as_os_str().is_empty()).then(|| {
        results_dir(
            &config.model_path,
            config.results_root.as_deref(),
            &context,
            config.base_size,
        )
    });
    let output = serde_json::json!({
        "context": context,
        "relabel_required": context.relabel_required(),
        "results_dir": results,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn handle_taxonomy(action: TaxonomyAction, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(config_path, None)?;
    let registry = load_registry(&config)?;
    let resolver = TaxonomyResolver::new(&registry);

    match action {
        TaxonomyAction::List => {
            // The manifest is optional here; taxonomy tables alone are enough to list.
            let manifest = config
                .datasets_manifest
                .exists()
                .then(|| {
                    FileDatasetRegistry::load(&config.datasets_manifest, &config.taxonomy.names_dir)
                })
                .transpose()?;
            print!("{}", render_dataset_list(&registry, manifest.as_ref())?);
            Ok(())
        }
        TaxonomyAction::Show { dataset } => {
            let entry = registry.require(&dataset)?;
            let universal = registry.universal();
            println!("{} ({:?})", dataset, entry.category());
            for id in entry.taxonomy().ids() {
                let name = entry.taxonomy().class_name(id).unwrap_or_default();
                let targets = match entry.to_universal().get(id) {
                    Some(targets) => targets
                        .iter()
                        .map(|t| universal.class_name(*t).unwrap_or("?"))
                        .collect::<Vec<_>>()
                        .join(", "),
                    None => "(unmapped)".to_string(),
                };
                println!("  {id:>4}  {name:<28} -> {targets}");
            }
            if entry.category() == DatasetCategory::Training {
                let excluded: Vec<&str> = resolver
                    .excluded_ids(&dataset)?
                    .into_iter()
                    .filter_map(|id| universal.class_name(id))
                    .collect();
                println!("Excluded universal classes: {}", excluded.join(", "));
            }
            Ok(())
        }
    }
}

/// One line per registered dataset with its role and mapping coverage, plus
/// any manifest entries the taxonomy tables do not know about.
fn render_dataset_list(
    registry: &TaxonomyRegistry,
    manifest: Option<&FileDatasetRegistry>,
) -> anyhow::Result<String> {
    let resolver = TaxonomyResolver::new(registry);
    let in_manifest: BTreeSet<&str> = manifest.map(|m| m.names().collect()).unwrap_or_default();

    let mut out = format!("universal: {} classes\n", registry.universal().num_classes());
    for category in [DatasetCategory::Training, DatasetCategory::Test] {
        for name in registry.datasets_in(category) {
            let dataset = registry.require(name)?;
            let role = match category {
                DatasetCategory::Training => "training",
                DatasetCategory::Test => "test",
            };
            let mut line = format!(
                "  {:<28} {:<9} {:>4} classes, {:>4} mapped",
                name,
                role,
                dataset.taxonomy().num_classes(),
                dataset.to_universal().len(),
            );
            if category == DatasetCategory::Training {
                let excluded = resolver.excluded_ids(name)?.len();
                line.push_str(&format!(", {excluded} universal classes excluded"));
            }
            if manifest.is_some() && !in_manifest.contains(name) {
                line.push_str(" (no manifest entry)");
            }
            out.push_str(&line);
            out.push('\n');
        }
    }

    let orphans: Vec<&str> = in_manifest
        .iter()
        .copied()
        .filter(|name| registry.dataset(name).is_none())
        .collect();
    if !orphans.is_empty() {
        out.push_str(&format!("manifest entries without a taxonomy: {}\n", orphans.join(", ")));
    }
    Ok(out)
}

fn handle_show(path: &Path, json: bool) -> anyhow::Result<()> {
    let report = read_report(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_table());
    }
    Ok(())
}

fn handle_config(action: ConfigAction, config_path: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => {
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let toml_str = toml::to_string_pretty(&EvalConfig::default())?;
            std::fs::write(&path, &toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(config_path, None)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
