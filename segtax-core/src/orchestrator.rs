//! Drives one evaluation run end to end.
//!
//! resolve → (fail on unimplemented branches) → stream label batches →
//! accumulate → report. Nothing is written unless every stage succeeds.

use crate::accuracy::AccuracyAggregator;
use crate::config::EvalConfig;
use crate::context::EvaluationContext;
use crate::dataset::{DataItem, DatasetInfo, DatasetRegistry};
use crate::error::{EvalError, Unimplemented};
use crate::inference::InferenceCollaborator;
use crate::persistence::write_report;
use crate::report::{EvaluationReport, LABEL_CACHE_FILE, RunStats, results_dir};
use crate::resolver::TaxonomyResolver;
use crate::taxonomy::{DatasetCategory, TaxonomyRegistry};
use std::path::PathBuf;

/// A finished run: the report and the file it was written to.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub report: EvaluationReport,
    pub report_path: PathBuf,
}

pub struct EvaluationOrchestrator<'a, D: DatasetRegistry + ?Sized> {
    config: &'a EvalConfig,
    taxonomies: &'a TaxonomyRegistry,
    datasets: &'a D,
}

impl<'a, D: DatasetRegistry + ?Sized> EvaluationOrchestrator<'a, D> {
    pub fn new(config: &'a EvalConfig, taxonomies: &'a TaxonomyRegistry, datasets: &'a D) -> Self {
        Self {
            config,
            taxonomies,
            datasets,
        }
    }

    /// Resolve the evaluation context for the configured dataset and model.
    pub fn resolve(&self) -> Result<EvaluationContext, EvalError> {
        self.config.validate()?;
        TaxonomyResolver::new(self.taxonomies)
            .with_ignore_label(self.config.ignore_label)
            .resolve_requested(
                &self.config.dataset,
                &self.config.model_name,
                self.config.eval_taxonomy,
            )
    }

    /// Results directory for a resolved context.
    pub fn results_dir(&self, context: &EvaluationContext) -> PathBuf {
        results_dir(
            &self.config.model_path,
            self.config.results_root.as_deref(),
            context,
            self.config.base_size,
        )
    }

    /// Cached label maps read by the default collaborator.
    pub fn prediction_cache(&self, context: &EvaluationContext) -> PathBuf {
        self.config
            .prediction_cache
            .clone()
            .unwrap_or_else(|| self.results_dir(context).join(LABEL_CACHE_FILE))
    }

    /// Evaluate with a single collaborator on the calling thread.
    pub fn run<C: InferenceCollaborator + ?Sized>(
        &self,
        collaborator: &mut C,
    ) -> Result<EvaluationOutcome, EvalError> {
        let context = self.resolve()?;
        self.run_resolved(&context, collaborator)
    }

    /// Like [`run`](Self::run) for an already resolved context.
    pub fn run_resolved<C: InferenceCollaborator + ?Sized>(
        &self,
        context: &EvaluationContext,
        collaborator: &mut C,
    ) -> Result<EvaluationOutcome, EvalError> {
        let info = self.prepare(context)?;
        let (aggregator, stats) = self.score(context, &info.items, collaborator, 0)?;
        self.finish(context, &aggregator, stats)
    }

    /// Evaluate with `config.workers` threads. Each worker builds its own
    /// collaborator with `factory(worker_index)` and owns its accumulator;
    /// accumulators are merged only after every worker has finished.
    pub fn run_sharded<C, F>(&self, factory: F) -> Result<EvaluationOutcome, EvalError>
    where
        C: InferenceCollaborator,
        F: Fn(usize) -> Result<C, EvalError> + Sync,
        D: Sync,
    {
        let context = self.resolve()?;
        self.run_sharded_resolved(&context, factory)
    }

    /// Like [`run_sharded`](Self::run_sharded) for an already resolved context.
    pub fn run_sharded_resolved<C, F>(
        &self,
        context: &EvaluationContext,
        factory: F,
    ) -> Result<EvaluationOutcome, EvalError>
    where
        C: InferenceCollaborator,
        F: Fn(usize) -> Result<C, EvalError> + Sync,
        D: Sync,
    {
        let info = self.prepare(context)?;

        let workers = self.config.workers.clamp(1, info.items.len().max(1));
        if workers == 1 {
            let mut collaborator = factory(0)?;
            let (aggregator, stats) = self.score(context, &info.items, &mut collaborator, 0)?;
            return self.finish(context, &aggregator, stats);
        }

        let chunk = info.items.len().div_ceil(workers);
        tracing::info!(workers, chunk, "Evaluating in parallel");

        let results: Vec<Result<(AccuracyAggregator, RunStats), EvalError>> =
            std::thread::scope(|s| {
                let handles: Vec<_> = info
                    .items
                    .chunks(chunk)
                    .enumerate()
                    .map(|(worker, items)| {
                        let factory = &factory;
                        s.spawn(move || {
                            let mut collaborator = factory(worker)?;
                            self.score(context, items, &mut collaborator, worker)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .enumerate()
                    .map(|(worker, handle)| {
                        handle.join().unwrap_or_else(|_| {
                            Err(EvalError::inference(format!("worker {worker} panicked")))
                        })
                    })
                    .collect()
            });

        let mut merged = AccuracyAggregator::for_context(context)?;
        let mut stats = RunStats::default();
        for result in results {
            let (aggregator, worker_stats) = result?;
            merged.merge(&aggregator)?;
            stats.merge(worker_stats);
        }
        self.finish(context, &merged, stats)
    }

    /// Reject unimplemented branches and load the split before any inference.
    fn prepare(&self, context: &EvaluationContext) -> Result<DatasetInfo, EvalError> {
        if context.relabel_required() {
            return Err(EvalError::NotImplemented(Unimplemented::RelabeledGroundTruth));
        }

        let info = self.datasets.dataset(&context.dataset)?;
        let native = self.taxonomies.require(&context.dataset)?.taxonomy();
        if info.class_names != native.class_names() {
            return Err(EvalError::invalid_taxonomy(format!(
                "dataset registry lists {} classes for {} but the taxonomy table has {}",
                info.class_names.len(),
                context.dataset,
                native.num_classes()
            )));
        }
        if context.category == DatasetCategory::Test && info.class_names != context.class_names {
            return Err(EvalError::invalid_taxonomy(format!(
                "evaluation classes of {} do not match its native taxonomy",
                context.dataset
            )));
        }

        tracing::info!(
            dataset = %info.name,
            items = info.items.len(),
            root = %info.data_root.display(),
            "Loaded evaluation split"
        );
        Ok(info)
    }

    /// Consume the collaborator's stream once, in order.
    fn score<C: InferenceCollaborator + ?Sized>(
        &self,
        context: &EvaluationContext,
        items: &[DataItem],
        collaborator: &mut C,
        worker: usize,
    ) -> Result<(AccuracyAggregator, RunStats), EvalError> {
        let mut aggregator = AccuracyAggregator::for_context(context)?;
        let mut stats = RunStats::default();
        let print_freq = self.config.print_freq.max(1);

        for batch in collaborator.label_batches(context, items)? {
            let batch = batch?;
            aggregator.accumulate_batch(&batch.predicted, &batch.target)?;
            stats.images += 1;
            stats.dropped_units += batch.dropped as u64;

            if stats.images % print_freq == 0 {
                tracing::info!(
                    worker,
                    "Evaluated {}/{} images",
                    stats.images,
                    items.len()
                );
            }
        }

        if stats.dropped_units > 0 {
            tracing::warn!(
                worker,
                dropped = stats.dropped_units,
                "Units without a label mapping were left unscored"
            );
        }
        Ok((aggregator, stats))
    }

    fn finish(
        &self,
        context: &EvaluationContext,
        aggregator: &AccuracyAggregator,
        stats: RunStats,
    ) -> Result<EvaluationOutcome, EvalError> {
        let report = EvaluationReport::build(context, aggregator, self.config.base_size, stats);
        report.log_summary();
        let report_path = write_report(&self.results_dir(context), &report)?;
        Ok(EvaluationOutcome {
            report,
            report_path,
        })
    }
}
