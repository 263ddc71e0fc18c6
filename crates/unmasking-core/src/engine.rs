//! Job engine: expands a job description into concrete configuration
//! variants and executes each across a bounded blocking-thread pool.
//!
//! The engine owns the event bus and the cooperative cancellation flag.
//! One pool task handles one (pair, feature kind) combination: it builds
//! the feature set and runs the unmasking strategy, publishing through a
//! bridge handle so every event surfaces on the controller.

use chrono::Local;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::aggregate::{Aggregator, Output};
use crate::cache::clear_caches;
use crate::config::JobConfig;
use crate::corpus::{ChunkSampler, CorpusParser, FeatureSetBuilder};
use crate::error::{Result, UnmaskingError};
use crate::event::{
    generate_group_id, topic, CancelFlag, Event, EventBus, EventMeta, PairBuiltEvent,
    ProgressEvent, RunFinishedEvent, SenderKind,
};
use crate::registry::{
    build_aggregator, build_expander, build_feature_set_builder, build_output, build_parser,
    build_sampler, build_strategy, build_tokenizer, BuiltAggregator, BuiltOutput,
};
use crate::results::UnmaskingResult;
use crate::strategy::UnmaskingStrategy;

/// Reference to a configured component: its registry name plus the
/// `parameters` subtree passed to the constructor.
struct ComponentRef {
    name: String,
    params: JobConfig,
}

impl ComponentRef {
    fn parse(value: &serde_json::Value) -> Result<Self> {
        let wrapper = JobConfig::from_value(value.clone());
        let name = wrapper.get_str("name")?.to_string();
        let params = wrapper
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        Ok(Self {
            name,
            params: JobConfig::from_value(params),
        })
    }

    fn list(config: &JobConfig, path: &str, default_names: &[&str]) -> Result<Vec<Self>> {
        match config.get(path) {
            None => default_names
                .iter()
                .map(|n| ComponentRef::parse(&serde_json::json!({ "name": n })))
                .collect(),
            Some(raw) => {
                let list = raw.as_array().ok_or_else(|| {
                    UnmaskingError::Config(format!("option '{}' must be an array", path))
                })?;
                list.iter().map(ComponentRef::parse).collect()
            }
        }
    }

    fn single(config: &JobConfig, path: &str, default_name: &str) -> Result<Self> {
        match config.get(path) {
            None => ComponentRef::parse(&serde_json::json!({ "name": default_name })),
            Some(raw) => ComponentRef::parse(raw),
        }
    }
}

/// Collaborators materialized for one configuration variant.
struct VariantComponents {
    parser: Arc<dyn CorpusParser>,
    sampler: Arc<dyn ChunkSampler>,
    strategy: Arc<dyn UnmaskingStrategy>,
    feature_builders: Vec<Arc<dyn FeatureSetBuilder>>,
}

impl VariantComponents {
    fn from_config(config: &JobConfig) -> Result<Self> {
        let tokenizer_ref = ComponentRef::single(config, "job.input.tokenizer", "whitespace")?;
        let tokenizer = build_tokenizer(&tokenizer_ref.name)?;

        let parser_ref = ComponentRef::single(config, "job.input.parser", "memory")?;
        let parser = build_parser(&parser_ref.name, &parser_ref.params, Arc::clone(&tokenizer))?;

        let sampler_ref = ComponentRef::single(config, "job.input.sampler", "round_robin")?;
        let sampler = build_sampler(&sampler_ref.name)?;

        let strategy_ref = ComponentRef::single(config, "job.strategy", "feature_removal")?;
        let strategy = build_strategy(&strategy_ref.name, &strategy_ref.params)?;

        let feature_refs = ComponentRef::list(config, "job.features", &["frequency"])?;
        let feature_builders = feature_refs
            .iter()
            .map(|r| build_feature_set_builder(&r.name, Arc::clone(&tokenizer)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            parser,
            sampler,
            strategy,
            feature_builders,
        })
    }
}

/// Executes unmasking jobs.
pub struct JobEngine {
    bus: Arc<EventBus>,
    cancel: CancelFlag,
    pool_size: usize,
}

impl JobEngine {
    /// Engine with one pool slot per logical CPU.
    pub fn new() -> Self {
        Self::with_pool_size(num_cpus::get())
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            bus: Arc::new(EventBus::new()),
            cancel: CancelFlag::new(),
            pool_size: pool_size.max(1),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Shared cancellation flag; setting it stops the job cooperatively.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run a job end to end. Returns the created job output directory.
    pub async fn run(&self, config: &JobConfig, output_dir: &Path) -> Result<PathBuf> {
        let started = Instant::now();
        let result = self.run_inner(config, output_dir).await;
        match &result {
            Ok(dir) => info!(
                elapsed_secs = started.elapsed().as_secs_f64(),
                output_dir = %dir.display(),
                "job finished"
            ),
            Err(err) => info!(
                elapsed_secs = started.elapsed().as_secs_f64(),
                error = %err,
                "job aborted"
            ),
        }
        result
    }

    async fn run_inner(&self, config: &JobConfig, output_dir: &Path) -> Result<PathBuf> {
        let job_name = config.get_str_or("job.name", "unmasking")?.to_string();
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let job_dir = output_dir.join(format!("{}_{}", job_name, timestamp));
        std::fs::create_dir_all(&job_dir)?;
        config.save(&job_dir.join("job.json"))?;

        // outputs and aggregators live for the whole job and are wired
        // before any work is dispatched, so bad names fail fast
        let outputs = self.wire_outputs(config)?;
        let aggregators = self.wire_aggregators(config)?;
        let aggregator_arcs: Vec<Arc<dyn Aggregator>> = aggregators
            .iter()
            .map(|a| Arc::clone(&a.aggregator))
            .collect();

        let variants = expand_variants(config)?;
        let timestamp = timestamp.to_string();
        let group_id = generate_group_id([job_name.as_str(), timestamp.as_str()]);
        info!(job = %job_name, variants = variants.len(), "starting job");

        for (index, variant) in variants.iter().enumerate() {
            let variant_dir = if variants.len() > 1 {
                let dir = job_dir.join(format!("config_{:05}", index));
                std::fs::create_dir_all(&dir)?;
                variant.save(&dir.join("job.expanded.json"))?;
                dir
            } else {
                job_dir.clone()
            };

            let components = VariantComponents::from_config(variant)?;
            let repetitions = variant.get_u64_or("job.experiment.repetitions", 1)?.max(1);

            for repetition in 0..repetitions {
                debug!(variant = index, repetition, "starting repetition");
                self.run_repetition(&components).await?;
                for output in &outputs {
                    output.output.save(&variant_dir, output.output.name()).await?;
                    output.output.reset();
                }
                // per-repetition memo state must not leak into the next pass
                clear_caches();
            }

            self.bus
                .publish(
                    topic::CONFIGURATION_FINISHED,
                    Event::ConfigurationFinished(RunFinishedEvent {
                        meta: EventMeta::new(group_id.clone(), index as u64),
                        aggregators: aggregator_arcs.clone(),
                    }),
                    SenderKind::JobEngine,
                )
                .await?;
        }

        self.bus
            .publish(
                topic::JOB_FINISHED,
                Event::JobFinished(RunFinishedEvent {
                    meta: EventMeta::new(group_id, variants.len() as u64),
                    aggregators: aggregator_arcs,
                }),
                SenderKind::JobEngine,
            )
            .await?;

        for aggregator in &aggregators {
            aggregator
                .aggregator
                .save(&job_dir, aggregator.aggregator.name())
                .await?;
            aggregator.aggregator.reset();
        }

        self.unwire(&outputs, &aggregators);
        Ok(job_dir)
    }

    /// One full pass over the corpus: stream pairs, fan the work out to
    /// the blocking pool, await everything, surface the first error only
    /// after all tasks finished.
    async fn run_repetition(&self, components: &VariantComponents) -> Result<()> {
        if self.cancel.is_set() {
            return Err(UnmaskingError::Interrupted);
        }

        let scope = self.bus.open_bridge()?;
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut tasks = Vec::new();
        // fresh group per repetition so progress streams never interleave
        let mut progress = ProgressEvent::new(
            EventMeta::new(uuid::Uuid::new_v4().to_string(), 0),
            None,
        );

        let mut first_error: Option<UnmaskingError> = None;
        let mut iter = components.parser.iter();
        loop {
            if self.cancel.is_set() {
                first_error = Some(UnmaskingError::Interrupted);
                break;
            }
            let pair = match iter.next_pair().await {
                Err(err) => {
                    first_error = Some(err);
                    break;
                }
                Ok(None) => break,
                Ok(Some(pair)) => pair,
            };

            self.bus
                .publish(
                    topic::PAIR_BUILT,
                    Event::PairBuilt(PairBuiltEvent {
                        meta: progress.meta.clone(),
                        total: None,
                        pair: pair.meta.clone(),
                    }),
                    SenderKind::CorpusParser,
                )
                .await?;
            self.bus
                .publish(
                    topic::PROGRESS,
                    Event::Progress(progress.clone()),
                    SenderKind::JobEngine,
                )
                .await?;
            progress = progress.next();

            for builder in &components.feature_builders {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| UnmaskingError::Task(e.to_string()))?;
                let publisher = self.bus.worker_publisher();
                let cancel = self.cancel.clone();
                let builder = Arc::clone(builder);
                let sampler = Arc::clone(&components.sampler);
                let strategy = Arc::clone(&components.strategy);
                let pair = pair.clone();
                tasks.push(tokio::task::spawn_blocking(move || -> Result<()> {
                    let _permit = permit;
                    let feature_set = builder.build(pair, sampler.as_ref())?;
                    strategy.run(feature_set.as_ref(), &publisher, &cancel)?;
                    Ok(())
                }));
            }
        }

        // all submitted tasks run to completion before any error surfaces
        for joined in join_all(tasks).await {
            let outcome = match joined {
                Err(join_err) => Err(UnmaskingError::Task(join_err.to_string())),
                Ok(outcome) => outcome,
            };
            if let Err(err) = outcome {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        scope.close().await?;
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Rebuild aggregation from previously saved result files. Returns
    /// the paths written, one per configured aggregator.
    pub async fn aggregate(
        &self,
        inputs: &[PathBuf],
        config: &JobConfig,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let aggregators = self.wire_aggregators(config)?;
        // curves are fed from files here, not from bus events
        self.unwire(&[], &aggregators);

        for path in inputs {
            let result = UnmaskingResult::load(path)?;
            for (identifier, record) in &result.curves {
                for aggregator in &aggregators {
                    aggregator.aggregator.add_curve(
                        identifier,
                        record.cls,
                        record.values.clone(),
                    )?;
                    aggregator
                        .aggregator
                        .add_files(identifier, record.cls, &record.files)?;
                }
            }
        }

        let mut written = Vec::new();
        for aggregator in &aggregators {
            if let Some(path) = aggregator
                .aggregator
                .save(output_dir, aggregator.aggregator.name())
                .await?
            {
                written.push(path);
            }
            aggregator.aggregator.reset();
        }
        Ok(written)
    }

    fn wire_outputs(&self, config: &JobConfig) -> Result<Vec<BuiltOutput>> {
        let refs = ComponentRef::list(config, "job.outputs", &["progress", "unmasking_curves"])?;
        let mut outputs = Vec::with_capacity(refs.len());
        for r in &refs {
            let built = build_output(&r.name, &r.params)?;
            for (event_name, senders) in &built.subscriptions {
                self.bus
                    .subscribe(event_name, Arc::clone(&built.handler), senders.as_deref());
            }
            outputs.push(built);
        }
        Ok(outputs)
    }

    fn wire_aggregators(&self, config: &JobConfig) -> Result<Vec<BuiltAggregator>> {
        let refs = ComponentRef::list(config, "job.aggregators", &[])?;
        let mut aggregators = Vec::with_capacity(refs.len());
        for r in &refs {
            let built = build_aggregator(&r.name, &r.params)?;
            for (event_name, senders) in &built.subscriptions {
                self.bus
                    .subscribe(event_name, Arc::clone(&built.handler), senders.as_deref());
            }
            aggregators.push(built);
        }
        Ok(aggregators)
    }

    fn unwire(&self, outputs: &[BuiltOutput], aggregators: &[BuiltAggregator]) {
        for output in outputs {
            for (event_name, senders) in &output.subscriptions {
                self.bus
                    .unsubscribe(event_name, &output.handler, senders.as_deref());
            }
        }
        for aggregator in aggregators {
            for (event_name, senders) in &aggregator.subscriptions {
                self.bus
                    .unsubscribe(event_name, &aggregator.handler, senders.as_deref());
            }
        }
    }
}

impl Default for JobEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand `job.experiment.configurations` into concrete variants; one
/// trivial variant when no expansion is configured.
fn expand_variants(config: &JobConfig) -> Result<Vec<JobConfig>> {
    let configurations = match config.get("job.experiment.configurations") {
        None => return Ok(vec![config.clone()]),
        Some(v) => v.clone(),
    };
    let map = configurations.as_object().ok_or_else(|| {
        UnmaskingError::Config(
            "option 'job.experiment.configurations' must be an object".to_string(),
        )
    })?;

    let mut variables = Vec::with_capacity(map.len());
    let mut vectors = Vec::with_capacity(map.len());
    for (variable, values) in map {
        let values = values.as_array().ok_or_else(|| {
            UnmaskingError::Config(format!(
                "configuration variable '{}' must map to an array",
                variable
            ))
        })?;
        variables.push(variable.clone());
        vectors.push(values.clone());
    }

    let expander_ref = ComponentRef::single(config, "job.experiment.expander", "zip")?;
    let expander = build_expander(&expander_ref.name)?;
    let rows = expander.expand(&vectors);
    Ok(rows
        .iter()
        .map(|values| config.expanded(&variables, values))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variant_expansion_defaults_to_single_variant() {
        let config = JobConfig::from_value(json!({ "job": { "name": "plain" } }));
        let variants = expand_variants(&config).unwrap();
        assert_eq!(variants.len(), 1);
    }

    #[test]
    fn test_zip_expansion_substitutes_each_variant() {
        let config = JobConfig::from_value(json!({
            "job": {
                "strategy": { "name": "feature_removal",
                              "parameters": { "vector_size": "$size" } },
                "experiment": {
                    "configurations": { "size": [16, 32, 64] }
                }
            }
        }));
        let variants = expand_variants(&config).unwrap();
        assert_eq!(variants.len(), 3);
        assert_eq!(
            variants[1].get_u64("job.strategy.parameters.vector_size").unwrap(),
            32
        );
    }

    #[test]
    fn test_product_expansion_multiplies_lengths() {
        let config = JobConfig::from_value(json!({
            "job": {
                "experiment": {
                    "expander": { "name": "product" },
                    "configurations": { "a": [1, 2], "b": [1, 2, 3] }
                }
            }
        }));
        assert_eq!(expand_variants(&config).unwrap().len(), 6);
    }

    #[test]
    fn test_unknown_output_name_fails_before_dispatch() {
        let engine = JobEngine::with_pool_size(1);
        let config = JobConfig::from_value(json!({
            "job": { "outputs": [{ "name": "telepathy" }] }
        }));
        assert!(engine.wire_outputs(&config).is_err());
    }
}
