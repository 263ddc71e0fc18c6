//! Factory registry mapping configured component names to constructors.
//!
//! The job description names components by short type names; this module
//! holds the closed name registries and builds each component from its
//! `parameters` subtree. Unknown names fail fast with a configuration
//! error before any worker is dispatched.

use std::sync::Arc;

use crate::aggregate::{
    AggregateKey, Aggregator, CurveAccumulator, CurveAverageAggregator, Output, ProgressLogger,
};
use crate::config::JobConfig;
use crate::corpus::{ChunkSampler, CorpusParser, CurveClass, FeatureSetBuilder, Tokenizer};
use crate::error::{Result, UnmaskingError};
use crate::event::{topic, EventHandler, SenderKind};
use crate::expand::{ConfigurationExpander, ProductExpander, ZipExpander};
use crate::fakes::{
    FrequencyFeatureSetBuilder, MemoryCorpusParser, MemoryPair, RoundRobinSampler,
    WhitespaceTokenizer,
};
use crate::strategy::{FeatureRemoval, Iterations, StrategySettings, UnmaskingStrategy};

fn unknown(kind: &str, name: &str) -> UnmaskingError {
    UnmaskingError::Config(format!("unknown {} type: {}", kind, name))
}

/// Optional `senders` list in a component's parameters, mapped onto the
/// closed sender enum.
fn sender_filter(params: &JobConfig) -> Result<Option<Vec<SenderKind>>> {
    let raw = match params.get("senders") {
        None => return Ok(None),
        Some(v) => v,
    };
    let list = raw.as_array().ok_or_else(|| {
        UnmaskingError::Config("option 'senders' must be an array of sender names".to_string())
    })?;
    let mut senders = Vec::with_capacity(list.len());
    for entry in list {
        let name = entry.as_str().ok_or_else(|| {
            UnmaskingError::Config("sender names must be strings".to_string())
        })?;
        senders.push(
            SenderKind::from_name(name).ok_or_else(|| unknown("sender", name))?,
        );
    }
    Ok(Some(senders))
}

pub fn build_expander(name: &str) -> Result<Box<dyn ConfigurationExpander>> {
    match name {
        "zip" => Ok(Box::new(ZipExpander)),
        "product" => Ok(Box::new(ProductExpander)),
        other => Err(unknown("expander", other)),
    }
}

pub fn build_tokenizer(name: &str) -> Result<Arc<dyn Tokenizer>> {
    match name {
        "whitespace" => Ok(Arc::new(WhitespaceTokenizer::new())),
        other => Err(unknown("tokenizer", other)),
    }
}

pub fn build_sampler(name: &str) -> Result<Arc<dyn ChunkSampler>> {
    match name {
        "round_robin" => Ok(Arc::new(RoundRobinSampler)),
        other => Err(unknown("sampler", other)),
    }
}

pub fn build_feature_set_builder(
    name: &str,
    tokenizer: Arc<dyn Tokenizer>,
) -> Result<Arc<dyn FeatureSetBuilder>> {
    match name {
        "frequency" => Ok(Arc::new(FrequencyFeatureSetBuilder::new(tokenizer))),
        other => Err(unknown("feature set", other)),
    }
}

pub fn build_strategy(name: &str, params: &JobConfig) -> Result<Arc<dyn UnmaskingStrategy>> {
    match name {
        "feature_removal" => {
            let defaults = StrategySettings::default();
            let iterations = match params.get("iterations") {
                None => defaults.iterations,
                Some(v) if v.as_str() == Some("auto") => Iterations::Auto,
                Some(v) => Iterations::Fixed(v.as_u64().ok_or_else(|| {
                    UnmaskingError::Config(
                        "option 'iterations' must be \"auto\" or an integer".to_string(),
                    )
                })? as usize),
            };
            let settings = StrategySettings {
                iterations,
                vector_size: params.get_u64_or("vector_size", defaults.vector_size as u64)?
                    as usize,
                num_eliminate: params.get_u64_or("num_eliminate", defaults.num_eliminate as u64)?
                    as usize,
                folds: params.get_u64_or("folds", defaults.folds as u64)? as usize,
                relative: params.get_bool_or("relative", defaults.relative)?,
                buffer_curves: params.get_bool_or("buffer_curves", defaults.buffer_curves)?,
                monotonize: params.get_bool_or("monotonize", defaults.monotonize)?,
            };
            Ok(Arc::new(FeatureRemoval::new(settings)))
        }
        other => Err(unknown("strategy", other)),
    }
}

pub fn build_parser(
    name: &str,
    params: &JobConfig,
    tokenizer: Arc<dyn Tokenizer>,
) -> Result<Arc<dyn CorpusParser>> {
    match name {
        "memory" => {
            let chunk_size = params.get_u64_or("chunk_size", 500)? as usize;
            let raw_pairs = params.require("pairs")?.as_array().ok_or_else(|| {
                UnmaskingError::Config("option 'pairs' must be an array".to_string())
            })?;
            let mut pairs = Vec::with_capacity(raw_pairs.len());
            for entry in raw_pairs {
                let pair = JobConfig::from_value(entry.clone());
                let class_name = pair.get_str_or("class", "unspecified")?;
                let cls = CurveClass::from_name(class_name)
                    .ok_or_else(|| unknown("curve class", class_name))?;
                pairs.push(MemoryPair {
                    name_a: pair.get_str("name_a")?.to_string(),
                    text_a: pair.get_str("text_a")?.to_string(),
                    name_b: pair.get_str("name_b")?.to_string(),
                    text_b: pair.get_str("text_b")?.to_string(),
                    cls,
                });
            }
            Ok(Arc::new(MemoryCorpusParser::new(pairs, chunk_size, tokenizer)))
        }
        other => Err(unknown("corpus parser", other)),
    }
}

/// An output wired for bus subscription: the same instance viewed as an
/// output and as an event handler, plus the event names it listens on.
pub struct BuiltOutput {
    pub output: Arc<dyn Output>,
    pub handler: Arc<dyn EventHandler>,
    pub subscriptions: Vec<(&'static str, Option<Vec<SenderKind>>)>,
}

impl std::fmt::Debug for BuiltOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltOutput")
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

/// Like [`BuiltOutput`] for aggregators.
pub struct BuiltAggregator {
    pub aggregator: Arc<dyn Aggregator>,
    pub handler: Arc<dyn EventHandler>,
    pub subscriptions: Vec<(&'static str, Option<Vec<SenderKind>>)>,
}

pub fn build_output(name: &str, params: &JobConfig) -> Result<BuiltOutput> {
    let senders = sender_filter(params)?;
    match name {
        "unmasking_curves" => {
            let accumulator = Arc::new(CurveAccumulator::new());
            Ok(BuiltOutput {
                output: accumulator.clone(),
                handler: accumulator,
                subscriptions: vec![(topic::CURVE_FINISHED, senders)],
            })
        }
        "progress" => {
            let logger = Arc::new(ProgressLogger::new());
            Ok(BuiltOutput {
                output: logger.clone(),
                handler: logger,
                subscriptions: vec![(topic::PROGRESS, senders)],
            })
        }
        other => Err(unknown("output", other)),
    }
}

pub fn build_aggregator(name: &str, params: &JobConfig) -> Result<BuiltAggregator> {
    let senders = sender_filter(params)?;
    match name {
        "curve_average" => {
            let key = AggregateKey::from_name(params.get_str_or("key", "identifier")?)?;
            let aggregator = Arc::new(CurveAverageAggregator::new(key));
            Ok(BuiltAggregator {
                aggregator: aggregator.clone(),
                handler: aggregator,
                subscriptions: vec![
                    (topic::PAIR_BUILT, senders.clone()),
                    (topic::CURVE_FINISHED, senders),
                ],
            })
        }
        other => Err(unknown("aggregator", other)),
    }
}
