//! Event payloads published on the experiment event bus.
//!
//! Events are immutable values. Advancing a logical sequence means
//! building a successor via copy-with-override ([`EventMeta::next`]),
//! never mutating an instance that has already been published.

use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use crate::aggregate::Aggregator;
use crate::corpus::{CurveClass, PairMeta};

/// Well-known event names.
pub mod topic {
    /// Generic step progress.
    pub const PROGRESS: &str = "progress";
    /// A chunk pair has been generated by the parser.
    pub const PAIR_BUILT: &str = "pair_built";
    /// One unmasking round finished; carries the curve so far.
    pub const ROUND_FINISHED: &str = "round_finished";
    /// Curve generation for a pair finished; carries the final curve.
    pub const CURVE_FINISHED: &str = "curve_finished";
    /// One expanded configuration finished execution.
    pub const CONFIGURATION_FINISHED: &str = "configuration_finished";
    /// The whole job finished, before aggregators persist their output.
    pub const JOB_FINISHED: &str = "job_finished";
}

/// Component type of an event publisher, used for sender-filtered
/// subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderKind {
    JobEngine,
    Strategy,
    CorpusParser,
    FeatureSet,
    Output,
}

impl SenderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "job_engine" => Some(SenderKind::JobEngine),
            "strategy" => Some(SenderKind::Strategy),
            "corpus_parser" => Some(SenderKind::CorpusParser),
            "feature_set" => Some(SenderKind::FeatureSet),
            "output" => Some(SenderKind::Output),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SenderKind::JobEngine => "job_engine",
            SenderKind::Strategy => "strategy",
            SenderKind::CorpusParser => "corpus_parser",
            SenderKind::FeatureSet => "feature_set",
            SenderKind::Output => "output",
        }
    }
}

impl fmt::Display for SenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group identity and serial number shared by all events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    /// Token identifying the logical event group (e.g. one pair's curve).
    pub group_id: String,
    /// Position within the group's sequence.
    pub serial: u64,
}

impl EventMeta {
    pub fn new(group_id: impl Into<String>, serial: u64) -> Self {
        Self {
            group_id: group_id.into(),
            serial,
        }
    }

    /// Successor meta: same group, serial incremented by one.
    pub fn next(&self) -> Self {
        Self {
            group_id: self.group_id.clone(),
            serial: self.serial + 1,
        }
    }
}

/// Derive a stable group id token from a set of name parts.
pub fn generate_group_id<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update(b"\x1f");
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Progress of an operation with an optionally known number of steps.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub meta: EventMeta,
    /// Total number of steps, if known up front.
    pub total: Option<u64>,
}

impl ProgressEvent {
    pub fn new(meta: EventMeta, total: Option<u64>) -> Self {
        Self { meta, total }
    }

    /// Total progress in percent; `None` while the total is unknown.
    pub fn percent_done(&self) -> Option<f64> {
        self.total
            .map(|t| (self.meta.serial as f64 / t as f64) * 100.0)
    }

    pub fn finished(&self) -> bool {
        matches!(self.total, Some(t) if self.meta.serial >= t)
    }

    pub fn next(&self) -> Self {
        Self {
            meta: self.meta.next(),
            total: self.total,
        }
    }
}

/// A chunk pair has been generated, with its participating input files.
#[derive(Debug, Clone)]
pub struct PairBuiltEvent {
    pub meta: EventMeta,
    pub total: Option<u64>,
    pub pair: PairMeta,
}

/// Training-curve state for one pair during unmasking.
#[derive(Debug, Clone)]
pub struct CurveEvent {
    pub meta: EventMeta,
    /// Expected final number of points (the configured iteration count).
    /// The actual curve may be shorter.
    pub expected_rounds: usize,
    /// Scores recorded so far, one per completed round.
    pub values: Vec<f64>,
    pub pair: PairMeta,
    /// Feature kind used to generate the curve.
    pub feature_kind: &'static str,
}

impl CurveEvent {
    pub fn new(
        meta: EventMeta,
        expected_rounds: usize,
        pair: PairMeta,
        feature_kind: &'static str,
    ) -> Self {
        Self {
            meta,
            expected_rounds,
            values: Vec::new(),
            pair,
            feature_kind,
        }
    }

    /// Copy with the given curve values.
    pub fn with_values(&self, values: Vec<f64>) -> Self {
        Self {
            values,
            ..self.clone()
        }
    }

    /// Successor event: same payload, serial incremented.
    pub fn next(&self) -> Self {
        Self {
            meta: self.meta.next(),
            ..self.clone()
        }
    }

    pub fn cls(&self) -> CurveClass {
        self.pair.cls
    }
}

/// An expanded configuration (or the whole job) finished execution.
/// Carries the live aggregator set so downstream handlers can pull
/// aggregated curves without re-reading persisted output.
#[derive(Clone)]
pub struct RunFinishedEvent {
    pub meta: EventMeta,
    pub aggregators: Vec<Arc<dyn Aggregator>>,
}

impl fmt::Debug for RunFinishedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunFinishedEvent")
            .field("meta", &self.meta)
            .field("aggregators", &self.aggregators.len())
            .finish()
    }
}

/// Every payload that can travel over the bus.
#[derive(Debug, Clone)]
pub enum Event {
    Progress(ProgressEvent),
    PairBuilt(PairBuiltEvent),
    Curve(CurveEvent),
    ConfigurationFinished(RunFinishedEvent),
    JobFinished(RunFinishedEvent),
}

impl Event {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Event::Progress(e) => &e.meta,
            Event::PairBuilt(e) => &e.meta,
            Event::Curve(e) => &e.meta,
            Event::ConfigurationFinished(e) => &e.meta,
            Event::JobFinished(e) => &e.meta,
        }
    }
}
