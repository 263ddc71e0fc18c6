//! Run outputs and curve aggregation.
//!
//! Outputs subscribe to bus events, accumulate state behind interior
//! mutability and persist themselves on demand. Aggregators are outputs
//! that additionally fold many curves into summary curves.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::corpus::CurveClass;
use crate::error::{Result, UnmaskingError};
use crate::event::{Event, EventHandler, SenderKind};
use crate::results::{CurveRecord, UnmaskingResult};

/// A run artifact that accumulates over bus events and can be written
/// out and cleared between configurations.
#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persist current state under `dir`; returns the written path, or
    /// `None` when there is nothing to write.
    async fn save(&self, dir: &Path, basename: &str) -> Result<Option<PathBuf>>;

    /// Discard accumulated state.
    fn reset(&self);
}

/// An output that folds curves into aggregate curves.
pub trait Aggregator: Output {
    /// Feed one finished curve into its bucket. Fails when the bucket
    /// already holds curves of a different class.
    fn add_curve(&self, identifier: &str, cls: CurveClass, values: Vec<f64>) -> Result<()>;

    /// Record which input files contributed to a bucket, subject to the
    /// same class check as `add_curve`.
    fn add_files(&self, identifier: &str, cls: CurveClass, files: &[String]) -> Result<()>;

    /// Current aggregate curve per bucket.
    fn aggregated_curves(&self) -> BTreeMap<String, CurveRecord>;

    /// Aggregated curves packaged as a persistable result.
    fn aggregated_output(&self) -> UnmaskingResult;
}

/// What curves are bucketed by during aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKey {
    /// One bucket per curve identifier (across repetitions).
    Identifier,
    /// One bucket per curve class.
    Class,
}

impl AggregateKey {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateKey::Identifier => "identifier",
            AggregateKey::Class => "class",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "identifier" => Ok(AggregateKey::Identifier),
            "class" => Ok(AggregateKey::Class),
            other => Err(UnmaskingError::Config(format!(
                "unknown aggregate key: {}",
                other
            ))),
        }
    }
}

/// Collects every finished curve verbatim, one record per pair.
#[derive(Default)]
pub struct CurveAccumulator {
    result: Mutex<UnmaskingResult>,
}

impl CurveAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> UnmaskingResult {
        self.result.lock().unwrap().clone()
    }
}

#[async_trait]
impl Output for CurveAccumulator {
    fn name(&self) -> &'static str {
        "unmasking_curves"
    }

    async fn save(&self, dir: &Path, basename: &str) -> Result<Option<PathBuf>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Ok(None);
        }
        snapshot.save(dir, basename).map(Some)
    }

    fn reset(&self) {
        *self.result.lock().unwrap() = UnmaskingResult::default();
    }
}

#[async_trait]
impl EventHandler for CurveAccumulator {
    async fn handle(&self, _name: &str, event: &Event, _sender: SenderKind) -> Result<()> {
        if let Event::Curve(curve) = event {
            let mut files = curve.pair.files_a.clone();
            files.extend(curve.pair.files_b.iter().cloned());
            self.result.lock().unwrap().add_curve(
                curve.pair.pair_id.clone(),
                CurveRecord {
                    cls: curve.cls(),
                    values: curve.values.clone(),
                    files,
                },
            );
        }
        Ok(())
    }
}

struct Bucket {
    cls: CurveClass,
    curves: Vec<Vec<f64>>,
    files: BTreeSet<String>,
}

/// Point-wise average of curves, bucketed by identifier or class.
///
/// Ragged input is tolerated: each point of the aggregate averages the
/// curves that reach that round.
pub struct CurveAverageAggregator {
    key: AggregateKey,
    buckets: Mutex<BTreeMap<String, Bucket>>,
}

impl CurveAverageAggregator {
    pub fn new(key: AggregateKey) -> Self {
        Self {
            key,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn key(&self) -> AggregateKey {
        self.key
    }

    fn with_bucket<F>(&self, identifier: &str, cls: CurveClass, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Bucket),
    {
        let bucket_id = match self.key {
            AggregateKey::Identifier => identifier.to_string(),
            AggregateKey::Class => cls.as_str().to_string(),
        };
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(bucket_id.clone()).or_insert_with(|| Bucket {
            cls,
            curves: Vec::new(),
            files: BTreeSet::new(),
        });
        if bucket.cls != cls {
            return Err(UnmaskingError::Aggregation(format!(
                "bucket {} mixes classes {} and {}",
                bucket_id, bucket.cls, cls
            )));
        }
        apply(bucket);
        Ok(())
    }

    fn average(curves: &[Vec<f64>]) -> Vec<f64> {
        let len = curves.iter().map(Vec::len).max().unwrap_or(0);
        (0..len)
            .map(|i| {
                let points: Vec<f64> = curves.iter().filter_map(|c| c.get(i).copied()).collect();
                points.iter().sum::<f64>() / points.len() as f64
            })
            .collect()
    }
}

#[async_trait]
impl Output for CurveAverageAggregator {
    fn name(&self) -> &'static str {
        "curve_average"
    }

    async fn save(&self, dir: &Path, basename: &str) -> Result<Option<PathBuf>> {
        let result = self.aggregated_output();
        if result.is_empty() {
            return Ok(None);
        }
        result.save(dir, basename).map(Some)
    }

    fn reset(&self) {
        self.buckets.lock().unwrap().clear();
    }
}

impl Aggregator for CurveAverageAggregator {
    fn add_curve(&self, identifier: &str, cls: CurveClass, values: Vec<f64>) -> Result<()> {
        self.with_bucket(identifier, cls, |bucket| bucket.curves.push(values))
    }

    fn add_files(&self, identifier: &str, cls: CurveClass, files: &[String]) -> Result<()> {
        self.with_bucket(identifier, cls, |bucket| {
            bucket.files.extend(files.iter().cloned())
        })
    }

    fn aggregated_curves(&self) -> BTreeMap<String, CurveRecord> {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .iter()
            .map(|(id, bucket)| {
                (
                    id.clone(),
                    CurveRecord {
                        cls: bucket.cls,
                        values: Self::average(&bucket.curves),
                        files: bucket.files.iter().cloned().collect(),
                    },
                )
            })
            .collect()
    }

    fn aggregated_output(&self) -> UnmaskingResult {
        let mut result = UnmaskingResult::new(Some(self.key.as_str().to_string()));
        for (id, record) in self.aggregated_curves() {
            result.add_curve(id, record);
        }
        result
    }
}

#[async_trait]
impl EventHandler for CurveAverageAggregator {
    async fn handle(&self, _name: &str, event: &Event, _sender: SenderKind) -> Result<()> {
        match event {
            Event::Curve(curve) => {
                self.add_curve(&curve.pair.pair_id, curve.cls(), curve.values.clone())?;
            }
            Event::PairBuilt(built) => {
                let mut files = built.pair.files_a.clone();
                files.extend(built.pair.files_b.iter().cloned());
                self.add_files(&built.pair.pair_id, built.pair.cls, &files)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Logs progress events; carries no persistent state.
#[derive(Default)]
pub struct ProgressLogger;

impl ProgressLogger {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Output for ProgressLogger {
    fn name(&self) -> &'static str {
        "progress"
    }

    async fn save(&self, _dir: &Path, _basename: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn reset(&self) {}
}

#[async_trait]
impl EventHandler for ProgressLogger {
    async fn handle(&self, name: &str, event: &Event, sender: SenderKind) -> Result<()> {
        if let Event::Progress(progress) = event {
            match progress.percent_done() {
                Some(percent) => info!(
                    event_name = name,
                    sender = %sender,
                    serial = progress.meta.serial,
                    "{:.1}% done",
                    percent
                ),
                None => info!(
                    event_name = name,
                    sender = %sender,
                    serial = progress.meta.serial,
                    "progress"
                ),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::PairMeta;
    use crate::event::{topic, CurveEvent, EventMeta};

    #[test]
    fn test_class_bucketing_merges_across_pairs() {
        let agg = CurveAverageAggregator::new(AggregateKey::Class);
        agg.add_curve("p1", CurveClass::SameAuthor, vec![1.0, 0.5]).unwrap();
        agg.add_curve("p2", CurveClass::SameAuthor, vec![0.0, 0.5]).unwrap();
        agg.add_curve("p3", CurveClass::DifferentAuthors, vec![0.8]).unwrap();

        let curves = agg.aggregated_curves();
        assert_eq!(curves.len(), 2);
        assert_eq!(curves["same_author"].values, vec![0.5, 0.5]);
        assert_eq!(curves["different_authors"].values, vec![0.8]);
    }

    #[test]
    fn test_class_bucket_collects_contributing_files() {
        let agg = CurveAverageAggregator::new(AggregateKey::Class);
        agg.add_files("p1", CurveClass::SameAuthor, &["x1.txt".into(), "shared.txt".into()])
            .unwrap();
        agg.add_files("p2", CurveClass::SameAuthor, &["x2.txt".into(), "shared.txt".into()])
            .unwrap();
        agg.add_curve("p1", CurveClass::SameAuthor, vec![1.0]).unwrap();
        agg.add_curve("p2", CurveClass::SameAuthor, vec![0.0]).unwrap();

        let curves = agg.aggregated_curves();
        assert_eq!(
            curves["same_author"].files,
            vec!["shared.txt", "x1.txt", "x2.txt"]
        );
    }

    #[test]
    fn test_identifier_bucket_rejects_class_mismatch() {
        let agg = CurveAverageAggregator::new(AggregateKey::Identifier);
        agg.add_curve("p1", CurveClass::SameAuthor, vec![1.0]).unwrap();
        let err = agg
            .add_curve("p1", CurveClass::DifferentAuthors, vec![1.0])
            .unwrap_err();
        assert!(matches!(err, UnmaskingError::Aggregation(_)));
    }

    #[test]
    fn test_ragged_curves_average_over_available_points() {
        let agg = CurveAverageAggregator::new(AggregateKey::Identifier);
        agg.add_curve("p1", CurveClass::SameAuthor, vec![1.0, 0.4, 0.2]).unwrap();
        agg.add_curve("p1", CurveClass::SameAuthor, vec![0.0, 0.6]).unwrap();

        let curves = agg.aggregated_curves();
        assert_eq!(curves["p1"].values, vec![0.5, 0.5, 0.2]);
    }

    #[test]
    fn test_reset_clears_buckets() {
        let agg = CurveAverageAggregator::new(AggregateKey::Class);
        agg.add_curve("p1", CurveClass::SameAuthor, vec![1.0]).unwrap();
        agg.reset();
        assert!(agg.aggregated_curves().is_empty());
    }

    #[tokio::test]
    async fn test_accumulator_records_curve_events() {
        let accumulator = CurveAccumulator::new();
        let pair = PairMeta {
            pair_id: "p1".to_string(),
            cls: CurveClass::DifferentAuthors,
            files_a: vec!["a.txt".to_string()],
            files_b: vec!["b.txt".to_string()],
        };
        let curve = CurveEvent::new(EventMeta::new("g", 0), 5, pair, "frequency")
            .with_values(vec![0.9, 0.3]);

        accumulator
            .handle(topic::CURVE_FINISHED, &Event::Curve(curve), SenderKind::Strategy)
            .await
            .unwrap();

        let snapshot = accumulator.snapshot();
        assert_eq!(snapshot.curves["p1"].values, vec![0.9, 0.3]);
        assert_eq!(
            snapshot.curves["p1"].files,
            vec!["a.txt".to_string(), "b.txt".to_string()]
        );
        assert_eq!(snapshot.meta.classes, vec!["different_authors"]);
    }
}
