//! Unmasking strategies: the round loop that turns one feature set into
//! a quality-degradation curve.

use tracing::debug;

use crate::classifier::{
    build_sample_matrix, cross_val_score, curve_score, eliminate_columns, fit_linear, SampleMatrix,
};
use crate::corpus::FeatureSet;
use crate::error::{Result, UnmaskingError};
use crate::event::{generate_group_id, topic, CancelFlag, CurveEvent, Event, EventMeta, SenderKind,
    WorkerPublisher};

/// Deterministic fits fail the same way every retry, so a handful of
/// consecutive degenerate rounds means the curve cannot grow further.
const MAX_DEGENERATE_SKIPS: usize = 3;

/// Number of unmasking rounds to run per pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iterations {
    /// Derive the round count from the feature budget: one round per
    /// full elimination step, `vector_size / num_eliminate`.
    Auto,
    Fixed(usize),
}

impl Iterations {
    pub fn resolve(self, vector_size: usize, num_eliminate: usize) -> usize {
        match self {
            Iterations::Fixed(n) => n,
            Iterations::Auto => (vector_size / num_eliminate.max(1)).max(1),
        }
    }
}

/// Tunables shared by all strategies.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub iterations: Iterations,
    /// Per-text feature vector length requested from the feature set.
    pub vector_size: usize,
    /// Features eliminated per round, split between coefficient signs.
    pub num_eliminate: usize,
    /// Cross-validation fold count.
    pub folds: usize,
    /// Use length-normalized instead of absolute features.
    pub relative: bool,
    /// Publish only the finished curve instead of one event per round.
    pub buffer_curves: bool,
    /// Smooth the finished curve into a monotone one.
    pub monotonize: bool,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            iterations: Iterations::Auto,
            vector_size: 250,
            num_eliminate: 10,
            folds: 10,
            relative: true,
            buffer_curves: true,
            monotonize: false,
        }
    }
}

/// Runs the round loop for one pair on a worker thread.
///
/// Implementations are synchronous by design: the heavy lifting is
/// CPU-bound and executes inside the blocking pool, publishing through
/// the provided bridge handle.
pub trait UnmaskingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce the curve for one feature set. Every published event uses
    /// the same group id so downstream consumers can stitch rounds
    /// together.
    fn run(
        &self,
        feature_set: &dyn FeatureSet,
        publisher: &WorkerPublisher,
        cancel: &CancelFlag,
    ) -> Result<Vec<f64>>;
}

impl std::fmt::Debug for dyn UnmaskingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnmaskingStrategy")
            .field("name", &self.name())
            .finish()
    }
}

/// The classic unmasking strategy: fit, score, eliminate the most
/// discriminating features, repeat.
#[derive(Debug, Clone)]
pub struct FeatureRemoval {
    settings: StrategySettings,
}

impl FeatureRemoval {
    pub fn new(settings: StrategySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    fn sample_matrix(&self, feature_set: &dyn FeatureSet) -> Result<SampleMatrix> {
        let n = self.settings.vector_size;
        let rows = if self.settings.relative {
            feature_set.features_relative(n)
        } else {
            feature_set.features_absolute(n)
        };
        let mut a = Vec::with_capacity(rows.len());
        let mut b = Vec::with_capacity(rows.len());
        for row in &rows {
            if row.len() != 2 * n {
                return Err(UnmaskingError::Classifier(format!(
                    "feature set produced {} values per chunk pair, expected {}",
                    row.len(),
                    2 * n
                )));
            }
            a.push(row[..n].to_vec());
            b.push(row[n..].to_vec());
        }
        build_sample_matrix(&a, &b)
    }
}

impl UnmaskingStrategy for FeatureRemoval {
    fn name(&self) -> &'static str {
        "feature_removal"
    }

    fn run(
        &self,
        feature_set: &dyn FeatureSet,
        publisher: &WorkerPublisher,
        cancel: &CancelFlag,
    ) -> Result<Vec<f64>> {
        let settings = &self.settings;
        let iterations = settings
            .iterations
            .resolve(settings.vector_size, settings.num_eliminate);
        let mut samples = self.sample_matrix(feature_set)?;

        let pair = feature_set.pair().clone();
        let group_id =
            generate_group_id([self.name(), feature_set.kind(), pair.pair_id.as_str()]);
        let mut event = CurveEvent::new(
            EventMeta::new(group_id, 0),
            iterations,
            pair,
            feature_set.kind(),
        );

        let mut values: Vec<f64> = Vec::with_capacity(iterations);
        let mut degenerate_skips = 0usize;
        let mut completed = 0usize;

        while completed < iterations {
            if cancel.is_set() || publisher.terminated() {
                return Err(UnmaskingError::Interrupted);
            }
            if samples.num_features() == 0 {
                break;
            }

            let round = (|| -> Result<(f64, Vec<usize>)> {
                let model = fit_linear(&samples.x, &samples.y)?;
                let scores = cross_val_score(&samples, settings.folds)?;
                let cols = eliminate_columns(&model.weights, settings.num_eliminate);
                Ok((curve_score(&scores), cols))
            })();

            match round {
                // a degenerate fit skips the round without consuming the
                // iteration budget
                Err(UnmaskingError::Classifier(reason)) => {
                    degenerate_skips += 1;
                    debug!(
                        pair_id = %event.pair.pair_id,
                        skips = degenerate_skips,
                        %reason,
                        "skipping degenerate unmasking round"
                    );
                    if degenerate_skips >= MAX_DEGENERATE_SKIPS {
                        break;
                    }
                }
                Err(other) => return Err(other),
                Ok((score, cols)) => {
                    degenerate_skips = 0;
                    values.push(score);
                    completed += 1;
                    if !settings.buffer_curves {
                        publisher.publish(
                            topic::ROUND_FINISHED,
                            Event::Curve(event.with_values(values.clone())),
                            SenderKind::Strategy,
                        );
                        event = event.next();
                    }
                    // the final round's matrix is discarded unchanged
                    if completed < iterations {
                        samples = samples.without_columns(&cols);
                    }
                }
            }
        }

        let final_values = if settings.monotonize {
            monotonize_curve(&values)
        } else {
            values
        };
        publisher.publish(
            topic::CURVE_FINISHED,
            Event::Curve(event.with_values(final_values.clone())),
            SenderKind::Strategy,
        );
        Ok(final_values)
    }
}

/// Smooth a curve into a non-increasing one.
///
/// Two non-increasing candidates are built: a floor pass from the left
/// (each point capped by its predecessor) and a ceiling pass from the
/// right (each point raised to at least its successor). The candidate
/// with the smaller sum of squared deviations from the input wins; ties
/// go to the floor candidate. No output point is ever larger than the
/// point before it.
pub fn monotonize_curve(values: &[f64]) -> Vec<f64> {
    if values.len() < 2 {
        return values.to_vec();
    }

    let mut floor = values.to_vec();
    for i in 1..floor.len() {
        if floor[i] > floor[i - 1] {
            floor[i] = floor[i - 1];
        }
    }

    let mut ceiling = values.to_vec();
    for i in (0..ceiling.len() - 1).rev() {
        if ceiling[i] < ceiling[i + 1] {
            ceiling[i] = ceiling[i + 1];
        }
    }

    let sq_dev = |candidate: &[f64]| -> f64 {
        candidate
            .iter()
            .zip(values)
            .map(|(c, v)| (c - v) * (c - v))
            .sum()
    };

    if sq_dev(&floor) <= sq_dev(&ceiling) {
        floor
    } else {
        ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{CurveClass, PairMeta};
    use crate::event::EventBus;

    struct SyntheticFeatureSet {
        meta: PairMeta,
        rows: Vec<Vec<f64>>,
    }

    impl FeatureSet for SyntheticFeatureSet {
        fn pair(&self) -> &PairMeta {
            &self.meta
        }

        fn kind(&self) -> &'static str {
            "synthetic"
        }

        fn features_absolute(&self, _n: usize) -> Vec<Vec<f64>> {
            self.rows.clone()
        }

        fn features_relative(&self, n: usize) -> Vec<Vec<f64>> {
            self.features_absolute(n)
        }
    }

    fn separable_feature_set(n: usize, pairs: usize) -> SyntheticFeatureSet {
        // text a concentrated on even features, text b on odd ones, so
        // every elimination round strips real signal
        let rows = (0..pairs)
            .map(|p| {
                let mut row = vec![0.0; 2 * n];
                for f in 0..n {
                    let signal = 1.0 + 0.05 * p as f64;
                    if f % 2 == 0 {
                        row[f] = signal;
                    } else {
                        row[n + f] = signal;
                    }
                }
                row
            })
            .collect();
        SyntheticFeatureSet {
            meta: PairMeta {
                pair_id: "synthetic-pair".to_string(),
                cls: CurveClass::SameAuthor,
                files_a: vec!["a.txt".to_string()],
                files_b: vec!["b.txt".to_string()],
            },
            rows,
        }
    }

    #[test]
    fn test_auto_iterations_follow_feature_budget() {
        assert_eq!(Iterations::Auto.resolve(250, 10), 25);
        assert_eq!(Iterations::Auto.resolve(5, 10), 1);
        assert_eq!(Iterations::Fixed(7).resolve(250, 10), 7);
    }

    #[tokio::test]
    async fn test_feature_removal_produces_bounded_curve() {
        let bus = EventBus::new();
        let publisher = bus.worker_publisher();
        let strategy = FeatureRemoval::new(StrategySettings {
            iterations: Iterations::Fixed(4),
            vector_size: 8,
            num_eliminate: 2,
            folds: 3,
            relative: false,
            buffer_curves: true,
            monotonize: false,
        });
        let fs = separable_feature_set(8, 6);

        let curve = strategy
            .run(&fs, &publisher, &CancelFlag::new())
            .unwrap();
        assert!(curve.len() <= 4);
        assert!(!curve.is_empty());
        assert!(curve.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[tokio::test]
    async fn test_final_round_skips_elimination() {
        // a single-round run must score the untouched matrix, so its
        // one point matches the first point of a longer run
        let bus = EventBus::new();
        let publisher = bus.worker_publisher();
        let settings = StrategySettings {
            iterations: Iterations::Fixed(1),
            vector_size: 8,
            num_eliminate: 2,
            folds: 3,
            relative: false,
            buffer_curves: true,
            monotonize: false,
        };
        let fs = separable_feature_set(8, 6);

        let short = FeatureRemoval::new(settings.clone())
            .run(&fs, &publisher, &CancelFlag::new())
            .unwrap();
        let long = FeatureRemoval::new(StrategySettings {
            iterations: Iterations::Fixed(3),
            ..settings
        })
        .run(&fs, &publisher, &CancelFlag::new())
        .unwrap();

        assert_eq!(short.len(), 1);
        assert_eq!(short[0], long[0]);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_with_interrupt() {
        let bus = EventBus::new();
        let publisher = bus.worker_publisher();
        let cancel = CancelFlag::new();
        cancel.set();
        let strategy = FeatureRemoval::new(StrategySettings::default());
        let fs = separable_feature_set(8, 6);

        let err = strategy.run(&fs, &publisher, &cancel).unwrap_err();
        assert!(matches!(err, UnmaskingError::Interrupted));
    }

    #[test]
    fn test_monotonize_keeps_falling_curves_untouched() {
        let falling = vec![1.0, 0.8, 0.5, 0.1];
        assert_eq!(monotonize_curve(&falling), falling);
    }

    #[test]
    fn test_monotonize_picks_smaller_deviation() {
        // one small upward blip in an otherwise falling curve: the
        // floor candidate only flattens the blip
        let curve = vec![1.0, 0.6, 0.7, 0.2];
        assert_eq!(monotonize_curve(&curve), vec![1.0, 0.6, 0.6, 0.2]);

        // a late rise is clamped down to the preceding minimum, never
        // allowed to stand as a rising tail
        let curve = vec![0.3, 0.2, 0.6, 0.9];
        assert_eq!(monotonize_curve(&curve), vec![0.3, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn test_rising_curve_flattens_to_the_ceiling() {
        // the ceiling candidate deviates less here: every point is
        // raised to the curve's maximum
        assert_eq!(monotonize_curve(&[0.1, 0.5, 0.8]), vec![0.8, 0.8, 0.8]);
    }

    #[test]
    fn test_monotonized_output_is_never_increasing() {
        let inputs = [
            vec![0.3, 0.2, 0.6, 0.9],
            vec![0.1, 0.5, 0.8],
            vec![1.0, 0.6, 0.7, 0.2],
            vec![0.5, 0.5, 0.5],
        ];
        for raw in &inputs {
            let smoothed = monotonize_curve(raw);
            assert!(
                smoothed.windows(2).all(|w| w[0] >= w[1]),
                "{:?} monotonized to {:?}",
                raw,
                smoothed
            );
        }
    }

    #[test]
    fn test_monotonize_handles_short_curves() {
        assert_eq!(monotonize_curve(&[]), Vec::<f64>::new());
        assert_eq!(monotonize_curve(&[0.4]), vec![0.4]);
    }
}
