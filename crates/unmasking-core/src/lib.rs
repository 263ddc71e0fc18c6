//! Concurrent authorship-verification experiment engine.
//!
//! Implements the unmasking method: repeatedly train a linear margin
//! classifier to tell two texts apart, record how well it does, strip
//! its most discriminating features and repeat. The resulting quality
//! degradation curve separates same-author pairs (fast collapse) from
//! different-author pairs (slow collapse).
//!
//! The [`engine::JobEngine`] drives whole experiment jobs: it expands a
//! declarative job description into configuration variants, streams
//! chunked text pairs from a corpus parser, fans the per-pair work out
//! to a bounded blocking-thread pool and collects curves through the
//! [`event::EventBus`] into configurable outputs and aggregators.

pub mod aggregate;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod corpus;
pub mod engine;
pub mod error;
pub mod event;
pub mod expand;
pub mod fakes;
pub mod registry;
pub mod results;
pub mod strategy;
pub mod telemetry;

pub use config::JobConfig;
pub use engine::JobEngine;
pub use error::{Result, UnmaskingError};

/// Crate version, surfaced by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
