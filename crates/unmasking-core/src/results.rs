//! Persisted run output: curves keyed by pair or aggregate identifier,
//! plus the metadata needed to interpret them later.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::corpus::CurveClass;
use crate::error::Result;

/// One stored curve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurveRecord {
    pub cls: CurveClass,
    pub values: Vec<f64>,
    /// Input files behind the curve; aggregated curves carry the union
    /// of the contributing pairs' files.
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ResultMeta {
    /// All distinct classes seen, sorted.
    pub classes: Vec<String>,
    /// Bucket key used when the curves are aggregates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_key: Option<String>,
}

/// Complete result of one run or aggregation, maps one-to-one onto the
/// output JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UnmaskingResult {
    pub meta: ResultMeta,
    /// Identifier to curve; BTreeMap keeps serialization deterministic.
    pub curves: BTreeMap<String, CurveRecord>,
}

impl UnmaskingResult {
    pub fn new(aggregate_key: Option<String>) -> Self {
        Self {
            meta: ResultMeta {
                classes: Vec::new(),
                aggregate_key,
            },
            curves: BTreeMap::new(),
        }
    }

    /// Insert or replace a curve, keeping the class list current.
    pub fn add_curve(&mut self, identifier: impl Into<String>, record: CurveRecord) {
        self.curves.insert(identifier.into(), record);
        let classes: BTreeSet<&str> = self.curves.values().map(|c| c.cls.as_str()).collect();
        self.meta.classes = classes.into_iter().map(str::to_string).collect();
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    /// Write to `<dir>/<basename>.<timestamp>.json` and return the path.
    pub fn save(&self, dir: &Path, basename: &str) -> Result<PathBuf> {
        let timestamp = Local::now().format("%Y-%m-%d.%H-%M-%S");
        let path = dir.join(format!("{}.{}.json", basename, timestamp));
        fs::create_dir_all(dir)?;
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
