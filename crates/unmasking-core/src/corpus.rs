//! Collaborator contracts for corpus input and feature extraction.
//!
//! Tokenization, chunking and feature engineering live outside the core
//! engine; these traits pin down the shapes the engine consumes. The
//! [`crate::fakes`] module ships in-memory implementations for tests and
//! demo runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::Result;

/// Authorship class of a chunk pair and its resulting curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CurveClass {
    #[serde(rename = "same_author")]
    SameAuthor,
    #[serde(rename = "different_authors")]
    DifferentAuthors,
    #[serde(rename = "unspecified")]
    Unspecified,
}

impl CurveClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurveClass::SameAuthor => "same_author",
            CurveClass::DifferentAuthors => "different_authors",
            CurveClass::Unspecified => "unspecified",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "same_author" => Some(CurveClass::SameAuthor),
            "different_authors" => Some(CurveClass::DifferentAuthors),
            "unspecified" => Some(CurveClass::Unspecified),
            _ => None,
        }
    }
}

impl fmt::Display for CurveClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one sampled chunk pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairMeta {
    /// Stable identifier derived from the participating input files.
    pub pair_id: String,
    /// Authorship class of the pair.
    pub cls: CurveClass,
    /// Input files contributing to chunk set a.
    pub files_a: Vec<String>,
    /// Input files contributing to chunk set b.
    pub files_b: Vec<String>,
}

impl PairMeta {
    /// Derive a stable pair identifier from the participating input files.
    pub fn derive_id(files_a: &[String], files_b: &[String]) -> String {
        let mut hasher = Sha256::new();
        for f in files_a {
            hasher.update(f.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\x1e");
        for f in files_b {
            hasher.update(f.as_bytes());
            hasher.update(b"\x1f");
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// One matched pair of chunked texts ready for sampling.
#[derive(Debug, Clone)]
pub struct ChunkedPair {
    pub meta: PairMeta,
    /// Text chunks of the first half of the pair.
    pub chunks_a: Vec<String>,
    /// Text chunks of the second half of the pair.
    pub chunks_b: Vec<String>,
}

/// Splits raw text into tokens. Chunk-level tokenization is expected to be
/// memoized via [`crate::cache`] by implementations that are called
/// repeatedly on the same chunk.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Streaming iterator over the chunk pairs of one corpus pass.
#[async_trait]
pub trait PairIterator: Send {
    /// Next chunk pair, or `None` once the corpus is exhausted.
    async fn next_pair(&mut self) -> Result<Option<ChunkedPair>>;
}

/// Produces chunk pairs from a corpus. A parser can be iterated once per
/// repetition; each call to [`CorpusParser::iter`] starts a fresh pass.
pub trait CorpusParser: Send + Sync {
    fn iter(&self) -> Box<dyn PairIterator>;
}

/// Pairs up chunks from the two halves of a [`ChunkedPair`] for feature
/// extraction.
pub trait ChunkSampler: Send + Sync {
    /// Produce sampled `(chunk_a, chunk_b)` index pairs over chunk sets of
    /// the given lengths.
    fn sample(&self, len_a: usize, len_b: usize) -> Vec<(usize, usize)>;
}

/// Numeric feature representation of one chunk pair.
///
/// Every sampled chunk pair contributes one 2n-dimensional row: the first
/// n entries describe the chunk from set a, the last n the chunk from
/// set b.
pub trait FeatureSet: Send {
    /// Identity of the owning pair.
    fn pair(&self) -> &PairMeta;

    /// Short name of the feature kind (e.g. `"frequency"`).
    fn kind(&self) -> &'static str;

    /// Absolute feature vectors of length `n` per sampled chunk pair.
    fn features_absolute(&self, n: usize) -> Vec<Vec<f64>>;

    /// Length-normalized feature vectors of length `n` per sampled chunk
    /// pair.
    fn features_relative(&self, n: usize) -> Vec<Vec<f64>>;
}

/// Builds one [`FeatureSet`] per streamed chunk pair. The build runs on a
/// worker thread together with the strategy, so implementations must be
/// cheap to clone into the task.
pub trait FeatureSetBuilder: Send + Sync {
    fn kind(&self) -> &'static str;

    fn build(
        &self,
        pair: ChunkedPair,
        sampler: &dyn ChunkSampler,
    ) -> Result<Box<dyn FeatureSet>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_id_is_stable_and_order_sensitive() {
        let a = vec!["x.txt".to_string()];
        let b = vec!["y.txt".to_string()];
        assert_eq!(PairMeta::derive_id(&a, &b), PairMeta::derive_id(&a, &b));
        assert_ne!(PairMeta::derive_id(&a, &b), PairMeta::derive_id(&b, &a));
    }

    #[test]
    fn test_curve_class_serializes_to_snake_case() {
        let s = serde_json::to_string(&CurveClass::DifferentAuthors).unwrap();
        assert_eq!(s, "\"different_authors\"");
    }
}
