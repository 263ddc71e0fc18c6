//! In-memory corpus collaborators for tests and demo runs.
//!
//! These are real implementations of the corpus traits, just fed from
//! memory instead of a corpus on disk, so engine behavior can be
//! exercised end to end without fixture directories.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::cache::{register_cache, BoundedCache, ClearableCache};
use crate::corpus::{
    ChunkSampler, ChunkedPair, CorpusParser, CurveClass, FeatureSet, FeatureSetBuilder, PairIterator,
    PairMeta, Tokenizer,
};
use crate::error::Result;

/// Lowercasing word tokenizer; memoizes per chunk.
pub struct WhitespaceTokenizer {
    cache: Arc<BoundedCache<String, Vec<String>>>,
}

impl WhitespaceTokenizer {
    pub fn new() -> Self {
        let cache = Arc::new(BoundedCache::new(2048));
        register_cache(Arc::downgrade(&cache) as Weak<dyn ClearableCache>);
        Self { cache }
    }
}

impl Default for WhitespaceTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        self.cache.get_or_insert_with(&text.to_string(), || {
            text.split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(str::to_lowercase)
                .collect()
        })
    }
}

/// Split tokens into chunks of `chunk_size` tokens. A short trailing
/// remainder (less than half a chunk) is folded into the previous chunk
/// instead of forming an undersized one.
pub fn chunk_tokens(tokens: &[String], chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks: Vec<String> = tokens
        .chunks(chunk_size)
        .map(|c| c.join(" "))
        .collect();
    let remainder = tokens.len() % chunk_size;
    if chunks.len() > 1 && remainder != 0 && remainder < chunk_size / 2 {
        let tail = chunks.pop().unwrap();
        let last = chunks.last_mut().unwrap();
        last.push(' ');
        last.push_str(&tail);
    }
    chunks
}

/// One in-memory text pair.
#[derive(Debug, Clone)]
pub struct MemoryPair {
    pub name_a: String,
    pub text_a: String,
    pub name_b: String,
    pub text_b: String,
    pub cls: CurveClass,
}

/// Corpus parser over a fixed set of in-memory pairs.
pub struct MemoryCorpusParser {
    pairs: Vec<MemoryPair>,
    chunk_size: usize,
    tokenizer: Arc<dyn Tokenizer>,
}

impl MemoryCorpusParser {
    pub fn new(pairs: Vec<MemoryPair>, chunk_size: usize, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            pairs,
            chunk_size,
            tokenizer,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl CorpusParser for MemoryCorpusParser {
    fn iter(&self) -> Box<dyn PairIterator> {
        Box::new(MemoryPairIterator {
            pairs: self.pairs.clone(),
            chunk_size: self.chunk_size,
            tokenizer: Arc::clone(&self.tokenizer),
            next: 0,
        })
    }
}

struct MemoryPairIterator {
    pairs: Vec<MemoryPair>,
    chunk_size: usize,
    tokenizer: Arc<dyn Tokenizer>,
    next: usize,
}

#[async_trait]
impl PairIterator for MemoryPairIterator {
    async fn next_pair(&mut self) -> Result<Option<ChunkedPair>> {
        let pair = match self.pairs.get(self.next) {
            None => return Ok(None),
            Some(p) => p.clone(),
        };
        self.next += 1;

        let files_a = vec![pair.name_a.clone()];
        let files_b = vec![pair.name_b.clone()];
        let meta = PairMeta {
            pair_id: PairMeta::derive_id(&files_a, &files_b),
            cls: pair.cls,
            files_a,
            files_b,
        };
        let chunks_a = chunk_tokens(&self.tokenizer.tokenize(&pair.text_a), self.chunk_size);
        let chunks_b = chunk_tokens(&self.tokenizer.tokenize(&pair.text_b), self.chunk_size);
        Ok(Some(ChunkedPair {
            meta,
            chunks_a,
            chunks_b,
        }))
    }
}

/// Pairs chunk indexes round-robin so every chunk of the longer text
/// participates exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinSampler;

impl ChunkSampler for RoundRobinSampler {
    fn sample(&self, len_a: usize, len_b: usize) -> Vec<(usize, usize)> {
        if len_a == 0 || len_b == 0 {
            return Vec::new();
        }
        (0..len_a.max(len_b)).map(|i| (i % len_a, i % len_b)).collect()
    }
}

/// Token-frequency features over the pair's most frequent tokens.
pub struct FrequencyFeatureSet {
    meta: PairMeta,
    /// Vocabulary ordered by total frequency, ties lexicographic.
    vocabulary: Vec<String>,
    /// Per sampled chunk pair: (counts_a, total_a, counts_b, total_b).
    samples: Vec<(HashMap<String, f64>, f64, HashMap<String, f64>, f64)>,
}

impl FrequencyFeatureSet {
    fn count(tokens: &[String]) -> (HashMap<String, f64>, f64) {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for t in tokens {
            *counts.entry(t.clone()).or_insert(0.0) += 1.0;
        }
        (counts, tokens.len() as f64)
    }

    fn row(&self, n: usize, relative: bool, idx: usize) -> Vec<f64> {
        let (counts_a, total_a, counts_b, total_b) = &self.samples[idx];
        let mut row = Vec::with_capacity(2 * n);
        for half in [(counts_a, *total_a), (counts_b, *total_b)] {
            let (counts, total) = half;
            for i in 0..n {
                let raw = self
                    .vocabulary
                    .get(i)
                    .and_then(|t| counts.get(t).copied())
                    .unwrap_or(0.0);
                row.push(if relative && total > 0.0 { raw / total } else { raw });
            }
        }
        row
    }
}

impl FeatureSet for FrequencyFeatureSet {
    fn pair(&self) -> &PairMeta {
        &self.meta
    }

    fn kind(&self) -> &'static str {
        "frequency"
    }

    fn features_absolute(&self, n: usize) -> Vec<Vec<f64>> {
        (0..self.samples.len()).map(|i| self.row(n, false, i)).collect()
    }

    fn features_relative(&self, n: usize) -> Vec<Vec<f64>> {
        (0..self.samples.len()).map(|i| self.row(n, true, i)).collect()
    }
}

/// Builds [`FrequencyFeatureSet`]s with a shared tokenizer.
pub struct FrequencyFeatureSetBuilder {
    tokenizer: Arc<dyn Tokenizer>,
}

impl FrequencyFeatureSetBuilder {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }
}

impl FeatureSetBuilder for FrequencyFeatureSetBuilder {
    fn kind(&self) -> &'static str {
        "frequency"
    }

    fn build(&self, pair: ChunkedPair, sampler: &dyn ChunkSampler) -> Result<Box<dyn FeatureSet>> {
        let tokenized_a: Vec<Vec<String>> = pair
            .chunks_a
            .iter()
            .map(|c| self.tokenizer.tokenize(c))
            .collect();
        let tokenized_b: Vec<Vec<String>> = pair
            .chunks_b
            .iter()
            .map(|c| self.tokenizer.tokenize(c))
            .collect();

        let mut totals: HashMap<String, f64> = HashMap::new();
        for tokens in tokenized_a.iter().chain(tokenized_b.iter()) {
            for t in tokens {
                *totals.entry(t.clone()).or_insert(0.0) += 1.0;
            }
        }
        let mut vocabulary: Vec<String> = totals.keys().cloned().collect();
        vocabulary.sort_by(|a, b| {
            totals[b]
                .partial_cmp(&totals[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });

        let samples = sampler
            .sample(tokenized_a.len(), tokenized_b.len())
            .into_iter()
            .map(|(ia, ib)| {
                let (ca, ta) = FrequencyFeatureSet::count(&tokenized_a[ia]);
                let (cb, tb) = FrequencyFeatureSet::count(&tokenized_b[ib]);
                (ca, ta, cb, tb)
            })
            .collect();

        Ok(Box::new(FrequencyFeatureSet {
            meta: pair.meta,
            vocabulary,
            samples,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenizer_lowercases_and_splits_punctuation() {
        let tok = WhitespaceTokenizer::new();
        assert_eq!(
            tok.tokenize("The cat, the CAT!"),
            vec!["the", "cat", "the", "cat"]
        );
    }

    #[test]
    fn test_short_remainder_folds_into_previous_chunk() {
        let tokens: Vec<String> = (0..9).map(|i| i.to_string()).collect();
        let chunks = chunk_tokens(&tokens, 4);
        // 4 + 4 + 1: the single leftover token joins the second chunk
        assert_eq!(chunks, vec!["0 1 2 3", "4 5 6 7 8"]);
    }

    #[test]
    fn test_large_remainder_keeps_its_own_chunk() {
        let tokens: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        assert_eq!(chunk_tokens(&tokens, 4), vec!["0 1 2 3", "4 5 6"]);
    }

    #[test]
    fn test_round_robin_covers_longer_side_once() {
        let sampler = RoundRobinSampler;
        assert_eq!(
            sampler.sample(2, 5),
            vec![(0, 0), (1, 1), (0, 2), (1, 3), (0, 4)]
        );
        assert!(sampler.sample(0, 3).is_empty());
    }

    #[tokio::test]
    async fn test_parser_streams_all_pairs_with_stable_ids() {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(WhitespaceTokenizer::new());
        let parser = MemoryCorpusParser::new(
            vec![MemoryPair {
                name_a: "a.txt".to_string(),
                text_a: "one two three four five six".to_string(),
                name_b: "b.txt".to_string(),
                text_b: "six five four three two one".to_string(),
                cls: CurveClass::SameAuthor,
            }],
            3,
            tokenizer,
        );

        let mut iter = parser.iter();
        let pair = iter.next_pair().await.unwrap().unwrap();
        assert_eq!(pair.chunks_a.len(), 2);
        assert_eq!(
            pair.meta.pair_id,
            PairMeta::derive_id(&pair.meta.files_a, &pair.meta.files_b)
        );
        assert!(iter.next_pair().await.unwrap().is_none());
    }

    #[test]
    fn test_frequency_features_rank_common_tokens_first() {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(WhitespaceTokenizer::new());
        let builder = FrequencyFeatureSetBuilder::new(tokenizer);
        let pair = ChunkedPair {
            meta: PairMeta {
                pair_id: "p".to_string(),
                cls: CurveClass::Unspecified,
                files_a: vec![],
                files_b: vec![],
            },
            chunks_a: vec!["the the the cat".to_string()],
            chunks_b: vec!["the dog dog".to_string()],
        };

        let fs = builder.build(pair, &RoundRobinSampler).unwrap();
        let rows = fs.features_absolute(2);
        // vocabulary: "the" (4), "dog" (2); chunk a has 3x the, 0x dog
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], vec![3.0, 0.0, 1.0, 2.0]);

        let relative = fs.features_relative(2);
        assert!((relative[0][0] - 0.75).abs() < 1e-12);
    }
}
