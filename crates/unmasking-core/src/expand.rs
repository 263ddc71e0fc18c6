//! Configuration expansion: named parameter vectors → concrete variants.
//!
//! An experiment declares m named vectors of n candidate values each; an
//! expander turns them into a sequence of m-tuples, one per concrete
//! configuration to run.

use serde_json::Value;

/// Strategy for expanding parameter vectors into concrete configurations.
pub trait ConfigurationExpander: Send + Sync {
    /// Expand the input vectors into a sequence of value tuples, one per
    /// variant. An empty input produces an empty output.
    fn expand(&self, vectors: &[Vec<Value>]) -> Vec<Vec<Value>>;

    /// Registry name of this expander.
    fn name(&self) -> &'static str;
}

impl std::fmt::Debug for dyn ConfigurationExpander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationExpander")
            .field("name", &self.name())
            .finish()
    }
}

/// Positional pairing of vector entries.
///
/// Produces one variant per index position; the output length is the
/// length of the *shortest* input vector, and trailing values of longer
/// vectors are ignored. Three vectors `("a","b") ("c","d") ("e","f")`
/// expand to `("a","c","e")` and `("b","d","f")`.
#[derive(Debug, Default)]
pub struct ZipExpander;

impl ConfigurationExpander for ZipExpander {
    fn expand(&self, vectors: &[Vec<Value>]) -> Vec<Vec<Value>> {
        if vectors.is_empty() {
            return Vec::new();
        }
        let len = vectors.iter().map(Vec::len).min().unwrap_or(0);
        (0..len)
            .map(|i| vectors.iter().map(|v| v[i].clone()).collect())
            .collect()
    }

    fn name(&self) -> &'static str {
        "zip"
    }
}

/// Full cartesian product of all vector values.
///
/// Three vectors `("a","b") ("c","d") ("e","f")` expand to all eight
/// combinations `("a","c","e")`, `("a","c","f")`, …, `("b","d","f")`.
///
/// WARNING: the output size is the *product* of all vector lengths and
/// therefore exponential in the number of vectors. The expansion is never
/// capped; keep the number of vectors small.
#[derive(Debug, Default)]
pub struct ProductExpander;

impl ConfigurationExpander for ProductExpander {
    fn expand(&self, vectors: &[Vec<Value>]) -> Vec<Vec<Value>> {
        if vectors.is_empty() || vectors.iter().any(Vec::is_empty) {
            return Vec::new();
        }
        let mut out: Vec<Vec<Value>> = vec![Vec::new()];
        for vector in vectors {
            let mut next = Vec::with_capacity(out.len() * vector.len());
            for prefix in &out {
                for value in vector {
                    let mut row = prefix.clone();
                    row.push(value.clone());
                    next.push(row);
                }
            }
            out = next;
        }
        out
    }

    fn name(&self) -> &'static str {
        "product"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vectors(raw: &[&[i64]]) -> Vec<Vec<Value>> {
        raw.iter()
            .map(|v| v.iter().map(|n| json!(n)).collect())
            .collect()
    }

    #[test]
    fn test_zip_length_is_shortest_vector() {
        let out = ZipExpander.expand(&vectors(&[&[1, 2, 3], &[4, 5], &[6, 7, 8, 9]]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], vec![json!(1), json!(4), json!(6)]);
        assert_eq!(out[1], vec![json!(2), json!(5), json!(7)]);
    }

    #[test]
    fn test_product_length_is_product_of_lengths() {
        let out = ProductExpander.expand(&vectors(&[&[1, 2], &[3, 4, 5], &[6, 7]]));
        assert_eq!(out.len(), 2 * 3 * 2);
        assert_eq!(out[0], vec![json!(1), json!(3), json!(6)]);
        assert_eq!(out[11], vec![json!(2), json!(5), json!(7)]);
    }

    #[test]
    fn test_product_preserves_variant_width() {
        let out = ProductExpander.expand(&vectors(&[&[1, 2], &[3, 4]]));
        assert!(out.iter().all(|v| v.len() == 2));
    }

    #[test]
    fn test_empty_input_expands_to_nothing() {
        assert!(ZipExpander.expand(&[]).is_empty());
        assert!(ProductExpander.expand(&[]).is_empty());
        assert!(ProductExpander.expand(&vectors(&[&[1, 2], &[]])).is_empty());
    }
}
