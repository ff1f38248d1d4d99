//! Vector math and token estimation shared across the pipeline.

use std::sync::Arc;

/// Flat overhead added per message/chunk when estimating tokens without a
/// real tokenizer (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 10;

/// Caller-supplied token counter. When absent, [`estimate_tokens`] is used.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Cheap token estimate: one token per four characters, rounded up, plus a
/// fixed per-message overhead.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4 + MESSAGE_OVERHEAD_TOKENS
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity in [-1, 1]. Zero vectors similarity is 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    dot(a, b) / denom
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Scale a non-zero vector to unit length. Zero vectors are returned as-is.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let n = norm(v);
    if n <= f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / n).collect()
}

/// Logistic squashing of an unbounded score into (0, 1).
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// djb2 over a string, used for cache keys.
pub fn djb2(input: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in input.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit_length() {
        let v = vec![3.0, 4.0, 0.0];
        let n = normalize(&v);
        assert!((norm(&n) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_unchanged() {
        let v = vec![0.0, 0.0];
        assert_eq!(normalize(&v), v);
    }

    #[test]
    fn test_cosine_of_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        // 5 chars -> ceil(5/4) = 2, plus overhead
        assert_eq!(estimate_tokens("hello"), 2 + MESSAGE_OVERHEAD_TOKENS);
        assert_eq!(estimate_tokens(""), MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn test_djb2_is_deterministic() {
        assert_eq!(djb2("query"), djb2("query"));
        assert_ne!(djb2("query a"), djb2("query b"));
    }
}
