//! Inverted index with Okapi BM25 scoring.
//!
//! `build` replaces the whole index for a document batch; scoring follows
//! the standard formula with length normalization:
//!
//! ```text
//! score(q, d) = Σ idf(t) · (tf(t,d) · (k1 + 1)) / (tf(t,d) + k1 · (1 − b + b · |d|/avgdl))
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RagError;

/// Deterministic, side-effect-free tokenizer.
pub type Tokenizer = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Default tokenizer: lowercase, split on non-alphanumeric runs, drop tokens
/// shorter than two characters.
pub fn default_tokenizer() -> Tokenizer {
    Arc::new(|text: &str| {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= 2)
            .map(str::to_string)
            .collect()
    })
}

#[derive(Debug, Clone)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f32,
    /// Length normalization strength.
    pub b: f32,
    /// Terms appearing in fewer documents are dropped from the vocabulary.
    pub min_doc_freq: usize,
    /// Terms appearing in more than `doc_count · ratio` documents are dropped.
    pub max_doc_freq_ratio: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            min_doc_freq: 1,
            max_doc_freq_ratio: 1.0,
        }
    }
}

impl Bm25Params {
    pub fn validate(&self) -> Result<(), RagError> {
        if self.k1 < 0.0 {
            return Err(RagError::ConfigError("bm25 k1 must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.b) {
            return Err(RagError::ConfigError("bm25 b must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.max_doc_freq_ratio) {
            return Err(RagError::ConfigError(
                "bm25 max_doc_freq_ratio must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

struct DocEntry {
    id: String,
    /// Length in tokens, after tokenization.
    length: u32,
}

struct TermEntry {
    /// doc slot -> term frequency. The posting list for a term is exactly the
    /// set of documents whose tokenized form contains it (post df-filtering).
    postings: HashMap<u32, u32>,
    idf: f32,
}

/// In-memory BM25 index. Built once per document batch, queried many times.
pub struct Bm25Index {
    params: Bm25Params,
    tokenizer: Tokenizer,
    docs: Vec<DocEntry>,
    terms: HashMap<String, TermEntry>,
    avg_doc_length: f32,
    built: bool,
}

impl Bm25Index {
    pub fn new(params: Bm25Params) -> Result<Self, RagError> {
        params.validate()?;
        Ok(Self {
            params,
            tokenizer: default_tokenizer(),
            docs: Vec::new(),
            terms: HashMap::new(),
            avg_doc_length: 0.0,
            built: false,
        })
    }

    pub fn with_tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn vocab_size(&self) -> usize {
        self.terms.len()
    }

    /// Build the index from `(id, text)` pairs, replacing any previous index.
    pub fn build<'a>(&mut self, documents: impl IntoIterator<Item = (&'a str, &'a str)>) {
        self.docs.clear();
        self.terms.clear();

        let mut raw_terms: HashMap<String, HashMap<u32, u32>> = HashMap::new();
        let mut total_length: u64 = 0;

        for (id, text) in documents {
            let tokens = (self.tokenizer)(text);
            let slot = self.docs.len() as u32;
            total_length += tokens.len() as u64;
            self.docs.push(DocEntry {
                id: id.to_string(),
                length: tokens.len() as u32,
            });

            let mut freqs: HashMap<&str, u32> = HashMap::new();
            for token in &tokens {
                *freqs.entry(token.as_str()).or_insert(0) += 1;
            }
            for (token, freq) in freqs {
                raw_terms
                    .entry(token.to_string())
                    .or_default()
                    .insert(slot, freq);
            }
        }

        let n = self.docs.len();
        self.avg_doc_length = if n == 0 {
            0.0
        } else {
            total_length as f32 / n as f32
        };

        // df filtering + idf precomputation.
        let max_df = ((n as f32) * self.params.max_doc_freq_ratio).floor() as usize;
        for (term, postings) in raw_terms {
            let df = postings.len();
            if df < self.params.min_doc_freq || df > max_df {
                continue;
            }
            let idf = ((n as f32 - df as f32 + 0.5) / (df as f32 + 0.5) + 1.0).ln();
            self.terms.insert(term, TermEntry { postings, idf });
        }

        self.built = true;
        tracing::debug!(
            docs = n,
            vocab = self.terms.len(),
            avgdl = self.avg_doc_length,
            "BM25 index built"
        );
    }

    pub fn clear(&mut self) {
        self.docs.clear();
        self.terms.clear();
        self.avg_doc_length = 0.0;
        self.built = false;
    }

    /// Score the query against the index. Results are sorted descending,
    /// truncated to `top_k`, and normalized to [0, 1] by the top score so
    /// they can be fused with dense scores.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<(String, f32)>, RagError> {
        if !self.built {
            return Err(RagError::IndexNotBuilt);
        }
        let tokens = (self.tokenizer)(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let k1 = self.params.k1;
        let b = self.params.b;
        let mut scores: HashMap<u32, f32> = HashMap::new();

        for token in &tokens {
            let Some(entry) = self.terms.get(token.as_str()) else {
                continue;
            };
            for (&slot, &tf) in &entry.postings {
                let doc_len = self.docs[slot as usize].length as f32;
                let tf = tf as f32;
                let denom = tf + k1 * (1.0 - b + b * doc_len / self.avg_doc_length.max(f32::EPSILON));
                *scores.entry(slot).or_insert(0.0) += entry.idf * (tf * (k1 + 1.0)) / denom;
            }
        }

        let mut ranked: Vec<(u32, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(top_k);

        let top = ranked.first().map(|(_, s)| *s).unwrap_or(0.0);
        Ok(ranked
            .into_iter()
            .map(|(slot, score)| {
                let normalized = if top > 0.0 { score / top } else { 0.0 };
                (self.docs[slot as usize].id.clone(), normalized)
            })
            .collect())
    }

    /// Raw (un-normalized) scores, mostly for diagnostics and tests.
    pub fn raw_scores(&self, query: &str) -> Result<Vec<(String, f32)>, RagError> {
        if !self.built {
            return Err(RagError::IndexNotBuilt);
        }
        let tokens = (self.tokenizer)(query);
        let k1 = self.params.k1;
        let b = self.params.b;
        let mut scores: HashMap<u32, f32> = HashMap::new();
        for token in &tokens {
            let Some(entry) = self.terms.get(token.as_str()) else {
                continue;
            };
            for (&slot, &tf) in &entry.postings {
                let doc_len = self.docs[slot as usize].length as f32;
                let tf = tf as f32;
                let denom = tf + k1 * (1.0 - b + b * doc_len / self.avg_doc_length.max(f32::EPSILON));
                *scores.entry(slot).or_insert(0.0) += entry.idf * (tf * (k1 + 1.0)) / denom;
            }
        }
        let mut ranked: Vec<(String, f32)> = scores
            .into_iter()
            .map(|(slot, s)| (self.docs[slot as usize].id.clone(), s))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_sample() -> Bm25Index {
        let mut index = Bm25Index::new(Bm25Params::default()).expect("index");
        index.build([
            ("A", "postgres is a relational database"),
            ("B", "mysql is a relational database"),
            ("C", "the weather is nice today"),
        ]);
        index
    }

    #[test]
    fn test_query_ordering() {
        let index = build_sample();
        let results = index.search("postgres database", 3).expect("search");

        assert!(!results.is_empty());
        assert_eq!(results[0].0, "A");
        // A matches both terms, B only one; scores strictly ordered.
        let score_a = results[0].1;
        let score_b = results
            .iter()
            .find(|(id, _)| id == "B")
            .map(|(_, s)| *s)
            .expect("B present");
        assert!(score_a > score_b);
        // C shares no query term, so it never scores.
        assert!(results.iter().all(|(id, _)| id != "C"));
    }

    #[test]
    fn test_scores_normalized_and_non_increasing() {
        let index = build_sample();
        let results = index.search("relational database", 3).expect("search");
        assert!((results[0].1 - 1.0).abs() < 1e-6);
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
        for (_, score) in &results {
            assert!((0.0..=1.0).contains(score));
        }
    }

    #[test]
    fn test_top_k_bounds_results() {
        let index = build_sample();
        let results = index.search("database", 1).expect("search");
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_unbuilt_index_fails() {
        let index = Bm25Index::new(Bm25Params::default()).expect("index");
        assert!(matches!(index.search("query", 5), Err(RagError::IndexNotBuilt)));
    }

    #[test]
    fn test_empty_tokenized_query_returns_empty() {
        let index = build_sample();
        // Single-character tokens are dropped by the default tokenizer.
        let results = index.search("a ! ?", 5).expect("search");
        assert!(results.is_empty());
    }

    #[test]
    fn test_rebuild_replaces_previous_index() {
        let mut index = build_sample();
        index.build([("X", "entirely new corpus about rust")]);
        assert_eq!(index.doc_count(), 1);
        let results = index.search("postgres", 5).expect("search");
        assert!(results.is_empty());
        let results = index.search("rust", 5).expect("search");
        assert_eq!(results[0].0, "X");
    }

    #[test]
    fn test_max_doc_freq_ratio_drops_stopwords() {
        let params = Bm25Params {
            max_doc_freq_ratio: 0.5,
            ..Bm25Params::default()
        };
        let mut index = Bm25Index::new(params).expect("index");
        index.build([
            ("A", "shared term alpha"),
            ("B", "shared term beta"),
            ("C", "shared term gamma"),
        ]);
        // "shared" and "term" appear in all 3 docs > 1.5 ceiling, dropped.
        let results = index.search("shared term", 3).expect("search");
        assert!(results.is_empty());
        let results = index.search("alpha", 3).expect("search");
        assert_eq!(results[0].0, "A");
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = Bm25Params {
            b: 2.0,
            ..Bm25Params::default()
        };
        assert!(Bm25Index::new(params).is_err());
        let params = Bm25Params {
            k1: -1.0,
            ..Bm25Params::default()
        };
        assert!(Bm25Index::new(params).is_err());
    }

    #[test]
    fn test_custom_tokenizer() {
        let mut index = Bm25Index::new(Bm25Params::default())
            .expect("index")
            .with_tokenizer(Arc::new(|t: &str| {
                t.split(',').map(|s| s.trim().to_string()).collect()
            }));
        index.build([("A", "red, green"), ("B", "blue, green")]);
        let results = index.search("red", 2).expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "A");
    }
}
