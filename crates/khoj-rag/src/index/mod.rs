//! In-memory retrieval indexes: dense (HNSW) and sparse (BM25).

pub mod bm25;
pub mod hnsw;

pub use bm25::{default_tokenizer, Bm25Index, Bm25Params, Tokenizer};
pub use hnsw::{DistanceMetric, HnswIndex, HnswParams};
