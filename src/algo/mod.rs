pub mod clustering;
pub mod hdbscan;
pub mod sampling;
pub mod tfidf;
pub mod tokenizer;

#[cfg(feature = "cache")]
pub mod storage;
