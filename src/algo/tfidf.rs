use std::collections::{BTreeMap, HashMap};

type TermCounts = BTreeMap<String, u32>;

/// Document frequencies over the hierarchy leaves, for keyword extraction.
///
/// A document is the concatenated token stream of one leaf, so the top terms
/// of a document are the words that set its tickets apart from the other
/// groups.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    docs: Vec<TermCounts>,
    doc_freq: HashMap<String, u32>,
}

fn count_terms(tokens: &[String]) -> TermCounts {
    let mut counts = TermCounts::new();
    for token in tokens {
        *counts.entry(token.clone()).or_default() += 1;
    }
    counts
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pre-tokenized document. Returns its index.
    pub fn add_document(&mut self, tokens: &[String]) -> usize {
        let counts = count_terms(tokens);
        for term in counts.keys() {
            *self.doc_freq.entry(term.clone()).or_default() += 1;
        }
        self.docs.push(counts);
        self.docs.len() - 1
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Smoothed IDF, `ln((N - df + 0.5) / (df + 0.5) + 1)`; never negative.
    pub fn idf(&self, term: &str) -> f64 {
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        let n = self.docs.len() as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Term weights (relative frequency times IDF) of document `doc`.
    pub fn weights(&self, doc: usize) -> Vec<(String, f64)> {
        self.docs
            .get(doc)
            .map(|counts| self.weigh(counts))
            .unwrap_or_default()
    }

    fn weigh(&self, counts: &TermCounts) -> Vec<(String, f64)> {
        let total: u32 = counts.values().sum();
        if total == 0 {
            return Vec::new();
        }
        counts
            .iter()
            .map(|(term, &c)| (term.clone(), c as f64 / total as f64 * self.idf(term)))
            .collect()
    }

    /// Highest-weighted `n` terms of document `doc`, ties alphabetical.
    pub fn top_terms(&self, doc: usize, n: usize) -> Vec<(String, f64)> {
        rank(self.weights(doc), n)
    }

    /// Highest-weighted `n` terms of a token stream outside the corpus,
    /// weighted with the corpus IDF. Parents use this: their text spans
    /// several documents.
    pub fn top_terms_for(&self, tokens: &[String], n: usize) -> Vec<(String, f64)> {
        rank(self.weigh(&count_terms(tokens)), n)
    }
}

fn rank(mut weights: Vec<(String, f64)>, n: usize) -> Vec<(String, f64)> {
    weights.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    weights.truncate(n);
    weights
}
