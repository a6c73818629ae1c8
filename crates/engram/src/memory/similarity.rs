//! Similarity index for on-demand recall
//!
//! TF-IDF vectors are rebuilt from the decoded text of every record in the
//! session (Active and Reinjected) on each query. Corpora are small, so the
//! index is not maintained incrementally. Queries never mutate records.

use std::collections::HashMap;

use crate::codec::CodecError;
use crate::memory::store::MemoryStore;
use crate::memory::types::MemoryRecord;

/// A record matched by a recall query
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    /// Cosine similarity to the query, 0-1
    pub score: f64,
    /// Decoded record text
    pub text: String,
}

/// Ranks a session's records against a free-text query
#[derive(Debug, Clone, Copy)]
pub struct SimilarityIndex {
    min_score: f64,
}

impl SimilarityIndex {
    /// Results scoring below `min_score` are dropped; zero-overlap records are
    /// always dropped.
    pub fn new(min_score: f64) -> Self {
        Self { min_score }
    }

    pub fn min_score(&self) -> f64 {
        self.min_score
    }

    /// Top `k` records by cosine similarity, descending. Ties go to the more
    /// recent record.
    ///
    /// A record that cannot be decoded fails the whole query with
    /// `CorruptPayload`.
    pub fn query(
        &self,
        store: &MemoryStore,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredRecord>, CodecError> {
        if k == 0 || store.is_empty() {
            return Ok(Vec::new());
        }

        let texts = store
            .all()
            .iter()
            .map(|record| store.decode(record))
            .collect::<Result<Vec<_>, _>>()?;

        let docs: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();
        let model = TfIdfModel::fit(&docs);
        let query_vec = model.transform(&tokenize(query));

        let mut results: Vec<ScoredRecord> = store
            .all()
            .iter()
            .zip(texts)
            .zip(&docs)
            .filter_map(|((record, text), doc)| {
                let score = cosine_similarity(&query_vec, &model.transform(doc));
                (score > 0.0 && score >= self.min_score).then(|| ScoredRecord {
                    record: record.clone(),
                    score,
                    text,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.record.order_key().cmp(&a.record.order_key()))
        });
        results.truncate(k);

        Ok(results)
    }
}

/// Lowercased word tokens of two or more alphanumeric characters
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 2)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Vocabulary and smoothed inverse document frequencies for one corpus
struct TfIdfModel {
    vocab: HashMap<String, usize>,
    idf: Vec<f64>,
}

impl TfIdfModel {
    fn fit(docs: &[Vec<String>]) -> Self {
        let mut vocab: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: Vec<usize> = Vec::new();

        for doc in docs {
            let mut seen: Vec<usize> = doc
                .iter()
                .map(|term| {
                    let next = vocab.len();
                    let idx = *vocab.entry(term.clone()).or_insert(next);
                    if idx == doc_freq.len() {
                        doc_freq.push(0);
                    }
                    idx
                })
                .collect();
            seen.sort_unstable();
            seen.dedup();
            for idx in seen {
                doc_freq[idx] += 1;
            }
        }

        // idf = ln((1 + n) / (1 + df)) + 1, so terms present everywhere
        // still carry weight
        let n = docs.len() as f64;
        let idf = doc_freq
            .iter()
            .map(|&df| ((1.0 + n) / (1.0 + df as f64)).ln() + 1.0)
            .collect();

        Self { vocab, idf }
    }

    /// Dense TF-IDF vector in the model's vocabulary space; unknown terms
    /// are ignored
    fn transform(&self, terms: &[String]) -> Vec<f64> {
        let mut vec = vec![0.0; self.idf.len()];
        for term in terms {
            if let Some(&idx) = self.vocab.get(term) {
                vec[idx] += 1.0;
            }
        }
        for (value, idf) in vec.iter_mut().zip(&self.idf) {
            *value *= idf;
        }
        vec
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}
