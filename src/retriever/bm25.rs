//! BM25 scoring over an ad hoc candidate set.
//!
//! Corpus statistics (document frequency, average document length) are
//! computed over the prefiltered candidate set passed to `score_all`, not
//! over the whole corpus — the hybrid search path already narrowed the
//! candidates down before this runs, and recomputing IDF against just
//! that set is what keeps the BM25 pass cheap and query-local.

use std::collections::HashMap;
use std::collections::HashSet;

/// Tokenize `text`, dropping punctuation and any word in `stopwords`.
/// `stopwords` is expected lowercase (`RetrievalConfig::default_stopwords`
/// supplies the built-in list; callers may configure their own).
pub fn tokenize(text: &str, stopwords: &HashSet<String>) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty() && !stopwords.contains(*s))
        .map(|s| s.to_string())
        .collect()
}

pub struct Bm25Scorer {
    k1: f32,
    b: f32,
}

impl Bm25Scorer {
    pub fn new(k1: f32, b: f32) -> Self {
        Self { k1, b }
    }

    /// Score every document in `documents` against `query_terms`. Index `i`
    /// of the result corresponds to `documents[i]`.
    pub fn score_all(&self, query_terms: &[String], documents: &[Vec<String>]) -> Vec<f32> {
        if documents.is_empty() {
            return Vec::new();
        }

        let n = documents.len() as f32;
        let avg_len: f32 = documents.iter().map(|d| d.len() as f32).sum::<f32>() / n;

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for term in query_terms {
            let df = documents.iter().filter(|d| d.iter().any(|t| t == term)).count();
            doc_freq.insert(term.as_str(), df);
        }

        documents
            .iter()
            .map(|doc| self.score_one(query_terms, doc, &doc_freq, n, avg_len))
            .collect()
    }

    fn score_one(&self, query_terms: &[String], doc: &[String], doc_freq: &HashMap<&str, usize>, n: f32, avg_len: f32) -> f32 {
        let doc_len = doc.len() as f32;
        let mut term_freq: HashMap<&str, usize> = HashMap::new();
        for t in doc {
            *term_freq.entry(t.as_str()).or_insert(0) += 1;
        }

        let mut score = 0.0f32;
        for term in query_terms {
            let tf = *term_freq.get(term.as_str()).unwrap_or(&0) as f32;
            if tf == 0.0 {
                continue;
            }
            let df = *doc_freq.get(term.as_str()).unwrap_or(&0) as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            let numerator = tf * (self.k1 + 1.0);
            let denominator = tf + self.k1 * (1.0 - self.b + self.b * (doc_len / avg_len));
            score += idf * (numerator / denominator);
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_stopwords;

    fn stopwords() -> HashSet<String> {
        default_stopwords().into_iter().collect()
    }

    #[test]
    fn tokenize_drops_stopwords_and_punctuation() {
        let tokens = tokenize("The quick, brown fox!", &stopwords());
        assert_eq!(tokens, vec!["quick", "brown", "fox"]);
    }

    #[test]
    fn scores_documents_with_more_term_overlap_higher() {
        let scorer = Bm25Scorer::new(1.5, 0.75);
        let sw = stopwords();
        let query = vec!["quick".to_string(), "fox".to_string()];
        let docs = vec![
            tokenize("the quick brown fox", &sw),
            tokenize("quick foxes jump", &sw),
            tokenize("unrelated content about nothing", &sw),
        ];
        let scores = scorer.score_all(&query, &docs);
        assert!(scores[0] > scores[2]);
        assert!(scores[1] > scores[2]);
    }

    #[test]
    fn empty_candidate_set_yields_empty_scores() {
        let scorer = Bm25Scorer::new(1.5, 0.75);
        let scores = scorer.score_all(&["x".to_string()], &[]);
        assert!(scores.is_empty());
    }

    #[test]
    fn term_absent_from_every_document_scores_zero() {
        let scorer = Bm25Scorer::new(1.5, 0.75);
        let sw = stopwords();
        let docs = vec![tokenize("alpha beta", &sw), tokenize("gamma delta", &sw)];
        let scores = scorer.score_all(&["zzz".to_string()], &docs);
        assert_eq!(scores, vec![0.0, 0.0]);
    }
}
