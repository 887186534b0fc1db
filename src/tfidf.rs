use std::collections::{BTreeMap, HashMap, HashSet};

use serde_derive::{Deserialize, Serialize};

use crate::utils::mean;

const MIN_IDF: f32 = 0.25;

/// Token weights averaged over all the documents containing each token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TfidfTable(BTreeMap<String, f32>);

impl TfidfTable {
    pub fn weight(&self, token: &str) -> Option<f32> {
        self.0.get(token).cloned()
    }

    /// Weight given to tokens absent from the table
    pub fn average(&self) -> f32 {
        if self.0.is_empty() {
            1.0
        } else {
            mean(self.0.values().cloned())
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f32)> {
        self.0.iter()
    }
}

/// Computes the TF-IDF of every token of every document, a document being the multiset of
/// tokens of one intent
pub fn compute_tfidf(documents: &BTreeMap<String, Vec<String>>) -> TfidfTable {
    let nb_documents = documents.len() as f32;
    let document_frequencies: HashMap<&str, usize> = documents
        .values()
        .flat_map(|tokens| tokens.iter().map(|t| t.as_str()).collect::<HashSet<_>>())
        .fold(HashMap::new(), |mut df, token| {
            *df.entry(token).or_insert(0) += 1;
            df
        });

    let mut sums: BTreeMap<String, (f32, usize)> = BTreeMap::new();
    for tokens in documents.values() {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in tokens {
            *counts.entry(token.as_str()).or_insert(0) += 1;
        }
        let max_count = counts.values().cloned().max().unwrap_or(1) as f32;
        for (token, count) in counts {
            let tf = 0.5 + 0.5 * count as f32 / max_count;
            let df = document_frequencies.get(token).cloned().unwrap_or(1) as f32;
            let idf = (nb_documents / df).ln().max(MIN_IDF);
            let entry = sums.entry(token.to_string()).or_insert((0.0, 0));
            entry.0 += tf * idf;
            entry.1 += 1;
        }
    }

    TfidfTable(
        sums.into_iter()
            .map(|(token, (sum, count))| (token, sum / count as f32))
            .collect(),
    )
}
