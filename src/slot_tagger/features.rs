use itertools::Itertools;

use super::IntentSlotFeatures;
use crate::utterance::{Token, Utterance};

const BOS: &str = "__BOS__";
const EOS: &str = "__EOS__";
const PAIRED_FEATURES: &[&str] = &["word", "vocab", "weight", "POS"];
const NB_QUARTILES: usize = 4;
const WEIGHT_BUCKET: f32 = 0.5;
const MAX_WEIGHT: f32 = 2.0;

#[derive(Debug, Clone, PartialEq)]
struct TokenFeature {
    name: &'static str,
    value: String,
}

impl TokenFeature {
    fn new<V: ToString>(name: &'static str, value: V) -> Self {
        Self {
            name,
            value: value.to_string(),
        }
    }

    fn to_attribute(&self, prefix: &str) -> String {
        format!("{}:{}={}", prefix, self.name, self.value)
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Features of the sequence tagger for every non space token of the utterance
pub fn sequence_features(intent: &IntentSlotFeatures, utterance: &Utterance) -> Vec<Vec<String>> {
    let indexes = non_space_indexes(utterance);
    (0..indexes.len())
        .map(|position| token_slice_features(intent, utterance, &indexes, position))
        .collect()
}

pub fn non_space_indexes(utterance: &Utterance) -> Vec<usize> {
    utterance
        .tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.is_space)
        .map(|(i, _)| i)
        .collect()
}

/// Features of a token and of its neighbours: two tokens before, one after
fn token_slice_features(
    intent: &IntentSlotFeatures,
    utterance: &Utterance,
    indexes: &[usize],
    position: usize,
) -> Vec<String> {
    let features_at = |pos: usize, skipped: &str| {
        token_features(intent, utterance, indexes, pos)
            .into_iter()
            .filter(|f| f.name != skipped)
            .collect_vec()
    };

    let current = features_at(position, "cluster");
    let previous = (1..=2)
        .filter(|offset| position >= *offset)
        .map(|offset| (offset, features_at(position - offset, "quartile")))
        .collect_vec();
    let next = Some(position + 1)
        .filter(|pos| *pos < indexes.len())
        .map(|pos| features_at(pos, "quartile"));

    let mut attributes = vec![];
    if position == 0 {
        attributes.push(BOS.to_string());
    }
    attributes.push(format!("intent={}", intent.name));
    for (offset, features) in previous.iter() {
        let prefix = format!("w[-{}]", offset);
        attributes.extend(features.iter().map(|f| f.to_attribute(&prefix)));
    }
    attributes.extend(current.iter().map(|f| f.to_attribute("w[0]")));
    if let Some(features) = next.as_ref() {
        attributes.extend(features.iter().map(|f| f.to_attribute("w[1]")));
    }
    if let Some((_, features)) = previous.first() {
        attributes.extend(feature_pairs(features, &current, "w[-1]|w[0]"));
    }
    if let Some(features) = next.as_ref() {
        attributes.extend(feature_pairs(&current, features, "w[0]|w[1]"));
    }
    if position + 1 == indexes.len() {
        attributes.push(EOS.to_string());
    }
    attributes
}

fn feature_pairs(left: &[TokenFeature], right: &[TokenFeature], prefix: &str) -> Vec<String> {
    PAIRED_FEATURES
        .iter()
        .filter_map(|name| {
            let l = left.iter().find(|f| f.name == *name)?;
            let r = right.iter().find(|f| f.name == *name)?;
            Some(format!("{}:{}={}|{}", prefix, name, l.value, r.value))
        })
        .collect()
}

fn token_features(
    intent: &IntentSlotFeatures,
    utterance: &Utterance,
    indexes: &[usize],
    position: usize,
) -> Vec<TokenFeature> {
    let token_index = indexes[position];
    let token: &Token = &utterance.tokens[token_index];
    let normalized = token.normalized();
    let space_before = token_index > 0 && utterance.tokens[token_index - 1].is_space;
    let weight_bucket = (token.tfidf.max(0.0).min(MAX_WEIGHT) / WEIGHT_BUCKET).floor() as usize;

    let mut features = vec![
        TokenFeature::new("quartile", position * NB_QUARTILES / indexes.len() + 1),
        TokenFeature::new("cluster", token.cluster),
        TokenFeature::new("weight", weight_bucket),
        TokenFeature::new("vocab", flag(intent.vocab.binary_search(&normalized).is_ok())),
        TokenFeature::new("space", flag(space_before)),
        TokenFeature::new("alpha", flag(token.value.chars().all(char::is_alphabetic))),
        TokenFeature::new("num", flag(token.value.chars().all(char::is_numeric))),
        TokenFeature::new("special", flag(token.value.chars().any(|c| !c.is_alphanumeric()))),
        TokenFeature::new("word", normalized),
        TokenFeature::new("POS", &token.pos),
    ];

    let entities = utterance
        .token_entities(token_index)
        .into_iter()
        .filter(|e| intent.slot_entities.contains(&e.entity_name))
        .map(|e| e.entity_name.clone())
        .unique()
        .sorted()
        .collect_vec();
    if entities.is_empty() {
        features.push(TokenFeature::new("entity", "none"));
    }
    features.extend(entities.into_iter().map(|e| TokenFeature::new("entity", e)));
    features
}
