use std::collections::BTreeSet;

use crate::language::POS_CLASSES;
use crate::toolkit::DataPoint;
use crate::utterance::Utterance;

pub const OUT_OF_SCOPE_LABEL: &str = "out";
const IN_SCOPE_PREFIX: &str = "in_";
const MAX_WORD_COUNT: f32 = 10.0;

/// Features of the intent and context classifiers: the sentence embedding followed by one
/// indicator per entity
pub fn intent_features(
    utterance: &Utterance,
    entity_names: &[String],
    embedding_size: usize,
) -> Vec<f32> {
    let mut features = utterance.sentence_embedding();
    features.resize(embedding_size, 0.0);
    features.extend(entity_names.iter().map(|name| {
        if utterance.entities.iter().any(|e| e.entity_name == *name) {
            1.0
        } else {
            0.0
        }
    }));
    features
}

/// Features of the out of scope detector, which rely on the shape of the utterance more than
/// on its meaning
pub fn oos_features(
    utterance: &Utterance,
    training_vocab: &BTreeSet<String>,
    embedding_size: usize,
) -> Vec<f32> {
    let mut features = utterance.sentence_embedding();
    features.resize(embedding_size, 0.0);

    let non_space_tokens = utterance.tokens.iter().filter(|t| !t.is_space).collect::<Vec<_>>();
    let nb_tokens = non_space_tokens.len().max(1) as f32;
    features.extend(POS_CLASSES.iter().map(|pos| {
        non_space_tokens.iter().filter(|t| t.pos == *pos).count() as f32 / nb_tokens
    }));

    let words = non_space_tokens.iter().filter(|t| t.is_word).collect::<Vec<_>>();
    let in_vocab = words
        .iter()
        .filter(|t| training_vocab.contains(&t.normalized()))
        .count();
    features.push(in_vocab as f32 / words.len().max(1) as f32);
    features.push((words.len() as f32 / MAX_WORD_COUNT).min(1.0));
    features
}

pub fn in_scope_label(intent: &str) -> String {
    format!("{}{}", IN_SCOPE_PREFIX, intent)
}

pub fn featurize_in_scope_utterances(
    utterances: &[&Utterance],
    intent: &str,
    training_vocab: &BTreeSet<String>,
    embedding_size: usize,
) -> Vec<DataPoint> {
    utterances
        .iter()
        .map(|u| DataPoint {
            label: in_scope_label(intent),
            coordinates: oos_features(u, training_vocab, embedding_size),
        })
        .collect()
}

pub fn featurize_oos_utterances(
    utterances: &[Utterance],
    training_vocab: &BTreeSet<String>,
    embedding_size: usize,
) -> Vec<DataPoint> {
    utterances
        .iter()
        .map(|u| DataPoint {
            label: OUT_OF_SCOPE_LABEL.to_string(),
            coordinates: oos_features(u, training_vocab, embedding_size),
        })
        .collect()
}

/// Size of the token vectors of the utterances
pub fn embedding_size<'a, I: IntoIterator<Item = &'a Utterance>>(utterances: I) -> usize {
    utterances
        .into_iter()
        .flat_map(|u| u.tokens.iter())
        .map(|t| t.vector.len())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use itertools::Itertools;

    use crate::entities::EntityKind;
    use crate::language::POS_SPACE;
    use crate::testutils::entity;

    fn utterance(text: &str) -> Utterance {
        let raw = text.split(' ').map(|t| t.to_string()).collect_vec();
        let mut utterance = Utterance::new(text, &raw, "en");
        for (i, token) in utterance.tokens.iter_mut().enumerate() {
            token.vector = vec![i as f32 + 1.0, 1.0];
            token.pos = if token.is_space {
                POS_SPACE.to_string()
            } else {
                "NOUN".to_string()
            };
        }
        utterance
    }

    #[test]
    fn test_intent_features_flag_entities() {
        // Given
        let mut utterance = utterance("fly to paris");
        utterance.tag_entity(entity("city", EntityKind::List, "paris", 7..12));

        // When
        let features = intent_features(
            &utterance,
            &["airline".to_string(), "city".to_string()],
            3,
        );

        // Then
        assert_eq!(5, features.len());
        assert_eq!(0.0, features[2]);
        assert_eq!(&[0.0, 1.0], &features[3..]);
    }

    #[test]
    fn test_oos_features() {
        // Given
        let utterance = utterance("book a flight");
        let vocab = vec!["book".to_string(), "flight".to_string()]
            .into_iter()
            .collect::<BTreeSet<_>>();

        // When
        let features = oos_features(&utterance, &vocab, 2);

        // Then
        assert_eq!(2 + POS_CLASSES.len() + 2, features.len());
        let noun_index = 2 + POS_CLASSES.iter().position(|p| *p == "NOUN").unwrap();
        assert_eq!(1.0, features[noun_index]);
        assert!((features[features.len() - 2] - 2.0 / 3.0).abs() < 1e-6);
        assert!((features[features.len() - 1] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_labels() {
        let points = featurize_oos_utterances(&[utterance("hello")], &BTreeSet::new(), 2);
        assert_eq!(OUT_OF_SCOPE_LABEL, points[0].label);
        assert_eq!("in_fly", in_scope_label("fly"));
    }
}
