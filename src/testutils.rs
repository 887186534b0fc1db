use std::collections::HashMap;
use std::iter::FromIterator;
use std::ops::Range;

use async_trait::async_trait;

use crate::entities::{EntityExtraction, EntityKind};
use crate::errors::*;
use crate::language::{LanguageServerSpecs, LanguageTools, ProgressFn, SystemEntityExtractor};

pub const FAKE_DIMENSIONS: usize = 8;

pub fn assert_epsilon_eq(a: f32, b: f32, epsilon: f32) {
    assert!(epsilon_eq(a, b, epsilon), "{} != {}", a, b)
}

pub fn epsilon_eq(a: f32, b: f32, epsilon: f32) -> bool {
    let diff = a - b;
    diff < epsilon && diff > -epsilon
}

pub fn entity(name: &str, kind: EntityKind, value: &str, range: Range<usize>) -> EntityExtraction {
    EntityExtraction {
        entity_name: name.to_string(),
        kind,
        value: value.to_string(),
        source: value.to_string(),
        confidence: 1.0,
        char_start: range.start,
        char_end: range.end,
        sensitive: false,
    }
}

/// Deterministic language tools: whitespace tokenization with explicit space tokens and
/// vectors derived from a hash of the lowercased word
pub struct FakeLanguageTools {
    pub stop_words: Vec<String>,
    pub identified_language: Option<String>,
    /// drops the last token list of every tokenization
    pub drop_last_tokenization: bool,
}

impl Default for FakeLanguageTools {
    fn default() -> Self {
        Self {
            stop_words: vec!["a", "the", "this", "to"]
                .into_iter()
                .map(|w| w.to_string())
                .collect(),
            identified_language: Some("en".to_string()),
            drop_last_tokenization: false,
        }
    }
}

pub fn fake_vector(word: &str) -> Vec<f32> {
    let digest = md5::compute(word.to_lowercase().as_bytes());
    digest
        .0
        .iter()
        .take(FAKE_DIMENSIONS)
        .map(|b| *b as f32 / 255.0 - 0.5)
        .collect()
}

fn fake_pos(word: &str, stop_words: &[String]) -> String {
    if stop_words.iter().any(|w| w == &word.to_lowercase()) {
        "DET".to_string()
    } else if word.chars().all(|c| c.is_numeric()) {
        "NUM".to_string()
    } else if word.chars().all(char::is_alphanumeric) {
        "NOUN".to_string()
    } else {
        "PUNCT".to_string()
    }
}

#[async_trait]
impl LanguageTools for FakeLanguageTools {
    async fn tokenize(&self, utterances: &[String], _language: &str) -> Result<Vec<Vec<String>>> {
        let kept = if self.drop_last_tokenization {
            utterances.len().saturating_sub(1)
        } else {
            utterances.len()
        };
        Ok(utterances[..kept]
            .iter()
            .map(|u| {
                let mut tokens = vec![];
                for (index, word) in u.split_whitespace().enumerate() {
                    if index > 0 {
                        tokens.push(" ".to_string());
                    }
                    tokens.push(word.to_string());
                }
                tokens
            })
            .collect())
    }

    async fn vectorize(&self, tokens: &[String], _language: &str) -> Result<Vec<Vec<f32>>> {
        Ok(tokens.iter().map(|t| fake_vector(t)).collect())
    }

    async fn pos_tag(&self, tokens: &[Vec<String>], _language: &str) -> Result<Vec<Vec<String>>> {
        Ok(tokens
            .iter()
            .map(|words| words.iter().map(|w| fake_pos(w, &self.stop_words)).collect())
            .collect())
    }

    async fn stop_words(&self, _language: &str) -> Result<Vec<String>> {
        Ok(self.stop_words.clone())
    }

    async fn identify_language(&self, _text: &str) -> Result<Option<String>> {
        Ok(self.identified_language.clone())
    }

    fn languages(&self) -> Vec<String> {
        vec!["en".to_string(), "fr".to_string()]
    }

    fn specifications(&self) -> LanguageServerSpecs {
        LanguageServerSpecs {
            dimensions: FAKE_DIMENSIONS,
            domain: "test".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

#[derive(Default)]
pub struct MockedSystemEntityExtractor {
    mocked_outputs: HashMap<String, Vec<EntityExtraction>>,
}

#[async_trait]
impl SystemEntityExtractor for MockedSystemEntityExtractor {
    async fn extract_multiple(
        &self,
        texts: &[String],
        _language: &str,
        progress: ProgressFn<'_>,
        _use_cache: bool,
    ) -> Result<Vec<Vec<EntityExtraction>>> {
        progress(1.0);
        Ok(texts
            .iter()
            .map(|t| self.mocked_outputs.get(t).cloned().unwrap_or_default())
            .collect())
    }
}

impl FromIterator<(String, Vec<EntityExtraction>)> for MockedSystemEntityExtractor {
    fn from_iter<T: IntoIterator<Item = (String, Vec<EntityExtraction>)>>(iter: T) -> Self {
        Self {
            mocked_outputs: HashMap::from_iter(iter),
        }
    }
}
