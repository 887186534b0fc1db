use std::collections::HashMap;
use std::ops::Range;

use failure::bail;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;

use crate::clustering::KmeansModel;
use crate::entities::EntityExtraction;
use crate::errors::*;
use crate::language::{LanguageTools, POS_SPACE, POS_UNAVAILABLE};
use crate::tfidf::TfidfTable;
use crate::utils::{ranges_overlap, replace_consecutive_spaces, SlotName};

/// Space marker used by language servers in front of words
pub const SPACE: char = '\u{2581}';

lazy_static! {
    static ref SLOT_MARKUP: Regex = Regex::new(r"\[([^\[\]\(\)]+?)\]\(([^\[\]\(\)]+?)\)").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub value: String,
    /// offset in chars of the token in the utterance
    pub offset: usize,
    pub vector: Vec<f32>,
    pub pos: String,
    pub tfidf: f32,
    pub cluster: usize,
    pub is_space: bool,
    pub is_word: bool,
}

impl Token {
    fn new(value: String, offset: usize) -> Self {
        let is_space = value.chars().all(|c| c.is_whitespace() || c == SPACE);
        let is_word = !is_space && value.chars().all(char::is_alphanumeric);
        Self {
            value,
            offset,
            vector: vec![],
            pos: POS_UNAVAILABLE.to_string(),
            tfidf: 1.0,
            cluster: 0,
            is_space,
            is_word,
        }
    }

    pub fn char_range(&self) -> Range<usize> {
        self.offset..self.offset + self.value.chars().count()
    }

    pub fn normalized(&self) -> String {
        self.value.to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceSlot {
    pub name: SlotName,
    pub source: String,
    pub char_range: Range<usize>,
    /// inclusive token indexes
    pub start_token: usize,
    pub end_token: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityRendering {
    Keep,
    ReplaceWithName,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotRendering {
    Keep,
    ReplaceWithName,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToStringOptions {
    pub lowercase: bool,
    pub only_words: bool,
    pub entities: EntityRendering,
    pub slots: SlotRendering,
}

impl Default for ToStringOptions {
    fn default() -> Self {
        Self {
            lowercase: false,
            only_words: false,
            entities: EntityRendering::Keep,
            slots: SlotRendering::Keep,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub language: String,
    pub tokens: Vec<Token>,
    pub entities: Vec<EntityExtraction>,
    pub slots: Vec<UtteranceSlot>,
}

impl Utterance {
    /// Aligns the tokens returned by a tokenizer on the text they come from. Text which is not
    /// covered by any token, like separating spaces, becomes a token of its own.
    pub fn new(text: &str, raw_tokens: &[String], language: &str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let mut tokens = vec![];
        let mut cursor = 0;
        for raw_token in raw_tokens {
            let cleaned: Vec<char> = raw_token
                .chars()
                .filter(|c| *c != SPACE && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                continue;
            }
            if let Some(position) = find_chars(&chars, &cleaned, cursor) {
                if position > cursor {
                    tokens.push(Token::new(chars[cursor..position].iter().collect(), cursor));
                }
                let end = position + cleaned.len();
                tokens.push(Token::new(chars[position..end].iter().collect(), position));
                cursor = end;
            }
        }
        if cursor < chars.len() {
            tokens.push(Token::new(chars[cursor..].iter().collect(), cursor));
        }
        Self {
            language: language.to_string(),
            tokens,
            entities: vec![],
            slots: vec![],
        }
    }

    pub fn text(&self) -> String {
        self.tokens.iter().map(|t| t.value.as_str()).collect()
    }

    pub fn to_string(&self, options: &ToStringOptions) -> String {
        let mut rendered = String::new();
        let mut replaced_ranges: Vec<Range<usize>> = vec![];
        for token in &self.tokens {
            let token_range = token.char_range();
            if replaced_ranges
                .iter()
                .any(|r| ranges_overlap(r, &token_range))
            {
                continue;
            }
            let replacement = match (options.entities, options.slots) {
                (EntityRendering::ReplaceWithName, _) => self
                    .entities
                    .iter()
                    .find(|e| ranges_overlap(&e.char_range(), &token_range))
                    .map(|e| (e.char_range(), e.entity_name.clone())),
                _ => None,
            }
            .or_else(|| match options.slots {
                SlotRendering::ReplaceWithName => self
                    .slots
                    .iter()
                    .find(|s| ranges_overlap(&s.char_range, &token_range))
                    .map(|s| (s.char_range.clone(), s.name.clone())),
                SlotRendering::Keep => None,
            });
            if let Some((range, name)) = replacement {
                replaced_ranges.push(range);
                rendered.push_str(&name);
                continue;
            }
            if options.only_words && !token.is_word {
                continue;
            }
            if options.lowercase {
                rendered.push_str(&token.normalized());
            } else {
                rendered.push_str(&token.value);
            }
        }
        rendered
    }

    pub fn set_global_tfidf(&mut self, tfidf: &TfidfTable) {
        let default_weight = tfidf.average();
        for token in self.tokens.iter_mut() {
            token.tfidf = tfidf.weight(&token.normalized()).unwrap_or(default_weight);
        }
    }

    pub fn set_kmeans(&mut self, kmeans: Option<&KmeansModel>) {
        if let Some(kmeans) = kmeans {
            for token in self.tokens.iter_mut() {
                token.cluster = kmeans.nearest(&token.vector);
            }
        }
    }

    /// Attaches an entity, ignoring exact duplicates
    pub fn tag_entity(&mut self, entity: EntityExtraction) {
        if !self.entities.contains(&entity) {
            self.entities.push(entity);
        }
    }

    /// Attaches a slot covering the given char range. Ranges not covering any token are ignored.
    pub fn tag_slot(&mut self, name: &str, char_range: Range<usize>) {
        let covered = self
            .tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_space && ranges_overlap(&t.char_range(), &char_range))
            .map(|(idx, _)| idx)
            .collect_vec();
        if let (Some(start_token), Some(end_token)) = (covered.first(), covered.last()) {
            let source: String = self.text().chars().skip(char_range.start).take(char_range.len()).collect();
            self.slots.push(UtteranceSlot {
                name: name.to_string(),
                source,
                char_range,
                start_token: *start_token,
                end_token: *end_token,
            });
        }
    }

    pub fn token_entities(&self, token_index: usize) -> Vec<&EntityExtraction> {
        match self.tokens.get(token_index) {
            Some(token) => {
                let range = token.char_range();
                self.entities
                    .iter()
                    .filter(|e| ranges_overlap(&e.char_range(), &range))
                    .collect()
            }
            None => vec![],
        }
    }

    pub fn token_slot(&self, token_index: usize) -> Option<&UtteranceSlot> {
        self.slots
            .iter()
            .find(|s| s.start_token <= token_index && token_index <= s.end_token)
    }

    pub fn word_count(&self) -> usize {
        self.tokens.iter().filter(|t| t.is_word).count()
    }

    /// TF-IDF weighted average of the normalized vectors of the non space tokens
    pub fn sentence_embedding(&self) -> Vec<f32> {
        let dim = self.tokens.iter().map(|t| t.vector.len()).max().unwrap_or(0);
        let mut embedding = vec![0f32; dim];
        let mut total_weight = 0f32;
        for token in self.tokens.iter().filter(|t| !t.is_space) {
            let norm = l2_norm(&token.vector);
            if norm == 0.0 || token.vector.len() != dim {
                continue;
            }
            let weight = token.tfidf.min(2.0).max(0.0);
            total_weight += weight;
            for (e, x) in embedding.iter_mut().zip(token.vector.iter()) {
                *e += x / norm * weight;
            }
        }
        if total_weight > 0.0 {
            embedding.iter_mut().for_each(|e| *e /= total_weight);
        }
        let norm = l2_norm(&embedding);
        if norm > 0.0 {
            embedding.iter_mut().for_each(|e| *e /= norm);
        }
        embedding
    }
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSlot {
    pub name: SlotName,
    pub value: String,
    pub char_range: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUtterance {
    pub text: String,
    pub slots: Vec<ParsedSlot>,
}

/// Strips the `[source](slot)` markup of a training utterance
pub fn parse_utterance(raw: &str) -> ParsedUtterance {
    let cleaned = replace_consecutive_spaces(raw);
    let mut text = String::new();
    let mut slots = vec![];
    let mut last_end = 0;
    for caps in SLOT_MARKUP.captures_iter(&cleaned) {
        let (whole, value, name) = match (caps.get(0), caps.get(1), caps.get(2)) {
            (Some(whole), Some(value), Some(name)) => (whole, value.as_str(), name.as_str()),
            _ => continue,
        };
        text.push_str(&cleaned[last_end..whole.start()]);
        let start = text.chars().count();
        text.push_str(value);
        slots.push(ParsedSlot {
            name: name.trim().to_string(),
            value: value.to_string(),
            char_range: start..start + value.chars().count(),
        });
        last_end = whole.end();
    }
    text.push_str(&cleaned[last_end..]);
    ParsedUtterance { text, slots }
}

/// Tokenizes, vectorizes and tags a batch of utterances written with slot markup
pub async fn build_utterance_batch(
    raw_utterances: &[String],
    language: &str,
    tools: &dyn LanguageTools,
    vocab: Option<&HashMap<String, Vec<f32>>>,
) -> Result<Vec<Utterance>> {
    if raw_utterances.is_empty() {
        return Ok(vec![]);
    }
    let parsed = raw_utterances
        .iter()
        .map(|u| parse_utterance(u))
        .collect_vec();
    let texts = parsed.iter().map(|p| p.text.clone()).collect_vec();
    let raw_tokens = tools.tokenize(&texts, language).await?;
    if raw_tokens.len() != texts.len() {
        bail!(
            "Tokenization returned {} token lists for {} utterances",
            raw_tokens.len(),
            texts.len()
        );
    }

    let mut utterances = parsed
        .iter()
        .zip(raw_tokens.iter())
        .map(|(p, tokens)| Utterance::new(&p.text, tokens, language))
        .collect_vec();

    let unknown_words = utterances
        .iter()
        .flat_map(|u| u.tokens.iter())
        .filter(|t| !t.is_space)
        .map(|t| t.normalized())
        .filter(|w| vocab.map(|v| !v.contains_key(w)).unwrap_or(true))
        .unique()
        .collect_vec();
    let vectors: HashMap<String, Vec<f32>> = if unknown_words.is_empty() {
        HashMap::new()
    } else {
        let word_vectors = tools.vectorize(&unknown_words, language).await?;
        if word_vectors.len() != unknown_words.len() {
            bail!(
                "Vectorization returned {} vectors for {} words",
                word_vectors.len(),
                unknown_words.len()
            );
        }
        unknown_words.iter().cloned().zip(word_vectors).collect()
    };
    let dimensions = tools.specifications().dimensions;

    let pos_tags = if tools.is_pos_available(language) {
        let words = utterances
            .iter()
            .map(|u| {
                u.tokens
                    .iter()
                    .filter(|t| !t.is_space)
                    .map(|t| t.value.clone())
                    .collect_vec()
            })
            .collect_vec();
        Some(tools.pos_tag(&words, language).await?)
    } else {
        None
    };

    for (utterance_index, utterance) in utterances.iter_mut().enumerate() {
        let mut tags = pos_tags
            .as_ref()
            .and_then(|tags| tags.get(utterance_index))
            .map(|tags| tags.iter());
        for token in utterance.tokens.iter_mut() {
            let normalized = token.normalized();
            token.vector = vocab
                .and_then(|v| v.get(&normalized))
                .or_else(|| vectors.get(&normalized))
                .cloned()
                .unwrap_or_else(|| vec![0.0; dimensions]);
            token.pos = if token.is_space {
                POS_SPACE.to_string()
            } else {
                tags.as_mut()
                    .and_then(|tags| tags.next())
                    .cloned()
                    .unwrap_or_else(|| POS_UNAVAILABLE.to_string())
            };
        }
    }

    for (utterance, parsed) in utterances.iter_mut().zip(parsed.iter()) {
        for slot in parsed.slots.iter() {
            utterance.tag_slot(&slot.name, slot.char_range.clone());
        }
    }
    Ok(utterances)
}

fn find_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&start| {
        haystack[start..start + needle.len()]
            .iter()
            .zip(needle.iter())
            .all(|(h, n)| h == n || h.to_lowercase().eq(n.to_lowercase()))
    })
}
