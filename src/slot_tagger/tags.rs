use std::collections::HashMap;
use std::ops::Range;

use serde_derive::{Deserialize, Serialize};

use super::features::non_space_indexes;
use crate::entities::EntityExtraction;
use crate::models::SlotDefinition;
use crate::utils::{substring_with_char_range, SlotName};
use crate::utterance::Utterance;

pub const OUTSIDE: &str = "o";
const BEGINNING_PREFIX: &str = "B";
const INSIDE_PREFIX: &str = "I";
/// Suffix of the labels of slot tokens which are not covered by any entity
const ANY_SUFFIX: &str = "/any";
const MIN_SLOT_CONFIDENCE: f32 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Beginning,
    Inside,
    Outside,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagResult {
    pub tag: Tag,
    pub name: SlotName,
    pub probability: f32,
}

impl TagResult {
    fn outside(probability: f32) -> Self {
        Self {
            tag: Tag::Outside,
            name: "".to_string(),
            probability,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSlot {
    pub name: SlotName,
    pub confidence: f32,
    pub source: String,
    pub value: String,
    pub char_start: usize,
    pub char_end: usize,
    pub entity: Option<EntityExtraction>,
}

impl ExtractedSlot {
    pub fn char_range(&self) -> Range<usize> {
        self.char_start..self.char_end
    }
}

/// BIO label of every non space token of a training utterance
pub fn labelize_utterance(utterance: &Utterance) -> Vec<String> {
    non_space_indexes(utterance)
        .into_iter()
        .map(|index| match utterance.token_slot(index) {
            None => OUTSIDE.to_string(),
            Some(slot) => {
                let prefix = if slot.start_token == index {
                    BEGINNING_PREFIX
                } else {
                    INSIDE_PREFIX
                };
                let suffix = if utterance.token_entities(index).is_empty() {
                    ANY_SUFFIX
                } else {
                    ""
                };
                format!("{}-{}{}", prefix, slot.name, suffix)
            }
        })
        .collect()
}

/// Most probable tag of a token, the probability of a label without entity being added to the
/// probability of the same label with an entity
pub fn prediction_to_tag(marginal: &HashMap<String, f32>) -> Option<TagResult> {
    let mut labels = marginal.keys().collect::<Vec<_>>();
    labels.sort();
    let (label, probability) = labels
        .into_iter()
        .map(|label| {
            let any = marginal
                .get(&format!("{}{}", label, ANY_SUFFIX))
                .cloned()
                .unwrap_or(0.0);
            (label, marginal[label] + any)
        })
        .fold(None, |best: Option<(&String, f32)>, (label, p)| match best {
            Some((_, best_p)) if best_p >= p => best,
            _ => Some((label, p)),
        })?;

    let tag = if label.starts_with(BEGINNING_PREFIX) {
        Tag::Beginning
    } else if label.starts_with(INSIDE_PREFIX) {
        Tag::Inside
    } else {
        return Some(TagResult::outside(probability));
    };
    let name = label
        .get(2..)
        .unwrap_or("")
        .trim_end_matches(ANY_SUFFIX)
        .to_string();
    Some(TagResult {
        tag,
        name,
        probability,
    })
}

/// Turns unlikely tags, and tags of slots the intent does not declare, into outside tags
pub fn remove_invalid_tags(slot_definitions: &[SlotDefinition], tag: TagResult) -> TagResult {
    if tag.tag == Tag::Outside {
        return tag;
    }
    let declared = slot_definitions.iter().any(|s| s.name == tag.name);
    if tag.probability < MIN_SLOT_CONFIDENCE || !declared {
        return TagResult::outside(1.0 - tag.probability);
    }
    tag
}

/// Merges consecutive tags of a same slot into slots, and binds them to the entities they
/// match
pub fn make_extracted_slots(
    slot_definitions: &[SlotDefinition],
    utterance: &Utterance,
    tags: &[TagResult],
) -> Vec<ExtractedSlot> {
    let text = utterance.text();
    let mut slots: Vec<ExtractedSlot> = vec![];
    for (index, tag) in non_space_indexes(utterance).into_iter().zip(tags.iter()) {
        if tag.tag == Tag::Outside {
            continue;
        }
        let token = &utterance.tokens[index];
        let token_range = token.char_range();
        match slots.last_mut() {
            Some(last) if tag.tag == Tag::Inside && last.name == tag.name => {
                last.char_end = token_range.end;
                last.source = substring_with_char_range(&text, &last.char_range());
                last.value = last.source.clone();
            }
            _ => slots.push(ExtractedSlot {
                name: tag.name.clone(),
                confidence: tag.probability,
                source: token.value.clone(),
                value: token.value.clone(),
                char_start: token_range.start,
                char_end: token_range.end,
                entity: None,
            }),
        }
    }

    for slot in slots.iter_mut() {
        let slot_entities = slot_definitions
            .iter()
            .find(|s| s.name == slot.name)
            .map(|s| s.entities.as_slice())
            .unwrap_or(&[]);
        let bound = utterance.entities.iter().find(|e| {
            let contains_slot = e.char_start <= slot.char_start && e.char_end >= slot.char_end;
            let within_slot = e.char_start >= slot.char_start && e.char_end <= slot.char_end;
            (contains_slot || within_slot) && slot_entities.contains(&e.entity_name)
        });
        if let Some(entity) = bound {
            slot.value = entity.value.clone();
            slot.entity = Some(entity.clone());
        }
    }
    slots
}
