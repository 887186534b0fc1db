pub mod extraction;
pub mod fuzzy;
pub mod list;
pub mod pattern;

use std::ops::Range;

use serde_derive::{Deserialize, Serialize};

use crate::utils::EntityName;

pub use self::extraction::EntityExtractors;
pub use self::list::{make_list_entity_model, ColdListEntityModel, ListEntityModel};
pub use self::pattern::PatternEntityModel;

/// Replacement of the source of sensitive entities and slots in predictions
pub const SENSITIVE_MASK: &str = "*****";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    System,
    List,
    Pattern,
}

/// Entity found in an utterance, positioned with char offsets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityExtraction {
    pub entity_name: EntityName,
    pub kind: EntityKind,
    /// resolved value, e.g. the canonical value of a list entity
    pub value: String,
    pub source: String,
    pub confidence: f32,
    pub char_start: usize,
    pub char_end: usize,
    #[serde(default)]
    pub sensitive: bool,
}

impl EntityExtraction {
    pub fn char_range(&self) -> Range<usize> {
        self.char_start..self.char_end
    }

    pub fn masked(&self) -> Self {
        if !self.sensitive {
            return self.clone();
        }
        Self {
            source: SENSITIVE_MASK.to_string(),
            value: SENSITIVE_MASK.to_string(),
            ..self.clone()
        }
    }
}
