use failure::ResultExt;
use log::warn;
use regex::{Regex, RegexBuilder};

use crate::entities::{EntityExtraction, EntityKind};
use crate::errors::*;
use crate::models::PatternEntityDefinition;

#[derive(Debug, Clone)]
pub struct PatternEntityModel {
    pub definition: PatternEntityDefinition,
    regex: Regex,
}

impl PatternEntityModel {
    pub fn new(definition: &PatternEntityDefinition) -> Result<Self> {
        let regex = RegexBuilder::new(&definition.regex)
            .case_insensitive(!definition.case_sensitive)
            .build()
            .with_context(|_| {
                format!(
                    "Invalid pattern '{}' for entity '{}'",
                    definition.regex, definition.name
                )
            })?;
        Ok(Self {
            definition: definition.clone(),
            regex,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn extract(&self, text: &str) -> Vec<EntityExtraction> {
        self.regex
            .find_iter(text)
            .filter(|m| !m.as_str().is_empty())
            .map(|m| {
                let char_start = text[..m.start()].chars().count();
                let char_end = char_start + m.as_str().chars().count();
                EntityExtraction {
                    entity_name: self.definition.name.clone(),
                    kind: EntityKind::Pattern,
                    value: m.as_str().to_string(),
                    source: m.as_str().to_string(),
                    confidence: 1.0,
                    char_start,
                    char_end,
                    sensitive: self.definition.sensitive,
                }
            })
            .collect()
    }

    pub fn memory_size(&self) -> usize {
        self.definition.regex.len()
            + self.definition.examples.iter().map(|e| e.len()).sum::<usize>()
    }
}

/// Compiles the patterns, leaving out the ones which are not valid regexes
pub fn compile_pattern_entities(definitions: &[PatternEntityDefinition]) -> Vec<PatternEntityModel> {
    definitions
        .iter()
        .filter_map(|definition| match PatternEntityModel::new(definition) {
            Ok(model) => Some(model),
            Err(e) => {
                warn!("Pattern entity '{}' is ignored: {}", definition.name, e);
                None
            }
        })
        .collect()
}
