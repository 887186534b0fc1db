use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::utils::{ContextName, EntityName, IntentName, SlotName};

/// Labeled training data of one language, as provided by the caller of the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSet {
    pub language: String,
    pub seed: u64,
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    pub intents: Vec<IntentDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDefinition {
    pub name: IntentName,
    #[serde(default)]
    pub contexts: Vec<ContextName>,
    #[serde(default)]
    pub slots: Vec<SlotDefinition>,
    /// Utterances with slot markup, e.g. "fly to [paris](destination)"
    #[serde(default)]
    pub utterances: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotDefinition {
    pub name: SlotName,
    #[serde(default)]
    pub entities: Vec<EntityName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityDefinition {
    List(ListEntityDefinition),
    Pattern(PatternEntityDefinition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntityDefinition {
    pub name: EntityName,
    /// 1.0 means strict matching, lower values tolerate more typos
    #[serde(default = "default_fuzzy")]
    pub fuzzy: f64,
    #[serde(default)]
    pub sensitive: bool,
    pub values: Vec<ListEntityValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntityValue {
    pub name: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEntityDefinition {
    pub name: EntityName,
    pub regex: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub sensitive: bool,
}

fn default_fuzzy() -> f64 {
    1.0
}

impl ListEntityDefinition {
    /// canonical value -> synonyms
    pub fn synonyms(&self) -> BTreeMap<String, Vec<String>> {
        self.values
            .iter()
            .map(|v| (v.name.clone(), v.synonyms.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_train_set() {
        // Given
        let data = r#"{
            "language": "en",
            "seed": 42,
            "entities": [
                {
                    "type": "list",
                    "name": "city",
                    "fuzzy": 0.8,
                    "values": [{"name": "paris", "synonyms": ["city of light"]}]
                },
                {"type": "pattern", "name": "flight-number", "regex": "[A-Z]{2}\\d{3}"}
            ],
            "intents": [
                {
                    "name": "fly",
                    "contexts": ["global"],
                    "slots": [{"name": "destination", "entities": ["city"]}],
                    "utterances": ["fly to [paris](destination)"]
                }
            ]
        }"#;

        // When
        let train_set: TrainSet = serde_json::from_str(data).unwrap();

        // Then
        assert_eq!(2, train_set.entities.len());
        match &train_set.entities[0] {
            EntityDefinition::List(list) => {
                assert_eq!(0.8, list.fuzzy);
                assert!(!list.sensitive);
                assert_eq!(
                    vec!["city of light".to_string()],
                    list.synonyms()["paris"]
                );
            }
            _ => panic!("expected a list entity"),
        }
        match &train_set.entities[1] {
            EntityDefinition::Pattern(pattern) => assert!(!pattern.case_sensitive),
            _ => panic!("expected a pattern entity"),
        }
        assert_eq!("destination", train_set.intents[0].slots[0].name);
    }
}
