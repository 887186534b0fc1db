use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde_derive::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::*;
use crate::language::LanguageServerSpecs;
use crate::models::TrainSet;

lazy_static! {
    static ref HALF_MD5: Regex = Regex::new(r"^[a-fA-F0-9]{16}$").unwrap();
    static ref LANGUAGE_CODE: Regex = Regex::new(r"^[a-z]{2}$").unwrap();
    static ref SEED: Regex = Regex::new(r"^\d+$").unwrap();
}

/// Everything which, besides the training data, influences the produced model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specifications {
    pub engine_version: String,
    pub language_server: LanguageServerSpecs,
}

/// Content addressed identifier of a model, rendered as
/// `contentHash.specificationHash.seed.languageCode`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    pub content_hash: String,
    pub specification_hash: String,
    pub seed: u64,
    pub language_code: String,
}

impl ModelId {
    pub fn make(train_set: &TrainSet, specifications: &Specifications) -> Result<Self> {
        let content = json!({
            "intents": train_set.intents,
            "entities": train_set.entities,
        });
        let specification = json!({ "specifications": specifications });
        Ok(Self {
            content_hash: half_md5(&serde_json::to_string(&content)?),
            specification_hash: half_md5(&serde_json::to_string(&specification)?),
            seed: train_set.seed,
            language_code: train_set.language.clone(),
        })
    }

    pub fn is_id(id: &str) -> bool {
        id.parse::<ModelId>().is_ok()
    }

    /// Same model trained on another language
    pub fn with_language(&self, language_code: &str) -> Self {
        Self {
            language_code: language_code.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.content_hash, self.specification_hash, self.seed, self.language_code
        )
    }
}

impl FromStr for ModelId {
    type Err = NluEngineError;

    fn from_str(id: &str) -> ::std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = id.split('.').collect();
        match parts.as_slice() {
            [content_hash, specification_hash, seed, language_code]
                if HALF_MD5.is_match(content_hash)
                    && HALF_MD5.is_match(specification_hash)
                    && SEED.is_match(seed)
                    && LANGUAGE_CODE.is_match(language_code) =>
            {
                let seed = seed
                    .parse()
                    .map_err(|_| NluEngineError::InvalidModelId(id.to_string()))?;
                Ok(Self {
                    content_hash: content_hash.to_string(),
                    specification_hash: specification_hash.to_string(),
                    seed,
                    language_code: language_code.to_string(),
                })
            }
            _ => Err(NluEngineError::InvalidModelId(id.to_string())),
        }
    }
}

fn half_md5(content: &str) -> String {
    let digest = md5::compute(content.as_bytes());
    let mut hash = hex::encode(digest.0);
    hash.truncate(16);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::{EntityDefinition, IntentDefinition, ListEntityDefinition, ListEntityValue};

    fn train_set() -> TrainSet {
        TrainSet {
            language: "en".to_string(),
            seed: 42,
            entities: vec![EntityDefinition::List(ListEntityDefinition {
                name: "city".to_string(),
                fuzzy: 1.0,
                sensitive: false,
                values: vec![ListEntityValue {
                    name: "paris".to_string(),
                    synonyms: vec!["city of light".to_string()],
                }],
            })],
            intents: vec![IntentDefinition {
                name: "fly".to_string(),
                contexts: vec!["global".to_string()],
                slots: vec![],
                utterances: vec!["book a flight".to_string()],
            }],
        }
    }

    fn specifications() -> Specifications {
        Specifications {
            engine_version: "1.0.0".to_string(),
            language_server: LanguageServerSpecs {
                dimensions: 300,
                domain: "bp".to_string(),
                version: "1.0.0".to_string(),
            },
        }
    }

    #[test]
    fn test_make_id_is_pure() {
        // When
        let id1 = ModelId::make(&train_set(), &specifications()).unwrap();
        let id2 = ModelId::make(&train_set(), &specifications()).unwrap();

        // Then
        assert_eq!(id1, id2);
        assert_eq!(16, id1.content_hash.len());
        assert_eq!(16, id1.specification_hash.len());
    }

    #[test]
    fn test_make_id_changes_with_any_field() {
        // Given
        let id = ModelId::make(&train_set(), &specifications()).unwrap();

        let mut other_intents = train_set();
        other_intents.intents[0].utterances.push("fly away".to_string());
        let mut other_seed = train_set();
        other_seed.seed = 43;
        let mut other_language = train_set();
        other_language.language = "fr".to_string();
        let mut other_specs = specifications();
        other_specs.language_server.dimensions = 100;

        // When
        let id_intents = ModelId::make(&other_intents, &specifications()).unwrap();
        let id_seed = ModelId::make(&other_seed, &specifications()).unwrap();
        let id_language = ModelId::make(&other_language, &specifications()).unwrap();
        let id_specs = ModelId::make(&train_set(), &other_specs).unwrap();

        // Then
        assert_ne!(id.content_hash, id_intents.content_hash);
        assert_ne!(id.seed, id_seed.seed);
        assert_ne!(id.language_code, id_language.language_code);
        assert_ne!(id.specification_hash, id_specs.specification_hash);
        assert_eq!(id.content_hash, id_specs.content_hash);
    }

    #[test]
    fn test_model_id_round_trips_through_string() {
        // Given
        let id = ModelId::make(&train_set(), &specifications()).unwrap();

        // When
        let string_id = id.to_string();
        let parsed: ModelId = string_id.parse().unwrap();

        // Then
        assert_eq!(id, parsed);
        assert!(string_id.ends_with(".42.en"));
        assert!(ModelId::is_id(&string_id));
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        assert!(!ModelId::is_id("abc.def.42.en"));
        assert!(!ModelId::is_id("0123456789abcdef.0123456789abcdef.42.eng"));
        assert!(!ModelId::is_id("0123456789abcdef.0123456789abcdef.seed.en"));
        assert!(!ModelId::is_id("0123456789abcdef.0123456789abcdef.42"));
        assert!(ModelId::is_id("0123456789abcdef.0123456789abcdef.42.en"));
    }

    #[test]
    fn test_with_language_only_changes_language_code() {
        // Given
        let id = ModelId::make(&train_set(), &specifications()).unwrap();

        // When
        let french_id = id.with_language("fr");

        // Then
        assert_eq!("fr", french_id.language_code);
        assert_eq!(id.content_hash, french_id.content_hash);
        assert!(french_id.to_string().ends_with(".42.fr"));
    }
}
