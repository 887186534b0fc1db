mod dataset;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use failure::ResultExt;
use serde_derive::{Deserialize, Serialize};

use crate::entities::ColdListEntityModel;
use crate::errors::*;
use crate::model_id::ModelId;
use crate::tfidf::TfidfTable;
use crate::toolkit::KmeansResult;
use crate::training::TrainOutput;
use crate::utils::{ContextName, IntentName};

pub use self::dataset::*;

/// Serialized trained model: plain JSON metadata, and hex encoded binary sub models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    /// milliseconds since the unix epoch
    pub started_at: u64,
    pub finished_at: u64,
    pub data: ModelData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    pub language: String,
    pub intents: Vec<IntentDefinition>,
    pub contexts: Vec<ContextName>,
    pub list_entities: Vec<ColdListEntityModel>,
    pub pattern_entities: Vec<PatternEntityDefinition>,
    pub tfidf: TfidfTable,
    pub vocab: Vec<String>,
    pub kmeans: Option<KmeansResult>,
    pub ctx_model: String,
    pub intent_model_by_ctx: String,
    pub slots_model_by_intent: String,
}

impl Model {
    pub fn new(id: &ModelId, started_at: u64, output: &TrainOutput) -> Result<Self> {
        Ok(Self {
            id: id.to_string(),
            started_at,
            finished_at: now_millis(),
            data: ModelData::encode(output)?,
        })
    }

    pub fn model_id(&self) -> Result<ModelId> {
        Ok(self.id.parse()?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = fs::File::open(&path)
            .with_context(|_| format!("Could not open model file {:?}", path.as_ref()))?;
        let model = serde_json::from_reader(file)
            .with_context(|_| format!("Could not deserialize model file {:?}", path.as_ref()))?;
        Ok(model)
    }

    pub fn to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = fs::File::create(&path)
            .with_context(|_| format!("Could not create model file {:?}", path.as_ref()))?;
        serde_json::to_writer(file, self)
            .with_context(|_| format!("Could not serialize model to {:?}", path.as_ref()))?;
        Ok(())
    }
}

impl ModelData {
    pub fn encode(output: &TrainOutput) -> Result<Self> {
        Ok(Self {
            language: output.language.clone(),
            intents: output.intents.clone(),
            contexts: output.contexts.clone(),
            list_entities: output.list_entities.clone(),
            pattern_entities: output.pattern_entities.clone(),
            tfidf: output.tfidf.clone(),
            vocab: output.vocab.clone(),
            kmeans: output.kmeans.clone(),
            ctx_model: hex::encode(&output.ctx_model),
            intent_model_by_ctx: encode_payload(&output.intent_model_by_ctx)?,
            slots_model_by_intent: encode_payload(&output.slots_model_by_intent)?,
        })
    }

    pub fn decode(&self) -> Result<TrainOutput> {
        let ctx_model = hex::decode(&self.ctx_model)
            .map_err(|e| model_loading_error("ContextClassifier", e.into()))?;
        let intent_model_by_ctx: BTreeMap<ContextName, Vec<u8>> =
            decode_payload(&self.intent_model_by_ctx)
                .map_err(|e| model_loading_error("IntentClassifiers", e))?;
        let slots_model_by_intent: BTreeMap<IntentName, Vec<u8>> =
            decode_payload(&self.slots_model_by_intent)
                .map_err(|e| model_loading_error("SlotTaggers", e))?;
        Ok(TrainOutput {
            language: self.language.clone(),
            intents: self.intents.clone(),
            list_entities: self.list_entities.clone(),
            pattern_entities: self.pattern_entities.clone(),
            contexts: self.contexts.clone(),
            tfidf: self.tfidf.clone(),
            vocab: self.vocab.clone(),
            kmeans: self.kmeans.clone(),
            ctx_model,
            intent_model_by_ctx,
            slots_model_by_intent,
        })
    }
}

fn encode_payload(models: &BTreeMap<String, Vec<u8>>) -> Result<String> {
    Ok(hex::encode(bincode::serialize(models)?))
}

fn decode_payload(payload: &str) -> Result<BTreeMap<String, Vec<u8>>> {
    let bytes = hex::decode(payload)?;
    Ok(bincode::deserialize(&bytes)?)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use maplit::btreemap;

    fn output() -> TrainOutput {
        TrainOutput {
            language: "en".to_string(),
            intents: vec![],
            list_entities: vec![],
            pattern_entities: vec![],
            contexts: vec!["global".to_string()],
            tfidf: TfidfTable::default(),
            vocab: vec!["flight".to_string()],
            kmeans: None,
            ctx_model: vec![1, 2, 3],
            intent_model_by_ctx: btreemap! { "global".to_string() => vec![4, 5] },
            slots_model_by_intent: btreemap! { "fly".to_string() => vec![6] },
        }
    }

    fn model_id() -> ModelId {
        "0123456789abcdef.fedcba9876543210.42.en".parse().unwrap()
    }

    #[test]
    fn test_binary_payloads_are_hex_encoded() {
        // When
        let data = ModelData::encode(&output()).unwrap();

        // Then
        assert_eq!("010203", data.ctx_model);
        assert!(data
            .intent_model_by_ctx
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
        assert_eq!(output(), data.decode().unwrap());
    }

    #[test]
    fn test_corrupted_payload_fails_with_component_name() {
        // Given
        let mut data = ModelData::encode(&output()).unwrap();
        data.slots_model_by_intent = "zz".to_string();

        // When
        let error = data.decode().unwrap_err();

        // Then
        assert!(error.to_string().starts_with("SlotTaggers could not load model"));
    }

    #[test]
    fn test_model_file_round_trip() {
        // Given
        let model = Model::new(&model_id(), 0, &output()).unwrap();
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("model.json");

        // When
        model.to_path(&path).unwrap();
        let loaded = Model::from_path(&path).unwrap();

        // Then
        assert_eq!(model, loaded);
        assert_eq!(model_id(), loaded.model_id().unwrap());
    }

    #[test]
    fn test_missing_model_file() {
        let error = Model::from_path("/does/not/exist.json").unwrap_err();
        assert!(error.to_string().contains("Could not open model file"));
    }
}
