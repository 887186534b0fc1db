pub mod exact_match;
pub mod featurizer;
pub mod linear;
pub mod none_intent;
pub mod oos;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;

use crate::errors::*;
use crate::toolkit::MlToolkit;
use crate::utils::IntentName;
use crate::utterance::Utterance;

pub use self::exact_match::ExactMatchIntentClassifier;
pub use self::linear::LinearIntentClassifier;
pub use self::oos::{remove_none_intent, OosIntentClassifier};

/// Name of the synthetic intent gathering the utterances which belong to no intent
pub const NONE_INTENT: &str = "none";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentPrediction {
    pub name: IntentName,
    pub confidence: f32,
    pub extractor: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IntentPredictions {
    pub intents: Vec<IntentPrediction>,
    /// out of scope confidence
    pub oos: f32,
}

/// Group of training utterances sharing a label, an intent or a context
#[derive(Debug, Clone)]
pub struct LabeledUtterances<'a> {
    pub name: String,
    pub utterances: Vec<&'a Utterance>,
}

/// Trained component of a model. Its serialized form is loaded back together with the
/// solvers which run its predictions.
pub trait PipelineComponent: Sized {
    const NAME: &'static str;

    type Model: Serialize + DeserializeOwned;

    fn load(model: Self::Model, toolkit: &MlToolkit) -> Result<Self>;

    fn memory_size(&self) -> usize;

    fn from_bytes(bytes: &[u8], toolkit: &MlToolkit) -> Result<Self> {
        bincode::deserialize::<Self::Model>(bytes)
            .map_err(::failure::Error::from)
            .and_then(|model| Self::load(model, toolkit))
            .map_err(|e| model_loading_error(Self::NAME, e))
    }
}

pub fn serialize_model<M: Serialize>(model: &M) -> Result<Vec<u8>> {
    Ok(bincode::serialize(model)?)
}
