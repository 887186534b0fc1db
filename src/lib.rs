mod clustering;
pub mod config;
mod engine;
pub mod entities;
pub mod errors;
mod intent_classifier;
pub mod language;
pub mod model_id;
pub mod models;
mod predict;
mod slot_tagger;
#[cfg(test)]
mod testutils;
mod tfidf;
pub mod toolkit;
mod training;
mod utils;
mod utterance;
mod watchdog;
mod worker;

/// Version of the engine, part of the specification hash of the model ids
pub const MODEL_VERSION: &str = "0.1.0";

pub use crate::config::{EngineConfig, RetryConfig};
pub use crate::engine::{NluEngine, TrainingOptions, NA_LANGUAGE};
pub use crate::entities::{EntityExtraction, EntityKind};
pub use crate::errors::*;
pub use crate::language::{LanguageServerSpecs, LanguageTools, SystemEntityExtractor};
pub use crate::model_id::{ModelId, Specifications};
pub use crate::models::*;
pub use crate::predict::{ContextPrediction, IntentResult, PredictOutput};
pub use crate::slot_tagger::ExtractedSlot;
pub use crate::toolkit::MlToolkit;
pub use crate::training::ProgressCallback;
