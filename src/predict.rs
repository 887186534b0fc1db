use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use failure::format_err;
use itertools::Itertools;
use log::debug;
use serde_derive::{Deserialize, Serialize};

use crate::clustering::KmeansModel;
use crate::entities::pattern::compile_pattern_entities;
use crate::entities::{
    EntityExtraction, EntityExtractors, ListEntityModel, PatternEntityModel, SENSITIVE_MASK,
};
use crate::errors::*;
use crate::intent_classifier::{LinearIntentClassifier, OosIntentClassifier, PipelineComponent};
use crate::language::{LanguageTools, SystemEntityExtractor};
use crate::slot_tagger::{ExtractedSlot, SlotTagger};
use crate::tfidf::TfidfTable;
use crate::toolkit::MlToolkit;
use crate::training::TrainOutput;
use crate::utils::{ContextName, IntentName};
use crate::utterance::{build_utterance_batch, Utterance};
use crate::worker::{CancellationToken, TaskQueue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictOutput {
    pub entities: Vec<EntityExtraction>,
    /// sorted by decreasing confidence
    pub contexts: Vec<ContextPrediction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPrediction {
    pub name: ContextName,
    pub confidence: f32,
    pub oos: f32,
    /// sorted by decreasing confidence
    pub intents: Vec<IntentResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub name: IntentName,
    pub confidence: f32,
    pub extractor: String,
    pub slots: Vec<ExtractedSlot>,
}

impl PredictOutput {
    pub fn top_intent(&self) -> Option<&IntentResult> {
        self.contexts
            .first()
            .and_then(|ctx| ctx.intents.first())
    }
}

/// Every component of a loaded model
pub struct Predictors {
    pub language: String,
    pub vocab: BTreeSet<String>,
    tfidf: TfidfTable,
    kmeans: Option<KmeansModel>,
    list_entities: Vec<Arc<ListEntityModel>>,
    pattern_entities: Arc<Vec<PatternEntityModel>>,
    ctx_classifier: LinearIntentClassifier,
    intent_classifier_by_ctx: BTreeMap<ContextName, OosIntentClassifier>,
    slot_tagger_by_intent: BTreeMap<IntentName, SlotTagger>,
}

impl Predictors {
    pub fn load(output: &TrainOutput, toolkit: &MlToolkit) -> Result<Self> {
        let kmeans = output
            .kmeans
            .as_ref()
            .map(KmeansModel::from_result)
            .transpose()
            .map_err(|e| model_loading_error("Kmeans", e))?;
        let ctx_classifier = LinearIntentClassifier::from_bytes(&output.ctx_model, toolkit)?;
        let intent_classifier_by_ctx = output
            .intent_model_by_ctx
            .iter()
            .map(|(ctx, bytes)| -> Result<_> {
                Ok((ctx.clone(), OosIntentClassifier::from_bytes(bytes, toolkit)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        let slot_tagger_by_intent = output
            .slots_model_by_intent
            .iter()
            .map(|(intent, bytes)| -> Result<_> {
                Ok((intent.clone(), SlotTagger::from_bytes(bytes, toolkit)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            language: output.language.clone(),
            vocab: output.vocab.iter().cloned().collect(),
            tfidf: output.tfidf.clone(),
            kmeans,
            list_entities: output
                .list_entities
                .iter()
                .map(|cold| Arc::new(ListEntityModel::from_cold(cold)))
                .collect(),
            pattern_entities: Arc::new(compile_pattern_entities(&output.pattern_entities)),
            ctx_classifier,
            intent_classifier_by_ctx,
            slot_tagger_by_intent,
        })
    }

    /// Estimated size in memory, in bytes
    pub fn memory_size(&self) -> usize {
        self.vocab.iter().map(|w| w.len()).sum::<usize>()
            + self.tfidf.iter().map(|(w, _)| w.len() + 4).sum::<usize>()
            + self.kmeans.as_ref().map(|k| k.memory_size()).unwrap_or(0)
            + self.list_entities.iter().map(|e| e.memory_size()).sum::<usize>()
            + self.pattern_entities.iter().map(|e| e.memory_size()).sum::<usize>()
            + self.ctx_classifier.memory_size()
            + self
                .intent_classifier_by_ctx
                .values()
                .map(|c| c.memory_size())
                .sum::<usize>()
            + self
                .slot_tagger_by_intent
                .values()
                .map(|t| t.memory_size())
                .sum::<usize>()
    }

    /// List entity models, their caches filled by the predictions
    pub fn list_entities(&self) -> &[Arc<ListEntityModel>] {
        &self.list_entities
    }
}

pub struct PredictionTools<'a> {
    pub language_tools: &'a dyn LanguageTools,
    pub system_entities: Arc<dyn SystemEntityExtractor>,
    pub queue: &'a TaskQueue,
}

pub async fn predict(
    text: &str,
    predictors: &Predictors,
    tools: &PredictionTools<'_>,
) -> Result<PredictOutput> {
    let mut utterance = build_utterance(text, predictors, tools).await?;

    let extractors = EntityExtractors {
        system: tools.system_entities.clone(),
        lists: predictors.list_entities.clone(),
        patterns: predictors.pattern_entities.clone(),
        queue: tools.queue.clone(),
    };
    extractors
        .tag_utterances(
            "predict",
            ::std::slice::from_mut(&mut utterance),
            &predictors.language,
            &CancellationToken::new(),
            &|_: f64| {},
        )
        .await?;

    let contexts = predictors
        .ctx_classifier
        .predict(&utterance)?
        .intents
        .into_iter()
        .map(|ctx| predict_context(&utterance, predictors, &ctx.name, ctx.confidence))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sorted_by(|a, b| by_confidence(a.confidence, b.confidence))
        .collect();

    Ok(PredictOutput {
        entities: utterance.entities.iter().map(|e| e.masked()).collect(),
        contexts,
    })
}

async fn build_utterance(
    text: &str,
    predictors: &Predictors,
    tools: &PredictionTools<'_>,
) -> Result<Utterance> {
    let mut utterance = build_utterance_batch(
        &[text.to_string()],
        &predictors.language,
        tools.language_tools,
        None,
    )
    .await?
    .into_iter()
    .next()
    .ok_or_else(|| format_err!("No utterance could be built out of '{}'", text))?;
    utterance.set_global_tfidf(&predictors.tfidf);
    utterance.set_kmeans(predictors.kmeans.as_ref());
    Ok(utterance)
}

fn predict_context(
    utterance: &Utterance,
    predictors: &Predictors,
    context: &str,
    confidence: f32,
) -> Result<ContextPrediction> {
    let classifier = match predictors.intent_classifier_by_ctx.get(context) {
        Some(classifier) => classifier,
        None => {
            debug!("No intent classifier for context '{}'", context);
            return Ok(ContextPrediction {
                name: context.to_string(),
                confidence,
                oos: 1.0,
                intents: vec![],
            });
        }
    };
    let predictions = classifier.predict(utterance)?;
    let intents = predictions
        .intents
        .into_iter()
        .map(|intent| -> Result<IntentResult> {
            let slots = match predictors.slot_tagger_by_intent.get(&intent.name) {
                Some(tagger) => tagger.predict(utterance)?,
                None => vec![],
            };
            Ok(IntentResult {
                name: intent.name,
                confidence: intent.confidence,
                extractor: intent.extractor,
                slots: slots.into_iter().map(mask_slot).collect(),
            })
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sorted_by(|a, b| by_confidence(a.confidence, b.confidence))
        .collect();
    Ok(ContextPrediction {
        name: context.to_string(),
        confidence,
        oos: predictions.oos,
        intents,
    })
}

fn mask_slot(mut slot: ExtractedSlot) -> ExtractedSlot {
    if let Some(entity) = slot.entity.as_ref() {
        if entity.sensitive {
            slot.source = SENSITIVE_MASK.to_string();
            slot.value = SENSITIVE_MASK.to_string();
            slot.entity = Some(entity.masked());
        }
    }
    slot
}

fn by_confidence(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}
