mod features;
pub mod tags;

use std::sync::Arc;

use failure::format_err;
use itertools::Itertools;
use log::debug;
use serde_derive::{Deserialize, Serialize};

use self::features::sequence_features;
use self::tags::{labelize_utterance, make_extracted_slots, prediction_to_tag, remove_invalid_tags};
use crate::entities::ListEntityModel;
use crate::errors::*;
use crate::intent_classifier::{LabeledUtterances, PipelineComponent};
use crate::language::ProgressFn;
use crate::models::SlotDefinition;
use crate::toolkit::{MlToolkit, SequenceExample, SequenceOptions, SequenceTagger};
use crate::utils::{EntityName, IntentName};
use crate::utterance::Utterance;
use crate::worker::{CancellationToken, TaskQueue};

pub use self::tags::ExtractedSlot;

/// What the tagger of an intent knows about the intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSlotFeatures {
    pub name: IntentName,
    /// sorted lowercased words of the utterances and of the list entities of the slots
    pub vocab: Vec<String>,
    pub slot_entities: Vec<EntityName>,
}

impl IntentSlotFeatures {
    pub fn new(
        intent: &LabeledUtterances,
        slot_definitions: &[SlotDefinition],
        list_entities: &[Arc<ListEntityModel>],
    ) -> Self {
        let slot_entities = slot_definitions
            .iter()
            .flat_map(|s| s.entities.iter().cloned())
            .unique()
            .sorted()
            .collect_vec();
        let utterance_words = intent
            .utterances
            .iter()
            .flat_map(|u| u.tokens.iter())
            .filter(|t| !t.is_space)
            .map(|t| t.normalized());
        let entity_words = list_entities
            .iter()
            .filter(|e| slot_entities.contains(&e.entity_name))
            .flat_map(|e| e.mappings_tokens.values())
            .flatten()
            .flatten()
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.to_lowercase())
            .collect_vec();
        let vocab = utterance_words
            .chain(entity_words)
            .unique()
            .sorted()
            .collect();
        Self {
            name: intent.name.clone(),
            vocab,
            slot_entities,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotTaggerModel {
    /// `None` when the intent has no slot
    pub tagger_model: Option<Vec<u8>>,
    pub intent_features: IntentSlotFeatures,
    pub slot_definitions: Vec<SlotDefinition>,
}

/// Sequence tagger of the slots of one intent
pub struct SlotTagger {
    tagger: Option<Box<dyn SequenceTagger>>,
    intent_features: IntentSlotFeatures,
    slot_definitions: Vec<SlotDefinition>,
}

impl SlotTagger {
    #[allow(clippy::too_many_arguments)]
    pub async fn train(
        task_name: &str,
        intent: &LabeledUtterances<'_>,
        slot_definitions: &[SlotDefinition],
        list_entities: &[Arc<ListEntityModel>],
        seed: u64,
        toolkit: &MlToolkit,
        queue: &TaskQueue,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<SlotTaggerModel> {
        let intent_features = IntentSlotFeatures::new(intent, slot_definitions, list_entities);
        if slot_definitions.is_empty() || intent.utterances.is_empty() {
            debug!("{}: intent '{}' has no slot to tag", task_name, intent.name);
            progress(1.0);
            return Ok(SlotTaggerModel {
                tagger_model: None,
                intent_features,
                slot_definitions: slot_definitions.to_vec(),
            });
        }

        let sequences = intent
            .utterances
            .iter()
            .map(|u| SequenceExample {
                features: sequence_features(&intent_features, u),
                labels: labelize_utterance(u),
            })
            .filter(|s| !s.labels.is_empty())
            .collect_vec();
        let options = SequenceOptions {
            seed,
            ..SequenceOptions::default()
        };
        let trainer = toolkit.sequence.clone();
        let tagger_model = queue
            .submit(task_name, cancel.clone(), move |ctx| {
                trainer.train(&sequences, &options, ctx)
            })
            .join_with_progress(progress)
            .await?;
        progress(1.0);

        Ok(SlotTaggerModel {
            tagger_model: Some(tagger_model),
            intent_features,
            slot_definitions: slot_definitions.to_vec(),
        })
    }

    pub fn predict(&self, utterance: &Utterance) -> Result<Vec<ExtractedSlot>> {
        let tagger = match self.tagger.as_ref() {
            Some(tagger) => tagger,
            None => return Ok(vec![]),
        };
        let features = sequence_features(&self.intent_features, utterance);
        if features.is_empty() {
            return Ok(vec![]);
        }
        let tags = tagger
            .marginal(&features)?
            .iter()
            .map(|marginal| {
                prediction_to_tag(marginal)
                    .map(|tag| remove_invalid_tags(&self.slot_definitions, tag))
                    .ok_or_else(|| format_err!("Tagger returned no label probability"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(make_extracted_slots(&self.slot_definitions, utterance, &tags))
    }

    pub fn slot_definitions(&self) -> &[SlotDefinition] {
        &self.slot_definitions
    }
}

impl PipelineComponent for SlotTagger {
    const NAME: &'static str = "SlotTagger";

    type Model = SlotTaggerModel;

    fn load(model: Self::Model, toolkit: &MlToolkit) -> Result<Self> {
        let tagger = model
            .tagger_model
            .as_ref()
            .map(|bytes| toolkit.sequence.load(bytes))
            .transpose()?;
        Ok(Self {
            tagger,
            intent_features: model.intent_features,
            slot_definitions: model.slot_definitions,
        })
    }

    fn memory_size(&self) -> usize {
        self.tagger.as_ref().map(|t| t.memory_size()).unwrap_or(0)
            + self.intent_features.vocab.iter().map(|w| w.len()).sum::<usize>()
    }
}
