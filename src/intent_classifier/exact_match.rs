use std::collections::BTreeMap;

use log::warn;
use serde_derive::{Deserialize, Serialize};

use super::{IntentPrediction, IntentPredictions, LabeledUtterances, PipelineComponent};
use crate::errors::*;
use crate::toolkit::MlToolkit;
use crate::utils::IntentName;
use crate::utterance::{EntityRendering, SlotRendering, ToStringOptions, Utterance};

pub const EXACT_MATCH_EXTRACTOR: &str = "exact-matcher";

const CANONICAL_FORM: ToStringOptions = ToStringOptions {
    lowercase: true,
    only_words: true,
    entities: EntityRendering::ReplaceWithName,
    slots: SlotRendering::Keep,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExactMatchModel {
    pub intents: Vec<IntentName>,
    /// canonical utterance -> intent
    pub exact_match_index: BTreeMap<String, IntentName>,
}

pub fn canonical_form(utterance: &Utterance) -> String {
    utterance.to_string(&CANONICAL_FORM)
}

pub struct ExactMatchIntentClassifier {
    model: ExactMatchModel,
}

impl ExactMatchIntentClassifier {
    /// Indexes every training utterance by its canonical form. On a collision the last
    /// utterance wins.
    pub fn train(groups: &[LabeledUtterances]) -> ExactMatchModel {
        let mut exact_match_index: BTreeMap<String, IntentName> = BTreeMap::new();
        for group in groups {
            for utterance in group.utterances.iter() {
                let key = canonical_form(utterance);
                if key.is_empty() {
                    continue;
                }
                if let Some(previous) = exact_match_index.insert(key.clone(), group.name.clone()) {
                    if previous != group.name {
                        warn!(
                            "Utterance '{}' of intent '{}' is also an utterance of intent '{}', \
                             it will be matched with '{}'",
                            utterance.text(),
                            group.name,
                            previous,
                            group.name
                        );
                    }
                }
            }
        }
        ExactMatchModel {
            intents: groups.iter().map(|g| g.name.clone()).collect(),
            exact_match_index,
        }
    }

    pub fn predict(&self, utterance: &Utterance) -> IntentPredictions {
        let matched = self.model.exact_match_index.get(&canonical_form(utterance));
        let intents = self
            .model
            .intents
            .iter()
            .map(|intent| IntentPrediction {
                name: intent.clone(),
                confidence: if Some(intent) == matched { 1.0 } else { 0.0 },
                extractor: EXACT_MATCH_EXTRACTOR.to_string(),
            })
            .collect();
        IntentPredictions {
            intents,
            oos: if matched.is_some() { 0.0 } else { 1.0 },
        }
    }

    pub fn model(&self) -> &ExactMatchModel {
        &self.model
    }
}

impl PipelineComponent for ExactMatchIntentClassifier {
    const NAME: &'static str = "ExactMatchIntentClassifier";

    type Model = ExactMatchModel;

    fn load(model: Self::Model, _toolkit: &MlToolkit) -> Result<Self> {
        Ok(Self { model })
    }

    fn memory_size(&self) -> usize {
        self.model
            .exact_match_index
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
            + self.model.intents.iter().map(|i| i.len()).sum::<usize>()
    }
}
