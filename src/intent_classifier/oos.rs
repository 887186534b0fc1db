use std::collections::BTreeSet;

use itertools::Itertools;
use log::debug;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_derive::{Deserialize, Serialize};

use super::exact_match::{ExactMatchIntentClassifier, ExactMatchModel};
use super::featurizer::{
    embedding_size, featurize_in_scope_utterances, featurize_oos_utterances, oos_features,
    OUT_OF_SCOPE_LABEL,
};
use super::linear::{LinearIntentClassifier, LinearIntentModel};
use super::{IntentPredictions, LabeledUtterances, PipelineComponent, NONE_INTENT};
use crate::errors::*;
use crate::language::ProgressFn;
use crate::toolkit::{ClassifierOptions, ClassifierPredictor, MlToolkit};
use crate::utils::{mean, EntityName};
use crate::utterance::Utterance;
use crate::worker::{CancellationToken, TaskQueue};

/// Intents with fewer utterances are only recognized by exact matching
pub const MIN_NB_UTTERANCES: usize = 3;
const MIN_NONE_UTTERANCE_WORDS: usize = 3;
const NONE_SAMPLE_RATIO: f32 = 2.5;
const OOS_C: f32 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OosIntentModel {
    /// `None` when the language has no POS tagger or there was no none utterance
    pub oos_model: Option<Vec<u8>>,
    pub base_intent_model: LinearIntentModel,
    pub training_vocab: BTreeSet<String>,
    pub exact_match_model: ExactMatchModel,
    pub embedding_size: usize,
}

pub struct OosTrainInput<'a> {
    pub task_name: &'a str,
    pub seed: u64,
    pub intents: &'a [LabeledUtterances<'a>],
    pub none_utterances: &'a [Utterance],
    pub entity_names: &'a [EntityName],
    pub pos_available: bool,
}

/// Ensemble of an exact matcher, an in scope intent classifier which knows the "none" intent,
/// and a binary detector of out of scope utterances
pub struct OosIntentClassifier {
    exact_match: ExactMatchIntentClassifier,
    base_classifier: LinearIntentClassifier,
    oos_predictor: Option<Box<dyn ClassifierPredictor>>,
    training_vocab: BTreeSet<String>,
    embedding_size: usize,
}

impl OosIntentClassifier {
    /// Trains the in scope classifier and the out of scope detector concurrently, reporting
    /// the average of their progress
    pub async fn train(
        input: &OosTrainInput<'_>,
        toolkit: &MlToolkit,
        queue: &TaskQueue,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<OosIntentModel> {
        let training_vocab = input
            .intents
            .iter()
            .flat_map(|i| i.utterances.iter())
            .flat_map(|u| u.tokens.iter())
            .filter(|t| !t.is_space)
            .map(|t| t.normalized())
            .collect::<BTreeSet<_>>();
        let embedding_size = embedding_size(
            input
                .intents
                .iter()
                .flat_map(|i| i.utterances.iter().cloned())
                .chain(input.none_utterances.iter()),
        );

        let progresses = Mutex::new((0.0, 0.0));
        let report = |in_scope: Option<f64>, out_of_scope: Option<f64>| {
            let combined = {
                let mut progresses = progresses.lock();
                if let Some(p) = in_scope {
                    progresses.0 = p;
                }
                if let Some(p) = out_of_scope {
                    progresses.1 = p;
                }
                (progresses.0 + progresses.1) / 2.0
            };
            progress(combined)
        };
        let in_scope_progress = |p: f64| report(Some(p), None);
        let oos_progress = |p: f64| report(None, Some(p));

        let (oos_model, base_intent_model) = futures::try_join!(
            Self::train_oos_detector(
                input,
                &training_vocab,
                embedding_size,
                toolkit,
                queue,
                cancel,
                &oos_progress
            ),
            Self::train_in_scope(input, toolkit, queue, cancel, &in_scope_progress),
        )?;

        let exact_match_model = ExactMatchIntentClassifier::train(input.intents);

        Ok(OosIntentModel {
            oos_model,
            base_intent_model,
            training_vocab,
            exact_match_model,
            embedding_size,
        })
    }

    async fn train_oos_detector(
        input: &OosTrainInput<'_>,
        training_vocab: &BTreeSet<String>,
        embedding_size: usize,
        toolkit: &MlToolkit,
        queue: &TaskQueue,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<Option<Vec<u8>>> {
        if !input.pos_available || input.none_utterances.is_empty() {
            debug!(
                "{}: no out of scope detector, POS available: {}, none utterances: {}",
                input.task_name,
                input.pos_available,
                input.none_utterances.len()
            );
            progress(1.0);
            return Ok(None);
        }

        let mut points = input
            .intents
            .iter()
            .filter(|i| i.name != NONE_INTENT)
            .flat_map(|i| {
                featurize_in_scope_utterances(&i.utterances, &i.name, training_vocab, embedding_size)
            })
            .collect_vec();
        points.extend(featurize_oos_utterances(
            input.none_utterances,
            training_vocab,
            embedding_size,
        ));

        let options = ClassifierOptions {
            seed: input.seed,
            c: OOS_C,
            ..ClassifierOptions::default()
        };
        let trainer = toolkit.classifier.clone();
        let name = format!("{}/oos-detector", input.task_name);
        let model = queue
            .submit(&name, cancel.clone(), move |ctx| {
                trainer.train(&points, &options, ctx)
            })
            .join_with_progress(progress)
            .await?;
        progress(1.0);
        Ok(Some(model))
    }

    async fn train_in_scope(
        input: &OosTrainInput<'_>,
        toolkit: &MlToolkit,
        queue: &TaskQueue,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<LinearIntentModel> {
        let trainable_intents = input
            .intents
            .iter()
            .filter(|i| i.name != NONE_INTENT && i.utterances.len() >= MIN_NB_UTTERANCES)
            .collect_vec();
        let nb_none_utterances = (mean(
            trainable_intents
                .iter()
                .map(|i| i.utterances.len() as f32),
        )
        .ceil()
            * NONE_SAMPLE_RATIO) as usize;

        let mut none_utterances = input
            .none_utterances
            .iter()
            .filter(|u| u.word_count() >= MIN_NONE_UTTERANCE_WORDS)
            .collect_vec();
        let mut rng = StdRng::seed_from_u64(input.seed);
        none_utterances.shuffle(&mut rng);
        none_utterances.truncate(nb_none_utterances);

        let mut groups = trainable_intents.into_iter().cloned().collect_vec();
        groups.push(LabeledUtterances {
            name: NONE_INTENT.to_string(),
            utterances: none_utterances,
        });

        let options = ClassifierOptions {
            seed: input.seed,
            ..ClassifierOptions::default()
        };
        let name = format!("{}/in-scope", input.task_name);
        LinearIntentClassifier::train(
            &name,
            &groups,
            input.entity_names,
            options,
            toolkit,
            queue,
            cancel,
            progress,
        )
        .await
    }

    pub fn predict(&self, utterance: &Utterance) -> Result<IntentPredictions> {
        let exact_predictions = self.exact_match.predict(utterance);
        if exact_predictions.oos == 0.0 {
            return Ok(exact_predictions);
        }
        let base_predictions = self.base_classifier.predict(utterance)?;
        Ok(remove_none_intent(IntentPredictions {
            intents: base_predictions.intents,
            oos: self.oos_score(utterance),
        }))
    }

    /// Out of scope confidence of the detector. A failing detector counts as confident that
    /// the utterance is in scope.
    fn oos_score(&self, utterance: &Utterance) -> f32 {
        let predictor = match self.oos_predictor.as_ref() {
            Some(predictor) => predictor,
            None => return 0.0,
        };
        let features = oos_features(utterance, &self.training_vocab, self.embedding_size);
        match predictor.predict(&features) {
            Ok(predictions) => predictions
                .iter()
                .filter(|p| p.label.starts_with(OUT_OF_SCOPE_LABEL))
                .map(|p| p.confidence)
                .fold(0.0, f32::max),
            Err(e) => {
                debug!("Out of scope detection failed, using 0 instead: {}", e);
                0.0
            }
        }
    }
}

/// Moves the confidence of the "none" intent to the out of scope confidence, and scales every
/// confidence so that they sum to 1
pub fn remove_none_intent(predictions: IntentPredictions) -> IntentPredictions {
    let (none, mut intents): (Vec<_>, Vec<_>) = predictions
        .intents
        .into_iter()
        .partition(|i| i.name == NONE_INTENT);
    let oos = none
        .iter()
        .map(|i| i.confidence)
        .fold(predictions.oos, f32::max);
    let total = oos + intents.iter().map(|i| i.confidence).sum::<f32>();
    if total <= 0.0 {
        return IntentPredictions { intents, oos: 1.0 };
    }
    for intent in intents.iter_mut() {
        intent.confidence /= total;
    }
    IntentPredictions {
        intents,
        oos: oos / total,
    }
}

impl PipelineComponent for OosIntentClassifier {
    const NAME: &'static str = "OosIntentClassifier";

    type Model = OosIntentModel;

    fn load(model: Self::Model, toolkit: &MlToolkit) -> Result<Self> {
        let oos_predictor = model
            .oos_model
            .as_ref()
            .map(|bytes| toolkit.classifier.load(bytes))
            .transpose()?;
        Ok(Self {
            exact_match: ExactMatchIntentClassifier::load(model.exact_match_model, toolkit)?,
            base_classifier: LinearIntentClassifier::load(model.base_intent_model, toolkit)?,
            oos_predictor,
            training_vocab: model.training_vocab,
            embedding_size: model.embedding_size,
        })
    }

    fn memory_size(&self) -> usize {
        self.exact_match.memory_size()
            + self.base_classifier.memory_size()
            + self.oos_predictor.as_ref().map(|p| p.memory_size()).unwrap_or(0)
            + self.training_vocab.iter().map(|w| w.len()).sum::<usize>()
    }
}
