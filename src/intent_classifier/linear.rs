use itertools::Itertools;
use log::debug;
use serde_derive::{Deserialize, Serialize};

use super::featurizer::{embedding_size, intent_features};
use super::{IntentPrediction, IntentPredictions, LabeledUtterances, PipelineComponent};
use crate::errors::*;
use crate::language::ProgressFn;
use crate::toolkit::{ClassifierOptions, ClassifierPredictor, DataPoint, MlToolkit};
use crate::utils::{EntityName, IntentName};
use crate::utterance::Utterance;
use crate::worker::{CancellationToken, TaskQueue};

pub const LINEAR_EXTRACTOR: &str = "linear-classifier";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearIntentModel {
    /// `None` when there was less than two labels to separate
    pub classifier_model: Option<Vec<u8>>,
    pub intent_names: Vec<IntentName>,
    pub entity_names: Vec<EntityName>,
    pub embedding_size: usize,
}

/// Multiclass classifier over sentence embeddings and entity indicators. It classifies
/// intents inside a context, and contexts themselves.
pub struct LinearIntentClassifier {
    predictor: Option<Box<dyn ClassifierPredictor>>,
    intent_names: Vec<IntentName>,
    entity_names: Vec<EntityName>,
    embedding_size: usize,
}

impl LinearIntentClassifier {
    #[allow(clippy::too_many_arguments)]
    pub async fn train(
        task_name: &str,
        groups: &[LabeledUtterances<'_>],
        entity_names: &[EntityName],
        options: ClassifierOptions,
        toolkit: &MlToolkit,
        queue: &TaskQueue,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<LinearIntentModel> {
        let intent_names = groups.iter().map(|g| g.name.clone()).collect_vec();
        let embedding_size = embedding_size(groups.iter().flat_map(|g| g.utterances.iter().cloned()));
        let points = groups
            .iter()
            .flat_map(|group| {
                group.utterances.iter().map(move |u| DataPoint {
                    label: group.name.clone(),
                    coordinates: intent_features(u, entity_names, embedding_size),
                })
            })
            .collect_vec();

        let classifier_model = if intent_names.len() < 2 || points.is_empty() {
            debug!(
                "{}: {} labels and {} points, using a constant model",
                task_name,
                intent_names.len(),
                points.len()
            );
            None
        } else {
            let trainer = toolkit.classifier.clone();
            let model = queue
                .submit(task_name, cancel.clone(), move |ctx| {
                    trainer.train(&points, &options, ctx)
                })
                .join_with_progress(progress)
                .await?;
            Some(model)
        };
        progress(1.0);

        Ok(LinearIntentModel {
            classifier_model,
            intent_names,
            entity_names: entity_names.to_vec(),
            embedding_size,
        })
    }

    pub fn predict(&self, utterance: &Utterance) -> Result<IntentPredictions> {
        let predictor = match self.predictor.as_ref() {
            Some(predictor) => predictor,
            None => {
                return Ok(IntentPredictions {
                    intents: self
                        .intent_names
                        .first()
                        .map(|name| {
                            vec![IntentPrediction {
                                name: name.clone(),
                                confidence: 1.0,
                                extractor: LINEAR_EXTRACTOR.to_string(),
                            }]
                        })
                        .unwrap_or_default(),
                    oos: 0.0,
                })
            }
        };
        let features = intent_features(utterance, &self.entity_names, self.embedding_size);
        let intents = predictor
            .predict(&features)?
            .into_iter()
            .map(|p| IntentPrediction {
                name: p.label,
                confidence: p.confidence,
                extractor: LINEAR_EXTRACTOR.to_string(),
            })
            .collect();
        Ok(IntentPredictions { intents, oos: 0.0 })
    }

    pub fn intent_names(&self) -> &[IntentName] {
        &self.intent_names
    }
}

impl PipelineComponent for LinearIntentClassifier {
    const NAME: &'static str = "LinearIntentClassifier";

    type Model = LinearIntentModel;

    fn load(model: Self::Model, toolkit: &MlToolkit) -> Result<Self> {
        let predictor = model
            .classifier_model
            .as_ref()
            .map(|bytes| toolkit.classifier.load(bytes))
            .transpose()?;
        Ok(Self {
            predictor,
            intent_names: model.intent_names,
            entity_names: model.entity_names,
            embedding_size: model.embedding_size,
        })
    }

    fn memory_size(&self) -> usize {
        self.predictor.as_ref().map(|p| p.memory_size()).unwrap_or(0)
            + self.intent_names.iter().map(|n| n.len()).sum::<usize>()
            + self.entity_names.iter().map(|n| n.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::intent_classifier::serialize_model;
    use crate::testutils::FakeLanguageTools;
    use crate::utterance::build_utterance_batch;

    async fn utterances(texts: &[&str]) -> Vec<Utterance> {
        let raw = texts.iter().map(|t| t.to_string()).collect_vec();
        build_utterance_batch(&raw, "en", &FakeLanguageTools::default(), None)
            .await
            .unwrap()
    }

    async fn train(groups: &[LabeledUtterances<'_>]) -> LinearIntentModel {
        let progress = |_: f64| {};
        LinearIntentClassifier::train(
            "test",
            groups,
            &[],
            ClassifierOptions::default(),
            &MlToolkit::default(),
            &TaskQueue::new(1),
            &CancellationToken::new(),
            &progress,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_linear_classifier_separates_intents() {
        // Given
        let fly = utterances(&["book a flight", "fly to paris", "i need a plane ticket"]).await;
        let weather = utterances(&["is it raining", "what is the weather", "sunny today"]).await;
        let groups = vec![
            LabeledUtterances {
                name: "fly".to_string(),
                utterances: fly.iter().collect(),
            },
            LabeledUtterances {
                name: "weather".to_string(),
                utterances: weather.iter().collect(),
            },
        ];
        let model = train(&groups).await;

        // When
        let classifier =
            LinearIntentClassifier::from_bytes(&serialize_model(&model).unwrap(), &MlToolkit::default())
                .unwrap();
        let predictions = classifier.predict(&fly[0]).unwrap();

        // Then
        assert_eq!(2, predictions.intents.len());
        assert_eq!("fly", predictions.intents[0].name);
        assert_eq!(LINEAR_EXTRACTOR, predictions.intents[0].extractor);
        let total: f32 = predictions.intents.iter().map(|i| i.confidence).sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_single_intent_gives_constant_model() {
        // Given
        let fly = utterances(&["book a flight"]).await;
        let groups = vec![LabeledUtterances {
            name: "fly".to_string(),
            utterances: fly.iter().collect(),
        }];

        // When
        let model = train(&groups).await;
        let classifier = LinearIntentClassifier::load(model.clone(), &MlToolkit::default()).unwrap();
        let predictions = classifier.predict(&fly[0]).unwrap();

        // Then
        assert!(model.classifier_model.is_none());
        assert_eq!(1, predictions.intents.len());
        assert_eq!(1.0, predictions.intents[0].confidence);
    }

    #[tokio::test]
    async fn test_no_intent_gives_no_prediction() {
        // When
        let model = train(&[]).await;
        let classifier = LinearIntentClassifier::load(model, &MlToolkit::default()).unwrap();
        let predictions = classifier.predict(&utterances(&["hello"]).await[0]).unwrap();

        // Then
        assert!(predictions.intents.is_empty());
    }

    #[test]
    fn test_corrupted_model_fails_with_component_name() {
        // When
        let result = LinearIntentClassifier::from_bytes(&[1, 2, 3], &MlToolkit::default());

        // Then
        let error = result.err().unwrap();
        assert!(error.to_string().starts_with("LinearIntentClassifier could not load model"));
    }
}
