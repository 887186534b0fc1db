mod progress;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use itertools::Itertools;
use log::{debug, info};

use crate::clustering::{compute_kmeans, distinct_token_vectors, KmeansModel};
use crate::entities::pattern::compile_pattern_entities;
use crate::entities::{make_list_entity_model, ColdListEntityModel, EntityExtractors, ListEntityModel};
use crate::errors::*;
use crate::intent_classifier::none_intent::make_none_utterances;
use crate::intent_classifier::oos::OosTrainInput;
use crate::intent_classifier::{
    serialize_model, LabeledUtterances, LinearIntentClassifier, OosIntentClassifier,
};
use crate::language::{LanguageTools, SystemEntityExtractor};
use crate::models::{
    EntityDefinition, IntentDefinition, ListEntityDefinition, PatternEntityDefinition, TrainSet,
};
use crate::slot_tagger::SlotTagger;
use crate::tfidf::{compute_tfidf, TfidfTable};
use crate::toolkit::{ClassifierOptions, KmeansResult, MlToolkit};
use crate::utils::{ContextName, EntityName, IntentName};
use crate::utterance::{build_utterance_batch, Utterance};
use crate::worker::{CancellationToken, TaskQueue};

pub use self::progress::{ProgressCallback, ProgressReporter, NB_STEPS};
use self::progress::{BranchesProgress, UnitsProgress};

/// Context of the intents which are not given any
pub const DEFAULT_CONTEXT: &str = "global";
pub const DEFAULT_PROGRESS_HEARTBEAT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct TrainInput {
    pub train_id: String,
    pub language: String,
    pub seed: u64,
    pub list_entities: Vec<ListEntityDefinition>,
    pub pattern_entities: Vec<PatternEntityDefinition>,
    pub contexts: Vec<ContextName>,
    pub intents: Vec<IntentDefinition>,
    /// contexts whose intent classifier is trained, the others are taken from a previous model
    pub ctx_to_train: Vec<ContextName>,
    pub min_progress_heartbeat: Duration,
}

impl TrainInput {
    pub fn new(train_id: &str, train_set: &TrainSet, min_progress_heartbeat: Duration) -> Self {
        let intents = train_set
            .intents
            .iter()
            .cloned()
            .map(|mut intent| {
                if intent.contexts.is_empty() {
                    intent.contexts = vec![DEFAULT_CONTEXT.to_string()];
                }
                intent
            })
            .collect_vec();
        let contexts = all_contexts(&intents);
        let (list_entities, pattern_entities): (Vec<_>, Vec<_>) =
            train_set.entities.iter().partition_map(|e| match e {
                EntityDefinition::List(list) => itertools::Either::Left(list.clone()),
                EntityDefinition::Pattern(pattern) => itertools::Either::Right(pattern.clone()),
            });
        Self {
            train_id: train_id.to_string(),
            language: train_set.language.clone(),
            seed: train_set.seed,
            list_entities,
            pattern_entities,
            ctx_to_train: contexts.clone(),
            contexts,
            intents,
            min_progress_heartbeat,
        }
    }
}

/// Trained model, its sub models being serialized
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    pub language: String,
    pub intents: Vec<IntentDefinition>,
    pub list_entities: Vec<ColdListEntityModel>,
    pub pattern_entities: Vec<PatternEntityDefinition>,
    pub contexts: Vec<ContextName>,
    pub tfidf: TfidfTable,
    /// sorted lowercased words of the training utterances
    pub vocab: Vec<String>,
    pub kmeans: Option<KmeansResult>,
    pub ctx_model: Vec<u8>,
    pub intent_model_by_ctx: BTreeMap<ContextName, Vec<u8>>,
    pub slots_model_by_intent: BTreeMap<IntentName, Vec<u8>>,
}

impl TrainOutput {
    pub fn payload_size(&self) -> usize {
        self.ctx_model.len()
            + self.intent_model_by_ctx.values().map(|m| m.len()).sum::<usize>()
            + self.slots_model_by_intent.values().map(|m| m.len()).sum::<usize>()
    }
}

/// Collaborators of a training
pub struct TrainingTools<'a> {
    pub language_tools: &'a dyn LanguageTools,
    pub system_entities: Arc<dyn SystemEntityExtractor>,
    pub toolkit: &'a MlToolkit,
    pub queue: &'a TaskQueue,
}

/// Sorted distinct contexts of the intents
pub fn all_contexts(intents: &[IntentDefinition]) -> Vec<ContextName> {
    intents
        .iter()
        .flat_map(|i| i.contexts.iter().cloned())
        .unique()
        .sorted()
        .collect()
}

/// Contexts which did not exist in the previous intents, or whose intents were changed, added
/// or removed
pub fn modified_contexts(
    intents: &[IntentDefinition],
    previous_intents: &[IntentDefinition],
) -> Vec<ContextName> {
    let context_intents = |intents: &'_ [IntentDefinition], context: &str| {
        intents
            .iter()
            .filter(|i| i.contexts.iter().any(|c| c == context))
            .map(|i| (i.name.clone(), i.slots.clone(), i.utterances.clone()))
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect_vec()
    };
    all_contexts(intents)
        .into_iter()
        .filter(|ctx| context_intents(intents, ctx) != context_intents(previous_intents, ctx))
        .collect()
}

struct Preprocessed {
    list_entities: Vec<Arc<ListEntityModel>>,
    utterances: Vec<Utterance>,
    /// utterances of each intent of the input, in the same order
    intent_ranges: Vec<Range<usize>>,
    vocab_vectors: HashMap<String, Vec<f32>>,
}

/// Runs the whole training pipeline: preprocessing, entity extraction, and then the context
/// classifier, the intent classifiers and the slot taggers concurrently
pub async fn train(
    input: &TrainInput,
    tools: &TrainingTools<'_>,
    previous: Option<&TrainOutput>,
    cancel: &CancellationToken,
    progress: ProgressCallback,
) -> Result<TrainOutput> {
    info!("[{}] Started running training pipeline", input.train_id);
    let reporter = ProgressReporter::start(progress, input.min_progress_heartbeat);
    let result = run_pipeline(input, tools, previous, cancel, &reporter).await;
    reporter.stop();
    let output = result?;
    info!("[{}] Done running training pipeline", input.train_id);
    Ok(output)
}

async fn run_pipeline(
    input: &TrainInput,
    tools: &TrainingTools<'_>,
    previous: Option<&TrainOutput>,
    cancel: &CancellationToken,
    reporter: &ProgressReporter,
) -> Result<TrainOutput> {
    let Preprocessed {
        list_entities,
        mut utterances,
        intent_ranges,
        vocab_vectors,
    } = run_stage(input, cancel, "preprocessing", preprocess(input, tools, previous)).await?;

    let tfidf = run_stage(input, cancel, "tfidf", async {
        let documents = input
            .intents
            .iter()
            .zip(intent_ranges.iter())
            .map(|(intent, range)| {
                let words = utterances[range.clone()]
                    .iter()
                    .flat_map(|u| u.tokens.iter())
                    .filter(|t| !t.is_space)
                    .map(|t| t.normalized())
                    .collect_vec();
                (intent.name.clone(), words)
            })
            .collect();
        Ok(compute_tfidf(&documents))
    })
    .await?;
    utterances.iter_mut().for_each(|u| u.set_global_tfidf(&tfidf));

    let kmeans = run_stage(input, cancel, "clustering", async {
        let vectors = distinct_token_vectors(utterances.iter());
        let clusterer = tools.toolkit.clusterer.clone();
        tools
            .queue
            .submit(&format!("[{}] kmeans", input.train_id), cancel.clone(), move |ctx| {
                compute_kmeans(&vectors, clusterer.as_ref(), ctx)
            })
            .join()
            .await
    })
    .await?;
    let kmeans_model = kmeans.as_ref().map(KmeansModel::from_result).transpose()?;
    utterances
        .iter_mut()
        .for_each(|u| u.set_kmeans(kmeans_model.as_ref()));
    reporter.report_steps(1.0);

    let extractors = EntityExtractors {
        system: tools.system_entities.clone(),
        lists: list_entities.clone(),
        patterns: Arc::new(compile_pattern_entities(&input.pattern_entities)),
        queue: tools.queue.clone(),
    };
    let extraction_progress = |p: f64| reporter.report_step_progress(1.0, p);
    run_stage(
        input,
        cancel,
        "entity extraction",
        extractors.tag_utterances(
            &input.train_id,
            &mut utterances,
            &input.language,
            cancel,
            &extraction_progress,
        ),
    )
    .await?;
    reporter.report_steps(2.0);

    let none_utterances = run_stage(input, cancel, "none utterances generation", async {
        let all_utterances = utterances.iter().collect_vec();
        let mut none_utterances = make_none_utterances(
            &all_utterances,
            &input.language,
            tools.language_tools,
            input.seed,
            Some(&vocab_vectors),
        )
        .await?;
        for utterance in none_utterances.iter_mut() {
            utterance.set_global_tfidf(&tfidf);
            utterance.set_kmeans(kmeans_model.as_ref());
        }
        Ok(none_utterances)
    })
    .await?;

    let trainer = BranchesTrainer {
        input,
        tools,
        cancel,
        utterances: &utterances,
        intent_ranges: &intent_ranges,
        none_utterances: &none_utterances,
        list_entities: &list_entities,
        entity_names: entity_names(input, &utterances),
        branches: BranchesProgress::new(reporter, 2.0, 3),
    };
    let (ctx_model, intent_model_by_ctx, slots_model_by_intent) = futures::try_join!(
        run_stage(input, cancel, "context classifier training", trainer.train_contexts()),
        run_stage(input, cancel, "intent classifiers training", trainer.train_intents()),
        run_stage(input, cancel, "slot taggers training", trainer.train_slots()),
    )?;
    reporter.report_steps(NB_STEPS);

    Ok(TrainOutput {
        language: input.language.clone(),
        intents: input.intents.clone(),
        list_entities: list_entities.iter().map(|e| e.to_cold()).collect(),
        pattern_entities: input.pattern_entities.clone(),
        contexts: input.contexts.clone(),
        tfidf,
        vocab: vocab_vectors.keys().cloned().sorted().collect(),
        kmeans,
        ctx_model,
        intent_model_by_ctx: merge_intent_models(&input.contexts, intent_model_by_ctx, previous),
        slots_model_by_intent,
    })
}

async fn run_stage<T, F>(input: &TrainInput, cancel: &CancellationToken, stage: &str, task: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_canceled() {
        return Err(NluEngineError::TrainingCanceled(input.train_id.clone()).into());
    }
    debug!("[{}] Started {}", input.train_id, stage);
    let result = task.await?;
    debug!("[{}] Done {}", input.train_id, stage);
    Ok(result)
}

async fn preprocess(
    input: &TrainInput,
    tools: &TrainingTools<'_>,
    previous: Option<&TrainOutput>,
) -> Result<Preprocessed> {
    let list_entities = try_join_all(input.list_entities.iter().map(|definition| async move {
        let model = make_list_entity_model(definition, &input.language, tools.language_tools).await?;
        let previous_cache = previous
            .into_iter()
            .flat_map(|p| p.list_entities.iter())
            .find(|cold| model.has_same_definition(cold));
        if let Some(cold) = previous_cache {
            debug!(
                "[{}] Reusing {} cached extractions of entity '{}'",
                input.train_id,
                cold.cache.len(),
                model.entity_name
            );
            model.warm_cache(&cold.cache);
        }
        Ok::<_, ::failure::Error>(Arc::new(model))
    }))
    .await?;

    let raw_utterances = input
        .intents
        .iter()
        .flat_map(|i| i.utterances.iter().cloned())
        .collect_vec();
    let utterances =
        build_utterance_batch(&raw_utterances, &input.language, tools.language_tools, None).await?;
    let mut start = 0;
    let intent_ranges = input
        .intents
        .iter()
        .map(|intent| {
            let range = start..start + intent.utterances.len();
            start = range.end;
            range
        })
        .collect();

    let vocab_vectors = utterances
        .iter()
        .flat_map(|u| u.tokens.iter())
        .filter(|t| !t.is_space)
        .map(|t| (t.normalized(), t.vector.clone()))
        .collect();

    Ok(Preprocessed {
        list_entities,
        utterances,
        intent_ranges,
        vocab_vectors,
    })
}

/// Names of the entities the classifiers can see: the custom ones and the system ones found
/// in the training utterances
fn entity_names(input: &TrainInput, utterances: &[Utterance]) -> Vec<EntityName> {
    input
        .list_entities
        .iter()
        .map(|e| e.name.clone())
        .chain(input.pattern_entities.iter().map(|e| e.name.clone()))
        .chain(
            utterances
                .iter()
                .flat_map(|u| u.entities.iter())
                .map(|e| e.entity_name.clone()),
        )
        .unique()
        .sorted()
        .collect()
}

/// Previous intent models of the contexts which still exist, overridden by the new ones
fn merge_intent_models(
    contexts: &[ContextName],
    trained: BTreeMap<ContextName, Vec<u8>>,
    previous: Option<&TrainOutput>,
) -> BTreeMap<ContextName, Vec<u8>> {
    let mut merged: BTreeMap<ContextName, Vec<u8>> = previous
        .into_iter()
        .flat_map(|p| p.intent_model_by_ctx.iter())
        .filter(|(ctx, _)| contexts.contains(ctx))
        .map(|(ctx, model)| (ctx.clone(), model.clone()))
        .collect();
    merged.extend(trained);
    merged
}

struct BranchesTrainer<'a> {
    input: &'a TrainInput,
    tools: &'a TrainingTools<'a>,
    cancel: &'a CancellationToken,
    utterances: &'a [Utterance],
    intent_ranges: &'a [Range<usize>],
    none_utterances: &'a [Utterance],
    list_entities: &'a [Arc<ListEntityModel>],
    entity_names: Vec<EntityName>,
    branches: BranchesProgress<'a>,
}

impl<'a> BranchesTrainer<'a> {
    fn intent_utterances(&self, index: usize) -> LabeledUtterances<'a> {
        let utterances: &'a [Utterance] = self.utterances;
        LabeledUtterances {
            name: self.input.intents[index].name.clone(),
            utterances: utterances[self.intent_ranges[index].clone()].iter().collect(),
        }
    }

    fn context_intents(&self, context: &str) -> Vec<LabeledUtterances<'a>> {
        self.input
            .intents
            .iter()
            .enumerate()
            .filter(|(_, intent)| intent.contexts.iter().any(|c| c == context))
            .map(|(index, _)| self.intent_utterances(index))
            .collect()
    }

    fn classifier_options(&self) -> ClassifierOptions {
        ClassifierOptions {
            seed: self.input.seed,
            ..ClassifierOptions::default()
        }
    }

    async fn train_contexts(&self) -> Result<Vec<u8>> {
        let groups = self
            .input
            .contexts
            .iter()
            .map(|ctx| LabeledUtterances {
                name: ctx.clone(),
                utterances: self
                    .context_intents(ctx)
                    .into_iter()
                    .flat_map(|intent| intent.utterances)
                    .collect(),
            })
            .collect_vec();
        let progress = |p: f64| self.branches.report(0, p);
        let model = LinearIntentClassifier::train(
            &format!("[{}] context classifier", self.input.train_id),
            &groups,
            &self.entity_names,
            self.classifier_options(),
            self.tools.toolkit,
            self.tools.queue,
            self.cancel,
            &progress,
        )
        .await?;
        self.branches.complete(0);
        serialize_model(&model)
    }

    async fn train_intents(&self) -> Result<BTreeMap<ContextName, Vec<u8>>> {
        let contexts = &self.input.ctx_to_train;
        debug!(
            "[{}] Training intent classifiers of contexts [{}]",
            self.input.train_id,
            contexts.join(", ")
        );
        let units = UnitsProgress::new(contexts.len());
        let pos_available = self
            .tools
            .language_tools
            .is_pos_available(&self.input.language);
        let models = try_join_all(contexts.iter().enumerate().map(|(index, ctx)| {
            let units = &units;
            async move {
                let intents = self.context_intents(ctx);
                let task_name = format!("[{}] intent classifier of context '{}'", self.input.train_id, ctx);
                let oos_input = OosTrainInput {
                    task_name: &task_name,
                    seed: self.input.seed,
                    intents: &intents,
                    none_utterances: self.none_utterances,
                    entity_names: &self.entity_names,
                    pos_available,
                };
                let progress = |p: f64| self.branches.report(1, units.update(index, p));
                let model = OosIntentClassifier::train(
                    &oos_input,
                    self.tools.toolkit,
                    self.tools.queue,
                    self.cancel,
                    &progress,
                )
                .await?;
                Ok::<_, ::failure::Error>((ctx.clone(), serialize_model(&model)?))
            }
        }))
        .await?;
        self.branches.complete(1);
        Ok(models.into_iter().collect())
    }

    async fn train_slots(&self) -> Result<BTreeMap<IntentName, Vec<u8>>> {
        let units = UnitsProgress::new(self.input.intents.len());
        let models = try_join_all(self.input.intents.iter().enumerate().map(|(index, intent)| {
            let units = &units;
            async move {
                let labeled = self.intent_utterances(index);
                let progress = |p: f64| self.branches.report(2, units.update(index, p));
                let model = SlotTagger::train(
                    &format!("[{}] slot tagger of intent '{}'", self.input.train_id, intent.name),
                    &labeled,
                    &intent.slots,
                    self.list_entities,
                    self.input.seed,
                    self.tools.toolkit,
                    self.tools.queue,
                    self.cancel,
                    &progress,
                )
                .await?;
                Ok::<_, ::failure::Error>((intent.name.clone(), serialize_model(&model)?))
            }
        }))
        .await?;
        self.branches.complete(2);
        Ok(models.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    use crate::models::{ListEntityValue, SlotDefinition};
    use crate::testutils::{FakeLanguageTools, MockedSystemEntityExtractor};

    fn intent(name: &str, contexts: &[&str], utterances: &[&str]) -> IntentDefinition {
        IntentDefinition {
            name: name.to_string(),
            contexts: contexts.iter().map(|c| c.to_string()).collect(),
            slots: vec![],
            utterances: utterances.iter().map(|u| u.to_string()).collect(),
        }
    }

    fn train_set() -> TrainSet {
        let mut fly = intent(
            "fly",
            &["travel"],
            &[
                "fly to [paris](destination)",
                "book a flight to [quebec](destination)",
                "i want to fly to [paris](destination)",
                "take me to [quebec](destination)",
            ],
        );
        fly.slots = vec![SlotDefinition {
            name: "destination".to_string(),
            entities: vec!["city".to_string()],
        }];
        TrainSet {
            language: "en".to_string(),
            seed: 42,
            entities: vec![EntityDefinition::List(ListEntityDefinition {
                name: "city".to_string(),
                fuzzy: 1.0,
                sensitive: false,
                values: vec![
                    ListEntityValue {
                        name: "paris".to_string(),
                        synonyms: vec!["city of light".to_string()],
                    },
                    ListEntityValue {
                        name: "quebec".to_string(),
                        synonyms: vec![],
                    },
                ],
            })],
            intents: vec![
                fly,
                intent(
                    "greet",
                    &["chitchat"],
                    &["hello there", "hi bot", "good morning", "hey you"],
                ),
                intent("bye", &[], &["goodbye", "see you later", "bye bye"]),
            ],
        }
    }

    async fn run_training(
        input: &TrainInput,
        previous: Option<&TrainOutput>,
        cancel: &CancellationToken,
    ) -> (Result<TrainOutput>, Vec<f64>) {
        let language_tools = FakeLanguageTools::default();
        let toolkit = MlToolkit::default();
        let queue = TaskQueue::new(2);
        let tools = TrainingTools {
            language_tools: &language_tools,
            system_entities: Arc::new(MockedSystemEntityExtractor::default()),
            toolkit: &toolkit,
            queue: &queue,
        };
        let values = Arc::new(Mutex::new(vec![]));
        let values_clone = values.clone();
        let progress: ProgressCallback = Arc::new(move |p| values_clone.lock().push(p));
        let result = train(input, &tools, previous, cancel, progress).await;
        let values = values.lock().clone();
        (result, values)
    }

    #[test]
    fn test_train_input_gathers_contexts_and_entities() {
        // When
        let input = TrainInput::new("t", &train_set(), DEFAULT_PROGRESS_HEARTBEAT);

        // Then
        assert_eq!(vec!["chitchat", "global", "travel"], input.contexts);
        assert_eq!(input.contexts, input.ctx_to_train);
        assert_eq!(1, input.list_entities.len());
        assert!(input.pattern_entities.is_empty());
        assert_eq!(vec!["global"], input.intents[2].contexts);
    }

    #[test]
    fn test_modified_contexts() {
        // Given
        let previous = TrainInput::new("t", &train_set(), DEFAULT_PROGRESS_HEARTBEAT).intents;
        let mut current = previous.clone();
        current[1].utterances.push("howdy".to_string());
        current.push(intent("order", &["shop"], &["buy it"]));

        // When
        let modified = modified_contexts(&current, &previous);

        // Then
        assert_eq!(vec!["chitchat", "shop"], modified);
        assert!(modified_contexts(&previous, &previous).is_empty());
    }

    #[test]
    fn test_moving_an_intent_modifies_its_new_context() {
        // Given
        let previous = TrainInput::new("t", &train_set(), DEFAULT_PROGRESS_HEARTBEAT).intents;
        let mut current = previous.clone();
        current[1].contexts = vec!["travel".to_string()];

        // When
        let modified = modified_contexts(&current, &previous);

        // Then
        assert_eq!(vec!["travel"], modified);
    }

    #[tokio::test]
    async fn test_training_produces_every_sub_model() {
        // Given
        let input = TrainInput::new("t", &train_set(), DEFAULT_PROGRESS_HEARTBEAT);

        // When
        let (output, progress) = run_training(&input, None, &CancellationToken::new()).await;
        let output = output.unwrap();

        // Then
        assert_eq!(
            vec!["chitchat", "global", "travel"],
            output.intent_model_by_ctx.keys().collect_vec()
        );
        assert_eq!(
            vec!["bye", "fly", "greet"],
            output.slots_model_by_intent.keys().collect_vec()
        );
        assert!(!output.ctx_model.is_empty());
        assert!(output.kmeans.is_some());
        assert!(output.vocab.contains(&"flight".to_string()));
        assert!(output.tfidf.weight("flight").is_some());
        assert!(output.list_entities[0].cache.len() > 0);

        assert_eq!(Some(&0.0), progress.first());
        assert_eq!(Some(&1.0), progress.last());
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_retraining_merges_previous_intent_models() {
        // Given
        let input = TrainInput::new("first", &train_set(), DEFAULT_PROGRESS_HEARTBEAT);
        let (previous, _) = run_training(&input, None, &CancellationToken::new()).await;
        let previous = previous.unwrap();
        let mut retrain = TrainInput::new("second", &train_set(), DEFAULT_PROGRESS_HEARTBEAT);
        retrain.ctx_to_train = vec!["travel".to_string()];

        // When
        let (output, _) = run_training(&retrain, Some(&previous), &CancellationToken::new()).await;
        let output = output.unwrap();

        // Then
        assert_eq!(3, output.intent_model_by_ctx.len());
        assert_eq!(
            previous.intent_model_by_ctx["chitchat"],
            output.intent_model_by_ctx["chitchat"]
        );
    }

    #[tokio::test]
    async fn test_canceled_training_fails() {
        // Given
        let input = TrainInput::new("t", &train_set(), DEFAULT_PROGRESS_HEARTBEAT);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // When
        let (output, _) = run_training(&input, None, &cancel).await;

        // Then
        assert!(is_training_canceled(&output.unwrap_err()));
    }
}
