use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use failure::{bail, format_err};
use itertools::Itertools;
use log::{debug, info};
use lru_cache::LruCache;
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::errors::*;
use crate::language::{
    LanguageTools, ResilientLanguageTools, ResilientSystemEntityExtractor, SystemEntityExtractor,
};
use crate::model_id::{ModelId, Specifications};
use crate::models::{now_millis, Model, TrainSet};
use crate::predict::{predict, PredictOutput, PredictionTools, Predictors};
use crate::toolkit::MlToolkit;
use crate::training::{
    self, modified_contexts, ProgressCallback, TrainInput, TrainOutput, TrainingTools,
    DEFAULT_PROGRESS_HEARTBEAT,
};
use crate::worker::{CancellationToken, TaskQueue};

/// Language returned when the language of a text cannot be detected
pub const NA_LANGUAGE: &str = "n/a";

#[derive(Clone)]
pub struct TrainingOptions {
    pub progress_callback: ProgressCallback,
    /// loaded model whose unchanged contexts and entity caches are reused
    pub previous_model: Option<ModelId>,
    pub min_progress_heartbeat: Duration,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            progress_callback: Arc::new(|_: f64| {}),
            previous_model: None,
            min_progress_heartbeat: DEFAULT_PROGRESS_HEARTBEAT,
        }
    }
}

struct LoadedModel {
    output: TrainOutput,
    predictors: Predictors,
}

impl LoadedModel {
    /// Output of the training of this model, with list entity caches as filled by predictions
    fn retraining_base(&self) -> TrainOutput {
        TrainOutput {
            list_entities: self
                .predictors
                .list_entities()
                .iter()
                .map(|e| e.to_cold())
                .collect(),
            ..self.output.clone()
        }
    }
}

struct CacheEntry<T> {
    value: Arc<T>,
    size: usize,
}

/// Least recently used cache whose capacity is a number of bytes
struct ModelCache<T> {
    entries: LruCache<String, CacheEntry<T>>,
    size: usize,
    max_size: usize,
}

impl<T> ModelCache<T> {
    fn new(max_size: usize) -> Self {
        Self {
            entries: LruCache::new(usize::MAX),
            size: 0,
            max_size,
        }
    }

    fn get(&mut self, id: &str) -> Option<Arc<T>> {
        self.entries.get_mut(id).map(|entry| entry.value.clone())
    }

    fn contains(&mut self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Fails without touching the cache when the value alone does not fit in it
    fn insert(&mut self, id: &str, value: T, size: usize) -> Result<()> {
        if size >= self.max_size {
            bail!(NluEngineError::ModelTooLarge {
                model_id: id.to_string(),
                size,
                max: self.max_size,
            });
        }
        self.remove(id);
        while self.size + size > self.max_size {
            match self.entries.remove_lru() {
                Some((evicted_id, evicted)) => {
                    self.size -= evicted.size;
                    debug!(
                        "Evicted model {} ({} bytes) from the cache, occupancy is {} / {} bytes",
                        evicted_id, evicted.size, self.size, self.max_size
                    );
                }
                None => break,
            }
        }
        self.entries.insert(
            id.to_string(),
            CacheEntry {
                value: Arc::new(value),
                size,
            },
        );
        self.size += size;
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                self.size -= entry.size;
                true
            }
            None => false,
        }
    }

    fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }
}

/// Removes a training from the running ones when it ends, whatever the way it ends
struct TrainingRegistration<'a> {
    trainings: &'a Mutex<HashMap<String, CancellationToken>>,
    train_id: String,
}

impl<'a> Drop for TrainingRegistration<'a> {
    fn drop(&mut self) {
        self.trainings.lock().remove(&self.train_id);
    }
}

/// Trains models and serves the predictions of the loaded ones
pub struct NluEngine {
    config: EngineConfig,
    language_tools: Arc<dyn LanguageTools>,
    system_entities: Arc<dyn SystemEntityExtractor>,
    toolkit: MlToolkit,
    queue: TaskQueue,
    models: Mutex<ModelCache<LoadedModel>>,
    load_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    trainings: Mutex<HashMap<String, CancellationToken>>,
}

impl NluEngine {
    pub fn new(
        config: EngineConfig,
        language_tools: Arc<dyn LanguageTools>,
        system_entities: Arc<dyn SystemEntityExtractor>,
        toolkit: MlToolkit,
    ) -> Self {
        let cache_size = config.cache_size_bytes();
        debug!("Model cache size is {} bytes", cache_size);
        Self {
            language_tools: Arc::new(ResilientLanguageTools::new(
                language_tools,
                config.retry.clone(),
            )),
            system_entities: Arc::new(ResilientSystemEntityExtractor::new(
                system_entities,
                config.retry.clone(),
            )),
            toolkit,
            queue: TaskQueue::new(config.training_workers),
            models: Mutex::new(ModelCache::new(cache_size)),
            load_locks: Mutex::new(HashMap::new()),
            trainings: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn specifications(&self) -> Specifications {
        Specifications {
            engine_version: self.config.engine_version.clone(),
            language_server: self.language_tools.specifications(),
        }
    }

    pub fn languages(&self) -> Vec<String> {
        self.language_tools.languages()
    }

    pub fn make_id(&self, train_set: &TrainSet) -> Result<ModelId> {
        ModelId::make(train_set, &self.specifications())
    }

    pub async fn train(
        &self,
        train_id: &str,
        train_set: &TrainSet,
        options: TrainingOptions,
    ) -> Result<Model> {
        let cancel = self.register_training(train_id)?;
        let _registration = TrainingRegistration {
            trainings: &self.trainings,
            train_id: train_id.to_string(),
        };
        info!("[{}] Started {} training", train_id, train_set.language);

        let started_at = now_millis();
        let model_id = self.make_id(train_set)?;
        let mut input = TrainInput::new(train_id, train_set, options.min_progress_heartbeat);
        let previous = options
            .previous_model
            .as_ref()
            .and_then(|id| self.loaded_model(&id.to_string()))
            .filter(|previous| previous.output.language == train_set.language)
            .map(|previous| previous.retraining_base());
        match previous.as_ref() {
            Some(previous) => {
                input.ctx_to_train = modified_contexts(&input.intents, &previous.intents);
                debug!(
                    "[{}] Retraining only contexts [{}]",
                    train_id,
                    input.ctx_to_train.join(", ")
                );
            }
            None => debug!("[{}] Training all contexts", train_id),
        }

        let tools = TrainingTools {
            language_tools: self.language_tools.as_ref(),
            system_entities: self.system_entities.clone(),
            toolkit: &self.toolkit,
            queue: &self.queue,
        };
        let output = training::train(
            &input,
            &tools,
            previous.as_ref(),
            &cancel,
            options.progress_callback.clone(),
        )
        .await?;
        let model = Model::new(&model_id, started_at, &output)?;
        info!("[{}] Successfully finished {} training", train_id, train_set.language);
        Ok(model)
    }

    fn register_training(&self, train_id: &str) -> Result<CancellationToken> {
        let mut trainings = self.trainings.lock();
        if trainings.contains_key(train_id) {
            bail!(NluEngineError::TrainingAlreadyStarted(train_id.to_string()));
        }
        let cancel = CancellationToken::new();
        trainings.insert(train_id.to_string(), cancel.clone());
        Ok(cancel)
    }

    /// Asks a running training to stop, returns whether such a training was running
    pub fn cancel_training(&self, train_id: &str) -> bool {
        match self.trainings.lock().get(train_id) {
            Some(cancel) => {
                debug!("[{}] Canceling training", train_id);
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn has_model(&self, model_id: &str) -> bool {
        self.models.lock().contains(model_id)
    }

    fn loaded_model(&self, model_id: &str) -> Option<Arc<LoadedModel>> {
        self.models.lock().get(model_id)
    }

    /// Deserializes the model and puts it in the cache, unless it is already there. Loadings
    /// of the same model are serialized.
    pub async fn load_model(&self, model: &Model) -> Result<()> {
        model.model_id()?;
        let lock = self
            .load_locks
            .lock()
            .entry(model.id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.load_model_unlocked(model)
        };
        let mut load_locks = self.load_locks.lock();
        if Arc::strong_count(&lock) <= 2 {
            load_locks.remove(&model.id);
        }
        result
    }

    fn load_model_unlocked(&self, model: &Model) -> Result<()> {
        if self.has_model(&model.id) {
            debug!("Model {} is already loaded", model.id);
            return Ok(());
        }
        let output = model.data.decode()?;
        let predictors = Predictors::load(&output, &self.toolkit)?;
        let size = predictors.memory_size() + output.payload_size();
        let mut models = self.models.lock();
        models.insert(&model.id, LoadedModel { output, predictors }, size)?;
        debug!(
            "Loaded model {} ({} bytes), cache occupancy is {} / {} bytes",
            model.id, size, models.size, models.max_size
        );
        debug!("Model cache entries are [{}]", models.ids().join(", "));
        Ok(())
    }

    pub fn unload_model(&self, model_id: &str) -> bool {
        let mut models = self.models.lock();
        let removed = models.remove(model_id);
        if removed {
            debug!(
                "Unloaded model {}, cache occupancy is {} / {} bytes",
                model_id, models.size, models.max_size
            );
        }
        removed
    }

    pub async fn predict(&self, text: &str, model_id: &str) -> Result<PredictOutput> {
        debug!("Predict for input \"{}\"", text);
        let model = self
            .loaded_model(model_id)
            .ok_or_else(|| format_err!("model {} not loaded", model_id))?;
        let tools = PredictionTools {
            language_tools: self.language_tools.as_ref(),
            system_entities: self.system_entities.clone(),
            queue: &self.queue,
        };
        predict(text, &model.predictors, &tools).await
    }

    /// Language of the text among the languages of the given models, which must be loaded
    pub async fn detect_language(
        &self,
        text: &str,
        model_ids_by_language: &BTreeMap<String, String>,
    ) -> Result<String> {
        debug!("Detecting language of input \"{}\"", text);
        let models = model_ids_by_language
            .iter()
            .map(|(language, id)| (language, self.loaded_model(id)))
            .collect_vec();
        let missing = models
            .iter()
            .filter(|(_, model)| model.is_none())
            .map(|(language, _)| language.as_str())
            .collect_vec();
        if !missing.is_empty() {
            bail!(NluEngineError::MissingLanguageModels(missing.join(", ")));
        }
        let models = models
            .into_iter()
            .filter_map(|(language, model)| model.map(|m| (language, m)))
            .collect_vec();

        let identified = self.language_tools.identify_language(text).await?;
        if let Some(language) = identified {
            if models.iter().any(|(l, _)| **l == language) {
                return Ok(language);
            }
        }

        let threshold = if text.chars().count() > 20 { 0.5 } else { 0.3 };
        let words = text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| !w.is_empty())
            .collect_vec();
        let best = models
            .iter()
            .map(|(language, model)| (language, vocab_coverage(&words, &model.predictors)))
            .filter(|(_, coverage)| *coverage >= threshold)
            .fold(None, |best: Option<(&&String, f32)>, (language, coverage)| match best {
                Some((_, best_coverage)) if best_coverage >= coverage => best,
                _ => Some((language, coverage)),
            });
        Ok(best
            .map(|(language, _)| language.to_string())
            .unwrap_or_else(|| NA_LANGUAGE.to_string()))
    }
}

fn vocab_coverage(words: &[String], predictors: &Predictors) -> f32 {
    if words.is_empty() {
        return 0.0;
    }
    let known = words.iter().filter(|w| predictors.vocab.contains(*w)).count();
    known as f32 / words.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    use maplit::btreemap;

    use crate::models::{
        EntityDefinition, IntentDefinition, ListEntityDefinition, ListEntityValue, SlotDefinition,
    };
    use crate::testutils::{FakeLanguageTools, MockedSystemEntityExtractor};

    fn engine_with(cache_size: &str, language_tools: FakeLanguageTools) -> NluEngine {
        let config = EngineConfig {
            cache_size: cache_size.to_string(),
            training_workers: 2,
            ..EngineConfig::default()
        };
        NluEngine::new(
            config,
            Arc::new(language_tools),
            Arc::new(MockedSystemEntityExtractor::default()),
            MlToolkit::default(),
        )
    }

    fn engine() -> NluEngine {
        engine_with("850mb", FakeLanguageTools::default())
    }

    fn train_set() -> TrainSet {
        TrainSet {
            language: "en".to_string(),
            seed: 42,
            entities: vec![EntityDefinition::List(ListEntityDefinition {
                name: "city-from".to_string(),
                fuzzy: 1.0,
                sensitive: false,
                values: vec![
                    ListEntityValue {
                        name: "paris".to_string(),
                        synonyms: vec!["city of light".to_string()],
                    },
                    ListEntityValue {
                        name: "quebec".to_string(),
                        synonyms: vec!["quebec city".to_string()],
                    },
                ],
            })],
            intents: vec![IntentDefinition {
                name: "fly".to_string(),
                contexts: vec![],
                slots: vec![SlotDefinition {
                    name: "city-from".to_string(),
                    entities: vec!["city-from".to_string()],
                }],
                utterances: vec![
                    "fly to [paris](city-from)".to_string(),
                    "book a flight".to_string(),
                ],
            }],
        }
    }

    #[test]
    fn test_model_cache_evicts_least_recently_used_models() {
        // Given
        let mut cache = ModelCache::new(100);
        cache.insert("a", "a", 40).unwrap();
        cache.insert("b", "b", 40).unwrap();
        cache.get("a");

        // When
        cache.insert("c", "c", 40).unwrap();

        // Then
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(80, cache.size);
    }

    #[test]
    fn test_model_cache_rejects_too_large_models() {
        // Given
        let mut cache = ModelCache::new(100);
        cache.insert("a", "a", 40).unwrap();

        // When
        let error = cache.insert("b", "b", 100).unwrap_err();

        // Then
        match error.downcast_ref::<NluEngineError>() {
            Some(NluEngineError::ModelTooLarge { size, max, .. }) => {
                assert_eq!(100, *size);
                assert_eq!(100, *max);
            }
            _ => panic!("Unexpected error: {}", error),
        }
        assert_eq!(40, cache.size);
        assert!(cache.contains("a"));
    }

    #[test]
    fn test_model_cache_replaces_same_id() {
        // Given
        let mut cache = ModelCache::new(100);
        cache.insert("a", "a", 40).unwrap();

        // When
        cache.insert("a", "b", 30).unwrap();

        // Then
        assert_eq!(30, cache.size);
        assert_eq!(Some(Arc::new("b")), cache.get("a"));
        assert!(cache.remove("a"));
        assert_eq!(0, cache.size);
    }

    #[tokio::test]
    async fn test_train_load_and_predict() {
        // Given
        let engine = engine();
        let model = engine
            .train("train", &train_set(), TrainingOptions::default())
            .await
            .unwrap();

        // When
        engine.load_model(&model).await.unwrap();
        let prediction = engine.predict("book a flight", &model.id).await.unwrap();

        // Then
        let model_id = model.model_id().unwrap();
        assert_eq!(model.id, model_id.to_string());
        assert_eq!(engine.make_id(&train_set()).unwrap(), model_id);
        assert!(engine.has_model(&model.id));
        let top = prediction.top_intent().unwrap();
        assert_eq!("fly", top.name);
        assert_eq!(1.0, top.confidence);
    }

    #[tokio::test]
    async fn test_predict_on_unloaded_model_fails() {
        // Given
        let engine = engine();
        let model_id = engine.make_id(&train_set()).unwrap().to_string();

        // When
        let error = engine.predict("book a flight", &model_id).await.unwrap_err();

        // Then
        assert_eq!(format!("model {} not loaded", model_id), error.to_string());
    }

    #[tokio::test]
    async fn test_too_large_model_is_not_cached() {
        // Given
        let engine = engine_with("1b", FakeLanguageTools::default());
        let model = engine
            .train("train", &train_set(), TrainingOptions::default())
            .await
            .unwrap();

        // When
        let error = engine.load_model(&model).await.unwrap_err();

        // Then
        assert!(error.to_string().starts_with("Can't load model"));
        assert!(!engine.has_model(&model.id));
        assert_eq!(0, engine.models.lock().size);
    }

    #[tokio::test]
    async fn test_unload_model() {
        // Given
        let engine = engine();
        let model = engine
            .train("train", &train_set(), TrainingOptions::default())
            .await
            .unwrap();
        engine.load_model(&model).await.unwrap();
        engine.load_model(&model).await.unwrap();

        // When
        let unloaded = engine.unload_model(&model.id);

        // Then
        assert!(unloaded);
        assert!(!engine.has_model(&model.id));
        assert!(!engine.unload_model(&model.id));
        assert_eq!(0, engine.models.lock().size);
    }

    #[tokio::test]
    async fn test_training_twice_with_same_id_fails() {
        // Given
        let engine = engine();
        let _cancel = engine.register_training("train").unwrap();

        // When
        let error = engine
            .train("train", &train_set(), TrainingOptions::default())
            .await
            .unwrap_err();

        // Then
        match error.downcast_ref::<NluEngineError>() {
            Some(NluEngineError::TrainingAlreadyStarted(id)) => assert_eq!("train", id),
            _ => panic!("Unexpected error: {}", error),
        }
    }

    #[tokio::test]
    async fn test_cancel_training() {
        // Given
        let engine = engine();
        let cancel = engine.register_training("train").unwrap();

        // When
        let canceled = engine.cancel_training("train");

        // Then
        assert!(canceled);
        assert!(cancel.is_canceled());
        assert!(!engine.cancel_training("other"));
    }

    #[tokio::test]
    async fn test_retraining_from_previous_model() {
        // Given
        let engine = engine();
        let previous = engine
            .train("first", &train_set(), TrainingOptions::default())
            .await
            .unwrap();
        engine.load_model(&previous).await.unwrap();
        let mut train_set = train_set();
        train_set.intents.push(IntentDefinition {
            name: "greet".to_string(),
            contexts: vec!["chitchat".to_string()],
            slots: vec![],
            utterances: vec!["hello".to_string(), "hi there".to_string()],
        });
        let options = TrainingOptions {
            previous_model: Some(previous.model_id().unwrap()),
            ..TrainingOptions::default()
        };

        // When
        let model = engine.train("second", &train_set, options).await.unwrap();
        engine.load_model(&model).await.unwrap();
        let prediction = engine.predict("hi there", &model.id).await.unwrap();

        // Then
        assert_ne!(previous.id, model.id);
        assert_eq!(
            previous.data.decode().unwrap().intent_model_by_ctx["global"],
            model.data.decode().unwrap().intent_model_by_ctx["global"]
        );
        assert!(prediction
            .contexts
            .iter()
            .flat_map(|c| c.intents.iter())
            .any(|i| i.name == "greet" && i.confidence == 1.0));
    }

    #[tokio::test]
    async fn test_detect_language() {
        // Given
        let engine = engine_with(
            "850mb",
            FakeLanguageTools {
                identified_language: None,
                ..FakeLanguageTools::default()
            },
        );
        let model = engine
            .train("train", &train_set(), TrainingOptions::default())
            .await
            .unwrap();
        let models = btreemap! { "en".to_string() => model.id.clone() };

        // When
        let missing = engine.detect_language("book a flight", &models).await;
        engine.load_model(&model).await.unwrap();
        let known = engine.detect_language("Book a flight!", &models).await.unwrap();
        let unknown = engine.detect_language("zzz qqq", &models).await.unwrap();

        // Then
        assert!(missing
            .unwrap_err()
            .to_string()
            .contains("No models loaded for the following languages: [en]"));
        assert_eq!("en", known);
        assert_eq!(NA_LANGUAGE, unknown);
    }

    #[tokio::test]
    async fn test_identified_language_is_kept_when_loaded() {
        // Given
        let engine = engine();
        let model = engine
            .train("train", &train_set(), TrainingOptions::default())
            .await
            .unwrap();
        engine.load_model(&model).await.unwrap();
        let models = btreemap! { "en".to_string() => model.id.clone() };

        // When
        let language = engine.detect_language("zzz qqq", &models).await.unwrap();

        // Then
        assert_eq!("en", language);
    }
}
