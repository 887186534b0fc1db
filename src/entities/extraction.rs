use std::sync::Arc;

use itertools::Itertools;
use log::debug;

use crate::entities::list::SurfaceToken;
use crate::entities::{EntityExtraction, ListEntityModel, PatternEntityModel};
use crate::errors::*;
use crate::language::{ProgressFn, SystemEntityExtractor};
use crate::utterance::Utterance;
use crate::worker::{join_all, CancellationToken, TaskQueue};

const EXTRACTION_CHUNK_SIZE: usize = 100;

/// Every source of entities of a model. List and pattern matching run on the task queue.
pub struct EntityExtractors {
    pub system: Arc<dyn SystemEntityExtractor>,
    pub lists: Vec<Arc<ListEntityModel>>,
    pub patterns: Arc<Vec<PatternEntityModel>>,
    pub queue: TaskQueue,
}

impl EntityExtractors {
    /// Attaches system, list and pattern entities to the utterances, in this order
    pub async fn tag_utterances(
        &self,
        task_name: &str,
        utterances: &mut [Utterance],
        language: &str,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<()> {
        if utterances.is_empty() {
            progress(1.0);
            return Ok(());
        }
        let texts = utterances.iter().map(|u| u.text()).collect_vec();

        let system_progress = |p: f64| progress(p / 3.0);
        let system_entities = self
            .system
            .extract_multiple(&texts, language, &system_progress, true)
            .await?;
        progress(1.0 / 3.0);

        let list_progress = |p: f64| progress((1.0 + p) / 3.0);
        let list_entities = self
            .extract_lists(task_name, utterances, cancel, &list_progress)
            .await?;
        progress(2.0 / 3.0);

        let pattern_entities = self.extract_patterns(task_name, &texts, cancel).await?;
        progress(1.0);

        for (index, utterance) in utterances.iter_mut().enumerate() {
            let found = system_entities
                .get(index)
                .into_iter()
                .chain(list_entities.get(index))
                .chain(pattern_entities.get(index))
                .flatten();
            for entity in found {
                utterance.tag_entity(entity.clone());
            }
        }
        Ok(())
    }

    /// List entities of each utterance. Cached utterances are not searched again, the others
    /// are searched by chunks on the task queue and then added to the cache.
    pub async fn extract_lists(
        &self,
        task_name: &str,
        utterances: &[Utterance],
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<Vec<Vec<EntityExtraction>>> {
        let mut results: Vec<Vec<EntityExtraction>> = vec![vec![]; utterances.len()];
        let nb_models = self.lists.len();
        let keys = utterances
            .iter()
            .map(|u| u.text().to_lowercase())
            .collect_vec();

        for (model_index, model) in self.lists.iter().enumerate() {
            let mut misses = vec![];
            for (index, key) in keys.iter().enumerate() {
                match model.cached(key) {
                    Some(hit) => results[index].extend(hit),
                    None => misses.push(index),
                }
            }
            debug!(
                "List entity '{}': {} cache hits, {} misses",
                model.entity_name,
                utterances.len() - misses.len(),
                misses.len()
            );

            let handles = misses
                .chunks(EXTRACTION_CHUNK_SIZE)
                .map(|chunk| {
                    let model = model.clone();
                    let tokens = chunk
                        .iter()
                        .map(|index| SurfaceToken::from_utterance(&utterances[*index]))
                        .collect_vec();
                    let name = format!("{}/list-entity-{}", task_name, model.entity_name);
                    self.queue.submit(&name, cancel.clone(), move |ctx| {
                        let mut found = Vec::with_capacity(tokens.len());
                        for (done, utterance_tokens) in tokens.iter().enumerate() {
                            ctx.check_canceled()?;
                            found.push(model.extract(utterance_tokens));
                            ctx.report_progress((done + 1) as f64 / tokens.len() as f64);
                        }
                        Ok(found)
                    })
                })
                .collect_vec();

            let nb_chunks = handles.len();
            let fresh = join_all(handles, |done| {
                progress((model_index as f64 + done as f64 / nb_chunks as f64) / nb_models as f64)
            })
            .await?
            .into_iter()
            .flatten()
            .collect_vec();

            model.cache_results(
                misses
                    .iter()
                    .zip(fresh.iter())
                    .map(|(index, found)| (keys[*index].clone(), found.clone())),
            );
            for (index, found) in misses.into_iter().zip(fresh.into_iter()) {
                results[index].extend(found);
            }
            progress((model_index + 1) as f64 / nb_models as f64);
        }
        Ok(results)
    }

    pub async fn extract_patterns(
        &self,
        task_name: &str,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<EntityExtraction>>> {
        if self.patterns.is_empty() {
            return Ok(vec![vec![]; texts.len()]);
        }
        let patterns = self.patterns.clone();
        let texts = texts.to_vec();
        let name = format!("{}/pattern-entities", task_name);
        self.queue
            .submit(&name, cancel.clone(), move |ctx| {
                texts
                    .iter()
                    .map(|text| -> Result<Vec<EntityExtraction>> {
                        ctx.check_canceled()?;
                        Ok(patterns.iter().flat_map(|p| p.extract(text)).collect())
                    })
                    .collect()
            })
            .join()
            .await
    }
}
