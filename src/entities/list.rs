use std::collections::BTreeMap;

use itertools::Itertools;
use lru_cache::LruCache;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

use crate::entities::fuzzy::{jaro_winkler_similarity, levenshtein_similarity};
use crate::entities::{EntityExtraction, EntityKind};
use crate::errors::*;
use crate::language::LanguageTools;
use crate::models::ListEntityDefinition;
use crate::utils::EntityName;
use crate::utterance::Utterance;

pub const LIST_ENTITY_CACHE_SIZE: usize = 1000;
const ENTITY_SCORE_THRESHOLD: f32 = 0.6;
const MIN_FUZZY_LENGTH: usize = 4;

pub type CacheDump = Vec<(String, Vec<EntityExtraction>)>;

/// Extractions of one list entity, keyed by lowercased utterance
pub struct EntityCache(LruCache<String, Vec<EntityExtraction>>);

impl EntityCache {
    pub fn new(capacity: usize) -> Self {
        EntityCache(LruCache::new(capacity))
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<EntityExtraction>> {
        self.0.get_mut(key).cloned()
    }

    pub fn insert(&mut self, key: String, value: Vec<EntityExtraction>) {
        self.0.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries from the least to the most recently used
    pub fn dump(&self) -> CacheDump {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn restore(&mut self, dump: &[(String, Vec<EntityExtraction>)]) {
        for (key, value) in dump {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

/// List entity as stored in a model: the live cache is replaced by a dump of its content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdListEntityModel {
    pub entity_name: EntityName,
    pub fuzzy: f64,
    pub sensitive: bool,
    /// canonical value -> tokens of each of its synonyms, the canonical value included
    pub mappings_tokens: BTreeMap<String, Vec<Vec<String>>>,
    #[serde(default)]
    pub cache: CacheDump,
}

pub struct ListEntityModel {
    pub entity_name: EntityName,
    pub fuzzy: f64,
    pub sensitive: bool,
    pub mappings_tokens: BTreeMap<String, Vec<Vec<String>>>,
    cache: Mutex<EntityCache>,
}

/// Token of the text being searched for list entities
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceToken {
    pub value: String,
    pub offset: usize,
    pub is_space: bool,
}

impl SurfaceToken {
    pub fn from_utterance(utterance: &Utterance) -> Vec<Self> {
        utterance
            .tokens
            .iter()
            .map(|t| SurfaceToken {
                value: t.value.clone(),
                offset: t.offset,
                is_space: t.is_space,
            })
            .collect()
    }

    fn char_len(&self) -> usize {
        self.value.chars().count()
    }
}

struct Candidate {
    score: f32,
    canonical: String,
    start: usize,
    end: usize,
    source: String,
    eliminated: bool,
}

impl ListEntityModel {
    pub fn new(
        entity_name: &str,
        fuzzy: f64,
        sensitive: bool,
        mappings_tokens: BTreeMap<String, Vec<Vec<String>>>,
    ) -> Self {
        Self {
            entity_name: entity_name.to_string(),
            fuzzy,
            sensitive,
            mappings_tokens,
            cache: Mutex::new(EntityCache::new(LIST_ENTITY_CACHE_SIZE)),
        }
    }

    pub fn from_cold(cold: &ColdListEntityModel) -> Self {
        let model = Self::new(
            &cold.entity_name,
            cold.fuzzy,
            cold.sensitive,
            cold.mappings_tokens.clone(),
        );
        model.warm_cache(&cold.cache);
        model
    }

    pub fn to_cold(&self) -> ColdListEntityModel {
        ColdListEntityModel {
            entity_name: self.entity_name.clone(),
            fuzzy: self.fuzzy,
            sensitive: self.sensitive,
            mappings_tokens: self.mappings_tokens.clone(),
            cache: self.cache.lock().dump(),
        }
    }

    pub fn warm_cache(&self, dump: &[(String, Vec<EntityExtraction>)]) {
        self.cache.lock().restore(dump)
    }

    /// Whether both models would extract the same entities
    pub fn has_same_definition(&self, other: &ColdListEntityModel) -> bool {
        self.entity_name == other.entity_name
            && self.fuzzy == other.fuzzy
            && self.sensitive == other.sensitive
            && self.mappings_tokens == other.mappings_tokens
    }

    pub fn cached(&self, key: &str) -> Option<Vec<EntityExtraction>> {
        self.cache.lock().get(key)
    }

    pub fn cache_results<I: IntoIterator<Item = (String, Vec<EntityExtraction>)>>(&self, results: I) {
        let mut cache = self.cache.lock();
        for (key, value) in results {
            cache.insert(key, value);
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn memory_size(&self) -> usize {
        self.mappings_tokens
            .iter()
            .map(|(canonical, occurrences)| {
                canonical.len()
                    + occurrences
                        .iter()
                        .flatten()
                        .map(|t| t.len())
                        .sum::<usize>()
            })
            .sum::<usize>()
            + self.cache_len() * ::std::mem::size_of::<EntityExtraction>()
    }

    /// Searches the text for token windows resembling one of the synonyms
    pub fn extract(&self, tokens: &[SurfaceToken]) -> Vec<EntityExtraction> {
        let mut candidates = vec![];
        let mut longest_candidate = 0;
        for (canonical, occurrences) in self.mappings_tokens.iter() {
            for occurrence in occurrences.iter().filter(|o| !o.is_empty()) {
                let occurrence_length: usize = occurrence.iter().map(|t| t.chars().count()).sum();
                longest_candidate = longest_candidate.max(occurrence_length);
                let occurrence_lowercase = occurrence.iter().map(|t| t.to_lowercase()).collect_vec();
                for start in 0..tokens.len() {
                    if tokens[start].is_space {
                        continue;
                    }
                    let workset = take_until(tokens, start, occurrence_length);
                    if workset.is_empty() {
                        continue;
                    }
                    let workset_values = workset.iter().map(|t| t.value.clone()).collect_vec();
                    let workset_lowercase = workset_values.iter().map(|t| t.to_lowercase()).collect_vec();

                    let structural_score = structural_score(&workset_values, occurrence);
                    let use_fuzzy = self.fuzzy < 1.0
                        && workset_lowercase.concat().chars().count() >= MIN_FUZZY_LENGTH;
                    let score = if use_fuzzy {
                        let fuzzy_score = fuzzy_score(&workset_lowercase, &occurrence_lowercase);
                        let fuzzy_factor = if fuzzy_score as f64 >= self.fuzzy {
                            fuzzy_score
                        } else {
                            0.0
                        };
                        fuzzy_factor * structural_score
                    } else {
                        exact_score(&workset_values, occurrence) * structural_score
                    };

                    candidates.push(Candidate {
                        score: (score * 100.0).round() / 100.0,
                        canonical: canonical.clone(),
                        start,
                        end: start + workset.len() - 1,
                        source: workset_values.concat(),
                        eliminated: false,
                    });
                }
            }
        }

        eliminate_overlapping_candidates(&mut candidates, tokens.len(), longest_candidate);

        candidates
            .into_iter()
            .filter(|c| !c.eliminated && c.score >= ENTITY_SCORE_THRESHOLD)
            .map(|c| EntityExtraction {
                entity_name: self.entity_name.clone(),
                kind: EntityKind::List,
                value: c.canonical,
                source: c.source,
                confidence: c.score,
                char_start: tokens[c.start].offset,
                char_end: tokens[c.end].offset + tokens[c.end].char_len(),
                sensitive: self.sensitive,
            })
            .sorted_by_key(|e| e.char_start)
            .collect()
    }
}

/// Tokenizes every synonym so that they can be compared with utterance tokens
pub async fn make_list_entity_model(
    definition: &ListEntityDefinition,
    language: &str,
    tools: &dyn LanguageTools,
) -> Result<ListEntityModel> {
    let synonyms = definition.synonyms();
    let all_values = synonyms
        .iter()
        .flat_map(|(canonical, synonyms)| synonyms.iter().chain(Some(canonical)))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unique()
        .collect_vec();
    let raw_tokens = if all_values.is_empty() {
        vec![]
    } else {
        tools.tokenize(&all_values, language).await?
    };
    let value_tokens: BTreeMap<&str, Vec<String>> = all_values
        .iter()
        .zip(raw_tokens.iter())
        .map(|(value, tokens)| {
            let aligned = Utterance::new(value, tokens, language)
                .tokens
                .into_iter()
                .map(|t| t.value)
                .collect();
            (value.as_str(), aligned)
        })
        .collect();
    let mappings_tokens = synonyms
        .iter()
        .map(|(canonical, synonyms)| {
            let occurrences = synonyms
                .iter()
                .chain(Some(canonical))
                .filter_map(|v| value_tokens.get(v.trim()).cloned())
                .collect();
            (canonical.clone(), occurrences)
        })
        .collect();
    Ok(ListEntityModel::new(
        &definition.name,
        definition.fuzzy,
        definition.sensitive,
        mappings_tokens,
    ))
}

/// Tokens starting at `start` whose total length is the closest to `desired_length`
fn take_until(tokens: &[SurfaceToken], start: usize, desired_length: usize) -> &[SurfaceToken] {
    let desired = desired_length as i64;
    let mut total = 0i64;
    let mut end = start;
    for token in tokens[start..].iter() {
        let to_add = token.char_len() as i64;
        if total > 0 && (desired - total).abs() < (desired - total - to_add).abs() {
            break;
        }
        if total >= desired {
            break;
        }
        total += to_add;
        end += 1;
    }
    let mut workset = &tokens[start..end];
    if workset.last().map(|t| t.is_space).unwrap_or(false) {
        workset = &workset[..workset.len() - 1];
    }
    workset
}

fn exact_score(a: &[String], b: &[String]) -> f32 {
    if a.concat() == b.concat() {
        1.0
    } else {
        0.0
    }
}

fn fuzzy_score(a: &[String], b: &[String]) -> f32 {
    let lhs = a.concat();
    let rhs = b.concat();
    (levenshtein_similarity(&lhs, &rhs) + jaro_winkler_similarity(&lhs, &rhs)) / 2.0
}

/// Resemblance of the shapes of both token lists: shared chars, number and size of tokens
fn structural_score(a: &[String], b: &[String]) -> f32 {
    let charset_a = a.iter().flat_map(|t| t.chars()).unique().collect_vec();
    let charset_b = b.iter().flat_map(|t| t.chars()).unique().collect_vec();
    let charset_score = jaccard(&charset_a, &charset_b);
    let lowercase_a = charset_a.iter().flat_map(|c| c.to_lowercase()).unique().collect_vec();
    let lowercase_b = charset_b.iter().flat_map(|c| c.to_lowercase()).unique().collect_vec();
    let lowercase_charset_score = jaccard(&lowercase_a, &lowercase_b);
    let final_charset_score = (charset_score + lowercase_charset_score) / 2.0;

    let quantity_a = a.iter().filter(|t| t.chars().count() > 1).count().max(1) as f32;
    let quantity_b = b.iter().filter(|t| t.chars().count() > 1).count().max(1) as f32;
    let token_quantity_score = quantity_a.min(quantity_b) / quantity_a.max(quantity_b);

    let size_a = a.iter().map(|t| t.chars().count()).sum::<usize>() as f32;
    let size_b = b.iter().map(|t| t.chars().count()).sum::<usize>() as f32;
    let token_size_score = if size_a.max(size_b) > 0.0 {
        size_a.min(size_b) / size_a.max(size_b)
    } else {
        0.0
    };

    (final_charset_score * token_quantity_score * token_size_score).sqrt()
}

fn jaccard(a: &[char], b: &[char]) -> f32 {
    let union = a.iter().chain(b.iter()).unique().count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.iter().filter(|c| b.contains(c)).count();
    intersection as f32 / union as f32
}

/// For every token, only the best candidate covering it survives. Longer matches are
/// slightly favored, up to the length of the longest synonym.
fn eliminate_overlapping_candidates(
    candidates: &mut [Candidate],
    nb_tokens: usize,
    longest_candidate: usize,
) {
    let rank = |c: &Candidate| {
        c.score * (c.source.chars().count().min(longest_candidate) as f32).powf(0.2)
    };
    for token_index in 0..nb_tokens {
        let covering = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.eliminated && c.start <= token_index && token_index <= c.end)
            .map(|(i, c)| (i, rank(c)))
            .collect_vec();
        if covering.len() < 2 {
            continue;
        }
        let winner = covering
            .iter()
            .fold(covering[0], |best, current| {
                if current.1 > best.1 {
                    *current
                } else {
                    best
                }
            })
            .0;
        for (index, _) in covering {
            if index != winner {
                candidates[index].eliminated = true;
            }
        }
    }
}
