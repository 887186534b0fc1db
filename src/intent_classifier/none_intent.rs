use std::collections::HashMap;

use itertools::Itertools;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};

use crate::errors::*;
use crate::language::LanguageTools;
use crate::utils::mean;
use crate::utterance::{build_utterance_batch, Utterance};

/// Tokens weighted below this are considered as carrying no intent specific information
pub const SMALL_TFIDF: f32 = 0.3;

const NONE_UTTERANCES_MIN: usize = 20;
const NONE_UTTERANCES_MAX: usize = 200;
const JUNK_VOCAB_SIZE: usize = 500;
const JUNK_TOKEN_MIN: f32 = 1.0;
const JUNK_TOKEN_MAX: f32 = 20.0;
const MAX_NGRAM_SIZE: usize = 3;

/// Synthesizes the utterances of the "none" intent out of the vocabulary of the training
/// utterances: stop words, low weight words and junk words made of pieces of real words
pub async fn make_none_utterances(
    all_utterances: &[&Utterance],
    language: &str,
    tools: &dyn LanguageTools,
    seed: u64,
    vocab_vectors: Option<&HashMap<String, Vec<f32>>>,
) -> Result<Vec<Utterance>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let tokens = all_utterances
        .iter()
        .flat_map(|u| u.tokens.iter())
        .filter(|t| !t.is_space)
        .collect_vec();
    let vocab = tokens.iter().map(|t| t.normalized()).unique().collect_vec();

    let junk_words = generate_junk_words(&vocab, &mut rng);
    let avg_tokens = mean(
        all_utterances
            .iter()
            .map(|u| u.tokens.iter().filter(|t| !t.is_space).count() as f32),
    );
    let nb_utterances = (all_utterances.len() * 2 / 3).max(NONE_UTTERANCES_MIN).min(NONE_UTTERANCES_MAX);
    let stop_words = tools.stop_words(language).await?;
    let low_weight_words = tokens
        .iter()
        .filter(|t| t.tfidf <= SMALL_TFIDF)
        .map(|t| t.normalized())
        .unique()
        .sorted()
        .collect_vec();
    let separator = if tools.is_space_separated(language) {
        " "
    } else {
        ""
    };

    let vocab_pool = stop_words
        .iter()
        .chain(low_weight_words.iter())
        .cloned()
        .unique()
        .collect_vec();
    let mixed_pool = junk_words
        .iter()
        .chain(stop_words.iter())
        .cloned()
        .collect_vec();

    let mut texts = vec![];
    for pool in &[&mixed_pool, &vocab_pool, &junk_words] {
        for _ in 0..nb_utterances {
            let text = sample_utterance(pool, avg_tokens, separator, &mut rng);
            if !text.is_empty() {
                texts.push(text);
            }
        }
    }
    texts.extend(stop_words.iter().filter(|w| !w.trim().is_empty()).cloned());
    debug!(
        "Generated {} none utterances out of {} junk words and {} stop words",
        texts.len(),
        junk_words.len(),
        stop_words.len()
    );

    build_utterance_batch(&texts, language, tools, vocab_vectors).await
}

fn sample_utterance(pool: &[String], avg_tokens: f32, separator: &str, rng: &mut StdRng) -> String {
    let upper = (avg_tokens * 2.0).max(1.0);
    let nb_words = rng.random_range(1.0..=upper).round() as usize;
    pool.choose_multiple(rng, nb_words).join(separator)
}

/// Distinct char n-grams of the vocabulary, from unigrams to trigrams
fn vocab_ngrams(vocab: &[String]) -> Vec<String> {
    vocab
        .iter()
        .flat_map(|word| {
            let chars = word.chars().collect_vec();
            (1..=MAX_NGRAM_SIZE)
                .flat_map(|n| {
                    chars
                        .windows(n)
                        .map(|w| w.iter().collect::<String>())
                        .collect_vec()
                })
                .collect_vec()
        })
        .unique()
        .collect()
}

fn generate_junk_words(vocab: &[String], rng: &mut StdRng) -> Vec<String> {
    let grams = vocab_ngrams(vocab);
    if grams.is_empty() {
        return vec![];
    }
    let mean_word_size = mean(vocab.iter().map(|w| w.chars().count() as f32));
    let min_size = JUNK_TOKEN_MIN.max(mean_word_size / 2.0);
    let max_size = JUNK_TOKEN_MAX.min(mean_word_size * 1.5).max(min_size);

    (0..JUNK_VOCAB_SIZE)
        .map(|_| {
            let size = rng.random_range(min_size..=max_size);
            let mut word = String::new();
            while (word.chars().count() as f32) < size {
                match grams.choose(rng) {
                    Some(gram) => word.push_str(gram),
                    None => break,
                }
            }
            word
        })
        .collect()
}
