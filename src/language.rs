use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde_derive::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::entities::EntityExtraction;
use crate::errors::*;

/// Part of speech assigned to tokens when the language has no tagger
pub const POS_UNAVAILABLE: &str = "N/A";

pub const POS_SPACE: &str = "SPACE";

pub const POS_CLASSES: &[&str] = &[
    "ADJ", "ADP", "ADV", "AUX", "CONJ", "CCONJ", "DET", "INTJ", "NOUN", "NUM", "PART", "PRON",
    "PROPN", "PUNCT", "SCONJ", "SYM", "VERB", "X", POS_SPACE,
];

const NON_SPACE_SEPARATED_LANGUAGES: &[&str] = &["ja", "zh", "th"];

const POS_LANGUAGES: &[&str] = &["en", "fr"];

pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageServerSpecs {
    pub dimensions: usize,
    pub domain: String,
    pub version: String,
}

/// Tokenizer, vectorizer and tagger of a language server
#[async_trait]
pub trait LanguageTools: Send + Sync {
    /// Tokens of each utterance, in order. Separating spaces may be returned as their own
    /// tokens or be omitted.
    async fn tokenize(&self, utterances: &[String], language: &str) -> Result<Vec<Vec<String>>>;

    async fn vectorize(&self, tokens: &[String], language: &str) -> Result<Vec<Vec<f32>>>;

    async fn pos_tag(&self, tokens: &[Vec<String>], language: &str) -> Result<Vec<Vec<String>>>;

    async fn stop_words(&self, language: &str) -> Result<Vec<String>>;

    async fn identify_language(&self, text: &str) -> Result<Option<String>>;

    fn languages(&self) -> Vec<String>;

    fn specifications(&self) -> LanguageServerSpecs;

    fn is_space_separated(&self, language: &str) -> bool {
        !NON_SPACE_SEPARATED_LANGUAGES.contains(&language)
    }

    fn is_pos_available(&self, language: &str) -> bool {
        POS_LANGUAGES.contains(&language)
    }
}

/// Extractor of numeric, date, duration... entities
#[async_trait]
pub trait SystemEntityExtractor: Send + Sync {
    async fn extract_multiple(
        &self,
        texts: &[String],
        language: &str,
        progress: ProgressFn<'_>,
        use_cache: bool,
    ) -> Result<Vec<Vec<EntityExtraction>>>;
}

/// Runs `operation` until it succeeds, waiting with an exponential backoff between attempts
/// and bounding each attempt with the operation timeout
pub async fn with_retry<T, F, Fut>(
    description: &str,
    config: &RetryConfig,
    mut operation: F,
) -> ::std::result::Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        match tokio::time::timeout(config.operation_timeout(), operation()).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => {
                last_error = format!("timed out after {}ms", config.operation_timeout)
            }
        }
        if attempt < max_attempts {
            let delay = config.backoff(attempt);
            warn!(
                "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                description, attempt, max_attempts, last_error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
    Err(format!(
        "{} failed after {} attempts: {}",
        description, max_attempts, last_error
    ))
}

pub struct ResilientLanguageTools {
    inner: Arc<dyn LanguageTools>,
    retry: RetryConfig,
}

impl ResilientLanguageTools {
    pub fn new(inner: Arc<dyn LanguageTools>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }

    async fn call<T, F, Fut>(&self, description: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        with_retry(description, &self.retry, operation)
            .await
            .map_err(|e| NluEngineError::LanguageService(e).into())
    }
}

#[async_trait]
impl LanguageTools for ResilientLanguageTools {
    async fn tokenize(&self, utterances: &[String], language: &str) -> Result<Vec<Vec<String>>> {
        self.call("tokenize", || self.inner.tokenize(utterances, language))
            .await
    }

    async fn vectorize(&self, tokens: &[String], language: &str) -> Result<Vec<Vec<f32>>> {
        self.call("vectorize", || self.inner.vectorize(tokens, language))
            .await
    }

    async fn pos_tag(&self, tokens: &[Vec<String>], language: &str) -> Result<Vec<Vec<String>>> {
        self.call("pos tagging", || self.inner.pos_tag(tokens, language))
            .await
    }

    async fn stop_words(&self, language: &str) -> Result<Vec<String>> {
        self.call("stop words", || self.inner.stop_words(language))
            .await
    }

    async fn identify_language(&self, text: &str) -> Result<Option<String>> {
        self.call("language identification", || {
            self.inner.identify_language(text)
        })
        .await
    }

    fn languages(&self) -> Vec<String> {
        self.inner.languages()
    }

    fn specifications(&self) -> LanguageServerSpecs {
        self.inner.specifications()
    }

    fn is_space_separated(&self, language: &str) -> bool {
        self.inner.is_space_separated(language)
    }

    fn is_pos_available(&self, language: &str) -> bool {
        self.inner.is_pos_available(language)
    }
}

pub struct ResilientSystemEntityExtractor {
    inner: Arc<dyn SystemEntityExtractor>,
    retry: RetryConfig,
}

impl ResilientSystemEntityExtractor {
    pub fn new(inner: Arc<dyn SystemEntityExtractor>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl SystemEntityExtractor for ResilientSystemEntityExtractor {
    async fn extract_multiple(
        &self,
        texts: &[String],
        language: &str,
        progress: ProgressFn<'_>,
        use_cache: bool,
    ) -> Result<Vec<Vec<EntityExtraction>>> {
        with_retry("system entity extraction", &self.retry, || {
            self.inner
                .extract_multiple(texts, language, progress, use_cache)
        })
        .await
        .map_err(|e| NluEngineError::SystemEntityService(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use failure::format_err;

    use crate::testutils::FakeLanguageTools;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: 1,
            max_backoff: 5,
            operation_timeout: 1000,
        }
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_failures() {
        // Given
        let calls = AtomicUsize::new(0);

        // When
        let result = with_retry("flaky", &fast_retry(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(format_err!("connection refused"))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        // Then
        assert_eq!(Ok(2), result);
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max_attempts() {
        // Given
        let calls = AtomicUsize::new(0);

        // When
        let result: ::std::result::Result<(), String> =
            with_retry("broken", &fast_retry(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(format_err!("connection refused")) }
            })
            .await;

        // Then
        assert_eq!(3, calls.load(Ordering::SeqCst));
        let error = result.unwrap_err();
        assert!(error.contains("broken failed after 3 attempts"));
        assert!(error.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_resilient_tools_delegate_to_inner_tools() {
        // Given
        let tools = ResilientLanguageTools::new(Arc::new(FakeLanguageTools::default()), fast_retry());

        // When
        let tokens = tools
            .tokenize(&["book a flight".to_string()], "en")
            .await
            .unwrap();

        // Then
        assert_eq!(vec![vec!["book", " ", "a", " ", "flight"]], tokens);
        assert!(tools.is_space_separated("en"));
        assert!(!tools.is_space_separated("ja"));
    }
}
