//! Contracts of the numeric solvers used by the trainers, along with the default
//! implementations backed by crfsuite and linfa. Solvers are synchronous: they run on the task queue and talk to the
//! rest of the engine through their `TaskContext`.

pub mod kmeans;
pub mod logreg;
pub mod tagger;

use std::collections::HashMap;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::errors::*;
use crate::worker::TaskContext;

pub use self::kmeans::LinfaKmeans;
pub use self::logreg::LogRegClassifier;
pub use self::tagger::CrfTagger;

#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub label: String,
    pub coordinates: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelConfidence {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOptions {
    /// used by stochastic solvers only
    pub seed: u64,
    /// inverse of the L2 regularization strength
    pub c: f32,
    pub max_iterations: usize,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            c: 10.0,
            max_iterations: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceExample {
    /// one list of `name=value` features per token
    pub features: Vec<Vec<String>>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOptions {
    /// used by stochastic solvers only
    pub seed: u64,
    /// L2 regularization coefficient
    pub l2: f32,
    pub max_iterations: usize,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            l2: 0.001,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KmeansOptions {
    pub iterations: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub centroid: Vec<f32>,
    pub error: f32,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmeansResult {
    /// cluster of each input point
    pub clusters: Vec<usize>,
    pub centroids: Vec<Centroid>,
    pub iterations: usize,
}

pub trait ClassifierTrainer: Send + Sync {
    fn train(
        &self,
        points: &[DataPoint],
        options: &ClassifierOptions,
        context: &TaskContext,
    ) -> Result<Vec<u8>>;

    fn load(&self, model: &[u8]) -> Result<Box<dyn ClassifierPredictor>>;
}

pub trait ClassifierPredictor: Send + Sync {
    /// Confidences sorted by decreasing order
    fn predict(&self, coordinates: &[f32]) -> Result<Vec<LabelConfidence>>;

    fn labels(&self) -> Vec<String>;

    /// Estimated size in bytes
    fn memory_size(&self) -> usize;
}

pub trait SequenceTrainer: Send + Sync {
    fn train(
        &self,
        sequences: &[SequenceExample],
        options: &SequenceOptions,
        context: &TaskContext,
    ) -> Result<Vec<u8>>;

    fn load(&self, model: &[u8]) -> Result<Box<dyn SequenceTagger>>;
}

pub trait SequenceTagger: Send + Sync {
    /// Probability of each label, for each token of the sequence
    fn marginal(&self, features: &[Vec<String>]) -> Result<Vec<HashMap<String, f32>>>;

    fn labels(&self) -> Vec<String>;

    fn memory_size(&self) -> usize;
}

pub trait Clusterer: Send + Sync {
    fn kmeans(
        &self,
        points: &[Vec<f32>],
        k: usize,
        options: &KmeansOptions,
        context: &TaskContext,
    ) -> Result<KmeansResult>;
}

/// Set of solvers injected in the engine
#[derive(Clone)]
pub struct MlToolkit {
    pub classifier: Arc<dyn ClassifierTrainer>,
    pub sequence: Arc<dyn SequenceTrainer>,
    pub clusterer: Arc<dyn Clusterer>,
}

impl Default for MlToolkit {
    fn default() -> Self {
        Self {
            classifier: Arc::new(LogRegClassifier::default()),
            sequence: Arc::new(CrfTagger::default()),
            clusterer: Arc::new(LinfaKmeans::default()),
        }
    }
}

pub(crate) fn sort_by_confidence(predictions: &mut [LabelConfidence]) {
    predictions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(::std::cmp::Ordering::Equal)
            .then_with(|| a.label.cmp(&b.label))
    });
}
