use std::collections::{BTreeSet, HashMap};

use crfsuite::{Algorithm, Attribute, GraphicalModel, Item, Model, Trainer};
use failure::format_err;
use itertools::Itertools;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

use crate::errors::*;
use crate::toolkit::*;
use crate::worker::TaskContext;

/// Linear chain CRF trained with L-BFGS by crfsuite. Tokens are described by their sparse
/// `name=value` features.
#[derive(Debug, Default)]
pub struct CrfTagger;

#[derive(Debug, Serialize, Deserialize)]
enum CrfModel {
    /// Less than two labels, nothing to learn
    Constant(Vec<String>),
    Crf(Vec<u8>),
}

fn to_items(features: &[Vec<String>]) -> Vec<Item> {
    features
        .iter()
        .map(|token| token.iter().map(|f| Attribute::new(f.as_str(), 1.0)).collect())
        .collect()
}

impl SequenceTrainer for CrfTagger {
    fn train(
        &self,
        sequences: &[SequenceExample],
        options: &SequenceOptions,
        context: &TaskContext,
    ) -> Result<Vec<u8>> {
        context.check_canceled()?;
        let labels = sequences
            .iter()
            .flat_map(|s| s.labels.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect_vec();
        if labels.len() < 2 {
            context.report_progress(1.0);
            return Ok(bincode::serialize(&CrfModel::Constant(labels))?);
        }

        let mut trainer = Trainer::new(false);
        trainer.select(Algorithm::LBFGS, GraphicalModel::CRF1D)?;
        trainer.set("c2", &options.l2.to_string())?;
        trainer.set("max_iterations", &options.max_iterations.max(1).to_string())?;
        for sequence in sequences {
            trainer.append(&to_items(&sequence.features), &sequence.labels, 0)?;
        }
        context.check_canceled()?;
        context.report_progress(0.0);

        let model_file = tempfile::NamedTempFile::new()?;
        let model_path = model_file
            .path()
            .to_str()
            .ok_or_else(|| format_err!("Invalid crf model path {:?}", model_file.path()))?;
        trainer.train(model_path, -1)?;
        context.check_canceled()?;
        let model = ::std::fs::read(model_file.path())?;
        context.report_progress(1.0);
        Ok(bincode::serialize(&CrfModel::Crf(model))?)
    }

    fn load(&self, model: &[u8]) -> Result<Box<dyn SequenceTagger>> {
        match bincode::deserialize::<CrfModel>(model)? {
            CrfModel::Constant(labels) => Ok(Box::new(ConstantTagger { labels })),
            CrfModel::Crf(bytes) => {
                let model = Model::from_memory(&bytes)?;
                let labels = model.tagger()?.labels()?;
                Ok(Box::new(CrfPredictor {
                    model: Mutex::new(model),
                    labels,
                    bytes,
                }))
            }
        }
    }
}

pub struct CrfPredictor {
    model: Mutex<Model>,
    labels: Vec<String>,
    /// backing memory of the model, dropped after it
    bytes: Vec<u8>,
}

impl SequenceTagger for CrfPredictor {
    fn marginal(&self, features: &[Vec<String>]) -> Result<Vec<HashMap<String, f32>>> {
        if features.is_empty() {
            return Ok(vec![]);
        }
        let model = self.model.lock();
        let mut tagger = model.tagger()?;
        tagger.tag(&to_items(features))?;
        let mut marginals = Vec::with_capacity(features.len());
        for position in 0..features.len() {
            let mut token_marginals = HashMap::with_capacity(self.labels.len());
            for label in self.labels.iter() {
                let probability = tagger.marginal(label, position as i32)?;
                token_marginals.insert(label.clone(), probability as f32);
            }
            marginals.push(token_marginals);
        }
        Ok(marginals)
    }

    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn memory_size(&self) -> usize {
        self.bytes.len() + self.labels.iter().map(|l| l.len()).sum::<usize>()
    }
}

pub struct ConstantTagger {
    labels: Vec<String>,
}

impl SequenceTagger for ConstantTagger {
    fn marginal(&self, features: &[Vec<String>]) -> Result<Vec<HashMap<String, f32>>> {
        Ok(features
            .iter()
            .map(|_| self.labels.iter().map(|l| (l.clone(), 1.0)).collect())
            .collect())
    }

    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn memory_size(&self) -> usize {
        self.labels.iter().map(|l| l.len()).sum()
    }
}
