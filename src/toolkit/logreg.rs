use failure::{bail, format_err};
use itertools::Itertools;
use linfa::traits::Fit;
use linfa::Dataset;
use linfa_logistic::{MultiFittedLogisticRegression, MultiLogisticRegression};
use ndarray::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::errors::*;
use crate::toolkit::*;
use crate::worker::TaskContext;

/// Multinomial logistic regression with L2 regularization, fitted by `linfa-logistic`
#[derive(Debug, Default)]
pub struct LogRegClassifier;

#[derive(Debug, Serialize, Deserialize)]
enum LogRegModel {
    /// Less than two labels, nothing to learn
    Constant(Vec<String>),
    Fitted {
        labels: Vec<String>,
        nb_features: usize,
        regression: MultiFittedLogisticRegression<f64, String>,
    },
}

impl ClassifierTrainer for LogRegClassifier {
    fn train(
        &self,
        points: &[DataPoint],
        options: &ClassifierOptions,
        context: &TaskContext,
    ) -> Result<Vec<u8>> {
        context.check_canceled()?;
        let labels = points
            .iter()
            .map(|p| p.label.clone())
            .unique()
            .sorted()
            .collect_vec();
        if labels.len() < 2 {
            context.report_progress(1.0);
            return Ok(bincode::serialize(&LogRegModel::Constant(labels))?);
        }
        let nb_features = points.first().map(|p| p.coordinates.len()).unwrap_or(0);
        if let Some(point) = points.iter().find(|p| p.coordinates.len() != nb_features) {
            bail!(
                "Inconsistent number of features: expected {} but found {} for label '{}'",
                nb_features,
                point.coordinates.len(),
                point.label
            );
        }

        let records = Array2::from_shape_vec(
            (points.len(), nb_features),
            points
                .iter()
                .flat_map(|p| p.coordinates.iter().map(|x| *x as f64))
                .collect(),
        )?;
        let targets = points.iter().map(|p| p.label.clone()).collect::<Array1<_>>();
        let dataset = Dataset::new(records, targets);
        context.report_progress(0.0);
        let regression = MultiLogisticRegression::default()
            .alpha(1.0 / options.c.max(1e-6) as f64)
            .max_iterations(options.max_iterations.max(1) as u64)
            .fit(&dataset)
            .map_err(|e| format_err!("Logistic regression failed: {}", e))?;
        context.check_canceled()?;
        context.report_progress(1.0);
        Ok(bincode::serialize(&LogRegModel::Fitted {
            labels,
            nb_features,
            regression,
        })?)
    }

    fn load(&self, model: &[u8]) -> Result<Box<dyn ClassifierPredictor>> {
        let memory_size = model.len();
        let model: LogRegModel = bincode::deserialize(model)?;
        Ok(Box::new(LogRegPredictor { model, memory_size }))
    }
}

pub struct LogRegPredictor {
    model: LogRegModel,
    memory_size: usize,
}

impl ClassifierPredictor for LogRegPredictor {
    fn predict(&self, coordinates: &[f32]) -> Result<Vec<LabelConfidence>> {
        let (nb_features, regression) = match &self.model {
            LogRegModel::Constant(labels) => {
                return Ok(labels
                    .first()
                    .map(|label| {
                        vec![LabelConfidence {
                            label: label.clone(),
                            confidence: 1.0,
                        }]
                    })
                    .unwrap_or_else(Vec::new))
            }
            LogRegModel::Fitted {
                nb_features,
                regression,
                ..
            } => (*nb_features, regression),
        };
        if coordinates.len() != nb_features {
            bail!(
                "Expected {} features but found {}",
                nb_features,
                coordinates.len()
            );
        }
        let features = Array2::from_shape_vec(
            (1, nb_features),
            coordinates.iter().map(|x| *x as f64).collect(),
        )?;
        let probabilities = regression.predict_probabilities(&features);
        let mut predictions = regression
            .classes()
            .iter()
            .zip(probabilities.row(0).iter())
            .map(|(label, confidence)| LabelConfidence {
                label: label.clone(),
                confidence: *confidence as f32,
            })
            .collect_vec();
        sort_by_confidence(&mut predictions);
        Ok(predictions)
    }

    fn labels(&self) -> Vec<String> {
        match &self.model {
            LogRegModel::Constant(labels) => labels.clone(),
            LogRegModel::Fitted { labels, .. } => labels.clone(),
        }
    }

    fn memory_size(&self) -> usize {
        self.memory_size
    }
}
