use failure::{bail, format_err};
use itertools::Itertools;
use linfa::traits::Fit;
use linfa::DatasetBase;
use linfa_clustering::KMeans;
use log::debug;
use ndarray::prelude::*;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;

use crate::errors::*;
use crate::toolkit::*;
use crate::worker::TaskContext;

const TOLERANCE: f64 = 1e-6;
/// Number of differently seeded runs, the one with the lowest inertia is kept
const NB_RUNS: u64 = 4;

/// K-means with k-means++ initialization, backed by `linfa-clustering`
#[derive(Debug, Default)]
pub struct LinfaKmeans;

impl Clusterer for LinfaKmeans {
    fn kmeans(
        &self,
        points: &[Vec<f32>],
        k: usize,
        options: &KmeansOptions,
        context: &TaskContext,
    ) -> Result<KmeansResult> {
        if points.is_empty() || k == 0 {
            bail!("Cannot build {} clusters out of {} points", k, points.len());
        }
        let dimension = points[0].len();
        if points.iter().any(|p| p.len() != dimension) {
            bail!("All the points must have {} dimensions", dimension);
        }
        let records = Array2::from_shape_vec(
            (points.len(), dimension),
            points.iter().flatten().map(|x| *x as f64).collect(),
        )?;
        let dataset = DatasetBase::from(records.clone());
        let k = k.min(points.len());

        let mut best: Option<(f64, Array2<f64>)> = None;
        for run in 0..NB_RUNS {
            context.check_canceled()?;
            let rng = Xoshiro256Plus::seed_from_u64(options.seed.wrapping_add(run));
            let fitted = KMeans::params_with_rng(k, rng)
                .n_runs(1)
                .max_n_iterations(options.iterations.max(1) as u64)
                .tolerance(TOLERANCE)
                .fit(&dataset)
                .map_err(|e| format_err!("{}", e));
            match fitted {
                Ok(model) => {
                    let centroids = model.centroids().to_owned();
                    let inertia = inertia(&records, &centroids);
                    if best.as_ref().map(|(b, _)| inertia < *b).unwrap_or(true) {
                        best = Some((inertia, centroids));
                    }
                }
                Err(e) => debug!("{}: k-means run {} skipped: {}", context.name(), run, e),
            }
            context.report_progress((run + 1) as f64 / NB_RUNS as f64);
        }
        let centroids = match best {
            Some((_, centroids)) => centroids.mapv(|x| x as f32),
            None => bail!("All the k-means runs failed on {} points", points.len()),
        };

        let data = records.mapv(|x| x as f32);
        let clusters = data
            .outer_iter()
            .map(|point| nearest_centroid(&centroids, point))
            .collect_vec();
        let centroids = centroids
            .outer_iter()
            .enumerate()
            .map(|(cluster, centroid)| {
                let members = clusters
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| **c == cluster)
                    .map(|(i, _)| i)
                    .collect_vec();
                Centroid {
                    centroid: centroid.to_vec(),
                    error: members
                        .iter()
                        .map(|i| squared_distance(data.row(*i), centroid))
                        .sum(),
                    size: members.len(),
                }
            })
            .collect();
        Ok(KmeansResult {
            clusters,
            centroids,
            iterations: options.iterations,
        })
    }
}

fn inertia(records: &Array2<f64>, centroids: &Array2<f64>) -> f64 {
    records
        .outer_iter()
        .map(|point| {
            centroids
                .outer_iter()
                .map(|c| {
                    point
                        .iter()
                        .zip(c.iter())
                        .map(|(x, y)| (x - y) * (x - y))
                        .sum::<f64>()
                })
                .fold(::std::f64::INFINITY, f64::min)
        })
        .sum()
}

pub(crate) fn squared_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub(crate) fn nearest_centroid(centroids: &Array2<f32>, point: ArrayView1<f32>) -> usize {
    centroids
        .outer_iter()
        .map(|centroid| squared_distance(point, centroid))
        .enumerate()
        .fold((0, ::std::f32::INFINITY), |best, (i, d)| {
            if d < best.1 {
                (i, d)
            } else {
                best
            }
        })
        .0
}
