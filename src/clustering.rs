use std::collections::HashSet;

use failure::bail;
use log::warn;
use ndarray::prelude::*;

use crate::errors::*;
use crate::toolkit::kmeans::nearest_centroid;
use crate::toolkit::{Clusterer, KmeansOptions, KmeansResult};
use crate::utterance::Utterance;
use crate::worker::TaskContext;

const NUM_CLUSTERS: usize = 8;
const MIN_CLUSTERS: usize = 2;
const KMEANS_ITERATIONS: usize = 250;
const KMEANS_SEED: u64 = 666;

/// Vectors of the distinct tokens of the utterances, each vector appearing once
pub fn distinct_token_vectors<'a, I>(utterances: I) -> Vec<Vec<f32>>
where
    I: IntoIterator<Item = &'a Utterance>,
{
    let mut seen_tokens = HashSet::new();
    let mut seen_vectors = HashSet::new();
    let mut vectors = vec![];
    for token in utterances.into_iter().flat_map(|u| u.tokens.iter()) {
        if !seen_tokens.insert(token.value.clone()) {
            continue;
        }
        let key: Vec<u32> = token.vector.iter().map(|x| x.to_bits()).collect();
        if seen_vectors.insert(key) {
            vectors.push(token.vector.clone());
        }
    }
    vectors
}

pub fn number_of_clusters(nb_distinct_vectors: usize) -> Option<usize> {
    if nb_distinct_vectors < MIN_CLUSTERS {
        None
    } else {
        Some(nb_distinct_vectors.min(NUM_CLUSTERS).max(MIN_CLUSTERS))
    }
}

/// Clusters the vectors, or returns `None` when there are too few of them to make clusters
pub fn compute_kmeans(
    vectors: &[Vec<f32>],
    clusterer: &dyn Clusterer,
    context: &TaskContext,
) -> Result<Option<KmeansResult>> {
    context.check_canceled()?;
    let k = match number_of_clusters(vectors.len()) {
        Some(k) => k,
        None => return Ok(None),
    };
    let options = KmeansOptions {
        iterations: KMEANS_ITERATIONS,
        seed: KMEANS_SEED,
    };
    Ok(Some(clusterer.kmeans(vectors, k, &options, context)?))
}

/// Clustering rebuilt from stored centroids, used to assign a cluster to new tokens
#[derive(Debug, Clone, PartialEq)]
pub struct KmeansModel {
    centroids: Array2<f32>,
}

impl KmeansModel {
    pub fn from_result(result: &KmeansResult) -> Result<Self> {
        let dimension = result
            .centroids
            .first()
            .map(|c| c.centroid.len())
            .unwrap_or(0);
        if result.centroids.is_empty() || dimension == 0 {
            bail!("Cannot rebuild a clustering without centroids");
        }
        if result.centroids.iter().any(|c| c.centroid.len() != dimension) {
            bail!("All the centroids must have {} dimensions", dimension);
        }
        let centroids = Array2::from_shape_vec(
            (result.centroids.len(), dimension),
            result
                .centroids
                .iter()
                .flat_map(|c| c.centroid.iter().cloned())
                .collect(),
        )?;
        Ok(Self { centroids })
    }

    /// Index of the closest centroid. Vectors of the wrong dimension fall in the first cluster.
    pub fn nearest(&self, point: &[f32]) -> usize {
        if point.len() != self.centroids.ncols() {
            warn!(
                "Vector of dimension {} clustered with centroids of dimension {}, using cluster 0",
                point.len(),
                self.centroids.ncols()
            );
            return 0;
        }
        nearest_centroid(&self.centroids, ArrayView1::from(point))
    }

    pub fn nearest_batch(&self, points: &[Vec<f32>]) -> Vec<usize> {
        points.iter().map(|p| self.nearest(p)).collect()
    }

    pub fn memory_size(&self) -> usize {
        self.centroids.len() * ::std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::errors::is_training_canceled;
    use crate::toolkit::{Centroid, LinfaKmeans};
    use crate::worker::CancellationToken;

    fn context() -> TaskContext {
        TaskContext::detached("clustering", CancellationToken::new())
    }

    #[test]
    fn test_no_clustering_below_two_distinct_vectors() {
        // Given
        let vectors = vec![vec![1.0, 2.0]];

        // When
        let result = compute_kmeans(&vectors, &LinfaKmeans, &context()).unwrap();

        // Then
        assert!(result.is_none());
    }

    #[test]
    fn test_number_of_clusters_is_bounded() {
        assert_eq!(None, number_of_clusters(0));
        assert_eq!(None, number_of_clusters(1));
        assert_eq!(Some(2), number_of_clusters(2));
        assert_eq!(Some(5), number_of_clusters(5));
        assert_eq!(Some(8), number_of_clusters(8));
        assert_eq!(Some(8), number_of_clusters(300));
    }

    #[test]
    fn test_compute_kmeans_uses_at_most_eight_clusters() {
        // Given
        let vectors = (0..20).map(|i| vec![i as f32, (i * i) as f32]).collect::<Vec<_>>();

        // When
        let result = compute_kmeans(&vectors, &LinfaKmeans, &context()).unwrap().unwrap();

        // Then
        assert_eq!(8, result.centroids.len());
        assert_eq!(20, result.clusters.len());
    }

    #[test]
    fn test_rebuilt_model_finds_nearest_centroid() {
        // Given
        let result = KmeansResult {
            clusters: vec![0, 1],
            centroids: vec![
                Centroid {
                    centroid: vec![0.0, 0.0],
                    error: 0.0,
                    size: 1,
                },
                Centroid {
                    centroid: vec![5.0, 5.0],
                    error: 0.0,
                    size: 1,
                },
            ],
            iterations: 1,
        };

        // When
        let model = KmeansModel::from_result(&result).unwrap();

        // Then
        assert_eq!(vec![1, 0], model.nearest_batch(&[vec![4.0, 6.0], vec![-1.0, 0.5]]));
    }

    #[test]
    fn test_vector_of_wrong_dimension_falls_in_first_cluster() {
        // Given
        let result = KmeansResult {
            clusters: vec![0, 1],
            centroids: vec![
                Centroid {
                    centroid: vec![9.0, 9.0],
                    error: 0.0,
                    size: 1,
                },
                Centroid {
                    centroid: vec![1.0, 1.0],
                    error: 0.0,
                    size: 1,
                },
            ],
            iterations: 1,
        };
        let model = KmeansModel::from_result(&result).unwrap();

        // When
        let clusters = model.nearest_batch(&[vec![1.0], vec![1.0, 1.0, 1.0]]);

        // Then
        assert_eq!(vec![0, 0], clusters);
    }

    #[test]
    fn test_compute_kmeans_stops_when_canceled() {
        // Given
        let vectors = (0..10).map(|i| vec![i as f32]).collect::<Vec<_>>();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let context = TaskContext::detached("clustering", cancel);

        // When
        let result = compute_kmeans(&vectors, &LinfaKmeans, &context);

        // Then
        assert!(is_training_canceled(&result.unwrap_err()));
    }
}
