//! Per-label k-means using fastkmeans-rs.
//!
//! Each label's embedding matrix is summarised by `K = min(C, count)`
//! centroids. Cluster assignments are not kept.

use ndarray::{Array2, ArrayView2};

use crate::config::BankConfig;
use crate::error::{Error, Result};

pub use fastkmeans_rs::{FastKMeans, KMeansConfig, KMeansError};

/// Clustering parameters shared by every label of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// Configured cluster target `C`
    pub clusters: usize,
    /// Maximum number of Lloyd iterations
    pub max_iters: usize,
    /// Convergence tolerance on centroid movement
    pub tol: f64,
    /// Seed for centroid initialisation
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::from(&BankConfig::default())
    }
}

impl From<&BankConfig> for ClusterConfig {
    fn from(config: &BankConfig) -> Self {
        Self {
            clusters: config.clusters,
            max_iters: config.max_iters,
            tol: config.tol,
            seed: config.seed,
        }
    }
}

/// Number of centroids actually requested for a group of `count` embeddings.
pub fn effective_k(configured: usize, count: usize) -> usize {
    configured.min(count)
}

/// Compute `min(config.clusters, N)` centroids for an `[N, dim]` matrix.
///
/// Fails fast when the matrix is empty rather than asking k-means for zero
/// clusters.
pub fn compute_centroids(
    embeddings: &ArrayView2<f32>,
    config: &ClusterConfig,
) -> Result<Array2<f32>> {
    let count = embeddings.nrows();
    let k = effective_k(config.clusters, count);

    if k == 0 {
        return Err(Error::Cluster(format!(
            "Cannot compute 0 centroids ({} embeddings, {} clusters requested)",
            count, config.clusters
        )));
    }
    if embeddings.ncols() == 0 {
        return Err(Error::Cluster("Embeddings have zero dimensions".into()));
    }

    let kmeans_config = KMeansConfig {
        k,
        max_iters: config.max_iters,
        tol: config.tol,
        seed: config.seed,
        max_points_per_centroid: None,
        chunk_size_data: 51_200,
        chunk_size_centroids: 10_240,
        verbose: false,
    };

    let mut kmeans = FastKMeans::with_config(kmeans_config);
    kmeans
        .train(embeddings)
        .map_err(|e| Error::Cluster(format!("K-means training failed: {}", e)))?;

    let centroids = kmeans
        .centroids()
        .ok_or_else(|| Error::Cluster("K-means did not produce centroids".into()))?
        .to_owned();

    if centroids.nrows() != k || centroids.ncols() != embeddings.ncols() {
        return Err(Error::Shape(format!(
            "K-means returned {}x{} centroids, expected {}x{}",
            centroids.nrows(),
            centroids.ncols(),
            k,
            embeddings.ncols()
        )));
    }

    Ok(centroids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    fn config(clusters: usize) -> ClusterConfig {
        ClusterConfig {
            clusters,
            ..Default::default()
        }
    }

    #[test]
    fn test_effective_k() {
        assert_eq!(effective_k(12, 60), 12);
        assert_eq!(effective_k(12, 5), 5);
        assert_eq!(effective_k(4, 120), 4);
        assert_eq!(effective_k(4, 0), 0);
    }

    #[test]
    fn test_compute_centroids_shape() {
        let data: Array2<f32> = Array2::random((120, 32), Uniform::new(-1.0f32, 1.0));
        let centroids = compute_centroids(&data.view(), &config(12)).unwrap();

        assert_eq!(centroids.nrows(), 12);
        assert_eq!(centroids.ncols(), 32);
    }

    #[test]
    fn test_k_shrinks_to_sample_count() {
        let data: Array2<f32> = Array2::random((5, 16), Uniform::new(-1.0f32, 1.0));
        let centroids = compute_centroids(&data.view(), &config(12)).unwrap();

        assert_eq!(centroids.nrows(), 5);
        assert_eq!(centroids.ncols(), 16);
    }

    #[test]
    fn test_zero_embeddings_is_an_error() {
        let data = Array2::<f32>::zeros((0, 16));
        let result = compute_centroids(&data.view(), &config(12));
        assert!(matches!(result, Err(Error::Cluster(_))));
    }

    #[test]
    fn test_deterministic_with_seed() {
        let data: Array2<f32> = Array2::random((200, 24), Uniform::new(-1.0f32, 1.0));
        let a = compute_centroids(&data.view(), &config(6)).unwrap();
        let b = compute_centroids(&data.view(), &config(6)).unwrap();
        assert_eq!(a, b);
    }
}
