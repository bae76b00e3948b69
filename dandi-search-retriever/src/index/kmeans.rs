//! Seeded spherical k-means used to train inverted-list centroids.
//!
//! Training is deterministic: the same vectors in the same order with the
//! same seed always produce the same centroids.

use rand::SeedableRng;
use rand::rngs::StdRng;

use super::{dot, normalized};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansParams {
    pub k: usize,
    pub iterations: usize,
    pub seed: u64,
    /// Upper bound on the number of vectors used for training
    pub training_sample: usize,
}

/// Index of the most similar centroid and its cosine similarity.
pub fn nearest(centroids: &[Vec<f32>], vector: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, centroid) in centroids.iter().enumerate() {
        let score = dot(centroid, vector);
        if score > best.1 {
            best = (i, score);
        }
    }
    best
}

/// Train `params.k` unit-length centroids on unit-length `points`.
pub fn train(points: &[&[f32]], params: KMeansParams) -> Vec<Vec<f32>> {
    if points.is_empty() || params.k == 0 {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(params.seed);

    let sample: Vec<&[f32]> = if points.len() > params.training_sample.max(1) {
        let mut picked =
            rand::seq::index::sample(&mut rng, points.len(), params.training_sample.max(1))
                .into_vec();
        picked.sort_unstable();
        picked.into_iter().map(|i| points[i]).collect()
    } else {
        points.to_vec()
    };

    let k = params.k.min(sample.len());
    let mut seeds = rand::seq::index::sample(&mut rng, sample.len(), k).into_vec();
    seeds.sort_unstable();
    let mut centroids: Vec<Vec<f32>> = seeds.into_iter().map(|i| sample[i].to_vec()).collect();

    let dim = sample[0].len();
    let mut assignment = vec![usize::MAX; sample.len()];
    for iteration in 0..params.iterations.max(1) {
        let mut changed = 0usize;
        let mut similarity = vec![0.0f32; sample.len()];
        for (i, point) in sample.iter().enumerate() {
            let (cluster, score) = nearest(&centroids, point);
            similarity[i] = score;
            if assignment[i] != cluster {
                assignment[i] = cluster;
                changed += 1;
            }
        }
        if changed == 0 && iteration > 0 {
            break;
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (point, &cluster) in sample.iter().zip(&assignment) {
            counts[cluster] += 1;
            for (s, x) in sums[cluster].iter_mut().zip(point.iter()) {
                *s += x;
            }
        }

        // Empty clusters are reseeded with the worst-served points.
        let mut worst: Vec<usize> = (0..sample.len()).collect();
        worst.sort_by(|&a, &b| similarity[a].total_cmp(&similarity[b]).then(a.cmp(&b)));
        let mut worst = worst.into_iter();

        for cluster in 0..k {
            let updated = if counts[cluster] == 0 {
                worst.next().map(|i| sample[i].to_vec())
            } else {
                normalized(&sums[cluster])
            };
            if let Some(centroid) = updated {
                centroids[cluster] = centroid;
            }
        }
    }
    centroids
}
