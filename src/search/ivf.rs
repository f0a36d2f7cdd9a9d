//! Inverted-file index: spherical k-means clustering over sparse vectors with
//! probe-count tuning against a sampled brute-force ground truth.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};

use super::{DictionaryVector, VectorIndex};
use crate::heap::TopKFilter;

#[derive(Debug, Clone, Default)]
struct Centroid {
    weights: HashMap<i32, f32>,
    norm: f32,
}

impl Centroid {
    fn from_weights(weights: HashMap<i32, f32>) -> Self {
        let norm = weights.values().map(|w| w * w).sum::<f32>().sqrt();
        Self { weights, norm }
    }

    /// Negated normalized dot product against a sparse vector.
    fn distance(&self, vector: &DictionaryVector) -> f32 {
        if self.norm == 0.0 || vector.norm() == 0.0 {
            return 0.0;
        }
        let mut dot = 0.0;
        for &index in &vector.indices {
            if let Some(&weight) = self.weights.get(&index) {
                dot += vector.weight(index) * weight;
            }
        }
        if dot > 0.0 {
            -dot / self.norm / vector.norm()
        } else {
            0.0
        }
    }
}

pub struct IvfBuilder {
    vectors: Vec<DictionaryVector>,
    k: usize,
    test_size: usize,
    num_jobs: usize,
}

impl IvfBuilder {
    pub fn new(vectors: Vec<DictionaryVector>, k: usize, test_size: usize) -> Self {
        Self {
            vectors,
            k,
            test_size,
            num_jobs: 1,
        }
    }

    pub fn with_jobs(mut self, num_jobs: usize) -> Self {
        self.num_jobs = num_jobs.max(1);
        self
    }

    /// Cluster the vectors and raise the probe count until the sampled recall
    /// reaches `recall_target` or every cluster is probed. Returns the index
    /// and the observed recall.
    pub fn build(self, recall_target: f32, fit_epochs: usize) -> (IvfIndex, f32) {
        let n = self.vectors.len();
        if n == 0 {
            return (
                IvfIndex {
                    vectors: self.vectors,
                    centroids: Vec::new(),
                    clusters: Vec::new(),
                    num_probe: 0,
                },
                1.0,
            );
        }

        let num_clusters = ((n as f64).sqrt() as usize).max(1);
        let mut rng = StdRng::seed_from_u64(0);

        // Seed centroids from distinct vectors.
        let mut centroids: Vec<Centroid> = sample(&mut rng, n, num_clusters.min(n))
            .into_iter()
            .map(|i| {
                let vector = &self.vectors[i];
                let weights = vector
                    .indices
                    .iter()
                    .map(|&index| (index, vector.weight(index)))
                    .collect();
                Centroid::from_weights(weights)
            })
            .collect();

        let mut assignments = vec![0usize; n];
        for _ in 0..fit_epochs.max(1) {
            assignments = assign_clusters(&self.vectors, &centroids, self.num_jobs);
            // Recompute each centroid as the mean of its members; empty
            // clusters keep their previous position.
            let mut sums: Vec<HashMap<i32, f32>> = vec![HashMap::new(); centroids.len()];
            let mut counts = vec![0usize; centroids.len()];
            for (vector, &cluster) in self.vectors.iter().zip(&assignments) {
                counts[cluster] += 1;
                let sum = &mut sums[cluster];
                for &index in &vector.indices {
                    *sum.entry(index).or_insert(0.0) += vector.weight(index);
                }
            }
            for (cluster, sum) in sums.into_iter().enumerate() {
                if counts[cluster] > 0 {
                    let scale = 1.0 / counts[cluster] as f32;
                    let mean = sum.into_iter().map(|(i, w)| (i, w * scale)).collect();
                    centroids[cluster] = Centroid::from_weights(mean);
                }
            }
        }

        let mut clusters = vec![Vec::new(); centroids.len()];
        for (vector, &cluster) in assignments.iter().enumerate() {
            clusters[cluster].push(vector as i32);
        }

        let mut index = IvfIndex {
            vectors: self.vectors,
            centroids,
            clusters,
            num_probe: 1,
        };

        // Sampled ground truth from an exhaustive scan.
        let test_size = self.test_size.min(n);
        let queries: Vec<usize> = sample(&mut rng, n, test_size).into_iter().collect();
        let truth: Vec<HashSet<i32>> = queries
            .iter()
            .map(|&query| index.exhaustive(query, self.k).into_iter().collect())
            .collect();

        let mut recall = index.evaluate(&queries, &truth, self.k);
        while recall < recall_target && index.num_probe < index.centroids.len() {
            index.num_probe = (index.num_probe * 2).min(index.centroids.len());
            recall = index.evaluate(&queries, &truth, self.k);
        }
        (index, recall)
    }
}

fn assign_clusters(
    vectors: &[DictionaryVector],
    centroids: &[Centroid],
    num_jobs: usize,
) -> Vec<usize> {
    let nearest = |vector: &DictionaryVector| -> usize {
        let mut best = 0;
        let mut best_distance = f32::INFINITY;
        for (cluster, centroid) in centroids.iter().enumerate() {
            let distance = centroid.distance(vector);
            if distance < best_distance {
                best_distance = distance;
                best = cluster;
            }
        }
        best
    };

    if num_jobs <= 1 || vectors.len() < num_jobs * 2 {
        return vectors.iter().map(nearest).collect();
    }

    let mut assignments = vec![0usize; vectors.len()];
    let chunk_size = vectors.len().div_ceil(num_jobs);
    std::thread::scope(|scope| {
        for (chunk, out) in vectors
            .chunks(chunk_size)
            .zip(assignments.chunks_mut(chunk_size))
        {
            scope.spawn(move || {
                for (vector, slot) in chunk.iter().zip(out.iter_mut()) {
                    *slot = nearest(vector);
                }
            });
        }
    });
    assignments
}

pub struct IvfIndex {
    vectors: Vec<DictionaryVector>,
    centroids: Vec<Centroid>,
    clusters: Vec<Vec<i32>>,
    num_probe: usize,
}

impl IvfIndex {
    pub fn num_probe(&self) -> usize {
        self.num_probe
    }

    fn probed_clusters(&self, query: &DictionaryVector) -> Vec<usize> {
        let mut order: Vec<(f32, usize)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(cluster, centroid)| (centroid.distance(query), cluster))
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0));
        order.into_iter().take(self.num_probe).map(|(_, c)| c).collect()
    }

    /// Exact top-k by exhaustive scan; shares the candidate filters with the
    /// probed search so sampled recall reflects served results.
    fn exhaustive(&self, query: usize, k: usize) -> Vec<i32> {
        let q = &self.vectors[query];
        let mut filter = TopKFilter::new(k);
        for (candidate, vector) in self.vectors.iter().enumerate() {
            if candidate == query || vector.hidden {
                continue;
            }
            let distance = q.distance(vector);
            if distance < 0.0 {
                filter.push(candidate as i32, -distance);
            }
        }
        filter.pop_all().0
    }

    fn evaluate(&self, queries: &[usize], truth: &[HashSet<i32>], k: usize) -> f32 {
        let mut hits = 0usize;
        let mut total = 0usize;
        for (&query, exact) in queries.iter().zip(truth) {
            if exact.is_empty() {
                continue;
            }
            let (found, _) = self.search(query, k, true);
            hits += found.iter().filter(|id| exact.contains(id)).count();
            total += exact.len();
        }
        if total == 0 {
            1.0
        } else {
            hits as f32 / total as f32
        }
    }
}

impl VectorIndex for IvfIndex {
    fn search(&self, query: usize, k: usize, prune_query: bool) -> (Vec<i32>, Vec<f32>) {
        let q = &self.vectors[query];
        let mut filter = TopKFilter::new(k);
        for cluster in self.probed_clusters(q) {
            for &candidate in &self.clusters[cluster] {
                if (prune_query && candidate as usize == query)
                    || self.vectors[candidate as usize].hidden
                {
                    continue;
                }
                let distance = q.distance(&self.vectors[candidate as usize]);
                if distance < 0.0 {
                    filter.push(candidate, -distance);
                }
            }
        }
        let (ids, scores) = filter.pop_all();
        let distances = scores.into_iter().map(|s| -s).collect();
        (ids, distances)
    }

    fn multi_search(
        &self,
        query: usize,
        categories: &[String],
        k: usize,
        prune_query: bool,
    ) -> (HashMap<String, Vec<i32>>, HashMap<String, Vec<f32>>) {
        let q = &self.vectors[query];
        let mut filters: HashMap<String, TopKFilter> = HashMap::new();
        filters.insert(String::new(), TopKFilter::new(k));
        for category in categories {
            filters.insert(category.clone(), TopKFilter::new(k));
        }
        for cluster in self.probed_clusters(q) {
            for &candidate in &self.clusters[cluster] {
                let vector = &self.vectors[candidate as usize];
                if (prune_query && candidate as usize == query) || vector.hidden {
                    continue;
                }
                let distance = q.distance(vector);
                if distance < 0.0 {
                    if let Some(filter) = filters.get_mut("") {
                        filter.push(candidate, -distance);
                    }
                    for category in &vector.categories {
                        if let Some(filter) = filters.get_mut(category.as_str()) {
                            filter.push(candidate, -distance);
                        }
                    }
                }
            }
        }
        let mut neighbors = HashMap::new();
        let mut distances = HashMap::new();
        for (category, filter) in filters {
            let (ids, scores) = filter.pop_all();
            neighbors.insert(category.clone(), ids);
            distances.insert(category, scores.into_iter().map(|s| -s).collect());
        }
        (neighbors, distances)
    }
}
