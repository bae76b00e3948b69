//! Sharded IVF index with atomic generation swaps.

use fnv::FnvHashMap;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::f32::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info};

use super::filter::SearchFilter;
use super::kmeans::{self, KMeansParams};
use super::{angle, dot, normalized};
use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::record::{Payload, shard_for};
use crate::storage::StoredEmbedding;
use dandi_search_embed::ModelDescriptor;

/// Slack added to list bounds to absorb floating point error in `acos`.
const BOUND_EPSILON: f32 = 1e-4;

/// A unit-length vector and the payload it is filtered on.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Arc<Payload>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    Upsert {
        id: String,
        vector: Vec<f32>,
        payload: Payload,
    },
    Delete {
        id: String,
    },
}

impl IndexOp {
    pub fn id(&self) -> &str {
        match self {
            Self::Upsert { id, .. } | Self::Delete { id } => id,
        }
    }
}

impl From<StoredEmbedding> for IndexOp {
    fn from(embedding: StoredEmbedding) -> Self {
        Self::Upsert {
            id: embedding.record_id,
            vector: embedding.vector,
            payload: embedding.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    #[serde(skip)]
    pub payload: Arc<Payload>,
}

#[derive(Debug, Clone, Default)]
struct Shard {
    /// One inverted list per centroid, or a single list without centroids.
    lists: Vec<FnvHashMap<String, Arc<IndexEntry>>>,
    assignment: FnvHashMap<String, usize>,
    /// Largest angle between a list's centroid and any entry it ever held.
    radii: Vec<f32>,
}

impl Shard {
    fn empty(list_count: usize) -> Self {
        let list_count = list_count.max(1);
        Self {
            lists: vec![FnvHashMap::default(); list_count],
            assignment: FnvHashMap::default(),
            radii: vec![0.0; list_count],
        }
    }

    fn len(&self) -> usize {
        self.assignment.len()
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.assignment.remove(id) {
            Some(list) => {
                self.lists[list].remove(id);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, centroids: &[Vec<f32>], entry: IndexEntry) {
        self.remove(&entry.id);
        let list = if centroids.is_empty() {
            self.radii[0] = PI;
            0
        } else {
            let (list, _) = kmeans::nearest(centroids, &entry.vector);
            let theta = angle(&centroids[list], &entry.vector);
            if theta > self.radii[list] {
                self.radii[list] = theta;
            }
            list
        };
        self.assignment.insert(entry.id.clone(), list);
        self.lists[list].insert(entry.id.clone(), Arc::new(entry));
    }
}

/// An immutable, searchable snapshot of the index.
#[derive(Debug)]
pub struct Generation {
    number: u64,
    model_id: String,
    dimension: usize,
    centroids: Arc<Vec<Vec<f32>>>,
    shards: Vec<Arc<Shard>>,
    len: usize,
    /// Entry count when the centroids were trained, 0 if untrained
    trained_count: usize,
    exact_search_threshold: usize,
}

impl Generation {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn centroid_count(&self) -> usize {
        self.centroids.len()
    }

    pub fn trained_count(&self) -> usize {
        self.trained_count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<IndexEntry>> {
        let shard = &self.shards[shard_for(id, self.shards.len())];
        let list = *shard.assignment.get(id)?;
        shard.lists[list].get(id).cloned()
    }

    /// All entry ids in ascending order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shards
            .iter()
            .flat_map(|s| s.assignment.keys().cloned())
            .collect();
        ids.sort();
        ids
    }

    /// Top `k` entries by cosine similarity to `query`, best first. Equal
    /// scores are ordered by ascending id. `max_probe` caps how many inverted
    /// lists are scanned; without it the result is exact.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
        max_probe: Option<usize>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let Some(query) = normalized(query) else {
            return Ok(Vec::new());
        };
        let filter = filter.filter(|f| !f.is_empty());
        let mut top = TopK::new(k);

        if self.centroids.is_empty() || self.len < self.exact_search_threshold {
            for shard in &self.shards {
                for list in &shard.lists {
                    top.scan(list, &query, filter);
                }
            }
            return Ok(top.into_hits());
        }

        let centroid_angles: Vec<f32> = self.centroids.iter().map(|c| angle(c, &query)).collect();
        let mut probes: Vec<(f32, usize, usize)> = Vec::new();
        for (s, shard) in self.shards.iter().enumerate() {
            for (l, list) in shard.lists.iter().enumerate() {
                if list.is_empty() {
                    continue;
                }
                let gap = (centroid_angles[l] - shard.radii[l]).max(0.0);
                probes.push((gap.cos(), s, l));
            }
        }
        probes.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut scanned = 0;
        for (bound, s, l) in probes {
            if top.is_full() && top.worst_score() > bound + BOUND_EPSILON {
                break;
            }
            if max_probe.is_some_and(|max| scanned >= max) {
                break;
            }
            top.scan(&self.shards[s].lists[l], &query, filter);
            scanned += 1;
        }
        debug!("Scanned {} inverted lists", scanned);
        Ok(top.into_hits())
    }

    /// Check the structural invariants of every shard.
    pub fn validate(&self) -> Result<(), IndexError> {
        for (index, shard) in self.shards.iter().enumerate() {
            check_shard(shard, index, self.shards.len(), self.dimension, &self.centroids)?;
        }
        let len: usize = self.shards.iter().map(|s| s.len()).sum();
        if len != self.len {
            return Err(IndexError::Corruption(format!(
                "generation reports {} entries but holds {len}",
                self.len
            )));
        }
        Ok(())
    }
}

fn check_shard(
    shard: &Shard,
    index: usize,
    shard_count: usize,
    dimension: usize,
    centroids: &[Vec<f32>],
) -> Result<(), IndexError> {
    let expected_lists = centroids.len().max(1);
    if shard.lists.len() != expected_lists || shard.radii.len() != expected_lists {
        return Err(IndexError::Corruption(format!(
            "shard {index} has {} lists, expected {expected_lists}",
            shard.lists.len()
        )));
    }
    let listed: usize = shard.lists.iter().map(|l| l.len()).sum();
    if listed != shard.assignment.len() {
        return Err(IndexError::Corruption(format!(
            "shard {index} lists {listed} entries but assigns {}",
            shard.assignment.len()
        )));
    }
    for (list_index, list) in shard.lists.iter().enumerate() {
        for (id, entry) in list {
            if shard.assignment.get(id) != Some(&list_index) || entry.id != *id {
                return Err(IndexError::Corruption(format!(
                    "entry {id} is not assigned to list {list_index} of shard {index}"
                )));
            }
            if shard_for(id, shard_count) != index {
                return Err(IndexError::Corruption(format!(
                    "entry {id} is stored in shard {index}"
                )));
            }
            if entry.vector.len() != dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: dimension,
                    actual: entry.vector.len(),
                });
            }
            if entry.vector.iter().any(|x| !x.is_finite()) {
                return Err(IndexError::Corruption(format!(
                    "entry {id} has a non-finite component"
                )));
            }
        }
    }
    Ok(())
}

struct Candidate {
    score: f32,
    entry: Arc<IndexEntry>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    /// Worse candidates compare greater, so the heap top is the one to evict.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.entry.id.cmp(&other.entry.id))
    }
}

struct TopK {
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    fn worst_score(&self) -> f32 {
        self.heap.peek().map_or(f32::NEG_INFINITY, |c| c.score)
    }

    fn offer(&mut self, candidate: Candidate) {
        if !self.is_full() {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|worst| candidate < *worst) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    fn scan(
        &mut self,
        list: &FnvHashMap<String, Arc<IndexEntry>>,
        query: &[f32],
        filter: Option<&SearchFilter>,
    ) {
        for entry in list.values() {
            if filter.is_some_and(|f| !f.matches(&entry.payload)) {
                continue;
            }
            self.offer(Candidate {
                score: dot(&entry.vector, query),
                entry: Arc::clone(entry),
            });
        }
    }

    fn into_hits(self) -> Vec<SearchHit> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| SearchHit {
                id: c.entry.id.clone(),
                score: c.score,
                payload: Arc::clone(&c.entry.payload),
            })
            .collect()
    }
}

/// Concurrent handle to the current generation.
///
/// Writers lock the shards they touch, in ascending order, so updates to
/// disjoint shards proceed in parallel while readers keep searching the
/// generation they started with.
#[derive(Debug)]
pub struct VectorIndex {
    config: IndexConfig,
    current: RwLock<Arc<Generation>>,
    shard_locks: Vec<Mutex<()>>,
}

impl VectorIndex {
    pub fn new(config: IndexConfig, model_id: impl Into<String>, dimension: usize) -> Self {
        let shard_count = config.shards.max(1);
        let generation = Generation {
            number: 0,
            model_id: model_id.into(),
            dimension,
            centroids: Arc::new(Vec::new()),
            shards: (0..shard_count).map(|_| Arc::new(Shard::empty(1))).collect(),
            len: 0,
            trained_count: 0,
            exact_search_threshold: config.exact_search_threshold,
        };
        Self {
            shard_locks: (0..shard_count).map(|_| Mutex::new(())).collect(),
            current: RwLock::new(Arc::new(generation)),
            config,
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shard_locks.len()
    }

    /// The generation readers currently see.
    pub fn snapshot(&self) -> Arc<Generation> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn model_id(&self) -> String {
        self.snapshot().model_id.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Search the current generation.
    pub fn query(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        self.snapshot()
            .search(query, k, filter, self.config.max_probe)
    }

    pub fn upsert(
        &self,
        id: impl Into<String>,
        vector: Vec<f32>,
        payload: Payload,
    ) -> Result<u64, IndexError> {
        self.apply(vec![IndexOp::Upsert {
            id: id.into(),
            vector,
            payload,
        }])
    }

    pub fn delete(&self, id: impl Into<String>) -> Result<u64, IndexError> {
        self.apply(vec![IndexOp::Delete { id: id.into() }])
    }

    /// Apply upserts and deletes in order and publish them as one new
    /// generation. On error nothing is published.
    pub fn apply(&self, ops: Vec<IndexOp>) -> Result<u64, IndexError> {
        let shard_count = self.shard_count();
        let mut by_shard: BTreeMap<usize, Vec<IndexOp>> = BTreeMap::new();
        for op in ops {
            by_shard
                .entry(shard_for(op.id(), shard_count))
                .or_default()
                .push(op);
        }

        let _guards: Vec<MutexGuard<'_, ()>> = by_shard
            .keys()
            .map(|&s| self.shard_locks[s].lock().unwrap_or_else(PoisonError::into_inner))
            .collect();

        let base = self.snapshot();
        let mut staged = Vec::with_capacity(by_shard.len());
        for (index, ops) in by_shard {
            let mut shard = (*base.shards[index]).clone();
            for op in ops {
                match op {
                    IndexOp::Upsert { id, vector, payload } => {
                        let entry = prepare_entry(id, &vector, payload, base.dimension)?;
                        shard.insert(&base.centroids, entry);
                    }
                    IndexOp::Delete { id } => {
                        shard.remove(&id);
                    }
                }
            }
            check_shard(&shard, index, shard_count, base.dimension, &base.centroids)?;
            staged.push((index, Arc::new(shard)));
        }

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut shards = current.shards.clone();
        for (index, shard) in staged {
            shards[index] = shard;
        }
        let generation = Generation {
            number: current.number + 1,
            model_id: current.model_id.clone(),
            dimension: current.dimension,
            centroids: Arc::clone(&current.centroids),
            len: shards.iter().map(|s| s.len()).sum(),
            shards,
            trained_count: current.trained_count,
            exact_search_threshold: current.exact_search_threshold,
        };
        let number = generation.number;
        *current = Arc::new(generation);
        debug!("Published index generation {}", number);
        Ok(number)
    }

    /// Build a generation from scratch, retraining centroids, and publish it.
    /// Used for full rebuilds and model migration.
    pub fn rebuild(
        &self,
        entries: Vec<StoredEmbedding>,
        descriptor: &ModelDescriptor,
    ) -> Result<u64, IndexError> {
        let _guards: Vec<MutexGuard<'_, ()>> = self
            .shard_locks
            .iter()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
            .collect();

        let dimension = descriptor.dimension;
        let mut prepared = Vec::with_capacity(entries.len());
        for embedding in entries {
            prepared.push(prepare_entry(
                embedding.record_id,
                &embedding.vector,
                embedding.payload,
                dimension,
            )?);
        }
        prepared.sort_by(|a, b| a.id.cmp(&b.id));
        prepared.dedup_by(|later, earlier| later.id == earlier.id);

        let centroids = self.train(&prepared);
        let shard_count = self.shard_count();
        let mut shards: Vec<Shard> = (0..shard_count)
            .map(|_| Shard::empty(centroids.len()))
            .collect();
        let len = prepared.len();
        for entry in prepared {
            shards[shard_for(&entry.id, shard_count)].insert(&centroids, entry);
        }
        for (index, shard) in shards.iter().enumerate() {
            check_shard(shard, index, shard_count, dimension, &centroids)?;
        }

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = Generation {
            number: current.number + 1,
            model_id: descriptor.model_id(),
            dimension,
            trained_count: if centroids.is_empty() { 0 } else { len },
            centroids: Arc::new(centroids),
            shards: shards.into_iter().map(Arc::new).collect(),
            len,
            exact_search_threshold: self.config.exact_search_threshold,
        };
        info!(
            "Rebuilt index generation {} for {}: {} entries, {} centroids",
            generation.number,
            generation.model_id,
            generation.len,
            generation.centroids.len()
        );
        let number = generation.number;
        *current = Arc::new(generation);
        Ok(number)
    }

    fn train(&self, entries: &[IndexEntry]) -> Vec<Vec<f32>> {
        if entries.len() < 2 || entries.len() < self.config.exact_search_threshold {
            return Vec::new();
        }
        let k = self
            .config
            .nlist
            .unwrap_or_else(|| (entries.len() as f64).sqrt().ceil() as usize)
            .clamp(1, entries.len());
        let points: Vec<&[f32]> = entries.iter().map(|e| e.vector.as_slice()).collect();
        kmeans::train(
            &points,
            KMeansParams {
                k,
                iterations: self.config.kmeans_iterations,
                seed: self.config.seed,
                training_sample: self.config.training_sample,
            },
        )
    }

    /// Whether the centroids no longer fit the data: the index grew past the
    /// exact-search threshold untrained, or past the growth factor since the
    /// last training.
    pub fn needs_retrain(&self) -> bool {
        let generation = self.snapshot();
        if generation.centroids.is_empty() {
            generation.len >= 2 && generation.len >= self.config.exact_search_threshold
        } else {
            generation.len as f64
                > generation.trained_count as f64 * self.config.retrain_growth_factor
        }
    }

    /// Validate the current generation.
    pub fn validate(&self) -> Result<(), IndexError> {
        self.snapshot().validate()
    }
}

fn prepare_entry(
    id: String,
    vector: &[f32],
    payload: Payload,
    dimension: usize,
) -> Result<IndexEntry, IndexError> {
    if vector.len() != dimension {
        return Err(IndexError::DimensionMismatch {
            expected: dimension,
            actual: vector.len(),
        });
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(IndexError::Corruption(format!(
            "vector for {id} has a non-finite component"
        )));
    }
    let vector = normalized(vector)
        .ok_or_else(|| IndexError::Corruption(format!("vector for {id} has zero norm")))?;
    Ok(IndexEntry {
        id,
        vector,
        payload: Arc::new(payload),
    })
}
