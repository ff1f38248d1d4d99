//! Hierarchical Navigable Small World index for approximate k-NN.
//!
//! Multi-layer proximity graph (Malkov & Yashunin, 2016). Layer 0 holds every
//! live node; each higher layer is a strict subset. Deletion tombstones the
//! node and preserves its links so graph connectivity survives until
//! [`HnswIndex::rebuild`] reclaims the space.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::Rng;

use crate::error::RagError;
use crate::util;

/// Distance function installed at construction. Must stay consistent across
/// the index lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// 1 − dot product. Assumes unit-length vectors.
    Cosine,
    /// Negated dot product, so smaller is closer.
    Dot,
    Euclidean,
}

impl DistanceMetric {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => 1.0 - util::dot(a, b),
            Self::Dot => -util::dot(a, b),
            Self::Euclidean => util::euclidean_distance(a, b),
        }
    }

    /// Map a distance back to a relevance score. Cosine and euclidean land in
    /// [0, 1]; dot product is unbounded and left as the negated distance.
    pub fn score(&self, distance: f32) -> f32 {
        match self {
            Self::Cosine => (1.0 - distance).clamp(0.0, 1.0),
            Self::Dot => -distance,
            Self::Euclidean => 1.0 / (1.0 + distance),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HnswParams {
    /// Neighbors kept per node per layer (2M at layer 0).
    pub m: usize,
    /// Beam width during insertion.
    pub ef_construction: usize,
    /// Default beam width during search.
    pub ef_search: usize,
    pub metric: DistanceMetric,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            metric: DistanceMetric::Cosine,
        }
    }
}

#[derive(Debug)]
struct Node {
    id: String,
    vector: Vec<f32>,
    /// Highest layer this node appears in.
    layer: usize,
    /// Neighbor slots per layer, index 0 = base layer.
    neighbors: Vec<Vec<u32>>,
    deleted: bool,
}

/// Search candidate ordered by distance. Max-heap by natural order; wrap in
/// [`std::cmp::Reverse`] for the min-heap side of the beam.
#[derive(Clone, Copy, PartialEq)]
struct Candidate {
    slot: u32,
    dist: f32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.partial_cmp(&other.dist).unwrap_or(Ordering::Equal)
    }
}

#[derive(Debug)]
pub struct HnswIndex {
    dimension: usize,
    params: HnswParams,
    nodes: Vec<Node>,
    slots: HashMap<String, u32>,
    entry_point: Option<u32>,
    max_layer: usize,
    live_count: usize,
    /// Precomputed 1/ln(M) for the layer draw.
    level_norm: f64,
}

impl HnswIndex {
    pub fn new(dimension: usize, params: HnswParams) -> Result<Self, RagError> {
        if dimension == 0 {
            return Err(RagError::ConfigError("hnsw dimension must be > 0".into()));
        }
        if params.m == 0 {
            return Err(RagError::ConfigError("hnsw m must be > 0".into()));
        }
        let level_norm = 1.0 / (params.m as f64).ln();
        Ok(Self {
            dimension,
            params,
            nodes: Vec::new(),
            slots: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            live_count: 0,
            level_norm,
        })
    }

    pub fn with_dimension(dimension: usize) -> Result<Self, RagError> {
        Self::new(dimension, HnswParams::default())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.params.metric
    }

    /// Number of live (non-tombstoned) nodes.
    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.nodes.len() - self.live_count
    }

    pub fn has(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .map(|&slot| !self.nodes[slot as usize].deleted)
            .unwrap_or(false)
    }

    pub fn set_ef_search(&mut self, ef_search: usize) {
        self.params.ef_search = ef_search.max(1);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.slots.clear();
        self.entry_point = None;
        self.max_layer = 0;
        self.live_count = 0;
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), RagError> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Draw the layer for a new node: floor(−ln(U) · 1/ln(M)), U in (0, 1].
    fn random_layer(&self) -> usize {
        let mut rng = rand::thread_rng();
        // gen() yields [0, 1); flip to (0, 1] so ln never sees zero.
        let u: f64 = 1.0 - rng.gen::<f64>();
        (-u.ln() * self.level_norm).floor() as usize
    }

    fn distance(&self, query: &[f32], slot: u32) -> f32 {
        self.params
            .metric
            .distance(query, &self.nodes[slot as usize].vector)
    }

    /// Insert a vector. An existing id is logically deleted and re-inserted,
    /// which makes insert double as update.
    pub fn insert(&mut self, id: impl Into<String>, vector: Vec<f32>) -> Result<(), RagError> {
        let id = id.into();
        self.check_dimension(&vector)?;

        if let Some(&old_slot) = self.slots.get(&id) {
            if !self.nodes[old_slot as usize].deleted {
                self.nodes[old_slot as usize].deleted = true;
                self.live_count -= 1;
            }
        }

        let layer = self.random_layer();
        let slot = self.nodes.len() as u32;
        self.nodes.push(Node {
            id: id.clone(),
            vector,
            layer,
            neighbors: vec![Vec::new(); layer + 1],
            deleted: false,
        });
        self.slots.insert(id, slot);
        self.live_count += 1;

        let Some(mut current) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_layer = layer;
            return Ok(());
        };

        let query = self.nodes[slot as usize].vector.clone();

        // Greedy descent through layers above the new node's layer.
        let mut current_dist = self.distance(&query, current);
        for l in ((layer + 1)..=self.max_layer).rev() {
            loop {
                let mut improved = false;
                let neighbors = self.layer_neighbors(current, l).to_vec();
                for n in neighbors {
                    let d = self.distance(&query, n);
                    if d < current_dist {
                        current = n;
                        current_dist = d;
                        improved = true;
                    }
                }
                if !improved {
                    break;
                }
            }
        }

        // Beam search and link at layers min(layer, max_layer)..0.
        let mut entry = vec![Candidate {
            slot: current,
            dist: current_dist,
        }];
        for l in (0..=layer.min(self.max_layer)).rev() {
            let found = self.search_layer(&query, &entry, self.params.ef_construction, l);
            let cap = self.layer_cap(l);
            let selected: Vec<u32> = found.iter().take(cap).map(|c| c.slot).collect();

            for &neighbor in &selected {
                self.nodes[slot as usize].neighbors[l].push(neighbor);
                // Symmetric back-link with distance-ordered pruning.
                let needs_prune = {
                    let list = &mut self.nodes[neighbor as usize].neighbors;
                    if l < list.len() && !list[l].contains(&slot) {
                        list[l].push(slot);
                        list[l].len() > cap
                    } else {
                        false
                    }
                };
                if needs_prune {
                    self.prune_neighbors(neighbor, l, cap);
                }
            }

            entry = found;
        }

        if layer > self.max_layer {
            self.max_layer = layer;
            self.entry_point = Some(slot);
        }

        Ok(())
    }

    fn layer_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn layer_neighbors(&self, slot: u32, layer: usize) -> &[u32] {
        let node = &self.nodes[slot as usize];
        node.neighbors.get(layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Trim a node's neighbor list to `cap` entries closest to the node.
    fn prune_neighbors(&mut self, slot: u32, layer: usize, cap: usize) {
        let base = self.nodes[slot as usize].vector.clone();
        let mut scored: Vec<Candidate> = self.nodes[slot as usize].neighbors[layer]
            .iter()
            .map(|&n| Candidate {
                slot: n,
                dist: self.params.metric.distance(&base, &self.nodes[n as usize].vector),
            })
            .collect();
        scored.sort();
        scored.truncate(cap);
        self.nodes[slot as usize].neighbors[layer] = scored.into_iter().map(|c| c.slot).collect();
    }

    /// Beam search within one layer. Returns up to `ef` candidates sorted by
    /// ascending distance. Traverses tombstoned nodes (their links keep the
    /// graph connected) — callers filter them from final results.
    fn search_layer(&self, query: &[f32], entry: &[Candidate], ef: usize, layer: usize) -> Vec<Candidate> {
        let mut visited: HashSet<u32> = HashSet::with_capacity(ef * 2);
        let mut frontier: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::with_capacity(ef);
        let mut best: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef + 1);

        for &c in entry {
            if visited.insert(c.slot) {
                frontier.push(std::cmp::Reverse(c));
                best.push(c);
                if best.len() > ef {
                    best.pop();
                }
            }
        }

        while let Some(std::cmp::Reverse(current)) = frontier.pop() {
            if let Some(worst) = best.peek() {
                if best.len() >= ef && current.dist > worst.dist {
                    break;
                }
            }

            for &n in self.layer_neighbors(current.slot, layer) {
                if !visited.insert(n) {
                    continue;
                }
                let d = self.distance(query, n);
                let candidate = Candidate { slot: n, dist: d };
                let admit = best.len() < ef || best.peek().map(|w| d < w.dist).unwrap_or(true);
                if admit {
                    frontier.push(std::cmp::Reverse(candidate));
                    best.push(candidate);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut out = best.into_vec();
        out.sort();
        out
    }

    /// Approximate k-nearest-neighbor search. Returns up to k live node ids
    /// with their distances, ascending. An empty index yields an empty result.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>, RagError> {
        self.check_dimension(query)?;
        if k == 0 || self.live_count == 0 {
            return Ok(Vec::new());
        }
        let Some(entry_slot) = self.entry_point else {
            return Ok(Vec::new());
        };

        // Greedy descent from the top layer down to layer 1.
        let mut current = entry_slot;
        let mut current_dist = self.distance(query, current);
        for l in (1..=self.max_layer).rev() {
            loop {
                let mut improved = false;
                for &n in self.layer_neighbors(current, l) {
                    let d = self.distance(query, n);
                    if d < current_dist {
                        current = n;
                        current_dist = d;
                        improved = true;
                    }
                }
                if !improved {
                    break;
                }
            }
        }

        // Wide beam at the base layer.
        let ef = self.params.ef_search.max(k);
        let found = self.search_layer(
            query,
            &[Candidate {
                slot: current,
                dist: current_dist,
            }],
            ef,
            0,
        );

        Ok(found
            .into_iter()
            .filter(|c| !self.nodes[c.slot as usize].deleted)
            .take(k)
            .map(|c| (self.nodes[c.slot as usize].id.clone(), c.dist))
            .collect())
    }

    /// Tombstone a node. Links remain so the graph stays navigable; space is
    /// reclaimed by [`rebuild`](Self::rebuild). Returns whether the id was live.
    pub fn delete(&mut self, id: &str) -> bool {
        match self.slots.get(id) {
            Some(&slot) if !self.nodes[slot as usize].deleted => {
                self.nodes[slot as usize].deleted = true;
                self.live_count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Rebuild the graph from live nodes only, dropping tombstones.
    pub fn rebuild(&mut self) -> Result<(), RagError> {
        let live: Vec<(String, Vec<f32>)> = self
            .nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.id.clone(), n.vector.clone()))
            .collect();

        let mut fresh = Self::new(self.dimension, self.params.clone())?;
        for (id, vector) in live {
            fresh.insert(id, vector)?;
        }
        *self = fresh;
        Ok(())
    }

    /// Iterate live (id, vector) pairs, in insertion order.
    pub fn iter_live(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.id.as_str(), n.vector.as_slice()))
    }

    pub fn get_vector(&self, id: &str) -> Option<&[f32]> {
        self.slots.get(id).and_then(|&slot| {
            let node = &self.nodes[slot as usize];
            if node.deleted {
                None
            } else {
                Some(node.vector.as_slice())
            }
        })
    }
}
