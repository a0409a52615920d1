//! HNSW (Hierarchical Navigable Small World) index for approximate nearest neighbor search.
//!
//! Graph-based ANN over record summary vectors with cosine distance. Search is
//! O(log n) with high recall; `m`, `ef_construction` and `ef_search` trade
//! recall against speed.
//!
//! # Example
//!
//! ```ignore
//! use framevault::index::hnsw::{HnswConfig, HnswIndex};
//!
//! let index = HnswIndex::new(HnswConfig::default());
//! index.add(1, vector1.into());
//! index.add(2, vector2.into());
//!
//! let results = index.search(&query, 10, 50);
//! ```

use crate::types::{FrameId, cosine};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pre-allocated graph depth; with m >= 2 levels beyond this are vanishingly rare.
const MAX_LAYERS: usize = 16;

/// Configuration for HNSW index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Maximum number of connections per node (default: 16)
    pub m: usize,
    /// Size of dynamic candidate list during construction (default: 200)
    pub ef_construction: usize,
    /// Size of dynamic candidate list during search (default: 50)
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

impl HnswConfig {
    /// Create a new config with custom M.
    pub fn with_m(m: usize) -> Self {
        Self {
            m,
            ..Default::default()
        }
    }

    /// Set ef_construction.
    pub fn ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    /// Set ef_search.
    pub fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    /// Layer assignment decay factor: 1 / ln(M).
    fn m_l(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }
}

/// A node in the HNSW graph.
#[derive(Debug, Clone)]
struct Node {
    vector: Arc<[f32]>,
    max_layer: usize,
}

/// Adjacency lists of one layer.
#[derive(Debug, Default)]
struct Layer {
    edges: HashMap<FrameId, Vec<FrameId>>,
}

impl Layer {
    fn add_edge(&mut self, from: FrameId, to: FrameId) {
        let neighbors = self.edges.entry(from).or_default();
        if !neighbors.contains(&to) {
            neighbors.push(to);
        }
    }

    fn neighbors(&self, node: FrameId) -> &[FrameId] {
        self.edges.get(&node).map_or(&[], |v| v.as_slice())
    }
}

/// One hit from [`HnswIndex::search`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: FrameId,
    /// Cosine similarity to the query
    pub similarity: f32,
}

/// Search candidate for priority queue.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    distance: f32,
    id: FrameId,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .distance
            .partial_cmp(&self.distance) // Reverse for min-heap
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// HNSW index keyed by record id.
///
/// Inserts and removals for a partition arrive under that partition's write
/// section; searches run concurrently and only take short layer read guards.
pub struct HnswIndex {
    config: HnswConfig,
    nodes: DashMap<FrameId, Node>,
    layers: Vec<RwLock<Layer>>,
    entry_point: RwLock<Option<FrameId>>,
    max_layer: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("config", &self.config)
            .field("num_nodes", &self.nodes.len())
            .field("max_layer", &self.max_layer.load(Ordering::Relaxed))
            .field("entry_point", &*self.entry_point.read())
            .finish()
    }
}

impl HnswIndex {
    /// Create a new HNSW index with the given configuration.
    pub fn new(config: HnswConfig) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
            layers: (0..MAX_LAYERS).map(|_| RwLock::new(Layer::default())).collect(),
            entry_point: RwLock::new(None),
            max_layer: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(42)),
        }
    }

    /// Get the number of vectors in the index.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `id` is indexed.
    pub fn contains(&self, id: FrameId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Stored vector for `id`.
    pub fn vector(&self, id: FrameId) -> Option<Arc<[f32]>> {
        self.nodes.get(&id).map(|n| Arc::clone(&n.vector))
    }

    fn random_layer(&self) -> usize {
        let mut rng = self.rng.lock();
        let uniform = Uniform::from(0.0..1.0);
        let m_l = self.config.m_l();
        let mut level = 0;
        while level + 1 < MAX_LAYERS {
            let r: f64 = uniform.sample(&mut *rng);
            if r < (-((level + 1) as f64) / m_l).exp() {
                level += 1;
            } else {
                break;
            }
        }
        level
    }

    /// Add a vector, replacing any previous vector for `id`.
    pub fn add(&self, id: FrameId, vector: Arc<[f32]>) {
        if self.nodes.contains_key(&id) {
            self.remove(id);
        }

        let layer = self.random_layer();
        self.nodes.insert(
            id,
            Node {
                vector: Arc::clone(&vector),
                max_layer: layer,
            },
        );

        let entry_point = *self.entry_point.read();
        let Some(mut curr_ep) = entry_point else {
            *self.entry_point.write() = Some(id);
            self.max_layer.store(layer, Ordering::Relaxed);
            return;
        };

        let curr_max_layer = self.max_layer.load(Ordering::Relaxed);
        let mut curr_dist = self.distance_to(curr_ep, &vector);

        // Greedy descent through the layers above the new node's top layer
        for lc in ((layer + 1)..=curr_max_layer).rev() {
            let (next, dist) = self.greedy_closest(curr_ep, &vector, lc);
            if dist < curr_dist {
                curr_ep = next;
                curr_dist = dist;
            }
        }

        for lc in (0..=layer.min(curr_max_layer)).rev() {
            let candidates = self.search_layer(curr_ep, &vector, self.config.ef_construction, lc);
            for neighbor in candidates.iter().take(self.config.m).map(|c| c.id) {
                if neighbor == id {
                    continue;
                }
                {
                    let mut guard = self.layers[lc].write();
                    guard.add_edge(id, neighbor);
                    guard.add_edge(neighbor, id);
                }
                self.prune_connections(lc, neighbor);
            }
            if let Some(best) = candidates.first() {
                curr_ep = best.id;
            }
        }

        if layer > curr_max_layer {
            self.max_layer.store(layer, Ordering::Relaxed);
            *self.entry_point.write() = Some(id);
        }
    }

    fn distance_to(&self, id: FrameId, query: &[f32]) -> f32 {
        self.nodes
            .get(&id)
            .map_or(f32::MAX, |n| 1.0 - cosine(&n.vector, query))
    }

    /// Greedy walk to the closest node on one layer.
    fn greedy_closest(&self, entry: FrameId, query: &[f32], layer: usize) -> (FrameId, f32) {
        let mut best = entry;
        let mut best_dist = self.distance_to(entry, query);
        loop {
            let neighbors: Vec<FrameId> = self.layers[layer].read().neighbors(best).to_vec();
            let mut improved = false;
            for n in neighbors {
                let d = self.distance_to(n, query);
                if d < best_dist {
                    best = n;
                    best_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return (best, best_dist);
            }
        }
    }

    /// Beam search on one layer; result sorted by ascending distance.
    fn search_layer(&self, entry: FrameId, query: &[f32], ef: usize, layer: usize) -> Vec<Candidate> {
        let mut visited = HashSet::new();
        let mut candidates = BinaryHeap::new();
        // Max-heap of the current best (negated distances keep the worst on top)
        let mut best = BinaryHeap::new();

        let entry_dist = self.distance_to(entry, query);
        if entry_dist == f32::MAX {
            return Vec::new();
        }
        visited.insert(entry);
        candidates.push(Candidate {
            distance: entry_dist,
            id: entry,
        });
        best.push(Candidate {
            distance: -entry_dist,
            id: entry,
        });

        while let Some(curr) = candidates.pop() {
            let worst_best = best.peek().map_or(f32::MAX, |c: &Candidate| -c.distance);
            if curr.distance > worst_best && best.len() >= ef {
                break;
            }

            let neighbors: Vec<FrameId> = self.layers[layer].read().neighbors(curr.id).to_vec();
            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = self.distance_to(neighbor, query);
                if dist == f32::MAX {
                    continue;
                }
                let worst_best = best.peek().map_or(f32::MAX, |c: &Candidate| -c.distance);
                if dist < worst_best || best.len() < ef {
                    candidates.push(Candidate {
                        distance: dist,
                        id: neighbor,
                    });
                    best.push(Candidate {
                        distance: -dist,
                        id: neighbor,
                    });
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = best
            .into_iter()
            .map(|c| Candidate {
                distance: -c.distance,
                id: c.id,
            })
            .collect();
        out.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Keep at most 2*M closest neighbours of `node` on `layer`.
    fn prune_connections(&self, layer: usize, node: FrameId) {
        let max_connections = self.config.m * 2;
        let neighbors: Vec<FrameId> = self.layers[layer].read().neighbors(node).to_vec();
        if neighbors.len() <= max_connections {
            return;
        }
        let Some(vector) = self.vector(node) else {
            return;
        };

        let mut scored: Vec<(FrameId, f32)> = neighbors
            .into_iter()
            .map(|n| (n, self.distance_to(n, &vector)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_connections);

        self.layers[layer]
            .write()
            .edges
            .insert(node, scored.into_iter().map(|(id, _)| id).collect());
    }

    /// Remove a vector from the index.
    pub fn remove(&self, id: FrameId) {
        let Some((_, node)) = self.nodes.remove(&id) else {
            return;
        };

        for layer in 0..=node.max_layer {
            let mut guard = self.layers[layer].write();
            let orphaned = guard.edges.remove(&id).unwrap_or_default();
            for n in &orphaned {
                if let Some(list) = guard.edges.get_mut(n) {
                    list.retain(|x| *x != id);
                }
            }
            // Reconnect former neighbours to each other so the graph stays navigable
            for (i, a) in orphaned.iter().enumerate() {
                if let Some(b) = orphaned.get(i + 1) {
                    guard.add_edge(*a, *b);
                    guard.add_edge(*b, *a);
                }
            }
            // Stale back-references from nodes that were pruned away
            for list in guard.edges.values_mut() {
                list.retain(|x| *x != id);
            }
        }

        let needs_new_entry = *self.entry_point.read() == Some(id);
        if needs_new_entry {
            let mut max_layer = 0;
            let mut new_ep = None;
            for entry in self.nodes.iter() {
                if new_ep.is_none() || entry.value().max_layer > max_layer {
                    max_layer = entry.value().max_layer;
                    new_ep = Some(*entry.key());
                }
            }
            *self.entry_point.write() = new_ep;
            self.max_layer.store(max_layer, Ordering::Relaxed);
        }
    }

    /// Search for the `k` nearest neighbours.
    ///
    /// Returns hits sorted by similarity, highest first.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<Neighbor> {
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let Some(entry_point) = *self.entry_point.read() else {
            return Vec::new();
        };

        let ef = ef.max(k);
        let top = self.max_layer.load(Ordering::Relaxed);
        let mut curr_ep = entry_point;
        for lc in (1..=top).rev() {
            curr_ep = self.greedy_closest(curr_ep, query, lc).0;
        }

        self.search_layer(curr_ep, query, ef, 0)
            .into_iter()
            .take(k)
            .map(|c| Neighbor {
                id: c.id,
                similarity: 1.0 - c.distance,
            })
            .collect()
    }

    /// Search with the configured `ef_search`.
    pub fn search_default(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        self.search(query, k, self.config.ef_search)
    }

    /// Clear all vectors from the index.
    pub fn clear(&self) {
        self.nodes.clear();
        for layer in &self.layers {
            layer.write().edges.clear();
        }
        *self.entry_point.write() = None;
        self.max_layer.store(0, Ordering::Relaxed);
    }
}
