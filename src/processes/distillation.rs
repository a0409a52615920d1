/// Distillation: folding clusters of similar records into summaries.
///
/// Runs inside the archival pass, over the warm records about to be
/// compressed into cold. Near-duplicates are grouped and each large enough
/// group is represented by one summary record, so the detail lost to
/// compression survives in aggregate.
///
/// ## The Algorithm
///
/// 1. Link every pair of candidates whose summary vectors are at least
///    `similarity_threshold` apart (union-find)
/// 2. Keep clusters with at least `min_cluster_size` members, largest first,
///    at most `max_summaries` of them
/// 3. Build one summary frame per cluster:
///    - fields carried by at least half the members
///    - coarsest level: confidence-weighted centroid of the members
///    - finer levels: copied from the most confident member with the field
///    - every field at `summary_confidence`, parent = most confident member
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::config::DistillConfig;
use crate::error::VaultResult;
use crate::frame::{Frame, FrameBuilder, MAX_FIELDS};
use crate::types::{FrameId, cosine, normalize};

/// One cluster chosen for distillation.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Member ids, ascending
    pub members: Vec<FrameId>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Disjoint-set forest over candidate positions.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Cluster finder and summary builder.
#[derive(Debug)]
pub struct Distiller {
    config: DistillConfig,
    clusters_found: AtomicU64,
    summaries_built: AtomicU64,
    members_distilled: AtomicU64,
}

impl Distiller {
    pub fn new(config: DistillConfig) -> Self {
        Self {
            config,
            clusters_found: AtomicU64::new(0),
            summaries_built: AtomicU64::new(0),
            members_distilled: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DistillConfig {
        &self.config
    }

    /// Group `candidates` (id, summary vector) into clusters worth a summary.
    pub fn clusters(&self, candidates: &[(FrameId, Arc<[f32]>)]) -> Vec<Cluster> {
        let n = candidates.len();
        if n < self.config.min_cluster_size.max(2) {
            return Vec::new();
        }

        let mut sets = UnionFind::new(n);
        for i in 0..n {
            for j in (i + 1)..n {
                if cosine(&candidates[i].1, &candidates[j].1) >= self.config.similarity_threshold {
                    sets.union(i, j);
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<FrameId>> = BTreeMap::new();
        for (i, (id, _)) in candidates.iter().enumerate() {
            groups.entry(sets.find(i)).or_default().push(*id);
        }

        let mut clusters: Vec<Cluster> = groups
            .into_values()
            .filter(|members| members.len() >= self.config.min_cluster_size)
            .map(|mut members| {
                members.sort_unstable();
                Cluster { members }
            })
            .collect();
        clusters.sort_by(|a, b| b.len().cmp(&a.len()).then(a.members[0].cmp(&b.members[0])));
        clusters.truncate(self.config.max_summaries);

        self.clusters_found
            .fetch_add(clusters.len() as u64, Ordering::Relaxed);
        clusters
    }

    /// Build the summary frame for one cluster.
    ///
    /// Returns `None` when no field is common to at least half the members.
    pub fn summarize(&self, members: &[Arc<Frame>]) -> VaultResult<Option<Frame>> {
        let Some(best) = members
            .iter()
            .max_by(|a, b| a.confidence().total_cmp(&b.confidence()).then(b.id().cmp(&a.id())))
        else {
            return Ok(None);
        };

        let mut builder = FrameBuilder::new(best.partition()).parent(best.id());
        let mut kept = 0;

        for index in 0..MAX_FIELDS {
            let carriers: Vec<&Arc<Frame>> = members.iter().filter(|f| f.field(index).is_some()).collect();
            if carriers.is_empty() || carriers.len() * 2 < members.len() {
                continue;
            }
            let Some(donor) = carriers
                .iter()
                .max_by(|a, b| field_confidence(a, index).total_cmp(&field_confidence(b, index)))
                .and_then(|f| f.field(index))
            else {
                continue;
            };
            let Some((coarsest_level, donor_coarsest)) = donor.levels().next() else {
                continue;
            };

            let mut centroid = vec![0.0f32; donor_coarsest.len()];
            for frame in &carriers {
                let Some(field) = frame.field(index) else { continue };
                let Some(v) = field.coarsest() else { continue };
                for (acc, x) in centroid.iter_mut().zip(v) {
                    *acc += field.confidence() * x;
                }
            }
            if !normalize(&mut centroid) {
                centroid = donor_coarsest.to_vec();
            }

            builder = builder
                .field(index, self.config.summary_confidence)
                .level(index, coarsest_level, centroid);
            for (level, v) in donor.levels().skip(1) {
                builder = builder.level(index, level, v.to_vec());
            }
            kept += 1;
        }

        if kept == 0 {
            return Ok(None);
        }
        let summary = builder.build()?;
        self.summaries_built.fetch_add(1, Ordering::Relaxed);
        self.members_distilled
            .fetch_add(members.len() as u64, Ordering::Relaxed);
        Ok(Some(summary))
    }

    pub fn stats(&self) -> DistillStats {
        DistillStats {
            clusters_found: self.clusters_found.load(Ordering::Relaxed),
            summaries_built: self.summaries_built.load(Ordering::Relaxed),
            members_distilled: self.members_distilled.load(Ordering::Relaxed),
        }
    }
}

fn field_confidence(frame: &Frame, index: usize) -> f32 {
    frame.field(index).map_or(0.0, |f| f.confidence())
}

/// Distillation statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DistillStats {
    pub clusters_found: u64,
    pub summaries_built: u64,
    pub members_distilled: u64,
}
