/// Index tests: each query path checked against a brute-force scan of the
/// same records.
use std::collections::BTreeSet;
use std::sync::Arc;

use framevault::index::{HnswConfig, HnswIndex};
use framevault::{FrameBuilder, FrameId, FrameVault, Token, VaultConfig, cosine};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const DIM: usize = 8;

fn test_config(dir: &TempDir) -> VaultConfig {
    let mut config = VaultConfig::new(dir.path());
    config.record.vector_dim = DIM;
    config.storage.sync_writes = false;
    config.index.codebook_size = 8;
    config.index.range_page_size = 7;
    config
}

fn unit_vector(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.into_iter().map(|x| x / norm).collect()
}

/// Records appended to partition 1: (id, timestamp, tokens).
fn populate(vault: &FrameVault, timestamps: &[u64], seed: u64) -> Vec<(FrameId, u64, Vec<Token>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    timestamps
        .iter()
        .map(|&ts| {
            let frame = FrameBuilder::new(1)
                .timestamp(ts)
                .field(0, 0.5)
                .field(1, 0.5)
                .level(0, 0, unit_vector(&mut rng, DIM))
                .level(1, 0, unit_vector(&mut rng, DIM))
                .build()
                .unwrap();
            let tokens = vault.tokens_of(&frame);
            let id = vault.append(frame).unwrap();
            (id, ts, tokens)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_range_scan_matches_brute_force(
        timestamps in prop::collection::vec(0u64..500, 1..120),
        bounds in prop::collection::vec((0u64..520, 0u64..520), 1..6),
    ) {
        let dir = TempDir::new().unwrap();
        let vault = FrameVault::open(test_config(&dir)).unwrap();
        let records = populate(&vault, &timestamps, 1);

        for (a, b) in bounds {
            let (start, end) = (a.min(b), a.max(b));
            let mut expected: Vec<_> = records
                .iter()
                .filter(|(_, ts, _)| (start..=end).contains(ts))
                .map(|(id, ts, _)| (*ts, *id))
                .collect();
            expected.sort_unstable();

            let got: Vec<_> = vault.query_range(1, start, end).map(|s| (s.timestamp, s.id)).collect();
            prop_assert_eq!(got, expected);
        }
    }
}

#[test]
fn test_range_with_inverted_bounds_is_empty() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();
    populate(&vault, &[10, 20, 30], 2);
    assert_eq!(vault.query_range(1, 30, 10).count(), 0);
    assert_eq!(vault.query_range(1, 20, 20).count(), 1);
    assert_eq!(vault.query_range(9, 0, u64::MAX).count(), 0);
}

#[test]
fn test_token_lookup_matches_brute_force() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();
    let timestamps: Vec<u64> = (0..150).collect();
    let records = populate(&vault, &timestamps, 3);

    let all_tokens: BTreeSet<Token> = records.iter().flat_map(|(_, _, t)| t.iter().copied()).collect();
    assert!(all_tokens.len() > 4);
    for token in all_tokens {
        let expected: BTreeSet<FrameId> = records
            .iter()
            .filter(|(_, _, tokens)| tokens.contains(&token))
            .map(|(id, _, _)| *id)
            .collect();
        assert_eq!(vault.query_token(1, token), expected, "token {:?}", token);
    }
    // Tokens are per partition
    let (_, _, tokens) = &records[0];
    assert!(vault.query_token(2, tokens[0]).is_empty());
}

#[test]
fn test_vault_similarity_recall() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();
    let mut rng = StdRng::seed_from_u64(4);
    let mut stored = Vec::new();
    for _ in 0..300 {
        let v = unit_vector(&mut rng, DIM);
        let frame = FrameBuilder::new(1).field(0, 0.5).level(0, 0, v.clone()).build().unwrap();
        stored.push((vault.append(frame).unwrap(), v));
    }

    let mut found = 0;
    let queries = 20;
    for _ in 0..queries {
        let q = unit_vector(&mut rng, DIM);
        let mut exact: Vec<_> = stored.iter().map(|(id, v)| (cosine(&q, v), *id)).collect();
        exact.sort_by(|a, b| b.0.total_cmp(&a.0));
        let truth: BTreeSet<_> = exact.iter().take(10).map(|(_, id)| *id).collect();

        let hits = vault.query_similar(1, &q, 10).unwrap();
        assert_eq!(hits.len(), 10);
        assert!(hits.windows(2).all(|w| w[0].rank_score >= w[1].rank_score));
        found += hits.iter().filter(|h| truth.contains(&h.id)).count();
    }
    let recall = found as f32 / (queries * 10) as f32;
    assert!(recall >= 0.9, "recall@10 = {}", recall);
}

#[test]
fn test_hnsw_recall_and_removal() {
    let index = HnswIndex::new(HnswConfig::with_m(12).ef_search(64));
    let mut rng = StdRng::seed_from_u64(5);
    let dim = 32;
    let vectors: Vec<(FrameId, Vec<f32>)> = (1..=1000).map(|id| (id, unit_vector(&mut rng, dim))).collect();
    for (id, v) in &vectors {
        index.add(*id, Arc::from(v.as_slice()));
    }
    assert_eq!(index.len(), 1000);

    let removed: BTreeSet<FrameId> = (1..=1000).step_by(4).collect();
    for id in &removed {
        index.remove(*id);
    }
    assert_eq!(index.len(), 750);

    let mut found = 0;
    for _ in 0..25 {
        let q = unit_vector(&mut rng, dim);
        let mut exact: Vec<_> = vectors
            .iter()
            .filter(|(id, _)| !removed.contains(id))
            .map(|(id, v)| (cosine(&q, v), *id))
            .collect();
        exact.sort_by(|a, b| b.0.total_cmp(&a.0));
        let truth: BTreeSet<_> = exact.iter().take(10).map(|(_, id)| *id).collect();

        let hits = index.search_default(&q, 10);
        assert!(hits.iter().all(|h| !removed.contains(&h.id)));
        found += hits.iter().filter(|h| truth.contains(&h.id)).count();
    }
    assert!(found as f32 / 250.0 >= 0.85, "recall@10 = {}", found as f32 / 250.0);
}
