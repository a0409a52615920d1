/// Integration tests for framevault.
///
/// These tests drive the public API end to end: appends, the three query
/// paths, coherence, tier movement and recall.
use framevault::{
    FrameBuilder, FrameQuery, FrameVault, PartitionId, Stage, Tier, VaultConfig, VaultError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const DIM: usize = 8;

fn test_config(dir: &TempDir) -> VaultConfig {
    let mut config = VaultConfig::new(dir.path());
    config.record.vector_dim = DIM;
    config.storage.sync_writes = false;
    config.index.codebook_size = 16;
    config
}

fn random_vector(rng: &mut StdRng) -> Vec<f32> {
    (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i % DIM] = 1.0;
    v
}

fn frame(partition: PartitionId, vector: Vec<f32>, confidence: f32) -> framevault::Frame {
    FrameBuilder::new(partition)
        .field(0, confidence)
        .level(0, 0, vector)
        .build()
        .unwrap()
}

#[test]
fn test_append_then_query_returns_record_unchanged() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();

    let original = FrameBuilder::new(1)
        .field(0, 0.8)
        .field(2, 0.7)
        .level(0, 0, axis(0))
        .level(0, 1, axis(1))
        .level(2, 0, axis(3))
        .build()
        .unwrap();
    let id = vault.append(original.clone()).unwrap();

    let summary_vector = original.summary_vector().unwrap();
    let hits = vault.query_similar(1, &summary_vector, 1).unwrap();
    assert_eq!(hits[0].id, id);
    assert!((hits[0].similarity.unwrap() - 1.0).abs() < 1e-4);
    assert_eq!(hits[0].confidence, 0.7);

    let tokens = vault.tokens_of(&original);
    assert_eq!(tokens.len(), 2);
    for token in tokens {
        assert!(vault.query_token(1, token).contains(&id));
    }

    let fetched = vault.fetch(1, id).unwrap().unwrap();
    assert_eq!(fetched.id(), id);
    assert_eq!(fetched.slot_mask(), original.slot_mask());
    assert_eq!(fetched.resolution_mask(), original.resolution_mask());
    assert_eq!(fetched.field(0), original.field(0));
    assert_eq!(fetched.field(2), original.field(2));
}

#[test]
fn test_middle_of_timespan_range_scan() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.index.range_page_size = 16;
    let vault = FrameVault::open(config).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    // Timestamps 1000..2000, round-robin over four partitions
    for i in 0..1000u64 {
        let f = FrameBuilder::new(i % 4)
            .timestamp(1000 + i)
            .field(0, 0.5)
            .level(0, 0, random_vector(&mut rng))
            .build()
            .unwrap();
        vault.append(f).unwrap();
    }

    let results: Vec<_> = vault.query_range(0, 1250, 1749).collect();
    assert_eq!(results.len(), 125);
    assert!(results.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(results.iter().all(|r| r.partition == 0 && (1250..=1749).contains(&r.timestamp)));
    assert_eq!(results[0].timestamp, 1252);
    assert_eq!(results[124].timestamp, 1748);
}

#[test]
fn test_range_scan_resumes_from_cursor() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.index.range_page_size = 7;
    let vault = FrameVault::open(config).unwrap();

    for i in 0..60u64 {
        let f = FrameBuilder::new(3)
            .timestamp(100 + i)
            .field(0, 0.5)
            .level(0, 0, axis(i as usize))
            .build()
            .unwrap();
        vault.append(f).unwrap();
    }

    let mut first = vault.query_range(3, 0, u64::MAX);
    let head: Vec<_> = first.by_ref().take(25).collect();
    let cursor = first.cursor().unwrap();
    drop(first);

    let tail: Vec<_> = vault.resume_range(3, 0, u64::MAX, cursor).collect();
    assert_eq!(head.len() + tail.len(), 60);
    assert_eq!(tail[0].timestamp, head[24].timestamp + 1);
}

#[test]
fn test_contradiction_is_superseded_but_retrievable() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();

    let v = axis(2);
    let neg: Vec<f32> = v.iter().map(|x| -x).collect();
    let strong = vault.append(frame(5, v.clone(), 0.9)).unwrap();
    let weak = vault.append(frame(5, neg.clone(), 0.6)).unwrap();

    let report = vault.coherence_pass().unwrap();
    assert_eq!(report.superseded, 1);

    let authoritative = vault.query_authoritative(5, &v, 10).unwrap();
    assert_eq!(authoritative.len(), 1);
    assert_eq!(authoritative[0].id, strong);

    let loser = vault.summary(5, weak).unwrap();
    assert!(!loser.authoritative);
    assert_eq!(loser.superseded_by, Some(strong));
    assert!(vault.fetch(5, weak).unwrap().is_some());

    // Ranked below its raw similarity
    let hits = vault.query_similar(5, &neg, 1).unwrap();
    assert_eq!(hits[0].id, weak);
    assert!((hits[0].rank_score.unwrap() - (hits[0].similarity.unwrap() - 0.25)).abs() < 1e-5);

    // A second pass finds nothing new
    assert_eq!(vault.coherence_pass().unwrap().superseded, 0);
}

#[test]
fn test_supersession_is_scoped_to_its_partition() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();

    let v = axis(1);
    let neg: Vec<f32> = v.iter().map(|x| -x).collect();
    vault.append(frame(1, v, 0.9)).unwrap();
    let weak = vault.append(frame(1, neg.clone(), 0.6)).unwrap();
    vault.coherence_pass().unwrap();

    let from_one = vault.query_similar_in(1, &[1, 2], &neg, 1).unwrap();
    assert!(!from_one[0].authoritative);

    let from_two = vault.query_similar_in(2, &[1, 2], &neg, 1).unwrap();
    assert_eq!(from_two[0].id, weak);
    assert!(from_two[0].authoritative);
}

#[test]
fn test_eviction_recall_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.tiers.hot_capacity = 5;
    config.bleed.prefetch_k = 0;
    let vault = FrameVault::open(config).unwrap();

    let first = vault.append(frame(1, axis(0), 0.4)).unwrap();
    let original = vault.fetch(1, first).unwrap().unwrap();
    for i in 1..10 {
        vault.append(frame(1, axis(i), 0.9)).unwrap();
    }
    vault.drain_bleed_queue();

    let ghost = vault.ghost(first).expect("lowest confidence record is evicted first");
    assert_eq!(ghost.partition, 1);
    assert_eq!(ghost.confidence, original.confidence());
    assert_ne!(vault.summary(1, first).unwrap().tier, Tier::Hot);

    let recalled = vault.recall(1, first).unwrap();
    assert_eq!(recalled.id(), original.id());
    assert_eq!(recalled.confidence(), original.confidence());
    assert_eq!(recalled.partition(), original.partition());
    assert!(vault.ghost(first).is_none());
}

#[test]
fn test_recall_from_cold_archive() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.tiers.hot_capacity = 4;
    config.bleed.prefetch_k = 0;
    config.bleed.distill.min_cluster_size = 1000;
    let vault = FrameVault::open(config).unwrap();

    let ids: Vec<_> = (0..8)
        .map(|i| vault.append(frame(2, axis(i), 0.5)).unwrap())
        .collect();
    vault.drain_bleed_queue();

    let later = framevault::now_nanos() + 2 * 3600 * framevault::NANOS_PER_SEC;
    let report = vault.archive_pass_at(later).unwrap();
    assert!(report.idle);
    assert!(report.archived > 0);
    assert_eq!(report.sealed, 1);

    let archived = ids
        .iter()
        .copied()
        .find(|id| vault.summary(2, *id).unwrap().tier == Tier::Cold)
        .unwrap();
    let summary = vault.summary(2, archived).unwrap();
    assert_eq!(summary.stage, Stage::Compressed);
    assert_eq!(vault.ghost(archived).unwrap().location, Tier::Cold);

    let recalled = vault.recall(2, archived).unwrap();
    assert_eq!(recalled.id(), archived);
    assert_eq!(recalled.confidence(), 0.5);
    assert_eq!(recalled.partition(), 2);
    assert_eq!(vault.summary(2, archived).unwrap().tier, Tier::Hot);
}

#[test]
fn test_recall_similar_uses_ghosts() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.tiers.hot_capacity = 3;
    config.bleed.prefetch_k = 0;
    let vault = FrameVault::open(config).unwrap();

    for i in 0..6 {
        vault.append(frame(1, axis(i), 0.5)).unwrap();
    }
    vault.drain_bleed_queue();
    let ghost = vault.ghosts(1).into_iter().next().unwrap();

    let recalled = vault.recall_similar(1, &ghost.summary, 0.99).unwrap();
    assert_eq!(recalled.len(), 1);
    assert_eq!(recalled[0].id(), ghost.id);
    assert!(vault.recall_similar(7, &axis(0), 0.5).unwrap().is_empty());
}

#[test]
fn test_composed_query() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();

    let mut ids = Vec::new();
    for i in 0..20u64 {
        let f = FrameBuilder::new(4)
            .timestamp(10 + i)
            .field(0, 0.5)
            .level(0, 0, axis((i % 2) as usize))
            .build()
            .unwrap();
        ids.push(vault.append(f).unwrap());
    }

    let even = vault.fetch(4, ids[0]).unwrap().unwrap();
    let token = vault.tokens_of(&even)[0];

    let by_token = vault.query(&FrameQuery::new(4).with_token(token).limit(100)).unwrap();
    let odd = vault.fetch(4, ids[1]).unwrap().unwrap();
    let expected = if vault.tokens_of(&odd)[0] == token { 20 } else { 10 };
    assert_eq!(by_token.len(), expected);

    let windowed = vault
        .query(&FrameQuery::new(4).similar_to(axis(0)).between(10, 17).limit(100))
        .unwrap();
    assert!(windowed.iter().all(|s| (10..=17).contains(&s.timestamp)));
    assert_eq!(windowed.len(), 8);
    assert!(windowed[0].similarity.unwrap() > 0.99);

    let unknown = framevault::Token::new(9, 9);
    assert!(vault.query(&FrameQuery::new(4).with_token(unknown)).unwrap().is_empty());
    assert!(vault.query(&FrameQuery::new(99).similar_to(axis(0))).unwrap().is_empty());
}

#[test]
fn test_malformed_frames_rejected_before_log() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.record.max_payload_bytes = 64;
    let vault = FrameVault::open(config).unwrap();

    let wrong_dim = frame(1, vec![1.0, 0.0], 0.5);
    assert!(matches!(vault.append(wrong_dim), Err(VaultError::Serialization { .. })));

    let big = FrameBuilder::new(1)
        .field(0, 0.5)
        .field(1, 0.5)
        .field(2, 0.5)
        .level(0, 0, axis(0))
        .level(1, 0, axis(1))
        .level(2, 0, axis(2))
        .build()
        .unwrap();
    assert!(matches!(vault.append(big), Err(VaultError::PayloadTooLarge { .. })));

    assert!(vault.query_similar(1, &[1.0, 0.0], 3).is_err());
    assert_eq!(vault.stats().unwrap().record_count(), 0);
}

#[test]
fn test_missing_ids() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();

    assert!(vault.fetch(1, 42).unwrap().is_none());
    assert!(vault.get(42).unwrap().is_none());
    assert!(vault.summary(1, 42).is_none());
    assert_eq!(vault.query_range(1, 0, u64::MAX).count(), 0);
    assert!(matches!(vault.recall(1, 42), Err(VaultError::NotFound { .. })));
    assert!(matches!(vault.pin(1, 42), Err(VaultError::NotFound { .. })));
}

#[test]
fn test_lineage_reference_counts() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();

    let parent = vault.append(frame(1, axis(0), 0.5)).unwrap();
    for i in 0..3 {
        let child = FrameBuilder::new(2)
            .parent(parent)
            .field(0, 0.5)
            .level(0, 0, axis(i + 1))
            .build()
            .unwrap();
        vault.append(child).unwrap();
    }
    let child = vault.query_range(2, 0, u64::MAX).next().unwrap();
    assert_eq!(child.parent_ref, Some(parent));
    assert!(vault.get(parent).unwrap().is_some());
}

#[test]
fn test_maintenance_cycle_report_serializes() {
    let dir = TempDir::new().unwrap();
    let vault = FrameVault::open(test_config(&dir)).unwrap();
    vault.append(frame(1, axis(0), 0.5)).unwrap();

    let report = vault.maintenance_cycle().unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert!(json.get("gc").is_some());
    assert!(json.get("archive").is_some());

    let stats = serde_json::to_value(vault.stats().unwrap()).unwrap();
    assert_eq!(stats["partitions"][0]["live"], 1);
}
