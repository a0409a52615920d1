/// Crash recovery tests.
///
/// Each test writes through one vault, drops it (cleanly or not), damages
/// the files where needed and checks what a fresh vault recovers.
use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use framevault::{FrameBuilder, FrameVault, PartitionId, Stage, Tier, VaultConfig};
use tempfile::TempDir;

const DIM: usize = 8;

fn test_config(dir: &TempDir) -> VaultConfig {
    let mut config = VaultConfig::new(dir.path());
    config.record.vector_dim = DIM;
    config.storage.sync_writes = false;
    config.index.codebook_size = 16;
    config
}

fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i % DIM] = 1.0;
    v
}

fn frame(partition: PartitionId, i: usize) -> framevault::Frame {
    FrameBuilder::new(partition)
        .timestamp(1_000 + i as u64)
        .field(0, 0.6)
        .level(0, 0, axis(i))
        .build()
        .unwrap()
}

fn partition_dir(dir: &TempDir, partition: PartitionId) -> PathBuf {
    dir.path().join("partitions").join(format!("p{}", partition))
}

#[tokio::test]
async fn test_reopen_after_close_restores_records() {
    let dir = TempDir::new().unwrap();
    let ids: Vec<_> = {
        let vault = FrameVault::open(test_config(&dir)).unwrap();
        let ids = (0..10).map(|i| vault.append(frame(1 + (i % 2) as u64, i)).unwrap()).collect();
        vault.close().await.unwrap();
        ids
    };

    let vault = FrameVault::open(test_config(&dir)).unwrap();
    assert_eq!(vault.partitions(), vec![1, 2]);
    for (i, id) in ids.iter().enumerate() {
        let partition = 1 + (i % 2) as u64;
        let fetched = vault.fetch(partition, *id).unwrap().unwrap();
        assert_eq!(fetched.timestamp(), 1_000 + i as u64);
        assert_eq!(fetched.field(0).unwrap().level(0).unwrap(), axis(i).as_slice());

        let summary = vault.summary(partition, *id).unwrap();
        assert_eq!(summary.stage, Stage::Full);
        assert_eq!(summary.tier, Tier::Warm);
    }

    // Ids continue after the highest recovered one
    let next = vault.append(frame(1, 99)).unwrap();
    assert_eq!(next, ids.iter().max().unwrap() + 1);
}

#[test]
fn test_unflushed_writes_replay_from_wal() {
    let dir = TempDir::new().unwrap();
    let (parent, child) = {
        let vault = FrameVault::open(test_config(&dir)).unwrap();
        let parent = vault.append(frame(3, 0)).unwrap();
        let child = vault
            .append(
                FrameBuilder::new(3)
                    .parent(parent)
                    .field(0, 0.7)
                    .level(0, 0, axis(1))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        (parent, child)
    };

    let vault = FrameVault::open(test_config(&dir)).unwrap();
    let stats = vault.stats().unwrap();
    assert_eq!(stats.partitions.len(), 1);
    assert_eq!(stats.partitions[0].segments, 0);
    assert_eq!(stats.record_count(), 2);

    let restored = vault.fetch(3, child).unwrap().unwrap();
    assert_eq!(restored.parent_ref(), Some(parent));
    let hits = vault.query_similar(3, &axis(0), 1).unwrap();
    assert_eq!(hits[0].id, parent);
}

#[test]
fn test_torn_wal_tail_is_discarded() {
    let dir = TempDir::new().unwrap();
    {
        let vault = FrameVault::open(test_config(&dir)).unwrap();
        for i in 0..3 {
            vault.append(frame(1, i)).unwrap();
        }
    }

    // Cut the last record short, as if the process died mid-write
    let wal = partition_dir(&dir, 1).join("wal.log");
    let len = fs::metadata(&wal).unwrap().len();
    OpenOptions::new().write(true).open(&wal).unwrap().set_len(len - 5).unwrap();

    let vault = FrameVault::open(test_config(&dir)).unwrap();
    let stats = vault.stats().unwrap();
    assert_eq!(stats.partitions[0].wal.truncated_tails, 1);
    assert_eq!(stats.record_count(), 2);
    assert!(vault.fetch(1, 1).unwrap().is_some());
    assert!(vault.fetch(1, 2).unwrap().is_some());
    assert!(vault.fetch(1, 3).unwrap().is_none());

    // The lost id is handed out again
    assert_eq!(vault.append(frame(1, 3)).unwrap(), 3);
}

#[test]
fn test_corrupt_segment_is_quarantined() {
    let dir = TempDir::new().unwrap();
    {
        let vault = FrameVault::open(test_config(&dir)).unwrap();
        for i in 0..4 {
            vault.append(frame(1, i)).unwrap();
        }
        vault.flush().unwrap();
        vault.append(frame(1, 4)).unwrap();
    }

    let segment = partition_dir(&dir, 1).join("seg-00000001.fvs");
    let mut bytes = fs::read(&segment).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&segment, bytes).unwrap();

    let vault = FrameVault::open(test_config(&dir)).unwrap();
    let stats = vault.stats().unwrap();
    assert_eq!(stats.partitions[0].quarantined, 1);
    assert_eq!(stats.partitions[0].segments, 0);
    assert!(!segment.exists());
    assert!(partition_dir(&dir, 1).join("quarantine").join("seg-00000001.fvs").exists());

    // Only the record written after the flush survives, from the WAL
    assert_eq!(stats.record_count(), 1);
    assert!(vault.fetch(1, 5).unwrap().is_some());
}

#[tokio::test]
async fn test_archived_records_stay_cold_after_reopen() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.tiers.hot_capacity = 4;
    config.bleed.prefetch_k = 0;
    config.bleed.distill.min_cluster_size = 1000;

    let archived: Vec<_> = {
        let vault = FrameVault::open(config.clone()).unwrap();
        let ids: Vec<_> = (0..8).map(|i| vault.append(frame(1, i)).unwrap()).collect();
        vault.drain_bleed_queue();
        let later = framevault::now_nanos() + 2 * 3600 * framevault::NANOS_PER_SEC;
        assert!(vault.archive_pass_at(later).unwrap().archived > 0);
        let archived = ids
            .into_iter()
            .filter(|id| vault.summary(1, *id).unwrap().tier == Tier::Cold)
            .collect();
        vault.close().await.unwrap();
        archived
    };
    assert!(!archived.is_empty());

    let vault = FrameVault::open(config).unwrap();
    for id in &archived {
        let summary = vault.summary(1, *id).unwrap();
        assert_eq!(summary.tier, Tier::Cold);
        assert_eq!(summary.stage, Stage::Compressed);
        assert!(vault.fetch(1, *id).unwrap().is_some());
    }
}
