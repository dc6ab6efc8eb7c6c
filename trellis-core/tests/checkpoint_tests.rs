//! Incremental maintenance: search over checkpointed and pending rows,
//! checkpoint idempotence, rollback and retry, and reopening from storage
//! info.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::fs;
use tempfile::TempDir;
use trellis_core::hnsw::OnDiskHnswIndex;
use trellis_core::storage::StorageManager;
use trellis_core::{DistanceMetric, HnswBuilder, HnswIndexConfig, HnswStorageInfo, QueryHnswConfig};

const DIMS: u32 = 8;

fn config() -> HnswIndexConfig {
    HnswIndexConfig {
        mu: 4,
        ml: 8,
        pu: 0.25,
        efc: 32,
        alpha: 1.2,
        metric: DistanceMetric::L2,
        seed: Some(17),
        ..Default::default()
    }
}

fn exhaustive_query_config() -> QueryHnswConfig {
    QueryHnswConfig { efs: 1000, ..Default::default() }
}

fn random_row(rng: &mut StdRng) -> Vec<f32> {
    (0..DIMS).map(|_| rng.random::<f32>()).collect()
}

fn insert_rows(storage: &mut StorageManager, rng: &mut StdRng, n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|_| {
            let row = random_row(rng);
            storage.node_table_mut().insert(Some(&row)).unwrap();
            row
        })
        .collect()
}

fn brute_force(rows: &[Vec<f32>], query: &[f32], k: usize) -> Vec<u64> {
    let mut scored: Vec<(f64, u64)> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (DistanceMetric::L2.distance(query, row), i as u64))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(k).map(|(_, i)| i).collect()
}

fn rel_table_bytes(storage: &StorageManager) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = fs::read_dir(storage.dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "csr"))
        .map(|path| (path.display().to_string(), fs::read(&path).unwrap()))
        .collect();
    files.sort();
    files
}

#[test]
fn test_scenario_pending_rows_searched_exactly() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let mut rows = insert_rows(&mut storage, &mut rng, 500);

    let mut index = OnDiskHnswIndex::create(&mut storage, config()).unwrap();
    assert!(index.checkpoint(&mut storage).unwrap());
    assert_eq!(index.num_checkpointed_nodes(), 500);

    rows.extend(insert_rows(&mut storage, &mut rng, 50));
    for _ in 0..20 {
        let query = random_row(&mut rng);
        let found = index.search(&storage, &query, 10, &exhaustive_query_config(), None).unwrap();
        let offsets: Vec<u64> = found.iter().map(|n| n.offset).collect();
        assert_eq!(offsets, brute_force(&rows, &query, 10));
    }
}

#[test]
fn test_pending_row_beats_checkpointed_results() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let mut rng = StdRng::seed_from_u64(2);
    insert_rows(&mut storage, &mut rng, 200);
    let index = HnswBuilder::new(config()).build(&mut storage).unwrap();

    let query = random_row(&mut rng);
    let offset = storage.node_table_mut().insert(Some(&query)).unwrap();
    let found = index.search(&storage, &query, 5, &QueryHnswConfig::default(), None).unwrap();

    assert_eq!(found[0].offset, offset);
    assert!(found[0].distance.abs() < 1e-6);
    assert_eq!(found.len(), 5);
}

#[test]
fn test_checkpoint_without_pending_rows_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    insert_rows(&mut storage, &mut rng, 100);

    let mut index = OnDiskHnswIndex::create(&mut storage, config()).unwrap();
    assert!(index.checkpoint(&mut storage).unwrap());

    let info_bytes = index.to_bytes();
    let commits = storage.commit_count();
    let tables = rel_table_bytes(&storage);

    assert!(!index.checkpoint(&mut storage).unwrap());
    assert_eq!(index.to_bytes(), info_bytes);
    assert_eq!(storage.commit_count(), commits);
    assert_eq!(rel_table_bytes(&storage), tables);
}

#[test]
fn test_checkpoint_bounds_degrees() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let mut rng = StdRng::seed_from_u64(4);
    insert_rows(&mut storage, &mut rng, 150);
    let mut index = HnswBuilder::new(config()).build(&mut storage).unwrap();

    // Three rounds so later rows land on already-full neighbor lists
    for _ in 0..3 {
        insert_rows(&mut storage, &mut rng, 100);
        assert!(index.checkpoint(&mut storage).unwrap());
    }

    let info = *index.storage_info();
    assert_eq!(info.num_checkpointed_nodes, 450);
    let upper = storage.rel_table(info.upper_rel_table_id).unwrap();
    let lower = storage.rel_table(info.lower_rel_table_id).unwrap();
    for node in 0..450 {
        let degree = lower.committed_neighbors(node).len();
        assert!((1..=8).contains(&degree), "lower node {node} has degree {degree}");
        assert!(upper.committed_neighbors(node).len() <= 4);
    }
}

#[test]
fn test_checkpoint_edges_are_bidirectional_before_pruning() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    insert_rows(&mut storage, &mut rng, 30);

    let wide = HnswIndexConfig { mu: 64, ml: 64, pu: 0.5, ..config() };
    let mut index = OnDiskHnswIndex::create(&mut storage, wide).unwrap();
    index.checkpoint(&mut storage).unwrap();

    let info = *index.storage_info();
    for table in [info.upper_rel_table_id, info.lower_rel_table_id] {
        let table = storage.rel_table(table).unwrap();
        let edges: BTreeSet<(u64, u64)> = (0..30)
            .flat_map(|src| table.committed_neighbors(src).iter().map(move |&dst| (src, dst)))
            .collect();
        for &(src, dst) in &edges {
            assert!(edges.contains(&(dst, src)), "edge {src} -> {dst} has no reverse");
        }
    }
}

#[test]
fn test_failed_checkpoint_rolls_back_and_retries() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let mut rng = StdRng::seed_from_u64(6);
    let mut rows = insert_rows(&mut storage, &mut rng, 100);
    let mut index = HnswBuilder::new(config()).build(&mut storage).unwrap();

    rows.extend(insert_rows(&mut storage, &mut rng, 40));
    let info_bytes = index.to_bytes();
    let tables = rel_table_bytes(&storage);
    let commits = storage.commit_count();

    storage.set_read_only(true);
    let err = index.checkpoint(&mut storage).unwrap_err();
    assert!(format!("{err:#}").contains("read-only"));
    assert_eq!(index.to_bytes(), info_bytes);
    assert_eq!(index.num_checkpointed_nodes(), 100);
    assert_eq!(rel_table_bytes(&storage), tables);
    assert_eq!(storage.commit_count(), commits);

    // Pending rows stay visible through the exact scan
    let query = rows[120].clone();
    let found = index.search(&storage, &query, 1, &QueryHnswConfig::default(), None).unwrap();
    assert_eq!(found[0].offset, 120);

    storage.set_read_only(false);
    assert!(index.checkpoint(&mut storage).unwrap());
    assert_eq!(index.num_checkpointed_nodes(), 140);
    let lower = storage.rel_table(index.storage_info().lower_rel_table_id).unwrap();
    assert!(!lower.committed_neighbors(120).is_empty());
}

#[test]
fn test_checkpoint_failing_on_second_table_publishes_nothing() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    insert_rows(&mut storage, &mut rng, 100);
    let mut index = HnswBuilder::new(config()).build(&mut storage).unwrap();
    insert_rows(&mut storage, &mut rng, 40);
    storage.node_table_mut().commit().unwrap();

    let info = *index.storage_info();
    assert!(info.upper_rel_table_id < info.lower_rel_table_id);
    let generation = storage.generation();
    let tables = rel_table_bytes(&storage);
    let manifest_path = dir.path().join("MANIFEST");
    let manifest = fs::read(&manifest_path).unwrap();

    // Tables are written in id order, so the lower layer's file comes second
    let staged = |table: u64| dir.path().join(format!("rel_{table}.{}.csr", generation + 1));
    let blocker = staged(info.lower_rel_table_id);
    fs::create_dir(&blocker).unwrap();
    fs::write(blocker.join("occupied"), b"").unwrap();

    assert!(index.checkpoint(&mut storage).is_err());
    assert_eq!(index.storage_info(), &info);
    assert_eq!(storage.generation(), generation);
    assert_eq!(fs::read(&manifest_path).unwrap(), manifest);
    assert_eq!(rel_table_bytes(&storage), tables);
    assert!(!staged(info.upper_rel_table_id).exists());
    let leftovers = fs::read_dir(dir.path())
        .unwrap()
        .filter(|entry| entry.as_ref().unwrap().path().extension().is_some_and(|ext| ext == "tmp"))
        .count();
    assert_eq!(leftovers, 0);

    // Reopening sees the last committed checkpoint only
    drop(storage);
    let storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let reopened = OnDiskHnswIndex::open(&storage, config()).unwrap().unwrap();
    assert_eq!(reopened.storage_info(), &info);
    assert_eq!(rel_table_bytes(&storage), tables);
    drop(storage);

    fs::remove_dir_all(&blocker).unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    assert!(index.checkpoint(&mut storage).unwrap());
    assert_eq!(index.num_checkpointed_nodes(), 140);
    drop(storage);

    let storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let reopened = OnDiskHnswIndex::open(&storage, config()).unwrap().unwrap();
    assert_eq!(reopened.storage_info(), index.storage_info());
    let lower = storage.rel_table(info.lower_rel_table_id).unwrap();
    assert!(!lower.committed_neighbors(120).is_empty());
}

#[test]
fn test_checkpoint_commits_storage_info() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(10);
    {
        let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
        insert_rows(&mut storage, &mut rng, 60);
        let mut index = OnDiskHnswIndex::create(&mut storage, config()).unwrap();
        assert_eq!(OnDiskHnswIndex::open(&storage, config()).unwrap().unwrap().num_checkpointed_nodes(), 0);
        index.checkpoint(&mut storage).unwrap();
    }

    let storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let index = OnDiskHnswIndex::open(&storage, config()).unwrap().unwrap();
    assert_eq!(index.num_checkpointed_nodes(), 60);

    let empty = TempDir::new().unwrap();
    let storage = StorageManager::open(empty.path(), DIMS).unwrap();
    assert!(OnDiskHnswIndex::open(&storage, config()).unwrap().is_none());
}

#[test]
fn test_null_rows_skipped_by_checkpoint_and_search() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    insert_rows(&mut storage, &mut rng, 50);
    storage.node_table_mut().insert(None).unwrap();
    insert_rows(&mut storage, &mut rng, 10);
    storage.node_table_mut().delete(55).unwrap();

    let mut index = OnDiskHnswIndex::create(&mut storage, config()).unwrap();
    let query = [0.5; DIMS as usize];
    let before = index.search(&storage, &query, 61, &exhaustive_query_config(), None).unwrap();
    assert_eq!(before.len(), 59);

    index.checkpoint(&mut storage).unwrap();
    assert_eq!(index.num_checkpointed_nodes(), 61);
    let lower = storage.rel_table(index.storage_info().lower_rel_table_id).unwrap();
    assert!(lower.committed_neighbors(50).is_empty());
    assert!(lower.committed_neighbors(55).is_empty());

    let after = index.search(&storage, &query, 61, &exhaustive_query_config(), None).unwrap();
    assert!(after.iter().all(|n| n.offset != 50 && n.offset != 55));
}

#[test]
fn test_empty_index_searches_return_nothing() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let mut index = OnDiskHnswIndex::create(&mut storage, config()).unwrap();

    let query = [0.0; DIMS as usize];
    assert!(index.search(&storage, &query, 3, &QueryHnswConfig::default(), None).unwrap().is_empty());
    assert!(!index.checkpoint(&mut storage).unwrap());

    index.insert(0);
    assert!(index.search(&storage, &query, 0, &QueryHnswConfig::default(), None).is_err());
    assert!(index.search(&storage, &[0.0; 3], 3, &QueryHnswConfig::default(), None).is_err());
}

#[test]
fn test_reopen_from_storage_info() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(8);
    let (bytes, rows) = {
        let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
        let rows = insert_rows(&mut storage, &mut rng, 120);
        let mut index = OnDiskHnswIndex::create(&mut storage, config()).unwrap();
        index.checkpoint(&mut storage).unwrap();
        (index.to_bytes(), rows)
    };

    let storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let index = OnDiskHnswIndex::load(&storage, &bytes, config()).unwrap();
    assert_eq!(index.num_checkpointed_nodes(), 120);

    let found = index.search(&storage, &rows[42], 3, &exhaustive_query_config(), None).unwrap();
    let offsets: Vec<u64> = found.iter().map(|n| n.offset).collect();
    assert_eq!(offsets, brute_force(&rows, &rows[42], 3));
}

#[test]
fn test_load_rejects_bad_storage_info() {
    let dir = TempDir::new().unwrap();
    let mut storage = StorageManager::open(dir.path(), DIMS).unwrap();
    let index = OnDiskHnswIndex::create(&mut storage, config()).unwrap();
    let info = *index.storage_info();

    let missing_table = HnswStorageInfo { lower_rel_table_id: 99, ..info };
    assert!(OnDiskHnswIndex::load(&storage, &missing_table.to_bytes(), config()).is_err());

    let past_end = HnswStorageInfo { num_checkpointed_nodes: 5, ..info };
    assert!(OnDiskHnswIndex::load(&storage, &past_end.to_bytes(), config()).is_err());

    let mut corrupted = info.to_bytes();
    corrupted[0] ^= 0xFF;
    assert!(OnDiskHnswIndex::load(&storage, &corrupted, config()).is_err());
    assert!(OnDiskHnswIndex::load(&storage, &info.to_bytes(), config()).is_ok());
}
