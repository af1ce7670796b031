//! Integration tests for cache budget, eviction and restart behavior.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{fast_fetcher, image, TestNode};
use layercast_node_agent::cache::{CacheConfig, CacheError, CacheStore, EntryState};
use layercast_node_agent::fetcher::FetchError;
use layercast_node_agent::image::Digest;
use layercast_node_agent::registry::MockRegistry;
use layercast_reconcile::JobState;
use proptest::prelude::*;

#[tokio::test]
async fn test_admission_evicts_idle_layers() {
    let registry = Arc::new(MockRegistry::new());
    let old = registry
        .add_image("registry.local/old:v1", &[vec![1u8; 60]])
        .unwrap();
    let new = registry
        .add_image("registry.local/new:v1", &[vec![2u8; 60]])
        .unwrap();
    let node = TestNode::start(registry.clone(), 100, fast_fetcher(1)).await;

    let first = node
        .coordinator
        .reconcile(vec![image("registry.local/old:v1")])
        .await
        .unwrap()
        .wait()
        .await;
    assert_eq!(first.state, JobState::Ready);

    let second = node
        .coordinator
        .reconcile(vec![image("registry.local/new:v1")])
        .await
        .unwrap()
        .wait()
        .await;
    assert_eq!(second.state, JobState::Ready);

    assert!(node.cache.lookup(&old[0].digest).is_none());
    assert_eq!(
        node.cache.lookup(&new[0].digest).map(|e| e.state),
        Some(EntryState::Ready)
    );
    let stats = node.cache.stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.evicted_bytes, 60);
    assert!(node.cache.usage().stored_bytes <= 100);
}

#[tokio::test]
async fn test_layer_larger_than_budget_fails_immediately() {
    let registry = Arc::new(MockRegistry::new());
    let layers = registry
        .add_image("registry.local/huge:v1", &[vec![0u8; 150]])
        .unwrap();
    let node = TestNode::start(registry.clone(), 100, fast_fetcher(1)).await;

    let started = Instant::now();
    let status = node
        .coordinator
        .reconcile(vec![image("registry.local/huge:v1")])
        .await
        .unwrap()
        .wait()
        .await;

    assert_eq!(status.state, JobState::Failed);
    assert!(status.failed_layers[0].error.contains("insufficient cache space"));
    assert!(status.failed_layers[0].retryable);
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(registry.blob_fetch_count(&layers[0].digest), 0);
}

#[tokio::test]
async fn test_pinned_layers_block_admission_until_bounded_wait() {
    let registry = Arc::new(MockRegistry::new());
    let pinned = registry
        .add_image("registry.local/pinned:v1", &[vec![1u8; 80]])
        .unwrap();
    let blocked = registry
        .add_image("registry.local/blocked:v1", &[vec![2u8; 80]])
        .unwrap();
    let node = TestNode::start(registry.clone(), 100, fast_fetcher(1)).await;

    let outcome = node
        .pool
        .fetch(image("registry.local/pinned:v1"), pinned[0].clone())
        .await
        .unwrap();

    let started = Instant::now();
    let err = node
        .pool
        .fetch(image("registry.local/blocked:v1"), blocked[0].clone())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InsufficientCacheSpace { .. }));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(node.metrics.snapshot(&node.cache).admission_waits, 1);

    // Releasing the pin lets the next attempt evict it.
    node.cache.release(outcome.handle);
    let outcome = node
        .pool
        .fetch(image("registry.local/blocked:v1"), blocked[0].clone())
        .await
        .unwrap();
    assert_eq!(outcome.size(), 80);
    assert!(node.cache.lookup(&pinned[0].digest).is_none());
}

#[tokio::test]
async fn test_admission_waits_for_pin_release() {
    let registry = Arc::new(MockRegistry::new());
    let pinned = registry
        .add_image("registry.local/pinned:v1", &[vec![1u8; 80]])
        .unwrap();
    let waiting = registry
        .add_image("registry.local/waiting:v1", &[vec![2u8; 80]])
        .unwrap();
    let mut fetcher = fast_fetcher(1);
    fetcher.admission_wait = Duration::from_secs(5);
    let node = TestNode::start(registry.clone(), 100, fetcher).await;

    let outcome = node
        .pool
        .fetch(image("registry.local/pinned:v1"), pinned[0].clone())
        .await
        .unwrap();

    let pool = node.pool.clone();
    let layer = waiting[0].clone();
    let fetch = tokio::spawn(async move {
        pool.fetch(image("registry.local/waiting:v1"), layer).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fetch.is_finished());

    drop(outcome);
    let outcome = fetch.await.unwrap().unwrap();
    assert_eq!(outcome.digest(), &waiting[0].digest);
}

#[tokio::test]
async fn test_restart_keeps_verified_layers() {
    let registry = Arc::new(MockRegistry::new());
    let layers = registry
        .add_image("registry.local/app:v1", &[b"first".as_slice(), b"second".as_slice()])
        .unwrap();
    let node = TestNode::start(registry.clone(), 1 << 20, fast_fetcher(2)).await;
    let status = node
        .coordinator
        .reconcile(vec![image("registry.local/app:v1")])
        .await
        .unwrap()
        .wait()
        .await;
    assert_eq!(status.state, JobState::Ready);
    let dir = node.stop().await;

    // A registry with the manifest but no blobs: everything must come from disk.
    let empty = Arc::new(MockRegistry::new());
    empty.set_manifest(&image("registry.local/app:v1"), layers.clone());
    let node = TestNode::start_in(dir, empty.clone(), 1 << 20, fast_fetcher(2)).await;

    for layer in &layers {
        assert_eq!(
            node.cache.lookup(&layer.digest).map(|e| e.state),
            Some(EntryState::Ready)
        );
    }
    let status = node
        .coordinator
        .reconcile(vec![image("registry.local/app:v1")])
        .await
        .unwrap()
        .wait()
        .await;
    assert_eq!(status.state, JobState::Ready);
    assert_eq!(status.cache_hits, 2);
    assert_eq!(empty.total_blob_fetches(), 0);
}

async fn store_blob(store: &CacheStore, bytes: &[u8]) -> Digest {
    let digest = Digest::sha256_of(bytes);
    let mut writer = store.begin_write(&digest, bytes.len() as u64).await.unwrap();
    writer.write_chunk(bytes).await.unwrap();
    drop(store.commit(writer).await.unwrap());
    digest
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn evict_respects_budget_and_pins(
        sizes in prop::collection::vec(1usize..64, 1..12),
        pins in prop::collection::vec(any::<bool>(), 12),
        target in 0u64..400,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = CacheStore::open(CacheConfig {
                root: dir.path().to_path_buf(),
                budget_bytes: 1 << 20,
                ..Default::default()
            })
            .await
            .unwrap();

            let mut digests = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                let mut bytes = vec![i as u8; *size];
                bytes.extend_from_slice(&(i as u64).to_le_bytes());
                digests.push(store_blob(&store, &bytes).await);
            }
            let handles: Vec<_> = digests
                .iter()
                .zip(&pins)
                .filter(|(_, pin)| **pin)
                .filter_map(|(d, _)| store.acquire(d))
                .collect();
            let pinned_bytes: u64 = handles.iter().map(|h| h.size()).sum();

            let result = store.evict(target).await;
            let usage = store.usage();
            match result {
                Ok(report) => {
                    prop_assert!(usage.stored_bytes <= target);
                    prop_assert_eq!(report.remaining_bytes, usage.stored_bytes);
                }
                Err(CacheError::BudgetExceeded { .. }) => {
                    prop_assert!(pinned_bytes > target);
                    prop_assert_eq!(usage.stored_bytes, pinned_bytes);
                }
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
            for handle in &handles {
                let entry = store.lookup(handle.digest());
                prop_assert_eq!(entry.map(|e| e.state), Some(EntryState::Ready));
                prop_assert!(handle.path().exists());
            }
            Ok(())
        })?;
    }
}
