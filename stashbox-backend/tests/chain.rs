mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{ErrorStorage, SlowStorage, TestStorage, accept_request, accept_variant};
use pretty_assertions::assert_eq;
use regex::Regex;
use stashbox_backend::{DeleteStatus, MultiLevelStorage, Storage, StorageChain};
use stashbox_core::{CacheKey, Revalidator};

const BASE: &str = "GET-example.com-/items";
const MINUTE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn partial_failure_names_the_failing_storage() {
    let healthy = TestStorage::named("MEMORY");
    let chain = StorageChain::new(vec![Arc::new(healthy.clone()), Arc::new(ErrorStorage)]);

    let write = accept_variant(BASE, "text/html", "html", MINUTE, MINUTE, Utc::now());
    let report = chain.store(&write).await;

    assert!(report.is_stored(), "one healthy storage is enough");
    assert_eq!(report.stored, vec!["MEMORY"]);
    assert_eq!(report.failed, vec!["FAILING"]);
    assert!(healthy.has(&write.real_key));
}

#[tokio::test]
async fn total_failure_is_not_stored() {
    let chain = StorageChain::new(vec![Arc::new(ErrorStorage)]);
    let write = accept_variant(BASE, "text/html", "html", MINUTE, MINUTE, Utc::now());
    let report = chain.store(&write).await;
    assert!(!report.is_stored());
}

#[tokio::test]
async fn lookup_returns_the_first_storage_with_an_entry() {
    let l1 = TestStorage::named("L1");
    let l2 = TestStorage::named("L2");
    l2.set_multi_level(&accept_variant(BASE, "text/html", "from-l2", MINUTE, MINUTE, Utc::now()))
        .await
        .unwrap();
    let chain = StorageChain::new(vec![Arc::new(ErrorStorage), Arc::new(l1), Arc::new(l2)]);

    let request = accept_request("text/html");
    let mut revalidator = Revalidator::from_request(&request);
    let lookup = chain
        .lookup(&CacheKey::from(BASE), &request, &mut revalidator, Utc::now())
        .await;
    let fresh = lookup.fresh.expect("entry from L2 expected");
    assert_eq!(fresh.storage, "L2", "failing and empty storages are skipped");
    assert_eq!(fresh.response.body().as_ref(), b"from-l2");
}

#[tokio::test]
async fn slow_storage_counts_as_a_miss() {
    let slow = SlowStorage {
        inner: TestStorage::named("SLOW-INNER"),
        delay: Duration::from_secs(5),
    };
    slow.inner
        .set_multi_level(&accept_variant(BASE, "text/html", "slow", MINUTE, MINUTE, Utc::now()))
        .await
        .unwrap();
    let fast = TestStorage::named("FAST");
    fast.set_multi_level(&accept_variant(BASE, "text/html", "fast", MINUTE, MINUTE, Utc::now()))
        .await
        .unwrap();
    let chain = StorageChain::new(vec![Arc::new(slow), Arc::new(fast)])
        .with_read_timeout(Duration::from_millis(50));

    let started = Instant::now();
    let request = accept_request("text/html");
    let mut revalidator = Revalidator::from_request(&request);
    let lookup = chain
        .lookup(&CacheKey::from(BASE), &request, &mut revalidator, Utc::now())
        .await;

    assert!(started.elapsed() < Duration::from_secs(2), "read timeout not applied");
    assert_eq!(lookup.fresh.unwrap().storage, "FAST");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_variant_writes_all_land_in_the_mapping() {
    let storage = TestStorage::new();
    let chain = StorageChain::new(vec![Arc::new(storage.clone())]);

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let chain = chain.clone();
            tokio::spawn(async move {
                let accept = format!("application/v{i}");
                let write = accept_variant(BASE, &accept, "body", MINUTE, MINUTE, Utc::now());
                chain.store(&write).await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_stored());
    }

    let mapping = storage
        .get_mapping(&CacheKey::from(BASE))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        mapping.variants().len(),
        16,
        "mapping updates must not be lost under concurrency"
    );
}

#[tokio::test]
async fn delete_and_listing_span_every_storage() {
    let a = TestStorage::named("A");
    let b = TestStorage::named("B");
    a.set("GET-example.com-/one", "1".into(), MINUTE).await.unwrap();
    b.set("GET-example.com-/one", "1".into(), MINUTE).await.unwrap();
    b.set("GET-example.com-/two", "2".into(), MINUTE).await.unwrap();
    let chain = StorageChain::new(vec![Arc::new(a.clone()), Arc::new(b.clone())]);

    assert_eq!(
        chain.list_keys().await,
        vec!["GET-example.com-/one".to_owned(), "GET-example.com-/two".to_owned()]
    );
    assert_eq!(chain.get("GET-example.com-/two").await.as_deref(), Some(&b"2"[..]));

    let status = chain.delete("GET-example.com-/one").await;
    assert_eq!(status, DeleteStatus::Deleted(2));

    let status = chain.delete_many(&Regex::new("/tw").unwrap()).await;
    assert_eq!(status, DeleteStatus::Deleted(1));
    assert!(chain.list_keys().await.is_empty());
}

#[tokio::test]
async fn reset_reports_failures_after_trying_all() {
    let healthy = TestStorage::new();
    healthy.set("key", "value".into(), MINUTE).await.unwrap();
    let chain = StorageChain::new(vec![Arc::new(ErrorStorage), Arc::new(healthy.clone())]);

    assert!(chain.reset().await.is_err());
    assert_eq!(healthy.len(), 0, "healthy storage must still be reset");
}

#[tokio::test]
async fn invalidate_marks_stale_and_purge_deletes() {
    let storage = TestStorage::named("MEMORY");
    let chain = StorageChain::new(vec![Arc::new(storage.clone())]);
    let write = accept_variant(BASE, "text/html", "html", MINUTE, MINUTE, Utc::now());
    chain.store(&write).await;
    let base = CacheKey::from(BASE);
    let request = accept_request("text/html");

    assert_eq!(chain.invalidate(&base, false, Utc::now()).await, 1);
    let mut revalidator = Revalidator::from_request(&request);
    let lookup = chain.lookup(&base, &request, &mut revalidator, Utc::now()).await;
    assert!(lookup.fresh.is_none(), "invalidated variant is no longer fresh");
    assert!(lookup.stale.is_some(), "invalidated variant stays as a stale fallback");

    assert_eq!(chain.invalidate(&base, true, Utc::now()).await, 1);
    assert!(!storage.has(&write.real_key), "purge deletes the blob");
    assert!(!storage.has(&base.mapping_key()), "purge deletes the mapping");
}
