//! Integration tests for transaction scopes.
//!
//! Each test opens a fresh SQLite file in a temporary directory.
//!
//! Run with: cargo test -p ouroboros-sqlkv --test test_scope

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ouroboros_sqlkv::{
    CancellationToken, KvError, KvStore, RetryConfig, ScopeOptions, StoreConfig, Value,
};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Helper to open a store backed by a file in `dir`
async fn open_store(dir: &TempDir) -> Result<KvStore, KvError> {
    KvStore::open(dir.path().join("kv.db"), StoreConfig::default()).await
}

/// Helper to hold the write lock of `path` until `release` fires
async fn hold_write_lock(
    path: std::path::PathBuf,
    release: tokio::sync::oneshot::Receiver<()>,
) -> Result<tokio::task::JoinHandle<Result<(), KvError>>, Box<dyn std::error::Error>> {
    let writer = KvStore::open(&path, StoreConfig::default()).await?;
    let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
    let holder = tokio::spawn(async move {
        let mut tx = writer.begin().await?;
        tx.string("holder").set("1").await?;
        let _ = locked_tx.send(());
        let _ = release.await;
        tx.commit().await
    });
    locked_rx.await?;
    Ok(holder)
}

/// Helper to check registration from a separate scope
async fn key_exists(store: &KvStore, key: &'static str) -> Result<bool, KvError> {
    store
        .run_scoped(move |tx| Box::pin(async move { tx.exists(key).await }))
        .await
}

// =============================================================================
// Commit/Rollback Tests
// =============================================================================

#[tokio::test]
async fn test_commit_visible_in_later_scope() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    store
        .run_scoped(|tx| Box::pin(async move { tx.string("aaa").set("hello").await }))
        .await?;

    let value = store
        .run_scoped(|tx| Box::pin(async move { tx.string("aaa").get().await }))
        .await?;
    assert_eq!(value, Value::from("hello"));
    Ok(())
}

#[tokio::test]
async fn test_commit_survives_reopen() -> TestResult {
    let dir = TempDir::new()?;
    {
        let store = open_store(&dir).await?;
        store
            .run_scoped(|tx| {
                Box::pin(async move {
                    tx.string("s").set("persisted").await?;
                    tx.hash("h").set("f", 1i64).await?;
                    Ok::<_, KvError>(())
                })
            })
            .await?;
        store.close().await;
    }

    let store = open_store(&dir).await?;
    let (s, f) = store
        .run_scoped(|tx| {
            Box::pin(async move {
                let s = tx.string("s").get().await?;
                let f = tx.hash("h").get("f").await?;
                Ok::<_, KvError>((s, f))
            })
        })
        .await?;
    assert_eq!(s.as_str()?, "persisted");
    assert_eq!(f.as_i64()?, 1);
    Ok(())
}

#[tokio::test]
async fn test_error_rolls_back_every_write() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let err = store
        .run_scoped(|tx| {
            Box::pin(async move {
                tx.string("a").set("1").await?;
                tx.hash("b").set("f", "2").await?;
                tx.string("b").set("boom").await?;
                Ok::<_, KvError>(())
            })
        })
        .await
        .unwrap_err();
    assert!(err.is_kind_mismatch());

    assert!(!key_exists(&store, "a").await?);
    assert!(!key_exists(&store, "b").await?);
    Ok(())
}

#[tokio::test]
async fn test_work_error_is_returned_unchanged() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let err = store
        .run_scoped(|tx| {
            Box::pin(async move {
                tx.string("n").set("not a number").await?;
                tx.string("n").incr(1).await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::Decode { .. }));
    assert!(!key_exists(&store, "n").await?);
    Ok(())
}

#[tokio::test]
async fn test_panic_rolls_back_and_reports() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let err = store
        .run_scoped(|tx| {
            Box::pin(async move {
                tx.string("p").set("written before panic").await?;
                if tx.exists("p").await? {
                    panic!("fatal condition in scope");
                }
                Ok::<_, KvError>(())
            })
        })
        .await
        .unwrap_err();

    match err {
        KvError::Panicked(message) => assert!(message.contains("fatal condition")),
        other => panic!("expected Panicked, got {other}"),
    }
    assert!(!key_exists(&store, "p").await?);

    // the store is still usable
    store
        .run_scoped(|tx| Box::pin(async move { tx.string("p").set("ok").await }))
        .await?;
    assert!(key_exists(&store, "p").await?);
    Ok(())
}

#[tokio::test]
async fn test_panic_while_building_work_rolls_back() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let err = store
        .run_scoped(|tx| {
            let missing: Option<&str> = None;
            let key = missing.expect("no key to write");
            Box::pin(async move { tx.string(key).set("never").await })
        })
        .await
        .unwrap_err();
    match err {
        KvError::Panicked(message) => assert_eq!(message, "no key to write"),
        other => panic!("expected Panicked, got {other}"),
    }

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let err = store
        .retry_scoped(&RetryConfig::default(), move |tx| {
            counter.fetch_add(1, Ordering::SeqCst);
            let limit: Vec<i64> = Vec::new();
            let amount = limit[0];
            Box::pin(async move { tx.string("n").incr(amount).await })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::Panicked(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // the store is still usable
    store
        .run_scoped(|tx| Box::pin(async move { tx.string("after").set("ok").await }))
        .await?;
    assert!(key_exists(&store, "after").await?);
    Ok(())
}

// =============================================================================
// Deadline/Cancellation Tests
// =============================================================================

#[tokio::test]
async fn test_cancel_while_waiting_for_write_lock() -> TestResult {
    let dir = TempDir::new()?;
    let path = dir.path().join("kv.db");
    let store = KvStore::open(&path, StoreConfig::default()).await?;

    let (release_tx, release_rx) = tokio::sync::oneshot::channel();
    let holder = hold_write_lock(path.clone(), release_rx).await?;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = store
        .run_scoped_with(ScopeOptions::new().cancel_on(token), |tx| {
            Box::pin(async move { tx.string("blocked").set("2").await })
        })
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, KvError::Cancelled), "{err}");
    assert!(elapsed < Duration::from_secs(1), "cancel took {elapsed:?}");

    let _ = release_tx.send(());
    holder.await??;
    assert!(!key_exists(&store, "blocked").await?);
    assert!(key_exists(&store, "holder").await?);
    Ok(())
}

#[tokio::test]
async fn test_deadline_while_waiting_for_write_lock() -> TestResult {
    let dir = TempDir::new()?;
    let path = dir.path().join("kv.db");
    let store = KvStore::open(&path, StoreConfig::default()).await?;

    let (release_tx, release_rx) = tokio::sync::oneshot::channel();
    let holder = hold_write_lock(path.clone(), release_rx).await?;

    let started = Instant::now();
    let err = store
        .run_scoped_with(ScopeOptions::new().deadline(Duration::from_millis(100)), |tx| {
            Box::pin(async move { tx.hash("blocked").set("f", "v").await })
        })
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, KvError::DeadlineExceeded(_)), "{err}");
    assert!(elapsed < Duration::from_secs(1), "deadline took {elapsed:?}");

    let _ = release_tx.send(());
    holder.await??;

    // the store recovers once the lock is gone
    store
        .run_scoped(|tx| Box::pin(async move { tx.hash("blocked").set("f", "v").await }))
        .await?;
    assert!(key_exists(&store, "blocked").await?);
    Ok(())
}

#[tokio::test]
async fn test_deadline_rolls_back() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let options = ScopeOptions::new().deadline(Duration::from_millis(50));
    let err = store
        .run_scoped_with(options, |tx| {
            Box::pin(async move {
                tx.string("slow").set("partial").await?;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, KvError>(())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, KvError::DeadlineExceeded(_)));
    assert!(!key_exists(&store, "slow").await?);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_rolls_back() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let options = ScopeOptions::new().cancel_on(token);
    let err = store
        .run_scoped_with(options, |tx| {
            Box::pin(async move {
                tx.hash("h").set("f", "v").await?;
                std::future::pending::<()>().await;
                Ok::<_, KvError>(())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, KvError::Cancelled));
    assert!(!key_exists(&store, "h").await?);
    Ok(())
}

#[tokio::test]
async fn test_options_without_triggers_commit() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let options = ScopeOptions::new()
        .deadline(Duration::from_secs(30))
        .cancel_on(CancellationToken::new());
    let n = store
        .run_scoped_with(options, |tx| Box::pin(async move { tx.string("c").incr(3).await }))
        .await?;
    assert_eq!(n, 3);
    assert!(key_exists(&store, "c").await?);
    Ok(())
}

// =============================================================================
// Writer Serialization Tests
// =============================================================================

#[tokio::test]
async fn test_concurrent_scopes_wait_for_each_other() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let incr = |store: KvStore| async move {
        store
            .run_scoped(|tx| {
                Box::pin(async move {
                    let n = tx.string("counter").incr(1).await?;
                    // keep the write lock while the other scope tries to start
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, KvError>(n)
                })
            })
            .await
    };

    let (a, b) = tokio::join!(
        tokio::spawn(incr(store.clone())),
        tokio::spawn(incr(store.clone()))
    );
    let mut seen = vec![a??, b??];
    seen.sort();
    assert_eq!(seen, vec![1, 2]);

    let total = store
        .run_scoped(|tx| Box::pin(async move { tx.string("counter").get().await }))
        .await?;
    assert_eq!(total.as_i64()?, 2);
    Ok(())
}

#[tokio::test]
async fn test_write_waits_for_other_store_within_busy_timeout() -> TestResult {
    let dir = TempDir::new()?;
    let path = dir.path().join("kv.db");
    let store = KvStore::open(&path, StoreConfig::default()).await?;

    let (release_tx, release_rx) = tokio::sync::oneshot::channel();
    let holder = hold_write_lock(path.clone(), release_rx).await?;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = release_tx.send(());
    });

    let started = Instant::now();
    store
        .run_scoped(|tx| Box::pin(async move { tx.string("waiting").set("2").await }))
        .await?;
    assert!(started.elapsed() >= Duration::from_millis(100));

    holder.await??;
    assert!(key_exists(&store, "waiting").await?);
    Ok(())
}

// =============================================================================
// Retry Tests
// =============================================================================

#[tokio::test]
async fn test_retry_does_not_repeat_non_retryable_errors() -> TestResult {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let err = store
        .retry_scoped(&RetryConfig::default(), move |tx| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.string("x").set("text").await?;
                tx.string("x").incr(1).await
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, KvError::Decode { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_retry_waits_out_a_busy_writer() -> TestResult {
    let dir = TempDir::new()?;
    let path = dir.path().join("kv.db");
    let writer = KvStore::open(&path, StoreConfig::default()).await?;
    let impatient = KvStore::open(
        &path,
        StoreConfig {
            busy_timeout_ms: 0,
            ..Default::default()
        },
    )
    .await?;

    // hold the write lock for a while
    let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
    let holder = tokio::spawn(async move {
        let mut tx = writer.begin().await?;
        tx.string("holder").set("1").await?;
        let _ = locked_tx.send(());
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.commit().await
    });
    locked_rx.await?;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let retry = RetryConfig {
        max_retries: 50,
        initial_delay_ms: 20,
        max_delay_ms: 50,
        backoff_multiplier: 1.5,
    };
    let n = impatient
        .retry_scoped(&retry, move |tx| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.string("counter").incr(1).await
            })
        })
        .await?;

    holder.await??;
    assert_eq!(n, 1);
    assert!(attempts.load(Ordering::SeqCst) > 1);
    Ok(())
}

#[tokio::test]
async fn test_busy_error_without_retry_is_retryable() -> TestResult {
    let dir = TempDir::new()?;
    let path = dir.path().join("kv.db");
    let writer = KvStore::open(&path, StoreConfig::default()).await?;
    let impatient = KvStore::open(
        &path,
        StoreConfig {
            busy_timeout_ms: 0,
            ..Default::default()
        },
    )
    .await?;

    let mut held = writer.begin().await?;
    held.string("holder").set("1").await?;

    let err = impatient
        .run_scoped(|tx| Box::pin(async move { tx.string("other").set("2").await }))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{err}");

    held.rollback().await?;
    Ok(())
}
