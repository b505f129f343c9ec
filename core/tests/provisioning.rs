use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lexis_core::config::{AssetDescriptor, ProvisionConfig};
use lexis_core::locator::{AssetSource, SourceLocator};
use lexis_core::provision::SingleFlight;
use lexis_core::{ProvisionResult, Provisioner, ProvisioningError};
use tempfile::TempDir;

const NAME: &str = "ejdict.sqlite3";

fn asset_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"SQLite format 3\0".to_vec();
    bytes.resize(len, 0x5A);
    bytes
}

#[derive(Clone, Copy)]
enum Behaviour {
    Healthy,
    /// Writes the first half of the asset, then fails like an interrupted copy.
    Truncated,
    /// Produces a full-size file with a foreign header.
    Foreign,
    /// Leaves a non-empty directory where the file belongs, then fails.
    LeavesDirectory,
}

struct CountingSource {
    bytes: Vec<u8>,
    behaviour: Behaviour,
    delay: Duration,
    fetches: AtomicUsize,
}

impl CountingSource {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            bytes: asset_bytes(4096),
            behaviour,
            delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        })
    }

    fn slow(behaviour: Behaviour, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            bytes: asset_bytes(4096),
            behaviour,
            delay,
            fetches: AtomicUsize::new(0),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetSource for CountingSource {
    async fn fetch_into(&self, dest: &Path) -> ProvisionResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        assert!(!dest.exists(), "copy must start from a clean destination");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.behaviour {
            Behaviour::Healthy => std::fs::write(dest, &self.bytes).unwrap(),
            Behaviour::Foreign => std::fs::write(dest, vec![b'#'; self.bytes.len()]).unwrap(),
            Behaviour::Truncated => {
                std::fs::write(dest, &self.bytes[..self.bytes.len() / 2]).unwrap();
                return Err(ProvisioningError::SourceUnavailable {
                    name: NAME.to_string(),
                    source: Some(Arc::new(std::io::Error::other("device went away"))),
                });
            }
            Behaviour::LeavesDirectory => {
                std::fs::create_dir(dest).unwrap();
                std::fs::write(dest.join("stray"), b"x").unwrap();
                return Err(ProvisioningError::SourceUnavailable { name: NAME.to_string(), source: None });
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "counting".to_string()
    }
}

fn config() -> ProvisionConfig {
    ProvisionConfig {
        asset: AssetDescriptor {
            minimum_valid_size_bytes: 100,
            minimum_copy_size_bytes: 1024,
            ..AssetDescriptor::default()
        },
        ..ProvisionConfig::default()
    }
}

fn provisioner(dir: &Path, source: Arc<CountingSource>) -> Provisioner {
    Provisioner::builder(config())
        .locator(SourceLocator::new(dir, source))
        .bundle_version(5)
        .build()
        .unwrap()
}

fn marker(dir: &Path) -> Option<String> {
    std::fs::read_to_string(dir.join(".version")).ok()
}

fn dest(dir: &Path) -> PathBuf {
    dir.join(NAME)
}

#[tokio::test]
async fn fresh_install_then_second_call_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let source = CountingSource::new(Behaviour::Healthy);
    let prov = provisioner(dir.path(), source.clone());

    prov.ensure_ready().await.unwrap();
    assert_eq!(source.fetches(), 1);
    assert_eq!(marker(dir.path()).as_deref(), Some("5"));

    prov.ensure_ready().await.unwrap();
    assert_eq!(source.fetches(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_a_single_copy() {
    let dir = TempDir::new().unwrap();
    let source = CountingSource::slow(Behaviour::Healthy, Duration::from_millis(150));
    let prov = provisioner(dir.path(), source.clone());

    for result in ensure_ready_concurrently(&prov, 16).await {
        result.unwrap();
    }
    assert_eq!(source.fetches(), 1);
    assert!(!prov.status().await.in_flight);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_the_same_failure() {
    let dir = TempDir::new().unwrap();
    let source = CountingSource::slow(Behaviour::Foreign, Duration::from_millis(100));
    let prov = provisioner(dir.path(), source.clone());

    let results = ensure_ready_concurrently(&prov, 6).await;
    assert_eq!(source.fetches(), 1);
    for result in results {
        assert!(matches!(result, Err(ProvisioningError::CorruptAfterCopy { .. })));
    }
}

async fn ensure_ready_concurrently(prov: &Provisioner, n: usize) -> Vec<ProvisionResult<()>> {
    let mut handles = Vec::new();
    for _ in 0..n {
        let prov = prov.clone();
        handles.push(tokio::spawn(async move { prov.ensure_ready().await }));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn independent_coordinators_do_not_share_state() {
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();
    let first = CountingSource::slow(Behaviour::Healthy, Duration::from_millis(50));
    let second = CountingSource::slow(Behaviour::Healthy, Duration::from_millis(50));
    let a = provisioner(first_dir.path(), first.clone());
    let b = provisioner(second_dir.path(), second.clone());

    let (ra, rb) = tokio::join!(a.ensure_ready(), b.ensure_ready());
    ra.unwrap();
    rb.unwrap();
    assert_eq!((first.fetches(), second.fetches()), (1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn injected_flight_serialises_across_coordinators() {
    let dir = TempDir::new().unwrap();
    let source = CountingSource::slow(Behaviour::Healthy, Duration::from_millis(100));
    let flight = SingleFlight::new();
    let build = || {
        Provisioner::builder(config())
            .locator(SourceLocator::new(dir.path(), source.clone()))
            .single_flight(Arc::clone(&flight))
            .bundle_version(5)
            .build()
            .unwrap()
    };
    let (a, b) = (build(), build());

    let (ra, rb) = tokio::join!(a.ensure_ready(), b.ensure_ready());
    ra.unwrap();
    rb.unwrap();
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn older_marker_forces_copy_even_when_file_is_valid() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dest(dir.path()), asset_bytes(4096)).unwrap();
    std::fs::write(dir.path().join(".version"), "4").unwrap();
    let source = CountingSource::new(Behaviour::Healthy);
    let prov = provisioner(dir.path(), source.clone());

    prov.ensure_ready().await.unwrap();
    assert_eq!(source.fetches(), 1);
    assert_eq!(marker(dir.path()).as_deref(), Some("5"));
}

#[tokio::test]
async fn current_marker_and_valid_file_skip_copy() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dest(dir.path()), asset_bytes(4096)).unwrap();
    std::fs::write(dir.path().join(".version"), "5").unwrap();
    let source = CountingSource::new(Behaviour::Healthy);
    let prov = provisioner(dir.path(), source.clone());

    prov.ensure_ready().await.unwrap();
    assert_eq!(source.fetches(), 0);
}

#[tokio::test]
async fn foreign_header_is_replaced_by_one_recopy() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dest(dir.path()), vec![b'#'; 4096]).unwrap();
    std::fs::write(dir.path().join(".version"), "5").unwrap();
    let source = CountingSource::new(Behaviour::Healthy);
    let prov = provisioner(dir.path(), source.clone());

    prov.ensure_ready().await.unwrap();
    assert_eq!(source.fetches(), 1);
    assert_eq!(std::fs::read(dest(dir.path())).unwrap(), asset_bytes(4096));
}

#[tokio::test]
async fn persistently_bad_source_fails_without_looping() {
    let dir = TempDir::new().unwrap();
    let source = CountingSource::new(Behaviour::Foreign);
    let prov = provisioner(dir.path(), source.clone());

    let err = prov.ensure_ready().await.unwrap_err();
    assert!(matches!(err, ProvisioningError::CorruptAfterCopy { .. }));
    assert_eq!(source.fetches(), 1);
    assert!(!dest(dir.path()).exists());
    assert_eq!(marker(dir.path()), None);
}

#[tokio::test]
async fn interrupted_copy_leaves_nothing_behind_and_is_retryable() {
    let dir = TempDir::new().unwrap();
    let source = CountingSource::new(Behaviour::Truncated);
    let prov = provisioner(dir.path(), source.clone());

    let err = prov.ensure_ready().await.unwrap_err();
    assert!(matches!(err, ProvisioningError::SourceUnavailable { .. }));
    assert!(!dest(dir.path()).exists());
    assert_eq!(marker(dir.path()), None);

    // The failed attempt must not wedge the coordinator.
    let err = prov.ensure_ready().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(source.fetches(), 2);
}

#[tokio::test]
async fn recovers_on_next_call_once_source_is_healthy() {
    let dir = TempDir::new().unwrap();
    let broken = provisioner(dir.path(), CountingSource::new(Behaviour::Foreign));
    assert!(broken.ensure_ready().await.is_err());

    let healthy = CountingSource::new(Behaviour::Healthy);
    let prov = provisioner(dir.path(), healthy.clone());
    prov.ensure_ready().await.unwrap();
    assert_eq!(healthy.fetches(), 1);
    assert_eq!(marker(dir.path()).as_deref(), Some("5"));
}

#[tokio::test]
async fn cancelled_waiter_does_not_abort_the_copy() {
    let dir = TempDir::new().unwrap();
    let source = CountingSource::slow(Behaviour::Healthy, Duration::from_millis(100));
    let prov = provisioner(dir.path(), source.clone());

    let timed_out = tokio::time::timeout(Duration::from_millis(10), prov.ensure_ready()).await;
    assert!(timed_out.is_err());

    prov.ensure_ready().await.unwrap();
    assert_eq!(source.fetches(), 1);
    assert_eq!(marker(dir.path()).as_deref(), Some("5"));
}

#[tokio::test]
async fn failed_cleanup_does_not_mask_the_copy_error() {
    let dir = TempDir::new().unwrap();
    let source = CountingSource::new(Behaviour::LeavesDirectory);
    let prov = provisioner(dir.path(), source.clone());

    let err = prov.ensure_ready().await.unwrap_err();
    assert!(matches!(err, ProvisioningError::SourceUnavailable { .. }), "got {err:?}");
    // remove_file cannot delete the directory; that failure is only logged.
    assert!(dest(dir.path()).is_dir());
    assert_eq!(marker(dir.path()), None);
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn unwritable_marker_fails_the_call_and_recopies_next_time() {
    let dir = TempDir::new().unwrap();
    let marker_path = dir.path().join(".version");
    std::fs::create_dir(&marker_path).unwrap();
    std::fs::write(marker_path.join("occupied"), b"x").unwrap();
    let source = CountingSource::new(Behaviour::Healthy);
    let prov = provisioner(dir.path(), source.clone());

    let err = prov.ensure_ready().await.unwrap_err();
    assert!(matches!(err, ProvisioningError::Persistence { .. }), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(source.fetches(), 1);
    assert!(marker_path.is_dir(), "the marker must not be recorded");

    std::fs::remove_dir_all(&marker_path).unwrap();
    prov.ensure_ready().await.unwrap();
    assert_eq!(source.fetches(), 2);
    assert_eq!(marker(dir.path()).as_deref(), Some("5"));
}
