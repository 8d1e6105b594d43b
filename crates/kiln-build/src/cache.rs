//! Content-addressed bundle cache with in-process single-flight builds.
//!
//! `get_or_build` is the only way the core compiles. Lookup order: the
//! fingerprint key family of the bundle store, then the in-process inflight
//! map. Concurrent callers with the same fingerprint share one build and
//! all observe the same outcome, success or error. Build errors are never
//! cached; store write failures are logged and swallowed — the caller
//! still receives the built bundle.
//!
//! Coalescing uses the entry API of a `DashMap` plus a broadcast channel
//! per fingerprint, so registration is an atomic check-and-insert and the
//! map is never held across an await. If a building task is dropped before
//! broadcasting, the channel closes and waiters retry from the top.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use kiln_core::{Bundle, FileMap, Result};
use kiln_store::BundleStore;

use crate::bundler::{BuildOptions, Bundler};
use crate::fingerprint::fingerprint;

/// Expiry applied to fingerprint-keyed cache writes.
pub const DEFAULT_EPHEMERAL_TTL: Duration = Duration::from_secs(3600);

/// A bundle plus its cache provenance.
#[derive(Debug, Clone)]
pub struct BuiltBundle {
    pub bundle: Bundle,
    pub fingerprint: String,
    /// True when the bundle came from the store rather than a fresh build.
    pub cached: bool,
    /// Advisory bundler diagnostics (empty on cache hits).
    pub warnings: Vec<String>,
}

enum Flight {
    /// Another caller is building this fingerprint; wait for its outcome.
    Wait(broadcast::Receiver<Result<BuiltBundle>>),
    /// This caller owns the build.
    Build,
}

/// Fingerprint-keyed cache over a [`BundleStore`].
pub struct BundleCache {
    store: Arc<dyn BundleStore>,
    bundler: Arc<dyn Bundler>,
    inflight: DashMap<String, broadcast::Sender<Result<BuiltBundle>>>,
    ephemeral_ttl: Duration,
}

impl BundleCache {
    pub fn new(store: Arc<dyn BundleStore>, bundler: Arc<dyn Bundler>) -> Self {
        Self::with_ttl(store, bundler, DEFAULT_EPHEMERAL_TTL)
    }

    pub fn with_ttl(
        store: Arc<dyn BundleStore>,
        bundler: Arc<dyn Bundler>,
        ephemeral_ttl: Duration,
    ) -> Self {
        Self {
            store,
            bundler,
            inflight: DashMap::new(),
            ephemeral_ttl,
        }
    }

    /// Number of builds currently in flight (for observability and tests).
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Fetch the bundle for `(files, options)`, building at most once per
    /// fingerprint within this process.
    pub async fn get_or_build(&self, files: &FileMap, options: &BuildOptions) -> Result<BuiltBundle> {
        let fp = fingerprint(files, options);
        loop {
            if let Some(bundle) = self.store.get_fingerprint(&fp).await? {
                debug!(fingerprint = %fp, "bundle cache hit");
                return Ok(BuiltBundle {
                    bundle,
                    fingerprint: fp,
                    cached: true,
                    warnings: Vec::new(),
                });
            }

            // Atomic check-and-insert; the entry guard never crosses an await.
            let flight = match self.inflight.entry(fp.clone()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    Flight::Wait(entry.get().subscribe())
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    let (tx, _rx) = broadcast::channel(1);
                    entry.insert(tx);
                    Flight::Build
                }
            };

            match flight {
                Flight::Wait(mut rx) => {
                    debug!(fingerprint = %fp, "joining in-flight build");
                    match rx.recv().await {
                        Ok(outcome) => return outcome,
                        // The builder was dropped before broadcasting; retry.
                        Err(_) => continue,
                    }
                }
                Flight::Build => {
                    let guard = InflightGuard {
                        inflight: &self.inflight,
                        key: fp.clone(),
                        armed: true,
                    };
                    let outcome = self.build_and_store(files, options, &fp).await;
                    self.finish(guard, &fp, outcome.clone());
                    return outcome;
                }
            }
        }
    }

    /// Remove the inflight entry and broadcast the outcome to waiters.
    fn finish(&self, mut guard: InflightGuard<'_>, fp: &str, outcome: Result<BuiltBundle>) {
        guard.armed = false;
        if let Some((_, tx)) = self.inflight.remove(fp) {
            let _ = tx.send(outcome);
        }
    }

    async fn build_and_store(
        &self,
        files: &FileMap,
        options: &BuildOptions,
        fp: &str,
    ) -> Result<BuiltBundle> {
        let output = self.bundler.build(files, options).await?;
        let bundle = Bundle {
            main_module: output.main_module,
            modules: output.modules,
            version: 0,
            built_at: Utc::now(),
        };
        if let Err(e) = self
            .store
            .put_fingerprint(fp, &bundle, Some(self.ephemeral_ttl))
            .await
        {
            // The caller still gets the bundle it asked for.
            warn!(fingerprint = %fp, error = %e, "bundle cache write failed");
        }
        debug!(fingerprint = %fp, modules = bundle.modules.len(), "bundle built");
        Ok(BuiltBundle {
            bundle,
            fingerprint: fp.to_string(),
            cached: false,
            warnings: output.warnings,
        })
    }
}

/// Drops the inflight entry if the building future is abandoned, closing
/// the channel so waiters retry instead of hanging.
struct InflightGuard<'a> {
    inflight: &'a DashMap<String, broadcast::Sender<Result<BuiltBundle>>>,
    key: String,
    armed: bool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::future::join_all;
    use kiln_core::Error;
    use kiln_store::MemoryStores;

    use crate::bundler::{BuildOutput, FlatBundler};

    fn source(marker: &str) -> FileMap {
        BTreeMap::from([
            (
                "src/index.ts".to_string(),
                format!("export default {{ fetch() {{ return '{marker}' }} }}"),
            ),
            (
                "package.json".to_string(),
                r#"{"main":"src/index.ts"}"#.to_string(),
            ),
        ])
    }

    /// Counts builds and holds each one open long enough to coalesce.
    struct CountingBundler {
        builds: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingBundler {
        fn new(delay: Duration) -> Self {
            Self {
                builds: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                builds: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Bundler for CountingBundler {
        async fn build(&self, files: &FileMap, options: &BuildOptions) -> Result<BuildOutput> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::build("synthetic failure"));
            }
            FlatBundler.build(files, options).await
        }
    }

    fn cache_with(bundler: Arc<CountingBundler>) -> BundleCache {
        BundleCache::new(Arc::new(MemoryStores::new()), bundler)
    }

    #[tokio::test]
    async fn miss_builds_then_hit_reads_through() {
        let bundler = Arc::new(CountingBundler::new(Duration::from_millis(0)));
        let cache = cache_with(Arc::clone(&bundler));
        let files = source("hi");

        let first = cache.get_or_build(&files, &BuildOptions::default()).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.bundle.main_module, "src/index.ts");

        let second = cache.get_or_build(&files, &BuildOptions::default()).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.bundle.modules, first.bundle.modules);
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_build() {
        let bundler = Arc::new(CountingBundler::new(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(Arc::clone(&bundler)));
        let files = source("hi");

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let files = files.clone();
                tokio::spawn(async move {
                    cache.get_or_build(&files, &BuildOptions::default()).await
                })
            })
            .collect();

        let results: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(bundler.builds.load(Ordering::SeqCst), 1);
        let reference = &results[0].bundle;
        for built in &results {
            assert_eq!(&built.bundle.modules, &reference.modules);
            assert_eq!(built.fingerprint, results[0].fingerprint);
        }
        assert_eq!(cache.inflight_count(), 0);
    }

    #[tokio::test]
    async fn distinct_fingerprints_build_independently() {
        let bundler = Arc::new(CountingBundler::new(Duration::from_millis(10)));
        let cache = Arc::new(cache_with(Arc::clone(&bundler)));

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache.get_or_build(&source("a"), &BuildOptions::default()).await
            })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache.get_or_build(&source("b"), &BuildOptions::default()).await
            })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn build_errors_are_shared_but_never_cached() {
        let bundler = Arc::new(CountingBundler::failing());
        let cache = Arc::new(cache_with(Arc::clone(&bundler)));
        let files = source("hi");

        let err = cache
            .get_or_build(&files, &BuildOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), kiln_core::ErrorKind::Build);

        // The failure was not written under the fingerprint; a retry rebuilds.
        let err = cache
            .get_or_build(&files, &BuildOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), kiln_core::ErrorKind::Build);
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache.inflight_count(), 0);
    }

    #[tokio::test]
    async fn options_separate_cache_entries() {
        let bundler = Arc::new(CountingBundler::new(Duration::from_millis(0)));
        let cache = cache_with(Arc::clone(&bundler));
        let files = source("hi");

        cache.get_or_build(&files, &BuildOptions::default()).await.unwrap();
        let minified = BuildOptions {
            minify: true,
            ..BuildOptions::default()
        };
        let rebuilt = cache.get_or_build(&files, &minified).await.unwrap();
        assert!(!rebuilt.cached);
        assert_eq!(bundler.builds.load(Ordering::SeqCst), 2);
    }
}
