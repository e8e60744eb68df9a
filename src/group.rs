//! Cache groups and the load pipeline.
//!
//! A [`Group`] is a named cache namespace: a byte budget spanning two
//! [`ByteCache`] tiers, an origin [`Getter`], a lazily installed peer picker
//! and a [`Coalescer`] deduplicating concurrent loads. Groups live in a
//! process-wide registry so the serving side of a transport can resolve them
//! by name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, OnceLock, RwLock};

use async_trait::async_trait;
use rand::Rng;
use snafu::Snafu;
use tracing::debug;

use crate::coalesce::Coalescer;
use crate::local::{ByteCache, CacheStats};
use crate::peers::{self, PeerFetcher, PeerPicker};
use crate::{ByteView, DynError};

/// Loads authoritative values for keys the cache does not hold.
#[async_trait]
pub trait Getter: Send + Sync + 'static {
    /// Produce the value for `key`.
    async fn get(&self, key: &str) -> Result<ByteView, DynError>;
}

/// Adapter implementing [`Getter`] for a closure.
pub struct GetterFn<F>(F);

impl<F> GetterFn<F> {
    /// Wrap `f` as a [`Getter`].
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> std::fmt::Debug for GetterFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetterFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Getter for GetterFn<F>
where
    F: Fn(&str) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ByteView, DynError>> + Send + 'static,
{
    async fn get(&self, key: &str) -> Result<ByteView, DynError> {
        (self.0)(key).await
    }
}

/// Error of a [`Group::get`].
///
/// Errors propagate unchanged from the failing seam; nothing is cached on
/// error and the core performs no retries.
#[derive(Debug, Clone, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("origin load of key {key:?} failed: {source}"))]
    Loader {
        key: String,
        #[snafu(source(false))]
        source: DynError,
    },

    #[snafu(display("peer fetch of key {key:?} failed: {source}"))]
    Peer {
        key: String,
        #[snafu(source(false))]
        source: DynError,
    },

    #[snafu(display("coalesced load of key {key:?} died: {source}"))]
    Flight {
        key: String,
        #[snafu(source(false))]
        source: DynError,
    },
}

/// Result type for [`Group`] operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One in how many remote fetches is mirrored into the hot tier.
const DEFAULT_HOT_SAMPLE: u32 = 10;

static GROUPS: LazyLock<RwLock<HashMap<String, Arc<Group>>>> = LazyLock::new(Default::default);

/// Create and register the group `name` with a byte budget of `cache_bytes`.
///
/// A budget of `0` turns the group into a pass-through: loads still happen
/// and coalesce, but nothing is stored. Groups are never deregistered.
///
/// # Panics
///
/// When a group named `name` already exists.
pub fn new_group(name: impl Into<String>, cache_bytes: usize, getter: impl Getter) -> Arc<Group> {
    let name = name.into();
    let mut groups = GROUPS.write().expect("not poisoned");
    if groups.contains_key(&name) {
        // release the registry lock before unwinding
        drop(groups);
        panic!("duplicate registration of cache group {name:?}");
    }

    debug!(%name, cache_bytes, "creating cache group");
    let group = Arc::new(Group {
        name: name.clone(),
        getter: Arc::new(getter),
        cache_bytes,
        main_cache: ByteCache::new(),
        hot_cache: ByteCache::new(),
        flights: Coalescer::default(),
        peers: OnceLock::new(),
        hot_one_in: AtomicU32::new(DEFAULT_HOT_SAMPLE),
    });
    groups.insert(name, Arc::clone(&group));
    group
}

/// Look up a previously created group.
pub fn get_group(name: &str) -> Option<Arc<Group>> {
    GROUPS.read().expect("not poisoned").get(name).map(Arc::clone)
}

/// A named cache namespace.
///
/// The main tier holds values this process is authoritative for (loaded from
/// the origin); the hot tier mirrors a random sample of values fetched from
/// peers. Both tiers share one byte budget, rebalanced on every population so
/// the hot tier stays a small fraction of the whole.
pub struct Group {
    name: String,
    getter: Arc<dyn Getter>,
    /// Byte budget spanning both tiers; `0` makes the group pass-through.
    cache_bytes: usize,
    main_cache: ByteCache,
    hot_cache: ByteCache,
    flights: Coalescer<String, Result<ByteView>>,
    /// Installed at most once: explicitly, or from the process-wide registrar
    /// on the first `get`.
    peers: OnceLock<Option<Arc<dyn PeerPicker>>>,
    hot_one_in: AtomicU32,
}

impl Group {
    /// Name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Retrieve the value for `key`.
    ///
    /// Resolution order: local tiers, then the owning peer, then the origin
    /// loader. Concurrent calls for the same missing key share one load.
    /// Dropping the returned future abandons the wait but not the load
    /// itself, which completes and populates the cache for later callers.
    pub async fn get(self: &Arc<Self>, key: &str) -> Result<ByteView> {
        // adopt the process-wide picker before the first lookup
        self.peers();

        if let Some(value) = self.lookup_local(key) {
            return Ok(value);
        }

        self.load(key).await
    }

    /// Install the peer picker for this group, overriding the process-wide
    /// registrar. Must happen before the first [`get`](Self::get).
    ///
    /// # Panics
    ///
    /// When a picker is already installed.
    pub fn register_picker(&self, picker: Arc<dyn PeerPicker>) {
        if self.peers.set(Some(picker)).is_err() {
            panic!(
                "peer picker installed more than once for group {:?}",
                self.name
            );
        }
    }

    /// Mirror one in `one_in` remote fetches into the hot tier.
    ///
    /// Defaults to 10. `0` disables hot mirroring, `1` mirrors every fetch.
    pub fn set_hot_sample(&self, one_in: u32) {
        self.hot_one_in.store(one_in, Ordering::Relaxed);
    }

    /// Snapshot the statistics of both tiers.
    pub fn stats(&self) -> GroupStats {
        GroupStats {
            main: self.main_cache.stats(),
            hot: self.hot_cache.stats(),
        }
    }

    fn peers(&self) -> Option<&Arc<dyn PeerPicker>> {
        self.peers.get_or_init(peers::registered_picker).as_ref()
    }

    fn lookup_local(&self, key: &str) -> Option<ByteView> {
        if self.cache_bytes == 0 {
            // pass-through: nothing is ever stored
            return None;
        }
        self.main_cache.get(key).or_else(|| self.hot_cache.get(key))
    }

    async fn load(self: &Arc<Self>, key: &str) -> Result<ByteView> {
        let this = Arc::clone(self);
        let key_captured = key.to_owned();
        let flight = self.flights.load(key.to_owned(), move || async move {
            // a prior flight may have populated the tiers while this caller
            // raced for the slot
            if let Some(value) = this.lookup_local(&key_captured) {
                return Ok(value);
            }

            let peer = this.peers().and_then(|p| p.pick_peer(&key_captured));
            match peer {
                Some(peer) => this.fetch_from_peer(peer.as_ref(), &key_captured).await,
                None => this.load_from_origin(&key_captured).await,
            }
        });

        match flight.await {
            Ok(res) => res,
            Err(source) => Err(Error::Flight {
                key: key.to_owned(),
                source,
            }),
        }
    }

    /// Fetch `key` from its owning peer.
    ///
    /// Peer values never enter the main tier; a small random sample is
    /// mirrored into the hot tier instead.
    async fn fetch_from_peer(&self, peer: &dyn PeerFetcher, key: &str) -> Result<ByteView> {
        let data = peer.fetch(&self.name, key).await.map_err(|source| Error::Peer {
            key: key.to_owned(),
            source,
        })?;
        let value = ByteView::from(data);

        if self.sample_hot() {
            self.populate(key, value.clone(), &self.hot_cache);
        }
        Ok(value)
    }

    async fn load_from_origin(&self, key: &str) -> Result<ByteView> {
        let value = self.getter.get(key).await.map_err(|source| Error::Loader {
            key: key.to_owned(),
            source,
        })?;
        self.populate(key, value.clone(), &self.main_cache);
        Ok(value)
    }

    /// Insert into `tier` and evict until both tiers fit the byte budget.
    fn populate(&self, key: &str, value: ByteView, tier: &ByteCache) {
        if self.cache_bytes == 0 {
            return;
        }
        tier.add(key, value);

        loop {
            let main_bytes = self.main_cache.bytes();
            let hot_bytes = self.hot_cache.bytes();
            if main_bytes + hot_bytes <= self.cache_bytes {
                return;
            }

            // the hot tier gives way once it reaches an eighth of the main
            // tier, keeping most of the budget for authoritative data
            let (victim, fallback) = if hot_bytes >= main_bytes / 8 {
                (&self.hot_cache, &self.main_cache)
            } else {
                (&self.main_cache, &self.hot_cache)
            };
            if victim.remove_oldest().is_none() && fallback.remove_oldest().is_none() {
                // nothing left to evict
                return;
            }
        }
    }

    fn sample_hot(&self) -> bool {
        match self.hot_one_in.load(Ordering::Relaxed) {
            0 => false,
            1 => true,
            n => rand::rng().random_range(0..n) == 0,
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("cache_bytes", &self.cache_bytes)
            .finish_non_exhaustive()
    }
}

/// Per-tier statistics of a [`Group`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupStats {
    /// The authoritative tier.
    pub main: CacheStats,
    /// The hot mirror tier.
    pub hot: CacheStats,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use bytes::Bytes;
    use futures::future::join_all;

    use crate::coalesce::str_err;

    use super::*;

    /// A getter counting its invocations, answering `v(<key>)`.
    fn counting_getter(loads: &Arc<AtomicUsize>) -> impl Getter {
        let loads = Arc::clone(loads);
        GetterFn::new(move |key: &str| {
            let loads = Arc::clone(&loads);
            let key = key.to_owned();
            async move {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DynError>(ByteView::from(format!("v({key})")))
            }
        })
    }

    /// A getter that must never run.
    fn unreachable_getter() -> impl Getter {
        GetterFn::new(|_: &str| {
            panic!("origin must not be consulted");

            // unreachable, but the closure needs a future type
            #[expect(unreachable_code)]
            async move {
                unreachable!()
            }
        })
    }

    #[derive(Debug)]
    struct StaticPeer {
        data: &'static str,
        fetches: AtomicUsize,
        fail: bool,
    }

    impl StaticPeer {
        fn new(data: &'static str) -> Arc<Self> {
            Arc::new(Self {
                data,
                fetches: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                data: "",
                fetches: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl PeerFetcher for StaticPeer {
        async fn fetch(&self, _group: &str, _key: &str) -> Result<Bytes, DynError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(str_err("peer unreachable"));
            }
            Ok(Bytes::copy_from_slice(self.data.as_bytes()))
        }
    }

    /// Routes every key to the wrapped peer.
    struct AlwaysRemote(Arc<StaticPeer>);

    impl PeerPicker for AlwaysRemote {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerFetcher>> {
            Some(Arc::clone(&self.0) as _)
        }
    }

    /// Claims every key for this process.
    struct AlwaysSelf;

    impl PeerPicker for AlwaysSelf {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerFetcher>> {
            None
        }
    }

    #[tokio::test]
    async fn test_origin_load_populates_main() {
        let loads = Arc::new(AtomicUsize::new(0));
        let group = new_group("origin-populates-main", 1 << 20, counting_getter(&loads));

        let value = group.get("alpha").await.unwrap();
        assert_eq!(value, ByteView::from("v(alpha)"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // second lookup is served locally
        let value = group.get("alpha").await.unwrap();
        assert_eq!(value, ByteView::from("v(alpha)"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let stats = group.stats();
        assert_eq!(stats.main.items, 1);
        assert_eq!(stats.hot.items, 0);
    }

    #[tokio::test]
    async fn test_concurrent_gets_coalesce() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads_captured = Arc::clone(&loads);
        let group = new_group(
            "concurrent-gets-coalesce",
            1 << 20,
            GetterFn::new(move |_: &str| {
                let loads = Arc::clone(&loads_captured);
                async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, DynError>(ByteView::from("v"))
                }
            }),
        );

        let results = join_all((0..100).map(|_| {
            let group = Arc::clone(&group);
            async move { group.get("k").await }
        }))
        .await;

        for result in results {
            assert_eq!(result.unwrap(), ByteView::from("v"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let stats = group.stats();
        assert_eq!(stats.main.items, 1);
        assert!(stats.main.gets >= 100, "gets = {}", stats.main.gets);
    }

    #[tokio::test]
    async fn test_budget_rebalances_tiers() {
        let group = new_group("budget-rebalance", 100, unreachable_getter());
        // cost 30 each: 2-byte key + 28-byte value
        let value = || ByteView::from("x".repeat(28));

        for i in 0..3 {
            group.populate(&format!("m{i}"), value(), &group.main_cache);
        }
        assert_eq!(group.main_cache.bytes(), 90);

        // over budget and the hot tier is past main/8, so hot drains first
        group.populate("h0", value(), &group.hot_cache);
        let stats = group.stats();
        assert!(stats.main.bytes + stats.hot.bytes <= 100);
        assert_eq!(stats.hot.bytes, 0);
        assert_eq!(stats.main.bytes, 90);

        // repeated rounds keep the hot tier pinned down
        for i in 0..5 {
            group.populate(&format!("h{i}"), value(), &group.hot_cache);
            let stats = group.stats();
            assert!(stats.main.bytes + stats.hot.bytes <= 100);
            assert!(stats.hot.bytes <= 12, "hot = {}", stats.hot.bytes);
        }

        // a fourth main entry evicts the oldest main entry instead
        group.populate("m3", value(), &group.main_cache);
        let stats = group.stats();
        assert_eq!(stats.main.bytes, 90);
        assert_eq!(stats.main.items, 3);
        assert!(group.main_cache.get("m0").is_none());
        assert!(group.main_cache.get("m3").is_some());
    }

    #[tokio::test]
    async fn test_peer_fetch_mirrors_into_hot() {
        let peer = StaticPeer::new("v");
        let group = new_group("peer-hot-mirror", 1 << 20, unreachable_getter());
        group.register_picker(Arc::new(AlwaysRemote(Arc::clone(&peer))));
        group.set_hot_sample(1);

        let value = group.get("k").await.unwrap();
        assert_eq!(value, ByteView::from("v"));
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 1);

        // peer values must not enter the main tier
        let stats = group.stats();
        assert_eq!(stats.main.items, 0);
        assert_eq!(stats.hot.items, 1);

        // the mirror now serves lookups locally
        let value = group.get("k").await.unwrap();
        assert_eq!(value, ByteView::from("v"));
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_fetch_without_mirror() {
        let peer = StaticPeer::new("v");
        let group = new_group("peer-no-mirror", 1 << 20, unreachable_getter());
        group.register_picker(Arc::new(AlwaysRemote(Arc::clone(&peer))));
        group.set_hot_sample(0);

        group.get("k").await.unwrap();
        let stats = group.stats();
        assert_eq!(stats.main.items, 0);
        assert_eq!(stats.hot.items, 0);

        // nothing was cached, so the peer is asked again
        group.get("k").await.unwrap();
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_self_owned_key_loads_from_origin() {
        let loads = Arc::new(AtomicUsize::new(0));
        let group = new_group("self-owned", 1 << 20, counting_getter(&loads));
        group.register_picker(Arc::new(AlwaysSelf));

        let value = group.get("k").await.unwrap();
        assert_eq!(value, ByteView::from("v(k)"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let stats = group.stats();
        assert_eq!(stats.main.items, 1);
        assert_eq!(stats.hot.items, 0);
    }

    #[tokio::test]
    async fn test_loader_error_propagates() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads_captured = Arc::clone(&loads);
        let group = new_group(
            "loader-error",
            1 << 20,
            GetterFn::new(move |_: &str| {
                let loads = Arc::clone(&loads_captured);
                async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Err::<ByteView, _>(str_err("origin down"))
                }
            }),
        );

        let err = group.get("k").await.unwrap_err();
        assert!(matches!(err, Error::Loader { .. }), "{err}");
        assert!(err.to_string().contains("origin down"), "{err}");
        assert_eq!(group.stats().main.items, 0);

        // errors are not cached
        let err = group.get("k").await.unwrap_err();
        assert!(matches!(err, Error::Loader { .. }), "{err}");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_peer_error_propagates_without_origin_fallback() {
        let peer = StaticPeer::failing();
        let group = new_group("peer-error", 1 << 20, unreachable_getter());
        group.register_picker(Arc::new(AlwaysRemote(Arc::clone(&peer))));

        let err = group.get("k").await.unwrap_err();
        assert!(matches!(err, Error::Peer { .. }), "{err}");
        assert!(err.to_string().contains("peer unreachable"), "{err}");

        let stats = group.stats();
        assert_eq!(stats.main.items, 0);
        assert_eq!(stats.hot.items, 0);
    }

    #[tokio::test]
    async fn test_zero_budget_is_pass_through() {
        let loads = Arc::new(AtomicUsize::new(0));
        let group = new_group("pass-through", 0, counting_getter(&loads));

        assert_eq!(group.get("k").await.unwrap(), ByteView::from("v(k)"));
        assert_eq!(group.get("k").await.unwrap(), ByteView::from("v(k)"));

        // nothing is stored and the tiers are never consulted
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        let stats = group.stats();
        assert_eq!(stats.main.gets, 0);
        assert_eq!(stats.main.items, 0);
        assert_eq!(stats.hot.items, 0);
    }

    #[tokio::test]
    async fn test_registry() {
        let loads = Arc::new(AtomicUsize::new(0));
        let group = new_group("registry-lookup", 1 << 20, counting_getter(&loads));
        assert_eq!(group.name(), "registry-lookup");

        let found = get_group("registry-lookup").unwrap();
        assert!(Arc::ptr_eq(&group, &found));
        assert!(get_group("registry-absent").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_group_panics() {
        let loads = Arc::new(AtomicUsize::new(0));
        let _group = new_group("duplicate-name", 1 << 20, counting_getter(&loads));

        let loads_captured = Arc::clone(&loads);
        let second = std::panic::catch_unwind(move || {
            new_group("duplicate-name", 1 << 20, counting_getter(&loads_captured))
        });
        assert!(second.is_err());
    }
}
