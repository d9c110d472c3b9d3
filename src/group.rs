//! Provides the cache groups which form the public surface of Ganymede.
//!
//! A [Group] is a named cache with its own [Loader], its own memory budget and its own view of
//! the cluster. Answering [Group::get](Group::get) is a small state machine:
//!
//! 1. An empty key is rejected as an error.
//! 2. The local cache is consulted - a hit is returned immediately.
//! 3. On a miss, the load is collapsed per key (see [singleflight](crate::singleflight)) and
//!    then either delegated to the peer owning the key or - if this node owns the key or the
//!    peer fails - answered by the group's loader, whose result is placed in the local cache.
//!
//! Values fetched from a peer are deliberately **not** placed in the local cache: the owning
//! peer already keeps them in memory and caching them twice would multiply the memory footprint
//! of hot keys across the cluster.
//!
//! Groups are created via the [GroupRegistry], which is installed into the
//! [Platform](crate::platform::Platform) and keeps the name to group mapping for the transport
//! layer. A group name may only be registered once - re-registering it is reported as an error,
//! as two groups with different loaders answering for the same name is never intended.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;

use crate::average::Average;
use crate::byteview::ByteView;
use crate::config::Config;
use crate::fmt::{format_short_duration, format_size, parse_size};
use crate::lru::LruCache;
use crate::platform::Platform;
use crate::singleflight::SingleFlight;

/// Produces the value for a key on a cache miss.
///
/// The loader is the only part of a cache group the application has to provide: it is invoked
/// whenever a key is requested which is neither cached locally nor owned by a reachable peer.
/// The core never retries a loader and never inspects its error beyond propagating it to the
/// caller of [Group::get](Group::get).
#[async_trait]
pub trait Loader: Send + Sync {
    /// Computes or fetches the value for the given key.
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Fetches a cached value from a remote peer.
///
/// Implemented by the transport layer (see [HttpGetter](crate::transport::HttpGetter)); a
/// getter is pre-configured with the address of one peer and fetches values by group name
/// and key.
#[async_trait]
pub trait PeerGetter: Send + Sync {
    /// Fetches the value for the given key of the given group from the remote peer.
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Determines which peer owns a given key.
///
/// Returns **None** if the key is owned by this node itself (or if no peers are known) - in
/// which case the caller is expected to answer the request locally.
pub trait PeerPicker: Send + Sync {
    /// Returns the getter of the peer owning the given key or **None** for local ownership.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// Serializes all access to the cache storage of a group.
///
/// The underlying [LruCache] is not thread-safe by design, therefore every access runs under
/// this mutex. The lock is held for the duration of a single get or put and never across an
/// await point, so contention stays negligible compared to the loads being shielded.
///
/// The cache itself is created lazily on first use - a group which never sees a local load
/// never allocates any storage.
struct MainCache {
    max_bytes: usize,
    lru: Mutex<Option<LruCache<ByteView>>>,
}

impl MainCache {
    fn new(max_bytes: usize) -> Self {
        MainCache {
            max_bytes,
            lru: Mutex::new(None),
        }
    }

    fn get(&self, key: &str) -> Option<ByteView> {
        let mut lru = self.lru.lock().unwrap();
        lru.as_mut().and_then(|lru| lru.get(key).cloned())
    }

    fn put(&self, key: String, value: ByteView) {
        let mut lru = self.lru.lock().unwrap();
        lru.get_or_insert_with(|| LruCache::new(self.max_bytes))
            .put(key, value);
    }

    fn cached_entries(&self) -> usize {
        self.lru.lock().unwrap().as_ref().map_or(0, |lru| lru.len())
    }

    fn cached_bytes(&self) -> usize {
        self.lru
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |lru| lru.used_bytes())
    }
}

/// Collects the usage counters of a group.
#[derive(Default)]
struct Stats {
    gets: AtomicU64,
    cache_hits: AtomicU64,
    peer_loads: AtomicU64,
    peer_errors: AtomicU64,
    local_loads: AtomicU64,
    local_load_errors: AtomicU64,
    local_load_duration: Average,
}

/// A point-in-time snapshot of the usage counters of a group.
///
/// Obtained via [Group::stats](Group::stats), mainly intended for logging and monitoring.
pub struct GroupStats {
    /// Contains the total number of get requests (including cache hits).
    pub gets: u64,

    /// Contains the number of gets answered from the local cache.
    pub cache_hits: u64,

    /// Contains the number of values fetched from remote peers.
    pub peer_loads: u64,

    /// Contains the number of failed peer fetches (each followed by a local fallback).
    pub peer_errors: u64,

    /// Contains the number of values produced by the local loader.
    pub local_loads: u64,

    /// Contains the number of failed local loads.
    pub local_load_errors: u64,

    /// Contains the sliding average duration of local loads in microseconds.
    pub avg_local_load_micros: i32,

    /// Contains the number of entries currently held in the local cache.
    pub cached_entries: usize,

    /// Contains the memory currently accounted to the local cache in bytes.
    pub cached_bytes: usize,

    /// Contains the memory budget of the local cache in bytes (0 = unbounded).
    pub max_bytes: usize,
}

impl std::fmt::Display for GroupStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} gets, {} hits, {} peer loads ({} failed), {} local loads ({} failed, avg {}), {} entries / {} of {}",
            self.gets,
            self.cache_hits,
            self.peer_loads,
            self.peer_errors,
            self.local_loads,
            self.local_load_errors,
            format_short_duration(self.avg_local_load_micros),
            self.cached_entries,
            format_size(self.cached_bytes),
            format_size(self.max_bytes)
        )
    }
}

/// A named read-through cache which shards its keyspace across the cluster.
///
/// Groups are created via [GroupRegistry::create_group](GroupRegistry::create_group) and are
/// cheap to share (all methods take `&self`).
pub struct Group {
    name: String,
    loader: Arc<dyn Loader>,
    cache: MainCache,
    peers: Mutex<Option<Arc<dyn PeerPicker>>>,
    flights: SingleFlight<ByteView>,
    stats: Stats,
}

impl Group {
    /// Returns the name under which this group has been registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches the peer picker which routes keys to the nodes owning them.
    ///
    /// Without a picker, every miss is answered by the local loader - which is the natural mode
    /// for a single node setup or for tests. The picker can be registered at most once:
    /// swapping the routing of a live group would silently redistribute the keyspace, therefore
    /// a second registration is reported as an error.
    pub fn register_peer_picker(&self, picker: Arc<dyn PeerPicker>) -> anyhow::Result<()> {
        let mut peers = self.peers.lock().unwrap();
        if peers.is_some() {
            return Err(anyhow::anyhow!(
                "A peer picker has already been registered for group '{}'.",
                self.name
            ));
        }

        *peers = Some(picker);
        Ok(())
    }

    /// Returns the cached value for the given key, computing it if necessary.
    ///
    /// A locally cached value is returned immediately. Otherwise the load is collapsed with all
    /// concurrent requests for the same key and answered by the owning peer or the local
    /// loader (see the module documentation for the exact flow). An empty key is rejected, as
    /// it cannot be routed or cached sensibly.
    ///
    /// Loader failures are propagated verbatim (and shared by all collapsed callers); peer
    /// failures are handled internally by falling back to the local loader.
    pub async fn get(&self, key: &str) -> anyhow::Result<ByteView> {
        if key.is_empty() {
            return Err(anyhow::anyhow!(
                "An empty key can neither be cached nor loaded."
            ));
        }

        let _ = self.stats.gets.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.cache.get(key) {
            log::debug!("Cache hit for '{}' in group {}.", key, self.name);
            let _ = self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        self.load(key).await
    }

    /// Performs the miss path of a get, collapsed per key.
    ///
    /// Concurrent gets for the same key which all miss the local cache end up here together -
    /// exactly one of them executes the peer fetch / load, everyone shares its outcome.
    async fn load(&self, key: &str) -> anyhow::Result<ByteView> {
        self.flights
            .execute(key, self.fetch_or_load(key))
            .await
            .map_err(|error| anyhow::anyhow!("{:#}", error))
    }

    async fn fetch_or_load(&self, key: &str) -> anyhow::Result<ByteView> {
        // The picker lock is released before any network traffic happens...
        let picker = self.peers.lock().unwrap().clone();

        if let Some(picker) = picker {
            if let Some(peer) = picker.pick_peer(key) {
                match peer.fetch(&self.name, key).await {
                    Ok(bytes) => {
                        let _ = self.stats.peer_loads.fetch_add(1, Ordering::Relaxed);

                        // The owning peer keeps this value cached - storing it here as well
                        // would duplicate hot keys on every node.
                        return Ok(ByteView::new(bytes));
                    }
                    Err(error) => {
                        let _ = self.stats.peer_errors.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "Failed to fetch '{}' of group {} from its peer: {:#} - falling back to the local loader.",
                            key,
                            self.name,
                            error
                        );
                    }
                }
            }
        }

        self.load_locally(key).await
    }

    async fn load_locally(&self, key: &str) -> anyhow::Result<ByteView> {
        let watch = Instant::now();

        match self.loader.load(key).await {
            Ok(bytes) => {
                self.stats
                    .local_load_duration
                    .add(watch.elapsed().as_micros() as i32);
                let _ = self.stats.local_loads.fetch_add(1, Ordering::Relaxed);

                let value = ByteView::new(bytes);
                self.cache.put(key.to_owned(), value.clone());

                Ok(value)
            }
            Err(error) => {
                let _ = self.stats.local_load_errors.fetch_add(1, Ordering::Relaxed);
                Err(error)
            }
        }
    }

    /// Returns a snapshot of the usage counters of this group.
    pub fn stats(&self) -> GroupStats {
        GroupStats {
            gets: self.stats.gets.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            peer_loads: self.stats.peer_loads.load(Ordering::Relaxed),
            peer_errors: self.stats.peer_errors.load(Ordering::Relaxed),
            local_loads: self.stats.local_loads.load(Ordering::Relaxed),
            local_load_errors: self.stats.local_load_errors.load(Ordering::Relaxed),
            avg_local_load_micros: self.stats.local_load_duration.avg(),
            cached_entries: self.cache.cached_entries(),
            cached_bytes: self.cache.cached_bytes(),
            max_bytes: self.cache.max_bytes,
        }
    }
}

/// Keeps track of all cache groups of this node.
///
/// The registry is created once ([installed](GroupRegistry::install) into the
/// [Platform](crate::platform::Platform) at startup) and lives until shutdown. It is handed
/// around by reference - most notably to the transport layer, which resolves the group named
/// in an incoming peer request through it.
pub struct GroupRegistry {
    config: Option<Arc<Config>>,
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl GroupRegistry {
    /// Creates a standalone registry which is not attached to a system config.
    ///
    /// Groups receive exactly the memory budget passed to
    /// [create_group](GroupRegistry::create_group). This is mainly useful for tests and for
    /// embedding Ganymede without the config facility.
    pub fn new() -> Arc<Self> {
        Arc::new(GroupRegistry {
            config: None,
            groups: RwLock::new(HashMap::new()),
        })
    }

    /// Creates a registry and installs it into the given platform.
    ///
    /// If a [Config](crate::config::Config) is present, per-group budget overrides
    /// (`caches.<name>.max_memory`) are honored when groups are created.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let registry = Arc::new(GroupRegistry {
            config: platform.find::<Config>(),
            groups: RwLock::new(HashMap::new()),
        });
        platform.register::<GroupRegistry>(registry.clone());

        registry
    }

    /// Creates and registers a new cache group.
    ///
    /// The group keeps up to **max_bytes** of keys and values in its local cache (0 disables
    /// eviction). If the system config carries `caches.<name>.max_memory`, that setting wins -
    /// this permits to tune budgets per deployment without touching code. Sizes in the config
    /// accept the usual suffixes (`16m`, `1g`, ...).
    ///
    /// Fails if the name is empty or already taken.
    pub fn create_group(
        &self,
        name: &str,
        max_bytes: usize,
        loader: Arc<dyn Loader>,
    ) -> anyhow::Result<Arc<Group>> {
        if name.is_empty() {
            return Err(anyhow::anyhow!("A cache group requires a non-empty name."));
        }

        let max_bytes = self.effective_budget(name, max_bytes);

        let mut groups = self.groups.write().unwrap();
        if groups.contains_key(name) {
            return Err(anyhow::anyhow!(
                "A cache group named '{}' is already registered.",
                name
            ));
        }

        let group = Arc::new(Group {
            name: name.to_owned(),
            loader,
            cache: MainCache::new(max_bytes),
            peers: Mutex::new(None),
            flights: SingleFlight::new(),
            stats: Stats::default(),
        });
        let _ = groups.insert(name.to_owned(), group.clone());

        log::info!(
            "Created cache group {} with a budget of {}.",
            name,
            format_size(max_bytes)
        );

        Ok(group)
    }

    /// Resolves a previously created group by its name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }

    /// Determines the memory budget for the given group.
    ///
    /// A `caches.<name>.max_memory` entry in the system config overrides the budget given in
    /// code. An unparseable entry is reported and ignored, so that a config typo never creates
    /// a group with a surprise budget.
    fn effective_budget(&self, name: &str, default_budget: usize) -> usize {
        let config = match &self.config {
            Some(config) => config.current(),
            None => return default_budget,
        };

        let setting = &config.yaml()["caches"][name]["max_memory"];
        if let Some(value) = setting.as_str() {
            match parse_size(value) {
                Ok(budget) => return budget,
                Err(error) => log::error!(
                    "Ignoring max_memory override for cache group {}: {}",
                    name,
                    error
                ),
            }
        } else if let Some(value) = setting.as_i64() {
            if value >= 0 {
                return value as usize;
            }
        }

        default_budget
    }
}

#[cfg(test)]
mod tests {
    use crate::byteview::ByteView;
    use crate::config::Config;
    use crate::group::{GroupRegistry, Loader, PeerGetter, PeerPicker};
    use crate::platform::Platform;
    use crate::testing::test_async;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// A loader which counts its invocations and answers "value of {key}".
    struct CountingLoader {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingLoader {
        fn new() -> Arc<Self> {
            Arc::new(CountingLoader {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
            })
        }

        fn slow() -> Arc<Self> {
            Arc::new(CountingLoader {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Loader for CountingLoader {
        async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(format!("value of {}", key).into_bytes())
        }
    }

    /// A loader which always fails.
    struct BrokenLoader;

    #[async_trait]
    impl Loader for BrokenLoader {
        async fn load(&self, _key: &str) -> anyhow::Result<Vec<u8>> {
            Err(anyhow::anyhow!("the backing store is on fire"))
        }
    }

    /// A peer getter which serves a fixed value and counts its invocations.
    struct StaticPeer {
        value: Vec<u8>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PeerGetter for StaticPeer {
        async fn fetch(&self, _group: &str, _key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
        }
    }

    /// A peer getter which always fails.
    struct UnreachablePeer;

    #[async_trait]
    impl PeerGetter for UnreachablePeer {
        async fn fetch(&self, _group: &str, _key: &str) -> anyhow::Result<Vec<u8>> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    /// Routes every key to the given getter (or to "self" if none is given).
    struct StaticPicker {
        getter: Option<Arc<dyn PeerGetter>>,
    }

    impl PeerPicker for StaticPicker {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerGetter>> {
            self.getter.clone()
        }
    }

    #[test]
    fn a_miss_loads_and_a_hit_does_not() {
        test_async(async {
            let registry = GroupRegistry::new();
            let loader = CountingLoader::new();
            let group = registry
                .create_group("objects", 1024, loader.clone())
                .unwrap();

            // The first get invokes the loader...
            assert_eq!(
                group.get("k").await.unwrap(),
                ByteView::from("value of k")
            );
            assert_eq!(loader.calls(), 1);

            // ...the second is answered from the cache.
            assert_eq!(
                group.get("k").await.unwrap(),
                ByteView::from("value of k")
            );
            assert_eq!(loader.calls(), 1);

            let stats = group.stats();
            assert_eq!(stats.gets, 2);
            assert_eq!(stats.cache_hits, 1);
            assert_eq!(stats.local_loads, 1);
            assert_eq!(stats.cached_entries, 1);
        });
    }

    #[test]
    fn empty_keys_are_rejected() {
        test_async(async {
            let registry = GroupRegistry::new();
            let group = registry
                .create_group("objects", 1024, CountingLoader::new())
                .unwrap();

            assert_eq!(group.get("").await.is_err(), true);
        });
    }

    #[test]
    fn loader_errors_are_propagated_and_nothing_is_cached() {
        test_async(async {
            let registry = GroupRegistry::new();
            let group = registry
                .create_group("objects", 1024, Arc::new(BrokenLoader))
                .unwrap();

            assert_eq!(group.get("k").await.is_err(), true);
            assert_eq!(group.get("k").await.is_err(), true);

            let stats = group.stats();
            // Each get reached the loader - a failure must not poison the cache...
            assert_eq!(stats.local_load_errors, 2);
            assert_eq!(stats.cached_entries, 0);
        });
    }

    #[test]
    fn remote_keys_are_fetched_from_their_peer_and_not_cached_locally() {
        test_async(async {
            let registry = GroupRegistry::new();
            let loader = CountingLoader::new();
            let group = registry
                .create_group("objects", 1024, loader.clone())
                .unwrap();

            let peer = Arc::new(StaticPeer {
                value: b"remote value".to_vec(),
                fetches: AtomicUsize::new(0),
            });
            group
                .register_peer_picker(Arc::new(StaticPicker {
                    getter: Some(peer.clone()),
                }))
                .unwrap();

            // Both gets are answered by the peer - the local loader stays idle and the value
            // is not duplicated into the local cache...
            assert_eq!(
                group.get("x").await.unwrap(),
                ByteView::from("remote value")
            );
            assert_eq!(
                group.get("x").await.unwrap(),
                ByteView::from("remote value")
            );
            assert_eq!(peer.fetches.load(Ordering::SeqCst), 2);
            assert_eq!(loader.calls(), 0);
            assert_eq!(group.stats().cached_entries, 0);
        });
    }

    #[test]
    fn peer_failures_fall_back_to_the_local_loader() {
        test_async(async {
            let registry = GroupRegistry::new();
            let loader = CountingLoader::new();
            let group = registry
                .create_group("objects", 1024, loader.clone())
                .unwrap();

            group
                .register_peer_picker(Arc::new(StaticPicker {
                    getter: Some(Arc::new(UnreachablePeer)),
                }))
                .unwrap();

            // The peer fails, the local loader answers and the caller never sees the
            // peer error...
            assert_eq!(
                group.get("x").await.unwrap(),
                ByteView::from("value of x")
            );
            assert_eq!(loader.calls(), 1);

            let stats = group.stats();
            assert_eq!(stats.peer_errors, 1);
            assert_eq!(stats.local_loads, 1);
        });
    }

    #[test]
    fn self_owned_keys_are_loaded_locally() {
        test_async(async {
            let registry = GroupRegistry::new();
            let loader = CountingLoader::new();
            let group = registry
                .create_group("objects", 1024, loader.clone())
                .unwrap();

            // A picker reporting "no remote peer" directs the group to its own loader...
            group
                .register_peer_picker(Arc::new(StaticPicker { getter: None }))
                .unwrap();

            assert_eq!(
                group.get("x").await.unwrap(),
                ByteView::from("value of x")
            );
            assert_eq!(loader.calls(), 1);
        });
    }

    #[test]
    fn concurrent_misses_collapse_into_one_load() {
        test_async(async {
            let registry = GroupRegistry::new();
            let loader = CountingLoader::slow();
            let group = registry
                .create_group("objects", 1024, loader.clone())
                .unwrap();

            let mut tasks = Vec::new();
            for _ in 0..6 {
                let group = group.clone();
                tasks.push(tokio::spawn(async move { group.get("hot").await }));
            }

            for task in futures::future::join_all(tasks).await {
                assert_eq!(
                    task.unwrap().unwrap(),
                    ByteView::from("value of hot")
                );
            }

            // Six concurrent misses resulted in a single loader execution...
            assert_eq!(loader.calls(), 1);
        });
    }

    #[test]
    fn a_peer_picker_can_only_be_registered_once() {
        test_async(async {
            let registry = GroupRegistry::new();
            let group = registry
                .create_group("objects", 1024, CountingLoader::new())
                .unwrap();

            assert_eq!(
                group
                    .register_peer_picker(Arc::new(StaticPicker { getter: None }))
                    .is_ok(),
                true
            );
            assert_eq!(
                group
                    .register_peer_picker(Arc::new(StaticPicker { getter: None }))
                    .is_err(),
                true
            );
        });
    }

    #[test]
    fn group_names_are_unique() {
        let registry = GroupRegistry::new();

        assert_eq!(
            registry
                .create_group("objects", 1024, CountingLoader::new())
                .is_ok(),
            true
        );
        assert_eq!(
            registry
                .create_group("objects", 1024, CountingLoader::new())
                .is_err(),
            true
        );
        assert_eq!(registry.create_group("", 1024, CountingLoader::new()).is_err(), true);

        assert_eq!(registry.lookup("objects").is_some(), true);
        assert_eq!(registry.lookup("unknown").is_none(), true);
    }

    #[test]
    fn config_budget_overrides_are_honored() {
        test_async(async {
            let platform = Platform::new();
            crate::config::install(platform.clone()).await;
            platform
                .require::<Config>()
                .load_from_string(
                    "caches:
                         objects:
                             max_memory: 1k
                    ",
                    None,
                )
                .unwrap();

            let registry = GroupRegistry::install(&platform);
            let group = registry
                .create_group("objects", 64 * 1024, CountingLoader::new())
                .unwrap();

            // The config wins over the budget given in code...
            assert_eq!(group.stats().max_bytes, 1024);

            // Groups without an override keep their coded budget...
            let other = registry
                .create_group("other", 2048, CountingLoader::new())
                .unwrap();
            assert_eq!(other.stats().max_bytes, 2048);
        });
    }
}
