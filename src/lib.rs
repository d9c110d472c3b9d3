//! Ganymede is a library for building clusters of cooperating in-process read-through caches.
//!
//! # Introduction
//! **Ganymede** turns a set of application processes into a single logical cache: each node keeps
//! a bounded in-memory cache and the nodes agree - via consistent hashing - which node is
//! responsible for computing each key. A value is therefore computed (by a caller supplied
//! [Loader](group::Loader)) by **at most one node** in the cluster and served from memory
//! everywhere afterwards. This provides memcached-like sharding without operating an external
//! cache cluster.
//!
//! Reads are orchestrated per named [Group](group::Group): a `get` first consults the local
//! cache, then asks the consistent hash ring which peer owns the key and fetches the value from
//! that peer over a minimal HTTP protocol, and only loads the value itself if it owns the key
//! (or the owning peer fails). Concurrent requests for the same key are collapsed into a single
//! execution so that a thundering herd never reaches the loader.
//!
//! # Features
//! * **Byte-bounded LRU caching** - each group is constrained by a memory budget and evicts the
//!   least recently used entries once the budget is exceeded (see [lru]).
//! * **Deterministic peer selection** - a consistent hash ring with virtual replicas smooths the
//!   key distribution across nodes and keeps routing stable when nodes are added (see [ring]).
//! * **Request collapsing** - duplicate concurrent loads for a key share one execution and one
//!   result (see [singleflight]).
//! * **Plain HTTP peer transport** - values travel as `application/octet-stream` bodies under a
//!   common path prefix, so any node can be inspected with `curl` (see [transport]).
//! * **100% Async/Await** - the whole library builds upon [tokio](https://tokio.rs/) and the
//!   async/await primitives provided by Rust.
//! * **Reload-aware config facility** which permits to update the configuration during operation
//!   (see [config]).
//!
//! # Using Ganymede
//! The [Builder](builder::Builder) assembles a [Platform](platform::Platform) with the desired
//! components. A typical node registers a group with its loader, announces the peer set and then
//! runs the transport event loop:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ganymede::builder::Builder;
//! use ganymede::group::{GroupRegistry, Loader};
//! use ganymede::transport::{HttpPeers, Server};
//!
//! struct DbLoader;
//!
//! #[async_trait::async_trait]
//! impl Loader for DbLoader {
//!     async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
//!         Ok(format!("value of {}", key).into_bytes())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     let registry = platform.require::<GroupRegistry>();
//!     let group = registry.create_group("objects", 64 * 1024 * 1024, Arc::new(DbLoader))?;
//!
//!     let peers = platform.require::<HttpPeers>();
//!     peers.set_peers(&[
//!         "http://cache-1.local:2420".to_owned(),
//!         "http://cache-2.local:2420".to_owned(),
//!     ]);
//!     group.register_peer_picker(peers)?;
//!
//!     platform.require::<Server>().event_loop().await;
//!     Ok(())
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod byteview;
pub mod config;
pub mod fmt;
pub mod group;
pub mod lru;
pub mod platform;
pub mod ring;
pub mod signals;
pub mod singleflight;
pub mod transport;

/// Contains the version of the Ganymede library.
pub const GANYMEDE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Ganymede build being used.
pub const GANYMEDE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate ganymede;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
