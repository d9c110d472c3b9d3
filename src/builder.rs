//! Provides a builder which can be used to setup and initialize the framework.
//!
//! This can be used to create and setup the central parts of a cache node. As Ganymede provides
//! some optional components, a builder permits to selectively enable or disable them.
//!
//! # Example
//! Setting up the framework with all features enabled:
//! ```no_run
//! # use ganymede::builder::Builder;
//! # use ganymede::transport::Server;
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Register cache groups and announce the peer set here...
//!
//!     // Start the main event loop of the transport server...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::{init_logging, GANYMEDE_REVISION, GANYMEDE_VERSION};

/// Initializes the framework by creating and initializing all core components.
///
/// As Ganymede provides a bunch of components of which some are optional, the actual setup can
/// be configured here.
///
/// # Example
/// Setting up the framework with all features enabled:
/// ```no_run
/// # use ganymede::builder::Builder;
/// # use ganymede::transport::Server;
/// #[tokio::main]
/// async fn main() {
///     // Enable all features and build the platform...
///     let platform = Builder::new().enable_all().build().await;
///
///     // Register cache groups and announce the peer set here...
///
///     // Start the main event loop of the transport server...
///     platform.require::<Server>().event_loop().await;
/// }
/// ```
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_groups: bool,
    setup_transport: bool,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            enable_signals: false,
            setup_config: false,
            setup_groups: false,
            setup_transport: false,
        }
    }

    /// Enables all features.
    ///
    /// Note that using this method (and then maybe disabling selected components) is quite
    /// convenient, but be aware that new components which might be added in a library update
    /// will then also be enabled by default. This might or might not be the expected behaviour.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_groups = true;
        self.setup_transport = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As we intend Ganymede
    /// nodes to be run in docker containers, this is all that is needed for proper logging. The
    /// date format being used is digestible by established tools like **greylog**.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the framework once **CTRL-C** or **SIGHUP**
    /// is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [config::Config](crate::config::Config) and loads the **settings.yml**.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Creates and installs a [GroupRegistry](crate::group::GroupRegistry).
    ///
    /// For more details see: [group](crate::group)
    pub fn enable_groups(mut self) -> Self {
        self.setup_groups = true;
        self
    }

    /// Disables setting up a **GroupRegistry** after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_groups(mut self) -> Self {
        self.setup_groups = false;
        self
    }

    /// Creates and installs the peer transport ([HttpPeers](crate::transport::HttpPeers) pool
    /// and [Server](crate::transport::Server)).
    ///
    /// Note that still, the main event loop has to be invoked manually via:
    /// `platform.require::<Server>().event_loop().await`.
    pub fn enable_transport(mut self) -> Self {
        self.setup_transport = true;
        self
    }

    /// Disables setting up the peer transport after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_transport(mut self) -> Self {
        self.setup_transport = false;
        self
    }

    /// Builds the [Platform](crate::platform::Platform) registry with all the enabled
    /// components being registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. GANYMEDE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            GANYMEDE_VERSION,
            GANYMEDE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            crate::config::install(platform.clone()).await;
        }

        if self.setup_groups {
            let _ = crate::group::GroupRegistry::install(&platform);
        }

        if self.setup_transport {
            let _ = crate::transport::HttpPeers::install(&platform);
            let _ = crate::transport::Server::install(&platform);
        }

        platform
    }
}
