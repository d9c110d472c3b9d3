//! Provides a tiny DI like container which owns all central components of a cache node.
//!
//! The platform is more or less a simple map which keeps each central component as an
//! **Arc<T>** around - most notably the [GroupRegistry](crate::group::GroupRegistry), the
//! [HttpPeers](crate::transport::HttpPeers) pool and the [Config](crate::config::Config).
//! It also keeps the central **is_running** flag which is toggled to *false* once
//! [Platform::terminate](Platform::terminate) is invoked.
//!
//! Keeping these components in an explicitly owned registry (created at process start, handed
//! around by reference, dropped at shutdown) spares us any process-wide mutable globals: whoever
//! needs to create or look up a cache group receives the platform and asks it for the registry.
//!
//! Note that in common cases [Platform::require](Platform::require) is a good way of fetching a
//! component which is known to be there. However, be aware, that once the system shutdown is
//! initiated, the internal map is cleared (so that all Dropped handlers run). Therefore if code
//! might be executed after [Platform::terminate](Platform::terminate) was called, it should use
//! [Platform::find](Platform::find) and gracefully handle the **None** case. In most cases the
//! lookup of components is performed during startup and therefore **require** can be used.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use ganymede::platform::Platform;
//! struct Component {
//!     value: i32,
//! }
//!
//! struct UnknownComponent;
//!
//! let platform = Platform::new();
//!
//! // Registers a new component...
//! platform.register::<Component>(Arc::new(Component { value: 42 }));
//!
//! // Obtains a reference to a previously registered component...
//! assert_eq!(platform.require::<Component>().value, 42);
//!
//! // Looking up a component which hasn't been registered yields an empty optional...
//! assert_eq!(platform.find::<UnknownComponent>().is_none(), true);
//!
//! // By default the platform is running...
//! assert_eq!(platform.is_running(), true);
//!
//! // Once terminated...
//! platform.terminate();
//! // ...all components are immediately released so that their "Dropped" handlers run...
//! assert_eq!(platform.find::<Component>().is_none(), true);
//!
//! // ...and the platform is no longer considered active.
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Provides a container to keep all central components of a cache node in a single place.
///
/// # Examples
///
/// Building and accessing components:
/// ```
/// # use ganymede::platform::Platform;
/// # use std::sync::Arc;
///
/// struct Component {}
///
/// #[tokio::main]
/// async fn main() {
///     let platform = Platform::new();
///     platform.register(Arc::new(Component {}));
///     assert_eq!(platform.find::<Component>().is_some(), true);
/// }
/// ```
pub struct Platform {
    components: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    is_running: AtomicBool,
}

impl Platform {
    /// Creates a new platform instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            components: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    /// Registers a new component.
    ///
    /// # Examples
    /// ```
    /// # use ganymede::platform::Platform;
    /// # use std::sync::Arc;
    ///
    /// struct Component {
    ///     value: i32,
    /// }
    ///
    /// let platform = Platform::new();
    /// platform.register::<Component>(Arc::new(Component { value: 42 }));
    /// ```
    pub fn register<T>(&self, component: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .components
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), component);
    }

    /// Tries to resolve a previously registered component.
    ///
    /// Note, if one knows for certain, that a component will be present,
    /// [Platform::require](Platform::require) can be used.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let components = self.components.lock().unwrap();
        components
            .get(&TypeId::of::<T>())
            .and_then(|component| component.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered component.
    ///
    /// Note, if the framework is already shutting down, all components are evicted. Therefore
    /// this might panic even if it worked before [Platform::terminate](Platform::terminate) was
    /// invoked.
    ///
    /// # Panics
    /// Panics if the requested component isn't available.
    ///
    /// # Examples
    /// ```
    /// # use ganymede::platform::Platform;
    /// # use std::sync::Arc;
    ///
    /// struct Component {
    ///     value: i32,
    /// }
    ///
    /// let platform = Platform::new();
    /// platform.register::<Component>(Arc::new(Component { value: 42 }));
    ///
    /// assert_eq!(platform.require::<Component>().value, 42);
    /// ```
    ///
    /// Requiring a component which is unknown will panic:
    /// ```should_panic
    /// # use ganymede::platform::Platform;
    /// # use std::sync::Arc;
    ///
    /// struct UnknownComponent;
    ///
    /// let platform = Platform::new();
    ///
    /// // This will panic...
    /// platform.require::<UnknownComponent>();
    /// ```
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if self.is_running() {
            match self.find::<T>() {
                Some(component) => component,
                None => panic!(
                    "A required component ({}) was not available in the platform registry!",
                    std::any::type_name::<T>()
                ),
            }
        } else {
            panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            )
        }
    }

    /// Determines if the platform is still running or if [Platform::terminate](Platform::terminate)
    /// has already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the platform.
    ///
    /// This will immediately release all components (so that the Dropped handlers run eventually).
    /// It will also toggle the [is_running()](Platform::is_running) flag to **false**, which makes
    /// the transport server and all background tasks wind down.
    pub fn terminate(&self) {
        // Drop all components so that the Dropped handlers run (sooner or later)...
        self.components.lock().unwrap().clear();

        // Mark platform as halted...
        self.is_running.store(false, Ordering::Release);
    }
}
