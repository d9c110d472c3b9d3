//! Contains the HTTP transport through which the cache nodes of a cluster talk to each other.
//!
//! The protocol is deliberately minimal: a value is fetched from a peer via
//! `GET {base_path}{group}/{key}` (both segments percent-escaped, the base path defaults to
//! `/_cache/`) and travels back as a raw `application/octet-stream` body. Malformed paths are
//! answered with 400, unknown groups with 404 and loader failures with 500 - a peer request
//! never crashes the serving node.
//!
//! Three parts live here:
//! * the [Server], which owns the listening socket and dispatches incoming peer requests to the
//!   [GroupRegistry](crate::group::GroupRegistry),
//! * the [HttpGetter], the client side of the protocol, pre-configured with one peer's base URL,
//! * the [HttpPeers] pool, which owns the [consistent hash ring](crate::ring::HashRing) and the
//!   getter per peer and implements [PeerPicker](crate::group::PeerPicker) on top of both.
//!
//! The peer set is announced wholesale via [HttpPeers::set_peers](HttpPeers::set_peers) - ring
//! and getter map are replaced atomically, so a reader either sees the old or the new cluster
//! view, never a mix. Note that Ganymede performs no live rebalancing: announcing the peers is
//! a startup concern, not a steady-state one.
//!
//! Note that in order to achieve zero downtime / ultra high availability demands, the server
//! will periodically try to bind the socket to the selected port, therefore a "new" instance
//! can be started and the "old" one can bleed out and the port will be "handed through" with
//! minimal downtime. Also, this will listen to change events of the config and will relocate
//! to another port or host if changed.
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode, Uri};
use tokio::net::{TcpListener, TcpStream};

use crate::byteview::ByteView;
use crate::config::Config;
use crate::group::{GroupRegistry, PeerGetter, PeerPicker};
use crate::platform::Platform;
use crate::ring::HashRing;
use crate::spawn;

/// Contains the URL path prefix under which peer requests are served.
///
/// Server and clients of a cluster have to agree on this prefix.
pub const DEFAULT_BASE_PATH: &str = "/_cache/";

/// Contains the number of virtual replicas each peer claims on the hash ring.
///
/// The pool rebuilds its ring with this fixed replica count whenever the peer set is announced.
const DEFAULT_REPLICAS: usize = 50;

/// Specifies the timeout when waiting for a new incoming connection.
///
/// When waiting for a new connection we need to interrupt this every once in a while so that
/// we can check if the platform has been shut down.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Fetches cached values from one remote peer.
///
/// A getter is configured with the base URL of its peer (address plus path prefix) and turns
/// `fetch(group, key)` calls into `GET {base_url}{group}/{key}` requests. A non-200 response is
/// reported as an error carrying the received status.
pub struct HttpGetter {
    base_url: String,
    client: hyper::Client<hyper::client::HttpConnector>,
}

impl HttpGetter {
    /// Creates a getter which fetches values from the peer behind the given base URL.
    ///
    /// The base URL is expected to carry the path prefix and a trailing slash, e.g.
    /// `http://cache-2.local:2420/_cache/`.
    pub fn new(base_url: String) -> Self {
        HttpGetter {
            base_url,
            client: hyper::Client::new(),
        }
    }
}

#[async_trait]
impl PeerGetter for HttpGetter {
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let url = format!(
            "{}{}/{}",
            self.base_url,
            urlencoding::encode(group),
            urlencoding::encode(key)
        );
        log::debug!("Fetching {}...", url);

        let uri = url
            .parse::<Uri>()
            .context("Failed to assemble the peer URL.")?;
        let response = self
            .client
            .get(uri)
            .await
            .context("Failed to reach the peer.")?;

        if response.status() != StatusCode::OK {
            return Err(anyhow::anyhow!(
                "The peer responded with status {}.",
                response.status()
            ));
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .context("Failed to read the peer response.")?;

        Ok(body.to_vec())
    }
}

/// The cluster view of the pool: the ring routing keys and one getter per peer.
///
/// Both parts are replaced together when the peer set is announced.
struct RoutingState {
    ring: HashRing,
    getters: HashMap<String, Arc<HttpGetter>>,
}

/// Owns this node's view of the cluster and picks the peer responsible for each key.
///
/// The pool knows the node's own externally reachable address - a key routed to that address is
/// reported as "no remote peer", directing the group to answer it locally. Peer addresses are
/// expected in the exact form in which this node announces itself to the others (e.g.
/// `http://cache-1.local:2420`), as self-recognition is a plain string comparison.
pub struct HttpPeers {
    self_url: String,
    base_path: String,
    state: Mutex<RoutingState>,
}

impl HttpPeers {
    /// Creates a pool for a node reachable by its peers under the given URL.
    pub fn new(self_url: &str) -> Arc<Self> {
        Arc::new(HttpPeers {
            self_url: self_url.to_owned(),
            base_path: DEFAULT_BASE_PATH.to_owned(),
            state: Mutex::new(RoutingState {
                ring: HashRing::new(DEFAULT_REPLICAS),
                getters: HashMap::new(),
            }),
        })
    }

    /// Creates a pool based on the system config and installs it into the given platform.
    ///
    /// The node's own address is taken from **transport.self_url** - without it, a single-node
    /// default is assumed. Note that this is called by the [Builder](crate::builder::Builder)
    /// unless the transport is disabled.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let self_url = platform
            .find::<Config>()
            .and_then(|config| {
                let handle = config.current();
                handle.yaml()["transport"]["self_url"]
                    .as_str()
                    .map(|url| url.to_owned())
            })
            .unwrap_or_else(|| "http://127.0.0.1:2420".to_owned());

        let peers = HttpPeers::new(&self_url);
        platform.register::<HttpPeers>(peers.clone());

        peers
    }

    /// Announces the peer set of the cluster (including this node itself).
    ///
    /// Ring and getter map are rebuilt from scratch and swapped in atomically with respect to
    /// concurrent [pick_peer](HttpPeers::pick_peer) calls.
    pub fn set_peers(&self, peers: &[String]) {
        let mut ring = HashRing::new(DEFAULT_REPLICAS);
        ring.add(peers);

        let mut getters = HashMap::with_capacity(peers.len());
        for peer in peers {
            let _ = getters.insert(
                peer.clone(),
                Arc::new(HttpGetter::new(format!("{}{}", peer, self.base_path))),
            );
        }

        let mut state = self.state.lock().unwrap();
        state.ring = ring;
        state.getters = getters;

        log::info!(
            "Announced {} peer(s) to the pool of {}.",
            peers.len(),
            self.self_url
        );
    }

    /// Returns the URL under which this node is reachable by its peers.
    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    /// Returns the URL path prefix under which peer requests are served.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}

impl PeerPicker for HttpPeers {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let state = self.state.lock().unwrap();

        match state.ring.locate(key) {
            Some(peer) if peer != self.self_url => {
                log::debug!("Key '{}' is owned by peer {}.", key, peer);
                state
                    .getters
                    .get(peer)
                    .map(|getter| {
                        let getter: Arc<dyn PeerGetter> = getter.clone();
                        getter
                    })
            }
            _ => None,
        }
    }
}

/// Represents the server which exposes the local caches to the other nodes of the cluster.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done manually
    /// via [event_loop](Server::event_loop) as it is most probably done in the main thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Determines if the server socket should keep listening for incoming connections.
    ///
    /// In contrast to **Platform::is_running** this is not used to control the shutdown of the
    /// server. Rather we toggle this flag to false if a config and therefore address change was
    /// detected. This way **server_loop** will exit and a new server socket for the appropriate
    /// address will be set up by the **event_loop**.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used. By default
    /// we use port 2420 and bind to "0.0.0.0".
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                format!(
                    "{}:{}",
                    handle.yaml()["transport"]["host"]
                        .as_str()
                        .unwrap_or("0.0.0.0"),
                    handle.yaml()["transport"]["port"]
                        .as_i64()
                        .filter(|port| port > &0 && port <= &(u16::MAX as i64))
                        .unwrap_or(2420)
                )
            })
            .unwrap_or_else(|| "0.0.0.0:2420".to_owned())
    }

    /// Starts the event loop in a separate thread.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main
    /// thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate thread and waits until the server is up and running.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while !server.is_running() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Tries to open a server socket on the specified address to serve incoming peer requests.
    ///
    /// The task of this loop is to bind the server socket to the specified address. Once this
    /// was successful, we enter the [server_loop](Server::server_loop) to actually handle
    /// incoming connections. Once this loop returns, either the platform is no longer running
    /// and we should exit, or the config has changed and we should try to bind the server to
    /// the new address.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported = Instant::now();

        while self.platform.is_running() {
            // If the server is started for the first time or if it has been restarted due to a
            // config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            // Bind and hopefully enter the server_loop...
            if let Ok(listener) = TcpListener::bind(&address).await {
                log::info!("Opened transport socket on {}...", &address);
                *self.current_address.lock().unwrap() = Some(address.clone());
                self.server_loop(&listener).await;
                log::info!("Closing transport socket on {}.", &address);
            } else {
                // If we were unable to bind to the server, we log this every once in a while
                // (every 5s). Otherwise we would jam the log as we retry every 500ms.
                if Instant::now()
                    .duration_since(last_bind_error_reported)
                    .as_secs()
                    > 5
                {
                    log::error!(
                        "Cannot open transport address: {}. Retrying every 500ms...",
                        &address
                    );
                    last_bind_error_reported = Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    /// Runs the main server loop which processes incoming connections.
    ///
    /// This also listens on config changes and exits to the event_loop if necessary (server
    /// address changed...).
    async fn server_loop(&self, listener: &TcpListener) {
        // If no config is installed, we listen on a channel which never fires instead...
        let (_fallback_tx, fallback_rx) = tokio::sync::broadcast::channel(1);
        let mut config_changed_flag = match self.platform.find::<Config>() {
            Some(config) => config.notifier(),
            None => fallback_rx,
        };

        while self.platform.is_running() && self.is_running() {
            tokio::select! {
                // We use a timeout here so that the while condition (esp. platform.is_running())
                // is checked every once in a while...
                timeout_stream = tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()) => {
                    // We're only interested in a positive result here, as an Err simply
                    // indicates that the timeout was hit - in this case we do nothing as the
                    // while condition is all that needs to be checked...
                    if let Ok(stream) = timeout_stream {
                        if let Ok((stream, _)) = stream {
                            self.handle_new_connection(stream);
                        } else {
                            // The socket has been closed, therefore we exit to the event_loop
                            // which will either completely exit or try to re-create the socket.
                            return;
                        }
                    }
                }
                _ = config_changed_flag.recv() => {
                    // If the config was changed, we need to check if the address itself
                    // changed...
                    let new_address = self.address();
                    if let Some(current_address) = &*self.current_address.lock().unwrap() {
                        if current_address != &new_address {
                            log::info!("Transport address has changed. Restarting server socket...");

                            // Force the event_loop to re-evaluate the expected address...
                            self.running.store(false, Ordering::Release);

                            // Return to event_loop so that the socket is re-created...
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Handles a new incoming connection.
    ///
    /// Forks a task which drives the HTTP/1 protocol for this connection and dispatches each
    /// received request via [dispatch](dispatch).
    fn handle_new_connection(&self, stream: TcpStream) {
        let platform = self.platform.clone();
        spawn!(async move {
            let peer_address = stream
                .peer_addr()
                .map(|address| address.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned());
            log::debug!("Serving peer requests from {}...", peer_address);

            let service = service_fn(move |request| {
                let platform = platform.clone();
                async move { Ok::<_, Infallible>(dispatch(platform, request).await) }
            });

            if let Err(error) = hyper::server::conn::Http::new()
                .serve_connection(stream, service)
                .await
            {
                log::debug!("Connection to {} terminated: {}", peer_address, error);
            }
        });
    }
}

/// Answers a single peer request.
///
/// The path is expected to be `{base_path}{group}/{key}` with both segments percent-escaped.
/// Any other path shape is a client error, an unknown group a lookup error and a failing load
/// a server error - mapped to 400, 404 and 500 respectively.
async fn dispatch(platform: Arc<Platform>, request: Request<Body>) -> Response<Body> {
    let path = request.uri().path().to_owned();
    log::debug!("Received peer request {} {}.", request.method(), path);

    let base_path = platform
        .find::<HttpPeers>()
        .map(|peers| peers.base_path().to_owned())
        .unwrap_or_else(|| DEFAULT_BASE_PATH.to_owned());

    let remainder = match path.strip_prefix(&base_path) {
        Some(remainder) => remainder,
        None => {
            return error_response(StatusCode::NOT_FOUND, format!("Unknown path: {}", path));
        }
    };

    let segments: Vec<&str> = remainder.split('/').collect();
    if segments.len() != 2 || segments.iter().any(|segment| segment.is_empty()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "Malformed path: expected {}{{group}}/{{key}}.",
                base_path
            ),
        );
    }

    let (group_name, key) = match (
        urlencoding::decode(segments[0]),
        urlencoding::decode(segments[1]),
    ) {
        (Ok(group_name), Ok(key)) => (group_name.into_owned(), key.into_owned()),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Malformed path: invalid percent escaping.".to_owned(),
            );
        }
    };

    let group = match platform
        .find::<GroupRegistry>()
        .and_then(|registry| registry.lookup(&group_name))
    {
        Some(group) => group,
        None => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Unknown group: {}", group_name),
            );
        }
    };

    match group.get(&key).await {
        Ok(value) => value_response(value),
        Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", error)),
    }
}

fn value_response(value: ByteView) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_vec()));
    let _ = response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );

    response
}

fn error_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;

    response
}
