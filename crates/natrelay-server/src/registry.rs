//! Client, app and consumer port bookkeeping
//!
//! One mutex covers the client table and the port table, so an allocation
//! request is a single critical section. The registry never opens consumer
//! sockets itself: every newly bound port is announced on the listener
//! channel and the server's single listener task starts accepting on it.
//! That task reports back through the request's release guard once the
//! listener socket is closed, so a torn-down client's ports can be handed
//! out again.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use natrelay_auth::Principal;
use natrelay_proto::{AppAssignment, AppId, AppProtocol, AppRequest, Assignment, ClientId};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::pool::ReverseConnectionPool;

/// Attempts at drawing an unused random client id
const IDENTITY_ATTEMPTS: usize = 10_000;

/// Decides whether a consumer port can be bound
pub trait PortProbe: Send + Sync {
    fn is_available(&self, port: u16) -> bool;
}

/// Probes by binding and immediately releasing the port
pub struct BindProbe {
    ip: IpAddr,
}

impl BindProbe {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }
}

impl PortProbe for BindProbe {
    fn is_available(&self, port: u16) -> bool {
        StdTcpListener::bind((self.ip, port)).is_ok()
    }
}

/// One exposed private service
#[derive(Debug)]
pub struct AppEndpoint {
    pub client_id: ClientId,
    /// Only reverse connections from this principal may join the pool
    pub owner: Principal,
    pub app_id: AppId,
    pub port: u16,
    pub protocol: AppProtocol,
    pub host: String,
    pub description: String,
    pub pool: ReverseConnectionPool<TcpStream>,
    /// Cancels every tunnel running for this app
    pub tunnels: CancellationToken,
}

/// Sent once per port that needs a new consumer listener
#[derive(Debug)]
pub struct ListenerRequest {
    pub port: u16,
    pub client_id: ClientId,
    pub app_id: AppId,
    pub cancel: CancellationToken,
    /// Dropped once the listener socket is closed (or was never opened)
    pub released: DropGuard,
}

struct ClientSession {
    principal: Principal,
    last_update: Instant,
    apps: BTreeMap<AppId, Arc<AppEndpoint>>,
    next_app_id: u8,
}

impl ClientSession {
    fn new(principal: Principal) -> Self {
        Self {
            principal,
            last_update: Instant::now(),
            apps: BTreeMap::new(),
            next_app_id: 1,
        }
    }

    fn register_app(&mut self, client_id: ClientId) -> Result<AppId, RegistryError> {
        if self.next_app_id == 0 {
            return Err(RegistryError::TooManyApps(client_id));
        }
        let app_id = AppId(self.next_app_id);
        self.next_app_id = self.next_app_id.wrapping_add(1);
        Ok(app_id)
    }
}

struct PortBinding {
    protocol: AppProtocol,
    hosts: HashMap<String, Arc<AppEndpoint>>,
    /// Default route when no host matches; last bound wins
    active: Arc<AppEndpoint>,
    listener: CancellationToken,
    released: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<ClientId, ClientSession>,
    ports: BTreeMap<u16, PortBinding>,
    /// Listeners of torn-down clients that may still hold their sockets
    releasing: HashMap<ClientId, Vec<CancellationToken>>,
}

/// Read-only view of a registered app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSummary {
    pub client_id: ClientId,
    pub app_id: AppId,
    pub port: u16,
    pub protocol: AppProtocol,
    pub host: String,
    pub description: String,
    pub idle_connections: usize,
}

pub struct AppRegistry {
    state: Mutex<RegistryState>,
    start_port: u16,
    port_bounds: HashMap<ClientId, Vec<u16>>,
    probe: Box<dyn PortProbe>,
    listeners: mpsc::UnboundedSender<ListenerRequest>,
}

impl AppRegistry {
    /// Create a registry and the receiving end of its listener channel
    pub fn new(
        start_port: u16,
        probe: Box<dyn PortProbe>,
    ) -> (Self, mpsc::UnboundedReceiver<ListenerRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            state: Mutex::new(RegistryState::default()),
            start_port,
            port_bounds: HashMap::new(),
            probe,
            listeners: tx,
        };
        (registry, rx)
    }

    pub fn with_port_bounds(mut self, port_bounds: HashMap<ClientId, Vec<u16>>) -> Self {
        self.port_bounds = port_bounds;
        self
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `client_id` (or a fresh random id when unassigned) for
    /// `principal` and allocate an app id and consumer port for every
    /// requested app.
    pub fn arrange(
        &self,
        principal: Principal,
        client_id: ClientId,
        apps: &[AppRequest],
    ) -> Result<Assignment, RegistryError> {
        let mut state = self.lock();

        let client_id = if client_id.is_unassigned() {
            generate_client_id(&state)?
        } else {
            client_id
        };
        if let Some(session) = state.clients.get(&client_id) {
            if !may_take_over(session.principal, principal) {
                return Err(RegistryError::NotOwner(client_id));
            }
        }
        let session = state
            .clients
            .entry(client_id)
            .or_insert_with(|| ClientSession::new(principal));
        session.principal = principal;
        session.last_update = Instant::now();

        let result = self.allocate_apps(&mut state, principal, client_id, apps);
        drop(state);

        if result.is_err() {
            // no half-provisioned client survives a failed request
            self.teardown(client_id);
        }
        result
    }

    fn allocate_apps(
        &self,
        state: &mut RegistryState,
        principal: Principal,
        client_id: ClientId,
        apps: &[AppRequest],
    ) -> Result<Assignment, RegistryError> {
        let mut assignment = Assignment {
            client_id,
            apps: Vec::with_capacity(apps.len()),
        };

        for request in apps {
            let app_id = match state.clients.get_mut(&client_id) {
                Some(session) => session.register_app(client_id)?,
                None => return Err(RegistryError::UnknownClient(client_id)),
            };

            let start = if request.port == 0 {
                self.start_port
            } else {
                request.port
            };

            let (port, attach) = if self.is_bound_by_user(client_id, start) {
                match state.ports.get(&start) {
                    None => (start, false),
                    Some(binding)
                        if binding.protocol == AppProtocol::Http
                            && request.protocol == AppProtocol::Http =>
                    {
                        (start, true)
                    }
                    Some(_) => return Err(RegistryError::PortConflict { port: start }),
                }
            } else {
                match (request.protocol, state.ports.get(&start)) {
                    (AppProtocol::Http, Some(binding)) if binding.protocol == AppProtocol::Http => {
                        (start, true)
                    }
                    _ => (self.find_free_port(state, start)?, false),
                }
            };

            let endpoint = Arc::new(AppEndpoint {
                client_id,
                owner: principal,
                app_id,
                port,
                protocol: request.protocol,
                host: request.host.clone(),
                description: request.description.clone(),
                pool: ReverseConnectionPool::new(),
                tunnels: CancellationToken::new(),
            });

            if let Some(session) = state.clients.get_mut(&client_id) {
                session.apps.insert(app_id, endpoint.clone());
            }

            if attach {
                if let Some(binding) = state.ports.get_mut(&port) {
                    binding
                        .hosts
                        .insert(endpoint.host.to_ascii_lowercase(), endpoint.clone());
                    binding.active = endpoint.clone();
                }
                debug!(
                    client_id = %client_id,
                    app_id = %app_id,
                    port = port,
                    host = %endpoint.host,
                    "App attached to existing listener"
                );
            } else {
                let listener = CancellationToken::new();
                let released = CancellationToken::new();
                let mut hosts = HashMap::new();
                hosts.insert(endpoint.host.to_ascii_lowercase(), endpoint.clone());
                state.ports.insert(
                    port,
                    PortBinding {
                        protocol: request.protocol,
                        hosts,
                        active: endpoint.clone(),
                        listener: listener.clone(),
                        released: released.clone(),
                    },
                );
                // an undelivered request drops its guard, nothing to wait for
                let _ = self.listeners.send(ListenerRequest {
                    port,
                    client_id,
                    app_id,
                    cancel: listener,
                    released: released.drop_guard(),
                });
            }

            info!(
                client_id = %client_id,
                app_id = %app_id,
                port = port,
                protocol = %request.protocol,
                "App registered"
            );
            assignment.apps.push(AppAssignment { app_id, port });
        }

        Ok(assignment)
    }

    fn is_bound_by_user(&self, client_id: ClientId, port: u16) -> bool {
        self.port_bounds
            .get(&client_id)
            .map(|ports| ports.contains(&port))
            .unwrap_or(false)
    }

    fn find_free_port(&self, state: &RegistryState, start: u16) -> Result<u16, RegistryError> {
        (start..=u16::MAX)
            .filter(|port| *port != 0 && !state.ports.contains_key(port))
            .find(|port| self.probe.is_available(*port))
            .ok_or(RegistryError::NoPortAvailable { start })
    }

    /// Release everything owned by `client_id`. Returns false for an unknown client.
    ///
    /// Consumer listeners are only told to stop; use [`AppRegistry::replace`]
    /// when the ports must be bindable again on return.
    pub fn teardown(&self, client_id: ClientId) -> bool {
        let detached = {
            let mut state = self.lock();
            detach_client(&mut state, client_id)
        };
        match detached {
            Some(apps) => {
                close_apps(client_id, &apps);
                true
            }
            None => false,
        }
    }

    /// Tear down a previous session of `client_id` before `principal`
    /// provisions it again, waiting up to `wait` for its consumer listeners
    /// to close. Listeners of an earlier teardown of the same client are
    /// waited for too. Returns whether a previous session existed.
    pub async fn replace(
        &self,
        principal: Principal,
        client_id: ClientId,
        wait: Duration,
    ) -> Result<bool, RegistryError> {
        let (detached, released) = {
            let mut state = self.lock();
            if let Some(session) = state.clients.get(&client_id) {
                if !may_take_over(session.principal, principal) {
                    return Err(RegistryError::NotOwner(client_id));
                }
            }
            let detached = detach_client(&mut state, client_id);
            let released = state.releasing.remove(&client_id).unwrap_or_default();
            (detached, released)
        };
        if let Some(apps) = &detached {
            close_apps(client_id, apps);
        }

        let all_released = async {
            for token in &released {
                token.cancelled().await;
            }
        };
        if tokio::time::timeout(wait, all_released).await.is_err() {
            warn!(
                client_id = %client_id,
                wait = ?wait,
                "Consumer listeners still open after teardown"
            );
        }
        Ok(detached.is_some())
    }

    /// Drop the binding announced with `listener` after its socket failed to
    /// bind, tearing down every client with an app on it. A binding that was
    /// already released is left alone.
    pub fn abandon_port(&self, port: u16, listener: &CancellationToken) -> Vec<ClientId> {
        let mut owners: Vec<ClientId> = {
            let state = self.lock();
            if listener.is_cancelled() {
                return Vec::new();
            }
            match state.ports.get(&port) {
                Some(binding) => binding.hosts.values().map(|app| app.client_id).collect(),
                None => return Vec::new(),
            }
        };
        owners.sort();
        owners.dedup();

        for client_id in &owners {
            warn!(
                client_id = %client_id,
                port = port,
                "Consumer port unusable, tearing down client"
            );
            self.teardown(*client_id);
        }
        owners
    }

    /// Refresh the heartbeat timestamp. Returns false for an unknown client.
    pub fn touch(&self, client_id: ClientId) -> bool {
        match self.lock().clients.get_mut(&client_id) {
            Some(session) => {
                session.last_update = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Clients whose last heartbeat is older than `max_age`
    pub fn expired(&self, max_age: Duration) -> Vec<ClientId> {
        let now = Instant::now();
        self.lock()
            .clients
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_update) > max_age)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn endpoint(
        &self,
        client_id: ClientId,
        app_id: AppId,
    ) -> Result<Arc<AppEndpoint>, RegistryError> {
        let state = self.lock();
        let session = state
            .clients
            .get(&client_id)
            .ok_or(RegistryError::UnknownClient(client_id))?;
        session
            .apps
            .get(&app_id)
            .cloned()
            .ok_or(RegistryError::UnknownApp { client_id, app_id })
    }

    /// Pick the app serving a consumer connection on `port`
    pub fn route(&self, port: u16, host: Option<&str>) -> Option<Arc<AppEndpoint>> {
        let state = self.lock();
        let binding = state.ports.get(&port)?;
        host.and_then(|h| binding.hosts.get(h))
            .or(Some(&binding.active))
            .cloned()
    }

    pub fn port_protocol(&self, port: u16) -> Option<AppProtocol> {
        self.lock().ports.get(&port).map(|binding| binding.protocol)
    }

    pub fn contains_client(&self, client_id: ClientId) -> bool {
        self.lock().clients.contains_key(&client_id)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.lock().clients.keys().copied().collect()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn bound_ports(&self) -> Vec<u16> {
        self.lock().ports.keys().copied().collect()
    }

    pub fn apps(&self) -> Vec<AppSummary> {
        let state = self.lock();
        state
            .clients
            .values()
            .flat_map(|session| session.apps.values())
            .map(|app| AppSummary {
                client_id: app.client_id,
                app_id: app.app_id,
                port: app.port,
                protocol: app.protocol,
                host: app.host.clone(),
                description: app.description.clone(),
                idle_connections: app.pool.idle_len(),
            })
            .collect()
    }
}

/// A user's session may only be replaced by that same user
fn may_take_over(existing: Principal, incoming: Principal) -> bool {
    existing.is_anonymous() || existing == incoming
}

/// Remove `client_id` and its port bindings, remembering the listeners it
/// stopped until they report their sockets closed
fn detach_client(
    state: &mut RegistryState,
    client_id: ClientId,
) -> Option<BTreeMap<AppId, Arc<AppEndpoint>>> {
    let session = state.clients.remove(&client_id)?;
    state.releasing.retain(|_, tokens| {
        tokens.retain(|token| !token.is_cancelled());
        !tokens.is_empty()
    });
    let mut released = Vec::new();

    for endpoint in session.apps.values() {
        let now_empty = match state.ports.get_mut(&endpoint.port) {
            Some(binding) => {
                binding.hosts.retain(|_, app| app.client_id != client_id);
                if binding.active.client_id == client_id {
                    if let Some(next) = binding.hosts.values().next() {
                        binding.active = next.clone();
                    }
                }
                binding.hosts.is_empty()
            }
            None => false,
        };
        if now_empty {
            if let Some(binding) = state.ports.remove(&endpoint.port) {
                binding.listener.cancel();
                released.push(binding.released);
                debug!(port = endpoint.port, "Consumer port released");
            }
        }
    }
    if !released.is_empty() {
        state
            .releasing
            .entry(client_id)
            .or_default()
            .extend(released);
    }
    Some(session.apps)
}

/// Pools and tunnels have their own locks, close them outside the registry's
fn close_apps(client_id: ClientId, apps: &BTreeMap<AppId, Arc<AppEndpoint>>) {
    for endpoint in apps.values() {
        endpoint.pool.close();
        endpoint.tunnels.cancel();
    }
    info!(client_id = %client_id, apps = apps.len(), "Client torn down");
}

fn generate_client_id(state: &RegistryState) -> Result<ClientId, RegistryError> {
    let mut rng = rand::thread_rng();
    for _ in 0..IDENTITY_ATTEMPTS {
        let candidate = ClientId(rng.gen());
        if !candidate.is_unassigned() && !state.clients.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
    Err(RegistryError::IdentitySpaceExhausted)
}
