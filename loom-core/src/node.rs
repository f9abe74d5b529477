//! Node assembly: builds every subsystem from a [`Config`] and drives it
//! through the lifecycle orchestrator.
//!
//! Startup order: store, pool, directory, gossip, certificates,
//! services, dispatcher. Shutdown runs the reverse order under the
//! configured grace deadline.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum_server::tls_rustls::RustlsConfig;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::ca::certs::CertificateRecord;
use crate::ca::provisioner::{CertProvisioner, CA_TRUST_KEY};
use crate::ca::CertAuthority;
use crate::config::{AuthMode, Config};
use crate::directory::{DirectorySnapshot, DirectoryTimeouts, NodeDirectory};
use crate::gossip::{Gossip, GossipConfig, GossipSignal};
use crate::lifecycle::{Component, LifecycleOrchestrator};
use crate::pool::{ConnectionPool, TlsIdentity};
use crate::ratelimit::RateGuard;
use crate::rpc::proxy::{Fabric, ServiceProxy};
use crate::rpc::registry::MethodRegistry;
use crate::rpc::{main_router, provisioning_router, AppState, AuthPolicy};
use crate::services::{Service, ServiceLoader, SystemService};
use crate::store::{self, SecureStore, SqliteStore, NS_CERT, NS_STATE};
use crate::types::{unix_ms, NodeInfo, NodeStatus, Role};

const SNAPSHOT_KEY: &str = "gossip-snapshot";
const SELF_VERSION_KEY: &str = "last_self_version";
const SNAPSHOT_PERIOD: Duration = Duration::from_secs(60);
const MAX_POOL_CLIENTS: usize = 64;

/// A started node. Dropping the handle does not stop it; call
/// [`NodeHandle::shutdown`].
pub struct NodeHandle {
    pub config: Config,
    pub fabric: Arc<Fabric>,
    orchestrator: Arc<LifecycleOrchestrator>,
    rpc_addr: SocketAddr,
    provisioning_addr: Option<SocketAddr>,
}

impl NodeHandle {
    pub fn proxy(&self) -> ServiceProxy {
        ServiceProxy::new(self.fabric.clone())
    }

    /// Actual bound address of the TLS listener.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Actual bound address of the coordinator's plain-HTTP provisioning
    /// listener.
    pub fn provisioning_addr(&self) -> Option<SocketAddr> {
        self.provisioning_addr
    }

    pub fn directory(&self) -> Arc<NodeDirectory> {
        self.fabric.directory.clone()
    }

    pub async fn run_until_signalled(&self) {
        self.orchestrator.wait_for_signals().await;
        self.orchestrator.shutdown_all().await;
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown_all().await;
    }
}

pub struct NodeBuilder {
    config: Config,
    store: Option<Arc<dyn SecureStore>>,
    services: Vec<Arc<dyn Service>>,
}

impl NodeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            services: Vec::new(),
        }
    }

    /// Inject a store (tests use the in-memory one). Defaults to the
    /// sqlite store at `config.store_path`.
    pub fn with_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn add_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub async fn start(self) -> Result<NodeHandle> {
        let config = self.config;
        config.validate()?;
        crate::tls::install_crypto_provider();

        let store: Arc<dyn SecureStore> = match self.store {
            Some(store) => store,
            None => SqliteStore::open(&config.store_path).await?,
        };

        // Advertised address: multi-homed selection against the
        // configured coordinators.
        let address =
            crate::netif::select_address(config.bind_address, &config.bootstrap_coordinators)
                .await?;
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        // Self version continues past restarts so peers accept the new
        // incarnation immediately.
        let last_self_version = match store.read(NS_STATE, SELF_VERSION_KEY).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).parse().unwrap_or(0),
            None => 0,
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("started_at".to_string(), json!(unix_ms()));
        metadata.insert("hostname".to_string(), json!(hostname.clone()));

        let self_info = NodeInfo {
            node_id: config.node_id.clone(),
            address: address.to_string(),
            port: config.listen_port,
            role: config.role,
            capabilities: config.capabilities.clone(),
            last_seen: unix_ms(),
            status: NodeStatus::Alive,
            metadata,
            services: BTreeMap::new(),
            version: last_self_version + 1,
        };

        let directory = NodeDirectory::new(
            self_info,
            DirectoryTimeouts::from_secs(
                config.suspect_timeout_seconds,
                config.dead_timeout_seconds,
                config.evict_timeout_seconds,
            ),
        );
        let pool = Arc::new(ConnectionPool::new(
            Duration::from_secs(config.outbound_request_deadline_seconds),
            MAX_POOL_CLIENTS,
        ));
        if config.auth_mode == AuthMode::Bearer {
            pool.set_bearer_token(config.cluster_token.clone());
        }
        let registry = MethodRegistry::new();
        let fabric = Arc::new(Fabric {
            directory: directory.clone(),
            registry: registry.clone(),
            pool: pool.clone(),
        });
        let guard = Arc::new(RateGuard::from_config(&config));

        let (gossip_signals_tx, gossip_signals_rx) = mpsc::channel(8);
        let gossip = Gossip::new(
            directory.clone(),
            pool.clone(),
            GossipConfig {
                interval_min: Duration::from_secs(config.gossip_interval_min_seconds),
                interval_max: Duration::from_secs(config.gossip_interval_max_seconds),
                max_targets: config.gossip_max_targets,
                compression_threshold: config.gossip_compression_threshold_bytes,
            },
            gossip_signals_tx,
        );

        let mut loader = ServiceLoader::new();
        loader.add(SystemService::new());
        for service in self.services {
            loader.add(service);
        }
        let loader = Arc::new(loader);

        let mut orchestrator =
            LifecycleOrchestrator::new(Duration::from_secs(config.shutdown_grace_seconds));
        let shutdown = orchestrator.shutdown_signal();

        let ca_cell: Arc<OnceLock<Arc<CertAuthority>>> = Arc::new(OnceLock::new());
        let tls_cell: Arc<OnceLock<(CertificateRecord, String)>> = Arc::new(OnceLock::new());
        let rpc_addr_cell: Arc<OnceLock<SocketAddr>> = Arc::new(OnceLock::new());
        let provisioning_addr_cell: Arc<OnceLock<SocketAddr>> = Arc::new(OnceLock::new());
        let (transport_ready_tx, transport_ready_rx) = watch::channel(false);
        let (recheck_tx, recheck_rx) = mpsc::channel(4);

        let provisioner = Arc::new(CertProvisioner::new(
            store.clone(),
            config.node_id.clone(),
            config.cert_validator_http_port,
            config.cert_renewal_leadtime_days,
            provisioning_endpoints(&config),
        )?);

        orchestrator.register(Arc::new(StoreComponent {
            store: store.clone(),
            shutdown: shutdown.clone(),
            task: Mutex::new(None),
        }));
        orchestrator.register(Arc::new(PoolComponent));
        orchestrator.register(Arc::new(DirectoryComponent {
            directory: directory.clone(),
            store: store.clone(),
            shutdown: shutdown.clone(),
            task: Mutex::new(None),
        }));
        orchestrator.register(Arc::new(GossipComponent {
            gossip: gossip.clone(),
            directory: directory.clone(),
            sweep_period: Duration::from_secs(config.gossip_interval_min_seconds),
            transport_ready: transport_ready_rx,
            shutdown: shutdown.clone(),
            tasks: Mutex::new(Vec::new()),
        }));
        orchestrator.register(Arc::new(CertComponent {
            config: config.clone(),
            store: store.clone(),
            pool: pool.clone(),
            provisioner: provisioner.clone(),
            directory: directory.clone(),
            hostname: hostname.clone(),
            ca_cell: ca_cell.clone(),
            tls_cell: tls_cell.clone(),
            shutdown: shutdown.clone(),
        }));
        orchestrator.register(Arc::new(RegistryComponent {
            fabric: fabric.clone(),
            loader: loader.clone(),
        }));
        orchestrator.register(Arc::new(DispatcherComponent {
            config: config.clone(),
            fabric: fabric.clone(),
            gossip: gossip.clone(),
            guard,
            provisioner,
            ca_cell: ca_cell.clone(),
            tls_cell,
            rpc_addr_cell: rpc_addr_cell.clone(),
            provisioning_addr_cell: provisioning_addr_cell.clone(),
            transport_ready: transport_ready_tx,
            recheck_tx,
            recheck_rx: Mutex::new(Some(recheck_rx)),
            gossip_signals: Mutex::new(Some(gossip_signals_rx)),
            shutdown: shutdown.clone(),
            handle: Mutex::new(None),
            serve_task: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }));

        let orchestrator = Arc::new(orchestrator);
        orchestrator.start_all().await?;

        let rpc_addr = *rpc_addr_cell
            .get()
            .context("dispatcher did not record its bound address")?;

        Ok(NodeHandle {
            config,
            fabric,
            orchestrator,
            rpc_addr,
            provisioning_addr: provisioning_addr_cell.get().copied(),
        })
    }
}

/// host:port plain-HTTP provisioning endpoints on the coordinators:
/// bootstrap hosts on the well-known validator port unless overridden.
fn provisioning_endpoints(config: &Config) -> Vec<String> {
    if !config.bootstrap_provisioning.is_empty() {
        return config.bootstrap_provisioning.clone();
    }
    config
        .bootstrap_coordinators
        .iter()
        .filter_map(|entry| {
            let host = entry.rsplit_once(':').map(|(host, _)| host)?;
            Some(format!("{host}:{}", config.cert_validator_http_port))
        })
        .collect()
}

// ============================================================================
// Components
// ============================================================================

struct StoreComponent {
    store: Arc<dyn SecureStore>,
    shutdown: watch::Receiver<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl Component for StoreComponent {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn start(&self) -> Result<()> {
        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        *self.task.lock() = Some(tokio::spawn(store::flush_loop(store, shutdown)));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Mandatory final flush, independent of the loop's own.
        self.store.flush().await?;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

struct PoolComponent;

#[async_trait]
impl Component for PoolComponent {
    fn name(&self) -> &'static str {
        "pool"
    }
    fn dependencies(&self) -> Vec<&'static str> {
        vec!["store"]
    }
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

struct DirectoryComponent {
    directory: Arc<NodeDirectory>,
    store: Arc<dyn SecureStore>,
    shutdown: watch::Receiver<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DirectoryComponent {
    async fn persist(directory: &NodeDirectory, store: &Arc<dyn SecureStore>) -> Result<()> {
        let snapshot = directory.snapshot();
        store
            .write(NS_STATE, SNAPSHOT_KEY, serde_json::to_vec(&snapshot)?)
            .await?;
        store
            .write(
                NS_STATE,
                SELF_VERSION_KEY,
                directory.self_info().version.to_string().into_bytes(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Component for DirectoryComponent {
    fn name(&self) -> &'static str {
        "directory"
    }
    fn dependencies(&self) -> Vec<&'static str> {
        vec!["pool"]
    }

    async fn start(&self) -> Result<()> {
        if let Some(bytes) = self.store.read(NS_STATE, SNAPSHOT_KEY).await? {
            match serde_json::from_slice::<DirectorySnapshot>(&bytes) {
                Ok(snapshot) => {
                    let count = snapshot.nodes.len();
                    self.directory.restore(snapshot);
                    info!("Restored {count} directory entries from the last run");
                }
                Err(e) => warn!("Ignoring corrupt directory snapshot: {e}"),
            }
        }

        let directory = self.directory.clone();
        let store = self.store.clone();
        let mut shutdown = self.shutdown.clone();
        *self.task.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SNAPSHOT_PERIOD) => {
                        if let Err(e) = DirectoryComponent::persist(&directory, &store).await {
                            warn!("Directory snapshot persist failed: {e:#}");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Self::persist(&self.directory, &self.store).await
    }
}

struct GossipComponent {
    gossip: Arc<Gossip>,
    directory: Arc<NodeDirectory>,
    sweep_period: Duration,
    transport_ready: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl Component for GossipComponent {
    fn name(&self) -> &'static str {
        "gossip"
    }
    fn dependencies(&self) -> Vec<&'static str> {
        vec!["directory"]
    }

    async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.gossip.clone().run(
            self.transport_ready.clone(),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(Gossip::run_sweeper(
            self.directory.clone(),
            self.sweep_period,
            self.shutdown.clone(),
        )));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // The loops exit via the shutdown signal (bounded final
        // fan-out); reap whatever is left.
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        Ok(())
    }
}

struct CertComponent {
    config: Config,
    store: Arc<dyn SecureStore>,
    pool: Arc<ConnectionPool>,
    provisioner: Arc<CertProvisioner>,
    directory: Arc<NodeDirectory>,
    hostname: String,
    ca_cell: Arc<OnceLock<Arc<CertAuthority>>>,
    tls_cell: Arc<OnceLock<(CertificateRecord, String)>>,
    shutdown: watch::Receiver<bool>,
}

impl CertComponent {
    fn san_ips(&self) -> Vec<String> {
        let mut ips = vec![self.directory.self_info().address];
        if !ips.contains(&"127.0.0.1".to_string()) {
            ips.push("127.0.0.1".to_string());
        }
        ips
    }

    fn san_dns(&self) -> Vec<String> {
        let mut names = vec![self.hostname.clone()];
        if !names.contains(&"localhost".to_string()) {
            names.push("localhost".to_string());
        }
        names
    }
}

#[async_trait]
impl Component for CertComponent {
    fn name(&self) -> &'static str {
        "certificates"
    }
    fn dependencies(&self) -> Vec<&'static str> {
        vec!["gossip"]
    }

    async fn start(&self) -> Result<()> {
        let (record, ca_pem) = match self.config.role {
            Role::Coordinator => {
                let ca = Arc::new(CertAuthority::bootstrap(self.store.clone()).await?);
                // The coordinator trusts its own CA.
                self.store
                    .write(
                        NS_CERT,
                        CA_TRUST_KEY,
                        ca.ca_cert_pem().as_bytes().to_vec(),
                    )
                    .await?;

                // Reuse a stored leaf when it still checks out,
                // otherwise issue a fresh one against our own CA.
                let existing = self.provisioner.load_record().await?;
                let check = crate::ca::provisioner::check_record(
                    existing.as_ref(),
                    unix_ms() as i64 / 1000,
                    self.config.cert_renewal_leadtime_days,
                    &self.directory.self_info().address,
                    &self.hostname,
                    Some(ca.ca_fingerprint()),
                );
                let record = match (existing, check) {
                    (Some(record), crate::ca::provisioner::CertCheck::Ready) => record,
                    (_, _) => {
                        ca.self_issue(
                            &self.config.node_id,
                            &self.san_ips(),
                            &self.san_dns(),
                        )
                        .await?
                    }
                };
                let ca_pem = ca.ca_cert_pem().to_string();
                let _ = self.ca_cell.set(ca);
                (record, ca_pem)
            }
            Role::Worker => {
                self.provisioner
                    .ensure_certificate(&self.san_ips(), &self.san_dns(), self.shutdown.clone())
                    .await?
            }
        };

        let ca_fingerprint = crate::ca::certs::fingerprint_pem(&ca_pem)?;
        self.pool.set_identity(TlsIdentity {
            ca_pem: ca_pem.clone(),
            ca_fingerprint,
            cert_pem: record.cert_pem.clone(),
            key_pem: record.key_pem.clone(),
        });
        let _ = self.tls_cell.set((record, ca_pem));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

struct RegistryComponent {
    fabric: Arc<Fabric>,
    loader: Arc<ServiceLoader>,
}

#[async_trait]
impl Component for RegistryComponent {
    fn name(&self) -> &'static str {
        "services"
    }
    fn dependencies(&self) -> Vec<&'static str> {
        vec!["certificates"]
    }

    async fn start(&self) -> Result<()> {
        self.loader.initialize_all(&self.fabric).await
    }

    async fn stop(&self) -> Result<()> {
        self.loader.shutdown_all().await;
        Ok(())
    }
}

struct DispatcherComponent {
    config: Config,
    fabric: Arc<Fabric>,
    gossip: Arc<Gossip>,
    guard: Arc<RateGuard>,
    provisioner: Arc<CertProvisioner>,
    ca_cell: Arc<OnceLock<Arc<CertAuthority>>>,
    tls_cell: Arc<OnceLock<(CertificateRecord, String)>>,
    rpc_addr_cell: Arc<OnceLock<SocketAddr>>,
    provisioning_addr_cell: Arc<OnceLock<SocketAddr>>,
    transport_ready: watch::Sender<bool>,
    recheck_tx: mpsc::Sender<()>,
    recheck_rx: Mutex<Option<mpsc::Receiver<()>>>,
    gossip_signals: Mutex<Option<mpsc::Receiver<GossipSignal>>>,
    shutdown: watch::Receiver<bool>,
    handle: Mutex<Option<axum_server::Handle>>,
    serve_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl Component for DispatcherComponent {
    fn name(&self) -> &'static str {
        "dispatcher"
    }
    fn dependencies(&self) -> Vec<&'static str> {
        vec!["services"]
    }

    async fn start(&self) -> Result<()> {
        let (record, ca_pem) = self
            .tls_cell
            .get()
            .context("TLS material missing at dispatcher start")?
            .clone();

        let client_ca = match self.config.auth_mode {
            AuthMode::Mtls => Some(ca_pem.as_str()),
            AuthMode::Bearer => None,
        };
        let server_config =
            crate::tls::load_server_config(&record.cert_pem, &record.key_pem, client_ca)?;

        let auth = match self.config.auth_mode {
            AuthMode::Mtls => AuthPolicy::Mtls,
            AuthMode::Bearer => AuthPolicy::Bearer {
                token: self
                    .config
                    .cluster_token
                    .clone()
                    .context("bearer auth without cluster_token")?,
            },
        };

        let state = Arc::new(AppState {
            fabric: self.fabric.clone(),
            gossip: self.gossip.clone(),
            guard: self.guard.clone(),
            auth,
            ca: self.ca_cell.get().cloned(),
            default_validator_port: self.config.cert_validator_http_port,
        });

        let challenge_slot = self.provisioner.challenge_slot();
        let router = main_router(state.clone(), challenge_slot);

        let bind = SocketAddr::new(self.config.bind_address, self.config.listen_port);
        let handle = axum_server::Handle::new();
        *self.handle.lock() = Some(handle.clone());

        let rustls_config = RustlsConfig::from_config(Arc::new(server_config));
        let serve_handle = handle.clone();
        let serve_router = router.clone();
        *self.serve_task.lock() = Some(tokio::spawn(async move {
            if let Err(e) = axum_server::bind_rustls(bind, rustls_config)
                .handle(serve_handle)
                .serve(serve_router.into_make_service_with_connect_info::<SocketAddr>())
                .await
            {
                warn!("TLS listener exited: {e}");
            }
        }));

        let rpc_addr = handle
            .listening()
            .await
            .context("TLS listener failed to bind")?;
        let _ = self.rpc_addr_cell.set(rpc_addr);
        info!("RPC listener ready on https://{rpc_addr}");

        // Advertise the actual bound port (it differs when the config
        // asked for an ephemeral port).
        if rpc_addr.port() != self.fabric.directory.self_info().port {
            self.fabric.directory.update_self(|info| {
                info.port = rpc_addr.port();
            });
        }

        // Coordinators additionally expose the plain-HTTP bootstrap
        // subset on the well-known validator port, reachable by workers
        // that hold no certificate yet.
        if self.config.role == Role::Coordinator {
            let listener = tokio::net::TcpListener::bind(SocketAddr::new(
                self.config.bind_address,
                self.config.cert_validator_http_port,
            ))
            .await
            .context("Failed to bind provisioning listener")?;
            let _ = self
                .provisioning_addr_cell
                .set(listener.local_addr().context("provisioning local_addr")?);
            let provisioning = provisioning_router(state.clone());
            let mut shutdown = self.shutdown.clone();
            self.tasks.lock().push(tokio::spawn(async move {
                let _ = axum::serve(
                    listener,
                    provisioning.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move {
                    loop {
                        if shutdown.changed().await.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                })
                .await;
            }));
        }

        // Registry freeze: V2, no registrations once the dispatcher runs.
        self.fabric.registry.freeze();
        let _ = self.transport_ready.send(true);

        // Join fast-path for workers.
        if self.config.role == Role::Worker {
            self.gossip
                .announce_to_bootstraps(&self.config.bootstrap_coordinators)
                .await;
        }

        self.spawn_background_tasks();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        if let Some(handle) = self.handle.lock().take() {
            handle.graceful_shutdown(Some(grace));
        }
        // In-flight inbound requests get the grace period to finish.
        let serve_task = self.serve_task.lock().take();
        if let Some(mut task) = serve_task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

impl DispatcherComponent {
    /// Address-change reaction and scheduled certificate re-checks.
    fn spawn_background_tasks(&self) {
        let mut tasks = self.tasks.lock();

        // Gossip signal: sustained all-target send failures re-run the
        // interface selection; an address change bumps the self version
        // and forces a certificate re-check.
        if let Some(mut signals) = self.gossip_signals.lock().take() {
            let directory = self.fabric.directory.clone();
            let config = self.config.clone();
            let recheck = self.recheck_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(GossipSignal::SustainedSendFailure) = signals.recv().await {
                    let current = directory.self_info().address;
                    match crate::netif::select_address(
                        config.bind_address,
                        &config.bootstrap_coordinators,
                    )
                    .await
                    {
                        Ok(new_address) if new_address.to_string() != current => {
                            warn!(
                                "Re-selected advertised address {current} -> {new_address} \
                                 after sustained gossip failures"
                            );
                            directory.update_self(|info| {
                                info.address = new_address.to_string();
                            });
                            let _ = recheck.try_send(());
                        }
                        Ok(_) => {
                            debug!("Interface re-selection kept {current}");
                        }
                        Err(e) => {
                            warn!("Interface re-selection failed: {e:#}");
                        }
                    }
                }
            }));
        }

        // Daily CHECK plus on-demand re-checks. Renewal swaps the pool
        // identity; new inbound connections use it on the next rebind.
        if let Some(mut recheck_rx) = self.recheck_rx.lock().take() {
            let provisioner = self.provisioner.clone();
            let pool = self.fabric.pool.clone();
            let directory = self.fabric.directory.clone();
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string());
            let shutdown = self.shutdown.clone();
            let is_worker = self.config.role == Role::Worker;
            tasks.push(tokio::spawn(async move {
                if !is_worker {
                    return;
                }
                let mut shutdown_rx = shutdown.clone();
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(86_400)) => {}
                        ping = recheck_rx.recv() => {
                            if ping.is_none() {
                                return;
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }

                    let mut ips = vec![directory.self_info().address];
                    if !ips.contains(&"127.0.0.1".to_string()) {
                        ips.push("127.0.0.1".to_string());
                    }
                    let dns = vec![hostname.clone(), "localhost".to_string()];
                    match provisioner
                        .ensure_certificate(&ips, &dns, shutdown.clone())
                        .await
                    {
                        Ok((record, ca_pem)) => {
                            if let Ok(fingerprint) =
                                crate::ca::certs::fingerprint_pem(&ca_pem)
                            {
                                pool.set_identity(TlsIdentity {
                                    ca_pem,
                                    ca_fingerprint: fingerprint,
                                    cert_pem: record.cert_pem,
                                    key_pem: record.key_pem,
                                });
                            }
                        }
                        Err(e) => {
                            warn!("Scheduled certificate check stopped: {e:#}");
                            return;
                        }
                    }
                }
            }));
        }
    }
}
