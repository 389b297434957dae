//! Server registration and peer tracking.
//!
//! On startup a server registers itself inside a read-committed
//! transaction: look up its own `host_config` record, insert one if
//! missing, read the full host set, commit. The freshly read set becomes
//! the known-peers view and every other server is told about the
//! newcomer. A background task then re-reads the host set periodically so
//! departures and late arrivals converge without any push channel.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::notifier::PeerNotifier;
use super::{host_config, host_config_key, host_url, HOST_CONFIG_NAMESPACE};
use crate::db::transaction::{IsolationLevel, TransactionManager};
use crate::error::{StorageError, StorageResult};
use crate::storage::StorageManager;

/// Settings for one coordinated server instance. Built through
/// [`HaConfig::new`], which enforces a schedulable refresh period.
#[derive(Debug, Clone)]
pub struct HaConfig {
    /// URL this server advertises to its peers.
    server_url: String,
    /// Period between peer-set refreshes.
    refresh_interval: Duration,
}

impl HaConfig {
    /// Validate and build the settings. A zero refresh interval cannot be
    /// scheduled and is rejected before any coordinator exists.
    pub fn new(
        server_url: impl Into<String>,
        refresh_interval: Duration,
    ) -> StorageResult<Self> {
        if refresh_interval.is_zero() {
            return Err(StorageError::configuration(
                "refresh interval must be greater than 0",
            ));
        }
        Ok(Self {
            server_url: server_url.into(),
            refresh_interval,
        })
    }
}

/// Lifecycle of a [`PeerCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Constructed, registration not yet attempted.
    Starting,
    /// Registration transaction in flight.
    Registering,
    /// Host record durable, peers notified.
    Registered,
    /// Periodic refresh task running.
    Running,
    /// Refresh task stopped.
    Stopped,
}

/// Registers this server and keeps the known-peers view current.
///
/// Collaborators are injected at construction: the storage manager holds
/// the host records, the transaction manager scopes registration, and the
/// notifier carries join announcements. Pass the same object twice when
/// one implements both storage traits.
pub struct PeerCoordinator {
    storage: Arc<dyn StorageManager>,
    transaction_manager: Arc<dyn TransactionManager>,
    notifier: Arc<dyn PeerNotifier>,
    config: HaConfig,
    peers: RwLock<Vec<String>>,
    state: Mutex<CoordinatorState>,
    refresh: Mutex<Option<RefreshHandle>>,
}

struct RefreshHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerCoordinator {
    pub fn new(
        storage: Arc<dyn StorageManager>,
        transaction_manager: Arc<dyn TransactionManager>,
        notifier: Arc<dyn PeerNotifier>,
        config: HaConfig,
    ) -> Self {
        Self {
            storage,
            transaction_manager,
            notifier,
            config,
            peers: RwLock::new(Vec::new()),
            state: Mutex::new(CoordinatorState::Starting),
            refresh: Mutex::new(None),
        }
    }

    /// Make this server's registration durable and announce it.
    ///
    /// The record insert and the peer-set read happen in one transaction,
    /// so a crash mid-registration leaves no trace. Notification failures
    /// are logged and do not fail registration.
    pub async fn register(&self) -> StorageResult<()> {
        self.set_state(CoordinatorState::Registering);
        info!(server_url = %self.config.server_url, "Registering server");

        self.transaction_manager
            .begin_transaction(IsolationLevel::ReadCommitted)
            .await?;
        let hosts = match self.ensure_host_record().await {
            Ok(hosts) => {
                self.transaction_manager.commit_transaction().await?;
                hosts
            }
            Err(err) => {
                // The caller sees the original failure, not the rollback's.
                if let Err(rollback_err) = self.transaction_manager.rollback_transaction().await {
                    warn!(
                        error = %rollback_err,
                        "Rollback after failed registration also failed"
                    );
                }
                return Err(err);
            }
        };

        self.replace_peers(hosts);
        self.set_state(CoordinatorState::Registered);
        info!(
            server_url = %self.config.server_url,
            peers = self.peers.read().unwrap().len(),
            "Server registered"
        );

        self.notify_peers().await;
        Ok(())
    }

    /// Inside the registration transaction: insert this server's record if
    /// absent, then read back every registered host URL.
    async fn ensure_host_record(&self) -> StorageResult<Vec<String>> {
        let key = host_config_key(&self.config.server_url);
        if self.storage.get(&key).await?.is_none() {
            let id = self.storage.next_id(HOST_CONFIG_NAMESPACE).await?;
            let mut record = host_config(id, &self.config.server_url);
            self.storage.add(&mut record).await?;
            debug!(id = ?record.id(), "Host record written");
        }

        let records = self.storage.list(HOST_CONFIG_NAMESPACE).await?;
        Ok(records
            .iter()
            .filter_map(host_url)
            .map(str::to_string)
            .collect())
    }

    /// Tell every other known server that this one joined. Best effort.
    async fn notify_peers(&self) {
        for peer in self.peers() {
            if peer == self.config.server_url {
                continue;
            }
            if let Err(err) = self
                .notifier
                .peer_joined(&peer, &self.config.server_url)
                .await
            {
                warn!(peer = %peer, error = %err, "Failed to notify peer");
            }
        }
    }

    /// Launch the periodic peer-set refresh. Call once registration is
    /// done and the server is reachable. A second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut refresh = self.refresh.lock().unwrap();
        if refresh.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);
        let period = self.config.refresh_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; registration already
            // read the current set, so wait a full period instead.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = coordinator.refresh_peers().await {
                            warn!(error = %err, "Peer refresh failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        debug!("Peer refresh task stopping");
                        break;
                    }
                }
            }
        });

        *refresh = Some(RefreshHandle { stop_tx, task });
        drop(refresh);
        self.set_state(CoordinatorState::Running);
        info!(
            interval_secs = period.as_secs(),
            "Peer refresh task started"
        );
    }

    /// Re-read the host set and replace the known-peers view.
    ///
    /// A plain read outside any transaction; the view is swapped
    /// wholesale, so repeated refreshes without intervening writes leave
    /// it unchanged.
    pub async fn refresh_peers(&self) -> StorageResult<()> {
        let records = self.storage.list(HOST_CONFIG_NAMESPACE).await?;
        let hosts = records
            .iter()
            .filter_map(host_url)
            .map(str::to_string)
            .collect();
        self.replace_peers(hosts);
        Ok(())
    }

    /// Stop the refresh task and wait for it to finish. An in-flight
    /// refresh completes; no further one starts. Idempotent.
    pub async fn stop(&self) {
        let handle = self.refresh.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            if let Err(err) = handle.task.await {
                warn!(error = %err, "Peer refresh task ended abnormally");
            }
        }
        self.set_state(CoordinatorState::Stopped);
        info!("Peer coordinator stopped");
    }

    /// Snapshot of the currently known peer URLs, own URL included.
    pub fn peers(&self) -> Vec<String> {
        self.peers.read().unwrap().clone()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock().unwrap()
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    fn replace_peers(&self, mut hosts: Vec<String>) {
        hosts.sort();
        hosts.dedup();
        *self.peers.write().unwrap() = hosts;
    }

    fn set_state(&self, state: CoordinatorState) {
        *self.state.lock().unwrap() = state;
    }
}
