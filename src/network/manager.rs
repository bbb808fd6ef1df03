//! # Network Manager
//!
//! Process-wide owner of transport plugins. Resolves a [`ConnectionId`] to
//! its peers (preconfigured table ∪ directory), instantiates the right plugin
//! kind for the connection's role, connects it, rewrites wildcard URIs with
//! the actually-bound address, advertises locally-owned endpoints, and keeps
//! subscribers connected across publisher churn with a refresh worker.
//!
//! Senders and receivers are cached per id; a sender that detects a send
//! timeout asks the manager to forget its entry with
//! [`NetworkManager::remove_sender`] so the next lookup reconnects from
//! scratch.

use super::directory::{
    ConnectionInfo, ConnectionRegistration, ConnectionRequest, DirectoryClient, PORT_ENV,
    SERVER_ENV,
};
use super::transport::{
    self, uri_has_wildcard, ConnectSpec, PluginRole, TransportReceiver, TransportSender,
    TransportSubscriber, Uri,
};
use crate::config::{is_match, Connection, ConnectionId, ConnectionType};
use crate::error::{FabricError, FabricResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounded retry window for transiently-empty directory answers.
const RESOLUTION_RETRY_WINDOW: Duration = Duration::from_secs(1);
const RESOLUTION_RETRY_BACKOFF: Duration = Duration::from_millis(1);

pub struct NetworkManager {
    preconfigured: Mutex<Vec<Connection>>,
    receivers: Mutex<HashMap<ConnectionId, Arc<dyn TransportReceiver>>>,
    senders: Mutex<HashMap<ConnectionId, Arc<dyn TransportSender>>>,
    subscribers: Mutex<HashMap<ConnectionId, Arc<dyn TransportSubscriber>>>,
    directory: Mutex<Option<Arc<DirectoryClient>>>,
    publish_interval: Mutex<Duration>,
    refresh_running: Arc<AtomicBool>,
    refresh_thread: Mutex<Option<JoinHandle<()>>>,
}

static INSTANCE: OnceLock<NetworkManager> = OnceLock::new();

impl NetworkManager {
    pub fn get() -> &'static NetworkManager {
        INSTANCE.get_or_init(|| NetworkManager {
            preconfigured: Mutex::new(Vec::new()),
            receivers: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            directory: Mutex::new(None),
            publish_interval: Mutex::new(Duration::from_secs(1)),
            refresh_running: Arc::new(AtomicBool::new(false)),
            refresh_thread: Mutex::new(None),
        })
    }

    /// Load the preconfigured connection table and, when requested, start
    /// the directory client (host/port from `CONNECTION_SERVER` /
    /// `CONNECTION_PORT`, defaults `localhost:5000`).
    pub fn configure(
        &self,
        connections: Vec<Connection>,
        use_directory: bool,
        publish_interval: Duration,
    ) -> FabricResult<()> {
        let mut table_slot = self.preconfigured.lock();
        if !table_slot.is_empty() {
            return Err(FabricError::AlreadyConfigured("NetworkManager"));
        }

        let mut table: Vec<Connection> = Vec::with_capacity(connections.len());
        for connection in connections {
            if table.iter().any(|existing| existing.id == connection.id) {
                return Err(FabricError::NameCollision(connection.id.uid));
            }
            debug!("adding connection {} to connection map", connection.id);
            table.push(connection);
        }

        if use_directory {
            let server =
                std::env::var(SERVER_ENV).unwrap_or_else(|_| "localhost".to_string());
            let port = std::env::var(PORT_ENV).unwrap_or_else(|_| "5000".to_string());
            debug!("connectivity server is {}:{}", server, port);
            let client = DirectoryClient::new(&server, &port, publish_interval)?;
            *self.directory.lock() = Some(Arc::new(client));
        }

        *self.publish_interval.lock() = publish_interval;
        *table_slot = table;
        Ok(())
    }

    /// Tear everything down: stop the refresh worker, drop every plugin,
    /// retract directory registrations. Idempotent.
    pub fn reset(&self) {
        self.refresh_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.refresh_thread.lock().take() {
            let _ = handle.join();
        }

        self.subscribers.lock().clear();
        self.senders.lock().clear();
        self.receivers.lock().clear();
        self.preconfigured.lock().clear();

        if let Some(client) = self.directory.lock().take() {
            if let Err(e) = client.retract_all() {
                warn!("{}", e);
            }
        }
    }

    /// The directory client, when configured. The typed models use this to
    /// check reachability.
    pub fn directory(&self) -> Option<Arc<DirectoryClient>> {
        self.directory.lock().clone()
    }

    /// Receiver plugin for `id`, created and connected on first use.
    /// `Ok(None)` means the peer set is not ready yet (wildcard URIs still
    /// unresolved); the caller retries within its own deadline.
    pub fn get_receiver(
        &self,
        id: &ConnectionId,
    ) -> FabricResult<Option<Arc<dyn TransportReceiver>>> {
        let mut receivers = self.receivers.lock();
        if let Some(existing) = receivers.get(id) {
            return Ok(Some(Arc::clone(existing)));
        }

        debug!("creating receiver for connection {}", id);
        let peers = self.get_connections(id, false)?;
        match self.create_receiver(peers, id)? {
            Some(receiver) => {
                receivers.insert(id.clone(), Arc::clone(&receiver));
                Ok(Some(receiver))
            }
            None => Ok(None),
        }
    }

    /// Sender plugin for `id`. A send-recv resolution must yield exactly one
    /// peer; `Ok(None)` means the peer's URI is still wildcard ("not ready").
    pub fn get_sender(&self, id: &ConnectionId) -> FabricResult<Option<Arc<dyn TransportSender>>> {
        let mut senders = self.senders.lock();
        if let Some(existing) = senders.get(id) {
            return Ok(Some(Arc::clone(existing)));
        }

        debug!("creating sender for connection {}", id);
        let mut peers = self.get_connections(id, true)?;
        match self.create_sender(peers.remove(0))? {
            Some(sender) => {
                senders.insert(id.clone(), Arc::clone(&sender));
                Ok(Some(sender))
            }
            None => Ok(None),
        }
    }

    /// The subscriber view of a cached pub-sub receiver, when one exists.
    pub fn get_subscriber(&self, id: &ConnectionId) -> Option<Arc<dyn TransportSubscriber>> {
        self.subscribers.lock().get(id).cloned()
    }

    /// Forget a cached sender so the next [`NetworkManager::get_sender`]
    /// reconnects. Called by the typed sender after a send timeout.
    pub fn remove_sender(&self, id: &ConnectionId) {
        debug!("removing sender for connection {}", id);
        self.senders.lock().remove(id);
    }

    /// Whether `id` resolves to a pub-sub connection.
    pub fn is_pubsub_connection(&self, id: &ConnectionId) -> FabricResult<bool> {
        let peers = self.get_connections(id, false)?;
        Ok(peers[0].connection_type == ConnectionType::PubSub)
    }

    /// Union of preconfigured and directory matches for `id`, with a bounded
    /// retry while the directory is transiently empty or unreachable.
    pub fn get_connections(
        &self,
        id: &ConnectionId,
        restrict_single: bool,
    ) -> FabricResult<Vec<ConnectionInfo>> {
        let mut response: Vec<ConnectionInfo> = {
            let table = self.preconfigured.lock();
            table
                .iter()
                .filter(|conn| is_match(id, &conn.id))
                .map(ConnectionInfo::from)
                .collect()
        };
        if restrict_single && response.len() > 1 {
            return Err(FabricError::NameCollision(id.uid.clone()));
        }

        if let Some(client) = self.directory() {
            let request = ConnectionRequest::from(id);
            let deadline = Instant::now() + RESOLUTION_RETRY_WINDOW;
            loop {
                match client.resolve(&request, &id.session) {
                    Ok(found) => {
                        if restrict_single && found.len() > 1 {
                            return Err(FabricError::NameCollision(id.uid.clone()));
                        }
                        if !found.is_empty() {
                            response = found;
                            break;
                        }
                        // Nothing anywhere yet: give the directory a moment.
                        if !response.is_empty() || Instant::now() >= deadline {
                            break;
                        }
                        std::thread::sleep(RESOLUTION_RETRY_BACKOFF);
                    }
                    Err(lookup_error) => {
                        if client.is_connected() {
                            warn!("{}", lookup_error);
                            return Err(FabricError::ConnectionNotFound {
                                uid: id.uid.clone(),
                                data_type: id.data_type.clone(),
                            });
                        }
                        if Instant::now() >= deadline {
                            break;
                        }
                        std::thread::sleep(RESOLUTION_RETRY_BACKOFF);
                    }
                }
            }
        }

        if response.is_empty() {
            return Err(FabricError::ConnectionNotFound {
                uid: id.uid.clone(),
                data_type: id.data_type.clone(),
            });
        }
        Ok(response)
    }

    /// Data types locally bound to `uid` in the preconfigured table.
    pub fn get_datatypes(&self, uid: &str) -> std::collections::BTreeSet<String> {
        self.preconfigured
            .lock()
            .iter()
            .filter(|conn| conn.id.uid == uid)
            .map(|conn| conn.id.data_type.clone())
            .collect()
    }

    fn create_receiver(
        &self,
        mut peers: Vec<ConnectionInfo>,
        id: &ConnectionId,
    ) -> FabricResult<Option<Arc<dyn TransportReceiver>>> {
        let is_pubsub = peers[0].connection_type == ConnectionType::PubSub;
        if !is_pubsub && peers.len() > 1 {
            return Err(FabricError::OperationFailed(
                "configuring a send-recv receiver with multiple connections is not allowed"
                    .to_string(),
            ));
        }

        let role = if is_pubsub {
            PluginRole::Subscriber
        } else {
            PluginRole::Receiver
        };

        let spec = if is_pubsub {
            // Skip peers whose wildcard URI has not been rewritten yet; they
            // show up on a later refresh tick.
            let uris: Vec<String> = peers
                .iter()
                .map(|p| p.uri.clone())
                .filter(|uri| !uri_has_wildcard(uri))
                .collect();
            if uris.is_empty() {
                return Ok(None);
            }
            ConnectSpec::multi(uris)
        } else {
            ConnectSpec::single(peers[0].uri.clone())
        };

        debug!("creating {:?} plugin for {}", role, peers[0].uri);
        let plugin = transport::make_receiver(role, &peers[0].uri)?;
        let bound = plugin.receiver.connect_for_receives(&spec)?;
        debug!("receiver reports connected to URI {}", bound);

        if uri_has_wildcard(&peers[0].uri) {
            peers[0].uri = rewrite_wildcards(&peers[0].uri, &bound)?;
            debug!("connection URI is now {}", peers[0].uri);
        }

        if let Some(subscriber) = plugin.subscriber {
            debug!("subscribing to topic {}", id.data_type);
            subscriber.subscribe(&id.data_type)?;
            self.subscribers
                .lock()
                .insert(id.clone(), Arc::clone(&subscriber));
            self.start_refresh_worker();
        } else if let Some(client) = self.directory() {
            // Send-recv receivers own their (possibly rewritten) address.
            client.publish(ConnectionRegistration::from(&peers[0]));
        }

        Ok(Some(plugin.receiver))
    }

    fn create_sender(
        &self,
        mut peer: ConnectionInfo,
    ) -> FabricResult<Option<Arc<dyn TransportSender>>> {
        let is_pubsub = peer.connection_type == ConnectionType::PubSub;

        // Both ends in-app and the directory has not seen the bound end yet.
        if !is_pubsub && uri_has_wildcard(&peer.uri) {
            return Ok(None);
        }

        let role = if is_pubsub {
            PluginRole::Publisher
        } else {
            PluginRole::Sender
        };
        debug!("creating {:?} plugin for {}", role, peer.uri);
        let plugin = transport::make_sender(role, &peer.uri)?;
        let bound = plugin.connect_for_sends(&ConnectSpec::single(peer.uri.clone()))?;
        debug!("sender plugin connected, reports URI {}", bound);

        if uri_has_wildcard(&peer.uri) {
            peer.uri = rewrite_wildcards(&peer.uri, &bound)?;
            debug!("connection URI is now {}", peer.uri);
        }

        if is_pubsub {
            if let Some(client) = self.directory() {
                // Publishers own their address.
                client.publish(ConnectionRegistration::from(&peer));
            }
        }

        Ok(Some(plugin))
    }

    fn start_refresh_worker(&self) {
        if self.refresh_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = Arc::clone(&self.refresh_running);
        let handle = std::thread::spawn(move || {
            let manager = NetworkManager::get();
            while running.load(Ordering::SeqCst) {
                manager.refresh_subscribers();
                let interval = *manager.publish_interval.lock();
                let mut remaining = interval;
                while running.load(Ordering::SeqCst) && !remaining.is_zero() {
                    let slice = remaining.min(Duration::from_millis(50));
                    std::thread::sleep(slice);
                    remaining = remaining.saturating_sub(slice);
                }
            }
        });
        *self.refresh_thread.lock() = Some(handle);
    }

    /// One refresh tick: re-point every subscriber at the currently-resolved
    /// publisher set. Errors are swallowed; vanished peers simply drop out
    /// of the list.
    fn refresh_subscribers(&self) {
        let subscribers = self.subscribers.lock();
        for (id, subscriber) in subscribers.iter() {
            match self.get_connections(id, false) {
                Ok(peers) => {
                    let uris: Vec<String> = peers
                        .into_iter()
                        .map(|p| p.uri)
                        .filter(|uri| !uri_has_wildcard(uri))
                        .collect();
                    if uris.is_empty() {
                        continue;
                    }
                    if let Err(e) = subscriber.connect_for_receives(&ConnectSpec::multi(uris)) {
                        debug!("subscriber refresh for {} failed: {}", id, e);
                    }
                }
                Err(e) => {
                    debug!("subscriber refresh lookup for {} failed: {}", id, e);
                }
            }
        }
    }
}

/// Merge the plugin-reported URI into a configured URI that still carries
/// wildcards.
fn rewrite_wildcards(configured: &str, actual: &str) -> FabricResult<String> {
    let requested = Uri::parse(configured)?;
    let bound = Uri::parse(actual)?;
    Ok(requested.merge_actual(&bound).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::GLOBAL_LOCK;

    fn connection(uid: &str, data_type: &str, uri: &str, kind: ConnectionType) -> Connection {
        Connection {
            id: ConnectionId::new(uid, data_type),
            uri: uri.to_string(),
            connection_type: kind,
        }
    }

    fn configure(manager: &NetworkManager, connections: Vec<Connection>) {
        manager.reset();
        manager
            .configure(connections, false, Duration::from_millis(100))
            .unwrap();
    }

    #[test]
    fn preconfigured_resolution_uses_uid_regex() {
        let _guard = GLOBAL_LOCK.lock();
        let manager = NetworkManager::get();
        configure(
            manager,
            vec![
                connection("net_a", "Data", "inproc://mgr_a", ConnectionType::SendRecv),
                connection("net_b", "Data", "inproc://mgr_b", ConnectionType::SendRecv),
            ],
        );

        let exact = manager
            .get_connections(&ConnectionId::new("net_a", "Data"), false)
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].uri, "inproc://mgr_a");

        let all = manager
            .get_connections(&ConnectionId::new("net_.*", "Data"), false)
            .unwrap();
        assert_eq!(all.len(), 2);

        assert!(matches!(
            manager.get_connections(&ConnectionId::new("net_.*", "Data"), true),
            Err(FabricError::NameCollision(_))
        ));
        assert!(matches!(
            manager.get_connections(&ConnectionId::new("missing", "Data"), false),
            Err(FabricError::ConnectionNotFound { .. })
        ));

        manager.reset();
    }

    #[test]
    fn sender_and_receiver_are_cached_until_removed() {
        let _guard = GLOBAL_LOCK.lock();
        let manager = NetworkManager::get();
        configure(
            manager,
            vec![connection(
                "cached",
                "Data",
                "inproc://mgr_cached",
                ConnectionType::SendRecv,
            )],
        );

        let id = ConnectionId::new("cached", "Data");
        let r1 = manager.get_receiver(&id).unwrap().unwrap();
        let r2 = manager.get_receiver(&id).unwrap().unwrap();
        assert!(Arc::ptr_eq(&r1, &r2));

        let s1 = manager.get_sender(&id).unwrap().unwrap();
        let s2 = manager.get_sender(&id).unwrap().unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));

        manager.remove_sender(&id);
        let s3 = manager.get_sender(&id).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&s1, &s3), "removal forces a fresh plugin");

        manager.reset();
    }

    #[test]
    fn send_recv_sender_with_wildcard_peer_is_not_ready() {
        let _guard = GLOBAL_LOCK.lock();
        let manager = NetworkManager::get();
        configure(
            manager,
            vec![connection(
                "pending",
                "Data",
                "tcp://*:*",
                ConnectionType::SendRecv,
            )],
        );

        let id = ConnectionId::new("pending", "Data");
        assert!(manager.get_sender(&id).unwrap().is_none());

        manager.reset();
    }

    #[test]
    fn pubsub_classification_and_datatypes() {
        let _guard = GLOBAL_LOCK.lock();
        let manager = NetworkManager::get();
        configure(
            manager,
            vec![
                connection("bus", "Data", "inproc://mgr_bus", ConnectionType::PubSub),
                connection("bus", "Status", "inproc://mgr_bus2", ConnectionType::PubSub),
            ],
        );

        assert!(manager
            .is_pubsub_connection(&ConnectionId::new("bus", "Data"))
            .unwrap());
        let types = manager.get_datatypes("bus");
        assert_eq!(types.len(), 2);
        assert!(types.contains("Data") && types.contains("Status"));

        manager.reset();
    }

    #[test]
    fn double_configure_and_duplicate_ids() {
        let _guard = GLOBAL_LOCK.lock();
        let manager = NetworkManager::get();
        configure(
            manager,
            vec![connection(
                "once",
                "Data",
                "inproc://mgr_once",
                ConnectionType::SendRecv,
            )],
        );
        assert!(matches!(
            manager.configure(vec![], false, Duration::from_secs(1)),
            Err(FabricError::AlreadyConfigured(_))
        ));

        manager.reset();
        assert!(matches!(
            manager.configure(
                vec![
                    connection("dup", "Data", "inproc://mgr_d1", ConnectionType::SendRecv),
                    connection("dup", "Data", "inproc://mgr_d2", ConnectionType::SendRecv),
                ],
                false,
                Duration::from_secs(1),
            ),
            Err(FabricError::NameCollision(_))
        ));

        manager.reset();
    }

    #[test]
    fn pubsub_receiver_waits_for_rewritten_publishers() {
        let _guard = GLOBAL_LOCK.lock();
        let manager = NetworkManager::get();
        configure(
            manager,
            vec![connection(
                "lazy_bus",
                "Data",
                "tcp://0.0.0.0:*",
                ConnectionType::PubSub,
            )],
        );

        // All publisher URIs still carry wildcards: not ready, not cached.
        let id = ConnectionId::new("lazy_bus", "Data");
        assert!(manager.get_receiver(&id).unwrap().is_none());
        assert!(manager.get_receiver(&id).unwrap().is_none());

        manager.reset();
    }
}
