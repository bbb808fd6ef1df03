//! # Connectivity Directory Client
//!
//! Advertises locally-owned endpoints to a remote HTTP registry and resolves
//! peers from it. A dedicated worker republishes the full registration set
//! every publish interval; the republish doubles as the server-side
//! heartbeat, so a registration that stops being refreshed is reaped by the
//! server. Publish failures are logged warnings; the worker never dies.
//!
//! The wire protocol is HTTP 1.1 with JSON bodies:
//!
//! - `POST /getconnection/<session>` with `{ uid_regex, data_type }` returns
//!   an array of `{ uid, data_type, uri, connection_type }`.
//! - `POST /publish` with `{ partition, connections: [...] }`.
//! - `POST /retract` with `{ partition, connections: [ { connection_id,
//!   data_type } ] }`.
//!
//! The scoping session is read from the `DUNEDAQ_PARTITION` environment
//! variable; constructing a client without it is an error.

use crate::config::{Connection, ConnectionId, ConnectionType};
use crate::error::{FabricError, FabricResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Environment variable naming the logical partition (session).
pub const PARTITION_ENV: &str = "DUNEDAQ_PARTITION";
/// Directory host override.
pub const SERVER_ENV: &str = "CONNECTION_SERVER";
/// Directory port override.
pub const PORT_ENV: &str = "CONNECTION_PORT";

/// Lookup request: `uid_regex` is matched by the server against registered
/// uids of the same data type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub uid_regex: String,
    pub data_type: String,
}

impl From<&ConnectionId> for ConnectionRequest {
    fn from(id: &ConnectionId) -> Self {
        ConnectionRequest {
            uid_regex: id.uid.clone(),
            data_type: id.data_type.clone(),
        }
    }
}

/// A remote endpoint as returned by a lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub uid: String,
    pub data_type: String,
    pub uri: String,
    pub connection_type: ConnectionType,
}

impl From<&Connection> for ConnectionInfo {
    fn from(conn: &Connection) -> Self {
        ConnectionInfo {
            uid: conn.id.uid.clone(),
            data_type: conn.id.data_type.clone(),
            uri: conn.uri.clone(),
            connection_type: conn.connection_type,
        }
    }
}

/// A locally-owned endpoint advertised to the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRegistration {
    pub uid: String,
    pub data_type: String,
    pub uri: String,
    pub connection_type: ConnectionType,
}

impl From<&ConnectionInfo> for ConnectionRegistration {
    fn from(info: &ConnectionInfo) -> Self {
        ConnectionRegistration {
            uid: info.uid.clone(),
            data_type: info.data_type.clone(),
            uri: info.uri.clone(),
            connection_type: info.connection_type,
        }
    }
}

/// Registrations coalesce on `(uid, data_type)`; a re-publish with a new URI
/// (wildcard rewrite) replaces the old entry.
type RegistrationKey = (String, String);

fn key_of(reg: &ConnectionRegistration) -> RegistrationKey {
    (reg.uid.clone(), reg.data_type.clone())
}

struct ClientShared {
    session: String,
    base_url: String,
    agent: ureq::Agent,
    active: AtomicBool,
    connected: AtomicBool,
    registered: Mutex<BTreeMap<RegistrationKey, ConnectionRegistration>>,
}

impl ClientShared {
    /// One publish tick: POST the whole registration set, refresh the TTL.
    fn publish_batch(&self) -> FabricResult<()> {
        let connections: Vec<ConnectionRegistration> =
            self.registered.lock().values().cloned().collect();
        if connections.is_empty() {
            return Ok(());
        }

        let body = json!({
            "partition": self.session,
            "connections": connections,
        });
        match self
            .agent
            .post(&format!("{}/publish", self.base_url))
            .send_json(body)
        {
            Ok(_) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(FabricError::PublishFailed(e.to_string()))
            }
        }
    }

    fn post_retract(&self, entries: &[(String, String)]) -> FabricResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let connections: Vec<serde_json::Value> = entries
            .iter()
            .map(|(uid, data_type)| {
                json!({ "connection_id": uid, "data_type": data_type })
            })
            .collect();
        let body = json!({
            "partition": self.session,
            "connections": connections,
        });
        self.agent
            .post(&format!("{}/retract", self.base_url))
            .send_json(body)
            .map_err(|e| FabricError::RetractFailed {
                what: format!("{} connections", entries.len()),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Client for the connectivity directory. Owns the publisher worker and the
/// set of currently-registered endpoints; dropping the client retracts
/// everything and joins the worker.
pub struct DirectoryClient {
    shared: Arc<ClientShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryClient")
            .field("session", &self.shared.session)
            .field("base_url", &self.shared.base_url)
            .finish()
    }
}

impl DirectoryClient {
    /// Connect to the directory at `server:port` and start the publisher
    /// worker. Reads the session from [`PARTITION_ENV`].
    pub fn new(server: &str, port: &str, publish_interval: Duration) -> FabricResult<Self> {
        let session =
            std::env::var(PARTITION_ENV).map_err(|_| FabricError::EnvNotFound(PARTITION_ENV))?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build();

        let shared = Arc::new(ClientShared {
            session,
            base_url: format!("http://{}:{}", server, port),
            agent,
            active: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            registered: Mutex::new(BTreeMap::new()),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                while shared.active.load(Ordering::SeqCst) {
                    if let Err(e) = shared.publish_batch() {
                        warn!("directory publish failed: {}", e);
                    }
                    // Sleep in slices so shutdown stays prompt.
                    let mut remaining = publish_interval;
                    while shared.active.load(Ordering::SeqCst) && !remaining.is_zero() {
                        let slice = remaining.min(Duration::from_millis(50));
                        std::thread::sleep(slice);
                        remaining = remaining.saturating_sub(slice);
                    }
                }
            })
        };

        Ok(DirectoryClient {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The session (partition) this client publishes under.
    pub fn session(&self) -> &str {
        &self.shared.session
    }

    /// Whether the last publish reached the server.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Add a registration to the local set; the worker emits it on the next
    /// tick. Registrations with the same `(uid, data_type)` coalesce.
    pub fn publish(&self, registration: ConnectionRegistration) {
        debug!(
            "registering {} ({}) at {} for publication",
            registration.uid, registration.data_type, registration.uri
        );
        self.shared
            .registered
            .lock()
            .insert(key_of(&registration), registration);
    }

    /// Batch form of [`DirectoryClient::publish`].
    pub fn publish_many(&self, registrations: Vec<ConnectionRegistration>) {
        let mut registered = self.shared.registered.lock();
        for registration in registrations {
            registered.insert(key_of(&registration), registration);
        }
    }

    /// Remove specific registrations and retract them immediately. Ids not
    /// in the local set are logged and skipped.
    pub fn retract(&self, ids: &[ConnectionId]) -> FabricResult<()> {
        let mut entries = Vec::new();
        {
            let mut registered = self.shared.registered.lock();
            for id in ids {
                let key = (id.uid.clone(), id.data_type.clone());
                if registered.remove(&key).is_some() {
                    entries.push(key);
                } else {
                    error!(
                        "cannot retract {} of type {}: not in registered connections list",
                        id.uid, id.data_type
                    );
                }
            }
        }
        self.shared.post_retract(&entries)
    }

    /// Remove and retract everything currently registered.
    pub fn retract_all(&self) -> FabricResult<()> {
        let entries: Vec<RegistrationKey> = {
            let mut registered = self.shared.registered.lock();
            let keys = registered.keys().cloned().collect();
            registered.clear();
            keys
        };
        self.shared.post_retract(&entries)
    }

    /// Synchronous lookup of endpoints matching `request` within `session`.
    pub fn resolve(
        &self,
        request: &ConnectionRequest,
        session: &str,
    ) -> FabricResult<Vec<ConnectionInfo>> {
        let session = if session.is_empty() {
            self.shared.session.as_str()
        } else {
            session
        };
        let target = format!("{}/getconnection/{}", self.shared.base_url, session);
        debug!(
            "looking up connections matching <{}> in session {}",
            request.uid_regex, session
        );

        let response = self
            .agent()
            .post(&target)
            .send_json(request)
            .map_err(|e| FabricError::LookupFailed {
                uid_regex: request.uid_regex.clone(),
                target: target.clone(),
                reason: e.to_string(),
            })?;

        response
            .into_json::<Vec<ConnectionInfo>>()
            .map_err(|e| FabricError::LookupFailed {
                uid_regex: request.uid_regex.clone(),
                target,
                reason: e.to_string(),
            })
    }

    fn agent(&self) -> &ureq::Agent {
        &self.shared.agent
    }
}

impl Drop for DirectoryClient {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        if let Err(e) = self.retract_all() {
            error!("{}", e);
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
