//! # Typed Send Models
//!
//! The [`Sender`] contract is implemented twice: once over a registry queue
//! (intra-process) and once over a network transport plugin (inter-process).
//! Both move the value in, fail blocking sends with *timeout-expired* at the
//! deadline, and offer a non-throwing `try_send`.
//!
//! The network model owns the reconnection policy: the very first send
//! extends its timeout to at least one second to tolerate initial address
//! resolution, and a send timeout invalidates both the local plugin pointer
//! and the network manager's cache so the next send reconnects.

use crate::config::ConnectionId;
use crate::defaults;
use crate::error::{FabricError, FabricResult};
use crate::network::transport::TransportSender;
use crate::network::NetworkManager;
use crate::queue::{Queue, QueueRegistry};
use crate::serialization::FabricMessage;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Typed send half of a fabric connection.
pub trait Sender<T: FabricMessage>: Send + Sync {
    fn id(&self) -> &ConnectionId;

    /// Move `value` to the peer, failing with *timeout-expired* at the
    /// deadline.
    fn send(&self, value: T, timeout: Duration) -> FabricResult<()>;

    /// Non-throwing send: logs the failure and reports it as `false`.
    fn try_send(&self, value: T, timeout: Duration) -> bool;
}

impl<T: FabricMessage> std::fmt::Debug for dyn Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender").field("id", self.id()).finish()
    }
}

/// Send model backed by a registry queue.
pub struct QueueSenderModel<T: FabricMessage> {
    id: ConnectionId,
    queue: Arc<dyn Queue<T>>,
}

impl<T: FabricMessage> QueueSenderModel<T> {
    pub fn new(id: ConnectionId) -> FabricResult<Self> {
        let queue = QueueRegistry::get().get_queue::<T>(&id.uid)?;
        debug!("QueueSenderModel created for {}", id);
        Ok(QueueSenderModel { id, queue })
    }
}

impl<T: FabricMessage> Sender<T> for QueueSenderModel<T> {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, value: T, timeout: Duration) -> FabricResult<()> {
        self.queue.push(value, timeout).map_err(FabricError::from)
    }

    fn try_send(&self, value: T, timeout: Duration) -> bool {
        self.queue.try_push(value, timeout)
    }
}

struct NetSenderState {
    plugin: Option<Arc<dyn TransportSender>>,
    topic: String,
    first_send: bool,
}

/// Send model backed by a transport plugin.
///
/// The state mutex doubles as the per-handle send serializer, so concurrent
/// sends on one handle are ordered and the reconnect bookkeeping stays
/// consistent.
pub struct NetworkSenderModel<T: FabricMessage> {
    id: ConnectionId,
    state: Mutex<NetSenderState>,
    _element: PhantomData<fn(T)>,
}

impl<T: FabricMessage> NetworkSenderModel<T> {
    pub fn new(id: ConnectionId) -> Self {
        debug!("NetworkSenderModel created for {}", id);
        let model = NetworkSenderModel {
            id,
            state: Mutex::new(NetSenderState {
                plugin: None,
                topic: String::new(),
                first_send: true,
            }),
            _element: PhantomData,
        };
        {
            let mut state = model.state.lock();
            model.acquire(&mut state, defaults::INITIAL_RESOLUTION_TIMEOUT);
            if state.plugin.is_none() {
                warn!("initial connection attempt failed for {}", model.id);
            }
        }
        model
    }

    /// Ask the network manager for the plugin, retrying until `timeout`.
    /// "Not ready" and resolution errors both back off briefly; the first
    /// attempt always happens even with a zero timeout.
    fn acquire(&self, state: &mut NetSenderState, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while state.plugin.is_none() {
            match NetworkManager::get().get_sender(&self.id) {
                Ok(Some(plugin)) => {
                    state.plugin = Some(plugin);
                    match NetworkManager::get().is_pubsub_connection(&self.id) {
                        Ok(true) => {
                            debug!("setting topic to {}", self.id.data_type);
                            state.topic = self.id.data_type.clone();
                        }
                        Ok(false) => {}
                        Err(e) => debug!("pub-sub check for {} failed: {}", self.id, e),
                    }
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("sender resolution for {} failed: {}", self.id, e);
                }
            }
            if Instant::now() >= deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn extend_first_timeout(state: &mut NetSenderState, timeout: Duration) -> Duration {
        if state.first_send {
            state.first_send = false;
            return timeout.max(defaults::MIN_FIRST_SEND_TIMEOUT);
        }
        timeout
    }

    /// Invalidate the cached plugin here and in the manager; the next send
    /// reconnects from scratch. Our own state lock is held, the manager's
    /// map lock is not.
    fn invalidate(&self, state: &mut NetSenderState) {
        debug!("timeout detected, removing sender to re-acquire connection");
        state.plugin = None;
        NetworkManager::get().remove_sender(&self.id);
    }

    fn write(&self, value: &T, timeout: Duration) -> FabricResult<()> {
        let mut state = self.state.lock();
        self.acquire(&mut state, timeout);
        let plugin = match state.plugin.clone() {
            Some(plugin) => plugin,
            None => {
                return Err(FabricError::timeout(
                    self.id.uid.clone(),
                    "send",
                    timeout.as_millis(),
                ))
            }
        };

        let bytes = value.to_bytes()?;
        let effective = Self::extend_first_timeout(&mut state, timeout);
        match plugin.send(&bytes, effective, &state.topic) {
            Ok(()) => Ok(()),
            Err(e) if e.is_timeout() => {
                self.invalidate(&mut state);
                Err(FabricError::timeout(
                    self.id.uid.clone(),
                    "send",
                    timeout.as_millis(),
                ))
            }
            Err(e) => Err(FabricError::OperationFailed(e.to_string())),
        }
    }
}

impl<T: FabricMessage> Sender<T> for NetworkSenderModel<T> {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, value: T, timeout: Duration) -> FabricResult<()> {
        self.write(&value, timeout)
    }

    fn try_send(&self, value: T, timeout: Duration) -> bool {
        match self.write(&value, timeout) {
            Ok(()) => true,
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }
}
