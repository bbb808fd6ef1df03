//! # Typed Receive Models
//!
//! The [`Receiver`] contract mirrors the send side: a queue-backed model and
//! a network-backed model, both offering blocking `receive`, non-throwing
//! `try_receive`, and a callback mode where a per-handle worker polls the
//! backing source in small quanta and dispatches each message to the
//! installed function.
//!
//! ## Callback drain rule
//!
//! The worker loops while the callback is enabled **or** the last poll
//! yielded a message, so `remove_callback` drains everything already in the
//! pipeline before joining the worker. Exceptions from the plugin or the
//! decoder are logged and swallowed; the worker never dies.

use crate::config::ConnectionId;
use crate::defaults;
use crate::error::{FabricError, FabricResult};
use crate::network::transport::TransportReceiver;
use crate::network::NetworkManager;
use crate::queue::{Queue, QueueRegistry};
use crate::serialization::FabricMessage;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Message callback installed on a receiver.
pub type Callback<T> = Box<dyn FnMut(T) + Send>;

/// Typed receive half of a fabric connection.
pub trait Receiver<T: FabricMessage>: Send + Sync {
    fn id(&self) -> &ConnectionId;

    /// Block up to `timeout` for the next message.
    fn receive(&self, timeout: Duration) -> FabricResult<T>;

    /// Non-throwing receive: absent on timeout, logged error on anything
    /// harder.
    fn try_receive(&self, timeout: Duration) -> Option<T>;

    /// Install a callback worker dispatching every message to `callback`.
    /// Replaces any previously-installed callback.
    fn add_callback(&self, callback: Callback<T>) -> FabricResult<()>;

    /// Stop the callback worker after draining the pipeline. Idempotent.
    fn remove_callback(&self);

    /// Add a topic subscription. No-op for queue receivers.
    fn subscribe(&self, _topic: &str) -> FabricResult<()> {
        Ok(())
    }

    /// Remove a topic subscription. No-op for queue receivers.
    fn unsubscribe(&self, _topic: &str) -> FabricResult<()> {
        Ok(())
    }
}

impl<T: FabricMessage> std::fmt::Debug for dyn Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver").field("id", self.id()).finish()
    }
}

/// Receive model backed by a registry queue.
pub struct QueueReceiverModel<T: FabricMessage> {
    id: ConnectionId,
    queue: Arc<dyn Queue<T>>,
    with_callback: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: FabricMessage> QueueReceiverModel<T> {
    /// Fails with *cross-session* when the queue is declared for a different
    /// session than the caller's, and with the registry's errors when the
    /// queue cannot be materialized.
    pub fn new(id: ConnectionId) -> FabricResult<Self> {
        if let Some(config) = QueueRegistry::get().queue_config(&id.uid) {
            let declared = &config.id.session;
            if !declared.is_empty() && !id.session.is_empty() && declared != &id.session {
                return Err(FabricError::CrossSession {
                    queue: id.uid.clone(),
                    queue_session: declared.clone(),
                    caller_session: id.session.clone(),
                });
            }
        }

        let queue = QueueRegistry::get().get_queue::<T>(&id.uid)?;
        debug!("QueueReceiverModel created for {}", id);
        Ok(QueueReceiverModel {
            id,
            queue,
            with_callback: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }
}

impl<T: FabricMessage> Receiver<T> for QueueReceiverModel<T> {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn receive(&self, timeout: Duration) -> FabricResult<T> {
        if self.with_callback.load(Ordering::SeqCst) {
            return Err(FabricError::CallbackConflict(self.id.uid.clone()));
        }
        self.queue.pop(timeout).map_err(FabricError::from)
    }

    fn try_receive(&self, timeout: Duration) -> Option<T> {
        if self.with_callback.load(Ordering::SeqCst) {
            error!(
                "receiver for {} is equipped with a callback; ignoring receive call",
                self.id.uid
            );
            return None;
        }
        self.queue.poll(timeout)
    }

    fn add_callback(&self, mut callback: Callback<T>) -> FabricResult<()> {
        self.remove_callback();
        debug!("registering callback on {}", self.id);

        let mut worker = self.worker.lock();
        self.with_callback.store(true, Ordering::SeqCst);
        let enabled = Arc::clone(&self.with_callback);
        let queue = Arc::clone(&self.queue);
        *worker = Some(std::thread::spawn(move || loop {
            let message = queue.poll(defaults::QUEUE_CALLBACK_QUANTUM);
            let got = message.is_some();
            if let Some(message) = message {
                callback(message);
            }
            if !enabled.load(Ordering::SeqCst) && !got {
                break;
            }
        }));
        Ok(())
    }

    fn remove_callback(&self) {
        let mut worker = self.worker.lock();
        self.with_callback.store(false, Ordering::SeqCst);
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                warn!("callback worker for {} panicked", self.id.uid);
            }
        }
    }
}

impl<T: FabricMessage> Drop for QueueReceiverModel<T> {
    fn drop(&mut self) {
        self.remove_callback();
    }
}

/// Plugin acquisition and decode, shared between the model's direct calls
/// and its callback worker.
struct NetReceiverCore<T> {
    id: ConnectionId,
    /// Plugin slot; the mutex also serializes concurrent receives.
    plugin: Mutex<Option<Arc<dyn TransportReceiver>>>,
    _element: PhantomData<fn() -> T>,
}

impl<T: FabricMessage> NetReceiverCore<T> {
    /// Ask the network manager for the plugin, retrying until `timeout`.
    fn acquire(
        &self,
        slot: &mut Option<Arc<dyn TransportReceiver>>,
        timeout: Duration,
    ) {
        let deadline = Instant::now() + timeout;
        while slot.is_none() {
            match NetworkManager::get().get_receiver(&self.id) {
                Ok(Some(plugin)) => {
                    *slot = Some(plugin);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("receiver resolution for {} failed: {}", self.id, e);
                }
            }
            if Instant::now() >= deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn read(&self, timeout: Duration) -> FabricResult<T> {
        let mut slot = self.plugin.lock();
        self.acquire(&mut slot, timeout);
        let plugin = match slot.clone() {
            Some(plugin) => plugin,
            None => return Err(FabricError::InstanceNotFound(self.id.uid.clone())),
        };

        match plugin.receive(timeout) {
            Ok(bytes) => Ok(T::from_bytes(&bytes)?),
            Err(e) if e.is_timeout() => Err(FabricError::timeout(
                self.id.uid.clone(),
                "receive",
                timeout.as_millis(),
            )),
            Err(e) => Err(FabricError::OperationFailed(e.to_string())),
        }
    }

    /// Silent on timeout, logged on anything else.
    fn try_read(&self, timeout: Duration) -> Option<T> {
        match self.read(timeout) {
            Ok(message) => Some(message),
            Err(e) if e.is_timeout() => None,
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }
}

/// Receive model backed by a transport plugin.
pub struct NetworkReceiverModel<T: FabricMessage> {
    core: Arc<NetReceiverCore<T>>,
    with_callback: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: FabricMessage> NetworkReceiverModel<T> {
    pub fn new(id: ConnectionId) -> Self {
        debug!("NetworkReceiverModel created for {}", id);
        let core = Arc::new(NetReceiverCore {
            id,
            plugin: Mutex::new(None),
            _element: PhantomData,
        });
        {
            let mut slot = core.plugin.lock();
            core.acquire(&mut slot, defaults::INITIAL_RESOLUTION_TIMEOUT);
            if slot.is_none() {
                warn!("initial connection attempt failed for {}", core.id);
            }
        }
        NetworkReceiverModel {
            core,
            with_callback: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    fn subscriber_op(
        &self,
        topic: &str,
        subscribe: bool,
    ) -> FabricResult<()> {
        if !NetworkManager::get().is_pubsub_connection(&self.core.id)? {
            return Ok(());
        }
        let subscriber = NetworkManager::get()
            .get_subscriber(&self.core.id)
            .ok_or_else(|| FabricError::InstanceNotFound(self.core.id.uid.clone()))?;
        let result = if subscribe {
            subscriber.subscribe(topic)
        } else {
            subscriber.unsubscribe(topic)
        };
        result.map_err(|e| FabricError::OperationFailed(e.to_string()))
    }
}

impl<T: FabricMessage> Receiver<T> for NetworkReceiverModel<T> {
    fn id(&self) -> &ConnectionId {
        &self.core.id
    }

    fn receive(&self, timeout: Duration) -> FabricResult<T> {
        self.core.read(timeout)
    }

    fn try_receive(&self, timeout: Duration) -> Option<T> {
        self.core.try_read(timeout)
    }

    fn add_callback(&self, mut callback: Callback<T>) -> FabricResult<()> {
        if !T::is_serializable() {
            return Err(FabricError::Codec(
                crate::serialization::CodecError::NotSerializable(T::data_type()),
            ));
        }

        self.remove_callback();
        debug!("registering callback on {}", self.core.id);

        let mut worker = self.worker.lock();
        self.with_callback.store(true, Ordering::SeqCst);
        let enabled = Arc::clone(&self.with_callback);
        let core = Arc::clone(&self.core);
        *worker = Some(std::thread::spawn(move || loop {
            let message = core.try_read(defaults::NETWORK_CALLBACK_QUANTUM);
            let got = message.is_some();
            if let Some(message) = message {
                callback(message);
            }
            if !enabled.load(Ordering::SeqCst) && !got {
                break;
            }
        }));
        Ok(())
    }

    fn remove_callback(&self) {
        let mut worker = self.worker.lock();
        self.with_callback.store(false, Ordering::SeqCst);
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                warn!("callback worker for {} panicked", self.core.id.uid);
            }
        }
    }

    fn subscribe(&self, topic: &str) -> FabricResult<()> {
        self.subscriber_op(topic, true)
    }

    fn unsubscribe(&self, topic: &str) -> FabricResult<()> {
        self.subscriber_op(topic, false)
    }
}

impl<T: FabricMessage> Drop for NetworkReceiverModel<T> {
    fn drop(&mut self) {
        self.remove_callback();
    }
}
