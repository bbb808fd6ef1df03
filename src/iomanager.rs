//! # IO Manager Façade
//!
//! The single entry point user code talks to. A lookup classifies the
//! connection as queue-backed (declared in the queue catalog) or
//! network-backed, builds the matching typed model, and caches it: at most
//! one sender and one receiver per [`ConnectionId`], per process.
//!
//! Every typed lookup first checks that the id's `data_type` matches the
//! payload type's `data_type()`, then defaults an empty session to the
//! process-wide session set at [`IOManager::configure`].

use crate::config::{Connection, ConnectionId, QueueConfig};
use crate::error::{FabricError, FabricResult};
use crate::network::NetworkManager;
use crate::queue::QueueRegistry;
use crate::receiver::{
    Callback, NetworkReceiverModel, QueueReceiverModel, Receiver,
};
use crate::sender::{NetworkSenderModel, QueueSenderModel, Sender};
use crate::serialization::FabricMessage;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

type HandleCache = Mutex<HashMap<ConnectionId, Box<dyn Any + Send + Sync>>>;

pub struct IOManager {
    session: Mutex<String>,
    senders: HandleCache,
    receivers: HandleCache,
}

static INSTANCE: OnceLock<IOManager> = OnceLock::new();

impl IOManager {
    pub fn get() -> &'static IOManager {
        INSTANCE.get_or_init(|| IOManager {
            session: Mutex::new(String::new()),
            senders: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
        })
    }

    /// Configure the whole fabric: queue catalog, connection table, optional
    /// directory client, and the process-wide session.
    pub fn configure(
        &self,
        queues: Vec<QueueConfig>,
        connections: Vec<Connection>,
        use_directory: bool,
        publish_interval: Duration,
        session: impl Into<String>,
    ) -> FabricResult<()> {
        QueueRegistry::get().configure(queues)?;
        NetworkManager::get().configure(connections, use_directory, publish_interval)?;
        *self.session.lock() = session.into();
        Ok(())
    }

    /// Tear down handles first (draining their callback workers), then the
    /// managers underneath. Idempotent.
    pub fn reset(&self) {
        self.receivers.lock().clear();
        self.senders.lock().clear();
        NetworkManager::get().reset();
        QueueRegistry::get().reset();
        self.session.lock().clear();
    }

    /// The process-wide session used to default unscoped ids.
    pub fn session(&self) -> String {
        self.session.lock().clone()
    }

    /// Typed sender for `id`, from cache or freshly constructed.
    pub fn get_sender<T: FabricMessage>(
        &self,
        id: ConnectionId,
    ) -> FabricResult<Arc<dyn Sender<T>>> {
        let id = self.qualify::<T>(id)?;

        let mut senders = self.senders.lock();
        if let Some(handle) = senders.get(&id) {
            return downcast_handle::<dyn Sender<T>>(handle.as_ref(), &id);
        }

        let sender: Arc<dyn Sender<T>> =
            if QueueRegistry::get().has_queue(&id.uid, &id.data_type) {
                debug!("creating QueueSenderModel for {}", id);
                Arc::new(QueueSenderModel::<T>::new(id.clone())?)
            } else {
                debug!("creating NetworkSenderModel for {}", id);
                Arc::new(NetworkSenderModel::<T>::new(id.clone()))
            };
        senders.insert(id, Box::new(Arc::clone(&sender)));
        Ok(sender)
    }

    /// Typed receiver for `id`, from cache or freshly constructed.
    pub fn get_receiver<T: FabricMessage>(
        &self,
        id: ConnectionId,
    ) -> FabricResult<Arc<dyn Receiver<T>>> {
        let id = self.qualify::<T>(id)?;

        let mut receivers = self.receivers.lock();
        if let Some(handle) = receivers.get(&id) {
            return downcast_handle::<dyn Receiver<T>>(handle.as_ref(), &id);
        }

        let receiver: Arc<dyn Receiver<T>> =
            if QueueRegistry::get().has_queue(&id.uid, &id.data_type) {
                debug!("creating QueueReceiverModel for {}", id);
                Arc::new(QueueReceiverModel::<T>::new(id.clone())?)
            } else {
                debug!("creating NetworkReceiverModel for {}", id);
                Arc::new(NetworkReceiverModel::<T>::new(id.clone()))
            };
        receivers.insert(id, Box::new(Arc::clone(&receiver)));
        Ok(receiver)
    }

    /// Sender addressed by bare uid; the data type comes from `T` and the
    /// session from the process.
    pub fn get_sender_by_uid<T: FabricMessage>(
        &self,
        uid: &str,
    ) -> FabricResult<Arc<dyn Sender<T>>> {
        self.get_sender(ConnectionId::new(uid, T::data_type()))
    }

    /// Receiver addressed by bare uid.
    pub fn get_receiver_by_uid<T: FabricMessage>(
        &self,
        uid: &str,
    ) -> FabricResult<Arc<dyn Receiver<T>>> {
        self.get_receiver(ConnectionId::new(uid, T::data_type()))
    }

    /// Shorthand: install a callback on the receiver for `id`.
    pub fn add_callback<T: FabricMessage>(
        &self,
        id: ConnectionId,
        callback: impl FnMut(T) + Send + 'static,
    ) -> FabricResult<()> {
        self.get_receiver::<T>(id)?
            .add_callback(Box::new(callback) as Callback<T>)
    }

    /// Shorthand: remove the callback from the receiver for `id`.
    pub fn remove_callback<T: FabricMessage>(&self, id: ConnectionId) -> FabricResult<()> {
        self.get_receiver::<T>(id)?.remove_callback();
        Ok(())
    }

    /// Check the compile-time data type against the id and default the
    /// session.
    fn qualify<T: FabricMessage>(&self, mut id: ConnectionId) -> FabricResult<ConnectionId> {
        if id.data_type != T::data_type() {
            return Err(FabricError::TypeMismatch {
                name: id.uid,
                requested: T::data_type().to_string(),
                bound: id.data_type,
            });
        }
        if id.session.is_empty() {
            id.session = self.session();
        }
        Ok(id)
    }
}

fn downcast_handle<H: ?Sized + 'static>(
    handle: &(dyn Any + Send + Sync),
    id: &ConnectionId,
) -> FabricResult<Arc<H>> {
    handle
        .downcast_ref::<Arc<H>>()
        .cloned()
        .ok_or_else(|| FabricError::TypeMismatch {
            name: id.uid.clone(),
            requested: std::any::type_name::<H>().to_string(),
            bound: "previously cached handle".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionType, QueueType};
    use crate::test_support::GLOBAL_LOCK;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn queue_config(uid: &str, data_type: &str, queue_type: QueueType) -> QueueConfig {
        QueueConfig {
            id: ConnectionId::new(uid, data_type),
            queue_type,
            capacity: 10,
        }
    }

    fn setup(queues: Vec<QueueConfig>, connections: Vec<Connection>, session: &str) {
        let iom = IOManager::get();
        iom.reset();
        iom.configure(queues, connections, false, Duration::from_millis(100), session)
            .unwrap();
    }

    #[test]
    fn data_type_mismatch_is_rejected_up_front() {
        let _guard = GLOBAL_LOCK.lock();
        setup(vec![], vec![], "s");

        let err = IOManager::get()
            .get_sender::<i32>(ConnectionId::new("x", "string"))
            .unwrap_err();
        assert!(matches!(err, FabricError::TypeMismatch { .. }));

        IOManager::get().reset();
    }

    #[test]
    fn queue_backed_round_trip_with_cached_handles() {
        let _guard = GLOBAL_LOCK.lock();
        setup(
            vec![queue_config("facade_q", "int", QueueType::Spsc)],
            vec![],
            "s",
        );
        let iom = IOManager::get();

        let tx = iom
            .get_sender::<i32>(ConnectionId::new("facade_q", "int"))
            .unwrap();
        let rx = iom
            .get_receiver::<i32>(ConnectionId::new("facade_q", "int"))
            .unwrap();
        tx.send(42, TIMEOUT).unwrap();
        assert_eq!(rx.receive(TIMEOUT).unwrap(), 42);

        let tx2 = iom
            .get_sender::<i32>(ConnectionId::new("facade_q", "int"))
            .unwrap();
        assert!(Arc::ptr_eq(&tx, &tx2), "handles are cached");

        iom.reset();
    }

    #[test]
    fn network_backed_round_trip_over_inproc() {
        let _guard = GLOBAL_LOCK.lock();
        setup(
            vec![],
            vec![Connection {
                id: ConnectionId::new("facade_net", "string"),
                uri: "inproc://facade_net".to_string(),
                connection_type: ConnectionType::SendRecv,
            }],
            "s",
        );
        let iom = IOManager::get();

        let rx = iom.get_receiver_by_uid::<String>("facade_net").unwrap();
        let tx = iom.get_sender_by_uid::<String>("facade_net").unwrap();
        tx.send("ping".to_string(), TIMEOUT).unwrap();
        assert_eq!(rx.receive(TIMEOUT).unwrap(), "ping");

        iom.reset();
    }

    #[test]
    fn cross_session_queue_access_is_rejected() {
        let _guard = GLOBAL_LOCK.lock();
        setup(
            vec![QueueConfig {
                id: ConnectionId::with_session("scoped_q", "int", "theirs"),
                queue_type: QueueType::Deque,
                capacity: 4,
            }],
            vec![],
            "ours",
        );

        let err = IOManager::get()
            .get_receiver::<i32>(ConnectionId::new("scoped_q", "int"))
            .unwrap_err();
        assert!(matches!(err, FabricError::CrossSession { .. }));

        IOManager::get().reset();
    }

    #[test]
    fn callback_conflict_on_direct_receive() {
        let _guard = GLOBAL_LOCK.lock();
        setup(
            vec![queue_config("cb_q", "int", QueueType::Deque)],
            vec![],
            "s",
        );
        let iom = IOManager::get();
        let id = ConnectionId::new("cb_q", "int");

        iom.add_callback::<i32>(id.clone(), |_| {}).unwrap();
        let rx = iom.get_receiver::<i32>(id.clone()).unwrap();
        assert!(matches!(
            rx.receive(TIMEOUT).unwrap_err(),
            FabricError::CallbackConflict(_)
        ));

        iom.remove_callback::<i32>(id.clone()).unwrap();
        // Idempotent.
        iom.remove_callback::<i32>(id).unwrap();

        iom.reset();
    }

    #[test]
    fn reset_is_idempotent_and_allows_reconfigure() {
        let _guard = GLOBAL_LOCK.lock();
        setup(
            vec![queue_config("reset_q", "int", QueueType::Mpmc)],
            vec![],
            "s",
        );
        let iom = IOManager::get();
        iom.get_sender::<i32>(ConnectionId::new("reset_q", "int"))
            .unwrap();

        iom.reset();
        iom.reset();

        setup(
            vec![queue_config("reset_q", "int", QueueType::Mpmc)],
            vec![],
            "s2",
        );
        assert_eq!(iom.session(), "s2");
        iom.reset();
    }
}
