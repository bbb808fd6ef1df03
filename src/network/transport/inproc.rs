//! In-process transport.
//!
//! Endpoints live in a process-global hub keyed by the `inproc://<name>`
//! address. Point-to-point endpoints are a single bounded channel shared by
//! whichever side arrives first; pub-sub endpoints are a fan-out bus owned by
//! the publisher, where each subscriber registers its own bounded channel and
//! topic set. Topic filtering uses prefix matching, so subscribing to the
//! empty string receives everything.
//!
//! Delivery to a pub-sub subscriber whose channel is full is dropped (the
//! fabric is best-effort); point-to-point sends block up to the caller's
//! timeout, which is what backs the sender reconnect path in tests.

use super::{
    ConnectSpec, PluginRole, ReceiverPlugin, TransportError, TransportReceiver, TransportSender,
    TransportSubscriber, Uri,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

/// Depth of every in-process endpoint channel.
const ENDPOINT_DEPTH: usize = 1024;

struct SubscriberSlot {
    owner: u64,
    topics: Arc<Mutex<HashSet<String>>>,
    tx: Sender<Vec<u8>>,
}

enum Endpoint {
    PointToPoint {
        tx: Sender<Vec<u8>>,
        rx: Receiver<Vec<u8>>,
    },
    PubSub {
        subscribers: Vec<SubscriberSlot>,
    },
}

struct Hub {
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

static HUB: OnceLock<Hub> = OnceLock::new();
static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

fn hub() -> &'static Hub {
    HUB.get_or_init(|| Hub {
        endpoints: Mutex::new(HashMap::new()),
    })
}

fn endpoint_name(uri: &str) -> Result<String, TransportError> {
    let parsed = Uri::parse(uri)?;
    if parsed.scheme != "inproc" {
        return Err(TransportError::BadUri(uri.to_string()));
    }
    Ok(parsed.host)
}

/// Get or create the point-to-point channel for `name`.
fn point_to_point(name: &str) -> Result<(Sender<Vec<u8>>, Receiver<Vec<u8>>), TransportError> {
    let mut endpoints = hub().endpoints.lock();
    let entry = endpoints.entry(name.to_string()).or_insert_with(|| {
        let (tx, rx) = channel::bounded(ENDPOINT_DEPTH);
        Endpoint::PointToPoint { tx, rx }
    });
    match entry {
        Endpoint::PointToPoint { tx, rx } => Ok((tx.clone(), rx.clone())),
        Endpoint::PubSub { .. } => Err(TransportError::Unsupported(
            "endpoint is bound as a pub-sub bus",
        )),
    }
}

pub(super) fn make_sender(role: PluginRole) -> Arc<dyn TransportSender> {
    match role {
        PluginRole::Publisher => Arc::new(InprocPublisher::default()),
        _ => Arc::new(InprocSender::default()),
    }
}

pub(super) fn make_receiver(role: PluginRole) -> ReceiverPlugin {
    match role {
        PluginRole::Subscriber => {
            let subscriber = Arc::new(InprocSubscriber::new());
            ReceiverPlugin {
                receiver: subscriber.clone(),
                subscriber: Some(subscriber),
            }
        }
        _ => ReceiverPlugin {
            receiver: Arc::new(InprocReceiver::default()),
            subscriber: None,
        },
    }
}

/// Point-to-point send side.
#[derive(Default)]
struct InprocSender {
    target: Mutex<Option<(String, Sender<Vec<u8>>)>>,
}

impl TransportSender for InprocSender {
    fn connect_for_sends(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        let uri = spec.uris().first().cloned().unwrap_or_default();
        let name = endpoint_name(&uri)?;
        let (tx, _) = point_to_point(&name)?;
        *self.target.lock() = Some((name, tx));
        Ok(uri)
    }

    fn send(&self, data: &[u8], timeout: Duration, _topic: &str) -> Result<(), TransportError> {
        let tx = {
            let target = self.target.lock();
            match target.as_ref() {
                Some((_, tx)) => tx.clone(),
                None => return Err(TransportError::NotConnected("inproc sender".to_string())),
            }
        };
        match tx.send_timeout(data.to_vec(), timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(TransportError::SendTimeout {
                timeout_ms: timeout.as_millis(),
            }),
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(TransportError::NotConnected("endpoint closed".to_string()))
            }
        }
    }
}

/// Point-to-point receive side.
#[derive(Default)]
struct InprocReceiver {
    source: Mutex<Option<Receiver<Vec<u8>>>>,
}

impl TransportReceiver for InprocReceiver {
    fn connect_for_receives(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        let uri = spec.uris().first().cloned().unwrap_or_default();
        let name = endpoint_name(&uri)?;
        let (_, rx) = point_to_point(&name)?;
        *self.source.lock() = Some(rx);
        Ok(uri)
    }

    fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let rx = {
            let source = self.source.lock();
            match source.as_ref() {
                Some(rx) => rx.clone(),
                None => return Err(TransportError::NotConnected("inproc receiver".to_string())),
            }
        };
        match rx.recv_timeout(timeout) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::ReceiveTimeout {
                timeout_ms: timeout.as_millis(),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::NotConnected("endpoint closed".to_string()))
            }
        }
    }
}

/// Fan-out publish side. Binds the bus; subscribers attach their own slots.
#[derive(Default)]
struct InprocPublisher {
    bus: Mutex<Option<String>>,
}

impl TransportSender for InprocPublisher {
    fn connect_for_sends(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        let uri = spec.uris().first().cloned().unwrap_or_default();
        let name = endpoint_name(&uri)?;
        let mut endpoints = hub().endpoints.lock();
        match endpoints
            .entry(name.clone())
            .or_insert_with(|| Endpoint::PubSub {
                subscribers: Vec::new(),
            }) {
            Endpoint::PubSub { .. } => {}
            Endpoint::PointToPoint { .. } => {
                return Err(TransportError::Unsupported(
                    "endpoint is bound as point-to-point",
                ))
            }
        }
        drop(endpoints);
        *self.bus.lock() = Some(name);
        Ok(uri)
    }

    fn send(&self, data: &[u8], _timeout: Duration, topic: &str) -> Result<(), TransportError> {
        let name = match self.bus.lock().clone() {
            Some(name) => name,
            None => return Err(TransportError::NotConnected("inproc publisher".to_string())),
        };

        let mut endpoints = hub().endpoints.lock();
        let Some(Endpoint::PubSub { subscribers }) = endpoints.get_mut(&name) else {
            return Err(TransportError::NotConnected(name));
        };

        subscribers.retain(|slot| {
            let subscribed = slot
                .topics
                .lock()
                .iter()
                .any(|sub| topic.starts_with(sub.as_str()));
            if !subscribed {
                return true;
            }
            match slot.tx.try_send(data.to_vec()) {
                Ok(()) => true,
                Err(channel::TrySendError::Full(_)) => {
                    // Slow subscriber: best-effort drop.
                    debug!("dropping message for slow subscriber on '{}'", name);
                    true
                }
                Err(channel::TrySendError::Disconnected(_)) => false,
            }
        });
        Ok(())
    }
}

/// Subscribe side: one channel fed by every connected publisher bus.
struct InprocSubscriber {
    id: u64,
    topics: Arc<Mutex<HashSet<String>>>,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    connected: Mutex<HashSet<String>>,
}

impl InprocSubscriber {
    fn new() -> Self {
        let (tx, rx) = channel::bounded(ENDPOINT_DEPTH);
        InprocSubscriber {
            id: NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed),
            topics: Arc::new(Mutex::new(HashSet::new())),
            tx,
            rx,
            connected: Mutex::new(HashSet::new()),
        }
    }

    fn detach(&self, endpoints: &mut HashMap<String, Endpoint>, name: &str) {
        if let Some(Endpoint::PubSub { subscribers }) = endpoints.get_mut(name) {
            subscribers.retain(|slot| slot.owner != self.id);
        }
    }
}

impl TransportReceiver for InprocSubscriber {
    fn connect_for_receives(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        let mut wanted = HashSet::new();
        for uri in spec.uris() {
            wanted.insert(endpoint_name(uri)?);
        }

        let mut connected = self.connected.lock();
        let mut endpoints = hub().endpoints.lock();

        for name in connected.difference(&wanted).cloned().collect::<Vec<_>>() {
            self.detach(&mut endpoints, &name);
        }

        for name in &wanted {
            let entry = endpoints
                .entry(name.clone())
                .or_insert_with(|| Endpoint::PubSub {
                    subscribers: Vec::new(),
                });
            let Endpoint::PubSub { subscribers } = entry else {
                return Err(TransportError::Unsupported(
                    "endpoint is bound as point-to-point",
                ));
            };
            if !subscribers.iter().any(|slot| slot.owner == self.id) {
                subscribers.push(SubscriberSlot {
                    owner: self.id,
                    topics: Arc::clone(&self.topics),
                    tx: self.tx.clone(),
                });
            }
        }

        *connected = wanted;
        Ok(spec.uris().first().cloned().unwrap_or_default())
    }

    fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::ReceiveTimeout {
                timeout_ms: timeout.as_millis(),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::NotConnected("endpoint closed".to_string()))
            }
        }
    }
}

impl TransportSubscriber for InprocSubscriber {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.topics.lock().insert(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.topics.lock().remove(topic);
        Ok(())
    }
}

impl Drop for InprocSubscriber {
    fn drop(&mut self) {
        let connected = self.connected.lock().clone();
        let mut endpoints = hub().endpoints.lock();
        for name in connected {
            self.detach(&mut endpoints, &name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    fn sender_for(uri: &str) -> Arc<dyn TransportSender> {
        let sender = make_sender(PluginRole::Sender);
        sender.connect_for_sends(&ConnectSpec::single(uri)).unwrap();
        sender
    }

    fn receiver_for(uri: &str) -> Arc<dyn TransportReceiver> {
        let plugin = make_receiver(PluginRole::Receiver);
        plugin
            .receiver
            .connect_for_receives(&ConnectSpec::single(uri))
            .unwrap();
        plugin.receiver
    }

    #[test]
    fn point_to_point_loopback() {
        let rx = receiver_for("inproc://p2p_loopback");
        let tx = sender_for("inproc://p2p_loopback");

        tx.send(b"hello", SHORT, "").unwrap();
        assert_eq!(rx.receive(SHORT).unwrap(), b"hello");
        assert!(matches!(
            rx.receive(Duration::from_millis(5)),
            Err(TransportError::ReceiveTimeout { .. })
        ));
    }

    #[test]
    fn full_endpoint_times_out_the_sender() {
        let _rx = receiver_for("inproc://p2p_full");
        let tx = sender_for("inproc://p2p_full");

        for _ in 0..ENDPOINT_DEPTH {
            tx.send(b"x", SHORT, "").unwrap();
        }
        assert!(matches!(
            tx.send(b"x", Duration::from_millis(5), ""),
            Err(TransportError::SendTimeout { .. })
        ));
    }

    #[test]
    fn pubsub_fan_out_in_publish_order() {
        let publisher = make_sender(PluginRole::Publisher);
        publisher
            .connect_for_sends(&ConnectSpec::single("inproc://bus_fanout"))
            .unwrap();

        let mut subs = Vec::new();
        for _ in 0..3 {
            let plugin = make_receiver(PluginRole::Subscriber);
            let sub = plugin.subscriber.unwrap();
            sub.subscribe("Data").unwrap();
            sub.connect_for_receives(&ConnectSpec::multi(vec!["inproc://bus_fanout".into()]))
                .unwrap();
            subs.push(sub);
        }

        for i in 0..50u8 {
            publisher.send(&[i], SHORT, "Data").unwrap();
        }

        for sub in &subs {
            for i in 0..50u8 {
                assert_eq!(sub.receive(SHORT).unwrap(), vec![i]);
            }
        }
    }

    #[test]
    fn topic_filter_is_prefix_based() {
        let publisher = make_sender(PluginRole::Publisher);
        publisher
            .connect_for_sends(&ConnectSpec::single("inproc://bus_topics"))
            .unwrap();

        let plugin = make_receiver(PluginRole::Subscriber);
        let sub = plugin.subscriber.unwrap();
        sub.subscribe("Data").unwrap();
        sub.connect_for_receives(&ConnectSpec::multi(vec!["inproc://bus_topics".into()]))
            .unwrap();

        publisher.send(b"keep", SHORT, "DataExtended").unwrap();
        publisher.send(b"drop", SHORT, "Other").unwrap();

        assert_eq!(sub.receive(SHORT).unwrap(), b"keep");
        assert!(sub.receive(Duration::from_millis(5)).is_err());

        sub.unsubscribe("Data").unwrap();
        publisher.send(b"gone", SHORT, "Data").unwrap();
        assert!(sub.receive(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn refresh_drops_vanished_publishers() {
        let pub_a = make_sender(PluginRole::Publisher);
        pub_a
            .connect_for_sends(&ConnectSpec::single("inproc://bus_churn_a"))
            .unwrap();
        let pub_b = make_sender(PluginRole::Publisher);
        pub_b
            .connect_for_sends(&ConnectSpec::single("inproc://bus_churn_b"))
            .unwrap();

        let plugin = make_receiver(PluginRole::Subscriber);
        let sub = plugin.subscriber.unwrap();
        sub.subscribe("").unwrap();
        sub.connect_for_receives(&ConnectSpec::multi(vec![
            "inproc://bus_churn_a".into(),
            "inproc://bus_churn_b".into(),
        ]))
        .unwrap();

        pub_a.send(b"a", SHORT, "t").unwrap();
        pub_b.send(b"b", SHORT, "t").unwrap();
        assert!(sub.receive(SHORT).is_ok());
        assert!(sub.receive(SHORT).is_ok());

        // Publisher b vanished from the resolved list.
        sub.connect_for_receives(&ConnectSpec::multi(vec!["inproc://bus_churn_a".into()]))
            .unwrap();
        pub_b.send(b"b2", SHORT, "t").unwrap();
        assert!(sub.receive(Duration::from_millis(5)).is_err());
        pub_a.send(b"a2", SHORT, "t").unwrap();
        assert_eq!(sub.receive(SHORT).unwrap(), b"a2");
    }
}
