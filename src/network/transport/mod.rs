//! # Transport Plugin Contract
//!
//! The fabric core drives wire transports through a narrow interface: a
//! sender-side trait, a receiver-side trait, and a subscriber extension for
//! topic-filtered reception. Plugins are created by a factory keyed on the
//! URI scheme and the abstract role, connected once by the network manager,
//! and shared behind `Arc` by every handle that resolved to them.
//!
//! Two plugin families ship in-tree:
//!
//! - [`inproc`]: process-internal endpoints over bounded channels, for
//!   loopback wiring and tests (`inproc://<name>`).
//! - [`tcp`]: blocking TCP with length-prefixed frames
//!   (`tcp://<host>:<port>`), including a fan-out publisher and a
//!   multi-publisher subscriber.
//!
//! ## Wildcard URIs
//!
//! A configured URI may leave the host (`*`, `0.0.0.0`) or port (`*`, `0`)
//! unspecified. The plugin binds to whatever the OS assigns and reports the
//! actually-bound URI from `connect_for_receives`/`connect_for_sends`; the
//! network manager merges that report back into the configured URI before
//! advertising it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod inproc;
pub mod tcp;

/// Abstract plugin roles resolved by the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginRole {
    Sender,
    Receiver,
    Publisher,
    Subscriber,
}

/// Connection addresses handed to a plugin: a single peer for point-to-point
/// roles, a list of peers for subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectSpec {
    Single { connection_string: String },
    Multi { connection_strings: Vec<String> },
}

impl ConnectSpec {
    pub fn single(uri: impl Into<String>) -> Self {
        ConnectSpec::Single {
            connection_string: uri.into(),
        }
    }

    pub fn multi(uris: Vec<String>) -> Self {
        ConnectSpec::Multi {
            connection_strings: uris,
        }
    }

    /// All addresses in the spec, whatever the arity.
    pub fn uris(&self) -> &[String] {
        match self {
            ConnectSpec::Single { connection_string } => std::slice::from_ref(connection_string),
            ConnectSpec::Multi { connection_strings } => connection_strings,
        }
    }
}

/// Errors surfaced by transport plugins.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send did not complete within {timeout_ms} ms")]
    SendTimeout { timeout_ms: u128 },

    #[error("no message arrived within {timeout_ms} ms")]
    ReceiveTimeout { timeout_ms: u128 },

    #[error("transport is not connected ({0})")]
    NotConnected(String),

    #[error("malformed connection string '{0}'")]
    BadUri(String),

    #[error("no transport plugin for scheme '{0}'")]
    UnknownScheme(String),

    #[error("operation not supported by this plugin: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::SendTimeout { .. } | TransportError::ReceiveTimeout { .. }
        )
    }
}

/// Send side of a wire transport.
pub trait TransportSender: Send + Sync {
    /// Connect (or bind, for publishers) and return the actually-used URI.
    fn connect_for_sends(&self, spec: &ConnectSpec) -> Result<String, TransportError>;

    /// Ship one payload. `topic` is empty for point-to-point sends.
    fn send(&self, data: &[u8], timeout: Duration, topic: &str) -> Result<(), TransportError>;
}

/// Receive side of a wire transport.
pub trait TransportReceiver: Send + Sync {
    /// Bind (or connect, for subscribers) and return the actually-bound URI.
    /// Subscribers accept a multi-address spec and may be re-invoked with an
    /// updated list to follow peer churn.
    fn connect_for_receives(&self, spec: &ConnectSpec) -> Result<String, TransportError>;

    /// Block up to `timeout` for one payload.
    fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

/// Topic management on subscribing receivers.
pub trait TransportSubscriber: TransportReceiver {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// A created receive-side plugin: always usable as a plain receiver, plus the
/// subscriber view when the role supports topics.
pub struct ReceiverPlugin {
    pub receiver: std::sync::Arc<dyn TransportReceiver>,
    pub subscriber: Option<std::sync::Arc<dyn TransportSubscriber>>,
}

/// Create a send-side plugin for the given role and address scheme.
pub fn make_sender(
    role: PluginRole,
    uri: &str,
) -> Result<std::sync::Arc<dyn TransportSender>, TransportError> {
    debug_assert!(matches!(role, PluginRole::Sender | PluginRole::Publisher));
    match Uri::parse(uri)?.scheme.as_str() {
        "inproc" => Ok(inproc::make_sender(role)),
        "tcp" => Ok(tcp::make_sender(role)),
        other => Err(TransportError::UnknownScheme(other.to_string())),
    }
}

/// Create a receive-side plugin for the given role and address scheme.
pub fn make_receiver(role: PluginRole, uri: &str) -> Result<ReceiverPlugin, TransportError> {
    debug_assert!(matches!(role, PluginRole::Receiver | PluginRole::Subscriber));
    match Uri::parse(uri)?.scheme.as_str() {
        "inproc" => Ok(inproc::make_receiver(role)),
        "tcp" => Ok(tcp::make_receiver(role)),
        other => Err(TransportError::UnknownScheme(other.to_string())),
    }
}

/// True when a configured URI still contains unbound wildcards.
pub fn uri_has_wildcard(uri: &str) -> bool {
    uri.contains('*') || uri.contains("0.0.0.0")
}

/// Structured view of a `scheme://host[:port]` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub host: String,
    /// Empty for schemes without ports (inproc).
    pub port: String,
}

impl Uri {
    pub fn parse(uri: &str) -> Result<Uri, TransportError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| TransportError::BadUri(uri.to_string()))?;
        if scheme.is_empty() || rest.is_empty() {
            return Err(TransportError::BadUri(uri.to_string()));
        }

        if scheme == "inproc" {
            return Ok(Uri {
                scheme: scheme.to_string(),
                host: rest.to_string(),
                port: String::new(),
            });
        }

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| TransportError::BadUri(uri.to_string()))?;
        if host.is_empty() || port.is_empty() {
            return Err(TransportError::BadUri(uri.to_string()));
        }
        Ok(Uri {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port: port.to_string(),
        })
    }

    pub fn host_is_wildcard(&self) -> bool {
        self.host == "*" || self.host == "0.0.0.0"
    }

    pub fn port_is_wildcard(&self) -> bool {
        self.port == "*" || self.port == "0"
    }

    /// Replace wildcard parts with the values the plugin actually bound.
    pub fn merge_actual(&self, actual: &Uri) -> Uri {
        let mut merged = self.clone();
        if merged.host_is_wildcard() {
            merged.host = actual.host.clone();
        }
        if merged.port_is_wildcard() {
            merged.port = actual.port.clone();
        }
        merged
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port.is_empty() {
            write!(f, "{}://{}", self.scheme, self.host)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}
