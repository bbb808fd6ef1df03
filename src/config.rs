//! # Configuration and Identity Model
//!
//! This module defines the structural identity used to address every endpoint
//! in the fabric ([`ConnectionId`]) together with the immutable
//! configuration records loaded at `configure` time ([`Connection`],
//! [`QueueConfig`]) and the small enums describing transport roles and queue
//! variants.
//!
//! ## Identity semantics
//!
//! A `ConnectionId` is the tuple `(uid, data_type, session)`:
//!
//! - `uid` names the endpoint. When an id is used as a *query* (directory
//!   lookup or preconfigured-table match) the uid is treated as a regular
//!   expression over candidate uids.
//! - `data_type` identifies the message shape and doubles as the pub-sub
//!   topic string.
//! - `session` scopes concurrent deployments. An **empty session is a
//!   wildcard on both sides** of every comparison.
//!
//! Because the empty session is a wildcard, equality is deliberately not
//! structural, and `Hash` covers only `uid` and `data_type`. Two ids that
//! compare equal always hash equal; the fabric only ever stores ids whose
//! session has been defaulted to the process session, so map lookups stay
//! coherent.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::warn;

/// Structural name of a fabric endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionId {
    pub uid: String,
    pub data_type: String,
    #[serde(default)]
    pub session: String,
}

impl ConnectionId {
    /// An id with an empty (wildcard) session.
    pub fn new(uid: impl Into<String>, data_type: impl Into<String>) -> Self {
        ConnectionId {
            uid: uid.into(),
            data_type: data_type.into(),
            session: String::new(),
        }
    }

    /// An id scoped to a specific session.
    pub fn with_session(
        uid: impl Into<String>,
        data_type: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        ConnectionId {
            uid: uid.into(),
            data_type: data_type.into(),
            session: session.into(),
        }
    }

    /// Session compatibility: equal, or wildcard-empty on either side.
    fn session_matches(&self, other: &ConnectionId) -> bool {
        self.session.is_empty() || other.session.is_empty() || self.session == other.session
    }
}

/// Match predicate used by the directory and the preconfigured lookup:
/// data types must be equal, sessions must be wildcard-compatible, and
/// `search.uid` is a regex matched against the whole of `check.uid`.
pub fn is_match(search: &ConnectionId, check: &ConnectionId) -> bool {
    if search.data_type != check.data_type {
        return false;
    }
    if !search.session_matches(check) {
        return false;
    }

    match regex::Regex::new(&format!("^(?:{})$", search.uid)) {
        Ok(re) => re.is_match(&check.uid),
        Err(e) => {
            warn!("invalid uid pattern '{}': {}", search.uid, e);
            false
        }
    }
}

impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        self.session_matches(other) && self.uid == other.uid && self.data_type == other.data_type
    }
}

impl Eq for ConnectionId {}

// Session is excluded so that ids that compare equal under the wildcard rule
// land in the same bucket.
impl Hash for ConnectionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
        self.data_type.hash(state);
    }
}

impl PartialOrd for ConnectionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Session-major, with the empty session collapsing into the data-type/uid
// comparison so that wildcard ids interleave with scoped ones.
impl Ord for ConnectionId {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.session_matches(other) {
            match self.data_type.cmp(&other.data_type) {
                Ordering::Equal => self.uid.cmp(&other.uid),
                ord => ord,
            }
        } else {
            self.session.cmp(&other.session)
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.session.is_empty() {
            write!(f, "{}@{}", self.uid, self.data_type)
        } else {
            write!(f, "{}/{}@{}", self.session, self.uid, self.data_type)
        }
    }
}

/// The two transport role pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// One-to-one unicast; a resolution must yield exactly one peer.
    #[default]
    SendRecv,
    /// One-to-many topic-filtered broadcast.
    PubSub,
}

impl ConnectionType {
    /// Parse a connection-kind name. `send-recv` is the default for anything
    /// that is not recognizably pub-sub.
    pub fn parse(name: &str) -> ConnectionType {
        match normalize(name).as_str() {
            "pubsub" => ConnectionType::PubSub,
            _ => ConnectionType::SendRecv,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::SendRecv => write!(f, "send_recv"),
            ConnectionType::PubSub => write!(f, "pub_sub"),
        }
    }
}

/// Bounded queue variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Unknown,
    /// Mutex + condvar deque; safe for any producer/consumer cardinality.
    Deque,
    /// Lock-free ring, single producer / single consumer.
    Spsc,
    /// Lock-free ring, multiple producers / multiple consumers.
    Mpmc,
}

impl QueueType {
    /// Parse a queue-variant name, accepting short (`spsc`), suffixed
    /// (`spsc_queue`) and capitalized full (`SpscQueue`) forms.
    pub fn parse(name: &str) -> QueueType {
        match normalize(name).as_str() {
            "deque" | "stddeque" | "dequequeue" => QueueType::Deque,
            "spsc" | "spscqueue" => QueueType::Spsc,
            "mpmc" | "mpmcqueue" => QueueType::Mpmc,
            _ => QueueType::Unknown,
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueType::Unknown => write!(f, "unknown"),
            QueueType::Deque => write!(f, "deque"),
            QueueType::Spsc => write!(f, "spsc"),
            QueueType::Mpmc => write!(f, "mpmc"),
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A pre-configured network endpoint, loaded once at `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    /// Transport address; may carry wildcards (`*`, `0.0.0.0`) that are
    /// resolved after the owning plugin binds.
    pub uri: String,
    #[serde(default)]
    pub connection_type: ConnectionType,
}

/// A queue declaration, loaded once at `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub id: ConnectionId,
    pub queue_type: QueueType,
    pub capacity: u32,
}
