//! # IPC Fabric
//!
//! A typed, location-transparent messaging fabric for distributed
//! data-acquisition applications. Components exchange strongly-typed
//! messages over two transports (intra-process bounded queues and
//! inter-process sockets, send-recv and pub-sub) behind one typed
//! sender/receiver abstraction keyed by a structural [`ConnectionId`].
//! A connectivity directory lets peers discover each other as they come
//! and go.
//!
//! ## Layout
//!
//! - [`iomanager`]: the façade user code talks to, with typed handle lookup,
//!   callback shorthands, and configure/reset.
//! - [`queue`]: bounded queue primitives and their registry.
//! - [`network`]: transport plugins, the network manager, and the directory
//!   client.
//! - [`sender`] / [`receiver`]: the four typed models behind a handle.
//! - [`config`] / [`error`] / [`serialization`]: identity, failure taxonomy,
//!   and the byte-codec gate.
//!
//! ## Example
//!
//! ```no_run
//! use ipc_fabric::{ConnectionId, IOManager, QueueConfig, QueueType};
//! use std::time::Duration;
//!
//! let iom = IOManager::get();
//! iom.configure(
//!     vec![QueueConfig {
//!         id: ConnectionId::new("numbers", "int"),
//!         queue_type: QueueType::Spsc,
//!         capacity: 10,
//!     }],
//!     vec![],
//!     false,
//!     Duration::from_secs(1),
//!     "demo",
//! )?;
//!
//! let tx = iom.get_sender::<i32>(ConnectionId::new("numbers", "int"))?;
//! let rx = iom.get_receiver::<i32>(ConnectionId::new("numbers", "int"))?;
//! tx.send(42, Duration::from_millis(10))?;
//! assert_eq!(rx.receive(Duration::from_millis(10))?, 42);
//! # Ok::<(), ipc_fabric::FabricError>(())
//! ```

pub mod config;
pub mod error;
pub mod iomanager;
pub mod network;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod serialization;

pub use config::{Connection, ConnectionId, ConnectionType, QueueConfig, QueueType};
pub use error::{FabricError, FabricResult};
pub use iomanager::IOManager;
pub use network::NetworkManager;
pub use queue::QueueRegistry;
pub use receiver::Receiver;
pub use sender::Sender;
pub use serialization::FabricMessage;

/// The current version of the fabric crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fabric-wide tuning constants.
pub mod defaults {
    use std::time::Duration;

    /// How long a freshly-constructed network handle tries to resolve its
    /// peer before giving up until the next call.
    pub const INITIAL_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(1);

    /// Floor applied to the very first send's timeout so initial address
    /// resolution does not eat the caller's deadline.
    pub const MIN_FIRST_SEND_TIMEOUT: Duration = Duration::from_secs(1);

    /// Poll quantum of queue-backed callback workers.
    pub const QUEUE_CALLBACK_QUANTUM: Duration = Duration::from_millis(1);

    /// Poll quantum of network-backed callback workers.
    pub const NETWORK_CALLBACK_QUANTUM: Duration = Duration::from_millis(20);
}

/// One-shot `tracing` initialization for fabric binaries and tests.
///
/// Filtering follows `RUST_LOG` (e.g. `RUST_LOG=ipc_fabric=debug`); calling
/// it more than once is harmless.
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_target(false)
                .init();
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use parking_lot::Mutex;

    /// Serializes tests that touch the process-wide singletons or the
    /// environment.
    pub static GLOBAL_LOCK: Mutex<()> = Mutex::new(());
}
