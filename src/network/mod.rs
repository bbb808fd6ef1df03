//! # Network Layer
//!
//! Everything behind the inter-process half of the fabric: the transport
//! plugin contract and in-tree plugins ([`transport`]), the connectivity
//! directory client ([`directory`]), and the process-wide network manager
//! that instantiates, connects and refreshes endpoints ([`manager`]).

pub mod directory;
pub mod manager;
pub mod transport;

pub use directory::{ConnectionInfo, ConnectionRegistration, ConnectionRequest, DirectoryClient};
pub use manager::NetworkManager;
