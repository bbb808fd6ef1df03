use anyhow::Result;
use ipc_fabric::{
    fabric_message, Connection, ConnectionId, ConnectionType, IOManager, NetworkManager,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Data {
    seq: u64,
}
fabric_message!(Data, "Data");

const TIMEOUT: Duration = Duration::from_millis(50);

/// After a send timeout the sender invalidates its plugin and the network
/// manager's cache, so the next send runs a fresh connect.
#[test]
fn send_timeout_forces_reconnect() -> Result<()> {
    ipc_fabric::logging::init();
    let iom = IOManager::get();
    iom.configure(
        vec![],
        vec![Connection {
            id: ConnectionId::new("rc", "Data"),
            uri: "inproc://reconnect".to_string(),
            connection_type: ConnectionType::SendRecv,
        }],
        false,
        Duration::from_secs(1),
        "reconnect",
    )?;

    let id = ConnectionId::new("rc", "Data");
    let rx = iom.get_receiver::<Data>(id.clone())?;
    let tx = iom.get_sender::<Data>(id.clone())?;

    let plugin_before = NetworkManager::get()
        .get_sender(&ConnectionId::with_session("rc", "Data", "reconnect"))?
        .expect("sender plugin is cached");

    // Fill the endpoint without draining it, then hit the deadline.
    let mut sent = 0u64;
    loop {
        if !tx.try_send(Data { seq: sent }, Duration::from_millis(5)) {
            break;
        }
        sent += 1;
        assert!(sent < 100_000, "endpoint never filled");
    }

    let err = tx.send(Data { seq: sent }, TIMEOUT).unwrap_err();
    assert!(err.is_timeout());

    // The manager cache was invalidated: the next lookup builds a new plugin.
    let plugin_after = NetworkManager::get()
        .get_sender(&ConnectionId::with_session("rc", "Data", "reconnect"))?
        .expect("sender plugin re-created");
    assert!(
        !Arc::ptr_eq(&plugin_before, &plugin_after),
        "send timeout must drop the cached sender"
    );

    // Drain the backlog; the handle then reconnects and delivers again.
    for _ in 0..sent {
        rx.receive(Duration::from_secs(1))?;
    }
    tx.send(Data { seq: 9999 }, Duration::from_secs(1))?;
    assert_eq!(rx.receive(Duration::from_secs(1))?, Data { seq: 9999 });

    iom.reset();
    Ok(())
}
