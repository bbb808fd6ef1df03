use anyhow::Result;
use ipc_fabric::{fabric_message, Connection, ConnectionId, ConnectionType, FabricError, IOManager};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Data {
    count: i32,
    factor: f64,
    name: String,
}
fabric_message!(Data, "Data");

/// A payload that never implements the byte codec; it can only live on
/// queues.
struct RawHandle {
    #[allow(dead_code)]
    fd: i64,
}
fabric_message!(@opaque RawHandle, "RawHandle");

const TIMEOUT: Duration = Duration::from_millis(100);

/// In-process loopback over a network transport: a struct survives the
/// serialize/transport/deserialize trip, and a non-serializable type is
/// rejected at the codec gate.
#[test]
fn loopback_round_trip_and_codec_gate() -> Result<()> {
    ipc_fabric::logging::init();
    let iom = IOManager::get();
    iom.configure(
        vec![],
        vec![
            Connection {
                id: ConnectionId::new("c1", "Data"),
                uri: "inproc://foo".to_string(),
                connection_type: ConnectionType::SendRecv,
            },
            Connection {
                id: ConnectionId::new("c1_raw", "RawHandle"),
                uri: "inproc://foo_raw".to_string(),
                connection_type: ConnectionType::SendRecv,
            },
        ],
        false,
        Duration::from_secs(1),
        "loopback",
    )?;

    let rx = iom.get_receiver::<Data>(ConnectionId::new("c1", "Data"))?;
    let tx = iom.get_sender::<Data>(ConnectionId::new("c1", "Data"))?;

    let sent = Data {
        count: 56,
        factor: 26.5,
        name: "test1".to_string(),
    };
    tx.send(sent.clone(), TIMEOUT)?;
    assert_eq!(rx.receive(TIMEOUT)?, sent);

    // Non-serializable payload on a network connection.
    let raw_tx = iom.get_sender::<RawHandle>(ConnectionId::new("c1_raw", "RawHandle"))?;
    let err = raw_tx.send(RawHandle { fd: 3 }, TIMEOUT).unwrap_err();
    assert!(
        matches!(err, FabricError::Codec(_)),
        "expected not-serializable, got {err}"
    );
    // The non-throwing form reports failure instead.
    assert!(!raw_tx.try_send(RawHandle { fd: 4 }, TIMEOUT));

    iom.reset();
    Ok(())
}
