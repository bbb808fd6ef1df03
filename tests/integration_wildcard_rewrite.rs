use anyhow::Result;
use ipc_fabric::{fabric_message, Connection, ConnectionId, ConnectionType, IOManager};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Data {
    seq: u64,
}
fabric_message!(Data, "Data");

/// Minimal connectivity-directory stand-in: answers every POST with the
/// response configured for its path prefix and records request bodies.
struct MockDirectory {
    port: u16,
    responses: Arc<Mutex<std::collections::HashMap<&'static str, String>>>,
    requests: Arc<Mutex<Vec<(String, String)>>>,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MockDirectory {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();
        let responses: Arc<Mutex<std::collections::HashMap<&'static str, String>>> =
            Arc::new(Mutex::new(std::collections::HashMap::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let responses = Arc::clone(&responses);
            let requests = Arc::clone(&requests);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((mut stream, _)) => {
                            stream.set_nonblocking(false).unwrap();
                            let mut buf = Vec::new();
                            let mut chunk = [0u8; 1024];
                            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                match stream.read(&mut chunk) {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                                }
                            }
                            let text = String::from_utf8_lossy(&buf).into_owned();
                            let head_end =
                                text.find("\r\n\r\n").map(|i| i + 4).unwrap_or(text.len());
                            let content_length = text
                                .lines()
                                .find_map(|l| {
                                    l.to_ascii_lowercase()
                                        .strip_prefix("content-length:")
                                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                                })
                                .unwrap_or(0);
                            let mut body = buf[head_end..].to_vec();
                            while body.len() < content_length {
                                match stream.read(&mut chunk) {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => body.extend_from_slice(&chunk[..n]),
                                }
                            }
                            let path = text
                                .lines()
                                .next()
                                .and_then(|l| l.split_whitespace().nth(1))
                                .unwrap_or("")
                                .to_string();
                            let response = {
                                let responses = responses.lock();
                                responses
                                    .iter()
                                    .find(|(prefix, _)| path.starts_with(**prefix))
                                    .map(|(_, r)| r.clone())
                                    .unwrap_or_else(|| "null".to_string())
                            };
                            requests
                                .lock()
                                .push((path, String::from_utf8_lossy(&body).into_owned()));
                            let reply = format!(
                                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nconnection: close\r\ncontent-length: {}\r\n\r\n{}",
                                response.len(),
                                response
                            );
                            let _ = stream.write_all(reply.as_bytes());
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        MockDirectory {
            port,
            responses,
            requests,
            stop,
            handle: Some(handle),
        }
    }

    fn set_response(&self, path_prefix: &'static str, body: String) {
        self.responses.lock().insert(path_prefix, body);
    }

    fn published_uris(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|(path, _)| path == "/publish")
            .filter_map(|(_, body)| serde_json::from_str::<serde_json::Value>(body).ok())
            .flat_map(|body| {
                body["connections"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|c| c["uri"].as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl Drop for MockDirectory {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Wildcard URI rewrite: a receiver configured on `tcp://0.0.0.0:*` binds an
/// ephemeral port, the advertised registration carries the real address, and
/// a peer resolving through the directory connects to it.
#[test]
fn bound_address_is_advertised_and_resolvable() -> Result<()> {
    let server = MockDirectory::start();
    std::env::set_var("DUNEDAQ_PARTITION", "rewrite_session");
    std::env::set_var("CONNECTION_SERVER", "127.0.0.1");
    std::env::set_var("CONNECTION_PORT", server.port.to_string());
    // Nothing registered remotely yet.
    server.set_response("/getconnection", "[]".to_string());

    ipc_fabric::logging::init();
    let iom = IOManager::get();
    iom.configure(
        vec![],
        vec![Connection {
            id: ConnectionId::new("wild", "Data"),
            uri: "tcp://0.0.0.0:*".to_string(),
            connection_type: ConnectionType::SendRecv,
        }],
        true,
        Duration::from_millis(50),
        "rewrite_session",
    )?;

    let rx = iom.get_receiver::<Data>(ConnectionId::new("wild", "Data"))?;

    // Wait for a publish tick and inspect what was advertised.
    std::thread::sleep(Duration::from_millis(300));
    let uris = server.published_uris();
    assert!(!uris.is_empty(), "receiver address was never published");
    let advertised = &uris[0];
    assert!(
        !advertised.contains('*') && !advertised.contains("0.0.0.0"),
        "advertised URI still has wildcards: {advertised}"
    );

    // A peer's lookup now resolves to the rewritten URI.
    server.set_response(
        "/getconnection",
        format!(
            r#"[{{"uid":"wild","data_type":"Data","uri":"{advertised}","connection_type":"send_recv"}}]"#
        ),
    );

    let tx = iom.get_sender::<Data>(ConnectionId::new("wild", "Data"))?;
    tx.send(Data { seq: 7 }, Duration::from_secs(2))?;
    assert_eq!(rx.receive(Duration::from_secs(2))?, Data { seq: 7 });

    iom.reset();
    Ok(())
}
