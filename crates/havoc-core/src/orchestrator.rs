//! The orchestrator: a control-bus client that drives the fault schedule.
//!
//! Three independent timers issue netsplits, restarts and convergence
//! checks per the test config. All writes to the socket are serialised
//! through a single writer task; the read loop logs every payload the
//! harness multicasts.

use crate::HarnessError;
use futures_util::{SinkExt, StreamExt};
use havoc_proto::{BusMessage, BusRequest, TestConfig};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

const DIAL_RETRY: Duration = Duration::from_millis(10);
const DIAL_DEADLINE: Duration = Duration::from_secs(1);

/// Connect to the control bus and orchestrate netsplits, restarts and
/// convergence checks per `test`. Sends `Begin` once the server has echoed
/// its config. Blocks until the connection drops.
pub async fn orchestrate(
    ws_port: u16,
    verbose: bool,
    test: TestConfig,
) -> Result<(), HarnessError> {
    let addr = format!("ws://localhost:{ws_port}");
    info!("Dialling {addr}");

    let deadline = tokio::time::Instant::now() + DIAL_DEADLINE;
    let ws_stream = loop {
        match tokio_tungstenite::connect_async(addr.as_str()).await {
            Ok((stream, _)) => break stream,
            Err(e) => {
                if tokio::time::Instant::now() > deadline {
                    return Err(HarnessError::ControlBus(format!(
                        "cannot connect to control bus at {addr}: {e}"
                    )));
                }
                warn!("control bus dial: {e}");
                tokio::time::sleep(DIAL_RETRY).await;
            }
        }
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Single writer so the socket is never concurrently written.
    let (req_tx, mut req_rx) = mpsc::channel::<BusRequest>(1);
    tokio::spawn(async move {
        while let Some(req) = req_rx.recv().await {
            let json = match serde_json::to_string(&req) {
                Ok(j) => j,
                Err(e) => {
                    error!("failed to serialise control request: {e}");
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                error!("control bus write failed: {e}");
                break;
            }
        }
    });

    if test.netsplits.duration_secs > 0 {
        let tx = req_tx.clone();
        let free = Duration::from_secs(test.netsplits.free_secs);
        let duration = Duration::from_secs(test.netsplits.duration_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(free).await;
                if tx.send(BusRequest::netsplit(true)).await.is_err() {
                    return;
                }
                tokio::time::sleep(duration).await;
                if tx.send(BusRequest::netsplit(false)).await.is_err() {
                    return;
                }
            }
        });
    }

    if test.restarts.interval_secs > 0 && !test.restarts.round_robin.is_empty() {
        let tx = req_tx.clone();
        let interval = Duration::from_secs(test.restarts.interval_secs);
        let round_robin = test.restarts.round_robin.clone();
        tokio::spawn(async move {
            let mut i = 0usize;
            loop {
                let next = round_robin[i % round_robin.len()].clone();
                tokio::time::sleep(interval).await;
                if tx
                    .send(BusRequest::restart_servers(vec![next]))
                    .await
                    .is_err()
                {
                    return;
                }
                i += 1;
            }
        });
    }

    if test.convergence.enabled && test.convergence.interval_secs > 0 {
        let tx = req_tx.clone();
        let interval = Duration::from_secs(test.convergence.interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if tx.send(BusRequest::check_convergence()).await.is_err() {
                    return;
                }
            }
        });
    }

    let mut begun = false;
    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                return Err(HarnessError::ControlBus(format!("read failed: {e}")));
            }
        };
        let Message::Text(text) = msg else {
            continue;
        };
        let envelope: BusMessage = serde_json::from_str(&text)
            .map_err(|e| HarnessError::ControlBus(format!("bad envelope: {e}")))?;
        if envelope.kind == "WorkerAction" && !verbose {
            continue;
        }
        let payload = envelope
            .decode()
            .map_err(|e| HarnessError::ControlBus(format!("bad payload: {e}")))?;
        info!("> {payload}");

        // We start once the server has echoed us the config.
        if matches!(payload, havoc_proto::Payload::Config(_)) && !begun {
            begun = true;
            let _ = req_tx.send(BusRequest::begin()).await;
        }
    }

    Err(HarnessError::ControlBus(
        "control bus connection closed".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusServer;
    use havoc_proto::ChaosConfig;
    use std::net::SocketAddr;

    /// End-to-end over a real socket: the orchestrator connects, receives
    /// the greeting config, and replies with Begin.
    #[tokio::test]
    async fn test_orchestrator_begins_after_config_echo() {
        let mut cfg = ChaosConfig::default();
        cfg.test.convergence.enabled = false;
        let (bus, mut req_rx) = BusServer::new(cfg.clone());

        // Pick a free port by binding and releasing it.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        tokio::spawn(bus.clone().run(addr));
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::spawn(orchestrate(port, false, cfg.test.clone()));

        let req = tokio::time::timeout(Duration::from_secs(5), req_rx.recv())
            .await
            .expect("timed out waiting for Begin")
            .expect("request queue closed");
        assert!(req.begin);
        assert!(!req.check_convergence);
    }
}
