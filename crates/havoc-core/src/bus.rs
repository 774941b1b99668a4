//! Control-plane pub/sub bus: a WebSocket server multicasting harness
//! events to observers and funnelling their fault requests back in.
//!
//! Back-pressure is bounded by design: if the outbound queue stalls for
//! more than a second the payload is dropped with a log line. Losing a log
//! message is acceptable; stalling the tick loop is not.

use futures_util::{SinkExt, StreamExt};
use havoc_proto::{BusRequest, ChaosConfig, ConfigPayload, Payload};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use warp::ws::{Message, WebSocket};
use warp::Filter;

const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);
const QUEUE_CAPACITY: usize = 100;

struct Outbound {
    payload: Payload,
    /// Target connection, or `None` for multicast.
    destination: Option<u64>,
}

/// The control bus server. Create with [`BusServer::new`], start with
/// [`BusServer::run`]; `send`/`send_direct` work (and drop on back-pressure)
/// whether or not any observer is connected.
pub struct BusServer {
    cfg: ChaosConfig,
    out_tx: mpsc::Sender<Outbound>,
    out_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    req_tx: mpsc::Sender<BusRequest>,
    conns: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    conn_counter: AtomicU64,
    worker_user_ids: RwLock<Vec<String>>,
}

impl BusServer {
    /// Returns the server plus the receiving end of the shared request
    /// queue every connected client writes into.
    pub fn new(cfg: ChaosConfig) -> (Arc<Self>, mpsc::Receiver<BusRequest>) {
        let (out_tx, out_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (req_tx, req_rx) = mpsc::channel(QUEUE_CAPACITY);
        let server = Arc::new(Self {
            cfg,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            req_tx,
            conns: Mutex::new(HashMap::new()),
            conn_counter: AtomicU64::new(0),
            worker_user_ids: RwLock::new(Vec::new()),
        });
        (server, req_rx)
    }

    /// Record the worker user IDs echoed to every new connection.
    pub fn set_worker_user_ids(&self, user_ids: Vec<String>) {
        if let Ok(mut guard) = self.worker_user_ids.write() {
            *guard = user_ids;
        }
    }

    /// Multicast a payload to every connected observer.
    pub async fn send(&self, payload: Payload) {
        self.enqueue(payload, None).await;
    }

    /// Send a payload to a single connection.
    pub async fn send_direct(&self, payload: Payload, conn_id: u64) {
        self.enqueue(payload, Some(conn_id)).await;
    }

    async fn enqueue(&self, payload: Payload, destination: Option<u64>) {
        let kind = payload.kind();
        let out = Outbound {
            payload,
            destination,
        };
        if self
            .out_tx
            .send_timeout(out, SEND_TIMEOUT)
            .await
            .is_err()
        {
            warn!("failed to send '{kind}' payload, timed out after 1s");
        }
    }

    /// Run the fan-out task and the WebSocket listener. Call once.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) {
        let Some(mut out_rx) = self.out_rx.lock().ok().and_then(|mut g| g.take()) else {
            error!("control bus started twice, refusing");
            return;
        };

        let fanout = self.clone();
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                let msg = match out.payload.to_message() {
                    Ok(m) => m,
                    Err(e) => {
                        error!("failed to encode '{}' payload: {e}", out.payload.kind());
                        continue;
                    }
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("failed to serialise bus message: {e}");
                        continue;
                    }
                };
                // Gather senders under the lock, write outside it.
                let senders: Vec<mpsc::UnboundedSender<Message>> = {
                    let Ok(conns) = fanout.conns.lock() else {
                        continue;
                    };
                    match out.destination {
                        Some(id) => conns.get(&id).cloned().into_iter().collect(),
                        None => conns.values().cloned().collect(),
                    }
                };
                for sender in senders {
                    let _ = sender.send(Message::text(text.clone()));
                }
            }
        });

        let server = self.clone();
        let route = warp::ws()
            .and(warp::addr::remote())
            .map(move |ws: warp::ws::Ws, remote: Option<SocketAddr>| {
                let server = server.clone();
                ws.on_upgrade(move |socket| server.handle_connection(socket, remote))
            });
        warp::serve(route).run(addr).await;
    }

    async fn handle_connection(self: Arc<Self>, socket: WebSocket, remote: Option<SocketAddr>) {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!("incoming control connection {id} from {remote:?}");

        let (mut ws_tx, mut ws_rx) = socket.split();
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();
        if let Ok(mut conns) = self.conns.lock() {
            conns.insert(id, msg_tx);
        }

        // Forward queued messages to this observer's socket.
        let forward = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Every new connection is greeted with the runtime config.
        let worker_user_ids = self
            .worker_user_ids
            .read()
            .map(|g| g.clone())
            .unwrap_or_default();
        self.send_direct(
            Payload::Config(ConfigPayload {
                config: self.cfg.clone(),
                worker_user_ids,
            }),
            id,
        )
        .await;

        // Read inbound requests into the shared queue.
        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("control connection {id} read error: {e}");
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Ok(text) = msg.to_str() else {
                continue;
            };
            match serde_json::from_str::<BusRequest>(text) {
                Ok(req) => {
                    let _ = self.req_tx.send(req).await;
                }
                Err(e) => {
                    warn!("control connection {id} sent invalid request: {e}");
                }
            }
        }

        if let Ok(mut conns) = self.conns.lock() {
            conns.remove(&id);
        }
        forward.abort();
        info!("control connection {id} closed");
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.conns.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_proto::NetsplitPayload;

    #[tokio::test]
    async fn test_send_without_observers_does_not_block() {
        let (bus, _req_rx) = BusServer::new(ChaosConfig::default());
        // Queue capacity absorbs sends even before run() drains them.
        for _ in 0..10 {
            bus.send(Payload::Netsplit(NetsplitPayload { started: true }))
                .await;
        }
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_send_drops_when_queue_full() {
        let (bus, _req_rx) = BusServer::new(ChaosConfig::default());
        // Fill the queue; nothing is draining it.
        for _ in 0..QUEUE_CAPACITY {
            bus.send(Payload::Netsplit(NetsplitPayload { started: false }))
                .await;
        }
        // The next send must come back (dropped) rather than hang forever.
        let start = std::time::Instant::now();
        bus.send(Payload::Netsplit(NetsplitPayload { started: false }))
            .await;
        let elapsed = start.elapsed();
        assert!(elapsed >= SEND_TIMEOUT);
        assert!(elapsed < SEND_TIMEOUT * 3);
    }

    #[tokio::test]
    async fn test_worker_user_ids_settable() {
        let (bus, _req_rx) = BusServer::new(ChaosConfig::default());
        bus.set_worker_user_ids(vec!["@u1:hs1".into()]);
        let ids = bus.worker_user_ids.read().unwrap().clone();
        assert_eq!(ids, vec!["@u1:hs1".to_string()]);
    }
}
