//! Per-user command executor.
//!
//! A worker serially drains its command channel, performing each action
//! against the homeserver. The `TickEof` sentinel is echoed back on the
//! signal channel so the dispatcher knows this worker has finished the
//! tick; any client error is forwarded and treated as fatal upstream.

use crate::bus::BusServer;
use crate::client::ChatApi;
use crate::state_machine::WorkerCommand;
use crate::HarnessError;
use havoc_proto::{Action, Payload, WorkerActionPayload};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Global per-worker pacing: with N workers this caps the harness at
/// roughly N thousand requests per second.
const PACING: Duration = Duration::from_millis(1);

const ADJECTIVES: &[&str] = &[
    "ancient", "brave", "curious", "dapper", "eager", "fearless", "gentle", "hasty", "icy",
    "jolly", "keen", "livid", "mellow", "nimble",
];

const NOUNS: &[&str] = &[
    "anvil", "badger", "comet", "dirigible", "ember", "fjord", "glacier", "harbour", "ibis",
    "jetty", "kettle", "lantern", "meadow", "nebula",
];

/// What a worker reports back to the dispatcher.
#[derive(Debug)]
pub enum WorkerSignal {
    /// All commands for the current tick have been executed.
    TickEof,
    /// A command failed; the state machine can no longer be trusted.
    Failed(HarnessError),
}

/// Executes one user's queued commands. Owns its user sessions exclusively.
pub struct Worker<C: ChatApi> {
    users: HashMap<String, C>,
    bus: Arc<BusServer>,
    commands: mpsc::Receiver<WorkerCommand>,
    signals: mpsc::Sender<WorkerSignal>,
}

impl<C: ChatApi> Worker<C> {
    pub fn new(
        users: Vec<C>,
        bus: Arc<BusServer>,
        commands: mpsc::Receiver<WorkerCommand>,
        signals: mpsc::Sender<WorkerSignal>,
    ) -> Self {
        let users = users
            .into_iter()
            .map(|c| (c.user_id().to_string(), c))
            .collect();
        Self {
            users,
            bus,
            commands,
            signals,
        }
    }

    /// Drain the command channel until it closes.
    pub async fn run(mut self) {
        while let Some(cmd) = self.commands.recv().await {
            tokio::time::sleep(PACING).await;

            if cmd.action == Action::TickEof {
                if self.signals.send(WorkerSignal::TickEof).await.is_err() {
                    return;
                }
                continue;
            }

            let Some(user) = self.users.get(&cmd.user_id) else {
                let _ = self
                    .signals
                    .send(WorkerSignal::Failed(HarnessError::UnknownUser(
                        cmd.user_id.clone(),
                    )))
                    .await;
                continue;
            };

            let body = if cmd.action == Action::Send {
                random_message()
            } else {
                String::new()
            };

            self.bus
                .send(Payload::WorkerAction(WorkerActionPayload {
                    user_id: cmd.user_id.clone(),
                    room_id: cmd.room_id.clone(),
                    action: cmd.action,
                    body: body.clone(),
                }))
                .await;

            let result = match cmd.action {
                Action::Join => user.join_room(&cmd.room_id, &cmd.server_names).await,
                Action::Leave => user.leave_room(&cmd.room_id).await,
                Action::Send => user.send_text(&cmd.room_id, &body).await.map(|_| ()),
                Action::TickEof => Ok(()),
            };
            if let Err(e) = result {
                if self
                    .signals
                    .send(WorkerSignal::Failed(e.into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

fn random_message() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"quiet");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"room");
    format!("{adjective} {noun}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, MatrixEvent, SyncRequest, SyncResponse};
    use async_trait::async_trait;
    use havoc_proto::ChaosConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeUser {
        user_id: String,
        calls: Arc<AtomicUsize>,
        fail_on_leave: bool,
    }

    #[async_trait]
    impl ChatApi for FakeUser {
        fn user_id(&self) -> &str {
            &self.user_id
        }

        async fn join_room(&self, _: &str, _: &[String]) -> Result<(), ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn leave_room(&self, room_id: &str) -> Result<(), ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_leave {
                return Err(ClientError::Protocol {
                    method: "POST",
                    url: format!("https://hs1/{room_id}/leave"),
                    status: 429,
                    body: "too fast".into(),
                });
            }
            Ok(())
        }

        async fn send_text(&self, _: &str, _: &str) -> Result<String, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("$ev".into())
        }

        async fn event(&self, _: &str, _: &str) -> Result<Option<MatrixEvent>, ClientError> {
            Ok(None)
        }

        async fn members(&self, _: &str) -> Result<Vec<MatrixEvent>, ClientError> {
            Ok(vec![])
        }

        async fn sync(&self, _: SyncRequest) -> Result<SyncResponse, ClientError> {
            Ok(SyncResponse::default())
        }
    }

    fn command(action: Action, user_id: &str) -> WorkerCommand {
        WorkerCommand {
            action,
            user_id: user_id.into(),
            room_id: "!r:hs1".into(),
            server_names: vec![],
        }
    }

    fn spawn_worker(
        ops_per_tick: usize,
        fail_on_leave: bool,
    ) -> (
        mpsc::Sender<WorkerCommand>,
        mpsc::Receiver<WorkerSignal>,
        Arc<AtomicUsize>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let user = FakeUser {
            user_id: "@u1:hs1".into(),
            calls: calls.clone(),
            fail_on_leave,
        };
        let (bus, _req_rx) = BusServer::new(ChaosConfig::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(ops_per_tick + 1);
        let (sig_tx, sig_rx) = mpsc::channel(1);
        tokio::spawn(Worker::new(vec![user], bus, cmd_rx, sig_tx).run());
        (cmd_tx, sig_rx, calls)
    }

    #[tokio::test]
    async fn test_full_capacity_tick_drains_without_deadlock() {
        // A whole tick routed to one worker: ops_per_tick commands plus the
        // EOF must fit the channel without the sender blocking.
        let ops = 8;
        let (cmd_tx, mut sig_rx, calls) = spawn_worker(ops, false);
        for _ in 0..ops {
            cmd_tx.try_send(command(Action::Join, "@u1:hs1")).unwrap();
        }
        cmd_tx.try_send(WorkerCommand::tick_eof()).unwrap();

        match sig_rx.recv().await {
            Some(WorkerSignal::TickEof) => {}
            other => panic!("expected TickEof, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), ops);
    }

    #[tokio::test]
    async fn test_error_is_forwarded_then_eof_still_arrives() {
        let (cmd_tx, mut sig_rx, _calls) = spawn_worker(4, true);
        cmd_tx.send(command(Action::Leave, "@u1:hs1")).await.unwrap();
        cmd_tx.send(WorkerCommand::tick_eof()).await.unwrap();

        match sig_rx.recv().await {
            Some(WorkerSignal::Failed(HarnessError::Client(ClientError::Protocol {
                status, ..
            }))) => assert_eq!(status, 429),
            other => panic!("expected Failed, got {other:?}"),
        }
        match sig_rx.recv().await {
            Some(WorkerSignal::TickEof) => {}
            other => panic!("expected TickEof, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_user_reports_failure() {
        let (cmd_tx, mut sig_rx, calls) = spawn_worker(2, false);
        cmd_tx.send(command(Action::Join, "@stranger:hs2")).await.unwrap();
        match sig_rx.recv().await {
            Some(WorkerSignal::Failed(HarnessError::UnknownUser(user))) => {
                assert_eq!(user, "@stranger:hs2");
            }
            other => panic!("expected UnknownUser failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_random_message_shape() {
        let msg = random_message();
        let words: Vec<&str> = msg.split(' ').collect();
        assert_eq!(words.len(), 2);
        assert!(ADJECTIVES.contains(&words[0]));
        assert!(NOUNS.contains(&words[1]));
    }
}
