//! The dispatcher (master): prepares the cluster, owns the workers, and
//! runs the tick loop.
//!
//! Within a tick, every user command is enqueued before any `TickEof`; the
//! ground truth is committed only after every worker has acknowledged its
//! EOF. Ticks never overlap, which is what gives a tick its transactional
//! feel.

use crate::bus::BusServer;
use crate::client::{ChatApi, Client};
use crate::state_machine::{StateMachine, WorkerCommand};
use crate::worker::{Worker, WorkerSignal};
use crate::HarnessError;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use havoc_proto::{Action, ChaosConfig, Payload, TickGenerationPayload};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Invoked after each tick has been fully applied. The bootstrap layer uses
/// this hook for resource snapshots and convergence checks.
#[async_trait]
pub trait TickHook: Send {
    async fn after_tick(&mut self, index: u64) -> Result<(), HarnessError>;
}

struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    signals: mpsc::Receiver<WorkerSignal>,
    user_ids: Vec<String>,
}

/// Orchestrates prepare, worker lifecycle and the tick loop.
pub struct Dispatcher {
    cfg: ChaosConfig,
    bus: Arc<BusServer>,
    room_ids: Vec<String>,
    users: Vec<Client>,
    masters: Vec<Client>,
    workers: Vec<WorkerHandle>,
    user_to_worker: HashMap<String, usize>,
    state: Option<Arc<Mutex<StateMachine>>>,
}

impl Dispatcher {
    pub fn new(cfg: ChaosConfig, bus: Arc<BusServer>) -> Self {
        Self {
            cfg,
            bus,
            room_ids: Vec::new(),
            users: Vec::new(),
            masters: Vec::new(),
            workers: Vec::new(),
            user_to_worker: HashMap::new(),
            state: None,
        }
    }

    /// Register masters, create rooms, register test users.
    ///
    /// Room creation and user registration run with bounded parallelism to
    /// amortise HTTP latency; any failure aborts prepare.
    pub async fn prepare(&mut self) -> Result<(), HarnessError> {
        if self.cfg.homeservers.is_empty() {
            return Err(HarnessError::NoHomeservers);
        }
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        // One master per homeserver. They create the rooms and lurk so that
        // a room stays joinable even when every test user has left it.
        let mut masters = Vec::with_capacity(self.cfg.homeservers.len());
        for hs in &self.cfg.homeservers {
            let mut master = Client::new(&hs.base_url, &hs.domain, self.cfg.verbose)?;
            master.register(&format!("master-{now_millis}")).await?;
            masters.push(master);
        }
        info!(
            "Created masters: {:?}",
            masters.iter().map(|m| m.user_id.as_str()).collect::<Vec<_>>()
        );

        // Create rooms, cycling the creator so they are not all on one
        // server. Every other master joins and waits to be fully joined.
        let mut create_opts = json!({ "preset": "public_chat" });
        if !self.cfg.test.room_version.is_empty() {
            create_opts["room_version"] = json!(self.cfg.test.room_version);
        }
        let room_ids: Vec<String> = stream::iter((0..self.cfg.test.num_rooms).map(|i| {
            let creator = masters[i % masters.len()].clone();
            let others: Vec<Client> = masters
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i % masters.len())
                .map(|(_, m)| m.clone())
                .collect();
            let opts = create_opts.clone();
            async move {
                let room_id = creator.create_room(&opts).await?;
                for other in &others {
                    other
                        .join_room(&room_id, std::slice::from_ref(&creator.domain))
                        .await?;
                    other.ensure_fully_joined(&room_id).await?;
                }
                Ok::<String, HarnessError>(room_id)
            }
        }))
        .buffer_unordered(self.cfg.test.init_concurrency.max(1))
        .try_collect()
        .await?;
        info!("Created rooms: {room_ids:?}");

        // Register the test users, alternating across homeservers.
        let homeservers = self.cfg.homeservers.clone();
        let verbose = self.cfg.verbose;
        let users: Vec<Client> = stream::iter((0..self.cfg.test.num_users).map(|i| {
            let hs = homeservers[i % homeservers.len()].clone();
            async move {
                let mut user = Client::new(&hs.base_url, &hs.domain, verbose)?;
                user.register(&format!("user-{now_millis}-{i}")).await?;
                Ok::<Client, HarnessError>(user)
            }
        }))
        .buffer_unordered(self.cfg.test.init_concurrency.max(1))
        .try_collect()
        .await?;
        info!(
            "Created users: {:?}",
            users.iter().map(|u| u.user_id.as_str()).collect::<Vec<_>>()
        );

        self.room_ids = room_ids;
        self.users = users;
        self.masters = masters;
        Ok(())
    }

    /// Spawn one worker per user. Returns the worker user IDs.
    pub fn start_workers(
        &mut self,
        num_workers: usize,
        ops_per_tick: usize,
    ) -> Result<Vec<String>, HarnessError> {
        let mut num_workers = num_workers;
        if num_workers > self.users.len() {
            warn!(
                "Requested {num_workers} workers but only {} users exist, setting workers to {}",
                self.users.len(),
                self.users.len()
            );
            num_workers = self.users.len();
        }
        if num_workers < self.users.len() {
            return Err(HarnessError::TooFewWorkers {
                workers: num_workers,
                users: self.users.len(),
            });
        }

        let mut worker_user_ids = Vec::new();
        for (i, user) in self.users.iter().enumerate() {
            // A tick's entire workload plus the EOF must fit without
            // blocking the dispatcher, even if every command lands on one
            // worker.
            let (cmd_tx, cmd_rx) = mpsc::channel(ops_per_tick + 1);
            let (sig_tx, sig_rx) = mpsc::channel(1);
            let users = vec![user.clone()];
            let user_ids: Vec<String> = users.iter().map(|u| u.user_id.clone()).collect();
            for uid in &user_ids {
                self.user_to_worker.insert(uid.clone(), i);
                worker_user_ids.push(uid.clone());
            }
            let worker = Worker::new(users, self.bus.clone(), cmd_rx, sig_tx);
            tokio::spawn(worker.run());
            self.workers.push(WorkerHandle {
                commands: cmd_tx,
                signals: sig_rx,
                user_ids,
            });
        }
        info!("Started {num_workers} workers");

        if self.user_to_worker.len() != self.users.len() {
            return Err(HarnessError::WorkerMapIncomplete {
                mapped: self.user_to_worker.len(),
                users: self.users.len(),
            });
        }

        let state = StateMachine::new(
            self.cfg.test.seed,
            self.cfg.test.ops_per_tick,
            self.cfg.test.send_to_leave_probability,
            worker_user_ids.clone(),
            self.room_ids.clone(),
        );
        self.state = Some(Arc::new(Mutex::new(state)));

        Ok(worker_user_ids)
    }

    /// The generator's ground truth. Available once workers are started.
    pub fn ground_truth(&self) -> Option<Arc<Mutex<StateMachine>>> {
        self.state.clone()
    }

    /// The masters as convergence-checkable API handles.
    pub fn convergence_masters(&self) -> Vec<Arc<dyn ChatApi>> {
        self.masters
            .iter()
            .map(|m| Arc::new(m.clone()) as Arc<dyn ChatApi>)
            .collect()
    }

    pub fn room_ids(&self) -> &[String] {
        &self.room_ids
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn mapped_user_count(&self) -> usize {
        self.user_to_worker.len()
    }

    /// Run the tick loop forever. Returns only on a fatal error: a worker
    /// failure desynchronises the generator from reality and there is no
    /// rollback.
    pub async fn run<H: TickHook>(mut self, hook: &mut H) -> Result<(), HarnessError> {
        let state = self.state.clone().ok_or(HarnessError::NotStarted)?;
        loop {
            let (index, cmds) = {
                let mut sm = state.lock().unwrap_or_else(|e| e.into_inner());
                let cmds = sm.tick();
                (sm.index(), cmds)
            };

            let mut joins = 0usize;
            let mut sends = 0usize;
            let mut leaves = 0usize;
            for cmd in &cmds {
                match cmd.action {
                    Action::Join => joins += 1,
                    Action::Send => sends += 1,
                    Action::Leave => leaves += 1,
                    Action::TickEof => {}
                }
                let worker_index = *self
                    .user_to_worker
                    .get(&cmd.user_id)
                    .ok_or_else(|| HarnessError::UnknownUser(cmd.user_id.clone()))?;
                let handle = &self.workers[worker_index];
                handle
                    .commands
                    .send(cmd.clone())
                    .await
                    .map_err(|_| HarnessError::WorkerGone(cmd.user_id.clone()))?;
            }

            // EOF last, so a worker's ack means the whole tick is done.
            for handle in &self.workers {
                handle
                    .commands
                    .send(WorkerCommand::tick_eof())
                    .await
                    .map_err(|_| {
                        HarnessError::WorkerGone(handle.user_ids.join(","))
                    })?;
            }

            self.bus
                .send(Payload::TickGeneration(TickGenerationPayload {
                    number: index,
                    joins,
                    sends,
                    leaves,
                }))
                .await;

            // Drain in fixed worker order so fatal reports are
            // deterministic across ticks.
            for handle in &mut self.workers {
                loop {
                    match handle.signals.recv().await {
                        Some(WorkerSignal::TickEof) => break,
                        Some(WorkerSignal::Failed(e)) => {
                            return Err(HarnessError::WorkerFailed {
                                user: handle.user_ids.join(","),
                                source: Box::new(e),
                            });
                        }
                        None => {
                            return Err(HarnessError::WorkerGone(handle.user_ids.join(",")));
                        }
                    }
                }
            }

            // Every worker acked: the ground truth advances atomically.
            {
                let mut sm = state.lock().unwrap_or_else(|e| e.into_inner());
                sm.apply(&cmds);
            }

            hook.after_tick(index).await?;
        }
    }
}
