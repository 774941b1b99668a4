//! Wires the harness together: plugins, storage, federation interception,
//! the control bus and the dispatcher, plus the request loop that turns
//! control-bus requests into fault injection.

use crate::bus::BusServer;
use crate::convergence::{Convergence, ConvergenceObserver, Mechanism};
use crate::dispatcher::{Dispatcher, TickHook};
use crate::interceptor::CallbackServer;
use crate::proxy::ProxyClient;
use crate::restart::{new_docker_restarter, CreateRestarter, Restarter, RESTART_TYPE_DOCKER};
use crate::snapshot::{
    new_docker_snapshotter, CreateSnapshotter, ProcessSnapshot, Snapshotter, Storage,
    SNAPSHOT_TYPE_DOCKER,
};
use crate::HarnessError;
use async_trait::async_trait;
use havoc_proto::{
    BusRequest, ChaosConfig, ConvergencePayload, ConvergenceState, NetsplitPayload, Payload,
    RestartPayload,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Registry of snapshot and restart plugin constructors, keyed by the
/// `type` tag in the homeserver config. Docker is registered by default.
pub struct Registry {
    snapshotters: HashMap<String, CreateSnapshotter>,
    restarters: HashMap<String, CreateRestarter>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self {
            snapshotters: HashMap::new(),
            restarters: HashMap::new(),
        };
        registry.register_snapshotter(SNAPSHOT_TYPE_DOCKER, new_docker_snapshotter);
        registry.register_restarter(RESTART_TYPE_DOCKER, new_docker_restarter);
        registry
    }
}

impl Registry {
    /// Register a snapshot type. The constructor is invoked for any
    /// homeserver config carrying this `snapshot.type`.
    pub fn register_snapshotter(&mut self, kind: &str, create: CreateSnapshotter) {
        self.snapshotters.insert(kind.to_string(), create);
    }

    /// Register a restart type. The constructor is invoked for any
    /// homeserver config carrying this `restart.type`.
    pub fn register_restarter(&mut self, kind: &str, create: CreateRestarter) {
        self.restarters.insert(kind.to_string(), create);
    }

    fn build(
        &self,
        cfg: &ChaosConfig,
    ) -> Result<(Vec<Box<dyn Snapshotter>>, Vec<Box<dyn Restarter>>), HarnessError> {
        let mut snapshotters = Vec::new();
        let mut restarters = Vec::new();
        for hs in &cfg.homeservers {
            if !hs.snapshot.kind.is_empty() {
                let create = self.snapshotters.get(&hs.snapshot.kind).ok_or_else(|| {
                    HarnessError::UnsupportedSnapshotType {
                        domain: hs.domain.clone(),
                        kind: hs.snapshot.kind.clone(),
                    }
                })?;
                snapshotters.push(create(hs)?);
            }
            if !hs.restart.kind.is_empty() {
                let create = self.restarters.get(&hs.restart.kind).ok_or_else(|| {
                    HarnessError::UnsupportedRestartType {
                        domain: hs.domain.clone(),
                        kind: hs.restart.kind.clone(),
                    }
                })?;
                restarters.push(create(hs)?);
            }
        }
        Ok((snapshotters, restarters))
    }
}

/// The process-wide fault flags and their edge transitions.
///
/// Checking convergence requires no concurrent netsplits or restarts. An
/// in-progress restart is fine (the synchronise messages catch up once the
/// server returns), but a netsplit is undetectable from inside the
/// homeservers, so latching a convergence check heals any active partition
/// immediately and ignores further fault requests until the check
/// completes.
struct FaultFlags {
    partition_gate: Arc<AtomicBool>,
    convergence_requested: AtomicBool,
    started: AtomicBool,
}

impl FaultFlags {
    fn new(partition_gate: Arc<AtomicBool>) -> Self {
        Self {
            partition_gate,
            convergence_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    fn faults_allowed(&self) -> bool {
        !self.convergence_requested.load(Ordering::SeqCst)
    }

    /// Flip the partition gate. Returns the new state only on an actual
    /// edge change; a no-op while a convergence check is latched.
    fn apply_netsplit(&self, up: bool) -> Option<bool> {
        if !self.faults_allowed() {
            return None;
        }
        let was = self.partition_gate.swap(up, Ordering::SeqCst);
        (was != up).then_some(up)
    }

    /// Latch a convergence request. Returns `None` when one is already in
    /// flight (repeated requests are no-ops); otherwise whether an active
    /// partition had to be healed.
    fn latch_convergence(&self) -> Option<bool> {
        if self
            .convergence_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let healed = self
            .partition_gate
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        Some(healed)
    }

    fn convergence_pending(&self) -> bool {
        self.convergence_requested.load(Ordering::SeqCst)
    }

    fn release_convergence(&self) {
        let _ = self.convergence_requested.compare_exchange(
            true,
            false,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// One-shot transition from idle to running.
    fn begin_once(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct BusObserver(Arc<BusServer>);

#[async_trait]
impl ConvergenceObserver for BusObserver {
    async fn update(&self, payload: ConvergencePayload) {
        self.0.send(Payload::Convergence(payload)).await;
    }
}

async fn take_snapshot(
    snapshotters: &[Box<dyn Snapshotter>],
    storage: &Storage,
) -> Result<(), HarnessError> {
    let mut entries: Vec<ProcessSnapshot> = Vec::new();
    for snapshotter in snapshotters {
        entries.extend(snapshotter.snapshot().await?);
    }
    storage.write_snapshot(&entries).await
}

/// Post-tick hook: resource snapshot every tick, plus the convergence
/// check while one is latched. A failed check keeps the latch so the
/// check retries after the next tick; only success releases it.
struct RunHook {
    snapshotters: Vec<Box<dyn Snapshotter>>,
    storage: Storage,
    bus: Arc<BusServer>,
    convergence: Convergence,
    flags: Arc<FaultFlags>,
    sync_timeout: Duration,
    buffer: Duration,
}

#[async_trait]
impl TickHook for RunHook {
    async fn after_tick(&mut self, _index: u64) -> Result<(), HarnessError> {
        take_snapshot(&self.snapshotters, &self.storage).await?;

        if self.flags.convergence_pending() {
            self.bus
                .send(Payload::Convergence(ConvergencePayload::new(
                    ConvergenceState::Starting,
                )))
                .await;
            let cancel = CancellationToken::new();
            let deadline = cancel.clone();
            let timeout = self.sync_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline.cancel();
            });
            match self.convergence.assert(&cancel, self.buffer).await {
                Ok(()) => {
                    self.bus
                        .send(Payload::Convergence(ConvergencePayload::new(
                            ConvergenceState::Success,
                        )))
                        .await;
                    self.flags.release_convergence();
                }
                Err(e) => {
                    self.bus
                        .send(Payload::Convergence(ConvergencePayload::with_error(
                            ConvergenceState::Failure,
                            e.to_string(),
                        )))
                        .await;
                }
            }
        }
        Ok(())
    }
}

/// Entry point for running the harness. Prepares the cluster, then spawns
/// the request loop and returns; fault injection and the tick loop are
/// driven by control-bus requests from there on.
pub async fn bootstrap(
    cfg: ChaosConfig,
    bus: Arc<BusServer>,
    requests: mpsc::Receiver<BusRequest>,
    registry: Registry,
) -> Result<(), HarnessError> {
    if cfg.homeservers.is_empty() {
        return Err(HarnessError::NoHomeservers);
    }

    let (snapshotters, restarters) = registry.build(&cfg)?;

    let storage = Storage::open(&cfg.test.snapshot_db).await?;
    take_snapshot(&snapshotters, &storage).await?;

    let partition_gate = Arc::new(AtomicBool::new(false));
    setup_federation_interception(&cfg, bus.clone(), partition_gate.clone()).await?;

    let bus_addr: SocketAddr = ([0, 0, 0, 0], cfg.ws_port).into();
    tokio::spawn(bus.clone().run(bus_addr));

    let mut dispatcher = Dispatcher::new(cfg.clone(), bus.clone());
    dispatcher.prepare().await?;
    let worker_user_ids =
        dispatcher.start_workers(cfg.test.num_users, cfg.test.ops_per_tick)?;
    bus.set_worker_user_ids(worker_user_ids);

    let flags = Arc::new(FaultFlags::new(partition_gate));
    tokio::spawn(request_loop(
        cfg,
        bus,
        requests,
        dispatcher,
        snapshotters,
        restarters,
        storage,
        flags,
    ));
    Ok(())
}

/// Process control-bus requests: netsplits, restarts, convergence checks
/// and the Begin one-shot. Doesn't decide *when* faults happen; that is
/// the orchestrator's job.
#[allow(clippy::too_many_arguments)]
async fn request_loop(
    cfg: ChaosConfig,
    bus: Arc<BusServer>,
    mut requests: mpsc::Receiver<BusRequest>,
    dispatcher: Dispatcher,
    snapshotters: Vec<Box<dyn Snapshotter>>,
    restarters: Vec<Box<dyn Restarter>>,
    storage: Storage,
    flags: Arc<FaultFlags>,
) {
    let mut dispatcher = Some(dispatcher);
    let mut run_parts = Some((snapshotters, storage));

    while let Some(req) = requests.recv().await {
        if let Some(netsplit) = req.netsplit {
            if let Some(started) = flags.apply_netsplit(netsplit) {
                bus.send(Payload::Netsplit(NetsplitPayload { started })).await;
            }
        }

        if let Some(domains) = &req.restart_servers {
            if flags.faults_allowed() {
                for domain in domains {
                    for restarter in &restarters {
                        if &restarter.config().domain != domain {
                            continue;
                        }
                        bus.send(Payload::Restart(RestartPayload {
                            domain: domain.clone(),
                            finished: false,
                        }))
                        .await;
                        if let Err(e) = restarter.restart().await {
                            warn!("failed to restart {domain}: {e}");
                        }
                        bus.send(Payload::Restart(RestartPayload {
                            domain: domain.clone(),
                            finished: true,
                        }))
                        .await;
                    }
                }
            }
        }

        if req.check_convergence {
            // The latch stays set until the post-tick check succeeds; the
            // gate heal is announced like any other netsplit edge.
            if let Some(healed) = flags.latch_convergence() {
                if healed {
                    bus.send(Payload::Netsplit(NetsplitPayload { started: false }))
                        .await;
                }
            }
        }

        if req.begin && flags.begin_once() {
            let Some(dispatcher) = dispatcher.take() else {
                continue;
            };
            let Some((snapshotters, storage)) = run_parts.take() else {
                continue;
            };
            let Some(ground) = dispatcher.ground_truth() else {
                error!("dispatcher has no ground truth, cannot begin");
                return;
            };
            let mechanism = match cfg.test.convergence.mechanism.as_str() {
                "sync" => Mechanism::Sync,
                _ => Mechanism::Members,
            };
            let convergence = Convergence::new(
                dispatcher.convergence_masters(),
                dispatcher.room_ids().to_vec(),
                ground,
                Arc::new(BusObserver(bus.clone())),
            )
            .with_mechanism(mechanism);
            let mut hook = RunHook {
                snapshotters,
                storage,
                bus: bus.clone(),
                convergence,
                flags: flags.clone(),
                sync_timeout: Duration::from_secs(cfg.test.convergence.sync_timeout_secs),
                buffer: Duration::from_secs(cfg.test.convergence.buffer_secs),
            };
            tokio::spawn(async move {
                if let Err(e) = dispatcher.run(&mut hook).await {
                    error!("dispatcher terminated: {e}");
                    std::process::exit(1);
                }
            });
        }
    }
}

/// Start the callback server, lock the proxy onto it, and install a signal
/// handler that releases the lock on SIGINT/SIGTERM.
async fn setup_federation_interception(
    cfg: &ChaosConfig,
    bus: Arc<BusServer>,
    gate: Arc<AtomicBool>,
) -> Result<(), HarnessError> {
    let callback = CallbackServer::start(&cfg.mitm_proxy.host_domain, bus, gate)?;
    let proxy = ProxyClient::new(&cfg.mitm_proxy.container_url)?;

    let lock_id: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));

    // Handle SIGINT/SIGTERM so we unlock correctly; a leaked lock leaves
    // the proxy partitioned until manual intervention.
    {
        let proxy = proxy.clone();
        let lock_id = lock_id.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let id = lock_id
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(id) = id {
                if let Err(e) = proxy.unlock_options(&id).await {
                    error!("failed to unlock proxy on shutdown: {e}");
                }
            }
            std::process::exit(0);
        });
    }

    let id = proxy
        .lock_options(serde_json::json!({
            "callback": { "callback_request_url": callback.callback_url }
        }))
        .await?;
    if let Ok(mut guard) = lock_id.lock() {
        *guard = Some(id);
    }
    info!("federation interception installed");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> FaultFlags {
        FaultFlags::new(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_netsplit_edges_only() {
        let flags = flags();
        assert_eq!(flags.apply_netsplit(true), Some(true));
        // Same state again: no edge, no payload.
        assert_eq!(flags.apply_netsplit(true), None);
        assert_eq!(flags.apply_netsplit(false), Some(false));
        assert_eq!(flags.apply_netsplit(false), None);
    }

    #[test]
    fn test_netsplit_ignored_while_convergence_latched() {
        let flags = flags();
        assert_eq!(flags.latch_convergence(), Some(false));
        // The gate must stay down and no edge may be reported.
        assert_eq!(flags.apply_netsplit(true), None);
        assert!(!flags.partition_gate.load(Ordering::SeqCst));
        assert!(!flags.faults_allowed());
    }

    #[test]
    fn test_latching_heals_active_partition() {
        let flags = flags();
        assert_eq!(flags.apply_netsplit(true), Some(true));
        assert_eq!(flags.latch_convergence(), Some(true));
        assert!(!flags.partition_gate.load(Ordering::SeqCst));
    }

    #[test]
    fn test_repeated_convergence_requests_are_noops() {
        let flags = flags();
        assert_eq!(flags.latch_convergence(), Some(false));
        assert_eq!(flags.latch_convergence(), None);
        assert_eq!(flags.latch_convergence(), None);
        // After release, a new check can be latched.
        flags.release_convergence();
        assert_eq!(flags.latch_convergence(), Some(false));
    }

    #[test]
    fn test_begin_is_one_shot() {
        let flags = flags();
        assert!(flags.begin_once());
        assert!(!flags.begin_once());
    }

    #[test]
    fn test_faults_resume_after_release() {
        let flags = flags();
        flags.latch_convergence();
        flags.release_convergence();
        assert_eq!(flags.apply_netsplit(true), Some(true));
    }

    #[test]
    fn test_registry_default_has_docker() {
        let registry = Registry::default();
        assert!(registry.snapshotters.contains_key(SNAPSHOT_TYPE_DOCKER));
        assert!(registry.restarters.contains_key(RESTART_TYPE_DOCKER));
    }

    #[test]
    fn test_registry_rejects_unknown_snapshot_type() {
        let registry = Registry::default();
        let mut cfg = ChaosConfig::default();
        let mut hs = havoc_proto::HomeserverConfig::default();
        hs.domain = "hs1".into();
        hs.snapshot.kind = "kubernetes".into();
        cfg.homeservers.push(hs);

        let err = registry.build(&cfg).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::UnsupportedSnapshotType { domain, kind }
                if domain == "hs1" && kind == "kubernetes"
        ));
    }

    #[test]
    fn test_registry_skips_disabled_plugins() {
        let registry = Registry::default();
        let mut cfg = ChaosConfig::default();
        cfg.homeservers.push(havoc_proto::HomeserverConfig {
            domain: "hs1".into(),
            ..Default::default()
        });
        let (snapshotters, restarters) = registry.build(&cfg).unwrap();
        assert!(snapshotters.is_empty());
        assert!(restarters.is_empty());
    }

    #[test]
    fn test_custom_plugin_registration() {
        #[derive(Debug)]
        struct NoopRestarter(havoc_proto::HomeserverConfig);

        #[async_trait]
        impl Restarter for NoopRestarter {
            async fn restart(&self) -> Result<(), HarnessError> {
                Ok(())
            }
            fn config(&self) -> &havoc_proto::HomeserverConfig {
                &self.0
            }
        }

        fn create(
            hsc: &havoc_proto::HomeserverConfig,
        ) -> Result<Box<dyn Restarter>, HarnessError> {
            Ok(Box::new(NoopRestarter(hsc.clone())))
        }

        let mut registry = Registry::default();
        registry.register_restarter("noop", create);

        let mut cfg = ChaosConfig::default();
        let mut hs = havoc_proto::HomeserverConfig::default();
        hs.domain = "hs1".into();
        hs.restart.kind = "noop".into();
        cfg.homeservers.push(hs);

        let (_, restarters) = registry.build(&cfg).unwrap();
        assert_eq!(restarters.len(), 1);
        assert_eq!(restarters[0].config().domain, "hs1");
    }
}
