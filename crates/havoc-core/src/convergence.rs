//! Convergence checking: a causal barrier across all homeservers followed
//! by a membership diff against the generator's ground truth.
//!
//! The barrier works by having each master send a synchronise message into
//! every room, then polling every master until it has observed every such
//! event. Membership reads taken after the barrier therefore reflect all
//! pre-barrier writes. If the barrier is cancelled the diff still runs:
//! a diff against a possibly-stale server view has diagnostic value, and
//! the cancellation is reported alongside it.

use crate::client::{ChatApi, ClientError, MatrixEvent, SyncRequest};
use crate::state_machine::{StateMachine, UserRoomState};
use async_trait::async_trait;
use havoc_proto::{ConvergencePayload, ConvergenceState};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const SYNCHRONISE_BODY: &str = "SYNCHRONISE";

/// How the server's view of room membership is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// `/members` per room. Reliable, if less client-realistic.
    Members,
    /// A single full-state `/sync`.
    Sync,
}

/// A (user, room) state collapsed to what membership a server should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collapsed {
    Joined,
    Left,
}

impl std::fmt::Display for Collapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Joined => write!(f, "joined"),
            Self::Left => write!(f, "left"),
        }
    }
}

fn collapse(state: UserRoomState) -> Collapsed {
    match state {
        UserRoomState::Joined | UserRoomState::Send => Collapsed::Joined,
        UserRoomState::Start | UserRoomState::Left => Collapsed::Left,
    }
}

/// Membership events are projected onto the collapsed states. Anything that
/// is not a join counts as left; ban, invite and knock are folded in with
/// leave until the generator emits them as distinct actions.
fn project_membership(membership: &str) -> Collapsed {
    match membership {
        "join" => Collapsed::Joined,
        _ => Collapsed::Left,
    }
}

/// Source of the ground truth the servers are diffed against.
pub trait GroundTruth: Send + Sync {
    fn snapshot(&self) -> HashMap<String, HashMap<String, UserRoomState>>;
}

impl GroundTruth for Mutex<StateMachine> {
    fn snapshot(&self) -> HashMap<String, HashMap<String, UserRoomState>> {
        self.lock().unwrap_or_else(|e| e.into_inner()).snapshot()
    }
}

/// Receives convergence progress updates (bus-backed in production).
#[async_trait]
pub trait ConvergenceObserver: Send + Sync {
    async fn update(&self, payload: ConvergencePayload);
}

/// Errors from a convergence check. These are signals, not crashes: the
/// bootstrap layer reports them as `Convergence{failure}` payloads and the
/// run continues.
#[derive(Debug, thiserror::Error)]
pub enum ConvergenceError {
    #[error("master {master} failed to send event in room {room}: {source}")]
    BarrierSend {
        master: String,
        room: String,
        #[source]
        source: ClientError,
    },

    #[error("context cancelled: still waiting for {pending}")]
    Cancelled { pending: String },

    #[error("/members for {room} failed: {source}")]
    Members {
        room: String,
        #[source]
        source: ClientError,
    },

    #[error("failed to /sync on {master}: {source}")]
    Sync {
        master: String,
        #[source]
        source: ClientError,
    },

    #[error("rooms.join.{room} does not exist")]
    MissingRoom { room: String },

    #[error("room {room} from {master} perspective mismatch: {details}")]
    Mismatch {
        room: String,
        master: String,
        details: String,
    },
}

/// Asserts that every homeserver reports the ground-truth membership.
pub struct Convergence {
    masters: Vec<Arc<dyn ChatApi>>,
    room_ids: Vec<String>,
    ground: Arc<dyn GroundTruth>,
    mechanism: Mechanism,
    observer: Arc<dyn ConvergenceObserver>,
}

impl Convergence {
    pub fn new(
        masters: Vec<Arc<dyn ChatApi>>,
        room_ids: Vec<String>,
        ground: Arc<dyn GroundTruth>,
        observer: Arc<dyn ConvergenceObserver>,
    ) -> Self {
        Self {
            masters,
            room_ids,
            ground,
            mechanism: Mechanism::Members,
            observer,
        }
    }

    pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
        self.mechanism = mechanism;
        self
    }

    /// Establish the causal barrier, wait `buffer` for in-flight federation
    /// to settle, then diff every master against the ground truth.
    pub async fn assert(
        &self,
        cancel: &CancellationToken,
        buffer: Duration,
    ) -> Result<(), ConvergenceError> {
        let barrier_error = self.ensure_synchronised(cancel).await.err();
        self.observer
            .update(ConvergencePayload {
                state: ConvergenceState::Synchronised,
                error: barrier_error.map(|e| e.to_string()).unwrap_or_default(),
            })
            .await;

        self.observer
            .update(ConvergencePayload::new(ConvergenceState::Waiting))
            .await;
        tokio::time::sleep(buffer).await;

        // Invert the ground truth to room -> user -> collapsed state.
        let ground = self.ground.snapshot();
        let mut room_states: HashMap<String, HashMap<String, Collapsed>> = HashMap::new();
        for (user_id, rooms) in &ground {
            for (room_id, state) in rooms {
                room_states
                    .entry(room_id.clone())
                    .or_default()
                    .insert(user_id.clone(), collapse(*state));
            }
        }

        self.observer
            .update(ConvergencePayload::new(ConvergenceState::Checking))
            .await;

        // Each master is on a different server; check every one of them and
        // report the first mismatch found.
        let mut first_error = None;
        for master in &self.masters {
            let result = match self.mechanism {
                Mechanism::Members => self.assert_with_members(master.as_ref(), &room_states).await,
                Mechanism::Sync => self.assert_with_sync(master.as_ref(), &room_states).await,
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Each master sends a synchronise message into every room; then every
    /// master polls until it has seen all of them.
    async fn ensure_synchronised(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), ConvergenceError> {
        // room ID -> event IDs of the synchronise messages.
        let mut sync_messages: HashMap<String, Vec<String>> = HashMap::new();
        for master in &self.masters {
            for room_id in &self.room_ids {
                let event_id = master
                    .send_text(room_id, SYNCHRONISE_BODY)
                    .await
                    .map_err(|source| ConvergenceError::BarrierSend {
                        master: master.user_id().to_string(),
                        room: room_id.clone(),
                        source,
                    })?;
                sync_messages
                    .entry(room_id.clone())
                    .or_default()
                    .push(event_id);
            }
        }

        let waiters = self.masters.iter().map(|master| {
            let master = master.clone();
            // Each master checks off its own copy of the working set.
            let mut working: HashMap<String, HashSet<String>> = sync_messages
                .iter()
                .map(|(room, events)| (room.clone(), events.iter().cloned().collect()))
                .collect();
            async move {
                while !working.is_empty() {
                    let targets: Vec<(String, String)> = working
                        .iter()
                        .flat_map(|(room, events)| {
                            events.iter().map(|ev| (room.clone(), ev.clone()))
                        })
                        .collect();
                    for (room_id, event_id) in targets {
                        tokio::time::sleep(EVENT_POLL_INTERVAL).await;
                        // Polling loop: transport hiccups and not-found both
                        // mean "try again".
                        let found =
                            matches!(master.event(&room_id, &event_id).await, Ok(Some(_)));
                        if found {
                            if let Some(events) = working.get_mut(&room_id) {
                                events.remove(&event_id);
                                if events.is_empty() {
                                    working.remove(&room_id);
                                }
                            }
                        }
                    }
                }
                info!("  {} has synchronised", master.user_id());
            }
        });
        let all_synchronised = futures_util::future::join_all(waiters);

        tokio::select! {
            _ = all_synchronised => Ok(()),
            _ = cancel.cancelled() => {
                warn!("Failed to see all event IDs from all servers: {sync_messages:?}");
                Err(ConvergenceError::Cancelled {
                    pending: format!("{sync_messages:?}"),
                })
            }
        }
    }

    async fn assert_with_members(
        &self,
        master: &dyn ChatApi,
        want: &HashMap<String, HashMap<String, Collapsed>>,
    ) -> Result<(), ConvergenceError> {
        for (room_id, want_room) in want {
            let events =
                master
                    .members(room_id)
                    .await
                    .map_err(|source| ConvergenceError::Members {
                        room: room_id.clone(),
                        source,
                    })?;
            check_room_state(&events, &[], want_room).map_err(|details| {
                ConvergenceError::Mismatch {
                    room: room_id.clone(),
                    master: master.user_id().to_string(),
                    details,
                }
            })?;
        }
        Ok(())
    }

    async fn assert_with_sync(
        &self,
        master: &dyn ChatApi,
        want: &HashMap<String, HashMap<String, Collapsed>>,
    ) -> Result<(), ConvergenceError> {
        let response = master
            .sync(SyncRequest {
                full_state: true,
                ..Default::default()
            })
            .await
            .map_err(|source| ConvergenceError::Sync {
                master: master.user_id().to_string(),
                source,
            })?;
        for (room_id, want_room) in want {
            let room = response
                .rooms
                .join
                .get(room_id)
                .ok_or_else(|| ConvergenceError::MissingRoom {
                    room: room_id.clone(),
                })?;
            check_room_state(&room.state.events, &room.timeline.events, want_room).map_err(
                |details| ConvergenceError::Mismatch {
                    room: room_id.clone(),
                    master: master.user_id().to_string(),
                    details,
                },
            )?;
        }
        Ok(())
    }
}

/// Compare the membership a server reported against the wanted collapsed
/// states. Users the server did not mention default to left. Extra users
/// (the masters themselves) are expected and ignored.
fn check_room_state(
    state_events: &[MatrixEvent],
    timeline_events: &[MatrixEvent],
    want: &HashMap<String, Collapsed>,
) -> Result<(), String> {
    let mut got: HashMap<&str, Collapsed> = HashMap::new();
    for event in state_events.iter().chain(timeline_events) {
        if event.kind != "m.room.member" {
            continue;
        }
        let Some(state_key) = event.state_key.as_deref() else {
            continue;
        };
        let membership = event.membership().unwrap_or("leave");
        got.insert(state_key, project_membership(membership));
    }

    let mut errors = Vec::new();
    for (user_id, want_state) in want {
        let got_state = got.get(user_id.as_str()).copied().unwrap_or(Collapsed::Left);
        if got_state != *want_state {
            errors.push(format!(
                "user {user_id} is '{got_state}'. Want '{want_state}'"
            ));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        errors.sort();
        Err(errors.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SyncResponse;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const USER_A: &str = "@alice:localhost";
    const USER_B: &str = "@bob:localhost";
    const USER_C: &str = "@charlie:localhost";
    const USER_D: &str = "@doris:localhost";
    const ROOM: &str = "!room:id";

    struct FakeGround(HashMap<String, HashMap<String, UserRoomState>>);

    impl GroundTruth for FakeGround {
        fn snapshot(&self) -> HashMap<String, HashMap<String, UserRoomState>> {
            self.0.clone()
        }
    }

    fn ground() -> Arc<FakeGround> {
        let mut map = HashMap::new();
        for (user, state) in [
            (USER_A, UserRoomState::Joined),
            (USER_B, UserRoomState::Left),
            (USER_C, UserRoomState::Send),
            (USER_D, UserRoomState::Start),
        ] {
            let mut rooms = HashMap::new();
            rooms.insert(ROOM.to_string(), state);
            map.insert(user.to_string(), rooms);
        }
        Arc::new(FakeGround(map))
    }

    fn member_event(target: &str, membership: &str) -> MatrixEvent {
        MatrixEvent {
            state_key: Some(target.to_string()),
            sender: target.to_string(),
            kind: "m.room.member".to_string(),
            timestamp: 1,
            id: format!("$m-{target}-{membership}"),
            room_id: ROOM.to_string(),
            content: json!({ "membership": membership })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            unsigned: None,
        }
    }

    /// A master whose rooms contain whatever membership the test wants.
    struct FakeMaster {
        user_id: String,
        members: Vec<MatrixEvent>,
        members_error: bool,
        /// event IDs that exist on this server.
        events: Mutex<HashSet<String>>,
        /// When set, sent events are NOT stored, so polling never finds them.
        drop_sent_events: bool,
        /// When set, /sync serves the membership too (under `rooms.join`).
        serve_sync: bool,
        sent_counter: AtomicUsize,
        members_called: AtomicBool,
    }

    impl FakeMaster {
        fn new(user_id: &str, members: Vec<MatrixEvent>) -> Self {
            Self {
                user_id: user_id.to_string(),
                members,
                members_error: false,
                events: Mutex::new(HashSet::new()),
                drop_sent_events: false,
                serve_sync: false,
                sent_counter: AtomicUsize::new(0),
                members_called: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ChatApi for FakeMaster {
        fn user_id(&self) -> &str {
            &self.user_id
        }

        async fn join_room(&self, _: &str, _: &[String]) -> Result<(), ClientError> {
            Ok(())
        }

        async fn leave_room(&self, _: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn send_text(&self, _room_id: &str, _text: &str) -> Result<String, ClientError> {
            let n = self.sent_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let event_id = format!("$sent-{}-{n}", self.user_id);
            if !self.drop_sent_events {
                self.events.lock().unwrap().insert(event_id.clone());
            }
            Ok(event_id)
        }

        async fn event(
            &self,
            _room_id: &str,
            event_id: &str,
        ) -> Result<Option<MatrixEvent>, ClientError> {
            if self.events.lock().unwrap().contains(event_id) {
                Ok(Some(MatrixEvent {
                    id: event_id.to_string(),
                    kind: "m.room.message".to_string(),
                    ..Default::default()
                }))
            } else {
                Ok(None)
            }
        }

        async fn members(&self, _room_id: &str) -> Result<Vec<MatrixEvent>, ClientError> {
            self.members_called.store(true, Ordering::SeqCst);
            if self.members_error {
                return Err(ClientError::Protocol {
                    method: "GET",
                    url: "https://hs/members".into(),
                    status: 500,
                    body: "oh no!".into(),
                });
            }
            Ok(self.members.clone())
        }

        async fn sync(&self, _: SyncRequest) -> Result<SyncResponse, ClientError> {
            let mut response = SyncResponse::default();
            if self.serve_sync {
                let mut room = crate::client::SyncRoom::default();
                room.state.events = self.members.clone();
                response.rooms.join.insert(ROOM.to_string(), room);
            }
            Ok(response)
        }
    }

    #[derive(Default)]
    struct RecordingObserver(Mutex<Vec<ConvergencePayload>>);

    #[async_trait]
    impl ConvergenceObserver for RecordingObserver {
        async fn update(&self, payload: ConvergencePayload) {
            self.0.lock().unwrap().push(payload);
        }
    }

    fn happy_members() -> Vec<MatrixEvent> {
        vec![
            member_event(USER_A, "join"),
            member_event(USER_B, "leave"),
            member_event(USER_C, "join"),
            // no doris: never joined
        ]
    }

    fn convergence(
        masters: Vec<Arc<FakeMaster>>,
        observer: Arc<RecordingObserver>,
    ) -> Convergence {
        let masters = masters
            .into_iter()
            .map(|m| m as Arc<dyn ChatApi>)
            .collect();
        Convergence::new(masters, vec![ROOM.to_string()], ground(), observer)
    }

    #[tokio::test]
    async fn test_single_master_members_happy_path() {
        let master = Arc::new(FakeMaster::new("@master:localhost", happy_members()));
        let conv = convergence(vec![master], Arc::new(RecordingObserver::default()));
        let result = conv.assert(&CancellationToken::new(), Duration::ZERO).await;
        assert!(result.is_ok(), "unexpected error: {result:?}");
    }

    #[tokio::test]
    async fn test_second_master_mismatch_is_reported() {
        let master1 = Arc::new(FakeMaster::new("@master:localhost1", happy_members()));
        let master2 = Arc::new(FakeMaster::new(
            "@master:localhost2",
            vec![
                member_event(USER_A, "join"),
                member_event(USER_B, "leave"),
                member_event(USER_C, "leave"), // wrong!
            ],
        ));
        let m2 = master2.clone();
        let conv = convergence(
            vec![master1, master2],
            Arc::new(RecordingObserver::default()),
        );
        let err = conv
            .assert(&CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(USER_C), "error should name charlie: {msg}");
        assert!(
            msg.contains("@master:localhost2"),
            "error should name the second master: {msg}"
        );
        assert!(m2.members_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_every_master_is_checked_despite_early_mismatch() {
        let bad = Arc::new(FakeMaster::new(
            "@master:hs1",
            vec![member_event(USER_A, "leave")], // wrong
        ));
        let good = Arc::new(FakeMaster::new("@master:hs2", happy_members()));
        let good_ref = good.clone();
        let conv = convergence(vec![bad, good], Arc::new(RecordingObserver::default()));
        let err = conv
            .assert(&CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("@master:hs1"));
        // The second master must still have been queried.
        assert!(good_ref.members_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_update_sequence() {
        let master = Arc::new(FakeMaster::new("@master:localhost", happy_members()));
        let observer = Arc::new(RecordingObserver::default());
        let conv = convergence(vec![master], observer.clone());
        conv.assert(&CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();
        let states: Vec<ConvergenceState> =
            observer.0.lock().unwrap().iter().map(|p| p.state).collect();
        assert_eq!(
            states,
            vec![
                ConvergenceState::Synchronised,
                ConvergenceState::Waiting,
                ConvergenceState::Checking,
            ]
        );
        assert!(observer.0.lock().unwrap()[0].error.is_empty());
    }

    #[tokio::test]
    async fn test_members_failure_cascades() {
        let mut master = FakeMaster::new("@master:localhost", vec![]);
        master.members_error = true;
        let conv = convergence(
            vec![Arc::new(master)],
            Arc::new(RecordingObserver::default()),
        );
        let err = conv
            .assert(&CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergenceError::Members { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_barrier_still_diffs() {
        // The synchronise event never becomes visible, so the barrier can
        // only end via cancellation; the diff must still run and succeed.
        let mut master = FakeMaster::new("@master:localhost", happy_members());
        master.drop_sent_events = true;
        let observer = Arc::new(RecordingObserver::default());
        let conv = convergence(vec![Arc::new(master)], observer.clone());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let result = conv.assert(&cancel, Duration::ZERO).await;
        assert!(result.is_ok(), "diff should succeed: {result:?}");

        let updates = observer.0.lock().unwrap();
        assert_eq!(updates[0].state, ConvergenceState::Synchronised);
        assert!(
            updates[0].error.contains("context cancelled"),
            "got: {}",
            updates[0].error
        );
        assert_eq!(updates[1].state, ConvergenceState::Waiting);
        assert_eq!(updates[2].state, ConvergenceState::Checking);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_still_emits_all_updates() {
        let mut master = FakeMaster::new("@master:localhost", happy_members());
        master.drop_sent_events = true;
        let observer = Arc::new(RecordingObserver::default());
        let conv = convergence(vec![Arc::new(master)], observer.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = conv.assert(&cancel, Duration::ZERO).await;
        assert!(result.is_ok());

        let states: Vec<ConvergenceState> =
            observer.0.lock().unwrap().iter().map(|p| p.state).collect();
        assert_eq!(
            states,
            vec![
                ConvergenceState::Synchronised,
                ConvergenceState::Waiting,
                ConvergenceState::Checking,
            ]
        );
    }

    #[tokio::test]
    async fn test_sync_mechanism_happy_path() {
        let mut master = FakeMaster::new("@master:localhost", happy_members());
        master.serve_sync = true;
        let conv = convergence(
            vec![Arc::new(master)],
            Arc::new(RecordingObserver::default()),
        )
        .with_mechanism(Mechanism::Sync);
        let result = conv.assert(&CancellationToken::new(), Duration::ZERO).await;
        assert!(result.is_ok(), "unexpected error: {result:?}");
    }

    #[tokio::test]
    async fn test_sync_mechanism_missing_room() {
        // serve_sync is off, so the /sync response has no joined rooms.
        let master = FakeMaster::new("@master:localhost", happy_members());
        let conv = convergence(
            vec![Arc::new(master)],
            Arc::new(RecordingObserver::default()),
        )
        .with_mechanism(Mechanism::Sync);
        let err = conv
            .assert(&CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergenceError::MissingRoom { room } if room == ROOM));
    }

    #[test]
    fn test_membership_projection() {
        assert_eq!(project_membership("join"), Collapsed::Joined);
        for other in ["leave", "ban", "invite", "knock"] {
            assert_eq!(project_membership(other), Collapsed::Left);
        }
    }

    #[test]
    fn test_check_room_state_defaults_absent_users_to_left() {
        let mut want = HashMap::new();
        want.insert(USER_D.to_string(), Collapsed::Left);
        assert!(check_room_state(&[], &[], &want).is_ok());

        want.insert(USER_A.to_string(), Collapsed::Joined);
        let err = check_room_state(&[], &[], &want).unwrap_err();
        assert!(err.contains(USER_A));
        assert!(err.contains("'left'. Want 'joined'"));
    }

    #[test]
    fn test_check_room_state_ignores_extra_users() {
        let mut want = HashMap::new();
        want.insert(USER_A.to_string(), Collapsed::Joined);
        let events = vec![
            member_event(USER_A, "join"),
            member_event("@master:localhost", "join"), // not in ground truth
        ];
        assert!(check_room_state(&events, &[], &want).is_ok());
    }
}
