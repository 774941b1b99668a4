//! Deterministic workload generator.
//!
//! From a fixed seed, emits a reproducible stream of per-(user, room)
//! membership and message commands. Determinism is load-bearing: the
//! convergence checker diffs homeserver state against this generator's
//! ground truth, so the generator must never consult a wall clock or a
//! global RNG, and identical inputs must produce identical trajectories on
//! every platform.

use havoc_proto::Action;
use std::collections::HashMap;

/// Lifecycle of one (user, room) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserRoomState {
    /// Never joined.
    Start,
    /// In the room, last action was a join.
    Joined,
    /// In the room, last action was a send.
    Send,
    /// Previously joined, currently out of the room.
    Left,
}

impl std::fmt::Display for UserRoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Joined => write!(f, "joined"),
            Self::Send => write!(f, "send"),
            Self::Left => write!(f, "left"),
        }
    }
}

/// One command routed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub action: Action,
    pub user_id: String,
    pub room_id: String,
    pub server_names: Vec<String>,
}

impl WorkerCommand {
    /// The end-of-tick sentinel. Carries no user or room.
    pub fn tick_eof() -> Self {
        Self {
            action: Action::TickEof,
            user_id: String::new(),
            room_id: String::new(),
            server_names: Vec::new(),
        }
    }
}

/// Multiplicative-congruential generator (Knuth's MMIX constants). A crate
/// RNG is deliberately not used here: trajectories must be bit-identical
/// across platforms and crate upgrades for a given seed.
#[derive(Debug, Clone)]
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: i64) -> Self {
        Self { state: seed as u64 }
    }

    fn next(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

/// Ground truth of every (user, room) pair plus the generator that advances
/// it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    index: u64,
    rng: Lcg,
    ops_per_tick: usize,
    send_to_leave_probability: u64,
    user_ids: Vec<String>,
    room_ids: Vec<String>,
    states: HashMap<String, HashMap<String, UserRoomState>>,
}

impl StateMachine {
    /// Both ID lists are sorted so command selection is independent of the
    /// order callers discovered them in.
    pub fn new(
        seed: i64,
        ops_per_tick: usize,
        send_to_leave_probability: u64,
        mut user_ids: Vec<String>,
        mut room_ids: Vec<String>,
    ) -> Self {
        user_ids.sort();
        room_ids.sort();
        let mut states = HashMap::new();
        for user in &user_ids {
            let rooms: HashMap<String, UserRoomState> = room_ids
                .iter()
                .map(|r| (r.clone(), UserRoomState::Start))
                .collect();
            states.insert(user.clone(), rooms);
        }
        Self {
            index: 0,
            rng: Lcg::new(seed),
            ops_per_tick,
            send_to_leave_probability,
            user_ids,
            room_ids,
            states,
        }
    }

    /// The number of completed `tick` calls.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Generate the next tick's commands without committing them.
    ///
    /// Works on a copy of the committed state so several commands touching
    /// the same (user, room) within one tick stay legal (e.g. a join
    /// followed by a send).
    pub fn tick(&mut self) -> Vec<WorkerCommand> {
        self.index += 1;
        let mut cmds = Vec::with_capacity(self.ops_per_tick);
        if self.user_ids.is_empty() || self.room_ids.is_empty() {
            return cmds;
        }
        let mut working = self.states.clone();
        for _ in 0..self.ops_per_tick {
            let user_id = self.user_ids[self.rng.below(self.user_ids.len())].clone();
            let room_id = self.room_ids[self.rng.below(self.room_ids.len())].clone();
            let entry = working
                .get_mut(&user_id)
                .and_then(|rooms| rooms.get_mut(&room_id));
            let Some(state) = entry else { continue };
            match *state {
                UserRoomState::Start | UserRoomState::Left => {
                    // The only valid transition is a join.
                    cmds.push(WorkerCommand {
                        action: Action::Join,
                        user_id,
                        room_id,
                        server_names: Vec::new(),
                    });
                    *state = UserRoomState::Joined;
                }
                UserRoomState::Joined | UserRoomState::Send => {
                    let should_leave = (self.rng.below(100) as u64) <
                        self.send_to_leave_probability;
                    if should_leave {
                        cmds.push(WorkerCommand {
                            action: Action::Leave,
                            user_id,
                            room_id,
                            server_names: Vec::new(),
                        });
                        *state = UserRoomState::Left;
                    } else {
                        cmds.push(WorkerCommand {
                            action: Action::Send,
                            user_id,
                            room_id,
                            server_names: Vec::new(),
                        });
                        *state = UserRoomState::Send;
                    }
                }
            }
        }
        cmds
    }

    /// Commit a tick's commands to the ground truth. Called only once every
    /// worker has acknowledged the tick.
    pub fn apply(&mut self, cmds: &[WorkerCommand]) {
        for cmd in cmds {
            let Some(state) = action_to_state(cmd.action) else {
                continue; // TickEof never reaches apply
            };
            if let Some(rooms) = self.states.get_mut(&cmd.user_id) {
                rooms.insert(cmd.room_id.clone(), state);
            }
        }
    }

    /// Deep copy of the ground truth, user ID -> room ID -> state.
    pub fn snapshot(&self) -> HashMap<String, HashMap<String, UserRoomState>> {
        self.states.clone()
    }
}

fn action_to_state(action: Action) -> Option<UserRoomState> {
    match action {
        Action::Join => Some(UserRoomState::Joined),
        Action::Leave => Some(UserRoomState::Left),
        Action::Send => Some(UserRoomState::Send),
        Action::TickEof => None,
    }
}
