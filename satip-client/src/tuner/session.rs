//! Session state shared between the controller loop and its callers.

use std::collections::VecDeque;
use std::fmt;

use satip_protocol::ReceptionStatus;

use crate::server::ServerRef;

/// Dummy pid appended for servers that refuse a lone PSI pid.
const DUMMY_PID: u16 = 100;

/// Pids below this value carry PSI/SI tables.
const PSI_PID_LIMIT: u16 = 0x20;

/// Controller states, ordered by how far the session got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TunerState {
    Idle,
    Released,
    Set,
    Tuned,
    Locked,
}

impl fmt::Display for TunerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunerState::Idle => "Idle",
            TunerState::Released => "Released",
            TunerState::Set => "Set",
            TunerState::Tuned => "Tuned",
            TunerState::Locked => "Locked",
        };
        f.write_str(name)
    }
}

/// Who asked for a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// The controller loop itself.
    Internal,
    /// A public operation.
    External,
}

/// Kind of stream a pid is requested for. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidType {
    Video,
    Audio,
    Section,
    Other,
}

impl fmt::Display for PidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PidType::Video => "video",
            PidType::Audio => "audio",
            PidType::Section => "section",
            PidType::Other => "other",
        };
        f.write_str(name)
    }
}

/// Sorted set of pids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidSet(Vec<u16>);

impl PidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pid: u16) -> bool {
        match self.0.binary_search(&pid) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, pid);
                true
            }
        }
    }

    pub fn remove(&mut self, pid: u16) -> bool {
        match self.0.binary_search(&pid) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, pid: u16) -> bool {
        self.0.binary_search(&pid).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    /// Comma separated list, e.g. `0,16,17`.
    pub fn to_csv(&self) -> String {
        self.0
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Requested pids and the changes not yet sent to the server.
///
/// A pid is never pending for addition and deletion at the same time.
#[derive(Debug, Clone, Default)]
pub struct PidState {
    pids: PidSet,
    add: PidSet,
    del: PidSet,
}

impl PidState {
    pub fn set(&mut self, pid: u16, on: bool) {
        if on {
            self.pids.add(pid);
            self.add.add(pid);
            self.del.remove(pid);
        } else {
            self.pids.remove(pid);
            self.del.add(pid);
            self.add.remove(pid);
        }
    }

    pub fn pids(&self) -> &PidSet {
        &self.pids
    }

    pub fn has_changes(&self) -> bool {
        !self.add.is_empty() || !self.del.is_empty()
    }

    /// Forget the pending changes; the requested set is kept.
    pub fn clear_pending(&mut self) {
        self.add.clear();
        self.del.clear();
    }

    /// Pending changes, to be passed to [`commit`](Self::commit) once sent.
    pub fn pending(&self) -> (PidSet, PidSet) {
        (self.add.clone(), self.del.clone())
    }

    /// Drop the sent changes from the pending sets.
    pub fn commit(&mut self, sent: &(PidSet, PidSet)) {
        for pid in sent.0.iter() {
            self.add.remove(pid);
        }
        for pid in sent.1.iter() {
            self.del.remove(pid);
        }
    }

    /// Query appended to `stream=<id>` for a PLAY updating the pids.
    pub fn play_query(&self, force: bool, play_pids: bool) -> String {
        let mut query = String::new();
        if force || play_pids {
            if !self.pids.is_empty() {
                query.push_str("?pids=");
                query.push_str(&self.pids.to_csv());
                let lone_psi = self.pids.len() == 1 && self.pids.iter().all(|p| p < PSI_PID_LIMIT);
                if play_pids && lone_psi {
                    query.push_str(&format!(",{}", DUMMY_PID));
                }
            }
        } else {
            if !self.add.is_empty() {
                query.push_str("?addpids=");
                query.push_str(&self.add.to_csv());
            }
            if !self.del.is_empty() {
                query.push(if query.is_empty() { '?' } else { '&' });
                query.push_str("delpids=");
                query.push_str(&self.del.to_csv());
            }
        }
        query
    }
}

/// Queued state requests. Internal requests are served first.
#[derive(Debug, Default)]
pub struct StateRequests {
    internal: VecDeque<TunerState>,
    external: VecDeque<TunerState>,
}

impl StateRequests {
    /// Queue `state`. An internal release is refused when the session
    /// would already be idle at that point.
    pub fn request(&mut self, state: TunerState, origin: RequestOrigin, current: TunerState) -> bool {
        match origin {
            RequestOrigin::External => self.external.push_back(state),
            RequestOrigin::Internal => {
                let last = self.internal.back().copied().unwrap_or(current);
                if last == TunerState::Idle && state == TunerState::Released {
                    return false;
                }
                self.internal.push_back(state);
            }
        }
        true
    }

    pub fn next(&mut self) -> Option<TunerState> {
        self.internal
            .pop_front()
            .or_else(|| self.external.pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.internal.is_empty() && self.external.is_empty()
    }
}

/// Everything the public operations read or stage, guarded by one lock.
#[derive(Debug)]
pub struct TunerSession {
    pub state: TunerState,
    pub requests: StateRequests,
    /// Server and parameters of the next connect.
    pub next_server: Option<ServerRef>,
    pub params: String,
    pub frontend_index: i32,
    /// Server the session is attached to.
    pub current_server: Option<ServerRef>,
    pub stream_id: i32,
    pub mode: &'static str,
    pub reception: ReceptionStatus,
    pub pids: PidState,
}

impl Default for TunerSession {
    fn default() -> Self {
        Self {
            state: TunerState::Idle,
            requests: StateRequests::default(),
            next_server: None,
            params: String::new(),
            frontend_index: -1,
            current_server: None,
            stream_id: -1,
            mode: "Unicast",
            reception: ReceptionStatus::default(),
            pids: PidState::default(),
        }
    }
}

impl TunerSession {
    pub fn request(&mut self, state: TunerState, origin: RequestOrigin) -> bool {
        let current = self.state;
        self.requests.request(state, origin, current)
    }

    pub fn has_stream(&self) -> bool {
        self.stream_id >= 0
    }

    pub fn has_lock(&self) -> bool {
        self.state >= TunerState::Tuned && self.reception.has_lock
    }
}
