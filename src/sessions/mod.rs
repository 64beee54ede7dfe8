//! Session lifecycle management.
//!
//! [`SessionRegistry`] is the single authority for creating, merging, and
//! destroying game sessions. It tracks the three populations the server
//! cares about:
//!
//! - **pending** — accepted connections still inside the credential
//!   handshake. No child yet; tracked as a count so the client total
//!   matches what an operator sees in the logs.
//! - **connected** — a live game child with an attached client.
//! - **orphaned** — a live game child whose client went away. The child
//!   keeps running; its output is discarded until the user reconnects.
//!
//! At most one session per userid exists across connected ∪ orphaned. The
//! userid is *reserved* under the write lock before the (slow) spawn, so
//! two simultaneous logins for the same user cannot both create a game.
//!
//! ## Concurrency
//!
//! The registry is behind an `RwLock`; every state transition happens
//! under the write lock. Sessions referenced by events that lose a race
//! with cleanup simply fail the map lookup and the event is dropped, which
//! is the supervisor-wide rule for freed sessions.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::auth::UserId;
use session::GameSession;

/// Monotonically increasing session identity. Never reused, so a stale id
/// can always be looked up safely.
pub type SessionId = u64;

/// Which population a registered session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Orphaned,
}

/// Outcome of [`SessionRegistry::begin_auth`].
pub enum AuthAdmission {
    /// A disconnected game for this user exists; the new connection has
    /// been spliced onto it.
    Reconnect {
        session_id: SessionId,
        pid: u32,
        input: mpsc::Sender<Vec<u8>>,
    },
    /// No live game for this user. The userid is now reserved; the caller
    /// must spawn and then call [`SessionRegistry::adopt`] or
    /// [`SessionRegistry::abort_reservation`].
    NewGame { sink: mpsc::Sender<Vec<u8>> },
    /// The userid already has a connected session or a login in flight.
    AlreadyActive,
}

struct SessionEntry {
    session: GameSession,
    state: SessionState,
}

/// Reservation state for a userid.
enum UserSlot {
    /// An authenticated connection is between spawn and adoption.
    Reserved,
    Active(SessionId),
}

struct Inner {
    next_id: SessionId,
    sessions: HashMap<SessionId, SessionEntry>,
    by_user: HashMap<UserId, UserSlot>,
    pending: usize,
}

impl Inner {
    fn client_count(&self) -> usize {
        self.pending + self.sessions.len()
    }

    fn log_count(&self) {
        info!("There are now {} clients on the server", self.client_count());
    }
}

/// Manages the pool of game sessions.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                next_id: 1,
                sessions: HashMap::new(),
                by_user: HashMap::new(),
                pending: 0,
            })),
        }
    }

    /// A connection was accepted and is entering the credential handshake.
    pub async fn client_arrived(&self) {
        let mut inner = self.inner.write().await;
        inner.pending += 1;
        inner.log_count();
    }

    /// A pending connection went away without becoming a session (peer
    /// gone, overrun, auth failure, spawn failure, timeout).
    pub async fn pending_departed(&self) {
        let mut inner = self.inner.write().await;
        inner.pending = inner.pending.saturating_sub(1);
        inner.log_count();
    }

    /// Admit an authenticated connection.
    ///
    /// `sink` is the connection's egress channel. On reconnect it is
    /// attached to the surviving session and the pending record is merged
    /// away; for a new user it is handed back for [`Self::adopt`].
    pub async fn begin_auth(&self, userid: UserId, sink: mpsc::Sender<Vec<u8>>) -> AuthAdmission {
        let mut inner = self.inner.write().await;

        let slot = match inner.by_user.get(&userid) {
            Some(UserSlot::Reserved) => return AuthAdmission::AlreadyActive,
            Some(UserSlot::Active(id)) => Some(*id),
            None => None,
        };

        match slot {
            Some(id) => {
                match inner.sessions.get_mut(&id) {
                    Some(entry) if entry.state == SessionState::Orphaned => {
                        entry.state = SessionState::Connected;
                        entry.session.attach(sink).await;
                        let pid = entry.session.pid;
                        let input = entry.session.input();
                        // The pending record is absorbed by the session it
                        // reconnected to.
                        inner.pending = inner.pending.saturating_sub(1);
                        info!("Connection to game at pid {pid} reestablished for user {userid}");
                        inner.log_count();
                        AuthAdmission::Reconnect {
                            session_id: id,
                            pid,
                            input,
                        }
                    }
                    Some(_) => AuthAdmission::AlreadyActive,
                    None => {
                        // Stale index entry; treat the user as absent.
                        inner.by_user.insert(userid, UserSlot::Reserved);
                        AuthAdmission::NewGame { sink }
                    }
                }
            }
            None => {
                inner.by_user.insert(userid, UserSlot::Reserved);
                AuthAdmission::NewGame { sink }
            }
        }
    }

    /// Release a reservation made by [`Self::begin_auth`] after a failed
    /// spawn.
    pub async fn abort_reservation(&self, userid: UserId) {
        let mut inner = self.inner.write().await;
        if matches!(inner.by_user.get(&userid), Some(UserSlot::Reserved)) {
            inner.by_user.remove(&userid);
        }
    }

    /// Register a freshly spawned game child under a reserved userid and
    /// promote the pending connection to connected.
    ///
    /// Returns `(session_id, stdin sender, pid)`.
    pub async fn adopt(
        &self,
        userid: UserId,
        child: tokio::process::Child,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<(SessionId, mpsc::Sender<Vec<u8>>, u32), String> {
        let mut inner = self.inner.write().await;

        let id = inner.next_id;
        inner.next_id += 1;

        let session = GameSession::start(id, userid, child, sink, self.clone())?;
        let pid = session.pid;
        let input = session.input();

        inner.by_user.insert(userid, UserSlot::Active(id));
        inner.sessions.insert(
            id,
            SessionEntry {
                session,
                state: SessionState::Connected,
            },
        );
        inner.pending = inner.pending.saturating_sub(1);

        Ok((id, input, pid))
    }

    /// The client socket is gone but the child lives: connected → orphaned.
    ///
    /// If the child's pipes closed in the same instant, the session is
    /// destroyed instead — an orphan with closed pipes would never be
    /// swept again.
    pub async fn detach(&self, session_id: SessionId) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.sessions.get_mut(&session_id) else {
            return;
        };
        if entry.state != SessionState::Connected {
            return;
        }
        if entry.session.pipes_open() {
            entry.state = SessionState::Orphaned;
            entry.session.detach().await;
            info!("User {} has disconnected from a game", entry.session.userid);
        } else if let Some(entry) = inner.sessions.remove(&session_id) {
            release_entry(&mut inner, session_id, entry);
            inner.log_count();
        }
    }

    /// The child closed its pipes and is exiting.
    ///
    /// Orphaned sessions are destroyed on the spot. Connected sessions keep
    /// their entry — the attached connection observes the egress close,
    /// half-closes the socket to drain, and calls [`Self::remove`] once the
    /// peer closes.
    pub async fn pipes_closed(&self, session_id: SessionId) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.sessions.get_mut(&session_id) else {
            return;
        };
        entry.session.detach().await;
        if entry.state == SessionState::Orphaned {
            if let Some(entry) = inner.sessions.remove(&session_id) {
                release_entry(&mut inner, session_id, entry);
                inner.log_count();
            }
        }
    }

    /// Destroy a session after its child has gone away.
    pub async fn remove(&self, session_id: SessionId) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.sessions.remove(&session_id) else {
            debug!("remove: session {session_id} already gone");
            return;
        };
        release_entry(&mut inner, session_id, entry);
        inner.log_count();
    }

    /// Clients across all populations, pending included.
    pub async fn client_count(&self) -> usize {
        self.inner.read().await.client_count()
    }

    /// `(pending, connected, orphaned)` population sizes.
    pub async fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.read().await;
        let connected = inner
            .sessions
            .values()
            .filter(|e| e.state == SessionState::Connected)
            .count();
        (
            inner.pending,
            connected,
            inner.sessions.len() - connected,
        )
    }

    /// Shutdown phase 1: ask every live game to save and exit.
    pub async fn terminate_children(&self) {
        let inner = self.inner.read().await;
        for entry in inner.sessions.values() {
            if entry.session.is_running().await {
                info!(
                    "Sent SIGTERM to game at pid {} (shutdown)",
                    entry.session.pid
                );
                entry.session.send_signal(libc::SIGTERM);
            }
        }
    }

    /// Shutdown phase 2: SIGKILL whatever survived the grace period and
    /// drop every session.
    pub async fn kill_all(&self) {
        let mut inner = self.inner.write().await;
        let count = inner.sessions.len();
        for (_, entry) in inner.sessions.drain() {
            entry.session.kill();
        }
        inner.by_user.clear();
        if count > 0 {
            info!("Shut down {count} session(s)");
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Common tail of every destruction path: unindex the userid, stop the
/// relay tasks (the exit watcher stays so the child is reaped), log.
fn release_entry(inner: &mut Inner, session_id: SessionId, entry: SessionEntry) {
    let owns_userid = matches!(
        inner.by_user.get(&entry.session.userid),
        Some(UserSlot::Active(id)) if *id == session_id
    );
    if owns_userid {
        inner.by_user.remove(&entry.session.userid);
    }
    entry.session.abort_io();
    info!("Shutdown completed for game at pid {}", entry.session.pid);
}


#[cfg(test)]
impl SessionRegistry {
    /// Deliver SIGTERM to one session's child so tests can provoke a
    /// child-initiated exit.
    async fn signal_for_test(&self, session_id: SessionId) {
        let inner = self.inner.read().await;
        if let Some(entry) = inner.sessions.get(&session_id) {
            entry.session.send_signal(libc::SIGTERM);
        }
    }
}
