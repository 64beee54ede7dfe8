//! One task per client connection: credential handshake, then byte relay.
//!
//! ## Lifecycle
//!
//! 1. The connection starts pending: bytes accumulate in an
//!    [`AuthFramer`] until a complete credential frame arrives (bounded by
//!    the auth timeout and the 500-byte cap).
//! 2. The validator maps the frame to a userid. Failure gets the
//!    [`AUTH_FAILED`] byte; the read side then goes deaf and the socket is
//!    released only when the peer closes, so the byte always completes its
//!    transmission. Success either splices the connection onto a surviving
//!    orphaned session ([`AUTH_SUCCESS_RECONNECT`]) or spawns a fresh game
//!    ([`AUTH_SUCCESS_NEW`]).
//! 3. Relay: an ingress task pumps socket reads into the game's stdin
//!    channel while this task drains the egress channel into the socket.
//!    The relay is byte-transparent — no framing, no inspection.
//!
//! ## Disconnect vs. child exit
//!
//! If the peer goes away while the game lives, the session is detached
//! (orphaned) and the child never notices. If the game closes its pipes,
//! the egress channel ends; the socket is half-closed so the last output
//! drains, and the session is destroyed once the peer closes its end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityMark;
use crate::auth::{Authenticator, UserId};
use crate::config::Config;
use crate::game;
use crate::protocol::{
    AuthFramer, FrameStatus, AUTH_FAILED, AUTH_SUCCESS_NEW, AUTH_SUCCESS_RECONNECT,
};
use crate::sessions::session::RELAY_CHUNK;
use crate::sessions::{AuthAdmission, SessionId, SessionRegistry};

/// Depth of the per-connection egress channel (game → client). Small on
/// purpose: a slow client backs the game's output pipe up, which is the
/// flow control the game expects.
const EGRESS_QUEUE: usize = 32;

/// Drive one accepted connection to completion.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: SessionRegistry,
    authenticator: Arc<dyn Authenticator>,
    config: Arc<Config>,
    activity: Arc<ActivityMark>,
    hard_stop: CancellationToken,
) {
    registry.client_arrived().await;

    let auth_timeout = Duration::from_secs(config.server.auth_timeout_secs);
    let frame = tokio::select! {
        r = tokio::time::timeout(auth_timeout, read_auth_frame(&mut stream, &peer, &activity)) => {
            match r {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    registry.pending_departed().await;
                    return;
                }
                Err(_) => {
                    debug!("Authentication timed out for {peer}");
                    registry.pending_departed().await;
                    return;
                }
            }
        }
        () = hard_stop.cancelled() => {
            registry.pending_departed().await;
            return;
        }
    };

    let Some(userid) = authenticator.authenticate(&frame) else {
        send_result_and_drain(&mut stream, AUTH_FAILED).await;
        registry.pending_departed().await;
        return;
    };

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(EGRESS_QUEUE);

    let (session_id, input, result) = match registry.begin_auth(userid, out_tx).await {
        AuthAdmission::Reconnect {
            session_id, input, ..
        } => (session_id, input, AUTH_SUCCESS_RECONNECT),
        AuthAdmission::AlreadyActive => {
            info!("User {userid} is already connected; rejecting second login from {peer}");
            send_result_and_drain(&mut stream, AUTH_FAILED).await;
            registry.pending_departed().await;
            return;
        }
        AuthAdmission::NewGame { sink } => {
            let child = match game::spawn_game(&config.game, userid) {
                Ok(child) => child,
                Err(e) => {
                    // The nascent session is torn down; the peer just sees
                    // the socket close, never a success byte.
                    error!("Failed to spawn a game process for user {userid}: {e}");
                    registry.abort_reservation(userid).await;
                    registry.pending_departed().await;
                    return;
                }
            };
            match registry.adopt(userid, child, sink).await {
                Ok((session_id, input, _pid)) => (session_id, input, AUTH_SUCCESS_NEW),
                Err(e) => {
                    error!("Failed to set up a session for user {userid}: {e}");
                    registry.abort_reservation(userid).await;
                    registry.pending_departed().await;
                    return;
                }
            }
        }
    };

    if let Err(e) = stream.write_all(&[result]).await {
        // The peer vanished right after authenticating; the relay loop
        // below observes the dead socket and detaches.
        debug!("Failed to send auth result to {peer}: {e}");
    }

    relay(
        stream, session_id, userid, input, out_rx, registry, activity, hard_stop,
    )
    .await;
}

/// Accumulate pre-auth bytes until a complete credential frame is seen.
///
/// Returns `None` when the connection should be destroyed instead
/// (peer gone, read error, overrun).
async fn read_auth_frame(
    stream: &mut TcpStream,
    peer: &SocketAddr,
    activity: &ActivityMark,
) -> Option<Vec<u8>> {
    let mut framer = AuthFramer::new();
    let mut buf = [0u8; 512];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!("Error reading pre-auth socket from {peer}: {e}");
                return None;
            }
        };
        activity.touch();
        match framer.feed(&buf[..n]) {
            FrameStatus::NeedMore => {}
            FrameStatus::Ready => return Some(framer.frame().to_vec()),
            FrameStatus::Overflow => {
                warn!("Auth buffer overrun attempt from {peer}? Peer disconnected.");
                return None;
            }
            FrameStatus::PeerGone => return None,
        }
    }
}

/// Send an auth status byte and stop listening, without closing.
///
/// Closing here would be too brutal: a close with the byte still queued
/// (or with stray peer bytes unread) can turn into a reset that discards
/// it. Instead the read side goes deaf — anything else the peer sends is
/// discarded — and the socket is released only once the peer closes its
/// end, so the transmission (including retransmits) always completes.
async fn send_result_and_drain(stream: &mut TcpStream, result: u8) {
    if stream.write_all(&[result]).await.is_err() {
        return;
    }

    let mut scratch = [0u8; 256];
    loop {
        match stream.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// The relay phase of a connected session.
#[allow(clippy::too_many_arguments)]
async fn relay(
    stream: TcpStream,
    session_id: SessionId,
    userid: UserId,
    input: mpsc::Sender<Vec<u8>>,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    registry: SessionRegistry,
    activity: Arc<ActivityMark>,
    hard_stop: CancellationToken,
) {
    let (rd, mut wr) = stream.into_split();

    // Ingress runs as its own task so a game that stops reading stdin can
    // never stall the egress side into a cross-pipe deadlock.
    let ingress_activity = Arc::clone(&activity);
    let mut ingress = tokio::spawn(ingress_loop(rd, input, userid, ingress_activity));

    let mut egress_open = true;
    let mut child_gone = false;

    loop {
        tokio::select! {
            m = out_rx.recv(), if egress_open => match m {
                Some(data) => {
                    activity.touch();
                    if let Err(e) = wr.write_all(&data).await {
                        // Not fatal on its own: the ingress side decides
                        // when the connection is dead.
                        debug!("Error while sending to user {userid}: {e}");
                    }
                }
                None => {
                    // The game closed its pipes and is exiting. Half-close
                    // so the last output drains, then wait for the peer to
                    // close its end.
                    egress_open = false;
                    child_gone = true;
                    let _ = wr.shutdown().await;
                }
            },
            _ = &mut ingress => break,
            () = hard_stop.cancelled() => {
                ingress.abort();
                return;
            }
        }
    }

    if child_gone {
        registry.remove(session_id).await;
    } else {
        // The peer may vanish in the same instant the game exits; detach
        // re-checks the pipe state under the registry lock and destroys the
        // session instead of orphaning one whose child is already gone.
        registry.detach(session_id).await;
    }
}

/// Pump socket reads into the game's stdin channel until the peer closes.
async fn ingress_loop(
    mut rd: OwnedReadHalf,
    input: mpsc::Sender<Vec<u8>>,
    userid: UserId,
    activity: Arc<ActivityMark>,
) {
    let mut buf = [0u8; RELAY_CHUNK];
    let mut forwarding = true;
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => break,
            Err(e) => {
                debug!("Socket read error for user {userid}: {e}");
                break;
            }
            Ok(n) => {
                activity.touch();
                if forwarding && input.send(buf[..n].to_vec()).await.is_err() {
                    // The game's stdin is gone: it is exiting. Keep
                    // draining the socket so the close is still observed;
                    // the bytes have nowhere to go.
                    forwarding = false;
                }
            }
        }
    }
}
