//! The server core: accept loop, idle watchdog, two-phase shutdown.
//!
//! [`Server::run`] owns every piece of server state — the listener set,
//! the session registry, the validator and the activity mark — and drives
//! them until the shutdown token fires. Shutdown is two-phase:
//!
//! 1. **Drain** — the listeners close so nothing new arrives, every live
//!    game gets SIGTERM, and sessions are given a grace period to wind
//!    down on their own (a game saves, closes its pipes, its client sees
//!    the half-close and disconnects).
//! 2. **Hard stop** — at the deadline, or as soon as the client count hits
//!    zero, every connection task is cancelled and surviving children get
//!    SIGKILL.
//!
//! The wall time from signal to exit is bounded by the grace period.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::ActivityMark;
use crate::auth::Authenticator;
use crate::config::Config;
use crate::conn;
use crate::listener::ListenerSet;
use crate::sessions::SessionRegistry;

/// A bound, not-yet-running server.
pub struct Server {
    config: Arc<Config>,
    registry: SessionRegistry,
    authenticator: Arc<dyn Authenticator>,
    listeners: ListenerSet,
    activity: Arc<ActivityMark>,
}

impl Server {
    /// Bind the configured listeners. Fails only if no listener at all
    /// could be created.
    pub fn bind(config: Config, authenticator: Arc<dyn Authenticator>) -> io::Result<Self> {
        let listeners = ListenerSet::bind(&config.server)?;
        Ok(Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            authenticator,
            listeners,
            activity: Arc::new(ActivityMark::new()),
        })
    }

    /// Addresses actually bound (useful with port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.local_addrs()
    }

    /// A handle onto the session registry, shared with every connection.
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Serve until `shutdown` fires, then drain and stop. Returns once the
    /// hard stop has completed; the caller can exit.
    pub async fn run(self, shutdown: CancellationToken) {
        let Server {
            config,
            registry,
            authenticator,
            listeners,
            activity,
        } = self;
        let ListenerSet { v4, v6 } = listeners;

        // Per-connection tasks watch this token; it fires at phase 2.
        let hard_stop = CancellationToken::new();

        let mark_task = spawn_idle_watchdog(
            Arc::clone(&activity),
            Duration::from_secs(config.server.idle_mark_secs),
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                r = accept_on(v4.as_ref()) => {
                    spawn_connection(r, &registry, &authenticator, &config, &activity, &hard_stop);
                }
                r = accept_on(v6.as_ref()) => {
                    spawn_connection(r, &registry, &authenticator, &config, &activity, &hard_stop);
                }
            }
        }

        mark_task.abort();

        // Phase 1: stop accepting, ask the games to wind down, wait.
        info!(
            "Shutdown request received; {} clients active.",
            registry.client_count().await
        );
        drop(v4);
        drop(v6);

        if registry.client_count().await > 0 {
            let grace = Duration::from_millis(config.server.shutdown_grace_ms);
            info!(
                "Server sockets closed, will wait {} seconds for clients to shut down.",
                grace.as_secs()
            );
            registry.terminate_children().await;

            let deadline = tokio::time::Instant::now() + grace;
            while registry.client_count().await > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        // Phase 2: hard stop.
        hard_stop.cancel();
        registry.kill_all().await;
    }
}

/// Accept on a listener that may not exist; an absent listener never
/// becomes ready.
async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

fn spawn_connection(
    accepted: io::Result<(TcpStream, SocketAddr)>,
    registry: &SessionRegistry,
    authenticator: &Arc<dyn Authenticator>,
    config: &Arc<Config>,
    activity: &Arc<ActivityMark>,
    hard_stop: &CancellationToken,
) {
    let (stream, peer) = match accepted {
        Ok(pair) => pair,
        Err(e) => {
            // Most commonly the connection was aborted before acceptance.
            debug!("accept failed: {e}");
            return;
        }
    };

    activity.touch();
    info!("New connection from {peer}.");

    if let Err(e) = stream.set_nodelay(true) {
        warn!("setting TCP_NODELAY failed: {e}");
    }

    tokio::spawn(conn::handle_connection(
        stream,
        peer,
        registry.clone(),
        Arc::clone(authenticator),
        Arc::clone(config),
        Arc::clone(activity),
        hard_stop.clone(),
    ));
}

/// Log a mark line once per idle interval so an operator tailing the log
/// can tell a quiet server from a wedged one.
fn spawn_idle_watchdog(
    activity: Arc<ActivityMark>,
    idle_mark: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_marked = tokio::time::Instant::now();
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if activity.idle_for() >= idle_mark && last_marked.elapsed() >= idle_mark {
                info!(
                    " -- mark (no activity for {} minutes) --",
                    idle_mark.as_secs() / 60
                );
                last_marked = tokio::time::Instant::now();
            }
        }
    })
}
