//! Restart-on-crash wrapper for the server process.
//!
//! `gamemux supervise` keeps one `gamemux serve` child alive. A crash is
//! restarted after a delay that doubles on every quick failure and drops
//! back to one second once the server has stayed up past the stability
//! threshold. A clean exit (code 0) ends the wrapper. Termination signals
//! are passed through to whichever child is current, so the server still
//! runs its own graceful drain.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use gamemux::config::SupervisorConfig;

/// Run the restart loop. Returns the process exit code: 0 after a clean
/// server exit, 1 when the server binary cannot be launched at all.
pub async fn run_supervisor(config_path: Option<&str>, policy: &SupervisorConfig) -> i32 {
    let exe = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            error!("Cannot resolve own executable path: {e}");
            return 1;
        }
    };

    // One forwarder for the whole wrapper lifetime. It reads the current
    // child pid at delivery time, so a signal arriving mid-restart goes to
    // the right process (or nowhere, if none is up).
    let current_pid = Arc::new(AtomicU32::new(0));
    spawn_signal_forwarder(Arc::clone(&current_pid));

    let stable_after = Duration::from_secs(policy.stable_threshold);
    let max_delay = Duration::from_secs(policy.max_backoff);
    let mut delay = Duration::from_secs(1);
    let mut restarts = 0u32;

    loop {
        let mut cmd = Command::new(&exe);
        cmd.arg("serve");
        if let Some(path) = config_path {
            cmd.args(["--config", path]);
        }

        let launched = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // If the binary itself cannot start there is nothing a
                // retry loop can do.
                error!("Could not launch the server: {e}");
                return 1;
            }
        };
        let pid = child.id().unwrap_or(0);
        current_pid.store(pid, Ordering::Relaxed);
        info!("Watching server pid {pid} (restarts so far: {restarts})");

        let outcome = child.wait().await;
        current_pid.store(0, Ordering::Relaxed);
        let lived = launched.elapsed();

        match outcome {
            Ok(status) if status.success() => {
                info!("Server finished cleanly; nothing left to watch");
                return 0;
            }
            Ok(status) => {
                warn!("Server died ({status}) after {}s", lived.as_secs());
            }
            Err(e) => {
                warn!("Lost track of the server process: {e}");
            }
        }

        // A server that survived the threshold earned a fresh slate; a
        // crash loop keeps doubling up to the cap.
        if lived >= stable_after {
            delay = Duration::from_secs(1);
        }
        restarts += 1;
        info!("Restarting in {}s", delay.as_secs());
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// Relay SIGINT/SIGTERM to the child named by `current_pid`.
fn spawn_signal_forwarder(current_pid: Arc<AtomicU32>) {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(i), Ok(t)) => (i, t),
                _ => {
                    warn!("Signal registration failed; shutdown signals will not reach the server");
                    return;
                }
            };
        loop {
            let signo = tokio::select! {
                _ = sigint.recv() => libc::SIGINT,
                _ = sigterm.recv() => libc::SIGTERM,
            };
            let pid = current_pid.load(Ordering::Relaxed);
            if pid != 0 {
                info!("Passing signal {signo} through to server pid {pid}");
                #[allow(clippy::cast_possible_wrap)]
                unsafe {
                    libc::kill(pid as i32, signo);
                }
            }
        }
    });
}
