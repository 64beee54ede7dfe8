//! One running game subprocess and its I/O tasks.
//!
//! A [`GameSession`] wraps a game child whose stdin/stdout are driven by
//! background tasks instead of being coupled directly to a client socket.
//! This is what lets the session survive client disconnects: the stdout
//! reader forwards to whatever sink is currently attached, and simply
//! discards output while no client is attached, so the child can never
//! deadlock on a full pipe waiting for an absent user.
//!
//! ## Tasks
//!
//! Three per session, the same trio shape as a piped shell session:
//! - **stdin writer** — drains the input channel into the child's stdin.
//! - **stdout reader** — reads the child's stdout and forwards chunks to
//!   the attached sink. When the child closes its pipe it is exiting; the
//!   reader drops the sink (so an attached connection sees end-of-stream)
//!   and tells the registry.
//! - **exit watcher** — reaps the child and records its exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{SessionId, SessionRegistry};
use crate::auth::UserId;

/// Chunk size for both relay directions.
pub const RELAY_CHUNK: usize = 8192;

/// Depth of the per-session input channel (client → game).
const INPUT_QUEUE: usize = 64;

/// Child process lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Running,
    Exited,
}

/// A running game subprocess with channel-backed I/O.
pub struct GameSession {
    /// Owner of this game.
    pub userid: UserId,
    /// OS process ID of the game (also its process group ID).
    pub pid: u32,
    /// Channel to the stdin writer task (raw bytes).
    input_tx: mpsc::Sender<Vec<u8>>,
    /// Where the stdout reader delivers output. `None` while no client is
    /// attached; chunks produced then are discarded.
    client_sink: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    /// Child lifecycle status, set by the exit watcher.
    status: Arc<Mutex<GameStatus>>,
    /// Cleared by the reader task the moment the child's pipe closes, so
    /// state transitions can tell a disconnecting client from a dead game
    /// without waiting for the registry callback.
    pipes_open: Arc<AtomicBool>,
    /// stdin writer + stdout reader. Aborted on teardown.
    io_tasks: Vec<JoinHandle<()>>,
    /// Exit watcher. Left running on a natural child exit so the child is
    /// reaped; aborted only on a hard kill.
    exit_task: Option<JoinHandle<()>>,
}

impl GameSession {
    /// Take ownership of a freshly spawned game child and start its tasks.
    ///
    /// `first_sink` is the egress channel of the connection that caused the
    /// spawn, attached from the first byte. The reader task reports a pipe
    /// close to `registry` under `session_id`.
    pub fn start(
        session_id: SessionId,
        userid: UserId,
        mut child: Child,
        first_sink: mpsc::Sender<Vec<u8>>,
        registry: SessionRegistry,
    ) -> Result<Self, String> {
        let pid = child.id().unwrap_or(0);

        let stdin = child.stdin.take().ok_or("Failed to take stdin pipe")?;
        let stdout = child.stdout.take().ok_or("Failed to take stdout pipe")?;

        let client_sink = Arc::new(Mutex::new(Some(first_sink)));
        let status = Arc::new(Mutex::new(GameStatus::Running));
        let pipes_open = Arc::new(AtomicBool::new(true));

        // stdin writer task
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
        let writer_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(data) = input_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // stdout reader task — forwards to the attached sink, discards while
        // orphaned
        let sink_slot = Arc::clone(&client_sink);
        let pipes_flag = Arc::clone(&pipes_open);
        let reader_registry = registry;
        let reader_task = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = [0u8; RELAY_CHUNK];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let sink = { sink_slot.lock().await.clone() };
                        if let Some(tx) = sink {
                            // A failed send means the attached connection died
                            // between chunks; the bytes are dropped exactly
                            // like orphan-interval output.
                            let _ = tx.send(buf[..n].to_vec()).await;
                        }
                    }
                }
            }
            // The child closed its pipe: it is exiting. Drop the sink first
            // so an attached connection observes end-of-stream even if the
            // session never made it into the registry.
            sink_slot.lock().await.take();
            pipes_flag.store(false, Ordering::Release);
            reader_registry.pipes_closed(session_id).await;
        });

        // Exit watcher task
        let status_exit = Arc::clone(&status);
        let exit_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(s) => {
                    let code = s.code().unwrap_or(-1);
                    info!("Game at pid {pid} (user {userid}) exited with code {code}");
                }
                Err(e) => {
                    error!("Game at pid {pid} wait error: {e}");
                }
            }
            *status_exit.lock().await = GameStatus::Exited;
        });

        Ok(GameSession {
            userid,
            pid,
            input_tx,
            client_sink,
            status,
            pipes_open,
            io_tasks: vec![writer_task, reader_task],
            exit_task: Some(exit_task),
        })
    }

    /// A sender for the game's stdin. Cloned by each attached connection.
    pub fn input(&self) -> mpsc::Sender<Vec<u8>> {
        self.input_tx.clone()
    }

    /// Point game output at a newly attached connection.
    pub async fn attach(&self, sink: mpsc::Sender<Vec<u8>>) {
        *self.client_sink.lock().await = Some(sink);
    }

    /// Detach the current connection; output is discarded from here on.
    pub async fn detach(&self) {
        self.client_sink.lock().await.take();
    }

    pub async fn is_running(&self) -> bool {
        *self.status.lock().await == GameStatus::Running
    }

    /// Whether the child's pipes are still open.
    pub fn pipes_open(&self) -> bool {
        self.pipes_open.load(Ordering::Acquire)
    }

    /// Send a signal to the game's process group.
    ///
    /// `kill(-pgid, signal)` delivers to every process in the group, so a
    /// game that spawns helpers takes them down too. An error (typically
    /// ESRCH for an already-gone child) is ignored; the exit watcher is the
    /// authority on liveness.
    pub fn send_signal(&self, signal: i32) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            unsafe {
                libc::kill(-pgid, signal);
            }
        }
    }

    /// Stop the relay tasks. The exit watcher keeps running so a child that
    /// is exiting on its own still gets reaped.
    pub fn abort_io(&self) {
        for task in &self.io_tasks {
            task.abort();
        }
    }

    /// Kill the session immediately: SIGKILL to the process group and abort
    /// every background task.
    pub fn kill(&self) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        self.abort_io();
        if let Some(task) = &self.exit_task {
            task.abort();
        }
    }
}
