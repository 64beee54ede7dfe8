//! Low-level game process spawning.
//!
//! Each authenticated user gets exactly one game child. The child talks to
//! the supervisor over two anonymous pipes — its stdin and stdout — and
//! learns its owner from the `GAMEMUX_USERID` environment variable. No
//! other supervisor descriptor is inherited: the pipe pair is an explicit
//! whitelist, so listener sockets and other users' pipes can never leak
//! into a game.

use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::auth::UserId;
use crate::config::GameConfig;

/// Spawn one game child for `userid`.
///
/// The child is made a process group leader via `setpgid(0, 0)` so signals
/// sent to `-pid` reach anything the game itself spawns. `kill_on_drop` is
/// set as a backstop: if the owning tasks die without an explicit kill,
/// dropping the [`Child`] still takes the process down.
///
/// stderr is wired to `/dev/null` — the game's only channel to the world
/// is its pipe pair, matching the process isolation contract.
pub fn spawn_game(config: &GameConfig, userid: UserId) -> std::io::Result<Child> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .env("GAMEMUX_USERID", userid.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn cat_config() -> GameConfig {
        GameConfig {
            command: "/bin/cat".to_string(),
            args: Vec::new(),
            working_dir: "/".to_string(),
        }
    }

    #[tokio::test]
    async fn test_spawn_wires_both_pipes() {
        let mut child = spawn_game(&cat_config(), 7).unwrap();
        let mut stdin = child.stdin.take().unwrap();
        let mut stdout = child.stdout.take().unwrap();

        stdin.write_all(b"marco").await.unwrap();
        drop(stdin);

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"marco");

        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_userid_reaches_child_environment() {
        let config = GameConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "printf %s \"$GAMEMUX_USERID\"".to_string()],
            working_dir: "/".to_string(),
        };
        let mut child = spawn_game(&config, 42).unwrap();
        drop(child.stdin.take());

        let mut out = Vec::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"42");
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let config = GameConfig {
            command: "/nonexistent/gamemux-game".to_string(),
            args: Vec::new(),
            working_dir: "/".to_string(),
        };
        assert!(spawn_game(&config, 1).is_err());
    }
}
