//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `GAMEMUX_PORT`, `GAMEMUX_GAME`
//! 2. **Config file** — path via `--config <path>`, or `gamemux.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! port = 53421
//! bind_addr_4 = "0.0.0.0"
//! bind_addr_6 = "::"
//! disable_ipv4 = false
//! disable_ipv6 = false
//! auth_timeout_secs = 30
//! idle_mark_secs = 600
//! shutdown_grace_ms = 5000
//!
//! [game]
//! command = "/usr/libexec/gamemux/game"
//! args = []
//! working_dir = "/"
//!
//! [[auth.users]]
//! name = "alice"
//! password = "secret"
//! id = 7
//!
//! [logging]
//! level = "info"
//!
//! [supervisor]
//! max_backoff = 60
//! stable_threshold = 60
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::auth::UserId;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Listener and lifecycle-timing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP port for both listeners (default 53421). `0` binds an
    /// ephemeral port on each enabled listener.
    #[serde(default = "default_port")]
    pub port: u16,
    /// v4 bind address (default `0.0.0.0`).
    #[serde(default = "default_bind_addr_4")]
    pub bind_addr_4: String,
    /// v6 bind address (default `::`).
    #[serde(default = "default_bind_addr_6")]
    pub bind_addr_6: String,
    /// Skip the v4 listener (default false).
    #[serde(default)]
    pub disable_ipv4: bool,
    /// Skip the v6 listener (default false).
    #[serde(default)]
    pub disable_ipv6: bool,
    /// Seconds a new connection may take to complete the credential
    /// handshake before it is dropped (default 30).
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Seconds of total inactivity before a mark line is logged
    /// (default 600).
    #[serde(default = "default_idle_mark_secs")]
    pub idle_mark_secs: u64,
    /// Milliseconds granted to live sessions between the shutdown signal
    /// and the hard stop (default 5000).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// The game subprocess launched for each authenticated user.
#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    /// Game binary (default `/usr/libexec/gamemux/game`). The child reads
    /// commands on stdin, writes output on stdout, and finds its owner in
    /// the `GAMEMUX_USERID` environment variable.
    #[serde(default = "default_game_command")]
    pub command: String,
    /// Extra arguments for the game binary (default none).
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the game process (default `/`).
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

/// Authentication settings: the built-in user table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Users accepted by the bundled [`crate::auth::UserTable`] validator.
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// One `[[auth.users]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub password: String,
    /// Stable non-zero userid; also the key for reconnecting to a
    /// running game.
    pub id: UserId,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Supervisor settings for `gamemux supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

fn default_port() -> u16 {
    53421
}
fn default_bind_addr_4() -> String {
    "0.0.0.0".to_string()
}
fn default_bind_addr_6() -> String {
    "::".to_string()
}
fn default_auth_timeout_secs() -> u64 {
    30
}
fn default_idle_mark_secs() -> u64 {
    600
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_game_command() -> String {
    "/usr/libexec/gamemux/game".to_string()
}
fn default_working_dir() -> String {
    "/".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr_4: default_bind_addr_4(),
            bind_addr_6: default_bind_addr_6(),
            disable_ipv4: false,
            disable_ipv6: false,
            auth_timeout_secs: default_auth_timeout_secs(),
            idle_mark_secs: default_idle_mark_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            command: default_game_command(),
            args: Vec::new(),
            working_dir: default_working_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `gamemux.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("gamemux.toml").exists() {
            let content =
                std::fs::read_to_string("gamemux.toml").expect("Failed to read gamemux.toml");
            toml::from_str(&content).expect("Failed to parse gamemux.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(port) = std::env::var("GAMEMUX_PORT") {
            match port.parse() {
                Ok(p) => config.server.port = p,
                Err(_) => panic!("GAMEMUX_PORT is not a valid port number: {port}"),
            }
        }
        if let Ok(game) = std::env::var("GAMEMUX_GAME") {
            config.game.command = game;
        }

        config
    }

    /// Sanity checks that should stop the server before it binds anything.
    /// Returns human-readable problems; empty means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server.disable_ipv4 && self.server.disable_ipv6 {
            errors.push("both listeners are disabled; nothing to serve".to_string());
        }
        if self.game.command.is_empty() {
            errors.push("game.command must not be empty".to_string());
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for user in &self.auth.users {
            if user.id == 0 {
                errors.push(format!("user {}: id 0 is reserved", user.name));
            }
            if !names.insert(user.name.as_str()) {
                errors.push(format!("duplicate user name: {}", user.name));
            }
            if !ids.insert(user.id) {
                errors.push(format!("duplicate userid: {}", user.id));
            }
        }

        errors
    }
}
