#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! gamemux library — the connection-multiplexing supervisor core.
//!
//! One process accepts TCP clients, authenticates them, and bridges each
//! authenticated session to a per-user game subprocess. Games survive
//! client disconnects; a reconnecting user is spliced back onto the live
//! process. The building blocks:
//!
//! - `listener` — dual-stack listening sockets
//! - `protocol` — pre-auth credential framing and response sentinels
//! - `auth` — the credential validator seam and the config-backed table
//! - `game` — game subprocess spawning
//! - `sessions` — the session registry and per-game I/O tasks
//! - `conn` — per-connection handshake + relay
//! - `server` — accept loop, idle watchdog, two-phase shutdown
//! - `config` — TOML configuration loading

pub mod activity;
pub mod auth;
pub mod config;
pub mod conn;
pub mod game;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod sessions;

// Re-export key types at crate root for convenience.
pub use auth::{Authenticator, UserTable};
pub use config::Config;
pub use server::Server;
pub use sessions::SessionRegistry;
