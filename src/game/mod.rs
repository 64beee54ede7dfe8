//! Game subprocess management.

pub mod process;

pub use process::spawn_game;
