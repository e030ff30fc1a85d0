//! `geoscan` binary support: CLI definitions and command handlers.

pub mod app;
pub mod cli;
pub mod signal;

pub use app::App;
pub use cli::{Cli, Command, TargetCommand};
