//! CLI subcommand implementations

pub mod health;
pub mod logs;
pub mod start;
pub mod status;
pub mod stop;
