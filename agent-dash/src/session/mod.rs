// Session management module for agent-dash
// This module is shared between the launcher library and the daemon binary

pub mod agent;
pub mod config;
pub mod notify;
pub mod polling;
pub mod protocol;
pub mod spawner;
pub mod watcher;
