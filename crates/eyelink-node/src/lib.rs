//! Eyelink Node -- library crate for the server and eye roles.
//!
//! Re-exports all internal modules so integration tests and the binary
//! can reach the channel, heartbeat, discovery and registry types.

pub mod channel;
pub mod client;
pub mod config;
pub mod discovery;
pub mod eye;
pub mod heartbeat;
pub mod local_addr;
pub mod registry;
pub mod router;
pub mod server;
pub mod vision;

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
