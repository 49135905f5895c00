//! Daemon composition and scheduling.
//!
//! The composition root wires every capability into the engine crates
//! (no cycles: the gateway and state store are leaves, the router
//! depends on the think engine but never the reverse) and drives the
//! three primary loops plus cron digests.

mod daemon;
mod digests;

pub use daemon::Foreman;
pub use digests::spawn_digest_task;
