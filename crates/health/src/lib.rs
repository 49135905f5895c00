//! Health-driven auto-remediation.
//!
//! Each tick probes the configured services (http/tcp concurrently,
//! process/container sequentially), tracks consecutive failures, and on
//! an edge-triggered threshold crossing either restarts the service —
//! autonomy, budget, and procedure permitting — or escalates. A
//! correlated-failure guard suppresses restarts during host-wide events.

mod controller;
mod probes;

pub use controller::{HealthController, Prober, ProbeOutcome, RestartOutcome};
pub use probes::SystemProber;
