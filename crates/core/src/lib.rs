//! Shared domain types and capability traits for the Foreman supervisor.
//!
//! Everything the decision engine exchanges with its collaborators lives
//! here: the recommendation/decision/execution records, the autonomy
//! ladder, health results, and the traits behind which the tmux driver,
//! SMS transport, project scanner, and git introspection are injected.

pub mod caps;
pub mod types;

pub use caps::{GitInspector, MuxDriver, ProjectScanner, ResourceProbe, SmsTransport};
pub use types::*;
