//! Operator control plane: SMS command parsing and routing.

mod matcher;
mod router;

pub use matcher::match_project;
pub use router::{CommandRouter, ContextKind, ConvContext};
