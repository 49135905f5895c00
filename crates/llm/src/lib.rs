//! Single point of egress to the external LLM CLI.
//!
//! All model calls in the daemon flow through [`SubprocessGateway`], which
//! serializes concurrency through a fair counting semaphore and supports
//! JSON-schema constrained decoding for the think and evaluation paths.

mod gateway;
mod schema;
mod semaphore;

pub use gateway::{CallOptions, GatewayError, OutputFormat, SubprocessGateway};
pub use schema::{evaluation_schema, think_schema};
pub use semaphore::{FairSemaphore, Permit};
