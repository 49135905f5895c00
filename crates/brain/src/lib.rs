//! The decision-and-execution engine.
//!
//! A think cycle assembles a compact fleet snapshot, asks the LLM for
//! recommendations under constrained decoding, validates and gates them
//! against the autonomy ladder, executes what survives, and records the
//! whole cycle in the durable decision ring. Alongside it: the advisory
//! trust tracker and the LLM-as-judge session evaluator.

pub mod context;
pub mod evaluator;
pub mod executor;
pub mod think;
pub mod trust;

pub use context::{ContextAssembler, ContextInputs};
pub use evaluator::{SessionEvaluator, SessionHandle};
pub use executor::{DecisionExecutor, ExecutionOutcome};
pub use think::ThinkEngine;
pub use trust::TrustTracker;
