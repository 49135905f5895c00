//! Durable state for the supervisor daemon.
//!
//! One atomic JSON document holds the decision/execution/evaluation rings,
//! retry counters, trust rows, and the runtime autonomy level. Alongside
//! it: a JSONL conversation log with credential redaction and a JSON
//! reminder file. All writes are write-temp → fsync → rename; a failed
//! write is logged and skipped, leaving the in-memory model authoritative.

mod autonomy;
mod conversation;
mod reminders;
mod store;

pub use autonomy::AutonomyState;
pub use conversation::{ConversationEntry, ConversationRole, ConversationStore, redact};
pub use reminders::{Reminder, ReminderStore};
pub use store::{AlertEntry, StateDocument, StateStore};
