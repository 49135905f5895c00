//! Constrained-decoding schema documents handed to the subprocess.
//!
//! These are wire artifacts, not Rust types: the CLI enforces them during
//! decoding, and the callers still defensively parse the result.

use serde_json::{json, Value};

/// Output shape for a think cycle: recommendations plus a summary, with an
/// optional one-shot `nextThinkIn` override for the following tick.
pub fn think_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["recommendations", "summary"],
        "properties": {
            "recommendations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["project", "action", "reason"],
                    "properties": {
                        "project": { "type": "string" },
                        "action": { "enum": ["start", "stop", "restart", "notify", "skip"] },
                        "reason": { "type": "string" },
                        "priority": { "type": "integer", "minimum": 1, "maximum": 5 },
                        "message": { "type": "string" },
                        "prompt": { "type": "string" },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "notificationTier": { "type": "integer", "minimum": 1, "maximum": 4 }
                    }
                }
            },
            "summary": { "type": "string" },
            "nextThinkIn": { "type": "integer", "minimum": 60, "maximum": 1800 }
        }
    })
}

/// Output shape for LLM-as-judge session scoring.
pub fn evaluation_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["score", "recommendation", "accomplishments", "failures", "reasoning"],
        "properties": {
            "score": { "type": "integer", "minimum": 1, "maximum": 5 },
            "recommendation": { "enum": ["continue", "retry", "escalate", "complete"] },
            "accomplishments": { "type": "array", "items": { "type": "string" } },
            "failures": { "type": "array", "items": { "type": "string" } },
            "reasoning": { "type": "string" }
        }
    })
}
