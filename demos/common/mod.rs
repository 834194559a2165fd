//! Shared wire types for the automation demos.
//!
//! Client and server both depend on these, the same way two services would
//! share a small types crate.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};

/// Well-known queues the automation service answers on.
pub const AUTOMATION_QUEUES: [&str; 2] = ["rpc_queue:erxes-api", "rpc_queue:erkhet"];

/// Action asking whether any automation fires for a target.
pub const CHECK_AUTOMATION: &str = "get-response-check-automation";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTrigger {
    pub trigger_type: String,
    pub target_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub triggered: bool,
    pub automation_ids: Vec<String>,
}

/// Automations known to the demo server: (id, trigger type).
const AUTOMATIONS: [(&str, &str); 3] = [
    ("auto-welcome", "customer"),
    ("auto-followup", "deal"),
    ("auto-escalate", "ticket"),
];

/// Look up the automations a trigger of `check.trigger_type` would start.
///
/// Returns `None` for a trigger type no automation listens to.
pub fn check_trigger(check: &CheckTrigger) -> Option<TriggerResponse> {
    // ---
    let automation_ids: Vec<String> = AUTOMATIONS
        .iter()
        .filter(|(_, kind)| *kind == check.trigger_type)
        .map(|(id, _)| id.to_string())
        .collect();

    if automation_ids.is_empty() {
        return None;
    }

    Some(TriggerResponse {
        triggered: true,
        automation_ids,
    })
}
