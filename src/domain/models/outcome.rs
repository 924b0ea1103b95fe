//! Task completion payloads.
//!
//! A provider run ends in exactly one of three verdicts; the payload is
//! an explicit sum type rather than a status string so the router and
//! the board can match on it without re-parsing.

use serde::{Deserialize, Serialize};

use super::task::TaskPriority;

/// A follow-up task declared by a successful completion.
///
/// `name` is a label local to the producing completion; sibling entries
/// reference each other's names in `blocked_by`, and the router resolves
/// those references to real task ids in topological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducedTask {
    pub name: String,
    pub task_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

/// The verdict of one provider invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Work done; `produces` feeds the router.
    Success {
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        produces: Vec<ProducedTask>,
    },
    /// Work examined and sent back to its source role.
    Reject { reason: String, back_to_role: String },
    /// Work could not be done.
    Fail { reason: String, transient: bool },
}

impl TaskOutcome {
    pub fn success_empty() -> Self {
        Self::Success {
            summary: None,
            produces: Vec::new(),
        }
    }

    pub fn produces(&self) -> &[ProducedTask] {
        match self {
            Self::Success { produces, .. } => produces,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_tagged_serialization() {
        let outcome = TaskOutcome::Reject {
            reason: "tests missing".to_string(),
            back_to_role: "coder".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "reject");
        assert_eq!(json["back_to_role"], "coder");

        let parsed: TaskOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, outcome);
    }

    #[test]
    fn test_success_parses_with_defaults() {
        let parsed: TaskOutcome = serde_json::from_str(r#"{"kind":"success"}"#).unwrap();
        assert_eq!(parsed, TaskOutcome::success_empty());
        assert!(parsed.produces().is_empty());
    }

    #[test]
    fn test_produced_task_local_references() {
        let json = r#"{
            "kind": "success",
            "produces": [
                {"name": "impl", "task_type": "implementation", "title": "do X"},
                {"name": "verify", "task_type": "verification", "title": "check X",
                 "priority": "high", "blocked_by": ["impl"]}
            ]
        }"#;
        let outcome: TaskOutcome = serde_json::from_str(json).unwrap();
        let produces = outcome.produces();
        assert_eq!(produces.len(), 2);
        assert_eq!(produces[1].blocked_by, vec!["impl".to_string()]);
        assert_eq!(produces[1].priority, TaskPriority::High);
        assert_eq!(produces[0].priority, TaskPriority::Medium);
    }
}
