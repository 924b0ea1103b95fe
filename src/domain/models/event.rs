//! Event records and topic matching.
//!
//! Events are immutable `{topic, payload, timestamp}` records. Topics are
//! dotted strings; subscribers match them with glob patterns where `*`
//! matches one segment and a bare `*` matches everything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable topic names emitted by the core.
pub mod topics {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_CLAIMED: &str = "task.claimed";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_REJECTED: &str = "task.rejected";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_RECOVERED: &str = "task.recovered";
    pub const AGENT_STATUS_CHANGED: &str = "agent.status_changed";
    pub const AGENT_TEXT: &str = "agent.text";
    pub const AGENT_RESULT: &str = "agent.result";
    pub const ROUTER_DROPPED: &str = "router.dropped";
    pub const EVENTBUS_OVERFLOW: &str = "eventbus.overflow";
    pub const STORE_DEGRADED: &str = "store.degraded";
}

/// An immutable published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Compiled glob pattern over dotted topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<PatternSegment>,
    match_all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Wildcard,
}

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let match_all = raw == "*";
        let segments = raw
            .split('.')
            .map(|s| {
                if s == "*" {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(s.to_string())
                }
            })
            .collect();
        Self {
            raw,
            segments,
            match_all,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        if self.match_all {
            return true;
        }
        let mut topic_segments = topic.split('.');
        for segment in &self.segments {
            let Some(actual) = topic_segments.next() else {
                return false;
            };
            match segment {
                PatternSegment::Wildcard => {}
                PatternSegment::Literal(expected) => {
                    if expected != actual {
                        return false;
                    }
                }
            }
        }
        topic_segments.next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let pattern = TopicPattern::new("task.completed");
        assert!(pattern.matches("task.completed"));
        assert!(!pattern.matches("task.created"));
        assert!(!pattern.matches("task.completed.extra"));
        assert!(!pattern.matches("task"));
    }

    #[test]
    fn test_segment_wildcard() {
        let pattern = TopicPattern::new("task.*");
        assert!(pattern.matches("task.completed"));
        assert!(pattern.matches("task.created"));
        assert!(!pattern.matches("agent.text"));
        // One segment only, never a suffix glob.
        assert!(!pattern.matches("task.completed.extra"));

        let pattern = TopicPattern::new("*.completed");
        assert!(pattern.matches("task.completed"));
        assert!(!pattern.matches("task.failed"));
    }

    #[test]
    fn test_bare_star_matches_everything() {
        let pattern = TopicPattern::new("*");
        assert!(pattern.matches("task.completed"));
        assert!(pattern.matches("eventbus.overflow"));
        assert!(pattern.matches("a.b.c"));
    }
}
