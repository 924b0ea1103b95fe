//! Task groups: the set of tasks derived from one goal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Guardrail scope and lifecycle unit for one submitted goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            archived: false,
            created_at: Utc::now(),
        }
    }
}
