//! SQLite implementations of the event and group stores.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Event, Group};
use crate::domain::ports::{EventStore, GroupStore};

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DomainError::Serialization(format!("bad timestamp {raw}: {e}")))
}

#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_event(topic: String, payload: String, timestamp: String) -> DomainResult<Event> {
        Ok(Event {
            topic,
            payload: serde_json::from_str(&payload)?,
            timestamp: parse_ts(&timestamp)?,
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: &Event) -> DomainResult<()> {
        sqlx::query("INSERT INTO events (topic, payload, timestamp) VALUES (?, ?, ?)")
            .bind(&event.topic)
            .bind(serde_json::to_string(&event.payload)?)
            .bind(fmt_ts(event.timestamp))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> DomainResult<Vec<Event>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"SELECT topic, payload, timestamp FROM
               (SELECT seq, topic, payload, timestamp FROM events ORDER BY seq DESC LIMIT ?)
               ORDER BY seq"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(topic, payload, ts)| Self::row_to_event(topic, payload, ts))
            .collect()
    }

    async fn recent_for_topic(&self, topic: &str, limit: usize) -> DomainResult<Vec<Event>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"SELECT topic, payload, timestamp FROM
               (SELECT seq, topic, payload, timestamp FROM events
                WHERE topic = ? ORDER BY seq DESC LIMIT ?)
               ORDER BY seq"#,
        )
        .bind(topic)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(topic, payload, ts)| Self::row_to_event(topic, payload, ts))
            .collect()
    }
}

#[derive(Clone)]
pub struct SqliteGroupStore {
    pool: SqlitePool,
}

impl SqliteGroupStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GroupRow {
    id: String,
    title: String,
    description: String,
    archived: i64,
    created_at: String,
}

impl TryFrom<GroupRow> for Group {
    type Error = DomainError;

    fn try_from(row: GroupRow) -> Result<Self, Self::Error> {
        Ok(Group {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| DomainError::Serialization(format!("bad group id: {e}")))?,
            title: row.title,
            description: row.description,
            archived: row.archived != 0,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

#[async_trait]
impl GroupStore for SqliteGroupStore {
    async fn insert(&self, group: &Group) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO groups (id, title, description, archived, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(group.id.to_string())
        .bind(&group.title)
        .bind(&group.description)
        .bind(i64::from(group.archived))
        .bind(fmt_ts(group.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Group>> {
        let row: Option<GroupRow> = sqlx::query_as("SELECT * FROM groups WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_live(&self) -> DomainResult<Vec<Group>> {
        let rows: Vec<GroupRow> =
            sqlx::query_as("SELECT * FROM groups WHERE archived = 0 ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn archive(&self, id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("UPDATE groups SET archived = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::GroupNotFound(id));
        }
        Ok(())
    }
}
