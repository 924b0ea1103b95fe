//! Event and group store ports.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Event, Group};

/// Append-only persistence for published events.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &Event) -> DomainResult<()>;

    /// Most recent events, newest last.
    async fn recent(&self, limit: usize) -> DomainResult<Vec<Event>>;

    async fn recent_for_topic(&self, topic: &str, limit: usize) -> DomainResult<Vec<Event>>;
}

/// Repository interface for goal groups.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn insert(&self, group: &Group) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Group>>;

    /// Groups that have not been archived.
    async fn list_live(&self) -> DomainResult<Vec<Group>>;

    async fn archive(&self, id: Uuid) -> DomainResult<()>;
}
