use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod data;
pub use data::*;

mod memory;
pub use memory::*;

mod pg;
pub use pg::*;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// An unknown or internal error happened with the underlying store
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource already exists
    #[error("{resource} with {field} of value {value} already exists")]
    Conflict {
        /// The resource in question
        resource: &'static str,
        /// The field that is conflicting
        field: &'static str,
        /// The conflicting value
        value: String,
    },
    /// A resource in the ledger doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: &'static str,
    },
}

/// Helper trait to reduce boilerplate
pub trait IntoLedgerError {
    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> LedgerError;
    fn any(self) -> LedgerError;
}

/// Helper trait to reduce boilerplate
pub trait LedgerResult {
    /// Turns the Result into a conflict error if it's Ok()
    fn conflict_or_ok(self, resource: &'static str, field: &'static str, value: &str)
        -> Result<()>;
}

impl<T> LedgerResult for Result<T> {
    fn conflict_or_ok(
        self,
        resource: &'static str,
        field: &'static str,
        value: &str,
    ) -> Result<()> {
        match self {
            Ok(_) => Err(LedgerError::Conflict {
                resource,
                field,
                value: value.to_string(),
            }),
            Err(e) => match e {
                LedgerError::NotFound { .. } => Ok(()),
                e => Err(e),
            },
        }
    }
}

/// Represents a type that can store and query rooms and their queue entries.
///
/// The ledger is deliberately dumb: it enforces referential existence and the
/// per-room sort key uniqueness that backs allocator collision detection, but
/// all lifecycle rules live in the playback state machine above it.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData>;
    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData>;
    async fn room_by_slug(&self, slug: &str) -> Result<RoomData>;
    /// Points the room at the entry currently on screen, or clears the pointer
    async fn set_current_entry(
        &self,
        room_id: PrimaryKey,
        entry_id: Option<PrimaryKey>,
    ) -> Result<()>;
    /// Moves the fairness cursor
    async fn set_last_singer(
        &self,
        room_id: PrimaryKey,
        submitter_id: Option<PrimaryKey>,
    ) -> Result<()>;

    /// Persists a new pending entry. Rejects a sort key already held by a
    /// live entry of the same room with [LedgerError::Conflict]
    async fn create_entry(&self, new_entry: NewEntry) -> Result<QueueEntryData>;
    async fn entry_by_id(&self, entry_id: PrimaryKey) -> Result<QueueEntryData>;
    /// Every entry of a room regardless of state, in queue order
    async fn entries_by_room(&self, room_id: PrimaryKey) -> Result<Vec<QueueEntryData>>;
    /// Pending entries of a room, in queue order
    async fn pending_entries(&self, room_id: PrimaryKey) -> Result<Vec<QueueEntryData>>;
    /// Pending and playing entries of a room, in queue order
    async fn active_entries(&self, room_id: PrimaryKey) -> Result<Vec<QueueEntryData>>;
    async fn update_sort_key(&self, entry_id: PrimaryKey, sort_key: f64) -> Result<()>;
    /// Sets or clears the host override flag and position
    async fn set_host_override(
        &self,
        entry_id: PrimaryKey,
        active: bool,
        position: Option<i32>,
    ) -> Result<()>;
    async fn mark_playing(&self, entry_id: PrimaryKey, started_at: DateTime<Utc>) -> Result<()>;
    async fn mark_finished(
        &self,
        entry_id: PrimaryKey,
        state: EntryState,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;
    /// Deletes an entry. Played entries are never deleted, they are kept for
    /// history; callers enforce that
    async fn delete_entry(&self, entry_id: PrimaryKey) -> Result<()>;
}

#[derive(Debug)]
pub struct NewRoom {
    pub slug: String,
    pub title: String,
    pub discipline: QueueDiscipline,
}

#[derive(Debug)]
pub struct NewEntry {
    pub room_id: PrimaryKey,
    /// The submitting user
    pub submitter_id: PrimaryKey,
    pub item_ref: String,
    pub sort_key: f64,
    pub round_number: i32,
}
