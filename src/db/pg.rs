use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Error as SqlxError, FromRow, PgPool};

use crate::{
    EntryState, IntoLedgerError, Ledger, LedgerError, LedgerResult, NewEntry, NewRoom, PrimaryKey,
    QueueDiscipline, QueueEntryData, Result, RoomData,
};

/// The partial unique index on (room_id, sort_key) over live entries,
/// see migrations/0001_init.sql
const SORT_KEY_INDEX: &str = "queue_entries_room_sort_key_live";

/// A postgres ledger implementation
pub struct PgLedger {
    pool: PgPool,
}

#[derive(FromRow)]
struct RoomRow {
    id: PrimaryKey,
    slug: String,
    title: String,
    discipline: String,
    current_entry_id: Option<PrimaryKey>,
    last_singer_id: Option<PrimaryKey>,
}

#[derive(FromRow)]
struct EntryRow {
    id: PrimaryKey,
    room_id: PrimaryKey,
    submitter_id: PrimaryKey,
    item_ref: String,
    sort_key: f64,
    round_number: i32,
    state: String,
    host_override: bool,
    host_override_position: Option<i32>,
    added_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

fn corrupt(field: &'static str, value: &str) -> LedgerError {
    LedgerError::Internal(format!("unexpected {field} value {value} in ledger row").into())
}

impl TryFrom<RoomRow> for RoomData {
    type Error = LedgerError;

    fn try_from(row: RoomRow) -> Result<Self> {
        let discipline = QueueDiscipline::parse(&row.discipline)
            .ok_or_else(|| corrupt("discipline", &row.discipline))?;

        Ok(Self {
            id: row.id,
            slug: row.slug,
            title: row.title,
            discipline,
            current_entry_id: row.current_entry_id,
            last_singer_id: row.last_singer_id,
        })
    }
}

impl TryFrom<EntryRow> for QueueEntryData {
    type Error = LedgerError;

    fn try_from(row: EntryRow) -> Result<Self> {
        let state = EntryState::parse(&row.state).ok_or_else(|| corrupt("state", &row.state))?;

        Ok(Self {
            id: row.id,
            room_id: row.room_id,
            submitter_id: row.submitter_id,
            item_ref: row.item_ref,
            sort_key: row.sort_key,
            round_number: row.round_number,
            state,
            host_override: row.host_override,
            host_override_position: row.host_override_position,
            added_at: row.added_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

impl PgLedger {
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| LedgerError::Internal(Box::new(e)))?;

        Ok(Self { pool })
    }

    async fn entries_where(&self, room_id: PrimaryKey, condition: &str) -> Result<Vec<QueueEntryData>> {
        let query = format!(
            "SELECT * FROM queue_entries WHERE room_id = $1 AND {condition} ORDER BY sort_key, id"
        );

        sqlx::query_as::<_, EntryRow>(&query)
            .bind(room_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.any())?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        self.room_by_slug(&new_room.slug)
            .await
            .conflict_or_ok("room", "slug", &new_room.slug)?;

        sqlx::query_as::<_, RoomRow>(
            "INSERT INTO rooms (slug, title, discipline) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(&new_room.slug)
        .bind(&new_room.title)
        .bind(new_room.discipline.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())?
        .try_into()
    }

    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData> {
        sqlx::query_as::<_, RoomRow>("SELECT * FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("room", "id"))?
            .try_into()
    }

    async fn room_by_slug(&self, slug: &str) -> Result<RoomData> {
        sqlx::query_as::<_, RoomRow>("SELECT * FROM rooms WHERE slug = $1")
            .bind(slug)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("room", "slug"))?
            .try_into()
    }

    async fn set_current_entry(
        &self,
        room_id: PrimaryKey,
        entry_id: Option<PrimaryKey>,
    ) -> Result<()> {
        // Ensure room exists
        let _ = self.room_by_id(room_id).await?;

        sqlx::query("UPDATE rooms SET current_entry_id = $1 WHERE id = $2")
            .bind(entry_id)
            .bind(room_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn set_last_singer(
        &self,
        room_id: PrimaryKey,
        submitter_id: Option<PrimaryKey>,
    ) -> Result<()> {
        // Ensure room exists
        let _ = self.room_by_id(room_id).await?;

        sqlx::query("UPDATE rooms SET last_singer_id = $1 WHERE id = $2")
            .bind(submitter_id)
            .bind(room_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn create_entry(&self, new_entry: NewEntry) -> Result<QueueEntryData> {
        // Ensure room exists
        let _ = self.room_by_id(new_entry.room_id).await?;

        let result = sqlx::query_as::<_, EntryRow>(
            "INSERT INTO queue_entries (room_id, submitter_id, item_ref, sort_key, round_number)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(new_entry.room_id)
        .bind(new_entry.submitter_id)
        .bind(&new_entry.item_ref)
        .bind(new_entry.sort_key)
        .bind(new_entry.round_number)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row.try_into(),
            Err(SqlxError::Database(e)) if e.constraint() == Some(SORT_KEY_INDEX) => {
                Err(LedgerError::Conflict {
                    resource: "queue entry",
                    field: "sort_key",
                    value: new_entry.sort_key.to_string(),
                })
            }
            Err(e) => Err(e.any()),
        }
    }

    async fn entry_by_id(&self, entry_id: PrimaryKey) -> Result<QueueEntryData> {
        sqlx::query_as::<_, EntryRow>("SELECT * FROM queue_entries WHERE id = $1")
            .bind(entry_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("queue entry", "id"))?
            .try_into()
    }

    async fn entries_by_room(&self, room_id: PrimaryKey) -> Result<Vec<QueueEntryData>> {
        self.entries_where(room_id, "true").await
    }

    async fn pending_entries(&self, room_id: PrimaryKey) -> Result<Vec<QueueEntryData>> {
        self.entries_where(room_id, "state = 'pending'").await
    }

    async fn active_entries(&self, room_id: PrimaryKey) -> Result<Vec<QueueEntryData>> {
        self.entries_where(room_id, "state IN ('pending', 'playing')")
            .await
    }

    async fn update_sort_key(&self, entry_id: PrimaryKey, sort_key: f64) -> Result<()> {
        // Ensure entry exists
        let _ = self.entry_by_id(entry_id).await?;

        sqlx::query("UPDATE queue_entries SET sort_key = $1 WHERE id = $2")
            .bind(sort_key)
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn set_host_override(
        &self,
        entry_id: PrimaryKey,
        active: bool,
        position: Option<i32>,
    ) -> Result<()> {
        // Ensure entry exists
        let _ = self.entry_by_id(entry_id).await?;

        sqlx::query(
            "UPDATE queue_entries SET host_override = $1, host_override_position = $2 WHERE id = $3",
        )
        .bind(active)
        .bind(position)
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())
        .map(|_| ())
    }

    async fn mark_playing(&self, entry_id: PrimaryKey, started_at: DateTime<Utc>) -> Result<()> {
        // Ensure entry exists
        let _ = self.entry_by_id(entry_id).await?;

        sqlx::query("UPDATE queue_entries SET state = 'playing', started_at = $1 WHERE id = $2")
            .bind(started_at)
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn mark_finished(
        &self,
        entry_id: PrimaryKey,
        state: EntryState,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        // Ensure entry exists
        let _ = self.entry_by_id(entry_id).await?;

        sqlx::query("UPDATE queue_entries SET state = $1, completed_at = $2 WHERE id = $3")
            .bind(state.as_str())
            .bind(completed_at)
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn delete_entry(&self, entry_id: PrimaryKey) -> Result<()> {
        // Ensure entry exists
        let _ = self.entry_by_id(entry_id).await?;

        sqlx::query("DELETE FROM queue_entries WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }
}

impl IntoLedgerError for SqlxError {
    fn any(self) -> LedgerError {
        LedgerError::Internal(Box::new(self))
    }

    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> LedgerError {
        match self {
            SqlxError::RowNotFound => LedgerError::NotFound {
                resource,
                identifier,
            },
            e => Self::any(e),
        }
    }
}
