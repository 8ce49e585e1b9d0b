use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// The type used for primary keys in the ledger.
pub type PrimaryKey = i32;

/// How a room orders newly submitted entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDiscipline {
    /// Entries play strictly in arrival order
    Fifo,
    /// Submitters take turns, one entry per fairness lap
    RoundRobin,
}

impl QueueDiscipline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::RoundRobin => "round_robin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fifo" => Some(Self::Fifo),
            "round_robin" => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

impl fmt::Display for QueueDiscipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle state of a queue entry.
/// Terminal states are immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting for its turn
    Pending,
    /// Currently on screen. At most one per room
    Playing,
    /// Played to the end
    Completed,
    /// Taken off screen by an error or a skip
    Skipped,
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Playing => "playing",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "playing" => Some(Self::Playing),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A karaoke room
#[derive(Debug, Clone, Serialize)]
pub struct RoomData {
    pub id: PrimaryKey,
    /// A slug used to identify the room
    pub slug: String,
    pub title: String,
    /// How new submissions are ordered in this room
    pub discipline: QueueDiscipline,
    /// The entry currently on screen. When set it must reference a playing
    /// entry; the playback state machine repairs the pointer when it goes stale
    pub current_entry_id: Option<PrimaryKey>,
    /// The fairness cursor: the last submitter granted a turn
    pub last_singer_id: Option<PrimaryKey>,
}

/// One submitted item in a room's queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntryData {
    pub id: PrimaryKey,
    pub room_id: PrimaryKey,
    /// The user who submitted this entry
    pub submitter_id: PrimaryKey,
    /// Opaque reference to the media item, resolved to a playable URL elsewhere
    pub item_ref: String,
    /// Real-valued ordering token, so an entry can be inserted between two
    /// neighbors without renumbering the rest of the queue
    pub sort_key: f64,
    /// The fairness lap this entry belongs to. Meaningful under round robin only
    pub round_number: i32,
    pub state: EntryState,
    /// Set when a host pinned this entry ahead of the normal order
    pub host_override: bool,
    pub host_override_position: Option<i32>,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueEntryData {
    /// Total order of entries within a queue: sort key first, id as a
    /// deterministic tiebreak
    pub fn queue_order(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key
            .total_cmp(&other.sort_key)
            .then(self.id.cmp(&other.id))
    }
}

#[cfg(test)]
impl QueueEntryData {
    /// A pending entry fixture
    pub fn mock(id: PrimaryKey, submitter_id: PrimaryKey, sort_key: f64, round_number: i32) -> Self {
        Self {
            id,
            room_id: 1,
            submitter_id,
            item_ref: format!("item-{id}"),
            sort_key,
            round_number,
            state: EntryState::Pending,
            host_override: false,
            host_override_position: None,
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_state(mut self, state: EntryState) -> Self {
        self.state = state;
        self
    }

    pub fn with_override(mut self, position: Option<i32>) -> Self {
        self.host_override = true;
        self.host_override_position = position;
        self
    }
}
