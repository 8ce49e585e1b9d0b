use crossbeam::channel::{Receiver, Sender};

use crate::{EntryState, PrimaryKey, QueueEntryData};

pub type EventSender = Sender<QueueEvent>;
pub type EventReceiver = Receiver<QueueEvent>;

/// Events emitted by the scheduler as it mutates a room's queue.
/// History sinks and live displays consume these.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A new entry was accepted into a room's queue
    EntryAdded {
        room_id: PrimaryKey,
        entry: QueueEntryData,
    },
    /// An entry went on screen
    PlaybackStarted {
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
    },
    /// An entry left the screen. Emitted exactly once per entry, so history
    /// sinks can append without deduplicating
    PlaybackFinished {
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
        submitter_id: PrimaryKey,
        /// Completed or skipped
        outcome: EntryState,
    },
    /// A pending entry was removed before it played
    EntryRemoved {
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
    },
    /// The pending order of a room changed
    QueueReordered { room_id: PrimaryKey },
}
