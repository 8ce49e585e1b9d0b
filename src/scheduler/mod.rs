mod locks;

use std::sync::Arc;

use crossbeam::channel::unbounded;
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    allocate_position, key_between, next_entry, EntryState, EventReceiver, EventSender, Ledger,
    LedgerError, NewEntry, NewRoom, Playback, PlaybackError, PlaybackOutcome, PrimaryKey,
    QueueEntryData, QueueEvent, RoomData, SchedulerConfig,
};

use locks::RoomLocks;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A submitter may only move or remove their own entries
    #[error("user {user_id} does not own entry {entry_id}")]
    NotEntryOwner {
        user_id: PrimaryKey,
        entry_id: PrimaryKey,
    },
    /// The entry already left the pending state
    #[error("entry {entry_id} is {actual}, only pending entries can be modified")]
    NotPending {
        entry_id: PrimaryKey,
        actual: EntryState,
    },
    /// Reorder target outside the pending queue
    #[error("position {position} is outside the pending queue")]
    PositionOutOfBounds { position: usize },
    /// The ledger rejected two freshly computed keys in a row
    #[error("could not allocate a queue position in room {room_id}")]
    AllocationContended { room_id: PrimaryKey },
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A read-only snapshot of a room's queue
#[derive(Debug, Clone, Serialize)]
pub struct RoomQueueState {
    /// The entry currently on screen, if any
    pub playing: Option<QueueEntryData>,
    /// Pending entries in play order
    pub pending: Vec<QueueEntryData>,
    /// The entry the selector would start next
    pub up_next: Option<QueueEntryData>,
}

/// Direction of a submitter-initiated move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

/// The queue scheduler for karaoke rooms, and the only surface other
/// components call.
///
/// Every mutating operation runs inside a per-room lock and finishes by
/// re-establishing the single-playing invariant, so the system heals itself
/// on every call instead of relying on a background loop.
pub struct Scheduler<L> {
    ledger: Arc<L>,
    config: SchedulerConfig,
    locks: RoomLocks,
    event_sender: EventSender,
    event_receiver: EventReceiver,
}

impl<L: Ledger> Scheduler<L> {
    pub fn new(ledger: L, config: SchedulerConfig) -> Self {
        let (event_sender, event_receiver) = unbounded();

        Self {
            locks: RoomLocks::new(config.lock_idle()),
            ledger: Arc::new(ledger),
            config,
            event_sender,
            event_receiver,
        }
    }

    /// Events describing queue mutations, for history sinks and live displays
    pub fn events(&self) -> EventReceiver {
        self.event_receiver.clone()
    }

    fn playback(&self) -> Playback<'_, L> {
        Playback::new(&self.ledger, &self.event_sender, &self.config)
    }

    /// Creates a new room
    pub async fn create_room(&self, new_room: NewRoom) -> Result<RoomData, SchedulerError> {
        Ok(self.ledger.create_room(new_room).await?)
    }

    /// Submits an item to a room's queue.
    ///
    /// The returned entry is re-read after self-healing, so it may already be
    /// playing when the room was idle.
    pub async fn submit(
        &self,
        room_id: PrimaryKey,
        submitter_id: PrimaryKey,
        item_ref: &str,
    ) -> Result<QueueEntryData, SchedulerError> {
        let _guard = self.locks.acquire(room_id).await;

        let room = self.ledger.room_by_id(room_id).await?;
        let mut created = None;

        // The ledger rejects colliding keys, retry once with a fresh snapshot
        for _ in 0..2 {
            let entries = self.ledger.entries_by_room(room_id).await?;
            let position = allocate_position(
                room.discipline,
                submitter_id,
                &entries,
                self.config.sort_key_gap,
            );

            let result = self
                .ledger
                .create_entry(NewEntry {
                    room_id,
                    submitter_id,
                    item_ref: item_ref.to_string(),
                    sort_key: position.sort_key,
                    round_number: position.round_number,
                })
                .await;

            match result {
                Ok(entry) => {
                    created = Some(entry);
                    break;
                }
                Err(LedgerError::Conflict { .. }) => {
                    warn!("Sort key collision in room {room_id}, retrying with a fresh key");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let entry = created.ok_or(SchedulerError::AllocationContended { room_id })?;

        info!(
            "User {} queued entry {} in room {} (round {})",
            submitter_id, entry.id, room_id, entry.round_number
        );

        let _ = self.event_sender.send(QueueEvent::EntryAdded {
            room_id,
            entry: entry.clone(),
        });

        self.playback().ensure_playing(room_id).await?;

        Ok(self.ledger.entry_by_id(entry.id).await?)
    }

    /// A read-only snapshot of the room's queue. Never takes the room lock,
    /// so it may trail a concurrent mutation by one poll.
    pub async fn room_state(&self, room_id: PrimaryKey) -> Result<RoomQueueState, SchedulerError> {
        let room = self.ledger.room_by_id(room_id).await?;
        let pending = self.ledger.pending_entries(room_id).await?;

        let playing = match room.current_entry_id {
            Some(id) => self
                .ledger
                .entry_by_id(id)
                .await
                .ok()
                .filter(|e| e.state == EntryState::Playing),
            None => None,
        };

        // When something is on screen the cursor will have advanced to its
        // submitter by the time the next entry is chosen
        let cursor = playing
            .as_ref()
            .map(|e| e.submitter_id)
            .or(room.last_singer_id);

        let up_next = next_entry(room.discipline, &pending, cursor).cloned();

        Ok(RoomQueueState {
            playing,
            pending,
            up_next,
        })
    }

    /// A display client reports that the current entry played to the end.
    /// Idempotent: duplicate reports are acknowledged without effect.
    pub async fn report_ended(
        &self,
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
    ) -> Result<(), SchedulerError> {
        self.report(room_id, entry_id, PlaybackOutcome::Ended).await
    }

    /// A display client reports that the current entry failed to play.
    /// Idempotent like [Scheduler::report_ended].
    pub async fn report_error(
        &self,
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
    ) -> Result<(), SchedulerError> {
        self.report(room_id, entry_id, PlaybackOutcome::Errored).await
    }

    async fn report(
        &self,
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
        outcome: PlaybackOutcome,
    ) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(room_id).await;

        let room = self.ledger.room_by_id(room_id).await?;
        self.playback().finish(&room, entry_id, outcome).await?;
        self.playback().ensure_playing(room_id).await?;

        Ok(())
    }

    /// Re-establishes the single-playing invariant on demand, for embedders
    /// that also want to heal rooms on a timer
    pub async fn ensure_playing(&self, room_id: PrimaryKey) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(room_id).await;

        Ok(self.playback().ensure_playing(room_id).await?)
    }

    /// A host moves a pending entry to an arbitrary position in the pending
    /// queue
    pub async fn host_reorder(
        &self,
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
        target_position: usize,
    ) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(room_id).await;

        let entry = self.pending_entry(room_id, entry_id).await?;
        let mut pending = self.ledger.pending_entries(room_id).await?;

        if target_position >= pending.len() {
            return Err(SchedulerError::PositionOutOfBounds {
                position: target_position,
            });
        }

        pending.retain(|e| e.id != entry.id);

        // Moving to the head still has to stay above the playing entry's key
        let active = self.ledger.active_entries(room_id).await?;
        let floor = active
            .iter()
            .filter(|e| e.state == EntryState::Playing)
            .map(|e| e.sort_key)
            .reduce(f64::max);

        let lower = target_position
            .checked_sub(1)
            .and_then(|i| pending.get(i))
            .map(|e| e.sort_key)
            .or(floor);
        let upper = pending.get(target_position).map(|e| e.sort_key);

        match key_between(lower, upper, self.config.sort_key_gap) {
            Some(key) => self.ledger.update_sort_key(entry.id, key).await?,
            None => {
                // The gap between the neighbors is exhausted, renumber the lot
                pending.insert(target_position, entry.clone());
                self.renumber(room_id, &pending).await?;
            }
        }

        info!(
            "Host moved entry {} to position {} in room {}",
            entry_id, target_position, room_id
        );

        let _ = self.event_sender.send(QueueEvent::QueueReordered { room_id });
        self.playback().ensure_playing(room_id).await?;

        Ok(())
    }

    /// A submitter nudges their own pending entry one position up or down
    /// relative to the full pending order. Moves past either end of the queue
    /// are no-ops.
    pub async fn user_reorder(
        &self,
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
        direction: MoveDirection,
        requester: PrimaryKey,
    ) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(room_id).await;

        let entry = self.pending_entry(room_id, entry_id).await?;

        if entry.submitter_id != requester {
            return Err(SchedulerError::NotEntryOwner {
                user_id: requester,
                entry_id,
            });
        }

        let pending = self.ledger.pending_entries(room_id).await?;

        let Some(index) = pending.iter().position(|e| e.id == entry_id) else {
            return Ok(());
        };

        let neighbor = match direction {
            MoveDirection::Up => {
                if index == 0 {
                    return Ok(());
                }

                &pending[index - 1]
            }
            MoveDirection::Down => match pending.get(index + 1) {
                Some(neighbor) => neighbor,
                None => return Ok(()),
            },
        };

        self.swap_keys(room_id, &entry, neighbor).await?;

        let _ = self.event_sender.send(QueueEvent::QueueReordered { room_id });
        self.playback().ensure_playing(room_id).await?;

        Ok(())
    }

    /// Removes a pending entry. Only the submitter or a host may remove one;
    /// playing and played entries stay for history.
    pub async fn remove(
        &self,
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
        requester: PrimaryKey,
        is_host: bool,
    ) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(room_id).await;

        let entry = self.pending_entry(room_id, entry_id).await?;

        if !is_host && entry.submitter_id != requester {
            return Err(SchedulerError::NotEntryOwner {
                user_id: requester,
                entry_id,
            });
        }

        self.ledger.delete_entry(entry_id).await?;

        info!("Entry {} removed from room {}", entry_id, room_id);

        let _ = self
            .event_sender
            .send(QueueEvent::EntryRemoved { room_id, entry_id });

        self.playback().ensure_playing(room_id).await?;

        Ok(())
    }

    /// A host pins a pending entry to play ahead of the normal order,
    /// optionally ranked among other pinned entries
    pub async fn host_pin(
        &self,
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
        position: Option<i32>,
    ) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(room_id).await;

        let entry = self.pending_entry(room_id, entry_id).await?;
        self.ledger.set_host_override(entry.id, true, position).await?;

        let _ = self.event_sender.send(QueueEvent::QueueReordered { room_id });
        self.playback().ensure_playing(room_id).await?;

        Ok(())
    }

    /// Clears a host pin again
    pub async fn host_unpin(
        &self,
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
    ) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(room_id).await;

        let entry = self.pending_entry(room_id, entry_id).await?;
        self.ledger.set_host_override(entry.id, false, None).await?;

        let _ = self.event_sender.send(QueueEvent::QueueReordered { room_id });
        self.playback().ensure_playing(room_id).await?;

        Ok(())
    }

    /// Fetches an entry, ensuring it belongs to the room and is still pending
    async fn pending_entry(
        &self,
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
    ) -> Result<QueueEntryData, SchedulerError> {
        let entry = self.ledger.entry_by_id(entry_id).await?;

        if entry.room_id != room_id {
            return Err(PlaybackError::WrongRoom { entry_id, room_id }.into());
        }

        if entry.state != EntryState::Pending {
            return Err(SchedulerError::NotPending {
                entry_id,
                actual: entry.state,
            });
        }

        Ok(entry)
    }

    /// Rewrites the pending set's keys at gap spacing, preserving `order`.
    /// New keys land strictly above every existing live key so the rewrite
    /// never collides with a key still in place.
    async fn renumber(&self, room_id: PrimaryKey, order: &[QueueEntryData]) -> Result<(), SchedulerError> {
        let active = self.ledger.active_entries(room_id).await?;
        let base = active.iter().map(|e| e.sort_key).fold(0.0, f64::max);

        for (index, entry) in order.iter().enumerate() {
            let key = base + self.config.sort_key_gap * (index as f64 + 1.0);
            self.ledger.update_sort_key(entry.id, key).await?;
        }

        Ok(())
    }

    /// Swaps the ordering keys of two entries, parking the first above every
    /// live key so neither update transiently collides
    async fn swap_keys(
        &self,
        room_id: PrimaryKey,
        first: &QueueEntryData,
        second: &QueueEntryData,
    ) -> Result<(), SchedulerError> {
        let active = self.ledger.active_entries(room_id).await?;
        let parked = active.iter().map(|e| e.sort_key).fold(0.0, f64::max)
            + self.config.sort_key_gap;

        self.ledger.update_sort_key(first.id, parked).await?;
        self.ledger.update_sort_key(second.id, first.sort_key).await?;
        self.ledger.update_sort_key(first.id, second.sort_key).await?;

        Ok(())
    }
}
