use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    next_entry, EntryState, EventSender, Ledger, LedgerError, PrimaryKey, QueueEvent, RoomData,
    SchedulerConfig,
};

#[derive(Debug, Error)]
pub enum PlaybackError {
    /// Another call already put an entry on screen
    #[error("room {room_id} already has a playing entry")]
    Conflict { room_id: PrimaryKey },
    #[error("entry {entry_id} is {actual}, expected {expected}")]
    InvalidState {
        entry_id: PrimaryKey,
        actual: EntryState,
        expected: EntryState,
    },
    #[error("entry {entry_id} does not belong to room {room_id}")]
    WrongRoom {
        entry_id: PrimaryKey,
        room_id: PrimaryKey,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// How an entry left the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Played to the end
    Ended,
    /// The display client reported a playback error
    Errored,
}

impl PlaybackOutcome {
    fn terminal_state(self) -> EntryState {
        match self {
            Self::Ended => EntryState::Completed,
            Self::Errored => EntryState::Skipped,
        }
    }
}

/// The playback state machine. The only code that moves entries into or out
/// of `Playing`, or touches a room's current-entry pointer.
///
/// Callers must hold the room's lock for the duration of every call.
pub struct Playback<'a, L> {
    ledger: &'a L,
    events: &'a EventSender,
    config: &'a SchedulerConfig,
}

impl<'a, L: Ledger> Playback<'a, L> {
    pub(crate) fn new(ledger: &'a L, events: &'a EventSender, config: &'a SchedulerConfig) -> Self {
        Self {
            ledger,
            events,
            config,
        }
    }

    /// Puts a pending entry on screen.
    ///
    /// Fails with [PlaybackError::Conflict] when the room already has a live
    /// playing entry. The conflict is not retried here: the caller re-derives
    /// state and decides, which usually means doing nothing because another
    /// caller already advanced the room.
    pub async fn start(&self, room: &RoomData, entry_id: PrimaryKey) -> Result<(), PlaybackError> {
        let entry = self.ledger.entry_by_id(entry_id).await?;

        if entry.room_id != room.id {
            return Err(PlaybackError::WrongRoom {
                entry_id,
                room_id: room.id,
            });
        }

        if entry.state != EntryState::Pending {
            return Err(PlaybackError::InvalidState {
                entry_id,
                actual: entry.state,
                expected: EntryState::Pending,
            });
        }

        if let Some(current_id) = room.current_entry_id {
            match self.ledger.entry_by_id(current_id).await {
                Ok(current) if current.state == EntryState::Playing => {
                    return Err(PlaybackError::Conflict { room_id: room.id });
                }
                // A stale pointer is repaired, not reported
                Ok(_) | Err(LedgerError::NotFound { .. }) => {
                    self.ledger.set_current_entry(room.id, None).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.ledger.mark_playing(entry_id, Utc::now()).await?;
        self.ledger.set_current_entry(room.id, Some(entry_id)).await?;

        info!("Entry {} started playing in room {}", entry_id, room.id);

        let _ = self.events.send(QueueEvent::PlaybackStarted {
            room_id: room.id,
            entry_id,
        });

        Ok(())
    }

    /// Takes a playing entry off screen and advances the fairness cursor.
    ///
    /// Idempotent: finishing an already terminal entry succeeds without
    /// touching the ledger or emitting a second event.
    pub async fn finish(
        &self,
        room: &RoomData,
        entry_id: PrimaryKey,
        outcome: PlaybackOutcome,
    ) -> Result<(), PlaybackError> {
        let entry = self.ledger.entry_by_id(entry_id).await?;

        if entry.room_id != room.id {
            return Err(PlaybackError::WrongRoom {
                entry_id,
                room_id: room.id,
            });
        }

        if entry.state.is_terminal() {
            debug!("Entry {} is already {}, nothing to do", entry_id, entry.state);
            return Ok(());
        }

        if entry.state != EntryState::Playing {
            return Err(PlaybackError::InvalidState {
                entry_id,
                actual: entry.state,
                expected: EntryState::Playing,
            });
        }

        let terminal = outcome.terminal_state();
        self.ledger.mark_finished(entry_id, terminal, Utc::now()).await?;

        if room.current_entry_id == Some(entry_id) {
            self.ledger.set_current_entry(room.id, None).await?;
        }

        self.ledger
            .set_last_singer(room.id, Some(entry.submitter_id))
            .await?;

        info!(
            "Entry {} finished as {} in room {}",
            entry_id, terminal, room.id
        );

        let _ = self.events.send(QueueEvent::PlaybackFinished {
            room_id: room.id,
            entry_id,
            submitter_id: entry.submitter_id,
            outcome: terminal,
        });

        Ok(())
    }

    /// Re-establishes the single-playing invariant for a room.
    ///
    /// Clears a stale current-entry pointer, force-completes playback that
    /// nobody reported the end of, and starts the next pending entry when the
    /// room turned out idle. Every mutating operation runs this before
    /// returning, which is what lets the system recover from vanished display
    /// clients without a background tick.
    pub async fn ensure_playing(&self, room_id: PrimaryKey) -> Result<(), PlaybackError> {
        let mut room = self.ledger.room_by_id(room_id).await?;

        if let Some(current_id) = room.current_entry_id {
            match self.ledger.entry_by_id(current_id).await {
                Ok(current) if current.state == EntryState::Playing => {
                    let age = Utc::now() - current.started_at.unwrap_or(current.added_at);

                    if age <= self.config.stale_playback() {
                        // Playback is healthy
                        return Ok(());
                    }

                    warn!(
                        "Entry {} in room {} passed the stale playback bound, force completing",
                        current_id, room_id
                    );

                    self.finish(&room, current_id, PlaybackOutcome::Ended).await?;
                    room = self.ledger.room_by_id(room_id).await?;
                }
                Ok(_) | Err(LedgerError::NotFound { .. }) => {
                    warn!(
                        "Room {} pointed at non-playing entry {}, clearing",
                        room_id, current_id
                    );

                    self.ledger.set_current_entry(room_id, None).await?;
                    room.current_entry_id = None;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let pending = self.ledger.pending_entries(room_id).await?;

        let Some(next) = next_entry(room.discipline, &pending, room.last_singer_id) else {
            debug!("Room {} is idle with nothing pending", room_id);
            return Ok(());
        };

        match self.start(&room, next.id).await {
            // Benign race: another caller advanced the room first
            Err(PlaybackError::Conflict { .. }) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{EventReceiver, MemoryLedger, NewEntry, NewRoom, QueueDiscipline, QueueEntryData};
    use chrono::Duration;
    use crossbeam::channel::unbounded;

    struct Fixture {
        ledger: MemoryLedger,
        events: EventSender,
        receiver: EventReceiver,
        config: SchedulerConfig,
        room: RoomData,
    }

    impl Fixture {
        async fn new() -> Self {
            let ledger = MemoryLedger::default();
            let (events, receiver) = unbounded();

            let room = ledger
                .create_room(NewRoom {
                    slug: "party".to_string(),
                    title: "Party".to_string(),
                    discipline: QueueDiscipline::Fifo,
                })
                .await
                .unwrap();

            Self {
                ledger,
                events,
                receiver,
                config: SchedulerConfig::default(),
                room,
            }
        }

        fn playback(&self) -> Playback<'_, MemoryLedger> {
            Playback::new(&self.ledger, &self.events, &self.config)
        }

        async fn add_entry(&self, submitter_id: i32, sort_key: f64) -> QueueEntryData {
            self.ledger
                .create_entry(NewEntry {
                    room_id: self.room.id,
                    submitter_id,
                    item_ref: "song".to_string(),
                    sort_key,
                    round_number: 1,
                })
                .await
                .unwrap()
        }

        async fn room(&self) -> RoomData {
            self.ledger.room_by_id(self.room.id).await.unwrap()
        }

        fn finished_events(&self) -> usize {
            self.receiver
                .try_iter()
                .filter(|e| matches!(e, QueueEvent::PlaybackFinished { .. }))
                .count()
        }
    }

    #[tokio::test]
    async fn start_conflicts_while_another_entry_plays() {
        let fixture = Fixture::new().await;
        let first = fixture.add_entry(10, 1000.0).await;
        let second = fixture.add_entry(11, 2000.0).await;

        fixture.playback().start(&fixture.room().await, first.id).await.unwrap();

        let result = fixture.playback().start(&fixture.room().await, second.id).await;
        assert!(matches!(result, Err(PlaybackError::Conflict { .. })));

        // The invariant held
        let room = fixture.room().await;
        assert_eq!(room.current_entry_id, Some(first.id));
    }

    #[tokio::test]
    async fn finish_is_idempotent_and_emits_once() {
        let fixture = Fixture::new().await;
        let entry = fixture.add_entry(10, 1000.0).await;

        fixture.playback().start(&fixture.room().await, entry.id).await.unwrap();

        fixture
            .playback()
            .finish(&fixture.room().await, entry.id, PlaybackOutcome::Ended)
            .await
            .unwrap();
        fixture
            .playback()
            .finish(&fixture.room().await, entry.id, PlaybackOutcome::Ended)
            .await
            .unwrap();

        let stored = fixture.ledger.entry_by_id(entry.id).await.unwrap();
        assert_eq!(stored.state, EntryState::Completed);

        let room = fixture.room().await;
        assert_eq!(room.current_entry_id, None);
        assert_eq!(room.last_singer_id, Some(10));

        assert_eq!(fixture.finished_events(), 1);
    }

    #[tokio::test]
    async fn finish_rejects_a_pending_entry() {
        let fixture = Fixture::new().await;
        let entry = fixture.add_entry(10, 1000.0).await;

        let result = fixture
            .playback()
            .finish(&fixture.room().await, entry.id, PlaybackOutcome::Ended)
            .await;

        assert!(matches!(result, Err(PlaybackError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn ensure_playing_starts_the_next_entry_when_idle() {
        let fixture = Fixture::new().await;
        let entry = fixture.add_entry(10, 1000.0).await;

        fixture.playback().ensure_playing(fixture.room.id).await.unwrap();

        let room = fixture.room().await;
        assert_eq!(room.current_entry_id, Some(entry.id));

        let stored = fixture.ledger.entry_by_id(entry.id).await.unwrap();
        assert_eq!(stored.state, EntryState::Playing);
    }

    #[tokio::test]
    async fn ensure_playing_clears_a_stale_pointer() {
        let fixture = Fixture::new().await;
        let first = fixture.add_entry(10, 1000.0).await;
        let second = fixture.add_entry(11, 2000.0).await;

        // Simulate a pointer left behind without a playing entry
        fixture
            .ledger
            .mark_finished(first.id, EntryState::Completed, Utc::now())
            .await
            .unwrap();
        fixture
            .ledger
            .set_current_entry(fixture.room.id, Some(first.id))
            .await
            .unwrap();

        fixture.playback().ensure_playing(fixture.room.id).await.unwrap();

        let room = fixture.room().await;
        assert_eq!(room.current_entry_id, Some(second.id));
    }

    #[tokio::test]
    async fn ensure_playing_force_completes_stale_playback() {
        let fixture = Fixture::new().await;
        let vanished = fixture.add_entry(10, 1000.0).await;
        let next = fixture.add_entry(11, 2000.0).await;

        // The display client disappeared three hours ago
        let long_ago = Utc::now() - Duration::hours(3);
        fixture.ledger.mark_playing(vanished.id, long_ago).await.unwrap();
        fixture
            .ledger
            .set_current_entry(fixture.room.id, Some(vanished.id))
            .await
            .unwrap();

        fixture.playback().ensure_playing(fixture.room.id).await.unwrap();

        let stored = fixture.ledger.entry_by_id(vanished.id).await.unwrap();
        assert_eq!(stored.state, EntryState::Completed);

        let room = fixture.room().await;
        assert_eq!(room.current_entry_id, Some(next.id));
        assert_eq!(room.last_singer_id, Some(10));
    }

    #[tokio::test]
    async fn ensure_playing_leaves_healthy_playback_alone() {
        let fixture = Fixture::new().await;
        let playing = fixture.add_entry(10, 1000.0).await;
        fixture.add_entry(11, 2000.0).await;

        fixture.playback().start(&fixture.room().await, playing.id).await.unwrap();
        fixture.playback().ensure_playing(fixture.room.id).await.unwrap();

        let room = fixture.room().await;
        assert_eq!(room.current_entry_id, Some(playing.id));
    }
}
