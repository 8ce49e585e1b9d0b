use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    EntryState, Ledger, LedgerError, NewEntry, NewRoom, PrimaryKey, QueueEntryData, Result,
    RoomData,
};

/// An in-process ledger implementation, used for embedded deployments and tests
#[derive(Default)]
pub struct MemoryLedger {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    last_id: PrimaryKey,
    rooms: HashMap<PrimaryKey, RoomData>,
    entries: HashMap<PrimaryKey, QueueEntryData>,
}

impl Inner {
    fn next_id(&mut self) -> PrimaryKey {
        self.last_id += 1;
        self.last_id
    }

    fn room_mut(&mut self, room_id: PrimaryKey) -> Result<&mut RoomData> {
        self.rooms.get_mut(&room_id).ok_or(LedgerError::NotFound {
            resource: "room",
            identifier: "id",
        })
    }

    fn entry_mut(&mut self, entry_id: PrimaryKey) -> Result<&mut QueueEntryData> {
        self.entries.get_mut(&entry_id).ok_or(LedgerError::NotFound {
            resource: "queue entry",
            identifier: "id",
        })
    }

    fn entries_where<F>(&self, room_id: PrimaryKey, filter: F) -> Vec<QueueEntryData>
    where
        F: Fn(&QueueEntryData) -> bool,
    {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.room_id == room_id && filter(e))
            .cloned()
            .collect();

        entries.sort_by(|a, b| a.queue_order(b));
        entries
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        let mut inner = self.inner.write();

        if inner.rooms.values().any(|r| r.slug == new_room.slug) {
            return Err(LedgerError::Conflict {
                resource: "room",
                field: "slug",
                value: new_room.slug,
            });
        }

        let id = inner.next_id();
        let room = RoomData {
            id,
            slug: new_room.slug,
            title: new_room.title,
            discipline: new_room.discipline,
            current_entry_id: None,
            last_singer_id: None,
        };

        inner.rooms.insert(id, room.clone());
        Ok(room)
    }

    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData> {
        self.inner
            .read()
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or(LedgerError::NotFound {
                resource: "room",
                identifier: "id",
            })
    }

    async fn room_by_slug(&self, slug: &str) -> Result<RoomData> {
        self.inner
            .read()
            .rooms
            .values()
            .find(|r| r.slug == slug)
            .cloned()
            .ok_or(LedgerError::NotFound {
                resource: "room",
                identifier: "slug",
            })
    }

    async fn set_current_entry(
        &self,
        room_id: PrimaryKey,
        entry_id: Option<PrimaryKey>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        inner.room_mut(room_id)?.current_entry_id = entry_id;
        Ok(())
    }

    async fn set_last_singer(
        &self,
        room_id: PrimaryKey,
        submitter_id: Option<PrimaryKey>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        inner.room_mut(room_id)?.last_singer_id = submitter_id;
        Ok(())
    }

    async fn create_entry(&self, new_entry: NewEntry) -> Result<QueueEntryData> {
        let mut inner = self.inner.write();

        if !inner.rooms.contains_key(&new_entry.room_id) {
            return Err(LedgerError::NotFound {
                resource: "room",
                identifier: "id",
            });
        }

        let clashes = inner.entries.values().any(|e| {
            e.room_id == new_entry.room_id
                && !e.state.is_terminal()
                && e.sort_key == new_entry.sort_key
        });

        if clashes {
            return Err(LedgerError::Conflict {
                resource: "queue entry",
                field: "sort_key",
                value: new_entry.sort_key.to_string(),
            });
        }

        let id = inner.next_id();
        let entry = QueueEntryData {
            id,
            room_id: new_entry.room_id,
            submitter_id: new_entry.submitter_id,
            item_ref: new_entry.item_ref,
            sort_key: new_entry.sort_key,
            round_number: new_entry.round_number,
            state: EntryState::Pending,
            host_override: false,
            host_override_position: None,
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        inner.entries.insert(id, entry.clone());
        Ok(entry)
    }

    async fn entry_by_id(&self, entry_id: PrimaryKey) -> Result<QueueEntryData> {
        self.inner
            .read()
            .entries
            .get(&entry_id)
            .cloned()
            .ok_or(LedgerError::NotFound {
                resource: "queue entry",
                identifier: "id",
            })
    }

    async fn entries_by_room(&self, room_id: PrimaryKey) -> Result<Vec<QueueEntryData>> {
        Ok(self.inner.read().entries_where(room_id, |_| true))
    }

    async fn pending_entries(&self, room_id: PrimaryKey) -> Result<Vec<QueueEntryData>> {
        Ok(self
            .inner
            .read()
            .entries_where(room_id, |e| e.state == EntryState::Pending))
    }

    async fn active_entries(&self, room_id: PrimaryKey) -> Result<Vec<QueueEntryData>> {
        Ok(self
            .inner
            .read()
            .entries_where(room_id, |e| !e.state.is_terminal()))
    }

    async fn update_sort_key(&self, entry_id: PrimaryKey, sort_key: f64) -> Result<()> {
        let mut inner = self.inner.write();
        let room_id = inner.entry_mut(entry_id)?.room_id;

        // Mirrors the partial unique index of the postgres ledger
        let clashes = inner.entries.values().any(|e| {
            e.id != entry_id
                && e.room_id == room_id
                && !e.state.is_terminal()
                && e.sort_key == sort_key
        });

        if clashes {
            return Err(LedgerError::Conflict {
                resource: "queue entry",
                field: "sort_key",
                value: sort_key.to_string(),
            });
        }

        inner.entry_mut(entry_id)?.sort_key = sort_key;
        Ok(())
    }

    async fn set_host_override(
        &self,
        entry_id: PrimaryKey,
        active: bool,
        position: Option<i32>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.entry_mut(entry_id)?;

        entry.host_override = active;
        entry.host_override_position = position;
        Ok(())
    }

    async fn mark_playing(&self, entry_id: PrimaryKey, started_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.entry_mut(entry_id)?;

        entry.state = EntryState::Playing;
        entry.started_at = Some(started_at);
        Ok(())
    }

    async fn mark_finished(
        &self,
        entry_id: PrimaryKey,
        state: EntryState,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.entry_mut(entry_id)?;

        entry.state = state;
        entry.completed_at = Some(completed_at);
        Ok(())
    }

    async fn delete_entry(&self, entry_id: PrimaryKey) -> Result<()> {
        let mut inner = self.inner.write();

        inner.entries.remove(&entry_id).ok_or(LedgerError::NotFound {
            resource: "queue entry",
            identifier: "id",
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::QueueDiscipline;

    fn new_room() -> NewRoom {
        NewRoom {
            slug: "party".to_string(),
            title: "Party".to_string(),
            discipline: QueueDiscipline::Fifo,
        }
    }

    fn new_entry(room_id: PrimaryKey, sort_key: f64) -> NewEntry {
        NewEntry {
            room_id,
            submitter_id: 1,
            item_ref: "song".to_string(),
            sort_key,
            round_number: 1,
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_room_slug() {
        let ledger = MemoryLedger::default();

        ledger.create_room(new_room()).await.unwrap();
        let result = ledger.create_room(new_room()).await;

        assert!(matches!(result, Err(LedgerError::Conflict { .. })));
    }

    #[tokio::test]
    async fn rejects_colliding_sort_key_among_live_entries() {
        let ledger = MemoryLedger::default();
        let room = ledger.create_room(new_room()).await.unwrap();

        let first = ledger.create_entry(new_entry(room.id, 1000.0)).await.unwrap();
        let clash = ledger.create_entry(new_entry(room.id, 1000.0)).await;
        assert!(matches!(clash, Err(LedgerError::Conflict { .. })));

        // A terminal entry releases its key
        ledger
            .mark_finished(first.id, EntryState::Completed, Utc::now())
            .await
            .unwrap();

        ledger.create_entry(new_entry(room.id, 1000.0)).await.unwrap();
    }
}
