use crate::{PrimaryKey, QueueDiscipline, QueueEntryData};

/// Chooses the entry that should play next.
///
/// Pure: operates on a snapshot of the room's pending entries and the
/// fairness cursor, in priority order host overrides, submitter rotation,
/// then plain queue order. Returns none when nothing is pending.
pub fn next_entry<'a>(
    discipline: QueueDiscipline,
    pending: &'a [QueueEntryData],
    cursor: Option<PrimaryKey>,
) -> Option<&'a QueueEntryData> {
    let mut pending: Vec<&QueueEntryData> = pending.iter().collect();
    pending.sort_by(|a, b| a.queue_order(b));

    if let Some(winner) = host_override_winner(&pending) {
        return Some(winner);
    }

    if discipline == QueueDiscipline::RoundRobin {
        if let Some(winner) = rotation_winner(&pending, cursor) {
            return Some(winner);
        }
    }

    pending.first().copied()
}

/// The host-pinned entry with the smallest override position. Entries pinned
/// without a position come after all positioned ones.
fn host_override_winner<'a>(pending: &[&'a QueueEntryData]) -> Option<&'a QueueEntryData> {
    pending
        .iter()
        .filter(|e| e.host_override)
        .min_by(|a, b| {
            let a_position = a.host_override_position.unwrap_or(i32::MAX);
            let b_position = b.host_override_position.unwrap_or(i32::MAX);

            a_position.cmp(&b_position).then_with(|| a.queue_order(b))
        })
        .copied()
}

/// Walks the submitter rotation once, starting just past the cursor, and
/// returns the first submitter's earliest pending entry
fn rotation_winner<'a>(
    pending: &[&'a QueueEntryData],
    cursor: Option<PrimaryKey>,
) -> Option<&'a QueueEntryData> {
    // Distinct submitters in order of their earliest pending entry
    let mut submitters: Vec<PrimaryKey> = vec![];

    for entry in pending {
        if !submitters.contains(&entry.submitter_id) {
            submitters.push(entry.submitter_id);
        }
    }

    if submitters.is_empty() {
        return None;
    }

    // A cursor naming a submitter with nothing pending falls back to the
    // natural order
    let start = cursor
        .and_then(|cursor| submitters.iter().position(|s| *s == cursor))
        .map(|index| (index + 1) % submitters.len())
        .unwrap_or(0);

    let winner = submitters[start];
    pending.iter().find(|e| e.submitter_id == winner).copied()
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids(entries: &[QueueEntryData]) -> Vec<PrimaryKey> {
        entries.iter().map(|e| e.id).collect()
    }

    #[test]
    fn nothing_pending_selects_nothing() {
        assert!(next_entry(QueueDiscipline::Fifo, &[], None).is_none());
        assert!(next_entry(QueueDiscipline::RoundRobin, &[], Some(10)).is_none());
    }

    #[test]
    fn fifo_picks_the_smallest_key() {
        let pending = vec![
            QueueEntryData::mock(1, 10, 3000.0, 1),
            QueueEntryData::mock(2, 11, 1000.0, 1),
            QueueEntryData::mock(3, 10, 2000.0, 1),
        ];

        let next = next_entry(QueueDiscipline::Fifo, &pending, None).unwrap();
        assert_eq!(next.id, 2);
    }

    #[test]
    fn rotation_starts_after_the_cursor() {
        let pending = vec![
            QueueEntryData::mock(1, 10, 1000.0, 1),
            QueueEntryData::mock(2, 11, 2000.0, 1),
            QueueEntryData::mock(3, 12, 3000.0, 1),
        ];

        let next = next_entry(QueueDiscipline::RoundRobin, &pending, None).unwrap();
        assert_eq!(next.id, 1);

        let next = next_entry(QueueDiscipline::RoundRobin, &pending, Some(10)).unwrap();
        assert_eq!(next.id, 2);

        let next = next_entry(QueueDiscipline::RoundRobin, &pending, Some(12)).unwrap();
        assert_eq!(next.id, 1);
    }

    #[test]
    fn missing_cursor_submitter_falls_back_to_natural_order() {
        let pending = vec![
            QueueEntryData::mock(1, 11, 2000.0, 1),
            QueueEntryData::mock(2, 12, 3000.0, 1),
        ];

        // Submitter 10 sang last but has nothing pending anymore
        let next = next_entry(QueueDiscipline::RoundRobin, &pending, Some(10)).unwrap();
        assert_eq!(next.id, 1);
    }

    #[test]
    fn rotation_picks_the_winners_earliest_entry() {
        let pending = vec![
            QueueEntryData::mock(1, 10, 1000.0, 1),
            QueueEntryData::mock(2, 11, 4000.0, 2),
            QueueEntryData::mock(3, 11, 2000.0, 1),
        ];

        let next = next_entry(QueueDiscipline::RoundRobin, &pending, Some(10)).unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn host_override_beats_the_rotation() {
        let pending = vec![
            QueueEntryData::mock(1, 10, 1000.0, 1),
            QueueEntryData::mock(2, 11, 2000.0, 1).with_override(Some(2)),
            QueueEntryData::mock(3, 12, 3000.0, 1).with_override(Some(1)),
            QueueEntryData::mock(4, 13, 4000.0, 1).with_override(None),
        ];

        // Smallest override position wins, unpositioned pins come last
        let next = next_entry(QueueDiscipline::RoundRobin, &pending, Some(10)).unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn sort_key_ties_break_by_id() {
        let pending = vec![
            QueueEntryData::mock(5, 10, 1000.0, 1),
            QueueEntryData::mock(4, 11, 1000.0, 1),
        ];

        let next = next_entry(QueueDiscipline::Fifo, &pending, None).unwrap();
        assert_eq!(next.id, 4);

        // Ordering helper agrees
        let mut sorted = pending.clone();
        sorted.sort_by(|a, b| a.queue_order(b));
        assert_eq!(ids(&sorted), vec![4, 5]);
    }
}
