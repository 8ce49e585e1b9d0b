use crate::{EntryState, PrimaryKey, QueueDiscipline, QueueEntryData};

/// The ordering slot assigned to a new submission
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueuePosition {
    pub sort_key: f64,
    pub round_number: i32,
}

/// Assigns a sort key and fairness round to a new submission.
///
/// `entries` is a snapshot of every entry in the room. The function is pure
/// and safe to re-invoke with a fresh snapshot when the ledger rejects the
/// key under concurrent submission.
pub fn allocate_position(
    discipline: QueueDiscipline,
    submitter_id: PrimaryKey,
    entries: &[QueueEntryData],
    gap: f64,
) -> QueuePosition {
    match discipline {
        QueueDiscipline::Fifo => QueuePosition {
            sort_key: max_live_key(entries).map(|key| key + gap).unwrap_or(gap),
            round_number: 1,
        },
        QueueDiscipline::RoundRobin => {
            let round = first_free_round(submitter_id, entries);

            QueuePosition {
                sort_key: key_for_round(round, entries, gap),
                round_number: round,
            }
        }
    }
}

/// A key strictly between two neighbors, or none when the gap between them
/// is exhausted and the queue needs renumbering
pub fn key_between(lower: Option<f64>, upper: Option<f64>, gap: f64) -> Option<f64> {
    match (lower, upper) {
        (Some(lower), Some(upper)) => {
            let middle = (lower + upper) / 2.0;
            (middle > lower && middle < upper).then_some(middle)
        }
        (Some(lower), None) => Some(lower + gap),
        (None, Some(upper)) => Some(upper - gap),
        (None, None) => Some(gap),
    }
}

fn max_live_key(entries: &[QueueEntryData]) -> Option<f64> {
    entries
        .iter()
        .filter(|e| !e.state.is_terminal())
        .map(|e| e.sort_key)
        .reduce(f64::max)
}

/// The smallest round the submitter hasn't claimed yet. Every entry counts,
/// played ones included, so a submitter's laps accumulate over the session
/// and a newcomer slots into the earliest open lap.
fn first_free_round(submitter_id: PrimaryKey, entries: &[QueueEntryData]) -> i32 {
    let mut round = 1;

    loop {
        let taken = entries
            .iter()
            .any(|e| e.submitter_id == submitter_id && e.round_number == round);

        if !taken {
            return round;
        }

        round += 1;
    }
}

/// A key after every live entry of this round or earlier, and before every
/// pending entry of later rounds.
///
/// Reorders rewrite sort keys without touching rounds, so a shuffled queue
/// can invert these bounds; the midpoint then lands inside the shuffled
/// region rather than on a clean round boundary. Rounds only steer placement
/// at submission time, selection never reads them.
fn key_for_round(round: i32, entries: &[QueueEntryData], gap: f64) -> f64 {
    let lower = entries
        .iter()
        .filter(|e| !e.state.is_terminal() && e.round_number <= round)
        .map(|e| e.sort_key)
        .reduce(f64::max);

    let upper = entries
        .iter()
        .filter(|e| e.state == EntryState::Pending && e.round_number > round)
        .map(|e| e.sort_key)
        .reduce(f64::min);

    match (lower, upper) {
        (Some(lower), Some(upper)) => (lower + upper) / 2.0,
        (Some(lower), None) => lower + gap,
        (None, Some(upper)) => upper - gap,
        (None, None) => gap,
    }
}
