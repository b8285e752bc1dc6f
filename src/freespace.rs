use crate::error::{Error, Result};
use crate::gpt::Slot;

/// An unallocated span of the usable range, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: u64,
    pub end: u64,
}

/// Derive the free spans between the populated entries.
///
/// Walks a cursor from `first_usable`; only meaningful on a sane list
/// (in-bounds, non-overlapping entries).
pub fn gaps(parts: &[Slot], first_usable: u64, last_usable: u64) -> Vec<Gap> {
    let mut sorted: Vec<&Slot> = parts.iter().collect();
    sorted.sort_by_key(|slot| slot.entry.start_lba);

    let mut out = Vec::new();
    let mut cursor = first_usable;
    for slot in sorted {
        if cursor < slot.entry.start_lba {
            out.push(Gap {
                start: cursor,
                end: slot.entry.start_lba - 1,
            });
        }
        cursor = slot.entry.end_lba + 1;
    }
    if cursor <= last_usable {
        out.push(Gap {
            start: cursor,
            end: last_usable,
        });
    }
    out
}

/// Complete an unspecified start or end from the free list.
///
/// With neither endpoint given the first gap wins; with one given, the gap
/// containing that endpoint supplies the other side. `NoFit` when no gap
/// matches.
pub fn guess_free(gaps: &[Gap], start: Option<u64>, end: Option<u64>) -> Result<(u64, u64)> {
    match (start, end) {
        (None, None) => gaps.first().map(|gap| (gap.start, gap.end)).ok_or(Error::NoFit),
        (Some(start), None) => gaps
            .iter()
            .find(|gap| gap.start <= start && start <= gap.end)
            .map(|gap| (start, gap.end))
            .ok_or(Error::NoFit),
        (None, Some(end)) => gaps
            .iter()
            .find(|gap| gap.start <= end && end <= gap.end)
            .map(|gap| (gap.start, end))
            .ok_or(Error::NoFit),
        (Some(start), Some(end)) => Ok((start, end)),
    }
}
