//! Next-transfer selection
//!
//! An item is eligible when it is enabled, local, exactly `Waiting`, not
//! being transferred outside the scheduler, and its backoff has elapsed.
//! Eligible items are ordered by:
//!
//! 1. add time, earliest first
//! 2. remaining blocks, fewest first; unknown progress sorts last
//! 3. file size, smallest first

use crate::item::{ItemState, QueueId, TransferItem};
use std::cmp::Ordering;

/// Whether `item` may be dispatched at `now`
pub fn is_eligible<F>(item: &TransferItem, now: u64, backoff_ms: u64, busy: &F) -> bool
where
    F: Fn(&QueueId) -> bool,
{
    item.is_enabled()
        && !item.is_external()
        && item.state() == ItemState::Waiting
        && now.saturating_sub(item.last_stopped_at()) >= backoff_ms
        && !busy(item.queue_id())
}

/// Dispatch order of two eligible items
#[must_use]
pub fn dispatch_order(a: &TransferItem, b: &TransferItem) -> Ordering {
    a.added_at()
        .cmp(&b.added_at())
        .then_with(|| {
            let ra = a.remaining_units().unwrap_or(u64::MAX);
            let rb = b.remaining_units().unwrap_or(u64::MAX);
            ra.cmp(&rb)
        })
        .then_with(|| a.file_size().cmp(&b.file_size()))
}

/// Pick the best eligible item
///
/// `busy` reports identifiers already transferring outside the scheduler.
pub fn select_next<'a, F>(
    items: &'a [TransferItem],
    now: u64,
    backoff_ms: u64,
    busy: F,
) -> Option<&'a TransferItem>
where
    F: Fn(&QueueId) -> bool,
{
    items
        .iter()
        .filter(|item| is_eligible(item, now, backoff_ms, &busy))
        .min_by(|a, b| dispatch_order(a, b))
}
