//! Human-readable progress formatting.

use console::{StyledObject, style};
use haul_core::{BlockRate, ItemState, TransferItem};
use std::time::Duration;

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format speed in human-readable format (bytes/sec)
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Format a block rate, spelling out the non-rate cases
#[must_use]
pub fn format_rate(rate: BlockRate) -> String {
    match rate {
        BlockRate::Measuring => "measuring".to_string(),
        BlockRate::Idle => "idle".to_string(),
        BlockRate::PerMinute(r) => format!("{r:.1} blocks/min"),
    }
}

/// Percent done, or a dash while unknown
#[must_use]
pub fn format_percent(percent: Option<f64>) -> String {
    percent.map_or_else(|| "-".to_string(), |p| format!("{p:.1}%"))
}

/// Colored state label
#[must_use]
pub fn state_label(state: ItemState) -> StyledObject<String> {
    let label = state.to_string();
    match state {
        ItemState::Done => style(label).green(),
        ItemState::Failed => style(label).red(),
        ItemState::Progress => style(label).cyan(),
        ItemState::EncodingRequested | ItemState::Encoding => style(label).yellow(),
        ItemState::Waiting => style(label).dim(),
    }
}

/// One-line progress summary of an item at `now`
#[must_use]
pub fn summarize(item: &TransferItem, now: u64) -> String {
    let mut parts = vec![format_percent(item.percent_done())];
    if item.state() == ItemState::Progress {
        parts.push(format_rate(item.block_rate(now)));
        if let Some(bps) = item.bytes_per_second(now) {
            parts.push(format_speed(bps));
        }
        if let Some(eta) = item.eta(now) {
            parts.push(format!("ETA {}", format_duration(eta)));
        }
    }
    parts.join(", ")
}
