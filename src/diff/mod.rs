//! Live-view difference detection: configuration, byte masks, decisions
//!
//! The engine itself lives in [`engine`]; this module holds the knobs and
//! the decision record handed to the observer.

pub mod engine;

pub use engine::{DiffEngine, DiffStats, KeyStats};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Operation mode for the diff view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
    /// Hide repeated frames, no highlight.
    #[default]
    Filter,
    /// Show all frames, attach deltas vs the snapshot baseline.
    Highlight,
    /// Hide repeated frames and attach deltas.
    Both,
}

/// Diff engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: DiffMode,
    /// Filtering only applies when the per-key rate exceeds this threshold.
    #[serde(default = "default_min_rate")]
    pub min_message_rate: f64,
    /// Bytes that must change (vs last displayed) to show a frame.
    #[serde(default = "default_min_bytes")]
    pub min_bytes_changed: usize,
    /// Sliding window for per-key rate calculation, in milliseconds.
    #[serde(default = "default_window_ms")]
    pub time_window_ms: u64,
    /// Heartbeat: show at least one frame per interval even without changes.
    /// Zero disables the heartbeat.
    #[serde(default = "default_suppress_ms")]
    pub max_suppress_ms: u64,
    /// Key by (id, source) instead of id alone.
    #[serde(default = "default_true")]
    pub compare_by_channel: bool,
    /// Bytes to compare: "all", or indices and inclusive ranges, e.g.
    /// "0-3,5,7".
    #[serde(default = "default_byte_mask")]
    pub byte_mask: String,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DiffMode::Filter,
            min_message_rate: default_min_rate(),
            min_bytes_changed: default_min_bytes(),
            time_window_ms: default_window_ms(),
            max_suppress_ms: default_suppress_ms(),
            compare_by_channel: default_true(),
            byte_mask: default_byte_mask(),
        }
    }
}

fn default_min_rate() -> f64 {
    10.0
}

fn default_min_bytes() -> usize {
    1
}

fn default_window_ms() -> u64 {
    500
}

fn default_suppress_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_byte_mask() -> String {
    "all".to_string()
}

/// Parsed byte mask: `None` compares every index.
pub fn parse_byte_mask(mask: &str) -> Option<HashSet<usize>> {
    let mask = mask.trim();
    if mask.is_empty() || mask.eq_ignore_ascii_case("all") {
        return None;
    }

    let mut indices = HashSet::new();
    for part in mask.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let parsed = (start.trim().parse::<usize>(), end.trim().parse::<usize>());
            match parsed {
                (Ok(a), Ok(b)) => {
                    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                    indices.extend(lo..=hi);
                }
                _ => {
                    // Malformed masks fall back to comparing all bytes.
                    warn!(mask, "invalid byte mask, comparing all bytes");
                    return None;
                }
            }
        } else {
            match part.parse::<usize>() {
                Ok(i) => {
                    indices.insert(i);
                }
                Err(_) => {
                    warn!(mask, "invalid byte mask, comparing all bytes");
                    return None;
                }
            }
        }
    }
    Some(indices)
}

/// Diff key: identifier alone, or identifier plus source channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiffKey {
    pub can_id: u32,
    pub source: Option<String>,
}

/// Why a frame was shown or hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Disabled,
    Highlight,
    First,
    LowRate,
    Delta,
    Heartbeat,
    Suppressed,
}

/// Per-frame verdict handed to the observer.
#[derive(Debug, Clone)]
pub struct DiffDecision {
    pub display: bool,
    pub key: DiffKey,
    pub rate: f64,
    pub bytes_changed_vs_last_displayed: usize,
    pub bytes_changed_vs_snapshot: usize,
    pub changed_indices_vs_snapshot: Vec<usize>,
    pub reason: DecisionReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_all() {
        assert_eq!(parse_byte_mask("all"), None);
        assert_eq!(parse_byte_mask("ALL"), None);
        assert_eq!(parse_byte_mask(""), None);
    }

    #[test]
    fn test_mask_indices_and_ranges() {
        let mask = parse_byte_mask("0-3,5,7").unwrap();
        assert_eq!(mask, HashSet::from([0, 1, 2, 3, 5, 7]));
    }

    #[test]
    fn test_mask_reversed_range_normalized() {
        let mask = parse_byte_mask("3-1").unwrap();
        assert_eq!(mask, HashSet::from([1, 2, 3]));
    }

    #[test]
    fn test_malformed_mask_falls_back_to_all() {
        assert_eq!(parse_byte_mask("0,x,2"), None);
        assert_eq!(parse_byte_mask("1-"), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = DiffConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.mode, DiffMode::Filter);
        assert_eq!(config.time_window_ms, 500);
        assert_eq!(config.max_suppress_ms, 1000);
        assert_eq!(config.byte_mask, "all");
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = DiffConfig { enabled: true, mode: DiffMode::Both, ..Default::default() };
        let json = serde_json::to_string(&config).unwrap();
        let back: DiffConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
