//! Per-key diff evaluation: sliding-window rates, snapshot deltas,
//! heartbeat suppression
//!
//! Each key is independent and single-writer: `evaluate` must not be called
//! concurrently for the same key. The pipeline worker is the only caller.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::info;

use super::{parse_byte_mask, DecisionReason, DiffConfig, DiffDecision, DiffKey, DiffMode};
use crate::frame::Frame;

/// Statistics for one diff key.
#[derive(Debug, Clone, Default)]
pub struct KeyStats {
    pub message_count: u64,
    pub last_timestamp: f64,
    pub message_rate: f64,
    pub bytes_changed_count: u64,
    pub total_bytes_changed: u64,
    pub display_count: u64,
    pub hidden_count: u64,
}

impl KeyStats {
    pub fn avg_bytes_changed(&self) -> f64 {
        if self.bytes_changed_count == 0 {
            0.0
        } else {
            self.total_bytes_changed as f64 / self.bytes_changed_count as f64
        }
    }
}

/// Global diff counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffStats {
    pub total_received: u64,
    pub total_displayed: u64,
    pub total_hidden: u64,
    pub unique_keys: usize,
}

impl DiffStats {
    pub fn hidden_percent(&self) -> f64 {
        if self.total_received == 0 {
            0.0
        } else {
            self.total_hidden as f64 / self.total_received as f64 * 100.0
        }
    }
}

struct KeyState {
    last_seen: Frame,
    snapshot: Frame,
    last_displayed: Option<Frame>,
    last_displayed_ts: f64,
    window: VecDeque<f64>,
    stats: KeyStats,
}

/// Diff engine over a live frame stream.
pub struct DiffEngine {
    config: DiffConfig,
    keys: HashMap<DiffKey, KeyState>,
    /// Parsed byte mask cached against the config string.
    mask: Option<HashSet<usize>>,
    mask_cache_key: String,
    total_received: u64,
    total_displayed: u64,
    total_hidden: u64,
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        let mask = parse_byte_mask(&config.byte_mask);
        let mask_cache_key = config.byte_mask.clone();
        info!(
            enabled = config.enabled,
            min_rate = config.min_message_rate,
            min_bytes = config.min_bytes_changed,
            window_ms = config.time_window_ms,
            max_suppress_ms = config.max_suppress_ms,
            "diff engine initialized"
        );
        Self {
            config,
            keys: HashMap::new(),
            mask,
            mask_cache_key,
            total_received: 0,
            total_displayed: 0,
            total_hidden: 0,
        }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Swap the configuration; mask cache is refreshed, key state kept.
    pub fn update_config(&mut self, config: DiffConfig) {
        if config.byte_mask != self.mask_cache_key {
            self.mask = parse_byte_mask(&config.byte_mask);
            self.mask_cache_key = config.byte_mask.clone();
        }
        info!(enabled = config.enabled, "diff config updated");
        self.config = config;
    }

    fn key_for(&self, frame: &Frame) -> DiffKey {
        DiffKey {
            can_id: frame.can_id(),
            source: self
                .config
                .compare_by_channel
                .then(|| frame.source().to_string()),
        }
    }

    fn bytes_changed(&self, a: &Frame, b: &Frame) -> (usize, Vec<usize>) {
        let max_len = a.data().len().max(b.data().len());
        let mut changed = 0;
        let mut indices = Vec::new();
        for i in 0..max_len {
            if let Some(mask) = &self.mask {
                if !mask.contains(&i) {
                    continue;
                }
            }
            let b1 = a.data().get(i).copied().unwrap_or(0);
            let b2 = b.data().get(i).copied().unwrap_or(0);
            if b1 != b2 {
                changed += 1;
                indices.push(i);
            }
        }
        (changed, indices)
    }

    fn update_rate(window: &mut VecDeque<f64>, timestamp: f64, window_ms: u64) -> f64 {
        let window_s = (window_ms.max(50)) as f64 / 1000.0;
        window.push_back(timestamp);
        let cutoff = timestamp - window_s;
        while window.front().is_some_and(|&t| t < cutoff) {
            window.pop_front();
        }
        window.len() as f64 / window_s
    }

    /// Decide whether to display a frame. The snapshot provides the
    /// highlight baseline; suppression compares against the last displayed
    /// frame; filtering only kicks in above the rate threshold.
    pub fn evaluate(&mut self, frame: &Frame) -> DiffDecision {
        let key = self.key_for(frame);

        // last_seen is tracked even while disabled so a snapshot can be
        // taken at any time.
        let is_new_key = !self.keys.contains_key(&key);
        if is_new_key {
            self.keys.insert(
                key.clone(),
                KeyState {
                    last_seen: frame.clone(),
                    snapshot: frame.clone(),
                    last_displayed: None,
                    last_displayed_ts: 0.0,
                    window: VecDeque::new(),
                    stats: KeyStats::default(),
                },
            );
        } else {
            let state = self.keys.get_mut(&key).expect("key present");
            state.last_seen = frame.clone();
        }

        if !self.config.enabled {
            return DiffDecision {
                display: true,
                key,
                rate: 0.0,
                bytes_changed_vs_last_displayed: 0,
                bytes_changed_vs_snapshot: 0,
                changed_indices_vs_snapshot: Vec::new(),
                reason: DecisionReason::Disabled,
            };
        }

        self.total_received += 1;

        let window_ms = self.config.time_window_ms;
        let min_rate = self.config.min_message_rate;
        let min_bytes = self.config.min_bytes_changed;
        let max_suppress_ms = self.config.max_suppress_ms;
        let mode = self.config.mode;

        // Compute deltas against copies of the baselines, then decide.
        let (rate, snapshot_frame, last_displayed_frame, had_displayed, last_displayed_ts) = {
            let state = self.keys.get_mut(&key).expect("key present");
            state.stats.message_count += 1;
            state.stats.last_timestamp = frame.timestamp();
            let rate = Self::update_rate(&mut state.window, frame.timestamp(), window_ms);
            state.stats.message_rate = rate;
            (
                rate,
                state.snapshot.clone(),
                state.last_displayed.clone(),
                state.last_displayed.is_some(),
                state.last_displayed_ts,
            )
        };
        let (bytes_changed_snap, changed_idxs_snap) = self.bytes_changed(frame, &snapshot_frame);
        let bytes_changed_last = match &last_displayed_frame {
            Some(last) => self.bytes_changed(frame, last).0,
            None => bytes_changed_snap,
        };

        let reason = if mode == DiffMode::Highlight {
            DecisionReason::Highlight
        } else if !had_displayed {
            DecisionReason::First
        } else if rate < min_rate {
            DecisionReason::LowRate
        } else if bytes_changed_last >= min_bytes {
            DecisionReason::Delta
        } else if max_suppress_ms > 0
            && (frame.timestamp() - last_displayed_ts) * 1000.0 >= max_suppress_ms as f64
        {
            DecisionReason::Heartbeat
        } else {
            DecisionReason::Suppressed
        };

        let display = reason != DecisionReason::Suppressed;
        let state = self.keys.get_mut(&key).expect("key present");
        if display {
            state.last_displayed = Some(frame.clone());
            state.last_displayed_ts = frame.timestamp();
            state.stats.display_count += 1;
            self.total_displayed += 1;
            if reason == DecisionReason::Delta {
                state.stats.bytes_changed_count += 1;
                state.stats.total_bytes_changed += bytes_changed_last as u64;
            }
        } else {
            state.stats.hidden_count += 1;
            self.total_hidden += 1;
        }

        DiffDecision {
            display,
            key,
            rate,
            bytes_changed_vs_last_displayed: bytes_changed_last,
            bytes_changed_vs_snapshot: bytes_changed_snap,
            changed_indices_vs_snapshot: changed_idxs_snap,
            reason,
        }
    }

    /// Rebaseline the snapshot from `last_seen`, for all keys or a subset.
    pub fn take_snapshot(&mut self, keys: Option<&[DiffKey]>) {
        match keys {
            Some(keys) => {
                for key in keys {
                    if let Some(state) = self.keys.get_mut(key) {
                        state.snapshot = state.last_seen.clone();
                    }
                }
                info!(keys = keys.len(), "diff snapshot captured");
            }
            None => {
                let count = self.keys.len();
                for state in self.keys.values_mut() {
                    state.snapshot = state.last_seen.clone();
                }
                info!(keys = count, "diff snapshot captured");
            }
        }
    }

    /// Copy of the last seen frame per key.
    pub fn last_seen(&self) -> HashMap<DiffKey, Frame> {
        self.keys
            .iter()
            .map(|(k, s)| (k.clone(), s.last_seen.clone()))
            .collect()
    }

    /// Hex rendering with changed bytes wrapped in brackets.
    pub fn format_data_with_delta(frame: &Frame, changed_indices: &[usize]) -> String {
        let changed: HashSet<usize> = changed_indices.iter().copied().collect();
        frame
            .data()
            .iter()
            .enumerate()
            .map(|(i, b)| {
                if changed.contains(&i) {
                    format!("[{b:02X}]")
                } else {
                    format!("{b:02X}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn stats(&self) -> DiffStats {
        DiffStats {
            total_received: self.total_received,
            total_displayed: self.total_displayed,
            total_hidden: self.total_hidden,
            unique_keys: self.keys.len(),
        }
    }

    pub fn key_stats(&self, key: &DiffKey) -> Option<KeyStats> {
        self.keys.get(key).map(|s| s.stats.clone())
    }

    /// Drop all key state and counters.
    pub fn reset(&mut self) {
        self.keys.clear();
        self.total_received = 0;
        self.total_displayed = 0;
        self.total_hidden = 0;
        info!("diff engine reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(ts: f64, can_id: u32, data: Vec<u8>) -> Frame {
        Frame::new(ts, can_id, data, false, "CAN1").unwrap()
    }

    fn enabled_config() -> DiffConfig {
        DiffConfig { enabled: true, ..Default::default() }
    }

    #[test]
    fn test_first_sight_always_displays() {
        let mut engine = DiffEngine::new(enabled_config());
        let decision = engine.evaluate(&frame_at(0.0, 0x123, vec![1, 2, 3]));
        assert!(decision.display);
        assert_eq!(decision.reason, DecisionReason::First);
    }

    #[test]
    fn test_disabled_passes_everything() {
        let mut engine = DiffEngine::new(DiffConfig::default());
        for i in 0..10 {
            let decision = engine.evaluate(&frame_at(i as f64 * 0.001, 0x1, vec![0]));
            assert!(decision.display);
            assert_eq!(decision.reason, DecisionReason::Disabled);
        }
        assert_eq!(engine.stats().total_received, 0);
    }

    #[test]
    fn test_low_rate_always_displays() {
        let mut engine = DiffEngine::new(enabled_config());
        // 2 Hz is far below the 10 msgs/s threshold.
        for i in 0..5 {
            let decision = engine.evaluate(&frame_at(i as f64 * 0.5, 0x1, vec![7]));
            assert!(decision.display);
        }
    }

    #[test]
    fn test_identical_burst_suppressed_with_heartbeat() {
        // Identical frame at 100 Hz, heartbeat every 1000 ms.
        let mut engine = DiffEngine::new(enabled_config());
        let mut displayed = Vec::new();
        for i in 0..150 {
            let ts = i as f64 * 0.01;
            let decision = engine.evaluate(&frame_at(ts, 0x123, vec![0xAA; 8]));
            if decision.display {
                displayed.push((ts, decision.reason));
            }
        }

        assert_eq!(displayed[0].1, DecisionReason::First);
        let heartbeats: Vec<_> = displayed
            .iter()
            .filter(|(_, r)| *r == DecisionReason::Heartbeat)
            .collect();
        assert_eq!(heartbeats.len(), 1, "one heartbeat inside 1.5 s: {displayed:?}");
        // Nothing besides the first frame, the rate-window warmup, and the
        // heartbeat gets through.
        assert!(
            displayed
                .iter()
                .all(|(_, r)| matches!(
                    r,
                    DecisionReason::First | DecisionReason::LowRate | DecisionReason::Heartbeat
                )),
            "{displayed:?}"
        );
        // Once the window is warm, suppression holds: everything after the
        // first 50 ms that is not the heartbeat is hidden.
        assert!(displayed.iter().filter(|(ts, _)| *ts > 0.05).count() <= 1);
    }

    #[test]
    fn test_heartbeat_disabled_when_zero() {
        let mut engine = DiffEngine::new(DiffConfig {
            max_suppress_ms: 0,
            ..enabled_config()
        });
        let mut shown_after_warmup = 0;
        for i in 0..300 {
            let ts = i as f64 * 0.01;
            let decision = engine.evaluate(&frame_at(ts, 0x123, vec![0xAA; 8]));
            if decision.display && ts > 0.05 {
                shown_after_warmup += 1;
            }
        }
        assert_eq!(shown_after_warmup, 0);
    }

    #[test]
    fn test_delta_breaks_suppression() {
        let mut engine = DiffEngine::new(enabled_config());
        let mut last_decision = None;
        for i in 0..60 {
            let ts = i as f64 * 0.01;
            let data = if i == 59 { vec![0xAA, 0xAA, 0xAA, 0xBB] } else { vec![0xAA; 4] };
            last_decision = Some(engine.evaluate(&frame_at(ts, 0x123, data)));
        }
        let decision = last_decision.unwrap();
        assert!(decision.display);
        assert_eq!(decision.reason, DecisionReason::Delta);
        assert_eq!(decision.bytes_changed_vs_last_displayed, 1);
    }

    #[test]
    fn test_byte_mask_ignores_unmasked_changes() {
        let mut engine = DiffEngine::new(DiffConfig {
            byte_mask: "0-1".to_string(),
            ..enabled_config()
        });
        // Warm the rate window with identical frames.
        for i in 0..60 {
            engine.evaluate(&frame_at(i as f64 * 0.01, 0x123, vec![1, 2, 3, 4]));
        }
        // Change only byte 3, which is outside the mask: stays suppressed.
        let decision = engine.evaluate(&frame_at(0.61, 0x123, vec![1, 2, 3, 9]));
        assert!(!decision.display);
        // Change byte 0, inside the mask: displayed.
        let decision = engine.evaluate(&frame_at(0.62, 0x123, vec![9, 2, 3, 9]));
        assert!(decision.display);
        assert_eq!(decision.reason, DecisionReason::Delta);
    }

    #[test]
    fn test_highlight_mode_always_displays_with_deltas() {
        let mut engine = DiffEngine::new(DiffConfig {
            mode: DiffMode::Highlight,
            ..enabled_config()
        });
        engine.evaluate(&frame_at(0.0, 0x123, vec![1, 2, 3]));
        for i in 1..100 {
            let decision = engine.evaluate(&frame_at(i as f64 * 0.01, 0x123, vec![1, 2, 9]));
            assert!(decision.display);
            assert_eq!(decision.reason, DecisionReason::Highlight);
            // Delta indices are relative to the snapshot baseline.
            assert_eq!(decision.changed_indices_vs_snapshot, vec![2]);
        }
    }

    #[test]
    fn test_snapshot_rebaselines_deltas() {
        let mut engine = DiffEngine::new(DiffConfig {
            mode: DiffMode::Highlight,
            ..enabled_config()
        });
        engine.evaluate(&frame_at(0.0, 0x123, vec![1, 2, 3]));
        let decision = engine.evaluate(&frame_at(0.1, 0x123, vec![1, 2, 9]));
        assert_eq!(decision.changed_indices_vs_snapshot, vec![2]);

        engine.take_snapshot(None);
        let decision = engine.evaluate(&frame_at(0.2, 0x123, vec![1, 2, 9]));
        assert!(decision.changed_indices_vs_snapshot.is_empty());
    }

    #[test]
    fn test_keying_by_channel() {
        let mut engine = DiffEngine::new(enabled_config());
        let a = Frame::new(0.0, 0x123, vec![1], false, "CAN1").unwrap();
        let b = Frame::new(0.01, 0x123, vec![1], false, "CAN2").unwrap();
        assert_eq!(engine.evaluate(&a).reason, DecisionReason::First);
        // Different channel is a different key, so it is also a first sight.
        assert_eq!(engine.evaluate(&b).reason, DecisionReason::First);
        assert_eq!(engine.stats().unique_keys, 2);
    }

    #[test]
    fn test_delta_format() {
        let frame = frame_at(0.0, 0x1, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(DiffEngine::format_data_with_delta(&frame, &[1]), "AA [BB] CC");
    }

    #[test]
    fn test_stats_accounting() {
        let mut engine = DiffEngine::new(enabled_config());
        for i in 0..100 {
            engine.evaluate(&frame_at(i as f64 * 0.01, 0x123, vec![0xAA; 8]));
        }
        let stats = engine.stats();
        assert_eq!(stats.total_received, 100);
        assert_eq!(stats.total_displayed + stats.total_hidden, 100);
        assert!(stats.hidden_percent() > 50.0);

        engine.reset();
        assert_eq!(engine.stats().total_received, 0);
        assert_eq!(engine.stats().unique_keys, 0);
    }
}
