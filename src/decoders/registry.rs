//! Priority-ordered decoder dispatch with per-decoder statistics

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;
use tracing::warn;

use super::{DecodedResult, Decoder};
use crate::frame::Frame;

/// Raw per-decoder counters. Derived rates are computed on read.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DecoderStats {
    pub decoded: u64,
    pub failed: u64,
    pub total_confidence: f64,
}

impl DecoderStats {
    pub fn total(&self) -> u64 {
        self.decoded + self.failed
    }

    /// Percentage of attempts that produced a successful result.
    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.decoded as f64 / total as f64 * 100.0
        }
    }

    pub fn avg_confidence(&self) -> f64 {
        if self.decoded == 0 {
            0.0
        } else {
            self.total_confidence / self.decoded as f64
        }
    }
}

struct Entry {
    decoder: Box<dyn Decoder>,
    enabled: bool,
}

/// Owns all registered decoders, sorted by priority. Decoders hold no
/// back-reference; statistics live here keyed by decoder name.
#[derive(Default)]
pub struct DecoderRegistry {
    entries: Vec<Entry>,
    stats: HashMap<&'static str, DecoderStats>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a decoder, keeping the list sorted by priority (stable for
    /// equal priorities: first registered runs first).
    pub fn register(&mut self, decoder: Box<dyn Decoder>) {
        self.stats.insert(decoder.name(), DecoderStats::default());
        self.entries.push(Entry { decoder, enabled: true });
        self.entries.sort_by_key(|e| e.decoder.priority());
    }

    pub fn unregister(&mut self, name: &str) {
        self.entries.retain(|e| e.decoder.name() != name);
        self.stats.remove(name);
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.decoder.name() == name) {
            entry.enabled = enabled;
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.decoder.name() == name && e.enabled)
    }

    pub fn decoder_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.decoder.name()).collect()
    }

    /// Run every enabled decoder over the frame and collect positive results
    /// in priority order. A decoder that returns nothing, fails, or panics is
    /// counted as `failed` and never aborts the loop. An empty result list
    /// means no protocol claimed the frame; that is not an error.
    pub fn decode(&mut self, frame: &Frame) -> Vec<DecodedResult> {
        let mut results = Vec::new();

        for entry in &mut self.entries {
            if !entry.enabled {
                continue;
            }
            if !entry
                .decoder
                .can_decode(frame.can_id(), frame.data(), frame.is_extended())
            {
                continue;
            }

            let name = entry.decoder.name();
            let decoder = &mut entry.decoder;
            let outcome = catch_unwind(AssertUnwindSafe(|| decoder.decode(frame)));
            let stats = self.stats.entry(name).or_default();

            match outcome {
                Ok(Some(decoded)) if decoded.success => {
                    stats.decoded += 1;
                    stats.total_confidence += decoded.confidence;
                    results.push(decoded);
                }
                Ok(_) => {
                    stats.failed += 1;
                }
                Err(_) => {
                    stats.failed += 1;
                    warn!(decoder = name, id = frame.can_id(), "decoder panicked, counted as failed");
                }
            }
        }

        results
    }

    /// Snapshot of the statistics table.
    pub fn stats(&self) -> HashMap<&'static str, DecoderStats> {
        self.stats.clone()
    }

    pub fn stats_for(&self, name: &str) -> Option<DecoderStats> {
        self.stats.get(name).copied()
    }

    pub fn reset_stats(&mut self) {
        for stats in self.stats.values_mut() {
            *stats = DecoderStats::default();
        }
    }

    /// Drop all decoder reassembly scratch.
    pub fn reset_decoders(&mut self) {
        for entry in &mut self.entries {
            entry.decoder.reset();
        }
    }
}
