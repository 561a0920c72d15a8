//! Observer surface exposed to the shell
//!
//! Push-only and best-effort: callbacks must return quickly and never
//! back-pressure the pipeline. The shell wires its own implementation; the
//! crate ships a tracing-backed one and a no-op.

use tracing::{debug, info};

use crate::decoders::DecodedResult;
use crate::diff::DiffDecision;
use crate::frame::Frame;

/// Sink for everything the core wants to show.
pub trait Observer: Send + Sync {
    /// A frame cleared for display (gateway display blocks already applied).
    fn on_frame(&self, _frame: &Frame) {}

    /// Decoder results for a displayed frame. An empty list means no
    /// protocol claimed the frame.
    fn on_decoded(&self, _frame: &Frame, _results: &[DecodedResult]) {}

    /// Diff engine verdict for a displayed frame.
    fn on_diff_decision(&self, _decision: &DiffDecision) {}

    /// Transient user-facing notification.
    fn notify(&self, _text: &str, _duration_ms: u64) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// Observer that logs through `tracing`, useful headless and in tests.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_frame(&self, frame: &Frame) {
        debug!(
            id = %format!("0x{:X}", frame.can_id()),
            source = frame.source(),
            dlc = frame.dlc(),
            data = %frame.to_hex_string(),
            action = frame.gateway_action().as_str(),
            "frame"
        );
    }

    fn on_decoded(&self, frame: &Frame, results: &[DecodedResult]) {
        for result in results {
            debug!(
                id = %format!("0x{:X}", frame.can_id()),
                protocol = result.protocol,
                confidence = result.confidence,
                "{}",
                result.description
            );
        }
    }

    fn on_diff_decision(&self, decision: &DiffDecision) {
        if !decision.display {
            return;
        }
        debug!(
            id = %format!("0x{:X}", decision.key.can_id),
            rate = decision.rate,
            reason = ?decision.reason,
            "diff"
        );
    }

    fn notify(&self, text: &str, duration_ms: u64) {
        info!(duration_ms, "{text}");
    }
}
