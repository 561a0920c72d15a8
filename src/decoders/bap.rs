//! VW/Audi BAP (Bedien- und Anzeigeprotokoll) detector and reassembler
//!
//! Multi-frame streams use a start preamble (`0x80`) carrying the declared
//! payload length and continuation preambles (`0xC0`) carrying chunks. One
//! stream is active per `(can_id, extended, mf_channel)` key; a new start
//! supersedes the previous stream on that key. PQ (11-bit) frames expose the
//! opcode/lsg/fct header, MQB (29-bit) frames expose the lsg embedded in the
//! identifier.

use std::collections::HashMap;

use tracing::debug;

use super::{DecodedMap, DecodedResult, DecodedValue, Decoder, DecoderPriority};
use crate::frame::Frame;

const PROTOCOL: &str = "VAG BAP";

/// Multi-frame preamble mask and values in byte 0.
const PREAMBLE_MASK: u8 = 0xC0;
const PREAMBLE_START: u8 = 0x80;
const PREAMBLE_CONT: u8 = 0xC0;

/// Multi-frame slicing offsets. The MQB rule is empirical (best-effort):
/// start frames contribute payload from byte 4, continuations from byte 1.
const START_PAYLOAD_OFFSET: usize = 4;
const CONT_PAYLOAD_OFFSET: usize = 1;

/// Live reassembly streams kept before the oldest is evicted.
const MAX_LIVE_STREAMS: usize = 4096;

/// Confidence for a completed conservative multi-frame reassembly.
const COMPLETE_CONFIDENCE: f64 = 0.95;

/// Detection strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionMode {
    /// Emit only completed multi-frame payloads.
    #[default]
    Conservative,
    /// Also emit plausible single-frame candidates at low confidence.
    Aggressive,
}

/// PQ platform header: opcode(3) | lsg(6) | fct(6) packed big-endian into
/// two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PqHeader {
    pub opcode: u8,
    pub lsg: u8,
    pub fct: u8,
}

impl PqHeader {
    pub fn from_bytes(b0: u8, b1: u8) -> Self {
        Self {
            opcode: (b0 >> 4) & 0x07,
            lsg: ((b0 & 0x0F) << 2) | (b1 >> 6),
            fct: b1 & 0x3F,
        }
    }
}

/// MQB platform addressing carried in the 29-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MqbAddress {
    pub base_id: u16,
    pub lsg: u8,
    pub subsystem: u8,
}

impl MqbAddress {
    pub fn from_can_id(can_id: u32) -> Self {
        Self {
            base_id: (can_id >> 16) as u16,
            lsg: ((can_id >> 8) & 0xFF) as u8,
            subsystem: (can_id & 0xFF) as u8,
        }
    }

    /// Display endpoints live below 0x10, functional endpoints at or above.
    pub fn endpoint(&self) -> &'static str {
        if self.subsystem < 0x10 {
            "ASG"
        } else {
            "FSG"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StreamKey {
    can_id: u32,
    is_extended: bool,
    mf_channel: u8,
}

struct Stream {
    declared_total: usize,
    chunks: Vec<u8>,
    frames: u32,
    header: Option<PqHeader>,
    opened_seq: u64,
}

/// Stateful BAP reassembler.
pub struct BapDecoder {
    mode: DetectionMode,
    streams: HashMap<StreamKey, Stream>,
    next_seq: u64,
}

impl Default for BapDecoder {
    fn default() -> Self {
        Self::new(DetectionMode::Conservative)
    }
}

impl BapDecoder {
    pub fn new(mode: DetectionMode) -> Self {
        Self { mode, streams: HashMap::new(), next_seq: 0 }
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DetectionMode) {
        self.mode = mode;
    }

    pub fn mf_channel(byte0: u8) -> u8 {
        (byte0 >> 4) & 0x03
    }

    /// True while a start without completion is pending on the key.
    pub fn has_active_stream(&self, can_id: u32, is_extended: bool, mf_channel: u8) -> bool {
        self.streams
            .contains_key(&StreamKey { can_id, is_extended, mf_channel })
    }

    pub fn live_streams(&self) -> usize {
        self.streams.len()
    }

    fn evict_if_full(&mut self, key: &StreamKey) {
        if !self.streams.contains_key(key) && self.streams.len() >= MAX_LIVE_STREAMS {
            if let Some(&oldest) = self
                .streams
                .iter()
                .min_by_key(|(_, s)| s.opened_seq)
                .map(|(k, _)| k)
            {
                self.streams.remove(&oldest);
            }
        }
    }

    fn platform_fields(&self, frame: &Frame, result: DecodedResult, header: Option<PqHeader>) -> DecodedResult {
        if frame.is_extended() {
            let mqb = MqbAddress::from_can_id(frame.can_id());
            let mut map = DecodedMap::new();
            map.insert("base_id".into(), format!("0x{:04X}", mqb.base_id).into());
            map.insert("lsg".into(), (mqb.lsg as i64).into());
            map.insert("subsystem".into(), (mqb.subsystem as i64).into());
            map.insert("endpoint".into(), mqb.endpoint().into());
            result.with("platform", "MQB").with("mqb", DecodedValue::Map(map))
        } else {
            let mut result = result.with("platform", "PQ");
            if let Some(header) = header {
                let mut map = DecodedMap::new();
                map.insert("opcode".into(), (header.opcode as i64).into());
                map.insert("lsg".into(), (header.lsg as i64).into());
                map.insert("fct".into(), (header.fct as i64).into());
                result = result.with("header", DecodedValue::Map(map));
            }
            result
        }
    }

    fn describe_complete(&self, frame: &Frame, header: Option<PqHeader>, total_len: usize) -> String {
        if frame.is_extended() {
            let mqb = MqbAddress::from_can_id(frame.can_id());
            format!("MQB lsg=0x{:02X} len={}", mqb.lsg, total_len)
        } else if let Some(h) = header {
            format!("PQ opcode={} lsg={} fct={} len={}", h.opcode, h.lsg, h.fct, total_len)
        } else {
            format!("PQ len={total_len}")
        }
    }

    fn on_start(&mut self, frame: &Frame, key: StreamKey) -> Option<DecodedResult> {
        let data = frame.data();
        let declared_total = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
        let header = (!frame.is_extended() && data.len() >= 4)
            .then(|| PqHeader::from_bytes(data[2], data[3]));

        // A new start supersedes exactly one prior stream on the key.
        let superseded = self.streams.remove(&key);

        self.evict_if_full(&key);
        let seq = self.next_seq;
        self.next_seq += 1;
        let chunk = data.get(START_PAYLOAD_OFFSET..).unwrap_or(&[]);
        let mut stream = Stream {
            declared_total,
            chunks: chunk.to_vec(),
            frames: 1,
            header,
            opened_seq: seq,
        };

        // A small declared total can complete on the start frame alone.
        if stream.declared_total > 0 && stream.chunks.len() == stream.declared_total {
            return Some(self.complete_result(frame, key, stream));
        }
        self.streams.insert(key, stream);

        if let Some(old) = superseded {
            let result = DecodedResult::success(
                PROTOCOL,
                0.5,
                format!(
                    "superseded stream on 0x{:X} mf{} ({} of {} bytes)",
                    key.can_id,
                    key.mf_channel,
                    old.chunks.len(),
                    old.declared_total
                ),
            )
            .with("kind", "superseded")
            .with("superseded", true)
            .with("mf_channel", key.mf_channel as i64)
            .with("partial_len", old.chunks.len() as i64)
            .with("declared_total", old.declared_total as i64);
            return Some(self.platform_fields(frame, result, old.header));
        }

        // Open, incomplete: absorbed silently.
        None
    }

    fn on_continuation(&mut self, frame: &Frame, key: StreamKey) -> Option<DecodedResult> {
        let Some(stream) = self.streams.get_mut(&key) else {
            // No active stream: drop.
            return None;
        };
        let chunk = frame.data().get(CONT_PAYLOAD_OFFSET..).unwrap_or(&[]);
        stream.chunks.extend_from_slice(chunk);
        stream.frames += 1;

        if stream.chunks.len() == stream.declared_total {
            let stream = self.streams.remove(&key).expect("stream present");
            return Some(self.complete_result(frame, key, stream));
        }
        if stream.chunks.len() > stream.declared_total {
            debug!(
                can_id = key.can_id,
                mf_channel = key.mf_channel,
                got = stream.chunks.len(),
                declared = stream.declared_total,
                "bap stream overran declared length, dropping"
            );
            self.streams.remove(&key);
        }
        None
    }

    fn complete_result(&self, frame: &Frame, key: StreamKey, stream: Stream) -> DecodedResult {
        let description = self.describe_complete(frame, stream.header, stream.declared_total);
        let payload: String = stream.chunks.iter().map(|b| format!("{b:02x}")).collect();
        let result = DecodedResult::success(PROTOCOL, COMPLETE_CONFIDENCE, description)
            .with("kind", "complete")
            .with("is_complete", true)
            .with("mf_channel", key.mf_channel as i64)
            .with("total_len", stream.declared_total as i64)
            .with("frames", stream.frames as i64)
            .with("payload", payload);
        self.platform_fields(frame, result, stream.header)
    }

    fn single_frame_candidate(&self, frame: &Frame) -> DecodedResult {
        let data = frame.data();
        let header = PqHeader::from_bytes(data[0], data[1]);
        let result = DecodedResult::success(
            PROTOCOL,
            0.4,
            format!(
                "single-frame candidate opcode={} lsg={} fct={}",
                header.opcode, header.lsg, header.fct
            ),
        )
        .with("kind", "single_frame_candidate")
        .with("is_complete", true)
        .with("payload", data[2..].iter().map(|b| format!("{b:02x}")).collect::<String>());
        self.platform_fields(frame, result, Some(header))
    }
}

impl Decoder for BapDecoder {
    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn description(&self) -> &'static str {
        "VW/Audi BAP protocol detector (PQ+MQB) - high confidence (multi-frame)"
    }

    fn priority(&self) -> DecoderPriority {
        // Keep out of the way; this is a detector.
        DecoderPriority::Low
    }

    fn can_decode(&self, can_id: u32, data: &[u8], is_extended: bool) -> bool {
        if data.len() < 2 {
            return false;
        }
        match data[0] & PREAMBLE_MASK {
            PREAMBLE_START => true,
            PREAMBLE_CONT => {
                // Continuations only count when a matching stream is open.
                self.has_active_stream(can_id, is_extended, Self::mf_channel(data[0]))
            }
            _ => self.mode == DetectionMode::Aggressive && !is_extended,
        }
    }

    fn decode(&mut self, frame: &Frame) -> Option<DecodedResult> {
        let data = frame.data();
        if data.len() < 2 {
            return None;
        }
        let key = StreamKey {
            can_id: frame.can_id(),
            is_extended: frame.is_extended(),
            mf_channel: Self::mf_channel(data[0]),
        };
        match data[0] & PREAMBLE_MASK {
            PREAMBLE_START => self.on_start(frame, key),
            PREAMBLE_CONT => self.on_continuation(frame, key),
            _ if self.mode == DetectionMode::Aggressive && !frame.is_extended() => {
                Some(self.single_frame_candidate(frame))
            }
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext_frame(can_id: u32, data: Vec<u8>) -> Frame {
        Frame::new(0.0, can_id, data, true, "CAN1").unwrap()
    }

    fn std_frame(can_id: u32, data: Vec<u8>) -> Frame {
        Frame::new(0.0, can_id, data, false, "CAN1").unwrap()
    }

    #[test]
    fn test_multi_frame_completion() {
        // Start declares 12 bytes, contributes 4; continuations add 7+1.
        let mut decoder = BapDecoder::default();
        let id = 0x1733_3310;

        let start = ext_frame(id, vec![0x80, 0x0C, 0x02, 0x45, 0xA1, 0xA2, 0xA3, 0xA4]);
        assert!(decoder.can_decode(id, start.data(), true));
        assert!(decoder.decode(&start).is_none());
        assert!(decoder.has_active_stream(id, true, 0));

        let cont1 = ext_frame(id, vec![0xC0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7]);
        assert!(decoder.can_decode(id, cont1.data(), true));
        assert!(decoder.decode(&cont1).is_none());

        let cont2 = ext_frame(id, vec![0xC1, 0xB8]);
        let result = decoder.decode(&cont2).unwrap();
        assert!(result.success);
        assert!((result.confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(result.get("is_complete").and_then(DecodedValue::as_bool), Some(true));
        assert_eq!(result.get("total_len").and_then(DecodedValue::as_i64), Some(12));
        assert_eq!(
            result.get("payload").and_then(DecodedValue::as_str),
            Some("a1a2a3a4b1b2b3b4b5b6b7b8")
        );
        assert!(!decoder.has_active_stream(id, true, 0));
    }

    #[test]
    fn test_completed_payload_matches_declared_total() {
        let mut decoder = BapDecoder::default();
        let id = 0x1733_3310;
        let _ = decoder.decode(&ext_frame(id, vec![0x80, 0x08, 0, 0, 1, 2, 3, 4]));
        let result = decoder
            .decode(&ext_frame(id, vec![0xC0, 5, 6, 7, 8]))
            .unwrap();
        let payload = result.get("payload").and_then(DecodedValue::as_str).unwrap();
        assert_eq!(payload.len() / 2, 8);
    }

    #[test]
    fn test_continuation_without_start_dropped() {
        let mut decoder = BapDecoder::default();
        let id = 0x1733_3310;
        let cont = ext_frame(id, vec![0xC0, 1, 2, 3]);
        assert!(!decoder.can_decode(id, cont.data(), true));
        assert!(decoder.decode(&cont).is_none());
        assert_eq!(decoder.live_streams(), 0);
    }

    #[test]
    fn test_new_start_supersedes_exactly_one() {
        let mut decoder = BapDecoder::default();
        let id = 0x1733_3310;

        assert!(decoder
            .decode(&ext_frame(id, vec![0x80, 0x20, 0, 0, 1, 2, 3, 4]))
            .is_none());

        let result = decoder
            .decode(&ext_frame(id, vec![0x80, 0x0C, 0, 0, 9, 9, 9, 9]))
            .unwrap();
        assert_eq!(result.get("kind").and_then(DecodedValue::as_str), Some("superseded"));
        assert_eq!(result.get("superseded").and_then(DecodedValue::as_bool), Some(true));
        assert_eq!(result.get("partial_len").and_then(DecodedValue::as_i64), Some(4));
        // Exactly one active stream remains: the new one.
        assert_eq!(decoder.live_streams(), 1);
    }

    #[test]
    fn test_mf_channel_isolation() {
        let mut decoder = BapDecoder::default();
        let id = 0x1733_3310;

        // Channel 0 start; channel 1 continuation must not append to it.
        let _ = decoder.decode(&ext_frame(id, vec![0x80, 0x0B, 0, 0, 1, 2, 3, 4]));
        assert!(decoder.has_active_stream(id, true, 0));
        assert!(!decoder.has_active_stream(id, true, 1));

        let cont_ch1 = ext_frame(id, vec![0xD0, 5, 6, 7, 8, 9, 0xA, 0xB]);
        assert_eq!(BapDecoder::mf_channel(0xD0), 1);
        assert!(decoder.decode(&cont_ch1).is_none());
        assert!(decoder.has_active_stream(id, true, 0));

        let result = decoder
            .decode(&ext_frame(id, vec![0xC0, 5, 6, 7, 8, 9, 0xA, 0xB]))
            .unwrap();
        assert_eq!(result.get("total_len").and_then(DecodedValue::as_i64), Some(11));
    }

    #[test]
    fn test_mqb_projection() {
        let mqb = MqbAddress::from_can_id(0x1733_3310);
        assert_eq!(mqb.base_id, 0x1733);
        assert_eq!(mqb.lsg, 0x33);
        assert_eq!(mqb.subsystem, 0x10);
        assert_eq!(mqb.endpoint(), "FSG");

        let asg = MqbAddress::from_can_id(0x1733_3305);
        assert_eq!(asg.endpoint(), "ASG");
    }

    #[test]
    fn test_pq_header_projection() {
        let mut decoder = BapDecoder::default();
        let id = 0x63F;

        let _ = decoder.decode(&std_frame(id, vec![0x80, 0x09, 0x45, 0x8E, 1, 2, 3, 4]));
        let result = decoder
            .decode(&std_frame(id, vec![0xC0, 5, 6, 7, 8, 9]))
            .unwrap();
        assert_eq!(result.get("platform").and_then(DecodedValue::as_str), Some("PQ"));
        let header = result.get("header").and_then(DecodedValue::as_map).unwrap();
        // 0x45 0x8E -> opcode 4, lsg ((0x5)<<2)|(0x8E>>6) = 0x16, fct 0x0E.
        assert_eq!(header["opcode"].as_i64(), Some(4));
        assert_eq!(header["lsg"].as_i64(), Some(0x16));
        assert_eq!(header["fct"].as_i64(), Some(0x0E));
    }

    #[test]
    fn test_conservative_ignores_plain_frames() {
        let decoder = BapDecoder::default();
        assert!(!decoder.can_decode(0x63F, &[0x12, 0x34, 0x56], false));
    }

    #[test]
    fn test_aggressive_single_frame_candidate() {
        let mut decoder = BapDecoder::new(DetectionMode::Aggressive);
        let frame = std_frame(0x63F, vec![0x12, 0x34, 0x56]);
        assert!(decoder.can_decode(0x63F, frame.data(), false));
        let result = decoder.decode(&frame).unwrap();
        assert_eq!(
            result.get("kind").and_then(DecodedValue::as_str),
            Some("single_frame_candidate")
        );
        assert!(result.confidence < 0.5);
    }

    #[test]
    fn test_overrun_drops_stream() {
        let mut decoder = BapDecoder::default();
        let id = 0x1733_3310;
        let _ = decoder.decode(&ext_frame(id, vec![0x80, 0x06, 0, 0, 1, 2, 3, 4]));
        // 4 + 7 bytes overruns the declared 6.
        assert!(decoder
            .decode(&ext_frame(id, vec![0xC0, 5, 6, 7, 8, 9, 10, 11]))
            .is_none());
        assert_eq!(decoder.live_streams(), 0);
    }

    #[test]
    fn test_reset_clears_streams() {
        let mut decoder = BapDecoder::default();
        let _ = decoder.decode(&ext_frame(0x1733_3310, vec![0x80, 0x20, 0, 0, 1, 2, 3, 4]));
        assert_eq!(decoder.live_streams(), 1);
        decoder.reset();
        assert_eq!(decoder.live_streams(), 0);
    }
}
