//! CAN frame model
//!
//! Frames are value objects: once constructed they are not mutated. The
//! gateway and bus manager derive new frames via the consuming `with_*`
//! methods instead of editing in place.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classic CAN payload limit.
pub const MAX_DLC: usize = 8;

/// Largest valid 11-bit identifier.
pub const STD_ID_MAX: u32 = 0x7FF;

/// Largest valid 29-bit identifier.
pub const EXT_ID_MAX: u32 = 0x1FFF_FFFF;

/// Frame construction and parsing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame bytes violate length, DLC, or hex grammar.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// What the gateway last did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayAction {
    #[default]
    None,
    Blocked,
    Modified,
    Forwarded,
    LoopPrevented,
}

impl GatewayAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayAction::None => "",
            GatewayAction::Blocked => "blocked",
            GatewayAction::Modified => "modified",
            GatewayAction::Forwarded => "forwarded",
            GatewayAction::LoopPrevented => "loop_prevented",
        }
    }
}

/// A single received or transmitted CAN frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    timestamp: f64,
    can_id: u32,
    dlc: u8,
    data: Vec<u8>,
    is_extended: bool,
    is_rtr: bool,
    source: String,
    comment: String,
    already_routed: bool,
    hop_count: u8,
    gateway_action: GatewayAction,
}

impl Frame {
    /// Build a data frame. Rejects payloads longer than 8 bytes and
    /// identifiers outside the 11-/29-bit range.
    pub fn new(
        timestamp: f64,
        can_id: u32,
        data: Vec<u8>,
        is_extended: bool,
        source: impl Into<String>,
    ) -> Result<Self, FrameError> {
        if data.len() > MAX_DLC {
            return Err(FrameError::MalformedFrame(format!(
                "payload of {} bytes exceeds DLC 8",
                data.len()
            )));
        }
        let id_max = if is_extended { EXT_ID_MAX } else { STD_ID_MAX };
        if can_id > id_max {
            return Err(FrameError::MalformedFrame(format!(
                "id 0x{can_id:X} out of range for {} identifier",
                if is_extended { "29-bit" } else { "11-bit" }
            )));
        }
        Ok(Self {
            timestamp,
            can_id,
            dlc: data.len() as u8,
            data,
            is_extended,
            is_rtr: false,
            source: source.into(),
            comment: String::new(),
            already_routed: false,
            hop_count: 0,
            gateway_action: GatewayAction::None,
        })
    }

    /// Build a remote-transmission-request frame. RTR frames carry a DLC but
    /// no payload on the wire; the stored data is zero-filled to keep
    /// `data.len() == dlc` everywhere.
    pub fn new_remote(
        timestamp: f64,
        can_id: u32,
        dlc: u8,
        is_extended: bool,
        source: impl Into<String>,
    ) -> Result<Self, FrameError> {
        let mut frame = Self::new(timestamp, can_id, vec![0; dlc as usize], is_extended, source)?;
        frame.is_rtr = true;
        Ok(frame)
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn can_id(&self) -> u32 {
        self.can_id
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    pub fn is_rtr(&self) -> bool {
        self.is_rtr
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn already_routed(&self) -> bool {
        self.already_routed
    }

    pub fn hop_count(&self) -> u8 {
        self.hop_count
    }

    pub fn gateway_action(&self) -> GatewayAction {
        self.gateway_action
    }

    /// Copy of this frame tagged with a new source bus name.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Copy of this frame with updated gateway provenance.
    pub fn with_gateway_action(mut self, action: GatewayAction) -> Self {
        self.gateway_action = action;
        self
    }

    /// Copy marked as routed once more (forwarded or modified copy).
    pub fn with_routed_hop(mut self, action: GatewayAction) -> Self {
        self.already_routed = true;
        self.hop_count = self.hop_count.saturating_add(1);
        self.gateway_action = action;
        self
    }

    /// Copy with a replaced identifier and payload (gateway modify path).
    /// The caller guarantees the new payload keeps the original DLC.
    pub(crate) fn with_replaced(mut self, can_id: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), self.dlc as usize);
        self.can_id = can_id;
        self.data = data;
        self
    }

    /// Data bytes as `AA BB CC` hex.
    pub fn to_hex_string(&self) -> String {
        self.data
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Printable bytes rendered literally, the rest as `.`.
    pub fn to_ascii(&self) -> String {
        self.data
            .iter()
            .map(|&b| if (0x20..=0x7E).contains(&b) { b as char } else { '.' })
            .collect()
    }

    /// Value of one bit of the payload; out-of-range indices read as zero.
    pub fn bit(&self, byte_index: usize, bit_index: u8) -> u8 {
        match self.data.get(byte_index) {
            Some(b) => (b >> (bit_index & 7)) & 1,
            None => 0,
        }
    }

    /// Canonical serialization record for capture files.
    pub fn to_record(&self) -> FrameRecord {
        FrameRecord {
            timestamp: self.timestamp,
            can_id: self.can_id,
            dlc: self.dlc,
            data: self.data.iter().map(|b| format!("{b:02x}")).collect(),
            is_extended: self.is_extended,
            is_rtr: self.is_rtr,
            source: self.source.clone(),
            comment: self.comment.clone(),
            period: 0,
            count: 0,
            gateway_processed: self.already_routed,
            gateway_action: self.gateway_action,
        }
    }

    /// Rebuild a frame from its serialization record.
    pub fn from_record(record: &FrameRecord) -> Result<Self, FrameError> {
        let data = decode_hex(&record.data)?;
        if data.len() != record.dlc as usize {
            return Err(FrameError::MalformedFrame(format!(
                "record dlc {} does not match {} data bytes",
                record.dlc,
                data.len()
            )));
        }
        let mut frame = if record.is_rtr {
            Self::new_remote(
                record.timestamp,
                record.can_id,
                record.dlc,
                record.is_extended,
                record.source.clone(),
            )?
        } else {
            Self::new(
                record.timestamp,
                record.can_id,
                data,
                record.is_extended,
                record.source.clone(),
            )?
        };
        frame.comment = record.comment.clone();
        frame.already_routed = record.gateway_processed;
        frame.gateway_action = record.gateway_action;
        Ok(frame)
    }
}

/// Wire-format record used in capture files: identical field set to the
/// capture `messages` entries, data as a lowercase hex string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub timestamp: f64,
    pub can_id: u32,
    pub dlc: u8,
    pub data: String,
    #[serde(default)]
    pub is_extended: bool,
    #[serde(default)]
    pub is_rtr: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub period: u32,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub gateway_processed: bool,
    #[serde(default)]
    pub gateway_action: GatewayAction,
}

fn decode_hex(s: &str) -> Result<Vec<u8>, FrameError> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if s.len() % 2 != 0 {
        return Err(FrameError::MalformedFrame(format!(
            "odd hex string length {}",
            s.len()
        )));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| FrameError::MalformedFrame(format!("bad hex near '{}'", &s[i..i + 2])))
        })
        .collect()
}

/// Software acceptance filter: a frame passes when `(id & mask)` matches the
/// filter pattern, or unconditionally while the filter is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFilter {
    pub filter_id: u32,
    pub mask: u32,
    #[serde(default)]
    pub is_extended: bool,
    #[serde(default)]
    pub enabled: bool,
}

impl CanFilter {
    pub fn matches(&self, can_id: u32) -> bool {
        if !self.enabled {
            return true;
        }
        (can_id & self.mask) == (self.filter_id & self.mask)
    }
}
