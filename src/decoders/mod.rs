//! Protocol decoder capability interface and result model
//!
//! Decoders are concrete types behind the [`Decoder`] trait, owned by the
//! registry. A decoder holds nothing but its own reassembly scratch; results
//! flow to sinks and are never retained.

pub mod bap;
pub mod ftcan;
pub mod obd2;
pub mod registry;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::frame::Frame;

/// Dispatch order inside the registry; lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecoderPriority {
    Highest = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Lowest = 4,
}

/// Heterogeneous decoded value: a tagged sum instead of a dynamic type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Map(BTreeMap<String, DecodedValue>),
    List(Vec<DecodedValue>),
}

impl DecodedValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DecodedValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Float(v) => Some(*v),
            DecodedValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DecodedValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DecodedValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, DecodedValue>> {
        match self {
            DecodedValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DecodedValue]> {
        match self {
            DecodedValue::List(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for DecodedValue {
    fn from(v: &str) -> Self {
        DecodedValue::Str(v.to_string())
    }
}

impl From<String> for DecodedValue {
    fn from(v: String) -> Self {
        DecodedValue::Str(v)
    }
}

impl From<i64> for DecodedValue {
    fn from(v: i64) -> Self {
        DecodedValue::Int(v)
    }
}

impl From<u32> for DecodedValue {
    fn from(v: u32) -> Self {
        DecodedValue::Int(v as i64)
    }
}

impl From<f64> for DecodedValue {
    fn from(v: f64) -> Self {
        DecodedValue::Float(v)
    }
}

impl From<bool> for DecodedValue {
    fn from(v: bool) -> Self {
        DecodedValue::Bool(v)
    }
}

impl From<Vec<u8>> for DecodedValue {
    fn from(v: Vec<u8>) -> Self {
        DecodedValue::Bytes(v)
    }
}

/// Key/value payload of a decoded result.
pub type DecodedMap = BTreeMap<String, DecodedValue>;

/// One decoder's view of one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedResult {
    /// Protocol tag (e.g. "FTCAN 2.0", "OBD-II").
    pub protocol: &'static str,
    pub success: bool,
    /// Decoding confidence in `[0, 1]`.
    pub confidence: f64,
    /// Semantic decoded fields.
    pub data: DecodedMap,
    /// Free-form one-line description.
    pub description: String,
    /// Optional detailed sub-structure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<DecodedValue>,
}

impl DecodedResult {
    pub fn success(protocol: &'static str, confidence: f64, description: impl Into<String>) -> Self {
        Self {
            protocol,
            success: true,
            confidence,
            data: DecodedMap::new(),
            description: description.into(),
            detail: None,
        }
    }

    pub fn failure(protocol: &'static str, description: impl Into<String>) -> Self {
        Self {
            protocol,
            success: false,
            confidence: 0.0,
            data: DecodedMap::new(),
            description: description.into(),
            detail: None,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<DecodedValue>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_detail(mut self, detail: DecodedValue) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn get(&self, key: &str) -> Option<&DecodedValue> {
        self.data.get(key)
    }
}

/// Capability interface every protocol decoder implements.
///
/// `can_decode` must be cheap: it runs for every frame as a gate before
/// `decode`. `decode` may keep reassembly scratch between calls but must not
/// suspend or block.
pub trait Decoder: Send {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn priority(&self) -> DecoderPriority;

    fn can_decode(&self, can_id: u32, data: &[u8], is_extended: bool) -> bool;

    fn decode(&mut self, frame: &Frame) -> Option<DecodedResult>;

    /// Drop any reassembly scratch. Default: stateless, nothing to clear.
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoded_value_accessors() {
        assert_eq!(DecodedValue::Int(7).as_i64(), Some(7));
        assert_eq!(DecodedValue::Int(7).as_f64(), Some(7.0));
        assert_eq!(DecodedValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(DecodedValue::from("x").as_str(), Some("x"));
        assert_eq!(DecodedValue::Str("x".into()).as_i64(), None);
    }

    #[test]
    fn test_result_builder() {
        let result = DecodedResult::success("OBD-II", 0.9, "Engine RPM")
            .with("service", 1i64)
            .with("pid", 0x0Ci64);
        assert!(result.success);
        assert_eq!(result.get("pid").and_then(DecodedValue::as_i64), Some(0x0C));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(DecoderPriority::Highest < DecoderPriority::Normal);
        assert!(DecoderPriority::Normal < DecoderPriority::Lowest);
    }
}
