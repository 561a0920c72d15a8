//! FuelTech FTCAN 2.0 protocol decoder
//!
//! Decodes the 29-bit extended identifier layout, the segmented multi-frame
//! transport, and broadcast measure streams against the compiled-in measure
//! table. Expected link speed is 1 Mbps; the decoder does not enforce it.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::{DecodedMap, DecodedResult, DecodedValue, Decoder, DecoderPriority};
use crate::frame::Frame;

const PROTOCOL: &str = "FTCAN 2.0";

/// Single-packet marker in the first data byte.
const SEGMENT_SINGLE: u8 = 0xFF;

/// Reserved ECU product-type range accepted alongside the enumerated types.
const ECU_RANGE: std::ops::RangeInclusive<u16> = 0x0282..=0x02E4;

/// "Device searching" sentinel product type.
const DEVICE_SEARCHING: u16 = 0x0FFF;

/// Live reassembly keys kept before the oldest stream is evicted.
const MAX_LIVE_KEYS: usize = 4096;

/// Broadcast message ids that carry measure streams, high to low priority.
const BROADCAST_MESSAGE_IDS: [u16; 4] = [0x0FF, 0x1FF, 0x2FF, 0x3FF];

/// Data layout selector, bits 13..11 of the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFieldId {
    StandardCan,
    StandardCanBridge,
    Ftcan20,
    Ftcan20Bridge,
}

impl DataFieldId {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x00 => Some(DataFieldId::StandardCan),
            0x01 => Some(DataFieldId::StandardCanBridge),
            0x02 => Some(DataFieldId::Ftcan20),
            0x03 => Some(DataFieldId::Ftcan20Bridge),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataFieldId::StandardCan => "STANDARD_CAN",
            DataFieldId::StandardCanBridge => "STANDARD_CAN_BRIDGE",
            DataFieldId::Ftcan20 => "FTCAN_2_0",
            DataFieldId::Ftcan20Bridge => "FTCAN_2_0_BRIDGE",
        }
    }

    fn is_ftcan20(&self) -> bool {
        matches!(self, DataFieldId::Ftcan20 | DataFieldId::Ftcan20Bridge)
    }
}

/// Known FuelTech device classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductType {
    DeviceSearching,
    GearController,
    KnockMeter,
    BoostController2,
    InjectorDriver,
    InputExpander,
    Wbo2Nano,
    Wbo2Slim,
    AlcoholO2,
    FtSparkA,
    SwitchPad8,
    Ft500Ecu,
    Ft600Ecu,
}

impl ProductType {
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x0FFF => Some(ProductType::DeviceSearching),
            0x0140 => Some(ProductType::GearController),
            0x0141 => Some(ProductType::KnockMeter),
            0x0142 => Some(ProductType::BoostController2),
            0x0150 => Some(ProductType::InjectorDriver),
            0x023F => Some(ProductType::InputExpander),
            0x0240 => Some(ProductType::Wbo2Nano),
            0x0241 => Some(ProductType::Wbo2Slim),
            0x0242 => Some(ProductType::AlcoholO2),
            0x0243 => Some(ProductType::FtSparkA),
            0x0244 => Some(ProductType::SwitchPad8),
            0x0280 => Some(ProductType::Ft500Ecu),
            0x0281 => Some(ProductType::Ft600Ecu),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProductType::DeviceSearching => "DEVICE_SEARCHING",
            ProductType::GearController => "GEAR_CONTROLLER",
            ProductType::KnockMeter => "KNOCK_METER",
            ProductType::BoostController2 => "BOOST_CONTROLLER_2",
            ProductType::InjectorDriver => "INJECTOR_DRIVER",
            ProductType::InputExpander => "INPUT_EXPANDER",
            ProductType::Wbo2Nano => "WBO2_NANO",
            ProductType::Wbo2Slim => "WBO2_SLIM",
            ProductType::AlcoholO2 => "ALCOHOL_O2",
            ProductType::FtSparkA => "FTSPARK_A",
            ProductType::SwitchPad8 => "SWITCHPAD_8",
            ProductType::Ft500Ecu => "FT500_ECU",
            ProductType::Ft600Ecu => "FT600_ECU",
        }
    }
}

struct MeasureInfo {
    name: &'static str,
    unit: &'static str,
    multiplier: f64,
}

/// Main sensor measure table keyed by data id.
static MEASURE_IDS: Lazy<HashMap<u16, MeasureInfo>> = Lazy::new(|| {
    let mut m = HashMap::new();
    let mut put = |id: u16, name: &'static str, unit: &'static str, multiplier: f64| {
        m.insert(id, MeasureInfo { name, unit, multiplier });
    };
    put(0x0000, "Unknown", "", 1.0);
    put(0x0001, "TPS", "%", 0.1);
    put(0x0002, "MAP", "Bar", 0.001);
    put(0x0003, "Air Temperature", "\u{b0}C", 0.1);
    put(0x0004, "Engine Temperature", "\u{b0}C", 0.1);
    put(0x0005, "Oil Pressure", "Bar", 0.001);
    put(0x0006, "Fuel Pressure", "Bar", 0.001);
    put(0x0007, "Water Pressure", "Bar", 0.001);
    put(0x0008, "ECU Launch Mode", "", 1.0);
    put(0x0009, "ECU Battery Voltage", "V", 0.01);
    put(0x000A, "Traction Speed", "Km/h", 1.0);
    put(0x000B, "Drag Speed", "Km/h", 1.0);
    put(0x0011, "Gear", "", 1.0);
    put(0x0012, "Disabled O2", "\u{3bb}", 0.001);
    put(0x0013, "Cylinder 1 O2", "\u{3bb}", 0.001);
    put(0x0014, "Cylinder 2 O2", "\u{3bb}", 0.001);
    put(0x0015, "Cylinder 3 O2", "\u{3bb}", 0.001);
    put(0x0016, "Cylinder 4 O2", "\u{3bb}", 0.001);
    put(0x0017, "Cylinder 5 O2", "\u{3bb}", 0.001);
    put(0x0018, "Cylinder 6 O2", "\u{3bb}", 0.001);
    put(0x0019, "Cylinder 7 O2", "\u{3bb}", 0.001);
    put(0x001A, "Cylinder 8 O2", "\u{3bb}", 0.001);
    put(0x0025, "Left Bank O2", "\u{3bb}", 0.001);
    put(0x0026, "Right Bank O2", "\u{3bb}", 0.001);
    put(0x0027, "Exhaust O2", "\u{3bb}", 0.001);
    put(0x0042, "ECU RPM", "RPM", 1.0);
    put(0x0043, "ECU Injection Bank A Time", "ms", 0.01);
    put(0x0044, "ECU Injection Bank B Time", "ms", 0.01);
    put(0x0045, "ECU Injection Bank A Duty Cycle", "%", 0.1);
    put(0x0046, "ECU Injection Bank B Duty Cycle", "%", 0.1);
    put(0x0047, "ECU Ignition Advance/Retard", "\u{b0}", 0.1);
    m
});

/// Decoded 29-bit FTCAN identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtcanId {
    /// Bits 28..14.
    pub product_id: u16,
    /// Bits 13..11.
    pub data_field_bits: u8,
    /// Bits 10..0.
    pub message_id: u16,
    /// Bits 14..5 of the product id.
    pub product_type_id: u16,
    /// Bits 4..0 of the product id.
    pub unique_id: u8,
    /// Bit 10 of the message id.
    pub is_response: bool,
}

impl FtcanId {
    pub fn from_can_id(can_id: u32) -> Self {
        let product_id = ((can_id >> 14) & 0x7FFF) as u16;
        let data_field_bits = ((can_id >> 11) & 0x07) as u8;
        let message_id = (can_id & 0x7FF) as u16;
        Self {
            product_id,
            data_field_bits,
            message_id,
            product_type_id: (product_id >> 5) & 0x3FF,
            unique_id: (product_id & 0x1F) as u8,
            is_response: (message_id >> 10) & 1 == 1,
        }
    }

    pub fn product_name(&self) -> String {
        match ProductType::from_id(self.product_type_id) {
            Some(p) => p.name().to_string(),
            None => format!("Unknown_0x{:03X}", self.product_type_id),
        }
    }

    /// Product name with the unit's unique id appended.
    pub fn full_product_name(&self) -> String {
        format!("{} #{}", self.product_name(), self.unique_id)
    }
}

/// One decoded 4-byte measure: big-endian `u16` id then `i16` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measure {
    pub measure_id: u16,
    pub value: i16,
    /// Bits 15..1 of the measure id.
    pub data_id: u16,
    /// Bit 0 of the measure id.
    pub is_status: bool,
}

impl Measure {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let measure_id = u16::from_be_bytes([data[0], data[1]]);
        let value = i16::from_be_bytes([data[2], data[3]]);
        Some(Self {
            measure_id,
            value,
            data_id: (measure_id >> 1) & 0x7FFF,
            is_status: measure_id & 1 == 1,
        })
    }

    pub fn real_value(&self) -> f64 {
        let multiplier = MEASURE_IDS
            .get(&self.data_id)
            .map(|info| info.multiplier)
            .unwrap_or(1.0);
        self.value as f64 * multiplier
    }

    pub fn name(&self) -> String {
        match MEASURE_IDS.get(&self.data_id) {
            Some(info) => info.name.to_string(),
            None => format!("Unknown_0x{:04X}", self.data_id),
        }
    }

    pub fn unit(&self) -> &'static str {
        MEASURE_IDS.get(&self.data_id).map(|info| info.unit).unwrap_or("")
    }

    pub fn format(&self) -> String {
        let status = if self.is_status { " (Status)" } else { "" };
        format!("{}: {:.3} {}{}", self.name(), self.real_value(), self.unit(), status)
    }
}

/// One frame of the FTCAN 2.0 segmented transport.
#[derive(Debug, Clone, PartialEq)]
struct Segment {
    number: u8,
    /// Declared payload total, present only in segment 0 (low 11 bits of the
    /// 16-bit big-endian segmentation field).
    total_length: Option<u16>,
    payload: Vec<u8>,
}

impl Segment {
    fn from_data_field(data: &[u8]) -> Result<Self, &'static str> {
        let Some(&number) = data.first() else {
            return Err("empty data field");
        };
        match number {
            SEGMENT_SINGLE => Ok(Self {
                number,
                total_length: None,
                payload: data[1..].to_vec(),
            }),
            0x00 => {
                if data.len() < 3 {
                    return Err("incomplete first segment");
                }
                let total_length = u16::from_be_bytes([data[1], data[2]]) & 0x07FF;
                Ok(Self {
                    number: 0,
                    total_length: Some(total_length),
                    payload: data[3..].to_vec(),
                })
            }
            _ => Ok(Self {
                number,
                total_length: None,
                payload: data[1..].to_vec(),
            }),
        }
    }
}

struct SegmentBuffer {
    segments: Vec<Segment>,
    /// Insertion order for eviction when the key cap is reached.
    opened_seq: u64,
}

/// FTCAN 2.0 decoder with per-identifier segment reassembly.
pub struct FtcanDecoder {
    buffers: HashMap<u32, SegmentBuffer>,
    next_seq: u64,
}

impl Default for FtcanDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FtcanDecoder {
    pub fn new() -> Self {
        Self { buffers: HashMap::new(), next_seq: 0 }
    }

    /// Identifier gate: 29-bit range and a product type that is either
    /// enumerated, inside the reserved ECU range, or the searching sentinel.
    pub fn is_ftcan_id(can_id: u32) -> bool {
        if can_id > crate::frame::EXT_ID_MAX {
            return false;
        }
        let product_type_id = ((can_id >> 19) & 0x3FF) as u16;
        ProductType::from_id(product_type_id).is_some()
            || ECU_RANGE.contains(&product_type_id)
            || product_type_id == DEVICE_SEARCHING
    }

    /// Number of identifiers with live reassembly state.
    pub fn live_keys(&self) -> usize {
        self.buffers.len()
    }

    fn identification_value(ident: &FtcanId, data_field: DataFieldId) -> DecodedValue {
        let mut map = DecodedMap::new();
        map.insert("product_id".into(), format!("0x{:04X}", ident.product_id).into());
        map.insert("product_name".into(), ident.full_product_name().into());
        map.insert(
            "product_type_id".into(),
            format!("0x{:03X}", ident.product_type_id).into(),
        );
        map.insert("unique_id".into(), (ident.unique_id as i64).into());
        map.insert("data_field".into(), data_field.name().into());
        map.insert("message_id".into(), format!("0x{:03X}", ident.message_id).into());
        map.insert("is_response".into(), ident.is_response.into());
        DecodedValue::Map(map)
    }

    fn measures_value(payload: &[u8]) -> (Vec<Measure>, DecodedValue) {
        let mut measures = Vec::new();
        let mut items = Vec::new();
        let mut offset = 0;
        // Trailing bytes shorter than one measure are ignored, not an error.
        while payload.len() - offset >= 4 {
            let measure = Measure::from_bytes(&payload[offset..]).expect("length checked");
            let mut map = DecodedMap::new();
            map.insert("measure_id".into(), format!("0x{:04X}", measure.measure_id).into());
            map.insert("data_id".into(), format!("0x{:04X}", measure.data_id).into());
            map.insert("name".into(), measure.name().into());
            map.insert("raw_value".into(), (measure.value as i64).into());
            map.insert("real_value".into(), measure.real_value().into());
            map.insert("unit".into(), measure.unit().into());
            map.insert("is_status".into(), measure.is_status.into());
            map.insert("formatted".into(), measure.format().into());
            items.push(DecodedValue::Map(map));
            measures.push(measure);
            offset += 4;
        }
        (measures, DecodedValue::List(items))
    }

    fn push_segment(&mut self, can_id: u32, segment: Segment) {
        if !self.buffers.contains_key(&can_id) && self.buffers.len() >= MAX_LIVE_KEYS {
            if let Some(&oldest) = self
                .buffers
                .iter()
                .min_by_key(|(_, b)| b.opened_seq)
                .map(|(id, _)| id)
            {
                self.buffers.remove(&oldest);
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.buffers
            .entry(can_id)
            .or_insert_with(|| SegmentBuffer { segments: Vec::new(), opened_seq: seq })
            .segments
            .push(segment);
    }

    /// Reassemble if all segments `[0..N]` are present and the concatenation
    /// matches the declared total. The buffer persists otherwise.
    fn try_reassembly(&self, can_id: u32) -> Option<Vec<u8>> {
        let buffer = self.buffers.get(&can_id)?;
        let total_length = buffer
            .segments
            .iter()
            .find(|s| s.number == 0)?
            .total_length? as usize;

        let mut sorted: Vec<&Segment> = buffer.segments.iter().collect();
        sorted.sort_by_key(|s| s.number);
        for (expected, segment) in sorted.iter().enumerate() {
            if segment.number as usize != expected {
                return None;
            }
        }

        let payload: Vec<u8> = sorted.iter().flat_map(|s| s.payload.iter().copied()).collect();
        (payload.len() == total_length).then_some(payload)
    }

    fn decode_standard(&self, ident: &FtcanId, data_field: DataFieldId, frame: &Frame) -> DecodedResult {
        let mut result = DecodedResult::success(PROTOCOL, 1.0, String::new())
            .with("identification", Self::identification_value(ident, data_field))
            .with("payload", hex(frame.data()))
            .with("is_complete", true);

        let mut measure_names = Vec::new();
        if BROADCAST_MESSAGE_IDS.contains(&ident.message_id) {
            let (measures, value) = Self::measures_value(frame.data());
            measure_names = measures.iter().map(Measure::name).collect();
            result = result.with("measures", value);
        }
        result.description = describe(ident, &measure_names);
        result
    }

    fn decode_ftcan20(&mut self, ident: &FtcanId, data_field: DataFieldId, frame: &Frame) -> DecodedResult {
        let segment = match Segment::from_data_field(frame.data()) {
            Ok(segment) => segment,
            Err(reason) => return DecodedResult::failure(PROTOCOL, format!("Error: {reason}")),
        };

        if segment.number == SEGMENT_SINGLE {
            let mut result = DecodedResult::success(PROTOCOL, 1.0, String::new())
                .with("identification", Self::identification_value(ident, data_field))
                .with("payload", hex(&segment.payload))
                .with("is_complete", true);
            let mut measure_names = Vec::new();
            if BROADCAST_MESSAGE_IDS.contains(&ident.message_id) {
                let (measures, value) = Self::measures_value(&segment.payload);
                measure_names = measures.iter().map(Measure::name).collect();
                result = result.with("measures", value);
            }
            result.description = describe(ident, &measure_names);
            return result;
        }

        let segment_number = segment.number;
        let total_length = segment.total_length;
        let payload_hex = hex(&segment.payload);
        let is_first = segment_number == 0;
        self.push_segment(frame.can_id(), segment);

        let reassembled = if is_first { None } else { self.try_reassembly(frame.can_id()) };

        let mut result = DecodedResult::success(PROTOCOL, 0.5, String::new())
            .with("identification", Self::identification_value(ident, data_field))
            .with("segment_number", segment_number as i64)
            .with("payload", payload_hex)
            .with("is_complete", false);
        if let Some(total) = total_length {
            result = result.with("total_length", total as i64);
        }

        if let Some(payload) = reassembled {
            self.buffers.remove(&frame.can_id());
            let (measures, value) = Self::measures_value(&payload);
            let measure_names: Vec<String> = measures.iter().map(Measure::name).collect();
            result.confidence = 1.0;
            result = result
                .with("payload", hex(&payload))
                .with("is_complete", true)
                .with("measures", value);
            result.description = describe(ident, &measure_names);
        } else {
            result.description = describe(ident, &[]);
        }
        result
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn describe(ident: &FtcanId, measure_names: &[String]) -> String {
    let mut description = ident.full_product_name();
    if !measure_names.is_empty() {
        description.push_str(&format!(" ({} measures)", measure_names.len()));
        let head: Vec<&str> = measure_names.iter().take(3).map(String::as_str).collect();
        description.push_str(": ");
        description.push_str(&head.join(", "));
    }
    description
}

impl Decoder for FtcanDecoder {
    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn description(&self) -> &'static str {
        "FuelTech CAN protocol - ECUs, WB-O2 Nano, sensors (1 Mbps)"
    }

    fn priority(&self) -> DecoderPriority {
        DecoderPriority::High
    }

    fn can_decode(&self, can_id: u32, _data: &[u8], is_extended: bool) -> bool {
        is_extended && Self::is_ftcan_id(can_id)
    }

    fn decode(&mut self, frame: &Frame) -> Option<DecodedResult> {
        let ident = FtcanId::from_can_id(frame.can_id());
        let data_field = DataFieldId::from_bits(ident.data_field_bits)?;

        let result = if data_field.is_ftcan20() {
            self.decode_ftcan20(&ident, data_field, frame)
        } else {
            self.decode_standard(&ident, data_field, frame)
        };
        Some(result)
    }

    fn reset(&mut self) {
        self.buffers.clear();
    }
}
