//! OBD-II decoder over ISO 15765-4 (ISO-TP on CAN), 11- and 29-bit
//!
//! Single frames are decoded down to service/PID values through the
//! compiled-in PID table. Multi-frame traffic is tagged at the PCI level
//! (first/consecutive/flow-control) without reassembling FF+CF into one
//! application payload.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::{DecodedResult, DecodedValue, Decoder, DecoderPriority};
use crate::frame::Frame;

const PROTOCOL: &str = "OBD-II";

/// Functional broadcast request id.
const OBD_BROADCAST_ID: u32 = 0x7DF;
const REQUEST_ID_RANGE: std::ops::RangeInclusive<u32> = 0x7E0..=0x7E7;
const RESPONSE_ID_RANGE: std::ops::RangeInclusive<u32> = 0x7E8..=0x7EF;

/// Value formula selector for service 0x01 PIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PidType {
    Bitfield,
    Dtc,
    Enum,
    Percent,
    TempOffset,
    Rpm,
    Direct,
    Timing,
    Uint16,
    Maf,
    FuelPressure,
    FuelRailRel,
    FuelRailAbs,
    Voltage,
    FuelRate,
    FuelTrim,
    O2Voltage,
    O2Lambda,
    O2LambdaCurrent,
    CommandedLambda,
    AbsoluteLoad,
    InjectionTiming,
    Torque,
    FuelType,
}

struct PidInfo {
    name: &'static str,
    #[allow(dead_code)]
    bytes: u8,
    unit: &'static str,
    kind: PidType,
}

/// Service 0x01 PID table (SAE J1979 current data).
static OBD2_PIDS: Lazy<HashMap<u8, PidInfo>> = Lazy::new(|| {
    use PidType::*;
    let mut m = HashMap::new();
    let mut put = |pid: u8, name: &'static str, bytes: u8, unit: &'static str, kind: PidType| {
        m.insert(pid, PidInfo { name, bytes, unit, kind });
    };

    // Supported-PID bitfields.
    put(0x00, "PIDs supported [01-20]", 4, "", Bitfield);
    put(0x20, "PIDs supported [21-40]", 4, "", Bitfield);
    put(0x40, "PIDs supported [41-60]", 4, "", Bitfield);
    put(0x60, "PIDs supported [61-80]", 4, "", Bitfield);
    put(0x80, "PIDs supported [81-A0]", 4, "", Bitfield);
    put(0xA0, "PIDs supported [A1-C0]", 4, "", Bitfield);
    put(0xC0, "PIDs supported [C1-E0]", 4, "", Bitfield);

    // Status and diagnostics.
    put(0x01, "Monitor status since DTCs cleared", 4, "", Bitfield);
    put(0x02, "DTC that caused freeze frame", 2, "", Dtc);
    put(0x03, "Fuel system status", 2, "", Enum);

    // Basic engine.
    put(0x04, "Calculated engine load", 1, "%", Percent);
    put(0x05, "Engine coolant temperature", 1, "\u{b0}C", TempOffset);
    put(0x0C, "Engine RPM", 2, "RPM", Rpm);
    put(0x0D, "Vehicle speed", 1, "km/h", Direct);
    put(0x0E, "Timing advance", 1, "\u{b0} before TDC", Timing);
    put(0x0F, "Intake air temperature", 1, "\u{b0}C", TempOffset);
    put(0x1F, "Run time since engine start", 2, "s", Uint16);

    // Air and fuel.
    put(0x10, "MAF air flow rate", 2, "g/s", Maf);
    put(0x11, "Throttle position", 1, "%", Percent);
    put(0x45, "Relative throttle position", 1, "%", Percent);
    put(0x47, "Absolute throttle position B", 1, "%", Percent);
    put(0x48, "Absolute throttle position C", 1, "%", Percent);
    put(0x49, "Accelerator pedal position D", 1, "%", Percent);
    put(0x4A, "Accelerator pedal position E", 1, "%", Percent);
    put(0x4B, "Accelerator pedal position F", 1, "%", Percent);
    put(0x4C, "Commanded throttle actuator", 1, "%", Percent);

    // Pressures.
    put(0x0A, "Fuel pressure (gauge)", 1, "kPa", FuelPressure);
    put(0x0B, "Intake manifold pressure", 1, "kPa", Direct);
    put(0x22, "Fuel rail pressure (relative)", 2, "kPa", FuelRailRel);
    put(0x23, "Fuel rail gauge pressure", 2, "kPa", FuelRailAbs);
    put(0x33, "Absolute barometric pressure", 1, "kPa", Direct);
    put(0x59, "Fuel rail absolute pressure", 2, "kPa", FuelRailAbs);

    // Temperatures.
    put(0x46, "Ambient air temperature", 1, "\u{b0}C", TempOffset);
    put(0x5C, "Engine oil temperature", 1, "\u{b0}C", TempOffset);

    // Fuel.
    put(0x2F, "Fuel tank level input", 1, "%", Percent);
    put(0x51, "Fuel type", 1, "", FuelType);
    put(0x52, "Ethanol fuel %", 1, "%", Percent);
    put(0x5E, "Engine fuel rate", 2, "L/h", FuelRate);

    // Lambda probes.
    put(0x14, "O2 Sensor 1 (Voltage + STFT)", 2, "V/%", O2Voltage);
    put(0x15, "O2 Sensor 2 (Voltage + STFT)", 2, "V/%", O2Voltage);
    put(0x16, "O2 Sensor 3 (Voltage + STFT)", 2, "V/%", O2Voltage);
    put(0x17, "O2 Sensor 4 (Voltage + STFT)", 2, "V/%", O2Voltage);
    put(0x24, "O2 Sensor 1 (Lambda + Voltage)", 4, "\u{3bb}/V", O2Lambda);
    put(0x25, "O2 Sensor 2 (Lambda + Voltage)", 4, "\u{3bb}/V", O2Lambda);
    put(0x26, "O2 Sensor 3 (Lambda + Voltage)", 4, "\u{3bb}/V", O2Lambda);
    put(0x27, "O2 Sensor 4 (Lambda + Voltage)", 4, "\u{3bb}/V", O2Lambda);
    put(0x34, "O2 Sensor 1 (Lambda + Current)", 4, "\u{3bb}/mA", O2LambdaCurrent);
    put(0x35, "O2 Sensor 2 (Lambda + Current)", 4, "\u{3bb}/mA", O2LambdaCurrent);
    put(0x44, "Commanded Air-Fuel Ratio", 2, "\u{3bb}", CommandedLambda);

    // Fuel trim.
    put(0x06, "Short term fuel trim - Bank 1", 1, "%", FuelTrim);
    put(0x07, "Long term fuel trim - Bank 1", 1, "%", FuelTrim);
    put(0x08, "Short term fuel trim - Bank 2", 1, "%", FuelTrim);
    put(0x09, "Long term fuel trim - Bank 2", 1, "%", FuelTrim);

    // Distances and times.
    put(0x21, "Distance with MIL on", 2, "km", Uint16);
    put(0x31, "Distance since codes cleared", 2, "km", Uint16);
    put(0x4D, "Time run with MIL on", 2, "min", Uint16);
    put(0x4E, "Time since codes cleared", 2, "min", Uint16);

    // Electrical.
    put(0x42, "Control module voltage", 2, "V", Voltage);
    put(0x5B, "Hybrid battery pack remaining life", 1, "%", Percent);

    // Advanced.
    put(0x43, "Absolute load value", 2, "%", AbsoluteLoad);
    put(0x5D, "Fuel injection timing", 2, "\u{b0}", InjectionTiming);
    put(0x61, "Driver demand torque", 1, "%", Torque);
    put(0x62, "Actual engine torque", 1, "%", Torque);
    put(0x63, "Engine reference torque", 2, "Nm", Uint16);
    m
});

fn service_name(service: u8) -> String {
    match service {
        0x01 => "Show current data".to_string(),
        0x02 => "Show freeze frame data".to_string(),
        0x03 => "Show stored DTCs".to_string(),
        0x04 => "Clear DTCs".to_string(),
        0x05 => "Test results (O2 sensors)".to_string(),
        0x06 => "Test results (other)".to_string(),
        0x07 => "Show pending DTCs".to_string(),
        0x09 => "Request vehicle information".to_string(),
        0x0A => "Permanent DTCs".to_string(),
        other => format!("Service 0x{other:02X}"),
    }
}

fn pid_name(pid: u8) -> String {
    match OBD2_PIDS.get(&pid) {
        Some(info) => info.name.to_string(),
        None => format!("Unknown PID 0x{pid:02X}"),
    }
}

fn fuel_type_name(code: u8) -> String {
    let name = match code {
        0 => "Not available",
        1 => "Gasoline",
        2 => "Methanol",
        3 => "Ethanol",
        4 => "Diesel",
        5 => "LPG",
        6 => "CNG",
        7 => "Propane",
        8 => "Electric",
        9 => "Bifuel Gasoline",
        10 => "Bifuel Methanol",
        11 => "Bifuel Ethanol",
        12 => "Bifuel LPG",
        13 => "Bifuel CNG",
        14 => "Bifuel Propane",
        15 => "Bifuel Electric",
        16 => "Bifuel Gas/Electric",
        17 => "Hybrid Gasoline",
        18 => "Hybrid Ethanol",
        19 => "Hybrid Diesel",
        20 => "Hybrid Electric",
        21 => "Hybrid Mixed",
        22 => "Hybrid Regenerative",
        other => return format!("Unknown ({other})"),
    };
    name.to_string()
}

/// Decoded service 0x01 value: human text plus a numeric projection where
/// the formula yields one.
#[derive(Debug, Clone, PartialEq)]
pub struct PidValue {
    pub text: String,
    pub number: Option<f64>,
    pub supported_pids: Option<Vec<u8>>,
}

/// Decode the supported-PID bitfield: 4 bytes, MSB-first bits 1..=32 map to
/// `base + 1 ..= base + 32`.
pub fn decode_supported_pids(base_pid: u8, data: &[u8]) -> Vec<u8> {
    if data.len() < 4 {
        return Vec::new();
    }
    let bits = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    (1..=32u8)
        .filter(|i| bits & (1 << (32 - i)) != 0)
        .map(|i| base_pid.wrapping_add(i))
        .collect()
}

/// Apply the per-PID value formula. Returns `None` when the payload is too
/// short for the formula or the PID is unknown.
pub fn decode_pid_value(pid: u8, data: &[u8]) -> Option<PidValue> {
    let info = OBD2_PIDS.get(&pid)?;
    if data.is_empty() {
        return None;
    }

    let u16_be = |d: &[u8]| -> Option<u32> {
        (d.len() >= 2).then(|| ((d[0] as u32) << 8) | d[1] as u32)
    };
    let simple = |text: String, number: f64| {
        Some(PidValue { text, number: Some(number), supported_pids: None })
    };

    match info.kind {
        PidType::Direct => {
            let value = data[0] as f64;
            simple(format!(" = {} {}", data[0], info.unit), value)
        }
        PidType::Percent => {
            let value = data[0] as f64 * 100.0 / 255.0;
            simple(format!(" = {value:.1}%"), value)
        }
        PidType::TempOffset => {
            let value = data[0] as i32 - 40;
            simple(format!(" = {value}\u{b0}C"), value as f64)
        }
        PidType::Rpm => {
            let value = u16_be(data)? as f64 / 4.0;
            simple(format!(" = {value:.0} RPM"), value)
        }
        PidType::Uint16 => {
            let value = u16_be(data)?;
            simple(format!(" = {} {}", value, info.unit), value as f64)
        }
        PidType::Voltage => {
            let value = u16_be(data)? as f64 / 1000.0;
            simple(format!(" = {value:.2}V"), value)
        }
        PidType::FuelPressure => {
            let value = data[0] as u32 * 3;
            simple(format!(" = {value} kPa"), value as f64)
        }
        PidType::FuelRailRel => {
            let value = u16_be(data)? as f64 * 0.079;
            simple(format!(" = {value:.2} kPa"), value)
        }
        PidType::FuelRailAbs => {
            let value = u16_be(data)? * 10;
            simple(format!(" = {value} kPa"), value as f64)
        }
        PidType::Maf => {
            let value = u16_be(data)? as f64 / 100.0;
            simple(format!(" = {value:.2} g/s"), value)
        }
        PidType::FuelRate => {
            let value = u16_be(data)? as f64 / 20.0;
            simple(format!(" = {value:.2} L/h"), value)
        }
        PidType::Timing => {
            let value = data[0] as f64 / 2.0 - 64.0;
            simple(format!(" = {value:.1}\u{b0} before TDC"), value)
        }
        PidType::FuelTrim => {
            let value = data[0] as f64 * 100.0 / 128.0 - 100.0;
            simple(format!(" = {value:.1}%"), value)
        }
        PidType::O2Voltage => {
            if data.len() < 2 {
                return None;
            }
            let voltage = data[0] as f64 / 200.0;
            if data[1] != 0xFF {
                let trim = data[1] as f64 * 100.0 / 128.0 - 100.0;
                simple(format!(" = {voltage:.3}V, STFT: {trim:.1}%"), voltage)
            } else {
                simple(format!(" = {voltage:.3}V"), voltage)
            }
        }
        PidType::O2Lambda => {
            if data.len() < 4 {
                return None;
            }
            let lambda = u16_be(data)? as f64 * 2.0 / 65536.0;
            let voltage = u16_be(&data[2..])? as f64 * 8.0 / 65536.0;
            simple(format!(" = \u{3bb}:{lambda:.3}, {voltage:.2}V"), lambda)
        }
        PidType::O2LambdaCurrent => {
            if data.len() < 4 {
                return None;
            }
            let lambda = u16_be(data)? as f64 * 2.0 / 65536.0;
            let current = u16_be(&data[2..])? as f64 / 256.0 - 128.0;
            simple(format!(" = \u{3bb}:{lambda:.3}, {current:.1}mA"), lambda)
        }
        PidType::CommandedLambda => {
            let lambda = u16_be(data)? as f64 * 2.0 / 65536.0;
            simple(format!(" = \u{3bb}:{lambda:.3}"), lambda)
        }
        PidType::AbsoluteLoad => {
            let value = u16_be(data)? as f64 * 100.0 / 255.0;
            simple(format!(" = {value:.1}%"), value)
        }
        PidType::InjectionTiming => {
            let value = u16_be(data)? as f64 / 128.0 - 210.0;
            simple(format!(" = {value:.2}\u{b0}"), value)
        }
        PidType::Torque => {
            let value = data[0] as i32 - 125;
            simple(format!(" = {value}%"), value as f64)
        }
        PidType::FuelType => Some(PidValue {
            text: format!(" = {}", fuel_type_name(data[0])),
            number: Some(data[0] as f64),
            supported_pids: None,
        }),
        PidType::Bitfield => {
            if data.len() < 4 {
                return None;
            }
            let supported = decode_supported_pids(pid, data);
            let shown: Vec<String> = supported.iter().take(8).map(|p| format!("0x{p:02X}")).collect();
            let ellipsis = if supported.len() > 8 { "..." } else { "" };
            Some(PidValue {
                text: format!(" = {} PIDs: {}{}", supported.len(), shown.join(", "), ellipsis),
                number: None,
                supported_pids: Some(supported),
            })
        }
        PidType::Dtc | PidType::Enum => {
            let value = u16_be(data)?;
            simple(format!(" = 0x{value:04X}"), value as f64)
        }
    }
}

/// OBD-II decoder. Stateless: single frames decode in place, multi-frame
/// traffic is only tagged at the PCI level.
#[derive(Debug, Default)]
pub struct Obd2Decoder;

impl Obd2Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Identifier gate per ISO 15765-4.
    pub fn is_obd2_id(can_id: u32, is_extended: bool) -> bool {
        if is_extended {
            matches!(can_id & 0x1FFF_0000, 0x18DA_0000 | 0x18DB_0000)
        } else {
            can_id == OBD_BROADCAST_ID
                || REQUEST_ID_RANGE.contains(&can_id)
                || RESPONSE_ID_RANGE.contains(&can_id)
        }
    }

    fn decode_29bit(&self, can_id: u32) -> DecodedResult {
        let priority = (can_id >> 26) & 0x07;
        let target = (can_id >> 8) & 0xFF;
        let source = can_id & 0xFF;
        DecodedResult::success(
            PROTOCOL,
            0.7,
            format!("29-bit: {source:02X} \u{2192} {target:02X}"),
        )
        .with("kind", "29bit")
        .with("priority", priority as i64)
        .with("target", target as i64)
        .with("source", source as i64)
    }

    fn decode_single_frame(&self, can_id: u32, data: &[u8], length: usize) -> DecodedResult {
        if length < 1 || data.len() < length + 1 {
            return DecodedResult::failure(PROTOCOL, "Error: invalid frame length");
        }

        let service = data[1];
        let is_response = RESPONSE_ID_RANGE.contains(&can_id);

        if is_response {
            let actual = if service >= 0x40 { service - 0x40 } else { service };
            let mut result = DecodedResult::success(PROTOCOL, 0.9, String::new())
                .with("kind", "response")
                .with("service", actual as i64);

            if actual == 0x01 && length >= 2 {
                let pid = data[2];
                let name = pid_name(pid);
                result = result.with("pid", pid as i64).with("pid_name", name.clone());

                if length >= 3 {
                    let value_len = (length - 2).min(data.len() - 3);
                    let value = decode_pid_value(pid, &data[3..3 + value_len]);
                    let value_text = value.as_ref().map(|v| v.text.clone()).unwrap_or_default();
                    if let Some(value) = value {
                        if let Some(number) = value.number {
                            result = result.with("value_num", number);
                        }
                        if let Some(pids) = value.supported_pids {
                            let list = pids.iter().map(|&p| DecodedValue::Int(p as i64)).collect();
                            result = result.with("supported_pids", DecodedValue::List(list));
                        }
                        result = result.with("value", value.text);
                    }
                    result.description =
                        format!("Response: {} - {}{}", service_name(actual), name, value_text);
                } else {
                    result.description = format!("Response: {} - {}", service_name(actual), name);
                }
            } else {
                result.description = format!("Response: {}", service_name(actual));
            }
            result
        } else {
            let mut result = DecodedResult::success(PROTOCOL, 0.9, String::new())
                .with("kind", "request")
                .with("service", service as i64);

            if service == 0x01 && length >= 2 {
                let pid = data[2];
                let name = pid_name(pid);
                result = result.with("pid", pid as i64).with("pid_name", name.clone());
                result.description = format!("Request: {} - {}", service_name(service), name);
            } else {
                result.description = format!("Request: {}", service_name(service));
            }
            result
        }
    }

    fn decode_11bit(&self, can_id: u32, data: &[u8]) -> DecodedResult {
        let pci = data[0] >> 4;
        let low = (data[0] & 0x0F) as usize;

        match pci {
            0 => self.decode_single_frame(can_id, data, low),
            1 => {
                let total_length = ((low as u32) << 8) | data[1] as u32;
                DecodedResult::success(
                    PROTOCOL,
                    0.7,
                    format!("First Frame (total: {total_length} bytes)"),
                )
                .with("kind", "first_frame")
                .with("total_length", total_length as i64)
            }
            2 => DecodedResult::success(PROTOCOL, 0.7, format!("Consecutive Frame #{low}"))
                .with("kind", "consecutive_frame")
                .with("sequence", low as i64),
            3 => {
                let status = match low {
                    0 => "CTS",
                    1 => "Wait",
                    2 => "Overflow",
                    _ => "Unknown",
                };
                DecodedResult::success(PROTOCOL, 0.7, format!("Flow Control: {status}"))
                    .with("kind", "flow_control")
                    .with("status", low as i64)
            }
            other => DecodedResult::failure(PROTOCOL, format!("Error: unknown PCI {other}")),
        }
    }
}

impl Decoder for Obd2Decoder {
    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn description(&self) -> &'static str {
        "On-Board Diagnostics II (ISO 15765-4) - 250/500 kbps"
    }

    fn priority(&self) -> DecoderPriority {
        DecoderPriority::Normal
    }

    fn can_decode(&self, can_id: u32, _data: &[u8], is_extended: bool) -> bool {
        Self::is_obd2_id(can_id, is_extended)
    }

    fn decode(&mut self, frame: &Frame) -> Option<DecodedResult> {
        let data = frame.data();
        if data.len() < 2 {
            return Some(DecodedResult::failure(PROTOCOL, "Error: data too short"));
        }
        let result = if frame.is_extended() {
            self.decode_29bit(frame.can_id())
        } else {
            self.decode_11bit(frame.can_id(), data)
        };
        Some(result)
    }
}
