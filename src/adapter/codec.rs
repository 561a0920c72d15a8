//! tokio-util codec for the CR-terminated adapter wire grammar

use bytes::{Buf, BufMut, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::codec::{Decoder, Encoder};

use super::{Command, Reply, ACK, BEL};
use crate::frame::Frame;

static STD_DATA_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^t([0-9A-Fa-f]{3})([0-9A-Fa-f])([0-9A-Fa-f]*)$").expect("valid regex"));
static EXT_DATA_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^T([0-9A-Fa-f]{8})([0-9A-Fa-f])([0-9A-Fa-f]*)$").expect("valid regex"));
static STD_RTR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^r([0-9A-Fa-f]{3})([0-9A-Fa-f])$").expect("valid regex"));
static EXT_RTR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^R([0-9A-Fa-f]{8})([0-9A-Fa-f])$").expect("valid regex"));

/// Codec turning the adapter byte stream into [`Reply`] values and
/// [`Command`] values into wire lines. Malformed lines surface as
/// `Reply::Malformed` so the stream keeps flowing; dropping and counting is
/// the caller's policy.
#[derive(Debug, Default)]
pub struct AdapterCodec;

fn parse_hex_u32(s: &str) -> u32 {
    u32::from_str_radix(s, 16).expect("regex guarantees hex")
}

fn parse_data_line(regex: &Regex, line: &str, is_extended: bool) -> Option<Reply> {
    let captures = regex.captures(line)?;
    let can_id = parse_hex_u32(&captures[1]);
    let dlc = parse_hex_u32(&captures[2]) as usize;
    let data_hex = &captures[3];
    if dlc > 8 || data_hex.len() != dlc * 2 {
        return Some(Reply::Malformed(line.to_string()));
    }
    let data: Vec<u8> = (0..dlc)
        .map(|i| u8::from_str_radix(&data_hex[i * 2..i * 2 + 2], 16).expect("hex"))
        .collect();
    match Frame::new(0.0, can_id, data, is_extended, "") {
        Ok(frame) => Some(Reply::Frame(frame)),
        Err(_) => Some(Reply::Malformed(line.to_string())),
    }
}

fn parse_rtr_line(regex: &Regex, line: &str, is_extended: bool) -> Option<Reply> {
    let captures = regex.captures(line)?;
    let can_id = parse_hex_u32(&captures[1]);
    let dlc = parse_hex_u32(&captures[2]) as u8;
    if dlc > 8 {
        return Some(Reply::Malformed(line.to_string()));
    }
    match Frame::new_remote(0.0, can_id, dlc, is_extended, "") {
        Ok(frame) => Some(Reply::Frame(frame)),
        Err(_) => Some(Reply::Malformed(line.to_string())),
    }
}

fn parse_line(line: &str) -> Reply {
    if line.is_empty() {
        return Reply::Ack;
    }
    match line.as_bytes()[0] {
        b't' => parse_data_line(&STD_DATA_LINE, line, false),
        b'T' => parse_data_line(&EXT_DATA_LINE, line, true),
        b'r' => parse_rtr_line(&STD_RTR_LINE, line, false),
        b'R' => parse_rtr_line(&EXT_RTR_LINE, line, true),
        b'V' => return Reply::Version(line.to_string()),
        b'N' => return Reply::Serial(line.to_string()),
        _ => None,
    }
    .unwrap_or_else(|| Reply::Malformed(line.to_string()))
}

impl Decoder for AdapterCodec {
    type Item = Reply;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // BEL is a complete reply on its own.
        if src[0] == BEL {
            src.advance(1);
            return Ok(Some(Reply::Error));
        }
        let Some(end) = src.iter().position(|&b| b == ACK) else {
            return Ok(None);
        };
        let line = src.split_to(end + 1);
        let line = &line[..end];
        let text = String::from_utf8_lossy(line);
        Ok(Some(parse_line(&text)))
    }
}

impl Encoder<Command> for AdapterCodec {
    type Error = std::io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = command.encode();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(ACK);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Bitrate;

    fn decode_all(bytes: &[u8]) -> Vec<Reply> {
        let mut codec = AdapterCodec;
        let mut buffer = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(reply) = codec.decode(&mut buffer).unwrap() {
            out.push(reply);
        }
        out
    }

    #[test]
    fn test_decode_ack_and_bel() {
        assert_eq!(decode_all(b"\r"), vec![Reply::Ack]);
        assert_eq!(decode_all(b"\x07"), vec![Reply::Error]);
        assert_eq!(decode_all(b"\r\x07\r"), vec![Reply::Ack, Reply::Error, Reply::Ack]);
    }

    #[test]
    fn test_decode_standard_frame_line() {
        let replies = decode_all(b"t1232DEAD\r");
        let Reply::Frame(frame) = &replies[0] else {
            panic!("expected frame, got {replies:?}");
        };
        assert_eq!(frame.can_id(), 0x123);
        assert_eq!(frame.dlc(), 2);
        assert_eq!(frame.data(), &[0xDE, 0xAD]);
        assert!(!frame.is_extended());
    }

    #[test]
    fn test_decode_extended_frame_line() {
        let replies = decode_all(b"T1733331018A\r");
        let Reply::Frame(frame) = &replies[0] else {
            panic!("expected frame, got {replies:?}");
        };
        assert_eq!(frame.can_id(), 0x1733_3310);
        assert!(frame.is_extended());
        assert_eq!(frame.data(), &[0x8A]);
    }

    #[test]
    fn test_decode_remote_frame_lines() {
        let replies = decode_all(b"r4563\rR1ABCDEF00\r");
        let Reply::Frame(std) = &replies[0] else { panic!() };
        assert!(std.is_rtr());
        assert_eq!(std.dlc(), 3);
        let Reply::Frame(ext) = &replies[1] else { panic!() };
        assert!(ext.is_rtr());
        assert!(ext.is_extended());
        assert_eq!(ext.can_id(), 0x1ABC_DEF0);
    }

    #[test]
    fn test_decode_version_and_serial() {
        assert_eq!(decode_all(b"V1013\r"), vec![Reply::Version("V1013".into())]);
        assert_eq!(decode_all(b"NA123\r"), vec![Reply::Serial("NA123".into())]);
    }

    #[test]
    fn test_malformed_lines_do_not_stall_stream() {
        let replies = decode_all(b"t12\rt1232DEAD\r");
        assert_eq!(replies[0], Reply::Malformed("t12".into()));
        assert!(matches!(replies[1], Reply::Frame(_)));
    }

    #[test]
    fn test_dlc_data_length_mismatch_is_malformed() {
        // DLC 4 but only 2 data bytes.
        let replies = decode_all(b"t1234DEAD\r");
        assert!(matches!(replies[0], Reply::Malformed(_)));
    }

    #[test]
    fn test_partial_line_waits_for_cr() {
        let mut codec = AdapterCodec;
        let mut buffer = BytesMut::from(&b"t1232DE"[..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(b"AD\r");
        assert!(matches!(codec.decode(&mut buffer).unwrap(), Some(Reply::Frame(_))));
    }

    #[test]
    fn test_encode_round_trip() {
        let mut codec = AdapterCodec;
        let mut buffer = BytesMut::new();
        codec.encode(Command::SetBitrate(Bitrate::B1M), &mut buffer).unwrap();
        codec.encode(Command::Open, &mut buffer).unwrap();
        let frame = Frame::new(0.0, 0x7DF, vec![0x02, 0x01, 0x0C], false, "CAN1").unwrap();
        codec.encode(Command::Transmit(frame), &mut buffer).unwrap();
        assert_eq!(&buffer[..], b"S8\rO\rt7DF302010C\r");
    }
}
