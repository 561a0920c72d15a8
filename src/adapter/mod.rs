//! CanHacker / Lawicel serial-line adapter protocol
//!
//! The physical serial port is an external collaborator; this module owns
//! the wire grammar (CR-terminated command frames, BEL error byte) and a
//! command client generic over any `AsyncRead + AsyncWrite` transport.

pub mod client;
pub mod codec;

pub use client::AdapterClient;
pub use codec::AdapterCodec;

use thiserror::Error;

use crate::frame::Frame;

/// Acknowledgement byte.
pub const ACK: u8 = b'\r';

/// Error byte (BEL).
pub const BEL: u8 = 0x07;

/// Transport-level adapter failures.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Adapter answered BEL.
    #[error("adapter signalled error (BEL)")]
    Bell,
    #[error("adapter reply timed out")]
    Timeout,
    #[error("unexpected adapter reply: {0:?}")]
    UnexpectedReply(String),
    #[error("adapter stream closed")]
    Closed,
    #[error("adapter io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel bitrate, `Sn` command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitrate {
    B10k,
    B20k,
    B50k,
    B100k,
    B125k,
    B250k,
    B500k,
    B800k,
    B1M,
}

impl Bitrate {
    /// `n` digit of the `Sn` command.
    pub fn code(&self) -> u8 {
        match self {
            Bitrate::B10k => 0,
            Bitrate::B20k => 1,
            Bitrate::B50k => 2,
            Bitrate::B100k => 3,
            Bitrate::B125k => 4,
            Bitrate::B250k => 5,
            Bitrate::B500k => 6,
            Bitrate::B800k => 7,
            Bitrate::B1M => 8,
        }
    }

    pub fn bps(&self) -> u32 {
        match self {
            Bitrate::B10k => 10_000,
            Bitrate::B20k => 20_000,
            Bitrate::B50k => 50_000,
            Bitrate::B100k => 100_000,
            Bitrate::B125k => 125_000,
            Bitrate::B250k => 250_000,
            Bitrate::B500k => 500_000,
            Bitrate::B800k => 800_000,
            Bitrate::B1M => 1_000_000,
        }
    }

    /// Closest table entry for a configured baudrate.
    pub fn from_bps(bps: u32) -> Option<Self> {
        match bps {
            10_000 => Some(Bitrate::B10k),
            20_000 => Some(Bitrate::B20k),
            50_000 => Some(Bitrate::B50k),
            100_000 => Some(Bitrate::B100k),
            125_000 => Some(Bitrate::B125k),
            250_000 => Some(Bitrate::B250k),
            500_000 => Some(Bitrate::B500k),
            800_000 => Some(Bitrate::B800k),
            1_000_000 => Some(Bitrate::B1M),
            _ => None,
        }
    }
}

/// Command sent to the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetBitrate(Bitrate),
    /// Open the channel in active mode.
    Open,
    Close,
    Transmit(Frame),
    Version,
    SerialNumber,
}

impl Command {
    /// Idempotent commands are retried once on BEL or timeout.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Command::Close | Command::Version | Command::SerialNumber)
    }

    /// Wire form without the trailing CR.
    pub fn encode(&self) -> String {
        match self {
            Command::SetBitrate(bitrate) => format!("S{}", bitrate.code()),
            Command::Open => "O".to_string(),
            Command::Close => "C".to_string(),
            Command::Version => "V".to_string(),
            Command::SerialNumber => "N".to_string(),
            Command::Transmit(frame) => encode_frame(frame),
        }
    }
}

/// Bit-exact frame line: `tIIILDD…`, `TIIIIIIIILDD…`, `rIIIL`, `RIIIIIIIIL`.
pub fn encode_frame(frame: &Frame) -> String {
    let data_hex: String = frame.data().iter().map(|b| format!("{b:02X}")).collect();
    match (frame.is_extended(), frame.is_rtr()) {
        (false, false) => format!("t{:03X}{:X}{}", frame.can_id(), frame.dlc(), data_hex),
        (true, false) => format!("T{:08X}{:X}{}", frame.can_id(), frame.dlc(), data_hex),
        (false, true) => format!("r{:03X}{:X}", frame.can_id(), frame.dlc()),
        (true, true) => format!("R{:08X}{:X}", frame.can_id(), frame.dlc()),
    }
}

/// One parsed adapter line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Bare CR acknowledgement.
    Ack,
    /// BEL error byte.
    Error,
    /// Received frame line; timestamp is stamped by the caller.
    Frame(Frame),
    /// `V…` version reply.
    Version(String),
    /// `N…` serial-number reply.
    Serial(String),
    /// Line that matched no grammar rule. Dropped at ingress, counted.
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_table() {
        assert_eq!(Bitrate::B10k.code(), 0);
        assert_eq!(Bitrate::B1M.code(), 8);
        assert_eq!(Bitrate::B500k.bps(), 500_000);
        assert_eq!(Bitrate::from_bps(125_000), Some(Bitrate::B125k));
        assert_eq!(Bitrate::from_bps(123), None);
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::SetBitrate(Bitrate::B500k).encode(), "S6");
        assert_eq!(Command::Open.encode(), "O");
        assert_eq!(Command::Close.encode(), "C");
        assert_eq!(Command::Version.encode(), "V");
        assert_eq!(Command::SerialNumber.encode(), "N");
    }

    #[test]
    fn test_frame_encoding() {
        let std = Frame::new(0.0, 0x123, vec![0xDE, 0xAD], false, "CAN1").unwrap();
        assert_eq!(encode_frame(&std), "t1232DEAD");

        let ext = Frame::new(0.0, 0x1733_3310, vec![0x01], true, "CAN1").unwrap();
        assert_eq!(encode_frame(&ext), "T17333310101");

        let rtr = Frame::new_remote(0.0, 0x456, 3, false, "CAN1").unwrap();
        assert_eq!(encode_frame(&rtr), "r4563");

        let rtr_ext = Frame::new_remote(0.0, 0x1ABCDEF0, 0, true, "CAN1").unwrap();
        assert_eq!(encode_frame(&rtr_ext), "R1ABCDEF00");
    }

    #[test]
    fn test_idempotency_classification() {
        assert!(Command::Close.is_idempotent());
        assert!(Command::Version.is_idempotent());
        assert!(Command::SerialNumber.is_idempotent());
        assert!(!Command::Open.is_idempotent());
        let frame = Frame::new(0.0, 0x1, vec![], false, "CAN1").unwrap();
        assert!(!Command::Transmit(frame).is_idempotent());
    }
}
