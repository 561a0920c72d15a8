//! Capture files: JSON save/load with typed file kinds, CSV export
//!
//! Every capture is a JSON object `{file_type, version, created_at,
//! messages}`. Loaders verify the declared kind and reject mismatches
//! without mutating any state.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::frame::{Frame, FrameRecord};

/// Current capture format version.
pub const CAPTURE_VERSION: u32 = 1;

/// What a capture file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    Tracer,
    Monitor,
    Transmit,
    Gateway,
    FtcanAnalyzer,
    VagBapCapture,
}

impl CaptureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Tracer => "tracer",
            CaptureKind::Monitor => "monitor",
            CaptureKind::Transmit => "transmit",
            CaptureKind::Gateway => "gateway",
            CaptureKind::FtcanAnalyzer => "ftcan_analyzer",
            CaptureKind::VagBapCapture => "vag_bap_capture",
        }
    }
}

/// Capture file failures.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("wrong file type: expected {expected}, found {found}")]
    WrongFileType { expected: &'static str, found: String },
    #[error("capture io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture format error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("capture contains a malformed frame: {0}")]
    MalformedFrame(#[from] crate::frame::FrameError),
}

/// On-disk capture document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureFile {
    pub file_type: CaptureKind,
    pub version: u32,
    /// ISO-8601 creation stamp.
    pub created_at: String,
    pub messages: Vec<FrameRecord>,
}

impl CaptureFile {
    /// Build a capture from live frames, stamped now.
    pub fn from_frames(kind: CaptureKind, frames: &[Frame]) -> Self {
        Self {
            file_type: kind,
            version: CAPTURE_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            messages: frames.iter().map(Frame::to_record).collect(),
        }
    }

    /// Decode all records back into frames.
    pub fn frames(&self) -> Result<Vec<Frame>, CaptureError> {
        self.messages
            .iter()
            .map(|record| Frame::from_record(record).map_err(CaptureError::from))
            .collect()
    }
}

/// Write a capture as pretty-printed JSON.
pub async fn save_capture(path: impl AsRef<Path>, capture: &CaptureFile) -> Result<(), CaptureError> {
    let json = serde_json::to_string_pretty(capture)?;
    fs::write(path.as_ref(), json).await?;
    info!(
        path = %path.as_ref().display(),
        kind = capture.file_type.as_str(),
        messages = capture.messages.len(),
        "capture saved"
    );
    Ok(())
}

/// Load a capture, verifying the declared kind. A mismatched kind is a
/// `WrongFileType` error and leaves no state behind.
pub async fn load_capture(
    path: impl AsRef<Path>,
    expected: CaptureKind,
) -> Result<CaptureFile, CaptureError> {
    let text = fs::read_to_string(path.as_ref()).await?;
    // Peek at the declared kind first so a mismatch reports WrongFileType
    // rather than a parse error on unfamiliar message fields.
    #[derive(Deserialize)]
    struct Header {
        file_type: String,
    }
    let header: Header = serde_json::from_str(&text)?;
    if header.file_type != expected.as_str() {
        return Err(CaptureError::WrongFileType {
            expected: expected.as_str(),
            found: header.file_type,
        });
    }
    let capture: CaptureFile = serde_json::from_str(&text)?;
    info!(
        path = %path.as_ref().display(),
        messages = capture.messages.len(),
        "capture loaded"
    );
    Ok(capture)
}

/// Export frames as CSV with the classic column set.
pub async fn export_csv(path: impl AsRef<Path>, frames: &[Frame]) -> Result<(), CaptureError> {
    let mut out = String::from("Timestamp,CAN ID,DLC,Data,Extended,RTR,Source\n");
    for frame in frames {
        out.push_str(&format!(
            "{:.6},0x{:X},{},{},{},{},{}\n",
            frame.timestamp(),
            frame.can_id(),
            frame.dlc(),
            frame.to_hex_string(),
            frame.is_extended(),
            frame.is_rtr(),
            frame.source(),
        ));
    }
    fs::write(path.as_ref(), out).await?;
    info!(path = %path.as_ref().display(), rows = frames.len(), "csv exported");
    Ok(())
}
