//! Adapter command client over any async byte transport
//!
//! Commands get a single reply (ACK, BEL, or a text line); frame lines may
//! arrive interleaved at any time and are routed to the frame sink instead.
//! Idempotent commands (`C`, `V`, `N`) are retried once on BEL or timeout.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::{AdapterCodec, AdapterError, Bitrate, Command, Reply};
use crate::frame::Frame;

/// Default command reply timeout.
const REPLY_TIMEOUT: Duration = Duration::from_millis(250);

/// Command client for one adapter channel.
pub struct AdapterClient<T> {
    framed: Framed<T, AdapterCodec>,
    reply_timeout: Duration,
    frame_sink: Option<mpsc::Sender<Frame>>,
    /// Malformed receive lines dropped at ingress.
    malformed_dropped: u64,
}

impl<T: AsyncRead + AsyncWrite + Unpin> AdapterClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            framed: Framed::new(transport, AdapterCodec),
            reply_timeout: REPLY_TIMEOUT,
            frame_sink: None,
            malformed_dropped: 0,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Frames received while waiting for command replies (and from
    /// [`AdapterClient::recv_frame`]) are forwarded here.
    pub fn set_frame_sink(&mut self, sink: mpsc::Sender<Frame>) {
        self.frame_sink = Some(sink);
    }

    pub fn malformed_dropped(&self) -> u64 {
        self.malformed_dropped
    }

    fn stamp(frame: Frame) -> Frame {
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        frame.with_timestamp(now)
    }

    async fn route_frame(&mut self, frame: Frame) {
        if let Some(sink) = &self.frame_sink {
            let _ = sink.send(Self::stamp(frame)).await;
        }
    }

    async fn next_reply(&mut self) -> Result<Reply, AdapterError> {
        loop {
            let item = tokio::time::timeout(self.reply_timeout, self.framed.next())
                .await
                .map_err(|_| AdapterError::Timeout)?;
            match item {
                Some(Ok(Reply::Frame(frame))) => self.route_frame(frame).await,
                Some(Ok(Reply::Malformed(line))) => {
                    self.malformed_dropped += 1;
                    debug!(line, "dropped malformed adapter line");
                }
                Some(Ok(reply)) => return Ok(reply),
                Some(Err(e)) => return Err(AdapterError::Io(e)),
                None => return Err(AdapterError::Closed),
            }
        }
    }

    async fn execute_once(&mut self, command: Command) -> Result<Reply, AdapterError> {
        self.framed.send(command).await.map_err(AdapterError::Io)?;
        match self.next_reply().await? {
            Reply::Error => Err(AdapterError::Bell),
            reply => Ok(reply),
        }
    }

    /// Send a command and wait for its reply. Idempotent commands are
    /// retried once on BEL or timeout; other failures surface immediately.
    pub async fn execute(&mut self, command: Command) -> Result<Reply, AdapterError> {
        match self.execute_once(command.clone()).await {
            Err(AdapterError::Bell | AdapterError::Timeout) if command.is_idempotent() => {
                warn!(?command, "adapter command failed, retrying once");
                self.execute_once(command).await
            }
            result => result,
        }
    }

    /// Configure the bitrate and open the channel.
    pub async fn open(&mut self, bitrate: Bitrate) -> Result<(), AdapterError> {
        match self.execute(Command::SetBitrate(bitrate)).await? {
            Reply::Ack => {}
            other => return Err(AdapterError::UnexpectedReply(format!("{other:?}"))),
        }
        match self.execute(Command::Open).await? {
            Reply::Ack => Ok(()),
            other => Err(AdapterError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub async fn close(&mut self) -> Result<(), AdapterError> {
        match self.execute(Command::Close).await? {
            Reply::Ack => Ok(()),
            other => Err(AdapterError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub async fn transmit(&mut self, frame: Frame) -> Result<(), AdapterError> {
        match self.execute(Command::Transmit(frame)).await? {
            Reply::Ack => Ok(()),
            other => Err(AdapterError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub async fn version(&mut self) -> Result<String, AdapterError> {
        match self.execute(Command::Version).await? {
            Reply::Version(v) => Ok(v),
            other => Err(AdapterError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub async fn serial_number(&mut self) -> Result<String, AdapterError> {
        match self.execute(Command::SerialNumber).await? {
            Reply::Serial(n) => Ok(n),
            other => Err(AdapterError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Listen-mode receive: wait for the next frame line, timestamping it on
    /// arrival. Malformed lines are dropped and counted. Returns `None` when
    /// the transport closes.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            match self.framed.next().await? {
                Ok(Reply::Frame(frame)) => return Some(Self::stamp(frame)),
                Ok(Reply::Malformed(line)) => {
                    self.malformed_dropped += 1;
                    debug!(line, "dropped malformed adapter line");
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "adapter stream error");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_open_sequence() {
        let (client_io, mut peer) = tokio::io::duplex(256);
        let mut client = AdapterClient::new(client_io);

        let driver = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let n = tokio::io::AsyncReadExt::read(&mut peer, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"S6\r");
            peer.write_all(b"\r").await.unwrap();
            let n = tokio::io::AsyncReadExt::read(&mut peer, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"O\r");
            peer.write_all(b"\r").await.unwrap();
            peer
        });

        client.open(Bitrate::B500k).await.unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_idempotent_retry_after_bel() {
        let (client_io, mut peer) = tokio::io::duplex(256);
        let mut client = AdapterClient::new(client_io);

        let driver = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            // First attempt: BEL. Second attempt: ACK.
            tokio::io::AsyncReadExt::read(&mut peer, &mut buf).await.unwrap();
            peer.write_all(&[0x07]).await.unwrap();
            tokio::io::AsyncReadExt::read(&mut peer, &mut buf).await.unwrap();
            peer.write_all(b"\r").await.unwrap();
            peer
        });

        client.close().await.unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_idempotent_bell_surfaces() {
        let (client_io, mut peer) = tokio::io::duplex(256);
        let mut client = AdapterClient::new(client_io);

        let driver = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            tokio::io::AsyncReadExt::read(&mut peer, &mut buf).await.unwrap();
            peer.write_all(&[0x07]).await.unwrap();
            peer
        });

        let err = client.execute(Command::Open).await.unwrap_err();
        assert!(matches!(err, AdapterError::Bell));
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_routed_to_sink_during_command() {
        let (client_io, mut peer) = tokio::io::duplex(256);
        let mut client = AdapterClient::new(client_io);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        client.set_frame_sink(sink_tx);

        let driver = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            tokio::io::AsyncReadExt::read(&mut peer, &mut buf).await.unwrap();
            // A frame line arrives before the command ack.
            peer.write_all(b"t1232DEAD\rV1013\r").await.unwrap();
            peer
        });

        let version = client.version().await.unwrap();
        assert_eq!(version, "V1013");
        let frame = sink_rx.recv().await.unwrap();
        assert_eq!(frame.can_id(), 0x123);
        assert!(frame.timestamp() > 0.0);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_frame_drops_malformed() {
        let (client_io, mut peer) = tokio::io::duplex(256);
        let mut client = AdapterClient::new(client_io);

        tokio::spawn(async move {
            peer.write_all(b"garbage\rt1232DEAD\r").await.unwrap();
            // Keep peer alive until the client has read everything.
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let frame = client.recv_frame().await.unwrap();
        assert_eq!(frame.can_id(), 0x123);
        assert_eq!(client.malformed_dropped(), 1);
    }

    #[tokio::test]
    async fn test_version_timeout() {
        let (client_io, _peer) = tokio::io::duplex(256);
        let mut client =
            AdapterClient::new(client_io).with_reply_timeout(Duration::from_millis(20));
        // No reply at all: idempotent retry also times out, error surfaces.
        let err = client.version().await.unwrap_err();
        assert!(matches!(err, AdapterError::Timeout));
    }
}
