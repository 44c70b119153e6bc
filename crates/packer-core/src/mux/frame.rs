//! Wire framing for the multiplexed connection.
//!
//! ```text
//! [u32 BE: stream id][u8: kind][u32 BE: len][payload bytes of len]
//! ```
//!
//! `Syn`, `Ack` and `Fin` carry no payload; `Data` carries one chunk of a
//! stream's bytes; `Window` carries a u32 BE count of bytes the receiver has
//! consumed, returned to the sender as credit.

use crate::config::MuxConfig;
use crate::{PluginError, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    /// Open request for a stream id.
    Syn = 0,
    /// Acceptance of a pending `Syn`.
    Ack = 1,
    /// Close of a stream, or refusal of a `Syn`.
    Fin = 2,
    Data = 3,
    /// Send credit returned by the reading side.
    Window = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = PluginError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Syn),
            1 => Ok(FrameKind::Ack),
            2 => Ok(FrameKind::Fin),
            3 => Ok(FrameKind::Data),
            4 => Ok(FrameKind::Window),
            other => Err(PluginError::transport(format!(
                "unknown mux frame kind {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn control(stream_id: u32, kind: FrameKind) -> Self {
        Self {
            stream_id,
            kind,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data,
            payload,
        }
    }

    pub fn window(stream_id: u32, credit: u32) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Window,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }

    /// Credit carried by a `Window` frame.
    pub fn credit(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

/// Read one frame. Returns `None` on clean EOF before a header.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; MuxConfig::FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let stream_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let kind = FrameKind::try_from(header[4])?;
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

    if len > MuxConfig::MAX_FRAME_SIZE {
        return Err(PluginError::FrameTooLarge {
            size: len,
            max: MuxConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        stream_id,
        kind,
        payload: Bytes::from(payload),
    }))
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let mut header = [0u8; MuxConfig::FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&frame.stream_id.to_be_bytes());
    header[4] = frame.kind as u8;
    header[5..].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::data(5, Bytes::from_static(b"hi")))
            .await
            .unwrap();

        assert_eq!(buf, vec![0, 0, 0, 5, 3, 0, 0, 0, 2, b'h', b'i']);

        let frame = read_frame(&mut buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(frame.stream_id, 5);
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(&frame.payload[..], b"hi");
    }

    #[tokio::test]
    async fn test_control_frames_are_empty() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::control(9, FrameKind::Fin))
            .await
            .unwrap();
        assert_eq!(buf.len(), MuxConfig::FRAME_HEADER_LEN);
    }

    #[tokio::test]
    async fn test_window_frame_carries_credit() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::window(4, 65_536)).await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 4, 4, 0, 0, 0, 4, 0, 1, 0, 0]);

        let frame = read_frame(&mut buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Window);
        assert_eq!(frame.credit(), Some(65_536));
        assert_eq!(Frame::control(4, FrameKind::Window).credit(), None);
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let empty: &[u8] = &[];
        let mut reader = empty;
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let raw = [0u8, 0, 0, 1, 42, 0, 0, 0, 0];
        let err = read_frame(&mut &raw[..]).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MuxConfig::MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let raw = [0, 0, 0, 1, 3, len[0], len[1], len[2], len[3]];
        match read_frame(&mut &raw[..]).await {
            Err(PluginError::FrameTooLarge { size, .. }) => {
                assert_eq!(size, MuxConfig::MAX_FRAME_SIZE + 1)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
