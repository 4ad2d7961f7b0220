//! Wire framing: `[1-byte type][4-byte big-endian signed length][payload]`.
//!
//! Handshake, Manifest and Error carry a JSON payload; every other frame
//! carries raw bytes (possibly none).

use crate::error::{Result, TransferError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{MAX_FRAME_PAYLOAD, PROTOCOL_VERSION};

const HEADER_LEN: usize = 5;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Handshake = 1,
    Manifest = 2,
    Chunk = 3,
    FileComplete = 4,
    SessionComplete = 5,
    Cancel = 6,
    Error = 7,
}

impl TryFrom<u8> for FrameType {
    type Error = TransferError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameType::Handshake),
            2 => Ok(FrameType::Manifest),
            3 => Ok(FrameType::Chunk),
            4 => Ok(FrameType::FileComplete),
            5 => Ok(FrameType::SessionComplete),
            6 => Ok(FrameType::Cancel),
            7 => Ok(FrameType::Error),
            other => Err(TransferError::protocol(format!(
                "Unknown frame type {}",
                other
            ))),
        }
    }
}

/// Opening frame of every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMsg {
    pub protocol_version: i32,
}

impl Default for HandshakeMsg {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Describes the single file carried by a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMsg {
    /// Always forward-slash separated on the wire
    pub relative_path: String,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub message: String,
}

/// A decoded frame whose payload the caller interprets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

/// Write a frame with a raw payload
pub async fn write_frame<W>(writer: &mut W, frame_type: FrameType, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_header(writer, frame_type, payload.len()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}

/// Read the next frame, whatever its type
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let (frame_type, len) = read_header(reader).await?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        read_exact(reader, &mut payload).await?;
    }
    Ok(Frame {
        frame_type,
        payload,
    })
}

/// Write a frame whose payload is `value` encoded as JSON
pub async fn write_structured_frame<W, T>(
    writer: &mut W,
    frame_type: FrameType,
    value: &T,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let json = serde_json::to_vec(value)?;
    write_frame(writer, frame_type, &json).await
}

/// Read a JSON frame, failing if its type is not `expected`
pub async fn read_structured_frame<R, T>(reader: &mut R, expected: FrameType) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let (frame_type, len) = read_header(reader).await?;
    if frame_type != expected {
        return Err(TransferError::protocol(format!(
            "Expected {:?} frame but received {:?}",
            expected, frame_type
        )));
    }

    let mut payload = vec![0u8; len];
    read_exact(reader, &mut payload).await?;

    serde_json::from_slice(&payload).map_err(|e| {
        TransferError::protocol(format!(
            "Failed to decode {:?} frame payload: {}",
            expected, e
        ))
    })
}

async fn write_header<W>(writer: &mut W, frame_type: FrameType, len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if len > MAX_FRAME_PAYLOAD {
        return Err(TransferError::protocol(format!(
            "Message too large: {} bytes (max {})",
            len, MAX_FRAME_PAYLOAD
        )));
    }

    let mut header = [0u8; HEADER_LEN];
    header[0] = frame_type as u8;
    header[1..].copy_from_slice(&(len as i32).to_be_bytes());
    writer.write_all(&header).await?;
    Ok(())
}

async fn read_header<R>(reader: &mut R) -> Result<(FrameType, usize)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    read_exact(reader, &mut header).await?;

    let frame_type = FrameType::try_from(header[0])?;
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len < 0 {
        return Err(TransferError::protocol(format!(
            "Invalid frame payload length {}",
            len
        )));
    }

    let len = len as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(TransferError::protocol(format!(
            "Message too large: {} bytes (max {})",
            len, MAX_FRAME_PAYLOAD
        )));
    }

    Ok((frame_type, len))
}

/// `read_exact` that reports a truncated stream as [`TransferError::UnexpectedEof`]
async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TransferError::UnexpectedEof)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_raw_frame_round_trip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, FrameType::Chunk, &[1, 2, 3])
            .await
            .unwrap();
        assert_eq!(wire, vec![3, 0, 0, 0, 3, 1, 2, 3]);

        let mut reader = wire.as_slice();
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Chunk);
        assert_eq!(frame.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_payload_frames() {
        let mut wire = Vec::new();
        for frame_type in [
            FrameType::FileComplete,
            FrameType::SessionComplete,
            FrameType::Cancel,
        ] {
            write_frame(&mut wire, frame_type, &[]).await.unwrap();
        }
        assert_eq!(wire.len(), 3 * HEADER_LEN);

        let mut reader = wire.as_slice();
        assert_eq!(
            read_frame(&mut reader).await.unwrap().frame_type,
            FrameType::FileComplete
        );
        assert_eq!(
            read_frame(&mut reader).await.unwrap().frame_type,
            FrameType::SessionComplete
        );
        let cancel = read_frame(&mut reader).await.unwrap();
        assert_eq!(cancel.frame_type, FrameType::Cancel);
        assert!(cancel.payload.is_empty());
    }

    #[tokio::test]
    async fn test_structured_frame_uses_camel_case() {
        let mut wire = Vec::new();
        let manifest = ManifestMsg {
            relative_path: "source/a.txt".to_string(),
            length: 5,
        };
        write_structured_frame(&mut wire, FrameType::Manifest, &manifest)
            .await
            .unwrap();

        let body = std::str::from_utf8(&wire[HEADER_LEN..]).unwrap();
        assert!(body.contains("\"relativePath\""));

        let mut reader = wire.as_slice();
        let decoded: ManifestMsg = read_structured_frame(&mut reader, FrameType::Manifest)
            .await
            .unwrap();
        assert_eq!(decoded, manifest);
    }

    #[tokio::test]
    async fn test_structured_frame_type_mismatch() {
        let mut wire = Vec::new();
        write_structured_frame(&mut wire, FrameType::Handshake, &HandshakeMsg::default())
            .await
            .unwrap();

        let mut reader = wire.as_slice();
        let result: Result<ManifestMsg> =
            read_structured_frame(&mut reader, FrameType::Manifest).await;
        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_structured_frame_bad_json() {
        let mut wire = Vec::new();
        write_frame(&mut wire, FrameType::Handshake, b"not json")
            .await
            .unwrap();

        let mut reader = wire.as_slice();
        let result: Result<HandshakeMsg> =
            read_structured_frame(&mut reader, FrameType::Handshake).await;
        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_eof() {
        // Header claims 10 bytes, only 4 follow
        let wire = vec![3, 0, 0, 0, 10, 1, 2, 3, 4];
        let mut reader = wire.as_slice();
        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(TransferError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_empty_stream_is_eof() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(TransferError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_negative_length_rejected() {
        let mut wire = vec![3];
        wire.extend_from_slice(&(-1i32).to_be_bytes());
        let mut reader = wire.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(TransferError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut wire = vec![3];
        wire.extend_from_slice(&((MAX_FRAME_PAYLOAD + 1) as i32).to_be_bytes());
        let mut reader = wire.as_slice();
        match read_frame(&mut reader).await {
            Err(TransferError::Protocol(msg)) => assert!(msg.contains("Message too large")),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_frame_type_rejected() {
        let wire = vec![42, 0, 0, 0, 0];
        let mut reader = wire.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(TransferError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_across_split_writes() {
        // The reader must keep looping until the whole payload arrived
        let (mut client, mut server) = tokio::io::duplex(4);
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            write_frame(&mut client, FrameType::Chunk, &payload)
                .await
                .unwrap();
        });

        let frame = read_frame(&mut server).await.unwrap();
        writer.await.unwrap();
        assert_eq!(frame.payload, expected);
    }
}
