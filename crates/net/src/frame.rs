//! Stream framing.
//!
//! Format: each frame is `[4-byte CRC32][4-byte length][JSON payload]`,
//! both integers little-endian, the CRC taken over the payload.

use crc32fast::Hasher;
use mergebox_replication::codec::CodecError;
use mergebox_replication::transport::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size are refused in both directions.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::Failed(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.extend_from_slice(&checksum(payload).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut crc_buf = [0u8; 4];
    match reader.read_exact(&mut crc_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let expected = u32::from_le_bytes(crc_buf);

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Failed(format!(
            "peer announced a {} byte frame",
            len
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let actual = checksum(&payload);
    if actual != expected {
        return Err(CodecError::Invalid(format!(
            "frame checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        ))
        .into());
    }
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, b"third").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"third");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_payload_is_codec_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut frame = Vec::new();
        frame.extend_from_slice(&checksum(b"hello").to_le_bytes());
        frame.extend_from_slice(&5u32.to_le_bytes());
        frame.extend_from_slice(b"jello");
        a.write_all(&frame).await.unwrap();

        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&checksum(b"hello").to_le_bytes()).await.unwrap();
        a.write_all(&5u32.to_le_bytes()).await.unwrap();
        a.write_all(b"he").await.unwrap();
        drop(a);

        assert!(matches!(read_frame(&mut b).await, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_length_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&0u32.to_le_bytes()).await.unwrap();
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::Failed(_))
        ));
    }
}
