//! Length-prefixed JSON frames: a little-endian `u32` byte count followed by
//! that many bytes of JSON.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use warden_core::{Result, WardenError};

/// Upper bound on a single frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(WardenError::mailbox(format!(
            "Frame of {} bytes exceeds limit of {}",
            bytes.len(),
            MAX_FRAME_LEN
        )));
    }
    writer.write_u32_le(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(WardenError::mailbox(format!(
            "Frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &json!({"a": 1})).await.unwrap();
        assert_eq!(&buf[..4], &7u32.to_le_bytes());
        assert_eq!(&buf[4..], br#"{"a":1}"#);

        let mut reader = buf.as_slice();
        let value: Option<Value> = read_frame(&mut reader).await.unwrap();
        assert_eq!(value, Some(json!({"a": 1})));
        let end: Option<Value> = read_frame(&mut reader).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        let mut reader = &header[..];
        let result: Result<Option<Value>> = read_frame(&mut reader).await;
        assert!(result.is_err());
    }
}
