//! Read-to-EOF message encoding/decoding
//!
//! Wire format: one JSON envelope per connection, terminated by the
//! sender closing its write side. No length prefix.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// Read the single envelope carried by a connection
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R, max_bytes: usize) -> Result<Envelope> {
    let mut payload = Vec::new();
    reader
        .take(max_bytes as u64 + 1)
        .read_to_end(&mut payload)
        .await?;

    // Sanity check
    if payload.is_empty() {
        return Err(Error::Decode("Empty message".into()));
    }
    if payload.len() > max_bytes {
        return Err(Error::Decode(format!(
            "Message too large: more than {} bytes",
            max_bytes
        )));
    }

    Envelope::from_bytes(&payload).map_err(|e| Error::Decode(format!("Invalid JSON: {}", e)))
}

/// Write an envelope and close the write side
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let payload = envelope
        .to_bytes()
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;

    writer.write_all(&payload).await?;
    writer.flush().await?;

    // EOF marks the end of the message
    writer.shutdown().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAX: usize = 1024 * 1024;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let envelope = Envelope::text("ping");

        let mut buf = Vec::new();
        write_message(&mut buf, &envelope).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_message(&mut cursor, MAX).await.unwrap();
        assert_eq!(decoded, envelope);
    }

    #[tokio::test]
    async fn test_empty_stream_rejected() {
        let mut cursor = Cursor::new(Vec::new());
        let result = read_message(&mut cursor, MAX).await;
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_oversized_stream_rejected() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Envelope::text("x".repeat(64))).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let result = read_message(&mut cursor, 16).await;
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_truncated_stream_rejected() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Envelope::text("truncate me")).await.unwrap();
        buf.truncate(buf.len() - 5);

        let mut cursor = Cursor::new(buf);
        let result = read_message(&mut cursor, MAX).await;
        assert!(matches!(result, Err(Error::Decode(_))));
    }
}
