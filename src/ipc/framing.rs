//! Content-Length frame codec.
//!
//! HTTP-style framing, the same scheme LSP uses, so message boundaries survive
//! a stream socket:
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <json body>
//! ```
//!
//! Header names are case-insensitive; CRLF and bare LF are both accepted.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ClientError;

/// Maximum body size (100MB); larger frames are rejected before allocating.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Read one framed body.
///
/// Returns `Ok(None)` when the peer closes the stream between frames. EOF in
/// the middle of a frame is a transport error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, ClientError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to read header line: {}", e)))?;

        if bytes_read == 0 {
            if saw_header {
                return Err(ClientError::Transport(
                    "Connection closed inside frame header".to_string(),
                ));
            }
            return Ok(None);
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            // Stray blank line between frames.
            continue;
        }
        saw_header = true;

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse().map_err(|_| {
                    ClientError::Protocol(format!("Invalid Content-Length value: {}", value))
                })?);
            }
        }
    }

    let size = content_length
        .ok_or_else(|| ClientError::Protocol("Missing Content-Length header".to_string()))?;

    if size > MAX_FRAME_SIZE {
        return Err(ClientError::Protocol(format!(
            "Frame size {} exceeds maximum {} bytes",
            size, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ClientError::Transport(format!("Failed to read frame body: {}", e)))?;

    String::from_utf8(body)
        .map(Some)
        .map_err(|_| ClientError::Protocol("Frame body is not valid UTF-8".to_string()))
}

/// Write one framed body and flush.
pub async fn write_frame<W>(writer: &mut W, body: &str) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Connected socket halves: the reader sees what the writer writes.
    fn socket_pair() -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let (stream_a, stream_b) = UnixStream::pair().expect("Failed to create socket pair");
        // Dropping the unused halves only shuts down the a -> b direction.
        let (a_read, _) = stream_a.into_split();
        let (_, b_write) = stream_b.into_split();
        (BufReader::new(a_read), b_write)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (mut reader, mut writer) = socket_pair();
        let body = r#"{"kind":"command","command_id":"ping","token":1}"#;

        write_frame(&mut writer, body).await.expect("Write failed");

        let received = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Read failed");
        assert_eq!(received.as_deref(), Some(body));
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (mut reader, mut writer) = socket_pair();

        write_frame(&mut writer, "first").await.unwrap();
        write_frame(&mut writer, "second").await.unwrap();

        let a = timeout(TEST_TIMEOUT, read_frame(&mut reader)).await.unwrap().unwrap();
        let b = timeout(TEST_TIMEOUT, read_frame(&mut reader)).await.unwrap().unwrap();
        assert_eq!(a.as_deref(), Some("first"));
        assert_eq!(b.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_lf_and_lowercase_header() {
        let (mut reader, mut writer) = socket_pair();
        let body = r#"{"test":true}"#;
        let raw = format!("content-length: {}\n\n{}", body.len(), body);
        writer.write_all(raw.as_bytes()).await.unwrap();

        let received = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.as_deref(), Some(body));
    }

    #[tokio::test]
    async fn test_extra_headers_ignored() {
        let (mut reader, mut writer) = socket_pair();
        let raw = "Content-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
        writer.write_all(raw.as_bytes()).await.unwrap();

        let received = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_missing_content_length() {
        let (mut reader, mut writer) = socket_pair();
        writer.write_all(b"Content-Type: text\r\n\r\n").await.unwrap();

        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Missing Content-Length"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let (mut reader, mut writer) = socket_pair();
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_SIZE + 1);
        writer.write_all(raw.as_bytes()).await.unwrap();

        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out");
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (mut reader, writer) = socket_pair();
        drop(writer);

        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Clean EOF is not an error");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_header_is_error() {
        let (mut reader, mut writer) = socket_pair();
        writer.write_all(b"Content-Length: 10\r\n").await.unwrap();
        drop(writer);

        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out");
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }
}
