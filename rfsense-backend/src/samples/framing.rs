use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// How a connection delimits its single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// 4-byte big-endian length, then exactly that many bytes.
    LengthPrefixed,
    /// Everything the peer writes before closing its side.
    WholeConnection,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before a frame was sent")]
    Empty,
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// Reads one frame. Never allocates more than `max` bytes for the payload.
pub async fn read_frame<R>(reader: &mut R, framing: Framing, max: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match framing {
        Framing::LengthPrefixed => {
            let mut header = [0u8; 4];
            let got = read_full(reader, &mut header).await?;
            if got == 0 {
                return Err(FrameError::Empty);
            }
            if got < header.len() {
                return Err(FrameError::Truncated { expected: 4, got });
            }

            let len = u32::from_be_bytes(header) as usize;
            if len == 0 {
                return Err(FrameError::Empty);
            }
            if len > max {
                return Err(FrameError::TooLarge { len, max });
            }

            let mut payload = vec![0u8; len];
            let got = read_full(reader, &mut payload).await?;
            if got < len {
                return Err(FrameError::Truncated { expected: len, got });
            }
            Ok(payload)
        }
        Framing::WholeConnection => {
            let mut payload = Vec::new();
            reader.take(max as u64 + 1).read_to_end(&mut payload).await?;
            if payload.is_empty() {
                return Err(FrameError::Empty);
            }
            if payload.len() > max {
                return Err(FrameError::TooLarge { len: payload.len(), max });
            }
            Ok(payload)
        }
    }
}

// read_exact, but reports how far it got on EOF
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Writes one frame and flushes. Whole-connection framing expects the
/// caller to shut the stream down afterwards.
pub async fn write_frame<W>(writer: &mut W, framing: Framing, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if framing == Framing::LengthPrefixed {
        let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;
        writer.write_all(&len.to_be_bytes()).await?;
    }
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_length_prefixed_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Framing::LengthPrefixed, b"hello").await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);

        let frame = read_frame(&mut &buf[..], Framing::LengthPrefixed, 1024).await.unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn test_truncated_and_oversized() {
        let short = [0u8, 0, 0, 10, 1, 2, 3];
        let err = read_frame(&mut &short[..], Framing::LengthPrefixed, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { expected: 10, got: 3 }));

        let huge = [0xffu8, 0xff, 0xff, 0xff];
        let err = read_frame(&mut &huge[..], Framing::LengthPrefixed, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));

        let err = read_frame(&mut &[][..], Framing::LengthPrefixed, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Empty));
    }

    #[tokio::test]
    async fn test_whole_connection() {
        let data = b"abcdef";
        let frame = read_frame(&mut &data[..], Framing::WholeConnection, 6).await.unwrap();
        assert_eq!(frame, data);

        let err = read_frame(&mut &data[..], Framing::WholeConnection, 5).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }
}
