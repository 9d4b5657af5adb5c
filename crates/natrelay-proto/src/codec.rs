//! Timed frame reading and writing
//!
//! Control exchanges are fixed-width frames. Every read is bounded by a
//! timeout and a read that returns fewer bytes than the frame needs is a
//! [`ProtoError::ShortRead`], never a partial value.

use crate::ProtoError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads fixed-width fields from a stream, each bounded by `timeout`
pub struct FrameReader<'a, R> {
    inner: &'a mut R,
    timeout: Duration,
}

impl<'a, R> FrameReader<'a, R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: &'a mut R, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fill `buf` completely or fail
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtoError> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, fill(self.inner, buf)).await {
            Ok(result) => result,
            Err(_) => Err(ProtoError::Timeout(timeout)),
        }
    }

    pub async fn read_u8(&mut self) -> Result<u8, ProtoError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    pub async fn read_u16(&mut self) -> Result<u16, ProtoError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ProtoError> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read a `u16` length prefix followed by a UTF-8 string of at most `max` bytes
    pub async fn read_string(
        &mut self,
        field: &'static str,
        max: usize,
    ) -> Result<String, ProtoError> {
        let len = self.read_u16().await? as usize;
        if len > max {
            return Err(ProtoError::FieldTooLong { field, len, max });
        }
        let bytes = self.read_bytes(len).await?;
        String::from_utf8(bytes)
            .map_err(|_| ProtoError::InvalidFrame(format!("{} is not valid UTF-8", field)))
    }
}

async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ProtoError::ShortRead {
                expected: buf.len(),
                received: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Write a whole frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_u16_big_endian() {
        let mut data: &[u8] = &[0x4e, 0x20];
        let mut reader = FrameReader::new(&mut data, Duration::from_secs(1));
        assert_eq!(reader.read_u16().await.unwrap(), 20000);
    }

    #[tokio::test]
    async fn test_short_read_reports_received_bytes() {
        let mut data: &[u8] = &[0x01];
        let mut reader = FrameReader::new(&mut data, Duration::from_secs(1));
        match reader.read_u16().await {
            Err(ProtoError::ShortRead { expected, received }) => {
                assert_eq!(expected, 2);
                assert_eq!(received, 1);
            }
            other => panic!("expected short read, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_read_is_short_read() {
        let mut data: &[u8] = &[];
        let mut reader = FrameReader::new(&mut data, Duration::from_secs(1));
        let err = reader.read_u8().await.unwrap_err();
        assert!(err.is_peer_gone());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let (mut client, _server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(&mut client, Duration::from_millis(200));
        match reader.read_u8().await {
            Err(ProtoError::Timeout(d)) => assert_eq!(d, Duration::from_millis(200)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_string_over_limit_rejected() {
        let mut data: &[u8] = &[0x00, 0x10, b'a'];
        let mut reader = FrameReader::new(&mut data, Duration::from_secs(1));
        let err = reader.read_string("host", 8).await.unwrap_err();
        assert!(matches!(
            err,
            ProtoError::FieldTooLong {
                field: "host",
                len: 16,
                max: 8
            }
        ));
    }

    #[tokio::test]
    async fn test_write_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &[1, 2, 3]).await.unwrap();
        let mut reader = FrameReader::new(&mut b, Duration::from_secs(1));
        assert_eq!(reader.read_bytes(3).await.unwrap(), vec![1, 2, 3]);
    }
}
