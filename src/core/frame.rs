//! Length-prefixed wire framing
//!
//! Every message on the wire is a 4-byte big-endian length field followed
//! by exactly that many payload bytes. The reader never interprets payload
//! bytes until the full declared length has arrived; the writer emits
//! length-then-payload as one logical unit.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::LENGTH_PREFIX_BYTES;
use crate::error::{RelayError, Result};

/// Prepend the 4-byte big-endian length of `payload`.
///
/// Fails with `PayloadTooLarge` if the length does not fit in a `u32`;
/// truncating the length field silently would corrupt the stream.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > u32::MAX as usize {
        return Err(RelayError::PayloadTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read one complete frame, accumulating over as many underlying reads as
/// the transport requires.
///
/// Returns `ConnectionClosed` if the peer closes before the length field
/// or mid-payload, and `FrameTooLarge` for declared lengths above
/// `max_frame_bytes` before any payload buffering happens.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
    reader.read_exact(&mut len_buf).await.map_err(map_read_err)?;
    read_payload(reader, u32::from_be_bytes(len_buf) as usize, max_frame_bytes).await
}

/// Complete a frame whose first length byte has already been consumed.
///
/// The session read loop waits for the first byte separately so an idle
/// timeout can never discard a partially read length field.
pub async fn resume_frame<R>(reader: &mut R, first: u8, max_frame_bytes: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut rest = [0u8; LENGTH_PREFIX_BYTES - 1];
    reader.read_exact(&mut rest).await.map_err(map_read_err)?;
    let len_buf = [first, rest[0], rest[1], rest[2]];
    read_payload(reader, u32::from_be_bytes(len_buf) as usize, max_frame_bytes).await
}

async fn read_payload<R>(reader: &mut R, declared: usize, max_frame_bytes: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if declared > max_frame_bytes {
        return Err(RelayError::FrameTooLarge(declared));
    }
    let mut payload = vec![0u8; declared];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(map_read_err)?;
    Ok(payload)
}

/// Write one frame: length then payload, flushed together.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload)?;
    writer.write_all(&frame).await.map_err(map_write_err)?;
    writer.flush().await.map_err(map_write_err)?;
    Ok(())
}

fn map_read_err(err: std::io::Error) -> RelayError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => RelayError::ConnectionClosed,
        _ => RelayError::Connection(err.to_string()),
    }
}

fn map_write_err(err: std::io::Error) -> RelayError {
    match err.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => RelayError::ConnectionClosed,
        _ => RelayError::Connection(err.to_string()),
    }
}
