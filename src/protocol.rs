//! Length-prefixed message framing.
//!
//! The pipe primitive is a byte stream; message boundaries come from a
//! 4-byte big-endian length prefix in front of every payload:
//!
//! ```text
//! ┌──────────┬─────────────┐
//! │ Length   │ Payload     │
//! │ 4 bytes  │ N bytes     │
//! │ u32 BE   │             │
//! └──────────┴─────────────┘
//! ```
//!
//! Blocking [`write_message`]/[`read_message`] serve the handshake plane;
//! [`write_message_async`] and the [`MessageBuffer`] state machine serve the
//! per-connection read/write tasks, which see arbitrary chunk boundaries.

use std::io::{Read, Write};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{BrokerError, Result};

/// Length prefix size in bytes.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Default maximum message size (64 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Write one framed message and wait for it to drain.
///
/// The final `flush` is the drain barrier the handshake relies on: once this
/// returns, the sender may close its end of the pipe.
///
/// # Errors
///
/// Returns error if the payload exceeds the maximum size or the write fails.
pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = message_len(payload)?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message, blocking until it is complete.
///
/// # Errors
///
/// Returns error if the peer closes mid-message or the declared length
/// exceeds the maximum size.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_PREFIX_SIZE];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    check_len(len, DEFAULT_MAX_MESSAGE_SIZE)?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Async counterpart of [`write_message`], used by connection writer tasks.
pub async fn write_message_async<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = message_len(payload)?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

fn message_len(payload: &[u8]) -> Result<u32> {
    let len = u32::try_from(payload.len())
        .map_err(|_| BrokerError::Protocol("payload exceeds u32 length prefix".into()))?;
    check_len(len, DEFAULT_MAX_MESSAGE_SIZE)?;
    Ok(len)
}

fn check_len(len: u32, max: u32) -> Result<()> {
    if len > max {
        return Err(BrokerError::Protocol(format!(
            "message of {len} bytes exceeds maximum of {max}"
        )));
    }
    Ok(())
}

/// State machine for incremental frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete length prefix.
    WaitingForLen,
    /// Prefix parsed, waiting for the full payload.
    WaitingForPayload { len: u32 },
}

/// Buffer accumulating incoming bytes and extracting complete messages.
///
/// Read loops push whatever chunk the pipe returned; complete payloads come
/// out as cheaply-cloneable [`Bytes`], partial ones stay buffered.
pub struct MessageBuffer {
    buffer: BytesMut,
    state: State,
    max_message_size: u32,
}

impl MessageBuffer {
    /// Create a buffer with the default maximum message size.
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a buffer with a custom maximum message size.
    pub fn with_max_size(max_message_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForLen,
            max_message_size,
        }
    }

    /// Push a chunk of bytes, returning every message completed by it.
    ///
    /// # Errors
    ///
    /// Returns error if a declared payload length exceeds the maximum; the
    /// buffer is unusable afterwards and the connection should be dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        loop {
            match self.state {
                State::WaitingForLen => {
                    if self.buffer.len() < LEN_PREFIX_SIZE {
                        break;
                    }
                    let mut len_buf = [0u8; LEN_PREFIX_SIZE];
                    len_buf.copy_from_slice(&self.buffer[..LEN_PREFIX_SIZE]);
                    self.buffer.advance(LEN_PREFIX_SIZE);

                    let len = u32::from_be_bytes(len_buf);
                    check_len(len, self.max_message_size)?;
                    self.state = State::WaitingForPayload { len };
                }
                State::WaitingForPayload { len } => {
                    if self.buffer.len() < len as usize {
                        break;
                    }
                    messages.push(self.buffer.split_to(len as usize).freeze());
                    self.state = State::WaitingForLen;
                }
            }
        }

        Ok(messages)
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_message(&mut out, payload).unwrap();
        out
    }

    #[test]
    fn blocking_roundtrip() {
        let bytes = framed(b"hello pipe");
        let mut cursor = Cursor::new(bytes);
        assert_eq!(read_message(&mut cursor).unwrap(), b"hello pipe");
    }

    #[test]
    fn blocking_roundtrip_empty_payload() {
        let bytes = framed(b"");
        let mut cursor = Cursor::new(bytes);
        assert_eq!(read_message(&mut cursor).unwrap(), b"");
    }

    #[test]
    fn read_rejects_oversized_declared_length() {
        let mut bytes = (DEFAULT_MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"junk");
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_message(&mut cursor),
            Err(BrokerError::Protocol(_))
        ));
    }

    #[test]
    fn read_errors_on_truncated_payload() {
        let mut bytes = framed(b"truncated");
        bytes.truncate(bytes.len() - 3);
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(read_message(&mut cursor), Err(BrokerError::Io(_))));
    }

    #[tokio::test]
    async fn async_write_matches_blocking_format() {
        let mut out = Vec::new();
        write_message_async(&mut out, b"same bytes").await.unwrap();
        assert_eq!(out, framed(b"same bytes"));
    }

    #[test]
    fn buffer_extracts_single_message() {
        let mut buffer = MessageBuffer::new();
        let messages = buffer.push(&framed(b"one")).unwrap();
        assert_eq!(messages, vec![Bytes::from_static(b"one")]);
    }

    #[test]
    fn buffer_extracts_batched_messages() {
        let mut bytes = framed(b"first");
        bytes.extend(framed(b"second"));
        bytes.extend(framed(b"third"));

        let mut buffer = MessageBuffer::new();
        let messages = buffer.push(&bytes).unwrap();
        assert_eq!(
            messages,
            vec![
                Bytes::from_static(b"first"),
                Bytes::from_static(b"second"),
                Bytes::from_static(b"third"),
            ]
        );
    }

    #[test]
    fn buffer_handles_fragmented_input() {
        let bytes = framed(b"fragmented payload");
        let mut buffer = MessageBuffer::new();

        // One byte at a time; only the final byte completes the message.
        for &b in &bytes[..bytes.len() - 1] {
            assert!(buffer.push(&[b]).unwrap().is_empty());
        }
        let messages = buffer.push(&bytes[bytes.len() - 1..]).unwrap();
        assert_eq!(messages, vec![Bytes::from_static(b"fragmented payload")]);
    }

    #[test]
    fn buffer_rejects_oversized_message() {
        let mut buffer = MessageBuffer::with_max_size(8);
        let result = buffer.push(&framed(b"nine bytes")); // 10 > 8
        assert!(matches!(result, Err(BrokerError::Protocol(_))));
    }

    #[test]
    fn buffer_keeps_remainder_across_pushes() {
        let mut bytes = framed(b"complete");
        let tail = framed(b"partial");
        bytes.extend_from_slice(&tail[..3]);

        let mut buffer = MessageBuffer::new();
        let messages = buffer.push(&bytes).unwrap();
        assert_eq!(messages, vec![Bytes::from_static(b"complete")]);

        let messages = buffer.push(&tail[3..]).unwrap();
        assert_eq!(messages, vec![Bytes::from_static(b"partial")]);
    }
}
