//! Mesh wire format — the length-delimited frame envelope.
//!
//! Every message on a session stream is one frame:
//!
//! ```text
//! u16 length (big-endian) || u16 message-type id (big-endian) || body
//! ```
//!
//! `length` counts the bytes that follow it (type id + body), never itself.
//! There is no version field and no resynchronization: any framing error is
//! fatal to the stream it was read from.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::message::{Message, MessageId};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Size of the message-type id at the start of every payload.
pub const TYPE_ID_LEN: usize = 2;

/// Largest payload a single frame can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Largest body that still fits in one frame next to its type id.
pub const MAX_BODY: usize = MAX_PAYLOAD - TYPE_ID_LEN;

// ── Raw frames ────────────────────────────────────────────────────────────────

/// One decoded frame before the body is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub type_id: u16,
    pub body: Bytes,
}

/// Encode one frame: length prefix, type id, body.
pub fn encode_frame(type_id: u16, body: &[u8]) -> Result<Bytes, WireError> {
    if body.len() > MAX_BODY {
        return Err(WireError::PayloadTooLarge(body.len()));
    }
    let payload_len = TYPE_ID_LEN + body.len();

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload_len);
    buf.put_u16(payload_len as u16);
    buf.put_u16(type_id);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Split a payload (everything after the length prefix) into type id and body.
pub fn split_payload(payload: &[u8]) -> Result<(u16, &[u8]), WireError> {
    match payload {
        [] => Err(WireError::EmptyFrame),
        [hi, lo, body @ ..] => Ok((u16::from_be_bytes([*hi, *lo]), body)),
        short => Err(WireError::FrameTooShort(short.len())),
    }
}

/// Read exactly one frame from `reader`.
///
/// Two-phase: the 2-byte length, then exactly that many payload bytes.
/// A stream that ends inside either phase is a `ShortRead`.
pub async fn read_frame<R>(reader: &mut R) -> Result<RawFrame, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; LENGTH_PREFIX_LEN];
    reader.read_exact(&mut head).await.map_err(WireError::from_read)?;

    let len = u16::from_be_bytes(head) as usize;
    if len == 0 {
        return Err(WireError::EmptyFrame);
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(WireError::from_read)?;

    let (type_id, body) = split_payload(&payload)?;
    Ok(RawFrame {
        type_id,
        body: Bytes::copy_from_slice(body),
    })
}

/// Read one frame and interpret it as a typed message.
///
/// Ids outside the message namespace fail with `UnknownMessageType`, kept
/// distinct from `ShortRead` so callers can log the two apart.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader).await?;
    let id = MessageId::try_from(frame.type_id)?;
    Message::decode(id, &frame.body)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("zero-length frame")]
    EmptyFrame,

    #[error("frame payload of {0} bytes cannot hold a message-type id")]
    FrameTooShort(usize),

    #[error("payload length {0} exceeds maximum {}", MAX_BODY)]
    PayloadTooLarge(usize),

    #[error("stream closed mid-frame: {0}")]
    ShortRead(#[source] io::Error),

    #[error("unknown message type id: {0}")]
    UnknownMessageType(u16),

    #[error("malformed body for {id:?}: {source}")]
    MalformedBody {
        id: MessageId,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode message body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    fn from_read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WireError::ShortRead(e)
        } else {
            WireError::Io(e)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn encode_frame_layout() {
        let frame = encode_frame(0x0102, b"abc").unwrap();
        assert_eq!(&frame[..], &[0x00, 0x05, 0x01, 0x02, b'a', b'b', b'c']);
    }

    #[test]
    fn length_prefix_excludes_itself() {
        let frame = encode_frame(7, &[]).unwrap();
        assert_eq!(frame.len(), 4);
        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), 2);
    }

    #[test]
    fn oversized_body_rejected() {
        let body = vec![0u8; MAX_BODY + 1];
        assert!(matches!(
            encode_frame(1, &body),
            Err(WireError::PayloadTooLarge(n)) if n == MAX_BODY + 1
        ));
        assert!(encode_frame(1, &body[..MAX_BODY]).is_ok());
    }

    #[test]
    fn split_payload_rejects_short_input() {
        assert!(matches!(split_payload(&[]), Err(WireError::EmptyFrame)));
        assert!(matches!(split_payload(&[1]), Err(WireError::FrameTooShort(1))));
        let (id, body) = split_payload(&[0, 9, 0xff]).unwrap();
        assert_eq!(id, 9);
        assert_eq!(body, &[0xff]);
    }

    #[tokio::test]
    async fn read_frame_recovers_encoded_frame() {
        let encoded = encode_frame(0xbeef, b"hello mesh").unwrap();
        let mut reader = &encoded[..];
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame.type_id, 0xbeef);
        assert_eq!(&frame.body[..], b"hello mesh");
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn consecutive_frames_read_in_order() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(1, b"one").unwrap());
        stream.extend_from_slice(&encode_frame(2, b"").unwrap());
        stream.extend_from_slice(&encode_frame(3, b"three").unwrap());

        let mut reader = &stream[..];
        let ids: Vec<u16> = [
            read_frame(&mut reader).await.unwrap(),
            read_frame(&mut reader).await.unwrap(),
            read_frame(&mut reader).await.unwrap(),
        ]
        .iter()
        .map(|f| f.type_id)
        .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn truncated_payload_is_short_read() {
        // length says 4, only 2 bytes follow before EOF
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&[0x00, 0x04, 0xab, 0xcd]).await.unwrap();
        drop(tx);

        let err = read_frame(&mut rx).await.unwrap_err();
        assert!(matches!(err, WireError::ShortRead(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn truncated_length_is_short_read() {
        let mut reader: &[u8] = &[0x00];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::ShortRead(_))
        ));
    }

    #[tokio::test]
    async fn one_byte_payload_is_too_short() {
        let mut reader: &[u8] = &[0x00, 0x01, 0x02, 0x00, 0x02, 0x00, 0x01];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::FrameTooShort(1))
        ));
    }

    #[tokio::test]
    async fn zero_length_frame_rejected() {
        let mut reader: &[u8] = &[0x00, 0x00, 0x01, 0x02];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::EmptyFrame)
        ));
    }

    #[tokio::test]
    async fn unknown_message_type_is_distinct_from_short_read() {
        let encoded = encode_frame(0x7777, b"{}").unwrap();
        let mut reader = &encoded[..];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, WireError::UnknownMessageType(0x7777)));
    }
}
