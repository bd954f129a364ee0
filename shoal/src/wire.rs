use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::{Error, PieceIdx, Result, Sha1};

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LENGTH: usize = 4;
pub const MAX_PAYLOAD_LENGTH: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    HelloRequest = 1,
    HelloResponse = 2,
    PieceRequest = 3,
    PieceResponse = 4,
    Error = 5,
}

impl MessageKind {
    pub fn from_u8(kind: u8) -> Option<MessageKind> {
        match kind {
            _ if kind == MessageKind::HelloRequest as u8 => Some(MessageKind::HelloRequest),
            _ if kind == MessageKind::HelloResponse as u8 => Some(MessageKind::HelloResponse),
            _ if kind == MessageKind::PieceRequest as u8 => Some(MessageKind::PieceRequest),
            _ if kind == MessageKind::PieceResponse as u8 => Some(MessageKind::PieceResponse),
            _ if kind == MessageKind::Error as u8 => Some(MessageKind::Error),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MessageKind::HelloRequest => "HELLO_REQUEST",
            MessageKind::HelloResponse => "HELLO_RESPONSE",
            MessageKind::PieceRequest => "PIECE_REQUEST",
            MessageKind::PieceResponse => "PIECE_RESPONSE",
            MessageKind::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            payload: payload.into(),
        }
    }

    pub fn hello_request(torrent_id: Sha1) -> Self {
        Self::new(
            MessageKind::HelloRequest,
            Bytes::copy_from_slice(torrent_id.as_bytes()),
        )
    }

    pub fn hello_response(bitfield: Vec<u8>) -> Self {
        Self::new(MessageKind::HelloResponse, bitfield)
    }

    pub fn piece_request(index: PieceIdx, width: usize) -> Result<Self> {
        Ok(Self::new(
            MessageKind::PieceRequest,
            encode_ordinal(index, width)?,
        ))
    }

    pub fn piece_response(data: Bytes) -> Self {
        Self::new(MessageKind::PieceResponse, data)
    }

    pub fn error(reason: &str) -> Self {
        Self::new(MessageKind::Error, reason.to_string())
    }

    /// Payload interpreted as the UTF-8 reason of an ERROR message.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encode(&self) -> Result<Bytes> {
        encode_with_version(self.version, self.kind, &self.payload)
    }
}

pub fn encode(kind: MessageKind, payload: &[u8]) -> Result<Bytes> {
    encode_with_version(PROTOCOL_VERSION, kind, payload)
}

fn encode_with_version(version: u8, kind: MessageKind, payload: &[u8]) -> Result<Bytes> {
    let length = u16::try_from(payload.len()).map_err(|_| {
        Error::protocol(format!(
            "payload of {} bytes exceeds the maximum of {MAX_PAYLOAD_LENGTH}",
            payload.len()
        ))
    })?;
    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
    buf.put_u8(version);
    buf.put_u8(kind.to_u8());
    buf.put_u16(length);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Reads one message. `Ok(None)` means the stream ended, either cleanly between
/// messages or in the middle of one.
pub async fn read_message<R: AsyncRead + Unpin>(mut reader: R) -> Result<Option<Message>> {
    let mut header = [0u8; HEADER_LENGTH];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(Error::Connection(err)),
    }

    let version = header[0];
    let kind = MessageKind::from_u8(header[1])
        .ok_or_else(|| Error::protocol(format!("unknown message type: {}", header[1])))?;
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;

    let mut payload = BytesMut::zeroed(length);
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(Error::Connection(err)),
    }

    Ok(Some(Message {
        version,
        kind,
        payload: payload.freeze(),
    }))
}

pub async fn write_message<W: AsyncWrite + Unpin>(mut writer: W, message: &Message) -> Result<()> {
    let buf = message.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Big-endian ordinal, left padded with zeros to `width` bytes.
pub fn encode_ordinal(index: PieceIdx, width: usize) -> Result<Vec<u8>> {
    let value = u64::from(u32::from(index)).to_be_bytes();
    let significant = value.iter().skip_while(|b| **b == 0).count();
    if significant > width {
        return Err(Error::protocol(format!(
            "ordinal {} does not fit in {width} bytes",
            u32::from(index)
        )));
    }
    let mut buf = vec![0u8; width];
    let copy = width.min(value.len());
    buf[width - copy..].copy_from_slice(&value[value.len() - copy..]);
    Ok(buf)
}

/// Decodes a big-endian ordinal of any width, saturating at `u64::MAX`.
pub fn decode_ordinal(buf: &[u8]) -> u64 {
    buf.iter().fold(0u64, |acc, &b| {
        acc.checked_mul(256)
            .and_then(|acc| acc.checked_add(u64::from(b)))
            .unwrap_or(u64::MAX)
    })
}
