//! Frame structure and serialization

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result, PROTO_VERSION};

/// Header length in bytes
pub const FRAME_HDR_LEN: usize = 4;

/// Largest body a single frame can carry
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Frame command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Authentication request (client) or reply (server), JSON body
    Auth = 0,
    /// Keepalive, empty body
    Heartbeat = 1,
    /// Raw overlay network packet
    Data = 2,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Command::Auth),
            1 => Ok(Command::Heartbeat),
            2 => Ok(Command::Data),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Auth => write!(f, "auth"),
            Command::Heartbeat => write!(f, "heartbeat"),
            Command::Data => write!(f, "data"),
        }
    }
}

/// Frame header
///
/// ```text
/// +---------+---------+---------+---------+
/// | Byte 0  | Byte 1  | Byte 2  | Byte 3  |
/// +---------+---------+---------+---------+
/// | Version | Command | Body length (BE)  |
/// +---------+---------+---------+---------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version of the sender
    pub version: u8,
    /// Frame command
    pub command: Command,
    /// Body length in bytes
    pub len: u16,
}

impl FrameHeader {
    /// Serialize the header to its 4-byte wire form
    pub fn to_bytes(&self) -> [u8; FRAME_HDR_LEN] {
        let len = self.len.to_be_bytes();
        [self.version, self.command as u8, len[0], len[1]]
    }

    /// Parse a header from the front of `data`
    ///
    /// The version byte is carried through as-is; peers speaking a
    /// different version are not rejected at this layer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HDR_LEN {
            return Err(Error::FrameTooShort {
                expected: FRAME_HDR_LEN,
                actual: data.len(),
            });
        }

        Ok(Self {
            version: data[0],
            command: Command::try_from(data[1])?,
            len: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// A complete tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub command: Command,
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame with the current protocol version
    pub fn new(command: Command, body: Vec<u8>) -> Self {
        Self {
            version: PROTO_VERSION,
            command,
            body,
        }
    }

    /// Create an auth frame
    pub fn auth(body: Vec<u8>) -> Self {
        Self::new(Command::Auth, body)
    }

    /// Create a heartbeat frame
    pub fn heartbeat() -> Self {
        Self::new(Command::Heartbeat, Vec::new())
    }

    /// Create a data frame carrying one overlay packet
    pub fn data(packet: Vec<u8>) -> Self {
        Self::new(Command::Data, packet)
    }

    /// Build the header for this frame, rejecting bodies that do not fit
    pub fn header(&self) -> Result<FrameHeader> {
        let len = u16::try_from(self.body.len()).map_err(|_| Error::BodyTooLarge(self.body.len()))?;
        Ok(FrameHeader {
            version: self.version,
            command: self.command,
            len,
        })
    }

    /// Serialize the frame to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = self.header()?;
        let mut buf = Vec::with_capacity(FRAME_HDR_LEN + self.body.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Parse exactly one frame from `data`
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(data)?;
        let total = FRAME_HDR_LEN + header.len as usize;
        if data.len() < total {
            return Err(Error::FrameTooShort {
                expected: total,
                actual: data.len(),
            });
        }

        Ok(Self {
            version: header.version,
            command: header.command,
            body: data[FRAME_HDR_LEN..total].to_vec(),
        })
    }
}

/// Read one frame: the 4-byte header, then exactly `len` body bytes
///
/// A stream that ends before the full body arrives is an error, never a
/// short frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hdr = [0u8; FRAME_HDR_LEN];
    reader.read_exact(&mut hdr).await?;
    let header = FrameHeader::from_bytes(&hdr)?;

    let mut body = vec![0u8; header.len as usize];
    reader.read_exact(&mut body).await?;

    Ok(Frame {
        version: header.version,
        command: header.command,
        body,
    })
}

/// Write one frame as a single buffer
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let buf = frame.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one `[len:u16 BE][payload]` record from a forwarding stream
pub async fn read_prefixed<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len = [0u8; 2];
    reader.read_exact(&mut len).await?;
    let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one `[len:u16 BE][payload]` record to a forwarding stream
pub async fn write_prefixed<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u16::try_from(payload.len()).map_err(|_| Error::BodyTooLarge(payload.len()))?;
    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(Command::Data, vec![0xAA; 0x0102]);
        let wire = frame.encode().unwrap();
        assert_eq!(&wire[..4], &[0x01, 0x02, 0x01, 0x02]);
        assert_eq!(wire.len(), 4 + 0x0102);
    }

    #[test]
    fn test_heartbeat_is_empty() {
        let wire = Frame::heartbeat().encode().unwrap();
        assert_eq!(wire, vec![0x01, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_body_too_large() {
        let frame = Frame::data(vec![0u8; MAX_BODY_LEN + 1]);
        assert!(matches!(frame.encode(), Err(Error::BodyTooLarge(n)) if n == MAX_BODY_LEN + 1));
    }

    #[test]
    fn test_max_body_fits() {
        let frame = Frame::data(vec![7u8; MAX_BODY_LEN]);
        let wire = frame.encode().unwrap();
        assert_eq!(&wire[2..4], &[0xFF, 0xFF]);
        assert_eq!(Frame::decode(&wire).unwrap().body.len(), MAX_BODY_LEN);
    }

    #[test]
    fn test_unknown_command() {
        let result = FrameHeader::from_bytes(&[0x01, 0x09, 0x00, 0x00]);
        assert!(matches!(result, Err(Error::UnknownCommand(9))));
    }

    #[test]
    fn test_decode_short_body() {
        let result = Frame::decode(&[0x01, 0x02, 0x00, 0x05, 1, 2, 3]);
        assert!(matches!(
            result,
            Err(Error::FrameTooShort { expected: 9, actual: 7 })
        ));
    }

    #[test]
    fn test_foreign_version_preserved() {
        let frame = Frame::decode(&[0x07, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(frame.version, 0x07);
        assert_eq!(frame.command, Command::Heartbeat);
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let mut wire = Frame::auth(b"{\"key\":\"k\"}".to_vec()).encode().unwrap();
        wire.extend(Frame::heartbeat().encode().unwrap());
        let mut reader = &wire[..];

        let first = read_frame(&mut reader).await.unwrap();
        assert_eq!(first.command, Command::Auth);
        assert_eq!(first.body, b"{\"key\":\"k\"}");

        let second = read_frame(&mut reader).await.unwrap();
        assert_eq!(second.command, Command::Heartbeat);
        assert!(second.body.is_empty());

        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_read_frame_truncated_body() {
        let wire = [0x01, 0x02, 0x00, 0x10, 1, 2, 3, 4];
        let mut reader = &wire[..];
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_prefixed_roundtrip() {
        let mut buf = Vec::new();
        write_prefixed(&mut buf, b"hello").await.unwrap();
        write_prefixed(&mut buf, b"").await.unwrap();
        assert_eq!(&buf[..2], &[0x00, 0x05]);

        let mut reader = &buf[..];
        assert_eq!(read_prefixed(&mut reader).await.unwrap(), b"hello");
        assert!(read_prefixed(&mut reader).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prefixed_rejects_oversize() {
        let mut buf = Vec::new();
        let result = write_prefixed(&mut buf, &vec![0u8; MAX_BODY_LEN + 1]).await;
        assert!(matches!(result, Err(Error::BodyTooLarge(_))));
        assert!(buf.is_empty());
    }
}
