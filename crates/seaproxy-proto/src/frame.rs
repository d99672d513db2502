use smol::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

/// Fixed frame header: stream id (u32 BE) + kind (u8) + payload length (u32 BE).
pub const HEADER_LEN: usize = 9;

/// Cap on a single frame payload. Larger logical payloads are split across
/// consecutive `DATA_*` frames of the same stream.
pub const MAX_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Open = 1,
    DataC2s = 2,
    DataS2c = 3,
    EofC2s = 4,
    EofS2c = 5,
    Close = 6,
    Error = 7,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtoError;

    fn try_from(tag: u8) -> Result<Self, ProtoError> {
        match tag {
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::DataC2s),
            3 => Ok(FrameKind::DataS2c),
            4 => Ok(FrameKind::EofC2s),
            5 => Ok(FrameKind::EofS2c),
            6 => Ok(FrameKind::Close),
            7 => Ok(FrameKind::Error),
            other => Err(ProtoError::UnknownKind(other)),
        }
    }
}

/// What a stream carries, declared in the `OPEN` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    Request = 0,
    Tunnel = 1,
}

impl TryFrom<u8> for StreamKind {
    type Error = ProtoError;

    fn try_from(tag: u8) -> Result<Self, ProtoError> {
        match tag {
            0 => Ok(StreamKind::Request),
            1 => Ok(StreamKind::Tunnel),
            other => Err(ProtoError::UnknownStreamKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(stream_id: u32, kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind,
            payload,
        }
    }

    /// Control frame with no payload.
    pub fn bare(stream_id: u32, kind: FrameKind) -> Self {
        Self::new(stream_id, kind, Vec::new())
    }

    pub fn open(stream_id: u32, stream_kind: StreamKind) -> Self {
        Self::new(stream_id, FrameKind::Open, vec![stream_kind as u8])
    }

    pub fn error(stream_id: u32, status: u16, reason: &str) -> Self {
        Self::new(
            stream_id,
            FrameKind::Error,
            format!("{status} {reason}").into_bytes(),
        )
    }
}

/// Decode an `ERROR` payload; anything unparseable degrades to a plain 502.
pub fn parse_error_payload(payload: &[u8]) -> (u16, String) {
    let text = String::from_utf8_lossy(payload);
    let mut parts = text.trim().splitn(2, ' ');
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..=599).contains(s))
        .unwrap_or(502);
    let reason = parts.next().unwrap_or("Bad Gateway").to_string();
    (status, reason)
}

pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    out.extend_from_slice(&frame.stream_id.to_be_bytes());
    out.push(frame.kind as u8);
    out.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&frame.payload);
    out
}

/// Write one frame as a single contiguous byte run. Callers serialise writers
/// through a mutex so frames from concurrent tasks never interleave.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge {
            len: frame.payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    writer.write_all(&encode(frame)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` is a clean link close at a frame boundary;
/// anything short of a full header + declared payload is a protocol error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtoError::TruncatedFrame);
        }
        filled += n;
    }

    let stream_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let kind = FrameKind::try_from(header[4])?;
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD,
        });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtoError::TruncatedFrame,
            _ => ProtoError::Io(err),
        })?;

    Ok(Some(Frame {
        stream_id,
        kind,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::io::Cursor;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(0x0102_0304, FrameKind::DataC2s, b"hi".to_vec());
        let bytes = encode(&frame);
        assert_eq!(
            bytes,
            vec![0x01, 0x02, 0x03, 0x04, 2, 0x00, 0x00, 0x00, 0x02, b'h', b'i']
        );
    }

    #[test]
    fn test_roundtrip() {
        smol::block_on(async {
            let frames = vec![
                Frame::open(1, StreamKind::Tunnel),
                Frame::new(1, FrameKind::DataC2s, b"example.com:443".to_vec()),
                Frame::bare(1, FrameKind::EofC2s),
                Frame::error(1, 502, "connect refused"),
            ];

            let mut wire = Vec::new();
            for frame in &frames {
                wire.extend_from_slice(&encode(frame));
            }

            let mut reader = Cursor::new(wire);
            for expected in &frames {
                let got = read_frame(&mut reader).await.unwrap().unwrap();
                assert_eq!(&got, expected);
            }
            assert!(read_frame(&mut reader).await.unwrap().is_none());
        });
    }

    #[test]
    fn test_clean_eof_is_none() {
        smol::block_on(async {
            let mut reader = Cursor::new(Vec::<u8>::new());
            assert!(read_frame(&mut reader).await.unwrap().is_none());
        });
    }

    #[test]
    fn test_truncated_header() {
        smol::block_on(async {
            let mut reader = Cursor::new(vec![0x00, 0x00, 0x00, 0x01, 2]);
            assert!(matches!(
                read_frame(&mut reader).await,
                Err(ProtoError::TruncatedFrame)
            ));
        });
    }

    #[test]
    fn test_truncated_payload() {
        smol::block_on(async {
            let mut wire = encode(&Frame::new(7, FrameKind::DataS2c, b"hello".to_vec()));
            wire.truncate(wire.len() - 2);
            let mut reader = Cursor::new(wire);
            assert!(matches!(
                read_frame(&mut reader).await,
                Err(ProtoError::TruncatedFrame)
            ));
        });
    }

    #[test]
    fn test_unknown_kind() {
        smol::block_on(async {
            let mut wire = encode(&Frame::bare(1, FrameKind::Close));
            wire[4] = 0x2a;
            let mut reader = Cursor::new(wire);
            assert!(matches!(
                read_frame(&mut reader).await,
                Err(ProtoError::UnknownKind(0x2a))
            ));
        });
    }

    #[test]
    fn test_oversize_payload_rejected() {
        smol::block_on(async {
            let mut wire = encode(&Frame::bare(1, FrameKind::DataC2s));
            let bad_len = (MAX_PAYLOAD as u32 + 1).to_be_bytes();
            wire[5..9].copy_from_slice(&bad_len);
            let mut reader = Cursor::new(wire);
            assert!(matches!(
                read_frame(&mut reader).await,
                Err(ProtoError::PayloadTooLarge { .. })
            ));

            let huge = Frame::new(1, FrameKind::DataC2s, vec![0u8; MAX_PAYLOAD + 1]);
            let mut sink = Cursor::new(Vec::new());
            assert!(matches!(
                write_frame(&mut sink, &huge).await,
                Err(ProtoError::PayloadTooLarge { .. })
            ));
        });
    }

    #[test]
    fn test_error_payload() {
        let (status, reason) = parse_error_payload(b"502 connect refused");
        assert_eq!(status, 502);
        assert_eq!(reason, "connect refused");

        let (status, _) = parse_error_payload(b"nonsense");
        assert_eq!(status, 502);

        let (status, _) = parse_error_payload(b"999999 out of range");
        assert_eq!(status, 502);
    }
}
