pub mod frame_errors;
pub mod request;
pub mod response;
pub mod types;

use bytes::{Buf, Bytes, BytesMut};
#[cfg(test)]
use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use frame_errors::{FrameError, ParseError};
use request::SerializableRequest;
use response::ResponseOpcode;

pub const HEADER_SIZE: usize = 9;

// Frame versions for the only protocol version we speak.
const REQUEST_VERSION: u8 = 0x04;
const RESPONSE_VERSION: u8 = 0x84;

// The protocol caps frame bodies at 256 MB.
const MAX_BODY_SIZE: u32 = 256 * 1024 * 1024;

/// Stream id reserved by the protocol for server-initiated events.
pub const EVENT_STREAM_ID: i16 = -1;

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: REQUEST_VERSION,
            flags: 0x00,
            stream: 0,
        }
    }
}

/// One whole inbound frame: header params, opcode and the raw body.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub params: FrameParams,
    pub opcode: ResponseOpcode,
    pub body: Bytes,
}

fn parse_response_header(raw_header: &[u8]) -> Result<(FrameParams, ResponseOpcode, u32), FrameError> {
    let mut buf = raw_header;

    let version = buf.get_u8();
    if version & 0x80 != 0x80 {
        return Err(FrameError::FrameFromClient);
    }
    if version & 0x7F != (RESPONSE_VERSION & 0x7F) {
        return Err(FrameError::VersionNotSupported(version & 0x7F));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32();
    if length > MAX_BODY_SIZE {
        return Err(FrameError::BodyTooLarge(length, MAX_BODY_SIZE));
    }

    Ok((frame_params, opcode, length))
}

/// Accumulates raw socket bytes and yields whole frames.
///
/// The buffer is codec-agnostic: it understands just enough of the header to
/// know how long a frame is. Bytes that do not yet form a complete frame are
/// retained verbatim for the next [`FrameBuffer::append`].
#[derive(Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extracts the next whole frame, or returns `None` if more bytes are needed.
    pub fn try_pull(&mut self) -> Result<Option<ResponseFrame>, FrameError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let (params, opcode, length) = parse_response_header(&self.buf[..HEADER_SIZE])?;

        let frame_len = HEADER_SIZE + length as usize;
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        self.buf.advance(HEADER_SIZE);
        let body = self.buf.split_to(length as usize).freeze();

        Ok(Some(ResponseFrame {
            params,
            opcode,
            body,
        }))
    }

    /// Bytes held back because they do not form a complete frame yet.
    pub fn residual(&self) -> &[u8] {
        &self.buf
    }
}

/// Reads exactly one response frame from the socket.
///
/// Used during the handshake, before the connection switches to buffered,
/// multiplexed reads.
pub async fn read_response(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<ResponseFrame, FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let (params, opcode, length) = parse_response_header(&raw_header[..])?;

    let mut raw_body = vec![0u8; length as usize];
    reader.read_exact(&mut raw_body[..]).await?;

    Ok(ResponseFrame {
        params,
        opcode,
        body: raw_body.into(),
    })
}

/// A fully encoded request frame whose stream id can still be patched.
///
/// Requests are serialized once, when submitted; the stream id is assigned
/// later by the dispatcher, right before the frame hits the socket.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(req: &R) -> Result<Self, ParseError> {
        let mut data = vec![0; HEADER_SIZE];
        req.serialize(&mut data)?;

        data[0] = REQUEST_VERSION;
        data[1] = 0x00;
        // Stream id is left zeroed; `set_stream` assigns it.
        data[4] = R::OPCODE as u8;

        let body_size = (data.len() - HEADER_SIZE) as u32;
        data[5..9].copy_from_slice(&body_size.to_be_bytes());

        Ok(Self { data })
    }

    /// Accepts a frame that the caller encoded themselves.
    ///
    /// The header is validated so that `set_stream` patches real header bytes
    /// and not the middle of someone's body.
    pub fn from_bytes(frame: Bytes) -> Result<Self, ParseError> {
        if frame.len() < HEADER_SIZE {
            return Err(ParseError::BadDataToSerialize(format!(
                "Encoded frame of {} bytes is shorter than the {} byte header",
                frame.len(),
                HEADER_SIZE
            )));
        }
        if frame[0] != REQUEST_VERSION {
            return Err(ParseError::BadDataToSerialize(format!(
                "Encoded frame has version {:#04x}, expected {:#04x}",
                frame[0], REQUEST_VERSION
            )));
        }
        let declared = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]) as usize;
        if declared != frame.len() - HEADER_SIZE {
            return Err(ParseError::BadDataToSerialize(format!(
                "Encoded frame declares a {} byte body but carries {} bytes",
                declared,
                frame.len() - HEADER_SIZE
            )));
        }

        Ok(Self {
            data: frame.to_vec(),
        })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn stream(&self) -> i16 {
        i16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn opcode(&self) -> u8 {
        self.data[4]
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data
    }
}
