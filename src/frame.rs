use std::fmt;

use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

// Frame layout, all integers little endian
// service(u32) + method(u32) + sequence(u32) + end(u32) + body([u8; end - 16])
//
// `end` is the offset one past the last body byte, not the body length.
// the header alone tells a reader how many more bytes belong to the frame

/// size of the fixed frame header
pub const HEADER_LEN: usize = 16;

/// default max frame len accepted by a reader
pub const FRAME_MAX_LEN: usize = 16 * 1024 * 1024;

/// the fixed header of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// service id
    pub service: u32,
    /// method id within the service
    pub method: u32,
    /// correlation number, a reply carries the request sequence + 1
    pub sequence: u32,
    /// declared end offset of the whole frame
    pub end: u32,
}

impl Header {
    /// parse the header from the start of `buf`, `None` if it's too short
    pub fn parse(buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Header {
            service: LittleEndian::read_u32(&buf[0..4]),
            method: LittleEndian::read_u32(&buf[4..8]),
            sequence: LittleEndian::read_u32(&buf[8..12]),
            end: LittleEndian::read_u32(&buf[12..16]),
        })
    }

    /// the declared frame end as an offset
    #[inline]
    pub fn end(&self) -> usize {
        self.end as usize
    }
}

/// cheap bounds check before trusting any offset in `buf`
///
/// false if `buf` is shorter than a header, or the declared end is not
/// within `[HEADER_LEN, buf.len()]`
pub fn validate(buf: &[u8]) -> bool {
    match Header::parse(buf) {
        Some(head) => HEADER_LEN <= head.end() && head.end() <= buf.len(),
        None => false,
    }
}

/// encode a frame into its wire representation
pub fn encode(service: u32, method: u32, sequence: u32, body: &[u8]) -> Result<Bytes, Error> {
    let len = HEADER_LEN + body.len();
    let end = u32::try_from(len).map_err(|_| {
        let s = format!("encode too big frame. len={len}");
        error!("{s}");
        Error::FrameValidation(s)
    })?;

    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32_le(service);
    buf.put_u32_le(method);
    buf.put_u32_le(sequence);
    buf.put_u32_le(end);
    buf.put_slice(body);
    debug!("encode frame: service={service} method={method} seq={sequence} len={len}");
    Ok(buf.freeze())
}

/// a decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// service id
    pub service: u32,
    /// method id
    pub method: u32,
    /// correlation number
    pub sequence: u32,
    body: Bytes,
}

impl Frame {
    /// create a frame from its parts
    pub fn new(service: u32, method: u32, sequence: u32, body: impl Into<Bytes>) -> Self {
        Frame {
            service,
            method,
            sequence,
            body: body.into(),
        }
    }

    /// decode a frame from a buffer holding exactly one frame
    ///
    /// the declared end must match `data.len()`, trailing bytes are rejected.
    /// the body is sliced out of `data` without copying
    pub fn decode(data: Bytes) -> Result<Self, Error> {
        if !validate(&data) {
            let s = format!("invalid frame layout. buf_len={}", data.len());
            warn!("{s}");
            return Err(Error::FrameValidation(s));
        }
        // validated above
        let head = match Header::parse(&data) {
            Some(head) => head,
            None => return Err(Error::FrameValidation("short header".to_owned())),
        };
        if head.end() != data.len() {
            let s = format!(
                "trailing bytes after frame. end={} buf_len={}",
                head.end(),
                data.len()
            );
            warn!("{s}");
            return Err(Error::FrameValidation(s));
        }
        Ok(Frame {
            service: head.service,
            method: head.method,
            sequence: head.sequence,
            body: data.slice(HEADER_LEN..head.end()),
        })
    }

    /// encode self into the wire representation
    pub fn encode(&self) -> Result<Bytes, Error> {
        encode(self.service, self.method, self.sequence, &self.body)
    }

    /// build the reply to this frame, same route and sequence + 1
    pub fn reply(&self, body: impl Into<Bytes>) -> Frame {
        Frame::new(
            self.service,
            self.method,
            self.sequence.wrapping_add(1),
            body,
        )
    }

    /// the payload
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// take the payload
    pub fn into_body(self) -> Bytes {
        self.body
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame {{ service: {}, method: {}, sequence: {}, body_len: {} }}",
            self.service,
            self.method,
            self.sequence,
            self.body.len()
        )
    }
}
