//! reassemble frames out of a byte stream, and write them back out
//!
//! a byte source may hand out data in arbitrary sized chunks. the reader
//! blocks for the fixed header first, then appends chunks until the declared
//! frame end is reached. there is no resync marker in the protocol, so any
//! error here means the stream can't be trusted anymore and the caller
//! must drop the connection.
use std::io::{ErrorKind, Read, Write};

use bytes::BytesMut;

use crate::frame::{Frame, Header, FRAME_MAX_LEN, HEADER_LEN};
use crate::Error;

// size of a single body read
const CHUNK_LEN: usize = 1024;

// most the buffer grows ahead of the body bytes actually received
const RESERVE_AHEAD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// need the fixed header
    AwaitHeader,
    /// header is in the buffer, need body bytes up to `end`
    AccumulateBody { end: usize },
    /// buffer holds exactly one frame
    FrameReady,
}

/// reassembles exactly one frame at a time from a byte source
#[derive(Debug)]
pub struct FrameReader {
    state: State,
    buf: BytesMut,
    chunk: Box<[u8]>,
    max_len: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        FrameReader::new()
    }
}

impl FrameReader {
    /// create a reader that accepts frames up to `FRAME_MAX_LEN`
    pub fn new() -> Self {
        FrameReader::with_max_frame_len(FRAME_MAX_LEN)
    }

    /// create a reader with a custom max frame len
    pub fn with_max_frame_len(max_len: usize) -> Self {
        FrameReader {
            state: State::AwaitHeader,
            buf: BytesMut::with_capacity(CHUNK_LEN * 4),
            chunk: vec![0u8; CHUNK_LEN].into_boxed_slice(),
            max_len,
        }
    }

    /// change the max accepted frame len
    pub fn set_max_frame_len(&mut self, max_len: usize) {
        self.max_len = max_len;
    }

    /// the max accepted frame len
    pub fn max_frame_len(&self) -> usize {
        self.max_len
    }

    /// drop any partially accumulated frame
    pub fn reset(&mut self) {
        self.state = State::AwaitHeader;
        self.buf.clear();
    }

    /// read the next frame from `r`
    ///
    /// returns `Ok(None)` when the peer closed the stream cleanly between
    /// two frames. every error is fatal for the underlying connection
    pub fn read_frame<R: Read>(&mut self, r: &mut R) -> Result<Option<Frame>, Error> {
        // a previous call may have failed half way
        self.reset();

        loop {
            match self.state {
                State::AwaitHeader => {
                    let mut head = [0u8; HEADER_LEN];
                    let n = read_full(r, &mut head)?;
                    if n == 0 {
                        return Ok(None);
                    }
                    if n < HEADER_LEN {
                        return Err(Error::ShortIo {
                            op: "read",
                            done: n,
                            expected: HEADER_LEN,
                        });
                    }
                    let end = match Header::parse(&head) {
                        Some(head) => head.end(),
                        None => return Err(Error::FrameValidation("short header".to_owned())),
                    };
                    if end < HEADER_LEN {
                        let s = format!("declared end inside header. end={end}");
                        warn!("{s}");
                        return Err(Error::FrameValidation(s));
                    }
                    if end > self.max_len {
                        let s = format!("decode too big frame length. len={end}");
                        error!("{s}");
                        return Err(Error::FrameValidation(s));
                    }
                    debug!("decode header: end={end}");

                    // the rest grows with the body chunks
                    self.buf.reserve(end.min(RESERVE_AHEAD));
                    self.buf.extend_from_slice(&head);
                    self.state = if end == HEADER_LEN {
                        State::FrameReady
                    } else {
                        State::AccumulateBody { end }
                    };
                }
                State::AccumulateBody { end } => {
                    let n = match r.read(&mut self.chunk) {
                        Ok(0) => {
                            return Err(Error::ShortIo {
                                op: "read",
                                done: self.buf.len(),
                                expected: end,
                            })
                        }
                        Ok(n) => n,
                        Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(Error::from_read(e)),
                    };
                    self.buf.extend_from_slice(&self.chunk[..n]);

                    let received = self.buf.len();
                    if received > end {
                        warn!("body size mismatched {received} > {end}");
                        return Err(Error::Overrun {
                            declared: end,
                            received,
                        });
                    }
                    if received == end {
                        self.state = State::FrameReady;
                    }
                }
                State::FrameReady => {
                    self.state = State::AwaitHeader;
                    let data = self.buf.split().freeze();
                    return Frame::decode(data).map(Some);
                }
            }
        }
    }
}

// fill `buf` as far as the source allows, returns the bytes read
// fewer than `buf.len()` only when the source hit EOF
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut done = 0;
    while done < buf.len() {
        match r.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::from_read(e)),
        }
    }
    Ok(done)
}

/// write a whole encoded frame to `w`
///
/// a writer that stops accepting bytes is reported as a short write
pub fn write_frame<W: Write>(w: &mut W, data: &[u8]) -> Result<(), Error> {
    let mut done = 0;
    while done < data.len() {
        match w.write(&data[done..]) {
            Ok(0) => {
                return Err(Error::ShortIo {
                    op: "write",
                    done,
                    expected: data.len(),
                })
            }
            Ok(n) => done += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Connection(e)),
        }
    }
    w.flush()?;
    Ok(())
}
