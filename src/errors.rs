use std::io;

use thiserror::Error;

/// All errors that can occur during the use of vrpc.
#[derive(Debug, Error)]
pub enum Error {
    /// Dial, accept or peer-closed failures, and any other IO error.
    #[error("connection err: {0}")]
    Connection(#[from] io::Error),
    /// A read or write moved fewer bytes than requested.
    #[error("short {op}: {done} of {expected} bytes")]
    ShortIo {
        /// `"read"` or `"write"`
        op: &'static str,
        /// bytes actually transferred
        done: usize,
        /// bytes that should have been transferred
        expected: usize,
    },
    /// The header or its offsets are structurally invalid.
    #[error("invalid frame: {0}")]
    FrameValidation(String),
    /// The reply sequence is not the request sequence plus one.
    ///
    /// The connection is left in an undefined state, the caller should reconnect.
    #[error("sequence mismatched: expected {expected}, got {actual}")]
    Correlation {
        /// sequence the reply should carry
        expected: u32,
        /// sequence the reply carried
        actual: u32,
    },
    /// More bytes arrived than the frame header declared.
    #[error("body size mismatched: declared {declared}, received {received}")]
    Overrun {
        /// declared end offset of the frame
        declared: usize,
        /// bytes accumulated so far
        received: usize,
    },
    /// No handler is registered for the service/method pair.
    #[error("no handler for service {service} method {method}")]
    Routing {
        /// service id of the frame
        service: u32,
        /// method id of the frame
        method: u32,
    },
    /// The client has no open connection, call `reconnect` first.
    #[error("client is not connected")]
    NotConnected,
    /// The peer did not answer within the configured read timeout.
    #[error("the server was unable to reply within the timeout")]
    Timeout,
    /// A registered handler panicked while serving a frame.
    #[error("handler panicked: service {service} method {method}")]
    HandlerPanic {
        /// service id of the frame
        service: u32,
        /// method id of the frame
        method: u32,
    },
    /// Error in serializing a client request.
    #[error("serializing a client request err: {0}")]
    ClientSerialize(String),
    /// Error in deserializing a server response.
    #[error("deserializing a server response err: {0}")]
    ClientDeserialize(String),
    /// Error in deserializing a client request on the server.
    #[error("deserializing a client request err: {0}")]
    ServerDeserialize(String),
    /// Error in serializing a server response.
    #[error("serializing a server response err: {0}")]
    ServerSerialize(String),
}

impl Error {
    /// map a failed read, turning deadline expiry into `Timeout`
    pub(crate) fn from_read(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Connection(e),
        }
    }

    /// true when the error means the peer simply went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Connection(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
