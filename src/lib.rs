//! vrpc is a minimal request/response RPC transport over raw TCP, based on coroutines.
//!
//! the general communication procedure is as below
//! 1. client send a request frame to server
//! 2. server reassemble the frame from the stream
//! 3. server route the frame to the handler registered for its `(service, method)`
//! 4. server send out the handler output as the reply frame
//! 5. client recv the reply and check it carries the request sequence + 1
//!
//! Frame layout, all integers little endian:
//!
//! | field    | offset | size | meaning                               |
//! |----------|--------|------|---------------------------------------|
//! | service  | 0      | 4    | service identifier                    |
//! | method   | 4      | 4    | method identifier                     |
//! | sequence | 8      | 4    | correlation number                    |
//! | end      | 12     | 4    | end offset of the frame (header+body) |
//! | body     | 16     | ..   | opaque payload                        |
//!
//! there is exactly one request in flight per connection, no pipelining.
//!
//! Example usage:
//!
//! ```no_run
//! use vrpc::{Client, Server};
//!
//! let server = Server::new();
//! server.register(7, 3, |req| req.to_ascii_uppercase());
//! let _instance = server.start("127.0.0.1:4000").unwrap();
//!
//! let client = Client::connect("127.0.0.1:4000").unwrap();
//! let rsp = client.request(7, 3, b"hello").unwrap();
//! assert_eq!(&rsp[..], b"HELLO");
//! ```

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub use client::Client;
pub use connections::{ConnectionSet, LiveConn};
pub use errors::Error;
pub use frame::{encode, validate, Frame, Header, FRAME_MAX_LEN, HEADER_LEN};
pub use framed::{write_frame, FrameReader};
pub use registry::{Handler, MethodRegistry};
pub use server::{Server, ServerInstance};
pub use typed::typed_handler;

// re-export may for coroutine config and spawning
pub use may;

/// Provides the client
mod client;
/// live connection tracking
mod connections;
/// Provides a few different error types
mod errors;
/// raw frame protocol
mod frame;
/// frame reassembly over byte streams
mod framed;
/// routing table
mod registry;
/// Provides server framework
mod server;
/// bincode payloads
mod typed;
