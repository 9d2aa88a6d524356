use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;
use may::net::TcpStream;
use may::sync::Mutex;

use crate::frame::{self, Frame};
use crate::framed::{write_frame, FrameReader};
use crate::Error;

struct Conn {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Conn {
    fn dial(addrs: &[SocketAddr], timeout: Option<Duration>) -> Result<Conn, Error> {
        let stream = TcpStream::connect(addrs)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(timeout)?;
        let peer = stream.peer_addr()?;
        Ok(Conn { stream, peer })
    }

    fn close(self) {
        // the peer may already be gone
        self.stream.shutdown(Shutdown::Both).ok();
    }
}

struct Inner {
    conn: Option<Conn>,
    reader: FrameReader,
    timeout: Option<Duration>,
}

/// Tcp Client
///
/// owns one connection to a fixed address. concurrent callers are
/// serialized, there is at most one request in flight per client
pub struct Client {
    addrs: Vec<SocketAddr>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("addrs", &self.addrs)
            .field("peer", &self.peer_addr())
            .finish()
    }
}

impl Client {
    /// connect to the server address
    pub fn connect<L: ToSocketAddrs>(addr: L) -> Result<Client, Error> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(Error::Connection(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no address to connect to",
            )));
        }

        let conn = Conn::dial(&addrs, None).map_err(|e| {
            error!("{:?}: connect error: {e}", addrs);
            e
        })?;
        info!("{}: connected", conn.peer);

        Ok(Client {
            addrs,
            inner: Mutex::new(Inner {
                conn: Some(conn),
                reader: FrameReader::new(),
                timeout: None,
            }),
        })
    }

    fn lock(&self) -> may::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// set the read timeout for replies, `None` waits forever
    ///
    /// the value is kept across `reconnect`
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.timeout = timeout;
        if let Some(conn) = inner.conn.as_ref() {
            conn.stream.set_read_timeout(timeout)?;
        }
        Ok(())
    }

    /// set the max reply frame len
    pub fn set_max_frame_len(&self, max_len: usize) {
        self.lock().reader.set_max_frame_len(max_len);
    }

    /// the address of the connected server
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().conn.as_ref().map(|c| c.peer)
    }

    /// true if the client holds an open connection
    pub fn is_connected(&self) -> bool {
        self.lock().conn.is_some()
    }

    /// send `body` to `(service, method)` and wait for the correlated reply
    ///
    /// blocks while another request on this client is in flight. on any
    /// error the connection is in an undefined state, call `reconnect`
    pub fn request(&self, service: u32, method: u32, body: &[u8]) -> Result<Bytes, Error> {
        let mut guard = self.lock();
        let Inner { conn, reader, .. } = &mut *guard;
        let conn = conn.as_mut().ok_or(Error::NotConnected)?;

        let seq: u32 = rand::random();
        let data = frame::encode(service, method, seq, body)?;
        debug!("{}: request service={service} method={method} seq={seq}", conn.peer);

        if let Err(e) = write_frame(&mut conn.stream, &data) {
            error!("{}: write error: {e}", conn.peer);
            return Err(e);
        }

        let rsp = match reader.read_frame(&mut conn.stream) {
            Ok(Some(rsp)) => rsp,
            Ok(None) => {
                error!("{}: connection closed by peer", conn.peer);
                return Err(Error::Connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            Err(e) => {
                error!("{}: read error: {e}", conn.peer);
                return Err(e);
            }
        };

        if let Err(e) = check_reply(seq, &rsp) {
            error!("{}: {e}", conn.peer);
            return Err(e);
        }
        debug!("{}: get response seq={}", conn.peer, rsp.sequence);
        Ok(rsp.into_body())
    }

    /// release the connection, no-op if already closed
    pub fn close(&self) {
        let mut inner = self.lock();
        if let Some(conn) = inner.conn.take() {
            info!("{}: disconnected", conn.peer);
            conn.close();
        }
        inner.reader.reset();
    }

    /// close any existing connection and dial the same address again
    pub fn reconnect(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if let Some(conn) = inner.conn.take() {
            conn.close();
        }
        inner.reader.reset();

        let conn = Conn::dial(&self.addrs, inner.timeout).map_err(|e| {
            error!("{:?}: reconnect error: {e}", self.addrs);
            e
        })?;
        info!("{}: reconnected", conn.peer);
        inner.conn = Some(conn);
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// a reply must carry the request sequence + 1
pub(crate) fn check_reply(seq: u32, rsp: &Frame) -> Result<(), Error> {
    let expected = seq.wrapping_add(1);
    if rsp.sequence != expected {
        return Err(Error::Correlation {
            expected,
            actual: rsp.sequence,
        });
    }
    Ok(())
}
