use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use co_managed::Manager;
use may::net::{TcpListener, TcpStream};
use may::{coroutine, go};

use crate::connections::{ConnectionSet, LiveConn};
use crate::frame::{Frame, FRAME_MAX_LEN};
use crate::framed::{write_frame, FrameReader};
use crate::registry::{Handler, MethodRegistry};
use crate::Error;

macro_rules! t {
    ($e: expr) => {
        match $e {
            Ok(val) => val,
            Err(err) => {
                error!("call = {:?}\nerr = {:?}", stringify!($e), err);
                continue;
            }
        }
    };
}

/// service instance
pub struct ServerInstance {
    handle: Option<coroutine::JoinHandle<()>>,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    conns: Arc<ConnectionSet>,
}

impl ServerInstance {
    /// the address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// join the service, this would wait until the service is stopped
    pub fn join(mut self) -> std::thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

impl ServerInstance {
    // an address that reaches the listener, even when bound to a wildcard
    fn wake_addr(&self) -> SocketAddr {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        addr
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        let s = match self.handle.take() {
            Some(s) => s,
            None => return,
        };
        // the accept loop must return by itself, cancelling it would drop the
        // worker manager inside the unwind and never finish
        self.stop.store(true, Ordering::Release);
        self.conns.shutdown_all();
        match TcpStream::connect(self.wake_addr()) {
            Ok(_) => {}
            Err(e) => {
                error!("wake accept loop on {} failed, err={e}", self.local_addr);
                unsafe { s.coroutine().cancel() };
            }
        }
        s.join().ok();
    }
}

/// Tcp Server
///
/// routes each frame to the handler registered for its `(service, method)`
/// and writes the handler output back as the reply
pub struct Server {
    registry: Arc<MethodRegistry>,
    conns: Arc<ConnectionSet>,
    max_frame_len: usize,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    /// create a server with an empty registry
    pub fn new() -> Self {
        Server::with_max_frame_len(FRAME_MAX_LEN)
    }

    /// create a server that drops connections sending frames longer than `max_len`
    pub fn with_max_frame_len(max_len: usize) -> Self {
        Server {
            registry: Arc::new(MethodRegistry::new()),
            conns: Arc::new(ConnectionSet::new()),
            max_frame_len: max_len,
        }
    }

    /// register `f` for `(service, method)`, replacing any previous handler
    pub fn register<F>(&self, service: u32, method: u32, f: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |req: &[u8]| Ok::<_, Error>(f(req)));
        self.registry.register(service, method, handler);
    }

    /// register a handler that may fail, a failure drops the connection
    pub fn register_handler(&self, service: u32, method: u32, handler: Handler) {
        self.registry.register(service, method, handler);
    }

    /// remove the handler for `(service, method)` if any
    pub fn unregister(&self, service: u32, method: u32) {
        self.registry.unregister(service, method);
    }

    /// the method registry
    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// number of live connections
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// close every live connection
    ///
    /// this does not stop accepting, drop the `ServerInstance` for that
    pub fn shutdown(&self) {
        let n = self.conns.shutdown_all();
        info!("server shutdown, closed {n} connections");
    }

    fn acceptor(&self) -> Acceptor {
        Acceptor {
            registry: self.registry.clone(),
            conns: self.conns.clone(),
            max_frame_len: self.max_frame_len,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// bind to `addr` and accept connections in the current context
    ///
    /// only returns if binding fails, accept errors are logged and skipped
    pub fn serve<L: ToSocketAddrs>(&self, addr: L) -> Result<(), Error> {
        let listener = TcpListener::bind(addr)?;
        info!("listening on {}", listener.local_addr()?);
        self.acceptor().run(listener);
        Ok(())
    }

    /// Spawns the service, binding to the given address
    /// return an instance that stops accepting when dropped
    pub fn start<L: ToSocketAddrs>(&self, addr: L) -> io::Result<ServerInstance> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!("listening on {local_addr}");
        let acceptor = self.acceptor();
        let stop = acceptor.stop.clone();
        let handle = go!(
            coroutine::Builder::new().name("TcpServer".to_owned()),
            move || acceptor.run(listener)
        )?;
        Ok(ServerInstance {
            handle: Some(handle),
            local_addr,
            stop,
            conns: self.conns.clone(),
        })
    }
}

// everything the accept loop and its workers share with the server
struct Acceptor {
    registry: Arc<MethodRegistry>,
    conns: Arc<ConnectionSet>,
    max_frame_len: usize,
    // set by `ServerInstance::drop`, checked after every accept
    stop: Arc<AtomicBool>,
}

impl Acceptor {
    fn run(self, listener: TcpListener) {
        // workers left over at return are cancelled with the manager
        let manager = Manager::new();
        for stream in listener.incoming() {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let stream = t!(stream);
            t!(stream.set_nodelay(true));
            let live = t!(self.conns.insert(&stream));
            let registry = self.registry.clone();
            let max_frame_len = self.max_frame_len;
            manager.add(move || run_conn(stream, live, &registry, max_frame_len));
        }
        self.conns.shutdown_all();
        info!("stop accepting on {:?}", listener.local_addr());
    }
}

fn run_conn(mut stream: TcpStream, live: LiveConn, registry: &MethodRegistry, max_frame_len: usize) {
    let peer = match live.peer() {
        Some(addr) => addr.to_string(),
        None => format!("conn#{}", live.id()),
    };
    info!("{peer}: connected");

    let mut reader = FrameReader::with_max_frame_len(max_frame_len);
    match serve_conn(&mut stream, &mut reader, registry) {
        Ok(()) => info!("{peer}: disconnected"),
        Err(ref e) if e.is_disconnect() => info!("{peer}: disconnected, {e}"),
        Err(e) => warn!("{peer}: drop connection, {e}"),
    }

    stream.shutdown(Shutdown::Both).ok();
    // untrack only after the socket is closed
    drop(live);
}

/// run the read, dispatch, reply cycle until the peer leaves
///
/// returns `Ok` on a clean close, every error is fatal for the connection
pub(crate) fn serve_conn<S: Read + Write>(
    stream: &mut S,
    reader: &mut FrameReader,
    registry: &MethodRegistry,
) -> Result<(), Error> {
    loop {
        let req = match reader.read_frame(stream)? {
            Some(req) => req,
            None => return Ok(()),
        };
        debug!("get request: {req}");

        let rsp = dispatch(registry, &req)?;
        let data = rsp.encode()?;
        write_frame(stream, &data)?;
        debug!("send rsp: seq={} len={}", rsp.sequence, data.len());
    }
}

/// route `req` to its handler and build the reply frame
pub(crate) fn dispatch(registry: &MethodRegistry, req: &Frame) -> Result<Frame, Error> {
    let (service, method) = (req.service, req.method);
    let handler = registry.route(service, method).map_err(|e| {
        warn!("unknown service {service} method {method}");
        e
    })?;

    let body = match panic::catch_unwind(AssertUnwindSafe(|| handler(req.body()))) {
        Ok(ret) => ret?,
        Err(_) => {
            error!("rpc panicked in server! service={service} method={method}");
            return Err(Error::HandlerPanic { service, method });
        }
    };
    Ok(req.reply(body))
}
