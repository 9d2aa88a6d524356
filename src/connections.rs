use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use may::net::TcpStream;
use may::sync::Mutex;

struct Entry {
    peer: Option<SocketAddr>,
    // a clone of the worker's stream, only used to shut it down
    stream: TcpStream,
}

/// the live connections of a server, indexed by a generated id
pub struct ConnectionSet {
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, Entry>>,
}

impl Default for ConnectionSet {
    fn default() -> Self {
        ConnectionSet::new()
    }
}

impl ConnectionSet {
    /// create an empty set
    pub fn new() -> Self {
        ConnectionSet {
            next_id: AtomicU64::new(0),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// track `stream`, the returned guard untracks it when dropped
    pub fn insert(self: &Arc<Self>, stream: &TcpStream) -> io::Result<LiveConn> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer_addr().ok();
        let entry = Entry {
            peer,
            stream: stream.try_clone()?,
        };
        self.conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, entry);
        Ok(LiveConn {
            id,
            peer,
            set: self.clone(),
        })
    }

    fn remove(&self, id: u64) {
        self.conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// number of tracked connections
    pub fn len(&self) -> usize {
        self.conns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// true if no connection is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// shut down every tracked connection, returns how many were closed
    ///
    /// the workers notice the closed stream and untrack themselves
    pub fn shutdown_all(&self) -> usize {
        let conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        for (id, entry) in conns.iter() {
            if let Err(e) = entry.stream.shutdown(Shutdown::Both) {
                warn!("shutdown conn {id} ({:?}) failed, err={e}", entry.peer);
            }
        }
        conns.len()
    }
}

/// a tracked connection, owned by its worker
pub struct LiveConn {
    id: u64,
    peer: Option<SocketAddr>,
    set: Arc<ConnectionSet>,
}

impl LiveConn {
    /// the generated connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// the peer address, if the socket still knew it on accept
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Drop for LiveConn {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}
