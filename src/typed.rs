//! typed payloads on top of the raw `bytes -> bytes` contract
//!
//! request and reply bodies are `bincode` encoded. any serde type can be
//! used as an argument or a return value
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::registry::Handler;
use crate::{Client, Error, Server};

/// wrap a typed function into a raw handler
pub fn typed_handler<Req, Rsp, F>(f: F) -> Handler
where
    Req: DeserializeOwned + 'static,
    Rsp: Serialize + 'static,
    F: Fn(Req) -> Rsp + Send + Sync + 'static,
{
    Arc::new(move |req: &[u8]| {
        // deserialize the request
        let req: Req =
            bincode::deserialize(req).map_err(|e| Error::ServerDeserialize(e.to_string()))?;
        let rsp = f(req);
        // serialize the result
        bincode::serialize(&rsp).map_err(|e| Error::ServerSerialize(e.to_string()))
    })
}

impl Server {
    /// register a typed handler for `(service, method)`
    ///
    /// a request that can't be decoded drops the connection
    pub fn register_typed<Req, Rsp, F>(&self, service: u32, method: u32, f: F)
    where
        Req: DeserializeOwned + 'static,
        Rsp: Serialize + 'static,
        F: Fn(Req) -> Rsp + Send + Sync + 'static,
    {
        self.register_handler(service, method, typed_handler(f));
    }
}

impl Client {
    /// call a typed handler registered with `Server::register_typed`
    pub fn call<Req, Rsp>(&self, service: u32, method: u32, req: &Req) -> Result<Rsp, Error>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        // serialize the para
        let body = bincode::serialize(req).map_err(|e| Error::ClientSerialize(e.to_string()))?;
        // call the server
        let rsp = self.request(service, method, &body)?;
        // deserialized the response
        bincode::deserialize(&rsp).map_err(|e| Error::ClientDeserialize(e.to_string()))
    }
}
