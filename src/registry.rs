use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use may::sync::RwLock;

use crate::Error;

/// a registered handler, shared between all connection workers
///
/// plain `bytes -> bytes` handlers never fail, the error path is used by the
/// typed layer when a payload can't be decoded or encoded
pub type Handler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, Error> + Send + Sync + 'static>;

/// maps `(service, method)` to a handler
///
/// read concurrently by every worker, mutated by register/unregister
pub struct MethodRegistry {
    methods: RwLock<HashMap<(u32, u32), Handler>>,
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods = self.methods.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<_> = methods.keys().collect();
        keys.sort();
        f.debug_struct("MethodRegistry")
            .field("methods", &keys)
            .finish()
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        MethodRegistry::new()
    }
}

impl MethodRegistry {
    /// create an empty registry
    pub fn new() -> Self {
        MethodRegistry {
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// insert or overwrite the handler for the route, returns the replaced one
    pub fn register(&self, service: u32, method: u32, handler: Handler) -> Option<Handler> {
        let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
        let old = methods.insert((service, method), handler);
        if old.is_some() {
            info!("replace handler: service={service} method={method}");
        } else {
            info!("register handler: service={service} method={method}");
        }
        old
    }

    /// remove the handler for the route if present
    pub fn unregister(&self, service: u32, method: u32) -> Option<Handler> {
        let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
        let old = methods.remove(&(service, method));
        if old.is_some() {
            info!("unregister handler: service={service} method={method}");
        }
        old
    }

    /// look up the handler for the route
    ///
    /// the handler is cloned out so it can run without holding the lock
    pub fn get(&self, service: u32, method: u32) -> Option<Handler> {
        let methods = self.methods.read().unwrap_or_else(|e| e.into_inner());
        methods.get(&(service, method)).cloned()
    }

    /// look up the handler, a missing route is a routing error
    pub fn route(&self, service: u32, method: u32) -> Result<Handler, Error> {
        self.get(service, method)
            .ok_or(Error::Routing { service, method })
    }

    /// number of registered routes
    pub fn len(&self) -> usize {
        self.methods.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// true if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
