//! Dispatch table: `kind.method` -> handler
//!
//! Resolution goes through the service registry on the first call for a key
//! and is cached afterwards; the same key always yields the same handler.

use dashmap::DashMap;

use crate::host::service::{Handler, ServiceRegistry};
use crate::host::{guarded, HostContext};
use crate::log::LogSink;
use crate::metrics::Metrics;
use crate::net::protocol::{dispatch_key, Message};

pub struct DispatchTable {
    cache: DashMap<String, Handler>,
    log: LogSink,
}

impl DispatchTable {
    pub fn new(log: LogSink) -> Self {
        Self {
            cache: DashMap::new(),
            log,
        }
    }

    /// Find the handler for `kind.method`, caching a hit
    pub fn resolve(&self, services: &ServiceRegistry, kind: &str, method: &str) -> Option<Handler> {
        let key = dispatch_key(kind, method);
        if let Some(handler) = self.cache.get(&key) {
            return Some(handler.clone());
        }

        let handler = services.handler(kind, method)?;
        // A racing resolve may have inserted first; keep whichever landed
        let entry = self.cache.entry(key).or_insert(handler);
        Some(entry.value().clone())
    }

    /// Drop cached handlers of one service kind
    pub fn invalidate(&self, kind: &str) {
        let prefix = format!("{}.", kind);
        self.cache.retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Invoke the handler for `message`
    ///
    /// Returns false when nothing handled it: no handler, an error, or a panic.
    pub fn dispatch(&self, ctx: &HostContext, message: &Message) -> bool {
        let Some(handler) = self.resolve(ctx.services(), message.kind(), message.method()) else {
            Metrics::incr(&ctx.metrics().dispatch_misses);
            self.log.warn(format_args!(
                "No handler for {} from {}; dropped",
                message.dispatch_key(),
                message.connection().id()
            ));
            return false;
        };

        let key = message.dispatch_key();
        match guarded(&self.log, &key, || handler(ctx, message)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                Metrics::incr(&ctx.metrics().handler_failures);
                self.log.error(format_args!("{} failed: {:#}", key, e));
                false
            }
            None => {
                Metrics::incr(&ctx.metrics().handler_failures);
                false
            }
        }
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("cached", &self.cache.len())
            .finish()
    }
}
