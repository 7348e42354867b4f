//! Services and their handler tables

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::host::{HostContext, HostError};
use crate::net::connection::Connection;
use crate::net::protocol::Message;

/// Remote-callable handler
pub type Handler = Arc<dyn Fn(&HostContext, &Message) -> anyhow::Result<()> + Send + Sync>;

/// A unit of behavior installed into a host
///
/// `kind()` is the short name used as the first field of every call aimed at
/// this service. Handlers are registered explicitly in `register`; hooks
/// default to no-ops.
pub trait Service: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn register(self: Arc<Self>, handlers: &mut HandlerSet);

    fn enable(&self, _ctx: &HostContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn disable(&self, _ctx: &HostContext) {}

    /// Called at the host tick rate
    fn tick(&self, _ctx: &HostContext) {}

    fn on_connect(&self, _ctx: &HostContext, _connection: &Arc<Connection>) {}

    fn on_disconnect(&self, _ctx: &HostContext, _connection: &Arc<Connection>) {}
}

/// Method name -> handler for one service
#[derive(Default, Clone)]
pub struct HandlerSet {
    handlers: HashMap<&'static str, Handler>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method`; a later registration of the same name replaces it
    pub fn on<F>(&mut self, method: &'static str, handler: F) -> &mut Self
    where
        F: Fn(&HostContext, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(method, Arc::new(handler));
        self
    }

    pub fn get(&self, method: &str) -> Option<&Handler> {
        self.handlers.get(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }
}

struct Installed {
    type_id: TypeId,
    service: Arc<dyn Service>,
    any: Arc<dyn Any + Send + Sync>,
    handlers: HandlerSet,
}

/// Installed services by kind, in install order
#[derive(Default)]
pub struct ServiceRegistry {
    by_kind: DashMap<&'static str, Arc<Installed>>,
    order: RwLock<Vec<Arc<Installed>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a service, rejecting a second instance of the same type or kind
    pub fn install<S: Service>(&self, service: Arc<S>) -> Result<Arc<dyn Service>, HostError> {
        let kind = service.kind();
        let type_id = TypeId::of::<S>();

        // Order lock serializes installs so the two checks and the insert agree
        let mut order = self.order.write();
        if order.iter().any(|s| s.type_id == type_id) {
            return Err(HostError::DuplicateService(std::any::type_name::<S>().to_string()));
        }
        if self.by_kind.contains_key(kind) {
            return Err(HostError::DuplicateService(kind.to_string()));
        }

        let mut handlers = HandlerSet::new();
        service.clone().register(&mut handlers);

        let installed = Arc::new(Installed {
            type_id,
            service: service.clone(),
            any: service,
            handlers,
        });
        self.by_kind.insert(kind, installed.clone());
        order.push(installed.clone());

        Ok(installed.service.clone())
    }

    /// Remove a service by kind
    pub fn uninstall(&self, kind: &str) -> Option<Arc<dyn Service>> {
        let mut order = self.order.write();
        let (_, installed) = self.by_kind.remove(kind)?;
        order.retain(|s| !Arc::ptr_eq(s, &installed));
        Some(installed.service.clone())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Service>> {
        self.by_kind.get(kind).map(|s| s.service.clone())
    }

    /// Typed lookup of an installed service
    pub fn find<S: Service>(&self) -> Option<Arc<S>> {
        self.order
            .read()
            .iter()
            .find(|s| s.type_id == TypeId::of::<S>())
            .and_then(|s| s.any.clone().downcast::<S>().ok())
    }

    pub fn handler(&self, kind: &str, method: &str) -> Option<Handler> {
        self.by_kind
            .get(kind)
            .and_then(|s| s.handlers.get(method).cloned())
    }

    /// Services in install order
    pub fn ordered(&self) -> Vec<Arc<dyn Service>> {
        self.order.read().iter().map(|s| s.service.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Service for Echo {
        fn kind(&self) -> &'static str {
            "Echo"
        }

        fn register(self: Arc<Self>, handlers: &mut HandlerSet) {
            handlers.on("Say", |_, _| Ok(())).on("Shout", |_, _| Ok(()));
        }
    }

    struct Impostor;

    impl Service for Impostor {
        fn kind(&self) -> &'static str {
            "Echo"
        }

        fn register(self: Arc<Self>, _handlers: &mut HandlerSet) {}
    }

    #[test]
    fn test_install_and_lookup() {
        let registry = ServiceRegistry::new();
        registry.install(Arc::new(Echo)).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("Echo").is_some());
        assert!(registry.handler("Echo", "Say").is_some());
        assert!(registry.handler("Echo", "Whisper").is_none());
        assert!(registry.handler("Missing", "Say").is_none());
        assert!(registry.find::<Echo>().is_some());
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let registry = ServiceRegistry::new();
        registry.install(Arc::new(Echo)).unwrap();
        assert!(matches!(
            registry.install(Arc::new(Echo)),
            Err(HostError::DuplicateService(_))
        ));
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let registry = ServiceRegistry::new();
        registry.install(Arc::new(Echo)).unwrap();
        assert!(registry.install(Arc::new(Impostor)).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_uninstall() {
        let registry = ServiceRegistry::new();
        registry.install(Arc::new(Echo)).unwrap();
        assert!(registry.uninstall("Echo").is_some());
        assert!(registry.is_empty());
        assert!(registry.find::<Echo>().is_none());

        // Kind is free again
        assert!(registry.install(Arc::new(Impostor)).is_ok());
    }

    #[test]
    fn test_handler_set_methods() {
        let mut set = HandlerSet::new();
        set.on("A", |_, _| Ok(())).on("B", |_, _| Ok(()));
        let mut methods: Vec<_> = set.methods().collect();
        methods.sort();
        assert_eq!(methods, vec!["A", "B"]);
    }
}
