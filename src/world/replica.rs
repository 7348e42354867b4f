//! Client-side mirror of replicated entities
//!
//! The authority drives these calls from the registry and the map tick.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;

use crate::host::service::{HandlerSet, Service};
use crate::net::protocol::{HandlerRef, Message};
use crate::world::component::{decode_component, Transform};
use crate::world::entity::EntityId;
use crate::world::registry::Registry;

pub const REPLICA_KIND: &str = "Replica";

/// `(entity)`
pub const SPAWN: HandlerRef = HandlerRef::new(REPLICA_KIND, "Spawn");
/// `(entity)`
pub const DESPAWN: HandlerRef = HandlerRef::new(REPLICA_KIND, "Despawn");
/// `(entity, component kind, fields...)`
pub const UPDATE: HandlerRef = HandlerRef::new(REPLICA_KIND, "Update");
/// `(entity, transform fields...)`: last accepted placement after a rejected move
pub const RUBBER_BAND: HandlerRef = HandlerRef::new(REPLICA_KIND, "RubberBand");
/// `(map name, instance)`
pub const ENTERED_MAP: HandlerRef = HandlerRef::new(REPLICA_KIND, "EnteredMap");

fn entity_arg(msg: &Message) -> anyhow::Result<EntityId> {
    let raw = msg.arg(0).ok_or_else(|| anyhow!("missing entity id"))?;
    EntityId::parse_str(raw).with_context(|| format!("bad entity id '{}'", raw))
}

pub struct ReplicaService {
    registry: Arc<Registry>,
    current_map: Mutex<Option<(String, u32)>>,
    last_rubber_band: Mutex<Option<(EntityId, Transform)>>,
}

impl ReplicaService {
    pub fn new(registry: Arc<Registry>) -> Self {
        registry.register_component::<Transform>();
        Self {
            registry,
            current_map: Mutex::new(None),
            last_rubber_band: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Map name and instance the authority last placed us on
    pub fn current_map(&self) -> Option<(String, u32)> {
        self.current_map.lock().clone()
    }

    pub fn last_rubber_band(&self) -> Option<(EntityId, Transform)> {
        *self.last_rubber_band.lock()
    }

    fn spawn(&self, msg: &Message) -> anyhow::Result<()> {
        let id = entity_arg(msg)?;
        if !self.registry.contains(id) {
            self.registry.create_entity(Some(id))?;
        }
        Ok(())
    }

    fn update(&self, msg: &Message) -> anyhow::Result<()> {
        let id = entity_arg(msg)?;
        let kind = msg.arg(1).ok_or_else(|| anyhow!("update without component kind"))?;
        if !self.registry.contains(id) {
            // Datagrams may overtake the reliable spawn
            return Ok(());
        }
        self.registry
            .apply_remote(id, kind, msg.sent_at(), &msg.args()[2..])?;
        Ok(())
    }

    fn rubber_band(&self, msg: &Message) -> anyhow::Result<()> {
        let id = entity_arg(msg)?;
        let transform = decode_component(&Transform::default(), &msg.args()[1..])?;
        if self.registry.contains(id) {
            self.registry
                .apply_defaults(id, "Transform", &msg.args()[1..])?;
        }
        *self.last_rubber_band.lock() = Some((id, transform));
        Ok(())
    }

    fn entered_map(&self, msg: &Message) -> anyhow::Result<()> {
        let name = msg.arg(0).ok_or_else(|| anyhow!("missing map name"))?;
        let instance: u32 = msg
            .arg(1)
            .ok_or_else(|| anyhow!("missing map instance"))?
            .parse()?;
        *self.current_map.lock() = Some((name.to_string(), instance));
        Ok(())
    }
}

impl Service for ReplicaService {
    fn kind(&self) -> &'static str {
        REPLICA_KIND
    }

    fn register(self: Arc<Self>, handlers: &mut HandlerSet) {
        let this = self.clone();
        handlers.on(SPAWN.method, move |_, msg| this.spawn(msg));
        let this = self.clone();
        handlers.on(DESPAWN.method, move |_, msg| {
            this.registry.revoke(entity_arg(msg)?);
            Ok(())
        });
        let this = self.clone();
        handlers.on(UPDATE.method, move |_, msg| this.update(msg));
        let this = self.clone();
        handlers.on(RUBBER_BAND.method, move |_, msg| this.rubber_band(msg));
        let this = self;
        handlers.on(ENTERED_MAP.method, move |_, msg| this.entered_map(msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContext;
    use crate::log::LogSink;
    use crate::metrics::Metrics;
    use crate::net::connection::{Connection, ConnectionRole, ConnectionSet};
    use crate::net::protocol::{format_call, Timestamp, Transport};
    use crate::net::session::ConnectionIdentity;
    use crate::util::vec3::Vec3;
    use crate::world::component::encode_component;
    use crate::world::registry::RegistryRole;
    use std::time::Instant;

    fn setup() -> (Arc<HostContext>, Arc<ReplicaService>, Arc<Connection>) {
        let ctx = HostContext::detached(ConnectionRole::Proxy);
        let registry = Arc::new(Registry::new(
            RegistryRole::Replica,
            Arc::new(ConnectionSet::new()),
            Arc::new(ConnectionIdentity),
            LogSink::default(),
            Arc::new(Metrics::new()),
        ));
        let service = Arc::new(ReplicaService::new(registry));
        ctx.install_service(service.clone()).unwrap();
        (ctx, service, Arc::new(Connection::detached(ConnectionRole::Proxy)))
    }

    fn deliver(ctx: &HostContext, conn: &Arc<Connection>, handler: HandlerRef, at: u64, args: &[String]) -> bool {
        let text = format_call(handler, Timestamp(at), args).unwrap();
        let msg = Message::parse(&text, conn.clone(), Transport::Reliable, Instant::now()).unwrap();
        ctx.dispatch().dispatch(ctx, &msg)
    }

    fn update_args(id: EntityId, x: f32) -> Vec<String> {
        let mut args = vec![id.to_string(), "Transform".to_string()];
        args.extend(encode_component(&Transform::at(Vec3::new(x, 0.0, 0.0))));
        args
    }

    #[test]
    fn test_spawn_update_despawn() {
        let (ctx, service, conn) = setup();
        let id = EntityId::new_v4();

        assert!(deliver(&ctx, &conn, SPAWN, 1, &[id.to_string()]));
        assert!(service.registry().contains(id));

        assert!(deliver(&ctx, &conn, UPDATE, 20, &update_args(id, 4.0)));
        // Older datagram arriving late
        assert!(deliver(&ctx, &conn, UPDATE, 10, &update_args(id, 1.0)));
        let t = service.registry().get_component::<Transform>(id).unwrap();
        assert_eq!(t.position.x, 4.0);

        assert!(deliver(&ctx, &conn, DESPAWN, 30, &[id.to_string()]));
        assert!(!service.registry().contains(id));
    }

    #[test]
    fn test_update_before_spawn_is_ignored() {
        let (ctx, service, conn) = setup();
        let id = EntityId::new_v4();
        assert!(deliver(&ctx, &conn, UPDATE, 5, &update_args(id, 1.0)));
        assert!(!service.registry().contains(id));
    }

    #[test]
    fn test_rubber_band_and_entered_map() {
        let (ctx, service, conn) = setup();
        let id = EntityId::new_v4();
        deliver(&ctx, &conn, SPAWN, 1, &[id.to_string()]);

        let mut args = vec![id.to_string()];
        args.extend(encode_component(&Transform::at(Vec3::new(7.0, 8.0, 0.0))));
        assert!(deliver(&ctx, &conn, RUBBER_BAND, 2, &args));
        let (who, t) = service.last_rubber_band().unwrap();
        assert_eq!(who, id);
        assert_eq!(t.position, Vec3::new(7.0, 8.0, 0.0));
        assert_eq!(service.registry().get_component::<Transform>(id).unwrap().position.y, 8.0);

        assert!(deliver(&ctx, &conn, ENTERED_MAP, 3, &["arena".to_string(), "2".to_string()]));
        assert_eq!(service.current_map(), Some(("arena".to_string(), 2)));
    }

    #[test]
    fn test_malformed_calls_fail() {
        let (ctx, _, conn) = setup();
        assert!(!deliver(&ctx, &conn, SPAWN, 1, &["nope".to_string()]));
        assert!(!deliver(&ctx, &conn, ENTERED_MAP, 1, &["arena".to_string(), "x".to_string()]));
    }
}
