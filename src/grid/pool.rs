//! Map instances, the worker pool that ticks them, and the `World` service
//!
//! Only maps with clients or queued requests are ticked. Their ticks run on a
//! rayon pool sized to `min(active maps, max workers)`; the pool is rebuilt
//! when that size changes.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::grid::map::{DespawnRequest, Map, MapKey};
use crate::grid::movement::MoveOrigin;
use crate::host::service::{HandlerSet, Service};
use crate::host::HostContext;
use crate::log::LogSink;
use crate::metrics::Metrics;
use crate::net::connection::{Connection, ConnectionId};
use crate::net::protocol::HandlerRef;
use crate::persistence::{EntitySaveRecord, MapDefinition, Persistence, PersistenceError, PersistenceExt};
use crate::world::component::{decode_component, Transform};
use crate::world::entity::EntityId;
use crate::world::registry::Registry;
use crate::world::replica::ENTERED_MAP;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Unknown map {0}")]
    UnknownMap(MapKey),
    #[error("Entity {0} is not on a map")]
    NotOnMap(EntityId),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

pub struct MapPool {
    maps: DashMap<MapKey, Arc<Map>>,
    directory: DashMap<EntityId, MapKey>,
    registry: Arc<Registry>,
    workers: Mutex<Option<(usize, rayon::ThreadPool)>>,
    max_workers: usize,
    log: LogSink,
    metrics: Arc<Metrics>,
}

impl MapPool {
    pub fn new(registry: Arc<Registry>, max_workers: usize, log: LogSink, metrics: Arc<Metrics>) -> Self {
        Self {
            maps: DashMap::new(),
            directory: DashMap::new(),
            registry,
            workers: Mutex::new(None),
            max_workers: max_workers.max(1),
            log,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn add_map(&self, map: Map) -> Arc<Map> {
        let map = Arc::new(map);
        if self.maps.insert(map.key().clone(), map.clone()).is_some() {
            self.log.warn(format_args!("Map {} replaced", map.key()));
        }
        map
    }

    /// Create every instance of a stored map
    pub fn load_definition(
        &self,
        definition: &MapDefinition,
        persistence: &dyn Persistence,
    ) -> Result<Vec<MapKey>, PersistenceError> {
        let mut keys = Vec::with_capacity(definition.instances as usize);
        for instance in 0..definition.instances {
            let map = Map::from_definition(
                definition,
                instance,
                persistence,
                self.registry.clone(),
                self.log.child("map"),
                self.metrics.clone(),
            )?;
            keys.push(self.add_map(map).key().clone());
        }
        Ok(keys)
    }

    pub fn map(&self, key: &MapKey) -> Option<Arc<Map>> {
        self.maps.get(key).map(|m| m.value().clone())
    }

    pub fn keys(&self) -> Vec<MapKey> {
        self.maps.iter().map(|m| m.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Map an entity was last sent to
    pub fn map_of(&self, entity: EntityId) -> Option<MapKey> {
        self.directory.get(&entity).map(|k| k.value().clone())
    }

    /// Tick every map with work; returns how many actually ran
    pub fn tick_active(&self, now: Instant) -> usize {
        let active: Vec<Arc<Map>> = self
            .maps
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.value().clone())
            .collect();
        self.metrics
            .maps_active
            .store(active.len() as u64, std::sync::atomic::Ordering::Relaxed);
        if active.is_empty() {
            return 0;
        }

        let wanted = active.len().min(self.max_workers);
        let mut workers = self.workers.lock();
        if workers.as_ref().map(|(size, _)| *size) != Some(wanted) {
            *workers = match rayon::ThreadPoolBuilder::new()
                .num_threads(wanted)
                .thread_name(|i| format!("map-worker-{}", i))
                .build()
            {
                Ok(pool) => {
                    self.log.debug(format_args!("Map worker pool resized to {}", wanted));
                    Some((wanted, pool))
                }
                Err(e) => {
                    self.log.warn(format_args!("Map worker pool unavailable: {}", e));
                    None
                }
            };
        }

        match workers.as_ref() {
            Some((_, pool)) => pool.install(|| active.par_iter().filter(|m| m.tick(now)).count()),
            None => active.iter().filter(|m| m.tick(now)).count(),
        }
    }

    /// Apply every queued request on every map now
    pub fn flush(&self) {
        for map in self.maps.iter() {
            map.flush();
        }
    }

    /// Move `entity` onto `key` at `transform`
    ///
    /// Leaving the previous map strips the client's subscriptions there
    /// (except to itself). The client is told where it landed.
    pub fn enter_map(&self, entity: EntityId, key: &MapKey, transform: Transform) -> Result<(), PoolError> {
        let target = self.map(key).ok_or_else(|| PoolError::UnknownMap(key.clone()))?;
        let client = self.registry.connections().contains(entity);

        match self.map_of(entity) {
            Some(current) if &current == key => {
                target.request_move(entity, transform, MoveOrigin::Server);
                return Ok(());
            }
            Some(current) => {
                if let Some(old) = self.map(&current) {
                    old.request_despawn(DespawnRequest {
                        entity,
                        strip: true,
                        revoke: false,
                    });
                }
            }
            None => {}
        }

        target.request_spawn(entity, transform, client);
        target.request_move(entity, transform, MoveOrigin::Server);
        self.directory.insert(entity, key.clone());

        if let Some(conn) = self.registry.connections().get(entity) {
            if let Err(e) = conn.send(ENTERED_MAP, &[key.name.clone(), key.instance.to_string()]) {
                self.log.debug(format_args!("EnteredMap for {} not sent: {}", entity, e));
            }
        }
        self.log.debug(format_args!("{} entering {}", entity, key));
        Ok(())
    }

    /// Take `entity` off its map, optionally revoking it afterwards
    ///
    /// An entity on no map is revoked directly when asked to.
    pub fn exit_map(&self, entity: EntityId, revoke: bool) -> bool {
        let map = self
            .directory
            .remove(&entity)
            .and_then(|(_, key)| self.map(&key));
        match map {
            Some(map) => {
                map.request_despawn(DespawnRequest {
                    entity,
                    strip: true,
                    revoke,
                });
                true
            }
            None => {
                if revoke {
                    self.registry.unsubscribe_all(entity);
                    self.registry.revoke(entity);
                }
                false
            }
        }
    }

    /// Queue a move on whichever map holds `entity`
    pub fn request_move(&self, entity: EntityId, to: Transform, origin: MoveOrigin) -> Result<(), PoolError> {
        let key = self.map_of(entity).ok_or(PoolError::NotOnMap(entity))?;
        let map = self.map(&key).ok_or(PoolError::UnknownMap(key))?;
        map.request_move(entity, to, origin);
        Ok(())
    }
}

// ============================================================================
// World service
// ============================================================================

pub const WORLD_KIND: &str = "World";

/// Client -> authority: `(transform fields...)` for the caller's own entity
pub const MOVE: HandlerRef = HandlerRef::new(WORLD_KIND, "Move");
/// Client -> authority: `(map name, instance)`
pub const ENTER: HandlerRef = HandlerRef::new(WORLD_KIND, "Enter");

/// Places every connection's entity on a map and routes client movement
pub struct WorldService {
    pool: Arc<MapPool>,
    persistence: Arc<dyn Persistence>,
    default_map: MapKey,
}

impl WorldService {
    pub fn new(pool: Arc<MapPool>, persistence: Arc<dyn Persistence>, default_map: MapKey) -> Self {
        Self {
            pool,
            persistence,
            default_map,
        }
    }

    pub fn pool(&self) -> &Arc<MapPool> {
        &self.pool
    }

    /// Saved placement if its map still exists, else the default spawn point
    fn starting_place(&self, account: EntityId) -> (MapKey, Transform) {
        let saved = match self.persistence.load::<EntitySaveRecord>(&account.to_string()) {
            Ok(saved) => saved,
            Err(e) => {
                self.pool
                    .log
                    .warn(format_args!("Save record for {} unreadable: {}", account, e));
                None
            }
        };

        if let Some(record) = saved {
            let key = MapKey::new(record.map, record.instance);
            if self.pool.map(&key).is_some() {
                return (
                    key,
                    Transform {
                        position: record.position,
                        rotation: record.rotation,
                    },
                );
            }
        }

        let spawn = self
            .pool
            .map(&self.default_map)
            .map(|m| m.config().spawn_point)
            .unwrap_or_default();
        (self.default_map.clone(), Transform::at(spawn))
    }

    fn save(&self, conn: &Connection) -> Result<(), PoolError> {
        let entity = conn.id();
        let Some(key) = self.pool.map_of(entity) else {
            return Ok(());
        };
        let Some(transform) = self.pool.registry.get_component::<Transform>(entity) else {
            return Ok(());
        };
        let account = self.pool.registry.account_of(entity).unwrap_or(entity);
        self.persistence.store(&EntitySaveRecord {
            account,
            map: key.name,
            instance: key.instance,
            position: transform.position,
            rotation: transform.rotation,
        })?;
        Ok(())
    }
}

impl Service for WorldService {
    fn kind(&self) -> &'static str {
        WORLD_KIND
    }

    fn register(self: Arc<Self>, handlers: &mut HandlerSet) {
        let this = self.clone();
        handlers.on(MOVE.method, move |_, msg| {
            let to = decode_component(&Transform::default(), msg.args())?;
            this.pool
                .request_move(msg.connection().id(), to, MoveOrigin::Client)?;
            Ok(())
        });

        let this = self;
        handlers.on(ENTER.method, move |_, msg| {
            let name = msg.arg(0).ok_or_else(|| anyhow!("missing map name"))?;
            let instance: u32 = match msg.arg(1) {
                Some(raw) => raw.parse().with_context(|| format!("bad instance '{}'", raw))?,
                None => 0,
            };
            let key = MapKey::new(name, instance);
            let spawn = this
                .pool
                .map(&key)
                .ok_or_else(|| PoolError::UnknownMap(key.clone()))?
                .config()
                .spawn_point;
            this.pool
                .enter_map(msg.connection().id(), &key, Transform::at(spawn))?;
            Ok(())
        });
    }

    fn enable(&self, _ctx: &HostContext) -> anyhow::Result<()> {
        if self.pool.map(&self.default_map).is_none() {
            anyhow::bail!("default map {} is not loaded", self.default_map);
        }
        Ok(())
    }

    fn disable(&self, _ctx: &HostContext) {
        // Apply the revokes queued by the final disconnects
        self.pool.flush();
    }

    fn tick(&self, _ctx: &HostContext) {
        self.pool.tick_active(Instant::now());
    }

    fn on_connect(&self, _ctx: &HostContext, connection: &Arc<Connection>) {
        let entity: ConnectionId = connection.id();
        if let Err(e) = self.pool.registry.create_entity(Some(entity)) {
            self.pool
                .log
                .warn(format_args!("No entity for {}: {}", entity, e));
            return;
        }
        let account = self.pool.registry.account_of(entity).unwrap_or(entity);
        let (key, transform) = self.starting_place(account);
        if let Err(e) = self.pool.enter_map(entity, &key, transform) {
            self.pool
                .log
                .warn(format_args!("{} could not enter {}: {}", entity, key, e));
        }
    }

    fn on_disconnect(&self, _ctx: &HostContext, connection: &Arc<Connection>) {
        if let Err(e) = self.save(connection) {
            self.pool
                .log
                .warn(format_args!("Save for {} failed: {}", connection.id(), e));
        }
        self.pool.exit_map(connection.id(), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::grid::bounds::Bounds;
    use crate::net::connection::ConnectionRole;
    use crate::net::protocol::{format_call, Message, Timestamp, Transport};
    use crate::persistence::InMemoryPersistence;
    use crate::util::vec3::Vec3;
    use crate::world::component::encode_component;
    use crate::world::registry::tests::{authority, client, drain_calls};
    use std::time::Duration;

    fn map_config(name: &str) -> MapConfig {
        MapConfig {
            name: name.to_string(),
            cell_size: 10.0,
            visibility_radius: 1,
            bounds: Bounds::Box {
                half_extents: Vec3::new(100.0, 100.0, 10.0),
            },
            spawn_point: Vec3::new(5.0, 5.0, 0.0),
            speed_cap: 5.0,
            min_tick_interval: Duration::ZERO,
            ..MapConfig::default()
        }
    }

    fn pool(max_workers: usize) -> Arc<MapPool> {
        let registry = Arc::new(authority());
        let pool = Arc::new(MapPool::new(registry.clone(), max_workers, LogSink::default(), Arc::new(Metrics::new())));
        for name in ["town", "dungeon"] {
            pool.add_map(Map::new(
                MapKey::new(name, 0),
                map_config(name),
                registry.clone(),
                LogSink::default(),
                Arc::new(Metrics::new()),
            ));
        }
        pool
    }

    #[test]
    fn test_idle_maps_are_not_ticked() {
        let pool = pool(2);
        assert_eq!(pool.tick_active(Instant::now()), 0);
        assert_eq!(pool.metrics.maps_active.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn test_enter_and_move_between_maps() {
        let pool = pool(2);
        let conn = client(pool.registry());
        let town = MapKey::new("town", 0);
        let dungeon = MapKey::new("dungeon", 0);

        pool.enter_map(conn.id(), &town, Transform::at(Vec3::ZERO)).unwrap();
        assert_eq!(pool.tick_active(Instant::now()), 1);
        assert!(pool.map(&town).unwrap().contains(conn.id()));
        let calls = drain_calls(&conn);
        assert_eq!(calls[0].0, "Replica.EnteredMap");
        assert_eq!(calls[0].1, vec!["town".to_string(), "0".to_string()]);

        pool.enter_map(conn.id(), &dungeon, Transform::at(Vec3::new(50.0, 0.0, 0.0)))
            .unwrap();
        pool.flush();
        assert!(!pool.map(&town).unwrap().contains(conn.id()));
        assert_eq!(
            pool.map(&dungeon).unwrap().position_of(conn.id()),
            Some(Vec3::new(50.0, 0.0, 0.0))
        );
        assert_eq!(pool.map_of(conn.id()), Some(dungeon));
        assert!(pool.registry().is_subscribed(conn.id(), conn.id()));
    }

    #[test]
    fn test_enter_unknown_map() {
        let pool = pool(1);
        let entity = pool.registry().create_entity(None).unwrap();
        assert!(matches!(
            pool.enter_map(entity, &MapKey::new("void", 0), Transform::default()),
            Err(PoolError::UnknownMap(_))
        ));
    }

    #[test]
    fn test_exit_with_revoke() {
        let pool = pool(1);
        let conn = client(pool.registry());
        pool.enter_map(conn.id(), &MapKey::new("town", 0), Transform::default())
            .unwrap();
        pool.flush();

        assert!(pool.exit_map(conn.id(), true));
        pool.flush();
        assert!(!pool.registry().contains(conn.id()));
        assert!(pool.map_of(conn.id()).is_none());

        // Not on any map: revoked directly
        let loose = pool.registry().create_entity(None).unwrap();
        assert!(!pool.exit_map(loose, true));
        assert!(!pool.registry().contains(loose));
    }

    #[test]
    fn test_request_move_needs_a_map() {
        let pool = pool(1);
        let entity = pool.registry().create_entity(None).unwrap();
        assert!(matches!(
            pool.request_move(entity, Transform::default(), MoveOrigin::Client),
            Err(PoolError::NotOnMap(_))
        ));
    }

    #[test]
    fn test_parallel_ticks_across_maps() {
        let pool = pool(4);
        let a = client(pool.registry());
        let b = client(pool.registry());
        pool.enter_map(a.id(), &MapKey::new("town", 0), Transform::default()).unwrap();
        pool.enter_map(b.id(), &MapKey::new("dungeon", 0), Transform::default()).unwrap();
        assert_eq!(pool.tick_active(Instant::now()), 2);
        assert_eq!(pool.metrics.maps_active.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    fn world(pool: &Arc<MapPool>, store: Arc<dyn Persistence>) -> (Arc<HostContext>, Arc<WorldService>) {
        let ctx = HostContext::detached(ConnectionRole::Authority);
        let service = Arc::new(WorldService::new(pool.clone(), store, MapKey::new("town", 0)));
        ctx.install_service(service.clone()).unwrap();
        (ctx, service)
    }

    #[test]
    fn test_world_requires_default_map() {
        let registry = Arc::new(authority());
        let empty = Arc::new(MapPool::new(registry, 1, LogSink::default(), Arc::new(Metrics::new())));
        let ctx = HostContext::detached(ConnectionRole::Authority);
        let service = Arc::new(WorldService::new(
            empty,
            Arc::new(InMemoryPersistence::new()),
            MapKey::new("town", 0),
        ));
        assert!(ctx.install_service(service).is_err());
    }

    #[test]
    fn test_world_connect_move_disconnect() {
        let pool = pool(2);
        let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let (ctx, service) = world(&pool, store.clone());

        let conn = Arc::new(Connection::detached(ConnectionRole::Authority));
        pool.registry().connections().insert(conn.clone());
        service.on_connect(&ctx, &conn);
        service.tick(&ctx);
        let town = pool.map(&MapKey::new("town", 0)).unwrap();
        assert_eq!(town.position_of(conn.id()), Some(Vec3::new(5.0, 5.0, 0.0)));

        let text = format_call(MOVE, Timestamp::now(), &encode_component(&Transform::at(Vec3::new(8.0, 5.0, 0.0))))
            .unwrap();
        let msg = Message::parse(&text, conn.clone(), Transport::Reliable, Instant::now()).unwrap();
        assert!(ctx.dispatch().dispatch(&ctx, &msg));
        service.tick(&ctx);
        assert_eq!(town.position_of(conn.id()), Some(Vec3::new(8.0, 5.0, 0.0)));

        service.on_disconnect(&ctx, &conn);
        pool.flush();
        assert!(!pool.registry().contains(conn.id()));

        let saved: EntitySaveRecord = store.load(&conn.id().to_string()).unwrap().unwrap();
        assert_eq!(saved.map, "town");
        assert_eq!(saved.position, Vec3::new(8.0, 5.0, 0.0));
    }

    #[test]
    fn test_world_restores_saved_place() {
        let pool = pool(1);
        let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let conn = Arc::new(Connection::detached(ConnectionRole::Authority));
        store
            .store(&EntitySaveRecord {
                account: conn.id(),
                map: "dungeon".to_string(),
                instance: 0,
                position: Vec3::new(-20.0, 3.0, 0.0),
                rotation: Vec3::ZERO,
            })
            .unwrap();
        let (ctx, service) = world(&pool, store);

        pool.registry().connections().insert(conn.clone());
        service.on_connect(&ctx, &conn);
        pool.flush();
        assert_eq!(pool.map_of(conn.id()), Some(MapKey::new("dungeon", 0)));
        assert_eq!(
            pool.map(&MapKey::new("dungeon", 0)).unwrap().position_of(conn.id()),
            Some(Vec3::new(-20.0, 3.0, 0.0))
        );
    }

    #[test]
    fn test_world_enter_handler() {
        let pool = pool(1);
        let (ctx, service) = world(&pool, Arc::new(InMemoryPersistence::new()));
        let conn = Arc::new(Connection::detached(ConnectionRole::Authority));
        pool.registry().connections().insert(conn.clone());
        service.on_connect(&ctx, &conn);
        pool.flush();

        let text = format_call(ENTER, Timestamp::now(), &["dungeon", "0"]).unwrap();
        let msg = Message::parse(&text, conn.clone(), Transport::Reliable, Instant::now()).unwrap();
        assert!(ctx.dispatch().dispatch(&ctx, &msg));
        pool.flush();
        assert_eq!(pool.map_of(conn.id()), Some(MapKey::new("dungeon", 0)));

        let bad = format_call(ENTER, Timestamp::now(), &["nowhere"]).unwrap();
        let msg = Message::parse(&bad, conn, Transport::Reliable, Instant::now()).unwrap();
        assert!(!ctx.dispatch().dispatch(&ctx, &msg));
    }
}
