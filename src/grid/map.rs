//! One spatial instance
//!
//! Handlers and services never touch cell membership directly: they queue
//! spawn, despawn and move requests, and the map applies them during its own
//! tick. That keeps every subscribe/unsubscribe for an entity on the single
//! task that ticks the map owning it.
//!
//! Entity lifecycle on a map:
//! unspawned -> spawn queued -> active (in a cell, or global) -> despawn queued -> gone

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashSet;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::MapConfig;
use crate::grid::cell::{Grid, GridLayout};
use crate::grid::movement::{MoveOrigin, MoveValidator};
use crate::log::LogSink;
use crate::metrics::Metrics;
use crate::persistence::{EntityKindDefinition, MapDefinition, Persistence, PersistenceError, PersistenceExt};
use crate::util::vec3::Vec3;
use crate::world::component::{encode_component, Transform};
use crate::world::entity::EntityId;
use crate::world::registry::{Delivery, Registry, SubscriptionSink};
use crate::world::replica::RUBBER_BAND;

/// Ticks a move for an unspawned entity is kept before it is dropped
const MOVE_RETRY_LIMIT: u32 = 16;

/// Map name plus instance number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapKey {
    pub name: String,
    pub instance: u32,
}

impl MapKey {
    pub fn new(name: impl Into<String>, instance: u32) -> Self {
        Self {
            name: name.into(),
            instance,
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.instance)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MoveRequest {
    pub entity: EntityId,
    pub to: Transform,
    pub origin: MoveOrigin,
    retries: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest {
    pub entity: EntityId,
    pub transform: Transform,
    /// Entity is bound to a connection of the same id
    pub client: bool,
    /// Visible to every client on the map instead of through cells
    pub global: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DespawnRequest {
    pub entity: EntityId,
    /// Also drop the client's remaining subscriptions to this map's entities
    pub strip: bool,
    /// Unsubscribe everyone and revoke the entity afterwards
    pub revoke: bool,
}

#[derive(Debug, Clone, Copy)]
struct Member {
    client: bool,
    global: bool,
}

struct MapState {
    grid: Grid,
    members: FxHashMap<EntityId, Member>,
    globals: FxHashSet<EntityId>,
    clients: FxHashSet<EntityId>,
    /// Despawned before their queued spawn was processed
    cancelled: FxHashSet<EntityId>,
    last_tick: Option<Instant>,
}

pub struct Map {
    key: MapKey,
    config: MapConfig,
    validator: MoveValidator,
    registry: Arc<Registry>,
    state: Mutex<MapState>,
    move_tx: Sender<MoveRequest>,
    move_rx: Receiver<MoveRequest>,
    spawn_tx: Sender<SpawnRequest>,
    spawn_rx: Receiver<SpawnRequest>,
    despawn_tx: Sender<DespawnRequest>,
    despawn_rx: Receiver<DespawnRequest>,
    pending_spawns: DashSet<EntityId>,
    client_count: AtomicUsize,
    log: LogSink,
    metrics: Arc<Metrics>,
}

impl Map {
    pub fn new(key: MapKey, config: MapConfig, registry: Arc<Registry>, log: LogSink, metrics: Arc<Metrics>) -> Self {
        registry.register_component::<Transform>();
        let layout = GridLayout::new(config.dimensions, config.cell_size, config.visibility_radius);
        let (move_tx, move_rx) = unbounded();
        let (spawn_tx, spawn_rx) = unbounded();
        let (despawn_tx, despawn_rx) = unbounded();

        Self {
            key,
            validator: MoveValidator::new(config.bounds, config.dimensions, config.speed_cap),
            config,
            registry,
            state: Mutex::new(MapState {
                grid: Grid::new(layout),
                members: FxHashMap::default(),
                globals: FxHashSet::default(),
                clients: FxHashSet::default(),
                cancelled: FxHashSet::default(),
                last_tick: None,
            }),
            move_tx,
            move_rx,
            spawn_tx,
            spawn_rx,
            despawn_tx,
            despawn_rx,
            pending_spawns: DashSet::new(),
            client_count: AtomicUsize::new(0),
            log,
            metrics,
        }
    }

    /// Build one instance from a stored definition and queue its manifest
    ///
    /// Manifest entries whose kind is unknown spawn with a bare transform.
    pub fn from_definition(
        definition: &MapDefinition,
        instance: u32,
        persistence: &dyn Persistence,
        registry: Arc<Registry>,
        log: LogSink,
        metrics: Arc<Metrics>,
    ) -> Result<Self, PersistenceError> {
        let config = definition.config();
        config.validate().map_err(PersistenceError::Invalid)?;
        let key = MapKey::new(definition.name.clone(), instance);
        let map = Self::new(key, config, registry, log, metrics);

        for initial in &definition.initial_entities {
            let kind: Option<EntityKindDefinition> = persistence.load(&initial.kind)?;
            let entity = match map.registry.create_entity(None) {
                Ok(id) => id,
                Err(e) => {
                    map.log.warn(format_args!("{}: manifest entity not created: {}", map.key, e));
                    continue;
                }
            };
            match kind {
                Some(kind) => {
                    for defaults in &kind.components {
                        if let Err(e) = map.registry.apply_defaults(entity, &defaults.kind, &defaults.fields) {
                            map.log.warn(format_args!(
                                "{}: {} default for {} skipped: {}",
                                map.key, defaults.kind, kind.name, e
                            ));
                        }
                    }
                }
                None => map
                    .log
                    .warn(format_args!("{}: unknown entity kind '{}'", map.key, initial.kind)),
            }

            let transform = Transform {
                position: initial.position,
                rotation: initial.rotation,
            };
            if initial.global {
                map.request_spawn_global(entity, transform);
            } else {
                map.request_spawn(entity, transform, false);
            }
        }

        map.log.info(format_args!(
            "Loaded map {} ({} manifest entities)",
            map.key,
            definition.initial_entities.len()
        ));
        Ok(map)
    }

    pub fn key(&self) -> &MapKey {
        &self.key
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    // ----- Requests (any thread) -----

    pub fn request_spawn(&self, entity: EntityId, transform: Transform, client: bool) {
        self.queue_spawn(SpawnRequest {
            entity,
            transform,
            client,
            global: false,
        });
    }

    pub fn request_spawn_global(&self, entity: EntityId, transform: Transform) {
        self.queue_spawn(SpawnRequest {
            entity,
            transform,
            client: false,
            global: true,
        });
    }

    fn queue_spawn(&self, request: SpawnRequest) {
        self.pending_spawns.insert(request.entity);
        let _ = self.spawn_tx.send(request);
    }

    pub fn request_despawn(&self, request: DespawnRequest) {
        let _ = self.despawn_tx.send(request);
    }

    pub fn request_move(&self, entity: EntityId, to: Transform, origin: MoveOrigin) {
        let _ = self.move_tx.send(MoveRequest {
            entity,
            to,
            origin,
            retries: 0,
        });
    }

    // ----- Queries -----

    /// Clients currently active on the map
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    pub fn has_pending_work(&self) -> bool {
        !(self.move_rx.is_empty() && self.spawn_rx.is_empty() && self.despawn_rx.is_empty())
    }

    /// Whether a map with this state would do anything when ticked
    pub fn is_active(&self) -> bool {
        self.client_count() > 0 || self.has_pending_work()
    }

    /// True once the entity's spawn has been processed
    pub fn contains(&self, entity: EntityId) -> bool {
        self.state.lock().members.contains_key(&entity)
    }

    pub fn position_of(&self, entity: EntityId) -> Option<Vec3> {
        if !self.contains(entity) {
            return None;
        }
        self.registry.get_component::<Transform>(entity).map(|t| t.position)
    }

    pub fn entity_count(&self) -> usize {
        self.state.lock().members.len()
    }

    // ----- Tick -----

    /// Process queued work unless the last tick was too recent
    pub fn tick(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if let Some(last) = state.last_tick {
            if now.saturating_duration_since(last) < self.config.min_tick_interval {
                return false;
            }
        }
        state.last_tick = Some(now);
        self.run(&mut state);
        true
    }

    /// Process queued work now, ignoring the tick interval
    pub fn flush(&self) {
        let mut state = self.state.lock();
        self.run(&mut state);
    }

    pub fn min_tick_interval(&self) -> Duration {
        self.config.min_tick_interval
    }

    fn run(&self, state: &mut MapState) {
        self.process_moves(state);

        let candidates = state.grid.collision_candidates();
        if candidates > 0 {
            self.log
                .trace(format_args!("{}: {} collision candidate pair(s)", self.key, candidates));
        }

        self.process_despawns(state);
        self.process_spawns(state);
        self.client_count.store(state.clients.len(), Ordering::Release);
    }

    fn process_moves(&self, state: &mut MapState) {
        let requests: Vec<MoveRequest> = self.move_rx.try_iter().collect();
        for mut request in requests {
            let Some(member) = state.members.get(&request.entity).copied() else {
                request.retries += 1;
                if request.retries <= MOVE_RETRY_LIMIT {
                    let _ = self.move_tx.send(request);
                } else {
                    self.log.debug(format_args!(
                        "{}: move for {} dropped; never spawned here",
                        self.key, request.entity
                    ));
                }
                continue;
            };
            self.apply_move(state, request, member);
        }
    }

    fn apply_move(&self, state: &mut MapState, request: MoveRequest, member: Member) {
        let entity = request.entity;
        let current = self
            .registry
            .get_component::<Transform>(entity)
            .unwrap_or_default();

        if let Err(violation) = self.validator.validate(current.position, request.to.position, request.origin) {
            Metrics::incr(&self.metrics.moves_rejected);
            self.log
                .debug(format_args!("{}: move of {} rejected: {}", self.key, entity, violation));
            self.rubber_band(entity, &current);
            return;
        }

        if let Err(e) = self
            .registry
            .update_component::<Transform, _>(entity, |t| *t = request.to)
        {
            self.log.warn(format_args!("{}: move of {} lost: {}", self.key, entity, e));
            return;
        }
        if let Err(e) = self
            .registry
            .send_component_with::<Transform>(entity, Delivery::PreferUnreliable)
        {
            self.log.debug(format_args!("{}: transform of {} not sent: {}", self.key, entity, e));
        }
        if !member.global {
            state
                .grid
                .transfer_entity(entity, request.to.position, self.registry.as_ref());
        }
    }

    fn rubber_band(&self, entity: EntityId, last_accepted: &Transform) {
        let Some(conn) = self.registry.connections().get(entity) else {
            return;
        };
        let mut args = vec![entity.to_string()];
        args.extend(encode_component(last_accepted));
        match conn.send(RUBBER_BAND, &args) {
            Ok(()) => Metrics::incr(&self.metrics.rubber_bands),
            Err(e) => self.log.trace(format_args!("Rubber-band for {} not sent: {}", entity, e)),
        }
    }

    fn process_despawns(&self, state: &mut MapState) {
        let requests: Vec<DespawnRequest> = self.despawn_rx.try_iter().collect();
        for request in requests {
            let entity = request.entity;
            match state.members.remove(&entity) {
                Some(member) => self.despawn_member(state, request, member),
                None if self.pending_spawns.contains(&entity) => {
                    state.cancelled.insert(entity);
                }
                None => {}
            }

            if request.revoke {
                self.registry.unsubscribe_all(entity);
                self.registry.revoke(entity);
            }
        }
    }

    fn despawn_member(&self, state: &mut MapState, request: DespawnRequest, member: Member) {
        let entity = request.entity;
        let sink = self.registry.as_ref();

        if member.global {
            state.globals.remove(&entity);
            for client in &state.clients {
                self.registry.unsubscribe(*client, entity);
            }
        } else {
            state.grid.remove_entity(entity, sink);
        }

        if member.client {
            state.clients.remove(&entity);
            for global in &state.globals {
                self.registry.unsubscribe(entity, *global);
            }
            if request.strip {
                for other in self.registry.interests(entity) {
                    if other != entity && state.members.contains_key(&other) {
                        self.registry.unsubscribe(entity, other);
                    }
                }
            }
        }
        self.log.trace(format_args!("{}: despawned {}", self.key, entity));
    }

    fn process_spawns(&self, state: &mut MapState) {
        let sink: &dyn SubscriptionSink = self.registry.as_ref();
        let requests: Vec<SpawnRequest> = self.spawn_rx.try_iter().collect();
        for request in requests {
            let entity = request.entity;
            self.pending_spawns.remove(&entity);
            if state.cancelled.remove(&entity) {
                continue;
            }
            if state.members.contains_key(&entity) {
                self.log.debug(format_args!("{}: {} already spawned", self.key, entity));
                continue;
            }
            if !self.registry.contains(entity) {
                self.log
                    .warn(format_args!("{}: spawn of unknown entity {} skipped", self.key, entity));
                continue;
            }

            let placed = self
                .registry
                .update_component::<Transform, _>(entity, |t| *t = request.transform)
                .is_ok()
                || self.registry.add_component(entity, request.transform).is_ok();
            if !placed {
                continue;
            }

            if request.global {
                state.globals.insert(entity);
                for client in &state.clients {
                    sink.subscribe(*client, entity);
                }
            } else {
                state
                    .grid
                    .add_entity(entity, request.client, request.transform.position, sink);
            }

            if request.client {
                state.clients.insert(entity);
                for global in &state.globals {
                    sink.subscribe(entity, *global);
                }
            }
            state.members.insert(
                entity,
                Member {
                    client: request.client,
                    global: request.global,
                },
            );
            self.log.trace(format_args!("{}: spawned {}", self.key, entity));
        }
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("key", &self.key)
            .field("clients", &self.client_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::bounds::{Bounds, Dimensions};
    use crate::persistence::{ComponentDefaults, InMemoryPersistence, InitialEntity};
    use crate::world::registry::tests::{authority, client, drain_calls};
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn config() -> MapConfig {
        MapConfig {
            name: "test".to_string(),
            dimensions: Dimensions::Planar,
            cell_size: 10.0,
            visibility_radius: 1,
            bounds: Bounds::Box {
                half_extents: Vec3::new(100.0, 100.0, 10.0),
            },
            speed_cap: 5.0,
            min_tick_interval: Duration::from_millis(50),
            ..MapConfig::default()
        }
    }

    fn map() -> Map {
        let registry = Arc::new(authority());
        Map::new(
            MapKey::new("test", 0),
            config(),
            registry,
            LogSink::default(),
            Arc::new(Metrics::new()),
        )
    }

    fn at(x: f32, y: f32) -> Transform {
        Transform::at(Vec3::new(x, y, 0.0))
    }

    fn methods(conn: &crate::net::connection::Connection) -> Vec<String> {
        drain_calls(conn).into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_spawn_happens_on_tick() {
        let map = map();
        let conn = client(&map.registry);
        map.request_spawn(conn.id(), at(1.0, 1.0), true);
        assert!(!map.contains(conn.id()));
        assert!(map.has_pending_work());

        assert!(map.tick(Instant::now()));
        assert!(map.contains(conn.id()));
        assert_eq!(map.client_count(), 1);
        assert_eq!(map.position_of(conn.id()), Some(Vec3::new(1.0, 1.0, 0.0)));
        // Own entity spawned on the client
        assert!(map.registry.is_subscribed(conn.id(), conn.id()));
    }

    #[test]
    fn test_tick_rate_limited() {
        let map = map();
        let now = Instant::now();
        assert!(map.tick(now));
        assert!(!map.tick(now + Duration::from_millis(10)));
        assert!(map.tick(now + Duration::from_millis(60)));
    }

    #[test]
    fn test_client_move_too_fast_rubber_bands() {
        let map = map();
        let conn = client(&map.registry);
        map.request_spawn(conn.id(), at(0.0, 0.0), true);
        map.flush();
        drain_calls(&conn);

        map.request_move(conn.id(), at(50.0, 0.0), MoveOrigin::Client);
        map.flush();

        let calls = drain_calls(&conn);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "Replica.RubberBand");
        assert_eq!(map.position_of(conn.id()), Some(Vec3::ZERO));
        assert_eq!(map.metrics.rubber_bands.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_server_move_any_distance() {
        let map = map();
        let conn = client(&map.registry);
        map.request_spawn(conn.id(), at(0.0, 0.0), true);
        map.flush();
        drain_calls(&conn);

        map.request_move(conn.id(), at(90.0, 90.0), MoveOrigin::Server);
        map.flush();
        assert_eq!(map.position_of(conn.id()), Some(Vec3::new(90.0, 90.0, 0.0)));
        assert_eq!(methods(&conn), vec!["Replica.Update"]);
    }

    #[test]
    fn test_out_of_bounds_rejected_for_server_too() {
        let map = map();
        let rock = map.registry.create_entity(None).unwrap();
        map.request_spawn(rock, at(0.0, 0.0), false);
        map.flush();
        map.request_move(rock, at(500.0, 0.0), MoveOrigin::Server);
        map.flush();
        assert_eq!(map.position_of(rock), Some(Vec3::ZERO));
        assert_eq!(map.metrics.moves_rejected.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_move_before_spawn_is_requeued() {
        let map = map();
        let conn = client(&map.registry);
        map.request_move(conn.id(), at(3.0, 0.0), MoveOrigin::Client);
        map.request_spawn(conn.id(), at(0.0, 0.0), true);

        // Tick 1: move requeued, then spawn processed
        map.flush();
        assert_eq!(map.position_of(conn.id()), Some(Vec3::ZERO));
        assert!(map.has_pending_work());

        // Tick 2: move applies
        map.flush();
        assert_eq!(map.position_of(conn.id()), Some(Vec3::new(3.0, 0.0, 0.0)));
    }

    #[test]
    fn test_walking_across_cells_updates_interest() {
        let map = map();
        let walker = client(&map.registry);
        let statue = map.registry.create_entity(None).unwrap();
        map.request_spawn(walker.id(), at(0.0, 0.0), true);
        map.request_spawn(statue, at(30.0, 0.0), false);
        map.flush();
        assert!(!map.registry.is_subscribed(walker.id(), statue));

        for step in 1..=4 {
            map.request_move(walker.id(), at(step as f32 * 4.0, 0.0), MoveOrigin::Client);
            map.flush();
        }
        // x = 16 -> cell 2, statue in cell 3 is now in view
        assert!(map.registry.is_subscribed(walker.id(), statue));
    }

    #[test]
    fn test_cell_change_inside_view_only_updates() {
        let map = map();
        let viewer = client(&map.registry);
        let cart = map.registry.create_entity(None).unwrap();
        map.request_spawn(viewer.id(), at(0.0, 0.0), true);
        map.request_spawn(cart, at(4.0, 0.0), false);
        map.flush();
        assert!(map.registry.is_subscribed(viewer.id(), cart));
        drain_calls(&viewer);

        // x = 4 -> cell 0, x = 6 -> cell 1; both within radius 1 of the viewer
        map.request_move(cart, at(6.0, 0.0), MoveOrigin::Server);
        map.flush();

        assert_eq!(map.position_of(cart), Some(Vec3::new(6.0, 0.0, 0.0)));
        assert!(map.registry.is_subscribed(viewer.id(), cart));
        let seen = methods(&viewer);
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|m| m == "Replica.Update"), "unexpected calls: {:?}", seen);
    }

    #[test]
    fn test_despawn_before_spawn_processed_is_cancelled() {
        let map = map();
        let conn = client(&map.registry);
        map.request_spawn(conn.id(), at(0.0, 0.0), true);
        map.request_despawn(DespawnRequest {
            entity: conn.id(),
            strip: false,
            revoke: true,
        });
        map.flush();
        assert!(!map.contains(conn.id()));
        assert!(!map.registry.contains(conn.id()));
        assert_eq!(map.client_count(), 0);
    }

    #[test]
    fn test_despawn_with_revoke_notifies_viewers() {
        let map = map();
        let leaver = client(&map.registry);
        let stayer = client(&map.registry);
        map.request_spawn(leaver.id(), at(0.0, 0.0), true);
        map.request_spawn(stayer.id(), at(10.0, 0.0), true);
        map.flush();
        assert!(map.registry.is_subscribed(stayer.id(), leaver.id()));
        drain_calls(&stayer);

        map.request_despawn(DespawnRequest {
            entity: leaver.id(),
            strip: true,
            revoke: true,
        });
        map.flush();

        assert_eq!(methods(&stayer), vec!["Replica.Despawn"]);
        assert!(!map.registry.contains(leaver.id()));
        assert!(leaver.is_closed());
        assert_eq!(map.client_count(), 1);
    }

    #[test]
    fn test_globals_reach_every_client() {
        let map = map();
        let beacon = map.registry.create_entity(None).unwrap();
        let near = client(&map.registry);
        let far = client(&map.registry);
        map.request_spawn_global(beacon, at(0.0, 0.0));
        map.request_spawn(near.id(), at(0.0, 0.0), true);
        map.request_spawn(far.id(), at(90.0, 90.0), true);
        map.flush();

        assert!(map.registry.is_subscribed(near.id(), beacon));
        assert!(map.registry.is_subscribed(far.id(), beacon));

        map.request_despawn(DespawnRequest {
            entity: far.id(),
            ..DespawnRequest::default()
        });
        map.flush();
        assert!(!map.registry.is_subscribed(far.id(), beacon));
        // Own subscription survives leaving the map
        assert!(map.registry.is_subscribed(far.id(), far.id()));
    }

    #[test]
    fn test_from_definition_queues_manifest() {
        let store = InMemoryPersistence::new();
        store
            .store(&EntityKindDefinition {
                name: "Lamp".to_string(),
                components: vec![ComponentDefaults {
                    kind: "Transform".to_string(),
                    fields: encode_component(&at(7.0, 7.0)),
                }],
            })
            .unwrap();

        let mut definition = MapDefinition::from(&config());
        definition.initial_entities = vec![
            InitialEntity {
                kind: "Lamp".to_string(),
                position: Vec3::new(1.0, 2.0, 0.0),
                rotation: Vec3::ZERO,
                global: false,
            },
            InitialEntity {
                kind: "Missing".to_string(),
                position: Vec3::ZERO,
                rotation: Vec3::ZERO,
                global: true,
            },
        ];

        let registry = Arc::new(authority());
        let map = Map::from_definition(
            &definition,
            2,
            &store,
            registry.clone(),
            LogSink::default(),
            Arc::new(Metrics::new()),
        )
        .unwrap();
        assert_eq!(map.key(), &MapKey::new("test", 2));
        assert_eq!(registry.entity_count(), 2);
        assert!(map.has_pending_work());

        map.flush();
        assert_eq!(map.entity_count(), 2);
        // Manifest placement wins over kind defaults
        let positions: Vec<Vec3> = registry
            .entities()
            .into_iter()
            .filter_map(|e| map.position_of(e))
            .collect();
        assert!(positions.contains(&Vec3::new(1.0, 2.0, 0.0)));
    }
}
