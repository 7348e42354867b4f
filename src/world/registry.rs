//! Entity/component registry with subscription tracking
//!
//! The authority keeps, per entity, the set of connections subscribed to it
//! and, per connection, the reverse set. Both are concurrent maps so the map
//! workers can subscribe and unsubscribe without a registry-wide lock.
//! Component values live in per-type columns (see [`crate::world::storage`]).

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::log::LogSink;
use crate::metrics::Metrics;
use crate::net::connection::{Connection, ConnectionError, ConnectionId, ConnectionSet};
use crate::net::protocol::{format_call, Timestamp};
use crate::net::session::SessionProvider;
use crate::world::component::{Component, FieldError};
use crate::world::entity::{EntityArena, EntityId, EntityKey};
use crate::world::replica::{DESPAWN, SPAWN, UPDATE};
use crate::world::storage::{AnyColumn, ApplyOutcome, ComponentColumn};

/// Which side of the wire this registry lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryRole {
    /// Owns entities and tracks subscribers
    Authority,
    /// Mirrors what an authority replicates; no subscriber sets
    Replica,
}

/// Transport preference for component replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    #[default]
    Reliable,
    /// Datagram when the subscriber has one bound, stream otherwise
    PreferUnreliable,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("Entity {0} already exists")]
    DuplicateEntity(EntityId),
    #[error("Entity {entity} already has a {kind} component")]
    AlreadyExists { entity: EntityId, kind: &'static str },
    #[error("Entity {entity} has no {kind} component")]
    MissingComponent { entity: EntityId, kind: String },
    #[error("Unknown component kind '{0}'")]
    UnknownKind(String),
    #[error("Field error: {0}")]
    Field(#[from] FieldError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Where the grid reports interest changes
pub trait SubscriptionSink: Send + Sync {
    fn subscribe(&self, connection: ConnectionId, entity: EntityId);

    fn unsubscribe(&self, connection: ConnectionId, entity: EntityId);
}

pub struct Registry {
    role: RegistryRole,
    arena: RwLock<EntityArena>,
    typed: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    by_kind: DashMap<&'static str, Arc<dyn AnyColumn>>,
    subscribers: DashMap<EntityId, DashSet<ConnectionId>>,
    interests: DashMap<ConnectionId, DashSet<EntityId>>,
    connections: Arc<ConnectionSet>,
    sessions: Arc<dyn SessionProvider>,
    log: LogSink,
    metrics: Arc<Metrics>,
}

impl Registry {
    pub fn new(
        role: RegistryRole,
        connections: Arc<ConnectionSet>,
        sessions: Arc<dyn SessionProvider>,
        log: LogSink,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            role,
            arena: RwLock::new(EntityArena::new()),
            typed: DashMap::new(),
            by_kind: DashMap::new(),
            subscribers: DashMap::new(),
            interests: DashMap::new(),
            connections,
            sessions,
            log,
            metrics,
        }
    }

    pub fn role(&self) -> RegistryRole {
        self.role
    }

    pub fn connections(&self) -> &Arc<ConnectionSet> {
        &self.connections
    }

    // ----- Entities -----

    /// Allocate an entity, with a fresh id unless one is given
    pub fn create_entity(&self, id: Option<EntityId>) -> Result<EntityId, RegistryError> {
        let id = id.unwrap_or_else(EntityId::new_v4);
        if self.arena.write().allocate(id).is_none() {
            return Err(RegistryError::DuplicateEntity(id));
        }
        if self.role == RegistryRole::Authority {
            self.subscribers.insert(id, DashSet::new());
        }
        Metrics::incr(&self.metrics.entities_active);
        self.log.trace(format_args!("Created entity {}", id));
        Ok(id)
    }

    /// Remove an entity and all of its components
    ///
    /// Remaining subscribers are a caller bug: they are warned about and
    /// detached silently. A connection bound to the entity id is closed.
    pub fn revoke(&self, id: EntityId) -> bool {
        let Some(key) = self.arena.write().release(id) else {
            return false;
        };

        if let Some((_, subscribers)) = self.subscribers.remove(&id) {
            if !subscribers.is_empty() {
                self.log.warn(format_args!(
                    "Revoking {} with {} live subscriber(s)",
                    id,
                    subscribers.len()
                ));
            }
            for conn in subscribers.iter() {
                if let Some(entities) = self.interests.get(&*conn) {
                    entities.remove(&id);
                }
                Metrics::decr(&self.metrics.subscriptions_active);
            }
        }

        for column in self.columns() {
            column.clear_slot(key);
        }
        self.drop_interests(id);
        Metrics::decr(&self.metrics.entities_active);

        if let Some(conn) = self.connections.remove(id) {
            conn.close();
        }
        self.log.debug(format_args!("Revoked entity {}", id));
        true
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.arena.read().contains(id)
    }

    pub fn entity_count(&self) -> usize {
        self.arena.read().len()
    }

    pub fn entities(&self) -> Vec<EntityId> {
        self.arena.read().ids().collect()
    }

    fn key(&self, id: EntityId) -> Result<EntityKey, RegistryError> {
        self.arena.read().resolve(id).ok_or(RegistryError::UnknownEntity(id))
    }

    // ----- Components -----

    fn column<T: Component>(&self) -> Arc<ComponentColumn<T>> {
        let any = self
            .typed
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                let column = Arc::new(ComponentColumn::<T>::new());
                let erased: Arc<dyn AnyColumn> = column.clone();
                if self.by_kind.insert(T::KIND, erased).is_some() {
                    self.log
                        .warn(format_args!("Component kind '{}' registered by two types", T::KIND));
                }
                column as Arc<dyn Any + Send + Sync>
            })
            .clone();

        match any.downcast::<ComponentColumn<T>>() {
            Ok(column) => column,
            Err(_) => unreachable!("columns are keyed by TypeId"),
        }
    }

    fn columns(&self) -> Vec<Arc<dyn AnyColumn>> {
        self.by_kind.iter().map(|c| c.value().clone()).collect()
    }

    /// Make a component type decodable by kind name
    pub fn register_component<T: Component>(&self) {
        self.column::<T>();
    }

    pub fn component_kinds(&self) -> Vec<&'static str> {
        self.by_kind.iter().map(|c| *c.key()).collect()
    }

    pub fn add_component<T: Component>(&self, entity: EntityId, value: T) -> Result<(), RegistryError> {
        let key = self.key(entity)?;
        if !self.column::<T>().insert(key, value, Timestamp::now()) {
            return Err(RegistryError::AlreadyExists { entity, kind: T::KIND });
        }
        Ok(())
    }

    /// Current value; a copy, so callers never hold component state across ticks
    pub fn get_component<T: Component>(&self, entity: EntityId) -> Option<T> {
        let key = self.key(entity).ok()?;
        self.column::<T>().get(key)
    }

    pub fn has_component<T: Component>(&self, entity: EntityId) -> bool {
        self.key(entity)
            .map(|key| self.column::<T>().contains(key))
            .unwrap_or(false)
    }

    /// Mutate a component in place
    pub fn update_component<T: Component, R>(
        &self,
        entity: EntityId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, RegistryError> {
        let key = self.key(entity)?;
        self.column::<T>()
            .update(key, Timestamp::now(), f)
            .ok_or_else(|| RegistryError::MissingComponent {
                entity,
                kind: T::KIND.to_string(),
            })
    }

    pub fn remove_component<T: Component>(&self, entity: EntityId) -> Option<T> {
        let key = self.key(entity).ok()?;
        self.column::<T>().remove(key)
    }

    /// Get the component, adding a default one first if absent
    pub fn require_component<T: Component>(&self, entity: EntityId) -> Result<T, RegistryError> {
        let key = self.key(entity)?;
        let column = self.column::<T>();
        if let Some(value) = column.get(key) {
            return Ok(value);
        }
        column.insert(key, T::default(), Timestamp::now());
        Ok(column.get(key).unwrap_or_default())
    }

    // ----- Subscriptions -----

    /// Subscribe `connection` to `entity`
    ///
    /// The first subscription sends a spawn plus every component the
    /// subscriber may see. Repeats are no-ops and return false.
    pub fn subscribe(&self, connection: ConnectionId, entity: EntityId) -> Result<bool, RegistryError> {
        if self.role == RegistryRole::Replica {
            return Ok(false);
        }
        let inserted = match self.subscribers.get(&entity) {
            Some(set) => set.insert(connection),
            None => return Err(RegistryError::UnknownEntity(entity)),
        };
        if !inserted {
            return Ok(false);
        }

        self.interests.entry(connection).or_default().insert(entity);
        Metrics::incr(&self.metrics.subscriptions_active);

        if let Some(conn) = self.connections.get(connection) {
            if let Err(e) = self.send_snapshot(&conn, entity) {
                self.log
                    .debug(format_args!("Spawn of {} for {} not sent: {}", entity, connection, e));
            }
        }
        Ok(true)
    }

    fn send_snapshot(&self, conn: &Connection, entity: EntityId) -> Result<(), RegistryError> {
        let key = self.key(entity)?;
        let id = entity.to_string();
        conn.send(SPAWN, &[id.as_str()])?;

        let owner = self.client_owns(conn.id(), entity);
        for column in self.columns() {
            if !column.visibility().allows(owner) {
                continue;
            }
            if let Some(fields) = column.encode_slot(key) {
                conn.send(UPDATE, &update_args(&id, column.kind(), fields))?;
            }
        }
        Ok(())
    }

    /// Returns false when there was no such subscription
    pub fn unsubscribe(&self, connection: ConnectionId, entity: EntityId) -> bool {
        let removed = self
            .subscribers
            .get(&entity)
            .map(|set| set.remove(&connection).is_some())
            .unwrap_or(false);
        if !removed {
            return false;
        }

        if let Some(entities) = self.interests.get(&connection) {
            entities.remove(&entity);
        }
        Metrics::decr(&self.metrics.subscriptions_active);

        if let Some(conn) = self.connections.get(connection) {
            if !conn.is_closed() {
                if let Err(e) = conn.send(DESPAWN, &[entity.to_string()]) {
                    self.log.debug(format_args!("Despawn of {} not sent: {}", entity, e));
                }
            }
        }
        true
    }

    /// Unsubscribe every subscriber of `entity`
    pub fn unsubscribe_all(&self, entity: EntityId) -> usize {
        self.subscribers(entity)
            .into_iter()
            .filter(|conn| self.unsubscribe(*conn, entity))
            .count()
    }

    /// Forget everything `connection` was subscribed to, without notifying it
    pub fn drop_interests(&self, connection: ConnectionId) -> usize {
        let Some((_, entities)) = self.interests.remove(&connection) else {
            return 0;
        };
        let mut dropped = 0;
        for entity in entities.iter() {
            let removed = self
                .subscribers
                .get(&*entity)
                .map(|set| set.remove(&connection).is_some())
                .unwrap_or(false);
            if removed {
                dropped += 1;
                Metrics::decr(&self.metrics.subscriptions_active);
            }
        }
        dropped
    }

    pub fn subscribers(&self, entity: EntityId) -> Vec<ConnectionId> {
        self.subscribers
            .get(&entity)
            .map(|set| set.iter().map(|c| *c).collect())
            .unwrap_or_default()
    }

    /// Entities `connection` is currently subscribed to
    pub fn interests(&self, connection: ConnectionId) -> Vec<EntityId> {
        self.interests
            .get(&connection)
            .map(|set| set.iter().map(|e| *e).collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, connection: ConnectionId, entity: EntityId) -> bool {
        self.subscribers
            .get(&entity)
            .map(|set| set.contains(&connection))
            .unwrap_or(false)
    }

    // ----- Replication -----

    /// A subscriber owns an entity when its account identity is the entity id
    pub fn client_owns(&self, connection: ConnectionId, entity: EntityId) -> bool {
        self.sessions.is_logged_in(connection) && self.sessions.identity(connection) == Some(entity)
    }

    /// Account identity of a logged-in connection
    pub fn account_of(&self, connection: ConnectionId) -> Option<Uuid> {
        if !self.sessions.is_logged_in(connection) {
            return None;
        }
        self.sessions.identity(connection)
    }

    /// Push `T`'s current state of `entity` to its subscribers over the stream
    pub fn send_component<T: Component>(&self, entity: EntityId) -> Result<usize, RegistryError> {
        self.send_component_with::<T>(entity, Delivery::Reliable)
    }

    /// Returns how many subscribers were sent the update
    pub fn send_component_with<T: Component>(
        &self,
        entity: EntityId,
        delivery: Delivery,
    ) -> Result<usize, RegistryError> {
        let column: Arc<dyn AnyColumn> = self.column::<T>();
        self.replicate(entity, column.as_ref(), delivery)
    }

    fn replicate(&self, entity: EntityId, column: &dyn AnyColumn, delivery: Delivery) -> Result<usize, RegistryError> {
        let key = self.key(entity)?;
        let fields = column
            .encode_slot(key)
            .ok_or_else(|| RegistryError::MissingComponent {
                entity,
                kind: column.kind().to_string(),
            })?;
        let visibility = column.visibility();
        if !visibility.allows(true) {
            return Ok(0);
        }

        let id = entity.to_string();
        let text = format_call(UPDATE, Timestamp::now(), &update_args(&id, column.kind(), fields))
            .map_err(ConnectionError::from)?;

        let mut sent = 0;
        for subscriber in self.subscribers(entity) {
            if !visibility.allows(self.client_owns(subscriber, entity)) {
                continue;
            }
            let Some(conn) = self.connections.get(subscriber) else {
                continue;
            };
            let result = match delivery {
                Delivery::PreferUnreliable if conn.has_unreliable() => conn.send_raw_unreliable(&text),
                _ => conn.send_raw(&text),
            };
            match result {
                Ok(()) => sent += 1,
                Err(e) => self.log.trace(format_args!("Update for {} skipped: {}", subscriber, e)),
            }
        }
        Ok(sent)
    }

    /// Apply a replicated update, last write wins by sender timestamp
    pub fn apply_remote(
        &self,
        entity: EntityId,
        kind: &str,
        sent_at: Timestamp,
        fields: &[String],
    ) -> Result<ApplyOutcome, RegistryError> {
        let key = self.key(entity)?;
        let column = self.column_by_kind(kind)?;
        let outcome = column.apply_fields(key, sent_at, fields)?;
        if outcome == ApplyOutcome::Stale {
            self.log
                .trace(format_args!("Stale {} update for {} dropped", kind, entity));
        }
        Ok(outcome)
    }

    /// Seed or overwrite a component from persisted starting data
    pub fn apply_defaults(&self, entity: EntityId, kind: &str, fields: &[String]) -> Result<(), RegistryError> {
        let key = self.key(entity)?;
        self.column_by_kind(kind)?.apply_defaults(key, fields)?;
        Ok(())
    }

    fn column_by_kind(&self, kind: &str) -> Result<Arc<dyn AnyColumn>, RegistryError> {
        self.by_kind
            .get(kind)
            .map(|c| c.value().clone())
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))
    }
}

impl SubscriptionSink for Registry {
    fn subscribe(&self, connection: ConnectionId, entity: EntityId) {
        if let Err(e) = Registry::subscribe(self, connection, entity) {
            self.log
                .warn(format_args!("Subscribe {} -> {} failed: {}", connection, entity, e));
        }
    }

    fn unsubscribe(&self, connection: ConnectionId, entity: EntityId) {
        Registry::unsubscribe(self, connection, entity);
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("role", &self.role)
            .field("entities", &self.entity_count())
            .field("kinds", &self.by_kind.len())
            .finish()
    }
}

fn update_args(entity: &str, kind: &str, fields: Vec<String>) -> Vec<String> {
    let mut args = Vec::with_capacity(fields.len() + 2);
    args.push(entity.to_string());
    args.push(kind.to_string());
    args.extend(fields);
    args
}
