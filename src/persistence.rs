//! Document store collaborator
//!
//! The core only reads map definitions and entity-kind defaults at map load;
//! services use it for per-account save records. Documents are JSON values
//! keyed by collection and id, so any backing store can implement
//! [`Persistence`] without knowing the record types.

use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::MapConfig;
use crate::grid::bounds::{Bounds, Dimensions};
use crate::util::vec3::Vec3;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Invalid document: {0}")]
    Invalid(String),
}

/// A stored document type
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    /// Value of the record's id field
    fn id(&self) -> String;
}

/// Untyped document store
pub trait Persistence: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, PersistenceError>;

    fn get_all(&self, collection: &str) -> Result<Vec<Value>, PersistenceError>;

    fn save(&self, collection: &str, id: &str, document: Value) -> Result<(), PersistenceError>;

    fn remove(&self, collection: &str, id: &str) -> Result<bool, PersistenceError>;
}

/// Typed access on top of any [`Persistence`]
pub trait PersistenceExt: Persistence {
    fn load<T: Record>(&self, id: &str) -> Result<Option<T>, PersistenceError> {
        self.get(T::COLLECTION, id)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    fn load_all<T: Record>(&self) -> Result<Vec<T>, PersistenceError> {
        self.get_all(T::COLLECTION)?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    fn store<T: Record>(&self, record: &T) -> Result<(), PersistenceError> {
        self.save(T::COLLECTION, &record.id(), serde_json::to_value(record)?)
    }

    fn delete<T: Record>(&self, id: &str) -> Result<bool, PersistenceError> {
        self.remove(T::COLLECTION, id)
    }
}

impl<P: Persistence + ?Sized> PersistenceExt for P {}

/// Process-local store
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    collections: DashMap<String, DashMap<String, Value>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }
}

impl Persistence for InMemoryPersistence {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, PersistenceError> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(id).map(|v| v.value().clone())))
    }

    fn get_all(&self, collection: &str) -> Result<Vec<Value>, PersistenceError> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.iter().map(|v| v.value().clone()).collect())
            .unwrap_or_default())
    }

    fn save(&self, collection: &str, id: &str, document: Value) -> Result<(), PersistenceError> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        Ok(())
    }

    fn remove(&self, collection: &str, id: &str) -> Result<bool, PersistenceError> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }
}

// ============================================================================
// Records
// ============================================================================

fn default_instances() -> u32 {
    1
}

fn default_min_tick_ms() -> u64 {
    50
}

/// Static map layout and its initial entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapDefinition {
    pub name: String,
    #[serde(default)]
    pub planar: bool,
    #[serde(default = "default_instances")]
    pub instances: u32,
    pub cell_size: f32,
    pub visibility_radius: u32,
    pub bounds: Bounds,
    #[serde(default)]
    pub spawn_point: Vec3,
    pub speed_cap: f32,
    #[serde(default = "default_min_tick_ms")]
    pub min_tick_ms: u64,
    #[serde(default)]
    pub initial_entities: Vec<InitialEntity>,
}

/// One entry of a map's spawn manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialEntity {
    /// Name of an [`EntityKindDefinition`]
    pub kind: String,
    pub position: Vec3,
    #[serde(default)]
    pub rotation: Vec3,
    /// Seen by every client on the map regardless of cells
    #[serde(default)]
    pub global: bool,
}

impl MapDefinition {
    pub fn config(&self) -> MapConfig {
        MapConfig {
            name: self.name.clone(),
            instances: self.instances,
            dimensions: if self.planar {
                Dimensions::Planar
            } else {
                Dimensions::Volumetric
            },
            cell_size: self.cell_size,
            visibility_radius: self.visibility_radius,
            bounds: self.bounds,
            spawn_point: self.spawn_point,
            speed_cap: self.speed_cap,
            min_tick_interval: Duration::from_millis(self.min_tick_ms),
        }
    }
}

impl From<&MapConfig> for MapDefinition {
    fn from(config: &MapConfig) -> Self {
        Self {
            name: config.name.clone(),
            planar: config.dimensions.is_planar(),
            instances: config.instances,
            cell_size: config.cell_size,
            visibility_radius: config.visibility_radius,
            bounds: config.bounds,
            spawn_point: config.spawn_point,
            speed_cap: config.speed_cap,
            min_tick_ms: config.min_tick_interval.as_millis() as u64,
            initial_entities: Vec::new(),
        }
    }
}

impl Record for MapDefinition {
    const COLLECTION: &'static str = "maps";

    fn id(&self) -> String {
        self.name.clone()
    }
}

/// Starting field values of one component, in wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDefaults {
    pub kind: String,
    pub fields: Vec<String>,
}

/// Named entity template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityKindDefinition {
    pub name: String,
    #[serde(default)]
    pub components: Vec<ComponentDefaults>,
}

impl Record for EntityKindDefinition {
    const COLLECTION: &'static str = "entity_kinds";

    fn id(&self) -> String {
        self.name.clone()
    }
}

/// Where an account's entity was when it left
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySaveRecord {
    pub account: Uuid,
    pub map: String,
    #[serde(default)]
    pub instance: u32,
    pub position: Vec3,
    #[serde(default)]
    pub rotation: Vec3,
}

impl Record for EntitySaveRecord {
    const COLLECTION: &'static str = "entity_saves";

    fn id(&self) -> String {
        self.account.to_string()
    }
}
