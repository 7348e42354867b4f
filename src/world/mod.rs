//! Entities, components and replication

pub mod component;
pub mod entity;
pub mod registry;
pub mod replica;
pub mod storage;

pub use component::{Component, Transform, Visibility};
pub use entity::EntityId;
pub use registry::{Delivery, Registry, RegistryError, RegistryRole, SubscriptionSink};
