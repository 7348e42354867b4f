//! Spatial interest management
//!
//! Maps partition space into cells; an entity is visible to the clients in
//! the cells within the map's visibility radius of its own cell.

pub mod bounds;
pub mod cell;
pub mod map;
pub mod movement;
pub mod pool;

pub use bounds::{Bounds, Dimensions};
pub use map::{Map, MapKey};
pub use movement::{MoveOrigin, MoveViolation};
pub use pool::{MapPool, PoolError, WorldService};
