//! Spatial cells and interest management
//!
//! A map is bucketed into cubic (or square, for planar maps) cells. Each cell
//! sees the Chebyshev box of cells within the map's visibility radius. Clients
//! are subscribed to every entity in the cells their own cell sees, and every
//! client whose cell sees an entity is subscribed to it.
//!
//! Moving between cells only touches the cells that entered or left view, so
//! the common case of a small step costs one row of cells rather than a full
//! unsubscribe/resubscribe.

use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::grid::bounds::Dimensions;
use crate::util::vec3::Vec3;
use crate::world::entity::EntityId;
use crate::world::registry::SubscriptionSink;

/// Initial capacity for the cell table
const GRID_INITIAL_CAPACITY: usize = 64;

/// Integer cell coordinates; z is always 0 on planar maps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellCoord {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chebyshev distance in cells
    pub fn chebyshev(&self, other: CellCoord) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dy = self.y.abs_diff(other.y);
        let dz = self.z.abs_diff(other.z);
        dx.max(dy).max(dz)
    }
}

/// Cell geometry shared by every cell of one map
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLayout {
    pub dimensions: Dimensions,
    pub cell_size: f32,
    /// Visibility radius in cells
    pub radius: u32,
}

impl GridLayout {
    pub fn new(dimensions: Dimensions, cell_size: f32, radius: u32) -> Self {
        Self {
            dimensions,
            cell_size,
            radius,
        }
    }

    /// Cell containing `position`
    ///
    /// Cells are centred on multiples of the cell size, so the position is
    /// shifted by half a cell before flooring.
    #[inline]
    pub fn cell_for(&self, position: Vec3) -> CellCoord {
        let half = self.cell_size * 0.5;
        let axis = |v: f32| ((v + half) / self.cell_size).floor() as i32;
        CellCoord {
            x: axis(position.x),
            y: axis(position.y),
            z: if self.dimensions.is_planar() { 0 } else { axis(position.z) },
        }
    }

    /// Every coordinate within the radius of `coord`, including itself
    pub fn visible_from(&self, coord: CellCoord) -> Vec<CellCoord> {
        let r = self.radius as i32;
        let z_range = if self.dimensions.is_planar() { 0..=0 } else { -r..=r };
        let mut cells = Vec::with_capacity(self.visible_count());
        for dz in z_range {
            for dy in -r..=r {
                for dx in -r..=r {
                    cells.push(CellCoord::new(coord.x + dx, coord.y + dy, coord.z + dz));
                }
            }
        }
        cells
    }

    /// Size of every visibility set: (2r+1)^2 planar, (2r+1)^3 volumetric
    pub fn visible_count(&self) -> usize {
        let side = 2 * self.radius as usize + 1;
        if self.dimensions.is_planar() {
            side * side
        } else {
            side * side * side
        }
    }
}

/// One bucket of the grid
#[derive(Debug)]
pub struct Cell {
    coord: CellCoord,
    entities: SmallVec<[EntityId; 8]>,
    clients: SmallVec<[EntityId; 4]>,
    visibility: OnceLock<Arc<[CellCoord]>>,
}

impl Cell {
    fn new(coord: CellCoord) -> Self {
        Self {
            coord,
            entities: SmallVec::new(),
            clients: SmallVec::new(),
            visibility: OnceLock::new(),
        }
    }

    pub fn coord(&self) -> CellCoord {
        self.coord
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Connection-bound entities in this cell
    pub fn clients(&self) -> &[EntityId] {
        &self.clients
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Cells this one sees; computed on first use
    pub fn visibility(&self, layout: &GridLayout) -> Arc<[CellCoord]> {
        self.visibility
            .get_or_init(|| layout.visible_from(self.coord).into())
            .clone()
    }

    fn insert(&mut self, entity: EntityId, client: bool) {
        self.entities.push(entity);
        if client {
            self.clients.push(entity);
        }
    }

    /// Returns whether the entity was a client
    fn take(&mut self, entity: EntityId) -> bool {
        if let Some(i) = self.entities.iter().position(|e| *e == entity) {
            self.entities.swap_remove(i);
        }
        match self.clients.iter().position(|e| *e == entity) {
            Some(i) => {
                self.clients.swap_remove(i);
                true
            }
            None => false,
        }
    }
}

/// Which way an interest change goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    Gain,
    Lose,
}

/// Lazily populated cell table for one map
#[derive(Debug)]
pub struct Grid {
    layout: GridLayout,
    cells: HashMap<CellCoord, Cell>,
    locations: FxHashMap<EntityId, CellCoord>,
}

impl Grid {
    pub fn new(layout: GridLayout) -> Self {
        Self {
            layout,
            cells: HashMap::with_capacity(GRID_INITIAL_CAPACITY),
            locations: FxHashMap::default(),
        }
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn cell(&self, coord: CellCoord) -> Option<&Cell> {
        self.cells.get(&coord)
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    pub fn location(&self, entity: EntityId) -> Option<CellCoord> {
        self.locations.get(&entity).copied()
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.locations.contains_key(&entity)
    }

    pub fn entity_count(&self) -> usize {
        self.locations.len()
    }

    pub fn client_count(&self) -> usize {
        self.cells.values().map(|c| c.clients.len()).sum()
    }

    /// Place `entity` in the cell for `position` and subscribe both ways
    ///
    /// A client is subscribed to its own entity exactly once. Returns false
    /// if the entity is already on the grid.
    pub fn add_entity(
        &mut self,
        entity: EntityId,
        client: bool,
        position: Vec3,
        sink: &dyn SubscriptionSink,
    ) -> bool {
        if self.locations.contains_key(&entity) {
            return false;
        }
        let coord = self.layout.cell_for(position);
        let layout = self.layout;
        let cell = self.cells.entry(coord).or_insert_with(|| Cell::new(coord));
        cell.insert(entity, client);
        let visible = cell.visibility(&layout);
        self.locations.insert(entity, coord);

        if client {
            sink.subscribe(entity, entity);
        }
        self.notify(&visible, entity, client, Interest::Gain, sink);
        true
    }

    /// Take `entity` off the grid and unsubscribe both ways
    ///
    /// A client keeps its subscription to its own entity.
    pub fn remove_entity(&mut self, entity: EntityId, sink: &dyn SubscriptionSink) -> bool {
        let Some(coord) = self.locations.remove(&entity) else {
            return false;
        };
        let layout = self.layout;
        let Some(cell) = self.cells.get_mut(&coord) else {
            return false;
        };
        let client = cell.take(entity);
        let visible = cell.visibility(&layout);
        if cell.is_empty() {
            self.cells.remove(&coord);
        }

        self.notify(&visible, entity, client, Interest::Lose, sink);
        true
    }

    /// Move `entity` to the cell for `position`
    ///
    /// Only cells that leave or enter view produce (un)subscribes. Returns
    /// the old and new cell when the entity changed cells.
    pub fn transfer_entity(
        &mut self,
        entity: EntityId,
        position: Vec3,
        sink: &dyn SubscriptionSink,
    ) -> Option<(CellCoord, CellCoord)> {
        let from = self.location(entity)?;
        let to = self.layout.cell_for(position);
        if from == to {
            return None;
        }

        let layout = self.layout;
        let (client, old_visible) = {
            let cell = self.cells.get_mut(&from)?;
            let client = cell.take(entity);
            let visible = cell.visibility(&layout);
            if cell.is_empty() {
                self.cells.remove(&from);
            }
            (client, visible)
        };

        let cell = self.cells.entry(to).or_insert_with(|| Cell::new(to));
        cell.insert(entity, client);
        let new_visible = cell.visibility(&layout);
        self.locations.insert(entity, to);

        let old_set: FxHashSet<CellCoord> = old_visible.iter().copied().collect();
        let new_set: FxHashSet<CellCoord> = new_visible.iter().copied().collect();
        let lost: SmallVec<[CellCoord; 16]> = old_visible
            .iter()
            .copied()
            .filter(|c| !new_set.contains(c))
            .collect();
        let gained: SmallVec<[CellCoord; 16]> = new_visible
            .iter()
            .copied()
            .filter(|c| !old_set.contains(c))
            .collect();

        self.notify(&lost, entity, client, Interest::Lose, sink);
        self.notify(&gained, entity, client, Interest::Gain, sink);
        Some((from, to))
    }

    fn notify(
        &self,
        coords: &[CellCoord],
        entity: EntityId,
        client: bool,
        interest: Interest,
        sink: &dyn SubscriptionSink,
    ) {
        let apply = |connection: EntityId, target: EntityId| match interest {
            Interest::Gain => sink.subscribe(connection, target),
            Interest::Lose => sink.unsubscribe(connection, target),
        };

        for coord in coords {
            let Some(cell) = self.cells.get(coord) else {
                continue;
            };
            for &viewer in cell.clients.iter().filter(|c| **c != entity) {
                apply(viewer, entity);
            }
            if client {
                for &other in cell.entities.iter().filter(|e| **e != entity) {
                    apply(entity, other);
                }
            }
        }
    }

    /// Broad-phase collision pass: candidate pairs per cell
    ///
    /// Narrow-phase resolution is not implemented; the count feeds tracing.
    pub fn collision_candidates(&self) -> usize {
        self.cells
            .values()
            .map(|c| c.entities.len() * c.entities.len().saturating_sub(1) / 2)
            .sum()
    }
}
