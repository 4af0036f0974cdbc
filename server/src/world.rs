//! Authoritative entity store for one zone.
//!
//! Entities are 32-bit ids packing a 20-bit slot and a 12-bit generation.
//! Components live in parallel dense columns indexed by slot, so a pass over
//! one component touches one contiguous vector. Destroying an entity bumps the
//! slot's generation; any id minted before that fails every lookup instead of
//! reaching the slot's next occupant.

use crate::client_manager::ConnectionId;
use crate::components::{CombatState, EntityKind, GlobalId, Transform, VelocityState};
use crate::error::WorldError;
use crate::validation::ViolationTracker;
use crate::zone::migration::MigrationState;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u32);

impl EntityId {
    pub const SLOT_BITS: u32 = 20;
    const SLOT_MASK: u32 = (1 << Self::SLOT_BITS) - 1;
    pub const MAX_SLOTS: usize = 1 << Self::SLOT_BITS;
    pub const MAX_GENERATION: u32 = (1 << (32 - Self::SLOT_BITS)) - 1;

    fn new(slot: u32, generation: u32) -> Self {
        EntityId((generation << Self::SLOT_BITS) | (slot & Self::SLOT_MASK))
    }

    pub fn slot(self) -> usize {
        (self.0 & Self::SLOT_MASK) as usize
    }

    pub fn generation(self) -> u32 {
        self.0 >> Self::SLOT_BITS
    }

    /// The value sent on the wire.
    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        EntityId(raw)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot(), self.generation())
    }
}

/// A component type with its own dense column in the world.
pub trait Component: Sized + 'static {
    fn column(columns: &Columns) -> &Vec<Option<Self>>;
    fn column_mut(columns: &mut Columns) -> &mut Vec<Option<Self>>;
}

macro_rules! component_columns {
    ($($field:ident: $ty:ty),* $(,)?) => {
        /// One dense column per component type.
        #[derive(Debug, Default)]
        pub struct Columns {
            $($field: Vec<Option<$ty>>,)*
        }

        impl Columns {
            fn grow(&mut self, len: usize) {
                $(self.$field.resize_with(len, || None);)*
            }

            fn clear_slot(&mut self, slot: usize) {
                $(self.$field[slot] = None;)*
            }

            fn all_len(&self, len: usize) -> bool {
                true $(&& self.$field.len() == len)*
            }
        }

        $(
            impl Component for $ty {
                fn column(columns: &Columns) -> &Vec<Option<Self>> {
                    &columns.$field
                }

                fn column_mut(columns: &mut Columns) -> &mut Vec<Option<Self>> {
                    &mut columns.$field
                }
            }
        )*
    };
}

component_columns! {
    transforms: Transform,
    velocities: VelocityState,
    combat: CombatState,
    kinds: EntityKind,
    migration: MigrationState,
    violations: ViolationTracker,
    controllers: ConnectionId,
}

#[derive(Debug)]
pub struct World {
    generations: Vec<u32>,
    alive: Vec<bool>,
    globals: Vec<Option<GlobalId>>,
    free: Vec<u32>,
    columns: Columns,
    by_global: HashMap<GlobalId, EntityId>,
    live: usize,
    capacity: usize,
}

impl World {
    pub fn new(capacity: usize) -> Self {
        Self {
            generations: Vec::new(),
            alive: Vec::new(),
            globals: Vec::new(),
            free: Vec::new(),
            columns: Columns::default(),
            by_global: HashMap::new(),
            live: 0,
            capacity: capacity.min(EntityId::MAX_SLOTS),
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Allocates a new entity with no components.
    pub fn create(&mut self) -> Result<EntityId, WorldError> {
        if self.live >= self.capacity {
            return Err(WorldError::Capacity);
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                if self.generations.len() >= self.capacity {
                    return Err(WorldError::Capacity);
                }
                let slot = self.generations.len() as u32;
                let len = slot as usize + 1;
                self.generations.push(0);
                self.alive.push(false);
                self.globals.push(None);
                self.columns.grow(len);
                slot
            }
        };

        let index = slot as usize;
        self.check_slot_tables(index);
        self.alive[index] = true;
        self.live += 1;
        Ok(EntityId::new(slot, self.generations[index]))
    }

    /// Allocates an entity carrying a zone-independent identity.
    pub fn create_with_global(&mut self, global: GlobalId) -> Result<EntityId, WorldError> {
        if let Some(existing) = self.by_global.get(&global) {
            return Err(WorldError::DuplicateGlobal(*existing));
        }
        let id = self.create()?;
        self.globals[id.slot()] = Some(global);
        self.by_global.insert(global, id);
        Ok(id)
    }

    pub fn destroy(&mut self, id: EntityId) -> Result<(), WorldError> {
        let slot = self.resolve(id)?;
        self.columns.clear_slot(slot);
        if let Some(global) = self.globals[slot].take() {
            self.by_global.remove(&global);
        }
        self.alive[slot] = false;
        self.live -= 1;

        // A slot whose generation would wrap is retired rather than reused.
        if self.generations[slot] < EntityId::MAX_GENERATION {
            self.generations[slot] += 1;
            self.free.push(slot as u32);
        }
        Ok(())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.resolve(id).is_ok()
    }

    /// Maps a live id to its slot.
    pub fn resolve(&self, id: EntityId) -> Result<usize, WorldError> {
        let slot = id.slot();
        if slot >= self.generations.len() {
            return Err(WorldError::NotFound(id));
        }
        if self.generations[slot] != id.generation() {
            return Err(WorldError::Stale(id));
        }
        if !self.alive[slot] {
            return Err(WorldError::NotFound(id));
        }
        Ok(slot)
    }

    pub fn get<T: Component>(&self, id: EntityId) -> Option<&T> {
        let slot = self.resolve(id).ok()?;
        T::column(&self.columns)[slot].as_ref()
    }

    pub fn get_mut<T: Component>(&mut self, id: EntityId) -> Option<&mut T> {
        let slot = self.resolve(id).ok()?;
        T::column_mut(&mut self.columns)[slot].as_mut()
    }

    /// Attaches or replaces a component, returning the previous value.
    pub fn set<T: Component>(&mut self, id: EntityId, value: T) -> Result<Option<T>, WorldError> {
        let slot = self.resolve(id)?;
        Ok(T::column_mut(&mut self.columns)[slot].replace(value))
    }

    pub fn remove<T: Component>(&mut self, id: EntityId) -> Option<T> {
        let slot = self.resolve(id).ok()?;
        T::column_mut(&mut self.columns)[slot].take()
    }

    pub fn global(&self, id: EntityId) -> Option<GlobalId> {
        let slot = self.resolve(id).ok()?;
        self.globals[slot]
    }

    pub fn find_global(&self, global: GlobalId) -> Option<EntityId> {
        self.by_global.get(&global).copied()
    }

    /// Live entity ids in slot order.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, alive)| **alive)
            .map(|(slot, _)| EntityId::new(slot as u32, self.generations[slot]))
    }

    /// Live entities carrying component `T`, in slot order.
    pub fn iter<T: Component>(&self) -> impl Iterator<Item = (EntityId, &T)> + '_ {
        T::column(&self.columns)
            .iter()
            .enumerate()
            .filter_map(move |(slot, value)| {
                let value = value.as_ref()?;
                self.alive[slot]
                    .then(|| (EntityId::new(slot as u32, self.generations[slot]), value))
            })
    }

    fn check_slot_tables(&self, slot: usize) {
        let len = self.generations.len();
        if self.alive.len() != len || self.globals.len() != len || !self.columns.all_len(len) {
            panic!(
                "corrupted entity slot table: {} generations, {} alive flags, {} globals",
                len,
                self.alive.len(),
                self.globals.len()
            );
        }
        if self.alive[slot] {
            panic!(
                "corrupted entity slot table: free slot {} (generation {}) is still alive",
                slot, self.generations[slot]
            );
        }
    }
}

impl Default for World {
    fn default() -> Self {
        World::new(EntityId::MAX_SLOTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::Vec3;

    #[test]
    fn test_create_and_get_component() {
        let mut world = World::new(16);
        let id = world.create().unwrap();

        assert!(world.get::<Transform>(id).is_none());
        world
            .set(id, Transform::at(Vec3::new(1.0, 0.0, 2.0)))
            .unwrap();

        let transform = world.get::<Transform>(id).unwrap();
        assert_eq!(transform.position.x, 1.0);
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn test_stale_id_is_rejected_after_reuse() {
        let mut world = World::new(16);
        let old = world.create().unwrap();
        world.set(old, EntityKind::Npc).unwrap();
        world.destroy(old).unwrap();

        let new = world.create().unwrap();
        assert_eq!(new.slot(), old.slot());
        assert_ne!(new.generation(), old.generation());

        world.set(new, EntityKind::Item).unwrap();
        assert!(world.get::<EntityKind>(old).is_none());
        assert_eq!(world.set(old, EntityKind::Player), Err(WorldError::Stale(old)));
        assert_eq!(world.destroy(old), Err(WorldError::Stale(old)));
        assert_eq!(world.get::<EntityKind>(new), Some(&EntityKind::Item));
    }

    #[test]
    fn test_destroy_clears_components() {
        let mut world = World::new(16);
        let id = world.create().unwrap();
        world.set(id, EntityKind::Npc).unwrap();
        world.destroy(id).unwrap();

        let reused = world.create().unwrap();
        assert!(world.get::<EntityKind>(reused).is_none());
    }

    #[test]
    fn test_unknown_id_not_found() {
        let world = World::new(16);
        let id = EntityId::from_raw(5);
        assert_eq!(world.resolve(id), Err(WorldError::NotFound(id)));
    }

    #[test]
    fn test_capacity_limit() {
        let mut world = World::new(2);
        world.create().unwrap();
        world.create().unwrap();
        assert_eq!(world.create(), Err(WorldError::Capacity));
    }

    #[test]
    fn test_global_index() {
        let mut world = World::new(16);
        let global = GlobalId::player(9);
        let id = world.create_with_global(global).unwrap();

        assert_eq!(world.find_global(global), Some(id));
        assert_eq!(world.global(id), Some(global));
        assert_eq!(
            world.create_with_global(global),
            Err(WorldError::DuplicateGlobal(id))
        );

        world.destroy(id).unwrap();
        assert_eq!(world.find_global(global), None);
    }

    #[test]
    fn test_iter_skips_dead_and_missing() {
        let mut world = World::new(16);
        let a = world.create().unwrap();
        let b = world.create().unwrap();
        let c = world.create().unwrap();
        world.set(a, EntityKind::Npc).unwrap();
        world.set(c, EntityKind::Item).unwrap();
        world.set(b, Transform::default()).unwrap();
        world.destroy(a).unwrap();

        let kinds: Vec<_> = world.iter::<EntityKind>().collect();
        assert_eq!(kinds, vec![(c, &EntityKind::Item)]);
        assert_eq!(world.entities().count(), 2);
    }

    #[test]
    fn test_raw_roundtrip() {
        let id = EntityId::new(1234, 7);
        assert_eq!(EntityId::from_raw(id.to_raw()), id);
        assert_eq!(id.slot(), 1234);
        assert_eq!(id.generation(), 7);
    }
}
