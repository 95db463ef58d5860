//! World storage collaborator.
//!
//! The engine reads and writes authoritative world state only through the
//! [`WorldStorage`] trait, and only while committing a phase. [`MemoryWorld`]
//! is a complete in-memory implementation used by embedders without their
//! own storage and by the test suite.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use slotmap::SlotMap;

use crate::context::EntityDescriptor;
use crate::id::*;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by world storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("position {0} is outside the loaded world")]
    Unloaded(BlockPos),
    #[error("entity could not be spawned at {pos}: {reason}")]
    SpawnRejected { pos: BlockPos, reason: String },
    #[error("actor {0:?} is not present")]
    UnknownActor(ActorId),
}

// ---------------------------------------------------------------------------
// Attribution
// ---------------------------------------------------------------------------

/// Who last mutated a position, directly (creator) or indirectly (notifier).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionAttribution {
    pub creator: Option<ActorId>,
    pub notifier: Option<ActorId>,
}

// ---------------------------------------------------------------------------
// WorldStorage trait
// ---------------------------------------------------------------------------

/// Authoritative world state, as seen by the commit path.
pub trait WorldStorage {
    fn get_block(&self, pos: BlockPos) -> BlockState;

    /// Write a block state. Returns the state that was replaced.
    fn set_block(&mut self, pos: BlockPos, state: BlockState) -> Result<BlockState, WorldError>;

    fn spawn_entity(&mut self, descriptor: &EntityDescriptor) -> Result<EntityId, WorldError>;

    /// Deliver a neighbor update from `source` to `target`.
    fn notify_neighbor(&mut self, source: BlockPos, target: BlockPos) -> Result<(), WorldError> {
        let _ = (source, target);
        Ok(())
    }

    /// Record the creator/notifier of a position's last mutation.
    fn set_attribution(&mut self, pos: BlockPos, attribution: PositionAttribution) {
        let _ = (pos, attribution);
    }

    /// Return an item to an actor, e.g. after a rejected placement consumed it.
    fn give_item(&mut self, actor: ActorId, item: ItemStack) -> Result<(), WorldError> {
        let _ = (actor, item);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryWorld
// ---------------------------------------------------------------------------

/// A materialized entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub descriptor: EntityDescriptor,
}

/// In-memory world storage. Unset positions read as air.
#[derive(Debug, Default)]
pub struct MemoryWorld {
    blocks: HashMap<BlockPos, BlockState>,
    entities: SlotMap<EntityId, EntityRecord>,
    attribution: HashMap<BlockPos, PositionAttribution>,
    inventories: BTreeMap<ActorId, Vec<ItemStack>>,
    /// Every successful block write, in application order.
    write_log: Vec<(BlockPos, BlockState)>,
    /// Every delivered neighbor update, in delivery order.
    notifications: Vec<(BlockPos, BlockPos)>,
    /// Positions whose writes fail, for exercising failure paths.
    failing: BTreeSet<BlockPos>,
    /// When set, spawning fails.
    reject_spawns: bool,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a block without going through the commit path or the write log.
    pub fn with_block(mut self, pos: BlockPos, state: BlockState) -> Self {
        self.blocks.insert(pos, state);
        self
    }

    /// Make writes to `pos` fail with [`WorldError::Unloaded`].
    pub fn fail_writes_at(&mut self, pos: BlockPos) {
        self.failing.insert(pos);
    }

    pub fn reject_spawns(&mut self, reject: bool) {
        self.reject_spawns = reject;
    }

    pub fn write_log(&self) -> &[(BlockPos, BlockState)] {
        &self.write_log
    }

    pub fn clear_write_log(&mut self) {
        self.write_log.clear();
    }

    pub fn notifications(&self) -> &[(BlockPos, BlockPos)] {
        &self.notifications
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &EntityRecord)> {
        self.entities.iter()
    }

    pub fn attribution(&self, pos: BlockPos) -> Option<PositionAttribution> {
        self.attribution.get(&pos).copied()
    }

    pub fn inventory(&self, actor: ActorId) -> &[ItemStack] {
        self.inventories
            .get(&actor)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Register an actor so items can be returned to it.
    pub fn add_actor(&mut self, actor: ActorId) {
        self.inventories.entry(actor).or_default();
    }
}

impl WorldStorage for MemoryWorld {
    fn get_block(&self, pos: BlockPos) -> BlockState {
        self.blocks.get(&pos).copied().unwrap_or(BlockState::AIR)
    }

    fn set_block(&mut self, pos: BlockPos, state: BlockState) -> Result<BlockState, WorldError> {
        if self.failing.contains(&pos) {
            return Err(WorldError::Unloaded(pos));
        }
        let previous = if state.is_air() {
            self.blocks.remove(&pos)
        } else {
            self.blocks.insert(pos, state)
        };
        self.write_log.push((pos, state));
        Ok(previous.unwrap_or(BlockState::AIR))
    }

    fn spawn_entity(&mut self, descriptor: &EntityDescriptor) -> Result<EntityId, WorldError> {
        if self.reject_spawns || self.failing.contains(&descriptor.pos) {
            return Err(WorldError::SpawnRejected {
                pos: descriptor.pos,
                reason: "spawning disabled".to_string(),
            });
        }
        Ok(self.entities.insert(EntityRecord {
            descriptor: descriptor.clone(),
        }))
    }

    fn notify_neighbor(&mut self, source: BlockPos, target: BlockPos) -> Result<(), WorldError> {
        if self.failing.contains(&target) {
            return Err(WorldError::Unloaded(target));
        }
        self.notifications.push((source, target));
        Ok(())
    }

    fn set_attribution(&mut self, pos: BlockPos, attribution: PositionAttribution) {
        self.attribution.insert(pos, attribution);
    }

    fn give_item(&mut self, actor: ActorId, item: ItemStack) -> Result<(), WorldError> {
        match self.inventories.get_mut(&actor) {
            Some(items) => {
                items.push(item);
                Ok(())
            }
            None => Err(WorldError::UnknownActor(actor)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn unset_positions_read_as_air() {
        let world = MemoryWorld::new();
        assert_eq!(world.get_block(BlockPos::new(3, 4, 5)), BlockState::AIR);
    }

    #[test]
    fn set_block_returns_previous_and_logs() {
        let pos = BlockPos::new(0, 64, 0);
        let mut world = MemoryWorld::new().with_block(pos, dirt());
        assert_eq!(world.set_block(pos, stone()), Ok(dirt()));
        assert_eq!(world.set_block(pos, BlockState::AIR), Ok(stone()));
        assert_eq!(world.get_block(pos), BlockState::AIR);
        assert_eq!(world.write_log(), &[(pos, stone()), (pos, BlockState::AIR)]);
    }

    #[test]
    fn failing_positions_reject_writes() {
        let pos = BlockPos::new(1, 1, 1);
        let mut world = MemoryWorld::new();
        world.fail_writes_at(pos);
        assert_eq!(world.set_block(pos, stone()), Err(WorldError::Unloaded(pos)));
        assert!(world.write_log().is_empty());
    }

    #[test]
    fn spawned_entities_are_retrievable() {
        let mut world = MemoryWorld::new();
        let descriptor = dropped_item(BlockPos::new(0, 64, 0), 3);
        let id = world.spawn_entity(&descriptor).unwrap();
        assert_eq!(world.entity(id).map(|e| &e.descriptor), Some(&descriptor));
        assert_eq!(world.entity_count(), 1);

        world.reject_spawns(true);
        assert!(world.spawn_entity(&descriptor).is_err());
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn give_item_requires_known_actor() {
        let mut world = MemoryWorld::new();
        let stack = ItemStack::new(ItemTypeId(4), 1);
        assert!(world.give_item(ActorId(1), stack.clone()).is_err());
        world.add_actor(ActorId(1));
        world.give_item(ActorId(1), stack.clone()).unwrap();
        assert_eq!(world.inventory(ActorId(1)), &[stack]);
    }
}
