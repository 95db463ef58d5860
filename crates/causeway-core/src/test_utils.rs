//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::cell::RefCell;
use std::rc::Rc;

use crate::context::{EntityCategory, EntityDescriptor, SpawnCandidate};
use crate::event::{Event, EventKind, ListenerBus};
use crate::id::*;
use crate::phase::SpawnType;

// ===========================================================================
// Block states
// ===========================================================================

pub fn stone() -> BlockState {
    BlockState(1)
}
pub fn dirt() -> BlockState {
    BlockState(2)
}
pub fn grass() -> BlockState {
    BlockState(3)
}
pub fn sand() -> BlockState {
    BlockState(4)
}

// ===========================================================================
// Items and entities
// ===========================================================================

pub fn cobblestone_item() -> ItemTypeId {
    ItemTypeId(1)
}
pub fn spawn_egg_item() -> ItemTypeId {
    ItemTypeId(20)
}

pub fn item_entity() -> EntityTypeId {
    EntityTypeId(1)
}
pub fn zombie() -> EntityTypeId {
    EntityTypeId(10)
}

pub fn spawn_egg() -> ItemStack {
    ItemStack::new(spawn_egg_item(), 1)
}

/// An item entity carrying `quantity` cobblestone.
pub fn item_candidate(pos: BlockPos, quantity: u32) -> SpawnCandidate {
    SpawnCandidate::new(item_entity(), EntityCategory::Item, pos)
        .with_item(ItemStack::new(cobblestone_item(), quantity))
}

pub fn mob_candidate(pos: BlockPos) -> SpawnCandidate {
    SpawnCandidate::new(zombie(), EntityCategory::Living, pos)
}

/// A classified dropped item, as captured into item-drop buffers.
pub fn dropped_item(pos: BlockPos, quantity: u32) -> EntityDescriptor {
    EntityDescriptor::from_candidate(item_candidate(pos, quantity), SpawnType::DroppedItem)
}

// ===========================================================================
// Listener setups
// ===========================================================================

fn test_plugin() -> PluginId {
    PluginId::new("test")
}

/// Cancel every event of `kind`.
pub fn cancel_all(bus: &mut ListenerBus, kind: EventKind) {
    bus.on_intercept(
        kind,
        test_plugin(),
        Box::new(|event| {
            event.set_cancelled(true);
            Ok(())
        }),
    );
}

/// Invalidate the block transaction at `pos` in every `ChangeBlocks` event.
pub fn invalidate_at(bus: &mut ListenerBus, pos: BlockPos) {
    bus.on_intercept(
        EventKind::ChangeBlocks,
        test_plugin(),
        Box::new(move |event| {
            if let Event::ChangeBlocks(change) = event
                && let Some(transaction) = change.transaction_mut(pos)
            {
                transaction.invalidate();
            }
            Ok(())
        }),
    );
}

/// Record a copy of every event of `kind` as delivered to listeners.
pub fn record_events(bus: &mut ListenerBus, kind: EventKind) -> Rc<RefCell<Vec<Event>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    bus.on_observe(
        kind,
        test_plugin(),
        Box::new(move |event| sink.borrow_mut().push(event.clone())),
    );
    seen
}
