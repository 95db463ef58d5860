//! End-to-end capture/commit scenarios.
//!
//! Each test drives a `PhaseTracker` against `MemoryWorld` and `ListenerBus`
//! the way a server's trigger sources would.

use causeway_core::cause::{CauseEntry, ContextKey, ContextValue};
use causeway_core::event::*;
use causeway_core::id::*;
use causeway_core::phase::*;
use causeway_core::test_utils::*;
use causeway_core::tracker::PhaseTracker;
use causeway_core::transaction::GroupStatus;
use causeway_core::world::{MemoryWorld, PositionAttribution, WorldStorage};

fn setup() -> (PhaseTracker, MemoryWorld, ListenerBus) {
    (PhaseTracker::default(), MemoryWorld::new(), ListenerBus::default())
}

const ORIGIN: BlockPos = BlockPos::new(0, 64, 0);

// ===========================================================================
// Basic commit and cancel
// ===========================================================================

/// An accepted phase writes its captured block.
#[test]
fn accepted_block_change_is_applied() {
    let (mut tracker, mut world, mut bus) = setup();

    let handle = tracker.enter(&PLUGIN_TASK).unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    assert_eq!(world.get_block(ORIGIN), BlockState::AIR);
    let report = tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert!(report.is_success());
    assert_eq!(world.get_block(ORIGIN), stone());
    assert_eq!(report.receipts().len(), 1);
    assert_eq!(report.receipts()[0].operation, BlockOperation::Place);
}

/// A cancelled block event leaves storage untouched.
#[test]
fn cancelled_block_change_is_discarded() {
    let (mut tracker, mut world, mut bus) = setup();
    cancel_all(&mut bus, EventKind::ChangeBlocks);

    let handle = tracker.enter(&PLUGIN_TASK).unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    let report = tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert_eq!(world.get_block(ORIGIN), BlockState::AIR);
    assert!(report.blocks_rejected());
    assert_eq!(report.blocks.unwrap().status, GroupStatus::Cancelled);
    // No post event for a cancelled group.
    assert_eq!(bus.posted_count(EventKind::ChangeBlocksPost), 0);
}

/// A child phase commits before its parent, and the parent's buffer is not
/// touched by it.
#[test]
fn nested_phase_commits_first() {
    let (mut tracker, mut world, mut bus) = setup();
    let x = BlockPos::new(1, 64, 0);
    let y = BlockPos::new(2, 64, 0);

    let outer = tracker.enter(&PLUGIN_TASK).unwrap();
    tracker.set_block(&mut world, x, stone()).unwrap();

    let inner = tracker.enter(&COMMAND).unwrap();
    tracker.set_block(&mut world, y, dirt()).unwrap();
    tracker.complete(inner, &mut world, &mut bus).unwrap();

    assert_eq!(world.get_block(y), dirt());
    assert_eq!(world.get_block(x), BlockState::AIR);
    assert_eq!(tracker.current().1.captured_blocks().len(), 1);

    tracker.complete(outer, &mut world, &mut bus).unwrap();
    assert_eq!(world.get_block(x), stone());
    assert_eq!(world.write_log(), &[(y, dirt()), (x, stone())]);
}

/// Repeated captures at one position collapse to a single write carrying
/// the first original and the last proposed state.
#[test]
fn last_write_wins_with_first_original() {
    let (mut tracker, mut world, mut bus) = setup();
    let seen = record_events(&mut bus, EventKind::ChangeBlocks);

    let handle = tracker.enter(&PLUGIN_TASK).unwrap();
    assert_eq!(tracker.set_block(&mut world, ORIGIN, stone()).unwrap(), BlockState::AIR);
    assert_eq!(tracker.set_block(&mut world, ORIGIN, dirt()).unwrap(), stone());
    tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert_eq!(world.write_log(), &[(ORIGIN, dirt())]);
    let events = seen.borrow();
    let Event::ChangeBlocks(change) = &events[0] else {
        panic!("expected a block change event");
    };
    assert_eq!(change.transactions().len(), 1);
    assert_eq!(change.transactions()[0].original(), BlockState::AIR);
    assert_eq!(change.transactions()[0].final_state(), dirt());
}

/// Captures replay in capture order, one write per position.
#[test]
fn writes_follow_first_capture_order() {
    let (mut tracker, mut world, mut bus) = setup();
    let positions: Vec<BlockPos> = (0..5).map(|x| BlockPos::new(4 - x, 64, 0)).collect();

    let handle = tracker.enter(&PLUGIN_TASK).unwrap();
    for &pos in &positions {
        tracker.set_block(&mut world, pos, stone()).unwrap();
    }
    tracker.complete(handle, &mut world, &mut bus).unwrap();

    let written: Vec<BlockPos> = world.write_log().iter().map(|(p, _)| *p).collect();
    assert_eq!(written, positions);
}

/// Listeners may rewrite the final state of a single position.
#[test]
fn listener_custom_state_is_written() {
    let (mut tracker, mut world, mut bus) = setup();
    bus.on_intercept(
        EventKind::ChangeBlocks,
        PluginId::new("terraform"),
        Box::new(|event| {
            if let Event::ChangeBlocks(change) = event
                && let Some(transaction) = change.transaction_mut(ORIGIN)
            {
                transaction.set_custom(grass());
            }
            Ok(())
        }),
    );

    let handle = tracker.enter(&PLUGIN_TASK).unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    tracker.complete(handle, &mut world, &mut bus).unwrap();
    assert_eq!(world.get_block(ORIGIN), grass());
}

// ===========================================================================
// Immediate capture
// ===========================================================================

/// Immediate phases apply on capture and restore when cancelled.
#[test]
fn immediate_phase_restores_on_cancel() {
    let (mut tracker, _, mut bus) = setup();
    let mut world = MemoryWorld::new().with_block(ORIGIN, grass());
    cancel_all(&mut bus, EventKind::ChangeBlocks);

    let handle = tracker
        .enter_with(&BLOCK_TICK, |ctx| {
            if let Some(tick) = ctx.tick_mut() {
                tick.block = Some(BlockSnapshot::new(ORIGIN, grass()));
            }
        })
        .unwrap();
    tracker.set_block(&mut world, ORIGIN, dirt()).unwrap();
    assert_eq!(world.get_block(ORIGIN), dirt());
    tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert_eq!(world.get_block(ORIGIN), grass());
}

// ===========================================================================
// Spawns and item handling
// ===========================================================================

/// Spawn groups are classified by the phase and materialized once accepted.
#[test]
fn accepted_drop_is_materialized() {
    let (mut tracker, mut world, mut bus) = setup();
    let blocks = record_events(&mut bus, EventKind::ChangeBlocks);
    let spawns = record_events(&mut bus, EventKind::SpawnEntities);

    let handle = tracker.enter(&PLUGIN_TASK).unwrap();
    tracker.drop_item(&mut world, item_candidate(ORIGIN, 2)).unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    let report = tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert_eq!(blocks.borrow().len(), 1);
    assert_eq!(spawns.borrow().len(), 1);
    let spawned = report.spawned();
    assert_eq!(spawned.len(), 1);
    let record = world.entity(spawned[0]).unwrap();
    assert_eq!(record.descriptor.spawn_type, SpawnType::Plugin);
}

/// A rejected placement hands the consumed item back to the actor.
#[test]
fn rejected_placement_refunds_item() {
    let (mut tracker, mut world, mut bus) = setup();
    let player = ActorId(1);
    world.add_actor(player);
    cancel_all(&mut bus, EventKind::ChangeBlocks);

    let block = ItemStack::new(ItemTypeId(1), 1);
    let used = block.clone();
    let handle = tracker
        .enter_with(&PLACE_BLOCK, move |ctx| {
            ctx.set_source(CauseEntry::Actor(player));
            if let Some(packet) = ctx.packet_mut() {
                packet.actor = Some(player);
                packet.used_item = Some(used);
            }
        })
        .unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert_eq!(world.get_block(ORIGIN), BlockState::AIR);
    assert_eq!(world.inventory(player), &[block]);
}

/// An accepted placement keeps the item consumed and attributes the
/// position to the player.
#[test]
fn accepted_placement_attributes_position() {
    let (mut tracker, mut world, mut bus) = setup();
    let player = ActorId(3);
    world.add_actor(player);

    let handle = tracker
        .enter_with(&PLACE_BLOCK, |ctx| {
            if let Some(packet) = ctx.packet_mut() {
                packet.actor = Some(player);
                packet.used_item = Some(ItemStack::new(ItemTypeId(1), 1));
            }
        })
        .unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert!(world.inventory(player).is_empty());
    assert_eq!(
        world.attribution(ORIGIN),
        Some(PositionAttribution {
            creator: Some(player),
            notifier: Some(player),
        })
    );
}

/// Events carry the attribution of every enclosing phase.
#[test]
fn events_see_enclosing_attribution() {
    let (mut tracker, mut world, mut bus) = setup();
    let seen = record_events(&mut bus, EventKind::ChangeBlocks);
    let plugin = PluginId::new("worldedit");

    let outer = tracker
        .enter_with(&COMMAND, |ctx| {
            if let Some(command) = ctx.command_mut() {
                command.sender = Some(ActorId(8));
                command.command = "//set stone".to_string();
            }
        })
        .unwrap();
    let plugin_for_task = plugin.clone();
    let inner = tracker
        .enter_with(&PLUGIN_TASK, move |ctx| {
            if let Some(data) = ctx.plugin_mut() {
                data.plugin = Some(plugin_for_task);
            }
        })
        .unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    tracker.complete(inner, &mut world, &mut bus).unwrap();
    tracker.complete(outer, &mut world, &mut bus).unwrap();

    let events = seen.borrow();
    let cause = events[0].cause();
    assert_eq!(cause.root(), &CauseEntry::Plugin(plugin));
    assert_eq!(cause.first_actor(), Some(ActorId(8)));
    assert!(cause.contains(&CauseEntry::Command("//set stone".to_string())));
    assert_eq!(
        cause.context(&ContextKey::PhaseName),
        Some(&ContextValue::Phase("plugin_task"))
    );
    // The outer command's frame is gone once both phases completed.
    assert_eq!(tracker.causes().depth(), 0);
}

/// Explosions that do not break blocks drop their block captures.
#[test]
fn non_breaking_explosion_discards_blocks() {
    let (mut tracker, _, mut bus) = setup();
    let mut world = MemoryWorld::new().with_block(ORIGIN, stone());

    let handle = tracker
        .enter_with(&EXPLOSION, |ctx| {
            if let Some(explosion) = ctx.explosion_mut() {
                explosion.origin = ORIGIN;
                explosion.radius = 3;
                explosion.breaks_blocks = false;
            }
        })
        .unwrap();
    tracker.set_block(&mut world, ORIGIN, BlockState::AIR).unwrap();
    tracker
        .drop_item_from_block(&mut world, ORIGIN, item_candidate(ORIGIN, 1))
        .unwrap();
    let report = tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert_eq!(world.get_block(ORIGIN), stone());
    assert!(report.blocks.is_none());
    assert!(report.spawned().is_empty());
}

// ===========================================================================
// Reactions
// ===========================================================================

/// A reactive listener's follow-up write commits in its own listener phase,
/// attributed to the listener's plugin.
#[test]
fn reactions_commit_in_listener_phase() {
    let (mut tracker, mut world, mut bus) = setup();
    let above = ORIGIN.offset(0, 1, 0);
    bus.on_react(
        EventKind::ChangeBlocksPost,
        PluginId::new("snow"),
        Box::new(move |event| match event {
            Event::ChangeBlocksPost(post) if post.receipts.iter().any(|r| r.pos == ORIGIN) => {
                vec![Reaction::SetBlock {
                    pos: above,
                    state: grass(),
                }]
            }
            _ => Vec::new(),
        }),
    );
    let seen = record_events(&mut bus, EventKind::ChangeBlocks);

    let handle = tracker.enter(&PLUGIN_TASK).unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    let report = tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert_eq!(world.write_log(), &[(ORIGIN, stone()), (above, grass())]);
    assert_eq!(report.nested.len(), 1);
    assert_eq!(report.nested[0].phase, "listener");
    let events = seen.borrow();
    assert_eq!(events[1].cause().root(), &CauseEntry::Plugin(PluginId::new("snow")));
    assert!(tracker.is_idle());
}

// ===========================================================================
// Failure handling
// ===========================================================================

/// A storage failure leaves earlier writes applied and skips later groups.
#[test]
fn failed_group_is_failed_open() {
    let (mut tracker, mut world, mut bus) = setup();
    let a = BlockPos::new(0, 64, 0);
    let b = BlockPos::new(1, 64, 0);
    world.fail_writes_at(b);

    let handle = tracker.enter(&PLUGIN_TASK).unwrap();
    tracker.set_block(&mut world, a, stone()).unwrap();
    tracker.set_block(&mut world, b, stone()).unwrap();
    tracker.drop_item(&mut world, item_candidate(a, 1)).unwrap();
    let report = tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert!(!report.is_success());
    assert_eq!(world.get_block(a), stone());
    assert_eq!(world.entity_count(), 0);
    assert_eq!(report.errors().count(), 1);
    assert!(report.spawns.iter().all(|s| s.status == GroupStatus::Skipped));
}

/// With rollback enabled, the failed group's applied writes are undone.
#[test]
fn rollback_restores_failed_group() {
    let config = causeway_core::config::TrackerConfig {
        rollback_on_failure: true,
        ..Default::default()
    };
    let mut tracker = PhaseTracker::new(config);
    let mut world = MemoryWorld::new().with_block(ORIGIN, grass());
    let mut bus = ListenerBus::default();
    let b = BlockPos::new(1, 64, 0);
    world.fail_writes_at(b);

    let handle = tracker.enter(&PLUGIN_TASK).unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    tracker.set_block(&mut world, b, stone()).unwrap();
    let report = tracker.complete(handle, &mut world, &mut bus).unwrap();

    assert!(!report.is_success());
    assert_eq!(world.get_block(ORIGIN), grass());
}

/// A command reports failure to its caller when its commit failed.
#[test]
fn command_success_reflects_commit() {
    let (mut tracker, mut world, mut bus) = setup();
    world.fail_writes_at(ORIGIN);

    let handle = tracker.enter(&COMMAND).unwrap();
    tracker.set_block(&mut world, ORIGIN, stone()).unwrap();
    let report = tracker.complete(handle, &mut world, &mut bus).unwrap();
    assert!(!report.is_success());
}
