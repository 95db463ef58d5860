//! Commit path for a completing phase.
//!
//! [`TransactionProcessor`] turns a phase context's capture buffers into
//! notification events and, for whatever survives cancellation, world
//! mutations. Groups are processed in a fixed order:
//!
//! 1. Block changes: one pre event, apply (or restore, for immediate
//!    capture), one post event with receipts.
//! 2. Neighbor notifications, in capture order.
//! 3. Spawn groups: unattributed entity spawns, per-producer entity spawns,
//!    unattributed item drops, per-entity drops, per-block drops.
//! 4. Attribution of the committed positions.
//!
//! Each group's event is built with a cause snapshot taken under the
//! completing phase's cause frame, so events see the phase's attribution and
//! that of every phase enclosing it.
//!
//! # Failure
//!
//! A listener or world-storage error fails the group it occurred in. Writes
//! that already succeeded stay applied (failed-open) unless
//! `rollback_on_failure` is set, in which case the failed block group's
//! positions are restored. Every group after a failure is skipped.

use std::collections::HashMap;

use crate::cause::{Cause, CauseEntry, CauseStack, ContextKey, ContextValue};
use crate::context::{BlockChange, EntityDescriptor, NeighborNotification, PhaseContext};
use crate::event::*;
use crate::id::*;
use crate::phase::CapturePolicy;
use crate::world::{PositionAttribution, WorldError, WorldStorage};

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Why a commit group failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("listener rejected delivery: {0}")]
    Listener(#[from] ListenerError),
    #[error("world storage failed: {0}")]
    World(#[from] WorldError),
}

/// How a commit group ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupStatus {
    Committed,
    /// A listener cancelled the group's event; nothing was applied.
    Cancelled,
    Failed(TransactionError),
    /// Not attempted because an earlier group failed.
    Skipped,
}

impl GroupStatus {
    pub fn is_committed(&self) -> bool {
        matches!(self, GroupStatus::Committed)
    }
}

/// Result of the block group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    pub status: GroupStatus,
    /// Positions written, in application order.
    pub receipts: Vec<BlockReceipt>,
    /// Positions whose transaction was invalidated or cancelled.
    pub rejected: Vec<BlockPos>,
}

/// Result of one spawn group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOutcome {
    pub origin: SpawnOrigin,
    pub group: SpawnGroupKind,
    pub status: GroupStatus,
    pub spawned: Vec<EntityId>,
    /// Intents that were cancelled, removed by listeners, or never attempted.
    pub rejected: Vec<EntityDescriptor>,
}

/// Result of one neighbor notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub source: BlockPos,
    pub status: GroupStatus,
    pub delivered: Vec<BlockPos>,
}

/// Everything a phase's unwind did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnwindReport {
    /// Name of the phase kind that unwound.
    pub phase: &'static str,
    pub blocks: Option<BlockOutcome>,
    pub notifications: Vec<NotifyOutcome>,
    pub spawns: Vec<SpawnOutcome>,
    /// Reports of listener phases that replayed reactions to this phase.
    pub nested: Vec<UnwindReport>,
    /// Reactions dropped because reaction replay nested too deeply.
    pub dropped_reactions: usize,
    failed: bool,
}

impl UnwindReport {
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            ..Self::default()
        }
    }

    /// Whether every group of this phase committed, was cancelled, or had
    /// nothing to do. Nested listener phases do not count.
    pub fn is_success(&self) -> bool {
        !self.failed
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Whether captured block changes were cancelled or all invalidated.
    pub fn blocks_rejected(&self) -> bool {
        match &self.blocks {
            Some(outcome) => {
                outcome.status == GroupStatus::Cancelled
                    || (outcome.receipts.is_empty() && !outcome.rejected.is_empty())
            }
            None => false,
        }
    }

    pub fn receipts(&self) -> &[BlockReceipt] {
        self.blocks
            .as_ref()
            .map(|b| b.receipts.as_slice())
            .unwrap_or(&[])
    }

    /// Every entity materialized by this phase, in spawn order.
    pub fn spawned(&self) -> Vec<EntityId> {
        self.spawns
            .iter()
            .flat_map(|group| group.spawned.iter().copied())
            .collect()
    }

    /// Errors of failed groups, in processing order.
    pub fn errors(&self) -> impl Iterator<Item = &TransactionError> {
        let blocks = self.blocks.iter().map(|b| &b.status);
        let notifications = self.notifications.iter().map(|n| &n.status);
        let spawns = self.spawns.iter().map(|s| &s.status);
        blocks
            .chain(notifications)
            .chain(spawns)
            .filter_map(|status| match status {
                GroupStatus::Failed(err) => Some(err),
                _ => None,
            })
    }
}

// ---------------------------------------------------------------------------
// TransactionProcessor
// ---------------------------------------------------------------------------

/// Commits one phase context's captures. Built by the tracker for the
/// duration of a single unwind.
pub struct TransactionProcessor<'a> {
    world: &'a mut dyn WorldStorage,
    bus: &'a mut dyn EventBus,
    causes: &'a mut CauseStack,
    rollback_on_failure: bool,
    /// Set once a group fails; later groups are skipped.
    failed: bool,
}

impl<'a> TransactionProcessor<'a> {
    pub fn new(
        world: &'a mut dyn WorldStorage,
        bus: &'a mut dyn EventBus,
        causes: &'a mut CauseStack,
        rollback_on_failure: bool,
    ) -> Self {
        Self {
            world,
            bus,
            causes,
            rollback_on_failure,
            failed: false,
        }
    }

    pub fn world_mut(&mut self) -> &mut dyn WorldStorage {
        &mut *self.world
    }

    pub fn causes_mut(&mut self) -> &mut CauseStack {
        &mut *self.causes
    }

    /// Whether a group has failed during this unwind.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Run the full commit pipeline over `ctx`'s buffers.
    pub fn process(&mut self, ctx: &mut PhaseContext, policy: CapturePolicy) -> UnwindReport {
        let mut report = UnwindReport::default();

        let changes = ctx.drain_blocks();
        if !changes.is_empty() {
            let pre_applied = policy == CapturePolicy::Immediate;
            report.blocks = Some(self.commit_blocks(changes, pre_applied));
        }

        for notification in ctx.drain_neighbor_notifications() {
            report.notifications.push(self.commit_notification(notification));
        }

        let entities = ctx.drain_entity_spawns();
        self.push_spawn_group(&mut report, SpawnOrigin::Phase, SpawnGroupKind::Entities, entities);
        for (producer, entities) in ctx.drain_entity_spawns_by_producer() {
            self.push_spawn_group(
                &mut report,
                SpawnOrigin::Entity(producer),
                SpawnGroupKind::Entities,
                entities,
            );
        }
        let drops = ctx.drain_item_drops();
        self.push_spawn_group(&mut report, SpawnOrigin::Phase, SpawnGroupKind::ItemDrops, drops);
        for (entity, drops) in ctx.drain_item_drops_by_entity() {
            self.push_spawn_group(
                &mut report,
                SpawnOrigin::Entity(entity),
                SpawnGroupKind::ItemDrops,
                drops,
            );
        }
        for (pos, drops) in ctx.drain_item_drops_by_block() {
            self.push_spawn_group(
                &mut report,
                SpawnOrigin::Block(pos),
                SpawnGroupKind::ItemDrops,
                drops,
            );
        }

        self.assign_attribution(report.receipts());

        if self.failed {
            report.mark_failed();
        }
        report
    }

    // -- Blocks --

    fn commit_blocks(&mut self, changes: Vec<BlockChange>, pre_applied: bool) -> BlockOutcome {
        let transactions = collapse(changes);

        if self.failed {
            return BlockOutcome {
                status: GroupStatus::Skipped,
                receipts: Vec::new(),
                rejected: transactions.iter().map(|t| t.pos()).collect(),
            };
        }

        let cause = self.causes.current_cause();
        let mut event =
            Event::ChangeBlocks(ChangeBlocksEvent::new(cause.clone(), transactions.clone()));
        let posted = self.bus.post(&mut event);
        let transactions = reconcile(transactions, &event);

        let cancelled = match posted {
            Ok(cancelled) => cancelled,
            Err(err) => {
                tracing::warn!(error = %err, "block change listener failed; nothing committed");
                self.failed = true;
                if pre_applied && self.rollback_on_failure {
                    self.restore(transactions.iter().rev());
                }
                return BlockOutcome {
                    status: GroupStatus::Failed(err.into()),
                    receipts: Vec::new(),
                    rejected: transactions.iter().map(|t| t.pos()).collect(),
                };
            }
        };

        if cancelled {
            tracing::trace!(count = transactions.len(), "block changes cancelled");
            if pre_applied {
                self.restore(transactions.iter().rev());
            }
            return BlockOutcome {
                status: GroupStatus::Cancelled,
                receipts: Vec::new(),
                rejected: transactions.iter().map(|t| t.pos()).collect(),
            };
        }

        let mut receipts = Vec::with_capacity(transactions.len());
        let mut rejected = Vec::new();
        for (index, tx) in transactions.iter().enumerate() {
            if !tx.is_valid() {
                if pre_applied {
                    self.restore(std::iter::once(tx));
                }
                rejected.push(tx.pos());
                continue;
            }

            let final_state = tx.final_state();
            let needs_write = !pre_applied || self.world.get_block(tx.pos()) != final_state;
            if needs_write && let Err(err) = self.world.set_block(tx.pos(), final_state) {
                tracing::warn!(pos = %tx.pos(), error = %err, "block write failed");
                self.failed = true;
                if self.rollback_on_failure {
                    if pre_applied {
                        self.restore(transactions.iter().rev());
                    } else {
                        self.restore(transactions[..index].iter().rev());
                    }
                    receipts.clear();
                }
                rejected.extend(transactions[index..].iter().map(|t| t.pos()));
                return BlockOutcome {
                    status: GroupStatus::Failed(err.into()),
                    receipts,
                    rejected,
                };
            }
            receipts.push(BlockReceipt {
                pos: tx.pos(),
                original: tx.original(),
                final_state,
                operation: tx.operation(),
            });
        }

        if !receipts.is_empty() {
            let mut post = Event::ChangeBlocksPost(ChangeBlocksPostEvent {
                cause,
                receipts: receipts.clone(),
            });
            if let Err(err) = self.bus.post(&mut post) {
                tracing::warn!(error = %err, "post-change listener failed; changes stay applied");
                self.failed = true;
                return BlockOutcome {
                    status: GroupStatus::Failed(err.into()),
                    receipts,
                    rejected,
                };
            }
        }

        BlockOutcome {
            status: GroupStatus::Committed,
            receipts,
            rejected,
        }
    }

    fn restore<'t>(&mut self, transactions: impl Iterator<Item = &'t BlockTransaction>) {
        if !restore_blocks(&mut *self.world, transactions) {
            self.failed = true;
        }
    }

    // -- Neighbor notifications --

    fn commit_notification(&mut self, notification: NeighborNotification) -> NotifyOutcome {
        let source = notification.source.pos;
        if self.failed {
            return NotifyOutcome {
                source,
                status: GroupStatus::Skipped,
                delivered: Vec::new(),
            };
        }

        let cause = self.causes.current_cause();
        let mut event = Event::NotifyNeighbors(NotifyNeighborsEvent::new(
            cause,
            notification.source,
            notification.targets,
        ));
        let posted = self.bus.post(&mut event);
        let targets = match event {
            Event::NotifyNeighbors(event) => event.targets,
            _ => Vec::new(),
        };

        match posted {
            Ok(true) => {
                tracing::trace!(%source, "neighbor notification cancelled");
                NotifyOutcome {
                    source,
                    status: GroupStatus::Cancelled,
                    delivered: Vec::new(),
                }
            }
            Ok(false) => {
                let mut delivered = Vec::with_capacity(targets.len());
                for target in targets {
                    if let Err(err) = self.world.notify_neighbor(source, target) {
                        tracing::warn!(%source, %target, error = %err, "neighbor update failed");
                        self.failed = true;
                        return NotifyOutcome {
                            source,
                            status: GroupStatus::Failed(err.into()),
                            delivered,
                        };
                    }
                    delivered.push(target);
                }
                NotifyOutcome {
                    source,
                    status: GroupStatus::Committed,
                    delivered,
                }
            }
            Err(err) => {
                tracing::warn!(%source, error = %err, "neighbor listener failed");
                self.failed = true;
                NotifyOutcome {
                    source,
                    status: GroupStatus::Failed(err.into()),
                    delivered: Vec::new(),
                }
            }
        }
    }

    // -- Spawns --

    fn push_spawn_group(
        &mut self,
        report: &mut UnwindReport,
        origin: SpawnOrigin,
        group: SpawnGroupKind,
        entities: Vec<EntityDescriptor>,
    ) {
        if !entities.is_empty() {
            report.spawns.push(self.commit_spawns(origin, group, entities));
        }
    }

    fn commit_spawns(
        &mut self,
        origin: SpawnOrigin,
        group: SpawnGroupKind,
        entities: Vec<EntityDescriptor>,
    ) -> SpawnOutcome {
        if self.failed {
            return SpawnOutcome {
                origin,
                group,
                status: GroupStatus::Skipped,
                spawned: Vec::new(),
                rejected: entities,
            };
        }

        let cause = self.spawn_cause(origin, &entities);
        let original = entities.clone();
        let mut event = Event::SpawnEntities(SpawnEntitiesEvent::new(cause, origin, group, entities));
        let posted = self.bus.post(&mut event);
        let entities = match event {
            Event::SpawnEntities(event) => event.entities,
            _ => Vec::new(),
        };

        match posted {
            Ok(true) => {
                tracing::trace!(?origin, count = original.len(), "spawn group cancelled");
                SpawnOutcome {
                    origin,
                    group,
                    status: GroupStatus::Cancelled,
                    spawned: Vec::new(),
                    rejected: original,
                }
            }
            Ok(false) => {
                let mut rejected: Vec<EntityDescriptor> = original
                    .into_iter()
                    .filter(|d| !entities.contains(d))
                    .collect();
                let mut spawned = Vec::with_capacity(entities.len());
                for (index, descriptor) in entities.iter().enumerate() {
                    match self.world.spawn_entity(descriptor) {
                        Ok(id) => spawned.push(id),
                        Err(err) => {
                            tracing::warn!(?origin, error = %err, "spawn failed");
                            self.failed = true;
                            rejected.extend(entities[index..].iter().cloned());
                            return SpawnOutcome {
                                origin,
                                group,
                                status: GroupStatus::Failed(err.into()),
                                spawned,
                                rejected,
                            };
                        }
                    }
                }
                SpawnOutcome {
                    origin,
                    group,
                    status: GroupStatus::Committed,
                    spawned,
                    rejected,
                }
            }
            Err(err) => {
                tracing::warn!(?origin, error = %err, "spawn listener failed");
                self.failed = true;
                SpawnOutcome {
                    origin,
                    group,
                    status: GroupStatus::Failed(err.into()),
                    spawned: Vec::new(),
                    rejected: original,
                }
            }
        }
    }

    /// Cause for a spawn group: the producer and the group's spawn type are
    /// pushed in a short-lived frame on top of the phase's attribution.
    fn spawn_cause(&mut self, origin: SpawnOrigin, entities: &[EntityDescriptor]) -> Cause {
        let frame = self.causes.push_frame();
        match origin {
            SpawnOrigin::Phase => {}
            SpawnOrigin::Entity(entity) => self.causes.push_cause(CauseEntry::Entity(entity)),
            SpawnOrigin::Block(pos) => {
                let state = self.world.get_block(pos);
                self.causes
                    .push_cause(CauseEntry::Block(BlockSnapshot::new(pos, state)));
            }
        }
        if let Some(first) = entities.first() {
            self.causes
                .add_context(ContextKey::SpawnType, ContextValue::SpawnType(first.spawn_type));
        }
        let cause = self.causes.current_cause();
        if let Err(err) = self.causes.pop_frame(frame) {
            tracing::error!(error = %err, "spawn cause frame leaked");
        }
        cause
    }

    // -- Attribution --

    fn assign_attribution(&mut self, receipts: &[BlockReceipt]) {
        if receipts.is_empty() {
            return;
        }
        let cause = self.causes.current_cause();
        let attribution = PositionAttribution {
            creator: cause.creator(),
            notifier: cause.notifier(),
        };
        for receipt in receipts {
            self.world.set_attribution(receipt.pos, attribution);
        }
    }
}

/// Write each transaction's original state back. Returns false if any
/// position could not be restored.
pub(crate) fn restore_blocks<'t>(
    world: &mut dyn WorldStorage,
    transactions: impl Iterator<Item = &'t BlockTransaction>,
) -> bool {
    let mut restored = true;
    for tx in transactions {
        if let Err(err) = world.set_block(tx.pos(), tx.original()) {
            tracing::error!(pos = %tx.pos(), error = %err, "could not restore original block");
            restored = false;
        }
    }
    restored
}

/// Fold what listeners did to the posted event back into the processor's
/// own transactions. A position the event no longer carries counts as
/// invalidated, as does every position if the event was replaced.
fn reconcile(mut transactions: Vec<BlockTransaction>, event: &Event) -> Vec<BlockTransaction> {
    let Event::ChangeBlocks(event) = event else {
        tracing::warn!("block change event was replaced by a listener; rejecting all positions");
        transactions.iter_mut().for_each(BlockTransaction::invalidate);
        return transactions;
    };
    let seen: HashMap<BlockPos, &BlockTransaction> =
        event.transactions().iter().map(|t| (t.pos(), t)).collect();
    for tx in &mut transactions {
        match seen.get(&tx.pos()) {
            Some(seen) => {
                if !seen.is_valid() {
                    tx.invalidate();
                }
                if let Some(state) = seen.custom() {
                    tx.set_custom(state);
                }
            }
            None => tx.invalidate(),
        }
    }
    transactions
}

/// Collapse captures to one transaction per position: original from the
/// first capture, proposed from the last, ordered by first capture.
pub(crate) fn collapse(changes: Vec<BlockChange>) -> Vec<BlockTransaction> {
    let mut index: HashMap<BlockPos, usize> = HashMap::with_capacity(changes.len());
    let mut transactions: Vec<BlockTransaction> = Vec::with_capacity(changes.len());
    for change in changes {
        match index.get(&change.pos) {
            Some(&i) => {
                transactions[i] = BlockTransaction::new(
                    change.pos,
                    transactions[i].original(),
                    change.proposed,
                );
            }
            None => {
                index.insert(change.pos, transactions.len());
                transactions.push(BlockTransaction::new(change.pos, change.original, change.proposed));
            }
        }
    }
    transactions
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::SpawnType;
    use crate::test_utils::*;
    use crate::world::MemoryWorld;

    fn pos(x: i32) -> BlockPos {
        BlockPos::new(x, 64, 0)
    }

    fn run(
        ctx: &mut PhaseContext,
        world: &mut MemoryWorld,
        bus: &mut ListenerBus,
        policy: CapturePolicy,
        rollback: bool,
    ) -> UnwindReport {
        let mut causes = CauseStack::new();
        let mut tx = TransactionProcessor::new(world, bus, &mut causes, rollback);
        tx.process(ctx, policy)
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    #[test]
    fn collapse_keeps_first_original_and_last_proposed() {
        let changes = vec![
            BlockChange { pos: pos(1), original: BlockState::AIR, proposed: stone() },
            BlockChange { pos: pos(2), original: BlockState::AIR, proposed: grass() },
            BlockChange { pos: pos(1), original: stone(), proposed: dirt() },
        ];
        let collapsed = collapse(changes);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].pos(), pos(1));
        assert_eq!(collapsed[0].original(), BlockState::AIR);
        assert_eq!(collapsed[0].proposed(), dirt());
        assert_eq!(collapsed[1].pos(), pos(2));
    }

    #[test]
    fn bulk_commit_writes_final_state_once() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        let mut ctx = PhaseContext::new();
        ctx.capture_block_change(pos(0), BlockState::AIR, stone());
        ctx.capture_block_change(pos(0), stone(), dirt());

        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);
        assert!(report.is_success());
        assert_eq!(world.write_log(), &[(pos(0), dirt())]);
        assert_eq!(report.receipts()[0].original, BlockState::AIR);
        assert_eq!(bus.posted_count(EventKind::ChangeBlocksPost), 1);
    }

    #[test]
    fn invalidated_transaction_is_skipped() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        invalidate_at(&mut bus, pos(1));
        let mut ctx = PhaseContext::new();
        ctx.capture_block_change(pos(0), BlockState::AIR, stone());
        ctx.capture_block_change(pos(1), BlockState::AIR, stone());

        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);
        let blocks = report.blocks.as_ref().map(|b| b.rejected.clone());
        assert_eq!(blocks, Some(vec![pos(1)]));
        assert_eq!(world.get_block(pos(0)), stone());
        assert_eq!(world.get_block(pos(1)), BlockState::AIR);
        assert!(!report.blocks_rejected());
    }

    #[test]
    fn positions_dropped_from_event_are_restored() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        bus.on_intercept(
            EventKind::ChangeBlocks,
            PluginId::new("eraser"),
            Box::new(|event| {
                if let Event::ChangeBlocks(change) = event {
                    *change = ChangeBlocksEvent::new(change.cause.clone(), Vec::new());
                }
                Ok(())
            }),
        );

        world.set_block(pos(0), stone()).unwrap();
        world.clear_write_log();
        let mut ctx = PhaseContext::new();
        ctx.capture_block_change(pos(0), BlockState::AIR, stone());

        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Immediate, false);
        let blocks = report.blocks.as_ref().unwrap();
        assert!(blocks.receipts.is_empty());
        assert_eq!(blocks.rejected, vec![pos(0)]);
        assert_eq!(world.get_block(pos(0)), BlockState::AIR);
    }

    #[test]
    fn replaced_event_rejects_every_position() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        bus.on_intercept(
            EventKind::ChangeBlocks,
            PluginId::new("swapper"),
            Box::new(|event| {
                let cause = event.cause().clone();
                *event = Event::NotifyNeighbors(NotifyNeighborsEvent::new(
                    cause,
                    BlockSnapshot::new(pos(0), stone()),
                    Vec::new(),
                ));
                Ok(())
            }),
        );
        let mut ctx = PhaseContext::new();
        ctx.capture_block_change(pos(0), BlockState::AIR, stone());
        ctx.capture_block_change(pos(1), BlockState::AIR, stone());

        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);
        assert_eq!(report.blocks.as_ref().unwrap().rejected, vec![pos(0), pos(1)]);
        assert!(world.write_log().is_empty());
    }

    #[test]
    fn cancelled_immediate_changes_are_restored_in_reverse() {
        let mut world = MemoryWorld::new().with_block(pos(0), grass());
        let mut bus = ListenerBus::default();
        cancel_all(&mut bus, EventKind::ChangeBlocks);

        // Immediate capture: the world already holds the proposed states.
        world.set_block(pos(0), stone()).unwrap();
        world.set_block(pos(1), stone()).unwrap();
        world.clear_write_log();
        let mut ctx = PhaseContext::new();
        ctx.capture_block_change(pos(0), grass(), stone());
        ctx.capture_block_change(pos(1), BlockState::AIR, stone());

        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Immediate, false);
        assert!(report.blocks_rejected());
        assert_eq!(world.write_log(), &[(pos(1), BlockState::AIR), (pos(0), grass())]);
        assert_eq!(bus.posted_count(EventKind::ChangeBlocksPost), 0);
    }

    #[test]
    fn custom_state_replaces_proposed() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        bus.on_intercept(
            EventKind::ChangeBlocks,
            PluginId::new("rewriter"),
            Box::new(|event| {
                if let Event::ChangeBlocks(change) = event {
                    for tx in change.transactions_mut() {
                        tx.set_custom(grass());
                    }
                }
                Ok(())
            }),
        );
        let mut ctx = PhaseContext::new();
        ctx.capture_block_change(pos(0), BlockState::AIR, stone());
        run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);
        assert_eq!(world.get_block(pos(0)), grass());
    }

    #[test]
    fn write_failure_is_failed_open_by_default() {
        let mut world = MemoryWorld::new();
        world.fail_writes_at(pos(1));
        let mut bus = ListenerBus::default();
        let mut ctx = PhaseContext::new();
        for x in 0..3 {
            ctx.capture_block_change(pos(x), BlockState::AIR, stone());
        }
        ctx.capture_item_drop(dropped_item(pos(0), 1));

        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);
        assert!(!report.is_success());
        assert_eq!(world.get_block(pos(0)), stone());
        assert_eq!(world.get_block(pos(2)), BlockState::AIR);
        assert_eq!(report.spawns[0].status, GroupStatus::Skipped);
        assert_eq!(world.entity_count(), 0);
        assert_eq!(report.errors().count(), 1);
    }

    #[test]
    fn rollback_on_failure_restores_applied_positions() {
        let mut world = MemoryWorld::new();
        world.fail_writes_at(pos(1));
        let mut bus = ListenerBus::default();
        let mut ctx = PhaseContext::new();
        ctx.capture_block_change(pos(0), BlockState::AIR, stone());
        ctx.capture_block_change(pos(1), BlockState::AIR, stone());

        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, true);
        assert!(!report.is_success());
        assert_eq!(world.get_block(pos(0)), BlockState::AIR);
        assert!(report.receipts().is_empty());
    }

    #[test]
    fn listener_error_fails_the_group_without_applying() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        bus.on_intercept(
            EventKind::ChangeBlocks,
            PluginId::new("broken"),
            Box::new(|_| Err(ListenerError::new("broken", "boom"))),
        );
        let mut ctx = PhaseContext::new();
        ctx.capture_block_change(pos(0), BlockState::AIR, stone());
        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);
        assert!(!report.is_success());
        assert!(world.write_log().is_empty());
        assert!(matches!(
            report.blocks.map(|b| b.status),
            Some(GroupStatus::Failed(TransactionError::Listener(_)))
        ));
    }

    // -----------------------------------------------------------------------
    // Spawns and notifications
    // -----------------------------------------------------------------------

    #[test]
    fn spawn_groups_follow_fixed_order() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        let mut ctx = PhaseContext::new();
        let producer = world.spawn_entity(&dropped_item(pos(9), 1)).unwrap();
        ctx.capture_item_drop_from_block(pos(3), dropped_item(pos(3), 1));
        ctx.capture_item_drop(dropped_item(pos(2), 1));
        ctx.capture_entity_spawn(dropped_item(pos(1), 1), Some(producer));
        ctx.capture_entity_spawn(dropped_item(pos(0), 1), None);

        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);
        let origins: Vec<_> = report.spawns.iter().map(|s| s.origin).collect();
        assert_eq!(
            origins,
            vec![
                SpawnOrigin::Phase,
                SpawnOrigin::Entity(producer),
                SpawnOrigin::Phase,
                SpawnOrigin::Block(pos(3)),
            ]
        );
        assert_eq!(report.spawned().len(), 4);
    }

    #[test]
    fn spawn_event_carries_producer_and_spawn_type() {
        let mut world = MemoryWorld::new().with_block(pos(3), stone());
        let mut bus = ListenerBus::default();
        let seen = record_events(&mut bus, EventKind::SpawnEntities);
        let mut ctx = PhaseContext::new();
        ctx.capture_item_drop_from_block(pos(3), dropped_item(pos(3), 2));
        run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);

        let events = seen.borrow();
        let cause = events[0].cause();
        assert_eq!(cause.root(), &CauseEntry::Block(BlockSnapshot::new(pos(3), stone())));
        assert_eq!(cause.spawn_type(), Some(SpawnType::DroppedItem));
    }

    #[test]
    fn listener_may_remove_single_spawn_intent() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        bus.on_intercept(
            EventKind::SpawnEntities,
            PluginId::new("filter"),
            Box::new(|event| {
                if let Event::SpawnEntities(spawn) = event {
                    spawn.entities.retain(|d| d.pos.x != 1);
                }
                Ok(())
            }),
        );
        let mut ctx = PhaseContext::new();
        ctx.capture_item_drop(dropped_item(pos(0), 1));
        ctx.capture_item_drop(dropped_item(pos(1), 1));
        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);
        assert_eq!(report.spawns[0].spawned.len(), 1);
        assert_eq!(report.spawns[0].rejected.len(), 1);
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn notifications_deliver_surviving_targets() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        let source = BlockSnapshot::new(pos(0), stone());
        let mut ctx = PhaseContext::new();
        ctx.capture_neighbor_notification(NeighborNotification {
            source,
            targets: vec![pos(1), pos(2)],
        });
        let report = run(&mut ctx, &mut world, &mut bus, CapturePolicy::Bulk, false);
        assert_eq!(report.notifications[0].delivered, vec![pos(1), pos(2)]);
        assert_eq!(world.notifications(), &[(pos(0), pos(1)), (pos(0), pos(2))]);
    }

    #[test]
    fn committed_positions_receive_attribution() {
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        let mut causes = CauseStack::new();
        causes.add_context(ContextKey::Creator, ContextValue::Actor(ActorId(3)));
        let mut ctx = PhaseContext::new();
        ctx.capture_block_change(pos(0), BlockState::AIR, stone());
        let mut tx = TransactionProcessor::new(&mut world, &mut bus, &mut causes, false);
        tx.process(&mut ctx, CapturePolicy::Bulk);
        assert_eq!(
            world.attribution(pos(0)),
            Some(PositionAttribution {
                creator: Some(ActorId(3)),
                notifier: None,
            })
        );
    }
}
