//! Phases driven by an actor's network packets.

use crate::cause::{CauseEntry, CauseStack, ContextKey, ContextValue};
use crate::context::{EntityCategory, PacketData, PhaseContext, PhaseData, SpawnCandidate};
use crate::event::SpawnGroupKind;
use crate::id::{ActorId, ItemStack};
use crate::transaction::{GroupStatus, TransactionProcessor, UnwindReport};

use super::{PhaseState, SpawnType, default_spawn_type, push_common_attribution};

/// Attribution shared by packet phases: the acting actor doubles as creator
/// and notifier unless the context names others.
fn push_packet_attribution(name: &'static str, ctx: &PhaseContext, causes: &mut CauseStack) {
    push_common_attribution(name, ctx, causes);
    let Some(packet) = ctx.packet() else {
        return;
    };
    if let Some(actor) = packet.actor {
        if ctx.source() != Some(&CauseEntry::Actor(actor)) {
            causes.push_cause(CauseEntry::Actor(actor));
        }
        if ctx.creator().is_none() {
            causes.add_context(ContextKey::Creator, ContextValue::Actor(actor));
            if ctx.notifier().is_none() {
                causes.add_context(ContextKey::Notifier, ContextValue::Actor(actor));
            }
        }
    }
    if let Some(item) = &packet.used_item {
        causes.add_context(ContextKey::UsedItem, ContextValue::Item(item.clone()));
    }
    if let Some(block) = packet.target_block {
        causes.add_context(ContextKey::BlockHit, ContextValue::Block(block));
    }
}

fn packet_spawn_type(ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
    let holding_item = ctx.packet().is_some_and(|p| p.used_item.is_some());
    match candidate.category {
        EntityCategory::Living if holding_item => SpawnType::SpawnEgg,
        EntityCategory::FallingBlock => SpawnType::Placement,
        EntityCategory::Item | EntityCategory::ExperienceOrb => default_spawn_type(candidate),
        _ => SpawnType::Placement,
    }
}

/// Hand an item back to the actor that spent it.
fn refund(tx: &mut TransactionProcessor<'_>, actor: ActorId, item: ItemStack, phase: &'static str) {
    if let Err(err) = tx.world_mut().give_item(actor, item) {
        tracing::warn!(phase, actor = actor.0, error = %err, "could not return item to actor");
    }
}

// ---------------------------------------------------------------------------
// Player interaction
// ---------------------------------------------------------------------------

/// An actor using an item or interacting with a block or entity.
#[derive(Debug)]
pub struct PlayerInteractionPhase;

pub static PLAYER_INTERACTION: PlayerInteractionPhase = PlayerInteractionPhase;

impl PhaseState for PlayerInteractionPhase {
    fn name(&self) -> &'static str {
        "player_interaction"
    }

    fn is_reentrant(&self) -> bool {
        false
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Packet(PacketData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_packet_attribution(self.name(), ctx, causes);
    }

    fn spawn_type_for(&self, ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        packet_spawn_type(ctx, candidate)
    }
}

// ---------------------------------------------------------------------------
// Place block
// ---------------------------------------------------------------------------

/// An actor placing a block. The placed item is consumed up front by the
/// simulation and returned if the placement is rejected.
#[derive(Debug)]
pub struct PlaceBlockPhase;

pub static PLACE_BLOCK: PlaceBlockPhase = PlaceBlockPhase;

impl PhaseState for PlaceBlockPhase {
    fn name(&self) -> &'static str {
        "place_block"
    }

    fn is_reentrant(&self) -> bool {
        false
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Packet(PacketData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_packet_attribution(self.name(), ctx, causes);
    }

    fn spawn_type_for(&self, ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        packet_spawn_type(ctx, candidate)
    }

    fn after_unwind(
        &self,
        ctx: &mut PhaseContext,
        report: &mut UnwindReport,
        tx: &mut TransactionProcessor<'_>,
    ) {
        if !report.blocks_rejected() {
            return;
        }
        let Some(packet) = ctx.packet_mut() else {
            return;
        };
        if let (Some(actor), Some(item)) = (packet.actor, packet.used_item.take()) {
            tracing::debug!(actor = actor.0, "placement rejected; restoring used item");
            refund(tx, actor, item, self.name());
        }
    }
}

// ---------------------------------------------------------------------------
// Drop item
// ---------------------------------------------------------------------------

/// An actor throwing items out of their inventory. Items are removed from the
/// inventory up front and returned if their spawn is cancelled.
#[derive(Debug)]
pub struct DropItemPhase;

pub static DROP_ITEM: DropItemPhase = DropItemPhase;

impl PhaseState for DropItemPhase {
    fn name(&self) -> &'static str {
        "drop_item"
    }

    fn is_reentrant(&self) -> bool {
        false
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Packet(PacketData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_packet_attribution(self.name(), ctx, causes);
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        match candidate.category {
            EntityCategory::Item => SpawnType::DroppedItem,
            _ => SpawnType::Custom,
        }
    }

    fn after_unwind(
        &self,
        ctx: &mut PhaseContext,
        report: &mut UnwindReport,
        tx: &mut TransactionProcessor<'_>,
    ) {
        let Some(actor) = ctx.packet().and_then(|p| p.actor) else {
            return;
        };
        let returned: Vec<ItemStack> = report
            .spawns
            .iter()
            .filter(|group| {
                group.group == SpawnGroupKind::ItemDrops && group.status == GroupStatus::Cancelled
            })
            .flat_map(|group| group.rejected.iter().filter_map(|d| d.item.clone()))
            .collect();
        for item in returned {
            refund(tx, actor, item, self.name());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::*;
    use crate::test_utils::*;

    fn interaction_context(actor: ActorId, used_item: Option<ItemStack>) -> PhaseContext {
        let mut ctx = PhaseContext::new();
        ctx.prepare(PLAYER_INTERACTION.create_data(), None);
        if let Some(packet) = ctx.packet_mut() {
            packet.actor = Some(actor);
            packet.used_item = used_item;
        }
        ctx
    }

    #[test]
    fn living_spawn_while_holding_item_is_spawn_egg() {
        let pos = BlockPos::new(0, 64, 0);
        let ctx = interaction_context(ActorId(1), Some(spawn_egg()));
        assert_eq!(
            PLAYER_INTERACTION.spawn_type_for(&ctx, &mob_candidate(pos)),
            SpawnType::SpawnEgg
        );
        assert_eq!(
            PLAYER_INTERACTION.spawn_type_for(&ctx, &item_candidate(pos, 1)),
            SpawnType::DroppedItem
        );

        let empty_handed = interaction_context(ActorId(1), None);
        assert_eq!(
            PLAYER_INTERACTION.spawn_type_for(&empty_handed, &mob_candidate(pos)),
            SpawnType::Placement
        );
    }

    #[test]
    fn actor_becomes_creator_and_notifier() {
        let ctx = interaction_context(ActorId(5), Some(spawn_egg()));
        let mut causes = CauseStack::new();
        PLACE_BLOCK.modify_cause_frame(&ctx, &mut causes);
        let cause = causes.current_cause();
        assert_eq!(cause.root(), &CauseEntry::Actor(ActorId(5)));
        assert_eq!(cause.creator(), Some(ActorId(5)));
        assert_eq!(cause.notifier(), Some(ActorId(5)));
        assert_eq!(
            cause.context(&ContextKey::UsedItem),
            Some(&ContextValue::Item(spawn_egg()))
        );
    }

    #[test]
    fn source_actor_is_not_pushed_twice() {
        let mut ctx = interaction_context(ActorId(5), None);
        ctx.set_source(CauseEntry::Actor(ActorId(5)));
        let mut causes = CauseStack::new();
        PLAYER_INTERACTION.modify_cause_frame(&ctx, &mut causes);
        assert_eq!(causes.depth(), 1);
    }

    #[test]
    fn packet_phases_are_not_reentrant() {
        assert!(!PLAYER_INTERACTION.is_reentrant());
        assert!(!PLACE_BLOCK.is_reentrant());
        assert!(!DROP_ITEM.is_reentrant());
    }
}
