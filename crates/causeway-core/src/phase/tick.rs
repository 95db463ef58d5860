//! Simulation ticks. Tick logic reads back its own writes constantly, so
//! ticks apply block changes immediately and only defer the events.

use crate::cause::{CauseEntry, CauseStack};
use crate::context::{EntityCategory, PhaseContext, PhaseData, SpawnCandidate, TickData};

use super::{CapturePolicy, PhaseState, SpawnType, default_spawn_type, push_common_attribution};

/// A scheduled or random block tick.
#[derive(Debug)]
pub struct BlockTickPhase;

pub static BLOCK_TICK: BlockTickPhase = BlockTickPhase;

impl PhaseState for BlockTickPhase {
    fn name(&self) -> &'static str {
        "block_tick"
    }

    fn is_reentrant(&self) -> bool {
        false
    }

    fn capture_policy(&self) -> CapturePolicy {
        CapturePolicy::Immediate
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Tick(TickData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_common_attribution(self.name(), ctx, causes);
        if let Some(block) = ctx.tick().and_then(|t| t.block) {
            causes.push_cause(CauseEntry::Block(block));
        }
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        match candidate.category {
            EntityCategory::Item | EntityCategory::ExperienceOrb => default_spawn_type(candidate),
            _ => SpawnType::BlockSpawning,
        }
    }
}

/// One entity's update.
#[derive(Debug)]
pub struct EntityTickPhase;

pub static ENTITY_TICK: EntityTickPhase = EntityTickPhase;

impl PhaseState for EntityTickPhase {
    fn name(&self) -> &'static str {
        "entity_tick"
    }

    fn is_reentrant(&self) -> bool {
        false
    }

    fn capture_policy(&self) -> CapturePolicy {
        CapturePolicy::Immediate
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Tick(TickData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_common_attribution(self.name(), ctx, causes);
        if let Some(entity) = ctx.tick().and_then(|t| t.entity) {
            causes.push_cause(CauseEntry::Entity(entity));
        }
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        match candidate.category {
            EntityCategory::Living => SpawnType::Passive,
            _ => default_spawn_type(candidate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::*;
    use crate::test_utils::*;

    #[test]
    fn ticks_capture_immediately() {
        assert_eq!(BLOCK_TICK.capture_policy(), CapturePolicy::Immediate);
        assert_eq!(ENTITY_TICK.capture_policy(), CapturePolicy::Immediate);
    }

    #[test]
    fn block_tick_pushes_ticking_block() {
        let snapshot = BlockSnapshot::new(BlockPos::new(1, 2, 3), grass());
        let mut ctx = PhaseContext::new();
        ctx.prepare(BLOCK_TICK.create_data(), None);
        if let Some(tick) = ctx.tick_mut() {
            tick.block = Some(snapshot);
        }
        let mut causes = CauseStack::new();
        BLOCK_TICK.modify_cause_frame(&ctx, &mut causes);
        assert_eq!(causes.current_cause().root(), &CauseEntry::Block(snapshot));
        assert_eq!(
            BLOCK_TICK.spawn_type_for(&ctx, &mob_candidate(snapshot.pos)),
            SpawnType::BlockSpawning
        );
    }
}
