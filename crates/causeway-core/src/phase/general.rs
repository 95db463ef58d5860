//! Engine-driven phases: the idle root, world generation, commands and
//! explosions.

use crate::cause::{CauseEntry, CauseStack, ContextKey, ContextValue};
use crate::context::{
    CommandData, EntityCategory, ExplosionData, PhaseContext, PhaseData, SpawnCandidate,
};
use crate::transaction::{TransactionProcessor, UnwindReport};

use super::{CapturePolicy, PhaseState, SpawnType, default_spawn_type, push_common_attribution};

// ---------------------------------------------------------------------------
// Idle
// ---------------------------------------------------------------------------

/// Root sentinel. Always at the bottom of the phase stack and never
/// completed; anything it sees is applied directly.
#[derive(Debug)]
pub struct IdlePhase;

pub static IDLE: IdlePhase = IdlePhase;

impl PhaseState for IdlePhase {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn capture_policy(&self) -> CapturePolicy {
        CapturePolicy::PassThrough
    }

    fn requires_authoritative_thread(&self) -> bool {
        false
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        match candidate.category {
            EntityCategory::Living => SpawnType::Passive,
            _ => default_spawn_type(candidate),
        }
    }
}

// ---------------------------------------------------------------------------
// World generation
// ---------------------------------------------------------------------------

/// Terrain population. Writes go straight to storage; generation is not
/// observable by listeners.
#[derive(Debug)]
pub struct WorldGenerationPhase;

pub static WORLD_GENERATION: WorldGenerationPhase = WorldGenerationPhase;

impl PhaseState for WorldGenerationPhase {
    fn name(&self) -> &'static str {
        "world_generation"
    }

    fn is_reentrant(&self) -> bool {
        false
    }

    fn capture_policy(&self) -> CapturePolicy {
        CapturePolicy::PassThrough
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, _candidate: &SpawnCandidate) -> SpawnType {
        SpawnType::WorldSpawner
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// Execution of a command line. Commands may run other commands, so the
/// phase is reentrant.
#[derive(Debug)]
pub struct CommandPhase;

pub static COMMAND: CommandPhase = CommandPhase;

impl PhaseState for CommandPhase {
    fn name(&self) -> &'static str {
        "command"
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Command(CommandData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        if let Some(command) = ctx.command() {
            if let Some(sender) = command.sender {
                causes.push_cause(CauseEntry::Actor(sender));
            }
            if !command.command.is_empty() {
                causes.push_cause(CauseEntry::Command(command.command.clone()));
            }
        }
        push_common_attribution(self.name(), ctx, causes);
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        match candidate.category {
            EntityCategory::Item => SpawnType::DroppedItem,
            EntityCategory::ExperienceOrb => SpawnType::Experience,
            _ => SpawnType::Placement,
        }
    }

    fn after_unwind(
        &self,
        ctx: &mut PhaseContext,
        report: &mut UnwindReport,
        _tx: &mut TransactionProcessor<'_>,
    ) {
        if let Some(command) = ctx.command_mut() {
            command.succeeded = report.is_success() && !report.blocks_rejected();
        }
    }
}

// ---------------------------------------------------------------------------
// Explosion
// ---------------------------------------------------------------------------

/// Resolution of an explosion. Chained detonations nest, so the phase is
/// reentrant.
#[derive(Debug)]
pub struct ExplosionPhase;

pub static EXPLOSION: ExplosionPhase = ExplosionPhase;

impl PhaseState for ExplosionPhase {
    fn name(&self) -> &'static str {
        "explosion"
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Explosion(ExplosionData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_common_attribution(self.name(), ctx, causes);
        if let Some(explosion) = ctx.explosion() {
            if let Some(detonator) = explosion.detonator {
                causes.push_cause(CauseEntry::Entity(detonator));
            }
            causes.push_cause(CauseEntry::Explosion {
                origin: explosion.origin,
                radius: explosion.radius,
            });
            causes.add_context(
                ContextKey::Explosion,
                ContextValue::Explosion {
                    origin: explosion.origin,
                    radius: explosion.radius,
                },
            );
        }
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        match candidate.category {
            EntityCategory::Item | EntityCategory::FallingBlock => SpawnType::BlockSpawning,
            EntityCategory::ExperienceOrb => SpawnType::Experience,
            _ => SpawnType::Explosion,
        }
    }

    fn unwind(&self, ctx: &mut PhaseContext, tx: &mut TransactionProcessor<'_>) -> UnwindReport {
        let breaks_blocks = ctx.explosion().is_none_or(|e| e.breaks_blocks);
        if !breaks_blocks {
            let discarded = ctx.drain_blocks().len();
            // Drops of blocks that were never broken go too.
            let drops = ctx.discard_item_drops_by_block();
            tracing::debug!(discarded, drops, "explosion does not break blocks; dropping captures");
        }
        let mut report = tx.process(ctx, self.capture_policy());
        self.after_unwind(ctx, &mut report, tx);
        report
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

    #[test]
    fn idle_and_generation_pass_through() {
        assert_eq!(IDLE.capture_policy(), CapturePolicy::PassThrough);
        assert!(!IDLE.requires_authoritative_thread());
        assert_eq!(WORLD_GENERATION.capture_policy(), CapturePolicy::PassThrough);
        assert!(!WORLD_GENERATION.is_reentrant());
        let ctx = PhaseContext::new();
        let pos = BlockPos::new(0, 64, 0);
        assert_eq!(WORLD_GENERATION.spawn_type_for(&ctx, &mob_candidate(pos)), SpawnType::WorldSpawner);
        assert_eq!(IDLE.spawn_type_for(&ctx, &mob_candidate(pos)), SpawnType::Passive);
    }

    #[test]
    fn command_attribution_pushes_sender_then_line() {
        let mut ctx = PhaseContext::new();
        ctx.prepare(COMMAND.create_data(), None);
        if let Some(command) = ctx.command_mut() {
            command.sender = Some(ActorId(7));
            command.command = "fill 0 0 0 1 1 1 stone".to_string();
        }
        let mut causes = CauseStack::new();
        COMMAND.modify_cause_frame(&ctx, &mut causes);
        let cause = causes.current_cause();
        assert_eq!(cause.root(), &CauseEntry::Command("fill 0 0 0 1 1 1 stone".to_string()));
        assert_eq!(cause.first_actor(), Some(ActorId(7)));
    }

    #[test]
    fn explosion_attribution_includes_detonation() {
        let mut ctx = PhaseContext::new();
        ctx.prepare(EXPLOSION.create_data(), None);
        let origin = BlockPos::new(10, 60, 10);
        if let Some(explosion) = ctx.explosion_mut() {
            explosion.origin = origin;
            explosion.radius = 4;
        }
        let mut causes = CauseStack::new();
        EXPLOSION.modify_cause_frame(&ctx, &mut causes);
        let cause = causes.current_cause();
        assert_eq!(cause.root(), &CauseEntry::Explosion { origin, radius: 4 });
        assert_eq!(
            cause.context(&ContextKey::Explosion),
            Some(&ContextValue::Explosion { origin, radius: 4 })
        );
        assert_eq!(
            EXPLOSION.spawn_type_for(&ctx, &item_candidate(origin, 1)),
            SpawnType::BlockSpawning
        );
        assert_eq!(EXPLOSION.spawn_type_for(&ctx, &mob_candidate(origin)), SpawnType::Explosion);
    }
}
