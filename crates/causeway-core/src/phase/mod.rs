//! Phase kinds and their behavior.
//!
//! A phase kind is a stateless [`PhaseState`] singleton describing how one
//! kind of activation captures mutations, attributes them, classifies spawns
//! and unwinds. The tracker stores `&'static dyn PhaseState` references, so
//! embedders add kinds by declaring their own `static` implementing the
//! trait. Default method implementations cover the common case; each kind
//! overrides only what differs.
//!
//! Phases form a tree by call nesting. Entering any kind while another is
//! active is legal, except entering a non-reentrant kind while that same kind
//! is the current phase.

mod general;
mod packet;
mod plugin;
mod tick;

pub use general::{COMMAND, CommandPhase, EXPLOSION, ExplosionPhase, IDLE, IdlePhase};
pub use general::{WORLD_GENERATION, WorldGenerationPhase};
pub use packet::{DROP_ITEM, DropItemPhase, PLACE_BLOCK, PLAYER_INTERACTION, PlaceBlockPhase};
pub use packet::PlayerInteractionPhase;
pub use plugin::{BLOCK_WORKER, BlockWorkerPhase, LISTENER, ListenerPhase, PLUGIN_TASK};
pub use plugin::{PluginTaskPhase, SCHEDULED_TASK, ScheduledTaskPhase};
pub use tick::{BLOCK_TICK, BlockTickPhase, ENTITY_TICK, EntityTickPhase};

use serde::{Deserialize, Serialize};

use crate::cause::{CauseStack, ContextKey, ContextValue};
use crate::context::{EntityCategory, PhaseContext, PhaseData, SpawnCandidate};
use crate::transaction::{TransactionProcessor, UnwindReport};

// ---------------------------------------------------------------------------
// Capture policy and spawn classification
// ---------------------------------------------------------------------------

/// How block changes requested during a phase reach world storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapturePolicy {
    /// Buffer changes; apply them on unwind if the change event is accepted.
    Bulk,
    /// Apply changes as they happen and record them; post the change event
    /// on unwind and restore the originals if it is cancelled.
    Immediate,
    /// Apply changes directly. Nothing is recorded and no event is posted.
    PassThrough,
}

/// Why an entity is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpawnType {
    DroppedItem,
    Experience,
    Placement,
    SpawnEgg,
    Plugin,
    BlockSpawning,
    Explosion,
    Passive,
    WorldSpawner,
    Custom,
}

/// Classification used when a phase has no more specific knowledge.
pub fn default_spawn_type(candidate: &SpawnCandidate) -> SpawnType {
    match candidate.category {
        EntityCategory::Item => SpawnType::DroppedItem,
        EntityCategory::ExperienceOrb => SpawnType::Experience,
        EntityCategory::FallingBlock => SpawnType::BlockSpawning,
        EntityCategory::Living | EntityCategory::Projectile | EntityCategory::Other => {
            SpawnType::Custom
        }
    }
}

/// Push the attribution every phase shares: its source, creator and notifier.
/// A missing notifier is recorded as [`ContextValue::NoNotifier`].
pub fn push_common_attribution(name: &'static str, ctx: &PhaseContext, causes: &mut CauseStack) {
    if let Some(source) = ctx.source() {
        causes.push_cause(source.clone());
    }
    causes.add_context(ContextKey::PhaseName, ContextValue::Phase(name));
    if let Some(creator) = ctx.creator() {
        causes.add_context(ContextKey::Creator, ContextValue::Actor(creator));
    }
    let notifier = match ctx.notifier().or(ctx.creator()) {
        Some(actor) => ContextValue::Actor(actor),
        None => ContextValue::NoNotifier,
    };
    causes.add_context(ContextKey::Notifier, notifier);
}

// ---------------------------------------------------------------------------
// PhaseState trait
// ---------------------------------------------------------------------------

/// Behavior of one phase kind.
pub trait PhaseState: std::fmt::Debug + Send + Sync {
    /// Unique name of the kind. Reentrance is checked by name.
    fn name(&self) -> &'static str;

    fn is_reentrant(&self) -> bool {
        true
    }

    fn capture_policy(&self) -> CapturePolicy {
        CapturePolicy::Bulk
    }

    /// Whether entering off the authoritative thread is an error.
    fn requires_authoritative_thread(&self) -> bool {
        true
    }

    /// Phase-specific fields for a fresh activation.
    fn create_data(&self) -> PhaseData {
        PhaseData::None
    }

    /// Push this phase's attribution onto the cause frame opened for it.
    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_common_attribution(self.name(), ctx, causes);
    }

    /// Classify why an about-to-spawn entity is being created.
    fn spawn_type_for(&self, ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        let _ = ctx;
        default_spawn_type(candidate)
    }

    /// Commit or roll back the activation's captures.
    fn unwind(&self, ctx: &mut PhaseContext, tx: &mut TransactionProcessor<'_>) -> UnwindReport {
        let mut report = tx.process(ctx, self.capture_policy());
        self.after_unwind(ctx, &mut report, tx);
        report
    }

    /// Phase-specific bookkeeping once the captures have been processed.
    fn after_unwind(
        &self,
        ctx: &mut PhaseContext,
        report: &mut UnwindReport,
        tx: &mut TransactionProcessor<'_>,
    ) {
        let _ = (ctx, report, tx);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
