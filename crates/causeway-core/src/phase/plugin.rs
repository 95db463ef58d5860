//! Phases initiated by plugin code: tasks, listener callbacks and block
//! workers.

use crate::cause::{CauseEntry, CauseStack, ContextKey, ContextValue};
use crate::context::{
    BlockWorkerData, EntityCategory, ListenerData, PhaseContext, PhaseData, PluginData,
    SpawnCandidate,
};
use crate::id::PluginId;

use super::{PhaseState, SpawnType, default_spawn_type, push_common_attribution};

fn push_plugin(plugin: Option<&PluginId>, ctx: &PhaseContext, causes: &mut CauseStack) {
    let Some(plugin) = plugin else {
        return;
    };
    if ctx.source() != Some(&CauseEntry::Plugin(plugin.clone())) {
        causes.push_cause(CauseEntry::Plugin(plugin.clone()));
    }
    causes.add_context(ContextKey::Plugin, ContextValue::Plugin(plugin.clone()));
}

fn plugin_spawn_type(candidate: &SpawnCandidate) -> SpawnType {
    match candidate.category {
        EntityCategory::ExperienceOrb => default_spawn_type(candidate),
        _ => SpawnType::Plugin,
    }
}

// ---------------------------------------------------------------------------
// Plugin task
// ---------------------------------------------------------------------------

/// Ad-hoc work a plugin runs on the authoritative thread.
#[derive(Debug)]
pub struct PluginTaskPhase;

pub static PLUGIN_TASK: PluginTaskPhase = PluginTaskPhase;

impl PhaseState for PluginTaskPhase {
    fn name(&self) -> &'static str {
        "plugin_task"
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Plugin(PluginData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_common_attribution(self.name(), ctx, causes);
        push_plugin(ctx.plugin().and_then(|p| p.plugin.as_ref()), ctx, causes);
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        plugin_spawn_type(candidate)
    }
}

// ---------------------------------------------------------------------------
// Scheduled task
// ---------------------------------------------------------------------------

/// A task run by the scheduler at the start of a tick.
#[derive(Debug)]
pub struct ScheduledTaskPhase;

pub static SCHEDULED_TASK: ScheduledTaskPhase = ScheduledTaskPhase;

impl PhaseState for ScheduledTaskPhase {
    fn name(&self) -> &'static str {
        "scheduled_task"
    }

    fn is_reentrant(&self) -> bool {
        false
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Plugin(PluginData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_common_attribution(self.name(), ctx, causes);
        push_plugin(ctx.plugin().and_then(|p| p.plugin.as_ref()), ctx, causes);
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        plugin_spawn_type(candidate)
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// A listener's follow-up mutations, replayed after the phase whose events
/// produced them has committed. Listeners may trigger further listeners.
#[derive(Debug)]
pub struct ListenerPhase;

pub static LISTENER: ListenerPhase = ListenerPhase;

impl PhaseState for ListenerPhase {
    fn name(&self) -> &'static str {
        "listener"
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::Listener(ListenerData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_common_attribution(self.name(), ctx, causes);
        push_plugin(ctx.listener().and_then(|l| l.owner.as_ref()), ctx, causes);
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        plugin_spawn_type(candidate)
    }
}

// ---------------------------------------------------------------------------
// Block worker
// ---------------------------------------------------------------------------

/// A plugin streaming a large batch of block changes, e.g. a region fill.
#[derive(Debug)]
pub struct BlockWorkerPhase;

pub static BLOCK_WORKER: BlockWorkerPhase = BlockWorkerPhase;

impl PhaseState for BlockWorkerPhase {
    fn name(&self) -> &'static str {
        "block_worker"
    }

    fn is_reentrant(&self) -> bool {
        false
    }

    fn create_data(&self) -> PhaseData {
        PhaseData::BlockWorker(BlockWorkerData::default())
    }

    fn modify_cause_frame(&self, ctx: &PhaseContext, causes: &mut CauseStack) {
        push_common_attribution(self.name(), ctx, causes);
        let worker = ctx.block_worker();
        push_plugin(worker.and_then(|w| w.plugin.as_ref()), ctx, causes);
        if let Some(worker) = worker
            && !worker.label.is_empty()
        {
            causes.add_context(
                ContextKey::Custom("block_worker".to_string()),
                ContextValue::Text(worker.label.clone()),
            );
        }
    }

    fn spawn_type_for(&self, _ctx: &PhaseContext, candidate: &SpawnCandidate) -> SpawnType {
        plugin_spawn_type(candidate)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
