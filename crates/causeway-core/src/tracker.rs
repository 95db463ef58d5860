//! The phase stack.
//!
//! [`PhaseTracker`] owns the LIFO stack of active phases, the cause stack,
//! and a pool of reusable contexts. Trigger sources enter a phase, run their
//! logic (mutations are routed to the current phase's context by the
//! `set_block`/`spawn_entity`/... helpers), then complete the phase, which
//! unwinds its captures through a [`TransactionProcessor`].
//!
//! The bottom of the stack is always the [`IDLE`] root, so the current phase
//! is defined at all times. The tracker has a single owner and is driven
//! from one authoritative thread; nothing in it is locked.
//!
//! # Invariant violations
//!
//! Reentrance into a non-reentrant phase, runaway nesting, unbalanced
//! completes, double completes and off-thread entry are reported with a
//! phase-stack dump through `tracing` and returned as [`TrackerError`]s. None
//! of them panic.

use std::collections::HashSet;
use std::panic::Location;
use std::thread::{self, ThreadId};

use crate::cause::{CauseEntry, CauseFrameHandle, CauseStack};
use crate::config::TrackerConfig;
use crate::context::{EntityDescriptor, NeighborNotification, PhaseContext, SpawnCandidate};
use crate::diagnostics::{DiagnosticKind, FrameSummary, PhaseStackDump};
use crate::event::{EventBus, PendingReaction, Reaction};
use crate::id::*;
use crate::phase::{CapturePolicy, IDLE, LISTENER, PhaseState};
use crate::transaction::{TransactionProcessor, UnwindReport, collapse, restore_blocks};
use crate::world::{WorldError, WorldStorage};

// ---------------------------------------------------------------------------
// Errors and handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("phase '{0}' is not reentrant and is already the current phase")]
    Reentrance(&'static str),
    #[error("entering '{phase}' would exceed the phase depth limit of {limit}")]
    Runaway { phase: &'static str, limit: usize },
    #[error("phase '{0}' must be entered on the authoritative thread")]
    OffThread(&'static str),
    #[error("phase frame {0} is not on the stack")]
    NotOnStack(u64),
    #[error("no phase is active above the root")]
    EmptyStack,
    #[error("phase '{phase}' completed with {leaked} nested phase(s) still open")]
    Unbalanced { phase: &'static str, leaked: usize },
}

/// Identifies one phase activation. Returned by `enter`, consumed by
/// `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseHandle {
    id: u64,
}

impl PhaseHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Stack depths captured before a trigger runs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackMark {
    pub(crate) depth: usize,
    cause_frames: usize,
    reaction_depth: usize,
}

#[derive(Debug)]
struct PhaseFrame {
    id: u64,
    state: &'static dyn PhaseState,
    context: PhaseContext,
    /// `None` only for the root.
    cause_frame: Option<CauseFrameHandle>,
}

// ---------------------------------------------------------------------------
// PhaseTracker
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PhaseTracker {
    config: TrackerConfig,
    stack: Vec<PhaseFrame>,
    causes: CauseStack,
    pool: Vec<PhaseContext>,
    next_frame_id: u64,
    authoritative_thread: ThreadId,
    reported: HashSet<(&'static str, DiagnosticKind)>,
    reaction_depth: usize,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl PhaseTracker {
    /// Create a tracker bound to the calling thread.
    pub fn new(config: TrackerConfig) -> Self {
        let root = PhaseFrame {
            id: 0,
            state: &IDLE,
            context: PhaseContext::new(),
            cause_frame: None,
        };
        Self {
            config,
            stack: vec![root],
            causes: CauseStack::new(),
            pool: Vec::new(),
            next_frame_id: 1,
            authoritative_thread: thread::current().id(),
            reported: HashSet::new(),
            reaction_depth: 0,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn causes(&self) -> &CauseStack {
        &self.causes
    }

    pub fn causes_mut(&mut self) -> &mut CauseStack {
        &mut self.causes
    }

    /// Stack depth, root included.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Whether only the root is on the stack.
    pub fn is_idle(&self) -> bool {
        self.stack.len() == 1
    }

    /// Contexts currently held for reuse.
    pub fn pooled_contexts(&self) -> usize {
        self.pool.len()
    }

    // -- Thread ownership --

    /// Make the calling thread the authoritative one, e.g. after the
    /// tracker was built during startup on another thread.
    pub fn bind_to_current_thread(&mut self) {
        self.authoritative_thread = thread::current().id();
    }

    pub fn is_authoritative_thread(&self) -> bool {
        thread::current().id() == self.authoritative_thread
    }

    // -- Current phase --

    fn top(&self) -> &PhaseFrame {
        // The root frame is never popped.
        &self.stack[self.stack.len() - 1]
    }

    fn top_mut(&mut self) -> &mut PhaseFrame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    /// The current phase and its context.
    pub fn current(&self) -> (&'static dyn PhaseState, &PhaseContext) {
        let top = self.top();
        (top.state, &top.context)
    }

    pub fn current_state(&self) -> &'static dyn PhaseState {
        self.top().state
    }

    pub fn current_context_mut(&mut self) -> &mut PhaseContext {
        &mut self.top_mut().context
    }

    /// Handle of the current phase, or `None` at the root.
    pub fn current_handle(&self) -> Option<PhaseHandle> {
        (!self.is_idle()).then(|| PhaseHandle { id: self.top().id })
    }

    fn position(&self, handle: PhaseHandle) -> Option<usize> {
        // Index 0 is the root, which no handle refers to.
        self.stack
            .iter()
            .skip(1)
            .rposition(|frame| frame.id == handle.id)
            .map(|i| i + 1)
    }

    pub fn is_active(&self, handle: PhaseHandle) -> bool {
        self.position(handle).is_some()
    }

    pub fn context(&self, handle: PhaseHandle) -> Result<&PhaseContext, TrackerError> {
        let index = self
            .position(handle)
            .ok_or(TrackerError::NotOnStack(handle.id))?;
        Ok(&self.stack[index].context)
    }

    pub fn context_mut(&mut self, handle: PhaseHandle) -> Result<&mut PhaseContext, TrackerError> {
        let index = self
            .position(handle)
            .ok_or(TrackerError::NotOnStack(handle.id))?;
        Ok(&mut self.stack[index].context)
    }

    // -- Entry --

    /// Enter a phase with an empty context.
    #[track_caller]
    pub fn enter(&mut self, state: &'static dyn PhaseState) -> Result<PhaseHandle, TrackerError> {
        let caller = Location::caller();
        self.enter_at(state, |_| {}, Some(caller))
    }

    /// Enter a phase, populating its context before the phase's attribution
    /// is pushed onto the cause stack.
    #[track_caller]
    pub fn enter_with<S>(
        &mut self,
        state: &'static dyn PhaseState,
        setup: S,
    ) -> Result<PhaseHandle, TrackerError>
    where
        S: FnOnce(&mut PhaseContext),
    {
        let caller = Location::caller();
        self.enter_at(state, setup, Some(caller))
    }

    pub(crate) fn enter_at<S>(
        &mut self,
        state: &'static dyn PhaseState,
        setup: S,
        caller: Option<&'static Location<'static>>,
    ) -> Result<PhaseHandle, TrackerError>
    where
        S: FnOnce(&mut PhaseContext),
    {
        let name = state.name();

        if self.config.enforce_authoritative_thread
            && state.requires_authoritative_thread()
            && !self.is_authoritative_thread()
        {
            self.report(DiagnosticKind::OffThread, name, "phase entered off the authoritative thread");
            return Err(TrackerError::OffThread(name));
        }

        if !state.is_reentrant() && self.top().state.name() == name {
            self.report(DiagnosticKind::Reentrance, name, "non-reentrant phase entered while current");
            return Err(TrackerError::Reentrance(name));
        }

        let limit = self.config.max_phase_depth;
        if self.stack.len() >= limit {
            self.report(DiagnosticKind::Runaway, name, "phase depth limit reached");
            return Err(TrackerError::Runaway { phase: name, limit });
        }

        let entered_at = caller.filter(|_| self.config.capture_call_sites);
        let mut context = self.pool.pop().unwrap_or_default();
        context.prepare(state.create_data(), entered_at);
        setup(&mut context);

        let cause_frame = self.causes.push_frame();
        state.modify_cause_frame(&context, &mut self.causes);

        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.stack.push(PhaseFrame {
            id,
            state,
            context,
            cause_frame: Some(cause_frame),
        });
        tracing::trace!(phase = name, depth = self.stack.len() - 1, "entered phase");
        Ok(PhaseHandle { id })
    }

    /// Re-populate an active phase and rebuild its attribution. Only the
    /// current phase can be repopulated, since its cause frame must be the
    /// innermost one.
    pub fn populate<S>(&mut self, handle: PhaseHandle, setup: S) -> Result<(), TrackerError>
    where
        S: FnOnce(&mut PhaseContext),
    {
        let index = self
            .position(handle)
            .ok_or(TrackerError::NotOnStack(handle.id))?;
        let top = self.stack.len() - 1;
        if index != top {
            return Err(TrackerError::Unbalanced {
                phase: self.stack[index].state.name(),
                leaked: top - index,
            });
        }

        let frame = &mut self.stack[index];
        setup(&mut frame.context);
        if let Some(old) = frame.cause_frame.take() {
            if let Err(err) = self.causes.pop_frame(old) {
                tracing::error!(error = %err, "cause frame leaked while repopulating phase");
            }
            let cause_frame = self.causes.push_frame();
            frame.state.modify_cause_frame(&frame.context, &mut self.causes);
            frame.cause_frame = Some(cause_frame);
        }
        Ok(())
    }

    // -- Completion --

    /// Pop the phase, unwind its captures, replay listener reactions and
    /// return its context to the pool.
    pub fn complete(
        &mut self,
        handle: PhaseHandle,
        world: &mut dyn WorldStorage,
        bus: &mut dyn EventBus,
    ) -> Result<UnwindReport, TrackerError> {
        let Some(index) = self.position(handle) else {
            if self.is_idle() {
                self.report(DiagnosticKind::EmptyStack, IDLE.name(), "complete with no active phase");
                return Err(TrackerError::EmptyStack);
            }
            let phase = self.top().state.name();
            self.report(DiagnosticKind::DoubleComplete, phase, "complete of a phase not on the stack");
            return Err(TrackerError::NotOnStack(handle.id));
        };

        let top = self.stack.len() - 1;
        if index != top {
            let phase = self.stack[index].state.name();
            let leaked = top - index;
            self.report(
                DiagnosticKind::Unbalanced,
                phase,
                "phase completed while nested phases are still open; discarding them",
            );
            self.discard_from(index, world);
            return Err(TrackerError::Unbalanced { phase, leaked });
        }

        let Some(mut frame) = self.stack.pop() else {
            return Err(TrackerError::EmptyStack);
        };
        let name = frame.state.name();

        let mut report = {
            let mut tx = TransactionProcessor::new(
                world,
                bus,
                &mut self.causes,
                self.config.rollback_on_failure,
            );
            frame.state.unwind(&mut frame.context, &mut tx)
        };
        report.phase = name;
        if frame.context.has_captures() {
            tracing::debug!(
                phase = name,
                left = frame.context.capture_counts().total(),
                "captures left after unwind; discarding"
            );
        }
        frame.context.mark_completed();

        let reactions = bus.drain_reactions();
        if !reactions.is_empty() {
            let origin = frame.context.entered_at();
            self.replay_reactions(reactions, origin, world, bus, &mut report);
        }

        if let Some(cause_frame) = frame.cause_frame
            && let Err(err) = self.causes.pop_frame(cause_frame)
        {
            let message = format!("cause frame leaked inside phase: {err}");
            self.report(DiagnosticKind::CauseFrameLeak, name, &message);
        }

        if self.config.verbose_diagnostics {
            tracing::trace!(phase = name, success = report.is_success(), "completed phase");
        }
        self.release(frame.context);
        Ok(report)
    }

    /// Pop every frame from `index` up without committing anything. Block
    /// writes an immediate phase already applied are put back.
    fn discard_from(&mut self, index: usize, world: &mut dyn WorldStorage) {
        let index = index.max(1);
        while self.stack.len() > index {
            let Some(mut frame) = self.stack.pop() else {
                break;
            };
            tracing::debug!(
                phase = frame.state.name(),
                discarded = frame.context.capture_counts().total(),
                "discarding phase"
            );
            if frame.state.capture_policy() == CapturePolicy::Immediate {
                let applied = collapse(frame.context.drain_blocks());
                if !restore_blocks(world, applied.iter().rev()) {
                    tracing::warn!(phase = frame.state.name(), "discarded phase left applied writes behind");
                }
            }
            frame.context.discard_captures();
            if let Some(cause_frame) = frame.cause_frame
                && let Err(err) = self.causes.pop_frame(cause_frame)
            {
                tracing::debug!(error = %err, "closing cause frame of discarded phase");
            }
            self.release(frame.context);
        }
    }

    /// Where the stacks stand, for restoring after a failed trigger.
    pub(crate) fn mark(&self) -> StackMark {
        StackMark {
            depth: self.stack.len(),
            cause_frames: self.causes.frame_depth(),
            reaction_depth: self.reaction_depth,
        }
    }

    /// Restore the stacks to `mark`, discarding anything above it.
    pub(crate) fn restore_to(&mut self, mark: StackMark, world: &mut dyn WorldStorage) {
        if self.stack.len() > mark.depth {
            self.discard_from(mark.depth, world);
        }
        self.causes.close_frames_to(mark.cause_frames);
        self.reaction_depth = mark.reaction_depth;
    }

    fn release(&mut self, mut context: PhaseContext) {
        context.reset();
        if self.pool.len() < self.config.context_pool_size {
            self.pool.push(context);
        }
    }

    // -- Reactions --

    fn replay_reactions(
        &mut self,
        reactions: Vec<PendingReaction>,
        origin: Option<&'static Location<'static>>,
        world: &mut dyn WorldStorage,
        bus: &mut dyn EventBus,
        report: &mut UnwindReport,
    ) {
        if self.reaction_depth >= self.config.max_reaction_depth {
            self.report(
                DiagnosticKind::Runaway,
                LISTENER.name(),
                "listener reactions nested too deeply; dropping",
            );
            report.dropped_reactions += reactions.len();
            return;
        }

        self.reaction_depth += 1;
        for (owner, batch) in group_by_owner(reactions) {
            let setup = |ctx: &mut PhaseContext| {
                ctx.set_source(CauseEntry::Plugin(owner.clone()));
                if let Some(listener) = ctx.listener_mut() {
                    listener.owner = Some(owner.clone());
                }
            };
            let handle = match self.enter_at(&LISTENER, setup, origin) {
                Ok(handle) => handle,
                Err(err) => {
                    tracing::warn!(owner = %owner, error = %err, "could not replay reactions");
                    report.dropped_reactions += batch.len();
                    continue;
                }
            };
            for reaction in batch {
                if let Err(err) = self.apply_reaction(world, reaction) {
                    tracing::warn!(owner = %owner, error = %err, "reaction rejected by world");
                }
            }
            match self.complete(handle, world, bus) {
                Ok(nested) => report.nested.push(nested),
                Err(err) => tracing::warn!(owner = %owner, error = %err, "listener phase failed"),
            }
        }
        self.reaction_depth -= 1;
    }

    fn apply_reaction(
        &mut self,
        world: &mut dyn WorldStorage,
        reaction: Reaction,
    ) -> Result<(), WorldError> {
        match reaction {
            Reaction::SetBlock { pos, state } => self.set_block(world, pos, state).map(|_| ()),
            Reaction::Spawn(candidate) => self.spawn_entity(world, candidate, None).map(|_| ()),
            Reaction::NotifyNeighbors { source, targets } => {
                self.notify_neighbors(world, source, targets)
            }
        }
    }

    // -- Capture routing --

    /// Route a block write through the current phase.
    ///
    /// Bulk phases capture it (reading the previous state from the phase's
    /// own pending writes first), immediate phases apply and record it, and
    /// pass-through phases apply it. Returns the replaced state.
    #[track_caller]
    pub fn set_block(
        &mut self,
        world: &mut dyn WorldStorage,
        pos: BlockPos,
        state: BlockState,
    ) -> Result<BlockState, WorldError> {
        let frame = self.top_mut();
        match frame.state.capture_policy() {
            CapturePolicy::Bulk => {
                let original = frame
                    .context
                    .pending_state(pos)
                    .unwrap_or_else(|| world.get_block(pos));
                frame.context.capture_block_change(pos, original, state);
                Ok(original)
            }
            CapturePolicy::Immediate => {
                let previous = world.set_block(pos, state)?;
                frame.context.capture_block_change(pos, previous, state);
                Ok(previous)
            }
            CapturePolicy::PassThrough => world.set_block(pos, state),
        }
    }

    /// Read a block as the current phase sees it. A bulk phase sees its own
    /// pending writes; it never sees an enclosing phase's uncommitted ones.
    pub fn block_at(&self, world: &dyn WorldStorage, pos: BlockPos) -> BlockState {
        let top = self.top();
        match top.state.capture_policy() {
            CapturePolicy::Bulk => top
                .context
                .pending_state(pos)
                .unwrap_or_else(|| world.get_block(pos)),
            CapturePolicy::Immediate | CapturePolicy::PassThrough => world.get_block(pos),
        }
    }

    fn route_spawn<F>(
        &mut self,
        world: &mut dyn WorldStorage,
        candidate: SpawnCandidate,
        capture: F,
    ) -> Result<Option<EntityId>, WorldError>
    where
        F: FnOnce(&mut PhaseContext, EntityDescriptor),
    {
        let frame = self.top_mut();
        let spawn_type = frame.state.spawn_type_for(&frame.context, &candidate);
        let descriptor = EntityDescriptor::from_candidate(candidate, spawn_type);
        match frame.state.capture_policy() {
            CapturePolicy::PassThrough => world.spawn_entity(&descriptor).map(Some),
            CapturePolicy::Bulk | CapturePolicy::Immediate => {
                capture(&mut frame.context, descriptor);
                Ok(None)
            }
        }
    }

    /// Route an entity spawn, optionally attributed to a producing entity.
    /// Returns the new id when the spawn was applied directly.
    pub fn spawn_entity(
        &mut self,
        world: &mut dyn WorldStorage,
        candidate: SpawnCandidate,
        producer: Option<EntityId>,
    ) -> Result<Option<EntityId>, WorldError> {
        self.route_spawn(world, candidate, |ctx, d| ctx.capture_entity_spawn(d, producer))
    }

    pub fn drop_item(
        &mut self,
        world: &mut dyn WorldStorage,
        candidate: SpawnCandidate,
    ) -> Result<Option<EntityId>, WorldError> {
        self.route_spawn(world, candidate, |ctx, d| ctx.capture_item_drop(d))
    }

    pub fn drop_item_from_entity(
        &mut self,
        world: &mut dyn WorldStorage,
        entity: EntityId,
        candidate: SpawnCandidate,
    ) -> Result<Option<EntityId>, WorldError> {
        self.route_spawn(world, candidate, |ctx, d| {
            ctx.capture_item_drop_from_entity(entity, d)
        })
    }

    pub fn drop_item_from_block(
        &mut self,
        world: &mut dyn WorldStorage,
        pos: BlockPos,
        candidate: SpawnCandidate,
    ) -> Result<Option<EntityId>, WorldError> {
        self.route_spawn(world, candidate, |ctx, d| ctx.capture_item_drop_from_block(pos, d))
    }

    /// Route neighbor updates from `source` to each target.
    pub fn notify_neighbors(
        &mut self,
        world: &mut dyn WorldStorage,
        source: BlockPos,
        targets: Vec<BlockPos>,
    ) -> Result<(), WorldError> {
        if self.top().state.capture_policy() == CapturePolicy::PassThrough {
            for target in targets {
                world.notify_neighbor(source, target)?;
            }
            return Ok(());
        }
        let state = self.block_at(&*world, source);
        self.top_mut()
            .context
            .capture_neighbor_notification(NeighborNotification {
                source: BlockSnapshot::new(source, state),
                targets,
            });
        Ok(())
    }

    // -- Diagnostics --

    /// Snapshot of the phase stack, root first.
    pub fn dump(&self) -> PhaseStackDump {
        PhaseStackDump {
            frames: self
                .stack
                .iter()
                .enumerate()
                .map(|(depth, frame)| FrameSummary {
                    depth,
                    phase: frame.state.name(),
                    source: frame.context.source().map(|s| s.to_string()),
                    counts: frame.context.capture_counts(),
                    entered_at: frame.context.entered_at().map(|l| l.to_string()),
                })
                .collect(),
        }
    }

    /// Whether a diagnostic of this kind has been reported for `phase`.
    pub fn has_reported(&self, phase: &str, kind: DiagnosticKind) -> bool {
        self.reported.iter().any(|(p, k)| *p == phase && *k == kind)
    }

    pub(crate) fn report(&mut self, kind: DiagnosticKind, phase: &'static str, message: &str) {
        let first = self.reported.insert((phase, kind));
        if !first && self.config.report_once {
            tracing::trace!(?kind, phase, detail = message, "repeated diagnostic suppressed");
            return;
        }
        let dump = self.dump();
        if self.config.verbose_diagnostics {
            tracing::error!(?kind, phase, "{message}\n{dump}");
        } else {
            tracing::error!(?kind, phase, stack = ?dump.phases(), "{message}");
        }
    }
}

/// Split reactions into runs sharing an owner, keeping order.
fn group_by_owner(reactions: Vec<PendingReaction>) -> Vec<(PluginId, Vec<Reaction>)> {
    let mut groups: Vec<(PluginId, Vec<Reaction>)> = Vec::new();
    for PendingReaction { owner, reaction } in reactions {
        if let Some((last, batch)) = groups.last_mut()
            && *last == owner
        {
            batch.push(reaction);
            continue;
        }
        groups.push((owner, vec![reaction]));
    }
    groups
}

// ===========================================================================
// Tests
// ===========================================================================
