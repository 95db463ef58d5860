//! Top-level trigger boundary.
//!
//! [`PhaseTracker::run_trigger`] is how trigger sources (packet handlers,
//! schedulers, command executors) should drive the tracker: it enters the
//! phase, hands the trigger body a [`TriggerScope`] with the world and bus
//! bound, and completes the phase. Whatever the body does, including
//! returning an error or panicking, the phase stack and cause stack are back
//! at their prior depth when `run_trigger` returns.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe, Location};

use crate::cause::CauseStack;
use crate::context::{PhaseContext, SpawnCandidate};
use crate::diagnostics::DiagnosticKind;
use crate::event::EventBus;
use crate::id::*;
use crate::phase::PhaseState;
use crate::tracker::{PhaseHandle, PhaseTracker, TrackerError};
use crate::transaction::UnwindReport;
use crate::world::{WorldError, WorldStorage};

// ---------------------------------------------------------------------------
// Errors and outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error("trigger failed: {0}")]
    Failed(String),
    #[error("trigger panicked: {0}")]
    Panicked(String),
}

impl TriggerError {
    pub fn failed(message: impl Into<String>) -> Self {
        TriggerError::Failed(message.into())
    }
}

/// The success/failure signal handed back to a trigger source.
#[derive(Debug)]
pub enum TriggerOutcome<T> {
    /// The body returned and the phase unwound. The report may still record
    /// failed commit groups.
    Completed { value: T, report: UnwindReport },
    /// The phase could not be entered, or the body failed or panicked; its
    /// captures were discarded.
    Aborted(TriggerError),
}

impl<T> TriggerOutcome<T> {
    /// Completed with every commit group succeeding.
    pub fn is_success(&self) -> bool {
        match self {
            TriggerOutcome::Completed { report, .. } => report.is_success(),
            TriggerOutcome::Aborted(_) => false,
        }
    }

    pub fn report(&self) -> Option<&UnwindReport> {
        match self {
            TriggerOutcome::Completed { report, .. } => Some(report),
            TriggerOutcome::Aborted(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TriggerError> {
        match self {
            TriggerOutcome::Completed { .. } => None,
            TriggerOutcome::Aborted(err) => Some(err),
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            TriggerOutcome::Completed { value, .. } => Some(value),
            TriggerOutcome::Aborted(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerScope
// ---------------------------------------------------------------------------

/// What a trigger body sees: its phase, plus routed access to the world.
pub struct TriggerScope<'a> {
    tracker: &'a mut PhaseTracker,
    world: &'a mut dyn WorldStorage,
    bus: &'a mut dyn EventBus,
    handle: PhaseHandle,
}

impl<'a> TriggerScope<'a> {
    pub fn handle(&self) -> PhaseHandle {
        self.handle
    }

    pub fn phase(&self) -> &'static dyn PhaseState {
        self.tracker.current_state()
    }

    pub fn context(&self) -> &PhaseContext {
        self.tracker.current().1
    }

    pub fn context_mut(&mut self) -> &mut PhaseContext {
        self.tracker.current_context_mut()
    }

    pub fn causes_mut(&mut self) -> &mut CauseStack {
        self.tracker.causes_mut()
    }

    /// Read-only view of authoritative storage, bypassing pending captures.
    pub fn world(&self) -> &dyn WorldStorage {
        &*self.world
    }

    pub fn set_block(&mut self, pos: BlockPos, state: BlockState) -> Result<BlockState, WorldError> {
        self.tracker.set_block(&mut *self.world, pos, state)
    }

    pub fn block_at(&self, pos: BlockPos) -> BlockState {
        self.tracker.block_at(&*self.world, pos)
    }

    pub fn spawn_entity(&mut self, candidate: SpawnCandidate) -> Result<Option<EntityId>, WorldError> {
        self.tracker.spawn_entity(&mut *self.world, candidate, None)
    }

    pub fn spawn_entity_from(
        &mut self,
        producer: EntityId,
        candidate: SpawnCandidate,
    ) -> Result<Option<EntityId>, WorldError> {
        self.tracker
            .spawn_entity(&mut *self.world, candidate, Some(producer))
    }

    pub fn drop_item(&mut self, candidate: SpawnCandidate) -> Result<Option<EntityId>, WorldError> {
        self.tracker.drop_item(&mut *self.world, candidate)
    }

    pub fn drop_item_from_entity(
        &mut self,
        entity: EntityId,
        candidate: SpawnCandidate,
    ) -> Result<Option<EntityId>, WorldError> {
        self.tracker
            .drop_item_from_entity(&mut *self.world, entity, candidate)
    }

    pub fn drop_item_from_block(
        &mut self,
        pos: BlockPos,
        candidate: SpawnCandidate,
    ) -> Result<Option<EntityId>, WorldError> {
        self.tracker
            .drop_item_from_block(&mut *self.world, pos, candidate)
    }

    pub fn notify_neighbors(&mut self, source: BlockPos, targets: Vec<BlockPos>) -> Result<(), WorldError> {
        self.tracker
            .notify_neighbors(&mut *self.world, source, targets)
    }

    /// Run a child trigger. It is fully unwound before this returns, and
    /// this scope's captures are untouched by it.
    #[track_caller]
    pub fn run_nested<T, S, F>(
        &mut self,
        state: &'static dyn PhaseState,
        setup: S,
        body: F,
    ) -> TriggerOutcome<T>
    where
        S: FnOnce(&mut PhaseContext),
        F: FnOnce(&mut TriggerScope<'_>) -> Result<T, TriggerError>,
    {
        let caller = Location::caller();
        self.tracker
            .run_trigger_at(&mut *self.world, &mut *self.bus, state, setup, body, caller)
    }
}

// ---------------------------------------------------------------------------
// run_trigger
// ---------------------------------------------------------------------------

impl PhaseTracker {
    /// Enter `state`, run `body`, and complete the phase.
    ///
    /// If the body returns an error or panics, the phase and anything it
    /// left open are discarded without committing, the failure is reported,
    /// and the stacks are restored to their depth before the call.
    #[track_caller]
    pub fn run_trigger<T, S, F>(
        &mut self,
        world: &mut dyn WorldStorage,
        bus: &mut dyn EventBus,
        state: &'static dyn PhaseState,
        setup: S,
        body: F,
    ) -> TriggerOutcome<T>
    where
        S: FnOnce(&mut PhaseContext),
        F: FnOnce(&mut TriggerScope<'_>) -> Result<T, TriggerError>,
    {
        let caller = Location::caller();
        self.run_trigger_at(world, bus, state, setup, body, caller)
    }

    pub(crate) fn run_trigger_at<T, S, F>(
        &mut self,
        world: &mut dyn WorldStorage,
        bus: &mut dyn EventBus,
        state: &'static dyn PhaseState,
        setup: S,
        body: F,
        caller: &'static Location<'static>,
    ) -> TriggerOutcome<T>
    where
        S: FnOnce(&mut PhaseContext),
        F: FnOnce(&mut TriggerScope<'_>) -> Result<T, TriggerError>,
    {
        let mark = self.mark();
        let name = state.name();

        let result = panic::catch_unwind(AssertUnwindSafe(
            || -> Result<(T, UnwindReport), TriggerError> {
                let handle = self.enter_at(state, setup, Some(caller))?;
                let value = {
                    let mut scope = TriggerScope {
                        tracker: &mut *self,
                        world: &mut *world,
                        bus: &mut *bus,
                        handle,
                    };
                    body(&mut scope)?
                };
                let report = self.complete(handle, world, bus)?;
                Ok((value, report))
            },
        ));

        match result {
            Ok(Ok((value, report))) => TriggerOutcome::Completed { value, report },
            Ok(Err(err)) => {
                if self.depth() > mark.depth {
                    tracing::warn!(phase = name, error = %err, "trigger failed; discarding its captures");
                }
                self.restore_to(mark, world);
                TriggerOutcome::Aborted(err)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.report(
                    DiagnosticKind::TriggerPanic,
                    name,
                    &format!("trigger panicked: {message}"),
                );
                self.restore_to(mark, world);
                TriggerOutcome::Aborted(TriggerError::Panicked(message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
