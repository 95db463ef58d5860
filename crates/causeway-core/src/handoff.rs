//! Off-thread trigger handoff.
//!
//! Phases that touch world state must run on the authoritative thread. Work
//! that arrives elsewhere (async command submissions, network threads) is
//! wrapped in a [`QueuedTrigger`] and sent through a bounded channel; the
//! authoritative thread runs everything queued at its next
//! [`HandoffQueue::drain`], in submission order, each inside its own
//! [`run_trigger`](crate::tracker::PhaseTracker::run_trigger) boundary.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::cause::CauseEntry;
use crate::config::TrackerConfig;
use crate::context::PhaseContext;
use crate::event::EventBus;
use crate::phase::PhaseState;
use crate::scope::{TriggerError, TriggerOutcome, TriggerScope};
use crate::tracker::PhaseTracker;
use crate::world::WorldStorage;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    #[error("handoff queue is full (capacity {capacity})")]
    Full { capacity: usize },
    #[error("handoff queue is disconnected")]
    Disconnected,
}

// ---------------------------------------------------------------------------
// QueuedTrigger
// ---------------------------------------------------------------------------

pub type TriggerTask = Box<dyn FnOnce(&mut TriggerScope<'_>) -> Result<(), TriggerError> + Send>;

pub type ContextSetup = Box<dyn FnOnce(&mut PhaseContext) + Send>;

/// A trigger waiting to be run on the authoritative thread.
pub struct QueuedTrigger {
    state: &'static dyn PhaseState,
    label: String,
    source: Option<CauseEntry>,
    setup: Option<ContextSetup>,
    task: TriggerTask,
}

impl std::fmt::Debug for QueuedTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTrigger")
            .field("phase", &self.state.name())
            .field("label", &self.label)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl QueuedTrigger {
    pub fn new<F>(state: &'static dyn PhaseState, task: F) -> Self
    where
        F: FnOnce(&mut TriggerScope<'_>) -> Result<(), TriggerError> + Send + 'static,
    {
        Self {
            state,
            label: String::new(),
            source: None,
            setup: None,
            task: Box::new(task),
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Source set on the phase context once any setup has run. Where it
    /// lands among the phase's attribution depends on the phase kind.
    pub fn with_source(mut self, source: CauseEntry) -> Self {
        self.source = Some(source);
        self
    }

    /// Populate the phase-specific context data before attribution is built.
    pub fn with_setup<S>(mut self, setup: S) -> Self
    where
        S: FnOnce(&mut PhaseContext) + Send + 'static,
    {
        self.setup = Some(Box::new(setup));
        self
    }

    pub fn phase(&self) -> &'static str {
        self.state.name()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Producer half, cheap to clone and safe to move to other threads.
#[derive(Debug, Clone)]
pub struct HandoffSender {
    tx: Sender<QueuedTrigger>,
    capacity: usize,
}

impl HandoffSender {
    /// Queue a trigger without blocking.
    pub fn submit(&self, trigger: QueuedTrigger) -> Result<(), HandoffError> {
        match self.tx.try_send(trigger) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(rejected)) => {
                tracing::warn!(
                    phase = rejected.phase(),
                    label = rejected.label(),
                    capacity = self.capacity,
                    "handoff queue full; trigger rejected"
                );
                Err(HandoffError::Full {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(HandoffError::Disconnected),
        }
    }
}

// ---------------------------------------------------------------------------
// HandoffQueue
// ---------------------------------------------------------------------------

/// One drained trigger, as kept in the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRecord {
    /// Position in overall drain order, starting at 0.
    pub sequence: u64,
    pub phase: &'static str,
    pub label: String,
    pub succeeded: bool,
}

/// Consumer half, owned by the authoritative thread.
#[derive(Debug)]
pub struct HandoffQueue {
    tx: Sender<QueuedTrigger>,
    rx: Receiver<QueuedTrigger>,
    capacity: usize,
    history: Vec<HandoffRecord>,
    /// Maximum history entries to retain. 0 = no history.
    max_history: usize,
    drained: u64,
}

impl HandoffQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            history: Vec::new(),
            max_history: 0,
            drained: 0,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.handoff_capacity)
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn sender(&self) -> HandoffSender {
        HandoffSender {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_count(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn history(&self) -> &[HandoffRecord] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Run every trigger queued before the call, oldest first.
    ///
    /// Triggers submitted while draining wait for the next drain.
    pub fn drain(
        &mut self,
        tracker: &mut PhaseTracker,
        world: &mut dyn WorldStorage,
        bus: &mut dyn EventBus,
    ) -> Vec<TriggerOutcome<()>> {
        let queued = self.rx.len();
        let mut outcomes = Vec::with_capacity(queued);
        for _ in 0..queued {
            let Ok(trigger) = self.rx.try_recv() else {
                break;
            };
            let QueuedTrigger {
                state,
                label,
                source,
                setup,
                task,
            } = trigger;

            let outcome = tracker.run_trigger(
                world,
                bus,
                state,
                |ctx| {
                    if let Some(setup) = setup {
                        setup(ctx);
                    }
                    if let Some(source) = source {
                        ctx.set_source(source);
                    }
                },
                task,
            );
            if let Some(err) = outcome.error() {
                tracing::debug!(phase = state.name(), label = %label, error = %err, "queued trigger aborted");
            }
            self.record(state.name(), label, outcome.is_success());
            outcomes.push(outcome);
        }
        outcomes
    }

    fn record(&mut self, phase: &'static str, label: String, succeeded: bool) {
        let sequence = self.drained;
        self.drained += 1;
        if self.max_history == 0 {
            return;
        }
        self.history.push(HandoffRecord {
            sequence,
            phase,
            label,
            succeeded,
        });
        let excess = self.history.len().saturating_sub(self.max_history);
        if excess > 0 {
            self.history.drain(..excess);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ListenerBus;
    use crate::id::*;
    use crate::phase::{COMMAND, PLUGIN_TASK};
    use crate::test_utils::*;
    use crate::world::MemoryWorld;

    fn set_block_task(pos: BlockPos, state: BlockState) -> QueuedTrigger {
        QueuedTrigger::new(&PLUGIN_TASK, move |scope| {
            scope.set_block(pos, state)?;
            Ok(())
        })
    }

    #[test]
    fn drain_runs_in_submission_order() {
        let mut tracker = PhaseTracker::default();
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        let mut queue = HandoffQueue::new(8);
        let sender = queue.sender();

        let a = BlockPos::new(0, 64, 0);
        let b = BlockPos::new(1, 64, 0);
        sender.submit(set_block_task(a, stone())).unwrap();
        sender.submit(set_block_task(b, dirt())).unwrap();
        sender.submit(set_block_task(a, grass())).unwrap();
        assert_eq!(queue.pending_count(), 3);

        let outcomes = queue.drain(&mut tracker, &mut world, &mut bus);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.is_success()));
        assert_eq!(world.write_log(), &[(a, stone()), (b, dirt()), (a, grass())]);
        assert!(queue.is_empty());
        assert!(tracker.is_idle());
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let queue = HandoffQueue::new(1);
        let sender = queue.sender();
        let pos = BlockPos::new(0, 0, 0);
        sender.submit(set_block_task(pos, stone())).unwrap();
        assert_eq!(
            sender.submit(set_block_task(pos, dirt())),
            Err(HandoffError::Full { capacity: 1 })
        );
    }

    #[test]
    fn submissions_from_other_threads_arrive() {
        let mut tracker = PhaseTracker::default();
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        let mut queue = HandoffQueue::new(16);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sender = queue.sender();
                std::thread::spawn(move || {
                    sender
                        .submit(set_block_task(BlockPos::new(i, 64, 0), stone()))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let outcomes = queue.drain(&mut tracker, &mut world, &mut bus);
        assert_eq!(outcomes.len(), 4);
        assert_eq!(world.write_log().len(), 4);
    }

    #[test]
    fn source_and_setup_reach_the_phase() {
        let mut tracker = PhaseTracker::default();
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        let mut queue = HandoffQueue::new(4).with_max_history(10);

        let trigger = QueuedTrigger::new(&COMMAND, |scope| {
            let cause = scope.causes_mut().current_cause();
            assert_eq!(cause.first_actor(), Some(ActorId(9)));
            // Command attribution goes on first, so the source is nearest.
            assert_eq!(cause.root(), &CauseEntry::Actor(ActorId(9)));
            assert!(cause.contains(&CauseEntry::Command("say hi".to_string())));
            Ok(())
        })
        .labelled("say")
        .with_source(CauseEntry::Actor(ActorId(9)))
        .with_setup(|ctx| {
            if let Some(command) = ctx.command_mut() {
                command.command = "say hi".to_string();
            }
        });
        queue.sender().submit(trigger).unwrap();

        let outcomes = queue.drain(&mut tracker, &mut world, &mut bus);
        assert!(outcomes[0].is_success());
        assert_eq!(
            queue.history(),
            &[HandoffRecord {
                sequence: 0,
                phase: "command",
                label: "say".to_string(),
                succeeded: true,
            }]
        );
    }

    #[test]
    fn failed_trigger_does_not_stop_the_drain() {
        let mut tracker = PhaseTracker::default();
        let mut world = MemoryWorld::new();
        let mut bus = ListenerBus::default();
        let mut queue = HandoffQueue::new(4).with_max_history(1);
        let sender = queue.sender();

        sender
            .submit(QueuedTrigger::new(&PLUGIN_TASK, |_| Err(TriggerError::failed("boom"))))
            .unwrap();
        sender
            .submit(set_block_task(BlockPos::new(0, 64, 0), stone()).labelled("second"))
            .unwrap();

        let outcomes = queue.drain(&mut tracker, &mut world, &mut bus);
        assert!(!outcomes[0].is_success());
        assert!(outcomes[1].is_success());
        assert_eq!(world.write_log().len(), 1);
        // History is trimmed to the newest entry.
        assert_eq!(queue.history().len(), 1);
        assert_eq!(queue.history()[0].label, "second");
        assert_eq!(queue.history()[0].sequence, 1);
    }
}
