//! Causeway Core -- phase and transaction tracking for block-world servers.
//!
//! Every mutation a server performs (a block placed by a player, an item
//! dropped by a plugin task, an explosion breaking terrain) happens inside a
//! *phase*. Phases capture mutations instead of applying them, attribute them
//! to whoever caused them, and commit them in a controlled order when they
//! complete, giving listeners a chance to inspect, modify or cancel them.
//!
//! # Phase Lifecycle
//!
//! 1. **Enter** -- A trigger source pushes a phase kind onto the
//!    [`tracker::PhaseTracker`] and populates its [`context::PhaseContext`].
//!    The phase's attribution is pushed onto the [`cause::CauseStack`].
//! 2. **Capture** -- Block writes, spawns, item drops and neighbor
//!    notifications are routed to the current phase's context according to
//!    its [`phase::CapturePolicy`].
//! 3. **Complete** -- The phase is popped and its captures are unwound by a
//!    [`transaction::TransactionProcessor`]: block changes, then neighbor
//!    notifications, then spawns, each group posted as an [`event::Event`]
//!    before being applied to [`world::WorldStorage`].
//! 4. **React** -- Follow-up mutations returned by reactive listeners run in
//!    nested [`phase::LISTENER`] phases.
//!
//! Trigger sources usually go through [`tracker::PhaseTracker::run_trigger`],
//! which restores the stacks even when the trigger body fails or panics.
//! Work produced off the authoritative thread goes through a
//! [`handoff::HandoffQueue`].
//!
//! ```rust,ignore
//! let outcome = tracker.run_trigger(&mut world, &mut bus, &PLACE_BLOCK, |ctx| {
//!     ctx.set_source(CauseEntry::Actor(player));
//! }, |scope| {
//!     scope.set_block(pos, stone)?;
//!     Ok(())
//! });
//! ```
//!
//! # Key Types
//!
//! - [`tracker::PhaseTracker`] -- The phase stack, context pool and routing.
//! - [`phase::PhaseState`] -- Behavior of a phase kind; built-ins are statics.
//! - [`cause::CauseStack`] -- Frame-scoped attribution stack.
//! - [`transaction::UnwindReport`] -- Per-group outcome of a commit.
//! - [`event::ListenerBus`] -- Reference event bus with priorities and history.
//! - [`config::TrackerConfig`] -- Tunables, loadable from RON, TOML or JSON.

pub mod cause;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod event;
pub mod handoff;
pub mod id;
pub mod phase;
pub mod scope;
pub mod tracker;
pub mod transaction;
pub mod world;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
