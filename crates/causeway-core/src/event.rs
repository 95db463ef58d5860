//! Notification events and the event bus collaborator.
//!
//! The transaction processor turns drained capture buffers into events and
//! posts them through an [`EventBus`]. The only things it reads back are the
//! cancellation outcome and the replacement data an event type defines
//! (invalidated or customised block transactions, removed spawn intents,
//! removed neighbor targets).
//!
//! # Subscriber Types
//!
//! [`ListenerBus`] is the reference bus:
//!
//! - **Observers**: read-only, used for logging, auditing, analytics.
//! - **Interceptors**: may cancel the event or edit its replacement data.
//! - **Reactive handlers**: return follow-up world mutations. The tracker
//!   replays them after the phase unwinds inside a nested listener phase
//!   owned by the subscriber's plugin.
//!
//! Posted events are kept in a per-kind ring buffer for inspection. Event
//! kinds can be suppressed, in which case they are neither dispatched nor
//! recorded.

use crate::cause::Cause;
use crate::context::{EntityDescriptor, SpawnCandidate};
use crate::id::*;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A listener failed while handling an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("listener owned by '{owner}' failed: {message}")]
pub struct ListenerError {
    pub owner: String,
    pub message: String,
}

impl ListenerError {
    pub fn new(owner: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Block transactions
// ---------------------------------------------------------------------------

/// What a block transition does to its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockOperation {
    Place,
    Break,
    Modify,
}

impl BlockOperation {
    pub fn classify(original: BlockState, final_state: BlockState) -> Self {
        if final_state.is_air() {
            BlockOperation::Break
        } else if original.is_air() {
            BlockOperation::Place
        } else {
            BlockOperation::Modify
        }
    }
}

/// One position's pending change inside a [`ChangeBlocksEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    pos: BlockPos,
    original: BlockState,
    proposed: BlockState,
    custom: Option<BlockState>,
    valid: bool,
}

impl BlockTransaction {
    pub fn new(pos: BlockPos, original: BlockState, proposed: BlockState) -> Self {
        Self {
            pos,
            original,
            proposed,
            custom: None,
            valid: true,
        }
    }

    pub fn pos(&self) -> BlockPos {
        self.pos
    }

    /// State before the phase touched the position.
    pub fn original(&self) -> BlockState {
        self.original
    }

    /// State of the last capture at the position.
    pub fn proposed(&self) -> BlockState {
        self.proposed
    }

    /// The state that will be written if the transaction stays valid.
    pub fn final_state(&self) -> BlockState {
        self.custom.unwrap_or(self.proposed)
    }

    /// Replace the state written for this position.
    pub fn set_custom(&mut self, state: BlockState) {
        self.custom = Some(state);
    }

    pub fn custom(&self) -> Option<BlockState> {
        self.custom
    }

    /// Reject this position only; the rest of the event still applies.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn operation(&self) -> BlockOperation {
        BlockOperation::classify(self.original, self.final_state())
    }
}

/// A block change that was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReceipt {
    pub pos: BlockPos,
    pub original: BlockState,
    pub final_state: BlockState,
    pub operation: BlockOperation,
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Posted before captured block changes are committed. Cancellable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBlocksEvent {
    pub cause: Cause,
    transactions: Vec<BlockTransaction>,
    cancelled: bool,
}

impl ChangeBlocksEvent {
    pub fn new(cause: Cause, transactions: Vec<BlockTransaction>) -> Self {
        Self {
            cause,
            transactions,
            cancelled: false,
        }
    }

    /// One transaction per affected position, in order of first capture.
    /// Listeners can invalidate or rewrite entries but not add or remove
    /// positions.
    pub fn transactions(&self) -> &[BlockTransaction] {
        &self.transactions
    }

    pub fn transactions_mut(&mut self) -> impl Iterator<Item = &mut BlockTransaction> {
        self.transactions.iter_mut()
    }

    pub fn transaction(&self, pos: BlockPos) -> Option<&BlockTransaction> {
        self.transactions.iter().find(|t| t.pos == pos)
    }

    pub fn transaction_mut(&mut self, pos: BlockPos) -> Option<&mut BlockTransaction> {
        self.transactions.iter_mut().find(|t| t.pos == pos)
    }
}

/// Posted after block changes are committed. Informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBlocksPostEvent {
    pub cause: Cause,
    pub receipts: Vec<BlockReceipt>,
}

/// What produced a group of spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpawnOrigin {
    /// The phase itself, no specific producer.
    Phase,
    Entity(EntityId),
    Block(BlockPos),
}

/// Whether a spawn group holds general entities or dropped items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpawnGroupKind {
    Entities,
    ItemDrops,
}

/// Posted before a group of entities is materialized. Cancellable; listeners
/// may also remove individual intents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnEntitiesEvent {
    pub cause: Cause,
    pub origin: SpawnOrigin,
    pub group: SpawnGroupKind,
    pub entities: Vec<EntityDescriptor>,
    cancelled: bool,
}

impl SpawnEntitiesEvent {
    pub fn new(
        cause: Cause,
        origin: SpawnOrigin,
        group: SpawnGroupKind,
        entities: Vec<EntityDescriptor>,
    ) -> Self {
        Self {
            cause,
            origin,
            group,
            entities,
            cancelled: false,
        }
    }
}

/// Posted before a block's neighbor updates are delivered. Cancellable;
/// listeners may also remove individual targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyNeighborsEvent {
    pub cause: Cause,
    pub source: BlockSnapshot,
    pub targets: Vec<BlockPos>,
    cancelled: bool,
}

impl NotifyNeighborsEvent {
    pub fn new(cause: Cause, source: BlockSnapshot, targets: Vec<BlockPos>) -> Self {
        Self {
            cause,
            source,
            targets,
            cancelled: false,
        }
    }
}

/// A notification event produced while unwinding a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ChangeBlocks(ChangeBlocksEvent),
    ChangeBlocksPost(ChangeBlocksPostEvent),
    SpawnEntities(SpawnEntitiesEvent),
    NotifyNeighbors(NotifyNeighborsEvent),
}

/// Discriminant tag for event types, used for subscription and suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChangeBlocks,
    ChangeBlocksPost,
    SpawnEntities,
    NotifyNeighbors,
}

/// Total number of event kinds.
const EVENT_KIND_COUNT: usize = 4;

impl EventKind {
    fn index(self) -> usize {
        self as usize
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ChangeBlocks(_) => EventKind::ChangeBlocks,
            Event::ChangeBlocksPost(_) => EventKind::ChangeBlocksPost,
            Event::SpawnEntities(_) => EventKind::SpawnEntities,
            Event::NotifyNeighbors(_) => EventKind::NotifyNeighbors,
        }
    }

    pub fn cause(&self) -> &Cause {
        match self {
            Event::ChangeBlocks(e) => &e.cause,
            Event::ChangeBlocksPost(e) => &e.cause,
            Event::SpawnEntities(e) => &e.cause,
            Event::NotifyNeighbors(e) => &e.cause,
        }
    }

    pub fn is_cancellable(&self) -> bool {
        !matches!(self, Event::ChangeBlocksPost(_))
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Event::ChangeBlocks(e) => e.cancelled,
            Event::ChangeBlocksPost(_) => false,
            Event::SpawnEntities(e) => e.cancelled,
            Event::NotifyNeighbors(e) => e.cancelled,
        }
    }

    /// Set the cancellation flag. Ignored for informational events.
    pub fn set_cancelled(&mut self, cancelled: bool) {
        match self {
            Event::ChangeBlocks(e) => e.cancelled = cancelled,
            Event::ChangeBlocksPost(_) => {}
            Event::SpawnEntities(e) => e.cancelled = cancelled,
            Event::NotifyNeighbors(e) => e.cancelled = cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// Reactions (returned by reactive handlers)
// ---------------------------------------------------------------------------

/// A follow-up mutation requested by a reactive handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    SetBlock { pos: BlockPos, state: BlockState },
    Spawn(SpawnCandidate),
    NotifyNeighbors { source: BlockPos, targets: Vec<BlockPos> },
}

/// A reaction tagged with the plugin whose handler produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReaction {
    pub owner: PluginId,
    pub reaction: Reaction,
}

// ---------------------------------------------------------------------------
// EventBus trait
// ---------------------------------------------------------------------------

/// Event dispatch collaborator.
pub trait EventBus {
    /// Dispatch an event to listeners. Returns whether it ended up cancelled.
    fn post(&mut self, event: &mut Event) -> Result<bool, ListenerError>;

    /// Take reactions collected from reactive handlers since the last drain.
    fn drain_reactions(&mut self) -> Vec<PendingReaction> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// EventBuffer
// ---------------------------------------------------------------------------

/// A pre-allocated ring buffer of posted events. Fixed capacity; when full,
/// the oldest events are dropped.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<Option<Event>>,
    /// Write position (wraps around).
    head: usize,
    len: usize,
    /// Total events ever written (including dropped).
    total_written: u64,
}

impl EventBuffer {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    pub fn push(&mut self, event: Event) {
        self.events[self.head] = Some(event);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
        self.total_written += 1;
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Iterate over events from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        let start = if self.len < self.capacity() { 0 } else { self.head };
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.events[(start + i) % capacity].as_ref())
    }

    /// The most recently pushed event.
    pub fn last(&self) -> Option<&Event> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.capacity() - 1) % self.capacity();
        self.events[idx].as_ref()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.events {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Read-only listener.
pub type Observer = Box<dyn FnMut(&Event)>;

/// Listener that may cancel the event or edit its replacement data.
pub type Interceptor = Box<dyn FnMut(&mut Event) -> Result<(), ListenerError>>;

/// Listener that returns follow-up mutations.
pub type ReactiveHandler = Box<dyn FnMut(&Event) -> Vec<Reaction>>;

/// Optional predicate that filters events for a subscriber.
pub type EventFilter = Box<dyn Fn(&Event) -> bool>;

/// A registered listener.
pub enum Subscriber {
    Observe(Observer),
    Intercept(Interceptor),
    React(ReactiveHandler),
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subscriber::Observe(_) => write!(f, "Observe(<fn>)"),
            Subscriber::Intercept(_) => write!(f, "Intercept(<fn>)"),
            Subscriber::React(_) => write!(f, "React(<fn>)"),
        }
    }
}

/// Priority level for subscribers. Lower priorities run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscriberPriority {
    Pre = 0,
    Normal = 1,
    Post = 2,
}

struct SubscriberEntry {
    owner: PluginId,
    subscriber: Subscriber,
    priority: SubscriberPriority,
    filter: Option<EventFilter>,
    insertion_order: u64,
}

impl std::fmt::Debug for SubscriberEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberEntry")
            .field("owner", &self.owner)
            .field("subscriber", &self.subscriber)
            .field("priority", &self.priority)
            .field(
                "filter",
                &if self.filter.is_some() {
                    "Some(<fn>)"
                } else {
                    "None"
                },
            )
            .field("insertion_order", &self.insertion_order)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ListenerBus
// ---------------------------------------------------------------------------

/// Reference [`EventBus`]: per-kind subscriber lists, suppression flags and
/// a history ring buffer per kind.
pub struct ListenerBus {
    subscribers: [Vec<SubscriberEntry>; EVENT_KIND_COUNT],
    /// Whether each subscriber list needs re-sorting before the next post.
    unsorted: [bool; EVENT_KIND_COUNT],
    suppressed: [bool; EVENT_KIND_COUNT],
    history: [Option<EventBuffer>; EVENT_KIND_COUNT],
    pending_reactions: Vec<PendingReaction>,
    history_capacity: usize,
    next_insertion_order: u64,
}

impl std::fmt::Debug for ListenerBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBus")
            .field("subscribers", &self.subscribers)
            .field("suppressed", &self.suppressed)
            .field("pending_reactions", &self.pending_reactions)
            .field("history_capacity", &self.history_capacity)
            .finish_non_exhaustive()
    }
}

impl ListenerBus {
    /// Create a bus keeping up to `history_capacity` posted events per kind.
    pub fn new(history_capacity: usize) -> Self {
        Self {
            subscribers: Default::default(),
            unsorted: [false; EVENT_KIND_COUNT],
            suppressed: [false; EVENT_KIND_COUNT],
            history: Default::default(),
            pending_reactions: Vec::new(),
            history_capacity,
            next_insertion_order: 0,
        }
    }

    /// Register a subscriber with explicit priority and optional filter.
    pub fn subscribe(
        &mut self,
        kind: EventKind,
        owner: PluginId,
        priority: SubscriberPriority,
        filter: Option<EventFilter>,
        subscriber: Subscriber,
    ) {
        let order = self.next_insertion_order;
        self.next_insertion_order += 1;
        self.subscribers[kind.index()].push(SubscriberEntry {
            owner,
            subscriber,
            priority,
            filter,
            insertion_order: order,
        });
        self.unsorted[kind.index()] = true;
    }

    pub fn on_observe(&mut self, kind: EventKind, owner: PluginId, observer: Observer) {
        self.subscribe(
            kind,
            owner,
            SubscriberPriority::Normal,
            None,
            Subscriber::Observe(observer),
        );
    }

    pub fn on_intercept(&mut self, kind: EventKind, owner: PluginId, interceptor: Interceptor) {
        self.subscribe(
            kind,
            owner,
            SubscriberPriority::Normal,
            None,
            Subscriber::Intercept(interceptor),
        );
    }

    pub fn on_react(&mut self, kind: EventKind, owner: PluginId, handler: ReactiveHandler) {
        self.subscribe(
            kind,
            owner,
            SubscriberPriority::Normal,
            None,
            Subscriber::React(handler),
        );
    }

    /// Remove every subscriber owned by `owner`. Returns how many were removed.
    pub fn unsubscribe_all(&mut self, owner: &PluginId) -> usize {
        let mut removed = 0;
        for list in &mut self.subscribers {
            let before = list.len();
            list.retain(|entry| &entry.owner != owner);
            removed += before - list.len();
        }
        removed
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers[kind.index()].len()
    }

    /// Suppress an event kind: it is neither dispatched nor recorded.
    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
        self.history[kind.index()] = None;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// Posted events of a kind, oldest first.
    pub fn history(&self, kind: EventKind) -> Option<&EventBuffer> {
        self.history[kind.index()].as_ref()
    }

    pub fn posted_count(&self, kind: EventKind) -> u64 {
        self.history[kind.index()]
            .as_ref()
            .map(|b| b.total_written())
            .unwrap_or(0)
    }

    pub fn clear_history(&mut self) {
        for buffer in self.history.iter_mut().flatten() {
            buffer.clear();
        }
    }

    pub fn pending_reaction_count(&self) -> usize {
        self.pending_reactions.len()
    }

    fn record(&mut self, event: &Event) {
        let idx = event.kind().index();
        if self.history_capacity == 0 {
            return;
        }
        let capacity = self.history_capacity;
        self.history[idx]
            .get_or_insert_with(|| EventBuffer::new(capacity))
            .push(event.clone());
    }
}

impl Default for ListenerBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for ListenerBus {
    /// Deliver an event to subscribers of its kind, ordered by
    /// `(priority, insertion_order)`. An interceptor error aborts delivery.
    fn post(&mut self, event: &mut Event) -> Result<bool, ListenerError> {
        let idx = event.kind().index();
        if self.suppressed[idx] {
            return Ok(event.is_cancelled());
        }

        if self.unsorted[idx] {
            self.subscribers[idx]
                .sort_by_key(|entry| (entry.priority as u8, entry.insertion_order));
            self.unsorted[idx] = false;
        }

        for entry in &mut self.subscribers[idx] {
            if let Some(ref filter) = entry.filter
                && !filter(event)
            {
                continue;
            }

            match &mut entry.subscriber {
                Subscriber::Observe(observer) => observer(event),
                Subscriber::Intercept(interceptor) => {
                    if let Err(err) = interceptor(event) {
                        tracing::debug!(owner = %entry.owner, error = %err, "interceptor failed");
                        return Err(err);
                    }
                }
                Subscriber::React(handler) => {
                    let owner = entry.owner.clone();
                    self.pending_reactions
                        .extend(handler(event).into_iter().map(|reaction| PendingReaction {
                            owner: owner.clone(),
                            reaction,
                        }));
                }
            }
        }

        self.record(event);
        Ok(event.is_cancelled())
    }

    fn drain_reactions(&mut self) -> Vec<PendingReaction> {
        std::mem::take(&mut self.pending_reactions)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
