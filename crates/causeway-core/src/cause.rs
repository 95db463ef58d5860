//! Cause attribution: an ordered stack of cause entries plus a keyed context
//! side-table, scoped by frames.
//!
//! Every notification event carries an immutable [`Cause`] snapshot taken from
//! the [`CauseStack`] at the moment the event is built. Phases push their own
//! attribution onto a frame opened when the phase is entered; closing the
//! frame truncates the stack back to the depth recorded at entry and restores
//! any context values the frame overwrote, no matter what happened inside.
//!
//! # Frames
//!
//! Frames nest strictly. Closing a frame other than the innermost one is a
//! leak: the inner frames are closed as well (so the stack stays consistent)
//! and [`CauseStackError::FrameLeak`] is returned so the caller can report it.

use std::collections::BTreeMap;

use crate::id::*;
use crate::phase::SpawnType;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by [`CauseStack`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CauseStackError {
    #[error("cannot pop cause below frame floor at depth {floor}")]
    FrameUnderflow { floor: usize },
    #[error("cause frame {0} is not open")]
    UnknownFrame(u64),
    #[error("cause frame {expected} closed with {leaked} inner frame(s) still open")]
    FrameLeak { expected: u64, leaked: usize },
}

// ---------------------------------------------------------------------------
// Entries and context
// ---------------------------------------------------------------------------

/// One link in an attribution chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CauseEntry {
    Actor(ActorId),
    Plugin(PluginId),
    Entity(EntityId),
    Block(BlockSnapshot),
    Item(ItemStack),
    Command(String),
    Explosion { origin: BlockPos, radius: u32 },
    /// The phase kind that was active when the entry was pushed.
    Phase(&'static str),
    /// Placeholder used when nothing resolvable was pushed.
    Unknown,
}

impl std::fmt::Display for CauseEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CauseEntry::Actor(actor) => write!(f, "actor:{}", actor.0),
            CauseEntry::Plugin(plugin) => write!(f, "plugin:{plugin}"),
            CauseEntry::Entity(entity) => write!(f, "entity:{entity:?}"),
            CauseEntry::Block(snapshot) => {
                write!(f, "block:{}@{}", snapshot.state.0, snapshot.pos)
            }
            CauseEntry::Item(stack) => {
                write!(f, "item:{}x{}", stack.item_type.0, stack.quantity)
            }
            CauseEntry::Command(line) => write!(f, "command:{line}"),
            CauseEntry::Explosion { origin, radius } => {
                write!(f, "explosion:{origin}r{radius}")
            }
            CauseEntry::Phase(name) => write!(f, "phase:{name}"),
            CauseEntry::Unknown => f.write_str("unknown"),
        }
    }
}

/// Keys of the context side-table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextKey {
    /// Actor directly responsible for a mutation.
    Creator,
    /// Actor indirectly responsible for a mutation.
    Notifier,
    SpawnType,
    UsedItem,
    BlockHit,
    Plugin,
    Explosion,
    PhaseName,
    Custom(String),
}

/// Values of the context side-table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    Actor(ActorId),
    /// Attribution could not be resolved.
    NoNotifier,
    SpawnType(SpawnType),
    Item(ItemStack),
    Block(BlockSnapshot),
    Plugin(PluginId),
    Explosion { origin: BlockPos, radius: u32 },
    Phase(&'static str),
    Text(String),
}

// ---------------------------------------------------------------------------
// Cause snapshot
// ---------------------------------------------------------------------------

/// Immutable attribution snapshot attached to an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cause {
    /// Entries ordered nearest (last pushed) first.
    entries: Vec<CauseEntry>,
    context: BTreeMap<ContextKey, ContextValue>,
}

impl Cause {
    /// Build a cause from entries given nearest first.
    pub fn new(entries: Vec<CauseEntry>, context: BTreeMap<ContextKey, ContextValue>) -> Self {
        let entries = if entries.is_empty() {
            vec![CauseEntry::Unknown]
        } else {
            entries
        };
        Self { entries, context }
    }

    /// The nearest entry: the one pushed last.
    pub fn root(&self) -> &CauseEntry {
        // `new` guarantees at least one entry.
        &self.entries[0]
    }

    /// Iterate entries nearest first.
    pub fn iter(&self) -> impl Iterator<Item = &CauseEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, entry: &CauseEntry) -> bool {
        self.entries.contains(entry)
    }

    /// Nearest actor in the chain, if any.
    pub fn first_actor(&self) -> Option<ActorId> {
        self.entries.iter().find_map(|e| match e {
            CauseEntry::Actor(actor) => Some(*actor),
            _ => None,
        })
    }

    /// Nearest plugin in the chain, if any.
    pub fn first_plugin(&self) -> Option<&PluginId> {
        self.entries.iter().find_map(|e| match e {
            CauseEntry::Plugin(plugin) => Some(plugin),
            _ => None,
        })
    }

    pub fn context(&self, key: &ContextKey) -> Option<&ContextValue> {
        self.context.get(key)
    }

    pub fn creator(&self) -> Option<ActorId> {
        match self.context.get(&ContextKey::Creator) {
            Some(ContextValue::Actor(actor)) => Some(*actor),
            _ => None,
        }
    }

    pub fn notifier(&self) -> Option<ActorId> {
        match self.context.get(&ContextKey::Notifier) {
            Some(ContextValue::Actor(actor)) => Some(*actor),
            _ => None,
        }
    }

    pub fn spawn_type(&self) -> Option<SpawnType> {
        match self.context.get(&ContextKey::SpawnType) {
            Some(ContextValue::SpawnType(spawn_type)) => Some(*spawn_type),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// CauseStack
// ---------------------------------------------------------------------------

/// Handle returned by [`CauseStack::push_frame`]; must be passed back to
/// [`CauseStack::pop_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CauseFrameHandle {
    id: u64,
}

impl CauseFrameHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
struct FrameRecord {
    id: u64,
    /// Stack depth at frame entry.
    depth: usize,
    /// Context values as they were before this frame first touched each key.
    saved: Vec<(ContextKey, Option<ContextValue>)>,
}

/// Ordered cause stack with frame scoping and a context side-table.
#[derive(Debug, Default)]
pub struct CauseStack {
    /// Bottom first; the last element is the nearest cause.
    causes: Vec<CauseEntry>,
    context: BTreeMap<ContextKey, ContextValue>,
    frames: Vec<FrameRecord>,
    next_frame_id: u64,
    cached: Option<Cause>,
}

impl CauseStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cause entries on the stack.
    pub fn depth(&self) -> usize {
        self.causes.len()
    }

    /// Number of open frames.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_cause(&mut self, entry: CauseEntry) {
        self.cached = None;
        self.causes.push(entry);
    }

    /// Pop the nearest cause. Entries pushed before the innermost open frame
    /// belong to an outer scope and cannot be popped.
    pub fn pop_cause(&mut self) -> Result<CauseEntry, CauseStackError> {
        let floor = self.floor();
        if self.causes.len() <= floor {
            return Err(CauseStackError::FrameUnderflow { floor });
        }
        self.cached = None;
        // Length checked against the floor above.
        self.causes
            .pop()
            .ok_or(CauseStackError::FrameUnderflow { floor })
    }

    /// Pop `n` causes. Stops at the frame floor and reports underflow without
    /// popping anything if fewer than `n` are available.
    pub fn pop_causes(&mut self, n: usize) -> Result<Vec<CauseEntry>, CauseStackError> {
        let floor = self.floor();
        if self.causes.len().saturating_sub(floor) < n {
            return Err(CauseStackError::FrameUnderflow { floor });
        }
        self.cached = None;
        let start = self.causes.len() - n;
        let mut popped: Vec<CauseEntry> = self.causes.drain(start..).collect();
        popped.reverse();
        Ok(popped)
    }

    pub fn peek_cause(&self) -> Option<&CauseEntry> {
        self.causes.last()
    }

    /// Open a new frame recording the current depth.
    pub fn push_frame(&mut self) -> CauseFrameHandle {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.frames.push(FrameRecord {
            id,
            depth: self.causes.len(),
            saved: Vec::new(),
        });
        CauseFrameHandle { id }
    }

    /// Close a frame: truncate the stack to the depth recorded at entry and
    /// restore context values modified within it.
    ///
    /// Closing a frame that still has inner frames open closes those too and
    /// returns [`CauseStackError::FrameLeak`].
    pub fn pop_frame(&mut self, handle: CauseFrameHandle) -> Result<(), CauseStackError> {
        let Some(index) = self.frames.iter().rposition(|f| f.id == handle.id) else {
            return Err(CauseStackError::UnknownFrame(handle.id));
        };

        let leaked = self.frames.len() - index - 1;
        if leaked > 0 {
            tracing::error!(
                frame = handle.id,
                leaked,
                "cause frame closed out of order; closing leaked inner frames"
            );
        }

        while self.frames.len() > index {
            if let Some(frame) = self.frames.pop() {
                self.restore(frame);
            }
        }
        self.cached = None;

        if leaked > 0 {
            Err(CauseStackError::FrameLeak {
                expected: handle.id,
                leaked,
            })
        } else {
            Ok(())
        }
    }

    /// Whether the given frame is still open.
    pub fn is_frame_open(&self, handle: CauseFrameHandle) -> bool {
        self.frames.iter().any(|f| f.id == handle.id)
    }

    /// Close every frame above `frame_depth`, innermost first. Returns how
    /// many were closed.
    pub fn close_frames_to(&mut self, frame_depth: usize) -> usize {
        let mut closed = 0;
        while self.frames.len() > frame_depth {
            if let Some(frame) = self.frames.pop() {
                self.restore(frame);
                closed += 1;
            }
        }
        if closed > 0 {
            self.cached = None;
        }
        closed
    }

    /// Set a context value. Returns the previous value.
    pub fn add_context(&mut self, key: ContextKey, value: ContextValue) -> Option<ContextValue> {
        self.cached = None;
        let previous = self.context.insert(key.clone(), value);
        self.remember(key, previous.clone());
        previous
    }

    /// Remove a context value. Returns the removed value.
    pub fn remove_context(&mut self, key: &ContextKey) -> Option<ContextValue> {
        let previous = self.context.remove(key);
        if previous.is_some() {
            self.cached = None;
            self.remember(key.clone(), previous.clone());
        }
        previous
    }

    pub fn context(&self, key: &ContextKey) -> Option<&ContextValue> {
        self.context.get(key)
    }

    /// Snapshot the stack. The snapshot is cached until the next mutation.
    pub fn current_cause(&mut self) -> Cause {
        if let Some(cause) = &self.cached {
            return cause.clone();
        }
        let entries = self.causes.iter().rev().cloned().collect();
        let cause = Cause::new(entries, self.context.clone());
        self.cached = Some(cause.clone());
        cause
    }

    fn floor(&self) -> usize {
        self.frames.last().map(|f| f.depth).unwrap_or(0)
    }

    fn remember(&mut self, key: ContextKey, previous: Option<ContextValue>) {
        if let Some(frame) = self.frames.last_mut()
            && !frame.saved.iter().any(|(k, _)| *k == key)
        {
            frame.saved.push((key, previous));
        }
    }

    fn restore(&mut self, frame: FrameRecord) {
        self.causes.truncate(frame.depth);
        for (key, previous) in frame.saved.into_iter().rev() {
            match previous {
                Some(value) => {
                    self.context.insert(key, value);
                }
                None => {
                    self.context.remove(&key);
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
