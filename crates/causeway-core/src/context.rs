//! Per-activation capture record.
//!
//! A [`PhaseContext`] is owned by exactly one frame of the phase stack. While
//! its phase is active, simulation mutations are appended to its buffers
//! instead of being applied; the transaction processor drains the buffers
//! when the phase unwinds. The context itself never touches world storage or
//! the event bus.
//!
//! Buffers preserve insertion order and perform no deduplication: capturing
//! twice at the same position records two changes, and the later one wins
//! when the buffer is committed.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::Location;

use crate::cause::CauseEntry;
use crate::id::*;
use crate::phase::SpawnType;

// ---------------------------------------------------------------------------
// Captured values
// ---------------------------------------------------------------------------

/// A pending block-state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChange {
    pub pos: BlockPos,
    pub original: BlockState,
    pub proposed: BlockState,
}

/// Broad classification of an entity about to spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityCategory {
    Item,
    ExperienceOrb,
    Living,
    Projectile,
    FallingBlock,
    Other,
}

/// An entity the simulation wants to create, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCandidate {
    pub entity_type: EntityTypeId,
    pub category: EntityCategory,
    pub pos: BlockPos,
    /// Carried stack for item entities.
    pub item: Option<ItemStack>,
}

impl SpawnCandidate {
    pub fn new(entity_type: EntityTypeId, category: EntityCategory, pos: BlockPos) -> Self {
        Self {
            entity_type,
            category,
            pos,
            item: None,
        }
    }

    pub fn with_item(mut self, item: ItemStack) -> Self {
        self.item = Some(item);
        self
    }
}

/// A classified spawn intent, ready to be materialized by world storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub entity_type: EntityTypeId,
    pub category: EntityCategory,
    pub pos: BlockPos,
    pub item: Option<ItemStack>,
    pub spawn_type: SpawnType,
}

impl EntityDescriptor {
    pub fn from_candidate(candidate: SpawnCandidate, spawn_type: SpawnType) -> Self {
        Self {
            entity_type: candidate.entity_type,
            category: candidate.category,
            pos: candidate.pos,
            item: candidate.item,
            spawn_type,
        }
    }
}

/// A block asking its neighbors to re-evaluate themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborNotification {
    pub source: BlockSnapshot,
    pub targets: Vec<BlockPos>,
}

// ---------------------------------------------------------------------------
// Grouped buffer
// ---------------------------------------------------------------------------

/// Ordered sequences partitioned by key. Groups are kept in order of first
/// insertion; values within a group keep insertion order.
#[derive(Debug, Clone)]
pub struct Grouped<K, V> {
    groups: Vec<(K, Vec<V>)>,
    index: HashMap<K, usize>,
}

impl<K, V> Default for Grouped<K, V> {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash, V> Grouped<K, V> {
    pub fn push(&mut self, key: K, value: V) {
        match self.index.get(&key) {
            Some(&i) => self.groups[i].1.push(value),
            None => {
                self.index.insert(key, self.groups.len());
                self.groups.push((key, vec![value]));
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&[V]> {
        self.index.get(key).map(|&i| self.groups[i].1.as_slice())
    }

    /// Total number of values across all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, v)| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &[V])> {
        self.groups.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Take all groups, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<(K, Vec<V>)> {
        self.index.clear();
        std::mem::take(&mut self.groups)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.groups.clear();
    }
}

// ---------------------------------------------------------------------------
// Phase-specific data
// ---------------------------------------------------------------------------

/// Fields of a packet-driven interaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketData {
    pub actor: Option<ActorId>,
    pub used_item: Option<ItemStack>,
    pub target_block: Option<BlockSnapshot>,
}

/// Fields of a plugin-initiated or scheduled task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginData {
    pub plugin: Option<PluginId>,
    pub task: Option<String>,
}

/// Fields of an explosion being resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplosionData {
    pub origin: BlockPos,
    pub radius: u32,
    /// When false, captured block changes are discarded on unwind.
    pub breaks_blocks: bool,
    pub detonator: Option<EntityId>,
}

impl Default for ExplosionData {
    fn default() -> Self {
        Self {
            origin: BlockPos::new(0, 0, 0),
            radius: 0,
            breaks_blocks: true,
            detonator: None,
        }
    }
}

/// Fields of a command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandData {
    pub sender: Option<ActorId>,
    pub command: String,
    /// Set by unwind: whether every commit group succeeded.
    pub succeeded: bool,
}

/// Fields of a block or entity tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickData {
    pub block: Option<BlockSnapshot>,
    pub entity: Option<EntityId>,
}

/// Fields of a listener callback phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerData {
    pub owner: Option<PluginId>,
}

/// Fields of a plugin block-worker stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockWorkerData {
    pub plugin: Option<PluginId>,
    pub label: String,
}

/// Phase-specific fields, selected by the phase state at entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PhaseData {
    #[default]
    None,
    Packet(PacketData),
    Plugin(PluginData),
    Explosion(ExplosionData),
    Command(CommandData),
    Tick(TickData),
    Listener(ListenerData),
    BlockWorker(BlockWorkerData),
}

// ---------------------------------------------------------------------------
// Capture counts
// ---------------------------------------------------------------------------

/// Sizes of the capture buffers, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CaptureCounts {
    pub blocks: usize,
    pub entity_spawns: usize,
    pub item_drops: usize,
    pub neighbor_notifications: usize,
}

impl CaptureCounts {
    pub fn total(&self) -> usize {
        self.blocks + self.entity_spawns + self.item_drops + self.neighbor_notifications
    }
}

// ---------------------------------------------------------------------------
// PhaseContext
// ---------------------------------------------------------------------------

/// The live record for one phase activation.
#[derive(Debug, Default)]
pub struct PhaseContext {
    source: Option<CauseEntry>,
    creator: Option<ActorId>,
    notifier: Option<ActorId>,
    data: PhaseData,

    captured_blocks: Vec<BlockChange>,
    entity_spawns: Vec<EntityDescriptor>,
    entity_spawns_by_producer: Grouped<EntityId, EntityDescriptor>,
    item_drops: Vec<EntityDescriptor>,
    item_drops_by_entity: Grouped<EntityId, EntityDescriptor>,
    item_drops_by_block: Grouped<BlockPos, EntityDescriptor>,
    neighbor_notifications: Vec<NeighborNotification>,

    completed: bool,
    entered_at: Option<&'static Location<'static>>,
}

impl PhaseContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every field so the context can be reused from the pool.
    pub(crate) fn reset(&mut self) {
        self.source = None;
        self.creator = None;
        self.notifier = None;
        self.data = PhaseData::None;
        self.discard_captures();
        self.completed = false;
        self.entered_at = None;
    }

    pub(crate) fn prepare(&mut self, data: PhaseData, entered_at: Option<&'static Location<'static>>) {
        self.data = data;
        self.entered_at = entered_at;
    }

    // -- Attribution --

    pub fn source(&self) -> Option<&CauseEntry> {
        self.source.as_ref()
    }

    pub fn set_source(&mut self, source: CauseEntry) -> &mut Self {
        self.source = Some(source);
        self
    }

    pub fn creator(&self) -> Option<ActorId> {
        self.creator
    }

    pub fn set_creator(&mut self, creator: ActorId) -> &mut Self {
        self.creator = Some(creator);
        self
    }

    pub fn notifier(&self) -> Option<ActorId> {
        self.notifier
    }

    pub fn set_notifier(&mut self, notifier: ActorId) -> &mut Self {
        self.notifier = Some(notifier);
        self
    }

    /// Call site of the `enter` that created this activation, when recorded.
    pub fn entered_at(&self) -> Option<&'static Location<'static>> {
        self.entered_at
    }

    // -- Phase-specific data --

    pub fn data(&self) -> &PhaseData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut PhaseData {
        &mut self.data
    }

    pub fn packet(&self) -> Option<&PacketData> {
        match &self.data {
            PhaseData::Packet(data) => Some(data),
            _ => None,
        }
    }

    pub fn packet_mut(&mut self) -> Option<&mut PacketData> {
        match &mut self.data {
            PhaseData::Packet(data) => Some(data),
            _ => None,
        }
    }

    pub fn plugin(&self) -> Option<&PluginData> {
        match &self.data {
            PhaseData::Plugin(data) => Some(data),
            _ => None,
        }
    }

    pub fn plugin_mut(&mut self) -> Option<&mut PluginData> {
        match &mut self.data {
            PhaseData::Plugin(data) => Some(data),
            _ => None,
        }
    }

    pub fn explosion(&self) -> Option<&ExplosionData> {
        match &self.data {
            PhaseData::Explosion(data) => Some(data),
            _ => None,
        }
    }

    pub fn explosion_mut(&mut self) -> Option<&mut ExplosionData> {
        match &mut self.data {
            PhaseData::Explosion(data) => Some(data),
            _ => None,
        }
    }

    pub fn command(&self) -> Option<&CommandData> {
        match &self.data {
            PhaseData::Command(data) => Some(data),
            _ => None,
        }
    }

    pub fn command_mut(&mut self) -> Option<&mut CommandData> {
        match &mut self.data {
            PhaseData::Command(data) => Some(data),
            _ => None,
        }
    }

    pub fn tick(&self) -> Option<&TickData> {
        match &self.data {
            PhaseData::Tick(data) => Some(data),
            _ => None,
        }
    }

    pub fn tick_mut(&mut self) -> Option<&mut TickData> {
        match &mut self.data {
            PhaseData::Tick(data) => Some(data),
            _ => None,
        }
    }

    pub fn listener(&self) -> Option<&ListenerData> {
        match &self.data {
            PhaseData::Listener(data) => Some(data),
            _ => None,
        }
    }

    pub fn listener_mut(&mut self) -> Option<&mut ListenerData> {
        match &mut self.data {
            PhaseData::Listener(data) => Some(data),
            _ => None,
        }
    }

    pub fn block_worker(&self) -> Option<&BlockWorkerData> {
        match &self.data {
            PhaseData::BlockWorker(data) => Some(data),
            _ => None,
        }
    }

    pub fn block_worker_mut(&mut self) -> Option<&mut BlockWorkerData> {
        match &mut self.data {
            PhaseData::BlockWorker(data) => Some(data),
            _ => None,
        }
    }

    // -- Captures --

    #[track_caller]
    fn ensure_open(&self) {
        assert!(
            !self.completed,
            "capture appended to a phase context that has already been unwound"
        );
    }

    /// Record a block transition.
    #[track_caller]
    pub fn capture_block_change(&mut self, pos: BlockPos, from: BlockState, to: BlockState) {
        self.ensure_open();
        self.captured_blocks.push(BlockChange {
            pos,
            original: from,
            proposed: to,
        });
    }

    /// Record an entity spawn, optionally attributed to the producing entity.
    #[track_caller]
    pub fn capture_entity_spawn(&mut self, descriptor: EntityDescriptor, producer: Option<EntityId>) {
        self.ensure_open();
        match producer {
            Some(entity) => self.entity_spawns_by_producer.push(entity, descriptor),
            None => self.entity_spawns.push(descriptor),
        }
    }

    /// Record an item drop with no specific producer.
    #[track_caller]
    pub fn capture_item_drop(&mut self, descriptor: EntityDescriptor) {
        self.ensure_open();
        self.item_drops.push(descriptor);
    }

    /// Record an item dropped by an entity.
    #[track_caller]
    pub fn capture_item_drop_from_entity(&mut self, entity: EntityId, descriptor: EntityDescriptor) {
        self.ensure_open();
        self.item_drops_by_entity.push(entity, descriptor);
    }

    /// Record an item dropped by a block at `pos`.
    #[track_caller]
    pub fn capture_item_drop_from_block(&mut self, pos: BlockPos, descriptor: EntityDescriptor) {
        self.ensure_open();
        self.item_drops_by_block.push(pos, descriptor);
    }

    #[track_caller]
    pub fn capture_neighbor_notification(&mut self, notification: NeighborNotification) {
        self.ensure_open();
        self.neighbor_notifications.push(notification);
    }

    /// The last proposed state captured for `pos` in this context.
    pub fn pending_state(&self, pos: BlockPos) -> Option<BlockState> {
        self.captured_blocks
            .iter()
            .rev()
            .find(|c| c.pos == pos)
            .map(|c| c.proposed)
    }

    pub fn captured_blocks(&self) -> &[BlockChange] {
        &self.captured_blocks
    }

    pub fn item_drops_by_block(&self) -> &Grouped<BlockPos, EntityDescriptor> {
        &self.item_drops_by_block
    }

    pub fn has_captures(&self) -> bool {
        self.capture_counts().total() > 0
    }

    pub fn capture_counts(&self) -> CaptureCounts {
        CaptureCounts {
            blocks: self.captured_blocks.len(),
            entity_spawns: self.entity_spawns.len() + self.entity_spawns_by_producer.len(),
            item_drops: self.item_drops.len()
                + self.item_drops_by_entity.len()
                + self.item_drops_by_block.len(),
            neighbor_notifications: self.neighbor_notifications.len(),
        }
    }

    // -- Draining --

    pub fn drain_blocks(&mut self) -> Vec<BlockChange> {
        std::mem::take(&mut self.captured_blocks)
    }

    pub fn drain_entity_spawns(&mut self) -> Vec<EntityDescriptor> {
        std::mem::take(&mut self.entity_spawns)
    }

    pub fn drain_entity_spawns_by_producer(&mut self) -> Vec<(EntityId, Vec<EntityDescriptor>)> {
        self.entity_spawns_by_producer.drain()
    }

    pub fn drain_item_drops(&mut self) -> Vec<EntityDescriptor> {
        std::mem::take(&mut self.item_drops)
    }

    pub fn drain_item_drops_by_entity(&mut self) -> Vec<(EntityId, Vec<EntityDescriptor>)> {
        self.item_drops_by_entity.drain()
    }

    pub fn drain_item_drops_by_block(&mut self) -> Vec<(BlockPos, Vec<EntityDescriptor>)> {
        self.item_drops_by_block.drain()
    }

    /// Throw away per-block item drops. Returns how many were dropped.
    pub fn discard_item_drops_by_block(&mut self) -> usize {
        let dropped = self.item_drops_by_block.len();
        self.item_drops_by_block.clear();
        dropped
    }

    pub fn drain_neighbor_notifications(&mut self) -> Vec<NeighborNotification> {
        std::mem::take(&mut self.neighbor_notifications)
    }

    /// Drop every pending capture without committing it.
    pub fn discard_captures(&mut self) {
        self.captured_blocks.clear();
        self.entity_spawns.clear();
        self.entity_spawns_by_producer.clear();
        self.item_drops.clear();
        self.item_drops_by_entity.clear();
        self.item_drops_by_block.clear();
        self.neighbor_notifications.clear();
    }

    // -- Lifecycle --

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn mark_completed(&mut self) {
        self.completed = true;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
