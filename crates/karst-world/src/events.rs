//! Block events, the producer-side coalescing outbox and the scheduler
//! handle the external block API queues into.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use karst_blocks::TickKind;
use karst_core::{BlockPos, BlockTypeId, ChunkPos, Face, Rotation};
use karst_queue::WakeSignal;

/// Everything that can happen to a block position.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    BlockPlaced,
    BlockBroken,
    BlockChanged,
    NeighborChanged,
    TickScheduled,
    TickRepeat,
    TickRandom,
    PlayerUse,
    PlayerHit,
    BlockUpdate,
    ChunkLoaded,
    ChunkUnloaded,
    RepaintRequested,
}

/// Relative urgency used when two different kinds collide in the outbox.
pub fn event_priority(kind: EventKind) -> u32 {
    match kind {
        EventKind::BlockPlaced | EventKind::BlockBroken => 100,
        EventKind::BlockChanged => 90,
        EventKind::TickScheduled | EventKind::TickRepeat => 80,
        EventKind::TickRandom => 70,
        EventKind::NeighborChanged => 60,
        EventKind::PlayerUse | EventKind::PlayerHit => 50,
        EventKind::ChunkLoaded | EventKind::ChunkUnloaded => 40,
        EventKind::BlockUpdate => 30,
        EventKind::RepaintRequested => 10,
    }
}

/// One queued block event.
#[derive(Copy, Clone, Debug)]
pub struct BlockEvent {
    pub kind: EventKind,
    pub pos: BlockPos,
    pub chunk_pos: ChunkPos,
    pub block_type: BlockTypeId,
    pub previous_type: BlockTypeId,
    /// Interaction face for use/hit events.
    pub face: Option<Face>,
    /// Primary changed face for neighbor-changed events.
    pub changed_face: Option<Face>,
    /// Accumulated changed faces (bit per [`Face::index`]).
    pub face_mask: u8,
    pub rotation: Rotation,
    pub tick_kind: Option<TickKind>,
    /// Outbox sequence stamp; earliest survives a merge.
    pub timestamp: u64,
}

impl BlockEvent {
    fn base(kind: EventKind, pos: BlockPos) -> Self {
        Self {
            kind,
            pos,
            chunk_pos: pos.chunk(),
            block_type: BlockTypeId::AIR,
            previous_type: BlockTypeId::AIR,
            face: None,
            changed_face: None,
            face_mask: 0,
            rotation: Rotation::IDENTITY,
            tick_kind: None,
            timestamp: 0,
        }
    }

    pub fn placed(pos: BlockPos, new: BlockTypeId, old: BlockTypeId, rotation: Rotation) -> Self {
        let mut e = Self::base(EventKind::BlockPlaced, pos);
        e.block_type = new;
        e.previous_type = old;
        e.rotation = rotation;
        e
    }

    pub fn broken(pos: BlockPos, old: BlockTypeId) -> Self {
        let mut e = Self::base(EventKind::BlockBroken, pos);
        e.previous_type = old;
        e
    }

    pub fn changed(pos: BlockPos, old: BlockTypeId, new: BlockTypeId) -> Self {
        let mut e = Self::base(EventKind::BlockChanged, pos);
        e.previous_type = old;
        e.block_type = new;
        e
    }

    pub fn neighbor_changed(pos: BlockPos, changed_face: Face) -> Self {
        let mut e = Self::base(EventKind::NeighborChanged, pos);
        e.changed_face = Some(changed_face);
        e.face_mask = changed_face.mask_bit();
        e
    }

    pub fn tick(pos: BlockPos, kind: TickKind) -> Self {
        let event_kind = match kind {
            TickKind::Scheduled => EventKind::TickScheduled,
            TickKind::Repeat => EventKind::TickRepeat,
            TickKind::Random => EventKind::TickRandom,
        };
        let mut e = Self::base(event_kind, pos);
        e.tick_kind = Some(kind);
        e
    }

    pub fn player_use(pos: BlockPos, face: Face) -> Self {
        let mut e = Self::base(EventKind::PlayerUse, pos);
        e.face = Some(face);
        e
    }

    pub fn player_hit(pos: BlockPos, face: Face) -> Self {
        let mut e = Self::base(EventKind::PlayerHit, pos);
        e.face = Some(face);
        e
    }

    pub fn block_update(pos: BlockPos) -> Self {
        Self::base(EventKind::BlockUpdate, pos)
    }

    pub fn chunk_loaded(pos: BlockPos) -> Self {
        Self::base(EventKind::ChunkLoaded, pos)
    }

    pub fn chunk_unloaded(pos: BlockPos) -> Self {
        Self::base(EventKind::ChunkUnloaded, pos)
    }

    pub fn repaint_requested(pos: BlockPos) -> Self {
        Self::base(EventKind::RepaintRequested, pos)
    }
}

/// A bulk placement entry for the external API.
#[derive(Copy, Clone, Debug)]
pub struct BlockChange {
    pub pos: BlockPos,
    pub block_type: BlockTypeId,
    pub rotation: Rotation,
}

/// Producer-side coalescing map, keyed by position.
///
/// Two events at the same position merge: same kinds combine their payloads
/// (face masks OR together, block changes keep the earliest previous type
/// and the latest new type), different kinds keep the higher-priority one.
/// The earliest timestamp always survives so drain order is stable.
#[derive(Default)]
pub struct EventOutbox {
    pending: HashMap<u64, BlockEvent>,
    order: Vec<u64>,
}

impl EventOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: BlockEvent) {
        let key = event.pos.pack();
        match self.pending.get_mut(&key) {
            Some(existing) => *existing = merge_events(*existing, event),
            None => {
                self.order.push(key);
                self.pending.insert(key, event);
            }
        }
    }

    /// Move everything into `inbox` in first-push order.
    pub fn swap_to(&mut self, inbox: &mut Vec<BlockEvent>) {
        inbox.reserve(self.pending.len());
        for key in self.order.drain(..) {
            if let Some(event) = self.pending.remove(&key) {
                inbox.push(event);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn merge_events(existing: BlockEvent, incoming: BlockEvent) -> BlockEvent {
    if existing.kind == incoming.kind {
        let mut merged = incoming;
        match existing.kind {
            EventKind::NeighborChanged => {
                // Accumulate faces; the most recent primary face wins.
                merged.face_mask = existing.face_mask | incoming.face_mask;
            }
            EventKind::BlockPlaced | EventKind::BlockBroken | EventKind::BlockChanged => {
                // Earliest origin state, latest target state.
                merged.previous_type = existing.previous_type;
            }
            _ => {}
        }
        merged.timestamp = existing.timestamp.min(incoming.timestamp);
        return merged;
    }
    // Different kinds: the higher-priority event survives, but the
    // earliest timestamp is always kept for ordering.
    let mut merged = if event_priority(incoming.kind) >= event_priority(existing.kind) {
        incoming
    } else {
        existing
    };
    merged.timestamp = existing.timestamp.min(incoming.timestamp);
    merged
}

/// Consumer handle the world's external API feeds.
///
/// The game thread owns the matching inbox: it waits on the wake signal and
/// drains the outbox once per loop iteration.
pub struct UpdateScheduler {
    outbox: Mutex<EventOutbox>,
    signal: Arc<WakeSignal>,
    sequence: AtomicU64,
}

impl UpdateScheduler {
    pub fn new(signal: Arc<WakeSignal>) -> Self {
        Self {
            outbox: Mutex::new(EventOutbox::new()),
            signal,
            sequence: AtomicU64::new(1),
        }
    }

    /// Stamp and enqueue an event, waking the game thread.
    pub fn enqueue(&self, mut event: BlockEvent) {
        event.timestamp = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.outbox
            .lock()
            .expect("outbox lock poisoned")
            .push(event);
        self.signal.signal();
    }

    /// Transfer all pending events into `inbox`.
    pub fn drain_to(&self, inbox: &mut Vec<BlockEvent>) {
        self.outbox
            .lock()
            .expect("outbox lock poisoned")
            .swap_to(inbox);
    }

    pub fn pending(&self) -> usize {
        self.outbox.lock().expect("outbox lock poisoned").len()
    }

    pub fn signal(&self) -> &Arc<WakeSignal> {
        &self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_kind_block_changes_coalesce() {
        let mut outbox = EventOutbox::new();
        let pos = BlockPos::new(1, 2, 3);
        let t1 = BlockTypeId::from_name("karst:evt_t1");
        let t2 = BlockTypeId::from_name("karst:evt_t2");
        let mut first = BlockEvent::placed(pos, t1, BlockTypeId::AIR, Rotation::IDENTITY);
        first.timestamp = 1;
        let mut second = BlockEvent::placed(pos, t2, t1, Rotation::IDENTITY);
        second.timestamp = 2;
        outbox.push(first);
        outbox.push(second);

        let mut inbox = Vec::new();
        outbox.swap_to(&mut inbox);
        assert_eq!(inbox.len(), 1);
        let merged = inbox[0];
        assert_eq!(merged.kind, EventKind::BlockPlaced);
        assert_eq!(merged.block_type, t2);
        assert_eq!(merged.previous_type, BlockTypeId::AIR);
        assert_eq!(merged.timestamp, 1);
    }

    #[test]
    fn neighbor_face_masks_accumulate() {
        let mut outbox = EventOutbox::new();
        let pos = BlockPos::new(0, 0, 0);
        outbox.push(BlockEvent::neighbor_changed(pos, Face::PosX));
        outbox.push(BlockEvent::neighbor_changed(pos, Face::NegY));
        let mut inbox = Vec::new();
        outbox.swap_to(&mut inbox);
        assert_eq!(inbox.len(), 1);
        assert_eq!(
            inbox[0].face_mask,
            Face::PosX.mask_bit() | Face::NegY.mask_bit()
        );
        assert_eq!(inbox[0].changed_face, Some(Face::NegY));
    }

    #[test]
    fn higher_priority_kind_replaces() {
        let mut outbox = EventOutbox::new();
        let pos = BlockPos::new(4, 5, 6);
        outbox.push(BlockEvent::repaint_requested(pos));
        outbox.push(BlockEvent::broken(pos, BlockTypeId::from_name("karst:evt_t3")));
        // Lower priority incoming does not displace the break.
        outbox.push(BlockEvent::block_update(pos));
        let mut inbox = Vec::new();
        outbox.swap_to(&mut inbox);
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, EventKind::BlockBroken);
    }

    #[test]
    fn drain_preserves_first_push_order() {
        let mut outbox = EventOutbox::new();
        let a = BlockPos::new(0, 0, 0);
        let b = BlockPos::new(1, 0, 0);
        outbox.push(BlockEvent::block_update(a));
        outbox.push(BlockEvent::block_update(b));
        outbox.push(BlockEvent::block_update(a));
        let mut inbox = Vec::new();
        outbox.swap_to(&mut inbox);
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].pos, a);
        assert_eq!(inbox[1].pos, b);
        assert!(outbox.is_empty());
    }

    #[test]
    fn scheduler_stamps_and_signals() {
        let signal = Arc::new(WakeSignal::new());
        let scheduler = UpdateScheduler::new(signal.clone());
        scheduler.enqueue(BlockEvent::block_update(BlockPos::new(0, 1, 0)));
        assert!(signal.wait());
        let mut inbox = Vec::new();
        scheduler.drain_to(&mut inbox);
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].timestamp > 0);
    }
}
