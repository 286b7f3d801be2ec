//! Block behavior handlers.

use karst_core::{BlockPos, BlockTypeId, DataContainer, Face, Rotation};

/// Which flavor of tick a handler is receiving.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TickKind {
    Scheduled,
    Repeat,
    Random,
}

/// A tick requested by a handler, in game ticks from now.
#[derive(Copy, Clone, Debug)]
pub struct ScheduledTick {
    pub pos: BlockPos,
    pub kind: TickKind,
    pub delay_ticks: u64,
}

/// Side effects a handler wants the game thread to apply after it returns.
#[derive(Debug, Default)]
pub struct HandlerEffects {
    pub scheduled_ticks: Vec<ScheduledTick>,
    /// Follow-up block changes, applied through the external API.
    pub block_changes: Vec<(BlockPos, BlockTypeId)>,
}

impl HandlerEffects {
    pub fn schedule_tick(&mut self, pos: BlockPos, kind: TickKind, delay_ticks: u64) {
        self.scheduled_ticks.push(ScheduledTick {
            pos,
            kind,
            delay_ticks,
        });
    }

    pub fn set_block(&mut self, pos: BlockPos, block_type: BlockTypeId) {
        self.block_changes.push((pos, block_type));
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled_ticks.is_empty() && self.block_changes.is_empty()
    }
}

/// Everything a handler sees about the block it is acting on.
pub struct BlockContext<'a> {
    pub pos: BlockPos,
    pub block_type: BlockTypeId,
    pub previous_type: BlockTypeId,
    pub rotation: Rotation,
    pub sky_light: u8,
    pub block_light: u8,
    /// Per-block data sidecar, created on demand.
    pub data: &'a mut DataContainer,
    /// Requested follow-up effects, drained by the game thread.
    pub effects: &'a mut HandlerEffects,
}

/// Capability set for block behavior.
///
/// Every method has a no-op default, so a handler implements only what its
/// block reacts to. `on_use`/`on_hit` return whether the interaction was
/// consumed.
pub trait BlockHandler: Send + Sync {
    fn on_place(&self, _ctx: &mut BlockContext) {}
    fn on_break(&self, _ctx: &mut BlockContext) {}
    fn on_tick(&self, _ctx: &mut BlockContext, _kind: TickKind) {}
    fn on_neighbor_changed(&self, _ctx: &mut BlockContext, _face: Face) {}
    fn on_block_update(&self, _ctx: &mut BlockContext) {}
    fn on_use(&self, _ctx: &mut BlockContext, _face: Face) -> bool {
        false
    }
    fn on_hit(&self, _ctx: &mut BlockContext, _face: Face) -> bool {
        false
    }
    fn on_repaint(&self, _ctx: &mut BlockContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pulser;

    impl BlockHandler for Pulser {
        fn on_place(&self, ctx: &mut BlockContext) {
            ctx.effects.schedule_tick(ctx.pos, TickKind::Scheduled, 4);
        }
        fn on_use(&self, _ctx: &mut BlockContext, _face: Face) -> bool {
            true
        }
    }

    #[test]
    fn effects_collect_requests() {
        let mut data = DataContainer::new();
        let mut effects = HandlerEffects::default();
        let mut ctx = BlockContext {
            pos: BlockPos::new(1, 2, 3),
            block_type: BlockTypeId::from_name("karst:handler_test_pulser"),
            previous_type: BlockTypeId::AIR,
            rotation: Rotation::IDENTITY,
            sky_light: 15,
            block_light: 0,
            data: &mut data,
            effects: &mut effects,
        };
        let handler = Pulser;
        handler.on_place(&mut ctx);
        assert!(handler.on_use(&mut ctx, Face::PosY));
        assert_eq!(effects.scheduled_ticks.len(), 1);
        assert_eq!(effects.scheduled_ticks[0].delay_ticks, 4);
    }

    #[test]
    fn default_methods_are_noops() {
        struct Inert;
        impl BlockHandler for Inert {}

        let mut data = DataContainer::new();
        let mut effects = HandlerEffects::default();
        let mut ctx = BlockContext {
            pos: BlockPos::new(0, 0, 0),
            block_type: BlockTypeId::AIR,
            previous_type: BlockTypeId::AIR,
            rotation: Rotation::IDENTITY,
            sky_light: 0,
            block_light: 0,
            data: &mut data,
            effects: &mut effects,
        };
        let handler = Inert;
        handler.on_block_update(&mut ctx);
        assert!(!handler.on_hit(&mut ctx, Face::NegZ));
        assert!(effects.is_empty());
    }
}
