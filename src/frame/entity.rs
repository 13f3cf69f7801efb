//! Pipeline-stage records stored in a frame's entity arena

use serde::{Deserialize, Serialize};

use super::types::{
    BufferState, EntityBufferType, EntityState, EntityType, LinkKind, NodeId, PipeId,
};
use crate::buffer::Buffer;
use crate::error::{HalError, Result};

/// Downstream edge of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildLink {
    /// Arena index of the child entity.
    pub child: usize,
    pub kind: LinkKind,
    /// Source slot of the child fed by this edge.
    pub src_index: usize,
    /// When set, only a destination buffer written to this node feeds the child.
    pub required_parent: Option<NodeId>,
}

impl ChildLink {
    /// Whether a destination buffer written to `node` should become the
    /// child's source buffer.
    pub fn accepts(&self, node: Option<NodeId>) -> bool {
        if self.kind != LinkKind::M2m {
            return false;
        }
        match self.required_parent {
            Some(required) => node == Some(required),
            None => true,
        }
    }
}

/// Static description of one entity, produced by a topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub pipe: PipeId,
    pub entity_type: EntityType,
    pub buffer_type: EntityBufferType,
    pub src_count: usize,
    pub dst_count: usize,
    pub children: Vec<ChildLink>,
}

#[derive(Debug, Clone)]
pub(crate) struct BufferSlot {
    pub(crate) buffer: Option<Buffer>,
    pub(crate) state: BufferState,
}

impl BufferSlot {
    fn new(requested: bool) -> Self {
        Self {
            buffer: None,
            state: if requested {
                BufferState::Requested
            } else {
                BufferState::NoRequest
            },
        }
    }
}

/// Read-only copy of one buffer slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub index: usize,
    pub buffer: Option<Buffer>,
    pub state: BufferState,
}

impl BufferState {
    /// Legal per-node buffer transitions.
    pub fn can_transition(self, next: BufferState) -> bool {
        use BufferState::*;
        matches!(
            (self, next),
            (NoRequest, Requested)
                | (Requested, NoRequest)
                | (Requested, Ready)
                | (Ready, Processing)
                | (Ready, Error)
                | (Processing, Complete)
                | (Processing, Error)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pipe: PipeId,
    entity_type: EntityType,
    buffer_type: EntityBufferType,
    pub(crate) state: EntityState,
    pub(crate) src: Vec<BufferSlot>,
    pub(crate) dst: Vec<BufferSlot>,
    pub(crate) children: Vec<ChildLink>,
    /// Already counted toward the frame's completion counter.
    pub(crate) counted: bool,
}

impl Entity {
    pub(crate) fn from_spec(spec: &EntitySpec, dst_requested: impl Fn(usize) -> bool) -> Self {
        let has_input = spec.entity_type.has_input();
        Self {
            pipe: spec.pipe,
            entity_type: spec.entity_type,
            buffer_type: spec.buffer_type,
            state: EntityState::Ready,
            src: (0..spec.src_count).map(|_| BufferSlot::new(has_input)).collect(),
            dst: (0..spec.dst_count)
                .map(|i| BufferSlot::new(dst_requested(i)))
                .collect(),
            children: spec.children.clone(),
            counted: false,
        }
    }

    pub fn pipe(&self) -> PipeId {
        self.pipe
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn buffer_type(&self) -> EntityBufferType {
        self.buffer_type
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn children(&self) -> &[ChildLink] {
        &self.children
    }

    fn slots(&self, dst: bool) -> &[BufferSlot] {
        if dst {
            &self.dst
        } else {
            &self.src
        }
    }

    fn slot_mut(&mut self, dst: bool, index: usize) -> Result<&mut BufferSlot> {
        let pipe = self.pipe;
        let slots = if dst { &mut self.dst } else { &mut self.src };
        let bound = slots.len();
        slots.get_mut(index).ok_or_else(|| {
            HalError::invalid_argument(format!(
                "{pipe} {} index {index} out of bound {bound}",
                if dst { "dst" } else { "src" }
            ))
        })
    }

    pub(crate) fn slot(&self, dst: bool, index: usize) -> Result<&BufferSlot> {
        let slots = self.slots(dst);
        slots.get(index).ok_or_else(|| {
            HalError::invalid_argument(format!(
                "{} {} index {index} out of bound {}",
                self.pipe,
                if dst { "dst" } else { "src" },
                slots.len()
            ))
        })
    }

    /// Attach a buffer. Fixed entities only accept a buffer into a `Requested`
    /// slot; delivery entities may replace any handle that is not in flight.
    pub(crate) fn set_buffer(&mut self, dst: bool, index: usize, buffer: Buffer) -> Result<()> {
        self.check_buffer(dst, index)?;
        let slot = self.slot_mut(dst, index)?;
        slot.buffer = Some(buffer);
        slot.state = BufferState::Ready;
        Ok(())
    }

    /// Whether [`Entity::set_buffer`] would accept a buffer into this slot.
    pub(crate) fn check_buffer(&self, dst: bool, index: usize) -> Result<()> {
        let slot = self.slot(dst, index)?;
        let allowed = match self.buffer_type {
            EntityBufferType::Fixed => slot.state == BufferState::Requested,
            EntityBufferType::Delivery => !matches!(
                slot.state,
                BufferState::Processing | BufferState::Complete
            ),
        };
        if !allowed {
            return Err(HalError::invalid_operation(format!(
                "{} {} buffer {index} is {:?}",
                self.pipe,
                if dst { "dst" } else { "src" },
                slot.state
            )));
        }
        Ok(())
    }

    pub(crate) fn set_buffer_state(&mut self, dst: bool, index: usize, next: BufferState) -> Result<()> {
        let pipe = self.pipe;
        let slot = self.slot_mut(dst, index)?;
        if slot.state == next {
            return Ok(());
        }
        if !slot.state.can_transition(next) {
            return Err(HalError::invalid_operation(format!(
                "{pipe} buffer {index}: {:?} -> {next:?}",
                slot.state
            )));
        }
        slot.state = next;
        Ok(())
    }

    pub(crate) fn views(&self, dst: bool) -> Vec<SlotView> {
        self.slots(dst)
            .iter()
            .enumerate()
            .map(|(index, s)| SlotView {
                index,
                buffer: s.buffer.clone(),
                state: s.state,
            })
            .collect()
    }

    pub(crate) fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.src
            .iter()
            .chain(self.dst.iter())
            .filter_map(|s| s.buffer.as_ref())
    }
}
