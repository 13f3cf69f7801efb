pub mod entity;
pub mod frame;
pub mod types;

pub use entity::{ChildLink, EntitySpec, SlotView};
pub use frame::{ChildInfo, Frame, FrameParams, FrameSummary, ShotSnapshot};
pub use types::{
    BufferState, EntityBufferType, EntityState, EntityType, FactoryKind, FrameState, FrameType,
    LinkKind, NodeId, NodeSet, PipeId, PipeSet,
};
