use std::fmt;

use serde::{Deserialize, Serialize};

/// Hardware pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PipeId {
    Flite,
    ThreeAa,
    Isp,
    Mcsc,
    Vra,
    ThreeAaReprocessing,
    IspReprocessing,
    McscReprocessing,
    Jpeg,
}

impl PipeId {
    pub const ALL: [PipeId; 9] = [
        PipeId::Flite,
        PipeId::ThreeAa,
        PipeId::Isp,
        PipeId::Mcsc,
        PipeId::Vra,
        PipeId::ThreeAaReprocessing,
        PipeId::IspReprocessing,
        PipeId::McscReprocessing,
        PipeId::Jpeg,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PipeId::Flite => "FLITE",
            PipeId::ThreeAa => "3AA",
            PipeId::Isp => "ISP",
            PipeId::Mcsc => "MCSC",
            PipeId::Vra => "VRA",
            PipeId::ThreeAaReprocessing => "3AA_REPROCESSING",
            PipeId::IspReprocessing => "ISP_REPROCESSING",
            PipeId::McscReprocessing => "MCSC_REPROCESSING",
            PipeId::Jpeg => "JPEG",
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// DMA output node of a pipe. Each node is one destination slot of its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeId {
    FliteBayer,
    ThreeAaOutput,
    IspOutput,
    McscPreview,
    McscVideo,
    McscCallback,
    McscDs,
    ReprocessingYuv,
    ReprocessingThumbnail,
    JpegMain,
}

impl NodeId {
    pub const ALL: [NodeId; 10] = [
        NodeId::FliteBayer,
        NodeId::ThreeAaOutput,
        NodeId::IspOutput,
        NodeId::McscPreview,
        NodeId::McscVideo,
        NodeId::McscCallback,
        NodeId::McscDs,
        NodeId::ReprocessingYuv,
        NodeId::ReprocessingThumbnail,
        NodeId::JpegMain,
    ];

    pub fn owner(self) -> PipeId {
        match self {
            NodeId::FliteBayer => PipeId::Flite,
            NodeId::ThreeAaOutput => PipeId::ThreeAa,
            NodeId::IspOutput => PipeId::Isp,
            NodeId::McscPreview | NodeId::McscVideo | NodeId::McscCallback | NodeId::McscDs => {
                PipeId::Mcsc
            }
            NodeId::ReprocessingYuv | NodeId::ReprocessingThumbnail => PipeId::McscReprocessing,
            NodeId::JpegMain => PipeId::Jpeg,
        }
    }

    /// Destination slot index inside the owning entity.
    pub fn dst_index(self) -> usize {
        match self {
            NodeId::McscVideo | NodeId::ReprocessingThumbnail => 1,
            NodeId::McscCallback => 2,
            NodeId::McscDs => 3,
            _ => 0,
        }
    }

    pub fn from_slot(pipe: PipeId, index: usize) -> Option<NodeId> {
        NodeId::ALL
            .into_iter()
            .find(|node| node.owner() == pipe && node.dst_index() == index)
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Small bit set of pipes, used as the pipe half of a buffer tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PipeSet(u16);

impl PipeSet {
    pub fn of(pipes: &[PipeId]) -> Self {
        Self(pipes.iter().fold(0, |acc, p| acc | p.bit()))
    }

    pub fn contains(&self, pipe: PipeId) -> bool {
        self.0 & pipe.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = PipeId> {
        PipeId::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

/// Bit set of DMA output nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NodeSet(u32);

impl NodeSet {
    pub const EMPTY: NodeSet = NodeSet(0);

    pub fn of(nodes: &[NodeId]) -> Self {
        Self(nodes.iter().fold(0, |acc, n| acc | n.bit()))
    }

    pub fn insert(&mut self, node: NodeId) {
        self.0 |= node.bit();
    }

    pub fn remove(&mut self, node: NodeId) {
        self.0 &= !node.bit();
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.0 & node.bit() != 0
    }

    pub fn union(self, other: NodeSet) -> NodeSet {
        NodeSet(self.0 | other.0)
    }

    pub fn intersection(self, other: NodeSet) -> NodeSet {
        NodeSet(self.0 & other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = NodeId> {
        NodeId::ALL.into_iter().filter(move |n| self.contains(*n))
    }
}

/// Which factory a frame was built by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FactoryKind {
    Preview,
    Reprocessing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Preview,
    Internal,
    /// Service-provided input buffer reprocessed to JPEG
    Reprocessing,
    /// Dynamic-bayer JPEG capture
    Capture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Ready,
    Running,
    Complete,
    Skipped,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    InputOnly,
    OutputOnly,
    InputOutput,
}

impl EntityType {
    pub fn has_input(self) -> bool {
        matches!(self, EntityType::InputOnly | EntityType::InputOutput)
    }
}

/// Whether an entity's buffer handles may be replaced once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityBufferType {
    Fixed,
    Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Ready,
    Processing,
    FrameDone,
    Complete,
    Skip,
    Rework,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    NoRequest,
    Requested,
    Ready,
    Processing,
    Complete,
    Error,
}

/// How a parent stage hands its output to a child stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    /// Hardware feeds the child directly; no buffer hand-off.
    Otf,
    /// Software must move the parent's output buffer into the child's input queue.
    M2m,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_slots_round_trip() {
        for node in NodeId::ALL {
            assert_eq!(NodeId::from_slot(node.owner(), node.dst_index()), Some(node));
        }
        assert_eq!(NodeId::from_slot(PipeId::Vra, 0), None);
    }

    #[test]
    fn node_set_ops() {
        let mut set = NodeSet::of(&[NodeId::McscPreview, NodeId::FliteBayer]);
        assert!(set.contains(NodeId::McscPreview));
        set.remove(NodeId::McscPreview);
        assert!(!set.contains(NodeId::McscPreview));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![NodeId::FliteBayer]);
        let other = NodeSet::of(&[NodeId::JpegMain]);
        assert_eq!(set.union(other).iter().count(), 2);
        assert!(set.intersection(other).is_empty());
    }

    #[test]
    fn pipe_set_membership() {
        let set = PipeSet::of(&[PipeId::Flite, PipeId::ThreeAaReprocessing]);
        assert!(set.contains(PipeId::Flite));
        assert!(!set.contains(PipeId::Isp));
        assert_eq!(set.iter().count(), 2);
    }
}
