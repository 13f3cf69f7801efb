use crate::frame::{NodeId, PipeId, PipeSet};

/// Where a buffer currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPosition {
    InDriver,
    InHal,
    InService,
}

/// Allocator flavour behind a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerType {
    Ion,
    Service,
}

/// Structural lookup key of a buffer pool: the set of stages sharing it and the
/// allocator type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub pipes: PipeSet,
    pub manager: ManagerType,
}

impl BufferTag {
    pub fn new(pipes: &[PipeId], manager: ManagerType) -> Self {
        Self {
            pipes: PipeSet::of(pipes),
            manager,
        }
    }

    /// Internal pool backing a DMA output node.
    pub fn for_node(node: NodeId) -> Self {
        let pipes: &[PipeId] = match node {
            NodeId::FliteBayer => &[PipeId::Flite, PipeId::ThreeAaReprocessing],
            NodeId::ThreeAaOutput => &[PipeId::ThreeAa, PipeId::Isp, PipeId::ThreeAaReprocessing],
            NodeId::IspOutput => &[PipeId::Isp, PipeId::Mcsc],
            NodeId::McscDs => &[PipeId::Mcsc, PipeId::Vra],
            NodeId::ReprocessingYuv => &[PipeId::McscReprocessing, PipeId::Jpeg],
            NodeId::ReprocessingThumbnail => &[PipeId::Jpeg],
            // service-backed nodes
            NodeId::McscPreview | NodeId::McscVideo | NodeId::McscCallback => &[PipeId::Mcsc],
            NodeId::JpegMain => &[PipeId::Jpeg],
        };
        let manager = if node.is_service_backed() {
            ManagerType::Service
        } else {
            ManagerType::Ion
        };
        Self::new(pipes, manager)
    }
}

impl NodeId {
    /// Nodes whose buffers always come from the camera service.
    pub fn is_service_backed(self) -> bool {
        matches!(
            self,
            NodeId::McscPreview | NodeId::McscVideo | NodeId::McscCallback | NodeId::JpegMain
        )
    }
}

/// Who gets the buffer back when the frame is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    Pool(BufferTag),
    Service { stream_id: i32, handle: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub size: usize,
    pub fd: i32,
    pub addr: u64,
}

/// Opaque buffer handle. Cloning copies the handle, not the memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub index: usize,
    pub owner: BufferOwner,
    pub planes: Vec<Plane>,
    pub acquire_fence: Option<i32>,
    pub release_fence: Option<i32>,
    pub position: BufferPosition,
}

impl Buffer {
    /// Wrap a service-provided stream buffer.
    pub fn service(stream_id: i32, handle: u64, acquire_fence: Option<i32>) -> Self {
        Self {
            index: handle as usize,
            owner: BufferOwner::Service { stream_id, handle },
            planes: Vec::new(),
            acquire_fence,
            release_fence: None,
            position: BufferPosition::InService,
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self.owner, BufferOwner::Service { .. })
    }

    pub fn stream_id(&self) -> Option<i32> {
        match self.owner {
            BufferOwner::Service { stream_id, .. } => Some(stream_id),
            BufferOwner::Pool(_) => None,
        }
    }

    pub fn tag(&self) -> Option<BufferTag> {
        match self.owner {
            BufferOwner::Pool(tag) => Some(tag),
            BufferOwner::Service { .. } => None,
        }
    }
}
