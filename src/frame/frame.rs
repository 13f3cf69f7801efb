//! One unit of pipeline work: an entity arena plus per-node buffer slots

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use super::entity::{ChildLink, Entity, EntitySpec, SlotView};
use super::types::{
    BufferState, EntityState, FactoryKind, FrameState, FrameType, LinkKind, NodeId, NodeSet, PipeId,
};
use crate::buffer::{Buffer, BufferOwner, BufferRegistry, BufferTag};
use crate::error::{HalError, Result};
use crate::request::metadata::CameraMetadata;
use crate::utils::{lock, Rect};

/// Control metadata latched for one sensor cycle. Produced once per cycle
/// and shared read-only with every stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShotSnapshot {
    pub frame_count: u32,
    pub control: CameraMetadata,
    pub crop: Rect,
}

/// Identity and wiring of a frame about to be built.
#[derive(Debug, Clone)]
pub struct FrameParams {
    pub frame_count: u32,
    pub frame_type: FrameType,
    pub factory: FactoryKind,
    pub generation: u64,
    pub request_key: Option<u32>,
    /// Optional DMA outputs enabled for this frame.
    pub requested: NodeSet,
    pub shot: Arc<ShotSnapshot>,
}

/// Downstream edge as seen from outside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildInfo {
    pub pipe: PipeId,
    pub kind: LinkKind,
    pub src_index: usize,
    pub required_parent: Option<NodeId>,
}

/// Diagnostic snapshot of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSummary {
    pub frame_count: u32,
    pub generation: u64,
    pub frame_type: FrameType,
    pub factory: FactoryKind,
    pub request_key: Option<u32>,
    pub state: FrameState,
    pub complete: bool,
}

type BufferKey = (BufferTag, usize);

struct FrameInner {
    entities: Vec<Entity>,
    state: FrameState,
    num_complete: usize,
    complete: bool,
    timestamp_ns: u64,
    dynamic: CameraMetadata,
    /// Outstanding holds on internal buffers, keyed by pool slot.
    retained: HashMap<BufferKey, u32>,
    /// Internal buffers already returned or handed to another frame.
    released: HashSet<BufferKey>,
    disposed: bool,
}

pub struct Frame {
    frame_count: u32,
    frame_type: FrameType,
    factory: FactoryKind,
    generation: u64,
    request_key: Option<u32>,
    requested: NodeSet,
    num_request: usize,
    shot: Arc<ShotSnapshot>,
    inner: Mutex<FrameInner>,
    /// Id of the selector holding this frame, 0 when none.
    selector: AtomicU8,
    pushed: AtomicBool,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_count", &self.frame_count)
            .field("frame_type", &self.frame_type)
            .field("factory", &self.factory)
            .field("generation", &self.generation)
            .field("request_key", &self.request_key)
            .finish_non_exhaustive()
    }
}

fn buffer_key(buffer: &Buffer) -> Option<BufferKey> {
    match buffer.owner {
        BufferOwner::Pool(tag) => Some((tag, buffer.index)),
        BufferOwner::Service { .. } => None,
    }
}

impl Frame {
    /// Build a frame whose arena mirrors `entities`.
    pub fn new(params: FrameParams, entities: &[EntitySpec]) -> Result<Self> {
        if entities.is_empty() {
            return Err(HalError::invalid_argument("frame needs at least one entity"));
        }
        for spec in entities {
            for link in &spec.children {
                let child = entities.get(link.child).ok_or_else(|| {
                    HalError::invalid_argument(format!("{} links to missing entity {}", spec.pipe, link.child))
                })?;
                if link.kind == LinkKind::M2m && link.src_index >= child.src_count {
                    return Err(HalError::invalid_argument(format!(
                        "{} feeds src {} of {}",
                        spec.pipe, link.src_index, child.pipe
                    )));
                }
            }
        }

        let requested = params.requested;
        let arena: Vec<Entity> = entities
            .iter()
            .map(|spec| {
                Entity::from_spec(spec, |index| {
                    NodeId::from_slot(spec.pipe, index).is_some_and(|node| requested.contains(node))
                })
            })
            .collect();

        Ok(Self {
            frame_count: params.frame_count,
            frame_type: params.frame_type,
            factory: params.factory,
            generation: params.generation,
            request_key: params.request_key,
            requested,
            num_request: arena.len(),
            shot: params.shot,
            inner: Mutex::new(FrameInner {
                entities: arena,
                state: FrameState::Ready,
                num_complete: 0,
                complete: false,
                timestamp_ns: 0,
                dynamic: CameraMetadata::new(),
                retained: HashMap::new(),
                released: HashSet::new(),
                disposed: false,
            }),
            selector: AtomicU8::new(0),
            pushed: AtomicBool::new(false),
        })
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn is_internal(&self) -> bool {
        self.frame_type == FrameType::Internal
    }

    pub fn factory(&self) -> FactoryKind {
        self.factory
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Service frame number this frame produces results for.
    pub fn request_key(&self) -> Option<u32> {
        self.request_key
    }

    pub fn requested_nodes(&self) -> NodeSet {
        self.requested
    }

    pub fn has_request(&self, node: NodeId) -> bool {
        self.requested.contains(node)
    }

    pub fn shot(&self) -> &Arc<ShotSnapshot> {
        &self.shot
    }

    pub fn crop(&self) -> Rect {
        self.shot.crop
    }

    /// Pipes of the arena in traversal order.
    pub fn pipes(&self) -> Vec<PipeId> {
        lock(&self.inner).entities.iter().map(|e| e.pipe()).collect()
    }

    pub fn has_pipe(&self, pipe: PipeId) -> bool {
        lock(&self.inner).entities.iter().any(|e| e.pipe() == pipe)
    }

    /// First entity for `pipe` in traversal order.
    fn search(entities: &[Entity], pipe: PipeId) -> Result<usize> {
        entities
            .iter()
            .position(|e| e.pipe() == pipe)
            .ok_or_else(|| HalError::not_found(format!("no {pipe} entity")))
    }

    pub fn set_src_buffer(&self, pipe: PipeId, buffer: Buffer, index: usize) -> Result<()> {
        let mut inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        inner.entities[at].set_buffer(false, index, buffer)
    }

    /// Attach a destination buffer and hand it on as the source buffer of every
    /// M2M child whose required parent matches this node.
    pub fn set_dst_buffer(&self, pipe: PipeId, buffer: Buffer, index: usize) -> Result<()> {
        let mut inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        let node = NodeId::from_slot(pipe, index);
        let links: Vec<ChildLink> = inner.entities[at]
            .children()
            .iter()
            .filter(|link| link.accepts(node))
            .copied()
            .collect();

        // all slots are checked before any is written
        inner.entities[at].check_buffer(true, index)?;
        for link in &links {
            inner.entities[link.child].check_buffer(false, link.src_index)?;
        }

        inner.entities[at].set_buffer(true, index, buffer.clone())?;
        for link in links {
            trace!(
                frame_count = self.frame_count,
                parent = %pipe,
                child = %inner.entities[link.child].pipe(),
                "propagating dst buffer"
            );
            inner.entities[link.child].set_buffer(false, link.src_index, buffer.clone())?;
        }
        Ok(())
    }

    pub fn src_buffer(&self, pipe: PipeId, index: usize) -> Result<Option<Buffer>> {
        let inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        Ok(inner.entities[at].slot(false, index)?.buffer.clone())
    }

    pub fn dst_buffer(&self, pipe: PipeId, index: usize) -> Result<Option<Buffer>> {
        let inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        Ok(inner.entities[at].slot(true, index)?.buffer.clone())
    }

    pub fn node_buffer(&self, node: NodeId) -> Result<Option<Buffer>> {
        self.dst_buffer(node.owner(), node.dst_index())
    }

    pub fn src_buffer_state(&self, pipe: PipeId, index: usize) -> Result<BufferState> {
        let inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        Ok(inner.entities[at].slot(false, index)?.state)
    }

    pub fn dst_buffer_state(&self, pipe: PipeId, index: usize) -> Result<BufferState> {
        let inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        Ok(inner.entities[at].slot(true, index)?.state)
    }

    pub fn node_state(&self, node: NodeId) -> Result<BufferState> {
        self.dst_buffer_state(node.owner(), node.dst_index())
    }

    pub fn set_src_buffer_state(&self, pipe: PipeId, index: usize, state: BufferState) -> Result<()> {
        let mut inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        inner.entities[at].set_buffer_state(false, index, state)
    }

    pub fn set_dst_buffer_state(&self, pipe: PipeId, index: usize, state: BufferState) -> Result<()> {
        let mut inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        inner.entities[at].set_buffer_state(true, index, state)
    }

    pub fn src_slots(&self, pipe: PipeId) -> Result<Vec<SlotView>> {
        let inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        Ok(inner.entities[at].views(false))
    }

    pub fn dst_slots(&self, pipe: PipeId) -> Result<Vec<SlotView>> {
        let inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        Ok(inner.entities[at].views(true))
    }

    pub fn entity_state(&self, pipe: PipeId) -> Result<EntityState> {
        let inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        Ok(inner.entities[at].state())
    }

    /// Move an entity to `state`.
    ///
    /// A `Complete` entity only leaves that state through `Rework`; any other
    /// request is ignored. The first time an entity completes it bumps the
    /// frame's completion counter, and the frame completes when every entity
    /// has. Returns `true` for the one call that completed the frame.
    pub fn set_entity_state(&self, pipe: PipeId, state: EntityState) -> Result<bool> {
        let mut inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        let entity = &mut inner.entities[at];
        if entity.state == EntityState::Complete && state != EntityState::Rework {
            trace!(frame_count = self.frame_count, %pipe, ?state, "entity already complete");
            return Ok(false);
        }
        entity.state = state;
        if state != EntityState::Complete || entity.counted {
            return Ok(false);
        }
        entity.counted = true;

        inner.num_complete += 1;
        if inner.num_complete >= self.num_request && !inner.complete {
            inner.complete = true;
            if inner.state == FrameState::Ready || inner.state == FrameState::Running {
                inner.state = FrameState::Complete;
            }
            debug!(frame_count = self.frame_count, frame_type = ?self.frame_type, "frame complete");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn children(&self, pipe: PipeId) -> Result<Vec<ChildInfo>> {
        let inner = lock(&self.inner);
        let at = Self::search(&inner.entities, pipe)?;
        Ok(inner.entities[at]
            .children()
            .iter()
            .map(|link| ChildInfo {
                pipe: inner.entities[link.child].pipe(),
                kind: link.kind,
                src_index: link.src_index,
                required_parent: link.required_parent,
            })
            .collect())
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.inner).complete
    }

    pub fn num_complete(&self) -> usize {
        lock(&self.inner).num_complete
    }

    pub fn num_request(&self) -> usize {
        self.num_request
    }

    pub fn state(&self) -> FrameState {
        lock(&self.inner).state
    }

    /// Set the frame-level state. `Skipped` and `Invalid` stick once set.
    pub fn set_state(&self, state: FrameState) {
        let mut inner = lock(&self.inner);
        if matches!(inner.state, FrameState::Skipped | FrameState::Invalid)
            && !matches!(state, FrameState::Skipped | FrameState::Invalid)
        {
            return;
        }
        inner.state = state;
    }

    /// Mark the frame as handed to its first pipe.
    pub fn mark_pushed(&self) {
        self.pushed.store(true, Ordering::Release);
        self.set_state(FrameState::Running);
    }

    pub fn is_pushed(&self) -> bool {
        self.pushed.load(Ordering::Acquire)
    }

    pub fn timestamp_ns(&self) -> u64 {
        lock(&self.inner).timestamp_ns
    }

    pub fn set_timestamp_ns(&self, timestamp_ns: u64) {
        lock(&self.inner).timestamp_ns = timestamp_ns;
    }

    pub fn update_dynamic_metadata(&self, update: impl FnOnce(&mut CameraMetadata)) {
        update(&mut lock(&self.inner).dynamic);
    }

    pub fn dynamic_metadata(&self) -> CameraMetadata {
        lock(&self.inner).dynamic.clone()
    }

    /// Claim this frame for selector `id`. Fails if another selector holds it.
    pub fn try_lock_selector(&self, id: u8) -> bool {
        self.selector
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unlock_selector(&self, id: u8) -> bool {
        self.selector
            .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn selector_id(&self) -> u8 {
        self.selector.load(Ordering::Acquire)
    }

    /// Keep the internal buffer of `node` alive past [`Frame::dispose`].
    pub fn retain_dst(&self, node: NodeId) -> Result<()> {
        let mut inner = lock(&self.inner);
        let key = Self::node_key(&inner, node)?;
        if inner.released.contains(&key) {
            return Err(HalError::invalid_operation(format!(
                "{node:?} buffer of frame {} already released",
                self.frame_count
            )));
        }
        *inner.retained.entry(key).or_insert(0) += 1;
        Ok(())
    }

    /// Drop one hold on `node`. Once a disposed frame has no holds left the
    /// buffer goes back to its pool.
    pub fn unretain_dst(&self, node: NodeId, registry: &BufferRegistry) -> Result<()> {
        let mut inner = lock(&self.inner);
        let key = Self::node_key(&inner, node)?;
        let remaining = match inner.retained.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => {
                return Err(HalError::invalid_operation(format!(
                    "{node:?} of frame {} is not retained",
                    self.frame_count
                )))
            }
        };
        if remaining == 0 {
            inner.retained.remove(&key);
            if inner.disposed && inner.released.insert(key) {
                let buffer = Self::find_buffer(&inner, &key);
                drop(inner);
                if let Some(buffer) = buffer {
                    registry.put(&buffer)?;
                }
            }
        }
        Ok(())
    }

    /// Hand a retained internal buffer to a new owner. The frame gives up one
    /// hold and never returns the buffer itself.
    pub fn transfer_dst(&self, node: NodeId) -> Result<Buffer> {
        let mut inner = lock(&self.inner);
        let key = Self::node_key(&inner, node)?;
        if inner.released.contains(&key) {
            return Err(HalError::invalid_operation(format!(
                "{node:?} buffer of frame {} already released",
                self.frame_count
            )));
        }
        let buffer = Self::find_buffer(&inner, &key)
            .ok_or_else(|| HalError::not_found(format!("no {node:?} buffer")))?;
        if let Some(count) = inner.retained.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                inner.retained.remove(&key);
            }
        }
        inner.released.insert(key);
        Ok(buffer)
    }

    fn node_key(inner: &FrameInner, node: NodeId) -> Result<BufferKey> {
        let at = Self::search(&inner.entities, node.owner())?;
        let slot = inner.entities[at].slot(true, node.dst_index())?;
        slot.buffer
            .as_ref()
            .and_then(buffer_key)
            .ok_or_else(|| HalError::not_found(format!("no internal {node:?} buffer")))
    }

    fn find_buffer(inner: &FrameInner, key: &BufferKey) -> Option<Buffer> {
        inner
            .entities
            .iter()
            .flat_map(|e| e.buffers())
            .find(|b| buffer_key(b).as_ref() == Some(key))
            .cloned()
    }

    /// Return every internal buffer not retained or already released.
    /// Later calls are no-ops. Returns how many buffers went back.
    pub fn dispose(&self, registry: &BufferRegistry) -> usize {
        let to_return: Vec<Buffer> = {
            let mut inner = lock(&self.inner);
            if inner.disposed {
                return 0;
            }
            inner.disposed = true;
            let mut seen = HashSet::new();
            let candidates: Vec<(BufferKey, Buffer)> = inner
                .entities
                .iter()
                .flat_map(|e| e.buffers())
                .filter_map(|b| buffer_key(b).map(|k| (k, b.clone())))
                .filter(|(k, _)| seen.insert(*k))
                .collect();
            let mut out = Vec::new();
            for (key, buffer) in candidates {
                if inner.retained.contains_key(&key) || !inner.released.insert(key) {
                    continue;
                }
                out.push(buffer);
            }
            out
        };

        let mut returned = 0;
        for buffer in &to_return {
            match registry.put(buffer) {
                Ok(()) => returned += 1,
                Err(e) => warn!(frame_count = self.frame_count, "buffer return failed: {e}"),
            }
        }
        trace!(frame_count = self.frame_count, returned, "frame disposed");
        returned
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.inner).disposed
    }

    /// Service buffers attached to destination nodes, in node order.
    pub fn service_buffers(&self) -> Vec<(NodeId, Buffer, BufferState)> {
        let inner = lock(&self.inner);
        inner
            .entities
            .iter()
            .flat_map(|e| {
                e.views(true).into_iter().filter_map(move |view| {
                    let node = NodeId::from_slot(e.pipe(), view.index)?;
                    let buffer = view.buffer.filter(|b| b.is_service())?;
                    Some((node, buffer, view.state))
                })
            })
            .collect()
    }

    pub fn summary(&self) -> FrameSummary {
        let inner = lock(&self.inner);
        FrameSummary {
            frame_count: self.frame_count,
            generation: self.generation,
            frame_type: self.frame_type,
            factory: self.factory,
            request_key: self.request_key,
            state: inner.state,
            complete: inner.complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::pipeline::{PipelineMode, Topology};
    use crate::frame::{EntityBufferType, EntityType};
    use std::thread;

    /// 3AA -> ISP (M2M on the 3AA output) -> MCSC (M2M on the ISP output)
    fn m2m_specs() -> Vec<EntitySpec> {
        vec![
            EntitySpec {
                pipe: PipeId::ThreeAa,
                entity_type: EntityType::OutputOnly,
                buffer_type: EntityBufferType::Fixed,
                src_count: 0,
                dst_count: 1,
                children: vec![ChildLink {
                    child: 1,
                    kind: LinkKind::M2m,
                    src_index: 0,
                    required_parent: Some(NodeId::ThreeAaOutput),
                }],
            },
            EntitySpec {
                pipe: PipeId::Isp,
                entity_type: EntityType::InputOutput,
                buffer_type: EntityBufferType::Fixed,
                src_count: 1,
                dst_count: 1,
                children: vec![ChildLink {
                    child: 2,
                    kind: LinkKind::M2m,
                    src_index: 0,
                    required_parent: Some(NodeId::IspOutput),
                }],
            },
            EntitySpec {
                pipe: PipeId::Mcsc,
                entity_type: EntityType::InputOutput,
                buffer_type: EntityBufferType::Fixed,
                src_count: 1,
                dst_count: 4,
                children: Vec::new(),
            },
        ]
    }

    fn frame(count: u32) -> Frame {
        Frame::new(
            FrameParams {
                frame_count: count,
                frame_type: FrameType::Preview,
                factory: FactoryKind::Preview,
                generation: 0,
                request_key: Some(count),
                requested: NodeSet::of(&[NodeId::ThreeAaOutput, NodeId::IspOutput, NodeId::McscPreview]),
                shot: Arc::new(ShotSnapshot::default()),
            },
            &m2m_specs(),
        )
        .unwrap()
    }

    fn registry() -> BufferRegistry {
        let registry = BufferRegistry::new();
        let pool = registry
            .register(BufferPool::new(
                "3aa",
                BufferTag::for_node(NodeId::ThreeAaOutput),
                2,
                vec![64],
            ))
            .unwrap();
        pool.allocate().unwrap();
        registry
    }

    #[test]
    fn lookup_errors_are_distinguishable() {
        let f = frame(1);
        assert!(matches!(
            f.set_src_buffer(PipeId::Vra, Buffer::service(1, 1, None), 0),
            Err(HalError::NotFound(_))
        ));
        assert!(matches!(
            f.set_dst_buffer(PipeId::Mcsc, Buffer::service(1, 1, None), 7),
            Err(HalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn dst_buffer_feeds_matching_child_only() {
        let f = frame(1);
        let buf = Buffer::service(1, 10, None);
        f.set_dst_buffer(PipeId::ThreeAa, buf.clone(), 0).unwrap();
        assert_eq!(f.src_buffer(PipeId::Isp, 0).unwrap(), Some(buf));
        assert_eq!(f.src_buffer_state(PipeId::Isp, 0).unwrap(), BufferState::Ready);
        // MCSC is fed by the ISP output, not the 3AA output
        assert_eq!(f.src_buffer(PipeId::Mcsc, 0).unwrap(), None);
    }

    #[test]
    fn unrequested_node_stays_empty() {
        let f = frame(1);
        assert_eq!(f.node_state(NodeId::McscVideo).unwrap(), BufferState::NoRequest);
        assert!(f
            .set_dst_buffer(PipeId::Mcsc, Buffer::service(2, 1, None), 1)
            .is_err());
    }

    #[test]
    fn completion_counts_each_entity_once() {
        let f = frame(1);
        assert!(!f.set_entity_state(PipeId::ThreeAa, EntityState::Complete).unwrap());
        assert!(!f.set_entity_state(PipeId::ThreeAa, EntityState::Complete).unwrap());
        assert!(!f.set_entity_state(PipeId::ThreeAa, EntityState::Processing).unwrap());
        assert_eq!(f.entity_state(PipeId::ThreeAa).unwrap(), EntityState::Complete);
        assert_eq!(f.num_complete(), 1);

        // rework re-enters without recounting
        f.set_entity_state(PipeId::ThreeAa, EntityState::Rework).unwrap();
        f.set_entity_state(PipeId::ThreeAa, EntityState::Complete).unwrap();
        assert_eq!(f.num_complete(), 1);

        f.set_entity_state(PipeId::Isp, EntityState::Skip).unwrap();
        assert!(!f.set_entity_state(PipeId::Isp, EntityState::Complete).unwrap());
        assert!(!f.is_complete());
        assert!(f.set_entity_state(PipeId::Mcsc, EntityState::Complete).unwrap());
        assert!(f.is_complete());
        assert_eq!(f.state(), FrameState::Complete);
        assert_eq!(f.num_complete(), f.num_request());
    }

    #[test]
    fn concurrent_completion_fires_once() {
        for _ in 0..50 {
            let f = Arc::new(frame(1));
            let handles: Vec<_> = [PipeId::ThreeAa, PipeId::Isp, PipeId::Mcsc]
                .into_iter()
                .flat_map(|pipe| {
                    (0..2).map(move |_| pipe)
                })
                .map(|pipe| {
                    let f = f.clone();
                    thread::spawn(move || f.set_entity_state(pipe, EntityState::Complete).unwrap())
                })
                .collect();
            let fired = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|done| *done)
                .count();
            assert_eq!(fired, 1);
            assert_eq!(f.num_complete(), 3);
        }
    }

    #[test]
    fn skipped_state_survives_completion() {
        let f = frame(1);
        f.set_state(FrameState::Skipped);
        for pipe in [PipeId::ThreeAa, PipeId::Isp, PipeId::Mcsc] {
            f.set_entity_state(pipe, EntityState::Complete).unwrap();
        }
        assert!(f.is_complete());
        assert_eq!(f.state(), FrameState::Skipped);
    }

    #[test]
    fn selector_lock_is_exclusive() {
        let f = frame(1);
        assert!(f.try_lock_selector(1));
        assert!(!f.try_lock_selector(2));
        assert!(!f.unlock_selector(2));
        assert!(f.unlock_selector(1));
        assert!(f.try_lock_selector(2));
    }

    #[test]
    fn dispose_returns_shared_buffer_once() {
        let registry = registry();
        let pool = registry.for_node(NodeId::ThreeAaOutput).unwrap();
        let f = frame(1);
        let buf = pool.get_buffer().unwrap();
        // lands in the 3AA dst and the ISP src
        f.set_dst_buffer(PipeId::ThreeAa, buf, 0).unwrap();
        assert_eq!(f.dispose(&registry), 1);
        assert_eq!(f.dispose(&registry), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn retained_buffer_outlives_dispose() {
        let registry = registry();
        let pool = registry.for_node(NodeId::ThreeAaOutput).unwrap();
        let f = frame(1);
        f.set_dst_buffer(PipeId::ThreeAa, pool.get_buffer().unwrap(), 0).unwrap();
        f.retain_dst(NodeId::ThreeAaOutput).unwrap();
        f.retain_dst(NodeId::ThreeAaOutput).unwrap();
        assert_eq!(f.dispose(&registry), 0);
        f.unretain_dst(NodeId::ThreeAaOutput, &registry).unwrap();
        assert_eq!(pool.available(), 1);
        f.unretain_dst(NodeId::ThreeAaOutput, &registry).unwrap();
        assert_eq!(pool.available(), 2);
        assert!(f.unretain_dst(NodeId::ThreeAaOutput, &registry).is_err());
    }

    #[test]
    fn transferred_buffer_is_not_returned() {
        let registry = registry();
        let pool = registry.for_node(NodeId::ThreeAaOutput).unwrap();
        let f = frame(1);
        f.set_dst_buffer(PipeId::ThreeAa, pool.get_buffer().unwrap(), 0).unwrap();
        f.retain_dst(NodeId::ThreeAaOutput).unwrap();
        let moved = f.transfer_dst(NodeId::ThreeAaOutput).unwrap();
        assert_eq!(f.dispose(&registry), 0);
        assert_eq!(pool.available(), 1);
        assert!(f.transfer_dst(NodeId::ThreeAaOutput).is_err());
        registry.put(&moved).unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn service_buffers_are_listed_by_node() {
        let f = frame(3);
        f.set_dst_buffer(PipeId::Mcsc, Buffer::service(5, 77, None), 0).unwrap();
        let listed = f.service_buffers();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, NodeId::McscPreview);
        assert_eq!(listed[0].1.stream_id(), Some(5));
    }

    fn topology_frame(mode: PipelineMode, use_vra: bool) -> Result<Frame> {
        let topology = Topology::build(mode, use_vra)?;
        Frame::new(
            FrameParams {
                frame_count: 1,
                frame_type: FrameType::Internal,
                factory: FactoryKind::Preview,
                generation: 1,
                request_key: None,
                requested: topology.always_on(),
                shot: Arc::new(ShotSnapshot::default()),
            },
            topology.entities(),
        )
    }

    #[test]
    fn frame_builds_from_every_topology() {
        for mode in [
            PipelineMode::PreviewOtf,
            PipelineMode::PreviewM2m,
            PipelineMode::HighSpeed,
            PipelineMode::Reprocessing,
        ] {
            for use_vra in [false, true] {
                let f = topology_frame(mode, use_vra)
                    .unwrap_or_else(|e| panic!("{mode:?} vra={use_vra}: {e}"));
                assert_eq!(f.num_request(), Topology::build(mode, use_vra).unwrap().entities().len());
                assert!(!f.is_complete());
            }
        }
    }

    #[test]
    fn otf_child_needs_no_src_slot() {
        let f = topology_frame(PipelineMode::PreviewOtf, false).unwrap();
        assert!(f.src_slots(PipeId::ThreeAa).unwrap().is_empty());
    }

    #[test]
    fn m2m_link_past_child_src_count_is_rejected() {
        let mut specs = m2m_specs();
        specs[0].children[0].src_index = 1;
        let err = Frame::new(
            FrameParams {
                frame_count: 1,
                frame_type: FrameType::Preview,
                factory: FactoryKind::Preview,
                generation: 0,
                request_key: None,
                requested: NodeSet::EMPTY,
                shot: Arc::new(ShotSnapshot::default()),
            },
            &specs,
        )
        .unwrap_err();
        assert!(matches!(err, HalError::InvalidArgument(_)));
    }

    #[test]
    fn failed_propagation_leaves_parent_slot_untouched() {
        let f = frame(1);
        f.set_src_buffer(PipeId::Isp, Buffer::service(1, 5, None), 0).unwrap();
        let err = f
            .set_dst_buffer(PipeId::ThreeAa, Buffer::service(1, 6, None), 0)
            .unwrap_err();
        assert!(matches!(err, HalError::InvalidOperation(_)));
        assert_eq!(f.dst_buffer(PipeId::ThreeAa, 0).unwrap(), None);
        assert_eq!(f.dst_buffer_state(PipeId::ThreeAa, 0).unwrap(), BufferState::Requested);
    }
}
