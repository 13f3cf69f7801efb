//! Dynamic bayer hold list and capture frame matching

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::buffer::{Buffer, BufferRegistry};
use crate::error::{HalError, Result};
use crate::frame::NodeId;
use crate::pipeline::FrameRef;
use crate::utils::{lock, wait_timeout};

/// Frame picked for reprocessing together with the bayer buffer it now owns.
#[derive(Debug)]
pub struct SelectedFrame {
    pub frame: FrameRef,
    pub bayer: Buffer,
}

/// Bounded FIFO of frames whose bayer buffer may still be reprocessed.
///
/// Holding a frame locks it to this selector and keeps the bayer buffer out
/// of its pool until the frame is evicted, released or selected.
pub struct FrameSelector {
    id: u8,
    name: &'static str,
    node: NodeId,
    hold_count: usize,
    registry: Arc<BufferRegistry>,
    list: Mutex<VecDeque<FrameRef>>,
    arrived: Condvar,
    released: AtomicU64,
    interrupted: AtomicBool,
}

impl FrameSelector {
    /// `id` must be non-zero and unique among live selectors.
    pub fn new(
        id: u8,
        name: &'static str,
        node: NodeId,
        hold_count: usize,
        registry: Arc<BufferRegistry>,
    ) -> Self {
        debug_assert!(id != 0);
        Self {
            id,
            name,
            node,
            hold_count: hold_count.max(1),
            registry,
            list: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            released: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn len(&self) -> usize {
        lock(&self.list).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted or released so far.
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Append a frame, evicting the oldest once the list is over capacity.
    pub fn hold_frame(&self, frame: FrameRef) -> Result<()> {
        if !frame.try_lock_selector(self.id) {
            return Err(HalError::invalid_operation(format!(
                "frame {} is held by selector {}",
                frame.frame_count(),
                frame.selector_id()
            )));
        }
        if let Err(e) = frame.retain_dst(self.node) {
            frame.unlock_selector(self.id);
            return Err(e);
        }

        let evicted: Vec<FrameRef> = {
            let mut list = lock(&self.list);
            list.push_back(frame);
            let excess = list.len().saturating_sub(self.hold_count);
            list.drain(..excess).collect()
        };
        self.arrived.notify_all();
        for old in evicted {
            trace!(selector = self.name, frame_count = old.frame_count(), "evicted");
            self.release_one(&old);
        }
        Ok(())
    }

    /// Newest held frame whose count is at least `target`.
    ///
    /// Older frames met on the way are released. Waits up to `timeout` for a
    /// match, then fails with `NotFound`.
    pub fn select_capture_frame(&self, target: u32, timeout: Duration) -> Result<SelectedFrame> {
        let deadline = Instant::now() + timeout;
        let mut list = lock(&self.list);
        loop {
            let mut stale = Vec::new();
            while list.front().is_some_and(|f| f.frame_count() < target) {
                if let Some(old) = list.pop_front() {
                    stale.push(old);
                }
            }
            let picked = list.pop_back();
            if !stale.is_empty() || picked.is_some() {
                drop(list);
                for old in &stale {
                    self.release_one(old);
                }
                if let Some(frame) = picked {
                    return self.take(frame);
                }
                list = lock(&self.list);
                continue;
            }

            let now = Instant::now();
            if self.interrupted.load(Ordering::Acquire) {
                return Err(HalError::not_found(format!("{}: selection interrupted", self.name)));
            }
            if now >= deadline {
                debug!(selector = self.name, target, "no capture frame arrived");
                return Err(HalError::not_found(format!(
                    "{}: no frame >= {target} within {timeout:?}",
                    self.name
                )));
            }
            let (guard, _) = wait_timeout(&self.arrived, list, deadline - now);
            list = guard;
        }
    }

    fn take(&self, frame: FrameRef) -> Result<SelectedFrame> {
        frame.unlock_selector(self.id);
        match frame.transfer_dst(self.node) {
            Ok(bayer) => {
                debug!(selector = self.name, frame_count = frame.frame_count(), "capture frame selected");
                Ok(SelectedFrame { frame, bayer })
            }
            Err(e) => {
                if let Err(e) = frame.unretain_dst(self.node, &self.registry) {
                    warn!(selector = self.name, "unretain after failed transfer: {e}");
                }
                Err(e)
            }
        }
    }

    fn release_one(&self, frame: &FrameRef) {
        if !frame.unlock_selector(self.id) {
            warn!(selector = self.name, frame_count = frame.frame_count(), "frame was not locked here");
        }
        if let Err(e) = frame.unretain_dst(self.node, &self.registry) {
            warn!(selector = self.name, frame_count = frame.frame_count(), "release failed: {e}");
        }
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Fail current and future waits in [`FrameSelector::select_capture_frame`]
    /// once nothing matches.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let _list = lock(&self.list);
        self.arrived.notify_all();
    }

    /// Release every held frame. Safe to call repeatedly.
    pub fn release(&self) -> usize {
        let held: Vec<FrameRef> = lock(&self.list).drain(..).collect();
        self.arrived.notify_all();
        for frame in &held {
            self.release_one(frame);
        }
        if !held.is_empty() {
            debug!(selector = self.name, released = held.len(), "selector released");
        }
        held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, BufferTag};
    use crate::frame::{BufferState, FactoryKind, FrameType, PipeId, ShotSnapshot};
    use crate::pipeline::{software_pipes, FrameFactory, PipelineMode, Topology};
    use std::thread;

    struct Rig {
        registry: Arc<BufferRegistry>,
        pool: Arc<BufferPool>,
        factory: FrameFactory,
    }

    fn rig(buffers: usize) -> Rig {
        let registry = Arc::new(BufferRegistry::new());
        let pool = registry
            .register(BufferPool::new(
                "bayer",
                BufferTag::for_node(NodeId::FliteBayer),
                buffers,
                vec![64],
            ))
            .unwrap();
        pool.allocate().unwrap();
        let factory = FrameFactory::new(
            FactoryKind::Preview,
            Topology::build(PipelineMode::PreviewOtf, false).unwrap(),
            0,
            software_pipes(Duration::ZERO, Duration::ZERO),
            Duration::from_millis(10),
        );
        factory.create().unwrap();
        factory.set_request(NodeId::FliteBayer, true).unwrap();
        Rig {
            registry,
            pool,
            factory,
        }
    }

    impl Rig {
        /// Frame carrying a fresh bayer buffer.
        fn frame(&self, count: u32) -> FrameRef {
            let frame = self
                .factory
                .create_new_frame(count, FrameType::Internal, None, Arc::new(ShotSnapshot::default()))
                .unwrap();
            frame
                .set_dst_buffer(PipeId::Flite, self.pool.get_buffer().unwrap(), 0)
                .unwrap();
            frame
        }

        fn selector(&self, id: u8, hold: usize) -> FrameSelector {
            FrameSelector::new(id, "test", NodeId::FliteBayer, hold, self.registry.clone())
        }
    }

    #[test]
    fn eviction_bound_and_single_release() {
        let rig = rig(8);
        let selector = rig.selector(1, 2);
        let frames: Vec<FrameRef> = (1..=5).map(|c| rig.frame(c)).collect();
        for frame in &frames {
            selector.hold_frame(frame.clone()).unwrap();
            frame.dispose(&rig.registry);
            assert!(selector.len() <= 2);
        }
        // three oldest went back, two still held
        assert_eq!(selector.released_count(), 3);
        assert_eq!(rig.pool.available(), 8 - 2);
        for frame in &frames[..3] {
            assert_eq!(frame.selector_id(), 0);
            // a second release of the same buffer would be rejected by the pool
            assert!(frame.unretain_dst(NodeId::FliteBayer, &rig.registry).is_err());
        }
        assert_eq!(selector.release(), 2);
        assert_eq!(selector.release(), 0);
        assert_eq!(rig.pool.available(), 8);
    }

    #[test]
    fn frame_lives_in_one_selector() {
        let rig = rig(2);
        let pure = rig.selector(1, 2);
        let dirty = rig.selector(2, 2);
        let frame = rig.frame(1);
        pure.hold_frame(frame.clone()).unwrap();
        assert!(matches!(
            dirty.hold_frame(frame.clone()),
            Err(HalError::InvalidOperation(_))
        ));
        assert_eq!(dirty.len(), 0);
        pure.release();
        dirty.hold_frame(frame).unwrap();
    }

    #[test]
    fn select_releases_older_and_transfers_newest() {
        let rig = rig(6);
        let selector = rig.selector(1, 4);
        for count in 1..=4 {
            let frame = rig.frame(count);
            selector.hold_frame(frame.clone()).unwrap();
            frame.dispose(&rig.registry);
        }
        let selected = selector.select_capture_frame(3, Duration::from_millis(10)).unwrap();
        assert_eq!(selected.frame.frame_count(), 4);
        // frames 1 and 2 released, frame 3 still held, frame 4 handed over
        assert_eq!(selector.len(), 1);
        assert_eq!(rig.pool.available(), 6 - 2);
        rig.registry.put(&selected.bayer).unwrap();
        selector.release();
        assert_eq!(rig.pool.available(), 6);
    }

    #[test]
    fn select_times_out_with_not_found() {
        let rig = rig(2);
        let selector = rig.selector(1, 2);
        let started = Instant::now();
        let err = selector
            .select_capture_frame(10, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, HalError::NotFound(_)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn interrupt_cuts_wait_short() {
        let rig = rig(2);
        let selector = Arc::new(rig.selector(1, 2));
        let waiter = {
            let selector = selector.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let result = selector.select_capture_frame(1, Duration::from_secs(5));
                (result.map(|s| s.frame.frame_count()), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        selector.interrupt();
        let (result, waited) = waiter.join().unwrap();
        assert!(matches!(result, Err(HalError::NotFound(_))));
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn select_waits_for_arrival() {
        let rig = Arc::new(rig(2));
        let selector = Arc::new(rig.selector(1, 2));
        let producer = {
            let rig = rig.clone();
            let selector = selector.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                selector.hold_frame(rig.frame(7)).unwrap();
            })
        };
        let selected = selector.select_capture_frame(7, Duration::from_secs(2)).unwrap();
        producer.join().unwrap();
        assert_eq!(selected.frame.frame_count(), 7);
        assert_eq!(selected.frame.node_state(NodeId::FliteBayer).unwrap(), BufferState::Ready);
    }
}
