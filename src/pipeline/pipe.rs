//! Pipeline stage interface and the per-stage runner loop

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::{debug, error, trace, warn};

use super::queue::FrameQueue;
use super::worker::StopToken;
use crate::buffer::BufferRegistry;
use crate::error::{HalError, Result};
use crate::frame::{BufferState, EntityState, Frame, FrameState, LinkKind, PipeId};
use crate::request::metadata::{MetaTag, MetaValue};
use crate::utils::{lock, monotonic_ns};

pub type FrameRef = Arc<Frame>;
pub type SharedQueue = Arc<FrameQueue<FrameRef>>;

/// One hardware stage. `process` runs with every ready buffer of the stage's
/// entity already queued to the driver.
pub trait Pipe: Send {
    fn pipe_id(&self) -> PipeId;

    fn process(&mut self, frame: &Frame) -> Result<()>;
}

/// Creates the pipe object for a stage.
pub type PipeBuilder = Arc<dyn Fn(PipeId) -> Box<dyn Pipe> + Send + Sync>;

/// Stage stand-in with a fixed service time.
pub struct SoftwarePipe {
    id: PipeId,
    latency: Duration,
    processed: u64,
}

impl SoftwarePipe {
    pub fn new(id: PipeId, latency: Duration) -> Self {
        Self {
            id,
            latency,
            processed: 0,
        }
    }
}

impl Pipe for SoftwarePipe {
    fn pipe_id(&self) -> PipeId {
        self.id
    }

    fn process(&mut self, frame: &Frame) -> Result<()> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        self.processed += 1;
        match self.id {
            PipeId::Flite => frame.set_timestamp_ns(monotonic_ns()),
            PipeId::Vra => frame.update_dynamic_metadata(|meta| {
                meta.set(MetaTag::StatisticsFaceCount, MetaValue::I32((self.processed % 3) as i32));
            }),
            PipeId::Jpeg => {
                let crop = frame.crop();
                let size = i64::from(crop.width) * i64::from(crop.height) / 8;
                frame.update_dynamic_metadata(|meta| {
                    meta.set(MetaTag::JpegSize, MetaValue::I64(size.max(1)));
                });
            }
            _ => {}
        }
        Ok(())
    }
}

/// Builder producing [`SoftwarePipe`]s with one latency for every stage and a
/// separate one for JPEG.
pub fn software_pipes(latency: Duration, jpeg_latency: Duration) -> PipeBuilder {
    Arc::new(move |id| {
        let latency = if id == PipeId::Jpeg { jpeg_latency } else { latency };
        Box::new(SoftwarePipe::new(id, latency)) as Box<dyn Pipe>
    })
}

/// First fatal error reported by any stage of a factory.
#[derive(Default)]
pub struct FatalSlot(Mutex<Option<(PipeId, HalError)>>);

impl FatalSlot {
    pub fn report(&self, pipe: PipeId, err: HalError) {
        let mut slot = lock(&self.0);
        if slot.is_none() {
            *slot = Some((pipe, err));
        }
    }

    pub fn take(&self) -> Option<(PipeId, HalError)> {
        lock(&self.0).take()
    }

    pub fn is_set(&self) -> bool {
        lock(&self.0).is_some()
    }
}

/// Liveness counters read by the monitor.
#[derive(Debug, Default)]
pub struct PipeActivity {
    processed: AtomicU64,
    last_progress_ns: AtomicU64,
}

impl PipeActivity {
    fn touch(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.last_progress_ns.store(monotonic_ns(), Ordering::Release);
    }

    pub fn mark_started(&self) {
        self.last_progress_ns.store(monotonic_ns(), Ordering::Release);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn idle_ns(&self) -> u64 {
        monotonic_ns().saturating_sub(self.last_progress_ns.load(Ordering::Acquire))
    }
}

/// Everything a stage thread touches.
pub(crate) struct PipeRunner {
    pub pipe: Arc<Mutex<Box<dyn Pipe>>>,
    pub id: PipeId,
    pub input: SharedQueue,
    /// Input queues of the factory's stages, for OTF hand-off.
    pub inputs: Arc<HashMap<PipeId, SharedQueue>>,
    pub output: Arc<ArcSwapOption<FrameQueue<FrameRef>>>,
    pub registry: Arc<ArcSwapOption<BufferRegistry>>,
    pub fatal: Arc<FatalSlot>,
    pub activity: Arc<PipeActivity>,
    pub timeout: Duration,
}

impl PipeRunner {
    pub fn run(self, stop: StopToken) {
        debug!(pipe = %self.id, "stage thread running");
        while !stop.is_stopped() {
            let frame = match self.input.wait_and_pop(self.timeout) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(HalError::TimedOut(_)) => {
                    trace!(pipe = %self.id, "input idle");
                    continue;
                }
                Err(e) => {
                    error!(pipe = %self.id, "input queue failed: {e}");
                    break;
                }
            };
            if stop.is_stopped() {
                // leave the frame to the drain
                self.input.push(frame);
                break;
            }
            self.handle(&frame);
        }
        debug!(pipe = %self.id, "stage thread exiting");
    }

    fn handle(&self, frame: &FrameRef) {
        let registry = self.registry.load_full();
        if let Err(e) = frame.set_entity_state(self.id, EntityState::Processing) {
            warn!(pipe = %self.id, frame_count = frame.frame_count(), "cannot start entity: {e}");
        }

        let queued = self.queue_buffers(frame, registry.as_deref());
        let result = lock(&self.pipe).process(frame);
        self.dequeue_buffers(frame, registry.as_deref(), &queued, result.is_ok());
        self.activity.touch();

        if let Err(e) = frame.set_entity_state(self.id, EntityState::FrameDone) {
            warn!(pipe = %self.id, frame_count = frame.frame_count(), "cannot finish entity: {e}");
        }
        match result {
            Ok(()) => {}
            Err(HalError::Fatal(msg)) => {
                error!(pipe = %self.id, frame_count = frame.frame_count(), "fatal stage error: {msg}");
                frame.set_state(FrameState::Invalid);
                self.fatal.report(self.id, HalError::Fatal(msg));
            }
            Err(e) => {
                warn!(pipe = %self.id, frame_count = frame.frame_count(), "stage error, skipping frame: {e}");
                frame.set_state(FrameState::Skipped);
            }
        }

        if let Ok(children) = frame.children(self.id) {
            for child in children.iter().filter(|c| c.kind == LinkKind::Otf) {
                match self.inputs.get(&child.pipe) {
                    Some(queue) => queue.push(frame.clone()),
                    None => warn!(pipe = %self.id, child = %child.pipe, "no OTF input queue"),
                }
            }
        }

        match self.output.load_full() {
            Some(out) => out.push(frame.clone()),
            None => warn!(pipe = %self.id, frame_count = frame.frame_count(), "no output queue"),
        }
    }

    /// Queue every ready buffer to the driver. Returns (is_dst, index) of each.
    fn queue_buffers(&self, frame: &Frame, registry: Option<&BufferRegistry>) -> Vec<(bool, usize)> {
        let mut queued = Vec::new();
        for dst in [false, true] {
            let slots = if dst {
                frame.dst_slots(self.id)
            } else {
                frame.src_slots(self.id)
            };
            for slot in slots.unwrap_or_default() {
                if slot.state != BufferState::Ready {
                    continue;
                }
                let Some(buffer) = slot.buffer else { continue };
                if let Some(registry) = registry {
                    if let Err(e) = registry.mark_in_driver(&buffer) {
                        error!(pipe = %self.id, frame_count = frame.frame_count(), "buffer already in flight: {e}");
                        if let Err(e) = self.set_slot_state(frame, dst, slot.index, BufferState::Error) {
                            warn!(pipe = %self.id, index = slot.index, "slot not marked failed: {e}");
                        }
                        continue;
                    }
                }
                match self.set_slot_state(frame, dst, slot.index, BufferState::Processing) {
                    Ok(()) => queued.push((dst, slot.index)),
                    Err(e) => {
                        warn!(pipe = %self.id, index = slot.index, "buffer not queued: {e}");
                        if let Some(registry) = registry {
                            if let Err(e) = registry.mark_in_hal(&buffer) {
                                warn!(pipe = %self.id, index = slot.index, "buffer not returned to hal: {e}");
                            }
                        }
                    }
                }
            }
        }
        queued
    }

    fn dequeue_buffers(
        &self,
        frame: &Frame,
        registry: Option<&BufferRegistry>,
        queued: &[(bool, usize)],
        ok: bool,
    ) {
        for &(dst, index) in queued {
            let buffer = if dst {
                frame.dst_buffer(self.id, index)
            } else {
                frame.src_buffer(self.id, index)
            };
            if let (Some(registry), Ok(Some(buffer))) = (registry, buffer) {
                if let Err(e) = registry.mark_in_hal(&buffer) {
                    warn!(pipe = %self.id, "dequeue bookkeeping failed: {e}");
                }
            }
            let next = if ok { BufferState::Complete } else { BufferState::Error };
            if let Err(e) = self.set_slot_state(frame, dst, index, next) {
                warn!(pipe = %self.id, frame_count = frame.frame_count(), "{e}");
            }
        }
    }

    fn set_slot_state(&self, frame: &Frame, dst: bool, index: usize, state: BufferState) -> Result<()> {
        if dst {
            frame.set_dst_buffer_state(self.id, index, state)
        } else {
            frame.set_src_buffer_state(self.id, index, state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FactoryKind, FrameParams, FrameType, NodeId, NodeSet, ShotSnapshot};
    use crate::pipeline::{PipelineMode, Topology};

    fn frame() -> Frame {
        let topology = Topology::build(PipelineMode::PreviewOtf, true).unwrap();
        Frame::new(
            FrameParams {
                frame_count: 1,
                frame_type: FrameType::Internal,
                factory: FactoryKind::Preview,
                generation: 0,
                request_key: None,
                requested: NodeSet::EMPTY,
                shot: Arc::new(ShotSnapshot::default()),
            },
            topology.entities(),
        )
        .unwrap()
    }

    #[test]
    fn software_pipes_write_stage_results() {
        let builder = software_pipes(Duration::ZERO, Duration::ZERO);
        let f = frame();
        let before = monotonic_ns();
        thread::sleep(Duration::from_millis(1));
        let mut flite = builder(PipeId::Flite);
        assert_eq!(flite.pipe_id(), PipeId::Flite);
        flite.process(&f).unwrap();
        assert!(f.timestamp_ns() > before);
        let mut vra = builder(PipeId::Vra);
        vra.process(&f).unwrap();
        assert_eq!(f.dynamic_metadata().get_i64(MetaTag::StatisticsFaceCount), Some(1));
    }

    #[test]
    fn fatal_slot_keeps_first_report() {
        let slot = FatalSlot::default();
        slot.report(PipeId::ThreeAa, HalError::fatal("dtp"));
        slot.report(PipeId::Isp, HalError::fatal("later"));
        let (pipe, err) = slot.take().unwrap();
        assert_eq!(pipe, PipeId::ThreeAa);
        assert_eq!(err, HalError::fatal("dtp"));
        assert!(!slot.is_set());
    }

    #[test]
    fn runner_completes_buffers_and_forwards() {
        let f = Arc::new(frame());
        let mcsc_in: SharedQueue = Arc::new(FrameQueue::new("mcsc"));
        let done: SharedQueue = Arc::new(FrameQueue::new("done"));
        let mut inputs = HashMap::new();
        inputs.insert(PipeId::Mcsc, mcsc_in.clone());
        let runner = PipeRunner {
            pipe: Arc::new(Mutex::new(
                Box::new(SoftwarePipe::new(PipeId::Isp, Duration::ZERO)) as Box<dyn Pipe>
            )),
            id: PipeId::Isp,
            input: Arc::new(FrameQueue::new("isp")),
            inputs: Arc::new(inputs),
            output: Arc::new(ArcSwapOption::from(Some(done.clone()))),
            registry: Arc::new(ArcSwapOption::empty()),
            fatal: Arc::new(FatalSlot::default()),
            activity: Arc::new(PipeActivity::default()),
            timeout: Duration::from_millis(10),
        };
        runner.handle(&f);
        assert_eq!(f.entity_state(PipeId::Isp).unwrap(), EntityState::FrameDone);
        assert_eq!(mcsc_in.len(), 1);
        assert_eq!(done.len(), 1);
        assert_eq!(runner.activity.processed(), 1);
        // unrequested ISP output was never queued
        assert_eq!(
            f.node_state(NodeId::IspOutput).unwrap(),
            BufferState::NoRequest
        );
    }
}
