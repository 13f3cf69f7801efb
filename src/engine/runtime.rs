//! One streaming run of a session: queues, tracking lists and threads
//!
//! A runtime is built by the first request after a configuration or a
//! flush and is consumed by the drain. Frame counters restart with it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use arc_swap::ArcSwap;
use tracing::{debug, info, instrument};

use super::bayer::{StreamPlan, PURE_SELECTOR_ID};
use super::session::{Core, Session};
use crate::buffer::{Buffer, BufferOwner};
use crate::error::{HalError, Result};
use crate::frame::{FactoryKind, Frame, FrameState, FrameSummary, NodeId, PipeId, ShotSnapshot};
use crate::pipeline::{FactoryState, FrameFactory, FrameQueue, FrameRef, SharedQueue, Worker};
use crate::request::{CameraMetadata, MetaTag, RequestTemplate, StreamBuffer, StreamKind};
use crate::selector::FrameSelector;
use crate::utils::lock;
use crate::FRAME_INTERNAL_START_COUNT;

/// Sensor controls whose change restarts the control-delay window:
/// exposure time, sensitivity, frame duration.
pub(crate) type SensorKey = [Option<i64>; 3];

/// An admitted request waiting for a sensor cycle.
#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub frame_number: u32,
    pub settings: CameraMetadata,
    pub outputs: Vec<(StreamKind, StreamBuffer)>,
    pub input: Option<StreamBuffer>,
}

impl PendingRequest {
    pub fn sensor_key(&self) -> SensorKey {
        [
            MetaTag::SensorExposureTime,
            MetaTag::SensorSensitivity,
            MetaTag::SensorFrameDuration,
        ]
        .map(|tag| self.settings.get_i64(tag))
    }

    /// Service buffers written by the live preview pipeline.
    pub fn preview_outputs(&self) -> impl Iterator<Item = (NodeId, StreamBuffer)> + '_ {
        self.outputs.iter().filter_map(|(kind, buffer)| {
            let node = kind.node()?;
            (!kind.is_capture()).then_some((node, *buffer))
        })
    }

    pub fn output_for(&self, node: NodeId) -> Option<StreamBuffer> {
        self.outputs
            .iter()
            .find(|(kind, _)| kind.node() == Some(node))
            .map(|(_, buffer)| *buffer)
    }

    pub fn jpeg(&self) -> Option<StreamBuffer> {
        self.output_for(NodeId::JpegMain)
    }

    pub fn bayer_copies(&self) -> Vec<StreamBuffer> {
        self.outputs
            .iter()
            .filter(|(kind, _)| kind.is_bayer_copy())
            .map(|(_, buffer)| *buffer)
            .collect()
    }

    /// Nothing for the preview pipeline to write: the cycle that serves this
    /// request runs an internal frame and the capture path does the rest.
    pub fn needs_internal_frame(&self) -> bool {
        self.preview_outputs().next().is_none() && self.bayer_copies().is_empty()
    }

    pub fn wants_faces(&self) -> bool {
        self.settings
            .get_i64(MetaTag::StatisticsFaceDetectMode)
            .is_some_and(|mode| mode != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureSource {
    /// Dynamic bayer from the selector.
    Bayer,
    /// Service-provided input buffer.
    Input(StreamBuffer),
}

#[derive(Debug, Clone)]
pub(crate) struct CaptureJob {
    pub frame_number: u32,
    /// Oldest preview frame count whose bayer may serve this capture.
    pub target: u32,
    pub jpeg: StreamBuffer,
    /// The reprocessing frame owns shutter and final metadata.
    pub capture_only: bool,
    pub source: CaptureSource,
    pub settings: CameraMetadata,
}

/// Bayer copies for RAW / ZSL output streams.
#[derive(Debug)]
pub(crate) struct DuplicateJob {
    pub frame: FrameRef,
    pub frame_number: u32,
    pub buffers: Vec<StreamBuffer>,
}

#[derive(Default)]
pub(crate) struct Workers {
    pub main: Option<Worker>,
    pub capture: Option<Worker>,
    pub duplicate: Option<Worker>,
    pub monitor: Option<Worker>,
    pub handlers: Vec<Worker>,
}

pub(crate) struct Runtime {
    pub core: Arc<Core>,
    pub session: Arc<Session>,
    /// Done queue of every (factory, stage).
    pub done: HashMap<(FactoryKind, PipeId), SharedQueue>,
    /// Frame counts leaving 3AA; one tick per sensor cycle.
    pub shot_done: FrameQueue<u32>,
    pub capture_jobs: FrameQueue<CaptureJob>,
    pub duplicates: FrameQueue<DuplicateJob>,
    pub monitor_tick: FrameQueue<()>,
    pub pending: Mutex<VecDeque<PendingRequest>>,
    pub waiting: Mutex<VecDeque<PendingRequest>>,
    pub in_flight: Mutex<Vec<FrameRef>>,
    pub capture_in_flight: Mutex<Vec<FrameRef>>,
    /// Frame count -> (request, bayer copy buffers)
    pub bayer_copies: Mutex<HashMap<u32, (u32, Vec<StreamBuffer>)>>,
    /// Requests whose final metadata comes from the capture frame.
    pub capture_metadata: Mutex<HashSet<u32>>,
    pub selector: Option<FrameSelector>,
    pub current_shot: ArcSwap<ShotSnapshot>,
    pub internal_count: AtomicU32,
    pub sensor_controlled: AtomicU32,
    pub latched: Mutex<Option<SensorKey>>,
    pub workers: Mutex<Workers>,
}

impl Runtime {
    /// Allocate, create and start every factory of `session`, then spawn the
    /// engine threads.
    #[instrument(skip_all, fields(generation = session.generation))]
    pub fn start(core: &Arc<Core>, session: &Arc<Session>) -> Result<Arc<Self>> {
        let factories = session.factories();
        if factories.iter().any(|f| f.state() == FactoryState::Uncreated) {
            Self::create_pipelines(core, session, &factories)?;
        }

        let mut done = HashMap::new();
        for factory in &factories {
            factory.set_buffer_manager(session.registry.clone())?;
            for pipe in factory.topology().pipes() {
                let queue: SharedQueue =
                    Arc::new(FrameQueue::new(format!("{:?}_{pipe}_done", factory.kind())));
                factory.set_output_frame_queue(queue.clone(), pipe)?;
                done.insert((factory.kind(), pipe), queue);
            }
        }
        if let Some(reprocessing) = &session.reprocessing {
            reprocessing.clear_requests();
            for node in StreamPlan::capture_request().iter() {
                reprocessing.set_request(node, true)?;
            }
        }

        let selector = session.plan.hold.map(|hold| {
            let name = if hold.selector_id == PURE_SELECTOR_ID {
                "pure_bayer"
            } else {
                "dirty_bayer"
            };
            FrameSelector::new(
                hold.selector_id,
                name,
                hold.node,
                core.config.selector.frame_hold_count,
                session.registry.clone(),
            )
        });

        let converter = core.manager.converter();
        let control = converter.default_settings(RequestTemplate::Preview);
        let shot = ShotSnapshot {
            frame_count: FRAME_INTERNAL_START_COUNT,
            crop: converter.crop_region(&control),
            control,
        };

        let runtime = Arc::new(Self {
            core: core.clone(),
            session: session.clone(),
            done,
            shot_done: FrameQueue::new("shot_done"),
            capture_jobs: FrameQueue::new("capture_jobs"),
            duplicates: FrameQueue::new("duplicates"),
            monitor_tick: FrameQueue::new("monitor_tick"),
            pending: Mutex::new(VecDeque::new()),
            waiting: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Vec::new()),
            capture_in_flight: Mutex::new(Vec::new()),
            bayer_copies: Mutex::new(HashMap::new()),
            capture_metadata: Mutex::new(HashSet::new()),
            selector,
            current_shot: ArcSwap::from_pointee(shot),
            internal_count: AtomicU32::new(FRAME_INTERNAL_START_COUNT),
            sensor_controlled: AtomicU32::new(FRAME_INTERNAL_START_COUNT),
            latched: Mutex::new(None),
            workers: Mutex::new(Workers::default()),
        });

        if let Err(e) = runtime.launch(&factories) {
            runtime.drain();
            return Err(e);
        }
        info!(
            generation = session.generation,
            factories = factories.len(),
            "streaming started"
        );
        Ok(runtime)
    }

    /// Buffer allocation and factory creation run side by side; both must
    /// finish before the first frame.
    fn create_pipelines(core: &Arc<Core>, session: &Arc<Session>, factories: &[Arc<FrameFactory>]) -> Result<()> {
        thread::scope(|scope| {
            let alloc = thread::Builder::new()
                .name("buffer_alloc".into())
                .spawn_scoped(scope, || session.allocate_buffers(&core.config))
                .map_err(|e| HalError::fatal(format!("failed to spawn buffer_alloc: {e}")))?;
            let create = thread::Builder::new()
                .name("factory_create".into())
                .spawn_scoped(scope, || -> Result<()> {
                    for factory in factories {
                        if factory.state() == FactoryState::Uncreated {
                            factory.create()?;
                            factory.init_pipes()?;
                        }
                    }
                    Ok(())
                })
                .map_err(|e| HalError::fatal(format!("failed to spawn factory_create: {e}")))?;
            let allocated = alloc
                .join()
                .map_err(|_| HalError::fatal("buffer allocation thread panicked"))?;
            let created = create
                .join()
                .map_err(|_| HalError::fatal("factory creation thread panicked"))?;
            allocated.and(created)
        })
    }

    fn launch(self: &Arc<Self>, factories: &[Arc<FrameFactory>]) -> Result<()> {
        for factory in factories {
            factory.prepare_pipes()?;
            factory.start_pipes()?;
        }

        let mut workers = lock(&self.workers);
        for (&(kind, pipe), queue) in &self.done {
            let rt = self.clone();
            let queue = queue.clone();
            workers.handlers.push(Worker::spawn(
                format!("{kind:?}_{pipe}_done"),
                move |stop| rt.handler_loop(kind, pipe, queue, stop),
            )?);
        }
        let rt = self.clone();
        workers.monitor = Some(Worker::spawn("monitor", move |stop| rt.monitor_loop(stop))?);
        if self.session.plan.bayer_copy {
            let rt = self.clone();
            workers.duplicate = Some(Worker::spawn("duplicate", move |stop| rt.duplicate_loop(stop))?);
        }
        if self.session.reprocessing.is_some() {
            let rt = self.clone();
            workers.capture = Some(Worker::spawn("capture", move |stop| rt.capture_loop(stop))?);
        }
        let rt = self.clone();
        workers.main = Some(Worker::spawn("main", move |stop| rt.main_loop(stop))?);
        debug!(handlers = workers.handlers.len(), "engine threads running");
        Ok(())
    }

    pub fn enqueue(&self, request: PendingRequest) {
        debug!(frame_number = request.frame_number, "request queued");
        lock(&self.pending).push_back(request);
    }

    pub fn internal_frame_count(&self) -> u32 {
        self.internal_count.load(Ordering::Acquire)
    }

    pub fn tracked_frames(&self) -> Vec<FrameSummary> {
        let mut frames: Vec<FrameSummary> = lock(&self.in_flight).iter().map(|f| f.summary()).collect();
        frames.extend(lock(&self.capture_in_flight).iter().map(|f| f.summary()));
        frames
    }

    pub fn factory(&self, kind: FactoryKind) -> Result<&Arc<FrameFactory>> {
        self.session
            .factory(kind)
            .ok_or_else(|| HalError::not_found(format!("no {kind:?} factory")))
    }

    /// Shot for an internal frame: the latched controls under a new count.
    pub fn internal_shot(&self, frame_count: u32) -> Arc<ShotSnapshot> {
        let current = self.current_shot.load();
        Arc::new(ShotSnapshot {
            frame_count,
            control: current.control.clone(),
            crop: current.crop,
        })
    }

    pub fn request_shot(&self, frame_count: u32, settings: &CameraMetadata) -> Arc<ShotSnapshot> {
        let converter = self.core.manager.converter();
        Arc::new(ShotSnapshot {
            frame_count,
            control: settings.clone(),
            crop: converter.crop_region(settings),
        })
    }
}

/// Service handle behind an attached buffer.
pub(crate) fn stream_buffer(buffer: &Buffer) -> Option<StreamBuffer> {
    match buffer.owner {
        BufferOwner::Service { stream_id, handle } => Some(StreamBuffer {
            stream_id,
            handle,
            acquire_fence: buffer.acquire_fence,
        }),
        BufferOwner::Pool(_) => None,
    }
}

pub(crate) fn is_failed(frame: &Frame) -> bool {
    matches!(frame.state(), FrameState::Skipped | FrameState::Invalid)
}
