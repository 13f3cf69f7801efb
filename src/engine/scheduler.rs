//! Frame creation thread: one decision per sensor cycle

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::runtime::{CaptureJob, CaptureSource, PendingRequest, Runtime};
use crate::buffer::Buffer;
use crate::error::{HalError, Result};
use crate::frame::{BufferState, FactoryKind, FrameType, NodeId, ShotSnapshot};
use crate::pipeline::{FrameRef, StopToken};
use crate::utils::lock;

/// What one sensor cycle produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDecision {
    pub need_internal: bool,
    pub need_request: bool,
}

/// `control_interval` is how many cycles ago the waiting request's sensor
/// controls were latched. Controls need `delay` cycles to reach the sensor,
/// so a request dispatched earlier would be paired with the wrong exposure.
pub fn decide(control_interval: u32, delay: u32, flagged: bool) -> FrameDecision {
    if control_interval < delay {
        FrameDecision {
            need_internal: true,
            need_request: false,
        }
    } else if flagged {
        FrameDecision {
            need_internal: true,
            need_request: true,
        }
    } else {
        FrameDecision {
            need_internal: false,
            need_request: true,
        }
    }
}

impl Runtime {
    pub(crate) fn main_loop(self: Arc<Self>, stop: StopToken) {
        let config = &self.core.config;
        for _ in 0..config.pipeline.prepare_frame_count {
            if let Err(e) = self.launch_internal(true) {
                warn!("initial frame not created: {e}");
                break;
            }
        }

        let tick = Duration::from_millis(1000 / u64::from(config.sensor.min_fps.max(1)));
        let period = Duration::from_nanos(1_000_000_000 / u64::from(config.sensor.max_fps.max(1)));
        let mut last = Instant::now();
        debug!(?tick, ?period, "frame creation running");

        while !stop.is_stopped() {
            match self.shot_done.wait_and_pop(tick) {
                Ok(Some(frame_count)) => trace!(frame_count, "shot done"),
                Ok(None) => continue,
                Err(HalError::TimedOut(_)) => {
                    warn!(?tick, "no shot done from 3AA, creating frame without sync");
                }
                Err(e) => {
                    warn!("shot done queue failed: {e}");
                    break;
                }
            }
            if stop.is_stopped() {
                break;
            }
            self.run_cycle();

            let elapsed = last.elapsed();
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
            last = Instant::now();
        }
        debug!("frame creation stopped");
    }

    fn run_cycle(&self) {
        if let Some(request) = lock(&self.pending).pop_front() {
            lock(&self.waiting).push_back(request);
        }

        let decision = {
            let waiting = lock(&self.waiting);
            waiting.front().map(|request| self.evaluate(request))
        };
        let Some(decision) = decision else {
            if let Err(e) = self.launch_internal(false) {
                warn!("internal frame not created: {e}");
            }
            return;
        };

        if decision.need_internal && !decision.need_request {
            if let Err(e) = self.launch_internal(false) {
                warn!("internal frame not created: {e}");
            }
            return;
        }
        let Some(request) = lock(&self.waiting).pop_front() else {
            return;
        };
        if decision.need_internal {
            self.dispatch_capture_only(request);
        } else {
            self.dispatch_request(request);
        }
    }

    /// Latch the request's sensor controls if they changed and run the
    /// decision table against them.
    fn evaluate(&self, request: &PendingRequest) -> FrameDecision {
        let count = self.internal_count.load(Ordering::Acquire);
        let key = request.sensor_key();
        {
            let mut latched = lock(&self.latched);
            if *latched != Some(key) {
                *latched = Some(key);
                self.sensor_controlled.store(count, Ordering::Release);
                self.current_shot.store(self.request_shot(count, &request.settings));
                debug!(frame_number = request.frame_number, frame_count = count, "sensor controls latched");
            }
        }
        let interval = count.saturating_sub(self.sensor_controlled.load(Ordering::Acquire));
        decide(
            interval,
            self.core.config.sensor.sensor_control_delay,
            request.needs_internal_frame(),
        )
    }

    /// Internal frame on the preview factory. Unforced frames are skipped
    /// while the pipeline already holds its maximum.
    fn launch_internal(&self, forced: bool) -> Result<Option<u32>> {
        if !forced && lock(&self.in_flight).len() >= self.core.config.pipeline.max_in_flight_frames {
            trace!("in-flight limit reached, no internal frame");
            return Ok(None);
        }
        let frame = self.create_preview_frame(None)?;
        let count = frame.frame_count();
        self.launch_frame(frame, None)?;
        Ok(Some(count))
    }

    fn dispatch_request(&self, request: PendingRequest) {
        let frame_number = request.frame_number;
        let frame = match self.create_preview_frame(Some(&request)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(frame_number, "request frame not created: {e}");
                if let Err(e) = self.core.manager.abort_request(frame_number, None) {
                    debug!(frame_number, "abort: {e}");
                }
                return;
            }
        };
        let frame_count = frame.frame_count();

        let copies = request.bayer_copies();
        if !copies.is_empty() {
            lock(&self.bayer_copies).insert(frame_count, (frame_number, copies));
        }
        debug!(frame_number, frame_count, "request frame created");
        if let Err(e) = self.launch_frame(frame, Some(frame_number)) {
            warn!(frame_number, frame_count, "request frame not started: {e}");
            return;
        }
        if let Some(jpeg) = request.jpeg() {
            let source = match request.input {
                Some(input) => CaptureSource::Input(input),
                None => CaptureSource::Bayer,
            };
            self.capture_jobs.push(CaptureJob {
                frame_number,
                target: frame_count,
                jpeg,
                capture_only: false,
                source,
                settings: request.settings,
            });
        }
    }

    /// Requests with nothing for the preview pipeline: an internal frame keeps
    /// the sensor cycle and the capture frame carries every result.
    fn dispatch_capture_only(&self, request: PendingRequest) {
        let frame_number = request.frame_number;
        let target = match self.launch_internal(true) {
            Ok(Some(count)) => count,
            Ok(None) => self.internal_count.load(Ordering::Acquire),
            Err(e) => {
                warn!(frame_number, "internal frame for capture not created: {e}");
                self.internal_count.load(Ordering::Acquire)
            }
        };
        let Some(jpeg) = request.jpeg() else {
            warn!(frame_number, "request has no output this pipeline can serve");
            if let Err(e) = self.core.manager.fail_request(frame_number) {
                debug!(frame_number, "fail: {e}");
            }
            return;
        };
        let source = match request.input {
            Some(input) => CaptureSource::Input(input),
            None => CaptureSource::Bayer,
        };
        lock(&self.capture_metadata).insert(frame_number);
        debug!(frame_number, target, "capture-only request");
        self.capture_jobs.push(CaptureJob {
            frame_number,
            target,
            jpeg,
            capture_only: true,
            source,
            settings: request.settings,
        });
    }

    /// Build a preview-factory frame with every buffer it needs attached.
    /// Outputs whose buffer cannot be had are dropped from this frame only.
    pub(crate) fn create_preview_frame(&self, request: Option<&PendingRequest>) -> Result<FrameRef> {
        let factory = &self.session.preview;
        let plan = &self.session.plan;

        factory.clear_requests();
        for node in plan.always_request().iter() {
            factory.set_request(node, true)?;
        }
        if let Some(request) = request {
            for (node, _) in request.preview_outputs() {
                factory.set_request(node, true)?;
            }
            if !request.bayer_copies().is_empty() {
                factory.set_request(NodeId::FliteBayer, true)?;
            }
            if plan.use_vra && request.wants_faces() {
                factory.set_request(NodeId::McscDs, true)?;
            }
        }

        let count = self.internal_count.fetch_add(1, Ordering::AcqRel);
        let (frame_type, key, shot): (FrameType, Option<u32>, Arc<ShotSnapshot>) = match request {
            Some(request) => (
                FrameType::Preview,
                Some(request.frame_number),
                self.request_shot(count, &request.settings),
            ),
            None => (FrameType::Internal, None, self.internal_shot(count)),
        };
        let frame = factory.create_new_frame(count, frame_type, key, shot)?;

        for node in frame.requested_nodes().iter() {
            let buffer = if node.is_service_backed() {
                request
                    .and_then(|r| r.output_for(node))
                    .map(|b| Buffer::service(b.stream_id, b.handle, b.acquire_fence))
                    .ok_or_else(|| HalError::not_found(format!("no service buffer for {node:?}")))
            } else {
                self.session
                    .registry
                    .check_buffer_available(node, &self.core.config.buffers)
            };
            let attached = buffer.and_then(|buffer| {
                frame
                    .set_dst_buffer(node.owner(), buffer.clone(), node.dst_index())
                    .inspect_err(|_| {
                        if !buffer.is_service() {
                            if let Err(e) = self.session.registry.put(&buffer) {
                                warn!(?node, "buffer return failed: {e}");
                            }
                        }
                    })
            });
            if let Err(e) = attached {
                let service = request.and_then(|r| Some((r.frame_number, r.output_for(node)?.stream_id)));
                self.downgrade(&frame, node, service, &e);
            }
        }
        Ok(frame)
    }

    /// Drop one output from one frame; the frame goes on without it. A
    /// service output is reported lost right away.
    pub(crate) fn downgrade(&self, frame: &FrameRef, node: NodeId, service: Option<(u32, i32)>, cause: &HalError) {
        warn!(
            frame_count = frame.frame_count(),
            ?node,
            "output dropped for this frame: {cause}"
        );
        metrics::counter!("camera3_downgraded_outputs_total").increment(1);
        if let Err(e) = frame.set_dst_buffer_state(node.owner(), node.dst_index(), BufferState::NoRequest) {
            debug!(frame_count = frame.frame_count(), ?node, "{e}");
        }
        if let Some((frame_number, stream_id)) = service {
            if let Err(e) = self.core.manager.fail_buffer(frame_number, stream_id) {
                debug!(frame_number, stream_id, "{e}");
            }
        }
    }

    /// Track a frame and queue it on the preview head. A frame that cannot
    /// start is released and its request closed.
    fn launch_frame(&self, frame: FrameRef, frame_number: Option<u32>) -> Result<()> {
        let factory = self.factory(FactoryKind::Preview)?;
        lock(&self.in_flight).push(frame.clone());
        let head = factory.topology().head();
        if let Err(e) = factory.push_frame_to_pipe(frame.clone(), head) {
            lock(&self.in_flight).retain(|f| !Arc::ptr_eq(f, &frame));
            lock(&self.bayer_copies).remove(&frame.frame_count());
            frame.dispose(&self.session.registry);
            if let Some(frame_number) = frame_number {
                if let Err(e) = self.core.manager.abort_request(frame_number, Some(&frame)) {
                    debug!(frame_number, "abort: {e}");
                }
            }
            return Err(e);
        }
        Ok(())
    }
}
