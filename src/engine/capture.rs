//! Capture path: JPEG reprocessing and bayer duplication threads

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, trace, warn};

use super::runtime::{is_failed, CaptureJob, CaptureSource, DuplicateJob, Runtime};
use crate::buffer::Buffer;
use crate::error::{HalError, Result};
use crate::frame::{FrameType, NodeId, PipeId};
use crate::pipeline::{FrameFactory, FrameRef, StopToken};
use crate::request::{MetaTag, StreamBufferResult};
use crate::utils::{lock, monotonic_ns};

/// Where a capture frame's input comes from, resolved.
struct CaptureInput {
    frame_count: u32,
    frame_type: FrameType,
    src: Buffer,
    timestamp_ns: u64,
}

impl Runtime {
    pub(crate) fn capture_loop(self: Arc<Self>, stop: StopToken) {
        let timeout = self.core.config.queue_timeout();
        while !stop.is_stopped() {
            let job = match self.capture_jobs.wait_and_pop(timeout) {
                Ok(Some(job)) => job,
                Ok(None) | Err(HalError::TimedOut(_)) => continue,
                Err(e) => {
                    warn!("capture queue failed: {e}");
                    break;
                }
            };
            if stop.is_stopped() {
                self.capture_jobs.push(job);
                break;
            }
            self.run_capture(job);
        }
        debug!("capture thread stopped");
    }

    #[instrument(skip_all, fields(frame_number = job.frame_number, target = job.target))]
    fn run_capture(&self, job: CaptureJob) {
        let Some(factory) = self.session.reprocessing.clone() else {
            warn!("no reprocessing pipeline");
            self.fail_capture(&job);
            return;
        };
        let input = match self.capture_input(&job) {
            Ok(input) => input,
            Err(e) => {
                warn!("no capture input: {e}");
                self.fail_capture(&job);
                return;
            }
        };
        if job.capture_only {
            if let Err(e) = self.core.manager.notify_shutter(job.frame_number, input.timestamp_ns) {
                debug!("shutter: {e}");
            }
        }

        let src = input.src.clone();
        let frame = match self.build_capture_frame(&factory, &job, input) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("capture frame not built: {e}");
                if !src.is_service() {
                    if let Err(e) = self.session.registry.put(&src) {
                        warn!("bayer return failed: {e}");
                    }
                }
                self.fail_capture(&job);
                return;
            }
        };

        lock(&self.capture_in_flight).push(frame.clone());
        if let Err(e) = factory.push_frame_to_pipe(frame.clone(), factory.topology().head()) {
            warn!("capture frame not started: {e}");
            lock(&self.capture_in_flight).retain(|f| !Arc::ptr_eq(f, &frame));
            frame.dispose(&self.session.registry);
            self.fail_capture(&job);
            return;
        }
        info!(frame_count = frame.frame_count(), "capture started");
    }

    fn capture_input(&self, job: &CaptureJob) -> Result<CaptureInput> {
        match job.source {
            CaptureSource::Bayer => {
                let selector = self
                    .selector
                    .as_ref()
                    .ok_or_else(|| HalError::invalid_operation("no bayer selector"))?;
                let timeout = Duration::from_millis(self.core.config.selector.select_timeout_ms);
                let selected = selector.select_capture_frame(job.target, timeout)?;
                Ok(CaptureInput {
                    frame_count: selected.frame.frame_count(),
                    frame_type: FrameType::Capture,
                    timestamp_ns: selected.frame.timestamp_ns(),
                    src: selected.bayer,
                })
            }
            CaptureSource::Input(input) => {
                let timestamp_ns = job
                    .settings
                    .get_i64(MetaTag::SensorTimestamp)
                    .map(|ts| ts as u64)
                    .unwrap_or_else(monotonic_ns);
                Ok(CaptureInput {
                    frame_count: job.target,
                    frame_type: FrameType::Reprocessing,
                    src: Buffer::service(input.stream_id, input.handle, input.acquire_fence),
                    timestamp_ns,
                })
            }
        }
    }

    /// The source buffer is attached last; on error the caller still owns it.
    fn build_capture_frame(&self, factory: &FrameFactory, job: &CaptureJob, input: CaptureInput) -> Result<FrameRef> {
        let shot = self.request_shot(input.frame_count, &job.settings);
        let frame = factory.create_new_frame(input.frame_count, input.frame_type, Some(job.frame_number), shot)?;
        frame.set_dst_buffer(
            PipeId::Jpeg,
            Buffer::service(job.jpeg.stream_id, job.jpeg.handle, job.jpeg.acquire_fence),
            NodeId::JpegMain.dst_index(),
        )?;
        frame.set_src_buffer(factory.topology().head(), input.src, 0)?;
        frame.set_timestamp_ns(input.timestamp_ns);

        for node in [NodeId::ReprocessingYuv, NodeId::ReprocessingThumbnail] {
            if !frame.has_request(node) {
                continue;
            }
            let attached = self
                .session
                .registry
                .check_buffer_available(node, &self.core.config.buffers)
                .and_then(|buffer| {
                    frame
                        .set_dst_buffer(node.owner(), buffer.clone(), node.dst_index())
                        .inspect_err(|_| {
                            if let Err(e) = self.session.registry.put(&buffer) {
                                warn!(?node, "buffer return failed: {e}");
                            }
                        })
                });
            if let Err(e) = attached {
                self.downgrade(&frame, node, None, &e);
            }
        }
        Ok(frame)
    }

    /// Close out a capture that never produced a frame.
    pub(crate) fn fail_capture(&self, job: &CaptureJob) {
        lock(&self.capture_metadata).remove(&job.frame_number);
        let manager = &self.core.manager;
        let result = if job.capture_only {
            manager.abort_request(job.frame_number, None)
        } else {
            manager.fail_buffer(job.frame_number, job.jpeg.stream_id)
        };
        if let Err(e) = result {
            debug!(frame_number = job.frame_number, "capture failure report: {e}");
        }
    }

    pub(crate) fn duplicate_loop(self: Arc<Self>, stop: StopToken) {
        let timeout = self.core.config.queue_timeout();
        while !stop.is_stopped() {
            let job = match self.duplicates.wait_and_pop(timeout) {
                Ok(Some(job)) => job,
                Ok(None) | Err(HalError::TimedOut(_)) => continue,
                Err(e) => {
                    warn!("duplicate queue failed: {e}");
                    break;
                }
            };
            if stop.is_stopped() {
                self.duplicates.push(job);
                break;
            }
            self.copy_bayer(job);
        }
        debug!("duplicate thread stopped");
    }

    /// Serve RAW / ZSL output streams from the frame's bayer buffer, then
    /// drop the hold taken for the copy.
    fn copy_bayer(&self, job: DuplicateJob) {
        let source = job.frame.node_buffer(NodeId::FliteBayer).ok().flatten();
        let ok = source.is_some() && !is_failed(&job.frame);
        trace!(
            frame_number = job.frame_number,
            frame_count = job.frame.frame_count(),
            bytes = source.as_ref().map_or(0, |b| b.planes.iter().map(|p| p.size).sum::<usize>()),
            "bayer copy"
        );
        self.finish_duplicate(job, ok);
    }

    pub(crate) fn finish_duplicate(&self, job: DuplicateJob, ok: bool) {
        for buffer in job.buffers {
            let result = if ok {
                StreamBufferResult::ok(buffer)
            } else {
                StreamBufferResult::error(buffer)
            };
            if let Err(e) = self.core.manager.deliver_buffer(job.frame_number, result) {
                debug!(frame_number = job.frame_number, "bayer copy delivery: {e}");
            }
        }
        if let Err(e) = job.frame.unretain_dst(NodeId::FliteBayer, &self.session.registry) {
            warn!(frame_count = job.frame.frame_count(), "bayer hold not dropped: {e}");
        }
    }
}
