//! Done-queue handlers: what happens after a stage finishes a frame

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::runtime::{is_failed, stream_buffer, DuplicateJob, Runtime};
use crate::error::HalError;
use crate::frame::{BufferState, EntityState, FactoryKind, FrameType, NodeId, PipeId};
use crate::pipeline::{FrameRef, SharedQueue, StopToken};
use crate::request::{MetaTag, MetaValue, StreamBufferResult};
use crate::utils::lock;

impl Runtime {
    pub(crate) fn handler_loop(self: Arc<Self>, kind: FactoryKind, pipe: PipeId, queue: SharedQueue, stop: StopToken) {
        let timeout = self.core.config.queue_timeout();
        while !stop.is_stopped() {
            let frame = match queue.wait_and_pop(timeout) {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(HalError::TimedOut(_)) => continue,
                Err(e) => {
                    warn!(%pipe, "done queue failed: {e}");
                    break;
                }
            };
            self.on_stage_done(kind, pipe, &frame);
        }
        trace!(?kind, %pipe, "done handler exiting");
    }

    fn on_stage_done(&self, kind: FactoryKind, pipe: PipeId, frame: &FrameRef) {
        trace!(?kind, %pipe, frame_count = frame.frame_count(), "stage done");
        match (kind, pipe) {
            (FactoryKind::Preview, PipeId::Flite) => self.dispatch_bayer_copies(frame),
            (FactoryKind::Preview, PipeId::ThreeAa) => self.on_shot_done(frame),
            (_, PipeId::Mcsc | PipeId::Jpeg) => self.deliver_service_buffers(frame, pipe),
            _ => {}
        }
        if kind == FactoryKind::Preview {
            self.hold_bayer(pipe, frame);
        }
        self.forward_m2m(kind, pipe, frame);
        self.complete_entity(kind, pipe, frame);
    }

    /// 3AA finished: one sensor cycle is over.
    fn on_shot_done(&self, frame: &FrameRef) {
        self.shot_done.push(frame.frame_count());
        let timestamp = frame.timestamp_ns();
        frame.update_dynamic_metadata(|meta| {
            meta.set(MetaTag::SensorTimestamp, MetaValue::I64(timestamp as i64));
        });
        if frame.frame_type() != FrameType::Preview {
            return;
        }
        if let Some(frame_number) = frame.request_key() {
            if let Err(e) = self.core.manager.notify_shutter(frame_number, timestamp) {
                debug!(frame_number, "shutter: {e}");
            }
        }
    }

    fn dispatch_bayer_copies(&self, frame: &FrameRef) {
        let Some((frame_number, buffers)) = lock(&self.bayer_copies).remove(&frame.frame_count()) else {
            return;
        };
        let ready = !is_failed(frame)
            && frame
                .node_state(NodeId::FliteBayer)
                .is_ok_and(|s| s == BufferState::Complete);
        if ready && frame.retain_dst(NodeId::FliteBayer).is_ok() {
            self.duplicates.push(DuplicateJob {
                frame: frame.clone(),
                frame_number,
                buffers,
            });
            return;
        }
        debug!(frame_number, frame_count = frame.frame_count(), "no bayer to copy");
        for buffer in buffers {
            if let Err(e) = self.core.manager.fail_buffer(frame_number, buffer.stream_id) {
                debug!(frame_number, "{e}");
            }
        }
    }

    fn hold_bayer(&self, pipe: PipeId, frame: &FrameRef) {
        let (Some(selector), Some(hold)) = (&self.selector, self.session.plan.hold) else {
            return;
        };
        if hold.pipe != pipe || is_failed(frame) {
            return;
        }
        if !frame.node_state(hold.node).is_ok_and(|s| s == BufferState::Complete) {
            return;
        }
        if let Err(e) = selector.hold_frame(frame.clone()) {
            warn!(frame_count = frame.frame_count(), "bayer not held: {e}");
        }
    }

    /// Return the service buffers `pipe` wrote to the request.
    pub(crate) fn deliver_service_buffers(&self, frame: &FrameRef, pipe: PipeId) {
        let Some(frame_number) = frame.request_key() else {
            return;
        };
        let failed = is_failed(frame);
        for (node, buffer, state) in frame.service_buffers() {
            if node.owner() != pipe {
                continue;
            }
            let Some(buffer) = stream_buffer(&buffer) else {
                continue;
            };
            let result = if state == BufferState::Complete && !failed {
                StreamBufferResult::ok(buffer)
            } else {
                StreamBufferResult::error(buffer)
            };
            if let Err(e) = self.core.manager.deliver_buffer(frame_number, result) {
                debug!(frame_number, ?node, "delivery: {e}");
            }
        }
    }

    /// Queue M2M children whose input this stage produced. Children without
    /// input are skipped together with everything below them.
    fn forward_m2m(&self, kind: FactoryKind, pipe: PipeId, frame: &FrameRef) {
        let Ok(factory) = self.factory(kind) else {
            return;
        };
        for (child, required) in factory.topology().m2m_children(pipe) {
            let ready = !is_failed(frame)
                && required.map_or(true, |node| {
                    frame.node_state(node).is_ok_and(|s| s == BufferState::Complete)
                });
            if !ready {
                trace!(frame_count = frame.frame_count(), %child, "no input, skipping");
                self.skip_subtree(kind, child, frame);
                continue;
            }
            if let Err(e) = factory.push_frame_to_pipe(frame.clone(), child) {
                warn!(frame_count = frame.frame_count(), %child, "forward failed: {e}");
                self.skip_subtree(kind, child, frame);
            }
        }
    }

    /// Mark `root` and every stage below it as skipped and finished.
    fn skip_subtree(&self, kind: FactoryKind, root: PipeId, frame: &FrameRef) {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(pipe) = queue.pop_front() {
            if order.contains(&pipe) {
                continue;
            }
            order.push(pipe);
            for child in frame.children(pipe).unwrap_or_default() {
                queue.push_back(child.pipe);
            }
        }

        for &pipe in &order {
            if let Err(e) = frame.set_entity_state(pipe, EntityState::Skip) {
                debug!(%pipe, "{e}");
            }
            let Some(frame_number) = frame.request_key() else {
                continue;
            };
            for (node, buffer, _) in frame.service_buffers() {
                if node.owner() != pipe {
                    continue;
                }
                if let Some(buffer) = stream_buffer(&buffer) {
                    if let Err(e) = self.core.manager.deliver_buffer(frame_number, StreamBufferResult::error(buffer)) {
                        debug!(frame_number, ?node, "delivery: {e}");
                    }
                }
            }
        }
        for pipe in order {
            self.complete_entity(kind, pipe, frame);
        }
    }

    fn complete_entity(&self, kind: FactoryKind, pipe: PipeId, frame: &FrameRef) {
        match frame.set_entity_state(pipe, EntityState::Complete) {
            Ok(true) => self.on_frame_complete(kind, frame),
            Ok(false) => {}
            Err(e) => warn!(frame_count = frame.frame_count(), %pipe, "cannot complete entity: {e}"),
        }
    }

    fn on_frame_complete(&self, kind: FactoryKind, frame: &FrameRef) {
        let list = match kind {
            FactoryKind::Preview => &self.in_flight,
            FactoryKind::Reprocessing => &self.capture_in_flight,
        };
        let tracked = {
            let mut list = lock(list);
            let before = list.len();
            list.retain(|f| !Arc::ptr_eq(f, frame));
            list.len() != before
        };
        if !tracked {
            // the drain owns it now
            trace!(frame_count = frame.frame_count(), "completed frame no longer tracked");
            return;
        }

        if let Some(frame_number) = frame.request_key() {
            let owns_metadata = match kind {
                FactoryKind::Preview => true,
                FactoryKind::Reprocessing => lock(&self.capture_metadata).remove(&frame_number),
            };
            if owns_metadata {
                if let Err(e) = self.core.manager.complete_metadata(frame_number, Some(frame)) {
                    debug!(frame_number, "final metadata: {e}");
                }
            }
        }
        let returned = frame.dispose(&self.session.registry);
        trace!(frame_count = frame.frame_count(), ?kind, returned, "frame retired");
    }
}
