//! Shared drain for flush and stream restarts

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, error, info, instrument};

use super::runtime::{PendingRequest, Runtime};
use crate::frame::FrameType;
use crate::pipeline::{FrameRef, Worker};
use crate::utils::lock;

impl Runtime {
    /// Bring the pipeline to an idle state. Every admitted request gets its
    /// terminal callbacks and every internal buffer goes back to its pool.
    /// A failing step is logged and the remaining steps still run.
    #[instrument(skip_all, fields(generation = self.session.generation))]
    pub(crate) fn drain(&self) {
        let started = Instant::now();
        let manager = &self.core.manager;
        let teardown = self.core.config.teardown_timeout();
        manager.wake_waiters();

        let (mut main, mut capture) = {
            let mut workers = lock(&self.workers);
            (workers.main.take(), workers.capture.take())
        };
        for worker in main.iter().chain(capture.iter()) {
            worker.request_stop();
        }
        self.shot_done.wake();
        self.capture_jobs.wake();
        if let Some(selector) = &self.selector {
            selector.interrupt();
        }
        for worker in main.iter_mut().chain(capture.iter_mut()) {
            worker.join_within(teardown);
        }

        let leftover: Vec<PendingRequest> = {
            let mut waiting = lock(&self.waiting);
            let mut pending = lock(&self.pending);
            waiting.drain(..).chain(pending.drain(..)).collect()
        };
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "closing requests that never reached a frame");
            self.session.preview.clear_requests();
        }
        for request in leftover {
            self.synthesize(request);
        }
        for job in self.capture_jobs.release() {
            self.fail_capture(&job);
        }

        for factory in self.session.factories() {
            match factory.stop_pipes() {
                Ok(queued) if !queued.is_empty() => {
                    debug!(factory = ?factory.kind(), frames = queued.len(), "frames left in stage queues")
                }
                Ok(_) => {}
                Err(e) => error!(factory = ?factory.kind(), "stop failed: {e}"),
            }
        }

        let mut rest: Vec<Worker> = {
            let mut workers = lock(&self.workers);
            let mut rest = std::mem::take(&mut workers.handlers);
            rest.extend(workers.duplicate.take());
            rest.extend(workers.monitor.take());
            rest
        };
        for worker in &rest {
            worker.request_stop();
        }
        for queue in self.done.values() {
            queue.wake();
        }
        self.duplicates.wake();
        self.monitor_tick.wake();
        for worker in &mut rest {
            worker.join_within(teardown);
        }
        for queue in self.done.values() {
            let left = queue.release();
            if !left.is_empty() {
                debug!(queue = queue.name(), frames = left.len(), "done queue released");
            }
        }
        for job in self.duplicates.release() {
            self.finish_duplicate(job, false);
        }

        let frames: Vec<FrameRef> = {
            let mut frames: Vec<FrameRef> = lock(&self.in_flight).drain(..).collect();
            frames.extend(lock(&self.capture_in_flight).drain(..));
            frames
        };
        let tracked = frames.len();
        for frame in frames {
            if let Some(frame_number) = frame.request_key() {
                if let Err(e) = manager.abort_request(frame_number, Some(&frame)) {
                    debug!(frame_number, "abort: {e}");
                }
            }
            frame.dispose(&self.session.registry);
        }
        if let Some(selector) = &self.selector {
            selector.release();
        }
        manager.fail_all_remaining();

        self.session.registry.reset_all();
        lock(&self.bayer_copies).clear();
        lock(&self.capture_metadata).clear();
        self.shot_done.release();
        self.monitor_tick.release();

        info!(
            tracked,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline drained"
        );
    }

    /// Give a request that never reached the pipeline a frame of its own so
    /// it is closed like every other one.
    fn synthesize(&self, request: PendingRequest) {
        let frame_number = request.frame_number;
        let count = self.internal_count.fetch_add(1, Ordering::AcqRel);
        let shot = self.request_shot(count, &request.settings);
        match self
            .session
            .preview
            .create_new_frame(count, FrameType::Preview, Some(frame_number), shot)
        {
            Ok(frame) => lock(&self.in_flight).push(frame),
            Err(e) => {
                debug!(frame_number, "no frame for leftover request: {e}");
                if let Err(e) = self.core.manager.abort_request(frame_number, None) {
                    debug!(frame_number, "abort: {e}");
                }
            }
        }
    }
}
