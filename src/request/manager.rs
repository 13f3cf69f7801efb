//! Per-request bookkeeping and ordered result emission

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::metadata::{CameraMetadata, MetadataConverter};
use super::request::{
    BufferStatus, CaptureCallbacks, CaptureRequest, CaptureResult, ErrorCode, NotifyMsg,
    StreamBuffer, StreamBufferResult,
};
use crate::error::{HalError, Result};
use crate::frame::Frame;
use crate::utils::{lock, monotonic_ns, wait_timeout};
use crate::PARTIAL_RESULT_COUNT;

struct Tracked {
    settings: CameraMetadata,
    input_buffer: Option<StreamBuffer>,
    outputs: Vec<StreamBuffer>,
    delivered: HashSet<i32>,
    shutter: Option<u64>,
    /// Buffers produced before the shutter went out.
    held: Vec<StreamBufferResult>,
    metadata_sent: bool,
}

impl Tracked {
    fn undelivered(&self) -> Vec<StreamBuffer> {
        self.outputs
            .iter()
            .filter(|b| !self.delivered.contains(&b.stream_id))
            .copied()
            .collect()
    }

    fn buffers_done(&self) -> bool {
        self.held.is_empty() && self.outputs.iter().all(|b| self.delivered.contains(&b.stream_id))
    }
}

#[derive(Default)]
struct Ledger {
    requests: BTreeMap<u32, Tracked>,
    last_settings: Option<CameraMetadata>,
    /// Bumped on every finished request; admission waits on it.
    finished: u64,
    woken: u64,
}

/// Tracks admitted requests and emits their callbacks in order: shutter,
/// partial metadata, buffers, final metadata. Emission happens under the
/// ledger lock so concurrent producers cannot interleave one request's
/// sequence.
pub struct RequestManager {
    callbacks: Arc<dyn CaptureCallbacks>,
    converter: MetadataConverter,
    ledger: Mutex<Ledger>,
    changed: Condvar,
}

impl RequestManager {
    pub fn new(callbacks: Arc<dyn CaptureCallbacks>, converter: MetadataConverter) -> Self {
        Self {
            callbacks,
            converter,
            ledger: Mutex::new(Ledger::default()),
            changed: Condvar::new(),
        }
    }

    pub fn converter(&self) -> &MetadataConverter {
        &self.converter
    }

    /// Start tracking a request and return its resolved settings.
    pub fn register(&self, request: &CaptureRequest) -> Result<CameraMetadata> {
        let mut ledger = lock(&self.ledger);
        if ledger.requests.contains_key(&request.frame_number) {
            return Err(HalError::invalid_argument(format!(
                "frame number {} is already in flight",
                request.frame_number
            )));
        }
        if request.output_buffers.is_empty() {
            return Err(HalError::invalid_argument(format!(
                "request {} has no output buffers",
                request.frame_number
            )));
        }
        let settings = match (&request.settings, &ledger.last_settings) {
            (Some(settings), _) => settings.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => {
                return Err(HalError::invalid_argument(format!(
                    "request {} repeats settings but none were sent",
                    request.frame_number
                )))
            }
        };
        ledger.last_settings = Some(settings.clone());
        ledger.requests.insert(
            request.frame_number,
            Tracked {
                settings: settings.clone(),
                input_buffer: request.input_buffer,
                outputs: request.output_buffers.clone(),
                delivered: HashSet::new(),
                shutter: None,
                held: Vec::new(),
                metadata_sent: false,
            },
        );
        metrics::gauge!("camera3_running_requests").set(ledger.requests.len() as f64);
        trace!(frame_number = request.frame_number, "request registered");
        Ok(settings)
    }

    pub fn running_count(&self) -> usize {
        lock(&self.ledger).requests.len()
    }

    pub fn is_tracked(&self, frame_number: u32) -> bool {
        lock(&self.ledger).requests.contains_key(&frame_number)
    }

    pub fn pending_frame_numbers(&self) -> Vec<u32> {
        lock(&self.ledger).requests.keys().copied().collect()
    }

    /// Forget the sticky settings so the next request must carry its own.
    pub fn reset_settings(&self) {
        lock(&self.ledger).last_settings = None;
    }

    /// Block until a request finishes, [`RequestManager::wake_waiters`] is
    /// called, or `timeout` passes. Returns `false` on timeout.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        let ledger = lock(&self.ledger);
        let seen = (ledger.finished, ledger.woken);
        let (ledger, _) = wait_timeout(&self.changed, ledger, timeout);
        (ledger.finished, ledger.woken) != seen
    }

    pub fn wake_waiters(&self) {
        lock(&self.ledger).woken += 1;
        self.changed.notify_all();
    }

    /// Shutter, then the partial result, then any buffers that were waiting
    /// for it. Later calls for the same request are ignored.
    pub fn notify_shutter(&self, frame_number: u32, timestamp_ns: u64) -> Result<()> {
        let mut ledger = lock(&self.ledger);
        let tracked = ledger
            .requests
            .get_mut(&frame_number)
            .ok_or_else(|| HalError::not_found(format!("request {frame_number} not tracked")))?;
        if tracked.shutter.is_some() {
            return Ok(());
        }
        self.emit_shutter(frame_number, tracked, timestamp_ns);
        self.finish_if_done(&mut ledger, frame_number);
        Ok(())
    }

    fn emit_shutter(&self, frame_number: u32, tracked: &mut Tracked, timestamp_ns: u64) {
        tracked.shutter = Some(timestamp_ns);
        self.callbacks.notify(NotifyMsg::Shutter {
            frame_number,
            timestamp_ns,
        });
        let partial = self.converter.partial_result(&tracked.settings, timestamp_ns);
        self.callbacks
            .process_capture_result(CaptureResult::metadata(frame_number, partial, 1));
        let held = std::mem::take(&mut tracked.held);
        if !held.is_empty() {
            self.callbacks
                .process_capture_result(CaptureResult::buffers(frame_number, held));
        }
        debug!(frame_number, timestamp_ns, "shutter sent");
    }

    /// Return one output buffer to the service. Buffers produced before the
    /// shutter are held back until it is sent.
    pub fn deliver_buffer(&self, frame_number: u32, result: StreamBufferResult) -> Result<()> {
        let mut ledger = lock(&self.ledger);
        let tracked = ledger
            .requests
            .get_mut(&frame_number)
            .ok_or_else(|| HalError::not_found(format!("request {frame_number} not tracked")))?;
        if !tracked.outputs.iter().any(|b| b.stream_id == result.stream_id) {
            return Err(HalError::not_found(format!(
                "request {frame_number} has no buffer for stream {}",
                result.stream_id
            )));
        }
        if !tracked.delivered.insert(result.stream_id) {
            return Err(HalError::invalid_operation(format!(
                "stream {} of request {frame_number} delivered twice",
                result.stream_id
            )));
        }
        if result.status == BufferStatus::Error {
            self.callbacks.notify(NotifyMsg::Error {
                frame_number,
                stream_id: Some(result.stream_id),
                code: ErrorCode::Buffer,
            });
        }
        if tracked.shutter.is_some() {
            self.callbacks
                .process_capture_result(CaptureResult::buffers(frame_number, vec![result]));
        } else {
            tracked.held.push(result);
        }
        self.finish_if_done(&mut ledger, frame_number);
        Ok(())
    }

    /// Mark one stream's buffer as lost.
    pub fn fail_buffer(&self, frame_number: u32, stream_id: i32) -> Result<()> {
        let buffer = {
            let ledger = lock(&self.ledger);
            let tracked = ledger
                .requests
                .get(&frame_number)
                .ok_or_else(|| HalError::not_found(format!("request {frame_number} not tracked")))?;
            tracked
                .outputs
                .iter()
                .find(|b| b.stream_id == stream_id)
                .copied()
                .ok_or_else(|| {
                    HalError::not_found(format!("request {frame_number} has no stream {stream_id}"))
                })?
        };
        self.deliver_buffer(frame_number, StreamBufferResult::error(buffer))
    }

    /// Send the final metadata, built from the request settings and what the
    /// frame's stages produced.
    pub fn complete_metadata(&self, frame_number: u32, frame: Option<&Frame>) -> Result<()> {
        let mut ledger = lock(&self.ledger);
        let tracked = ledger
            .requests
            .get_mut(&frame_number)
            .ok_or_else(|| HalError::not_found(format!("request {frame_number} not tracked")))?;
        if tracked.metadata_sent {
            return Ok(());
        }
        if tracked.shutter.is_none() {
            let timestamp = frame
                .map(|f| f.timestamp_ns())
                .filter(|ts| *ts != 0)
                .unwrap_or_else(monotonic_ns);
            self.emit_shutter(frame_number, tracked, timestamp);
        }
        let metadata = self.converter.final_result(&tracked.settings, frame);
        tracked.metadata_sent = true;
        self.callbacks.process_capture_result(CaptureResult::metadata(
            frame_number,
            metadata,
            PARTIAL_RESULT_COUNT,
        ));
        self.finish_if_done(&mut ledger, frame_number);
        Ok(())
    }

    /// Report a request that produced nothing: ERROR_REQUEST, then every
    /// outstanding buffer with error status.
    pub fn fail_request(&self, frame_number: u32) -> Result<()> {
        let mut ledger = lock(&self.ledger);
        self.fail_locked(&mut ledger, frame_number)
    }

    fn fail_locked(&self, ledger: &mut Ledger, frame_number: u32) -> Result<()> {
        let mut tracked = ledger
            .requests
            .remove(&frame_number)
            .ok_or_else(|| HalError::not_found(format!("request {frame_number} not tracked")))?;
        warn!(frame_number, "request failed");
        self.callbacks.notify(NotifyMsg::Error {
            frame_number,
            stream_id: None,
            code: ErrorCode::Request,
        });
        let mut buffers = std::mem::take(&mut tracked.held);
        buffers.extend(tracked.undelivered().into_iter().map(StreamBufferResult::error));
        let mut result = CaptureResult::buffers(frame_number, buffers);
        result.input_buffer = tracked.input_buffer.map(StreamBufferResult::error);
        if !result.output_buffers.is_empty() || result.input_buffer.is_some() {
            self.callbacks.process_capture_result(result);
        }
        self.finished(ledger);
        Ok(())
    }

    /// Close a request with whatever is available. Before the shutter this is
    /// [`RequestManager::fail_request`]. After it, every undelivered buffer
    /// gets ERROR_BUFFER and an error status, then the final metadata follows.
    pub fn abort_request(&self, frame_number: u32, frame: Option<&Frame>) -> Result<()> {
        let mut ledger = lock(&self.ledger);
        let tracked = ledger
            .requests
            .get_mut(&frame_number)
            .ok_or_else(|| HalError::not_found(format!("request {frame_number} not tracked")))?;
        if tracked.shutter.is_none() {
            debug!(frame_number, "request aborted before its shutter");
            return self.fail_locked(&mut ledger, frame_number);
        }

        let missing = tracked.undelivered();
        if !missing.is_empty() {
            for buffer in &missing {
                tracked.delivered.insert(buffer.stream_id);
                self.callbacks.notify(NotifyMsg::Error {
                    frame_number,
                    stream_id: Some(buffer.stream_id),
                    code: ErrorCode::Buffer,
                });
            }
            self.callbacks.process_capture_result(CaptureResult::buffers(
                frame_number,
                missing.into_iter().map(StreamBufferResult::error).collect(),
            ));
        }
        if !tracked.metadata_sent {
            let metadata = self.converter.final_result(&tracked.settings, frame);
            tracked.metadata_sent = true;
            self.callbacks.process_capture_result(CaptureResult::metadata(
                frame_number,
                metadata,
                PARTIAL_RESULT_COUNT,
            ));
        }
        debug!(frame_number, "request aborted");
        self.finish_if_done(&mut ledger, frame_number);
        Ok(())
    }

    /// Abort every request still tracked. Returns how many there were.
    pub fn fail_all_remaining(&self) -> usize {
        let pending = self.pending_frame_numbers();
        for frame_number in &pending {
            if let Err(e) = self.abort_request(*frame_number, None) {
                warn!(frame_number, "abort failed: {e}");
            }
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "aborted remaining requests");
            metrics::counter!("camera3_flushed_requests_total").increment(pending.len() as u64);
        }
        pending.len()
    }

    /// One ERROR_DEVICE notification.
    pub fn notify_device_error(&self) {
        let _ledger = lock(&self.ledger);
        self.callbacks.notify(NotifyMsg::Error {
            frame_number: 0,
            stream_id: None,
            code: ErrorCode::Device,
        });
    }

    fn finish_if_done(&self, ledger: &mut Ledger, frame_number: u32) {
        let done = ledger
            .requests
            .get(&frame_number)
            .is_some_and(|t| t.metadata_sent && t.shutter.is_some() && t.buffers_done());
        if !done {
            return;
        }
        if let Some(tracked) = ledger.requests.remove(&frame_number) {
            if let Some(input) = tracked.input_buffer {
                let mut result = CaptureResult::buffers(frame_number, Vec::new());
                result.input_buffer = Some(StreamBufferResult::ok(input));
                self.callbacks.process_capture_result(result);
            }
            trace!(frame_number, "request finished");
        }
        self.finished(ledger);
    }

    fn finished(&self, ledger: &mut Ledger) {
        ledger.finished += 1;
        metrics::gauge!("camera3_running_requests").set(ledger.requests.len() as f64);
        self.changed.notify_all();
    }
}
