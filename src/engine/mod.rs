//! Camera3 device: configuration, request entry, flush and teardown
//!
//! The device owns at most one [`session`] (factories and pools of the
//! current stream configuration) and, while streaming, one [`runtime`]
//! (threads and tracking lists). A flush drains the runtime and keeps the
//! session; a configuration change drains and discards both.

pub mod admission;
pub mod bayer;
mod capture;
mod drain;
mod handlers;
mod monitor;
mod runtime;
pub mod scheduler;
mod session;
pub mod state;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::{debug, info, instrument, warn};

use crate::buffer::PoolSummary;
use crate::error::{HalError, Result};
use crate::frame::FrameSummary;
use crate::pipeline::{software_pipes, PipeBuilder};
use crate::request::{
    CameraMetadata, CaptureCallbacks, CaptureRequest, MetadataConverter, RequestManager, RequestTemplate,
    StreamConfig, StreamSet,
};
use crate::utils::lock;
use crate::{Config, CONFIG, FRAME_INTERNAL_START_COUNT};

use admission::{Admission, AdmissionPolicy};
use bayer::StreamPlan;
use runtime::{PendingRequest, Runtime};
use session::{Core, Session};
use state::StateCell;

pub use state::DeviceState;

/// Point-in-time view of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStats {
    pub state: DeviceState,
    /// Generation of the current stream configuration, 0 before the first.
    pub generation: u64,
    pub frames_created: u64,
    pub running_requests: usize,
    /// Next frame count the scheduler hands out.
    pub internal_frame_count: u32,
    pub tracked_frames: Vec<FrameSummary>,
    pub pools: Vec<PoolSummary>,
    pub buffers_in_driver: usize,
}

pub struct CameraDevice {
    core: Arc<Core>,
    /// Serializes configure, request entry, flush and close.
    request_lock: Mutex<()>,
    session: ArcSwapOption<Session>,
}

impl CameraDevice {
    /// Open a device whose stages are software pipes with the configured latency.
    pub fn open(config: Arc<Config>, callbacks: Arc<dyn CaptureCallbacks>) -> Self {
        let latency = Duration::from_millis(config.pipeline.stage_latency_ms);
        Self::with_pipe_builder(config, callbacks, software_pipes(latency, latency))
    }

    /// Open a device on the process-wide [`CONFIG`].
    pub fn open_default(callbacks: Arc<dyn CaptureCallbacks>) -> Self {
        Self::open(CONFIG.load_full(), callbacks)
    }

    pub fn with_pipe_builder(config: Arc<Config>, callbacks: Arc<dyn CaptureCallbacks>, builder: PipeBuilder) -> Self {
        let converter = MetadataConverter::new(config.sensor.clone());
        let core = Core {
            admission: AdmissionPolicy::new(&config.request, &config.sensor),
            manager: Arc::new(RequestManager::new(callbacks, converter)),
            builder,
            state: StateCell::default(),
            flushing: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
            config,
        };
        info!(mode = ?core.config.pipeline.mode, "camera device opened");
        Self {
            core: Arc::new(core),
            request_lock: Mutex::new(()),
            session: ArcSwapOption::empty(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.core.state.get()
    }

    /// Validate and apply a stream set. A set the current pipelines can
    /// serve is applied in place; anything else restarts them.
    #[instrument(skip_all)]
    pub fn configure_streams(&self, streams: Option<&[StreamConfig]>) -> Result<()> {
        self.core.state.ensure_usable()?;
        let streams = StreamSet::validate(streams, &self.core.config.sensor)?;
        let plan = StreamPlan::resolve(&streams, &self.core.config.pipeline)?;

        let _guard = lock(&self.request_lock);
        self.core.state.transition(DeviceState::Configuring)?;

        if let Some(current) = self.session.load_full() {
            if current.is_compatible(&streams, &plan) {
                debug!(generation = current.generation, "stream set unchanged, keeping pipelines");
                current.streams.store(Arc::new(streams));
                return Ok(());
            }
            info!(generation = current.generation, "stream set changed, restarting pipelines");
            self.core.flushing.store(true, Ordering::Release);
            self.core.manager.wake_waiters();
            self.session.store(None);
            current.teardown();
            self.core.flushing.store(false, Ordering::Release);
        }

        self.core.manager.reset_settings();
        let generation = self.core.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Session::new(&self.core, generation, streams, plan)?;
        self.session.store(Some(Arc::new(session)));
        Ok(())
    }

    /// Admit one request. Blocks while too many requests are running.
    ///
    /// Results arrive through the callbacks; a request admitted here always
    /// gets its terminal callbacks, even when a flush overtakes it.
    #[instrument(skip_all, fields(frame_number = request.frame_number))]
    pub fn process_capture_request(&self, request: &CaptureRequest) -> Result<()> {
        self.core.state.ensure_usable()?;
        let _guard = lock(&self.request_lock);
        let session = self
            .session
            .load_full()
            .ok_or_else(|| HalError::invalid_operation("streams are not configured"))?;
        let outputs = session.resolve_outputs(request)?;

        let admission = self.core.admission.wait(&self.core.manager, &self.core.flushing);
        if admission == Admission::Flushing {
            self.core.manager.register(request)?;
            debug!("flush in progress, closing request");
            return self.core.manager.abort_request(request.frame_number, None);
        }
        self.core.state.ensure_usable()?;

        let runtime = match session.runtime.load_full() {
            Some(runtime) => runtime,
            None => {
                let runtime = Runtime::start(&self.core, &session)?;
                session.runtime.store(Some(runtime.clone()));
                runtime
            }
        };
        let settings = self.core.manager.register(request)?;
        if self.core.state.get() != DeviceState::Streaming {
            if let Err(e) = self.core.state.transition(DeviceState::Streaming) {
                self.core.manager.fail_request(request.frame_number)?;
                return Err(e);
            }
        }
        runtime.enqueue(PendingRequest {
            frame_number: request.frame_number,
            settings,
            outputs,
            input: request.input_buffer,
        });
        Ok(())
    }

    /// Return every in-flight request with whatever results exist and bring
    /// the pipelines to idle. The next request restarts them.
    #[instrument(skip_all)]
    pub fn flush(&self) -> Result<()> {
        self.core.state.ensure_usable()?;
        self.core.flushing.store(true, Ordering::Release);
        self.core.manager.wake_waiters();
        let _guard = lock(&self.request_lock);

        let mut result = Ok(());
        if let Some(session) = self.session.load_full() {
            if let Some(runtime) = session.runtime.swap(None) {
                if self.core.state.get() == DeviceState::Streaming {
                    result = self.core.state.transition(DeviceState::Flushing).map(|_| ());
                }
                runtime.drain();
            }
        }
        self.core.flushing.store(false, Ordering::Release);
        result
    }

    pub fn construct_default_request_settings(&self, template: i32) -> Result<CameraMetadata> {
        let template = RequestTemplate::try_from(template)?;
        Ok(self.core.manager.converter().default_settings(template))
    }

    /// Drain and release everything. Later calls are no-ops.
    pub fn close(&self) {
        if self.core.state.get() == DeviceState::Destroyed {
            return;
        }
        self.core.flushing.store(true, Ordering::Release);
        self.core.manager.wake_waiters();
        let _guard = lock(&self.request_lock);
        if let Some(session) = self.session.swap(None) {
            session.teardown();
        }
        let remaining = self.core.manager.fail_all_remaining();
        if remaining > 0 {
            warn!(remaining, "requests closed at device close");
        }
        let prev = self.core.state.destroy();
        self.core.flushing.store(false, Ordering::Release);
        info!(from = ?prev, "camera device closed");
    }

    pub fn stats(&self) -> DeviceStats {
        let session = self.session.load_full();
        let runtime = session.as_ref().and_then(|s| s.runtime.load_full());
        DeviceStats {
            state: self.state(),
            generation: session.as_ref().map_or(0, |s| s.generation),
            frames_created: session
                .as_ref()
                .map_or(0, |s| s.factories().iter().map(|f| f.frames_created()).sum()),
            running_requests: self.core.manager.running_count(),
            internal_frame_count: runtime
                .as_ref()
                .map_or(FRAME_INTERNAL_START_COUNT, |r| r.internal_frame_count()),
            tracked_frames: runtime.as_ref().map(|r| r.tracked_frames()).unwrap_or_default(),
            pools: session.as_ref().map(|s| s.registry.summaries()).unwrap_or_default(),
            buffers_in_driver: session.as_ref().map_or(0, |s| s.registry.in_driver_total()),
        }
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        self.close();
    }
}
