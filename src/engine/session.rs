//! Shared device core and the per-configuration pipeline set

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tracing::{error, info, warn};

use super::admission::AdmissionPolicy;
use super::bayer::StreamPlan;
use super::runtime::Runtime;
use super::state::StateCell;
use crate::buffer::BufferRegistry;
use crate::error::{HalError, Result};
use crate::frame::{FactoryKind, NodeId};
use crate::pipeline::{FrameFactory, PipeBuilder, PipelineMode, Topology};
use crate::request::{CaptureRequest, RequestManager, StreamBuffer, StreamKind, StreamSet};
use crate::Config;

/// State every thread of a device shares.
pub(crate) struct Core {
    pub config: Arc<Config>,
    pub builder: PipeBuilder,
    pub manager: Arc<RequestManager>,
    pub state: StateCell,
    /// Set before a drain touches anything; admission and request entry
    /// short-circuit on it.
    pub flushing: AtomicBool,
    pub admission: AdmissionPolicy,
    pub next_generation: AtomicU64,
}

/// Factories, buffers and resolved capabilities of one stream configuration.
pub(crate) struct Session {
    pub generation: u64,
    pub streams: ArcSwap<StreamSet>,
    pub plan: StreamPlan,
    pub registry: Arc<BufferRegistry>,
    pub preview: Arc<FrameFactory>,
    pub reprocessing: Option<Arc<FrameFactory>>,
    /// Serves input-buffer reprocessing. Aliases `reprocessing`.
    pub zsl_reprocessing: Option<Arc<FrameFactory>>,
    pub runtime: ArcSwapOption<Runtime>,
}

impl Session {
    pub fn new(core: &Core, generation: u64, streams: StreamSet, plan: StreamPlan) -> Result<Self> {
        let timeout = core.config.queue_timeout();
        let teardown = core.config.teardown_timeout();
        let preview = Arc::new(FrameFactory::new(
            FactoryKind::Preview,
            Topology::build(plan.mode, plan.use_vra)?,
            generation,
            core.builder.clone(),
            timeout,
        )
        .with_teardown_timeout(teardown));
        let reprocessing = if plan.needs_reprocessing() {
            Some(Arc::new(FrameFactory::new(
                FactoryKind::Reprocessing,
                Topology::build(PipelineMode::Reprocessing, false)?,
                generation,
                core.builder.clone(),
                timeout,
            )
            .with_teardown_timeout(teardown)))
        } else {
            None
        };
        let zsl_reprocessing = if plan.zsl_input {
            reprocessing.clone()
        } else {
            None
        };
        info!(
            generation,
            mode = ?plan.mode,
            capture = plan.capture,
            zsl_input = plan.zsl_input,
            streams = streams.streams().len(),
            "stream configuration accepted"
        );
        Ok(Self {
            generation,
            streams: ArcSwap::from_pointee(streams),
            plan,
            registry: Arc::new(BufferRegistry::new()),
            preview,
            reprocessing,
            zsl_reprocessing,
            runtime: ArcSwapOption::empty(),
        })
    }

    /// Distinct factories. Aliased slots appear once.
    pub fn factories(&self) -> Vec<Arc<FrameFactory>> {
        let mut out = vec![self.preview.clone()];
        for factory in [&self.reprocessing, &self.zsl_reprocessing].into_iter().flatten() {
            if !out.iter().any(|f| Arc::ptr_eq(f, factory)) {
                out.push(factory.clone());
            }
        }
        out
    }

    pub fn factory(&self, kind: FactoryKind) -> Option<&Arc<FrameFactory>> {
        match kind {
            FactoryKind::Preview => Some(&self.preview),
            FactoryKind::Reprocessing => self.reprocessing.as_ref(),
        }
    }

    /// Same pipelines can serve `streams` without a restart.
    pub fn is_compatible(&self, streams: &StreamSet, plan: &StreamPlan) -> bool {
        self.plan == *plan && self.streams.load().signature() == streams.signature()
    }

    /// Internal nodes of every pipeline this session drives.
    pub fn internal_nodes(&self) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        for factory in self.factories() {
            for node in factory.topology().nodes() {
                if !node.is_service_backed() && !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }

    pub fn allocate_buffers(&self, config: &Config) -> Result<()> {
        let (width, height) = self.streams.load().max_size();
        let plane_size = (width as usize * height as usize * 3 / 2).max(1);
        self.registry
            .allocate_for(&self.internal_nodes(), &config.buffers, plane_size)
    }

    /// Check a request against the configured streams and tag each output
    /// with its stream kind.
    pub fn resolve_outputs(&self, request: &CaptureRequest) -> Result<Vec<(StreamKind, StreamBuffer)>> {
        let streams = self.streams.load();
        if request.output_buffers.is_empty() {
            return Err(HalError::invalid_argument(format!(
                "request {} has no output buffers",
                request.frame_number
            )));
        }
        let mut seen = HashSet::new();
        let mut outputs = Vec::with_capacity(request.output_buffers.len());
        for buffer in &request.output_buffers {
            let stream = streams.find(buffer.stream_id).ok_or_else(|| {
                HalError::invalid_argument(format!("stream {} is not configured", buffer.stream_id))
            })?;
            if stream.kind == StreamKind::ZslInput {
                return Err(HalError::invalid_argument(format!(
                    "stream {} is input only",
                    buffer.stream_id
                )));
            }
            if !seen.insert(buffer.stream_id) {
                return Err(HalError::invalid_argument(format!(
                    "stream {} appears twice in request {}",
                    buffer.stream_id, request.frame_number
                )));
            }
            outputs.push((stream.kind, *buffer));
        }

        if let Some(input) = request.input_buffer {
            let valid = streams
                .find(input.stream_id)
                .is_some_and(|s| s.kind == StreamKind::ZslInput);
            if !valid {
                return Err(HalError::invalid_argument(format!(
                    "stream {} cannot take input buffers",
                    input.stream_id
                )));
            }
            if !outputs.iter().any(|(kind, _)| kind.is_capture()) {
                return Err(HalError::invalid_argument(format!(
                    "request {} reprocesses without a JPEG output",
                    request.frame_number
                )));
            }
        }

        Ok(outputs)
    }

    /// Drain a running pipeline, then release every factory and pool.
    pub fn teardown(&self) {
        if let Some(runtime) = self.runtime.swap(None) {
            runtime.drain();
        }
        for factory in self.factories() {
            match factory.destroy() {
                Ok(leftover) if !leftover.is_empty() => {
                    warn!(factory = ?factory.kind(), leftover = leftover.len(), "frames left at destroy")
                }
                Ok(_) => {}
                Err(e) => error!(factory = ?factory.kind(), "destroy failed: {e}"),
            }
        }
        self.registry.clear();
        info!(generation = self.generation, "session torn down");
    }
}
