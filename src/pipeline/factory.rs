//! Frame factory: owns one pipeline's stages, queues and frame template

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::{debug, info, instrument, warn};

use super::pipe::{FatalSlot, FrameRef, Pipe, PipeActivity, PipeBuilder, PipeRunner, SharedQueue};
use super::queue::FrameQueue;
use super::topology::Topology;
use super::worker::Worker;
use crate::buffer::BufferRegistry;
use crate::error::{HalError, Result};
use crate::frame::{FactoryKind, Frame, FrameParams, FrameType, NodeId, NodeSet, PipeId, ShotSnapshot};
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryState {
    Uncreated,
    Created,
    Initialized,
    Prepared,
    Running,
    Stopped,
    Destroyed,
}

/// Per-stage liveness as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeHealth {
    pub pipe: PipeId,
    pub queued: usize,
    pub processed: u64,
    pub idle_ns: u64,
}

pub struct FrameFactory {
    kind: FactoryKind,
    topology: Topology,
    generation: u64,
    builder: PipeBuilder,
    queue_timeout: Duration,
    teardown_timeout: Duration,
    state: Mutex<FactoryState>,
    requests: Mutex<NodeSet>,
    inputs: Arc<HashMap<PipeId, SharedQueue>>,
    outputs: HashMap<PipeId, Arc<ArcSwapOption<FrameQueue<FrameRef>>>>,
    registry: Arc<ArcSwapOption<BufferRegistry>>,
    pipes: Mutex<HashMap<PipeId, Arc<Mutex<Box<dyn Pipe>>>>>,
    runners: Mutex<HashMap<PipeId, Worker>>,
    activity: HashMap<PipeId, Arc<PipeActivity>>,
    fatal: Arc<FatalSlot>,
    frames_created: AtomicU64,
}

impl std::fmt::Debug for FrameFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameFactory")
            .field("kind", &self.kind)
            .field("mode", &self.topology.mode())
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl FrameFactory {
    pub fn new(
        kind: FactoryKind,
        topology: Topology,
        generation: u64,
        builder: PipeBuilder,
        queue_timeout: Duration,
    ) -> Self {
        let pipes = topology.pipes();
        let inputs = pipes
            .iter()
            .map(|p| (*p, Arc::new(FrameQueue::new(format!("{p}_in")))))
            .collect();
        let outputs = pipes
            .iter()
            .map(|p| (*p, Arc::new(ArcSwapOption::empty())))
            .collect();
        let activity = pipes
            .iter()
            .map(|p| (*p, Arc::new(PipeActivity::default())))
            .collect();
        let always_on = topology.always_on();
        Self {
            kind,
            topology,
            generation,
            builder,
            queue_timeout,
            teardown_timeout: queue_timeout,
            state: Mutex::new(FactoryState::Uncreated),
            requests: Mutex::new(always_on),
            inputs: Arc::new(inputs),
            outputs,
            registry: Arc::new(ArcSwapOption::empty()),
            pipes: Mutex::new(HashMap::new()),
            runners: Mutex::new(HashMap::new()),
            activity,
            fatal: Arc::new(FatalSlot::default()),
            frames_created: AtomicU64::new(0),
        }
    }

    /// Bound on how long [`FrameFactory::stop_pipes`] waits for a stage before warning.
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn teardown_timeout(&self) -> Duration {
        self.teardown_timeout
    }

    pub fn kind(&self) -> FactoryKind {
        self.kind
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> FactoryState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == FactoryState::Running
    }

    pub fn frames_created(&self) -> u64 {
        self.frames_created.load(Ordering::Relaxed)
    }

    fn transition(&self, from: &[FactoryState], to: FactoryState) -> Result<()> {
        let mut state = lock(&self.state);
        if !from.contains(&state) {
            return Err(HalError::invalid_operation(format!(
                "{:?} factory is {:?}, cannot move to {:?}",
                self.kind, *state, to
            )));
        }
        debug!(factory = ?self.kind, from = ?*state, ?to, "factory state");
        *state = to;
        Ok(())
    }

    pub fn create(&self) -> Result<()> {
        self.transition(&[FactoryState::Uncreated], FactoryState::Created)
    }

    /// Build the pipe object of every stage.
    pub fn init_pipes(&self) -> Result<()> {
        self.transition(&[FactoryState::Created], FactoryState::Initialized)?;
        let mut pipes = lock(&self.pipes);
        for pipe in self.topology.pipes() {
            let object = (self.builder)(pipe);
            if object.pipe_id() != pipe {
                return Err(HalError::invalid_operation(format!(
                    "builder returned {} for {pipe}",
                    object.pipe_id()
                )));
            }
            pipes.insert(pipe, Arc::new(Mutex::new(object)));
        }
        Ok(())
    }

    /// Check wiring before start. Also re-arms a stopped factory.
    pub fn prepare_pipes(&self) -> Result<()> {
        if self.registry.load().is_none() {
            return Err(HalError::invalid_operation(format!(
                "{:?} factory has no buffer manager",
                self.kind
            )));
        }
        if let Some((pipe, _)) = self
            .outputs
            .iter()
            .find(|(_, out)| out.load().is_none())
        {
            return Err(HalError::invalid_operation(format!("{pipe} has no output queue")));
        }
        self.transition(
            &[FactoryState::Initialized, FactoryState::Stopped],
            FactoryState::Prepared,
        )?;
        self.fatal.take();
        Ok(())
    }

    pub fn start_pipes(&self) -> Result<()> {
        self.transition(&[FactoryState::Prepared], FactoryState::Running)?;
        for pipe in self.topology.pipes() {
            self.start_thread(pipe)?;
        }
        info!(factory = ?self.kind, mode = ?self.topology.mode(), generation = self.generation, "pipes started");
        Ok(())
    }

    /// Start the stage thread of `pipe` if it is not already running.
    pub fn start_thread(&self, pipe: PipeId) -> Result<()> {
        if !matches!(self.state(), FactoryState::Prepared | FactoryState::Running) {
            return Err(HalError::invalid_operation(format!(
                "cannot start {pipe} thread while {:?}",
                self.state()
            )));
        }
        let mut runners = lock(&self.runners);
        if runners.get(&pipe).is_some_and(|w| w.is_running()) {
            return Ok(());
        }
        let object = lock(&self.pipes)
            .get(&pipe)
            .cloned()
            .ok_or_else(|| HalError::not_found(format!("no {pipe} pipe in {:?} factory", self.kind)))?;
        let runner = PipeRunner {
            pipe: object,
            id: pipe,
            input: self.input(pipe)?,
            inputs: self.inputs.clone(),
            output: self.output_slot(pipe)?,
            registry: self.registry.clone(),
            fatal: self.fatal.clone(),
            activity: self.activity_of(pipe)?,
            timeout: self.queue_timeout,
        };
        runner.activity.mark_started();
        let worker = Worker::spawn(format!("{pipe}_thread"), move |stop| runner.run(stop))?;
        runners.insert(pipe, worker);
        Ok(())
    }

    /// Stop every stage thread. Frames still queued are handed back. Calling
    /// it on a stopped or destroyed factory does nothing.
    #[instrument(skip(self), fields(factory = ?self.kind))]
    pub fn stop_pipes(&self) -> Result<Vec<FrameRef>> {
        {
            let mut state = lock(&self.state);
            match *state {
                FactoryState::Stopped | FactoryState::Destroyed | FactoryState::Uncreated => {
                    return Ok(Vec::new())
                }
                _ => *state = FactoryState::Stopped,
            }
        }
        let mut runners: Vec<Worker> = lock(&self.runners).drain().map(|(_, w)| w).collect();
        for worker in &runners {
            worker.request_stop();
        }
        for queue in self.inputs.values() {
            queue.wake();
        }
        let mut slow = 0;
        for worker in &mut runners {
            if !worker.join_within(self.teardown_timeout) {
                slow += 1;
            }
        }
        if slow > 0 {
            warn!(slow, timeout = ?self.teardown_timeout, "stages overran the teardown timeout");
        }
        let mut leftover = Vec::new();
        for pipe in self.topology.pipes() {
            if let Some(queue) = self.inputs.get(&pipe) {
                leftover.extend(queue.release());
            }
        }
        info!(leftover = leftover.len(), "pipes stopped");
        Ok(leftover)
    }

    /// Release every stage. The factory cannot be used again.
    pub fn destroy(&self) -> Result<Vec<FrameRef>> {
        let leftover = self.stop_pipes()?;
        lock(&self.pipes).clear();
        *lock(&self.state) = FactoryState::Destroyed;
        self.registry.store(None);
        for out in self.outputs.values() {
            out.store(None);
        }
        info!(factory = ?self.kind, generation = self.generation, "factory destroyed");
        Ok(leftover)
    }

    /// Enable or disable an optional DMA output for frames created from now on.
    pub fn set_request(&self, node: NodeId, enable: bool) -> Result<()> {
        if !self.topology.contains(node.owner()) {
            return Err(HalError::invalid_argument(format!(
                "{node:?} is not part of the {:?} pipeline",
                self.topology.mode()
            )));
        }
        let mut requests = lock(&self.requests);
        if enable {
            requests.insert(node);
        } else if !self.topology.always_on().contains(node) {
            requests.remove(node);
        }
        Ok(())
    }

    /// Back to the topology's always-on outputs.
    pub fn clear_requests(&self) {
        *lock(&self.requests) = self.topology.always_on();
    }

    pub fn requests(&self) -> NodeSet {
        *lock(&self.requests)
    }

    /// Build a frame from the current template and request set.
    pub fn create_new_frame(
        &self,
        frame_count: u32,
        frame_type: FrameType,
        request_key: Option<u32>,
        shot: Arc<ShotSnapshot>,
    ) -> Result<FrameRef> {
        let state = lock(&self.state);
        if matches!(
            *state,
            FactoryState::Uncreated | FactoryState::Stopped | FactoryState::Destroyed
        ) {
            return Err(HalError::invalid_operation(format!(
                "{:?} factory is {:?}",
                self.kind, *state
            )));
        }
        let frame = Frame::new(
            FrameParams {
                frame_count,
                frame_type,
                factory: self.kind,
                generation: self.generation,
                request_key,
                requested: self.requests(),
                shot,
            },
            self.topology.entities(),
        )?;
        drop(state);
        self.frames_created.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camera3_frames_created_total").increment(1);
        Ok(Arc::new(frame))
    }

    /// Queue a frame on a stage's input. Order of calls is order of processing.
    pub fn push_frame_to_pipe(&self, frame: FrameRef, pipe: PipeId) -> Result<()> {
        let state = lock(&self.state);
        if !matches!(*state, FactoryState::Prepared | FactoryState::Running) {
            return Err(HalError::invalid_operation(format!(
                "push to {pipe} while {:?}",
                *state
            )));
        }
        let queue = self.input(pipe)?;
        if pipe == self.topology.head() {
            frame.mark_pushed();
        }
        queue.push(frame);
        Ok(())
    }

    pub fn set_output_frame_queue(&self, queue: SharedQueue, pipe: PipeId) -> Result<()> {
        self.output_slot(pipe)?.store(Some(queue));
        Ok(())
    }

    /// Attach the buffer manager registry. Attaching a different one twice is
    /// rejected.
    pub fn set_buffer_manager(&self, registry: Arc<BufferRegistry>) -> Result<()> {
        if let Some(current) = self.registry.load_full() {
            if Arc::ptr_eq(&current, &registry) {
                return Ok(());
            }
            return Err(HalError::invalid_operation(format!(
                "{:?} factory already has a buffer manager",
                self.kind
            )));
        }
        self.registry.store(Some(registry));
        Ok(())
    }

    pub fn input(&self, pipe: PipeId) -> Result<SharedQueue> {
        self.inputs
            .get(&pipe)
            .cloned()
            .ok_or_else(|| HalError::not_found(format!("no {pipe} queue in {:?} factory", self.kind)))
    }

    fn output_slot(&self, pipe: PipeId) -> Result<Arc<ArcSwapOption<FrameQueue<FrameRef>>>> {
        self.outputs
            .get(&pipe)
            .cloned()
            .ok_or_else(|| HalError::not_found(format!("no {pipe} stage in {:?} factory", self.kind)))
    }

    fn activity_of(&self, pipe: PipeId) -> Result<Arc<PipeActivity>> {
        self.activity
            .get(&pipe)
            .cloned()
            .ok_or_else(|| HalError::not_found(format!("no {pipe} stage")))
    }

    pub fn take_fatal(&self) -> Option<(PipeId, HalError)> {
        self.fatal.take()
    }

    pub fn health(&self) -> Vec<PipeHealth> {
        self.topology
            .pipes()
            .into_iter()
            .filter_map(|pipe| {
                let activity = self.activity.get(&pipe)?;
                Some(PipeHealth {
                    pipe,
                    queued: self.inputs.get(&pipe).map_or(0, |q| q.len()),
                    processed: activity.processed(),
                    idle_ns: activity.idle_ns(),
                })
            })
            .collect()
    }
}

impl Drop for FrameFactory {
    fn drop(&mut self) {
        if self.state() != FactoryState::Destroyed {
            if let Err(e) = self.destroy() {
                warn!(factory = ?self.kind, "destroy on drop failed: {e}");
            }
        }
    }
}
