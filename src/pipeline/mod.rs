pub mod factory;
pub mod pipe;
pub mod queue;
pub mod topology;
pub mod worker;

pub use factory::{FactoryState, FrameFactory, PipeHealth};
pub use pipe::{software_pipes, FrameRef, Pipe, PipeBuilder, SharedQueue, SoftwarePipe};
pub use queue::{FrameQueue, QueueStats};
pub use topology::{PipelineMode, Topology};
pub use worker::{StopToken, Worker};
