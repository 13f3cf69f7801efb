pub mod handle;
pub mod pool;
pub mod registry;

pub use handle::{Buffer, BufferOwner, BufferPosition, BufferTag, ManagerType, Plane};
pub use pool::{BufferPool, PoolSummary};
pub use registry::BufferRegistry;
