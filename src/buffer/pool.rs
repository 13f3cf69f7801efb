//! Fixed-size buffer pool for one group of pipeline stages

use std::fmt;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::handle::{Buffer, BufferOwner, BufferPosition, BufferTag, Plane};
use crate::error::{HalError, Result};
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Handed out, owned by the HAL
    Acquired,
    /// Queued to a pipe
    InDriver,
}

struct PoolInner {
    slots: Vec<SlotState>,
    allocated: bool,
}

/// Pool of `count` buffers addressed by index. Acquire/return is serialized
/// internally.
pub struct BufferPool {
    name: String,
    tag: BufferTag,
    plane_sizes: Vec<usize>,
    inner: Mutex<PoolInner>,
}

/// Counts reported by [`BufferPool::summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSummary {
    pub name: String,
    pub size: usize,
    pub available: usize,
    pub acquired: usize,
    pub in_driver: usize,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("plane_sizes", &self.plane_sizes)
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    pub fn new(name: impl Into<String>, tag: BufferTag, count: usize, plane_sizes: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            tag,
            plane_sizes,
            inner: Mutex::new(PoolInner {
                slots: vec![SlotState::Free; count],
                allocated: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    /// Back every slot with memory. Calling it again is a no-op.
    pub fn allocate(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.allocated {
            debug!(pool = %self.name, "already allocated");
            return Ok(());
        }
        if inner.slots.is_empty() {
            return Err(HalError::invalid_argument(format!(
                "pool {} has no buffers",
                self.name
            )));
        }
        inner.allocated = true;
        info!(
            pool = %self.name,
            count = inner.slots.len(),
            bytes_per_buffer = self.plane_sizes.iter().sum::<usize>(),
            "allocated buffer pool"
        );
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        lock(&self.inner).allocated
    }

    /// Hand out a free buffer.
    pub fn get_buffer(&self) -> Result<Buffer> {
        let mut inner = lock(&self.inner);
        if !inner.allocated {
            return Err(HalError::invalid_operation(format!(
                "pool {} is not allocated",
                self.name
            )));
        }
        let index = inner
            .slots
            .iter()
            .position(|s| *s == SlotState::Free)
            .ok_or_else(|| HalError::exhausted(format!("pool {} is empty", self.name)))?;
        inner.slots[index] = SlotState::Acquired;
        Ok(self.make_buffer(index))
    }

    /// Return a buffer obtained from [`BufferPool::get_buffer`]. Returning a
    /// buffer twice is rejected.
    pub fn put_buffer(&self, buffer: &Buffer) -> Result<()> {
        self.check_owner(buffer)?;
        let mut inner = lock(&self.inner);
        let slot = inner
            .slots
            .get_mut(buffer.index)
            .ok_or_else(|| HalError::invalid_argument(format!("index {} out of range", buffer.index)))?;
        match *slot {
            SlotState::Free => Err(HalError::invalid_operation(format!(
                "buffer {} of pool {} returned twice",
                buffer.index, self.name
            ))),
            SlotState::InDriver => {
                warn!(pool = %self.name, index = buffer.index, "returning a buffer still in driver");
                *slot = SlotState::Free;
                Ok(())
            }
            SlotState::Acquired => {
                *slot = SlotState::Free;
                Ok(())
            }
        }
    }

    /// Mark a buffer as queued to a pipe. At most one pipe may hold a buffer.
    pub fn mark_in_driver(&self, buffer: &Buffer) -> Result<()> {
        self.transition(buffer, SlotState::Acquired, SlotState::InDriver)
    }

    /// Mark a buffer as dequeued from a pipe.
    pub fn mark_in_hal(&self, buffer: &Buffer) -> Result<()> {
        self.transition(buffer, SlotState::InDriver, SlotState::Acquired)
    }

    fn transition(&self, buffer: &Buffer, from: SlotState, to: SlotState) -> Result<()> {
        self.check_owner(buffer)?;
        let mut inner = lock(&self.inner);
        let slot = inner
            .slots
            .get_mut(buffer.index)
            .ok_or_else(|| HalError::invalid_argument(format!("index {} out of range", buffer.index)))?;
        if *slot != from {
            return Err(HalError::invalid_operation(format!(
                "buffer {} of pool {} is {:?}, expected {:?}",
                buffer.index, self.name, slot, from
            )));
        }
        *slot = to;
        Ok(())
    }

    fn check_owner(&self, buffer: &Buffer) -> Result<()> {
        match buffer.owner {
            BufferOwner::Pool(tag) if tag == self.tag => Ok(()),
            _ => Err(HalError::invalid_argument(format!(
                "buffer does not belong to pool {}",
                self.name
            ))),
        }
    }

    fn make_buffer(&self, index: usize) -> Buffer {
        let planes = self
            .plane_sizes
            .iter()
            .enumerate()
            .map(|(plane, size)| Plane {
                size: *size,
                fd: (index * self.plane_sizes.len() + plane) as i32 + 100,
                addr: 0x1000_0000 + (index as u64) * 0x0100_0000 + (plane as u64) * 0x0010_0000,
            })
            .collect();
        Buffer {
            index,
            owner: BufferOwner::Pool(self.tag),
            planes,
            acquire_fence: None,
            release_fence: None,
            position: BufferPosition::InHal,
        }
    }

    pub fn size(&self) -> usize {
        lock(&self.inner).slots.len()
    }

    pub fn available(&self) -> usize {
        self.count(SlotState::Free)
    }

    pub fn in_driver(&self) -> usize {
        self.count(SlotState::InDriver)
    }

    fn count(&self, state: SlotState) -> usize {
        lock(&self.inner).slots.iter().filter(|s| **s == state).count()
    }

    /// Force every slot back to free. Returns how many were still out.
    pub fn reset(&self) -> usize {
        let mut inner = lock(&self.inner);
        let outstanding = inner.slots.iter().filter(|s| **s != SlotState::Free).count();
        inner.slots.iter_mut().for_each(|s| *s = SlotState::Free);
        outstanding
    }

    pub fn deallocate(&self) {
        let mut inner = lock(&self.inner);
        inner.slots.iter_mut().for_each(|s| *s = SlotState::Free);
        inner.allocated = false;
    }

    pub fn summary(&self) -> PoolSummary {
        let inner = lock(&self.inner);
        let count = |state| inner.slots.iter().filter(|s| **s == state).count();
        PoolSummary {
            name: self.name.clone(),
            size: inner.slots.len(),
            available: count(SlotState::Free),
            acquired: count(SlotState::Acquired),
            in_driver: count(SlotState::InDriver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ManagerType;
    use crate::frame::PipeId;

    fn pool(count: usize) -> BufferPool {
        let pool = BufferPool::new(
            "test",
            BufferTag::new(&[PipeId::Isp], ManagerType::Ion),
            count,
            vec![1024, 512],
        );
        pool.allocate().unwrap();
        pool
    }

    #[test]
    fn exhaustion_is_resource_exhausted() {
        let pool = pool(2);
        let a = pool.get_buffer().unwrap();
        let b = pool.get_buffer().unwrap();
        assert_ne!(a.index, b.index);
        assert_eq!(a.planes.len(), 2);
        let err = pool.get_buffer().unwrap_err();
        assert!(matches!(err, HalError::ResourceExhausted(_)));
        pool.put_buffer(&a).unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn double_return_is_rejected() {
        let pool = pool(1);
        let a = pool.get_buffer().unwrap();
        pool.put_buffer(&a).unwrap();
        assert!(matches!(pool.put_buffer(&a), Err(HalError::InvalidOperation(_))));
    }

    #[test]
    fn at_most_one_in_driver() {
        let pool = pool(1);
        let a = pool.get_buffer().unwrap();
        pool.mark_in_driver(&a).unwrap();
        assert!(pool.mark_in_driver(&a).is_err());
        assert_eq!(pool.in_driver(), 1);
        pool.mark_in_hal(&a).unwrap();
        assert_eq!(pool.in_driver(), 0);
    }

    #[test]
    fn unallocated_pool_refuses() {
        let pool = BufferPool::new("cold", BufferTag::new(&[PipeId::Vra], ManagerType::Ion), 1, vec![1]);
        assert!(matches!(pool.get_buffer(), Err(HalError::InvalidOperation(_))));
    }

    #[test]
    fn foreign_buffer_is_rejected() {
        let pool = pool(1);
        let foreign = crate::buffer::Buffer::service(1, 9, None);
        assert!(matches!(pool.put_buffer(&foreign), Err(HalError::InvalidArgument(_))));
    }

    #[test]
    fn reset_reclaims_outstanding() {
        let pool = pool(3);
        let a = pool.get_buffer().unwrap();
        let _b = pool.get_buffer().unwrap();
        pool.mark_in_driver(&a).unwrap();
        assert_eq!(pool.reset(), 2);
        let summary = pool.summary();
        assert_eq!(summary.available, 3);
        assert_eq!(summary.in_driver, 0);
    }
}
