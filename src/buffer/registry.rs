//! Buffer pool registry keyed by structural tag

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::handle::{Buffer, BufferOwner, BufferTag, ManagerType};
use super::pool::{BufferPool, PoolSummary};
use crate::error::{HalError, Result};
use crate::frame::NodeId;
use crate::BufferConfig;

/// Owns every internal buffer pool. Lookups hand out shared handles; the
/// registry stays the only place pools are created or dropped.
#[derive(Default)]
pub struct BufferRegistry {
    pools: RwLock<HashMap<BufferTag, Arc<BufferPool>>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under its tag. A second pool for the same tag is a
    /// configuration bug.
    pub fn register(&self, pool: BufferPool) -> Result<Arc<BufferPool>> {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        let tag = pool.tag();
        if pools.contains_key(&tag) {
            return Err(HalError::invalid_operation(format!(
                "buffer manager {} registered twice",
                pool.name()
            )));
        }
        let pool = Arc::new(pool);
        pools.insert(tag, pool.clone());
        Ok(pool)
    }

    pub fn get(&self, tag: &BufferTag) -> Result<Arc<BufferPool>> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .cloned()
            .ok_or_else(|| HalError::not_found(format!("no buffer manager for {tag:?}")))
    }

    pub fn for_node(&self, node: NodeId) -> Result<Arc<BufferPool>> {
        self.get(&BufferTag::for_node(node))
    }

    pub fn contains(&self, tag: &BufferTag) -> bool {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(tag)
    }

    /// Create and allocate the internal pools of every node the active
    /// topologies use.
    pub fn allocate_for(&self, nodes: &[NodeId], config: &BufferConfig, plane_size: usize) -> Result<()> {
        for &node in nodes {
            if node.is_service_backed() {
                continue;
            }
            let tag = BufferTag::for_node(node);
            if self.contains(&tag) {
                continue;
            }
            let count = match node {
                NodeId::FliteBayer => config.bayer_count,
                NodeId::ThreeAaOutput => config.three_aa_output_count,
                NodeId::IspOutput => config.isp_output_count,
                NodeId::McscDs => config.vra_input_count,
                NodeId::ReprocessingYuv => config.reprocessing_yuv_count,
                NodeId::ReprocessingThumbnail => config.thumbnail_count,
                _ => 0,
            };
            let planes = vec![plane_size; config.plane_count.max(1)];
            let pool = self.register(BufferPool::new(format!("{node:?}"), tag, count, planes))?;
            pool.allocate()?;
        }
        Ok(())
    }

    /// Acquire a buffer for `node`, retrying while the pool is empty.
    ///
    /// Retries `total_wait_ms / wait_time_ms` times with a fixed sleep, then
    /// fails with `TimedOut`.
    pub fn check_buffer_available(&self, node: NodeId, config: &BufferConfig) -> Result<Buffer> {
        let pool = self.for_node(node)?;
        let wait = Duration::from_millis(config.wait_time_ms.max(1));
        let retries = (config.total_wait_ms / config.wait_time_ms.max(1)).max(1);
        for attempt in 0..retries {
            match pool.get_buffer() {
                Ok(buffer) => return Ok(buffer),
                Err(HalError::ResourceExhausted(_)) => {
                    debug!(pool = pool.name(), attempt, "no buffer available, retrying");
                    thread::sleep(wait);
                }
                Err(e) => return Err(e),
            }
        }
        warn!(pool = pool.name(), retries, "buffer wait budget exhausted");
        Err(HalError::timed_out(format!(
            "no buffer in {} after {} retries",
            pool.name(),
            retries
        )))
    }

    /// Return an internal buffer to the pool that owns it.
    pub fn put(&self, buffer: &Buffer) -> Result<()> {
        match buffer.owner {
            BufferOwner::Pool(tag) => self.get(&tag)?.put_buffer(buffer),
            BufferOwner::Service { .. } => Err(HalError::invalid_argument(
                "service buffers are returned through the result path",
            )),
        }
    }

    pub fn mark_in_driver(&self, buffer: &Buffer) -> Result<()> {
        match buffer.tag() {
            Some(tag) => self.get(&tag)?.mark_in_driver(buffer),
            None => Ok(()),
        }
    }

    pub fn mark_in_hal(&self, buffer: &Buffer) -> Result<()> {
        match buffer.tag() {
            Some(tag) => self.get(&tag)?.mark_in_hal(buffer),
            None => Ok(()),
        }
    }

    /// Reclaim every outstanding internal buffer. Returns the number reclaimed.
    pub fn reset_all(&self) -> usize {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        let reclaimed: usize = pools.values().map(|p| p.reset()).sum();
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed outstanding internal buffers");
        }
        reclaimed
    }

    /// Drop every pool.
    pub fn clear(&self) {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        for pool in pools.values() {
            pool.deallocate();
        }
        info!(count = pools.len(), "released buffer managers");
        pools.clear();
    }

    pub fn ion_pools(&self) -> usize {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|t| t.manager == ManagerType::Ion)
            .count()
    }

    pub fn summaries(&self) -> Vec<PoolSummary> {
        let mut out: Vec<PoolSummary> = self
            .pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|p| p.summary())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Buffers currently queued to a pipe across every pool.
    pub fn in_driver_total(&self) -> usize {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|p| p.in_driver())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PipeId;

    fn small_config() -> BufferConfig {
        BufferConfig {
            bayer_count: 2,
            wait_time_ms: 5,
            total_wait_ms: 20,
            ..BufferConfig::default()
        }
    }

    #[test]
    fn duplicate_tag_is_invalid_operation() {
        let registry = BufferRegistry::new();
        let tag = BufferTag::new(&[PipeId::Isp, PipeId::Mcsc], ManagerType::Ion);
        registry.register(BufferPool::new("a", tag, 1, vec![16])).unwrap();
        let err = registry.register(BufferPool::new("b", tag, 1, vec![16])).unwrap_err();
        assert!(matches!(err, HalError::InvalidOperation(_)));
    }

    #[test]
    fn lookup_by_structural_tag() {
        let registry = BufferRegistry::new();
        registry
            .allocate_for(&[NodeId::FliteBayer, NodeId::McscPreview], &small_config(), 64)
            .unwrap();
        // service nodes get no internal pool
        assert_eq!(registry.ion_pools(), 1);
        let pool = registry
            .get(&BufferTag::new(&[PipeId::ThreeAaReprocessing, PipeId::Flite], ManagerType::Ion))
            .unwrap();
        assert_eq!(pool.size(), 2);
        assert!(matches!(
            registry.for_node(NodeId::IspOutput),
            Err(HalError::NotFound(_))
        ));
    }

    #[test]
    fn availability_retry_times_out() {
        let registry = BufferRegistry::new();
        let config = small_config();
        registry.allocate_for(&[NodeId::FliteBayer], &config, 64).unwrap();
        let a = registry.check_buffer_available(NodeId::FliteBayer, &config).unwrap();
        let _b = registry.check_buffer_available(NodeId::FliteBayer, &config).unwrap();
        let err = registry
            .check_buffer_available(NodeId::FliteBayer, &config)
            .unwrap_err();
        assert!(matches!(err, HalError::TimedOut(_)));

        registry.put(&a).unwrap();
        assert!(registry.check_buffer_available(NodeId::FliteBayer, &config).is_ok());
    }

    #[test]
    fn reset_all_reports_outstanding() {
        let registry = BufferRegistry::new();
        let config = small_config();
        registry.allocate_for(&[NodeId::FliteBayer], &config, 64).unwrap();
        let a = registry.check_buffer_available(NodeId::FliteBayer, &config).unwrap();
        registry.mark_in_driver(&a).unwrap();
        assert_eq!(registry.in_driver_total(), 1);
        assert_eq!(registry.reset_all(), 1);
        assert_eq!(registry.in_driver_total(), 0);
    }
}
