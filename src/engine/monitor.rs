//! Watchdog over the running pipes

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::runtime::Runtime;
use crate::error::HalError;
use crate::pipeline::StopToken;

impl Runtime {
    pub(crate) fn monitor_loop(self: Arc<Self>, stop: StopToken) {
        let monitor = &self.core.config.monitor;
        let interval = Duration::from_millis(monitor.interval_ms.max(1));
        let stall_ns = monitor.stall_timeout_ms.saturating_mul(1_000_000);
        while !stop.is_stopped() {
            match self.monitor_tick.wait_and_pop(interval) {
                Ok(Some(())) | Err(HalError::TimedOut(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    warn!("monitor queue failed: {e}");
                    break;
                }
            }
            if stop.is_stopped() {
                break;
            }
            self.check_pipes(stall_ns);
        }
        debug!("monitor stopped");
    }

    fn check_pipes(&self, stall_ns: u64) {
        for factory in self.session.factories() {
            if let Some((pipe, err)) = factory.take_fatal() {
                error!(factory = ?factory.kind(), %pipe, "pipe reported a fatal error: {err}");
                metrics::counter!("camera3_fatal_errors_total").increment(1);
                if self.core.state.fail() {
                    self.core.manager.notify_device_error();
                }
                if self.core.config.monitor.abort_on_fatal {
                    error!("abort_on_fatal is set, aborting");
                    std::process::abort();
                }
            }
            for health in factory.health() {
                if health.queued > 0 && health.idle_ns > stall_ns {
                    warn!(
                        factory = ?factory.kind(),
                        pipe = %health.pipe,
                        queued = health.queued,
                        idle_ms = health.idle_ns / 1_000_000,
                        "pipe stalled"
                    );
                    metrics::counter!("camera3_pipe_stalls_total").increment(1);
                }
            }
        }
    }
}
