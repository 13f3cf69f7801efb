//! Back-pressure on `process_capture_request`

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::request::RequestManager;
use crate::{RequestConfig, SensorConfig};

/// How a request got past admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Fewer than the minimum block count were running.
    Immediate,
    /// A wait slice ended or a request finished with the count under the maximum.
    BelowMax,
    /// The wait budget ran out.
    Budget,
    /// A flush started while waiting.
    Flushing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub min_block: usize,
    pub max_block: usize,
    /// One wait slice, derived from the slowest frame rate.
    pub interval: Duration,
    pub budget: Duration,
}

impl AdmissionPolicy {
    pub fn new(request: &RequestConfig, sensor: &SensorConfig) -> Self {
        let interval = Duration::from_millis(1000 / u64::from(sensor.min_fps.max(1)));
        let budget = match request.max_block_wait_ms {
            Some(ms) => Duration::from_millis(ms),
            None => interval * (request.min_block_request_count.max(1) as u32) * 10,
        };
        Self {
            min_block: request.min_block_request_count,
            max_block: request.max_block_request_count.max(request.min_block_request_count),
            interval,
            budget,
        }
    }

    /// Whether a caller that saw `running` requests must keep waiting.
    pub fn must_wait(&self, running: usize) -> bool {
        running >= self.min_block
    }

    /// Decision once a wait slice ends, whether or not a request finished.
    pub fn admit_after_idle_slice(&self, running: usize) -> bool {
        running < self.max_block
    }

    /// Block the caller until it may register another request.
    pub fn wait(&self, manager: &RequestManager, flushing: &AtomicBool) -> Admission {
        let started = Instant::now();
        let mut slices = 0u32;
        loop {
            if flushing.load(Ordering::Acquire) {
                return Admission::Flushing;
            }
            let running = manager.running_count();
            if !self.must_wait(running) {
                if slices > 0 {
                    debug!(running, slices, "admitted after completion");
                }
                return Admission::Immediate;
            }
            let elapsed = started.elapsed();
            if elapsed >= self.budget {
                warn!(running, waited = ?elapsed, "admission budget exhausted");
                return Admission::Budget;
            }
            slices += 1;
            let slice = self.interval.min(self.budget - elapsed);
            let slice_start = Instant::now();
            let changed = manager.wait_for_change(slice);
            if !changed && slice_start.elapsed() < slice {
                continue;
            }
            if flushing.load(Ordering::Acquire) {
                return Admission::Flushing;
            }
            let running = manager.running_count();
            if !self.must_wait(running) {
                continue;
            }
            if self.admit_after_idle_slice(running) {
                debug!(running, changed, "admitted below max block count");
                return Admission::BelowMax;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{
        CaptureCallbacks, CaptureRequest, CaptureResult, MetadataConverter, NotifyMsg,
        RequestTemplate,
    };
    use std::sync::Arc;
    use std::thread;

    struct Sink;

    impl CaptureCallbacks for Sink {
        fn notify(&self, _: NotifyMsg) {}
        fn process_capture_result(&self, _: CaptureResult) {}
    }

    fn policy(min: usize, max: usize, budget_ms: Option<u64>) -> AdmissionPolicy {
        AdmissionPolicy::new(
            &RequestConfig {
                min_block_request_count: min,
                max_block_request_count: max,
                max_block_wait_ms: budget_ms,
            },
            &SensorConfig {
                min_fps: 50,
                ..SensorConfig::default()
            },
        )
    }

    fn manager_with(running: u32) -> Arc<RequestManager> {
        let converter = MetadataConverter::new(SensorConfig::default());
        let settings = converter.default_settings(RequestTemplate::Preview);
        let manager = Arc::new(RequestManager::new(Arc::new(Sink), converter));
        for n in 1..=running {
            manager
                .register(&CaptureRequest::new(n, Some(settings.clone())).with_output(0, u64::from(n)))
                .unwrap();
        }
        manager
    }

    #[test]
    fn default_budget_is_ten_intervals_per_block() {
        let p = policy(3, 5, None);
        assert_eq!(p.interval, Duration::from_millis(20));
        assert_eq!(p.budget, Duration::from_millis(600));
        assert_eq!(policy(3, 5, Some(250)).budget, Duration::from_millis(250));
    }

    #[test]
    fn thresholds() {
        let p = policy(2, 4, None);
        assert!(!p.must_wait(1));
        assert!(p.must_wait(2));
        assert!(p.admit_after_idle_slice(3));
        assert!(!p.admit_after_idle_slice(4));
    }

    #[test]
    fn below_min_is_immediate() {
        let flushing = AtomicBool::new(false);
        assert_eq!(
            policy(2, 4, None).wait(&manager_with(1), &flushing),
            Admission::Immediate
        );
    }

    #[test]
    fn between_min_and_max_waits_one_slice() {
        let flushing = AtomicBool::new(false);
        let p = policy(2, 4, None);
        let started = Instant::now();
        assert_eq!(p.wait(&manager_with(3), &flushing), Admission::BelowMax);
        assert!(started.elapsed() >= p.interval);
    }

    #[test]
    fn at_max_waits_for_budget() {
        let flushing = AtomicBool::new(false);
        let p = policy(2, 4, Some(120));
        let started = Instant::now();
        assert_eq!(p.wait(&manager_with(4), &flushing), Admission::Budget);
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn completion_releases_waiter() {
        let flushing = Arc::new(AtomicBool::new(false));
        let manager = manager_with(2);
        let p = policy(2, 2, Some(5_000));
        let waiter = {
            let manager = manager.clone();
            let flushing = flushing.clone();
            thread::spawn(move || p.wait(&manager, &flushing))
        };
        thread::sleep(Duration::from_millis(30));
        manager.abort_request(1, None).unwrap();
        assert_eq!(waiter.join().unwrap(), Admission::Immediate);
    }

    #[test]
    fn completion_below_max_admits_without_another_slice() {
        let flushing = Arc::new(AtomicBool::new(false));
        let manager = manager_with(4);
        let p = AdmissionPolicy {
            min_block: 2,
            max_block: 4,
            interval: Duration::from_secs(2),
            budget: Duration::from_secs(10),
        };
        let started = Instant::now();
        let waiter = {
            let manager = manager.clone();
            let flushing = flushing.clone();
            thread::spawn(move || p.wait(&manager, &flushing))
        };
        thread::sleep(Duration::from_millis(30));
        manager.abort_request(1, None).unwrap();
        assert_eq!(waiter.join().unwrap(), Admission::BelowMax);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(manager.running_count(), 3);
    }

    #[test]
    fn flush_releases_waiter() {
        let flushing = Arc::new(AtomicBool::new(false));
        let manager = manager_with(4);
        let p = policy(2, 4, Some(5_000));
        let waiter = {
            let manager = manager.clone();
            let flushing = flushing.clone();
            thread::spawn(move || p.wait(&manager, &flushing))
        };
        thread::sleep(Duration::from_millis(30));
        flushing.store(true, Ordering::Release);
        manager.wake_waiters();
        assert_eq!(waiter.join().unwrap(), Admission::Flushing);
    }
}
