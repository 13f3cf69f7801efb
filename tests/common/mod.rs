#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use camera3_hal::request::{
    BufferStatus, CaptureCallbacks, CaptureResult, ErrorCode, NotifyMsg, StreamBufferResult,
};
use camera3_hal::{Config, PARTIAL_RESULT_COUNT};

pub const PREVIEW: i32 = 0;
pub const JPEG: i32 = 1;
pub const ZSL_INPUT: i32 = 2;

pub const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum Event {
    Notify(NotifyMsg),
    Result(CaptureResult),
}

/// Records every callback in arrival order.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
}

impl CaptureCallbacks for Recorder {
    fn notify(&self, msg: NotifyMsg) {
        self.events.lock().unwrap().push(Event::Notify(msg));
        self.changed.notify_all();
    }

    fn process_capture_result(&self, result: CaptureResult) {
        self.events.lock().unwrap().push(Event::Result(result));
        self.changed.notify_all();
    }
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Block until `done` holds or `timeout` passes. Returns the final check.
    pub fn wait_until(&self, timeout: Duration, done: impl Fn(&Recorder) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let events = self.events.lock().unwrap();
            let slice = (deadline - now).min(Duration::from_millis(20));
            drop(self.changed.wait_timeout(events, slice).unwrap());
        }
    }

    pub fn wait_closed(&self, frame_numbers: impl IntoIterator<Item = u32> + Clone) -> bool {
        self.wait_until(WAIT, |r| frame_numbers.clone().into_iter().all(|n| r.is_closed(n)))
    }

    pub fn shutters(&self, frame_number: u32) -> usize {
        self.count(|e| matches!(e, Event::Notify(NotifyMsg::Shutter { frame_number: n, .. }) if *n == frame_number))
    }

    pub fn final_results(&self, frame_number: u32) -> usize {
        self.count(|e| {
            matches!(e, Event::Result(r) if r.frame_number == frame_number && r.partial_result == PARTIAL_RESULT_COUNT)
        })
    }

    pub fn errors(&self, frame_number: u32, code: ErrorCode) -> usize {
        self.count(|e| {
            matches!(e, Event::Notify(NotifyMsg::Error { frame_number: n, code: c, .. }) if *n == frame_number && *c == code)
        })
    }

    pub fn buffers(&self, frame_number: u32, stream_id: i32) -> Vec<StreamBufferResult> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Result(r) if r.frame_number == frame_number => Some(r.output_buffers),
                _ => None,
            })
            .flatten()
            .filter(|b| b.stream_id == stream_id)
            .collect()
    }

    pub fn ok_buffers(&self, frame_number: u32, stream_id: i32) -> usize {
        self.buffers(frame_number, stream_id)
            .iter()
            .filter(|b| b.status == BufferStatus::Ok)
            .count()
    }

    /// Every error buffer of `stream_id` is covered by an ERROR_BUFFER for
    /// that stream, or the whole request was dropped with ERROR_REQUEST.
    pub fn error_buffers_announced(&self, frame_number: u32, stream_id: i32) -> bool {
        if self.errors(frame_number, ErrorCode::Request) > 0 {
            return self.final_results(frame_number) == 0;
        }
        let failed = self
            .buffers(frame_number, stream_id)
            .iter()
            .filter(|b| b.status == BufferStatus::Error)
            .count();
        let announced = self.count(|e| {
            matches!(e, Event::Notify(NotifyMsg::Error { frame_number: n, stream_id: Some(s), code: ErrorCode::Buffer })
                if *n == frame_number && *s == stream_id)
        });
        failed == announced
    }

    /// A request is closed by its final metadata or by ERROR_REQUEST.
    pub fn is_closed(&self, frame_number: u32) -> bool {
        self.final_results(frame_number) > 0 || self.errors(frame_number, ErrorCode::Request) > 0
    }

    /// Index of the first event for `frame_number` matching `pred`.
    pub fn position(&self, frame_number: u32, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(|e| {
            let n = match e {
                Event::Notify(NotifyMsg::Shutter { frame_number, .. }) => *frame_number,
                Event::Notify(NotifyMsg::Error { frame_number, .. }) => *frame_number,
                Event::Result(r) => r.frame_number,
            };
            n == frame_number && pred(e)
        })
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

/// Fast sensor and short stages so scenarios finish in well under a second.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.sensor.min_fps = 30;
    config.sensor.max_fps = 120;
    config.pipeline.stage_latency_ms = 1;
    config.pipeline.use_vra = false;
    config.monitor.interval_ms = 50;
    config.request.min_block_request_count = 8;
    config.request.max_block_request_count = 10;
    config
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
