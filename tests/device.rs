mod common;

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camera3_hal::frame::{Frame, FrameType, PipeId};
use camera3_hal::pipeline::{software_pipes, Pipe, PipeBuilder, SoftwarePipe};
use camera3_hal::request::{
    CameraMetadata, CaptureRequest, ErrorCode, NotifyMsg, PixelFormat, StreamConfig, StreamType, USAGE_ZSL,
};
use camera3_hal::{CameraDevice, Config, DeviceState, ErrorKind, FRAME_INTERNAL_START_COUNT};

use common::{fast_config, init_logging, Event, Recorder, JPEG, PREVIEW, ZSL_INPUT};

fn open(config: Config) -> (CameraDevice, Arc<Recorder>) {
    init_logging();
    let recorder = Recorder::new();
    let device = CameraDevice::open(Arc::new(config), recorder.clone());
    (device, recorder)
}

fn settings(device: &CameraDevice) -> CameraMetadata {
    device.construct_default_request_settings(1).unwrap()
}

fn preview_request(frame_number: u32, settings: Option<CameraMetadata>) -> CaptureRequest {
    CaptureRequest::new(frame_number, settings).with_output(PREVIEW, u64::from(frame_number))
}

fn assert_idle(device: &CameraDevice) {
    let stats = device.stats();
    assert_eq!(stats.running_requests, 0);
    assert_eq!(stats.buffers_in_driver, 0);
    for pool in &stats.pools {
        assert_eq!(pool.acquired, 0, "{} still lends buffers", pool.name);
    }
}

#[test]
fn preview_request_gets_one_shutter_then_buffer() {
    let (device, recorder) = open(fast_config());
    device
        .configure_streams(Some(&[StreamConfig::preview(PREVIEW, 640, 480)]))
        .unwrap();
    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();

    assert!(recorder.wait_closed([1]));
    assert_eq!(recorder.shutters(1), 1);
    assert_eq!(recorder.final_results(1), 1);
    assert_eq!(recorder.ok_buffers(1, PREVIEW), 1);

    let shutter = recorder
        .position(1, |e| matches!(e, Event::Notify(NotifyMsg::Shutter { .. })))
        .unwrap();
    let buffer = recorder
        .position(1, |e| matches!(e, Event::Result(r) if !r.output_buffers.is_empty()))
        .unwrap();
    assert!(shutter < buffer);
    assert_eq!(device.state(), DeviceState::Streaming);
}

#[test]
fn requests_without_settings_repeat_the_previous_ones() {
    let (device, recorder) = open(fast_config());
    device
        .configure_streams(Some(&[StreamConfig::preview(PREVIEW, 640, 480)]))
        .unwrap();

    let err = device.process_capture_request(&preview_request(1, None)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    for n in 2..=5 {
        device.process_capture_request(&preview_request(n, None)).unwrap();
    }
    assert!(recorder.wait_closed(1..=5));
    for n in 1..=5 {
        assert_eq!(recorder.shutters(n), 1, "request {n}");
        assert_eq!(recorder.ok_buffers(n, PREVIEW), 1, "request {n}");
    }
}

#[test]
fn jpeg_capture_from_held_bayer() {
    let (device, recorder) = open(fast_config());
    device
        .configure_streams(Some(&[
            StreamConfig::preview(PREVIEW, 1280, 720),
            StreamConfig::jpeg(JPEG, 4032, 3024),
        ]))
        .unwrap();
    let request = preview_request(1, Some(settings(&device))).with_output(JPEG, 1 << 32);
    device.process_capture_request(&request).unwrap();

    assert!(recorder.wait_until(common::WAIT, |r| r.is_closed(1) && r.buffers(1, JPEG).len() == 1));
    assert_eq!(recorder.shutters(1), 1);
    assert_eq!(recorder.ok_buffers(1, PREVIEW), 1);
    assert_eq!(recorder.ok_buffers(1, JPEG), 1);
    assert_eq!(recorder.errors(1, ErrorCode::Buffer), 0);
}

#[test]
fn zsl_input_is_reprocessed_to_jpeg() {
    let (device, recorder) = open(fast_config());
    let mut input = StreamConfig::output(ZSL_INPUT, PixelFormat::ImplementationDefined, 4032, 3024, USAGE_ZSL);
    input.stream_type = StreamType::Input;
    device
        .configure_streams(Some(&[
            StreamConfig::preview(PREVIEW, 1280, 720),
            StreamConfig::jpeg(JPEG, 4032, 3024),
            input,
        ]))
        .unwrap();

    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    let reprocess = CaptureRequest::new(2, None)
        .with_output(JPEG, 2 << 32)
        .with_input(ZSL_INPUT, 77);
    device.process_capture_request(&reprocess).unwrap();

    assert!(recorder.wait_closed([1, 2]));
    assert_eq!(recorder.shutters(2), 1);
    assert_eq!(recorder.final_results(2), 1);
    assert_eq!(recorder.ok_buffers(2, JPEG), 1);
}

/// Holds every frame of one stage until opened.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    fn pass(&self) {
        let open = self.open.lock().unwrap();
        let _open = self
            .opened
            .wait_timeout_while(open, Duration::from_secs(10), |open| !*open)
            .unwrap();
    }
}

struct GatedPipe {
    inner: SoftwarePipe,
    gate: Arc<Gate>,
}

impl Pipe for GatedPipe {
    fn pipe_id(&self) -> PipeId {
        self.inner.pipe_id()
    }

    fn process(&mut self, frame: &Frame) -> camera3_hal::Result<()> {
        self.gate.pass();
        self.inner.process(frame)
    }
}

fn gated_builder(gated: PipeId, gate: Arc<Gate>) -> PipeBuilder {
    let latency = Duration::from_millis(1);
    let fallback = software_pipes(latency, latency);
    Arc::new(move |id| {
        if id == gated {
            Box::new(GatedPipe {
                inner: SoftwarePipe::new(id, latency),
                gate: gate.clone(),
            }) as Box<dyn Pipe>
        } else {
            fallback(id)
        }
    })
}

fn blocking_config(budget_ms: u64) -> Config {
    let mut config = fast_config();
    config.request.min_block_request_count = 2;
    config.request.max_block_request_count = 4;
    config.request.max_block_wait_ms = Some(budget_ms);
    config
}

#[test]
fn admission_blocks_at_max_until_budget() {
    init_logging();
    let gate = Arc::new(Gate::default());
    let recorder = Recorder::new();
    let device = CameraDevice::with_pipe_builder(
        Arc::new(blocking_config(300)),
        recorder.clone(),
        gated_builder(PipeId::Mcsc, gate.clone()),
    );
    device
        .configure_streams(Some(&[StreamConfig::preview(PREVIEW, 640, 480)]))
        .unwrap();

    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    for n in 2..=4 {
        device.process_capture_request(&preview_request(n, None)).unwrap();
    }
    assert_eq!(device.stats().running_requests, 4);

    let started = Instant::now();
    device.process_capture_request(&preview_request(5, None)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    gate.open();
    assert!(recorder.wait_closed(1..=5));
    for n in 1..=5 {
        assert_eq!(recorder.ok_buffers(n, PREVIEW), 1, "request {n}");
    }
}

#[test]
fn admission_resumes_when_a_request_completes() {
    init_logging();
    let gate = Arc::new(Gate::default());
    let recorder = Recorder::new();
    let device = CameraDevice::with_pipe_builder(
        Arc::new(blocking_config(10_000)),
        recorder.clone(),
        gated_builder(PipeId::Mcsc, gate.clone()),
    );
    device
        .configure_streams(Some(&[StreamConfig::preview(PREVIEW, 640, 480)]))
        .unwrap();
    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    for n in 2..=4 {
        device.process_capture_request(&preview_request(n, None)).unwrap();
    }

    let opener = {
        let gate = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            gate.open();
        })
    };
    let started = Instant::now();
    device.process_capture_request(&preview_request(5, None)).unwrap();
    let waited = started.elapsed();
    opener.join().unwrap();

    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(5));
    assert!(recorder.wait_closed(1..=5));
}

#[test]
fn flush_closes_every_request_once() {
    let (device, recorder) = open(fast_config());
    device
        .configure_streams(Some(&[StreamConfig::preview(PREVIEW, 640, 480)]))
        .unwrap();
    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    for n in 2..=6 {
        device.process_capture_request(&preview_request(n, None)).unwrap();
    }
    device.flush().unwrap();

    for n in 1..=6 {
        let closes = recorder.final_results(n) + recorder.errors(n, ErrorCode::Request);
        assert_eq!(closes, 1, "request {n} closed {closes} times");
        assert_eq!(recorder.buffers(n, PREVIEW).len(), 1, "request {n}");
        assert!(recorder.error_buffers_announced(n, PREVIEW), "request {n}");
        assert!(recorder.shutters(n) <= 1);
    }
    assert_idle(&device);
    assert_eq!(device.state(), DeviceState::Flushing);

    // the next request restarts the pipelines
    device.process_capture_request(&preview_request(7, None)).unwrap();
    assert!(recorder.wait_closed([7]));
    assert_eq!(recorder.ok_buffers(7, PREVIEW), 1);
    assert_eq!(device.state(), DeviceState::Streaming);
}

#[test]
fn flush_during_jpeg_returns_one_result() {
    init_logging();
    let recorder = Recorder::new();
    let device = CameraDevice::with_pipe_builder(
        Arc::new(fast_config()),
        recorder.clone(),
        software_pipes(Duration::from_millis(1), Duration::from_millis(500)),
    );
    device
        .configure_streams(Some(&[
            StreamConfig::preview(PREVIEW, 1280, 720),
            StreamConfig::jpeg(JPEG, 4032, 3024),
        ]))
        .unwrap();
    let request = preview_request(1, Some(settings(&device))).with_output(JPEG, 1 << 32);
    device.process_capture_request(&request).unwrap();

    assert!(recorder.wait_until(common::WAIT, |r| r.buffers(1, PREVIEW).len() == 1));
    thread::sleep(Duration::from_millis(100));
    device.flush().unwrap();

    assert_eq!(recorder.final_results(1) + recorder.errors(1, ErrorCode::Request), 1);
    assert_eq!(recorder.buffers(1, JPEG).len(), 1);
    assert!(recorder.error_buffers_announced(1, JPEG));
    assert_eq!(recorder.shutters(1), 1);
    assert_idle(&device);
}

#[test]
fn flush_gives_every_request_a_terminal_result() {
    init_logging();
    let recorder = Recorder::new();
    let device = CameraDevice::with_pipe_builder(
        Arc::new(fast_config()),
        recorder.clone(),
        software_pipes(Duration::from_millis(2), Duration::from_millis(200)),
    );
    device
        .configure_streams(Some(&[
            StreamConfig::preview(PREVIEW, 1280, 720),
            StreamConfig::jpeg(JPEG, 4032, 3024),
        ]))
        .unwrap();
    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    for n in 2..=8 {
        let mut request = preview_request(n, None);
        if n % 3 == 0 {
            request = request.with_output(JPEG, (1 << 32) + u64::from(n));
        }
        device.process_capture_request(&request).unwrap();
    }
    assert!(recorder.wait_until(common::WAIT, |r| r.shutters(1) == 1));
    device.flush().unwrap();

    for n in 1..=8 {
        let closes = recorder.final_results(n) + recorder.errors(n, ErrorCode::Request);
        assert_eq!(closes, 1, "request {n} closed {closes} times");
        assert_eq!(recorder.buffers(n, PREVIEW).len(), 1, "request {n}");
        assert!(recorder.error_buffers_announced(n, PREVIEW), "request {n}");
        if n % 3 == 0 {
            assert_eq!(recorder.buffers(n, JPEG).len(), 1, "request {n}");
            assert!(recorder.error_buffers_announced(n, JPEG), "request {n}");
        }
        if recorder.final_results(n) == 1 {
            let shutter = recorder.position(n, |e| matches!(e, Event::Notify(NotifyMsg::Shutter { .. })));
            let final_result = recorder.position(n, |e| {
                matches!(e, Event::Result(r) if r.partial_result == camera3_hal::PARTIAL_RESULT_COUNT)
            });
            assert!(shutter.is_some() && shutter < final_result, "request {n}");
        } else {
            assert_eq!(recorder.shutters(n), 0, "request {n}");
        }
    }
    assert_idle(&device);
}

#[test]
fn stream_change_restarts_pipelines() {
    let (device, recorder) = open(fast_config());
    device
        .configure_streams(Some(&[StreamConfig::preview(PREVIEW, 640, 480)]))
        .unwrap();
    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    assert!(recorder.wait_closed([1]));
    let before = device.stats();
    assert_eq!(before.generation, 1);
    assert!(before.internal_frame_count > FRAME_INTERNAL_START_COUNT);

    device
        .configure_streams(Some(&[
            StreamConfig::preview(PREVIEW, 1280, 720),
            StreamConfig::jpeg(JPEG, 4032, 3024),
        ]))
        .unwrap();
    let after = device.stats();
    assert_eq!(after.generation, 2);
    assert_eq!(after.internal_frame_count, FRAME_INTERNAL_START_COUNT);
    assert!(after.tracked_frames.is_empty());

    // settings do not carry over a restart
    let err = device.process_capture_request(&preview_request(2, None)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    device
        .process_capture_request(&preview_request(2, Some(settings(&device))))
        .unwrap();
    assert!(recorder.wait_closed([2]));
    assert!(device.stats().tracked_frames.iter().all(|f| f.generation == 2));
}

#[test]
fn same_stream_set_keeps_pipelines() {
    let (device, recorder) = open(fast_config());
    let streams = [StreamConfig::preview(PREVIEW, 640, 480)];
    device.configure_streams(Some(&streams)).unwrap();
    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    assert!(recorder.wait_closed([1]));

    device.configure_streams(Some(&streams)).unwrap();
    assert_eq!(device.stats().generation, 1);
}

#[test]
fn rejected_calls() {
    let (device, recorder) = open(fast_config());
    let err = device
        .process_capture_request(&preview_request(1, Some(CameraMetadata::new())))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    assert_eq!(device.configure_streams(None).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(device.configure_streams(Some(&[])).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(
        device.construct_default_request_settings(42).unwrap_err().kind(),
        ErrorKind::NotFound
    );

    device
        .configure_streams(Some(&[StreamConfig::preview(PREVIEW, 640, 480)]))
        .unwrap();
    let unknown = CaptureRequest::new(1, Some(settings(&device))).with_output(5, 1);
    assert_eq!(
        device.process_capture_request(&unknown).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert!(recorder.events().is_empty());
}

#[test]
fn close_aborts_running_requests_and_is_idempotent() {
    let (device, recorder) = open(fast_config());
    device
        .configure_streams(Some(&[StreamConfig::preview(PREVIEW, 640, 480)]))
        .unwrap();
    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    device.close();
    device.close();

    assert!(recorder.is_closed(1));
    assert_eq!(recorder.buffers(1, PREVIEW).len(), 1);
    assert_eq!(device.state(), DeviceState::Destroyed);
    assert!(device.flush().is_err());
    assert!(device.process_capture_request(&preview_request(2, None)).is_err());
}

#[test]
fn internal_frames_fill_gaps_between_requests() {
    let (device, recorder) = open(fast_config());
    device
        .configure_streams(Some(&[StreamConfig::preview(PREVIEW, 640, 480)]))
        .unwrap();
    device
        .process_capture_request(&preview_request(1, Some(settings(&device))))
        .unwrap();
    assert!(recorder.wait_closed([1]));
    thread::sleep(Duration::from_millis(100));

    let stats = device.stats();
    assert!(stats.frames_created > 1);
    assert!(stats
        .tracked_frames
        .iter()
        .all(|f| f.frame_type == FrameType::Internal));
}
