//! Camera3 HAL demo: preview with periodic JPEG captures on software pipes

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camera3_hal::request::{
    BufferStatus, CameraMetadata, CaptureCallbacks, CaptureRequest, CaptureResult, NotifyMsg, StreamConfig,
};
use camera3_hal::{CameraDevice, Config};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PREVIEW_STREAM: i32 = 0;
const JPEG_STREAM: i32 = 1;
const REQUEST_BUDGET: u32 = 300;
/// Every n-th request also asks for a JPEG.
const CAPTURE_EVERY: u32 = 30;

enum Event {
    Notify(NotifyMsg),
    Result(CaptureResult),
}

/// Forwards every callback to the summary task.
struct ChannelCallbacks {
    tx: flume::Sender<Event>,
}

impl CaptureCallbacks for ChannelCallbacks {
    fn notify(&self, msg: NotifyMsg) {
        let _ = self.tx.send(Event::Notify(msg));
    }

    fn process_capture_result(&self, result: CaptureResult) {
        let _ = self.tx.send(Event::Result(result));
    }
}

#[derive(Debug, Default)]
struct Summary {
    shutters: u64,
    final_results: u64,
    buffers_ok: u64,
    buffers_failed: u64,
    errors: u64,
}

impl Summary {
    fn record(&mut self, event: Event) {
        match event {
            Event::Notify(NotifyMsg::Shutter { .. }) => self.shutters += 1,
            Event::Notify(NotifyMsg::Error {
                frame_number, code, ..
            }) => {
                warn!(frame_number, %code, "error notification");
                self.errors += 1;
            }
            Event::Result(result) => {
                if result.partial_result == camera3_hal::PARTIAL_RESULT_COUNT {
                    self.final_results += 1;
                }
                for buffer in &result.output_buffers {
                    match buffer.status {
                        BufferStatus::Ok => self.buffers_ok += 1,
                        BufferStatus::Error => self.buffers_failed += 1,
                    }
                }
            }
        }
    }
}

fn submit(device: &CameraDevice, settings: CameraMetadata, stop: &AtomicBool) -> camera3_hal::Result<u32> {
    let mut submitted = 0;
    for frame_number in 1..=REQUEST_BUDGET {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let repeat = (frame_number == 1).then(|| settings.clone());
        let mut request = CaptureRequest::new(frame_number, repeat).with_output(PREVIEW_STREAM, u64::from(frame_number));
        if frame_number % CAPTURE_EVERY == 0 {
            request = request.with_output(JPEG_STREAM, u64::from(frame_number) << 32);
        }
        device.process_capture_request(&request)?;
        submitted += 1;
    }
    Ok(submitted)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camera3_hal=debug")))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camera3-hal launching...");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    info!(?path, mode = ?config.pipeline.mode, "configuration loaded");
    camera3_hal::CONFIG.store(Arc::new(config));

    let (tx, rx) = flume::unbounded::<Event>();
    let device = Arc::new(CameraDevice::open_default(Arc::new(ChannelCallbacks { tx })));
    device.configure_streams(Some(&[
        StreamConfig::preview(PREVIEW_STREAM, 1920, 1080),
        StreamConfig::jpeg(JPEG_STREAM, 4032, 3024),
    ]))?;
    let settings = device.construct_default_request_settings(1)?;

    let summary = tokio::spawn(async move {
        let mut summary = Summary::default();
        while let Ok(event) = rx.recv_async().await {
            summary.record(event);
        }
        summary
    });

    let stop = Arc::new(AtomicBool::new(false));
    let ctrl_c = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, stopping requests");
                stop.store(true, Ordering::Release);
            }
        })
    };
    let requests = {
        let device = device.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || submit(&device, settings, &stop))
    };
    let submitted = requests.await??;
    ctrl_c.abort();

    device.flush()?;
    let stats = device.stats();
    info!(
        submitted,
        frames_created = stats.frames_created,
        generation = stats.generation,
        "requests done"
    );
    device.close();
    drop(device);

    let summary = summary.await?;
    info!(
        shutters = summary.shutters,
        final_results = summary.final_results,
        buffers_ok = summary.buffers_ok,
        buffers_failed = summary.buffers_failed,
        errors = summary.errors,
        "camera3-hal shutting down"
    );
    Ok(())
}
