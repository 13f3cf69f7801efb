pub mod buffer;
pub mod engine;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod request;
pub mod selector;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use engine::{CameraDevice, DeviceState, DeviceStats};
pub use error::{ErrorKind, HalError, Result};
pub use pipeline::PipelineMode;

/// First frame count handed out after a pipeline (re)start.
pub const FRAME_INTERNAL_START_COUNT: u32 = 1;

/// Number of partial results per request: partial 1 at shutter, partial 2 is final.
pub const PARTIAL_RESULT_COUNT: u32 = 2;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// HAL configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor: SensorConfig,
    pub pipeline: PipelineConfig,
    pub buffers: BufferConfig,
    pub request: RequestConfig,
    pub selector: SelectorConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Cycles between latching control metadata and the sensor applying it.
    pub sensor_control_delay: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    pub max_width: u32,
    pub max_height: u32,
}

/// Which reprocessing bayer the dynamic-bayer selector keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BayerMode {
    /// Sensor output straight from FLITE
    Pure,
    /// 3AA-processed bayer
    Dirty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: PipelineMode,
    pub use_vra: bool,
    pub bayer_mode: BayerMode,
    /// Internal frames pushed when a factory starts.
    pub prepare_frame_count: u32,
    /// Upper bound of live preview frames before the scheduler stops seeding.
    pub max_in_flight_frames: usize,
    /// Service time of the software pipes.
    pub stage_latency_ms: u64,
    pub queue_timeout_ms: u64,
    pub teardown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub bayer_count: usize,
    pub three_aa_output_count: usize,
    pub isp_output_count: usize,
    pub vra_input_count: usize,
    pub reprocessing_yuv_count: usize,
    pub thumbnail_count: usize,
    pub plane_count: usize,
    pub wait_time_ms: u64,
    pub total_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub min_block_request_count: usize,
    pub max_block_request_count: usize,
    /// Admission wait budget; `None` means `min_block_request_count * 10` intervals.
    pub max_block_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub frame_hold_count: usize,
    pub select_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    pub stall_timeout_ms: u64,
    pub abort_on_fatal: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sensor_control_delay: 2,
            min_fps: 15,
            max_fps: 30,
            max_width: 4032,
            max_height: 3024,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::PreviewOtf,
            use_vra: true,
            bayer_mode: BayerMode::Pure,
            prepare_frame_count: 3,
            max_in_flight_frames: 12,
            stage_latency_ms: 2,
            queue_timeout_ms: 2000,
            teardown_timeout_ms: 200,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            bayer_count: 10,
            three_aa_output_count: 8,
            isp_output_count: 8,
            vra_input_count: 6,
            reprocessing_yuv_count: 2,
            thumbnail_count: 2,
            plane_count: 2,
            wait_time_ms: 10,
            total_wait_ms: 100,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            min_block_request_count: 3,
            max_block_request_count: 5,
            max_block_wait_ms: None,
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            frame_hold_count: 2,
            select_timeout_ms: 1000,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            stall_timeout_ms: 3000,
            abort_on_fatal: false,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `CAMERA3_HAL__*` environment overrides.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder
            .add_source(
                config::Environment::with_prefix("CAMERA3_HAL")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.queue_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.teardown_timeout_ms)
    }
}
