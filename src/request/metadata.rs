//! Capture metadata, request templates and result conversion

use std::collections::BTreeMap;

use crate::error::{HalError, Result};
use crate::frame::Frame;
use crate::utils::Rect;
use crate::SensorConfig;

/// Reported `ANDROID_REQUEST_PIPELINE_DEPTH`.
pub const MAX_PIPELINE_DEPTH: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaTag {
    ControlCaptureIntent,
    ControlMode,
    ControlAeMode,
    ControlAeTargetFpsRange,
    ControlAfMode,
    ControlAwbMode,
    ControlEnableZsl,
    ScalerCropRegion,
    SensorExposureTime,
    SensorSensitivity,
    SensorFrameDuration,
    SensorTimestamp,
    JpegQuality,
    JpegThumbnailSize,
    JpegSize,
    StatisticsFaceDetectMode,
    StatisticsFaceCount,
    RequestFrameCount,
    RequestPipelineDepth,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    U8(u8),
    I32(i32),
    I64(i64),
    F32(f32),
    I32Pair(i32, i32),
    Rect(Rect),
}

/// Ordered tag/value store standing in for a `camera_metadata_t` blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraMetadata {
    entries: BTreeMap<MetaTag, MetaValue>,
}

impl CameraMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tag: MetaTag, value: MetaValue) -> &mut Self {
        self.entries.insert(tag, value);
        self
    }

    pub fn get(&self, tag: MetaTag) -> Option<&MetaValue> {
        self.entries.get(&tag)
    }

    pub fn get_i64(&self, tag: MetaTag) -> Option<i64> {
        match self.entries.get(&tag)? {
            MetaValue::U8(v) => Some(i64::from(*v)),
            MetaValue::I32(v) => Some(i64::from(*v)),
            MetaValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_rect(&self, tag: MetaTag) -> Option<Rect> {
        match self.entries.get(&tag)? {
            MetaValue::Rect(r) => Some(*r),
            _ => None,
        }
    }

    pub fn remove(&mut self, tag: MetaTag) -> Option<MetaValue> {
        self.entries.remove(&tag)
    }

    /// Copy every entry of `other` over this one.
    pub fn merge(&mut self, other: &CameraMetadata) {
        for (tag, value) in &other.entries {
            self.entries.insert(*tag, value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetaTag, &MetaValue)> {
        self.entries.iter()
    }
}

/// `CAMERA3_TEMPLATE_*` ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    Preview = 1,
    StillCapture = 2,
    VideoRecord = 3,
    VideoSnapshot = 4,
    ZeroShutterLag = 5,
    Manual = 6,
}

impl TryFrom<i32> for RequestTemplate {
    type Error = HalError;

    fn try_from(id: i32) -> Result<Self> {
        Ok(match id {
            1 => RequestTemplate::Preview,
            2 => RequestTemplate::StillCapture,
            3 => RequestTemplate::VideoRecord,
            4 => RequestTemplate::VideoSnapshot,
            5 => RequestTemplate::ZeroShutterLag,
            6 => RequestTemplate::Manual,
            _ => return Err(HalError::not_found(format!("unknown template id {id}"))),
        })
    }
}

/// Translates between request settings and result metadata.
#[derive(Debug, Clone)]
pub struct MetadataConverter {
    sensor: SensorConfig,
}

impl MetadataConverter {
    pub fn new(sensor: SensorConfig) -> Self {
        Self { sensor }
    }

    pub fn default_settings(&self, template: RequestTemplate) -> CameraMetadata {
        // ANDROID_CONTROL_CAPTURE_INTENT_* values line up with template ids
        let intent = template as u8;
        let (min_fps, max_fps) = match template {
            RequestTemplate::VideoRecord | RequestTemplate::VideoSnapshot => {
                (self.sensor.max_fps, self.sensor.max_fps)
            }
            _ => (self.sensor.min_fps, self.sensor.max_fps),
        };
        let mut meta = CameraMetadata::new();
        meta.set(MetaTag::ControlCaptureIntent, MetaValue::U8(intent))
            .set(
                MetaTag::ControlMode,
                MetaValue::U8(if template == RequestTemplate::Manual { 0 } else { 1 }),
            )
            .set(
                MetaTag::ControlAeMode,
                MetaValue::U8(if template == RequestTemplate::Manual { 0 } else { 1 }),
            )
            .set(
                MetaTag::ControlAeTargetFpsRange,
                MetaValue::I32Pair(min_fps as i32, max_fps as i32),
            )
            .set(
                MetaTag::ControlAfMode,
                MetaValue::U8(match template {
                    RequestTemplate::VideoRecord | RequestTemplate::VideoSnapshot => 3,
                    RequestTemplate::Manual => 0,
                    _ => 4,
                }),
            )
            .set(MetaTag::ControlAwbMode, MetaValue::U8(1))
            .set(
                MetaTag::ControlEnableZsl,
                MetaValue::U8(u8::from(template == RequestTemplate::ZeroShutterLag)),
            )
            .set(
                MetaTag::ScalerCropRegion,
                MetaValue::Rect(Rect::full(self.sensor.max_width, self.sensor.max_height)),
            )
            .set(
                MetaTag::SensorFrameDuration,
                MetaValue::I64(1_000_000_000 / i64::from(self.sensor.max_fps.max(1))),
            )
            .set(MetaTag::JpegQuality, MetaValue::U8(95))
            .set(MetaTag::StatisticsFaceDetectMode, MetaValue::U8(0));
        meta
    }

    /// Zoom crop requested by `settings`, clamped to the active array.
    pub fn crop_region(&self, settings: &CameraMetadata) -> Rect {
        let full = Rect::full(self.sensor.max_width, self.sensor.max_height);
        match settings.get_rect(MetaTag::ScalerCropRegion) {
            Some(r) if !r.is_empty() && r.x + r.width <= full.width && r.y + r.height <= full.height => r,
            _ => full,
        }
    }

    /// Result metadata sent at shutter time.
    pub fn partial_result(&self, settings: &CameraMetadata, timestamp_ns: u64) -> CameraMetadata {
        let mut meta = CameraMetadata::new();
        meta.set(MetaTag::SensorTimestamp, MetaValue::I64(timestamp_ns as i64));
        for tag in [MetaTag::ControlAeMode, MetaTag::ControlAfMode, MetaTag::ControlAwbMode] {
            if let Some(value) = settings.get(tag) {
                meta.set(tag, value.clone());
            }
        }
        meta
    }

    /// Final result: request settings overlaid with what the stages produced.
    pub fn final_result(&self, settings: &CameraMetadata, frame: Option<&Frame>) -> CameraMetadata {
        let mut meta = settings.clone();
        meta.set(MetaTag::RequestPipelineDepth, MetaValue::U8(MAX_PIPELINE_DEPTH));
        if let Some(frame) = frame {
            meta.merge(&frame.dynamic_metadata());
            meta.set(
                MetaTag::RequestFrameCount,
                MetaValue::I32(frame.frame_count() as i32),
            );
            meta.set(MetaTag::ScalerCropRegion, MetaValue::Rect(frame.crop()));
        }
        meta
    }
}
