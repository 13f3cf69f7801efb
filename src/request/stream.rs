//! Stream descriptors and configuration validation

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{HalError, Result};
use crate::frame::NodeId;
use crate::SensorConfig;

pub const USAGE_HW_TEXTURE: u64 = 0x100;
pub const USAGE_HW_COMPOSER: u64 = 0x800;
pub const USAGE_VIDEO_ENCODER: u64 = 0x10000;
/// Both camera read and write bits: a ZSL ring stream.
pub const USAGE_ZSL: u64 = 0x60000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Output,
    Input,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PixelFormat {
    ImplementationDefined,
    Ycbcr420888,
    Blob,
    Raw16,
    RawOpaque,
    Rgba8888,
}

/// What the HAL does with a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Preview,
    Video,
    Callback,
    Jpeg,
    Raw,
    ZslOutput,
    ZslInput,
}

impl StreamKind {
    /// MCSC/JPEG node that writes this stream, if it is not a bayer copy.
    pub fn node(self) -> Option<NodeId> {
        match self {
            StreamKind::Preview => Some(NodeId::McscPreview),
            StreamKind::Video => Some(NodeId::McscVideo),
            StreamKind::Callback => Some(NodeId::McscCallback),
            StreamKind::Jpeg => Some(NodeId::JpegMain),
            StreamKind::Raw | StreamKind::ZslOutput | StreamKind::ZslInput => None,
        }
    }

    /// Served by the reprocessing pipeline.
    pub fn is_capture(self) -> bool {
        self == StreamKind::Jpeg
    }

    /// Served by duplicating the preview frame's bayer buffer.
    pub fn is_bayer_copy(self) -> bool {
        matches!(self, StreamKind::Raw | StreamKind::ZslOutput)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: i32,
    pub stream_type: StreamType,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub usage: u64,
    pub max_buffers: u32,
}

impl StreamConfig {
    pub fn output(id: i32, format: PixelFormat, width: u32, height: u32, usage: u64) -> Self {
        Self {
            id,
            stream_type: StreamType::Output,
            format,
            width,
            height,
            usage,
            max_buffers: 0,
        }
    }

    pub fn preview(id: i32, width: u32, height: u32) -> Self {
        Self::output(id, PixelFormat::ImplementationDefined, width, height, USAGE_HW_TEXTURE | USAGE_HW_COMPOSER)
    }

    pub fn jpeg(id: i32, width: u32, height: u32) -> Self {
        Self::output(id, PixelFormat::Blob, width, height, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredStream {
    pub config: StreamConfig,
    pub kind: StreamKind,
}

impl ConfiguredStream {
    pub fn id(&self) -> i32 {
        self.config.id
    }
}

fn classify(config: &StreamConfig) -> Result<StreamKind> {
    if config.stream_type == StreamType::Input {
        return match config.format {
            PixelFormat::ImplementationDefined | PixelFormat::RawOpaque | PixelFormat::Ycbcr420888 => {
                Ok(StreamKind::ZslInput)
            }
            other => Err(HalError::invalid_argument(format!(
                "input stream {} has unsupported format {other:?}",
                config.id
            ))),
        };
    }
    match config.format {
        PixelFormat::Blob => Ok(StreamKind::Jpeg),
        PixelFormat::Raw16 => Ok(StreamKind::Raw),
        PixelFormat::RawOpaque => Ok(StreamKind::ZslOutput),
        PixelFormat::Ycbcr420888 => Ok(StreamKind::Callback),
        PixelFormat::ImplementationDefined => {
            if config.usage & USAGE_ZSL == USAGE_ZSL || config.stream_type == StreamType::Bidirectional {
                Ok(StreamKind::ZslOutput)
            } else if config.usage & USAGE_VIDEO_ENCODER != 0 {
                Ok(StreamKind::Video)
            } else {
                Ok(StreamKind::Preview)
            }
        }
        PixelFormat::Rgba8888 => Err(HalError::invalid_argument(format!(
            "stream {} has unsupported format {:?}",
            config.id, config.format
        ))),
    }
}

/// Validated stream configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSet {
    streams: Vec<ConfiguredStream>,
}

/// Shape of a configuration that decides whether pipelines can be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamSignature(Vec<(StreamKind, u32, u32)>);

impl StreamSet {
    /// Validate a `configure_streams` argument.
    pub fn validate(list: Option<&[StreamConfig]>, sensor: &SensorConfig) -> Result<Self> {
        let list = list.ok_or_else(|| HalError::invalid_argument("stream list is null"))?;
        if list.is_empty() {
            return Err(HalError::invalid_argument("stream list is empty"));
        }
        let inputs = list
            .iter()
            .filter(|s| s.stream_type != StreamType::Output)
            .count();
        if inputs > 1 {
            return Err(HalError::invalid_argument(format!("{inputs} input streams")));
        }

        let mut ids = HashSet::new();
        let mut kinds = HashSet::new();
        let mut streams = Vec::with_capacity(list.len());
        for config in list {
            if config.width == 0
                || config.height == 0
                || config.width > sensor.max_width
                || config.height > sensor.max_height
            {
                return Err(HalError::invalid_argument(format!(
                    "stream {} has unsupported size {}x{}",
                    config.id, config.width, config.height
                )));
            }
            if !ids.insert(config.id) {
                return Err(HalError::invalid_argument(format!("stream id {} repeated", config.id)));
            }
            let kind = classify(config)?;
            if !kinds.insert(kind) {
                return Err(HalError::invalid_argument(format!("second {kind:?} stream {}", config.id)));
            }
            streams.push(ConfiguredStream {
                config: config.clone(),
                kind,
            });
        }
        Ok(Self { streams })
    }

    pub fn streams(&self) -> &[ConfiguredStream] {
        &self.streams
    }

    pub fn find(&self, id: i32) -> Option<&ConfiguredStream> {
        self.streams.iter().find(|s| s.id() == id)
    }

    pub fn has(&self, kind: StreamKind) -> bool {
        self.streams.iter().any(|s| s.kind == kind)
    }

    pub fn by_kind(&self, kind: StreamKind) -> Option<&ConfiguredStream> {
        self.streams.iter().find(|s| s.kind == kind)
    }

    pub fn has_capture(&self) -> bool {
        self.streams.iter().any(|s| s.kind.is_capture())
    }

    pub fn has_input(&self) -> bool {
        self.streams
            .iter()
            .any(|s| s.config.stream_type != StreamType::Output)
    }

    pub fn signature(&self) -> StreamSignature {
        let mut shape: Vec<(StreamKind, u32, u32)> = self
            .streams
            .iter()
            .map(|s| (s.kind, s.config.width, s.config.height))
            .collect();
        shape.sort();
        StreamSignature(shape)
    }

    /// Largest output, used to size internal buffers.
    pub fn max_size(&self) -> (u32, u32) {
        self.streams
            .iter()
            .map(|s| (s.config.width, s.config.height))
            .max_by_key(|(w, h)| u64::from(*w) * u64::from(*h))
            .unwrap_or((0, 0))
    }
}
