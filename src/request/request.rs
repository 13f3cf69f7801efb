//! Service requests, results and the callback surface back to the service

use std::fmt;

use super::metadata::CameraMetadata;

/// Service-owned buffer attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamBuffer {
    pub stream_id: i32,
    pub handle: u64,
    pub acquire_fence: Option<i32>,
}

impl StreamBuffer {
    pub fn new(stream_id: i32, handle: u64) -> Self {
        Self {
            stream_id,
            handle,
            acquire_fence: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub frame_number: u32,
    pub input_buffer: Option<StreamBuffer>,
    pub output_buffers: Vec<StreamBuffer>,
    /// `None` repeats the previous request's settings.
    pub settings: Option<CameraMetadata>,
}

impl CaptureRequest {
    pub fn new(frame_number: u32, settings: Option<CameraMetadata>) -> Self {
        Self {
            frame_number,
            input_buffer: None,
            output_buffers: Vec::new(),
            settings,
        }
    }

    pub fn with_output(mut self, stream_id: i32, handle: u64) -> Self {
        self.output_buffers.push(StreamBuffer::new(stream_id, handle));
        self
    }

    pub fn with_input(mut self, stream_id: i32, handle: u64) -> Self {
        self.input_buffer = Some(StreamBuffer::new(stream_id, handle));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBufferResult {
    pub stream_id: i32,
    pub handle: u64,
    pub status: BufferStatus,
    pub release_fence: Option<i32>,
}

impl StreamBufferResult {
    pub fn ok(buffer: StreamBuffer) -> Self {
        Self::with_status(buffer, BufferStatus::Ok)
    }

    pub fn error(buffer: StreamBuffer) -> Self {
        Self::with_status(buffer, BufferStatus::Error)
    }

    fn with_status(buffer: StreamBuffer, status: BufferStatus) -> Self {
        Self {
            stream_id: buffer.stream_id,
            handle: buffer.handle,
            status,
            release_fence: None,
        }
    }
}

/// `CAMERA3_MSG_ERROR_*` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Device,
    Request,
    Result,
    Buffer,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCode::Device => "ERROR_DEVICE",
            ErrorCode::Request => "ERROR_REQUEST",
            ErrorCode::Result => "ERROR_RESULT",
            ErrorCode::Buffer => "ERROR_BUFFER",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyMsg {
    Shutter {
        frame_number: u32,
        timestamp_ns: u64,
    },
    Error {
        frame_number: u32,
        stream_id: Option<i32>,
        code: ErrorCode,
    },
}

/// One `process_capture_result` call.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub frame_number: u32,
    pub metadata: Option<CameraMetadata>,
    /// 0 when the result carries no metadata.
    pub partial_result: u32,
    pub output_buffers: Vec<StreamBufferResult>,
    pub input_buffer: Option<StreamBufferResult>,
}

impl CaptureResult {
    pub fn buffers(frame_number: u32, output_buffers: Vec<StreamBufferResult>) -> Self {
        Self {
            frame_number,
            metadata: None,
            partial_result: 0,
            output_buffers,
            input_buffer: None,
        }
    }

    pub fn metadata(frame_number: u32, metadata: CameraMetadata, partial_result: u32) -> Self {
        Self {
            frame_number,
            metadata: Some(metadata),
            partial_result,
            output_buffers: Vec::new(),
            input_buffer: None,
        }
    }
}

/// Callbacks into the camera service. Calls are serialized by the result
/// sequencer and must not re-enter the device.
pub trait CaptureCallbacks: Send + Sync {
    fn notify(&self, msg: NotifyMsg);

    fn process_capture_result(&self, result: CaptureResult);
}
