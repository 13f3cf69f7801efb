pub mod manager;
pub mod metadata;
pub mod request;
pub mod stream;

pub use manager::RequestManager;
pub use metadata::{CameraMetadata, MetaTag, MetaValue, MetadataConverter, RequestTemplate};
pub use request::{
    BufferStatus, CaptureCallbacks, CaptureRequest, CaptureResult, ErrorCode, NotifyMsg,
    StreamBuffer, StreamBufferResult,
};
pub use stream::{
    ConfiguredStream, PixelFormat, StreamConfig, StreamKind, StreamSet, StreamType, USAGE_HW_COMPOSER,
    USAGE_HW_TEXTURE, USAGE_VIDEO_ENCODER, USAGE_ZSL,
};
